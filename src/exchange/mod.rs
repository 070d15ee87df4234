//! Vendor protocols
//!
//! Each vendor module supplies the connection parameters (endpoint, subscribe
//! commands, heartbeat style) and a [`Decoder`] that turns raw frames into
//! [`WireEvent`]s. Nothing here touches book state.

mod binance;
mod bitmex;
mod bitstamp;
mod kraken;

pub use binance::BinanceProtocol;
pub use bitmex::BitmexProtocol;
pub use bitstamp::BitstampProtocol;
pub use kraken::KrakenProtocol;

use crate::error::Result;
use crate::parser::WireEvent;
use crate::types::{CurrencyPair, ExchangeVendor, FeedKind};

/// How a vendor expects the client to probe an idle connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    /// WebSocket ping frame, answered by a pong frame
    WsPing,
    /// Application-level text message
    Text(&'static str),
}

/// Turns raw vendor messages into normalized events.
pub trait Decoder: Send {
    /// Decode one deframed message into zero or more events.
    ///
    /// Fails with `MalformedMessage` carrying the payload.
    fn decode(&mut self, raw: &str) -> Result<Vec<WireEvent>>;
}

/// Connection parameters and decoder factory for one vendor
pub trait ExchangeProtocol: Send + Sync {
    fn vendor(&self) -> ExchangeVendor;

    /// URL to open for a subscription
    fn endpoint(&self, pairs: &[CurrencyPair], kind: FeedKind) -> String;

    /// Text commands sent right after connecting
    fn subscribe_commands(&self, pairs: &[CurrencyPair], kind: FeedKind) -> Vec<String>;

    fn unsubscribe_commands(&self, pairs: &[CurrencyPair], kind: FeedKind) -> Vec<String>;

    /// Commands that make the vendor send a fresh snapshot for one pair
    fn resubscribe_commands(&self, pair: &CurrencyPair, kind: FeedKind) -> Vec<String> {
        let pairs = std::slice::from_ref(pair);
        let mut commands = self.unsubscribe_commands(pairs, kind);
        commands.extend(self.subscribe_commands(pairs, kind));
        commands
    }

    /// Whether the vendor acknowledges each subscribed pair
    fn requires_ack(&self) -> bool;

    fn heartbeat(&self) -> Heartbeat;

    /// Depth the vendor maintains for book subscriptions
    fn book_depth(&self) -> Option<usize>;

    fn decoder(&self, pairs: &[CurrencyPair], kind: FeedKind) -> Box<dyn Decoder>;

    /// Pairs sharing one connection before the client opens another
    fn max_pairs_per_connection(&self) -> usize {
        usize::MAX
    }
}

/// Smallest supported depth covering `requested`, or the largest supported one.
pub(crate) fn nearest_depth(supported: &[usize], requested: usize) -> usize {
    supported
        .iter()
        .copied()
        .find(|d| *d >= requested)
        .or_else(|| supported.last().copied())
        .unwrap_or(requested)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_depth() {
        let supported = [10, 25, 100, 500, 1000];
        assert_eq!(nearest_depth(&supported, 1), 10);
        assert_eq!(nearest_depth(&supported, 10), 10);
        assert_eq!(nearest_depth(&supported, 20), 25);
        assert_eq!(nearest_depth(&supported, 5000), 1000);
    }
}
