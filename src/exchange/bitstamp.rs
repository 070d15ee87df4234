//! Bitstamp websocket API v2
//!
//! `order_book_<pair>` pushes the top 100 levels of both sides on every
//! change, so books are snapshot-only. Every frame is
//! `{"event", "channel", "data"}`.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Decoder, ExchangeProtocol, Heartbeat};
use crate::config::FeedSettings;
use crate::error::{FeedError, Result};
use crate::parser::{
    checked_trade, decimal_from_value, levels_from_value, parse_decimal, time_from_micros, BookSnapshot,
    ControlEvent, SymbolTable, WireEvent,
};
use crate::types::{CurrencyPair, ExchangeVendor, FeedKind, TickData, TradeSide};

const BITSTAMP_WS_URL: &str = "wss://ws.bitstamp.net";

const BOOK_CHANNEL: &str = "order_book_";
const TRADE_CHANNEL: &str = "live_trades_";

/// Bitstamp connection parameters
#[derive(Debug, Clone)]
pub struct BitstampProtocol {
    endpoint: String,
}

impl BitstampProtocol {
    pub fn new() -> Self {
        Self {
            endpoint: BITSTAMP_WS_URL.to_string(),
        }
    }

    pub fn from_settings(settings: &FeedSettings) -> Self {
        match &settings.endpoint {
            Some(url) => Self::new().with_endpoint(url),
            None => Self::new(),
        }
    }

    pub fn with_endpoint(mut self, url: &str) -> Self {
        self.endpoint = url.to_string();
        self
    }

    fn symbol(pair: &CurrencyPair) -> String {
        pair.concat().to_lowercase()
    }

    fn channel(pair: &CurrencyPair, kind: FeedKind) -> String {
        let prefix = match kind {
            FeedKind::Trade => TRADE_CHANNEL,
            FeedKind::Book => BOOK_CHANNEL,
        };
        format!("{}{}", prefix, Self::symbol(pair))
    }

    fn commands(event: &str, pairs: &[CurrencyPair], kind: FeedKind) -> Vec<String> {
        pairs
            .iter()
            .map(|pair| {
                json!({
                    "event": event,
                    "data": { "channel": Self::channel(pair, kind) },
                })
                .to_string()
            })
            .collect()
    }
}

impl Default for BitstampProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeProtocol for BitstampProtocol {
    fn vendor(&self) -> ExchangeVendor {
        ExchangeVendor::Bitstamp
    }

    fn endpoint(&self, _pairs: &[CurrencyPair], _kind: FeedKind) -> String {
        self.endpoint.clone()
    }

    fn subscribe_commands(&self, pairs: &[CurrencyPair], kind: FeedKind) -> Vec<String> {
        Self::commands("bts:subscribe", pairs, kind)
    }

    fn unsubscribe_commands(&self, pairs: &[CurrencyPair], kind: FeedKind) -> Vec<String> {
        Self::commands("bts:unsubscribe", pairs, kind)
    }

    fn requires_ack(&self) -> bool {
        true
    }

    fn heartbeat(&self) -> Heartbeat {
        Heartbeat::Text(r#"{"event":"bts:heartbeat"}"#)
    }

    fn book_depth(&self) -> Option<usize> {
        Some(100)
    }

    fn decoder(&self, pairs: &[CurrencyPair], _kind: FeedKind) -> Box<dyn Decoder> {
        Box::new(BitstampDecoder {
            symbols: SymbolTable::new(pairs, Self::symbol),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct RawBook {
    microtimestamp: String,
    bids: Value,
    asks: Value,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    id: u64,
    amount: Value,
    amount_str: Option<String>,
    price: Value,
    price_str: Option<String>,
    /// 0 = buy, 1 = sell
    #[serde(rename = "type")]
    trade_type: u8,
    microtimestamp: String,
}

struct BitstampDecoder {
    symbols: SymbolTable,
}

impl BitstampDecoder {
    /// `order_book_btcusd` -> BTC/USD
    fn resolve(&self, channel: &str, prefix: &str) -> std::result::Result<CurrencyPair, String> {
        channel
            .strip_prefix(prefix)
            .and_then(|symbol| self.symbols.resolve(symbol))
            .ok_or_else(|| format!("unknown channel {channel}"))
    }

    fn subscribed_pairs(&self, channel: &str) -> Vec<CurrencyPair> {
        [BOOK_CHANNEL, TRADE_CHANNEL]
            .iter()
            .find_map(|prefix| self.resolve(channel, prefix).ok())
            .into_iter()
            .collect()
    }

    fn decode_frame(&self, frame: Frame) -> std::result::Result<Vec<WireEvent>, String> {
        let control = |event: ControlEvent| -> std::result::Result<Vec<WireEvent>, String> {
            Ok(vec![WireEvent::Control(event)])
        };

        match frame.event.as_str() {
            "bts:subscription_succeeded" => {
                control(ControlEvent::Subscribed(self.subscribed_pairs(&frame.channel)))
            }
            "bts:unsubscription_succeeded" => {
                control(ControlEvent::Unsubscribed(self.subscribed_pairs(&frame.channel)))
            }
            "bts:heartbeat" => control(ControlEvent::Pong),
            "bts:request_reconnect" => control(ControlEvent::ReconnectRequested),
            "bts:error" => control(ControlEvent::VendorError(
                frame
                    .data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            )),
            "data" if frame.channel.starts_with(BOOK_CHANNEL) => {
                let book: RawBook = serde_json::from_value(frame.data).map_err(|e| e.to_string())?;
                Ok(vec![WireEvent::Snapshot(BookSnapshot {
                    vendor: ExchangeVendor::Bitstamp,
                    pair: self.resolve(&frame.channel, BOOK_CHANNEL)?,
                    bids: levels_from_value(&book.bids)?,
                    asks: levels_from_value(&book.asks)?,
                    sequence: None,
                    event_time: micros(&book.microtimestamp)?,
                })])
            }
            "trade" if frame.channel.starts_with(TRADE_CHANNEL) => {
                let trade: RawTrade = serde_json::from_value(frame.data).map_err(|e| e.to_string())?;
                let side = match trade.trade_type {
                    0 => Some(TradeSide::Buy),
                    1 => Some(TradeSide::Sell),
                    _ => None,
                };
                let tick = checked_trade(TickData {
                    unique_id: trade.id.to_string(),
                    vendor: ExchangeVendor::Bitstamp,
                    pair: self.resolve(&frame.channel, TRADE_CHANNEL)?,
                    price: exact(trade.price_str.as_deref(), &trade.price)?,
                    quantity: exact(trade.amount_str.as_deref(), &trade.amount)?,
                    side,
                    event_time: micros(&trade.microtimestamp)?,
                })?;
                Ok(vec![WireEvent::Trade(tick)])
            }
            _ => Ok(Vec::new()),
        }
    }
}

impl Decoder for BitstampDecoder {
    fn decode(&mut self, raw: &str) -> Result<Vec<WireEvent>> {
        let bad = |reason: String| FeedError::malformed(ExchangeVendor::Bitstamp, raw, reason);
        let frame: Frame = serde_json::from_str(raw).map_err(|e| bad(e.to_string()))?;
        self.decode_frame(frame).map_err(bad)
    }
}

/// Prefer the `*_str` twin of a numeric field
fn exact(text: Option<&str>, number: &Value) -> std::result::Result<Decimal, String> {
    match text {
        Some(text) => parse_decimal(text),
        None => decimal_from_value(number),
    }
}

fn micros(raw: &str) -> std::result::Result<chrono::DateTime<chrono::Utc>, String> {
    let micros = raw
        .parse::<i64>()
        .map_err(|e| format!("invalid microtimestamp {raw:?}: {e}"))?;
    time_from_micros(micros)
}
