//! Binance combined streams
//!
//! Subscriptions are encoded in the URL (`/stream?streams=a/b/c`), so there is
//! no subscribe command and no ack. Partial depth streams push a full top-N
//! book every 100ms, which makes this a snapshot-only vendor.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use super::{nearest_depth, Decoder, ExchangeProtocol, Heartbeat};
use crate::config::FeedSettings;
use crate::error::{FeedError, Result};
use crate::parser::{
    checked_trade, deserialize_decimal, deserialize_price_levels, time_from_millis, BookSnapshot, ControlEvent,
    SymbolTable, WireEvent,
};
use crate::types::{CurrencyPair, ExchangeVendor, FeedKind, PriceLevel, TickData, TradeSide};

const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/stream";

/// Partial book depths offered by `<symbol>@depth<N>`
const PARTIAL_DEPTHS: [usize; 3] = [5, 10, 20];

/// Binance caps a connection at 1024 streams
const MAX_STREAMS: usize = 1024;

/// Binance connection parameters
#[derive(Debug, Clone)]
pub struct BinanceProtocol {
    endpoint: String,
    depth: usize,
}

impl BinanceProtocol {
    pub fn new(depth: usize) -> Self {
        Self {
            endpoint: BINANCE_WS_URL.to_string(),
            depth: nearest_depth(&PARTIAL_DEPTHS, depth),
        }
    }

    pub fn from_settings(settings: &FeedSettings) -> Self {
        let protocol = Self::new(settings.book_depth);
        match &settings.endpoint {
            Some(url) => protocol.with_endpoint(url),
            None => protocol,
        }
    }

    /// Override the base URL (test servers, regional endpoints)
    pub fn with_endpoint(mut self, url: &str) -> Self {
        self.endpoint = url.trim_end_matches('/').to_string();
        self
    }

    fn symbol(pair: &CurrencyPair) -> String {
        pair.concat().to_lowercase()
    }

    fn stream_name(&self, pair: &CurrencyPair, kind: FeedKind) -> String {
        match kind {
            FeedKind::Trade => format!("{}@trade", Self::symbol(pair)),
            FeedKind::Book => format!("{}@depth{}@100ms", Self::symbol(pair), self.depth),
        }
    }
}

impl Default for BinanceProtocol {
    fn default() -> Self {
        Self::new(20)
    }
}

impl ExchangeProtocol for BinanceProtocol {
    fn vendor(&self) -> ExchangeVendor {
        ExchangeVendor::Binance
    }

    fn endpoint(&self, pairs: &[CurrencyPair], kind: FeedKind) -> String {
        let streams: Vec<String> = pairs.iter().map(|p| self.stream_name(p, kind)).collect();
        format!("{}?streams={}", self.endpoint, streams.join("/"))
    }

    fn subscribe_commands(&self, _pairs: &[CurrencyPair], _kind: FeedKind) -> Vec<String> {
        Vec::new()
    }

    fn unsubscribe_commands(&self, _pairs: &[CurrencyPair], _kind: FeedKind) -> Vec<String> {
        Vec::new()
    }

    fn requires_ack(&self) -> bool {
        false
    }

    fn heartbeat(&self) -> Heartbeat {
        Heartbeat::WsPing
    }

    fn book_depth(&self) -> Option<usize> {
        Some(self.depth)
    }

    fn decoder(&self, pairs: &[CurrencyPair], _kind: FeedKind) -> Box<dyn Decoder> {
        Box::new(BinanceDecoder {
            symbols: SymbolTable::new(pairs, Self::symbol),
        })
    }

    fn max_pairs_per_connection(&self) -> usize {
        MAX_STREAMS
    }
}

/// Combined stream wrapper: `{"stream": "...", "data": {...}}`
#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    stream: String,
    data: Value,
}

/// Raw trade event
#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "t")]
    trade_id: u64,
    #[serde(rename = "p", deserialize_with = "deserialize_decimal")]
    price: Decimal,
    #[serde(rename = "q", deserialize_with = "deserialize_decimal")]
    quantity: Decimal,
    #[serde(rename = "T")]
    trade_time: i64,
    /// Buyer is the maker, so the aggressor sold
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

/// Partial book depth event
#[derive(Debug, Deserialize)]
struct RawDepth {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    #[serde(deserialize_with = "deserialize_price_levels")]
    bids: Vec<PriceLevel>,
    #[serde(deserialize_with = "deserialize_price_levels")]
    asks: Vec<PriceLevel>,
}

struct BinanceDecoder {
    symbols: SymbolTable,
}

impl Decoder for BinanceDecoder {
    fn decode(&mut self, raw: &str) -> Result<Vec<WireEvent>> {
        let bad = |reason: String| FeedError::malformed(ExchangeVendor::Binance, raw, reason);

        let value: Value = serde_json::from_str(raw).map_err(|e| bad(e.to_string()))?;

        // Replies to method calls and error frames
        if value.get("result").is_some() {
            return Ok(vec![WireEvent::Control(ControlEvent::Info(raw.to_string()))]);
        }
        if let Some(msg) = value.get("msg").and_then(Value::as_str) {
            return Ok(vec![WireEvent::Control(ControlEvent::VendorError(msg.to_string()))]);
        }

        let envelope: StreamEnvelope = serde_json::from_value(value).map_err(|e| bad(e.to_string()))?;
        let (symbol, channel) = envelope
            .stream
            .split_once('@')
            .ok_or_else(|| bad(format!("unexpected stream name {}", envelope.stream)))?;
        let pair = self
            .symbols
            .resolve(symbol)
            .ok_or_else(|| bad(format!("unknown symbol {symbol}")))?;

        if channel == "trade" {
            let trade: RawTrade = serde_json::from_value(envelope.data).map_err(|e| bad(e.to_string()))?;
            let side = if trade.is_buyer_maker {
                TradeSide::Sell
            } else {
                TradeSide::Buy
            };
            let tick = checked_trade(TickData {
                unique_id: trade.trade_id.to_string(),
                vendor: ExchangeVendor::Binance,
                pair,
                price: trade.price,
                quantity: trade.quantity,
                side: Some(side),
                event_time: time_from_millis(trade.trade_time).map_err(bad)?,
            })
            .map_err(bad)?;
            return Ok(vec![WireEvent::Trade(tick)]);
        }

        if channel.starts_with("depth") {
            let depth: RawDepth = serde_json::from_value(envelope.data).map_err(|e| bad(e.to_string()))?;
            return Ok(vec![WireEvent::Snapshot(BookSnapshot {
                vendor: ExchangeVendor::Binance,
                pair,
                bids: depth.bids,
                asks: depth.asks,
                sequence: Some(depth.last_update_id),
                event_time: Utc::now(),
            })]);
        }

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pairs() -> Vec<CurrencyPair> {
        vec![CurrencyPair::new("BTC", "USDT"), CurrencyPair::new("ETH", "BTC")]
    }

    #[test]
    fn test_endpoint_lists_streams() {
        let protocol = BinanceProtocol::new(15);
        let url = protocol.endpoint(&pairs(), FeedKind::Book);
        assert_eq!(
            url,
            "wss://stream.binance.com:9443/stream?streams=btcusdt@depth20@100ms/ethbtc@depth20@100ms"
        );
        assert_eq!(protocol.book_depth(), Some(20));

        let url = protocol.endpoint(&pairs()[..1], FeedKind::Trade);
        assert!(url.ends_with("?streams=btcusdt@trade"));
    }

    #[test]
    fn test_decode_trade() {
        let raw = r#"{"stream":"btcusdt@trade","data":{"e":"trade","E":1672515782136,"s":"BTCUSDT","t":12345,"p":"16500.01000000","q":"0.00100000","b":88,"a":50,"T":1672515782134,"m":true,"M":true}}"#;
        let mut decoder = BinanceProtocol::default().decoder(&pairs(), FeedKind::Trade);
        let events = decoder.decode(raw).unwrap();

        match &events[..] {
            [WireEvent::Trade(tick)] => {
                assert_eq!(tick.pair, CurrencyPair::new("BTC", "USDT"));
                assert_eq!(tick.price, dec!(16500.01));
                assert_eq!(tick.quantity, dec!(0.001));
                assert_eq!(tick.side, Some(TradeSide::Sell));
                assert_eq!(tick.unique_id, "12345");
                assert_eq!(tick.event_time.timestamp_millis(), 1672515782134);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_decode_partial_depth() {
        let raw = r#"{"stream":"ethbtc@depth20@100ms","data":{"lastUpdateId":160,"bids":[["0.0024","10"],["0.0023","5"]],"asks":[["0.0026","100"]]}}"#;
        let mut decoder = BinanceProtocol::default().decoder(&pairs(), FeedKind::Book);
        let events = decoder.decode(raw).unwrap();

        match &events[..] {
            [WireEvent::Snapshot(snapshot)] => {
                assert_eq!(snapshot.pair, CurrencyPair::new("ETH", "BTC"));
                assert_eq!(snapshot.sequence, Some(160));
                assert_eq!(snapshot.bids.len(), 2);
                assert_eq!(snapshot.asks[0].price, dec!(0.0026));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_decode_control_and_garbage() {
        let mut decoder = BinanceProtocol::default().decoder(&pairs(), FeedKind::Trade);

        let events = decoder.decode(r#"{"result":null,"id":1}"#).unwrap();
        assert!(matches!(events[..], [WireEvent::Control(ControlEvent::Info(_))]));

        let events = decoder.decode(r#"{"code":2,"msg":"Invalid request"}"#).unwrap();
        assert!(matches!(events[..], [WireEvent::Control(ControlEvent::VendorError(_))]));

        let err = decoder.decode("not json").unwrap_err();
        assert!(matches!(err, FeedError::MalformedMessage { .. }));

        let err = decoder
            .decode(r#"{"stream":"btcusdt@trade","data":{"p":"1"}}"#)
            .unwrap_err();
        assert!(matches!(err, FeedError::MalformedMessage { .. }));
    }
}
