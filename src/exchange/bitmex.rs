//! BitMEX realtime API
//!
//! `orderBook10` pushes the full top-10 book on every change, so books are
//! snapshot-only. Idle connections are probed with a literal `ping` text
//! frame and the server answers `pong`.

use serde::Deserialize;
use serde_json::{json, Value};

use super::{Decoder, ExchangeProtocol, Heartbeat};
use crate::config::FeedSettings;
use crate::error::{FeedError, Result};
use crate::parser::{
    checked_trade, decimal_from_value, levels_from_value, time_from_rfc3339, BookSnapshot, ControlEvent,
    SymbolTable, WireEvent,
};
use crate::types::{CurrencyPair, ExchangeVendor, FeedKind, TickData, TradeSide};

const BITMEX_WS_URL: &str = "wss://www.bitmex.com/realtime";

const BOOK_TABLE: &str = "orderBook10";
const TRADE_TABLE: &str = "trade";

/// BitMEX connection parameters
#[derive(Debug, Clone)]
pub struct BitmexProtocol {
    endpoint: String,
}

impl BitmexProtocol {
    pub fn new() -> Self {
        Self {
            endpoint: BITMEX_WS_URL.to_string(),
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
        let base = if pair.base == "BTC" { "XBT" } else { pair.base.as_str() };
        format!("{}{}", base, pair.quote)
    }

    fn table(kind: FeedKind) -> &'static str {
        match kind {
            FeedKind::Trade => TRADE_TABLE,
            FeedKind::Book => BOOK_TABLE,
        }
    }

    fn command(op: &str, pairs: &[CurrencyPair], kind: FeedKind) -> Vec<String> {
        if pairs.is_empty() {
            return Vec::new();
        }
        let args: Vec<String> = pairs
            .iter()
            .map(|p| format!("{}:{}", Self::table(kind), Self::symbol(p)))
            .collect();
        vec![json!({ "op": op, "args": args }).to_string()]
    }
}

impl Default for BitmexProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeProtocol for BitmexProtocol {
    fn vendor(&self) -> ExchangeVendor {
        ExchangeVendor::Bitmex
    }

    fn endpoint(&self, _pairs: &[CurrencyPair], _kind: FeedKind) -> String {
        self.endpoint.clone()
    }

    fn subscribe_commands(&self, pairs: &[CurrencyPair], kind: FeedKind) -> Vec<String> {
        Self::command("subscribe", pairs, kind)
    }

    fn unsubscribe_commands(&self, pairs: &[CurrencyPair], kind: FeedKind) -> Vec<String> {
        Self::command("unsubscribe", pairs, kind)
    }

    fn requires_ack(&self) -> bool {
        true
    }

    fn heartbeat(&self) -> Heartbeat {
        Heartbeat::Text("ping")
    }

    fn book_depth(&self) -> Option<usize> {
        Some(10)
    }

    fn decoder(&self, pairs: &[CurrencyPair], _kind: FeedKind) -> Box<dyn Decoder> {
        Box::new(BitmexDecoder {
            symbols: SymbolTable::new(pairs, Self::symbol),
        })
    }
}

/// Table push: `{"table": "...", "action": "partial|update|insert", "data": [...]}`
#[derive(Debug, Deserialize)]
struct TableFrame {
    table: String,
    data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawBook {
    symbol: String,
    bids: Value,
    asks: Value,
    timestamp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTrade {
    timestamp: String,
    symbol: String,
    side: String,
    size: Value,
    price: Value,
    #[serde(rename = "trdMatchID")]
    trd_match_id: String,
}

struct BitmexDecoder {
    symbols: SymbolTable,
}

impl BitmexDecoder {
    fn resolve(&self, symbol: &str) -> std::result::Result<CurrencyPair, String> {
        self.symbols
            .resolve(symbol)
            .ok_or_else(|| format!("unknown symbol {symbol}"))
    }

    /// `orderBook10:XBTUSD` -> pair
    fn resolve_topic(&self, topic: &str) -> Vec<CurrencyPair> {
        topic
            .split_once(':')
            .and_then(|(_, symbol)| self.symbols.resolve(symbol))
            .into_iter()
            .collect()
    }

    fn decode_control(&self, value: &Value) -> Option<ControlEvent> {
        if let Some(topic) = value.get("subscribe").and_then(Value::as_str) {
            return Some(if value.get("success").and_then(Value::as_bool) == Some(true) {
                ControlEvent::Subscribed(self.resolve_topic(topic))
            } else {
                ControlEvent::VendorError(format!("subscribe rejected: {topic}"))
            });
        }
        if let Some(topic) = value.get("unsubscribe").and_then(Value::as_str) {
            return Some(ControlEvent::Unsubscribed(self.resolve_topic(topic)));
        }
        if let Some(error) = value.get("error").and_then(Value::as_str) {
            return Some(ControlEvent::VendorError(error.to_string()));
        }
        value
            .get("info")
            .and_then(Value::as_str)
            .map(|info| ControlEvent::Info(info.to_string()))
    }

    fn decode_table(&self, frame: TableFrame) -> std::result::Result<Vec<WireEvent>, String> {
        match frame.table.as_str() {
            BOOK_TABLE => frame
                .data
                .into_iter()
                .map(|row| {
                    let book: RawBook = serde_json::from_value(row).map_err(|e| e.to_string())?;
                    Ok(WireEvent::Snapshot(BookSnapshot {
                        vendor: ExchangeVendor::Bitmex,
                        pair: self.resolve(&book.symbol)?,
                        bids: levels_from_value(&book.bids)?,
                        asks: levels_from_value(&book.asks)?,
                        sequence: None,
                        event_time: time_from_rfc3339(&book.timestamp)?,
                    }))
                })
                .collect(),
            TRADE_TABLE => frame
                .data
                .into_iter()
                .map(|row| {
                    let trade: RawTrade = serde_json::from_value(row).map_err(|e| e.to_string())?;
                    let side = match trade.side.as_str() {
                        "Buy" => Some(TradeSide::Buy),
                        "Sell" => Some(TradeSide::Sell),
                        _ => None,
                    };
                    let tick = checked_trade(TickData {
                        unique_id: trade.trd_match_id,
                        vendor: ExchangeVendor::Bitmex,
                        pair: self.resolve(&trade.symbol)?,
                        price: decimal_from_value(&trade.price)?,
                        quantity: decimal_from_value(&trade.size)?,
                        side,
                        event_time: time_from_rfc3339(&trade.timestamp)?,
                    })?;
                    Ok(WireEvent::Trade(tick))
                })
                .collect(),
            _ => Ok(Vec::new()),
        }
    }
}

impl Decoder for BitmexDecoder {
    fn decode(&mut self, raw: &str) -> Result<Vec<WireEvent>> {
        let bad = |reason: String| FeedError::malformed(ExchangeVendor::Bitmex, raw, reason);

        if raw.trim() == "pong" {
            return Ok(vec![WireEvent::Control(ControlEvent::Pong)]);
        }

        let value: Value = serde_json::from_str(raw).map_err(|e| bad(e.to_string()))?;
        if value.get("table").is_none() {
            return Ok(self
                .decode_control(&value)
                .map(WireEvent::Control)
                .into_iter()
                .collect());
        }

        let frame: TableFrame = serde_json::from_value(value).map_err(|e| bad(e.to_string()))?;
        self.decode_table(frame).map_err(bad)
    }
}
