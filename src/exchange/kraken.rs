//! Kraken public websocket (v1)
//!
//! Books are incremental: a subscription yields one `as`/`bs` snapshot per
//! pair followed by `a`/`b` level updates. Channel payloads are positional
//! arrays ending in `channelName, pair`; control traffic is JSON objects with
//! an `event` field.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{nearest_depth, Decoder, ExchangeProtocol, Heartbeat};
use crate::config::FeedSettings;
use crate::error::{FeedError, Result};
use crate::parser::{
    checked_trade, decimal_from_value, levels_from_value, time_from_epoch_secs, BookDelta, BookSide,
    BookSnapshot, ControlEvent, DeltaOp, SymbolTable, WireEvent,
};
use crate::types::{CurrencyPair, ExchangeVendor, FeedKind, PriceLevel, TickData, TradeSide};

const KRAKEN_WS_URL: &str = "wss://ws.kraken.com";

const BOOK_DEPTHS: [usize; 5] = [10, 25, 100, 500, 1000];

/// Kraken connection parameters
#[derive(Debug, Clone)]
pub struct KrakenProtocol {
    endpoint: String,
    depth: usize,
}

impl KrakenProtocol {
    pub fn new(depth: usize) -> Self {
        Self {
            endpoint: KRAKEN_WS_URL.to_string(),
            depth: nearest_depth(&BOOK_DEPTHS, depth),
        }
    }

    pub fn from_settings(settings: &FeedSettings) -> Self {
        let protocol = Self::new(settings.book_depth);
        match &settings.endpoint {
            Some(url) => protocol.with_endpoint(url),
            None => protocol,
        }
    }

    pub fn with_endpoint(mut self, url: &str) -> Self {
        self.endpoint = url.to_string();
        self
    }

    /// Kraken still names bitcoin and dogecoin by their legacy codes
    fn symbol(pair: &CurrencyPair) -> String {
        let asset = |code: &str| match code {
            "BTC" => "XBT".to_string(),
            "DOGE" => "XDG".to_string(),
            other => other.to_string(),
        };
        format!("{}/{}", asset(&pair.base), asset(&pair.quote))
    }

    fn command(&self, event: &str, pairs: &[CurrencyPair], kind: FeedKind) -> Vec<String> {
        if pairs.is_empty() {
            return Vec::new();
        }
        let symbols: Vec<String> = pairs.iter().map(Self::symbol).collect();
        let subscription = match kind {
            FeedKind::Trade => json!({ "name": "trade" }),
            FeedKind::Book => json!({ "name": "book", "depth": self.depth }),
        };
        vec![json!({
            "event": event,
            "pair": symbols,
            "subscription": subscription,
        })
        .to_string()]
    }
}

impl Default for KrakenProtocol {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ExchangeProtocol for KrakenProtocol {
    fn vendor(&self) -> ExchangeVendor {
        ExchangeVendor::Kraken
    }

    fn endpoint(&self, _pairs: &[CurrencyPair], _kind: FeedKind) -> String {
        self.endpoint.clone()
    }

    fn subscribe_commands(&self, pairs: &[CurrencyPair], kind: FeedKind) -> Vec<String> {
        self.command("subscribe", pairs, kind)
    }

    fn unsubscribe_commands(&self, pairs: &[CurrencyPair], kind: FeedKind) -> Vec<String> {
        self.command("unsubscribe", pairs, kind)
    }

    fn requires_ack(&self) -> bool {
        true
    }

    fn heartbeat(&self) -> Heartbeat {
        Heartbeat::Text(r#"{"event":"ping"}"#)
    }

    fn book_depth(&self) -> Option<usize> {
        Some(self.depth)
    }

    fn decoder(&self, pairs: &[CurrencyPair], _kind: FeedKind) -> Box<dyn Decoder> {
        Box::new(KrakenDecoder {
            symbols: SymbolTable::new(pairs, Self::symbol),
        })
    }
}

/// Control message (`subscriptionStatus`, `heartbeat`, `pong`, `systemStatus`)
#[derive(Debug, Deserialize)]
struct KrakenEvent {
    event: String,
    pair: Option<String>,
    status: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

struct KrakenDecoder {
    symbols: SymbolTable,
}

impl KrakenDecoder {
    fn decode_event(&self, event: KrakenEvent) -> ControlEvent {
        match event.event.as_str() {
            "heartbeat" => ControlEvent::Heartbeat,
            "pong" => ControlEvent::Pong,
            "subscriptionStatus" => {
                let pairs: Vec<CurrencyPair> = event
                    .pair
                    .as_deref()
                    .and_then(|symbol| self.symbols.resolve(symbol))
                    .into_iter()
                    .collect();
                match event.status.as_deref() {
                    Some("subscribed") => ControlEvent::Subscribed(pairs),
                    Some("unsubscribed") => ControlEvent::Unsubscribed(pairs),
                    _ => ControlEvent::VendorError(
                        event
                            .error_message
                            .unwrap_or_else(|| "subscription error".to_string()),
                    ),
                }
            }
            "systemStatus" => ControlEvent::Info(event.status.unwrap_or_default()),
            other => ControlEvent::Info(other.to_string()),
        }
    }

    fn decode_book(
        &self,
        pair: CurrencyPair,
        payloads: &[Value],
    ) -> std::result::Result<WireEvent, String> {
        let mut snapshot: Option<(Vec<PriceLevel>, Vec<PriceLevel>)> = None;
        let mut ops = Vec::new();
        let mut latest: Option<DateTime<Utc>> = None;

        for payload in payloads {
            let body = payload
                .as_object()
                .ok_or_else(|| format!("unexpected book payload {payload}"))?;

            if body.contains_key("as") || body.contains_key("bs") {
                let asks = match body.get("as") {
                    Some(rows) => parse_rows(rows, &mut latest)?,
                    None => Vec::new(),
                };
                let bids = match body.get("bs") {
                    Some(rows) => parse_rows(rows, &mut latest)?,
                    None => Vec::new(),
                };
                snapshot = Some((bids, asks));
                continue;
            }

            for (key, side) in [("a", BookSide::Ask), ("b", BookSide::Bid)] {
                if let Some(rows) = body.get(key) {
                    ops.extend(parse_rows(rows, &mut latest)?.into_iter().map(|level| DeltaOp {
                        side,
                        price: level.price,
                        quantity: level.quantity,
                    }));
                }
            }
        }

        let event_time = latest.unwrap_or_else(Utc::now);
        Ok(match snapshot {
            Some((bids, asks)) => WireEvent::Snapshot(BookSnapshot {
                vendor: ExchangeVendor::Kraken,
                pair,
                bids,
                asks,
                sequence: None,
                event_time,
            }),
            None => WireEvent::Delta(BookDelta {
                vendor: ExchangeVendor::Kraken,
                pair,
                ops,
                sequence: None,
                event_time,
            }),
        })
    }

    /// Trade rows: `[price, volume, time, side, orderType, misc]`
    fn decode_trades(
        &self,
        pair: CurrencyPair,
        payloads: &[Value],
    ) -> std::result::Result<Vec<WireEvent>, String> {
        let rows = payloads
            .first()
            .and_then(Value::as_array)
            .ok_or_else(|| "trade payload must be an array".to_string())?;

        rows.iter()
            .map(|row| {
                let cols = row
                    .as_array()
                    .filter(|cols| cols.len() >= 4)
                    .ok_or_else(|| format!("invalid trade row {row}"))?;
                let time = cols[2]
                    .as_str()
                    .ok_or_else(|| format!("invalid trade time {}", cols[2]))?;
                let side = match cols[3].as_str() {
                    Some("b") => Some(TradeSide::Buy),
                    Some("s") => Some(TradeSide::Sell),
                    _ => None,
                };
                let price = decimal_from_value(&cols[0])?;
                let quantity = decimal_from_value(&cols[1])?;
                let tick = checked_trade(TickData {
                    // Kraken v1 has no trade ids; time alone is not unique
                    unique_id: format!("{time}:{price}:{quantity}"),
                    vendor: ExchangeVendor::Kraken,
                    pair: pair.clone(),
                    price,
                    quantity,
                    side,
                    event_time: time_from_epoch_secs(time)?,
                })?;
                Ok(WireEvent::Trade(tick))
            })
            .collect()
    }

    fn decode_value(&self, value: Value) -> std::result::Result<Vec<WireEvent>, String> {
        if value.is_object() {
            let event: KrakenEvent = serde_json::from_value(value).map_err(|e| e.to_string())?;
            return Ok(vec![WireEvent::Control(self.decode_event(event))]);
        }

        let items = match value {
            Value::Array(items) if items.len() >= 4 => items,
            other => return Err(format!("unexpected message shape {other}")),
        };

        let n = items.len();
        let channel = items[n - 2].as_str().unwrap_or_default();
        let symbol = items[n - 1].as_str().unwrap_or_default();
        let pair = self
            .symbols
            .resolve(symbol)
            .ok_or_else(|| format!("unknown pair {symbol:?}"))?;
        let payloads = &items[1..n - 2];

        if channel.starts_with("book") {
            Ok(vec![self.decode_book(pair, payloads)?])
        } else if channel == "trade" {
            self.decode_trades(pair, payloads)
        } else {
            Ok(Vec::new())
        }
    }
}

impl Decoder for KrakenDecoder {
    fn decode(&mut self, raw: &str) -> Result<Vec<WireEvent>> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| FeedError::malformed(ExchangeVendor::Kraken, raw, e.to_string()))?;
        self.decode_value(value)
            .map_err(|reason| FeedError::malformed(ExchangeVendor::Kraken, raw, reason))
    }
}

/// Level rows `[price, volume, timestamp, ("r")]`, tracking the newest timestamp
fn parse_rows(
    rows: &Value,
    latest: &mut Option<DateTime<Utc>>,
) -> std::result::Result<Vec<PriceLevel>, String> {
    let levels = levels_from_value(rows)?;
    for time in rows
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|row| row.get(2).and_then(Value::as_str))
    {
        let time = time_from_epoch_secs(time)?;
        if latest.map_or(true, |t| time > t) {
            *latest = Some(time);
        }
    }
    Ok(levels)
}
