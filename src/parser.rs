//! Normalized internal events and shared wire parsing helpers
//!
//! Vendor decoders turn raw frames into [`WireEvent`]s using the helpers here.
//! Prices and quantities are always parsed into `Decimal` from their textual
//! form, never through `f64`.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::types::{CurrencyPair, ExchangeVendor, PriceLevel, TickData};

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

/// Full replacement of both sides of one book
#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub vendor: ExchangeVendor,
    pub pair: CurrencyPair,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub sequence: Option<u64>,
    pub event_time: DateTime<Utc>,
}

/// One level change; quantity zero removes the level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaOp {
    pub side: BookSide,
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Level changes applied atomically to the current book
#[derive(Debug, Clone)]
pub struct BookDelta {
    pub vendor: ExchangeVendor,
    pub pair: CurrencyPair,
    pub ops: Vec<DeltaOp>,
    pub sequence: Option<u64>,
    pub event_time: DateTime<Utc>,
}

/// Messages consumed by the subscription manager, never forwarded.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Subscribed(Vec<CurrencyPair>),
    Unsubscribed(Vec<CurrencyPair>),
    Heartbeat,
    Pong,
    Info(String),
    VendorError(String),
    /// The vendor asked the client to reconnect (maintenance, rebalancing)
    ReconnectRequested,
}

/// Decoded vendor message
#[derive(Debug, Clone)]
pub enum WireEvent {
    Trade(TickData),
    Snapshot(BookSnapshot),
    Delta(BookDelta),
    Control(ControlEvent),
}

/// Parse a decimal from its string form.
pub fn parse_decimal(raw: &str) -> Result<Decimal, String> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|e| format!("invalid decimal {raw:?}: {e}"))
}

/// Parse a decimal from a JSON string or number.
///
/// Numbers are re-read from their shortest textual representation so that
/// `9000.5` stays exactly `9000.5`.
pub fn decimal_from_value(value: &Value) -> Result<Decimal, String> {
    match value {
        Value::String(s) => parse_decimal(s),
        Value::Number(n) => parse_decimal(&n.to_string()),
        other => Err(format!("expected decimal, got {other}")),
    }
}

/// Parse `[[price, quantity, ...], ...]` into levels; extra columns are ignored.
pub fn levels_from_value(value: &Value) -> Result<Vec<PriceLevel>, String> {
    let rows = value
        .as_array()
        .ok_or_else(|| "price levels must be an array".to_string())?;
    rows.iter()
        .map(|row| match row.as_array() {
            Some(cols) if cols.len() >= 2 => checked_level(PriceLevel {
                price: decimal_from_value(&cols[0])?,
                quantity: decimal_from_value(&cols[1])?,
            }),
            _ => Err(format!("invalid price level: {row}")),
        })
        .collect()
}

/// Reject levels with a non-positive price or a negative quantity.
///
/// Quantity zero is kept: deltas use it to remove a level.
pub fn checked_level(level: PriceLevel) -> Result<PriceLevel, String> {
    if level.price <= Decimal::ZERO || level.quantity < Decimal::ZERO {
        return Err(format!(
            "invalid price level {} @ {}",
            level.quantity, level.price
        ));
    }
    Ok(level)
}

/// Reject trades without a positive price and quantity
pub fn checked_trade(tick: TickData) -> Result<TickData, String> {
    if tick.price <= Decimal::ZERO || tick.quantity <= Decimal::ZERO {
        return Err(format!("invalid trade {} @ {}", tick.quantity, tick.price));
    }
    Ok(tick)
}

/// Epoch seconds with a fractional part, e.g. `"1534614057.321597"`.
pub fn time_from_epoch_secs(raw: &str) -> Result<DateTime<Utc>, String> {
    let secs = parse_decimal(raw)?;
    let micros = secs
        .checked_mul(Decimal::from(1_000_000))
        .ok_or_else(|| format!("timestamp out of range: {raw}"))?
        .trunc()
        .to_i64()
        .ok_or_else(|| format!("invalid timestamp {raw:?}"))?;
    DateTime::from_timestamp_micros(micros).ok_or_else(|| format!("timestamp out of range: {raw}"))
}

pub fn time_from_millis(millis: i64) -> Result<DateTime<Utc>, String> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| format!("timestamp out of range: {millis}"))
}

pub fn time_from_micros(micros: i64) -> Result<DateTime<Utc>, String> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| format!("timestamp out of range: {micros}"))
}

pub fn time_from_rfc3339(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp {raw:?}: {e}"))
}

/// Maps vendor symbols back to the pairs a decoder was created for.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    by_symbol: HashMap<String, CurrencyPair>,
}

impl SymbolTable {
    /// Build the table from the subscribed pairs and the vendor's symbol format.
    pub fn new<F>(pairs: &[CurrencyPair], format: F) -> Self
    where
        F: Fn(&CurrencyPair) -> String,
    {
        let by_symbol = pairs
            .iter()
            .map(|p| (format(p).to_uppercase(), p.clone()))
            .collect();
        Self { by_symbol }
    }

    /// Case-insensitive lookup, falling back to splitting a concatenated symbol.
    pub fn resolve(&self, symbol: &str) -> Option<CurrencyPair> {
        self.by_symbol
            .get(&symbol.to_uppercase())
            .cloned()
            .or_else(|| CurrencyPair::from_concatenated(symbol))
    }
}

/// Custom deserializer for Decimal from string
pub fn deserialize_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_decimal(&s).map_err(serde::de::Error::custom)
}

/// Custom deserializer for price levels from array of string pairs
pub fn deserialize_price_levels<'de, D>(deserializer: D) -> Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("Invalid price level format"));
            }
            checked_level(PriceLevel {
                price: parse_decimal(&pair[0]).map_err(serde::de::Error::custom)?,
                quantity: parse_decimal(&pair[1]).map_err(serde::de::Error::custom)?,
            })
            .map_err(serde::de::Error::custom)
        })
        .collect()
}
