//! Vendor-agnostic market data types
//!
//! Everything handed to a subscriber is built from these values. They are
//! immutable once created; order books are shared behind `Arc`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Quote currencies recognised when splitting a concatenated symbol such as
/// `BTCUSDT` or `ethkrw`. Longer codes come first so `USDT` wins over `USD`.
const KNOWN_QUOTES: &[&str] = &[
    "USDSB", "USDT", "USDC", "TUSD", "USD", "KRW", "PAX", "BTC", "ETH", "JPY", "HT",
];

/// Vendor asset aliases normalised to their common code.
fn normalize_asset(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    match upper.as_str() {
        "XBT" => "BTC".to_string(),
        "XDG" => "DOGE".to_string(),
        _ => upper,
    }
}

/// Ordered (base, quote) asset pair, upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CurrencyPair {
    pub base: String,
    pub quote: String,
}

impl CurrencyPair {
    pub fn new(base: &str, quote: &str) -> Self {
        Self {
            base: normalize_asset(base),
            quote: normalize_asset(quote),
        }
    }

    /// Split a symbol with no separator, e.g. `BTCUSDT` or `btckrw`.
    pub fn from_concatenated(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_uppercase();
        KNOWN_QUOTES.iter().find_map(|quote| {
            upper
                .strip_suffix(quote)
                .filter(|base| !base.is_empty())
                .map(|base| CurrencyPair::new(base, quote))
        })
    }

    /// `base` + `quote` with no separator, upper-case.
    pub fn concat(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for CurrencyPair {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some((base, quote)) = trimmed.split_once(['/', '-', '_']) {
            if base.is_empty() || quote.is_empty() {
                return Err(FeedError::ConfigError(format!("invalid currency pair: {s}")));
            }
            return Ok(CurrencyPair::new(base, quote));
        }
        CurrencyPair::from_concatenated(trimmed)
            .ok_or_else(|| FeedError::ConfigError(format!("unknown currency pair: {s}")))
    }
}

/// Exchanges known to the normalizer. Only some have a decoder; the registry
/// reports the rest as unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeVendor {
    Upbit,
    Binance,
    HuobiGlobal,
    HuobiJapan,
    HuobiKorea,
    Okex,
    OkexKorea,
    Bithumb,
    Hubi,
    Bitmex,
    Kraken,
    Bitmax,
    Idax,
    Coineal,
    Poloniex,
    Bitstamp,
    Korbotex,
}

impl ExchangeVendor {
    pub const ALL: [ExchangeVendor; 17] = [
        ExchangeVendor::Upbit,
        ExchangeVendor::Binance,
        ExchangeVendor::HuobiGlobal,
        ExchangeVendor::HuobiJapan,
        ExchangeVendor::HuobiKorea,
        ExchangeVendor::Okex,
        ExchangeVendor::OkexKorea,
        ExchangeVendor::Bithumb,
        ExchangeVendor::Hubi,
        ExchangeVendor::Bitmex,
        ExchangeVendor::Kraken,
        ExchangeVendor::Bitmax,
        ExchangeVendor::Idax,
        ExchangeVendor::Coineal,
        ExchangeVendor::Poloniex,
        ExchangeVendor::Bitstamp,
        ExchangeVendor::Korbotex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeVendor::Upbit => "UPBIT",
            ExchangeVendor::Binance => "BINANCE",
            ExchangeVendor::HuobiGlobal => "HUOBI_GLOBAL",
            ExchangeVendor::HuobiJapan => "HUOBI_JAPAN",
            ExchangeVendor::HuobiKorea => "HUOBI_KOREA",
            ExchangeVendor::Okex => "OKEX",
            ExchangeVendor::OkexKorea => "OKEX_KOREA",
            ExchangeVendor::Bithumb => "BITHUMB",
            ExchangeVendor::Hubi => "HUBI",
            ExchangeVendor::Bitmex => "BITMEX",
            ExchangeVendor::Kraken => "KRAKEN",
            ExchangeVendor::Bitmax => "BITMAX",
            ExchangeVendor::Idax => "IDAX",
            ExchangeVendor::Coineal => "COINEAL",
            ExchangeVendor::Poloniex => "POLONIEX",
            ExchangeVendor::Bitstamp => "BITSTAMP",
            ExchangeVendor::Korbotex => "KORBOTEX",
        }
    }
}

impl fmt::Display for ExchangeVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeVendor {
    type Err = FeedError;

    /// Accepts `BINANCE`, `binance`, `huobi-global`, `HuobiGlobal`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        ExchangeVendor::ALL
            .iter()
            .copied()
            .find(|v| v.as_str().replace('_', "") == key)
            .ok_or_else(|| FeedError::UnsupportedVendor(s.to_string()))
    }
}

/// Which of the two canonical streams a subscription feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    Trade,
    Book,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Trade => "trade",
            FeedKind::Book => "book",
        }
    }
}

impl FromStr for FeedKind {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trade" | "trades" => Ok(FeedKind::Trade),
            "book" | "depth" | "orderbook" => Ok(FeedKind::Book),
            other => Err(FeedError::ConfigError(format!("unknown feed kind: {other}"))),
        }
    }
}

/// Aggressor side of a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

/// One executed trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickData {
    /// Vendor-derived identifier, unique per vendor and pair
    pub unique_id: String,
    pub vendor: ExchangeVendor,
    pub pair: CurrencyPair,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Aggressor side, when the vendor reports it
    pub side: Option<TradeSide>,
    pub event_time: DateTime<Utc>,
}

/// A single level in the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// Immutable order book view handed to subscribers.
///
/// Asks ascend by price, bids descend, no price repeats on a side, every
/// quantity is positive and the best ask is above the best bid. Only the
/// state machine in [`crate::orderbook`] constructs these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub vendor: ExchangeVendor,
    pub pair: CurrencyPair,
    /// Vendor sequence/version marker of the last applied message, if any
    pub sequence: Option<u64>,
    pub event_time: DateTime<Utc>,
    pub asks: Vec<PriceLevel>,
    pub bids: Vec<PriceLevel>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    /// Check every published-book invariant.
    pub fn is_consistent(&self) -> bool {
        let asks_sorted = self.asks.windows(2).all(|w| w[0].price < w[1].price);
        let bids_sorted = self.bids.windows(2).all(|w| w[0].price > w[1].price);
        let positive = self
            .asks
            .iter()
            .chain(self.bids.iter())
            .all(|l| l.quantity > Decimal::ZERO && l.price > Decimal::ZERO);
        let uncrossed = match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => ask.price > bid.price,
            _ => true,
        };
        asks_sorted && bids_sorted && positive && uncrossed
    }
}
