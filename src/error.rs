//! Error types for the feed normalizer

use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{CurrencyPair, ExchangeVendor};

/// Feed normalizer errors
#[derive(Error, Debug, Clone)]
pub enum FeedError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("{vendor}: malformed message ({reason}): {payload}")]
    MalformedMessage {
        vendor: ExchangeVendor,
        reason: String,
        payload: String,
    },

    #[error("{vendor}: no subscribe ack for [{pairs}] within timeout")]
    SubscribeTimeout {
        vendor: ExchangeVendor,
        pairs: String,
    },

    #[error("{vendor} {pair}: delta received before snapshot")]
    OutOfOrderDelta {
        vendor: ExchangeVendor,
        pair: CurrencyPair,
    },

    #[error("{vendor} {pair}: crossed book after update (best bid {best_bid} >= best ask {best_ask})")]
    DesyncDetected {
        vendor: ExchangeVendor,
        pair: CurrencyPair,
        best_bid: Decimal,
        best_ask: Decimal,
    },

    #[error("{vendor}: no message or pong within {idle_ms}ms")]
    HeartbeatTimeout { vendor: ExchangeVendor, idle_ms: u64 },

    #[error("unsupported vendor: {0}")]
    UnsupportedVendor(String),

    #[error("{vendor} [{pairs}]: gave up after {attempts} failed attempts, last cause: {last_cause}")]
    RetriesExhausted {
        vendor: ExchangeVendor,
        pairs: String,
        attempts: u32,
        last_cause: String,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl FeedError {
    /// Build a `MalformedMessage` keeping the raw payload for diagnostics.
    pub fn malformed(vendor: ExchangeVendor, payload: &str, reason: impl Into<String>) -> Self {
        FeedError::MalformedMessage {
            vendor,
            reason: reason.into(),
            payload: payload.to_string(),
        }
    }

    /// Protocol anomalies that are recovered by resubscribing a single book.
    pub fn is_book_resync(&self) -> bool {
        matches!(
            self,
            FeedError::OutOfOrderDelta { .. } | FeedError::DesyncDetected { .. }
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::WebSocketConnection(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;
