//! Exchange Feed - normalized realtime market data
//!
//! This crate connects to crypto exchange websocket APIs and republishes
//! their trades and order books as vendor-agnostic streams. Books are rebuilt
//! locally from snapshots and deltas and are never handed out crossed or
//! unsorted.

pub mod config;
pub mod error;
pub mod exchange;
pub mod metrics;
pub mod orderbook;
pub mod parser;
pub mod registry;
pub mod stream;
pub mod types;
pub mod websocket;

pub use config::{Config, FeedSettings, ReconnectPolicy};
pub use error::{FeedError, Result};
pub use exchange::{Decoder, ExchangeProtocol, Heartbeat};
pub use orderbook::{BookState, BookStateMachine, BookSummary, OrderBookManager};
pub use parser::{BookDelta, BookSide, BookSnapshot, ControlEvent, DeltaOp, WireEvent};
pub use registry::{ClientFactory, ClientRegistry};
pub use stream::{ExchangeWebsocketClient, FeedClient, FeedEvent, FeedItem, FeedStream};
pub use types::{
    CurrencyPair, ExchangeVendor, FeedKind, OrderBook, PriceLevel, TickData, TradeSide,
};
pub use websocket::{Connector, SubscriptionManager, Transport, TungsteniteConnector};
