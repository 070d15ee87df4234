//! WebSocket transport and subscription lifecycle

mod client;
mod manager;

#[cfg(test)]
pub use client::MockConnector;
pub use client::{Connector, Transport, TungsteniteConnector, WsTransport};
pub use manager::SubscriptionManager;
