//! Order book module
//!
//! Turns vendor snapshots and deltas into consistent, immutable book views.

mod book;
mod manager;
mod metrics;

pub use book::BookStateMachine;
pub use manager::OrderBookManager;
pub use metrics::BookSummary;

/// Lifecycle of a single book. Only `Ready` books are ever published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookState {
    Uninitialized,
    Ready,
}
