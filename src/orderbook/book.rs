//! Order book state machine for one (vendor, pair)
//!
//! Levels live in price-indexed `BTreeMap`s. Every accepted snapshot or delta
//! re-derives the sorted sides from the maps, checks the crossing invariant
//! and publishes a fresh immutable [`OrderBook`]. A book that fails the check
//! is never published; the machine drops back to `Uninitialized` instead.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use super::BookState;
use crate::error::{FeedError, Result};
use crate::parser::{BookDelta, BookSide, BookSnapshot, DeltaOp};
use crate::types::{CurrencyPair, ExchangeVendor, OrderBook, PriceLevel};

/// Mutable book state, owned by exactly one connection task
#[derive(Debug)]
pub struct BookStateMachine {
    vendor: ExchangeVendor,
    pair: CurrencyPair,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    state: BookState,
    /// Levels kept per side; `None` keeps everything the vendor sends
    max_depth: Option<usize>,
    /// Vendor sequence of the last applied message
    last_sequence: Option<u64>,
    /// Last published view
    current: Option<Arc<OrderBook>>,
}

impl BookStateMachine {
    /// Create an uninitialized book
    pub fn new(vendor: ExchangeVendor, pair: CurrencyPair, max_depth: Option<usize>) -> Self {
        Self {
            vendor,
            pair,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            state: BookState::Uninitialized,
            max_depth,
            last_sequence: None,
            current: None,
        }
    }

    pub fn pair(&self) -> &CurrencyPair {
        &self.pair
    }

    pub fn state(&self) -> BookState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == BookState::Ready
    }

    /// Last book handed out, if the machine is ready
    pub fn current(&self) -> Option<Arc<OrderBook>> {
        self.current.clone()
    }

    /// Replace both sides with the snapshot and publish the result.
    ///
    /// Levels without a positive price and quantity are dropped; an empty
    /// snapshot is a valid empty book. A snapshot that is itself crossed cannot be published, so it is
    /// reported as a desync and the machine stays uninitialized.
    pub fn apply_snapshot(&mut self, snapshot: &BookSnapshot) -> Result<Arc<OrderBook>> {
        self.bids.clear();
        self.asks.clear();

        for level in &snapshot.bids {
            if is_visible(level) {
                self.bids.insert(Reverse(level.price), level.quantity);
            }
        }

        for level in &snapshot.asks {
            if is_visible(level) {
                self.asks.insert(level.price, level.quantity);
            }
        }

        self.trim_depth();
        self.check_uncrossed()?;

        self.last_sequence = snapshot.sequence;
        self.state = BookState::Ready;
        let asks = self.ask_levels();
        let bids = self.bid_levels();
        Ok(self.publish(snapshot.event_time, asks, bids))
    }

    /// Apply a delta atomically.
    ///
    /// Returns `Ok(None)` when the delta is stale or leaves the visible book
    /// unchanged, e.g. removing a price that is not in the book.
    pub fn apply_delta(&mut self, delta: &BookDelta) -> Result<Option<Arc<OrderBook>>> {
        if self.state == BookState::Uninitialized {
            return Err(FeedError::OutOfOrderDelta {
                vendor: self.vendor,
                pair: self.pair.clone(),
            });
        }

        if let (Some(incoming), Some(last)) = (delta.sequence, self.last_sequence) {
            if incoming <= last {
                debug!(pair = %self.pair, incoming, last, "Skipping stale delta");
                return Ok(None);
            }
        }

        for op in &delta.ops {
            self.update_side(op);
        }
        self.trim_depth();
        self.check_uncrossed()?;

        if delta.sequence.is_some() {
            self.last_sequence = delta.sequence;
        }

        let asks = self.ask_levels();
        let bids = self.bid_levels();
        if let Some(current) = &self.current {
            if current.asks == asks && current.bids == bids {
                return Ok(None);
            }
        }

        Ok(Some(self.publish(delta.event_time, asks, bids)))
    }

    /// Discard all state and return to `Uninitialized`
    pub fn reset(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.state = BookState::Uninitialized;
        self.last_sequence = None;
        self.current = None;
    }

    /// Update a single price level
    fn update_side(&mut self, op: &DeltaOp) {
        if op.price <= Decimal::ZERO {
            debug!(pair = %self.pair, price = %op.price, "Ignoring level with non-positive price");
            return;
        }
        match op.side {
            BookSide::Bid => {
                if op.quantity <= Decimal::ZERO {
                    self.bids.remove(&Reverse(op.price));
                } else {
                    self.bids.insert(Reverse(op.price), op.quantity);
                }
            }
            BookSide::Ask => {
                if op.quantity <= Decimal::ZERO {
                    self.asks.remove(&op.price);
                } else {
                    self.asks.insert(op.price, op.quantity);
                }
            }
        }
    }

    /// Trim the book to max depth
    fn trim_depth(&mut self) {
        let Some(max_depth) = self.max_depth else {
            return;
        };
        while self.bids.len() > max_depth {
            self.bids.pop_last();
        }
        while self.asks.len() > max_depth {
            self.asks.pop_last();
        }
    }

    /// Reset and report a desync if best ask <= best bid
    fn check_uncrossed(&mut self) -> Result<()> {
        if let (Some(best_bid), Some(best_ask)) = (self.best_bid(), self.best_ask()) {
            if best_ask <= best_bid {
                self.reset();
                return Err(FeedError::DesyncDetected {
                    vendor: self.vendor,
                    pair: self.pair.clone(),
                    best_bid,
                    best_ask,
                });
            }
        }
        Ok(())
    }

    fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    fn bid_levels(&self) -> Vec<PriceLevel> {
        self.bids
            .iter()
            .map(|(Reverse(p), q)| PriceLevel::new(*p, *q))
            .collect()
    }

    fn ask_levels(&self) -> Vec<PriceLevel> {
        self.asks.iter().map(|(p, q)| PriceLevel::new(*p, *q)).collect()
    }

    fn publish(
        &mut self,
        event_time: DateTime<Utc>,
        asks: Vec<PriceLevel>,
        bids: Vec<PriceLevel>,
    ) -> Arc<OrderBook> {
        let book = Arc::new(OrderBook {
            vendor: self.vendor,
            pair: self.pair.clone(),
            sequence: self.last_sequence,
            event_time,
            asks,
            bids,
        });
        self.current = Some(book.clone());
        book
    }
}

fn is_visible(level: &PriceLevel) -> bool {
    level.price > Decimal::ZERO && level.quantity > Decimal::ZERO
}
