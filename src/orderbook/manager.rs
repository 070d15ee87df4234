//! Order book manager
//!
//! Owns the state machines for every pair of one subscription.

use std::collections::HashMap;
use std::sync::Arc;

use super::{BookState, BookStateMachine};
use crate::error::Result;
use crate::parser::{BookDelta, BookSnapshot};
use crate::types::{CurrencyPair, ExchangeVendor, OrderBook};

/// Book state machines keyed by pair, for a single vendor connection
#[derive(Debug)]
pub struct OrderBookManager {
    vendor: ExchangeVendor,
    books: HashMap<CurrencyPair, BookStateMachine>,
}

impl OrderBookManager {
    /// Create uninitialized books for the given pairs
    pub fn new(vendor: ExchangeVendor, pairs: &[CurrencyPair], max_depth: Option<usize>) -> Self {
        let books = pairs
            .iter()
            .map(|pair| {
                (
                    pair.clone(),
                    BookStateMachine::new(vendor, pair.clone(), max_depth),
                )
            })
            .collect();
        Self { vendor, books }
    }

    pub fn vendor(&self) -> ExchangeVendor {
        self.vendor
    }

    /// Apply a snapshot to its book. `Ok(None)` if the pair is not tracked here.
    pub fn apply_snapshot(&mut self, snapshot: &BookSnapshot) -> Result<Option<Arc<OrderBook>>> {
        match self.books.get_mut(&snapshot.pair) {
            Some(book) => book.apply_snapshot(snapshot).map(Some),
            None => Ok(None),
        }
    }

    /// Apply a delta to its book. `Ok(None)` if untracked or nothing changed.
    pub fn apply_delta(&mut self, delta: &BookDelta) -> Result<Option<Arc<OrderBook>>> {
        match self.books.get_mut(&delta.pair) {
            Some(book) => book.apply_delta(delta),
            None => Ok(None),
        }
    }

    /// Reset one book
    pub fn reset(&mut self, pair: &CurrencyPair) {
        if let Some(book) = self.books.get_mut(pair) {
            book.reset();
        }
    }

    /// Reset every book, e.g. after the connection dropped
    pub fn reset_all(&mut self) {
        self.books.values_mut().for_each(BookStateMachine::reset);
    }

    /// State of a tracked book
    pub fn state(&self, pair: &CurrencyPair) -> Option<BookState> {
        self.books.get(pair).map(|book| book.state())
    }

    /// Check if a pair is tracked
    pub fn has_pair(&self, pair: &CurrencyPair) -> bool {
        self.books.contains_key(pair)
    }
}
