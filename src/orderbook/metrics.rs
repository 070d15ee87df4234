//! Book summary statistics for status reporting

use rust_decimal::Decimal;
use serde::Serialize;

use crate::types::OrderBook;

/// Derived figures for one published book
#[derive(Debug, Clone, Default, Serialize)]
pub struct BookSummary {
    /// Mid price (average of best bid and ask)
    pub mid_price: Option<Decimal>,

    /// Spread in basis points
    pub spread_bps: Option<Decimal>,

    /// Simple imbalance over the top levels: (bid_vol - ask_vol) / (bid_vol + ask_vol)
    pub imbalance: Option<Decimal>,

    /// Number of bid levels
    pub bid_levels: usize,

    /// Number of ask levels
    pub ask_levels: usize,
}

impl BookSummary {
    /// Summarize a book, using `levels` levels per side for the imbalance
    pub fn from_book(book: &OrderBook, levels: usize) -> Self {
        let best_bid = book.best_bid().map(|l| l.price);
        let best_ask = book.best_ask().map(|l| l.price);

        let mid_price = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => bid
                .checked_add(ask)
                .and_then(|sum| sum.checked_div(Decimal::from(2))),
            _ => None,
        };

        let spread_bps = match (best_bid, best_ask, mid_price) {
            (Some(bid), Some(ask), Some(mid)) if mid > Decimal::ZERO => ask
                .checked_sub(bid)
                .and_then(|spread| spread.checked_div(mid))
                .and_then(|ratio| ratio.checked_mul(Decimal::from(10000))),
            _ => None,
        };

        let bid_volume = checked_volume(book.bids.iter().take(levels).map(|l| l.quantity));
        let ask_volume = checked_volume(book.asks.iter().take(levels).map(|l| l.quantity));
        let imbalance = match (bid_volume, ask_volume) {
            (Some(bid), Some(ask)) => bid.checked_add(ask).and_then(|total| {
                (total > Decimal::ZERO)
                    .then(|| bid.checked_sub(ask).and_then(|diff| diff.checked_div(total)))
                    .flatten()
            }),
            _ => None,
        };

        Self {
            mid_price,
            spread_bps,
            imbalance,
            bid_levels: book.bids.len(),
            ask_levels: book.asks.len(),
        }
    }

    /// Check if the book has both sides
    pub fn is_healthy(&self) -> bool {
        self.mid_price.is_some() && self.bid_levels > 0 && self.ask_levels > 0
    }
}

/// Sum of quantities, `None` on overflow
fn checked_volume(mut quantities: impl Iterator<Item = Decimal>) -> Option<Decimal> {
    quantities.try_fold(Decimal::ZERO, |acc, q| acc.checked_add(q))
}
