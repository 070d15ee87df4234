//! Prometheus counters, registered on the default registry
//!
//! Served by the binary's `/metrics` endpoint.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};

pub static MESSAGES_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_messages_received_total",
        "raw messages received from vendors",
        &["vendor"]
    )
    .expect("metric can be registered")
});

pub static MALFORMED_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_malformed_messages_total",
        "messages the decoder could not interpret",
        &["vendor"]
    )
    .expect("metric can be registered")
});

pub static BOOK_RESYNCS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_book_resyncs_total",
        "books reset and resubscribed (labels: vendor, reason)",
        &["vendor", "reason"]
    )
    .expect("metric can be registered")
});

pub static RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_reconnects_total",
        "reconnect attempts after a failed session",
        &["vendor"]
    )
    .expect("metric can be registered")
});

pub static EVENTS_EMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_events_emitted_total",
        "normalized events handed to subscribers (labels: vendor, kind)",
        &["vendor", "kind"]
    )
    .expect("metric can be registered")
});
