//! Subscription and recovery manager
//!
//! Owns one connection for a set of pairs: subscribes, feeds decoded events
//! into the books, keeps the connection alive and recovers from both broken
//! pipes (reconnect with backoff, all books reset) and broken books (reset
//! and resubscribe that pair only).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use super::{Connector, Transport};
use crate::config::FeedSettings;
use crate::error::{FeedError, Result};
use crate::exchange::{ExchangeProtocol, Heartbeat};
use crate::metrics;
use crate::orderbook::OrderBookManager;
use crate::parser::{ControlEvent, WireEvent};
use crate::stream::FeedEvent;
use crate::types::{CurrencyPair, ExchangeVendor, FeedKind, OrderBook};

/// A single-pair resubscribe waiting for its ack
struct PairRetry {
    /// Ack timeouts so far
    attempts: u32,
    deadline: Instant,
    /// Waiting out the backoff before commands are sent again
    backing_off: bool,
}

/// Per-connection bookkeeping, dropped with the connection
struct Session {
    /// Pairs waiting for their initial subscribe ack, with their deadline
    pending_acks: HashMap<CurrencyPair, Instant>,
    /// Resubscribed pairs waiting for an ack; a timeout here retries that pair only
    resync_acks: HashMap<CurrencyPair, PairRetry>,
    /// Pairs reset and resubscribed, waiting for a fresh snapshot
    resyncing: HashSet<CurrencyPair>,
    idle_deadline: Instant,
    awaiting_pong: bool,
    confirmed: bool,
}

/// Outcome of handling one event
enum Flow {
    Continue,
    /// The subscriber dropped its stream
    Closed,
}

/// Supervises the transport -> decoder -> book pipeline for one connection
pub struct SubscriptionManager {
    protocol: Arc<dyn ExchangeProtocol>,
    connector: Arc<dyn Connector>,
    settings: FeedSettings,
    pairs: Vec<CurrencyPair>,
    kind: FeedKind,
    books: OrderBookManager,
    tx: mpsc::Sender<Result<FeedEvent>>,
    failures: u32,
}

impl SubscriptionManager {
    pub fn new(
        protocol: Arc<dyn ExchangeProtocol>,
        connector: Arc<dyn Connector>,
        settings: FeedSettings,
        pairs: Vec<CurrencyPair>,
        kind: FeedKind,
        tx: mpsc::Sender<Result<FeedEvent>>,
    ) -> Self {
        let max_depth = protocol.book_depth();
        let books = OrderBookManager::new(protocol.vendor(), &pairs, max_depth);
        Self {
            protocol,
            connector,
            settings,
            pairs,
            kind,
            books,
            tx,
            failures: 0,
        }
    }

    fn vendor(&self) -> ExchangeVendor {
        self.protocol.vendor()
    }

    fn pair_list(&self) -> String {
        join_pairs(self.pairs.iter())
    }

    /// Run until the subscriber goes away or retries are exhausted
    pub async fn run(mut self) {
        let vendor = self.vendor();
        info!(vendor = %vendor, pairs = %self.pair_list(), kind = self.kind.as_str(), "Starting subscription");

        let mut last_cause = String::new();

        loop {
            if self.failures > 0 {
                if !self.settings.reconnect.allows(self.failures) {
                    error!(
                        vendor = %vendor,
                        pairs = %self.pair_list(),
                        attempts = self.failures,
                        cause = %last_cause,
                        "Giving up on subscription"
                    );
                    let err = FeedError::RetriesExhausted {
                        vendor,
                        pairs: self.pair_list(),
                        attempts: self.failures,
                        last_cause,
                    };
                    let _ = self.tx.send(Err(err)).await;
                    return;
                }

                let delay = self.settings.reconnect.backoff(self.failures - 1);
                warn!(
                    vendor = %vendor,
                    attempt = self.failures,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting after error..."
                );
                metrics::RECONNECTS.with_label_values(&[vendor.as_str()]).inc();

                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = self.tx.closed() => return,
                }
            }

            // A new connection never inherits book state
            self.books.reset_all();

            match self.connect_and_process().await {
                Ok(()) => {
                    info!(vendor = %vendor, pairs = %self.pair_list(), "Subscriber gone, closing subscription");
                    return;
                }
                Err(e) => {
                    warn!(vendor = %vendor, error = %e, "Subscription session ended");
                    last_cause = e.to_string();
                    self.failures = self.failures.saturating_add(1);
                }
            }
        }
    }

    /// One connection lifetime. `Ok` means the subscriber went away.
    async fn connect_and_process(&mut self) -> Result<()> {
        let url = self.protocol.endpoint(&self.pairs, self.kind);
        let mut transport = self.connector.connect(&url).await?;

        let result = self.process(transport.as_mut()).await;
        transport.close().await;
        result
    }

    async fn process(&mut self, transport: &mut dyn Transport) -> Result<()> {
        let vendor = self.vendor();
        let mut decoder = self.protocol.decoder(&self.pairs, self.kind);

        for command in self.protocol.subscribe_commands(&self.pairs, self.kind) {
            transport.send(command).await?;
        }

        let now = Instant::now();
        let pending_acks = if self.protocol.requires_ack() {
            let deadline = now + self.settings.subscribe_timeout;
            self.pairs.iter().map(|p| (p.clone(), deadline)).collect()
        } else {
            HashMap::new()
        };
        let mut session = Session {
            pending_acks,
            resync_acks: HashMap::new(),
            resyncing: HashSet::new(),
            idle_deadline: now + self.settings.heartbeat_interval,
            awaiting_pong: false,
            confirmed: false,
        };
        self.check_confirmed(&mut session);

        loop {
            let ack_deadline = session.pending_acks.values().min().copied();
            let retry_deadline = session.resync_acks.values().map(|r| r.deadline).min();
            let deadline = [ack_deadline, retry_deadline]
                .into_iter()
                .flatten()
                .fold(session.idle_deadline, Instant::min);

            let received = tokio::select! {
                _ = self.tx.closed() => return Ok(()),
                received = timeout_at(deadline, transport.recv()) => received,
            };

            let text = match received {
                Ok(Ok(Some(text))) => {
                    self.mark_alive(&mut session);
                    text
                }
                // Control frame, answered by the transport
                Ok(Ok(None)) => {
                    self.mark_alive(&mut session);
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    self.on_deadline(transport, &mut session, ack_deadline).await?;
                    continue;
                }
            };

            metrics::MESSAGES_RECEIVED.with_label_values(&[vendor.as_str()]).inc();

            let events = match decoder.decode(&text) {
                Ok(events) => events,
                Err(e) => {
                    warn!(vendor = %vendor, error = %e, "Dropping malformed message");
                    metrics::MALFORMED_MESSAGES.with_label_values(&[vendor.as_str()]).inc();
                    continue;
                }
            };

            for event in events {
                if let Flow::Closed = self.handle_event(event, transport, &mut session).await? {
                    return Ok(());
                }
            }
        }
    }

    fn mark_alive(&self, session: &mut Session) {
        session.awaiting_pong = false;
        session.idle_deadline = Instant::now() + self.settings.heartbeat_interval;
    }

    /// An ack wait expired or the connection has been idle for a heartbeat interval
    async fn on_deadline(
        &self,
        transport: &mut dyn Transport,
        session: &mut Session,
        ack_deadline: Option<Instant>,
    ) -> Result<()> {
        let now = Instant::now();
        let vendor = self.vendor();

        if ack_deadline.is_some_and(|d| d <= now) {
            return Err(FeedError::SubscribeTimeout {
                vendor,
                pairs: join_pairs(session.pending_acks.keys()),
            });
        }

        self.retry_resyncs(transport, session, now).await?;

        if session.idle_deadline > now {
            return Ok(());
        }

        if session.awaiting_pong {
            return Err(FeedError::HeartbeatTimeout {
                vendor,
                idle_ms: 2 * self.settings.heartbeat_interval.as_millis() as u64,
            });
        }

        debug!(vendor = %vendor, "Connection idle, sending keepalive");
        match self.protocol.heartbeat() {
            Heartbeat::WsPing => transport.ping().await?,
            Heartbeat::Text(text) => transport.send(text.to_string()).await?,
        }
        session.awaiting_pong = true;
        session.idle_deadline = now + self.settings.heartbeat_interval;
        Ok(())
    }

    /// Resend due resubscribes, or back off after a missed ack.
    ///
    /// Only a pair that runs out of retries takes the connection down.
    async fn retry_resyncs(
        &self,
        transport: &mut dyn Transport,
        session: &mut Session,
        now: Instant,
    ) -> Result<()> {
        let vendor = self.vendor();
        let due: Vec<CurrencyPair> = session
            .resync_acks
            .iter()
            .filter(|(_, retry)| retry.deadline <= now)
            .map(|(pair, _)| pair.clone())
            .collect();

        for pair in due {
            let Some(retry) = session.resync_acks.get_mut(&pair) else {
                continue;
            };

            if retry.backing_off {
                debug!(vendor = %vendor, pair = %pair, attempt = retry.attempts, "Resending resubscribe");
                for command in self.protocol.resubscribe_commands(&pair, self.kind) {
                    transport.send(command).await?;
                }
                retry.backing_off = false;
                retry.deadline = now + self.settings.subscribe_timeout;
                continue;
            }

            retry.attempts = retry.attempts.saturating_add(1);
            if !self.settings.reconnect.allows(retry.attempts) {
                return Err(FeedError::SubscribeTimeout {
                    vendor,
                    pairs: pair.to_string(),
                });
            }
            let delay = self.settings.reconnect.backoff(retry.attempts - 1);
            warn!(
                vendor = %vendor,
                pair = %pair,
                attempt = retry.attempts,
                delay_ms = delay.as_millis() as u64,
                "No ack for resubscribe, retrying"
            );
            retry.backing_off = true;
            retry.deadline = now + delay;
        }
        Ok(())
    }

    async fn handle_event(
        &mut self,
        event: WireEvent,
        transport: &mut dyn Transport,
        session: &mut Session,
    ) -> Result<Flow> {
        let vendor = self.vendor();

        match event {
            WireEvent::Trade(tick) => {
                if self.kind == FeedKind::Trade {
                    return Ok(self.emit(FeedEvent::Trade(tick)).await);
                }
            }
            WireEvent::Snapshot(snapshot) if self.kind == FeedKind::Book => {
                if !self.books.has_pair(&snapshot.pair) {
                    debug!(vendor = %vendor, pair = %snapshot.pair, "Ignoring book for unsubscribed pair");
                    return Ok(Flow::Continue);
                }
                session.resyncing.remove(&snapshot.pair);
                session.resync_acks.remove(&snapshot.pair);
                let pair = snapshot.pair.clone();
                let applied = self.books.apply_snapshot(&snapshot);
                return self.after_book_update(applied, pair, transport, session).await;
            }
            WireEvent::Delta(delta) if self.kind == FeedKind::Book => {
                let pair = delta.pair.clone();
                let applied = self.books.apply_delta(&delta);
                return self.after_book_update(applied, pair, transport, session).await;
            }
            WireEvent::Snapshot(_) | WireEvent::Delta(_) => {}
            WireEvent::Control(control) => match control {
                ControlEvent::Subscribed(pairs) => {
                    for pair in &pairs {
                        session.pending_acks.remove(pair);
                        session.resync_acks.remove(pair);
                    }
                    debug!(vendor = %vendor, pairs = %join_pairs(pairs.iter()), "Subscribe acknowledged");
                    self.check_confirmed(session);
                }
                ControlEvent::Unsubscribed(pairs) => {
                    debug!(vendor = %vendor, pairs = %join_pairs(pairs.iter()), "Unsubscribe acknowledged");
                }
                ControlEvent::Heartbeat | ControlEvent::Pong => {}
                ControlEvent::Info(info) => {
                    debug!(vendor = %vendor, info = %info, "Vendor info");
                }
                ControlEvent::VendorError(reason) => {
                    warn!(vendor = %vendor, reason = %reason, "Vendor reported an error");
                }
                ControlEvent::ReconnectRequested => {
                    return Err(FeedError::WebSocketConnection(
                        "vendor requested reconnect".to_string(),
                    ));
                }
            },
        }

        Ok(Flow::Continue)
    }

    async fn after_book_update(
        &mut self,
        applied: Result<Option<Arc<OrderBook>>>,
        pair: CurrencyPair,
        transport: &mut dyn Transport,
        session: &mut Session,
    ) -> Result<Flow> {
        match applied {
            Ok(Some(book)) => Ok(self.emit(FeedEvent::Book(book)).await),
            Ok(None) => Ok(Flow::Continue),
            Err(e) if e.is_book_resync() => {
                self.resync(pair, &e, transport, session).await?;
                Ok(Flow::Continue)
            }
            Err(e) => Err(e),
        }
    }

    /// Reset one book and ask the vendor for a fresh snapshot
    async fn resync(
        &mut self,
        pair: CurrencyPair,
        cause: &FeedError,
        transport: &mut dyn Transport,
        session: &mut Session,
    ) -> Result<()> {
        let vendor = self.vendor();
        self.books.reset(&pair);

        if !session.resyncing.insert(pair.clone()) {
            debug!(vendor = %vendor, pair = %pair, "Snapshot already requested");
            return Ok(());
        }

        let reason = match cause {
            FeedError::OutOfOrderDelta { .. } => "out_of_order",
            _ => "desync",
        };
        warn!(vendor = %vendor, pair = %pair, error = %cause, "Book out of sync, resubscribing");
        metrics::BOOK_RESYNCS
            .with_label_values(&[vendor.as_str(), reason])
            .inc();

        for command in self.protocol.resubscribe_commands(&pair, self.kind) {
            transport.send(command).await?;
        }
        if self.protocol.requires_ack() {
            session.resync_acks.insert(
                pair,
                PairRetry {
                    attempts: 0,
                    deadline: Instant::now() + self.settings.subscribe_timeout,
                    backing_off: false,
                },
            );
        }
        Ok(())
    }

    /// All initial acks in: the connection counts as healthy again
    fn check_confirmed(&mut self, session: &mut Session) {
        if !session.confirmed && session.pending_acks.is_empty() {
            session.confirmed = true;
            self.failures = 0;
            info!(vendor = %self.vendor(), pairs = %self.pair_list(), "Subscription active");
        }
    }

    async fn emit(&self, event: FeedEvent) -> Flow {
        let kind = event.kind();
        if self.tx.send(Ok(event)).await.is_err() {
            return Flow::Closed;
        }
        metrics::EVENTS_EMITTED
            .with_label_values(&[self.vendor().as_str(), kind.as_str()])
            .inc();
        Flow::Continue
    }
}

fn join_pairs<'a>(pairs: impl Iterator<Item = &'a CurrencyPair>) -> String {
    pairs.map(ToString::to_string).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::exchange::BitstampProtocol;
    use crate::websocket::MockConnector;
    use std::time::Duration;

    #[tokio::test]
    async fn test_retries_exhausted_after_connect_failures() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(3)
            .returning(|_| Err(FeedError::WebSocketConnection("refused".to_string())));

        let settings = FeedSettings {
            reconnect: ReconnectPolicy {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                max_retries: 2,
            },
            ..FeedSettings::default()
        };
        let (tx, mut rx) = mpsc::channel(8);
        let manager = SubscriptionManager::new(
            Arc::new(BitstampProtocol::new()),
            Arc::new(connector),
            settings,
            vec![CurrencyPair::new("BTC", "USD")],
            FeedKind::Book,
            tx,
        );

        tokio::time::timeout(Duration::from_secs(5), manager.run())
            .await
            .unwrap();

        match rx.recv().await {
            Some(Err(FeedError::RetriesExhausted {
                vendor,
                attempts,
                last_cause,
                ..
            })) => {
                assert_eq!(vendor, ExchangeVendor::Bitstamp);
                assert_eq!(attempts, 3);
                assert!(last_cause.contains("refused"));
            }
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stops_when_subscriber_gone() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .returning(|_| Err(FeedError::WebSocketConnection("refused".to_string())));

        let settings = FeedSettings {
            reconnect: ReconnectPolicy {
                initial_backoff: Duration::from_secs(3600),
                max_backoff: Duration::from_secs(3600),
                max_retries: 0,
            },
            ..FeedSettings::default()
        };
        let (tx, rx) = mpsc::channel(8);
        let manager = SubscriptionManager::new(
            Arc::new(BitstampProtocol::new()),
            Arc::new(connector),
            settings,
            vec![CurrencyPair::new("BTC", "USD")],
            FeedKind::Trade,
            tx,
        );
        drop(rx);

        // Would otherwise sleep an hour before the second attempt
        tokio::time::timeout(Duration::from_secs(5), manager.run())
            .await
            .unwrap();
    }
}
