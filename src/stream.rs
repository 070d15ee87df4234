//! Public streaming API
//!
//! A client turns a set of pairs into a [`FeedStream`]: a cold stream that
//! spawns one subscription task per connection on first poll, merges their
//! output in arrival order and aborts them when dropped.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::FeedSettings;
use crate::error::Result;
use crate::exchange::ExchangeProtocol;
use crate::types::{CurrencyPair, ExchangeVendor, FeedKind, OrderBook, TickData};
use crate::websocket::{Connector, SubscriptionManager, TungsteniteConnector};

/// Normalized event produced by a subscription task
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Trade(TickData),
    Book(Arc<OrderBook>),
}

impl FeedEvent {
    pub fn kind(&self) -> FeedKind {
        match self {
            FeedEvent::Trade(_) => FeedKind::Trade,
            FeedEvent::Book(_) => FeedKind::Book,
        }
    }
}

/// Items a [`FeedStream`] can yield
pub trait FeedItem: Sized + Send + 'static {
    const KIND: FeedKind;

    fn from_event(event: FeedEvent) -> Option<Self>;
}

impl FeedItem for TickData {
    const KIND: FeedKind = FeedKind::Trade;

    fn from_event(event: FeedEvent) -> Option<Self> {
        match event {
            FeedEvent::Trade(tick) => Some(tick),
            FeedEvent::Book(_) => None,
        }
    }
}

impl FeedItem for Arc<OrderBook> {
    const KIND: FeedKind = FeedKind::Book;

    fn from_event(event: FeedEvent) -> Option<Self> {
        match event {
            FeedEvent::Book(book) => Some(book),
            FeedEvent::Trade(_) => None,
        }
    }
}

type Starter = Box<dyn FnOnce(mpsc::Sender<Result<FeedEvent>>) -> JoinSet<()> + Send>;

/// Continuous sequence of normalized values.
///
/// Nothing connects until the first poll. Dropping the stream aborts every
/// connection task, which closes their transports. An `Err` item is terminal:
/// retries were exhausted and the stream ends after yielding it.
pub struct FeedStream<T> {
    rx: mpsc::Receiver<Result<FeedEvent>>,
    tx: Option<mpsc::Sender<Result<FeedEvent>>>,
    starter: Option<Starter>,
    tasks: Option<JoinSet<()>>,
    done: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T: FeedItem> FeedStream<T> {
    /// `start` receives the sender shared by all tasks and spawns them
    pub fn new<F>(capacity: usize, start: F) -> Self
    where
        F: FnOnce(mpsc::Sender<Result<FeedEvent>>) -> JoinSet<()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            rx,
            tx: Some(tx),
            starter: Some(Box::new(start)),
            tasks: None,
            done: false,
            _item: PhantomData,
        }
    }

    /// Whether the connection tasks have been spawned
    pub fn is_started(&self) -> bool {
        self.starter.is_none()
    }

    fn finish(&mut self) {
        self.done = true;
        if let Some(mut tasks) = self.tasks.take() {
            tasks.abort_all();
        }
        self.rx.close();
    }
}

impl<T: FeedItem> Stream for FeedStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if let (Some(start), Some(tx)) = (this.starter.take(), this.tx.take()) {
            this.tasks = Some(start(tx));
        }

        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if let Some(item) = T::from_event(event) {
                        return Poll::Ready(Some(Ok(item)));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    this.finish();
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.finish();
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Capability shared by every vendor client
pub trait ExchangeWebsocketClient: Send + Sync {
    fn vendor(&self) -> ExchangeVendor;

    /// Trade ticks for the given pairs
    fn create_trade_websocket(&self, pairs: &[CurrencyPair]) -> FeedStream<TickData>;

    /// A full, consistent book on every snapshot or accepted delta
    fn create_depth_snapshot(&self, pairs: &[CurrencyPair]) -> FeedStream<Arc<OrderBook>>;
}

/// Vendor client composed from a protocol and a transport connector
#[derive(Clone)]
pub struct FeedClient {
    protocol: Arc<dyn ExchangeProtocol>,
    connector: Arc<dyn Connector>,
    settings: FeedSettings,
}

impl FeedClient {
    pub fn new(protocol: Arc<dyn ExchangeProtocol>, settings: FeedSettings) -> Self {
        Self::with_connector(protocol, Arc::new(TungsteniteConnector), settings)
    }

    pub fn with_connector(
        protocol: Arc<dyn ExchangeProtocol>,
        connector: Arc<dyn Connector>,
        settings: FeedSettings,
    ) -> Self {
        Self {
            protocol,
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &FeedSettings {
        &self.settings
    }

    fn open<T: FeedItem>(&self, pairs: &[CurrencyPair]) -> FeedStream<T> {
        let mut unique = pairs.to_vec();
        unique.sort();
        unique.dedup();

        let per_connection = self.protocol.max_pairs_per_connection().max(1);
        let groups: Vec<Vec<CurrencyPair>> = unique.chunks(per_connection).map(<[_]>::to_vec).collect();

        let protocol = self.protocol.clone();
        let connector = self.connector.clone();
        let settings = self.settings.clone();

        FeedStream::new(self.settings.channel_capacity, move |tx| {
            let mut tasks = JoinSet::new();
            for group in groups {
                let manager = SubscriptionManager::new(
                    protocol.clone(),
                    connector.clone(),
                    settings.clone(),
                    group,
                    T::KIND,
                    tx.clone(),
                );
                tasks.spawn(manager.run());
            }
            tasks
        })
    }
}

impl ExchangeWebsocketClient for FeedClient {
    fn vendor(&self) -> ExchangeVendor {
        self.protocol.vendor()
    }

    fn create_trade_websocket(&self, pairs: &[CurrencyPair]) -> FeedStream<TickData> {
        self.open(pairs)
    }

    fn create_depth_snapshot(&self, pairs: &[CurrencyPair]) -> FeedStream<Arc<OrderBook>> {
        self.open(pairs)
    }
}
