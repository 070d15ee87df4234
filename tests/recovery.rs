//! End-to-end pipeline tests driven through a scripted in-memory transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rust_decimal_macros::dec;
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;

use exchange_feed::exchange::{BinanceProtocol, BitmexProtocol, BitstampProtocol, KrakenProtocol};
use exchange_feed::{
    Connector, CurrencyPair, ExchangeProtocol, ExchangeVendor, ExchangeWebsocketClient, FeedClient,
    FeedError, FeedItem, FeedSettings, FeedStream, ReconnectPolicy, Result, Transport,
};

enum Inbound {
    Text(String),
    Disconnect,
}

/// Transport fed by the test; everything the client sends is recorded
struct ScriptedTransport {
    inbound: UnboundedReceiver<Inbound>,
    outbound: UnboundedSender<String>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.outbound
            .send(text)
            .map_err(|e| FeedError::WebSocketMessage(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        match self.inbound.recv().await {
            Some(Inbound::Text(text)) => Ok(Some(text)),
            Some(Inbound::Disconnect) | None => {
                Err(FeedError::WebSocketConnection("disconnected".to_string()))
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.send("<ws-ping>".to_string()).await
    }

    async fn close(&mut self) {}
}

/// The test's side of one scripted connection
struct Remote {
    inbound: UnboundedSender<Inbound>,
    sent: UnboundedReceiver<String>,
}

impl Remote {
    fn push(&self, text: impl Into<String>) {
        self.inbound.send(Inbound::Text(text.into())).unwrap();
    }

    fn disconnect(&self) {
        self.inbound.send(Inbound::Disconnect).unwrap();
    }

    async fn next_sent(&mut self) -> String {
        timeout(Duration::from_secs(5), self.sent.recv())
            .await
            .expect("nothing sent")
            .expect("transport dropped")
    }
}

fn scripted() -> (ScriptedTransport, Remote) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    (
        ScriptedTransport {
            inbound: inbound_rx,
            outbound: outbound_tx,
        },
        Remote {
            inbound: inbound_tx,
            sent: outbound_rx,
        },
    )
}

/// Hands out the scripted transports in order, then refuses
#[derive(Default)]
struct ScriptedConnector {
    sessions: Mutex<VecDeque<ScriptedTransport>>,
    urls: Mutex<Vec<String>>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    fn new(sessions: Vec<ScriptedTransport>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            ..Default::default()
        })
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        let next = self.sessions.lock().unwrap().pop_front();
        match next {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(FeedError::WebSocketConnection("connection refused".to_string())),
        }
    }
}

fn fast_settings() -> FeedSettings {
    FeedSettings {
        subscribe_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(5),
        reconnect: ReconnectPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            max_retries: 3,
        },
        ..FeedSettings::default()
    }
}

fn client(
    protocol: impl ExchangeProtocol + 'static,
    connector: &Arc<ScriptedConnector>,
    settings: FeedSettings,
) -> FeedClient {
    FeedClient::with_connector(Arc::new(protocol), connector.clone(), settings)
}

async fn next_item<T: FeedItem>(stream: &mut FeedStream<T>) -> Result<T> {
    timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("stream stalled")
        .expect("stream ended")
}

fn btc_usdt() -> CurrencyPair {
    CurrencyPair::new("BTC", "USDT")
}

fn kraken_status(status: &str) -> String {
    kraken_status_for("XBT/USDT", status)
}

fn kraken_status_for(symbol: &str, status: &str) -> String {
    json!({
        "channelID": 42,
        "channelName": "book-10",
        "event": "subscriptionStatus",
        "pair": symbol,
        "status": status,
        "subscription": { "depth": 10, "name": "book" }
    })
    .to_string()
}

fn kraken_rows(levels: &[(&str, &str)]) -> serde_json::Value {
    levels
        .iter()
        .map(|(price, qty)| json!([price, qty, "1534614248.123678"]))
        .collect()
}

fn kraken_snapshot(bids: &[(&str, &str)], asks: &[(&str, &str)]) -> String {
    kraken_snapshot_for("XBT/USDT", bids, asks)
}

fn kraken_snapshot_for(symbol: &str, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> String {
    json!([42, { "as": kraken_rows(asks), "bs": kraken_rows(bids) }, "book-10", symbol]).to_string()
}

fn kraken_update(side: &str, levels: &[(&str, &str)]) -> String {
    kraken_update_for("XBT/USDT", side, levels)
}

fn kraken_update_for(symbol: &str, side: &str, levels: &[(&str, &str)]) -> String {
    json!([42, { side: kraken_rows(levels) }, "book-10", symbol]).to_string()
}

#[tokio::test]
async fn test_trade_stream_yields_normalized_ticks() {
    let (transport, remote) = scripted();
    let connector = ScriptedConnector::new(vec![transport]);
    let client = client(BinanceProtocol::default(), &connector, fast_settings());
    assert_eq!(client.vendor(), ExchangeVendor::Binance);

    let mut stream = client.create_trade_websocket(&[btc_usdt()]);
    remote.push(
        r#"{"stream":"btcusdt@trade","data":{"e":"trade","E":1672515782136,"s":"BTCUSDT","t":12345,"p":"16500.01","q":"0.25","T":1672515782134,"m":false}}"#,
    );

    let tick = next_item(&mut stream).await.unwrap();
    assert!(tick.price > dec!(0));
    assert!(tick.quantity > dec!(0));
    assert_eq!(tick.pair, btc_usdt());
    assert_eq!(tick.vendor, ExchangeVendor::Binance);
    assert!(connector.urls()[0].ends_with("streams=btcusdt@trade"));
}

#[tokio::test]
async fn test_first_book_is_sorted_and_uncrossed() {
    let (transport, mut remote) = scripted();
    let connector = ScriptedConnector::new(vec![transport]);
    let client = client(KrakenProtocol::default(), &connector, fast_settings());

    let mut stream = client.create_depth_snapshot(&[btc_usdt()]);
    remote.push(kraken_status("subscribed"));
    remote.push(kraken_snapshot(
        &[("99.5", "2"), ("100", "1"), ("98", "4")],
        &[("102", "3"), ("101", "1"), ("101.5", "0")],
    ));

    let subscribe = remote.next_sent().await;
    assert!(subscribe.contains(r#""event":"subscribe""#));

    let book = next_item(&mut stream).await.unwrap();
    assert!(!book.asks.is_empty() && !book.bids.is_empty());
    assert!(book.asks[0].price > book.bids[0].price);
    assert!(book.asks[0].price < book.asks[1].price);
    assert!(book.bids[0].price > book.bids[1].price);
    assert_eq!(book.asks.len(), 2);
    assert_eq!(book.bids[0].price, dec!(100));
}

#[tokio::test]
async fn test_disconnect_resets_book_until_fresh_snapshot() {
    let (first, mut first_remote) = scripted();
    let (second, mut second_remote) = scripted();
    let connector = ScriptedConnector::new(vec![first, second]);
    let client = client(KrakenProtocol::default(), &connector, fast_settings());

    let mut stream = client.create_depth_snapshot(&[btc_usdt()]);
    first_remote.push(kraken_status("subscribed"));
    first_remote.push(kraken_snapshot(&[("100", "1")], &[("101", "1")]));

    let book = next_item(&mut stream).await.unwrap();
    assert_eq!(book.bids[0].price, dec!(100));
    assert!(first_remote.next_sent().await.contains("subscribe"));

    // The delta on the new connection predates any snapshot and must not be applied
    second_remote.push(kraken_status("subscribed"));
    second_remote.push(kraken_update("b", &[("100.5", "3")]));
    second_remote.push(kraken_status("unsubscribed"));
    second_remote.push(kraken_status("subscribed"));
    second_remote.push(kraken_snapshot(&[("200", "1")], &[("201", "1")]));
    first_remote.disconnect();

    let book = next_item(&mut stream).await.unwrap();
    assert_eq!(book.bids.len(), 1);
    assert_eq!(book.bids[0].price, dec!(200));
    assert_eq!(book.asks[0].price, dec!(201));
    assert_eq!(connector.connects(), 2);

    // Subscribe on connect, then unsubscribe + subscribe to request a snapshot
    assert!(second_remote.next_sent().await.contains(r#""event":"subscribe""#));
    assert!(second_remote.next_sent().await.contains(r#""event":"unsubscribe""#));
    assert!(second_remote.next_sent().await.contains(r#""event":"subscribe""#));
}

#[tokio::test]
async fn test_removing_absent_level_emits_nothing() {
    let (transport, mut remote) = scripted();
    let connector = ScriptedConnector::new(vec![transport]);
    let client = client(KrakenProtocol::default(), &connector, fast_settings());

    let mut stream = client.create_depth_snapshot(&[btc_usdt()]);
    remote.push(kraken_status("subscribed"));
    remote.push(kraken_snapshot(&[("100", "1")], &[("101", "1")]));
    remote.push(kraken_update("a", &[("150", "0")]));
    remote.push(kraken_update("a", &[("101", "7")]));

    let first = next_item(&mut stream).await.unwrap();
    assert_eq!(first.asks[0].quantity, dec!(1));

    // The next book is the one from the quantity change, not the no-op removal
    let second = next_item(&mut stream).await.unwrap();
    assert_eq!(second.asks.len(), 1);
    assert_eq!(second.asks[0].quantity, dec!(7));
    assert_eq!(second.bids, first.bids);

    // No resync was requested
    assert!(remote.next_sent().await.contains("subscribe"));
    assert!(remote.sent.try_recv().is_err());
}

#[tokio::test]
async fn test_crossing_delta_triggers_resubscribe() {
    let (transport, mut remote) = scripted();
    let connector = ScriptedConnector::new(vec![transport]);
    let client = client(KrakenProtocol::default(), &connector, fast_settings());

    let mut stream = client.create_depth_snapshot(&[btc_usdt()]);
    remote.push(kraken_status("subscribed"));
    remote.push(kraken_snapshot(&[("100", "1")], &[("101", "1")]));
    remote.push(kraken_update("b", &[("102", "1")]));
    remote.push(kraken_update("a", &[("101", "9")]));
    remote.push(kraken_status("subscribed"));
    remote.push(kraken_snapshot(&[("99", "1")], &[("103", "1")]));

    let first = next_item(&mut stream).await.unwrap();
    assert_eq!(first.bids[0].price, dec!(100));

    let second = next_item(&mut stream).await.unwrap();
    assert!(second.asks[0].price > second.bids[0].price);
    assert_eq!(second.bids[0].price, dec!(99));
    assert_eq!(second.asks[0].price, dec!(103));

    assert!(remote.next_sent().await.contains(r#""event":"subscribe""#));
    assert!(remote.next_sent().await.contains(r#""event":"unsubscribe""#));
    assert!(remote.next_sent().await.contains(r#""event":"subscribe""#));
    // Deltas during the resync do not request another snapshot
    assert!(remote.sent.try_recv().is_err());
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_resync_leaves_other_pairs_on_connection_alone() {
    let (transport, mut remote) = scripted();
    let connector = ScriptedConnector::new(vec![transport]);
    let settings = FeedSettings {
        subscribe_timeout: Duration::from_millis(50),
        reconnect: ReconnectPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
            max_retries: 5,
        },
        ..fast_settings()
    };
    let client = client(KrakenProtocol::default(), &connector, settings);

    let eth_usdt = CurrencyPair::new("ETH", "USDT");
    let mut stream = client.create_depth_snapshot(&[btc_usdt(), eth_usdt.clone()]);
    remote.push(kraken_status_for("XBT/USDT", "subscribed"));
    remote.push(kraken_status_for("ETH/USDT", "subscribed"));
    remote.push(kraken_snapshot(&[("100", "1")], &[("101", "1")]));
    remote.push(kraken_snapshot_for("ETH/USDT", &[("10", "1")], &[("11", "1")]));

    assert_eq!(next_item(&mut stream).await.unwrap().pair, btc_usdt());
    assert_eq!(next_item(&mut stream).await.unwrap().pair, eth_usdt);

    // BTC crosses and is resubscribed; the vendor never acks it
    remote.push(kraken_update("b", &[("102", "1")]));
    assert!(remote.next_sent().await.contains(r#""event":"subscribe""#));
    assert!(remote.next_sent().await.contains(r#""event":"unsubscribe""#));
    assert!(remote.next_sent().await.contains(r#""event":"subscribe""#));

    // Let the resubscribe ack wait expire once
    tokio::time::sleep(Duration::from_millis(80)).await;
    remote.push(kraken_update_for("ETH/USDT", "a", &[("11", "5")]));

    let eth = next_item(&mut stream).await.unwrap();
    assert_eq!(eth.pair, eth_usdt);
    assert_eq!(eth.bids[0].price, dec!(10));
    assert_eq!(eth.asks[0].quantity, dec!(5));
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_unacked_resubscribe_is_retried_on_same_connection() {
    let (transport, mut remote) = scripted();
    let connector = ScriptedConnector::new(vec![transport]);
    let settings = FeedSettings {
        subscribe_timeout: Duration::from_millis(50),
        reconnect: ReconnectPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
            max_retries: 20,
        },
        ..fast_settings()
    };
    let client = client(KrakenProtocol::default(), &connector, settings);

    let mut stream = client.create_depth_snapshot(&[btc_usdt()]);
    remote.push(kraken_status("subscribed"));
    remote.push(kraken_snapshot(&[("100", "1")], &[("101", "1")]));
    assert_eq!(next_item(&mut stream).await.unwrap().bids[0].price, dec!(100));

    remote.push(kraken_update("b", &[("102", "1")]));
    assert!(remote.next_sent().await.contains(r#""event":"subscribe""#));
    // First request, then the retry after the ack wait expired
    for _ in 0..2 {
        assert!(remote.next_sent().await.contains(r#""event":"unsubscribe""#));
        assert!(remote.next_sent().await.contains(r#""event":"subscribe""#));
    }

    remote.push(kraken_status("subscribed"));
    remote.push(kraken_snapshot(&[("99", "1")], &[("103", "1")]));

    let book = next_item(&mut stream).await.unwrap();
    assert_eq!(book.bids[0].price, dec!(99));
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_overflowing_timestamp_does_not_end_stream() {
    let (transport, remote) = scripted();
    let connector = ScriptedConnector::new(vec![transport]);
    let client = client(KrakenProtocol::default(), &connector, fast_settings());

    let mut stream = client.create_trade_websocket(&[btc_usdt()]);
    remote.push(kraken_status("subscribed"));
    remote.push(
        json!([0, [["5541.2", "0.1", "79228162514264337593543950335", "s", "l", ""]], "trade", "XBT/USDT"])
            .to_string(),
    );
    remote.push(
        json!([0, [["5541.2", "0.1", "1534614057.321597", "s", "l", ""]], "trade", "XBT/USDT"]).to_string(),
    );

    let tick = next_item(&mut stream).await.unwrap();
    assert_eq!(tick.price, dec!(5541.2));
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_malformed_message_is_dropped() {
    let (transport, remote) = scripted();
    let connector = ScriptedConnector::new(vec![transport]);
    let client = client(BitstampProtocol::new(), &connector, fast_settings());

    let pair = CurrencyPair::new("BTC", "USD");
    let mut stream = client.create_depth_snapshot(&[pair.clone()]);
    remote.push(r#"{"event":"bts:subscription_succeeded","channel":"order_book_btcusd","data":{}}"#);
    remote.push("{not json");
    remote.push(r#"{"event":"data","channel":"order_book_btcusd","data":{"bids":"oops"}}"#);
    remote.push(
        r#"{"data":{"timestamp":"1560000000","microtimestamp":"1560000000000000","bids":[["8000","1"]],"asks":[["8001","1"]]},"event":"data","channel":"order_book_btcusd"}"#,
    );

    let book = next_item(&mut stream).await.unwrap();
    assert_eq!(book.pair, pair);
    assert_eq!(book.vendor, ExchangeVendor::Bitstamp);
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_missing_ack_exhausts_retries() {
    let (first, _first_remote) = scripted();
    let (second, _second_remote) = scripted();
    let connector = ScriptedConnector::new(vec![first, second]);
    let settings = FeedSettings {
        subscribe_timeout: Duration::from_millis(50),
        reconnect: ReconnectPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
            max_retries: 1,
        },
        ..fast_settings()
    };
    let client = client(BitstampProtocol::new(), &connector, settings);

    let mut stream = client.create_trade_websocket(&[CurrencyPair::new("BTC", "USD")]);
    match next_item(&mut stream).await {
        Err(FeedError::RetriesExhausted {
            vendor,
            attempts,
            last_cause,
            ..
        }) => {
            assert_eq!(vendor, ExchangeVendor::Bitstamp);
            assert_eq!(attempts, 2);
            assert!(last_cause.contains("no subscribe ack"));
        }
        other => panic!("unexpected item: {other:?}"),
    }
    assert!(stream.next().await.is_none());
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_missed_heartbeat_reconnects() {
    let (first, mut first_remote) = scripted();
    let (second, second_remote) = scripted();
    let connector = ScriptedConnector::new(vec![first, second]);
    let settings = FeedSettings {
        heartbeat_interval: Duration::from_millis(50),
        ..fast_settings()
    };
    let client = client(BitmexProtocol::new(), &connector, settings);

    let pair = CurrencyPair::new("BTC", "USD");
    let mut stream = client.create_depth_snapshot(&[pair]);

    // First connection acks, then goes silent and never answers the ping
    first_remote.push(r#"{"success":true,"subscribe":"orderBook10:XBTUSD"}"#);
    second_remote.push(r#"{"success":true,"subscribe":"orderBook10:XBTUSD"}"#);
    second_remote.push(
        r#"{"table":"orderBook10","action":"partial","data":[{"symbol":"XBTUSD","bids":[[9000,10]],"asks":[[9000.5,20]],"timestamp":"2019-07-01T10:00:00.000Z"}]}"#,
    );

    let book = next_item(&mut stream).await.unwrap();
    assert_eq!(book.asks[0].price, dec!(9000.5));
    assert_eq!(connector.connects(), 2);

    assert!(first_remote.next_sent().await.contains("subscribe"));
    assert_eq!(first_remote.next_sent().await, "ping");
}

#[tokio::test]
async fn test_dropping_stream_closes_transport() {
    let (transport, mut remote) = scripted();
    let connector = ScriptedConnector::new(vec![transport]);
    let client = client(BinanceProtocol::default(), &connector, fast_settings());

    let mut stream = client.create_depth_snapshot(&[btc_usdt()]);
    remote.push(
        r#"{"stream":"btcusdt@depth20@100ms","data":{"lastUpdateId":1,"bids":[["100","1"]],"asks":[["101","1"]]}}"#,
    );
    next_item(&mut stream).await.unwrap();

    drop(stream);

    timeout(Duration::from_secs(5), remote.inbound.closed())
        .await
        .expect("transport still open");
    assert!(remote.sent.recv().await.is_none());
}

#[tokio::test]
async fn test_stream_is_cold_until_polled() {
    let (transport, _remote) = scripted();
    let connector = ScriptedConnector::new(vec![transport]);
    let client = client(BinanceProtocol::default(), &connector, fast_settings());

    let stream = client.create_depth_snapshot(&[btc_usdt()]);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(connector.connects(), 0);
    assert!(!stream.is_started());

    let mut task = tokio_test::task::spawn(stream);
    tokio_test::assert_pending!(task.poll_next());

    timeout(Duration::from_secs(5), async {
        while connector.connects() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("never connected");
}
