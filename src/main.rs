//! Exchange Feed - feed normalizer daemon
//!
//! Subscribes to one exchange, logs normalized trades or book status and
//! serves health and Prometheus metrics over HTTP.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{http::StatusCode, routing::get, Json, Router};
use futures_util::StreamExt;
use tokio::time::interval;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use exchange_feed::{
    BookSummary, ClientRegistry, Config, CurrencyPair, FeedKind, FeedStream, OrderBook, TickData,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Exchange Feed");

    // Load configuration
    let config = Config::load()?;
    info!(
        vendor = %config.vendor,
        pairs = ?config.pairs.iter().map(ToString::to_string).collect::<Vec<_>>(),
        feed = config.feed.as_str(),
        "Configuration loaded"
    );

    let registry = ClientRegistry::with_defaults(config.settings.clone());
    let client = registry.client_for(config.vendor)?;

    // Start health check server
    let port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(port).await {
            warn!(error = %e, "Health server error");
        }
    });

    let result = match config.feed {
        FeedKind::Trade => {
            let stream = client.create_trade_websocket(&config.pairs);
            tokio::select! {
                r = log_trades(stream) => r,
                _ = tokio::signal::ctrl_c() => Ok(()),
            }
        }
        FeedKind::Book => {
            let stream = client.create_depth_snapshot(&config.pairs);
            let status_every = Duration::from_secs(config.status_interval_secs.max(1));
            tokio::select! {
                r = log_books(stream, status_every) => r,
                _ = tokio::signal::ctrl_c() => Ok(()),
            }
        }
    };

    match &result {
        Ok(()) => info!("Shutting down"),
        Err(e) => error!(error = %e, "Feed terminated"),
    }
    result
}

async fn log_trades(mut stream: FeedStream<TickData>) -> anyhow::Result<()> {
    while let Some(item) = stream.next().await {
        let tick = item?;
        info!(
            vendor = %tick.vendor,
            pair = %tick.pair,
            price = %tick.price,
            qty = %tick.quantity,
            side = ?tick.side,
            id = %tick.unique_id,
            "Trade"
        );
    }
    Ok(())
}

/// Keep the latest book per pair and log a status line periodically
async fn log_books(mut stream: FeedStream<Arc<OrderBook>>, every: Duration) -> anyhow::Result<()> {
    let mut latest: HashMap<CurrencyPair, Arc<OrderBook>> = HashMap::new();
    let mut status = interval(every);

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(book) => {
                    let book = book?;
                    latest.insert(book.pair.clone(), book);
                }
                None => return Ok(()),
            },
            _ = status.tick() => {
                for (pair, book) in &latest {
                    let summary = BookSummary::from_book(book, 5);
                    if !summary.is_healthy() {
                        warn!(vendor = %book.vendor, pair = %pair, "Order book has an empty side");
                        continue;
                    }
                    if let Some(mid) = summary.mid_price {
                        info!(
                            vendor = %book.vendor,
                            pair = %pair,
                            mid_price = %mid,
                            spread_bps = ?summary.spread_bps,
                            imbalance = ?summary.imbalance,
                            bid_levels = summary.bid_levels,
                            ask_levels = summary.ask_levels,
                            "Order book status"
                        );
                    }
                }
            }
        }
    }
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "component": "exchange-feed",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics() -> Result<String, StatusCode> {
    use prometheus::{Encoder, TextEncoder};
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
