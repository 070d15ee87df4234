//! Configuration module for the feed normalizer

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FeedError, Result};
use crate::types::{CurrencyPair, ExchangeVendor, FeedKind};

/// Reconnect backoff policy
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for the exponential delay (before jitter)
    pub max_backoff: Duration,
    /// Consecutive failed attempts before giving up, 0 = retry forever
    pub max_retries: u32,
}

impl ReconnectPolicy {
    /// Exponential backoff for the given attempt with 0-50% random jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);

        let jitter_frac = rand::random::<f64>() * 0.5;
        base + Duration::from_secs_f64(base.as_secs_f64() * jitter_frac)
    }

    /// Whether another attempt is allowed after `failures` consecutive failures
    pub fn allows(&self, failures: u32) -> bool {
        self.max_retries == 0 || failures <= self.max_retries
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(60_000),
            max_retries: 10,
        }
    }
}

/// Settings shared by every subscription a client opens
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSettings {
    /// Override for the vendor's websocket URL
    pub endpoint: Option<String>,

    /// Bounded wait for subscribe acks
    pub subscribe_timeout: Duration,

    /// Idle time before probing the connection; a second idle period without
    /// any message is a disconnect
    pub heartbeat_interval: Duration,

    pub reconnect: ReconnectPolicy,

    /// Requested book depth; vendors round to a depth they offer
    pub book_depth: usize,

    /// Events buffered per stream before the connection task waits
    pub channel_capacity: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            subscribe_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            book_depth: 20,
            channel_capacity: 1024,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Exchange to connect to
    pub vendor: ExchangeVendor,

    /// Pairs to subscribe to (e.g., ["BTC/USDT", "ETH/USDT"])
    pub pairs: Vec<CurrencyPair>,

    /// Trade ticks or order books
    pub feed: FeedKind,

    /// Book status log interval in seconds
    pub status_interval_secs: u64,

    /// Port for /health and /metrics
    pub health_port: u16,

    pub settings: FeedSettings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Ok(Self::from_lookup(|key| env::var(key).ok())?)
    }

    /// Load configuration from an env file only, ignoring the process environment
    pub fn from_env_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut vars = HashMap::new();
        for item in dotenvy::from_path_iter(path.as_ref())? {
            let (key, value) = item?;
            vars.insert(key, value);
        }
        Ok(Self::from_lookup(|key| vars.get(key).cloned())?)
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str, default: u64| parse_or(&lookup, key, default);

        let vendor: ExchangeVendor = lookup("FEED_VENDOR")
            .unwrap_or_else(|| "BINANCE".to_string())
            .parse()?;

        let pairs = lookup("FEED_PAIRS")
            .unwrap_or_else(|| "BTC/USDT,ETH/USDT".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<CurrencyPair>())
            .collect::<Result<Vec<_>>>()?;
        if pairs.is_empty() {
            return Err(FeedError::ConfigError("FEED_PAIRS is empty".to_string()));
        }

        let feed: FeedKind = lookup("FEED_KIND")
            .unwrap_or_else(|| "book".to_string())
            .parse()?;

        let defaults = FeedSettings::default();
        let settings = FeedSettings {
            endpoint: lookup("FEED_ENDPOINT").filter(|s| !s.trim().is_empty()),
            subscribe_timeout: Duration::from_millis(number(
                "SUBSCRIBE_TIMEOUT_MS",
                defaults.subscribe_timeout.as_millis() as u64,
            )),
            heartbeat_interval: Duration::from_millis(number(
                "HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval.as_millis() as u64,
            )),
            reconnect: ReconnectPolicy {
                initial_backoff: Duration::from_millis(number(
                    "RECONNECT_DELAY_MS",
                    defaults.reconnect.initial_backoff.as_millis() as u64,
                )),
                max_backoff: Duration::from_millis(number(
                    "MAX_RECONNECT_DELAY_MS",
                    defaults.reconnect.max_backoff.as_millis() as u64,
                )),
                max_retries: parse_or(&lookup, "MAX_RECONNECT_ATTEMPTS", defaults.reconnect.max_retries),
            },
            book_depth: parse_or(&lookup, "DEPTH_LEVELS", defaults.book_depth),
            channel_capacity: parse_or(&lookup, "CHANNEL_CAPACITY", defaults.channel_capacity).max(1),
        };

        Ok(Self {
            vendor,
            pairs,
            feed,
            status_interval_secs: number("STATUS_INTERVAL_SECS", 30),
            health_port: parse_or(&lookup, "HEALTH_PORT", 9090),
            settings,
        })
    }
}

/// Parse a setting into its target type; missing, invalid or out-of-range
/// values fall back to the default
fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
