//! Vendor registry
//!
//! Maps an [`ExchangeVendor`] to a factory building its client. Populated at
//! startup and read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::FeedSettings;
use crate::error::{FeedError, Result};
use crate::exchange::{BinanceProtocol, BitmexProtocol, BitstampProtocol, KrakenProtocol};
use crate::stream::{ExchangeWebsocketClient, FeedClient};
use crate::types::ExchangeVendor;

/// Builds a client from the shared settings
pub type ClientFactory =
    Arc<dyn Fn(&FeedSettings) -> Arc<dyn ExchangeWebsocketClient> + Send + Sync>;

/// Vendor -> client factory lookup
#[derive(Clone)]
pub struct ClientRegistry {
    settings: FeedSettings,
    factories: HashMap<ExchangeVendor, ClientFactory>,
}

impl ClientRegistry {
    /// Empty registry
    pub fn new(settings: FeedSettings) -> Self {
        Self {
            settings,
            factories: HashMap::new(),
        }
    }

    /// Registry with every vendor that has a decoder
    pub fn with_defaults(settings: FeedSettings) -> Self {
        let mut registry = Self::new(settings);
        registry.register(ExchangeVendor::Binance, |s| {
            Arc::new(FeedClient::new(Arc::new(BinanceProtocol::from_settings(s)), s.clone()))
        });
        registry.register(ExchangeVendor::Kraken, |s| {
            Arc::new(FeedClient::new(Arc::new(KrakenProtocol::from_settings(s)), s.clone()))
        });
        registry.register(ExchangeVendor::Bitmex, |s| {
            Arc::new(FeedClient::new(Arc::new(BitmexProtocol::from_settings(s)), s.clone()))
        });
        registry.register(ExchangeVendor::Bitstamp, |s| {
            Arc::new(FeedClient::new(Arc::new(BitstampProtocol::from_settings(s)), s.clone()))
        });
        registry
    }

    /// Add or replace the factory for a vendor
    pub fn register<F>(&mut self, vendor: ExchangeVendor, factory: F)
    where
        F: Fn(&FeedSettings) -> Arc<dyn ExchangeWebsocketClient> + Send + Sync + 'static,
    {
        debug!(vendor = %vendor, "Registering client factory");
        self.factories.insert(vendor, Arc::new(factory));
    }

    /// Client for a vendor, or `UnsupportedVendor`
    pub fn client_for(&self, vendor: ExchangeVendor) -> Result<Arc<dyn ExchangeWebsocketClient>> {
        self.factories
            .get(&vendor)
            .map(|factory| factory(&self.settings))
            .ok_or_else(|| FeedError::UnsupportedVendor(vendor.to_string()))
    }

    /// Client for a vendor name such as `"binance"` or `"HUOBI_GLOBAL"`
    pub fn client_for_name(&self, name: &str) -> Result<Arc<dyn ExchangeWebsocketClient>> {
        self.client_for(name.parse()?)
    }

    /// Vendors with a registered factory, in enum order
    pub fn supported(&self) -> Vec<ExchangeVendor> {
        let mut vendors: Vec<ExchangeVendor> = self.factories.keys().copied().collect();
        vendors.sort();
        vendors
    }
}
