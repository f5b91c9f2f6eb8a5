//! Exchange builder
//!
//! Collects cache and exchange settings in one fluent chain and builds an
//! `ExchangeEngine` or a `MeterClient`.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use meterlink_client::ExchangeBuilder;
//! use std::time::Duration;
//!
//! # async fn run() -> meterlink_core::LinkResult<()> {
//! let client = ExchangeBuilder::new()
//!     .timeout(Duration::from_secs(3))
//!     .read_timeout(Duration::from_secs(5))
//!     .retries(2, Duration::from_secs(1))
//!     .max_keys(64)
//!     .build_client()?;
//!
//! let key = "192.168.1.100:8899".parse()?;
//! let frame = client.modbus(&key, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]).await?;
//! # Ok(())
//! # }
//! ```

use super::engine::ExchangeEngine;
use super::settings::ExchangeSettings;
use crate::meter::MeterClient;
use meterlink_cache::{CacheSettings, ConnectionCache, Connector, TcpConnector};
use meterlink_core::{LinkError, LinkResult};
use std::time::Duration;

/// Builder for exchange engines and meter clients
///
/// # Default Settings
/// - Cache: 3 s timeout, idle after 10 timeouts, 200 ms polls, 6 keys
/// - Exchange: 3 s read timeout, 3 retries 2 s apart, `FE FE FE FE` preamble
#[derive(Debug, Clone, Default)]
pub struct ExchangeBuilder {
    cache: CacheSettings,
    exchange: ExchangeSettings,
}

impl ExchangeBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all cache settings
    pub fn cache_settings(mut self, settings: CacheSettings) -> Self {
        self.cache = settings;
        self
    }

    /// Replace all exchange settings
    pub fn exchange_settings(mut self, settings: ExchangeSettings) -> Self {
        self.exchange = settings;
        self
    }

    /// Configure the cache base timeout
    ///
    /// Drives the sweep period, the lease wait budget, the idle threshold and
    /// the socket I/O timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.cache.timeout = timeout;
        self
    }

    /// Configure the idle multiplier
    pub fn idle_multiplier(mut self, multiplier: u32) -> Self {
        self.cache.idle_multiplier = multiplier;
        self
    }

    /// Configure the lease poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.cache.poll_interval = interval;
        self
    }

    /// Configure the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.cache.connect_timeout = timeout;
        self
    }

    /// Configure the maximum number of tracked endpoints
    pub fn max_keys(mut self, max_keys: usize) -> Self {
        self.cache.max_keys = max_keys;
        self
    }

    /// Enable or disable TCP keep-alive
    pub fn keepalive(mut self, keepalive: bool) -> Self {
        self.cache.keepalive = keepalive;
        self
    }

    /// Configure the response read deadline
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.exchange.read_timeout = timeout;
        self
    }

    /// Configure the retry budget
    ///
    /// # Arguments
    /// * `max_retries` - Retries after the first attempt
    /// * `delay` - Pause between attempts
    pub fn retries(mut self, max_retries: u32, delay: Duration) -> Self {
        self.exchange.max_retries = max_retries;
        self.exchange.retry_delay = delay;
        self
    }

    /// Configure the response preamble; empty disables stripping
    pub fn preamble(mut self, preamble: &[u8]) -> Self {
        self.exchange.preamble = preamble.to_vec();
        self
    }

    /// Configure the socket read size
    pub fn read_chunk(mut self, size: usize) -> Self {
        self.exchange.read_chunk = size;
        self
    }

    fn validate(&self) -> LinkResult<()> {
        if self.cache.timeout.is_zero() {
            return Err(LinkError::InvalidData("Cache timeout must be positive".to_string()));
        }
        if self.cache.poll_interval.is_zero() {
            return Err(LinkError::InvalidData("Poll interval must be positive".to_string()));
        }
        if self.cache.max_keys == 0 {
            return Err(LinkError::InvalidData("max_keys must be at least 1".to_string()));
        }
        if self.exchange.read_chunk == 0 {
            return Err(LinkError::InvalidData("read_chunk must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Build an engine over TCP
    ///
    /// Call inside a Tokio runtime so the cache can start its idle sweep.
    pub fn build_engine(self) -> LinkResult<ExchangeEngine<TcpConnector>> {
        let connector = TcpConnector::new(&self.cache);
        self.build_engine_with(connector)
    }

    /// Build an engine over a custom connector
    pub fn build_engine_with<C: Connector>(self, connector: C) -> LinkResult<ExchangeEngine<C>> {
        self.validate()?;
        let cache = ConnectionCache::new(self.cache, connector);
        Ok(ExchangeEngine::new(cache, self.exchange))
    }

    /// Build a meter client over TCP
    pub fn build_client(self) -> LinkResult<MeterClient> {
        Ok(MeterClient::new(self.build_engine()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_engine() {
        let engine = ExchangeBuilder::new()
            .timeout(Duration::from_millis(1500))
            .poll_interval(Duration::from_millis(100))
            .max_keys(16)
            .read_timeout(Duration::from_secs(5))
            .retries(1, Duration::from_millis(500))
            .preamble(&[])
            .build_engine()
            .unwrap();

        assert_eq!(engine.cache().settings().max_polls(), 15);
        assert_eq!(engine.cache().settings().max_keys, 16);
        assert_eq!(engine.settings().max_attempts(), 2);
        assert!(engine.settings().preamble.is_empty());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let result = ExchangeBuilder::new().poll_interval(Duration::ZERO).build_engine();
        assert!(matches!(result, Err(LinkError::InvalidData(_))));

        let result = ExchangeBuilder::new().read_chunk(0).build_engine();
        assert!(matches!(result, Err(LinkError::InvalidData(_))));
    }
}
