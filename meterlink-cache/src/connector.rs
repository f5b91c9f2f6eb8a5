//! Connection factories for the cache

use crate::settings::CacheSettings;
use async_trait::async_trait;
use meterlink_core::{EndpointKey, LinkResult};
use meterlink_transport::{StreamAccessor, TcpSettings, TcpTransport, TransportLayer};
use std::time::Duration;

/// Opens transports for endpoint keys
///
/// The cache calls `connect` whenever a key has no usable transport. A
/// connect that times out must report `LinkError::Timeout` so the cache can
/// retry it once; any other error is propagated as is.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Transport type produced by this connector
    type Transport: StreamAccessor + 'static;

    /// Open a new transport to `key`
    async fn connect(&self, key: &EndpointKey) -> LinkResult<Self::Transport>;
}

/// Connector producing TCP transports
#[derive(Debug, Clone)]
pub struct TcpConnector {
    io_timeout: Option<Duration>,
    connect_timeout: Duration,
    keepalive: bool,
}

impl TcpConnector {
    /// Create a TCP connector from cache settings
    ///
    /// Socket reads and writes time out after the cache `timeout`.
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            io_timeout: Some(settings.timeout),
            connect_timeout: settings.connect_timeout,
            keepalive: settings.keepalive,
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(&CacheSettings::default())
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Transport = TcpTransport;

    async fn connect(&self, key: &EndpointKey) -> LinkResult<TcpTransport> {
        let mut settings = TcpSettings::new(key.clone());
        settings.timeout = self.io_timeout;
        settings.connect_timeout = self.connect_timeout;
        settings.keepalive = self.keepalive;

        let mut transport = TcpTransport::new(settings);
        transport.open().await?;
        Ok(transport)
    }
}
