//! TCP transport for meterlink

use crate::stream::{StreamAccessor, TransportLayer};
use crate::{LinkError, LinkResult};
use async_trait::async_trait;
use meterlink_core::EndpointKey;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

/// TCP transport settings
#[derive(Debug, Clone)]
pub struct TcpSettings {
    pub endpoint: EndpointKey,
    /// Timeout applied to each read and write call
    pub timeout: Option<Duration>,
    /// Upper bound for establishing the connection (resolve + connect)
    pub connect_timeout: Duration,
    /// Enable SO_KEEPALIVE on the socket
    pub keepalive: bool,
}

impl TcpSettings {
    /// Create settings with 3 s timeouts and keep-alive on
    pub fn new(endpoint: EndpointKey) -> Self {
        Self::with_timeout(endpoint, Duration::from_secs(3))
    }

    /// Create settings using `timeout` for connect and for each I/O call
    pub fn with_timeout(endpoint: EndpointKey, timeout: Duration) -> Self {
        Self {
            endpoint,
            timeout: Some(timeout),
            connect_timeout: timeout,
            keepalive: true,
        }
    }
}

/// TCP connection to one device endpoint
///
/// Starts closed; `open` connects it. A read returning EOF or any socket
/// error marks it closed for good. A timed-out call leaves it open, since
/// the device may simply not have answered yet.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    settings: TcpSettings,
    closed: bool,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local = self.stream.as_ref().and_then(|s| s.local_addr().ok());
        f.debug_struct("TcpTransport")
            .field("endpoint", &self.settings.endpoint)
            .field("local", &local)
            .field("closed", &self.closed)
            .finish()
    }
}

impl TcpTransport {
    pub fn new(settings: TcpSettings) -> Self {
        Self {
            stream: None,
            settings,
            closed: true,
        }
    }

    /// Create an unopened transport from a `host:port` string
    pub fn from_address(address: &str) -> LinkResult<Self> {
        let endpoint = EndpointKey::parse(address)?;
        Ok(Self::new(TcpSettings::new(endpoint)))
    }

    /// Wrap a stream that is already connected
    ///
    /// # Arguments
    /// * `stream` - Connected TCP stream
    /// * `timeout` - Optional per-call read/write timeout
    pub fn from_connected_stream(stream: TcpStream, timeout: Option<Duration>) -> LinkResult<Self> {
        let endpoint = EndpointKey::from(stream.peer_addr()?);
        let mut settings = TcpSettings::new(endpoint);
        settings.timeout = timeout;
        Ok(Self {
            stream: Some(stream),
            settings,
            closed: false,
        })
    }

    /// Endpoint this transport talks to
    pub fn endpoint(&self) -> &EndpointKey {
        &self.settings.endpoint
    }

    async fn connect_stream(&self) -> LinkResult<TcpStream> {
        let endpoint = &self.settings.endpoint;
        let addrs = tokio::net::lookup_host((endpoint.host(), endpoint.port())).await?;

        let mut last_error = None;
        for addr in addrs {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_keepalive(self.settings.keepalive)?;
            match socket.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => {
                    log::debug!("Connect to {} ({}) failed: {}", endpoint, addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(LinkError::Connection(last_error.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("No address resolved for {}", endpoint),
            )
        })))
    }

    fn stream_mut(&mut self) -> LinkResult<&mut TcpStream> {
        if self.closed {
            return Err(LinkError::Connection(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("Connection to {} is closed", self.settings.endpoint),
            )));
        }
        self.stream.as_mut().ok_or_else(|| {
            LinkError::Connection(std::io::Error::from(std::io::ErrorKind::NotConnected))
        })
    }

    /// Mark the transport closed when `result` is a socket error
    fn track<T>(&mut self, result: LinkResult<T>) -> LinkResult<T> {
        if result.as_ref().is_err_and(LinkError::is_socket) {
            self.closed = true;
        }
        result
    }
}

async fn with_io_timeout<T>(
    timeout: Option<Duration>,
    io: impl Future<Output = std::io::Result<T>>,
) -> LinkResult<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, io)
            .await
            .map_err(|_| LinkError::Timeout)?
            .map_err(LinkError::from),
        None => io.await.map_err(LinkError::from),
    }
}

#[async_trait]
impl TransportLayer for TcpTransport {
    async fn open(&mut self) -> LinkResult<()> {
        if self.stream.is_some() && !self.closed {
            return Err(LinkError::Connection(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("Connection to {} is already open", self.settings.endpoint),
            )));
        }

        let stream = tokio::time::timeout(self.settings.connect_timeout, self.connect_stream())
            .await
            .map_err(|_| LinkError::Timeout)??;

        log::debug!("Opened TCP connection to {}", self.settings.endpoint);
        self.stream = Some(stream);
        self.closed = false;
        Ok(())
    }
}

#[async_trait]
impl StreamAccessor for TcpTransport {
    async fn set_timeout(&mut self, timeout: Option<Duration>) -> LinkResult<()> {
        self.settings.timeout = timeout;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> LinkResult<usize> {
        let timeout = self.settings.timeout;
        let stream = self.stream_mut()?;
        let result = with_io_timeout(timeout, stream.read(buf)).await;
        if matches!(result, Ok(0)) {
            log::debug!("Peer {} closed the connection", self.settings.endpoint);
            self.closed = true;
        }
        self.track(result)
    }

    async fn write(&mut self, buf: &[u8]) -> LinkResult<usize> {
        let timeout = self.settings.timeout;
        let stream = self.stream_mut()?;
        let result = with_io_timeout(timeout, stream.write(buf)).await;
        self.track(result)
    }

    async fn flush(&mut self) -> LinkResult<()> {
        let timeout = self.settings.timeout;
        let stream = self.stream_mut()?;
        let result = with_io_timeout(timeout, stream.flush()).await;
        self.track(result)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) -> LinkResult<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                log::debug!("Shutdown of {} failed: {}", self.settings.endpoint, e);
            }
        }
        self.closed = true;
        Ok(())
    }
}
