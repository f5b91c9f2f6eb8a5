//! Stream abstraction handed out by the connection cache

use crate::{LinkError, LinkResult};
use async_trait::async_trait;
use std::time::Duration;

/// Byte stream to one metering device
///
/// Implementations track whether the stream is still usable: once the peer
/// hung up or an I/O call failed, `is_closed` must report `true` so the cache
/// stops handing the stream out.
#[async_trait]
pub trait StreamAccessor: Send + Sync {
    /// Set the timeout applied to each read and write call
    ///
    /// # Arguments
    ///
    /// * `timeout` - Per-call timeout. None waits forever.
    async fn set_timeout(&mut self, timeout: Option<Duration>) -> LinkResult<()>;

    /// Read whatever bytes are available
    ///
    /// # Returns
    ///
    /// Number of bytes read, 0 once the peer closed the stream
    async fn read(&mut self, buf: &mut [u8]) -> LinkResult<usize>;

    /// Write part of `buf`
    ///
    /// # Returns
    ///
    /// Number of bytes accepted by the stream
    async fn write(&mut self, buf: &[u8]) -> LinkResult<usize>;

    /// Write the whole of `buf`
    async fn write_all(&mut self, mut buf: &[u8]) -> LinkResult<()> {
        while !buf.is_empty() {
            match self.write(buf).await? {
                0 => {
                    return Err(LinkError::Connection(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "Stream accepted no bytes",
                    )));
                }
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> LinkResult<()>;

    /// Whether the stream saw EOF, an I/O error or an explicit `close`
    fn is_closed(&self) -> bool;

    /// Shut the stream down; later calls fail
    async fn close(&mut self) -> LinkResult<()>;
}

/// Stream that can establish its own connection
#[async_trait]
pub trait TransportLayer: StreamAccessor {
    /// Connect to the configured endpoint
    async fn open(&mut self) -> LinkResult<()>;
}
