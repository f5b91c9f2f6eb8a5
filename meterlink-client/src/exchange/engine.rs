//! Framed request/response exchange engine

use super::framing::{FrameLength, Received, receive};
use super::settings::ExchangeSettings;
use bytes::Bytes;
use meterlink_cache::{CacheSettings, ConnectionCache, Connector, Lease, TcpConnector};
use meterlink_core::codec::bytes_to_hex;
use meterlink_core::{EndpointKey, LinkError, LinkResult};
use meterlink_transport::StreamAccessor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

/// Exchange engine
///
/// Sends a command to an endpoint and reads back one response frame, over a
/// transport leased from its `ConnectionCache`. Exchanges on the same endpoint
/// key run one at a time; different keys run in parallel.
///
/// # Attempt Flow
/// 1. Lock the endpoint
/// 2. Lease the transport and write the command. A socket error on write
///    force-closes the key, leases a fresh transport and writes once more.
/// 3. Read the response until the `FrameLength` strategy reports it complete
///    or the read deadline passes
/// 4. Release the lease, then the endpoint. A response that did not complete
///    may still be arriving, so its connection is closed instead of reused.
///
/// Attempts failing with a transport error are retried `max_retries` times.
pub struct ExchangeEngine<C: Connector> {
    cache: ConnectionCache<C>,
    settings: ExchangeSettings,
    endpoint_locks: EndpointLocks,
}

type EndpointLocks = Mutex<HashMap<EndpointKey, Arc<tokio::sync::Mutex<()>>>>;

impl ExchangeEngine<TcpConnector> {
    /// Create an engine over a TCP connection cache
    pub fn tcp(cache_settings: CacheSettings, settings: ExchangeSettings) -> Self {
        Self::new(ConnectionCache::tcp(cache_settings), settings)
    }
}

impl<C: Connector> ExchangeEngine<C> {
    /// Create an engine over an existing cache
    pub fn new(cache: ConnectionCache<C>, settings: ExchangeSettings) -> Self {
        Self {
            cache,
            settings,
            endpoint_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Get the connection cache
    pub fn cache(&self) -> &ConnectionCache<C> {
        &self.cache
    }

    /// Get the exchange settings
    pub fn settings(&self) -> &ExchangeSettings {
        &self.settings
    }

    /// Send `command` to `key` and read back one frame
    ///
    /// # Arguments
    /// * `key` - Endpoint to talk to
    /// * `command` - Encoded request, written as is
    /// * `frame_length` - Strategy computing the response length
    ///
    /// # Returns
    /// The response with the preamble stripped and truncated to the expected
    /// length. When the read deadline passes first, whatever arrived.
    ///
    /// # Errors
    /// - `LinkError::RetriesExhausted` wrapping the last transport error once
    ///   `max_retries` retries failed
    /// - Contention, capacity and framing errors as soon as they occur
    pub async fn exchange<F>(&self, key: &EndpointKey, command: &[u8], frame_length: &F) -> LinkResult<Bytes>
    where
        F: FrameLength + ?Sized,
    {
        let max_attempts = self.settings.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.exchange_once(key, command, frame_length).await {
                Ok(frame) => return Ok(frame),
                Err(e) if e.is_transport() => e,
                Err(e) => return Err(e),
            };

            if attempt >= max_attempts {
                log::error!("Exchange with {} failed after {} attempts: {}", key, attempt, err);
                return Err(LinkError::RetriesExhausted {
                    key: key.clone(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            log::warn!(
                "Exchange with {} failed (attempt {}/{}): {}, retrying in {:?}",
                key,
                attempt,
                max_attempts,
                err,
                self.settings.retry_delay
            );
            tokio::time::sleep(self.settings.retry_delay).await;
        }
    }

    async fn exchange_once<F>(&self, key: &EndpointKey, command: &[u8], frame_length: &F) -> LinkResult<Bytes>
    where
        F: FrameLength + ?Sized,
    {
        let _endpoint = self.lock_endpoint(key).await;

        let mut lease = self.send(key, command).await?;
        let deadline = Instant::now() + self.settings.read_timeout;
        let result = receive(&mut *lease, frame_length, &self.settings, deadline).await;
        if !matches!(result, Ok(Received { complete: true, .. })) {
            // the rest of this response would be read by the next exchange
            log::warn!("Incomplete response from {}, closing connection", key);
            self.cache.close(key).await;
        }
        self.cache.release(lease).await;
        result.map(|received| received.frame)
    }

    /// Lease a transport and write `command` on it
    async fn send(&self, key: &EndpointKey, command: &[u8]) -> LinkResult<Lease<C>> {
        let mut lease = self.cache.acquire(key).await?;
        log::debug!("Sending to {}: {}", key, bytes_to_hex(command));

        match write_command(&mut *lease, command).await {
            Ok(()) => Ok(lease),
            Err(e) if e.is_socket() => {
                log::warn!("Write to {} failed: {}, reconnecting", key, e);
                self.cache.close(key).await;
                drop(lease);

                let mut lease = self.cache.acquire(key).await?;
                if let Err(e) = write_command(&mut *lease, command).await {
                    self.cache.close(key).await;
                    return Err(e);
                }
                Ok(lease)
            }
            Err(e) => {
                // part of the command may have gone out
                self.cache.close(key).await;
                Err(e)
            }
        }
    }

    async fn lock_endpoint<'a>(&'a self, key: &'a EndpointKey) -> EndpointGuard<'a> {
        let mutex = self.endpoint_locks.lock().entry(key.clone()).or_default().clone();
        let mut guard = EndpointGuard {
            locks: &self.endpoint_locks,
            key,
            mutex,
            held: None,
        };
        guard.held = Some(guard.mutex.clone().lock_owned().await);
        guard
    }

    /// Force-close the cached connection for `key`
    ///
    /// For callers that detect a corrupted stream at the protocol level. The
    /// next exchange opens a new connection.
    pub async fn close(&self, key: &EndpointKey) -> bool {
        self.cache.close(key).await
    }

    /// Shut down the underlying cache
    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
    }
}

/// Exclusive use of one endpoint
///
/// On drop, also when the wait for the lock was cancelled, the endpoint's
/// entry is removed once no other exchange holds or waits for it.
struct EndpointGuard<'a> {
    locks: &'a EndpointLocks,
    key: &'a EndpointKey,
    mutex: Arc<tokio::sync::Mutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for EndpointGuard<'_> {
    fn drop(&mut self) {
        self.held.take();
        let mut locks = self.locks.lock();
        // handles left: the map's and ours
        if Arc::strong_count(&self.mutex) == 2
            && locks.get(self.key).is_some_and(|m| Arc::ptr_eq(m, &self.mutex))
        {
            locks.remove(self.key);
        }
    }
}

async fn write_command<S: StreamAccessor + ?Sized>(stream: &mut S, command: &[u8]) -> LinkResult<()> {
    stream.write_all(command).await?;
    stream.flush().await
}
