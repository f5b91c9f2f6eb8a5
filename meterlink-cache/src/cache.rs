//! Keyed single-slot connection cache
//!
//! The cache owns at most one transport per endpoint key. A caller gets the
//! transport through a `Lease`; while the lease is out, other acquirers for the
//! same key poll until it comes back or their wait budget runs out.
//!
//! # Slot States
//! - **Reserved**: a connect is in flight, the slot counts as leased
//! - **Leased**: the transport lives in a `Lease`
//! - **Cached**: the transport sits in the cache, ready for the next acquire
//!
//! Every slot carries a generation number. A lease whose slot was force-closed,
//! evicted or replaced no longer matches, and its transport is closed when it
//! comes back instead of being cached.

use crate::connector::{Connector, TcpConnector};
use crate::settings::CacheSettings;
use crate::stats::{CacheCounters, CacheStats};
use meterlink_core::{EndpointKey, LinkError, LinkResult};
use meterlink_transport::StreamAccessor;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type TransportOf<C> = <C as Connector>::Transport;

/// Transports removed from the cache that still need closing
type Stale<T> = Vec<(EndpointKey, T)>;

struct PooledConnection<T> {
    /// `None` while leased or while the first connect is in flight
    transport: Option<T>,
    last_used_at: Instant,
    in_use: bool,
    generation: u64,
}

impl<T: StreamAccessor> PooledConnection<T> {
    fn reserved(generation: u64, now: Instant) -> Self {
        Self {
            transport: None,
            last_used_at: now,
            in_use: true,
            generation,
        }
    }

    fn lease(&mut self, now: Instant) -> Option<T> {
        let transport = self.transport.take()?;
        self.in_use = true;
        self.last_used_at = now;
        Some(transport)
    }

    /// A leased slot is never reported invalid: its transport is out with the
    /// lessee and gets checked when it comes back.
    fn is_invalid(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_closed())
    }

    fn is_idle(&self, threshold: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_used_at) > threshold
    }

    fn is_reclaimable(&self, threshold: Duration, now: Instant) -> bool {
        !self.in_use && (self.transport.is_none() || self.is_invalid() || self.is_idle(threshold, now))
    }
}

struct CacheState<T> {
    entries: HashMap<EndpointKey, PooledConnection<T>>,
    next_generation: u64,
    shut_down: bool,
}

impl<T: StreamAccessor> CacheState<T> {
    fn reserve(&mut self, key: &EndpointKey, now: Instant) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.entries
            .insert(key.clone(), PooledConnection::reserved(generation, now));
        generation
    }

    fn take_reclaimable(&mut self, threshold: Duration, now: Instant) -> (usize, Stale<T>) {
        let keys: Vec<EndpointKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_reclaimable(threshold, now))
            .map(|(key, _)| key.clone())
            .collect();

        let count = keys.len();
        let stale = keys
            .into_iter()
            .filter_map(|key| {
                let entry = self.entries.remove(&key)?;
                entry.transport.map(|t| (key, t))
            })
            .collect();
        (count, stale)
    }

    fn evict_least_recently_used(&mut self) -> Option<(EndpointKey, Option<T>)> {
        let key = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.in_use)
            .min_by_key(|(_, entry)| entry.last_used_at)
            .map(|(key, _)| key.clone())?;
        let entry = self.entries.remove(&key)?;
        Some((key, entry.transport))
    }
}

enum LeaseStep<T> {
    Leased { generation: u64, transport: T },
    Connect { generation: u64 },
    Busy,
}

struct CacheInner<C: Connector> {
    settings: CacheSettings,
    connector: C,
    state: RwLock<CacheState<TransportOf<C>>>,
    counters: CacheCounters,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> CacheInner<C> {
    fn try_lease(
        &self,
        key: &EndpointKey,
    ) -> (LinkResult<LeaseStep<TransportOf<C>>>, Stale<TransportOf<C>>) {
        let now = Instant::now();
        let threshold = self.settings.idle_threshold();
        let mut stale = Vec::new();
        let mut state = self.state.write();

        if state.shut_down {
            return (Err(LinkError::Shutdown), stale);
        }

        if let Some(entry) = state.entries.get_mut(key) {
            if entry.in_use {
                return (Ok(LeaseStep::Busy), stale);
            }
            if !entry.is_reclaimable(threshold, now) {
                if let Some(transport) = entry.lease(now) {
                    let generation = entry.generation;
                    return (Ok(LeaseStep::Leased { generation, transport }), stale);
                }
            }

            if let Some(old) = state.entries.remove(key) {
                log::debug!("Replacing closed or idle connection to {}", key);
                self.counters.record_reclaimed(1);
                if let Some(transport) = old.transport {
                    stale.push((key.clone(), transport));
                }
            }
        } else if state.entries.len() >= self.settings.max_keys {
            let (count, reclaimed) = state.take_reclaimable(threshold, now);
            self.counters.record_reclaimed(count);
            stale.extend(reclaimed);

            if state.entries.len() >= self.settings.max_keys {
                match state.evict_least_recently_used() {
                    Some((evicted, transport)) => {
                        log::debug!("Evicting {} to make room for {}", evicted, key);
                        self.counters.record_reclaimed(1);
                        if let Some(transport) = transport {
                            stale.push((evicted, transport));
                        }
                    }
                    None => {
                        return (
                            Err(LinkError::CacheFull {
                                max_keys: self.settings.max_keys,
                            }),
                            stale,
                        );
                    }
                }
            }
        }

        let generation = state.reserve(key, now);
        (Ok(LeaseStep::Connect { generation }), stale)
    }

    /// Put a leased transport back into its slot
    ///
    /// Returns the transport when it must be closed instead: the slot is gone
    /// or belongs to a newer generation, the cache shut down, or the transport
    /// itself is closed.
    fn give_back(
        &self,
        key: &EndpointKey,
        generation: u64,
        transport: TransportOf<C>,
    ) -> Option<TransportOf<C>> {
        let mut state = self.state.write();

        let owns_slot = state
            .entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation);
        if !owns_slot {
            return Some(transport);
        }

        if state.shut_down || transport.is_closed() {
            state.entries.remove(key);
            self.counters.record_reclaimed(1);
            return Some(transport);
        }

        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.in_use = false;
                entry.last_used_at = Instant::now();
                entry.transport = Some(transport);
                None
            }
            None => Some(transport),
        }
    }

    /// Drop a reservation whose connect failed or was cancelled
    fn forget(&self, key: &EndpointKey, generation: u64) {
        let mut state = self.state.write();
        let reserved = state
            .entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation && entry.transport.is_none());
        if reserved {
            state.entries.remove(key);
        }
    }
}

impl<C: Connector> Drop for CacheInner<C> {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

/// Removes the reserved slot unless the connect completed
struct Reservation<'a, C: Connector> {
    inner: &'a CacheInner<C>,
    key: &'a EndpointKey,
    generation: u64,
    armed: bool,
}

impl<C: Connector> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.forget(self.key, self.generation);
        }
    }
}

/// Keyed connection cache
///
/// Cheap to clone; clones share the same slots. The idle sweep runs on a Tokio
/// task for as long as any clone (or outstanding lease) is alive.
pub struct ConnectionCache<C: Connector> {
    inner: Arc<CacheInner<C>>,
}

impl<C: Connector> Clone for ConnectionCache<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> fmt::Debug for ConnectionCache<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("settings", &self.inner.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionCache<TcpConnector> {
    /// Create a cache of TCP connections
    pub fn tcp(settings: CacheSettings) -> Self {
        let connector = TcpConnector::new(&settings);
        Self::new(settings, connector)
    }
}

impl<C: Connector> ConnectionCache<C> {
    /// Create a new cache
    ///
    /// When called inside a Tokio runtime, the idle sweep starts immediately
    /// and runs every `settings.timeout`. Outside a runtime the sweep is
    /// disabled and stale connections are only replaced on acquire.
    pub fn new(settings: CacheSettings, connector: C) -> Self {
        let period = settings.timeout.max(Duration::from_millis(1));
        let inner = Arc::new(CacheInner {
            settings,
            connector,
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                next_generation: 0,
                shut_down: false,
            }),
            counters: CacheCounters::default(),
            sweeper: Mutex::new(None),
        });

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(sweep_loop(Arc::downgrade(&inner), period));
                *inner.sweeper.lock() = Some(task);
            }
            Err(_) => log::warn!("No Tokio runtime available, idle sweep disabled"),
        }

        Self { inner }
    }

    /// Get the cache settings
    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    /// Lease the transport for `key`
    ///
    /// Opens a new transport when the key has none, or when the cached one is
    /// closed or idle beyond the idle threshold. A connect that times out is
    /// retried once.
    ///
    /// # Errors
    /// - `LinkError::Connect` if the transport could not be opened
    /// - `LinkError::NoAvailableConnection` if the key stayed leased for the
    ///   whole wait budget (`timeout / poll_interval` polls)
    /// - `LinkError::CacheFull` if `max_keys` are tracked and all are leased
    /// - `LinkError::Shutdown` after `shutdown`
    pub async fn acquire(&self, key: &EndpointKey) -> LinkResult<Lease<C>> {
        let max_polls = self.inner.settings.max_polls();
        let mut polls = 0;

        loop {
            let (step, stale) = self.inner.try_lease(key);
            close_all(stale).await;

            match step? {
                LeaseStep::Leased {
                    generation,
                    transport,
                } => {
                    log::debug!("Acquired cached connection to {}", key);
                    self.inner.counters.record_reused();
                    return Ok(Lease::new(self.inner.clone(), key.clone(), generation, transport));
                }
                LeaseStep::Connect { generation } => {
                    return self.open(key, generation).await;
                }
                LeaseStep::Busy => {
                    if polls >= max_polls {
                        log::warn!("No available connection for {} after {} polls", key, polls);
                        self.inner.counters.record_contention();
                        return Err(LinkError::NoAvailableConnection {
                            key: key.clone(),
                            polls,
                        });
                    }
                    polls += 1;
                    tokio::time::sleep(self.inner.settings.poll_interval).await;
                }
            }
        }
    }

    async fn open(&self, key: &EndpointKey, generation: u64) -> LinkResult<Lease<C>> {
        let mut reservation = Reservation {
            inner: self.inner.as_ref(),
            key,
            generation,
            armed: true,
        };

        log::debug!("Creating new connection to {}", key);
        let result = match self.inner.connector.connect(key).await {
            Err(LinkError::Timeout) => {
                log::warn!("Connect to {} timed out, retrying once", key);
                self.inner.connector.connect(key).await
            }
            other => other,
        };

        let transport = result.map_err(|e| {
            log::error!("Failed to create connection to {}: {}", key, e);
            connect_error(key, e)
        })?;

        reservation.armed = false;
        self.inner.counters.record_opened();
        Ok(Lease::new(self.inner.clone(), key.clone(), generation, transport))
    }

    /// Return a lease to the cache
    ///
    /// Same as `Lease::release`. A closed transport is dropped from the cache
    /// instead of being kept.
    pub async fn release(&self, lease: Lease<C>) {
        lease.release().await;
    }

    /// Force-close the connection for `key`, leased or not
    ///
    /// A lease still out for the key closes its transport when it comes back.
    /// Returns whether the key was tracked.
    pub async fn close(&self, key: &EndpointKey) -> bool {
        let removed = self.inner.state.write().entries.remove(key);
        match removed {
            Some(entry) => {
                log::debug!("Force closing connection to {}", key);
                self.inner.counters.record_reclaimed(1);
                if let Some(mut transport) = entry.transport {
                    close_transport(key, &mut transport).await;
                }
                true
            }
            None => false,
        }
    }

    /// Close every cached connection that is closed or idle
    ///
    /// Leased keys are skipped. Returns the number of keys reclaimed. The
    /// background sweep calls this every `timeout`.
    pub async fn sweep(&self) -> usize {
        let (count, stale) = {
            let mut state = self.inner.state.write();
            state.take_reclaimable(self.inner.settings.idle_threshold(), Instant::now())
        };
        self.inner.counters.record_reclaimed(count);
        for (key, _) in &stale {
            log::info!("Reclaiming idle or broken connection to {}", key);
        }
        close_all(stale).await;
        count
    }

    /// Snapshot of cache activity
    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.read();
        let leased = state.entries.values().filter(|entry| entry.in_use).count();
        self.inner.counters.snapshot(state.entries.len(), leased)
    }

    /// Stop the idle sweep and close every cached connection
    ///
    /// Outstanding leases close their transport when they come back. Later
    /// acquires fail with `LinkError::Shutdown`.
    pub async fn shutdown(&self) {
        let sweeper = self.inner.sweeper.lock().take();
        if let Some(task) = sweeper {
            task.abort();
        }

        let drained: Stale<TransportOf<C>> = {
            let mut state = self.inner.state.write();
            state.shut_down = true;
            state
                .entries
                .drain()
                .filter_map(|(key, entry)| entry.transport.map(|t| (key, t)))
                .collect()
        };
        log::info!("Connection cache shut down, closing {} connections", drained.len());
        close_all(drained).await;
    }
}

async fn sweep_loop<C: Connector>(inner: Weak<CacheInner<C>>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let reclaimed = ConnectionCache { inner }.sweep().await;
        if reclaimed > 0 {
            log::debug!("Idle sweep reclaimed {} connections", reclaimed);
        }
    }
}

fn connect_error(key: &EndpointKey, err: LinkError) -> LinkError {
    match err {
        LinkError::Timeout => LinkError::Connect {
            key: key.clone(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        },
        LinkError::Connection(source) => LinkError::Connect {
            key: key.clone(),
            source,
        },
        other => other,
    }
}

async fn close_transport<T: StreamAccessor>(key: &EndpointKey, transport: &mut T) {
    if let Err(e) = transport.close().await {
        log::warn!("Error closing connection to {}: {}", key, e);
    }
}

async fn close_all<T: StreamAccessor>(stale: Stale<T>) {
    for (key, mut transport) in stale {
        close_transport(&key, &mut transport).await;
    }
}

/// Exclusive lease on the cached transport of one endpoint key
///
/// Derefs to the transport. Releasing or dropping the lease hands the
/// transport back to the cache; `release` additionally closes a transport the
/// cache refuses, dropping just lets it go.
pub struct Lease<C: Connector> {
    cache: Arc<CacheInner<C>>,
    key: EndpointKey,
    generation: u64,
    transport: ManuallyDrop<TransportOf<C>>,
    returned: bool,
}

impl<C: Connector> Lease<C> {
    fn new(
        cache: Arc<CacheInner<C>>,
        key: EndpointKey,
        generation: u64,
        transport: TransportOf<C>,
    ) -> Self {
        Self {
            cache,
            key,
            generation,
            transport: ManuallyDrop::new(transport),
            returned: false,
        }
    }

    /// Endpoint key this lease belongs to
    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    /// Hand the transport back to the cache
    pub async fn release(mut self) {
        match self.hand_back() {
            Some(mut refused) => {
                log::debug!("Closing released connection to {}", self.key);
                close_transport(&self.key, &mut refused).await;
            }
            None => log::debug!("Released connection to {}", self.key),
        }
    }

    /// Move the transport into the cache, getting it back if refused
    ///
    /// Runs once per lease, from `release` or `drop`, both of which consume
    /// the lease.
    fn hand_back(&mut self) -> Option<TransportOf<C>> {
        debug_assert!(!self.returned);
        self.returned = true;
        // SAFETY: `returned` is set before the take and checked by `drop`, so
        // the transport is taken once. Both callers own the lease, so no
        // Deref borrow can observe the emptied field.
        let transport = unsafe { ManuallyDrop::take(&mut self.transport) };
        self.cache.give_back(&self.key, self.generation, transport)
    }
}

impl<C: Connector> Deref for Lease<C> {
    type Target = TransportOf<C>;

    fn deref(&self) -> &Self::Target {
        &self.transport
    }
}

impl<C: Connector> DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.transport
    }
}

impl<C: Connector> Drop for Lease<C> {
    fn drop(&mut self) {
        if !self.returned && self.hand_back().is_some() {
            log::debug!("Dropped connection to {}", self.key);
        }
    }
}

impl<C: Connector> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Clone, Default)]
    struct MockHandle {
        closed: Arc<AtomicBool>,
        gone: Arc<AtomicBool>,
    }

    impl MockHandle {
        fn hang_up(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_gone(&self) -> bool {
            self.gone.load(Ordering::SeqCst)
        }
    }

    #[derive(Debug)]
    struct MockTransport {
        id: usize,
        handle: MockHandle,
    }

    impl Drop for MockTransport {
        fn drop(&mut self) {
            self.handle.gone.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl StreamAccessor for MockTransport {
        async fn set_timeout(&mut self, _timeout: Option<Duration>) -> LinkResult<()> {
            Ok(())
        }

        async fn read(&mut self, _buf: &mut [u8]) -> LinkResult<usize> {
            Ok(0)
        }

        async fn write(&mut self, buf: &[u8]) -> LinkResult<usize> {
            Ok(buf.len())
        }

        async fn flush(&mut self) -> LinkResult<()> {
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.handle.closed.load(Ordering::SeqCst)
        }

        async fn close(&mut self) -> LinkResult<()> {
            self.handle.closed.store(true, Ordering::SeqCst);
            self.handle.gone.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockState {
        attempts: AtomicUsize,
        opened: AtomicUsize,
        timeouts_left: AtomicUsize,
        hang_next: AtomicBool,
        handles: parking_lot::Mutex<Vec<MockHandle>>,
    }

    #[derive(Clone, Default)]
    struct MockConnector {
        state: Arc<MockState>,
    }

    impl MockConnector {
        fn attempts(&self) -> usize {
            self.state.attempts.load(Ordering::SeqCst)
        }

        fn opened(&self) -> usize {
            self.state.opened.load(Ordering::SeqCst)
        }

        fn handle(&self, id: usize) -> MockHandle {
            self.state.handles.lock()[id].clone()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Transport = MockTransport;

        async fn connect(&self, _key: &EndpointKey) -> LinkResult<MockTransport> {
            self.state.attempts.fetch_add(1, Ordering::SeqCst);
            if self.state.hang_next.swap(false, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let timeouts_left = self.state.timeouts_left.load(Ordering::SeqCst);
            if timeouts_left > 0 {
                self.state.timeouts_left.store(timeouts_left - 1, Ordering::SeqCst);
                return Err(LinkError::Timeout);
            }

            let handle = MockHandle::default();
            self.state.handles.lock().push(handle.clone());
            Ok(MockTransport {
                id: self.state.opened.fetch_add(1, Ordering::SeqCst),
                handle,
            })
        }
    }

    fn key() -> EndpointKey {
        EndpointKey::new("10.0.0.5", 502)
    }

    fn settings() -> CacheSettings {
        CacheSettings::new(Duration::from_millis(1000)).with_poll_interval(Duration::from_millis(200))
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuse_after_release() {
        let connector = MockConnector::default();
        let cache = ConnectionCache::new(settings(), connector.clone());

        let lease = cache.acquire(&key()).await.unwrap();
        let first = lease.id;
        cache.release(lease).await;

        let lease = cache.acquire(&key()).await.unwrap();
        assert_eq!(lease.id, first);
        assert_eq!(connector.opened(), 1);

        let stats = cache.stats();
        assert_eq!(stats.tracked_keys, 1);
        assert_eq!(stats.leased, 1);
        assert_eq!(stats.opened, 1);
        assert_eq!(stats.reused, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_returns_transport_once() {
        let connector = MockConnector::default();
        let cache = ConnectionCache::new(settings(), connector.clone());

        let mut lease = cache.acquire(&key()).await.unwrap();
        lease.write_all(&[0x01, 0x03]).await.unwrap();
        drop(lease);
        assert!(!connector.handle(0).is_gone());
        assert_eq!(cache.stats().leased, 0);

        let lease = cache.acquire(&key()).await.unwrap();
        assert_eq!(lease.id, 0);
        lease.release().await;
        assert!(!connector.handle(0).is_gone());

        let stats = cache.stats();
        assert_eq!(stats.tracked_keys, 1);
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.reclaimed, 0);

        let lease = cache.acquire(&key()).await.unwrap();
        assert_eq!(lease.id, 0);
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_connection_replaced() {
        let connector = MockConnector::default();
        let cache = ConnectionCache::new(settings(), connector.clone());

        let mut lease = cache.acquire(&key()).await.unwrap();
        lease.close().await.unwrap();
        drop(lease);
        assert_eq!(cache.stats().tracked_keys, 0);

        let lease = cache.acquire(&key()).await.unwrap();
        assert_eq!(lease.id, 1);
        assert_eq!(cache.stats().reclaimed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_replaced_on_acquire() {
        let connector = MockConnector::default();
        let settings = CacheSettings::new(Duration::from_millis(100)).with_idle_multiplier(2);
        let cache = ConnectionCache::new(settings, connector.clone());

        let lease = cache.acquire(&key()).await.unwrap();
        drop(lease);
        tokio::time::sleep(Duration::from_millis(250)).await;

        let lease = cache.acquire(&key()).await.unwrap();
        assert_eq!(lease.id, 1);
        assert!(connector.handle(0).is_gone());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_reclaims_idle_keys() {
        let connector = MockConnector::default();
        let settings = CacheSettings::new(Duration::from_millis(100)).with_idle_multiplier(1);
        let cache = ConnectionCache::new(settings, connector.clone());

        let lease = cache.acquire(&key()).await.unwrap();
        drop(lease);
        tokio::time::sleep(Duration::from_millis(350)).await;

        assert_eq!(cache.stats().tracked_keys, 0);
        assert!(connector.handle(0).is_gone());

        let lease = cache.acquire(&key()).await.unwrap();
        assert_eq!(lease.id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_skips_leased_keys() {
        let connector = MockConnector::default();
        let cache = ConnectionCache::new(settings(), connector.clone());
        let other = EndpointKey::new("10.0.0.6", 502);

        let lease = cache.acquire(&key()).await.unwrap();
        let idle = cache.acquire(&other).await.unwrap();
        drop(idle);

        connector.handle(0).hang_up();
        connector.handle(1).hang_up();
        assert_eq!(cache.sweep().await, 1);
        assert_eq!(cache.stats().tracked_keys, 1);
        assert!(connector.handle(1).is_gone());
        assert!(!connector.handle(0).is_gone());

        drop(lease);
        assert_eq!(cache.stats().tracked_keys, 0);
        assert!(connector.handle(0).is_gone());
    }

    #[tokio::test(start_paused = true)]
    async fn test_contention_error_after_polls() {
        let connector = MockConnector::default();
        let cache = ConnectionCache::new(settings(), connector.clone());

        let _held = cache.acquire(&key()).await.unwrap();
        let started = Instant::now();
        let err = cache.acquire(&key()).await.unwrap_err();

        assert!(matches!(err, LinkError::NoAvailableConnection { polls: 5, .. }));
        assert!(!err.is_transport());
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(cache.stats().contention_failures, 1);
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_same_connection_after_release() {
        let connector = MockConnector::default();
        let cache = ConnectionCache::new(settings(), connector.clone());

        let lease = cache.acquire(&key()).await.unwrap();
        let first = lease.id;
        let holder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(lease);
        });

        let second = cache.acquire(&key()).await.unwrap();
        assert_eq!(second.id, first);
        holder.await.unwrap();
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leases_never_overlap() {
        let connector = MockConnector::default();
        let settings = CacheSettings::new(Duration::from_secs(10)).with_poll_interval(Duration::from_millis(5));
        let cache = ConnectionCache::new(settings, connector.clone());
        let busy = Arc::new(AtomicBool::new(false));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let busy = busy.clone();
            tasks.push(tokio::spawn(async move {
                let lease = cache.acquire(&key()).await.unwrap();
                assert!(!busy.swap(true, Ordering::SeqCst), "two leases at once");
                tokio::time::sleep(Duration::from_millis(20)).await;
                busy.store(false, Ordering::SeqCst);
                drop(lease);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_retried_once() {
        let connector = MockConnector::default();
        connector.state.timeouts_left.store(1, Ordering::SeqCst);
        let cache = ConnectionCache::new(settings(), connector.clone());

        assert!(cache.acquire(&key()).await.is_ok());
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_twice_is_connect_error() {
        let connector = MockConnector::default();
        connector.state.timeouts_left.store(2, Ordering::SeqCst);
        let cache = ConnectionCache::new(settings(), connector.clone());

        match cache.acquire(&key()).await.unwrap_err() {
            LinkError::Connect { key: failed, source } => {
                assert_eq!(failed, key());
                assert_eq!(source.kind(), std::io::ErrorKind::TimedOut);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(connector.attempts(), 2);
        assert_eq!(cache.stats().tracked_keys, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_connect_frees_slot() {
        let connector = MockConnector::default();
        connector.state.hang_next.store(true, Ordering::SeqCst);
        let cache = ConnectionCache::new(settings(), connector.clone());

        let cancelled = tokio::time::timeout(Duration::from_millis(500), cache.acquire(&key())).await;
        assert!(cancelled.is_err());
        assert_eq!(cache.stats().tracked_keys, 0);

        let lease = cache.acquire(&key()).await.unwrap();
        assert_eq!(lease.id, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_leased() {
        let connector = MockConnector::default();
        let cache = ConnectionCache::new(settings(), connector.clone());

        let lease = cache.acquire(&key()).await.unwrap();
        assert!(cache.close(&key()).await);
        assert!(!connector.handle(0).is_gone());

        lease.release().await;
        assert!(connector.handle(0).is_gone());

        let lease = cache.acquire(&key()).await.unwrap();
        assert_eq!(lease.id, 1);
        assert!(!cache.close(&EndpointKey::new("10.9.9.9", 1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_least_recently_used() {
        let connector = MockConnector::default();
        let cache = ConnectionCache::new(settings().with_max_keys(1), connector.clone());
        let second = EndpointKey::new("10.0.0.6", 502);

        drop(cache.acquire(&key()).await.unwrap());
        let lease = cache.acquire(&second).await.unwrap();
        assert!(connector.handle(0).is_gone());
        assert_eq!(cache.stats().tracked_keys, 1);

        let err = cache.acquire(&key()).await.unwrap_err();
        assert!(matches!(err, LinkError::CacheFull { max_keys: 1 }));
        drop(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_and_rejects() {
        let connector = MockConnector::default();
        let cache = ConnectionCache::new(settings(), connector.clone());

        drop(cache.acquire(&key()).await.unwrap());
        cache.shutdown().await;

        assert!(connector.handle(0).is_gone());
        assert!(matches!(cache.acquire(&key()).await, Err(LinkError::Shutdown)));
    }
}
