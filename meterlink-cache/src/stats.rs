//! Connection cache statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of connection cache activity
///
/// Counters are cumulative since the cache was created; `tracked_keys` and
/// `leased` describe the moment the snapshot was taken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Endpoint keys currently tracked
    pub tracked_keys: usize,
    /// Endpoint keys currently leased (including connects in progress)
    pub leased: usize,
    /// Connections opened
    pub opened: u64,
    /// Acquisitions served by an already-open connection
    pub reused: u64,
    /// Connections closed because they were invalid, idle or evicted
    pub reclaimed: u64,
    /// Acquisitions that gave up waiting for a leased key
    pub contention_failures: u64,
}

/// Live counters behind `CacheStats`
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    opened: AtomicU64,
    reused: AtomicU64,
    reclaimed: AtomicU64,
    contention_failures: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn record_opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reused(&self) {
        self.reused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reclaimed(&self, count: usize) {
        self.reclaimed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_contention(&self) {
        self.contention_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, tracked_keys: usize, leased: usize) -> CacheStats {
        CacheStats {
            tracked_keys,
            leased,
            opened: self.opened.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            contention_failures: self.contention_failures.load(Ordering::Relaxed),
        }
    }
}
