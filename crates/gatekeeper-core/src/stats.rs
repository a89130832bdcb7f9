//! Counters for the lock policy subsystem.
//!
//! Remote failures never fail a filesystem call, so these counters (plus the
//! `warn!` logs next to each increment) are the only place where a degraded
//! catalog connection becomes visible. All counters are lock-free atomics.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Live policy statistics, shared via `Arc`.
#[derive(Debug, Default)]
pub struct PolicyStats {
    /// open/read/write calls refused because the file is locked.
    pub access_denied: AtomicU64,
    /// Catalog events accepted into the notifier queue.
    pub notifications_queued: AtomicU64,
    /// Catalog events dropped because the queue was full.
    pub notifications_dropped: AtomicU64,
    /// Catalog calls that succeeded.
    pub remote_ok: AtomicU64,
    /// Catalog calls that failed (transport, status or decode).
    pub remote_failed: AtomicU64,
    /// Reconciliation cycles that completed the fetch.
    pub cycles_completed: AtomicU64,
    /// Reconciliation cycles that ended early.
    pub cycles_failed: AtomicU64,
    /// Local-only files uploaded by the reconciler.
    pub files_uploaded: AtomicU64,
    /// Ghost rows deleted by the reconciler.
    pub ghosts_removed: AtomicU64,
    last_sync: RwLock<Option<SystemTime>>,
}

impl PolicyStats {
    /// Creates zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_denied(&self) {
        self.access_denied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_queued(&self) {
        self.notifications_queued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped(&self) {
        self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_remote_ok(&self) {
        self.remote_ok.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_remote_failed(&self) {
        self.remote_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a cycle whose fetch succeeded and stamps the sync time.
    pub fn record_cycle_completed(&self) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        *self.last_sync.write() = Some(SystemTime::now());
    }

    #[inline]
    pub fn record_cycle_failed(&self) {
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_uploaded(&self) {
        self.files_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ghost_removed(&self) {
        self.ghosts_removed.fetch_add(1, Ordering::Relaxed);
    }

    /// Time of the last cycle that fetched the catalog successfully.
    pub fn last_sync(&self) -> Option<SystemTime> {
        *self.last_sync.read()
    }

    /// Returns true if the lock map is older than `max_age`, or was never
    /// fetched at all.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        match self.last_sync() {
            Some(at) => at.elapsed().is_ok_and(|age| age > max_age),
            None => true,
        }
    }

    /// Copies the current values.
    pub fn snapshot(&self) -> PolicyStatsSnapshot {
        PolicyStatsSnapshot {
            access_denied: self.access_denied.load(Ordering::Relaxed),
            notifications_queued: self.notifications_queued.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            remote_ok: self.remote_ok.load(Ordering::Relaxed),
            remote_failed: self.remote_failed.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            files_uploaded: self.files_uploaded.load(Ordering::Relaxed),
            ghosts_removed: self.ghosts_removed.load(Ordering::Relaxed),
            last_sync_unix_secs: self
                .last_sync()
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
        }
    }
}

/// Point-in-time copy of [`PolicyStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PolicyStatsSnapshot {
    pub access_denied: u64,
    pub notifications_queued: u64,
    pub notifications_dropped: u64,
    pub remote_ok: u64,
    pub remote_failed: u64,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub files_uploaded: u64,
    pub ghosts_removed: u64,
    pub last_sync_unix_secs: Option<u64>,
}
