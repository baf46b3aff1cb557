//! Writer pool counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub(crate) drained: AtomicU64,
    pub(crate) malformed: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) undeliverable: AtomicU64,
    pub(crate) stored: AtomicU64,
    pub(crate) duplicates: AtomicU64,
    pub(crate) store_retries: AtomicU64,
    pub(crate) store_failed: AtomicU64,
    pub(crate) restarts: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            drained: self.drained.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            undeliverable: self.undeliverable.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            store_retries: self.store_retries.load(Ordering::Relaxed),
            store_failed: self.store_failed.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    /// Raw entries taken from the lanes.
    pub drained: u64,
    pub malformed: u64,
    pub dispatched: u64,
    /// Events whose shard channel was already closed.
    pub undeliverable: u64,
    pub stored: u64,
    pub duplicates: u64,
    pub store_retries: u64,
    /// Events rejected by the store with a non-pressure error.
    pub store_failed: u64,
    pub restarts: u64,
}

impl PipelineStatsSnapshot {
    /// Events lost after leaving the ring.
    pub fn lost(&self) -> u64 {
        self.malformed + self.undeliverable + self.store_failed
    }
}
