//! Capture counters.
//!
//! Every failure on the capture path ends up here instead of in producer
//! code. Counters are relaxed atomics; readers take a snapshot.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Ring buffer counters.
#[derive(Debug, Default)]
pub struct RingStats {
    /// Slots successfully reserved.
    pub reserved: AtomicU64,
    /// Slots committed with data.
    pub committed: AtomicU64,
    /// Events dropped because the ring was full or contended.
    pub dropped: AtomicU64,
    /// Reserved slots released without data.
    pub abandoned: AtomicU64,
    /// Entries handed to consumers.
    pub drained: AtomicU64,
    /// Reservations that gave up after exhausting CAS retries.
    pub contended: AtomicU64,
}

impl RingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RingStatsSnapshot {
        RingStatsSnapshot {
            reserved: self.reserved.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
        }
    }

    #[inline(always)]
    pub(crate) fn record_reserved(&self) {
        self.reserved.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_contended(&self) {
        self.contended.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_drained(&self, n: u64) {
        self.drained.fetch_add(n, Ordering::Relaxed);
    }
}

/// Snapshot of ring statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RingStatsSnapshot {
    pub reserved: u64,
    pub committed: u64,
    pub dropped: u64,
    pub abandoned: u64,
    pub drained: u64,
    pub contended: u64,
}

impl RingStatsSnapshot {
    /// Drop rate as a percentage of reservation attempts.
    pub fn drop_rate(&self) -> f64 {
        let total = self.reserved + self.dropped;
        if total == 0 {
            0.0
        } else {
            (self.dropped as f64 / total as f64) * 100.0
        }
    }
}

/// Ingestor counters.
#[derive(Debug, Default)]
pub struct IngestStats {
    /// Events committed to a lane.
    pub accepted: AtomicU64,
    /// Events rejected by the emission plan.
    pub filtered: AtomicU64,
    /// Events rejected by the sampler.
    pub sampled_out: AtomicU64,
    /// Events lost to a full or contended lane.
    pub dropped: AtomicU64,
    /// Events that failed to encode.
    pub errors: AtomicU64,
    /// Events cut to the capture limits.
    pub truncated: AtomicU64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            sampled_out: self.sampled_out.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
        }
    }

    #[inline(always)]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of ingestor statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub accepted: u64,
    pub filtered: u64,
    pub sampled_out: u64,
    pub dropped: u64,
    pub errors: u64,
    pub truncated: u64,
}

impl IngestStatsSnapshot {
    /// Producer calls observed, whatever their outcome.
    pub fn total_attempts(&self) -> u64 {
        self.accepted + self.filtered + self.sampled_out + self.dropped + self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_drop_rate() {
        let stats = RingStats::new();
        assert_eq!(stats.snapshot().drop_rate(), 0.0);
        for _ in 0..3 {
            stats.record_reserved();
        }
        stats.record_dropped();
        assert!((stats.snapshot().drop_rate() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ingest_total_attempts() {
        let stats = IngestStats::new();
        IngestStats::bump(&stats.accepted);
        IngestStats::bump(&stats.filtered);
        IngestStats::bump(&stats.dropped);
        IngestStats::bump(&stats.truncated);
        assert_eq!(stats.snapshot().total_attempts(), 3);
    }
}
