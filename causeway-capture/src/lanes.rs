//! Bulk and priority lanes.
//!
//! Exit events must survive a burst that fills the bulk ring, so they get a
//! small ring of their own.
//!
//! A priority entry can overtake bulk entries its own source emitted
//! earlier. [`CaptureLanes::drain_split`] records how far the bulk lane
//! reached when the priority entries were taken; a consumer that holds each
//! priority entry until [`CaptureLanes::bulk_drained_through`] its mark
//! sees every source's events in emission order.

use crate::ring::{RingBuffer, RingConfig, SlotHandle};
use crate::stats::RingStatsSnapshot;
use causeway_core::{CaptureConfig, CaptureError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which lane an event travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Bulk,
    Priority,
}

/// Paired rings shared by producers and the writer pool.
#[derive(Debug)]
pub struct CaptureLanes {
    bulk: RingBuffer,
    priority: RingBuffer,
    priority_dropped: AtomicU64,
}

impl CaptureLanes {
    /// Build both rings from the capture section. Slots are sized to the
    /// largest event the capture limits allow.
    pub fn new(config: &CaptureConfig) -> Self {
        let slot_size = config.limits().max_event_size();
        let base = |capacity| {
            RingConfig::new(capacity, slot_size)
                .with_overflow(config.overflow)
                .with_reserve_retries(config.reserve_retries)
        };
        Self::from_rings(
            RingBuffer::new(base(config.ring_capacity)),
            RingBuffer::new(base(config.priority_capacity)),
        )
    }

    pub fn from_rings(bulk: RingBuffer, priority: RingBuffer) -> Self {
        Self {
            bulk,
            priority,
            priority_dropped: AtomicU64::new(0),
        }
    }

    pub fn lane(&self, lane: Lane) -> &RingBuffer {
        match lane {
            Lane::Bulk => &self.bulk,
            Lane::Priority => &self.priority,
        }
    }

    /// Reserve a slot on `lane`. Priority-lane failures are also counted
    /// in `priority_dropped`.
    #[inline]
    pub fn reserve(&self, lane: Lane) -> Result<SlotHandle<'_>, CaptureError> {
        let result = self.lane(lane).reserve_slot();
        if lane == Lane::Priority && result.is_err() {
            self.priority_dropped.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Drain up to `max_n` entries, priority lane first.
    ///
    /// Entries come out in lane order, not emission order. The writer pool
    /// uses [`CaptureLanes::drain_split`].
    pub fn drain_batch(&self, max_n: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::with_capacity(max_n.min(self.len()));
        let taken = self.priority.drain_into(max_n, &mut out);
        self.bulk.drain_into(max_n - taken, &mut out);
        out
    }

    /// Take up to `max_n` entries from each lane, keeping them apart.
    pub fn drain_split(&self, max_n: usize) -> LaneDrain {
        let mut priority = Vec::new();
        self.priority.drain_into(max_n, &mut priority);
        // Read after the priority entries were taken: every bulk slot their
        // producers reserved beforehand lies below this position.
        let bulk_mark = self.bulk.tail_position();
        let bulk = self.bulk.drain_batch(max_n);
        LaneDrain {
            priority,
            bulk,
            bulk_mark,
        }
    }

    /// Whether every bulk slot below `mark` has been drained.
    #[inline]
    pub fn bulk_drained_through(&self, mark: u64) -> bool {
        self.bulk.head_position() >= mark
    }

    pub fn len(&self) -> usize {
        self.bulk.len() + self.priority.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bulk.is_empty() && self.priority.is_empty()
    }

    pub fn stats(&self) -> LaneStatsSnapshot {
        LaneStatsSnapshot {
            bulk: self.bulk.stats(),
            priority: self.priority.stats(),
            priority_dropped: self.priority_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Raw entries from one [`CaptureLanes::drain_split`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LaneDrain {
    pub priority: Vec<Vec<u8>>,
    pub bulk: Vec<Vec<u8>>,
    /// Bulk tail observed right after the priority entries were taken.
    pub bulk_mark: u64,
}

impl LaneDrain {
    pub fn len(&self) -> usize {
        self.priority.len() + self.bulk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.bulk.is_empty()
    }
}

/// Snapshot of both lanes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaneStatsSnapshot {
    pub bulk: RingStatsSnapshot,
    pub priority: RingStatsSnapshot,
    pub priority_dropped: u64,
}

impl LaneStatsSnapshot {
    /// Drops across both lanes.
    pub fn dropped(&self) -> u64 {
        self.bulk.dropped + self.priority.dropped
    }

    pub fn abandoned(&self) -> u64 {
        self.bulk.abandoned + self.priority.abandoned
    }
}
