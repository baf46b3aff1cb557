//! Lock-free multi-producer multi-consumer byte ring.
//!
//! Slots are pre-allocated byte buffers sized to the largest encoded event.
//! Each slot carries a sequence number that doubles as its ready flag:
//!
//! ```text
//! seq == pos          free, a producer at `pos` may claim it
//! seq == pos + 1      published (data or abandoned), a consumer may take it
//! seq == pos + cap    released, free for the next lap
//! ```
//!
//! The published and released states only differ with two or more slots,
//! so capacity is never below 2.
//!
//! Producers claim positions by CAS on `tail`, consumers by CAS on `head`.
//! A consumer only advances onto a published slot, so it never sees a slot
//! that is still being written and stops at the first unpublished one.

use crate::stats::{RingStats, RingStatsSnapshot};
use causeway_core::{CaptureError, CodecError, OverflowPolicy};
use crossbeam_utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Length marker for a slot released without data.
const ABANDONED: u32 = u32::MAX;

const MIN_CAPACITY: usize = 2;

/// Ring sizing and overflow behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingConfig {
    /// Requested slot count, rounded up to a power of two of at least 2.
    pub capacity: usize,
    /// Bytes per slot.
    pub slot_size: usize,
    /// CAS attempts before a reservation gives up.
    pub reserve_retries: u32,
    pub overflow: OverflowPolicy,
}

impl RingConfig {
    pub fn new(capacity: usize, slot_size: usize) -> Self {
        Self {
            capacity,
            slot_size,
            reserve_retries: 1024,
            overflow: OverflowPolicy::DropNewest,
        }
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_reserve_retries(mut self, retries: u32) -> Self {
        self.reserve_retries = retries;
        self
    }
}

struct Slot {
    seq: AtomicU64,
    len: UnsafeCell<u32>,
    data: UnsafeCell<Box<[u8]>>,
}

/// Fixed-capacity staging ring between producers and the writer pool.
pub struct RingBuffer {
    slots: Box<[Slot]>,
    mask: u64,
    slot_size: usize,
    reserve_retries: u32,
    overflow: OverflowPolicy,
    /// Next position producers claim.
    tail: CachePadded<AtomicU64>,
    /// Next position consumers take.
    head: CachePadded<AtomicU64>,
    stats: RingStats,
}

// SAFETY: slot contents are only touched by the single producer or consumer
// that won the CAS for that position; the sequence number hands ownership
// over with release/acquire ordering.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("slot_size", &self.slot_size)
            .field("len", &self.len())
            .field("overflow", &self.overflow)
            .finish()
    }
}

/// Outcome of a single consumer attempt.
enum Pop {
    Empty,
    Abandoned,
    Entry(Vec<u8>),
}

impl RingBuffer {
    pub fn new(config: RingConfig) -> Self {
        let capacity = config.capacity.max(MIN_CAPACITY).next_power_of_two();
        let slots: Vec<Slot> = (0..capacity)
            .map(|i| Slot {
                seq: AtomicU64::new(i as u64),
                len: UnsafeCell::new(0),
                data: UnsafeCell::new(vec![0u8; config.slot_size].into_boxed_slice()),
            })
            .collect();

        Self {
            slots: slots.into_boxed_slice(),
            mask: (capacity - 1) as u64,
            slot_size: config.slot_size,
            reserve_retries: config.reserve_retries,
            overflow: config.overflow,
            tail: CachePadded::new(AtomicU64::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            stats: RingStats::new(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Approximate number of reserved-but-not-drained slots.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        (tail.saturating_sub(head) as usize).min(self.capacity())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RingStatsSnapshot {
        self.stats.snapshot()
    }

    /// Position the next reservation will claim. Every slot reserved before
    /// this call returned sits below it.
    #[inline]
    pub fn tail_position(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Position the next consumer will take. Every slot below it has been
    /// drained or skipped as abandoned.
    #[inline]
    pub fn head_position(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    #[inline]
    fn slot(&self, pos: u64) -> &Slot {
        &self.slots[(pos & self.mask) as usize]
    }

    /// Reserve a slot according to the overflow policy.
    ///
    /// Failures are counted as drops before they are returned.
    pub fn reserve_slot(&self) -> Result<SlotHandle<'_>, CaptureError> {
        let result = match self.overflow {
            OverflowPolicy::DropNewest => self.try_reserve(),
            OverflowPolicy::NoLoss { timeout_ms } => {
                self.reserve_waiting(Duration::from_millis(timeout_ms))
            }
        };
        match &result {
            Ok(_) => self.stats.record_reserved(),
            Err(CaptureError::Contended { .. }) => {
                self.stats.record_contended();
                self.stats.record_dropped();
            }
            Err(_) => self.stats.record_dropped(),
        }
        result
    }

    /// One bounded CAS loop. `Full` as soon as the slot at `tail` is still
    /// occupied from the previous lap.
    fn try_reserve(&self) -> Result<SlotHandle<'_>, CaptureError> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        let mut retries = 0u32;

        loop {
            let slot = self.slot(pos);
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as i64;

            if diff == 0 {
                match self.tail.compare_exchange(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        return Ok(SlotHandle {
                            ring: self,
                            slot,
                            pos,
                            published: false,
                        })
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Err(CaptureError::Full);
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }

            retries += 1;
            if retries > self.reserve_retries {
                return Err(CaptureError::Contended { retries });
            }
        }
    }

    /// Spin, then yield, while the ring is full, up to `timeout`.
    fn reserve_waiting(&self, timeout: Duration) -> Result<SlotHandle<'_>, CaptureError> {
        let backoff = Backoff::new();
        let mut deadline = None;
        loop {
            match self.try_reserve() {
                Err(CaptureError::Full) => {
                    let deadline = *deadline.get_or_insert_with(|| Instant::now() + timeout);
                    if Instant::now() >= deadline {
                        return Err(CaptureError::Full);
                    }
                    backoff.snooze();
                }
                other => return other,
            }
        }
    }

    fn try_pop(&self) -> Pop {
        let mut pos = self.head.load(Ordering::Relaxed);

        loop {
            let slot = self.slot(pos);
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as i64;

            if diff == 0 {
                match self.head.compare_exchange(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS at a published position
                        // gives this consumer the slot until seq is bumped.
                        let out = unsafe {
                            let len = *slot.len.get();
                            if len == ABANDONED {
                                None
                            } else {
                                let data = &*slot.data.get();
                                Some(data[..len as usize].to_vec())
                            }
                        };
                        slot.seq
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return match out {
                            Some(bytes) => Pop::Entry(bytes),
                            None => Pop::Abandoned,
                        };
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Pop::Empty;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Move up to `max_n` committed entries into `out`, skipping abandoned
    /// slots. Returns how many entries were appended.
    pub fn drain_into(&self, max_n: usize, out: &mut Vec<Vec<u8>>) -> usize {
        let start = out.len();
        while out.len() - start < max_n {
            match self.try_pop() {
                Pop::Empty => break,
                Pop::Abandoned => continue,
                Pop::Entry(bytes) => out.push(bytes),
            }
        }
        let n = out.len() - start;
        self.stats.record_drained(n as u64);
        n
    }

    /// Take up to `max_n` committed entries, in ring order.
    pub fn drain_batch(&self, max_n: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::with_capacity(max_n.min(self.len()));
        self.drain_into(max_n, &mut out);
        out
    }

    /// Copy `bytes` into a freshly reserved slot.
    pub fn push(&self, bytes: &[u8]) -> Result<(), CaptureError> {
        self.reserve_slot()?.commit(bytes)
    }
}

/// Exclusive write access to one reserved slot.
///
/// Dropping the handle without committing publishes the slot as abandoned,
/// so a producer that fails mid-write cannot wedge consumers.
pub struct SlotHandle<'a> {
    ring: &'a RingBuffer,
    slot: &'a Slot,
    pos: u64,
    published: bool,
}

impl SlotHandle<'_> {
    /// Bytes available in the slot.
    pub fn capacity(&self) -> usize {
        self.ring.slot_size
    }

    /// Copy `bytes` into the slot and publish it.
    pub fn commit(self, bytes: &[u8]) -> Result<(), CaptureError> {
        if bytes.len() > self.capacity() {
            return Err(CodecError::BufferTooSmall {
                needed: bytes.len(),
                available: self.capacity(),
            }
            .into());
        }
        self.commit_with(|buf| {
            buf[..bytes.len()].copy_from_slice(bytes);
            Ok::<_, CaptureError>(bytes.len())
        })
        .map(|_| ())
    }

    /// Let `write` fill the slot in place and publish the first `n` bytes it
    /// reports. If `write` fails the slot is abandoned.
    pub fn commit_with<F, E>(mut self, write: F) -> Result<usize, E>
    where
        F: FnOnce(&mut [u8]) -> Result<usize, E>,
    {
        // SAFETY: the reservation CAS gave this handle sole access until
        // the slot is published.
        let buf: &mut [u8] = unsafe { &mut *self.slot.data.get() };
        let n = write(buf)?.min(self.ring.slot_size);
        self.publish(n as u32);
        self.ring.stats.record_committed();
        Ok(n)
    }

    fn publish(&mut self, len: u32) {
        // SAFETY: see commit_with.
        unsafe {
            *self.slot.len.get() = len;
        }
        self.slot
            .seq
            .store(self.pos.wrapping_add(1), Ordering::Release);
        self.published = true;
    }
}

impl Drop for SlotHandle<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.publish(ABANDONED);
            self.ring.stats.record_abandoned();
        }
    }
}
