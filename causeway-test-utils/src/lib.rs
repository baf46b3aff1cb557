//! Causeway Test Utilities
//!
//! Shared test infrastructure for the Causeway workspace:
//! - Proptest generators for events and configuration
//! - Scripted event sequences for the correlation scenarios
//! - A store wrapper that injects saturation
//! - Assertions over correlation results

pub use causeway_storage::{EventStore, HotStore};

pub use causeway_core::{
    CausewayConfig, CorrelationId, Digest, Event, EventFlags, EventId, EventKind, SourceId,
    StorageError, TimeRange, Timestamp,
};

use causeway_storage::{PruneReport, RetentionWindow, WriteReport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

// ============================================================================
// FLAKY STORE
// ============================================================================

/// Hot store that refuses the first `failures` batch writes with
/// `Saturated`, and any batch larger than `max_batch`.
#[derive(Debug)]
pub struct FlakyStore {
    inner: HotStore,
    failures_left: AtomicUsize,
    max_batch: usize,
    /// Sizes of every batch attempted, accepted or not.
    attempts: Mutex<Vec<usize>>,
}

impl FlakyStore {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: HotStore::new(),
            failures_left: AtomicUsize::new(failures),
            max_batch: usize::MAX,
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn attempts(&self) -> Vec<usize> {
        self.attempts.lock().clone()
    }

    pub fn inner(&self) -> &HotStore {
        &self.inner
    }
}

impl EventStore for FlakyStore {
    fn write_batch(&self, events: Vec<Event>) -> Result<WriteReport, StorageError> {
        self.attempts.lock().push(events.len());
        let failing = self
            .failures_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing || events.len() > self.max_batch {
            return Err(StorageError::Saturated { waited_ms: 0 });
        }
        self.inner.write_batch(events)
    }

    fn get(&self, id: EventId) -> Result<Event, StorageError> {
        self.inner.get(id)
    }

    fn get_by_source(&self, source: SourceId, range: TimeRange) -> Result<Vec<Event>, StorageError> {
        self.inner.get_by_source(source, range)
    }

    fn get_by_correlation(&self, correlation: CorrelationId) -> Result<Vec<Event>, StorageError> {
        self.inner.get_by_correlation(correlation)
    }

    fn latest_state_change(
        &self,
        source: SourceId,
        at: Timestamp,
    ) -> Result<Option<Event>, StorageError> {
        self.inner.latest_state_change(source, at)
    }

    fn prune(&self, window: &RetentionWindow, now: Timestamp) -> Result<PruneReport, StorageError> {
        self.inner.prune(window, now)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Causeway types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_source_id() -> impl Strategy<Value = SourceId> {
        (0u64..64).prop_map(SourceId)
    }

    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (0u64..1_000_000_000).prop_map(Timestamp)
    }

    pub fn arb_digest() -> impl Strategy<Value = Digest> {
        prop::collection::vec(any::<u8>(), 0..48).prop_map(|bytes| Digest::capture(&bytes, 32))
    }

    pub fn arb_name() -> impl Strategy<Value = String> {
        "[a-z_][a-z0-9_]{0,24}"
    }

    pub fn arb_event_kind() -> impl Strategy<Value = EventKind> {
        prop_oneof![
            (any::<u64>(), arb_name(), arb_name(), 0u8..8, arb_digest()).prop_map(
                |(call, module, function, arity, args)| {
                    EventKind::function_entry(call, module, function, arity, args)
                }
            ),
            (any::<u64>(), arb_digest(), 0u64..1_000_000).prop_map(|(call, result, nanos)| {
                EventKind::function_exit(call, result, Duration::from_nanos(nanos))
            }),
            (arb_name(), arb_digest(), arb_digest())
                .prop_map(|(cb, before, after)| EventKind::state_change(cb, before, after)),
            (any::<u64>(), arb_source_id(), arb_digest())
                .prop_map(|(m, to, d)| EventKind::message_send(m, to, d)),
            (any::<u64>(), arb_source_id(), arb_digest())
                .prop_map(|(m, from, d)| EventKind::message_receive(m, from, d)),
            (arb_source_id(), arb_source_id())
                .prop_map(|(parent, child)| EventKind::unit_spawn(parent, child)),
            arb_digest().prop_map(EventKind::unit_exit),
        ]
    }

    /// An uncorrelated event as it leaves the ring.
    pub fn arb_event() -> impl Strategy<Value = Event> {
        (
            1u64..u64::MAX,
            arb_timestamp(),
            arb_source_id(),
            arb_event_kind(),
            prop::collection::vec(any::<u8>(), 0..64),
        )
            .prop_map(|(id, ts, source, kind, payload)| {
                Event::new(EventId(id), ts, source, kind).with_payload(payload)
            })
    }

    /// A well-nested call tree on one source, as a script of entries and
    /// exits. Each element is `Some(call_id)` for an entry or `None` for the
    /// exit of the innermost open call.
    pub fn arb_call_script(max_depth: usize) -> impl Strategy<Value = Vec<Option<u64>>> {
        prop::collection::vec(any::<bool>(), 0..64).prop_map(move |steps| {
            let mut script = Vec::new();
            let mut depth = 0usize;
            let mut next_call = 1u64;
            for push in steps {
                if push && depth < max_depth {
                    script.push(Some(next_call));
                    next_call += 1;
                    depth += 1;
                } else if depth > 0 {
                    script.push(None);
                    depth -= 1;
                }
            }
            script.extend(std::iter::repeat(None).take(depth));
            script
        })
    }

    /// Configuration that passes validation.
    pub fn arb_valid_config() -> impl Strategy<Value = CausewayConfig> {
        (4u32..14, 1usize..8, 1usize..16, 1usize..1024).prop_map(
            |(ring_bits, writers, shards, batch)| {
                let mut config = CausewayConfig::default();
                config.capture.ring_capacity = 1 << ring_bits;
                config.writer.workers = writers;
                config.writer.drain_batch_size = batch;
                config.correlator.shards = shards;
                config
            },
        )
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Scripted event sequences with increasing ids and timestamps.

    use super::*;

    /// Builds events the way the capture layer would stamp them.
    #[derive(Debug, Default)]
    pub struct EventScript {
        events: Vec<Event>,
        next_id: u64,
        now: u64,
    }

    impl EventScript {
        pub fn new() -> Self {
            Self {
                events: Vec::new(),
                next_id: 1,
                now: 1_000,
            }
        }

        /// Advance the script clock.
        pub fn wait(&mut self, nanos: u64) -> &mut Self {
            self.now += nanos;
            self
        }

        pub fn push(&mut self, source: u64, kind: EventKind) -> EventId {
            let id = EventId(self.next_id);
            self.next_id += 1;
            self.now += 10;
            self.events
                .push(Event::new(id, Timestamp(self.now), SourceId(source), kind));
            id
        }

        pub fn entry(&mut self, source: u64, call_id: u64, function: &str) -> EventId {
            self.push(
                source,
                EventKind::function_entry(call_id, "app", function, 0, Digest::empty()),
            )
        }

        pub fn exit(&mut self, source: u64, call_id: u64) -> EventId {
            self.push(
                source,
                EventKind::function_exit(call_id, Digest::empty(), Duration::from_nanos(10)),
            )
        }

        pub fn state(&mut self, source: u64, callback: &str, after: &[u8]) -> EventId {
            self.push(
                source,
                EventKind::state_change(callback, Digest::empty(), Digest::capture(after, 64)),
            )
        }

        pub fn send(&mut self, from: u64, to: u64, message_id: u64) -> EventId {
            self.push(
                from,
                EventKind::message_send(message_id, SourceId(to), Digest::from("msg")),
            )
        }

        pub fn receive(&mut self, at: u64, from: u64, message_id: u64) -> EventId {
            self.push(
                at,
                EventKind::message_receive(message_id, SourceId(from), Digest::from("msg")),
            )
        }

        pub fn spawn(&mut self, parent: u64, child: u64) -> EventId {
            self.push(parent, EventKind::unit_spawn(SourceId(parent), SourceId(child)))
        }

        pub fn unit_exit(&mut self, source: u64, reason: &str) -> EventId {
            self.push(source, EventKind::unit_exit(Digest::from(reason)))
        }

        pub fn events(&self) -> &[Event] {
            &self.events
        }

        pub fn build(self) -> Vec<Event> {
            self.events
        }
    }

    /// `depth` nested calls on `source`, then their exits innermost first.
    pub fn nested_calls(source: u64, depth: u64) -> Vec<Event> {
        let mut script = EventScript::new();
        for call in 1..=depth {
            script.entry(source, call, &format!("level_{}", call));
        }
        for call in (1..=depth).rev() {
            script.exit(source, call);
        }
        script.build()
    }

    /// Source 1 sends message 7 to source 2, which receives it.
    pub fn message_exchange() -> Vec<Event> {
        let mut script = EventScript::new();
        script.send(1, 2, 7);
        script.receive(2, 1, 7);
        script.build()
    }

    /// A small configuration suited to in-process tests.
    pub fn test_config() -> CausewayConfig {
        let mut config = CausewayConfig::default();
        config.capture.ring_capacity = 1024;
        config.writer.workers = 2;
        config.writer.drain_batch_size = 64;
        config.writer.idle_backoff_ms = 1;
        config.correlator.shards = 4;
        config
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over correlated events.

    use super::*;

    #[track_caller]
    pub fn assert_parent(event: &Event, parent: EventId) {
        assert_eq!(
            event.parent_id,
            Some(parent),
            "Expected {} to have parent {}, got {:?}",
            event.id,
            parent,
            event.parent_id
        );
    }

    #[track_caller]
    pub fn assert_root(event: &Event) {
        assert_eq!(event.parent_id, None, "Expected {} to have no parent", event.id);
    }

    #[track_caller]
    pub fn assert_correlation(event: &Event, correlation: CorrelationId) {
        assert_eq!(
            event.correlation_id,
            Some(correlation),
            "Wrong correlation on {}",
            event.id
        );
    }

    #[track_caller]
    pub fn assert_flagged(event: &Event, flags: EventFlags) {
        assert!(
            event.flags.contains(flags),
            "Expected {} to carry {:?}, got {:?}",
            event.id,
            flags,
            event.flags
        );
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &Result<T, StorageError>, id: EventId) {
        match result {
            Err(StorageError::NotFound { id: missing }) => assert_eq!(*missing, id),
            other => panic!("Expected NotFound for {}, got: {:?}", id, other),
        }
    }

    #[track_caller]
    pub fn assert_saturated<T: std::fmt::Debug>(result: &Result<T, StorageError>) {
        match result {
            Err(StorageError::Saturated { .. }) => {}
            other => panic!("Expected Saturated, got: {:?}", other),
        }
    }

    /// Ids strictly increasing in slice order.
    #[track_caller]
    pub fn assert_ids_ascending(events: &[Event]) {
        for pair in events.windows(2) {
            assert!(
                pair[0].id < pair[1].id,
                "Ids out of order: {} before {}",
                pair[0].id,
                pair[1].id
            );
        }
    }
}
