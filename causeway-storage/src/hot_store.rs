//! In-memory indexed event store.
//!
//! One `parking_lot::RwLock` guards the primary map and every secondary
//! index. A batch write or a prune updates all of them inside a single
//! write-lock critical section, so a reader never sees a secondary entry
//! without its primary record (or the reverse).

use crate::retention::{PruneReport, RetentionWindow};
use crate::{EventStore, WriteReport};
use causeway_core::{
    CorrelationId, Event, EventId, EventKind, SourceId, StorageError, TimeRange, Timestamp,
};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

type SourceKey = (SourceId, Timestamp, EventId);
type AgeKey = (Timestamp, EventId);

#[derive(Debug, Default)]
struct Indexes {
    primary: BTreeMap<EventId, Event>,
    by_source: BTreeSet<SourceKey>,
    by_correlation: HashMap<CorrelationId, BTreeSet<EventId>>,
    by_age: BTreeSet<AgeKey>,
    /// Subset of `by_source` holding only state changes.
    state_changes: BTreeSet<SourceKey>,
}

impl Indexes {
    fn insert(&mut self, event: Event) -> Result<(), StorageError> {
        if self.primary.contains_key(&event.id) {
            return Err(StorageError::Duplicate { id: event.id });
        }
        let source_key = (event.source_id, event.timestamp, event.id);
        self.by_source.insert(source_key);
        self.by_age.insert((event.timestamp, event.id));
        if let Some(c) = event.correlation_id {
            self.by_correlation.entry(c).or_default().insert(event.id);
        }
        if matches!(event.kind, EventKind::StateChange { .. }) {
            self.state_changes.insert(source_key);
        }
        self.primary.insert(event.id, event);
        Ok(())
    }

    fn remove(&mut self, id: EventId) -> Option<Event> {
        let event = self.primary.remove(&id)?;
        let source_key = (event.source_id, event.timestamp, event.id);
        self.by_source.remove(&source_key);
        self.by_age.remove(&(event.timestamp, event.id));
        self.state_changes.remove(&source_key);
        if let Some(c) = event.correlation_id {
            if let Some(ids) = self.by_correlation.get_mut(&c) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_correlation.remove(&c);
                }
            }
        }
        Some(event)
    }

    fn source_range(
        set: &BTreeSet<SourceKey>,
        source: SourceId,
        range: TimeRange,
    ) -> impl DoubleEndedIterator<Item = &SourceKey> {
        let lo = (source, range.start, EventId(0));
        let hi = (source, range.end, EventId(u64::MAX));
        set.range((Bound::Included(lo), Bound::Included(hi)))
    }
}

/// Store counters.
#[derive(Debug, Default)]
struct StoreCounters {
    written: AtomicU64,
    duplicates: AtomicU64,
    pruned: AtomicU64,
    saturated: AtomicU64,
}

/// Snapshot of store statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatsSnapshot {
    pub events: usize,
    pub written: u64,
    pub duplicates: u64,
    pub pruned: u64,
    pub saturated: u64,
}

/// Hot in-memory store.
#[derive(Debug)]
pub struct HotStore {
    indexes: RwLock<Indexes>,
    lock_timeout: Duration,
    counters: StoreCounters,
}

impl HotStore {
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(50);

    pub fn new() -> Self {
        Self::with_lock_timeout(Self::DEFAULT_LOCK_TIMEOUT)
    }

    /// Writers and readers give up with `Saturated` after `lock_timeout`.
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            indexes: RwLock::new(Indexes::default()),
            lock_timeout,
            counters: StoreCounters::default(),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Indexes>, StorageError> {
        self.indexes
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| self.saturated())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Indexes>, StorageError> {
        self.indexes
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| self.saturated())
    }

    fn saturated(&self) -> StorageError {
        self.counters.saturated.fetch_add(1, Ordering::Relaxed);
        StorageError::Saturated {
            waited_ms: u64::try_from(self.lock_timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            events: self.len(),
            written: self.counters.written.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            pruned: self.counters.pruned.load(Ordering::Relaxed),
            saturated: self.counters.saturated.load(Ordering::Relaxed),
        }
    }

    /// Check that every secondary entry points at a primary record with
    /// matching fields, and that every primary record is fully indexed.
    pub fn verify_indexes(&self) -> Result<(), StorageError> {
        let idx = self.read()?;
        let corrupt = |index: &str, reason: String| StorageError::IndexCorruption {
            index: index.to_string(),
            reason,
        };

        for (source, ts, id) in &idx.by_source {
            match idx.primary.get(id) {
                Some(e) if e.source_id == *source && e.timestamp == *ts => {}
                _ => return Err(corrupt("by_source", format!("dangling entry {}", id))),
            }
        }
        for (ts, id) in &idx.by_age {
            match idx.primary.get(id) {
                Some(e) if e.timestamp == *ts => {}
                _ => return Err(corrupt("by_age", format!("dangling entry {}", id))),
            }
        }
        for key in &idx.state_changes {
            let id = key.2;
            let ok = idx.by_source.contains(key)
                && idx
                    .primary
                    .get(&id)
                    .is_some_and(|e| matches!(e.kind, EventKind::StateChange { .. }));
            if !ok {
                return Err(corrupt("state_changes", format!("dangling entry {}", id)));
            }
        }
        let mut correlated = 0usize;
        for (c, ids) in &idx.by_correlation {
            if ids.is_empty() {
                return Err(corrupt("by_correlation", format!("empty set for {}", c)));
            }
            for id in ids {
                match idx.primary.get(id) {
                    Some(e) if e.correlation_id == Some(*c) => correlated += 1,
                    _ => {
                        return Err(corrupt(
                            "by_correlation",
                            format!("dangling entry {} under {}", id, c),
                        ))
                    }
                }
            }
        }

        let n = idx.primary.len();
        if idx.by_source.len() != n || idx.by_age.len() != n {
            return Err(corrupt(
                "primary",
                format!(
                    "{} events but {} source and {} age entries",
                    n,
                    idx.by_source.len(),
                    idx.by_age.len()
                ),
            ));
        }
        let expected = idx
            .primary
            .values()
            .filter(|e| e.correlation_id.is_some())
            .count();
        if correlated != expected {
            return Err(corrupt(
                "by_correlation",
                format!("{} indexed, {} correlated events", correlated, expected),
            ));
        }
        Ok(())
    }
}

impl Default for HotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for HotStore {
    fn write_batch(&self, events: Vec<Event>) -> Result<WriteReport, StorageError> {
        let mut report = WriteReport::default();
        {
            let mut idx = self.write()?;
            for event in events {
                match idx.insert(event) {
                    Ok(()) => report.written += 1,
                    Err(StorageError::Duplicate { id }) => report.duplicates.push(id),
                    Err(e) => return Err(e),
                }
            }
        }

        self.counters
            .written
            .fetch_add(report.written as u64, Ordering::Relaxed);
        if !report.duplicates.is_empty() {
            self.counters
                .duplicates
                .fetch_add(report.duplicates.len() as u64, Ordering::Relaxed);
            tracing::warn!(
                count = report.duplicates.len(),
                first = %report.duplicates[0],
                "Rejected duplicate event ids"
            );
        }
        Ok(report)
    }

    fn get(&self, id: EventId) -> Result<Event, StorageError> {
        self.read()?
            .primary
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound { id })
    }

    fn get_by_source(&self, source: SourceId, range: TimeRange) -> Result<Vec<Event>, StorageError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let idx = self.read()?;
        Ok(Indexes::source_range(&idx.by_source, source, range)
            .filter_map(|(_, _, id)| idx.primary.get(id).cloned())
            .collect())
    }

    fn get_by_correlation(&self, correlation: CorrelationId) -> Result<Vec<Event>, StorageError> {
        let idx = self.read()?;
        Ok(idx
            .by_correlation
            .get(&correlation)
            .into_iter()
            .flatten()
            .filter_map(|id| idx.primary.get(id).cloned())
            .collect())
    }

    fn latest_state_change(
        &self,
        source: SourceId,
        at: Timestamp,
    ) -> Result<Option<Event>, StorageError> {
        let idx = self.read()?;
        let latest = Indexes::source_range(&idx.state_changes, source, TimeRange::until(at))
            .next_back()
            .and_then(|(_, _, id)| idx.primary.get(id).cloned());
        Ok(latest)
    }

    fn prune(&self, window: &RetentionWindow, now: Timestamp) -> Result<PruneReport, StorageError> {
        let mut report = PruneReport::default();
        {
            let mut idx = self.write()?;

            if let Some(cutoff) = window.age_cutoff(now) {
                let expired: Vec<EventId> = idx
                    .by_age
                    .range(..(cutoff, EventId(0)))
                    .map(|(_, id)| *id)
                    .collect();
                for id in expired {
                    if let Some(event) = idx.remove(id) {
                        report.removed.push(event);
                        report.expired_by_age += 1;
                    }
                }
            }

            if let Some(max_count) = window.max_count {
                while idx.primary.len() > max_count {
                    let Some(&(_, id)) = idx.by_age.first() else {
                        break;
                    };
                    match idx.remove(id) {
                        Some(event) => {
                            report.removed.push(event);
                            report.evicted_by_count += 1;
                        }
                        None => break,
                    }
                }
            }
        }

        self.counters
            .pruned
            .fetch_add(report.total() as u64, Ordering::Relaxed);
        Ok(report)
    }

    fn len(&self) -> usize {
        self.indexes.read().primary.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_core::Digest;
    use std::sync::Arc;
    use std::thread;

    fn ev(id: u64, source: u64, ts: u64, kind: EventKind) -> Event {
        Event::new(EventId(id), Timestamp(ts), SourceId(source), kind)
    }

    fn state(id: u64, source: u64, ts: u64) -> Event {
        ev(
            id,
            source,
            ts,
            EventKind::state_change("cb", Digest::empty(), Digest::hashed(&id.to_le_bytes())),
        )
    }

    fn spawn(id: u64, source: u64, ts: u64) -> Event {
        ev(
            id,
            source,
            ts,
            EventKind::unit_spawn(SourceId(source), SourceId(id + 1000)),
        )
    }

    #[test]
    fn test_write_and_get() {
        let store = HotStore::new();
        let report = store.write_batch(vec![spawn(1, 1, 10), spawn(2, 1, 20)]).unwrap();
        assert_eq!(report.written, 2);
        assert_eq!(store.get(EventId(2)).unwrap().timestamp, Timestamp(20));
        assert_eq!(
            store.get(EventId(3)),
            Err(StorageError::NotFound { id: EventId(3) })
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_duplicates_rejected_rest_stored() {
        let store = HotStore::new();
        store.write_batch(vec![spawn(1, 1, 10)]).unwrap();
        let report = store
            .write_batch(vec![spawn(1, 1, 99), spawn(2, 1, 20), spawn(2, 1, 21)])
            .unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.duplicates, vec![EventId(1), EventId(2)]);
        assert_eq!(store.get(EventId(1)).unwrap().timestamp, Timestamp(10));
        assert_eq!(store.stats().duplicates, 2);
        store.verify_indexes().unwrap();
    }

    #[test]
    fn test_get_by_source_ordered_and_ranged() {
        let store = HotStore::new();
        store
            .write_batch(vec![
                spawn(3, 1, 30),
                spawn(1, 1, 10),
                spawn(2, 2, 15),
                spawn(4, 1, 40),
            ])
            .unwrap();

        let all: Vec<u64> = store
            .get_by_source(SourceId(1), TimeRange::all())
            .unwrap()
            .iter()
            .map(|e| e.id.0)
            .collect();
        assert_eq!(all, vec![1, 3, 4]);

        let mid = store
            .get_by_source(SourceId(1), TimeRange::new(Timestamp(10), Timestamp(30)))
            .unwrap();
        assert_eq!(mid.len(), 2);
        assert!(store
            .get_by_source(SourceId(1), TimeRange::new(Timestamp(50), Timestamp(40)))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_get_by_correlation() {
        let store = HotStore::new();
        let mut a = spawn(1, 1, 10);
        a.correlate(Some(CorrelationId(1)), None);
        let mut b = spawn(2, 2, 20);
        b.correlate(Some(CorrelationId(1)), Some(EventId(1)));
        store.write_batch(vec![a, b, spawn(3, 1, 30)]).unwrap();

        let linked = store.get_by_correlation(CorrelationId(1)).unwrap();
        assert_eq!(linked.len(), 2);
        assert!(store.get_by_correlation(CorrelationId(9)).unwrap().is_empty());
    }

    #[test]
    fn test_latest_state_change() {
        let store = HotStore::new();
        store
            .write_batch(vec![
                state(1, 1, 10),
                spawn(2, 1, 15),
                state(3, 1, 20),
                state(4, 2, 5),
            ])
            .unwrap();
        let at = |t| {
            store
                .latest_state_change(SourceId(1), Timestamp(t))
                .unwrap()
                .map(|e| e.id.0)
        };
        assert_eq!(at(5), None);
        assert_eq!(at(10), Some(1));
        assert_eq!(at(19), Some(1));
        assert_eq!(at(20), Some(3));
        assert_eq!(at(u64::MAX), Some(3));
    }

    #[test]
    fn test_prune_by_age() {
        let store = HotStore::new();
        store
            .write_batch((1..=10).map(|i| state(i, i % 3, i * 10)).collect())
            .unwrap();
        let window = RetentionWindow::unbounded().with_max_age(Duration::from_nanos(50));
        let report = store.prune(&window, Timestamp(100)).unwrap();

        assert_eq!(report.expired_by_age, 4);
        let removed: Vec<u64> = report.removed.iter().map(|e| e.id.0).collect();
        assert_eq!(removed, vec![1, 2, 3, 4]);
        assert_eq!(store.len(), 6);
        store.verify_indexes().unwrap();
    }

    #[test]
    fn test_prune_by_count_oldest_first() {
        let store = HotStore::new();
        store
            .write_batch(vec![spawn(2, 1, 5), spawn(1, 1, 20), spawn(3, 2, 10)])
            .unwrap();
        let report = store
            .prune(&RetentionWindow::unbounded().with_max_count(1), Timestamp(0))
            .unwrap();
        assert_eq!(report.evicted_by_count, 2);
        assert_eq!(store.get(EventId(1)).unwrap().id, EventId(1));
        store.verify_indexes().unwrap();
    }

    #[test]
    fn test_prune_removes_correlation_entries() {
        let store = HotStore::new();
        let mut a = spawn(1, 1, 10);
        a.correlate(Some(CorrelationId(1)), None);
        store.write_batch(vec![a, spawn(2, 1, 100)]).unwrap();
        store
            .prune(
                &RetentionWindow::unbounded().with_max_age(Duration::from_nanos(10)),
                Timestamp(100),
            )
            .unwrap();
        assert!(store.get_by_correlation(CorrelationId(1)).unwrap().is_empty());
        store.verify_indexes().unwrap();
    }

    #[test]
    fn test_saturated_when_lock_held() {
        let store = Arc::new(HotStore::with_lock_timeout(Duration::from_millis(5)));
        let guard = store.indexes.write();
        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.write_batch(vec![spawn(1, 1, 1)]))
        };
        let result = writer.join().unwrap();
        drop(guard);

        assert!(matches!(result, Err(StorageError::Saturated { .. })));
        assert_eq!(store.stats().saturated, 1);
        assert!(store.write_batch(vec![spawn(1, 1, 1)]).is_ok());
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use causeway_core::Digest;
    use proptest::prelude::*;

    fn arb_event() -> impl Strategy<Value = Event> {
        (1u64..200, 0u64..5, 0u64..1_000, any::<bool>(), prop::option::of(0u64..10)).prop_map(
            |(id, source, ts, is_state, corr)| {
                let kind = if is_state {
                    EventKind::state_change("cb", Digest::empty(), Digest::empty())
                } else {
                    EventKind::message_send(id, SourceId(source + 1), Digest::empty())
                };
                let mut event = Event::new(EventId(id), Timestamp(ts), SourceId(source), kind);
                event.correlate(corr.map(CorrelationId), None);
                event
            },
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_prune_leaves_no_dangling_entries(
            batches in prop::collection::vec(prop::collection::vec(arb_event(), 0..40), 1..5),
            max_age in prop::option::of(0u64..1_000),
            max_count in prop::option::of(0usize..60),
            now in 0u64..2_000,
        ) {
            let store = HotStore::new();
            for batch in batches {
                store.write_batch(batch).unwrap();
            }
            prop_assert!(store.verify_indexes().is_ok());

            let window = RetentionWindow {
                max_age: max_age.map(Duration::from_nanos),
                max_count,
            };
            let before = store.len();
            let report = store.prune(&window, Timestamp(now)).unwrap();
            prop_assert!(store.verify_indexes().is_ok());
            prop_assert_eq!(store.len() + report.total(), before);

            if let Some(cutoff) = window.age_cutoff(Timestamp(now)) {
                for source in 0..5 {
                    for e in store.get_by_source(SourceId(source), TimeRange::all()).unwrap() {
                        prop_assert!(e.timestamp >= cutoff);
                    }
                }
            }
            if let Some(max) = max_count {
                prop_assert!(store.len() <= max);
            }
        }

        #[test]
        fn prop_duplicates_keep_first_write(events in prop::collection::vec(arb_event(), 1..80)) {
            let store = HotStore::new();
            let report = store.write_batch(events.clone()).unwrap();
            prop_assert_eq!(report.written + report.duplicates.len(), events.len());

            let mut seen = std::collections::HashSet::new();
            for e in &events {
                if seen.insert(e.id) {
                    prop_assert_eq!(&store.get(e.id).unwrap(), e);
                }
            }
        }
    }
}
