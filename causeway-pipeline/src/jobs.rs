//! Background retention job.
//!
//! Prunes the hot store on a fixed interval and hands whatever it removed
//! to the configured [`ColdArchive`], tagged with the capture session.
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = tokio::spawn(retention_task(store, archive, window, interval, clock, session, shutdown_rx));
//! // ...
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

use causeway_core::Clock;
use causeway_storage::{ColdArchive, EventStore, RetentionWindow};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct RetentionMetrics {
    pub cycles: AtomicU64,
    pub pruned: AtomicU64,
    pub archived: AtomicU64,
    /// Prunes skipped because the store was busy.
    pub skipped: AtomicU64,
    pub prune_errors: AtomicU64,
    pub archive_errors: AtomicU64,
}

impl RetentionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RetentionSnapshot {
        RetentionSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
            archived: self.archived.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            prune_errors: self.prune_errors.load(Ordering::Relaxed),
            archive_errors: self.archive_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionSnapshot {
    pub cycles: u64,
    pub pruned: u64,
    pub archived: u64,
    pub skipped: u64,
    pub prune_errors: u64,
    pub archive_errors: u64,
}

/// Run retention until `shutdown` flips to true.
pub async fn retention_task(
    store: Arc<dyn EventStore>,
    archive: Arc<dyn ColdArchive>,
    window: RetentionWindow,
    every: Duration,
    clock: Clock,
    session: Uuid,
    mut shutdown: watch::Receiver<bool>,
) -> Arc<RetentionMetrics> {
    let metrics = Arc::new(RetentionMetrics::new());

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        %session,
        interval_ms = every.as_millis() as u64,
        max_age = ?window.max_age,
        max_count = ?window.max_count,
        archive = archive.name(),
        "Retention task started"
    );

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                prune_once(&store, archive.as_ref(), &window, &clock, session, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        %session,
        cycles = snapshot.cycles,
        pruned = snapshot.pruned,
        archived = snapshot.archived,
        "Retention task stopped"
    );
    metrics
}

/// One prune and archive cycle. The prune waits on the store lock and
/// walks the age index, so it runs on the blocking pool.
pub async fn prune_once(
    store: &Arc<dyn EventStore>,
    archive: &dyn ColdArchive,
    window: &RetentionWindow,
    clock: &Clock,
    session: Uuid,
    metrics: &RetentionMetrics,
) {
    metrics.cycles.fetch_add(1, Ordering::Relaxed);

    let now = clock.now();
    let pruning = {
        let store = Arc::clone(store);
        let window = *window;
        tokio::task::spawn_blocking(move || store.prune(&window, now))
    };
    let pruned = match pruning.await {
        Ok(result) => result,
        Err(e) => {
            metrics.prune_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, "Prune task failed");
            return;
        }
    };
    let report = match pruned {
        Ok(report) => report,
        Err(e) if e.is_pressure() => {
            metrics.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(error = %e, "Store busy, skipping prune");
            return;
        }
        Err(e) => {
            metrics.prune_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, "Prune failed");
            return;
        }
    };
    if report.is_empty() {
        tracing::trace!("Prune cycle removed nothing");
        return;
    }

    let removed = report.total() as u64;
    metrics.pruned.fetch_add(removed, Ordering::Relaxed);
    tracing::info!(
        %session,
        expired_by_age = report.expired_by_age,
        evicted_by_count = report.evicted_by_count,
        remaining = store.len(),
        "Pruned hot store"
    );

    match archive.archive(session, report.removed).await {
        Ok(()) => {
            metrics.archived.fetch_add(removed, Ordering::Relaxed);
        }
        Err(e) => {
            metrics.archive_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(%session, error = %e, count = removed, "Archive hand-off failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_core::{
        ArchiveError, CorrelationId, Event, EventId, EventKind, SourceId, StorageError, TimeRange,
        Timestamp,
    };
    use causeway_storage::{HotStore, MemoryArchive, NullArchive, PruneReport, WriteReport};

    struct FailingArchive;

    #[async_trait::async_trait]
    impl ColdArchive for FailingArchive {
        async fn archive(&self, _session: Uuid, events: Vec<Event>) -> Result<(), ArchiveError> {
            Err(ArchiveError::Rejected {
                count: events.len(),
                reason: "read-only".to_string(),
            })
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    /// Hot store whose prune holds the calling thread.
    struct SlowPruneStore {
        inner: HotStore,
        delay: Duration,
    }

    impl EventStore for SlowPruneStore {
        fn write_batch(&self, events: Vec<Event>) -> Result<WriteReport, StorageError> {
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
            std::thread::sleep(self.delay);
            self.inner.prune(window, now)
        }

        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    fn seeded_store(n: u64) -> Arc<dyn EventStore> {
        let store = HotStore::new();
        store
            .write_batch(
                (1..=n)
                    .map(|i| {
                        Event::new(
                            EventId(i),
                            Timestamp(i),
                            SourceId(1),
                            EventKind::unit_spawn(SourceId(1), SourceId(100 + i)),
                        )
                    })
                    .collect(),
            )
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_prune_hands_off_to_archive() {
        let store = seeded_store(10);
        let archive = MemoryArchive::new();
        let metrics = RetentionMetrics::new();
        let session = Uuid::now_v7();

        let window = RetentionWindow::unbounded().with_max_count(4);
        prune_once(&store, &archive, &window, &Clock::start(), session, &metrics).await;

        assert_eq!(store.len(), 4);
        let archived: Vec<u64> = archive.events_for(session).iter().map(|e| e.id.0).collect();
        assert_eq!(archived, vec![1, 2, 3, 4, 5, 6]);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pruned, 6);
        assert_eq!(snapshot.archived, 6);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_slow_prune_leaves_runtime_free() {
        let store: Arc<dyn EventStore> = Arc::new(SlowPruneStore {
            inner: HotStore::new(),
            delay: Duration::from_millis(100),
        });
        let ticker = tokio::spawn(async {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        let metrics = RetentionMetrics::new();
        let window = RetentionWindow::unbounded().with_max_count(1);
        prune_once(&store, &NullArchive, &window, &Clock::start(), Uuid::nil(), &metrics).await;

        assert!(ticker.is_finished());
        assert_eq!(metrics.snapshot().cycles, 1);
        assert_eq!(metrics.snapshot().prune_errors, 0);
    }

    #[tokio::test]
    async fn test_archive_failure_counted() {
        let store = seeded_store(3);
        let metrics = RetentionMetrics::new();
        let window = RetentionWindow::unbounded().with_max_count(0);
        prune_once(&store, &FailingArchive, &window, &Clock::start(), Uuid::nil(), &metrics).await;

        assert!(store.is_empty());
        assert_eq!(metrics.snapshot().archive_errors, 1);
        assert_eq!(metrics.snapshot().archived, 0);
    }

    #[tokio::test]
    async fn test_task_stops_on_shutdown() {
        let store = seeded_store(2);
        let archive = Arc::new(MemoryArchive::new());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(retention_task(
            Arc::clone(&store),
            archive.clone(),
            RetentionWindow::unbounded().with_max_count(1),
            Duration::from_millis(5),
            Clock::start(),
            Uuid::now_v7(),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        let metrics = handle.await.unwrap();

        assert!(metrics.snapshot().cycles >= 1);
        assert_eq!(store.len(), 1);
        assert_eq!(archive.event_count(), 1);
    }
}
