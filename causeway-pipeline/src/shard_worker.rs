//! Correlator shard workers and the store write path.

use crate::stats::PipelineStats;
use causeway_core::{Event, StorageError, WriterConfig};
use causeway_events::CorrelatorShard;
use causeway_storage::EventStore;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Writes correlated batches, absorbing store pressure.
///
/// A batch refused with `Saturated` or `Timeout` is split in half and both
/// halves are retried after a pause that doubles up to `max_pause`. Store
/// pressure never drops events; only a non-pressure error does, and that is
/// counted in `store_failed`.
#[derive(Clone)]
pub struct StoreWriter {
    store: Arc<dyn EventStore>,
    timeout: Duration,
    retry_pause: Duration,
    max_pause: Duration,
    stats: Arc<PipelineStats>,
}

impl std::fmt::Debug for StoreWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreWriter")
            .field("timeout", &self.timeout)
            .field("retry_pause", &self.retry_pause)
            .field("max_pause", &self.max_pause)
            .finish()
    }
}

impl StoreWriter {
    pub fn new(store: Arc<dyn EventStore>, config: &WriterConfig, stats: Arc<PipelineStats>) -> Self {
        Self {
            store,
            timeout: config.store_timeout(),
            retry_pause: config.store_retry_pause(),
            max_pause: config.store_max_pause().max(config.store_retry_pause()),
            stats,
        }
    }

    /// Store `events`, splitting and retrying under pressure. Returns the
    /// number of events the store accepted.
    pub async fn write(&self, events: Vec<Event>) -> usize {
        let mut pending = VecDeque::from([events]);
        let mut pause = self.retry_pause;
        let mut written = 0;

        while let Some(mut chunk) = pending.pop_front() {
            if chunk.is_empty() {
                continue;
            }
            match self.attempt(chunk.clone()).await {
                Ok(report) => {
                    written += report.written;
                    PipelineStats::add(&self.stats.stored, report.written as u64);
                    PipelineStats::add(&self.stats.duplicates, report.duplicates.len() as u64);
                    pause = self.retry_pause;
                }
                Err(e) if e.is_pressure() => {
                    PipelineStats::add(&self.stats.store_retries, 1);
                    tracing::debug!(
                        error = %e,
                        batch = chunk.len(),
                        pause_ms = pause.as_millis() as u64,
                        "Store under pressure, splitting batch"
                    );
                    if chunk.len() > 1 {
                        let back = chunk.split_off(chunk.len() / 2);
                        pending.push_front(back);
                    }
                    pending.push_front(chunk);
                    tokio::time::sleep(pause).await;
                    pause = (pause * 2).min(self.max_pause);
                }
                Err(e) => {
                    PipelineStats::add(&self.stats.store_failed, chunk.len() as u64);
                    tracing::error!(error = %e, batch = chunk.len(), "Store rejected batch");
                }
            }
        }
        written
    }

    /// One bounded write on the blocking pool. A write still running when
    /// the timeout fires may land later; its retry then reports duplicates.
    async fn attempt(&self, chunk: Vec<Event>) -> Result<causeway_storage::WriteReport, StorageError> {
        let store = Arc::clone(&self.store);
        let waited_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        let timeout = || StorageError::Timeout {
            operation: "write_batch".to_string(),
            waited_ms,
        };

        match tokio::time::timeout(
            self.timeout,
            tokio::task::spawn_blocking(move || store.write_batch(chunk)),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => {
                tracing::error!(error = %join, "Store write task failed");
                Err(timeout())
            }
            Err(_) => Err(timeout()),
        }
    }
}

/// What a shard worker needs, kept outside the task so a restarted worker
/// resumes with the same correlation state and channel.
#[derive(Debug)]
pub struct ShardSlot {
    pub shard: CorrelatorShard,
    pub rx: mpsc::Receiver<Vec<Event>>,
}

impl ShardSlot {
    pub fn new(shard: CorrelatorShard, rx: mpsc::Receiver<Vec<Event>>) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self { shard, rx }))
    }
}

/// Correlate and store batches until the channel closes.
pub async fn shard_worker(slot: Arc<Mutex<ShardSlot>>, writer: StoreWriter) {
    let mut slot = slot.lock().await;
    let index = slot.shard.index();
    tracing::debug!(shard = index, "Shard worker started");

    while let Some(mut batch) = slot.rx.recv().await {
        slot.shard.correlate_batch(&mut batch);
        writer.write(batch).await;
    }

    tracing::debug!(
        shard = index,
        pending_sends = slot.shard.pending_sends(),
        "Shard worker stopped"
    );
}
