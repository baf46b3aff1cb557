//! Drain workers.
//!
//! Any number of drain workers share one [`DrainContext`]. A worker takes
//! the gate, drains a batch from the lanes, decodes it and hands every
//! event to its shard channel before releasing the gate. Dispatch therefore
//! happens in ring order no matter how many workers run, and a shard sees
//! each source's events in the order they were captured.
//!
//! Priority entries can be drained ahead of bulk entries their source
//! emitted earlier. They wait in a [`ReorderBuffer`] until the bulk lane has
//! been drained past them, together with any later bulk events from the
//! same source.

use crate::stats::PipelineStats;
use causeway_capture::CaptureLanes;
use causeway_core::{codec, Event, SourceId, WriterConfig};
use causeway_events::ShardRouter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

#[derive(Debug)]
struct Held {
    /// Bulk position the lane must be drained through first.
    mark: u64,
    event: Event,
}

/// Events drained early, waiting for the bulk lane to catch up.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    held: Vec<Held>,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Hold a priority event until the bulk lane passes `mark`.
    pub fn hold(&mut self, mark: u64, event: Event) {
        self.held.push(Held { mark, event });
    }

    /// Pass a bulk event through, or hold it behind an earlier held event
    /// of the same source.
    pub fn admit(&mut self, event: Event) -> Option<Event> {
        match self.blocking_mark(event.source_id, event.id.0) {
            Some(mark) => {
                self.held.push(Held { mark, event });
                None
            }
            None => Some(event),
        }
    }

    fn blocking_mark(&self, source: SourceId, id: u64) -> Option<u64> {
        self.held
            .iter()
            .filter(|h| h.event.source_id == source && h.event.id.0 < id)
            .map(|h| h.mark)
            .max()
    }

    /// Move every event whose mark `drained_through` accepts into `out`.
    pub fn release_into(&mut self, out: &mut Vec<Event>, drained_through: impl Fn(u64) -> bool) {
        let mut i = 0;
        while i < self.held.len() {
            if drained_through(self.held[i].mark) {
                out.push(self.held.swap_remove(i).event);
            } else {
                i += 1;
            }
        }
    }

    /// Everything still held, regardless of marks.
    pub fn take_all(&mut self) -> Vec<Event> {
        self.held.drain(..).map(|h| h.event).collect()
    }
}

/// State shared by all drain workers.
#[derive(Debug)]
pub struct DrainContext {
    lanes: Arc<CaptureLanes>,
    gate: Mutex<ReorderBuffer>,
    router: ShardRouter,
    shards: Vec<mpsc::Sender<Vec<Event>>>,
    batch_size: usize,
    idle_backoff: Duration,
    stats: Arc<PipelineStats>,
}

impl DrainContext {
    pub fn new(
        lanes: Arc<CaptureLanes>,
        router: ShardRouter,
        shards: Vec<mpsc::Sender<Vec<Event>>>,
        config: &WriterConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            lanes,
            gate: Mutex::new(ReorderBuffer::new()),
            router,
            shards,
            batch_size: config.drain_batch_size.max(1),
            idle_backoff: config.idle_backoff(),
            stats,
        }
    }

    /// Drain, decode and dispatch one batch. Returns the number of raw
    /// entries taken from the lanes.
    pub async fn drain_once(&self) -> usize {
        let mut reorder = self.gate.lock().await;

        let raw = self.lanes.drain_split(self.batch_size);
        if raw.is_empty() && reorder.is_empty() {
            return 0;
        }
        let drained = raw.len();
        PipelineStats::add(&self.stats.drained, drained as u64);

        for event in self.decode(&raw.priority) {
            reorder.hold(raw.bulk_mark, event);
        }
        let mut events: Vec<Event> = self
            .decode(&raw.bulk)
            .into_iter()
            .filter_map(|event| reorder.admit(event))
            .collect();
        reorder.release_into(&mut events, |mark| self.lanes.bulk_drained_through(mark));
        if !reorder.is_empty() {
            tracing::trace!(held = reorder.len(), "Holding events behind undrained bulk entries");
        }

        self.dispatch(events).await;
        drained
    }

    fn decode(&self, raw: &[Vec<u8>]) -> Vec<Event> {
        let mut events = Vec::with_capacity(raw.len());
        for bytes in raw {
            match codec::decode(bytes) {
                Ok(event) => events.push(event),
                Err(e) => {
                    PipelineStats::add(&self.stats.malformed, 1);
                    tracing::warn!(error = %e, len = bytes.len(), "Skipping malformed entry");
                }
            }
        }
        events
    }

    /// Send events to their shards in id order.
    async fn dispatch(&self, mut events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        events.sort_unstable_by_key(|e| e.id);

        let mut per_shard: Vec<Vec<Event>> = vec![Vec::new(); self.shards.len()];
        for event in events {
            let shard = self.router.route(&event);
            per_shard[shard].push(event);
        }

        for (shard, batch) in per_shard.into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            let count = batch.len() as u64;
            match self.shards[shard].send(batch).await {
                Ok(()) => PipelineStats::add(&self.stats.dispatched, count),
                Err(_) => {
                    PipelineStats::add(&self.stats.undeliverable, count);
                    tracing::error!(shard, count, "Shard channel closed, dropping batch");
                }
            }
        }
    }

    /// Dispatch whatever is still held. Only for shutdown, when no producer
    /// is left to publish the bulk entries the held events wait for.
    pub async fn release_held(&self) -> usize {
        let mut reorder = self.gate.lock().await;
        let events = reorder.take_all();
        let n = events.len();
        if n > 0 {
            tracing::warn!(count = n, "Releasing held events past unpublished bulk entries");
        }
        self.dispatch(events).await;
        n
    }

    /// Drain until both lanes are empty.
    pub async fn drain_all(&self) -> usize {
        let mut total = 0;
        loop {
            let n = self.drain_once().await;
            if n == 0 {
                return total;
            }
            total += n;
        }
    }

    pub fn idle_backoff(&self) -> Duration {
        self.idle_backoff
    }
}

/// Drain until shutdown, then empty the lanes one last time.
pub async fn drain_worker(
    ctx: Arc<DrainContext>,
    worker: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(worker, "Drain worker started");

    while !*shutdown.borrow() {
        if ctx.drain_once().await == 0 {
            tokio::select! {
                changed = shutdown.changed() => {
                    // Sender gone: the engine was dropped without shutdown.
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(ctx.idle_backoff) => {}
            }
        }
    }

    let flushed = ctx.drain_all().await;
    let forced = ctx.release_held().await;
    tracing::debug!(worker, flushed, forced, "Drain worker stopped");
}
