//! Engine wiring.
//!
//! `Engine::start` builds the capture lanes and the ingestor, splits the
//! correlator into shards, and starts three groups of background tasks on
//! the current tokio runtime: supervised drain workers, supervised shard
//! workers and the retention job. `Engine::shutdown` stops them in that
//! order so that everything captured before the call reaches the store.

use crate::error::{PipelineError, PipelineResult};
use crate::jobs::{retention_task, RetentionMetrics};
use crate::shard_worker::{shard_worker, ShardSlot, StoreWriter};
use crate::stats::{PipelineStats, PipelineStatsSnapshot};
use crate::supervisor::Supervisor;
use crate::writer::{drain_worker, DrainContext};
use causeway_capture::{
    CaptureLanes, IngestStatsSnapshot, Ingestor, LaneStatsSnapshot, Sampler, SourceHandle,
};
use causeway_core::{CausewayConfig, Clock, SourceId};
use causeway_events::{CorrelationStats, CorrelationStatsSnapshot, Correlator};
use causeway_query::QueryCoordinator;
use causeway_storage::{ColdArchive, EventStore, NullArchive, RetentionWindow};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

// ============================================================================
// COMPLETENESS
// ============================================================================

/// Everything the engine knows about what it did not capture or could not
/// correlate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletenessReport {
    pub session_id: Uuid,
    pub ingest: IngestStatsSnapshot,
    pub lanes: LaneStatsSnapshot,
    pub pipeline: PipelineStatsSnapshot,
    pub correlation: CorrelationStatsSnapshot,
    pub stored_events: usize,
}

impl CompletenessReport {
    /// Events accepted by a producer call that never reached the store.
    pub fn lost(&self) -> u64 {
        self.ingest.dropped + self.ingest.errors + self.pipeline.lost()
    }

    /// Stored events whose causal partner is unknown.
    pub fn uncorrelated(&self) -> u64 {
        self.correlation.orphaned_exits + self.correlation.unmatched_receives
    }

    pub fn is_complete(&self) -> bool {
        self.lost() == 0 && self.uncorrelated() == 0 && self.correlation.evictions() == 0
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// BUILDER
// ============================================================================

pub struct EngineBuilder {
    config: CausewayConfig,
    store: Arc<dyn EventStore>,
    archive: Arc<dyn ColdArchive>,
    sampler: Option<Arc<dyn Sampler>>,
    clock: Option<Clock>,
}

impl EngineBuilder {
    /// Where pruned events go. Defaults to [`NullArchive`].
    pub fn archive(mut self, archive: Arc<dyn ColdArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and start all background tasks. Must be
    /// called from within a tokio runtime.
    pub fn start(self) -> PipelineResult<Engine> {
        let Self {
            config,
            store,
            archive,
            sampler,
            clock,
        } = self;
        config.validate()?;

        let session_id = Uuid::now_v7();
        let clock = clock.unwrap_or_else(Clock::start);
        let stats = Arc::new(PipelineStats::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let lanes = Arc::new(CaptureLanes::new(&config.capture));
        let mut ingestor = Ingestor::builder(Arc::clone(&lanes), &config.capture)
            .plan(config.plan.clone())
            .clock(clock);
        if let Some(sampler) = sampler {
            ingestor = ingestor.sampler(sampler);
        }
        let ingestor = ingestor.build();

        let (router, shards, correlation) = Correlator::new(&config.correlator).into_parts();

        let writer = StoreWriter::new(Arc::clone(&store), &config.writer, Arc::clone(&stats));
        let mut shard_supervisor = Supervisor::new("shards", Arc::clone(&stats));
        let mut senders = Vec::with_capacity(shards.len());
        for shard in shards {
            let (tx, rx) = mpsc::channel(config.writer.shard_channel_capacity);
            senders.push(tx);
            let index = shard.index();
            let slot = ShardSlot::new(shard, rx);
            let writer = writer.clone();
            shard_supervisor.spawn(format!("shard-{}", index), move || {
                Box::pin(shard_worker(Arc::clone(&slot), writer.clone()))
            });
        }

        // Only the drain workers' factories hold the senders, so the shard
        // channels close once the drain supervisor is gone.
        let drain = Arc::new(DrainContext::new(
            Arc::clone(&lanes),
            router,
            senders,
            &config.writer,
            Arc::clone(&stats),
        ));
        let mut drain_supervisor = Supervisor::new("drain", Arc::clone(&stats));
        for worker in 0..config.writer.workers {
            let drain = Arc::clone(&drain);
            let shutdown = shutdown_rx.clone();
            drain_supervisor.spawn(format!("drain-{}", worker), move || {
                Box::pin(drain_worker(Arc::clone(&drain), worker, shutdown.clone()))
            });
        }
        drop(drain);

        let drain_task = tokio::spawn(drain_supervisor.run(shutdown_rx.clone()));
        let shard_task = tokio::spawn(shard_supervisor.run(shutdown_rx.clone()));
        let retention = tokio::spawn(retention_task(
            Arc::clone(&store),
            archive,
            RetentionWindow::from_config(&config.retention),
            config.retention.prune_interval(),
            clock,
            session_id,
            shutdown_rx,
        ));

        tracing::info!(
            session = %session_id,
            started_at = %clock.started_at(),
            ring_capacity = config.capture.ring_capacity,
            writers = config.writer.workers,
            shards = config.correlator.shards,
            "Causeway engine started"
        );

        Ok(Engine {
            session_id,
            config,
            clock,
            lanes,
            ingestor,
            store,
            correlation,
            stats,
            shutdown: shutdown_tx,
            drain_task,
            shard_task,
            retention,
        })
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// A running capture session.
///
/// Dropping the engine without [`Engine::shutdown`] still stops the
/// workers, but nobody waits for the final flush.
pub struct Engine {
    session_id: Uuid,
    config: CausewayConfig,
    clock: Clock,
    lanes: Arc<CaptureLanes>,
    ingestor: Ingestor,
    store: Arc<dyn EventStore>,
    correlation: Arc<CorrelationStats>,
    stats: Arc<PipelineStats>,
    shutdown: watch::Sender<bool>,
    drain_task: JoinHandle<()>,
    shard_task: JoinHandle<()>,
    retention: JoinHandle<Arc<RetentionMetrics>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("session_id", &self.session_id)
            .field("ingestor", &self.ingestor)
            .field("pipeline", &self.stats.snapshot())
            .finish()
    }
}

impl Engine {
    pub fn builder(config: CausewayConfig, store: Arc<dyn EventStore>) -> EngineBuilder {
        EngineBuilder {
            config,
            store,
            archive: Arc::new(NullArchive),
            sampler: None,
            clock: None,
        }
    }

    /// Start with defaults for everything but the configuration and store.
    pub fn start(config: CausewayConfig, store: Arc<dyn EventStore>) -> PipelineResult<Self> {
        Self::builder(config, store).start()
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn config(&self) -> &CausewayConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Producer handle. Clones share ids and counters.
    pub fn ingestor(&self) -> Ingestor {
        self.ingestor.clone()
    }

    pub fn source(&self, source: SourceId) -> SourceHandle {
        self.ingestor.source(source)
    }

    pub fn query(&self) -> QueryCoordinator {
        QueryCoordinator::new(Arc::clone(&self.store))
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn completeness(&self) -> CompletenessReport {
        CompletenessReport {
            session_id: self.session_id,
            ingest: self.ingestor.stats(),
            lanes: self.lanes.stats(),
            pipeline: self.stats.snapshot(),
            correlation: self.correlation.snapshot(),
            stored_events: self.store.len(),
        }
    }

    /// Whether everything committed so far has been drained and settled in
    /// the store.
    pub fn is_settled(&self) -> bool {
        let p = self.stats.snapshot();
        self.lanes.is_empty()
            && p.drained == p.malformed + p.dispatched + p.undeliverable
            && p.dispatched == p.stored + p.duplicates + p.store_failed
    }

    /// Wait until [`Engine::is_settled`] or `timeout` passes.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let poll = self.config.writer.idle_backoff().max(Duration::from_millis(1));
        tokio::time::timeout(timeout, async {
            while !self.is_settled() {
                tokio::time::sleep(poll).await;
            }
        })
        .await
        .is_ok()
    }

    /// Stop capturing, flush everything committed so far into the store and
    /// return the final report.
    pub async fn shutdown(self) -> PipelineResult<CompletenessReport> {
        tracing::info!(session = %self.session_id, "Causeway engine shutting down");
        let _ = self.shutdown.send(true);

        self.drain_task.await.map_err(|e| PipelineError::Task {
            task: "drain supervisor",
            reason: e.to_string(),
        })?;
        self.shard_task.await.map_err(|e| PipelineError::Task {
            task: "shard supervisor",
            reason: e.to_string(),
        })?;
        let retention = self.retention.await.map_err(|e| PipelineError::Task {
            task: "retention",
            reason: e.to_string(),
        })?;

        let report = CompletenessReport {
            session_id: self.session_id,
            ingest: self.ingestor.stats(),
            lanes: self.lanes.stats(),
            pipeline: self.stats.snapshot(),
            correlation: self.correlation.snapshot(),
            stored_events: self.store.len(),
        };
        tracing::info!(
            session = %self.session_id,
            stored = report.stored_events,
            lost = report.lost(),
            uncorrelated = report.uncorrelated(),
            pruned = retention.snapshot().pruned,
            restarts = report.pipeline.restarts,
            "Causeway engine stopped"
        );
        Ok(report)
    }
}
