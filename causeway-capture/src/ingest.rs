//! Producer entry point.
//!
//! `Ingestor::ingest` is called inline from instrumented code. It never
//! blocks (beyond a `NoLoss` timeout), never logs and never returns an
//! error: every rejection or failure becomes a counter in `IngestStats`.

use crate::lanes::{CaptureLanes, Lane};
use crate::stats::{IngestStats, IngestStatsSnapshot};
use causeway_core::{
    codec, CaptureConfig, CaptureLimits, Clock, Digest, EmissionPlan, Event, EventId, EventKind,
    NodeTag, SourceId,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Pluggable predicate consulted after the emission plan. Content-based
/// sampling lives here; the engine itself never looks at payloads.
pub trait Sampler: Send + Sync {
    fn sample(&self, source: SourceId, kind: &EventKind, payload: &[u8]) -> bool;
}

impl<F> Sampler for F
where
    F: Fn(SourceId, &EventKind, &[u8]) -> bool + Send + Sync,
{
    fn sample(&self, source: SourceId, kind: &EventKind, payload: &[u8]) -> bool {
        self(source, kind, payload)
    }
}

struct IngestorInner {
    lanes: Arc<CaptureLanes>,
    plan: EmissionPlan,
    sampler: Option<Arc<dyn Sampler>>,
    next_id: AtomicU64,
    clock: Clock,
    limits: CaptureLimits,
    node_tag: NodeTag,
    stats: IngestStats,
}

/// Cheap to clone; all clones share counters and the id sequence.
#[derive(Clone)]
pub struct Ingestor {
    inner: Arc<IngestorInner>,
}

impl fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ingestor")
            .field("limits", &self.inner.limits)
            .field("node_tag", &self.inner.node_tag)
            .field("sampler", &self.inner.sampler.is_some())
            .field("stats", &self.inner.stats.snapshot())
            .finish()
    }
}

/// Builder for [`Ingestor`].
pub struct IngestorBuilder {
    lanes: Arc<CaptureLanes>,
    limits: CaptureLimits,
    node_tag: NodeTag,
    plan: EmissionPlan,
    sampler: Option<Arc<dyn Sampler>>,
    clock: Option<Clock>,
}

impl IngestorBuilder {
    pub fn plan(mut self, plan: EmissionPlan) -> Self {
        self.plan = plan;
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

    pub fn build(self) -> Ingestor {
        Ingestor {
            inner: Arc::new(IngestorInner {
                lanes: self.lanes,
                plan: self.plan,
                sampler: self.sampler,
                next_id: AtomicU64::new(1),
                clock: self.clock.unwrap_or_else(Clock::start),
                limits: self.limits,
                node_tag: self.node_tag,
                stats: IngestStats::new(),
            }),
        }
    }
}

impl Ingestor {
    pub fn builder(lanes: Arc<CaptureLanes>, config: &CaptureConfig) -> IngestorBuilder {
        IngestorBuilder {
            lanes,
            limits: config.limits(),
            node_tag: config.node_tag(),
            plan: EmissionPlan::default(),
            sampler: None,
            clock: None,
        }
    }

    /// Record one event for `source`.
    #[inline]
    pub fn ingest(&self, source: SourceId, kind: EventKind, payload: impl Into<Vec<u8>>) {
        let inner = &*self.inner;

        if !inner.plan.allows(source, kind.tag()) {
            IngestStats::bump(&inner.stats.filtered);
            return;
        }
        let payload = payload.into();
        if let Some(sampler) = &inner.sampler {
            if !sampler.sample(source, &kind, &payload) {
                IngestStats::bump(&inner.stats.sampled_out);
                return;
            }
        }

        let id = EventId(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let event = Event::new(id, inner.clock.now(), source, kind)
            .with_node_tag(inner.node_tag)
            .with_payload(payload);
        self.stage(event);
    }

    /// Record an already-built event, keeping its id and timestamp.
    ///
    /// For replay tooling. The id sequence is advanced past `event.id` so
    /// later `ingest` calls stay increasing.
    pub fn ingest_event(&self, event: Event) {
        let inner = &*self.inner;
        if !inner.plan.allows(event.source_id, event.kind_tag()) {
            IngestStats::bump(&inner.stats.filtered);
            return;
        }
        inner
            .next_id
            .fetch_max(event.id.0.saturating_add(1), Ordering::Relaxed);
        self.stage(event);
    }

    /// Truncate, pick a lane, encode into a reserved slot and publish.
    #[inline]
    fn stage(&self, mut event: Event) {
        let inner = &*self.inner;

        if event.truncate_to(&inner.limits) {
            IngestStats::bump(&inner.stats.truncated);
        }
        let lane = if event.is_critical() {
            Lane::Priority
        } else {
            Lane::Bulk
        };

        let slot = match inner.lanes.reserve(lane) {
            Ok(slot) => slot,
            Err(_) => {
                IngestStats::bump(&inner.stats.dropped);
                return;
            }
        };
        match slot.commit_with(|buf| codec::encode_into(&event, buf)) {
            Ok(_) => IngestStats::bump(&inner.stats.accepted),
            Err(_) => IngestStats::bump(&inner.stats.errors),
        }
    }

    /// Handle bound to one execution unit.
    pub fn source(&self, source: SourceId) -> SourceHandle {
        SourceHandle {
            ingestor: self.clone(),
            source,
        }
    }

    pub fn stats(&self) -> IngestStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn lanes(&self) -> &Arc<CaptureLanes> {
        &self.inner.lanes
    }

    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    pub fn limits(&self) -> CaptureLimits {
        self.inner.limits
    }
}

/// Per-unit producer handle.
#[derive(Debug, Clone)]
pub struct SourceHandle {
    ingestor: Ingestor,
    source: SourceId,
}

impl SourceHandle {
    pub fn id(&self) -> SourceId {
        self.source
    }

    #[inline]
    pub fn ingest(&self, kind: EventKind, payload: impl Into<Vec<u8>>) {
        self.ingestor.ingest(self.source, kind, payload);
    }

    /// Digest `value` under the configured digest budget.
    pub fn digest(&self, value: &[u8]) -> Digest {
        Digest::capture(value, self.ingestor.limits().digest_budget)
    }

    /// A handle for a unit this one spawned. Records the spawn.
    pub fn spawn(&self, child: SourceId) -> SourceHandle {
        self.ingest(EventKind::unit_spawn(self.source, child), Vec::new());
        self.ingestor.source(child)
    }
}
