//! Causal correlation of decoded events.
//!
//! State is split into shards. Each `CorrelatorShard` is owned by exactly
//! one worker, so no correlation state is ever behind a lock. The only
//! shared piece is `CorrelationStats`, which is atomic.

use crate::call_stack::CallStacks;
use crate::pending::PendingSends;
use crate::router::ShardRouter;
use causeway_core::{CorrelationId, CorrelatorConfig, Event, EventFlags, EventKind};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// STATS
// ============================================================================

/// Correlation outcomes across all shards.
#[derive(Debug, Default)]
pub struct CorrelationStats {
    pub calls_matched: AtomicU64,
    pub orphaned_exits: AtomicU64,
    pub messages_matched: AtomicU64,
    pub unmatched_receives: AtomicU64,
    pub spawns_linked: AtomicU64,
    /// Open calls lost to stack depth or source eviction.
    pub calls_evicted: AtomicU64,
    /// Open calls that never returned (unwound past or cleared on exit).
    pub calls_abandoned: AtomicU64,
    /// Pending sends lost to ttl or the size bound.
    pub sends_evicted: AtomicU64,
    pub sources_evicted: AtomicU64,
}

impl CorrelationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CorrelationStatsSnapshot {
        CorrelationStatsSnapshot {
            calls_matched: self.calls_matched.load(Ordering::Relaxed),
            orphaned_exits: self.orphaned_exits.load(Ordering::Relaxed),
            messages_matched: self.messages_matched.load(Ordering::Relaxed),
            unmatched_receives: self.unmatched_receives.load(Ordering::Relaxed),
            spawns_linked: self.spawns_linked.load(Ordering::Relaxed),
            calls_evicted: self.calls_evicted.load(Ordering::Relaxed),
            calls_abandoned: self.calls_abandoned.load(Ordering::Relaxed),
            sends_evicted: self.sends_evicted.load(Ordering::Relaxed),
            sources_evicted: self.sources_evicted.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }
}

/// Snapshot of correlation statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CorrelationStatsSnapshot {
    pub calls_matched: u64,
    pub orphaned_exits: u64,
    pub messages_matched: u64,
    pub unmatched_receives: u64,
    pub spawns_linked: u64,
    pub calls_evicted: u64,
    pub calls_abandoned: u64,
    pub sends_evicted: u64,
    pub sources_evicted: u64,
}

impl CorrelationStatsSnapshot {
    /// Correlation state lost to bounds.
    pub fn evictions(&self) -> u64 {
        self.calls_evicted + self.sends_evicted
    }
}

// ============================================================================
// SHARD
// ============================================================================

/// Correlation state for the sources routed to one shard.
#[derive(Debug)]
pub struct CorrelatorShard {
    index: usize,
    calls: CallStacks,
    pending: PendingSends,
    stats: Arc<CorrelationStats>,
}

impl CorrelatorShard {
    pub fn new(index: usize, config: &CorrelatorConfig, stats: Arc<CorrelationStats>) -> Self {
        Self {
            index,
            calls: CallStacks::new(config.max_stack_depth, config.max_tracked_sources),
            pending: PendingSends::new(config.max_pending_sends, config.pending_ttl()),
            stats,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Attach correlation and parent ids to `event`.
    ///
    /// Misses are flagged (`ORPHANED`, `UNMATCHED`) and counted; they never
    /// fail and never drop the event.
    pub fn correlate(&mut self, event: &mut Event) {
        let stats = &*self.stats;
        let source = event.source_id;
        let own = Some(CorrelationId::from(event.id));

        CorrelationStats::add(&stats.sends_evicted, self.pending.expire(event.timestamp));

        match event.kind {
            EventKind::FunctionEntry { call_id, .. } => {
                let pushed = self.calls.push(source, call_id, event.id);
                CorrelationStats::add(
                    &stats.calls_evicted,
                    pushed.frames_evicted + pushed.source_frames_evicted,
                );
                if pushed.source_evicted {
                    CorrelationStats::add(&stats.sources_evicted, 1);
                }
                event.correlate(own, pushed.parent);
            }
            EventKind::FunctionExit { call_id, .. } => {
                let popped = self.calls.pop(source, call_id);
                CorrelationStats::add(&stats.calls_abandoned, popped.abandoned);
                match popped.entry {
                    Some(entry) => {
                        event.correlate(Some(entry.into()), Some(entry));
                        CorrelationStats::add(&stats.calls_matched, 1);
                    }
                    None => {
                        event.correlate(None, None);
                        event.flags.insert(EventFlags::ORPHANED);
                        CorrelationStats::add(&stats.orphaned_exits, 1);
                    }
                }
            }
            EventKind::StateChange { .. } => {
                let parent = self.calls.innermost(source);
                event.correlate(None, parent);
            }
            EventKind::MessageSend { message_id, .. } => {
                let evicted = self
                    .pending
                    .insert(source, message_id, event.id, event.timestamp);
                CorrelationStats::add(&stats.sends_evicted, evicted);
                event.correlate(own, None);
            }
            EventKind::MessageReceive {
                message_id,
                from_source_id,
                ..
            } => match self.pending.take(from_source_id, message_id) {
                Some(send) => {
                    event.correlate(Some(send.into()), Some(send));
                    CorrelationStats::add(&stats.messages_matched, 1);
                }
                None => {
                    event.correlate(None, None);
                    event.flags.insert(EventFlags::UNMATCHED);
                    CorrelationStats::add(&stats.unmatched_receives, 1);
                }
            },
            EventKind::UnitSpawn { .. } => {
                event.correlate(own, None);
                CorrelationStats::add(&stats.spawns_linked, 1);
            }
            EventKind::UnitExit { .. } => {
                let parent = self.calls.innermost(source);
                CorrelationStats::add(&stats.calls_abandoned, self.calls.clear(source));
                event.correlate(None, parent);
            }
        }
    }

    pub fn correlate_batch(&mut self, events: &mut [Event]) {
        for event in events {
            self.correlate(event);
        }
    }

    pub fn open_calls(&self, source: causeway_core::SourceId) -> usize {
        self.calls.depth(source)
    }

    pub fn pending_sends(&self) -> usize {
        self.pending.len()
    }
}

// ============================================================================
// CORRELATOR
// ============================================================================

/// Router plus the full set of shards.
///
/// The writer pool splits it with [`Correlator::into_parts`] and hands each
/// shard to its own worker. Used whole, it correlates sequentially.
#[derive(Debug)]
pub struct Correlator {
    router: ShardRouter,
    shards: Vec<CorrelatorShard>,
    stats: Arc<CorrelationStats>,
}

impl Correlator {
    pub fn new(config: &CorrelatorConfig) -> Self {
        let stats = Arc::new(CorrelationStats::new());
        let router = ShardRouter::new(config.shards, config.virtual_nodes);
        let shards = (0..router.shard_count())
            .map(|i| CorrelatorShard::new(i, config, Arc::clone(&stats)))
            .collect();
        Self {
            router,
            shards,
            stats,
        }
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub fn stats(&self) -> Arc<CorrelationStats> {
        Arc::clone(&self.stats)
    }

    /// Route and correlate one event.
    pub fn correlate(&mut self, event: &mut Event) {
        let shard = self.router.route(event);
        self.shards[shard].correlate(event);
    }

    pub fn correlate_batch(&mut self, events: &mut [Event]) {
        for event in events {
            self.correlate(event);
        }
    }

    pub fn into_parts(self) -> (ShardRouter, Vec<CorrelatorShard>, Arc<CorrelationStats>) {
        (self.router, self.shards, self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_core::{CorrelationLink, Digest, EventId, SourceId, Timestamp};
    use std::time::Duration;

    struct Seq(u64);

    impl Seq {
        fn event(&mut self, source: u64, kind: EventKind) -> Event {
            self.0 += 1;
            Event::new(EventId(self.0), Timestamp(self.0 * 10), SourceId(source), kind)
        }
    }

    fn entry(call_id: u64) -> EventKind {
        EventKind::function_entry(call_id, "m", "f", 0, Digest::empty())
    }

    fn exit(call_id: u64) -> EventKind {
        EventKind::function_exit(call_id, Digest::empty(), Duration::from_nanos(5))
    }

    fn correlator() -> Correlator {
        Correlator::new(&CorrelatorConfig::default())
    }

    #[test]
    fn test_nested_calls_linked() {
        let mut c = correlator();
        let mut seq = Seq(0);
        let mut events = vec![
            seq.event(1, entry(1)),
            seq.event(1, entry(2)),
            seq.event(1, exit(2)),
            seq.event(1, exit(1)),
        ];
        c.correlate_batch(&mut events);

        assert_eq!(events[0].correlation_id, Some(CorrelationId(1)));
        assert_eq!(events[0].parent_id, None);
        assert_eq!(events[1].parent_id, Some(EventId(1)));
        assert_eq!(events[2].correlation_id, Some(CorrelationId(2)));
        assert_eq!(events[2].parent_id, Some(EventId(2)));
        assert_eq!(events[3].correlation_id, Some(CorrelationId(1)));
        assert_eq!(
            CorrelationLink::derive(&events[3]),
            Some(CorrelationLink::CallReturn {
                entry: EventId(1),
                exit: EventId(4)
            })
        );
        assert_eq!(c.stats().snapshot().calls_matched, 2);
    }

    #[test]
    fn test_second_exit_is_orphaned() {
        let mut c = correlator();
        let mut seq = Seq(0);
        let mut events = vec![
            seq.event(1, entry(1)),
            seq.event(1, exit(1)),
            seq.event(1, exit(1)),
        ];
        c.correlate_batch(&mut events);

        assert!(!events[1].is_orphaned());
        assert!(events[2].is_orphaned());
        assert_eq!(events[2].correlation_id, None);
        let stats = c.stats().snapshot();
        assert_eq!(stats.calls_matched, 1);
        assert_eq!(stats.orphaned_exits, 1);
    }

    #[test]
    fn test_exit_on_other_source_is_orphaned() {
        let mut c = correlator();
        let mut seq = Seq(0);
        let mut events = vec![seq.event(1, entry(1)), seq.event(2, exit(1))];
        c.correlate_batch(&mut events);
        assert!(events[1].is_orphaned());
    }

    #[test]
    fn test_send_receive_linked() {
        let mut c = correlator();
        let mut seq = Seq(0);
        let mut events = vec![
            seq.event(1, EventKind::message_send(9, SourceId(2), Digest::empty())),
            seq.event(2, EventKind::message_receive(9, SourceId(1), Digest::empty())),
        ];
        c.correlate_batch(&mut events);

        assert_eq!(events[0].correlation_id, Some(CorrelationId(1)));
        assert_eq!(events[1].correlation_id, Some(CorrelationId(1)));
        assert_eq!(events[1].parent_id, Some(EventId(1)));
        assert!(!events[1].is_unmatched());
        assert_eq!(c.stats().snapshot().messages_matched, 1);
    }

    #[test]
    fn test_receive_without_send_unmatched() {
        let mut c = correlator();
        let mut seq = Seq(0);
        let mut events = vec![
            seq.event(1, EventKind::message_send(9, SourceId(2), Digest::empty())),
            seq.event(2, EventKind::message_receive(9, SourceId(1), Digest::empty())),
            seq.event(2, EventKind::message_receive(9, SourceId(1), Digest::empty())),
        ];
        c.correlate_batch(&mut events);
        assert!(events[2].is_unmatched());
        assert_eq!(c.stats().snapshot().unmatched_receives, 1);
    }

    #[test]
    fn test_state_change_parented_to_open_call() {
        let mut c = correlator();
        let mut seq = Seq(0);
        let mut events = vec![
            seq.event(1, entry(1)),
            seq.event(
                1,
                EventKind::state_change("handle_call", Digest::empty(), Digest::empty()),
            ),
            seq.event(1, exit(1)),
            seq.event(
                1,
                EventKind::state_change("handle_info", Digest::empty(), Digest::empty()),
            ),
        ];
        c.correlate_batch(&mut events);
        assert_eq!(events[1].parent_id, Some(EventId(1)));
        assert_eq!(events[3].parent_id, None);
    }

    #[test]
    fn test_spawn_and_exit() {
        let mut c = correlator();
        let mut seq = Seq(0);
        let mut events = vec![
            seq.event(1, EventKind::unit_spawn(SourceId(1), SourceId(2))),
            seq.event(2, entry(1)),
            seq.event(2, EventKind::unit_exit(Digest::from("killed"))),
            seq.event(2, exit(1)),
        ];
        c.correlate_batch(&mut events);

        assert_eq!(events[0].correlation_id, Some(CorrelationId(1)));
        assert_eq!(events[2].parent_id, Some(EventId(2)));
        assert!(events[3].is_orphaned());
        let stats = c.stats().snapshot();
        assert_eq!(stats.spawns_linked, 1);
        assert_eq!(stats.calls_abandoned, 1);
    }

    #[test]
    fn test_pending_ttl_expires_in_capture_time() {
        let config = CorrelatorConfig {
            pending_ttl_ms: 1,
            ..CorrelatorConfig::default()
        };
        let mut c = Correlator::new(&config);
        let mut send = Event::new(
            EventId(1),
            Timestamp(0),
            SourceId(1),
            EventKind::message_send(1, SourceId(2), Digest::empty()),
        );
        let mut late = Event::new(
            EventId(2),
            Timestamp(5_000_000),
            SourceId(2),
            EventKind::message_receive(1, SourceId(1), Digest::empty()),
        );
        c.correlate(&mut send);
        c.correlate(&mut late);
        assert!(late.is_unmatched());
        assert_eq!(c.stats().snapshot().sends_evicted, 1);
    }

    #[test]
    fn test_shards_are_independent() {
        let (router, mut shards, stats) = correlator().into_parts();
        let mut seq = Seq(0);
        let mut events: Vec<Event> = (0..64)
            .flat_map(|s| [seq.event(s, entry(1)), seq.event(s, exit(1))])
            .collect();
        for e in &mut events {
            let shard = router.route(e);
            shards[shard].correlate(e);
        }
        assert_eq!(stats.snapshot().calls_matched, 64);
        assert!(events.iter().all(|e| !e.is_orphaned()));
    }
}
