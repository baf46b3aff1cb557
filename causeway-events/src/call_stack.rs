//! Per-source stacks of open calls.

use causeway_core::{EventId, SourceId};
use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    call_id: u64,
    entry: EventId,
}

#[derive(Debug, Default)]
struct SourceCalls {
    frames: VecDeque<Frame>,
    last_active: u64,
}

/// What a push displaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Innermost open call before the push.
    pub parent: Option<EventId>,
    /// Frames dropped from the bottom of an overfull stack.
    pub frames_evicted: u64,
    /// Frames lost with a least-recently-active source.
    pub source_frames_evicted: u64,
    /// Whether a whole source was evicted to make room.
    pub source_evicted: bool,
}

/// Result of matching an exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopOutcome {
    /// Entry event of the matched call.
    pub entry: Option<EventId>,
    /// Open frames above the match that never returned.
    pub abandoned: u64,
}

/// Bounded call stacks for a bounded number of sources.
///
/// Depth overflow evicts the bottom of the stack. Source overflow evicts
/// the source that was active least recently. Both are permanent.
#[derive(Debug)]
pub struct CallStacks {
    stacks: HashMap<SourceId, SourceCalls>,
    /// last_active tick -> source
    lru: BTreeMap<u64, SourceId>,
    tick: u64,
    max_depth: usize,
    max_sources: usize,
}

impl CallStacks {
    pub fn new(max_depth: usize, max_sources: usize) -> Self {
        Self {
            stacks: HashMap::new(),
            lru: BTreeMap::new(),
            tick: 0,
            max_depth: max_depth.max(1),
            max_sources: max_sources.max(1),
        }
    }

    /// Open a call.
    pub fn push(&mut self, source: SourceId, call_id: u64, entry: EventId) -> PushOutcome {
        let mut outcome = PushOutcome::default();

        if !self.stacks.contains_key(&source) && self.stacks.len() >= self.max_sources {
            if let Some(frames) = self.evict_lru() {
                outcome.source_evicted = true;
                outcome.source_frames_evicted = frames;
            }
        }

        let tick = self.next_tick();
        let calls = self.stacks.entry(source).or_default();
        if calls.last_active != 0 {
            self.lru.remove(&calls.last_active);
        }
        calls.last_active = tick;
        self.lru.insert(tick, source);

        outcome.parent = calls.frames.back().map(|f| f.entry);
        if calls.frames.len() >= self.max_depth {
            calls.frames.pop_front();
            outcome.frames_evicted = 1;
        }
        calls.frames.push_back(Frame { call_id, entry });
        outcome
    }

    /// Close the innermost open call with `call_id`. Frames above it are
    /// discarded as abandoned. A miss leaves the stack untouched.
    pub fn pop(&mut self, source: SourceId, call_id: u64) -> PopOutcome {
        let tick = self.next_tick();
        let Some(calls) = self.stacks.get_mut(&source) else {
            return PopOutcome::default();
        };

        self.lru.remove(&calls.last_active);
        calls.last_active = tick;
        self.lru.insert(tick, source);

        let Some(depth) = calls.frames.iter().rposition(|f| f.call_id == call_id) else {
            return PopOutcome::default();
        };
        let abandoned = (calls.frames.len() - depth - 1) as u64;
        let entry = calls.frames[depth].entry;
        calls.frames.truncate(depth);
        PopOutcome {
            entry: Some(entry),
            abandoned,
        }
    }

    /// Entry of the innermost open call.
    pub fn innermost(&self, source: SourceId) -> Option<EventId> {
        self.stacks
            .get(&source)
            .and_then(|c| c.frames.back())
            .map(|f| f.entry)
    }

    /// Forget every open call of `source`. Returns how many there were.
    pub fn clear(&mut self, source: SourceId) -> u64 {
        match self.stacks.remove(&source) {
            Some(calls) => {
                self.lru.remove(&calls.last_active);
                calls.frames.len() as u64
            }
            None => 0,
        }
    }

    pub fn depth(&self, source: SourceId) -> usize {
        self.stacks.get(&source).map_or(0, |c| c.frames.len())
    }

    pub fn tracked_sources(&self) -> usize {
        self.stacks.len()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn evict_lru(&mut self) -> Option<u64> {
        let (_, source) = self.lru.pop_first()?;
        self.stacks
            .remove(&source)
            .map(|calls| calls.frames.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: SourceId = SourceId(1);

    #[test]
    fn test_nested_push_pop() {
        let mut stacks = CallStacks::new(8, 8);
        assert_eq!(stacks.push(S, 1, EventId(10)).parent, None);
        assert_eq!(stacks.push(S, 2, EventId(11)).parent, Some(EventId(10)));
        assert_eq!(stacks.innermost(S), Some(EventId(11)));

        assert_eq!(
            stacks.pop(S, 2),
            PopOutcome {
                entry: Some(EventId(11)),
                abandoned: 0
            }
        );
        assert_eq!(stacks.pop(S, 1).entry, Some(EventId(10)));
        assert_eq!(stacks.depth(S), 0);
    }

    #[test]
    fn test_miss_leaves_stack() {
        let mut stacks = CallStacks::new(8, 8);
        stacks.push(S, 1, EventId(10));
        assert_eq!(stacks.pop(S, 99), PopOutcome::default());
        assert_eq!(stacks.depth(S), 1);
        assert_eq!(stacks.pop(SourceId(2), 1), PopOutcome::default());
    }

    #[test]
    fn test_pop_discards_frames_above() {
        let mut stacks = CallStacks::new(8, 8);
        stacks.push(S, 1, EventId(10));
        stacks.push(S, 2, EventId(11));
        stacks.push(S, 3, EventId(12));
        let out = stacks.pop(S, 1);
        assert_eq!(out.entry, Some(EventId(10)));
        assert_eq!(out.abandoned, 2);
        assert_eq!(stacks.depth(S), 0);
    }

    #[test]
    fn test_recursive_call_ids_match_innermost() {
        let mut stacks = CallStacks::new(8, 8);
        stacks.push(S, 5, EventId(10));
        stacks.push(S, 5, EventId(11));
        assert_eq!(stacks.pop(S, 5).entry, Some(EventId(11)));
        assert_eq!(stacks.pop(S, 5).entry, Some(EventId(10)));
    }

    #[test]
    fn test_depth_overflow_evicts_bottom() {
        let mut stacks = CallStacks::new(2, 8);
        stacks.push(S, 1, EventId(10));
        stacks.push(S, 2, EventId(11));
        let out = stacks.push(S, 3, EventId(12));
        assert_eq!(out.frames_evicted, 1);
        assert_eq!(stacks.depth(S), 2);
        assert_eq!(stacks.pop(S, 1), PopOutcome::default());
        assert_eq!(stacks.pop(S, 2).entry, Some(EventId(11)));
    }

    #[test]
    fn test_lru_source_eviction() {
        let mut stacks = CallStacks::new(8, 2);
        stacks.push(SourceId(1), 1, EventId(1));
        stacks.push(SourceId(2), 1, EventId(2));
        // touch source 1 so source 2 becomes least recent
        stacks.push(SourceId(1), 2, EventId(3));

        let out = stacks.push(SourceId(3), 1, EventId(4));
        assert!(out.source_evicted);
        assert_eq!(out.source_frames_evicted, 1);
        assert_eq!(stacks.tracked_sources(), 2);
        assert_eq!(stacks.depth(SourceId(2)), 0);
        assert_eq!(stacks.depth(SourceId(1)), 2);
    }

    #[test]
    fn test_clear() {
        let mut stacks = CallStacks::new(8, 8);
        stacks.push(S, 1, EventId(10));
        stacks.push(S, 2, EventId(11));
        assert_eq!(stacks.clear(S), 2);
        assert_eq!(stacks.innermost(S), None);
        assert_eq!(stacks.clear(S), 0);
    }
}
