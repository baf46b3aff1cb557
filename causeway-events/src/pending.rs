//! Sends waiting for their receive.

use causeway_core::{EventId, SourceId, Timestamp};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

type Key = (SourceId, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    send: EventId,
    at: Timestamp,
}

/// Pending sends keyed by `(sender, message_id)`.
///
/// Bounded two ways: entries older than `ttl` (in capture time) expire, and
/// once `max_entries` is reached the oldest entry is evicted.
#[derive(Debug)]
pub struct PendingSends {
    entries: HashMap<Key, Pending>,
    /// Insertion order. May hold stale keys already consumed or replaced.
    order: VecDeque<(Key, EventId, Timestamp)>,
    max_entries: usize,
    ttl_nanos: u64,
}

impl PendingSends {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_entries: max_entries.max(1),
            ttl_nanos: u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX),
        }
    }

    /// Record a send. Returns how many older sends were evicted to make
    /// room, including one replaced under the same key.
    pub fn insert(
        &mut self,
        sender: SourceId,
        message_id: u64,
        send: EventId,
        at: Timestamp,
    ) -> u64 {
        let key = (sender, message_id);
        let mut evicted = 0;
        if self.entries.insert(key, Pending { send, at }).is_some() {
            evicted += 1;
        }
        self.order.push_back((key, send, at));

        while self.entries.len() > self.max_entries {
            match self.order.pop_front() {
                Some((old_key, old_send, _)) => {
                    if self.remove_if_current(old_key, old_send) {
                        evicted += 1;
                    }
                }
                None => break,
            }
        }
        self.compact();
        evicted
    }

    /// Consume the pending send for `(sender, message_id)`.
    pub fn take(&mut self, sender: SourceId, message_id: u64) -> Option<EventId> {
        self.entries.remove(&(sender, message_id)).map(|p| p.send)
    }

    /// Drop sends older than the ttl relative to `now`. Returns how many.
    pub fn expire(&mut self, now: Timestamp) -> u64 {
        let mut expired = 0;
        while let Some(&(key, send, at)) = self.order.front() {
            if now.saturating_since(at) <= self.ttl_nanos {
                break;
            }
            self.order.pop_front();
            if self.remove_if_current(key, send) {
                expired += 1;
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_if_current(&mut self, key: Key, send: EventId) -> bool {
        match self.entries.get(&key) {
            Some(p) if p.send == send => {
                self.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Keep the order queue from growing without bound when most sends are
    /// consumed promptly.
    fn compact(&mut self) {
        if self.order.len() > self.entries.len().saturating_mul(2).max(64) {
            let entries = &self.entries;
            self.order
                .retain(|(key, send, _)| entries.get(key).is_some_and(|p| p.send == *send));
        }
    }
}
