//! Cold archive hooks for pruned events.

use async_trait::async_trait;
use causeway_core::{ArchiveError, Event};
use parking_lot::Mutex;
use uuid::Uuid;

/// Destination for events leaving the hot store.
///
/// Called by the retention job after each prune with the events removed,
/// oldest first. A failed archive is logged by the caller; the events are
/// already gone from the hot store.
#[async_trait]
pub trait ColdArchive: Send + Sync {
    async fn archive(&self, session: Uuid, events: Vec<Event>) -> Result<(), ArchiveError>;

    fn name(&self) -> &'static str;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullArchive;

#[async_trait]
impl ColdArchive for NullArchive {
    async fn archive(&self, _session: Uuid, _events: Vec<Event>) -> Result<(), ArchiveError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// Keeps archived events in memory, tagged with their session.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    batches: Mutex<Vec<(Uuid, Vec<Event>)>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn event_count(&self) -> usize {
        self.batches.lock().iter().map(|(_, b)| b.len()).sum()
    }

    /// All archived events for `session`, in archive order.
    pub fn events_for(&self, session: Uuid) -> Vec<Event> {
        self.batches
            .lock()
            .iter()
            .filter(|(s, _)| *s == session)
            .flat_map(|(_, b)| b.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl ColdArchive for MemoryArchive {
    async fn archive(&self, session: Uuid, events: Vec<Event>) -> Result<(), ArchiveError> {
        if !events.is_empty() {
            self.batches.lock().push((session, events));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_core::{Digest, EventId, EventKind, SourceId, Timestamp};

    fn ev(id: u64) -> Event {
        Event::new(
            EventId(id),
            Timestamp(id),
            SourceId(1),
            EventKind::unit_exit(Digest::from("normal")),
        )
    }

    #[tokio::test]
    async fn test_memory_archive_groups_by_session() {
        let archive = MemoryArchive::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        archive.archive(a, vec![ev(1), ev(2)]).await.unwrap();
        archive.archive(b, vec![ev(3)]).await.unwrap();
        archive.archive(a, Vec::new()).await.unwrap();

        assert_eq!(archive.batch_count(), 2);
        assert_eq!(archive.event_count(), 3);
        let ids: Vec<u64> = archive.events_for(a).iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_null_archive_accepts() {
        assert!(NullArchive.archive(Uuid::nil(), vec![ev(1)]).await.is_ok());
        assert_eq!(NullArchive.name(), "null");
    }
}
