//! Causeway Storage - Hot Event Store
//!
//! Correlated events land in a [`HotStore`]: a primary map keyed by event id
//! plus secondary indexes by source and time, by correlation id, by age and
//! by state change. Retention prunes the store in place and hands the
//! removed events to a [`ColdArchive`].

pub mod archive;
pub mod hot_store;
pub mod retention;

pub use archive::{ColdArchive, MemoryArchive, NullArchive};
pub use hot_store::{HotStore, StoreStatsSnapshot};
pub use retention::{PruneReport, RetentionWindow};

use causeway_core::{CorrelationId, Event, EventId, SourceId, StorageError, TimeRange, Timestamp};

/// Outcome of a batch write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub written: usize,
    /// Ids already present. The originals are kept, the newcomers dropped.
    pub duplicates: Vec<EventId>,
}

/// Storage seam between the pipeline, the query layer and a backend.
///
/// Calls are synchronous and bounded: a backend that cannot get to its data
/// in time returns [`StorageError::Saturated`] instead of blocking the
/// writer indefinitely.
pub trait EventStore: Send + Sync {
    /// Store a batch. Duplicates are reported, not fatal.
    fn write_batch(&self, events: Vec<Event>) -> Result<WriteReport, StorageError>;

    fn get(&self, id: EventId) -> Result<Event, StorageError>;

    /// Events of `source` within `range`, ascending by timestamp then id.
    fn get_by_source(&self, source: SourceId, range: TimeRange) -> Result<Vec<Event>, StorageError>;

    /// Events carrying `correlation`, ascending by id.
    fn get_by_correlation(&self, correlation: CorrelationId) -> Result<Vec<Event>, StorageError>;

    /// Most recent state change of `source` at or before `at`.
    fn latest_state_change(
        &self,
        source: SourceId,
        at: Timestamp,
    ) -> Result<Option<Event>, StorageError>;

    /// Remove what falls outside `window` as of `now`.
    fn prune(&self, window: &RetentionWindow, now: Timestamp) -> Result<PruneReport, StorageError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
