//! CAUSEWAY Capture - Producer Side
//!
//! Producers call [`Ingestor::ingest`] inline. The event is gated, stamped,
//! truncated and encoded straight into a slot of a lock-free ring, where the
//! writer pool picks it up. Nothing on this path takes a lock, performs I/O
//! or reports an error to the caller.

pub mod ingest;
pub mod lanes;
pub mod ring;
pub mod stats;

pub use ingest::{Ingestor, IngestorBuilder, Sampler, SourceHandle};
pub use lanes::{CaptureLanes, Lane, LaneDrain, LaneStatsSnapshot};
pub use ring::{RingBuffer, RingConfig, SlotHandle};
pub use stats::{IngestStats, IngestStatsSnapshot, RingStats, RingStatsSnapshot};
