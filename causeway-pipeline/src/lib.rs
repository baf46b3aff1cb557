//! Causeway Pipeline - Writer Pool and Engine
//!
//! Moves events from the capture lanes into the hot store:
//!
//! ```text
//! producers ──ingest──▶ CaptureLanes ──drain workers──▶ shard channels
//!                                                          │
//!                        HotStore ◀──StoreWriter── shard workers (correlate)
//! ```
//!
//! Drain workers take a shared gate, drain a batch, decode it and route
//! every event to the shard owning its routing key. Each shard worker owns
//! one `CorrelatorShard` outright and writes its correlated batches through
//! a `StoreWriter` that backs off and splits batches under store pressure.
//! All workers run under a `Supervisor` that restarts them after a panic.

pub mod engine;
pub mod error;
pub mod jobs;
pub mod shard_worker;
pub mod stats;
pub mod supervisor;
pub mod telemetry;
pub mod writer;

pub use engine::{CompletenessReport, Engine, EngineBuilder};
pub use error::{PipelineError, PipelineResult};
pub use jobs::{retention_task, RetentionMetrics, RetentionSnapshot};
pub use shard_worker::{ShardSlot, StoreWriter};
pub use stats::{PipelineStats, PipelineStatsSnapshot};
pub use supervisor::{Supervisor, WorkerFuture};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
pub use writer::DrainContext;
