//! CAUSEWAY Events - Causal Correlation
//!
//! Decoded events pass through a correlator shard before they are stored.
//! The shard attaches `correlation_id` and `parent_id`:
//!
//! ```text
//! FunctionEntry   corr = own id        parent = enclosing open call
//! FunctionExit    corr = entry id      parent = entry id       (or ORPHANED)
//! StateChange                          parent = innermost open call
//! MessageSend     corr = own id
//! MessageReceive  corr = send id       parent = send id        (or UNMATCHED)
//! UnitSpawn       corr = own id
//! UnitExit                             parent = innermost open call, stack cleared
//! ```
//!
//! # Key Types
//!
//! - `Correlator`: router plus all shards, split apart for the writer pool
//! - `CorrelatorShard`: exclusively owned per-shard state
//! - `ShardRouter`: consistent hashing over the routing key
//! - `CorrelationStats`: atomic outcome counters shared by all shards

pub mod call_stack;
pub mod correlator;
pub mod pending;
pub mod router;

pub use call_stack::{CallStacks, PopOutcome, PushOutcome};
pub use correlator::{Correlator, CorrelationStats, CorrelationStatsSnapshot, CorrelatorShard};
pub use pending::PendingSends;
pub use router::{routing_key, ShardRouter};

// Re-export core types for convenience
pub use causeway_core::{CorrelationId, CorrelationLink, Event, EventFlags, EventId, EventKind};
