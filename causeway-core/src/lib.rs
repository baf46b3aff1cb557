//! CAUSEWAY Core - Event Schema and Shared Vocabulary
//!
//! Every other crate in the workspace depends on this one. It holds the
//! event model, the versioned binary codec, error types, configuration and
//! the emission plan that gates producers.
//!
//! # Key Types
//!
//! - `Event`: an immutable record emitted by an execution unit
//! - `EventKind`: the tagged variant (calls, state changes, messages, lifecycle)
//! - `Digest`: a bounded, possibly truncated representation of a value
//! - `CorrelationLink`: a causal relation derived from correlated events
//! - `CausewayConfig`: the validated configuration surface

pub mod clock;
pub mod codec;
pub mod config;
pub mod digest;
pub mod error;
pub mod event;
pub mod link;
pub mod plan;

pub use clock::Clock;
pub use codec::{decode, encode, encode_into, encoded_len, FORMAT_VERSION, HEADER_LEN};
pub use config::{
    CaptureConfig, CaptureMode, CausewayConfig, CorrelatorConfig, OverflowPolicy, RetentionConfig,
    WriterConfig,
};
pub use digest::Digest;
pub use error::{
    ArchiveError, CaptureError, CausewayError, CausewayResult, CodecError, ConfigError,
    QueryError, StorageError,
};
pub use event::{CaptureLimits, Event, EventFlags, EventKind, KindTag, MAX_NAME_LEN};
pub use link::CorrelationLink;
pub use plan::{EmissionPlan, KindSet, PlanRule, SourcePattern};

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $repr:ty, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $repr);

        impl $name {
            /// Create a new identifier from its raw value.
            pub const fn new(raw: $repr) -> Self {
                Self(raw)
            }

            /// The raw value.
            pub const fn get(self) -> $repr {
                self.0
            }
        }

        impl From<$repr> for $name {
            fn from(raw: $repr) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Event identifier. Assigned from a single atomic counter, so it is
    /// strictly increasing per source (and globally).
    EventId,
    u64,
    "e"
);

define_id!(
    /// Identifier of the emitting execution unit (actor/process analogue).
    SourceId,
    u64,
    "s"
);

define_id!(
    /// Identifier linking causally related events. Always the id of the
    /// event that opened the relation (call entry, message send, spawn).
    CorrelationId,
    u64,
    "c"
);

define_id!(
    /// Reserved node tag for future multi-node capture.
    NodeTag,
    u16,
    "n"
);

impl NodeTag {
    /// The only node tag in use today.
    pub const LOCAL: Self = Self(0);
}

impl Default for NodeTag {
    fn default() -> Self {
        Self::LOCAL
    }
}

impl From<EventId> for CorrelationId {
    fn from(id: EventId) -> Self {
        Self(id.0)
    }
}

impl CorrelationId {
    /// The event that opened this correlation.
    pub const fn origin(self) -> EventId {
        EventId(self.0)
    }
}

/// Monotonic timestamp in nanoseconds since the capturing clock's epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Nanoseconds elapsed since `earlier`, saturating at zero.
    pub const fn saturating_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

/// Inclusive time range used by source-scoped queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub const fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Everything ever recorded.
    pub const fn all() -> Self {
        Self::new(Timestamp::ZERO, Timestamp::MAX)
    }

    /// Everything recorded at or before `end`.
    pub const fn until(end: Timestamp) -> Self {
        Self::new(Timestamp::ZERO, end)
    }

    pub const fn contains(&self, ts: Timestamp) -> bool {
        ts.0 >= self.start.0 && ts.0 <= self.end.0
    }

    pub const fn is_empty(&self) -> bool {
        self.start.0 > self.end.0
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(EventId(7).to_string(), "e7");
        assert_eq!(SourceId(3).to_string(), "s3");
        assert_eq!(CorrelationId(9).to_string(), "c9");
    }

    #[test]
    fn test_correlation_origin() {
        let c = CorrelationId::from(EventId(42));
        assert_eq!(c.origin(), EventId(42));
    }

    #[test]
    fn test_time_range() {
        let r = TimeRange::new(Timestamp(10), Timestamp(20));
        assert!(r.contains(Timestamp(10)));
        assert!(r.contains(Timestamp(20)));
        assert!(!r.contains(Timestamp(21)));
        assert!(!r.is_empty());
        assert!(TimeRange::new(Timestamp(5), Timestamp(1)).is_empty());
        assert!(TimeRange::all().contains(Timestamp::MAX));
    }
}
