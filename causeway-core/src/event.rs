//! Event types for the capture pipeline.
//!
//! An `Event` is created once by a producer call and is read-only from then
//! on, with one exception: the correlator attaches `correlation_id`,
//! `parent_id` and the `ORPHANED`/`UNMATCHED` flags before the event is
//! stored.

use crate::digest::Digest;
use crate::{CorrelationId, EventId, NodeTag, SourceId, Timestamp};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Maximum byte length of module, function and callback names.
pub const MAX_NAME_LEN: usize = 255;

// ============================================================================
// EVENT FLAGS
// ============================================================================

bitflags! {
    /// Flags describing how an event was captured and correlated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventFlags: u8 {
        /// Payload, digest or name was cut to the capture budget
        const TRUNCATED = 0b0000_0001;
        /// Function exit with no matching open entry
        const ORPHANED = 0b0000_0010;
        /// Message receive with no matching pending send
        const UNMATCHED = 0b0000_0100;
        /// Carried on the priority lane
        const CRITICAL = 0b0000_1000;
    }
}

impl Default for EventFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// Manual serde implementation for EventFlags (bitflags 2.x + serde)
impl Serialize for EventFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EventFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        Self::from_bits(bits).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid EventFlags bits: {:#04x}", bits))
        })
    }
}

// ============================================================================
// EVENT KIND
// ============================================================================

/// Wire tag of each event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum KindTag {
    FunctionEntry = 1,
    FunctionExit = 2,
    StateChange = 3,
    MessageSend = 4,
    MessageReceive = 5,
    UnitSpawn = 6,
    UnitExit = 7,
}

impl KindTag {
    pub const ALL: [KindTag; 7] = [
        KindTag::FunctionEntry,
        KindTag::FunctionExit,
        KindTag::StateChange,
        KindTag::MessageSend,
        KindTag::MessageReceive,
        KindTag::UnitSpawn,
        KindTag::UnitExit,
    ];

    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::FunctionEntry),
            2 => Some(Self::FunctionExit),
            3 => Some(Self::StateChange),
            4 => Some(Self::MessageSend),
            5 => Some(Self::MessageReceive),
            6 => Some(Self::UnitSpawn),
            7 => Some(Self::UnitExit),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::FunctionEntry => "function_entry",
            Self::FunctionExit => "function_exit",
            Self::StateChange => "state_change",
            Self::MessageSend => "message_send",
            Self::MessageReceive => "message_receive",
            Self::UnitSpawn => "unit_spawn",
            Self::UnitExit => "unit_exit",
        }
    }
}

impl fmt::Display for KindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    FunctionEntry {
        call_id: u64,
        module: String,
        function: String,
        arity: u8,
        args_digest: Digest,
    },
    FunctionExit {
        call_id: u64,
        result_digest: Digest,
        #[serde(with = "duration_nanos")]
        duration: Duration,
    },
    StateChange {
        callback: String,
        state_before_digest: Digest,
        state_after_digest: Digest,
    },
    MessageSend {
        message_id: u64,
        to_source_id: SourceId,
        payload_digest: Digest,
    },
    MessageReceive {
        message_id: u64,
        from_source_id: SourceId,
        payload_digest: Digest,
    },
    UnitSpawn {
        parent_source_id: SourceId,
        child_source_id: SourceId,
    },
    UnitExit {
        reason_digest: Digest,
    },
}

impl EventKind {
    pub const fn tag(&self) -> KindTag {
        match self {
            Self::FunctionEntry { .. } => KindTag::FunctionEntry,
            Self::FunctionExit { .. } => KindTag::FunctionExit,
            Self::StateChange { .. } => KindTag::StateChange,
            Self::MessageSend { .. } => KindTag::MessageSend,
            Self::MessageReceive { .. } => KindTag::MessageReceive,
            Self::UnitSpawn { .. } => KindTag::UnitSpawn,
            Self::UnitExit { .. } => KindTag::UnitExit,
        }
    }

    /// Kinds that travel on the priority lane.
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::UnitExit { .. })
    }

    /// Convenience constructor for a function entry.
    pub fn function_entry(
        call_id: u64,
        module: impl Into<String>,
        function: impl Into<String>,
        arity: u8,
        args_digest: Digest,
    ) -> Self {
        Self::FunctionEntry {
            call_id,
            module: module.into(),
            function: function.into(),
            arity,
            args_digest,
        }
    }

    pub fn function_exit(call_id: u64, result_digest: Digest, duration: Duration) -> Self {
        Self::FunctionExit {
            call_id,
            result_digest,
            duration,
        }
    }

    pub fn state_change(callback: impl Into<String>, before: Digest, after: Digest) -> Self {
        Self::StateChange {
            callback: callback.into(),
            state_before_digest: before,
            state_after_digest: after,
        }
    }

    pub fn message_send(message_id: u64, to: SourceId, payload_digest: Digest) -> Self {
        Self::MessageSend {
            message_id,
            to_source_id: to,
            payload_digest,
        }
    }

    pub fn message_receive(message_id: u64, from: SourceId, payload_digest: Digest) -> Self {
        Self::MessageReceive {
            message_id,
            from_source_id: from,
            payload_digest,
        }
    }

    pub fn unit_spawn(parent: SourceId, child: SourceId) -> Self {
        Self::UnitSpawn {
            parent_source_id: parent,
            child_source_id: child,
        }
    }

    pub fn unit_exit(reason_digest: Digest) -> Self {
        Self::UnitExit { reason_digest }
    }

    fn digests_mut(&mut self) -> impl Iterator<Item = &mut Digest> {
        let (a, b): (Option<&mut Digest>, Option<&mut Digest>) = match self {
            Self::FunctionEntry { args_digest, .. } => (Some(args_digest), None),
            Self::FunctionExit { result_digest, .. } => (Some(result_digest), None),
            Self::StateChange {
                state_before_digest,
                state_after_digest,
                ..
            } => (Some(state_before_digest), Some(state_after_digest)),
            Self::MessageSend { payload_digest, .. }
            | Self::MessageReceive { payload_digest, .. } => (Some(payload_digest), None),
            Self::UnitSpawn { .. } => (None, None),
            Self::UnitExit { reason_digest } => (Some(reason_digest), None),
        };
        a.into_iter().chain(b)
    }

    fn names_mut(&mut self) -> impl Iterator<Item = &mut String> {
        let (a, b): (Option<&mut String>, Option<&mut String>) = match self {
            Self::FunctionEntry {
                module, function, ..
            } => (Some(module), Some(function)),
            Self::StateChange { callback, .. } => (Some(callback), None),
            _ => (None, None),
        };
        a.into_iter().chain(b)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FunctionEntry {
                call_id,
                module,
                function,
                arity,
                ..
            } => write!(f, "call {}:{}/{} #{}", module, function, arity, call_id),
            Self::FunctionExit {
                call_id, duration, ..
            } => write!(f, "return #{} after {:?}", call_id, duration),
            Self::StateChange { callback, .. } => write!(f, "state change in {}", callback),
            Self::MessageSend {
                message_id,
                to_source_id,
                ..
            } => write!(f, "send m{} to {}", message_id, to_source_id),
            Self::MessageReceive {
                message_id,
                from_source_id,
                ..
            } => write!(f, "receive m{} from {}", message_id, from_source_id),
            Self::UnitSpawn {
                parent_source_id,
                child_source_id,
            } => write!(f, "spawn {} -> {}", parent_source_id, child_source_id),
            Self::UnitExit { reason_digest } => write!(f, "exit: {}", reason_digest),
        }
    }
}

mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}

// ============================================================================
// CAPTURE LIMITS
// ============================================================================

/// Budgets applied to every event before it is serialized into a ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureLimits {
    /// Maximum opaque payload bytes
    pub payload_budget: usize,
    /// Maximum captured bytes per digest
    pub digest_budget: usize,
}

impl CaptureLimits {
    pub const fn new(payload_budget: usize, digest_budget: usize) -> Self {
        Self {
            payload_budget,
            digest_budget,
        }
    }

    /// Largest encoded size any event can have after `Event::truncate_to`.
    /// This is the ring buffer slot size.
    pub fn max_event_size(&self) -> usize {
        crate::codec::max_encoded_len(self)
    }
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self::new(2048, 256)
    }
}

// ============================================================================
// EVENT
// ============================================================================

/// An immutable record of something an execution unit did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub source_id: SourceId,
    #[serde(default)]
    pub node_tag: NodeTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<EventId>,
    #[serde(default)]
    pub flags: EventFlags,
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Event {
    /// Create an uncorrelated event with no payload.
    pub fn new(id: EventId, timestamp: Timestamp, source_id: SourceId, kind: EventKind) -> Self {
        let flags = if kind.is_critical() {
            EventFlags::CRITICAL
        } else {
            EventFlags::empty()
        };
        Self {
            id,
            timestamp,
            source_id,
            node_tag: NodeTag::LOCAL,
            correlation_id: None,
            parent_id: None,
            flags,
            kind,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_node_tag(mut self, node_tag: NodeTag) -> Self {
        self.node_tag = node_tag;
        self
    }

    pub fn kind_tag(&self) -> KindTag {
        self.kind.tag()
    }

    pub fn is_critical(&self) -> bool {
        self.flags.contains(EventFlags::CRITICAL) || self.kind.is_critical()
    }

    pub fn is_orphaned(&self) -> bool {
        self.flags.contains(EventFlags::ORPHANED)
    }

    pub fn is_unmatched(&self) -> bool {
        self.flags.contains(EventFlags::UNMATCHED)
    }

    pub fn is_truncated(&self) -> bool {
        self.flags.contains(EventFlags::TRUNCATED)
    }

    /// Attach correlator output.
    pub fn correlate(&mut self, correlation_id: Option<CorrelationId>, parent_id: Option<EventId>) {
        self.correlation_id = correlation_id;
        self.parent_id = parent_id;
    }

    /// Cut payload, digests and names down to `limits`, setting
    /// `TRUNCATED` if anything was removed. Returns whether it did.
    pub fn truncate_to(&mut self, limits: &CaptureLimits) -> bool {
        let mut cut = false;

        if self.payload.len() > limits.payload_budget {
            self.payload.truncate(limits.payload_budget);
            cut = true;
        }
        let digest_budget = limits.digest_budget.min(crate::digest::MAX_DIGEST_LEN);
        for digest in self.kind.digests_mut() {
            cut |= digest.truncate_to(digest_budget);
        }
        for name in self.kind.names_mut() {
            cut |= truncate_name(name, MAX_NAME_LEN);
        }

        if cut {
            self.flags.insert(EventFlags::TRUNCATED);
        }
        cut
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} @{} {}] {}",
            self.id, self.timestamp, self.source_id, self.kind
        )
    }
}

/// Truncate on a char boundary at or below `limit` bytes.
fn truncate_name(name: &mut String, limit: usize) -> bool {
    if name.len() <= limit {
        return false;
    }
    let mut end = limit;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name.truncate(end);
    true
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(call_id: u64) -> EventKind {
        EventKind::function_entry(call_id, "kv", "put", 2, Digest::from("[k, v]"))
    }

    #[test]
    fn test_kind_tag_roundtrip() {
        for tag in KindTag::ALL {
            assert_eq!(KindTag::from_u8(tag.as_u8()), Some(tag));
        }
        assert_eq!(KindTag::from_u8(0), None);
        assert_eq!(KindTag::from_u8(8), None);
    }

    #[test]
    fn test_unit_exit_is_critical() {
        let e = Event::new(
            EventId(1),
            Timestamp(1),
            SourceId(1),
            EventKind::unit_exit(Digest::from("normal")),
        );
        assert!(e.is_critical());
        assert!(e.flags.contains(EventFlags::CRITICAL));

        let e = Event::new(EventId(2), Timestamp(2), SourceId(1), entry(1));
        assert!(!e.is_critical());

        let spawn = EventKind::unit_spawn(SourceId(1), SourceId(2));
        assert!(!spawn.is_critical());
    }

    #[test]
    fn test_truncate_payload_sets_flag() {
        let mut e =
            Event::new(EventId(1), Timestamp(1), SourceId(1), entry(1)).with_payload(vec![0u8; 64]);
        assert!(e.truncate_to(&CaptureLimits::new(16, 256)));
        assert_eq!(e.payload.len(), 16);
        assert!(e.is_truncated());
    }

    #[test]
    fn test_truncate_digests() {
        let before = Digest::capture(&[1u8; 100], 100);
        let after = Digest::capture(&[2u8; 100], 100);
        let mut e = Event::new(
            EventId(1),
            Timestamp(1),
            SourceId(1),
            EventKind::state_change("handle_call", before, after),
        );
        assert!(e.truncate_to(&CaptureLimits::new(2048, 8)));
        match &e.kind {
            EventKind::StateChange {
                state_before_digest,
                state_after_digest,
                ..
            } => {
                assert_eq!(state_before_digest.len(), 8);
                assert_eq!(state_after_digest.len(), 8);
                assert!(state_before_digest.is_truncated());
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_truncate_name_on_char_boundary() {
        let long = "é".repeat(200); // 400 bytes
        let mut e = Event::new(
            EventId(1),
            Timestamp(1),
            SourceId(1),
            EventKind::function_entry(1, long, "f", 0, Digest::empty()),
        );
        assert!(e.truncate_to(&CaptureLimits::default()));
        match &e.kind {
            EventKind::FunctionEntry { module, .. } => {
                assert!(module.len() <= MAX_NAME_LEN);
                assert_eq!(module.len() % 2, 0);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_within_limits_untouched() {
        let mut e =
            Event::new(EventId(1), Timestamp(1), SourceId(1), entry(1)).with_payload(b"ok".to_vec());
        assert!(!e.truncate_to(&CaptureLimits::default()));
        assert!(!e.is_truncated());
    }

    #[test]
    fn test_flags_serde() {
        let flags = EventFlags::ORPHANED | EventFlags::TRUNCATED;
        let json = serde_json::to_string(&flags).unwrap();
        assert_eq!(json, "3");
        let back: EventFlags = serde_json::from_str(&json).unwrap();
        assert_eq!(back, flags);
        assert!(serde_json::from_str::<EventFlags>("128").is_err());
    }

    #[test]
    fn test_event_json_roundtrip() {
        let e = Event::new(
            EventId(9),
            Timestamp(1_000),
            SourceId(2),
            EventKind::function_exit(4, Digest::from("ok"), Duration::from_micros(15)),
        );
        let json = serde_json::to_string(&e).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
