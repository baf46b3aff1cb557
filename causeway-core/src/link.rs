//! Causal links derived from correlated events.

use crate::event::{Event, EventKind};
use crate::{EventId, SourceId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A causal relation between events. Never created by producers; always
/// recovered from the ids the correlator attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CorrelationLink {
    CallReturn { entry: EventId, exit: EventId },
    SendReceive { send: EventId, receive: EventId },
    SpawnChild {
        spawn: EventId,
        parent: SourceId,
        child: SourceId,
    },
}

impl CorrelationLink {
    /// Recover the link closed by `event`, if it closes one.
    ///
    /// Exits and receives yield a link only when the correlator matched
    /// them. A spawn always yields its link since both ends are embedded.
    pub fn derive(event: &Event) -> Option<Self> {
        match &event.kind {
            EventKind::FunctionExit { .. } if !event.is_orphaned() => {
                event.correlation_id.map(|c| Self::CallReturn {
                    entry: c.origin(),
                    exit: event.id,
                })
            }
            EventKind::MessageReceive { .. } if !event.is_unmatched() => {
                event.correlation_id.map(|c| Self::SendReceive {
                    send: c.origin(),
                    receive: event.id,
                })
            }
            EventKind::UnitSpawn {
                parent_source_id,
                child_source_id,
            } => Some(Self::SpawnChild {
                spawn: event.id,
                parent: *parent_source_id,
                child: *child_source_id,
            }),
            _ => None,
        }
    }

    /// The event that opened the relation.
    pub fn origin(&self) -> EventId {
        match self {
            Self::CallReturn { entry, .. } => *entry,
            Self::SendReceive { send, .. } => *send,
            Self::SpawnChild { spawn, .. } => *spawn,
        }
    }

    /// Whether `id` is one of the linked events.
    pub fn touches(&self, id: EventId) -> bool {
        match self {
            Self::CallReturn { entry, exit } => *entry == id || *exit == id,
            Self::SendReceive { send, receive } => *send == id || *receive == id,
            Self::SpawnChild { spawn, .. } => *spawn == id,
        }
    }
}

impl fmt::Display for CorrelationLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallReturn { entry, exit } => write!(f, "{} returns via {}", entry, exit),
            Self::SendReceive { send, receive } => write!(f, "{} received as {}", send, receive),
            Self::SpawnChild {
                spawn,
                parent,
                child,
            } => write!(f, "{} spawned {} from {}", spawn, child, parent),
        }
    }
}
