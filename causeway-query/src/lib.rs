//! Causeway Query - Causal Queries
//!
//! Synchronous, read-only views over an [`EventStore`]:
//!
//! | Query          | Answers                                              |
//! |----------------|------------------------------------------------------|
//! | `timeline`     | what a source did in a time range                    |
//! | `state_at`     | the last state a source committed at or before `t`   |
//! | `message_flow` | which messages two sources exchanged, in send order  |
//! | `call_stack`   | which calls a source had open at `t`                 |
//! | `links`        | which causal relations an event takes part in        |
//!
//! Missing answers are `QueryError::NotFound`, never a panic.

use causeway_core::{
    CorrelationLink, Event, EventId, EventKind, QueryError, SourceId, StorageError, TimeRange,
    Timestamp,
};
use causeway_storage::EventStore;
use serde::Serialize;
use std::sync::Arc;

/// Which way a message travelled relative to the queried pair `(a, b)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    AToB,
    BToA,
}

/// A send and the receive the correlator matched to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessagePair {
    pub send: Event,
    pub receive: Event,
    pub direction: Direction,
}

/// An open call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallFrame {
    pub entry: EventId,
    pub call_id: u64,
    pub module: String,
    pub function: String,
    pub arity: u8,
    pub entered_at: Timestamp,
}

impl CallFrame {
    fn from_entry(event: &Event) -> Option<Self> {
        match &event.kind {
            EventKind::FunctionEntry {
                call_id,
                module,
                function,
                arity,
                ..
            } => Some(Self {
                entry: event.id,
                call_id: *call_id,
                module: module.clone(),
                function: function.clone(),
                arity: *arity,
                entered_at: event.timestamp,
            }),
            _ => None,
        }
    }
}

/// Query front end over a shared store.
#[derive(Clone)]
pub struct QueryCoordinator {
    store: Arc<dyn EventStore>,
}

impl std::fmt::Debug for QueryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCoordinator")
            .field("events", &self.store.len())
            .finish()
    }
}

impl QueryCoordinator {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Events of `source` within `range`, in emission order.
    pub fn timeline(&self, source: SourceId, range: TimeRange) -> Result<Vec<Event>, QueryError> {
        Ok(self.store.get_by_source(source, range)?)
    }

    /// The state change of `source` with the greatest timestamp `<= at`.
    pub fn state_at(&self, source: SourceId, at: Timestamp) -> Result<Event, QueryError> {
        self.store
            .latest_state_change(source, at)?
            .ok_or(QueryError::NotFound {
                what: "state change",
                source_id: source,
                at,
            })
    }

    /// Matched messages between `a` and `b` in both directions, ordered by
    /// send time. Unmatched receives and sends without a receive are left
    /// out.
    pub fn message_flow(&self, a: SourceId, b: SourceId) -> Result<Vec<MessagePair>, QueryError> {
        let mut pairs = Vec::new();
        let receivers = if a == b {
            vec![(a, a, Direction::AToB)]
        } else {
            vec![(b, a, Direction::AToB), (a, b, Direction::BToA)]
        };

        for (receiver, sender, direction) in receivers {
            for receive in self.store.get_by_source(receiver, TimeRange::all())? {
                let Some(CorrelationLink::SendReceive { send, .. }) =
                    CorrelationLink::derive(&receive)
                else {
                    continue;
                };
                let from_sender = matches!(
                    receive.kind,
                    EventKind::MessageReceive { from_source_id, .. } if from_source_id == sender
                );
                if !from_sender {
                    continue;
                }
                match self.store.get(send) {
                    Ok(send) => pairs.push(MessagePair {
                        send,
                        receive,
                        direction,
                    }),
                    Err(StorageError::NotFound { id }) => {
                        tracing::debug!(send = %id, receive = %receive.id, "Send already pruned");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        pairs.sort_by_key(|p| (p.send.timestamp, p.send.id));
        Ok(pairs)
    }

    /// Calls `source` had open at `at`, outermost first.
    ///
    /// Replays the source's timeline: entries push, matched exits pop back
    /// to their entry, orphaned exits are ignored and a unit exit clears
    /// everything.
    pub fn call_stack(&self, source: SourceId, at: Timestamp) -> Result<Vec<CallFrame>, QueryError> {
        let mut frames: Vec<CallFrame> = Vec::new();
        for event in self.store.get_by_source(source, TimeRange::until(at))? {
            match &event.kind {
                EventKind::FunctionEntry { .. } => frames.extend(CallFrame::from_entry(&event)),
                EventKind::FunctionExit { .. } => {
                    if let Some(CorrelationLink::CallReturn { entry, .. }) =
                        CorrelationLink::derive(&event)
                    {
                        if let Some(pos) = frames.iter().rposition(|f| f.entry == entry) {
                            frames.truncate(pos);
                        }
                    }
                }
                EventKind::UnitExit { .. } => frames.clear(),
                _ => {}
            }
        }
        Ok(frames)
    }

    /// Every derived link that `id` takes part in.
    pub fn links(&self, id: EventId) -> Result<Vec<CorrelationLink>, QueryError> {
        let event = self.store.get(id).map_err(|e| match e {
            StorageError::NotFound { id } => QueryError::EventNotFound(id),
            other => other.into(),
        })?;
        let Some(correlation) = event.correlation_id else {
            return Ok(Vec::new());
        };

        let mut links: Vec<CorrelationLink> = self
            .store
            .get_by_correlation(correlation)?
            .iter()
            .filter_map(CorrelationLink::derive)
            .filter(|link| link.touches(id))
            .collect();
        links.dedup();
        Ok(links)
    }
}

// ============================================================================
// TESTS
// ============================================================================
