//! Query event bus: typed lifecycle events for every query.
//!
//! A `tokio::sync::broadcast` channel carrying [`QueryEvent`] values. With no
//! subscribers, events are silently dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::query::executor::StepState;

/// Every event a query emits. Serialized as JSON with a `type` tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QueryEvent {
    /// A query call has started against `endpoint`.
    QueryStarted { query_id: Uuid, endpoint: String },
    /// The endpoint was turned into a content address.
    EndpointResolved {
        query_id: Uuid,
        endpoint: String,
        address: String,
    },
    /// The package manifest was fetched and decoded.
    PackageLoaded {
        query_id: Uuid,
        address: String,
        name: String,
    },
    /// Planning succeeded.
    PlanBuilt {
        query_id: Uuid,
        steps: usize,
        order: Vec<String>,
    },
    /// A plan step moved between states.
    StepTransition {
        query_id: Uuid,
        step: String,
        from: StepState,
        to: StepState,
    },
    /// A dry run stopped after planning. Nothing was executed.
    QueryPlanned {
        query_id: Uuid,
        steps: usize,
        elapsed_ms: u64,
    },
    /// Execution completed.
    QueryFinished {
        query_id: Uuid,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        elapsed_ms: u64,
    },
    /// The call aborted before execution.
    QueryFailed {
        query_id: Uuid,
        kind: String,
        error: String,
    },
}

impl QueryEvent {
    pub fn query_id(&self) -> Uuid {
        match self {
            QueryEvent::QueryStarted { query_id, .. }
            | QueryEvent::EndpointResolved { query_id, .. }
            | QueryEvent::PackageLoaded { query_id, .. }
            | QueryEvent::PlanBuilt { query_id, .. }
            | QueryEvent::StepTransition { query_id, .. }
            | QueryEvent::QueryPlanned { query_id, .. }
            | QueryEvent::QueryFinished { query_id, .. }
            | QueryEvent::QueryFailed { query_id, .. } => *query_id,
        }
    }

    /// Whether this is the last event its query emits.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryEvent::QueryPlanned { .. }
                | QueryEvent::QueryFinished { .. }
                | QueryEvent::QueryFailed { .. }
        )
    }
}

/// Broadcast bus shared by a client and its executors.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueryEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: QueryEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let id = Uuid::new_v4();
        let event = QueryEvent::StepTransition {
            query_id: id,
            step: "balance".into(),
            from: StepState::Pending,
            to: StepState::Running,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "StepTransition");
        assert_eq!(json["to"], "running");

        let parsed: QueryEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.query_id(), id);
    }

    #[test]
    fn test_event_bus_emit_no_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(QueryEvent::QueryStarted {
            query_id: Uuid::new_v4(),
            endpoint: "example.eth".into(),
        });
    }

    #[test]
    fn test_event_bus_subscribe_receive() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.emit(QueryEvent::QueryStarted {
            query_id: Uuid::new_v4(),
            endpoint: "example.eth".into(),
        });
        match rx.try_recv().unwrap() {
            QueryEvent::QueryStarted { endpoint, .. } => assert_eq!(endpoint, "example.eth"),
            other => panic!("wrong event: {other:?}"),
        }
    }
}
