//! Fire-and-forget notifications emitted by the engine.
//!
//! Group events acknowledge (GRANTED/DENIED) or resolve (SUCCESS/ERROR) a whole
//! batch. File events report the terminal outcome of one request. Publishing never
//! fails and never blocks the caller.

use serde::Serialize;
use std::sync::Mutex;
use stowage_core::{GroupEventState, RequestKind, RequestResultInfo};
use tokio::sync::broadcast;

/// A notification published by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Group acknowledgment or aggregate outcome.
    Group {
        group_id: String,
        kind: RequestKind,
        state: GroupEventState,
        /// Denial reason, only set for DENIED.
        reason: Option<String>,
        /// Every recorded result, only set for SUCCESS and ERROR.
        results: Vec<RequestResultInfo>,
    },
    /// One request succeeded.
    FileSuccess {
        kind: RequestKind,
        checksum: String,
        backend: String,
        group_ids: Vec<String>,
        result_file: Option<String>,
    },
    /// One request failed.
    FileError {
        kind: RequestKind,
        checksum: String,
        backend: String,
        group_ids: Vec<String>,
        cause: String,
    },
    /// Operator warning: restorations are held back by cache capacity.
    CacheFull { message: String },
}

impl EngineEvent {
    /// Group id for group events.
    pub fn group_id(&self) -> Option<&str> {
        match self {
            Self::Group { group_id, .. } => Some(group_id),
            _ => None,
        }
    }

    /// Group state for group events.
    pub fn group_state(&self) -> Option<GroupEventState> {
        match self {
            Self::Group { state, .. } => Some(*state),
            _ => None,
        }
    }
}

/// Sink for engine notifications.
///
/// Synchronous on purpose: callers publish after their store writes committed and
/// must not wait on consumers.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

/// Publishes to in-process subscribers over a broadcast channel.
///
/// Events are also logged at debug level. A lagging or absent subscriber loses
/// events; the store remains the source of truth.
pub struct BroadcastPublisher {
    sender: broadcast::Sender<EngineEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: EngineEvent) {
        tracing::debug!(event = ?event, "Publishing engine event");
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }
}

/// Collects events in memory, in publication order.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event published so far.
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Group events for one group id.
    pub fn group_events(&self, group_id: &str) -> Vec<EngineEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.group_id() == Some(group_id))
            .collect()
    }

    /// Drain collected events.
    pub fn drain(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .map(|mut events| std::mem::take(&mut *events))
            .unwrap_or_default()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: EngineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granted(group_id: &str) -> EngineEvent {
        EngineEvent::Group {
            group_id: group_id.to_string(),
            kind: RequestKind::Storage,
            state: GroupEventState::Granted,
            reason: None,
            results: Vec::new(),
        }
    }

    #[test]
    fn recording_keeps_order_and_filters_groups() {
        let publisher = RecordingPublisher::new();
        publisher.publish(granted("g1"));
        publisher.publish(EngineEvent::CacheFull {
            message: "full".to_string(),
        });
        publisher.publish(granted("g2"));

        assert_eq!(publisher.events().len(), 3);
        let g2 = publisher.group_events("g2");
        assert_eq!(g2.len(), 1);
        assert_eq!(g2[0].group_state(), Some(GroupEventState::Granted));

        assert_eq!(publisher.drain().len(), 3);
        assert!(publisher.events().is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let publisher = BroadcastPublisher::new(8);
        let mut receiver = publisher.subscribe();
        publisher.publish(granted("g1"));
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.group_id(), Some("g1"));
    }

    #[test]
    fn broadcast_without_subscribers_is_silent() {
        let publisher = BroadcastPublisher::new(1);
        publisher.publish(granted("g1"));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(granted("g1")).unwrap();
        assert_eq!(json["type"], "group");
        assert_eq!(json["state"], "GRANTED");
        assert_eq!(json["kind"], "storage");
    }
}
