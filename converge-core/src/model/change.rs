/*
    change.rs - Persisted change records

    A DataChange is the durable counterpart of a SyncEvent, 1:1 by id.
    It is created when the event is first logged and only mutated through
    the change log's status-update call.
*/

use super::event::{SyncEvent, SyncEventType, SyncStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Durable record of one change intent and its outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataChange {
    pub id: String,
    pub source: String,
    pub target: String,
    pub event_type: SyncEventType,
    pub payload: Value,
    pub timestamp_ms: u64,
    pub sync_status: SyncStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl DataChange {
    pub fn from_event(event: &SyncEvent) -> Self {
        DataChange {
            id: event.id.clone(),
            source: event.source.clone(),
            target: event.target.clone(),
            event_type: event.event_type,
            payload: event.payload.clone(),
            timestamp_ms: event.timestamp_ms,
            sync_status: event.status,
            retry_count: event.retry_count,
            error_message: None,
            metadata: event.metadata.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.sync_status.is_terminal()
    }

    /// Rebuild a queueable event from this record, used by the
    /// incremental scheduler to re-feed stalled changes.
    pub fn to_event(&self, max_retries: u32) -> SyncEvent {
        SyncEvent {
            id: self.id.clone(),
            event_type: self.event_type,
            source: self.source.clone(),
            target: self.target.clone(),
            payload: self.payload.clone(),
            timestamp_ms: self.timestamp_ms,
            priority: 0,
            retry_count: self.retry_count,
            max_retries,
            status: self.sync_status,
            metadata: self.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_event_copies_identity() {
        let event = SyncEvent::new(
            "crm",
            "subsystem",
            json!({"id": "u1"}),
            SyncEventType::Update,
            0,
            3,
        );
        let change = DataChange::from_event(&event);

        assert_eq!(change.id, event.id);
        assert_eq!(change.source, "crm");
        assert_eq!(change.target, "subsystem");
        assert_eq!(change.sync_status, SyncStatus::Pending);
        assert!(change.error_message.is_none());
    }

    #[test]
    fn test_round_trip_through_event() {
        let event = SyncEvent::new("a", "b", json!({"k": 1}), SyncEventType::Sync, 0, 5);
        let change = DataChange::from_event(&event);
        let rebuilt = change.to_event(5);

        assert_eq!(rebuilt.id, event.id);
        assert_eq!(rebuilt.payload, event.payload);
        assert_eq!(rebuilt.max_retries, 5);
    }
}
