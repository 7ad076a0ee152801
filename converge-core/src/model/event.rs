/*
    event.rs - Synchronization events and their outcomes

    A SyncEvent is the unit of work handed to the engine. It is immutable
    once created except for `status` and `retry_count`, which change as
    the event moves through the retry state machine.
*/

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of change an event carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    Create,
    Update,
    Delete,
    Sync,
}

impl SyncEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEventType::Create => "create",
            SyncEventType::Update => "update",
            SyncEventType::Delete => "delete",
            SyncEventType::Sync => "sync",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(SyncEventType::Create),
            "update" => Some(SyncEventType::Update),
            "delete" => Some(SyncEventType::Delete),
            "sync" => Some(SyncEventType::Sync),
            _ => None,
        }
    }
}

/// Lifecycle state of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Retrying,
}

impl SyncStatus {
    /// Terminal states are never revisited and are eligible for cleanup.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Completed | SyncStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "in_progress" => Some(SyncStatus::InProgress),
            "completed" => Some(SyncStatus::Completed),
            "failed" => Some(SyncStatus::Failed),
            "retrying" => Some(SyncStatus::Retrying),
            _ => None,
        }
    }
}

/// A single change intent moving from a source store to a target store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Unique event id
    pub id: String,

    /// What kind of change this is
    pub event_type: SyncEventType,

    /// Originating endpoint identifier
    pub source: String,

    /// Destination endpoint identifier
    pub target: String,

    /// Entity payload as a JSON document
    pub payload: Value,

    /// Creation time, milliseconds since epoch
    pub timestamp_ms: u64,

    /// Priority; > 0 requests synchronous execution
    pub priority: i64,

    /// Number of delivery attempts already retried
    pub retry_count: u32,

    /// Retry bound; once reached the event fails permanently
    pub max_retries: u32,

    pub status: SyncStatus,

    /// Free-form annotations carried alongside the payload
    #[serde(default)]
    pub metadata: Value,
}

impl SyncEvent {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        payload: Value,
        event_type: SyncEventType,
        priority: i64,
        max_retries: u32,
    ) -> Self {
        SyncEvent {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            source: source.into(),
            target: target.into(),
            payload,
            timestamp_ms: super::now_ms(),
            priority,
            retry_count: 0,
            max_retries,
            status: SyncStatus::Pending,
            metadata: Value::Null,
        }
    }

    /// Entity id carried in the payload, if any.
    pub fn entity_id(&self) -> Option<&str> {
        self.payload.get("id").and_then(Value::as_str)
    }

    /// True once the retry budget is exhausted.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Outcome of a `sync_data` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub event_id: String,
    pub success: bool,
    pub timestamp_ms: u64,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub conflicts_resolved: u32,

    /// True when the event was enqueued for asynchronous processing
    /// rather than executed inline.
    pub accepted: bool,
}

impl SyncResult {
    /// The asynchronous path: the event is durably logged and queued.
    pub fn accepted(event_id: impl Into<String>) -> Self {
        SyncResult {
            event_id: event_id.into(),
            success: true,
            timestamp_ms: super::now_ms(),
            duration_ms: 0,
            error_message: None,
            conflicts_resolved: 0,
            accepted: true,
        }
    }

    pub fn completed(event_id: impl Into<String>, duration_ms: u64, conflicts_resolved: u32) -> Self {
        SyncResult {
            event_id: event_id.into(),
            success: true,
            timestamp_ms: super::now_ms(),
            duration_ms,
            error_message: None,
            conflicts_resolved,
            accepted: false,
        }
    }

    pub fn failure(
        event_id: impl Into<String>,
        duration_ms: u64,
        error_message: impl Into<String>,
    ) -> Self {
        SyncResult {
            event_id: event_id.into(),
            success: false,
            timestamp_ms: super::now_ms(),
            duration_ms,
            error_message: Some(error_message.into()),
            conflicts_resolved: 0,
            accepted: false,
        }
    }
}
