/*
    core_queue - Durable at-least-once event delivery

    Streams are keyed by (source, target). FIFO holds only within one
    stream; nothing is guaranteed across streams. A delivered event stays
    invisible to other consumers until its visibility timeout elapses,
    and is only removed once the caller acknowledges it after successful
    processing. There is no ack-at-dequeue path.
*/

pub mod memory;
pub mod sqlite;

pub use memory::MemoryQueue;
pub use sqlite::SqliteQueue;

use crate::model::SyncEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors from the queue subsystem
#[derive(Debug, Error)]
pub enum QueueError {
    /// Backend cannot be reached or the operation failed mid-flight
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    /// Event could not be encoded or decoded
    #[error("Queue serialization error: {0}")]
    Serialization(String),

    /// Acknowledgement for a delivery the queue no longer tracks
    #[error("Unknown receipt: {0}")]
    UnknownReceipt(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Stream name for a (source, target) pair
pub fn stream_key(source: &str, target: &str) -> String {
    format!("{}:{}", source, target)
}

/// Handle to an un-acked delivery; returned to the queue on ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub stream: String,
    pub seq: u64,
}

/// One consumed event plus the receipt needed to acknowledge it
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: SyncEvent,
    pub receipt: Receipt,
}

/// Counters for monitoring and health checks
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub streams: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub pending_by_consumer: HashMap<String, usize>,
}

/// Consumer-group delivery of sync events between the producer and the
/// worker pool.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Append an event to its stream. FIFO within the stream only.
    async fn publish(&self, event: &SyncEvent) -> QueueResult<()>;

    /// Block up to `timeout` for the next deliverable event. At most one
    /// un-acked delivery exists per stream at any time.
    async fn consume(&self, consumer_id: &str, timeout: Duration) -> QueueResult<Option<Delivery>>;

    /// Acknowledge a delivery after the caller processed it successfully.
    async fn ack(&self, consumer_id: &str, receipt: &Receipt) -> QueueResult<()>;

    /// Events delivered to this consumer but not yet acknowledged.
    async fn get_pending(&self, consumer_id: &str) -> QueueResult<Vec<SyncEvent>>;

    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Drop all streams and in-flight state.
    async fn clear(&self) -> QueueResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_format() {
        assert_eq!(stream_key("crm", "subsystem"), "crm:subsystem");
    }

    #[test]
    fn test_receipt_equality() {
        let a = Receipt { stream: "s".into(), seq: 1 };
        let b = Receipt { stream: "s".into(), seq: 1 };
        assert_eq!(a, b);
    }
}
