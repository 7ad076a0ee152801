/*
    core_log - Durable record of change intents and their outcomes

    Every change the engine accepts is logged here before it is queued or
    executed. Records are keyed by event id, mutated only through
    update_sync_status, and drive the incremental scheduler via
    get_changes_since / get_last_sync_time.
*/

pub mod memory;
pub mod migrations;
pub mod sqlite;

pub use memory::MemoryChangeLog;
pub use sqlite::SqliteChangeLog;

use crate::model::{DataChange, SyncStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Errors from the change log subsystem
#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("Change log storage error: {0}")]
    Storage(String),

    #[error("Change log serialization error: {0}")]
    Serialization(String),
}

pub type LogResult<T> = Result<T, LogStoreError>;

/// Aggregate counters over the stored records
#[derive(Debug, Clone, Default)]
pub struct ChangeLogStats {
    pub total_changes: usize,
    pub by_status: HashMap<String, usize>,
    pub by_source: HashMap<String, usize>,
    pub by_target: HashMap<String, usize>,
}

/// Storage backend contract for change records
#[async_trait]
pub trait ChangeLogStore: Send + Sync {
    /// Idempotent upsert keyed by change id: logging the same event twice
    /// leaves exactly one record.
    async fn log_change(&self, change: &DataChange) -> LogResult<()>;

    async fn get_change(&self, id: &str) -> LogResult<Option<DataChange>>;

    /// Records with `timestamp_ms >= since_ms`, ascending by timestamp.
    async fn get_changes_since(&self, since_ms: u64) -> LogResult<Vec<DataChange>>;

    async fn get_changes_by_source(&self, source: &str, limit: usize) -> LogResult<Vec<DataChange>>;

    async fn get_changes_by_target(&self, target: &str, limit: usize) -> LogResult<Vec<DataChange>>;

    /// Latest timestamp among records whose status is Completed.
    async fn get_last_sync_time(&self) -> LogResult<Option<u64>>;

    /// Returns false when no record with that id exists.
    async fn update_sync_status(
        &self,
        id: &str,
        status: SyncStatus,
        error_message: Option<&str>,
    ) -> LogResult<bool>;

    /// Delete terminal-state records older than `retention`. Pending and
    /// retrying records are kept regardless of age.
    async fn cleanup_old_changes(&self, retention: Duration) -> LogResult<usize>;

    async fn stats(&self) -> LogResult<ChangeLogStats>;
}

/// Front door over a configured backend. Falls back to the in-memory
/// store when the durable backend cannot be opened, so ingestion keeps
/// working while the operator fixes storage.
pub struct ChangeLog {
    backend: Arc<dyn ChangeLogStore>,
}

impl ChangeLog {
    pub fn new(backend: Arc<dyn ChangeLogStore>) -> Self {
        ChangeLog { backend }
    }

    pub fn in_memory(max_entries: usize) -> Self {
        ChangeLog { backend: Arc::new(MemoryChangeLog::new(max_entries)) }
    }

    pub fn durable(path: impl AsRef<Path>, max_entries: usize) -> Self {
        match SqliteChangeLog::open(path.as_ref()) {
            Ok(store) => ChangeLog { backend: Arc::new(store) },
            Err(e) => {
                warn!(error = %e, "falling back to in-memory change log");
                Self::in_memory(max_entries)
            }
        }
    }

    pub fn store(&self) -> &Arc<dyn ChangeLogStore> {
        &self.backend
    }
}

#[async_trait]
impl ChangeLogStore for ChangeLog {
    async fn log_change(&self, change: &DataChange) -> LogResult<()> {
        self.backend.log_change(change).await
    }

    async fn get_change(&self, id: &str) -> LogResult<Option<DataChange>> {
        self.backend.get_change(id).await
    }

    async fn get_changes_since(&self, since_ms: u64) -> LogResult<Vec<DataChange>> {
        self.backend.get_changes_since(since_ms).await
    }

    async fn get_changes_by_source(&self, source: &str, limit: usize) -> LogResult<Vec<DataChange>> {
        self.backend.get_changes_by_source(source, limit).await
    }

    async fn get_changes_by_target(&self, target: &str, limit: usize) -> LogResult<Vec<DataChange>> {
        self.backend.get_changes_by_target(target, limit).await
    }

    async fn get_last_sync_time(&self) -> LogResult<Option<u64>> {
        self.backend.get_last_sync_time().await
    }

    async fn update_sync_status(
        &self,
        id: &str,
        status: SyncStatus,
        error_message: Option<&str>,
    ) -> LogResult<bool> {
        self.backend.update_sync_status(id, status, error_message).await
    }

    async fn cleanup_old_changes(&self, retention: Duration) -> LogResult<usize> {
        self.backend.cleanup_old_changes(retention).await
    }

    async fn stats(&self) -> LogResult<ChangeLogStats> {
        self.backend.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_durable_falls_back_to_memory_on_bad_path() {
        // A directory path cannot be opened as a database file.
        let log = ChangeLog::durable("/", 100);
        assert!(log.stats().await.is_ok());
    }
}
