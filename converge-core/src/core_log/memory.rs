/*
    memory.rs - Bounded in-memory change log

    Keeps records in arrival order inside a LinkedHashMap. When the map
    grows past max_entries the oldest 10% of terminal records are
    evicted; pending and retrying records are never dropped.
*/

use super::{ChangeLogStats, ChangeLogStore, LogResult};
use crate::model::{now_ms, DataChange, SyncStatus};
use async_trait::async_trait;
use hashlink::LinkedHashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// In-memory backend, bounded by entry count
pub struct MemoryChangeLog {
    max_entries: usize,
    changes: Mutex<LinkedHashMap<String, DataChange>>,
}

impl MemoryChangeLog {
    pub fn new(max_entries: usize) -> Self {
        MemoryChangeLog {
            max_entries: max_entries.max(1),
            changes: Mutex::new(LinkedHashMap::new()),
        }
    }

    /// Evict the oldest tenth of terminal records once over capacity.
    fn evict_oldest(changes: &mut LinkedHashMap<String, DataChange>, max_entries: usize) {
        if changes.len() <= max_entries {
            return;
        }

        let target = (changes.len() / 10).max(1);
        let victims: Vec<String> = changes
            .iter()
            .filter(|(_, c)| c.is_terminal())
            .take(target)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &victims {
            changes.remove(id);
        }
        debug!(evicted = victims.len(), "memory change log eviction");
    }
}

#[async_trait]
impl ChangeLogStore for MemoryChangeLog {
    async fn log_change(&self, change: &DataChange) -> LogResult<()> {
        let mut changes = self.changes.lock().await;

        // Upsert in place so arrival order is preserved for audit.
        if let Some(existing) = changes.get_mut(&change.id) {
            *existing = change.clone();
            return Ok(());
        }

        changes.insert(change.id.clone(), change.clone());
        Self::evict_oldest(&mut changes, self.max_entries);
        Ok(())
    }

    async fn get_change(&self, id: &str) -> LogResult<Option<DataChange>> {
        Ok(self.changes.lock().await.get(id).cloned())
    }

    async fn get_changes_since(&self, since_ms: u64) -> LogResult<Vec<DataChange>> {
        let changes = self.changes.lock().await;
        let mut matched: Vec<DataChange> = changes
            .values()
            .filter(|c| c.timestamp_ms >= since_ms)
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.timestamp_ms.cmp(&b.timestamp_ms).then_with(|| a.id.cmp(&b.id))
        });
        Ok(matched)
    }

    async fn get_changes_by_source(&self, source: &str, limit: usize) -> LogResult<Vec<DataChange>> {
        let changes = self.changes.lock().await;
        let mut matched: Vec<DataChange> =
            changes.values().filter(|c| c.source == source).cloned().collect();
        matched.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn get_changes_by_target(&self, target: &str, limit: usize) -> LogResult<Vec<DataChange>> {
        let changes = self.changes.lock().await;
        let mut matched: Vec<DataChange> =
            changes.values().filter(|c| c.target == target).cloned().collect();
        matched.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn get_last_sync_time(&self) -> LogResult<Option<u64>> {
        let changes = self.changes.lock().await;
        Ok(changes
            .values()
            .filter(|c| c.sync_status == SyncStatus::Completed)
            .map(|c| c.timestamp_ms)
            .max())
    }

    async fn update_sync_status(
        &self,
        id: &str,
        status: SyncStatus,
        error_message: Option<&str>,
    ) -> LogResult<bool> {
        let mut changes = self.changes.lock().await;
        match changes.get_mut(id) {
            Some(change) => {
                change.sync_status = status;
                change.error_message = error_message.map(str::to_string);
                if status == SyncStatus::Retrying {
                    change.retry_count += 1;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn cleanup_old_changes(&self, retention: Duration) -> LogResult<usize> {
        let cutoff = now_ms().saturating_sub(retention.as_millis() as u64);
        let mut changes = self.changes.lock().await;

        let victims: Vec<String> = changes
            .iter()
            .filter(|(_, c)| c.is_terminal() && c.timestamp_ms < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &victims {
            changes.remove(id);
        }
        Ok(victims.len())
    }

    async fn stats(&self) -> LogResult<ChangeLogStats> {
        let changes = self.changes.lock().await;
        let mut stats = ChangeLogStats {
            total_changes: changes.len(),
            ..Default::default()
        };
        for change in changes.values() {
            *stats.by_status.entry(change.sync_status.as_str().to_string()).or_insert(0) += 1;
            *stats.by_source.entry(change.source.clone()).or_insert(0) += 1;
            *stats.by_target.entry(change.target.clone()).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SyncEvent, SyncEventType};
    use serde_json::json;

    fn change(id: &str, ts: u64, status: SyncStatus) -> DataChange {
        let mut event =
            SyncEvent::new("crm", "subsystem", json!({"id": id}), SyncEventType::Update, 0, 3);
        event.id = id.to_string();
        let mut change = DataChange::from_event(&event);
        change.timestamp_ms = ts;
        change.sync_status = status;
        change
    }

    #[tokio::test]
    async fn test_log_change_is_idempotent() {
        let log = MemoryChangeLog::new(100);
        let c = change("c1", 10, SyncStatus::Pending);

        log.log_change(&c).await.unwrap();
        log.log_change(&c).await.unwrap();

        let stats = log.stats().await.unwrap();
        assert_eq!(stats.total_changes, 1);
    }

    #[tokio::test]
    async fn test_changes_since_sorted_ascending() {
        let log = MemoryChangeLog::new(100);
        log.log_change(&change("c2", 200, SyncStatus::Pending)).await.unwrap();
        log.log_change(&change("c1", 100, SyncStatus::Pending)).await.unwrap();
        log.log_change(&change("c3", 300, SyncStatus::Pending)).await.unwrap();

        let since = log.get_changes_since(150).await.unwrap();
        let ids: Vec<&str> = since.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c3"]);
    }

    #[tokio::test]
    async fn test_last_sync_time_only_counts_completed() {
        let log = MemoryChangeLog::new(100);
        log.log_change(&change("c1", 100, SyncStatus::Completed)).await.unwrap();
        log.log_change(&change("c2", 500, SyncStatus::Failed)).await.unwrap();
        log.log_change(&change("c3", 300, SyncStatus::Completed)).await.unwrap();

        assert_eq!(log.get_last_sync_time().await.unwrap(), Some(300));
    }

    #[tokio::test]
    async fn test_last_sync_time_none_when_nothing_completed() {
        let log = MemoryChangeLog::new(100);
        log.log_change(&change("c1", 100, SyncStatus::Pending)).await.unwrap();
        assert_eq!(log.get_last_sync_time().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_status_unknown_id() {
        let log = MemoryChangeLog::new(100);
        let updated = log.update_sync_status("nope", SyncStatus::Failed, None).await.unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn test_retrying_increments_retry_count() {
        let log = MemoryChangeLog::new(100);
        log.log_change(&change("c1", 100, SyncStatus::Pending)).await.unwrap();

        log.update_sync_status("c1", SyncStatus::Retrying, Some("boom")).await.unwrap();
        log.update_sync_status("c1", SyncStatus::Retrying, Some("boom")).await.unwrap();

        let stored = log.get_change("c1").await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_cleanup_spares_non_terminal_records() {
        let log = MemoryChangeLog::new(100);
        log.log_change(&change("old_done", 1, SyncStatus::Completed)).await.unwrap();
        log.log_change(&change("old_failed", 1, SyncStatus::Failed)).await.unwrap();
        log.log_change(&change("old_pending", 1, SyncStatus::Pending)).await.unwrap();
        log.log_change(&change("old_retrying", 1, SyncStatus::Retrying)).await.unwrap();

        let deleted = log.cleanup_old_changes(Duration::from_secs(60)).await.unwrap();
        assert_eq!(deleted, 2);

        assert!(log.get_change("old_pending").await.unwrap().is_some());
        assert!(log.get_change("old_retrying").await.unwrap().is_some());
        assert!(log.get_change("old_done").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eviction_keeps_non_terminal() {
        let log = MemoryChangeLog::new(10);
        for i in 0..10 {
            log.log_change(&change(&format!("done{}", i), i as u64, SyncStatus::Completed))
                .await
                .unwrap();
        }
        log.log_change(&change("pending", 999, SyncStatus::Pending)).await.unwrap();

        let stats = log.stats().await.unwrap();
        assert!(stats.total_changes < 11);
        assert!(log.get_change("pending").await.unwrap().is_some());
        // The oldest terminal record went first.
        assert!(log.get_change("done0").await.unwrap().is_none());
    }
}
