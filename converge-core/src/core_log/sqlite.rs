/*
    sqlite.rs - Durable change log backend

    Row-per-change storage with indexes on timestamp, status, source and
    target. Status transitions are single-row UPDATEs, so concurrent
    workers need no extra locking.
*/

use super::migrations;
use super::{ChangeLogStats, ChangeLogStore, LogResult, LogStoreError};
use crate::model::{now_ms, DataChange, SyncEventType, SyncStatus};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;

/// SQLite-backed change log
pub struct SqliteChangeLog {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteChangeLog {
    pub fn open(path: impl AsRef<Path>) -> LogResult<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref());
        let pool = Pool::builder()
            .connection_timeout(Duration::from_secs(2))
            .build(manager)
            .map_err(|e| LogStoreError::Storage(e.to_string()))?;
        Self::with_pool(pool)
    }

    /// In-memory database, used by tests.
    pub fn memory() -> LogResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(Duration::from_secs(2))
            .build(manager)
            .map_err(|e| LogStoreError::Storage(e.to_string()))?;
        Self::with_pool(pool)
    }

    fn with_pool(pool: Pool<SqliteConnectionManager>) -> LogResult<Self> {
        migrations::migrate(&pool).map_err(|e| LogStoreError::Storage(e.to_string()))?;
        Ok(SqliteChangeLog { pool })
    }

    fn conn(&self) -> LogResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| LogStoreError::Storage(e.to_string()))
    }

    fn row_to_change(row: &Row<'_>) -> rusqlite::Result<DataChange> {
        let event_type: String = row.get(3)?;
        let status: String = row.get(6)?;
        let payload: String = row.get(4)?;
        let metadata: Option<String> = row.get(9)?;

        Ok(DataChange {
            id: row.get(0)?,
            source: row.get(1)?,
            target: row.get(2)?,
            event_type: SyncEventType::parse(&event_type).unwrap_or(SyncEventType::Sync),
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            timestamp_ms: row.get::<_, i64>(5)? as u64,
            sync_status: SyncStatus::parse(&status).unwrap_or(SyncStatus::Pending),
            retry_count: row.get::<_, i64>(7)? as u32,
            error_message: row.get(8)?,
            metadata: metadata
                .and_then(|m| serde_json::from_str(&m).ok())
                .unwrap_or(serde_json::Value::Null),
        })
    }

    fn query_changes(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> LogResult<Vec<DataChange>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(|e| LogStoreError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(args, Self::row_to_change)
            .map_err(|e| LogStoreError::Storage(e.to_string()))?;

        let mut changes = Vec::new();
        for row in rows {
            changes.push(row.map_err(|e| LogStoreError::Storage(e.to_string()))?);
        }
        Ok(changes)
    }
}

const SELECT_COLUMNS: &str = "id, source, target, event_type, payload, timestamp_ms, \
                              sync_status, retry_count, error_message, metadata";

#[async_trait]
impl ChangeLogStore for SqliteChangeLog {
    async fn log_change(&self, change: &DataChange) -> LogResult<()> {
        let payload = serde_json::to_string(&change.payload)
            .map_err(|e| LogStoreError::Serialization(e.to_string()))?;
        let metadata = serde_json::to_string(&change.metadata)
            .map_err(|e| LogStoreError::Serialization(e.to_string()))?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO data_changes
                 (id, source, target, event_type, payload, timestamp_ms,
                  sync_status, retry_count, error_message, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                 payload = excluded.payload,
                 sync_status = excluded.sync_status,
                 retry_count = excluded.retry_count,
                 metadata = excluded.metadata",
            params![
                change.id,
                change.source,
                change.target,
                change.event_type.as_str(),
                payload,
                change.timestamp_ms as i64,
                change.sync_status.as_str(),
                change.retry_count as i64,
                change.error_message,
                metadata,
            ],
        )
        .map_err(|e| LogStoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn get_change(&self, id: &str) -> LogResult<Option<DataChange>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM data_changes WHERE id = ?1", SELECT_COLUMNS),
            params![id],
            Self::row_to_change,
        )
        .optional()
        .map_err(|e| LogStoreError::Storage(e.to_string()))
    }

    async fn get_changes_since(&self, since_ms: u64) -> LogResult<Vec<DataChange>> {
        self.query_changes(
            &format!(
                "SELECT {} FROM data_changes WHERE timestamp_ms >= ?1
                 ORDER BY timestamp_ms ASC, id ASC",
                SELECT_COLUMNS
            ),
            &[&(since_ms as i64)],
        )
    }

    async fn get_changes_by_source(&self, source: &str, limit: usize) -> LogResult<Vec<DataChange>> {
        self.query_changes(
            &format!(
                "SELECT {} FROM data_changes WHERE source = ?1
                 ORDER BY timestamp_ms DESC LIMIT ?2",
                SELECT_COLUMNS
            ),
            &[&source, &(limit as i64)],
        )
    }

    async fn get_changes_by_target(&self, target: &str, limit: usize) -> LogResult<Vec<DataChange>> {
        self.query_changes(
            &format!(
                "SELECT {} FROM data_changes WHERE target = ?1
                 ORDER BY timestamp_ms DESC LIMIT ?2",
                SELECT_COLUMNS
            ),
            &[&target, &(limit as i64)],
        )
    }

    async fn get_last_sync_time(&self) -> LogResult<Option<u64>> {
        let conn = self.conn()?;
        let last: Option<i64> = conn
            .query_row(
                "SELECT MAX(timestamp_ms) FROM data_changes WHERE sync_status = 'completed'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| LogStoreError::Storage(e.to_string()))?;
        Ok(last.map(|v| v as u64))
    }

    async fn update_sync_status(
        &self,
        id: &str,
        status: SyncStatus,
        error_message: Option<&str>,
    ) -> LogResult<bool> {
        let conn = self.conn()?;
        let retry_bump = if status == SyncStatus::Retrying { 1i64 } else { 0 };
        let updated = conn
            .execute(
                "UPDATE data_changes
                 SET sync_status = ?1, error_message = ?2, retry_count = retry_count + ?3
                 WHERE id = ?4",
                params![status.as_str(), error_message, retry_bump, id],
            )
            .map_err(|e| LogStoreError::Storage(e.to_string()))?;
        Ok(updated > 0)
    }

    async fn cleanup_old_changes(&self, retention: Duration) -> LogResult<usize> {
        let cutoff = now_ms().saturating_sub(retention.as_millis() as u64);
        let conn = self.conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM data_changes
                 WHERE timestamp_ms < ?1 AND sync_status IN ('completed', 'failed')",
                params![cutoff as i64],
            )
            .map_err(|e| LogStoreError::Storage(e.to_string()))?;
        Ok(deleted)
    }

    async fn stats(&self) -> LogResult<ChangeLogStats> {
        let conn = self.conn()?;
        let mut stats = ChangeLogStats::default();

        stats.total_changes = conn
            .query_row("SELECT COUNT(*) FROM data_changes", [], |row| row.get::<_, i64>(0))
            .map_err(|e| LogStoreError::Storage(e.to_string()))? as usize;

        for (sql, bucket) in [
            ("SELECT sync_status, COUNT(*) FROM data_changes GROUP BY sync_status", 0usize),
            ("SELECT source, COUNT(*) FROM data_changes GROUP BY source", 1),
            ("SELECT target, COUNT(*) FROM data_changes GROUP BY target", 2),
        ] {
            let mut stmt =
                conn.prepare(sql).map_err(|e| LogStoreError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
                })
                .map_err(|e| LogStoreError::Storage(e.to_string()))?;

            for row in rows {
                let (key, count) = row.map_err(|e| LogStoreError::Storage(e.to_string()))?;
                let map = match bucket {
                    0 => &mut stats.by_status,
                    1 => &mut stats.by_source,
                    _ => &mut stats.by_target,
                };
                map.insert(key, count);
            }
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
    async fn test_log_change_idempotent_upsert() {
        let log = SqliteChangeLog::memory().unwrap();
        let c = change("c1", 100, SyncStatus::Pending);

        log.log_change(&c).await.unwrap();
        log.log_change(&c).await.unwrap();

        assert_eq!(log.stats().await.unwrap().total_changes, 1);
    }

    #[tokio::test]
    async fn test_round_trip_preserves_fields() {
        let log = SqliteChangeLog::memory().unwrap();
        let mut c = change("c1", 100, SyncStatus::Pending);
        c.payload = json!({"id": "u1", "email": "a@x.com", "tags": ["a", "b"]});

        log.log_change(&c).await.unwrap();
        let stored = log.get_change("c1").await.unwrap().unwrap();

        assert_eq!(stored.source, "crm");
        assert_eq!(stored.event_type, SyncEventType::Update);
        assert_eq!(stored.payload["email"], "a@x.com");
        assert_eq!(stored.payload["tags"][1], "b");
    }

    #[tokio::test]
    async fn test_changes_since_and_last_sync_time() {
        let log = SqliteChangeLog::memory().unwrap();
        log.log_change(&change("c1", 100, SyncStatus::Completed)).await.unwrap();
        log.log_change(&change("c2", 200, SyncStatus::Pending)).await.unwrap();
        log.log_change(&change("c3", 300, SyncStatus::Completed)).await.unwrap();

        let since = log.get_changes_since(150).await.unwrap();
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].id, "c2");

        assert_eq!(log.get_last_sync_time().await.unwrap(), Some(300));
    }

    #[tokio::test]
    async fn test_update_status_and_retry_bump() {
        let log = SqliteChangeLog::memory().unwrap();
        log.log_change(&change("c1", 100, SyncStatus::Pending)).await.unwrap();

        assert!(log.update_sync_status("c1", SyncStatus::Retrying, Some("oops")).await.unwrap());
        assert!(log.update_sync_status("c1", SyncStatus::Failed, Some("gave up")).await.unwrap());
        assert!(!log.update_sync_status("ghost", SyncStatus::Failed, None).await.unwrap());

        let stored = log.get_change("c1").await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.error_message.as_deref(), Some("gave up"));
    }

    #[tokio::test]
    async fn test_cleanup_only_deletes_terminal() {
        let log = SqliteChangeLog::memory().unwrap();
        log.log_change(&change("done", 1, SyncStatus::Completed)).await.unwrap();
        log.log_change(&change("failed", 1, SyncStatus::Failed)).await.unwrap();
        log.log_change(&change("stuck", 1, SyncStatus::Retrying)).await.unwrap();

        let deleted = log.cleanup_old_changes(Duration::from_secs(1)).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(log.get_change("stuck").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_by_source_and_target_queries() {
        let log = SqliteChangeLog::memory().unwrap();
        log.log_change(&change("c1", 100, SyncStatus::Pending)).await.unwrap();
        log.log_change(&change("c2", 200, SyncStatus::Pending)).await.unwrap();

        let by_source = log.get_changes_by_source("crm", 10).await.unwrap();
        assert_eq!(by_source.len(), 2);
        assert_eq!(by_source[0].id, "c2"); // newest first

        let by_target = log.get_changes_by_target("subsystem", 1).await.unwrap();
        assert_eq!(by_target.len(), 1);
    }

    #[tokio::test]
    async fn test_durable_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("changes.db");

        {
            let log = SqliteChangeLog::open(&path).unwrap();
            log.log_change(&change("c1", 100, SyncStatus::Completed)).await.unwrap();
        }

        let log = SqliteChangeLog::open(&path).unwrap();
        assert!(log.get_change("c1").await.unwrap().is_some());
    }
}
