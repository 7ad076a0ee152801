//! Database migrations for the change log
//!
//! Versioned migrations for the change-record schema. Each migration is
//! applied atomically and recorded in the change_log_schema_version table.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current schema version for the change log
pub const CURRENT_CHANGE_LOG_SCHEMA_VERSION: i32 = 1;

/// Migration descriptor
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub up_sql: &'static str,
}

/// All available migrations in order
pub fn get_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial change log schema",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS change_log_schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );

            -- One row per change intent, keyed by event id
            CREATE TABLE IF NOT EXISTS data_changes (
                id            TEXT PRIMARY KEY,
                source        TEXT NOT NULL,
                target        TEXT NOT NULL,
                event_type    TEXT NOT NULL CHECK(event_type IN ('create', 'update', 'delete', 'sync')),
                payload       TEXT NOT NULL,
                timestamp_ms  INTEGER NOT NULL,
                sync_status   TEXT NOT NULL
                    CHECK(sync_status IN ('pending', 'in_progress', 'completed', 'failed', 'retrying')),
                retry_count   INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                metadata      TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_changes_timestamp ON data_changes(timestamp_ms);
            CREATE INDEX IF NOT EXISTS idx_changes_status ON data_changes(sync_status);
            CREATE INDEX IF NOT EXISTS idx_changes_source ON data_changes(source, timestamp_ms);
            CREATE INDEX IF NOT EXISTS idx_changes_target ON data_changes(target, timestamp_ms);
            CREATE INDEX IF NOT EXISTS idx_changes_completed
                ON data_changes(timestamp_ms) WHERE sync_status = 'completed';
        "#,
    }]
}

/// Get current schema version from database
fn get_current_version(pool: &Pool<SqliteConnectionManager>) -> Result<i32, rusqlite::Error> {
    let conn = pool.get().map_err(|e| {
        rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Failed to get connection: {}", e),
        )))
    })?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS change_log_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Result<i32, _> = conn.query_row(
        "SELECT version FROM change_log_schema_version ORDER BY version DESC LIMIT 1",
        [],
        |row| row.get(0),
    );

    Ok(version.unwrap_or(0))
}

/// Run all pending migrations
pub fn migrate(pool: &Pool<SqliteConnectionManager>) -> Result<(), rusqlite::Error> {
    let current_version = get_current_version(pool)?;

    let pending: Vec<_> =
        get_migrations().into_iter().filter(|m| m.version > current_version).collect();

    if pending.is_empty() {
        return Ok(());
    }

    let conn = pool.get().map_err(|e| {
        rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Failed to get connection: {}", e),
        )))
    })?;

    for migration in pending {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.up_sql)?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        tx.execute(
            "INSERT INTO change_log_schema_version (version, applied_at) VALUES (?, ?)",
            params![migration.version, now],
        )?;
        tx.commit()?;

        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applied change log migration"
        );
    }

    Ok(())
}
