/*
    sqlite.rs - Durable queue backend

    Persists streams in SQLite so queued and in-flight events survive a
    restart. In-flight rows carry the consumer and a visibility deadline;
    an expired deadline makes the row redeliverable to any consumer.
*/

use super::{stream_key, Delivery, EventQueue, QueueError, QueueResult, QueueStats, Receipt};
use crate::model::SyncEvent;
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS queue_events (
        stream      TEXT NOT NULL,
        seq         INTEGER NOT NULL,
        event       TEXT NOT NULL,
        state       TEXT NOT NULL DEFAULT 'queued' CHECK(state IN ('queued', 'inflight')),
        consumer    TEXT,
        deadline_ms INTEGER,
        PRIMARY KEY (stream, seq)
    );

    CREATE INDEX IF NOT EXISTS idx_queue_stream_state ON queue_events(stream, state);
    CREATE INDEX IF NOT EXISTS idx_queue_deadline ON queue_events(deadline_ms)
        WHERE state = 'inflight';
"#;

/// SQLite-backed event queue
pub struct SqliteQueue {
    pool: Pool<SqliteConnectionManager>,
    visibility_timeout: Duration,
    max_stream_length: usize,
}

impl SqliteQueue {
    pub fn open(
        path: impl AsRef<Path>,
        visibility_timeout: Duration,
        max_stream_length: usize,
    ) -> QueueResult<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref());
        let pool = Pool::builder()
            .connection_timeout(Duration::from_secs(2))
            .build(manager)
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Self::with_pool(pool, visibility_timeout, max_stream_length)
    }

    /// In-memory database, used by tests.
    pub fn memory(visibility_timeout: Duration, max_stream_length: usize) -> QueueResult<Self> {
        let manager = SqliteConnectionManager::memory();
        // A single connection keeps every handle on the same in-memory db.
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(Duration::from_secs(2))
            .build(manager)
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Self::with_pool(pool, visibility_timeout, max_stream_length)
    }

    fn with_pool(
        pool: Pool<SqliteConnectionManager>,
        visibility_timeout: Duration,
        max_stream_length: usize,
    ) -> QueueResult<Self> {
        let conn = pool.get().map_err(|e| QueueError::Unavailable(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        drop(conn);

        Ok(SqliteQueue { pool, visibility_timeout, max_stream_length })
    }

    fn conn(&self) -> QueueResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| QueueError::Unavailable(e.to_string()))
    }

    /// One delivery attempt. Expired in-flight rows win over queued rows
    /// so a crashed consumer's event is picked up first.
    fn try_consume(&self, consumer_id: &str, now_ms: u64) -> QueueResult<Option<Delivery>> {
        let conn = self.conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let new_deadline = now_ms + self.visibility_timeout.as_millis() as u64;

        // Redeliver an expired in-flight event.
        let expired: Option<(String, u64, String)> = tx
            .query_row(
                "SELECT stream, seq, event FROM queue_events
                 WHERE state = 'inflight' AND deadline_ms < ?1
                 ORDER BY deadline_ms ASC LIMIT 1",
                params![now_ms as i64],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64, row.get(2)?)),
            )
            .optional()
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        if let Some((stream, seq, encoded)) = expired {
            tx.execute(
                "UPDATE queue_events SET consumer = ?1, deadline_ms = ?2
                 WHERE stream = ?3 AND seq = ?4",
                params![consumer_id, new_deadline as i64, stream, seq as i64],
            )
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
            tx.commit().map_err(|e| QueueError::Unavailable(e.to_string()))?;

            debug!(%stream, seq, "redelivering expired event");
            let event = decode_event(&encoded)?;
            return Ok(Some(Delivery { event, receipt: Receipt { stream, seq } }));
        }

        // Otherwise take the head of a stream with nothing in flight.
        let head: Option<(String, u64, String)> = tx
            .query_row(
                "SELECT q.stream, q.seq, q.event FROM queue_events q
                 WHERE q.state = 'queued'
                   AND q.seq = (SELECT MIN(seq) FROM queue_events
                                WHERE stream = q.stream AND state = 'queued')
                   AND NOT EXISTS (SELECT 1 FROM queue_events f
                                   WHERE f.stream = q.stream
                                     AND f.state = 'inflight'
                                     AND f.deadline_ms >= ?1)
                 ORDER BY q.stream ASC LIMIT 1",
                params![now_ms as i64],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64, row.get(2)?)),
            )
            .optional()
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        if let Some((stream, seq, encoded)) = head {
            tx.execute(
                "UPDATE queue_events SET state = 'inflight', consumer = ?1, deadline_ms = ?2
                 WHERE stream = ?3 AND seq = ?4",
                params![consumer_id, new_deadline as i64, stream, seq as i64],
            )
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
            tx.commit().map_err(|e| QueueError::Unavailable(e.to_string()))?;

            let event = decode_event(&encoded)?;
            return Ok(Some(Delivery { event, receipt: Receipt { stream, seq } }));
        }

        Ok(None)
    }
}

fn decode_event(encoded: &str) -> QueueResult<SyncEvent> {
    serde_json::from_str(encoded).map_err(|e| QueueError::Serialization(e.to_string()))
}

#[async_trait]
impl EventQueue for SqliteQueue {
    async fn publish(&self, event: &SyncEvent) -> QueueResult<()> {
        let stream = stream_key(&event.source, &event.target);
        let encoded =
            serde_json::to_string(event).map_err(|e| QueueError::Serialization(e.to_string()))?;

        let conn = self.conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let next_seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM queue_events WHERE stream = ?1",
                params![stream],
                |row| row.get(0),
            )
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        tx.execute(
            "INSERT INTO queue_events (stream, seq, event) VALUES (?1, ?2, ?3)",
            params![stream, next_seq, encoded],
        )
        .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        // Trim the oldest queued entries past the stream cap.
        tx.execute(
            "DELETE FROM queue_events WHERE stream = ?1 AND state = 'queued' AND seq IN (
                 SELECT seq FROM queue_events WHERE stream = ?1 AND state = 'queued'
                 ORDER BY seq ASC
                 LIMIT max(0, (SELECT COUNT(*) FROM queue_events
                               WHERE stream = ?1 AND state = 'queued') - ?2)
             )",
            params![stream, self.max_stream_length as i64],
        )
        .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        tx.commit().map_err(|e| QueueError::Unavailable(e.to_string()))
    }

    async fn consume(&self, consumer_id: &str, timeout: Duration) -> QueueResult<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(delivery) = self.try_consume(consumer_id, crate::model::now_ms())? {
                return Ok(Some(delivery));
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn ack(&self, consumer_id: &str, receipt: &Receipt) -> QueueResult<()> {
        let conn = self.conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM queue_events
                 WHERE stream = ?1 AND seq = ?2 AND state = 'inflight' AND consumer = ?3",
                params![receipt.stream, receipt.seq as i64, consumer_id],
            )
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        if deleted == 0 {
            return Err(QueueError::UnknownReceipt(format!(
                "{}#{}",
                receipt.stream, receipt.seq
            )));
        }
        Ok(())
    }

    async fn get_pending(&self, consumer_id: &str) -> QueueResult<Vec<SyncEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT event FROM queue_events
                 WHERE state = 'inflight' AND consumer = ?1
                 ORDER BY stream, seq",
            )
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let rows = stmt
            .query_map(params![consumer_id], |row| row.get::<_, String>(0))
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let mut events = Vec::new();
        for row in rows {
            let encoded = row.map_err(|e| QueueError::Unavailable(e.to_string()))?;
            events.push(decode_event(&encoded)?);
        }
        Ok(events)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let conn = self.conn()?;

        let streams: usize = conn
            .query_row("SELECT COUNT(DISTINCT stream) FROM queue_events", [], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(|e| QueueError::Unavailable(e.to_string()))? as usize;

        let queued: usize = conn
            .query_row(
                "SELECT COUNT(*) FROM queue_events WHERE state = 'queued'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|e| QueueError::Unavailable(e.to_string()))? as usize;

        let mut stats = QueueStats { streams, queued, ..Default::default() };

        let mut stmt = conn
            .prepare(
                "SELECT consumer, COUNT(*) FROM queue_events
                 WHERE state = 'inflight' GROUP BY consumer",
            )
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        for row in rows {
            let (consumer, count) = row.map_err(|e| QueueError::Unavailable(e.to_string()))?;
            stats.in_flight += count;
            stats.pending_by_consumer.insert(consumer, count);
        }
        Ok(stats)
    }

    async fn clear(&self) -> QueueResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM queue_events", [])
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
