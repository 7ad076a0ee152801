/*
    incremental.rs - Watermark-filtered field diffs

    Skips payloads that predate the last successful sync, and pushes
    only the fields that changed since the last snapshot of the entity
    instead of the full document.
*/

use super::apply::ApplyTarget;
use super::{StrategyMetrics, StrategyOutcome, StrategyResult};
use crate::core_resolve::parse_timestamp;
use crate::model::{now_ms, SyncEventType};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct IncrementalState {
    /// Watermark: `updated_at` of the newest successfully synced payload
    last_sync_ms: Option<u64>,

    /// Last full payload pushed per entity, diffed against on the next push
    snapshots: HashMap<String, Value>,
}

pub struct IncrementalSync {
    source: String,
    target: String,
    apply: Arc<dyn ApplyTarget>,
    state: Mutex<IncrementalState>,
    metrics: Mutex<StrategyMetrics>,
}

impl IncrementalSync {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        apply: Arc<dyn ApplyTarget>,
    ) -> Self {
        IncrementalSync {
            source: source.into(),
            target: target.into(),
            apply,
            state: Mutex::new(IncrementalState::default()),
            metrics: Mutex::new(StrategyMetrics::default()),
        }
    }

    pub async fn sync(
        &self,
        payload: &Value,
        event_type: SyncEventType,
    ) -> StrategyResult<StrategyOutcome> {
        let started = Instant::now();
        let updated_at = parse_timestamp(payload.get("updated_at"), now_ms());

        let delta = {
            let state = self.state.lock().await;

            if let Some(last) = state.last_sync_ms {
                if updated_at <= last {
                    debug!(
                        source = %self.source,
                        target = %self.target,
                        "payload predates watermark, skipping"
                    );
                    return Ok(StrategyOutcome::applied(0));
                }
            }

            match payload.get("id").and_then(Value::as_str) {
                Some(id) => diff_against(state.snapshots.get(id), payload),
                None => payload.clone(),
            }
        };

        let result = self.apply.apply(&delta, event_type).await;
        let applied = matches!(result, Ok(true));
        let duration_ms = started.elapsed().as_millis() as u64;

        if applied {
            let mut state = self.state.lock().await;
            state.last_sync_ms = Some(state.last_sync_ms.map_or(updated_at, |l| l.max(updated_at)));
            if let Some(id) = payload.get("id").and_then(Value::as_str) {
                state.snapshots.insert(id.to_string(), payload.clone());
            }
        }

        self.metrics.lock().await.record(applied, duration_ms, 0);

        result.map(|applied| StrategyOutcome { applied, conflicts_resolved: 0, deferred: false })
    }

    pub async fn metrics(&self) -> StrategyMetrics {
        self.metrics.lock().await.clone()
    }
}

/// Fields of `payload` that differ from the snapshot, plus the entity id.
/// With no snapshot the full payload goes out.
fn diff_against(snapshot: Option<&Value>, payload: &Value) -> Value {
    let (Some(snapshot_map), Some(payload_map)) =
        (snapshot.and_then(Value::as_object), payload.as_object())
    else {
        return payload.clone();
    };

    let mut delta = Map::new();
    for (field, value) in payload_map {
        if snapshot_map.get(field) != Some(value) {
            delta.insert(field.clone(), value.clone());
        }
    }
    if let Some(id) = payload_map.get("id") {
        delta.insert("id".to_string(), id.clone());
    }
    Value::Object(delta)
}

#[cfg(test)]
mod tests {
    use super::super::apply::testing::RecordingTarget;
    use super::*;
    use serde_json::json;

    fn strategy(target: Arc<RecordingTarget>) -> IncrementalSync {
        IncrementalSync::new("crm", "subsystem", target)
    }

    #[tokio::test]
    async fn test_first_sync_pushes_full_payload() {
        let target = Arc::new(RecordingTarget::new());
        let s = strategy(target.clone());

        let payload = json!({"id": "u1", "email": "a@x.com", "status": "active",
                             "updated_at": "2024-01-01T00:00:00Z"});
        let outcome = s.sync(&payload, SyncEventType::Update).await.unwrap();

        assert!(outcome.applied);
        assert_eq!(target.last_applied().await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_second_sync_pushes_only_changed_fields() {
        let target = Arc::new(RecordingTarget::new());
        let s = strategy(target.clone());

        s.sync(
            &json!({"id": "u1", "email": "a@x.com", "status": "active",
                    "updated_at": "2024-01-01T00:00:00Z"}),
            SyncEventType::Update,
        )
        .await
        .unwrap();

        s.sync(
            &json!({"id": "u1", "email": "b@x.com", "status": "active",
                    "updated_at": "2024-02-01T00:00:00Z"}),
            SyncEventType::Update,
        )
        .await
        .unwrap();

        let delta = target.last_applied().await.unwrap();
        assert_eq!(delta["email"], "b@x.com");
        assert_eq!(delta["id"], "u1");
        // Unchanged fields stay home.
        assert!(delta.get("status").is_none());
    }

    #[tokio::test]
    async fn test_stale_payload_is_filtered() {
        let target = Arc::new(RecordingTarget::new());
        let s = strategy(target.clone());

        s.sync(
            &json!({"id": "u1", "v": 2, "updated_at": "2024-06-01T00:00:00Z"}),
            SyncEventType::Update,
        )
        .await
        .unwrap();

        // Older than the watermark: reported success, nothing pushed.
        let outcome = s
            .sync(
                &json!({"id": "u1", "v": 1, "updated_at": "2024-01-01T00:00:00Z"}),
                SyncEventType::Update,
            )
            .await
            .unwrap();

        assert!(outcome.applied);
        assert_eq!(target.applied_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_apply_leaves_watermark_untouched() {
        let target = Arc::new(RecordingTarget::new());
        let s = strategy(target.clone());

        target.always_fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let outcome = s
            .sync(
                &json!({"id": "u1", "updated_at": "2024-06-01T00:00:00Z"}),
                SyncEventType::Update,
            )
            .await
            .unwrap();
        assert!(!outcome.applied);

        // Same payload succeeds once the target recovers: no watermark
        // was recorded by the failed attempt.
        target.always_fail.store(false, std::sync::atomic::Ordering::SeqCst);
        let outcome = s
            .sync(
                &json!({"id": "u1", "updated_at": "2024-06-01T00:00:00Z"}),
                SyncEventType::Update,
            )
            .await
            .unwrap();
        assert!(outcome.applied);
        assert_eq!(target.applied_count().await, 1);
    }
}
