/*
    real_time.rs - Synchronous delivery

    Executes on call: fetch the target's current copy, resolve any
    field-level conflicts, push the resolved payload. Holds no state
    beyond metrics.
*/

use super::apply::ApplyTarget;
use super::{StrategyMetrics, StrategyOutcome, StrategyResult};
use crate::core_resolve::ConflictResolver;
use crate::model::{now_ms, SyncEventType};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct RealTimeSync {
    source: String,
    target: String,
    apply: Arc<dyn ApplyTarget>,
    resolver: ConflictResolver,
    metrics: Mutex<StrategyMetrics>,
}

impl RealTimeSync {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        apply: Arc<dyn ApplyTarget>,
        resolver: ConflictResolver,
    ) -> Self {
        RealTimeSync {
            source: source.into(),
            target: target.into(),
            apply,
            resolver,
            metrics: Mutex::new(StrategyMetrics::default()),
        }
    }

    pub async fn sync(
        &self,
        payload: &Value,
        event_type: SyncEventType,
    ) -> StrategyResult<StrategyOutcome> {
        let started = Instant::now();

        // Deletes carry no field data worth diffing.
        let remote = if event_type == SyncEventType::Delete {
            None
        } else {
            self.fetch_remote(payload).await
        };

        let (outbound, conflicts_resolved) = match remote {
            Some(remote) => {
                let mut conflicts = self.resolver.detect_conflicts(
                    payload,
                    &remote,
                    &self.source,
                    &self.target,
                    now_ms(),
                );
                let results = self.resolver.resolve_all(&mut conflicts);
                let resolved = results.iter().filter(|r| r.success).count() as u32;
                if !conflicts.is_empty() {
                    debug!(
                        source = %self.source,
                        target = %self.target,
                        conflicts = conflicts.len(),
                        resolved,
                        "resolved field conflicts before apply"
                    );
                }
                (ConflictResolver::apply_resolutions(payload, &conflicts, &results), resolved)
            }
            None => (payload.clone(), 0),
        };

        let result = self.apply.apply(&outbound, event_type).await;
        let applied = matches!(result, Ok(true));
        let duration_ms = started.elapsed().as_millis() as u64;

        self.metrics.lock().await.record(applied, duration_ms, conflicts_resolved);

        match result {
            Ok(applied) => Ok(StrategyOutcome {
                applied,
                conflicts_resolved,
                deferred: false,
            }),
            Err(e) => Err(e),
        }
    }

    /// Fetch failures degrade to "no remote copy": the payload goes out
    /// unresolved rather than failing the sync.
    async fn fetch_remote(&self, payload: &Value) -> Option<Value> {
        let entity_id = payload.get("id").and_then(Value::as_str)?;
        match self.apply.fetch(entity_id).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(entity_id, error = %e, "remote fetch failed, skipping conflict detection");
                None
            }
        }
    }

    pub async fn metrics(&self) -> StrategyMetrics {
        self.metrics.lock().await.clone()
    }
}
