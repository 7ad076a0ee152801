/*
    manual.rs - Human-approved delivery

    Every payload lands in a pending queue and nothing reaches the
    target until an operator approves it. Rejection removes the request
    and records the reason; approval applies through the target and then
    removes it.
*/

use super::apply::ApplyTarget;
use super::{StrategyMetrics, StrategyOutcome, StrategyResult};
use crate::model::{now_ms, SyncEventType};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// A sync awaiting operator review
#[derive(Debug, Clone)]
pub struct PendingSync {
    pub id: String,
    pub payload: Value,
    pub event_type: SyncEventType,
    pub queued_at_ms: u64,
}

pub struct ManualSync {
    source: String,
    target: String,
    apply: Arc<dyn ApplyTarget>,
    pending: Mutex<Vec<PendingSync>>,
    metrics: Mutex<StrategyMetrics>,
}

impl ManualSync {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        apply: Arc<dyn ApplyTarget>,
    ) -> Self {
        ManualSync {
            source: source.into(),
            target: target.into(),
            apply,
            pending: Mutex::new(Vec::new()),
            metrics: Mutex::new(StrategyMetrics::default()),
        }
    }

    pub async fn sync(
        &self,
        payload: &Value,
        event_type: SyncEventType,
    ) -> StrategyResult<StrategyOutcome> {
        let request = PendingSync {
            id: uuid::Uuid::new_v4().to_string(),
            payload: payload.clone(),
            event_type,
            queued_at_ms: now_ms(),
        };

        info!(
            source = %self.source,
            target = %self.target,
            request_id = %request.id,
            "queued sync for manual approval"
        );
        self.pending.lock().await.push(request);
        Ok(StrategyOutcome::deferred())
    }

    /// Requests still waiting for a decision.
    pub async fn pending(&self) -> Vec<PendingSync> {
        self.pending.lock().await.clone()
    }

    /// Approve a pending request: apply it to the target and remove it
    /// from the pending set. Returns false for an unknown id.
    pub async fn approve(&self, request_id: &str) -> StrategyResult<bool> {
        let request = {
            let mut pending = self.pending.lock().await;
            match pending.iter().position(|r| r.id == request_id) {
                Some(idx) => pending.remove(idx),
                None => {
                    warn!(request_id, "approval for unknown sync request");
                    return Ok(false);
                }
            }
        };

        let started = Instant::now();
        let applied = self.apply.apply(&request.payload, request.event_type).await?;
        self.metrics
            .lock()
            .await
            .record(applied, started.elapsed().as_millis() as u64, 0);

        info!(request_id, applied, "manual sync approved");
        Ok(applied)
    }

    /// Reject a pending request. Returns false for an unknown id.
    pub async fn reject(&self, request_id: &str, reason: Option<&str>) -> bool {
        let mut pending = self.pending.lock().await;
        match pending.iter().position(|r| r.id == request_id) {
            Some(idx) => {
                pending.remove(idx);
                info!(request_id, reason = reason.unwrap_or("none"), "manual sync rejected");
                true
            }
            None => {
                warn!(request_id, "rejection for unknown sync request");
                false
            }
        }
    }

    pub async fn metrics(&self) -> StrategyMetrics {
        self.metrics.lock().await.clone()
    }
}
