/*
    batch.rs - Size- or deadline-triggered grouped delivery

    Buffers payloads and flushes when the buffer reaches batch_size or
    when a single monotonic deadline expires. The deadline is set when
    the buffer first goes non-empty and checked on every enqueue and by
    the engine's flush ticker; there is no per-batch timer task, so the
    two flush triggers cannot race each other.

    A flush groups entries by event type. A failing group fails alone;
    sibling groups in the same flush still go out.
*/

use super::apply::ApplyTarget;
use super::{StrategyMetrics, StrategyOutcome, StrategyResult};
use crate::model::SyncEventType;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct BufferedEntry {
    payload: Value,
    event_type: SyncEventType,
}

#[derive(Default)]
struct BatchState {
    buffer: Vec<BufferedEntry>,
    deadline: Option<Instant>,
}

pub struct BatchSync {
    source: String,
    target: String,
    apply: Arc<dyn ApplyTarget>,
    batch_size: usize,
    batch_timeout: Duration,
    state: Mutex<BatchState>,
    metrics: Mutex<StrategyMetrics>,
}

impl BatchSync {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        apply: Arc<dyn ApplyTarget>,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> Self {
        BatchSync {
            source: source.into(),
            target: target.into(),
            apply,
            batch_size: batch_size.max(1),
            batch_timeout,
            state: Mutex::new(BatchState::default()),
            metrics: Mutex::new(StrategyMetrics::default()),
        }
    }

    pub async fn sync(
        &self,
        payload: &Value,
        event_type: SyncEventType,
    ) -> StrategyResult<StrategyOutcome> {
        let drained = {
            let mut state = self.state.lock().await;
            state.buffer.push(BufferedEntry { payload: payload.clone(), event_type });

            if state.deadline.is_none() {
                state.deadline = Some(Instant::now() + self.batch_timeout);
            }

            let size_reached = state.buffer.len() >= self.batch_size;
            let deadline_passed = state.deadline.map_or(false, |d| d <= Instant::now());

            if size_reached || deadline_passed {
                Some(Self::drain(&mut state))
            } else {
                None
            }
        };

        match drained {
            Some(entries) => {
                let ok = self.dispatch(entries).await;
                Ok(StrategyOutcome { applied: ok, conflicts_resolved: 0, deferred: false })
            }
            None => Ok(StrategyOutcome::deferred()),
        }
    }

    /// Flush the buffer if the deadline has passed. Called by the
    /// engine's ticker so a lone buffered entry still goes out.
    pub async fn flush_if_due(&self) -> StrategyResult<()> {
        let drained = {
            let mut state = self.state.lock().await;
            match state.deadline {
                Some(deadline) if deadline <= Instant::now() && !state.buffer.is_empty() => {
                    Some(Self::drain(&mut state))
                }
                _ => None,
            }
        };

        if let Some(entries) = drained {
            self.dispatch(entries).await;
        }
        Ok(())
    }

    /// Drain everything unconditionally. Shutdown flushes, never drops.
    pub async fn flush(&self) -> StrategyResult<()> {
        let entries = {
            let mut state = self.state.lock().await;
            if state.buffer.is_empty() {
                state.deadline = None;
                return Ok(());
            }
            Self::drain(&mut state)
        };
        self.dispatch(entries).await;
        Ok(())
    }

    pub async fn buffered(&self) -> usize {
        self.state.lock().await.buffer.len()
    }

    fn drain(state: &mut BatchState) -> Vec<BufferedEntry> {
        state.deadline = None;
        std::mem::take(&mut state.buffer)
    }

    /// Group by event type, apply each group, report overall success.
    /// Partial-failure semantics: one bad group does not fail the rest.
    async fn dispatch(&self, entries: Vec<BufferedEntry>) -> bool {
        let started = Instant::now();
        let total = entries.len();

        let mut groups: Vec<(SyncEventType, Vec<Value>)> = Vec::new();
        for entry in entries {
            match groups.iter_mut().find(|(t, _)| *t == entry.event_type) {
                Some((_, payloads)) => payloads.push(entry.payload),
                None => groups.push((entry.event_type, vec![entry.payload])),
            }
        }

        let mut all_ok = true;
        for (event_type, payloads) in &groups {
            let group_ok = match self.apply.apply_batch(payloads, *event_type).await {
                Ok(ok) => ok,
                Err(e) => {
                    warn!(
                        source = %self.source,
                        target = %self.target,
                        event_type = event_type.as_str(),
                        error = %e,
                        "batch group dispatch errored"
                    );
                    false
                }
            };
            if !group_ok {
                warn!(
                    source = %self.source,
                    target = %self.target,
                    event_type = event_type.as_str(),
                    count = payloads.len(),
                    "batch group failed"
                );
                all_ok = false;
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.metrics.lock().await.record(all_ok, duration_ms, 0);
        debug!(
            source = %self.source,
            target = %self.target,
            total,
            groups = groups.len(),
            success = all_ok,
            "batch flushed"
        );
        all_ok
    }

    pub async fn metrics(&self) -> StrategyMetrics {
        self.metrics.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::super::apply::testing::RecordingTarget;
    use super::*;
    use serde_json::json;

    fn strategy(target: Arc<RecordingTarget>, size: usize, timeout: Duration) -> BatchSync {
        BatchSync::new("crm", "subsystem", target, size, timeout)
    }

    #[tokio::test]
    async fn test_size_trigger_flushes_immediately() {
        let target = Arc::new(RecordingTarget::new());
        let s = strategy(target.clone(), 3, Duration::from_secs(60));

        for i in 0..2 {
            let outcome = s.sync(&json!({"id": i}), SyncEventType::Update).await.unwrap();
            assert!(outcome.deferred);
        }
        assert_eq!(target.applied_count().await, 0);

        // Third push reaches batch_size and flushes without waiting.
        let outcome = s.sync(&json!({"id": 2}), SyncEventType::Update).await.unwrap();
        assert!(outcome.applied);
        assert!(!outcome.deferred);
        assert_eq!(target.applied_count().await, 3);
        assert_eq!(s.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_deadline_trigger_flushes_single_entry() {
        let target = Arc::new(RecordingTarget::new());
        let s = strategy(target.clone(), 100, Duration::from_millis(30));

        s.sync(&json!({"id": 0}), SyncEventType::Update).await.unwrap();
        assert_eq!(target.applied_count().await, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        s.flush_if_due().await.unwrap();

        assert_eq!(target.applied_count().await, 1);

        // Nothing buffered, the ticker finds nothing more to do.
        s.flush_if_due().await.unwrap();
        assert_eq!(target.applied_count().await, 1);
    }

    #[tokio::test]
    async fn test_flush_if_due_is_noop_before_deadline() {
        let target = Arc::new(RecordingTarget::new());
        let s = strategy(target.clone(), 100, Duration::from_secs(60));

        s.sync(&json!({"id": 0}), SyncEventType::Update).await.unwrap();
        s.flush_if_due().await.unwrap();
        assert_eq!(target.applied_count().await, 0);
        assert_eq!(s.buffered().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_flush_drains_buffer() {
        let target = Arc::new(RecordingTarget::new());
        let s = strategy(target.clone(), 100, Duration::from_secs(60));

        s.sync(&json!({"id": 0}), SyncEventType::Create).await.unwrap();
        s.sync(&json!({"id": 1}), SyncEventType::Update).await.unwrap();

        s.flush().await.unwrap();
        assert_eq!(target.applied_count().await, 2);
    }

    #[tokio::test]
    async fn test_groups_partition_by_event_type() {
        let target = Arc::new(RecordingTarget::new());
        let s = strategy(target.clone(), 3, Duration::from_secs(60));

        s.sync(&json!({"id": 0}), SyncEventType::Create).await.unwrap();
        s.sync(&json!({"id": 1}), SyncEventType::Delete).await.unwrap();
        s.sync(&json!({"id": 2}), SyncEventType::Create).await.unwrap();

        let applied = target.applied.lock().await;
        assert_eq!(applied.len(), 3);
        let creates = applied.iter().filter(|(_, t)| *t == SyncEventType::Create).count();
        let deletes = applied.iter().filter(|(_, t)| *t == SyncEventType::Delete).count();
        assert_eq!((creates, deletes), (2, 1));
    }

    #[tokio::test]
    async fn test_partial_failure_leaves_other_groups_applied() {
        let target = Arc::new(RecordingTarget::new());
        // First apply fails: the first group dispatched loses its head
        // entry and the group reports failure, but the other group is
        // still dispatched.
        target.fail_next.store(1, std::sync::atomic::Ordering::SeqCst);
        let s = strategy(target.clone(), 2, Duration::from_secs(60));

        s.sync(&json!({"id": 0}), SyncEventType::Create).await.unwrap();
        let outcome = s.sync(&json!({"id": 1}), SyncEventType::Delete).await.unwrap();

        // Overall flush failed because one group failed.
        assert!(!outcome.applied);
        // The delete group still went through.
        let applied = target.applied.lock().await;
        assert!(applied.iter().any(|(_, t)| *t == SyncEventType::Delete));
    }
}
