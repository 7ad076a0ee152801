/*
    apply.rs - The egress seam

    Strategies never talk to the secondary system directly; they go
    through an injected ApplyTarget owned by the schema-translation
    layer. The callback must be idempotent: at-least-once delivery means
    the same payload can arrive twice.
*/

use super::{StrategyError, StrategyResult};
use crate::model::SyncEventType;
use async_trait::async_trait;
use serde_json::Value;

/// Applies translated payloads to the target store.
#[async_trait]
pub trait ApplyTarget: Send + Sync {
    /// Apply one payload. `Ok(false)` is a transient failure the engine
    /// may retry; `Err` is a hard failure of the callback itself.
    async fn apply(&self, payload: &Value, event_type: SyncEventType) -> StrategyResult<bool>;

    /// Current copy of an entity on the target side, used for conflict
    /// detection. `None` when the entity does not exist there yet.
    async fn fetch(&self, entity_id: &str) -> StrategyResult<Option<Value>>;

    /// Apply a group of payloads of one event type. The default walks
    /// the group through `apply` and fails the group on the first miss.
    async fn apply_batch(
        &self,
        payloads: &[Value],
        event_type: SyncEventType,
    ) -> StrategyResult<bool> {
        for payload in payloads {
            if !self.apply(payload, event_type).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Blanket impl so `Arc<dyn ApplyTarget>` can be handed around freely.
#[async_trait]
impl<T: ApplyTarget + ?Sized> ApplyTarget for std::sync::Arc<T> {
    async fn apply(&self, payload: &Value, event_type: SyncEventType) -> StrategyResult<bool> {
        (**self).apply(payload, event_type).await
    }

    async fn fetch(&self, entity_id: &str) -> StrategyResult<Option<Value>> {
        (**self).fetch(entity_id).await
    }

    async fn apply_batch(
        &self,
        payloads: &[Value],
        event_type: SyncEventType,
    ) -> StrategyResult<bool> {
        (**self).apply_batch(payloads, event_type).await
    }
}

#[cfg(test)]
pub mod testing {
    //! Recording double used by strategy and engine tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    pub struct RecordingTarget {
        pub applied: Mutex<Vec<(Value, SyncEventType)>>,
        pub remote: Mutex<HashMap<String, Value>>,
        /// Fail this many applies before succeeding
        pub fail_next: AtomicU32,
        /// When set, every apply fails forever
        pub always_fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingTarget {
        pub fn new() -> Self {
            RecordingTarget {
                applied: Mutex::new(Vec::new()),
                remote: Mutex::new(HashMap::new()),
                fail_next: AtomicU32::new(0),
                always_fail: std::sync::atomic::AtomicBool::new(false),
            }
        }

        pub async fn seed_remote(&self, id: &str, doc: Value) {
            self.remote.lock().await.insert(id.to_string(), doc);
        }

        pub async fn applied_count(&self) -> usize {
            self.applied.lock().await.len()
        }

        pub async fn last_applied(&self) -> Option<Value> {
            self.applied.lock().await.last().map(|(p, _)| p.clone())
        }
    }

    #[async_trait]
    impl ApplyTarget for RecordingTarget {
        async fn apply(&self, payload: &Value, event_type: SyncEventType) -> StrategyResult<bool> {
            if self.always_fail.load(Ordering::SeqCst) {
                return Ok(false);
            }
            if self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Ok(false);
            }
            self.applied.lock().await.push((payload.clone(), event_type));
            Ok(true)
        }

        async fn fetch(&self, entity_id: &str) -> StrategyResult<Option<Value>> {
            Ok(self.remote.lock().await.get(entity_id).cloned())
        }
    }

    /// Target whose calls always error, simulating a broken callback.
    pub struct BrokenTarget;

    #[async_trait]
    impl ApplyTarget for BrokenTarget {
        async fn apply(&self, _: &Value, _: SyncEventType) -> StrategyResult<bool> {
            Err(StrategyError::Apply("target unreachable".into()))
        }

        async fn fetch(&self, _: &str) -> StrategyResult<Option<Value>> {
            Err(StrategyError::Fetch("target unreachable".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingTarget;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_default_apply_batch_stops_on_failure() {
        let target = RecordingTarget::new();
        target.fail_next.store(1, std::sync::atomic::Ordering::SeqCst);

        let payloads = vec![json!({"id": "a"}), json!({"id": "b"})];
        let ok = target.apply_batch(&payloads, SyncEventType::Update).await.unwrap();

        assert!(!ok);
        // The first apply failed, so nothing was recorded.
        assert_eq!(target.applied_count().await, 0);
    }

    #[tokio::test]
    async fn test_default_apply_batch_applies_all() {
        let target = RecordingTarget::new();
        let payloads = vec![json!({"id": "a"}), json!({"id": "b"})];

        let ok = target.apply_batch(&payloads, SyncEventType::Create).await.unwrap();
        assert!(ok);
        assert_eq!(target.applied_count().await, 2);
    }
}
