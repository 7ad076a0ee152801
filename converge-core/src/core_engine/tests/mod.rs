/*
    Engine test support - shared fixtures and doubles

    Builds a fully wired engine on the in-memory queue and change log
    with timings short enough for tests.
*/

pub mod retry_tests;

use crate::config::{Config, RouteConfig};
use crate::core_engine::{build_strategies, SyncEngine};
use crate::core_log::ChangeLog;
use crate::core_queue::{
    Delivery, EventQueue, MemoryQueue, QueueError, QueueResult, QueueStats, Receipt,
};
use crate::core_strategy::apply::testing::RecordingTarget;
use crate::core_strategy::{ApplyTarget, StrategyKind, StrategyResult};
use crate::model::{SyncEvent, SyncEventType};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Config with timings tightened for tests.
pub fn test_config(strategy: StrategyKind) -> Config {
    let mut config = Config::default();
    config.engine.worker_count = 2;
    config.engine.max_retries = 2;
    config.engine.retry_delay = Duration::from_millis(10);
    config.engine.poll_timeout = Duration::from_millis(50);
    config.engine.error_backoff = Duration::from_millis(20);
    config.engine.sync_interval = Duration::from_millis(100);
    config.engine.flush_tick = Duration::from_millis(20);
    config.engine.cleanup_interval = Duration::from_secs(3600);
    config.routes.push(RouteConfig {
        source: "crm".into(),
        target: "subsystem".into(),
        strategy,
        batch_size: 100,
        batch_timeout: Duration::from_secs(60),
    });
    config
}

/// Engine over the in-memory queue and change log with one configured
/// route delivered to `target`.
pub fn build_engine(config: Config, target: Arc<dyn ApplyTarget>) -> Arc<SyncEngine> {
    let queue = Arc::new(MemoryQueue::new(
        config.queue.visibility_timeout,
        config.queue.max_stream_length,
    ));
    build_engine_with_queue(config, target, queue)
}

pub fn build_engine_with_queue(
    config: Config,
    target: Arc<dyn ApplyTarget>,
    queue: Arc<dyn EventQueue>,
) -> Arc<SyncEngine> {
    let mut targets: HashMap<(String, String), Arc<dyn ApplyTarget>> = HashMap::new();
    for route in &config.routes {
        targets.insert((route.source.clone(), route.target.clone()), target.clone());
    }

    let strategies = build_strategies(&config, &targets).expect("strategies build");
    let change_log = Arc::new(ChangeLog::in_memory(config.change_log.max_entries));

    Arc::new(SyncEngine::new(config, queue, change_log, strategies).expect("engine builds"))
}

/// Poll `predicate` until it holds or the deadline passes.
pub async fn wait_for<F, Fut>(mut predicate: F, deadline: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let end = tokio::time::Instant::now() + deadline;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= end {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Queue double whose backend is permanently unreachable.
pub struct FailingQueue;

#[async_trait]
impl EventQueue for FailingQueue {
    async fn publish(&self, _: &SyncEvent) -> QueueResult<()> {
        Err(QueueError::Unavailable("backend offline".into()))
    }

    async fn consume(&self, _: &str, timeout: Duration) -> QueueResult<Option<Delivery>> {
        tokio::time::sleep(timeout).await;
        Err(QueueError::Unavailable("backend offline".into()))
    }

    async fn ack(&self, _: &str, _: &Receipt) -> QueueResult<()> {
        Err(QueueError::Unavailable("backend offline".into()))
    }

    async fn get_pending(&self, _: &str) -> QueueResult<Vec<SyncEvent>> {
        Err(QueueError::Unavailable("backend offline".into()))
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        Err(QueueError::Unavailable("backend offline".into()))
    }

    async fn clear(&self) -> QueueResult<()> {
        Err(QueueError::Unavailable("backend offline".into()))
    }
}

/// Apply target that takes a fixed time per apply, for drain tests.
pub struct SlowTarget {
    pub inner: RecordingTarget,
    pub delay: Duration,
}

impl SlowTarget {
    pub fn new(delay: Duration) -> Self {
        SlowTarget { inner: RecordingTarget::new(), delay }
    }
}

#[async_trait]
impl ApplyTarget for SlowTarget {
    async fn apply(&self, payload: &Value, event_type: SyncEventType) -> StrategyResult<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.apply(payload, event_type).await
    }

    async fn fetch(&self, entity_id: &str) -> StrategyResult<Option<Value>> {
        self.inner.fetch(entity_id).await
    }
}
