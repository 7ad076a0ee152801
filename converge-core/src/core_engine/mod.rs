/*
    core_engine - Orchestrator for the synchronization pipeline

    Owns the worker pool, wires strategies to (source, target) pairs,
    drives retries, the incremental scheduler, the batch flush ticker
    and the retention sweep. The only component external callers invoke.

    Construction is plain dependency injection: build the strategies
    first, then hand the engine an already-populated map. There is no
    global registry and no strategy registration after construction.
*/

pub mod errors;
mod scheduler;
mod worker;

#[cfg(test)]
pub mod tests;

pub use errors::{EngineError, EngineResult};

use crate::config::Config;
use crate::core_log::{ChangeLog, ChangeLogStore};
use crate::core_queue::EventQueue;
use crate::core_resolve::ConflictResolver;
use crate::core_strategy::{
    ApplyTarget, BatchSync, IncrementalSync, ManualSync, RealTimeSync, StrategyKind, SyncStrategy,
};
use crate::health::{checks, ComponentHealth, HealthChecker, HealthStatus};
use crate::model::{now_ms, DataChange, SyncEvent, SyncEventType, SyncResult, SyncStatus};
use crate::shutdown::ShutdownCoordinator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Strategies keyed by (source, target)
pub type StrategyMap = HashMap<(String, String), Arc<SyncStrategy>>;

/// Build the strategy map for every configured route from the injected
/// apply targets. Fails fast on a route with no target.
pub fn build_strategies(
    config: &Config,
    targets: &HashMap<(String, String), Arc<dyn ApplyTarget>>,
) -> EngineResult<StrategyMap> {
    let mut map = StrategyMap::new();

    for route in &config.routes {
        let key = (route.source.clone(), route.target.clone());
        let target = targets.get(&key).ok_or_else(|| EngineError::MissingApplyTarget {
            source_system: route.source.clone(),
            target: route.target.clone(),
        })?;

        let strategy = match route.strategy {
            StrategyKind::RealTime => SyncStrategy::RealTime(RealTimeSync::new(
                route.source.clone(),
                route.target.clone(),
                target.clone(),
                ConflictResolver::new(config.resolver.clone()),
            )),
            StrategyKind::Incremental => SyncStrategy::Incremental(IncrementalSync::new(
                route.source.clone(),
                route.target.clone(),
                target.clone(),
            )),
            StrategyKind::Batch => SyncStrategy::Batch(BatchSync::new(
                route.source.clone(),
                route.target.clone(),
                target.clone(),
                route.batch_size,
                route.batch_timeout,
            )),
            StrategyKind::Manual => SyncStrategy::Manual(ManualSync::new(
                route.source.clone(),
                route.target.clone(),
                target.clone(),
            )),
        };
        map.insert(key, Arc::new(strategy));
    }

    Ok(map)
}

/// Engine-level rolling counters
#[derive(Debug, Clone, Default)]
pub struct SyncMetrics {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub conflicts_resolved: u64,
    pub avg_sync_time_ms: f64,
}

impl SyncMetrics {
    fn record(&mut self, success: bool, duration_ms: u64, conflicts_resolved: u32) {
        self.total_syncs += 1;
        if success {
            self.successful_syncs += 1;
        } else {
            self.failed_syncs += 1;
        }
        self.conflicts_resolved += u64::from(conflicts_resolved);

        let total = self.total_syncs as f64;
        self.avg_sync_time_ms =
            (self.avg_sync_time_ms * (total - 1.0) + duration_ms as f64) / total;
    }

    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            total_syncs: self.total_syncs,
            successful_syncs: self.successful_syncs,
            failed_syncs: self.failed_syncs,
            conflicts_resolved: self.conflicts_resolved,
            avg_sync_time_ms: self.avg_sync_time_ms,
            success_rate: if self.total_syncs == 0 {
                0.0
            } else {
                self.successful_syncs as f64 / self.total_syncs as f64
            },
        }
    }
}

/// Snapshot of the engine counters for the health surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub conflicts_resolved: u64,
    pub avg_sync_time_ms: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersHealth {
    pub total: usize,
    pub active: usize,
}

/// Health surface returned by `health_check`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineHealth {
    pub status: HealthStatus,
    pub is_running: bool,
    pub components: Vec<ComponentHealth>,
    pub workers: WorkersHealth,
    pub metrics: MetricsReport,
}

/// One unit of work for `batch_sync`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    pub source: String,
    pub target: String,
    pub payload: Value,
    pub event_type: SyncEventType,
    #[serde(default)]
    pub priority: i64,
}

/// The synchronization engine
pub struct SyncEngine {
    config: Config,
    queue: Arc<dyn EventQueue>,
    change_log: Arc<ChangeLog>,
    strategies: Arc<StrategyMap>,
    shutdown: Arc<ShutdownCoordinator>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    is_running: AtomicBool,
    workers_alive: AtomicUsize,
    active_workers: AtomicUsize,
    metrics: Mutex<SyncMetrics>,
    health: HealthChecker,
}

impl SyncEngine {
    /// Validates that every configured route has a strategy in the
    /// injected map. A missing strategy is the one fatal error class.
    pub fn new(
        config: Config,
        queue: Arc<dyn EventQueue>,
        change_log: Arc<ChangeLog>,
        strategies: StrategyMap,
    ) -> EngineResult<Self> {
        for route in &config.routes {
            let key = (route.source.clone(), route.target.clone());
            if !strategies.contains_key(&key) {
                return Err(EngineError::MissingStrategy {
                    source_system: route.source.clone(),
                    target: route.target.clone(),
                });
            }
        }

        let shutdown = Arc::new(ShutdownCoordinator::new(config.engine.poll_timeout * 2));

        Ok(SyncEngine {
            config,
            queue,
            change_log,
            strategies: Arc::new(strategies),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            is_running: AtomicBool::new(false),
            workers_alive: AtomicUsize::new(0),
            active_workers: AtomicUsize::new(0),
            metrics: Mutex::new(SyncMetrics::default()),
            health: HealthChecker::new(env!("CARGO_PKG_VERSION")),
        })
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn shutdown_coordinator(&self) -> Arc<ShutdownCoordinator> {
        self.shutdown.clone()
    }

    pub fn change_log(&self) -> &Arc<ChangeLog> {
        &self.change_log
    }

    /// Strategy registered for a pair, if any. Callers use this to reach
    /// the manual strategy's approve / reject / pending surface.
    pub fn strategy(&self, source: &str, target: &str) -> Option<Arc<SyncStrategy>> {
        self.strategies.get(&(source.to_string(), target.to_string())).cloned()
    }

    /// Spawn the worker pool and the background loops. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("sync engine already running");
            return;
        }
        crate::metrics::record_gauge("workers.total", self.config.engine.worker_count as f64);

        let mut tasks = self.tasks.lock().await;
        for i in 0..self.config.engine.worker_count {
            tasks.push(tokio::spawn(worker::run_worker(self.clone(), format!("worker-{}", i))));
        }
        if self.config.engine.enable_incremental {
            tasks.push(tokio::spawn(scheduler::run_incremental_scheduler(self.clone())));
        }
        tasks.push(tokio::spawn(scheduler::run_flush_ticker(self.clone())));
        tasks.push(tokio::spawn(scheduler::run_cleanup_sweep(self.clone())));

        info!(workers = self.config.engine.worker_count, "sync engine started");
    }

    /// Stop cooperatively: every worker finishes and acknowledges its
    /// in-flight event, then buffered batches are flushed.
    pub async fn stop(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.begin_shutdown().await;

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().await;
            guard.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "engine task panicked during shutdown");
            }
        }

        // Drain, don't drop: shutdown must not lose buffered work.
        for strategy in self.strategies.values() {
            if let Err(e) = strategy.flush().await {
                warn!(error = %e, "flush on shutdown failed");
            }
        }

        self.shutdown.mark_complete().await;
        info!("sync engine stopped");
    }

    /// The single ingestion point. Always logs the change durably first;
    /// positive priority executes synchronously through the strategy,
    /// anything else is queued and reported accepted.
    pub async fn sync_data(
        &self,
        source: &str,
        target: &str,
        payload: Value,
        event_type: SyncEventType,
        priority: i64,
    ) -> SyncResult {
        let event = SyncEvent::new(
            source,
            target,
            payload,
            event_type,
            priority,
            self.config.engine.max_retries,
        );
        crate::metrics::record_counter("sync.events.total", 1);

        let change = DataChange::from_event(&event);
        if let Err(e) = self.change_log.log_change(&change).await {
            warn!(event_id = %event.id, error = %e, "change log write failed");
            return SyncResult::failure(event.id, 0, format!("change log write failed: {}", e));
        }
        crate::metrics::record_counter("change_log.writes", 1);

        if priority > 0 {
            return self.execute_sync(event).await;
        }

        match self.queue.publish(&event).await {
            Ok(()) => {
                crate::metrics::record_counter("queue.published", 1);
                SyncResult::accepted(event.id)
            }
            Err(e) => {
                let msg = format!("queue unavailable: {}", e);
                warn!(event_id = %event.id, "{}", msg);
                let _ = self
                    .change_log
                    .update_sync_status(&event.id, SyncStatus::Failed, Some(&msg))
                    .await;
                self.record_outcome(false, 0, 0).await;
                SyncResult::failure(event.id, 0, msg)
            }
        }
    }

    /// Fan a set of tasks through `sync_data` concurrently, preserving
    /// input order in the results.
    pub async fn batch_sync(self: &Arc<Self>, tasks: Vec<SyncTask>) -> Vec<SyncResult> {
        let mut set = tokio::task::JoinSet::new();
        let count = tasks.len();

        for (index, task) in tasks.into_iter().enumerate() {
            let engine = self.clone();
            set.spawn(async move {
                let result = engine
                    .sync_data(
                        &task.source,
                        &task.target,
                        task.payload,
                        task.event_type,
                        task.priority,
                    )
                    .await;
                (index, result)
            });
        }

        let mut results: Vec<Option<SyncResult>> = (0..count).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => error!(error = %e, "batch sync task panicked"),
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| SyncResult::failure("", 0, "sync task panicked")))
            .collect()
    }

    /// Re-feed stalled (non-terminal, older than one sync interval)
    /// changes since `since_ms` back into the queue, preserving their
    /// original event ids so the change log stays 1:1 with events.
    pub async fn incremental_sync(&self, since_ms: u64) -> Vec<SyncResult> {
        let changes = match self.change_log.get_changes_since(since_ms).await {
            Ok(changes) => changes,
            Err(e) => {
                warn!(error = %e, "incremental sync could not read change log");
                return Vec::new();
            }
        };

        let stale_before =
            now_ms().saturating_sub(self.config.engine.sync_interval.as_millis() as u64);

        let mut results = Vec::new();
        for change in changes
            .iter()
            .filter(|c| !c.is_terminal() && c.timestamp_ms <= stale_before)
        {
            let event = change.to_event(self.config.engine.max_retries);
            match self.queue.publish(&event).await {
                Ok(()) => {
                    crate::metrics::record_counter("queue.published", 1);
                    results.push(SyncResult::accepted(event.id));
                }
                Err(e) => {
                    results.push(SyncResult::failure(event.id, 0, format!("queue unavailable: {}", e)))
                }
            }
        }
        results
    }

    /// Synchronous execution with the full retry policy inline.
    async fn execute_sync(&self, mut event: SyncEvent) -> SyncResult {
        let started = Instant::now();

        let key = (event.source.clone(), event.target.clone());
        let Some(strategy) = self.strategies.get(&key) else {
            let msg = format!("no strategy for {} -> {}", event.source, event.target);
            let _ = self
                .change_log
                .update_sync_status(&event.id, SyncStatus::Failed, Some(&msg))
                .await;
            return SyncResult::failure(event.id, 0, msg);
        };

        if !strategy.can_handle(event.event_type) {
            let msg = format!(
                "strategy {} cannot handle {} events",
                strategy.kind().as_str(),
                event.event_type.as_str()
            );
            let _ = self
                .change_log
                .update_sync_status(&event.id, SyncStatus::Failed, Some(&msg))
                .await;
            return SyncResult::failure(event.id, 0, msg);
        }

        let _ = self
            .change_log
            .update_sync_status(&event.id, SyncStatus::InProgress, None)
            .await;

        loop {
            let error = match strategy.sync(&event.payload, event.event_type).await {
                Ok(outcome) if outcome.is_success() => {
                    let _ = self
                        .change_log
                        .update_sync_status(&event.id, SyncStatus::Completed, None)
                        .await;
                    let duration_ms = started.elapsed().as_millis() as u64;
                    self.record_outcome(true, duration_ms, outcome.conflicts_resolved).await;
                    return SyncResult::completed(event.id, duration_ms, outcome.conflicts_resolved);
                }
                Ok(_) => "apply callback reported failure".to_string(),
                Err(e) => e.to_string(),
            };

            if event.retry_count < event.max_retries {
                event.retry_count += 1;
                let _ = self
                    .change_log
                    .update_sync_status(&event.id, SyncStatus::Retrying, Some(&error))
                    .await;
                crate::metrics::record_counter("sync.events.retried", 1);
                tokio::time::sleep(self.config.engine.retry_delay).await;
            } else {
                let _ = self
                    .change_log
                    .update_sync_status(&event.id, SyncStatus::Failed, Some(&error))
                    .await;
                let duration_ms = started.elapsed().as_millis() as u64;
                self.record_outcome(false, duration_ms, 0).await;
                return SyncResult::failure(event.id, duration_ms, error);
            }
        }
    }

    async fn record_outcome(&self, success: bool, duration_ms: u64, conflicts_resolved: u32) {
        self.metrics.lock().await.record(success, duration_ms, conflicts_resolved);

        if success {
            crate::metrics::record_counter("sync.events.completed", 1);
        } else {
            crate::metrics::record_counter("sync.events.failed", 1);
        }
        if conflicts_resolved > 0 {
            crate::metrics::record_counter("sync.conflicts.resolved", u64::from(conflicts_resolved));
        }
        crate::metrics::record_histogram("sync.event.duration_ms", duration_ms as f64);
    }

    pub async fn metrics(&self) -> MetricsReport {
        self.metrics.lock().await.report()
    }

    /// Assemble the health surface from component probes and counters.
    pub async fn health_check(&self) -> EngineHealth {
        let queue_component = match self.queue.stats().await {
            Ok(stats) => {
                crate::metrics::record_gauge("queue.depth", stats.queued as f64);
                crate::metrics::record_gauge("queue.in_flight", stats.in_flight as f64);
                checks::check_queue(&stats, self.config.queue.max_stream_length)
            }
            Err(e) => ComponentHealth::unhealthy("event_queue", e.to_string()),
        };

        let log_component = match self.change_log.stats().await {
            Ok(stats) => {
                crate::metrics::record_gauge("change_log.size", stats.total_changes as f64);
                checks::check_change_log(&stats)
            }
            Err(e) => ComponentHealth::unhealthy("change_log", e.to_string()),
        };

        let total = if self.is_running() { self.config.engine.worker_count } else { 0 };
        let alive = self.workers_alive.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);
        crate::metrics::record_gauge("workers.active", active as f64);

        self.health.set_component(queue_component).await;
        self.health.set_component(log_component).await;
        self.health.set_component(checks::check_workers(total, alive)).await;

        let check = self.health.check_health().await;
        EngineHealth {
            status: check.status,
            is_running: self.is_running(),
            components: check.components,
            workers: WorkersHealth { total, active },
            metrics: self.metrics.lock().await.report(),
        }
    }
}
