/*
    core_strategy - Delivery policies for one (source, target) pair

    A strategy decides when and how a payload reaches the target: right
    away, as a field diff, in grouped batches, or only after a human
    approves it. The set is closed: one enum variant per policy behind a
    single sync / can_handle interface, selected by configuration.
*/

pub mod apply;
pub mod batch;
pub mod incremental;
pub mod manual;
pub mod real_time;

pub use apply::ApplyTarget;
pub use batch::BatchSync;
pub use incremental::IncrementalSync;
pub use manual::{ManualSync, PendingSync};
pub use real_time::RealTimeSync;

use crate::model::SyncEventType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by strategies
#[derive(Debug, Error)]
pub enum StrategyError {
    /// The injected apply callback reported a hard failure
    #[error("Apply callback failed: {0}")]
    Apply(String),

    /// The target's current copy could not be fetched
    #[error("Target fetch failed: {0}")]
    Fetch(String),
}

pub type StrategyResult<T> = Result<T, StrategyError>;

/// Which policy a strategy implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RealTime,
    Incremental,
    Batch,
    Manual,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::RealTime => "real_time",
            StrategyKind::Incremental => "incremental",
            StrategyKind::Batch => "batch",
            StrategyKind::Manual => "manual",
        }
    }
}

/// What a strategy did with one payload
#[derive(Debug, Clone, Copy)]
pub struct StrategyOutcome {
    /// The payload reached the target (directly or inside a flush)
    pub applied: bool,

    pub conflicts_resolved: u32,

    /// The strategy took ownership of the payload for later delivery
    /// (batch buffer, manual approval queue)
    pub deferred: bool,
}

impl StrategyOutcome {
    pub fn applied(conflicts_resolved: u32) -> Self {
        StrategyOutcome { applied: true, conflicts_resolved, deferred: false }
    }

    pub fn deferred() -> Self {
        StrategyOutcome { applied: false, conflicts_resolved: 0, deferred: true }
    }

    pub fn failed() -> Self {
        StrategyOutcome { applied: false, conflicts_resolved: 0, deferred: false }
    }

    /// An outcome the engine counts as success.
    pub fn is_success(&self) -> bool {
        self.applied || self.deferred
    }
}

/// Rolling per-strategy counters, mirrored by the engine-level metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategyMetrics {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub conflicts_resolved: u64,
    pub avg_sync_time_ms: f64,
}

impl StrategyMetrics {
    pub fn record(&mut self, success: bool, duration_ms: u64, conflicts_resolved: u32) {
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

    pub fn success_rate(&self) -> f64 {
        if self.total_syncs == 0 {
            return 0.0;
        }
        self.successful_syncs as f64 / self.total_syncs as f64
    }
}

/// Closed set of delivery policies
pub enum SyncStrategy {
    RealTime(RealTimeSync),
    Incremental(IncrementalSync),
    Batch(BatchSync),
    Manual(ManualSync),
}

impl SyncStrategy {
    pub async fn sync(
        &self,
        payload: &serde_json::Value,
        event_type: SyncEventType,
    ) -> StrategyResult<StrategyOutcome> {
        match self {
            SyncStrategy::RealTime(s) => s.sync(payload, event_type).await,
            SyncStrategy::Incremental(s) => s.sync(payload, event_type).await,
            SyncStrategy::Batch(s) => s.sync(payload, event_type).await,
            SyncStrategy::Manual(s) => s.sync(payload, event_type).await,
        }
    }

    pub fn can_handle(&self, event_type: SyncEventType) -> bool {
        match self {
            // Incremental only makes sense for changes to existing data.
            SyncStrategy::Incremental(_) => {
                matches!(event_type, SyncEventType::Update | SyncEventType::Sync)
            }
            _ => true,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            SyncStrategy::RealTime(_) => StrategyKind::RealTime,
            SyncStrategy::Incremental(_) => StrategyKind::Incremental,
            SyncStrategy::Batch(_) => StrategyKind::Batch,
            SyncStrategy::Manual(_) => StrategyKind::Manual,
        }
    }

    pub async fn metrics(&self) -> StrategyMetrics {
        match self {
            SyncStrategy::RealTime(s) => s.metrics().await,
            SyncStrategy::Incremental(s) => s.metrics().await,
            SyncStrategy::Batch(s) => s.metrics().await,
            SyncStrategy::Manual(s) => s.metrics().await,
        }
    }

    /// Drain any buffered work. Only the batch strategy holds a buffer;
    /// everything else is a no-op.
    pub async fn flush(&self) -> StrategyResult<()> {
        match self {
            SyncStrategy::Batch(s) => s.flush().await,
            _ => Ok(()),
        }
    }

    /// Flush the batch buffer if its deadline has passed. Driven by the
    /// engine's flush ticker.
    pub async fn flush_if_due(&self) -> StrategyResult<()> {
        match self {
            SyncStrategy::Batch(s) => s.flush_if_due().await,
            _ => Ok(()),
        }
    }

    pub fn as_manual(&self) -> Option<&ManualSync> {
        match self {
            SyncStrategy::Manual(s) => Some(s),
            _ => None,
        }
    }
}
