/*
    errors.rs - Engine error types

    Only misconfiguration is fatal: a routed pair with no strategy or no
    apply target fails construction. Runtime failures flow back as
    SyncResult values, never as panics or escaped errors.
*/

use crate::core_log::LogStoreError;
use crate::core_queue::QueueError;
use crate::core_strategy::StrategyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A configured route has no strategy in the injected map
    #[error("No strategy registered for {source_system} -> {target}")]
    MissingStrategy { source_system: String, target: String },

    /// A configured route has no apply target to build a strategy from
    #[error("No apply target provided for {source_system} -> {target}")]
    MissingApplyTarget { source_system: String, target: String },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Log(#[from] LogStoreError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),
}

pub type EngineResult<T> = Result<T, EngineError>;
