/*
    converge-core - Eventually-consistent data synchronization engine

    Keeps two independently-owned data stores convergent without
    two-phase commit:
    - Durable change log of every intent and its terminal status
    - At-least-once event queue with per-stream FIFO and
      visibility-timeout redelivery
    - Pure field-level conflict resolution
    - Pluggable delivery strategies (real-time, incremental, batch,
      manual approval)
    - Worker-pool engine with bounded retries and graceful drain
*/

pub mod config;
pub mod core_engine;
pub mod core_log;
pub mod core_queue;
pub mod core_resolve;
pub mod core_strategy;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod shutdown;

// Re-export commonly used types
pub use config::{Config, ConfigError, RouteConfig, StorageBackend};
pub use core_engine::{build_strategies, EngineError, EngineHealth, StrategyMap, SyncEngine, SyncTask};
pub use core_log::{ChangeLog, ChangeLogStore, LogStoreError, MemoryChangeLog, SqliteChangeLog};
pub use core_queue::{EventQueue, MemoryQueue, QueueError, SqliteQueue};
pub use core_resolve::{Conflict, ConflictResolver, ResolutionResult, ResolutionStrategy, ResolverConfig};
pub use core_strategy::{ApplyTarget, StrategyKind, SyncStrategy};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogLevel};
pub use model::{DataChange, SyncEvent, SyncEventType, SyncResult, SyncStatus};
