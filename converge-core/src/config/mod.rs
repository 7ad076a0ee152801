//! Configuration management for Converge
//!
//! Environment- and file-based configuration with defaults and
//! validation. Every duration field accepts humantime strings in TOML
//! ("30s", "5m").

use crate::core_resolve::ResolverConfig;
use crate::core_strategy::StrategyKind;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine configuration
    pub engine: EngineConfig,

    /// Event queue configuration
    pub queue: QueueConfig,

    /// Change log configuration
    pub change_log: ChangeLogConfig,

    /// Conflict resolution policy
    pub resolver: ResolverConfig,

    /// Per-(source, target) strategy selection
    pub routes: Vec<RouteConfig>,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of queue workers
    pub worker_count: usize,

    /// Retry bound for a failing event
    pub max_retries: u32,

    /// Fixed delay between retries
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Worker poll timeout against the queue
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,

    /// Backoff after a queue error before polling again
    #[serde(with = "humantime_serde")]
    pub error_backoff: Duration,

    /// Incremental scheduler interval
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,

    /// Whether the incremental scheduler runs at all
    pub enable_incremental: bool,

    /// End-to-end deadline across an event's retry lifetime
    #[serde(with = "humantime_serde")]
    pub event_deadline: Duration,

    /// Batch flush ticker interval
    #[serde(with = "humantime_serde")]
    pub flush_tick: Duration,

    /// Change log cleanup sweep interval
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            sync_interval: Duration::from_secs(300),
            enable_incremental: true,
            event_deadline: Duration::from_secs(3600),
            flush_tick: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

/// Which backing store a subsystem uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

/// Event queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: StorageBackend,

    /// How long a delivered event stays invisible before redelivery
    #[serde(with = "humantime_serde")]
    pub visibility_timeout: Duration,

    /// Cap on queued entries per stream
    pub max_stream_length: usize,

    /// Directory for the sqlite backend's database file
    pub data_dir: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            visibility_timeout: Duration::from_secs(30),
            max_stream_length: 10_000,
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Change log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeLogConfig {
    pub backend: StorageBackend,

    /// Entry cap for the in-memory backend
    pub max_entries: usize,

    /// Terminal records older than this are swept
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    /// Directory for the sqlite backend's database file
    pub data_dir: PathBuf,
}

impl Default for ChangeLogConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            max_entries: 100_000,
            retention: Duration::from_secs(30 * 24 * 3600),
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Strategy selection for one (source, target) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub source: String,
    pub target: String,
    pub strategy: StrategyKind,

    /// Batch strategy: flush threshold
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Batch strategy: flush deadline
    #[serde(default = "default_batch_timeout", with = "humantime_serde")]
    pub batch_timeout: Duration,
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_target: true,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    pub enabled: bool,

    /// Exporter bind address
    pub bind_address: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:9090".parse().expect("static address"),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Variables follow the pattern CONVERGE_<SECTION>_<KEY>.
    /// Example: CONVERGE_ENGINE_WORKER_COUNT=8
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(count) = env::var("CONVERGE_ENGINE_WORKER_COUNT") {
            config.engine.worker_count = count
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid worker count: {}", e)))?;
        }
        if let Ok(retries) = env::var("CONVERGE_ENGINE_MAX_RETRIES") {
            config.engine.max_retries = retries
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid max retries: {}", e)))?;
        }
        if let Ok(incremental) = env::var("CONVERGE_ENGINE_ENABLE_INCREMENTAL") {
            config.engine.enable_incremental = incremental.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("Invalid incremental flag: {}", e))
            })?;
        }

        if let Ok(backend) = env::var("CONVERGE_QUEUE_BACKEND") {
            config.queue.backend = parse_backend(&backend)?;
        }
        if let Ok(dir) = env::var("CONVERGE_QUEUE_DATA_DIR") {
            config.queue.data_dir = PathBuf::from(dir);
        }

        if let Ok(backend) = env::var("CONVERGE_CHANGE_LOG_BACKEND") {
            config.change_log.backend = parse_backend(&backend)?;
        }
        if let Ok(dir) = env::var("CONVERGE_CHANGE_LOG_DATA_DIR") {
            config.change_log.data_dir = PathBuf::from(dir);
        }

        if let Ok(level) = env::var("CONVERGE_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(json) = env::var("CONVERGE_LOG_JSON") {
            config.logging.json_format = json
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid JSON flag: {}", e)))?;
        }

        if let Ok(enabled) = env::var("CONVERGE_METRICS_ENABLED") {
            config.metrics.enabled = enabled
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid metrics flag: {}", e)))?;
        }
        if let Ok(addr) = env::var("CONVERGE_METRICS_BIND_ADDRESS") {
            config.metrics.bind_address = addr.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("Invalid metrics address: {}", e))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.worker_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_count must be greater than 0".to_string(),
            ));
        }

        if self.queue.max_stream_length == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_stream_length must be greater than 0".to_string(),
            ));
        }

        if self.queue.visibility_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "visibility_timeout must be greater than 0".to_string(),
            ));
        }

        if self.change_log.max_entries == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_entries must be greater than 0".to_string(),
            ));
        }

        for route in &self.routes {
            if route.source.is_empty() || route.target.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "route source and target must be non-empty".to_string(),
                ));
            }
            if route.source == route.target {
                return Err(ConfigError::ValidationFailed(format!(
                    "route {} -> {} syncs an endpoint with itself",
                    route.source, route.target
                )));
            }
            if route.batch_size == 0 {
                return Err(ConfigError::ValidationFailed(
                    "batch_size must be greater than 0".to_string(),
                ));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}

fn parse_backend(s: &str) -> Result<StorageBackend, ConfigError> {
    match s {
        "memory" => Ok(StorageBackend::Memory),
        "sqlite" => Ok(StorageBackend::Sqlite),
        other => Err(ConfigError::InvalidValue(format!("Unknown backend: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let mut config = Config::default();
        config.engine.worker_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_self_route() {
        let mut config = Config::default();
        config.routes.push(RouteConfig {
            source: "crm".into(),
            target: "crm".into(),
            strategy: StrategyKind::RealTime,
            batch_size: 10,
            batch_timeout: Duration::from_secs(60),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config::default();
        config.routes.push(RouteConfig {
            source: "crm".into(),
            target: "subsystem".into(),
            strategy: StrategyKind::Batch,
            batch_size: 50,
            batch_timeout: Duration::from_secs(30),
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("converge.toml");
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.routes.len(), 1);
        assert_eq!(loaded.routes[0].strategy, StrategyKind::Batch);
        assert_eq!(loaded.routes[0].batch_timeout, Duration::from_secs(30));
        assert_eq!(loaded.engine.max_retries, config.engine.max_retries);
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!(parse_backend("memory").unwrap(), StorageBackend::Memory);
        assert_eq!(parse_backend("sqlite").unwrap(), StorageBackend::Sqlite);
        assert!(parse_backend("redis").is_err());
    }
}
