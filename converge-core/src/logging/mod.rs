//! Logging subsystem for Converge
//!
//! Unified logging interface over the `tracing` crate. Supports log
//! level selection via config or the RUST_LOG environment variable and
//! optional JSON output for log shippers.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod error;
mod level;

pub use error::LoggingError;
pub use level::LogLevel;

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// The minimum log level to display
    pub level: LogLevel,
    /// Whether to include target module information
    pub with_target: bool,
    /// Whether to use JSON formatting
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_target: true,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Create a new LogConfig with the specified level
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set whether to include target information
    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    /// Set whether to use JSON formatting
    pub fn json_format(mut self, enabled: bool) -> Self {
        self.json_format = enabled;
        self
    }
}

/// Initialize the logging subsystem with default configuration
pub fn init_logging() -> Result<(), LoggingError> {
    init_logging_with_config(LogConfig::default())
}

/// Initialize the logging subsystem with custom configuration
///
/// RUST_LOG takes precedence over the configured level when set.
pub fn init_logging_with_config(config: LogConfig) -> Result<(), LoggingError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let fmt_layer = fmt::layer().with_target(config.with_target);

    if config.json_format {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer.json())
            .try_init()
            .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert!(matches!(config.level, LogLevel::Info));
        assert!(config.with_target);
        assert!(!config.json_format);
    }

    #[test]
    fn test_log_config_builder() {
        let config = LogConfig::new(LogLevel::Debug)
            .with_target(false)
            .json_format(true);

        assert!(matches!(config.level, LogLevel::Debug));
        assert!(!config.with_target);
        assert!(config.json_format);
    }
}
