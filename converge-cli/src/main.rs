use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use converge_core::core_engine::build_strategies;
use converge_core::core_strategy::{ApplyTarget, StrategyResult};
use converge_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use converge_core::model::SyncEventType;
use converge_core::shutdown::install_signal_handlers;
use converge_core::{
    ChangeLog, Config, ConflictResolver, MemoryQueue, SqliteQueue, StorageBackend, SyncEngine,
};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(author, version, about = "Eventually-consistent data synchronization engine", long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run the sync engine with the health endpoint
    Run {
        /// Path to a TOML configuration file; environment variables are
        /// used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Bind address for the health endpoint
        #[arg(long, default_value = "127.0.0.1:8080")]
        health_addr: SocketAddr,
    },

    /// Validate a configuration file and print a summary
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Run the conflict resolver over two JSON documents
    Resolve {
        /// Local document
        local: PathBuf,

        /// Remote document
        remote: PathBuf,

        #[arg(long, default_value = "local")]
        source: String,

        #[arg(long, default_value = "remote")]
        target: String,
    },
}

/// Stand-in egress for smoke runs: logs every apply and reports no
/// remote copy. Real deployments inject the schema-translation layer's
/// apply callback instead.
struct LogApplyTarget;

#[async_trait::async_trait]
impl ApplyTarget for LogApplyTarget {
    async fn apply(&self, payload: &Value, event_type: SyncEventType) -> StrategyResult<bool> {
        info!(event_type = event_type.as_str(), %payload, "apply");
        Ok(true)
    }

    async fn fetch(&self, _entity_id: &str) -> StrategyResult<Option<Value>> {
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run { config, health_addr } => {
            run(config, health_addr, &args.log_level, args.json_logs).await
        }
        command => {
            init_logging_for_args(&args.log_level, args.json_logs)?;
            match command {
                Command::CheckConfig { config } => check_config(config),
                Command::Resolve { local, remote, source, target } => {
                    resolve(local, remote, source, target)
                }
                Command::Run { .. } => unreachable!(),
            }
        }
    }
}

fn init_logging_for_args(level: &str, json: bool) -> Result<()> {
    let log_level = LogLevel::from_str(level).unwrap_or_else(|| {
        eprintln!("Invalid log level '{}', using 'info'", level);
        LogLevel::Info
    });
    init_logging_with_config(LogConfig::new(log_level).json_format(json))?;
    Ok(())
}

async fn run(
    config_path: Option<PathBuf>,
    health_addr: SocketAddr,
    cli_level: &str,
    cli_json: bool,
) -> Result<()> {
    let config = match config_path {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::from_env().context("loading config from environment")?,
    };

    // CLI flags win over the config's logging section when set.
    let level_str = if cli_level != "info" { cli_level } else { config.logging.level.as_str() };
    let log_config = LogConfig::new(LogLevel::from_str(level_str).unwrap_or_default())
        .json_format(cli_json || config.logging.json_format)
        .with_target(config.logging.with_target);
    init_logging_with_config(log_config)?;

    if config.routes.is_empty() {
        warn!("no routes configured; the engine will accept nothing");
    }

    converge_core::metrics::init_metrics();
    if config.metrics.enabled {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(config.metrics.bind_address)
            .install()
            .context("installing Prometheus exporter")?;
        info!(addr = %config.metrics.bind_address, "Prometheus exporter listening");
    }

    // The schema-translation layer is out of scope here; every route
    // gets the logging stand-in target.
    let apply: Arc<dyn ApplyTarget> = Arc::new(LogApplyTarget);
    let mut targets: HashMap<(String, String), Arc<dyn ApplyTarget>> = HashMap::new();
    for route in &config.routes {
        targets.insert((route.source.clone(), route.target.clone()), apply.clone());
    }
    let strategies = build_strategies(&config, &targets)?;

    let queue: Arc<dyn converge_core::EventQueue> = match config.queue.backend {
        StorageBackend::Memory => Arc::new(MemoryQueue::new(
            config.queue.visibility_timeout,
            config.queue.max_stream_length,
        )),
        StorageBackend::Sqlite => Arc::new(SqliteQueue::open(
            config.queue.data_dir.join("queue.db"),
            config.queue.visibility_timeout,
            config.queue.max_stream_length,
        )?),
    };

    let change_log = Arc::new(match config.change_log.backend {
        StorageBackend::Memory => ChangeLog::in_memory(config.change_log.max_entries),
        StorageBackend::Sqlite => ChangeLog::durable(
            config.change_log.data_dir.join("changes.db"),
            config.change_log.max_entries,
        ),
    });

    let engine = Arc::new(SyncEngine::new(config, queue, change_log, strategies)?);
    engine.start().await;

    let coordinator = engine.shutdown_coordinator();
    install_signal_handlers(coordinator.clone());

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(engine.clone());

    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .with_context(|| format!("binding health endpoint on {}", health_addr))?;
    info!(addr = %health_addr, "health endpoint listening");

    let shutdown = coordinator.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
        .await
        .context("health endpoint failed")?;

    engine.stop().await;
    Ok(())
}

async fn health_handler(State(engine): State<Arc<SyncEngine>>) -> impl IntoResponse {
    let health = engine.health_check().await;
    let status =
        StatusCode::from_u16(health.status.to_http_status()).unwrap_or(StatusCode::OK);
    (status, Json(health))
}

async fn ready_handler(State(engine): State<Arc<SyncEngine>>) -> impl IntoResponse {
    if engine.is_running() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not running")
    }
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = Config::from_file(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;

    println!("configuration ok");
    println!("  workers:   {}", config.engine.worker_count);
    println!("  queue:     {:?}", config.queue.backend);
    println!("  changelog: {:?}", config.change_log.backend);
    for route in &config.routes {
        println!(
            "  route:     {} -> {} ({})",
            route.source,
            route.target,
            route.strategy.as_str()
        );
    }
    Ok(())
}

fn resolve(local: PathBuf, remote: PathBuf, source: String, target: String) -> Result<()> {
    let local: Value = serde_json::from_str(&std::fs::read_to_string(&local)?)
        .context("parsing local document")?;
    let remote: Value = serde_json::from_str(&std::fs::read_to_string(&remote)?)
        .context("parsing remote document")?;

    let resolver = ConflictResolver::default();
    let mut conflicts = resolver.detect_conflicts(
        &local,
        &remote,
        &source,
        &target,
        converge_core::model::now_ms(),
    );

    if conflicts.is_empty() {
        println!("no conflicts");
        return Ok(());
    }

    let results = resolver.resolve_all(&mut conflicts);
    for (conflict, result) in conflicts.iter().zip(&results) {
        println!(
            "{}: {} vs {} -> {}",
            conflict.field,
            conflict.local_value,
            conflict.remote_value,
            result
                .resolved_value
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "manual intervention required".to_string())
        );
    }

    let merged = ConflictResolver::apply_resolutions(&local, &conflicts, &results);
    println!("merged: {}", serde_json::to_string_pretty(&merged)?);
    Ok(())
}
