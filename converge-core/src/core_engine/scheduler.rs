/*
    scheduler.rs - Background loops owned by the engine

    Three periodic tasks: the incremental scheduler re-feeds stalled
    changes, the flush ticker drives deadline-triggered batch flushes,
    and the retention sweep prunes terminal change records. All three
    exit on the shutdown signal.
*/

use super::SyncEngine;
use crate::core_log::ChangeLogStore;
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) async fn run_incremental_scheduler(engine: Arc<SyncEngine>) {
    info!(interval = ?engine.config.engine.sync_interval, "incremental scheduler started");
    let mut shutdown_rx = engine.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(engine.config.engine.sync_interval) => {}
            _ = shutdown_rx.recv() => break,
        }
        if engine.shutdown.is_shutting_down().await {
            break;
        }

        let since = match engine.change_log.get_last_sync_time().await {
            Ok(Some(ts)) => ts,
            // Nothing completed yet: scan the whole log so changes that
            // predate this process are still recovered.
            Ok(None) => 0,
            Err(e) => {
                warn!(error = %e, "incremental scheduler could not read last sync time");
                continue;
            }
        };

        let results = engine.incremental_sync(since).await;
        if !results.is_empty() {
            info!(count = results.len(), "incremental scheduler re-fed stalled changes");
        }
    }

    info!("incremental scheduler stopped");
}

pub(crate) async fn run_flush_ticker(engine: Arc<SyncEngine>) {
    let mut shutdown_rx = engine.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(engine.config.engine.flush_tick) => {}
            _ = shutdown_rx.recv() => break,
        }

        for strategy in engine.strategies.values() {
            if let Err(e) = strategy.flush_if_due().await {
                warn!(error = %e, "batch flush tick failed");
            }
        }
    }
}

pub(crate) async fn run_cleanup_sweep(engine: Arc<SyncEngine>) {
    let mut shutdown_rx = engine.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(engine.config.engine.cleanup_interval) => {}
            _ = shutdown_rx.recv() => break,
        }

        match engine.change_log.cleanup_old_changes(engine.config.change_log.retention).await {
            Ok(0) => {}
            Ok(removed) => {
                info!(removed, "retention sweep removed terminal changes");
                crate::metrics::record_counter("change_log.cleaned", removed as u64);
            }
            Err(e) => warn!(error = %e, "retention sweep failed"),
        }
    }
}
