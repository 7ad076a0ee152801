/*
    worker.rs - Queue worker loop

    Each worker repeatedly consumes one event, dispatches it to the
    strategy for its (source, target) pair, and acknowledges only after
    the strategy reports success. The shutdown token is checked once per
    iteration: an in-flight event is always finished and acked before
    the worker exits.
*/

use super::SyncEngine;
use crate::core_log::ChangeLogStore;
use crate::core_queue::{Delivery, Receipt};
use crate::model::{now_ms, SyncEvent, SyncStatus};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub(crate) async fn run_worker(engine: Arc<SyncEngine>, worker_id: String) {
    info!(worker = %worker_id, "sync worker started");
    engine.workers_alive.fetch_add(1, Ordering::SeqCst);

    loop {
        if engine.shutdown.is_shutting_down().await {
            break;
        }

        match engine.queue.consume(&worker_id, engine.config.engine.poll_timeout).await {
            Ok(Some(delivery)) => {
                engine.active_workers.fetch_add(1, Ordering::SeqCst);
                crate::metrics::record_counter("queue.consumed", 1);
                process_delivery(&engine, &worker_id, delivery).await;
                engine.active_workers.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(worker = %worker_id, error = %e, "queue unavailable, backing off");
                tokio::time::sleep(engine.config.engine.error_backoff).await;
            }
        }
    }

    engine.workers_alive.fetch_sub(1, Ordering::SeqCst);
    info!(worker = %worker_id, "sync worker stopped");
}

async fn process_delivery(engine: &SyncEngine, worker_id: &str, delivery: Delivery) {
    let started = Instant::now();
    let Delivery { event, receipt } = delivery;

    // End-to-end deadline across the whole retry lifetime.
    let age_ms = now_ms().saturating_sub(event.timestamp_ms);
    if age_ms > engine.config.engine.event_deadline.as_millis() as u64 {
        warn!(event_id = %event.id, age_ms, "event exceeded its deadline, failing permanently");
        let _ = engine
            .change_log
            .update_sync_status(&event.id, SyncStatus::Failed, Some("event deadline exceeded"))
            .await;
        engine.record_outcome(false, started.elapsed().as_millis() as u64, 0).await;
        ack(engine, worker_id, &receipt).await;
        return;
    }

    let key = (event.source.clone(), event.target.clone());
    let Some(strategy) = engine.strategies.get(&key) else {
        // Routes are validated at construction; this only happens for a
        // foreign entry in a shared durable queue.
        error!(event_id = %event.id, source = %event.source, target = %event.target,
               "no strategy for queued event");
        let _ = engine
            .change_log
            .update_sync_status(&event.id, SyncStatus::Failed, Some("no strategy for pair"))
            .await;
        ack(engine, worker_id, &receipt).await;
        return;
    };

    if !strategy.can_handle(event.event_type) {
        let msg = format!(
            "strategy {} cannot handle {} events",
            strategy.kind().as_str(),
            event.event_type.as_str()
        );
        let _ = engine
            .change_log
            .update_sync_status(&event.id, SyncStatus::Failed, Some(&msg))
            .await;
        engine.record_outcome(false, started.elapsed().as_millis() as u64, 0).await;
        ack(engine, worker_id, &receipt).await;
        return;
    }

    let _ = engine
        .change_log
        .update_sync_status(&event.id, SyncStatus::InProgress, None)
        .await;

    match strategy.sync(&event.payload, event.event_type).await {
        Ok(outcome) if outcome.is_success() => {
            let _ = engine
                .change_log
                .update_sync_status(&event.id, SyncStatus::Completed, None)
                .await;
            engine
                .record_outcome(true, started.elapsed().as_millis() as u64, outcome.conflicts_resolved)
                .await;
            debug!(worker = %worker_id, event_id = %event.id, "event processed");
            ack(engine, worker_id, &receipt).await;
        }
        Ok(_) => {
            handle_failure(
                engine,
                worker_id,
                event,
                receipt,
                started,
                "apply callback reported failure".to_string(),
            )
            .await;
        }
        Err(e) => {
            handle_failure(engine, worker_id, event, receipt, started, e.to_string()).await;
        }
    }
}

/// Bounded retry with a fixed delay. Below the bound the event is
/// re-published with an incremented retry count and the old delivery is
/// acked; at the bound it is failed permanently and never re-enqueued.
async fn handle_failure(
    engine: &SyncEngine,
    worker_id: &str,
    event: SyncEvent,
    receipt: Receipt,
    started: Instant,
    error: String,
) {
    if event.retry_count < event.max_retries {
        warn!(
            event_id = %event.id,
            retry = event.retry_count + 1,
            max_retries = event.max_retries,
            error = %error,
            "sync failed, scheduling retry"
        );
        let mut retry = event.clone();
        retry.retry_count += 1;
        retry.status = SyncStatus::Retrying;

        let _ = engine
            .change_log
            .update_sync_status(&event.id, SyncStatus::Retrying, Some(&error))
            .await;
        crate::metrics::record_counter("sync.events.retried", 1);

        tokio::time::sleep(engine.config.engine.retry_delay).await;

        match engine.queue.publish(&retry).await {
            Ok(()) => ack(engine, worker_id, &receipt).await,
            Err(e) => {
                // Leave the delivery unacked: the visibility timeout will
                // resurface the original event instead of losing it.
                warn!(event_id = %event.id, error = %e,
                      "re-enqueue failed, relying on redelivery");
            }
        }
    } else {
        warn!(
            event_id = %event.id,
            retries = event.retry_count,
            error = %error,
            "retries exhausted, failing permanently"
        );
        let _ = engine
            .change_log
            .update_sync_status(&event.id, SyncStatus::Failed, Some(&error))
            .await;
        engine.record_outcome(false, started.elapsed().as_millis() as u64, 0).await;
        ack(engine, worker_id, &receipt).await;
    }
}

async fn ack(engine: &SyncEngine, worker_id: &str, receipt: &Receipt) {
    if let Err(e) = engine.queue.ack(worker_id, receipt).await {
        // Redelivery after the visibility timeout took the event back;
        // processing was idempotent so this is harmless.
        warn!(stream = %receipt.stream, seq = receipt.seq, error = %e, "ack failed");
    }
}
