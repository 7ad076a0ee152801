/*
    Retry tests - bounded retry then permanent failure

    An event whose apply always fails is retried exactly max_retries
    times, transitions to Failed, and is never retried again. A
    transient failure recovers within the bound.
*/

use super::*;
use crate::core_log::ChangeLogStore;
use crate::core_strategy::apply::testing::RecordingTarget;
use crate::model::{SyncEventType, SyncStatus};
use serde_json::json;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_sync_path_retry_bound() {
    let target = Arc::new(RecordingTarget::new());
    target.always_fail.store(true, Ordering::SeqCst);
    let engine = build_engine(test_config(StrategyKind::RealTime), target.clone());

    let result = engine
        .sync_data("crm", "subsystem", json!({"id": "u1"}), SyncEventType::Update, 1)
        .await;

    assert!(!result.success);

    // max_retries = 2 in the test config: exactly two retry transitions
    // are recorded, then the terminal failure.
    let change = engine.change_log().get_change(&result.event_id).await.unwrap().unwrap();
    assert_eq!(change.sync_status, SyncStatus::Failed);
    assert_eq!(change.retry_count, 2);
    assert!(change.error_message.is_some());
    assert_eq!(target.applied_count().await, 0);
}

#[tokio::test]
async fn test_worker_path_retry_bound_and_no_resurrection() {
    let target = Arc::new(RecordingTarget::new());
    target.always_fail.store(true, Ordering::SeqCst);
    let engine = build_engine(test_config(StrategyKind::RealTime), target.clone());
    engine.start().await;

    let result = engine
        .sync_data("crm", "subsystem", json!({"id": "u1"}), SyncEventType::Update, 0)
        .await;
    assert!(result.accepted);

    let engine_ref = engine.clone();
    let event_id = result.event_id.clone();
    let failed = wait_for(
        || {
            let engine = engine_ref.clone();
            let id = event_id.clone();
            async move {
                matches!(
                    engine.change_log().get_change(&id).await,
                    Ok(Some(change)) if change.sync_status == SyncStatus::Failed
                )
            }
        },
        Duration::from_secs(3),
    )
    .await;
    assert!(failed, "event should fail permanently after retries");

    let change = engine.change_log().get_change(&result.event_id).await.unwrap().unwrap();
    assert_eq!(change.retry_count, 2);

    // Permanently failed events stay failed and the queue stays empty.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let change = engine.change_log().get_change(&result.event_id).await.unwrap().unwrap();
    assert_eq!(change.sync_status, SyncStatus::Failed);
    assert_eq!(target.applied_count().await, 0);

    engine.stop().await;
}

#[tokio::test]
async fn test_transient_failure_recovers_within_bound() {
    let target = Arc::new(RecordingTarget::new());
    target.fail_next.store(1, Ordering::SeqCst);
    let engine = build_engine(test_config(StrategyKind::RealTime), target.clone());

    let result = engine
        .sync_data("crm", "subsystem", json!({"id": "u1"}), SyncEventType::Update, 1)
        .await;

    assert!(result.success);
    assert_eq!(target.applied_count().await, 1);

    // One retry transition was recorded before success.
    let change = engine.change_log().get_change(&result.event_id).await.unwrap().unwrap();
    assert_eq!(change.sync_status, SyncStatus::Completed);
    assert_eq!(change.retry_count, 1);
}
