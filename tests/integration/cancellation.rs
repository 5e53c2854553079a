//! Cooperative cancellation of a running batch

use crate::support::{item_ids, Harness, HarnessBuilder, MockExtraction};
use receipt_batch::pipeline::{FailureKind, ItemState, PipelineConfig};
use receipt_batch::services::ServiceError;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_dispatching_new_calls() {
    // Extraction calls start at t=0 and t=4; cancellation at t=6 leaves the
    // remaining three items undispatched.
    let items = item_ids(5);
    let harness = Harness::new(&items);
    let cancel = harness.pipeline.cancel_signal();
    let config = PipelineConfig::default();

    let canceller = async {
        tokio::time::sleep(Duration::from_secs(6)).await;
        cancel.cancel();
    };
    let (summary, ()) = tokio::join!(
        harness.pipeline.submit_batch(items.clone(), &config),
        canceller
    );
    let summary = summary.unwrap();

    assert!(summary.cancelled);
    assert_eq!(harness.extraction.call_count(), 2);
    assert_eq!(summary.items.len(), 5);
    assert_eq!(summary.processed_count, 1);
    assert_eq!(summary.item(&items[0]).unwrap().state, ItemState::Completed);

    for item_id in &items[2..] {
        let report = summary.item(item_id).unwrap();
        assert_eq!(report.state, ItemState::ExtractFailed);
        assert_eq!(report.failure_kind, Some(FailureKind::Cancelled));
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_items_keep_their_files() {
    let items = item_ids(3);
    let harness = Harness::new(&items);
    let cancel = harness.pipeline.cancel_signal();
    let mut config = PipelineConfig::default();
    config.keep_failed_items = false;

    let canceller = async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();
    };
    let (summary, ()) = tokio::join!(
        harness.pipeline.submit_batch(items.clone(), &config),
        canceller
    );
    let summary = summary.unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.deleted_failed, 0);
    for item_id in &items[1..] {
        assert!(harness.files.contains(item_id));
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_records_last_error() {
    let items = item_ids(1);
    let extraction = MockExtraction::new();
    extraction.fail_always(&items[0], ServiceError::RateLimited("429".into()));
    let harness = HarnessBuilder::new(&items).extraction(extraction).build();
    let cancel = harness.pipeline.cancel_signal();
    let config = PipelineConfig::default();

    let canceller = async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
    };
    let started = tokio::time::Instant::now();
    let (summary, ()) = tokio::join!(
        harness.pipeline.submit_batch(items.clone(), &config),
        canceller
    );
    let summary = summary.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(harness.extraction.call_count(), 1);
    let report = summary.item(&items[0]).unwrap();
    assert_eq!(report.failure_kind, Some(FailureKind::Cancelled));

    let entry = harness
        .checkpoints
        .get(&items[0], receipt_batch::Stage::Extraction)
        .unwrap()
        .unwrap();
    assert!(!entry.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_pipeline_dispatches_nothing() {
    let items = item_ids(2);
    let harness = Harness::new(&items);
    harness.pipeline.cancel_signal().cancel();

    let summary = harness
        .pipeline
        .submit_batch(items, &PipelineConfig::default())
        .await
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(harness.extraction.call_count(), 0);
    assert_eq!(summary.failed_count, 2);
}
