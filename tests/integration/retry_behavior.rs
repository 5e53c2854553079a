//! Retry classification and backoff timing

use crate::support::{item_ids, unpaced_config, HarnessBuilder, MockExtraction, MockStructuring};
use receipt_batch::pipeline::{FailureKind, ItemState};
use receipt_batch::services::ServiceError;
use receipt_batch::Stage;
use std::time::Duration;

fn gaps(starts: &[tokio::time::Instant]) -> Vec<Duration> {
    starts.windows(2).map(|pair| pair[1] - pair[0]).collect()
}

fn assert_close(actual: Duration, expected_secs: u64) {
    let expected = Duration::from_secs(expected_secs);
    assert!(
        actual >= expected && actual < expected + Duration::from_secs(1),
        "expected ~{expected:?}, got {actual:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_backs_off_exponentially() {
    let items = item_ids(1);
    let extraction = MockExtraction::new();
    extraction.fail_first(
        &items[0],
        vec![
            ServiceError::RateLimited("429".into()),
            ServiceError::RateLimited("429".into()),
            ServiceError::RateLimited("429".into()),
        ],
    );
    let harness = HarnessBuilder::new(&items).extraction(extraction).build();
    let mut config = unpaced_config();
    config.retry_count = 3;

    let summary = harness
        .pipeline
        .submit_batch(items.clone(), &config)
        .await
        .unwrap();
    assert_eq!(summary.processed_count, 1);

    let gaps = gaps(&harness.extraction.call_starts(&items[0]));
    assert_eq!(gaps.len(), 3);
    assert_close(gaps[0], 10);
    assert_close(gaps[1], 20);
    assert_close(gaps[2], 40);
}

#[tokio::test(start_paused = true)]
async fn test_transient_backs_off_linearly() {
    let items = item_ids(1);
    let extraction = MockExtraction::new();
    extraction.fail_first(
        &items[0],
        vec![
            ServiceError::Transient("HTTP 503".into()),
            ServiceError::Transient("timeout".into()),
            ServiceError::Transient("HTTP 502".into()),
        ],
    );
    let harness = HarnessBuilder::new(&items).extraction(extraction).build();
    let mut config = unpaced_config();
    config.retry_count = 3;

    let summary = harness
        .pipeline
        .submit_batch(items.clone(), &config)
        .await
        .unwrap();
    assert_eq!(summary.processed_count, 1);

    let gaps = gaps(&harness.extraction.call_starts(&items[0]));
    assert_close(gaps[0], 10);
    assert_close(gaps[1], 20);
    assert_close(gaps[2], 30);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_capped_at_maximum() {
    let items = item_ids(1);
    let extraction = MockExtraction::new();
    extraction.fail_always(&items[0], ServiceError::RateLimited("429".into()));
    let harness = HarnessBuilder::new(&items).extraction(extraction).build();
    let mut config = unpaced_config();
    config.retry_count = 4;
    config.backoff_max_secs = 25.0;

    harness
        .pipeline
        .submit_batch(items.clone(), &config)
        .await
        .unwrap();

    let gaps = gaps(&harness.extraction.call_starts(&items[0]));
    assert_eq!(gaps.len(), 4);
    assert_close(gaps[0], 10);
    assert_close(gaps[1], 20);
    assert_close(gaps[2], 25);
    assert_close(gaps[3], 25);
}

#[tokio::test(start_paused = true)]
async fn test_pacing_dominates_short_backoff() {
    let items = item_ids(1);
    let extraction = MockExtraction::new();
    extraction.fail_first(&items[0], vec![ServiceError::Transient("timeout".into())]);
    let harness = HarnessBuilder::new(&items).extraction(extraction).build();
    let mut config = unpaced_config();
    config.backoff_base_secs = 1.0;
    config.pacing_secs.extraction = 6.0;

    harness
        .pipeline
        .submit_batch(items.clone(), &config)
        .await
        .unwrap();

    let gaps = gaps(&harness.extraction.call_starts(&items[0]));
    assert_close(gaps[0], 6);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_not_retried() {
    let items = item_ids(1);
    let extraction = MockExtraction::new();
    extraction.fail_always(&items[0], ServiceError::Fatal("HTTP 400: bad image".into()));
    let harness = HarnessBuilder::new(&items).extraction(extraction).build();

    let summary = harness
        .pipeline
        .submit_batch(items.clone(), &unpaced_config())
        .await
        .unwrap();

    assert_eq!(harness.extraction.call_count(), 1);
    let report = summary.item(&items[0]).unwrap();
    assert_eq!(report.state, ItemState::ExtractFailed);
    assert_eq!(report.failure_kind, Some(FailureKind::Fatal));
    assert_eq!(harness.structuring.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_keeps_last_classification() {
    let items = item_ids(1);
    let structuring = MockStructuring::new();
    structuring.fail_always(&items[0], ServiceError::RateLimited("quota window full".into()));
    let harness = HarnessBuilder::new(&items).structuring(structuring).build();
    let mut config = unpaced_config();
    config.retry_count = 2;

    let summary = harness
        .pipeline
        .submit_batch(items.clone(), &config)
        .await
        .unwrap();

    assert_eq!(harness.structuring.call_count(), 3);
    let failure = &summary.failures[0];
    assert_eq!(failure.stage, Stage::Structuring);
    assert_eq!(failure.kind, FailureKind::RateLimited);
    assert_eq!(failure.message, "quota window full");

    let entry = harness
        .checkpoints
        .get(&items[0], Stage::Structuring)
        .unwrap()
        .unwrap();
    assert!(!entry.is_success());
    assert_eq!(entry.attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_zero_retries_means_single_attempt() {
    let items = item_ids(1);
    let extraction = MockExtraction::new();
    extraction.fail_always(&items[0], ServiceError::Transient("timeout".into()));
    let harness = HarnessBuilder::new(&items).extraction(extraction).build();
    let mut config = unpaced_config();
    config.retry_count = 0;

    harness
        .pipeline
        .submit_batch(items, &config)
        .await
        .unwrap();

    assert_eq!(harness.extraction.call_count(), 1);
}
