//! Concurrency caps, pacing and inter-chunk delays under paused time

use crate::support::{item_ids, unpaced_config, HarnessBuilder, MockExtraction, MockStructuring};
use receipt_batch::pipeline::PipelineConfig;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_extraction_concurrency_cap_respected() {
    let items = item_ids(8);
    let harness = HarnessBuilder::new(&items)
        .extraction(MockExtraction::with_latency(Duration::from_secs(1)))
        .build();
    let mut config = unpaced_config();
    config.concurrency.extraction = 2;

    let summary = harness
        .pipeline
        .submit_batch(items, &config)
        .await
        .unwrap();

    assert_eq!(summary.processed_count, 8);
    assert_eq!(harness.extraction.max_in_flight(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_single_extraction_slot_never_overlaps() {
    let items = item_ids(5);
    let harness = HarnessBuilder::new(&items)
        .extraction(MockExtraction::with_latency(Duration::from_secs(3)))
        .build();
    let mut config = unpaced_config();
    config.concurrency.extraction = 1;

    let summary = harness
        .pipeline
        .submit_batch(items, &config)
        .await
        .unwrap();

    assert_eq!(summary.processed_count, 5);
    assert_eq!(harness.extraction.call_count(), 5);
    assert_eq!(harness.extraction.max_in_flight(), 1);

    let starts: Vec<_> = harness
        .extraction
        .calls()
        .into_iter()
        .map(|(_, at)| at)
        .collect();
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(3));
    }
}

#[tokio::test(start_paused = true)]
async fn test_structuring_concurrency_cap_respected() {
    let items = item_ids(10);
    let harness = HarnessBuilder::new(&items)
        .structuring(MockStructuring::with_latency(Duration::from_secs(2)))
        .build();
    let mut config = unpaced_config();
    config.concurrency.extraction = 10;
    config.concurrency.structuring = 3;

    harness
        .pipeline
        .submit_batch(items, &config)
        .await
        .unwrap();

    assert_eq!(harness.structuring.max_in_flight(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_pacing_spaces_consecutive_calls() {
    let items = item_ids(4);
    let harness = HarnessBuilder::new(&items).build();
    let mut config = unpaced_config();
    config.concurrency.extraction = 1;
    config.pacing_secs.extraction = 4.0;

    harness
        .pipeline
        .submit_batch(items, &config)
        .await
        .unwrap();

    let starts: Vec<_> = harness
        .extraction
        .calls()
        .into_iter()
        .map(|(_, at)| at)
        .collect();
    assert_eq!(starts.len(), 4);
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(4));
    }
}

#[tokio::test(start_paused = true)]
async fn test_chunks_run_sequentially_with_adaptive_delay() {
    // 25 items, chunks of 20: the first chunk spends at least 20 * 4s on
    // extraction pacing, then waits min(20 * 4 + 2, 30) = 30s.
    let items = item_ids(25);
    let harness = HarnessBuilder::new(&items).build();
    let config = PipelineConfig {
        chunk_size: 20,
        ..PipelineConfig::default()
    };

    let summary = harness
        .pipeline
        .submit_batch(items.clone(), &config)
        .await
        .unwrap();
    assert_eq!(summary.processed_count, 25);

    let first = harness.extraction.call_starts(&items[0])[0];
    let last_of_first_chunk = harness.extraction.call_starts(&items[19])[0];
    let first_of_second_chunk = harness.extraction.call_starts(&items[20])[0];

    assert!(first_of_second_chunk - first >= Duration::from_secs(80));
    assert!(first_of_second_chunk - last_of_first_chunk >= Duration::from_secs(4 + 30));
}

#[tokio::test(start_paused = true)]
async fn test_no_delay_after_last_chunk() {
    let items = item_ids(2);
    let harness = HarnessBuilder::new(&items).build();
    let mut config = unpaced_config();
    config.chunk_size = 2;
    config.chunk_delay.min_secs = 60.0;
    config.chunk_delay.max_secs = 60.0;

    let started = tokio::time::Instant::now();
    harness
        .pipeline
        .submit_batch(items, &config)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_second_run_rejected_while_running() {
    let items = item_ids(3);
    let harness = HarnessBuilder::new(&items).build();
    let config = PipelineConfig::default();

    let first = harness.pipeline.submit_batch(items.clone(), &config);
    let second = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        harness
            .pipeline
            .submit_batch(vec!["other.jpg".to_string()], &config)
            .await
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap().processed_count, 3);
    assert!(matches!(
        second,
        Err(receipt_batch::pipeline::PipelineError::RunInProgress)
    ));
}
