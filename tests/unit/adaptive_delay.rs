//! Inter-chunk delay and backoff math

use receipt_batch::pipeline::config::{adaptive_chunk_delay, ChunkDelayConfig};
use receipt_batch::pipeline::{PipelineConfig, RetryPolicy};
use receipt_batch::services::ErrorClass;
use std::time::Duration;

fn bounds() -> ChunkDelayConfig {
    ChunkDelayConfig {
        min_secs: 5.0,
        max_secs: 30.0,
        safety_margin_secs: 2.0,
    }
}

#[test]
fn test_delay_scales_with_chunk_length() {
    let pacing = Duration::from_secs(2);
    // 5 * 2 + 2
    assert_eq!(adaptive_chunk_delay(5, pacing, &bounds()), Duration::from_secs(12));
}

#[test]
fn test_delay_clamped_to_bounds() {
    let pacing = Duration::from_secs(4);
    assert_eq!(adaptive_chunk_delay(20, pacing, &bounds()), Duration::from_secs(30));
    assert_eq!(
        adaptive_chunk_delay(1, Duration::ZERO, &bounds()),
        Duration::from_secs(5)
    );
}

#[test]
fn test_config_uses_extraction_pacing() {
    let mut config = PipelineConfig::default();
    config.pacing_secs.extraction = 1.0;
    config.pacing_secs.structuring = 100.0;
    // 10 * 1 + 2
    assert_eq!(config.chunk_delay_after(10), Duration::from_secs(12));
}

#[test]
fn test_retry_delays_by_class() {
    let policy = RetryPolicy {
        max_retries: 5,
        base: Duration::from_secs(10),
        max: Duration::from_secs(60),
    };

    let rate_limited: Vec<_> = (0..4)
        .map(|attempt| policy.delay_for(ErrorClass::RateLimited, attempt).unwrap())
        .collect();
    assert_eq!(
        rate_limited,
        [10, 20, 40, 60].map(Duration::from_secs).to_vec()
    );

    let transient: Vec<_> = (0..4)
        .map(|attempt| policy.delay_for(ErrorClass::Transient, attempt).unwrap())
        .collect();
    assert_eq!(transient, [10, 20, 30, 40].map(Duration::from_secs).to_vec());

    assert!(policy.delay_for(ErrorClass::Fatal, 0).is_none());
}

#[test]
fn test_partial_config_document_uses_defaults() {
    let config: PipelineConfig =
        serde_json::from_str(r#"{"chunk_size": 20, "pacing_secs": {"extraction": 3.0}}"#).unwrap();
    assert_eq!(config.chunk_size, 20);
    assert_eq!(config.pacing_secs.extraction, 3.0);
    assert_eq!(
        config.pacing_secs.structuring,
        PipelineConfig::default().pacing_secs.structuring
    );
    assert!(config.validate().is_ok());
}
