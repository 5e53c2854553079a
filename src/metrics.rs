//! Pipeline observability metrics
//!
//! Counters and histograms for remote stage calls, retries, checkpoint reuse
//! and quota consumption, exposed through an optional Prometheus scrape
//! endpoint.
//!
//! ## Architecture
//!
//! - Uses the `metrics` crate facade; without an installed recorder every call
//!   is a no-op
//! - [`init_metrics`] installs the Prometheus exporter (`--metrics-addr`)

use crate::pipeline::FailureKind;
use crate::services::ErrorClass;
use crate::Stage;
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Global metrics registry initialization flag
static METRICS_INITIALIZED: Lazy<Arc<RwLock<bool>>> = Lazy::new(|| Arc::new(RwLock::new(false)));

/// Initialize metrics system with Prometheus exporter
///
/// Idempotent: later calls return `Ok(())` without rebinding.
///
/// # Arguments
/// * `addr` - Socket address of the scrape endpoint (e.g., "0.0.0.0:9090")
pub async fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut initialized = METRICS_INITIALIZED.write().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!("Initializing metrics system on {}", addr);

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        "stage_calls_total",
        Unit::Count,
        "Remote stage call attempts by stage and outcome"
    );
    describe_histogram!(
        "stage_call_duration_seconds",
        Unit::Seconds,
        "Duration of remote stage calls"
    );
    describe_counter!(
        "stage_retries_total",
        Unit::Count,
        "Retries scheduled after a failed stage call"
    );
    describe_histogram!(
        "retry_backoff_duration_seconds",
        Unit::Seconds,
        "Wait before a retried stage call"
    );
    describe_counter!(
        "checkpoint_hits_total",
        Unit::Count,
        "Stage results served from checkpoints"
    );
    describe_counter!(
        "checkpoint_write_failures_total",
        Unit::Count,
        "Stage results that could not be checkpointed"
    );
    describe_gauge!(
        "quota_month_to_date",
        Unit::Count,
        "Successful extraction calls this month"
    );
    describe_gauge!(
        "quota_monthly_limit",
        Unit::Count,
        "Monthly extraction call allowance"
    );
    describe_counter!("runs_completed_total", Unit::Count, "Finished runs by mode");
    describe_counter!(
        "items_failed_total",
        Unit::Count,
        "Items that ended in a failure state"
    );

    *initialized = true;
    info!("Metrics system initialized successfully on {}", addr);
    Ok(())
}

/// Check if metrics system is initialized
pub async fn is_initialized() -> bool {
    *METRICS_INITIALIZED.read().await
}

/// Timing and outcome of one remote stage call
pub struct StageCallMetrics {
    stage: Stage,
    attempt: u32,
    start_time: Instant,
}

impl StageCallMetrics {
    /// Start timing an attempt
    pub fn start(stage: Stage, attempt: u32) -> Self {
        debug!(stage = %stage, attempt = attempt, "Stage call started");
        Self {
            stage,
            attempt,
            start_time: Instant::now(),
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        self.record("success");
    }

    /// Record a failed call
    pub fn record_failure(&self, class: ErrorClass) {
        self.record(class.as_str());
    }

    fn record(&self, outcome: &'static str) {
        let duration = self.start_time.elapsed();

        counter!(
            "stage_calls_total",
            "stage" => self.stage.as_str(),
            "outcome" => outcome,
            "attempt" => self.attempt.to_string(),
        )
        .increment(1);

        histogram!(
            "stage_call_duration_seconds",
            "stage" => self.stage.as_str(),
        )
        .record(duration.as_secs_f64());
    }
}

/// Record retry backoff duration
pub fn record_retry_backoff(stage: Stage, duration: Duration, attempt: u32) {
    counter!(
        "stage_retries_total",
        "stage" => stage.as_str(),
        "attempt" => attempt.to_string(),
    )
    .increment(1);

    histogram!(
        "retry_backoff_duration_seconds",
        "stage" => stage.as_str(),
    )
    .record(duration.as_secs_f64());

    debug!(
        stage = %stage,
        attempt = attempt,
        backoff_ms = duration.as_millis() as u64,
        "Retry backoff recorded"
    );
}

/// Record a stage result served from a checkpoint
pub fn record_cache_hit(stage: Stage) {
    counter!("checkpoint_hits_total", "stage" => stage.as_str()).increment(1);
}

/// Record a stage result that could not be checkpointed
pub fn record_checkpoint_write_failure(stage: Stage) {
    counter!("checkpoint_write_failures_total", "stage" => stage.as_str()).increment(1);
}

/// Publish month-to-date quota consumption
pub fn record_quota_usage(month_to_date: u64, monthly_limit: u64) {
    gauge!("quota_month_to_date").set(month_to_date as f64);
    gauge!("quota_monthly_limit").set(monthly_limit as f64);
}

/// Record an item ending in a failure state
pub fn record_item_failed(stage: Stage, kind: FailureKind) {
    counter!(
        "items_failed_total",
        "stage" => stage.as_str(),
        "kind" => kind.as_str(),
    )
    .increment(1);
}

/// Run-level metrics
pub struct RunMetrics {
    mode: &'static str,
    batch_id: String,
    start_time: Instant,
}

impl RunMetrics {
    /// Start tracking a run
    pub fn start(mode: &'static str, batch_id: &str, items: usize) -> Self {
        info!(mode = mode, batch_id = %batch_id, items = items, "Run metrics started");
        Self {
            mode,
            batch_id: batch_id.to_string(),
            start_time: Instant::now(),
        }
    }

    /// Record the end of the run
    pub fn record_finish(&self, processed: usize, failed: usize) {
        counter!("runs_completed_total", "mode" => self.mode).increment(1);
        debug!(
            mode = self.mode,
            batch_id = %self.batch_id,
            processed = processed,
            failed = failed,
            duration_secs = self.start_time.elapsed().as_secs(),
            "Run metrics recorded"
        );
    }
}
