//! Pipeline configuration, retry policy and backoff math

use super::PipelineError;
use crate::quota::QuotaLimits;
use crate::services::ErrorClass;
use crate::Stage;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Items per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// Retries after the first attempt
pub const DEFAULT_RETRY_COUNT: u32 = 2;

/// Base backoff delay in seconds.
/// Rate-limit windows of the extraction service are measured in tens of seconds.
pub const DEFAULT_BACKOFF_BASE_SECS: f64 = 10.0;

/// Maximum backoff delay in seconds
pub const DEFAULT_BACKOFF_MAX_SECS: f64 = 60.0;

/// The extraction service accepts 20 requests/minute on the free tier, so one
/// call in flight at a time with 4s pacing stays under it with headroom.
pub const DEFAULT_EXTRACTION_CONCURRENCY: usize = 1;
/// Pacing after each extraction call in seconds
pub const DEFAULT_EXTRACTION_PACING_SECS: f64 = 4.0;

/// Concurrent structuring calls
pub const DEFAULT_STRUCTURING_CONCURRENCY: usize = 5;
/// Pacing after each structuring call in seconds
pub const DEFAULT_STRUCTURING_PACING_SECS: f64 = 1.0;

/// Inter-chunk delay bounds and margin in seconds
pub const DEFAULT_CHUNK_DELAY_MIN_SECS: f64 = 5.0;
/// Upper bound of the inter-chunk delay
pub const DEFAULT_CHUNK_DELAY_MAX_SECS: f64 = 30.0;
/// Margin added to the pacing-derived inter-chunk delay
pub const DEFAULT_CHUNK_DELAY_SAFETY_SECS: f64 = 2.0;

/// Convert a validated, non-negative number of seconds
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Concurrency cap per stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConcurrency {
    /// Extraction calls in flight
    pub extraction: usize,
    /// Structuring calls in flight
    pub structuring: usize,
}

impl Default for StageConcurrency {
    fn default() -> Self {
        Self {
            extraction: DEFAULT_EXTRACTION_CONCURRENCY,
            structuring: DEFAULT_STRUCTURING_CONCURRENCY,
        }
    }
}

/// Pacing delay per stage in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagePacing {
    /// Delay after each extraction call
    pub extraction: f64,
    /// Delay after each structuring call
    pub structuring: f64,
}

impl Default for StagePacing {
    fn default() -> Self {
        Self {
            extraction: DEFAULT_EXTRACTION_PACING_SECS,
            structuring: DEFAULT_STRUCTURING_PACING_SECS,
        }
    }
}

/// Inter-chunk delay bounds in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkDelayConfig {
    /// Lower bound
    pub min_secs: f64,
    /// Upper bound
    pub max_secs: f64,
    /// Margin added to the pacing-derived delay
    pub safety_margin_secs: f64,
}

impl Default for ChunkDelayConfig {
    fn default() -> Self {
        Self {
            min_secs: DEFAULT_CHUNK_DELAY_MIN_SECS,
            max_secs: DEFAULT_CHUNK_DELAY_MAX_SECS,
            safety_margin_secs: DEFAULT_CHUNK_DELAY_SAFETY_SECS,
        }
    }
}

/// Configuration of one pipeline run
///
/// Every field has a default, so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrency cap per stage
    pub concurrency: StageConcurrency,
    /// Pacing delay per stage
    pub pacing_secs: StagePacing,
    /// Items per chunk
    pub chunk_size: usize,
    /// Retries after the first attempt
    pub retry_count: u32,
    /// Base backoff delay
    pub backoff_base_secs: f64,
    /// Backoff cap
    pub backoff_max_secs: f64,
    /// Inter-chunk delay bounds
    pub chunk_delay: ChunkDelayConfig,
    /// Monthly extraction call allowance
    pub monthly_quota: u64,
    /// Extraction requests per minute
    pub rate_limit_per_minute: u64,
    /// Monthly usage percentage that triggers a warning
    pub warn_threshold_percent: f64,
    /// Cost estimate per successful extraction call
    pub cost_per_call: f64,
    /// Delete an item's file once it completed
    pub auto_delete_on_success: bool,
    /// Keep failed items' files after the run
    pub keep_failed_items: bool,
    /// Drop the extraction checkpoint of items whose structuring failed
    pub invalidate_extraction_on_structuring_failure: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let limits = QuotaLimits::default();
        Self {
            concurrency: StageConcurrency::default(),
            pacing_secs: StagePacing::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_count: DEFAULT_RETRY_COUNT,
            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            chunk_delay: ChunkDelayConfig::default(),
            monthly_quota: limits.monthly_limit,
            rate_limit_per_minute: limits.rate_limit_per_minute,
            warn_threshold_percent: limits.warn_threshold_percent,
            cost_per_call: limits.cost_per_call,
            auto_delete_on_success: true,
            keep_failed_items: true,
            invalidate_extraction_on_structuring_failure: false,
        }
    }
}

impl PipelineConfig {
    /// Reject configurations that cannot run
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::InvalidConfig(msg));

        if self.concurrency.extraction == 0 || self.concurrency.structuring == 0 {
            return invalid("concurrency must be at least 1 for every stage".to_string());
        }
        if self.chunk_size == 0 {
            return invalid("chunk_size must be at least 1".to_string());
        }

        let durations = [
            ("pacing_secs.extraction", self.pacing_secs.extraction),
            ("pacing_secs.structuring", self.pacing_secs.structuring),
            ("backoff_base_secs", self.backoff_base_secs),
            ("backoff_max_secs", self.backoff_max_secs),
            ("chunk_delay.min_secs", self.chunk_delay.min_secs),
            ("chunk_delay.max_secs", self.chunk_delay.max_secs),
            ("chunk_delay.safety_margin_secs", self.chunk_delay.safety_margin_secs),
        ];
        for (name, value) in durations {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("{name} must be a non-negative number, got {value}"));
            }
        }

        if self.chunk_delay.min_secs > self.chunk_delay.max_secs {
            return invalid(format!(
                "chunk_delay.min_secs ({}) exceeds chunk_delay.max_secs ({})",
                self.chunk_delay.min_secs, self.chunk_delay.max_secs
            ));
        }
        if self.backoff_base_secs > self.backoff_max_secs {
            return invalid(format!(
                "backoff_base_secs ({}) exceeds backoff_max_secs ({})",
                self.backoff_base_secs, self.backoff_max_secs
            ));
        }
        if !(0.0..=100.0).contains(&self.warn_threshold_percent) {
            return invalid(format!(
                "warn_threshold_percent must be within [0, 100], got {}",
                self.warn_threshold_percent
            ));
        }
        if !self.cost_per_call.is_finite() || self.cost_per_call < 0.0 {
            return invalid(format!(
                "cost_per_call must be a non-negative number, got {}",
                self.cost_per_call
            ));
        }
        Ok(())
    }

    /// Retry policy shared by both stages
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_count,
            base: secs(self.backoff_base_secs),
            max: secs(self.backoff_max_secs),
        }
    }

    /// Concurrency, pacing and retry policy of one stage
    pub fn stage_policy(&self, stage: Stage) -> StagePolicy {
        let (concurrency, pacing) = match stage {
            Stage::Extraction => (self.concurrency.extraction, self.pacing_secs.extraction),
            Stage::Structuring => (self.concurrency.structuring, self.pacing_secs.structuring),
        };
        StagePolicy {
            concurrency,
            pacing: secs(pacing),
            retry: self.retry_policy(),
        }
    }

    /// Delay inserted after a chunk of `chunk_len` items
    pub fn chunk_delay_after(&self, chunk_len: usize) -> Duration {
        adaptive_chunk_delay(
            chunk_len,
            secs(self.pacing_secs.extraction),
            &self.chunk_delay,
        )
    }

    /// Quota limits carried by this config
    pub fn quota_limits(&self) -> QuotaLimits {
        QuotaLimits {
            monthly_limit: self.monthly_quota,
            rate_limit_per_minute: self.rate_limit_per_minute,
            warn_threshold_percent: self.warn_threshold_percent,
            cost_per_call: self.cost_per_call,
        }
    }
}

/// Inter-chunk delay: `max(min, min(chunk_len * pacing + safety, max))`
pub fn adaptive_chunk_delay(
    chunk_len: usize,
    pacing: Duration,
    bounds: &ChunkDelayConfig,
) -> Duration {
    let raw = chunk_len as f64 * pacing.as_secs_f64() + bounds.safety_margin_secs;
    let delay = raw.min(bounds.max_secs).max(bounds.min_secs);
    secs(delay)
}

/// Bounded retry with class-dependent backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base delay
    pub base: Duration,
    /// Delay cap
    pub max: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (zero-based) after an error of `class`.
    ///
    /// Rate limits back off exponentially, transient errors linearly; both are
    /// capped at `max`. Fatal errors are never retried.
    pub fn delay_for(&self, class: ErrorClass, attempt: u32) -> Option<Duration> {
        let base = self.base.as_secs_f64();
        let delay = match class {
            ErrorClass::Fatal => return None,
            ErrorClass::RateLimited => base * 2f64.powi(attempt.min(62) as i32),
            ErrorClass::Transient => base * f64::from(attempt.saturating_add(1)),
        };
        Some(secs(delay.min(self.max.as_secs_f64())))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        PipelineConfig::default().retry_policy()
    }
}

/// Execution policy of one stage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StagePolicy {
    /// Calls in flight at once
    pub concurrency: usize,
    /// Delay after each call before its slot is released
    pub pacing: Duration,
    /// Retry policy
    pub retry: RetryPolicy,
}
