//! Quota tracker: records calls, persists the window, summarizes usage

use super::window::{day_key, UsageRecord, UsageWindow};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Free-tier monthly call allowance of the extraction service
pub const DEFAULT_MONTHLY_LIMIT: u64 = 5000;

/// Requests per minute accepted by the extraction service
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u64 = 20;

/// Monthly usage percentage that triggers a warning
pub const DEFAULT_WARN_THRESHOLD_PERCENT: f64 = 80.0;

/// Estimated cost of one successful call
pub const DEFAULT_COST_PER_CALL: f64 = 0.001;

/// Limits and pricing applied by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaLimits {
    /// Monthly call allowance
    pub monthly_limit: u64,
    /// Requests per minute
    pub rate_limit_per_minute: u64,
    /// Warning threshold in percent of `monthly_limit`
    pub warn_threshold_percent: f64,
    /// Cost estimate per successful call
    pub cost_per_call: f64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            monthly_limit: DEFAULT_MONTHLY_LIMIT,
            rate_limit_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
            warn_threshold_percent: DEFAULT_WARN_THRESHOLD_PERCENT,
            cost_per_call: DEFAULT_COST_PER_CALL,
        }
    }
}

/// Point-in-time view of quota consumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    /// Month the counters belong to
    pub current_month: String,
    /// Successful calls this month
    pub month_to_date: u64,
    /// Monthly allowance
    pub monthly_limit: u64,
    /// Calls left this month
    pub remaining: u64,
    /// Month-to-date usage in percent of the allowance, one decimal
    pub percentage: f64,
    /// Successful calls today
    pub today: u64,
    /// Successful calls this hour
    pub current_hour: u64,
    /// Requests per minute
    pub rate_limit_per_minute: u64,
    /// Cost estimate of recent successful calls
    pub total_cost_estimate: f64,
    /// Last counter reset
    pub last_reset: DateTime<Utc>,
    /// Threshold warnings, empty when usage is healthy
    pub warnings: Vec<String>,
}

/// Per-day usage entry returned by [`QuotaTracker::daily_history`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyUsage {
    /// Day key (`YYYY-MM-DD`)
    pub date: String,
    /// Successful calls that day
    pub usage: u64,
}

/// Records remote calls and reports quota consumption
///
/// The window lives behind a mutex so concurrent tasks can record calls. Every
/// read and write first rolls the window over when the month changed. Saves
/// happen on a snapshot after the window lock is released; a snapshot older
/// than the last one written is dropped.
#[derive(Debug)]
pub struct QuotaTracker {
    path: Option<PathBuf>,
    limits: Mutex<QuotaLimits>,
    window: Mutex<UsageWindow>,
    revision: AtomicU64,
    saved_revision: Mutex<u64>,
}

impl QuotaTracker {
    /// Open a tracker persisted at `path`.
    ///
    /// A missing file starts a fresh window. An unreadable or corrupt file is
    /// logged and replaced by a fresh window on the next save.
    pub fn open<P: Into<PathBuf>>(path: P, limits: QuotaLimits) -> Self {
        let path = path.into();
        let now = Utc::now();
        let window = match UsageWindow::load(&path) {
            Ok(Some(window)) => window,
            Ok(None) => UsageWindow::new(now),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to load usage window, starting fresh"
                );
                UsageWindow::new(now)
            }
        };

        debug!(
            path = %path.display(),
            month = %window.current_month,
            monthly_usage = window.monthly_usage,
            "Opened quota tracker"
        );

        Self {
            path: Some(path),
            limits: Mutex::new(limits),
            window: Mutex::new(window),
            revision: AtomicU64::new(0),
            saved_revision: Mutex::new(0),
        }
    }

    /// Tracker that never touches disk
    pub fn in_memory(limits: QuotaLimits) -> Self {
        Self::with_window(UsageWindow::new(Utc::now()), limits)
    }

    /// In-memory tracker seeded with an existing window
    pub fn with_window(window: UsageWindow, limits: QuotaLimits) -> Self {
        Self {
            path: None,
            limits: Mutex::new(limits),
            window: Mutex::new(window),
            revision: AtomicU64::new(0),
            saved_revision: Mutex::new(0),
        }
    }

    /// Backing file, if persisted
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current limits
    pub fn limits(&self) -> QuotaLimits {
        *lock(&self.limits)
    }

    /// Replace the limits used for summaries and cost estimates
    pub fn set_limits(&self, limits: QuotaLimits) {
        *lock(&self.limits) = limits;
    }

    /// Record one remote-call attempt finishing now
    pub fn record_call(&self, payload_size_bytes: u64, duration: Duration, success: bool) {
        self.record_call_at(Utc::now(), payload_size_bytes, duration, success);
    }

    /// Record one remote-call attempt that finished at `now`
    pub fn record_call_at(
        &self,
        now: DateTime<Utc>,
        payload_size_bytes: u64,
        duration: Duration,
        success: bool,
    ) {
        let limits = self.limits();
        let mut window = lock(&self.window);
        window.roll_over_if_needed(now);

        let before = window.monthly_usage;
        window.apply(UsageRecord {
            timestamp: now,
            payload_size_bytes,
            duration_seconds: (duration.as_secs_f64() * 100.0).round() / 100.0,
            success,
            cost_estimate: limits.cost_per_call,
        });
        let month_to_date = window.monthly_usage;
        let hour_usage = window.hour_usage(now);
        let snapshot = self.path.as_ref().map(|_| {
            let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
            (revision, window.clone())
        });
        drop(window);

        if let (Some(path), Some((revision, snapshot))) = (&self.path, snapshot) {
            self.persist(path, revision, &snapshot);
        }

        crate::metrics::record_quota_usage(month_to_date, limits.monthly_limit);

        if before < limits.monthly_limit && month_to_date >= limits.monthly_limit {
            warn!(
                month_to_date = month_to_date,
                monthly_limit = limits.monthly_limit,
                "Monthly quota exceeded"
            );
        } else if crossed_threshold(before, month_to_date, &limits) {
            warn!(
                month_to_date = month_to_date,
                monthly_limit = limits.monthly_limit,
                threshold_percent = limits.warn_threshold_percent,
                "Monthly quota warning threshold reached"
            );
        }
        if success && hour_usage == hourly_limit(&limits) {
            warn!(
                current_hour = hour_usage,
                "Hourly request limit reached"
            );
        }
    }

    fn persist(&self, path: &Path, revision: u64, snapshot: &UsageWindow) {
        let mut saved = lock(&self.saved_revision);
        if revision <= *saved {
            return;
        }
        match snapshot.save(path) {
            Ok(()) => *saved = revision,
            Err(e) => error!(path = %path.display(), error = %e, "Failed to persist usage window"),
        }
    }

    /// Usage summary as of now
    pub fn summarize(&self) -> UsageSummary {
        self.summarize_at(Utc::now())
    }

    /// Usage summary as of `now`
    pub fn summarize_at(&self, now: DateTime<Utc>) -> UsageSummary {
        let limits = self.limits();
        let mut window = lock(&self.window);
        window.roll_over_if_needed(now);

        let month_to_date = window.monthly_usage;
        let current_hour = window.hour_usage(now);
        let percentage = if limits.monthly_limit == 0 {
            100.0
        } else {
            ((month_to_date as f64 / limits.monthly_limit as f64) * 1000.0).round() / 10.0
        };

        UsageSummary {
            current_month: window.current_month.clone(),
            month_to_date,
            monthly_limit: limits.monthly_limit,
            remaining: limits.monthly_limit.saturating_sub(month_to_date),
            percentage,
            today: window.day_usage(now),
            current_hour,
            rate_limit_per_minute: limits.rate_limit_per_minute,
            total_cost_estimate: window.total_cost_estimate,
            last_reset: window.last_reset,
            warnings: warnings_for(month_to_date, current_hour, &limits),
        }
    }

    /// Successful calls per day for the last `days` days, oldest first
    pub fn daily_history(&self, days: u32) -> Vec<DailyUsage> {
        self.daily_history_at(Utc::now(), days)
    }

    /// Same as [`daily_history`](Self::daily_history) relative to `now`
    pub fn daily_history_at(&self, now: DateTime<Utc>, days: u32) -> Vec<DailyUsage> {
        let mut window = lock(&self.window);
        window.roll_over_if_needed(now);

        (0..days)
            .rev()
            .map(|offset| {
                let day = now - ChronoDuration::days(i64::from(offset));
                DailyUsage {
                    date: day_key(day),
                    usage: window.day_usage(day),
                }
            })
            .collect()
    }

    /// The last `limit` recorded calls, oldest first
    pub fn recent_calls(&self, limit: usize) -> Vec<UsageRecord> {
        let window = lock(&self.window);
        let skip = window.recent_calls.len().saturating_sub(limit);
        window.recent_calls.iter().skip(skip).cloned().collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // A panic while holding the lock leaves plain counters behind; keep using them.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn hourly_limit(limits: &QuotaLimits) -> u64 {
    limits.rate_limit_per_minute * 60
}

fn threshold_count(limits: &QuotaLimits) -> f64 {
    limits.monthly_limit as f64 * limits.warn_threshold_percent / 100.0
}

fn crossed_threshold(before: u64, after: u64, limits: &QuotaLimits) -> bool {
    let threshold = threshold_count(limits);
    (before as f64) < threshold && (after as f64) >= threshold
}

fn warnings_for(month_to_date: u64, current_hour: u64, limits: &QuotaLimits) -> Vec<String> {
    let mut warnings = Vec::new();

    if month_to_date >= limits.monthly_limit {
        warnings.push(format!(
            "Monthly quota reached ({}/{})",
            month_to_date, limits.monthly_limit
        ));
    } else if month_to_date as f64 >= threshold_count(limits) {
        warnings.push(format!(
            "Monthly usage at {}% threshold ({}/{})",
            limits.warn_threshold_percent, month_to_date, limits.monthly_limit
        ));
    }

    if current_hour >= hourly_limit(limits) {
        warnings.push(format!(
            "Hourly request limit reached ({current_hour}/{})",
            hourly_limit(limits)
        ));
    }

    warnings
}
