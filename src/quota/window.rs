//! Persisted usage counters

use super::QuotaError;
use crate::checkpoint::store::persist_atomically;
use crate::checkpoint::MAX_ENTRY_FILE_SIZE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use tracing::{debug, info};

/// Current usage document schema version
pub const USAGE_SCHEMA_VERSION: &str = "1.0.0";

/// Number of call records kept in the ring buffer
pub const RECENT_CALLS_CAPACITY: usize = 1000;

/// Bucket key of the month containing `at` (`YYYY-MM`)
pub fn month_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// Bucket key of the day containing `at` (`YYYY-MM-DD`)
pub fn day_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Bucket key of the hour containing `at` (`YYYY-MM-DD HH:00`)
pub fn hour_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:00").to_string()
}

/// One remote call as seen by the tracker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    /// When the call finished
    pub timestamp: DateTime<Utc>,
    /// Size of the submitted payload
    pub payload_size_bytes: u64,
    /// Wall-clock duration of the call
    pub duration_seconds: f64,
    /// Whether the service accepted the call
    pub success: bool,
    /// Estimated cost of the call
    pub cost_estimate: f64,
}

/// Usage counters for the current month
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageWindow {
    schema_version: String,
    /// Month the counters belong to (`YYYY-MM`)
    pub current_month: String,
    /// Successful calls this month
    pub monthly_usage: u64,
    /// Successful calls per day
    pub daily_usage: BTreeMap<String, u64>,
    /// Successful calls per hour
    pub hourly_usage: BTreeMap<String, u64>,
    /// Sum of the cost of successful calls in the ring buffer
    pub total_cost_estimate: f64,
    /// Last time the counters were reset
    pub last_reset: DateTime<Utc>,
    /// Most recent calls, oldest first
    pub recent_calls: VecDeque<UsageRecord>,
}

impl UsageWindow {
    /// Empty window for the month containing `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            schema_version: USAGE_SCHEMA_VERSION.to_string(),
            current_month: month_key(now),
            monthly_usage: 0,
            daily_usage: BTreeMap::new(),
            hourly_usage: BTreeMap::new(),
            total_cost_estimate: 0.0,
            last_reset: now,
            recent_calls: VecDeque::new(),
        }
    }

    /// Reset the counters when `now` falls in a different month.
    ///
    /// The ring buffer and cost estimate survive the reset. Returns whether a
    /// reset happened.
    pub fn roll_over_if_needed(&mut self, now: DateTime<Utc>) -> bool {
        let month = month_key(now);
        if self.current_month == month {
            return false;
        }

        info!(
            previous_month = %self.current_month,
            current_month = %month,
            "Monthly usage reset"
        );
        self.current_month = month;
        self.monthly_usage = 0;
        self.daily_usage.clear();
        self.hourly_usage.clear();
        self.last_reset = now;
        true
    }

    /// Apply one call to the counters. The caller has already rolled over.
    pub fn apply(&mut self, record: UsageRecord) {
        if record.success {
            self.monthly_usage += 1;
        }

        let day = self.daily_usage.entry(day_key(record.timestamp)).or_insert(0);
        if record.success {
            *day += 1;
        }
        let hour = self
            .hourly_usage
            .entry(hour_key(record.timestamp))
            .or_insert(0);
        if record.success {
            *hour += 1;
        }

        self.recent_calls.push_back(record);
        while self.recent_calls.len() > RECENT_CALLS_CAPACITY {
            self.recent_calls.pop_front();
        }
        self.total_cost_estimate = self.recompute_cost();
    }

    /// Successful calls in the day containing `at`
    pub fn day_usage(&self, at: DateTime<Utc>) -> u64 {
        self.daily_usage.get(&day_key(at)).copied().unwrap_or(0)
    }

    /// Successful calls in the hour containing `at`
    pub fn hour_usage(&self, at: DateTime<Utc>) -> u64 {
        self.hourly_usage.get(&hour_key(at)).copied().unwrap_or(0)
    }

    fn recompute_cost(&self) -> f64 {
        let total: f64 = self
            .recent_calls
            .iter()
            .filter(|call| call.success)
            .map(|call| call.cost_estimate)
            .sum();
        (total * 10_000.0).round() / 10_000.0
    }

    /// Persist the window atomically
    pub fn save(&self, path: &Path) -> Result<(), QuotaError> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| QuotaError::SerializationError(e.to_string()))?;
        persist_atomically(path, &json).map_err(|e| QuotaError::IoError(e.to_string()))?;
        debug!(
            path = %path.display(),
            monthly_usage = self.monthly_usage,
            "Usage window saved"
        );
        Ok(())
    }

    /// Load a window. Returns `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, QuotaError> {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(QuotaError::IoError(e.to_string())),
        };
        if metadata.len() > MAX_ENTRY_FILE_SIZE {
            return Err(QuotaError::DeserializationError(format!(
                "usage file too large: {} bytes (max: {MAX_ENTRY_FILE_SIZE} bytes)",
                metadata.len()
            )));
        }

        let contents = std::fs::read(path).map_err(|e| QuotaError::IoError(e.to_string()))?;
        let window: UsageWindow = serde_json::from_slice(&contents)
            .map_err(|e| QuotaError::DeserializationError(e.to_string()))?;
        if window.schema_version != USAGE_SCHEMA_VERSION {
            return Err(QuotaError::DeserializationError(format!(
                "schema version mismatch: expected {USAGE_SCHEMA_VERSION}, found {}",
                window.schema_version
            )));
        }
        Ok(Some(window))
    }
}
