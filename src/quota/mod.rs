//! Usage tracking for the rate-limited extraction service
//!
//! A [`UsageWindow`] holds month/day/hour counters plus a bounded ring of
//! recent call records. [`QuotaTracker`] guards the window with a mutex,
//! persists it after every recorded call and derives [`UsageSummary`]s with
//! threshold warnings.

pub mod tracker;
pub mod window;

pub use tracker::{DailyUsage, QuotaLimits, QuotaTracker, UsageSummary};
pub use window::{UsageRecord, UsageWindow};

/// Errors related to usage persistence
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error (also covers unknown schema versions)
    #[error("deserialization error: {0}")]
    DeserializationError(String),
}
