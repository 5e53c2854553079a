//! Batch orchestration
//!
//! The pipeline pushes an ordered list of items through extraction and
//! structuring:
//!
//! 1. **Chunking**: [`batcher::Batcher`] partitions the items into fixed-size
//!    chunks that run one after another with an adaptive delay in between
//! 2. **Execution**: [`executor::StageExecutor`] runs one stage per item under
//!    a concurrency cap, a pacing delay and a retry policy, consulting the
//!    checkpoint store before every remote call
//! 3. **Progress**: [`progress::ProgressReporter`] exposes counters that can be
//!    polled while a run is in flight
//! 4. **Aggregation**: [`aggregator::ResultAggregator`] collects outcomes in
//!    submission order, exports completed records and applies file retention
//!
//! [`engine::Pipeline`] ties the pieces together and exposes the public
//! operations.
//!
//! # Error Handling
//!
//! Per-item failures never abort a run; they are reported in the
//! [`aggregator::RunSummary`]. Only problems detected before any item is
//! processed (empty batch, invalid config, unreachable checkpoint storage)
//! surface as [`PipelineError`].

pub mod aggregator;
pub mod batcher;
pub mod config;
pub mod engine;
pub mod executor;
pub mod item;
pub mod progress;

pub use aggregator::{FailureReport, ItemReport, ResultAggregator, RunSummary};
pub use batcher::{Batcher, Chunk};
pub use config::{PipelineConfig, RetryPolicy, StagePolicy};
pub use engine::{ExtractionRun, Pipeline, Services};
pub use executor::{FailureKind, StageCall, StageExecutor, StageFailure, StageOutcome};
pub use item::ItemState;
pub use progress::{ProgressReporter, ProgressSnapshot};

use crate::checkpoint::CheckpointError;

/// Pipeline errors
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Configuration rejected before processing
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No items submitted
    #[error("batch contains no items")]
    EmptyBatch,

    /// The same item id was submitted twice
    #[error("duplicate item id in batch: {0}")]
    DuplicateItem(String),

    /// Unknown batch id on resume
    #[error("batch not found: {0}")]
    BatchNotFound(String),

    /// Another run is executing on this pipeline
    #[error("a run is already in progress")]
    RunInProgress,

    /// Illegal item state transition
    #[error("invalid state transition for {item_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Item whose state was advanced
        item_id: String,
        /// Current state
        from: ItemState,
        /// Requested state
        to: ItemState,
    },

    /// Checkpoint storage error
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}
