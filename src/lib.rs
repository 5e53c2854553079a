//! # Receipt Batch Library
//!
//! A rate-limited, resumable batch pipeline that pushes large, ordered
//! collections of receipt images through two remote stages: text extraction
//! and structuring.
//!
//! ## Features
//!
//! - **Chunked execution**: items are partitioned into fixed-size chunks that run
//!   one after another with an adaptive delay in between
//! - **Per-stage policy**: each stage has its own concurrency cap, pacing delay
//!   and retry/backoff policy
//! - **Checkpoints**: every stage result is persisted per `(item, stage)` so reruns
//!   skip work that already succeeded
//! - **Resume**: an extraction-only run can be structured later without a single
//!   extra extraction call
//! - **Quota tracking**: monthly/daily/hourly usage of the extraction service with
//!   threshold warnings and a cost estimate
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use receipt_batch::checkpoint::FileCheckpointStore;
//! use receipt_batch::output::csv::CsvExporter;
//! use receipt_batch::pipeline::{Pipeline, PipelineConfig, Services};
//! use receipt_batch::quota::{QuotaLimits, QuotaTracker};
//! use receipt_batch::services::{HttpExtractionClient, HttpStructuringClient, LocalFileStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let services = Services {
//!     extraction: Arc::new(HttpExtractionClient::new("http://localhost:8001/extract", None)?),
//!     structuring: Arc::new(HttpStructuringClient::new("http://localhost:8002/structure", None)?),
//!     files: Arc::new(LocalFileStore::new("./data/receipts")),
//!     exporter: Arc::new(CsvExporter::new("./data/output")),
//! };
//! let checkpoints = Arc::new(FileCheckpointStore::open("./data/checkpoints")?);
//! let quota = Arc::new(QuotaTracker::open("./data/usage.json", QuotaLimits::default()));
//!
//! let pipeline = Pipeline::new(services, checkpoints, quota);
//! let summary = pipeline
//!     .submit_batch(vec!["receipt_001.jpg".to_string()], &PipelineConfig::default())
//!     .await?;
//! println!("{} processed, {} failed", summary.processed_count, summary.failed_count);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`checkpoint`] - Durable per-item, per-stage results and batch manifests
//! - [`quota`] - Usage window persistence and quota summaries
//! - [`pipeline`] - Stage executor, batcher, progress reporter, aggregator and engine
//! - [`services`] - Remote collaborators (extraction, structuring, file store)
//! - [`output`] - Export of completed records
//! - [`cancel`] - Cooperative cancellation

#![warn(missing_docs)]
#![warn(clippy::all)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Cooperative cancellation shared across tasks
pub mod cancel;

/// Durable checkpoint storage
pub mod checkpoint;

/// CLI command implementations
pub mod cli;

/// Metrics emission and Prometheus exporter
pub mod metrics;

/// Export of completed records
pub mod output;

/// Batch orchestration
pub mod pipeline;

/// External service usage tracking
pub mod quota;

/// Remote collaborators
pub mod services;

/// One of the two ordered phases every item goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Text extraction (OCR)
    Extraction,
    /// Structuring of the extracted text into a record
    Structuring,
}

impl Stage {
    /// Lowercase name used in paths, logs and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Structuring => "structuring",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "extraction" | "ocr" => Ok(Stage::Extraction),
            "structuring" | "ai" => Ok(Stage::Structuring),
            _ => Err(format!(
                "Invalid stage: {s}. Valid options: extraction, structuring"
            )),
        }
    }
}

/// Result of one stage for one item
///
/// At most one result is current per `(item_id, stage)`; a newer result
/// supersedes the previous one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageResult {
    /// Item identifier (e.g. the uploaded file name)
    pub item_id: String,
    /// Stage that produced this result
    pub stage: Stage,
    /// Serialized stage output (absent on failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// When the result was produced
    pub produced_at: DateTime<Utc>,
    /// Whether the stage succeeded
    pub success: bool,
    /// Error message for failed results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StageResult {
    /// Build a successful result
    pub fn succeeded(item_id: impl Into<String>, stage: Stage, payload: serde_json::Value) -> Self {
        Self {
            item_id: item_id.into(),
            stage,
            payload: Some(payload),
            produced_at: Utc::now(),
            success: true,
            error_message: None,
        }
    }

    /// Build a failed result
    pub fn failed(item_id: impl Into<String>, stage: Stage, error: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            stage,
            payload: None,
            produced_at: Utc::now(),
            success: false,
            error_message: Some(error.into()),
        }
    }
}

/// Output of the extraction stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedText {
    /// Full extracted text
    pub text: String,
    /// Service-reported confidence in `[0, 1]`
    #[serde(default)]
    pub confidence: f64,
    /// Word-level detail, passed through untouched
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<serde_json::Value>,
}

impl ExtractedText {
    /// Validate the extraction payload
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!(
                "Confidence must be within [0, 1], got {}",
                self.confidence
            ));
        }
        Ok(())
    }
}

/// Extra context handed to the structuring service alongside the text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StructuringHints {
    /// Source item (the record's `source_image`)
    pub item_id: String,
    /// Confidence reported by extraction
    pub confidence: f64,
}

/// A completed, structured record ready for export
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StructuredRecord {
    /// Source item
    pub item_id: String,
    /// Opaque record returned by the structuring service
    pub record: serde_json::Value,
}
