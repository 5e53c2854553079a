//! Export of completed records

use crate::StructuredRecord;
use std::path::PathBuf;

pub mod csv;

/// Export errors
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// CSV write error
    #[error("CSV error: {0}")]
    CsvError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// Receives the completed records of a run, once per run
pub trait Exporter: Send + Sync {
    /// Write `records` (in submission order) and return the artifact locations
    fn export(&self, batch_id: &str, records: &[StructuredRecord]) -> OutputResult<Vec<PathBuf>>;
}
