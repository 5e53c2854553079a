//! CLI error types and conversions

use crate::checkpoint::CheckpointError;
use crate::pipeline::PipelineError;
use crate::services::ServiceError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Pipeline error
    #[error("pipeline error: {0}")]
    PipelineError(#[from] PipelineError),

    /// Checkpoint error
    #[error("checkpoint error: {0}")]
    CheckpointError(#[from] CheckpointError),

    /// Service client error
    #[error("service error: {0}")]
    ServiceError(#[from] ServiceError),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}
