//! Remote collaborators consumed by the pipeline
//!
//! Every remote outcome is normalised into `Result<T, ServiceError>` at this
//! boundary. The error variant decides the retry policy: rate limits back off
//! exponentially, transient failures linearly, fatal errors are not retried.

pub mod file_store;
pub mod http;

pub use file_store::LocalFileStore;
pub use http::{HttpExtractionClient, HttpStructuringClient};

use crate::{ExtractedText, StructuringHints};
use async_trait::async_trait;

/// Retry classification of a failed remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Service asked the caller to slow down
    RateLimited,
    /// Failure that may succeed on a later attempt
    Transient,
    /// Failure that will not succeed on retry
    Fatal,
}

impl ErrorClass {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }

    /// Whether another attempt may be made
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

/// Failure reported by a remote service
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    /// Rate limit hit (HTTP 429 or equivalent)
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Timeouts, connection failures, 5xx responses
    #[error("transient error: {0}")]
    Transient(String),

    /// Invalid input, authentication failures, unusable responses
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl ServiceError {
    /// Retry classification
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited(_) => ErrorClass::RateLimited,
            Self::Transient(_) => ErrorClass::Transient,
            Self::Fatal(_) => ErrorClass::Fatal,
        }
    }

    /// Message without the classification prefix
    pub fn message(&self) -> &str {
        match self {
            Self::RateLimited(msg) | Self::Transient(msg) | Self::Fatal(msg) => msg,
        }
    }
}

/// Text extraction (OCR) capability
#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Extract the text of one image
    async fn extract_text(&self, image: &[u8]) -> Result<ExtractedText, ServiceError>;
}

/// Structuring capability turning extracted text into a record
#[async_trait]
pub trait StructuringService: Send + Sync {
    /// Structure extracted text into an opaque record
    async fn structure(
        &self,
        text: &ExtractedText,
        hints: &StructuringHints,
    ) -> Result<serde_json::Value, ServiceError>;
}

/// Source of item contents
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Read the bytes of an item
    async fn read(&self, item_id: &str) -> std::io::Result<Vec<u8>>;

    /// Delete an item
    async fn delete(&self, item_id: &str) -> std::io::Result<()>;
}
