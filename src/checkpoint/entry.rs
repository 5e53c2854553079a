//! Persisted form of a stage result

use super::CheckpointError;
use crate::{Stage, StageResult};
use serde::{Deserialize, Serialize};

/// Current checkpoint entry schema version
pub const SCHEMA_VERSION: &str = "1.0.0";

/// A checkpoint entry: one [`StageResult`] plus bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointEntry {
    schema_version: String,
    #[serde(flatten)]
    result: StageResult,
    #[serde(default)]
    attempts: u32,
}

impl CheckpointEntry {
    /// Wrap a stage result produced after `attempts` remote calls
    pub fn new(result: StageResult, attempts: u32) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            result,
            attempts,
        }
    }

    /// Item the entry belongs to
    pub fn item_id(&self) -> &str {
        &self.result.item_id
    }

    /// Stage the entry belongs to
    pub fn stage(&self) -> Stage {
        self.result.stage
    }

    /// Whether the stage succeeded
    pub fn is_success(&self) -> bool {
        self.result.success
    }

    /// Stored payload (successful entries only)
    pub fn payload(&self) -> Option<&serde_json::Value> {
        self.result.payload.as_ref()
    }

    /// Number of remote attempts that produced this entry
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The wrapped stage result
    pub fn result(&self) -> &StageResult {
        &self.result
    }

    /// Consume the entry, returning the stage result
    pub fn into_result(self) -> StageResult {
        self.result
    }

    /// Decode the payload into a typed stage output
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, CheckpointError> {
        let payload = self.result.payload.clone().ok_or_else(|| {
            CheckpointError::DeserializationError(format!(
                "entry for {}/{} has no payload",
                self.result.item_id, self.result.stage
            ))
        })?;
        serde_json::from_value(payload)
            .map_err(|e| CheckpointError::DeserializationError(e.to_string()))
    }

    /// Validate schema version (accepts current version only)
    pub fn validate_schema_version(&self) -> Result<(), CheckpointError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(CheckpointError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION.to_string(),
                found: self.schema_version.clone(),
            });
        }
        Ok(())
    }
}
