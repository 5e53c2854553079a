//! Batch manifests for resumable runs

use super::CheckpointError;
use crate::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current manifest schema version
pub const MANIFEST_SCHEMA_VERSION: &str = "1.0.0";

/// Items covered by a run whose stage results are checkpointed
///
/// Written by an extraction-only submission; its `batch_id` is the handle a
/// later resume uses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchManifest {
    schema_version: String,
    batch_id: String,
    item_ids: Vec<String>,
    completed_stage: Stage,
    created_at: DateTime<Utc>,
}

impl BatchManifest {
    /// Create a manifest with a fresh batch id
    pub fn new(item_ids: Vec<String>, completed_stage: Stage) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            batch_id: uuid::Uuid::new_v4().to_string(),
            item_ids,
            completed_stage,
            created_at: Utc::now(),
        }
    }

    /// Batch identifier
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Items in submission order
    pub fn item_ids(&self) -> &[String] {
        &self.item_ids
    }

    /// Last stage the batch ran
    pub fn completed_stage(&self) -> Stage {
        self.completed_stage
    }

    /// Creation timestamp
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Validate schema version (accepts current version only)
    pub fn validate_schema_version(&self) -> Result<(), CheckpointError> {
        if self.schema_version != MANIFEST_SCHEMA_VERSION {
            return Err(CheckpointError::SchemaVersionMismatch {
                expected: MANIFEST_SCHEMA_VERSION.to_string(),
                found: self.schema_version.clone(),
            });
        }
        Ok(())
    }
}
