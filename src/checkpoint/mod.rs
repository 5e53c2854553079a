//! Durable checkpoints for stage results
//!
//! One entry per `(item_id, stage)`, written atomically and addressed by the
//! exact key. Batch manifests record which items an extraction-only run covered
//! so the run can be resumed later. The file store can also be listed,
//! summarized and pruned by age.

pub mod entry;
pub mod inventory;
pub mod manifest;
pub mod store;

pub use entry::CheckpointEntry;
pub use inventory::{CheckpointFile, CheckpointKind, CheckpointSummary, PruneReport};
pub use manifest::BatchManifest;
pub use store::{CheckpointStore, FileCheckpointStore};

/// Maximum accepted size of a persisted checkpoint or manifest (10 MB)
pub const MAX_ENTRY_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Errors related to checkpoint persistence
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Schema version mismatch
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Expected schema version
        expected: String,
        /// Found schema version
        found: String,
    },

    /// Entry file too large
    #[error("checkpoint file too large: {size} bytes (max: {max} bytes)")]
    EntryTooLarge {
        /// Actual file size
        size: u64,
        /// Maximum allowed size
        max: u64,
    },

    /// Key cannot be mapped to a checkpoint file
    #[error("invalid checkpoint key: {0}")]
    InvalidKey(String),

    /// Storage root missing or not writable
    #[error("checkpoint storage unavailable: {0}")]
    Unavailable(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Lock error
    #[error("lock error: {0}")]
    LockError(String),
}
