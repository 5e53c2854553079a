//! Per-item state machine

use super::PipelineError;
use serde::{Deserialize, Serialize};

/// Lifecycle of one item through both stages
///
/// ```text
/// Pending -> Extracting -> Extracted -> Structuring -> Completed
///                      \-> ExtractFailed           \-> StructureFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Not started
    #[default]
    Pending,
    /// Extraction in progress
    Extracting,
    /// Extraction finished, structuring not started
    Extracted,
    /// Extraction failed (terminal)
    ExtractFailed,
    /// Structuring in progress
    Structuring,
    /// Both stages succeeded (terminal)
    Completed,
    /// Structuring failed (terminal)
    StructureFailed,
}

impl ItemState {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::ExtractFailed | Self::StructureFailed
        )
    }

    /// Whether the item ended in a failure state
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::ExtractFailed | Self::StructureFailed)
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_advance_to(&self, next: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, next),
            (Pending, Extracting)
                | (Extracting, Extracted)
                | (Extracting, ExtractFailed)
                | (Extracted, Structuring)
                | (Structuring, Completed)
                | (Structuring, StructureFailed)
        )
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn advance(&mut self, item_id: &str, next: ItemState) -> Result<(), PipelineError> {
        if !self.can_advance_to(next) {
            return Err(PipelineError::InvalidTransition {
                item_id: item_id.to_string(),
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Extracting => "extracting",
            Self::Extracted => "extracted",
            Self::ExtractFailed => "extract_failed",
            Self::Structuring => "structuring",
            Self::Completed => "completed",
            Self::StructureFailed => "structure_failed",
        };
        f.write_str(label)
    }
}
