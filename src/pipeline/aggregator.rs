//! Collects per-item outcomes and produces the run summary

use super::executor::FailureKind;
use super::item::ItemState;
use crate::output::Exporter;
use crate::services::FileStore;
use crate::{Stage, StructuredRecord};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Final state of one item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemReport {
    /// Item id
    pub item_id: String,
    /// Terminal state
    pub state: ItemState,
    /// Stage that failed, for failed items
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    /// Failure classification, for failed items
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    /// Last error, for failed items
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Extraction result came from a checkpoint
    pub extraction_cached: bool,
    /// Structuring result came from a checkpoint
    pub structuring_cached: bool,
}

impl ItemReport {
    /// Report for a failed item
    pub fn failed(
        item_id: impl Into<String>,
        state: ItemState,
        stage: Stage,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            state,
            failed_stage: Some(stage),
            failure_kind: Some(kind),
            error_message: Some(message.into()),
            extraction_cached: false,
            structuring_cached: false,
        }
    }
}

/// One failed item, as listed in the summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    /// Item id
    pub item_id: String,
    /// Stage that failed
    pub stage: Stage,
    /// Failure classification
    pub kind: FailureKind,
    /// Last error message
    pub message: String,
}

/// Outcome of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Batch identifier
    pub batch_id: String,
    /// Items that completed both stages
    pub processed_count: usize,
    /// Items that failed a stage
    pub failed_count: usize,
    /// Every item in submission order
    pub items: Vec<ItemReport>,
    /// Failed items in submission order
    pub failures: Vec<FailureReport>,
    /// Files written by the exporter
    pub artifact_locations: Vec<PathBuf>,
    /// Wall-clock duration of the run
    pub total_duration: Duration,
    /// `total_duration / items`
    pub avg_time_per_item: Duration,
    /// Files of completed items deleted
    pub deleted_successful: usize,
    /// Files of failed items deleted
    pub deleted_failed: usize,
    /// Whether the run was cancelled
    pub cancelled: bool,
    /// Export failure, if the exporter failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_error: Option<String>,
}

impl RunSummary {
    /// Report of one item
    pub fn item(&self, item_id: &str) -> Option<&ItemReport> {
        self.items.iter().find(|report| report.item_id == item_id)
    }
}

/// Accumulates item reports across all chunks of a run
pub struct ResultAggregator {
    batch_id: String,
    started: Instant,
    reports: Vec<ItemReport>,
    records: Vec<StructuredRecord>,
    files: Arc<dyn FileStore>,
    auto_delete_on_success: bool,
    deletions: Vec<JoinHandle<bool>>,
}

impl ResultAggregator {
    /// Start aggregating a run
    pub fn new(
        batch_id: impl Into<String>,
        files: Arc<dyn FileStore>,
        auto_delete_on_success: bool,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            started: Instant::now(),
            reports: Vec::new(),
            records: Vec::new(),
            files,
            auto_delete_on_success,
            deletions: Vec::new(),
        }
    }

    /// Batch identifier
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Add the report of an item. Call in submission order.
    pub fn push(&mut self, report: ItemReport, record: Option<StructuredRecord>) {
        if report.state == ItemState::Completed {
            if let Some(record) = record {
                self.records.push(record);
            }
            if self.auto_delete_on_success {
                self.deletions
                    .push(spawn_delete(self.files.clone(), report.item_id.clone()));
            }
        }
        self.reports.push(report);
    }

    /// Export completed records, apply retention and build the summary
    pub async fn finish(
        self,
        exporter: &dyn Exporter,
        keep_failed_items: bool,
        cancelled: bool,
    ) -> RunSummary {
        let Self {
            batch_id,
            started,
            reports,
            records,
            files,
            deletions,
            ..
        } = self;

        let (artifact_locations, export_error) = if records.is_empty() {
            debug!(batch_id = %batch_id, "No completed records, skipping export");
            (Vec::new(), None)
        } else {
            match exporter.export(&batch_id, &records) {
                Ok(paths) => (paths, None),
                Err(e) => {
                    warn!(batch_id = %batch_id, error = %e, "Export failed");
                    (Vec::new(), Some(e.to_string()))
                }
            }
        };

        let mut deleted_successful = 0;
        for handle in deletions {
            if matches!(handle.await, Ok(true)) {
                deleted_successful += 1;
            }
        }

        let mut deleted_failed = 0;
        if !keep_failed_items {
            let failed_ids = reports
                .iter()
                .filter(|report| report.state.is_failure())
                .filter(|report| report.failure_kind != Some(FailureKind::Cancelled))
                .map(|report| report.item_id.clone());
            for item_id in failed_ids {
                if delete_logged(files.as_ref(), &item_id).await {
                    deleted_failed += 1;
                }
            }
        }

        let failures: Vec<FailureReport> = reports
            .iter()
            .filter_map(|report| {
                Some(FailureReport {
                    item_id: report.item_id.clone(),
                    stage: report.failed_stage?,
                    kind: report.failure_kind?,
                    message: report.error_message.clone().unwrap_or_default(),
                })
            })
            .collect();
        let processed_count = reports
            .iter()
            .filter(|report| report.state == ItemState::Completed)
            .count();

        let total_duration = started.elapsed();
        let avg_time_per_item = if reports.is_empty() {
            Duration::ZERO
        } else {
            total_duration / reports.len() as u32
        };

        info!(
            batch_id = %batch_id,
            processed = processed_count,
            failed = failures.len(),
            duration_secs = total_duration.as_secs(),
            cancelled = cancelled,
            "Run finished"
        );

        RunSummary {
            batch_id,
            processed_count,
            failed_count: failures.len(),
            items: reports,
            failures,
            artifact_locations,
            total_duration,
            avg_time_per_item,
            deleted_successful,
            deleted_failed,
            cancelled,
            export_error,
        }
    }
}

fn spawn_delete(files: Arc<dyn FileStore>, item_id: String) -> JoinHandle<bool> {
    tokio::spawn(async move { delete_logged(files.as_ref(), &item_id).await })
}

async fn delete_logged(files: &dyn FileStore, item_id: &str) -> bool {
    match files.delete(item_id).await {
        Ok(()) => {
            info!(item_id = item_id, "Deleted item file");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(item_id = item_id, "Item file already gone");
            false
        }
        Err(e) => {
            warn!(item_id = item_id, error = %e, "Failed to delete item file");
            false
        }
    }
}
