//! Pipeline engine: the public operations
//!
//! ```text
//! submit_batch            extraction -> structuring -> export
//! submit_extraction_only  extraction only, writes a batch manifest
//! resume_from_checkpoint  structuring of a manifest's items from their
//!                         extraction checkpoints
//! ```

use super::aggregator::{FailureReport, ItemReport, ResultAggregator, RunSummary};
use super::batcher::{Batcher, Chunk};
use super::config::PipelineConfig;
use super::executor::{FailureKind, StageCall, StageExecutor};
use super::item::ItemState;
use super::progress::{ProgressReporter, ProgressSnapshot};
use super::PipelineError;
use crate::cancel::CancelSignal;
use crate::checkpoint::{BatchManifest, CheckpointStore};
use crate::metrics::{self, RunMetrics};
use crate::output::Exporter;
use crate::quota::{QuotaTracker, UsageSummary};
use crate::services::{ExtractionService, FileStore, ServiceError, StructuringService};
use crate::{ExtractedText, Stage, StructuredRecord, StructuringHints};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};

/// Collaborators the pipeline calls out to
#[derive(Clone)]
pub struct Services {
    /// Text extraction
    pub extraction: Arc<dyn ExtractionService>,
    /// Structuring
    pub structuring: Arc<dyn StructuringService>,
    /// Item contents
    pub files: Arc<dyn FileStore>,
    /// Export of completed records
    pub exporter: Arc<dyn Exporter>,
}

/// Result of an extraction-only run
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionRun {
    /// Handle for [`Pipeline::resume_from_checkpoint`]
    pub batch_id: String,
    /// Items whose text was extracted
    pub extracted_count: usize,
    /// Items whose extraction failed
    pub failed_count: usize,
    /// Every item in submission order
    pub items: Vec<ItemReport>,
    /// Failed items in submission order
    pub failures: Vec<FailureReport>,
    /// Wall-clock duration of the run
    pub total_duration: Duration,
    /// Whether the run was cancelled
    pub cancelled: bool,
}

impl From<RunSummary> for ExtractionRun {
    fn from(summary: RunSummary) -> Self {
        let extracted_count = summary
            .items
            .iter()
            .filter(|report| report.state == ItemState::Extracted)
            .count();
        Self {
            batch_id: summary.batch_id,
            extracted_count,
            failed_count: summary.failed_count,
            items: summary.items,
            failures: summary.failures,
            total_duration: summary.total_duration,
            cancelled: summary.cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Full,
    ExtractionOnly,
    Resume,
}

impl RunMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::ExtractionOnly => "extraction_only",
            Self::Resume => "resume",
        }
    }
}

/// Extraction stage: reads the item's bytes, sends them to the extraction service
struct ExtractionCall {
    service: Arc<dyn ExtractionService>,
    files: Arc<dyn FileStore>,
}

#[async_trait]
impl StageCall for ExtractionCall {
    type Seed = ();
    type Input = Vec<u8>;
    type Output = ExtractedText;

    fn stage(&self) -> Stage {
        Stage::Extraction
    }

    async fn prepare(&self, item_id: &str, _seed: &()) -> Result<Vec<u8>, ServiceError> {
        self.files
            .read(item_id)
            .await
            .map_err(|e| ServiceError::Fatal(format!("failed to read {item_id}: {e}")))
    }

    async fn invoke(&self, input: &Vec<u8>) -> Result<ExtractedText, ServiceError> {
        self.service.extract_text(input).await
    }

    fn payload_size(&self, input: &Vec<u8>) -> u64 {
        input.len() as u64
    }
}

struct StructuringInput {
    text: ExtractedText,
    hints: StructuringHints,
}

/// Structuring stage: turns extracted text into a record
struct StructuringCall {
    service: Arc<dyn StructuringService>,
}

#[async_trait]
impl StageCall for StructuringCall {
    type Seed = ExtractedText;
    type Input = StructuringInput;
    type Output = serde_json::Value;

    fn stage(&self) -> Stage {
        Stage::Structuring
    }

    async fn prepare(
        &self,
        item_id: &str,
        seed: &ExtractedText,
    ) -> Result<StructuringInput, ServiceError> {
        Ok(StructuringInput {
            text: seed.clone(),
            hints: StructuringHints {
                item_id: item_id.to_string(),
                confidence: seed.confidence,
            },
        })
    }

    async fn invoke(&self, input: &StructuringInput) -> Result<serde_json::Value, ServiceError> {
        self.service.structure(&input.text, &input.hints).await
    }

    fn payload_size(&self, input: &StructuringInput) -> u64 {
        input.text.text.len() as u64
    }
}

type ItemResult = (ItemReport, Option<StructuredRecord>);

/// Everything one run needs, shared by the item tasks of every chunk
struct RunContext {
    mode: RunMode,
    invalidate_extraction_on_structuring_failure: bool,
    extraction: StageExecutor,
    structuring: StageExecutor,
    extraction_call: ExtractionCall,
    structuring_call: StructuringCall,
    checkpoints: Arc<dyn CheckpointStore>,
    progress: ProgressReporter,
}

impl RunContext {
    async fn run_chunk(&self, chunk: Chunk<String>) -> Vec<ItemResult> {
        self.progress.start_chunk(chunk.index);
        let tasks = chunk.items.into_iter().map(|item_id| self.process_item(item_id));
        let results = futures::future::join_all(tasks).await;
        self.progress.finish_chunk();
        results
    }

    async fn process_item(&self, item_id: String) -> ItemResult {
        let result = self.drive_item(&item_id).await;
        if let Some(kind) = result.0.failure_kind {
            if let Some(stage) = result.0.failed_stage {
                metrics::record_item_failed(stage, kind);
            }
        }
        self.progress.item_finished();
        result
    }

    async fn drive_item(&self, item_id: &str) -> ItemResult {
        let mut state = ItemState::Pending;
        advance(&mut state, item_id, ItemState::Extracting);

        let (text, extraction_cached) = match self.obtain_text(item_id).await {
            Ok(extracted) => extracted,
            Err((kind, message)) => {
                advance(&mut state, item_id, ItemState::ExtractFailed);
                let report =
                    ItemReport::failed(item_id, state, Stage::Extraction, kind, message);
                return (report, None);
            }
        };
        advance(&mut state, item_id, ItemState::Extracted);

        let mut report = ItemReport {
            item_id: item_id.to_string(),
            state,
            failed_stage: None,
            failure_kind: None,
            error_message: None,
            extraction_cached,
            structuring_cached: false,
        };
        if self.mode == RunMode::ExtractionOnly {
            return (report, None);
        }

        advance(&mut state, item_id, ItemState::Structuring);
        let outcome = self
            .structuring
            .execute(&self.structuring_call, item_id, &text)
            .await;
        report.structuring_cached = outcome.cached;

        match outcome.result {
            Ok(record) => {
                advance(&mut state, item_id, ItemState::Completed);
                report.state = state;
                let record = StructuredRecord {
                    item_id: item_id.to_string(),
                    record,
                };
                (report, Some(record))
            }
            Err(failure) => {
                advance(&mut state, item_id, ItemState::StructureFailed);
                if self.invalidate_extraction_on_structuring_failure
                    && failure.kind != FailureKind::Cancelled
                {
                    self.invalidate_extraction(item_id);
                }
                report.state = state;
                report.failed_stage = Some(Stage::Structuring);
                report.failure_kind = Some(failure.kind);
                report.error_message = Some(failure.message);
                (report, None)
            }
        }
    }

    /// Extracted text of an item and whether it came from a checkpoint
    async fn obtain_text(&self, item_id: &str) -> Result<(ExtractedText, bool), (FailureKind, String)> {
        if self.mode == RunMode::Resume {
            return self.checkpointed_text(item_id);
        }

        let outcome = self
            .extraction
            .execute(&self.extraction_call, item_id, &())
            .await;
        match outcome.result {
            Ok(text) => Ok((text, outcome.cached)),
            Err(failure) => Err((failure.kind, failure.message)),
        }
    }

    /// Resume never calls the extraction service; the checkpoint must exist
    fn checkpointed_text(&self, item_id: &str) -> Result<(ExtractedText, bool), (FailureKind, String)> {
        let entry = match self.checkpoints.get(item_id, Stage::Extraction) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                return Err((
                    FailureKind::Fatal,
                    "no extraction checkpoint for item".to_string(),
                ))
            }
            Err(e) => {
                return Err((
                    FailureKind::Fatal,
                    format!("extraction checkpoint unavailable: {e}"),
                ))
            }
        };

        if !entry.is_success() {
            let message = entry
                .result()
                .error_message
                .clone()
                .unwrap_or_else(|| "extraction previously failed".to_string());
            return Err((FailureKind::Fatal, message));
        }

        match entry.decode_payload::<ExtractedText>() {
            Ok(text) => {
                metrics::record_cache_hit(Stage::Extraction);
                Ok((text, true))
            }
            Err(e) => Err((
                FailureKind::Fatal,
                format!("extraction checkpoint unreadable: {e}"),
            )),
        }
    }

    fn invalidate_extraction(&self, item_id: &str) {
        if let Err(e) = self.checkpoints.delete(item_id, Stage::Extraction) {
            warn!(
                item_id = item_id,
                error = %e,
                "Failed to invalidate extraction checkpoint"
            );
        }
    }
}

fn advance(state: &mut ItemState, item_id: &str, next: ItemState) {
    if let Err(e) = state.advance(item_id, next) {
        warn!(error = %e, "Ignoring illegal item state transition");
    }
}

/// Batch pipeline over two remote stages
///
/// One run executes at a time; a concurrent submission is rejected with
/// [`PipelineError::RunInProgress`]. Progress and usage can be polled from
/// other tasks while a run is in flight.
pub struct Pipeline {
    services: Services,
    checkpoints: Arc<dyn CheckpointStore>,
    quota: Arc<QuotaTracker>,
    progress: ProgressReporter,
    cancel: CancelSignal,
    run_lock: tokio::sync::Mutex<()>,
}

impl Pipeline {
    /// Create a pipeline
    pub fn new(
        services: Services,
        checkpoints: Arc<dyn CheckpointStore>,
        quota: Arc<QuotaTracker>,
    ) -> Self {
        Self {
            services,
            checkpoints,
            quota,
            progress: ProgressReporter::new(),
            cancel: CancelSignal::new(),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Use `cancel` to stop runs. Once tripped, no further calls are dispatched
    /// by this pipeline.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancellation handle of this pipeline
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Handle for polling progress from another task
    pub fn progress_reporter(&self) -> ProgressReporter {
        self.progress.clone()
    }

    /// Run both stages over `item_ids` and export the completed records
    pub async fn submit_batch(
        &self,
        item_ids: Vec<String>,
        config: &PipelineConfig,
    ) -> Result<RunSummary, PipelineError> {
        let _guard = self.run_lock.try_lock().map_err(|_| PipelineError::RunInProgress)?;
        self.validate(&item_ids, config)?;

        let batch_id = uuid::Uuid::new_v4().to_string();
        Ok(self.run(RunMode::Full, batch_id, item_ids, config).await)
    }

    /// Run extraction only and record a manifest so the batch can be resumed
    pub async fn submit_extraction_only(
        &self,
        item_ids: Vec<String>,
        config: &PipelineConfig,
    ) -> Result<ExtractionRun, PipelineError> {
        let _guard = self.run_lock.try_lock().map_err(|_| PipelineError::RunInProgress)?;
        self.validate(&item_ids, config)?;

        let manifest = BatchManifest::new(item_ids.clone(), Stage::Extraction);
        self.checkpoints.put_manifest(&manifest)?;

        let batch_id = manifest.batch_id().to_string();
        let summary = self
            .run(RunMode::ExtractionOnly, batch_id, item_ids, config)
            .await;
        Ok(summary.into())
    }

    /// Structure the items of an extraction-only batch from their checkpoints
    ///
    /// Performs no extraction calls. Items without a successful extraction
    /// checkpoint fail with [`ItemState::ExtractFailed`].
    pub async fn resume_from_checkpoint(
        &self,
        batch_id: &str,
        config: &PipelineConfig,
    ) -> Result<RunSummary, PipelineError> {
        let _guard = self.run_lock.try_lock().map_err(|_| PipelineError::RunInProgress)?;

        let manifest = self
            .checkpoints
            .get_manifest(batch_id)?
            .ok_or_else(|| PipelineError::BatchNotFound(batch_id.to_string()))?;
        let item_ids = manifest.item_ids().to_vec();
        self.validate(&item_ids, config)?;

        info!(
            batch_id = batch_id,
            items = item_ids.len(),
            created_at = %manifest.created_at(),
            "Resuming batch from checkpoints"
        );
        Ok(self
            .run(RunMode::Resume, batch_id.to_string(), item_ids, config)
            .await)
    }

    /// Quota consumption of the extraction service
    pub fn usage_summary(&self) -> UsageSummary {
        self.quota.summarize()
    }

    /// Progress of the current run
    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Delete the checkpoint of one item and stage so the next run repeats it
    pub fn invalidate(&self, item_id: &str, stage: Stage) -> Result<bool, PipelineError> {
        Ok(self.checkpoints.delete(item_id, stage)?)
    }

    fn validate(&self, item_ids: &[String], config: &PipelineConfig) -> Result<(), PipelineError> {
        if item_ids.is_empty() {
            return Err(PipelineError::EmptyBatch);
        }
        let mut seen = HashSet::with_capacity(item_ids.len());
        for item_id in item_ids {
            if !seen.insert(item_id.as_str()) {
                return Err(PipelineError::DuplicateItem(item_id.clone()));
            }
        }
        config.validate()?;
        self.checkpoints.ensure_available()?;
        Ok(())
    }

    async fn run(
        &self,
        mode: RunMode,
        batch_id: String,
        item_ids: Vec<String>,
        config: &PipelineConfig,
    ) -> RunSummary {
        self.quota.set_limits(config.quota_limits());

        let context = RunContext {
            mode,
            invalidate_extraction_on_structuring_failure: config
                .invalidate_extraction_on_structuring_failure,
            extraction: StageExecutor::new(
                Stage::Extraction,
                config.stage_policy(Stage::Extraction),
                self.checkpoints.clone(),
            )
            .with_quota(self.quota.clone())
            .with_cancel(self.cancel.clone()),
            structuring: StageExecutor::new(
                Stage::Structuring,
                config.stage_policy(Stage::Structuring),
                self.checkpoints.clone(),
            )
            .with_cancel(self.cancel.clone()),
            extraction_call: ExtractionCall {
                service: self.services.extraction.clone(),
                files: self.services.files.clone(),
            },
            structuring_call: StructuringCall {
                service: self.services.structuring.clone(),
            },
            checkpoints: self.checkpoints.clone(),
            progress: self.progress.clone(),
        };

        let batcher = Batcher::new(config.chunk_size);
        let total_chunks = batcher.chunk_count(item_ids.len());
        let full_chunk_delay = config.chunk_delay_after(batcher.chunk_size());
        self.progress
            .start_run(item_ids.len(), total_chunks, full_chunk_delay);

        let run_metrics = RunMetrics::start(mode.as_str(), &batch_id, item_ids.len());
        let span = info_span!("run", batch_id = %batch_id, mode = mode.as_str());

        let summary = async {
            info!(
                items = item_ids.len(),
                chunks = total_chunks,
                chunk_size = batcher.chunk_size(),
                "Run started"
            );

            let keep_records = mode != RunMode::ExtractionOnly;
            let mut aggregator = ResultAggregator::new(
                batch_id.clone(),
                self.services.files.clone(),
                keep_records && config.auto_delete_on_success,
            );

            let context = &context;
            let results = batcher
                .run(
                    &item_ids,
                    &self.cancel,
                    |len| config.chunk_delay_after(len),
                    move |chunk| async move { context.run_chunk(chunk).await },
                )
                .await;
            for (report, record) in results {
                aggregator.push(report, record);
            }

            let keep_failed = !keep_records || config.keep_failed_items;
            aggregator
                .finish(
                    self.services.exporter.as_ref(),
                    keep_failed,
                    self.cancel.is_cancelled(),
                )
                .await
        }
        .instrument(span)
        .await;

        self.progress.finish_run();
        run_metrics.record_finish(summary.processed_count, summary.failed_count);
        summary
    }
}
