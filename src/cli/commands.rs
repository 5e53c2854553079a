//! Command execution

use super::args::{
    BatchArgs, CheckpointsArgs, Cli, EndpointArgs, InvalidateArgs, ResumeArgs, TuningArgs,
    UsageArgs,
};
use super::report::{self, OutputFormat, ProgressDisplay};
use super::CliError;
use crate::cancel::CancelSignal;
use crate::checkpoint::FileCheckpointStore;
use crate::output::csv::CsvExporter;
use crate::pipeline::{Pipeline, PipelineConfig, Services};
use crate::quota::QuotaTracker;
use crate::services::{
    ExtractionService, HttpExtractionClient, HttpStructuringClient, LocalFileStore, ServiceError,
    StructuringService,
};
use crate::{ExtractedText, Stage, StructuringHints};
use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Stand-in for a service whose endpoint was not given.
/// Every call fails without being retried.
struct Unconfigured(&'static str);

impl Unconfigured {
    fn error(&self) -> ServiceError {
        ServiceError::Fatal(format!("{} endpoint is not configured", self.0))
    }
}

#[async_trait]
impl ExtractionService for Unconfigured {
    async fn extract_text(&self, _image: &[u8]) -> Result<ExtractedText, ServiceError> {
        Err(self.error())
    }
}

#[async_trait]
impl StructuringService for Unconfigured {
    async fn structure(
        &self,
        _text: &ExtractedText,
        _hints: &StructuringHints,
    ) -> Result<serde_json::Value, ServiceError> {
        Err(self.error())
    }
}

/// Which remote services a command needs
#[derive(Debug, Clone, Copy)]
struct Needs {
    extraction: bool,
    structuring: bool,
}

impl Needs {
    const NONE: Self = Self {
        extraction: false,
        structuring: false,
    };
}

fn extraction_service(
    endpoints: &EndpointArgs,
    required: bool,
) -> Result<Arc<dyn ExtractionService>, CliError> {
    match (&endpoints.extraction_endpoint, required) {
        (Some(endpoint), _) => Ok(Arc::new(HttpExtractionClient::new(
            endpoint.clone(),
            endpoints.extraction_api_key.clone(),
        )?)),
        (None, true) => Err(CliError::ConfigurationError(
            "extraction endpoint missing: pass --extraction-endpoint or set EXTRACTION_ENDPOINT"
                .to_string(),
        )),
        (None, false) => Ok(Arc::new(Unconfigured("extraction"))),
    }
}

fn structuring_service(
    endpoints: &EndpointArgs,
    required: bool,
) -> Result<Arc<dyn StructuringService>, CliError> {
    match (&endpoints.structuring_endpoint, required) {
        (Some(endpoint), _) => Ok(Arc::new(HttpStructuringClient::new(
            endpoint.clone(),
            endpoints.structuring_api_key.clone(),
        )?)),
        (None, true) => Err(CliError::ConfigurationError(
            "structuring endpoint missing: pass --structuring-endpoint or set STRUCTURING_ENDPOINT"
                .to_string(),
        )),
        (None, false) => Ok(Arc::new(Unconfigured("structuring"))),
    }
}

/// Load `--config` (if any) and apply flag overrides
fn load_config(config_path: Option<&Path>, tuning: &TuningArgs) -> Result<PipelineConfig, CliError> {
    let mut config = match config_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                CliError::ConfigurationError(format!("failed to read {}: {e}", path.display()))
            })?;
            serde_json::from_str(&raw).map_err(|e| {
                CliError::ConfigurationError(format!("invalid config {}: {e}", path.display()))
            })?
        }
        None => PipelineConfig::default(),
    };
    tuning.apply(&mut config);
    config.validate()?;
    Ok(config)
}

/// Pipeline wired to the data directory layout
struct Workspace {
    pipeline: Pipeline,
    quota: Arc<QuotaTracker>,
    files: Arc<LocalFileStore>,
    config: PipelineConfig,
}

impl Workspace {
    fn open(
        cli: &Cli,
        tuning: &TuningArgs,
        endpoints: &EndpointArgs,
        needs: Needs,
        cancel: CancelSignal,
    ) -> Result<Self, CliError> {
        let config = load_config(cli.config.as_deref(), tuning)?;

        let files = Arc::new(LocalFileStore::new(cli.input_dir()));
        let services = Services {
            extraction: extraction_service(endpoints, needs.extraction)?,
            structuring: structuring_service(endpoints, needs.structuring)?,
            files: files.clone(),
            exporter: Arc::new(CsvExporter::new(cli.output_dir())),
        };
        let checkpoints = Arc::new(FileCheckpointStore::open(cli.checkpoint_dir())?);
        let quota = Arc::new(QuotaTracker::open(cli.usage_path(), config.quota_limits()));

        let pipeline = Pipeline::new(services, checkpoints, quota.clone()).with_cancel(cancel);
        Ok(Self {
            pipeline,
            quota,
            files,
            config,
        })
    }

    /// Explicit item ids, or every file in the input directory
    async fn item_ids(&self, items: &[String]) -> Result<Vec<String>, CliError> {
        if !items.is_empty() {
            return Ok(items.to_vec());
        }
        let listed = self.files.list().await.map_err(|e| {
            CliError::InvalidArgument(format!(
                "failed to list {}: {e}",
                self.files.root().display()
            ))
        })?;
        if listed.is_empty() {
            return Err(CliError::InvalidArgument(format!(
                "no receipts found in {}",
                self.files.root().display()
            )));
        }
        Ok(listed)
    }

    /// Drive `run` while a progress bar polls the pipeline
    async fn with_progress<F, T>(&self, format: OutputFormat, run: F) -> T
    where
        F: Future<Output = T>,
    {
        if format == OutputFormat::Json {
            return run.await;
        }
        let display = ProgressDisplay::start(self.pipeline.progress_reporter());
        let result = run.await;
        display.finish();
        result
    }

    fn warn_on_quota(&self) {
        for warning in self.pipeline.usage_summary().warnings {
            warn!("{}", warning);
        }
    }
}

async fn init_metrics_endpoint(cli: &Cli) -> Result<(), CliError> {
    if let Some(addr) = cli.metrics_addr {
        crate::metrics::init_metrics(addr)
            .await
            .map_err(|e| CliError::ConfigurationError(e.to_string()))?;
    }
    Ok(())
}

/// `process`: both stages, then export
pub async fn process(cli: &Cli, args: &BatchArgs, cancel: CancelSignal) -> Result<(), CliError> {
    let needs = Needs {
        extraction: true,
        structuring: true,
    };
    let workspace = Workspace::open(cli, &args.tuning, &args.endpoints, needs, cancel)?;
    init_metrics_endpoint(cli).await?;

    let item_ids = workspace.item_ids(&args.items).await?;
    info!(items = item_ids.len(), "Submitting batch");
    workspace.warn_on_quota();

    let summary = workspace
        .with_progress(
            cli.output_format,
            workspace.pipeline.submit_batch(item_ids, &workspace.config),
        )
        .await?;
    report::print_run_summary(cli.output_format, &summary)
}

/// `extract`: extraction only, prints the batch id for `resume`
pub async fn extract(cli: &Cli, args: &BatchArgs, cancel: CancelSignal) -> Result<(), CliError> {
    let needs = Needs {
        extraction: true,
        structuring: false,
    };
    let workspace = Workspace::open(cli, &args.tuning, &args.endpoints, needs, cancel)?;
    init_metrics_endpoint(cli).await?;

    let item_ids = workspace.item_ids(&args.items).await?;
    info!(items = item_ids.len(), "Submitting extraction-only batch");
    workspace.warn_on_quota();

    let run = workspace
        .with_progress(
            cli.output_format,
            workspace
                .pipeline
                .submit_extraction_only(item_ids, &workspace.config),
        )
        .await?;
    report::print_extraction_run(cli.output_format, &run)
}

/// `resume`: structuring from extraction checkpoints
pub async fn resume(cli: &Cli, args: &ResumeArgs, cancel: CancelSignal) -> Result<(), CliError> {
    let needs = Needs {
        extraction: false,
        structuring: true,
    };
    let workspace = Workspace::open(cli, &args.tuning, &args.endpoints, needs, cancel)?;
    init_metrics_endpoint(cli).await?;

    let summary = workspace
        .with_progress(
            cli.output_format,
            workspace
                .pipeline
                .resume_from_checkpoint(&args.batch_id, &workspace.config),
        )
        .await?;
    report::print_run_summary(cli.output_format, &summary)
}

/// `usage`: quota consumption
pub async fn usage(cli: &Cli, args: &UsageArgs) -> Result<(), CliError> {
    let workspace = Workspace::open(
        cli,
        &TuningArgs::default(),
        &EndpointArgs::default(),
        Needs::NONE,
        CancelSignal::new(),
    )?;

    let summary = workspace.pipeline.usage_summary();
    let history = args.history.map(|days| workspace.quota.daily_history(days));
    let recent = args.recent.map(|limit| workspace.quota.recent_calls(limit));
    report::print_usage(
        cli.output_format,
        &summary,
        history.as_deref(),
        recent.as_deref(),
    )
}

/// `invalidate`: drop checkpoints of the given items
pub async fn invalidate(cli: &Cli, args: &InvalidateArgs) -> Result<(), CliError> {
    let workspace = Workspace::open(
        cli,
        &TuningArgs::default(),
        &EndpointArgs::default(),
        Needs::NONE,
        CancelSignal::new(),
    )?;

    let stages = match args.stage {
        Some(stage) => vec![stage],
        None => vec![Stage::Extraction, Stage::Structuring],
    };

    let mut removed = Vec::new();
    for item_id in &args.items {
        for stage in &stages {
            if workspace.pipeline.invalidate(item_id, *stage)? {
                removed.push(serde_json::json!({ "item_id": item_id, "stage": stage }));
            }
        }
    }

    match cli.output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&removed)?);
        }
        OutputFormat::Human => {
            println!("Removed {} checkpoint(s)", removed.len());
        }
    }
    Ok(())
}

/// `checkpoints`: summarize the checkpoint store, optionally pruning first
pub async fn checkpoints(cli: &Cli, args: &CheckpointsArgs) -> Result<(), CliError> {
    let store = FileCheckpointStore::open(cli.checkpoint_dir())?;

    let pruned = args
        .prune_older_than
        .map(|hours| store.prune_older_than(chrono::Duration::hours(i64::from(hours))))
        .transpose()?;
    let summary = store.summary()?;
    let files = if args.list { Some(store.list()?) } else { None };

    report::print_checkpoints(cli.output_format, &summary, files.as_deref(), pruned.as_ref())
}
