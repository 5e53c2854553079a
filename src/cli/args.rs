//! Command-line surface

use crate::pipeline::PipelineConfig;
use crate::Stage;
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use super::report::OutputFormat;

/// Upper bound for per-stage concurrency flags
const MAX_CONCURRENCY: usize = 32;

/// Upper bound for `--chunk-size`
const MAX_CHUNK_SIZE: usize = 500;

/// Parse and validate a per-stage concurrency value (1..=32)
fn parse_concurrency(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("concurrency must be at least 1".to_string());
    }
    if value > MAX_CONCURRENCY {
        return Err(format!(
            "concurrency {value} exceeds maximum of {MAX_CONCURRENCY}"
        ));
    }
    Ok(value)
}

fn parse_chunk_size(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("chunk size must be at least 1".to_string());
    }
    if value > MAX_CHUNK_SIZE {
        return Err(format!(
            "chunk size {value} exceeds maximum of {MAX_CHUNK_SIZE}"
        ));
    }
    Ok(value)
}

/// Non-negative number of seconds
fn parse_seconds(s: &str) -> Result<f64, String> {
    let value = f64::from_str(s).map_err(|_| format!("'{s}' is not a valid number of seconds"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("'{s}' must be a non-negative number of seconds"));
    }
    Ok(value)
}

/// Batch pipeline for receipt text extraction and structuring
#[derive(Parser, Debug)]
#[command(name = "receipt-batch", version, about, long_about = None)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,

    /// Data root holding checkpoints/, usage.json and output/
    #[arg(long, global = true, default_value = "data")]
    pub data_dir: PathBuf,

    /// Directory holding uploaded receipt images (default: <data-dir>/receipts)
    #[arg(long, global = true)]
    pub input_dir: Option<PathBuf>,

    /// JSON pipeline configuration file; flags override its values
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9090)
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,
}

impl Cli {
    /// Upload directory
    pub fn input_dir(&self) -> PathBuf {
        self.input_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("receipts"))
    }

    /// Checkpoint directory
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    /// Persisted usage window
    pub fn usage_path(&self) -> PathBuf {
        self.data_dir.join("usage.json")
    }

    /// Export directory
    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("output")
    }
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract and structure a batch of receipts, then export the records
    Process(BatchArgs),

    /// Extract text only; the batch can be structured later with `resume`
    Extract(BatchArgs),

    /// Structure an extraction-only batch from its checkpoints
    Resume(ResumeArgs),

    /// Show extraction quota consumption
    Usage(UsageArgs),

    /// Drop checkpoints so the next run repeats the work
    Invalidate(InvalidateArgs),

    /// Show checkpoint storage, optionally listing or pruning old files
    Checkpoints(CheckpointsArgs),
}

/// Arguments of `process` and `extract`
#[derive(Args, Debug)]
pub struct BatchArgs {
    /// Item ids (file names under the input directory); all files when omitted
    pub items: Vec<String>,

    #[command(flatten)]
    pub tuning: TuningArgs,

    #[command(flatten)]
    pub endpoints: EndpointArgs,
}

/// Arguments of `resume`
#[derive(Args, Debug)]
pub struct ResumeArgs {
    /// Batch id printed by `extract`
    pub batch_id: String,

    #[command(flatten)]
    pub tuning: TuningArgs,

    #[command(flatten)]
    pub endpoints: EndpointArgs,
}

/// Arguments of `usage`
#[derive(Args, Debug)]
pub struct UsageArgs {
    /// Also show per-day usage for this many days
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=90))]
    pub history: Option<u32>,

    /// Also show this many recent calls
    #[arg(long)]
    pub recent: Option<usize>,
}

/// Arguments of `invalidate`
#[derive(Args, Debug)]
pub struct InvalidateArgs {
    /// Item ids whose checkpoints are dropped
    #[arg(required = true)]
    pub items: Vec<String>,

    /// Stage to invalidate (extraction or structuring); both when omitted
    #[arg(long)]
    pub stage: Option<Stage>,
}

/// Arguments of `checkpoints`
#[derive(Args, Debug)]
pub struct CheckpointsArgs {
    /// Also list every checkpoint file, newest first
    #[arg(long)]
    pub list: bool,

    /// Remove checkpoint files not modified for this many hours
    #[arg(long, value_name = "HOURS", value_parser = clap::value_parser!(u32).range(1..))]
    pub prune_older_than: Option<u32>,
}

/// Pipeline tuning flags, applied on top of `--config`
#[derive(Args, Debug, Default)]
pub struct TuningArgs {
    /// Items per chunk
    #[arg(long, value_parser = parse_chunk_size)]
    pub chunk_size: Option<usize>,

    /// Retries after the first attempt of a stage call
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=10))]
    pub retry_count: Option<u32>,

    /// Extraction calls in flight (max: 32)
    #[arg(long, value_parser = parse_concurrency)]
    pub extraction_concurrency: Option<usize>,

    /// Structuring calls in flight (max: 32)
    #[arg(long, value_parser = parse_concurrency)]
    pub structuring_concurrency: Option<usize>,

    /// Seconds to wait after each extraction call
    #[arg(long, value_parser = parse_seconds)]
    pub extraction_pacing: Option<f64>,

    /// Seconds to wait after each structuring call
    #[arg(long, value_parser = parse_seconds)]
    pub structuring_pacing: Option<f64>,

    /// Monthly extraction call allowance
    #[arg(long)]
    pub monthly_quota: Option<u64>,

    /// Keep receipt files of completed items
    #[arg(long, default_value_t = false)]
    pub keep_completed: bool,

    /// Delete receipt files of failed items after the run
    #[arg(long, default_value_t = false)]
    pub delete_failed: bool,

    /// Drop the extraction checkpoint of items whose structuring failed
    #[arg(long, default_value_t = false)]
    pub invalidate_on_failure: bool,
}

impl TuningArgs {
    /// Apply the flags that were given to `config`
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(retry_count) = self.retry_count {
            config.retry_count = retry_count;
        }
        if let Some(concurrency) = self.extraction_concurrency {
            config.concurrency.extraction = concurrency;
        }
        if let Some(concurrency) = self.structuring_concurrency {
            config.concurrency.structuring = concurrency;
        }
        if let Some(pacing) = self.extraction_pacing {
            config.pacing_secs.extraction = pacing;
        }
        if let Some(pacing) = self.structuring_pacing {
            config.pacing_secs.structuring = pacing;
        }
        if let Some(quota) = self.monthly_quota {
            config.monthly_quota = quota;
        }
        if self.keep_completed {
            config.auto_delete_on_success = false;
        }
        if self.delete_failed {
            config.keep_failed_items = false;
        }
        if self.invalidate_on_failure {
            config.invalidate_extraction_on_structuring_failure = true;
        }
    }
}

/// Remote service endpoints
#[derive(Args, Debug, Default)]
pub struct EndpointArgs {
    /// Text extraction endpoint
    #[arg(long, env = "EXTRACTION_ENDPOINT")]
    pub extraction_endpoint: Option<String>,

    /// Text extraction API key
    #[arg(long, env = "EXTRACTION_API_KEY", hide_env_values = true)]
    pub extraction_api_key: Option<String>,

    /// Structuring endpoint
    #[arg(long, env = "STRUCTURING_ENDPOINT")]
    pub structuring_endpoint: Option<String>,

    /// Structuring API key
    #[arg(long, env = "STRUCTURING_API_KEY", hide_env_values = true)]
    pub structuring_api_key: Option<String>,
}
