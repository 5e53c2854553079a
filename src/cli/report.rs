//! Terminal output: progress bar and run summaries

use crate::checkpoint::{CheckpointFile, CheckpointSummary, PruneReport};
use crate::pipeline::{ExtractionRun, ProgressReporter, RunSummary};
use crate::quota::{DailyUsage, UsageRecord, UsageSummary};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::CliError;

/// How often the progress bar polls the reporter
const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}

/// Progress bar fed by polling a [`ProgressReporter`]
pub struct ProgressDisplay {
    bar: ProgressBar,
    poller: JoinHandle<()>,
}

impl ProgressDisplay {
    /// Start polling `reporter`
    pub fn start(reporter: ProgressReporter) -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
                .expect("hardcoded template is valid")
                .progress_chars("#>-"),
        );

        let poller = tokio::spawn({
            let bar = bar.clone();
            async move {
                let mut ticker = tokio::time::interval(PROGRESS_POLL_INTERVAL);
                loop {
                    ticker.tick().await;
                    let snapshot = reporter.snapshot();
                    if !snapshot.running {
                        continue;
                    }
                    bar.set_length(snapshot.total_items as u64);
                    bar.set_position(snapshot.current_progress as u64);
                    let mut message =
                        format!("chunk {}/{}", snapshot.current_chunk, snapshot.total_chunks);
                    if let Some(remaining) = snapshot.estimated_remaining {
                        message.push_str(&format!(
                            ", ~{} left",
                            crate::pipeline::progress::format_duration(remaining)
                        ));
                    }
                    bar.set_message(message);
                }
            }
        });

        Self { bar, poller }
    }

    /// Stop polling and remove the bar
    pub fn finish(self) {
        self.poller.abort();
        self.bar.finish_and_clear();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_failures<'a>(failures: impl Iterator<Item = (&'a str, String, &'a str)>) {
    let failures: Vec<_> = failures.collect();
    if failures.is_empty() {
        return;
    }
    println!("Failures:");
    for (item_id, kind, message) in failures {
        println!("  {item_id} [{kind}] {message}");
    }
}

/// Print the outcome of a full or resumed run
pub fn print_run_summary(format: OutputFormat, summary: &RunSummary) -> Result<(), CliError> {
    if format == OutputFormat::Json {
        return print_json(summary);
    }

    let title = if summary.cancelled {
        "Run cancelled"
    } else {
        "Run completed"
    };
    println!("\n{title}");
    println!("Batch: {}", summary.batch_id);
    println!("Processed: {}", summary.processed_count);
    println!("Failed: {}", summary.failed_count);
    println!(
        "Duration: {:.1}s ({:.1}s per item)",
        summary.total_duration.as_secs_f64(),
        summary.avg_time_per_item.as_secs_f64()
    );
    for path in &summary.artifact_locations {
        println!("Output: {}", path.display());
    }
    if let Some(error) = &summary.export_error {
        eprintln!("Export failed: {error}");
    }
    if summary.deleted_successful + summary.deleted_failed > 0 {
        println!(
            "Deleted files: {} completed, {} failed",
            summary.deleted_successful, summary.deleted_failed
        );
    }
    print_failures(summary.failures.iter().map(|failure| {
        (
            failure.item_id.as_str(),
            format!("{} {}", failure.stage, failure.kind.as_str()),
            failure.message.as_str(),
        )
    }));
    Ok(())
}

/// Print the outcome of an extraction-only run
pub fn print_extraction_run(format: OutputFormat, run: &ExtractionRun) -> Result<(), CliError> {
    if format == OutputFormat::Json {
        return print_json(run);
    }

    let title = if run.cancelled {
        "Extraction cancelled"
    } else {
        "Extraction completed"
    };
    println!("\n{title}");
    println!("Batch: {}", run.batch_id);
    println!("Extracted: {}", run.extracted_count);
    println!("Failed: {}", run.failed_count);
    println!("Duration: {:.1}s", run.total_duration.as_secs_f64());
    print_failures(run.failures.iter().map(|failure| {
        (
            failure.item_id.as_str(),
            failure.kind.as_str().to_string(),
            failure.message.as_str(),
        )
    }));
    println!("Structure later with: receipt-batch resume {}", run.batch_id);
    Ok(())
}

#[derive(Serialize)]
struct UsageReport<'a> {
    summary: &'a UsageSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    history: Option<&'a [DailyUsage]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recent_calls: Option<&'a [UsageRecord]>,
}

/// Print quota consumption
pub fn print_usage(
    format: OutputFormat,
    summary: &UsageSummary,
    history: Option<&[DailyUsage]>,
    recent_calls: Option<&[UsageRecord]>,
) -> Result<(), CliError> {
    if format == OutputFormat::Json {
        return print_json(&UsageReport {
            summary,
            history,
            recent_calls,
        });
    }

    println!("Month: {}", summary.current_month);
    println!(
        "Calls: {}/{} ({:.1}%), {} remaining",
        summary.month_to_date, summary.monthly_limit, summary.percentage, summary.remaining
    );
    println!("Today: {}", summary.today);
    println!(
        "This hour: {} (limit {}/min)",
        summary.current_hour, summary.rate_limit_per_minute
    );
    println!("Estimated cost: ${:.4}", summary.total_cost_estimate);
    for warning in &summary.warnings {
        println!("WARNING: {warning}");
    }

    if let Some(history) = history {
        println!("\nDaily usage:");
        for day in history {
            println!("  {} {}", day.date, day.usage);
        }
    }
    if let Some(recent_calls) = recent_calls {
        println!("\nRecent calls:");
        for call in recent_calls {
            println!(
                "  {} {} {}B {:.2}s",
                call.timestamp.to_rfc3339(),
                if call.success { "ok" } else { "failed" },
                call.payload_size_bytes,
                call.duration_seconds
            );
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct CheckpointReport<'a> {
    summary: &'a CheckpointSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pruned: Option<&'a PruneReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<&'a [CheckpointFile]>,
}

/// Print checkpoint storage use
pub fn print_checkpoints(
    format: OutputFormat,
    summary: &CheckpointSummary,
    files: Option<&[CheckpointFile]>,
    pruned: Option<&PruneReport>,
) -> Result<(), CliError> {
    if format == OutputFormat::Json {
        return print_json(&CheckpointReport {
            summary,
            pruned,
            files,
        });
    }

    if let Some(pruned) = pruned {
        println!(
            "Pruned {} checkpoint file(s), freed {} bytes",
            pruned.removed, pruned.freed_bytes
        );
        if pruned.failed > 0 {
            eprintln!("Could not remove {} file(s)", pruned.failed);
        }
    }

    println!("Checkpoints: {}", summary.root.display());
    println!(
        "Files: {} ({:.2} MB)",
        summary.total_files, summary.total_size_mb
    );
    println!("  Extraction: {}", summary.extraction_files);
    println!("  Structuring: {}", summary.structuring_files);
    println!("  Batches: {}", summary.batch_files);
    if summary.failed_entries > 0 {
        println!("Failed entries: {}", summary.failed_entries);
    }
    if summary.unreadable_files > 0 {
        println!("WARNING: {} unreadable file(s)", summary.unreadable_files);
    }

    if let Some(files) = files {
        println!("\nFiles:");
        for file in files {
            let status = match file.success {
                Some(true) => "ok",
                Some(false) => "failed",
                None => "-",
            };
            println!(
                "  {} {} {} {} {}B",
                file.modified.to_rfc3339(),
                file.kind,
                file.key.as_deref().unwrap_or("<unreadable>"),
                status,
                file.size_bytes
            );
        }
    }
    Ok(())
}
