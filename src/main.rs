//! Main entry point for the receipt-batch CLI

use clap::Parser;
use receipt_batch::cancel::CancelSignal;
use receipt_batch::cli::{commands, Cli, Commands};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber with optional JSON formatting
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("receipt_batch=info"));

    // Logs go to stderr so `--output-format json` keeps stdout parseable
    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();

    // Ctrl+C stops dispatching; in-flight calls finish and are checkpointed
    let cancel = CancelSignal::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Ctrl+C received - finishing in-flight calls...");
                cancel.cancel();
            }
        }
    });

    let result = match cli.command {
        Commands::Process(ref args) => commands::process(&cli, args, cancel.clone())
            .await
            .map_err(|e| anyhow::anyhow!(e)),
        Commands::Extract(ref args) => commands::extract(&cli, args, cancel.clone())
            .await
            .map_err(|e| anyhow::anyhow!(e)),
        Commands::Resume(ref args) => commands::resume(&cli, args, cancel.clone())
            .await
            .map_err(|e| anyhow::anyhow!(e)),
        Commands::Usage(ref args) => commands::usage(&cli, args)
            .await
            .map_err(|e| anyhow::anyhow!(e)),
        Commands::Invalidate(ref args) => commands::invalidate(&cli, args)
            .await
            .map_err(|e| anyhow::anyhow!(e)),
        Commands::Checkpoints(ref args) => commands::checkpoints(&cli, args)
            .await
            .map_err(|e| anyhow::anyhow!(e)),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }
}
