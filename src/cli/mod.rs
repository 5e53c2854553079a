//! CLI command implementations

pub mod args;
pub mod commands;
pub mod error;
pub mod report;

pub use args::{Cli, Commands};
pub use error::CliError;
pub use report::OutputFormat;
