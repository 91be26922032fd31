// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::types::CleanPolicy;

/// Command-line arguments for `jobflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "jobflow",
    version,
    about = "Run a DAG of batch jobs with retries, checkpointing and crash recovery.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the workflow file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Jobflow.toml")]
    pub config: String,

    /// Job store directory. Overrides `[leader].job_store`.
    #[arg(long, value_name = "DIR")]
    pub job_store: Option<PathBuf>,

    /// Recover an existing run from the job store instead of starting one.
    #[arg(long)]
    pub restart: bool,

    /// Run identifier. Overrides `[leader].run_id`.
    #[arg(long, value_name = "ID")]
    pub run_id: Option<String>,

    /// What to delete from the job store once the run ends.
    /// Overrides `[leader].clean`.
    #[arg(long, value_enum, value_name = "POLICY")]
    pub clean: Option<CleanPolicy>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `JOBFLOW_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print jobs in execution order, execute nothing.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
