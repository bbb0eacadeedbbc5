//! CLI definition and command handling

pub mod commands;
pub mod output;
mod session;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::{
    CacheCommand, CompleteCommand, CompletionsCommand, DecideCommand, InitCommand, PlanCommand,
    StatusCommand, SubtaskCommand, ValidateCommand,
};

pub use session::Session;

/// kptn - incremental execution cache for data pipelines
#[derive(Debug, Parser)]
#[command(name = "kptn")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<PathBuf>,

    /// Pipeline to operate on (optional when only one is configured)
    #[arg(short, long, global = true, env = "KPTN_PIPELINE")]
    pub pipeline: Option<String>,

    /// Storage key scoping every task record (defaults to the git branch)
    #[arg(long, global = true)]
    pub storage_key: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create a starter kptn.yaml
    Init(InitCommand),

    /// Check the configuration and every pipeline graph
    Validate(ValidateCommand),

    /// Decide whether a task runs and record the start of the run
    Decide(DecideCommand),

    /// Record the outcome of a run
    Complete(CompleteCommand),

    /// Record completion of one fan-out item
    Subtask(SubtaskCommand),

    /// Show stored against live fingerprints
    Status(StatusCommand),

    /// Show the pipeline's execution waves
    Plan(PlanCommand),

    /// Task record management
    Cache(CacheCommand),

    /// Generate shell completions
    Completions(CompletionsCommand),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> anyhow::Result<()> {
        // Change to specified directory if provided
        if let Some(dir) = &self.directory {
            std::env::set_current_dir(dir)?;
        }

        match self.command {
            Commands::Init(ref cmd) => cmd.execute(&self),
            Commands::Validate(ref cmd) => cmd.execute(&self),
            Commands::Decide(ref cmd) => cmd.execute(&self),
            Commands::Complete(ref cmd) => cmd.execute(&self),
            Commands::Subtask(ref cmd) => cmd.execute(&self),
            Commands::Status(ref cmd) => cmd.execute(&self),
            Commands::Plan(ref cmd) => cmd.execute(&self),
            Commands::Cache(ref cmd) => cmd.execute(&self),
            Commands::Completions(ref cmd) => cmd.execute(&self),
        }
    }
}

/// Runtime for commands that talk to the task store
pub fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
