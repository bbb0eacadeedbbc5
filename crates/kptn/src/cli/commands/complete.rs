//! Complete command

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgGroup, Args};
use serde_json::Value;
use tracing::info;

use crate::cli::{output, runtime, Cli, OutputFormat, Session};

/// Record the outcome of a run
#[derive(Debug, Args)]
#[command(group(ArgGroup::new("outcome").required(true).args(["success", "failure"])))]
pub struct CompleteCommand {
    /// Task that finished
    pub task: String,

    /// The run succeeded; commit its fingerprints
    #[arg(long)]
    pub success: bool,

    /// The run failed
    #[arg(long)]
    pub failure: bool,

    /// JSON file holding the task's data payload
    #[arg(long, requires = "success")]
    pub data: Option<PathBuf>,

    /// Failure message
    #[arg(long, requires = "failure")]
    pub error: Option<String>,
}

impl CompleteCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(task = %self.task, success = self.success, "executing complete command");
        runtime()?.block_on(self.run(cli))
    }

    async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let session = Session::open(cli).await?;
        let engine = &session.engine;

        if self.failure {
            let message = self.error.as_deref().unwrap_or("task failed");
            engine
                .mark_failed(&session.storage_key, &self.task, message)
                .await?;
            match cli.format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "task_name": self.task,
                        "status": "failed",
                        "error": message,
                    }))?
                ),
                OutputFormat::Text if !cli.quiet => {
                    output::warning(&format!("{} recorded as failed", self.task))
                }
                OutputFormat::Text => {}
            }
            return Ok(());
        }

        let data = self.read_data()?;
        let versions = engine
            .mark_succeeded(&session.storage_key, &self.task, data.as_ref())
            .await?;
        match cli.format {
            OutputFormat::Json => println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "task_name": self.task,
                    "status": "succeeded",
                    "outputs_version": versions.outputs_version,
                    "output_data_version": versions.output_data_version,
                }))?
            ),
            OutputFormat::Text if !cli.quiet => output::success(&format!(
                "{} recorded as succeeded ({})",
                self.task,
                output::version_style().apply_to(format!("v{}", versions.outputs_version))
            )),
            OutputFormat::Text => {}
        }
        Ok(())
    }

    fn read_data(&self) -> anyhow::Result<Option<Value>> {
        let Some(path) = &self.data else {
            return Ok(None);
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let value = serde_json::from_str(&content)
            .with_context(|| format!("{} is not valid JSON", path.display()))?;
        Ok(Some(value))
    }
}
