//! Subtask command

use clap::Args;
use tracing::info;

use crate::cli::{output, runtime, Cli, OutputFormat, Session};

/// Record completion of one fan-out item
#[derive(Debug, Args)]
pub struct SubtaskCommand {
    /// Mapped task
    pub task: String,

    /// Item index within the fan-out
    pub index: usize,

    /// Hash of the item's output
    #[arg(long)]
    pub output_hash: Option<String>,
}

impl SubtaskCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(task = %self.task, index = self.index, "executing subtask command");
        runtime()?.block_on(async {
            let session = Session::open(cli).await?;
            let subtask = session
                .engine
                .record_subtask(
                    &session.storage_key,
                    &self.task,
                    self.index,
                    self.output_hash.clone(),
                )
                .await?;

            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&subtask)?),
                OutputFormat::Text if !cli.quiet => output::success(&format!(
                    "{}[{}] ({}) recorded",
                    self.task, subtask.index, subtask.key
                )),
                OutputFormat::Text => {}
            }
            Ok(())
        })
    }
}
