//! Cache management command

use clap::{Args, Subcommand};
use console::style;

use kptn_cache::TaskStateStore;

use crate::cli::{output, runtime, Cli, OutputFormat, Session};

/// Task record management
#[derive(Debug, Args)]
pub struct CacheCommand {
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// List stored task records
    List(CacheListCommand),
    /// Delete task records and their bins
    Clear(CacheClearCommand),
}

/// List stored task records
#[derive(Debug, Args)]
pub struct CacheListCommand;

/// Delete task records and their bins
#[derive(Debug, Args)]
pub struct CacheClearCommand {
    /// Only this task (every task of the pipeline when omitted)
    #[arg(long)]
    pub task: Option<String>,

    /// Skip confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl CacheCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let rt = runtime()?;
        match &self.action {
            CacheAction::List(cmd) => rt.block_on(cmd.execute(cli)),
            CacheAction::Clear(cmd) => rt.block_on(cmd.execute(cli)),
        }
    }
}

impl CacheListCommand {
    async fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let session = Session::open(cli).await?;
        let scope = session.engine.scope(&session.storage_key);
        let records = session.engine.store().list(&scope).await?;

        if cli.format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&records)?);
            return Ok(());
        }
        if cli.quiet {
            return Ok(());
        }

        println!("{}", output::header(&format!("Task records in {}", scope)));
        if records.is_empty() {
            output::info("No task records stored.");
        }
        for record in &records {
            let status = record
                .status
                .map_or_else(|| "-".to_string(), |s| s.to_string());
            println!(
                "  {} {} v{}/{}",
                output::task_style().apply_to(&record.task_id),
                style(status).dim(),
                record.outputs_version,
                record.output_data_version
            );
        }
        Ok(())
    }
}

impl CacheClearCommand {
    async fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let session = Session::open(cli).await?;
        let target = match &self.task {
            Some(task) => format!("task '{}'", task),
            None => format!(
                "every task of pipeline '{}'",
                session.engine.pipeline()
            ),
        };

        if !self.yes {
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(format!(
                    "Remove cached state of {} under storage key '{}'?",
                    target, session.storage_key
                ))
                .default(false)
                .interact()?;

            if !confirmed {
                if !cli.quiet {
                    println!("{}", style("Aborted.").yellow());
                }
                return Ok(());
            }
        }

        let removed = match &self.task {
            Some(task) => usize::from(session.engine.forget(&session.storage_key, task).await?),
            None => session.engine.clear(&session.storage_key).await?,
        };

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "storage_key": session.storage_key,
                "removed": removed,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            output::success(&format!("Removed {} task record(s)", removed));
        }
        Ok(())
    }
}
