//! Status command

use clap::Args;
use console::style;
use tracing::info;

use kptn_cache::TaskStatusView;

use crate::cli::{output, runtime, Cli, OutputFormat, Session};

/// Show stored against live fingerprints
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Single task to show (all tasks when omitted)
    pub task: Option<String>,

    /// List every fingerprint entry, not only changed ones
    #[arg(short, long)]
    pub all: bool,
}

impl StatusCommand {
    /// Execute the status command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(task = ?self.task, "executing status command");
        runtime()?.block_on(self.run(cli))
    }

    async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let session = Session::open(cli).await?;
        let views = match &self.task {
            Some(task) => vec![session.engine.status(&session.storage_key, task).await?],
            None => session.engine.status_all(&session.storage_key).await?,
        };

        match cli.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&views)?);
            }
            OutputFormat::Text => {
                println!(
                    "{}",
                    output::header(&format!(
                        "Pipeline {} @ {}",
                        session.engine.pipeline(),
                        session.storage_key
                    ))
                );
                println!(
                    "{}",
                    output::key_value(
                        "Project",
                        &output::path_style()
                            .apply_to(session.root.display())
                            .to_string()
                    )
                );
                println!(
                    "{}",
                    output::key_value("Store", session.config.settings.db.as_str())
                );
                println!();
                for view in &views {
                    self.print_view(view);
                }
            }
        }
        Ok(())
    }

    fn print_view(&self, view: &TaskStatusView) {
        let state = match view.status {
            Some(status) => status.to_string(),
            None => "never run".to_string(),
        };
        let freshness = if view.is_current() {
            style("current").green().to_string()
        } else {
            style("stale").yellow().to_string()
        };
        println!(
            "{} {} [{}] v{}/{}",
            output::task_style().apply_to(&view.task),
            freshness,
            state,
            view.outputs_version,
            view.output_data_version
        );
        if let Some(error) = &view.error {
            println!("{}", output::key_value("error", error));
        }
        if view.subtask_count > 0 || view.has_data {
            println!(
                "{}",
                output::key_value(
                    "bins",
                    &format!("subtasks={} data={}", view.subtask_count, view.has_data)
                )
            );
        }

        for pair in view.code.iter().chain(&view.inputs) {
            if self.all || pair.changed() {
                println!(
                    "    {} {} -> {}",
                    pair.name,
                    output::short_hash(pair.stored.as_deref()),
                    output::short_hash(pair.live.as_deref())
                );
            }
        }
        for pair in &view.dependencies {
            if self.all || pair.changed() {
                let show = |v: Option<u64>| v.map_or_else(|| "-".to_string(), |v| v.to_string());
                println!(
                    "    {} v{} -> v{}",
                    pair.dependency,
                    show(pair.stored),
                    show(pair.live)
                );
            }
        }
    }
}
