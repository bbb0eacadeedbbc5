//! Plan command

use clap::Args;
use tracing::info;

use kptn_core::load_config_from_dir;
use kptn_cache::PipelineGraph;

use crate::cli::{output, Cli, OutputFormat};

/// Show the pipeline's execution waves
#[derive(Debug, Args)]
pub struct PlanCommand;

impl PlanCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!("executing plan command");
        let cwd = std::env::current_dir()?;
        let (config, _) = load_config_from_dir(&cwd)?;
        let pipeline = match cli.pipeline.as_deref() {
            Some(p) => p,
            None => config.sole_pipeline().ok_or_else(|| {
                anyhow::anyhow!("several pipelines are configured, choose one with --pipeline")
            })?,
        };
        let graph = PipelineGraph::load(&config, pipeline)?;

        match cli.format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "pipeline": graph.pipeline(),
                    "waves": graph.waves(),
                    "tasks": graph
                        .sorted()
                        .iter()
                        .filter_map(|name| graph.node(name).ok())
                        .collect::<Vec<_>>(),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Text => {
                println!(
                    "{}",
                    output::header(&format!("Pipeline {} ({} tasks)", pipeline, graph.len()))
                );
                print!("{}", graph.execution_plan());
            }
        }
        Ok(())
    }
}
