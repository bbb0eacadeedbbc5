//! Validate command

use clap::Args;
use console::style;
use tracing::info;

use kptn_cache::PipelineGraph;
use kptn_core::load_config_from_dir;

use crate::cli::{output, Cli, OutputFormat};

/// Check the configuration and every pipeline graph
#[derive(Debug, Args)]
pub struct ValidateCommand {
    /// Strict mode - treat warnings as errors
    #[arg(long)]
    pub strict: bool,
}

impl ValidateCommand {
    /// Execute the validate command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(strict = self.strict, "executing validate command");
        let cwd = std::env::current_dir()?;

        let mut errors: Vec<String> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();
        let mut pipelines: Vec<(String, usize)> = Vec::new();

        let (config, root) = match load_config_from_dir(&cwd) {
            Ok((c, r)) => (Some(c), Some(r)),
            Err(e) => {
                errors.push(format!("Configuration: {}", e));
                (None, None)
            }
        };

        if let (Some(cfg), Some(root)) = (&config, &root) {
            if cfg.graphs.is_empty() {
                warnings.push("No pipelines configured".to_string());
            }
            for name in cfg.graphs.keys() {
                match PipelineGraph::load(cfg, name) {
                    Ok(graph) => pipelines.push((name.clone(), graph.len())),
                    Err(e) => errors.push(format!("Pipeline '{}': {}", name, e)),
                }
            }
            for (name, task) in &cfg.tasks {
                if let Some(source) = task.source_path() {
                    if !root.join(source).exists() {
                        warnings.push(format!("Task '{}': source {} not found", name, source));
                    }
                }
            }
        }

        if self.strict {
            errors.append(&mut warnings);
        }

        let passed = errors.is_empty();

        match cli.format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "valid": passed,
                    "project_root": root.map(|p| p.to_string_lossy().to_string()),
                    "pipelines": pipelines
                        .iter()
                        .map(|(name, tasks)| serde_json::json!({"name": name, "tasks": tasks}))
                        .collect::<Vec<_>>(),
                    "errors": errors,
                    "warnings": warnings
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Text => {
                if !cli.quiet {
                    println!("{}", output::header("Validation Results"));
                    println!();

                    if let Some(root) = &root {
                        println!("Project: {}", output::path_style().apply_to(root.display()));
                        for (name, tasks) in &pipelines {
                            println!("{}", output::key_value(name, &format!("{} tasks", tasks)));
                        }
                        println!();
                    }

                    if !errors.is_empty() {
                        println!("{}", style("Errors:").red().bold());
                        for error in &errors {
                            println!("  {} {}", style("✗").red(), error);
                        }
                        println!();
                    }

                    if !warnings.is_empty() {
                        println!("{}", style("Warnings:").yellow().bold());
                        for warning in &warnings {
                            println!("  {} {}", style("!").yellow(), warning);
                        }
                        println!();
                    }

                    if passed {
                        output::success("Validation passed");
                    }
                }
            }
        }

        if !passed {
            anyhow::bail!("validation failed with {} error(s)", errors.len());
        }

        Ok(())
    }
}
