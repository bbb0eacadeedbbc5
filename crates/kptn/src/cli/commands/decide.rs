//! Decide command

use std::collections::BTreeMap;

use anyhow::Context;
use clap::Args;
use serde_json::Value;
use tracing::info;

use kptn_cache::{DecideRequest, TaskSelection};

use crate::cli::{output, runtime, Cli, OutputFormat, Session};

/// Decide whether a task runs
#[derive(Debug, Args)]
pub struct DecideCommand {
    /// Task to evaluate
    pub task: String,

    /// Comma-separated tasks selected for this execution (all when omitted)
    #[arg(long)]
    pub tasks: Option<String>,

    /// Run regardless of cached state
    #[arg(long)]
    pub ignore_cache: bool,

    /// Runtime parameters as a JSON object, overriding declared args
    #[arg(long)]
    pub parameters: Option<String>,

    /// Evaluate only; record nothing
    #[arg(long)]
    pub dry_run: bool,
}

impl DecideCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(task = %self.task, ignore_cache = self.ignore_cache, "executing decide command");
        runtime()?.block_on(self.run(cli))
    }

    async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let session = Session::open(cli).await?;
        let request = self.request()?;

        let decision = if self.dry_run {
            session
                .engine
                .evaluate(&session.storage_key, &self.task, &request)
                .await?
                .decision
        } else {
            session
                .engine
                .decide(&session.storage_key, &self.task, &request)
                .await?
        };

        match cli.format {
            OutputFormat::Json => {
                let report = decision.report(&self.task);
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            OutputFormat::Text => {
                if !cli.quiet {
                    println!("{}", output::decision_line(&self.task, &decision));
                }
            }
        }
        Ok(())
    }

    fn request(&self) -> anyhow::Result<DecideRequest> {
        let mut request = DecideRequest::new().with_ignore_cache(self.ignore_cache);
        if let Some(tasks) = &self.tasks {
            request = request.with_task_list(TaskSelection::parse(tasks));
        }
        if let Some(raw) = &self.parameters {
            let parameters: BTreeMap<String, Value> = serde_json::from_str(raw)
                .context("--parameters must be a JSON object")?;
            request = request.with_parameters(parameters);
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command(parameters: Option<&str>) -> DecideCommand {
        DecideCommand {
            task: "load".to_string(),
            tasks: Some("extract, load".to_string()),
            ignore_cache: false,
            parameters: parameters.map(str::to_string),
            dry_run: false,
        }
    }

    #[test]
    fn test_request_from_flags() {
        let request = command(Some(r#"{"year": 2021}"#)).request().unwrap();
        assert!(request.task_list.includes("extract"));
        assert!(!request.task_list.includes("transform"));
        assert_eq!(request.parameters["year"], json!(2021));
    }

    #[test]
    fn test_parameters_must_be_an_object() {
        assert!(command(Some("[1, 2]")).request().is_err());
    }
}
