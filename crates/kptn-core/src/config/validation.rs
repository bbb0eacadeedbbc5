//! Configuration validation

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::Config;

/// Task, pipeline and storage-key names end up inside composite store keys
/// separated by `#`, so they are restricted to a safe alphabet.
pub fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("valid name pattern"))
}

/// Check a single identifier against [`name_pattern`]
pub fn validate_name(field: &str, name: &str) -> Result<()> {
    if !name_pattern().is_match(name) {
        return Err(ConfigError::invalid(
            field,
            format!("'{}' may only contain letters, digits, '_', '.' and '-'", name),
        )
        .into());
    }
    Ok(())
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_settings(config)?;
    validate_graphs(config)?;
    validate_tasks(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn validate_settings(config: &Config) -> Result<()> {
    let settings = &config.settings;

    if settings.max_bin_bytes == 0 {
        return Err(ConfigError::invalid("settings.max_bin_bytes", "must be greater than zero").into());
    }

    if settings.max_bump_attempts == 0 {
        return Err(
            ConfigError::invalid("settings.max_bump_attempts", "must be greater than zero").into(),
        );
    }

    if settings.table_name.trim().is_empty() {
        return Err(ConfigError::invalid("settings.table_name", "cannot be empty").into());
    }

    if let Some(key) = &settings.storage_key {
        validate_name("settings.storage_key", key)?;
    }

    Ok(())
}

fn validate_graphs(config: &Config) -> Result<()> {
    for (pipeline, graph) in &config.graphs {
        validate_name("graphs", pipeline)?;

        for parent in &graph.extends {
            if !config.graphs.contains_key(parent) {
                return Err(ConfigError::invalid(
                    format!("graphs.{}.extends", pipeline),
                    format!("unknown graph '{}'", parent),
                )
                .into());
            }
        }

        for (task, _) in graph.tasks.iter() {
            if !config.tasks.contains_key(task) {
                return Err(ConfigError::invalid(
                    format!("graphs.{}.tasks.{}", pipeline, task),
                    "no matching entry under tasks",
                )
                .into());
            }
        }
    }
    Ok(())
}

fn validate_tasks(config: &Config) -> Result<()> {
    for (name, task) in &config.tasks {
        validate_name("tasks", name)?;

        if let Some(key) = &task.map_over {
            if key.split(',').any(|part| part.trim().is_empty()) {
                return Err(ConfigError::invalid(
                    format!("tasks.{}.map_over", name),
                    "contains an empty key",
                )
                .into());
            }
        }

        if task.file.as_deref().is_some_and(|f| f.trim().is_empty()) {
            return Err(ConfigError::invalid(format!("tasks.{}.file", name), "cannot be empty").into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Dependencies, GraphConfig, GraphTasks, TaskConfig};

    fn config_with(tasks: &[&str]) -> Config {
        let mut config = Config::default();
        let graph_tasks: GraphTasks = tasks.iter().map(|t| (*t, Dependencies::none())).collect();
        config.graphs.insert(
            "main".to_string(),
            GraphConfig {
                extends: Vec::new(),
                tasks: graph_tasks,
            },
        );
        for t in tasks {
            config
                .tasks
                .insert(t.to_string(), TaskConfig::new().with_file(format!("{}.py", t)));
        }
        config
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&config_with(&["a", "b"])).is_ok());
    }

    #[test]
    fn test_graph_task_without_definition() {
        let mut config = config_with(&["a"]);
        config.tasks.clear();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("graphs.main.tasks.a"));
    }

    #[test]
    fn test_rejects_separator_in_names() {
        let config = config_with(&["bad#name"]);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_rejects_zero_bin_size() {
        let mut config = config_with(&["a"]);
        config.settings.max_bin_bytes = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("max_bin_bytes"));
    }

    #[test]
    fn test_rejects_unknown_parent_graph() {
        let mut config = config_with(&["a"]);
        config
            .graphs
            .get_mut("main")
            .unwrap()
            .extends
            .push("missing".to_string());
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("unknown graph 'missing'"));
    }

    #[test]
    fn test_rejects_empty_map_over_key() {
        let mut config = config_with(&["a"]);
        config.tasks.get_mut("a").unwrap().map_over = Some("x,".to_string());
        assert!(validate_config(&config).is_err());
    }
}
