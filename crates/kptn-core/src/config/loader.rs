//! Configuration loading

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ConfigError, Result};

use super::defaults::config_file_names;
use super::overrides::apply_env_overrides;
use super::types::Config;
use super::validation::validate_config;

/// Load configuration from a file, apply environment overrides and validate
pub fn load_config(path: &Path) -> Result<Config> {
    let format = if path.extension().is_some_and(|e| e == "toml") {
        "TOML"
    } else {
        "YAML"
    };
    info!(path = %path.display(), format, "loading config");

    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
    let mut config = parse_config(&content, format)?;
    apply_env_overrides(&mut config)?;

    validate_config(&config)?;
    debug!(path = %path.display(), "config loaded and validated");
    Ok(config)
}

fn parse_config(content: &str, format: &str) -> Result<Config> {
    let config = if format == "TOML" {
        toml::from_str(content).map_err(ConfigError::TomlError)?
    } else {
        serde_yaml::from_str(content).map_err(ConfigError::YamlError)?
    };
    Ok(config)
}

/// Find configuration file in directory or parent directories.
///
/// The first directory (walking upwards) holding one of
/// [`config_file_names`] wins.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    debug!(start_dir = %start_dir.display(), "searching for config file");
    let mut current = start_dir.to_path_buf();

    loop {
        for name in config_file_names() {
            let config_path = current.join(name);
            if config_path.exists() {
                info!(path = %config_path.display(), "found config file");
                return Some(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    debug!("no config file found");
    None
}

/// Load configuration from directory (searching parent directories).
///
/// Returns the config together with the project root, the directory that
/// holds the config file. Task source paths are resolved against it.
pub fn load_config_from_dir(dir: &Path) -> Result<(Config, PathBuf)> {
    let config_path = find_config(dir).ok_or_else(|| ConfigError::NotFound(dir.to_path_buf()))?;

    let config = load_config(&config_path)?;
    let root = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| dir.to_path_buf());
    Ok((config, root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const YAML: &str = "\
graphs:
  main:
    tasks:
      a: null
      b: a
tasks:
  a:
    file: a.py
  b:
    file: b.py
";

    #[test]
    fn test_find_config_yaml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("kptn.yaml");
        std::fs::write(&config_path, YAML).unwrap();

        let found = find_config(temp.path());
        assert_eq!(found, Some(config_path));
    }

    #[test]
    fn test_find_config_walks_up() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("kptn.yaml");
        std::fs::write(&config_path, YAML).unwrap();
        let nested = temp.path().join("tasks").join("inner");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config(&nested).unwrap();
        assert_eq!(found, config_path);
    }

    #[test]
    fn test_find_config_prefers_yaml_over_toml() {
        let temp = TempDir::new().unwrap();
        let yaml_path = temp.path().join("kptn.yaml");
        std::fs::write(&yaml_path, YAML).unwrap();
        std::fs::write(temp.path().join("kptn.toml"), "").unwrap();

        assert_eq!(find_config(temp.path()).unwrap(), yaml_path);
    }

    #[test]
    fn test_load_config_yaml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("kptn.yaml");
        std::fs::write(&config_path, YAML).unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.graphs["main"].tasks.len(), 2);
        assert_eq!(config.tasks["b"].file.as_deref(), Some("b.py"));
    }

    #[test]
    fn test_load_config_toml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("kptn.toml");
        std::fs::write(
            &config_path,
            "[settings]\ndb = \"memory\"\n\n[graphs.main.tasks]\na = []\nb = \"a\"\n\n[tasks.a]\nfile = \"a.py\"\n\n[tasks.b]\nfile = \"b.py\"\n",
        )
        .unwrap();

        let config = parse_config(&std::fs::read_to_string(&config_path).unwrap(), "TOML").unwrap();
        assert_eq!(config.settings.db, crate::config::DbKind::Memory);
        assert_eq!(config.graphs["main"].tasks.get("b").unwrap().0, vec!["a"]);
    }

    #[test]
    fn test_load_config_from_dir_returns_root() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("kptn.yaml"), YAML).unwrap();
        let nested = temp.path().join("sub");
        std::fs::create_dir_all(&nested).unwrap();

        let (_, root) = load_config_from_dir(&nested).unwrap();
        assert_eq!(root, temp.path());
    }

    #[test]
    fn test_load_config_missing() {
        let temp = TempDir::new().unwrap();
        let err = load_config_from_dir(temp.path()).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
