//! Default configuration values

use super::types::Config;

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "kptn.yaml";

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "kptn.toml";

/// Alternative configuration file name
pub const ALT_CONFIG_FILE: &str = ".kptn.yaml";

/// SQLite database location relative to the project root
pub const DEFAULT_DB_PATH: &str = ".kptn/kptn.db";

/// DynamoDB table holding task records and bins
pub const DEFAULT_TABLE_NAME: &str = "tasks";

/// Six hours
pub const DEFAULT_STALE_RUN_AFTER_SECS: u64 = 6 * 60 * 60;

pub const DEFAULT_MAX_BUMP_ATTEMPTS: u32 = 8;

/// Keeps a bin plus its key attributes under DynamoDB's 400 KB item limit
pub const DEFAULT_MAX_BIN_BYTES: usize = 350 * 1024;

/// Get list of config file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_YAML,
        DEFAULT_CONFIG_TOML,
        ALT_CONFIG_FILE,
        ".kptn.toml",
    ]
}

/// Generate default configuration YAML
pub fn default_config_yaml() -> String {
    let config = Config::default();
    serde_yaml::to_string(&config).unwrap_or_else(|_| DEFAULT_CONFIG_TEMPLATE.to_string())
}

/// Starter project file
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# kptn configuration

settings:
  db: sqlite
  db_path: .kptn/kptn.db
  stale_run_after_secs: 21600

graphs:
  main:
    tasks:
      extract: null
      transform: extract
      load: [transform]

tasks:
  extract:
    file: tasks/extract.py
    cache_result: true
    iterable_item: region
  transform:
    file: tasks/transform.py
    map_over: region
  load:
    file: tasks/load.py
    args:
      target: warehouse
"#;
