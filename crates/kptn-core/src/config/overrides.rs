//! Environment overrides for settings

use std::path::PathBuf;
use std::str::FromStr;

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::{Config, DbKind};

pub const ENV_DB_TYPE: &str = "KPTN_DB_TYPE";
pub const ENV_DB_PATH: &str = "KPTN_DB_PATH";
pub const ENV_TABLE_NAME: &str = "KPTN_TABLE_NAME";
pub const ENV_STORAGE_KEY: &str = "KPTN_STORAGE_KEY";
pub const ENV_STALE_RUN_AFTER_SECS: &str = "KPTN_STALE_RUN_AFTER_SECS";
pub const ENV_SUBSET_MODE: &str = "KPTN_SUBSET_MODE";

/// Apply `KPTN_*` variables from the process environment
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    apply_overrides(config, |name| std::env::var(name).ok())
}

/// Apply overrides from an arbitrary lookup; empty values are ignored
pub fn apply_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    let settings = &mut config.settings;

    if let Some(db) = get(ENV_DB_TYPE) {
        settings.db = DbKind::from_str(&db)?;
        debug!(db = %settings.db, "db backend overridden from environment");
    }
    if let Some(path) = get(ENV_DB_PATH) {
        settings.db_path = PathBuf::from(path);
    }
    if let Some(table) = get(ENV_TABLE_NAME) {
        settings.table_name = table;
    }
    if let Some(key) = get(ENV_STORAGE_KEY) {
        settings.storage_key = Some(key);
    }
    if let Some(secs) = get(ENV_STALE_RUN_AFTER_SECS) {
        settings.stale_run_after_secs = secs.trim().parse().map_err(|_| {
            ConfigError::invalid(ENV_STALE_RUN_AFTER_SECS, "must be a whole number of seconds")
        })?;
    }
    if let Some(flag) = get(ENV_SUBSET_MODE) {
        settings.subset_mode = parse_flag(&flag)
            .ok_or_else(|| ConfigError::invalid(ENV_SUBSET_MODE, "must be true or false"))?;
    }

    Ok(())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
