//! kptn core - configuration and shared error types
//!
//! This crate loads and validates the `kptn.yaml` project file, applies
//! environment overrides, and resolves the storage key that scopes every
//! cached task record.

pub mod config;
pub mod error;
pub mod storage_key;

pub use config::{
    find_config, load_config, load_config_from_dir, Config, DbKind, Dependencies, GraphConfig,
    GraphTasks, Settings, TaskConfig,
};
pub use error::{ConfigError, KptnError, Result};
pub use storage_key::{current_branch, resolve_storage_key, DEFAULT_STORAGE_KEY};
