//! Project context shared by the store-backed commands

use std::path::PathBuf;

use anyhow::Context;
use tracing::debug;

use kptn_cache::{open_store, CacheEngine};
use kptn_core::{load_config_from_dir, resolve_storage_key, Config};

use super::Cli;

/// Loaded configuration, resolved storage key and a ready engine
pub struct Session {
    pub config: Config,
    pub root: PathBuf,
    pub storage_key: String,
    pub engine: CacheEngine,
}

impl Session {
    pub async fn open(cli: &Cli) -> anyhow::Result<Self> {
        let cwd = std::env::current_dir()?;
        let (config, root) = load_config_from_dir(&cwd)?;

        let pipeline = match cli.pipeline.as_deref() {
            Some(pipeline) => pipeline.to_string(),
            None => config
                .sole_pipeline()
                .map(str::to_string)
                .context("several pipelines are configured, choose one with --pipeline")?,
        };
        let storage_key = resolve_storage_key(cli.storage_key.as_deref(), &config.settings, &root)?;

        let store = open_store(&config.settings, &root)
            .await
            .context("failed to open task state store")?;
        let engine = CacheEngine::new(&config, &pipeline, root.clone(), store)?;
        debug!(pipeline = %pipeline, storage_key = %storage_key, "session opened");

        Ok(Self {
            config,
            root,
            storage_key,
            engine,
        })
    }
}
