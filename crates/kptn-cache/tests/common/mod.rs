#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use kptn_cache::{CacheEngine, TaskStateStore};
use kptn_core::Config;

pub const KEY: &str = "main";
pub const PIPELINE: &str = "etl";

/// Throwaway project directory holding task sources
pub struct Project {
    dir: TempDir,
}

impl Project {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, relative: &str, contents: &str) {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    pub fn engine(&self, yaml: &str, store: Arc<dyn TaskStateStore>) -> CacheEngine {
        CacheEngine::new(&config(yaml), PIPELINE, self.root(), store)
            .unwrap()
            .without_default_reporters()
    }
}

pub fn config(yaml: &str) -> Config {
    serde_yaml::from_str(yaml).unwrap()
}
