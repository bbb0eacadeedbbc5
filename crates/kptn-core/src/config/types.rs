//! Configuration types

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

use super::defaults::{
    DEFAULT_DB_PATH, DEFAULT_MAX_BIN_BYTES, DEFAULT_MAX_BUMP_ATTEMPTS,
    DEFAULT_STALE_RUN_AFTER_SECS, DEFAULT_TABLE_NAME,
};

/// Main configuration for a kptn project (`kptn.yaml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Runtime settings
    pub settings: Settings,

    /// Pipeline graphs keyed by pipeline name
    pub graphs: BTreeMap<String, GraphConfig>,

    /// Task definitions keyed by task name
    pub tasks: BTreeMap<String, TaskConfig>,
}

impl Config {
    /// Look up a pipeline graph by name
    pub fn graph(&self, pipeline: &str) -> Result<&GraphConfig, ConfigError> {
        self.graphs
            .get(pipeline)
            .ok_or_else(|| ConfigError::UnknownPipeline(pipeline.to_string()))
    }

    /// Look up a task definition by name
    pub fn task(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.get(name)
    }

    /// The only pipeline, when exactly one is configured
    pub fn sole_pipeline(&self) -> Option<&str> {
        if self.graphs.len() == 1 {
            self.graphs.keys().next().map(String::as_str)
        } else {
            None
        }
    }
}

/// Backing store selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbKind {
    /// Local relational store
    #[default]
    Sqlite,
    /// Wide-column cloud store
    Dynamodb,
    /// Process-local store, nothing persisted
    Memory,
}

impl DbKind {
    pub const ALL: [&'static str; 3] = ["sqlite", "dynamodb", "memory"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Dynamodb => "dynamodb",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for DbKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "dynamodb" | "ddb" => Ok(Self::Dynamodb),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::invalid(
                "settings.db",
                format!("unknown backend '{}', must be one of: {}", other, Self::ALL.join(", ")),
            )),
        }
    }
}

/// Runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Which backing store holds task records
    pub db: DbKind,

    /// SQLite database path, relative to the project root
    pub db_path: PathBuf,

    /// DynamoDB table name
    pub table_name: String,

    /// Fixed storage key; resolved from the git branch when absent
    pub storage_key: Option<String>,

    /// Seconds after which a `running` record without an end time counts as abandoned
    pub stale_run_after_secs: u64,

    /// Conditional version bumps attempted before giving up
    pub max_bump_attempts: u32,

    /// Largest chunk written into a single bin
    pub max_bin_bytes: usize,

    /// Run every task and write data payloads into subset bins
    pub subset_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db: DbKind::default(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            storage_key: None,
            stale_run_after_secs: DEFAULT_STALE_RUN_AFTER_SECS,
            max_bump_attempts: DEFAULT_MAX_BUMP_ATTEMPTS,
            max_bin_bytes: DEFAULT_MAX_BIN_BYTES,
            subset_mode: false,
        }
    }
}

impl Settings {
    pub fn stale_run_after(&self) -> Duration {
        Duration::from_secs(self.stale_run_after_secs)
    }
}

/// One pipeline graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Parent graphs whose tasks are merged in before this graph's own
    #[serde(
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub extends: Vec<String>,

    /// Task adjacency in declaration order
    pub tasks: GraphTasks,
}

/// Declared dependencies of one graph node.
///
/// Accepts a list, a single task name, or null.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies(pub Vec<String>);

impl Dependencies {
    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Dependencies {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl<'de> Deserialize<'de> for Dependencies {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = match Option::<OneOrMany>::deserialize(deserializer)? {
            None => Vec::new(),
            Some(OneOrMany::One(name)) => vec![name],
            Some(OneOrMany::Many(names)) => names,
        };
        Ok(Self(names))
    }
}

impl Serialize for Dependencies {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Dependencies::deserialize(deserializer).map(|deps| deps.0)
}

/// Task adjacency that keeps declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphTasks(Vec<(String, Dependencies)>);

impl GraphTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node unless one with the same name is already present
    pub fn insert_if_absent(&mut self, name: impl Into<String>, deps: Dependencies) -> bool {
        let name = name.into();
        if self.contains(&name) {
            return false;
        }
        self.0.push((name, deps));
        true
    }

    pub fn get(&self, name: &str) -> Option<&Dependencies> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Dependencies)> {
        self.0.iter().map(|(n, d)| (n, d))
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.0.iter().map(|(n, _)| n)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, Dependencies)> for GraphTasks {
    fn from_iter<I: IntoIterator<Item = (S, Dependencies)>>(iter: I) -> Self {
        let mut tasks = Self::new();
        for (name, deps) in iter {
            tasks.insert_if_absent(name, deps);
        }
        tasks
    }
}

impl<'de> Deserialize<'de> for GraphTasks {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TasksVisitor;

        impl<'de> Visitor<'de> for TasksVisitor {
            type Value = GraphTasks;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of task name to dependencies")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut tasks = GraphTasks::new();
                while let Some((name, deps)) = map.next_entry::<String, Dependencies>()? {
                    if !tasks.insert_if_absent(name.clone(), deps) {
                        return Err(serde::de::Error::custom(format!(
                            "task '{}' listed twice",
                            name
                        )));
                    }
                }
                Ok(tasks)
            }
        }

        deserializer.deserialize_map(TasksVisitor)
    }
}

impl Serialize for GraphTasks {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, deps) in &self.0 {
            map.serialize_entry(name, deps)?;
        }
        map.end()
    }
}

/// Definition of a single task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Main source file, relative to the project root. A `:function` suffix is ignored.
    pub file: Option<String>,

    /// Extra source globs that belong to the task's code
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,

    /// Declared arguments
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, serde_json::Value>,

    /// Key of the upstream collection this task fans out over
    pub map_over: Option<String>,

    /// Key this task's data payload is exposed under for mapped consumers
    pub iterable_item: Option<String>,

    /// Whether the task emits a data payload
    pub cache_result: bool,

    /// Declared output paths
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
}

impl TaskConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_include(mut self, pattern: impl Into<String>) -> Self {
        self.include.push(pattern.into());
        self
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.args.insert(name.into(), value);
        self
    }

    pub fn with_map_over(mut self, key: impl Into<String>) -> Self {
        self.map_over = Some(key.into());
        self
    }

    pub fn with_iterable_item(mut self, key: impl Into<String>) -> Self {
        self.iterable_item = Some(key.into());
        self
    }

    pub fn with_cache_result(mut self, cache_result: bool) -> Self {
        self.cache_result = cache_result;
        self
    }

    /// Source file path without any `:function` suffix
    pub fn source_path(&self) -> Option<&str> {
        self.file
            .as_deref()
            .map(|f| f.split_once(':').map_or(f, |(path, _)| path))
    }

    pub fn is_mapped(&self) -> bool {
        self.map_over.is_some()
    }

    pub fn produces_data(&self) -> bool {
        self.cache_result
    }
}
