//! Error types for the execution cache

use std::path::PathBuf;

use thiserror::Error;

use crate::record::{BinType, VersionDimension};

/// Result type alias using CacheError
pub type Result<T> = std::result::Result<T, CacheError>;

/// Top-level error for cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Fingerprinting failed; cache validity cannot be determined
    #[error(transparent)]
    Hashing(#[from] HashingError),

    /// Graph configuration errors, raised at load time
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Backing store errors
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Fan-out size or upstream version could not be computed
    #[error("Unresolved dependency '{dependency}' for task '{task}': {reason}")]
    UnresolvedDependency {
        task: String,
        dependency: String,
        reason: String,
    },

    /// Task is not part of the loaded pipeline or has no definition
    #[error("Task '{0}' is not defined for this pipeline")]
    UnknownTask(String),

    /// Run completion recorded without a preceding run decision
    #[error("Task '{0}' has no run in progress")]
    NoRunInProgress(String),

    /// Subtask index outside the recorded fan-out
    #[error("Subtask {index} is out of range for task '{task}' ({count} items)")]
    SubtaskOutOfRange {
        task: String,
        index: usize,
        count: usize,
    },

    /// Payload (de)serialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors computing content fingerprints
#[derive(Debug, Error)]
pub enum HashingError {
    /// Declared source file does not exist
    #[error("Source file not found: {}", .0.display())]
    Missing(PathBuf),

    /// File exists but could not be read
    #[error("Cannot read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Include pattern is not a valid glob
    #[error("Invalid source pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },
}

impl HashingError {
    /// Path that could not be fingerprinted, when there is one
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::Missing(path) | Self::Unreadable { path, .. } => Some(path),
            Self::Pattern { .. } => None,
        }
    }
}

/// Errors loading a pipeline graph
#[derive(Debug, Error)]
pub enum GraphError {
    /// Cyclic dependency detected
    #[error("Cyclic dependency detected among tasks: {0}")]
    CyclicDependency(String),

    /// Graph inheritance (`extends`) loops back on itself
    #[error("Cycle detected in graph inheritance: {0}")]
    InheritanceCycle(String),

    /// Pipeline not defined
    #[error("Graph '{0}' not found in configuration")]
    UnknownGraph(String),

    /// Dependency names a task outside the graph
    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    /// Task not found in the graph
    #[error("Task '{0}' not found in pipeline graph")]
    UnknownTask(String),
}

/// Errors from a task state store backend
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record for the key
    #[error("Task record not found: {key}")]
    NotFound { key: String },

    /// A conditional increment saw a different value than expected
    #[error("Version conflict on {key} ({dimension}): expected {expected}")]
    VersionConflict {
        key: String,
        dimension: VersionDimension,
        expected: u64,
    },

    /// Conditional increments kept losing races
    #[error("Version bump for {key} ({dimension}) lost the race {attempts} times; backing store is stale")]
    StaleBackingStore {
        key: String,
        dimension: VersionDimension,
        attempts: u32,
    },

    /// Bins missing or not matching the owning record's manifest
    #[error("Incomplete {bin_type} bin set for {key}: {detail}")]
    IncompleteBinSet {
        key: String,
        bin_type: BinType,
        detail: String,
    },

    /// Stored value could not be decoded
    #[error("Corrupt task record {key}: {message}")]
    Corrupt { key: String, message: String },

    /// JSON (de)serialization of record fields
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Any other backend failure
    #[error("{message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }

    /// Whether this is a data-integrity failure rather than a plain miss
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::IncompleteBinSet { .. } | Self::Corrupt { .. })
    }
}
