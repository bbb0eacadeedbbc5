//! kptn cache - incremental execution cache for data pipelines
//!
//! Decides, per task, whether a pipeline step must run or can be skipped.
//! Every task's code, declared arguments and upstream versions are
//! fingerprinted and compared against the fingerprints committed by its
//! last successful run. Task state lives behind the [`TaskStateStore`]
//! trait, with in-memory, SQLite and (behind the `dynamodb` feature)
//! DynamoDB backends.

pub mod decision;
pub mod engine;
pub mod error;
pub mod graph;
pub mod hasher;
mod imports;
pub mod ledger;
mod lifecycle;
pub mod record;
pub mod reporter;
pub mod status;
pub mod store;
pub mod task;

pub use decision::{DecideRequest, Decision, DecisionReport, ExecutionMode, Reason, TaskSelection};
pub use engine::{CacheEngine, EngineOptions, Evaluation, Fingerprint};
pub use error::{CacheError, GraphError, HashingError, Result, StoreError};
pub use graph::{DependencyVersion, GraphNode, PipelineGraph};
pub use hasher::{CodeHashes, ContentHasher, InputHashes};
pub use ledger::VersionLedger;
pub use record::{
    BinManifest, BinType, PendingRun, Subtask, TaskRecord, TaskStatus, VersionDimension, Versions,
};
pub use reporter::{
    CollectingReporter, DecisionEvent, DecisionReporter, DecisionReporterRegistry, TracingReporter,
};
pub use status::{HashPair, TaskStatusView, VersionPair};
pub use store::{open_store, MemoryStore, SqliteStore, StoreResult, TaskStateStore};
pub use task::{Scope, TaskKey};

#[cfg(feature = "dynamodb")]
pub use store::DynamoDbStore;
