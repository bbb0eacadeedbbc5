//! Persisted task state

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskKey;

/// Outcome of the most recent run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// Kind of large payload partitioned into bins
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BinType {
    /// Task output data
    #[serde(rename = "TASKDATABIN")]
    TaskData,
    /// Output data written in subset mode
    #[serde(rename = "SUBSETBIN")]
    Subset,
    /// Fan-out item list
    #[serde(rename = "SUBTASKBIN")]
    Subtask,
}

impl BinType {
    pub const ALL: [BinType; 3] = [BinType::TaskData, BinType::Subset, BinType::Subtask];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskData => "TASKDATABIN",
            Self::Subset => "SUBSETBIN",
            Self::Subtask => "SUBTASKBIN",
        }
    }

    /// Column/attribute prefix for this bin type's manifest
    pub fn field_prefix(&self) -> &'static str {
        match self {
            Self::TaskData => "taskdata",
            Self::Subset => "subset",
            Self::Subtask => "subtask",
        }
    }
}

impl fmt::Display for BinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BinType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown bin type '{}'", s))
    }
}

/// Which version counter a bump targets
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionDimension {
    Outputs,
    OutputData,
}

impl VersionDimension {
    /// Column/attribute holding the counter
    pub fn field(&self) -> &'static str {
        match self {
            Self::Outputs => "outputs_version",
            Self::OutputData => "output_data_version",
        }
    }
}

impl fmt::Display for VersionDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

/// Current version counters of a task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versions {
    pub outputs_version: u64,
    pub output_data_version: u64,
}

impl Versions {
    pub fn get(&self, dimension: VersionDimension) -> u64 {
        match dimension {
            VersionDimension::Outputs => self.outputs_version,
            VersionDimension::OutputData => self.output_data_version,
        }
    }
}

/// Bin count plus a digest of the reassembled payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinManifest {
    pub count: u32,
    pub digest: String,
}

impl BinManifest {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Fingerprints staged by a run decision, committed when the run succeeds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRun {
    pub code_hashes: BTreeMap<String, String>,
    pub input_hashes: BTreeMap<String, String>,
    pub input_data_hashes: BTreeMap<String, u64>,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}

/// One item of a fan-out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub index: usize,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<String>,
}

impl Subtask {
    pub fn new(index: usize, key: impl Into<String>) -> Self {
        Self {
            index,
            key: key.into(),
            start_time: None,
            end_time: None,
            output_hash: None,
        }
    }
}

/// Last-known state of one task in one storage key.
///
/// `code_hashes`, `input_hashes` and `input_data_hashes` are the committed
/// fingerprints of the last successful run. A run in progress keeps its
/// freshly computed fingerprints in `pending` until it succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub storage_key: String,
    pub pipeline: String,
    pub task_id: String,
    #[serde(default)]
    pub code_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub input_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub input_data_hashes: BTreeMap<String, u64>,
    #[serde(default)]
    pub outputs_version: u64,
    #[serde(default)]
    pub output_data_version: u64,
    pub status: Option<TaskStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// When fingerprints were last committed by a successful run
    pub last_success: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub pending: Option<PendingRun>,
    #[serde(default)]
    pub subtask_bins: BinManifest,
    #[serde(default)]
    pub taskdata_bins: BinManifest,
    #[serde(default)]
    pub subset_bins: BinManifest,
}

impl TaskRecord {
    pub fn new(key: &TaskKey) -> Self {
        Self {
            storage_key: key.storage_key.clone(),
            pipeline: key.pipeline.clone(),
            task_id: key.task_id.clone(),
            code_hashes: BTreeMap::new(),
            input_hashes: BTreeMap::new(),
            input_data_hashes: BTreeMap::new(),
            outputs_version: 0,
            output_data_version: 0,
            status: None,
            start_time: None,
            end_time: None,
            last_success: None,
            error: None,
            pending: None,
            subtask_bins: BinManifest::default(),
            taskdata_bins: BinManifest::default(),
            subset_bins: BinManifest::default(),
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(&self.storage_key, &self.pipeline, &self.task_id)
    }

    pub fn versions(&self) -> Versions {
        Versions {
            outputs_version: self.outputs_version,
            output_data_version: self.output_data_version,
        }
    }

    pub fn version(&self, dimension: VersionDimension) -> u64 {
        self.versions().get(dimension)
    }

    pub fn set_version(&mut self, dimension: VersionDimension, value: u64) {
        match dimension {
            VersionDimension::Outputs => self.outputs_version = value,
            VersionDimension::OutputData => self.output_data_version = value,
        }
    }

    pub fn manifest(&self, bin_type: BinType) -> &BinManifest {
        match bin_type {
            BinType::TaskData => &self.taskdata_bins,
            BinType::Subset => &self.subset_bins,
            BinType::Subtask => &self.subtask_bins,
        }
    }

    pub fn manifest_mut(&mut self, bin_type: BinType) -> &mut BinManifest {
        match bin_type {
            BinType::TaskData => &mut self.taskdata_bins,
            BinType::Subset => &mut self.subset_bins,
            BinType::Subtask => &mut self.subtask_bins,
        }
    }

    pub fn subtask_count(&self) -> u32 {
        self.subtask_bins.count
    }

    pub fn taskdata_count(&self) -> u32 {
        self.taskdata_bins.count
    }

    pub fn subset_count(&self) -> u32 {
        self.subset_bins.count
    }

    /// Whether a run ever committed fingerprints for this task
    pub fn has_succeeded(&self) -> bool {
        self.last_success.is_some()
    }

    /// A `running` record with no end time whose start is older than
    /// `threshold` (or unknown) is treated as abandoned.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if self.status != Some(TaskStatus::Running) || self.end_time.is_some() {
            return false;
        }
        match self.start_time {
            Some(started) => now - started > threshold,
            None => true,
        }
    }
}
