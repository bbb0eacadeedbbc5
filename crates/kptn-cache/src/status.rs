//! Read-only projections of task state for display

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::record::{TaskRecord, TaskStatus};

/// Stored and live value of one fingerprint entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashPair {
    pub name: String,
    pub stored: Option<String>,
    pub live: Option<String>,
}

impl HashPair {
    pub fn changed(&self) -> bool {
        self.stored != self.live
    }
}

/// Stored and live version of one upstream task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionPair {
    pub dependency: String,
    pub stored: Option<u64>,
    /// `None` when the upstream task has never been evaluated
    pub live: Option<u64>,
}

impl VersionPair {
    pub fn changed(&self) -> bool {
        self.stored != self.live
    }
}

/// Everything known about one task, stored next to live
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusView {
    pub task: String,
    pub status: Option<TaskStatus>,
    pub outputs_version: u64,
    pub output_data_version: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub code: Vec<HashPair>,
    pub inputs: Vec<HashPair>,
    pub dependencies: Vec<VersionPair>,
    pub subtask_count: u32,
    pub has_data: bool,
}

impl TaskStatusView {
    pub(crate) fn new(
        task: &str,
        record: Option<&TaskRecord>,
        code: Vec<HashPair>,
        inputs: Vec<HashPair>,
        dependencies: Vec<VersionPair>,
    ) -> Self {
        Self {
            task: task.to_string(),
            status: record.and_then(|r| r.status),
            outputs_version: record.map_or(0, |r| r.outputs_version),
            output_data_version: record.map_or(0, |r| r.output_data_version),
            start_time: record.and_then(|r| r.start_time),
            end_time: record.and_then(|r| r.end_time),
            last_success: record.and_then(|r| r.last_success),
            error: record.and_then(|r| r.error.clone()),
            code,
            inputs,
            dependencies,
            subtask_count: record.map_or(0, TaskRecord::subtask_count),
            has_data: record.is_some_and(|r| r.taskdata_count() > 0 || r.subset_count() > 0),
        }
    }

    pub fn changed_code(&self) -> Vec<&str> {
        changed_names(&self.code)
    }

    pub fn changed_inputs(&self) -> Vec<&str> {
        changed_names(&self.inputs)
    }

    pub fn changed_dependencies(&self) -> Vec<&str> {
        self.dependencies
            .iter()
            .filter(|pair| pair.changed())
            .map(|pair| pair.dependency.as_str())
            .collect()
    }

    /// Committed fingerprints match everything live
    pub fn is_current(&self) -> bool {
        self.last_success.is_some()
            && self.changed_code().is_empty()
            && self.changed_inputs().is_empty()
            && self.changed_dependencies().is_empty()
    }
}

fn changed_names(pairs: &[HashPair]) -> Vec<&str> {
    pairs
        .iter()
        .filter(|pair| pair.changed())
        .map(|pair| pair.name.as_str())
        .collect()
}

/// Pair up two fingerprint maps over the union of their keys
pub fn pair_hashes(
    stored: &BTreeMap<String, String>,
    live: &BTreeMap<String, String>,
) -> Vec<HashPair> {
    let names: BTreeSet<&String> = stored.keys().chain(live.keys()).collect();
    names
        .into_iter()
        .map(|name| HashPair {
            name: name.clone(),
            stored: stored.get(name).cloned(),
            live: live.get(name).cloned(),
        })
        .collect()
}

/// Keys that were added, removed or changed between two fingerprint maps
pub(crate) fn changed_keys(
    stored: &BTreeMap<String, String>,
    live: &BTreeMap<String, String>,
) -> Vec<String> {
    pair_hashes(stored, live)
        .into_iter()
        .filter(HashPair::changed)
        .map(|pair| pair.name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_pair_hashes_union() {
        let stored = map(&[("a.py", "1"), ("b.py", "2")]);
        let live = map(&[("b.py", "3"), ("c.py", "4")]);

        let pairs = pair_hashes(&stored, &live);
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].live, None);
        assert_eq!(pairs[2].stored, None);
        assert_eq!(changed_keys(&stored, &live), vec!["a.py", "b.py", "c.py"]);
    }

    #[test]
    fn test_unchanged_maps() {
        let hashes = map(&[("a.py", "1")]);
        assert!(changed_keys(&hashes, &hashes.clone()).is_empty());
    }

    #[test]
    fn test_view_without_record() {
        let view = TaskStatusView::new(
            "extract",
            None,
            pair_hashes(&BTreeMap::new(), &map(&[("a.py", "1")])),
            Vec::new(),
            vec![VersionPair {
                dependency: "seed".to_string(),
                stored: None,
                live: Some(2),
            }],
        );

        assert!(view.status.is_none());
        assert_eq!(view.changed_code(), vec!["a.py"]);
        assert_eq!(view.changed_dependencies(), vec!["seed"]);
        assert!(!view.is_current());
    }
}
