//! Task identity within a storage key

use std::fmt;

use serde::{Deserialize, Serialize};

/// Storage scope for one pipeline: the storage key (usually the branch)
/// plus the pipeline name.
///
/// A scope is passed explicitly into every store call; nothing in this crate
/// holds a "current" storage key.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub storage_key: String,
    pub pipeline: String,
}

impl Scope {
    pub fn new(storage_key: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self {
            storage_key: storage_key.into(),
            pipeline: pipeline.into(),
        }
    }

    /// Key of a task inside this scope
    pub fn task(&self, task_id: impl Into<String>) -> TaskKey {
        TaskKey {
            storage_key: self.storage_key.clone(),
            pipeline: self.pipeline.clone(),
            task_id: task_id.into(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.storage_key, self.pipeline)
    }
}

/// Primary key of a task record: (storage_key, pipeline, task_id)
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub storage_key: String,
    pub pipeline: String,
    pub task_id: String,
}

impl TaskKey {
    pub fn new(
        storage_key: impl Into<String>,
        pipeline: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        Self {
            storage_key: storage_key.into(),
            pipeline: pipeline.into(),
            task_id: task_id.into(),
        }
    }

    /// Parse a key from "storage_key/pipeline/task" format
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(k), Some(p), Some(t)) if !k.is_empty() && !p.is_empty() && !t.is_empty() => {
                Some(Self::new(k, p, t))
            }
            _ => None,
        }
    }

    pub fn scope(&self) -> Scope {
        Scope::new(&self.storage_key, &self.pipeline)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.storage_key, self.pipeline, self.task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_key_display() {
        let key = TaskKey::new("main", "etl", "extract");
        assert_eq!(key.to_string(), "main/etl/extract");
    }

    #[test]
    fn test_task_key_parse() {
        let key = TaskKey::parse("feature-x/etl/load").unwrap();
        assert_eq!(key.storage_key, "feature-x");
        assert_eq!(key.pipeline, "etl");
        assert_eq!(key.task_id, "load");

        assert!(TaskKey::parse("etl/load").is_none());
        assert!(TaskKey::parse("a//b").is_none());
    }

    #[test]
    fn test_scope_task() {
        let scope = Scope::new("main", "etl");
        let key = scope.task("extract");
        assert_eq!(key.scope(), scope);
        assert_eq!(scope.to_string(), "main/etl");
    }
}
