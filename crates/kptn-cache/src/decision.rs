//! Run/skip decisions and the reasons behind them

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why a task runs or is skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reason {
    FirstRun,
    Forced,
    SubsetMode,
    PreviousFailed,
    StaleRun { started: Option<DateTime<Utc>> },
    CodeChanged { files: Vec<String> },
    InputsChanged { args: Vec<String> },
    DependencyChanged { dependencies: Vec<String> },
    UpToDate,
    RunInProgress,
    NotSelected,
    NoItems,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstRun => f.write_str("first run"),
            Self::Forced => f.write_str("forced"),
            Self::SubsetMode => f.write_str("subset mode"),
            Self::PreviousFailed => f.write_str("previous run failed"),
            Self::StaleRun { started: Some(t) } => {
                write!(f, "stale run (started {})", t.to_rfc3339())
            }
            Self::StaleRun { started: None } => f.write_str("stale run"),
            Self::CodeChanged { files } => write!(f, "code changed: {}", files.join(", ")),
            Self::InputsChanged { args } => write!(f, "inputs changed: {}", args.join(", ")),
            Self::DependencyChanged { dependencies } if dependencies.len() == 1 => {
                write!(f, "dependency {} changed", dependencies[0])
            }
            Self::DependencyChanged { dependencies } => {
                write!(f, "dependencies {} changed", dependencies.join(", "))
            }
            Self::UpToDate => f.write_str("up to date"),
            Self::RunInProgress => f.write_str("up to date (run in progress)"),
            Self::NotSelected => f.write_str("task not selected"),
            Self::NoItems => f.write_str("no items to map over"),
        }
    }
}

/// How a running task executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Single,
    Array,
}

/// Outcome of evaluating one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Skip(Reason),
    Run(Reason),
    /// Run once per item of a fan-out
    RunArray { reason: Reason, array_size: usize },
}

impl Decision {
    pub fn should_run(&self) -> bool {
        !matches!(self, Self::Skip(_))
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        match self {
            Self::RunArray { .. } => ExecutionMode::Array,
            _ => ExecutionMode::Single,
        }
    }

    pub fn array_size(&self) -> Option<usize> {
        match self {
            Self::RunArray { array_size, .. } => Some(*array_size),
            _ => None,
        }
    }

    pub fn reason(&self) -> &Reason {
        match self {
            Self::Skip(reason) | Self::Run(reason) | Self::RunArray { reason, .. } => reason,
        }
    }

    /// Structured form handed to orchestrators
    pub fn report(&self, task: &str) -> DecisionReport {
        DecisionReport {
            task_name: task.to_string(),
            should_run: self.should_run(),
            execution_mode: self.execution_mode(),
            array_size: self.array_size(),
            reason: self.reason().to_string(),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip(reason) => write!(f, "skip ({})", reason),
            Self::Run(reason) => write!(f, "run ({})", reason),
            Self::RunArray { reason, array_size } => {
                write!(f, "run x{} ({})", array_size, reason)
            }
        }
    }
}

/// Decision in the shape exchanged with orchestrators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionReport {
    pub task_name: String,
    pub should_run: bool,
    pub execution_mode: ExecutionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub array_size: Option<usize>,
    pub reason: String,
}

/// Tasks selected for this execution; empty selects everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSelection(Vec<String>);

impl TaskSelection {
    pub fn all() -> Self {
        Self::default()
    }

    /// Parse a comma-separated list, ignoring blanks
    pub fn parse(list: &str) -> Self {
        Self(
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn includes(&self, task: &str) -> bool {
        self.0.is_empty() || self.0.iter().any(|t| t == task)
    }

    pub fn is_all(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for TaskSelection {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Inputs of one decision call
#[derive(Debug, Clone, Default)]
pub struct DecideRequest {
    pub task_list: TaskSelection,
    pub ignore_cache: bool,
    /// Runtime values merged over the task's declared args
    pub parameters: BTreeMap<String, Value>,
}

impl DecideRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_list(mut self, task_list: TaskSelection) -> Self {
        self.task_list = task_list;
        self
    }

    pub fn with_ignore_cache(mut self, ignore_cache: bool) -> Self {
        self.ignore_cache = ignore_cache;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, Value>) -> Self {
        self.parameters.extend(parameters);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_reason_text() {
        assert_eq!(Reason::FirstRun.to_string(), "first run");
        assert_eq!(
            Reason::CodeChanged {
                files: vec!["a.py".to_string(), "b.py".to_string()]
            }
            .to_string(),
            "code changed: a.py, b.py"
        );
        assert_eq!(
            Reason::DependencyChanged {
                dependencies: vec!["extract".to_string()]
            }
            .to_string(),
            "dependency extract changed"
        );
        assert_eq!(
            Reason::DependencyChanged {
                dependencies: vec!["a".to_string(), "b".to_string()]
            }
            .to_string(),
            "dependencies a, b changed"
        );
    }

    #[test]
    fn test_report_shape() {
        let decision = Decision::RunArray {
            reason: Reason::FirstRun,
            array_size: 3,
        };
        let json = serde_json::to_value(decision.report("process")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "task_name": "process",
                "should_run": true,
                "execution_mode": "array",
                "array_size": 3,
                "reason": "first run"
            })
        );

        let skip = serde_json::to_value(Decision::Skip(Reason::UpToDate).report("a")).unwrap();
        assert_eq!(skip["should_run"], false);
        assert_eq!(skip["execution_mode"], "single");
        assert!(skip.get("array_size").is_none());
    }

    #[test]
    fn test_task_selection() {
        let selection = TaskSelection::parse(" a, b ,,c");
        assert!(selection.includes("b"));
        assert!(!selection.includes("d"));
        assert!(TaskSelection::parse("").includes("anything"));
    }
}
