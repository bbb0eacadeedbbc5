//! Run/skip decisions for the tasks of one pipeline
//!
//! A decision re-reads the task's record, fingerprints the task's code,
//! declared arguments and upstream versions, and compares them with the
//! fingerprints committed by the last successful run. [`CacheEngine::decide`]
//! also records the start of every run it decides on; see the lifecycle
//! methods in `lifecycle.rs` for the rest of a run.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, instrument};

use kptn_core::{Config, Settings, TaskConfig};

use crate::decision::{DecideRequest, Decision, Reason};
use crate::error::{CacheError, Result};
use crate::graph::{DependencyVersion, PipelineGraph};
use crate::hasher::{CodeHashes, ContentHasher, InputHashes};
use crate::ledger::VersionLedger;
use crate::record::{BinType, Subtask, TaskRecord, TaskStatus};
use crate::reporter::{DecisionEvent, DecisionReporter, DecisionReporterRegistry};
use crate::status::changed_keys;
use crate::store::TaskStateStore;
use crate::task::{Scope, TaskKey};

/// Tunables taken from [`Settings`]
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Age after which an unfinished `running` record counts as abandoned
    pub stale_run_after: chrono::Duration,
    pub max_bump_attempts: u32,
    pub subset_mode: bool,
}

impl From<&Settings> for EngineOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            stale_run_after: chrono::Duration::from_std(settings.stale_run_after())
                .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100)),
            max_bump_attempts: settings.max_bump_attempts,
            subset_mode: settings.subset_mode,
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

/// Live fingerprints of a task at evaluation time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub code_hashes: CodeHashes,
    pub input_hashes: InputHashes,
    pub dependencies: Vec<DependencyVersion>,
}

impl Fingerprint {
    /// Upstream versions in the shape stored on a record
    pub fn input_data_hashes(&self) -> BTreeMap<String, u64> {
        self.dependencies
            .iter()
            .map(|dep| (dep.task.clone(), dep.version))
            .collect()
    }
}

/// Result of evaluating a task, before anything is persisted
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub task: String,
    pub decision: Decision,
    /// Absent when the task was skipped before fingerprinting
    pub fingerprint: Option<Fingerprint>,
    /// Fan-out items of a mapped task
    pub subtasks: Vec<Subtask>,
}

impl Evaluation {
    fn skipped(task: &str, reason: Reason) -> Self {
        Self {
            task: task.to_string(),
            decision: Decision::Skip(reason),
            fingerprint: None,
            subtasks: Vec::new(),
        }
    }
}

/// Cache decision engine for one pipeline
pub struct CacheEngine {
    pub(crate) store: Arc<dyn TaskStateStore>,
    pub(crate) ledger: VersionLedger,
    pub(crate) graph: PipelineGraph,
    pub(crate) tasks: HashMap<String, TaskConfig>,
    pub(crate) hasher: ContentHasher,
    pub(crate) options: EngineOptions,
    pub(crate) reporters: DecisionReporterRegistry,
}

impl CacheEngine {
    /// Load `pipeline` from `config`. Graph errors surface here.
    pub fn new(
        config: &Config,
        pipeline: &str,
        project_root: impl Into<PathBuf>,
        store: Arc<dyn TaskStateStore>,
    ) -> Result<Self> {
        let graph = PipelineGraph::load(config, pipeline)?;
        let tasks = graph
            .task_names()
            .iter()
            .map(|name| (name.clone(), config.task(name).cloned().unwrap_or_default()))
            .collect();
        let options = EngineOptions::from(&config.settings);
        let ledger = VersionLedger::new(store.clone()).with_max_attempts(options.max_bump_attempts);

        Ok(Self {
            store,
            ledger,
            graph,
            tasks,
            hasher: ContentHasher::new(project_root),
            options,
            reporters: DecisionReporterRegistry::new(),
        })
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.ledger = VersionLedger::new(self.store.clone())
            .with_max_attempts(options.max_bump_attempts);
        self.options = options;
        self
    }

    pub fn with_reporter<R: DecisionReporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.register(reporter);
        self
    }

    /// Drop the default tracing reporter
    pub fn without_default_reporters(mut self) -> Self {
        self.reporters = DecisionReporterRegistry::empty();
        self
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    pub fn store(&self) -> &Arc<dyn TaskStateStore> {
        &self.store
    }

    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn pipeline(&self) -> &str {
        self.graph.pipeline()
    }

    pub fn scope(&self, storage_key: &str) -> Scope {
        Scope::new(storage_key, self.graph.pipeline())
    }

    pub(crate) fn key(&self, storage_key: &str, task: &str) -> TaskKey {
        self.scope(storage_key).task(task)
    }

    pub fn task_config(&self, task: &str) -> Result<&TaskConfig> {
        self.tasks
            .get(task)
            .ok_or_else(|| CacheError::UnknownTask(task.to_string()))
    }

    /// Decide whether `task` runs, and record the start of the run if so.
    ///
    /// A task skipped before fingerprinting (not selected, or nothing to map
    /// over) still gets a record, so downstream tasks read its counters.
    #[instrument(skip(self, request), fields(pipeline = %self.graph.pipeline()))]
    pub async fn decide(
        &self,
        storage_key: &str,
        task: &str,
        request: &DecideRequest,
    ) -> Result<Decision> {
        let evaluation = self.evaluate(storage_key, task, request).await?;
        if evaluation.decision.should_run() {
            self.begin_run(storage_key, &evaluation).await?;
        } else if evaluation.fingerprint.is_none() {
            self.ensure_record(storage_key, task).await?;
        }
        self.reporters.broadcast(&DecisionEvent::Decided {
            task: task.to_string(),
            decision: evaluation.decision.clone(),
        });
        Ok(evaluation.decision)
    }

    /// Compute the decision for `task` without persisting anything
    #[instrument(skip(self, request), fields(pipeline = %self.graph.pipeline()))]
    pub async fn evaluate(
        &self,
        storage_key: &str,
        task: &str,
        request: &DecideRequest,
    ) -> Result<Evaluation> {
        let config = self.task_config(task)?;
        let scope = self.scope(storage_key);

        if !request.task_list.includes(task) {
            return Ok(Evaluation::skipped(task, Reason::NotSelected));
        }

        let subtasks = match config.map_over.as_deref() {
            Some(map_over) => {
                let items = self.resolve_fan_out(&scope, task, map_over).await?;
                if items.is_empty() {
                    return Ok(Evaluation::skipped(task, Reason::NoItems));
                }
                items
            }
            None => Vec::new(),
        };

        let fingerprint = self
            .fingerprint(&scope, task, config, &request.parameters)
            .await?;
        let record = self.store.get(&scope.task(task)).await?;
        let decision = self.classify(record.as_ref(), &fingerprint, request.ignore_cache);

        let decision = match decision {
            Decision::Run(reason) if !subtasks.is_empty() => Decision::RunArray {
                reason,
                array_size: subtasks.len(),
            },
            other => other,
        };
        debug!(%decision, "task evaluated");

        Ok(Evaluation {
            task: task.to_string(),
            decision,
            fingerprint: Some(fingerprint),
            subtasks,
        })
    }

    /// Fingerprint code, arguments and upstream versions of `task`.
    ///
    /// Runtime parameters replace declared arguments of the same name;
    /// parameters the task does not declare are ignored.
    pub async fn fingerprint(
        &self,
        scope: &Scope,
        task: &str,
        config: &TaskConfig,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<Fingerprint> {
        let code_hashes = self.hasher.code_hashes(config)?;

        let mut args = config.args.clone();
        for (name, value) in parameters {
            if let Some(arg) = args.get_mut(name) {
                *arg = value.clone();
            }
        }
        let input_hashes = ContentHasher::input_hashes(&args);

        let dependencies = self.graph.live_versions(task, &self.ledger, scope).await?;

        Ok(Fingerprint {
            code_hashes,
            input_hashes,
            dependencies,
        })
    }

    fn classify(
        &self,
        record: Option<&TaskRecord>,
        fingerprint: &Fingerprint,
        ignore_cache: bool,
    ) -> Decision {
        if self.options.subset_mode {
            return Decision::Run(Reason::SubsetMode);
        }
        let Some(record) = record else {
            return Decision::Run(Reason::FirstRun);
        };
        if ignore_cache {
            return Decision::Run(Reason::Forced);
        }
        if record.status == Some(TaskStatus::Failed) {
            return Decision::Run(Reason::PreviousFailed);
        }
        if !record.has_succeeded() {
            return Decision::Run(Reason::FirstRun);
        }

        let files = changed_keys(&record.code_hashes, &fingerprint.code_hashes);
        if !files.is_empty() {
            return Decision::Run(Reason::CodeChanged { files });
        }

        let args = changed_keys(&record.input_hashes, &fingerprint.input_hashes);
        if !args.is_empty() {
            return Decision::Run(Reason::InputsChanged { args });
        }

        let dependencies = changed_dependencies(&record.input_data_hashes, &fingerprint.dependencies);
        if !dependencies.is_empty() {
            return Decision::Run(Reason::DependencyChanged { dependencies });
        }

        if record.is_stale(Utc::now(), self.options.stale_run_after) {
            return Decision::Run(Reason::StaleRun {
                started: record.start_time,
            });
        }
        if record.status == Some(TaskStatus::Running) {
            return Decision::Skip(Reason::RunInProgress);
        }
        Decision::Skip(Reason::UpToDate)
    }

    /// Items a mapped task fans out over, read from the upstream data payload
    async fn resolve_fan_out(
        &self,
        scope: &Scope,
        task: &str,
        map_over: &str,
    ) -> Result<Vec<Subtask>> {
        let source = self.fan_out_source(task, map_over)?;
        let unresolved = |reason: String| CacheError::UnresolvedDependency {
            task: task.to_string(),
            dependency: source.clone(),
            reason,
        };

        let payload = self
            .load_payload(&scope.task(&source))
            .await?
            .ok_or_else(|| unresolved("upstream task has no data payload".to_string()))?;
        let value: Value = serde_json::from_slice(&payload)
            .map_err(|e| unresolved(format!("data payload is not valid JSON: {}", e)))?;
        let Value::Array(items) = value else {
            return Err(unresolved("data payload is not a JSON array".to_string()));
        };

        let width = map_over.split(',').count();
        let subtasks = items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                item_key(item, width)
                    .map(|key| Subtask::new(index, key))
                    .ok_or_else(|| unresolved(format!("item {} is not a {}-tuple", index, width)))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(source = %source, items = subtasks.len(), "fan-out resolved");
        Ok(subtasks)
    }

    /// Upstream task whose payload a mapped task iterates
    fn fan_out_source(&self, task: &str, map_over: &str) -> Result<String> {
        let node = self.graph.node(task)?;
        let producers: Vec<(&String, &TaskConfig)> = node
            .dependencies
            .iter()
            .filter_map(|dep| self.tasks.get(dep).map(|config| (dep, config)))
            .filter(|(_, config)| config.produces_data())
            .collect();

        let named = producers.iter().find(|(dep, config)| {
            config.iterable_item.as_deref() == Some(map_over) || dep.as_str() == map_over
        });
        match (named, producers.as_slice()) {
            (Some((dep, _)), _) => Ok((*dep).clone()),
            (None, [(only, _)]) => Ok((*only).clone()),
            (None, _) => Err(CacheError::UnresolvedDependency {
                task: task.to_string(),
                dependency: map_over.to_string(),
                reason: "no upstream data-producing task exposes this key".to_string(),
            }),
        }
    }

    /// Whole data payload of a task; subset bins win in subset mode
    pub(crate) async fn load_payload(&self, key: &TaskKey) -> Result<Option<Vec<u8>>> {
        if self.options.subset_mode {
            if let Some(payload) = self.store.get_large_payload(key, BinType::Subset).await? {
                return Ok(Some(payload));
            }
        }
        Ok(self.store.get_large_payload(key, BinType::TaskData).await?)
    }
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("pipeline", &self.graph.pipeline())
            .field("store", &self.store.name())
            .field("tasks", &self.tasks.len())
            .field("options", &self.options)
            .finish()
    }
}

/// Upstream tasks whose live version differs from the committed one,
/// plus committed upstreams that are no longer dependencies
fn changed_dependencies(
    stored: &BTreeMap<String, u64>,
    live: &[DependencyVersion],
) -> Vec<String> {
    let mut changed: Vec<String> = live
        .iter()
        .filter(|dep| stored.get(&dep.task) != Some(&dep.version))
        .map(|dep| dep.task.clone())
        .collect();
    changed.extend(
        stored
            .keys()
            .filter(|name| !live.iter().any(|dep| &dep.task == *name))
            .cloned(),
    );
    changed
}

/// Subtask key of one fan-out item; tuples join their members with commas
fn item_key(item: &Value, width: usize) -> Option<String> {
    if width == 1 {
        return Some(scalar_text(item));
    }
    match item {
        Value::Array(members) if members.len() == width => Some(
            members
                .iter()
                .map(scalar_text)
                .collect::<Vec<_>>()
                .join(","),
        ),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::VersionDimension;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_item_key() {
        assert_eq!(item_key(&json!("ca"), 1).as_deref(), Some("ca"));
        assert_eq!(item_key(&json!(7), 1).as_deref(), Some("7"));
        assert_eq!(item_key(&json!(["ca", 2020]), 2).as_deref(), Some("ca,2020"));
        assert_eq!(item_key(&json!(["ca"]), 2), None);
        assert_eq!(item_key(&json!("ca"), 2), None);
    }

    #[test]
    fn test_changed_dependencies() {
        let live = vec![
            DependencyVersion {
                task: "a".to_string(),
                version: 2,
                dimension: VersionDimension::Outputs,
                fan_out: false,
            },
            DependencyVersion {
                task: "b".to_string(),
                version: 1,
                dimension: VersionDimension::OutputData,
                fan_out: false,
            },
        ];
        let stored: BTreeMap<String, u64> =
            [("a".to_string(), 1), ("b".to_string(), 1), ("gone".to_string(), 4)]
                .into_iter()
                .collect();

        assert_eq!(changed_dependencies(&stored, &live), vec!["a", "gone"]);
    }

    #[test]
    fn test_options_from_settings() {
        let settings = Settings {
            stale_run_after_secs: 60,
            subset_mode: true,
            ..Settings::default()
        };
        let options = EngineOptions::from(&settings);
        assert_eq!(options.stale_run_after, chrono::Duration::seconds(60));
        assert!(options.subset_mode);
        assert_eq!(
            EngineOptions::default().stale_run_after,
            chrono::Duration::hours(6)
        );
    }
}
