//! Run lifecycle: start, completion, failure and subtask bookkeeping

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::engine::{CacheEngine, Evaluation};
use crate::error::{CacheError, Result, StoreError};
use crate::record::{
    BinType, PendingRun, Subtask, TaskRecord, TaskStatus, VersionDimension, Versions,
};
use crate::reporter::DecisionEvent;
use crate::status::{pair_hashes, TaskStatusView, VersionPair};

impl CacheEngine {
    /// Record the start of a run decided by [`CacheEngine::evaluate`].
    ///
    /// Stages the fresh fingerprints as pending, marks the record running and
    /// bumps the task's counters. A mapped run also stores its subtask list.
    /// Subset runs only touch status and subtasks.
    #[instrument(skip(self, evaluation), fields(task = %evaluation.task))]
    pub async fn begin_run(&self, storage_key: &str, evaluation: &Evaluation) -> Result<()> {
        let Some(fingerprint) = evaluation.fingerprint.as_ref() else {
            return Ok(());
        };
        if !evaluation.decision.should_run() {
            return Ok(());
        }

        let key = self.key(storage_key, &evaluation.task);
        let now = Utc::now();
        let mut record = self
            .store
            .get(&key)
            .await?
            .unwrap_or_else(|| TaskRecord::new(&key));

        record.status = Some(TaskStatus::Running);
        record.start_time = Some(now);
        record.end_time = None;
        record.error = None;
        if !self.options.subset_mode {
            record.pending = Some(PendingRun {
                code_hashes: fingerprint.code_hashes.clone(),
                input_hashes: fingerprint.input_hashes.clone(),
                input_data_hashes: fingerprint.input_data_hashes(),
                reason: evaluation.decision.reason().to_string(),
                decided_at: now,
            });
        }
        self.store.put(&record).await?;

        let mut outputs_version = record.outputs_version;
        if !self.options.subset_mode {
            outputs_version = self.ledger.bump(&key, VersionDimension::Outputs).await?;
            if self.task_config(&evaluation.task)?.produces_data() {
                self.ledger.bump(&key, VersionDimension::OutputData).await?;
            }
        }

        if !evaluation.subtasks.is_empty() {
            let subtasks: Vec<Subtask> = evaluation
                .subtasks
                .iter()
                .cloned()
                .map(|mut subtask| {
                    subtask.start_time = Some(now);
                    subtask
                })
                .collect();
            let payload = serde_json::to_vec(&subtasks)?;
            self.store
                .put_large_payload(&key, BinType::Subtask, &payload)
                .await?;
        }

        self.reporters.broadcast(&DecisionEvent::RunStarted {
            task: evaluation.task.clone(),
            outputs_version,
            array_size: evaluation.decision.array_size(),
        });
        Ok(())
    }

    /// Write an empty record (all counters at zero) if the task has none
    pub(crate) async fn ensure_record(&self, storage_key: &str, task: &str) -> Result<()> {
        let key = self.key(storage_key, task);
        if self.store.get(&key).await?.is_none() {
            self.store.put(&TaskRecord::new(&key)).await?;
            debug!(task, "empty record written for skipped task");
        }
        Ok(())
    }

    /// Record a successful run and commit its staged fingerprints.
    ///
    /// `data` is the task's output payload, written before the record so a
    /// reader never sees a success without its payload.
    #[instrument(skip(self, data))]
    pub async fn mark_succeeded(
        &self,
        storage_key: &str,
        task: &str,
        data: Option<&Value>,
    ) -> Result<Versions> {
        let key = self.key(storage_key, task);
        let mut record = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| CacheError::NoRunInProgress(task.to_string()))?;

        if let Some(data) = data {
            let bin_type = if self.options.subset_mode {
                BinType::Subset
            } else {
                BinType::TaskData
            };
            let payload = serde_json::to_vec(data)?;
            let manifest = self.store.put_large_payload(&key, bin_type, &payload).await?;
            debug!(%bin_type, bins = manifest.count, "data payload stored");
        }

        let now = Utc::now();
        if !self.options.subset_mode {
            let pending = record
                .pending
                .take()
                .ok_or_else(|| CacheError::NoRunInProgress(task.to_string()))?;
            record.code_hashes = pending.code_hashes;
            record.input_hashes = pending.input_hashes;
            record.input_data_hashes = pending.input_data_hashes;
            record.last_success = Some(now);
        }
        record.status = Some(TaskStatus::Succeeded);
        record.end_time = Some(now);
        record.error = None;
        self.store.put(&record).await?;

        let versions = self.ledger.read(&key).await?;
        self.reporters.broadcast(&DecisionEvent::RunSucceeded {
            task: task.to_string(),
            outputs_version: versions.outputs_version,
        });
        Ok(versions)
    }

    /// Record a failed run. Committed fingerprints stay as they were.
    #[instrument(skip(self, error))]
    pub async fn mark_failed(&self, storage_key: &str, task: &str, error: &str) -> Result<()> {
        let key = self.key(storage_key, task);
        let mut record = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| CacheError::NoRunInProgress(task.to_string()))?;

        if record.pending.take().is_none() && record.status != Some(TaskStatus::Running) {
            warn!("failure recorded without a run in progress");
        }
        record.status = Some(TaskStatus::Failed);
        record.end_time = Some(Utc::now());
        record.error = Some(error.to_string());
        self.store.put(&record).await?;

        self.reporters.broadcast(&DecisionEvent::RunFailed {
            task: task.to_string(),
            error: error.to_string(),
        });
        Ok(())
    }

    /// Stamp completion of one fan-out item
    #[instrument(skip(self, output_hash))]
    pub async fn record_subtask(
        &self,
        storage_key: &str,
        task: &str,
        index: usize,
        output_hash: Option<String>,
    ) -> Result<Subtask> {
        let key = self.key(storage_key, task);
        let mut subtasks = self.subtasks(storage_key, task).await?;
        let count = subtasks.len();
        let subtask = subtasks
            .get_mut(index)
            .ok_or_else(|| CacheError::SubtaskOutOfRange {
                task: task.to_string(),
                index,
                count,
            })?;
        subtask.end_time = Some(Utc::now());
        subtask.output_hash = output_hash;
        let updated = subtask.clone();

        let payload = serde_json::to_vec(&subtasks)?;
        self.store
            .put_large_payload(&key, BinType::Subtask, &payload)
            .await?;
        Ok(updated)
    }

    /// Subtask list of the latest fan-out, empty when there is none
    pub async fn subtasks(&self, storage_key: &str, task: &str) -> Result<Vec<Subtask>> {
        let key = self.key(storage_key, task);
        match self.store.get_large_payload(&key, BinType::Subtask).await? {
            Some(payload) => Ok(serde_json::from_slice(&payload)?),
            None => Ok(Vec::new()),
        }
    }

    /// Data payload last written by a task
    pub async fn task_data(&self, storage_key: &str, task: &str) -> Result<Option<Value>> {
        self.task_config(task)?;
        match self.load_payload(&self.key(storage_key, task)).await? {
            Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
            None => Ok(None),
        }
    }

    /// Stored against live state of a task, for display
    pub async fn status(&self, storage_key: &str, task: &str) -> Result<TaskStatusView> {
        let config = self.task_config(task)?;
        let scope = self.scope(storage_key);
        let record = self.store.get(&scope.task(task)).await?;
        let empty = TaskRecord::new(&scope.task(task));
        let stored = record.as_ref().unwrap_or(&empty);

        let live_code = self.hasher.code_hashes(config)?;
        let live_inputs = crate::hasher::ContentHasher::input_hashes(&config.args);

        let mut dependencies = Vec::new();
        for dep in self.graph.dependencies(task)? {
            let dimension = self.graph.node(dep)?.version_dimension();
            let live = match self.ledger.read(&scope.task(dep)).await {
                Ok(versions) => Some(versions.get(dimension)),
                Err(StoreError::NotFound { .. }) => None,
                Err(e) => return Err(e.into()),
            };
            dependencies.push(VersionPair {
                dependency: dep.clone(),
                stored: stored.input_data_hashes.get(dep).copied(),
                live,
            });
        }

        Ok(TaskStatusView::new(
            task,
            record.as_ref(),
            pair_hashes(&stored.code_hashes, &live_code),
            pair_hashes(&stored.input_hashes, &live_inputs),
            dependencies,
        ))
    }

    /// Status of every task, in execution order
    pub async fn status_all(&self, storage_key: &str) -> Result<Vec<TaskStatusView>> {
        let mut views = Vec::with_capacity(self.graph.len());
        for task in self.graph.sorted() {
            views.push(self.status(storage_key, task).await?);
        }
        Ok(views)
    }

    /// Remove one task's record and its bins
    pub async fn forget(&self, storage_key: &str, task: &str) -> Result<bool> {
        self.task_config(task)?;
        let removed = self.store.delete(&self.key(storage_key, task)).await?;
        info!(task, removed, "task record removed");
        Ok(removed)
    }

    /// Remove every record of this pipeline under `storage_key`
    pub async fn clear(&self, storage_key: &str) -> Result<usize> {
        let scope = self.scope(storage_key);
        let removed = self.store.clear(&scope).await?;
        info!(scope = %scope, removed, "cache cleared");
        self.reporters.broadcast(&DecisionEvent::Cleared {
            scope: scope.to_string(),
            removed,
        });
        Ok(removed)
    }
}
