//! Process-local store
//!
//! Nothing is persisted. Used in tests and for one-shot dry runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use kptn_core::config::DEFAULT_MAX_BIN_BYTES;

use super::bins::{manifest_for, partition, reassemble};
use super::{StoreResult, TaskStateStore};
use crate::error::StoreError;
use crate::record::{BinManifest, BinType, TaskRecord, VersionDimension};
use crate::task::{Scope, TaskKey};

type BinSet = BTreeMap<u32, Vec<u8>>;

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<TaskKey, TaskRecord>,
    bins: HashMap<(TaskKey, BinType), BinSet>,
}

/// In-memory [`TaskStateStore`]
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    max_bin_bytes: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_bin_bytes: DEFAULT_MAX_BIN_BYTES,
        }
    }

    pub fn with_max_bin_bytes(mut self, max_bin_bytes: usize) -> Self {
        self.max_bin_bytes = max_bin_bytes.max(1);
        self
    }

    /// Number of stored bins of one type for a task
    pub fn bin_count(&self, key: &TaskKey, bin_type: BinType) -> usize {
        self.inner
            .lock()
            .bins
            .get(&(key.clone(), bin_type))
            .map_or(0, BTreeMap::len)
    }

    /// Drop a single bin, leaving the manifest untouched
    pub fn remove_bin(&self, key: &TaskKey, bin_type: BinType, bin_id: u32) -> bool {
        self.inner
            .lock()
            .bins
            .get_mut(&(key.clone(), bin_type))
            .is_some_and(|set| set.remove(&bin_id).is_some())
    }
}

#[async_trait]
impl TaskStateStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &TaskKey) -> StoreResult<Option<TaskRecord>> {
        Ok(self.inner.lock().records.get(key).cloned())
    }

    async fn put(&self, record: &TaskRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let key = record.key();
        let mut stored = record.clone();
        if let Some(existing) = inner.records.get(&key) {
            stored.outputs_version = existing.outputs_version;
            stored.output_data_version = existing.output_data_version;
            stored.subtask_bins = existing.subtask_bins.clone();
            stored.taskdata_bins = existing.taskdata_bins.clone();
            stored.subset_bins = existing.subset_bins.clone();
        }
        inner.records.insert(key, stored);
        Ok(())
    }

    async fn delete(&self, key: &TaskKey) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        for bin_type in BinType::ALL {
            inner.bins.remove(&(key.clone(), bin_type));
        }
        Ok(inner.records.remove(key).is_some())
    }

    async fn list(&self, scope: &Scope) -> StoreResult<Vec<TaskRecord>> {
        let inner = self.inner.lock();
        let mut records: Vec<TaskRecord> = inner
            .records
            .values()
            .filter(|r| r.storage_key == scope.storage_key && r.pipeline == scope.pipeline)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(records)
    }

    async fn compare_and_increment(
        &self,
        key: &TaskKey,
        dimension: VersionDimension,
        expected: u64,
    ) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        let record = inner.records.get_mut(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        if record.version(dimension) != expected {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                dimension,
                expected,
            });
        }
        let next = expected + 1;
        record.set_version(dimension, next);
        Ok(next)
    }

    async fn get_large_payload(
        &self,
        key: &TaskKey,
        bin_type: BinType,
    ) -> StoreResult<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        let Some(record) = inner.records.get(key) else {
            return Ok(None);
        };
        let manifest = record.manifest(bin_type);
        if manifest.is_empty() {
            return Ok(None);
        }
        let bins = inner
            .bins
            .get(&(key.clone(), bin_type))
            .cloned()
            .unwrap_or_default();
        reassemble(key, bin_type, manifest, bins).map(Some)
    }

    async fn put_large_payload(
        &self,
        key: &TaskKey,
        bin_type: BinType,
        payload: &[u8],
    ) -> StoreResult<BinManifest> {
        let mut inner = self.inner.lock();
        if !inner.records.contains_key(key) {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }

        let chunks = partition(payload, self.max_bin_bytes);
        let manifest = manifest_for(payload, chunks.len());
        let bins: BinSet = chunks
            .into_iter()
            .enumerate()
            .map(|(id, chunk)| (id as u32, chunk.to_vec()))
            .collect();
        inner.bins.insert((key.clone(), bin_type), bins);

        if let Some(record) = inner.records.get_mut(key) {
            *record.manifest_mut(bin_type) = manifest.clone();
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TaskKey {
        TaskKey::new("main", "etl", "extract")
    }

    #[tokio::test]
    async fn test_put_preserves_versions() {
        let store = MemoryStore::new();
        store.put(&TaskRecord::new(&key())).await.unwrap();
        store
            .compare_and_increment(&key(), VersionDimension::Outputs, 0)
            .await
            .unwrap();

        let mut overwrite = TaskRecord::new(&key());
        overwrite.error = Some("boom".to_string());
        store.put(&overwrite).await.unwrap();

        let stored = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(stored.outputs_version, 1);
        assert_eq!(stored.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_cas_conflict() {
        let store = MemoryStore::new();
        store.put(&TaskRecord::new(&key())).await.unwrap();

        let err = store
            .compare_and_increment(&key(), VersionDimension::OutputData, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 3, .. }));
    }

    #[tokio::test]
    async fn test_cas_missing_record() {
        let store = MemoryStore::new();
        let err = store
            .compare_and_increment(&key(), VersionDimension::Outputs, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_payload_shrink_replaces_bins() {
        let store = MemoryStore::new().with_max_bin_bytes(2);
        store.put(&TaskRecord::new(&key())).await.unwrap();

        store
            .put_large_payload(&key(), BinType::TaskData, b"0123456789")
            .await
            .unwrap();
        assert_eq!(store.bin_count(&key(), BinType::TaskData), 5);

        let manifest = store
            .put_large_payload(&key(), BinType::TaskData, b"ab")
            .await
            .unwrap();
        assert_eq!(manifest.count, 1);
        assert_eq!(store.bin_count(&key(), BinType::TaskData), 1);
        assert_eq!(
            store.get_large_payload(&key(), BinType::TaskData).await.unwrap(),
            Some(b"ab".to_vec())
        );
    }

    #[tokio::test]
    async fn test_removed_bin_fails_read() {
        let store = MemoryStore::new().with_max_bin_bytes(4);
        store.put(&TaskRecord::new(&key())).await.unwrap();
        store
            .put_large_payload(&key(), BinType::Subtask, b"[1,2,3,4,5,6]")
            .await
            .unwrap();

        assert!(store.remove_bin(&key(), BinType::Subtask, 2));
        let err = store
            .get_large_payload(&key(), BinType::Subtask)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IncompleteBinSet { .. }));
    }
}
