//! Per-task version counters
//!
//! Counters only move forward, one conditional increment at a time. A bump
//! that loses a race re-reads the current value and tries again; concurrent
//! bumps therefore all land and each returns a distinct value.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use kptn_core::config::DEFAULT_MAX_BUMP_ATTEMPTS;

use crate::error::StoreError;
use crate::record::{VersionDimension, Versions};
use crate::store::{StoreResult, TaskStateStore};
use crate::task::TaskKey;

/// Atomic version bumps on top of a [`TaskStateStore`]
#[derive(Clone)]
pub struct VersionLedger {
    store: Arc<dyn TaskStateStore>,
    max_attempts: u32,
}

impl VersionLedger {
    pub fn new(store: Arc<dyn TaskStateStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_BUMP_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Increment one counter and return its new value.
    ///
    /// The record must exist. Gives up with
    /// [`StoreError::StaleBackingStore`] after `max_attempts` lost races.
    #[instrument(skip(self, key), fields(task = %key))]
    pub async fn bump(&self, key: &TaskKey, dimension: VersionDimension) -> StoreResult<u64> {
        for attempt in 1..=self.max_attempts {
            let current = self.read(key).await?.get(dimension);
            match self.store.compare_and_increment(key, dimension, current).await {
                Ok(version) => {
                    debug!(%dimension, version, attempt, "version bumped");
                    return Ok(version);
                }
                Err(StoreError::VersionConflict { .. }) => {
                    debug!(%dimension, expected = current, attempt, "version bump lost a race");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }

        warn!(%dimension, attempts = self.max_attempts, "version bump retries exhausted");
        Err(StoreError::StaleBackingStore {
            key: key.to_string(),
            dimension,
            attempts: self.max_attempts,
        })
    }

    /// Current counters, without mutation
    pub async fn read(&self, key: &TaskKey) -> StoreResult<Versions> {
        self.store
            .get(key)
            .await?
            .map(|record| record.versions())
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }
}

impl std::fmt::Debug for VersionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionLedger")
            .field("store", &self.store.name())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BinManifest, BinType, TaskRecord};
    use crate::store::MemoryStore;
    use crate::task::Scope;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key() -> TaskKey {
        TaskKey::new("main", "etl", "extract")
    }

    async fn ledger_with_record() -> VersionLedger {
        let store = Arc::new(MemoryStore::new());
        store.put(&TaskRecord::new(&key())).await.unwrap();
        VersionLedger::new(store)
    }

    #[tokio::test]
    async fn test_bump_increments() {
        let ledger = ledger_with_record().await;
        assert_eq!(ledger.bump(&key(), VersionDimension::Outputs).await.unwrap(), 1);
        assert_eq!(ledger.bump(&key(), VersionDimension::Outputs).await.unwrap(), 2);
        assert_eq!(ledger.bump(&key(), VersionDimension::OutputData).await.unwrap(), 1);

        let versions = ledger.read(&key()).await.unwrap();
        assert_eq!(versions.outputs_version, 2);
        assert_eq!(versions.output_data_version, 1);
    }

    #[tokio::test]
    async fn test_read_missing_record() {
        let ledger = VersionLedger::new(Arc::new(MemoryStore::new()));
        let err = ledger.read(&key()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    /// Store whose conditional increment always loses
    struct AlwaysConflicting {
        inner: MemoryStore,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl TaskStateStore for AlwaysConflicting {
        fn name(&self) -> &'static str {
            "conflicting"
        }

        async fn get(&self, key: &TaskKey) -> StoreResult<Option<TaskRecord>> {
            self.inner.get(key).await
        }

        async fn put(&self, record: &TaskRecord) -> StoreResult<()> {
            self.inner.put(record).await
        }

        async fn delete(&self, key: &TaskKey) -> StoreResult<bool> {
            self.inner.delete(key).await
        }

        async fn list(&self, scope: &Scope) -> StoreResult<Vec<TaskRecord>> {
            self.inner.list(scope).await
        }

        async fn compare_and_increment(
            &self,
            key: &TaskKey,
            dimension: VersionDimension,
            expected: u64,
        ) -> StoreResult<u64> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::VersionConflict {
                key: key.to_string(),
                dimension,
                expected,
            })
        }

        async fn get_large_payload(
            &self,
            key: &TaskKey,
            bin_type: BinType,
        ) -> StoreResult<Option<Vec<u8>>> {
            self.inner.get_large_payload(key, bin_type).await
        }

        async fn put_large_payload(
            &self,
            key: &TaskKey,
            bin_type: BinType,
            payload: &[u8],
        ) -> StoreResult<BinManifest> {
            self.inner.put_large_payload(key, bin_type, payload).await
        }
    }

    #[tokio::test]
    async fn test_bump_gives_up_after_budget() {
        let store = Arc::new(AlwaysConflicting {
            inner: MemoryStore::new(),
            attempts: AtomicU32::new(0),
        });
        store.put(&TaskRecord::new(&key())).await.unwrap();

        let ledger = VersionLedger::new(store.clone()).with_max_attempts(3);
        let err = ledger.bump(&key(), VersionDimension::Outputs).await.unwrap_err();
        assert!(matches!(err, StoreError::StaleBackingStore { attempts: 3, .. }));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_bumps_are_distinct() {
        let ledger = ledger_with_record().await.with_max_attempts(64);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.bump(&key(), VersionDimension::Outputs).await })
            })
            .collect();

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap().unwrap());
        }
        values.sort_unstable();
        assert_eq!(values, (1..=16).collect::<Vec<u64>>());
    }
}
