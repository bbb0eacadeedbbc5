//! Task state store
//!
//! [`TaskStateStore`] is the contract every backend implements. A backend
//! persists [`TaskRecord`]s keyed by (storage key, pipeline, task) and the
//! binned large payloads hanging off them. Callers never talk to a concrete
//! backend: they hold an `Arc<dyn TaskStateStore>` produced by [`open_store`].
//!
//! # Versions
//!
//! Version counters only move through
//! [`compare_and_increment`](TaskStateStore::compare_and_increment), which is
//! atomic per record. [`put`](TaskStateStore::put) writes every other field
//! and leaves the counters (and bin manifests) of an existing record alone.
//!
//! # Bins
//!
//! A large payload is split into ordered bins of at most `max_bin_bytes`.
//! The owning record carries a [`BinManifest`] per bin type; a read that
//! cannot reproduce the manifest's digest fails with
//! [`StoreError::IncompleteBinSet`] rather than returning partial data.

pub mod bins;
#[cfg(feature = "dynamodb")]
pub mod dynamodb;
pub mod memory;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use kptn_core::{DbKind, Settings};

use crate::error::StoreError;
use crate::record::{BinManifest, BinType, TaskRecord, VersionDimension};
use crate::task::{Scope, TaskKey};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[cfg(feature = "dynamodb")]
pub use dynamodb::DynamoDbStore;

/// Result of store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence backend for task records and their bins.
///
/// Implementations must be `Send + Sync`; one store is shared by every
/// concurrent caller in a process.
#[async_trait]
pub trait TaskStateStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Fetch a record, `None` when absent
    async fn get(&self, key: &TaskKey) -> StoreResult<Option<TaskRecord>>;

    /// Create or update a record.
    ///
    /// On an existing record the version counters and bin manifests are
    /// preserved; on a new record they are written as given.
    async fn put(&self, record: &TaskRecord) -> StoreResult<()>;

    /// Delete a record together with all of its bins.
    ///
    /// Bins go first so no orphan survives a failure halfway through.
    /// Returns whether a record existed.
    async fn delete(&self, key: &TaskKey) -> StoreResult<bool>;

    /// All records of one pipeline under one storage key
    async fn list(&self, scope: &Scope) -> StoreResult<Vec<TaskRecord>>;

    /// Delete every record (and bin) of a scope, returning how many records went
    async fn clear(&self, scope: &Scope) -> StoreResult<usize> {
        let records = self.list(scope).await?;
        let mut removed = 0;
        for record in records {
            if self.delete(&record.key()).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Atomically replace `dimension` with `expected + 1` if it still equals
    /// `expected`.
    ///
    /// Fails with [`StoreError::VersionConflict`] when another writer got
    /// there first, and [`StoreError::NotFound`] when there is no record.
    async fn compare_and_increment(
        &self,
        key: &TaskKey,
        dimension: VersionDimension,
        expected: u64,
    ) -> StoreResult<u64>;

    /// Reassemble a binned payload. `None` when the record is missing or has
    /// no bins of this type.
    async fn get_large_payload(
        &self,
        key: &TaskKey,
        bin_type: BinType,
    ) -> StoreResult<Option<Vec<u8>>>;

    /// Replace a binned payload and update the record's manifest.
    ///
    /// Requires an existing record. Always writes at least one bin, so an
    /// empty payload is distinguishable from no payload.
    async fn put_large_payload(
        &self,
        key: &TaskKey,
        bin_type: BinType,
        payload: &[u8],
    ) -> StoreResult<BinManifest>;
}

/// Open the store selected by `settings.db`.
///
/// Relative SQLite paths resolve against `project_root`.
pub async fn open_store(
    settings: &Settings,
    project_root: &Path,
) -> StoreResult<Arc<dyn TaskStateStore>> {
    let store: Arc<dyn TaskStateStore> = match settings.db {
        DbKind::Memory => Arc::new(MemoryStore::new().with_max_bin_bytes(settings.max_bin_bytes)),
        DbKind::Sqlite => {
            let path = if settings.db_path.is_absolute() {
                settings.db_path.clone()
            } else {
                project_root.join(&settings.db_path)
            };
            Arc::new(SqliteStore::new(&path)?.with_max_bin_bytes(settings.max_bin_bytes))
        }
        DbKind::Dynamodb => open_dynamodb(settings).await?,
    };
    info!(backend = store.name(), "task state store opened");
    Ok(store)
}

#[cfg(feature = "dynamodb")]
async fn open_dynamodb(settings: &Settings) -> StoreResult<Arc<dyn TaskStateStore>> {
    let store = DynamoDbStore::from_env(&settings.table_name)
        .await
        .with_max_bin_bytes(settings.max_bin_bytes);
    Ok(Arc::new(store))
}

#[cfg(not(feature = "dynamodb"))]
async fn open_dynamodb(_settings: &Settings) -> StoreResult<Arc<dyn TaskStateStore>> {
    Err(StoreError::backend(
        "the dynamodb backend is not compiled in; rebuild with --features dynamodb",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_memory_store() {
        let temp = TempDir::new().unwrap();
        let settings = Settings {
            db: DbKind::Memory,
            ..Settings::default()
        };
        let store = open_store(&settings, temp.path()).await.unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[tokio::test]
    async fn test_open_sqlite_relative_to_root() {
        let temp = TempDir::new().unwrap();
        let settings = Settings::default();
        let store = open_store(&settings, temp.path()).await.unwrap();
        assert_eq!(store.name(), "sqlite");
        assert!(temp.path().join(&settings.db_path).exists());
    }

    #[cfg(not(feature = "dynamodb"))]
    #[tokio::test]
    async fn test_dynamodb_requires_feature() {
        let temp = TempDir::new().unwrap();
        let settings = Settings {
            db: DbKind::Dynamodb,
            ..Settings::default()
        };
        let err = open_store(&settings, temp.path()).await.err().unwrap();
        assert!(err.to_string().contains("--features dynamodb"));
    }
}
