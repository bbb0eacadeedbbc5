//! Local SQLite store
//!
//! One `tasks` row per task record, with hash maps and the staged run kept
//! as JSON text. Bins live in their own table with a cascading foreign key
//! back to the owning row, so deleting a record can never orphan its bins.
//!
//! Queries run on tokio's blocking pool behind a single connection mutex.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use kptn_core::config::DEFAULT_MAX_BIN_BYTES;

use super::bins::{manifest_for, partition, reassemble};
use super::{StoreResult, TaskStateStore};
use crate::error::StoreError;
use crate::record::{BinManifest, BinType, PendingRun, TaskRecord, TaskStatus, VersionDimension};
use crate::task::{Scope, TaskKey};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    storage_key TEXT NOT NULL,
    pipeline TEXT NOT NULL,
    task_id TEXT NOT NULL,
    code_hashes TEXT NOT NULL DEFAULT '{}',
    input_hashes TEXT NOT NULL DEFAULT '{}',
    input_data_hashes TEXT NOT NULL DEFAULT '{}',
    outputs_version INTEGER NOT NULL DEFAULT 0,
    output_data_version INTEGER NOT NULL DEFAULT 0,
    status TEXT,
    start_time TEXT,
    end_time TEXT,
    last_success TEXT,
    error TEXT,
    pending TEXT,
    subtask_count INTEGER NOT NULL DEFAULT 0,
    subtask_digest TEXT NOT NULL DEFAULT '',
    taskdata_count INTEGER NOT NULL DEFAULT 0,
    taskdata_digest TEXT NOT NULL DEFAULT '',
    subset_count INTEGER NOT NULL DEFAULT 0,
    subset_digest TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL,
    PRIMARY KEY (storage_key, pipeline, task_id)
);

CREATE TABLE IF NOT EXISTS bins (
    storage_key TEXT NOT NULL,
    pipeline TEXT NOT NULL,
    task_id TEXT NOT NULL,
    bin_type TEXT NOT NULL,
    bin_id INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (storage_key, pipeline, task_id, bin_type, bin_id),
    FOREIGN KEY (storage_key, pipeline, task_id)
        REFERENCES tasks (storage_key, pipeline, task_id) ON DELETE CASCADE
);
"#;

const RECORD_COLUMNS: &str = "storage_key, pipeline, task_id, code_hashes, input_hashes, \
     input_data_hashes, outputs_version, output_data_version, status, start_time, end_time, \
     last_success, error, pending, subtask_count, subtask_digest, taskdata_count, \
     taskdata_digest, subset_count, subset_digest";

/// Columns of one `tasks` row before JSON decoding
struct RecordRow {
    storage_key: String,
    pipeline: String,
    task_id: String,
    code_hashes: String,
    input_hashes: String,
    input_data_hashes: String,
    outputs_version: i64,
    output_data_version: i64,
    status: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    error: Option<String>,
    pending: Option<String>,
    manifests: [(i64, String); 3],
}

impl RecordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            storage_key: row.get(0)?,
            pipeline: row.get(1)?,
            task_id: row.get(2)?,
            code_hashes: row.get(3)?,
            input_hashes: row.get(4)?,
            input_data_hashes: row.get(5)?,
            outputs_version: row.get(6)?,
            output_data_version: row.get(7)?,
            status: row.get(8)?,
            start_time: row.get(9)?,
            end_time: row.get(10)?,
            last_success: row.get(11)?,
            error: row.get(12)?,
            pending: row.get(13)?,
            manifests: [
                (row.get(14)?, row.get(15)?),
                (row.get(16)?, row.get(17)?),
                (row.get(18)?, row.get(19)?),
            ],
        })
    }

    fn into_record(self) -> StoreResult<TaskRecord> {
        let key = format!("{}/{}/{}", self.storage_key, self.pipeline, self.task_id);
        let corrupt = |message: String| StoreError::Corrupt {
            key: key.clone(),
            message,
        };

        let status = self
            .status
            .as_deref()
            .map(str::parse::<TaskStatus>)
            .transpose()
            .map_err(&corrupt)?;
        let pending = self
            .pending
            .as_deref()
            .map(serde_json::from_str::<PendingRun>)
            .transpose()
            .map_err(|e| corrupt(format!("pending: {}", e)))?;
        let [subtask, taskdata, subset] = self.manifests.map(|(count, digest)| BinManifest {
            count: count as u32,
            digest,
        });

        Ok(TaskRecord {
            code_hashes: serde_json::from_str(&self.code_hashes)
                .map_err(|e| corrupt(format!("code_hashes: {}", e)))?,
            input_hashes: serde_json::from_str(&self.input_hashes)
                .map_err(|e| corrupt(format!("input_hashes: {}", e)))?,
            input_data_hashes: serde_json::from_str(&self.input_data_hashes)
                .map_err(|e| corrupt(format!("input_data_hashes: {}", e)))?,
            storage_key: self.storage_key,
            pipeline: self.pipeline,
            task_id: self.task_id,
            outputs_version: self.outputs_version as u64,
            output_data_version: self.output_data_version as u64,
            status,
            start_time: self.start_time,
            end_time: self.end_time,
            last_success: self.last_success,
            error: self.error,
            pending,
            subtask_bins: subtask,
            taskdata_bins: taskdata,
            subset_bins: subset,
        })
    }
}

/// SQLite-backed [`TaskStateStore`]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    max_bin_bytes: usize,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn new(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend {
                message: format!("cannot create {}", parent.display()),
                source: Some(Box::new(e)),
            })?;
        }
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        info!("task state store initialized at {:?}", path);
        Ok(Self::from_connection(conn))
    }

    /// Create in-memory storage (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn with_max_bin_bytes(mut self, max_bin_bytes: usize) -> Self {
        self.max_bin_bytes = max_bin_bytes.max(1);
        self
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            max_bin_bytes: DEFAULT_MAX_BIN_BYTES,
        }
    }

    fn init(conn: &Connection) -> StoreResult<()> {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "sqlite journal mode");
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Run `f` against the connection on the blocking thread pool
    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut conn.lock()))
            .await
            .map_err(|e| StoreError::Backend {
                message: "sqlite worker task failed".to_string(),
                source: Some(Box::new(e)),
            })?
    }

    fn fetch(conn: &Connection, key: &TaskKey) -> StoreResult<Option<TaskRecord>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE storage_key = ?1 AND pipeline = ?2 AND task_id = ?3",
            RECORD_COLUMNS
        );
        let row = conn
            .query_row(
                &sql,
                params![key.storage_key, key.pipeline, key.task_id],
                RecordRow::from_row,
            )
            .optional()?;
        row.map(RecordRow::into_record).transpose()
    }

    fn exists(conn: &Connection, key: &TaskKey) -> StoreResult<bool> {
        let found = conn
            .query_row(
                "SELECT 1 FROM tasks WHERE storage_key = ?1 AND pipeline = ?2 AND task_id = ?3",
                params![key.storage_key, key.pipeline, key.task_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl TaskStateStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &TaskKey) -> StoreResult<Option<TaskRecord>> {
        let key = key.clone();
        self.blocking(move |conn| Self::fetch(conn, &key)).await
    }

    async fn put(&self, record: &TaskRecord) -> StoreResult<()> {
        let code_hashes = serde_json::to_string(&record.code_hashes)?;
        let input_hashes = serde_json::to_string(&record.input_hashes)?;
        let input_data_hashes = serde_json::to_string(&record.input_data_hashes)?;
        let pending = record
            .pending
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let record = record.clone();

        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO tasks (
                    storage_key, pipeline, task_id, code_hashes, input_hashes, input_data_hashes,
                    outputs_version, output_data_version, status, start_time, end_time,
                    last_success, error, pending, subtask_count, subtask_digest, taskdata_count,
                    taskdata_digest, subset_count, subset_digest, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
                ON CONFLICT (storage_key, pipeline, task_id) DO UPDATE SET
                    code_hashes = excluded.code_hashes,
                    input_hashes = excluded.input_hashes,
                    input_data_hashes = excluded.input_data_hashes,
                    status = excluded.status,
                    start_time = excluded.start_time,
                    end_time = excluded.end_time,
                    last_success = excluded.last_success,
                    error = excluded.error,
                    pending = excluded.pending,
                    updated_at = excluded.updated_at",
                params![
                    record.storage_key,
                    record.pipeline,
                    record.task_id,
                    code_hashes,
                    input_hashes,
                    input_data_hashes,
                    record.outputs_version as i64,
                    record.output_data_version as i64,
                    record.status.map(|s| s.as_str()),
                    record.start_time,
                    record.end_time,
                    record.last_success,
                    record.error,
                    pending,
                    record.subtask_bins.count,
                    record.subtask_bins.digest,
                    record.taskdata_bins.count,
                    record.taskdata_bins.digest,
                    record.subset_bins.count,
                    record.subset_bins.digest,
                    Utc::now(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &TaskKey) -> StoreResult<bool> {
        let key = key.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM bins WHERE storage_key = ?1 AND pipeline = ?2 AND task_id = ?3",
                params![key.storage_key, key.pipeline, key.task_id],
            )?;
            let removed = tx.execute(
                "DELETE FROM tasks WHERE storage_key = ?1 AND pipeline = ?2 AND task_id = ?3",
                params![key.storage_key, key.pipeline, key.task_id],
            )?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }

    async fn list(&self, scope: &Scope) -> StoreResult<Vec<TaskRecord>> {
        let scope = scope.clone();
        self.blocking(move |conn| {
            let sql = format!(
                "SELECT {} FROM tasks WHERE storage_key = ?1 AND pipeline = ?2 ORDER BY task_id",
                RECORD_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![scope.storage_key, scope.pipeline], RecordRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(RecordRow::into_record).collect()
        })
        .await
    }

    async fn clear(&self, scope: &Scope) -> StoreResult<usize> {
        let scope = scope.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM bins WHERE storage_key = ?1 AND pipeline = ?2",
                params![scope.storage_key, scope.pipeline],
            )?;
            let removed = tx.execute(
                "DELETE FROM tasks WHERE storage_key = ?1 AND pipeline = ?2",
                params![scope.storage_key, scope.pipeline],
            )?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn compare_and_increment(
        &self,
        key: &TaskKey,
        dimension: VersionDimension,
        expected: u64,
    ) -> StoreResult<u64> {
        let key = key.clone();
        self.blocking(move |conn| {
            let column = dimension.field();
            let updated = conn.execute(
                &format!(
                    "UPDATE tasks SET {column} = {column} + 1, updated_at = ?5 \
                     WHERE storage_key = ?1 AND pipeline = ?2 AND task_id = ?3 AND {column} = ?4"
                ),
                params![
                    key.storage_key,
                    key.pipeline,
                    key.task_id,
                    expected as i64,
                    Utc::now()
                ],
            )?;

            if updated == 1 {
                return Ok(expected + 1);
            }
            if Self::exists(conn, &key)? {
                Err(StoreError::VersionConflict {
                    key: key.to_string(),
                    dimension,
                    expected,
                })
            } else {
                Err(StoreError::NotFound {
                    key: key.to_string(),
                })
            }
        })
        .await
    }

    async fn get_large_payload(
        &self,
        key: &TaskKey,
        bin_type: BinType,
    ) -> StoreResult<Option<Vec<u8>>> {
        let key = key.clone();
        self.blocking(move |conn| {
            let Some(record) = Self::fetch(conn, &key)? else {
                return Ok(None);
            };
            let manifest = record.manifest(bin_type);
            if manifest.is_empty() {
                return Ok(None);
            }

            let mut stmt = conn.prepare(
                "SELECT bin_id, data FROM bins
                 WHERE storage_key = ?1 AND pipeline = ?2 AND task_id = ?3 AND bin_type = ?4
                   AND bin_id < ?5
                 ORDER BY bin_id",
            )?;
            let bins = stmt
                .query_map(
                    params![
                        key.storage_key,
                        key.pipeline,
                        key.task_id,
                        bin_type.as_str(),
                        manifest.count
                    ],
                    |row| Ok((row.get::<_, u32>(0)?, row.get::<_, Vec<u8>>(1)?)),
                )?
                .collect::<Result<BTreeMap<_, _>, _>>()?;

            reassemble(&key, bin_type, manifest, bins).map(Some)
        })
        .await
    }

    async fn put_large_payload(
        &self,
        key: &TaskKey,
        bin_type: BinType,
        payload: &[u8],
    ) -> StoreResult<BinManifest> {
        let key = key.clone();
        let payload = payload.to_vec();
        let max_bin_bytes = self.max_bin_bytes;

        self.blocking(move |conn| {
            let chunks = partition(&payload, max_bin_bytes);
            let manifest = manifest_for(&payload, chunks.len());

            let tx = conn.transaction()?;
            if !Self::exists(&tx, &key)? {
                return Err(StoreError::NotFound {
                    key: key.to_string(),
                });
            }

            tx.execute(
                "DELETE FROM bins
                 WHERE storage_key = ?1 AND pipeline = ?2 AND task_id = ?3 AND bin_type = ?4",
                params![key.storage_key, key.pipeline, key.task_id, bin_type.as_str()],
            )?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO bins (storage_key, pipeline, task_id, bin_type, bin_id, data)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for (id, chunk) in chunks.iter().enumerate() {
                    insert.execute(params![
                        key.storage_key,
                        key.pipeline,
                        key.task_id,
                        bin_type.as_str(),
                        id as u32,
                        chunk
                    ])?;
                }
            }

            let prefix = bin_type.field_prefix();
            tx.execute(
                &format!(
                    "UPDATE tasks SET {prefix}_count = ?4, {prefix}_digest = ?5, updated_at = ?6 \
                     WHERE storage_key = ?1 AND pipeline = ?2 AND task_id = ?3"
                ),
                params![
                    key.storage_key,
                    key.pipeline,
                    key.task_id,
                    manifest.count,
                    manifest.digest,
                    Utc::now()
                ],
            )?;
            tx.commit()?;

            debug!(key = %key, bin_type = %bin_type, bins = manifest.count, "payload written");
            Ok(manifest)
        })
        .await
    }
}
