//! DynamoDB store
//!
//! Single-table design:
//!
//! | Item        | `PK`                                           | `SK`                         |
//! |-------------|------------------------------------------------|------------------------------|
//! | task record | `BRANCH#<storage_key>`                         | `PIPELINE#<p>#TASK#<task>`   |
//! | bin         | `BRANCH#<k>#PIPELINE#<p>#TASK#<task>#<BINTYPE>` | `BIN#<id>`                   |
//!
//! A scope listing is a single `Query` on the branch partition with a
//! `begins_with` on the sort key. Each bin type of a task is its own
//! partition, so reading a payload is one `Query` as well.
//!
//! Version counters are plain number attributes moved only by a conditional
//! `UpdateItem` (`#v = :expected`), which DynamoDB applies atomically per
//! item. Reads are strongly consistent.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{AttributeValue, DeleteRequest, ReturnValue, WriteRequest};
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use kptn_core::config::DEFAULT_MAX_BIN_BYTES;

use super::bins::{manifest_for, partition, reassemble};
use super::{StoreResult, TaskStateStore};
use crate::error::StoreError;
use crate::record::{BinManifest, BinType, TaskRecord, VersionDimension};
use crate::task::{Scope, TaskKey};

/// BatchWriteItem accepts at most 25 requests
const BATCH_LIMIT: usize = 25;

/// Rounds of retrying unprocessed batch items before giving up
const BATCH_RETRIES: usize = 5;

type Item = HashMap<String, AttributeValue>;

/// DynamoDB-backed [`TaskStateStore`]
#[derive(Debug, Clone)]
pub struct DynamoDbStore {
    client: Client,
    table_name: String,
    max_bin_bytes: usize,
}

impl DynamoDbStore {
    /// Store over an existing client. The table needs a string `PK`
    /// partition key and a string `SK` sort key.
    pub fn new(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
            max_bin_bytes: DEFAULT_MAX_BIN_BYTES,
        }
    }

    /// Store using the standard AWS config chain (environment, profiles, IMDS)
    pub async fn from_env(table_name: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config), table_name)
    }

    pub fn with_max_bin_bytes(mut self, max_bin_bytes: usize) -> Self {
        self.max_bin_bytes = max_bin_bytes.max(1);
        self
    }

    async fn fetch_item(&self, key: &TaskKey) -> StoreResult<Option<Item>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(record_pk(&key.storage_key)))
            .key("SK", AttributeValue::S(record_sk(&key.pipeline, &key.task_id)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        Ok(output.item)
    }

    /// All items of one partition, optionally restricted by sort key prefix
    async fn query_items(&self, pk: &str, sk_prefix: Option<&str>) -> StoreResult<Vec<Item>> {
        let mut items = Vec::new();
        let mut exclusive_start_key = None;

        loop {
            let mut query = self
                .client
                .query()
                .table_name(&self.table_name)
                .consistent_read(true)
                .expression_attribute_values(":pk", AttributeValue::S(pk.to_string()));

            query = match sk_prefix {
                Some(prefix) => query
                    .key_condition_expression("PK = :pk AND begins_with(SK, :prefix)")
                    .expression_attribute_values(":prefix", AttributeValue::S(prefix.to_string())),
                None => query.key_condition_expression("PK = :pk"),
            };

            if let Some(start_key) = exclusive_start_key.take() {
                query = query.set_exclusive_start_key(Some(start_key));
            }

            let output = query.send().await.map_err(|e| map_sdk_error(e, pk))?;
            items.extend(output.items().iter().cloned());

            match output.last_evaluated_key() {
                Some(last_key) if !last_key.is_empty() => {
                    exclusive_start_key = Some(last_key.clone());
                }
                _ => break,
            }
        }

        Ok(items)
    }

    async fn bin_ids(&self, key: &TaskKey, bin_type: BinType) -> StoreResult<Vec<u32>> {
        let items = self.query_items(&bin_pk(key, bin_type), None).await?;
        Ok(items.iter().filter_map(parse_bin_id).collect())
    }

    /// Delete bins by id, in batches, retrying unprocessed requests
    async fn delete_bins(&self, key: &TaskKey, bin_type: BinType, ids: &[u32]) -> StoreResult<()> {
        let pk = bin_pk(key, bin_type);
        for chunk in ids.chunks(BATCH_LIMIT) {
            let mut requests = Vec::with_capacity(chunk.len());
            for id in chunk {
                let delete = DeleteRequest::builder()
                    .key("PK", AttributeValue::S(pk.clone()))
                    .key("SK", AttributeValue::S(bin_sk(*id)))
                    .build()
                    .map_err(|e| map_sdk_error(e, key))?;
                requests.push(WriteRequest::builder().delete_request(delete).build());
            }
            self.batch_write(key, requests).await?;
        }
        Ok(())
    }

    async fn batch_write(&self, key: &TaskKey, mut requests: Vec<WriteRequest>) -> StoreResult<()> {
        for attempt in 0..=BATCH_RETRIES {
            if requests.is_empty() {
                return Ok(());
            }
            if attempt > 0 {
                warn!(key = %key, pending = requests.len(), attempt, "retrying unprocessed bin deletes");
                tokio::time::sleep(std::time::Duration::from_millis(50 << attempt)).await;
            }
            let output = self
                .client
                .batch_write_item()
                .request_items(&self.table_name, requests)
                .send()
                .await
                .map_err(|e| map_sdk_error(e, key))?;
            requests = output
                .unprocessed_items
                .and_then(|mut items| items.remove(&self.table_name))
                .unwrap_or_default();
        }
        if requests.is_empty() {
            Ok(())
        } else {
            Err(StoreError::backend(format!(
                "{} bin deletes for {} left unprocessed",
                requests.len(),
                key
            )))
        }
    }
}

fn record_pk(storage_key: &str) -> String {
    format!("BRANCH#{storage_key}")
}

fn record_sk(pipeline: &str, task_id: &str) -> String {
    format!("PIPELINE#{pipeline}#TASK#{task_id}")
}

fn scope_sk_prefix(pipeline: &str) -> String {
    format!("PIPELINE#{pipeline}#TASK#")
}

fn bin_pk(key: &TaskKey, bin_type: BinType) -> String {
    format!(
        "BRANCH#{}#PIPELINE#{}#TASK#{}#{}",
        key.storage_key, key.pipeline, key.task_id, bin_type
    )
}

fn bin_sk(id: u32) -> String {
    format!("BIN#{id}")
}

fn parse_bin_id(item: &Item) -> Option<u32> {
    item.get("SK")?.as_s().ok()?.strip_prefix("BIN#")?.parse().ok()
}

fn map_sdk_error(
    err: impl std::error::Error + Send + Sync + 'static,
    key: impl std::fmt::Display,
) -> StoreError {
    StoreError::Backend {
        message: format!("DynamoDB error for key {key}: {err}"),
        source: Some(Box::new(err)),
    }
}

fn number(value: u64) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

fn timestamp(value: Option<DateTime<Utc>>) -> Option<AttributeValue> {
    value.map(|t| AttributeValue::S(t.to_rfc3339()))
}

/// Fields rewritten on every put; `None` removes the attribute
type Fields = Vec<(&'static str, Option<AttributeValue>)>;

/// Fields only written when the item is created
type CreateOnly = Vec<(String, AttributeValue)>;

fn record_attributes(record: &TaskRecord) -> StoreResult<(Fields, CreateOnly)> {
    let text = |value: String| Some(AttributeValue::S(value));
    let fields = vec![
        ("storage_key", text(record.storage_key.clone())),
        ("pipeline", text(record.pipeline.clone())),
        ("task_id", text(record.task_id.clone())),
        ("code_hashes", text(serde_json::to_string(&record.code_hashes)?)),
        ("input_hashes", text(serde_json::to_string(&record.input_hashes)?)),
        ("input_data_hashes", text(serde_json::to_string(&record.input_data_hashes)?)),
        ("status", record.status.map(|s| AttributeValue::S(s.to_string()))),
        ("start_time", timestamp(record.start_time)),
        ("end_time", timestamp(record.end_time)),
        ("last_success", timestamp(record.last_success)),
        ("error", record.error.clone().map(AttributeValue::S)),
        (
            "pending",
            record
                .pending
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?
                .map(AttributeValue::S),
        ),
        ("updated_at", timestamp(Some(Utc::now()))),
    ];

    let mut create_only = vec![
        ("outputs_version".to_string(), number(record.outputs_version)),
        ("output_data_version".to_string(), number(record.output_data_version)),
    ];
    for bin_type in BinType::ALL {
        let manifest = record.manifest(bin_type);
        let prefix = bin_type.field_prefix();
        create_only.push((format!("{prefix}_count"), number(u64::from(manifest.count))));
        create_only.push((format!("{prefix}_digest"), AttributeValue::S(manifest.digest.clone())));
    }
    Ok((fields, create_only))
}

fn item_to_record(item: &Item) -> StoreResult<TaskRecord> {
    let string = |name: &str| item.get(name).and_then(|v| v.as_s().ok()).cloned();
    let num = |name: &str| {
        item.get(name)
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0)
    };

    let key_label = format!(
        "{}/{}/{}",
        string("storage_key").unwrap_or_default(),
        string("pipeline").unwrap_or_default(),
        string("task_id").unwrap_or_default()
    );
    let corrupt = |message: String| StoreError::Corrupt {
        key: key_label.clone(),
        message,
    };
    let time = |name: &str| -> StoreResult<Option<DateTime<Utc>>> {
        string(name)
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| corrupt(format!("{name}: {e}")))
            })
            .transpose()
    };
    let map_field = |name: &str| -> StoreResult<String> {
        string(name).ok_or_else(|| corrupt(format!("missing attribute {name}")))
    };

    let manifest = |bin_type: BinType| {
        let prefix = bin_type.field_prefix();
        BinManifest {
            count: num(&format!("{prefix}_count")) as u32,
            digest: string(&format!("{prefix}_digest")).unwrap_or_default(),
        }
    };

    Ok(TaskRecord {
        storage_key: map_field("storage_key")?,
        pipeline: map_field("pipeline")?,
        task_id: map_field("task_id")?,
        code_hashes: serde_json::from_str(&map_field("code_hashes")?)?,
        input_hashes: serde_json::from_str(&map_field("input_hashes")?)?,
        input_data_hashes: serde_json::from_str(&map_field("input_data_hashes")?)?,
        outputs_version: num("outputs_version"),
        output_data_version: num("output_data_version"),
        status: string("status")
            .map(|s| s.parse())
            .transpose()
            .map_err(&corrupt)?,
        start_time: time("start_time")?,
        end_time: time("end_time")?,
        last_success: time("last_success")?,
        error: string("error"),
        pending: string("pending")
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        subtask_bins: manifest(BinType::Subtask),
        taskdata_bins: manifest(BinType::TaskData),
        subset_bins: manifest(BinType::Subset),
    })
}

#[async_trait]
impl TaskStateStore for DynamoDbStore {
    fn name(&self) -> &'static str {
        "dynamodb"
    }

    async fn get(&self, key: &TaskKey) -> StoreResult<Option<TaskRecord>> {
        self.fetch_item(key)
            .await?
            .map(|item| item_to_record(&item))
            .transpose()
    }

    async fn put(&self, record: &TaskRecord) -> StoreResult<()> {
        let key = record.key();
        let (fields, create_only) = record_attributes(record)?;

        let mut names = HashMap::new();
        let mut values = HashMap::new();
        let mut sets = Vec::new();
        let mut removes = Vec::new();

        for (field, value) in fields {
            let name = format!("#{field}");
            names.insert(name.clone(), field.to_string());
            match value {
                Some(value) => {
                    values.insert(format!(":{field}"), value);
                    sets.push(format!("{name} = :{field}"));
                }
                None => removes.push(name),
            }
        }
        for (field, value) in create_only {
            let name = format!("#{field}");
            names.insert(name.clone(), field.clone());
            values.insert(format!(":{field}"), value);
            sets.push(format!("{name} = if_not_exists({name}, :{field})"));
        }

        let mut expression = format!("SET {}", sets.join(", "));
        if !removes.is_empty() {
            expression.push_str(&format!(" REMOVE {}", removes.join(", ")));
        }

        self.client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(record_pk(&key.storage_key)))
            .key("SK", AttributeValue::S(record_sk(&key.pipeline, &key.task_id)))
            .update_expression(expression)
            .set_expression_attribute_names(Some(names))
            .set_expression_attribute_values(Some(values))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &key))?;
        Ok(())
    }

    async fn delete(&self, key: &TaskKey) -> StoreResult<bool> {
        for bin_type in BinType::ALL {
            let ids = self.bin_ids(key, bin_type).await?;
            self.delete_bins(key, bin_type, &ids).await?;
        }

        let output = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(record_pk(&key.storage_key)))
            .key("SK", AttributeValue::S(record_sk(&key.pipeline, &key.task_id)))
            .return_values(ReturnValue::AllOld)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        Ok(output.attributes().is_some_and(|attrs| !attrs.is_empty()))
    }

    async fn list(&self, scope: &Scope) -> StoreResult<Vec<TaskRecord>> {
        let items = self
            .query_items(
                &record_pk(&scope.storage_key),
                Some(&scope_sk_prefix(&scope.pipeline)),
            )
            .await?;
        items.iter().map(item_to_record).collect()
    }

    async fn compare_and_increment(
        &self,
        key: &TaskKey,
        dimension: VersionDimension,
        expected: u64,
    ) -> StoreResult<u64> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(record_pk(&key.storage_key)))
            .key("SK", AttributeValue::S(record_sk(&key.pipeline, &key.task_id)))
            .update_expression("SET #v = #v + :one")
            .condition_expression("attribute_exists(PK) AND #v = :expected")
            .expression_attribute_names("#v", dimension.field())
            .expression_attribute_values(":one", number(1))
            .expression_attribute_values(":expected", number(expected))
            .send()
            .await;

        match result {
            Ok(_) => Ok(expected + 1),
            Err(sdk_err) => {
                let conditional = sdk_err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception());
                if !conditional {
                    return Err(map_sdk_error(sdk_err, key));
                }
                if self.fetch_item(key).await?.is_none() {
                    Err(StoreError::NotFound {
                        key: key.to_string(),
                    })
                } else {
                    Err(StoreError::VersionConflict {
                        key: key.to_string(),
                        dimension,
                        expected,
                    })
                }
            }
        }
    }

    async fn get_large_payload(
        &self,
        key: &TaskKey,
        bin_type: BinType,
    ) -> StoreResult<Option<Vec<u8>>> {
        let Some(record) = self.get(key).await? else {
            return Ok(None);
        };
        let manifest = record.manifest(bin_type);
        if manifest.is_empty() {
            return Ok(None);
        }

        let items = self.query_items(&bin_pk(key, bin_type), None).await?;
        let mut bins = BTreeMap::new();
        for item in &items {
            let Some(id) = parse_bin_id(item) else {
                continue;
            };
            if id >= manifest.count {
                continue;
            }
            let data = item
                .get("data")
                .and_then(|v| v.as_b().ok())
                .ok_or_else(|| StoreError::Corrupt {
                    key: key.to_string(),
                    message: format!("{bin_type} bin {id} has no data"),
                })?;
            bins.insert(id, data.as_ref().to_vec());
        }

        reassemble(key, bin_type, manifest, bins).map(Some)
    }

    async fn put_large_payload(
        &self,
        key: &TaskKey,
        bin_type: BinType,
        payload: &[u8],
    ) -> StoreResult<BinManifest> {
        if self.fetch_item(key).await?.is_none() {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }

        let chunks = partition(payload, self.max_bin_bytes);
        let manifest = manifest_for(payload, chunks.len());
        let pk = bin_pk(key, bin_type);
        let existing = self.bin_ids(key, bin_type).await?;

        for (id, chunk) in chunks.iter().enumerate() {
            self.client
                .put_item()
                .table_name(&self.table_name)
                .item("PK", AttributeValue::S(pk.clone()))
                .item("SK", AttributeValue::S(bin_sk(id as u32)))
                .item("data", AttributeValue::B(Blob::new(chunk.to_vec())))
                .send()
                .await
                .map_err(|e| map_sdk_error(e, key))?;
        }

        let prefix = bin_type.field_prefix();
        self.client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(record_pk(&key.storage_key)))
            .key("SK", AttributeValue::S(record_sk(&key.pipeline, &key.task_id)))
            .update_expression("SET #count = :count, #digest = :digest")
            .condition_expression("attribute_exists(PK)")
            .expression_attribute_names("#count", format!("{prefix}_count"))
            .expression_attribute_names("#digest", format!("{prefix}_digest"))
            .expression_attribute_values(":count", number(u64::from(manifest.count)))
            .expression_attribute_values(":digest", AttributeValue::S(manifest.digest.clone()))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        let leftover: Vec<u32> = existing
            .into_iter()
            .filter(|id| *id >= manifest.count)
            .collect();
        self.delete_bins(key, bin_type, &leftover).await?;

        debug!(key = %key, bin_type = %bin_type, bins = manifest.count, "payload written");
        Ok(manifest)
    }
}
