mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use kptn_cache::{
    BinType, DecideRequest, Decision, MemoryStore, Reason, Scope, SqliteStore, StoreError,
    TaskKey, TaskRecord, TaskStateStore, VersionDimension, VersionLedger,
};

use common::{Project, KEY};

const BIN: usize = 16;

fn key() -> TaskKey {
    TaskKey::new("main", "etl", "extract")
}

fn backends() -> Vec<Arc<dyn TaskStateStore>> {
    vec![
        Arc::new(MemoryStore::new().with_max_bin_bytes(BIN)),
        Arc::new(SqliteStore::in_memory().unwrap().with_max_bin_bytes(BIN)),
    ]
}

#[tokio::test]
async fn test_bin_round_trip() {
    let payloads: Vec<Vec<u8>> = vec![
        b"small".to_vec(),
        vec![7u8; BIN],
        (0..BIN * 3 + 5).map(|i| (i % 251) as u8).collect(),
    ];
    let expected_counts = [1, 1, 4];

    for store in backends() {
        store.put(&TaskRecord::new(&key())).await.unwrap();
        for (payload, count) in payloads.iter().zip(expected_counts) {
            let manifest = store
                .put_large_payload(&key(), BinType::TaskData, payload)
                .await
                .unwrap();
            assert_eq!(manifest.count, count, "{}", store.name());

            let read = store
                .get_large_payload(&key(), BinType::TaskData)
                .await
                .unwrap();
            assert_eq!(read.as_deref(), Some(payload.as_slice()), "{}", store.name());
        }
    }
}

#[tokio::test]
async fn test_overwrite_with_fewer_bins() {
    for store in backends() {
        store.put(&TaskRecord::new(&key())).await.unwrap();
        store
            .put_large_payload(&key(), BinType::Subtask, &[1u8; BIN * 4])
            .await
            .unwrap();
        store
            .put_large_payload(&key(), BinType::Subtask, b"tiny")
            .await
            .unwrap();

        let read = store
            .get_large_payload(&key(), BinType::Subtask)
            .await
            .unwrap();
        assert_eq!(read.as_deref(), Some(&b"tiny"[..]), "{}", store.name());
        let record = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(record.subtask_count(), 1);
    }
}

#[tokio::test]
async fn test_missing_bin_is_an_integrity_failure() {
    let store = MemoryStore::new().with_max_bin_bytes(BIN);
    store.put(&TaskRecord::new(&key())).await.unwrap();
    store
        .put_large_payload(&key(), BinType::TaskData, &[3u8; BIN * 2])
        .await
        .unwrap();
    assert!(store.remove_bin(&key(), BinType::TaskData, 1));

    let err = store
        .get_large_payload(&key(), BinType::TaskData)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::IncompleteBinSet { .. }));
    assert!(err.is_integrity_failure());
}

#[tokio::test]
async fn test_payload_requires_record() {
    for store in backends() {
        let err = store
            .put_large_payload(&key(), BinType::TaskData, b"data")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }), "{}", store.name());
    }
}

#[tokio::test]
async fn test_delete_cascades_to_bins() {
    for store in backends() {
        store.put(&TaskRecord::new(&key())).await.unwrap();
        store
            .put_large_payload(&key(), BinType::TaskData, &[9u8; BIN * 2])
            .await
            .unwrap();

        assert!(store.delete(&key()).await.unwrap());
        assert!(!store.delete(&key()).await.unwrap());
        store.put(&TaskRecord::new(&key())).await.unwrap();
        let read = store
            .get_large_payload(&key(), BinType::TaskData)
            .await
            .unwrap();
        assert_eq!(read, None, "{}", store.name());
    }
}

#[tokio::test]
async fn test_clear_only_touches_its_scope() {
    for store in backends() {
        let scope = Scope::new("main", "etl");
        store.put(&TaskRecord::new(&scope.task("a"))).await.unwrap();
        store.put(&TaskRecord::new(&scope.task("b"))).await.unwrap();
        let other = TaskKey::new("feature", "etl", "a");
        store.put(&TaskRecord::new(&other)).await.unwrap();

        assert_eq!(store.clear(&scope).await.unwrap(), 2);
        assert!(store.list(&scope).await.unwrap().is_empty());
        assert!(store.get(&other).await.unwrap().is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bumps_on_sqlite() {
    let store: Arc<dyn TaskStateStore> = Arc::new(SqliteStore::in_memory().unwrap());
    store.put(&TaskRecord::new(&key())).await.unwrap();
    let ledger = VersionLedger::new(store).with_max_attempts(64);

    let handles: Vec<_> = (0..8)
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
    values.dedup();
    assert_eq!(values.len(), 8);
    assert_eq!(values.last().copied(), Some(values[0] + 7));
}

#[tokio::test]
async fn test_sqlite_decisions_survive_reopen() {
    let project = Project::new();
    project.write("src/a.py", "print('a')");
    let db = TempDir::new().unwrap();
    let path = db.path().join("cache").join("kptn.db");
    let yaml = r#"
graphs:
  etl:
    tasks:
      a:
tasks:
  a:
    file: src/a.py
"#;

    {
        let engine = project.engine(yaml, Arc::new(SqliteStore::new(&path).unwrap()));
        let decision = engine.decide(KEY, "a", &DecideRequest::new()).await.unwrap();
        assert_eq!(decision, Decision::Run(Reason::FirstRun));
        engine
            .mark_succeeded(KEY, "a", Some(&serde_json::json!({"rows": 3})))
            .await
            .unwrap();
    }

    let engine = project.engine(yaml, Arc::new(SqliteStore::new(&path).unwrap()));
    let decision = engine.decide(KEY, "a", &DecideRequest::new()).await.unwrap();
    assert_eq!(decision, Decision::Skip(Reason::UpToDate));
    assert_eq!(
        engine.task_data(KEY, "a").await.unwrap(),
        Some(serde_json::json!({"rows": 3}))
    );
}
