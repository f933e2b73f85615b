//! Integration tests against real SQLite endpoints.
//!
//! Cover the SQLite stores, router degraded mode, shard selection across
//! restarts, and crash resumption through the orchestrator.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use filedex::config::{self, Config};
use filedex::orchestrator::{Orchestrator, Storage};
use filedex::progress::NoNotifier;
use filedex_core::store::{FileCollection, OperationStore};
use filedex_core::{
    Counters, Error, FileRecord, FileSource, MemorySource, Operation, OperationStatus,
    RuntimeConfig, SourceItem,
};
use tempfile::TempDir;

const SOURCE: &str = "-100555";

fn write_config(root: &Path, endpoints: &[(&str, &str)]) -> Config {
    let mut body = format!(
        "[db]\nprimary = \"sqlite:{}/data/primary.db\"\n\n",
        root.display()
    );
    for (name, rel) in endpoints {
        body.push_str(&format!(
            "[[db.endpoints]]\nname = \"{}\"\nuri = \"sqlite:{}/{}\"\n\n",
            name,
            root.display(),
            rel
        ));
    }
    body.push_str("[index]\nbatch_size = 4\nretry_backoff_ms = 1\ncall_timeout_secs = 5\n");

    let path = root.join("fdx.toml");
    fs::write(&path, body).unwrap();
    config::load_config(&path).unwrap()
}

fn item(position: u64) -> SourceItem {
    SourceItem {
        position,
        file_id: format!("BQACAgQAAx{}", position),
        unique_id: format!("AgADxw{}", position),
        file_name: format!("Lecture {:02}.pdf", position),
        file_size: 2_048 * position,
        mime_type: Some("application/pdf".into()),
        caption: Some(format!("part {}", position)),
    }
}

fn source_with(n: u64) -> Arc<MemorySource> {
    Arc::new(MemorySource::with_items(SOURCE, (1..=n).map(item).collect()))
}

#[tokio::test]
async fn sqlite_operation_store_enforces_state_machine() {
    let tmp = TempDir::new().unwrap();
    let cfg = write_config(tmp.path(), &[]);
    let storage = Storage::open(&cfg).await.unwrap();
    let ops = &storage.operations;

    let op = Operation::new(SOURCE);
    ops.create(&op).await.unwrap();
    assert!(matches!(ops.create(&op).await, Err(Error::DuplicateId(_))));
    assert_eq!(ops.get(op.id).await.unwrap().status, OperationStatus::Pending);

    ops.set_status(op.id, OperationStatus::Running).await.unwrap();
    let counters = Counters {
        indexed: 3,
        skipped: 1,
        errors: 0,
    };
    ops.update_progress(op.id, 4, counters).await.unwrap();
    ops.update_progress(op.id, 4, counters).await.unwrap();
    assert!(matches!(
        ops.update_progress(op.id, 2, counters).await,
        Err(Error::CursorRegression {
            current: 4,
            attempted: 2
        })
    ));

    let stored = ops.get(op.id).await.unwrap();
    assert_eq!(stored.cursor, 4);
    assert_eq!(stored.counters, counters);
    assert_eq!(ops.list_active().await.unwrap().len(), 1);

    ops.set_status(op.id, OperationStatus::Completed).await.unwrap();
    assert!(matches!(
        ops.set_status(op.id, OperationStatus::Running).await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        ops.update_progress(op.id, 8, counters).await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(ops.list_active().await.unwrap().is_empty());

    let newer = Operation::new("other");
    ops.create(&newer).await.unwrap();
    let listed = ops.list(10).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, newer.id);
    assert_eq!(ops.list(1).await.unwrap().len(), 1);

    assert!(matches!(
        ops.get(uuid::Uuid::new_v4()).await,
        Err(Error::NotFound(_))
    ));
    storage.close().await;
}

#[tokio::test]
async fn values_past_sqlite_range_are_refused() {
    let tmp = TempDir::new().unwrap();
    let cfg = write_config(tmp.path(), &[]);
    let storage = Storage::open(&cfg).await.unwrap();
    let ops = &storage.operations;

    let op = Operation::new(SOURCE);
    ops.create(&op).await.unwrap();
    ops.set_status(op.id, OperationStatus::Running).await.unwrap();
    let counters = Counters {
        indexed: 2,
        ..Counters::default()
    };
    ops.update_progress(op.id, 2, counters).await.unwrap();

    let huge = i64::MAX as u64 + 1;
    assert!(matches!(
        ops.update_progress(op.id, huge, counters).await,
        Err(Error::Storage(_))
    ));
    let oversized = Counters {
        skipped: huge,
        ..counters
    };
    assert!(matches!(
        ops.update_progress(op.id, 3, oversized).await,
        Err(Error::Storage(_))
    ));
    let stored = ops.get(op.id).await.unwrap();
    assert_eq!((stored.cursor, stored.counters), (2, counters));

    let mut big = item(1);
    big.file_size = u64::MAX;
    let record = FileRecord::from_item(&big, SOURCE, op.id);
    let files = storage.router.current_collection();
    assert!(matches!(
        files.collection.insert_file(&record).await,
        Err(Error::Storage(_))
    ));
    assert_eq!(files.collection.count().await.unwrap(), 0);
    storage.close().await;
}

#[tokio::test]
async fn unreachable_endpoint_is_excluded() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("shards")).unwrap();
    let cfg = write_config(
        tmp.path(),
        &[
            ("a", "shards/a.db"),
            ("gone", "nowhere/gone.db"),
            ("b", "shards/b.db"),
        ],
    );

    let storage = Storage::open(&cfg).await.unwrap();
    let router = &storage.router;
    assert_eq!(router.endpoint_count(), 2);

    let names: Vec<String> = router.endpoints().await.into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["primary", "a", "b"]);

    router.select_endpoint(2).await.unwrap();
    assert_eq!(router.current_collection().name, "b");
    assert!(matches!(
        router.select_endpoint(3).await,
        Err(Error::OutOfRange { index: 3, max: 2 })
    ));
    storage.close().await;
}

#[tokio::test]
async fn primary_failure_is_fatal() {
    let tmp = TempDir::new().unwrap();
    // A regular file where the data directory should be.
    fs::write(tmp.path().join("data"), b"not a directory").unwrap();
    let cfg = write_config(tmp.path(), &[]);

    let err = Storage::open(&cfg).await.err().unwrap();
    let root = err.root_cause().to_string();
    assert!(root.contains("endpoint 'primary' unavailable"), "got: {:#}", err);
}

#[tokio::test]
async fn selection_survives_restart() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("shards")).unwrap();
    let cfg = write_config(tmp.path(), &[("a", "shards/a.db"), ("b", "shards/b.db")]);

    let storage = Storage::open(&cfg).await.unwrap();
    storage.router.select_endpoint(2).await.unwrap();
    storage.close().await;

    let storage = Storage::open(&cfg).await.unwrap();
    let current = storage.router.current_collection();
    assert_eq!((current.index, current.name.as_str()), (2, "b"));
    storage.close().await;

    // "a" removed from config: "b" moves to index 1 and stays selected.
    let cfg = write_config(tmp.path(), &[("b", "shards/b.db")]);
    let storage = Storage::open(&cfg).await.unwrap();
    let current = storage.router.current_collection();
    assert_eq!((current.index, current.name.as_str()), (1, "b"));
    storage.close().await;
}

#[tokio::test]
async fn selection_from_another_process_reaches_running_router() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("shards")).unwrap();
    let cfg = write_config(tmp.path(), &[("a", "shards/a.db")]);

    let serving = Storage::open(&cfg).await.unwrap();
    let admin = Storage::open(&cfg).await.unwrap();
    admin.router.select_endpoint(1).await.unwrap();
    admin.close().await;

    assert_eq!(serving.router.current_collection().index, 0);
    assert_eq!(serving.router.sync_selection().await.unwrap(), 1);
    assert_eq!(serving.router.current_collection().name, "a");
    serving.close().await;
}

#[tokio::test]
async fn selection_survives_endpoint_outage() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("shards")).unwrap();
    let cfg = write_config(tmp.path(), &[("a", "shards/a.db")]);

    let storage = Storage::open(&cfg).await.unwrap();
    storage.router.select_endpoint(1).await.unwrap();
    storage.close().await;

    fs::rename(tmp.path().join("shards"), tmp.path().join("offline")).unwrap();
    let storage = Storage::open(&cfg).await.unwrap();
    assert_eq!(storage.router.endpoint_count(), 0);
    assert_eq!(storage.router.current_collection().index, 0);
    storage.close().await;

    fs::rename(tmp.path().join("offline"), tmp.path().join("shards")).unwrap();
    let storage = Storage::open(&cfg).await.unwrap();
    let current = storage.router.current_collection();
    assert_eq!((current.index, current.name.as_str()), (1, "a"));
    storage.close().await;
}

#[tokio::test]
async fn runtime_config_persists_on_primary() {
    let tmp = TempDir::new().unwrap();
    let cfg = write_config(tmp.path(), &[]);

    let storage = Storage::open(&cfg).await.unwrap();
    assert_eq!(*storage.config.current(), RuntimeConfig::default());
    storage
        .config
        .update(RuntimeConfig {
            resume_on_startup: false,
            progress_notifications: true,
            notify_every_batches: 10,
        })
        .await
        .unwrap();
    storage.close().await;

    let storage = Storage::open(&cfg).await.unwrap();
    let loaded = storage.config.current();
    assert!(!loaded.resume_on_startup);
    assert_eq!(loaded.notify_every_batches, 10);
    storage.close().await;
}

#[tokio::test]
async fn crashed_operation_resumes_from_cursor() {
    let tmp = TempDir::new().unwrap();
    let cfg = write_config(tmp.path(), &[]);

    // First process: persisted cursor 4, then died.
    let storage = Storage::open(&cfg).await.unwrap();
    let op = Operation::new(SOURCE);
    storage.operations.create(&op).await.unwrap();
    storage
        .operations
        .set_status(op.id, OperationStatus::Running)
        .await
        .unwrap();
    storage
        .operations
        .update_progress(
            op.id,
            4,
            Counters {
                indexed: 4,
                ..Counters::default()
            },
        )
        .await
        .unwrap();
    storage.close().await;

    // Second process.
    let source = source_with(10);
    let storage = Storage::open(&cfg).await.unwrap();
    let orchestrator = Orchestrator::new(
        cfg.clone(),
        storage,
        source.clone() as Arc<dyn FileSource>,
        Arc::new(NoNotifier),
    );
    assert_eq!(orchestrator.resume_active().await.unwrap(), 1);
    orchestrator.manager().shutdown().await;

    let done = orchestrator.storage().operations.get(op.id).await.unwrap();
    assert_eq!(done.status, OperationStatus::Completed);
    assert_eq!(done.cursor, 10);
    assert_eq!(done.counters.indexed, 10);
    assert_eq!(source.fetched_windows(), vec![(4, 8), (8, 10)]);

    let files = orchestrator
        .storage()
        .router
        .current_collection()
        .collection
        .count()
        .await
        .unwrap();
    assert_eq!(files, 6);
    orchestrator.storage().close().await;
}

#[tokio::test]
async fn resume_can_be_disabled() {
    let tmp = TempDir::new().unwrap();
    let cfg = write_config(tmp.path(), &[]);

    let storage = Storage::open(&cfg).await.unwrap();
    let op = Operation::new(SOURCE);
    storage.operations.create(&op).await.unwrap();
    storage
        .config
        .update(RuntimeConfig {
            resume_on_startup: false,
            ..RuntimeConfig::default()
        })
        .await
        .unwrap();

    let orchestrator = Orchestrator::new(cfg, storage, source_with(3), Arc::new(NoNotifier));
    assert_eq!(orchestrator.resume_active().await.unwrap(), 0);
    let idle = orchestrator.storage().operations.get(op.id).await.unwrap();
    assert_eq!(idle.status, OperationStatus::Pending);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn content_on_older_endpoint_is_not_duplicated() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("shards")).unwrap();
    let cfg = write_config(tmp.path(), &[("a", "shards/a.db")]);

    let storage = Storage::open(&cfg).await.unwrap();
    let router = Arc::clone(&storage.router);
    let orchestrator = Orchestrator::new(cfg, storage, source_with(6), Arc::new(NoNotifier));
    let manager = orchestrator.manager();
    let root = orchestrator.root_token();

    let (token, first) = manager.new_operation(&root, SOURCE).await.unwrap();
    let first = manager.run_operation(token, &first).await.unwrap();
    assert_eq!(first.counters.indexed, 6);

    router.select_endpoint(1).await.unwrap();
    let (token, second) = manager.new_operation(&root, SOURCE).await.unwrap();
    let second = manager.run_operation(token, &second).await.unwrap();
    assert_eq!(second.status, OperationStatus::Completed);
    assert_eq!(second.counters.indexed, 0);
    assert_eq!(second.counters.skipped, 6);

    let counts: Vec<Option<u64>> = router.endpoints().await.into_iter().map(|e| e.files).collect();
    assert_eq!(counts, vec![Some(6), Some(0)]);
    orchestrator.shutdown().await;
}
