//! Checkpoint/resume protocol: cancelled runs pick up from the cursor
//! with no duplicate records and no re-sighted prefix.

mod harness;

use std::sync::Arc;
use std::time::Duration;

use feedspine_core::{CheckpointConfig, CollectionStatus, NaturalKey, OrchestratorConfig};
use feedspine_engine::{
    CheckpointStore, FsCheckpointStore, MemoryCheckpointStore, Orchestrator,
};
use feedspine_store::{MemoryStore, RecordQuery, RecordStore};

use harness::ScriptedAdapter;

fn keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("key-{i:03}")).collect()
}

fn config_with_frequent_saves() -> OrchestratorConfig {
    OrchestratorConfig::builder()
        .checkpoint(
            CheckpointConfig::builder()
                .interval_records(5)
                .build(),
        )
        .build()
}

#[tokio::test]
async fn cancelled_run_resumes_from_cursor() {
    const TOTAL: usize = 40;
    let store = Arc::new(MemoryStore::new());
    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());

    // Run 1: cancel mid-feed.
    let first_adapter = Arc::new(
        ScriptedAdapter::from_keys("feed", keys(TOTAL))
            .with_delay(Duration::from_millis(5))
            .resumable(),
    );
    let mut first = Orchestrator::new(store.clone(), config_with_frequent_saves())
        .unwrap()
        .with_checkpoint_store(checkpoints.clone());
    first.register_feed(first_adapter.clone()).unwrap();

    let cancel = first.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
    });
    let result = first.collect().await;

    assert_eq!(result.status, CollectionStatus::Partial);
    let emitted_first = first_adapter.emitted();
    assert!(emitted_first > 0 && emitted_first < TOTAL);

    // The flush on close persisted the exact stop position.
    let saved = checkpoints.load("feed").await.unwrap().unwrap();
    assert_eq!(saved.cursor, serde_json::json!(emitted_first));
    assert_eq!(saved.records_processed, emitted_first as u64);

    // Run 2: fresh orchestrator and adapter over the same stores.
    let second_adapter = Arc::new(
        ScriptedAdapter::from_keys("feed", keys(TOTAL)).resumable(),
    );
    let mut second = Orchestrator::new(store.clone(), config_with_frequent_saves())
        .unwrap()
        .with_checkpoint_store(checkpoints.clone());
    second.register_feed(second_adapter.clone()).unwrap();
    let result = second.collect().await;

    assert_eq!(result.status, CollectionStatus::Completed);
    assert_eq!(second_adapter.emitted(), TOTAL - emitted_first);
    // Nothing from the finished prefix is re-yielded as new.
    assert_eq!(result.records_new() as usize, TOTAL - emitted_first);

    // Same final state as one uninterrupted run: every key present
    // exactly once, exactly one sighting per delivered candidate.
    assert_eq!(
        store.count(&RecordQuery::default()).await.unwrap() as usize,
        TOTAL
    );
    let mut total_sightings = 0;
    for key in keys(TOTAL) {
        let sightings = store
            .get_sightings(&NaturalKey::new(&key).unwrap())
            .await
            .unwrap();
        assert_eq!(sightings.len(), 1, "key {key} sighted more than once");
        assert!(sightings[0].is_new);
        total_sightings += sightings.len();
    }
    assert_eq!(
        total_sightings,
        first_adapter.emitted() + second_adapter.emitted()
    );
}

#[tokio::test]
async fn completed_run_leaves_a_full_cursor_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints: Arc<dyn CheckpointStore> =
        Arc::new(FsCheckpointStore::new(dir.path()));

    let adapter = Arc::new(ScriptedAdapter::from_keys("disk feed", keys(12)).resumable());
    let mut orchestrator = Orchestrator::new(
        Arc::new(MemoryStore::new()),
        config_with_frequent_saves(),
    )
    .unwrap()
    .with_checkpoint_store(checkpoints.clone());
    orchestrator.register_feed(adapter).unwrap();

    let result = orchestrator.collect().await;
    assert_eq!(result.status, CollectionStatus::Completed);

    let saved = checkpoints.load("disk feed").await.unwrap().unwrap();
    assert_eq!(saved.cursor, serde_json::json!(12));
    assert_eq!(saved.records_processed, 12);
    // One checkpoint file, named after the feed.
    let files: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(files, vec!["disk-feed.json".to_string()]);
}

#[tokio::test]
async fn adapter_without_resume_support_starts_fresh() {
    let store = Arc::new(MemoryStore::new());
    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    // Pre-seed a checkpoint the adapter will ignore.
    checkpoints
        .save(&feedspine_core::Checkpoint::new("plain", serde_json::json!(3)))
        .await
        .unwrap();

    let adapter = Arc::new(ScriptedAdapter::new("plain", &["a", "b", "c", "d"]));
    let mut orchestrator =
        Orchestrator::new(store, config_with_frequent_saves())
            .unwrap()
            .with_checkpoint_store(checkpoints);
    orchestrator.register_feed(adapter.clone()).unwrap();

    let result = orchestrator.collect().await;
    // All four delivered: the default resume is a no-op.
    assert_eq!(result.records_processed(), 4);
    assert_eq!(adapter.emitted(), 4);
}
