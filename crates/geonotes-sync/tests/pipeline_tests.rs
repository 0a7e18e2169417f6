//! Bulk pipeline: partial failures, re-runs and consolidation idempotence

mod common;

use common::{note, watermark_at, FakeBulk};
use geonotes_sync::config::{BulkConfig, FailureMode};
use geonotes_sync::convert::CsvNoteConverter;
use geonotes_sync::error::SyncError;
use geonotes_sync::models::{NoteComment, NoteRecord, PartitionState};
use geonotes_sync::pipeline::{new_batch_id, BulkPipeline, Consolidation};
use geonotes_sync::retry::{RetryExecutor, RetryPolicy};
use geonotes_sync::source::{BulkDump, BulkSource};
use geonotes_sync::store::{MemoryStore, ProgressStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const FEED: &str = "notes";

fn notes(count: i64) -> Vec<NoteRecord> {
    (1..=count)
        .map(|id| {
            let mut n = note(id, (id % 80) as f64, (id % 170) as f64, id);
            n.comments = (0..(id % 3) as i32)
                .map(|seq| NoteComment {
                    note_id: id,
                    seq,
                    action: "commented".into(),
                    created_at: n.created_at,
                    author: Some(format!("user{seq}")),
                    text: format!("comment {seq} on {id}"),
                })
                .collect();
            n
        })
        .collect()
}

fn pipeline(store: Arc<MemoryStore>, work_dir: &Path, mode: FailureMode) -> BulkPipeline {
    let config = BulkConfig {
        work_dir: work_dir.to_path_buf(),
        partitions: 4,
        parallelism: 3,
        failure_mode: mode,
        max_batch_attempts: 2,
        ..BulkConfig::default()
    };
    let retry = RetryExecutor::new(
        RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
        CancellationToken::new(),
    );
    BulkPipeline::new(
        store,
        Arc::new(CsvNoteConverter::new()),
        retry,
        &config,
        FEED,
        "pipeline-test",
        Duration::from_secs(60),
    )
}

async fn download(bulk: &FakeBulk, work_dir: &Path, batch_id: &str) -> BulkDump {
    let dir = BulkPipeline::batch_dir(work_dir, batch_id);
    tokio::fs::create_dir_all(&dir).await.unwrap();
    bulk.download(&dir.join("dump.csv")).await.unwrap()
}

#[tokio::test]
async fn test_rerun_after_mid_merge_failure_matches_clean_run() {
    common::init_test_tracing();
    let bulk = FakeBulk::new(notes(200), Some(watermark_at(500)));

    // Reference: one clean run
    let clean_dir = tempfile::tempdir().unwrap();
    let clean_store = Arc::new(MemoryStore::new());
    let batch = new_batch_id();
    let dump = download(&bulk, clean_dir.path(), &batch).await;
    let report = pipeline(clean_store.clone(), clean_dir.path(), FailureMode::FailFast)
        .run(&dump, &batch)
        .await
        .unwrap();
    assert!(report.is_committed());

    // Same dump, but the second partition's merge fails after the first was applied
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    store.fail_apply_on_call(2).await;
    let pipeline = pipeline(store.clone(), dir.path(), FailureMode::FailFast);
    let batch = new_batch_id();
    let dump = download(&bulk, dir.path(), &batch).await;

    let err = pipeline.run(&dump, &batch).await.unwrap_err();
    assert!(matches!(err, SyncError::TransientIo(_)));
    assert_eq!(store.read_watermark(FEED).await.unwrap(), None);
    assert!(!store.snapshot().await.is_empty(), "first partition was applied");

    // Re-running consolidation from scratch finishes the batch
    let rerun = pipeline.retry_failed(&dump, &batch).await.unwrap();
    assert!(rerun.is_committed());

    assert_eq!(store.snapshot().await, clean_store.snapshot().await);
    assert_eq!(store.read_watermark(FEED).await.unwrap(), Some(watermark_at(500)));
    assert_eq!(
        store.read_watermark(FEED).await.unwrap(),
        clean_store.read_watermark(FEED).await.unwrap()
    );
}

#[tokio::test]
async fn test_second_consolidation_of_same_data_is_a_no_op() {
    let bulk = FakeBulk::new(notes(50), Some(watermark_at(100)));
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(store.clone(), dir.path(), FailureMode::FailFast);

    let first = new_batch_id();
    let dump = download(&bulk, dir.path(), &first).await;
    pipeline.run(&dump, &first).await.unwrap();
    let after_first = store.snapshot().await;

    let second = new_batch_id();
    let dump = download(&bulk, dir.path(), &second).await;
    let report = pipeline.run(&dump, &second).await.unwrap();

    match report.consolidation {
        Consolidation::Committed { summary, .. } => {
            assert_eq!(summary.inserted, 0);
            assert_eq!(summary.skipped_stale, 0);
        },
        other => panic!("expected commit, got {other:?}"),
    }
    assert_eq!(store.snapshot().await, after_first);
}

#[tokio::test]
async fn test_best_effort_quarantine_holds_watermark() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(store.clone(), dir.path(), FailureMode::BestEffort);
    let batch = new_batch_id();
    let batch_dir = BulkPipeline::batch_dir(dir.path(), &batch);
    std::fs::create_dir_all(&batch_dir).unwrap();

    let good = CsvNoteConverter::new().encode(&notes(40)).unwrap();
    let mut data = String::from_utf8(good).unwrap();
    data.push_str("N,41,not-a-number,1.0,2024-01-01T00:00:00Z,2024-01-01T00:00:00Z,open,\n");
    let path = batch_dir.join("dump.csv");
    std::fs::write(&path, &data).unwrap();
    let dump = BulkDump {
        path,
        marker: Some(watermark_at(60)),
        sha256: String::new(),
    };

    let report = pipeline.run(&dump, &batch).await.unwrap();

    assert!(!report.is_committed());
    assert_eq!(report.pool.quarantined.len(), 1);
    assert_eq!(store.read_watermark(FEED).await.unwrap(), None);
    let states = store.list_partitions(&batch).await.unwrap();
    assert_eq!(
        states.iter().filter(|p| p.state == PartitionState::Quarantined).count(),
        1
    );
    assert!(dump.path.exists(), "dump kept for a later retry");
}

#[tokio::test]
async fn test_unfinished_batch_is_resumed_then_abandoned() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(store.clone(), dir.path(), FailureMode::BestEffort);

    // Left behind by an earlier process
    let superseded = BulkPipeline::batch_dir(dir.path(), "20240101T000000Z-0ld0ba7c");
    std::fs::create_dir_all(&superseded).unwrap();
    std::fs::write(superseded.join("dump.csv"), "N,1").unwrap();

    let batch = new_batch_id();
    let batch_dir = BulkPipeline::batch_dir(dir.path(), &batch);
    std::fs::create_dir_all(&batch_dir).unwrap();
    let mut data = String::from_utf8(CsvNoteConverter::new().encode(&notes(20)).unwrap()).unwrap();
    data.push_str("N,21,not-a-number,1.0,2024-01-01T00:00:00Z,2024-01-01T00:00:00Z,open,\n");
    let path = batch_dir.join("dump.csv");
    std::fs::write(&path, &data).unwrap();
    let dump = BulkDump {
        path,
        marker: Some(watermark_at(60)),
        sha256: String::new(),
    };
    pipeline.record_batch(&batch, &dump).await.unwrap();
    assert!(!pipeline.run(&dump, &batch).await.unwrap().is_committed());

    let (record, resumed) = pipeline.take_resumable().await.unwrap().expect("batch resumable");
    assert_eq!(record.batch_id, batch);
    assert_eq!(record.attempts, 2);
    assert_eq!(resumed.marker, Some(watermark_at(60)));
    assert!(!superseded.exists(), "older batch removed");

    let report = pipeline.resume(&resumed, &batch).await.unwrap();
    assert!(!report.is_committed());
    assert_eq!(report.pool.quarantined.len(), 1);

    // Out of attempts: the batch is dropped and a fresh download is due
    assert!(pipeline.take_resumable().await.unwrap().is_none());
    assert!(!batch_dir.exists());
    assert_eq!(store.read_watermark(FEED).await.unwrap(), None);
}
