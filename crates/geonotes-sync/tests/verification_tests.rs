//! Chunked verification: cursor ordering, failure isolation and resume

mod common;

use common::{note, square_boundary, test_config};
use geonotes_sync::error::{ErrorClass, SyncError};
use geonotes_sync::models::{NoteRecord, RegionAssignment};
use geonotes_sync::retry::{RetryExecutor, RetryPolicy};
use geonotes_sync::store::{MemoryStore, NoteRepository, ProgressStore};
use geonotes_sync::verify::{Chunk, VerificationEngine, VerificationPass};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const VERIFY_CURSOR: &str = "regions:verify";

/// Notes 1..=2000 inside region 1, with note 1500 near its corner
async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let notes: Vec<NoteRecord> = (1..=2000)
        .map(|id| {
            if id == 1500 {
                note(id, 8.0, 8.0, 1)
            } else {
                note(id, 5.0, 5.0, 1)
            }
        })
        .collect();
    store.apply_notes(&notes).await.unwrap();
    store.upsert_regions(&[square_boundary(1, 0.0, 10.0)]).await.unwrap();
    store
}

fn engine(store: &Arc<MemoryStore>, cancel: CancellationToken) -> VerificationEngine {
    let dir = std::env::temp_dir();
    let config = test_config(&dir);
    let retry = RetryExecutor::new(
        RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
        cancel.clone(),
    );
    VerificationEngine::new(store.clone(), retry, &config.verify, cancel).unwrap()
}

async fn assigned_store() -> Arc<MemoryStore> {
    let store = seeded_store().await;
    let report = engine(&store, CancellationToken::new())
        .run(VerificationPass::Assign, false)
        .await
        .unwrap();
    assert_eq!(report.assigned, 2000);
    store.clear_range_reads().await;
    store
}

#[tokio::test]
async fn test_assign_pass_resolves_unknown_notes() {
    common::init_test_tracing();
    let store = seeded_store().await;
    store
        .apply_notes(&[note(2001, 40.0, 40.0, 1)])
        .await
        .unwrap();

    let report = engine(&store, CancellationToken::new())
        .run(VerificationPass::Assign, false)
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.assigned, 2001);
    assert_eq!(report.completed_up_to, 2001);
    assert_eq!(
        store.get_note(7).await.unwrap().unwrap().region,
        RegionAssignment::Assigned(1)
    );
    assert_eq!(
        store.get_note(2001).await.unwrap().unwrap().region,
        RegionAssignment::KnownUnassigned
    );
}

#[tokio::test]
async fn test_notes_ingested_after_a_finished_pass_are_assigned() {
    let store = Arc::new(MemoryStore::new());
    let notes: Vec<NoteRecord> = (1..=1500).map(|id| note(id, 5.0, 5.0, 1)).collect();
    store.apply_notes(&notes).await.unwrap();
    store.upsert_regions(&[square_boundary(1, 0.0, 10.0)]).await.unwrap();
    let engine = engine(&store, CancellationToken::new());

    let first = engine.run(VerificationPass::Assign, false).await.unwrap();
    assert!(first.is_complete());
    assert_eq!(first.completed_up_to, 1500);

    store.apply_notes(&[note(1600, 6.0, 6.0, 2)]).await.unwrap();
    store.clear_range_reads().await;
    let second = engine.run(VerificationPass::Assign, false).await.unwrap();

    assert_eq!(second.resumed_from, 1500);
    assert_eq!(second.chunks_processed, 1);
    assert_eq!(second.assigned, 1);
    assert_eq!(second.completed_up_to, 1600);
    assert_eq!(store.range_reads().await, vec![(1501, 1600)]);
    assert_eq!(
        store.get_note(1600).await.unwrap().unwrap().region,
        RegionAssignment::Assigned(1)
    );
}

#[tokio::test]
async fn test_cursor_waits_for_slow_first_chunk() {
    let store = assigned_store().await;
    store.delay_range_reads(1, Duration::from_millis(100)).await;

    let report = engine(&store, CancellationToken::new())
        .run(VerificationPass::Verify, false)
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.chunks_processed, 2);
    assert_eq!(report.completed_up_to, 2000);
    // Chunk 2 finished first but the cursor only moved once chunk 1 was done
    assert_eq!(store.cursor_history(VERIFY_CURSOR).await, vec![2000]);
}

#[tokio::test]
async fn test_failed_chunk_holds_cursor_and_is_redone() {
    let store = assigned_store().await;
    store.fail_range_reads(1001, 10).await;
    let engine = engine(&store, CancellationToken::new());

    let report = engine.run(VerificationPass::Verify, false).await.unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.completed_up_to, 1000);
    assert_eq!(store.read_chunk_cursor(VERIFY_CURSOR).await.unwrap(), 1000);
    assert_eq!(report.failed_chunks.len(), 1);
    assert_eq!(report.failed_chunks[0].chunk, Chunk { start: 1001, end: 2000 });
    assert_eq!(report.failed_chunks[0].class, ErrorClass::TransientIo);

    store.clear_faults().await;
    store.clear_range_reads().await;
    let rerun = engine.run(VerificationPass::Verify, false).await.unwrap();

    assert!(rerun.is_complete());
    assert_eq!(rerun.resumed_from, 1000);
    assert_eq!(rerun.completed_up_to, 2000);
    assert_eq!(store.range_reads().await, vec![(1001, 2000)]);
}

#[tokio::test]
async fn test_shrunk_region_invalidates_only_notes_outside() {
    let store = assigned_store().await;
    store.upsert_regions(&[square_boundary(1, 0.0, 7.0)]).await.unwrap();

    let report = engine(&store, CancellationToken::new())
        .run(VerificationPass::Verify, false)
        .await
        .unwrap();

    assert_eq!(report.invalidated, 1);
    assert_eq!(
        store.get_note(1500).await.unwrap().unwrap().region,
        RegionAssignment::Unknown
    );
    assert_eq!(store.read_chunk_cursor("regions:assign").await.unwrap(), 0);
    assert_eq!(
        store.get_note(1499).await.unwrap().unwrap().region,
        RegionAssignment::Assigned(1)
    );
    assert!(report.stats.fast_path_hits >= 1999);
}

#[tokio::test]
async fn test_completed_pass_only_reruns_after_reset() {
    let store = assigned_store().await;
    let engine = engine(&store, CancellationToken::new());
    engine.run(VerificationPass::Verify, false).await.unwrap();
    store.clear_range_reads().await;

    let again = engine.run(VerificationPass::Verify, false).await.unwrap();
    assert_eq!(again.chunks_processed, 0);
    assert!(store.range_reads().await.is_empty());

    let fresh = engine.run(VerificationPass::Verify, true).await.unwrap();
    assert_eq!(fresh.resumed_from, 0);
    assert_eq!(fresh.chunks_processed, 2);
    let mut reads = store.range_reads().await;
    reads.sort_unstable();
    assert_eq!(reads, vec![(1, 1000), (1001, 2000)]);
}

#[tokio::test]
async fn test_shutdown_leaves_cursor_untouched() {
    let store = assigned_store().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = engine(&store, cancel)
        .run(VerificationPass::Verify, false)
        .await
        .unwrap();

    assert!(report.interrupted);
    assert_eq!(report.chunks_processed, 0);
    assert_eq!(store.read_chunk_cursor(VERIFY_CURSOR).await.unwrap(), 0);
}

#[tokio::test]
async fn test_missing_boundaries_is_permanent() {
    let store = Arc::new(MemoryStore::new());
    store.apply_notes(&[note(1, 5.0, 5.0, 1)]).await.unwrap();

    let err = engine(&store, CancellationToken::new())
        .run(VerificationPass::Verify, false)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Permanent(_)));
}
