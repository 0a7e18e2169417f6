//! Sync controller cycles, one-shot runs and the daemon loop

mod common;

use common::{note, test_config, watermark_at, FakeBulk, FakeFeed, Harness};
use geonotes_sync::config::SyncConfig;
use geonotes_sync::controller::{run_once, ConfigLoader, ControllerFactory, Daemon, SyncController, SyncPath};
use geonotes_sync::error::{ErrorClass, ExitStatus, SyncError};
use geonotes_sync::models::{CycleOutcome, NoteRecord, SyncPhase};
use geonotes_sync::store::{LeaseLocks, NoteRepository, ProgressStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const FEED: &str = "notes";

fn notes(range: std::ops::RangeInclusive<i64>) -> Vec<NoteRecord> {
    range.map(|id| note(id, (id % 80) as f64, (id % 170) as f64, id)).collect()
}

fn harness(feed_notes: Vec<NoteRecord>) -> (Harness, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(
        test_config(dir.path()),
        FakeFeed::new(feed_notes),
        FakeBulk::new(Vec::new(), None),
    );
    (harness, dir)
}

fn factory(harness: &Harness, holder: &str) -> ControllerFactory {
    let collaborators = harness.collaborators();
    let holder = holder.to_string();
    Box::new(move |config: &SyncConfig, cancel: CancellationToken| {
        Ok(SyncController::new(collaborators.clone(), config, &holder, cancel))
    })
}

#[tokio::test]
async fn test_small_batch_is_applied_directly() {
    common::init_test_tracing();
    let (h, _dir) = harness(notes(1..=50));
    let controller = h.controller("node-a", CancellationToken::new());

    let report = controller.run_cycle().await.unwrap();

    assert_eq!(report.outcome, CycleOutcome::Applied);
    assert_eq!(report.path, Some(SyncPath::DirectApply));
    assert_eq!(
        report.phases,
        vec![
            SyncPhase::Idle,
            SyncPhase::Fetching,
            SyncPhase::Deciding,
            SyncPhase::DirectApply,
            SyncPhase::Committing,
            SyncPhase::Idle,
        ]
    );
    assert_eq!(report.summary.inserted, 50);
    assert_eq!(h.store.read_watermark(FEED).await.unwrap(), Some(watermark_at(50)));
    assert_eq!(h.bulk.downloads(), 0);
}

#[tokio::test]
async fn test_large_batch_triggers_bulk_sync() {
    let dir = tempfile::tempdir().unwrap();
    let backlog = notes(1..=12_000);
    let h = Harness::new(
        test_config(dir.path()),
        FakeFeed::new(backlog.clone()),
        FakeBulk::new(backlog, Some(watermark_at(20_000))),
    );
    let controller = h.controller("node-a", CancellationToken::new());

    let report = controller.run_cycle().await.unwrap();

    assert_eq!(report.outcome, CycleOutcome::BulkSynced);
    assert_eq!(report.path, Some(SyncPath::TriggerBulkSync));
    assert!(report.phases.contains(&SyncPhase::TriggerBulkSync));
    assert!(!report.phases.contains(&SyncPhase::DirectApply));
    assert_eq!(report.fetched, 12_000);
    assert_eq!(report.summary.inserted, 12_000);
    assert_eq!(h.bulk.downloads(), 1);
    assert_eq!(h.store.read_watermark(FEED).await.unwrap(), Some(watermark_at(20_000)));
    assert!(h.store.get_note(12_000).await.unwrap().is_some());

    let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftovers, 0, "batch directory removed after commit");
}

#[tokio::test]
async fn test_failed_bulk_batch_is_resumed_by_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let backlog = notes(1..=12_000);
    let h = Harness::new(
        test_config(dir.path()),
        FakeFeed::new(backlog.clone()),
        FakeBulk::new(backlog, Some(watermark_at(20_000))),
    );
    let controller = h.controller("node-a", CancellationToken::new());
    h.store.fail_apply_on_call(1).await;

    let err = controller.run_cycle().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::TransientIo);
    assert_eq!(h.store.read_watermark(FEED).await.unwrap(), None);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1, "unfinished batch kept");

    let report = controller.run_cycle().await.unwrap();

    assert_eq!(report.outcome, CycleOutcome::BulkSynced);
    assert_eq!(h.bulk.downloads(), 1, "resumed without downloading again");
    assert_eq!(report.summary.inserted, 12_000);
    assert_eq!(h.store.read_watermark(FEED).await.unwrap(), Some(watermark_at(20_000)));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_second_cycle_without_new_notes_is_no_work() {
    let (h, _dir) = harness(notes(1..=10));
    let controller = h.controller("node-a", CancellationToken::new());

    controller.run_cycle().await.unwrap();
    let report = controller.run_cycle().await.unwrap();

    assert_eq!(report.outcome, CycleOutcome::NoWork);
    assert_eq!(report.exit_status(), ExitStatus::NoWork);
    assert_eq!(report.work_done(), 0);
    assert_eq!(report.watermark, Some(watermark_at(10)));
}

#[tokio::test]
async fn test_failed_cycle_keeps_watermark() {
    let (h, _dir) = harness(notes(1..=5));
    let controller = h.controller("node-a", CancellationToken::new());
    controller.run_cycle().await.unwrap();

    h.feed.set_notes(notes(1..=8));
    h.feed.fail_with(vec![
        SyncError::TransientIo("connection reset".into()),
        SyncError::TransientIo("connection reset".into()),
    ]);
    let err = controller.run_cycle().await.unwrap_err();

    assert_eq!(err.class(), ErrorClass::TransientIo);
    assert!(matches!(err, SyncError::Exhausted { attempts: 2, .. }));
    assert_eq!(h.store.read_watermark(FEED).await.unwrap(), Some(watermark_at(5)));
    assert!(h.store.get_note(6).await.unwrap().is_none());

    // Next cycle picks up where the last commit left off
    let report = controller.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Applied);
    assert_eq!(h.store.read_watermark(FEED).await.unwrap(), Some(watermark_at(8)));
}

#[tokio::test]
async fn test_watermark_never_regresses() {
    let (h, _dir) = harness(notes(1..=20));
    let controller = h.controller("node-a", CancellationToken::new());
    controller.run_cycle().await.unwrap();

    // Feed now serves only older history
    h.feed.set_notes(notes(1..=3));
    let report = controller.run_cycle().await.unwrap();

    assert_eq!(report.outcome, CycleOutcome::NoWork);
    assert_eq!(h.store.read_watermark(FEED).await.unwrap(), Some(watermark_at(20)));
}

#[tokio::test]
async fn test_run_once_exit_codes() {
    let (h, _dir) = harness(Vec::new());
    let controller = h.controller("node-a", CancellationToken::new());

    assert_eq!(run_once(&controller, h.store.as_ref(), "node-a").await, ExitStatus::NoWork);

    h.feed.set_notes(notes(1..=3));
    assert_eq!(run_once(&controller, h.store.as_ref(), "node-a").await, ExitStatus::Success);

    let status = h.store.read_status("default").await.unwrap().unwrap();
    assert_eq!(status.last_outcome, Some(CycleOutcome::Applied));
    assert_eq!(status.watermark, Some(watermark_at(3)));

    h.feed.fail_with(vec![SyncError::Permanent("feed retired".into())]);
    assert_eq!(run_once(&controller, h.store.as_ref(), "node-a").await, ExitStatus::Permanent);
}

#[tokio::test]
async fn test_run_once_reports_lock_contention() {
    let (h, _dir) = harness(notes(1..=3));
    let controller = h.controller("node-b", CancellationToken::new());
    assert!(h
        .store
        .try_acquire_lock("instance:default", "node-a", Duration::from_secs(60))
        .await
        .unwrap());

    let status = run_once(&controller, h.store.as_ref(), "node-b").await;

    assert_eq!(status, ExitStatus::LockContention);
    assert_eq!(status.code(), 73);
    assert!(h.store.get_note(1).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_daemon_stops_after_consecutive_failures() {
    let (h, _dir) = harness(notes(1..=3));
    h.feed.fail_with(vec![
        SyncError::Permanent("gone".into()),
        SyncError::Permanent("gone".into()),
        SyncError::Permanent("gone".into()),
    ]);
    let loader: ConfigLoader = Box::new(|| Err(SyncError::Config("unused".into())));
    let daemon = Daemon::new(
        h.config.clone(),
        loader,
        factory(&h, "node-a"),
        h.store.clone(),
        "node-a",
        CancellationToken::new(),
    );
    let status = daemon.status();

    let err = daemon.run().await.unwrap_err();

    assert_eq!(err.class(), ErrorClass::Permanent);
    assert_eq!(ExitStatus::for_error(&err), ExitStatus::Permanent);
    assert_eq!(h.feed.fetches(), 3);
    let current = status.current().await;
    assert_eq!(current.consecutive_failures, 3);
    assert_eq!(current.last_error_class, Some(ErrorClass::Permanent));
    assert!(h
        .store
        .try_acquire_lock("instance:default", "node-b", Duration::from_secs(60))
        .await
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_daemon_shuts_down_gracefully() {
    let (h, _dir) = harness(notes(1..=3));
    let cancel = CancellationToken::new();
    h.feed.cancel_after(2, cancel.clone());
    let loader: ConfigLoader = Box::new(|| Err(SyncError::Config("unused".into())));
    let daemon = Daemon::new(
        h.config.clone(),
        loader,
        factory(&h, "node-a"),
        h.store.clone(),
        "node-a",
        cancel,
    );

    daemon.run().await.unwrap();

    assert_eq!(h.feed.fetches(), 2);
    assert_eq!(h.store.read_watermark(FEED).await.unwrap(), Some(watermark_at(3)));
    let status = h.store.read_status("default").await.unwrap().unwrap();
    assert_eq!(status.consecutive_failures, 0);
    assert!(h
        .store
        .try_acquire_lock("instance:default", "node-b", Duration::from_secs(60))
        .await
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_daemon_keeps_running_when_reload_fails() {
    let (h, _dir) = harness(notes(1..=3));
    let cancel = CancellationToken::new();
    h.feed.cancel_after(2, cancel.clone());
    let loads = Arc::new(AtomicUsize::new(0));
    let loader: ConfigLoader = {
        let loads = loads.clone();
        Box::new(move || {
            loads.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Config("broken file".into()))
        })
    };
    let daemon = Daemon::new(
        h.config.clone(),
        loader,
        factory(&h, "node-a"),
        h.store.clone(),
        "node-a",
        cancel,
    );
    daemon.reload_handle().request();

    daemon.run().await.unwrap();

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(h.feed.fetches(), 2);
    assert_eq!(h.store.read_watermark(FEED).await.unwrap(), Some(watermark_at(3)));
}

#[tokio::test]
async fn test_reloaded_config_drives_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(
        test_config(dir.path()),
        FakeFeed::new(notes(1..=50)),
        FakeBulk::new(notes(1..=50), Some(watermark_at(60))),
    );
    let cancel = CancellationToken::new();
    h.feed.cancel_after(2, cancel.clone());
    let loader: ConfigLoader = {
        let base = h.config.clone();
        Box::new(move || {
            let mut config = base.clone();
            config.sync.direct_apply_threshold = 10;
            Ok(config)
        })
    };
    let daemon = Daemon::new(
        h.config.clone(),
        loader,
        factory(&h, "node-a"),
        h.store.clone(),
        "node-a",
        cancel,
    );
    daemon.reload_handle().request();

    daemon.run().await.unwrap();

    // 50 notes are below the original threshold but above the reloaded one
    assert_eq!(h.bulk.downloads(), 1);
    assert_eq!(h.store.read_watermark(FEED).await.unwrap(), Some(watermark_at(60)));
    assert_eq!(h.feed.fetches(), 2);
}

#[tokio::test]
async fn test_second_daemon_for_same_instance_is_refused() {
    let (h, _dir) = harness(Vec::new());
    assert!(h
        .store
        .try_acquire_lock("instance:default", "node-a", Duration::from_secs(60))
        .await
        .unwrap());
    let loader: ConfigLoader = Box::new(|| Err(SyncError::Config("unused".into())));
    let daemon = Daemon::new(
        h.config.clone(),
        loader,
        factory(&h, "node-b"),
        h.store.clone(),
        "node-b",
        CancellationToken::new(),
    );

    let err = daemon.run().await.unwrap_err();

    assert!(matches!(err, SyncError::LockHeld { .. }));
    assert_eq!(h.feed.fetches(), 0);
}
