//! Shared fixtures for the geonotes-sync integration tests
//!
//! In-memory fakes for the remote sources plus helpers that wire a controller
//! or verification engine to a [`MemoryStore`].

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use geonotes_sync::config::{FailureMode, SyncConfig};
use geonotes_sync::controller::{Collaborators, SyncController};
use geonotes_sync::convert::CsvNoteConverter;
use geonotes_sync::error::{Result, SyncError};
use geonotes_sync::models::{Coordinates, NoteRecord, NoteStatus, RegionBoundary, Watermark};
use geonotes_sync::scheduler::UnlimitedCapacity;
use geonotes_sync::source::{BulkDump, BulkSource, FeedBatch, NoteFeed};
use geonotes_sync::store::MemoryStore;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,geonotes_sync=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Note `id` last updated `minutes` after the base time
pub fn note(id: i64, lat: f64, lon: f64, minutes: i64) -> NoteRecord {
    NoteRecord {
        id,
        location: Coordinates::new(lat, lon).unwrap(),
        created_at: base_time(),
        updated_at: base_time() + ChronoDuration::minutes(minutes),
        closed_at: None,
        status: NoteStatus::Open,
        comments: Vec::new(),
    }
}

pub fn watermark_at(minutes: i64) -> Watermark {
    Watermark(base_time() + ChronoDuration::minutes(minutes))
}

/// Feed serving a fixed set of notes
#[derive(Default)]
pub struct FakeFeed {
    notes: Mutex<Vec<NoteRecord>>,
    failures: Mutex<Vec<SyncError>>,
    fetches: AtomicUsize,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl FakeFeed {
    pub fn new(notes: Vec<NoteRecord>) -> Self {
        let feed = Self::default();
        feed.set_notes(notes);
        feed
    }

    pub fn set_notes(&self, notes: Vec<NoteRecord>) {
        *self.notes.lock().unwrap() = notes;
    }

    /// Fail the next fetches with these errors, in order
    pub fn fail_with(&self, errors: Vec<SyncError>) {
        *self.failures.lock().unwrap() = errors;
    }

    /// Cancel `token` once `fetches` fetches have been served
    pub fn cancel_after(&self, fetches: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((fetches, token));
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NoteFeed for FakeFeed {
    async fn fetch_since(&self, since: Option<Watermark>, limit: usize) -> Result<FeedBatch> {
        let count = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if count >= *after {
                token.cancel();
            }
        }
        {
            let mut failures = self.failures.lock().unwrap();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }

        let mut notes: Vec<NoteRecord> = self
            .notes
            .lock()
            .unwrap()
            .iter()
            .filter(|n| since.is_none_or(|since| n.updated_at >= since.0))
            .cloned()
            .collect();
        notes.sort_by_key(|n| (n.updated_at, n.id));
        notes.truncate(limit);
        Ok(FeedBatch::from_notes(notes))
    }
}

/// Bulk source writing a CSV dump of fixed notes
pub struct FakeBulk {
    notes: Vec<NoteRecord>,
    marker: Option<Watermark>,
    downloads: AtomicUsize,
}

impl FakeBulk {
    pub fn new(notes: Vec<NoteRecord>, marker: Option<Watermark>) -> Self {
        Self {
            notes,
            marker,
            downloads: AtomicUsize::new(0),
        }
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BulkSource for FakeBulk {
    async fn download(&self, dest: &Path) -> Result<BulkDump> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let bytes = CsvNoteConverter::new().encode(&self.notes)?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(BulkDump {
            path: dest.to_path_buf(),
            marker: self.marker,
            sha256: geonotes_common::checksum::sha256_bytes(&bytes),
        })
    }
}

/// Square region boundary with corners `(min, min)` and `(max, max)` in lon/lat
pub fn square_boundary(id: i64, min: f64, max: f64) -> RegionBoundary {
    RegionBoundary {
        id,
        name: format!("region-{id}"),
        polygons: vec![vec![vec![[min, min], [max, min], [max, max], [min, max], [min, min]]]],
    }
}

/// Configuration tuned for fast tests
pub fn test_config(work_dir: &Path) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.bulk.work_dir = work_dir.to_path_buf();
    config.bulk.partitions = 4;
    config.bulk.parallelism = 2;
    config.bulk.failure_mode = FailureMode::FailFast;
    config.sync.direct_apply_threshold = 10_000;
    config.sync.min_sleep_secs = 1;
    config.sync.max_sleep_secs = 8;
    config.sync.max_consecutive_failures = 3;
    config.scheduler.poll_interval_ms = 10;
    config.retry.max_attempts = 2;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.verify.chunk_size = 1_000;
    config.verify.parallelism = 2;
    config
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub feed: Arc<FakeFeed>,
    pub bulk: Arc<FakeBulk>,
    pub config: SyncConfig,
}

impl Harness {
    pub fn new(config: SyncConfig, feed: FakeFeed, bulk: FakeBulk) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            feed: Arc::new(feed),
            bulk: Arc::new(bulk),
            config,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: self.store.clone(),
            feed: self.feed.clone(),
            bulk: self.bulk.clone(),
            feed_capacity: Arc::new(UnlimitedCapacity),
            dump_capacity: Arc::new(UnlimitedCapacity),
            converter: Arc::new(CsvNoteConverter::new()),
        }
    }

    pub fn controller(&self, holder: &str, cancel: CancellationToken) -> SyncController {
        SyncController::new(self.collaborators(), &self.config, holder, cancel)
    }
}
