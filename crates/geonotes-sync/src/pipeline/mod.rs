//! Bulk ingestion: split a dump, convert partitions in parallel, consolidate
//!
//! ```text
//! dump.csv ──split──▶ [p1 p2 … pN] ──WorkerPool──▶ part-*.jsonl + manifests
//!                                                        │
//!                                  Consolidator ◀────────┘ (under lock)
//! ```
//!
//! Each batch lives in its own directory under the work directory, next to a
//! `batch.json` record of the dump it came from. A batch that did not commit
//! is resumed by the next bulk run, up to `max_batch_attempts` runs; older
//! or broken batch directories are removed.

pub mod consolidator;
pub mod splitter;
pub mod worker;

pub use consolidator::{Consolidation, Consolidator, CONSOLIDATE_LOCK};
pub use worker::{PartitionOutput, PartitionWorker, PoolReport, WorkerPool};

use crate::config::BulkConfig;
use crate::convert::FormatConverter;
use crate::error::{join_error, Result};
use crate::models::Watermark;
use crate::retry::RetryExecutor;
use crate::source::BulkDump;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Dump file inside a batch directory
pub const DUMP_FILE: &str = "dump.csv";
/// Batch record inside a batch directory
pub const BATCH_FILE: &str = "batch.json";

/// What is needed to pick a batch up again in a later process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: String,
    pub marker: Option<Watermark>,
    pub sha256: String,
    /// Runs started on this batch so far
    pub attempts: u32,
}

/// Outcome of one bulk ingestion run
#[derive(Debug, Clone)]
pub struct BulkReport {
    pub batch_id: String,
    pub partitions: usize,
    pub pool: PoolReport,
    pub consolidation: Consolidation,
}

impl BulkReport {
    pub fn is_committed(&self) -> bool {
        matches!(self.consolidation, Consolidation::Committed { .. })
    }
}

pub struct BulkPipeline {
    store: Arc<dyn Store>,
    converter: Arc<dyn FormatConverter>,
    pool: WorkerPool,
    consolidator: Consolidator,
    partitions: usize,
    max_attempts: u32,
    work_dir: PathBuf,
}

impl BulkPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        converter: Arc<dyn FormatConverter>,
        retry: RetryExecutor,
        config: &BulkConfig,
        feed: &str,
        holder: &str,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            pool: WorkerPool::new(store.clone(), retry, config.parallelism, config.failure_mode),
            consolidator: Consolidator::new(store.clone(), feed, holder, lock_ttl),
            store,
            converter,
            partitions: config.partitions,
            max_attempts: config.max_batch_attempts.max(1),
            work_dir: config.work_dir.clone(),
        }
    }

    /// Directory holding the dump and artifacts of `batch_id`
    pub fn batch_dir(work_dir: &Path, batch_id: &str) -> PathBuf {
        work_dir.join(batch_id)
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Run the whole pipeline over a downloaded dump
    pub async fn run(&self, dump: &BulkDump, batch_id: &str) -> Result<BulkReport> {
        let partitions = {
            let path = dump.path.clone();
            let count = self.partitions;
            let converter = self.converter.clone();
            tokio::task::spawn_blocking(move || splitter::split(&path, count, converter.as_ref()))
                .await
                .map_err(join_error)??
        };
        let count = partitions.len();
        info!(batch_id, partitions = count, dump = %dump.path.display(), "Dump split");

        let worker = self.worker(dump, batch_id);
        let pool = self.pool.run(batch_id, &worker, partitions).await?;
        self.finish(dump, batch_id, count, pool).await
    }

    /// Write the batch record for a freshly downloaded dump
    pub async fn record_batch(&self, batch_id: &str, dump: &BulkDump) -> Result<()> {
        let record = BatchRecord {
            batch_id: batch_id.to_string(),
            marker: dump.marker,
            sha256: dump.sha256.clone(),
            attempts: 1,
        };
        self.write_record(&record).await
    }

    async fn write_record(&self, record: &BatchRecord) -> Result<()> {
        let path = Self::batch_dir(&self.work_dir, &record.batch_id).join(BATCH_FILE);
        tokio::fs::write(&path, serde_json::to_vec_pretty(record)?).await?;
        Ok(())
    }

    /// Claim the newest uncommitted batch for another run
    ///
    /// Every other batch directory is removed, as is the newest one when it
    /// has no usable record or dump (an interrupted download) or has used up
    /// its attempts. The returned record already counts the new run.
    pub async fn take_resumable(&self) -> Result<Option<(BatchRecord, BulkDump)>> {
        let mut entries = match tokio::fs::read_dir(&self.work_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut batches = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                batches.push(entry.path());
            }
        }
        // Batch ids start with their creation time
        batches.sort();
        let Some(newest) = batches.pop() else {
            return Ok(None);
        };
        for stale in batches {
            warn!(dir = %stale.display(), anomaly = "bulk_batch_superseded", "Removing superseded batch");
            remove_batch_dir(&stale).await;
        }

        let dump_path = newest.join(DUMP_FILE);
        let record = match tokio::fs::read(newest.join(BATCH_FILE)).await {
            Ok(raw) => serde_json::from_slice::<BatchRecord>(&raw).ok(),
            Err(_) => None,
        };
        let Some(mut record) = record.filter(|_| dump_path.exists()) else {
            warn!(dir = %newest.display(), "Removing batch without a complete dump");
            remove_batch_dir(&newest).await;
            return Ok(None);
        };
        if record.attempts >= self.max_attempts {
            error!(
                batch_id = %record.batch_id,
                attempts = record.attempts,
                anomaly = "bulk_batch_abandoned",
                "Batch failed on every attempt, abandoning it"
            );
            remove_batch_dir(&newest).await;
            return Ok(None);
        }

        record.attempts += 1;
        self.write_record(&record).await?;
        info!(batch_id = %record.batch_id, attempt = record.attempts, "Resuming unfinished batch");
        let dump = BulkDump {
            path: dump_path,
            marker: record.marker,
            sha256: record.sha256.clone(),
        };
        Ok(Some((record, dump)))
    }

    /// Carry an earlier batch to the end from wherever it stopped
    pub async fn resume(&self, dump: &BulkDump, batch_id: &str) -> Result<BulkReport> {
        if self.store.list_partitions(batch_id).await?.is_empty() {
            debug!(batch_id, "Batch was never split, running it from the start");
            return self.run(dump, batch_id).await;
        }
        self.retry_failed(dump, batch_id).await
    }

    /// Re-run unfinished partitions of an earlier batch, then consolidate it
    pub async fn retry_failed(&self, dump: &BulkDump, batch_id: &str) -> Result<BulkReport> {
        let worker = self.worker(dump, batch_id);
        let retried = self.pool.retry_failed(batch_id, &worker).await?;
        let count = self.store.list_partitions(batch_id).await?.len();
        self.finish(dump, batch_id, count, retried).await
    }

    fn worker(&self, dump: &BulkDump, batch_id: &str) -> PartitionWorker {
        PartitionWorker::new(
            &dump.path,
            Self::batch_dir(&self.work_dir, batch_id).join("parts"),
            self.converter.clone(),
        )
    }

    async fn finish(&self, dump: &BulkDump, batch_id: &str, partitions: usize, pool: PoolReport) -> Result<BulkReport> {
        let parts_dir = Self::batch_dir(&self.work_dir, batch_id).join("parts");
        let consolidation = self.consolidator.consolidate(batch_id, &parts_dir, dump.marker).await?;
        if let Consolidation::Committed { .. } = consolidation {
            remove_batch_dir(&Self::batch_dir(&self.work_dir, batch_id)).await;
        }
        Ok(BulkReport {
            batch_id: batch_id.to_string(),
            partitions,
            pool,
            consolidation,
        })
    }
}

async fn remove_batch_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!(dir = %dir.display(), error = %e, "Failed to remove batch directory");
    }
}

/// New batch identifier, sortable by start time
pub fn new_batch_id() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%SZ"),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}
