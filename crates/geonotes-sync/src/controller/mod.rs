//! Incremental sync controller
//!
//! One cycle walks the state machine
//!
//! ```text
//! Idle → Fetching → Deciding ─┬─▶ DirectApply ─────┬─▶ Committing → Idle
//!                             └─▶ TriggerBulkSync ─┘
//! ```
//!
//! Small feed batches are applied directly under the consolidation lock.
//! Batches larger than the direct-apply threshold mean the feed is too far
//! behind, so the cycle downloads a full dump and runs it through the bulk
//! pipeline instead; a batch an earlier cycle left unfinished is resumed
//! before any new download. [`daemon`] loops cycles; one-shot runs call
//! [`SyncController::run_cycle`] once.

pub mod daemon;

pub use daemon::{run_once, ConfigLoader, ControllerFactory, Daemon, ReloadHandle, StatusHandle};

use crate::config::{ControllerConfig, SyncConfig};
use crate::convert::FormatConverter;
use crate::error::{ExitStatus, Result, SyncError};
use crate::models::{CycleOutcome, SyncPhase, SyncStatusRecord, Watermark};
use crate::pipeline::{new_batch_id, BulkPipeline, Consolidation, CONSOLIDATE_LOCK, DUMP_FILE};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::scheduler::{CapacityProbe, TicketQueue, DUMP_QUEUE, FEED_QUEUE};
use crate::source::{BulkDump, BulkSource, NoteFeed};
use crate::store::{with_lock, ApplySummary, Store};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Watermark key of the notes feed
pub const NOTES_FEED: &str = "notes";

/// Everything the controller talks to
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub feed: Arc<dyn NoteFeed>,
    pub bulk: Arc<dyn BulkSource>,
    pub feed_capacity: Arc<dyn CapacityProbe>,
    pub dump_capacity: Arc<dyn CapacityProbe>,
    pub converter: Arc<dyn FormatConverter>,
}

/// Which way the deciding phase went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPath {
    DirectApply,
    TriggerBulkSync,
}

/// Batches strictly larger than the threshold go through a bulk sync
pub fn decide(fetched: usize, threshold: usize) -> SyncPath {
    if fetched > threshold {
        SyncPath::TriggerBulkSync
    } else {
        SyncPath::DirectApply
    }
}

/// What a completed cycle did
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub path: Option<SyncPath>,
    /// Phases visited, in order, starting and ending at `Idle`
    pub phases: Vec<SyncPhase>,
    /// Feed records fetched
    pub fetched: usize,
    pub summary: ApplySummary,
    pub watermark: Option<Watermark>,
}

impl CycleReport {
    /// Records written to the store
    pub fn work_done(&self) -> u64 {
        self.summary.touched()
    }

    pub fn exit_status(&self) -> ExitStatus {
        match self.outcome {
            CycleOutcome::NoWork => ExitStatus::NoWork,
            _ => ExitStatus::Success,
        }
    }
}

pub struct SyncController {
    collaborators: Collaborators,
    config: ControllerConfig,
    fetch_limit: usize,
    feed_queue: TicketQueue,
    dump_queue: TicketQueue,
    retry: RetryExecutor,
    pipeline: BulkPipeline,
    holder: String,
}

impl SyncController {
    pub fn new(collaborators: Collaborators, config: &SyncConfig, holder: &str, cancel: CancellationToken) -> Self {
        let retry = RetryExecutor::new(RetryPolicy::from_config(&config.retry), cancel.clone());
        let store = collaborators.store.clone();
        let queue = |name: &str, capacity: &Arc<dyn CapacityProbe>| {
            TicketQueue::new(name, store.clone(), capacity.clone(), &config.scheduler, holder, cancel.clone())
        };

        Self {
            feed_queue: queue(FEED_QUEUE, &collaborators.feed_capacity),
            dump_queue: queue(DUMP_QUEUE, &collaborators.dump_capacity),
            pipeline: BulkPipeline::new(
                store.clone(),
                collaborators.converter.clone(),
                retry.clone(),
                &config.bulk,
                NOTES_FEED,
                holder,
                config.sync.lock_ttl(),
            ),
            retry,
            config: config.sync.clone(),
            fetch_limit: config.feed.fetch_limit,
            holder: holder.to_string(),
            collaborators,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn store(&self) -> &dyn Store {
        self.collaborators.store.as_ref()
    }

    /// Run one full cycle of the state machine
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut phases = vec![SyncPhase::Idle, SyncPhase::Fetching];

        let since = self.store().read_watermark(NOTES_FEED).await?;
        let feed = self.collaborators.feed.clone();
        let limit = self.fetch_limit;
        let batch = self
            .retry
            .execute("fetch notes feed", None, |_| {
                let feed = feed.clone();
                self.feed_queue.run(move || async move { feed.fetch_since(since, limit).await })
            })
            .await?;
        debug!(fetched = batch.len(), since = ?since.map(|w| w.to_string()), "Feed fetched");

        phases.push(SyncPhase::Deciding);
        let high_marker = match batch.high_marker {
            Some(high) if since.is_none_or(|since| high > since) => high,
            _ => {
                phases.push(SyncPhase::Idle);
                info!(fetched = batch.len(), "No new notes since watermark");
                return Ok(CycleReport {
                    outcome: CycleOutcome::NoWork,
                    path: None,
                    phases,
                    fetched: batch.len(),
                    summary: ApplySummary::default(),
                    watermark: since,
                });
            },
        };

        let path = decide(batch.len(), self.config.direct_apply_threshold);
        info!(fetched = batch.len(), threshold = self.config.direct_apply_threshold, path = ?path, "Sync path decided");

        let (outcome, summary, watermark) = match path {
            SyncPath::DirectApply => {
                phases.push(SyncPhase::DirectApply);
                phases.push(SyncPhase::Committing);
                let (summary, watermark) = with_lock(
                    self.store(),
                    CONSOLIDATE_LOCK,
                    &self.holder,
                    self.config.lock_ttl(),
                    || async {
                        let summary = self.store().apply_notes(&batch.notes).await?;
                        let watermark = self.store().advance_watermark(NOTES_FEED, since, high_marker).await?;
                        Ok::<_, SyncError>((summary, watermark))
                    },
                )
                .await?;
                (CycleOutcome::Applied, summary, Some(watermark))
            },
            SyncPath::TriggerBulkSync => {
                phases.push(SyncPhase::TriggerBulkSync);
                let (summary, watermark) = self.bulk_sync().await?;
                phases.push(SyncPhase::Committing);
                (CycleOutcome::BulkSynced, summary, watermark)
            },
        };
        phases.push(SyncPhase::Idle);

        info!(
            outcome = ?outcome,
            inserted = summary.inserted,
            updated = summary.updated,
            skipped_stale = summary.skipped_stale,
            watermark = ?watermark.map(|w| w.to_string()),
            "Cycle committed"
        );
        Ok(CycleReport {
            outcome,
            path: Some(path),
            phases,
            fetched: batch.len(),
            summary,
            watermark,
        })
    }

    /// Resume the newest unfinished batch, or download and run a new one
    async fn bulk_sync(&self) -> Result<(ApplySummary, Option<Watermark>)> {
        let (batch_id, report) = match self.pipeline.take_resumable().await? {
            Some((record, dump)) => {
                let report = self.pipeline.resume(&dump, &record.batch_id).await?;
                (record.batch_id, report)
            },
            None => {
                let batch_id = new_batch_id();
                let dump = self.download_dump(&batch_id).await?;
                self.pipeline.record_batch(&batch_id, &dump).await?;
                let report = self.pipeline.run(&dump, &batch_id).await?;
                (batch_id, report)
            },
        };

        match report.consolidation {
            Consolidation::Committed { watermark, summary } => Ok((summary, watermark)),
            Consolidation::Incomplete { pending, .. } => Err(SyncError::DataValidation(format!(
                "bulk batch {batch_id} incomplete, partitions {pending:?} not done"
            ))),
        }
    }

    async fn download_dump(&self, batch_id: &str) -> Result<BulkDump> {
        let batch_dir = BulkPipeline::batch_dir(self.pipeline.work_dir(), batch_id);
        tokio::fs::create_dir_all(&batch_dir).await?;
        let dest = batch_dir.join(DUMP_FILE);
        info!(batch_id, dest = %dest.display(), "Starting bulk sync");

        let bulk = self.collaborators.bulk.clone();
        self.retry
            .execute("download dump", Some(&dest), |_| {
                let bulk = bulk.clone();
                let dest = dest.clone();
                self.dump_queue.run(move || async move { bulk.download(&dest).await })
            })
            .await
    }

    /// Fold a cycle result into the status record and persist it
    ///
    /// Returns the updated consecutive-failure count.
    pub async fn record_status(&self, status: &mut SyncStatusRecord, result: &Result<CycleReport>) -> u32 {
        match result {
            Ok(report) => {
                status.last_outcome = Some(report.outcome);
                status.last_error_class = None;
                status.last_error = None;
                status.consecutive_failures = 0;
                status.watermark = report.watermark.or(status.watermark);
            },
            Err(e) => {
                status.last_outcome = Some(CycleOutcome::Failed);
                status.last_error_class = Some(e.class());
                status.last_error = Some(e.to_string());
                status.consecutive_failures += 1;
            },
        }
        status.phase = SyncPhase::Idle;
        status.updated_at = Utc::now();

        if let Err(e) = self.store().write_status(status).await {
            warn!(instance = %status.instance, error = %e, "Failed to persist sync status");
        }
        status.consecutive_failures
    }
}

/// Sleep before the next cycle, adapted to the work just done
///
/// Halves toward `min` after substantial work, doubles toward `max` when
/// idle, and keeps the current value otherwise.
pub fn next_sleep(current: Duration, work_done: u64, config: &ControllerConfig) -> Duration {
    let (min, max) = (config.min_sleep(), config.max_sleep());
    let next = if work_done >= config.substantial_work as u64 {
        current / 2
    } else if work_done == 0 {
        current.saturating_mul(2)
    } else {
        current
    };
    next.clamp(min, max)
}
