//! Resumable, chunked region verification and assignment
//!
//! The note id space is cut into fixed chunks ([`chunks`]). Chunks run in
//! parallel and in any order; each one commits its own store mutations, and
//! the persisted cursor of the pass is then moved over the contiguous prefix
//! of finished chunks. A restart resumes after the cursor. A failed chunk is
//! retried, and if it still fails the cursor stays below it so the next run
//! picks it up again.

pub mod boundaries;
pub mod chunks;
pub mod spatial;

pub use boundaries::BoundaryRefresher;
pub use chunks::{Chunk, ChunkPlan, CursorTracker};
pub use spatial::{RegionIndex, ResolveStats};

use crate::config::VerifyConfig;
use crate::error::{ErrorClass, Result, SyncError};
use crate::models::{RegionAssignment, StoredNote};
use crate::retry::RetryExecutor;
use crate::store::Store;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a pass does with each note
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationPass {
    /// Move assignments that no longer match the boundaries back to `Unknown`
    Verify,
    /// Derive assignments for `Unknown` notes
    Assign,
}

impl VerificationPass {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationPass::Verify => "verify",
            VerificationPass::Assign => "assign",
        }
    }

    /// Name of the persisted chunk cursor for this pass
    pub fn cursor_name(&self) -> String {
        format!("regions:{}", self.as_str())
    }
}

impl fmt::Display for VerificationPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationPass {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "verify" => Ok(VerificationPass::Verify),
            "assign" => Ok(VerificationPass::Assign),
            other => Err(SyncError::Config(format!("unknown verification pass: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFailure {
    pub chunk: Chunk,
    pub class: ErrorClass,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationReport {
    pub pass: VerificationPass,
    pub resumed_from: i64,
    /// Persisted cursor after the run
    pub completed_up_to: i64,
    pub chunks_processed: usize,
    pub failed_chunks: Vec<ChunkFailure>,
    pub invalidated: u64,
    pub assigned: u64,
    pub stats: ResolveStats,
    /// Shutdown stopped the run before every chunk was attempted
    pub interrupted: bool,
}

impl VerificationReport {
    fn new(pass: VerificationPass, cursor: i64) -> Self {
        Self {
            pass,
            resumed_from: cursor,
            completed_up_to: cursor,
            chunks_processed: 0,
            failed_chunks: Vec::new(),
            invalidated: 0,
            assigned: 0,
            stats: ResolveStats::default(),
            interrupted: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed_chunks.is_empty() && !self.interrupted
    }
}

/// Mutations decided for one chunk
#[derive(Debug, Default)]
struct ChunkOutcome {
    invalidated: u64,
    assigned: u64,
    stats: ResolveStats,
}

pub struct VerificationEngine {
    store: Arc<dyn Store>,
    retry: RetryExecutor,
    plan: ChunkPlan,
    parallelism: usize,
    grid_cell_degrees: f64,
    cancel: CancellationToken,
}

impl VerificationEngine {
    pub fn new(store: Arc<dyn Store>, retry: RetryExecutor, config: &VerifyConfig, cancel: CancellationToken) -> Result<Self> {
        Ok(Self {
            store,
            retry,
            plan: ChunkPlan::new(config.chunk_size)?,
            parallelism: config.parallelism.max(1),
            grid_cell_degrees: config.grid_cell_degrees,
            cancel,
        })
    }

    /// Run `pass` from its persisted cursor, or from scratch with `reset`
    pub async fn run(&self, pass: VerificationPass, reset: bool) -> Result<VerificationReport> {
        let cursor_name = pass.cursor_name();
        if reset {
            self.store.reset_chunk_cursor(&cursor_name).await?;
            info!(pass = %pass, "Cursor reset, starting a full pass");
        }
        let resume = self.store.read_chunk_cursor(&cursor_name).await?;
        let mut report = VerificationReport::new(pass, resume);

        let Some((min_id, max_id)) = self.store.note_id_bounds().await? else {
            info!(pass = %pass, "No notes stored, nothing to verify");
            return Ok(report);
        };
        let chunks = self.plan.remaining(resume, min_id, max_id);
        let Some(first) = chunks.first().copied() else {
            info!(pass = %pass, cursor = resume, max_id, "Pass already complete");
            return Ok(report);
        };

        let regions = self.store.load_regions().await?;
        if regions.is_empty() {
            return Err(SyncError::Permanent(
                "no region boundaries stored, refresh boundaries before verifying".into(),
            ));
        }
        let index = Arc::new(RegionIndex::build(regions, self.grid_cell_degrees)?);
        info!(
            pass = %pass,
            resume_from = resume,
            chunks = chunks.len(),
            chunk_size = self.plan.size(),
            regions = index.len(),
            "Verification started"
        );

        let mut tracker = CursorTracker::new(first.start - 1);
        let mut results = stream::iter(chunks)
            .map(|chunk| {
                let index = index.clone();
                async move { (chunk, self.process_chunk(pass, &index, chunk).await) }
            })
            .buffer_unordered(self.parallelism);

        while let Some((chunk, result)) = results.next().await {
            match result {
                Ok(outcome) => {
                    report.chunks_processed += 1;
                    report.invalidated += outcome.invalidated;
                    report.assigned += outcome.assigned;
                    report.stats.merge(outcome.stats);

                    if let Some(to) = tracker.complete(chunk) {
                        let stored = self.store.advance_chunk_cursor(&cursor_name, to).await?;
                        if stored > to {
                            debug!(pass = %pass, cursor = stored, local = to, "Cursor already ahead");
                        }
                        report.completed_up_to = stored;
                    }
                },
                Err(e) if e.is_cancelled() => report.interrupted = true,
                Err(e) => {
                    error!(
                        pass = %pass,
                        chunk_start = chunk.start,
                        chunk_end = chunk.end,
                        error = %e,
                        class = %e.class(),
                        "Chunk failed, cursor held below it"
                    );
                    report.failed_chunks.push(ChunkFailure {
                        chunk,
                        class: e.class(),
                        error: e.to_string(),
                    });
                },
            }
        }

        report.failed_chunks.sort_by_key(|f| f.chunk);
        if pass == VerificationPass::Verify && report.invalidated > 0 {
            // Invalidated notes may sit below the assign cursor
            self.store
                .reset_chunk_cursor(&VerificationPass::Assign.cursor_name())
                .await?;
            info!(invalidated = report.invalidated, "Assign cursor reset to pick up invalidated notes");
        }
        if tracker.waiting() > 0 {
            warn!(
                pass = %pass,
                waiting = tracker.waiting(),
                cursor = report.completed_up_to,
                "Finished chunks above an unfinished one will be redone next run"
            );
        }
        info!(
            pass = %pass,
            completed_up_to = report.completed_up_to,
            processed = report.chunks_processed,
            failed = report.failed_chunks.len(),
            invalidated = report.invalidated,
            assigned = report.assigned,
            fast_path_hits = report.stats.fast_path_hits,
            full_searches = report.stats.full_searches,
            exact_tests = report.stats.exact_tests,
            "Verification finished"
        );
        Ok(report)
    }

    async fn process_chunk(&self, pass: VerificationPass, index: &RegionIndex, chunk: Chunk) -> Result<ChunkOutcome> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let operation = format!("{pass} chunk {chunk}");
        self.retry
            .execute(&operation, None, |_| async move {
                let notes = self.store.notes_in_range(chunk.start, chunk.end).await?;
                let mut outcome = ChunkOutcome::default();
                match pass {
                    VerificationPass::Verify => {
                        let stale = find_stale(&notes, index, &mut outcome.stats);
                        if !stale.is_empty() {
                            outcome.invalidated = self.store.invalidate_regions(&stale).await?;
                        }
                    },
                    VerificationPass::Assign => {
                        let derived: Vec<_> = notes
                            .iter()
                            .filter(|n| n.region.is_unknown())
                            .map(|n| (n.id, index.resolve(n.location, None, &mut outcome.stats)))
                            .collect();
                        if !derived.is_empty() {
                            outcome.assigned = self.store.assign_regions(&derived).await?;
                        }
                    },
                }
                debug!(
                    pass = %pass,
                    chunk_start = chunk.start,
                    chunk_end = chunk.end,
                    notes = notes.len(),
                    invalidated = outcome.invalidated,
                    assigned = outcome.assigned,
                    "Chunk committed"
                );
                Ok(outcome)
            })
            .await
    }
}

/// Notes whose stored assignment no longer matches the boundaries
fn find_stale(notes: &[StoredNote], index: &RegionIndex, stats: &mut ResolveStats) -> Vec<i64> {
    notes
        .iter()
        .filter(|note| match note.region {
            RegionAssignment::Unknown => false,
            RegionAssignment::Assigned(id) => {
                index.resolve(note.location, Some(id), stats) != RegionAssignment::Assigned(id)
            },
            RegionAssignment::KnownUnassigned => {
                index.resolve(note.location, None, stats) != RegionAssignment::KnownUnassigned
            },
        })
        .map(|note| note.id)
        .collect()
}
