//! Durable state behind the sync engine
//!
//! The canonical note store is the only place where correctness-critical
//! mutation happens. Everything that coordinates separate processes (ticket
//! counters, watermarks, chunk cursors, leased locks) lives next to it so that
//! no forward progress is held only in memory.
//!
//! Two implementations exist: [`postgres::PgStore`] for multi-process
//! deployments and [`memory::MemoryStore`] for single-process runs and tests.

pub mod memory;
pub mod postgres;

use crate::error::{Result, SyncError};
use crate::models::{
    NoteId, NoteRecord, Partition, QueueState, Region, RegionAssignment, RegionBoundary,
    StoredNote, SyncStatusRecord, Ticket, Watermark,
};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Counts reported by an upsert batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub inserted: u64,
    pub updated: u64,
    /// Incoming records older than the stored version
    pub skipped_stale: u64,
    pub comments: u64,
}

impl ApplySummary {
    pub fn merge(&mut self, other: ApplySummary) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped_stale += other.skipped_stale;
        self.comments += other.comments;
    }

    pub fn touched(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Canonical note and region storage
#[async_trait]
pub trait NoteRepository: Send + Sync {
    /// Idempotent batch upsert keyed by note id, applied atomically
    ///
    /// A stored note is only overwritten by a version with `updated_at` at
    /// least as new. Moving a note resets its region to `Unknown`.
    async fn apply_notes(&self, notes: &[NoteRecord]) -> Result<ApplySummary>;

    async fn get_note(&self, id: NoteId) -> Result<Option<StoredNote>>;

    /// Smallest and largest stored note id
    async fn note_id_bounds(&self) -> Result<Option<(NoteId, NoteId)>>;

    /// Notes with `start <= id <= end`, ordered by id
    async fn notes_in_range(&self, start: NoteId, end: NoteId) -> Result<Vec<StoredNote>>;

    /// Move assignments to `Unknown`; already-unknown notes are untouched
    ///
    /// Returns the number of notes that changed.
    async fn invalidate_regions(&self, ids: &[NoteId]) -> Result<u64>;

    /// Record derived assignments, only for notes still `Unknown`
    async fn assign_regions(&self, assignments: &[(NoteId, RegionAssignment)]) -> Result<u64>;

    async fn load_regions(&self) -> Result<Vec<Region>>;

    /// Insert or replace boundaries; returns how many were new or changed
    async fn upsert_regions(&self, regions: &[RegionBoundary]) -> Result<u64>;
}

/// Forward-progress markers and run bookkeeping
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn read_watermark(&self, feed: &str) -> Result<Option<Watermark>>;

    /// Advance the feed watermark to `new` after a commit
    ///
    /// `expected` is the value the caller read before the batch. A stored
    /// value below it means the marker regressed behind our back, which is a
    /// consistency failure. The stored value never decreases; the value in
    /// effect afterwards is returned.
    async fn advance_watermark(
        &self,
        feed: &str,
        expected: Option<Watermark>,
        new: Watermark,
    ) -> Result<Watermark>;

    /// Highest id such that every chunk up to it is complete (0 if none)
    async fn read_chunk_cursor(&self, pass: &str) -> Result<i64>;

    /// Move the cursor forward to `to`; returns the stored value afterwards
    async fn advance_chunk_cursor(&self, pass: &str, to: i64) -> Result<i64>;

    /// Start a new full pass
    async fn reset_chunk_cursor(&self, pass: &str) -> Result<()>;

    async fn record_partition(&self, batch_id: &str, partition: &Partition) -> Result<()>;

    async fn list_partitions(&self, batch_id: &str) -> Result<Vec<Partition>>;

    async fn write_status(&self, status: &SyncStatusRecord) -> Result<()>;

    async fn read_status(&self, instance: &str) -> Result<Option<SyncStatusRecord>>;
}

/// Shared ticket counters for the fair scheduler
#[async_trait]
pub trait SchedulerLedger: Send + Sync {
    /// Hand out the next ticket number on `queue`
    async fn issue_ticket(&self, queue: &str, holder: &str) -> Result<Ticket>;

    async fn queue_state(&self, queue: &str) -> Result<QueueState>;

    /// Mark `seq` released; if it is current, advance past released tickets
    async fn release_ticket(&self, queue: &str, seq: i64) -> Result<()>;

    /// Release `seq` on behalf of a vanished holder, only if it is still current
    async fn expire_ticket(&self, queue: &str, seq: i64) -> Result<bool>;

    /// Restart the lease clock of `seq`; false if it is no longer being served
    async fn renew_ticket(&self, queue: &str, seq: i64) -> Result<bool>;
}

/// Leased, expiring mutual exclusion
#[async_trait]
pub trait LeaseLocks: Send + Sync {
    /// Take `name` if free, expired, or already ours
    async fn try_acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Extend our lease; false if we no longer hold it
    async fn renew_lock(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    async fn release_lock(&self, name: &str, holder: &str) -> Result<()>;
}

/// Everything the engine persists
pub trait Store: NoteRepository + ProgressStore + SchedulerLedger + LeaseLocks {}

impl<T> Store for T where T: NoteRepository + ProgressStore + SchedulerLedger + LeaseLocks {}

/// Run `f` while holding the leased lock `name`
///
/// Fails with [`SyncError::LockHeld`] if another holder has it. The lease is
/// renewed while `f` runs and released whether `f` succeeds or not.
pub async fn with_lock<L, T, F, Fut>(
    locks: &L,
    name: &str,
    holder: &str,
    ttl: Duration,
    f: F,
) -> Result<T>
where
    L: LeaseLocks + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if !locks.try_acquire_lock(name, holder, ttl).await? {
        return Err(SyncError::LockHeld {
            name: name.to_string(),
        });
    }
    debug!(lock = name, holder, "Lock acquired");

    let result = keep_lock_alive(locks, name, holder, ttl, f()).await;

    if let Err(e) = locks.release_lock(name, holder).await {
        warn!(lock = name, holder, error = %e, "Failed to release lock, it will expire");
    }
    result
}

/// Drive `work` to completion, renewing our lease on `name` as it runs
///
/// A lease found lost is logged as an anomaly; `work` is not interrupted.
pub async fn keep_lock_alive<L, Fut>(locks: &L, name: &str, holder: &str, ttl: Duration, work: Fut) -> Fut::Output
where
    L: LeaseLocks + ?Sized,
    Fut: Future,
{
    let every = heartbeat_interval(ttl);
    let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(work);

    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = heartbeat.tick() => match locks.renew_lock(name, holder, ttl).await {
                Ok(true) => debug!(lock = name, holder, "Lock renewed"),
                Ok(false) => warn!(
                    lock = name,
                    holder,
                    anomaly = "lock_lost",
                    "Lease lost while its work was still running"
                ),
                Err(e) => warn!(lock = name, holder, error = %e, "Failed to renew lock"),
            },
        }
    }
}

/// How often a lease of length `lease` is renewed
pub fn heartbeat_interval(lease: Duration) -> Duration {
    (lease / 3).max(Duration::from_millis(10))
}

/// Identifier for this process as a lock or ticket holder
pub fn process_holder_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".into());
    format!("{host}:{}", uuid::Uuid::new_v4())
}
