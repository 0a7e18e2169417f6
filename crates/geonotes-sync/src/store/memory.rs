//! In-process store
//!
//! Implements every store trait on a single `tokio` mutex. Used when all
//! workers share one process, and by tests, which can inject failures and
//! inspect the cursor history.

use super::{ApplySummary, LeaseLocks, NoteRepository, ProgressStore, SchedulerLedger};
use crate::error::{Result, SyncError};
use crate::models::{
    NoteComment, NoteId, NoteRecord, Partition, QueueState, Region, RegionAssignment,
    RegionBoundary, StoredNote, SyncStatusRecord, Ticket, Watermark,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct NoteEntry {
    stored: StoredNote,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    comments: BTreeMap<i32, NoteComment>,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    now_serving: i64,
    next_ticket: i64,
    serving_since: DateTime<Utc>,
    released: BTreeSet<i64>,
}

impl QueueEntry {
    fn new() -> Self {
        Self {
            now_serving: 1,
            next_ticket: 1,
            serving_since: Utc::now(),
            released: BTreeSet::new(),
        }
    }

    fn advance(&mut self) {
        while self.now_serving < self.next_ticket && self.released.contains(&self.now_serving) {
            self.released.remove(&self.now_serving);
            self.now_serving += 1;
        }
        self.serving_since = Utc::now();
    }
}

#[derive(Debug, Default)]
struct Faults {
    apply_calls: usize,
    fail_apply_calls: HashSet<usize>,
    /// chunk start -> remaining injected failures
    fail_range: HashMap<NoteId, u32>,
    delay_range: HashMap<NoteId, Duration>,
}

#[derive(Debug, Default)]
struct State {
    notes: BTreeMap<NoteId, NoteEntry>,
    regions: BTreeMap<i64, RegionBoundary>,
    watermarks: HashMap<String, Watermark>,
    cursors: HashMap<String, i64>,
    cursor_history: HashMap<String, Vec<i64>>,
    queues: HashMap<String, QueueEntry>,
    locks: HashMap<String, (String, Instant)>,
    partitions: HashMap<String, BTreeMap<u32, Partition>>,
    statuses: HashMap<String, SyncStatusRecord>,
    range_reads: Vec<(NoteId, NoteId)>,
    faults: Faults,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `call`-th `apply_notes` invocation (1-based) before it writes anything
    pub async fn fail_apply_on_call(&self, call: usize) {
        self.state.lock().await.faults.fail_apply_calls.insert(call);
    }

    /// Fail the next `times` reads of the chunk starting at `start`
    pub async fn fail_range_reads(&self, start: NoteId, times: u32) {
        self.state.lock().await.faults.fail_range.insert(start, times);
    }

    /// Slow down reads of the chunk starting at `start`
    pub async fn delay_range_reads(&self, start: NoteId, delay: Duration) {
        self.state.lock().await.faults.delay_range.insert(start, delay);
    }

    pub async fn clear_faults(&self) {
        let mut state = self.state.lock().await;
        let calls = state.faults.apply_calls;
        state.faults = Faults {
            apply_calls: calls,
            ..Faults::default()
        };
    }

    /// Every `notes_in_range` call so far, in call order
    pub async fn range_reads(&self) -> Vec<(NoteId, NoteId)> {
        self.state.lock().await.range_reads.clone()
    }

    pub async fn clear_range_reads(&self) {
        self.state.lock().await.range_reads.clear();
    }

    /// Every value the cursor of `pass` was moved to
    pub async fn cursor_history(&self, pass: &str) -> Vec<i64> {
        self.state
            .lock()
            .await
            .cursor_history
            .get(pass)
            .cloned()
            .unwrap_or_default()
    }

    /// Overwrite a watermark without checks, simulating an external regression
    pub async fn force_watermark(&self, feed: &str, value: Watermark) {
        self.state.lock().await.watermarks.insert(feed.to_string(), value);
    }

    /// All notes with their comments, ordered by id
    pub async fn snapshot(&self) -> Vec<(StoredNote, Vec<NoteComment>)> {
        self.state
            .lock()
            .await
            .notes
            .values()
            .map(|e| (e.stored.clone(), e.comments.values().cloned().collect()))
            .collect()
    }
}

#[async_trait]
impl NoteRepository for MemoryStore {
    async fn apply_notes(&self, notes: &[NoteRecord]) -> Result<ApplySummary> {
        let mut state = self.state.lock().await;
        state.faults.apply_calls += 1;
        let call = state.faults.apply_calls;
        if state.faults.fail_apply_calls.remove(&call) {
            return Err(SyncError::TransientIo(format!("injected failure on apply call {call}")));
        }

        let mut summary = ApplySummary::default();
        for note in notes {
            let region = match state.notes.get(&note.id) {
                Some(existing) if note.updated_at < existing.stored.updated_at => {
                    summary.skipped_stale += 1;
                    continue;
                },
                Some(existing) => {
                    summary.updated += 1;
                    if existing.stored.location == note.location {
                        existing.stored.region
                    } else {
                        RegionAssignment::Unknown
                    }
                },
                None => {
                    summary.inserted += 1;
                    RegionAssignment::Unknown
                },
            };

            let entry = state.notes.entry(note.id).or_insert_with(|| NoteEntry {
                stored: StoredNote {
                    id: note.id,
                    location: note.location,
                    updated_at: note.updated_at,
                    status: note.status,
                    region,
                },
                created_at: note.created_at,
                closed_at: note.closed_at,
                comments: BTreeMap::new(),
            });
            entry.stored = StoredNote {
                id: note.id,
                location: note.location,
                updated_at: note.updated_at,
                status: note.status,
                region,
            };
            entry.created_at = note.created_at;
            entry.closed_at = note.closed_at;
            for comment in &note.comments {
                entry.comments.insert(comment.seq, comment.clone());
                summary.comments += 1;
            }
        }
        Ok(summary)
    }

    async fn get_note(&self, id: NoteId) -> Result<Option<StoredNote>> {
        Ok(self.state.lock().await.notes.get(&id).map(|e| e.stored.clone()))
    }

    async fn note_id_bounds(&self) -> Result<Option<(NoteId, NoteId)>> {
        let state = self.state.lock().await;
        Ok(state
            .notes
            .keys()
            .next()
            .copied()
            .zip(state.notes.keys().next_back().copied()))
    }

    async fn notes_in_range(&self, start: NoteId, end: NoteId) -> Result<Vec<StoredNote>> {
        let delay = {
            let mut state = self.state.lock().await;
            state.range_reads.push((start, end));
            if let Some(remaining) = state.faults.fail_range.get_mut(&start) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SyncError::TransientIo(format!(
                        "injected read failure for chunk starting at {start}"
                    )));
                }
            }
            state.faults.delay_range.get(&start).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().await;
        Ok(state
            .notes
            .range(start..=end)
            .map(|(_, e)| e.stored.clone())
            .collect())
    }

    async fn invalidate_regions(&self, ids: &[NoteId]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for id in ids {
            if let Some(entry) = state.notes.get_mut(id) {
                if !entry.stored.region.is_unknown() {
                    entry.stored.region = RegionAssignment::Unknown;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn assign_regions(&self, assignments: &[(NoteId, RegionAssignment)]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for (id, assignment) in assignments {
            if let Some(entry) = state.notes.get_mut(id) {
                if entry.stored.region.is_unknown() {
                    entry.stored.region = *assignment;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn load_regions(&self) -> Result<Vec<Region>> {
        let state = self.state.lock().await;
        state
            .regions
            .values()
            .cloned()
            .map(RegionBoundary::into_region)
            .collect()
    }

    async fn upsert_regions(&self, regions: &[RegionBoundary]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for region in regions {
            if state.regions.insert(region.id, region.clone()).as_ref() != Some(region) {
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn read_watermark(&self, feed: &str) -> Result<Option<Watermark>> {
        Ok(self.state.lock().await.watermarks.get(feed).copied())
    }

    async fn advance_watermark(
        &self,
        feed: &str,
        expected: Option<Watermark>,
        new: Watermark,
    ) -> Result<Watermark> {
        let mut state = self.state.lock().await;
        let current = state.watermarks.get(feed).copied();
        if current < expected {
            return Err(SyncError::Consistency(format!(
                "watermark for {feed} regressed: expected at least {expected:?}, found {current:?}"
            )));
        }
        let next = current.map_or(new, |c| c.max(new));
        state.watermarks.insert(feed.to_string(), next);
        Ok(next)
    }

    async fn read_chunk_cursor(&self, pass: &str) -> Result<i64> {
        Ok(self.state.lock().await.cursors.get(pass).copied().unwrap_or(0))
    }

    async fn advance_chunk_cursor(&self, pass: &str, to: i64) -> Result<i64> {
        let mut state = self.state.lock().await;
        let cursor = state.cursors.entry(pass.to_string()).or_insert(0);
        *cursor = (*cursor).max(to);
        let value = *cursor;
        state.cursor_history.entry(pass.to_string()).or_default().push(value);
        Ok(value)
    }

    async fn reset_chunk_cursor(&self, pass: &str) -> Result<()> {
        self.state.lock().await.cursors.insert(pass.to_string(), 0);
        Ok(())
    }

    async fn record_partition(&self, batch_id: &str, partition: &Partition) -> Result<()> {
        self.state
            .lock()
            .await
            .partitions
            .entry(batch_id.to_string())
            .or_default()
            .insert(partition.id, partition.clone());
        Ok(())
    }

    async fn list_partitions(&self, batch_id: &str) -> Result<Vec<Partition>> {
        Ok(self
            .state
            .lock()
            .await
            .partitions
            .get(batch_id)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn write_status(&self, status: &SyncStatusRecord) -> Result<()> {
        self.state
            .lock()
            .await
            .statuses
            .insert(status.instance.clone(), status.clone());
        Ok(())
    }

    async fn read_status(&self, instance: &str) -> Result<Option<SyncStatusRecord>> {
        Ok(self.state.lock().await.statuses.get(instance).cloned())
    }
}

#[async_trait]
impl SchedulerLedger for MemoryStore {
    async fn issue_ticket(&self, queue: &str, _holder: &str) -> Result<Ticket> {
        let mut state = self.state.lock().await;
        let entry = state
            .queues
            .entry(queue.to_string())
            .or_insert_with(QueueEntry::new);
        if entry.now_serving == entry.next_ticket {
            entry.serving_since = Utc::now();
        }
        let seq = entry.next_ticket;
        entry.next_ticket += 1;
        Ok(Ticket {
            queue: queue.to_string(),
            seq,
            issued_at: Utc::now(),
        })
    }

    async fn queue_state(&self, queue: &str) -> Result<QueueState> {
        let mut state = self.state.lock().await;
        let entry = state
            .queues
            .entry(queue.to_string())
            .or_insert_with(QueueEntry::new);
        Ok(QueueState {
            now_serving: entry.now_serving,
            next_ticket: entry.next_ticket,
            serving_since: entry.serving_since,
        })
    }

    async fn release_ticket(&self, queue: &str, seq: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .queues
            .entry(queue.to_string())
            .or_insert_with(QueueEntry::new);
        if seq < entry.now_serving || seq >= entry.next_ticket {
            return Ok(());
        }
        entry.released.insert(seq);
        if seq == entry.now_serving {
            entry.advance();
        }
        Ok(())
    }

    async fn expire_ticket(&self, queue: &str, seq: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.queues.get_mut(queue) else {
            return Ok(false);
        };
        if entry.now_serving != seq || seq >= entry.next_ticket {
            return Ok(false);
        }
        entry.released.insert(seq);
        entry.advance();
        Ok(true)
    }

    async fn renew_ticket(&self, queue: &str, seq: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.queues.get_mut(queue) {
            Some(entry) if entry.now_serving == seq && seq < entry.next_ticket => {
                entry.serving_since = Utc::now();
                Ok(true)
            },
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl LeaseLocks for MemoryStore {
    async fn try_acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.locks.get(name) {
            Some((current, expires)) if current != holder && *expires > now => Ok(false),
            _ => {
                state
                    .locks
                    .insert(name.to_string(), (holder.to_string(), now + ttl));
                Ok(true)
            },
        }
    }

    async fn renew_lock(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.locks.get_mut(name) {
            Some((current, expires)) if current == holder => {
                *expires = Instant::now() + ttl;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, name: &str, holder: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.locks.get(name).is_some_and(|(current, _)| current == holder) {
            state.locks.remove(name);
        }
        Ok(())
    }
}
