//! Fixed-size id chunks and the contiguous completion cursor
//!
//! Chunk `k` covers ids `[k*size + 1, (k+1)*size]`, so chunk boundaries never
//! move when new notes arrive. The last chunk of a plan is cut at the highest
//! stored id, so the cursor never covers ids that do not exist yet. The
//! persisted cursor is the highest id below which every chunk is complete;
//! chunks may finish in any order, and the cursor only moves once the gap
//! below a finished chunk is closed.

use crate::error::{Result, SyncError};
use crate::models::NoteId;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Chunk {
    pub start: NoteId,
    pub end: NoteId,
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkPlan {
    size: i64,
}

impl ChunkPlan {
    pub fn new(size: i64) -> Result<Self> {
        if size <= 0 {
            return Err(SyncError::Config(format!("chunk size must be positive, got {size}")));
        }
        Ok(Self { size })
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    /// The aligned chunk holding `id`
    pub fn chunk_of(&self, id: NoteId) -> Chunk {
        let k = (id - 1).div_euclid(self.size);
        Chunk {
            start: k * self.size + 1,
            end: (k + 1) * self.size,
        }
    }

    /// Chunks still to do after `cursor`, for notes in `[min_id, max_id]`
    ///
    /// A cursor that is not on a chunk boundary (the chunk size changed, or
    /// the previous run ended at the highest id) clips the first chunk so
    /// nothing at or below it is read again. The last chunk ends at `max_id`.
    pub fn remaining(&self, cursor: NoteId, min_id: NoteId, max_id: NoteId) -> Vec<Chunk> {
        let from = (cursor + 1).max(min_id);
        if from > max_id {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        let mut chunk = self.chunk_of(from);
        chunk.start = chunk.start.max(cursor + 1);
        while chunk.start <= max_id {
            chunks.push(Chunk {
                start: chunk.start,
                end: chunk.end.min(max_id),
            });
            chunk = Chunk {
                start: chunk.end + 1,
                end: chunk.end + self.size,
            };
        }
        chunks
    }
}

/// Turns out-of-order chunk completions into cursor advances
#[derive(Debug, Clone)]
pub struct CursorTracker {
    committed: NoteId,
    /// Finished chunks above the gap, by start
    finished: BTreeMap<NoteId, NoteId>,
}

impl CursorTracker {
    /// `committed`: everything at or below it counts as complete
    pub fn new(committed: NoteId) -> Self {
        Self {
            committed,
            finished: BTreeMap::new(),
        }
    }

    pub fn committed(&self) -> NoteId {
        self.committed
    }

    /// Record `chunk` as done; returns the new cursor if it moved
    pub fn complete(&mut self, chunk: Chunk) -> Option<NoteId> {
        if chunk.end <= self.committed {
            return None;
        }
        self.finished.insert(chunk.start, chunk.end);

        let before = self.committed;
        while let Some(end) = self.finished.remove(&(self.committed + 1)) {
            self.committed = end;
        }
        (self.committed > before).then_some(self.committed)
    }

    /// Chunks finished but stuck behind an unfinished one
    pub fn waiting(&self) -> usize {
        self.finished.len()
    }
}
