//! Remote data sources
//!
//! The controller and verification engine only see these traits; the HTTP
//! implementations live in [`http`]. Every call through them is made inside a
//! ticket-queue turn and a retry executor by the caller.

pub mod decompression;
pub mod http;

pub use http::{HttpBoundarySource, HttpBulkSource, HttpNoteFeed};

use crate::error::Result;
use crate::models::{NoteRecord, RegionBoundary, Watermark};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Notes changed since a watermark
#[derive(Debug, Clone, Default)]
pub struct FeedBatch {
    pub notes: Vec<NoteRecord>,
    /// Highest `updated_at` in the batch
    pub high_marker: Option<Watermark>,
}

impl FeedBatch {
    pub fn from_notes(notes: Vec<NoteRecord>) -> Self {
        let high_marker = notes.iter().map(|n| Watermark(n.updated_at)).max();
        Self { notes, high_marker }
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

#[async_trait]
pub trait NoteFeed: Send + Sync {
    /// Up to `limit` notes updated after `since`, oldest first
    async fn fetch_since(&self, since: Option<Watermark>, limit: usize) -> Result<FeedBatch>;
}

/// A complete, verified dump on local disk
#[derive(Debug, Clone)]
pub struct BulkDump {
    pub path: PathBuf,
    /// Snapshot time published with the dump, if any
    pub marker: Option<Watermark>,
    pub sha256: String,
}

#[async_trait]
pub trait BulkSource: Send + Sync {
    /// Download the current dump to `dest`
    ///
    /// `dest` only ever appears once the file is complete and verified.
    async fn download(&self, dest: &Path) -> Result<BulkDump>;
}

#[async_trait]
pub trait BoundarySource: Send + Sync {
    async fn fetch_boundaries(&self) -> Result<Vec<RegionBoundary>>;
}
