//! Merging finished partitions into the canonical store
//!
//! Only the consolidator writes bulk results. It runs under the store-wide
//! consolidation lock, checks every artifact against its manifest, and
//! advances the watermark only once every partition of the batch is merged.
//! Applying notes is idempotent, so a merge interrupted halfway is simply
//! run again.

use crate::error::{join_error, Result, SyncError};
use crate::models::{PartitionState, Watermark};
use crate::pipeline::worker::{artifact_path, manifest_path, read_artifact, PartitionOutput};
use crate::store::{with_lock, ApplySummary, Store};
use geonotes_common::checksum::sha256_file;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Lock serialising every write path into the note store
pub const CONSOLIDATE_LOCK: &str = "consolidate:notes";

/// Result of a consolidation attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Consolidation {
    /// Every partition merged and the watermark advanced
    Committed {
        watermark: Option<Watermark>,
        summary: ApplySummary,
    },
    /// Some partitions are not done; nothing was committed
    Incomplete {
        pending: Vec<u32>,
        summary: ApplySummary,
    },
}

pub struct Consolidator {
    store: Arc<dyn Store>,
    feed: String,
    holder: String,
    lock_ttl: Duration,
}

impl Consolidator {
    pub fn new(store: Arc<dyn Store>, feed: impl Into<String>, holder: impl Into<String>, lock_ttl: Duration) -> Self {
        Self {
            store,
            feed: feed.into(),
            holder: holder.into(),
            lock_ttl,
        }
    }

    /// Merge batch `batch_id` from `batch_dir`
    ///
    /// `marker` is the dump's snapshot time; without one the newest
    /// `updated_at` across the partitions is used.
    pub async fn consolidate(&self, batch_id: &str, batch_dir: &Path, marker: Option<Watermark>) -> Result<Consolidation> {
        with_lock(self.store.as_ref(), CONSOLIDATE_LOCK, &self.holder, self.lock_ttl, || {
            self.merge(batch_id, batch_dir, marker)
        })
        .await
    }

    async fn merge(&self, batch_id: &str, batch_dir: &Path, marker: Option<Watermark>) -> Result<Consolidation> {
        let expected = self.store.read_watermark(&self.feed).await?;
        let mut partitions = self.store.list_partitions(batch_id).await?;
        if partitions.is_empty() {
            return Err(SyncError::Consistency(format!("batch {batch_id} has no recorded partitions")));
        }
        partitions.sort_by_key(|p| p.id);

        let mut summary = ApplySummary::default();
        let mut pending = Vec::new();
        let mut newest: Option<Watermark> = None;

        for partition in &partitions {
            if partition.state != PartitionState::Done {
                pending.push(partition.id);
                continue;
            }
            let output = load_verified(batch_dir, partition.id).await?;
            let records = {
                let path = artifact_path(batch_dir, partition.id);
                tokio::task::spawn_blocking(move || read_artifact(&path))
                    .await
                    .map_err(join_error)??
            };
            if records.len() != output.records {
                return Err(SyncError::DataValidation(format!(
                    "partition {} artifact holds {} records, manifest says {}",
                    partition.id,
                    records.len(),
                    output.records
                )));
            }
            summary.merge(self.store.apply_notes(&records).await?);
            newest = newest.max(output.max_updated_at);
        }

        if !pending.is_empty() {
            warn!(batch_id, pending = ?pending, "Batch incomplete, watermark not advanced");
            return Ok(Consolidation::Incomplete { pending, summary });
        }

        let target = marker.or(newest);
        let watermark = match target {
            Some(new) => Some(self.store.advance_watermark(&self.feed, expected, new).await?),
            None => expected,
        };

        if let Err(e) = tokio::fs::remove_dir_all(batch_dir).await {
            warn!(batch_id, dir = %batch_dir.display(), error = %e, "Failed to remove batch artifacts");
        }

        info!(
            batch_id,
            inserted = summary.inserted,
            updated = summary.updated,
            skipped_stale = summary.skipped_stale,
            watermark = ?watermark.map(|w| w.to_string()),
            "Batch consolidated"
        );
        Ok(Consolidation::Committed { watermark, summary })
    }
}

async fn load_verified(batch_dir: &Path, partition_id: u32) -> Result<PartitionOutput> {
    let manifest = manifest_path(batch_dir, partition_id);
    let artifact: PathBuf = artifact_path(batch_dir, partition_id);
    let output: PartitionOutput = serde_json::from_slice(&tokio::fs::read(&manifest).await?)?;
    if output.partition_id != partition_id {
        return Err(SyncError::Consistency(format!(
            "manifest {} belongs to partition {}",
            manifest.display(),
            output.partition_id
        )));
    }

    let actual = tokio::task::spawn_blocking(move || sha256_file(&artifact))
        .await
        .map_err(join_error)??;
    if actual != output.sha256 {
        return Err(SyncError::DataValidation(format!(
            "partition {partition_id} artifact checksum mismatch: expected {}, got {actual}",
            output.sha256
        )));
    }
    Ok(output)
}
