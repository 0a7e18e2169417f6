//! Partition workers and the pool that supervises them
//!
//! Each worker reads only its own byte range of the dump and writes only its
//! own artifact (`part-NNNNN.jsonl`) plus a manifest with the artifact's
//! checksum. Nothing is shared between workers; the pool records each
//! partition's state in the store as it goes.

use crate::config::FailureMode;
use crate::convert::FormatConverter;
use crate::error::{join_error, ErrorClass, Result, SyncError};
use crate::models::{NoteRecord, Partition, PartitionState, Watermark};
use crate::retry::{partial_path, RetryExecutor};
use crate::store::Store;
use futures::stream::{self, StreamExt};
use geonotes_common::checksum::sha256_file;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Manifest written next to a finished partition artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionOutput {
    pub partition_id: u32,
    pub sha256: String,
    pub records: usize,
    pub max_updated_at: Option<Watermark>,
}

pub fn artifact_path(batch_dir: &Path, partition_id: u32) -> PathBuf {
    batch_dir.join(format!("part-{partition_id:05}.jsonl"))
}

pub fn manifest_path(batch_dir: &Path, partition_id: u32) -> PathBuf {
    batch_dir.join(format!("part-{partition_id:05}.manifest.json"))
}

/// Write `path` through its `.partial` sibling
fn write_atomic(path: &Path, write: impl FnOnce(&mut BufWriter<File>) -> Result<()>) -> Result<()> {
    let partial = partial_path(path);
    let mut writer = BufWriter::new(File::create(&partial)?);
    write(&mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);
    std::fs::rename(&partial, path)?;
    Ok(())
}

/// Converts one partition of a dump
#[derive(Clone)]
pub struct PartitionWorker {
    source: PathBuf,
    batch_dir: PathBuf,
    converter: Arc<dyn FormatConverter>,
}

impl PartitionWorker {
    pub fn new(source: impl Into<PathBuf>, batch_dir: impl Into<PathBuf>, converter: Arc<dyn FormatConverter>) -> Self {
        Self {
            source: source.into(),
            batch_dir: batch_dir.into(),
            converter,
        }
    }

    pub fn batch_dir(&self) -> &Path {
        &self.batch_dir
    }

    pub async fn process(&self, partition: &Partition) -> Result<PartitionOutput> {
        let worker = self.clone();
        let partition = partition.clone();
        tokio::task::spawn_blocking(move || worker.process_blocking(&partition))
            .await
            .map_err(join_error)?
    }

    fn process_blocking(&self, partition: &Partition) -> Result<PartitionOutput> {
        let mut file = File::open(&self.source)?;
        file.seek(SeekFrom::Start(partition.start))?;
        let mut raw = Vec::with_capacity(partition.len() as usize);
        file.take(partition.len()).read_to_end(&mut raw)?;
        if (raw.len() as u64) != partition.len() {
            return Err(SyncError::DataValidation(format!(
                "partition {} truncated: expected {} bytes, read {}",
                partition.id,
                partition.len(),
                raw.len()
            )));
        }

        let records = self.converter.convert(&raw)?;

        std::fs::create_dir_all(&self.batch_dir)?;
        let artifact = artifact_path(&self.batch_dir, partition.id);
        write_atomic(&artifact, |w| {
            for record in &records {
                serde_json::to_writer(&mut *w, record)?;
                w.write_all(b"\n")?;
            }
            Ok(())
        })?;

        let output = PartitionOutput {
            partition_id: partition.id,
            sha256: sha256_file(&artifact)?,
            records: records.len(),
            max_updated_at: records.iter().map(|r| Watermark(r.updated_at)).max(),
        };
        write_atomic(&manifest_path(&self.batch_dir, partition.id), |w| {
            serde_json::to_writer_pretty(&mut *w, &output)?;
            Ok(())
        })?;
        Ok(output)
    }
}

/// Read a finished partition's records back from its artifact
pub fn read_artifact(path: &Path) -> Result<Vec<NoteRecord>> {
    let data = std::fs::read_to_string(path)?;
    data.lines()
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_str(l).map_err(SyncError::from))
        .collect()
}

/// Outcome of running a set of partitions
#[derive(Debug, Clone, Default)]
pub struct PoolReport {
    /// Finished partitions, ordered by id
    pub outputs: Vec<PartitionOutput>,
    pub failed: Vec<u32>,
    pub quarantined: Vec<u32>,
}

impl PoolReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.quarantined.is_empty()
    }
}

/// Runs workers up to a parallelism cap and waits for all of them
pub struct WorkerPool {
    store: Arc<dyn Store>,
    retry: RetryExecutor,
    parallelism: usize,
    failure_mode: FailureMode,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn Store>, retry: RetryExecutor, parallelism: usize, failure_mode: FailureMode) -> Self {
        Self {
            store,
            retry,
            parallelism: parallelism.max(1),
            failure_mode,
        }
    }

    /// Process `partitions` of `batch_id`
    ///
    /// In fail-fast mode the first failed partition fails the batch: no new
    /// partition is started, running workers are waited for, and every
    /// partition that did not finish is recorded as failed before the error
    /// is returned. In best-effort mode failures are recorded (data validation
    /// failures as quarantined) and reported, and the remaining partitions
    /// still run.
    pub async fn run(&self, batch_id: &str, worker: &PartitionWorker, partitions: Vec<Partition>) -> Result<PoolReport> {
        for partition in &partitions {
            let pending = Partition {
                state: PartitionState::Pending,
                ..partition.clone()
            };
            self.store.record_partition(batch_id, &pending).await?;
        }

        let total = partitions.len();
        let abort = CancellationToken::new();
        let mut results = stream::iter(partitions)
            .map(|partition| self.run_one(batch_id, worker, partition, &abort))
            .buffer_unordered(self.parallelism);

        let mut report = PoolReport::default();
        let mut first_failure: Option<SyncError> = None;
        while let Some((partition, result)) = results.next().await {
            match result {
                Ok(output) => {
                    self.set_state(batch_id, &partition, PartitionState::Done).await?;
                    report.outputs.push(output);
                },
                Err(e) if self.failure_mode == FailureMode::FailFast => {
                    self.set_state(batch_id, &partition, PartitionState::Failed).await?;
                    report.failed.push(partition.id);
                    if first_failure.is_none() {
                        error!(
                            batch_id,
                            partition_id = partition.id,
                            error = %e,
                            "Partition failed, failing batch once running workers finish"
                        );
                        abort.cancel();
                        first_failure = Some(e);
                    }
                },
                Err(e) if e.class() == ErrorClass::DataValidation => {
                    self.set_state(batch_id, &partition, PartitionState::Quarantined).await?;
                    error!(
                        batch_id,
                        partition_id = partition.id,
                        error = %e,
                        anomaly = "partition_quarantined",
                        "Partition failed validation after retries, quarantined"
                    );
                    report.quarantined.push(partition.id);
                },
                Err(e) => {
                    self.set_state(batch_id, &partition, PartitionState::Failed).await?;
                    warn!(batch_id, partition_id = partition.id, error = %e, "Partition failed, left for retry");
                    report.failed.push(partition.id);
                },
            }
        }

        report.outputs.sort_by_key(|o| o.partition_id);
        report.failed.sort_unstable();
        report.quarantined.sort_unstable();
        if let Some(e) = first_failure {
            warn!(
                batch_id,
                partitions = total,
                done = report.outputs.len(),
                failed = report.failed.len(),
                "Worker pool stopped after a failure"
            );
            return Err(e);
        }
        info!(
            batch_id,
            partitions = total,
            done = report.outputs.len(),
            failed = report.failed.len(),
            quarantined = report.quarantined.len(),
            "Worker pool finished"
        );
        Ok(report)
    }

    /// Re-run every partition of `batch_id` that is not done
    pub async fn retry_failed(&self, batch_id: &str, worker: &PartitionWorker) -> Result<PoolReport> {
        let retryable: Vec<Partition> = self
            .store
            .list_partitions(batch_id)
            .await?
            .into_iter()
            .filter(|p| p.state.needs_run())
            .collect();
        info!(batch_id, partitions = retryable.len(), "Retrying failed partitions");
        self.run(batch_id, worker, retryable).await
    }

    async fn run_one(
        &self,
        batch_id: &str,
        worker: &PartitionWorker,
        partition: Partition,
        abort: &CancellationToken,
    ) -> (Partition, Result<PartitionOutput>) {
        if abort.is_cancelled() {
            debug!(batch_id, partition_id = partition.id, "Batch already failed, partition not started");
            return (partition, Err(SyncError::Cancelled));
        }
        if let Err(e) = self.set_state(batch_id, &partition, PartitionState::Processing).await {
            return (partition, Err(e));
        }
        let artifact = artifact_path(worker.batch_dir(), partition.id);
        let operation = format!("partition {} of {batch_id}", partition.id);
        let result = self
            .retry
            .execute(&operation, Some(&artifact), |_| worker.process(&partition))
            .await;
        (partition, result)
    }

    async fn set_state(&self, batch_id: &str, partition: &Partition, state: PartitionState) -> Result<()> {
        let updated = Partition {
            state,
            ..partition.clone()
        };
        self.store.record_partition(batch_id, &updated).await
    }
}
