//! Cutting a dump into partitions
//!
//! Partitions are contiguous byte ranges of roughly equal size, cut only at
//! line starts where the entity id changes, so one note's lines (its record
//! and all its comments) always land in the same partition. Ids are dense
//! `1..=N`; N can be lower than requested for small inputs.

use crate::convert::FormatConverter;
use crate::error::{Result, SyncError};
use crate::models::{Partition, PartitionState};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::debug;

/// Split `path` into at most `count` partitions
///
/// Blocking; run it on a blocking task.
pub fn split(path: &Path, count: usize, converter: &dyn FormatConverter) -> Result<Vec<Partition>> {
    if count == 0 {
        return Err(SyncError::Config("partition count must be greater than 0".into()));
    }

    let total = std::fs::metadata(path)?.len();
    let target = total.div_ceil(count as u64).max(1);

    let mut reader = BufReader::new(File::open(path)?);
    let mut line = Vec::new();
    let mut offset: u64 = 0;
    let mut part_start: u64 = 0;
    let mut last_entity = None;
    let mut ranges: Vec<(u64, u64)> = Vec::with_capacity(count);

    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)? as u64;
        if read == 0 {
            break;
        }

        if let Some(entity) = converter.entity_id(&line) {
            let is_boundary = last_entity.is_some_and(|last| last != entity);
            if is_boundary && offset - part_start >= target && ranges.len() + 1 < count {
                ranges.push((part_start, offset));
                part_start = offset;
            }
            last_entity = Some(entity);
        }
        offset += read;
    }

    if offset > part_start {
        ranges.push((part_start, offset));
    }

    let partitions: Vec<Partition> = ranges
        .into_iter()
        .enumerate()
        .map(|(idx, (start, end))| Partition {
            id: idx as u32 + 1,
            start,
            end,
            state: PartitionState::Pending,
        })
        .collect();

    debug!(path = %path.display(), bytes = total, requested = count, partitions = partitions.len(), "Split dump");
    Ok(partitions)
}
