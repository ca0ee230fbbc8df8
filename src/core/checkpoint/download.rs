//! Download checkpoint

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{content_hash, dump_json, load_json, PartTable};
use crate::core::partition::{partition, ByteRange, Part};
use crate::error::TransferResult;
use crate::store::{ObjectKey, ObjectSource, ObjectStat};

/// Format tag of download checkpoints
pub const DOWNLOAD_CHECKPOINT_MAGIC: &str = "ostransfer/download/v1";

/// Resumption state of one ranged, multipart download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadCheckpoint {
    /// Format tag
    pub magic: String,

    /// Hash over every other field
    pub content_hash: String,

    /// Final destination of the download
    pub file_path: PathBuf,

    /// Object being downloaded
    pub object_key: ObjectKey,

    /// Object metadata when the plan was made
    pub object_stat: ObjectStat,

    /// Part plan and completion bitmap
    #[serde(flatten)]
    pub table: PartTable,

    /// First byte of the transfer span
    pub span_start: u64,

    /// Last byte of the transfer span
    pub span_end: u64,
}

impl DownloadCheckpoint {
    /// Build a fresh plan from the object's current metadata
    ///
    /// An empty span (zero-byte object, or a range starting at the object's
    /// end) produces a plan with no parts.
    pub async fn prepare<S: ObjectSource + ?Sized>(
        source: &S,
        key: &ObjectKey,
        file_path: &Path,
        range: Option<ByteRange>,
        part_size: u64,
    ) -> TransferResult<Self> {
        let object_stat = source.stat(key).await?;
        let span = resolve_span(&object_stat, range)?;

        let (span_start, span_end, parts) = match span {
            Some((start, end)) => (start, end, partition(start, end, part_size)?),
            None => (0, 0, Vec::new()),
        };

        Ok(Self {
            magic: DOWNLOAD_CHECKPOINT_MAGIC.to_string(),
            content_hash: String::new(),
            file_path: file_path.to_path_buf(),
            object_key: key.clone(),
            object_stat,
            table: PartTable::new(parts),
            span_start,
            span_end,
        })
    }

    /// Check the checkpoint against itself and against the live object
    ///
    /// Returns `Ok(false)` for a corrupted or stale checkpoint; an error only
    /// when the object metadata cannot be fetched.
    pub async fn is_valid<S: ObjectSource + ?Sized>(
        &self,
        source: &S,
        key: &ObjectKey,
        file_path: &Path,
        range: Option<ByteRange>,
    ) -> TransferResult<bool> {
        if self.magic != DOWNLOAD_CHECKPOINT_MAGIC || !self.table.is_consistent() {
            debug!("Checkpoint format mismatch");
            return Ok(false);
        }
        match content_hash(self) {
            Ok(hash) if hash == self.content_hash => {}
            _ => {
                debug!("Checkpoint content hash mismatch");
                return Ok(false);
            }
        }
        if &self.object_key != key || self.file_path != file_path {
            debug!("Checkpoint belongs to a different transfer");
            return Ok(false);
        }

        let current = source.stat(key).await?;
        if current != self.object_stat {
            debug!(
                stored_size = self.object_stat.size,
                current_size = current.size,
                "Object changed since checkpoint was written"
            );
            return Ok(false);
        }

        match resolve_span(&current, range) {
            Ok(Some((start, end))) => Ok(start == self.span_start && end == self.span_end),
            Ok(None) => Ok(self.table.parts.is_empty()),
            Err(_) => Ok(false),
        }
    }

    /// Load a checkpoint file
    pub async fn load(path: &Path) -> TransferResult<Self> {
        load_json(path).await
    }

    /// Recompute the content hash and write the checkpoint file
    pub async fn dump(&mut self, path: &Path) -> TransferResult<()> {
        self.content_hash = content_hash(self)?;
        dump_json(path, self).await
    }

    /// Parts still to download, in index order
    pub fn todo_parts(&self) -> Vec<Part> {
        self.table.todo_parts()
    }

    /// Bytes already downloaded
    pub fn completed_bytes(&self) -> u64 {
        self.table.completed_bytes()
    }

    /// Bytes covered by the span
    pub fn total_bytes(&self) -> u64 {
        self.table.total_bytes()
    }

    /// Flag a part as downloaded
    pub fn mark_complete(&mut self, index: usize) -> TransferResult<()> {
        self.table.mark_complete(index)
    }
}

/// Transfer span for an object, `None` when there is nothing to transfer
fn resolve_span(
    stat: &ObjectStat,
    range: Option<ByteRange>,
) -> TransferResult<Option<(u64, u64)>> {
    match range {
        Some(range) => range.resolve(stat.size),
        None if stat.size == 0 => Ok(None),
        None => Ok(Some((0, stat.size - 1))),
    }
}
