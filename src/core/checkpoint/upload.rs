//! Upload checkpoint

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{content_hash, dump_json, load_json, PartTable};
use crate::core::partition::{partition_size, Part};
use crate::error::{TransferError, TransferResult};
use crate::store::{FileStat, MultipartSink, ObjectKey, PartHandle};

/// Format tag of upload checkpoints
pub const UPLOAD_CHECKPOINT_MAGIC: &str = "ostransfer/upload/v1";

/// Resumption state of one multipart upload
///
/// Besides the part plan this records the remote session and the receipt of
/// every part already sent, which is what completing the session needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCheckpoint {
    pub magic: String,
    pub content_hash: String,
    pub file_path: PathBuf,
    pub object_key: ObjectKey,
    pub file_stat: FileStat,
    pub upload_id: String,
    #[serde(flatten)]
    pub table: PartTable,
    pub part_handles: Vec<Option<PartHandle>>,
}

impl UploadCheckpoint {
    /// Stat the local file, plan its parts and open a multipart session
    pub async fn prepare<S: MultipartSink + ?Sized>(
        sink: &S,
        key: &ObjectKey,
        file_path: &Path,
        part_size: u64,
    ) -> TransferResult<Self> {
        let file_stat = FileStat::of(file_path).await?;
        let parts = partition_size(file_stat.size, part_size)?;
        let upload_id = sink.initiate_session(key).await?;
        debug!(key = %key, upload_id = %upload_id, parts = parts.len(), "Opened multipart session");

        Ok(Self {
            magic: UPLOAD_CHECKPOINT_MAGIC.to_string(),
            content_hash: String::new(),
            file_path: file_path.to_path_buf(),
            object_key: key.clone(),
            file_stat,
            upload_id,
            part_handles: vec![None; parts.len()],
            table: PartTable::new(parts),
        })
    }

    /// Check the checkpoint against itself and against the local file
    ///
    /// Returns `Ok(false)` for a corrupted or stale checkpoint; an error only
    /// when the local file cannot be stat'ed.
    pub async fn is_valid(&self, key: &ObjectKey, file_path: &Path) -> TransferResult<bool> {
        if self.magic != UPLOAD_CHECKPOINT_MAGIC
            || !self.table.is_consistent()
            || self.part_handles.len() != self.table.parts.len()
        {
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

        let handles_match = self
            .table
            .part_status
            .iter()
            .zip(&self.part_handles)
            .all(|(done, handle)| *done == handle.is_some());
        if !handles_match {
            debug!("Checkpoint part receipts disagree with completion flags");
            return Ok(false);
        }

        let current = FileStat::of(file_path).await?;
        if current != self.file_stat {
            debug!(
                stored_size = self.file_stat.size,
                current_size = current.size,
                "Source file changed since checkpoint was written"
            );
            return Ok(false);
        }
        Ok(true)
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

    /// Parts still to upload, in index order
    pub fn todo_parts(&self) -> Vec<Part> {
        self.table.todo_parts()
    }

    /// Bytes already uploaded
    pub fn completed_bytes(&self) -> u64 {
        self.table.completed_bytes()
    }

    /// Size of the source file
    pub fn total_bytes(&self) -> u64 {
        self.table.total_bytes()
    }

    /// Flag a part as uploaded and keep its receipt
    pub fn mark_complete(&mut self, index: usize, handle: PartHandle) -> TransferResult<()> {
        let slot = self.part_handles.get_mut(index).ok_or_else(|| {
            TransferError::Checkpoint(format!("part index {} out of range", index))
        })?;
        *slot = Some(handle);
        self.table.mark_complete(index)
    }

    /// Receipts of all uploaded parts, ordered by part number
    pub fn completed_handles(&self) -> Vec<PartHandle> {
        let mut handles: Vec<PartHandle> = self.part_handles.iter().flatten().cloned().collect();
        handles.sort_by_key(|h| h.number);
        handles
    }
}
