/*!
 * Durable transfer checkpoints
 *
 * A checkpoint records the full part plan of a transfer together with a
 * per-part completion bitmap, so a transfer interrupted by a crash or a part
 * failure can pick up where it stopped. Both the download and the upload
 * variant are plain JSON documents carrying a self-referential content hash
 * (computed over the document with the hash field removed) plus a snapshot of
 * the source's identifying metadata. Either mismatch makes the checkpoint
 * invalid, and the transfer starts over from a fresh plan.
 */

mod download;
mod upload;

pub use download::DownloadCheckpoint;
pub use upload::UploadCheckpoint;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::core::partition::Part;
use crate::error::{TransferError, TransferResult};

/// JSON field holding the content hash
const HASH_FIELD: &str = "contentHash";

/// Ordered part plan plus the completion bitmap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartTable {
    /// All parts of the transfer in index order
    pub parts: Vec<Part>,

    /// Completion flag per part, parallel to `parts`
    pub part_status: Vec<bool>,
}

impl PartTable {
    /// Fresh table with no part completed
    pub fn new(parts: Vec<Part>) -> Self {
        let part_status = vec![false; parts.len()];
        Self { parts, part_status }
    }

    /// Parts not yet completed, in index order
    pub fn todo_parts(&self) -> Vec<Part> {
        self.parts
            .iter()
            .zip(&self.part_status)
            .filter(|(_, done)| !**done)
            .map(|(part, _)| *part)
            .collect()
    }

    /// Bytes covered by completed parts
    pub fn completed_bytes(&self) -> u64 {
        self.parts
            .iter()
            .zip(&self.part_status)
            .filter(|(_, done)| **done)
            .map(|(part, _)| part.len())
            .sum()
    }

    /// Bytes covered by the whole plan
    pub fn total_bytes(&self) -> u64 {
        self.parts.iter().map(Part::len).sum()
    }

    /// Flag a part as completed
    pub fn mark_complete(&mut self, index: usize) -> TransferResult<()> {
        match self.part_status.get_mut(index) {
            Some(done) => {
                *done = true;
                Ok(())
            }
            None => Err(TransferError::Checkpoint(format!(
                "part index {} out of range ({} parts)",
                index,
                self.parts.len()
            ))),
        }
    }

    /// Every part completed
    pub fn is_complete(&self) -> bool {
        self.part_status.iter().all(|done| *done)
    }

    /// Number of completed parts
    pub fn completed_count(&self) -> usize {
        self.part_status.iter().filter(|done| **done).count()
    }

    /// Bitmap length matches the plan and indices are in order
    pub(crate) fn is_consistent(&self) -> bool {
        self.part_status.len() == self.parts.len()
            && self.parts.iter().enumerate().all(|(i, p)| p.index == i)
    }
}

/// Hash over the canonical JSON form of `value`, ignoring the hash field
pub(crate) fn content_hash<T: Serialize>(value: &T) -> TransferResult<String> {
    let mut json = serde_json::to_value(value)?;
    if let serde_json::Value::Object(map) = &mut json {
        map.remove(HASH_FIELD);
    }
    let canonical = serde_json::to_vec(&json)?;
    Ok(blake3::hash(&canonical).to_hex().to_string())
}

/// Read and deserialize a checkpoint file
pub(crate) async fn load_json<T: DeserializeOwned>(path: &Path) -> TransferResult<T> {
    let contents = tokio::fs::read(path).await.map_err(|e| {
        TransferError::Checkpoint(format!("failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_slice(&contents).map_err(|e| {
        TransferError::Checkpoint(format!("failed to parse {}: {}", path.display(), e))
    })
}

/// Serialize and write a checkpoint file atomically
///
/// The document is written to `<path>.tmp` (owner read/write only) and then
/// renamed over `path`, so readers see either the old or the new version.
pub(crate) async fn dump_json<T: Serialize>(path: &Path, value: &T) -> TransferResult<()> {
    let contents = serde_json::to_vec_pretty(value)?;
    let tmp_path = tmp_path(path);

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let write = async {
        let mut file = options.open(&tmp_path).await?;
        file.write_all(&contents).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, path).await
    };

    write.await.map_err(|e| {
        TransferError::Checkpoint(format!("failed to write {}: {}", path.display(), e))
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Remove a checkpoint file, ignoring failures
pub async fn remove(checkpoint_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(checkpoint_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %checkpoint_path.display(), error = %e, "Failed to remove checkpoint");
        }
    }
}

/// Finish a download: move the working file into place, then drop the checkpoint
///
/// A failed rename is returned and leaves the checkpoint on disk; failure to
/// remove the checkpoint afterwards is ignored.
pub async fn complete(
    checkpoint_path: Option<&Path>,
    working_path: &Path,
    dest_path: &Path,
) -> TransferResult<()> {
    tokio::fs::rename(working_path, dest_path).await.map_err(|e| {
        TransferError::Io(format!(
            "failed to rename {} to {}: {}",
            working_path.display(),
            dest_path.display(),
            e
        ))
    })?;

    if let Some(checkpoint_path) = checkpoint_path {
        remove(checkpoint_path).await;
    }
    Ok(())
}
