//! Storage collaborators used by the transfer engine
//!
//! The engine never talks HTTP itself. Everything it needs from the remote
//! service goes through two narrow traits:
//!
//! - [`ObjectSource`] - stat an object and fetch a byte range of it (downloads)
//! - [`MultipartSink`] - open, feed, complete and abort a multipart session (uploads)
//!
//! Signing, retries and wire formats live entirely behind these traits.
//! [`MemoryStore`] implements both in-process; with the `s3-native` feature
//! `S3Store` implements them on top of `aws-sdk-s3`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{TransferError, TransferResult};

mod memory;

#[cfg(feature = "s3-native")]
mod s3;

pub use memory::MemoryStore;

#[cfg(feature = "s3-native")]
pub use s3::S3Store;

/// Identity of a remote object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Bucket name
    pub bucket: String,

    /// Object key within the bucket
    pub key: String,
}

impl ObjectKey {
    /// Create a new object identity
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Reject identities the service could never resolve
    pub fn validate(&self) -> TransferResult<()> {
        if self.bucket.is_empty() {
            return Err(TransferError::InvalidKey("bucket name is empty".to_string()));
        }
        if self.key.is_empty() {
            return Err(TransferError::InvalidKey("object key is empty".to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Identifying metadata of a remote object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStat {
    /// Object size in bytes
    pub size: u64,

    /// Last modified timestamp
    pub last_modified: Option<DateTime<Utc>>,

    /// ETag (content fingerprint)
    pub etag: Option<String>,
}

/// Identifying metadata of a local file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    /// File size in bytes
    pub size: u64,

    /// Modification time
    pub modified: Option<DateTime<Utc>>,
}

impl FileStat {
    /// Stat a local file
    pub async fn of(path: &Path) -> TransferResult<Self> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransferError::LocalFileNotFound(path.to_path_buf())
            } else {
                TransferError::from(e)
            }
        })?;

        if !metadata.is_file() {
            return Err(TransferError::InvalidConfig(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        Ok(Self {
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }
}

/// Receipt for one uploaded part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartHandle {
    /// Part number (1-indexed)
    pub number: u32,

    /// ETag returned for the part
    pub etag: String,

    /// Size of the part in bytes
    pub size: u64,
}

impl PartHandle {
    /// Create a new part handle
    pub fn new(number: u32, etag: impl Into<String>, size: u64) -> Self {
        Self {
            number,
            etag: etag.into(),
            size,
        }
    }
}

/// Final object produced by a completed multipart session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    /// Object identity
    pub key: ObjectKey,

    /// ETag of the assembled object
    pub etag: Option<String>,

    /// Object size in bytes
    pub size: u64,
}

/// Read side of the storage service
#[async_trait]
pub trait ObjectSource: Send + Sync + 'static {
    /// Fetch the identifying metadata of an object
    async fn stat(&self, key: &ObjectKey) -> TransferResult<ObjectStat>;

    /// Fetch the inclusive byte range `start..=end` of an object
    async fn fetch_range(&self, key: &ObjectKey, start: u64, end: u64) -> TransferResult<Bytes>;
}

/// Multipart upload side of the storage service
#[async_trait]
pub trait MultipartSink: Send + Sync + 'static {
    /// Open a multipart session and return its upload ID
    async fn initiate_session(&self, key: &ObjectKey) -> TransferResult<String>;

    /// Upload one part into the session
    async fn send_part(
        &self,
        key: &ObjectKey,
        upload_id: &str,
        number: u32,
        data: Bytes,
    ) -> TransferResult<PartHandle>;

    /// Merge the uploaded parts, ordered by part number, into the final object
    async fn complete_session(
        &self,
        key: &ObjectKey,
        upload_id: &str,
        parts: &[PartHandle],
    ) -> TransferResult<ObjectDescriptor>;

    /// Discard the session and every part uploaded into it
    async fn abort_session(&self, key: &ObjectKey, upload_id: &str) -> TransferResult<()>;
}
