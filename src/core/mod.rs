/*!
 * Core multipart transfer engine
 *
 * - [`partition`] splits a byte span into parts
 * - [`checkpoint`] persists the part plan and per-part completion
 * - [`pool`] runs part transfers on a fixed number of workers
 * - [`download`] and [`upload`] drive a whole transfer
 */

pub mod checkpoint;
pub mod download;
pub mod partition;
pub mod pool;
pub mod progress;
pub mod upload;

use std::time::Duration;

use crate::store::ObjectDescriptor;

pub use download::{DownloadRequest, Downloader};
pub use partition::{ByteRange, Part};
pub use pool::{PartHook, PartWorker, WorkerPool};
pub use progress::{ChannelListener, ProgressEvent, ProgressEventType, ProgressListener};
pub use upload::{UploadRequest, Uploader};

/// Statistics about a finished transfer
#[derive(Debug, Clone, Default)]
pub struct TransferSummary {
    /// Bytes in the transfer span
    pub total_bytes: u64,

    /// Bytes moved during this run
    pub transferred_bytes: u64,

    /// Bytes already completed by an earlier run
    pub resumed_bytes: u64,

    /// Number of parts in the plan
    pub parts: usize,

    /// Wall time of this run
    pub duration: Duration,

    /// Whether a checkpoint was resumed
    pub resumed: bool,

    /// Object assembled by an upload
    pub object: Option<ObjectDescriptor>,
}

impl TransferSummary {
    /// Throughput of this run in bytes per second
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.transferred_bytes as f64 / secs
        } else {
            0.0
        }
    }
}
