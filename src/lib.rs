/*!
 * ostransfer - resumable multipart transfers for S3-style object storage
 *
 * - Byte-range partitioning of objects and files
 * - Parallel part transfers on a fixed-size worker pool
 * - Durable JSON checkpoints with staleness detection for resume
 * - Atomic assembly (working file rename / multipart session completion)
 * - Progress events for UIs and monitoring
 *
 * Version: 0.3.0
 */

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod store;

// Re-export commonly used types
pub use config::{CheckpointConfig, LogLevel, PartSizeLimits, TransferConfig};
pub use core::{
    ByteRange, DownloadRequest, Downloader, Part, PartHook, ProgressEvent, ProgressEventType,
    ProgressListener, TransferSummary, UploadRequest, Uploader,
};
pub use error::{TransferError, TransferResult};
pub use store::{MemoryStore, MultipartSink, ObjectKey, ObjectSource};

#[cfg(feature = "s3-native")]
pub use store::S3Store;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
