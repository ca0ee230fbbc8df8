/*!
 * Error types for ostransfer
 */

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for transfer operations
pub type TransferResult<T> = Result<T, TransferError>;

/// Errors that can occur while planning, running or assembling a transfer
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    /// Invalid configuration (part size, worker count, ...)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid object key
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    /// Local source file does not exist
    #[error("Local file not found: {}", .0.display())]
    LocalFileNotFound(PathBuf),

    /// Object not found in bucket
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Access denied error
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Storage service error with specific error code
    #[error("Storage service error ({code}): {message}")]
    Service { code: String, message: String },

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Checkpoint file could not be read or written
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid range request
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Multipart session error
    #[error("Multipart session error: {0}")]
    Session(String),

    /// A worker task panicked or was aborted
    #[error("Worker error: {0}")]
    Worker(String),

    /// Storage SDK error
    #[error("Storage SDK error: {0}")]
    Sdk(String),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<TransferError>,
    },
}

/// Coarse classification used for log fields and caller retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad arguments, rejected before any I/O
    Configuration,
    /// Object or file metadata could not be fetched
    Stat,
    /// A part transfer failed
    Transfer,
    /// Final rename or session completion failed
    Assembly,
    /// Checkpoint persistence failed
    Checkpoint,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Stat => write!(f, "stat"),
            ErrorCategory::Transfer => write!(f, "transfer"),
            ErrorCategory::Assembly => write!(f, "assembly"),
            ErrorCategory::Checkpoint => write!(f, "checkpoint"),
        }
    }
}

impl TransferError {
    /// Add context to an error
    pub fn context<S: Into<String>>(self, context: S) -> Self {
        TransferError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Check if re-invoking the transfer has a chance of succeeding
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Network(_) | TransferError::Io(_) | TransferError::Worker(_) => true,
            TransferError::Service { code, .. } => is_retryable_code(code),
            TransferError::Sdk(msg) => {
                let lower = msg.to_lowercase();
                lower.contains("connection reset")
                    || lower.contains("timed out")
                    || lower.contains("broken pipe")
                    || lower.contains("temporarily unavailable")
            }
            TransferError::WithContext { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransferError::InvalidConfig(_)
            | TransferError::InvalidKey(_)
            | TransferError::LocalFileNotFound(_)
            | TransferError::InvalidRange(_) => ErrorCategory::Configuration,
            TransferError::NotFound { .. } | TransferError::AccessDenied(_) => ErrorCategory::Stat,
            TransferError::Checkpoint(_) | TransferError::Serialization(_) => {
                ErrorCategory::Checkpoint
            }
            TransferError::Session(_) => ErrorCategory::Assembly,
            TransferError::WithContext { source, .. } => source.category(),
            _ => ErrorCategory::Transfer,
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        TransferError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(err: tokio::task::JoinError) -> Self {
        TransferError::Worker(err.to_string())
    }
}

/// Check if a storage service error code is retryable
pub(crate) fn is_retryable_code(code: &str) -> bool {
    matches!(
        code,
        "RequestTimeout" | "ServiceUnavailable" | "InternalError" | "SlowDown"
    )
}
