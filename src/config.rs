/*!
 * Configuration types for ostransfer
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::partition::part_count;
use crate::error::{TransferError, TransferResult};
use crate::store::ObjectKey;

/// Default part size (5 MiB)
pub const DEFAULT_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Default number of concurrent part workers
pub const DEFAULT_WORKERS: usize = 3;

/// Upper bound on concurrent part workers
pub const MAX_WORKERS: usize = 100;

/// Suffix appended to the destination for the default download checkpoint
pub const DOWNLOAD_CHECKPOINT_SUFFIX: &str = "dcp";

/// Suffix appended to the source for the default upload checkpoint
pub const UPLOAD_CHECKPOINT_SUFFIX: &str = "ucp";

/// Main configuration for multipart transfers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Part size in bytes
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Number of concurrent part workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Checkpoint (resume) settings
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Accepted part size bounds
    #[serde(default)]
    pub part_size_limits: PartSizeLimits,

    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    #[serde(default)]
    pub verbose: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            workers: default_workers(),
            checkpoint: CheckpointConfig::default(),
            part_size_limits: PartSizeLimits::default(),
            log_level: LogLevel::Info,
            log_file: None,
            verbose: false,
        }
    }
}

/// Checkpoint settings
///
/// `path` wins over `dir`; with neither set the checkpoint lives next to the
/// local file with a `.dcp` / `.ucp` suffix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Persist progress so an interrupted transfer can resume
    #[serde(default)]
    pub enabled: bool,

    /// Explicit checkpoint file
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Directory holding checkpoint files named after the transfer identity
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl CheckpointConfig {
    /// Enabled checkpoint stored at the default location
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Resolve the checkpoint file for a transfer, `None` when disabled
    pub fn resolve(&self, local: &Path, key: &ObjectKey, suffix: &str) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        if let Some(path) = &self.path {
            return Some(path.clone());
        }
        if let Some(dir) = &self.dir {
            let mut hasher = blake3::Hasher::new();
            hasher.update(key.to_string().as_bytes());
            hasher.update(b"\0");
            hasher.update(local.to_string_lossy().as_bytes());
            let name = format!("{}.{}", &hasher.finalize().to_hex()[..32], suffix);
            return Some(dir.join(name));
        }
        let mut name = local.as_os_str().to_os_string();
        name.push(".");
        name.push(suffix);
        Some(PathBuf::from(name))
    }
}

/// Bounds applied to the configured part size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartSizeLimits {
    /// Smallest part accepted for downloads
    #[serde(default = "default_download_min")]
    pub download_min: u64,

    /// Smallest part accepted for uploads (the final part may be shorter)
    #[serde(default = "default_upload_min")]
    pub upload_min: u64,

    /// Largest part accepted in either direction
    #[serde(default = "default_max_part_size")]
    pub max: u64,

    /// Largest part count a multipart session accepts
    #[serde(default = "default_max_parts")]
    pub max_parts: u64,
}

impl Default for PartSizeLimits {
    fn default() -> Self {
        Self {
            download_min: default_download_min(),
            upload_min: default_upload_min(),
            max: default_max_part_size(),
            max_parts: default_max_parts(),
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_part_size() -> u64 {
    DEFAULT_PART_SIZE
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_download_min() -> u64 {
    1
}

fn default_upload_min() -> u64 {
    100 * 1024 // 100 KiB
}

fn default_max_part_size() -> u64 {
    5 * 1024 * 1024 * 1024 // 5 GiB
}

fn default_max_parts() -> u64 {
    10_000
}

impl TransferConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> TransferResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| {
            TransferError::InvalidConfig(format!("{}: {}", path.display(), e))
        })
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> TransferResult<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| TransferError::Serialization(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Set the part size
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    /// Set the worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the checkpoint settings
    pub fn with_checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Set the part size bounds
    pub fn with_part_size_limits(mut self, limits: PartSizeLimits) -> Self {
        self.part_size_limits = limits;
        self
    }

    /// Validate settings for a download
    pub fn validate_download(&self) -> TransferResult<()> {
        self.validate_workers()?;
        self.validate_part_size(self.part_size_limits.download_min)
    }

    /// Validate settings for an upload of `file_size` bytes
    pub fn validate_upload(&self, file_size: u64) -> TransferResult<()> {
        self.validate_workers()?;
        self.validate_part_size(self.part_size_limits.upload_min)?;

        let parts = part_count(file_size, self.part_size);
        if parts > self.part_size_limits.max_parts {
            return Err(TransferError::InvalidConfig(format!(
                "{} parts of {} bytes exceed the limit of {} parts",
                parts, self.part_size, self.part_size_limits.max_parts
            )));
        }
        Ok(())
    }

    fn validate_part_size(&self, min: u64) -> TransferResult<()> {
        let min = min.max(1);
        if self.part_size < min {
            return Err(TransferError::InvalidConfig(format!(
                "Part size {} is below minimum {}",
                self.part_size, min
            )));
        }
        if self.part_size > self.part_size_limits.max {
            return Err(TransferError::InvalidConfig(format!(
                "Part size {} exceeds maximum {}",
                self.part_size, self.part_size_limits.max
            )));
        }
        Ok(())
    }

    fn validate_workers(&self) -> TransferResult<()> {
        if self.workers == 0 {
            return Err(TransferError::InvalidConfig(
                "Worker count must be at least 1".to_string(),
            ));
        }
        if self.workers > MAX_WORKERS {
            return Err(TransferError::InvalidConfig(format!(
                "Worker count {} exceeds maximum {}",
                self.workers, MAX_WORKERS
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key() -> ObjectKey {
        ObjectKey::new("bucket", "dir/object.bin")
    }

    #[test]
    fn test_default_config() {
        let config = TransferConfig::default();
        assert_eq!(config.part_size, DEFAULT_PART_SIZE);
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert!(!config.checkpoint.enabled);
        assert!(config.validate_download().is_ok());
    }

    #[test]
    fn test_download_part_size_bounds() {
        let config = TransferConfig::default().with_part_size(0);
        assert!(matches!(
            config.validate_download(),
            Err(TransferError::InvalidConfig(_))
        ));

        let config = TransferConfig::default().with_part_size(1);
        assert!(config.validate_download().is_ok());

        let config = TransferConfig::default().with_part_size(6 * 1024 * 1024 * 1024);
        assert!(config.validate_download().is_err());
    }

    #[test]
    fn test_upload_part_size_bounds() {
        let config = TransferConfig::default().with_part_size(1024);
        assert!(config.validate_upload(4096).is_err());

        let config = TransferConfig::default().with_part_size(100 * 1024);
        assert!(config.validate_upload(4096).is_ok());
    }

    #[test]
    fn test_upload_part_count_limit() {
        let limits = PartSizeLimits {
            upload_min: 1,
            max_parts: 4,
            ..Default::default()
        };
        let config = TransferConfig::default()
            .with_part_size(10)
            .with_part_size_limits(limits);
        assert!(config.validate_upload(40).is_ok());
        assert!(config.validate_upload(41).is_err());
    }

    #[test]
    fn test_worker_bounds() {
        assert!(TransferConfig::default()
            .with_workers(0)
            .validate_download()
            .is_err());
        assert!(TransferConfig::default()
            .with_workers(MAX_WORKERS + 1)
            .validate_download()
            .is_err());
    }

    #[test]
    fn test_checkpoint_disabled_resolves_none() {
        let cp = CheckpointConfig::default();
        assert!(cp
            .resolve(Path::new("/tmp/out.bin"), &key(), DOWNLOAD_CHECKPOINT_SUFFIX)
            .is_none());
    }

    #[test]
    fn test_checkpoint_default_location() {
        let cp = CheckpointConfig::enabled();
        let path = cp
            .resolve(Path::new("/tmp/out.bin"), &key(), DOWNLOAD_CHECKPOINT_SUFFIX)
            .unwrap();
        assert_eq!(path, PathBuf::from("/tmp/out.bin.dcp"));
    }

    #[test]
    fn test_checkpoint_dir_location_is_stable() {
        let cp = CheckpointConfig {
            enabled: true,
            path: None,
            dir: Some(PathBuf::from("/var/cp")),
        };
        let a = cp
            .resolve(Path::new("/tmp/a.bin"), &key(), UPLOAD_CHECKPOINT_SUFFIX)
            .unwrap();
        let again = cp
            .resolve(Path::new("/tmp/a.bin"), &key(), UPLOAD_CHECKPOINT_SUFFIX)
            .unwrap();
        let b = cp
            .resolve(Path::new("/tmp/b.bin"), &key(), UPLOAD_CHECKPOINT_SUFFIX)
            .unwrap();
        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(Path::new("/var/cp")));
        assert_eq!(a.extension().and_then(|e| e.to_str()), Some("ucp"));
    }

    #[test]
    fn test_checkpoint_explicit_path_wins() {
        let cp = CheckpointConfig {
            enabled: true,
            path: Some(PathBuf::from("/x/explicit.cp")),
            dir: Some(PathBuf::from("/var/cp")),
        };
        let path = cp
            .resolve(Path::new("/tmp/a.bin"), &key(), UPLOAD_CHECKPOINT_SUFFIX)
            .unwrap();
        assert_eq!(path, PathBuf::from("/x/explicit.cp"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ostransfer.toml");

        let config = TransferConfig::default()
            .with_part_size(1024 * 1024)
            .with_workers(8)
            .with_checkpoint(CheckpointConfig::enabled());
        config.to_file(&path).unwrap();

        let loaded = TransferConfig::from_file(&path).unwrap();
        assert_eq!(loaded.part_size, 1024 * 1024);
        assert_eq!(loaded.workers, 8);
        assert!(loaded.checkpoint.enabled);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TransferConfig = toml::from_str("workers = 2\n").unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.part_size, DEFAULT_PART_SIZE);
        assert_eq!(config.part_size_limits, PartSizeLimits::default());
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Debug.to_tracing_level(), tracing::Level::DEBUG);
    }
}
