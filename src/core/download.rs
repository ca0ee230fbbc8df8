/*!
 * Multipart download orchestration
 *
 * A download fetches the object (or a byte range of it) part by part into a
 * working file next to the destination, `<dest>.temp`. Each worker writes its
 * part at `part.start - part.offset`, so parts may finish in any order. Once
 * every part is in place the working file is renamed over the destination.
 *
 * With checkpointing enabled the plan and completion bitmap are persisted
 * after every part, and a later call with the same request resumes from the
 * checkpoint as long as the object has not changed.
 */

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::{TransferConfig, DOWNLOAD_CHECKPOINT_SUFFIX};
use crate::core::checkpoint::{self, DownloadCheckpoint};
use crate::core::partition::{ByteRange, Part};
use crate::core::pool::{PartHook, PartWorker, WorkerPool};
use crate::core::progress::{ProgressListener, ProgressPublisher};
use crate::core::TransferSummary;
use crate::error::{TransferError, TransferResult};
use crate::store::{ObjectKey, ObjectSource};

/// Suffix of the working file written during a download
pub const WORKING_FILE_SUFFIX: &str = "temp";

/// What to download and where to put it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Object to download
    pub key: ObjectKey,

    /// Destination file
    pub dest: PathBuf,

    /// Byte range to download (whole object when `None`)
    pub range: Option<ByteRange>,
}

impl DownloadRequest {
    /// Download the whole object to `dest`
    pub fn new(key: ObjectKey, dest: impl Into<PathBuf>) -> Self {
        Self {
            key,
            dest: dest.into(),
            range: None,
        }
    }

    /// Only download `range`
    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Working file the parts are written into
    pub fn working_path(&self) -> PathBuf {
        let mut name = self.dest.as_os_str().to_os_string();
        name.push(".");
        name.push(WORKING_FILE_SUFFIX);
        PathBuf::from(name)
    }
}

/// Downloads objects in parallel parts
pub struct Downloader<S: ObjectSource> {
    source: Arc<S>,
    config: TransferConfig,
    listener: Option<Arc<dyn ProgressListener>>,
    hook: Option<PartHook>,
}

impl<S: ObjectSource> Downloader<S> {
    /// Create a downloader reading from `source`
    pub fn new(source: Arc<S>, config: TransferConfig) -> Self {
        Self {
            source,
            config,
            listener: None,
            hook: None,
        }
    }

    /// Report progress to `listener`
    pub fn with_progress(mut self, listener: impl ProgressListener + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Run `hook` before every part download
    pub fn with_part_hook(mut self, hook: PartHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Download `request.key` into `request.dest`
    ///
    /// On failure the working file and the checkpoint are left in place so a
    /// later call can resume.
    pub async fn download(&self, request: &DownloadRequest) -> TransferResult<TransferSummary> {
        let started_at = Instant::now();
        self.config.validate_download()?;
        request.key.validate()?;

        let working_path = request.working_path();
        let checkpoint_path =
            self.config
                .checkpoint
                .resolve(&request.dest, &request.key, DOWNLOAD_CHECKPOINT_SUFFIX);

        let (mut cp, resumed) = match self
            .resume(checkpoint_path.as_deref(), request, &working_path)
            .await?
        {
            Some(cp) => (cp, true),
            None => {
                let mut cp = DownloadCheckpoint::prepare(
                    self.source.as_ref(),
                    &request.key,
                    &request.dest,
                    request.range,
                    self.config.part_size,
                )
                .await?;
                if let Some(path) = checkpoint_path.as_deref() {
                    if !cp.table.parts.is_empty() {
                        cp.dump(path).await?;
                    }
                }
                create_working_file(&working_path, cp.total_bytes()).await?;
                (cp, false)
            }
        };

        let total = cp.total_bytes();
        let resumed_bytes = cp.completed_bytes();
        let todo = cp.todo_parts();
        let progress = ProgressPublisher::new(self.listener.clone());

        info!(
            key = %request.key,
            dest = %request.dest.display(),
            parts = cp.table.parts.len(),
            todo = todo.len(),
            total,
            resumed,
            "Starting download"
        );
        progress.started(resumed_bytes, total);

        let mut consumed = resumed_bytes;
        if !todo.is_empty() {
            let worker = Arc::new(RangeDownloader {
                source: self.source.clone(),
                key: request.key.clone(),
                working_path: working_path.clone(),
            });
            let pool = WorkerPool::new(self.config.workers).with_hook(self.hook.clone());
            let mut run = pool.run(todo, worker);

            let mut failure: Option<TransferError> = None;
            while let Some(outcome) = run.next().await {
                let part = outcome.part;
                let recorded = match outcome.result {
                    Ok(bytes) => {
                        record(&mut cp, checkpoint_path.as_deref(), part).await.map(|_| bytes)
                    }
                    Err(e) => Err(e.context(format!("part {}", part.number))),
                };

                match recorded {
                    Ok(bytes) => {
                        consumed += bytes;
                        debug!(part = part.index, bytes, consumed, total, "Part downloaded");
                        if failure.is_none() {
                            progress.data(consumed, total, bytes);
                        }
                    }
                    Err(e) if failure.is_none() => {
                        warn!(key = %request.key, part = part.index, error = %e, "Download part failed");
                        run.cancel();
                        failure = Some(e);
                    }
                    Err(e) => {
                        debug!(part = part.index, error = %e, "Dropping additional part failure");
                    }
                }
            }

            if let Err(e) = run.join().await {
                failure.get_or_insert(e);
            }
            if failure.is_none() && !cp.table.is_complete() {
                failure = Some(TransferError::Worker(
                    "worker pool stopped before every part completed".to_string(),
                ));
            }
            if let Some(e) = failure {
                progress.failed(consumed, total);
                return Err(e);
            }
        }

        progress.completed(consumed, total);
        checkpoint::complete(checkpoint_path.as_deref(), &working_path, &request.dest).await?;

        let summary = TransferSummary {
            total_bytes: total,
            transferred_bytes: consumed - resumed_bytes,
            resumed_bytes,
            parts: cp.table.parts.len(),
            duration: started_at.elapsed(),
            resumed,
            object: None,
        };
        info!(
            key = %request.key,
            bytes = summary.transferred_bytes,
            elapsed_ms = summary.duration.as_millis() as u64,
            "Download complete"
        );
        Ok(summary)
    }

    /// Load the checkpoint if it is still usable
    async fn resume(
        &self,
        checkpoint_path: Option<&Path>,
        request: &DownloadRequest,
        working_path: &Path,
    ) -> TransferResult<Option<DownloadCheckpoint>> {
        let Some(path) = checkpoint_path else {
            return Ok(None);
        };
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(None);
        }

        let cp = match DownloadCheckpoint::load(path).await {
            Ok(cp) => cp,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable checkpoint");
                return Ok(None);
            }
        };

        let valid = cp
            .is_valid(self.source.as_ref(), &request.key, &request.dest, request.range)
            .await?;
        if !valid {
            warn!(path = %path.display(), "Discarding stale checkpoint");
            return Ok(None);
        }
        if !tokio::fs::try_exists(working_path).await.unwrap_or(false) {
            warn!(path = %working_path.display(), "Working file missing, restarting download");
            return Ok(None);
        }

        info!(
            path = %path.display(),
            completed = cp.table.completed_count(),
            parts = cp.table.parts.len(),
            "Resuming download from checkpoint"
        );
        Ok(Some(cp))
    }
}

/// Flag a part done and persist the checkpoint
async fn record(
    cp: &mut DownloadCheckpoint,
    checkpoint_path: Option<&Path>,
    part: Part,
) -> TransferResult<()> {
    cp.mark_complete(part.index)?;
    if let Some(path) = checkpoint_path {
        cp.dump(path).await?;
    }
    Ok(())
}

async fn create_working_file(path: &Path, len: u64) -> TransferResult<()> {
    let file = tokio::fs::File::create(path).await.map_err(|e| {
        TransferError::Io(format!("failed to create {}: {}", path.display(), e))
    })?;
    file.set_len(len).await?;
    Ok(())
}

/// Fetches one range and writes it into the working file
struct RangeDownloader<S: ObjectSource> {
    source: Arc<S>,
    key: ObjectKey,
    working_path: PathBuf,
}

#[async_trait]
impl<S: ObjectSource> PartWorker for RangeDownloader<S> {
    type Output = u64;

    async fn transfer(&self, part: &Part) -> TransferResult<u64> {
        let data = self
            .source
            .fetch_range(&self.key, part.start, part.end)
            .await?;
        if data.len() as u64 != part.len() {
            return Err(TransferError::Network(format!(
                "expected {} bytes for part {}, got {}",
                part.len(),
                part.number,
                data.len()
            )));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.working_path)
            .await?;
        file.seek(std::io::SeekFrom::Start(part.relative_start()))
            .await?;
        file.write_all(&data).await?;
        file.flush().await?;

        Ok(part.len())
    }
}
