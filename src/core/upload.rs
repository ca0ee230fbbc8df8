/*!
 * Multipart upload orchestration
 *
 * An upload opens a multipart session, sends every part of the local file
 * into its numbered slot, and completes the session with the part receipts
 * ordered by part number. The session id and the receipts are part of the
 * checkpoint, so a resumed upload continues the same session.
 */

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::config::{TransferConfig, UPLOAD_CHECKPOINT_SUFFIX};
use crate::core::checkpoint::{self, UploadCheckpoint};
use crate::core::partition::Part;
use crate::core::pool::{PartHook, PartWorker, WorkerPool};
use crate::core::progress::{ProgressListener, ProgressPublisher};
use crate::core::TransferSummary;
use crate::error::{TransferError, TransferResult};
use crate::store::{FileStat, MultipartSink, ObjectKey, PartHandle};

/// What to upload and where to put it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Local source file
    pub src: PathBuf,

    /// Destination object
    pub key: ObjectKey,
}

impl UploadRequest {
    /// Upload `src` to `key`
    pub fn new(src: impl Into<PathBuf>, key: ObjectKey) -> Self {
        Self {
            src: src.into(),
            key,
        }
    }
}

/// Uploads files as multipart objects
pub struct Uploader<S: MultipartSink> {
    sink: Arc<S>,
    config: TransferConfig,
    listener: Option<Arc<dyn ProgressListener>>,
    hook: Option<PartHook>,
}

impl<S: MultipartSink> Uploader<S> {
    /// Create an uploader writing to `sink`
    pub fn new(sink: Arc<S>, config: TransferConfig) -> Self {
        Self {
            sink,
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

    /// Run `hook` before every part upload
    pub fn with_part_hook(mut self, hook: PartHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Upload `request.src` to `request.key`
    ///
    /// With checkpointing enabled a failed upload leaves its session open for
    /// a later resume; without it the session is aborted.
    pub async fn upload(&self, request: &UploadRequest) -> TransferResult<TransferSummary> {
        let started_at = Instant::now();
        request.key.validate()?;
        let file_stat = FileStat::of(&request.src).await?;
        self.config.validate_upload(file_stat.size)?;

        let checkpoint_path =
            self.config
                .checkpoint
                .resolve(&request.src, &request.key, UPLOAD_CHECKPOINT_SUFFIX);

        let (mut cp, resumed) = match self.resume(checkpoint_path.as_deref(), request).await? {
            Some(cp) => (cp, true),
            None => {
                let mut cp = UploadCheckpoint::prepare(
                    self.sink.as_ref(),
                    &request.key,
                    &request.src,
                    self.config.part_size,
                )
                .await?;
                if let Some(path) = checkpoint_path.as_deref() {
                    if !cp.table.parts.is_empty() {
                        if let Err(e) = cp.dump(path).await {
                            self.abort(&request.key, &cp.upload_id).await;
                            return Err(e);
                        }
                    }
                }
                (cp, false)
            }
        };

        let total = cp.total_bytes();
        let resumed_bytes = cp.completed_bytes();
        let todo = cp.todo_parts();
        let progress = ProgressPublisher::new(self.listener.clone());

        info!(
            key = %request.key,
            src = %request.src.display(),
            upload_id = %cp.upload_id,
            parts = cp.table.parts.len(),
            todo = todo.len(),
            total,
            resumed,
            "Starting upload"
        );
        progress.started(resumed_bytes, total);

        let mut consumed = resumed_bytes;
        if !todo.is_empty() {
            let worker = Arc::new(PartUploader {
                sink: self.sink.clone(),
                key: request.key.clone(),
                upload_id: cp.upload_id.clone(),
                src: request.src.clone(),
            });
            let pool = WorkerPool::new(self.config.workers).with_hook(self.hook.clone());
            let mut run = pool.run(todo, worker);

            let mut failure: Option<TransferError> = None;
            while let Some(outcome) = run.next().await {
                let part = outcome.part;
                let recorded = match outcome.result {
                    Ok(handle) => record(&mut cp, checkpoint_path.as_deref(), part, handle).await,
                    Err(e) => Err(e.context(format!("part {}", part.number))),
                };

                match recorded {
                    Ok(()) => {
                        consumed += part.len();
                        debug!(part = part.index, bytes = part.len(), consumed, total, "Part uploaded");
                        if failure.is_none() {
                            progress.data(consumed, total, part.len());
                        }
                    }
                    Err(e) if failure.is_none() => {
                        warn!(key = %request.key, part = part.index, error = %e, "Upload part failed");
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
                if checkpoint_path.is_none() {
                    self.abort(&request.key, &cp.upload_id).await;
                }
                return Err(e);
            }
        }

        progress.completed(consumed, total);
        let handles = cp.completed_handles();
        let object = self
            .sink
            .complete_session(&request.key, &cp.upload_id, &handles)
            .await
            .map_err(|e| e.context(format!("complete upload {}", cp.upload_id)))?;

        if let Some(path) = checkpoint_path.as_deref() {
            checkpoint::remove(path).await;
        }

        let summary = TransferSummary {
            total_bytes: total,
            transferred_bytes: consumed - resumed_bytes,
            resumed_bytes,
            parts: cp.table.parts.len(),
            duration: started_at.elapsed(),
            resumed,
            object: Some(object),
        };
        info!(
            key = %request.key,
            bytes = summary.transferred_bytes,
            elapsed_ms = summary.duration.as_millis() as u64,
            "Upload complete"
        );
        Ok(summary)
    }

    /// Load the checkpoint if it is still usable
    async fn resume(
        &self,
        checkpoint_path: Option<&Path>,
        request: &UploadRequest,
    ) -> TransferResult<Option<UploadCheckpoint>> {
        let Some(path) = checkpoint_path else {
            return Ok(None);
        };
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(None);
        }

        let cp = match UploadCheckpoint::load(path).await {
            Ok(cp) => cp,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable checkpoint");
                return Ok(None);
            }
        };

        if !cp.is_valid(&request.key, &request.src).await? {
            warn!(path = %path.display(), "Discarding stale checkpoint");
            if cp.object_key == request.key {
                self.abort(&request.key, &cp.upload_id).await;
            }
            return Ok(None);
        }

        info!(
            path = %path.display(),
            upload_id = %cp.upload_id,
            completed = cp.table.completed_count(),
            parts = cp.table.parts.len(),
            "Resuming upload from checkpoint"
        );
        Ok(Some(cp))
    }

    /// Abort a session, logging failures
    async fn abort(&self, key: &ObjectKey, upload_id: &str) {
        match self.sink.abort_session(key, upload_id).await {
            Ok(()) => debug!(key = %key, upload_id, "Aborted multipart session"),
            Err(e) => warn!(key = %key, upload_id, error = %e, "Failed to abort multipart session"),
        }
    }
}

/// Keep the receipt and persist the checkpoint
async fn record(
    cp: &mut UploadCheckpoint,
    checkpoint_path: Option<&Path>,
    part: Part,
    handle: PartHandle,
) -> TransferResult<()> {
    cp.mark_complete(part.index, handle)?;
    if let Some(path) = checkpoint_path {
        cp.dump(path).await?;
    }
    Ok(())
}

/// Reads one part of the source file and sends it into the session
struct PartUploader<S: MultipartSink> {
    sink: Arc<S>,
    key: ObjectKey,
    upload_id: String,
    src: PathBuf,
}

impl<S: MultipartSink> PartUploader<S> {
    async fn read_part(&self, part: &Part) -> TransferResult<Bytes> {
        let len = usize::try_from(part.len()).map_err(|_| {
            TransferError::InvalidConfig(format!("part of {} bytes does not fit in memory", part.len()))
        })?;

        let mut file = tokio::fs::File::open(&self.src).await.map_err(|e| {
            TransferError::Io(format!("failed to open {}: {}", self.src.display(), e))
        })?;
        file.seek(std::io::SeekFrom::Start(part.start)).await?;

        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl<S: MultipartSink> PartWorker for PartUploader<S> {
    type Output = PartHandle;

    async fn transfer(&self, part: &Part) -> TransferResult<PartHandle> {
        let data = self.read_part(part).await?;
        self.sink
            .send_part(&self.key, &self.upload_id, part.number, data)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CheckpointConfig, PartSizeLimits};
    use crate::core::progress::{ProgressEvent, ProgressEventType};
    use crate::logging::init_test_logging;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn key() -> ObjectKey {
        ObjectKey::new("bucket", "upload.bin")
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn config(part_size: u64, workers: usize, checkpoint: bool) -> TransferConfig {
        let limits = PartSizeLimits {
            upload_min: 1,
            ..Default::default()
        };
        let checkpoint = if checkpoint {
            CheckpointConfig::enabled()
        } else {
            CheckpointConfig::default()
        };
        TransferConfig::default()
            .with_part_size(part_size)
            .with_workers(workers)
            .with_part_size_limits(limits)
            .with_checkpoint(checkpoint)
    }

    fn failing_once(index: usize) -> PartHook {
        let failed = Arc::new(AtomicBool::new(false));
        Arc::new(move |part: &Part| {
            if part.index == index && !failed.swap(true, Ordering::SeqCst) {
                return Err(TransferError::Network("injected".to_string()));
            }
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_upload_file() {
        init_test_logging();
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, payload(1000)).unwrap();
        let store = Arc::new(MemoryStore::new());

        let summary = Uploader::new(store.clone(), config(128, 3, false))
            .upload(&UploadRequest::new(&src, key()))
            .await
            .unwrap();

        assert_eq!(store.object(&key()).unwrap(), Bytes::from(payload(1000)));
        assert_eq!(summary.parts, 8);
        assert_eq!(summary.transferred_bytes, 1000);
        assert_eq!(summary.object.unwrap().size, 1000);
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_missing_source() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let err = Uploader::new(store.clone(), config(128, 3, true))
            .upload(&UploadRequest::new(dir.path().join("nope"), key()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::LocalFileNotFound(_)));
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_part_size_below_upload_minimum() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, payload(10)).unwrap();
        let store = Arc::new(MemoryStore::new());

        let config = TransferConfig::default().with_part_size(1024);
        let err = Uploader::new(store.clone(), config)
            .upload(&UploadRequest::new(&src, key()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidConfig(_)));
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_failure_without_checkpoint_aborts_session() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, payload(300)).unwrap();
        let store = Arc::new(MemoryStore::new());

        let err = Uploader::new(store.clone(), config(100, 2, false))
            .with_part_hook(failing_once(1))
            .upload(&UploadRequest::new(&src, key()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::WithContext { .. }));
        assert_eq!(store.open_sessions(), 0);
        assert!(store.object(&key()).is_none());
    }

    #[tokio::test]
    async fn test_failure_with_checkpoint_resumes_session() {
        init_test_logging();
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, payload(300)).unwrap();
        let store = Arc::new(MemoryStore::new());
        let request = UploadRequest::new(&src, key());
        let hook = failing_once(1);

        Uploader::new(store.clone(), config(100, 2, true))
            .with_part_hook(hook.clone())
            .upload(&request)
            .await
            .unwrap_err();

        let cp_path = dir.path().join("src.bin.ucp");
        let cp = UploadCheckpoint::load(&cp_path).await.unwrap();
        assert!(!cp.table.part_status[1]);
        assert_eq!(store.open_sessions(), 1);

        let summary = Uploader::new(store.clone(), config(100, 2, true))
            .with_part_hook(hook)
            .upload(&request)
            .await
            .unwrap();
        assert!(summary.resumed);
        assert_eq!(summary.resumed_bytes, cp.completed_bytes());
        assert_eq!(store.object(&key()).unwrap(), Bytes::from(payload(300)));
        assert_eq!(store.open_sessions(), 0);
        assert!(!cp_path.exists());
    }

    #[tokio::test]
    async fn test_changed_source_restarts_session() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, payload(300)).unwrap();
        let store = Arc::new(MemoryStore::new());
        let request = UploadRequest::new(&src, key());

        Uploader::new(store.clone(), config(100, 1, true))
            .with_part_hook(failing_once(2))
            .upload(&request)
            .await
            .unwrap_err();
        let old = UploadCheckpoint::load(&dir.path().join("src.bin.ucp"))
            .await
            .unwrap();

        std::fs::write(&src, payload(450)).unwrap();
        let summary = Uploader::new(store.clone(), config(100, 1, true))
            .upload(&request)
            .await
            .unwrap();

        assert!(!summary.resumed);
        assert_eq!(summary.parts, 5);
        assert_eq!(store.object(&key()).unwrap(), Bytes::from(payload(450)));
        assert!(store.session_parts(&old.upload_id).is_empty());
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_empty_file() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("empty.bin");
        std::fs::write(&src, b"").unwrap();
        let store = Arc::new(MemoryStore::new());

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let summary = Uploader::new(store.clone(), config(100, 2, true))
            .with_progress(move |e: &ProgressEvent| sink.lock().unwrap().push(*e))
            .upload(&UploadRequest::new(&src, key()))
            .await
            .unwrap();

        assert_eq!(summary.parts, 0);
        assert_eq!(store.object(&key()).unwrap().len(), 0);
        assert!(!dir.path().join("empty.bin.ucp").exists());

        let types: Vec<_> = events.lock().unwrap().iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![ProgressEventType::Started, ProgressEventType::Completed]
        );
    }
}
