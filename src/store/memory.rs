//! In-memory storage service
//!
//! Implements both collaborator traits without touching the network, so the
//! orchestrators can be exercised end to end in unit and integration tests.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::{MultipartSink, ObjectDescriptor, ObjectKey, ObjectSource, ObjectStat, PartHandle};
use crate::error::{TransferError, TransferResult};

/// Per-request latency, keyed by range start (downloads) or part number (uploads)
pub type LatencyFn = Arc<dyn Fn(u64) -> Duration + Send + Sync>;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    stat: ObjectStat,
}

#[derive(Debug, Clone)]
struct Session {
    key: ObjectKey,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<ObjectKey, StoredObject>,
    sessions: HashMap<String, Session>,
}

/// Storage service held entirely in memory
///
/// # Example
///
/// ```
/// use ostransfer::store::{MemoryStore, ObjectKey, ObjectSource};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MemoryStore::new();
/// let key = ObjectKey::new("bucket", "hello.txt");
/// store.put_object(&key, b"Hello, World!".to_vec());
///
/// let stat = store.stat(&key).await?;
/// assert_eq!(stat.size, 13);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    next_upload_id: Arc<AtomicU64>,
    latency: Option<LatencyFn>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            next_upload_id: Arc::new(AtomicU64::new(1)),
            latency: None,
        }
    }

    /// Delay every range fetch and part upload by `latency(start_or_number)`
    pub fn with_latency(mut self, latency: LatencyFn) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Store (or replace) an object, assigning a fresh ETag and timestamp
    pub fn put_object(&self, key: &ObjectKey, data: impl Into<Bytes>) -> ObjectStat {
        let data = data.into();
        let stat = ObjectStat {
            size: data.len() as u64,
            last_modified: Some(Utc::now()),
            etag: Some(content_etag(&data)),
        };
        self.write()
            .objects
            .insert(key.clone(), StoredObject { data, stat: stat.clone() });
        stat
    }

    /// Contents of an object, if present
    pub fn object(&self, key: &ObjectKey) -> Option<Bytes> {
        self.read().objects.get(key).map(|o| o.data.clone())
    }

    /// Number of multipart sessions that were opened but neither completed nor aborted
    pub fn open_sessions(&self) -> usize {
        self.read().sessions.len()
    }

    /// Part numbers uploaded so far into a session
    pub fn session_parts(&self, upload_id: &str) -> Vec<u32> {
        self.read()
            .sessions
            .get(upload_id)
            .map(|s| s.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    async fn delay(&self, at: u64) {
        if let Some(latency) = &self.latency {
            let wait = latency(at);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }

    // Lock poisoning only happens if a holder panicked; the map is still consistent.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn content_etag(data: &[u8]) -> String {
    format!("\"{}\"", &blake3::hash(data).to_hex()[..32])
}

fn not_found(key: &ObjectKey) -> TransferError {
    TransferError::NotFound {
        bucket: key.bucket.clone(),
        key: key.key.clone(),
    }
}

#[async_trait]
impl ObjectSource for MemoryStore {
    async fn stat(&self, key: &ObjectKey) -> TransferResult<ObjectStat> {
        self.read()
            .objects
            .get(key)
            .map(|o| o.stat.clone())
            .ok_or_else(|| not_found(key))
    }

    async fn fetch_range(&self, key: &ObjectKey, start: u64, end: u64) -> TransferResult<Bytes> {
        self.delay(start).await;

        let data = self
            .read()
            .objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| not_found(key))?;

        let len = data.len() as u64;
        if start > end || end >= len {
            return Err(TransferError::InvalidRange(format!(
                "bytes={}-{} of {} byte object",
                start, end, len
            )));
        }
        Ok(data.slice(start as usize..=end as usize))
    }
}

#[async_trait]
impl MultipartSink for MemoryStore {
    async fn initiate_session(&self, key: &ObjectKey) -> TransferResult<String> {
        let upload_id = format!("upload-{}", self.next_upload_id.fetch_add(1, Ordering::SeqCst));
        self.write().sessions.insert(
            upload_id.clone(),
            Session {
                key: key.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn send_part(
        &self,
        key: &ObjectKey,
        upload_id: &str,
        number: u32,
        data: Bytes,
    ) -> TransferResult<PartHandle> {
        self.delay(number as u64).await;

        let etag = content_etag(&data);
        let size = data.len() as u64;

        let mut inner = self.write();
        let session = inner
            .sessions
            .get_mut(upload_id)
            .filter(|s| &s.key == key)
            .ok_or_else(|| TransferError::Session(format!("no such upload: {}", upload_id)))?;
        session.parts.insert(number, (etag.clone(), data));

        Ok(PartHandle::new(number, etag, size))
    }

    async fn complete_session(
        &self,
        key: &ObjectKey,
        upload_id: &str,
        parts: &[PartHandle],
    ) -> TransferResult<ObjectDescriptor> {
        let mut inner = self.write();
        let session = inner
            .sessions
            .get(upload_id)
            .filter(|s| &s.key == key)
            .ok_or_else(|| TransferError::Session(format!("no such upload: {}", upload_id)))?;

        let mut body = BytesMut::new();
        let mut previous = 0;
        for handle in parts {
            if handle.number <= previous {
                return Err(TransferError::Session(format!(
                    "part {} out of order",
                    handle.number
                )));
            }
            previous = handle.number;

            match session.parts.get(&handle.number) {
                Some((etag, data)) if *etag == handle.etag => body.extend_from_slice(data),
                Some(_) => {
                    return Err(TransferError::Session(format!(
                        "etag mismatch for part {}",
                        handle.number
                    )))
                }
                None => {
                    return Err(TransferError::Session(format!(
                        "part {} was never uploaded",
                        handle.number
                    )))
                }
            }
        }

        let data = body.freeze();
        let etag = format!(
            "\"{}-{}\"",
            &blake3::hash(&data).to_hex()[..32],
            parts.len()
        );
        let stat = ObjectStat {
            size: data.len() as u64,
            last_modified: Some(Utc::now()),
            etag: Some(etag.clone()),
        };

        inner.sessions.remove(upload_id);
        inner
            .objects
            .insert(key.clone(), StoredObject { data, stat: stat.clone() });

        Ok(ObjectDescriptor {
            key: key.clone(),
            etag: Some(etag),
            size: stat.size,
        })
    }

    async fn abort_session(&self, _key: &ObjectKey, upload_id: &str) -> TransferResult<()> {
        self.write()
            .sessions
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| TransferError::Session(format!("no such upload: {}", upload_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ObjectKey {
        ObjectKey::new("bucket", "object")
    }

    #[tokio::test]
    async fn test_stat_and_fetch_range() {
        let store = MemoryStore::new();
        store.put_object(&key(), b"0123456789".to_vec());

        let stat = store.stat(&key()).await.unwrap();
        assert_eq!(stat.size, 10);
        assert!(stat.etag.is_some());

        let range = store.fetch_range(&key(), 2, 5).await.unwrap();
        assert_eq!(&range[..], b"2345");
    }

    #[tokio::test]
    async fn test_fetch_range_out_of_bounds() {
        let store = MemoryStore::new();
        store.put_object(&key(), b"abc".to_vec());
        let err = store.fetch_range(&key(), 1, 3).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidRange(_)));
    }

    #[tokio::test]
    async fn test_missing_object() {
        let store = MemoryStore::new();
        let err = store.stat(&key()).await.unwrap_err();
        assert!(matches!(err, TransferError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_put_replaces_etag() {
        let store = MemoryStore::new();
        let first = store.put_object(&key(), b"one".to_vec());
        let second = store.put_object(&key(), b"two".to_vec());
        assert_ne!(first.etag, second.etag);
    }

    #[tokio::test]
    async fn test_multipart_session() {
        let store = MemoryStore::new();
        let upload_id = store.initiate_session(&key()).await.unwrap();
        assert_eq!(store.open_sessions(), 1);

        // Parts may arrive in any order.
        let p2 = store
            .send_part(&key(), &upload_id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let p1 = store
            .send_part(&key(), &upload_id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        assert_eq!(store.session_parts(&upload_id), vec![1, 2]);

        let descriptor = store
            .complete_session(&key(), &upload_id, &[p1, p2])
            .await
            .unwrap();
        assert_eq!(descriptor.size, 11);
        assert_eq!(store.object(&key()).unwrap(), Bytes::from_static(b"hello world"));
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_complete_rejects_unordered_parts() {
        let store = MemoryStore::new();
        let upload_id = store.initiate_session(&key()).await.unwrap();
        let p1 = store
            .send_part(&key(), &upload_id, 1, Bytes::from_static(b"a"))
            .await
            .unwrap();
        let p2 = store
            .send_part(&key(), &upload_id, 2, Bytes::from_static(b"b"))
            .await
            .unwrap();

        let err = store
            .complete_session(&key(), &upload_id, &[p2, p1])
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Session(_)));
        assert_eq!(store.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_abort_session() {
        let store = MemoryStore::new();
        let upload_id = store.initiate_session(&key()).await.unwrap();
        store.abort_session(&key(), &upload_id).await.unwrap();
        assert_eq!(store.open_sessions(), 0);
        assert!(store.abort_session(&key(), &upload_id).await.is_err());
    }
}
