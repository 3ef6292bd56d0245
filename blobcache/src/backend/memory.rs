//! In-process object store implementing `ObjectBackend`.
//!
//! Every trait call is counted so tests can prove how many remote round
//! trips an operation issued. Downloads can be slowed down to widen race
//! windows, and copies can be made to report `Pending` for a number of polls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{Mutex, RwLock};

use super::{BackendResult, CopyStatus, Download, Metadata, ObjectBackend, ObjectProperties};
use crate::upload::PartId;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    content_type: Option<String>,
    metadata: Metadata,
}

impl StoredObject {
    fn properties(&self) -> ObjectProperties {
        ObjectProperties {
            etag: self.etag.clone(),
            length: self.data.len() as u64,
            content_type: self.content_type.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct CallCounters {
    ensure_container: AtomicU64,
    head: AtomicU64,
    get: AtomicU64,
    put: AtomicU64,
    delete: AtomicU64,
    set_metadata: AtomicU64,
    start_copy: AtomicU64,
    copy_status: AtomicU64,
    stage_part: AtomicU64,
    commit_parts: AtomicU64,
}

/// Snapshot of the calls a `MemoryBackend` has served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    pub ensure_container: u64,
    pub head: u64,
    pub get: u64,
    pub put: u64,
    pub delete: u64,
    pub set_metadata: u64,
    pub start_copy: u64,
    pub copy_status: u64,
    pub stage_part: u64,
    pub commit_parts: u64,
}

impl CallStats {
    /// Calls that change remote state.
    pub fn mutations(&self) -> u64 {
        self.put
            + self.delete
            + self.set_metadata
            + self.start_copy
            + self.stage_part
            + self.commit_parts
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<HashMap<String, StoredObject>>,
    staged: Mutex<HashMap<String, HashMap<PartId, Bytes>>>,
    copies: Mutex<HashMap<String, u32>>,
    counters: CallCounters,
    container_created: AtomicBool,
    download_delay: Option<Duration>,
    pending_copy_polls: u32,
    downloads_in_flight: AtomicUsize,
    max_downloads_in_flight: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every download sleeps for `delay` before returning.
    pub fn with_download_delay(mut self, delay: Duration) -> Self {
        self.download_delay = Some(delay);
        self
    }

    /// Copies report `Pending` for `polls` status checks before succeeding.
    pub fn with_pending_copy_polls(mut self, polls: u32) -> Self {
        self.pending_copy_polls = polls;
        self
    }

    pub fn stats(&self) -> CallStats {
        let c = &self.counters;
        CallStats {
            ensure_container: c.ensure_container.load(Ordering::SeqCst),
            head: c.head.load(Ordering::SeqCst),
            get: c.get.load(Ordering::SeqCst),
            put: c.put.load(Ordering::SeqCst),
            delete: c.delete.load(Ordering::SeqCst),
            set_metadata: c.set_metadata.load(Ordering::SeqCst),
            start_copy: c.start_copy.load(Ordering::SeqCst),
            copy_status: c.copy_status.load(Ordering::SeqCst),
            stage_part: c.stage_part.load(Ordering::SeqCst),
            commit_parts: c.commit_parts.load(Ordering::SeqCst),
        }
    }

    /// Highest number of downloads that were ever running at the same time.
    pub fn max_concurrent_downloads(&self) -> usize {
        self.max_downloads_in_flight.load(Ordering::SeqCst)
    }

    pub fn container_created(&self) -> bool {
        self.container_created.load(Ordering::SeqCst)
    }

    /// Reads an object body without counting a call.
    pub async fn peek(&self, key: &str) -> Option<Bytes> {
        self.objects.read().await.get(key).map(|o| o.data.clone())
    }

    /// Reads object metadata without counting a call.
    pub async fn peek_metadata(&self, key: &str) -> Option<Metadata> {
        self.objects.read().await.get(key).map(|o| o.metadata.clone())
    }

    /// Stores an object as if another writer had put it; not counted.
    pub async fn seed(&self, key: &str, data: impl Into<Bytes>) -> String {
        let data = data.into();
        let etag = etag_for(&data);
        let object = StoredObject {
            data,
            etag: etag.clone(),
            content_type: None,
            metadata: Metadata::new(),
        };
        self.objects.write().await.insert(key.to_string(), object);
        etag
    }

    /// Number of staged, uncommitted parts for `key`.
    pub async fn staged_parts(&self, key: &str) -> usize {
        self.staged.lock().await.get(key).map_or(0, |p| p.len())
    }
}

fn etag_for(data: &[u8]) -> String {
    format!("\"{:x}\"", md5::compute(data))
}

fn not_found(what: &str, key: &str) -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("{what} `{key}` does not exist"),
    ))
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ensure_container(&self) -> BackendResult<()> {
        self.counters.ensure_container.fetch_add(1, Ordering::SeqCst);
        self.container_created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn head_object(&self, key: &str) -> BackendResult<Option<ObjectProperties>> {
        self.counters.head.fetch_add(1, Ordering::SeqCst);
        Ok(self.objects.read().await.get(key).map(StoredObject::properties))
    }

    async fn get_object(&self, key: &str) -> BackendResult<Option<Download>> {
        self.counters.get.fetch_add(1, Ordering::SeqCst);
        let now = self.downloads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.downloads_in_flight);
        self.max_downloads_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.download_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.objects.read().await.get(key).map(|o| Download {
            data: o.data.clone(),
            etag: o.etag.clone(),
        }))
    }

    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
        metadata: &Metadata,
    ) -> BackendResult<String> {
        self.counters.put.fetch_add(1, Ordering::SeqCst);
        let etag = etag_for(&data);
        let object = StoredObject {
            data,
            etag: etag.clone(),
            content_type: content_type.map(str::to_string),
            metadata: metadata.clone(),
        };
        self.objects.write().await.insert(key.to_string(), object);
        Ok(etag)
    }

    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        self.counters.delete.fetch_add(1, Ordering::SeqCst);
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn set_metadata(
        &self,
        key: &str,
        metadata: &Metadata,
        content_type: Option<&str>,
    ) -> BackendResult<()> {
        self.counters.set_metadata.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.objects.write().await;
        let object = objects.get_mut(key).ok_or_else(|| not_found("object", key))?;
        object.metadata = metadata.clone();
        if let Some(content_type) = content_type {
            object.content_type = Some(content_type.to_string());
        }
        Ok(())
    }

    async fn start_copy(&self, source: &str, dest: &str) -> BackendResult<CopyStatus> {
        self.counters.start_copy.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.objects.write().await;
        let copied = objects
            .get(source)
            .cloned()
            .ok_or_else(|| not_found("copy source", source))?;
        objects.insert(dest.to_string(), copied);
        drop(objects);

        if self.pending_copy_polls == 0 {
            return Ok(CopyStatus::Success);
        }
        self.copies
            .lock()
            .await
            .insert(dest.to_string(), self.pending_copy_polls);
        Ok(CopyStatus::Pending)
    }

    async fn copy_status(&self, dest: &str) -> BackendResult<CopyStatus> {
        self.counters.copy_status.fetch_add(1, Ordering::SeqCst);
        {
            let mut copies = self.copies.lock().await;
            match copies.get_mut(dest) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    return Ok(CopyStatus::Pending);
                }
                Some(_) => {
                    copies.remove(dest);
                    return Ok(CopyStatus::Success);
                }
                None => {}
            }
        }
        if self.objects.read().await.contains_key(dest) {
            Ok(CopyStatus::Success)
        } else {
            Ok(CopyStatus::Failed)
        }
    }

    async fn stage_part(&self, key: &str, part: &PartId, data: Bytes) -> BackendResult<()> {
        self.counters.stage_part.fetch_add(1, Ordering::SeqCst);
        self.staged
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .insert(part.clone(), data);
        Ok(())
    }

    async fn commit_parts(
        &self,
        key: &str,
        parts: &[PartId],
        content_type: Option<&str>,
    ) -> BackendResult<String> {
        self.counters.commit_parts.fetch_add(1, Ordering::SeqCst);
        let mut staged = self.staged.lock().await;
        let available = staged
            .get(key)
            .ok_or_else(|| not_found("upload for", key))?;

        let mut body = BytesMut::new();
        let mut digests = Vec::with_capacity(parts.len() * 16);
        for part in parts {
            let data = available
                .get(part)
                .ok_or_else(|| not_found("part", &part.encoded()))?;
            digests.extend_from_slice(&md5::compute(data).0);
            body.extend_from_slice(data);
        }
        // Uncommitted parts are discarded with the commit.
        staged.remove(key);
        drop(staged);

        let etag = format!("\"{:x}-{}\"", md5::compute(&digests), parts.len());
        let mut objects = self.objects.write().await;
        let metadata = objects
            .get(key)
            .map(|o| o.metadata.clone())
            .unwrap_or_default();
        objects.insert(
            key.to_string(),
            StoredObject {
                data: body.freeze(),
                etag: etag.clone(),
                content_type: content_type.map(str::to_string),
                metadata,
            },
        );
        Ok(etag)
    }
}
