//! Object operations over a remote container with a local disk cache.
//!
//! Reads go through a per-object-name gate and are served from the disk
//! cache while its recorded ETag matches the remote one. Every mutation
//! follows the same sequence:
//! 1. fail with `LockConflict` if the object carries the advisory lock
//! 2. take the lock
//! 3. derive the content type from the object name
//! 4. perform the remote write
//! 5. release the lock
//! 6. drop the object's request-scope entries
//!
//! Nothing here retries. Remote faults reach the caller unchanged.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::backend::CopyStatus;
use crate::config::StoreConfig;
use crate::content_type::ContentType;
use crate::disk_cache::DiskCache;
use crate::error::{BlobError, Result};
use crate::gate::NameGate;
use crate::reference::ObjectRef;
use crate::text::TextEncoding;
use crate::upload::ChunkedUploader;

/// Content of an object, backed by its local cache file.
#[derive(Debug)]
pub struct BlobContent {
    pub file: File,
    pub etag: String,
    /// `true` when the cached copy was still current and nothing was downloaded.
    pub from_cache: bool,
}

impl BlobContent {
    pub async fn into_bytes(mut self) -> Result<Bytes> {
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// Operations a host performs on remote objects.
///
/// `ObjectStoreClient` is the stock implementation; hosts that need to
/// intercept a single operation can wrap it and override that method.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, r: &mut ObjectRef) -> Result<bool>;

    async fn get_content(&self, r: &mut ObjectRef) -> Result<BlobContent>;

    /// Like `get_content`, bounding the download by the configured timeout.
    async fn get_content_with_timeout(&self, r: &mut ObjectRef) -> Result<BlobContent>;

    async fn put_file(&self, r: &mut ObjectRef, path: &Path) -> Result<String>;

    async fn put_bytes(&self, r: &mut ObjectRef, data: Bytes) -> Result<String>;

    async fn put_stream(
        &self,
        r: &mut ObjectRef,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<String>;

    async fn put_text_encoded(
        &self,
        r: &mut ObjectRef,
        text: &str,
        encoding: TextEncoding,
    ) -> Result<String>;

    /// Read-modify-write of the whole body; not atomic against writers
    /// that ignore the advisory lock.
    async fn append_text(
        &self,
        r: &mut ObjectRef,
        text: &str,
        encoding: TextEncoding,
    ) -> Result<String>;

    async fn delete(&self, r: &mut ObjectRef) -> Result<()>;

    /// Server-side copy inside one container. With `wait` the call returns
    /// once the copy is no longer pending.
    async fn copy(
        &self,
        source: &mut ObjectRef,
        dest: &mut ObjectRef,
        wait: bool,
    ) -> Result<CopyStatus>;

    async fn wait_for_copy(&self, dest: &mut ObjectRef) -> Result<()>;

    /// Materializes a zero-byte marker object.
    async fn create_empty(&self, r: &mut ObjectRef) -> Result<String>;

    async fn put_text(&self, r: &mut ObjectRef, text: &str) -> Result<String> {
        self.put_text_encoded(r, text, TextEncoding::Utf8).await
    }

    async fn get_bytes(&self, r: &mut ObjectRef) -> Result<Bytes> {
        self.get_content(r).await?.into_bytes().await
    }

    async fn get_text(&self, r: &mut ObjectRef, encoding: TextEncoding) -> Result<String> {
        let bytes = self.get_bytes(r).await?;
        encoding.decode(&bytes)
    }
}

pub struct ObjectStoreClient {
    config: StoreConfig,
    disk: DiskCache,
    gate: NameGate,
    uploader: ChunkedUploader,
}

impl ObjectStoreClient {
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let uploader = ChunkedUploader::new(&config)?;
        Ok(Self {
            disk: DiskCache::new(&config),
            gate: NameGate::new(),
            uploader,
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn disk_cache(&self) -> &DiskCache {
        &self.disk
    }

    pub fn gate(&self) -> &NameGate {
        &self.gate
    }

    pub fn uploader(&self) -> &ChunkedUploader {
        &self.uploader
    }

    fn gate_key(r: &ObjectRef) -> String {
        format!("{}/{}", r.container().name(), r.name())
    }

    async fn read_through(
        &self,
        r: &mut ObjectRef,
        timeout: Option<Duration>,
    ) -> Result<BlobContent> {
        let paths = self.disk.paths_for(r.container().name(), r.name());
        let _guard = self.gate.acquire(&Self::gate_key(r)).await;

        if let Some(local) = self.disk.cached_etag(&paths).await? {
            let remote = r.etag().await?;
            if local == remote {
                tracing::debug!(path = r.name(), etag = %local, "disk cache hit");
                return Ok(BlobContent {
                    file: self.disk.open(&paths).await?,
                    etag: local,
                    from_cache: true,
                });
            }
            tracing::debug!(path = r.name(), %local, %remote, "disk cache stale");
        }

        let backend = r.container().backend();
        let download = backend.get_object(r.name());
        let download = match timeout {
            Some(after) => tokio::time::timeout(after, download)
                .await
                .map_err(|_| BlobError::Timeout {
                    path: r.name().to_string(),
                    after,
                })?,
            None => download.await,
        }
        .map_err(BlobError::Transport)?;

        let Some(download) = download else {
            r.scope()
                .mark_exists(r.container().name(), r.name(), false);
            return Err(BlobError::invalid_state(
                r.name(),
                "content requested for an object that does not exist",
            ));
        };
        tracing::debug!(path = r.name(), etag = %download.etag, len = download.data.len(), "downloaded");

        self.disk.write_temp(&paths, &download.data).await?;
        let file = self.disk.store_from_temp(&paths, &download.etag).await?;
        Ok(BlobContent {
            file,
            etag: download.etag,
            from_cache: false,
        })
    }

    async fn begin_mutation(&self, r: &mut ObjectRef) -> Result<()> {
        if r.is_locked().await {
            return Err(BlobError::LockConflict {
                path: r.name().to_string(),
            });
        }
        r.lock().await
    }

    async fn finish_mutation<T: Send>(
        &self,
        r: &mut ObjectRef,
        outcome: Result<T>,
        operation: &str,
    ) -> Result<T> {
        match outcome {
            Ok(value) => {
                let unlocked = r.unlock().await;
                r.invalidate();
                unlocked?;
                tracing::info!(
                    container = r.container().name(),
                    path = r.name(),
                    operation,
                    "object mutated"
                );
                r.audit(operation);
                Ok(value)
            }
            Err(e) => {
                if let Err(unlock) = r.unlock().await {
                    tracing::warn!(path = r.name(), operation, "unlock after failure: {unlock}");
                }
                r.invalidate();
                Err(e)
            }
        }
    }

    async fn write_body(&self, r: &mut ObjectRef, data: Bytes, operation: &str) -> Result<String> {
        self.begin_mutation(r).await?;
        let content_type = ContentType::from_path(r.name());
        let metadata = r.metadata_snapshot();
        let outcome = r
            .container()
            .backend()
            .put_object(r.name(), data, Some(content_type.as_str()), &metadata)
            .await
            .map_err(BlobError::Transport);
        if outcome.is_ok() {
            r.clear_staged();
        }
        self.finish_mutation(r, outcome, operation).await
    }

    async fn poll_copy(&self, dest: &ObjectRef) -> Result<()> {
        let interval = self.config.copy_poll_interval();
        loop {
            let status = dest
                .container()
                .backend()
                .copy_status(dest.name())
                .await
                .map_err(BlobError::Transport)?;
            match status {
                CopyStatus::Pending => tokio::time::sleep(interval).await,
                CopyStatus::Success => return Ok(()),
                CopyStatus::Failed | CopyStatus::Aborted => {
                    return Err(BlobError::transport(format!(
                        "copy to `{}` ended as {status:?}",
                        dest.name()
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for ObjectStoreClient {
    async fn exists(&self, r: &mut ObjectRef) -> Result<bool> {
        r.fetch_attributes().await
    }

    async fn get_content(&self, r: &mut ObjectRef) -> Result<BlobContent> {
        self.read_through(r, None).await
    }

    async fn get_content_with_timeout(&self, r: &mut ObjectRef) -> Result<BlobContent> {
        self.read_through(r, self.config.download_timeout()).await
    }

    async fn put_file(&self, r: &mut ObjectRef, path: &Path) -> Result<String> {
        let data = tokio::fs::read(path).await?;
        self.write_body(r, Bytes::from(data), "PutFile").await
    }

    async fn put_bytes(&self, r: &mut ObjectRef, data: Bytes) -> Result<String> {
        self.write_body(r, data, "PutBytes").await
    }

    async fn put_stream(
        &self,
        r: &mut ObjectRef,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<String> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        self.write_body(r, Bytes::from(data), "PutStream").await
    }

    async fn put_text_encoded(
        &self,
        r: &mut ObjectRef,
        text: &str,
        encoding: TextEncoding,
    ) -> Result<String> {
        let data = encoding.encode(text)?;
        self.write_body(r, Bytes::from(data), "PutText").await
    }

    async fn append_text(
        &self,
        r: &mut ObjectRef,
        text: &str,
        encoding: TextEncoding,
    ) -> Result<String> {
        if !r.fetch_attributes().await? {
            return self.put_text_encoded(r, text, encoding).await;
        }
        if r.is_locked().await {
            return Err(BlobError::LockConflict {
                path: r.name().to_string(),
            });
        }
        let mut combined = self.get_text(r, encoding).await?;
        combined.push_str(text);
        let data = encoding.encode(&combined)?;
        self.write_body(r, Bytes::from(data), "AppendText").await
    }

    async fn delete(&self, r: &mut ObjectRef) -> Result<()> {
        self.begin_mutation(r).await?;
        let outcome = r
            .container()
            .backend()
            .delete_object(r.name())
            .await
            .map_err(BlobError::Transport);
        self.finish_mutation(r, outcome, "Delete").await?;

        let paths = self.disk.paths_for(r.container().name(), r.name());
        let _guard = self.gate.acquire(&Self::gate_key(r)).await;
        self.disk.evict(&paths).await;
        Ok(())
    }

    async fn copy(
        &self,
        source: &mut ObjectRef,
        dest: &mut ObjectRef,
        wait: bool,
    ) -> Result<CopyStatus> {
        if source.container().name() != dest.container().name() {
            return Err(BlobError::Argument(format!(
                "copy from `{}` to `{}` crosses containers",
                source.container().name(),
                dest.container().name()
            )));
        }
        if !source.fetch_attributes().await? {
            return Err(BlobError::invalid_state(
                source.name(),
                "copy source does not exist",
            ));
        }
        if source.is_locked().await {
            return Err(BlobError::LockConflict {
                path: source.name().to_string(),
            });
        }

        self.begin_mutation(dest).await?;
        let mut outcome = dest
            .container()
            .backend()
            .start_copy(source.name(), dest.name())
            .await
            .map_err(BlobError::Transport);
        if wait && matches!(outcome, Ok(CopyStatus::Pending)) {
            outcome = self.poll_copy(dest).await.map(|()| CopyStatus::Success);
        }
        self.finish_mutation(dest, outcome, "Copy").await
    }

    async fn wait_for_copy(&self, dest: &mut ObjectRef) -> Result<()> {
        let outcome = self.poll_copy(dest).await;
        dest.invalidate();
        outcome
    }

    async fn create_empty(&self, r: &mut ObjectRef) -> Result<String> {
        self.write_body(r, Bytes::new(), "CreateEmpty").await
    }
}
