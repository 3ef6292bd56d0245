//! Remote object store adapters.
//!
//! Submodules:
//! - `memory`: in-process store with call counters, used by tests and local development
//! - `s3`: S3-compatible adapter built on `aws-sdk-s3`
//!
//! One backend instance is bound to one container (bucket). Not-found on
//! attribute fetch and download is reported as `Ok(None)`; every other fault
//! is returned untouched as a `BoxError` and is never retried here.

pub mod memory;
pub mod s3;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BoxError;
use crate::upload::PartId;

pub use memory::{CallStats, MemoryBackend};
pub use s3::S3Backend;

pub type BackendResult<T> = std::result::Result<T, BoxError>;

/// User-defined key/value metadata stored alongside an object.
pub type Metadata = HashMap<String, String>;

/// Attributes returned by a remote attribute fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectProperties {
    pub etag: String,
    pub length: u64,
    pub content_type: Option<String>,
    pub metadata: Metadata,
}

/// Body of a download together with the ETag the store served it under.
#[derive(Debug, Clone)]
pub struct Download {
    pub data: Bytes,
    pub etag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyStatus {
    Pending,
    Success,
    Failed,
    Aborted,
}

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Short backend name recorded in audit entries.
    fn name(&self) -> &'static str;

    /// Creates the container if it does not exist yet.
    async fn ensure_container(&self) -> BackendResult<()>;

    async fn head_object(&self, key: &str) -> BackendResult<Option<ObjectProperties>>;

    async fn get_object(&self, key: &str) -> BackendResult<Option<Download>>;

    /// Replaces the object body and metadata, returning the new ETag.
    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
        metadata: &Metadata,
    ) -> BackendResult<String>;

    async fn delete_object(&self, key: &str) -> BackendResult<()>;

    /// Replaces the whole metadata map of an existing object.
    async fn set_metadata(
        &self,
        key: &str,
        metadata: &Metadata,
        content_type: Option<&str>,
    ) -> BackendResult<()>;

    /// Starts a server-side copy inside this container.
    async fn start_copy(&self, source: &str, dest: &str) -> BackendResult<CopyStatus>;

    async fn copy_status(&self, dest: &str) -> BackendResult<CopyStatus>;

    async fn stage_part(&self, key: &str, part: &PartId, data: Bytes) -> BackendResult<()>;

    /// Commits staged parts, in the given order, as the object body.
    async fn commit_parts(
        &self,
        key: &str,
        parts: &[PartId],
        content_type: Option<&str>,
    ) -> BackendResult<String>;

    /// Drops adapter-local bookkeeping for an abandoned upload session.
    /// Staged parts are left for the store to expire.
    async fn forget_session(&self, _key: &str, _session: Uuid) -> BackendResult<()> {
        Ok(())
    }
}

/// Case-insensitive metadata lookup; S3 lower-cases user metadata keys.
pub fn metadata_get<'a>(metadata: &'a Metadata, key: &str) -> Option<&'a str> {
    metadata
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Sets (`Some`) or removes (`None`) a metadata key, dropping any case variants.
pub fn metadata_set(metadata: &mut Metadata, key: &str, value: Option<&str>) {
    metadata.retain(|k, _| !k.eq_ignore_ascii_case(key));
    if let Some(value) = value {
        metadata.insert(key.to_string(), value.to_string());
    }
}
