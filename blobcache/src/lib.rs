//! Client-side caching and consistency layer over a remote blob store.
//!
//! - `container`: connection and credential scope for one bucket
//! - `reference`: lazily resolved handle on one object, with the advisory lock
//! - `scope`: request-scoped memo of existence and attributes
//! - `client`: reads through the disk cache, lock-disciplined mutations
//! - `upload`: part-based uploads with deterministic part ids
//! - `backend`: remote transports (S3, in-memory)

pub mod audit;
pub mod backend;
pub mod client;
pub mod config;
pub mod container;
pub mod content_type;
pub mod disk_cache;
pub mod error;
pub mod gate;
pub mod reference;
pub mod scope;
pub mod text;
pub mod upload;

pub use audit::{AuditRecord, AuditSink, TracingAuditSink};
pub use backend::{
    CopyStatus, Metadata, MemoryBackend, ObjectBackend, ObjectProperties, S3Backend,
};
pub use client::{BlobContent, BlobStore, ObjectStoreClient};
pub use config::{AccountInfo, StoreConfig};
pub use container::{ContainerOptions, RemoteContainer};
pub use content_type::ContentType;
pub use error::{BlobError, Result};
pub use reference::ObjectRef;
pub use scope::{RequestScope, ScopeStore};
pub use text::TextEncoding;
pub use upload::{ChunkedUploader, PartId};
