//! Audit trail of operations performed against remote objects.
//!
//! A sink failure is logged and dropped; it never fails the operation
//! that produced the record.

use serde::Serialize;

use crate::error::BoxError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub path: String,
    pub operation: String,
    pub backend: String,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<(), BoxError>;
}

/// Default sink: one `info` event per record on the `blobcache::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<(), BoxError> {
        tracing::info!(
            target: "blobcache::audit",
            path = %record.path,
            operation = %record.operation,
            backend = %record.backend,
            "audit"
        );
        Ok(())
    }
}

pub(crate) fn emit(sink: &dyn AuditSink, path: &str, operation: &str, backend: &str) {
    let record = AuditRecord {
        path: path.to_string(),
        operation: operation.to_string(),
        backend: backend.to_string(),
    };
    if let Err(e) = sink.record(&record) {
        tracing::warn!(path, operation, "audit sink rejected record: {e}");
    }
}
