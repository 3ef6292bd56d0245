use std::io;
use std::time::Duration;

use thiserror::Error;

/// Error type returned by object backends; the source fault is kept intact.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, BlobError>;

#[derive(Error, Debug)]
pub enum BlobError {
    /// Any remote fault other than "not found". Never retried here.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    #[error("object {path} is locked by another writer")]
    LockConflict { path: String },

    #[error("invalid state for {path}: {reason}")]
    InvalidState { path: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("download of {path} timed out after {after:?}")]
    Timeout { path: String, after: Duration },

    #[error("text encoding error: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl BlobError {
    pub fn transport(err: impl Into<BoxError>) -> Self {
        Self::Transport(err.into())
    }

    pub(crate) fn invalid_state(path: &str, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, Self::LockConflict { .. })
    }

    /// Faults a caller may choose to retry under its own policy.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout { .. })
    }
}
