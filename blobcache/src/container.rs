//! Connection and credential scope for one logical bucket.

use std::fmt;
use std::sync::Arc;

use crate::audit::{AuditSink, TracingAuditSink};
use crate::backend::{ObjectBackend, S3Backend};
use crate::config::AccountInfo;
use crate::error::{BlobError, Result};

const DEFAULT_ENDPOINT: &str = "https://s3.amazonaws.com";

#[derive(Debug, Clone)]
pub struct ContainerOptions {
    /// Skip the remote existence/creation check; for hot paths that know
    /// the container is already there.
    pub reference_only: bool,
    pub is_public: bool,
    pub case_sensitive: bool,
    /// Base used to recognise absolute object URIs.
    pub endpoint: String,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            reference_only: false,
            is_public: false,
            case_sensitive: true,
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }
}

pub struct RemoteContainer {
    name: String,
    backend: Arc<dyn ObjectBackend>,
    audit: Arc<dyn AuditSink>,
    endpoint: String,
    is_public: bool,
    case_sensitive: bool,
}

impl fmt::Debug for RemoteContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteContainer")
            .field("name", &self.name)
            .field("backend", &self.backend.name())
            .field("endpoint", &self.endpoint)
            .field("is_public", &self.is_public)
            .field("case_sensitive", &self.case_sensitive)
            .finish()
    }
}

impl RemoteContainer {
    /// Opens `name` on the S3-compatible store described by `account`.
    pub async fn connect(
        account: &AccountInfo,
        name: &str,
        reference_only: bool,
        is_public: bool,
    ) -> Result<Arc<Self>> {
        validate_container_name(name)?;
        let backend = S3Backend::new(name, account)?;
        let options = ContainerOptions {
            reference_only,
            is_public,
            case_sensitive: account.case_sensitive,
            endpoint: account
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        };
        Self::with_backend(name, Arc::new(backend), options).await
    }

    pub async fn with_backend(
        name: &str,
        backend: Arc<dyn ObjectBackend>,
        options: ContainerOptions,
    ) -> Result<Arc<Self>> {
        validate_container_name(name)?;
        if !options.reference_only {
            backend
                .ensure_container()
                .await
                .map_err(BlobError::Transport)?;
        }
        tracing::debug!(
            container = name,
            backend = backend.name(),
            reference_only = options.reference_only,
            "container opened"
        );
        Ok(Arc::new(Self {
            name: name.to_string(),
            backend,
            audit: Arc::new(TracingAuditSink),
            endpoint: options.endpoint.trim_end_matches('/').to_string(),
            is_public: options.is_public,
            case_sensitive: options.case_sensitive,
        }))
    }

    /// Replaces the audit sink; call before sharing the container.
    pub fn with_audit(mut self: Arc<Self>, audit: Arc<dyn AuditSink>) -> Arc<Self> {
        match Arc::get_mut(&mut self) {
            Some(inner) => {
                inner.audit = audit;
                self
            }
            None => Arc::new(Self {
                name: self.name.clone(),
                backend: self.backend.clone(),
                audit,
                endpoint: self.endpoint.clone(),
                is_public: self.is_public,
                case_sensitive: self.case_sensitive,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Callers use this for ACL decisions; the layer itself does not.
    pub fn is_public(&self) -> bool {
        self.is_public
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// `<endpoint>/<container>/`, the prefix of every absolute object URI.
    pub fn base_uri(&self) -> String {
        format!("{}/{}/", self.endpoint, self.name)
    }

    /// Maps an application path onto a container-relative object name.
    pub fn normalize(&self, path: &str) -> Result<String> {
        let unified = path.trim().replace('\\', "/");
        let mut segments = Vec::new();
        for segment in unified.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    return Err(BlobError::Argument(format!(
                        "path `{path}` escapes the container"
                    )));
                }
                s => segments.push(s),
            }
        }
        if segments.is_empty() {
            return Err(BlobError::Argument(format!(
                "path `{path}` does not name an object"
            )));
        }
        let name = segments.join("/");
        Ok(if self.case_sensitive {
            name
        } else {
            name.to_lowercase()
        })
    }
}

/// S3 bucket naming: 3-63 chars of lowercase letters, digits, '-' and '.'.
fn validate_container_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    let valid_edges = name
        .chars()
        .next()
        .zip(name.chars().last())
        .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());
    if (3..=63).contains(&name.len()) && valid_chars && valid_edges {
        Ok(())
    } else {
        Err(BlobError::Argument(format!("invalid container name `{name}`")))
    }
}
