//! Account credentials and tuning knobs for the cache layer.
//!
//! `AccountInfo` is the credential scope a container is opened with;
//! `StoreConfig` controls where local copies live and how the client talks
//! to the remote store (part size, download timeout, copy polling).

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BlobError, Result};

pub const DEFAULT_MAX_PART_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 80 * 1024;
const DEFAULT_REGION: &str = "us-east-1";

#[derive(Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account: String,
    pub key: String,
    /// Custom endpoint for S3-compatible stores (minio, rustfs, ...).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_case_sensitive")]
    pub case_sensitive: bool,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

fn default_case_sensitive() -> bool {
    true
}

impl fmt::Debug for AccountInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountInfo")
            .field("account", &self.account)
            .field("key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("case_sensitive", &self.case_sensitive)
            .finish()
    }
}

impl AccountInfo {
    pub fn new(account: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            key: key.into(),
            endpoint: None,
            region: default_region(),
            case_sensitive: true,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    /// Reads `BLOBCACHE_ACCOUNT`, `BLOBCACHE_KEY`, `BLOBCACHE_ENDPOINT`,
    /// `BLOBCACHE_REGION` and `BLOBCACHE_CASE_SENSITIVE`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let account = lookup("BLOBCACHE_ACCOUNT").unwrap_or_else(|| {
            tracing::warn!("BLOBCACHE_ACCOUNT is not set");
            String::new()
        });
        let key = lookup("BLOBCACHE_KEY").unwrap_or_else(|| {
            tracing::warn!("BLOBCACHE_KEY is not set");
            String::new()
        });
        let region = lookup("BLOBCACHE_REGION").unwrap_or_else(|| {
            tracing::warn!("BLOBCACHE_REGION is not set. Use default value: `{DEFAULT_REGION}`");
            default_region()
        });
        let case_sensitive = lookup("BLOBCACHE_CASE_SENSITIVE")
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no"))
            .unwrap_or(true);

        Self {
            account,
            key,
            endpoint: lookup("BLOBCACHE_ENDPOINT"),
            region,
            case_sensitive,
        }
    }

    /// Credentials are usable only when both halves are present.
    pub fn validate(&self) -> Result<()> {
        if self.account.trim().is_empty() {
            return Err(BlobError::Configuration("account name is empty".into()));
        }
        if self.key.trim().is_empty() {
            return Err(BlobError::Configuration(format!(
                "access key for account `{}` is empty",
                self.account
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root of the persisted local copies and their ETag sidecars.
    pub cache_root: PathBuf,
    /// Root of in-flight downloads.
    pub temp_root: PathBuf,
    pub metadata_cache_ttl_secs: u64,
    pub metadata_cache_capacity: u64,
    pub max_part_size: usize,
    pub download_timeout_secs: Option<u64>,
    pub copy_poll_interval_ms: u64,
    pub copy_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let cache_root = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("blobcache");
        Self {
            cache_root,
            temp_root: std::env::temp_dir().join("blobcache"),
            metadata_cache_ttl_secs: 60,
            metadata_cache_capacity: 10_000,
            max_part_size: DEFAULT_MAX_PART_SIZE,
            download_timeout_secs: None,
            copy_poll_interval_ms: 1_000,
            copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
        }
    }
}

impl StoreConfig {
    /// Config rooted under a single directory, handy for tests and tools.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            cache_root: root.join("cache"),
            temp_root: root.join("tmp"),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: StoreConfig = serde_json::from_str(&raw).map_err(|e| {
            BlobError::Configuration(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_part_size < 1 {
            return Err(BlobError::Configuration(
                "max_part_size must be at least 1 byte".into(),
            ));
        }
        if self.copy_buffer_size < 1 {
            return Err(BlobError::Configuration(
                "copy_buffer_size must be at least 1 byte".into(),
            ));
        }
        if self.metadata_cache_capacity == 0 {
            return Err(BlobError::Configuration(
                "metadata_cache_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn metadata_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_cache_ttl_secs)
    }

    pub fn download_timeout(&self) -> Option<Duration> {
        self.download_timeout_secs.map(Duration::from_secs)
    }

    pub fn copy_poll_interval(&self) -> Duration {
        Duration::from_millis(self.copy_poll_interval_ms)
    }
}
