//! Local copy of downloaded objects, validated by an ETag sidecar file.
//!
//! Layout, with `h` the hex SHA-256 of the object name:
//! - content: `<cache_root>/<container>/<h[..2]>/<h[2..]>`
//! - sidecar: the content path with `.etag` appended
//! - staging: the content path with `.partial` appended
//! - temp:    `<temp_root>/<container>/<h>.download`
//!
//! Writes for one object must happen under that object's gate.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::StoreConfig;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    pub content: PathBuf,
    pub sidecar: PathBuf,
    /// Built next to `content` and renamed over it once complete.
    pub staging: PathBuf,
    pub temp: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DiskCache {
    cache_root: PathBuf,
    temp_root: PathBuf,
    buffer_size: usize,
}

impl DiskCache {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            cache_root: config.cache_root.clone(),
            temp_root: config.temp_root.clone(),
            buffer_size: config.copy_buffer_size.max(1),
        }
    }

    pub fn paths_for(&self, container: &str, name: &str) -> CachePaths {
        let hash = hex::encode(Sha256::digest(name.as_bytes()));
        let (prefix, rest) = hash.split_at(2);
        let content = self.cache_root.join(container).join(prefix).join(rest);
        let with_suffix = |suffix: &str| {
            let mut path = content.clone().into_os_string();
            path.push(suffix);
            PathBuf::from(path)
        };
        CachePaths {
            sidecar: with_suffix(".etag"),
            staging: with_suffix(".partial"),
            temp: self
                .temp_root
                .join(container)
                .join(format!("{hash}.download")),
            content,
        }
    }

    /// ETag recorded for the cached copy; `None` when either file is missing.
    pub async fn cached_etag(&self, paths: &CachePaths) -> Result<Option<String>> {
        if !fs::try_exists(&paths.content).await? {
            return Ok(None);
        }
        match fs::read_to_string(&paths.sidecar).await {
            Ok(etag) => Ok(Some(etag)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn open(&self, paths: &CachePaths) -> Result<File> {
        Ok(File::open(&paths.content).await?)
    }

    pub async fn write_temp(&self, paths: &CachePaths, data: &[u8]) -> Result<()> {
        ensure_parent(&paths.temp).await?;
        let mut file = File::create(&paths.temp).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Copies the temp download into the staging file in `buffer_size`
    /// chunks, renames it over the cached copy and records `etag`.
    ///
    /// The cached file is replaced, never rewritten in place: handles opened
    /// on the previous copy keep reading the previous body.
    pub async fn store_from_temp(&self, paths: &CachePaths, etag: &str) -> Result<File> {
        ensure_parent(&paths.content).await?;
        // A stale sidecar must never describe a half-written file.
        remove_if_present(&paths.sidecar).await?;

        let mut source = File::open(&paths.temp).await?;
        let mut staging = File::create(&paths.staging).await?;
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            staging.write_all(&buf[..n]).await?;
        }
        staging.flush().await?;
        staging.sync_all().await?;
        drop(staging);
        drop(source);

        fs::rename(&paths.staging, &paths.content).await?;
        let file = File::open(&paths.content).await?;
        fs::write(&paths.sidecar, etag.as_bytes()).await?;
        remove_if_present(&paths.temp).await?;
        Ok(file)
    }

    /// Removes every local file for the object. Failures are logged only.
    pub async fn evict(&self, paths: &CachePaths) {
        for path in [&paths.content, &paths.sidecar, &paths.staging, &paths.temp] {
            if let Err(e) = remove_if_present(path).await {
                tracing::warn!(path = %path.display(), "failed to remove cached file: {e}");
            }
        }
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }
    Ok(())
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(root: &Path) -> DiskCache {
        let mut config = StoreConfig::with_root(root);
        config.copy_buffer_size = 3;
        DiskCache::new(&config)
    }

    #[test]
    fn test_paths_are_hashed_and_fanned_out() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let paths = cache.paths_for("site", "images/logo.png");
        let hash = hex::encode(Sha256::digest(b"images/logo.png"));

        let expected = dir
            .path()
            .join("cache/site")
            .join(&hash[..2])
            .join(&hash[2..]);
        assert_eq!(paths.content, expected);
        assert!(paths.sidecar.to_string_lossy().ends_with(".etag"));
        assert!(paths.staging.to_string_lossy().ends_with(".partial"));
        assert_eq!(
            paths.temp,
            dir.path().join("tmp/site").join(format!("{hash}.download"))
        );
        assert_ne!(paths, cache.paths_for("other", "images/logo.png"));
    }

    #[tokio::test]
    async fn test_store_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let paths = cache.paths_for("site", "a.txt");
        assert_eq!(cache.cached_etag(&paths).await.unwrap(), None);

        cache.write_temp(&paths, b"hello world").await.unwrap();
        let mut file = cache.store_from_temp(&paths, "\"e1\"").await.unwrap();
        let mut body = String::new();
        file.read_to_string(&mut body).await.unwrap();

        assert_eq!(body, "hello world");
        assert_eq!(
            cache.cached_etag(&paths).await.unwrap().as_deref(),
            Some("\"e1\"")
        );
        assert!(!paths.temp.exists());
    }

    #[tokio::test]
    async fn test_shorter_body_truncates_old_copy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let paths = cache.paths_for("site", "a.txt");
        cache.write_temp(&paths, b"long old body").await.unwrap();
        cache.store_from_temp(&paths, "\"1\"").await.unwrap();

        cache.write_temp(&paths, b"new").await.unwrap();
        cache.store_from_temp(&paths, "\"2\"").await.unwrap();
        assert_eq!(std::fs::read(&paths.content).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_open_handle_keeps_previous_body() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let paths = cache.paths_for("site", "a.txt");
        cache.write_temp(&paths, b"first version").await.unwrap();
        let mut old = cache.store_from_temp(&paths, "\"1\"").await.unwrap();

        cache.write_temp(&paths, b"v2").await.unwrap();
        let mut new = cache.store_from_temp(&paths, "\"2\"").await.unwrap();

        let mut body = String::new();
        old.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "first version");
        body.clear();
        new.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "v2");
        assert!(!paths.staging.exists());
    }

    #[tokio::test]
    async fn test_evict_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let paths = cache.paths_for("site", "a.txt");
        cache.evict(&paths).await;

        cache.write_temp(&paths, b"x").await.unwrap();
        cache.store_from_temp(&paths, "\"1\"").await.unwrap();
        cache.evict(&paths).await;
        assert!(!paths.content.exists());
        assert!(!paths.sidecar.exists());
        assert_eq!(cache.cached_etag(&paths).await.unwrap(), None);
    }
}
