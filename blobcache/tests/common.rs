use std::sync::Arc;
use std::time::Duration;

use blobcache::{
    ContainerOptions, MemoryBackend, ObjectRef, ObjectStoreClient, RemoteContainer, RequestScope,
    StoreConfig,
};
use tempfile::TempDir;

#[allow(dead_code)]
pub struct Harness {
    pub dir: TempDir,
    pub config: StoreConfig,
    pub backend: Arc<MemoryBackend>,
    pub container: Arc<RemoteContainer>,
    pub scope: Arc<RequestScope>,
    pub client: Arc<ObjectStoreClient>,
}

#[allow(dead_code)]
impl Harness {
    pub async fn new() -> Self {
        Self::with_backend(MemoryBackend::new()).await
    }

    pub async fn with_backend(backend: MemoryBackend) -> Self {
        Self::build(backend, |_| {}).await
    }

    pub async fn build(backend: MemoryBackend, tweak: impl FnOnce(&mut StoreConfig)) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let mut config = StoreConfig::with_root(dir.path());
        config.copy_poll_interval_ms = 5;
        tweak(&mut config);

        let backend = Arc::new(backend);
        let container =
            RemoteContainer::with_backend("site", backend.clone(), ContainerOptions::default())
                .await
                .unwrap();
        Self {
            scope: RequestScope::begin(&config),
            client: Arc::new(ObjectStoreClient::new(config.clone()).unwrap()),
            dir,
            config,
            backend,
            container,
        }
    }

    pub fn object(&self, path: &str) -> ObjectRef {
        ObjectRef::new(self.container.clone(), path, self.scope.clone()).unwrap()
    }

    /// A reference in a fresh unit of work, sharing nothing with `self.scope`.
    pub fn object_in_new_scope(&self, path: &str) -> ObjectRef {
        ObjectRef::new(
            self.container.clone(),
            path,
            RequestScope::begin(&self.config),
        )
        .unwrap()
    }
}

#[allow(dead_code)]
pub fn slow_backend(delay_ms: u64) -> MemoryBackend {
    MemoryBackend::new().with_download_delay(Duration::from_millis(delay_ms))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
