//! Request-scoped metadata cache.
//!
//! A `RequestScope` lives for one unit of work (one request, one job). It
//! memoizes, per (container, path), whether the object exists and the
//! attributes it was resolved with, so repeated existence checks inside the
//! same unit of work do not go back to the remote store. Whether a fact is
//! cached at all (the mark) is tracked separately from its value: a cached
//! `false` still skips the round trip.
//!
//! The entries are stored in a [`ScopeStore`]; by default a bounded
//! `moka::sync::Cache` whose entries expire after the configured TTL.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

use crate::backend::ObjectProperties;
use crate::config::StoreConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeAction {
    Exists,
    Object,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub container: String,
    pub path: String,
    pub action: ScopeAction,
}

impl ScopeKey {
    pub fn new(container: &str, path: &str, action: ScopeAction) -> Self {
        Self {
            container: container.to_string(),
            path: path.to_string(),
            action,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ScopeValue {
    Exists(bool),
    Object(ObjectProperties),
}

/// Key/value store backing a scope; supplied by the host or defaulted.
pub trait ScopeStore: Send + Sync {
    fn get(&self, key: &ScopeKey) -> Option<ScopeValue>;
    fn insert(&self, key: ScopeKey, value: ScopeValue);
    fn remove(&self, key: &ScopeKey);
    fn clear(&self);
}

pub struct MokaScopeStore {
    cache: moka::sync::Cache<ScopeKey, ScopeValue>,
}

impl MokaScopeStore {
    pub fn new(config: &StoreConfig) -> Self {
        let cache = moka::sync::Cache::builder()
            .max_capacity(config.metadata_cache_capacity)
            .time_to_live(config.metadata_cache_ttl())
            .build();
        Self { cache }
    }
}

impl ScopeStore for MokaScopeStore {
    fn get(&self, key: &ScopeKey) -> Option<ScopeValue> {
        self.cache.get(key)
    }

    fn insert(&self, key: ScopeKey, value: ScopeValue) {
        self.cache.insert(key, value);
    }

    fn remove(&self, key: &ScopeKey) {
        self.cache.invalidate(key);
    }

    fn clear(&self) {
        self.cache.invalidate_all();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeStats {
    pub hits: u64,
    pub misses: u64,
}

pub struct RequestScope {
    id: Uuid,
    store: Arc<dyn ScopeStore>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RequestScope {
    /// Starts a unit of work backed by the default moka store.
    pub fn begin(config: &StoreConfig) -> Arc<Self> {
        Self::with_store(Arc::new(MokaScopeStore::new(config)))
    }

    pub fn with_store(store: Arc<dyn ScopeStore>) -> Arc<Self> {
        let scope = Arc::new(Self {
            id: Uuid::new_v4(),
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        });
        tracing::debug!(scope = %scope.id, "request scope started");
        scope
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The cached existence fact, if one is marked. `None` means "unknown".
    pub fn exists_mark(&self, container: &str, path: &str) -> Option<bool> {
        let key = ScopeKey::new(container, path, ScopeAction::Exists);
        match self.store.get(&key) {
            Some(ScopeValue::Exists(exists)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(exists)
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn mark_exists(&self, container: &str, path: &str, exists: bool) {
        self.store.insert(
            ScopeKey::new(container, path, ScopeAction::Exists),
            ScopeValue::Exists(exists),
        );
    }

    pub fn object(&self, container: &str, path: &str) -> Option<ObjectProperties> {
        let key = ScopeKey::new(container, path, ScopeAction::Object);
        match self.store.get(&key) {
            Some(ScopeValue::Object(props)) => Some(props),
            _ => None,
        }
    }

    pub fn put_object(&self, container: &str, path: &str, props: ObjectProperties) {
        self.store.insert(
            ScopeKey::new(container, path, ScopeAction::Object),
            ScopeValue::Object(props),
        );
    }

    /// Clears both the existence mark and the resolved attributes.
    pub fn remove(&self, container: &str, path: &str) {
        self.store
            .remove(&ScopeKey::new(container, path, ScopeAction::Exists));
        self.store
            .remove(&ScopeKey::new(container, path, ScopeAction::Object));
        tracing::debug!(scope = %self.id, container, path, "scope entry invalidated");
    }

    /// Ends the unit of work; every memoized fact is dropped.
    pub fn end(&self) {
        self.store.clear();
        tracing::debug!(scope = %self.id, stats = ?self.stats(), "request scope ended");
    }

    pub fn stats(&self) -> ScopeStats {
        ScopeStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
