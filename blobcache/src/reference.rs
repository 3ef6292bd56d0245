//! Handle on one logical remote object.
//!
//! An `ObjectRef` is cheap to build and meant to be dropped after the call
//! that needed it. It resolves the object's remote attributes lazily and
//! shares what it learned with every other reference in the same
//! [`RequestScope`], so a second reference to the same path does not repeat
//! the round trip.
//!
//! The advisory lock is the `Lock` metadata key. It is honoured only by
//! callers going through this layer and has no lease: two writers can both
//! observe "unlocked" before either sets it.

use std::sync::Arc;

use crate::audit;
use crate::backend::{Metadata, ObjectProperties, metadata_get, metadata_set};
use crate::container::RemoteContainer;
use crate::error::{BlobError, Result};
use crate::scope::RequestScope;

pub const LOCK_KEY: &str = "Lock";
const LOCK_VALUE: &str = "True";

pub struct ObjectRef {
    container: Arc<RemoteContainer>,
    scope: Arc<RequestScope>,
    name: String,
    handle: Option<ObjectProperties>,
    /// Metadata changes waiting for the next write; `None` removes the key.
    staged: Vec<(String, Option<String>)>,
}

impl ObjectRef {
    pub fn new(
        container: Arc<RemoteContainer>,
        path: &str,
        scope: Arc<RequestScope>,
    ) -> Result<Self> {
        let name = container.normalize(path)?;
        Ok(Self {
            container,
            scope,
            name,
            handle: None,
            staged: Vec::new(),
        })
    }

    /// Builds a reference from an absolute URI that must live under the
    /// container's base URI.
    pub fn from_uri(
        container: Arc<RemoteContainer>,
        uri: &str,
        scope: Arc<RequestScope>,
    ) -> Result<Self> {
        let base = container.base_uri();
        let relative = uri.strip_prefix(base.as_str()).ok_or_else(|| {
            BlobError::Argument(format!(
                "`{uri}` does not belong to container `{}`",
                container.name()
            ))
        })?;
        let relative = relative.split(['?', '#']).next().unwrap_or_default();
        let decoded = urlencoding::decode(relative)
            .map_err(|e| BlobError::Argument(format!("`{uri}` is not valid UTF-8: {e}")))?
            .into_owned();
        Self::new(container, &decoded, scope)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn container(&self) -> &Arc<RemoteContainer> {
        &self.container
    }

    pub fn scope(&self) -> &Arc<RequestScope> {
        &self.scope
    }

    pub fn uri(&self) -> String {
        format!(
            "{}{}",
            self.container.base_uri(),
            urlencoding::encode(&self.name).replace("%2F", "/")
        )
    }

    /// Attributes from the last successful resolution, if any.
    pub fn properties(&self) -> Option<&ObjectProperties> {
        self.handle.as_ref()
    }

    /// Resolves existence, trusting the request scope when it already holds
    /// a mark for this object.
    pub async fn fetch_attributes(&mut self) -> Result<bool> {
        let container = self.container.name();
        if let Some(exists) = self.scope.exists_mark(container, &self.name) {
            if !exists {
                self.handle = None;
                return Ok(false);
            }
            // The mark alone is not enough; the attributes may have expired.
            if let Some(props) = self.scope.object(container, &self.name) {
                tracing::debug!(container, path = %self.name, "attributes served from scope");
                self.handle = Some(props);
                return Ok(true);
            }
        }

        let fetched = self
            .container
            .backend()
            .head_object(&self.name)
            .await
            .map_err(BlobError::Transport)?;
        match fetched {
            None => {
                self.scope.mark_exists(container, &self.name, false);
                self.handle = None;
                Ok(false)
            }
            Some(props) => {
                self.scope.mark_exists(container, &self.name, true);
                self.scope.put_object(container, &self.name, props.clone());
                self.handle = Some(props);
                Ok(true)
            }
        }
    }

    pub async fn etag(&mut self) -> Result<String> {
        Ok(self.require_handle("ETag").await?.etag.clone())
    }

    pub async fn length(&mut self) -> Result<u64> {
        Ok(self.require_handle("Length").await?.length)
    }

    async fn require_handle(&mut self, what: &str) -> Result<&ObjectProperties> {
        if !self.fetch_attributes().await? {
            return Err(BlobError::invalid_state(
                &self.name,
                format!("{what} requested for an object that does not exist"),
            ));
        }
        self.handle
            .as_ref()
            .ok_or_else(|| BlobError::invalid_state(&self.name, "attributes were not resolved"))
    }

    pub async fn get_metadata(&mut self, key: &str) -> Result<Option<String>> {
        if let Some((_, value)) = self
            .staged
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            return Ok(value.clone());
        }
        self.remote_metadata(key).await
    }

    /// The value as stored remotely, ignoring staged changes.
    async fn remote_metadata(&mut self, key: &str) -> Result<Option<String>> {
        if !self.fetch_attributes().await? {
            return Ok(None);
        }
        Ok(self
            .handle
            .as_ref()
            .and_then(|h| metadata_get(&h.metadata, key))
            .map(str::to_string))
    }

    /// All metadata the next write would carry.
    pub fn metadata_snapshot(&self) -> Metadata {
        let mut metadata = self
            .handle
            .as_ref()
            .map(|h| h.metadata.clone())
            .unwrap_or_default();
        for (key, value) in &self.staged {
            metadata_set(&mut metadata, key, value.as_deref());
        }
        metadata
    }

    /// With `update` only this key is written to the store immediately (and
    /// audited when `log` is set); other staged changes stay pending. Without
    /// `update` the change is staged for the next write.
    ///
    /// A failed immediate update leaves nothing behind.
    pub async fn set_metadata(
        &mut self,
        key: &str,
        value: Option<&str>,
        update: bool,
        log: bool,
    ) -> Result<()> {
        if !update {
            self.staged
                .push((key.to_string(), value.map(str::to_string)));
            return Ok(());
        }
        if !self.fetch_attributes().await? {
            return Err(BlobError::invalid_state(
                &self.name,
                "metadata update on an object that does not exist",
            ));
        }

        let Some(handle) = self.handle.as_ref() else {
            return Err(BlobError::invalid_state(&self.name, "attributes were not resolved"));
        };
        let mut metadata = handle.metadata.clone();
        metadata_set(&mut metadata, key, value);
        self.container
            .backend()
            .set_metadata(&self.name, &metadata, handle.content_type.as_deref())
            .await
            .map_err(BlobError::Transport)?;

        if let Some(handle) = self.handle.as_mut() {
            handle.metadata = metadata;
        }
        // The stored value supersedes whatever was staged for the key.
        self.staged.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        self.invalidate();
        if log {
            self.audit("SetMetadata");
        }
        Ok(())
    }

    /// Sets the advisory lock; a no-op when the object does not exist.
    pub async fn lock(&mut self) -> Result<()> {
        if !self.fetch_attributes().await? {
            return Ok(());
        }
        tracing::debug!(container = self.container.name(), path = %self.name, "lock");
        self.set_metadata(LOCK_KEY, Some(LOCK_VALUE), true, false)
            .await
    }

    /// Clears the advisory lock; a no-op when the object or the key is absent.
    pub async fn unlock(&mut self) -> Result<()> {
        if !self.fetch_attributes().await? {
            return Ok(());
        }
        if self.remote_metadata(LOCK_KEY).await?.is_none() {
            return Ok(());
        }
        tracing::debug!(container = self.container.name(), path = %self.name, "unlock");
        self.set_metadata(LOCK_KEY, None, true, false).await
    }

    /// Reads the stored key only; `false` when it is absent or the attributes
    /// cannot be fetched.
    pub async fn is_locked(&mut self) -> bool {
        match self.remote_metadata(LOCK_KEY).await {
            Ok(Some(value)) => value.trim().eq_ignore_ascii_case(LOCK_VALUE),
            Ok(None) => false,
            Err(e) => {
                tracing::debug!(path = %self.name, "lock state unavailable: {e}");
                false
            }
        }
    }

    /// Drops every fact the request scope holds for this object.
    pub fn invalidate(&self) {
        self.scope.remove(self.container.name(), &self.name);
    }

    pub(crate) fn clear_staged(&mut self) {
        self.staged.clear();
    }

    pub(crate) fn audit(&self, operation: &str) {
        audit::emit(
            self.container.audit().as_ref(),
            &self.name,
            operation,
            self.container.backend().name(),
        );
    }
}
