//! Resource store trait and implementations.
//!
//! The store is the record of every declared resource and its status
//! subresource. Spec and generation come in through [`ResourceStore::apply`];
//! status only ever changes through [`ResourceStore::patch_status`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use playop_core::{ParamSet, ResourceId};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::types::{ManagedResource, ResourceStatus};

/// Trait for resource storage backends.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Record a declared spec. Creates the resource if absent.
    ///
    /// A generation older than the stored one is ignored and the stored
    /// record is returned unchanged. So is any write to a record flagged
    /// for deletion.
    async fn apply(&self, id: &ResourceId, spec: ParamSet, generation: u64)
    -> Result<ManagedResource>;

    /// Fetch one resource.
    async fn get(&self, id: &ResourceId) -> Result<Option<ManagedResource>>;

    /// All resources, ordered by identity.
    async fn list(&self) -> Result<Vec<ManagedResource>>;

    /// Replace the status subresource.
    ///
    /// Returns `false` without writing when the patch carries an
    /// `observedGeneration` older than the one already recorded.
    async fn patch_status(&self, id: &ResourceId, status: ResourceStatus) -> Result<bool>;

    /// Flag the resource for finalization.
    async fn mark_deleting(&self, id: &ResourceId) -> Result<()>;

    /// Drop the record. Returns the removed resource, if any.
    async fn remove(&self, id: &ResourceId) -> Result<Option<ManagedResource>>;
}

/// In-memory resource store.
#[derive(Default)]
pub struct InMemoryResourceStore {
    resources: RwLock<HashMap<ResourceId, ManagedResource>>,
}

impl InMemoryResourceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store wrapped in an Arc.
    #[must_use]
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn apply(
        &self,
        id: &ResourceId,
        spec: ParamSet,
        generation: u64,
    ) -> Result<ManagedResource> {
        let mut resources = self.resources.write().await;
        let resource = resources
            .entry(id.clone())
            .or_insert_with(|| ManagedResource::new(id.clone(), ParamSet::new(), 0));

        // A record awaiting finalization is frozen until it is removed.
        if !resource.deletion_requested && generation >= resource.generation {
            resource.spec = spec;
            resource.generation = generation;
        }
        Ok(resource.clone())
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<ManagedResource>> {
        Ok(self.resources.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<ManagedResource>> {
        let resources = self.resources.read().await;
        let mut all: Vec<ManagedResource> = resources.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn patch_status(&self, id: &ResourceId, status: ResourceStatus) -> Result<bool> {
        let mut resources = self.resources.write().await;
        let resource = resources
            .get_mut(id)
            .ok_or_else(|| Error::resource_not_found(id))?;

        let stale = matches!(
            (status.observed_generation, resource.status.observed_generation),
            (Some(incoming), Some(current)) if incoming < current
        );
        if stale {
            return Ok(false);
        }
        resource.status = status;
        Ok(true)
    }

    async fn mark_deleting(&self, id: &ResourceId) -> Result<()> {
        let mut resources = self.resources.write().await;
        let resource = resources
            .get_mut(id)
            .ok_or_else(|| Error::resource_not_found(id))?;
        resource.deletion_requested = true;
        Ok(())
    }

    async fn remove(&self, id: &ResourceId) -> Result<Option<ManagedResource>> {
        Ok(self.resources.write().await.remove(id))
    }
}

/// A wrapper that adds tracing to a resource store.
pub struct TracingResourceStore<S: ResourceStore> {
    inner: S,
}

impl<S: ResourceStore> TracingResourceStore<S> {
    /// Create a new tracing resource store.
    pub const fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: ResourceStore> ResourceStore for TracingResourceStore<S> {
    async fn apply(
        &self,
        id: &ResourceId,
        spec: ParamSet,
        generation: u64,
    ) -> Result<ManagedResource> {
        tracing::debug!(resource = %id, generation, "Applying spec");
        self.inner.apply(id, spec, generation).await
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<ManagedResource>> {
        self.inner.get(id).await
    }

    async fn list(&self) -> Result<Vec<ManagedResource>> {
        self.inner.list().await
    }

    async fn patch_status(&self, id: &ResourceId, status: ResourceStatus) -> Result<bool> {
        tracing::debug!(
            resource = %id,
            phase = %status.phase,
            observed_generation = ?status.observed_generation,
            "Patching status"
        );
        let result = self.inner.patch_status(id, status).await;
        if let Ok(false) = result {
            tracing::debug!(resource = %id, "Stale status patch ignored");
        }
        result
    }

    async fn mark_deleting(&self, id: &ResourceId) -> Result<()> {
        tracing::debug!(resource = %id, "Marking for deletion");
        self.inner.mark_deleting(id).await
    }

    async fn remove(&self, id: &ResourceId) -> Result<Option<ManagedResource>> {
        tracing::debug!(resource = %id, "Removing resource");
        self.inner.remove(id).await
    }
}
