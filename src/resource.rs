use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_RESOURCE_GROUP: &str = "Default Resource";
pub const DEFAULT_RESOURCE_ID: &str = "[Default Resource]";

/// One entry of the ordered resource map: group name to resource identifier.
/// Entry order is insertion order and decides acquisition order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceBinding {
    pub group: String,
    pub resource_id: String,
}

impl ResourceBinding {
    pub fn new(group: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource_id: resource_id.into(),
        }
    }

    pub fn default_binding() -> Self {
        Self::new(DEFAULT_RESOURCE_GROUP, DEFAULT_RESOURCE_ID)
    }
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("unknown resource {resource_id}")]
    Unknown { resource_id: String },
    #[error("resource pool {resource_id} is closed")]
    Closed { resource_id: String },
}

/// External execution-resource seam. Handles are scoped to one attempt and
/// release on drop; they are never held across a backoff delay.
#[async_trait]
pub trait ResourceRegistry: Send + Sync {
    async fn acquire(&self, resource_id: &str) -> Result<ResourceHandle, ResourceError>;
}

pub struct ResourceHandle {
    _permit: Option<OwnedSemaphorePermit>,
}

impl ResourceHandle {
    /// Handle for resources the registry does not gate.
    pub fn unbound() -> Self {
        Self { _permit: None }
    }

    pub fn from_permit(permit: OwnedSemaphorePermit) -> Self {
        Self {
            _permit: Some(permit),
        }
    }
}

/// Acquires every binding in insertion order; handles release together when
/// the returned vector drops.
pub async fn acquire_all(
    registry: &dyn ResourceRegistry,
    bindings: &[ResourceBinding],
) -> Result<Vec<ResourceHandle>, ResourceError> {
    let mut handles = Vec::with_capacity(bindings.len());
    for binding in bindings {
        handles.push(registry.acquire(&binding.resource_id).await?);
    }
    Ok(handles)
}

/// In-process registry backed by named semaphores. A pool registered without
/// a slot count is ungated.
pub struct SharedResources {
    pools: HashMap<String, Option<Arc<Semaphore>>>,
}

impl SharedResources {
    pub fn new() -> Self {
        Self {
            pools: HashMap::new(),
        }
    }

    pub fn with_pool(mut self, resource_id: impl Into<String>, slots: usize) -> Self {
        self.pools
            .insert(resource_id.into(), Some(Arc::new(Semaphore::new(slots))));
        self
    }

    pub fn with_unbounded(mut self, resource_id: impl Into<String>) -> Self {
        self.pools.insert(resource_id.into(), None);
        self
    }
}

impl Default for SharedResources {
    fn default() -> Self {
        Self::new().with_unbounded(DEFAULT_RESOURCE_ID)
    }
}

#[async_trait]
impl ResourceRegistry for SharedResources {
    async fn acquire(&self, resource_id: &str) -> Result<ResourceHandle, ResourceError> {
        let pool = self
            .pools
            .get(resource_id)
            .ok_or_else(|| ResourceError::Unknown {
                resource_id: resource_id.to_string(),
            })?;
        match pool {
            None => Ok(ResourceHandle::unbound()),
            Some(semaphore) => {
                let permit = semaphore.clone().acquire_owned().await.map_err(|_| {
                    ResourceError::Closed {
                        resource_id: resource_id.to_string(),
                    }
                })?;
                Ok(ResourceHandle::from_permit(permit))
            }
        }
    }
}
