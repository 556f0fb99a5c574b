//! Cluster control-plane seam
//!
//! The pipeline only needs four verbs from the control plane. Anything that
//! can create, read, update and delete objects and report a distinguishable
//! not-found can back it.

pub mod memory;

use async_trait::async_trait;

use crate::error::ClusterError;
use crate::models::{Resource, ResourceRef};

pub use memory::InMemoryCluster;

/// Remote object store. Must tolerate concurrent use from independent units.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create an object. Fails with `AlreadyExists` if the name is taken.
    async fn create(&self, resource: Resource) -> Result<Resource, ClusterError>;

    /// Read an object. Fails with `NotFound` once it is gone.
    async fn get(&self, target: &ResourceRef) -> Result<Resource, ClusterError>;

    /// Replace an object. When `meta.resource_version` is set the write only
    /// succeeds if it still matches, otherwise `Conflict` is returned.
    async fn update(&self, resource: Resource) -> Result<Resource, ClusterError>;

    /// Request deletion. Removal may complete asynchronously.
    async fn delete(&self, target: &ResourceRef) -> Result<(), ClusterError>;
}
