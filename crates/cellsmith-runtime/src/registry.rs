//! Instance registry abstraction.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use cellsmith_common::constants;
use cellsmith_common::error::Result;
use cellsmith_common::types::ImageRef;

/// A deployed instance as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescriptor {
    /// Instance name.
    pub name: String,
    /// Image the instance was created from.
    pub image: ImageRef,
    /// Status string reported by the runtime (e.g. `Ready`).
    pub status: String,
}

impl InstanceDescriptor {
    /// Returns whether the instance is serving.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == constants::READY_STATUS
    }
}

/// Key-value view of the cluster's deployed instances.
///
/// Implementors must report a missing instance from [`get`](Self::get) as
/// [`CellsmithError::NotFound`](cellsmith_common::error::CellsmithError::NotFound);
/// any other error is treated as fatal by callers.
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    /// Looks up a deployed instance by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such instance exists, or a registry error.
    async fn get(&self, name: &str) -> Result<InstanceDescriptor>;

    /// Creates or updates resources from declarative manifest files.
    ///
    /// # Errors
    ///
    /// Returns an error if any manifest is rejected.
    async fn apply(&self, manifests: &[PathBuf]) -> Result<()>;

    /// Blocks until the named instance is ready or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the instance is not ready in time, or a registry error.
    async fn wait_for_ready(&self, name: &str, timeout: Duration) -> Result<()>;
}

/// Returns whether `name` exists in the registry.
///
/// # Errors
///
/// Propagates any registry error other than not-found.
pub async fn instance_exists(registry: &dyn InstanceRegistry, name: &str) -> Result<bool> {
    match registry.get(name).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Returns whether `name` exists in the registry and is ready.
///
/// # Errors
///
/// Propagates any registry error other than not-found.
pub async fn instance_ready(registry: &dyn InstanceRegistry, name: &str) -> Result<bool> {
    match registry.get(name).await {
        Ok(descriptor) => Ok(descriptor.is_ready()),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
