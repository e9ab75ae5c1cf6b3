//! Starting a single cell instance.
//!
//! [`ImageStarter`] turns an image into a running instance: it extracts the
//! image, runs the image's optional `hooks/run` executable, rewrites the
//! shipped manifests for the instance, applies them, and waits for the
//! instance to become ready.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cellsmith_common::config::CellsmithConfig;
use cellsmith_common::constants;
use cellsmith_common::error::{CellsmithError, Result};
use cellsmith_common::types::ImageRef;
use cellsmith_image::store::{ExtractedImage, ImageStore};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::manifest;
use crate::registry::InstanceRegistry;

/// Description of an instance passed to the `run` hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyInfo {
    /// Organization of the instance's image.
    pub org: String,
    /// Name of the instance's image.
    pub name: String,
    /// Version of the instance's image.
    pub ver: String,
    /// Instance name.
    #[serde(rename = "instanceName")]
    pub instance_name: String,
}

impl DependencyInfo {
    /// Describes `instance` of `image`.
    #[must_use]
    pub fn new(image: &ImageRef, instance: impl Into<String>) -> Self {
        Self {
            org: image.organization.clone(),
            name: image.name.clone(),
            ver: image.version.clone(),
            instance_name: instance.into(),
        }
    }
}

/// Everything needed to start one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// Name of the instance to create.
    pub instance: String,
    /// Image to create it from.
    pub image: ImageRef,
    /// Direct dependencies keyed by alias.
    pub dependencies: BTreeMap<String, DependencyInfo>,
    /// Environment variables for the instance, in the order given.
    pub env: Vec<(String, String)>,
}

/// Performs the start side effect for one instance.
#[async_trait]
pub trait InstanceStarter: Send + Sync {
    /// Creates the instance and returns once it is ready.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance cannot be created or does not become
    /// ready in time.
    async fn start(&self, request: &StartRequest) -> Result<()>;
}

/// Starts instances from packaged images against an instance registry.
pub struct ImageStarter {
    store: Arc<dyn ImageStore>,
    registry: Arc<dyn InstanceRegistry>,
    timeout: Duration,
}

impl ImageStarter {
    /// Creates a starter using the readiness timeout from `config`.
    #[must_use]
    pub fn new(
        store: Arc<dyn ImageStore>,
        registry: Arc<dyn InstanceRegistry>,
        config: &CellsmithConfig,
    ) -> Self {
        Self {
            store,
            registry,
            timeout: config.readiness_timeout(),
        }
    }

    async fn extract(&self, request: &StartRequest) -> Result<ExtractedImage> {
        let store = Arc::clone(&self.store);
        let image = request.image.clone();
        tokio::task::spawn_blocking(move || store.extract(&image))
            .await
            .map_err(|e| CellsmithError::Activation {
                instance: request.instance.clone(),
                message: format!("image extraction task failed: {e}"),
            })?
    }

    async fn rewrite(&self, dir: PathBuf, request: &StartRequest) -> Result<(Vec<PathBuf>, usize)> {
        let image = request.image.clone();
        let instance = request.instance.clone();
        tokio::task::spawn_blocking(move || manifest::rewrite_manifests(&dir, &image, &instance))
            .await
            .map_err(|e| CellsmithError::Activation {
                instance: request.instance.clone(),
                message: format!("manifest rewrite task failed: {e}"),
            })?
    }

    async fn run_hook(&self, dir: &Path, request: &StartRequest) -> Result<()> {
        let hook = dir.join(constants::RUN_HOOK);
        if !hook.is_file() {
            tracing::debug!(instance = %request.instance, "image has no run hook");
            return Ok(());
        }

        tracing::info!(instance = %request.instance, "running image hook");
        let output = hook_command(&hook, dir, request)?
            .output()
            .await
            .map_err(|e| CellsmithError::Io {
                path: hook.clone(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(CellsmithError::Activation {
                instance: request.instance.clone(),
                message: format!(
                    "run hook exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

/// Builds the hook invocation: `hooks/run <self-json> <dependencies-json>`
/// with the instance's environment variables set.
fn hook_command(hook: &Path, dir: &Path, request: &StartRequest) -> Result<Command> {
    let this = serde_json::to_string(&DependencyInfo::new(&request.image, &request.instance))?;
    let dependencies = serde_json::to_string(&request.dependencies)?;

    let mut command = Command::new(hook);
    let _ = command
        .current_dir(dir)
        .arg(this)
        .arg(dependencies)
        .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    Ok(command)
}

#[async_trait]
impl InstanceStarter for ImageStarter {
    async fn start(&self, request: &StartRequest) -> Result<()> {
        let extracted = self.extract(request).await?;

        self.run_hook(extracted.path(), request).await?;

        let (manifests, renamed) = self
            .rewrite(extracted.path().join(constants::MANIFEST_DIR), request)
            .await?;
        if manifests.is_empty() {
            return Err(CellsmithError::Activation {
                instance: request.instance.clone(),
                message: format!("image {} ships no manifests", request.image),
            });
        }
        if renamed == 0 {
            tracing::warn!(
                instance = %request.instance,
                image = %request.image,
                "no manifest resource is named after the image"
            );
        }

        self.registry.apply(&manifests).await?;
        self.registry
            .wait_for_ready(&request.instance, self.timeout)
            .await?;
        tracing::info!(instance = %request.instance, image = %request.image, "instance ready");
        Ok(())
    }
}
