//! Registry and capability probe backed by the `kubectl` binary.
//!
//! Cell instances are custom resources of type
//! [`CELL_RESOURCE`](cellsmith_common::constants::CELL_RESOURCE) whose
//! annotations record the image they were created from.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use cellsmith_common::config::CellsmithConfig;
use cellsmith_common::constants;
use cellsmith_common::error::{CellsmithError, Result};
use cellsmith_common::types::ImageRef;
use serde::Deserialize;
use tokio::process::Command;

use crate::capability::{Capability, CapabilityProbe};
use crate::registry::{InstanceDescriptor, InstanceRegistry};

/// Extra time granted to `kubectl wait` beyond its own `--timeout`.
const WAIT_GRACE: Duration = Duration::from_secs(30);

/// Client for a cluster reachable through `kubectl`.
#[derive(Debug, Clone)]
pub struct KubectlClient {
    binary: PathBuf,
    namespace: String,
}

/// Captured result of a `kubectl` invocation.
#[derive(Debug)]
struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl KubectlClient {
    /// Locates the configured `kubectl` binary on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`CellsmithError::NotFound`] if the binary cannot be found.
    pub fn from_config(config: &CellsmithConfig) -> Result<Self> {
        let binary = which::which(&config.kubectl).map_err(|_| CellsmithError::NotFound {
            kind: "executable",
            id: config.kubectl.clone(),
        })?;
        tracing::debug!(binary = %binary.display(), namespace = %config.namespace, "using kubectl");
        Ok(Self {
            binary,
            namespace: config.namespace.clone(),
        })
    }

    /// Creates a client for an explicit binary path and namespace.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            namespace: namespace.into(),
        }
    }

    /// Runs kubectl to completion. Dropping the returned future kills the
    /// child process.
    async fn run(&self, args: &[String]) -> Result<CommandOutput> {
        tracing::debug!(?args, "running kubectl");
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CellsmithError::Io {
                path: self.binary.clone(),
                source: e,
            })?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Runs `kubectl get <resource> <name> -n <namespace> -o json`, mapping
    /// kubectl's not-found report onto the typed error.
    async fn get_json(&self, resource: &str, name: &str, namespace: &str) -> Result<String> {
        let args = vec![
            "get".to_string(),
            resource.to_string(),
            name.to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "-o".to_string(),
            "json".to_string(),
        ];
        let output = self.run(&args).await?;
        if output.success {
            return Ok(output.stdout);
        }
        if reports_not_found(&output.stderr) {
            return Err(CellsmithError::NotFound {
                kind: "resource",
                id: format!("{resource}/{name}"),
            });
        }
        Err(CellsmithError::Registry {
            message: format!("kubectl get {resource}/{name} failed: {}", output.stderr.trim()),
        })
    }
}

/// kubectl prints `Error from server (NotFound)` or `No resources found`
/// when a lookup misses. This is the only place tool output is inspected.
fn reports_not_found(stderr: &str) -> bool {
    stderr.contains("(NotFound)") || stderr.contains("No resources found")
}

#[derive(Debug, Deserialize)]
struct CellResource {
    metadata: ResourceMetadata,
    #[serde(default)]
    status: CellStatus,
}

#[derive(Debug, Deserialize)]
struct ResourceMetadata {
    name: String,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct CellStatus {
    #[serde(default)]
    status: String,
}

fn parse_instance(json: &str) -> Result<InstanceDescriptor> {
    let resource: CellResource = serde_json::from_str(json)?;
    let annotation = |key: &str| {
        resource
            .metadata
            .annotations
            .get(key)
            .cloned()
            .unwrap_or_default()
    };
    Ok(InstanceDescriptor {
        image: ImageRef::new(
            annotation(constants::ANNOTATION_ORGANIZATION),
            annotation(constants::ANNOTATION_NAME),
            annotation(constants::ANNOTATION_VERSION),
        ),
        name: resource.metadata.name,
        status: resource.status.status,
    })
}

#[async_trait]
impl InstanceRegistry for KubectlClient {
    async fn get(&self, name: &str) -> Result<InstanceDescriptor> {
        let json = self
            .get_json(constants::CELL_RESOURCE, name, &self.namespace)
            .await
            .map_err(|e| match e {
                CellsmithError::NotFound { .. } => CellsmithError::NotFound {
                    kind: "instance",
                    id: name.to_string(),
                },
                other => other,
            })?;
        parse_instance(&json)
    }

    async fn apply(&self, manifests: &[PathBuf]) -> Result<()> {
        for manifest in manifests {
            tracing::debug!(manifest = %manifest.display(), "applying manifest");
            let args = vec![
                "apply".to_string(),
                "-n".to_string(),
                self.namespace.clone(),
                "-f".to_string(),
                manifest.display().to_string(),
            ];
            let output = self.run(&args).await?;
            if !output.success {
                return Err(CellsmithError::Registry {
                    message: format!(
                        "failed to apply {}: {}",
                        manifest.display(),
                        output.stderr.trim()
                    ),
                });
            }
        }
        Ok(())
    }

    async fn wait_for_ready(&self, name: &str, timeout: Duration) -> Result<()> {
        let args = vec![
            "wait".to_string(),
            "--for=condition=Ready".to_string(),
            format!("--timeout={}s", timeout.as_secs()),
            format!("{}/{name}", constants::CELL_RESOURCE),
            "-n".to_string(),
            self.namespace.clone(),
        ];
        let timed_out = || CellsmithError::Timeout {
            instance: name.to_string(),
            seconds: timeout.as_secs(),
        };

        let output = tokio::time::timeout(timeout + WAIT_GRACE, self.run(&args))
            .await
            .map_err(|_| timed_out())??;
        if output.success {
            return Ok(());
        }
        if output.stderr.contains("timed out") {
            return Err(timed_out());
        }
        Err(CellsmithError::Registry {
            message: format!("waiting for {name} failed: {}", output.stderr.trim()),
        })
    }
}

/// Namespace and deployment whose presence signals a capability.
const fn capability_deployment(capability: Capability) -> (&'static str, &'static str) {
    match capability {
        Capability::ZeroScaling => ("knative-serving", "activator"),
        Capability::Autoscaling => ("kube-system", "metrics-server"),
    }
}

#[async_trait]
impl CapabilityProbe for KubectlClient {
    async fn is_enabled(&self, capability: Capability) -> Result<bool> {
        let (namespace, deployment) = capability_deployment(capability);
        match self.get_json("deployment", deployment, namespace).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(CellsmithError::Registry {
                message: format!("failed to check whether {capability} is enabled: {e}"),
            }),
        }
    }
}
