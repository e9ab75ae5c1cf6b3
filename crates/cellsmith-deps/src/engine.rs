//! The `run` flow: resolve, validate, confirm, and start an image with its
//! dependencies.

use std::collections::HashSet;
use std::sync::Arc;

use cellsmith_common::config::CellsmithConfig;
use cellsmith_common::error::{CellsmithError, Result};
use cellsmith_common::types::{ImageRef, is_valid_instance_name};
use cellsmith_image::graph;
use cellsmith_image::metadata::ImageMetadata;
use cellsmith_image::store::ImageStore;
use cellsmith_runtime::capability::CapabilityProbe;
use cellsmith_runtime::registry::{InstanceRegistry, instance_exists};
use cellsmith_runtime::starter::InstanceStarter;

use crate::activate::{ActivationReport, Activator};
use crate::env::{EnvAssignment, group_environment};
use crate::link::{DependencyLink, parse_links, probe_links, validate_links};
use crate::naming;
use crate::tree::DependencyTree;
use crate::validate::{validate_requirements, validate_tree_links};

/// Parameters of a single `run`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    /// Image tag, `[registry/]org/name:version`.
    pub image: String,
    /// Name of the root instance; generated when absent.
    pub instance: Option<String>,
    /// Whether to resolve and start the full dependency tree.
    pub start_dependencies: bool,
    /// Whether generated dependency instances of the same image are shared.
    pub share_instances: bool,
    /// Raw `[parent.]alias:instance` links.
    pub links: Vec<String>,
    /// Raw `[instance.]KEY=value` assignments.
    pub env: Vec<String>,
}

/// What the caller is asked to confirm before anything is started.
#[derive(Debug)]
pub struct RunPlan<'a> {
    /// Root instance name.
    pub instance: &'a str,
    /// Root image.
    pub image: &'a ImageRef,
    /// Resolved and validated tree.
    pub tree: &'a DependencyTree,
    /// Non-fatal findings of link and requirement validation.
    pub warnings: &'a [String],
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Root instance name.
    pub instance: String,
    /// Root image.
    pub image: ImageRef,
    /// Non-fatal findings of link and requirement validation.
    pub warnings: Vec<String>,
    /// Every instance started, dependencies first and the root last.
    pub report: ActivationReport,
}

/// Wires image store, registry, capability probe, and starter into the
/// `run` flow.
pub struct Engine {
    store: Arc<dyn ImageStore>,
    registry: Arc<dyn InstanceRegistry>,
    probe: Arc<dyn CapabilityProbe>,
    starter: Arc<dyn InstanceStarter>,
    complete_setup: bool,
}

impl Engine {
    /// Creates an engine over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn ImageStore>,
        registry: Arc<dyn InstanceRegistry>,
        probe: Arc<dyn CapabilityProbe>,
        starter: Arc<dyn InstanceStarter>,
        config: &CellsmithConfig,
    ) -> Self {
        Self {
            store,
            registry,
            probe,
            starter,
            complete_setup: config.complete_setup,
        }
    }

    /// Runs an image.
    ///
    /// Input is parsed and validated before the registry is touched. The
    /// tree is then resolved and validated, `confirm` is asked whether to
    /// proceed, dependencies are activated, and the root is started last.
    /// Every image is pulled from the registry named in the root image tag,
    /// or from the configured default when the tag names none.
    ///
    /// # Errors
    ///
    /// Returns the first error of any phase. Declining confirmation yields
    /// [`CellsmithError::InvalidInput`]. Instances started before a failure
    /// are not removed.
    pub async fn run<F>(&self, request: RunRequest, confirm: F) -> Result<RunOutcome>
    where
        F: FnOnce(&RunPlan<'_>) -> Result<bool>,
    {
        let image = ImageRef::parse(&request.image)?;
        let mut links = parse_links(&request.links)?;
        let assignments = request
            .env
            .iter()
            .map(|raw| EnvAssignment::parse(raw))
            .collect::<Result<Vec<_>>>()?;

        let metadata = self.root_metadata(&image).await?;
        graph::ensure_acyclic(&metadata)?;

        let instance = self.root_instance(&image, request.instance, &links).await?;
        tracing::info!(instance = %instance, image = %image, "main instance");

        probe_links(self.registry.as_ref(), &mut links).await?;
        let mut warnings: Vec<String> = validate_links(&instance, &metadata, &links)?
            .iter()
            .map(ToString::to_string)
            .collect();
        let env = group_environment(&instance, &links, assignments)?;

        let mut tree = if request.start_dependencies {
            DependencyTree::build(&instance, Arc::clone(&metadata), &links, request.share_instances)?
        } else {
            DependencyTree::build_immediate(&instance, Arc::clone(&metadata), &links)?
        };
        validate_tree_links(&tree, self.registry.as_ref()).await?;
        let requirements =
            validate_requirements(&tree, self.probe.as_ref(), self.complete_setup).await?;
        warnings.extend(requirements.warnings);

        let plan = RunPlan {
            instance: &instance,
            image: &image,
            tree: &tree,
            warnings: &warnings,
        };
        if !confirm(&plan)? {
            return Err(CellsmithError::invalid_input("run aborted"));
        }

        let activator =
            Activator::new(Arc::clone(&self.starter)).with_registry(image.registry.clone());
        let mut report = if request.start_dependencies {
            activator.activate_dependencies(&mut tree, &env).await?
        } else {
            ActivationReport::default()
        };
        let root = activator.start_root(&mut tree, &env).await?;
        report.started.push(root);

        tracing::info!(instance = %instance, image = %image, started = report.started.len(), "run complete");
        Ok(RunOutcome {
            instance,
            image,
            warnings,
            report,
        })
    }

    async fn root_metadata(&self, image: &ImageRef) -> Result<Arc<ImageMetadata>> {
        let store = Arc::clone(&self.store);
        let image = image.clone();
        let extracted = tokio::task::spawn_blocking(move || store.extract(&image))
            .await
            .map_err(|e| CellsmithError::Registry {
                message: format!("image extraction task failed: {e}"),
            })??;
        Ok(Arc::new(extracted.metadata))
    }

    /// Validates a requested root instance name, or generates one.
    async fn root_instance(
        &self,
        image: &ImageRef,
        requested: Option<String>,
        links: &[DependencyLink],
    ) -> Result<String> {
        let Some(name) = requested else {
            let reserved: HashSet<String> = links.iter().map(|l| l.target.clone()).collect();
            return naming::generate_instance_name(image, &reserved);
        };
        if !is_valid_instance_name(&name) {
            return Err(CellsmithError::invalid_input(format!(
                "invalid instance name \"{name}\", expected lowercase alphanumeric words \
                 joined by dashes"
            )));
        }
        if instance_exists(self.registry.as_ref(), &name).await? {
            return Err(CellsmithError::conflict(format!(
                "instance {name} already exists, the instance to be created should not be \
                 present in the runtime"
            )));
        }
        Ok(name)
    }
}
