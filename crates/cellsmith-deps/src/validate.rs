//! Validation passes over a built dependency tree.
//!
//! The structural pass checks that an instance name is never bound to two
//! different images and that running instances match the registry. The
//! requirement pass checks the runtime provides the capabilities the images
//! to be started need.

use std::collections::{BTreeMap, HashSet};

use cellsmith_common::error::{CellsmithError, Result};
use cellsmith_common::types::ImageRef;
use cellsmith_runtime::capability::{Capability, CapabilityProbe};
use cellsmith_runtime::registry::InstanceRegistry;

use crate::tree::{DependencyTree, NodeId};

/// Checks instance-name consistency within the tree and against the registry.
///
/// # Errors
///
/// Returns [`CellsmithError::Conflict`] if two nodes share a name but not an
/// image, or a running node is missing, not ready, or of another image in
/// the registry. Registry failures other than not-found are returned as
/// [`CellsmithError::Registry`].
pub async fn validate_tree_links(tree: &DependencyTree, registry: &dyn InstanceRegistry) -> Result<()> {
    let instances = instances_by_name(tree)?;

    for (instance, id) in &instances {
        let node = tree.node(*id);
        if !node.running {
            continue;
        }
        let expected = node.metadata.image_ref();
        match registry.get(instance).await {
            Ok(live) if live.is_ready() => {
                if !live.image.same_image(&expected) {
                    return Err(CellsmithError::conflict(format!(
                        "provided instance {instance} is required to be of image {expected}, \
                         instance available in the runtime is from image {}",
                        live.image
                    )));
                }
            }
            Ok(_) => return Err(unavailable(instance)),
            Err(e) if e.is_not_found() => return Err(unavailable(instance)),
            Err(e) => {
                return Err(CellsmithError::Registry {
                    message: format!(
                        "failed to check whether instance {instance} exists in the runtime: {e}"
                    ),
                });
            }
        }
        tracing::debug!(instance = %instance, image = %expected, "running instance matches link");
    }
    Ok(())
}

fn unavailable(instance: &str) -> CellsmithError {
    CellsmithError::conflict(format!("instance {instance} is not available in the runtime"))
}

/// Maps every instance name to its node, failing when one name is carried by
/// two nodes of different images.
fn instances_by_name(tree: &DependencyTree) -> Result<BTreeMap<String, NodeId>> {
    let mut instances: BTreeMap<String, NodeId> = BTreeMap::new();
    let mut conflict = None;
    tree.walk(|_, id, _| {
        if conflict.is_some() {
            return;
        }
        let node = tree.node(id);
        match instances.get(&node.instance) {
            Some(&seen) if seen != id => {
                let existing = tree.node(seen).metadata.image_ref();
                let image = node.metadata.image_ref();
                if !existing.same_image(&image) {
                    conflict = Some(CellsmithError::conflict(format!(
                        "instance {} cannot be shared by different images {image} and {existing}",
                        node.instance
                    )));
                }
            }
            Some(_) => {}
            None => {
                let _ = instances.insert(node.instance.clone(), id);
            }
        }
    });
    conflict.map_or(Ok(instances), Err)
}

/// Outcome of a successful requirement pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequirementReport {
    /// Soft requirements the runtime does not meet.
    pub warnings: Vec<String>,
}

/// Checks the runtime offers the capabilities required by every image that
/// will be started.
///
/// Each distinct image is checked once. Subtrees below running instances
/// are skipped. A missing zero-scaling capability fails the run, a missing
/// autoscaling capability only warns. With `complete_setup` the runtime is
/// trusted to offer every capability and nothing is probed.
///
/// # Errors
///
/// Returns [`CellsmithError::RequirementUnmet`] for a missing zero-scaling
/// capability, or the probe's error if zero-scaling cannot be checked.
pub async fn validate_requirements(
    tree: &DependencyTree,
    probe: &dyn CapabilityProbe,
    complete_setup: bool,
) -> Result<RequirementReport> {
    let mut report = RequirementReport::default();
    if complete_setup {
        tracing::debug!("complete setup, skipping capability probes");
        return Ok(report);
    }

    let mut checked: HashSet<ImageRef> = HashSet::new();
    let mut zero_scaling: Option<bool> = None;
    let mut autoscaling: Option<bool> = None;
    let mut stack = vec![tree.root()];

    while let Some(id) = stack.pop() {
        let node = tree.node(id);
        let image = node.metadata.image_ref();
        if !checked.insert(image.clone()) {
            continue;
        }

        if node.metadata.zero_scaling_required {
            let enabled = match zero_scaling {
                Some(enabled) => enabled,
                None => *zero_scaling.insert(probe.is_enabled(Capability::ZeroScaling).await?),
            };
            if !enabled {
                return Err(CellsmithError::RequirementUnmet {
                    message: format!(
                        "image {image} of instance {} contains zero-scaling components, but \
                         zero-scaling is not enabled in the runtime",
                        node.instance
                    ),
                });
            }
        }

        if node.metadata.auto_scaling_required {
            let enabled = match autoscaling {
                Some(enabled) => Some(enabled),
                None => match probe.is_enabled(Capability::Autoscaling).await {
                    Ok(enabled) => Some(*autoscaling.insert(enabled)),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to check whether autoscaling is enabled");
                        report
                            .warnings
                            .push(format!("failed to check whether autoscaling is enabled: {e}"));
                        None
                    }
                },
            };
            if enabled == Some(false) {
                let warning = format!(
                    "instance {} from image {image} contains autoscaling components, but \
                     autoscaling is not enabled in the runtime, autoscaling may not work",
                    node.instance
                );
                tracing::warn!(instance = %node.instance, image = %image, "autoscaling not enabled");
                report.warnings.push(warning);
            }
        }

        for child in node.dependencies.values().rev() {
            if !tree.node(*child).running {
                stack.push(*child);
            }
        }
    }

    tracing::info!(images = checked.len(), warnings = report.warnings.len(), "requirements validated");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use cellsmith_image::metadata::ImageMetadata;
    use cellsmith_runtime::registry::InstanceDescriptor;

    use super::*;
    use crate::tree::TreeNode;

    fn node(instance: &str, metadata: ImageMetadata, running: bool, deps: &[(&str, usize)]) -> TreeNode {
        let mut node = TreeNode {
            instance: instance.into(),
            metadata: Arc::new(metadata),
            dependencies: BTreeMap::new(),
            shared: false,
            running,
        };
        for (alias, index) in deps {
            let _ = node
                .dependencies
                .insert((*alias).to_string(), NodeId::from_index(*index));
        }
        node
    }

    fn image(name: &str) -> ImageMetadata {
        ImageMetadata::new("myorg", name, "1.0")
    }

    struct LiveRegistry(BTreeMap<&'static str, InstanceDescriptor>);

    #[async_trait]
    impl InstanceRegistry for LiveRegistry {
        async fn get(&self, name: &str) -> Result<InstanceDescriptor> {
            if name == "unreachable" {
                return Err(CellsmithError::Registry {
                    message: "connection refused".into(),
                });
            }
            self.0.get(name).cloned().ok_or_else(|| CellsmithError::NotFound {
                kind: "instance",
                id: name.into(),
            })
        }

        async fn apply(&self, _manifests: &[PathBuf]) -> Result<()> {
            Ok(())
        }

        async fn wait_for_ready(&self, _name: &str, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    fn live(name: &'static str, image: &str, status: &str) -> (&'static str, InstanceDescriptor) {
        (
            name,
            InstanceDescriptor {
                name: name.into(),
                image: ImageRef::new("myorg", image, "1.0"),
                status: status.into(),
            },
        )
    }

    #[tokio::test]
    async fn same_name_for_different_images_conflicts() {
        let tree = DependencyTree::from_nodes(vec![
            node("hr", image("hr"), false, &[("a", 1), ("b", 2)]),
            node("dup", image("employee"), false, &[]),
            node("dup", image("stock"), false, &[]),
        ]);
        let err = validate_tree_links(&tree, &LiveRegistry(BTreeMap::new()))
            .await
            .expect_err("should conflict");
        assert!(matches!(err, CellsmithError::Conflict { .. }));
        assert!(err.to_string().contains("instance dup cannot be shared"), "{err}");
    }

    #[tokio::test]
    async fn same_name_for_same_image_is_allowed() {
        let tree = DependencyTree::from_nodes(vec![
            node("hr", image("hr"), false, &[("a", 1), ("b", 2)]),
            node("dup", image("db"), false, &[]),
            node("dup", image("db"), false, &[]),
        ]);
        validate_tree_links(&tree, &LiveRegistry(BTreeMap::new()))
            .await
            .expect("valid");
    }

    #[tokio::test]
    async fn running_node_must_match_live_image() {
        let tree = DependencyTree::from_nodes(vec![
            node("hr", image("hr"), false, &[("db", 1)]),
            node("live-db", image("mysql"), true, &[]),
        ]);

        let matching = LiveRegistry(BTreeMap::from([live("live-db", "mysql", "Ready")]));
        validate_tree_links(&tree, &matching).await.expect("valid");

        let other = LiveRegistry(BTreeMap::from([live("live-db", "postgres", "Ready")]));
        let err = validate_tree_links(&tree, &other).await.expect_err("mismatch");
        assert!(err.to_string().contains("myorg/postgres:1.0"), "{err}");

        let pending = LiveRegistry(BTreeMap::from([live("live-db", "mysql", "Pending")]));
        let err = validate_tree_links(&tree, &pending).await.expect_err("not ready");
        assert!(err.to_string().contains("not available"), "{err}");

        let err = validate_tree_links(&tree, &LiveRegistry(BTreeMap::new()))
            .await
            .expect_err("missing");
        assert!(matches!(err, CellsmithError::Conflict { .. }));
    }

    #[tokio::test]
    async fn registry_failure_is_not_a_conflict() {
        let tree = DependencyTree::from_nodes(vec![
            node("hr", image("hr"), false, &[("db", 1)]),
            node("unreachable", image("mysql"), true, &[]),
        ]);
        let err = validate_tree_links(&tree, &LiveRegistry(BTreeMap::new()))
            .await
            .expect_err("should fail");
        assert!(matches!(err, CellsmithError::Registry { .. }));
    }

    struct Capabilities {
        zero_scaling: bool,
        autoscaling: bool,
        calls: AtomicUsize,
    }

    impl Capabilities {
        fn new(zero_scaling: bool, autoscaling: bool) -> Self {
            Self {
                zero_scaling,
                autoscaling,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CapabilityProbe for Capabilities {
        async fn is_enabled(&self, capability: Capability) -> Result<bool> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(match capability {
                Capability::ZeroScaling => self.zero_scaling,
                Capability::Autoscaling => self.autoscaling,
            })
        }
    }

    fn scaling(name: &str, zero: bool, auto: bool) -> ImageMetadata {
        let mut metadata = image(name);
        metadata.zero_scaling_required = zero;
        metadata.auto_scaling_required = auto;
        metadata
    }

    #[tokio::test]
    async fn missing_zero_scaling_fails() {
        let tree = DependencyTree::from_nodes(vec![
            node("hr", image("hr"), false, &[("db", 1)]),
            node("db", scaling("db", true, false), false, &[]),
        ]);
        let err = validate_requirements(&tree, &Capabilities::new(false, true), false)
            .await
            .expect_err("should fail");
        assert!(matches!(err, CellsmithError::RequirementUnmet { .. }));
    }

    #[tokio::test]
    async fn missing_autoscaling_only_warns() {
        let tree = DependencyTree::from_nodes(vec![node("hr", scaling("hr", false, true), false, &[])]);
        let report = validate_requirements(&tree, &Capabilities::new(true, false), false)
            .await
            .expect("valid");
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("instance hr"));
    }

    #[tokio::test]
    async fn running_subtrees_are_not_checked() {
        let tree = DependencyTree::from_nodes(vec![
            node("hr", image("hr"), false, &[("db", 1)]),
            node("db", scaling("db", true, false), true, &[]),
        ]);
        let probe = Capabilities::new(false, false);
        let _ = validate_requirements(&tree, &probe, false).await.expect("valid");
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn each_image_is_probed_once() {
        let tree = DependencyTree::from_nodes(vec![
            node("hr", image("hr"), false, &[("a", 1), ("b", 2)]),
            node("db-a", scaling("db", true, true), false, &[]),
            node("db-b", scaling("db", true, true), false, &[]),
        ]);
        let probe = Capabilities::new(true, true);
        let report = validate_requirements(&tree, &probe, false).await.expect("valid");
        assert!(report.warnings.is_empty());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn complete_setup_skips_probes() {
        let tree = DependencyTree::from_nodes(vec![node("hr", scaling("hr", true, true), false, &[])]);
        let probe = Capabilities::new(false, false);
        let report = validate_requirements(&tree, &probe, true).await.expect("valid");
        assert!(report.warnings.is_empty());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }
}
