//! Image dependency graph built with `petgraph`.
//!
//! Metadata embeds dependency images recursively, so a well-formed
//! descriptor is finite, but nothing stops an image from (transitively)
//! declaring itself as a dependency. Such a graph has no valid start order
//! and is rejected before any instance tree is built.

use std::collections::HashMap;

use cellsmith_common::error::{CellsmithError, Result};
use cellsmith_common::types::ImageRef;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::metadata::ImageMetadata;

/// Directed graph of image identities; an edge points from a dependency
/// to the image depending on it.
#[derive(Debug, Default)]
pub struct ImageGraph {
    graph: DiGraph<ImageRef, ()>,
    nodes: HashMap<ImageRef, NodeIndex>,
}

impl ImageGraph {
    /// Builds the graph of every image reachable from `root`.
    #[must_use]
    pub fn from_metadata(root: &ImageMetadata) -> Self {
        let mut graph = Self::default();
        let root_idx = graph.node(root.image_ref());
        graph.add_subtree(root_idx, root);
        graph
    }

    fn node(&mut self, image: ImageRef) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(&image) {
            return idx;
        }
        let idx = self.graph.add_node(image.clone());
        let _ = self.nodes.insert(image, idx);
        idx
    }

    fn add_subtree(&mut self, parent: NodeIndex, metadata: &ImageMetadata) {
        for (_, dependency) in metadata.dependencies() {
            let child = self.node(dependency.image_ref());
            let _ = self.graph.update_edge(child, parent, ());
            self.add_subtree(child, dependency);
        }
    }

    /// Returns the number of distinct images in the graph.
    #[must_use]
    pub fn image_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns distinct images ordered so that dependencies come first.
    ///
    /// # Errors
    ///
    /// Returns [`CellsmithError::InvalidInput`] naming an image on the cycle
    /// if the graph is cyclic.
    pub fn start_order(&self) -> Result<Vec<ImageRef>> {
        petgraph::algo::toposort(&self.graph, None)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&idx| self.graph.node_weight(idx).cloned())
                    .collect()
            })
            .map_err(|cycle| {
                let image = self
                    .graph
                    .node_weight(cycle.node_id())
                    .map_or_else(String::new, ToString::to_string);
                CellsmithError::invalid_input(format!(
                    "cyclic dependency detected in image metadata involving {image}"
                ))
            })
    }
}

/// Fails if the dependency graph rooted at `root` contains a cycle.
///
/// # Errors
///
/// Returns [`CellsmithError::InvalidInput`] if an image depends on itself,
/// directly or transitively.
pub fn ensure_acyclic(root: &ImageMetadata) -> Result<()> {
    let graph = ImageGraph::from_metadata(root);
    let order = graph.start_order()?;
    tracing::debug!(images = order.len(), "image dependency graph is acyclic");
    Ok(())
}
