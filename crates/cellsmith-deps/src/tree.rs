//! The dependency tree of a run.
//!
//! Nodes live in an arena and refer to their dependencies by [`NodeId`]. A
//! node reachable from several parents is stored once and referenced by id
//! from each of them; this is how shared instances are modeled. Node
//! identity is the id, never the instance name.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use cellsmith_common::error::{CellsmithError, Result};
use cellsmith_image::metadata::ImageMetadata;

use crate::link::DependencyLink;
use crate::naming;

/// Index of a node in a [`DependencyTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    /// Returns the arena index of this node.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }

    #[cfg(test)]
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index)
    }
}

/// An instance in the dependency tree.
#[derive(Debug, Clone)]
pub struct TreeNode {
    /// Instance name.
    pub instance: String,
    /// Image backing the instance.
    pub metadata: Arc<ImageMetadata>,
    /// Dependencies keyed by alias.
    pub dependencies: BTreeMap<String, NodeId>,
    /// Whether more than one alias reference resolves to this node.
    pub shared: bool,
    /// Whether the instance is already active in the registry.
    pub running: bool,
}

impl TreeNode {
    fn new(instance: impl Into<String>, metadata: Arc<ImageMetadata>, running: bool) -> Self {
        Self {
            instance: instance.into(),
            metadata,
            dependencies: BTreeMap::new(),
            shared: false,
            running,
        }
    }
}

/// Arena of instance nodes rooted at the instance being run.
#[derive(Debug, Clone)]
pub struct DependencyTree {
    nodes: Vec<TreeNode>,
    root: NodeId,
}

impl DependencyTree {
    /// Resolves the full dependency tree of `root_instance`.
    ///
    /// Every alias in the metadata graph is bound either to the first link
    /// matching it (an unanchored link, or one anchored at the current
    /// instance), to an already generated node of the same image when
    /// `share_generated` is set, or to a new node with a generated name.
    /// Nodes created for a link are reused whenever the same link key is
    /// met again.
    ///
    /// # Errors
    ///
    /// Returns [`CellsmithError::InvalidInput`] if a link is never used, or
    /// a naming error if no instance name can be generated.
    pub fn build(
        root_instance: &str,
        root_metadata: Arc<ImageMetadata>,
        links: &[DependencyLink],
        share_generated: bool,
    ) -> Result<Self> {
        let mut builder = TreeBuilder::new(root_instance, links, share_generated);
        let root = builder.push(TreeNode::new(root_instance, root_metadata, false));
        builder.expand(root)?;
        builder.check_links_used()?;

        let tree = Self {
            nodes: builder.nodes,
            root,
        };
        tracing::info!(root = root_instance, nodes = tree.len(), "dependency tree built");
        Ok(tree)
    }

    /// Builds the tree of a run that does not start dependencies: the root
    /// and one node per link, each of which must already be running.
    ///
    /// Only unanchored links or links anchored at the root are accepted,
    /// each link must name a direct alias of the root image, and every
    /// direct alias must be linked.
    ///
    /// # Errors
    ///
    /// Returns [`CellsmithError::InvalidInput`] describing the offending link
    /// or missing alias.
    pub fn build_immediate(
        root_instance: &str,
        root_metadata: Arc<ImageMetadata>,
        links: &[DependencyLink],
    ) -> Result<Self> {
        let mut nodes = vec![TreeNode::new(root_instance, Arc::clone(&root_metadata), false)];
        let root = NodeId(0);

        for link in links {
            if !link.running {
                return Err(CellsmithError::invalid_input(format!(
                    "all linked instances should be available in the runtime when running \
                     without dependencies, instance {} not available in the runtime",
                    link.target
                )));
            }
            if let Some(parent) = link.parent.as_deref().filter(|p| *p != root_instance) {
                return Err(CellsmithError::invalid_input(format!(
                    "only the main instance {root_instance} is allowed when running without \
                     starting dependencies, received unknown instance {parent}"
                )));
            }
            let Some(dependency) = root_metadata.direct_dependency(&link.alias) else {
                return Err(CellsmithError::invalid_input(format!(
                    "only aliases of the main instance {root_instance}: [{}] are allowed when \
                     running without starting dependencies, received {}",
                    root_metadata.direct_aliases().join(", "),
                    link.alias
                )));
            };
            let id = NodeId(nodes.len());
            nodes.push(TreeNode::new(&link.target, Arc::clone(dependency), true));
            let _ = nodes[root.0].dependencies.insert(link.alias.clone(), id);
        }

        for alias in root_metadata.direct_aliases() {
            if !links.iter().any(|link| link.alias == alias) {
                return Err(CellsmithError::invalid_input(format!(
                    "required link for alias {alias} in instance {root_instance} not found"
                )));
            }
        }

        tracing::info!(root = root_instance, links = links.len(), "immediate dependency tree built");
        Ok(Self { nodes, root })
    }

    /// Returns the root node id.
    #[must_use]
    pub const fn root(&self) -> NodeId {
        self.root
    }

    /// Returns the node with the given id.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this tree.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id.0]
    }

    /// Returns the number of distinct nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns whether the tree has no nodes. A built tree always has a root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates over every distinct node with its id, in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &TreeNode)> {
        self.nodes.iter().enumerate().map(|(i, node)| (NodeId(i), node))
    }

    /// Returns the id of the node carrying `instance`, if any.
    #[must_use]
    pub fn find(&self, instance: &str) -> Option<NodeId> {
        self.iter()
            .find(|(_, node)| node.instance == instance)
            .map(|(id, _)| id)
    }

    /// Marks a node as running.
    pub fn mark_running(&mut self, id: NodeId) {
        self.nodes[id.0].running = true;
    }

    /// Visits nodes depth-first, pre-order, following aliases in order.
    /// A node shared by several parents is visited once per reference.
    pub fn walk<F>(&self, mut visit: F)
    where
        F: FnMut(Option<&str>, NodeId, usize),
    {
        self.walk_from(None, self.root, 0, &mut visit);
    }

    fn walk_from<F>(&self, alias: Option<&str>, id: NodeId, depth: usize, visit: &mut F)
    where
        F: FnMut(Option<&str>, NodeId, usize),
    {
        visit(alias, id, depth);
        for (child_alias, child) in &self.node(id).dependencies {
            self.walk_from(Some(child_alias), *child, depth + 1, visit);
        }
    }

    /// Assembles a tree directly from nodes. `nodes[0]` is the root.
    #[cfg(test)]
    pub(crate) fn from_nodes(nodes: Vec<TreeNode>) -> Self {
        Self {
            nodes,
            root: NodeId(0),
        }
    }
}

/// Link bookkeeping key: the anchoring parent (if any) and the alias.
type LinkKey = (Option<String>, String);

struct TreeBuilder<'a> {
    nodes: Vec<TreeNode>,
    links: &'a [DependencyLink],
    share_generated: bool,
    link_nodes: HashMap<LinkKey, NodeId>,
    generated: Vec<NodeId>,
    used_links: Vec<&'a DependencyLink>,
    expanded: HashSet<NodeId>,
    reserved: HashSet<String>,
}

impl<'a> TreeBuilder<'a> {
    fn new(root_instance: &str, links: &'a [DependencyLink], share_generated: bool) -> Self {
        let mut reserved: HashSet<String> = links.iter().map(|l| l.target.clone()).collect();
        let _ = reserved.insert(root_instance.to_string());
        Self {
            nodes: Vec::new(),
            links,
            share_generated,
            link_nodes: HashMap::new(),
            generated: Vec::new(),
            used_links: Vec::new(),
            expanded: HashSet::new(),
            reserved,
        }
    }

    fn push(&mut self, node: TreeNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        let _ = self.reserved.insert(node.instance.clone());
        self.nodes.push(node);
        id
    }

    fn expand(&mut self, id: NodeId) -> Result<()> {
        if !self.expanded.insert(id) {
            return Ok(());
        }
        let instance = self.nodes[id.0].instance.clone();
        let metadata = Arc::clone(&self.nodes[id.0].metadata);

        for (alias, dependency) in metadata.dependencies() {
            let child = match self.nodes[id.0].dependencies.get(alias) {
                Some(existing) => *existing,
                None => self.resolve(&instance, alias, dependency)?,
            };
            let _ = self.nodes[id.0]
                .dependencies
                .insert(alias.to_string(), child);
            self.expand(child)?;
        }
        Ok(())
    }

    fn resolve(
        &mut self,
        instance: &str,
        alias: &str,
        dependency: &Arc<ImageMetadata>,
    ) -> Result<NodeId> {
        let links = self.links;
        if let Some(link) = links.iter().find(|link| link.matches(instance, alias)) {
            let key = (link.parent.clone(), link.alias.clone());
            if let Some(&id) = self.link_nodes.get(&key) {
                self.nodes[id.0].shared = true;
                tracing::debug!(instance, alias, dependency = %link.target, "reusing linked instance");
                return Ok(id);
            }
            // Another link naming the same instance and image binds the same node.
            let same_target = self.link_nodes.values().copied().find(|id| {
                let node = &self.nodes[id.0];
                node.instance == link.target && node.metadata.same_image(dependency)
            });
            if let Some(id) = same_target {
                self.nodes[id.0].shared = true;
                let _ = self.link_nodes.insert(key, id);
                self.used_links.push(link);
                tracing::debug!(instance, alias, dependency = %link.target, "reusing linked instance");
                return Ok(id);
            }
            let id = self.push(TreeNode::new(&link.target, Arc::clone(dependency), link.running));
            let _ = self.link_nodes.insert(key, id);
            self.used_links.push(link);
            tracing::debug!(instance, alias, dependency = %link.target, "linked instance");
            return Ok(id);
        }

        if self.share_generated {
            let existing = self
                .generated
                .iter()
                .copied()
                .find(|id| self.nodes[id.0].metadata.same_image(dependency));
            if let Some(id) = existing {
                self.nodes[id.0].shared = true;
                tracing::debug!(instance, alias, dependency = %self.nodes[id.0].instance, "sharing generated instance");
                return Ok(id);
            }
        }

        let name = naming::generate_instance_name(&dependency.image_ref(), &self.reserved)?;
        tracing::debug!(instance, alias, dependency = %name, "generated instance");
        let id = self.push(TreeNode::new(name, Arc::clone(dependency), false));
        self.generated.push(id);
        Ok(id)
    }

    fn check_links_used(&self) -> Result<()> {
        for link in self.links {
            if !self.used_links.iter().any(|used| used.same_binding(link)) {
                return Err(CellsmithError::invalid_input(format!(
                    "unused links should not be provided, link {link} is not used"
                )));
            }
        }
        Ok(())
    }
}
