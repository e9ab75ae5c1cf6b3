//! Presentation data for confirming a dependency tree.

use std::collections::HashSet;
use std::fmt;

use crate::tree::{DependencyTree, NodeId};

/// Whether a row's instance exists already or is about to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsedInstance {
    /// The instance is already running in the runtime.
    Available,
    /// The instance will be created by this run.
    ToBeCreated,
}

impl fmt::Display for UsedInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "Available in Runtime"),
            Self::ToBeCreated => write!(f, "To be Created"),
        }
    }
}

/// One row of the instances table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRow {
    /// Instance name.
    pub instance: String,
    /// Image in `org/name:version` form.
    pub image: String,
    /// Whether the instance is reused or created.
    pub used: UsedInstance,
    /// Whether several aliases resolve to the instance.
    pub shared: bool,
}

/// Lists each instance once, dependencies before their dependents, with
/// the root last. Subtrees below running instances are not listed.
#[must_use]
pub fn instance_rows(tree: &DependencyTree) -> Vec<InstanceRow> {
    let mut rows = Vec::new();
    let mut seen = HashSet::new();
    collect_rows(tree, tree.root(), &mut rows, &mut seen);

    let root = tree.node(tree.root());
    rows.push(InstanceRow {
        instance: root.instance.clone(),
        image: root.metadata.image_ref().to_string(),
        used: UsedInstance::ToBeCreated,
        shared: false,
    });
    rows
}

fn collect_rows(
    tree: &DependencyTree,
    id: NodeId,
    rows: &mut Vec<InstanceRow>,
    seen: &mut HashSet<String>,
) {
    for child in tree.node(id).dependencies.values() {
        let node = tree.node(*child);
        if !node.running {
            collect_rows(tree, *child, rows, seen);
        }
        if seen.insert(node.instance.clone()) {
            rows.push(InstanceRow {
                instance: node.instance.clone(),
                image: node.metadata.image_ref().to_string(),
                used: if node.running {
                    UsedInstance::Available
                } else {
                    UsedInstance::ToBeCreated
                },
                shared: node.shared,
            });
        }
    }
}

/// Draws the alias tree below the root, one line per alias reference.
///
/// The first line is the root instance, or `No Dependencies` when the root
/// has none. Running instances are shown but not expanded.
#[must_use]
pub fn tree_lines(tree: &DependencyTree) -> Vec<String> {
    let root = tree.node(tree.root());
    if root.dependencies.is_empty() {
        return vec!["No Dependencies".to_string()];
    }
    let mut lines = vec![root.instance.clone()];
    draw_subtree(tree, tree.root(), "", &mut lines);
    lines
}

fn draw_subtree(tree: &DependencyTree, id: NodeId, prefix: &str, lines: &mut Vec<String>) {
    let dependencies = &tree.node(id).dependencies;
    for (index, (alias, child)) in dependencies.iter().enumerate() {
        let last = index + 1 == dependencies.len();
        let node = tree.node(*child);
        let branch = if last { "└──" } else { "├──" };
        lines.push(format!("{prefix}{branch} {alias}: {}", node.instance));
        if !node.running {
            let nested = format!("{prefix}{}", if last { "    " } else { "│   " });
            draw_subtree(tree, *child, &nested, lines);
        }
    }
}
