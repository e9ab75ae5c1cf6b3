//! Dependency links supplied on the command line.
//!
//! A link binds a dependency alias to a concrete instance:
//!
//! ```text
//! [parent-instance.]alias:instance
//! ```
//!
//! Without a parent the link is unanchored and applies wherever the alias
//! appears in the dependency graph.

use std::fmt;

use cellsmith_common::error::{CellsmithError, Result};
use cellsmith_common::types::ImageRef;
use cellsmith_image::metadata::ImageMetadata;
use cellsmith_runtime::registry::{InstanceRegistry, instance_ready};
use nom::{
    IResult, Parser,
    bytes::complete::take_while1,
    character::complete::char,
    combinator::{all_consuming, opt, recognize},
    multi::separated_list1,
    sequence::terminated,
};

/// A parsed `[parent.]alias:target` link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyLink {
    /// Instance whose dependency is being linked; `None` when unanchored.
    pub parent: Option<String>,
    /// Dependency alias being satisfied.
    pub alias: String,
    /// Instance that satisfies the alias.
    pub target: String,
    /// Whether `target` is already running and ready in the registry.
    pub running: bool,
}

impl DependencyLink {
    /// Parses a link string.
    ///
    /// # Errors
    ///
    /// Returns [`CellsmithError::InvalidInput`] if the string does not match
    /// `[parent.]alias:instance`.
    pub fn parse(input: &str) -> Result<Self> {
        let (_, (parent, alias, target)) = all_consuming(link).parse(input).map_err(|_| {
            CellsmithError::invalid_input(format!(
                "invalid link \"{input}\", expected [<parent-instance>.]<alias>:<instance> \
                 where instance names are lowercase alphanumeric words joined by dashes"
            ))
        })?;
        Ok(Self {
            parent: parent.map(str::to_string),
            alias: alias.to_string(),
            target: target.to_string(),
            running: false,
        })
    }

    /// Returns whether this link is scoped to a parent instance.
    #[must_use]
    pub const fn is_anchored(&self) -> bool {
        self.parent.is_some()
    }

    /// Returns whether this link applies to `alias` under `instance`.
    #[must_use]
    pub fn matches(&self, instance: &str, alias: &str) -> bool {
        self.alias == alias && self.parent.as_deref().is_none_or(|parent| parent == instance)
    }

    /// Returns whether two links carry the same parent, alias, and target.
    #[must_use]
    pub fn same_binding(&self, other: &Self) -> bool {
        self.parent == other.parent && self.alias == other.alias && self.target == other.target
    }
}

impl fmt::Display for DependencyLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = &self.parent {
            write!(f, "{parent}.")?;
        }
        write!(f, "{}:{}", self.alias, self.target)
    }
}

const fn is_instance_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit()
}

const fn is_alias_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Instance names: lowercase alphanumeric words joined by single dashes.
pub(crate) fn instance_name(input: &str) -> IResult<&str, &str> {
    recognize(separated_list1(char('-'), take_while1(is_instance_char))).parse(input)
}

/// Optional `instance.` scope prefix shared by links and env assignments.
pub(crate) fn scope(input: &str) -> IResult<&str, Option<&str>> {
    opt(terminated(instance_name, char('.'))).parse(input)
}

fn link(input: &str) -> IResult<&str, (Option<&str>, &str, &str)> {
    (
        scope,
        terminated(take_while1(is_alias_char), char(':')),
        instance_name,
    )
        .parse(input)
}

/// Parses every link string, failing on the first malformed one.
///
/// # Errors
///
/// Returns [`CellsmithError::InvalidInput`] for a malformed link.
pub fn parse_links<S: AsRef<str>>(inputs: &[S]) -> Result<Vec<DependencyLink>> {
    inputs
        .iter()
        .map(|input| DependencyLink::parse(input.as_ref()))
        .collect()
}

/// Records for each link whether its target is running and ready.
///
/// # Errors
///
/// Propagates registry failures other than not-found.
pub async fn probe_links(registry: &dyn InstanceRegistry, links: &mut [DependencyLink]) -> Result<()> {
    for link in links.iter_mut() {
        link.running = instance_ready(registry, &link.target).await?;
        tracing::debug!(link = %link, running = link.running, "probed link target");
    }
    Ok(())
}

/// An unanchored link that will be shared by several occurrences of its alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedAliasWarning {
    /// Alias occurring more than once in the dependency graph.
    pub alias: String,
    /// Instance all occurrences will share.
    pub instance: String,
}

impl fmt::Display for SharedAliasWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "using a shared instance {} for duplicated alias {}",
            self.instance, self.alias
        )
    }
}

/// Checks links against the root image's dependency graph before any tree
/// is built.
///
/// An unanchored alias occurring more than once must refer to the same image
/// everywhere; such links are returned as warnings. An anchored link's
/// parent must be the root instance or the target of another link.
///
/// # Errors
///
/// Returns [`CellsmithError::InvalidInput`] describing the first offending link.
pub fn validate_links(
    root_instance: &str,
    root_metadata: &ImageMetadata,
    links: &[DependencyLink],
) -> Result<Vec<SharedAliasWarning>> {
    let mut warnings: Vec<SharedAliasWarning> = Vec::new();
    for link in links {
        match &link.parent {
            None => {
                let mut first: Option<ImageRef> = None;
                let mut duplicated = false;
                check_alias_images(root_metadata, &link.alias, &mut first, &mut duplicated)?;
                let already_warned = warnings.iter().any(|w| w.alias == link.alias);
                if duplicated && !already_warned {
                    warnings.push(SharedAliasWarning {
                        alias: link.alias.clone(),
                        instance: link.target.clone(),
                    });
                }
            }
            Some(parent) => {
                let provided =
                    parent == root_instance || links.iter().any(|other| &other.target == parent);
                if !provided {
                    return Err(CellsmithError::invalid_input(format!(
                        "all parent instances of the provided links should be explicitly given \
                         as an instance of another alias, instance {parent} not provided"
                    )));
                }
            }
        }
    }
    Ok(warnings)
}

/// Walks the metadata graph recording the image behind every occurrence of
/// `alias`, failing once two occurrences disagree.
fn check_alias_images(
    metadata: &ImageMetadata,
    alias: &str,
    first: &mut Option<ImageRef>,
    duplicated: &mut bool,
) -> Result<()> {
    for (candidate, dependency) in metadata.dependencies() {
        if candidate == alias {
            let image = dependency.image_ref();
            match first {
                None => *first = Some(image),
                Some(existing) if existing.same_image(&image) => *duplicated = true,
                Some(existing) => {
                    return Err(CellsmithError::invalid_input(format!(
                        "duplicated alias {alias} in dependency tree refers to different images \
                         {existing} and {image}, links for duplicated aliases should name the \
                         parent instance"
                    )));
                }
            }
        }
        check_alias_images(dependency, alias, first, duplicated)?;
    }
    Ok(())
}
