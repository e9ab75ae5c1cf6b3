//! The metadata descriptor of a cell image.
//!
//! Every packaged image carries an `artifacts/metadata.json` describing its
//! identity, the components it contains, and for each component the images
//! it depends on, keyed by the alias the component uses to reach them.
//! Dependency images are embedded recursively.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use cellsmith_common::error::{CellsmithError, Result};
use cellsmith_common::types::ImageRef;
use serde::{Deserialize, Serialize};

/// Immutable descriptor of a cell image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    /// Owning organization.
    pub organization: String,
    /// Image name.
    pub name: String,
    /// Image version.
    pub version: String,
    /// Components keyed by component name.
    #[serde(default)]
    pub components: BTreeMap<String, ComponentMetadata>,
    /// Whether a component needs scale-to-zero support in the runtime.
    #[serde(default)]
    pub zero_scaling_required: bool,
    /// Whether a component needs horizontal autoscaling in the runtime.
    #[serde(default)]
    pub auto_scaling_required: bool,
}

/// A single component of an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentMetadata {
    /// Images this component depends on.
    #[serde(default)]
    pub dependencies: ComponentDependencies,
}

/// Dependency declarations of a component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDependencies {
    /// Dependency images keyed by alias.
    #[serde(default)]
    pub cells: BTreeMap<String, Arc<ImageMetadata>>,
}

impl ImageMetadata {
    /// Creates metadata for an image with no components.
    #[must_use]
    pub fn new(
        organization: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            organization: organization.into(),
            name: name.into(),
            version: version.into(),
            components: BTreeMap::new(),
            zero_scaling_required: false,
            auto_scaling_required: false,
        }
    }

    /// Parses a `metadata.json` document.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or identity fields are empty.
    pub fn from_json(content: &str) -> Result<Self> {
        let metadata: Self = serde_json::from_str(content)?;
        metadata.check_identity()?;
        Ok(metadata)
    }

    /// Reads and parses a `metadata.json` file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "reading image metadata");
        let content = std::fs::read_to_string(path).map_err(|e| CellsmithError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&content)
    }

    /// Returns the identity of this image.
    #[must_use]
    pub fn image_ref(&self) -> ImageRef {
        ImageRef::new(&self.organization, &self.name, &self.version)
    }

    /// Returns whether `other` describes the same organization, name, and version.
    #[must_use]
    pub fn same_image(&self, other: &Self) -> bool {
        self.organization == other.organization
            && self.name == other.name
            && self.version == other.version
    }

    /// Iterates over every `(alias, dependency)` pair of every component,
    /// in component order then alias order.
    pub fn dependencies(&self) -> impl Iterator<Item = (&str, &Arc<ImageMetadata>)> {
        self.components.values().flat_map(|component| {
            component
                .dependencies
                .cells
                .iter()
                .map(|(alias, dependency)| (alias.as_str(), dependency))
        })
    }

    /// Returns the distinct aliases declared directly by this image.
    #[must_use]
    pub fn direct_aliases(&self) -> Vec<&str> {
        let mut aliases: Vec<&str> = Vec::new();
        for (alias, _) in self.dependencies() {
            if !aliases.contains(&alias) {
                aliases.push(alias);
            }
        }
        aliases
    }

    /// Returns the dependency image declared under `alias` directly by this image.
    #[must_use]
    pub fn direct_dependency(&self, alias: &str) -> Option<&Arc<Self>> {
        self.dependencies()
            .find(|(candidate, _)| *candidate == alias)
            .map(|(_, dependency)| dependency)
    }

    /// Adds a dependency under `alias` to the named component, creating the
    /// component if needed.
    #[must_use]
    pub fn with_dependency(
        mut self,
        component: impl Into<String>,
        alias: impl Into<String>,
        dependency: Self,
    ) -> Self {
        let _ = self
            .components
            .entry(component.into())
            .or_default()
            .dependencies
            .cells
            .insert(alias.into(), Arc::new(dependency));
        self
    }

    fn check_identity(&self) -> Result<()> {
        if self.organization.is_empty() || self.name.is_empty() || self.version.is_empty() {
            return Err(CellsmithError::invalid_input(format!(
                "image metadata must declare organization, name, and version, got \"{}\"",
                self.image_ref()
            )));
        }
        self.dependencies()
            .try_for_each(|(_, dependency)| dependency.check_identity())
    }
}
