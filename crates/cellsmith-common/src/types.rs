//! Domain primitive types used across the Cellsmith workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CellsmithError, Result};

/// Identity of a packaged cell image: `[registry/]org/name:version`.
///
/// Equality of two images ignores the registry they were pulled from;
/// see [`ImageRef::same_image`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    /// Registry host the image is fetched from, if given explicitly.
    pub registry: Option<String>,
    /// Owning organization.
    pub organization: String,
    /// Image name.
    pub name: String,
    /// Image version.
    pub version: String,
}

impl ImageRef {
    /// Creates an image reference without a registry.
    #[must_use]
    pub fn new(
        organization: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            registry: None,
            organization: organization.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    /// Parses an image tag of the form `[registry/]org/name:version`.
    ///
    /// # Errors
    ///
    /// Returns [`CellsmithError::InvalidInput`] if the tag has no version,
    /// no organization, or empty segments.
    pub fn parse(tag: &str) -> Result<Self> {
        let invalid = || {
            CellsmithError::invalid_input(format!(
                "invalid image tag \"{tag}\", expected [registry/]org/name:version"
            ))
        };

        let (path, version) = tag.rsplit_once(':').ok_or_else(invalid)?;
        let segments: Vec<&str> = path.split('/').collect();
        let (registry, organization, name) = match segments.as_slice() {
            [org, name] => (None, *org, *name),
            [registry, org, name] => (Some((*registry).to_string()), *org, *name),
            _ => return Err(invalid()),
        };
        if organization.is_empty() || name.is_empty() || version.is_empty() || version.contains('/')
        {
            return Err(invalid());
        }
        if registry.as_deref().is_some_and(str::is_empty) {
            return Err(invalid());
        }

        Ok(Self {
            registry,
            organization: organization.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        })
    }

    /// Returns a copy of this reference bound to the given registry.
    #[must_use]
    pub fn with_registry(mut self, registry: impl Into<String>) -> Self {
        self.registry = Some(registry.into());
        self
    }

    /// Compares organization, name, and version, ignoring the registry.
    #[must_use]
    pub fn same_image(&self, other: &Self) -> bool {
        self.organization == other.organization
            && self.name == other.name
            && self.version == other.version
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.organization, self.name, self.version)
    }
}

/// Returns whether `name` is a valid instance name: lowercase alphanumeric
/// words joined by single dashes.
#[must_use]
pub fn is_valid_instance_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .split('-')
            .all(|word| !word.is_empty() && word.chars().all(is_instance_char))
}

const fn is_instance_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit()
}
