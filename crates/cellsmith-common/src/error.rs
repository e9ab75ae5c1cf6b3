//! Unified error types for the Cellsmith workspace.
//!
//! Registry lookups report a missing instance through the typed
//! [`CellsmithError::NotFound`] variant; callers probing for existence use
//! [`CellsmithError::is_not_found`] instead of inspecting messages.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum CellsmithError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// User supplied input (links, environment variables, image tags) is invalid.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Corrective message for the user.
        message: String,
    },

    /// Two parts of the dependency tree, or the tree and the runtime, disagree.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflicting state.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// The instance registry failed for a reason other than a missing resource.
    #[error("registry error: {message}")]
    Registry {
        /// Description of the failure.
        message: String,
    },

    /// The runtime lacks a capability an image hard-requires.
    #[error("requirement unmet: {message}")]
    RequirementUnmet {
        /// Description of the missing capability.
        message: String,
    },

    /// An instance failed to start.
    #[error("failed to start instance {instance}: {message}")]
    Activation {
        /// Instance that failed.
        instance: String,
        /// Description of the failure.
        message: String,
    },

    /// An instance did not become ready in time.
    #[error("instance {instance} did not become ready within {seconds}s")]
    Timeout {
        /// Instance being waited on.
        instance: String,
        /// Timeout that elapsed, in seconds.
        seconds: u64,
    },

    /// A deployment manifest could not be read or rewritten.
    #[error("manifest error: {source}")]
    Manifest {
        /// Underlying YAML error.
        #[from]
        source: serde_yaml::Error,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl CellsmithError {
    /// Returns true when this error reports a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Shorthand for an [`CellsmithError::InvalidInput`] error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Shorthand for a [`CellsmithError::Conflict`] error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CellsmithError>;
