//! Global configuration model for Cellsmith.
//!
//! The configuration is loaded once per command and passed explicitly to
//! every component that needs it; nothing here is process-global.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{CellsmithError, Result};

/// Root configuration for Cellsmith.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellsmithConfig {
    /// Base directory for Cellsmith state and data.
    pub data_dir: PathBuf,
    /// Local repository of packaged images (`<repo>/<org>/<name>/<version>/`).
    pub repo_dir: PathBuf,
    /// Scratch directory images are extracted into.
    pub tmp_dir: PathBuf,
    /// Registry used for image tags without an explicit registry.
    pub default_registry: String,
    /// Local directory mirroring a registry; preferred over HTTP when set.
    pub registry_mirror: Option<PathBuf>,
    /// Cluster control binary.
    pub kubectl: String,
    /// Namespace instances are created in.
    pub namespace: String,
    /// Seconds to wait for an instance to become ready.
    pub readiness_timeout_secs: u64,
    /// Whether the runtime was installed with every optional capability.
    ///
    /// When set, requirement validation trusts the installation instead of
    /// probing the cluster for zero-scaling and autoscaling support.
    pub complete_setup: bool,
}

impl CellsmithConfig {
    /// Builds the default configuration rooted at `data_dir`.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            repo_dir: data_dir.join("repo"),
            tmp_dir: data_dir.join("tmp"),
            data_dir,
            default_registry: constants::DEFAULT_REGISTRY.to_string(),
            registry_mirror: None,
            kubectl: constants::DEFAULT_KUBECTL.to_string(),
            namespace: constants::DEFAULT_NAMESPACE.to_string(),
            readiness_timeout_secs: constants::DEFAULT_READINESS_TIMEOUT_SECS,
            complete_setup: false,
        }
    }

    /// Loads `config.json` from the default data directory, falling back
    /// to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&constants::default_data_dir())
    }

    /// Loads `config.json` from `data_dir`, falling back to defaults rooted
    /// at `data_dir` when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed,
    /// or if the loaded values are invalid.
    pub fn load_from(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(constants::CONFIG_FILE_NAME);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::with_data_dir(data_dir));
        }

        tracing::debug!(path = %path.display(), "loading configuration");
        let content = std::fs::read_to_string(&path).map_err(|e| CellsmithError::Io {
            path: path.clone(),
            source: e,
        })?;
        let overrides: serde_json::Value = serde_json::from_str(&content)?;
        let mut merged = serde_json::to_value(Self::with_data_dir(data_dir))?;
        if let (Some(base), serde_json::Value::Object(fields)) = (merged.as_object_mut(), overrides)
        {
            base.extend(fields);
        }
        let config: Self = serde_json::from_value(merged)?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the readiness timeout as a [`Duration`].
    #[must_use]
    pub const fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.readiness_timeout_secs == 0 {
            return Err(CellsmithError::Config {
                message: "readiness_timeout_secs must be greater than zero".into(),
            });
        }
        if self.kubectl.trim().is_empty() {
            return Err(CellsmithError::Config {
                message: "kubectl binary must not be empty".into(),
            });
        }
        Ok(())
    }
}

impl Default for CellsmithConfig {
    fn default() -> Self {
        Self::with_data_dir(constants::default_data_dir())
    }
}
