//! System-wide constants and default paths.

use std::path::PathBuf;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CELLSMITH_DATA_DIR";

/// Name of the data directory created under the user's home.
pub const DATA_DIR_NAME: &str = ".cellsmith";

/// Fallback data directory when no home directory is available.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/cellsmith";

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Default registry host for image tags without an explicit registry.
pub const DEFAULT_REGISTRY: &str = "registry.cellsmith.io";

/// Default Kubernetes namespace instances are created in.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default cluster control binary.
pub const DEFAULT_KUBECTL: &str = "kubectl";

/// Default time to wait for an instance to become ready (30 minutes).
pub const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 30 * 60;

/// File extension of packaged cell images in the local repository.
pub const IMAGE_ARCHIVE_EXTENSION: &str = ".tar.gz";

/// Path of the metadata descriptor inside an extracted image.
pub const METADATA_FILE: &str = "artifacts/metadata.json";

/// Directory holding deployment manifests inside an extracted image.
pub const MANIFEST_DIR: &str = "artifacts/manifests";

/// Optional executable run before an instance's manifests are applied.
pub const RUN_HOOK: &str = "hooks/run";

/// Instance status reported by the registry once an instance is serving.
pub const READY_STATUS: &str = "Ready";

/// Annotation carrying the image organization on a deployed instance.
pub const ANNOTATION_ORGANIZATION: &str = "cellsmith.io/image-org";
/// Annotation carrying the image name on a deployed instance.
pub const ANNOTATION_NAME: &str = "cellsmith.io/image-name";
/// Annotation carrying the image version on a deployed instance.
pub const ANNOTATION_VERSION: &str = "cellsmith.io/image-version";

/// Kubernetes resource type of deployed cell instances.
pub const CELL_RESOURCE: &str = "cells.mesh.cellsmith.io";

/// Application name used in CLI output.
pub const APP_NAME: &str = "cellsmith";

/// Returns the data directory: `$CELLSMITH_DATA_DIR`, else `$HOME/.cellsmith`,
/// else [`SYSTEM_DATA_DIR`].
#[must_use]
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_or_else(
            |_| PathBuf::from(SYSTEM_DATA_DIR),
            |home| PathBuf::from(home).join(DATA_DIR_NAME),
        )
}
