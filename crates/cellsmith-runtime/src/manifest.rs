//! Kubernetes manifests shipped inside an image.
//!
//! Images ship their resources named after the image. Before applying, the
//! resource named after the image is renamed to the instance and annotated
//! with the image identity so the registry can report it back.

use std::path::{Path, PathBuf};

use cellsmith_common::constants;
use cellsmith_common::error::{CellsmithError, Result};
use cellsmith_common::types::ImageRef;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

/// Lists the `.yaml`/`.yml` files directly under `dir`, sorted by name.
///
/// A missing directory yields an empty list.
///
/// # Errors
///
/// Returns an I/O error if the directory exists but cannot be read.
pub fn list_manifests(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir).map_err(|e| CellsmithError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut manifests = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| CellsmithError::Io {
                path: dir.to_path_buf(),
                source: e,
            })?
            .path();
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if path.is_file() && is_yaml {
            manifests.push(path);
        }
    }
    manifests.sort();
    Ok(manifests)
}

/// Rewrites every manifest under `dir` for `instance`.
///
/// Returns the manifest paths in apply order and the number of resources
/// that were renamed.
///
/// # Errors
///
/// Returns an error if a manifest cannot be read, parsed, or written back.
pub fn rewrite_manifests(dir: &Path, image: &ImageRef, instance: &str) -> Result<(Vec<PathBuf>, usize)> {
    let manifests = list_manifests(dir)?;
    let mut renamed = 0;
    for path in &manifests {
        let content = std::fs::read_to_string(path).map_err(|e| CellsmithError::Io {
            path: path.clone(),
            source: e,
        })?;
        let (rewritten, count) = rewrite_documents(&content, image, instance)?;
        if count > 0 {
            std::fs::write(path, rewritten).map_err(|e| CellsmithError::Io {
                path: path.clone(),
                source: e,
            })?;
            renamed += count;
        }
    }
    tracing::debug!(instance, manifests = manifests.len(), renamed, "manifests rewritten");
    Ok((manifests, renamed))
}

/// Rewrites a multi-document YAML string, returning the new text and the
/// number of renamed resources.
fn rewrite_documents(content: &str, image: &ImageRef, instance: &str) -> Result<(String, usize)> {
    let mut documents = Vec::new();
    let mut renamed = 0;
    for document in serde_yaml::Deserializer::from_str(content) {
        let mut value = Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        if rename_resource(&mut value, image, instance) {
            renamed += 1;
        }
        documents.push(serde_yaml::to_string(&value)?);
    }
    Ok((documents.join("---\n"), renamed))
}

fn rename_resource(document: &mut Value, image: &ImageRef, instance: &str) -> bool {
    let Some(metadata) = document.get_mut("metadata").and_then(Value::as_mapping_mut) else {
        return false;
    };
    let named_after_image = metadata
        .get("name")
        .and_then(Value::as_str)
        .is_some_and(|name| name == image.name);
    if !named_after_image {
        return false;
    }

    let _ = metadata.insert("name".into(), instance.into());
    let annotations = metadata
        .entry("annotations".into())
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if !annotations.is_mapping() {
        *annotations = Value::Mapping(Mapping::new());
    }
    if let Some(annotations) = annotations.as_mapping_mut() {
        for (key, value) in [
            (constants::ANNOTATION_ORGANIZATION, &image.organization),
            (constants::ANNOTATION_NAME, &image.name),
            (constants::ANNOTATION_VERSION, &image.version),
        ] {
            let _ = annotations.insert(key.into(), value.as_str().into());
        }
    }
    true
}
