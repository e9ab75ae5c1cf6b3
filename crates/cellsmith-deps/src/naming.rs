//! Generated instance names.

use std::collections::HashSet;

use cellsmith_common::error::{CellsmithError, Result};
use cellsmith_common::types::{ImageRef, is_valid_instance_name};

/// Length of the random hex suffix of a generated name.
const SUFFIX_LEN: usize = 8;

/// Attempts before giving up on finding an unreserved name.
const MAX_ATTEMPTS: usize = 16;

/// Generates a fresh instance name for `image` that is not in `reserved`.
///
/// Names have the form `<name>-<version>-<hex>`, with dots and slashes of
/// the name and version replaced by dashes and the result lowercased.
///
/// # Errors
///
/// Returns [`CellsmithError::InvalidInput`] if the image name cannot form a
/// valid instance name, or [`CellsmithError::Conflict`] if no unreserved
/// name was found.
pub fn generate_instance_name(image: &ImageRef, reserved: &HashSet<String>) -> Result<String> {
    let prefix = name_prefix(image);
    for _ in 0..MAX_ATTEMPTS {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let candidate = format!("{prefix}-{}", &token[..SUFFIX_LEN]);
        if !is_valid_instance_name(&candidate) {
            return Err(CellsmithError::invalid_input(format!(
                "cannot derive an instance name from image {image}, got {candidate}"
            )));
        }
        if !reserved.contains(&candidate) {
            return Ok(candidate);
        }
        tracing::debug!(candidate = %candidate, "generated instance name already reserved");
    }
    Err(CellsmithError::conflict(format!(
        "failed to generate an unused instance name for image {image}"
    )))
}

fn name_prefix(image: &ImageRef) -> String {
    format!("{}-{}", image.name, image.version)
        .to_lowercase()
        .replace(['.', '/', '_'], "-")
}
