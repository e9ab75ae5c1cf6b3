//! Registry source protocols used when pulling images.
//!
//! A registry is reached either through a local mirror directory laid out
//! like the local repository, or over HTTP(S).

use std::io::Write;
use std::path::{Path, PathBuf};

use cellsmith_common::constants;
use cellsmith_common::error::{CellsmithError, Result};
use cellsmith_common::types::ImageRef;

/// Where an image archive is fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Archive inside a local mirror directory.
    Mirror(PathBuf),
    /// Archive served by an HTTP(S) registry.
    Remote {
        /// URL of the archive.
        url: String,
    },
}

/// Returns the archive path of `image` relative to a repository root:
/// `<org>/<name>/<version>/<name>.tar.gz`.
#[must_use]
pub fn archive_relative_path(image: &ImageRef) -> PathBuf {
    PathBuf::from(&image.organization)
        .join(&image.name)
        .join(&image.version)
        .join(format!("{}{}", image.name, constants::IMAGE_ARCHIVE_EXTENSION))
}

/// Resolves where `image` should be pulled from.
///
/// A configured mirror takes precedence. Otherwise the image's registry
/// (or `default_registry`) is contacted over HTTPS unless it already
/// carries a scheme.
#[must_use]
pub fn resolve_source(image: &ImageRef, default_registry: &str, mirror: Option<&Path>) -> ImageSource {
    if let Some(mirror) = mirror {
        return ImageSource::Mirror(mirror.join(archive_relative_path(image)));
    }

    let registry = image.registry.as_deref().unwrap_or(default_registry);
    let base = if registry.starts_with("http://") || registry.starts_with("https://") {
        registry.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", registry.trim_end_matches('/'))
    };
    ImageSource::Remote {
        url: format!(
            "{base}/v1/images/{}/{}/{}/{}{}",
            image.organization,
            image.name,
            image.version,
            image.name,
            constants::IMAGE_ARCHIVE_EXTENSION
        ),
    }
}

/// Fetches the archive described by `source` into `destination`.
///
/// # Errors
///
/// Returns [`CellsmithError::NotFound`] if the mirror or registry does not
/// have the image, or an I/O / registry error if the transfer fails.
pub fn fetch(source: &ImageSource, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CellsmithError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    match source {
        ImageSource::Mirror(path) => {
            if !path.exists() {
                return Err(CellsmithError::NotFound {
                    kind: "image archive",
                    id: path.display().to_string(),
                });
            }
            tracing::info!(from = %path.display(), "copying image from mirror");
            let _ = std::fs::copy(path, destination).map_err(|e| CellsmithError::Io {
                path: path.clone(),
                source: e,
            })?;
            Ok(())
        }
        ImageSource::Remote { url } => {
            tracing::info!(url = %url, "downloading image");
            let response = reqwest::blocking::get(url).map_err(|e| CellsmithError::Registry {
                message: format!("failed to download {url}: {e}"),
            })?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(CellsmithError::NotFound {
                    kind: "image",
                    id: url.clone(),
                });
            }
            let response = response.error_for_status().map_err(|e| CellsmithError::Registry {
                message: format!("failed to download {url}: {e}"),
            })?;
            let bytes = response.bytes().map_err(|e| CellsmithError::Registry {
                message: format!("failed to read {url}: {e}"),
            })?;
            let mut file = std::fs::File::create(destination).map_err(|e| CellsmithError::Io {
                path: destination.to_path_buf(),
                source: e,
            })?;
            file.write_all(&bytes).map_err(|e| CellsmithError::Io {
                path: destination.to_path_buf(),
                source: e,
            })
        }
    }
}
