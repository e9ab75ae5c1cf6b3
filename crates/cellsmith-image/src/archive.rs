//! Extraction of packaged cell images.
//!
//! Images are stored as gzip-compressed tar archives; plain `.tar` files are
//! accepted as well.

use std::path::Path;

use cellsmith_common::error::{CellsmithError, Result};

/// Extracts an image archive into `target`, returning the archive size in bytes.
///
/// # Errors
///
/// Returns an error if the archive cannot be opened or unpacked.
pub fn extract_archive(archive_path: &Path, target: &Path) -> Result<u64> {
    tracing::debug!(
        archive = %archive_path.display(),
        target = %target.display(),
        "extracting image archive"
    );

    std::fs::create_dir_all(target).map_err(|e| CellsmithError::Io {
        path: target.to_path_buf(),
        source: e,
    })?;

    let file = std::fs::File::open(archive_path).map_err(|e| CellsmithError::Io {
        path: archive_path.to_path_buf(),
        source: e,
    })?;
    let size_bytes = file
        .metadata()
        .map_err(|e| CellsmithError::Io {
            path: archive_path.to_path_buf(),
            source: e,
        })?
        .len();

    let unpacked = if is_gzip_archive(archive_path) {
        tar::Archive::new(flate2::read::GzDecoder::new(file)).unpack(target)
    } else {
        tar::Archive::new(file).unpack(target)
    };
    unpacked.map_err(|e| CellsmithError::Io {
        path: target.to_path_buf(),
        source: e,
    })?;

    Ok(size_bytes)
}

/// Determines whether the archive is gzip-compressed based on extension.
fn is_gzip_archive(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("tgz"))
}
