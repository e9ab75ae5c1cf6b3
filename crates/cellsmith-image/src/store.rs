//! The local image repository.
//!
//! Packaged images live under `<repo>/<org>/<name>/<version>/<name>.tar.gz`.
//! Extraction unpacks an image into a fresh scratch directory that is
//! removed when the returned [`ExtractedImage`] is dropped.

use std::path::{Path, PathBuf};

use cellsmith_common::config::CellsmithConfig;
use cellsmith_common::constants;
use cellsmith_common::error::{CellsmithError, Result};
use cellsmith_common::types::ImageRef;

use crate::metadata::ImageMetadata;
use crate::source;

/// An image unpacked into a scratch directory.
#[derive(Debug)]
pub struct ExtractedImage {
    dir: tempfile::TempDir,
    /// Metadata read from the image.
    pub metadata: ImageMetadata,
}

impl ExtractedImage {
    /// Returns the directory the image was unpacked into.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Access to packaged images.
pub trait ImageStore: Send + Sync {
    /// Fetches `image` into the local repository if it is not already there.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be fetched.
    fn pull(&self, image: &ImageRef) -> Result<()>;

    /// Pulls `image` if absent, unpacks it, and reads its metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be pulled, unpacked, or its
    /// metadata is missing or malformed.
    fn extract(&self, image: &ImageRef) -> Result<ExtractedImage>;
}

/// Image store backed by a repository directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalImageStore {
    repo_dir: PathBuf,
    tmp_dir: PathBuf,
    default_registry: String,
    mirror: Option<PathBuf>,
}

impl LocalImageStore {
    /// Creates a store using the repository, scratch, and registry settings
    /// of `config`.
    #[must_use]
    pub fn new(config: &CellsmithConfig) -> Self {
        Self {
            repo_dir: config.repo_dir.clone(),
            tmp_dir: config.tmp_dir.clone(),
            default_registry: config.default_registry.clone(),
            mirror: config.registry_mirror.clone(),
        }
    }

    /// Returns the repository path of `image`'s archive.
    #[must_use]
    pub fn archive_path(&self, image: &ImageRef) -> PathBuf {
        self.repo_dir.join(source::archive_relative_path(image))
    }

    /// Returns whether `image` is present in the local repository.
    #[must_use]
    pub fn contains(&self, image: &ImageRef) -> bool {
        self.archive_path(image).exists()
    }
}

impl ImageStore for LocalImageStore {
    fn pull(&self, image: &ImageRef) -> Result<()> {
        if self.contains(image) {
            tracing::debug!(image = %image, "image already present locally");
            return Ok(());
        }
        let source = source::resolve_source(image, &self.default_registry, self.mirror.as_deref());
        source::fetch(&source, &self.archive_path(image))?;
        tracing::info!(image = %image, "image pulled");
        Ok(())
    }

    fn extract(&self, image: &ImageRef) -> Result<ExtractedImage> {
        self.pull(image)?;

        std::fs::create_dir_all(&self.tmp_dir).map_err(|e| CellsmithError::Io {
            path: self.tmp_dir.clone(),
            source: e,
        })?;
        let dir = tempfile::Builder::new()
            .prefix("cell-image-")
            .tempdir_in(&self.tmp_dir)
            .map_err(|e| CellsmithError::Io {
                path: self.tmp_dir.clone(),
                source: e,
            })?;

        let _ = crate::archive::extract_archive(&self.archive_path(image), dir.path())?;
        let metadata = ImageMetadata::load(&dir.path().join(constants::METADATA_FILE))?;
        if !metadata.image_ref().same_image(image) {
            return Err(CellsmithError::conflict(format!(
                "archive for {image} declares image {}",
                metadata.image_ref()
            )));
        }
        tracing::debug!(image = %image, dir = %dir.path().display(), "image extracted");

        Ok(ExtractedImage { dir, metadata })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_image(root: &Path, image: &ImageRef, metadata_json: &str) {
        let path = root.join(source::archive_relative_path(image));
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        let file = std::fs::File::create(&path).expect("create archive");
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let data = metadata_json.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, constants::METADATA_FILE, data)
            .expect("append");
        let encoder = builder.into_inner().expect("finish tar");
        let _ = encoder.finish().expect("finish gzip");
    }

    fn store(dir: &Path, mirror: Option<PathBuf>) -> LocalImageStore {
        let mut config = CellsmithConfig::with_data_dir(dir);
        config.registry_mirror = mirror;
        LocalImageStore::new(&config)
    }

    #[test]
    fn extract_local_image_reads_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path(), None);
        let image = ImageRef::new("myorg", "hr", "1.0.0");
        write_image(
            &dir.path().join("repo"),
            &image,
            r#"{"organization":"myorg","name":"hr","version":"1.0.0"}"#,
        );

        let extracted = store.extract(&image).expect("extract");
        assert_eq!(extracted.metadata.image_ref(), image);
        assert!(extracted.path().join(constants::METADATA_FILE).exists());
    }

    #[test]
    fn extracted_directory_is_removed_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path(), None);
        let image = ImageRef::new("myorg", "hr", "1.0.0");
        write_image(
            &dir.path().join("repo"),
            &image,
            r#"{"organization":"myorg","name":"hr","version":"1.0.0"}"#,
        );

        let extracted = store.extract(&image).expect("extract");
        let path = extracted.path().to_path_buf();
        drop(extracted);
        assert!(!path.exists());
    }

    #[test]
    fn extract_pulls_missing_image_from_mirror() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mirror = dir.path().join("mirror");
        let image = ImageRef::new("myorg", "stock", "2.0");
        write_image(
            &mirror,
            &image,
            r#"{"organization":"myorg","name":"stock","version":"2.0"}"#,
        );
        let store = store(dir.path(), Some(mirror));

        assert!(!store.contains(&image));
        let extracted = store.extract(&image).expect("extract");
        assert!(store.contains(&image));
        assert_eq!(extracted.metadata.name, "stock");
    }

    #[test]
    fn extract_rejects_mismatched_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path(), None);
        let image = ImageRef::new("myorg", "hr", "1.0.0");
        write_image(
            &dir.path().join("repo"),
            &image,
            r#"{"organization":"myorg","name":"hr","version":"9.9.9"}"#,
        );
        assert!(store.extract(&image).is_err());
    }

    #[test]
    fn pull_absent_image_without_source_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path(), Some(dir.path().join("empty-mirror")));
        let err = store
            .pull(&ImageRef::new("myorg", "absent", "1.0"))
            .expect_err("should fail");
        assert!(err.is_not_found());
    }
}
