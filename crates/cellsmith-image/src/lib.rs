//! # cellsmith-image
//!
//! Cell image handling for Cellsmith.
//!
//! Handles:
//! - **Metadata**: The `metadata.json` descriptor shipped inside every image,
//!   including the recursive alias map of dependency images.
//! - **Graph**: Cycle detection over the image dependency graph.
//! - **Archive**: Extraction of packaged `.tar.gz` images.
//! - **Source**: Mirror directory and HTTP registry sources for pulling.
//! - **Store**: The local image repository (pull if absent, extract, read metadata).

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod archive;
pub mod graph;
pub mod metadata;
pub mod source;
pub mod store;
