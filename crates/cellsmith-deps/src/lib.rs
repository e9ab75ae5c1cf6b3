//! # cellsmith-deps
//!
//! Dependency resolution and start-up for `cellsmith run`.
//!
//! Handles:
//! - **Links**: Parsing `[parent.]alias:instance` links and checking them
//!   against the image's dependency graph and the registry.
//! - **Environment**: Parsing `[instance.]KEY=value` assignments and routing
//!   them to instances.
//! - **Tree**: Resolving every dependency alias to an instance node, sharing
//!   nodes where links or the sharing policy ask for it.
//! - **Validation**: Name/image consistency and runtime capability checks.
//! - **Activation**: Starting the tree bottom-up with one task per child.
//! - **Engine**: The end-to-end `run` flow.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod activate;
pub mod engine;
pub mod env;
pub mod link;
pub mod naming;
pub mod render;
pub mod tree;
pub mod validate;
