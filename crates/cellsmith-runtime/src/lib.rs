//! Cluster-facing side of Cellsmith.
//!
//! The cluster is seen through two traits: [`registry::InstanceRegistry`]
//! (look up, create, and await instances) and
//! [`capability::CapabilityProbe`] (optional platform features). The
//! `kubectl` module implements both by shelling out to the cluster control
//! tool. [`starter::ImageStarter`] performs the per-instance start-up.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capability;
pub mod kubectl;
pub mod manifest;
pub mod registry;
pub mod starter;
