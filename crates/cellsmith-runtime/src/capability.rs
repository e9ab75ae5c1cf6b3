//! Optional platform capabilities an image may require.

use std::fmt;

use async_trait::async_trait;
use cellsmith_common::error::Result;

/// A platform feature that is not installed on every runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Scaling components down to zero replicas when idle.
    ZeroScaling,
    /// Horizontal autoscaling driven by resource metrics.
    Autoscaling,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroScaling => write!(f, "zero-scaling"),
            Self::Autoscaling => write!(f, "autoscaling"),
        }
    }
}

/// Queries which optional capabilities the runtime provides.
#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    /// Returns whether `capability` is enabled in the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be queried.
    async fn is_enabled(&self, capability: Capability) -> Result<bool>;
}
