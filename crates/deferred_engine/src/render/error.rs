//! Renderer-level errors

use std::fmt;

use thiserror::Error;

use crate::render::gfx::GfxError;

/// Fixed-capacity resource a frame can overflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapacityKind {
    /// Objects in the dynamic model buffer
    Objects,
    /// Lights in the lighting block
    Lights,
    /// Shadow cascades in the lighting block
    ShadowMaps,
}

impl fmt::Display for CapacityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Objects => write!(f, "objects"),
            Self::Lights => write!(f, "lights"),
            Self::ShadowMaps => write!(f, "shadow maps"),
        }
    }
}

/// A request that did not fit a fixed capacity
///
/// Frames report these and continue with the clamped amount.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{requested} {what} requested, capacity is {limit}")]
pub struct CapacityError {
    /// What overflowed
    pub what: CapacityKind,
    /// Capacity
    pub limit: usize,
    /// Amount requested
    pub requested: usize,
}

impl CapacityError {
    /// Number of requested items that were dropped
    pub fn dropped(&self) -> usize {
        self.requested.saturating_sub(self.limit)
    }
}

/// Renderer errors
#[derive(Error, Debug)]
pub enum RenderError {
    /// Backend object failure
    #[error(transparent)]
    Gfx(#[from] GfxError),

    /// A fixed capacity was exceeded where clamping is not possible
    #[error("Capacity exceeded: {requested} {what} requested, limit {limit}")]
    CapacityExceeded {
        /// What overflowed
        what: CapacityKind,
        /// Capacity
        limit: usize,
        /// Amount requested
        requested: usize,
    },

    /// Rendering to the screen on a device without a swapchain
    #[error("No presentation target: the device has no swapchain and no render target is set")]
    NoPresentationTarget,

    /// Renderer configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A shader program could not be resolved
    #[error("Shader not found: {0}")]
    ShaderNotFound(String),
}

impl From<CapacityError> for RenderError {
    fn from(error: CapacityError) -> Self {
        Self::CapacityExceeded {
            what: error.what,
            limit: error.limit,
            requested: error.requested,
        }
    }
}

/// Result type for renderer operations
pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_error_converts() {
        let error = CapacityError { what: CapacityKind::Lights, limit: 32, requested: 40 };
        assert_eq!(error.dropped(), 8);
        assert_eq!(error.to_string(), "40 lights requested, capacity is 32");

        let render: RenderError = error.into();
        assert!(matches!(
            render,
            RenderError::CapacityExceeded { what: CapacityKind::Lights, limit: 32, requested: 40 }
        ));
    }
}
