//! Backend-agnostic graphics resources
//!
//! Every GPU object the renderers touch is named by a generational id
//! ([`ShaderId`], [`TextureId`], [`RenderPassId`], [`FramebufferId`],
//! [`PipelineId`], [`DescriptorSetId`], [`CommandBufferId`], [`BufferId`])
//! and created through the [`GraphicsDevice`] factory selected at startup.
//!
//! Textures are the one resource shared across owners (GBuffer, materials,
//! descriptor sets, framebuffers), so ownership is spelled out in the type:
//! [`OwnedTexture`] is unique and consumed by destruction, [`TextureRef`] is a
//! plain non-owning reference accepted by attachments and descriptor writes.

pub mod device;
pub mod handles;
pub mod types;

pub use device::{create_device, GraphicsDevice};
pub use handles::{
    BufferId, CommandBufferId, DescriptorSetId, FramebufferId, OwnedTexture, PipelineId,
    RenderPassId, ShaderId, TextureId, TextureRef, UniformBuffer,
};
pub use types::{
    AttachmentDesc, BufferUsage, CommandBufferLevel, DescriptorWrite, DeviceCapabilities,
    Extent2D, Format, FramebufferAttachment, FramebufferDesc, LoadOp, MeshBuffers,
    RenderPassDesc, SubpassContents, TextureDesc, TextureDimension,
};

use thiserror::Error;

use crate::render::backends::vulkan::VulkanError;

/// Graphics layer errors
#[derive(Error, Debug)]
pub enum GfxError {
    /// Error reported by the Vulkan backend
    #[error(transparent)]
    Vulkan(#[from] VulkanError),

    /// A handle that was never created or has already been destroyed
    #[error("Unknown {kind} handle")]
    UnknownHandle {
        /// Resource kind of the handle
        kind: &'static str,
    },

    /// Operation not allowed in the resource's current state
    #[error("Cannot {operation} {resource} in state {state}")]
    InvalidState {
        /// Resource kind
        resource: &'static str,
        /// Current state of the resource
        state: String,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// A creation description is inconsistent
    #[error("Invalid description: {0}")]
    InvalidDescription(String),

    /// Shader code was rejected by the backend
    #[error("Shader '{name}' rejected: {reason}")]
    ShaderRejected {
        /// Program name
        name: String,
        /// Why the backend refused it
        reason: String,
    },

    /// Write or allocation outside a resource's capacity
    #[error("Out of memory: {requested} bytes requested, {available} available")]
    OutOfMemory {
        /// Bytes requested
        requested: u64,
        /// Bytes available
        available: u64,
    },

    /// A pipeline's descriptor pool has no free set left
    #[error("Descriptor pool exhausted: set {sets} requested, pool holds {capacity}")]
    DescriptorPoolExhausted {
        /// Sets the pipeline would own after the allocation
        sets: u64,
        /// Sets the pool holds
        capacity: u64,
    },

    /// Presentation surface no longer matches the swapchain
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// Backend could not be brought up
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
}

/// Result type for graphics operations
pub type GfxResult<T> = Result<T, GfxError>;
