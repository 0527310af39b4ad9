//! Descriptions passed to the device factory

use super::handles::{BufferId, RenderPassId, TextureRef};
use super::{GfxError, GfxResult};
use crate::core::GraphicsApi;

/// Texel formats used by render targets and sampled textures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// 8-bit normalized RGBA
    Rgba8Unorm,
    /// 16-bit float RGBA
    Rgba16Float,
    /// 32-bit float RGBA
    Rgba32Float,
    /// 32-bit float depth
    Depth32Float,
    /// Whatever format the presentation surface uses
    Presentation,
}

impl Format {
    /// Whether this is a depth format
    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float)
    }

    /// Bytes per texel when known up front
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Presentation | Self::Depth32Float => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }
}

/// Shape of a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureDimension {
    /// Single 2D image
    D2,
    /// Six square faces
    Cube,
    /// Layered 2D image, used for shadow cascades
    D2Array {
        /// Number of layers
        layers: u32,
    },
}

/// Texture creation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    /// Debug label
    pub label: String,
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Texel format
    pub format: Format,
    /// Shape
    pub dimension: TextureDimension,
    /// Whether the texture can be a framebuffer attachment
    pub render_target: bool,
}

impl TextureDesc {
    /// Sampled 2D texture filled from CPU data
    pub fn sampled_2d(label: impl Into<String>, width: u32, height: u32, format: Format) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            format,
            dimension: TextureDimension::D2,
            render_target: false,
        }
    }

    /// 2D texture usable as an attachment and sampled afterwards
    pub fn render_target(label: impl Into<String>, width: u32, height: u32, format: Format) -> Self {
        Self {
            render_target: true,
            ..Self::sampled_2d(label, width, height, format)
        }
    }

    /// Sampled cube map
    pub fn cube(label: impl Into<String>, size: u32, format: Format) -> Self {
        Self {
            dimension: TextureDimension::Cube,
            ..Self::sampled_2d(label, size, size, format)
        }
    }

    /// Layered depth target, one layer per shadow cascade
    pub fn depth_array(label: impl Into<String>, size: u32, layers: u32) -> Self {
        Self {
            dimension: TextureDimension::D2Array { layers },
            render_target: true,
            ..Self::sampled_2d(label, size, size, Format::Depth32Float)
        }
    }

    /// Number of array layers
    pub fn layer_count(&self) -> u32 {
        match self.dimension {
            TextureDimension::D2 => 1,
            TextureDimension::Cube => 6,
            TextureDimension::D2Array { layers } => layers,
        }
    }

    /// Size in bytes of a full upload for this texture
    pub fn data_size(&self) -> usize {
        self.width as usize
            * self.height as usize
            * self.layer_count() as usize
            * self.format.bytes_per_texel() as usize
    }

    /// Check the description and optional initial data against each other
    pub fn validate(&self, data: Option<&[u8]>) -> GfxResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(GfxError::InvalidDescription(format!(
                "texture '{}' has zero extent {}x{}",
                self.label, self.width, self.height
            )));
        }
        if self.layer_count() == 0 {
            return Err(GfxError::InvalidDescription(format!("texture '{}' has no layers", self.label)));
        }
        if self.dimension == TextureDimension::Cube && self.width != self.height {
            return Err(GfxError::InvalidDescription(format!(
                "cube texture '{}' must be square",
                self.label
            )));
        }
        if let Some(bytes) = data {
            if self.format.is_depth() {
                return Err(GfxError::InvalidDescription(format!(
                    "depth texture '{}' cannot be initialised from data",
                    self.label
                )));
            }
            if bytes.len() != self.data_size() {
                return Err(GfxError::InvalidDescription(format!(
                    "texture '{}' expects {} bytes of data, got {}",
                    self.label,
                    self.data_size(),
                    bytes.len()
                )));
            }
        }
        Ok(())
    }
}

/// What happens to an attachment's contents when a pass begins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOp {
    /// Clear to the pass clear value
    Clear,
    /// Keep what a previous pass wrote
    Load,
}

/// One render pass attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDesc {
    /// Format of the attached image
    pub format: Format,
    /// Load behaviour
    pub load: LoadOp,
}

impl AttachmentDesc {
    /// Cleared colour attachment
    pub fn colour(format: Format) -> Self {
        Self { format, load: LoadOp::Clear }
    }

    /// Depth attachment with the given load behaviour
    pub fn depth(load: LoadOp) -> Self {
        Self { format: Format::Depth32Float, load }
    }
}

/// Render pass creation parameters: colour attachments first, optional depth last
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPassDesc {
    /// Debug label
    pub label: String,
    /// Attachments in framebuffer order
    pub attachments: Vec<AttachmentDesc>,
}

impl RenderPassDesc {
    /// Number of colour attachments
    pub fn colour_count(&self) -> usize {
        self.attachments.iter().filter(|a| !a.format.is_depth()).count()
    }

    /// Whether the last attachment is a depth attachment
    pub fn has_depth(&self) -> bool {
        self.attachments.last().is_some_and(|a| a.format.is_depth())
    }

    /// Check attachment ordering
    pub fn validate(&self, max_color_attachments: u32) -> GfxResult<()> {
        if self.attachments.is_empty() {
            return Err(GfxError::InvalidDescription(format!("render pass '{}' has no attachments", self.label)));
        }
        let depth_count = self.attachments.iter().filter(|a| a.format.is_depth()).count();
        if depth_count > 1 || (depth_count == 1 && !self.has_depth()) {
            return Err(GfxError::InvalidDescription(format!(
                "render pass '{}' must have at most one depth attachment, placed last",
                self.label
            )));
        }
        if self.colour_count() > max_color_attachments as usize {
            return Err(GfxError::InvalidDescription(format!(
                "render pass '{}' uses {} colour attachments, device supports {}",
                self.label,
                self.colour_count(),
                max_color_attachments
            )));
        }
        Ok(())
    }
}

/// Image bound to one framebuffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferAttachment {
    /// A texture owned elsewhere
    Texture(TextureRef),
    /// The swapchain image with this index
    SwapchainImage(u32),
}

/// Framebuffer creation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferDesc {
    /// Debug label
    pub label: String,
    /// Render pass the framebuffer is compatible with
    pub render_pass: RenderPassId,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Attachments in render pass order
    pub attachments: Vec<FramebufferAttachment>,
}

impl FramebufferDesc {
    /// Whether this framebuffer renders into a presentable image
    pub fn presents(&self) -> bool {
        self.attachments
            .iter()
            .any(|a| matches!(a, FramebufferAttachment::SwapchainImage(_)))
    }

    /// Framebuffer extent
    pub fn extent(&self) -> Extent2D {
        Extent2D::new(self.width, self.height)
    }
}

/// Width and height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Extent2D {
    /// Create an extent
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// How draw commands inside a render pass are provided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubpassContents {
    /// Recorded directly into the primary buffer
    Inline,
    /// Provided only by executing secondary buffers
    SecondaryCommandBuffers,
}

/// Command buffer level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferLevel {
    /// Submittable buffer
    Primary,
    /// Buffer executed from inside a primary buffer's render pass
    Secondary,
}

/// Buffer usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Vertex data
    Vertex,
    /// 32-bit indices
    Index,
    /// Uniform data, also usable with dynamic offsets
    Uniform,
}

/// GPU-side geometry of one mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshBuffers {
    /// Interleaved vertices
    pub vertex_buffer: BufferId,
    /// 32-bit indices
    pub index_buffer: BufferId,
    /// Number of indices to draw
    pub index_count: u32,
}

/// A single descriptor update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorWrite {
    /// Combined image sampler
    Image {
        /// Binding slot
        binding: u32,
        /// Sampled texture
        texture: TextureRef,
    },
    /// Uniform buffer range; for dynamic bindings `offset` is the base the
    /// per-draw dynamic offset is added to
    Buffer {
        /// Binding slot
        binding: u32,
        /// Source buffer
        buffer: BufferId,
        /// Start of the range
        offset: u64,
        /// Length of the range
        range: u64,
    },
}

impl DescriptorWrite {
    /// Binding slot this write targets
    pub fn binding(&self) -> u32 {
        match self {
            Self::Image { binding, .. } | Self::Buffer { binding, .. } => *binding,
        }
    }
}

/// Limits and identity of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Graphics API behind the device
    pub api: GraphicsApi,
    /// Human readable adapter name
    pub device_name: String,
    /// `minUniformBufferOffsetAlignment`
    pub min_uniform_buffer_offset_alignment: u64,
    /// Maximum colour attachments per subpass
    pub max_color_attachments: u32,
    /// Images in the presentation swapchain, zero when there is none
    pub swapchain_image_count: u32,
    /// Size of the presentation surface
    pub presentation_extent: Extent2D,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_desc_validation() {
        let desc = TextureDesc::sampled_2d("checker", 2, 2, Format::Rgba8Unorm);
        assert!(desc.validate(Some(&[0u8; 16])).is_ok());
        assert!(desc.validate(Some(&[0u8; 15])).is_err());
        assert!(TextureDesc::sampled_2d("empty", 0, 4, Format::Rgba8Unorm).validate(None).is_err());

        let cube = TextureDesc::cube("sky", 4, Format::Rgba8Unorm);
        assert_eq!(cube.layer_count(), 6);
        assert_eq!(cube.data_size(), 4 * 4 * 6 * 4);

        let shadow = TextureDesc::depth_array("shadow", 1024, 4);
        assert!(shadow.validate(Some(&[])).is_err());
        assert!(shadow.validate(None).is_ok());
    }

    #[test]
    fn test_render_pass_depth_must_be_last() {
        let good = RenderPassDesc {
            label: "good".into(),
            attachments: vec![AttachmentDesc::colour(Format::Rgba8Unorm), AttachmentDesc::depth(LoadOp::Clear)],
        };
        assert!(good.validate(8).is_ok());
        assert_eq!(good.colour_count(), 1);

        let bad = RenderPassDesc {
            label: "bad".into(),
            attachments: vec![AttachmentDesc::depth(LoadOp::Clear), AttachmentDesc::colour(Format::Rgba8Unorm)],
        };
        assert!(bad.validate(8).is_err());
        assert!(good.validate(0).is_err());
    }
}
