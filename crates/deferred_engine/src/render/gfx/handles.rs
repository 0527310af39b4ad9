//! Resource handles

use super::types::{BufferUsage, Format, TextureDesc};
use super::{GfxResult, GraphicsDevice};

slotmap::new_key_type! {
    /// Compiled shader program
    pub struct ShaderId;
    /// Texture storage
    pub struct TextureId;
    /// Render pass
    pub struct RenderPassId;
    /// Framebuffer
    pub struct FramebufferId;
    /// Graphics pipeline together with its descriptor layouts and pool
    pub struct PipelineId;
    /// Descriptor set allocated from a pipeline's pool
    pub struct DescriptorSetId;
    /// Command buffer
    pub struct CommandBufferId;
    /// Vertex, index or uniform buffer
    pub struct BufferId;
}

/// Unique owner of a texture
///
/// Not `Clone`: exactly one value exists per live texture and destroying it
/// consumes the value. Hand out [`TextureRef`]s to everything else.
#[derive(Debug, PartialEq, Eq)]
pub struct OwnedTexture {
    id: TextureId,
    width: u32,
    height: u32,
    format: Format,
}

impl OwnedTexture {
    /// Wrap a freshly created backend texture. Only backends create owners.
    pub(crate) fn new(id: TextureId, desc: &TextureDesc) -> Self {
        Self {
            id,
            width: desc.width,
            height: desc.height,
            format: desc.format,
        }
    }

    /// Non-owning reference to this texture
    pub fn reference(&self) -> TextureRef {
        TextureRef {
            id: self.id,
            width: self.width,
            height: self.height,
            format: self.format,
        }
    }

    /// Backend id
    pub fn id(&self) -> TextureId {
        self.id
    }

    /// Width in texels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in texels
    pub fn height(&self) -> u32 {
        self.height
    }
}

/// Non-owning reference to a texture owned elsewhere
///
/// Holding one keeps nothing alive; the owner must outlive every framebuffer
/// and descriptor set built from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureRef {
    id: TextureId,
    width: u32,
    height: u32,
    format: Format,
}

impl TextureRef {
    /// Backend id
    pub fn id(&self) -> TextureId {
        self.id
    }

    /// Width in texels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in texels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Texel format
    pub fn format(&self) -> Format {
        self.format
    }
}

/// Uniform buffer owned by a renderer
#[derive(Debug, PartialEq, Eq)]
pub struct UniformBuffer {
    id: BufferId,
    size: u64,
}

impl UniformBuffer {
    /// Allocate a uniform buffer of `size` bytes
    pub fn create(device: &mut dyn GraphicsDevice, size: u64) -> GfxResult<Self> {
        let id = device.create_buffer(BufferUsage::Uniform, size)?;
        Ok(Self { id, size })
    }

    /// Upload `data` at the start of the buffer
    pub fn set_data(&self, device: &mut dyn GraphicsDevice, data: &[u8]) -> GfxResult<()> {
        device.write_buffer(self.id, 0, data)
    }

    /// Upload `data` at `offset`
    pub fn set_data_at(&self, device: &mut dyn GraphicsDevice, offset: u64, data: &[u8]) -> GfxResult<()> {
        device.write_buffer(self.id, offset, data)
    }

    /// Backend id
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Release the buffer
    pub fn destroy(self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        device.destroy_buffer(self.id)
    }
}
