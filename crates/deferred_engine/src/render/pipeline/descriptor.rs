//! Descriptor set writing

use crate::render::gfx::{
    BufferId, DescriptorSetId, DescriptorWrite, GfxResult, GraphicsDevice, PipelineId, TextureRef,
    UniformBuffer,
};

use super::DescriptorTier;

/// Collects image and buffer writes for one descriptor set and applies them in one update
#[derive(Debug, Default, Clone)]
pub struct DescriptorSetBuilder {
    writes: Vec<DescriptorWrite>,
}

impl DescriptorSetBuilder {
    /// Empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a sampled texture
    pub fn write_image(mut self, binding: u32, texture: TextureRef) -> Self {
        self.writes.push(DescriptorWrite::Image { binding, texture });
        self
    }

    /// Bind a whole uniform buffer
    pub fn write_uniform(self, binding: u32, buffer: &UniformBuffer) -> Self {
        self.write_buffer(binding, buffer.id(), 0, buffer.size())
    }

    /// Bind a buffer range
    pub fn write_buffer(mut self, binding: u32, buffer: BufferId, offset: u64, range: u64) -> Self {
        self.writes.push(DescriptorWrite::Buffer { binding, buffer, offset, range });
        self
    }

    /// Writes collected so far
    pub fn writes(&self) -> &[DescriptorWrite] {
        &self.writes
    }

    /// Apply the writes to an existing set
    pub fn update(&self, device: &mut dyn GraphicsDevice, set: DescriptorSetId) -> GfxResult<()> {
        device.update_descriptor_set(set, &self.writes)
    }

    /// Allocate a set for `tier` of `pipeline` and apply the writes to it
    pub fn allocate(
        &self,
        device: &mut dyn GraphicsDevice,
        pipeline: PipelineId,
        tier: DescriptorTier,
    ) -> GfxResult<DescriptorSetId> {
        let set = device.allocate_descriptor_set(pipeline, tier)?;
        self.update(device, set)?;
        Ok(set)
    }
}
