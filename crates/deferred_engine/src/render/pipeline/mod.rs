//! Pipeline and descriptor descriptions
//!
//! A [`PipelineDesc`] is the declarative input a backend compiles into a
//! pipeline object: vertex layout, two descriptor-set layouts, pool sizing,
//! attachment count, raster state, dimensions and object capacity.
//!
//! Descriptor sets are always bound at two granularities:
//!
//! - [`DescriptorTier::Scene`] (set 0): per-frame data such as the camera,
//!   per-object dynamic uniforms and lights.
//! - [`DescriptorTier::PerDraw`] (set 1): per-mesh textures and material
//!   constants.
//!
//! Descriptions are built with [`PipelineBuilder`], which validates the
//! result before any backend sees it.

pub mod descriptor;
pub mod vertex_layout;

pub use descriptor::DescriptorSetBuilder;
pub use vertex_layout::{VertexAttribute, VertexFormat, VertexLayout};

use bitflags::bitflags;

use crate::render::gfx::{DescriptorWrite, GfxError, GfxResult, RenderPassId, ShaderId};

bitflags! {
    /// Shader stages a binding is visible to
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        /// Vertex stage
        const VERTEX = 1 << 0;
        /// Fragment stage
        const FRAGMENT = 1 << 1;
        /// Geometry stage
        const GEOMETRY = 1 << 2;
        /// Compute stage
        const COMPUTE = 1 << 3;
    }
}

/// Resource type of a descriptor binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    /// Uniform buffer at a fixed offset
    UniformBuffer,
    /// Uniform buffer whose offset is supplied at bind time
    UniformBufferDynamic,
    /// Combined image and sampler
    ImageSampler,
}

/// One (type, stage, binding) entry of a descriptor set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    /// Resource type
    pub ty: DescriptorType,
    /// Visible stages
    pub stages: ShaderStages,
    /// Binding index
    pub binding: u32,
}

/// Layout of one descriptor set
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DescriptorLayout {
    /// Bindings in declaration order
    pub bindings: Vec<DescriptorBinding>,
}

impl DescriptorLayout {
    /// Empty layout
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a uniform buffer binding
    pub fn add_uniform_buffer(self, binding: u32, stages: ShaderStages) -> Self {
        self.add(DescriptorType::UniformBuffer, stages, binding)
    }

    /// Add a dynamic uniform buffer binding
    pub fn add_dynamic_uniform_buffer(self, binding: u32, stages: ShaderStages) -> Self {
        self.add(DescriptorType::UniformBufferDynamic, stages, binding)
    }

    /// Add a combined image sampler binding
    pub fn add_image_sampler(self, binding: u32, stages: ShaderStages) -> Self {
        self.add(DescriptorType::ImageSampler, stages, binding)
    }

    fn add(mut self, ty: DescriptorType, stages: ShaderStages, binding: u32) -> Self {
        self.bindings.push(DescriptorBinding { ty, stages, binding });
        self
    }

    /// Look up a binding by index
    pub fn binding(&self, binding: u32) -> Option<&DescriptorBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }

    /// Dynamic bindings in ascending binding order, the order dynamic offsets are consumed in
    pub fn dynamic_bindings(&self) -> Vec<u32> {
        let mut dynamic: Vec<u32> = self
            .bindings
            .iter()
            .filter(|b| b.ty == DescriptorType::UniformBufferDynamic)
            .map(|b| b.binding)
            .collect();
        dynamic.sort_unstable();
        dynamic
    }

    /// Number of bindings of a given type
    pub fn count_of(&self, ty: DescriptorType) -> u32 {
        self.bindings.iter().filter(|b| b.ty == ty).count() as u32
    }

    /// Check that a write targets an existing binding of a matching kind
    pub fn validate_write(&self, write: &DescriptorWrite) -> GfxResult<()> {
        let binding = self.binding(write.binding()).ok_or_else(|| {
            GfxError::InvalidDescription(format!("descriptor binding {} is not in the layout", write.binding()))
        })?;
        let matches = match write {
            DescriptorWrite::Image { .. } => binding.ty == DescriptorType::ImageSampler,
            DescriptorWrite::Buffer { .. } => matches!(
                binding.ty,
                DescriptorType::UniformBuffer | DescriptorType::UniformBufferDynamic
            ),
        };
        if matches {
            Ok(())
        } else {
            Err(GfxError::InvalidDescription(format!(
                "descriptor write to binding {} does not match its type {:?}",
                binding.binding, binding.ty
            )))
        }
    }
}

/// Which of the two descriptor sets a layout describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorTier {
    /// Set 0: per-frame camera, object and light data
    Scene,
    /// Set 1: per-mesh textures and material constants
    PerDraw,
}

impl DescriptorTier {
    /// Both tiers in set order
    pub const ALL: [Self; 2] = [Self::Scene, Self::PerDraw];

    /// Set index in the pipeline layout
    pub fn set_index(self) -> u32 {
        match self {
            Self::Scene => 0,
            Self::PerDraw => 1,
        }
    }
}

/// Pool sizing hint: how many descriptors of a type the pool must hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorPoolSize {
    /// Descriptor type
    pub ty: DescriptorType,
    /// Number of descriptors
    pub count: u32,
}

/// Triangle face culling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    /// Draw both faces
    None,
    /// Cull front faces
    Front,
    /// Cull back faces
    Back,
}

/// Validated pipeline description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDesc {
    /// Debug name
    pub name: String,
    /// Shader program
    pub shader: ShaderId,
    /// Render pass the pipeline draws in
    pub render_pass: RenderPassId,
    /// Vertex input layout
    pub vertex_layout: VertexLayout,
    /// Set 0 layout
    pub scene_layout: DescriptorLayout,
    /// Set 1 layout
    pub draw_layout: DescriptorLayout,
    /// Pool sizing hints
    pub pool_sizes: Vec<DescriptorPoolSize>,
    /// Colour attachments written by the fragment stage
    pub color_attachment_count: u32,
    /// Face culling
    pub cull_mode: CullMode,
    /// Alpha blending on every colour attachment
    pub transparency_enabled: bool,
    /// Depth bias during rasterization
    pub depth_bias_enabled: bool,
    /// Depth test and write
    pub depth_test_enabled: bool,
    /// Line rasterization
    pub wireframe: bool,
    /// Target width
    pub width: u32,
    /// Target height
    pub height: u32,
    /// Maximum objects drawn per frame, sizes the descriptor pool
    pub max_objects: u32,
}

impl PipelineDesc {
    /// Layout of one tier
    pub fn layout(&self, tier: DescriptorTier) -> &DescriptorLayout {
        match tier {
            DescriptorTier::Scene => &self.scene_layout,
            DescriptorTier::PerDraw => &self.draw_layout,
        }
    }

    /// Number of dynamic offsets needed when binding both tiers
    pub fn dynamic_offset_count(&self) -> usize {
        self.scene_layout.dynamic_bindings().len() + self.draw_layout.dynamic_bindings().len()
    }
}

/// Fluent builder for [`PipelineDesc`]
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    desc: PipelineDesc,
}

impl PipelineBuilder {
    /// Start a description for `shader` drawing in `render_pass`
    pub fn new(name: impl Into<String>, shader: ShaderId, render_pass: RenderPassId) -> Self {
        Self {
            desc: PipelineDesc {
                name: name.into(),
                shader,
                render_pass,
                vertex_layout: VertexLayout::default(),
                scene_layout: DescriptorLayout::new(),
                draw_layout: DescriptorLayout::new(),
                pool_sizes: Vec::new(),
                color_attachment_count: 1,
                cull_mode: CullMode::Back,
                transparency_enabled: false,
                depth_bias_enabled: false,
                depth_test_enabled: true,
                wireframe: false,
                width: 0,
                height: 0,
                max_objects: 1,
            },
        }
    }

    /// Vertex input layout
    pub fn vertex_layout(mut self, layout: VertexLayout) -> Self {
        self.desc.vertex_layout = layout;
        self
    }

    /// Layout of the scene tier
    pub fn scene_layout(mut self, layout: DescriptorLayout) -> Self {
        self.desc.scene_layout = layout;
        self
    }

    /// Layout of the per-draw tier
    pub fn draw_layout(mut self, layout: DescriptorLayout) -> Self {
        self.desc.draw_layout = layout;
        self
    }

    /// Add a pool sizing hint
    pub fn pool_size(mut self, ty: DescriptorType, count: u32) -> Self {
        self.desc.pool_sizes.push(DescriptorPoolSize { ty, count });
        self
    }

    /// Number of colour attachments
    pub fn color_attachments(mut self, count: u32) -> Self {
        self.desc.color_attachment_count = count;
        self
    }

    /// Face culling
    pub fn cull_mode(mut self, mode: CullMode) -> Self {
        self.desc.cull_mode = mode;
        self
    }

    /// Alpha blending
    pub fn transparency(mut self, enabled: bool) -> Self {
        self.desc.transparency_enabled = enabled;
        self
    }

    /// Depth bias
    pub fn depth_bias(mut self, enabled: bool) -> Self {
        self.desc.depth_bias_enabled = enabled;
        self
    }

    /// Depth test and write
    pub fn depth_test(mut self, enabled: bool) -> Self {
        self.desc.depth_test_enabled = enabled;
        self
    }

    /// Line rasterization
    pub fn wireframe(mut self, enabled: bool) -> Self {
        self.desc.wireframe = enabled;
        self
    }

    /// Target dimensions
    pub fn dimensions(mut self, width: u32, height: u32) -> Self {
        self.desc.width = width;
        self.desc.height = height;
        self
    }

    /// Object capacity
    pub fn max_objects(mut self, max_objects: u32) -> Self {
        self.desc.max_objects = max_objects;
        self
    }

    /// Validate and return the description
    pub fn build(self) -> GfxResult<PipelineDesc> {
        let desc = self.desc;
        let invalid = |reason: String| Err(GfxError::InvalidDescription(format!("pipeline '{}': {reason}", desc.name)));

        if desc.name.is_empty() {
            return Err(GfxError::InvalidDescription("pipeline name cannot be empty".into()));
        }
        desc.vertex_layout.validate()?;
        if desc.color_attachment_count == 0 {
            return invalid("needs at least one colour attachment".into());
        }
        if desc.width == 0 || desc.height == 0 {
            return invalid(format!("zero dimensions {}x{}", desc.width, desc.height));
        }
        if desc.max_objects == 0 {
            return invalid("max_objects must be at least 1".into());
        }

        for tier in DescriptorTier::ALL {
            let layout = desc.layout(tier);
            for (i, binding) in layout.bindings.iter().enumerate() {
                if layout.bindings[..i].iter().any(|b| b.binding == binding.binding) {
                    return invalid(format!("binding {} declared twice in {:?} tier", binding.binding, tier));
                }
                if binding.stages.is_empty() {
                    return invalid(format!("binding {} in {:?} tier has no stages", binding.binding, tier));
                }
            }
        }

        for ty in [
            DescriptorType::UniformBuffer,
            DescriptorType::UniformBufferDynamic,
            DescriptorType::ImageSampler,
        ] {
            let used = desc.scene_layout.count_of(ty) + desc.draw_layout.count_of(ty);
            let pooled: u32 = desc.pool_sizes.iter().filter(|p| p.ty == ty).map(|p| p.count).sum();
            if used > 0 && pooled == 0 {
                return invalid(format!("pool sizes do not cover {ty:?}"));
            }
        }

        Ok(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn ids() -> (ShaderId, RenderPassId) {
        let mut shaders: SlotMap<ShaderId, ()> = SlotMap::with_key();
        let mut passes: SlotMap<RenderPassId, ()> = SlotMap::with_key();
        (shaders.insert(()), passes.insert(()))
    }

    fn layout() -> VertexLayout {
        VertexLayout::new(12).attribute(0, VertexFormat::Float3, 0)
    }

    #[test]
    fn test_build_two_tier_pipeline() {
        let (shader, pass) = ids();
        let desc = PipelineBuilder::new("geometry", shader, pass)
            .vertex_layout(layout())
            .scene_layout(
                DescriptorLayout::new()
                    .add_uniform_buffer(0, ShaderStages::VERTEX)
                    .add_dynamic_uniform_buffer(1, ShaderStages::VERTEX),
            )
            .draw_layout(DescriptorLayout::new().add_image_sampler(0, ShaderStages::FRAGMENT))
            .pool_size(DescriptorType::UniformBuffer, 4)
            .pool_size(DescriptorType::UniformBufferDynamic, 4)
            .pool_size(DescriptorType::ImageSampler, 4)
            .color_attachments(4)
            .dimensions(640, 480)
            .max_objects(4)
            .build()
            .unwrap();

        assert_eq!(desc.dynamic_offset_count(), 1);
        assert_eq!(desc.layout(DescriptorTier::Scene).dynamic_bindings(), vec![1]);
        assert_eq!(DescriptorTier::PerDraw.set_index(), 1);
    }

    #[test]
    fn test_duplicate_binding_rejected() {
        let (shader, pass) = ids();
        let result = PipelineBuilder::new("dup", shader, pass)
            .vertex_layout(layout())
            .draw_layout(
                DescriptorLayout::new()
                    .add_image_sampler(0, ShaderStages::FRAGMENT)
                    .add_image_sampler(0, ShaderStages::FRAGMENT),
            )
            .pool_size(DescriptorType::ImageSampler, 2)
            .dimensions(1, 1)
            .build();
        assert!(matches!(result, Err(GfxError::InvalidDescription(_))));
    }

    #[test]
    fn test_missing_pool_size_rejected() {
        let (shader, pass) = ids();
        let result = PipelineBuilder::new("nopool", shader, pass)
            .vertex_layout(layout())
            .scene_layout(DescriptorLayout::new().add_uniform_buffer(0, ShaderStages::FRAGMENT))
            .dimensions(1, 1)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_write_type() {
        let layout = DescriptorLayout::new()
            .add_uniform_buffer(0, ShaderStages::FRAGMENT)
            .add_image_sampler(1, ShaderStages::FRAGMENT);
        let mut buffers: SlotMap<crate::render::gfx::BufferId, ()> = SlotMap::with_key();
        let buffer = buffers.insert(());

        let ok = DescriptorWrite::Buffer { binding: 0, buffer, offset: 0, range: 16 };
        let wrong = DescriptorWrite::Buffer { binding: 1, buffer, offset: 0, range: 16 };
        let missing = DescriptorWrite::Buffer { binding: 7, buffer, offset: 0, range: 16 };
        assert!(layout.validate_write(&ok).is_ok());
        assert!(layout.validate_write(&wrong).is_err());
        assert!(layout.validate_write(&missing).is_err());
    }
}
