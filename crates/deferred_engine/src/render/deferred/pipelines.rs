//! Render pass, pipeline and framebuffer descriptions of the two deferred passes

use crate::render::gfx::{
    AttachmentDesc, Format, FramebufferAttachment, FramebufferDesc, GfxResult, LoadOp, RenderPassDesc,
    RenderPassId, ShaderId, TextureRef,
};
use crate::render::manager::{GBufferTargets, GBUFFER_COLOUR_FORMATS};
use crate::render::material::{material_layout, MATERIAL_TEXTURE_SLOTS};
use crate::render::mesh::Vertex;
use crate::render::pipeline::{
    CullMode, DescriptorLayout, DescriptorType, PipelineBuilder, PipelineDesc, ShaderStages,
};

/// Pipeline name of the geometry pass
pub const OFFSCREEN_PIPELINE_NAME: &str = "OffScreenRenderer";
/// Pipeline name of the lighting pass
pub const DEFERRED_PIPELINE_NAME: &str = "Deferred";
/// Object capacity of the lighting pipeline, which only ever draws the screen quad
pub const DEFERRED_MAX_OBJECTS: u32 = 10;

/// Geometry pass scene tier: camera uniforms
pub const SCENE_UNIFORM_BINDING: u32 = 0;
/// Geometry pass scene tier: per-object model matrices
pub const MODEL_MATRIX_BINDING: u32 = 1;

/// Lighting pass scene tier: the light block
pub const LIGHT_BLOCK_BINDING: u32 = 0;

/// Per-draw bindings of the lighting pass
pub mod lighting {
    /// GBuffer albedo
    pub const COLOUR: u32 = 0;
    /// GBuffer world position
    pub const POSITION: u32 = 1;
    /// GBuffer normals
    pub const NORMAL: u32 = 2;
    /// GBuffer metallic, roughness and occlusion
    pub const PBR: u32 = 3;
    /// Preintegrated FG table
    pub const PREINTEGRATED_FG: u32 = 4;
    /// Environment cube map, or a black fallback cube without a skybox
    pub const CUBE_MAP: u32 = 5;
    /// Shadow cascades, or a 1x1 fallback array without a shadow source
    pub const SHADOW_MAP: u32 = 6;
    /// GBuffer depth
    pub const DEPTH: u32 = 7;
    /// Number of sampler bindings
    pub const COUNT: u32 = 8;
}

/// Geometry pass: the four GBuffer colour targets plus cleared depth
pub fn offscreen_pass_desc() -> RenderPassDesc {
    let mut attachments: Vec<AttachmentDesc> = GBUFFER_COLOUR_FORMATS.iter().copied().map(AttachmentDesc::colour).collect();
    attachments.push(AttachmentDesc::depth(LoadOp::Clear));
    RenderPassDesc {
        label: "Offscreen".into(),
        attachments,
    }
}

/// Lighting pass: one presentable colour target plus the GBuffer depth, kept
pub fn deferred_pass_desc() -> RenderPassDesc {
    RenderPassDesc {
        label: "Deferred".into(),
        attachments: vec![AttachmentDesc::colour(Format::Presentation), AttachmentDesc::depth(LoadOp::Load)],
    }
}

/// Geometry pipeline writing every GBuffer target
///
/// Set 0 holds the camera uniforms and the dynamic model matrix, set 1 the
/// material textures and constants. The pool is sized per object.
pub fn offscreen_pipeline_desc(
    shader: ShaderId,
    render_pass: RenderPassId,
    width: u32,
    height: u32,
    max_objects: u32,
) -> GfxResult<PipelineDesc> {
    PipelineBuilder::new(OFFSCREEN_PIPELINE_NAME, shader, render_pass)
        .vertex_layout(Vertex::layout())
        .scene_layout(
            DescriptorLayout::new()
                .add_uniform_buffer(SCENE_UNIFORM_BINDING, ShaderStages::VERTEX)
                .add_dynamic_uniform_buffer(MODEL_MATRIX_BINDING, ShaderStages::VERTEX),
        )
        .draw_layout(material_layout())
        .pool_size(DescriptorType::UniformBuffer, 2 * max_objects)
        .pool_size(DescriptorType::UniformBufferDynamic, max_objects)
        .pool_size(DescriptorType::ImageSampler, MATERIAL_TEXTURE_SLOTS * max_objects)
        .color_attachments(GBUFFER_COLOUR_FORMATS.len() as u32)
        .cull_mode(CullMode::Back)
        .dimensions(width, height)
        .max_objects(max_objects)
        .build()
}

/// Lighting pipeline drawing the screen quad
///
/// Depth is loaded for sampling, never tested or written.
pub fn deferred_pipeline_desc(
    shader: ShaderId,
    render_pass: RenderPassId,
    width: u32,
    height: u32,
) -> GfxResult<PipelineDesc> {
    let mut draw_layout = DescriptorLayout::new();
    for binding in 0..lighting::COUNT {
        draw_layout = draw_layout.add_image_sampler(binding, ShaderStages::FRAGMENT);
    }

    PipelineBuilder::new(DEFERRED_PIPELINE_NAME, shader, render_pass)
        .vertex_layout(Vertex::layout())
        .scene_layout(DescriptorLayout::new().add_uniform_buffer(LIGHT_BLOCK_BINDING, ShaderStages::FRAGMENT))
        .draw_layout(draw_layout)
        .pool_size(DescriptorType::UniformBuffer, DEFERRED_MAX_OBJECTS)
        .pool_size(DescriptorType::ImageSampler, lighting::COUNT * DEFERRED_MAX_OBJECTS)
        .color_attachments(1)
        .cull_mode(CullMode::None)
        .depth_test(false)
        .dimensions(width, height)
        .max_objects(DEFERRED_MAX_OBJECTS)
        .build()
}

/// Framebuffer binding every GBuffer attachment to the geometry pass
pub fn offscreen_framebuffer_desc(render_pass: RenderPassId, gbuffer: &GBufferTargets) -> FramebufferDesc {
    let attachments = [gbuffer.colour, gbuffer.position, gbuffer.normal, gbuffer.pbr, gbuffer.depth]
        .into_iter()
        .map(FramebufferAttachment::Texture)
        .collect();
    FramebufferDesc {
        label: "GBuffer".into(),
        render_pass,
        width: gbuffer.width(),
        height: gbuffer.height(),
        attachments,
    }
}

/// Lighting pass framebuffers: one on `target` when set, else one per swapchain image
pub fn deferred_framebuffer_descs(
    render_pass: RenderPassId,
    gbuffer: &GBufferTargets,
    target: Option<TextureRef>,
    swapchain_image_count: u32,
) -> Vec<FramebufferDesc> {
    let depth = FramebufferAttachment::Texture(gbuffer.depth);
    let desc = |label: String, colour: FramebufferAttachment| FramebufferDesc {
        label,
        render_pass,
        width: gbuffer.width(),
        height: gbuffer.height(),
        attachments: vec![colour, depth],
    };

    match target {
        Some(texture) => vec![desc("Deferred target".into(), FramebufferAttachment::Texture(texture))],
        None => (0..swapchain_image_count)
            .map(|image| desc(format!("Deferred swapchain {image}"), FramebufferAttachment::SwapchainImage(image)))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::pipeline::DescriptorTier;
    use slotmap::SlotMap;

    fn ids() -> (ShaderId, RenderPassId) {
        let mut shaders: SlotMap<ShaderId, ()> = SlotMap::with_key();
        let mut passes: SlotMap<RenderPassId, ()> = SlotMap::with_key();
        (shaders.insert(()), passes.insert(()))
    }

    #[test]
    fn test_offscreen_pass_layout() {
        let pass = offscreen_pass_desc();
        assert_eq!(pass.colour_count(), 4);
        assert!(pass.has_depth());
        assert_eq!(pass.attachments[1].format, Format::Rgba32Float);
        assert_eq!(pass.attachments[4].load, LoadOp::Clear);

        let deferred = deferred_pass_desc();
        assert_eq!(deferred.colour_count(), 1);
        assert_eq!(deferred.attachments[1].load, LoadOp::Load);
    }

    #[test]
    fn test_offscreen_pipeline_tiers() {
        let (shader, pass) = ids();
        let desc = offscreen_pipeline_desc(shader, pass, 800, 600, 64).unwrap();
        assert_eq!(desc.name, OFFSCREEN_PIPELINE_NAME);
        assert_eq!(desc.cull_mode, CullMode::Back);
        assert_eq!(desc.color_attachment_count, 4);
        assert_eq!(desc.layout(DescriptorTier::Scene).dynamic_bindings(), vec![MODEL_MATRIX_BINDING]);

        let draw = desc.layout(DescriptorTier::PerDraw);
        assert_eq!(draw.count_of(DescriptorType::ImageSampler), 5);
        assert_eq!(draw.binding(5).unwrap().ty, DescriptorType::UniformBuffer);
        assert_eq!(desc.max_objects, 64);
    }

    #[test]
    fn test_deferred_pipeline_samples_gbuffer() {
        let (shader, pass) = ids();
        let desc = deferred_pipeline_desc(shader, pass, 800, 600).unwrap();
        assert_eq!(desc.cull_mode, CullMode::None);
        assert_eq!(desc.max_objects, DEFERRED_MAX_OBJECTS);
        assert_eq!(desc.dynamic_offset_count(), 0);
        let draw = desc.layout(DescriptorTier::PerDraw);
        assert_eq!(draw.count_of(DescriptorType::ImageSampler), lighting::COUNT);
        assert!(draw.binding(lighting::DEPTH).is_some());
    }
}
