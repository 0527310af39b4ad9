//! Mapping of backend-agnostic descriptions onto Vulkan enums

use ash::vk;

use crate::render::gfx::{Format, LoadOp, TextureDimension};
use crate::render::pipeline::{CullMode, DescriptorType, ShaderStages, VertexFormat};

/// Texel format, with `Presentation` resolved to `presentation`
pub fn format(format: Format, presentation: vk::Format) -> vk::Format {
    match format {
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::Depth32Float => vk::Format::D32_SFLOAT,
        Format::Presentation => presentation,
    }
}

/// Aspect sampled and attached for a format
pub fn aspect(format: Format) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Layout a texture rests in whenever it is not being rendered to
///
/// Depth stays read-only so the lighting pass can attach and sample it at once.
pub fn resting_layout(format: Format) -> vk::ImageLayout {
    if format.is_depth() {
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
    } else {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    }
}

/// Image view type of a texture shape
pub fn view_type(dimension: TextureDimension) -> vk::ImageViewType {
    match dimension {
        TextureDimension::D2 => vk::ImageViewType::TYPE_2D,
        TextureDimension::Cube => vk::ImageViewType::CUBE,
        TextureDimension::D2Array { .. } => vk::ImageViewType::TYPE_2D_ARRAY,
    }
}

/// Attachment load op
pub fn load_op(load: LoadOp) -> vk::AttachmentLoadOp {
    match load {
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
    }
}

/// Descriptor type
pub fn descriptor_type(ty: DescriptorType) -> vk::DescriptorType {
    match ty {
        DescriptorType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorType::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        DescriptorType::ImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    }
}

/// Shader stage flags
pub fn stage_flags(stages: ShaderStages) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStages::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(ShaderStages::GEOMETRY) {
        flags |= vk::ShaderStageFlags::GEOMETRY;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    flags
}

/// Vertex attribute format
pub fn vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float4 => vk::Format::R32G32B32A32_SFLOAT,
    }
}

/// Face culling
pub fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presentation_format_resolves_to_surface() {
        assert_eq!(
            format(Format::Presentation, vk::Format::B8G8R8A8_SRGB),
            vk::Format::B8G8R8A8_SRGB
        );
        assert_eq!(format(Format::Rgba32Float, vk::Format::UNDEFINED), vk::Format::R32G32B32A32_SFLOAT);
    }

    #[test]
    fn test_depth_rests_read_only() {
        assert_eq!(aspect(Format::Depth32Float), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            resting_layout(Format::Depth32Float),
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
        assert_eq!(resting_layout(Format::Rgba16Float), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn test_stage_flags_combine() {
        let flags = stage_flags(ShaderStages::VERTEX | ShaderStages::FRAGMENT);
        assert_eq!(flags, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(view_type(TextureDimension::D2Array { layers: 4 }), vk::ImageViewType::TYPE_2D_ARRAY);
    }
}
