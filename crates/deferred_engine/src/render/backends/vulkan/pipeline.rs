//! Shader modules, render passes, framebuffers and graphics pipelines
//!
//! Attachment layouts follow one convention so passes chain without explicit
//! barriers: colour targets end in `SHADER_READ_ONLY_OPTIMAL` (or
//! `PRESENT_SRC_KHR` for the presentation format) and depth targets end in
//! `DEPTH_STENCIL_READ_ONLY_OPTIMAL`, which is also where a loaded depth
//! attachment starts.

use std::ffi::CString;

use ash::{vk, Device};

use super::context::{VulkanError, VulkanResult};
use super::convert;
use crate::render::gfx::{Format, LoadOp, RenderPassDesc, TextureId};
use crate::render::pipeline::{DescriptorLayout, DescriptorTier, PipelineDesc};
use crate::render::shader::ShaderSource;

/// Compiled program: one module per stage
pub struct VulkanShader {
    device: Device,
    stages: Vec<(vk::ShaderStageFlags, vk::ShaderModule, CString)>,
    name: String,
}

impl VulkanShader {
    /// Create a module for every stage of `source`
    pub fn new(device: &Device, source: &ShaderSource) -> VulkanResult<Self> {
        let mut shader = Self {
            device: device.clone(),
            stages: Vec::with_capacity(source.stages.len()),
            name: source.name.clone(),
        };
        for stage in &source.stages {
            let entry = CString::new(stage.entry_point.as_str()).map_err(|_| VulkanError::InvalidOperation {
                reason: format!("entry point of '{}' contains a NUL byte", source.name),
            })?;
            let create_info = vk::ShaderModuleCreateInfo::builder().code(&stage.spirv);
            let module = unsafe { device.create_shader_module(&create_info, None)? };
            shader.stages.push((convert::stage_flags(stage.stage), module, entry));
        }
        Ok(shader)
    }

    /// Program name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn stage_infos(&self) -> Vec<vk::PipelineShaderStageCreateInfo> {
        self.stages
            .iter()
            .map(|(stage, module, entry)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(*stage)
                    .module(*module)
                    .name(entry)
                    .build()
            })
            .collect()
    }
}

impl Drop for VulkanShader {
    fn drop(&mut self) {
        unsafe {
            for (_, module, _) in &self.stages {
                self.device.destroy_shader_module(*module, None);
            }
        }
    }
}

/// Render pass with the description it was built from
pub struct VulkanRenderPass {
    device: Device,
    render_pass: vk::RenderPass,
    desc: RenderPassDesc,
}

impl VulkanRenderPass {
    /// Build a single-subpass render pass from `desc`
    pub fn new(device: &Device, desc: &RenderPassDesc, presentation_format: vk::Format) -> VulkanResult<Self> {
        let mut attachments = Vec::with_capacity(desc.attachments.len());
        let mut colour_refs = Vec::new();
        let mut depth_ref = None;

        for (index, attachment) in desc.attachments.iter().enumerate() {
            let (subpass_layout, final_layout) = attachment_layouts(attachment.format, attachment.load);
            let initial_layout = match attachment.load {
                LoadOp::Clear => vk::ImageLayout::UNDEFINED,
                LoadOp::Load => final_layout,
            };

            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(convert::format(attachment.format, presentation_format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(convert::load_op(attachment.load))
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(initial_layout)
                    .final_layout(final_layout)
                    .build(),
            );

            let reference = vk::AttachmentReference::builder()
                .attachment(index as u32)
                .layout(subpass_layout)
                .build();
            if attachment.format.is_depth() {
                depth_ref = Some(reference);
            } else {
                colour_refs.push(reference);
            }
        }

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&colour_refs);
        if let Some(depth_ref) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }
        let subpasses = [subpass.build()];

        let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        let attachment_writes =
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        let dependencies = [
            vk::SubpassDependency::builder()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(attachment_stages | vk::PipelineStageFlags::FRAGMENT_SHADER)
                .src_access_mask(attachment_writes)
                .dst_stage_mask(attachment_stages | vk::PipelineStageFlags::FRAGMENT_SHADER)
                .dst_access_mask(attachment_writes | vk::AccessFlags::SHADER_READ)
                .build(),
            vk::SubpassDependency::builder()
                .src_subpass(0)
                .dst_subpass(vk::SUBPASS_EXTERNAL)
                .src_stage_mask(attachment_stages)
                .src_access_mask(attachment_writes)
                .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .build(),
        ];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let render_pass = unsafe { device.create_render_pass(&create_info, None)? };

        Ok(Self {
            device: device.clone(),
            render_pass,
            desc: desc.clone(),
        })
    }

    /// Raw handle
    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Description the pass was built from
    pub fn desc(&self) -> &RenderPassDesc {
        &self.desc
    }
}

impl Drop for VulkanRenderPass {
    fn drop(&mut self) {
        unsafe { self.device.destroy_render_pass(self.render_pass, None) };
    }
}

/// (subpass, final) layouts of an attachment
fn attachment_layouts(format: Format, load: LoadOp) -> (vk::ImageLayout, vk::ImageLayout) {
    match (format, load) {
        (Format::Depth32Float, LoadOp::Load) => (
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ),
        (Format::Depth32Float, LoadOp::Clear) => (
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ),
        (Format::Presentation, _) => (vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR),
        _ => (
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ),
    }
}

/// Framebuffer plus what its attachments need after a pass ends
pub struct VulkanFramebuffer {
    device: Device,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    textures: Vec<TextureId>,
    presentation_textures: Vec<vk::Image>,
}

impl VulkanFramebuffer {
    /// Create a framebuffer over `views`
    ///
    /// `textures` are the texture attachments, which must outlive the
    /// framebuffer. `presentation_textures` are textures in the presentation
    /// format whose pass leaves them in `PRESENT_SRC_KHR`.
    pub fn new(
        device: &Device,
        render_pass: vk::RenderPass,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
        textures: Vec<TextureId>,
        presentation_textures: Vec<vk::Image>,
    ) -> VulkanResult<Self> {
        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer = unsafe { device.create_framebuffer(&create_info, None)? };
        Ok(Self {
            device: device.clone(),
            framebuffer,
            extent,
            textures,
            presentation_textures,
        })
    }

    /// Raw handle
    pub fn handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    /// Extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Whether `texture` is one of the attachments
    pub fn attaches(&self, texture: TextureId) -> bool {
        self.textures.contains(&texture)
    }

    /// Textures to move from `PRESENT_SRC_KHR` back to a sampled layout
    pub fn presentation_textures(&self) -> &[vk::Image] {
        &self.presentation_textures
    }
}

impl Drop for VulkanFramebuffer {
    fn drop(&mut self) {
        unsafe { self.device.destroy_framebuffer(self.framebuffer, None) };
    }
}

/// Graphics pipeline, its layouts and the descriptor pool its sets come from
pub struct VulkanPipeline {
    device: Device,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layouts: [vk::DescriptorSetLayout; 2],
    pool: vk::DescriptorPool,
    desc: PipelineDesc,
}

impl VulkanPipeline {
    /// Build the pipeline described by `desc` for `render_pass`
    pub fn new(device: &Device, desc: &PipelineDesc, shader: &VulkanShader, render_pass: vk::RenderPass) -> VulkanResult<Self> {
        let mut pipeline = Self {
            device: device.clone(),
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            set_layouts: [vk::DescriptorSetLayout::null(); 2],
            pool: vk::DescriptorPool::null(),
            desc: desc.clone(),
        };

        for tier in DescriptorTier::ALL {
            pipeline.set_layouts[tier.set_index() as usize] = create_set_layout(device, desc.layout(tier))?;
        }

        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&pipeline.set_layouts);
        pipeline.layout = unsafe { device.create_pipeline_layout(&layout_info, None)? };
        pipeline.pool = create_pool(device, desc)?;
        pipeline.pipeline = create_graphics_pipeline(device, desc, shader, render_pass, pipeline.layout)?;

        Ok(pipeline)
    }

    /// Raw pipeline
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Pipeline layout
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Description the pipeline was built from
    pub fn desc(&self) -> &PipelineDesc {
        &self.desc
    }

    /// Allocate one set for `tier`
    pub fn allocate_set(&self, tier: DescriptorTier) -> VulkanResult<vk::DescriptorSet> {
        let layouts = [self.set_layouts[tier.set_index() as usize]];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info)? };
        sets.first()
            .copied()
            .ok_or_else(|| VulkanError::InvalidOperation { reason: "descriptor pool returned no set".into() })
    }

    /// Return a set to the pool
    pub fn free_set(&self, set: vk::DescriptorSet) -> VulkanResult<()> {
        unsafe { self.device.free_descriptor_sets(self.pool, &[set])? };
        Ok(())
    }
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        unsafe {
            if self.pipeline != vk::Pipeline::null() {
                self.device.destroy_pipeline(self.pipeline, None);
            }
            if self.pool != vk::DescriptorPool::null() {
                self.device.destroy_descriptor_pool(self.pool, None);
            }
            if self.layout != vk::PipelineLayout::null() {
                self.device.destroy_pipeline_layout(self.layout, None);
            }
            for &layout in &self.set_layouts {
                if layout != vk::DescriptorSetLayout::null() {
                    self.device.destroy_descriptor_set_layout(layout, None);
                }
            }
        }
    }
}

fn create_set_layout(device: &Device, layout: &DescriptorLayout) -> VulkanResult<vk::DescriptorSetLayout> {
    let bindings: Vec<vk::DescriptorSetLayoutBinding> = layout
        .bindings
        .iter()
        .map(|binding| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding.binding)
                .descriptor_type(convert::descriptor_type(binding.ty))
                .descriptor_count(1)
                .stage_flags(convert::stage_flags(binding.stages))
                .build()
        })
        .collect();
    let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
    Ok(unsafe { device.create_descriptor_set_layout(&create_info, None)? })
}

/// Pool holding one set per tier per object
fn create_pool(device: &Device, desc: &PipelineDesc) -> VulkanResult<vk::DescriptorPool> {
    let mut pool_sizes: Vec<vk::DescriptorPoolSize> = desc
        .pool_sizes
        .iter()
        .filter(|size| size.count > 0)
        .map(|size| vk::DescriptorPoolSize {
            ty: convert::descriptor_type(size.ty),
            descriptor_count: size.count,
        })
        .collect();
    if pool_sizes.is_empty() {
        pool_sizes.push(vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
        });
    }

    let create_info = vk::DescriptorPoolCreateInfo::builder()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(desc.max_objects * DescriptorTier::ALL.len() as u32)
        .pool_sizes(&pool_sizes);
    Ok(unsafe { device.create_descriptor_pool(&create_info, None)? })
}

fn create_graphics_pipeline(
    device: &Device,
    desc: &PipelineDesc,
    shader: &VulkanShader,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
) -> VulkanResult<vk::Pipeline> {
    let stages = shader.stage_infos();

    let binding_descriptions = [vk::VertexInputBindingDescription::builder()
        .binding(0)
        .stride(desc.vertex_layout.stride)
        .input_rate(vk::VertexInputRate::VERTEX)
        .build()];
    let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = desc
        .vertex_layout
        .attributes
        .iter()
        .map(|attribute| {
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(attribute.location)
                .format(convert::vertex_format(attribute.format))
                .offset(attribute.offset)
                .build()
        })
        .collect();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&binding_descriptions)
        .vertex_attribute_descriptions(&attribute_descriptions);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Viewport and scissor are dynamic, only the counts matter here
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(if desc.wireframe {
            vk::PolygonMode::LINE
        } else {
            vk::PolygonMode::FILL
        })
        .line_width(1.0)
        .cull_mode(convert::cull_mode(desc.cull_mode))
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(desc.depth_bias_enabled)
        .depth_bias_constant_factor(if desc.depth_bias_enabled { 1.25 } else { 0.0 })
        .depth_bias_slope_factor(if desc.depth_bias_enabled { 1.75 } else { 0.0 });

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(desc.depth_test_enabled)
        .depth_write_enable(desc.depth_test_enabled)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let blend_attachment = if desc.transparency_enabled {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .build()
    } else {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()
    };
    let blend_attachments = vec![blend_attachment; desc.color_attachment_count as usize];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let pipelines = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_, e)| VulkanError::Api(e))?
    };
    pipelines
        .first()
        .copied()
        .ok_or_else(|| VulkanError::InvalidOperation { reason: format!("pipeline '{}' was not created", desc.name) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loaded_depth_stays_read_only() {
        assert_eq!(
            attachment_layouts(Format::Depth32Float, LoadOp::Load),
            (
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            )
        );
        assert_eq!(
            attachment_layouts(Format::Depth32Float, LoadOp::Clear).0,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn test_colour_targets_end_sampled_or_presented() {
        assert_eq!(
            attachment_layouts(Format::Rgba16Float, LoadOp::Clear).1,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            attachment_layouts(Format::Presentation, LoadOp::Clear).1,
            vk::ImageLayout::PRESENT_SRC_KHR
        );
    }
}
