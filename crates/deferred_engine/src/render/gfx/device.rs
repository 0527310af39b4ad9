//! The device factory trait every backend implements

use super::handles::{
    BufferId, CommandBufferId, DescriptorSetId, FramebufferId, OwnedTexture, PipelineId,
    RenderPassId, ShaderId,
};
use super::types::{
    BufferUsage, CommandBufferLevel, DescriptorWrite, DeviceCapabilities, Extent2D,
    FramebufferDesc, MeshBuffers, RenderPassDesc, SubpassContents, TextureDesc,
};
use super::GfxResult;
use crate::core::{GraphicsApi, RendererConfig};
use crate::render::backends::headless::HeadlessDevice;
use crate::render::backends::vulkan::VulkanDevice;
use crate::render::pipeline::{DescriptorTier, PipelineDesc};
use crate::render::shader::ShaderSource;

/// Factory and command interface of a graphics backend
///
/// Creation calls hand back ids owned by the caller, who must destroy them
/// exactly once. Descriptor sets belong to the pipeline they were allocated
/// from and die with it. Recording calls (`cmd_*`) are only legal between
/// `begin_command_buffer` and `end_command_buffer`.
pub trait GraphicsDevice {
    /// Limits and identity of this device
    fn capabilities(&self) -> DeviceCapabilities;

    /// Compile a shader program from SPIR-V stages
    fn create_shader(&mut self, source: &ShaderSource) -> GfxResult<ShaderId>;
    /// Destroy a shader program
    fn destroy_shader(&mut self, shader: ShaderId) -> GfxResult<()>;

    /// Create a texture, optionally filled with tightly packed texel data
    fn create_texture(&mut self, desc: &TextureDesc, data: Option<&[u8]>) -> GfxResult<OwnedTexture>;
    /// Destroy a texture through its unique owner
    fn destroy_texture(&mut self, texture: OwnedTexture) -> GfxResult<()>;

    /// Create a render pass
    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> GfxResult<RenderPassId>;
    /// Destroy a render pass
    fn destroy_render_pass(&mut self, render_pass: RenderPassId) -> GfxResult<()>;

    /// Create a framebuffer compatible with `desc.render_pass`
    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> GfxResult<FramebufferId>;
    /// Destroy a framebuffer
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId) -> GfxResult<()>;

    /// Create a pipeline with its descriptor layouts and a pool sized from the description
    fn create_pipeline(&mut self, desc: &PipelineDesc) -> GfxResult<PipelineId>;
    /// Destroy a pipeline, its pool and every set allocated from it
    fn destroy_pipeline(&mut self, pipeline: PipelineId) -> GfxResult<()>;

    /// Allocate a descriptor set for one tier of a pipeline
    fn allocate_descriptor_set(&mut self, pipeline: PipelineId, tier: DescriptorTier) -> GfxResult<DescriptorSetId>;
    /// Apply writes to a descriptor set
    fn update_descriptor_set(&mut self, set: DescriptorSetId, writes: &[DescriptorWrite]) -> GfxResult<()>;
    /// Return a descriptor set to its pipeline's pool
    fn free_descriptor_set(&mut self, set: DescriptorSetId) -> GfxResult<()>;

    /// Create a host-visible buffer
    fn create_buffer(&mut self, usage: BufferUsage, size: u64) -> GfxResult<BufferId>;
    /// Copy `data` into a buffer at `offset`
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> GfxResult<()>;
    /// Destroy a buffer
    fn destroy_buffer(&mut self, buffer: BufferId) -> GfxResult<()>;

    /// Allocate a command buffer
    fn create_command_buffer(&mut self, level: CommandBufferLevel) -> GfxResult<CommandBufferId>;
    /// Free a command buffer
    fn destroy_command_buffer(&mut self, cmd: CommandBufferId) -> GfxResult<()>;

    /// Begin recording. Secondary buffers name the render pass and framebuffer
    /// they will execute inside; primary buffers pass `None`. A buffer whose
    /// previous submission is still pending is waited on first.
    fn begin_command_buffer(
        &mut self,
        cmd: CommandBufferId,
        inheritance: Option<(RenderPassId, FramebufferId)>,
    ) -> GfxResult<()>;
    /// Finish recording
    fn end_command_buffer(&mut self, cmd: CommandBufferId) -> GfxResult<()>;

    /// Begin a render pass on a primary buffer
    fn cmd_begin_render_pass(
        &mut self,
        cmd: CommandBufferId,
        render_pass: RenderPassId,
        framebuffer: FramebufferId,
        clear_colour: [f32; 4],
        contents: SubpassContents,
    ) -> GfxResult<()>;
    /// End the active render pass
    fn cmd_end_render_pass(&mut self, cmd: CommandBufferId) -> GfxResult<()>;
    /// Set viewport and scissor to cover `extent`
    fn cmd_set_viewport(&mut self, cmd: CommandBufferId, extent: Extent2D) -> GfxResult<()>;
    /// Bind a graphics pipeline
    fn cmd_bind_pipeline(&mut self, cmd: CommandBufferId, pipeline: PipelineId) -> GfxResult<()>;
    /// Bind descriptor sets starting at set 0, one dynamic offset per dynamic binding
    fn cmd_bind_descriptor_sets(
        &mut self,
        cmd: CommandBufferId,
        pipeline: PipelineId,
        sets: &[DescriptorSetId],
        dynamic_offsets: &[u32],
    ) -> GfxResult<()>;
    /// Bind a mesh's buffers and draw all of its indices
    fn cmd_draw_indexed(&mut self, cmd: CommandBufferId, mesh: &MeshBuffers) -> GfxResult<()>;
    /// Execute a finished secondary buffer inside the primary's active render pass
    fn cmd_execute_secondary(&mut self, primary: CommandBufferId, secondary: CommandBufferId) -> GfxResult<()>;

    /// Submit a primary buffer, optionally blocking until its fence signals
    fn submit(&mut self, cmd: CommandBufferId, wait_fence: bool) -> GfxResult<()>;

    /// Acquire the next presentable image
    fn acquire_next_image(&mut self) -> GfxResult<u32>;
    /// Submit `cmd` and present the swapchain image it rendered into
    fn present(&mut self, cmd: CommandBufferId, image_index: u32) -> GfxResult<()>;
    /// Recreate the swapchain for a new surface size
    fn resize_swapchain(&mut self, width: u32, height: u32) -> GfxResult<()>;

    /// Block until all submitted work has finished
    fn wait_idle(&mut self) -> GfxResult<()>;
}

/// Resolve the configured backend to a device
///
/// Vulkan devices created here render offscreen only; use
/// [`VulkanDevice::with_window`] when a presentation surface is needed.
pub fn create_device(config: &RendererConfig) -> GfxResult<Box<dyn GraphicsDevice>> {
    config
        .validate()
        .map_err(super::GfxError::InvalidDescription)?;

    let extent = Extent2D::new(config.width, config.height);
    let device: Box<dyn GraphicsDevice> = match config.backend {
        GraphicsApi::Headless => Box::new(HeadlessDevice::new(config.headless.clone(), extent)),
        GraphicsApi::Vulkan => Box::new(VulkanDevice::new_offscreen(config)?),
    };

    let caps = device.capabilities();
    log::info!(
        "Graphics device ready: {} on {} (uniform alignment {}, {} swapchain images)",
        caps.api,
        caps.device_name,
        caps.min_uniform_buffer_offset_alignment,
        caps.swapchain_image_count
    );

    Ok(device)
}
