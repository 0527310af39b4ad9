//! # Vulkan Backend
//!
//! [`VulkanDevice`] implements [`GraphicsDevice`] on top of `ash`. Resources
//! live in slot maps keyed by the same ids the headless backend hands out, and
//! each record owns its Vulkan objects through RAII wrappers.
//!
//! A device is either offscreen ([`VulkanDevice::new_offscreen`]), with no
//! surface and no swapchain, or attached to a window
//! ([`VulkanDevice::with_window`]) through `raw-window-handle`.
//!
//! Synchronisation is deliberately coarse: each primary command buffer owns a
//! fence, and host writes into a buffer the GPU may still be reading wait for
//! outstanding work first.

pub mod context;
pub mod convert;
pub mod pipeline;
pub mod resources;
pub mod swapchain;

pub use context::{VulkanError, VulkanResult};

use ash::extensions::khr::Surface;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use slotmap::SlotMap;

use self::context::{LogicalDevice, PhysicalDeviceInfo, SurfaceInfo, VulkanInstance};
use self::pipeline::{VulkanFramebuffer, VulkanPipeline, VulkanRenderPass, VulkanShader};
use self::resources::{check_range, transition_layout, UploadContext, VulkanBuffer, VulkanTexture};
use self::swapchain::Swapchain;
use crate::core::{GraphicsApi, RendererConfig};
use crate::render::gfx::{
    BufferId, BufferUsage, CommandBufferId, CommandBufferLevel, DescriptorSetId, DescriptorWrite,
    DeviceCapabilities, Extent2D, Format, FramebufferAttachment, FramebufferDesc, FramebufferId,
    GfxError, GfxResult, GraphicsDevice, MeshBuffers, OwnedTexture, PipelineId, RenderPassDesc,
    RenderPassId, ShaderId, SubpassContents, TextureDesc, TextureId,
};
use crate::render::pipeline::{DescriptorTier, PipelineDesc};
use crate::render::shader::ShaderSource;

/// Format `Presentation` resolves to when there is no swapchain
const OFFSCREEN_PRESENTATION_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

impl From<vk::Result> for GfxError {
    fn from(result: vk::Result) -> Self {
        Self::Vulkan(VulkanError::Api(result))
    }
}

struct BufferRecord {
    buffer: VulkanBuffer,
    usage: BufferUsage,
}

struct DescriptorSetRecord {
    raw: vk::DescriptorSet,
    pipeline: PipelineId,
    tier: DescriptorTier,
}

struct CommandBufferRecord {
    raw: vk::CommandBuffer,
    level: CommandBufferLevel,
    /// Own fence for primaries, null for secondaries
    fence: vk::Fence,
    /// Fence of the submission this buffer is part of, while it may still run
    in_flight: Option<vk::Fence>,
    recording: bool,
    active_framebuffer: Option<FramebufferId>,
    executed: Vec<CommandBufferId>,
}

impl CommandBufferRecord {
    fn invalid(&self, state: &str, operation: &'static str) -> GfxError {
        GfxError::InvalidState {
            resource: "command buffer",
            state: state.into(),
            operation,
        }
    }

    fn require_recording(&self, operation: &'static str) -> GfxResult<()> {
        if self.recording {
            Ok(())
        } else {
            Err(self.invalid("not recording", operation))
        }
    }
}

struct PresentationSurface {
    loader: Surface,
    surface: vk::SurfaceKHR,
    swapchain: Option<Swapchain>,
    image_available: Vec<vk::Semaphore>,
    render_finished: Vec<vk::Semaphore>,
    /// Command buffer that last presented from each frame slot
    slot_owners: Vec<Option<CommandBufferId>>,
    current_slot: usize,
    acquired: Option<(u32, usize)>,
}

/// Vulkan implementation of [`GraphicsDevice`]
pub struct VulkanDevice {
    shaders: SlotMap<ShaderId, VulkanShader>,
    textures: SlotMap<TextureId, VulkanTexture>,
    render_passes: SlotMap<RenderPassId, VulkanRenderPass>,
    framebuffers: SlotMap<FramebufferId, VulkanFramebuffer>,
    pipelines: SlotMap<PipelineId, VulkanPipeline>,
    descriptor_sets: SlotMap<DescriptorSetId, DescriptorSetRecord>,
    buffers: SlotMap<BufferId, BufferRecord>,
    command_buffers: SlotMap<CommandBufferId, CommandBufferRecord>,
    command_pool: vk::CommandPool,
    presentation: Option<PresentationSurface>,
    offscreen_extent: Extent2D,
    physical: PhysicalDeviceInfo,
    // Dropped after everything above, device before instance
    logical: LogicalDevice,
    instance: VulkanInstance,
}

impl VulkanDevice {
    /// Device with no presentation surface; output goes to render targets only
    pub fn new_offscreen(config: &RendererConfig) -> GfxResult<Self> {
        let instance = create_instance(config, &[])?;
        let physical = PhysicalDeviceInfo::select_suitable_device(&instance.instance, None)?;
        let logical = LogicalDevice::new(&instance.instance, &physical)?;
        let device = Self::assemble(config, instance, physical, logical, None)?;
        log::info!("Vulkan offscreen device ready on {}", device.physical.name());
        Ok(device)
    }

    /// Device presenting to the window behind `display` and `window`
    ///
    /// # Safety
    ///
    /// The handles must refer to a live window that outlives the device.
    pub unsafe fn with_window(
        config: &RendererConfig,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> GfxResult<Self> {
        let extensions = ash_window::enumerate_required_extensions(display)?;
        let instance = create_instance(config, extensions)?;

        let loader = Surface::new(&instance.entry, &instance.instance);
        let surface = ash_window::create_surface(&instance.entry, &instance.instance, display, window, None)?;

        let selected = PhysicalDeviceInfo::select_suitable_device(
            &instance.instance,
            Some(&SurfaceInfo { surface, loader: &loader }),
        )
        .and_then(|physical| {
            let logical = LogicalDevice::new(&instance.instance, &physical)?;
            Ok((physical, logical))
        });
        let (physical, logical) = match selected {
            Ok(pair) => pair,
            Err(e) => {
                loader.destroy_surface(surface, None);
                return Err(e.into());
            }
        };

        let presentation = PresentationSurface {
            loader,
            surface,
            swapchain: None,
            image_available: Vec::new(),
            render_finished: Vec::new(),
            slot_owners: Vec::new(),
            current_slot: 0,
            acquired: None,
        };
        let device = Self::assemble(config, instance, physical, logical, Some(presentation))?;
        log::info!("Vulkan windowed device ready on {}", device.physical.name());
        Ok(device)
    }

    fn assemble(
        config: &RendererConfig,
        instance: VulkanInstance,
        physical: PhysicalDeviceInfo,
        logical: LogicalDevice,
        presentation: Option<PresentationSurface>,
    ) -> GfxResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(physical.graphics_family);
        let command_pool = unsafe { logical.device.create_command_pool(&pool_info, None)? };

        // Drop cleans up whatever the remaining steps manage to create
        let mut device = Self {
            shaders: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            render_passes: SlotMap::with_key(),
            framebuffers: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            descriptor_sets: SlotMap::with_key(),
            buffers: SlotMap::with_key(),
            command_buffers: SlotMap::with_key(),
            command_pool,
            presentation,
            offscreen_extent: Extent2D::new(config.width, config.height),
            physical,
            logical,
            instance,
        };

        if device.presentation.is_some() {
            device.create_frame_sync(config.max_frames_in_flight.max(1))?;
            device.rebuild_swapchain(vk::Extent2D {
                width: config.width,
                height: config.height,
            })?;
        }

        Ok(device)
    }

    fn create_frame_sync(&mut self, frames: usize) -> GfxResult<()> {
        let device = &self.logical.device;
        let Some(presentation) = self.presentation.as_mut() else {
            return Ok(());
        };
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        for _ in 0..frames {
            presentation
                .image_available
                .push(unsafe { device.create_semaphore(&semaphore_info, None)? });
            presentation
                .render_finished
                .push(unsafe { device.create_semaphore(&semaphore_info, None)? });
            presentation.slot_owners.push(None);
        }
        Ok(())
    }

    fn rebuild_swapchain(&mut self, requested: vk::Extent2D) -> GfxResult<()> {
        let loader = self
            .logical
            .swapchain_loader
            .as_ref()
            .ok_or_else(|| GfxError::InitializationFailed("device was created without swapchain support".into()))?;
        let Some(presentation) = self.presentation.as_mut() else {
            return Ok(());
        };

        let old = presentation
            .swapchain
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), Swapchain::handle);
        let swapchain = Swapchain::new(
            &self.logical.device,
            loader,
            self.physical.device,
            presentation.surface,
            &presentation.loader,
            requested,
            old,
        )?;
        presentation.swapchain = Some(swapchain);
        presentation.acquired = None;
        Ok(())
    }

    fn presentation_format(&self) -> vk::Format {
        self.presentation
            .as_ref()
            .and_then(|p| p.swapchain.as_ref())
            .map_or(OFFSCREEN_PRESENTATION_FORMAT, Swapchain::format)
    }

    fn swapchain(&self) -> Option<&Swapchain> {
        self.presentation.as_ref().and_then(|p| p.swapchain.as_ref())
    }

    fn record(&self, cmd: CommandBufferId) -> GfxResult<&CommandBufferRecord> {
        self.command_buffers
            .get(cmd)
            .ok_or(GfxError::UnknownHandle { kind: "command buffer" })
    }

    fn record_mut(&mut self, cmd: CommandBufferId) -> GfxResult<&mut CommandBufferRecord> {
        self.command_buffers
            .get_mut(cmd)
            .ok_or(GfxError::UnknownHandle { kind: "command buffer" })
    }

    /// Block until the submission `cmd` belongs to has finished
    fn wait_command_buffer(&mut self, cmd: CommandBufferId) -> GfxResult<()> {
        let record = self.record(cmd)?;
        let Some(fence) = record.in_flight else {
            return Ok(());
        };
        unsafe { self.logical.device.wait_for_fences(&[fence], true, u64::MAX)? };
        self.complete(cmd)
    }

    /// Forget that `cmd` is in flight; its fence has signalled
    fn complete(&mut self, cmd: CommandBufferId) -> GfxResult<()> {
        let device = &self.logical.device;
        let record = self
            .command_buffers
            .get_mut(cmd)
            .ok_or(GfxError::UnknownHandle { kind: "command buffer" })?;
        if record.in_flight.take().is_none() {
            return Ok(());
        }
        if record.level == CommandBufferLevel::Primary {
            unsafe { device.reset_fences(&[record.fence])? };
            let executed = std::mem::take(&mut record.executed);
            for secondary in executed {
                if let Some(secondary) = self.command_buffers.get_mut(secondary) {
                    secondary.in_flight = None;
                }
            }
        }
        Ok(())
    }

    /// Wait for all outstanding GPU work when anything is in flight
    fn settle(&mut self) -> GfxResult<()> {
        if self.command_buffers.values().all(|r| r.in_flight.is_none()) {
            return Ok(());
        }
        self.wait_idle()
    }

    fn queue_submit(
        &mut self,
        cmd: CommandBufferId,
        wait: Option<vk::Semaphore>,
        signal: Option<vk::Semaphore>,
    ) -> GfxResult<()> {
        let record = self.record(cmd)?;
        if record.level != CommandBufferLevel::Primary {
            return Err(record.invalid("secondary", "submit"));
        }
        if record.recording {
            return Err(record.invalid("recording", "submit"));
        }
        if record.in_flight.is_some() {
            return Err(record.invalid("pending", "submit"));
        }

        let command_buffers = [record.raw];
        let wait_semaphores: Vec<vk::Semaphore> = wait.into_iter().collect();
        let wait_stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; wait_semaphores.len()];
        let signal_semaphores: Vec<vk::Semaphore> = signal.into_iter().collect();
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        let fence = record.fence;
        unsafe {
            self.logical
                .device
                .queue_submit(self.logical.graphics_queue, &[submit_info], fence)?;
        }

        let record = self.record_mut(cmd)?;
        record.in_flight = Some(fence);
        let executed = record.executed.clone();
        for secondary in executed {
            if let Some(secondary) = self.command_buffers.get_mut(secondary) {
                secondary.in_flight = Some(fence);
            }
        }
        Ok(())
    }

    fn attachment_view(
        &self,
        attachment: &FramebufferAttachment,
        format: Format,
        desc: &FramebufferDesc,
    ) -> GfxResult<vk::ImageView> {
        match attachment {
            FramebufferAttachment::SwapchainImage(index) => {
                let swapchain = self.swapchain().ok_or_else(|| {
                    GfxError::InvalidDescription(format!("framebuffer '{}' names a swapchain image but there is no swapchain", desc.label))
                })?;
                if format != Format::Presentation {
                    return Err(GfxError::InvalidDescription(format!(
                        "framebuffer '{}' binds a swapchain image to a {format:?} attachment",
                        desc.label
                    )));
                }
                let extent = swapchain.extent();
                if extent.width != desc.width || extent.height != desc.height {
                    return Err(GfxError::InvalidDescription(format!(
                        "framebuffer '{}' is {}x{} but the swapchain is {}x{}",
                        desc.label, desc.width, desc.height, extent.width, extent.height
                    )));
                }
                swapchain.image_view(*index).ok_or_else(|| {
                    GfxError::InvalidDescription(format!(
                        "framebuffer '{}' names swapchain image {index} of {}",
                        desc.label,
                        swapchain.image_count()
                    ))
                })
            }
            FramebufferAttachment::Texture(texture) => {
                let record = self
                    .textures
                    .get(texture.id())
                    .ok_or(GfxError::UnknownHandle { kind: "texture" })?;
                let tex = record.desc();
                if !tex.render_target || tex.format != format || tex.width != desc.width || tex.height != desc.height {
                    return Err(GfxError::InvalidDescription(format!(
                        "texture '{}' ({:?}, {}x{}) cannot back a {format:?} attachment of framebuffer '{}' ({}x{})",
                        tex.label, tex.format, tex.width, tex.height, desc.label, desc.width, desc.height
                    )));
                }
                Ok(record.view())
            }
        }
    }

    /// Raw instance handle, for integrations that create their own surfaces
    pub fn instance_handle(&self) -> vk::Instance {
        self.instance.instance.handle()
    }

    /// Number of live objects, for leak reports
    pub fn live_object_count(&self) -> usize {
        self.shaders.len()
            + self.textures.len()
            + self.render_passes.len()
            + self.framebuffers.len()
            + self.pipelines.len()
            + self.buffers.len()
            + self.command_buffers.len()
    }
}

fn create_instance(config: &RendererConfig, extensions: &[*const std::ffi::c_char]) -> GfxResult<VulkanInstance> {
    let validation = config.enable_validation.unwrap_or(cfg!(debug_assertions));
    match VulkanInstance::new(&config.application_name, extensions, validation) {
        Ok(instance) => Ok(instance),
        Err(VulkanError::Api(vk::Result::ERROR_LAYER_NOT_PRESENT | vk::Result::ERROR_EXTENSION_NOT_PRESENT))
            if validation =>
        {
            log::warn!("Vulkan validation layers unavailable, continuing without them");
            Ok(VulkanInstance::new(&config.application_name, extensions, false)?)
        }
        Err(e) => Err(e.into()),
    }
}

impl GraphicsDevice for VulkanDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        let limits = &self.physical.properties.limits;
        let (swapchain_image_count, presentation_extent) = match self.swapchain() {
            Some(swapchain) => {
                let extent = swapchain.extent();
                (swapchain.image_count(), Extent2D::new(extent.width, extent.height))
            }
            None => (0, self.offscreen_extent),
        };
        DeviceCapabilities {
            api: GraphicsApi::Vulkan,
            device_name: self.physical.name(),
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            max_color_attachments: limits.max_color_attachments,
            swapchain_image_count,
            presentation_extent,
        }
    }

    fn create_shader(&mut self, source: &ShaderSource) -> GfxResult<ShaderId> {
        source.check().map_err(|reason| GfxError::ShaderRejected {
            name: source.name.clone(),
            reason,
        })?;
        let shader = VulkanShader::new(&self.logical.device, source).map_err(|e| GfxError::ShaderRejected {
            name: source.name.clone(),
            reason: e.to_string(),
        })?;
        log::debug!("Created shader '{}' with {} stages", shader.name(), source.stages.len());
        Ok(self.shaders.insert(shader))
    }

    fn destroy_shader(&mut self, shader: ShaderId) -> GfxResult<()> {
        self.shaders
            .remove(shader)
            .map(drop)
            .ok_or(GfxError::UnknownHandle { kind: "shader" })
    }

    fn create_texture(&mut self, desc: &TextureDesc, data: Option<&[u8]>) -> GfxResult<OwnedTexture> {
        desc.validate(data)?;
        let upload = UploadContext {
            memory_properties: &self.physical.memory_properties,
            pool: self.command_pool,
            queue: self.logical.graphics_queue,
            presentation_format: self.presentation_format(),
        };
        let texture = VulkanTexture::new(&self.logical.device, &upload, desc, data)?;
        let id = self.textures.insert(texture);
        Ok(OwnedTexture::new(id, desc))
    }

    fn destroy_texture(&mut self, texture: OwnedTexture) -> GfxResult<()> {
        let id = texture.id();
        if self.framebuffers.values().any(|fb| fb.attaches(id)) {
            return Err(GfxError::InvalidState {
                resource: "texture",
                state: "attached to a live framebuffer".into(),
                operation: "destroy",
            });
        }
        if !self.textures.contains_key(id) {
            return Err(GfxError::UnknownHandle { kind: "texture" });
        }
        self.settle()?;
        self.textures.remove(id);
        Ok(())
    }

    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> GfxResult<RenderPassId> {
        desc.validate(self.physical.properties.limits.max_color_attachments)?;
        let pass = VulkanRenderPass::new(&self.logical.device, desc, self.presentation_format())?;
        Ok(self.render_passes.insert(pass))
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassId) -> GfxResult<()> {
        if !self.render_passes.contains_key(render_pass) {
            return Err(GfxError::UnknownHandle { kind: "render pass" });
        }
        self.settle()?;
        self.render_passes.remove(render_pass);
        Ok(())
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> GfxResult<FramebufferId> {
        let pass = self
            .render_passes
            .get(desc.render_pass)
            .ok_or(GfxError::UnknownHandle { kind: "render pass" })?;
        if pass.desc().attachments.len() != desc.attachments.len() {
            return Err(GfxError::InvalidDescription(format!(
                "framebuffer '{}' has {} attachments, render pass '{}' expects {}",
                desc.label,
                desc.attachments.len(),
                pass.desc().label,
                pass.desc().attachments.len()
            )));
        }
        if desc.width == 0 || desc.height == 0 {
            return Err(GfxError::InvalidDescription(format!("framebuffer '{}' has zero extent", desc.label)));
        }

        let mut views = Vec::with_capacity(desc.attachments.len());
        let mut textures = Vec::new();
        let mut presentation_textures = Vec::new();
        for (attachment, expected) in desc.attachments.iter().zip(&pass.desc().attachments) {
            views.push(self.attachment_view(attachment, expected.format, desc)?);
            if let FramebufferAttachment::Texture(texture) = attachment {
                textures.push(texture.id());
                if expected.format == Format::Presentation {
                    if let Some(record) = self.textures.get(texture.id()) {
                        presentation_textures.push(record.image());
                    }
                }
            }
        }

        let framebuffer = VulkanFramebuffer::new(
            &self.logical.device,
            pass.handle(),
            &views,
            vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
            textures,
            presentation_textures,
        )?;
        Ok(self.framebuffers.insert(framebuffer))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId) -> GfxResult<()> {
        if !self.framebuffers.contains_key(framebuffer) {
            return Err(GfxError::UnknownHandle { kind: "framebuffer" });
        }
        self.settle()?;
        self.framebuffers.remove(framebuffer);
        Ok(())
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> GfxResult<PipelineId> {
        let shader = self
            .shaders
            .get(desc.shader)
            .ok_or(GfxError::UnknownHandle { kind: "shader" })?;
        let pass = self
            .render_passes
            .get(desc.render_pass)
            .ok_or(GfxError::UnknownHandle { kind: "render pass" })?;
        if pass.desc().colour_count() != desc.color_attachment_count as usize {
            return Err(GfxError::InvalidDescription(format!(
                "pipeline '{}' writes {} colour attachments, render pass '{}' has {}",
                desc.name,
                desc.color_attachment_count,
                pass.desc().label,
                pass.desc().colour_count()
            )));
        }
        let pipeline = VulkanPipeline::new(&self.logical.device, desc, shader, pass.handle())?;
        log::debug!("Created pipeline '{}' ({}x{})", desc.name, desc.width, desc.height);
        Ok(self.pipelines.insert(pipeline))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) -> GfxResult<()> {
        if !self.pipelines.contains_key(pipeline) {
            return Err(GfxError::UnknownHandle { kind: "pipeline" });
        }
        self.settle()?;
        // Sets die with the pool
        self.descriptor_sets.retain(|_, set| set.pipeline != pipeline);
        self.pipelines.remove(pipeline);
        Ok(())
    }

    fn allocate_descriptor_set(&mut self, pipeline: PipelineId, tier: DescriptorTier) -> GfxResult<DescriptorSetId> {
        let record = self
            .pipelines
            .get(pipeline)
            .ok_or(GfxError::UnknownHandle { kind: "pipeline" })?;

        let capacity = record.desc().max_objects as usize * DescriptorTier::ALL.len();
        let allocated = self.descriptor_sets.values().filter(|s| s.pipeline == pipeline).count();
        let exhausted = GfxError::DescriptorPoolExhausted {
            sets: allocated as u64 + 1,
            capacity: capacity as u64,
        };
        if allocated >= capacity {
            return Err(exhausted);
        }

        let raw = match record.allocate_set(tier) {
            Ok(raw) => raw,
            Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL)) => {
                return Err(exhausted)
            }
            Err(e) => return Err(e.into()),
        };
        Ok(self.descriptor_sets.insert(DescriptorSetRecord { raw, pipeline, tier }))
    }

    fn update_descriptor_set(&mut self, set: DescriptorSetId, writes: &[DescriptorWrite]) -> GfxResult<()> {
        let record = self
            .descriptor_sets
            .get(set)
            .ok_or(GfxError::UnknownHandle { kind: "descriptor set" })?;
        let pipeline = self
            .pipelines
            .get(record.pipeline)
            .ok_or(GfxError::UnknownHandle { kind: "pipeline" })?;
        let layout = pipeline.desc().layout(record.tier);

        enum Info {
            Image(vk::DescriptorImageInfo),
            Buffer(vk::DescriptorBufferInfo),
        }

        let mut infos = Vec::with_capacity(writes.len());
        for write in writes {
            layout.validate_write(write)?;
            let info = match write {
                DescriptorWrite::Image { texture, .. } => {
                    let target = self
                        .textures
                        .get(texture.id())
                        .ok_or(GfxError::UnknownHandle { kind: "texture" })?;
                    Info::Image(vk::DescriptorImageInfo {
                        sampler: target.sampler(),
                        image_view: target.view(),
                        image_layout: convert::resting_layout(target.desc().format),
                    })
                }
                DescriptorWrite::Buffer { buffer, offset, range, .. } => {
                    let target = self
                        .buffers
                        .get(*buffer)
                        .ok_or(GfxError::UnknownHandle { kind: "buffer" })?;
                    if target.usage != BufferUsage::Uniform {
                        return Err(GfxError::InvalidDescription(format!(
                            "binding {} needs a uniform buffer, got {:?}",
                            write.binding(),
                            target.usage
                        )));
                    }
                    let size = target.buffer.size();
                    if offset + range > size {
                        return Err(GfxError::OutOfMemory {
                            requested: offset + range,
                            available: size,
                        });
                    }
                    Info::Buffer(vk::DescriptorBufferInfo {
                        buffer: target.buffer.handle(),
                        offset: *offset,
                        range: *range,
                    })
                }
            };
            infos.push(info);
        }

        let mut vk_writes = Vec::with_capacity(writes.len());
        for (write, info) in writes.iter().zip(&infos) {
            let binding = layout
                .binding(write.binding())
                .ok_or_else(|| GfxError::InvalidDescription(format!("binding {} is not in the layout", write.binding())))?;
            let builder = vk::WriteDescriptorSet::builder()
                .dst_set(record.raw)
                .dst_binding(write.binding())
                .dst_array_element(0)
                .descriptor_type(convert::descriptor_type(binding.ty));
            let vk_write = match info {
                Info::Image(image) => builder.image_info(std::slice::from_ref(image)).build(),
                Info::Buffer(buffer) => builder.buffer_info(std::slice::from_ref(buffer)).build(),
            };
            vk_writes.push(vk_write);
        }

        unsafe { self.logical.device.update_descriptor_sets(&vk_writes, &[]) };
        Ok(())
    }

    fn free_descriptor_set(&mut self, set: DescriptorSetId) -> GfxResult<()> {
        if !self.descriptor_sets.contains_key(set) {
            return Err(GfxError::UnknownHandle { kind: "descriptor set" });
        }
        self.settle()?;
        if let Some(record) = self.descriptor_sets.remove(set) {
            if let Some(pipeline) = self.pipelines.get(record.pipeline) {
                pipeline.free_set(record.raw)?;
            }
        }
        Ok(())
    }

    fn create_buffer(&mut self, usage: BufferUsage, size: u64) -> GfxResult<BufferId> {
        if size == 0 {
            return Err(GfxError::InvalidDescription("buffer size must be non-zero".into()));
        }
        let buffer = VulkanBuffer::for_usage(&self.logical.device, &self.physical.memory_properties, usage, size)?;
        Ok(self.buffers.insert(BufferRecord { buffer, usage }))
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> GfxResult<()> {
        let record = self
            .buffers
            .get(buffer)
            .ok_or(GfxError::UnknownHandle { kind: "buffer" })?;
        check_range(record.buffer.size(), offset, data.len())
            .map_err(|(requested, available)| GfxError::OutOfMemory { requested, available })?;

        self.settle()?;
        if let Some(record) = self.buffers.get(buffer) {
            record.buffer.write(offset, data)?;
        }
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) -> GfxResult<()> {
        if !self.buffers.contains_key(buffer) {
            return Err(GfxError::UnknownHandle { kind: "buffer" });
        }
        self.settle()?;
        self.buffers.remove(buffer);
        Ok(())
    }

    fn create_command_buffer(&mut self, level: CommandBufferLevel) -> GfxResult<CommandBufferId> {
        let device = &self.logical.device;
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(match level {
                CommandBufferLevel::Primary => vk::CommandBufferLevel::PRIMARY,
                CommandBufferLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
            })
            .command_buffer_count(1);
        let raw = unsafe { device.allocate_command_buffers(&alloc_info)? }[0];

        let fence = match level {
            CommandBufferLevel::Primary => match unsafe { device.create_fence(&vk::FenceCreateInfo::builder(), None) } {
                Ok(fence) => fence,
                Err(e) => {
                    unsafe { device.free_command_buffers(self.command_pool, &[raw]) };
                    return Err(e.into());
                }
            },
            CommandBufferLevel::Secondary => vk::Fence::null(),
        };

        Ok(self.command_buffers.insert(CommandBufferRecord {
            raw,
            level,
            fence,
            in_flight: None,
            recording: false,
            active_framebuffer: None,
            executed: Vec::new(),
        }))
    }

    fn destroy_command_buffer(&mut self, cmd: CommandBufferId) -> GfxResult<()> {
        self.wait_command_buffer(cmd)?;
        if let Some(record) = self.command_buffers.remove(cmd) {
            unsafe {
                self.logical
                    .device
                    .free_command_buffers(self.command_pool, &[record.raw]);
                if record.fence != vk::Fence::null() {
                    self.logical.device.destroy_fence(record.fence, None);
                }
            }
        }
        Ok(())
    }

    fn begin_command_buffer(
        &mut self,
        cmd: CommandBufferId,
        inheritance: Option<(RenderPassId, FramebufferId)>,
    ) -> GfxResult<()> {
        let record = self.record(cmd)?;
        if record.recording {
            return Err(record.invalid("recording", "begin"));
        }
        self.wait_command_buffer(cmd)?;

        let inherited = match (self.record(cmd)?.level, inheritance) {
            (CommandBufferLevel::Primary, None) => None,
            (CommandBufferLevel::Secondary, Some((render_pass, framebuffer))) => {
                let pass = self
                    .render_passes
                    .get(render_pass)
                    .ok_or(GfxError::UnknownHandle { kind: "render pass" })?;
                let fb = self
                    .framebuffers
                    .get(framebuffer)
                    .ok_or(GfxError::UnknownHandle { kind: "framebuffer" })?;
                Some((pass.handle(), fb.handle()))
            }
            (CommandBufferLevel::Primary, Some(_)) => {
                return Err(GfxError::InvalidDescription("primary command buffers do not inherit a render pass".into()))
            }
            (CommandBufferLevel::Secondary, None) => {
                return Err(GfxError::InvalidDescription("secondary command buffers must inherit a render pass".into()))
            }
        };

        let record = self.record(cmd)?;
        let device = &self.logical.device;
        unsafe { device.reset_command_buffer(record.raw, vk::CommandBufferResetFlags::empty())? };

        match inherited {
            Some((render_pass, framebuffer)) => {
                let inheritance_info = vk::CommandBufferInheritanceInfo::builder()
                    .render_pass(render_pass)
                    .subpass(0)
                    .framebuffer(framebuffer);
                let begin_info = vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE)
                    .inheritance_info(&inheritance_info);
                unsafe { device.begin_command_buffer(record.raw, &begin_info)? };
            }
            None => {
                let begin_info = vk::CommandBufferBeginInfo::builder();
                unsafe { device.begin_command_buffer(record.raw, &begin_info)? };
            }
        }

        let record = self.record_mut(cmd)?;
        record.recording = true;
        record.executed.clear();
        record.active_framebuffer = None;
        Ok(())
    }

    fn end_command_buffer(&mut self, cmd: CommandBufferId) -> GfxResult<()> {
        let record = self.record(cmd)?;
        record.require_recording("end")?;
        if record.active_framebuffer.is_some() {
            return Err(record.invalid("inside render pass", "end"));
        }
        unsafe { self.logical.device.end_command_buffer(record.raw)? };
        self.record_mut(cmd)?.recording = false;
        Ok(())
    }

    fn cmd_begin_render_pass(
        &mut self,
        cmd: CommandBufferId,
        render_pass: RenderPassId,
        framebuffer: FramebufferId,
        clear_colour: [f32; 4],
        contents: SubpassContents,
    ) -> GfxResult<()> {
        let record = self.record(cmd)?;
        record.require_recording("begin render pass")?;
        if record.level != CommandBufferLevel::Primary {
            return Err(record.invalid("secondary", "begin render pass"));
        }
        if record.active_framebuffer.is_some() {
            return Err(record.invalid("inside render pass", "begin render pass"));
        }
        let pass = self
            .render_passes
            .get(render_pass)
            .ok_or(GfxError::UnknownHandle { kind: "render pass" })?;
        let fb = self
            .framebuffers
            .get(framebuffer)
            .ok_or(GfxError::UnknownHandle { kind: "framebuffer" })?;

        let clear_values: Vec<vk::ClearValue> = pass
            .desc()
            .attachments
            .iter()
            .map(|attachment| {
                if attachment.format.is_depth() {
                    vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
                    }
                } else {
                    vk::ClearValue {
                        color: vk::ClearColorValue { float32: clear_colour },
                    }
                }
            })
            .collect();

        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(pass.handle())
            .framebuffer(fb.handle())
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: fb.extent(),
            })
            .clear_values(&clear_values);
        let contents = match contents {
            SubpassContents::Inline => vk::SubpassContents::INLINE,
            SubpassContents::SecondaryCommandBuffers => vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
        };
        unsafe {
            self.logical
                .device
                .cmd_begin_render_pass(record.raw, &begin_info, contents);
        }

        self.record_mut(cmd)?.active_framebuffer = Some(framebuffer);
        Ok(())
    }

    fn cmd_end_render_pass(&mut self, cmd: CommandBufferId) -> GfxResult<()> {
        let record = self.record(cmd)?;
        record.require_recording("end render pass")?;
        let framebuffer = record
            .active_framebuffer
            .ok_or_else(|| record.invalid("outside render pass", "end render pass"))?;
        let raw = record.raw;
        let device = &self.logical.device;
        unsafe { device.cmd_end_render_pass(raw) };

        // Presentation-format textures leave the pass presentable; make them sampleable again
        if let Some(fb) = self.framebuffers.get(framebuffer) {
            for &image in fb.presentation_textures() {
                transition_layout(
                    device,
                    raw,
                    image,
                    vk::ImageAspectFlags::COLOR,
                    1,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
            }
        }

        self.record_mut(cmd)?.active_framebuffer = None;
        Ok(())
    }

    fn cmd_set_viewport(&mut self, cmd: CommandBufferId, extent: Extent2D) -> GfxResult<()> {
        let record = self.record(cmd)?;
        record.require_recording("set viewport")?;
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: extent.width,
                height: extent.height,
            },
        };
        unsafe {
            self.logical.device.cmd_set_viewport(record.raw, 0, &[viewport]);
            self.logical.device.cmd_set_scissor(record.raw, 0, &[scissor]);
        }
        Ok(())
    }

    fn cmd_bind_pipeline(&mut self, cmd: CommandBufferId, pipeline: PipelineId) -> GfxResult<()> {
        let record = self.record(cmd)?;
        record.require_recording("bind pipeline")?;
        let target = self
            .pipelines
            .get(pipeline)
            .ok_or(GfxError::UnknownHandle { kind: "pipeline" })?;
        unsafe {
            self.logical
                .device
                .cmd_bind_pipeline(record.raw, vk::PipelineBindPoint::GRAPHICS, target.handle());
        }
        Ok(())
    }

    fn cmd_bind_descriptor_sets(
        &mut self,
        cmd: CommandBufferId,
        pipeline: PipelineId,
        sets: &[DescriptorSetId],
        dynamic_offsets: &[u32],
    ) -> GfxResult<()> {
        let record = self.record(cmd)?;
        record.require_recording("bind descriptor sets")?;
        let target = self
            .pipelines
            .get(pipeline)
            .ok_or(GfxError::UnknownHandle { kind: "pipeline" })?;

        let alignment = self.physical.properties.limits.min_uniform_buffer_offset_alignment.max(1);
        if let Some(offset) = dynamic_offsets.iter().find(|&&o| u64::from(o) % alignment != 0) {
            return Err(GfxError::InvalidDescription(format!(
                "dynamic offset {offset} is not a multiple of {alignment}"
            )));
        }

        let raw_sets = sets
            .iter()
            .map(|&set| {
                self.descriptor_sets
                    .get(set)
                    .filter(|s| s.pipeline == pipeline)
                    .map(|s| s.raw)
                    .ok_or(GfxError::UnknownHandle { kind: "descriptor set" })
            })
            .collect::<GfxResult<Vec<_>>>()?;

        unsafe {
            self.logical.device.cmd_bind_descriptor_sets(
                record.raw,
                vk::PipelineBindPoint::GRAPHICS,
                target.layout(),
                0,
                &raw_sets,
                dynamic_offsets,
            );
        }
        Ok(())
    }

    fn cmd_draw_indexed(&mut self, cmd: CommandBufferId, mesh: &MeshBuffers) -> GfxResult<()> {
        let record = self.record(cmd)?;
        record.require_recording("draw")?;
        let vertices = self
            .buffers
            .get(mesh.vertex_buffer)
            .ok_or(GfxError::UnknownHandle { kind: "buffer" })?;
        let indices = self
            .buffers
            .get(mesh.index_buffer)
            .ok_or(GfxError::UnknownHandle { kind: "buffer" })?;
        unsafe {
            let device = &self.logical.device;
            device.cmd_bind_vertex_buffers(record.raw, 0, &[vertices.buffer.handle()], &[0]);
            device.cmd_bind_index_buffer(record.raw, indices.buffer.handle(), 0, vk::IndexType::UINT32);
            device.cmd_draw_indexed(record.raw, mesh.index_count, 1, 0, 0, 0);
        }
        Ok(())
    }

    fn cmd_execute_secondary(&mut self, primary: CommandBufferId, secondary: CommandBufferId) -> GfxResult<()> {
        let outer = self.record(primary)?;
        outer.require_recording("execute secondary")?;
        if outer.active_framebuffer.is_none() {
            return Err(outer.invalid("outside render pass", "execute secondary"));
        }
        let inner = self.record(secondary)?;
        if inner.level != CommandBufferLevel::Secondary || inner.recording {
            return Err(inner.invalid("not an executable secondary", "execute"));
        }
        unsafe {
            self.logical
                .device
                .cmd_execute_commands(outer.raw, &[inner.raw]);
        }
        self.record_mut(primary)?.executed.push(secondary);
        Ok(())
    }

    fn submit(&mut self, cmd: CommandBufferId, wait_fence: bool) -> GfxResult<()> {
        self.queue_submit(cmd, None, None)?;
        if wait_fence {
            self.wait_command_buffer(cmd)?;
        }
        Ok(())
    }

    fn acquire_next_image(&mut self) -> GfxResult<u32> {
        let absent = || GfxError::InvalidState {
            resource: "swapchain",
            state: "absent".into(),
            operation: "acquire",
        };
        let presentation = self.presentation.as_ref().ok_or_else(absent)?;
        let slot = presentation.current_slot;
        let owner = presentation.slot_owners[slot];
        if let Some(owner) = owner {
            if self.command_buffers.contains_key(owner) {
                self.wait_command_buffer(owner)?;
            }
        }

        let loader = self.logical.swapchain_loader.as_ref().ok_or_else(absent)?;
        let presentation = self.presentation.as_mut().ok_or_else(absent)?;
        let swapchain = presentation.swapchain.as_ref().ok_or_else(absent)?;
        let acquired = unsafe {
            loader.acquire_next_image(
                swapchain.handle(),
                u64::MAX,
                presentation.image_available[slot],
                vk::Fence::null(),
            )
        };
        match acquired {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Swapchain is suboptimal for the surface");
                }
                presentation.acquired = Some((index, slot));
                Ok(index)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GfxError::SwapchainOutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn present(&mut self, cmd: CommandBufferId, image_index: u32) -> GfxResult<()> {
        let not_acquired = || GfxError::InvalidState {
            resource: "swapchain image",
            state: "not acquired".into(),
            operation: "present",
        };
        let presentation = self.presentation.as_ref().ok_or_else(not_acquired)?;
        let slot = match presentation.acquired {
            Some((index, slot)) if index == image_index => slot,
            _ => return Err(not_acquired()),
        };
        let wait = presentation.image_available[slot];
        let signal = presentation.render_finished[slot];

        self.queue_submit(cmd, Some(wait), Some(signal))?;

        let present_queue = self.logical.present_queue.unwrap_or(self.logical.graphics_queue);
        let loader = self
            .logical
            .swapchain_loader
            .as_ref()
            .ok_or_else(|| GfxError::InitializationFailed("device was created without swapchain support".into()))?;
        let Some(presentation) = self.presentation.as_mut() else {
            return Ok(());
        };
        presentation.slot_owners[slot] = Some(cmd);
        presentation.current_slot = (slot + 1) % presentation.image_available.len();
        presentation.acquired = None;

        let swapchain = presentation
            .swapchain
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), Swapchain::handle);
        let swapchains = [swapchain];
        let wait_semaphores = [signal];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { loader.queue_present(present_queue, &present_info) } {
            Ok(false) => Ok(()),
            Ok(true) => {
                log::debug!("Presented to a suboptimal swapchain");
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GfxError::SwapchainOutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn resize_swapchain(&mut self, width: u32, height: u32) -> GfxResult<()> {
        if width == 0 || height == 0 {
            return Err(GfxError::InvalidDescription(format!("cannot resize swapchain to {width}x{height}")));
        }
        self.offscreen_extent = Extent2D::new(width, height);
        if self.presentation.is_none() {
            return Ok(());
        }
        self.wait_idle()?;
        self.rebuild_swapchain(vk::Extent2D { width, height })
    }

    fn wait_idle(&mut self) -> GfxResult<()> {
        unsafe { self.logical.device.device_wait_idle()? };
        let in_flight: Vec<CommandBufferId> = self
            .command_buffers
            .iter()
            .filter(|(_, r)| r.in_flight.is_some() && r.level == CommandBufferLevel::Primary)
            .map(|(id, _)| id)
            .collect();
        for cmd in in_flight {
            self.complete(cmd)?;
        }
        for record in self.command_buffers.values_mut() {
            record.in_flight = None;
        }
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let leaked = self.live_object_count();
        if leaked > 0 {
            log::warn!("Vulkan device dropped with {leaked} live objects, releasing them");
        }

        let device = &self.logical.device;
        unsafe {
            let _ = device.device_wait_idle();
        }

        self.descriptor_sets.clear();
        self.framebuffers.clear();
        self.pipelines.clear();
        self.render_passes.clear();
        self.shaders.clear();
        self.textures.clear();
        self.buffers.clear();

        unsafe {
            for (_, record) in self.command_buffers.drain() {
                device.free_command_buffers(self.command_pool, &[record.raw]);
                if record.fence != vk::Fence::null() {
                    device.destroy_fence(record.fence, None);
                }
            }
            device.destroy_command_pool(self.command_pool, None);

            if let Some(mut presentation) = self.presentation.take() {
                for semaphore in presentation
                    .image_available
                    .drain(..)
                    .chain(presentation.render_finished.drain(..))
                {
                    device.destroy_semaphore(semaphore, None);
                }
                presentation.swapchain = None;
                presentation.loader.destroy_surface(presentation.surface, None);
            }
        }
    }
}
