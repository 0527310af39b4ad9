//! # Headless Backend
//!
//! A [`GraphicsDevice`] that keeps every resource in CPU-side slot maps and
//! records commands instead of executing them. It enforces the rules a GPU
//! driver would: command buffer state transitions, framebuffer and attachment
//! compatibility, descriptor writes against their layouts, dynamic offset
//! alignment and bounds, and teardown order. Submissions and presented images
//! stay readable for inspection.

pub mod record;

pub use record::{LiveObjects, RecordedCommand, Submission};

use std::collections::BTreeMap;

use slotmap::SlotMap;

use crate::core::{GraphicsApi, HeadlessConfig};
use crate::render::gfx::{
    BufferId, BufferUsage, CommandBufferId, CommandBufferLevel, DescriptorSetId, DescriptorWrite,
    DeviceCapabilities, Extent2D, Format, FramebufferAttachment, FramebufferDesc, FramebufferId,
    GfxError, GfxResult, GraphicsDevice, MeshBuffers, OwnedTexture, PipelineId, RenderPassDesc,
    RenderPassId, ShaderId, SubpassContents, TextureDesc, TextureId,
};
use crate::render::pipeline::{DescriptorTier, PipelineDesc};
use crate::render::shader::ShaderSource;

/// Lifecycle of a headless command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    /// Allocated or reset, nothing recorded
    Initial,
    /// Between begin and end
    Recording,
    /// Recorded and ready to submit or execute
    Executable,
    /// Submitted without waiting on its fence
    Pending,
}

#[derive(Debug)]
struct TextureRecord {
    desc: TextureDesc,
    data: Option<Vec<u8>>,
}

#[derive(Debug)]
struct PipelineRecord {
    desc: PipelineDesc,
}

#[derive(Debug)]
struct DescriptorSetRecord {
    pipeline: PipelineId,
    tier: DescriptorTier,
    writes: BTreeMap<u32, DescriptorWrite>,
}

#[derive(Debug)]
struct BufferRecord {
    usage: BufferUsage,
    data: Vec<u8>,
}

#[derive(Debug)]
struct ActivePass {
    render_pass: RenderPassId,
    framebuffer: FramebufferId,
    contents: SubpassContents,
}

#[derive(Debug)]
struct CommandBufferRecord {
    level: CommandBufferLevel,
    state: CommandBufferState,
    commands: Vec<RecordedCommand>,
    inheritance: Option<(RenderPassId, FramebufferId)>,
    active_pass: Option<ActivePass>,
    bound_pipeline: Option<PipelineId>,
    bound_sets: usize,
}

impl CommandBufferRecord {
    fn invalid(&self, operation: &'static str) -> GfxError {
        GfxError::InvalidState {
            resource: "command buffer",
            state: format!("{:?}", self.state),
            operation,
        }
    }

    fn require_recording(&self, operation: &'static str) -> GfxResult<()> {
        if self.state == CommandBufferState::Recording {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    /// Draw-level commands need a render pass: an inline one on a primary
    /// buffer, or the inherited one on a secondary buffer
    fn require_draw_scope(&self, operation: &'static str) -> GfxResult<()> {
        self.require_recording(operation)?;
        match (self.level, &self.active_pass) {
            (CommandBufferLevel::Secondary, _) => Ok(()),
            (CommandBufferLevel::Primary, Some(pass)) if pass.contents == SubpassContents::Inline => Ok(()),
            (CommandBufferLevel::Primary, Some(_)) => Err(GfxError::InvalidState {
                resource: "render pass",
                state: "secondary contents".into(),
                operation,
            }),
            (CommandBufferLevel::Primary, None) => Err(GfxError::InvalidState {
                resource: "command buffer",
                state: "outside render pass".into(),
                operation,
            }),
        }
    }
}

/// CPU-side recording device
#[derive(Debug)]
pub struct HeadlessDevice {
    config: HeadlessConfig,
    extent: Extent2D,
    shaders: SlotMap<ShaderId, String>,
    textures: SlotMap<TextureId, TextureRecord>,
    render_passes: SlotMap<RenderPassId, RenderPassDesc>,
    framebuffers: SlotMap<FramebufferId, FramebufferDesc>,
    pipelines: SlotMap<PipelineId, PipelineRecord>,
    descriptor_sets: SlotMap<DescriptorSetId, DescriptorSetRecord>,
    buffers: SlotMap<BufferId, BufferRecord>,
    command_buffers: SlotMap<CommandBufferId, CommandBufferRecord>,
    submissions: Vec<Submission>,
    presented: Vec<u32>,
    next_image: u32,
    acquired: Option<u32>,
}

impl HeadlessDevice {
    /// Create a device reporting `config` limits with a presentation surface of `extent`
    pub fn new(config: HeadlessConfig, extent: Extent2D) -> Self {
        log::info!(
            "Headless device created: {}x{}, {} swapchain images",
            extent.width,
            extent.height,
            config.swapchain_image_count
        );
        Self {
            config,
            extent,
            shaders: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            render_passes: SlotMap::with_key(),
            framebuffers: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            descriptor_sets: SlotMap::with_key(),
            buffers: SlotMap::with_key(),
            command_buffers: SlotMap::with_key(),
            submissions: Vec::new(),
            presented: Vec::new(),
            next_image: 0,
            acquired: None,
        }
    }

    /// Number of live objects per kind
    pub fn live_objects(&self) -> LiveObjects {
        LiveObjects {
            shaders: self.shaders.len(),
            textures: self.textures.len(),
            render_passes: self.render_passes.len(),
            framebuffers: self.framebuffers.len(),
            pipelines: self.pipelines.len(),
            descriptor_sets: self.descriptor_sets.len(),
            buffers: self.buffers.len(),
            command_buffers: self.command_buffers.len(),
        }
    }

    /// Every submission since creation or the last [`clear_submissions`](Self::clear_submissions)
    pub fn submissions(&self) -> &[Submission] {
        &self.submissions
    }

    /// Forget recorded submissions and presented images
    pub fn clear_submissions(&mut self) {
        self.submissions.clear();
        self.presented.clear();
    }

    /// Swapchain images presented, in order
    pub fn presented_images(&self) -> &[u32] {
        &self.presented
    }

    /// Current contents of a buffer
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(buffer).map(|b| b.data.as_slice())
    }

    /// Writes applied to a descriptor set, sorted by binding
    pub fn descriptor_bindings(&self, set: DescriptorSetId) -> Option<Vec<DescriptorWrite>> {
        self.descriptor_sets
            .get(set)
            .map(|s| s.writes.values().copied().collect())
    }

    /// Pipeline and tier a descriptor set was allocated for
    pub fn descriptor_set_owner(&self, set: DescriptorSetId) -> Option<(PipelineId, DescriptorTier)> {
        self.descriptor_sets.get(set).map(|s| (s.pipeline, s.tier))
    }

    /// Description a framebuffer was created from
    pub fn framebuffer_info(&self, framebuffer: FramebufferId) -> Option<&FramebufferDesc> {
        self.framebuffers.get(framebuffer)
    }

    /// Description a pipeline was created from
    pub fn pipeline_info(&self, pipeline: PipelineId) -> Option<&PipelineDesc> {
        self.pipelines.get(pipeline).map(|p| &p.desc)
    }

    /// Description a texture was created from
    pub fn texture_info(&self, texture: TextureId) -> Option<&TextureDesc> {
        self.textures.get(texture).map(|t| &t.desc)
    }

    /// Initial data a texture was created with
    pub fn texture_data(&self, texture: TextureId) -> Option<&[u8]> {
        self.textures.get(texture).and_then(|t| t.data.as_deref())
    }

    /// State of a command buffer
    pub fn command_buffer_state(&self, cmd: CommandBufferId) -> Option<CommandBufferState> {
        self.command_buffers.get(cmd).map(|c| c.state)
    }

    fn command_buffer(&mut self, cmd: CommandBufferId) -> GfxResult<&mut CommandBufferRecord> {
        self.command_buffers
            .get_mut(cmd)
            .ok_or(GfxError::UnknownHandle { kind: "command buffer" })
    }

    fn attachment_matches(&self, attachment: &FramebufferAttachment, format: Format, desc: &FramebufferDesc) -> GfxResult<()> {
        match attachment {
            FramebufferAttachment::SwapchainImage(index) => {
                if format != Format::Presentation {
                    return Err(GfxError::InvalidDescription(format!(
                        "framebuffer '{}' binds a swapchain image to a {format:?} attachment",
                        desc.label
                    )));
                }
                if *index >= self.config.swapchain_image_count {
                    return Err(GfxError::InvalidDescription(format!(
                        "framebuffer '{}' names swapchain image {index} of {}",
                        desc.label, self.config.swapchain_image_count
                    )));
                }
                if desc.extent() != self.extent {
                    return Err(GfxError::InvalidDescription(format!(
                        "framebuffer '{}' is {}x{} but the swapchain is {}x{}",
                        desc.label, desc.width, desc.height, self.extent.width, self.extent.height
                    )));
                }
            }
            FramebufferAttachment::Texture(texture) => {
                let record = self
                    .textures
                    .get(texture.id())
                    .ok_or(GfxError::UnknownHandle { kind: "texture" })?;
                if !record.desc.render_target {
                    return Err(GfxError::InvalidDescription(format!(
                        "texture '{}' is not a render target",
                        record.desc.label
                    )));
                }
                if record.desc.format != format {
                    return Err(GfxError::InvalidDescription(format!(
                        "texture '{}' is {:?}, attachment expects {format:?}",
                        record.desc.label, record.desc.format
                    )));
                }
                if record.desc.width != desc.width || record.desc.height != desc.height {
                    return Err(GfxError::InvalidDescription(format!(
                        "texture '{}' is {}x{}, framebuffer '{}' is {}x{}",
                        record.desc.label, record.desc.width, record.desc.height, desc.label, desc.width, desc.height
                    )));
                }
            }
        }
        Ok(())
    }

    fn passes_compatible(&self, a: RenderPassId, b: RenderPassId) -> bool {
        if a == b {
            return true;
        }
        match (self.render_passes.get(a), self.render_passes.get(b)) {
            (Some(a), Some(b)) => {
                a.attachments.len() == b.attachments.len()
                    && a.attachments.iter().zip(&b.attachments).all(|(x, y)| x.format == y.format)
            }
            _ => false,
        }
    }

    fn check_set_resources(&self, set: &DescriptorSetRecord) -> GfxResult<()> {
        for write in set.writes.values() {
            match write {
                DescriptorWrite::Image { texture, .. } => {
                    if !self.textures.contains_key(texture.id()) {
                        return Err(GfxError::UnknownHandle { kind: "texture" });
                    }
                }
                DescriptorWrite::Buffer { buffer, .. } => {
                    if !self.buffers.contains_key(*buffer) {
                        return Err(GfxError::UnknownHandle { kind: "buffer" });
                    }
                }
            }
        }
        Ok(())
    }

    fn check_dynamic_offsets(&self, sets: &[DescriptorSetId], offsets: &[u32]) -> GfxResult<()> {
        let alignment = u64::from(self.config.min_uniform_buffer_offset_alignment);
        let mut remaining = offsets.iter();

        for &set_id in sets {
            let set = self
                .descriptor_sets
                .get(set_id)
                .ok_or(GfxError::UnknownHandle { kind: "descriptor set" })?;
            let pipeline = self
                .pipelines
                .get(set.pipeline)
                .ok_or(GfxError::UnknownHandle { kind: "pipeline" })?;

            for binding in pipeline.desc.layout(set.tier).dynamic_bindings() {
                let offset = u64::from(*remaining.next().ok_or_else(|| {
                    GfxError::InvalidDescription(format!("missing dynamic offset for binding {binding}"))
                })?);
                if alignment > 0 && offset % alignment != 0 {
                    return Err(GfxError::InvalidDescription(format!(
                        "dynamic offset {offset} is not a multiple of {alignment}"
                    )));
                }
                if let Some(DescriptorWrite::Buffer { buffer, offset: base, range, .. }) = set.writes.get(&binding) {
                    let size = self
                        .buffers
                        .get(*buffer)
                        .map(|b| b.data.len() as u64)
                        .ok_or(GfxError::UnknownHandle { kind: "buffer" })?;
                    let end = base + offset + range;
                    if end > size {
                        return Err(GfxError::OutOfMemory { requested: end, available: size });
                    }
                }
            }
        }

        if remaining.next().is_some() {
            return Err(GfxError::InvalidDescription(
                "more dynamic offsets than dynamic bindings".into(),
            ));
        }
        Ok(())
    }

    fn snapshot_secondary(&self, secondary: CommandBufferId) -> GfxResult<(CommandBufferLevel, CommandBufferState, Option<(RenderPassId, FramebufferId)>, Vec<RecordedCommand>)> {
        let record = self
            .command_buffers
            .get(secondary)
            .ok_or(GfxError::UnknownHandle { kind: "command buffer" })?;
        Ok((record.level, record.state, record.inheritance, record.commands.clone()))
    }

    fn finish_submission(&mut self, cmd: CommandBufferId, wait_fence: bool, presented_image: Option<u32>) -> GfxResult<()> {
        let record = self.command_buffer(cmd)?;
        if record.level != CommandBufferLevel::Primary {
            return Err(record.invalid("submit secondary"));
        }
        if record.state != CommandBufferState::Executable {
            return Err(record.invalid("submit"));
        }
        record.state = if wait_fence {
            CommandBufferState::Executable
        } else {
            CommandBufferState::Pending
        };
        let commands = record.commands.clone();
        self.submissions.push(Submission {
            command_buffer: cmd,
            commands,
            waited: wait_fence,
            presented_image,
        });
        Ok(())
    }
}

impl GraphicsDevice for HeadlessDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            api: GraphicsApi::Headless,
            device_name: "Headless".to_string(),
            min_uniform_buffer_offset_alignment: u64::from(self.config.min_uniform_buffer_offset_alignment),
            max_color_attachments: self.config.max_color_attachments,
            swapchain_image_count: self.config.swapchain_image_count,
            presentation_extent: self.extent,
        }
    }

    fn create_shader(&mut self, source: &ShaderSource) -> GfxResult<ShaderId> {
        source.check().map_err(|reason| GfxError::ShaderRejected {
            name: source.name.clone(),
            reason,
        })?;
        log::debug!("Created shader '{}' with {} stages", source.name, source.stages.len());
        Ok(self.shaders.insert(source.name.clone()))
    }

    fn destroy_shader(&mut self, shader: ShaderId) -> GfxResult<()> {
        self.shaders
            .remove(shader)
            .map(|_| ())
            .ok_or(GfxError::UnknownHandle { kind: "shader" })
    }

    fn create_texture(&mut self, desc: &TextureDesc, data: Option<&[u8]>) -> GfxResult<OwnedTexture> {
        desc.validate(data)?;
        let id = self.textures.insert(TextureRecord {
            desc: desc.clone(),
            data: data.map(<[u8]>::to_vec),
        });
        Ok(OwnedTexture::new(id, desc))
    }

    fn destroy_texture(&mut self, texture: OwnedTexture) -> GfxResult<()> {
        let id = texture.id();
        let attached = self.framebuffers.values().any(|fb| {
            fb.attachments
                .iter()
                .any(|a| matches!(a, FramebufferAttachment::Texture(t) if t.id() == id))
        });
        if attached {
            return Err(GfxError::InvalidState {
                resource: "texture",
                state: "attached to a live framebuffer".into(),
                operation: "destroy",
            });
        }
        self.textures
            .remove(id)
            .map(|_| ())
            .ok_or(GfxError::UnknownHandle { kind: "texture" })
    }

    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> GfxResult<RenderPassId> {
        desc.validate(self.config.max_color_attachments)?;
        Ok(self.render_passes.insert(desc.clone()))
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassId) -> GfxResult<()> {
        self.render_passes
            .remove(render_pass)
            .map(|_| ())
            .ok_or(GfxError::UnknownHandle { kind: "render pass" })
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> GfxResult<FramebufferId> {
        let pass = self
            .render_passes
            .get(desc.render_pass)
            .ok_or(GfxError::UnknownHandle { kind: "render pass" })?;
        if pass.attachments.len() != desc.attachments.len() {
            return Err(GfxError::InvalidDescription(format!(
                "framebuffer '{}' has {} attachments, render pass '{}' expects {}",
                desc.label,
                desc.attachments.len(),
                pass.label,
                pass.attachments.len()
            )));
        }
        if desc.width == 0 || desc.height == 0 {
            return Err(GfxError::InvalidDescription(format!("framebuffer '{}' has zero extent", desc.label)));
        }
        let formats: Vec<Format> = pass.attachments.iter().map(|a| a.format).collect();
        for (attachment, format) in desc.attachments.iter().zip(formats) {
            self.attachment_matches(attachment, format, desc)?;
        }
        Ok(self.framebuffers.insert(desc.clone()))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId) -> GfxResult<()> {
        self.framebuffers
            .remove(framebuffer)
            .map(|_| ())
            .ok_or(GfxError::UnknownHandle { kind: "framebuffer" })
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> GfxResult<PipelineId> {
        if !self.shaders.contains_key(desc.shader) {
            return Err(GfxError::UnknownHandle { kind: "shader" });
        }
        let pass = self
            .render_passes
            .get(desc.render_pass)
            .ok_or(GfxError::UnknownHandle { kind: "render pass" })?;
        if pass.colour_count() != desc.color_attachment_count as usize {
            return Err(GfxError::InvalidDescription(format!(
                "pipeline '{}' writes {} colour attachments, render pass '{}' has {}",
                desc.name,
                desc.color_attachment_count,
                pass.label,
                pass.colour_count()
            )));
        }
        log::debug!("Created pipeline '{}' ({}x{})", desc.name, desc.width, desc.height);
        Ok(self.pipelines.insert(PipelineRecord { desc: desc.clone() }))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) -> GfxResult<()> {
        self.pipelines
            .remove(pipeline)
            .ok_or(GfxError::UnknownHandle { kind: "pipeline" })?;
        self.descriptor_sets.retain(|_, set| set.pipeline != pipeline);
        Ok(())
    }

    fn allocate_descriptor_set(&mut self, pipeline: PipelineId, tier: DescriptorTier) -> GfxResult<DescriptorSetId> {
        let record = self
            .pipelines
            .get(pipeline)
            .ok_or(GfxError::UnknownHandle { kind: "pipeline" })?;

        // One set per tier per object is what the pool is sized for
        let capacity = record.desc.max_objects as usize * DescriptorTier::ALL.len();
        let allocated = self.descriptor_sets.values().filter(|s| s.pipeline == pipeline).count();
        if allocated >= capacity {
            return Err(GfxError::DescriptorPoolExhausted {
                sets: allocated as u64 + 1,
                capacity: capacity as u64,
            });
        }

        Ok(self.descriptor_sets.insert(DescriptorSetRecord {
            pipeline,
            tier,
            writes: BTreeMap::new(),
        }))
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
        let layout = pipeline.desc.layout(record.tier);

        for write in writes {
            layout.validate_write(write)?;
            match write {
                DescriptorWrite::Image { texture, .. } => {
                    if !self.textures.contains_key(texture.id()) {
                        return Err(GfxError::UnknownHandle { kind: "texture" });
                    }
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
                    let size = target.data.len() as u64;
                    if offset + range > size {
                        return Err(GfxError::OutOfMemory { requested: offset + range, available: size });
                    }
                }
            }
        }

        if let Some(record) = self.descriptor_sets.get_mut(set) {
            for write in writes {
                record.writes.insert(write.binding(), *write);
            }
        }
        Ok(())
    }

    fn free_descriptor_set(&mut self, set: DescriptorSetId) -> GfxResult<()> {
        self.descriptor_sets
            .remove(set)
            .map(|_| ())
            .ok_or(GfxError::UnknownHandle { kind: "descriptor set" })
    }

    fn create_buffer(&mut self, usage: BufferUsage, size: u64) -> GfxResult<BufferId> {
        if size == 0 {
            return Err(GfxError::InvalidDescription("buffer size must be non-zero".into()));
        }
        Ok(self.buffers.insert(BufferRecord {
            usage,
            data: vec![0; size as usize],
        }))
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> GfxResult<()> {
        let record = self
            .buffers
            .get_mut(buffer)
            .ok_or(GfxError::UnknownHandle { kind: "buffer" })?;
        let size = record.data.len() as u64;
        let end = offset + data.len() as u64;
        if end > size {
            return Err(GfxError::OutOfMemory { requested: end, available: size });
        }
        record.data[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) -> GfxResult<()> {
        self.buffers
            .remove(buffer)
            .map(|_| ())
            .ok_or(GfxError::UnknownHandle { kind: "buffer" })
    }

    fn create_command_buffer(&mut self, level: CommandBufferLevel) -> GfxResult<CommandBufferId> {
        Ok(self.command_buffers.insert(CommandBufferRecord {
            level,
            state: CommandBufferState::Initial,
            commands: Vec::new(),
            inheritance: None,
            active_pass: None,
            bound_pipeline: None,
            bound_sets: 0,
        }))
    }

    fn destroy_command_buffer(&mut self, cmd: CommandBufferId) -> GfxResult<()> {
        self.command_buffers
            .remove(cmd)
            .map(|_| ())
            .ok_or(GfxError::UnknownHandle { kind: "command buffer" })
    }

    fn begin_command_buffer(
        &mut self,
        cmd: CommandBufferId,
        inheritance: Option<(RenderPassId, FramebufferId)>,
    ) -> GfxResult<()> {
        if let Some((pass, framebuffer)) = inheritance {
            if !self.render_passes.contains_key(pass) {
                return Err(GfxError::UnknownHandle { kind: "render pass" });
            }
            if !self.framebuffers.contains_key(framebuffer) {
                return Err(GfxError::UnknownHandle { kind: "framebuffer" });
            }
        }

        let record = self.command_buffer(cmd)?;
        if record.state == CommandBufferState::Recording {
            return Err(record.invalid("begin"));
        }
        match (record.level, inheritance) {
            (CommandBufferLevel::Primary, None) | (CommandBufferLevel::Secondary, Some(_)) => {}
            (CommandBufferLevel::Primary, Some(_)) => return Err(record.invalid("begin primary with inheritance")),
            (CommandBufferLevel::Secondary, None) => return Err(record.invalid("begin secondary without inheritance")),
        }

        record.state = CommandBufferState::Recording;
        record.commands.clear();
        record.inheritance = inheritance;
        record.active_pass = None;
        record.bound_pipeline = None;
        record.bound_sets = 0;
        Ok(())
    }

    fn end_command_buffer(&mut self, cmd: CommandBufferId) -> GfxResult<()> {
        let record = self.command_buffer(cmd)?;
        record.require_recording("end")?;
        if record.active_pass.is_some() {
            return Err(GfxError::InvalidState {
                resource: "command buffer",
                state: "inside render pass".into(),
                operation: "end",
            });
        }
        record.state = CommandBufferState::Executable;
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
        let fb = self
            .framebuffers
            .get(framebuffer)
            .ok_or(GfxError::UnknownHandle { kind: "framebuffer" })?;
        if !self.render_passes.contains_key(render_pass) {
            return Err(GfxError::UnknownHandle { kind: "render pass" });
        }
        if !self.passes_compatible(fb.render_pass, render_pass) {
            return Err(GfxError::InvalidDescription(format!(
                "framebuffer '{}' is not compatible with the render pass",
                fb.label
            )));
        }
        if fb.presents() && fb.extent() != self.extent {
            return Err(GfxError::InvalidState {
                resource: "framebuffer",
                state: "stale after resize".into(),
                operation: "begin render pass",
            });
        }

        let record = self.command_buffer(cmd)?;
        record.require_recording("begin render pass")?;
        if record.level != CommandBufferLevel::Primary {
            return Err(record.invalid("begin render pass on secondary"));
        }
        if record.active_pass.is_some() {
            return Err(GfxError::InvalidState {
                resource: "command buffer",
                state: "inside render pass".into(),
                operation: "begin render pass",
            });
        }
        record.active_pass = Some(ActivePass { render_pass, framebuffer, contents });
        record.commands.push(RecordedCommand::BeginRenderPass {
            render_pass,
            framebuffer,
            clear_colour,
            contents,
        });
        Ok(())
    }

    fn cmd_end_render_pass(&mut self, cmd: CommandBufferId) -> GfxResult<()> {
        let record = self.command_buffer(cmd)?;
        record.require_recording("end render pass")?;
        if record.active_pass.take().is_none() {
            return Err(GfxError::InvalidState {
                resource: "command buffer",
                state: "outside render pass".into(),
                operation: "end render pass",
            });
        }
        record.commands.push(RecordedCommand::EndRenderPass);
        Ok(())
    }

    fn cmd_set_viewport(&mut self, cmd: CommandBufferId, extent: Extent2D) -> GfxResult<()> {
        let record = self.command_buffer(cmd)?;
        record.require_draw_scope("set viewport")?;
        record.commands.push(RecordedCommand::SetViewport(extent));
        Ok(())
    }

    fn cmd_bind_pipeline(&mut self, cmd: CommandBufferId, pipeline: PipelineId) -> GfxResult<()> {
        if !self.pipelines.contains_key(pipeline) {
            return Err(GfxError::UnknownHandle { kind: "pipeline" });
        }
        let record = self.command_buffer(cmd)?;
        record.require_draw_scope("bind pipeline")?;
        record.bound_pipeline = Some(pipeline);
        record.bound_sets = 0;
        record.commands.push(RecordedCommand::BindPipeline(pipeline));
        Ok(())
    }

    fn cmd_bind_descriptor_sets(
        &mut self,
        cmd: CommandBufferId,
        pipeline: PipelineId,
        sets: &[DescriptorSetId],
        dynamic_offsets: &[u32],
    ) -> GfxResult<()> {
        if !self.pipelines.contains_key(pipeline) {
            return Err(GfxError::UnknownHandle { kind: "pipeline" });
        }
        for (index, set_id) in sets.iter().enumerate() {
            let set = self
                .descriptor_sets
                .get(*set_id)
                .ok_or(GfxError::UnknownHandle { kind: "descriptor set" })?;
            if set.pipeline != pipeline || set.tier.set_index() as usize != index {
                return Err(GfxError::InvalidDescription(format!(
                    "descriptor set bound at index {index} belongs to a different pipeline or tier"
                )));
            }
            self.check_set_resources(set)?;
        }
        self.check_dynamic_offsets(sets, dynamic_offsets)?;

        let record = self.command_buffer(cmd)?;
        record.require_draw_scope("bind descriptor sets")?;
        if record.bound_pipeline != Some(pipeline) {
            return Err(GfxError::InvalidState {
                resource: "command buffer",
                state: "pipeline not bound".into(),
                operation: "bind descriptor sets",
            });
        }
        record.bound_sets = sets.len();
        record.commands.push(RecordedCommand::BindDescriptorSets {
            pipeline,
            sets: sets.to_vec(),
            dynamic_offsets: dynamic_offsets.to_vec(),
        });
        Ok(())
    }

    fn cmd_draw_indexed(&mut self, cmd: CommandBufferId, mesh: &MeshBuffers) -> GfxResult<()> {
        for (buffer, usage) in [
            (mesh.vertex_buffer, BufferUsage::Vertex),
            (mesh.index_buffer, BufferUsage::Index),
        ] {
            let record = self.buffers.get(buffer).ok_or(GfxError::UnknownHandle { kind: "buffer" })?;
            if record.usage != usage {
                return Err(GfxError::InvalidDescription(format!(
                    "draw expects a {usage:?} buffer, got {:?}",
                    record.usage
                )));
            }
        }

        let required_sets = {
            let record = self
                .command_buffers
                .get(cmd)
                .ok_or(GfxError::UnknownHandle { kind: "command buffer" })?;
            let pipeline = record.bound_pipeline.and_then(|p| self.pipelines.get(p));
            match pipeline {
                Some(p) => DescriptorTier::ALL
                    .iter()
                    .filter(|tier| !p.desc.layout(**tier).bindings.is_empty())
                    .count(),
                None => {
                    return Err(GfxError::InvalidState {
                        resource: "command buffer",
                        state: "pipeline not bound".into(),
                        operation: "draw",
                    })
                }
            }
        };

        let record = self.command_buffer(cmd)?;
        record.require_draw_scope("draw")?;
        if record.bound_sets < required_sets {
            return Err(GfxError::InvalidState {
                resource: "command buffer",
                state: format!("{} of {required_sets} descriptor sets bound", record.bound_sets),
                operation: "draw",
            });
        }
        record.commands.push(RecordedCommand::DrawIndexed {
            vertex_buffer: mesh.vertex_buffer,
            index_buffer: mesh.index_buffer,
            index_count: mesh.index_count,
        });
        Ok(())
    }

    fn cmd_execute_secondary(&mut self, primary: CommandBufferId, secondary: CommandBufferId) -> GfxResult<()> {
        let (level, state, inheritance, commands) = self.snapshot_secondary(secondary)?;
        if level != CommandBufferLevel::Secondary || state != CommandBufferState::Executable {
            return Err(GfxError::InvalidState {
                resource: "secondary command buffer",
                state: format!("{level:?} {state:?}"),
                operation: "execute",
            });
        }

        let active = {
            let record = self
                .command_buffers
                .get(primary)
                .ok_or(GfxError::UnknownHandle { kind: "command buffer" })?;
            record.require_recording("execute secondary")?;
            match &record.active_pass {
                Some(pass) if pass.contents == SubpassContents::SecondaryCommandBuffers => {
                    (pass.render_pass, pass.framebuffer)
                }
                _ => {
                    return Err(GfxError::InvalidState {
                        resource: "command buffer",
                        state: "no render pass with secondary contents".into(),
                        operation: "execute secondary",
                    })
                }
            }
        };

        match inheritance {
            Some((pass, framebuffer)) if framebuffer == active.1 && self.passes_compatible(pass, active.0) => {}
            _ => {
                return Err(GfxError::InvalidDescription(
                    "secondary was recorded for a different render pass or framebuffer".into(),
                ))
            }
        }

        let record = self.command_buffer(primary)?;
        record.commands.push(RecordedCommand::ExecuteSecondary { secondary, commands });
        Ok(())
    }

    fn submit(&mut self, cmd: CommandBufferId, wait_fence: bool) -> GfxResult<()> {
        self.finish_submission(cmd, wait_fence, None)
    }

    fn acquire_next_image(&mut self) -> GfxResult<u32> {
        if self.config.swapchain_image_count == 0 {
            return Err(GfxError::InvalidState {
                resource: "swapchain",
                state: "absent".into(),
                operation: "acquire",
            });
        }
        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.config.swapchain_image_count;
        self.acquired = Some(index);
        Ok(index)
    }

    fn present(&mut self, cmd: CommandBufferId, image_index: u32) -> GfxResult<()> {
        if self.acquired != Some(image_index) {
            return Err(GfxError::InvalidState {
                resource: "swapchain image",
                state: "not acquired".into(),
                operation: "present",
            });
        }
        self.finish_submission(cmd, false, Some(image_index))?;
        self.acquired = None;
        self.presented.push(image_index);
        Ok(())
    }

    fn resize_swapchain(&mut self, width: u32, height: u32) -> GfxResult<()> {
        if width == 0 || height == 0 {
            return Err(GfxError::InvalidDescription(format!("cannot resize swapchain to {width}x{height}")));
        }
        self.extent = Extent2D::new(width, height);
        self.acquired = None;
        self.next_image = 0;
        Ok(())
    }

    fn wait_idle(&mut self) -> GfxResult<()> {
        for record in self.command_buffers.values_mut() {
            if record.state == CommandBufferState::Pending {
                record.state = CommandBufferState::Executable;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::gfx::{AttachmentDesc, LoadOp};
    use crate::render::pipeline::{
        DescriptorLayout, DescriptorType, PipelineBuilder, ShaderStages, VertexFormat, VertexLayout,
    };
    use crate::render::shader::InMemoryShaderLibrary;
    use crate::render::shader::ShaderLibrary;

    fn device() -> HeadlessDevice {
        HeadlessDevice::new(HeadlessConfig::default(), Extent2D::new(64, 32))
    }

    fn simple_pipeline(device: &mut HeadlessDevice) -> (RenderPassId, PipelineId) {
        let source = InMemoryShaderLibrary::new().with_placeholder("test").load("test").unwrap();
        let shader = device.create_shader(&source).unwrap();
        let pass = device
            .create_render_pass(&RenderPassDesc {
                label: "screen".into(),
                attachments: vec![AttachmentDesc::colour(Format::Presentation)],
            })
            .unwrap();
        let desc = PipelineBuilder::new("test", shader, pass)
            .vertex_layout(VertexLayout::new(12).attribute(0, VertexFormat::Float3, 0))
            .scene_layout(DescriptorLayout::new().add_dynamic_uniform_buffer(0, ShaderStages::VERTEX))
            .pool_size(DescriptorType::UniformBufferDynamic, 1)
            .dimensions(64, 32)
            .max_objects(2)
            .build()
            .unwrap();
        (pass, device.create_pipeline(&desc).unwrap())
    }

    #[test]
    fn test_command_buffer_transitions() {
        let mut device = device();
        let cmd = device.create_command_buffer(CommandBufferLevel::Primary).unwrap();

        assert!(device.end_command_buffer(cmd).is_err());
        assert!(device.submit(cmd, true).is_err());

        device.begin_command_buffer(cmd, None).unwrap();
        assert!(device.begin_command_buffer(cmd, None).is_err());
        device.end_command_buffer(cmd).unwrap();
        device.submit(cmd, false).unwrap();
        assert_eq!(device.command_buffer_state(cmd), Some(CommandBufferState::Pending));

        device.wait_idle().unwrap();
        assert_eq!(device.command_buffer_state(cmd), Some(CommandBufferState::Executable));
        assert_eq!(device.submissions().len(), 1);
    }

    #[test]
    fn test_dynamic_offsets_checked() {
        let mut device = device();
        let (pass, pipeline) = simple_pipeline(&mut device);
        let buffer = device.create_buffer(BufferUsage::Uniform, 512).unwrap();
        let set = device.allocate_descriptor_set(pipeline, DescriptorTier::Scene).unwrap();
        device
            .update_descriptor_set(set, &[DescriptorWrite::Buffer { binding: 0, buffer, offset: 0, range: 64 }])
            .unwrap();

        device.acquire_next_image().unwrap();
        let fb = device
            .create_framebuffer(&FramebufferDesc {
                label: "fb".into(),
                render_pass: pass,
                width: 64,
                height: 32,
                attachments: vec![FramebufferAttachment::SwapchainImage(0)],
            })
            .unwrap();

        let cmd = device.create_command_buffer(CommandBufferLevel::Primary).unwrap();
        device.begin_command_buffer(cmd, None).unwrap();
        device
            .cmd_begin_render_pass(cmd, pass, fb, [0.0; 4], SubpassContents::Inline)
            .unwrap();
        device.cmd_bind_pipeline(cmd, pipeline).unwrap();

        assert!(device.cmd_bind_descriptor_sets(cmd, pipeline, &[set], &[]).is_err());
        assert!(device.cmd_bind_descriptor_sets(cmd, pipeline, &[set], &[64]).is_err());
        assert!(matches!(
            device.cmd_bind_descriptor_sets(cmd, pipeline, &[set], &[512]),
            Err(GfxError::OutOfMemory { .. })
        ));
        device.cmd_bind_descriptor_sets(cmd, pipeline, &[set], &[256]).unwrap();
    }

    #[test]
    fn test_framebuffer_attachment_validation() {
        let mut device = device();
        let pass = device
            .create_render_pass(&RenderPassDesc {
                label: "offscreen".into(),
                attachments: vec![AttachmentDesc::colour(Format::Rgba8Unorm), AttachmentDesc::depth(LoadOp::Clear)],
            })
            .unwrap();
        let colour = device
            .create_texture(&TextureDesc::render_target("colour", 16, 16, Format::Rgba8Unorm), None)
            .unwrap();
        let depth = device
            .create_texture(&TextureDesc::render_target("depth", 8, 8, Format::Depth32Float), None)
            .unwrap();

        let mismatched = FramebufferDesc {
            label: "mismatch".into(),
            render_pass: pass,
            width: 16,
            height: 16,
            attachments: vec![
                FramebufferAttachment::Texture(colour.reference()),
                FramebufferAttachment::Texture(depth.reference()),
            ],
        };
        assert!(device.create_framebuffer(&mismatched).is_err());

        let swapped = FramebufferDesc {
            attachments: vec![
                FramebufferAttachment::Texture(depth.reference()),
                FramebufferAttachment::Texture(colour.reference()),
            ],
            ..mismatched.clone()
        };
        assert!(device.create_framebuffer(&swapped).is_err());

        let depth16 = device
            .create_texture(&TextureDesc::render_target("depth16", 16, 16, Format::Depth32Float), None)
            .unwrap();
        let good = FramebufferDesc {
            attachments: vec![
                FramebufferAttachment::Texture(colour.reference()),
                FramebufferAttachment::Texture(depth16.reference()),
            ],
            ..mismatched
        };
        let fb = device.create_framebuffer(&good).unwrap();

        assert!(matches!(
            device.destroy_texture(colour),
            Err(GfxError::InvalidState { resource: "texture", .. })
        ));
        device.destroy_framebuffer(fb).unwrap();
    }

    #[test]
    fn test_present_requires_acquired_image() {
        let mut device = device();
        let cmd = device.create_command_buffer(CommandBufferLevel::Primary).unwrap();
        device.begin_command_buffer(cmd, None).unwrap();
        device.end_command_buffer(cmd).unwrap();

        assert!(device.present(cmd, 0).is_err());
        let image = device.acquire_next_image().unwrap();
        device.present(cmd, image).unwrap();
        assert_eq!(device.presented_images(), &[0]);
        assert_eq!(device.acquire_next_image().unwrap(), 1);
    }

    #[test]
    fn test_destroy_pipeline_frees_sets() {
        let mut device = device();
        let (_, pipeline) = simple_pipeline(&mut device);
        device.allocate_descriptor_set(pipeline, DescriptorTier::Scene).unwrap();
        device.allocate_descriptor_set(pipeline, DescriptorTier::Scene).unwrap();
        assert_eq!(device.live_objects().descriptor_sets, 2);

        device.destroy_pipeline(pipeline).unwrap();
        assert_eq!(device.live_objects().descriptor_sets, 0);
        assert_eq!(device.live_objects().pipelines, 0);
    }

    #[test]
    fn test_descriptor_pool_exhaustion_counts_sets() {
        let mut device = device();
        let (_, pipeline) = simple_pipeline(&mut device);
        let sets: Vec<_> = (0..4)
            .map(|_| device.allocate_descriptor_set(pipeline, DescriptorTier::PerDraw).unwrap())
            .collect();

        let err = device.allocate_descriptor_set(pipeline, DescriptorTier::PerDraw).unwrap_err();
        assert!(matches!(err, GfxError::DescriptorPoolExhausted { sets: 5, capacity: 4 }));
        assert!(err.to_string().contains("pool holds 4"));
        assert!(!err.to_string().contains("bytes"));

        device.free_descriptor_set(sets[0]).unwrap();
        device.allocate_descriptor_set(pipeline, DescriptorTier::PerDraw).unwrap();
    }

    #[test]
    fn test_shader_without_magic_rejected() {
        let mut device = device();
        let bad = ShaderSource::vertex_fragment("bad", vec![0xdead_beef], vec![0xdead_beef]);
        assert!(matches!(device.create_shader(&bad), Err(GfxError::ShaderRejected { .. })));
    }
}
