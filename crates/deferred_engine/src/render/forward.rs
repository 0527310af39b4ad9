//! # Forward Renderer
//!
//! Single-pass renderer: every opaque mesh is drawn and lit straight into the
//! swapchain image (or the render target) inside one render pass recorded
//! inline on the frame's primary buffer. It shares the dynamic model buffer,
//! the material cache and the light block layout with the deferred path but
//! needs no GBuffer, only a depth texture of its own.

use crate::core::RendererConfig;
use crate::foundation::math::Mat4;
use crate::render::deferred::{
    DynamicModelBuffer, LightSetupPacker, LightUniformBlock, SystemUniforms, VertexUniformSlot, LIGHT_BLOCK_SIZE,
};
use crate::render::error::{RenderError, RenderResult};
use crate::render::gfx::{
    AttachmentDesc, CommandBufferLevel, DescriptorSetId, Extent2D, Format, FramebufferAttachment, FramebufferDesc,
    FramebufferId, GfxError, GfxResult, GraphicsDevice, LoadOp, OwnedTexture, PipelineId, RenderPassDesc,
    RenderPassId, ShaderId, SubpassContents, TextureDesc, TextureRef, UniformBuffer,
};
use crate::render::manager::RenderManager;
use crate::render::material::{material_layout, Material, MaterialCache, MaterialTextures, MATERIAL_TEXTURE_SLOTS};
use crate::render::mesh::{Mesh, Vertex};
use crate::render::pass::CommandBuffer;
use crate::render::pipeline::{
    CullMode, DescriptorLayout, DescriptorSetBuilder, DescriptorTier, DescriptorType, PipelineBuilder, ShaderStages,
};
use crate::render::render_queue::{RenderCommand, RenderCommandId, RenderQueue};
use crate::render::renderer::Renderer3D;
use crate::render::scene::{RenderList, SceneView};
use crate::render::shader::ShaderLibrary;
use crate::render::stats::{FrameStats, OutputTarget};
use crate::render::textures::create_checkerboard;

/// Pipeline name of the forward pass
pub const FORWARD_PIPELINE_NAME: &str = "Forward";
/// Clear colour of the forward pass
pub const FORWARD_CLEAR_COLOUR: [f32; 4] = [0.1, 0.1, 0.1, 1.0];

const CAMERA_BINDING: u32 = 0;
const MODEL_MATRIX_BINDING: u32 = 1;
const LIGHT_BLOCK_BINDING: u32 = 2;
const DEFAULT_TEXTURE_SIZE: u32 = 8;

fn forward_pass_desc() -> RenderPassDesc {
    RenderPassDesc {
        label: "Forward".into(),
        attachments: vec![AttachmentDesc::colour(Format::Presentation), AttachmentDesc::depth(LoadOp::Clear)],
    }
}

/// Renderer drawing and lighting every mesh in one pass
#[derive(Debug)]
pub struct ForwardRenderer {
    width: u32,
    height: u32,
    max_objects: usize,

    shader: ShaderId,
    render_pass: RenderPassId,
    pipeline: Option<PipelineId>,
    scene_set: Option<DescriptorSetId>,
    depth: Option<OwnedTexture>,
    framebuffers: Vec<FramebufferId>,
    primaries: Vec<CommandBuffer>,

    system_uniforms: SystemUniforms,
    vertex_uniforms: UniformBuffer,
    model_buffer: DynamicModelBuffer,
    light_block: LightUniformBlock,
    light_buffer: UniformBuffer,
    packer: LightSetupPacker,

    queue: RenderQueue,
    materials: MaterialCache,
    default_material: Material,
    default_texture: OwnedTexture,

    render_target: Option<TextureRef>,
    render_to_gbuffer: bool,
    stats: FrameStats,
}

impl ForwardRenderer {
    /// Create the pass, pipeline, depth target, framebuffers and uniform buffers
    pub fn new(
        device: &mut dyn GraphicsDevice,
        manager: &dyn RenderManager,
        shaders: &dyn ShaderLibrary,
        config: &RendererConfig,
    ) -> RenderResult<Self> {
        config.validate().map_err(RenderError::InvalidConfig)?;
        let gbuffer = manager.gbuffer();
        let (width, height) = (gbuffer.width(), gbuffer.height());
        let max_objects = config.max_objects as usize;
        log::info!("Initializing forward renderer at {width}x{height} for {max_objects} objects");

        let shader = device.create_shader(&shaders.load(&config.shaders.forward_pass)?)?;
        let render_pass = device.create_render_pass(&forward_pass_desc())?;

        let default_texture = create_checkerboard(device, DEFAULT_TEXTURE_SIZE)?;
        let default_material = Material::new().with_name("Default").with_textures(MaterialTextures {
            albedo: Some(default_texture.reference()),
            ..MaterialTextures::default()
        });

        let system_uniforms = SystemUniforms::new(&[VertexUniformSlot::ProjectionMatrix, VertexUniformSlot::ViewMatrix]);
        let vertex_uniforms = UniformBuffer::create(device, system_uniforms.size() as u64)?;
        let model_buffer = DynamicModelBuffer::new(device, max_objects)?;
        let light_buffer = UniformBuffer::create(device, LIGHT_BLOCK_SIZE as u64)?;

        let mut renderer = Self {
            width,
            height,
            max_objects,
            shader,
            render_pass,
            pipeline: None,
            scene_set: None,
            depth: None,
            framebuffers: Vec::new(),
            primaries: Vec::new(),
            system_uniforms,
            vertex_uniforms,
            model_buffer,
            light_block: LightUniformBlock::default(),
            light_buffer,
            packer: LightSetupPacker::new(),
            queue: RenderQueue::with_capacity(max_objects),
            materials: MaterialCache::new(),
            default_material,
            default_texture,
            render_target: None,
            render_to_gbuffer: false,
            stats: FrameStats::default(),
        };
        renderer.build(device)?;
        Ok(renderer)
    }

    /// Render one frame
    ///
    /// The manager is not consulted: the forward pass samples no GBuffer or
    /// shadow input.
    pub fn render_scene(
        &mut self,
        device: &mut dyn GraphicsDevice,
        _manager: &dyn RenderManager,
        render_list: &dyn RenderList,
        scene: &dyn SceneView,
    ) -> RenderResult<FrameStats> {
        self.stats = FrameStats::default();
        let pipeline = self.pipeline.ok_or_else(|| released("render scene"))?;
        let scene_set = self.scene_set.ok_or_else(|| released("render scene"))?;

        let camera = scene.camera();
        self.system_uniforms
            .write_matrix(VertexUniformSlot::ProjectionMatrix, &camera.projection);
        self.system_uniforms.write_matrix(VertexUniformSlot::ViewMatrix, &camera.view);

        // Shadows are a deferred-only input
        let lights = scene.lights();
        let report = self.packer.pack(&mut self.light_block, &camera, lights, None);
        self.stats.lights_packed = report.lights_packed;
        self.stats.lights_dropped = lights.len() - report.lights_packed;
        self.stats.capacity_violations.extend(report.violations);

        self.materials.begin_frame(device)?;
        self.queue.clear();
        self.model_buffer.clear();
        let mut queued: GfxResult<()> = Ok(());
        render_list.for_each_opaque(&mut |object| {
            if queued.is_err() {
                return;
            }
            if let Some(mesh) = object.mesh {
                queued = self
                    .queue_mesh(&mut *device, mesh, pipeline, object.world_transform, object.texture_matrix)
                    .map(|_| ());
            }
        });
        queued?;

        self.vertex_uniforms.set_data(device, self.system_uniforms.as_bytes())?;
        for (slot, command) in self.queue.commands().iter().enumerate() {
            self.model_buffer.write(slot, &command.transform)?;
        }
        self.model_buffer.upload(device)?;
        self.light_buffer.set_data(device, self.light_block.as_bytes())?;
        if let Some(overflow) = self.queue.overflow() {
            log::warn!("Forward pass clamped: {overflow}");
            self.stats.capacity_violations.push(overflow);
        }
        self.stats.objects_submitted = self.queue.len();
        self.stats.objects_dropped = self.queue.dropped();

        let image = match self.render_target {
            Some(_) => 0,
            None if self.framebuffers.is_empty() => return Err(RenderError::NoPresentationTarget),
            None => device.acquire_next_image()?,
        };
        let slot = image as usize;
        let framebuffer = *self.framebuffers.get(slot).ok_or_else(|| missing_frame_slot(image))?;
        let primary = self.primaries.get_mut(slot).ok_or_else(|| missing_frame_slot(image))?;

        primary.begin_recording(device)?;
        primary.begin_render_pass(device, self.render_pass, framebuffer, FORWARD_CLEAR_COLOUR, SubpassContents::Inline)?;
        primary.update_viewport(device, self.width, self.height)?;
        primary.bind_pipeline(device, pipeline)?;
        for (slot, command) in self.queue.commands().iter().enumerate() {
            primary.bind_descriptor_sets(
                device,
                pipeline,
                &[scene_set, command.material_set],
                &[self.model_buffer.offset(slot)],
            )?;
            primary.draw_indexed(device, &command.mesh)?;
        }
        primary.end_render_pass(device)?;
        primary.end_recording(device)?;

        match self.render_target {
            Some(texture) => {
                primary.execute(device, true)?;
                self.stats.output = Some(OutputTarget::Texture(texture));
            }
            None => {
                primary.present(device, image)?;
                self.stats.presented = true;
                self.stats.output = Some(OutputTarget::Swapchain(image));
            }
        }
        Ok(self.stats.clone())
    }

    /// Rebuild the pipeline, depth target and framebuffers for a new screen size
    pub fn on_resize(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &mut dyn RenderManager,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidConfig(format!("cannot resize to {width}x{height}")));
        }
        log::info!("Resizing forward renderer from {}x{} to {width}x{height}", self.width, self.height);

        self.wait_idle(device)?;
        self.release(device)?;

        let caps = device.capabilities();
        if caps.swapchain_image_count > 0 && caps.presentation_extent != Extent2D::new(width, height) {
            device.resize_swapchain(width, height)?;
        }
        manager.resize_targets(device, width, height)?;
        self.width = width;
        self.height = height;

        if self.render_to_gbuffer {
            self.render_target = Some(manager.gbuffer().offscreen0);
        } else if let Some(target) = self.render_target {
            if target.width() != width || target.height() != height {
                log::warn!("Render target no longer matches the screen, returning output to the swapchain");
                self.render_target = None;
            }
        }
        self.build(device)?;
        Ok(())
    }

    /// Send output to `target`, or back to the swapchain with `None`
    pub fn set_render_target(
        &mut self,
        device: &mut dyn GraphicsDevice,
        target: Option<TextureRef>,
    ) -> RenderResult<()> {
        if let Some(texture) = target {
            if texture.width() != self.width || texture.height() != self.height {
                return Err(RenderError::InvalidConfig(format!(
                    "render target is {}x{}, screen is {}x{}",
                    texture.width(),
                    texture.height(),
                    self.width,
                    self.height
                )));
            }
            if texture.format() != Format::Presentation {
                return Err(RenderError::InvalidConfig(format!(
                    "render target must use the presentation format, got {:?}",
                    texture.format()
                )));
            }
        }
        self.wait_idle(device)?;
        self.release_framebuffers(device)?;
        self.render_target = target;
        self.render_to_gbuffer = false;
        self.build_framebuffers(device)?;
        log::info!(
            "Forward pass now renders to {}",
            if target.is_some() { "a texture" } else { "the swapchain" }
        );
        Ok(())
    }

    /// Send output to the GBuffer's `Offscreen0` texture, or back to the swapchain
    pub fn set_render_to_gbuffer_texture(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &dyn RenderManager,
        enabled: bool,
    ) -> RenderResult<()> {
        let target = enabled.then(|| manager.gbuffer().offscreen0);
        self.set_render_target(device, target)?;
        self.render_to_gbuffer = enabled;
        Ok(())
    }

    /// Release every object the renderer owns
    pub fn destroy(mut self, device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        self.wait_idle(device)?;
        self.materials.destroy(device)?;
        self.release(device)?;
        for primary in self.primaries {
            primary.destroy(device)?;
        }
        device.destroy_render_pass(self.render_pass)?;
        device.destroy_shader(self.shader)?;
        self.vertex_uniforms.destroy(device)?;
        self.model_buffer.destroy(device)?;
        self.light_buffer.destroy(device)?;
        device.destroy_texture(self.default_texture)?;
        log::info!("Forward renderer destroyed");
        Ok(())
    }

    /// Screen size
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Object capacity per frame
    pub fn max_objects(&self) -> usize {
        self.max_objects
    }

    /// Current pipeline
    pub fn pipeline(&self) -> Option<PipelineId> {
        self.pipeline
    }

    /// Framebuffers, one per swapchain image or one for the render target
    pub fn framebuffers(&self) -> &[FramebufferId] {
        &self.framebuffers
    }

    /// Texture output goes to, `None` for the swapchain
    pub fn render_target(&self) -> Option<TextureRef> {
        self.render_target
    }

    /// Depth attachment of the pass
    pub fn depth_target(&self) -> Option<TextureRef> {
        self.depth.as_ref().map(OwnedTexture::reference)
    }

    /// Dynamic model buffer
    pub fn model_buffer(&self) -> &DynamicModelBuffer {
        &self.model_buffer
    }

    /// Vertex system block
    pub fn vertex_uniforms(&self) -> &UniformBuffer {
        &self.vertex_uniforms
    }

    fn queue_mesh(
        &mut self,
        device: &mut dyn GraphicsDevice,
        mesh: &Mesh,
        pipeline: PipelineId,
        transform: Mat4,
        texture_matrix: Option<Mat4>,
    ) -> GfxResult<Option<RenderCommandId>> {
        if self.queue.is_full() {
            self.queue.reject();
            return Ok(None);
        }
        let material = mesh.material().map(|m| &**m).unwrap_or(&self.default_material);
        let material_set =
            self.materials
                .descriptor_set(device, material, pipeline, self.default_texture.reference())?;
        Ok(self.queue.add_command(RenderCommand {
            mesh: *mesh.buffers(),
            material_set,
            transform,
            texture_matrix: texture_matrix.unwrap_or_else(Mat4::identity),
        }))
    }

    fn build(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        let max_objects = self.max_objects as u32;
        let desc = PipelineBuilder::new(FORWARD_PIPELINE_NAME, self.shader, self.render_pass)
            .vertex_layout(Vertex::layout())
            .scene_layout(
                DescriptorLayout::new()
                    .add_uniform_buffer(CAMERA_BINDING, ShaderStages::VERTEX)
                    .add_dynamic_uniform_buffer(MODEL_MATRIX_BINDING, ShaderStages::VERTEX)
                    .add_uniform_buffer(LIGHT_BLOCK_BINDING, ShaderStages::FRAGMENT),
            )
            .draw_layout(material_layout())
            .pool_size(DescriptorType::UniformBuffer, max_objects + 2)
            .pool_size(DescriptorType::UniformBufferDynamic, 1)
            .pool_size(DescriptorType::ImageSampler, MATERIAL_TEXTURE_SLOTS * max_objects)
            .color_attachments(1)
            .cull_mode(CullMode::Back)
            .dimensions(self.width, self.height)
            .max_objects(max_objects)
            .build()?;
        let pipeline = device.create_pipeline(&desc)?;
        self.pipeline = Some(pipeline);

        self.scene_set = Some(
            DescriptorSetBuilder::new()
                .write_uniform(CAMERA_BINDING, &self.vertex_uniforms)
                .write_buffer(
                    MODEL_MATRIX_BINDING,
                    self.model_buffer.buffer_id(),
                    0,
                    self.model_buffer.binding_range(),
                )
                .write_uniform(LIGHT_BLOCK_BINDING, &self.light_buffer)
                .allocate(device, pipeline, DescriptorTier::Scene)?,
        );
        self.depth = Some(device.create_texture(
            &TextureDesc::render_target("Forward depth", self.width, self.height, Format::Depth32Float),
            None,
        )?);

        let needed = device.capabilities().swapchain_image_count.max(1) as usize;
        while self.primaries.len() < needed {
            self.primaries.push(CommandBuffer::new(device, CommandBufferLevel::Primary)?);
        }
        while self.primaries.len() > needed {
            if let Some(primary) = self.primaries.pop() {
                primary.destroy(device)?;
            }
        }

        self.build_framebuffers(device)?;
        log::debug!(
            "Forward pipeline built at {}x{} with {} framebuffers",
            self.width,
            self.height,
            self.framebuffers.len()
        );
        Ok(())
    }

    fn build_framebuffers(&mut self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        let depth = self.depth.as_ref().map(OwnedTexture::reference).ok_or_else(|| released("build framebuffers"))?;
        let colours: Vec<(String, FramebufferAttachment)> = match self.render_target {
            Some(texture) => vec![("Forward target".into(), FramebufferAttachment::Texture(texture))],
            None => (0..device.capabilities().swapchain_image_count)
                .map(|image| (format!("Forward swapchain {image}"), FramebufferAttachment::SwapchainImage(image)))
                .collect(),
        };
        for (label, colour) in colours {
            self.framebuffers.push(device.create_framebuffer(&FramebufferDesc {
                label,
                render_pass: self.render_pass,
                width: self.width,
                height: self.height,
                attachments: vec![colour, FramebufferAttachment::Texture(depth)],
            })?);
        }
        Ok(())
    }

    fn release_framebuffers(&mut self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        for framebuffer in self.framebuffers.drain(..) {
            device.destroy_framebuffer(framebuffer)?;
        }
        Ok(())
    }

    fn release(&mut self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        self.release_framebuffers(device)?;
        if let Some(pipeline) = self.pipeline.take() {
            device.destroy_pipeline(pipeline)?;
            self.materials.forget_sets();
        }
        self.scene_set = None;
        if let Some(depth) = self.depth.take() {
            device.destroy_texture(depth)?;
        }
        Ok(())
    }

    fn wait_idle(&mut self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        device.wait_idle()?;
        for primary in &mut self.primaries {
            primary.mark_idle();
        }
        Ok(())
    }
}

fn released(operation: &'static str) -> GfxError {
    GfxError::InvalidState {
        resource: "forward renderer",
        state: "pipeline released".into(),
        operation,
    }
}

fn missing_frame_slot(image: u32) -> GfxError {
    GfxError::InvalidState {
        resource: "forward framebuffer",
        state: format!("no frame slot for image {image}"),
        operation: "render scene",
    }
}

impl Renderer3D for ForwardRenderer {
    fn render_scene(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &dyn RenderManager,
        render_list: &dyn RenderList,
        scene: &dyn SceneView,
    ) -> RenderResult<FrameStats> {
        ForwardRenderer::render_scene(self, device, manager, render_list, scene)
    }

    fn on_resize(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &mut dyn RenderManager,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        ForwardRenderer::on_resize(self, device, manager, width, height)
    }

    fn set_render_target(
        &mut self,
        device: &mut dyn GraphicsDevice,
        _manager: &dyn RenderManager,
        target: Option<TextureRef>,
    ) -> RenderResult<()> {
        ForwardRenderer::set_render_target(self, device, target)
    }

    fn set_render_to_gbuffer_texture(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &dyn RenderManager,
        enabled: bool,
    ) -> RenderResult<()> {
        ForwardRenderer::set_render_to_gbuffer_texture(self, device, manager, enabled)
    }

    fn destroy(self: Box<Self>, device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        ForwardRenderer::destroy(*self, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HeadlessConfig;
    use crate::foundation::math::{mat4_to_cols, Vec3};
    use crate::render::backends::headless::HeadlessDevice;
    use crate::render::error::CapacityKind;
    use crate::render::manager::SceneRenderManager;
    use crate::render::scene::{CameraData, Light, SceneSnapshot};
    use crate::render::shader::InMemoryShaderLibrary;

    fn setup(max_objects: u32) -> (HeadlessDevice, SceneRenderManager, ForwardRenderer) {
        let mut device = HeadlessDevice::new(HeadlessConfig::default(), Extent2D::new(40, 30));
        let manager = SceneRenderManager::new(&mut device, 40, 30).unwrap();
        let shaders = InMemoryShaderLibrary::new().with_placeholder("forward");
        let config = RendererConfig::default().with_max_objects(max_objects);
        let renderer = ForwardRenderer::new(&mut device, &manager, &shaders, &config).unwrap();
        (device, manager, renderer)
    }

    fn teardown(mut device: HeadlessDevice, manager: SceneRenderManager, renderer: ForwardRenderer) {
        renderer.destroy(&mut device).unwrap();
        manager.destroy(&mut device).unwrap();
        assert_eq!(device.live_objects().total(), 0);
    }

    fn camera() -> CameraData {
        CameraData::look_at(Vec3::new(0.0, 0.0, 4.0), Vec3::zeros(), 1.0, 4.0 / 3.0, 0.1, 50.0)
    }

    #[test]
    fn test_forward_frame_draws_inline() {
        let (mut device, manager, mut renderer) = setup(8);
        let cube = Mesh::cube(&mut device).unwrap();
        let mut scene = SceneSnapshot::new(camera());
        scene.add_light(Light::point(Vec3::new(0.0, 2.0, 0.0), Vec3::new(1.0, 1.0, 1.0), 1.0, 8.0));
        scene.add_mesh(&cube, Mat4::identity());
        scene.add_mesh(&cube, Mat4::new_translation(&Vec3::new(1.0, 0.0, 0.0)));

        let stats = renderer.render_scene(&mut device, &manager, &scene, &scene).unwrap();
        assert_eq!(stats.objects_submitted, 2);
        assert_eq!(stats.lights_packed, 1);
        assert_eq!(stats.secondary_buffers, 0);
        assert!(stats.presented);

        let submissions = device.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].draw_count(), 2);
        assert_eq!(submissions[0].secondary_count(), 0);
        assert_eq!(submissions[0].clear_colours(), vec![FORWARD_CLEAR_COLOUR]);
        let alignment = renderer.model_buffer().alignment() as u32;
        let offsets: Vec<u32> = submissions[0].descriptor_binds().iter().map(|(_, o)| o[0]).collect();
        assert_eq!(offsets, vec![0, alignment]);

        let vertex = device.buffer_contents(renderer.vertex_uniforms().id()).unwrap();
        let view: [[f32; 4]; 4] = bytemuck::pod_read_unaligned(&vertex[64..128]);
        assert_eq!(view, mat4_to_cols(&camera().view));

        cube.destroy(&mut device).unwrap();
        teardown(device, manager, renderer);
    }

    #[test]
    fn test_forward_resize_and_target() {
        let (mut device, mut manager, mut renderer) = setup(4);
        let old_depth = renderer.depth_target().unwrap();

        renderer.on_resize(&mut device, &mut manager, 64, 32).unwrap();
        assert_eq!(renderer.dimensions(), (64, 32));
        assert_eq!(renderer.framebuffers().len(), 3);
        let depth = renderer.depth_target().unwrap();
        assert_ne!(depth.id(), old_depth.id());
        assert_eq!((depth.width(), depth.height()), (64, 32));

        renderer
            .set_render_to_gbuffer_texture(&mut device, &manager, true)
            .unwrap();
        assert_eq!(renderer.framebuffers().len(), 1);
        let scene = SceneSnapshot::new(camera());
        let stats = renderer.render_scene(&mut device, &manager, &scene, &scene).unwrap();
        assert!(!stats.presented);
        assert_eq!(stats.output, Some(OutputTarget::Texture(manager.gbuffer().offscreen0)));
        assert!(device.presented_images().is_empty());

        teardown(device, manager, renderer);
    }

    #[test]
    fn test_forward_object_capacity() {
        let (mut device, manager, mut renderer) = setup(1);
        let cube = Mesh::cube(&mut device).unwrap();
        let mut scene = SceneSnapshot::new(camera());
        scene.add_mesh(&cube, Mat4::identity());
        scene.add_mesh(&cube, Mat4::identity());

        let stats = renderer.render_scene(&mut device, &manager, &scene, &scene).unwrap();
        assert_eq!(stats.objects_submitted, 1);
        assert_eq!(stats.objects_dropped, 1);
        assert_eq!(stats.capacity_violations[0].what, CapacityKind::Objects);

        cube.destroy(&mut device).unwrap();
        teardown(device, manager, renderer);
    }

    #[test]
    fn test_forward_material_churn() {
        let (mut device, manager, mut renderer) = setup(2);
        for frame in 0..16 {
            let material = std::sync::Arc::new(Material::new().with_name(format!("forward {frame}")));
            let cube = Mesh::cube(&mut device).unwrap().with_material(material);
            let mut scene = SceneSnapshot::new(camera());
            scene.add_mesh(&cube, Mat4::identity());

            let stats = renderer.render_scene(&mut device, &manager, &scene, &scene).unwrap();
            assert_eq!(stats.objects_submitted, 1, "frame {frame}");
            cube.destroy(&mut device).unwrap();
        }
        teardown(device, manager, renderer);
    }
}
