//! # Deferred Renderer
//!
//! Two-pass renderer over any [`GraphicsDevice`]:
//!
//! 1. The geometry pass writes albedo, position, normals and PBR parameters
//!    of every opaque mesh into the GBuffer. Each mesh is recorded into its
//!    own secondary command buffer, reading its model matrix from one shared
//!    dynamic uniform buffer at `slot * alignment`.
//! 2. The lighting pass draws a single screen quad that samples the GBuffer,
//!    the shadow cascades, the environment cube map and the preintegrated FG
//!    table, and shades with the packed light block. Missing inputs are
//!    replaced by 1x1 fallbacks, so every binding is written. Its output is
//!    a swapchain image, which is presented, or a render target texture.
//!
//! A frame runs [`render_scene`](DeferredRenderer::render_scene), or the
//! individual steps in this order:
//!
//! ```text
//! begin_scene → submit_light_setup → begin_offscreen → submit_mesh* →
//! set_system_uniforms → present_offscreen → end_offscreen → light_pass
//! ```
//!
//! The order is checked at runtime. In particular no per-mesh secondary is
//! recorded before every model matrix has been uploaded.
//!
//! Pipelines, their descriptor sets and the geometry framebuffer are one
//! unit: a resize destroys and rebuilds all of them together. Changing the
//! render target only rebuilds the lighting framebuffers.

pub mod dynamic_buffer;
pub mod pipelines;
pub mod uniforms;

#[cfg(test)]
mod tests;

pub use dynamic_buffer::{dynamic_alignment, DynamicModelBuffer};
pub use uniforms::{
    GpuLight, LightPackReport, LightSetupPacker, LightUniformBlock, LightUniformIndex, SystemUniforms,
    VertexUniformSlot, LIGHT_BLOCK_SIZE, MAX_LIGHTS, MAX_SHADOWMAPS,
};

use crate::core::RendererConfig;
use crate::foundation::math::Mat4;
use crate::render::error::{RenderError, RenderResult};
use crate::render::gfx::{
    CommandBufferId, CommandBufferLevel, DescriptorSetId, Extent2D, Format, FramebufferId, GfxError,
    GfxResult, GraphicsDevice, OwnedTexture, PipelineId, RenderPassId, ShaderId, SubpassContents,
    TextureRef, UniformBuffer,
};
use crate::render::manager::{GBufferTargets, RenderManager};
use crate::render::material::{Material, MaterialCache, MaterialTextures};
use crate::render::mesh::Mesh;
use crate::render::pass::{record_mesh_draw, CommandBuffer};
use crate::render::pipeline::{DescriptorSetBuilder, DescriptorTier};
use crate::render::render_queue::{RenderCommand, RenderCommandId, RenderQueue};
use crate::render::renderer::Renderer3D;
use crate::render::scene::{RenderList, SceneView};
use crate::render::shader::ShaderLibrary;
use crate::render::stats::{FrameStats, OutputTarget};
use crate::render::textures::{
    create_checkerboard, create_environment_fallback, create_fg_fallback, create_shadow_fallback,
};

use pipelines::{lighting, LIGHT_BLOCK_BINDING, MODEL_MATRIX_BINDING, SCENE_UNIFORM_BINDING};

/// Lighting pass clear colour after initialization
pub const INITIAL_CLEAR_COLOUR: [f32; 4] = [0.1, 0.1, 0.1, 1.0];
/// Lighting pass clear colour after a resize
pub const RESIZED_CLEAR_COLOUR: [f32; 4] = [0.8, 0.8, 0.8, 1.0];
/// Geometry pass clear colour
pub const OFFSCREEN_CLEAR_COLOUR: [f32; 4] = [0.0; 4];

const DEFAULT_TEXTURE_SIZE: u32 = 8;

/// Where the renderer is within a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    /// No frame open
    Idle,
    /// Geometry pass open, meshes being queued
    Offscreen,
    /// Camera, model and light uniforms uploaded
    UniformsUploaded,
    /// Every queued mesh recorded into the geometry pass
    OffscreenRecorded,
    /// Geometry pass submitted and complete
    OffscreenSubmitted,
}

/// Everything the lighting set samples, compared each frame to spot changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LightingInputs {
    gbuffer: GBufferTargets,
    preintegrated_fg: TextureRef,
    environment: TextureRef,
    shadow_maps: TextureRef,
}

impl LightingInputs {
    fn descriptor_writes(&self) -> DescriptorSetBuilder {
        DescriptorSetBuilder::new()
            .write_image(lighting::COLOUR, self.gbuffer.colour)
            .write_image(lighting::POSITION, self.gbuffer.position)
            .write_image(lighting::NORMAL, self.gbuffer.normal)
            .write_image(lighting::PBR, self.gbuffer.pbr)
            .write_image(lighting::PREINTEGRATED_FG, self.preintegrated_fg)
            .write_image(lighting::CUBE_MAP, self.environment)
            .write_image(lighting::SHADOW_MAP, self.shadow_maps)
            .write_image(lighting::DEPTH, self.gbuffer.depth)
    }
}

/// Objects rebuilt together on resize
#[derive(Debug, Clone, Copy)]
struct PassObjects {
    offscreen_pipeline: PipelineId,
    deferred_pipeline: PipelineId,
    offscreen_framebuffer: FramebufferId,
    offscreen_scene_set: DescriptorSetId,
    lighting_scene_set: DescriptorSetId,
    lighting_set: DescriptorSetId,
    lighting_inputs: LightingInputs,
}

/// GBuffer renderer with a full-screen lighting composite
#[derive(Debug)]
pub struct DeferredRenderer {
    width: u32,
    height: u32,
    max_objects: usize,

    geometry_shader: ShaderId,
    lighting_shader: ShaderId,
    offscreen_pass: RenderPassId,
    deferred_pass: RenderPassId,
    passes: Option<PassObjects>,
    framebuffers: Vec<FramebufferId>,

    offscreen_cmd: CommandBuffer,
    primaries: Vec<CommandBuffer>,
    quad_secondaries: Vec<CommandBuffer>,
    draw_secondaries: Vec<CommandBuffer>,
    screen_quad: Mesh,

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
    fg_fallback: OwnedTexture,
    environment_fallback: OwnedTexture,
    shadow_fallback: OwnedTexture,

    render_target: Option<TextureRef>,
    render_to_gbuffer: bool,
    cube_map: Option<TextureRef>,
    clear_colour: [f32; 4],
    phase: FramePhase,
    stats: FrameStats,
}

impl DeferredRenderer {
    /// Create both passes, both pipelines, every framebuffer and uniform
    /// buffer, and the default material
    ///
    /// The screen size is taken from the manager's GBuffer.
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
        log::info!("Initializing deferred renderer at {width}x{height} for {max_objects} objects");

        let geometry_shader = device.create_shader(&shaders.load(&config.shaders.geometry_pass)?)?;
        let lighting_shader = device.create_shader(&shaders.load(&config.shaders.lighting_pass)?)?;
        let offscreen_pass = device.create_render_pass(&pipelines::offscreen_pass_desc())?;
        let deferred_pass = device.create_render_pass(&pipelines::deferred_pass_desc())?;

        let default_texture = create_checkerboard(device, DEFAULT_TEXTURE_SIZE)?;
        let fg_fallback = create_fg_fallback(device)?;
        let environment_fallback = create_environment_fallback(device)?;
        let shadow_fallback = create_shadow_fallback(device)?;
        let default_material = Material::new().with_name("Default").with_textures(MaterialTextures {
            albedo: Some(default_texture.reference()),
            ..MaterialTextures::default()
        });

        let system_uniforms = SystemUniforms::deferred();
        let vertex_uniforms = UniformBuffer::create(device, system_uniforms.size() as u64)?;
        let model_buffer = DynamicModelBuffer::new(device, max_objects)?;
        let light_buffer = UniformBuffer::create(device, LIGHT_BLOCK_SIZE as u64)?;

        let offscreen_cmd = CommandBuffer::new(device, CommandBufferLevel::Primary)?;
        let screen_quad = Mesh::screen_quad(device)?;

        let mut renderer = Self {
            width,
            height,
            max_objects,
            geometry_shader,
            lighting_shader,
            offscreen_pass,
            deferred_pass,
            passes: None,
            framebuffers: Vec::new(),
            offscreen_cmd,
            primaries: Vec::new(),
            quad_secondaries: Vec::new(),
            draw_secondaries: Vec::new(),
            screen_quad,
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
            fg_fallback,
            environment_fallback,
            shadow_fallback,
            render_target: None,
            render_to_gbuffer: false,
            cube_map: None,
            clear_colour: INITIAL_CLEAR_COLOUR,
            phase: FramePhase::Idle,
            stats: FrameStats::default(),
        };

        renderer.ensure_frame_command_buffers(device)?;
        renderer.build_passes(device, manager)?;
        renderer.build_framebuffers(device, manager)?;
        log::info!(
            "Deferred renderer ready: {} lighting framebuffers, dynamic alignment {}",
            renderer.framebuffers.len(),
            renderer.model_buffer.alignment()
        );
        Ok(renderer)
    }

    // ---- frame ----

    /// Render one frame: lights, geometry pass, lighting pass, present
    pub fn render_scene(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &dyn RenderManager,
        render_list: &dyn RenderList,
        scene: &dyn SceneView,
    ) -> RenderResult<FrameStats> {
        self.begin_scene(device, manager, scene)?;
        self.submit_light_setup(manager, scene);
        self.begin_offscreen(device)?;

        let mut submitted: RenderResult<()> = Ok(());
        render_list.for_each_opaque(&mut |object| {
            if submitted.is_err() {
                return;
            }
            if let Some(mesh) = object.mesh {
                submitted = self
                    .submit_mesh(&mut *device, mesh, &object.world_transform, object.texture_matrix)
                    .map(|_| ());
            }
        });
        submitted?;

        self.set_system_uniforms(device)?;
        self.present_offscreen(device)?;
        self.end_offscreen(device)?;
        self.light_pass(device)?;
        Ok(self.stats.clone())
    }

    /// Start a frame: reset statistics, write projection times view, and
    /// bring the lighting set up to date with the manager's inputs
    pub fn begin_scene(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &dyn RenderManager,
        scene: &dyn SceneView,
    ) -> RenderResult<()> {
        self.stats = FrameStats::default();
        let camera = scene.camera();
        self.system_uniforms
            .write_matrix(VertexUniformSlot::ProjectionMatrix, &camera.proj_view());

        let skybox = manager.skybox();
        if skybox != self.cube_map {
            if skybox.is_some() {
                log::debug!("Binding skybox to the lighting pass");
            } else {
                log::debug!("Skybox gone, rebuilding the lighting set without it");
            }
            self.cube_map = skybox;
        }
        self.refresh_lighting_set(device, manager)?;
        Ok(())
    }

    /// Pack lights, camera and shadow cascades into the light block
    ///
    /// Only the CPU copy is written here; it is uploaded by
    /// [`set_system_uniforms`](Self::set_system_uniforms).
    pub fn submit_light_setup(&mut self, manager: &dyn RenderManager, scene: &dyn SceneView) -> LightPackReport {
        let lights = scene.lights();
        let report = self
            .packer
            .pack(&mut self.light_block, &scene.camera(), lights, manager.shadow_source());
        self.stats.lights_packed = report.lights_packed;
        self.stats.lights_dropped = lights.len() - report.lights_packed;
        self.stats.shadow_maps_packed = report.shadow_maps_packed;
        self.stats.capacity_violations.extend(report.violations.iter().copied());
        report
    }

    /// Open the geometry pass and clear last frame's queue
    ///
    /// Materials the previous frame did not draw release their descriptor
    /// sets here.
    pub fn begin_offscreen(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        self.expect_phase(&[FramePhase::Idle, FramePhase::OffscreenSubmitted], "begin offscreen")?;
        let passes = self.pass_objects("begin offscreen")?;

        self.materials.begin_frame(device)?;
        self.queue.clear();
        self.model_buffer.clear();
        self.offscreen_cmd.begin_recording(device)?;
        self.offscreen_cmd.begin_render_pass(
            device,
            self.offscreen_pass,
            passes.offscreen_framebuffer,
            OFFSCREEN_CLEAR_COLOUR,
            SubpassContents::SecondaryCommandBuffers,
        )?;
        self.phase = FramePhase::Offscreen;
        Ok(())
    }

    /// Queue one mesh for the geometry pass
    ///
    /// Builds the descriptor set of the mesh's material on first use, or the
    /// default material's when the mesh has none. Returns the dynamic buffer
    /// slot, or `None` once the object capacity is exhausted.
    pub fn submit_mesh(
        &mut self,
        device: &mut dyn GraphicsDevice,
        mesh: &Mesh,
        transform: &Mat4,
        texture_matrix: Option<Mat4>,
    ) -> RenderResult<Option<RenderCommandId>> {
        self.expect_phase(&[FramePhase::Offscreen], "submit mesh")?;
        let pipeline = self.pass_objects("submit mesh")?.offscreen_pipeline;

        if self.queue.is_full() {
            self.queue.reject();
            if self.queue.dropped() == 1 {
                log::warn!(
                    "Object capacity of {} reached, further meshes are dropped this frame",
                    self.queue.capacity()
                );
            }
            return Ok(None);
        }

        let material = mesh.material().map(|m| &**m).unwrap_or(&self.default_material);
        let material_set =
            self.materials
                .descriptor_set(device, material, pipeline, self.default_texture.reference())?;

        Ok(self.queue.add_command(RenderCommand {
            mesh: *mesh.buffers(),
            material_set,
            transform: *transform,
            texture_matrix: texture_matrix.unwrap_or_else(Mat4::identity),
        }))
    }

    /// Upload the camera block, every queued model matrix and the light block
    ///
    /// Must complete before any draw reading the model buffer is recorded.
    pub fn set_system_uniforms(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        self.expect_phase(&[FramePhase::Offscreen], "set system uniforms")?;

        self.vertex_uniforms.set_data(device, self.system_uniforms.as_bytes())?;
        for (slot, command) in self.queue.commands().iter().enumerate() {
            self.model_buffer.write(slot, &command.transform)?;
        }
        self.model_buffer.upload(device)?;
        self.light_buffer.set_data(device, self.light_block.as_bytes())?;

        if let Some(overflow) = self.queue.overflow() {
            log::warn!("Geometry pass clamped: {overflow}");
            self.stats.capacity_violations.push(overflow);
        }
        self.stats.objects_submitted = self.queue.len();
        self.stats.objects_dropped = self.queue.dropped();
        self.phase = FramePhase::UniformsUploaded;
        Ok(())
    }

    /// Record one secondary per queued mesh and execute them into the geometry pass
    pub fn present_offscreen(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        self.expect_phase(&[FramePhase::UniformsUploaded], "present offscreen")?;
        let passes = self.pass_objects("present offscreen")?;

        if self.draw_secondaries.len() < self.queue.len() {
            while self.draw_secondaries.len() < self.queue.len() {
                self.draw_secondaries
                    .push(CommandBuffer::new(device, CommandBufferLevel::Secondary)?);
            }
            log::debug!("Secondary command pool grown to {}", self.draw_secondaries.len());
        }

        let extent = Extent2D::new(self.width, self.height);
        for (slot, command) in self.queue.commands().iter().enumerate() {
            let secondary = &mut self.draw_secondaries[slot];
            record_mesh_draw(
                device,
                secondary,
                self.offscreen_pass,
                passes.offscreen_framebuffer,
                extent,
                passes.offscreen_pipeline,
                &[passes.offscreen_scene_set, command.material_set],
                &[self.model_buffer.offset(slot)],
                &command.mesh,
            )?;
            secondary.execute_secondary(device, &self.offscreen_cmd)?;
        }

        self.stats.secondary_buffers += self.queue.len();
        self.phase = FramePhase::OffscreenRecorded;
        Ok(())
    }

    /// Close the geometry pass, submit it and wait for it to finish
    pub fn end_offscreen(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        self.expect_phase(&[FramePhase::OffscreenRecorded], "end offscreen")?;
        self.offscreen_cmd.end_render_pass(device)?;
        self.offscreen_cmd.end_recording(device)?;
        self.offscreen_cmd.execute(device, true)?;
        self.phase = FramePhase::OffscreenSubmitted;
        Ok(())
    }

    /// Composite the GBuffer into the render target or the next swapchain image
    ///
    /// Swapchain output is presented; texture output is submitted and waited on.
    pub fn light_pass(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        self.expect_phase(&[FramePhase::Idle, FramePhase::OffscreenSubmitted], "light pass")?;
        let passes = self.pass_objects("light pass")?;

        let image = match self.render_target {
            Some(_) => 0,
            None if self.framebuffers.is_empty() => return Err(RenderError::NoPresentationTarget),
            None => device.acquire_next_image()?,
        };
        let slot = image as usize;
        let framebuffer = *self.framebuffers.get(slot).ok_or_else(|| missing_frame_slot(image))?;

        {
            let primary = self.primaries.get_mut(slot).ok_or_else(|| missing_frame_slot(image))?;
            let quad = self
                .quad_secondaries
                .get_mut(slot)
                .ok_or_else(|| missing_frame_slot(image))?;

            primary.begin_recording(device)?;
            primary.begin_render_pass(
                device,
                self.deferred_pass,
                framebuffer,
                self.clear_colour,
                SubpassContents::SecondaryCommandBuffers,
            )?;
            record_mesh_draw(
                device,
                quad,
                self.deferred_pass,
                framebuffer,
                Extent2D::new(self.width, self.height),
                passes.deferred_pipeline,
                &[passes.lighting_scene_set, passes.lighting_set],
                &[],
                self.screen_quad.buffers(),
            )?;
            quad.execute_secondary(device, primary)?;
            primary.end_render_pass(device)?;
            primary.end_recording(device)?;
        }
        self.stats.secondary_buffers += 1;

        match self.render_target {
            Some(texture) => {
                self.primaries[slot].execute(device, true)?;
                self.stats.output = Some(OutputTarget::Texture(texture));
            }
            None => self.present_to_screen(device, image)?,
        }
        self.phase = FramePhase::Idle;
        Ok(())
    }

    /// Submit the recorded lighting pass for `image` and present it
    pub fn present_to_screen(&mut self, device: &mut dyn GraphicsDevice, image: u32) -> RenderResult<()> {
        let primary = self
            .primaries
            .get_mut(image as usize)
            .ok_or_else(|| missing_frame_slot(image))?;
        primary.present(device, image)?;
        self.stats.presented = true;
        self.stats.output = Some(OutputTarget::Swapchain(image));
        Ok(())
    }

    // ---- reconfiguration ----

    /// Rebuild every size-dependent object for a new screen size
    ///
    /// Waits for the device, destroys the framebuffers and pipelines (their
    /// descriptor sets go with them), resizes the swapchain if it does not
    /// match yet, has the manager recreate the GBuffer, and rebuilds in
    /// initialization order. Uniform buffers are kept. The cube map binding
    /// is dropped and picked up again by the next [`begin_scene`](Self::begin_scene).
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
        self.expect_phase(&[FramePhase::Idle, FramePhase::OffscreenSubmitted], "resize")?;
        log::info!("Resizing deferred renderer from {}x{} to {width}x{height}", self.width, self.height);

        self.wait_idle(device)?;
        self.release_framebuffers(device)?;
        self.release_passes(device)?;

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
                log::warn!(
                    "Render target is {}x{} after resize to {width}x{height}, returning output to the swapchain",
                    target.width(),
                    target.height()
                );
                self.render_target = None;
            }
        }
        self.cube_map = None;
        self.clear_colour = RESIZED_CLEAR_COLOUR;

        self.ensure_frame_command_buffers(device)?;
        self.build_passes(device, &*manager)?;
        self.build_framebuffers(device, &*manager)?;
        self.phase = FramePhase::Idle;
        Ok(())
    }

    /// Send the lighting pass to `target`, or back to the swapchain with `None`
    ///
    /// Only the lighting framebuffers are rebuilt. The texture must match the
    /// screen size and use the presentation format.
    pub fn set_render_target(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &dyn RenderManager,
        target: Option<TextureRef>,
    ) -> RenderResult<()> {
        self.redirect_output(device, manager, target)?;
        self.render_to_gbuffer = false;
        Ok(())
    }

    /// Send the lighting pass to the GBuffer's `Offscreen0` texture, or back to the swapchain
    pub fn set_render_to_gbuffer_texture(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &dyn RenderManager,
        enabled: bool,
    ) -> RenderResult<()> {
        let target = enabled.then(|| manager.gbuffer().offscreen0);
        self.redirect_output(device, manager, target)?;
        self.render_to_gbuffer = enabled;
        Ok(())
    }

    /// Select the lighting shader's debug view; 0 is the lit image
    pub fn set_render_mode(&mut self, mode: u32) {
        self.packer = self.packer.with_render_mode(mode);
    }

    /// Release every object the renderer owns
    ///
    /// Textures owned by the render manager are left alone.
    pub fn destroy(mut self, device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        self.wait_idle(device)?;
        self.release_framebuffers(device)?;
        self.materials.destroy(device)?;
        self.release_passes(device)?;

        device.destroy_render_pass(self.offscreen_pass)?;
        device.destroy_render_pass(self.deferred_pass)?;
        device.destroy_shader(self.geometry_shader)?;
        device.destroy_shader(self.lighting_shader)?;

        self.offscreen_cmd.destroy(device)?;
        for cmd in self
            .primaries
            .into_iter()
            .chain(self.quad_secondaries)
            .chain(self.draw_secondaries)
        {
            cmd.destroy(device)?;
        }
        self.screen_quad.destroy(device)?;

        self.vertex_uniforms.destroy(device)?;
        self.model_buffer.destroy(device)?;
        self.light_buffer.destroy(device)?;
        device.destroy_texture(self.default_texture)?;
        device.destroy_texture(self.fg_fallback)?;
        device.destroy_texture(self.environment_fallback)?;
        device.destroy_texture(self.shadow_fallback)?;
        log::info!("Deferred renderer destroyed");
        Ok(())
    }

    // ---- queries ----

    /// Screen size
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Object capacity per frame
    pub fn max_objects(&self) -> usize {
        self.max_objects
    }

    /// Stride of the dynamic model buffer
    pub fn dynamic_alignment(&self) -> usize {
        self.model_buffer.alignment()
    }

    /// Current frame phase
    pub fn frame_phase(&self) -> FramePhase {
        self.phase
    }

    /// Texture the lighting pass renders into, `None` for the swapchain
    pub fn render_target(&self) -> Option<TextureRef> {
        self.render_target
    }

    /// Whether output follows the GBuffer's `Offscreen0` texture
    pub fn renders_to_gbuffer_texture(&self) -> bool {
        self.render_to_gbuffer
    }

    /// Lighting pass clear colour
    pub fn clear_colour(&self) -> [f32; 4] {
        self.clear_colour
    }

    /// Cube map currently bound to the lighting set
    pub fn cube_map(&self) -> Option<TextureRef> {
        self.cube_map
    }

    /// Black cube bound while no skybox exists
    pub fn environment_fallback(&self) -> TextureRef {
        self.environment_fallback.reference()
    }

    /// Depth array bound while no shadow source exists
    pub fn shadow_fallback(&self) -> TextureRef {
        self.shadow_fallback.reference()
    }

    /// Statistics of the frame in progress or last finished
    pub fn frame_stats(&self) -> &FrameStats {
        &self.stats
    }

    /// Commands queued this frame
    pub fn queue(&self) -> &RenderQueue {
        &self.queue
    }

    /// CPU copy of the light block
    pub fn light_block(&self) -> &LightUniformBlock {
        &self.light_block
    }

    /// Light block buffer
    pub fn light_buffer(&self) -> &UniformBuffer {
        &self.light_buffer
    }

    /// Dynamic model buffer
    pub fn model_buffer(&self) -> &DynamicModelBuffer {
        &self.model_buffer
    }

    /// Materials holding a descriptor set and uniform buffer
    pub fn cached_materials(&self) -> usize {
        self.materials.len()
    }

    /// Material used by meshes without one
    pub fn default_material(&self) -> &Material {
        &self.default_material
    }

    /// Geometry pipeline, absent only mid-rebuild
    pub fn offscreen_pipeline(&self) -> Option<PipelineId> {
        self.passes.map(|p| p.offscreen_pipeline)
    }

    /// Lighting pipeline
    pub fn deferred_pipeline(&self) -> Option<PipelineId> {
        self.passes.map(|p| p.deferred_pipeline)
    }

    /// Geometry pass framebuffer
    pub fn offscreen_framebuffer(&self) -> Option<FramebufferId> {
        self.passes.map(|p| p.offscreen_framebuffer)
    }

    /// Per-draw set of the lighting pass
    pub fn lighting_set(&self) -> Option<DescriptorSetId> {
        self.passes.map(|p| p.lighting_set)
    }

    /// Lighting pass framebuffers, one per swapchain image or one for the render target
    pub fn framebuffers(&self) -> &[FramebufferId] {
        &self.framebuffers
    }

    /// Primary buffer of the geometry pass
    pub fn offscreen_command_buffer(&self) -> CommandBufferId {
        self.offscreen_cmd.id()
    }

    // ---- internals ----

    fn expect_phase(&self, allowed: &[FramePhase], operation: &'static str) -> GfxResult<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(GfxError::InvalidState {
                resource: "deferred frame",
                state: format!("{:?}", self.phase),
                operation,
            })
        }
    }

    fn pass_objects(&self, operation: &'static str) -> GfxResult<PassObjects> {
        self.passes.ok_or_else(|| GfxError::InvalidState {
            resource: "deferred renderer",
            state: "pipelines released".into(),
            operation,
        })
    }

    fn lighting_inputs(&self, manager: &dyn RenderManager) -> LightingInputs {
        LightingInputs {
            gbuffer: manager.gbuffer(),
            preintegrated_fg: manager
                .preintegrated_fg()
                .unwrap_or_else(|| self.fg_fallback.reference()),
            environment: self.cube_map.unwrap_or_else(|| self.environment_fallback.reference()),
            shadow_maps: manager
                .shadow_source()
                .map_or_else(|| self.shadow_fallback.reference(), |s| s.shadow_texture()),
        }
    }

    fn refresh_lighting_set(&mut self, device: &mut dyn GraphicsDevice, manager: &dyn RenderManager) -> GfxResult<()> {
        let inputs = self.lighting_inputs(manager);
        let passes = self.passes.as_mut().ok_or_else(|| GfxError::InvalidState {
            resource: "deferred renderer",
            state: "pipelines released".into(),
            operation: "refresh lighting set",
        })?;
        if passes.lighting_inputs == inputs {
            return Ok(());
        }
        device.free_descriptor_set(passes.lighting_set)?;
        passes.lighting_set = inputs
            .descriptor_writes()
            .allocate(device, passes.deferred_pipeline, DescriptorTier::PerDraw)?;
        passes.lighting_inputs = inputs;
        Ok(())
    }

    fn ensure_frame_command_buffers(&mut self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        let needed = device.capabilities().swapchain_image_count.max(1) as usize;
        while self.primaries.len() < needed {
            self.primaries.push(CommandBuffer::new(device, CommandBufferLevel::Primary)?);
            self.quad_secondaries
                .push(CommandBuffer::new(device, CommandBufferLevel::Secondary)?);
        }
        while self.primaries.len() > needed {
            if let Some(primary) = self.primaries.pop() {
                primary.destroy(device)?;
            }
            if let Some(quad) = self.quad_secondaries.pop() {
                quad.destroy(device)?;
            }
        }
        Ok(())
    }

    fn build_passes(&mut self, device: &mut dyn GraphicsDevice, manager: &dyn RenderManager) -> RenderResult<()> {
        let gbuffer = manager.gbuffer();
        let offscreen_pipeline = device.create_pipeline(&pipelines::offscreen_pipeline_desc(
            self.geometry_shader,
            self.offscreen_pass,
            self.width,
            self.height,
            self.max_objects as u32,
        )?)?;
        let deferred_pipeline = device.create_pipeline(&pipelines::deferred_pipeline_desc(
            self.lighting_shader,
            self.deferred_pass,
            self.width,
            self.height,
        )?)?;
        let offscreen_framebuffer =
            device.create_framebuffer(&pipelines::offscreen_framebuffer_desc(self.offscreen_pass, &gbuffer))?;

        let offscreen_scene_set = DescriptorSetBuilder::new()
            .write_uniform(SCENE_UNIFORM_BINDING, &self.vertex_uniforms)
            .write_buffer(
                MODEL_MATRIX_BINDING,
                self.model_buffer.buffer_id(),
                0,
                self.model_buffer.binding_range(),
            )
            .allocate(device, offscreen_pipeline, DescriptorTier::Scene)?;
        let lighting_scene_set = DescriptorSetBuilder::new()
            .write_uniform(LIGHT_BLOCK_BINDING, &self.light_buffer)
            .allocate(device, deferred_pipeline, DescriptorTier::Scene)?;
        let lighting_inputs = self.lighting_inputs(manager);
        let lighting_set = lighting_inputs
            .descriptor_writes()
            .allocate(device, deferred_pipeline, DescriptorTier::PerDraw)?;

        self.materials.descriptor_set(
            device,
            &self.default_material,
            offscreen_pipeline,
            self.default_texture.reference(),
        )?;

        self.passes = Some(PassObjects {
            offscreen_pipeline,
            deferred_pipeline,
            offscreen_framebuffer,
            offscreen_scene_set,
            lighting_scene_set,
            lighting_set,
            lighting_inputs,
        });
        Ok(())
    }

    fn release_passes(&mut self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        if let Some(passes) = self.passes.take() {
            device.destroy_framebuffer(passes.offscreen_framebuffer)?;
            device.destroy_pipeline(passes.offscreen_pipeline)?;
            device.destroy_pipeline(passes.deferred_pipeline)?;
            self.materials.forget_sets();
        }
        Ok(())
    }

    fn build_framebuffers(&mut self, device: &mut dyn GraphicsDevice, manager: &dyn RenderManager) -> GfxResult<()> {
        let descs = pipelines::deferred_framebuffer_descs(
            self.deferred_pass,
            &manager.gbuffer(),
            self.render_target,
            device.capabilities().swapchain_image_count,
        );
        for desc in &descs {
            self.framebuffers.push(device.create_framebuffer(desc)?);
        }
        Ok(())
    }

    fn release_framebuffers(&mut self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        for framebuffer in self.framebuffers.drain(..) {
            device.destroy_framebuffer(framebuffer)?;
        }
        Ok(())
    }

    fn redirect_output(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &dyn RenderManager,
        target: Option<TextureRef>,
    ) -> RenderResult<()> {
        self.expect_phase(&[FramePhase::Idle, FramePhase::OffscreenSubmitted], "set render target")?;
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
        self.build_framebuffers(device, manager)?;
        log::debug!(
            "Lighting pass now renders to {}",
            if target.is_some() { "a texture" } else { "the swapchain" }
        );
        Ok(())
    }

    fn wait_idle(&mut self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        device.wait_idle()?;
        self.offscreen_cmd.mark_idle();
        for primary in &mut self.primaries {
            primary.mark_idle();
        }
        Ok(())
    }
}

fn missing_frame_slot(image: u32) -> GfxError {
    GfxError::InvalidState {
        resource: "lighting framebuffer",
        state: format!("no frame slot for image {image}"),
        operation: "light pass",
    }
}

impl Renderer3D for DeferredRenderer {
    fn render_scene(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &dyn RenderManager,
        render_list: &dyn RenderList,
        scene: &dyn SceneView,
    ) -> RenderResult<FrameStats> {
        DeferredRenderer::render_scene(self, device, manager, render_list, scene)
    }

    fn on_resize(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &mut dyn RenderManager,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        DeferredRenderer::on_resize(self, device, manager, width, height)
    }

    fn set_render_target(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &dyn RenderManager,
        target: Option<TextureRef>,
    ) -> RenderResult<()> {
        DeferredRenderer::set_render_target(self, device, manager, target)
    }

    fn set_render_to_gbuffer_texture(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &dyn RenderManager,
        enabled: bool,
    ) -> RenderResult<()> {
        DeferredRenderer::set_render_to_gbuffer_texture(self, device, manager, enabled)
    }

    fn destroy(self: Box<Self>, device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        DeferredRenderer::destroy(*self, device)
    }
}
