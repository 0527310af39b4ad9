//! Frame-level tests of the deferred renderer against the headless device

use std::sync::Arc;

use approx::assert_relative_eq;

use super::*;
use crate::core::HeadlessConfig;
use crate::foundation::math::{Vec3, Vec4};
use crate::render::backends::headless::HeadlessDevice;
use crate::render::error::CapacityKind;
use crate::render::gfx::{DescriptorWrite, FramebufferAttachment, TextureDesc};
use crate::render::manager::{SceneRenderManager, StaticShadowMaps};
use crate::render::scene::{CameraData, Light, OpaqueObject, SceneSnapshot};
use crate::render::shader::InMemoryShaderLibrary;

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;

struct Fixture {
    device: HeadlessDevice,
    manager: SceneRenderManager,
    renderer: DeferredRenderer,
}

impl Fixture {
    fn new() -> Self {
        Self::with(HeadlessConfig::default(), 16)
    }

    fn with(headless: HeadlessConfig, max_objects: u32) -> Self {
        let mut device = HeadlessDevice::new(headless, Extent2D::new(WIDTH, HEIGHT));
        let manager = SceneRenderManager::new(&mut device, WIDTH, HEIGHT).unwrap();
        let shaders = InMemoryShaderLibrary::new()
            .with_placeholder("deferred_geometry")
            .with_placeholder("deferred_lighting");
        let config = RendererConfig::default().with_max_objects(max_objects);
        let renderer = DeferredRenderer::new(&mut device, &manager, &shaders, &config).unwrap();
        Self { device, manager, renderer }
    }

    fn frame(&mut self, scene: &SceneSnapshot) -> FrameStats {
        self.device.clear_submissions();
        self.renderer
            .render_scene(&mut self.device, &self.manager, scene, scene)
            .unwrap()
    }

    fn light_bytes(&self) -> Vec<u8> {
        self.device
            .buffer_contents(self.renderer.light_buffer().id())
            .unwrap()
            .to_vec()
    }

    fn lighting_bindings(&self) -> Vec<DescriptorWrite> {
        self.device
            .descriptor_bindings(self.renderer.lighting_set().unwrap())
            .unwrap()
    }

    fn teardown(mut self) {
        self.renderer.destroy(&mut self.device).unwrap();
        self.manager.destroy(&mut self.device).unwrap();
        assert_eq!(self.device.live_objects().total(), 0, "{:?}", self.device.live_objects());
    }
}

fn camera() -> CameraData {
    CameraData::look_at(
        Vec3::new(0.0, 2.0, 6.0),
        Vec3::zeros(),
        1.0,
        WIDTH as f32 / HEIGHT as f32,
        0.1,
        100.0,
    )
}

fn translation(x: f32) -> Mat4 {
    Mat4::new_translation(&Vec3::new(x, 0.0, 0.0))
}

fn binding_numbers(writes: &[DescriptorWrite]) -> Vec<u32> {
    writes.iter().map(DescriptorWrite::binding).collect()
}

fn image_at(writes: &[DescriptorWrite], binding: u32) -> Option<TextureRef> {
    writes.iter().find_map(|w| match w {
        DescriptorWrite::Image { binding: b, texture } if *b == binding => Some(*texture),
        _ => None,
    })
}

#[test]
fn test_init_builds_both_passes() {
    let fx = Fixture::new();
    let renderer = &fx.renderer;
    assert_eq!(renderer.dimensions(), (WIDTH, HEIGHT));
    assert_eq!(renderer.framebuffers().len(), 3);
    assert_eq!(renderer.clear_colour(), INITIAL_CLEAR_COLOUR);
    assert_eq!(renderer.frame_phase(), FramePhase::Idle);

    let offscreen = fx.device.pipeline_info(renderer.offscreen_pipeline().unwrap()).unwrap();
    assert_eq!(offscreen.name, "OffScreenRenderer");
    assert_eq!(offscreen.max_objects, 16);
    assert_eq!(offscreen.color_attachment_count, 4);
    let deferred = fx.device.pipeline_info(renderer.deferred_pipeline().unwrap()).unwrap();
    assert_eq!(deferred.name, "Deferred");
    assert_eq!(deferred.max_objects, pipelines::DEFERRED_MAX_OBJECTS);

    let gbuffer_fb = fx.device.framebuffer_info(renderer.offscreen_framebuffer().unwrap()).unwrap();
    assert_eq!(gbuffer_fb.attachments.len(), 5);

    // No skybox and no shadows: bindings 5 and 6 hold the fallbacks
    let bindings = fx.lighting_bindings();
    assert_eq!(binding_numbers(&bindings), (0..pipelines::lighting::COUNT).collect::<Vec<_>>());
    assert_eq!(
        image_at(&bindings, pipelines::lighting::CUBE_MAP),
        Some(renderer.environment_fallback())
    );
    assert_eq!(
        image_at(&bindings, pipelines::lighting::SHADOW_MAP),
        Some(renderer.shadow_fallback())
    );
    fx.teardown();
}

#[test]
fn test_empty_scene_still_composites() {
    let mut fx = Fixture::new();
    let scene = SceneSnapshot::new(camera());
    let stats = fx.frame(&scene);

    assert_eq!(stats.objects_submitted, 0);
    assert_eq!(stats.lights_packed, 0);
    assert_eq!(stats.secondary_buffers, 1);
    assert!(stats.presented);
    assert_eq!(stats.output, Some(OutputTarget::Swapchain(0)));

    let submissions = fx.device.submissions();
    assert_eq!(submissions.len(), 2);
    assert!(submissions[0].waited);
    assert_eq!(submissions[0].draw_count(), 0);
    assert_eq!(submissions[0].clear_colours(), vec![OFFSCREEN_CLEAR_COLOUR]);
    assert_eq!(submissions[1].presented_image, Some(0));
    assert_eq!(submissions[1].draw_count(), 1);
    assert_eq!(submissions[1].clear_colours(), vec![INITIAL_CLEAR_COLOUR]);

    let bytes = fx.light_bytes();
    assert_eq!(LightUniformBlock::read_scalar(&bytes, LightUniformIndex::LightCount), Some(0.0));
    assert_eq!(fx.renderer.frame_phase(), FramePhase::Idle);
    fx.teardown();
}

#[test]
fn test_three_meshes_one_light_without_shadows() {
    let mut fx = Fixture::new();
    let cube = Mesh::cube(&mut fx.device).unwrap();
    let mut scene = SceneSnapshot::new(camera());
    scene.add_light(Light::point(Vec3::new(0.0, 3.0, 0.0), Vec3::new(1.0, 1.0, 1.0), 2.0, 10.0));
    for x in [-2.0, 0.0, 2.0] {
        scene.add_mesh(&cube, translation(x));
    }

    let stats = fx.frame(&scene);
    assert_eq!(stats.objects_submitted, 3);
    assert_eq!(stats.lights_packed, 1);
    assert_eq!(stats.shadow_maps_packed, 0);
    assert_eq!(stats.secondary_buffers, 4);
    assert!(!stats.clamped());

    let offscreen = &fx.device.submissions()[0];
    assert_eq!(offscreen.secondary_count(), 3);
    assert_eq!(offscreen.draw_count(), 3);

    let bytes = fx.light_bytes();
    assert_eq!(LightUniformBlock::read_scalar(&bytes, LightUniformIndex::LightCount), Some(1.0));
    assert_eq!(LightUniformBlock::read_scalar(&bytes, LightUniformIndex::ShadowCount), Some(0.0));
    let shadow_section =
        &bytes[LightUniformIndex::ShadowTransforms.offset()..LightUniformIndex::LightCount.offset()];
    assert!(shadow_section.iter().all(|&b| b == 0));

    cube.destroy(&mut fx.device).unwrap();
    fx.teardown();
}

#[test]
fn test_dynamic_offsets_follow_alignment() {
    for alignment in [64u32, 256] {
        let mut fx = Fixture::with(HeadlessConfig::default().with_min_uniform_alignment(alignment), 8);
        let cube = Mesh::cube(&mut fx.device).unwrap();
        let mut scene = SceneSnapshot::new(camera());
        for i in 0..5 {
            scene.add_mesh(&cube, translation(i as f32 + 1.0));
        }
        fx.frame(&scene);

        let stride = fx.renderer.dynamic_alignment();
        assert_eq!(stride, dynamic_alignment(u64::from(alignment)));
        assert_eq!(stride % alignment as usize, 0);

        let offsets: Vec<u32> = fx.device.submissions()[0]
            .descriptor_binds()
            .iter()
            .map(|(_, offsets)| offsets[0])
            .collect();
        let expected: Vec<u32> = (0..5).map(|i| (i * stride) as u32).collect();
        assert_eq!(offsets, expected);

        let model = fx.device.buffer_contents(fx.renderer.model_buffer().buffer_id()).unwrap();
        for i in 0..5 {
            // Translation x is element 12 of the column-major matrix
            let start = i * stride + 48;
            let x: f32 = bytemuck::pod_read_unaligned(&model[start..start + 4]);
            assert_relative_eq!(x, i as f32 + 1.0);
        }

        cube.destroy(&mut fx.device).unwrap();
        fx.teardown();
    }
}

#[test]
fn test_packed_light_reads_back() {
    let mut fx = Fixture::new();
    let mut scene = SceneSnapshot::new(camera());
    scene.add_light(Light::directional(Vec3::new(0.0, -2.0, 0.0), Vec3::new(1.0, 0.5, 0.25), 3.0));
    fx.frame(&scene);

    let bytes = fx.light_bytes();
    let light = LightUniformBlock::read_light(&bytes, 0).unwrap();
    assert_relative_eq!(light.direction[1], -1.0);
    assert_relative_eq!(light.direction[0], 0.0);
    assert_eq!(light.colour, [1.0, 0.5, 0.25, 1.0]);
    assert_relative_eq!(light.intensity, 3.0);

    let block = LightUniformBlock::from_bytes(&bytes).unwrap();
    let eye = camera().position;
    assert_eq!(block.camera_position, [eye.x, eye.y, eye.z, 1.0]);
    fx.teardown();
}

#[test]
fn test_light_capacity_boundary() {
    let mut fx = Fixture::new();
    let light = Light::point(Vec3::zeros(), Vec3::new(1.0, 1.0, 1.0), 1.0, 5.0);

    let mut full = SceneSnapshot::new(camera());
    full.lights = vec![light; MAX_LIGHTS];
    let stats = fx.frame(&full);
    assert_eq!(stats.lights_packed, MAX_LIGHTS);
    assert!(stats.capacity_violations.is_empty());

    let mut over = SceneSnapshot::new(camera());
    over.lights = vec![light; MAX_LIGHTS + 1];
    let stats = fx.frame(&over);
    assert_eq!(stats.lights_packed, MAX_LIGHTS);
    assert_eq!(stats.lights_dropped, 1);
    assert_eq!(stats.capacity_violations.len(), 1);
    assert_eq!(stats.capacity_violations[0].what, CapacityKind::Lights);

    // The block after the light array is untouched by the overflow
    let bytes = fx.light_bytes();
    let eye = camera().position;
    let camera_x = LightUniformBlock::read_scalar(&bytes, LightUniformIndex::CameraPosition).unwrap();
    assert_relative_eq!(camera_x, eye.x);
    fx.teardown();
}

#[test]
fn test_object_capacity_clamps() {
    let mut fx = Fixture::with(HeadlessConfig::default(), 2);
    let cube = Mesh::cube(&mut fx.device).unwrap();
    let mut scene = SceneSnapshot::new(camera());
    for i in 0..3 {
        scene.add_mesh(&cube, translation(i as f32));
    }

    let stats = fx.frame(&scene);
    assert_eq!(stats.objects_submitted, 2);
    assert_eq!(stats.objects_dropped, 1);
    assert_eq!(stats.capacity_violations[0].what, CapacityKind::Objects);
    assert_eq!(stats.capacity_violations[0].requested, 3);
    assert_eq!(fx.device.submissions()[0].draw_count(), 2);

    cube.destroy(&mut fx.device).unwrap();
    fx.teardown();
}

#[test]
fn test_render_target_is_not_presented() {
    let mut fx = Fixture::new();
    let target = fx
        .device
        .create_texture(&TextureDesc::render_target("Picture in picture", WIDTH, HEIGHT, Format::Presentation), None)
        .unwrap();
    fx.renderer
        .set_render_target(&mut fx.device, &fx.manager, Some(target.reference()))
        .unwrap();
    assert_eq!(fx.renderer.framebuffers().len(), 1);

    let stats = fx.frame(&SceneSnapshot::new(camera()));
    assert!(!stats.presented);
    assert_eq!(stats.output, Some(OutputTarget::Texture(target.reference())));
    assert!(fx.device.presented_images().is_empty());

    let lighting = &fx.device.submissions()[1];
    assert!(lighting.waited);
    assert_eq!(lighting.presented_image, None);
    let fb = fx.device.framebuffer_info(lighting.framebuffers()[0]).unwrap();
    assert_eq!(fb.attachments[0], FramebufferAttachment::Texture(target.reference()));

    fx.renderer.set_render_target(&mut fx.device, &fx.manager, None).unwrap();
    assert_eq!(fx.renderer.framebuffers().len(), 3);
    fx.device.destroy_texture(target).unwrap();
    fx.teardown();
}

#[test]
fn test_mismatched_render_target_rejected() {
    let mut fx = Fixture::new();
    let small = fx
        .device
        .create_texture(&TextureDesc::render_target("small", 8, 8, Format::Presentation), None)
        .unwrap();
    let result = fx.renderer.set_render_target(&mut fx.device, &fx.manager, Some(small.reference()));
    assert!(matches!(result, Err(RenderError::InvalidConfig(_))));
    assert_eq!(fx.renderer.framebuffers().len(), 3);
    assert!(fx.renderer.render_target().is_none());

    fx.device.destroy_texture(small).unwrap();
    fx.teardown();
}

#[test]
fn test_gbuffer_texture_output_follows_resize() {
    let mut fx = Fixture::new();
    fx.renderer
        .set_render_to_gbuffer_texture(&mut fx.device, &fx.manager, true)
        .unwrap();
    assert_eq!(fx.renderer.render_target(), Some(fx.manager.gbuffer().offscreen0));

    fx.renderer.on_resize(&mut fx.device, &mut fx.manager, 32, 24).unwrap();
    let offscreen0 = fx.manager.gbuffer().offscreen0;
    assert_eq!((offscreen0.width(), offscreen0.height()), (32, 24));
    assert_eq!(fx.renderer.render_target(), Some(offscreen0));

    let stats = fx.frame(&SceneSnapshot::new(camera()));
    assert_eq!(stats.output, Some(OutputTarget::Texture(offscreen0)));

    fx.renderer
        .set_render_to_gbuffer_texture(&mut fx.device, &fx.manager, false)
        .unwrap();
    assert!(fx.renderer.render_target().is_none());
    assert!(!fx.renderer.renders_to_gbuffer_texture());
    fx.teardown();
}

#[test]
fn test_resize_twice_is_idempotent() {
    let mut fx = Fixture::new();
    let old_pipeline = fx.renderer.offscreen_pipeline().unwrap();

    fx.renderer.on_resize(&mut fx.device, &mut fx.manager, 80, 60).unwrap();
    let after_first = fx.device.live_objects();
    let first_dims: Vec<(u32, u32)> = fx
        .renderer
        .framebuffers()
        .iter()
        .map(|fb| {
            let info = fx.device.framebuffer_info(*fb).unwrap();
            (info.width, info.height)
        })
        .collect();

    fx.renderer.on_resize(&mut fx.device, &mut fx.manager, 80, 60).unwrap();
    assert_eq!(fx.device.live_objects(), after_first);
    for fb in fx.renderer.framebuffers() {
        let info = fx.device.framebuffer_info(*fb).unwrap();
        assert_eq!((info.width, info.height), (80, 60));
    }
    assert_eq!(first_dims, vec![(80, 60); 3]);

    assert!(fx.device.pipeline_info(old_pipeline).is_none());
    assert_eq!(fx.device.capabilities().presentation_extent, Extent2D::new(80, 60));
    assert_eq!(fx.renderer.clear_colour(), RESIZED_CLEAR_COLOUR);

    let stats = fx.frame(&SceneSnapshot::new(camera()));
    assert!(stats.presented);
    assert_eq!(fx.device.submissions()[1].clear_colours(), vec![RESIZED_CLEAR_COLOUR]);
    assert_eq!(fx.device.submissions()[1].viewports(), vec![Extent2D::new(80, 60)]);
    fx.teardown();
}

#[test]
fn test_material_sets_rebuilt_after_resize() {
    let mut fx = Fixture::new();
    let material = Arc::new(Material::new().with_name("Plain"));
    let cube = Mesh::cube(&mut fx.device).unwrap().with_material(material);
    let bare = Mesh::cube(&mut fx.device).unwrap();
    let mut scene = SceneSnapshot::new(camera());
    scene.add_mesh(&cube, translation(0.0));
    scene.add_mesh(&bare, translation(1.0));

    fx.frame(&scene);
    let binds: Vec<DescriptorSetId> = fx.device.submissions()[0]
        .descriptor_binds()
        .iter()
        .map(|(sets, _)| sets[1])
        .collect();
    assert_ne!(binds[0], binds[1]);

    fx.renderer.on_resize(&mut fx.device, &mut fx.manager, 96, 64).unwrap();
    fx.frame(&scene);
    let pipeline = fx.renderer.offscreen_pipeline().unwrap();
    for (sets, _) in fx.device.submissions()[0].descriptor_binds() {
        assert_eq!(fx.device.descriptor_set_owner(sets[1]).unwrap().0, pipeline);
    }

    cube.destroy(&mut fx.device).unwrap();
    bare.destroy(&mut fx.device).unwrap();
    fx.teardown();
}

#[test]
fn test_material_churn_releases_sets() {
    let mut fx = Fixture::with(HeadlessConfig::default(), 4);
    let mut scene_materials = Vec::new();
    for frame in 0..64 {
        let material = Arc::new(Material::new().with_name(format!("churn {frame}")));
        let cube = Mesh::cube(&mut fx.device).unwrap().with_material(material.clone());
        let mut scene = SceneSnapshot::new(camera());
        scene.add_mesh(&cube, translation(0.0));

        let stats = fx.frame(&scene);
        assert_eq!(stats.objects_submitted, 1, "frame {frame}");
        assert!(fx.renderer.cached_materials() <= 2, "frame {frame}");
        cube.destroy(&mut fx.device).unwrap();
        scene_materials.push(material.id());
    }

    // Only the last material and nothing older survives an empty frame after it
    let empty = SceneSnapshot::new(camera());
    fx.frame(&empty);
    assert_eq!(fx.renderer.cached_materials(), 1);
    fx.frame(&empty);
    assert_eq!(fx.renderer.cached_materials(), 0);
    assert!(scene_materials.len() > 2 * fx.renderer.max_objects());
    fx.teardown();
}

#[test]
fn test_dropped_meshes_build_no_material_sets() {
    let mut fx = Fixture::with(HeadlessConfig::default(), 2);
    let mut meshes = Vec::new();
    for i in 0..10 {
        let material = Arc::new(Material::new().with_name(format!("crowd {i}")));
        meshes.push(Mesh::cube(&mut fx.device).unwrap().with_material(material));
    }
    let mut scene = SceneSnapshot::new(camera());
    for (i, mesh) in meshes.iter().enumerate() {
        scene.add_mesh(mesh, translation(i as f32));
    }

    let stats = fx.frame(&scene);
    assert_eq!(stats.objects_submitted, 2);
    assert_eq!(stats.objects_dropped, 8);
    assert!(fx.renderer.cached_materials() <= 3);

    for mesh in meshes {
        mesh.destroy(&mut fx.device).unwrap();
    }
    fx.teardown();
}

#[test]
fn test_skybox_binding_appears_and_disappears() {
    let mut fx = Fixture::new();
    let scene = SceneSnapshot::new(camera());

    let sky = fx
        .device
        .create_texture(&TextureDesc::cube("sky", 4, Format::Rgba8Unorm), None)
        .unwrap();
    let sky_ref = sky.reference();
    fx.manager.set_skybox(&mut fx.device, Some(sky)).unwrap();
    fx.frame(&scene);
    assert_eq!(fx.renderer.cube_map(), Some(sky_ref));
    assert_eq!(image_at(&fx.lighting_bindings(), pipelines::lighting::CUBE_MAP), Some(sky_ref));

    fx.manager.set_skybox(&mut fx.device, None).unwrap();
    fx.frame(&scene);
    assert!(fx.renderer.cube_map().is_none());
    assert_eq!(
        image_at(&fx.lighting_bindings(), pipelines::lighting::CUBE_MAP),
        Some(fx.renderer.environment_fallback())
    );

    let sky = fx
        .device
        .create_texture(&TextureDesc::cube("sky again", 4, Format::Rgba8Unorm), None)
        .unwrap();
    fx.manager.set_skybox(&mut fx.device, Some(sky)).unwrap();
    fx.frame(&scene);
    fx.renderer.on_resize(&mut fx.device, &mut fx.manager, 32, 32).unwrap();
    assert!(fx.renderer.cube_map().is_none());
    fx.frame(&scene);
    assert!(fx.renderer.cube_map().is_some());
    fx.teardown();
}

#[test]
fn test_shadow_source_packed_and_bound() {
    let mut fx = Fixture::new();
    let cascades = vec![translation(1.0), translation(2.0)];
    let splits = vec![Vec4::new(5.0, 0.0, 0.0, 0.0), Vec4::new(20.0, 0.0, 0.0, 0.0)];
    let shadows = StaticShadowMaps::new(&mut fx.device, 32, cascades, splits).unwrap();
    fx.manager.set_shadow_maps(&mut fx.device, Some(shadows)).unwrap();
    let shadow_texture = fx.manager.shadow_source().unwrap().shadow_texture();

    let scene = SceneSnapshot::new(camera());
    let stats = fx.frame(&scene);
    assert_eq!(stats.shadow_maps_packed, 2);
    assert_eq!(
        image_at(&fx.lighting_bindings(), pipelines::lighting::SHADOW_MAP),
        Some(shadow_texture)
    );
    let block = LightUniformBlock::from_bytes(&fx.light_bytes()).unwrap();
    assert_eq!(block.shadow_transforms[1][3][0], 2.0);
    assert_eq!(block.split_depths[0][0], 5.0);
    assert_eq!(block.shadow_count, 2.0);

    fx.manager.set_shadow_maps(&mut fx.device, None).unwrap();
    let stats = fx.frame(&scene);
    assert_eq!(stats.shadow_maps_packed, 0);
    assert_eq!(
        image_at(&fx.lighting_bindings(), pipelines::lighting::SHADOW_MAP),
        Some(fx.renderer.shadow_fallback())
    );
    let block = LightUniformBlock::from_bytes(&fx.light_bytes()).unwrap();
    assert_eq!(block.shadow_transforms, [[[0.0; 4]; 4]; MAX_SHADOWMAPS]);
    fx.teardown();
}

#[test]
fn test_frame_steps_out_of_order_rejected() {
    let mut fx = Fixture::new();
    let cube = Mesh::cube(&mut fx.device).unwrap();
    let device = &mut fx.device;
    let renderer = &mut fx.renderer;

    let early = renderer.submit_mesh(device, &cube, &Mat4::identity(), None);
    assert!(matches!(early, Err(RenderError::Gfx(GfxError::InvalidState { .. }))));

    renderer.begin_offscreen(device).unwrap();
    assert!(renderer.begin_offscreen(device).is_err());
    assert_eq!(renderer.submit_mesh(device, &cube, &Mat4::identity(), None).unwrap(), Some(0));

    // Draws cannot be recorded before the model matrices are uploaded
    assert!(renderer.present_offscreen(device).is_err());
    assert!(renderer.light_pass(device).is_err());

    renderer.set_system_uniforms(device).unwrap();
    renderer.present_offscreen(device).unwrap();
    renderer.end_offscreen(device).unwrap();
    renderer.light_pass(device).unwrap();
    assert_eq!(renderer.frame_phase(), FramePhase::Idle);

    cube.destroy(&mut fx.device).unwrap();
    fx.teardown();
}

#[test]
fn test_same_mesh_submitted_many_times() {
    let mut fx = Fixture::new();
    let cube = Mesh::cube(&mut fx.device).unwrap();
    let mut scene = SceneSnapshot::new(camera());
    for i in 0..6 {
        scene.add_object(OpaqueObject {
            mesh: Some(&cube),
            world_transform: translation(i as f32),
            texture_matrix: Some(Mat4::new_scaling(2.0)),
        });
    }
    scene.add_object(OpaqueObject {
        mesh: None,
        world_transform: Mat4::identity(),
        texture_matrix: None,
    });

    let stats = fx.frame(&scene);
    assert_eq!(stats.objects_submitted, 6);
    assert_eq!(fx.renderer.queue().commands()[3].texture_matrix, Mat4::new_scaling(2.0));
    assert_eq!(fx.device.submissions()[0].secondary_count(), 6);

    cube.destroy(&mut fx.device).unwrap();
    fx.teardown();
}

#[test]
fn test_no_swapchain_needs_render_target() {
    let mut fx = Fixture::with(HeadlessConfig::default().with_swapchain_images(0), 4);
    assert!(fx.renderer.framebuffers().is_empty());

    let scene = SceneSnapshot::new(camera());
    let result = fx.renderer.render_scene(&mut fx.device, &fx.manager, &scene, &scene);
    assert!(matches!(result, Err(RenderError::NoPresentationTarget)));

    fx.renderer
        .set_render_to_gbuffer_texture(&mut fx.device, &fx.manager, true)
        .unwrap();
    let stats = fx.frame(&scene);
    assert!(!stats.presented);
    assert_eq!(stats.output, Some(OutputTarget::Texture(fx.manager.gbuffer().offscreen0)));
    fx.teardown();
}

#[test]
fn test_render_mode_reaches_light_block() {
    let mut fx = Fixture::new();
    fx.renderer.set_render_mode(3);
    fx.frame(&SceneSnapshot::new(camera()));
    let bytes = fx.light_bytes();
    assert_eq!(LightUniformBlock::read_scalar(&bytes, LightUniformIndex::RenderMode), Some(3.0));
    fx.teardown();
}

#[test]
fn test_preintegrated_fg_replaces_fallback() {
    let mut fx = Fixture::new();
    let fallback = image_at(&fx.lighting_bindings(), pipelines::lighting::PREINTEGRATED_FG).unwrap();
    assert_eq!((fallback.width(), fallback.height()), (1, 1));

    let table = fx
        .device
        .create_texture(&TextureDesc::sampled_2d("FG", 16, 16, Format::Rgba16Float), None)
        .unwrap();
    let table_ref = table.reference();
    fx.manager.set_preintegrated_fg(&mut fx.device, Some(table)).unwrap();
    fx.frame(&SceneSnapshot::new(camera()));
    assert_eq!(
        image_at(&fx.lighting_bindings(), pipelines::lighting::PREINTEGRATED_FG),
        Some(table_ref)
    );
    fx.teardown();
}
