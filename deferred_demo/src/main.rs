//! Deferred rendering demo
//!
//! Builds a small scene of cubes under a few lights, renders it through the
//! chosen renderer, resizes halfway, redirects one frame into the GBuffer's
//! offscreen texture and tears everything down.
//!
//! Usage: `deferred_demo [config.toml|config.ron] [--forward] [--frames N]`, see `--help`

use std::sync::Arc;

use clap::{Arg, ArgAction, Command};
use deferred_engine::config::{Config, ConfigError};
use deferred_engine::foundation::logging;
use deferred_engine::foundation::math::Mat4Ext;
use deferred_engine::prelude::*;
use deferred_engine::render::manager::StaticShadowMaps;
use deferred_engine::render::material::MaterialProperties;
use deferred_engine::render::textures;

const CUBE_GRID: i32 = 3;
const SHADOW_MAP_SIZE: u32 = 1024;
const DEFAULT_FRAMES: &str = "6";

#[derive(thiserror::Error, Debug)]
enum DemoError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("render: {0}")]
    Render(#[from] RenderError),

    #[error("graphics: {0}")]
    Gfx(#[from] deferred_engine::render::GfxError),
}

struct DemoArgs {
    config_path: Option<String>,
    kind: RendererKind,
    frames: u32,
}

impl DemoArgs {
    fn parse() -> Self {
        let matches = Command::new("deferred_demo")
            .about("Renders a scripted scene of lit cubes through the deferred or forward renderer")
            .arg(
                Arg::new("config")
                    .value_name("FILE")
                    .help("Renderer config, .toml or .ron; a headless default is used without one"),
            )
            .arg(
                Arg::new("forward")
                    .long("forward")
                    .help("Use the forward renderer instead of the deferred one")
                    .action(ArgAction::SetTrue),
            )
            .arg(
                Arg::new("frames")
                    .short('n')
                    .long("frames")
                    .value_name("N")
                    .help("Frames to render before tearing down")
                    .value_parser(clap::value_parser!(u32).range(1..))
                    .default_value(DEFAULT_FRAMES),
            )
            .get_matches();

        Self {
            config_path: matches.get_one::<String>("config").cloned(),
            kind: if matches.get_flag("forward") {
                RendererKind::Forward
            } else {
                RendererKind::Deferred
            },
            frames: matches.get_one::<u32>("frames").copied().unwrap_or(6),
        }
    }
}

fn load_config(path: Option<&str>) -> Result<RendererConfig, DemoError> {
    let config = match path {
        Some(path) => {
            log::info!("Loading renderer config from {path}");
            RendererConfig::load_from_file(path)?
        }
        None => RendererConfig::new("Deferred Demo")
            .with_backend(GraphicsApi::Headless)
            .with_size(800, 600)
            .with_max_objects(64)
            .with_shaders(ShaderConfig::with_path_resolution()),
    };
    config.validate().map_err(ConfigError::Invalid)?;
    Ok(config)
}

fn shader_library(config: &RendererConfig) -> Box<dyn ShaderLibrary> {
    match config.backend {
        // Headless only checks SPIR-V headers, so compiled shaders are optional
        GraphicsApi::Headless => Box::new(
            InMemoryShaderLibrary::new()
                .with_placeholder(&config.shaders.geometry_pass)
                .with_placeholder(&config.shaders.lighting_pass)
                .with_placeholder(&config.shaders.forward_pass),
        ),
        GraphicsApi::Vulkan => Box::new(DirectoryShaderLibrary::new(&config.shaders.directory)),
    }
}

fn build_lights() -> Vec<Light> {
    vec![
        Light::directional(Vec3::new(-0.4, -1.0, -0.3), Vec3::new(1.0, 0.95, 0.85), 1.2),
        Light::point(Vec3::new(3.0, 2.0, 3.0), Vec3::new(0.2, 0.4, 1.0), 4.0, 8.0),
        Light::spot(
            Vec3::new(0.0, 6.0, 0.0),
            Vec3::new(0.0, -1.0, 0.0),
            Vec3::new(1.0, 0.3, 0.2),
            6.0,
            25.0,
        ),
    ]
}

fn cube_transforms(time: f32) -> Vec<Mat4> {
    let mut transforms = Vec::new();
    for x in -CUBE_GRID / 2..=CUBE_GRID / 2 {
        for z in -CUBE_GRID / 2..=CUBE_GRID / 2 {
            let offset = Vec3::new(x as f32 * 3.0, 0.0, z as f32 * 3.0);
            let spin = Mat4::new_rotation(Vec3::new(0.0, time + (x + z) as f32 * 0.3, 0.0));
            transforms.push(Mat4::new_translation(&offset) * spin * Mat4::new_scaling(0.75));
        }
    }
    transforms
}

fn shadow_maps(device: &mut dyn GraphicsDevice) -> Result<StaticShadowMaps, DemoError> {
    let view = Mat4::look_at(Vec3::new(4.0, 10.0, 3.0), Vec3::zeros(), Vec3::y());
    let near = Mat4::new_orthographic(-6.0, 6.0, -6.0, 6.0, 0.1, 30.0) * view;
    let far = Mat4::new_orthographic(-15.0, 15.0, -15.0, 15.0, 0.1, 30.0) * view;
    let splits = vec![Vec4::new(8.0, 0.0, 0.0, 0.0), Vec4::new(40.0, 0.0, 0.0, 0.0)];
    Ok(StaticShadowMaps::new(device, SHADOW_MAP_SIZE, vec![near, far], splits)?)
}

fn log_frame(frame: u32, stats: &FrameStats) {
    log::info!(
        "Frame {frame}: {} objects ({} dropped), {} lights, {} shadow maps, {} secondaries, output {:?}",
        stats.objects_submitted,
        stats.objects_dropped,
        stats.lights_packed,
        stats.shadow_maps_packed,
        stats.secondary_buffers,
        stats.output,
    );
    for violation in &stats.capacity_violations {
        log::warn!("Frame {frame}: {violation}");
    }
}

fn run(args: &DemoArgs) -> Result<(), DemoError> {
    let config = load_config(args.config_path.as_deref())?;
    log::info!(
        "Starting {:?} renderer on {} at {}x{}",
        args.kind,
        config.backend,
        config.width,
        config.height
    );

    let mut device = create_device(&config)?;
    let mut manager = SceneRenderManager::new(device.as_mut(), config.width, config.height)?;
    let fg_table = textures::create_fg_fallback(device.as_mut())?;
    manager.set_preintegrated_fg(device.as_mut(), Some(fg_table))?;
    let shadows = shadow_maps(device.as_mut())?;
    manager.set_shadow_maps(device.as_mut(), Some(shadows))?;

    let shaders = shader_library(&config);
    let mut renderer = create_renderer(args.kind, device.as_mut(), &manager, shaders.as_ref(), &config)?;

    let checker = textures::create_checkerboard(device.as_mut(), 64)?;
    let material = Arc::new(
        Material::new()
            .with_name("checker")
            .with_textures(deferred_engine::render::material::MaterialTextures {
                albedo: Some(checker.reference()),
                ..Default::default()
            })
            .with_properties(MaterialProperties {
                albedo_colour: [0.9, 0.8, 0.7, 1.0],
                ..MaterialProperties::default()
            }),
    );
    let cube = Mesh::cube(device.as_mut())?.with_material(material);

    let mut width = config.width;
    let mut height = config.height;
    for frame in 0..args.frames {
        if frame == args.frames / 2 {
            width /= 2;
            height /= 2;
            log::info!("Resizing to {width}x{height}");
            renderer.on_resize(device.as_mut(), &mut manager, width, height)?;
        }

        let time = frame as f32 * 0.1;
        let aspect = width as f32 / height.max(1) as f32;
        let mut scene = SceneSnapshot::new(CameraData::look_at(
            Vec3::new(6.0 * time.cos(), 5.0, 6.0 * time.sin() + 4.0),
            Vec3::zeros(),
            std::f32::consts::FRAC_PI_4,
            aspect,
            0.1,
            100.0,
        ));
        for light in build_lights() {
            scene.add_light(light);
        }
        for transform in cube_transforms(time) {
            scene.add_mesh(&cube, transform);
        }

        let stats = renderer.render_scene(device.as_mut(), &manager, &scene, &scene)?;
        log_frame(frame, &stats);
    }

    // One frame into the GBuffer offscreen texture, then back to the swapchain
    renderer.set_render_to_gbuffer_texture(device.as_mut(), &manager, true)?;
    let scene = SceneSnapshot::new(CameraData::default());
    let stats = renderer.render_scene(device.as_mut(), &manager, &scene, &scene)?;
    log_frame(args.frames, &stats);
    renderer.set_render_to_gbuffer_texture(device.as_mut(), &manager, false)?;

    renderer.destroy(device.as_mut())?;
    cube.destroy(device.as_mut())?;
    device.destroy_texture(checker)?;
    manager.destroy(device.as_mut())?;
    log::info!("Demo finished cleanly");
    Ok(())
}

fn main() {
    logging::init_with_level("info");

    let result = run(&DemoArgs::parse());
    if let Err(e) = result {
        log::error!("Demo failed: {e}");
        std::process::exit(1);
    }
}
