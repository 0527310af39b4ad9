//! Common interface of the 3D renderers
//!
//! The engine owns one boxed renderer and drives it through this trait, so
//! switching between the deferred and forward paths is a construction-time
//! choice.

use crate::core::RendererConfig;
use crate::render::deferred::DeferredRenderer;
use crate::render::error::{RenderError, RenderResult};
use crate::render::forward::ForwardRenderer;
use crate::render::gfx::{GraphicsDevice, TextureRef};
use crate::render::manager::RenderManager;
use crate::render::scene::{RenderList, SceneView};
use crate::render::shader::ShaderLibrary;
use crate::render::stats::FrameStats;

/// Which renderer [`create_renderer`] builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RendererKind {
    /// GBuffer plus lighting composite
    #[default]
    Deferred,
    /// Single pass with per-draw lighting
    Forward,
}

/// A renderer the engine can drive frame by frame
pub trait Renderer3D {
    /// Render and present (or write to the render target) one frame
    fn render_scene(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &dyn RenderManager,
        render_list: &dyn RenderList,
        scene: &dyn SceneView,
    ) -> RenderResult<FrameStats>;

    /// Rebuild every size-dependent object
    fn on_resize(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &mut dyn RenderManager,
        width: u32,
        height: u32,
    ) -> RenderResult<()>;

    /// Redirect output to a texture, or back to the swapchain with `None`
    fn set_render_target(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &dyn RenderManager,
        target: Option<TextureRef>,
    ) -> RenderResult<()>;

    /// Redirect output to the GBuffer's `Offscreen0` texture
    fn set_render_to_gbuffer_texture(
        &mut self,
        device: &mut dyn GraphicsDevice,
        manager: &dyn RenderManager,
        enabled: bool,
    ) -> RenderResult<()>;

    /// Release every object the renderer owns
    fn destroy(self: Box<Self>, device: &mut dyn GraphicsDevice) -> RenderResult<()>;
}

/// Build the renderer of the requested kind
pub fn create_renderer(
    kind: RendererKind,
    device: &mut dyn GraphicsDevice,
    manager: &dyn RenderManager,
    shaders: &dyn ShaderLibrary,
    config: &RendererConfig,
) -> RenderResult<Box<dyn Renderer3D>> {
    config.validate().map_err(RenderError::InvalidConfig)?;
    let renderer: Box<dyn Renderer3D> = match kind {
        RendererKind::Deferred => Box::new(DeferredRenderer::new(device, manager, shaders, config)?),
        RendererKind::Forward => Box::new(ForwardRenderer::new(device, manager, shaders, config)?),
    };
    log::info!("Created {kind:?} renderer");
    Ok(renderer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HeadlessConfig;
    use crate::foundation::math::Vec3;
    use crate::render::backends::headless::HeadlessDevice;
    use crate::render::gfx::Extent2D;
    use crate::render::manager::SceneRenderManager;
    use crate::render::scene::{CameraData, SceneSnapshot};
    use crate::render::shader::InMemoryShaderLibrary;

    #[test]
    fn test_both_renderers_behind_one_interface() {
        let shaders = InMemoryShaderLibrary::new()
            .with_placeholder("deferred_geometry")
            .with_placeholder("deferred_lighting")
            .with_placeholder("forward");
        let config = RendererConfig::default().with_max_objects(4);
        let scene = SceneSnapshot::new(CameraData::look_at(
            Vec3::new(0.0, 0.0, 5.0),
            Vec3::zeros(),
            1.0,
            1.0,
            0.1,
            50.0,
        ));

        for kind in [RendererKind::Deferred, RendererKind::Forward] {
            let mut device = HeadlessDevice::new(HeadlessConfig::default(), Extent2D::new(32, 32));
            let mut manager = SceneRenderManager::new(&mut device, 32, 32).unwrap();
            let mut renderer = create_renderer(kind, &mut device, &manager, &shaders, &config).unwrap();

            let stats = renderer.render_scene(&mut device, &manager, &scene, &scene).unwrap();
            assert!(stats.presented, "{kind:?}");
            renderer.on_resize(&mut device, &mut manager, 16, 16).unwrap();
            let stats = renderer.render_scene(&mut device, &manager, &scene, &scene).unwrap();
            assert!(stats.presented, "{kind:?}");

            renderer.destroy(&mut device).unwrap();
            manager.destroy(&mut device).unwrap();
            assert_eq!(device.live_objects().total(), 0, "{kind:?}");
        }
    }

    #[test]
    fn test_invalid_config_rejected_before_any_allocation() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default(), Extent2D::new(8, 8));
        let manager = SceneRenderManager::new(&mut device, 8, 8).unwrap();
        let before = device.live_objects();
        let config = RendererConfig::default().with_max_objects(0);
        let result = create_renderer(
            RendererKind::Deferred,
            &mut device,
            &manager,
            &InMemoryShaderLibrary::new(),
            &config,
        );
        assert!(matches!(result, Err(RenderError::InvalidConfig(_))));
        assert_eq!(device.live_objects(), before);
        manager.destroy(&mut device).unwrap();
    }
}
