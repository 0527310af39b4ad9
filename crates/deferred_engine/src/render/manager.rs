//! Render manager: owner of the targets renderers draw into and sample from
//!
//! The GBuffer attachments, the shadow cascades, the skybox and the
//! preintegrated FG table all belong to a [`RenderManager`]. Renderers only
//! ever hold [`TextureRef`]s to them, so the manager must outlive every
//! renderer that references its targets.

use crate::foundation::math::{Mat4, Vec4};
use crate::render::gfx::{Format, GfxError, GfxResult, GraphicsDevice, OwnedTexture, TextureDesc, TextureRef};

/// Optional shadow renderer outputs
pub trait ShadowSource {
    /// Projection-view matrix of each cascade
    fn shadow_proj_view(&self) -> &[Mat4];
    /// Split depth of each cascade
    fn split_depths(&self) -> &[Vec4];
    /// Layered depth texture holding every cascade
    fn shadow_texture(&self) -> TextureRef;
    /// Number of cascades in use
    fn shadow_map_count(&self) -> usize;
}

/// References to the GBuffer attachments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GBufferTargets {
    /// Albedo
    pub colour: TextureRef,
    /// World position
    pub position: TextureRef,
    /// Normals
    pub normal: TextureRef,
    /// Metallic, roughness, ambient occlusion
    pub pbr: TextureRef,
    /// Depth
    pub depth: TextureRef,
    /// Composite target used when rendering into the GBuffer texture
    pub offscreen0: TextureRef,
}

impl GBufferTargets {
    /// Width shared by every attachment
    pub fn width(&self) -> u32 {
        self.colour.width()
    }

    /// Height shared by every attachment
    pub fn height(&self) -> u32 {
        self.colour.height()
    }
}

/// Accessors the renderers need from the engine's render manager
pub trait RenderManager {
    /// Current GBuffer attachments
    fn gbuffer(&self) -> GBufferTargets;
    /// Shadow renderer outputs, when shadows are enabled
    fn shadow_source(&self) -> Option<&dyn ShadowSource>;
    /// Environment cube map, when a skybox is set
    fn skybox(&self) -> Option<TextureRef>;
    /// Preintegrated FG lookup table, when one has been generated
    fn preintegrated_fg(&self) -> Option<TextureRef>;
    /// Recreate size-dependent targets. Callers release every framebuffer
    /// built on the old targets first.
    fn resize_targets(&mut self, device: &mut dyn GraphicsDevice, width: u32, height: u32) -> GfxResult<()>;
}

/// GBuffer attachment formats in framebuffer order: colour, position, normal, PBR
pub const GBUFFER_COLOUR_FORMATS: [Format; 4] = [
    Format::Rgba8Unorm,
    Format::Rgba32Float,
    Format::Rgba16Float,
    Format::Rgba16Float,
];

/// The GBuffer attachments plus the `Offscreen0` composite texture
#[derive(Debug)]
pub struct GBuffer {
    colour: OwnedTexture,
    position: OwnedTexture,
    normal: OwnedTexture,
    pbr: OwnedTexture,
    depth: OwnedTexture,
    offscreen0: OwnedTexture,
}

impl GBuffer {
    /// Allocate every attachment at `width` x `height`
    pub fn new(device: &mut dyn GraphicsDevice, width: u32, height: u32) -> GfxResult<Self> {
        let target = |label: &str, format: Format| TextureDesc::render_target(label, width, height, format);
        let gbuffer = Self {
            colour: device.create_texture(&target("GBuffer colour", GBUFFER_COLOUR_FORMATS[0]), None)?,
            position: device.create_texture(&target("GBuffer position", GBUFFER_COLOUR_FORMATS[1]), None)?,
            normal: device.create_texture(&target("GBuffer normal", GBUFFER_COLOUR_FORMATS[2]), None)?,
            pbr: device.create_texture(&target("GBuffer pbr", GBUFFER_COLOUR_FORMATS[3]), None)?,
            depth: device.create_texture(&target("GBuffer depth", Format::Depth32Float), None)?,
            offscreen0: device.create_texture(&target("Offscreen0", Format::Presentation), None)?,
        };
        log::debug!("GBuffer created at {width}x{height}");
        Ok(gbuffer)
    }

    /// References to every attachment
    pub fn targets(&self) -> GBufferTargets {
        GBufferTargets {
            colour: self.colour.reference(),
            position: self.position.reference(),
            normal: self.normal.reference(),
            pbr: self.pbr.reference(),
            depth: self.depth.reference(),
            offscreen0: self.offscreen0.reference(),
        }
    }

    /// Recreate the attachments at a new size; same size keeps them
    pub fn resize(&mut self, device: &mut dyn GraphicsDevice, width: u32, height: u32) -> GfxResult<()> {
        if self.colour.width() == width && self.colour.height() == height {
            return Ok(());
        }
        let fresh = Self::new(device, width, height)?;
        let old = std::mem::replace(self, fresh);
        old.destroy(device)
    }

    /// Release every attachment
    pub fn destroy(self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        for texture in [self.colour, self.position, self.normal, self.pbr, self.depth, self.offscreen0] {
            device.destroy_texture(texture)?;
        }
        Ok(())
    }
}

/// Fixed shadow cascades uploaded once, for scenes without a live shadow pass
#[derive(Debug)]
pub struct StaticShadowMaps {
    texture: OwnedTexture,
    proj_views: Vec<Mat4>,
    split_depths: Vec<Vec4>,
}

impl StaticShadowMaps {
    /// Allocate a `size` x `size` depth array with one layer per cascade
    ///
    /// Every cascade needs both a transform and a split depth.
    pub fn new(device: &mut dyn GraphicsDevice, size: u32, proj_views: Vec<Mat4>, split_depths: Vec<Vec4>) -> GfxResult<Self> {
        if proj_views.len() != split_depths.len() {
            return Err(GfxError::InvalidDescription(format!(
                "{} shadow transforms but {} split depths",
                proj_views.len(),
                split_depths.len()
            )));
        }
        let layers = proj_views.len().max(1) as u32;
        let texture = device.create_texture(&TextureDesc::depth_array("Shadow cascades", size, layers), None)?;
        Ok(Self {
            texture,
            proj_views,
            split_depths,
        })
    }

    /// Release the depth array
    pub fn destroy(self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        device.destroy_texture(self.texture)
    }
}

impl ShadowSource for StaticShadowMaps {
    fn shadow_proj_view(&self) -> &[Mat4] {
        &self.proj_views
    }

    fn split_depths(&self) -> &[Vec4] {
        &self.split_depths
    }

    fn shadow_texture(&self) -> TextureRef {
        self.texture.reference()
    }

    fn shadow_map_count(&self) -> usize {
        self.proj_views.len()
    }
}

/// Render manager owning a GBuffer and the optional shadow, skybox and FG inputs
#[derive(Debug)]
pub struct SceneRenderManager {
    gbuffer: GBuffer,
    shadows: Option<StaticShadowMaps>,
    skybox: Option<OwnedTexture>,
    preintegrated_fg: Option<OwnedTexture>,
}

impl SceneRenderManager {
    /// Manager with a GBuffer at `width` x `height` and nothing else
    pub fn new(device: &mut dyn GraphicsDevice, width: u32, height: u32) -> GfxResult<Self> {
        Ok(Self {
            gbuffer: GBuffer::new(device, width, height)?,
            shadows: None,
            skybox: None,
            preintegrated_fg: None,
        })
    }

    /// Replace the skybox, destroying the previous one
    ///
    /// Renderers notice the change at the start of their next frame.
    pub fn set_skybox(&mut self, device: &mut dyn GraphicsDevice, skybox: Option<OwnedTexture>) -> GfxResult<()> {
        if let Some(old) = std::mem::replace(&mut self.skybox, skybox) {
            device.destroy_texture(old)?;
        }
        Ok(())
    }

    /// Replace the shadow cascades, destroying the previous ones
    pub fn set_shadow_maps(&mut self, device: &mut dyn GraphicsDevice, shadows: Option<StaticShadowMaps>) -> GfxResult<()> {
        if let Some(old) = std::mem::replace(&mut self.shadows, shadows) {
            old.destroy(device)?;
        }
        Ok(())
    }

    /// Replace the preintegrated FG table, destroying the previous one
    pub fn set_preintegrated_fg(&mut self, device: &mut dyn GraphicsDevice, table: Option<OwnedTexture>) -> GfxResult<()> {
        if let Some(old) = std::mem::replace(&mut self.preintegrated_fg, table) {
            device.destroy_texture(old)?;
        }
        Ok(())
    }

    /// Release everything the manager owns
    pub fn destroy(self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        self.gbuffer.destroy(device)?;
        if let Some(shadows) = self.shadows {
            shadows.destroy(device)?;
        }
        for texture in [self.skybox, self.preintegrated_fg].into_iter().flatten() {
            device.destroy_texture(texture)?;
        }
        Ok(())
    }
}

impl RenderManager for SceneRenderManager {
    fn gbuffer(&self) -> GBufferTargets {
        self.gbuffer.targets()
    }

    fn shadow_source(&self) -> Option<&dyn ShadowSource> {
        self.shadows.as_ref().map(|s| s as &dyn ShadowSource)
    }

    fn skybox(&self) -> Option<TextureRef> {
        self.skybox.as_ref().map(OwnedTexture::reference)
    }

    fn preintegrated_fg(&self) -> Option<TextureRef> {
        self.preintegrated_fg.as_ref().map(OwnedTexture::reference)
    }

    fn resize_targets(&mut self, device: &mut dyn GraphicsDevice, width: u32, height: u32) -> GfxResult<()> {
        self.gbuffer.resize(device, width, height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HeadlessConfig;
    use crate::render::backends::headless::HeadlessDevice;
    use crate::render::gfx::Extent2D;

    fn device() -> HeadlessDevice {
        HeadlessDevice::new(HeadlessConfig::default(), Extent2D::new(16, 16))
    }

    #[test]
    fn test_gbuffer_resize_recreates_targets() {
        let mut device = device();
        let mut manager = SceneRenderManager::new(&mut device, 16, 16).unwrap();
        let before = manager.gbuffer();
        assert_eq!(device.live_objects().textures, 6);

        manager.resize_targets(&mut device, 16, 16).unwrap();
        assert_eq!(manager.gbuffer(), before);

        manager.resize_targets(&mut device, 32, 8).unwrap();
        let after = manager.gbuffer();
        assert_ne!(after.colour.id(), before.colour.id());
        assert_eq!((after.width(), after.height()), (32, 8));
        assert_eq!(device.live_objects().textures, 6);

        manager.destroy(&mut device).unwrap();
        assert_eq!(device.live_objects().textures, 0);
    }

    #[test]
    fn test_optional_inputs() {
        let mut device = device();
        let mut manager = SceneRenderManager::new(&mut device, 16, 16).unwrap();
        assert!(manager.shadow_source().is_none());
        assert!(manager.skybox().is_none());

        let shadows = StaticShadowMaps::new(&mut device, 64, vec![Mat4::identity(); 2], vec![Vec4::zeros(); 2]).unwrap();
        manager.set_shadow_maps(&mut device, Some(shadows)).unwrap();
        let source = manager.shadow_source().unwrap();
        assert_eq!(source.shadow_map_count(), 2);
        assert_eq!(source.shadow_texture().width(), 64);

        let mismatched = StaticShadowMaps::new(&mut device, 64, vec![Mat4::identity(); 4], vec![Vec4::zeros(); 2]);
        assert!(matches!(mismatched, Err(GfxError::InvalidDescription(_))));
        assert_eq!(device.live_objects().textures, 7);

        let sky = device
            .create_texture(&TextureDesc::cube("sky", 4, Format::Rgba8Unorm), None)
            .unwrap();
        manager.set_skybox(&mut device, Some(sky)).unwrap();
        assert!(manager.skybox().is_some());
        manager.set_skybox(&mut device, None).unwrap();
        assert!(manager.skybox().is_none());

        manager.destroy(&mut device).unwrap();
        assert_eq!(device.live_objects().textures, 0);
    }
}
