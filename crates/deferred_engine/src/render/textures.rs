//! Procedural fallback textures

use crate::render::gfx::{Format, GfxResult, GraphicsDevice, OwnedTexture, TextureDesc};

/// Light cell of the default checkerboard
pub const CHECKER_LIGHT: [u8; 4] = [255, 255, 255, 255];
/// Dark cell of the default checkerboard
pub const CHECKER_DARK: [u8; 4] = [64, 64, 64, 255];

/// RGBA8 pixels of a `size` x `size` checkerboard with square cells of `checker_size` texels
pub fn checkerboard_pixels(size: u32, checker_size: u32, color1: [u8; 4], color2: [u8; 4]) -> Vec<u8> {
    let checker_size = checker_size.max(1);
    let mut pixels = vec![0u8; (size * size * 4) as usize];

    for y in 0..size {
        for x in 0..size {
            let checker_x = (x / checker_size) % 2;
            let checker_y = (y / checker_size) % 2;
            let color = if (checker_x + checker_y) % 2 == 0 { color1 } else { color2 };
            let idx = ((y * size + x) * 4) as usize;
            pixels[idx..idx + 4].copy_from_slice(&color);
        }
    }

    pixels
}

/// Upload a checkerboard with 2x2 cells, used when a mesh has no material
pub fn create_checkerboard(device: &mut dyn GraphicsDevice, size: u32) -> GfxResult<OwnedTexture> {
    let pixels = checkerboard_pixels(size, (size / 2).max(1), CHECKER_LIGHT, CHECKER_DARK);
    let desc = TextureDesc::sampled_2d("Default checkerboard", size, size, Format::Rgba8Unorm);
    device.create_texture(&desc, Some(&pixels))
}

/// Upload a 1x1 texture of one colour
pub fn create_solid(device: &mut dyn GraphicsDevice, label: &str, color: [u8; 4]) -> GfxResult<OwnedTexture> {
    let desc = TextureDesc::sampled_2d(label, 1, 1, Format::Rgba8Unorm);
    device.create_texture(&desc, Some(&color))
}

/// 1x1 stand-in for the preintegrated FG lookup table: scale 1, bias 0
pub fn create_fg_fallback(device: &mut dyn GraphicsDevice) -> GfxResult<OwnedTexture> {
    create_solid(device, "Preintegrated FG fallback", [255, 0, 0, 255])
}

/// Black 1x1 cube bound as the environment while no skybox exists
pub fn create_environment_fallback(device: &mut dyn GraphicsDevice) -> GfxResult<OwnedTexture> {
    let desc = TextureDesc::cube("Environment fallback", 1, Format::Rgba8Unorm);
    let pixels = [0u8, 0, 0, 255].repeat(desc.layer_count() as usize);
    device.create_texture(&desc, Some(&pixels))
}

/// Single-layer 1x1 depth array bound as the shadow cascades while no shadow source exists
///
/// The lighting shader never samples it: the packed shadow count is zero
/// whenever it is bound.
pub fn create_shadow_fallback(device: &mut dyn GraphicsDevice) -> GfxResult<OwnedTexture> {
    device.create_texture(&TextureDesc::depth_array("Shadow fallback", 1, 1), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkerboard_cells_alternate() {
        let pixels = checkerboard_pixels(4, 2, CHECKER_LIGHT, CHECKER_DARK);
        assert_eq!(pixels.len(), 4 * 4 * 4);

        let texel = |x: usize, y: usize| &pixels[(y * 4 + x) * 4..(y * 4 + x) * 4 + 4];
        assert_eq!(texel(0, 0), CHECKER_LIGHT);
        assert_eq!(texel(1, 1), CHECKER_LIGHT);
        assert_eq!(texel(2, 0), CHECKER_DARK);
        assert_eq!(texel(0, 2), CHECKER_DARK);
        assert_eq!(texel(3, 3), CHECKER_LIGHT);
    }

    #[test]
    fn test_lighting_fallbacks_match_bindings() {
        use crate::core::HeadlessConfig;
        use crate::render::backends::headless::HeadlessDevice;
        use crate::render::gfx::{Extent2D, TextureDimension};

        let mut device = HeadlessDevice::new(HeadlessConfig::default(), Extent2D::new(4, 4));
        let environment = create_environment_fallback(&mut device).unwrap();
        let desc = device.texture_info(environment.id()).unwrap();
        assert_eq!(desc.dimension, TextureDimension::Cube);
        assert_eq!((desc.width, desc.height), (1, 1));

        let shadow = create_shadow_fallback(&mut device).unwrap();
        let desc = device.texture_info(shadow.id()).unwrap();
        assert_eq!(desc.dimension, TextureDimension::D2Array { layers: 1 });
        assert!(shadow.reference().format().is_depth());

        device.destroy_texture(environment).unwrap();
        device.destroy_texture(shadow).unwrap();
        assert_eq!(device.live_objects().textures, 0);
    }

    #[test]
    fn test_zero_checker_size_does_not_divide_by_zero() {
        let pixels = checkerboard_pixels(2, 0, CHECKER_LIGHT, CHECKER_DARK);
        assert_eq!(&pixels[0..4], CHECKER_LIGHT);
        assert_eq!(&pixels[4..8], CHECKER_DARK);
    }
}
