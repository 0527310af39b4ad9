//! System uniform layouts and light packing
//!
//! Two blocks are written once per frame:
//!
//! - the vertex system block, a small table of matrices addressed through
//!   [`VertexUniformSlot`] offsets, and
//! - the lighting block read by the composite pass, a fixed `#[repr(C)]`
//!   struct whose field offsets are asserted at compile time so the shader
//!   and the writer agree byte for byte.

use std::mem::{offset_of, size_of};

use bytemuck::{Pod, Zeroable};

use crate::foundation::math::{mat4_to_cols, normalize_or_zero, Mat4, MAT4_SIZE};
use crate::render::error::{CapacityError, CapacityKind};
use crate::render::manager::ShadowSource;
use crate::render::scene::{CameraData, Light};

/// Lights the lighting block can hold
pub const MAX_LIGHTS: usize = 32;

/// Shadow cascades the lighting block can hold
pub const MAX_SHADOWMAPS: usize = 16;

/// Slots of the vertex system uniform block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexUniformSlot {
    /// Projection matrix, or projection times view when the block has no view slot
    ProjectionMatrix,
    /// View matrix
    ViewMatrix,
    /// Model matrix
    ModelMatrix,
    /// Texture matrix
    TextureMatrix,
}

/// CPU staging copy of a vertex system block with its offset table
#[derive(Debug, Clone, PartialEq)]
pub struct SystemUniforms {
    offsets: Vec<(VertexUniformSlot, usize)>,
    bytes: Vec<u8>,
}

impl SystemUniforms {
    /// Block holding one matrix per slot, packed in the given order
    pub fn new(slots: &[VertexUniformSlot]) -> Self {
        let offsets = slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (*slot, i * MAT4_SIZE))
            .collect();
        Self {
            offsets,
            bytes: vec![0; slots.len() * MAT4_SIZE],
        }
    }

    /// Layout of the deferred geometry pass: projection times view only
    pub fn deferred() -> Self {
        Self::new(&[VertexUniformSlot::ProjectionMatrix])
    }

    /// Byte offset of a slot, if the block has it
    pub fn offset(&self, slot: VertexUniformSlot) -> Option<usize> {
        self.offsets.iter().find(|(s, _)| *s == slot).map(|(_, offset)| *offset)
    }

    /// Write a matrix into a slot. Returns false when the block has no such slot.
    pub fn write_matrix(&mut self, slot: VertexUniformSlot, matrix: &Mat4) -> bool {
        let Some(offset) = self.offset(slot) else {
            return false;
        };
        let cols = mat4_to_cols(matrix);
        self.bytes[offset..offset + MAT4_SIZE].copy_from_slice(bytemuck::bytes_of(&cols));
        true
    }

    /// Read a matrix back from a slot
    pub fn read_matrix(&self, slot: VertexUniformSlot) -> Option<Mat4> {
        let offset = self.offset(slot)?;
        let cols: [[f32; 4]; 4] = bytemuck::pod_read_unaligned(&self.bytes[offset..offset + MAT4_SIZE]);
        Some(cols.into())
    }

    /// Block contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Block size in bytes
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// One light as the lighting shader reads it
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuLight {
    /// Linear RGB colour
    pub colour: [f32; 4],
    /// World position, w = 1
    pub position: [f32; 4],
    /// Normalised direction, w = 0
    pub direction: [f32; 4],
    /// Intensity multiplier
    pub intensity: f32,
    /// Attenuation radius
    pub radius: f32,
    /// Light type code
    pub kind: f32,
    /// Spot cone angle
    pub angle: f32,
}

impl GpuLight {
    /// Pack a scene light, normalising its direction
    pub fn from_light(light: &Light) -> Self {
        let direction = normalize_or_zero(&light.direction);
        Self {
            colour: light.colour.into(),
            position: [light.position.x, light.position.y, light.position.z, 1.0],
            direction: [direction.x, direction.y, direction.z, 0.0],
            intensity: light.intensity,
            radius: light.radius,
            kind: light.kind.code(),
            angle: light.angle,
        }
    }
}

/// The lighting pass uniform block
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightUniformBlock {
    /// Active lights, zero past `light_count`
    pub lights: [GpuLight; MAX_LIGHTS],
    /// Camera world position, w = 1
    pub camera_position: [f32; 4],
    /// Camera view matrix
    pub view: [[f32; 4]; 4],
    /// Shadow cascade projection-view matrices
    pub shadow_transforms: [[[f32; 4]; 4]; MAX_SHADOWMAPS],
    /// Shadow cascade split depths
    pub split_depths: [[f32; 4]; MAX_SHADOWMAPS],
    /// Number of valid lights
    pub light_count: f32,
    /// Number of valid shadow cascades
    pub shadow_count: f32,
    /// Debug view selector, 0 for the lit image
    pub render_mode: f32,
    /// Pads the block to 16 bytes
    pub _padding: f32,
}

/// Fields of the lighting block, in memory order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightUniformIndex {
    /// `lights`
    Lights,
    /// `camera_position`
    CameraPosition,
    /// `view`
    ViewMatrix,
    /// `shadow_transforms`
    ShadowTransforms,
    /// `split_depths`
    SplitDepths,
    /// `light_count`
    LightCount,
    /// `shadow_count`
    ShadowCount,
    /// `render_mode`
    RenderMode,
}

impl LightUniformIndex {
    /// Byte offset of the field
    pub const fn offset(self) -> usize {
        match self {
            Self::Lights => 0,
            Self::CameraPosition => 2048,
            Self::ViewMatrix => 2064,
            Self::ShadowTransforms => 2128,
            Self::SplitDepths => 3152,
            Self::LightCount => 3408,
            Self::ShadowCount => 3412,
            Self::RenderMode => 3416,
        }
    }
}

/// Size of the lighting block in bytes
pub const LIGHT_BLOCK_SIZE: usize = 3424;

const _: () = {
    assert!(size_of::<GpuLight>() == 64);
    assert!(offset_of!(LightUniformBlock, lights) == LightUniformIndex::Lights.offset());
    assert!(offset_of!(LightUniformBlock, camera_position) == LightUniformIndex::CameraPosition.offset());
    assert!(offset_of!(LightUniformBlock, view) == LightUniformIndex::ViewMatrix.offset());
    assert!(offset_of!(LightUniformBlock, shadow_transforms) == LightUniformIndex::ShadowTransforms.offset());
    assert!(offset_of!(LightUniformBlock, split_depths) == LightUniformIndex::SplitDepths.offset());
    assert!(offset_of!(LightUniformBlock, light_count) == LightUniformIndex::LightCount.offset());
    assert!(offset_of!(LightUniformBlock, shadow_count) == LightUniformIndex::ShadowCount.offset());
    assert!(offset_of!(LightUniformBlock, render_mode) == LightUniformIndex::RenderMode.offset());
    assert!(size_of::<LightUniformBlock>() == LIGHT_BLOCK_SIZE);
};

impl LightUniformBlock {
    /// Block contents as uploaded
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Decode a block from uploaded bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytemuck::try_pod_read_unaligned(bytes.get(..LIGHT_BLOCK_SIZE)?).ok()
    }

    /// Read light `index` out of uploaded bytes through the offset table
    pub fn read_light(bytes: &[u8], index: usize) -> Option<GpuLight> {
        if index >= MAX_LIGHTS {
            return None;
        }
        let start = LightUniformIndex::Lights.offset() + index * size_of::<GpuLight>();
        bytemuck::try_pod_read_unaligned(bytes.get(start..start + size_of::<GpuLight>())?).ok()
    }

    /// Read one float field out of uploaded bytes through the offset table
    pub fn read_scalar(bytes: &[u8], field: LightUniformIndex) -> Option<f32> {
        let start = field.offset();
        bytemuck::try_pod_read_unaligned(bytes.get(start..start + 4)?).ok()
    }
}

impl Default for LightUniformBlock {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// What one packing pass wrote
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LightPackReport {
    /// Lights written
    pub lights_packed: usize,
    /// Shadow cascades written
    pub shadow_maps_packed: usize,
    /// Capacity violations that were clamped
    pub violations: Vec<CapacityError>,
}

/// Serialises lights, camera and shadow data into a [`LightUniformBlock`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LightSetupPacker {
    render_mode: f32,
}

impl LightSetupPacker {
    /// Packer for the lit image
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a debug view
    pub fn with_render_mode(mut self, mode: u32) -> Self {
        self.render_mode = mode as f32;
        self
    }

    /// Current debug view
    pub fn render_mode(&self) -> u32 {
        self.render_mode as u32
    }

    /// Rewrite `block` for one frame
    ///
    /// The light array is cleared before packing so no light from an earlier
    /// frame survives, and the shadow section is cleared when `shadows` is
    /// `None`. Counts past [`MAX_LIGHTS`] or [`MAX_SHADOWMAPS`] are clamped and
    /// reported, as is a shadow count larger than the matrices or split
    /// depths the source actually provides.
    pub fn pack(
        &self,
        block: &mut LightUniformBlock,
        camera: &CameraData,
        lights: &[Light],
        shadows: Option<&dyn ShadowSource>,
    ) -> LightPackReport {
        let mut report = LightPackReport::default();

        if lights.len() > MAX_LIGHTS {
            let error = CapacityError {
                what: CapacityKind::Lights,
                limit: MAX_LIGHTS,
                requested: lights.len(),
            };
            log::warn!("Light setup clamped: {error}");
            report.violations.push(error);
        }

        block.lights = [GpuLight::zeroed(); MAX_LIGHTS];
        for (slot, light) in block.lights.iter_mut().zip(lights) {
            *slot = GpuLight::from_light(light);
            report.lights_packed += 1;
        }

        let p = camera.position;
        block.camera_position = [p.x, p.y, p.z, 1.0];
        block.view = mat4_to_cols(&camera.view);

        block.shadow_transforms = [[[0.0; 4]; 4]; MAX_SHADOWMAPS];
        block.split_depths = [[0.0; 4]; MAX_SHADOWMAPS];
        if let Some(source) = shadows {
            let requested = source.shadow_map_count();
            let provided = source.shadow_proj_view().len().min(source.split_depths().len());
            let limit = provided.min(MAX_SHADOWMAPS);
            if requested > limit {
                let error = CapacityError {
                    what: CapacityKind::ShadowMaps,
                    limit,
                    requested,
                };
                if requested > provided {
                    log::warn!("Shadow source provides data for {provided} cascade(s): {error}");
                } else {
                    log::warn!("Shadow setup clamped: {error}");
                }
                report.violations.push(error);
            }
            let count = requested.min(limit);
            for (slot, matrix) in block.shadow_transforms.iter_mut().zip(source.shadow_proj_view()).take(count) {
                *slot = mat4_to_cols(matrix);
            }
            for (slot, split) in block.split_depths.iter_mut().zip(source.split_depths()).take(count) {
                *slot = (*split).into();
            }
            report.shadow_maps_packed = count;
        }

        block.light_count = report.lights_packed as f32;
        block.shadow_count = report.shadow_maps_packed as f32;
        block.render_mode = self.render_mode;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::{Vec3, Vec4};
    use crate::render::gfx::TextureRef;
    use approx::assert_relative_eq;

    struct FixedShadows {
        count: usize,
        matrices: Vec<Mat4>,
        splits: Vec<Vec4>,
        texture: TextureRef,
    }

    impl ShadowSource for FixedShadows {
        fn shadow_proj_view(&self) -> &[Mat4] {
            &self.matrices
        }
        fn split_depths(&self) -> &[Vec4] {
            &self.splits
        }
        fn shadow_texture(&self) -> TextureRef {
            self.texture
        }
        fn shadow_map_count(&self) -> usize {
            self.count
        }
    }

    fn shadow_texture() -> TextureRef {
        use crate::core::HeadlessConfig;
        use crate::render::backends::headless::HeadlessDevice;
        use crate::render::gfx::{Extent2D, GraphicsDevice, TextureDesc};

        let mut device = HeadlessDevice::new(HeadlessConfig::default(), Extent2D::new(4, 4));
        device
            .create_texture(&TextureDesc::depth_array("shadow", 8, 2), None)
            .unwrap()
            .reference()
    }

    fn lights(n: usize) -> Vec<Light> {
        (0..n)
            .map(|i| Light::directional(Vec3::new(0.0, -2.0, 0.0), Vec3::new(1.0, 1.0, 1.0), i as f32))
            .collect()
    }

    #[test]
    fn test_system_uniform_slots() {
        let mut uniforms = SystemUniforms::deferred();
        assert_eq!(uniforms.size(), 64);
        assert_eq!(uniforms.offset(VertexUniformSlot::ProjectionMatrix), Some(0));
        assert!(!uniforms.write_matrix(VertexUniformSlot::ModelMatrix, &Mat4::identity()));

        let m = Mat4::new_translation(&Vec3::new(1.0, 2.0, 3.0));
        assert!(uniforms.write_matrix(VertexUniformSlot::ProjectionMatrix, &m));
        assert_eq!(uniforms.read_matrix(VertexUniformSlot::ProjectionMatrix), Some(m));
        // Column major: translation lives in the last 16 bytes
        let tail: [f32; 4] = bytemuck::pod_read_unaligned(&uniforms.as_bytes()[48..64]);
        assert_eq!(tail, [1.0, 2.0, 3.0, 1.0]);
    }

    #[test]
    fn test_light_round_trip_through_offsets() {
        let light = Light::spot(
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::new(0.0, 0.0, -5.0),
            Vec3::new(0.2, 0.4, 0.6),
            3.5,
            0.7,
        );
        let mut block = LightUniformBlock::default();
        let report = LightSetupPacker::new().pack(&mut block, &CameraData::default(), &[light], None);
        assert_eq!(report.lights_packed, 1);

        let bytes = block.as_bytes();
        let read = LightUniformBlock::read_light(bytes, 0).unwrap();
        assert_relative_eq!(read.direction[2], -1.0);
        assert_relative_eq!(Vec4::from(read.direction).norm(), 1.0);
        assert_eq!(read.colour, [0.2, 0.4, 0.6, 1.0]);
        assert_eq!(read.intensity, 3.5);
        assert_eq!(read.kind, 1.0);
        assert_eq!(LightUniformBlock::read_scalar(bytes, LightUniformIndex::LightCount), Some(1.0));
        assert_eq!(LightUniformBlock::from_bytes(bytes), Some(block));
    }

    #[test]
    fn test_exactly_max_lights_packs_without_violation() {
        let mut block = LightUniformBlock::default();
        let report = LightSetupPacker::new().pack(&mut block, &CameraData::default(), &lights(MAX_LIGHTS), None);
        assert_eq!(report.lights_packed, MAX_LIGHTS);
        assert!(report.violations.is_empty());
        assert_eq!(block.lights[MAX_LIGHTS - 1].intensity, (MAX_LIGHTS - 1) as f32);
    }

    #[test]
    fn test_one_light_over_capacity_is_clamped() {
        let mut block = LightUniformBlock::default();
        let report = LightSetupPacker::new().pack(&mut block, &CameraData::default(), &lights(MAX_LIGHTS + 1), None);

        assert_eq!(report.lights_packed, MAX_LIGHTS);
        assert_eq!(
            report.violations,
            vec![CapacityError { what: CapacityKind::Lights, limit: MAX_LIGHTS, requested: MAX_LIGHTS + 1 }]
        );
        assert_eq!(block.light_count, MAX_LIGHTS as f32);
        // The camera follows the light array and must not have been overwritten by light 33
        assert_eq!(block.camera_position, [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_stale_lights_cleared_between_frames() {
        let mut block = LightUniformBlock::default();
        let packer = LightSetupPacker::new();
        packer.pack(&mut block, &CameraData::default(), &lights(4), None);
        packer.pack(&mut block, &CameraData::default(), &[], None);

        assert_eq!(block.light_count, 0.0);
        assert!(block.lights.iter().all(|l| *l == GpuLight::zeroed()));
    }

    #[test]
    fn test_shadow_section_zeroed_without_source() {
        let texture = shadow_texture();
        let shadows = FixedShadows {
            count: 2,
            matrices: vec![Mat4::identity() * 2.0; 2],
            splits: vec![Vec4::new(1.0, 2.0, 3.0, 4.0); 2],
            texture,
        };
        let mut block = LightUniformBlock::default();
        let packer = LightSetupPacker::new();

        let report = packer.pack(&mut block, &CameraData::default(), &[], Some(&shadows));
        assert_eq!(report.shadow_maps_packed, 2);
        assert_eq!(block.shadow_count, 2.0);
        assert_eq!(block.split_depths[1], [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(block.split_depths[2], [0.0; 4]);

        packer.pack(&mut block, &CameraData::default(), &[], None);
        assert_eq!(block.shadow_count, 0.0);
        let start = LightUniformIndex::ShadowTransforms.offset();
        let end = LightUniformIndex::LightCount.offset();
        assert!(block.as_bytes()[start..end].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_shadow_count_clamped() {
        let shadows = FixedShadows {
            count: MAX_SHADOWMAPS + 2,
            matrices: vec![Mat4::identity(); MAX_SHADOWMAPS + 2],
            splits: vec![Vec4::zeros(); MAX_SHADOWMAPS + 2],
            texture: shadow_texture(),
        };
        let mut block = LightUniformBlock::default();
        let report = LightSetupPacker::new()
            .with_render_mode(3)
            .pack(&mut block, &CameraData::default(), &[], Some(&shadows));

        assert_eq!(report.shadow_maps_packed, MAX_SHADOWMAPS);
        assert_eq!(report.violations[0].what, CapacityKind::ShadowMaps);
        assert_eq!(block.render_mode, 3.0);
    }

    #[test]
    fn test_shadow_count_limited_to_provided_data() {
        let shadows = FixedShadows {
            count: 4,
            matrices: vec![Mat4::new_translation(&Vec3::new(1.0, 0.0, 0.0)); 2],
            splits: Vec::new(),
            texture: shadow_texture(),
        };
        let mut block = LightUniformBlock::default();
        let packer = LightSetupPacker::new();

        let report = packer.pack(&mut block, &CameraData::default(), &[], Some(&shadows));
        assert_eq!(report.shadow_maps_packed, 0);
        assert_eq!(block.shadow_count, 0.0);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].what, CapacityKind::ShadowMaps);
        assert_eq!(report.violations[0].limit, 0);
        assert_eq!(report.violations[0].requested, 4);

        let shadows = FixedShadows {
            splits: vec![Vec4::new(5.0, 0.0, 0.0, 0.0); 3],
            ..shadows
        };
        let report = packer.pack(&mut block, &CameraData::default(), &[], Some(&shadows));
        assert_eq!(report.shadow_maps_packed, 2);
        assert_eq!(block.shadow_count, 2.0);
        assert_eq!(report.violations[0].limit, 2);
        assert_eq!(block.shadow_transforms[1][3][0], 1.0);
        assert_eq!(block.shadow_transforms[2], [[0.0; 4]; 4]);
        assert_eq!(block.split_depths[2], [0.0; 4]);
    }

    #[test]
    fn test_camera_written_every_frame() {
        let camera = CameraData::look_at(
            Vec3::new(0.0, 1.0, 5.0),
            Vec3::zeros(),
            std::f32::consts::FRAC_PI_4,
            1.0,
            0.1,
            100.0,
        );
        let mut block = LightUniformBlock::default();
        LightSetupPacker::new().pack(&mut block, &camera, &[], None);
        assert_eq!(block.camera_position, [0.0, 1.0, 5.0, 1.0]);
        assert_eq!(block.view, mat4_to_cols(&camera.view));
    }
}
