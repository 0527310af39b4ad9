//! Per-object model matrices behind a dynamic uniform binding

use crate::foundation::math::{mat4_to_cols, round_up, Mat4, MAT4_SIZE};
use crate::render::error::{CapacityError, CapacityKind};
use crate::render::gfx::{BufferId, GfxResult, GraphicsDevice, UniformBuffer};

/// Stride between object slots: one matrix rounded up to the device's
/// uniform offset alignment
pub fn dynamic_alignment(min_uniform_alignment: u64) -> usize {
    round_up(MAT4_SIZE, min_uniform_alignment as usize)
}

/// Fixed-capacity array of model matrices, one aligned slot per object
///
/// Slot `i` starts at `i * alignment`. Matrices are staged on the CPU and
/// uploaded in one write, which must happen before any draw reads a slot.
#[derive(Debug)]
pub struct DynamicModelBuffer {
    buffer: UniformBuffer,
    alignment: usize,
    capacity: usize,
    staging: Vec<u8>,
    len: usize,
}

impl DynamicModelBuffer {
    /// Allocate `capacity` slots aligned for the device
    pub fn new(device: &mut dyn GraphicsDevice, capacity: usize) -> GfxResult<Self> {
        let alignment = dynamic_alignment(device.capabilities().min_uniform_buffer_offset_alignment);
        let size = capacity * alignment;
        let buffer = UniformBuffer::create(device, size as u64)?;
        log::debug!("Dynamic model buffer: {capacity} slots of {alignment} bytes");
        Ok(Self {
            buffer,
            alignment,
            capacity,
            staging: vec![0; size],
            len: 0,
        })
    }

    /// Slot stride in bytes
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots written this frame
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been written this frame
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Dynamic offset of slot `index`
    pub fn offset(&self, index: usize) -> u32 {
        (index * self.alignment) as u32
    }

    /// Range each draw reads at its dynamic offset
    pub fn binding_range(&self) -> u64 {
        MAT4_SIZE as u64
    }

    /// Backend buffer
    pub fn buffer_id(&self) -> BufferId {
        self.buffer.id()
    }

    /// Forget the previous frame's slots
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Stage `matrix` in slot `index`
    pub fn write(&mut self, index: usize, matrix: &Mat4) -> Result<(), CapacityError> {
        if index >= self.capacity {
            return Err(CapacityError {
                what: CapacityKind::Objects,
                limit: self.capacity,
                requested: index + 1,
            });
        }
        let start = index * self.alignment;
        let cols = mat4_to_cols(matrix);
        self.staging[start..start + MAT4_SIZE].copy_from_slice(bytemuck::bytes_of(&cols));
        self.len = self.len.max(index + 1);
        Ok(())
    }

    /// Upload every staged slot in one write
    pub fn upload(&self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        if self.len == 0 {
            return Ok(());
        }
        self.buffer.set_data(device, &self.staging[..self.len * self.alignment])
    }

    /// Release the buffer
    pub fn destroy(self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        self.buffer.destroy(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HeadlessConfig;
    use crate::foundation::math::Vec3;
    use crate::render::backends::headless::HeadlessDevice;
    use crate::render::gfx::Extent2D;

    #[test]
    fn test_alignment_rounds_matrix_size() {
        assert_eq!(dynamic_alignment(0), 64);
        assert_eq!(dynamic_alignment(16), 64);
        assert_eq!(dynamic_alignment(64), 64);
        assert_eq!(dynamic_alignment(256), 256);
        for min in [1u64, 4, 32, 128, 256, 1024] {
            let a = dynamic_alignment(min);
            assert!(a >= MAT4_SIZE);
            assert_eq!(a as u64 % min, 0);
        }
    }

    #[test]
    fn test_slots_land_at_aligned_offsets() {
        let config = HeadlessConfig::default().with_min_uniform_alignment(256);
        let mut device = HeadlessDevice::new(config, Extent2D::new(4, 4));
        let mut buffer = DynamicModelBuffer::new(&mut device, 4).unwrap();
        assert_eq!(buffer.alignment(), 256);

        for i in 0..3 {
            buffer
                .write(i, &Mat4::new_translation(&Vec3::new(i as f32 + 1.0, 0.0, 0.0)))
                .unwrap();
        }
        buffer.upload(&mut device).unwrap();

        let bytes = device.buffer_contents(buffer.buffer_id()).unwrap();
        assert_eq!(bytes.len(), 4 * 256);
        for i in 0..3 {
            let offset = buffer.offset(i) as usize;
            assert_eq!(offset, i * 256);
            // Translation x is element 12 of the column-major matrix
            let x: f32 = bytemuck::pod_read_unaligned(&bytes[offset + 48..offset + 52]);
            assert_eq!(x, i as f32 + 1.0);
        }
    }

    #[test]
    fn test_write_past_capacity_rejected() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default(), Extent2D::new(4, 4));
        let mut buffer = DynamicModelBuffer::new(&mut device, 2).unwrap();
        let error = buffer.write(2, &Mat4::identity()).unwrap_err();
        assert_eq!(error.limit, 2);
        assert_eq!(error.requested, 3);
        assert!(buffer.is_empty());
        buffer.destroy(&mut device).unwrap();
        assert_eq!(device.live_objects().buffers, 0);
    }
}
