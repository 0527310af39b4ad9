//! Per-frame statistics

use crate::render::error::CapacityError;
use crate::render::gfx::TextureRef;

/// Where a frame's final image went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTarget {
    /// A swapchain image, presented at the end of the frame
    Swapchain(u32),
    /// A render target texture; nothing is presented
    Texture(TextureRef),
}

/// What one `render_scene` call did
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameStats {
    /// Objects drawn in the geometry pass
    pub objects_submitted: usize,
    /// Objects dropped because the dynamic buffer was full
    pub objects_dropped: usize,
    /// Lights written to the lighting block
    pub lights_packed: usize,
    /// Lights dropped past the light capacity
    pub lights_dropped: usize,
    /// Shadow cascades written to the lighting block
    pub shadow_maps_packed: usize,
    /// Secondary buffers executed across both passes
    pub secondary_buffers: usize,
    /// Output of the composite pass
    pub output: Option<OutputTarget>,
    /// Whether a swapchain image was presented
    pub presented: bool,
    /// Capacity violations clamped during the frame
    pub capacity_violations: Vec<CapacityError>,
}

impl FrameStats {
    /// Whether anything had to be clamped
    pub fn clamped(&self) -> bool {
        !self.capacity_violations.is_empty()
    }
}
