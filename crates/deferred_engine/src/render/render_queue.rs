//! # Render Queue
//!
//! Collects the per-frame draw commands a renderer records after its uniforms
//! are written. The queue is bounded by the renderer's object capacity: the
//! position of a command in the queue is its slot in the dynamic model
//! buffer, so commands past the capacity are counted and dropped instead of
//! stored.
//!
//! Commands are kept in submission order. Any visibility or material
//! ordering is the render list's job.

use crate::foundation::math::Mat4;
use crate::render::error::{CapacityError, CapacityKind};
use crate::render::gfx::{DescriptorSetId, MeshBuffers};

/// Index of a command in the queue, equal to its dynamic buffer slot
pub type RenderCommandId = u32;

/// One mesh draw for the current frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderCommand {
    /// Buffers of the mesh to draw; the mesh itself is owned elsewhere
    pub mesh: MeshBuffers,
    /// Per-draw descriptor set of the mesh's material
    pub material_set: DescriptorSetId,
    /// World transform
    pub transform: Mat4,
    /// Texture transform, identity when the object has none
    pub texture_matrix: Mat4,
}

/// Bounded, order-preserving list of render commands
#[derive(Debug)]
pub struct RenderQueue {
    commands: Vec<RenderCommand>,
    capacity: usize,
    dropped: usize,
}

impl RenderQueue {
    /// Create a queue that holds at most `capacity` commands per frame
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            commands: Vec::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    /// Add a command, returning its slot, or `None` when the queue is full
    pub fn add_command(&mut self, command: RenderCommand) -> Option<RenderCommandId> {
        if self.is_full() {
            self.reject();
            return None;
        }
        let id = self.commands.len() as RenderCommandId;
        self.commands.push(command);
        Some(id)
    }

    /// Whether the next command would be dropped
    pub fn is_full(&self) -> bool {
        self.commands.len() >= self.capacity
    }

    /// Count a command dropped before it was built
    pub fn reject(&mut self) {
        self.dropped += 1;
    }

    /// Commands in submission order
    pub fn commands(&self) -> &[RenderCommand] {
        &self.commands
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Maximum commands per frame
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Commands rejected since the last clear
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// The capacity violation of this frame, if any command was dropped
    pub fn overflow(&self) -> Option<CapacityError> {
        (self.dropped > 0).then(|| CapacityError {
            what: CapacityKind::Objects,
            limit: self.capacity,
            requested: self.capacity + self.dropped,
        })
    }

    /// Clear all commands for next frame
    pub fn clear(&mut self) {
        self.commands.clear();
        self.dropped = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::gfx::BufferId;
    use slotmap::SlotMap;

    fn command(x: f32) -> RenderCommand {
        let mut buffers: SlotMap<BufferId, ()> = SlotMap::with_key();
        let mut sets: SlotMap<DescriptorSetId, ()> = SlotMap::with_key();
        RenderCommand {
            mesh: MeshBuffers {
                vertex_buffer: buffers.insert(()),
                index_buffer: buffers.insert(()),
                index_count: 3,
            },
            material_set: sets.insert(()),
            transform: Mat4::new_translation(&crate::foundation::math::Vec3::new(x, 0.0, 0.0)),
            texture_matrix: Mat4::identity(),
        }
    }

    #[test]
    fn test_render_queue_creation() {
        let queue = RenderQueue::with_capacity(4);
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 4);
        assert!(queue.overflow().is_none());
    }

    #[test]
    fn test_ids_follow_submission_order() {
        let mut queue = RenderQueue::with_capacity(4);
        assert_eq!(queue.add_command(command(3.0)), Some(0));
        assert_eq!(queue.add_command(command(1.0)), Some(1));
        assert_eq!(queue.add_command(command(2.0)), Some(2));

        let xs: Vec<f32> = queue.commands().iter().map(|c| c.transform[(0, 3)]).collect();
        assert_eq!(xs, vec![3.0, 1.0, 2.0]);
    }

    #[test]
    fn test_overflow_is_counted_not_stored() {
        let mut queue = RenderQueue::with_capacity(2);
        for i in 0..5 {
            queue.add_command(command(i as f32));
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 3);

        let overflow = queue.overflow().unwrap();
        assert_eq!(overflow.what, CapacityKind::Objects);
        assert_eq!(overflow.limit, 2);
        assert_eq!(overflow.requested, 5);

        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.overflow().is_none());
    }
}
