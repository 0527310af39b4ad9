//! Command buffer management
//!
//! Typed command buffer recording over any [`GraphicsDevice`], with the state
//! machine checked before the backend is asked to do anything.

use std::fmt;

use crate::render::gfx::{
    CommandBufferId, CommandBufferLevel, DescriptorSetId, Extent2D, FramebufferId, GfxError,
    GfxResult, GraphicsDevice, MeshBuffers, PipelineId, RenderPassId, SubpassContents,
};

/// Where a command buffer is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    /// Allocated, never recorded
    Created,
    /// Between begin and end
    Recording {
        /// Primary or secondary recording
        level: CommandBufferLevel,
    },
    /// Recording finished, ready to submit or execute
    Executable,
    /// Handed to the queue, fence not waited yet
    Submitted,
    /// Submission finished
    Idle,
}

impl fmt::Display for CommandBufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Recording { level } => write!(f, "Recording({level:?})"),
            Self::Executable => write!(f, "Executable"),
            Self::Submitted => write!(f, "Submitted"),
            Self::Idle => write!(f, "Idle"),
        }
    }
}

/// A device command buffer with a checked recording lifecycle
///
/// `Created → Recording → Executable → Submitted → Idle`, and back to
/// `Recording` for reuse. Secondary buffers record against one render pass and
/// framebuffer and are executed into a primary buffer whose pass was opened
/// with secondary contents.
#[derive(Debug)]
pub struct CommandBuffer {
    id: CommandBufferId,
    level: CommandBufferLevel,
    state: CommandBufferState,
    pass_contents: Option<SubpassContents>,
    target: Option<(RenderPassId, FramebufferId)>,
}

impl CommandBuffer {
    /// Allocate a command buffer of `level`
    pub fn new(device: &mut dyn GraphicsDevice, level: CommandBufferLevel) -> GfxResult<Self> {
        let id = device.create_command_buffer(level)?;
        Ok(Self {
            id,
            level,
            state: CommandBufferState::Created,
            pass_contents: None,
            target: None,
        })
    }

    /// Backend id
    pub fn id(&self) -> CommandBufferId {
        self.id
    }

    /// Level
    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    /// Current state
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    /// Render pass and framebuffer of the open pass, or the ones a secondary records for
    pub fn target(&self) -> Option<(RenderPassId, FramebufferId)> {
        self.target
    }

    fn transition_error(&self, operation: &'static str, expected: &str) -> GfxError {
        GfxError::InvalidState {
            resource: "command buffer",
            state: format!("{} (expected {expected})", self.state),
            operation,
        }
    }

    fn require_recording(&self, operation: &'static str) -> GfxResult<()> {
        match self.state {
            CommandBufferState::Recording { .. } => Ok(()),
            _ => Err(self.transition_error(operation, "Recording")),
        }
    }

    fn require_level(&self, level: CommandBufferLevel, operation: &'static str) -> GfxResult<()> {
        if self.level == level {
            Ok(())
        } else {
            Err(GfxError::InvalidState {
                resource: "command buffer",
                state: format!("{:?} level", self.level),
                operation,
            })
        }
    }

    fn can_begin(&self) -> bool {
        !matches!(self.state, CommandBufferState::Recording { .. })
    }

    /// Begin recording a primary buffer
    pub fn begin_recording(&mut self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        self.require_level(CommandBufferLevel::Primary, "begin primary recording")?;
        if !self.can_begin() {
            return Err(self.transition_error("begin recording", "Created, Executable, Submitted or Idle"));
        }
        device.begin_command_buffer(self.id, None)?;
        self.state = CommandBufferState::Recording { level: CommandBufferLevel::Primary };
        self.pass_contents = None;
        self.target = None;
        Ok(())
    }

    /// Begin recording a secondary buffer for `render_pass` drawing into `framebuffer`
    pub fn begin_recording_secondary(
        &mut self,
        device: &mut dyn GraphicsDevice,
        render_pass: RenderPassId,
        framebuffer: FramebufferId,
    ) -> GfxResult<()> {
        self.require_level(CommandBufferLevel::Secondary, "begin secondary recording")?;
        if !self.can_begin() {
            return Err(self.transition_error("begin recording", "Created, Executable, Submitted or Idle"));
        }
        device.begin_command_buffer(self.id, Some((render_pass, framebuffer)))?;
        self.state = CommandBufferState::Recording { level: CommandBufferLevel::Secondary };
        self.pass_contents = None;
        self.target = Some((render_pass, framebuffer));
        Ok(())
    }

    /// Open a render pass on a recording primary buffer
    pub fn begin_render_pass(
        &mut self,
        device: &mut dyn GraphicsDevice,
        render_pass: RenderPassId,
        framebuffer: FramebufferId,
        clear_colour: [f32; 4],
        contents: SubpassContents,
    ) -> GfxResult<()> {
        self.require_level(CommandBufferLevel::Primary, "begin render pass")?;
        self.require_recording("begin render pass")?;
        if self.pass_contents.is_some() {
            return Err(GfxError::InvalidState {
                resource: "command buffer",
                state: "render pass already open".into(),
                operation: "begin render pass",
            });
        }
        device.cmd_begin_render_pass(self.id, render_pass, framebuffer, clear_colour, contents)?;
        self.pass_contents = Some(contents);
        self.target = Some((render_pass, framebuffer));
        Ok(())
    }

    /// Close the open render pass
    pub fn end_render_pass(&mut self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        self.require_recording("end render pass")?;
        if self.pass_contents.is_none() {
            return Err(GfxError::InvalidState {
                resource: "command buffer",
                state: "no render pass open".into(),
                operation: "end render pass",
            });
        }
        device.cmd_end_render_pass(self.id)?;
        self.pass_contents = None;
        Ok(())
    }

    /// Finish recording
    pub fn end_recording(&mut self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        self.require_recording("end recording")?;
        if self.pass_contents.is_some() {
            return Err(GfxError::InvalidState {
                resource: "command buffer",
                state: "render pass still open".into(),
                operation: "end recording",
            });
        }
        device.end_command_buffer(self.id)?;
        self.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Set viewport and scissor to `width` x `height`
    pub fn update_viewport(&mut self, device: &mut dyn GraphicsDevice, width: u32, height: u32) -> GfxResult<()> {
        self.require_recording("update viewport")?;
        device.cmd_set_viewport(self.id, Extent2D::new(width, height))
    }

    /// Bind a pipeline
    pub fn bind_pipeline(&mut self, device: &mut dyn GraphicsDevice, pipeline: PipelineId) -> GfxResult<()> {
        self.require_recording("bind pipeline")?;
        device.cmd_bind_pipeline(self.id, pipeline)
    }

    /// Bind the scene and per-draw sets with their dynamic offsets
    pub fn bind_descriptor_sets(
        &mut self,
        device: &mut dyn GraphicsDevice,
        pipeline: PipelineId,
        sets: &[DescriptorSetId],
        dynamic_offsets: &[u32],
    ) -> GfxResult<()> {
        self.require_recording("bind descriptor sets")?;
        device.cmd_bind_descriptor_sets(self.id, pipeline, sets, dynamic_offsets)
    }

    /// Draw a mesh
    pub fn draw_indexed(&mut self, device: &mut dyn GraphicsDevice, mesh: &MeshBuffers) -> GfxResult<()> {
        self.require_recording("draw")?;
        device.cmd_draw_indexed(self.id, mesh)
    }

    /// Execute this finished secondary buffer inside `primary`'s open render pass
    pub fn execute_secondary(&self, device: &mut dyn GraphicsDevice, primary: &CommandBuffer) -> GfxResult<()> {
        self.require_level(CommandBufferLevel::Secondary, "execute as secondary")?;
        if self.state != CommandBufferState::Executable {
            return Err(self.transition_error("execute secondary", "Executable"));
        }
        primary.require_recording("execute secondary into")?;
        if primary.pass_contents != Some(SubpassContents::SecondaryCommandBuffers) {
            return Err(GfxError::InvalidState {
                resource: "primary command buffer",
                state: format!("{} without a secondary-contents pass", primary.state),
                operation: "execute secondary",
            });
        }
        device.cmd_execute_secondary(primary.id, self.id)
    }

    /// Submit the buffer, blocking on its fence when `wait_fence` is set
    pub fn execute(&mut self, device: &mut dyn GraphicsDevice, wait_fence: bool) -> GfxResult<()> {
        self.require_level(CommandBufferLevel::Primary, "submit")?;
        if self.state != CommandBufferState::Executable {
            return Err(self.transition_error("submit", "Executable"));
        }
        device.submit(self.id, wait_fence)?;
        self.state = if wait_fence {
            CommandBufferState::Idle
        } else {
            CommandBufferState::Submitted
        };
        Ok(())
    }

    /// Submit the buffer and present `image_index`
    pub fn present(&mut self, device: &mut dyn GraphicsDevice, image_index: u32) -> GfxResult<()> {
        self.require_level(CommandBufferLevel::Primary, "present")?;
        if self.state != CommandBufferState::Executable {
            return Err(self.transition_error("present", "Executable"));
        }
        device.present(self.id, image_index)?;
        self.state = CommandBufferState::Submitted;
        Ok(())
    }

    /// Record that the device has been waited on
    pub fn mark_idle(&mut self) {
        if self.state == CommandBufferState::Submitted {
            self.state = CommandBufferState::Idle;
        }
    }

    /// Free the buffer
    pub fn destroy(self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        device.destroy_command_buffer(self.id)
    }
}

/// Record one mesh draw into a secondary buffer: viewport, pipeline, both descriptor tiers, draw
#[allow(clippy::too_many_arguments)]
pub fn record_mesh_draw(
    device: &mut dyn GraphicsDevice,
    secondary: &mut CommandBuffer,
    render_pass: RenderPassId,
    framebuffer: FramebufferId,
    extent: Extent2D,
    pipeline: PipelineId,
    sets: &[DescriptorSetId],
    dynamic_offsets: &[u32],
    mesh: &MeshBuffers,
) -> GfxResult<()> {
    secondary.begin_recording_secondary(device, render_pass, framebuffer)?;
    secondary.update_viewport(device, extent.width, extent.height)?;
    secondary.bind_pipeline(device, pipeline)?;
    secondary.bind_descriptor_sets(device, pipeline, sets, dynamic_offsets)?;
    secondary.draw_indexed(device, mesh)?;
    secondary.end_recording(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HeadlessConfig;
    use crate::render::backends::headless::HeadlessDevice;
    use crate::render::gfx::{AttachmentDesc, Format, FramebufferAttachment, FramebufferDesc, RenderPassDesc};

    fn setup() -> (HeadlessDevice, RenderPassId, FramebufferId) {
        let mut device = HeadlessDevice::new(HeadlessConfig::default(), Extent2D::new(32, 32));
        let pass = device
            .create_render_pass(&RenderPassDesc {
                label: "screen".into(),
                attachments: vec![AttachmentDesc::colour(Format::Presentation)],
            })
            .unwrap();
        let fb = device
            .create_framebuffer(&FramebufferDesc {
                label: "screen 0".into(),
                render_pass: pass,
                width: 32,
                height: 32,
                attachments: vec![FramebufferAttachment::SwapchainImage(0)],
            })
            .unwrap();
        (device, pass, fb)
    }

    #[test]
    fn test_primary_lifecycle() {
        let (mut device, _, _) = setup();
        let mut cmd = CommandBuffer::new(&mut device, CommandBufferLevel::Primary).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Created);

        cmd.begin_recording(&mut device).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Recording { level: CommandBufferLevel::Primary });
        cmd.end_recording(&mut device).unwrap();
        cmd.execute(&mut device, false).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Submitted);

        // Reuse restarts from Submitted; the backend waits the fence
        cmd.begin_recording(&mut device).unwrap();
        cmd.end_recording(&mut device).unwrap();
        cmd.execute(&mut device, true).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Idle);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let (mut device, _, _) = setup();
        let mut cmd = CommandBuffer::new(&mut device, CommandBufferLevel::Primary).unwrap();

        assert!(matches!(cmd.end_recording(&mut device), Err(GfxError::InvalidState { .. })));
        assert!(matches!(cmd.execute(&mut device, true), Err(GfxError::InvalidState { .. })));

        cmd.begin_recording(&mut device).unwrap();
        assert!(matches!(cmd.begin_recording(&mut device), Err(GfxError::InvalidState { .. })));
        assert!(matches!(cmd.execute(&mut device, true), Err(GfxError::InvalidState { .. })));
    }

    #[test]
    fn test_secondary_executes_into_secondary_pass_only() {
        let (mut device, pass, fb) = setup();
        let mut primary = CommandBuffer::new(&mut device, CommandBufferLevel::Primary).unwrap();
        let mut secondary = CommandBuffer::new(&mut device, CommandBufferLevel::Secondary).unwrap();

        assert!(secondary.begin_recording(&mut device).is_err());
        secondary.begin_recording_secondary(&mut device, pass, fb).unwrap();
        secondary.update_viewport(&mut device, 32, 32).unwrap();

        primary.begin_recording(&mut device).unwrap();
        primary
            .begin_render_pass(&mut device, pass, fb, [0.0; 4], SubpassContents::SecondaryCommandBuffers)
            .unwrap();

        // Still recording
        assert!(secondary.execute_secondary(&mut device, &primary).is_err());
        secondary.end_recording(&mut device).unwrap();
        secondary.execute_secondary(&mut device, &primary).unwrap();

        primary.end_render_pass(&mut device).unwrap();
        assert!(secondary.execute_secondary(&mut device, &primary).is_err());
        primary.end_recording(&mut device).unwrap();
        primary.execute(&mut device, true).unwrap();

        let submission = &device.submissions()[0];
        assert_eq!(submission.secondary_count(), 1);
        assert_eq!(submission.viewports(), vec![Extent2D::new(32, 32)]);
    }

    #[test]
    fn test_end_recording_inside_pass_rejected() {
        let (mut device, pass, fb) = setup();
        let mut primary = CommandBuffer::new(&mut device, CommandBufferLevel::Primary).unwrap();
        primary.begin_recording(&mut device).unwrap();
        primary
            .begin_render_pass(&mut device, pass, fb, [0.0; 4], SubpassContents::Inline)
            .unwrap();
        assert!(primary.end_recording(&mut device).is_err());
        primary.end_render_pass(&mut device).unwrap();
        primary.end_recording(&mut device).unwrap();
    }
}
