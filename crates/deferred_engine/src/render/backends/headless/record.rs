//! Command and submission logs kept by the headless device

use crate::render::gfx::{
    BufferId, CommandBufferId, DescriptorSetId, Extent2D, FramebufferId, PipelineId, RenderPassId,
    SubpassContents,
};

/// One command recorded into a headless command buffer
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    /// Render pass begin
    BeginRenderPass {
        /// Render pass
        render_pass: RenderPassId,
        /// Target framebuffer
        framebuffer: FramebufferId,
        /// Colour clear value
        clear_colour: [f32; 4],
        /// Inline or secondary contents
        contents: SubpassContents,
    },
    /// Render pass end
    EndRenderPass,
    /// Viewport and scissor
    SetViewport(Extent2D),
    /// Pipeline bind
    BindPipeline(PipelineId),
    /// Descriptor set bind
    BindDescriptorSets {
        /// Pipeline layout used
        pipeline: PipelineId,
        /// Sets, starting at set 0
        sets: Vec<DescriptorSetId>,
        /// Dynamic offsets in binding order
        dynamic_offsets: Vec<u32>,
    },
    /// Indexed draw
    DrawIndexed {
        /// Vertex buffer
        vertex_buffer: BufferId,
        /// Index buffer
        index_buffer: BufferId,
        /// Indices drawn
        index_count: u32,
    },
    /// Secondary execution, with the secondary's commands as they were when executed
    ExecuteSecondary {
        /// Secondary buffer
        secondary: CommandBufferId,
        /// Snapshot of its commands
        commands: Vec<RecordedCommand>,
    },
}

/// Visit `commands` depth first, descending into executed secondaries
pub fn walk<'a, F: FnMut(&'a RecordedCommand)>(commands: &'a [RecordedCommand], f: &mut F) {
    for command in commands {
        f(command);
        if let RecordedCommand::ExecuteSecondary { commands, .. } = command {
            walk(commands, f);
        }
    }
}

/// A primary buffer handed to the queue
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    /// Submitted buffer
    pub command_buffer: CommandBufferId,
    /// Commands as submitted
    pub commands: Vec<RecordedCommand>,
    /// Whether the caller blocked on the fence
    pub waited: bool,
    /// Swapchain image presented by this submission
    pub presented_image: Option<u32>,
}

impl Submission {
    /// Indexed draws, including those inside secondaries
    pub fn draw_count(&self) -> usize {
        let mut count = 0;
        walk(&self.commands, &mut |c| {
            if matches!(c, RecordedCommand::DrawIndexed { .. }) {
                count += 1;
            }
        });
        count
    }

    /// Secondary executions in this submission
    pub fn secondary_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::ExecuteSecondary { .. }))
            .count()
    }

    /// Framebuffers targeted by render passes in submission order
    pub fn framebuffers(&self) -> Vec<FramebufferId> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::BeginRenderPass { framebuffer, .. } => Some(*framebuffer),
                _ => None,
            })
            .collect()
    }

    /// Clear colours of the render passes begun
    pub fn clear_colours(&self) -> Vec<[f32; 4]> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::BeginRenderPass { clear_colour, .. } => Some(*clear_colour),
                _ => None,
            })
            .collect()
    }

    /// Every descriptor bind, in recording order
    pub fn descriptor_binds(&self) -> Vec<(&[DescriptorSetId], &[u32])> {
        let mut binds = Vec::new();
        walk(&self.commands, &mut |c| {
            if let RecordedCommand::BindDescriptorSets { sets, dynamic_offsets, .. } = c {
                binds.push((sets.as_slice(), dynamic_offsets.as_slice()));
            }
        });
        binds
    }

    /// Viewports set anywhere in the submission
    pub fn viewports(&self) -> Vec<Extent2D> {
        let mut viewports = Vec::new();
        walk(&self.commands, &mut |c| {
            if let RecordedCommand::SetViewport(extent) = c {
                viewports.push(*extent);
            }
        });
        viewports
    }
}

/// Count of live objects per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LiveObjects {
    /// Shader programs
    pub shaders: usize,
    /// Textures
    pub textures: usize,
    /// Render passes
    pub render_passes: usize,
    /// Framebuffers
    pub framebuffers: usize,
    /// Pipelines
    pub pipelines: usize,
    /// Descriptor sets
    pub descriptor_sets: usize,
    /// Buffers
    pub buffers: usize,
    /// Command buffers
    pub command_buffers: usize,
}

impl LiveObjects {
    /// Sum over all kinds
    pub fn total(&self) -> usize {
        self.shaders
            + self.textures
            + self.render_passes
            + self.framebuffers
            + self.pipelines
            + self.descriptor_sets
            + self.buffers
            + self.command_buffers
    }
}
