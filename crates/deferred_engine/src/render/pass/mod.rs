//! Command recording and pass-level helpers

pub mod command_buffer;

pub use command_buffer::{record_mesh_draw, CommandBuffer, CommandBufferState};
