//! Graphics backends
//!
//! - [`headless`]: CPU-side recording device used by tests and tools
//! - [`vulkan`]: `ash` device, offscreen or presenting to a window

pub mod headless;
pub mod vulkan;
