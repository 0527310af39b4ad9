//! # Deferred Engine
//!
//! Deferred rendering orchestration over a backend-agnostic graphics layer.
//!
//! ## Features
//!
//! - **Deferred Renderer**: GBuffer geometry pass, secondary command buffers per
//!   draw and a lighting composite with sky and shadow inputs
//! - **Forward Renderer**: Single-pass alternative behind the same interface
//! - **Backends**: Vulkan through `ash`, and a headless recording device
//! - **Configuration**: TOML and RON renderer settings
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use deferred_engine::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RendererConfig::new("demo").with_backend(GraphicsApi::Headless);
//!     let mut device = create_device(&config)?;
//!     let manager = SceneRenderManager::new(device.as_mut(), config.width, config.height)?;
//!     let shaders = DirectoryShaderLibrary::new(&config.shaders.directory);
//!     let renderer = create_renderer(RendererKind::Deferred, device.as_mut(), &manager, &shaders, &config)?;
//!     renderer.destroy(device.as_mut())?;
//!     manager.destroy(device.as_mut())?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod core;
pub mod foundation;
pub mod render;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        config::Config,
        core::{GraphicsApi, HeadlessConfig, RendererConfig, ShaderConfig},
        foundation::math::{Mat4, Vec3, Vec4},
        render::{
            create_device, create_renderer, CameraData, DeferredRenderer, DirectoryShaderLibrary,
            ForwardRenderer, FrameStats, GraphicsDevice, InMemoryShaderLibrary, Light, LightKind,
            Material, Mesh, RenderError, RenderList, RenderManager, RenderResult, Renderer3D,
            RendererKind, SceneRenderManager, SceneSnapshot, SceneView, ShaderLibrary, Vertex,
        },
    };
}
