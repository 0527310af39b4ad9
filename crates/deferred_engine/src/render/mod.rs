//! # Rendering System
//!
//! Deferred and forward renderers over a backend-agnostic graphics layer.
//!
//! ## Architecture
//!
//! - **gfx**: Generational resource ids and the [`GraphicsDevice`] factory
//! - **backends**: Vulkan and headless implementations of that factory
//! - **pipeline / pass / shader**: Declarative pipeline descriptions, command
//!   buffer state tracking and shader lookup
//! - **deferred / forward**: The two renderers behind [`Renderer3D`]
//! - **manager / scene / render_queue**: What the renderers consume each frame

pub mod backends;
pub mod deferred;
pub mod error;
pub mod forward;
pub mod gfx;
pub mod manager;
pub mod material;
pub mod mesh;
pub mod pass;
pub mod pipeline;
pub mod render_queue;
pub mod renderer;
pub mod scene;
pub mod shader;
pub mod stats;
pub mod textures;

pub use deferred::{DeferredRenderer, FramePhase};
pub use error::{CapacityError, CapacityKind, RenderError, RenderResult};
pub use forward::ForwardRenderer;
pub use gfx::{create_device, GfxError, GfxResult, GraphicsDevice};
pub use manager::{RenderManager, SceneRenderManager};
pub use material::{Material, MaterialCache, MaterialId};
pub use mesh::{Mesh, Vertex};
pub use renderer::{create_renderer, Renderer3D, RendererKind};
pub use scene::{CameraData, Light, LightKind, RenderList, SceneSnapshot, SceneView};
pub use shader::{DirectoryShaderLibrary, InMemoryShaderLibrary, ShaderLibrary};
pub use stats::{FrameStats, OutputTarget};
