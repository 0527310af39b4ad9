//! Core renderer configuration

pub mod config;

pub use config::{GraphicsApi, HeadlessConfig, RendererConfig, ShaderConfig};
