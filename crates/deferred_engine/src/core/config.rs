//! # Renderer Configuration
//!
//! Serializable settings for backend selection, presentation size, object
//! capacity and shader lookup. Every structure supports builder-style setters,
//! has sensible defaults, and validates itself before a renderer is built.
//!
//! Files are loaded through the [`Config`] trait, so both TOML and RON work:
//!
//! ```toml
//! application_name = "Deferred Demo"
//! backend = "Headless"
//! width = 1280
//! height = 720
//! max_objects = 2048
//! max_frames_in_flight = 2
//!
//! [shaders]
//! directory = "target/shaders"
//! geometry_pass = "deferred_geometry"
//! lighting_pass = "deferred_lighting"
//! forward_pass = "forward"
//!
//! [headless]
//! min_uniform_buffer_offset_alignment = 256
//! swapchain_image_count = 3
//! max_color_attachments = 8
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

pub use crate::config::{Config, ConfigError};

/// Upper bound accepted for `max_objects`
pub const MAX_OBJECTS_LIMIT: u32 = 65_536;

/// Graphics API a device is created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphicsApi {
    /// Vulkan through `ash`
    Vulkan,
    /// CPU-side recording backend with no GPU access
    Headless,
}

impl std::fmt::Display for GraphicsApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vulkan => write!(f, "Vulkan"),
            Self::Headless => write!(f, "Headless"),
        }
    }
}

/// # Shader Configuration
///
/// Names of the shader programs used by each pass and the directory their
/// compiled SPIR-V lives in. A program `name` resolves to
/// `<directory>/<name>.vert.spv` and `<directory>/<name>.frag.spv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderConfig {
    /// Directory holding compiled SPIR-V
    pub directory: String,
    /// Program writing the GBuffer
    pub geometry_pass: String,
    /// Program compositing the GBuffer with lights
    pub lighting_pass: String,
    /// Program used by the forward renderer
    pub forward_pass: String,
}

impl ShaderConfig {
    /// Create a shader configuration rooted at `directory`
    pub fn new(directory: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            geometry_pass: "deferred_geometry".to_string(),
            lighting_pass: "deferred_lighting".to_string(),
            forward_pass: "forward".to_string(),
        }
    }

    /// Create shader config with automatic directory resolution
    ///
    /// Tries the usual output locations so binaries work from different
    /// working directories.
    pub fn with_path_resolution() -> Self {
        let shader_dirs = [
            "target/shaders",
            "shaders",
            "resources/shaders",
            "../target/shaders",
            "../../target/shaders",
        ];

        let directory = shader_dirs
            .iter()
            .find(|dir| Path::new(dir).is_dir())
            .copied()
            .unwrap_or("target/shaders");

        Self::new(directory)
    }

    /// Set the geometry pass program name
    pub fn with_geometry_pass(mut self, name: impl Into<String>) -> Self {
        self.geometry_pass = name.into();
        self
    }

    /// Set the lighting pass program name
    pub fn with_lighting_pass(mut self, name: impl Into<String>) -> Self {
        self.lighting_pass = name.into();
        self
    }

    /// Validate that all program names are usable
    pub fn validate(&self) -> Result<(), String> {
        for (label, name) in [
            ("geometry", &self.geometry_pass),
            ("lighting", &self.lighting_pass),
            ("forward", &self.forward_pass),
        ] {
            if name.is_empty() {
                return Err(format!("{label} shader name cannot be empty"));
            }
            if name.contains(['/', '\\']) {
                return Err(format!("{label} shader name must not contain path separators: {name}"));
            }
        }
        Ok(())
    }
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self::new("target/shaders")
    }
}

/// Limits reported by the headless backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadlessConfig {
    /// Reported `minUniformBufferOffsetAlignment`
    pub min_uniform_buffer_offset_alignment: u32,
    /// Number of simulated swapchain images
    pub swapchain_image_count: u32,
    /// Reported colour attachment limit
    pub max_color_attachments: u32,
}

impl HeadlessConfig {
    /// Set the reported uniform offset alignment
    pub fn with_min_uniform_alignment(mut self, alignment: u32) -> Self {
        self.min_uniform_buffer_offset_alignment = alignment;
        self
    }

    /// Set the number of simulated swapchain images
    pub fn with_swapchain_images(mut self, count: u32) -> Self {
        self.swapchain_image_count = count;
        self
    }

    /// Validate the simulated limits
    pub fn validate(&self) -> Result<(), String> {
        let alignment = self.min_uniform_buffer_offset_alignment;
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(format!("Uniform offset alignment must be a power of two, got {alignment}"));
        }
        if self.max_color_attachments < 4 {
            return Err("At least 4 colour attachments are required for the GBuffer".to_string());
        }
        Ok(())
    }
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            min_uniform_buffer_offset_alignment: 256,
            swapchain_image_count: 3,
            max_color_attachments: 8,
        }
    }
}

/// # Renderer Configuration
///
/// Top-level settings consumed by device creation and both renderers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Application name for instance creation and logs
    pub application_name: String,
    /// Backend resolved at startup
    pub backend: GraphicsApi,
    /// Initial presentation width
    pub width: u32,
    /// Initial presentation height
    pub height: u32,
    /// Capacity of the per-object dynamic uniform buffer
    pub max_objects: u32,
    /// Maximum frames in flight for the Vulkan backend
    pub max_frames_in_flight: usize,
    /// Whether to enable Vulkan validation layers, `None` follows the build type
    pub enable_validation: Option<bool>,
    /// Shader configuration
    pub shaders: ShaderConfig,
    /// Headless backend limits
    pub headless: HeadlessConfig,
}

impl RendererConfig {
    /// Create a new renderer configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            backend: GraphicsApi::Vulkan,
            width: 1280,
            height: 720,
            max_objects: 2048,
            max_frames_in_flight: 2,
            enable_validation: None,
            shaders: ShaderConfig::default(),
            headless: HeadlessConfig::default(),
        }
    }

    /// Select the backend
    pub fn with_backend(mut self, backend: GraphicsApi) -> Self {
        self.backend = backend;
        self
    }

    /// Set the initial presentation size
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the per-object capacity
    pub fn with_max_objects(mut self, max_objects: u32) -> Self {
        self.max_objects = max_objects;
        self
    }

    /// Set custom shader configuration
    pub fn with_shaders(mut self, shaders: ShaderConfig) -> Self {
        self.shaders = shaders;
        self
    }

    /// Set headless backend limits
    pub fn with_headless(mut self, headless: HeadlessConfig) -> Self {
        self.headless = headless;
        self
    }

    /// Set maximum frames in flight
    pub fn with_max_frames_in_flight(mut self, frames: usize) -> Self {
        self.max_frames_in_flight = frames;
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Whether validation layers should be requested
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.application_name.is_empty() {
            return Err("Application name cannot be empty".to_string());
        }

        if self.width == 0 || self.height == 0 {
            return Err(format!("Invalid presentation size {}x{}", self.width, self.height));
        }

        if self.max_objects == 0 || self.max_objects > MAX_OBJECTS_LIMIT {
            return Err(format!(
                "max_objects must be within 1..={MAX_OBJECTS_LIMIT}, got {}",
                self.max_objects
            ));
        }

        if self.max_frames_in_flight == 0 {
            return Err("Max frames in flight must be at least 1".to_string());
        }

        if self.max_frames_in_flight > 8 {
            return Err("Max frames in flight should not exceed 8".to_string());
        }

        self.shaders.validate()?;
        self.headless.validate()?;

        Ok(())
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("Deferred Engine Application")
    }
}

impl Config for RendererConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_objects, 2048);
        assert_eq!(config.backend, GraphicsApi::Vulkan);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(RendererConfig::default().with_size(0, 720).validate().is_err());
        assert!(RendererConfig::default().with_max_objects(0).validate().is_err());
        assert!(RendererConfig::default()
            .with_max_objects(MAX_OBJECTS_LIMIT + 1)
            .validate()
            .is_err());
        assert!(RendererConfig::default().with_max_frames_in_flight(0).validate().is_err());

        let odd_alignment = HeadlessConfig::default().with_min_uniform_alignment(48);
        assert!(RendererConfig::default().with_headless(odd_alignment).validate().is_err());

        let shaders = ShaderConfig::default().with_lighting_pass("shaders/light");
        assert!(RendererConfig::default().with_shaders(shaders).validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = RendererConfig::new("Round Trip")
            .with_backend(GraphicsApi::Headless)
            .with_size(800, 600)
            .with_max_objects(128);

        let text = config.to_toml_string().unwrap();
        let parsed = RendererConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_ron_round_trip() {
        let config = RendererConfig::new("Ron")
            .with_backend(GraphicsApi::Headless)
            .with_validation(false);

        let text = config.to_ron_string().unwrap();
        let parsed = RendererConfig::from_ron_str(&text).unwrap();
        assert_eq!(parsed, config);
        assert!(!parsed.validation_enabled());
    }

    #[test]
    fn test_unsupported_extension() {
        let result = RendererConfig::load_from_file("renderer.json");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_file_round_trip() {
        let path = std::env::temp_dir().join(format!("deferred_engine_cfg_{}.toml", std::process::id()));
        let config = RendererConfig::new("File").with_backend(GraphicsApi::Headless);
        config.save_to_file(&path).unwrap();
        let loaded = RendererConfig::load_from_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded, config);
    }
}
