//! Shader programs and their lookup
//!
//! Renderers ask a [`ShaderLibrary`] for programs by name. Where the SPIR-V
//! comes from (a mounted directory, an embedded table, a virtual file system)
//! is the library's business.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::render::pipeline::ShaderStages;
use crate::render::{RenderError, RenderResult};

/// SPIR-V magic number, first word of every module
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// One compiled stage of a program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderStageSource {
    /// Stage this module runs in, exactly one flag
    pub stage: ShaderStages,
    /// SPIR-V words
    pub spirv: Vec<u32>,
    /// Entry point name
    pub entry_point: String,
}

/// A named program made of compiled stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    /// Program name
    pub name: String,
    /// Compiled stages
    pub stages: Vec<ShaderStageSource>,
}

impl ShaderSource {
    /// Program with a vertex and a fragment stage
    pub fn vertex_fragment(name: impl Into<String>, vertex: Vec<u32>, fragment: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            stages: vec![
                ShaderStageSource { stage: ShaderStages::VERTEX, spirv: vertex, entry_point: "main".into() },
                ShaderStageSource { stage: ShaderStages::FRAGMENT, spirv: fragment, entry_point: "main".into() },
            ],
        }
    }

    /// Stage module for `stage`, if the program has one
    pub fn stage(&self, stage: ShaderStages) -> Option<&ShaderStageSource> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Check the structural validity every backend relies on: one vertex stage,
    /// single-flag stages, non-empty modules starting with the SPIR-V magic
    pub fn check(&self) -> Result<(), String> {
        if self.stage(ShaderStages::VERTEX).is_none() {
            return Err("program has no vertex stage".into());
        }
        for stage in &self.stages {
            if stage.stage.bits().count_ones() != 1 {
                return Err(format!("stage {:?} must name exactly one stage", stage.stage));
            }
            match stage.spirv.first() {
                None => return Err(format!("{:?} module is empty", stage.stage)),
                Some(&word) if word != SPIRV_MAGIC => {
                    return Err(format!("{:?} module does not start with the SPIR-V magic number", stage.stage));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Convert little-endian SPIR-V bytes to words
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>, String> {
    if bytes.len() % 4 != 0 {
        return Err(format!("SPIR-V length {} is not a multiple of 4", bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Resolves shader programs by name
pub trait ShaderLibrary {
    /// Load the program called `name`
    fn load(&self, name: &str) -> RenderResult<ShaderSource>;
}

/// Reads `<dir>/<name>.vert.spv` and `<dir>/<name>.frag.spv`
#[derive(Debug, Clone)]
pub struct DirectoryShaderLibrary {
    root: PathBuf,
}

impl DirectoryShaderLibrary {
    /// Library rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_stage(&self, name: &str, extension: &str) -> RenderResult<Vec<u32>> {
        let path = self.root.join(format!("{name}.{extension}.spv"));
        log::debug!("Loading shader stage from {}", path.display());
        let bytes = std::fs::read(&path)
            .map_err(|e| RenderError::ShaderNotFound(format!("{}: {e}", path.display())))?;
        spirv_words(&bytes).map_err(|reason| RenderError::ShaderNotFound(format!("{}: {reason}", path.display())))
    }
}

impl ShaderLibrary for DirectoryShaderLibrary {
    fn load(&self, name: &str) -> RenderResult<ShaderSource> {
        let vertex = self.read_stage(name, "vert")?;
        let fragment = self.read_stage(name, "frag")?;
        Ok(ShaderSource::vertex_fragment(name, vertex, fragment))
    }
}

/// Programs registered in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryShaderLibrary {
    programs: HashMap<String, ShaderSource>,
}

impl InMemoryShaderLibrary {
    /// Empty library
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a program under its own name
    pub fn insert(&mut self, source: ShaderSource) {
        self.programs.insert(source.name.clone(), source);
    }

    /// Register a header-only vertex/fragment program, enough for the headless backend
    pub fn with_placeholder(mut self, name: &str) -> Self {
        let header = vec![SPIRV_MAGIC, 0x0001_0000, 0, 1, 0];
        self.insert(ShaderSource::vertex_fragment(name, header.clone(), header));
        self
    }
}

impl ShaderLibrary for InMemoryShaderLibrary {
    fn load(&self, name: &str) -> RenderResult<ShaderSource> {
        self.programs
            .get(name)
            .cloned()
            .ok_or_else(|| RenderError::ShaderNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spirv_words_little_endian() {
        let bytes = SPIRV_MAGIC.to_le_bytes();
        assert_eq!(spirv_words(&bytes).unwrap(), vec![SPIRV_MAGIC]);
        assert!(spirv_words(&bytes[..3]).is_err());
    }

    #[test]
    fn test_placeholder_program_passes_check() {
        let library = InMemoryShaderLibrary::new().with_placeholder("deferred_lighting");
        let source = library.load("deferred_lighting").unwrap();
        assert!(source.check().is_ok());
        assert!(source.stage(ShaderStages::FRAGMENT).is_some());
        assert!(matches!(library.load("missing"), Err(RenderError::ShaderNotFound(_))));
    }

    #[test]
    fn test_check_rejects_bad_modules() {
        let no_magic = ShaderSource::vertex_fragment("bad", vec![1, 2, 3], vec![SPIRV_MAGIC]);
        assert!(no_magic.check().is_err());

        let empty = ShaderSource::vertex_fragment("empty", vec![SPIRV_MAGIC], vec![]);
        assert!(empty.check().is_err());

        let mut fragment_only = ShaderSource::vertex_fragment("frag", vec![SPIRV_MAGIC], vec![SPIRV_MAGIC]);
        fragment_only.stages.remove(0);
        assert!(fragment_only.check().is_err());
    }

    #[test]
    fn test_directory_library_reports_missing_files() {
        let library = DirectoryShaderLibrary::new("/nonexistent/shader/dir");
        assert!(matches!(library.load("forward"), Err(RenderError::ShaderNotFound(_))));
    }
}
