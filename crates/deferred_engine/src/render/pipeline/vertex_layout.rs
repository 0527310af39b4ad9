//! Vertex input layout descriptions

use crate::render::gfx::{GfxError, GfxResult};

/// Format of one vertex attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    /// Two 32-bit floats
    Float2,
    /// Three 32-bit floats
    Float3,
    /// Four 32-bit floats
    Float4,
}

impl VertexFormat {
    /// Size in bytes
    pub fn size(self) -> u32 {
        match self {
            Self::Float2 => 8,
            Self::Float3 => 12,
            Self::Float4 => 16,
        }
    }
}

/// One attribute inside an interleaved vertex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    /// Shader input location
    pub location: u32,
    /// Attribute format
    pub format: VertexFormat,
    /// Byte offset inside the vertex
    pub offset: u32,
}

/// Interleaved single-binding vertex layout
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VertexLayout {
    /// Bytes between consecutive vertices
    pub stride: u32,
    /// Attributes in location order
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// Start a layout with the given stride
    pub fn new(stride: u32) -> Self {
        Self { stride, attributes: Vec::new() }
    }

    /// Append an attribute
    pub fn attribute(mut self, location: u32, format: VertexFormat, offset: u32) -> Self {
        self.attributes.push(VertexAttribute { location, format, offset });
        self
    }

    /// Check attributes fit in the stride and locations are unique
    pub fn validate(&self) -> GfxResult<()> {
        if self.attributes.is_empty() {
            return Err(GfxError::InvalidDescription("vertex layout has no attributes".into()));
        }
        for (i, attribute) in self.attributes.iter().enumerate() {
            if attribute.offset + attribute.format.size() > self.stride {
                return Err(GfxError::InvalidDescription(format!(
                    "vertex attribute at location {} overruns stride {}",
                    attribute.location, self.stride
                )));
            }
            if self.attributes[..i].iter().any(|a| a.location == attribute.location) {
                return Err(GfxError::InvalidDescription(format!(
                    "vertex location {} declared twice",
                    attribute.location
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_validation() {
        let layout = VertexLayout::new(20)
            .attribute(0, VertexFormat::Float3, 0)
            .attribute(1, VertexFormat::Float2, 12);
        assert!(layout.validate().is_ok());

        let overrun = VertexLayout::new(16).attribute(0, VertexFormat::Float4, 4);
        assert!(overrun.validate().is_err());

        let duplicate = VertexLayout::new(24)
            .attribute(0, VertexFormat::Float3, 0)
            .attribute(0, VertexFormat::Float3, 12);
        assert!(duplicate.validate().is_err());
    }
}
