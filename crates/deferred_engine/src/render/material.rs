//! Materials and their per-draw descriptor sets
//!
//! A [`Material`] names up to five textures and a block of
//! [`MaterialProperties`] uploaded as a uniform buffer. Renderers turn
//! materials into per-draw descriptor sets through a [`MaterialCache`], which
//! keeps one set per material for the pipeline it was built against,
//! rebuilds it when that pipeline changes and drops it once the material
//! stops being drawn.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::render::gfx::{DescriptorSetId, GfxError, GfxResult, GraphicsDevice, PipelineId, TextureRef, UniformBuffer};
use crate::render::pipeline::{DescriptorLayout, DescriptorSetBuilder, DescriptorTier, ShaderStages};

/// Texture slots of a material, bound at per-draw bindings `0..5`
pub const MATERIAL_TEXTURE_SLOTS: u32 = 5;
/// Per-draw binding of the material uniform block
pub const MATERIAL_UNIFORM_BINDING: u32 = 5;

/// Per-draw layout every material set is written against
pub fn material_layout() -> DescriptorLayout {
    let mut layout = DescriptorLayout::new();
    for slot in 0..MATERIAL_TEXTURE_SLOTS {
        layout = layout.add_image_sampler(slot, ShaderStages::FRAGMENT);
    }
    layout.add_uniform_buffer(MATERIAL_UNIFORM_BINDING, ShaderStages::FRAGMENT)
}

static NEXT_MATERIAL_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for materials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub u64);

impl MaterialId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        Self(NEXT_MATERIAL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Shading workflow stored in [`MaterialProperties::workflow`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workflow {
    /// Metallic / roughness maps
    MetallicRoughness,
    /// Specular / gloss maps
    SpecularGloss,
}

/// Material constants as the geometry shader reads them (per-draw binding 5)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialProperties {
    /// Base colour multiplier
    pub albedo_colour: [f32; 4],
    /// Gloss (roughness) multiplier
    pub gloss_colour: [f32; 4],
    /// Specular (metallic) multiplier
    pub specular_colour: [f32; 4],
    /// 1 when the albedo map is sampled
    pub using_albedo_map: f32,
    /// 1 when the specular / metallic map is sampled
    pub using_specular_map: f32,
    /// 1 when the gloss / roughness map is sampled
    pub using_gloss_map: f32,
    /// 1 when the normal map is sampled
    pub using_normal_map: f32,
    /// 1 when the ambient occlusion map is sampled
    pub using_ao_map: f32,
    /// 0 metallic / roughness, 1 specular / gloss
    pub workflow: f32,
    /// Keeps the block a multiple of 16 bytes
    pub _padding: [f32; 2],
}

impl Default for MaterialProperties {
    fn default() -> Self {
        Self {
            albedo_colour: [1.0; 4],
            gloss_colour: [1.0; 4],
            specular_colour: [0.0, 1.0, 0.0, 1.0],
            using_albedo_map: 1.0,
            using_specular_map: 0.0,
            using_gloss_map: 0.0,
            using_normal_map: 0.0,
            using_ao_map: 0.0,
            workflow: 0.0,
            _padding: [0.0; 2],
        }
    }
}

impl MaterialProperties {
    /// Set the shading workflow
    pub fn with_workflow(mut self, workflow: Workflow) -> Self {
        self.workflow = match workflow {
            Workflow::MetallicRoughness => 0.0,
            Workflow::SpecularGloss => 1.0,
        };
        self
    }
}

/// Texture slots of a material, in per-draw binding order 0 to 4
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterialTextures {
    /// Albedo, binding 0
    pub albedo: Option<TextureRef>,
    /// Normal map, binding 1
    pub normal: Option<TextureRef>,
    /// Metallic / specular, binding 2
    pub metallic: Option<TextureRef>,
    /// Roughness / gloss, binding 3
    pub roughness: Option<TextureRef>,
    /// Ambient occlusion, binding 4
    pub ao: Option<TextureRef>,
}

impl MaterialTextures {
    /// Slots in binding order
    pub fn slots(&self) -> [Option<TextureRef>; MATERIAL_TEXTURE_SLOTS as usize] {
        [self.albedo, self.normal, self.metallic, self.roughness, self.ao]
    }
}

/// Textures and constants of a surface
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    id: MaterialId,
    /// Optional name for debugging
    pub name: Option<String>,
    /// Texture slots
    pub textures: MaterialTextures,
    /// Uniform constants
    pub properties: MaterialProperties,
}

impl Material {
    /// Material with default constants and no textures
    pub fn new() -> Self {
        Self {
            id: MaterialId::next(),
            name: None,
            textures: MaterialTextures::default(),
            properties: MaterialProperties::default(),
        }
    }

    /// Unique id
    pub fn id(&self) -> MaterialId {
        self.id
    }

    /// Set the material name for debugging
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach textures, enabling the map flags of the filled slots
    pub fn with_textures(mut self, textures: MaterialTextures) -> Self {
        let flag = |t: Option<TextureRef>| if t.is_some() { 1.0 } else { 0.0 };
        self.properties.using_albedo_map = flag(textures.albedo);
        self.properties.using_normal_map = flag(textures.normal);
        self.properties.using_specular_map = flag(textures.metallic);
        self.properties.using_gloss_map = flag(textures.roughness);
        self.properties.using_ao_map = flag(textures.ao);
        self.textures = textures;
        self
    }

    /// Replace the constants
    pub fn with_properties(mut self, properties: MaterialProperties) -> Self {
        self.properties = properties;
        self
    }
}

impl Default for Material {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct MaterialBinding {
    pipeline: PipelineId,
    set: Option<DescriptorSetId>,
    uniform: UniformBuffer,
    last_used: u64,
}

impl MaterialBinding {
    fn release(self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        if let Some(set) = self.set {
            device.free_descriptor_set(set)?;
        }
        self.uniform.destroy(device)
    }
}

/// Per-material descriptor sets keyed by material id and owning pipeline
///
/// Entries live as long as their material keeps being drawn. A material not
/// drawn during the previous frame loses its set and uniform buffer at the
/// next [`begin_frame`](Self::begin_frame), and a full descriptor pool evicts
/// every material not drawn in the current frame before giving up.
#[derive(Debug, Default)]
pub struct MaterialCache {
    bindings: HashMap<MaterialId, MaterialBinding>,
    frame: u64,
}

impl MaterialCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached materials
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Whether `material` currently has a cached entry
    pub fn contains(&self, material: MaterialId) -> bool {
        self.bindings.contains_key(&material)
    }

    /// Advance to the next frame, releasing materials the previous frame did not draw
    ///
    /// Call once the previous frame's draws have completed. Returns the
    /// number of evicted materials.
    pub fn begin_frame(&mut self, device: &mut dyn GraphicsDevice) -> GfxResult<usize> {
        self.frame += 1;
        self.evict_unused_since(device, self.frame - 1)
    }

    /// Per-draw set of `material` for `pipeline`, built on first use or after a pipeline change
    ///
    /// Empty texture slots sample `fallback`.
    pub fn descriptor_set(
        &mut self,
        device: &mut dyn GraphicsDevice,
        material: &Material,
        pipeline: PipelineId,
        fallback: TextureRef,
    ) -> GfxResult<DescriptorSetId> {
        if let Some(binding) = self.bindings.get_mut(&material.id()) {
            binding.last_used = self.frame;
            if binding.pipeline == pipeline {
                if let Some(set) = binding.set {
                    return Ok(set);
                }
            }
        }

        match self.build(device, material, pipeline, fallback) {
            Err(err @ GfxError::DescriptorPoolExhausted { .. }) => {
                if self.evict_unused_since(device, self.frame)? == 0 {
                    return Err(err);
                }
                self.build(device, material, pipeline, fallback)
            }
            result => result,
        }
    }

    /// Forget every descriptor set without freeing it, for when their pipeline
    /// has been destroyed and took the sets with it. Uniform buffers survive.
    pub fn forget_sets(&mut self) {
        for binding in self.bindings.values_mut() {
            binding.set = None;
        }
    }

    /// Free every set and uniform buffer
    pub fn destroy(&mut self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        for (_, binding) in self.bindings.drain() {
            binding.release(device)?;
        }
        Ok(())
    }

    fn build(
        &mut self,
        device: &mut dyn GraphicsDevice,
        material: &Material,
        pipeline: PipelineId,
        fallback: TextureRef,
    ) -> GfxResult<DescriptorSetId> {
        let frame = self.frame;
        let binding = match self.bindings.entry(material.id()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let size = std::mem::size_of::<MaterialProperties>() as u64;
                entry.insert(MaterialBinding {
                    pipeline,
                    set: None,
                    uniform: UniformBuffer::create(device, size)?,
                    last_used: frame,
                })
            }
        };
        if let Some(stale) = binding.set.take() {
            device.free_descriptor_set(stale)?;
        }

        binding.uniform.set_data(device, bytemuck::bytes_of(&material.properties))?;

        let mut builder = DescriptorSetBuilder::new();
        for (slot, texture) in material.textures.slots().into_iter().enumerate() {
            builder = builder.write_image(slot as u32, texture.unwrap_or(fallback));
        }
        let set = builder
            .write_uniform(MATERIAL_UNIFORM_BINDING, &binding.uniform)
            .allocate(device, pipeline, DescriptorTier::PerDraw)?;

        binding.pipeline = pipeline;
        binding.set = Some(set);
        log::debug!("Built descriptor set for material {:?}", material.id());
        Ok(set)
    }

    fn evict_unused_since(&mut self, device: &mut dyn GraphicsDevice, frame: u64) -> GfxResult<usize> {
        let stale: Vec<MaterialId> = self
            .bindings
            .iter()
            .filter(|(_, binding)| binding.last_used < frame)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(binding) = self.bindings.remove(id) {
                binding.release(device)?;
            }
        }
        if !stale.is_empty() {
            log::debug!("Evicted {} unused material(s), {} cached", stale.len(), self.bindings.len());
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_material_properties_layout() {
        assert_eq!(std::mem::size_of::<MaterialProperties>(), 80);
        let props = MaterialProperties::default();
        assert_eq!(props.specular_colour, [0.0, 1.0, 0.0, 1.0]);
        assert_eq!(props.using_albedo_map, 1.0);
    }

    #[test]
    fn test_material_ids_unique() {
        let a = Material::new();
        let b = Material::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_with_textures_sets_flags() {
        let material = Material::new().with_textures(MaterialTextures::default());
        assert_eq!(material.properties.using_albedo_map, 0.0);
        assert_eq!(material.properties.using_normal_map, 0.0);
        let specular = MaterialProperties::default().with_workflow(Workflow::SpecularGloss);
        assert_eq!(specular.workflow, 1.0);
    }
}
