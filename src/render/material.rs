//! Materials: a shared pipeline reference plus per-material textures and
//! descriptor set.
//!
//! Multiple meshes can share one material; materials with the same pipeline
//! batch together during rendering. The descriptor set is created in the
//! renderer's prepare step and dropped whenever a texture changes.

use {
    super::texture::Texture,
    crate::driver::{DescriptorPool, Device, DriverError},
    ash::vk,
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    },
};

/// Standard texture slot names.
pub const SLOT_ALBEDO: &str = "albedo";
pub const SLOT_NORMAL: &str = "normal";
pub const SLOT_METALLIC: &str = "metallic";
pub const SLOT_ROUGHNESS: &str = "roughness";
pub const SLOT_AO: &str = "ao";
pub const SLOT_EMISSIVE: &str = "emissive";
/// Binding 5; the lightmap baker writes baked output here.
pub const SLOT_REFRACTION: &str = "refraction";

/// Process-unique material identity; the renderer keys per-material uniform
/// buffers by it.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct MaterialId(pub u64);

fn next_material_id() -> MaterialId {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    MaterialId(COUNTER.fetch_add(1, Ordering::Relaxed))
}

pub struct Material {
    name: String,
    id: MaterialId,
    pipeline_name: String,
    textures: HashMap<String, Arc<Texture>>,
    descriptor_set: Option<vk::DescriptorSet>,
}

impl Material {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: next_material_id(),
            pipeline_name: String::new(),
            textures: HashMap::new(),
            descriptor_set: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> MaterialId {
        self.id
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    pub fn set_pipeline(&mut self, pipeline_name: impl Into<String>) {
        self.pipeline_name = pipeline_name.into();
    }

    // ------------------------------------------------------------ textures

    pub fn set_texture(&mut self, slot: impl Into<String>, texture: Arc<Texture>) {
        self.textures.insert(slot.into(), texture);
        // The set references the old image view; rebuild before next draw.
        self.invalidate_descriptor_set();
    }

    pub fn texture(&self, slot: &str) -> Option<&Arc<Texture>> {
        self.textures.get(slot)
    }

    pub fn has_texture(&self, slot: &str) -> bool {
        self.textures.contains_key(slot)
    }

    pub fn remove_texture(&mut self, slot: &str) {
        if self.textures.remove(slot).is_some() {
            self.invalidate_descriptor_set();
        }
    }

    pub fn textures(&self) -> &HashMap<String, Arc<Texture>> {
        &self.textures
    }

    pub fn set_albedo(&mut self, texture: Arc<Texture>) {
        self.set_texture(SLOT_ALBEDO, texture);
    }

    pub fn set_normal(&mut self, texture: Arc<Texture>) {
        self.set_texture(SLOT_NORMAL, texture);
    }

    pub fn set_metallic(&mut self, texture: Arc<Texture>) {
        self.set_texture(SLOT_METALLIC, texture);
    }

    pub fn set_roughness(&mut self, texture: Arc<Texture>) {
        self.set_texture(SLOT_ROUGHNESS, texture);
    }

    pub fn set_ao(&mut self, texture: Arc<Texture>) {
        self.set_texture(SLOT_AO, texture);
    }

    pub fn set_emissive(&mut self, texture: Arc<Texture>) {
        self.set_texture(SLOT_EMISSIVE, texture);
    }

    /// Baked lightmap output lands in the refraction slot (binding 5).
    pub fn set_refraction(&mut self, texture: Arc<Texture>) {
        self.set_texture(SLOT_REFRACTION, texture);
    }

    // ------------------------------------------------------------ GPU set

    pub fn descriptor_set(&self) -> Option<vk::DescriptorSet> {
        self.descriptor_set
    }

    /// Drop the set; it is rebuilt before the next draw.
    pub fn invalidate_descriptor_set(&mut self) {
        self.descriptor_set = None;
    }

    /// Allocate and write the material's descriptor set: UBO at binding 0,
    /// PBR samplers at 1..=4, shadow cube map or baked lightmap at 5.
    /// Missing slots substitute `default_texture`. Calling this while a set
    /// already exists is a no-op.
    #[allow(clippy::too_many_arguments)]
    #[profiling::function]
    pub fn create_descriptor_set(
        &mut self,
        device: &Arc<Device>,
        pool: &DescriptorPool,
        layout: vk::DescriptorSetLayout,
        default_texture: &Texture,
        ubo_buffer: vk::Buffer,
        ubo_size: vk::DeviceSize,
        shadow_view: Option<vk::ImageView>,
        shadow_sampler: Option<vk::Sampler>,
    ) -> Result<(), DriverError> {
        if self.descriptor_set.is_some() {
            return Ok(());
        }

        let set = pool.allocate(layout)?;

        let buffer_info = vk::DescriptorBufferInfo {
            buffer: ubo_buffer,
            offset: 0,
            range: ubo_size,
        };

        let default_view = default_texture.view().ok_or(DriverError::InvalidData)?;
        let default_sampler = default_texture.sampler().ok_or(DriverError::InvalidData)?;
        let image_info = |texture: Option<&Arc<Texture>>| {
            let (view, sampler) = texture
                .and_then(|t| Some((t.view()?, t.sampler()?)))
                .unwrap_or((default_view, default_sampler));
            vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }
        };

        // Each write needs its own image info; they must all stay alive
        // until update_descriptor_sets returns.
        let albedo = image_info(self.texture(SLOT_ALBEDO));
        let normal = image_info(self.texture(SLOT_NORMAL));
        let metallic = image_info(self.texture(SLOT_METALLIC));
        let roughness = image_info(self.texture(SLOT_ROUGHNESS));
        let binding5 = match self.texture(SLOT_REFRACTION) {
            Some(lightmap) => image_info(Some(lightmap)),
            None => match (shadow_view, shadow_sampler) {
                (Some(view), Some(sampler)) => vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
                _ => image_info(None),
            },
        };

        let image_write = |binding: u32, info: &vk::DescriptorImageInfo| {
            vk::WriteDescriptorSet {
                dst_set: set,
                dst_binding: binding,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                p_image_info: info,
                ..Default::default()
            }
        };
        let writes = [
            vk::WriteDescriptorSet {
                dst_set: set,
                dst_binding: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: &buffer_info,
                ..Default::default()
            },
            image_write(1, &albedo),
            image_write(2, &normal),
            image_write(3, &metallic),
            image_write(4, &roughness),
            image_write(5, &binding5),
        ];
        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }

        self.descriptor_set = Some(set);
        Ok(())
    }
}

impl std::fmt::Debug for Material {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Material")
            .field("name", &self.name)
            .field("pipeline", &self.pipeline_name)
            .field("textures", &self.textures.len())
            .field("has_descriptor_set", &self.descriptor_set.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_change_invalidates_descriptor_set() {
        let mut material = Material::new("stone");
        material.set_pipeline("PBR");
        assert!(material.descriptor_set().is_none());

        // Simulate a live set, then poke a texture.
        material.descriptor_set = Some(vk::DescriptorSet::null());
        material.set_albedo(Arc::new(Texture::placeholder("albedo", 4, 4)));
        assert!(material.descriptor_set().is_none());
    }

    #[test]
    fn removing_an_absent_slot_keeps_the_set() {
        let mut material = Material::new("stone");
        material.descriptor_set = Some(vk::DescriptorSet::null());
        material.remove_texture(SLOT_AO);
        assert!(material.descriptor_set().is_some());
    }

    #[test]
    fn slot_helpers_round_trip() {
        let mut material = Material::new("stone");
        let texture = Arc::new(Texture::placeholder("n", 1, 1));
        material.set_normal(Arc::clone(&texture));
        assert!(material.has_texture(SLOT_NORMAL));
        assert!(!material.has_texture(SLOT_EMISSIVE));
        assert_eq!(material.texture(SLOT_NORMAL).map(|t| t.name()), Some("n"));
    }
}
