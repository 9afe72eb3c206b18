//! Descriptor pool and the shared 3D mesh set layout.

use {
    super::{from_vk, Device, DriverError},
    ash::vk,
    std::{ops::Deref, sync::Arc},
};

/// Set layout of the 3D mesh pass, one set per material:
///
/// | binding | kind                   | stage             |
/// |---------|------------------------|-------------------|
/// | 0       | uniform buffer         | vertex + fragment |
/// | 1..=4   | combined image sampler | fragment          |
/// | 5       | combined image sampler | fragment (shadow cube or lightmap) |
pub fn mesh_descriptor_set_layout(
    device: &Arc<Device>,
) -> Result<vk::DescriptorSetLayout, DriverError> {
    let mut bindings = vec![vk::DescriptorSetLayoutBinding::default()
        .binding(0)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)];
    for binding in 1..=5u32 {
        bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
        );
    }
    let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    unsafe {
        device
            .create_descriptor_set_layout(&info, None)
            .map_err(from_vk)
    }
}

/// A fixed-capacity descriptor pool. Sets are allocated per material and
/// returned wholesale on reset; the render layer never frees single sets.
pub struct DescriptorPool {
    device: Arc<Device>,
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    pub fn create(device: &Arc<Device>, max_sets: u32) -> Result<Self, DriverError> {
        let sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: max_sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: max_sets * 6,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: max_sets * 4,
            },
        ];
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(&sizes);
        let pool = unsafe {
            device
                .create_descriptor_pool(&info, None)
                .map_err(from_vk)?
        };
        Ok(Self {
            device: Arc::clone(device),
            pool,
        })
    }

    pub fn allocate(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, DriverError> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        let sets = unsafe {
            self.device
                .allocate_descriptor_sets(&info)
                .map_err(from_vk)?
        };
        sets.first().copied().ok_or(DriverError::OutOfMemory)
    }

    pub fn free(&self, set: vk::DescriptorSet) {
        unsafe {
            let _ = self
                .device
                .free_descriptor_sets(self.pool, std::slice::from_ref(&set));
        }
    }
}

impl Deref for DescriptorPool {
    type Target = vk::DescriptorPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DescriptorPool")
    }
}
