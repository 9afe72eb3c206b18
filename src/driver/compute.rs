//! Compute pipeline wrapper for the raycast and bake kernels.

use {
    super::{from_vk, read_spirv_file, Device, DriverError},
    ash::vk,
    log::warn,
    std::{ffi::CStr, ops::Deref, path::Path, sync::Arc},
};

/// A compute pipeline whose interface is a single descriptor set of
/// `storage_buffers` storage-buffer bindings plus an optional push-constant
/// block. That shape covers every kernel the engine dispatches.
pub struct ComputePipeline {
    device: Arc<Device>,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
    pub push_constant_size: u32,
}

impl ComputePipeline {
    #[profiling::function]
    pub fn create(
        device: &Arc<Device>,
        spv_path: impl AsRef<Path>,
        storage_buffers: u32,
        push_constant_size: u32,
    ) -> Result<Self, DriverError> {
        let device = Arc::clone(device);
        let spirv = read_spirv_file(spv_path)?;

        let bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> = (0..storage_buffers)
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let set_layout = unsafe {
            device
                .create_descriptor_set_layout(&set_layout_info, None)
                .map_err(from_vk)?
        };

        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .size(push_constant_size.max(4));
        let mut layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(std::slice::from_ref(&set_layout));
        if push_constant_size > 0 {
            layout_info = layout_info.push_constant_ranges(std::slice::from_ref(&push_range));
        }
        let layout = unsafe {
            device
                .create_pipeline_layout(&layout_info, None)
                .map_err(from_vk)?
        };

        let module_info = vk::ShaderModuleCreateInfo::default().code(&spirv);
        let module = unsafe {
            device
                .create_shader_module(&module_info, None)
                .map_err(from_vk)?
        };
        let entry = CStr::from_bytes_with_nul(b"main\0").map_err(|_| DriverError::InvalidData)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(entry);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);
        let pipeline = unsafe {
            device
                .create_compute_pipelines(
                    vk::PipelineCache::null(),
                    std::slice::from_ref(&pipeline_info),
                    None,
                )
                .map_err(|(_, err)| {
                    warn!("compute pipeline creation failed: {err}");
                    from_vk(err)
                })?[0]
        };
        unsafe {
            device.destroy_shader_module(module, None);
        }

        Ok(Self {
            device,
            pipeline,
            layout,
            set_layout,
            push_constant_size,
        })
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }
}

impl Deref for ComputePipeline {
    type Target = vk::Pipeline;

    fn deref(&self) -> &Self::Target {
        &self.pipeline
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
            self.device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ComputePipeline")
    }
}
