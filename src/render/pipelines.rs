//! Process-wide registry of named graphics pipelines.
//!
//! Pipelines are unique per shader pair; many materials share one pipeline
//! and differ only in textures and uniforms. GPU objects are created lazily
//! on first [`PipelineRegistry::get_pipeline`], dropped wholesale by
//! [`PipelineRegistry::invalidate_pipelines`] after a swapchain recreation
//! (registrations survive), and rebuilt transparently on the next get.

use {
    super::{def::ShadowPush, mesh::Vertex},
    crate::driver::{from_vk, read_spirv_file, Device, DriverError},
    ash::vk,
    log::{debug, info, warn},
    parking_lot::Mutex,
    std::{collections::HashMap, ffi::CStr, mem, path::PathBuf, sync::Arc, sync::OnceLock},
};

/// Color blend configuration; the default is standard alpha blending.
#[derive(Clone, Copy, Debug)]
pub struct BlendConfig {
    pub blend_enable: bool,
    pub src_color: vk::BlendFactor,
    pub dst_color: vk::BlendFactor,
    pub src_alpha: vk::BlendFactor,
    pub dst_alpha: vk::BlendFactor,
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            blend_enable: true,
            src_color: vk::BlendFactor::SRC_ALPHA,
            dst_color: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            src_alpha: vk::BlendFactor::ONE,
            dst_alpha: vk::BlendFactor::ZERO,
        }
    }
}

impl BlendConfig {
    pub fn opaque() -> Self {
        Self {
            blend_enable: false,
            ..Self::default()
        }
    }
}

/// Vertex-input shape of a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineType {
    /// 2D sprite/UI pass with vertexless instance data.
    Sprite2D,
    /// 3D mesh pass with the fixed [`Vertex`] layout.
    Mesh3D,
}

/// Created GPU objects of one registered pipeline.
#[derive(Clone, Copy, Debug)]
pub struct PipelineHandles {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

struct PipelineEntry {
    vert_path: PathBuf,
    frag_path: PathBuf,
    blend: BlendConfig,
    pipeline_type: PipelineType,
    gpu: Option<PipelineHandles>,
}

#[derive(Default)]
struct RegistryInner {
    device: Option<Arc<Device>>,
    render_pass: vk::RenderPass,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    initialized: bool,
    pipelines: HashMap<String, PipelineEntry>,
}

/// The singleton registry. Registration and lifecycle calls are restricted
/// to the render thread; the registry is quiescent during frame recording.
pub struct PipelineRegistry {
    inner: Mutex<RegistryInner>,
}

static REGISTRY: OnceLock<PipelineRegistry> = OnceLock::new();

impl PipelineRegistry {
    pub fn get() -> &'static Self {
        REGISTRY.get_or_init(|| Self {
            inner: Mutex::new(RegistryInner::default()),
        })
    }

    /// Bind the registry to a device and render pass. Re-initializing after
    /// [`Self::invalidate_pipelines`] installs the new render pass and keeps
    /// existing registrations.
    pub fn initialize(
        &self,
        device: &Arc<Device>,
        render_pass: vk::RenderPass,
        set_layouts: Vec<vk::DescriptorSetLayout>,
    ) {
        let mut inner = self.inner.lock();
        if inner.initialized {
            if inner.render_pass == vk::RenderPass::null() && render_pass != vk::RenderPass::null()
            {
                info!("pipeline registry: re-initializing with new render pass");
                inner.device = Some(Arc::clone(device));
                inner.render_pass = render_pass;
                inner.set_layouts = set_layouts;
                return;
            }
            debug!("pipeline registry: already initialized");
            return;
        }
        inner.device = Some(Arc::clone(device));
        inner.render_pass = render_pass;
        inner.set_layouts = set_layouts;
        inner.initialized = true;
    }

    /// Destroy every created pipeline and forget the registry's bindings.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        Self::destroy_gpu_objects(&mut inner);
        inner.pipelines.clear();
        inner.device = None;
        inner.render_pass = vk::RenderPass::null();
        inner.set_layouts.clear();
        inner.initialized = false;
    }

    /// Drop GPU objects but keep registrations; the render pass is now
    /// invalid and must be re-supplied through [`Self::initialize`].
    pub fn invalidate_pipelines(&self) {
        let mut inner = self.inner.lock();
        Self::destroy_gpu_objects(&mut inner);
        inner.render_pass = vk::RenderPass::null();
        debug!("pipeline registry: invalidated (registrations kept)");
    }

    fn destroy_gpu_objects(inner: &mut RegistryInner) {
        let Some(device) = inner.device.clone() else {
            for entry in inner.pipelines.values_mut() {
                entry.gpu = None;
            }
            return;
        };
        device.wait_idle();
        for entry in inner.pipelines.values_mut() {
            if let Some(handles) = entry.gpu.take() {
                unsafe {
                    device.destroy_pipeline(handles.pipeline, None);
                    device.destroy_pipeline_layout(handles.layout, None);
                }
            }
        }
    }

    /// Register (or re-register, which forces recreation) a named pipeline.
    pub fn register_pipeline(
        &self,
        name: impl Into<String>,
        vert_path: impl Into<PathBuf>,
        frag_path: impl Into<PathBuf>,
        blend: BlendConfig,
        pipeline_type: PipelineType,
    ) {
        let name = name.into();
        let mut inner = self.inner.lock();
        let device_handle = inner.device.clone();
        if let Some(existing) = inner.pipelines.get_mut(&name) {
            debug!("pipeline '{name}' re-registered");
            existing.vert_path = vert_path.into();
            existing.frag_path = frag_path.into();
            existing.blend = blend;
            existing.pipeline_type = pipeline_type;
            if let (Some(device), Some(handles)) = (device_handle, existing.gpu.take()) {
                device.wait_idle();
                unsafe {
                    device.destroy_pipeline(handles.pipeline, None);
                    device.destroy_pipeline_layout(handles.layout, None);
                }
            }
            return;
        }
        debug!("pipeline '{name}' registered");
        inner.pipelines.insert(
            name,
            PipelineEntry {
                vert_path: vert_path.into(),
                frag_path: frag_path.into(),
                blend,
                pipeline_type,
                gpu: None,
            },
        );
    }

    pub fn has_pipeline(&self, name: &str) -> bool {
        self.inner.lock().pipelines.contains_key(name)
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        self.inner.lock().pipelines.keys().cloned().collect()
    }

    /// Whether a pipeline currently holds live GPU objects (diagnostics and
    /// tests).
    pub fn is_created(&self, name: &str) -> bool {
        self.inner
            .lock()
            .pipelines
            .get(name)
            .is_some_and(|entry| entry.gpu.is_some())
    }

    /// Get (lazily creating) the GPU pipeline for `name`.
    #[profiling::function]
    pub fn get_pipeline(&self, name: &str) -> Result<PipelineHandles, DriverError> {
        let mut inner = self.inner.lock();
        if !inner.initialized {
            warn!("pipeline registry used before initialize()");
            return Err(DriverError::InvalidData);
        }
        let device = inner.device.clone().ok_or(DriverError::InvalidData)?;
        let render_pass = inner.render_pass;
        if render_pass == vk::RenderPass::null() {
            return Err(DriverError::InvalidData);
        }
        let set_layouts = inner.set_layouts.clone();

        let entry = inner
            .pipelines
            .get_mut(name)
            .ok_or(DriverError::InvalidData)?;
        if let Some(handles) = entry.gpu {
            return Ok(handles);
        }

        debug!("creating pipeline '{name}'");
        let handles = create_graphics_pipeline(
            &device,
            render_pass,
            &set_layouts,
            &entry.vert_path,
            &entry.frag_path,
            entry.blend,
            entry.pipeline_type,
        )?;
        entry.gpu = Some(handles);
        Ok(handles)
    }
}

fn create_graphics_pipeline(
    device: &Arc<Device>,
    render_pass: vk::RenderPass,
    set_layouts: &[vk::DescriptorSetLayout],
    vert_path: &std::path::Path,
    frag_path: &std::path::Path,
    blend: BlendConfig,
    pipeline_type: PipelineType,
) -> Result<PipelineHandles, DriverError> {
    let vert_spirv = read_spirv_file(vert_path)?;
    let frag_spirv = read_spirv_file(frag_path)?;

    let vert_module = unsafe {
        device
            .create_shader_module(&vk::ShaderModuleCreateInfo::default().code(&vert_spirv), None)
            .map_err(from_vk)?
    };
    let frag_module = unsafe {
        device
            .create_shader_module(&vk::ShaderModuleCreateInfo::default().code(&frag_spirv), None)
            .map_err(from_vk)?
    };

    let destroy_modules = |device: &Arc<Device>| unsafe {
        device.destroy_shader_module(vert_module, None);
        device.destroy_shader_module(frag_module, None);
    };

    let result = (|| {
        let entry =
            CStr::from_bytes_with_nul(b"main\0").map_err(|_| DriverError::InvalidData)?;
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module)
                .name(entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module)
                .name(entry),
        ];

        let binding = Vertex::binding_description();
        let attributes = Vertex::attribute_descriptions();
        let vertex_input = match pipeline_type {
            PipelineType::Mesh3D => vk::PipelineVertexInputStateCreateInfo::default()
                .vertex_binding_descriptions(std::slice::from_ref(&binding))
                .vertex_attribute_descriptions(&attributes),
            // Sprites fetch their quad from instance data in the shader.
            PipelineType::Sprite2D => vk::PipelineVertexInputStateCreateInfo::default(),
        };

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(match pipeline_type {
                PipelineType::Mesh3D => vk::CullModeFlags::BACK,
                PipelineType::Sprite2D => vk::CullModeFlags::NONE,
            })
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(pipeline_type == PipelineType::Mesh3D)
            .depth_write_enable(pipeline_type == PipelineType::Mesh3D)
            .depth_compare_op(vk::CompareOp::LESS);

        let attachment = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(blend.blend_enable)
            .src_color_blend_factor(blend.src_color)
            .dst_color_blend_factor(blend.dst_color)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(blend.src_alpha)
            .dst_alpha_blend_factor(blend.dst_alpha)
            .alpha_blend_op(vk::BlendOp::ADD);
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(std::slice::from_ref(&attachment));

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default()
            .dynamic_states(&dynamic_states);

        // The shadow variant pushes its 144-byte block; regular passes read
        // everything from the material UBO.
        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .size(mem::size_of::<ShadowPush>() as u32);
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(std::slice::from_ref(&push_range));
        let layout = unsafe {
            device
                .create_pipeline_layout(&layout_info, None)
                .map_err(from_vk)?
        };

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);
        let pipeline = unsafe {
            device
                .create_graphics_pipelines(
                    vk::PipelineCache::null(),
                    std::slice::from_ref(&pipeline_info),
                    None,
                )
                .map_err(|(_, err)| {
                    warn!("graphics pipeline creation failed: {err}");
                    unsafe { device.destroy_pipeline_layout(layout, None) };
                    from_vk(err)
                })?[0]
        };

        Ok(PipelineHandles { pipeline, layout })
    })();

    destroy_modules(device);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_bookkeeping_without_a_device() {
        let registry = PipelineRegistry::get();
        registry.register_pipeline(
            "TestPBR",
            "shaders/mesh.vert.spv",
            "shaders/mesh.frag.spv",
            BlendConfig::opaque(),
            PipelineType::Mesh3D,
        );
        assert!(registry.has_pipeline("TestPBR"));
        assert!(!registry.is_created("TestPBR"));
        assert!(registry.pipeline_names().contains(&"TestPBR".to_owned()));

        // Without initialize() lazy creation must fail, not panic.
        assert!(registry.get_pipeline("TestPBR").is_err());

        // Invalidation with no device keeps registrations.
        registry.invalidate_pipelines();
        assert!(registry.has_pipeline("TestPBR"));
    }
}
