//! Per-frame scene rendering: traversal, UBO updates, pipeline binding and
//! the descriptor cascade.

use {
    super::{
        def::{SceneUbo, ShadowPush},
        material::MaterialId,
        mesh::{Mesh, MeshRef},
        pipelines::PipelineRegistry,
        texture::Texture,
    },
    crate::{
        driver::{mesh_descriptor_set_layout, Buffer, BufferInfo, DescriptorPool, Device, DriverError},
        scene::{camera::projection, graph::SceneGraph, node::NodeRef},
    },
    ash::vk,
    glam::{Mat4, Vec3},
    log::warn,
    std::{
        collections::{HashMap, HashSet},
        mem,
        sync::Arc,
    },
};

struct FrameContext {
    view: Mat4,
    proj: Mat4,
    view_pos: Vec3,
    light_pos: Vec3,
    light_color: Vec3,
}

/// Renders a [`SceneGraph`] into an externally-owned command buffer.
///
/// Descriptor sets are created in [`SceneRenderer::prepare`], which runs
/// between frames; command recording never updates descriptors. During a
/// frame the renderer tracks the last bound pipeline and descriptor set and
/// skips redundant binds.
pub struct SceneRenderer {
    device: Arc<Device>,
    set_layout: vk::DescriptorSetLayout,
    pool: DescriptorPool,
    default_texture: Texture,
    /// One uniform buffer per material; rewritten before each draw.
    material_ubos: HashMap<MaterialId, Buffer>,
    shadow_binding: Option<(vk::ImageView, vk::Sampler)>,

    last_pipeline: Option<vk::Pipeline>,
    last_descriptor_set: Option<vk::DescriptorSet>,
    /// Distinct render errors already logged this frame, to avoid floods.
    frame_errors: HashSet<String>,
}

impl SceneRenderer {
    pub fn new(device: &Arc<Device>) -> Result<Self, DriverError> {
        let set_layout = mesh_descriptor_set_layout(device)?;
        let pool = DescriptorPool::create(device, 256)?;
        let default_texture = Texture::neutral(device)?;
        Ok(Self {
            device: Arc::clone(device),
            set_layout,
            pool,
            default_texture,
            material_ubos: HashMap::new(),
            shadow_binding: None,
            last_pipeline: None,
            last_descriptor_set: None,
            frame_errors: HashSet::new(),
        })
    }

    /// Layout shared with the pipeline registry.
    pub fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    /// Shadow cube-map bound at binding 5 of materials with no baked
    /// lightmap.
    pub fn set_shadow_binding(&mut self, view: vk::ImageView, sampler: vk::Sampler) {
        self.shadow_binding = Some((view, sampler));
    }

    fn log_once(&mut self, message: String) {
        if self.frame_errors.insert(message.clone()) {
            warn!("{message}");
        }
    }

    /// Upload pending meshes and build missing material descriptor sets.
    /// Runs at scene-set time and between frames, never during recording.
    #[profiling::function]
    pub fn prepare(&mut self, scene: &SceneGraph) -> Result<(), DriverError> {
        let mut meshes: Vec<MeshRef> = Vec::new();
        scene.for_every_node(|node| {
            meshes.extend(node.borrow().meshes().iter().cloned());
        });

        for mesh_ref in &meshes {
            let mut mesh = mesh_ref.lock();
            if !mesh.is_finalized() && mesh.vertex_count() > 0 && mesh.triangle_count() > 0 {
                mesh.finalize(&self.device)?;
            }

            let Some(material_ref) = mesh.material().cloned() else {
                continue;
            };
            drop(mesh);

            let mut material = material_ref.lock();
            if !self.material_ubos.contains_key(&material.id()) {
                let buffer = Buffer::create(
                    &self.device,
                    BufferInfo::host(
                        mem::size_of::<SceneUbo>() as vk::DeviceSize,
                        vk::BufferUsageFlags::UNIFORM_BUFFER,
                    ),
                )?;
                self.material_ubos.insert(material.id(), buffer);
            }
            let ubo = self
                .material_ubos
                .get(&material.id())
                .ok_or(DriverError::InvalidData)?;

            let (shadow_view, shadow_sampler) = match self.shadow_binding {
                Some((view, sampler)) => (Some(view), Some(sampler)),
                None => (None, None),
            };
            material.create_descriptor_set(
                &self.device,
                &self.pool,
                self.set_layout,
                &self.default_texture,
                **ubo,
                mem::size_of::<SceneUbo>() as vk::DeviceSize,
                shadow_view,
                shadow_sampler,
            )?;
        }
        Ok(())
    }

    /// Record draws for the whole scene. The caller has already begun the
    /// render pass on `cmd`.
    #[profiling::function]
    pub fn render_scene(
        &mut self,
        cmd: vk::CommandBuffer,
        scene: &SceneGraph,
        width: u32,
        height: u32,
    ) {
        self.last_pipeline = None;
        self.last_descriptor_set = None;
        self.frame_errors.clear();

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D { width, height },
        };
        unsafe {
            self.device.cmd_set_viewport(cmd, 0, std::slice::from_ref(&viewport));
            self.device.cmd_set_scissor(cmd, 0, std::slice::from_ref(&scissor));
        }

        let (view, view_pos) = match scene.current_camera() {
            Some(camera) => {
                let camera = camera.borrow();
                (camera.world_matrix(), camera.world_position())
            }
            None => (Mat4::IDENTITY, Vec3::ZERO),
        };
        let light_pos = scene.light_position();
        let light_color = scene
            .lights()
            .first()
            .and_then(|light| light.borrow().light().map(|l| l.color))
            .unwrap_or(Vec3::ONE);
        let frame = FrameContext {
            view,
            proj: projection(width, height),
            view_pos,
            light_pos,
            light_color,
        };

        let mut draw_list: Vec<(NodeRef, MeshRef, Mat4)> = Vec::new();
        scene.for_every_node(|node| {
            let borrowed = node.borrow();
            if !borrowed.has_meshes() {
                return;
            }
            let model = borrowed.base_world_matrix();
            for mesh in borrowed.meshes() {
                draw_list.push((node.clone(), mesh.clone(), model));
            }
        });

        for (_node, mesh, model) in draw_list {
            self.draw_mesh(cmd, &mesh, model, &frame);
        }
    }

    /// Record one mesh into the shadow pass: push the 144-byte block
    /// (light-space matrix, model, light position + far plane) and draw.
    /// The caller has begun the shadow render pass and bound its pipeline.
    pub fn record_shadow_draw(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        mesh: &Mesh,
        push: &ShadowPush,
    ) {
        if !mesh.is_valid() {
            return;
        }
        unsafe {
            self.device.cmd_push_constants(
                cmd,
                layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                bytemuck::bytes_of(push),
            );
            mesh.bind(&self.device, cmd);
            self.device
                .cmd_draw_indexed(cmd, mesh.index_count() as u32, 1, 0, 0, 0);
        }
    }

    fn draw_mesh(&mut self, cmd: vk::CommandBuffer, mesh_ref: &MeshRef, model: Mat4, frame: &FrameContext) {
        let mesh = mesh_ref.lock();
        if !mesh.is_valid() {
            let name = mesh.name().to_owned();
            drop(mesh);
            self.log_once(format!("mesh '{name}' not finalized; skipping"));
            return;
        }
        let Some(material_ref) = mesh.material().cloned() else {
            let name = mesh.name().to_owned();
            drop(mesh);
            self.log_once(format!("mesh '{name}' has no material; skipping"));
            return;
        };
        let material = material_ref.lock();

        let handles = match PipelineRegistry::get().get_pipeline(material.pipeline_name()) {
            Ok(handles) => handles,
            Err(err) => {
                let pipeline = material.pipeline_name().to_owned();
                drop(material);
                drop(mesh);
                self.log_once(format!("pipeline '{pipeline}' unavailable: {err}"));
                return;
            }
        };

        let Some(set) = material.descriptor_set() else {
            let name = material.name().to_owned();
            drop(material);
            drop(mesh);
            self.log_once(format!("material '{name}' has no descriptor set; skipping"));
            return;
        };

        // Per-draw uniform update. One UBO per material: meshes sharing a
        // material also share the most recent model matrix this frame.
        if let Some(ubo) = self.material_ubos.get_mut(&material.id()) {
            let data = SceneUbo {
                model: model.to_cols_array(),
                view: frame.view.to_cols_array(),
                proj: frame.proj.to_cols_array(),
                view_pos: frame.view_pos.to_array(),
                light_pos: frame.light_pos.to_array(),
                light_color: frame.light_color.to_array(),
                ..Default::default()
            };
            if let Err(err) = ubo.write(0, bytemuck::bytes_of(&data)) {
                drop(material);
                drop(mesh);
                self.log_once(format!("uniform write failed: {err}"));
                return;
            }
        }

        unsafe {
            if self.last_pipeline != Some(handles.pipeline) {
                self.device
                    .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, handles.pipeline);
                self.last_pipeline = Some(handles.pipeline);
            }
            if self.last_descriptor_set != Some(set) {
                self.device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    handles.layout,
                    0,
                    std::slice::from_ref(&set),
                    &[],
                );
                self.last_descriptor_set = Some(set);
            }

            mesh.bind(&self.device, cmd);
            self.device
                .cmd_draw_indexed(cmd, mesh.index_count() as u32, 1, 0, 0, 0);
        }
    }
}

impl std::fmt::Debug for SceneRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneRenderer")
            .field("material_ubos", &self.material_ubos.len())
            .finish_non_exhaustive()
    }
}

impl Drop for SceneRenderer {
    fn drop(&mut self) {
        self.device.wait_idle();
        unsafe {
            self.device
                .destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}
