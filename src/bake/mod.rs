//! Static lightmap baking: UV atlas, texel rasterization, direct lighting
//! with shadow rays, optional multi-bounce GI, and texture packing.

pub mod atlas;

pub use atlas::{generate_uv2, AtlasError, AtlasSettings};

use {
    crate::{
        driver::{Buffer, BufferInfo, ComputePipeline, DescriptorPool, Device, DriverError},
        raycast::Raycaster,
        render::{
            material::SLOT_REFRACTION,
            mesh::MeshRef,
            texture::Texture,
        },
        scene::graph::SceneGraph,
    },
    ash::vk,
    bytemuck::{Pod, Zeroable},
    glam::{Mat3, Mat4, Vec2, Vec3},
    log::{debug, info, warn},
    rand::Rng,
    rayon::prelude::*,
    serde::Deserialize,
    std::{path::Path, sync::Arc},
    thiserror::Error,
};

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct BakeSettings {
    /// Per-mesh lightmap resolution.
    pub resolution: u32,
    /// Shadow rays per texel-light pair for soft shadows.
    pub shadow_samples: u32,
    pub gi_bounces: u32,
    /// Hemisphere samples per texel per bounce.
    pub gi_samples: u32,
    pub gi_intensity: f32,
    pub enable_shadows: bool,
    pub enable_gi: bool,
    /// Prefer the GPU kernel when one is attached; failures fall back to
    /// the CPU for that stage.
    pub use_gpu: bool,
}

impl Default for BakeSettings {
    fn default() -> Self {
        Self {
            resolution: 256,
            shadow_samples: 16,
            gi_bounces: 3,
            gi_samples: 64,
            gi_intensity: 1.0,
            enable_shadows: true,
            enable_gi: true,
            use_gpu: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum BakeError {
    #[error("no lights in scene")]
    NoLights,

    #[error("no meshes in scene")]
    NoMeshes,

    #[error("UV generation failed: {0}")]
    UvGenerationFailed(#[from] AtlasError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// A texel in the lightmap with its world-space data; transient during a
/// bake only.
#[derive(Clone, Copy, Debug, Default)]
pub struct LightmapTexel {
    pub world_pos: Vec3,
    pub world_normal: Vec3,
    pub valid: bool,
    pub triangle_index: i32,
    pub barycentrics: Vec2,
}

/// Result of baking one mesh.
#[derive(Clone, Debug)]
pub struct BakedLightmap {
    pub pixels: Vec<Vec3>,
    pub width: u32,
    pub height: u32,
    pub mesh_name: String,
}

#[derive(Clone, Copy, Debug)]
struct LightSample {
    position: Vec3,
    color: Vec3,
    range: f32,
}

struct MeshInstance {
    mesh: MeshRef,
    world: Mat4,
}

/// Flat-packed GPU records, 16-byte aligned.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct GpuTexel {
    pos: [f32; 4],
    normal: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct GpuLight {
    /// xyz position, w = range.
    pos_range: [f32; 4],
    color: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct BakePush {
    texel_count: u32,
    light_count: u32,
    triangle_count: u32,
    enable_shadows: u32,
}

struct GpuBaker {
    device: Arc<Device>,
    pipeline: ComputePipeline,
    pool: DescriptorPool,
}

pub type ProgressCallback<'a> = dyn FnMut(f32, &str) + 'a;

/// Bakes lightmaps for every mesh instance in a scene. Owns its own
/// raycaster so shadow-ray caches stay warm across meshes within one bake.
pub struct LightmapBaker {
    raycaster: Raycaster,
    baked: Vec<BakedLightmap>,
    gpu: Option<GpuBaker>,
}

impl LightmapBaker {
    pub fn new() -> Self {
        Self {
            raycaster: Raycaster::new(),
            baked: Vec::new(),
            gpu: None,
        }
    }

    /// Attach the direct-lighting compute kernel. Optional; every stage has
    /// a CPU implementation.
    pub fn enable_gpu(
        &mut self,
        device: &Arc<Device>,
        kernel_spv: impl AsRef<Path>,
    ) -> Result<(), DriverError> {
        let pipeline = ComputePipeline::create(
            device,
            kernel_spv,
            4,
            std::mem::size_of::<BakePush>() as u32,
        )?;
        let pool = DescriptorPool::create(device, 8)?;
        self.gpu = Some(GpuBaker {
            device: Arc::clone(device),
            pipeline,
            pool,
        });
        Ok(())
    }

    pub fn is_gpu_available(&self) -> bool {
        self.gpu.is_some()
    }

    pub fn baked_lightmaps(&self) -> &[BakedLightmap] {
        &self.baked
    }

    /// Bake every mesh in the scene. `device` is used for re-uploading
    /// atlas-split meshes and for building the final lightmap textures;
    /// without one the bake still runs and results stay CPU-side in
    /// [`Self::baked_lightmaps`].
    ///
    /// The progress callback runs synchronously on the calling thread and
    /// may pump an external event loop.
    #[profiling::function]
    pub fn bake(
        &mut self,
        device: Option<&Arc<Device>>,
        scene: &SceneGraph,
        settings: &BakeSettings,
        mut progress: Option<&mut ProgressCallback<'_>>,
    ) -> Result<(), BakeError> {
        self.baked.clear();

        let mut report = |fraction: f32, status: &str| {
            if let Some(callback) = progress.as_mut() {
                callback(fraction, status);
            }
        };
        report(0.0, "Collecting scene data...");

        let lights = collect_lights(scene);
        let instances = collect_meshes(scene);
        info!(
            "bake: {} light(s), {} mesh instance(s)",
            lights.len(),
            instances.len()
        );
        if lights.is_empty() {
            return Err(BakeError::NoLights);
        }
        if instances.is_empty() {
            return Err(BakeError::NoMeshes);
        }

        let progress_per_mesh = 0.9 / instances.len() as f32;
        let mut current = 0.05f32;

        for (index, instance) in instances.iter().enumerate() {
            let mesh_name = instance.mesh.lock().name().to_owned();
            report(
                current,
                &format!("Baking mesh: {mesh_name} ({}/{})", index + 1, instances.len()),
            );

            // Step 1: lightmap UVs, re-uploading buffers when the atlas
            // split seams.
            {
                let mut mesh = instance.mesh.lock();
                if !mesh.has_uv2() {
                    generate_uv2(
                        &mut mesh,
                        settings.resolution,
                        &AtlasSettings::default(),
                        None,
                    )?;
                    if let Some(device) = device {
                        mesh.finalize(device)?;
                    }
                }
            }

            // Step 2: texel rasterization.
            let texels = {
                let mesh = instance.mesh.lock();
                rasterize(&mesh, instance.world, settings.resolution)
            };
            let valid = texels.iter().filter(|t| t.valid).count();
            debug!("bake: '{mesh_name}' rasterized, {valid} valid texels");

            // Step 3: direct lighting, GPU first when requested.
            let mut lighting = vec![Vec3::ZERO; texels.len()];
            let mut gpu_done = false;
            if settings.use_gpu && self.gpu.is_some() {
                report(current, &format!("Baking {mesh_name} (GPU)..."));
                match self.direct_lighting_gpu(&texels, &lights, &instances, settings) {
                    Ok(result) => {
                        lighting = result;
                        gpu_done = true;
                    }
                    Err(err) => {
                        warn!("bake: GPU direct lighting failed ({err}), using CPU");
                    }
                }
            }
            if !gpu_done {
                report(current, &format!("Baking {mesh_name} (CPU)..."));
                self.direct_lighting_cpu(&texels, &lights, &instances, settings, &mut lighting);
            }

            // Step 4: bounced GI.
            if settings.enable_gi && settings.gi_bounces > 0 {
                report(current, &format!("Baking GI ({mesh_name})..."));
                self.global_illumination(&texels, &instances, settings, &mut lighting);
            }

            let baked = BakedLightmap {
                pixels: lighting,
                width: settings.resolution,
                height: settings.resolution,
                mesh_name: mesh_name.clone(),
            };

            // Step 5: pack and bind.
            if let Some(device) = device {
                match build_lightmap_texture(device, &baked) {
                    Ok(texture) => {
                        let texture = Arc::new(texture);
                        let mut mesh = instance.mesh.lock();
                        mesh.set_lightmap(Arc::clone(&texture));
                        if let Some(material) = mesh.material().cloned() {
                            drop(mesh);
                            let mut material = material.lock();
                            material.set_texture(SLOT_REFRACTION, texture);
                            material.invalidate_descriptor_set();
                        }
                    }
                    Err(err) => warn!("bake: lightmap texture upload failed: {err}"),
                }
            }

            self.baked.push(baked);
            current += progress_per_mesh;
        }

        report(1.0, "Baking complete!");
        info!("bake: complete, {} lightmap(s)", self.baked.len());
        Ok(())
    }

    // ------------------------------------------------------------ lighting

    fn direct_lighting_cpu(
        &self,
        texels: &[LightmapTexel],
        lights: &[LightSample],
        instances: &[MeshInstance],
        settings: &BakeSettings,
        lighting: &mut [Vec3],
    ) {
        texels
            .par_iter()
            .zip(lighting.par_iter_mut())
            .for_each(|(texel, out)| {
                if !texel.valid {
                    return;
                }
                let mut total = Vec3::ZERO;
                for light in lights {
                    total += self.shade_texel(texel, light, instances, settings);
                }
                *out = total;
            });
    }

    fn shade_texel(
        &self,
        texel: &LightmapTexel,
        light: &LightSample,
        instances: &[MeshInstance],
        settings: &BakeSettings,
    ) -> Vec3 {
        let to_light = light.position - texel.world_pos;
        let distance = to_light.length();
        if light.range > 0.0 && distance > light.range {
            return Vec3::ZERO;
        }
        if distance < 1e-6 {
            return Vec3::ZERO;
        }
        let light_dir = to_light / distance;

        let n_dot_l = texel.world_normal.dot(light_dir).max(0.0);
        if n_dot_l <= 0.0 {
            return Vec3::ZERO;
        }

        let attenuation = 1.0 / (distance * distance + 0.001);
        let range_factor = if light.range > 0.0 {
            (1.0 - distance / light.range).max(0.0)
        } else {
            1.0
        };

        let shadow = if settings.enable_shadows {
            let origin = texel.world_pos + texel.world_normal * 0.01;
            let samples = settings.shadow_samples.max(1);
            let mut lit = 0u32;
            let mut rng = rand::thread_rng();
            for sample in 0..samples {
                // First ray is exact; the rest jitter the light position for
                // soft penumbrae.
                let target = if sample == 0 {
                    light.position
                } else {
                    light.position
                        + Vec3::new(
                            rng.gen_range(-0.05..0.05),
                            rng.gen_range(-0.05..0.05),
                            rng.gen_range(-0.05..0.05),
                        )
                };
                if !self.segment_occluded(origin, target, instances) {
                    lit += 1;
                }
            }
            lit as f32 / samples as f32
        } else {
            1.0
        };

        light.color * n_dot_l * attenuation * range_factor * shadow
    }

    fn segment_occluded(&self, from: Vec3, to: Vec3, instances: &[MeshInstance]) -> bool {
        let span = (to - from).length();
        for instance in instances {
            let mesh = instance.mesh.lock();
            let result = self.raycaster.cast(instance.world, from, to, &mesh);
            if result.hit && result.distance > 0.001 && result.distance < span {
                return true;
            }
        }
        false
    }

    fn global_illumination(
        &self,
        texels: &[LightmapTexel],
        instances: &[MeshInstance],
        settings: &BakeSettings,
        lighting: &mut [Vec3],
    ) {
        let trace_distance = 10.0f32;
        let mut incoming: Vec<Vec3> = lighting.to_vec();

        for bounce in 0..settings.gi_bounces {
            debug!("bake: GI bounce {}", bounce + 1);
            let bounce_light: Vec<Vec3> = texels
                .par_iter()
                .enumerate()
                .map(|(index, texel)| {
                    if !texel.valid {
                        return Vec3::ZERO;
                    }
                    let mut rng = rand::thread_rng();
                    let mut indirect = Vec3::ZERO;
                    let samples = settings.gi_samples.max(1);
                    for _ in 0..samples {
                        let dir = sample_hemisphere(
                            texel.world_normal,
                            rng.gen_range(0.0..1.0),
                            rng.gen_range(0.0..1.0),
                        );
                        let origin = texel.world_pos + texel.world_normal * 0.01;
                        let end = origin + dir * trace_distance;
                        if self.segment_occluded(origin, end, instances) {
                            let n_dot_l = texel.world_normal.dot(dir).max(0.0);
                            indirect += incoming[index] * n_dot_l / samples as f32;
                        }
                    }
                    indirect * settings.gi_intensity
                })
                .collect();

            for (out, bounce_contribution) in lighting.iter_mut().zip(&bounce_light) {
                *out += *bounce_contribution;
            }
            incoming = bounce_light;
        }
    }

    fn direct_lighting_gpu(
        &mut self,
        texels: &[LightmapTexel],
        lights: &[LightSample],
        instances: &[MeshInstance],
        settings: &BakeSettings,
    ) -> Result<Vec<Vec3>, DriverError> {
        let gpu = self.gpu.as_mut().ok_or(DriverError::InvalidData)?;

        let gpu_texels: Vec<GpuTexel> = texels
            .iter()
            .map(|texel| GpuTexel {
                pos: texel
                    .world_pos
                    .extend(if texel.valid { 1.0 } else { 0.0 })
                    .to_array(),
                normal: texel.world_normal.extend(0.0).to_array(),
            })
            .collect();
        let gpu_lights: Vec<GpuLight> = lights
            .iter()
            .map(|light| GpuLight {
                pos_range: light.position.extend(light.range).to_array(),
                color: light.color.extend(1.0).to_array(),
            })
            .collect();

        // Flat world-space triangle list for in-kernel shadow rays.
        let mut triangles: Vec<[f32; 4]> = Vec::new();
        for instance in instances {
            let mesh = instance.mesh.lock();
            let vertices = mesh.vertices();
            for tri in mesh.triangles() {
                for index in [tri.v0, tri.v1, tri.v2] {
                    let local = vertices
                        .get(index as usize)
                        .map(|v| v.position)
                        .unwrap_or(Vec3::ZERO);
                    triangles.push(instance.world.transform_point3(local).extend(0.0).to_array());
                }
            }
        }

        let make_buffer = |bytes: &[u8]| -> Result<Buffer, DriverError> {
            let mut buffer = Buffer::create(
                &gpu.device,
                BufferInfo::host(
                    bytes.len().max(16) as vk::DeviceSize,
                    vk::BufferUsageFlags::STORAGE_BUFFER,
                ),
            )?;
            buffer.write(0, bytes)?;
            Ok(buffer)
        };
        let texel_buffer = make_buffer(bytemuck::cast_slice(&gpu_texels))?;
        let light_buffer = make_buffer(bytemuck::cast_slice(&gpu_lights))?;
        let triangle_buffer = make_buffer(bytemuck::cast_slice(&triangles))?;
        let mut output_buffer = Buffer::create(
            &gpu.device,
            BufferInfo::host(
                (texels.len().max(1) * 16) as vk::DeviceSize,
                vk::BufferUsageFlags::STORAGE_BUFFER,
            ),
        )?;

        let set = gpu.pool.allocate(gpu.pipeline.set_layout())?;
        let infos = [
            vk::DescriptorBufferInfo {
                buffer: *texel_buffer,
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
            vk::DescriptorBufferInfo {
                buffer: *light_buffer,
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
            vk::DescriptorBufferInfo {
                buffer: *triangle_buffer,
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
            vk::DescriptorBufferInfo {
                buffer: *output_buffer,
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
        ];
        let writes: Vec<vk::WriteDescriptorSet<'_>> = infos
            .iter()
            .enumerate()
            .map(|(binding, info)| vk::WriteDescriptorSet {
                dst_set: set,
                dst_binding: binding as u32,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                p_buffer_info: info,
                ..Default::default()
            })
            .collect();
        unsafe {
            gpu.device.update_descriptor_sets(&writes, &[]);
        }

        let push = BakePush {
            texel_count: texels.len() as u32,
            light_count: lights.len() as u32,
            triangle_count: (triangles.len() / 3) as u32,
            enable_shadows: settings.enable_shadows as u32,
        };
        let pipeline = *gpu.pipeline;
        let layout = gpu.pipeline.layout();
        let groups = (texels.len() as u32).div_ceil(64).max(1);
        let submit = gpu.device.execute_one_shot(|raw, cmd| unsafe {
            raw.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline);
            raw.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                layout,
                0,
                std::slice::from_ref(&set),
                &[],
            );
            raw.cmd_push_constants(
                cmd,
                layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&push),
            );
            raw.cmd_dispatch(cmd, groups, 1, 1);
        });
        gpu.pool.free(set);
        submit?;

        let bytes = output_buffer.read(0, texels.len() * 16)?;
        let raw: &[[f32; 4]] = bytemuck::cast_slice(&bytes);
        Ok(raw.iter().map(|v| Vec3::new(v[0], v[1], v[2])).collect())
    }
}

impl Default for LightmapBaker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LightmapBaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightmapBaker")
            .field("baked", &self.baked.len())
            .field("gpu", &self.gpu.is_some())
            .finish()
    }
}

// --------------------------------------------------------------- collection

fn collect_lights(scene: &SceneGraph) -> Vec<LightSample> {
    let mut lights = Vec::new();
    scene.for_every_node(|node| {
        let borrowed = node.borrow();
        if let Some(light) = borrowed.light() {
            // Only point lights participate in baking.
            if light.light_type == crate::scene::light::LightType::Point {
                lights.push(LightSample {
                    position: borrowed.world_position(),
                    color: light.color,
                    range: light.range,
                });
            }
        }
    });
    lights
}

fn collect_meshes(scene: &SceneGraph) -> Vec<MeshInstance> {
    let mut instances = Vec::new();
    scene.for_every_node(|node| {
        let borrowed = node.borrow();
        let world = borrowed.base_world_matrix();
        for mesh in borrowed.meshes() {
            instances.push(MeshInstance {
                mesh: mesh.clone(),
                world,
            });
        }
    });
    instances
}

// ------------------------------------------------------------ rasterization

/// Rasterize a mesh's UV2 charts into a texel grid: every pixel whose center
/// lies inside a triangle gets barycentric-interpolated world position and
/// normal.
fn rasterize(mesh: &crate::render::Mesh, world: Mat4, resolution: u32) -> Vec<LightmapTexel> {
    let size = resolution as usize;
    let mut texels = vec![LightmapTexel::default(); size * size];

    let vertices = mesh.vertices();
    let normal_matrix = Mat3::from_mat4(world).inverse().transpose();

    for (tri_index, tri) in mesh.triangles().iter().enumerate() {
        let indices = [tri.v0 as usize, tri.v1 as usize, tri.v2 as usize];
        if indices.iter().any(|&i| i >= vertices.len()) {
            continue;
        }
        let [v0, v1, v2] = indices.map(|i| &vertices[i]);

        let p0 = v0.uv2 * resolution as f32;
        let p1 = v1.uv2 * resolution as f32;
        let p2 = v2.uv2 * resolution as f32;

        let edge = |a: Vec2, b: Vec2, c: Vec2| (c.x - a.x) * (b.y - a.y) - (c.y - a.y) * (b.x - a.x);
        let area = edge(p0, p1, p2);
        if area.abs() < 1e-4 {
            continue;
        }

        let min_x = (p0.x.min(p1.x).min(p2.x).floor().max(0.0)) as usize;
        let max_x = (p0.x.max(p1.x).max(p2.x).ceil() as usize).min(size.saturating_sub(1));
        let min_y = (p0.y.min(p1.y).min(p2.y).floor().max(0.0)) as usize;
        let max_y = (p0.y.max(p1.y).max(p2.y).ceil() as usize).min(size.saturating_sub(1));

        for y in min_y..=max_y {
            for x in min_x..=max_x {
                let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                let w0 = edge(p1, p2, p) / area;
                let w1 = edge(p2, p0, p) / area;
                let w2 = edge(p0, p1, p) / area;
                if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                    continue;
                }

                let local_pos = v0.position * w0 + v1.position * w1 + v2.position * w2;
                let local_normal =
                    (v0.normal * w0 + v1.normal * w1 + v2.normal * w2).normalize_or_zero();

                let texel = &mut texels[y * size + x];
                texel.world_pos = world.transform_point3(local_pos);
                texel.world_normal = (normal_matrix * local_normal).normalize_or_zero();
                texel.valid = true;
                texel.triangle_index = tri_index as i32;
                texel.barycentrics = Vec2::new(w0, w1);
            }
        }
    }

    texels
}

// ------------------------------------------------------------------ packing

/// Cosine-weighted hemisphere sample around `normal`.
fn sample_hemisphere(normal: Vec3, u1: f32, u2: f32) -> Vec3 {
    let r = u1.sqrt();
    let theta = 2.0 * std::f32::consts::PI * u2;
    let x = r * theta.cos();
    let y = r * theta.sin();
    let z = (1.0 - u1).max(0.0).sqrt();

    let tangent = if normal.x.abs() > 0.9 {
        Vec3::Y.cross(normal).normalize()
    } else {
        Vec3::X.cross(normal).normalize()
    };
    let bitangent = normal.cross(tangent);
    (tangent * x + bitangent * y + normal * z).normalize_or_zero()
}

/// Reinhard tonemap and RGBA8 pack.
pub fn pack_rgba8(baked: &BakedLightmap) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(baked.pixels.len() * 4);
    for pixel in &baked.pixels {
        let mapped = *pixel / (*pixel + Vec3::ONE);
        let to_byte = |v: f32| (v.clamp(0.0, 1.0) * 255.0) as u8;
        bytes.extend_from_slice(&[
            to_byte(mapped.x),
            to_byte(mapped.y),
            to_byte(mapped.z),
            255,
        ]);
    }
    bytes
}

fn build_lightmap_texture(
    device: &Arc<Device>,
    baked: &BakedLightmap,
) -> Result<Texture, DriverError> {
    let pixels = pack_rgba8(baked);
    Texture::from_rgba8(
        device,
        format!("lightmap:{}", baked.mesh_name),
        baked.width,
        baked.height,
        &pixels,
    )
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            render::Mesh,
            scene::light::point_light,
        },
    };

    fn plane_scene() -> SceneGraph {
        let mut scene = SceneGraph::new();
        let node = scene.create_node("floor", None);
        node.borrow_mut().add_mesh(Mesh::plane(2.0).into_ref());

        let light = point_light("lamp", Vec3::ONE, 10.0);
        light.borrow_mut().set_local_position(Vec3::new(0.0, 2.0, 0.0));
        scene.add_light(light);
        scene
    }

    fn quick_settings() -> BakeSettings {
        BakeSettings {
            resolution: 8,
            shadow_samples: 1,
            gi_bounces: 0,
            gi_samples: 1,
            enable_shadows: false,
            enable_gi: false,
            use_gpu: false,
            ..Default::default()
        }
    }

    #[test]
    fn minimal_plane_bake_lights_every_valid_texel() {
        let scene = plane_scene();
        let mut baker = LightmapBaker::new();
        baker.bake(None, &scene, &quick_settings(), None).unwrap();

        let baked = &baker.baked_lightmaps()[0];
        assert_eq!(baked.width, 8);

        // Every valid texel strictly positive; centre brighter than corner.
        let at = |x: usize, y: usize| baked.pixels[y * 8 + x];
        let mut any = false;
        for pixel in &baked.pixels {
            if *pixel != Vec3::ZERO {
                assert!(pixel.x > 0.0 && pixel.y > 0.0 && pixel.z > 0.0);
                any = true;
            }
        }
        assert!(any, "no texel received light");

        let center = at(4, 4).length();
        let corners = [at(0, 0), at(7, 0), at(0, 7), at(7, 7)];
        let corner = corners
            .iter()
            .map(|v| v.length())
            .fold(f32::MAX, f32::min);
        assert!(center > corner, "center {center} should exceed corner {corner}");
    }

    #[test]
    fn bake_without_lights_fails() {
        let mut scene = SceneGraph::new();
        let node = scene.create_node("floor", None);
        node.borrow_mut().add_mesh(Mesh::plane(2.0).into_ref());

        let mut baker = LightmapBaker::new();
        assert!(matches!(
            baker.bake(None, &scene, &quick_settings(), None),
            Err(BakeError::NoLights)
        ));
    }

    #[test]
    fn bake_without_meshes_fails() {
        let mut scene = SceneGraph::new();
        scene.add_light(point_light("lamp", Vec3::ONE, 10.0));

        let mut baker = LightmapBaker::new();
        assert!(matches!(
            baker.bake(None, &scene, &quick_settings(), None),
            Err(BakeError::NoMeshes)
        ));
    }

    #[test]
    fn progress_runs_from_zero_to_one() {
        let scene = plane_scene();
        let mut baker = LightmapBaker::new();
        let mut fractions = Vec::new();
        let mut callback = |fraction: f32, _status: &str| fractions.push(fraction);
        baker
            .bake(None, &scene, &quick_settings(), Some(&mut callback))
            .unwrap();
        assert_eq!(fractions.first().copied(), Some(0.0));
        assert_eq!(fractions.last().copied(), Some(1.0));
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn reinhard_pack_is_bounded() {
        let baked = BakedLightmap {
            pixels: vec![Vec3::ZERO, Vec3::ONE, Vec3::splat(100.0)],
            width: 3,
            height: 1,
            mesh_name: "t".into(),
        };
        let bytes = pack_rgba8(&baked);
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 255]);
        assert_eq!(bytes[4], 127);
        assert!(bytes[8] > 250);
    }

    #[test]
    fn shadowed_plane_under_blocker_is_darker() {
        let mut scene = plane_scene();
        // A small cube hovering between the light and the plane centre.
        let blocker = scene.create_node("blocker", None);
        blocker
            .borrow_mut()
            .set_local_position(Vec3::new(0.0, 1.0, 0.0));
        blocker
            .borrow_mut()
            .set_local_scale(Vec3::splat(0.4));
        blocker.borrow_mut().add_mesh(Mesh::unit_cube().into_ref());

        let mut settings = quick_settings();
        settings.enable_shadows = true;
        settings.shadow_samples = 1;

        let mut baker = LightmapBaker::new();
        baker.bake(None, &scene, &settings, None).unwrap();

        // The plane is baked first (scene order); its centre texel sits in
        // the blocker's shadow.
        let plane = baker
            .baked_lightmaps()
            .iter()
            .find(|b| b.mesh_name == "Plane")
            .unwrap();
        let center = plane.pixels[4 * 8 + 4];
        let edge = plane.pixels[4 * 8];
        assert!(center.length() < edge.length());
    }
}
