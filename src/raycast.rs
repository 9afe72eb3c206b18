//! GPU-accelerated mesh raycasting with per-mesh triangle caches.
//!
//! Gizmos, viewport selection and the lightmap baker's shadow rays all go
//! through one [`Raycaster`]. Each mesh's triangle positions are flattened
//! once and cached (CPU array + GPU storage buffer) tagged with the mesh's
//! geometry version; a version mismatch rebuilds the cache on the next
//! cast.
//!
//! The intersection kernel is one work item per triangle running
//! Möller-Trumbore, reducing the winning `t` through a monotonic minimum
//! over float bits reinterpreted as signed ints (IEEE-754 ordering is
//! preserved for non-negative floats). The CPU fallback runs the same
//! reduction with rayon and an atomic.

use {
    crate::{
        driver::{Buffer, BufferInfo, ComputePipeline, DescriptorPool, Device, DriverError},
        render::mesh::{Mesh, MeshId},
    },
    ash::vk,
    bytemuck::{Pod, Zeroable},
    glam::{Mat4, Vec3, Vec4},
    log::{debug, warn},
    parking_lot::Mutex,
    rayon::prelude::*,
    std::{
        collections::HashMap,
        path::Path,
        sync::{atomic::AtomicI32, atomic::Ordering, Arc},
    },
};

/// Intersections closer than this along the ray are ignored (self-hits).
const T_MIN: f32 = 1e-4;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CastResult {
    pub hit: bool,
    /// World-space distance from the ray origin to the hit point.
    pub distance: f32,
    pub hit_point_world: Vec3,
}

impl CastResult {
    pub const MISS: Self = Self {
        hit: false,
        distance: -1.0,
        hit_point_world: Vec3::ZERO,
    };
}

/// Push-constant block of the intersection kernel; 16-byte aligned fields.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct RayPush {
    origin: [f32; 4],
    direction: [f32; 4],
    triangle_count: u32,
    _pad: [u32; 3],
}

struct MeshCacheEntry {
    /// Flat triangle vertex positions, three per triangle, vec4-padded so
    /// CPU and GPU read the same bytes.
    tri_data: Vec<Vec4>,
    gpu_buffer: Option<Buffer>,
    geometry_version: u64,
}

struct GpuRaycast {
    device: Arc<Device>,
    pipeline: ComputePipeline,
    pool: DescriptorPool,
    /// Single i32 slot holding the running minimum as float bits.
    result_buffer: Buffer,
}

#[derive(Default)]
struct RaycasterState {
    cache: HashMap<MeshId, MeshCacheEntry>,
    gpu: Option<GpuRaycast>,
}

/// See the module docs. One mutex serializes casts so concurrent calls from
/// the UI and render threads cannot interleave kernel argument writes, and
/// cache rebuilds never race an in-flight dispatch.
pub struct Raycaster {
    state: Mutex<RaycasterState>,
}

impl Raycaster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RaycasterState::default()),
        }
    }

    /// Attach a compute device and kernel. Without this (or after a failed
    /// load) every cast runs on the CPU.
    pub fn enable_gpu(
        &self,
        device: &Arc<Device>,
        kernel_spv: impl AsRef<Path>,
    ) -> Result<(), DriverError> {
        let pipeline = ComputePipeline::create(
            device,
            kernel_spv,
            2,
            std::mem::size_of::<RayPush>() as u32,
        )?;
        let pool = DescriptorPool::create(device, 16)?;
        let result_buffer = Buffer::create(
            device,
            BufferInfo::host(16, vk::BufferUsageFlags::STORAGE_BUFFER),
        )?;
        self.state.lock().gpu = Some(GpuRaycast {
            device: Arc::clone(device),
            pipeline,
            pool,
            result_buffer,
        });
        debug!("raycaster: GPU kernel enabled");
        Ok(())
    }

    /// Drop one mesh's cached triangle buffers.
    pub fn invalidate_mesh(&self, mesh_id: MeshId) {
        self.state.lock().cache.remove(&mesh_id);
    }

    /// Drop every cached entry.
    pub fn clear_cache(&self) {
        self.state.lock().cache.clear();
    }

    /// Cast the world-space segment `origin -> end` against `mesh` placed by
    /// `model_matrix`.
    ///
    /// The ray transforms into mesh-local space through the inverse model
    /// matrix; the direction is deliberately not renormalized so `t` keeps
    /// world-distance scale across the transform.
    #[profiling::function]
    pub fn cast(
        &self,
        model_matrix: Mat4,
        origin_world: Vec3,
        end_world: Vec3,
        mesh: &Mesh,
    ) -> CastResult {
        let mut state = self.state.lock();

        if mesh.triangle_count() == 0 || mesh.vertex_count() == 0 {
            return CastResult::MISS;
        }

        let inverse = model_matrix.inverse();
        let local_origin = inverse.transform_point3(origin_world);
        let local_dir = inverse.transform_vector3(end_world - origin_world);

        Self::ensure_cache(&mut state, mesh);

        let best_t = Self::min_hit_t(&mut state, mesh.id(), local_origin, local_dir);

        match best_t {
            Some(t) => {
                let local_hit = local_origin + local_dir * t;
                let hit_point_world = model_matrix.transform_point3(local_hit);
                CastResult {
                    hit: true,
                    distance: (hit_point_world - origin_world).length(),
                    hit_point_world,
                }
            }
            None => CastResult::MISS,
        }
    }

    fn ensure_cache(state: &mut RaycasterState, mesh: &Mesh) {
        let version = mesh.geometry_version();
        let stale = state
            .cache
            .get(&mesh.id())
            .map(|entry| entry.geometry_version != version)
            .unwrap_or(true);
        if !stale {
            return;
        }

        let vertices = mesh.vertices();
        let mut tri_data = Vec::with_capacity(mesh.triangle_count() * 3);
        for tri in mesh.triangles() {
            for index in [tri.v0, tri.v1, tri.v2] {
                let position = vertices
                    .get(index as usize)
                    .map(|v| v.position)
                    .unwrap_or(Vec3::ZERO);
                tri_data.push(position.extend(0.0));
            }
        }

        let gpu_buffer = state.gpu.as_ref().and_then(|gpu| {
            let bytes: &[u8] = bytemuck::cast_slice(&tri_data);
            let mut buffer = Buffer::create(
                &gpu.device,
                BufferInfo::host(
                    bytes.len().max(16) as vk::DeviceSize,
                    vk::BufferUsageFlags::STORAGE_BUFFER,
                ),
            )
            .ok()?;
            buffer.write(0, bytes).ok()?;
            Some(buffer)
        });

        debug!(
            "raycaster: cached mesh '{}' ({} triangles, version {version})",
            mesh.name(),
            mesh.triangle_count()
        );
        state.cache.insert(
            mesh.id(),
            MeshCacheEntry {
                tri_data,
                gpu_buffer,
                geometry_version: version,
            },
        );
    }

    fn min_hit_t(
        state: &mut RaycasterState,
        mesh_id: MeshId,
        origin: Vec3,
        dir: Vec3,
    ) -> Option<f32> {
        // GPU first; any failure falls through to the CPU reduction.
        if state.gpu.is_some() {
            let gpu_result = Self::dispatch_gpu(state, mesh_id, origin, dir);
            match gpu_result {
                Ok(t) => return t,
                Err(err) => warn!("raycaster: GPU dispatch failed ({err}), using CPU"),
            }
        }

        let entry = state.cache.get(&mesh_id)?;
        Self::cpu_reduce(&entry.tri_data, origin, dir)
    }

    fn cpu_reduce(tri_data: &[Vec4], origin: Vec3, dir: Vec3) -> Option<f32> {
        let min_bits = AtomicI32::new(f32::INFINITY.to_bits() as i32);

        tri_data
            .par_chunks(3)
            .filter(|tri| tri.len() == 3)
            .for_each(|tri| {
                let v0 = tri[0].truncate();
                let v1 = tri[1].truncate();
                let v2 = tri[2].truncate();
                if let Some(t) = ray_triangle(origin, dir, v0, v1, v2) {
                    // Non-negative floats order the same as their bits.
                    min_bits.fetch_min(t.to_bits() as i32, Ordering::Relaxed);
                }
            });

        let t = f32::from_bits(min_bits.load(Ordering::Relaxed) as u32);
        (t.is_finite() && t <= 1.0).then_some(t)
    }

    fn dispatch_gpu(
        state: &mut RaycasterState,
        mesh_id: MeshId,
        origin: Vec3,
        dir: Vec3,
    ) -> Result<Option<f32>, DriverError> {
        let triangle_count = {
            let entry = state.cache.get(&mesh_id).ok_or(DriverError::InvalidData)?;
            if entry.gpu_buffer.is_none() {
                return Err(DriverError::InvalidData);
            }
            (entry.tri_data.len() / 3) as u32
        };

        let gpu = state.gpu.as_mut().ok_or(DriverError::InvalidData)?;
        let init = (f32::INFINITY.to_bits() as i32).to_le_bytes();
        gpu.result_buffer.write(0, &init)?;

        let entry = state.cache.get(&mesh_id).ok_or(DriverError::InvalidData)?;
        let tri_buffer = entry.gpu_buffer.as_ref().ok_or(DriverError::InvalidData)?;

        let set = gpu.pool.allocate(gpu.pipeline.set_layout())?;
        let tri_info = vk::DescriptorBufferInfo {
            buffer: **tri_buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        };
        let result_info = vk::DescriptorBufferInfo {
            buffer: *gpu.result_buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        };
        let writes = [
            vk::WriteDescriptorSet {
                dst_set: set,
                dst_binding: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                p_buffer_info: &tri_info,
                ..Default::default()
            },
            vk::WriteDescriptorSet {
                dst_set: set,
                dst_binding: 1,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                p_buffer_info: &result_info,
                ..Default::default()
            },
        ];
        unsafe {
            gpu.device.update_descriptor_sets(&writes, &[]);
        }

        let push = RayPush {
            origin: origin.extend(0.0).to_array(),
            direction: dir.extend(0.0).to_array(),
            triangle_count,
            _pad: [0; 3],
        };
        let pipeline = *gpu.pipeline;
        let layout = gpu.pipeline.layout();
        let groups = triangle_count.div_ceil(64).max(1);
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

        let bytes = gpu.result_buffer.read(0, 4)?;
        let bits = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let t = f32::from_bits(bits as u32);
        Ok((t.is_finite() && t <= 1.0).then_some(t))
    }
}

impl Default for Raycaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Raycaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Raycaster")
            .field("cached_meshes", &state.cache.len())
            .field("gpu", &state.gpu.is_some())
            .finish()
    }
}

/// Möller-Trumbore against an unnormalized direction; `t` is in units of
/// `dir`, so `t == 1` lands exactly on the segment end.
pub fn ray_triangle(origin: Vec3, dir: Vec3, v0: Vec3, v1: Vec3, v2: Vec3) -> Option<f32> {
    const EPSILON: f32 = 1e-7;

    let edge1 = v1 - v0;
    let edge2 = v2 - v0;
    let h = dir.cross(edge2);
    let a = edge1.dot(h);
    if a.abs() < EPSILON {
        return None;
    }

    let f = 1.0 / a;
    let s = origin - v0;
    let u = f * s.dot(h);
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = s.cross(edge1);
    let v = f * dir.dot(q);
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = f * edge2.dot(q);
    (t > T_MIN).then_some(t)
}

#[cfg(test)]
mod tests {
    use {super::*, crate::render::mesh::Mesh};

    fn unit_cube() -> Mesh {
        Mesh::unit_cube()
    }

    #[test]
    fn hits_the_unit_cube_front_face() {
        let raycaster = Raycaster::new();
        let mesh = unit_cube();
        let result = raycaster.cast(
            Mat4::IDENTITY,
            Vec3::new(0.0, 0.0, 5.0),
            Vec3::new(0.0, 0.0, -5.0),
            &mesh,
        );
        assert!(result.hit);
        assert!((result.distance - 4.5).abs() < 1e-4);
        assert!((result.hit_point_world - Vec3::new(0.0, 0.0, 0.5)).length() < 1e-4);
    }

    #[test]
    fn repeated_casts_are_deterministic() {
        let raycaster = Raycaster::new();
        let mesh = unit_cube();
        let cast = || {
            raycaster.cast(
                Mat4::IDENTITY,
                Vec3::new(0.1, 0.2, 5.0),
                Vec3::new(0.1, 0.2, -5.0),
                &mesh,
            )
        };
        let first = cast();
        let second = cast();
        assert_eq!(first, second);

        raycaster.invalidate_mesh(mesh.id());
        let third = cast();
        assert_eq!(first, third);
    }

    #[test]
    fn segment_end_limits_the_cast() {
        let raycaster = Raycaster::new();
        let mesh = unit_cube();
        // Segment stops before reaching the cube.
        let result = raycaster.cast(
            Mat4::IDENTITY,
            Vec3::new(0.0, 0.0, 5.0),
            Vec3::new(0.0, 0.0, 2.0),
            &mesh,
        );
        assert!(!result.hit);
    }

    #[test]
    fn transform_composition_matches_local_hit() {
        let raycaster = Raycaster::new();
        let mesh = unit_cube();
        let model = Mat4::from_translation(Vec3::new(3.0, 0.0, 0.0));
        let result = raycaster.cast(
            model,
            Vec3::new(3.0, 0.0, 5.0),
            Vec3::new(3.0, 0.0, -5.0),
            &mesh,
        );
        assert!(result.hit);
        // Local hit (0,0,0.5) transformed by the model matrix.
        assert!((result.hit_point_world - Vec3::new(3.0, 0.0, 0.5)).length() < 1e-4);
    }

    #[test]
    fn cache_rebuilds_after_geometry_change() {
        let raycaster = Raycaster::new();
        let mut mesh = unit_cube();
        let ray = (Vec3::new(0.0, 0.0, 5.0), Vec3::new(0.0, 0.0, -5.0));

        assert!(raycaster.cast(Mat4::IDENTITY, ray.0, ray.1, &mesh).hit);

        // Shrink the cube; the cached triangles must not be reused.
        let scaled: Vec<_> = mesh
            .vertices()
            .iter()
            .map(|v| {
                let mut v = *v;
                v.position *= 0.1;
                v
            })
            .collect();
        mesh.set_vertices(scaled);
        let result = raycaster.cast(Mat4::IDENTITY, ray.0, ray.1, &mesh);
        assert!(result.hit);
        assert!((result.hit_point_world.z - 0.05).abs() < 1e-4);
    }
}
