//! 3D meshes: CPU-side geometry plus lazily-finalized GPU buffers.

use {
    super::{material::Material, texture::Texture},
    crate::driver::{Buffer, BufferInfo, Device, DriverError},
    ash::vk,
    bytemuck::{Pod, Zeroable},
    glam::{Vec2, Vec3},
    parking_lot::Mutex,
    std::{
        mem,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    },
};

/// Shared mesh handle. Meshes are read from worker threads (baker, GPU
/// raycast upload), so they are behind a mutex rather than scene-local.
pub type MeshRef = Arc<Mutex<Mesh>>;

/// Process-unique mesh identity; cache keys survive mesh mutation.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct MeshId(pub u64);

fn next_mesh_id() -> MeshId {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    MeshId(COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Vertex data with the fixed binding layout the 3D pipelines expect.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub tangent: Vec3,
    pub bitangent: Vec3,
    /// Lightmap coordinates; written by the bake's atlas step.
    pub uv2: Vec2,
}

impl Default for Vertex {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            normal: Vec3::Y,
            uv: Vec2::ZERO,
            tangent: Vec3::ZERO,
            bitangent: Vec3::ZERO,
            uv2: Vec2::ZERO,
        }
    }
}

impl Vertex {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position,
            normal,
            uv,
            ..Default::default()
        }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
        let attr = |location, format, offset| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset: offset as u32,
        };
        vec![
            attr(0, vk::Format::R32G32B32_SFLOAT, mem::offset_of!(Self, position)),
            attr(1, vk::Format::R32G32B32_SFLOAT, mem::offset_of!(Self, normal)),
            attr(2, vk::Format::R32G32_SFLOAT, mem::offset_of!(Self, uv)),
            attr(3, vk::Format::R32G32B32_SFLOAT, mem::offset_of!(Self, tangent)),
            attr(4, vk::Format::R32G32B32_SFLOAT, mem::offset_of!(Self, bitangent)),
            attr(5, vk::Format::R32G32_SFLOAT, mem::offset_of!(Self, uv2)),
        ]
    }
}

/// Triangle defined by three vertex indices; every index must stay in range
/// of the mesh's vertex array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Triangle {
    pub v0: u32,
    pub v1: u32,
    pub v2: u32,
}

impl Triangle {
    pub fn new(v0: u32, v1: u32, v2: u32) -> Self {
        Self { v0, v1, v2 }
    }
}

struct GpuBuffers {
    vertex_buffer: Buffer,
    index_buffer: Buffer,
}

/// A mesh: vertices, triangles, a material reference and (after
/// [`Mesh::finalize`]) GPU buffers mirroring the CPU data. Any geometry
/// mutation bumps `geometry_version` and clears `finalized`.
pub struct Mesh {
    name: String,
    id: MeshId,
    vertices: Vec<Vertex>,
    triangles: Vec<Triangle>,
    material: Option<Arc<Mutex<Material>>>,
    gpu: Option<GpuBuffers>,
    finalized: bool,
    bounds_min: Vec3,
    bounds_max: Vec3,
    has_uv2: bool,
    geometry_version: u64,
    lightmap: Option<Arc<Texture>>,
    /// Content-relative path this mesh was imported from, for scene
    /// serialization.
    source: Option<String>,
}

impl Mesh {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: next_mesh_id(),
            vertices: Vec::new(),
            triangles: Vec::new(),
            material: None,
            gpu: None,
            finalized: false,
            bounds_min: Vec3::ZERO,
            bounds_max: Vec3::ZERO,
            has_uv2: false,
            geometry_version: 0,
            lightmap: None,
            source: None,
        }
    }

    pub fn into_ref(self) -> MeshRef {
        Arc::new(Mutex::new(self))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn id(&self) -> MeshId {
        self.id
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = Some(source.into());
    }

    pub fn geometry_version(&self) -> u64 {
        self.geometry_version
    }

    fn mark_dirty(&mut self) {
        self.geometry_version += 1;
        self.finalized = false;
        self.gpu = None;
    }

    // ------------------------------------------------------------ geometry

    pub fn add_vertex(&mut self, vertex: Vertex) {
        self.vertices.push(vertex);
        self.mark_dirty();
    }

    pub fn add_triangle(&mut self, triangle: Triangle) {
        self.triangles.push(triangle);
        self.mark_dirty();
    }

    pub fn add_triangle_indices(&mut self, v0: u32, v1: u32, v2: u32) {
        self.add_triangle(Triangle::new(v0, v1, v2));
    }

    pub fn set_vertices(&mut self, vertices: Vec<Vertex>) {
        self.vertices = vertices;
        self.mark_dirty();
    }

    pub fn set_triangles(&mut self, triangles: Vec<Triangle>) {
        self.triangles = triangles;
        self.mark_dirty();
    }

    pub fn clear(&mut self) {
        self.vertices.clear();
        self.triangles.clear();
        self.has_uv2 = false;
        self.mark_dirty();
    }

    /// In-place vertex edit for sculpt-style tools. Counts as a mutation:
    /// the geometry version bumps and stale GPU buffers drop.
    pub fn edit_vertices(&mut self, edit: impl FnOnce(&mut [Vertex])) {
        edit(&mut self.vertices);
        self.mark_dirty();
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn index_count(&self) -> usize {
        self.triangles.len() * 3
    }

    pub fn index_data(&self) -> Vec<u32> {
        self.triangles
            .iter()
            .flat_map(|t| [t.v0, t.v1, t.v2])
            .collect()
    }

    pub fn has_uv2(&self) -> bool {
        self.has_uv2
    }

    pub(crate) fn set_has_uv2(&mut self, value: bool) {
        self.has_uv2 = value;
    }

    // ------------------------------------------------------------ material

    pub fn set_material(&mut self, material: Arc<Mutex<Material>>) {
        self.material = Some(material);
    }

    pub fn material(&self) -> Option<&Arc<Mutex<Material>>> {
        self.material.as_ref()
    }

    pub fn set_lightmap(&mut self, lightmap: Arc<Texture>) {
        self.lightmap = Some(lightmap);
    }

    pub fn lightmap(&self) -> Option<&Arc<Texture>> {
        self.lightmap.as_ref()
    }

    // ----------------------------------------------------------------- gpu

    /// Upload vertex and index data. After this the GPU buffers mirror the
    /// CPU arrays until the next mutation.
    #[profiling::function]
    pub fn finalize(&mut self, device: &Arc<Device>) -> Result<(), DriverError> {
        if self.vertices.is_empty() || self.triangles.is_empty() {
            return Err(DriverError::InvalidData);
        }

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&self.vertices);
        let mut vertex_buffer = Buffer::create(
            device,
            BufferInfo::host(
                vertex_bytes.len() as vk::DeviceSize,
                vk::BufferUsageFlags::VERTEX_BUFFER,
            ),
        )?;
        vertex_buffer.write(0, vertex_bytes)?;

        let indices = self.index_data();
        let index_bytes: &[u8] = bytemuck::cast_slice(&indices);
        let mut index_buffer = Buffer::create(
            device,
            BufferInfo::host(
                index_bytes.len() as vk::DeviceSize,
                vk::BufferUsageFlags::INDEX_BUFFER,
            ),
        )?;
        index_buffer.write(0, index_bytes)?;

        self.gpu = Some(GpuBuffers {
            vertex_buffer,
            index_buffer,
        });
        self.finalized = true;
        self.recalculate_bounds();
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn is_valid(&self) -> bool {
        self.finalized && self.gpu.is_some()
    }

    pub fn vertex_buffer(&self) -> Option<vk::Buffer> {
        self.gpu.as_ref().map(|gpu| *gpu.vertex_buffer)
    }

    pub fn index_buffer(&self) -> Option<vk::Buffer> {
        self.gpu.as_ref().map(|gpu| *gpu.index_buffer)
    }

    /// Bind vertex and index buffers for an indexed draw.
    pub fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        let Some(gpu) = self.gpu.as_ref() else {
            return;
        };
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[*gpu.vertex_buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, *gpu.index_buffer, 0, vk::IndexType::UINT32);
        }
    }

    // ------------------------------------------------------------- rebuild

    /// Face-area-weighted vertex normals from triangle data.
    pub fn recalculate_normals(&mut self) {
        for vertex in &mut self.vertices {
            vertex.normal = Vec3::ZERO;
        }
        for tri in &self.triangles {
            let (i0, i1, i2) = (tri.v0 as usize, tri.v1 as usize, tri.v2 as usize);
            if i0 >= self.vertices.len() || i1 >= self.vertices.len() || i2 >= self.vertices.len() {
                continue;
            }
            let edge1 = self.vertices[i1].position - self.vertices[i0].position;
            let edge2 = self.vertices[i2].position - self.vertices[i0].position;
            let face = edge1.cross(edge2);
            self.vertices[i0].normal += face;
            self.vertices[i1].normal += face;
            self.vertices[i2].normal += face;
        }
        for vertex in &mut self.vertices {
            vertex.normal = vertex.normal.normalize_or_zero();
            if vertex.normal == Vec3::ZERO {
                vertex.normal = Vec3::Y;
            }
        }
        self.mark_dirty();
    }

    /// Tangent frames from UV derivatives, for normal mapping.
    pub fn recalculate_tangents(&mut self) {
        for vertex in &mut self.vertices {
            vertex.tangent = Vec3::ZERO;
            vertex.bitangent = Vec3::ZERO;
        }
        for tri in &self.triangles {
            let (i0, i1, i2) = (tri.v0 as usize, tri.v1 as usize, tri.v2 as usize);
            if i0 >= self.vertices.len() || i1 >= self.vertices.len() || i2 >= self.vertices.len() {
                continue;
            }
            let edge1 = self.vertices[i1].position - self.vertices[i0].position;
            let edge2 = self.vertices[i2].position - self.vertices[i0].position;
            let duv1 = self.vertices[i1].uv - self.vertices[i0].uv;
            let duv2 = self.vertices[i2].uv - self.vertices[i0].uv;

            let det = duv1.x * duv2.y - duv2.x * duv1.y;
            if det.abs() < 1e-8 {
                continue;
            }
            let inv = 1.0 / det;
            let tangent = (edge1 * duv2.y - edge2 * duv1.y) * inv;
            let bitangent = (edge2 * duv1.x - edge1 * duv2.x) * inv;
            for index in [i0, i1, i2] {
                self.vertices[index].tangent += tangent;
                self.vertices[index].bitangent += bitangent;
            }
        }
        for vertex in &mut self.vertices {
            vertex.tangent = vertex.tangent.normalize_or_zero();
            vertex.bitangent = vertex.bitangent.normalize_or_zero();
        }
        self.mark_dirty();
    }

    pub fn recalculate_bounds(&mut self) {
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        for vertex in &self.vertices {
            min = min.min(vertex.position);
            max = max.max(vertex.position);
        }
        if self.vertices.is_empty() {
            min = Vec3::ZERO;
            max = Vec3::ZERO;
        }
        self.bounds_min = min;
        self.bounds_max = max;
    }

    pub fn bounds(&self) -> (Vec3, Vec3) {
        (self.bounds_min, self.bounds_max)
    }

    // --------------------------------------------------------- primitives

    /// Axis-aligned unit cube centered at the origin (half extent 0.5).
    pub fn unit_cube() -> Self {
        let mut mesh = Self::new("UnitCube");
        let h = 0.5f32;
        let faces: [(Vec3, Vec3, Vec3); 6] = [
            // (normal, u axis, v axis)
            (Vec3::Z, Vec3::X, Vec3::Y),
            (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
            (Vec3::X, Vec3::NEG_Z, Vec3::Y),
            (Vec3::NEG_X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::X, Vec3::NEG_Z),
            (Vec3::NEG_Y, Vec3::X, Vec3::Z),
        ];
        for (normal, u_axis, v_axis) in faces {
            let base = mesh.vertices.len() as u32;
            for (du, dv, uv) in [
                (-h, -h, Vec2::new(0.0, 1.0)),
                (h, -h, Vec2::new(1.0, 1.0)),
                (h, h, Vec2::new(1.0, 0.0)),
                (-h, h, Vec2::new(0.0, 0.0)),
            ] {
                let position = normal * h + u_axis * du + v_axis * dv;
                mesh.vertices.push(Vertex::new(position, normal, uv));
            }
            mesh.triangles.push(Triangle::new(base, base + 1, base + 2));
            mesh.triangles.push(Triangle::new(base, base + 2, base + 3));
        }
        mesh.mark_dirty();
        mesh.recalculate_tangents();
        mesh.recalculate_bounds();
        mesh
    }

    /// Flat plane in XZ at y = 0, `size` units across, normal +Y.
    pub fn plane(size: f32) -> Self {
        let mut mesh = Self::new("Plane");
        let h = size * 0.5;
        let corners = [
            (Vec3::new(-h, 0.0, -h), Vec2::new(0.0, 0.0)),
            (Vec3::new(h, 0.0, -h), Vec2::new(1.0, 0.0)),
            (Vec3::new(h, 0.0, h), Vec2::new(1.0, 1.0)),
            (Vec3::new(-h, 0.0, h), Vec2::new(0.0, 1.0)),
        ];
        for (position, uv) in corners {
            mesh.vertices.push(Vertex::new(position, Vec3::Y, uv));
        }
        mesh.triangles.push(Triangle::new(0, 2, 1));
        mesh.triangles.push(Triangle::new(0, 3, 2));
        mesh.mark_dirty();
        mesh.recalculate_tangents();
        mesh.recalculate_bounds();
        mesh
    }
}

impl std::fmt::Debug for Mesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mesh")
            .field("name", &self.name)
            .field("vertices", &self.vertices.len())
            .field("triangles", &self.triangles.len())
            .field("finalized", &self.finalized)
            .field("geometry_version", &self.geometry_version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_shader_locations() {
        assert_eq!(mem::offset_of!(Vertex, position), 0);
        assert_eq!(mem::offset_of!(Vertex, normal), 12);
        assert_eq!(mem::offset_of!(Vertex, uv), 24);
        assert_eq!(mem::offset_of!(Vertex, tangent), 32);
        assert_eq!(mem::offset_of!(Vertex, bitangent), 44);
        assert_eq!(mem::offset_of!(Vertex, uv2), 56);
        assert_eq!(Vertex::binding_description().stride as usize, mem::size_of::<Vertex>());
    }

    #[test]
    fn mutation_bumps_version_and_clears_finalized() {
        let mut mesh = Mesh::unit_cube();
        let version = mesh.geometry_version();
        mesh.add_vertex(Vertex::at(Vec3::ONE));
        assert!(mesh.geometry_version() > version);
        assert!(!mesh.is_finalized());
    }

    #[test]
    fn unit_cube_bounds_are_half_extent() {
        let mesh = Mesh::unit_cube();
        let (min, max) = mesh.bounds();
        assert_eq!(min, Vec3::splat(-0.5));
        assert_eq!(max, Vec3::splat(0.5));
        assert_eq!(mesh.triangle_count(), 12);
        // Every index in range.
        for tri in mesh.triangles() {
            assert!((tri.v0 as usize) < mesh.vertex_count());
            assert!((tri.v1 as usize) < mesh.vertex_count());
            assert!((tri.v2 as usize) < mesh.vertex_count());
        }
    }

    #[test]
    fn plane_normals_point_up() {
        let mesh = Mesh::plane(4.0);
        for vertex in mesh.vertices() {
            assert_eq!(vertex.normal, Vec3::Y);
        }
    }
}
