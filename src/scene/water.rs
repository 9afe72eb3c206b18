//! Water surface nodes: a finely subdivided plane with a tiling UV set and
//! a reflective default material.

use {
    super::node::{NodeKind, NodeRef, SceneNode},
    crate::{
        driver::{Device, DriverError},
        render::{
            material::Material,
            mesh::{Mesh, Triangle, Vertex},
            texture::Texture,
        },
    },
    glam::{Vec2, Vec3},
    parking_lot::Mutex,
    std::sync::Arc,
};

/// Grid resolution of the water plane; high enough for smooth vertex waves.
const GRID_SIZE: u32 = 128;
const TILE_SIZE: f32 = 0.5;
/// Normal-map tiling across the surface.
const UV_SCALE: f32 = 4.0;

fn water_mesh() -> Mesh {
    let mut mesh = Mesh::new("WaterMesh");
    let half = GRID_SIZE as f32 * TILE_SIZE * 0.5;

    let mut vertices = Vec::with_capacity(((GRID_SIZE + 1) * (GRID_SIZE + 1)) as usize);
    for z in 0..=GRID_SIZE {
        for x in 0..=GRID_SIZE {
            let position = Vec3::new(
                x as f32 * TILE_SIZE - half,
                0.0,
                z as f32 * TILE_SIZE - half,
            );
            let uv = Vec2::new(
                x as f32 / GRID_SIZE as f32 * UV_SCALE,
                z as f32 / GRID_SIZE as f32 * UV_SCALE,
            );
            vertices.push(Vertex::new(position, Vec3::Y, uv));
        }
    }

    let mut triangles = Vec::with_capacity((GRID_SIZE * GRID_SIZE * 2) as usize);
    for z in 0..GRID_SIZE {
        for x in 0..GRID_SIZE {
            let top_left = z * (GRID_SIZE + 1) + x;
            let top_right = top_left + 1;
            let bottom_left = (z + 1) * (GRID_SIZE + 1) + x;
            let bottom_right = bottom_left + 1;
            triangles.push(Triangle::new(top_left, bottom_left, top_right));
            triangles.push(Triangle::new(top_right, bottom_left, bottom_right));
        }
    }

    mesh.set_vertices(vertices);
    mesh.set_triangles(triangles);
    mesh.recalculate_normals();
    // Tangents matter here: the water shader is all normal mapping.
    mesh.recalculate_tangents();
    mesh.recalculate_bounds();
    mesh
}

/// Create a water node with its plane mesh attached.
pub fn water_node(name: impl Into<String>) -> NodeRef {
    let node = SceneNode::with_kind(name, NodeKind::Water);
    node.borrow_mut().add_mesh(water_mesh().into_ref());
    node
}

/// Create the water material (tinted translucent blue, low roughness, flat
/// normal until the embedder supplies a wave map) and upload the mesh.
pub fn initialize(node: &NodeRef, device: &Arc<Device>) -> Result<(), DriverError> {
    let mesh = node.borrow().meshes().first().cloned();
    let Some(mesh) = mesh else {
        return Err(DriverError::InvalidData);
    };

    let mut locked = mesh.lock();
    if locked.material().is_none() {
        let mut material = Material::new("WaterMaterial");
        material.set_pipeline("Water");
        material.set_albedo(Arc::new(Texture::from_rgba8(
            device,
            "water-albedo",
            1,
            1,
            &[0, 100, 200, 200],
        )?));
        material.set_roughness(Arc::new(Texture::from_rgba8(
            device,
            "water-roughness",
            1,
            1,
            &[10, 10, 10, 255],
        )?));
        material.set_normal(Arc::new(Texture::from_rgba8(
            device,
            "water-normal",
            1,
            1,
            &[128, 128, 255, 255],
        )?));
        locked.set_material(Arc::new(Mutex::new(material)));
    }
    if !locked.is_finalized() {
        locked.finalize(device)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_is_centered_with_tiled_uvs() {
        let node = water_node("lake");
        assert!(node.borrow().kind().type_name() == "water");

        let mesh = node.borrow().meshes()[0].clone();
        let mesh = mesh.lock();
        assert_eq!(mesh.vertex_count() as u32, (GRID_SIZE + 1) * (GRID_SIZE + 1));
        assert_eq!(mesh.triangle_count() as u32, GRID_SIZE * GRID_SIZE * 2);

        let half = GRID_SIZE as f32 * TILE_SIZE * 0.5;
        let first = mesh.vertices()[0];
        let last = mesh.vertices()[mesh.vertex_count() - 1];
        assert_eq!(first.position, Vec3::new(-half, 0.0, -half));
        assert_eq!(last.position, Vec3::new(half, 0.0, half));
        assert_eq!(last.uv, Vec2::splat(UV_SCALE));

        for vertex in mesh.vertices() {
            assert_eq!(vertex.normal, Vec3::Y);
        }
    }
}
