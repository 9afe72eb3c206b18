//! The terrain editing brush: a concentric-ring disc that conforms to the
//! terrain surface under the cursor and drives paint/sculpt picking through
//! the raycaster.

use {
    crate::{
        raycast::{CastResult, Raycaster},
        render::mesh::{Mesh, Triangle, Vertex},
        scene::node::NodeRef,
    },
    glam::{Mat4, Vec2, Vec3, Vec4},
};

const RADIAL_SEGMENTS: u32 = 32;
const CONCENTRIC_RINGS: u32 = 4;
/// Unit radius before brush-size scaling.
const BASE_RADIUS: f32 = 0.5;
/// Probe rays drop from this height down to `-PROBE_DEPTH`.
const PROBE_HEIGHT: f32 = 80.0;
const PROBE_DEPTH: f32 = 500.0;

/// The in-viewport terrain brush. The disc mesh stores per-vertex color in
/// the tangent channel and rim alpha in `uv.x`, which is all the brush
/// shader samples.
pub struct TerrainGizmo {
    mesh: Mesh,
    position: Vec3,
    scale: f32,
    color: Vec4,
    /// Flat-disc vertex positions before any terrain conformance, so each
    /// update re-probes from the true ring shape.
    original_xz: Vec<Vec2>,
    needs_terrain_update: bool,
}

impl TerrainGizmo {
    pub fn new() -> Self {
        let (mesh, original_xz) = brush_mesh();
        Self {
            mesh,
            position: Vec3::ZERO,
            scale: 1.0,
            color: Vec4::new(0.0, 1.0, 1.0, 1.0),
            original_xz,
            needs_terrain_update: true,
        }
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn color(&self) -> Vec4 {
        self.color
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// Brush placement follows the mouse pick in X/Z only; height comes
    /// from conforming to the terrain.
    pub fn set_position(&mut self, position: Vec3) {
        self.position = Vec3::new(position.x, 0.0, position.z);
        self.needs_terrain_update = true;
    }

    /// Brush radius in world units.
    pub fn set_size(&mut self, size: f32) {
        self.scale = size;
        self.needs_terrain_update = true;
    }

    pub fn size(&self) -> f32 {
        self.scale
    }

    pub fn needs_terrain_update(&self) -> bool {
        self.needs_terrain_update
    }

    /// Position and brush scale; height stays unscaled so conformed vertex
    /// heights are world heights.
    pub fn model_matrix(&self) -> Mat4 {
        Mat4::from_translation(self.position)
            * Mat4::from_scale(Vec3::new(self.scale, 1.0, self.scale))
    }

    /// Cast a world-space segment against the terrain node's surface mesh.
    pub fn raycast_terrain(
        &self,
        raycaster: &Raycaster,
        terrain: &NodeRef,
        origin_world: Vec3,
        end_world: Vec3,
    ) -> CastResult {
        let (mesh, world) = {
            let borrowed = terrain.borrow();
            let Some(mesh) = borrowed.meshes().first().cloned() else {
                return CastResult::MISS;
            };
            (mesh, borrowed.base_world_matrix())
        };
        let mesh = mesh.lock();
        raycaster.cast(world, origin_world, end_world, &mesh)
    }

    /// Drop a probe ray per disc vertex and pull its height onto the
    /// terrain surface, so the ring hugs sculpted geometry. Sculpt edits
    /// bump the mesh's geometry version, which already invalidates the
    /// raycaster's cached triangles.
    pub fn update_to_terrain(&mut self, raycaster: &Raycaster, terrain: &NodeRef) {
        let (terrain_mesh, terrain_world) = {
            let borrowed = terrain.borrow();
            if borrowed.terrain().is_none() {
                return;
            }
            let Some(mesh) = borrowed.meshes().first().cloned() else {
                return;
            };
            (mesh, borrowed.base_world_matrix())
        };

        let locked = terrain_mesh.lock();
        let position = self.position;
        let scale = self.scale;
        let original_xz = &self.original_xz;
        self.mesh.edit_vertices(|vertices| {
            if vertices.len() != original_xz.len() {
                return;
            }
            for (vertex, origin) in vertices.iter_mut().zip(original_xz) {
                let world_x = origin.x * scale + position.x;
                let world_z = origin.y * scale + position.z;
                let from = Vec3::new(world_x, PROBE_HEIGHT, world_z);
                let to = Vec3::new(world_x, -PROBE_DEPTH, world_z);
                let hit = raycaster.cast(terrain_world, from, to, &locked);
                // Hover slightly above the surface to avoid z-fighting.
                vertex.position.y = if hit.hit {
                    hit.hit_point_world.y + 0.01
                } else {
                    0.01
                };
            }
        });
        self.needs_terrain_update = false;
    }
}

impl Default for TerrainGizmo {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TerrainGizmo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerrainGizmo")
            .field("position", &self.position)
            .field("scale", &self.scale)
            .finish()
    }
}

/// Build the disc: a hidden center fan plus concentric rings whose outer
/// quarter fades in, leaving a visible rim. Ring color lives in the tangent
/// channel (green rim, cyan inner), alpha in `uv.x`.
fn brush_mesh() -> (Mesh, Vec<Vec2>) {
    let mut mesh = Mesh::new("TerrainBrush");
    let cyan = Vec3::new(0.0, 1.0, 1.0);
    let green = Vec3::new(0.0, 1.0, 0.0);

    let mut original_xz = Vec::new();
    let mut push = |mesh: &mut Mesh, local: Vec2, alpha: f32, color: Vec3| {
        let mut vertex = Vertex::new(
            Vec3::new(local.x, 0.0, local.y),
            Vec3::Y,
            Vec2::new(alpha, 0.0),
        );
        vertex.tangent = color;
        mesh.add_vertex(vertex);
        original_xz.push(local);
    };

    push(&mut mesh, Vec2::ZERO, 0.0, cyan);

    for ring in 1..=CONCENTRIC_RINGS {
        let ring_radius = BASE_RADIUS * ring as f32 / CONCENTRIC_RINGS as f32;
        let radius_pct = ring as f32 / CONCENTRIC_RINGS as f32;
        // Only the outer quarter of the disc is visible.
        let alpha = if radius_pct >= 0.75 {
            0.75 * (radius_pct - 0.75) / 0.25
        } else {
            0.0
        };
        let color = if ring == CONCENTRIC_RINGS { green } else { cyan };

        for segment in 0..RADIAL_SEGMENTS {
            let angle = segment as f32 / RADIAL_SEGMENTS as f32 * std::f32::consts::TAU;
            push(
                &mut mesh,
                Vec2::new(angle.cos(), angle.sin()) * ring_radius,
                alpha,
                color,
            );
        }
    }

    // Center fan.
    for segment in 0..RADIAL_SEGMENTS {
        let current = 1 + segment;
        let next = 1 + (segment + 1) % RADIAL_SEGMENTS;
        mesh.add_triangle(Triangle::new(0, current, next));
    }
    // Ring-to-ring quads.
    for ring in 1..CONCENTRIC_RINGS {
        let inner_start = 1 + (ring - 1) * RADIAL_SEGMENTS;
        let outer_start = 1 + ring * RADIAL_SEGMENTS;
        for segment in 0..RADIAL_SEGMENTS {
            let inner_current = inner_start + segment;
            let inner_next = inner_start + (segment + 1) % RADIAL_SEGMENTS;
            let outer_current = outer_start + segment;
            let outer_next = outer_start + (segment + 1) % RADIAL_SEGMENTS;
            mesh.add_triangle(Triangle::new(inner_current, outer_current, inner_next));
            mesh.add_triangle(Triangle::new(outer_current, outer_next, inner_next));
        }
    }

    mesh.recalculate_bounds();
    (mesh, original_xz)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::scene::terrain::{self, terrain_node},
    };

    #[test]
    fn brush_disc_shape() {
        let gizmo = TerrainGizmo::new();
        let mesh = gizmo.mesh();
        assert_eq!(
            mesh.vertex_count() as u32,
            1 + RADIAL_SEGMENTS * CONCENTRIC_RINGS
        );
        let (min, max) = mesh.bounds();
        assert!((max.x - BASE_RADIUS).abs() < 1e-5);
        assert!((min.z + BASE_RADIUS).abs() < 1e-5);

        // The rim ring carries the visible alpha and the green color.
        let rim = mesh.vertices().last().unwrap();
        assert!(rim.uv.x > 0.7);
        assert_eq!(rim.tangent, Vec3::new(0.0, 1.0, 0.0));
        // The center is invisible.
        assert_eq!(mesh.vertices()[0].uv.x, 0.0);
    }

    #[test]
    fn raycast_hits_flat_terrain() {
        let terrain = terrain_node("ground", 100.0, 100.0, 10, 1);
        let raycaster = Raycaster::new();
        let gizmo = TerrainGizmo::new();

        let hit = gizmo.raycast_terrain(
            &raycaster,
            &terrain,
            Vec3::new(3.0, 10.0, -4.0),
            Vec3::new(3.0, -10.0, -4.0),
        );
        assert!(hit.hit);
        assert!((hit.hit_point_world - Vec3::new(3.0, 0.0, -4.0)).length() < 1e-3);
    }

    #[test]
    fn disc_conforms_to_sculpted_terrain() {
        let node = terrain_node("ground", 100.0, 100.0, 20, 1);
        terrain::sculpt(&node, Vec3::ZERO, 12.0, 4.0);

        let raycaster = Raycaster::new();
        let mut gizmo = TerrainGizmo::new();
        gizmo.set_position(Vec3::ZERO);
        gizmo.set_size(30.0);
        assert!(gizmo.needs_terrain_update());

        gizmo.update_to_terrain(&raycaster, &node);
        assert!(!gizmo.needs_terrain_update());

        let vertices = gizmo.mesh().vertices();
        let center_y = vertices[0].position.y;
        let rim_y = vertices[vertices.len() - 1].position.y;
        assert!(
            center_y > rim_y + 0.1,
            "center {center_y} should sit on the sculpted mound, rim {rim_y} on flat ground"
        );
        // Even flat vertices hover a little above the surface.
        assert!(rim_y >= 0.009);
    }
}
