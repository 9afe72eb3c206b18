//! Lightmap UV (UV2) generation: chart building and shelf packing.
//!
//! Triangles group into charts by dominant normal axis and vertex
//! connectivity; each chart projects onto its two non-dominant axes and the
//! chart rectangles pack into a unit square with texel padding. Vertices
//! shared between charts are split, so generation may grow the vertex array
//! and the caller must re-upload GPU buffers afterwards.

use {
    crate::render::mesh::{Mesh, Triangle},
    glam::{Vec2, Vec3},
    std::collections::HashMap,
    thiserror::Error,
};

#[derive(Clone, Copy, Debug)]
pub struct AtlasSettings {
    /// Pixel padding between charts at the target resolution.
    pub padding: u32,
}

impl Default for AtlasSettings {
    fn default() -> Self {
        Self { padding: 2 }
    }
}

#[derive(Debug, Error)]
pub enum AtlasError {
    #[error("mesh has no triangles")]
    Empty,

    #[error("mesh geometry is degenerate")]
    Degenerate,
}

/// Axis bins for chart grouping: +-X, +-Y, +-Z.
fn dominant_axis(normal: Vec3) -> usize {
    let abs = normal.abs();
    if abs.x >= abs.y && abs.x >= abs.z {
        if normal.x >= 0.0 { 0 } else { 1 }
    } else if abs.y >= abs.z {
        if normal.y >= 0.0 { 2 } else { 3 }
    } else if normal.z >= 0.0 {
        4
    } else {
        5
    }
}

/// Project a position onto the chart plane of `axis`.
fn project(axis: usize, position: Vec3) -> Vec2 {
    match axis / 2 {
        0 => Vec2::new(position.z, position.y),
        1 => Vec2::new(position.x, position.z),
        _ => Vec2::new(position.x, position.y),
    }
}

struct Chart {
    axis: usize,
    triangles: Vec<usize>,
    min: Vec2,
    max: Vec2,
    /// Packed placement in atlas units, set by the shelf packer.
    offset: Vec2,
}

impl Chart {
    fn extent(&self) -> Vec2 {
        (self.max - self.min).max(Vec2::splat(1e-6))
    }
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut index: usize) -> usize {
        while self.parent[index] != index {
            self.parent[index] = self.parent[self.parent[index]];
            index = self.parent[index];
        }
        index
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}

/// Generate UV2 coordinates for `mesh` at the given lightmap resolution.
/// Reports coarse progress through `callback` when supplied.
#[profiling::function]
pub fn generate_uv2(
    mesh: &mut Mesh,
    resolution: u32,
    settings: &AtlasSettings,
    mut callback: Option<&mut dyn FnMut(f32)>,
) -> Result<(), AtlasError> {
    if mesh.triangle_count() == 0 {
        return Err(AtlasError::Empty);
    }

    let vertices = mesh.vertices().to_vec();
    let triangles = mesh.triangles().to_vec();

    let mut report = |fraction: f32| {
        if let Some(callback) = callback.as_mut() {
            callback(fraction);
        }
    };

    // Chart building: connect triangles that share a vertex and an axis bin.
    let tri_axis: Vec<usize> = triangles
        .iter()
        .map(|tri| {
            let v0 = vertices[tri.v0 as usize].position;
            let v1 = vertices[tri.v1 as usize].position;
            let v2 = vertices[tri.v2 as usize].position;
            dominant_axis((v1 - v0).cross(v2 - v0).normalize_or_zero())
        })
        .collect();

    let mut set = DisjointSet::new(triangles.len());
    let mut vertex_owner: HashMap<(u32, usize), usize> = HashMap::new();
    for (index, tri) in triangles.iter().enumerate() {
        let axis = tri_axis[index];
        for vertex in [tri.v0, tri.v1, tri.v2] {
            match vertex_owner.get(&(vertex, axis)) {
                Some(&other) => set.union(index, other),
                None => {
                    vertex_owner.insert((vertex, axis), index);
                }
            }
        }
    }
    report(0.25);

    let mut charts: Vec<Chart> = Vec::new();
    let mut chart_of_root: HashMap<usize, usize> = HashMap::new();
    let mut tri_chart = vec![0usize; triangles.len()];
    for index in 0..triangles.len() {
        let root = set.find(index);
        let chart_index = *chart_of_root.entry(root).or_insert_with(|| {
            charts.push(Chart {
                axis: tri_axis[root],
                triangles: Vec::new(),
                min: Vec2::splat(f32::MAX),
                max: Vec2::splat(f32::MIN),
                offset: Vec2::ZERO,
            });
            charts.len() - 1
        });
        charts[chart_index].triangles.push(index);
        tri_chart[index] = chart_index;

        let tri = &triangles[index];
        for vertex in [tri.v0, tri.v1, tri.v2] {
            let uv = project(charts[chart_index].axis, vertices[vertex as usize].position);
            charts[chart_index].min = charts[chart_index].min.min(uv);
            charts[chart_index].max = charts[chart_index].max.max(uv);
        }
    }
    report(0.5);

    // Shelf packing in world units, tallest charts first.
    let total_area: f32 = charts.iter().map(|c| c.extent().x * c.extent().y).sum();
    if !(total_area.is_finite() && total_area > 0.0) {
        return Err(AtlasError::Degenerate);
    }
    let span = total_area.sqrt() * 1.25;
    let gap = (settings.padding.max(1) as f32 / resolution.max(1) as f32) * span;

    let mut order: Vec<usize> = (0..charts.len()).collect();
    order.sort_by(|&a, &b| {
        charts[b]
            .extent()
            .y
            .partial_cmp(&charts[a].extent().y)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cursor = Vec2::ZERO;
    let mut shelf_height = 0.0f32;
    let mut used = Vec2::ZERO;
    for &chart_index in &order {
        let extent = charts[chart_index].extent();
        if cursor.x > 0.0 && cursor.x + extent.x > span {
            cursor.x = 0.0;
            cursor.y += shelf_height + gap;
            shelf_height = 0.0;
        }
        charts[chart_index].offset = cursor;
        cursor.x += extent.x + gap;
        shelf_height = shelf_height.max(extent.y);
        used.x = used.x.max(cursor.x);
        used.y = used.y.max(cursor.y + shelf_height);
    }
    let scale = 1.0 / used.max_element().max(1e-6);
    report(0.75);

    // Seam splitting: one output vertex per (input vertex, chart).
    let mut new_vertices = Vec::with_capacity(vertices.len());
    let mut new_triangles = Vec::with_capacity(triangles.len());
    let mut remap: HashMap<(u32, usize), u32> = HashMap::new();
    for (index, tri) in triangles.iter().enumerate() {
        let chart_index = tri_chart[index];
        let mut indices = [0u32; 3];
        for (slot, vertex_index) in [tri.v0, tri.v1, tri.v2].into_iter().enumerate() {
            let key = (vertex_index, chart_index);
            let mapped = match remap.get(&key) {
                Some(&mapped) => mapped,
                None => {
                    let chart = &charts[chart_index];
                    let mut vertex = vertices[vertex_index as usize];
                    let local = project(chart.axis, vertex.position) - chart.min;
                    vertex.uv2 = (chart.offset + local) * scale;
                    let mapped = new_vertices.len() as u32;
                    new_vertices.push(vertex);
                    remap.insert(key, mapped);
                    mapped
                }
            };
            indices[slot] = mapped;
        }
        new_triangles.push(Triangle::new(indices[0], indices[1], indices[2]));
    }

    mesh.set_vertices(new_vertices);
    mesh.set_triangles(new_triangles);
    mesh.set_has_uv2(true);
    report(1.0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_gets_a_single_full_chart() {
        let mut mesh = Mesh::plane(4.0);
        generate_uv2(&mut mesh, 64, &AtlasSettings::default(), None).unwrap();
        assert!(mesh.has_uv2());

        for vertex in mesh.vertices() {
            assert!(vertex.uv2.x >= 0.0 && vertex.uv2.x <= 1.0);
            assert!(vertex.uv2.y >= 0.0 && vertex.uv2.y <= 1.0);
        }
        // A lone chart should cover most of the atlas.
        let max = mesh
            .vertices()
            .iter()
            .fold(Vec2::ZERO, |acc, v| acc.max(v.uv2));
        assert!(max.x > 0.5 && max.y > 0.5);
    }

    #[test]
    fn cube_charts_do_not_overlap() {
        let mut mesh = Mesh::unit_cube();
        generate_uv2(&mut mesh, 128, &AtlasSettings::default(), None).unwrap();

        // Each cube face becomes one chart (two triangles). Per-face uv2
        // bounding boxes must be pairwise disjoint after packing.
        let vertices = mesh.vertices();
        let mut boxes: Vec<(Vec2, Vec2)> = Vec::new();
        for face in 0..6 {
            let mut min = Vec2::splat(f32::MAX);
            let mut max = Vec2::splat(f32::MIN);
            for tri in &mesh.triangles()[face * 2..face * 2 + 2] {
                for index in [tri.v0, tri.v1, tri.v2] {
                    let uv = vertices[index as usize].uv2;
                    min = min.min(uv);
                    max = max.max(uv);
                }
            }
            boxes.push((min, max));
        }
        for a in 0..boxes.len() {
            for b in a + 1..boxes.len() {
                let (amin, amax) = boxes[a];
                let (bmin, bmax) = boxes[b];
                let eps = 1e-4;
                let disjoint = amax.x <= bmin.x + eps
                    || bmax.x <= amin.x + eps
                    || amax.y <= bmin.y + eps
                    || bmax.y <= amin.y + eps;
                assert!(disjoint, "charts {a} and {b} overlap");
            }
        }
    }

    #[test]
    fn seam_split_grows_vertex_count() {
        let mut mesh = Mesh::unit_cube();
        let before = mesh.vertex_count();
        generate_uv2(&mut mesh, 64, &AtlasSettings::default(), None).unwrap();
        // The cube's 24-vertex layout is already split per face, so the
        // count must at least stay put; indices must stay valid.
        assert!(mesh.vertex_count() >= before);
        for tri in mesh.triangles() {
            assert!((tri.v0 as usize) < mesh.vertex_count());
            assert!((tri.v1 as usize) < mesh.vertex_count());
            assert!((tri.v2 as usize) < mesh.vertex_count());
        }
    }

    #[test]
    fn empty_mesh_is_rejected() {
        let mut mesh = Mesh::new("empty");
        assert!(matches!(
            generate_uv2(&mut mesh, 64, &AtlasSettings::default(), None),
            Err(AtlasError::Empty)
        ));
    }
}
