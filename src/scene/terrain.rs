//! Layered terrain surfaces: a centered grid mesh, up to four texture
//! layers blended through editable blend maps, and the paint/sculpt brush
//! operations the terrain editor drives through the raycaster.

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

pub const MAX_TERRAIN_LAYERS: usize = 4;
/// Resolution of every layer blend map.
pub const BLEND_MAP_SIZE: usize = 512;

/// Which texture of a layer a runtime update targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerTexture {
    Color,
    Normal,
    Specular,
}

/// One texture layer: color/normal/specular maps tiled across the surface,
/// plus a blend map whose R channel is this layer's strength at each point.
/// Source paths stick around for serialization and editor display.
#[derive(Clone, Debug, Default)]
pub struct TerrainLayer {
    pub color_map: Option<Arc<Texture>>,
    pub normal_map: Option<Arc<Texture>>,
    pub specular_map: Option<Arc<Texture>>,
    pub layer_map: Option<Arc<Texture>>,

    pub color_path: Option<String>,
    pub normal_path: Option<String>,
    pub specular_path: Option<String>,
}

/// A texture swap requested away from the render thread; applied by
/// [`Terrain::process_pending_updates`] at frame start.
#[derive(Clone, Debug)]
pub struct PendingTextureUpdate {
    pub layer: usize,
    pub kind: LayerTexture,
    pub path: String,
}

/// The terrain payload carried by [`NodeKind::Terrain`]. The grid mesh
/// itself lives on the node like any other mesh; this holds dimensions,
/// layers and the CPU blend maps the brush writes into.
#[derive(Clone, Debug)]
pub struct Terrain {
    width: f32,
    depth: f32,
    divisions: u32,
    layer_count: usize,

    layers: Vec<TerrainLayer>,
    /// RGBA blend data per layer; only R carries weight.
    blend_maps: Vec<Vec<u8>>,
    layer_dirty: Vec<bool>,
    any_layer_dirty: bool,
    descriptor_dirty: bool,

    pending: Vec<PendingTextureUpdate>,
}

impl Terrain {
    pub fn new(width: f32, depth: f32, divisions: u32, layer_count: usize) -> Self {
        let layer_count = layer_count.clamp(1, MAX_TERRAIN_LAYERS);
        let data_size = BLEND_MAP_SIZE * BLEND_MAP_SIZE * 4;

        // Layer 0 starts at full strength, the rest at zero; alpha opaque.
        let mut blend_maps = Vec::with_capacity(layer_count);
        for layer in 0..layer_count {
            let mut data = vec![0u8; data_size];
            for texel in data.chunks_exact_mut(4) {
                texel[0] = if layer == 0 { 255 } else { 0 };
                texel[3] = 255;
            }
            blend_maps.push(data);
        }

        Self {
            width,
            depth,
            divisions: divisions.max(1),
            layer_count,
            layers: vec![TerrainLayer::default(); layer_count],
            blend_maps,
            layer_dirty: vec![true; layer_count],
            any_layer_dirty: true,
            descriptor_dirty: false,
            pending: Vec::new(),
        }
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn depth(&self) -> f32 {
        self.depth
    }

    pub fn divisions(&self) -> u32 {
        self.divisions
    }

    pub fn layer_count(&self) -> usize {
        self.layer_count
    }

    pub fn layer(&self, index: usize) -> &TerrainLayer {
        &self.layers[index.min(self.layer_count - 1)]
    }

    pub fn layer_mut(&mut self, index: usize) -> &mut TerrainLayer {
        let index = index.min(self.layer_count - 1);
        &mut self.layers[index]
    }

    /// Whether a texture change invalidated the terrain's descriptor set.
    pub fn needs_descriptor_update(&self) -> bool {
        self.descriptor_dirty
    }

    pub fn clear_descriptor_dirty(&mut self) {
        self.descriptor_dirty = false;
    }

    /// Queue a layer texture swap by path. Safe to call from editor panels;
    /// the swap applies on the render thread in
    /// [`Self::process_pending_updates`].
    pub fn set_layer_texture(&mut self, layer: usize, kind: LayerTexture, path: impl Into<String>) {
        if layer >= self.layer_count {
            return;
        }
        self.pending.push(PendingTextureUpdate {
            layer,
            kind,
            path: path.into(),
        });
    }

    /// Apply queued texture swaps, resolving each path through `loader`.
    /// Runs on the render thread between frames.
    pub fn process_pending_updates(
        &mut self,
        loader: &mut dyn FnMut(&str, LayerTexture) -> Option<Arc<Texture>>,
    ) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        for update in pending {
            let Some(texture) = loader(&update.path, update.kind) else {
                log::warn!("terrain: cannot load layer texture '{}'", update.path);
                continue;
            };
            let layer = &mut self.layers[update.layer];
            match update.kind {
                LayerTexture::Color => {
                    layer.color_path = Some(update.path);
                    layer.color_map = Some(texture);
                }
                LayerTexture::Normal => {
                    layer.normal_path = Some(update.path);
                    layer.normal_map = Some(texture);
                }
                LayerTexture::Specular => {
                    layer.specular_path = Some(update.path);
                    layer.specular_map = Some(texture);
                }
            }
        }
        self.descriptor_dirty = true;
    }

    /// Blend weight of `layer` at normalized terrain coordinates, 0..=1.
    pub fn blend_weight(&self, layer: usize, u: f32, v: f32) -> f32 {
        if layer >= self.layer_count {
            return 0.0;
        }
        let x = ((u * BLEND_MAP_SIZE as f32) as usize).min(BLEND_MAP_SIZE - 1);
        let y = ((v * BLEND_MAP_SIZE as f32) as usize).min(BLEND_MAP_SIZE - 1);
        self.blend_maps[layer][(y * BLEND_MAP_SIZE + x) * 4] as f32 / 255.0
    }

    /// Brush a layer's weight up around a local-space hit point with linear
    /// falloff, then renormalize all layers at each touched texel so the
    /// weights keep summing to one.
    pub fn paint(&mut self, local_hit: Vec3, layer: usize, radius: f32, strength: f32) {
        if layer >= self.layer_count {
            return;
        }

        let u = (local_hit.x + self.width * 0.5) / self.width;
        let v = (local_hit.z + self.depth * 0.5) / self.depth;
        let center_x = (u * BLEND_MAP_SIZE as f32) as i32;
        let center_y = (v * BLEND_MAP_SIZE as f32) as i32;

        let pixel_radius = ((radius / self.width) * BLEND_MAP_SIZE as f32) as i32;
        if pixel_radius <= 0 {
            return;
        }
        let dist_sq_limit = pixel_radius * pixel_radius;

        let max = BLEND_MAP_SIZE as i32 - 1;
        let min_x = (center_x - pixel_radius).max(0);
        let max_x = (center_x + pixel_radius).min(max);
        let min_y = (center_y - pixel_radius).max(0);
        let max_y = (center_y + pixel_radius).min(max);

        for y in min_y..=max_y {
            for x in min_x..=max_x {
                let dist_sq = (x - center_x).pow(2) + (y - center_y).pow(2);
                if dist_sq > dist_sq_limit {
                    continue;
                }
                let falloff =
                    (1.0 - (dist_sq as f32).sqrt() / pixel_radius as f32).max(0.0);
                let index = (y as usize * BLEND_MAP_SIZE + x as usize) * 4;

                let current = self.blend_maps[layer][index] as f32;
                let raised = (current + strength * falloff * 255.0).min(255.0);
                self.blend_maps[layer][index] = raised as u8;
                self.layer_dirty[layer] = true;
                self.any_layer_dirty = true;

                // Renormalize so the layer weights still sum to 255.
                let total: f32 = (0..self.layer_count)
                    .map(|l| self.blend_maps[l][index] as f32)
                    .sum();
                if total > 0.1 {
                    for l in 0..self.layer_count {
                        let weight = self.blend_maps[l][index] as f32;
                        self.blend_maps[l][index] = ((weight / total) * 255.0) as u8;
                        self.layer_dirty[l] = true;
                    }
                }
            }
        }
    }

    /// Re-upload dirty blend maps as layer-map textures. No-op while
    /// nothing changed or without a device.
    pub fn upload_blend_maps(&mut self, device: &Arc<Device>) -> Result<(), DriverError> {
        if !self.any_layer_dirty {
            return Ok(());
        }
        for layer in 0..self.layer_count {
            if !self.layer_dirty[layer] {
                continue;
            }
            let texture = Texture::from_rgba8(
                device,
                format!("terrain:layer{layer}"),
                BLEND_MAP_SIZE as u32,
                BLEND_MAP_SIZE as u32,
                &self.blend_maps[layer],
            )?;
            self.layers[layer].layer_map = Some(Arc::new(texture));
            self.layer_dirty[layer] = false;
        }
        self.any_layer_dirty = false;
        self.descriptor_dirty = true;
        Ok(())
    }
}

/// Build the centered grid mesh: vertices span half extents either side of
/// the origin, UVs run 0..1 across the whole surface so the blend maps line
/// up.
fn terrain_mesh(width: f32, depth: f32, divisions: u32) -> Mesh {
    let mut mesh = Mesh::new("TerrainMesh");
    let divisions = divisions.max(1);
    let half_width = width * 0.5;
    let half_depth = depth * 0.5;
    let step_x = width / divisions as f32;
    let step_z = depth / divisions as f32;

    let mut vertices = Vec::with_capacity(((divisions + 1) * (divisions + 1)) as usize);
    for z in 0..=divisions {
        for x in 0..=divisions {
            let position = Vec3::new(
                -half_width + x as f32 * step_x,
                0.0,
                -half_depth + z as f32 * step_z,
            );
            let uv = Vec2::new(
                x as f32 / divisions as f32,
                z as f32 / divisions as f32,
            );
            vertices.push(Vertex::new(position, Vec3::Y, uv));
        }
    }

    let mut triangles = Vec::with_capacity((divisions * divisions * 2) as usize);
    for z in 0..divisions {
        for x in 0..divisions {
            let top_left = z * (divisions + 1) + x;
            let top_right = top_left + 1;
            let bottom_left = (z + 1) * (divisions + 1) + x;
            let bottom_right = bottom_left + 1;
            triangles.push(Triangle::new(top_left, bottom_left, top_right));
            triangles.push(Triangle::new(top_right, bottom_left, bottom_right));
        }
    }

    mesh.set_vertices(vertices);
    mesh.set_triangles(triangles);
    mesh.recalculate_normals();
    mesh.recalculate_tangents();
    mesh.recalculate_bounds();
    mesh
}

/// Create a terrain node: the grid mesh attached, the layer payload in the
/// node kind.
pub fn terrain_node(
    name: impl Into<String>,
    width: f32,
    depth: f32,
    divisions: u32,
    layer_count: usize,
) -> NodeRef {
    let node = SceneNode::with_kind(
        name,
        NodeKind::Terrain(Box::new(Terrain::new(width, depth, divisions, layer_count))),
    );
    node.borrow_mut()
        .add_mesh(terrain_mesh(width, depth, divisions).into_ref());
    node
}

/// Create GPU-side defaults (neutral layer textures, blend-map uploads, the
/// terrain material) and upload the grid mesh.
pub fn initialize(node: &NodeRef, device: &Arc<Device>) -> Result<(), DriverError> {
    let mesh = node.borrow().meshes().first().cloned();
    let Some(mesh) = mesh else {
        return Err(DriverError::InvalidData);
    };

    {
        let mut borrowed = node.borrow_mut();
        let Some(terrain) = borrowed.terrain_mut() else {
            return Err(DriverError::InvalidData);
        };

        let white = Arc::new(Texture::from_rgba8(device, "white", 1, 1, &[255; 4])?);
        // Flat tangent-space normal; UNORM so no gamma is applied.
        let flat_normal =
            Arc::new(Texture::from_rgba8(device, "flat-normal", 1, 1, &[128, 128, 255, 255])?);
        let grey = Arc::new(Texture::from_rgba8(device, "grey", 1, 1, &[128, 128, 128, 255])?);

        for index in 0..terrain.layer_count() {
            let layer = terrain.layer_mut(index);
            if layer.color_map.is_none() {
                layer.color_map = Some(Arc::clone(&white));
            }
            if layer.normal_map.is_none() {
                layer.normal_map = Some(Arc::clone(&flat_normal));
            }
            if layer.specular_map.is_none() {
                layer.specular_map = Some(Arc::clone(&grey));
            }
        }
        terrain.upload_blend_maps(device)?;
    }

    let mut locked = mesh.lock();
    if locked.material().is_none() {
        let mut material = Material::new("TerrainMaterial");
        material.set_pipeline("Terrain");
        locked.set_material(Arc::new(Mutex::new(material)));
    }
    if !locked.is_finalized() {
        locked.finalize(device)?;
    }
    Ok(())
}

/// Per-frame terrain upkeep on the render thread: apply queued texture
/// swaps, then re-upload dirty blend maps.
pub fn frame_update(
    node: &NodeRef,
    device: Option<&Arc<Device>>,
    loader: Option<&mut dyn FnMut(&str, LayerTexture) -> Option<Arc<Texture>>>,
) {
    let mut borrowed = node.borrow_mut();
    let Some(terrain) = borrowed.terrain_mut() else {
        return;
    };
    if let Some(loader) = loader {
        terrain.process_pending_updates(loader);
    }
    if let Some(device) = device {
        if let Err(err) = terrain.upload_blend_maps(device) {
            log::warn!("terrain: blend map upload failed: {err}");
        }
    }
}

/// Paint a layer's blend weight around a world-space brush hit.
pub fn paint(node: &NodeRef, world_hit: Vec3, layer: usize, radius: f32, strength: f32) {
    let local_hit = {
        let borrowed = node.borrow();
        borrowed
            .base_world_matrix()
            .inverse()
            .transform_point3(world_hit)
    };
    let mut borrowed = node.borrow_mut();
    if let Some(terrain) = borrowed.terrain_mut() {
        terrain.paint(local_hit, layer, radius, strength);
    }
}

/// Raise (or with negative strength lower) the terrain surface around a
/// world-space brush hit with smoothstep falloff. The grid layout lets the
/// brush address vertices directly instead of scanning the whole mesh.
pub fn sculpt(node: &NodeRef, world_hit: Vec3, radius: f32, strength: f32) {
    let (mesh, local_hit, width, depth, divisions) = {
        let borrowed = node.borrow();
        let Some(terrain) = borrowed.terrain() else {
            return;
        };
        let Some(mesh) = borrowed.meshes().first().cloned() else {
            return;
        };
        let local_hit = borrowed
            .base_world_matrix()
            .inverse()
            .transform_point3(world_hit);
        (
            mesh,
            local_hit,
            terrain.width(),
            terrain.depth(),
            terrain.divisions(),
        )
    };

    let cell_w = width / divisions as f32;
    let cell_d = depth / divisions as f32;
    let center_x = ((local_hit.x + width * 0.5) / cell_w) as i32;
    let center_z = ((local_hit.z + depth * 0.5) / cell_d) as i32;
    let grid_radius = (radius / cell_w) as i32 + 1;

    let min_x = (center_x - grid_radius).max(0);
    let max_x = (center_x + grid_radius).min(divisions as i32);
    let min_z = (center_z - grid_radius).max(0);
    let max_z = (center_z + grid_radius).min(divisions as i32);
    let radius_sq = radius * radius;

    let mut locked = mesh.lock();
    let mut changed = false;
    locked.edit_vertices(|vertices| {
        for z in min_z..=max_z {
            for x in min_x..=max_x {
                let index = (z as u32 * (divisions + 1) + x as u32) as usize;
                let Some(vertex) = vertices.get_mut(index) else {
                    continue;
                };
                let dx = vertex.position.x - local_hit.x;
                let dz = vertex.position.z - local_hit.z;
                let dist_sq = dx * dx + dz * dz;
                if dist_sq >= radius_sq {
                    continue;
                }
                let t = 1.0 - dist_sq.sqrt() / radius;
                let falloff = t * t * (3.0 - 2.0 * t);
                vertex.position.y += strength * falloff * 0.5;
                changed = true;
            }
        }
    });
    if changed {
        locked.recalculate_normals();
        locked.recalculate_bounds();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_mesh_dimensions_and_uv_span() {
        let node = terrain_node("ground", 100.0, 100.0, 10, 4);
        let mesh = node.borrow().meshes()[0].clone();
        let mesh = mesh.lock();
        assert_eq!(mesh.vertex_count(), 11 * 11);
        assert_eq!(mesh.triangle_count(), 10 * 10 * 2);

        let first = mesh.vertices()[0];
        let last = mesh.vertices()[mesh.vertex_count() - 1];
        assert_eq!(first.position, Vec3::new(-50.0, 0.0, -50.0));
        assert_eq!(first.uv, Vec2::ZERO);
        assert_eq!(last.position, Vec3::new(50.0, 0.0, 50.0));
        assert_eq!(last.uv, Vec2::ONE);
    }

    #[test]
    fn layer_count_is_clamped() {
        let terrain = Terrain::new(10.0, 10.0, 4, 9);
        assert_eq!(terrain.layer_count(), MAX_TERRAIN_LAYERS);
        let terrain = Terrain::new(10.0, 10.0, 4, 0);
        assert_eq!(terrain.layer_count(), 1);
    }

    #[test]
    fn blend_maps_start_with_layer_zero_full() {
        let terrain = Terrain::new(10.0, 10.0, 4, 3);
        assert_eq!(terrain.blend_weight(0, 0.5, 0.5), 1.0);
        assert_eq!(terrain.blend_weight(1, 0.5, 0.5), 0.0);
        assert_eq!(terrain.blend_weight(2, 0.5, 0.5), 0.0);
    }

    #[test]
    fn paint_raises_a_layer_and_keeps_weights_normalized() {
        let mut terrain = Terrain::new(100.0, 100.0, 10, 2);
        terrain.paint(Vec3::ZERO, 1, 10.0, 1.0);

        let painted = terrain.blend_weight(1, 0.5, 0.5);
        assert!(painted > 0.4, "painted weight {painted}");

        // Weights still sum to one at the brush center.
        let total = terrain.blend_weight(0, 0.5, 0.5) + painted;
        assert!((total - 1.0).abs() < 0.02, "total {total}");

        // Outside the brush the original layer is untouched.
        assert_eq!(terrain.blend_weight(0, 0.05, 0.05), 1.0);
    }

    #[test]
    fn sculpt_raises_vertices_inside_the_brush_only() {
        let node = terrain_node("ground", 100.0, 100.0, 20, 1);
        let version_before = node.borrow().meshes()[0].lock().geometry_version();

        sculpt(&node, Vec3::ZERO, 10.0, 2.0);

        let mesh = node.borrow().meshes()[0].clone();
        let mesh = mesh.lock();
        let center_index = (10 * 21 + 10) as usize;
        assert!(mesh.vertices()[center_index].position.y > 0.5);
        // A far corner stays flat.
        assert_eq!(mesh.vertices()[0].position.y, 0.0);
        // Sculpting is a geometry mutation: the raycaster cache must rebuild.
        assert!(mesh.geometry_version() > version_before);
        assert!(!mesh.is_finalized());
    }

    #[test]
    fn pending_texture_updates_apply_through_the_loader() {
        let mut terrain = Terrain::new(10.0, 10.0, 4, 2);
        terrain.set_layer_texture(1, LayerTexture::Color, "textures/rock.png");
        terrain.set_layer_texture(9, LayerTexture::Color, "ignored.png");

        let mut loaded = Vec::new();
        terrain.process_pending_updates(&mut |path, kind| {
            loaded.push((path.to_owned(), kind));
            Some(Arc::new(Texture::placeholder(path, 1, 1)))
        });

        assert_eq!(loaded.len(), 1);
        assert_eq!(terrain.layer(1).color_path.as_deref(), Some("textures/rock.png"));
        assert!(terrain.layer(1).color_map.is_some());
        assert!(terrain.needs_descriptor_update());

        terrain.clear_descriptor_dirty();
        assert!(!terrain.needs_descriptor_update());
    }
}
