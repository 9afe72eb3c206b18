//! Interactive transform gizmos: translate, rotate, scale.
//!
//! Each gizmo owns unit-space handle meshes and a coordinate-space flag. On
//! mouse-down it builds a pick ray from the current view state and hit-tests
//! each axis mesh at the gizmo's model matrix (position + target rotation in
//! local space + screen-constant scale); the closest hit becomes the active
//! axis for the drag.

mod rotate;
mod scale;
mod terrain;
mod translate;

pub use {
    rotate::RotateGizmo, scale::ScaleGizmo, terrain::TerrainGizmo, translate::TranslateGizmo,
};

use {
    crate::{
        raycast::ray_triangle,
        render::mesh::Mesh,
        scene::{
            camera::pick_ray,
            node::{NodeRef, NodeWeak},
        },
    },
    glam::{Mat3, Mat4, Vec2, Vec3},
    std::rc::Rc,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GizmoAxis {
    #[default]
    None,
    X,
    Y,
    Z,
}

impl GizmoAxis {
    pub fn direction(self) -> Vec3 {
        match self {
            Self::X => Vec3::X,
            Self::Y => Vec3::Y,
            Self::Z => Vec3::Z,
            Self::None => Vec3::ZERO,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GizmoSpace {
    #[default]
    Local,
    Global,
}

/// A world-space pick ray.
#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MeshHit {
    pub hit: bool,
    pub distance: f32,
}

/// State shared by every gizmo flavor.
pub struct GizmoCommon {
    pub position: Vec3,
    target: NodeWeak,
    view: Mat4,
    viewport: (u32, u32),
    space: GizmoSpace,

    pub dragging: bool,
    pub active_axis: GizmoAxis,
    pub last_mouse: Vec2,
    pub drag_start_position: Vec3,
    pub drag_start_rotation: Mat3,
    pub drag_start_scale: Vec3,
    pub drag_start_angle: f32,
}

impl Default for GizmoCommon {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            target: NodeWeak::new(),
            view: Mat4::IDENTITY,
            viewport: (0, 0),
            space: GizmoSpace::Local,
            dragging: false,
            active_axis: GizmoAxis::None,
            last_mouse: Vec2::ZERO,
            drag_start_position: Vec3::ZERO,
            drag_start_rotation: Mat3::IDENTITY,
            drag_start_scale: Vec3::ONE,
            drag_start_angle: 0.0,
        }
    }
}

impl GizmoCommon {
    pub fn set_target(&mut self, node: &NodeRef) {
        self.target = Rc::downgrade(node);
        self.sync_with_target();
    }

    pub fn target(&self) -> Option<NodeRef> {
        self.target.upgrade()
    }

    pub fn set_space(&mut self, space: GizmoSpace) {
        self.space = space;
    }

    pub fn space(&self) -> GizmoSpace {
        self.space
    }

    /// View state fed from the viewport each frame, used for picking and
    /// screen-constant sizing.
    pub fn set_view_state(&mut self, view: Mat4, width: u32, height: u32) {
        self.view = view;
        self.viewport = (width, height);
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.viewport = (width, height);
    }

    pub fn sync_with_target(&mut self) {
        if let Some(target) = self.target.upgrade() {
            self.position = target.borrow().world_position();
        }
    }

    pub fn camera_position(&self) -> Vec3 {
        self.view.inverse().w_axis.truncate()
    }

    pub fn pick_ray(&self, mouse_x: f32, mouse_y: f32) -> Ray {
        let (origin, direction) =
            pick_ray(self.view, self.viewport.0, self.viewport.1, mouse_x, mouse_y);
        Ray { origin, direction }
    }

    /// Scale factor keeping the gizmo a constant apparent size.
    pub fn screen_constant_scale(&self) -> f32 {
        let distance = (self.camera_position() - self.position).length();
        (0.15 * distance).clamp(0.01, 100.0)
    }

    /// Gizmo orientation: world axes in global space, the target's
    /// normalized rotation in local space.
    pub fn gizmo_rotation(&self) -> Mat3 {
        if self.space == GizmoSpace::Global {
            return Mat3::IDENTITY;
        }
        let Some(target) = self.target.upgrade() else {
            return Mat3::IDENTITY;
        };
        let world = target.borrow().base_world_matrix();
        Mat3::from_cols(
            world.x_axis.truncate().normalize_or_zero(),
            world.y_axis.truncate().normalize_or_zero(),
            world.z_axis.truncate().normalize_or_zero(),
        )
    }

    /// Model matrix the handle meshes are tested and drawn at.
    pub fn model_matrix(&self) -> Mat4 {
        Mat4::from_translation(self.position)
            * Mat4::from_mat3(self.gizmo_rotation())
            * Mat4::from_scale(Vec3::splat(self.screen_constant_scale()))
    }

    /// World-space direction of `axis` respecting the coordinate space.
    pub fn axis_direction(&self, axis: GizmoAxis) -> Vec3 {
        (self.gizmo_rotation() * axis.direction()).normalize_or_zero()
    }

    /// Project a mouse delta onto an axis's screen-space direction and
    /// scale by camera distance so handle motion matches cursor motion.
    pub fn screen_axis_movement(&self, mouse_delta: Vec2, axis: GizmoAxis, proj: Mat4) -> f32 {
        let axis_dir = self.axis_direction(axis);
        let view_proj = proj * self.view;
        let center = view_proj * self.position.extend(1.0);
        let tip = view_proj * (self.position + axis_dir).extend(1.0);
        if center.w <= 1e-3 || tip.w <= 1e-3 {
            return 0.0;
        }
        let center = center / center.w;
        let tip = tip / tip.w;

        // Screen Y grows downward.
        let screen_axis = Vec2::new(tip.x - center.x, center.y - tip.y);
        let length = screen_axis.length();
        if length < 1e-3 {
            return 0.0;
        }
        let screen_axis = screen_axis / length;

        let (width, height) = self.viewport;
        if width == 0 || height == 0 {
            return 0.0;
        }
        let normalized = mouse_delta / Vec2::new(width as f32, height as f32) * 2.0;
        let movement = normalized.dot(screen_axis);

        let distance = (self.camera_position() - self.position).length();
        movement * distance * 2.0
    }
}

/// CPU hit test of a handle mesh at `model`; returns the nearest `t` along
/// the (normalized) pick ray.
pub fn hit_test_mesh(ray: &Ray, mesh: &Mesh, model: Mat4) -> MeshHit {
    let mut result = MeshHit {
        hit: false,
        distance: f32::MAX,
    };
    let vertices = mesh.vertices();
    for tri in mesh.triangles() {
        let fetch = |index: u32| {
            vertices
                .get(index as usize)
                .map(|v| model.transform_point3(v.position))
        };
        let (Some(v0), Some(v1), Some(v2)) = (fetch(tri.v0), fetch(tri.v1), fetch(tri.v2)) else {
            continue;
        };
        if let Some(t) = ray_triangle(ray.origin, ray.direction, v0, v1, v2) {
            if t < result.distance {
                result.hit = true;
                result.distance = t;
            }
        }
    }
    result
}

/// Build an arrow handle of unit length pointing along `dir`: a thin box
/// shaft plus a pyramid head.
pub(crate) fn arrow_mesh(name: &str, dir: Vec3) -> Mesh {
    let mut mesh = Mesh::new(name);
    let up = if dir.y.abs() > 0.9 { Vec3::X } else { Vec3::Y };
    let right = dir.cross(up).normalize();
    let up = right.cross(dir).normalize();

    let shaft_len = 0.8f32;
    let shaft_thickness = 0.04f32;
    let head_len = 0.2f32;
    let head_width = 0.1f32;

    // Shaft: box from origin to shaft_len.
    let r = right * shaft_thickness;
    let u = up * shaft_thickness;
    let tip_base = dir * shaft_len;
    for (side_a, side_b) in [(r, u), (u, -r), (-r, -u), (-u, r)] {
        let quad = [
            side_a + side_b,
            tip_base + side_a + side_b,
            tip_base + side_a - side_b,
            side_a - side_b,
        ];
        let base = mesh.vertex_count() as u32;
        for position in quad {
            mesh.add_vertex(crate::render::mesh::Vertex::at(position));
        }
        mesh.add_triangle_indices(base, base + 1, base + 2);
        mesh.add_triangle_indices(base, base + 2, base + 3);
    }

    // Head: pyramid from tip_base to the unit tip.
    let tip = dir;
    let hr = right * head_width;
    let hu = up * head_width;
    let corners = [
        tip_base + hr + hu,
        tip_base + hr - hu,
        tip_base - hr - hu,
        tip_base - hr + hu,
    ];
    let apex_index = {
        mesh.add_vertex(crate::render::mesh::Vertex::at(tip));
        (mesh.vertex_count() - 1) as u32
    };
    for index in 0..4 {
        let base = mesh.vertex_count() as u32;
        mesh.add_vertex(crate::render::mesh::Vertex::at(corners[index]));
        mesh.add_vertex(crate::render::mesh::Vertex::at(corners[(index + 1) % 4]));
        mesh.add_triangle_indices(base, base + 1, apex_index);
    }
    // Base cap.
    let base = mesh.vertex_count() as u32;
    for corner in corners {
        mesh.add_vertex(crate::render::mesh::Vertex::at(corner));
    }
    mesh.add_triangle_indices(base, base + 1, base + 2);
    mesh.add_triangle_indices(base, base + 2, base + 3);

    mesh.recalculate_normals();
    mesh.recalculate_bounds();
    mesh
}

/// Build a flat ring (torus band) of radius 1 in the plane orthogonal to
/// `axis`.
pub(crate) fn ring_mesh(name: &str, axis: Vec3) -> Mesh {
    let mut mesh = Mesh::new(name);
    let up = if axis.y.abs() > 0.9 { Vec3::X } else { Vec3::Y };
    let tangent = axis.cross(up).normalize();
    let bitangent = axis.cross(tangent).normalize();

    const SEGMENTS: u32 = 48;
    let inner = 0.95f32;
    let outer = 1.05f32;
    let half_depth = 0.02f32;

    for segment in 0..SEGMENTS {
        let angle = segment as f32 / SEGMENTS as f32 * std::f32::consts::TAU;
        let radial = tangent * angle.cos() + bitangent * angle.sin();
        for (radius, depth) in [
            (outer, half_depth),
            (outer, -half_depth),
            (inner, -half_depth),
            (inner, half_depth),
        ] {
            mesh.add_vertex(crate::render::mesh::Vertex::at(
                radial * radius + axis * depth,
            ));
        }
    }
    for segment in 0..SEGMENTS {
        let base = segment * 4;
        let next = ((segment + 1) % SEGMENTS) * 4;
        for (a, b, c, d) in [
            (base, next, next + 3, base + 3),
            (base + 1, base + 2, next + 2, next + 1),
            (base, base + 1, next + 1, next),
            (base + 3, next + 3, next + 2, base + 2),
        ] {
            mesh.add_triangle_indices(a, b, c);
            mesh.add_triangle_indices(a, c, d);
        }
    }

    mesh.recalculate_normals();
    mesh.recalculate_bounds();
    mesh
}

/// Build a scale handle: a thin shaft ending in a cube cap.
pub(crate) fn scale_handle_mesh(name: &str, dir: Vec3) -> Mesh {
    let mut mesh = arrow_mesh(name, dir);
    // Replace the pyramid head visually by widening: simplest is appending a
    // cube at the tip; the pick test covers both.
    let h = 0.08f32;
    let center = dir * 1.0;
    let up = if dir.y.abs() > 0.9 { Vec3::X } else { Vec3::Y };
    let right = dir.cross(up).normalize() * h;
    let top = up * h;
    let forward = dir * h;
    let corners = [
        center - right - top - forward,
        center + right - top - forward,
        center + right + top - forward,
        center - right + top - forward,
        center - right - top + forward,
        center + right - top + forward,
        center + right + top + forward,
        center - right + top + forward,
    ];
    let base = mesh.vertex_count() as u32;
    for corner in corners {
        mesh.add_vertex(crate::render::mesh::Vertex::at(corner));
    }
    for (a, b, c, d) in [
        (0, 1, 2, 3),
        (5, 4, 7, 6),
        (4, 0, 3, 7),
        (1, 5, 6, 2),
        (3, 2, 6, 7),
        (4, 5, 1, 0),
    ] {
        mesh.add_triangle_indices(base + a, base + b, base + c);
        mesh.add_triangle_indices(base + a, base + c, base + d);
    }
    mesh.recalculate_normals();
    mesh.recalculate_bounds();
    mesh
}

/// Shared axis picking: test the three handle meshes and return the closest
/// hit axis.
pub(crate) fn pick_axis(
    common: &GizmoCommon,
    ray: &Ray,
    handles: [(&Mesh, GizmoAxis); 3],
) -> GizmoAxis {
    let model = common.model_matrix();
    let mut closest = f32::MAX;
    let mut axis = GizmoAxis::None;
    for (mesh, candidate) in handles {
        let hit = hit_test_mesh(ray, mesh, model);
        if hit.hit && hit.distance < closest {
            closest = hit.distance;
            axis = candidate;
        }
    }
    axis
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrow_points_along_its_axis() {
        let mesh = arrow_mesh("x", Vec3::X);
        let (min, max) = mesh.bounds();
        assert!(max.x > 0.99);
        assert!(min.x >= -1e-6);
        assert!(max.y.abs() < 0.2 && max.z.abs() < 0.2);
    }

    #[test]
    fn ray_hits_arrow_handle() {
        let mesh = arrow_mesh("x", Vec3::X);
        let ray = Ray {
            origin: Vec3::new(0.5, 0.0, 2.0),
            direction: Vec3::NEG_Z,
        };
        let hit = hit_test_mesh(&ray, &mesh, Mat4::IDENTITY);
        assert!(hit.hit);
        assert!((hit.distance - 2.0).abs() < 0.2);
    }

    #[test]
    fn ring_lies_in_plane() {
        let mesh = ring_mesh("y", Vec3::Y);
        let (min, max) = mesh.bounds();
        assert!(max.y < 0.05 && min.y > -0.05);
        assert!(max.x > 1.0 && max.z > 1.0);
    }
}
