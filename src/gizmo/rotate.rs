//! Axis-constrained rotation via ring handles.

use {
    super::{pick_axis, ring_mesh, GizmoAxis, GizmoCommon, Ray},
    crate::render::mesh::Mesh,
    glam::{Mat3, Quat, Vec2, Vec3},
};

pub struct RotateGizmo {
    pub common: GizmoCommon,
    ring_x: Mesh,
    ring_y: Mesh,
    ring_z: Mesh,
}

impl RotateGizmo {
    pub fn new() -> Self {
        Self {
            common: GizmoCommon::default(),
            ring_x: ring_mesh("gizmo:rotate:x", Vec3::X),
            ring_y: ring_mesh("gizmo:rotate:y", Vec3::Y),
            ring_z: ring_mesh("gizmo:rotate:z", Vec3::Z),
        }
    }

    pub fn handle_meshes(&self) -> [&Mesh; 3] {
        [&self.ring_x, &self.ring_y, &self.ring_z]
    }

    /// Intersect the pick ray with the active ring's plane and measure the
    /// angle of the hit around the ring center.
    fn plane_angle(&self, ray: &Ray, axis: GizmoAxis) -> Option<f32> {
        let normal = self.common.axis_direction(axis);
        let denom = normal.dot(ray.direction);
        if denom.abs() < 1e-6 {
            return None;
        }
        let t = normal.dot(self.common.position - ray.origin) / denom;
        if t < 0.0 {
            return None;
        }
        let hit = ray.origin + ray.direction * t;
        let radial = hit - self.common.position;

        // Signed angle in the ring plane's basis.
        let reference = if normal.y.abs() > 0.9 {
            Vec3::X
        } else {
            Vec3::Y
        };
        let tangent = normal.cross(reference).normalize();
        let bitangent = normal.cross(tangent);
        Some(radial.dot(bitangent).atan2(radial.dot(tangent)))
    }

    pub fn on_mouse_clicked(
        &mut self,
        x: f32,
        y: f32,
        pressed: bool,
        width: u32,
        height: u32,
    ) -> bool {
        if pressed {
            self.common.set_viewport(width, height);
            let ray = self.common.pick_ray(x, y);
            let hit = pick_axis(
                &self.common,
                &ray,
                [
                    (&self.ring_x, GizmoAxis::X),
                    (&self.ring_y, GizmoAxis::Y),
                    (&self.ring_z, GizmoAxis::Z),
                ],
            );
            if hit != GizmoAxis::None {
                self.common.dragging = true;
                self.common.active_axis = hit;
                self.common.last_mouse = Vec2::new(x, y);
                if let Some(target) = self.common.target() {
                    self.common.drag_start_rotation = target.borrow().local_rotation();
                }
                self.common.drag_start_angle = self.plane_angle(&ray, hit).unwrap_or(0.0);
                return true;
            }
            false
        } else if self.common.dragging {
            self.common.dragging = false;
            self.common.active_axis = GizmoAxis::None;
            true
        } else {
            false
        }
    }

    pub fn on_mouse_moved(&mut self, x: f32, y: f32) {
        if !self.common.dragging || self.common.active_axis == GizmoAxis::None {
            return;
        }
        let Some(target) = self.common.target() else {
            return;
        };

        let ray = self.common.pick_ray(x, y);
        let Some(angle) = self.plane_angle(&ray, self.common.active_axis) else {
            return;
        };
        let delta = angle - self.common.drag_start_angle;

        // Quaternion about the drag axis, applied relative to the start
        // orientation.
        let axis = self.common.axis_direction(self.common.active_axis);
        let rotation = Quat::from_axis_angle(axis, delta);
        let new_rotation = Mat3::from_quat(rotation) * self.common.drag_start_rotation;
        target.borrow_mut().set_local_rotation(new_rotation);
    }
}

impl Default for RotateGizmo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::scene::node::SceneNode, glam::Mat4};

    #[test]
    fn drag_around_y_rotates_the_target() {
        let node = SceneNode::new("box");
        let mut gizmo = RotateGizmo::new();
        gizmo.common.set_target(&node);
        gizmo.common.set_view_state(
            Mat4::look_at_rh(Vec3::new(0.0, 5.0, 0.01), Vec3::ZERO, Vec3::Y),
            800,
            600,
        );
        gizmo.common.dragging = true;
        gizmo.common.active_axis = GizmoAxis::Y;
        gizmo.common.drag_start_rotation = Mat3::IDENTITY;
        gizmo.common.drag_start_angle = 0.0;

        // Looking straight down, dragging across the screen sweeps the
        // ring plane.
        gizmo.on_mouse_moved(600.0, 300.0);
        let rotation = node.borrow().local_rotation();
        assert!(
            (rotation - Mat3::IDENTITY).abs_diff_eq(Mat3::ZERO, 1e-6) == false,
            "rotation should have changed"
        );
        // Still a pure rotation: orthonormal columns.
        let det = rotation.determinant();
        assert!((det - 1.0).abs() < 1e-4);
    }
}
