//! Axis-constrained scaling.

use {
    super::{pick_axis, scale_handle_mesh, GizmoAxis, GizmoCommon},
    crate::render::mesh::Mesh,
    glam::{Mat4, Vec2, Vec3},
};

pub struct ScaleGizmo {
    pub common: GizmoCommon,
    handle_x: Mesh,
    handle_y: Mesh,
    handle_z: Mesh,
}

impl ScaleGizmo {
    pub fn new() -> Self {
        Self {
            common: GizmoCommon::default(),
            handle_x: scale_handle_mesh("gizmo:scale:x", Vec3::X),
            handle_y: scale_handle_mesh("gizmo:scale:y", Vec3::Y),
            handle_z: scale_handle_mesh("gizmo:scale:z", Vec3::Z),
        }
    }

    pub fn handle_meshes(&self) -> [&Mesh; 3] {
        [&self.handle_x, &self.handle_y, &self.handle_z]
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
                    (&self.handle_x, GizmoAxis::X),
                    (&self.handle_y, GizmoAxis::Y),
                    (&self.handle_z, GizmoAxis::Z),
                ],
            );
            if hit != GizmoAxis::None {
                self.common.dragging = true;
                self.common.active_axis = hit;
                self.common.last_mouse = Vec2::new(x, y);
                if let Some(target) = self.common.target() {
                    self.common.drag_start_scale = target.borrow().local_scale();
                }
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

    /// Mouse delta along the axis's screen projection drives a
    /// multiplicative factor on that axis of the local scale.
    pub fn on_mouse_moved(&mut self, x: f32, y: f32, proj: Mat4) {
        if !self.common.dragging || self.common.active_axis == GizmoAxis::None {
            return;
        }
        let Some(target) = self.common.target() else {
            return;
        };

        let mouse = Vec2::new(x, y);
        let delta = mouse - self.common.last_mouse;
        self.common.last_mouse = mouse;

        let movement = self
            .common
            .screen_axis_movement(delta, self.common.active_axis, proj);
        let factor = (1.0 + movement).max(0.01);

        let mut scale = target.borrow().local_scale();
        match self.common.active_axis {
            GizmoAxis::X => scale.x *= factor,
            GizmoAxis::Y => scale.y *= factor,
            GizmoAxis::Z => scale.z *= factor,
            GizmoAxis::None => {}
        }
        target.borrow_mut().set_local_scale(scale);
    }
}

impl Default for ScaleGizmo {
    fn default() -> Self {
        Self::new()
    }
}
