//! Axis-constrained translation.

use {
    super::{arrow_mesh, pick_axis, GizmoAxis, GizmoCommon},
    crate::render::mesh::Mesh,
    glam::{Mat4, Vec2, Vec3},
};

pub struct TranslateGizmo {
    pub common: GizmoCommon,
    axis_x: Mesh,
    axis_y: Mesh,
    axis_z: Mesh,
}

impl TranslateGizmo {
    pub fn new() -> Self {
        Self {
            common: GizmoCommon::default(),
            axis_x: arrow_mesh("gizmo:translate:x", Vec3::X),
            axis_y: arrow_mesh("gizmo:translate:y", Vec3::Y),
            axis_z: arrow_mesh("gizmo:translate:z", Vec3::Z),
        }
    }

    pub fn handle_meshes(&self) -> [&Mesh; 3] {
        [&self.axis_x, &self.axis_y, &self.axis_z]
    }

    /// Returns true when the gizmo consumed the event (blocks node
    /// selection behind it).
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
                    (&self.axis_x, GizmoAxis::X),
                    (&self.axis_y, GizmoAxis::Y),
                    (&self.axis_z, GizmoAxis::Z),
                ],
            );
            if hit != GizmoAxis::None {
                self.common.dragging = true;
                self.common.active_axis = hit;
                self.common.last_mouse = Vec2::new(x, y);
                if let Some(target) = self.common.target() {
                    self.common.drag_start_position = target.borrow().world_position();
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
        if movement == 0.0 {
            return;
        }
        let axis_dir = self.common.axis_direction(self.common.active_axis);
        let new_position = target.borrow().local_position() + axis_dir * movement;
        target.borrow_mut().set_local_position(new_position);
        self.common.position = target.borrow().world_position();
    }
}

impl Default for TranslateGizmo {
    fn default() -> Self {
        Self::new()
    }
}
