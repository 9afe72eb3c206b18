//! Camera nodes and projection helpers.

use {
    super::node::{NodeKind, NodeRef, SceneNode},
    glam::{Mat4, Vec3, Vec4},
};

/// Vertical field of view used by every viewport projection, in degrees.
pub const CAMERA_FOV_DEG: f32 = 45.0;
pub const CAMERA_NEAR: f32 = 0.1;
pub const CAMERA_FAR: f32 = 100.0;

/// Create a camera node. Its `world_matrix()` is the view matrix; use
/// `world_position()` for the actual eye position.
pub fn camera_node(name: impl Into<String>) -> NodeRef {
    SceneNode::with_kind(name, NodeKind::Camera)
}

/// The perspective projection the renderer, the gizmos and picking all
/// share. Vulkan clip space: Y is flipped relative to GL.
pub fn projection(width: u32, height: u32) -> Mat4 {
    let aspect = if height == 0 {
        1.0
    } else {
        width as f32 / height as f32
    };
    let mut proj = Mat4::perspective_rh(CAMERA_FOV_DEG.to_radians(), aspect, CAMERA_NEAR, CAMERA_FAR);
    proj.y_axis.y *= -1.0;
    proj
}

/// Unproject a mouse position into a world-space ray from the camera.
/// `view` is the camera's view matrix; the origin is the eye position and
/// the returned direction is normalized.
pub fn pick_ray(view: Mat4, width: u32, height: u32, mouse_x: f32, mouse_y: f32) -> (Vec3, Vec3) {
    if width == 0 || height == 0 {
        return (Vec3::ZERO, Vec3::NEG_Z);
    }

    // Normalized device coordinates, then unproject to view space with the
    // shared projection (forward is -Z).
    let x = 2.0 * mouse_x / width as f32 - 1.0;
    let y = 2.0 * mouse_y / height as f32 - 1.0;
    let ray_clip = Vec4::new(x, y, -1.0, 1.0);
    let ray_eye = projection(width, height).inverse() * ray_clip;
    let ray_eye = Vec4::new(ray_eye.x, ray_eye.y, -1.0, 0.0);

    let inv_view = view.inverse();
    let direction = (inv_view * ray_eye).truncate().normalize_or_zero();
    let origin = inv_view.w_axis.truncate();
    (origin, direction)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_view_is_inverse_of_world() {
        let camera = camera_node("editor");
        camera
            .borrow_mut()
            .look_at(Vec3::new(0.0, 2.0, 5.0), Vec3::ZERO, Vec3::Y);
        let view = camera.borrow().world_matrix();
        let world = camera.borrow().base_world_matrix();
        assert!((view * world).abs_diff_eq(Mat4::IDENTITY, 1e-4));
    }

    #[test]
    fn projection_flips_y_for_vulkan() {
        let proj = projection(1280, 720);
        assert!(proj.y_axis.y > 0.0 || proj.y_axis.y < 0.0);
        let gl = Mat4::perspective_rh(CAMERA_FOV_DEG.to_radians(), 1280.0 / 720.0, CAMERA_NEAR, CAMERA_FAR);
        assert_eq!(proj.y_axis.y, -gl.y_axis.y);
    }
}
