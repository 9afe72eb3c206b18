//! GPU-facing data definitions shared by shaders and the renderer.
//!
//! These layouts are part of the shader contract; the unit tests pin every
//! byte offset.

use bytemuck::{Pod, Zeroable};

/// Per-draw uniform block, std140-compatible.
///
/// Offsets: model 0, view 64, proj 128, view_pos 192, light_pos 208,
/// light_color 224; total 240 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct SceneUbo {
    pub model: [f32; 16],
    pub view: [f32; 16],
    pub proj: [f32; 16],
    pub view_pos: [f32; 3],
    pub _pad0: f32,
    pub light_pos: [f32; 3],
    pub _pad1: f32,
    pub light_color: [f32; 3],
    pub _pad2: f32,
}

/// Push-constant block of the shadow pass: 144 bytes, vertex + fragment
/// stages.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct ShadowPush {
    pub light_space_matrix: [f32; 16],
    pub model: [f32; 16],
    /// xyz = light position, w = far plane.
    pub light_pos_and_farplane: [f32; 4],
}

#[cfg(test)]
mod tests {
    use {super::*, std::mem};

    #[test]
    fn scene_ubo_matches_shader_offsets() {
        assert_eq!(mem::offset_of!(SceneUbo, model), 0);
        assert_eq!(mem::offset_of!(SceneUbo, view), 64);
        assert_eq!(mem::offset_of!(SceneUbo, proj), 128);
        assert_eq!(mem::offset_of!(SceneUbo, view_pos), 192);
        assert_eq!(mem::offset_of!(SceneUbo, light_pos), 208);
        assert_eq!(mem::offset_of!(SceneUbo, light_color), 224);
        assert_eq!(mem::size_of::<SceneUbo>(), 240);
    }

    #[test]
    fn shadow_push_is_144_bytes() {
        assert_eq!(mem::offset_of!(ShadowPush, model), 64);
        assert_eq!(mem::offset_of!(ShadowPush, light_pos_and_farplane), 128);
        assert_eq!(mem::size_of::<ShadowPush>(), 144);
    }
}
