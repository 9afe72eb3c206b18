//! Hierarchical scene nodes with lazy world-transform caching.

use {
    super::{light::LightData, script::ScriptPair, terrain::Terrain},
    crate::render::mesh::MeshRef,
    glam::{EulerRot, Mat3, Mat4, Quat, Vec3},
    std::{
        cell::{Cell, RefCell},
        rc::{Rc, Weak},
    },
};

/// Owning handle: children own their nodes, everything else borrows.
pub type NodeRef = Rc<RefCell<SceneNode>>;
pub type NodeWeak = Weak<RefCell<SceneNode>>;

/// Behavioral flavor of a node.
#[derive(Clone, Debug, Default)]
pub enum NodeKind {
    #[default]
    Group,
    /// `world_matrix()` returns the view matrix (inverse of the base world
    /// transform).
    Camera,
    Light(LightData),
    /// Layered heightfield surface; the grid mesh sits in the node's mesh
    /// list, layers and blend maps in the payload.
    Terrain(Box<Terrain>),
    /// Subdivided water plane.
    Water,
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Group => "node",
            Self::Camera => "camera",
            Self::Light(_) => "light",
            Self::Terrain(_) => "terrain",
            Self::Water => "water",
        }
    }
}

/// A node in the scene hierarchy. Local transform is position + rotation
/// matrix + scale; the world matrix is cached and recomputed only when a
/// local transform (own or an ancestor's) changed since the last read.
///
/// Single-threaded: the graph is owned by the render thread, and external
/// mutations arrive through the scene's mutation queue.
pub struct SceneNode {
    name: String,
    kind: NodeKind,

    local_position: Vec3,
    local_rotation: Mat3,
    local_scale: Vec3,

    parent: NodeWeak,
    children: Vec<NodeRef>,

    meshes: Vec<MeshRef>,
    scripts: Vec<ScriptPair>,

    world_cache: Cell<Mat4>,
    world_dirty: Cell<bool>,
}

impl SceneNode {
    pub fn new(name: impl Into<String>) -> NodeRef {
        Self::with_kind(name, NodeKind::Group)
    }

    pub fn with_kind(name: impl Into<String>, kind: NodeKind) -> NodeRef {
        Rc::new(RefCell::new(Self {
            name: name.into(),
            kind,
            local_position: Vec3::ZERO,
            local_rotation: Mat3::IDENTITY,
            local_scale: Vec3::ONE,
            parent: Weak::new(),
            children: Vec::new(),
            meshes: Vec::new(),
            scripts: Vec::new(),
            world_cache: Cell::new(Mat4::IDENTITY),
            world_dirty: Cell::new(true),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut NodeKind {
        &mut self.kind
    }

    pub fn is_camera(&self) -> bool {
        matches!(self.kind, NodeKind::Camera)
    }

    pub fn light(&self) -> Option<&LightData> {
        match &self.kind {
            NodeKind::Light(light) => Some(light),
            _ => None,
        }
    }

    pub fn terrain(&self) -> Option<&Terrain> {
        match &self.kind {
            NodeKind::Terrain(terrain) => Some(terrain),
            _ => None,
        }
    }

    pub fn terrain_mut(&mut self) -> Option<&mut Terrain> {
        match &mut self.kind {
            NodeKind::Terrain(terrain) => Some(terrain),
            _ => None,
        }
    }

    pub fn is_water(&self) -> bool {
        matches!(self.kind, NodeKind::Water)
    }

    // ----------------------------------------------------------- transform

    pub fn local_position(&self) -> Vec3 {
        self.local_position
    }

    pub fn local_rotation(&self) -> Mat3 {
        self.local_rotation
    }

    pub fn local_scale(&self) -> Vec3 {
        self.local_scale
    }

    pub fn set_local_position(&mut self, position: Vec3) {
        self.local_position = position;
        self.invalidate_transform();
    }

    pub fn set_local_rotation(&mut self, rotation: Mat3) {
        self.local_rotation = rotation;
        self.invalidate_transform();
    }

    pub fn set_local_scale(&mut self, scale: Vec3) {
        self.local_scale = scale;
        self.invalidate_transform();
    }

    pub fn set_local_scale_uniform(&mut self, scale: f32) {
        self.set_local_scale(Vec3::splat(scale));
    }

    /// Euler rotation in radians: (pitch, yaw, roll), applied yaw first.
    pub fn set_local_rotation_euler(&mut self, pitch: f32, yaw: f32, roll: f32) {
        self.set_local_rotation(Mat3::from_euler(EulerRot::YXZ, yaw, pitch, roll));
    }

    pub fn set_local_rotation_axis_angle(&mut self, axis: Vec3, angle: f32) {
        self.set_local_rotation(Mat3::from_axis_angle(axis.normalize_or_zero(), angle));
    }

    /// Euler angles in degrees, (pitch, yaw, roll); the scripting-facing
    /// convention.
    pub fn rotation_euler_degrees(&self) -> Vec3 {
        let (yaw, pitch, roll) = Quat::from_mat3(&self.local_rotation).to_euler(EulerRot::YXZ);
        Vec3::new(pitch.to_degrees(), yaw.to_degrees(), roll.to_degrees())
    }

    pub fn set_rotation_euler_degrees(&mut self, euler: Vec3) {
        self.set_local_rotation_euler(
            euler.x.to_radians(),
            euler.y.to_radians(),
            euler.z.to_radians(),
        );
    }

    /// Compose an additional Euler rotation (degrees) onto the current
    /// orientation; the script-facing `NodeTurn` entry point.
    pub fn turn(&mut self, euler_degrees: Vec3) {
        let delta = Mat3::from_euler(
            EulerRot::YXZ,
            euler_degrees.y.to_radians(),
            euler_degrees.x.to_radians(),
            euler_degrees.z.to_radians(),
        );
        self.local_rotation *= delta;
        self.invalidate_transform();
    }

    /// Place the node at `eye` oriented toward `target`.
    pub fn look_at(&mut self, eye: Vec3, target: Vec3, up: Vec3) {
        let view = Mat4::look_at_rh(eye, target, up);
        let world = view.inverse();
        self.local_position = eye;
        self.local_rotation = Mat3::from_mat4(world);
        self.invalidate_transform();
    }

    /// `T * R * S`.
    pub fn local_matrix(&self) -> Mat4 {
        Mat4::from_translation(self.local_position)
            * Mat4::from_mat3(self.local_rotation)
            * Mat4::from_scale(self.local_scale)
    }

    /// Mark this node and every descendant dirty (eager propagation).
    pub fn invalidate_transform(&self) {
        self.world_dirty.set(true);
        for child in &self.children {
            child.borrow().invalidate_transform();
        }
    }

    /// The plain hierarchical world transform, recomputed only when dirty.
    pub fn base_world_matrix(&self) -> Mat4 {
        if self.world_dirty.get() {
            let local = self.local_matrix();
            let world = match self.parent.upgrade() {
                Some(parent) => parent.borrow().base_world_matrix() * local,
                None => local,
            };
            self.world_cache.set(world);
            self.world_dirty.set(false);
        }
        self.world_cache.get()
    }

    /// World transform as consumed by rendering. Cameras return the view
    /// matrix: the inverse of their base world transform.
    pub fn world_matrix(&self) -> Mat4 {
        let world = self.base_world_matrix();
        match self.kind {
            NodeKind::Camera => world.inverse(),
            _ => world,
        }
    }

    /// Actual world position; cameras must not extract this from their
    /// (inverted) `world_matrix`.
    pub fn world_position(&self) -> Vec3 {
        self.base_world_matrix().w_axis.truncate()
    }

    pub fn is_world_dirty(&self) -> bool {
        self.world_dirty.get()
    }

    /// World-space AABB over this node's meshes.
    pub fn world_bounds(&self) -> Option<(Vec3, Vec3)> {
        if self.meshes.is_empty() {
            return None;
        }
        let world = self.base_world_matrix();
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        for mesh in &self.meshes {
            let (local_min, local_max) = mesh.lock().bounds();
            for i in 0..8 {
                let corner = Vec3::new(
                    if i & 1 == 0 { local_min.x } else { local_max.x },
                    if i & 2 == 0 { local_min.y } else { local_max.y },
                    if i & 4 == 0 { local_min.z } else { local_max.z },
                );
                let world_corner = world.transform_point3(corner);
                min = min.min(world_corner);
                max = max.max(world_corner);
            }
        }
        Some((min, max))
    }

    // ----------------------------------------------------------- hierarchy

    pub fn parent(&self) -> Option<NodeRef> {
        self.parent.upgrade()
    }

    pub fn children(&self) -> &[NodeRef] {
        &self.children
    }

    /// Attach `child` to `parent`, detaching it from any previous parent
    /// first.
    pub fn add_child(parent: &NodeRef, child: NodeRef) {
        Self::remove_from_parent(&child);
        child.borrow_mut().parent = Rc::downgrade(parent);
        child.borrow().invalidate_transform();
        parent.borrow_mut().children.push(child);
    }

    pub fn remove_child(parent: &NodeRef, child: &NodeRef) {
        let mut parent_node = parent.borrow_mut();
        if let Some(index) = parent_node
            .children
            .iter()
            .position(|c| Rc::ptr_eq(c, child))
        {
            parent_node.children.remove(index);
            drop(parent_node);
            child.borrow_mut().parent = Weak::new();
            child.borrow().invalidate_transform();
        }
    }

    pub fn remove_from_parent(node: &NodeRef) {
        let parent = node.borrow().parent.upgrade();
        if let Some(parent) = parent {
            Self::remove_child(&parent, node);
        }
    }

    /// Depth-first search among children.
    pub fn find_child(node: &NodeRef, name: &str, recursive: bool) -> Option<NodeRef> {
        let children: Vec<NodeRef> = node.borrow().children.to_vec();
        for child in &children {
            if child.borrow().name == name {
                return Some(Rc::clone(child));
            }
        }
        if recursive {
            for child in &children {
                if let Some(found) = Self::find_child(child, name, true) {
                    return Some(found);
                }
            }
        }
        None
    }

    // -------------------------------------------------------------- meshes

    pub fn add_mesh(&mut self, mesh: MeshRef) {
        self.meshes.push(mesh);
    }

    pub fn remove_mesh(&mut self, mesh: &MeshRef) {
        self.meshes.retain(|m| !std::sync::Arc::ptr_eq(m, mesh));
    }

    pub fn clear_meshes(&mut self) {
        self.meshes.clear();
    }

    pub fn meshes(&self) -> &[MeshRef] {
        &self.meshes
    }

    pub fn has_meshes(&self) -> bool {
        !self.meshes.is_empty()
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    // ------------------------------------------------------------- scripts

    pub(crate) fn push_script(&mut self, pair: ScriptPair) {
        self.scripts.push(pair);
    }

    pub fn scripts(&self) -> &[ScriptPair] {
        &self.scripts
    }

    pub fn clear_scripts(&mut self) {
        self.scripts.clear();
    }
}

impl std::fmt::Debug for SceneNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneNode")
            .field("name", &self.name)
            .field("kind", &self.kind.type_name())
            .field("children", &self.children.len())
            .field("meshes", &self.meshes.len())
            .field("scripts", &self.scripts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn world_matrix_composes_with_parent() {
        let parent = SceneNode::new("parent");
        let child = SceneNode::new("child");
        SceneNode::add_child(&parent, Rc::clone(&child));

        parent.borrow_mut().set_local_position(Vec3::new(1.0, 0.0, 0.0));
        child.borrow_mut().set_local_position(Vec3::new(0.0, 2.0, 0.0));

        let expect = parent.borrow().world_matrix() * child.borrow().local_matrix();
        let world = child.borrow().world_matrix();
        assert!((world.w_axis.truncate() - Vec3::new(1.0, 2.0, 0.0)).length() < 1e-6);
        assert!((world - expect).abs_diff_eq(Mat4::ZERO, 1e-6));
    }

    #[test]
    fn dirty_clears_after_read_and_propagates_to_descendants() {
        let parent = SceneNode::new("parent");
        let child = SceneNode::new("child");
        SceneNode::add_child(&parent, Rc::clone(&child));

        let _ = child.borrow().world_matrix();
        assert!(!child.borrow().is_world_dirty());

        parent.borrow_mut().set_local_position(Vec3::ONE);
        assert!(child.borrow().is_world_dirty());
        let _ = child.borrow().world_matrix();
        assert!(!child.borrow().is_world_dirty());
    }

    #[test]
    fn reparent_detaches_from_previous_parent() {
        let a = SceneNode::new("a");
        let b = SceneNode::new("b");
        let child = SceneNode::new("child");
        SceneNode::add_child(&a, Rc::clone(&child));
        SceneNode::add_child(&b, Rc::clone(&child));

        assert_eq!(a.borrow().children().len(), 0);
        assert_eq!(b.borrow().children().len(), 1);
        assert!(Rc::ptr_eq(&child.borrow().parent().unwrap(), &b));
    }

    #[test]
    fn find_child_depth_first() {
        let root = SceneNode::new("root");
        let mid = SceneNode::new("mid");
        let leaf = SceneNode::new("leaf");
        SceneNode::add_child(&root, Rc::clone(&mid));
        SceneNode::add_child(&mid, Rc::clone(&leaf));

        assert!(SceneNode::find_child(&root, "leaf", false).is_none());
        let found = SceneNode::find_child(&root, "leaf", true).unwrap();
        assert!(Rc::ptr_eq(&found, &leaf));
    }

    #[test]
    fn camera_world_matrix_is_inverse() {
        let camera = SceneNode::with_kind("cam", NodeKind::Camera);
        camera.borrow_mut().set_local_position(Vec3::new(0.0, 0.0, 5.0));

        let view = camera.borrow().world_matrix();
        let base = camera.borrow().base_world_matrix();
        assert!((view * base).abs_diff_eq(Mat4::IDENTITY, 1e-5));
        // World position uses the un-inverted matrix.
        assert_eq!(camera.borrow().world_position(), Vec3::new(0.0, 0.0, 5.0));
    }

    #[test]
    fn euler_round_trip_in_degrees() {
        let node = SceneNode::new("n");
        node.borrow_mut()
            .set_rotation_euler_degrees(Vec3::new(10.0, 20.0, 30.0));
        let euler = node.borrow().rotation_euler_degrees();
        assert!((euler - Vec3::new(10.0, 20.0, 30.0)).length() < 1e-3);
    }
}
