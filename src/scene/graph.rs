//! The scene: an owned node tree plus camera/light bookkeeping and the
//! cross-thread mutation queue.

use {
    super::{
        camera::{pick_ray, CAMERA_FAR},
        node::{NodeRef, SceneNode},
        script,
    },
    crate::{
        qlang::{QValue, Runtime},
        raycast::Raycaster,
    },
    glam::Vec3,
    std::{
        rc::Rc,
        sync::mpsc::{channel, Receiver, Sender},
    },
};

/// A deferred mutation enqueued from another thread (editor panels, asset
/// loads). Commands run on the render thread at frame start and look nodes
/// up by name there; node handles themselves never cross threads.
pub type SceneCommand = Box<dyn FnOnce(&mut SceneGraph) + Send>;

/// Owns the root node, the active camera and the light list. Single-owner:
/// the render thread. Cross-thread access is forbidden; other threads
/// marshal through [`SceneGraph::command_sender`].
pub struct SceneGraph {
    root: NodeRef,
    current_camera: Option<NodeRef>,
    lights: Vec<NodeRef>,
    playing: bool,
    commands: Receiver<SceneCommand>,
    command_sender: Sender<SceneCommand>,
}

impl SceneGraph {
    pub fn new() -> Self {
        let (command_sender, commands) = channel();
        Self {
            root: SceneNode::new("Root"),
            current_camera: None,
            lights: Vec::new(),
            playing: false,
            commands,
            command_sender,
        }
    }

    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Create a node attached to `parent`, or to the root when no parent is
    /// given.
    pub fn create_node(&self, name: impl Into<String>, parent: Option<&NodeRef>) -> NodeRef {
        let node = SceneNode::new(name);
        SceneNode::add_child(parent.unwrap_or(&self.root), Rc::clone(&node));
        node
    }

    /// Find a node anywhere in the tree (the root included).
    pub fn find_node(&self, name: &str) -> Option<NodeRef> {
        if self.root.borrow().name() == name {
            return Some(Rc::clone(&self.root));
        }
        SceneNode::find_child(&self.root, name, true)
    }

    /// Remove every node except the root, and forget cameras and lights.
    pub fn clear(&mut self) {
        loop {
            let first = self.root.borrow().children().first().cloned();
            match first {
                Some(child) => SceneNode::remove_child(&self.root, &child),
                None => break,
            }
        }
        self.lights.clear();
        self.current_camera = None;
    }

    pub fn node_count(&self) -> usize {
        fn count(node: &NodeRef) -> usize {
            1 + node.borrow().children().iter().map(count).sum::<usize>()
        }
        count(&self.root)
    }

    pub fn total_mesh_count(&self) -> usize {
        let mut total = 0;
        self.for_every_node(|node| total += node.borrow().mesh_count());
        total
    }

    // -------------------------------------------------------------- camera

    pub fn set_current_camera(&mut self, camera: Option<NodeRef>) {
        self.current_camera = camera;
    }

    pub fn current_camera(&self) -> Option<&NodeRef> {
        self.current_camera.as_ref()
    }

    // -------------------------------------------------------------- lights

    /// Track a light; parentless lights attach under the root.
    pub fn add_light(&mut self, light: NodeRef) {
        if light.borrow().parent().is_none() {
            SceneNode::add_child(&self.root, Rc::clone(&light));
        }
        self.lights.push(light);
    }

    pub fn lights(&self) -> &[NodeRef] {
        &self.lights
    }

    /// First light's world position, or the stock editor default when the
    /// scene is unlit.
    pub fn light_position(&self) -> Vec3 {
        self.lights
            .first()
            .map(|light| light.borrow().world_position())
            .unwrap_or(Vec3::new(5.0, 5.0, 5.0))
    }

    // ----------------------------------------------------------- traversal

    pub fn for_every_node(&self, mut callback: impl FnMut(&NodeRef)) {
        fn walk(node: &NodeRef, callback: &mut impl FnMut(&NodeRef)) {
            callback(node);
            let children: Vec<NodeRef> = node.borrow().children().to_vec();
            for child in &children {
                walk(child, callback);
            }
        }
        walk(&self.root, &mut callback);
    }

    fn collect_nodes(&self) -> Vec<NodeRef> {
        let mut nodes = Vec::new();
        self.for_every_node(|node| nodes.push(Rc::clone(node)));
        nodes
    }

    // ------------------------------------------------------------- picking

    /// Cast a pick ray through the mouse position and return the closest
    /// mesh-carrying node.
    pub fn select_entity(
        &self,
        raycaster: &Raycaster,
        mouse_x: f32,
        mouse_y: f32,
        width: u32,
        height: u32,
    ) -> Option<(NodeRef, f32)> {
        let camera = self.current_camera.as_ref()?;
        let view = camera.borrow().world_matrix();
        let (origin, direction) = pick_ray(view, width, height, mouse_x, mouse_y);
        let end = origin + direction * CAMERA_FAR;

        let mut closest: Option<(NodeRef, f32)> = None;
        for node in self.collect_nodes() {
            let world = node.borrow().base_world_matrix();
            let meshes: Vec<_> = node.borrow().meshes().to_vec();
            for mesh in meshes {
                let result = raycaster.cast(world, origin, end, &mesh.lock());
                if result.hit {
                    let replace = closest
                        .as_ref()
                        .map(|(_, distance)| result.distance < *distance)
                        .unwrap_or(true);
                    if replace {
                        closest = Some((Rc::clone(&node), result.distance));
                    }
                }
            }
        }
        closest
    }

    // ----------------------------------------------------- mutation queue

    /// Sender other threads use to enqueue scene mutations.
    pub fn command_sender(&self) -> Sender<SceneCommand> {
        self.command_sender.clone()
    }

    /// Drain queued mutations. Runs at frame start, before rendering or
    /// script dispatch touches the tree.
    pub fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            command(self);
        }
    }

    // ------------------------------------------------------------- hooks

    pub fn on_play(&mut self, runtime: &mut Runtime) {
        self.playing = true;
        for node in self.collect_nodes() {
            script::dispatch(runtime, &node, script::HOOK_ON_PLAY, &[]);
        }
    }

    pub fn on_stop(&mut self, runtime: &mut Runtime) {
        self.playing = false;
        for node in self.collect_nodes() {
            script::dispatch(runtime, &node, script::HOOK_ON_STOP, &[]);
        }
    }

    pub fn on_update(&mut self, runtime: &mut Runtime, dt: f32) {
        if !self.playing {
            return;
        }
        for node in self.collect_nodes() {
            script::dispatch(
                runtime,
                &node,
                script::HOOK_ON_UPDATE,
                &[QValue::Float32(dt)],
            );
        }
    }
}

impl Default for SceneGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SceneGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneGraph")
            .field("nodes", &self.node_count())
            .field("lights", &self.lights.len())
            .field("playing", &self.playing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::scene::light::point_light};

    #[test]
    fn create_find_and_count() {
        let scene = SceneGraph::new();
        let a = scene.create_node("a", None);
        let _b = scene.create_node("b", Some(&a));
        assert_eq!(scene.node_count(), 3);
        assert!(scene.find_node("b").is_some());
        assert!(scene.find_node("Root").is_some());
        assert!(scene.find_node("zzz").is_none());
    }

    #[test]
    fn clear_keeps_root_only() {
        let mut scene = SceneGraph::new();
        scene.create_node("a", None);
        scene.add_light(point_light("sun", Vec3::ONE, 0.0));
        scene.clear();
        assert_eq!(scene.node_count(), 1);
        assert!(scene.lights().is_empty());
    }

    #[test]
    fn light_position_defaults_when_unlit() {
        let mut scene = SceneGraph::new();
        assert_eq!(scene.light_position(), Vec3::new(5.0, 5.0, 5.0));

        let light = point_light("lamp", Vec3::ONE, 10.0);
        light.borrow_mut().set_local_position(Vec3::new(0.0, 2.0, 0.0));
        scene.add_light(light);
        assert_eq!(scene.light_position(), Vec3::new(0.0, 2.0, 0.0));
    }

    #[test]
    fn queued_commands_apply_at_drain() {
        let mut scene = SceneGraph::new();
        let sender = scene.command_sender();
        sender
            .send(Box::new(|scene: &mut SceneGraph| {
                scene.create_node("queued", None);
            }))
            .unwrap();
        assert!(scene.find_node("queued").is_none());
        scene.drain_commands();
        assert!(scene.find_node("queued").is_some());
    }
}
