//! Scene-level integration: transforms, picking and persistence.

use {
    glam::Vec3,
    qengine::{
        qlang::{QValue, ScriptHost},
        raycast::Raycaster,
        render::Mesh,
        scene::{
            camera::camera_node,
            node::SceneNode,
            serializer::{self, SceneAssets},
            SceneGraph,
        },
    },
    serde_json::{Map, Value},
    std::rc::Rc,
};

#[test]
fn scaled_parent_transforms_child_position() {
    let scene = SceneGraph::new();
    let parent = scene.create_node("parent", None);
    let child = scene.create_node("child", Some(&parent));

    parent.borrow_mut().set_local_scale(Vec3::splat(2.0));
    child.borrow_mut().set_local_position(Vec3::new(1.0, 0.0, 0.0));

    let world = child.borrow().world_position();
    assert!((world - Vec3::new(2.0, 0.0, 0.0)).length() < 1e-5);

    // Rotating the parent 90 degrees about Y swings +X onto -Z.
    parent
        .borrow_mut()
        .set_local_rotation_euler(0.0, 90f32.to_radians(), 0.0);
    let world = child.borrow().world_position();
    assert!(
        (world - Vec3::new(0.0, 0.0, -2.0)).length() < 1e-5,
        "got {world:?}"
    );

    // Reading cleared the dirty flag.
    assert!(!child.borrow().is_world_dirty());
}

#[test]
fn world_matrix_equals_explicit_product() {
    let scene = SceneGraph::new();
    let parent = scene.create_node("parent", None);
    let child = scene.create_node("child", Some(&parent));

    parent.borrow_mut().set_local_position(Vec3::new(3.0, 1.0, 0.0));
    parent
        .borrow_mut()
        .set_local_rotation_euler(0.3, -0.8, 0.1);
    parent.borrow_mut().set_local_scale(Vec3::new(2.0, 0.5, 1.5));
    child.borrow_mut().set_local_position(Vec3::new(0.0, 4.0, -1.0));
    child.borrow_mut().set_local_rotation_euler(-0.2, 0.0, 0.9);

    let explicit = parent.borrow().world_matrix() * child.borrow().local_matrix();
    let cached = child.borrow().world_matrix();
    assert!((cached - explicit).abs_diff_eq(glam::Mat4::ZERO, 1e-5));
}

#[test]
fn select_entity_picks_the_cube_under_the_cursor() {
    let mut scene = SceneGraph::new();

    let cube = scene.create_node("cube", None);
    cube.borrow_mut().add_mesh(Mesh::unit_cube().into_ref());

    let camera = camera_node("editor");
    camera
        .borrow_mut()
        .look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
    SceneNode::add_child(scene.root(), Rc::clone(&camera));
    scene.set_current_camera(Some(Rc::clone(&camera)));

    let raycaster = Raycaster::new();
    let picked = scene.select_entity(&raycaster, 400.0, 300.0, 800, 600);
    let (node, distance) = picked.expect("center click should hit the cube");
    assert!(Rc::ptr_eq(&node, &cube));
    assert!((distance - 4.5).abs() < 1e-2);

    // A click far off to the side misses.
    assert!(scene.select_entity(&raycaster, 5.0, 5.0, 800, 600).is_none());
}

struct HostAssets {
    host: ScriptHost,
    root: std::path::PathBuf,
    meshes: std::collections::HashMap<String, qengine::render::MeshRef>,
}

impl SceneAssets for HostAssets {
    fn load_mesh(&mut self, relpath: &str) -> Option<qengine::render::MeshRef> {
        self.meshes.get(relpath).cloned()
    }

    fn load_script(
        &mut self,
        relpath: &str,
        node: &qengine::scene::NodeRef,
        members: &Map<String, Value>,
    ) -> bool {
        let path = self.root.join(relpath);
        let Some(instance) = self.host.load_class(&path, node) else {
            return false;
        };
        for (name, value) in members {
            let Some(member) = instance.layout().member(name).cloned() else {
                continue;
            };
            if let Some(qvalue) = serializer::json_to_qvalue(&member.ty, value) {
                let _ = self.host.runtime().set_member(&instance, name, qvalue);
            }
        }
        true
    }
}

#[test]
fn scene_round_trip_restores_scripts_and_members() {
    let dir = std::env::temp_dir().join("qengine-scene-test");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("Mover.q"),
        "class Mover extends GameNode {\n\
         \tfloat32 speed = 1f;\n\
         \tstring label = \"unnamed\";\n\
         \tfunc on_update(float32 dt) { }\n\
         }",
    )
    .unwrap();

    // Build the original scene with a scripted node.
    let mut host = ScriptHost::new();
    let mut scene = SceneGraph::new();
    let node = scene.create_node("hero", None);
    {
        let mut mesh = Mesh::unit_cube();
        mesh.set_source("models/hero.cube");
        node.borrow_mut().add_mesh(mesh.into_ref());
    }
    let instance = host.load_class(dir.join("Mover.q"), &node).unwrap();
    host.runtime()
        .set_member(&instance, "speed", QValue::Float32(3.5))
        .unwrap();
    host.runtime()
        .set_member(&instance, "label", QValue::Str("alpha".into()))
        .unwrap();

    // The serializer persists the member values through reflection.
    let value = serializer::save_to_value(&scene, host.runtime_ref(), 1.0, 0.5);
    let text = serde_json::to_string(&value).unwrap();

    // Restore into a fresh world.
    let mut assets = HostAssets {
        host: ScriptHost::new(),
        root: std::path::PathBuf::from("/"),
        meshes: [(
            "models/hero.cube".to_owned(),
            Mesh::unit_cube().into_ref(),
        )]
        .into_iter()
        .collect(),
    };
    let mut restored = SceneGraph::new();
    let parsed: Value = serde_json::from_str(&text).unwrap();
    let camera = serializer::load_from_value(&mut restored, &parsed, &mut assets).unwrap();
    assert_eq!((camera.yaw, camera.pitch), (1.0, 0.5));

    let hero = restored.find_node("hero").unwrap();
    assert_eq!(hero.borrow().mesh_count(), 1);
    assert_eq!(hero.borrow().scripts().len(), 1);

    let pair = hero.borrow().scripts()[0].clone();
    let speed = assets
        .host
        .runtime()
        .member(&pair.instance, "speed")
        .unwrap();
    assert_eq!(speed.as_f32(), Some(3.5));
    let label = assets
        .host
        .runtime()
        .member(&pair.instance, "label")
        .unwrap();
    assert_eq!(label.display_string(), "alpha");

    // NodePtr was rebound to the restored node, not serialized.
    let node_ptr = assets
        .host
        .runtime()
        .member(&pair.instance, "NodePtr")
        .unwrap();
    assert!(node_ptr.as_cptr().is_some());
}
