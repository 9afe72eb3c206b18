//! Scene persistence (`.graph` files).
//!
//! JSON with two top-level keys: `"nodes"` (the tree under the root, each
//! node carrying transform, mesh/script asset references and children) and
//! `"camera"` (editor camera yaw/pitch). Paths are relative to a
//! caller-supplied content root; unknown keys are ignored on load and
//! missing keys take their defaults.

use {
    super::{
        graph::SceneGraph,
        light::{LightData, LightType},
        node::{NodeKind, NodeRef, SceneNode},
    },
    crate::qlang::{QType, QValue, Runtime},
    glam::{Quat, Vec3},
    serde_json::{json, Map, Value},
    std::{fs, path::Path, rc::Rc},
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum SceneError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed scene file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("scene root must be an object")]
    BadRoot,
}

/// Editor camera orientation restored from a scene file.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CameraState {
    pub yaw: f32,
    pub pitch: f32,
    pub has_data: bool,
}

/// How the loader obtains assets referenced by relpath. Mesh import is
/// external to the engine core; script loading is the script host's job.
pub trait SceneAssets {
    fn load_mesh(&mut self, relpath: &str) -> Option<crate::render::MeshRef>;

    /// Load, attach and restore a script on `node`. `members` holds the
    /// persisted member values by name.
    fn load_script(&mut self, relpath: &str, node: &NodeRef, members: &Map<String, Value>) -> bool;
}

// -------------------------------------------------------------------- save

pub fn save(
    scene: &SceneGraph,
    runtime: &Runtime,
    path: impl AsRef<Path>,
    camera_yaw: f32,
    camera_pitch: f32,
) -> Result<(), SceneError> {
    let value = save_to_value(scene, runtime, camera_yaw, camera_pitch);
    fs::write(path, serde_json::to_string_pretty(&value)?)?;
    Ok(())
}

pub fn save_to_value(
    scene: &SceneGraph,
    runtime: &Runtime,
    camera_yaw: f32,
    camera_pitch: f32,
) -> Value {
    let nodes: Vec<Value> = scene
        .root()
        .borrow()
        .children()
        .iter()
        .map(|child| node_to_value(child, runtime))
        .collect();
    json!({
        "nodes": nodes,
        "camera": { "yaw": camera_yaw, "pitch": camera_pitch },
    })
}

fn vec3_to_value(v: Vec3) -> Value {
    json!([v.x, v.y, v.z])
}

fn node_to_value(node: &NodeRef, runtime: &Runtime) -> Value {
    let borrowed = node.borrow();

    // Rotation persists as Euler (pitch, yaw, roll) in radians.
    let (yaw, pitch, roll) =
        Quat::from_mat3(&borrowed.local_rotation()).to_euler(glam::EulerRot::YXZ);

    let meshes: Vec<Value> = borrowed
        .meshes()
        .iter()
        .filter_map(|mesh| mesh.lock().source().map(|s| Value::String(s.to_owned())))
        .collect();

    let scripts: Vec<Value> = borrowed
        .scripts()
        .iter()
        .filter_map(|pair| {
            let path = pair.source.clone()?;
            let mut members = Map::new();
            for member in pair.instance.members() {
                if member.name == super::script::NODE_PTR_MEMBER {
                    continue;
                }
                if let Ok(value) = runtime.member(&pair.instance, &member.name) {
                    if let Some(json) = qvalue_to_json(&value) {
                        members.insert(member.name.clone(), json);
                    }
                }
            }
            Some(json!({ "path": path, "members": members }))
        })
        .collect();

    let children: Vec<Value> = borrowed
        .children()
        .iter()
        .map(|child| node_to_value(child, runtime))
        .collect();

    let mut object = Map::new();
    object.insert("name".into(), Value::String(borrowed.name().to_owned()));
    object.insert(
        "type".into(),
        Value::String(borrowed.kind().type_name().to_owned()),
    );
    object.insert("position".into(), vec3_to_value(borrowed.local_position()));
    object.insert("rotation".into(), json!([pitch, yaw, roll]));
    object.insert("scale".into(), vec3_to_value(borrowed.local_scale()));
    object.insert("meshes".into(), Value::Array(meshes));
    object.insert("scripts".into(), Value::Array(scripts));
    object.insert("children".into(), Value::Array(children));

    if let NodeKind::Light(light) = borrowed.kind() {
        object.insert(
            "light".into(),
            json!({
                "type": light.light_type.as_str(),
                "color": vec3_to_value(light.color),
                "range": light.range,
            }),
        );
    }

    if let Some(terrain) = borrowed.terrain() {
        let layers: Vec<Value> = (0..terrain.layer_count())
            .map(|index| {
                let layer = terrain.layer(index);
                json!({
                    "color": layer.color_path.clone(),
                    "normal": layer.normal_path.clone(),
                    "specular": layer.specular_path.clone(),
                })
            })
            .collect();
        object.insert(
            "terrain".into(),
            json!({
                "width": terrain.width(),
                "depth": terrain.depth(),
                "divisions": terrain.divisions(),
                "layers": layers,
            }),
        );
    }

    Value::Object(object)
}

fn qvalue_to_json(value: &QValue) -> Option<Value> {
    Some(match value {
        QValue::Null => Value::Null,
        QValue::Bool(v) => Value::Bool(*v),
        QValue::Int32(v) => json!(v),
        QValue::Int64(v) => json!(v),
        QValue::Float32(v) => json!(v),
        QValue::Float64(v) => json!(v),
        QValue::Str(v) => Value::String(v.clone()),
        // Raw pointers and object references do not persist.
        QValue::CPtr(_) | QValue::Instance(_) => return None,
    })
}

// -------------------------------------------------------------------- load

pub fn load(
    scene: &mut SceneGraph,
    path: impl AsRef<Path>,
    assets: &mut dyn SceneAssets,
) -> Result<CameraState, SceneError> {
    let text = fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&text)?;
    load_from_value(scene, &value, assets)
}

pub fn load_from_value(
    scene: &mut SceneGraph,
    value: &Value,
    assets: &mut dyn SceneAssets,
) -> Result<CameraState, SceneError> {
    let object = value.as_object().ok_or(SceneError::BadRoot)?;

    scene.clear();

    if let Some(nodes) = object.get("nodes").and_then(Value::as_array) {
        for node_value in nodes {
            load_node(scene, node_value, None, assets);
        }
    }

    // Re-register lights and the first camera found in the restored tree.
    let mut lights = Vec::new();
    let mut camera_node = None;
    scene.for_every_node(|node| {
        if node.borrow().light().is_some() {
            lights.push(Rc::clone(node));
        }
        if node.borrow().is_camera() && camera_node.is_none() {
            camera_node = Some(Rc::clone(node));
        }
    });
    for light in lights {
        scene.add_light(light);
    }
    scene.set_current_camera(camera_node);

    let camera = object
        .get("camera")
        .and_then(Value::as_object)
        .map(|camera| CameraState {
            yaw: value_f32(camera.get("yaw")).unwrap_or(0.0),
            pitch: value_f32(camera.get("pitch")).unwrap_or(0.0),
            has_data: true,
        })
        .unwrap_or_default();
    Ok(camera)
}

fn value_f32(value: Option<&Value>) -> Option<f32> {
    value.and_then(Value::as_f64).map(|v| v as f32)
}

fn value_vec3(value: Option<&Value>, default: Vec3) -> Vec3 {
    let Some(array) = value.and_then(Value::as_array) else {
        return default;
    };
    let component =
        |index: usize, fallback: f32| array.get(index).and_then(Value::as_f64).map(|v| v as f32).unwrap_or(fallback);
    Vec3::new(
        component(0, default.x),
        component(1, default.y),
        component(2, default.z),
    )
}

fn load_node(
    scene: &SceneGraph,
    value: &Value,
    parent: Option<&NodeRef>,
    assets: &mut dyn SceneAssets,
) {
    let Some(object) = value.as_object() else {
        return;
    };

    let name = object
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("Node")
        .to_owned();
    let node = match object.get("type").and_then(Value::as_str).unwrap_or("node") {
        "camera" => SceneNode::with_kind(name, NodeKind::Camera),
        "light" => SceneNode::with_kind(name, NodeKind::Light(load_light(object))),
        // Terrain and water rebuild their procedural meshes instead of
        // loading asset references.
        "terrain" => load_terrain(name, object),
        "water" => super::water::water_node(name),
        _ => SceneNode::with_kind(name, NodeKind::Group),
    };
    SceneNode::add_child(parent.unwrap_or(scene.root()), Rc::clone(&node));

    {
        let mut borrowed = node.borrow_mut();
        borrowed.set_local_position(value_vec3(object.get("position"), Vec3::ZERO));
        let rotation = value_vec3(object.get("rotation"), Vec3::ZERO);
        // Stored as (pitch, yaw, roll) radians.
        borrowed.set_local_rotation_euler(rotation.x, rotation.y, rotation.z);
        borrowed.set_local_scale(value_vec3(object.get("scale"), Vec3::ONE));
    }

    if let Some(meshes) = object.get("meshes").and_then(Value::as_array) {
        for mesh_value in meshes {
            let Some(relpath) = mesh_value.as_str() else {
                continue;
            };
            match assets.load_mesh(relpath) {
                Some(mesh) => node.borrow_mut().add_mesh(mesh),
                None => log::warn!("scene load: missing mesh '{relpath}'"),
            }
        }
    }

    if let Some(scripts) = object.get("scripts").and_then(Value::as_array) {
        let empty = Map::new();
        for script_value in scripts {
            let Some(script) = script_value.as_object() else {
                continue;
            };
            let Some(relpath) = script.get("path").and_then(Value::as_str) else {
                continue;
            };
            let members = script
                .get("members")
                .and_then(Value::as_object)
                .unwrap_or(&empty);
            if !assets.load_script(relpath, &node, members) {
                log::warn!("scene load: failed to load script '{relpath}'");
            }
        }
    }

    if let Some(children) = object.get("children").and_then(Value::as_array) {
        for child in children {
            load_node(scene, child, Some(&node), assets);
        }
    }
}

fn load_terrain(name: String, object: &Map<String, Value>) -> NodeRef {
    use super::terrain::{self, LayerTexture};

    let payload = object.get("terrain").and_then(Value::as_object);
    let get_f32 = |key: &str, fallback: f32| {
        payload
            .and_then(|p| p.get(key))
            .and_then(Value::as_f64)
            .map(|v| v as f32)
            .unwrap_or(fallback)
    };
    let divisions = payload
        .and_then(|p| p.get("divisions"))
        .and_then(Value::as_u64)
        .unwrap_or(100) as u32;
    let layers = payload.and_then(|p| p.get("layers")).and_then(Value::as_array);
    let layer_count = layers.map(Vec::len).unwrap_or(4).max(1);

    let node = terrain::terrain_node(
        name,
        get_f32("width", 100.0),
        get_f32("depth", 100.0),
        divisions,
        layer_count,
    );

    // Restore layer texture paths; they resolve through the pending-update
    // path on the next frame, once a loader is around.
    if let Some(layers) = layers {
        let mut borrowed = node.borrow_mut();
        if let Some(terrain) = borrowed.terrain_mut() {
            for (index, layer_value) in layers.iter().enumerate() {
                let Some(layer) = layer_value.as_object() else {
                    continue;
                };
                for (key, kind) in [
                    ("color", LayerTexture::Color),
                    ("normal", LayerTexture::Normal),
                    ("specular", LayerTexture::Specular),
                ] {
                    if let Some(path) = layer.get(key).and_then(Value::as_str) {
                        terrain.set_layer_texture(index, kind, path);
                    }
                }
            }
        }
    }
    node
}

fn load_light(object: &Map<String, Value>) -> LightData {
    let Some(light) = object.get("light").and_then(Value::as_object) else {
        return LightData::default();
    };
    LightData {
        light_type: light
            .get("type")
            .and_then(Value::as_str)
            .map(LightType::from_str)
            .unwrap_or_default(),
        color: value_vec3(light.get("color"), Vec3::ONE),
        range: value_f32(light.get("range")).unwrap_or(0.0),
    }
}

/// Convert a persisted member value back into the member's declared type.
pub fn json_to_qvalue(ty: &QType, value: &Value) -> Option<QValue> {
    Some(match ty {
        QType::Bool => QValue::Bool(value.as_bool()?),
        QType::Int32 => QValue::Int32(value.as_i64()? as i32),
        QType::Int64 => QValue::Int64(value.as_i64()?),
        QType::Float32 => QValue::Float32(value.as_f64()? as f32),
        QType::Float64 => QValue::Float64(value.as_f64()?),
        QType::Str => QValue::Str(value.as_str()?.to_owned()),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            qlang::Context,
            render::{Mesh, MeshRef},
        },
        std::collections::HashMap,
    };

    struct StubAssets {
        meshes: HashMap<String, MeshRef>,
        scripts_seen: Vec<String>,
    }

    impl SceneAssets for StubAssets {
        fn load_mesh(&mut self, relpath: &str) -> Option<MeshRef> {
            self.meshes.get(relpath).cloned()
        }

        fn load_script(
            &mut self,
            relpath: &str,
            _node: &NodeRef,
            _members: &Map<String, Value>,
        ) -> bool {
            self.scripts_seen.push(relpath.to_owned());
            true
        }
    }

    fn test_runtime() -> Runtime {
        Runtime::new(Rc::new(Context::root("test")))
    }

    #[test]
    fn round_trip_preserves_tree_and_transforms() {
        let mut scene = SceneGraph::new();
        let runtime = test_runtime();

        let parent = scene.create_node("crate", None);
        parent
            .borrow_mut()
            .set_local_position(Vec3::new(1.0, 2.0, 3.0));
        parent.borrow_mut().set_local_scale(Vec3::splat(2.0));
        let mut mesh = Mesh::unit_cube();
        mesh.set_source("models/crate.glb");
        parent.borrow_mut().add_mesh(mesh.into_ref());
        let child = scene.create_node("lid", Some(&parent));
        child
            .borrow_mut()
            .set_rotation_euler_degrees(Vec3::new(0.0, 90.0, 0.0));

        let value = save_to_value(&scene, &runtime, 0.5, -0.25);

        let mut assets = StubAssets {
            meshes: [("models/crate.glb".to_owned(), Mesh::unit_cube().into_ref())]
                .into_iter()
                .collect(),
            scripts_seen: Vec::new(),
        };
        let mut restored = SceneGraph::new();
        let camera = load_from_value(&mut restored, &value, &mut assets).unwrap();

        assert_eq!(camera, CameraState { yaw: 0.5, pitch: -0.25, has_data: true });
        let parent = restored.find_node("crate").unwrap();
        assert_eq!(parent.borrow().local_position(), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(parent.borrow().local_scale(), Vec3::splat(2.0));
        assert_eq!(parent.borrow().mesh_count(), 1);
        let lid = restored.find_node("lid").unwrap();
        let euler = lid.borrow().rotation_euler_degrees();
        assert!((euler.y - 90.0).abs() < 1e-3);
        assert!(Rc::ptr_eq(&lid.borrow().parent().unwrap(), &parent));
    }

    #[test]
    fn unknown_keys_are_ignored_and_missing_keys_default(
    ) {
        let value = serde_json::json!({
            "nodes": [{ "name": "bare", "future_field": 42 }],
            "editor_extras": {},
        });
        let mut scene = SceneGraph::new();
        let mut assets = StubAssets {
            meshes: HashMap::new(),
            scripts_seen: Vec::new(),
        };
        let camera = load_from_value(&mut scene, &value, &mut assets).unwrap();
        assert!(!camera.has_data);

        let node = scene.find_node("bare").unwrap();
        assert_eq!(node.borrow().local_position(), Vec3::ZERO);
        assert_eq!(node.borrow().local_scale(), Vec3::ONE);
    }

    #[test]
    fn terrain_and_water_round_trip() {
        use std::sync::Arc;

        let mut scene = SceneGraph::new();
        let runtime = test_runtime();

        let ground = crate::scene::terrain::terrain_node("ground", 60.0, 40.0, 12, 3);
        ground.borrow_mut().terrain_mut().unwrap().set_layer_texture(
            1,
            crate::scene::terrain::LayerTexture::Color,
            "textures/rock.png",
        );
        // Resolve the queued swap so the path lands on the layer and is
        // persisted.
        ground
            .borrow_mut()
            .terrain_mut()
            .unwrap()
            .process_pending_updates(&mut |path, _| {
                Some(Arc::new(crate::render::Texture::placeholder(path, 1, 1)))
            });
        SceneNode::add_child(scene.root(), ground);
        SceneNode::add_child(scene.root(), crate::scene::water::water_node("lake"));

        let value = save_to_value(&scene, &runtime, 0.0, 0.0);
        let mut restored = SceneGraph::new();
        let mut assets = StubAssets {
            meshes: HashMap::new(),
            scripts_seen: Vec::new(),
        };
        load_from_value(&mut restored, &value, &mut assets).unwrap();

        let ground = restored.find_node("ground").unwrap();
        {
            let borrowed = ground.borrow();
            let terrain = borrowed.terrain().unwrap();
            assert_eq!(terrain.width(), 60.0);
            assert_eq!(terrain.depth(), 40.0);
            assert_eq!(terrain.divisions(), 12);
            assert_eq!(terrain.layer_count(), 3);
            // The procedural grid was rebuilt, not loaded as an asset ref.
            assert_eq!(borrowed.mesh_count(), 1);
        }
        // The persisted layer path comes back through the pending-update
        // queue once a loader resolves it.
        ground
            .borrow_mut()
            .terrain_mut()
            .unwrap()
            .process_pending_updates(&mut |path, _| {
                Some(Arc::new(crate::render::Texture::placeholder(path, 1, 1)))
            });
        assert_eq!(
            ground
                .borrow()
                .terrain()
                .unwrap()
                .layer(1)
                .color_path
                .as_deref(),
            Some("textures/rock.png")
        );

        let lake = restored.find_node("lake").unwrap();
        assert!(lake.borrow().is_water());
        assert_eq!(lake.borrow().mesh_count(), 1);
    }

    #[test]
    fn lights_round_trip_their_payload() {
        let mut scene = SceneGraph::new();
        let runtime = test_runtime();
        scene.add_light(crate::scene::light::point_light(
            "lamp",
            Vec3::new(1.0, 0.5, 0.25),
            12.0,
        ));

        let value = save_to_value(&scene, &runtime, 0.0, 0.0);
        let mut restored = SceneGraph::new();
        let mut assets = StubAssets {
            meshes: HashMap::new(),
            scripts_seen: Vec::new(),
        };
        load_from_value(&mut restored, &value, &mut assets).unwrap();

        let lamp = restored.find_node("lamp").unwrap();
        let lamp = lamp.borrow();
        let light = lamp.light().unwrap();
        assert_eq!(light.color, Vec3::new(1.0, 0.5, 0.25));
        assert_eq!(light.range, 12.0);
    }
}
