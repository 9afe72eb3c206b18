//! Scene graph, cameras, lights, terrain and water surfaces, script
//! attachment and persistence.

pub mod camera;
pub mod graph;
pub mod light;
pub mod node;
pub mod script;
pub mod serializer;
pub mod terrain;
pub mod water;

pub use {
    graph::{SceneCommand, SceneGraph},
    light::{LightData, LightType},
    node::{NodeKind, NodeRef, NodeWeak, SceneNode},
    script::ScriptPair,
    terrain::{Terrain, TerrainLayer},
};
