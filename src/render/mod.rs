//! Material/pipeline registry, mesh resources and the scene renderer.

pub mod def;
pub mod material;
pub mod mesh;
pub mod pipelines;
pub mod renderer;
pub mod texture;

pub use {
    def::{SceneUbo, ShadowPush},
    material::{Material, MaterialId},
    mesh::{Mesh, MeshId, MeshRef, Triangle, Vertex},
    pipelines::{BlendConfig, PipelineRegistry, PipelineType},
    renderer::SceneRenderer,
    texture::Texture,
};
