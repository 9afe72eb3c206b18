//! qengine: the scriptable core of a 3D editor-engine.
//!
//! Two coupled subsystems make up the crate:
//!
//! - **QLang** ([`qlang`]): a class-based scripting language compiled to
//!   native code, with per-instance reflection the editor's property panel
//!   reads directly, a native-function bridge into the engine, and a binary
//!   module format (`.qm`).
//! - **Scene & render core** ([`scene`], [`render`], [`raycast`], [`bake`],
//!   [`gizmo`]): a scene graph with lazy world-transform caching, a
//!   material/pipeline registry with per-material descriptor sets, a cached
//!   mesh raycasting service, and a lightmap baking pipeline with direct and
//!   bounced lighting.
//!
//! The windowing, docking UI and swapchain around this crate are thin
//! collaborators: everything here renders into externally-owned command
//! buffers and runs headless (CPU paths) when no Vulkan device exists.

pub mod bake;
pub mod config;
pub mod driver;
pub mod gizmo;
pub mod qlang;
pub mod raycast;
pub mod render;
pub mod scene;

/// Types used by almost every embedder.
pub mod prelude {
    pub use {
        crate::{
            bake::{BakeSettings, LightmapBaker},
            config::EngineConfig,
            gizmo::{GizmoAxis, GizmoSpace, RotateGizmo, ScaleGizmo, TerrainGizmo, TranslateGizmo},
            qlang::{QValue, ScriptHost},
            raycast::{CastResult, Raycaster},
            render::{Material, Mesh, PipelineRegistry, SceneRenderer},
            scene::{SceneGraph, SceneNode},
        },
        log::{debug, error, info, trace, warn},
    };
}
