//! Light nodes.

use {
    super::node::{NodeKind, NodeRef, SceneNode},
    glam::Vec3,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LightType {
    #[default]
    Point,
    Directional,
    Spot,
}

impl LightType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Point => "point",
            Self::Directional => "directional",
            Self::Spot => "spot",
        }
    }

    pub fn from_str(name: &str) -> Self {
        match name {
            "directional" => Self::Directional,
            "spot" => Self::Spot,
            _ => Self::Point,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LightData {
    pub light_type: LightType,
    pub color: Vec3,
    /// 0 means unlimited; otherwise the maximum lit distance with linear
    /// falloff toward it.
    pub range: f32,
}

impl Default for LightData {
    fn default() -> Self {
        Self {
            light_type: LightType::Point,
            color: Vec3::ONE,
            range: 0.0,
        }
    }
}

pub fn light_node(name: impl Into<String>, data: LightData) -> NodeRef {
    SceneNode::with_kind(name, NodeKind::Light(data))
}

pub fn point_light(name: impl Into<String>, color: Vec3, range: f32) -> NodeRef {
    light_node(
        name,
        LightData {
            light_type: LightType::Point,
            color,
            range,
        },
    )
}
