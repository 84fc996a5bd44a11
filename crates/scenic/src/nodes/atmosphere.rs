//! Atmospheric nodes: fog, rainbow, and the sky sphere.

use crate::{
    math::{Color, Transform, Vec3},
    nodes::{BlendMap, Pigment, Turbulence},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FogKind {
    /// Uniform over all space.
    #[default]
    Constant,
    /// Density fades with altitude above `fog_offset`.
    Ground,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fog {
    pub kind: FogKind,
    pub distance: f64,
    pub color: Color,
    pub offset: f64,
    pub alt: f64,
    pub up: Vec3,
    pub turbulence: Option<Turbulence>,
    pub turb_depth: f64,
}

impl Default for Fog {
    fn default() -> Self {
        Self {
            kind: FogKind::Constant,
            distance: 0.0,
            color: Color::BLACK,
            offset: 0.0,
            alt: 1.0,
            up: [0.0, 1.0, 0.0],
            turbulence: None,
            turb_depth: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rainbow {
    pub direction: Vec3,
    pub angle: f64,
    pub width: f64,
    pub distance: f64,
    pub jitter: f64,
    pub up: Vec3,
    pub arc_angle: f64,
    pub falloff_angle: f64,
    pub color_map: BlendMap<Color>,
}

impl Default for Rainbow {
    fn default() -> Self {
        Self {
            direction: [0.0, 0.0, 1.0],
            angle: 0.0,
            width: 0.0,
            distance: 0.0,
            jitter: 0.0,
            up: [0.0, 1.0, 0.0],
            arc_angle: 180.0,
            falloff_angle: 180.0,
            color_map: BlendMap::new(),
        }
    }
}

/// Background sphere at infinity, shaded by one or more pigments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkySphere {
    pub pigments: Vec<Pigment>,
    pub emission: Option<Color>,
    pub transform: Transform,
}
