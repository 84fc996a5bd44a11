//! Camera and light-source nodes.

use crate::math::{Color, Transform, Vec3, vnormalize, vscale, vsub};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraKind {
    #[default]
    Perspective,
    Orthographic,
}

/// The scene camera. `right` carries the canonical 4/3 aspect by default.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub kind: CameraKind,
    pub location: Vec3,
    pub direction: Vec3,
    pub right: Vec3,
    pub up: Vec3,
    pub sky: Vec3,
    pub angle: Option<f64>,
    pub transform: Transform,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            kind: CameraKind::Perspective,
            location: [0.0; 3],
            direction: [0.0, 0.0, 1.0],
            right: [1.33, 0.0, 0.0],
            up: [0.0, 1.0, 0.0],
            sky: [0.0, 1.0, 0.0],
            angle: None,
            transform: Transform::IDENTITY,
        }
    }
}

impl Camera {
    /// Re-aims the camera at `target`, rebuilding the direction frame from
    /// `sky`. Runs after all other camera items, whatever their order in the
    /// block.
    ///
    /// Keeps the magnitudes of `direction`, `right`, and `up`; only their
    /// orientation changes. A target coincident with the location leaves the
    /// frame untouched (the builder warns).
    pub fn look_at(&mut self, target: Vec3) {
        let dir_len = crate::math::vlength(self.direction);
        let right_len = crate::math::vlength(self.right);
        let up_len = crate::math::vlength(self.up);
        let Some(forward) = vnormalize(vsub(target, self.location)) else {
            return;
        };
        let Some(right) = vnormalize(crate::math::vcross(self.sky, forward)) else {
            return;
        };
        let up = crate::math::vcross(forward, right);
        self.direction = vscale(forward, dir_len);
        self.right = vscale(right, right_len);
        self.up = vscale(up, up_len);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AreaLight {
    pub axis1: Vec3,
    pub axis2: Vec3,
    pub size1: u32,
    pub size2: u32,
    pub adaptive: Option<u32>,
    pub jitter: bool,
    pub circular: bool,
    pub orient: bool,
}

/// Light emission kind with its kind-specific controls.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum LightKind {
    #[default]
    Point,
    Spotlight {
        point_at: Vec3,
        radius: f64,
        falloff: f64,
        tightness: f64,
    },
    Cylinder {
        point_at: Vec3,
        radius: f64,
        falloff: f64,
        tightness: f64,
    },
    Parallel {
        point_at: Vec3,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LightSource {
    pub location: Vec3,
    pub color: Color,
    pub kind: LightKind,
    pub area: Option<AreaLight>,
    pub fade_distance: f64,
    pub fade_power: f64,
    pub shadowless: bool,
    pub media_attenuation: bool,
    pub media_interaction: bool,
    pub transform: Transform,
}

impl Default for LightSource {
    fn default() -> Self {
        Self {
            location: [0.0; 3],
            color: Color::WHITE,
            kind: LightKind::Point,
            area: None,
            fade_distance: 0.0,
            fade_power: 0.0,
            shadowless: false,
            media_attenuation: false,
            media_interaction: true,
            transform: Transform::IDENTITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_look_at_keeps_magnitudes() {
        let mut cam = Camera {
            location: [0.0, 0.0, -5.0],
            ..Camera::default()
        };
        cam.look_at([0.0, 0.0, 10.0]);
        assert!((crate::math::vlength(cam.direction) - 1.0).abs() < 1e-9);
        assert!((crate::math::vlength(cam.right) - 1.33).abs() < 1e-9);
        // forward stays +z
        assert!((cam.direction[2] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_look_at_degenerate_target() {
        let mut cam = Camera::default();
        let before = cam.clone();
        cam.look_at(cam.location);
        assert_eq!(cam, before);
    }
}
