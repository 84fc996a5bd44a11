//! Geometric primitives, CSG, and the object node wrapper.

use crate::{
    function::FunctionId,
    math::{Transform, Vec2, Vec3, Vec4},
    nodes::{Interior, LightSource, Material, Texture},
};

/// Interpolation kind for prisms, lathes, sphere sweeps, and spline values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplineKind {
    #[default]
    Linear,
    Quadratic,
    Cubic,
    Natural,
    Bezier,
    BSpline,
}

/// Prism sweep kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrismSweep {
    #[default]
    Linear,
    Conic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsgOp {
    Union,
    Intersection,
    Difference,
    Merge,
}

/// Bounding shape for isosurface and parametric objects.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainedBy {
    Box { corner1: Vec3, corner2: Vec3 },
    Sphere { center: Vec3, radius: f64 },
}

impl Default for ContainedBy {
    fn default() -> Self {
        Self::Box {
            corner1: [-1.0; 3],
            corner2: [1.0; 3],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlobComponent {
    /// Spherical when `radius2` is zero-length, cylindrical otherwise.
    pub center: Vec3,
    pub end: Option<Vec3>,
    pub radius: f64,
    pub strength: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeshTriangle {
    pub corners: [Vec3; 3],
    pub normals: Option<[Vec3; 3]>,
    pub texture: Option<u32>,
}

/// The geometric body of an object.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Sphere {
        center: Vec3,
        radius: f64,
    },
    Box {
        corner1: Vec3,
        corner2: Vec3,
    },
    Cone {
        base: Vec3,
        base_radius: f64,
        cap: Vec3,
        cap_radius: f64,
        open: bool,
    },
    Cylinder {
        base: Vec3,
        cap: Vec3,
        radius: f64,
        open: bool,
    },
    Torus {
        major_radius: f64,
        minor_radius: f64,
        sturm: bool,
    },
    Plane {
        normal: Vec3,
        distance: f64,
    },
    Polygon {
        points: Vec<Vec2>,
    },
    Prism {
        spline: SplineKind,
        sweep: PrismSweep,
        height1: f64,
        height2: f64,
        points: Vec<Vec2>,
        open: bool,
        sturm: bool,
    },
    Lathe {
        spline: SplineKind,
        points: Vec<Vec2>,
        sturm: bool,
    },
    Mesh {
        triangles: Vec<MeshTriangle>,
        textures: Vec<Texture>,
    },
    Mesh2 {
        vertices: Vec<Vec3>,
        normals: Vec<Vec3>,
        faces: Vec<[u32; 3]>,
        normal_faces: Vec<[u32; 3]>,
    },
    Isosurface {
        function: FunctionId,
        contained_by: ContainedBy,
        threshold: f64,
        accuracy: f64,
        max_gradient: f64,
        open: bool,
        all_intersections: bool,
    },
    Parametric {
        fx: FunctionId,
        fy: FunctionId,
        fz: FunctionId,
        uv1: Vec2,
        uv2: Vec2,
        contained_by: ContainedBy,
        accuracy: f64,
        precompute_depth: u32,
    },
    Blob {
        threshold: f64,
        components: Vec<BlobComponent>,
        sturm: bool,
    },
    HeightField {
        source: String,
        water_level: f64,
        smooth: bool,
    },
    Text {
        font: String,
        text: String,
        thickness: f64,
        offset: Vec3,
    },
    Disc {
        center: Vec3,
        normal: Vec3,
        radius: f64,
        hole_radius: f64,
    },
    BicubicPatch {
        patch_type: u32,
        flatness: f64,
        u_steps: u32,
        v_steps: u32,
        points: Vec<Vec3>,
    },
    Superellipsoid {
        east_west: f64,
        north_south: f64,
    },
    JuliaFractal {
        parameter: Vec4,
        max_iterations: u32,
        precision: f64,
    },
    Sor {
        points: Vec<Vec2>,
        open: bool,
        sturm: bool,
    },
    SphereSweep {
        spline: SplineKind,
        spheres: Vec<(Vec3, f64)>,
        tolerance: f64,
    },
    Poly {
        order: u32,
        coeffs: Vec<f64>,
        sturm: bool,
    },
    Quadric {
        squared: Vec3,
        mixed: Vec3,
        linear: Vec3,
        constant: f64,
    },
    Ovus {
        bottom_radius: f64,
        top_radius: f64,
    },
    Lemon {
        base: Vec3,
        base_radius: f64,
        cap: Vec3,
        cap_radius: f64,
        inner_radius: f64,
    },
    Triangle {
        corners: [Vec3; 3],
    },
    SmoothTriangle {
        corners: [Vec3; 3],
        normals: [Vec3; 3],
    },
    Csg {
        op: CsgOp,
        children: Vec<ObjectNode>,
    },
    LightGroup {
        lights: Vec<LightSource>,
        objects: Vec<ObjectNode>,
        global_lights: bool,
    },
}

impl Shape {
    /// Short name used in diagnostics and scene summaries.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sphere { .. } => "sphere",
            Self::Box { .. } => "box",
            Self::Cone { .. } => "cone",
            Self::Cylinder { .. } => "cylinder",
            Self::Torus { .. } => "torus",
            Self::Plane { .. } => "plane",
            Self::Polygon { .. } => "polygon",
            Self::Prism { .. } => "prism",
            Self::Lathe { .. } => "lathe",
            Self::Mesh { .. } => "mesh",
            Self::Mesh2 { .. } => "mesh2",
            Self::Isosurface { .. } => "isosurface",
            Self::Parametric { .. } => "parametric",
            Self::Blob { .. } => "blob",
            Self::HeightField { .. } => "height_field",
            Self::Text { .. } => "text",
            Self::Disc { .. } => "disc",
            Self::BicubicPatch { .. } => "bicubic_patch",
            Self::Superellipsoid { .. } => "superellipsoid",
            Self::JuliaFractal { .. } => "julia_fractal",
            Self::Sor { .. } => "sor",
            Self::SphereSweep { .. } => "sphere_sweep",
            Self::Poly { .. } => "poly",
            Self::Quadric { .. } => "quadric",
            Self::Ovus { .. } => "ovus",
            Self::Lemon { .. } => "lemon",
            Self::Triangle { .. } => "triangle",
            Self::SmoothTriangle { .. } => "smooth_triangle",
            Self::Csg { op: CsgOp::Union, .. } => "union",
            Self::Csg {
                op: CsgOp::Intersection, ..
            } => "intersection",
            Self::Csg {
                op: CsgOp::Difference, ..
            } => "difference",
            Self::Csg { op: CsgOp::Merge, .. } => "merge",
            Self::LightGroup { .. } => "light_group",
        }
    }
}

/// A finished object: shape plus the modifiers composed onto it.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectNode {
    pub shape: Shape,
    pub transform: Transform,
    /// Layered textures, bottom first. Only plain textures may stack.
    pub textures: Vec<Texture>,
    pub interior: Option<Interior>,
    pub inverse: bool,
    pub hollow: Option<bool>,
    pub no_shadow: bool,
    pub no_image: bool,
    pub no_reflection: bool,
}

impl ObjectNode {
    #[must_use]
    pub fn new(shape: Shape) -> Self {
        Self {
            shape,
            transform: Transform::IDENTITY,
            textures: Vec::new(),
            interior: None,
            inverse: false,
            hollow: None,
            no_shadow: false,
            no_image: false,
            no_reflection: false,
        }
    }

    /// Applies a material: its texture replaces the object's stack, its
    /// interior replaces the object's interior.
    pub fn apply_material(&mut self, material: &Material) {
        if let Some(texture) = &material.texture {
            self.textures = vec![texture.clone()];
        }
        if let Some(interior) = &material.interior {
            self.interior = Some(interior.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_shape_names() {
        let shape = Shape::Sphere {
            center: [0.0; 3],
            radius: 1.0,
        };
        assert_eq!(shape.name(), "sphere");
        let csg = Shape::Csg {
            op: CsgOp::Difference,
            children: vec![],
        };
        assert_eq!(csg.name(), "difference");
    }
}
