//! Builders for geometric primitives and CSG.
//!
//! `parse_object_block` is the single entry: the caller has consumed an
//! object keyword (or sees an object identifier) and gets back a finished
//! [`ObjectNode`] with its modifiers composed.

use crate::{
    diag::{ErrorKind, ParseResult},
    nodes::{
        BlobComponent, ContainedBy, CsgOp, MeshTriangle, ObjectNode, PrismSweep, Shape, SplineKind,
    },
    token::{Keyword, TokenKind},
    value::{Value, ValueTag},
};

use super::Parser;

impl Parser<'_> {
    /// Parses a full object block for the given constructor keyword.
    pub(crate) fn parse_object_block(&mut self, keyword: Keyword) -> ParseResult<ObjectNode> {
        self.parse_begin()?;
        let mut node = match keyword {
            Keyword::Object => self.parse_object_reference()?,
            Keyword::Union => self.parse_csg(CsgOp::Union)?,
            Keyword::Intersection => self.parse_csg(CsgOp::Intersection)?,
            Keyword::Difference => self.parse_csg(CsgOp::Difference)?,
            Keyword::Merge => self.parse_csg(CsgOp::Merge)?,
            Keyword::LightGroup => self.parse_light_group()?,
            other => ObjectNode::new(self.parse_shape(other)?),
        };
        self.parse_object_modifiers(&mut node)?;
        self.parse_end()?;
        Ok(node)
    }

    /// `object { IDENT … }`: the prototype + override idiom for objects.
    fn parse_object_reference(&mut self) -> ParseResult<ObjectNode> {
        let token = self.expect_token()?;
        match &token.kind {
            TokenKind::TypedIdentifier(ValueTag::Object, name) => {
                let name = name.clone();
                let found = self.symbols.find(&name).expect("typed identifier resolves");
                match self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                    Value::Object(node) => Ok(*node),
                    _ => unreachable!("tag promised an object"),
                }
            }
            TokenKind::Keyword(kw) if kw.is_object() => {
                let kw = *kw;
                Ok(self.parse_object_block(kw)?)
            }
            other => Err(self.error_at(
                ErrorKind::Parse,
                token.position,
                format!("expected an object identifier or constructor, found {}", other.describe()),
            )),
        }
    }

    /// CSG body: children until a non-object token appears.
    fn parse_csg(&mut self, op: CsgOp) -> ParseResult<ObjectNode> {
        let mut children = Vec::new();
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in CSG block"));
            };
            match &token.kind {
                TokenKind::Keyword(kw) if kw.is_object() => {
                    let kw = *kw;
                    children.push(self.parse_object_block(kw)?);
                }
                TokenKind::TypedIdentifier(ValueTag::Object, name) => {
                    let name = name.clone();
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    if let Value::Object(node) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                        children.push(*node);
                    }
                }
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }
        if children.is_empty() || (op == CsgOp::Difference && children.len() < 2) {
            return Err(self.error_here(ErrorKind::Parse, "CSG block needs more child objects"));
        }
        Ok(ObjectNode::new(Shape::Csg { op, children }))
    }

    fn parse_light_group(&mut self) -> ParseResult<ObjectNode> {
        let mut lights = Vec::new();
        let mut objects = Vec::new();
        let mut global_lights = false;
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in light_group"));
            };
            match &token.kind {
                TokenKind::Keyword(Keyword::LightSource) => lights.push(self.parse_light_source()?),
                TokenKind::Keyword(Keyword::GlobalLights) => global_lights = self.parse_float()? != 0.0,
                TokenKind::Keyword(kw) if kw.is_object() => {
                    let kw = *kw;
                    objects.push(self.parse_object_block(kw)?);
                }
                TokenKind::TypedIdentifier(ValueTag::Object, name) => {
                    let name = name.clone();
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    if let Value::Object(node) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                        objects.push(*node);
                    }
                }
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }
        Ok(ObjectNode::new(Shape::LightGroup {
            lights,
            objects,
            global_lights,
        }))
    }

    // --- geometry ---

    fn parse_shape(&mut self, keyword: Keyword) -> ParseResult<Shape> {
        let shape = match keyword {
            Keyword::Sphere => {
                let center = self.parse_vector()?;
                self.parse_comma()?;
                let radius = self.parse_float()?;
                if radius <= 0.0 {
                    return Err(self.error_here(ErrorKind::Domain, "sphere radius must be positive"));
                }
                Shape::Sphere { center, radius }
            }
            Keyword::Box => {
                let corner1 = self.parse_vector()?;
                self.parse_comma()?;
                let corner2 = self.parse_vector()?;
                Shape::Box { corner1, corner2 }
            }
            Keyword::Cone => {
                let base = self.parse_vector()?;
                self.parse_comma()?;
                let base_radius = self.parse_float()?;
                self.parse_comma()?;
                let cap = self.parse_vector()?;
                self.parse_comma()?;
                let cap_radius = self.parse_float()?;
                let open = self.allow_keyword(Keyword::Open)?;
                if base_radius < 0.0 || cap_radius < 0.0 {
                    return Err(self.error_here(ErrorKind::Domain, "cone radii cannot be negative"));
                }
                Shape::Cone {
                    base,
                    base_radius,
                    cap,
                    cap_radius,
                    open,
                }
            }
            Keyword::Cylinder => {
                let base = self.parse_vector()?;
                self.parse_comma()?;
                let cap = self.parse_vector()?;
                self.parse_comma()?;
                let radius = self.parse_float()?;
                let open = self.allow_keyword(Keyword::Open)?;
                if radius <= 0.0 {
                    return Err(self.error_here(ErrorKind::Domain, "cylinder radius must be positive"));
                }
                if base == cap {
                    return Err(self.error_here(ErrorKind::Domain, "cylinder ends cannot coincide"));
                }
                Shape::Cylinder { base, cap, radius, open }
            }
            Keyword::Torus => {
                let major_radius = self.parse_float()?;
                self.parse_comma()?;
                let minor_radius = self.parse_float()?;
                if major_radius < 0.0 || minor_radius < 0.0 {
                    return Err(self.error_here(ErrorKind::Domain, "torus radii cannot be negative"));
                }
                let sturm = self.allow_keyword(Keyword::Sturm)?;
                Shape::Torus {
                    major_radius,
                    minor_radius,
                    sturm,
                }
            }
            Keyword::Plane => {
                let normal = self.parse_vector()?;
                if crate::math::vlength(normal) == 0.0 {
                    return Err(self.error_here(ErrorKind::Domain, "plane normal cannot be a zero vector"));
                }
                self.parse_comma()?;
                let distance = self.parse_float()?;
                Shape::Plane { normal, distance }
            }
            Keyword::Polygon => {
                let count = self.parse_u32("polygon point count")? as usize;
                if count < 3 {
                    return Err(self.error_here(ErrorKind::Domain, "polygon needs at least three points"));
                }
                let mut points = Vec::with_capacity(count);
                for _ in 0..count {
                    self.parse_comma()?;
                    points.push(self.parse_vector2()?);
                }
                Shape::Polygon { points }
            }
            Keyword::Prism => {
                let spline = self.parse_spline_kind()?.unwrap_or(SplineKind::Linear);
                let sweep = if self.allow_keyword(Keyword::ConicSweep)? {
                    PrismSweep::Conic
                } else {
                    let _ = self.allow_keyword(Keyword::LinearSweep)?;
                    PrismSweep::Linear
                };
                let height1 = self.parse_float()?;
                self.parse_comma()?;
                let height2 = self.parse_float()?;
                self.parse_comma()?;
                let count = self.parse_u32("prism point count")? as usize;
                let mut points = Vec::with_capacity(count);
                for _ in 0..count {
                    self.parse_comma()?;
                    points.push(self.parse_vector2()?);
                }
                let open = self.allow_keyword(Keyword::Open)?;
                let sturm = self.allow_keyword(Keyword::Sturm)?;
                Shape::Prism {
                    spline,
                    sweep,
                    height1,
                    height2,
                    points,
                    open,
                    sturm,
                }
            }
            Keyword::Lathe => {
                let spline = self.parse_spline_kind()?.unwrap_or(SplineKind::Linear);
                let count = self.parse_u32("lathe point count")? as usize;
                if count < 2 {
                    return Err(self.error_here(ErrorKind::Domain, "lathe needs at least two points"));
                }
                let mut points = Vec::with_capacity(count);
                for _ in 0..count {
                    self.parse_comma()?;
                    points.push(self.parse_vector2()?);
                }
                let sturm = self.allow_keyword(Keyword::Sturm)?;
                Shape::Lathe { spline, points, sturm }
            }
            Keyword::Mesh => self.parse_mesh()?,
            Keyword::Mesh2 => self.parse_mesh2()?,
            Keyword::Isosurface => self.parse_isosurface()?,
            Keyword::Parametric => self.parse_parametric()?,
            Keyword::Blob => self.parse_blob()?,
            Keyword::HeightField => {
                // an optional image-format word precedes the file name
                if let Some(token) = self.next_token()? {
                    if !matches!(token.kind, TokenKind::Identifier(_)) {
                        self.unget(token);
                    }
                }
                let source = self.parse_string_value()?;
                let mut water_level = 0.0;
                let mut smooth = false;
                loop {
                    if self.allow_keyword(Keyword::WaterLevel)? {
                        water_level = self.parse_float()?;
                    } else if self.allow_keyword(Keyword::Smooth)? {
                        smooth = true;
                    } else {
                        break;
                    }
                }
                Shape::HeightField {
                    source,
                    water_level,
                    smooth,
                }
            }
            Keyword::Text => {
                self.expect_keyword(Keyword::Ttf, "'ttf'")?;
                let font = self.parse_string_value()?;
                let text = self.parse_string_value()?;
                let thickness = self.parse_float()?;
                self.parse_comma()?;
                let offset = self.parse_vector()?;
                Shape::Text {
                    font,
                    text,
                    thickness,
                    offset,
                }
            }
            Keyword::Disc => {
                let center = self.parse_vector()?;
                self.parse_comma()?;
                let normal = self.parse_vector()?;
                if crate::math::vlength(normal) == 0.0 {
                    return Err(self.error_here(ErrorKind::Domain, "disc normal cannot be a zero vector"));
                }
                self.parse_comma()?;
                let radius = self.parse_float()?;
                let hole_radius = if self.allow(&TokenKind::Comma)? {
                    self.parse_float()?
                } else {
                    0.0
                };
                Shape::Disc {
                    center,
                    normal,
                    radius,
                    hole_radius,
                }
            }
            Keyword::BicubicPatch => self.parse_bicubic_patch()?,
            Keyword::Superellipsoid => {
                let v = self.parse_vector2()?;
                Shape::Superellipsoid {
                    east_west: v[0],
                    north_south: v[1],
                }
            }
            Keyword::JuliaFractal => {
                let parameter = self.parse_vector4()?;
                let mut max_iterations = 20;
                let mut precision = 1.0 / 20.0;
                loop {
                    if self.allow_keyword(Keyword::MaxIteration)? {
                        max_iterations = self.parse_u32("max_iteration")?;
                    } else if self.allow_keyword(Keyword::Precision)? {
                        let p = self.parse_float()?;
                        if p <= 0.0 {
                            return Err(self.error_here(ErrorKind::Domain, "precision must be positive"));
                        }
                        precision = 1.0 / p;
                    } else {
                        break;
                    }
                }
                Shape::JuliaFractal {
                    parameter,
                    max_iterations,
                    precision,
                }
            }
            Keyword::Sor => {
                let count = self.parse_u32("sor point count")? as usize;
                if count < 4 {
                    return Err(self.error_here(ErrorKind::Domain, "sor needs at least four points"));
                }
                let mut points = Vec::with_capacity(count);
                for _ in 0..count {
                    self.parse_comma()?;
                    points.push(self.parse_vector2()?);
                }
                let open = self.allow_keyword(Keyword::Open)?;
                let sturm = self.allow_keyword(Keyword::Sturm)?;
                Shape::Sor { points, open, sturm }
            }
            Keyword::SphereSweep => {
                let spline = self.parse_spline_kind()?.unwrap_or(SplineKind::Linear);
                let count = self.parse_u32("sphere_sweep sphere count")? as usize;
                if count < 2 {
                    return Err(self.error_here(ErrorKind::Domain, "sphere_sweep needs at least two spheres"));
                }
                let mut spheres = Vec::with_capacity(count);
                for _ in 0..count {
                    self.parse_comma()?;
                    let center = self.parse_vector()?;
                    self.parse_comma()?;
                    let radius = self.parse_float()?;
                    spheres.push((center, radius));
                }
                let tolerance = if self.allow_keyword(Keyword::Tolerance)? {
                    self.parse_float()?
                } else {
                    1e-6
                };
                Shape::SphereSweep {
                    spline,
                    spheres,
                    tolerance,
                }
            }
            Keyword::Poly => {
                let order = self.parse_u32("poly order")?;
                if !(2..=35).contains(&order) {
                    return Err(self.error_here(ErrorKind::Domain, "poly order must be between 2 and 35"));
                }
                self.parse_comma()?;
                let count = ((order + 1) * (order + 2) * (order + 3) / 6) as usize;
                let coeffs = self.parse_coefficients(count)?;
                let sturm = self.allow_keyword(Keyword::Sturm)?;
                Shape::Poly { order, coeffs, sturm }
            }
            Keyword::Quadric => {
                let squared = self.parse_vector()?;
                self.parse_comma()?;
                let mixed = self.parse_vector()?;
                self.parse_comma()?;
                let linear = self.parse_vector()?;
                self.parse_comma()?;
                let constant = self.parse_float()?;
                Shape::Quadric {
                    squared,
                    mixed,
                    linear,
                    constant,
                }
            }
            Keyword::Ovus => {
                let bottom_radius = self.parse_float()?;
                self.parse_comma()?;
                let top_radius = self.parse_float()?;
                if bottom_radius <= 0.0 || top_radius <= 0.0 {
                    return Err(self.error_here(ErrorKind::Domain, "ovus radii must be positive"));
                }
                Shape::Ovus {
                    bottom_radius,
                    top_radius,
                }
            }
            Keyword::Lemon => {
                let base = self.parse_vector()?;
                self.parse_comma()?;
                let base_radius = self.parse_float()?;
                self.parse_comma()?;
                let cap = self.parse_vector()?;
                self.parse_comma()?;
                let cap_radius = self.parse_float()?;
                self.parse_comma()?;
                let inner_radius = self.parse_float()?;
                Shape::Lemon {
                    base,
                    base_radius,
                    cap,
                    cap_radius,
                    inner_radius,
                }
            }
            Keyword::Triangle => {
                let a = self.parse_vector()?;
                self.parse_comma()?;
                let b = self.parse_vector()?;
                self.parse_comma()?;
                let c = self.parse_vector()?;
                Shape::Triangle { corners: [a, b, c] }
            }
            Keyword::SmoothTriangle => {
                let mut corners = [[0.0; 3]; 3];
                let mut normals = [[0.0; 3]; 3];
                for i in 0..3 {
                    if i > 0 {
                        self.parse_comma()?;
                    }
                    corners[i] = self.parse_vector()?;
                    self.parse_comma()?;
                    normals[i] = self.parse_vector()?;
                }
                Shape::SmoothTriangle { corners, normals }
            }
            other => {
                let name: &'static str = other.into();
                return Err(self.error_here(ErrorKind::Parse, format!("'{name}' is not an object constructor")));
            }
        };
        Ok(shape)
    }

    pub(crate) fn parse_spline_kind(&mut self) -> ParseResult<Option<SplineKind>> {
        let Some(token) = self.next_token()? else {
            return Ok(None);
        };
        let kind = match token.keyword() {
            Some(Keyword::LinearSpline) => SplineKind::Linear,
            Some(Keyword::QuadraticSpline) => SplineKind::Quadratic,
            Some(Keyword::CubicSpline) => SplineKind::Cubic,
            Some(Keyword::NaturalSpline) => SplineKind::Natural,
            Some(Keyword::BezierSpline) => SplineKind::Bezier,
            Some(Keyword::BSpline) => SplineKind::BSpline,
            _ => {
                self.unget(token);
                return Ok(None);
            }
        };
        Ok(Some(kind))
    }

    /// `<c0, c1, …, cN>`: a coefficient list longer than an expression
    /// vector literal allows, so it is read directly.
    fn parse_coefficients(&mut self, count: usize) -> ParseResult<Vec<f64>> {
        self.expect_kind(&TokenKind::LeftAngle, "'<'")?;
        let coeffs = self.in_vector(|parser| {
            let mut coeffs = Vec::with_capacity(count);
            for i in 0..count {
                if i > 0 {
                    parser.parse_comma()?;
                }
                coeffs.push(parser.parse_float()?);
            }
            Ok(coeffs)
        })?;
        self.expect_kind(&TokenKind::RightAngle, "'>'")?;
        Ok(coeffs)
    }

    fn parse_mesh(&mut self) -> ParseResult<Shape> {
        let mut triangles = Vec::new();
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in mesh"));
            };
            match token.keyword() {
                Some(Keyword::Triangle) => {
                    self.parse_begin()?;
                    let a = self.parse_vector()?;
                    self.parse_comma()?;
                    let b = self.parse_vector()?;
                    self.parse_comma()?;
                    let c = self.parse_vector()?;
                    self.parse_end()?;
                    triangles.push(MeshTriangle {
                        corners: [a, b, c],
                        normals: None,
                        texture: None,
                    });
                }
                Some(Keyword::SmoothTriangle) => {
                    self.parse_begin()?;
                    let mut corners = [[0.0; 3]; 3];
                    let mut normals = [[0.0; 3]; 3];
                    for i in 0..3 {
                        if i > 0 {
                            self.parse_comma()?;
                        }
                        corners[i] = self.parse_vector()?;
                        self.parse_comma()?;
                        normals[i] = self.parse_vector()?;
                    }
                    self.parse_end()?;
                    triangles.push(MeshTriangle {
                        corners,
                        normals: Some(normals),
                        texture: None,
                    });
                }
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }
        if triangles.is_empty() {
            return Err(self.error_here(ErrorKind::Parse, "mesh contains no triangles"));
        }
        Ok(Shape::Mesh {
            triangles,
            textures: Vec::new(),
        })
    }

    fn parse_mesh2(&mut self) -> ParseResult<Shape> {
        let mut vertices = Vec::new();
        let mut normals = Vec::new();
        let mut faces = Vec::new();
        let mut normal_faces = Vec::new();
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in mesh2"));
            };
            match token.keyword() {
                Some(Keyword::VertexVectors) => {
                    self.parse_begin()?;
                    let count = self.parse_u32("vertex count")? as usize;
                    for _ in 0..count {
                        self.parse_comma()?;
                        vertices.push(self.parse_vector()?);
                    }
                    self.parse_end()?;
                }
                Some(Keyword::NormalVectors) => {
                    self.parse_begin()?;
                    let count = self.parse_u32("normal count")? as usize;
                    for _ in 0..count {
                        self.parse_comma()?;
                        normals.push(self.parse_vector()?);
                    }
                    self.parse_end()?;
                }
                Some(Keyword::FaceIndices) => {
                    self.parse_begin()?;
                    let count = self.parse_u32("face count")? as usize;
                    for _ in 0..count {
                        self.parse_comma()?;
                        let v = self.parse_vector()?;
                        faces.push([v[0] as u32, v[1] as u32, v[2] as u32]);
                    }
                    self.parse_end()?;
                }
                Some(Keyword::NormalIndices) => {
                    self.parse_begin()?;
                    let count = self.parse_u32("normal index count")? as usize;
                    for _ in 0..count {
                        self.parse_comma()?;
                        let v = self.parse_vector()?;
                        normal_faces.push([v[0] as u32, v[1] as u32, v[2] as u32]);
                    }
                    self.parse_end()?;
                }
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }
        if vertices.is_empty() || faces.is_empty() {
            return Err(self.error_here(ErrorKind::Parse, "mesh2 needs vertex_vectors and face_indices"));
        }
        for face in &faces {
            if face.iter().any(|&i| i as usize >= vertices.len()) {
                return Err(self.error_here(ErrorKind::Domain, "face index exceeds vertex count"));
            }
        }
        Ok(Shape::Mesh2 {
            vertices,
            normals,
            faces,
            normal_faces,
        })
    }

    fn parse_contained_by(&mut self) -> ParseResult<ContainedBy> {
        self.parse_begin()?;
        let token = self.expect_token()?;
        let contained = match token.keyword() {
            Some(Keyword::Box) => {
                self.parse_begin()?;
                let corner1 = self.parse_vector()?;
                self.parse_comma()?;
                let corner2 = self.parse_vector()?;
                self.parse_end()?;
                ContainedBy::Box { corner1, corner2 }
            }
            Some(Keyword::Sphere) => {
                self.parse_begin()?;
                let center = self.parse_vector()?;
                self.parse_comma()?;
                let radius = self.parse_float()?;
                if radius <= 0.0 {
                    return Err(self.error_here(ErrorKind::Domain, "contained_by sphere radius must be positive"));
                }
                self.parse_end()?;
                ContainedBy::Sphere { center, radius }
            }
            _ => {
                return Err(self.error_at(
                    ErrorKind::Parse,
                    token.position,
                    "contained_by expects a box or a sphere",
                ));
            }
        };
        self.parse_end()?;
        Ok(contained)
    }

    fn parse_isosurface(&mut self) -> ParseResult<Shape> {
        self.expect_keyword(Keyword::Function, "'function'")?;
        let function = self.parse_function_block(None)?;
        let mut shape = Shape::Isosurface {
            function,
            contained_by: ContainedBy::default(),
            threshold: 0.0,
            accuracy: 0.001,
            max_gradient: 1.1,
            open: false,
            all_intersections: false,
        };
        let Shape::Isosurface {
            contained_by,
            threshold,
            accuracy,
            max_gradient,
            open,
            all_intersections,
            ..
        } = &mut shape
        else {
            unreachable!()
        };
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in isosurface"));
            };
            match token.keyword() {
                Some(Keyword::ContainedBy) => *contained_by = self.parse_contained_by()?,
                Some(Keyword::Threshold) => *threshold = self.parse_float()?,
                Some(Keyword::Accuracy) => *accuracy = self.parse_float()?,
                Some(Keyword::MaxGradient) => *max_gradient = self.parse_float()?,
                Some(Keyword::Open) => *open = true,
                Some(Keyword::AllIntersections) => *all_intersections = true,
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }
        Ok(shape)
    }

    fn parse_parametric(&mut self) -> ParseResult<Shape> {
        self.expect_keyword(Keyword::Function, "'function'")?;
        let fx = self.parse_function_block(None)?;
        self.parse_comma()?;
        self.expect_keyword(Keyword::Function, "'function'")?;
        let fy = self.parse_function_block(None)?;
        self.parse_comma()?;
        self.expect_keyword(Keyword::Function, "'function'")?;
        let fz = self.parse_function_block(None)?;
        let uv1 = self.parse_vector2()?;
        self.parse_comma()?;
        let uv2 = self.parse_vector2()?;
        let mut contained_by = ContainedBy::default();
        let mut accuracy = 0.001;
        let mut precompute_depth = 0;
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in parametric"));
            };
            match token.keyword() {
                Some(Keyword::ContainedBy) => contained_by = self.parse_contained_by()?,
                Some(Keyword::Accuracy) => accuracy = self.parse_float()?,
                Some(Keyword::Precompute) => {
                    precompute_depth = self.parse_u32("precompute depth")?;
                    if precompute_depth > 20 {
                        self.warn("precompute depth clamped to 20");
                        precompute_depth = 20;
                    }
                }
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }
        Ok(Shape::Parametric {
            fx,
            fy,
            fz,
            uv1,
            uv2,
            contained_by,
            accuracy,
            precompute_depth,
        })
    }

    fn parse_blob(&mut self) -> ParseResult<Shape> {
        let mut threshold = 1.0;
        let mut components = Vec::new();
        let mut sturm = false;
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in blob"));
            };
            match token.keyword() {
                Some(Keyword::Threshold) => {
                    threshold = self.parse_float()?;
                    if threshold <= 0.0 {
                        return Err(self.error_here(ErrorKind::Domain, "blob threshold must be positive"));
                    }
                }
                Some(Keyword::Sphere) => {
                    self.parse_begin()?;
                    let center = self.parse_vector()?;
                    self.parse_comma()?;
                    let radius = self.parse_float()?;
                    self.parse_comma()?;
                    let _ = self.allow_keyword(Keyword::Strength)?;
                    let strength = self.parse_float()?;
                    self.parse_end()?;
                    components.push(BlobComponent {
                        center,
                        end: None,
                        radius,
                        strength,
                    });
                }
                Some(Keyword::Cylinder) => {
                    self.parse_begin()?;
                    let center = self.parse_vector()?;
                    self.parse_comma()?;
                    let end = self.parse_vector()?;
                    self.parse_comma()?;
                    let radius = self.parse_float()?;
                    self.parse_comma()?;
                    let _ = self.allow_keyword(Keyword::Strength)?;
                    let strength = self.parse_float()?;
                    self.parse_end()?;
                    components.push(BlobComponent {
                        center,
                        end: Some(end),
                        radius,
                        strength,
                    });
                }
                Some(Keyword::Sturm) => sturm = true,
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }
        if components.is_empty() {
            return Err(self.error_here(ErrorKind::Parse, "blob needs at least one component"));
        }
        Ok(Shape::Blob {
            threshold,
            components,
            sturm,
        })
    }

    fn parse_bicubic_patch(&mut self) -> ParseResult<Shape> {
        let mut patch_type = 0;
        let mut flatness = 0.0;
        let mut u_steps = 3;
        let mut v_steps = 3;
        loop {
            if self.allow_keyword(Keyword::Type)? {
                patch_type = self.parse_u32("patch type")?;
                if patch_type > 1 {
                    return Err(self.error_here(ErrorKind::Domain, "bicubic_patch type must be 0 or 1"));
                }
            } else if self.allow_keyword(Keyword::Flatness)? {
                flatness = self.parse_float()?;
            } else if self.allow_keyword(Keyword::USteps)? {
                u_steps = self.parse_u32("u_steps")?;
            } else if self.allow_keyword(Keyword::VSteps)? {
                v_steps = self.parse_u32("v_steps")?;
            } else {
                break;
            }
        }
        let mut points = Vec::with_capacity(16);
        for i in 0..16 {
            if i > 0 {
                self.parse_comma()?;
            }
            points.push(self.parse_vector()?);
        }
        Ok(Shape::BicubicPatch {
            patch_type,
            flatness,
            u_steps,
            v_steps,
            points,
        })
    }

    // --- modifiers ---

    /// The shared modifier loop: transforms, appearance, and object flags.
    pub(crate) fn parse_object_modifiers(&mut self, node: &mut ObjectNode) -> ParseResult<()> {
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in object block"));
            };
            let Some(keyword) = token.keyword() else {
                self.unget(token);
                return Ok(());
            };
            match keyword {
                Keyword::Texture => {
                    let texture = self.parse_texture()?;
                    if let Some(last) = node.textures.last() {
                        if !last.is_layerable() || !texture.is_layerable() {
                            return Err(self.error_here(
                                ErrorKind::Parse,
                                "only plain textures can be layered",
                            ));
                        }
                    }
                    node.textures.push(texture);
                }
                Keyword::Pigment => {
                    let pigment = self.parse_pigment()?;
                    self.override_plain_texture(node, |kind| {
                        if let crate::nodes::TextureKind::Plain { pigment: slot, .. } = kind {
                            *slot = pigment.clone();
                        }
                    });
                }
                Keyword::Normal => {
                    let normal = self.parse_normal()?;
                    self.override_plain_texture(node, |kind| {
                        if let crate::nodes::TextureKind::Plain { normal: slot, .. } = kind {
                            *slot = Some(normal.clone());
                        }
                    });
                }
                Keyword::Finish => {
                    let finish = self.parse_finish()?;
                    self.override_plain_texture(node, |kind| {
                        if let crate::nodes::TextureKind::Plain { finish: slot, .. } = kind {
                            *slot = Some(finish.clone());
                        }
                    });
                }
                Keyword::Interior => node.interior = Some(self.parse_interior()?),
                Keyword::Material => {
                    let material = self.parse_material()?;
                    node.apply_material(&material);
                }
                Keyword::Inverse => node.inverse = !node.inverse,
                Keyword::Hollow => {
                    node.hollow = Some(if self.peek_starts_float()? {
                        self.parse_float()? != 0.0
                    } else {
                        true
                    });
                }
                Keyword::NoShadow => node.no_shadow = true,
                Keyword::NoImage => node.no_image = true,
                Keyword::NoReflection => node.no_reflection = true,
                other => {
                    if self.apply_transform_keyword(other, &mut node.transform)? {
                        continue;
                    }
                    self.unget(token);
                    return Ok(());
                }
            }
        }
    }

    /// Applies a bare pigment/normal/finish modifier to the object's top
    /// texture, creating a plain one when the stack is empty.
    fn override_plain_texture(
        &mut self,
        node: &mut ObjectNode,
        apply: impl FnOnce(&mut crate::nodes::TextureKind),
    ) {
        if node.textures.is_empty() {
            node.textures.push(
                self.scene
                    .defaults
                    .texture
                    .clone()
                    .unwrap_or_else(crate::nodes::Texture::plain_default),
            );
        }
        let top = node.textures.last_mut().expect("just ensured non-empty");
        apply(&mut top.kind);
    }
}
