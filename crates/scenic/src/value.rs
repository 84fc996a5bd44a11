//! The tagged value universe carried by the symbol table.
//!
//! Every value the language can bind to a name is one variant of [`Value`].
//! Copying is structural: deep for arrays and dictionaries, `Clone` for
//! scene nodes, so the render-time graph stays a tree. The only
//! reference-like variant is [`Value::ParamRef`], a generation-checked
//! handle into the symbol table used for macro pass-by-reference.

use indexmap::IndexMap;
use smallvec::SmallVec;
use strum::{Display, IntoStaticStr};

use crate::{
    function::FunctionId,
    math::{Color, Transform, Vec2, Vec3, Vec4},
    nodes::{
        BlendMap, Camera, Density, Finish, Fog, Interior, LightSource, Material, Media, Normal, ObjectNode, Pigment,
        Rainbow, SkySphere, SplineKind, Texture,
    },
    source::SourcePosition,
    symbol::SymbolHandle,
};

/// Discriminant of a [`Value`], used for type errors, token promotion, and
/// redefinition checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum ValueTag {
    Undefined,
    Scalar,
    Vector2,
    Vector3,
    Vector4,
    Color,
    String,
    Transform,
    Pigment,
    Normal,
    Finish,
    Texture,
    Interior,
    Material,
    Object,
    Camera,
    LightSource,
    Fog,
    Rainbow,
    SkySphere,
    Media,
    Density,
    Function,
    Spline,
    Array,
    Dictionary,
    ColorMap,
    PigmentMap,
    NormalMap,
    TextureMap,
    SlopeMap,
    DensityMap,
    Macro,
    FileHandle,
    ParamRef,
    RandomStream,
}

/// Handle to an open `#fopen` stream in the parse session's file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(pub(crate) u32);

/// One macro parameter; `optional` parameters may be omitted at invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroParam {
    pub name: String,
    pub optional: bool,
}

/// A macro definition: where its body lives, not what it expands to.
///
/// Invocation seeks the lexer back to `body_start`; `checksum` is an
/// FNV-1a hash of the body text captured at definition time and verified on
/// every invocation, so a stale stream cannot be silently re-read.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroDef {
    pub name: String,
    pub parameters: Vec<MacroParam>,
    pub body_start: SourcePosition,
    pub body_end: SourcePosition,
    pub checksum: u64,
}

impl MacroDef {
    /// Number of leading parameters that must be supplied.
    #[must_use]
    pub fn required_count(&self) -> usize {
        self.parameters.iter().filter(|p| !p.optional).count()
    }
}

/// A spline value: sorted control points mapping a scalar to a vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Spline {
    pub kind: SplineKind,
    pub entries: Vec<(f64, SmallVec<[f64; 5]>)>,
}

impl Spline {
    /// Evaluates the spline at `t`. Entries are sorted by key; evaluation
    /// clamps outside the key range.
    #[must_use]
    pub fn evaluate(&self, t: f64) -> SmallVec<[f64; 5]> {
        let n = self.entries.len();
        if n == 0 {
            return SmallVec::new();
        }
        if n == 1 || t <= self.entries[0].0 {
            return self.entries[0].1.clone();
        }
        if t >= self.entries[n - 1].0 {
            return self.entries[n - 1].1.clone();
        }
        let i = self.entries.partition_point(|(k, _)| *k <= t) - 1;
        let (k0, ref v0) = self.entries[i];
        let (k1, ref v1) = self.entries[i + 1];
        let span = k1 - k0;
        let f = if span == 0.0 { 0.0 } else { (t - k0) / span };
        let dims = v0.len().min(v1.len());
        let mut out = SmallVec::with_capacity(dims);
        match self.kind {
            SplineKind::Linear | SplineKind::Bezier | SplineKind::BSpline => {
                for d in 0..dims {
                    out.push(v0[d] + (v1[d] - v0[d]) * f);
                }
            }
            SplineKind::Quadratic | SplineKind::Cubic | SplineKind::Natural => {
                // Catmull-Rom through the two neighbors on each side,
                // clamping at the ends.
                let prev = &self.entries[i.saturating_sub(1)].1;
                let next = &self.entries[(i + 2).min(n - 1)].1;
                for d in 0..dims {
                    let p0 = prev.get(d).copied().unwrap_or(v0[d]);
                    let p1 = v0[d];
                    let p2 = v1[d];
                    let p3 = next.get(d).copied().unwrap_or(v1[d]);
                    let f2 = f * f;
                    let f3 = f2 * f;
                    out.push(
                        0.5 * ((2.0 * p1)
                            + (p2 - p0) * f
                            + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * f2
                            + (3.0 * p1 - 3.0 * p2 + p3 - p0) * f3),
                    );
                }
            }
        }
        out
    }
}

/// A 1- to 5-dimensional array. Elements materialize lazily on first
/// assignment; reading an unassigned element is a symbol error unless the
/// read is in an optional context.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    /// Extent per dimension; only dimension 0 may grow.
    pub dims: SmallVec<[usize; 5]>,
    pub elements: Vec<Option<Value>>,
    /// `array mixed` relaxes the homogeneous-element rule.
    pub mixed: bool,
}

impl ArrayValue {
    #[must_use]
    pub fn new(dims: SmallVec<[usize; 5]>, mixed: bool) -> Self {
        let total = dims.iter().product();
        Self {
            dims,
            elements: vec![None; total],
            mixed,
        }
    }

    /// Flat index from per-dimension indices; `None` when out of range or
    /// the wrong number of indices is supplied.
    #[must_use]
    pub fn flat_index(&self, indices: &[usize]) -> Option<usize> {
        if indices.len() != self.dims.len() {
            return None;
        }
        let mut flat = 0usize;
        for (&idx, &dim) in indices.iter().zip(self.dims.iter()) {
            if idx >= dim {
                return None;
            }
            flat = flat * dim + idx;
        }
        Some(flat)
    }

    /// Tag of the first assigned element, the array's element type.
    #[must_use]
    pub fn element_tag(&self) -> Option<ValueTag> {
        self.elements.iter().flatten().next().map(Value::tag)
    }

    /// Grows dimension 0 to at least `len`.
    pub fn grow_first_dim(&mut self, len: usize) {
        if self.dims.is_empty() || len <= self.dims[0] {
            return;
        }
        let stride: usize = self.dims[1..].iter().product();
        self.dims[0] = len;
        self.elements.resize(len * stride.max(1), None);
    }
}

/// A dictionary: an insertion-ordered map addressable with `.key` and
/// `["key"]` notation. Lookup of plain names never descends into these.
pub type Dictionary = IndexMap<String, Value>;

/// The tagged sum of everything a symbol can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Distinguished "not defined" value produced in optional contexts.
    Undefined,
    Scalar(f64),
    Vector2(Vec2),
    Vector3(Vec3),
    Vector4(Vec4),
    Color(Color),
    String(String),
    Transform(Box<Transform>),
    Pigment(Box<Pigment>),
    Normal(Box<Normal>),
    Finish(Box<Finish>),
    Texture(Box<Texture>),
    Interior(Box<Interior>),
    Material(Box<Material>),
    Object(Box<ObjectNode>),
    Camera(Box<Camera>),
    LightSource(Box<LightSource>),
    Fog(Box<Fog>),
    Rainbow(Box<Rainbow>),
    SkySphere(Box<SkySphere>),
    Media(Box<Media>),
    Density(Box<Density>),
    Function(FunctionId),
    Spline(Box<Spline>),
    Array(Box<ArrayValue>),
    Dictionary(Box<Dictionary>),
    ColorMap(Box<BlendMap<Color>>),
    PigmentMap(Box<BlendMap<Pigment>>),
    NormalMap(Box<BlendMap<Normal>>),
    TextureMap(Box<BlendMap<Texture>>),
    SlopeMap(Box<BlendMap<[f64; 2]>>),
    DensityMap(Box<BlendMap<Density>>),
    Macro(Box<MacroDef>),
    FileHandle(FileId),
    /// Pass-by-reference handle into the symbol table.
    ParamRef(SymbolHandle),
    /// Seeded pseudo-random stream for `seed()`/`rand()`.
    RandomStream(u32),
}

impl Value {
    #[must_use]
    pub fn tag(&self) -> ValueTag {
        match self {
            Self::Undefined => ValueTag::Undefined,
            Self::Scalar(_) => ValueTag::Scalar,
            Self::Vector2(_) => ValueTag::Vector2,
            Self::Vector3(_) => ValueTag::Vector3,
            Self::Vector4(_) => ValueTag::Vector4,
            Self::Color(_) => ValueTag::Color,
            Self::String(_) => ValueTag::String,
            Self::Transform(_) => ValueTag::Transform,
            Self::Pigment(_) => ValueTag::Pigment,
            Self::Normal(_) => ValueTag::Normal,
            Self::Finish(_) => ValueTag::Finish,
            Self::Texture(_) => ValueTag::Texture,
            Self::Interior(_) => ValueTag::Interior,
            Self::Material(_) => ValueTag::Material,
            Self::Object(_) => ValueTag::Object,
            Self::Camera(_) => ValueTag::Camera,
            Self::LightSource(_) => ValueTag::LightSource,
            Self::Fog(_) => ValueTag::Fog,
            Self::Rainbow(_) => ValueTag::Rainbow,
            Self::SkySphere(_) => ValueTag::SkySphere,
            Self::Media(_) => ValueTag::Media,
            Self::Density(_) => ValueTag::Density,
            Self::Function(_) => ValueTag::Function,
            Self::Spline(_) => ValueTag::Spline,
            Self::Array(_) => ValueTag::Array,
            Self::Dictionary(_) => ValueTag::Dictionary,
            Self::ColorMap(_) => ValueTag::ColorMap,
            Self::PigmentMap(_) => ValueTag::PigmentMap,
            Self::NormalMap(_) => ValueTag::NormalMap,
            Self::TextureMap(_) => ValueTag::TextureMap,
            Self::SlopeMap(_) => ValueTag::SlopeMap,
            Self::DensityMap(_) => ValueTag::DensityMap,
            Self::Macro(_) => ValueTag::Macro,
            Self::FileHandle(_) => ValueTag::FileHandle,
            Self::ParamRef(_) => ValueTag::ParamRef,
            Self::RandomStream(_) => ValueTag::RandomStream,
        }
    }

    /// Structural copy; this is what reading an identifier produces.
    #[must_use]
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// `defined()` on this value.
    #[must_use]
    pub fn is_defined(&self) -> bool {
        !matches!(self, Self::Undefined)
    }

    /// The scalar payload, when this is one.
    #[must_use]
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    /// Promotes scalars/vectors to a 3-vector by the language's promotion
    /// rule (scalar broadcasts; shorter vectors zero-extend).
    #[must_use]
    pub fn as_vec3(&self) -> Option<Vec3> {
        match self {
            Self::Scalar(s) => Some([*s; 3]),
            Self::Vector2(v) => Some([v[0], v[1], 0.0]),
            Self::Vector3(v) => Some(*v),
            _ => None,
        }
    }

    /// Promotes to a color: scalars broadcast over the chromatic channels.
    #[must_use]
    pub fn as_color(&self) -> Option<Color> {
        match self {
            Self::Scalar(s) => Some(Color::rgb(*s, *s, *s)),
            Self::Color(c) => Some(*c),
            Self::Vector3(v) => Some(Color::rgb(v[0], v[1], v[2])),
            Self::Vector4(v) => Some(Color {
                red: v[0],
                green: v[1],
                blue: v[2],
                filter: v[3],
                transmit: 0.0,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use smallvec::smallvec;

    use super::*;

    #[test]
    fn test_copy_is_deep_for_arrays() {
        let mut original = ArrayValue::new(smallvec![2], false);
        original.elements[0] = Some(Value::Scalar(1.0));
        let a = Value::Array(Box::new(original));
        let b = a.copy();
        let Value::Array(mut inner) = a else { unreachable!() };
        inner.elements[0] = Some(Value::Scalar(99.0));
        let Value::Array(copied) = b else { unreachable!() };
        assert_eq!(copied.elements[0], Some(Value::Scalar(1.0)));
    }

    #[test]
    fn test_flat_index() {
        let array = ArrayValue::new(smallvec![2, 3], false);
        assert_eq!(array.flat_index(&[0, 0]), Some(0));
        assert_eq!(array.flat_index(&[1, 2]), Some(5));
        assert_eq!(array.flat_index(&[2, 0]), None);
        assert_eq!(array.flat_index(&[1]), None);
    }

    #[test]
    fn test_grow_first_dim() {
        let mut array = ArrayValue::new(smallvec![2, 3], false);
        array.grow_first_dim(4);
        assert_eq!(array.dims.as_slice(), &[4, 3]);
        assert_eq!(array.elements.len(), 12);
        // shrinking is a no-op
        array.grow_first_dim(1);
        assert_eq!(array.dims.as_slice(), &[4, 3]);
    }

    #[test]
    fn test_spline_linear() {
        let spline = Spline {
            kind: SplineKind::Linear,
            entries: vec![(0.0, smallvec![0.0, 0.0, 0.0]), (1.0, smallvec![2.0, 4.0, 6.0])],
        };
        assert_eq!(spline.evaluate(0.5).as_slice(), &[1.0, 2.0, 3.0]);
        // clamped outside the range
        assert_eq!(spline.evaluate(-1.0).as_slice(), &[0.0, 0.0, 0.0]);
        assert_eq!(spline.evaluate(2.0).as_slice(), &[2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_spline_cubic_passes_through_knots() {
        let spline = Spline {
            kind: SplineKind::Cubic,
            entries: vec![
                (0.0, smallvec![0.0]),
                (1.0, smallvec![1.0]),
                (2.0, smallvec![4.0]),
                (3.0, smallvec![9.0]),
            ],
        };
        assert!((spline.evaluate(1.0)[0] - 1.0).abs() < 1e-12);
        assert!((spline.evaluate(2.0)[0] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_promotions() {
        assert_eq!(Value::Scalar(2.0).as_vec3(), Some([2.0, 2.0, 2.0]));
        assert_eq!(Value::Vector2([1.0, 2.0]).as_vec3(), Some([1.0, 2.0, 0.0]));
        let c = Value::Scalar(0.5).as_color().unwrap();
        assert_eq!(c.red, 0.5);
        assert_eq!(c.filter, 0.0);
        assert!(Value::String("x".into()).as_vec3().is_none());
    }

    #[test]
    fn test_macro_required_count() {
        let def = MacroDef {
            name: "m".into(),
            parameters: vec![
                MacroParam {
                    name: "a".into(),
                    optional: false,
                },
                MacroParam {
                    name: "b".into(),
                    optional: true,
                },
            ],
            body_start: SourcePosition::start_of(crate::source::StreamId::new(0)),
            body_end: SourcePosition::start_of(crate::source::StreamId::new(0)),
            checksum: 0,
        };
        assert_eq!(def.required_count(), 1);
    }
}
