//! Tokens and the reserved-word table.
//!
//! Reserved words are a single `strum`-derived enum; `Keyword::from_str` is
//! the lookup the scanner performs on every identifier-shaped lexeme.
//! Identifiers that resolve in the symbol table are promoted to
//! [`TokenKind::TypedIdentifier`] by the parser's cooked-token layer, which
//! is what makes lexing context-sensitive.

use std::{fmt, str::FromStr};

use strum::{Display, EnumString, IntoStaticStr};

use crate::{source::SourcePosition, value::ValueTag};

/// Reserved words of the scene language.
///
/// Directive names (`declare`, `if`, `while`, …) are only meaningful right
/// after `#`; see [`Keyword::is_directive`]. Everything else is recognized
/// anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Keyword {
    // --- directives (after `#`) ---
    Declare,
    Local,
    Undef,
    Include,
    Version,
    If,
    Ifdef,
    Ifndef,
    Else,
    End,
    While,
    For,
    Break,
    Switch,
    Case,
    Range,
    Default,
    Macro,
    Fopen,
    Fclose,
    Read,
    Write,
    Append,
    Debug,
    Warning,
    Error,

    // --- scene-level blocks ---
    Camera,
    LightSource,
    LightGroup,
    GlobalSettings,
    Background,
    Fog,
    Rainbow,
    SkySphere,
    Media,

    // --- objects ---
    Sphere,
    Box,
    Cone,
    Cylinder,
    Torus,
    Plane,
    Polygon,
    Prism,
    Lathe,
    Mesh,
    Mesh2,
    Isosurface,
    Parametric,
    Blob,
    HeightField,
    Text,
    Disc,
    BicubicPatch,
    Superellipsoid,
    JuliaFractal,
    Sor,
    SphereSweep,
    Poly,
    Quadric,
    Ovus,
    Lemon,
    Triangle,
    SmoothTriangle,
    Object,

    // --- CSG ---
    Union,
    Intersection,
    Difference,
    Merge,

    // --- appearance ---
    Texture,
    Pigment,
    Normal,
    Finish,
    Interior,
    Material,
    Tiles,
    Tile2,
    MaterialMap,
    ColorMap,
    #[strum(serialize = "colour_map")]
    ColourMap,
    PigmentMap,
    NormalMap,
    TextureMap,
    SlopeMap,
    DensityMap,
    Density,

    // --- patterns ---
    Checker,
    Brick,
    Hexagon,
    Gradient,
    Bozo,
    Granite,
    Marble,
    Wood,
    Agate,
    Spotted,
    Leopard,
    Onion,
    Crackle,
    Spiral1,
    Spiral2,
    Radial,
    Ripples,
    Waves,
    Wrinkles,
    Bumps,
    Dents,
    Cells,
    Planar,
    Spherical,
    Boxed,
    Cylindrical,

    // --- pattern modifiers ---
    Frequency,
    Phase,
    Turbulence,
    Octaves,
    Omega,
    Lambda,
    TurbDepth,
    RampWave,
    TriangleWave,
    SineWave,
    ScallopWave,
    CubicWave,
    PolyWave,

    // --- finish items ---
    Ambient,
    Diffuse,
    Brilliance,
    Phong,
    PhongSize,
    Specular,
    Roughness,
    Metallic,
    Reflection,
    Crand,
    ConserveEnergy,

    // --- interior items ---
    Ior,
    Caustics,
    Dispersion,
    FadeDistance,
    FadePower,
    FadeColor,

    // --- light items ---
    Spotlight,
    Parallel,
    PointAt,
    Radius,
    Falloff,
    Tightness,
    AreaLight,
    Adaptive,
    Jitter,
    Circular,
    Orient,
    Shadowless,
    MediaAttenuation,
    MediaInteraction,

    // --- media items ---
    Scattering,
    Absorption,
    Emission,
    Intervals,
    Samples,
    Method,

    // --- fog / rainbow / sky_sphere items ---
    Distance,
    FogType,
    FogOffset,
    FogAlt,
    Up,
    Width,
    ArcAngle,
    FalloffAngle,

    // --- camera items ---
    Perspective,
    Orthographic,
    Location,
    Direction,
    Right,
    Sky,
    LookAt,
    Angle,

    // --- object geometry items ---
    VertexVectors,
    NormalVectors,
    FaceIndices,
    NormalIndices,
    Type,
    Flatness,
    USteps,
    VSteps,
    MaxIteration,
    Precision,
    Tolerance,
    GlobalLights,
    Threshold,
    Strength,
    Ttf,
    LinearSweep,
    ConicSweep,

    // --- object modifiers ---
    Translate,
    Rotate,
    Scale,
    Matrix,
    Transform,
    Inverse,
    Hollow,
    NoShadow,
    NoImage,
    NoReflection,
    Open,
    Smooth,
    Sturm,
    Accuracy,
    MaxGradient,
    ContainedBy,
    AllIntersections,
    Precompute,
    WaterLevel,

    // --- global settings items ---
    MaxTraceLevel,
    AdcBailout,
    AmbientLight,
    AssumedGamma,
    NumberOfWaves,
    NoiseGenerator,
    Charset,
    Ascii,
    Utf8,
    Sys,

    // --- colors and members ---
    #[strum(serialize = "color", serialize = "colour")]
    Color,
    Rgb,
    Rgbf,
    Rgbt,
    Rgbft,
    Red,
    Green,
    Blue,
    Filter,
    Transmit,
    #[strum(serialize = "gray", serialize = "grey")]
    Gray,
    X,
    Y,
    Z,
    T,
    U,
    V,

    // --- value constructors ---
    Function,
    Spline,
    Array,
    Dictionary,
    LinearSpline,
    QuadraticSpline,
    CubicSpline,
    NaturalSpline,
    BezierSpline,
    BSpline,

    // --- constants and flags ---
    Pi,
    Tau,
    True,
    False,
    Yes,
    No,
    On,
    Off,
    Clock,
    ClockDelta,
    Optional,
    Once,

    // --- intrinsic functions ---
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Sinh,
    Cosh,
    Tanh,
    Asinh,
    Acosh,
    Atanh,
    Pow,
    Log,
    Ln,
    Exp,
    Sqrt,
    Sqr,
    Abs,
    Floor,
    Ceil,
    Int,
    Mod,
    Div,
    Select,
    Min,
    Max,
    Radians,
    Degrees,
    Sum,
    Prod,
    Vlength,
    Vnormalize,
    Vdot,
    Vcross,
    Vrotate,
    VaxisRotate,
    Vturbulence,
    Str,
    Concat,
    Strlen,
    Substr,
    Strupr,
    Strlwr,
    Chr,
    Asc,
    Val,
    Datetime,
    Rand,
    Seed,
    Defined,
    Dimensions,
    DimensionSize,
}

impl Keyword {
    /// Looks up an identifier lexeme in the reserved-word table.
    #[must_use]
    pub fn lookup(text: &str) -> Option<Self> {
        Self::from_str(text).ok()
    }

    /// True for words that are only keywords directly after `#`.
    #[must_use]
    pub fn is_directive(self) -> bool {
        matches!(
            self,
            Self::Declare
                | Self::Local
                | Self::Undef
                | Self::Include
                | Self::Version
                | Self::If
                | Self::Ifdef
                | Self::Ifndef
                | Self::Else
                | Self::End
                | Self::While
                | Self::For
                | Self::Break
                | Self::Switch
                | Self::Case
                | Self::Range
                | Self::Default
                | Self::Macro
                | Self::Fopen
                | Self::Fclose
                | Self::Read
                | Self::Write
                | Self::Debug
                | Self::Warning
                | Self::Error
        )
    }

    /// True for words that start an object block (primitive or CSG).
    #[must_use]
    pub fn is_object(self) -> bool {
        matches!(
            self,
            Self::Sphere
                | Self::Box
                | Self::Cone
                | Self::Cylinder
                | Self::Torus
                | Self::Plane
                | Self::Polygon
                | Self::Prism
                | Self::Lathe
                | Self::Mesh
                | Self::Mesh2
                | Self::Isosurface
                | Self::Parametric
                | Self::Blob
                | Self::HeightField
                | Self::Text
                | Self::Disc
                | Self::BicubicPatch
                | Self::Superellipsoid
                | Self::JuliaFractal
                | Self::Sor
                | Self::SphereSweep
                | Self::Poly
                | Self::Quadric
                | Self::Ovus
                | Self::Lemon
                | Self::Triangle
                | Self::SmoothTriangle
                | Self::Object
                | Self::Union
                | Self::Intersection
                | Self::Difference
                | Self::Merge
                | Self::LightGroup
        )
    }
}

/// Token kinds, with literal payloads inline.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Numeric literal.
    Float(f64),
    /// String literal, escapes already decoded.
    StringLit(String),
    /// Identifier that did not resolve to a reserved word.
    Identifier(String),
    /// Identifier promoted to the type of its symbol-table entry.
    TypedIdentifier(ValueTag, String),
    /// Reserved word.
    Keyword(Keyword),
    Hash,
    LeftBrace,
    RightBrace,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    /// `<` — vector open or relational, disambiguated by the expression layer.
    LeftAngle,
    RightAngle,
    Plus,
    Minus,
    Star,
    Slash,
    Bang,
    /// `^` — exponentiation.
    Caret,
    /// `=` — assignment in directives, equality in expressions.
    Equals,
    NotEquals,
    LessEq,
    GreaterEq,
    Amp,
    Pipe,
    Comma,
    Period,
    Semicolon,
}

impl TokenKind {
    /// Short human-readable description for error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Float(n) => format!("number {n}"),
            Self::StringLit(_) => "string literal".to_owned(),
            Self::Identifier(name) => format!("undeclared identifier '{name}'"),
            Self::TypedIdentifier(tag, name) => format!("{tag} identifier '{name}'"),
            Self::Keyword(kw) => {
                let name: &'static str = (*kw).into();
                format!("keyword '{name}'")
            }
            Self::Hash => "'#'".to_owned(),
            Self::LeftBrace => "'{'".to_owned(),
            Self::RightBrace => "'}'".to_owned(),
            Self::LeftParen => "'('".to_owned(),
            Self::RightParen => "')'".to_owned(),
            Self::LeftBracket => "'['".to_owned(),
            Self::RightBracket => "']'".to_owned(),
            Self::LeftAngle => "'<'".to_owned(),
            Self::RightAngle => "'>'".to_owned(),
            Self::Plus => "'+'".to_owned(),
            Self::Minus => "'-'".to_owned(),
            Self::Star => "'*'".to_owned(),
            Self::Slash => "'/'".to_owned(),
            Self::Bang => "'!'".to_owned(),
            Self::Caret => "'^'".to_owned(),
            Self::Equals => "'='".to_owned(),
            Self::NotEquals => "'!='".to_owned(),
            Self::LessEq => "'<='".to_owned(),
            Self::GreaterEq => "'>='".to_owned(),
            Self::Amp => "'&'".to_owned(),
            Self::Pipe => "'|'".to_owned(),
            Self::Comma => "','".to_owned(),
            Self::Period => "'.'".to_owned(),
            Self::Semicolon => "';'".to_owned(),
        }
    }
}

/// One token with its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: SourcePosition,
}

impl Token {
    #[must_use]
    pub fn new(kind: TokenKind, position: SourcePosition) -> Self {
        Self { kind, position }
    }

    /// Returns the keyword if this token is one.
    #[must_use]
    pub fn keyword(&self) -> Option<Keyword> {
        match self.kind {
            TokenKind::Keyword(kw) => Some(kw),
            _ => None,
        }
    }

    /// Identifier text for raw and promoted identifiers.
    #[must_use]
    pub fn ident_text(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Identifier(name) | TokenKind::TypedIdentifier(_, name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.describe())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_keyword_lookup() {
        assert_eq!(Keyword::lookup("sphere"), Some(Keyword::Sphere));
        assert_eq!(Keyword::lookup("light_source"), Some(Keyword::LightSource));
        assert_eq!(Keyword::lookup("vaxis_rotate"), Some(Keyword::VaxisRotate));
        assert_eq!(Keyword::lookup("my_thing"), None);
    }

    #[test]
    fn test_keyword_aliases() {
        assert_eq!(Keyword::lookup("color"), Some(Keyword::Color));
        assert_eq!(Keyword::lookup("colour"), Some(Keyword::Color));
        assert_eq!(Keyword::lookup("gray"), Some(Keyword::Gray));
        assert_eq!(Keyword::lookup("grey"), Some(Keyword::Gray));
    }

    #[test]
    fn test_directive_classification() {
        assert!(Keyword::Declare.is_directive());
        assert!(Keyword::Macro.is_directive());
        assert!(!Keyword::Sphere.is_directive());
        // `default` doubles as `#default` and the scene-level block
        assert!(Keyword::Default.is_directive());
    }

    #[test]
    fn test_case_sensitivity() {
        // the language is case-sensitive: `Sphere` is an identifier
        assert_eq!(Keyword::lookup("Sphere"), None);
    }
}
