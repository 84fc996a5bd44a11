//! Appearance nodes: patterns, pigments, normals, finishes, textures,
//! interiors, materials, and media.

use crate::{
    function::FunctionId,
    math::{Color, Transform, Vec3},
};

/// A scalar field over 3-space used as the domain of a blend map.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Checker,
    Brick { mortar: f64, size: Vec3 },
    Hexagon,
    Gradient(Vec3),
    Bozo,
    Granite,
    Marble,
    Wood,
    Agate { turbulence: f64 },
    Spotted,
    Leopard,
    Onion,
    Crackle,
    Spiral1 { arms: f64 },
    Spiral2 { arms: f64 },
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
    /// A compiled user function evaluated as the pattern value.
    Function(FunctionId),
}

/// Wave shape applied to a pattern value before map lookup.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum WaveShape {
    #[default]
    Ramp,
    Triangle,
    Sine,
    Scallop,
    Cubic,
    Poly(f64),
}

/// Turbulence warp attached to a pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct Turbulence {
    pub amount: Vec3,
    pub octaves: u32,
    pub omega: f64,
    pub lambda: f64,
}

impl Default for Turbulence {
    fn default() -> Self {
        Self {
            amount: [0.0; 3],
            octaves: 6,
            omega: 0.5,
            lambda: 2.0,
        }
    }
}

/// Modifiers shared by every pattern-bearing node.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternModifiers {
    pub frequency: f64,
    pub phase: f64,
    pub wave: WaveShape,
    pub turbulence: Option<Turbulence>,
}

impl Default for PatternModifiers {
    fn default() -> Self {
        Self {
            frequency: 1.0,
            phase: 0.0,
            wave: WaveShape::Ramp,
            turbulence: None,
        }
    }
}

/// One `(key, value)` entry of a blend map.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendEntry<V> {
    pub key: f64,
    pub value: V,
}

/// Sorted sequence of `(key, value)` pairs interpolating a pattern-domain
/// value to a visual attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendMap<V> {
    entries: Vec<BlendEntry<V>>,
}

impl<V> Default for BlendMap<V> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<V> BlendMap<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from an inline value list, keys interpolated over 0..1.
    #[must_use]
    pub fn from_list(values: Vec<V>) -> Self {
        let n = values.len();
        let entries = values
            .into_iter()
            .enumerate()
            .map(|(i, value)| BlendEntry {
                key: if n <= 1 { 0.0 } else { i as f64 / (n - 1) as f64 },
                value,
            })
            .collect();
        Self { entries }
    }

    /// Inserts an entry, keeping the map sorted by key. Entries with equal
    /// keys keep their insertion order (step transitions in color maps).
    pub fn insert(&mut self, key: f64, value: V) {
        let at = self.entries.partition_point(|e| e.key <= key);
        self.entries.insert(at, BlendEntry { key, value });
    }

    #[must_use]
    pub fn entries(&self) -> &[BlendEntry<V>] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The body of a pigment: a flat color or a pattern with its blend map.
#[derive(Debug, Clone, PartialEq)]
pub enum PigmentKind {
    Color(Color),
    Pattern { pattern: Pattern, blend: PigmentBlend },
}

/// What a patterned pigment blends between.
#[derive(Debug, Clone, PartialEq)]
pub enum PigmentBlend {
    Colors(BlendMap<Color>),
    Pigments(BlendMap<Pigment>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pigment {
    pub kind: PigmentKind,
    pub modifiers: PatternModifiers,
    pub transform: Transform,
}

impl Default for Pigment {
    fn default() -> Self {
        Self {
            kind: PigmentKind::Color(Color::BLACK),
            modifiers: PatternModifiers::default(),
            transform: Transform::IDENTITY,
        }
    }
}

/// What a normal perturbation blends between.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalBlend {
    Normals(BlendMap<Normal>),
    /// `slope_map`: (height, slope) control points.
    Slope(BlendMap<[f64; 2]>),
}

/// Surface normal perturbation.
#[derive(Debug, Clone, PartialEq)]
pub struct Normal {
    pub pattern: Option<Pattern>,
    /// Perturbation depth (`bump_size` in the scene file; the trailing float
    /// after the pattern keyword).
    pub amount: f64,
    pub blend: Option<NormalBlend>,
    pub modifiers: PatternModifiers,
    pub transform: Transform,
}

impl Default for Normal {
    fn default() -> Self {
        Self {
            pattern: None,
            amount: 0.5,
            blend: None,
            modifiers: PatternModifiers::default(),
            transform: Transform::IDENTITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reflection {
    pub min: Color,
    pub max: Color,
    pub falloff: f64,
    pub metallic: f64,
}

/// Surface finish. Defaults are the canonical 3.7 set; in particular
/// `ambient` defaults to zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Finish {
    pub ambient: Color,
    pub diffuse: f64,
    pub brilliance: f64,
    pub phong: f64,
    pub phong_size: f64,
    pub specular: f64,
    pub roughness: f64,
    pub metallic: f64,
    pub reflection: Option<Reflection>,
    pub crand: f64,
    pub conserve_energy: bool,
}

impl Default for Finish {
    fn default() -> Self {
        Self {
            ambient: Color::BLACK,
            diffuse: 0.6,
            brilliance: 1.0,
            phong: 0.0,
            phong_size: 40.0,
            specular: 0.0,
            roughness: 0.05,
            metallic: 0.0,
            reflection: None,
            crand: 0.0,
            conserve_energy: false,
        }
    }
}

/// The texture body. Only `Plain` may participate in layering.
#[derive(Debug, Clone, PartialEq)]
pub enum TextureKind {
    Plain {
        pigment: Pigment,
        normal: Option<Normal>,
        finish: Option<Finish>,
    },
    Tiles {
        even: Box<Texture>,
        odd: Box<Texture>,
    },
    MaterialMap {
        source: String,
        textures: Vec<Texture>,
    },
    Patterned {
        pattern: Pattern,
        blend: BlendMap<Texture>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Texture {
    pub kind: TextureKind,
    pub modifiers: PatternModifiers,
    pub transform: Transform,
}

impl Texture {
    /// The default texture a `texture { }` block starts from: plain black
    /// pigment with the default finish.
    #[must_use]
    pub fn plain_default() -> Self {
        Self {
            kind: TextureKind::Plain {
                pigment: Pigment::default(),
                normal: None,
                finish: None,
            },
            modifiers: PatternModifiers::default(),
            transform: Transform::IDENTITY,
        }
    }

    /// True when this texture may be stacked as a layer.
    #[must_use]
    pub fn is_layerable(&self) -> bool {
        matches!(self.kind, TextureKind::Plain { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scattering {
    pub kind: u32,
    pub color: Color,
    pub eccentricity: f64,
    pub extinction: f64,
}

/// Participating media attached to an interior or the atmosphere.
#[derive(Debug, Clone, PartialEq)]
pub struct Media {
    pub method: u32,
    pub intervals: u32,
    pub samples_min: u32,
    pub samples_max: u32,
    pub absorption: Color,
    pub emission: Color,
    pub scattering: Option<Scattering>,
    pub density: Vec<Density>,
}

impl Default for Media {
    fn default() -> Self {
        Self {
            method: 3,
            intervals: 1,
            samples_min: 1,
            samples_max: 1,
            absorption: Color::BLACK,
            emission: Color::BLACK,
            scattering: None,
            density: Vec::new(),
        }
    }
}

/// A media density field; structurally a pigment over 3-space.
#[derive(Debug, Clone, PartialEq)]
pub enum DensityKind {
    Color(Color),
    Pattern { pattern: Pattern, blend: DensityBlend },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DensityBlend {
    Colors(BlendMap<Color>),
    Densities(BlendMap<Density>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Density {
    pub kind: DensityKind,
    pub modifiers: PatternModifiers,
    pub transform: Transform,
}

impl Default for Density {
    fn default() -> Self {
        Self {
            kind: DensityKind::Color(Color::WHITE),
            modifiers: PatternModifiers::default(),
            transform: Transform::IDENTITY,
        }
    }
}

/// Object interior: refraction and contained media.
#[derive(Debug, Clone, PartialEq)]
pub struct Interior {
    pub ior: f64,
    pub caustics: f64,
    pub dispersion: f64,
    pub fade_distance: f64,
    pub fade_power: f64,
    pub fade_color: Color,
    pub media: Vec<Media>,
}

impl Default for Interior {
    fn default() -> Self {
        Self {
            ior: 1.0,
            caustics: 0.0,
            dispersion: 1.0,
            fade_distance: 0.0,
            fade_power: 0.0,
            fade_color: Color::BLACK,
            media: Vec::new(),
        }
    }
}

/// Bundle of texture and interior applied through `material { … }`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Material {
    pub texture: Option<Texture>,
    pub interior: Option<Interior>,
    pub transform: Transform,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_blend_map_stays_sorted() {
        let mut map = BlendMap::new();
        map.insert(0.8, 'c');
        map.insert(0.2, 'a');
        map.insert(0.5, 'b');
        let keys: Vec<f64> = map.entries().iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![0.2, 0.5, 0.8]);
    }

    #[test]
    fn test_blend_map_equal_keys_keep_order() {
        let mut map = BlendMap::new();
        map.insert(0.5, 'a');
        map.insert(0.5, 'b');
        let values: Vec<char> = map.entries().iter().map(|e| e.value).collect();
        assert_eq!(values, vec!['a', 'b']);
    }

    #[test]
    fn test_inline_list_keys() {
        let map = BlendMap::from_list(vec!['a', 'b', 'c']);
        let keys: Vec<f64> = map.entries().iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_only_plain_layerable() {
        let plain = Texture::plain_default();
        assert!(plain.is_layerable());
        let patterned = Texture {
            kind: TextureKind::Patterned {
                pattern: Pattern::Checker,
                blend: BlendMap::new(),
            },
            ..Texture::plain_default()
        };
        assert!(!patterned.is_layerable());
    }
}
