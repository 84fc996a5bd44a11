//! Scene-graph node types produced by the builder front-end.
//!
//! The compiler's job ends at these structs: they are plain data, owned by
//! [`crate::scenedata::SceneData`] once their enclosing block closes. A
//! renderer consumes them read-only after the parse finishes. All of them
//! are `Clone` because `#declare` copies structurally, keeping the
//! render-time graph a tree.

pub use appearance::{
    BlendEntry, BlendMap, Density, DensityBlend, DensityKind, Finish, Interior, Material, Media, Normal, NormalBlend, Pattern,
    PatternModifiers, Pigment, PigmentBlend, PigmentKind, Reflection, Scattering, Texture, TextureKind, Turbulence,
    WaveShape,
};
pub use atmosphere::{Fog, FogKind, Rainbow, SkySphere};
pub use geometry::{
    BlobComponent, ContainedBy, CsgOp, MeshTriangle, ObjectNode, PrismSweep, Shape, SplineKind,
};
pub use lighting::{AreaLight, Camera, CameraKind, LightKind, LightSource};

mod appearance;
mod atmosphere;
mod geometry;
mod lighting;
