#![doc = include_str!("../../../README.md")]
#![expect(dead_code, reason = "builder interfaces keep some renderer-facing APIs ahead of their consumers")]

mod diag;
mod io;
mod lex;
mod math;
mod nodes;
mod parser;
mod scenedata;
mod source;
mod symbol;
mod token;
mod value;

pub mod function;

pub use crate::{
    diag::{CollectMessages, Diagnostics, ErrorKind, FeatureFlag, MessageWriter, NoMessages, ParseError, ParseResult, Severity, StdMessages},
    function::{FunctionId, FunctionRegistry, VmContext, VmError, VmErrorKind},
    io::{Environment, FilePurpose, FsResolver, FsStreams, IncludeResolver, MemoryStreams, SceneEnv, StreamFactory},
    math::{Color, Matrix4, Transform, Vec2, Vec3, Vec4},
    nodes::{
        AreaLight, BlendEntry, BlendMap, BlobComponent, Camera, CameraKind, ContainedBy, CsgOp, Density, DensityBlend,
        DensityKind, Finish, Fog, FogKind, Interior, LightKind, LightSource, Material, Media, MeshTriangle, Normal,
        NormalBlend, ObjectNode, Pattern, PatternModifiers, Pigment, PigmentBlend, PigmentKind, PrismSweep, Rainbow,
        Reflection, Scattering, Shape, SkySphere, SplineKind, Texture, TextureKind, Turbulence, WaveShape,
    },
    parser::{Parser, ParserOptions, parse_scene},
    scenedata::{GlobalSettings, SceneData},
    source::{SourcePosition, StreamId},
    token::{Keyword, Token, TokenKind},
    value::{Value, ValueTag},
};
