//! The scene container the builder front-end writes into.
//!
//! The parser reaches `SceneData` only through the narrow insertion points
//! below; everything else about the scene graph is opaque to it. After
//! `parse` returns, the container is handed to the renderer read-only.

use crate::{
    function::FunctionRegistry,
    math::Color,
    nodes::{Camera, Finish, Fog, LightSource, Media, ObjectNode, Pigment, Rainbow, SkySphere, Texture},
};

/// Global settings with the canonical 3.7 defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSettings {
    pub ambient_light: Color,
    pub assumed_gamma: Option<f64>,
    pub max_trace_level: u32,
    pub adc_bailout: f64,
    pub number_of_waves: u32,
    pub noise_generator: u32,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            ambient_light: Color::WHITE,
            assumed_gamma: None,
            max_trace_level: 5,
            adc_bailout: 1.0 / 255.0,
            number_of_waves: 10,
            noise_generator: 2,
        }
    }
}

/// Defaults installed by `#default { … }` and consumed when builders start
/// a new texture/pigment/finish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneDefaults {
    pub texture: Option<Texture>,
    pub pigment: Option<Pigment>,
    pub finish: Option<Finish>,
}

/// Everything a parse produces, apart from diagnostics.
#[derive(Debug, Default)]
pub struct SceneData {
    objects: Vec<ObjectNode>,
    lights: Vec<LightSource>,
    camera: Option<Camera>,
    background: Option<Color>,
    fogs: Vec<Fog>,
    rainbows: Vec<Rainbow>,
    sky_sphere: Option<SkySphere>,
    atmospheric_media: Vec<Media>,
    global_settings: GlobalSettings,
    pub(crate) defaults: SceneDefaults,
    pub(crate) functions: FunctionRegistry,
    /// Language version requested by `#version`, times 100 (370 = 3.7).
    pub(crate) language_version: u32,
}

impl SceneData {
    #[must_use]
    pub fn new() -> Self {
        Self {
            language_version: 370,
            ..Self::default()
        }
    }

    // --- insertion points used by the builder front-end ---

    pub(crate) fn append_object(&mut self, object: ObjectNode) {
        self.objects.push(object);
    }

    pub(crate) fn append_light(&mut self, light: LightSource) {
        self.lights.push(light);
    }

    /// Returns false when a camera was already set (the builder warns and
    /// keeps the newest).
    pub(crate) fn set_camera(&mut self, camera: Camera) -> bool {
        let first = self.camera.is_none();
        self.camera = Some(camera);
        first
    }

    pub(crate) fn set_background(&mut self, color: Color) {
        self.background = Some(color);
    }

    pub(crate) fn add_fog(&mut self, fog: Fog) {
        self.fogs.push(fog);
    }

    pub(crate) fn add_rainbow(&mut self, rainbow: Rainbow) {
        self.rainbows.push(rainbow);
    }

    pub(crate) fn set_sky_sphere(&mut self, sky: SkySphere) {
        self.sky_sphere = Some(sky);
    }

    pub(crate) fn add_media(&mut self, media: Media) {
        self.atmospheric_media.push(media);
    }

    pub(crate) fn set_global_settings(&mut self, settings: GlobalSettings) {
        self.global_settings = settings;
    }

    // --- read access for the renderer and for tests ---

    #[must_use]
    pub fn objects(&self) -> &[ObjectNode] {
        &self.objects
    }

    #[must_use]
    pub fn lights(&self) -> &[LightSource] {
        &self.lights
    }

    #[must_use]
    pub fn camera(&self) -> Option<&Camera> {
        self.camera.as_ref()
    }

    #[must_use]
    pub fn background(&self) -> Option<Color> {
        self.background
    }

    #[must_use]
    pub fn fogs(&self) -> &[Fog] {
        &self.fogs
    }

    #[must_use]
    pub fn rainbows(&self) -> &[Rainbow] {
        &self.rainbows
    }

    #[must_use]
    pub fn sky_sphere(&self) -> Option<&SkySphere> {
        self.sky_sphere.as_ref()
    }

    #[must_use]
    pub fn atmospheric_media(&self) -> &[Media] {
        &self.atmospheric_media
    }

    #[must_use]
    pub fn global_settings(&self) -> &GlobalSettings {
        &self.global_settings
    }

    /// Compiled functions plus the shared constants pool. Render threads
    /// evaluate against this with private [`crate::function::VmContext`]s.
    #[must_use]
    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    #[must_use]
    pub fn language_version(&self) -> u32 {
        self.language_version
    }

    /// One-line summary used by the driver binary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} object(s), {} light(s), camera {}, {} function(s)",
            self.objects.len(),
            self.lights.len(),
            if self.camera.is_some() { "set" } else { "unset" },
            self.functions.len(),
        )
    }
}
