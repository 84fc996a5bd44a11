//! The top-level scene grammar: the driver loop, camera, light sources,
//! global settings, background, and the `#declare` right-hand-side
//! dispatch.

use crate::{
    diag::{ErrorKind, ParseResult},
    nodes::{AreaLight, Camera, CameraKind, LightKind, LightSource},
    scenedata::GlobalSettings,
    token::{Keyword, TokenKind},
    value::{Value, ValueTag},
};

use super::Parser;

impl Parser<'_> {
    /// The driver loop: pulls cooked tokens and routes each scene item to
    /// its builder until the input ends.
    pub(crate) fn parse_frame(&mut self) -> ParseResult<()> {
        while let Some(token) = self.next_token()? {
            match &token.kind {
                TokenKind::Keyword(kw) if kw.is_object() => {
                    let kw = *kw;
                    let object = self.parse_object_block(kw)?;
                    self.scene.append_object(object);
                }
                TokenKind::Keyword(Keyword::Camera) => {
                    let camera = self.parse_camera()?;
                    if !self.scene.set_camera(camera) {
                        self.warn("more than one camera in the scene; the last one wins");
                    }
                }
                TokenKind::Keyword(Keyword::LightSource) => {
                    let light = self.parse_light_source()?;
                    self.scene.append_light(light);
                }
                TokenKind::Keyword(Keyword::GlobalSettings) => self.parse_global_settings()?,
                TokenKind::Keyword(Keyword::Background) => self.parse_background()?,
                TokenKind::Keyword(Keyword::Fog) => {
                    let fog = self.parse_fog()?;
                    self.scene.add_fog(fog);
                }
                TokenKind::Keyword(Keyword::Rainbow) => {
                    let rainbow = self.parse_rainbow()?;
                    self.scene.add_rainbow(rainbow);
                }
                TokenKind::Keyword(Keyword::SkySphere) => {
                    let sky = self.parse_sky_sphere()?;
                    self.scene.set_sky_sphere(sky);
                }
                TokenKind::Keyword(Keyword::Media) => {
                    let media = self.parse_media()?;
                    self.scene.add_media(media);
                }
                TokenKind::TypedIdentifier(ValueTag::Macro, name) => {
                    let name = name.clone();
                    self.invoke_macro(&name)?;
                }
                other => {
                    return Err(self.error_at(
                        ErrorKind::Parse,
                        token.position,
                        format!("expected a scene item, found {}", other.describe()),
                    ));
                }
            }
        }
        Ok(())
    }

    // --- camera ---

    pub(crate) fn parse_camera(&mut self) -> ParseResult<Camera> {
        self.parse_begin()?;
        let mut camera = Camera::default();
        if let Some(token) = self.next_token()? {
            match &token.kind {
                TokenKind::TypedIdentifier(ValueTag::Camera, name) => {
                    let name = name.clone();
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    if let Value::Camera(c) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                        camera = *c;
                    }
                }
                _ => self.unget(token),
            }
        }
        // look_at runs after every other item, whatever its position
        let mut look_at = None;
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in camera"));
            };
            match token.keyword() {
                Some(Keyword::Perspective) => camera.kind = CameraKind::Perspective,
                Some(Keyword::Orthographic) => camera.kind = CameraKind::Orthographic,
                Some(Keyword::Location) => camera.location = self.parse_vector()?,
                Some(Keyword::Direction) => camera.direction = self.parse_vector()?,
                Some(Keyword::Right) => camera.right = self.parse_vector()?,
                Some(Keyword::Up) => camera.up = self.parse_vector()?,
                Some(Keyword::Sky) => camera.sky = self.parse_vector()?,
                Some(Keyword::Angle) => {
                    let angle = self.parse_float()?;
                    if !(0.0..360.0).contains(&angle) {
                        return Err(self.error_here(ErrorKind::Domain, "camera angle must be within 0..360"));
                    }
                    camera.angle = Some(angle);
                }
                Some(Keyword::LookAt) => look_at = Some(self.parse_vector()?),
                Some(kw) => {
                    if self.apply_transform_keyword(kw, &mut camera.transform)? {
                        continue;
                    }
                    self.unget(token);
                    break;
                }
                None => {
                    self.unget(token);
                    break;
                }
            }
        }
        self.parse_end()?;
        if let Some(target) = look_at {
            if target == camera.location {
                self.warn("camera look_at coincides with its location");
            }
            camera.look_at(target);
        }
        Ok(camera)
    }

    // --- lights ---

    pub(crate) fn parse_light_source(&mut self) -> ParseResult<LightSource> {
        self.parse_begin()?;
        let mut light = LightSource::default();
        if let Some(token) = self.next_token()? {
            match &token.kind {
                TokenKind::TypedIdentifier(ValueTag::LightSource, name) => {
                    let name = name.clone();
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    if let Value::LightSource(l) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                        light = *l;
                        self.parse_light_items(&mut light)?;
                        self.parse_end()?;
                        return Ok(light);
                    }
                }
                _ => self.unget(token),
            }
        }
        light.location = self.parse_vector()?;
        self.parse_comma()?;
        light.color = self.parse_color_value()?;
        self.parse_light_items(&mut light)?;
        self.parse_end()?;
        Ok(light)
    }

    fn parse_light_items(&mut self, light: &mut LightSource) -> ParseResult<()> {
        // kind-specific controls collected flat, then folded into the kind
        let mut point_at = [0.0, 0.0, 0.0];
        let mut radius = 30.0;
        let mut falloff = 45.0;
        let mut tightness = 0.0;
        let mut have_point_at = false;

        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in light_source"));
            };
            match token.keyword() {
                Some(Keyword::Spotlight) => {
                    light.kind = LightKind::Spotlight {
                        point_at,
                        radius,
                        falloff,
                        tightness,
                    };
                }
                Some(Keyword::Cylinder) => {
                    light.kind = LightKind::Cylinder {
                        point_at,
                        radius,
                        falloff,
                        tightness,
                    };
                }
                Some(Keyword::Parallel) => {
                    light.kind = LightKind::Parallel { point_at };
                }
                Some(Keyword::PointAt) => {
                    point_at = self.parse_vector()?;
                    have_point_at = true;
                }
                Some(Keyword::Radius) => radius = self.parse_float()?,
                Some(Keyword::Falloff) => falloff = self.parse_float()?,
                Some(Keyword::Tightness) => tightness = self.parse_float()?,
                Some(Keyword::AreaLight) => {
                    let axis1 = self.parse_vector()?;
                    self.parse_comma()?;
                    let axis2 = self.parse_vector()?;
                    self.parse_comma()?;
                    let size1 = self.parse_u32("area_light size")?;
                    self.parse_comma()?;
                    let size2 = self.parse_u32("area_light size")?;
                    if size1 == 0 || size2 == 0 {
                        return Err(self.error_here(ErrorKind::Domain, "area_light sizes must be at least 1"));
                    }
                    light.area = Some(AreaLight {
                        axis1,
                        axis2,
                        size1,
                        size2,
                        adaptive: None,
                        jitter: false,
                        circular: false,
                        orient: false,
                    });
                }
                Some(Keyword::Adaptive) => {
                    let level = self.parse_u32("adaptive level")?;
                    if let Some(area) = &mut light.area {
                        area.adaptive = Some(level);
                    } else {
                        self.warn("adaptive outside an area_light has no effect");
                    }
                }
                Some(Keyword::Jitter) => {
                    if let Some(area) = &mut light.area {
                        area.jitter = true;
                    }
                }
                Some(Keyword::Circular) => {
                    if let Some(area) = &mut light.area {
                        area.circular = true;
                    }
                }
                Some(Keyword::Orient) => {
                    if let Some(area) = &mut light.area {
                        area.orient = true;
                    }
                }
                Some(Keyword::FadeDistance) => {
                    light.fade_distance = self.parse_float()?;
                    if light.fade_distance <= 0.0 {
                        return Err(self.error_here(ErrorKind::Domain, "fade_distance must be positive"));
                    }
                }
                Some(Keyword::FadePower) => light.fade_power = self.parse_float()?,
                Some(Keyword::Shadowless) => light.shadowless = true,
                Some(Keyword::MediaAttenuation) => {
                    light.media_attenuation = if self.peek_starts_float()? {
                        self.parse_float()? != 0.0
                    } else {
                        true
                    };
                }
                Some(Keyword::MediaInteraction) => {
                    light.media_interaction = if self.peek_starts_float()? {
                        self.parse_float()? != 0.0
                    } else {
                        true
                    };
                }
                Some(kw) => {
                    if self.apply_transform_keyword(kw, &mut light.transform)? {
                        continue;
                    }
                    self.unget(token);
                    break;
                }
                None => {
                    self.unget(token);
                    break;
                }
            }
        }

        // fold late point_at/radius/falloff/tightness into the chosen kind
        match &mut light.kind {
            LightKind::Spotlight {
                point_at: p,
                radius: r,
                falloff: f,
                tightness: t,
            }
            | LightKind::Cylinder {
                point_at: p,
                radius: r,
                falloff: f,
                tightness: t,
            } => {
                *p = point_at;
                *r = radius;
                *f = falloff;
                *t = tightness;
            }
            LightKind::Parallel { point_at: p } => *p = point_at,
            LightKind::Point => {
                if have_point_at {
                    self.warn("point_at requires a spotlight, cylinder, or parallel light");
                }
            }
        }
        Ok(())
    }

    // --- global settings and background ---

    fn parse_global_settings(&mut self) -> ParseResult<()> {
        self.parse_begin()?;
        let mut settings = self.scene.global_settings().clone();
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in global_settings"));
            };
            match token.keyword() {
                Some(Keyword::AmbientLight) => settings.ambient_light = self.parse_color_value()?,
                Some(Keyword::AssumedGamma) => {
                    let gamma = self.parse_float()?;
                    if gamma <= 0.0 {
                        return Err(self.error_here(ErrorKind::Domain, "assumed_gamma must be positive"));
                    }
                    settings.assumed_gamma = Some(gamma);
                }
                Some(Keyword::MaxTraceLevel) => {
                    settings.max_trace_level = self.parse_u32("max_trace_level")?;
                    if settings.max_trace_level == 0 || settings.max_trace_level > 256 {
                        return Err(self.error_here(ErrorKind::Domain, "max_trace_level must be within 1..256"));
                    }
                }
                Some(Keyword::AdcBailout) => settings.adc_bailout = self.parse_float()?,
                Some(Keyword::NumberOfWaves) => {
                    settings.number_of_waves = self.parse_u32("number_of_waves")?.max(1);
                }
                Some(Keyword::NoiseGenerator) => {
                    settings.noise_generator = self.parse_u32("noise_generator")?;
                    if !(1..=3).contains(&settings.noise_generator) {
                        return Err(self.error_here(ErrorKind::Domain, "noise_generator must be 1, 2 or 3"));
                    }
                }
                Some(Keyword::Charset) => {
                    self.warn_deprecated("charset", "all input is treated as UTF-8");
                    // swallow the legacy argument
                    let token = self.expect_token()?;
                    if !matches!(
                        token.kind,
                        TokenKind::Keyword(Keyword::Ascii | Keyword::Utf8 | Keyword::Sys)
                    ) {
                        self.unget(token);
                    }
                }
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }
        self.parse_end()?;
        self.scene.set_global_settings(settings);
        Ok(())
    }

    fn parse_background(&mut self) -> ParseResult<()> {
        self.parse_begin()?;
        let mut color = self.parse_color_value()?;
        self.parse_end()?;
        // the canonical default: a background is transparent to rays that
        // miss everything, through transmit rather than filter
        if color.filter == 0.0 && color.transmit == 0.0 {
            color.transmit = 1.0;
        }
        self.scene.set_background(color);
        Ok(())
    }

    // --- #declare right-hand sides ---

    /// Parses the value after `#declare name =`: a block value keyed by its
    /// leading keyword, or an expression.
    pub(crate) fn parse_rvalue(&mut self, name: Option<&str>, _is_local: bool) -> ParseResult<Value> {
        let token = self.expect_token()?;
        let Some(keyword) = token.keyword() else {
            self.unget(token);
            return self.parse_expression();
        };
        let value = match keyword {
            Keyword::Function => Value::Function(self.parse_function_block(name)?),
            Keyword::Texture => Value::Texture(Box::new(self.parse_texture()?)),
            Keyword::Pigment => Value::Pigment(Box::new(self.parse_pigment()?)),
            Keyword::Normal => Value::Normal(Box::new(self.parse_normal()?)),
            Keyword::Finish => Value::Finish(Box::new(self.parse_finish()?)),
            Keyword::Interior => Value::Interior(Box::new(self.parse_interior()?)),
            Keyword::Material => Value::Material(Box::new(self.parse_material()?)),
            Keyword::Camera => Value::Camera(Box::new(self.parse_camera()?)),
            Keyword::LightSource => Value::LightSource(Box::new(self.parse_light_source()?)),
            Keyword::Fog => Value::Fog(Box::new(self.parse_fog()?)),
            Keyword::Rainbow => Value::Rainbow(Box::new(self.parse_rainbow()?)),
            Keyword::SkySphere => Value::SkySphere(Box::new(self.parse_sky_sphere()?)),
            Keyword::Media => Value::Media(Box::new(self.parse_media()?)),
            Keyword::Density => Value::Density(Box::new(self.parse_density()?)),
            Keyword::Transform => Value::Transform(Box::new(self.parse_transform_value()?)),
            Keyword::Spline => self.parse_spline_declaration()?,
            Keyword::Array => self.parse_array_declaration()?,
            Keyword::Dictionary => self.parse_dictionary_declaration()?,
            Keyword::ColorMap | Keyword::ColourMap => Value::ColorMap(Box::new(self.parse_color_map()?)),
            Keyword::PigmentMap => {
                let map = self.parse_blend_map("pigment_map", |parser| Ok(parser.parse_pigment()?))?;
                Value::PigmentMap(Box::new(map))
            }
            Keyword::NormalMap => {
                let map = self.parse_blend_map("normal_map", |parser| Ok(parser.parse_normal()?))?;
                Value::NormalMap(Box::new(map))
            }
            Keyword::TextureMap => {
                let map = self.parse_blend_map("texture_map", |parser| {
                    parser.expect_keyword(Keyword::Texture, "'texture'")?;
                    parser.parse_texture()
                })?;
                Value::TextureMap(Box::new(map))
            }
            Keyword::SlopeMap => {
                let map = self.parse_blend_map("slope_map", Self::parse_slope_entry)?;
                Value::SlopeMap(Box::new(map))
            }
            Keyword::DensityMap => {
                let map = self.parse_blend_map("density_map", |parser| Ok(parser.parse_density()?))?;
                Value::DensityMap(Box::new(map))
            }
            kw if kw.is_object() => Value::Object(Box::new(self.parse_object_block(kw)?)),
            _ => {
                self.unget(token);
                return self.parse_expression();
            }
        };
        Ok(value)
    }
}
