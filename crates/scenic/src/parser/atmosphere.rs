//! Builders for atmospheric effects: media, fog, rainbow, sky_sphere.

use crate::{
    diag::{ErrorKind, ParseResult},
    nodes::{Fog, FogKind, Media, Rainbow, Scattering, SkySphere, Turbulence},
    token::Keyword,
    value::{Value, ValueTag},
};

use super::Parser;

impl Parser<'_> {
    /// `media { … }`, used by interiors and by scene-level atmosphere.
    pub(crate) fn parse_media(&mut self) -> ParseResult<Media> {
        self.parse_begin()?;
        let mut media = Media::default();
        if let Some(token) = self.next_token()? {
            match &token.kind {
                crate::token::TokenKind::TypedIdentifier(ValueTag::Media, name) => {
                    let name = name.clone();
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    if let Value::Media(m) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                        media = *m;
                    }
                }
                _ => self.unget(token),
            }
        }
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in media"));
            };
            match token.keyword() {
                Some(Keyword::Method) => {
                    media.method = self.parse_u32("media method")?;
                    if !(1..=3).contains(&media.method) {
                        return Err(self.error_here(ErrorKind::Domain, "media method must be 1, 2 or 3"));
                    }
                }
                Some(Keyword::Intervals) => {
                    media.intervals = self.parse_u32("intervals")?;
                    if media.intervals == 0 {
                        return Err(self.error_here(ErrorKind::Domain, "media needs at least one interval"));
                    }
                }
                Some(Keyword::Samples) => {
                    media.samples_min = self.parse_u32("samples")?;
                    media.samples_max = if self.allow(&crate::token::TokenKind::Comma)? {
                        self.parse_u32("samples")?
                    } else {
                        media.samples_min
                    };
                }
                Some(Keyword::Absorption) => media.absorption = self.parse_color_value()?,
                Some(Keyword::Emission) => media.emission = self.parse_color_value()?,
                Some(Keyword::Scattering) => {
                    self.parse_begin()?;
                    let kind = self.parse_u32("scattering type")?;
                    if !(1..=5).contains(&kind) {
                        return Err(self.error_here(ErrorKind::Domain, "scattering type must be 1 through 5"));
                    }
                    self.parse_comma()?;
                    let color = self.parse_color_value()?;
                    let mut scattering = Scattering {
                        kind,
                        color,
                        eccentricity: 0.0,
                        extinction: 1.0,
                    };
                    loop {
                        let Some(inner) = self.next_token()? else {
                            return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in scattering"));
                        };
                        match inner.keyword() {
                            // eccentricity only applies to the Henyey-
                            // Greenstein model (type 5)
                            Some(Keyword::Omega) => scattering.eccentricity = self.parse_float()?,
                            Some(Keyword::Lambda) => scattering.extinction = self.parse_float()?,
                            _ => {
                                self.unget(inner);
                                break;
                            }
                        }
                    }
                    self.parse_end()?;
                    media.scattering = Some(scattering);
                }
                Some(Keyword::Density) => media.density.push(self.parse_density()?),
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }
        self.parse_end()?;
        Ok(media)
    }

    pub(crate) fn parse_fog(&mut self) -> ParseResult<Fog> {
        self.parse_begin()?;
        let mut fog = Fog::default();
        if let Some(token) = self.next_token()? {
            match &token.kind {
                crate::token::TokenKind::TypedIdentifier(ValueTag::Fog, name) => {
                    let name = name.clone();
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    if let Value::Fog(f) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                        fog = *f;
                    }
                }
                _ => self.unget(token),
            }
        }
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in fog"));
            };
            match token.keyword() {
                Some(Keyword::FogType) => {
                    let kind = self.parse_u32("fog_type")?;
                    fog.kind = match kind {
                        1 => FogKind::Constant,
                        2 => FogKind::Ground,
                        _ => return Err(self.error_here(ErrorKind::Domain, "fog_type must be 1 or 2")),
                    };
                }
                Some(Keyword::Distance) => {
                    fog.distance = self.parse_float()?;
                    if fog.distance == 0.0 {
                        return Err(self.error_here(ErrorKind::Domain, "fog distance cannot be zero"));
                    }
                }
                Some(
                    Keyword::Color
                    | Keyword::Red
                    | Keyword::Green
                    | Keyword::Blue
                    | Keyword::Rgb
                    | Keyword::Rgbf
                    | Keyword::Rgbt
                    | Keyword::Rgbft,
                ) => {
                    self.unget(token);
                    fog.color = self.parse_color_value()?;
                }
                Some(Keyword::FogOffset) => fog.offset = self.parse_float()?,
                Some(Keyword::FogAlt) => fog.alt = self.parse_float()?,
                Some(Keyword::Up) => fog.up = self.parse_vector()?,
                Some(Keyword::TurbDepth) => fog.turb_depth = self.parse_float()?,
                Some(Keyword::Turbulence) => {
                    let turbulence = fog.turbulence.get_or_insert_with(Turbulence::default);
                    turbulence.amount = self.parse_vector()?;
                }
                Some(Keyword::Octaves) => {
                    fog.turbulence.get_or_insert_with(Turbulence::default).octaves =
                        self.parse_u32("octaves")?.clamp(1, 10);
                }
                Some(Keyword::Omega) => {
                    fog.turbulence.get_or_insert_with(Turbulence::default).omega = self.parse_float()?;
                }
                Some(Keyword::Lambda) => {
                    fog.turbulence.get_or_insert_with(Turbulence::default).lambda = self.parse_float()?;
                }
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }
        self.parse_end()?;
        Ok(fog)
    }

    pub(crate) fn parse_rainbow(&mut self) -> ParseResult<Rainbow> {
        self.parse_begin()?;
        let mut rainbow = Rainbow::default();
        if let Some(token) = self.next_token()? {
            match &token.kind {
                crate::token::TokenKind::TypedIdentifier(ValueTag::Rainbow, name) => {
                    let name = name.clone();
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    if let Value::Rainbow(r) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                        rainbow = *r;
                    }
                }
                _ => self.unget(token),
            }
        }
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in rainbow"));
            };
            match token.keyword() {
                Some(Keyword::Direction) => {
                    rainbow.direction = self.parse_vector()?;
                    if crate::math::vlength(rainbow.direction) == 0.0 {
                        return Err(self.error_here(ErrorKind::Domain, "rainbow direction cannot be zero"));
                    }
                }
                Some(Keyword::Angle) => rainbow.angle = self.parse_float()?,
                Some(Keyword::Width) => rainbow.width = self.parse_float()?,
                Some(Keyword::Distance) => rainbow.distance = self.parse_float()?,
                Some(Keyword::Jitter) => rainbow.jitter = self.parse_float()?,
                Some(Keyword::Up) => rainbow.up = self.parse_vector()?,
                Some(Keyword::ArcAngle) => rainbow.arc_angle = self.parse_float()?,
                Some(Keyword::FalloffAngle) => {
                    rainbow.falloff_angle = self.parse_float()?;
                    if !(0.0..=360.0).contains(&rainbow.falloff_angle) {
                        return Err(self.error_here(ErrorKind::Domain, "falloff_angle must be within 0..360"));
                    }
                }
                Some(Keyword::ColorMap | Keyword::ColourMap) => rainbow.color_map = self.parse_color_map()?,
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }
        self.parse_end()?;
        if rainbow.color_map.is_empty() {
            self.warn("rainbow without a color_map renders as empty");
        }
        Ok(rainbow)
    }

    pub(crate) fn parse_sky_sphere(&mut self) -> ParseResult<SkySphere> {
        self.parse_begin()?;
        let mut sky = SkySphere::default();
        if let Some(token) = self.next_token()? {
            match &token.kind {
                crate::token::TokenKind::TypedIdentifier(ValueTag::SkySphere, name) => {
                    let name = name.clone();
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    if let Value::SkySphere(s) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                        sky = *s;
                    }
                }
                _ => self.unget(token),
            }
        }
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in sky_sphere"));
            };
            match token.keyword() {
                Some(Keyword::Pigment) => sky.pigments.push(self.parse_pigment()?),
                Some(Keyword::Emission) => sky.emission = Some(self.parse_color_value()?),
                Some(kw) => {
                    if self.apply_transform_keyword(kw, &mut sky.transform)? {
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
        if sky.pigments.is_empty() {
            return Err(self.error_here(ErrorKind::Parse, "sky_sphere needs at least one pigment"));
        }
        Ok(sky)
    }
}
