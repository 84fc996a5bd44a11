//! Builders for appearance nodes: textures, pigments, normals, finishes,
//! interiors, materials, patterns, and blend maps.
//!
//! Every builder follows the same skeleton: consume `{`, absorb a
//! same-typed identifier if one follows, loop over body keywords, unget
//! whatever it does not recognize, consume `}`, and compose transform
//! modifiers as they appear.

use crate::{
    diag::{ErrorKind, ParseResult},
    math::Transform,
    nodes::{
        BlendMap, Density, DensityBlend, DensityKind, Finish, Interior, Material, Normal, NormalBlend, Pattern,
        PatternModifiers, Pigment, PigmentBlend, PigmentKind, Reflection, Texture, TextureKind, Turbulence, WaveShape,
    },
    token::{Keyword, TokenKind},
    value::{Value, ValueTag},
};

use super::Parser;

impl Parser<'_> {
    // --- transforms ---

    /// `matrix <m00, …, m32>`: twelve values, rejected when singular.
    pub(crate) fn parse_matrix_transform(&mut self) -> ParseResult<Transform> {
        self.expect_kind(&TokenKind::LeftAngle, "'<'")?;
        let rows = self.in_vector(|parser| {
            let mut rows = [0.0; 12];
            for (i, slot) in rows.iter_mut().enumerate() {
                if i > 0 {
                    parser.parse_comma()?;
                }
                *slot = parser.parse_float()?;
            }
            Ok(rows)
        })?;
        self.expect_kind(&TokenKind::RightAngle, "'>'")?;
        Transform::from_rows(rows).ok_or_else(|| self.error_here(ErrorKind::Domain, "singular matrix in 'matrix'"))
    }

    /// The value after a `transform` keyword: a block, or a transform
    /// identifier, optionally `inverse`d.
    pub(crate) fn parse_transform_value(&mut self) -> ParseResult<Transform> {
        let token = self.expect_token()?;
        match &token.kind {
            TokenKind::TypedIdentifier(ValueTag::Transform, name) => {
                let name = name.clone();
                let found = self.symbols.find(&name).expect("typed identifier resolves");
                match self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                    Value::Transform(t) => Ok(*t),
                    _ => unreachable!("tag promised a transform"),
                }
            }
            TokenKind::LeftBrace => {
                self.unget(token);
                self.parse_transform_block()
            }
            other => Err(self.error_at(
                ErrorKind::Parse,
                token.position,
                format!("expected a transform block or identifier, found {}", other.describe()),
            )),
        }
    }

    /// `transform { … }`.
    pub(crate) fn parse_transform_block(&mut self) -> ParseResult<Transform> {
        self.parse_begin()?;
        let mut transform = Transform::IDENTITY;
        loop {
            let token = self.expect_token()?;
            match &token.kind {
                TokenKind::TypedIdentifier(ValueTag::Transform, name) => {
                    let name = name.clone();
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    if let Value::Transform(t) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                        transform = transform.compose(&t);
                    }
                }
                TokenKind::Keyword(Keyword::Translate) => {
                    let v = self.parse_vector()?;
                    transform = transform.compose(&Transform::translation(v));
                }
                TokenKind::Keyword(Keyword::Rotate) => {
                    let v = self.parse_vector()?;
                    transform = transform.compose(&Transform::rotation(v));
                }
                TokenKind::Keyword(Keyword::Scale) => {
                    let v = self.parse_scale_vector()?;
                    transform = transform.compose(&Transform::scaling(v));
                }
                TokenKind::Keyword(Keyword::Matrix) => {
                    let m = self.parse_matrix_transform()?;
                    transform = transform.compose(&m);
                }
                TokenKind::Keyword(Keyword::Transform) => {
                    let t = self.parse_transform_value()?;
                    transform = transform.compose(&t);
                }
                TokenKind::Keyword(Keyword::Inverse) => {
                    transform = Transform {
                        matrix: transform.inverse,
                        inverse: transform.matrix,
                    };
                }
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }
        self.parse_end()?;
        Ok(transform)
    }

    /// Handles one transform-modifier keyword shared by every node builder.
    /// Returns false when the keyword is not a transform modifier.
    pub(crate) fn apply_transform_keyword(&mut self, keyword: Keyword, transform: &mut Transform) -> ParseResult<bool> {
        match keyword {
            Keyword::Translate => {
                let v = self.parse_vector()?;
                *transform = transform.compose(&Transform::translation(v));
            }
            Keyword::Rotate => {
                let v = self.parse_vector()?;
                *transform = transform.compose(&Transform::rotation(v));
            }
            Keyword::Scale => {
                let v = self.parse_scale_vector()?;
                *transform = transform.compose(&Transform::scaling(v));
            }
            Keyword::Matrix => {
                let m = self.parse_matrix_transform()?;
                *transform = transform.compose(&m);
            }
            Keyword::Transform => {
                let t = self.parse_transform_value()?;
                *transform = transform.compose(&t);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    // --- patterns ---

    /// Maps a pattern keyword to its node, consuming pattern arguments.
    /// Returns `None` for non-pattern keywords.
    pub(crate) fn parse_pattern_keyword(&mut self, keyword: Keyword) -> ParseResult<Option<Pattern>> {
        let pattern = match keyword {
            Keyword::Checker => Pattern::Checker,
            Keyword::Brick => Pattern::Brick {
                mortar: 0.01,
                size: [8.0, 3.0, 4.5],
            },
            Keyword::Hexagon => Pattern::Hexagon,
            Keyword::Gradient => Pattern::Gradient(self.parse_vector()?),
            Keyword::Bozo => Pattern::Bozo,
            Keyword::Granite => Pattern::Granite,
            Keyword::Marble => Pattern::Marble,
            Keyword::Wood => Pattern::Wood,
            Keyword::Agate => Pattern::Agate { turbulence: 1.0 },
            Keyword::Spotted => Pattern::Spotted,
            Keyword::Leopard => Pattern::Leopard,
            Keyword::Onion => Pattern::Onion,
            Keyword::Crackle => Pattern::Crackle,
            Keyword::Spiral1 => Pattern::Spiral1 {
                arms: self.parse_float()?,
            },
            Keyword::Spiral2 => Pattern::Spiral2 {
                arms: self.parse_float()?,
            },
            Keyword::Radial => Pattern::Radial,
            Keyword::Ripples => Pattern::Ripples,
            Keyword::Waves => Pattern::Waves,
            Keyword::Wrinkles => Pattern::Wrinkles,
            Keyword::Bumps => Pattern::Bumps,
            Keyword::Dents => Pattern::Dents,
            Keyword::Cells => Pattern::Cells,
            Keyword::Planar => Pattern::Planar,
            Keyword::Spherical => Pattern::Spherical,
            Keyword::Boxed => Pattern::Boxed,
            Keyword::Cylindrical => Pattern::Cylindrical,
            Keyword::Function => Pattern::Function(self.parse_function_block(None)?),
            _ => return Ok(None),
        };
        Ok(Some(pattern))
    }

    /// One pattern-modifier keyword; false when the keyword is not one.
    pub(crate) fn parse_pattern_modifier(&mut self, keyword: Keyword, modifiers: &mut PatternModifiers) -> ParseResult<bool> {
        match keyword {
            Keyword::Frequency => modifiers.frequency = self.parse_float()?,
            Keyword::Phase => modifiers.phase = self.parse_float()?,
            Keyword::Turbulence => {
                let amount = self.parse_vector()?;
                let turbulence = modifiers.turbulence.get_or_insert_with(Turbulence::default);
                turbulence.amount = amount;
            }
            Keyword::Octaves => {
                let octaves = self.parse_u32("octaves")?.clamp(1, 10);
                modifiers.turbulence.get_or_insert_with(Turbulence::default).octaves = octaves;
            }
            Keyword::Omega => {
                modifiers.turbulence.get_or_insert_with(Turbulence::default).omega = self.parse_float()?;
            }
            Keyword::Lambda => {
                modifiers.turbulence.get_or_insert_with(Turbulence::default).lambda = self.parse_float()?;
            }
            Keyword::RampWave => modifiers.wave = WaveShape::Ramp,
            Keyword::TriangleWave => modifiers.wave = WaveShape::Triangle,
            Keyword::SineWave => modifiers.wave = WaveShape::Sine,
            Keyword::ScallopWave => modifiers.wave = WaveShape::Scallop,
            Keyword::CubicWave => modifiers.wave = WaveShape::Cubic,
            Keyword::PolyWave => modifiers.wave = WaveShape::Poly(self.parse_float()?),
            _ => return Ok(false),
        }
        Ok(true)
    }

    // --- blend maps ---

    /// `{ [key value] … }` or `{ v1, v2, … }` with keys interpolated 0..1.
    pub(crate) fn parse_blend_map<V>(
        &mut self,
        what: &str,
        parse_value: impl FnMut(&mut Self) -> ParseResult<V>,
    ) -> ParseResult<BlendMap<V>> {
        self.parse_begin()?;
        self.parse_blend_map_body(what, parse_value)
    }

    /// The body of a blend map, after its `{` has been consumed.
    fn parse_blend_map_body<V>(
        &mut self,
        what: &str,
        mut parse_value: impl FnMut(&mut Self) -> ParseResult<V>,
    ) -> ParseResult<BlendMap<V>> {
        let mut map = BlendMap::new();
        if self.allow(&TokenKind::LeftBracket)? {
            loop {
                let key = self.parse_float()?;
                self.parse_comma()?;
                let value = parse_value(self)?;
                self.expect_kind(&TokenKind::RightBracket, "']'")?;
                map.insert(key, value);
                if !self.allow(&TokenKind::LeftBracket)? {
                    break;
                }
            }
        } else {
            let mut values = Vec::new();
            loop {
                let token = self.expect_token()?;
                if token.kind == TokenKind::RightBrace {
                    self.unget(token);
                    break;
                }
                self.unget(token);
                values.push(parse_value(self)?);
                if !self.allow(&TokenKind::Comma)? {
                    break;
                }
            }
            map = BlendMap::from_list(values);
        }
        if map.is_empty() {
            return Err(self.error_here(ErrorKind::Parse, format!("{what} must contain at least one entry")));
        }
        if map.len() > 256 {
            return Err(self.error_here(ErrorKind::Resource, format!("{what} has too many entries (limit 256)")));
        }
        self.parse_end()?;
        Ok(map)
    }

    pub(crate) fn parse_color_map(&mut self) -> ParseResult<BlendMap<crate::math::Color>> {
        self.parse_begin()?;
        // a declared map may stand in for the whole body
        if let Some(token) = self.next_token()? {
            if let TokenKind::TypedIdentifier(ValueTag::ColorMap, name) = &token.kind {
                let name = name.clone();
                let found = self.symbols.find(&name).expect("typed identifier resolves");
                if let Value::ColorMap(map) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                    self.parse_end()?;
                    return Ok(*map);
                }
            }
            self.unget(token);
        }
        self.parse_blend_map_body("color_map", Self::parse_color_value)
    }

    /// A `slope_map` entry value: `<height, slope>`.
    pub(crate) fn parse_slope_entry(&mut self) -> ParseResult<[f64; 2]> {
        self.expect_kind(&TokenKind::LeftAngle, "'<'")?;
        let entry = self.in_vector(|parser| {
            let height = parser.parse_float()?;
            parser.parse_comma()?;
            let slope = parser.parse_float()?;
            Ok([height, slope])
        })?;
        self.expect_kind(&TokenKind::RightAngle, "'>'")?;
        Ok(entry)
    }

    // --- pigments ---

    /// `pigment { … }` with the leading keyword already consumed.
    pub(crate) fn parse_pigment(&mut self) -> ParseResult<Pigment> {
        self.parse_begin()?;
        let mut pigment = self
            .scene
            .defaults
            .pigment
            .clone()
            .unwrap_or_default();
        // prototype + override: a pigment identifier right after the brace
        if let Some(token) = self.next_token()? {
            match &token.kind {
                TokenKind::TypedIdentifier(ValueTag::Pigment, name) => {
                    let name = name.clone();
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    if let Value::Pigment(p) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                        pigment = *p;
                    }
                }
                _ => self.unget(token),
            }
        }
        self.parse_pigment_items(&mut pigment)?;
        self.parse_end()?;
        Ok(pigment)
    }

    /// The body items of a pigment, shared with `pigment_map` entries.
    pub(crate) fn parse_pigment_items(&mut self, pigment: &mut Pigment) -> ParseResult<()> {
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in pigment"));
            };
            let keyword = token.keyword();
            match keyword {
                Some(
                    Keyword::Color
                    | Keyword::Red
                    | Keyword::Green
                    | Keyword::Blue
                    | Keyword::Filter
                    | Keyword::Transmit
                    | Keyword::Rgb
                    | Keyword::Rgbf
                    | Keyword::Rgbt
                    | Keyword::Rgbft,
                ) => {
                    self.unget(token);
                    pigment.kind = PigmentKind::Color(self.parse_color_value()?);
                    continue;
                }
                Some(Keyword::ColorMap | Keyword::ColourMap) => {
                    let map = self.parse_color_map()?;
                    self.set_pigment_blend(pigment, PigmentBlend::Colors(map))?;
                    continue;
                }
                Some(Keyword::PigmentMap) => {
                    let map = self.parse_blend_map("pigment_map", |parser| {
                        let mut entry = Pigment::default();
                        parser.parse_pigment_entry(&mut entry)?;
                        Ok(entry)
                    })?;
                    self.set_pigment_blend(pigment, PigmentBlend::Pigments(map))?;
                    continue;
                }
                Some(kw) => {
                    if let Some(pattern) = self.parse_pattern_keyword(kw)? {
                        let blend = match std::mem::replace(&mut pigment.kind, PigmentKind::Color(crate::math::Color::BLACK))
                        {
                            PigmentKind::Pattern { blend, .. } => blend,
                            PigmentKind::Color(_) => PigmentBlend::Colors(BlendMap::new()),
                        };
                        pigment.kind = PigmentKind::Pattern { pattern, blend };
                        // checker-style patterns accept an inline color list
                        self.parse_inline_pattern_colors(pigment, kw)?;
                        continue;
                    }
                    if self.parse_pattern_modifier(kw, &mut pigment.modifiers)? {
                        continue;
                    }
                    if self.apply_transform_keyword(kw, &mut pigment.transform)? {
                        continue;
                    }
                    self.unget(token);
                    return Ok(());
                }
                None => match &token.kind {
                    TokenKind::LeftAngle => {
                        self.unget(token);
                        pigment.kind = PigmentKind::Color(self.parse_color_value()?);
                    }
                    TokenKind::TypedIdentifier(ValueTag::Color, _) => {
                        self.unget(token);
                        pigment.kind = PigmentKind::Color(self.parse_color_value()?);
                    }
                    _ => {
                        self.unget(token);
                        return Ok(());
                    }
                },
            }
        }
    }

    /// A `pigment_map` entry: either a pigment identifier or inline body
    /// items.
    fn parse_pigment_entry(&mut self, pigment: &mut Pigment) -> ParseResult<()> {
        if let Some(token) = self.next_token()? {
            match &token.kind {
                TokenKind::TypedIdentifier(ValueTag::Pigment, name) => {
                    let name = name.clone();
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    if let Value::Pigment(p) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                        *pigment = *p;
                    }
                    return Ok(());
                }
                _ => self.unget(token),
            }
        }
        self.parse_pigment_items(pigment)
    }

    fn set_pigment_blend(&mut self, pigment: &mut Pigment, blend: PigmentBlend) -> ParseResult<()> {
        match &mut pigment.kind {
            PigmentKind::Pattern { blend: slot, .. } => {
                *slot = blend;
                Ok(())
            }
            PigmentKind::Color(_) => Err(self.error_here(
                ErrorKind::Parse,
                "a color map requires a pattern keyword before it",
            )),
        }
    }

    /// `checker COLOR, COLOR` (and the brick/hexagon analogues): inline
    /// colors become the pattern's blend map.
    fn parse_inline_pattern_colors(&mut self, pigment: &mut Pigment, keyword: Keyword) -> ParseResult<()> {
        let slots: usize = match keyword {
            Keyword::Checker | Keyword::Brick => 2,
            Keyword::Hexagon => 3,
            _ => return Ok(()),
        };
        let mut colors = Vec::with_capacity(slots);
        for i in 0..slots {
            let Some(token) = self.next_token()? else { break };
            let starts_color = matches!(
                &token.kind,
                TokenKind::LeftAngle
                    | TokenKind::Keyword(
                        Keyword::Color
                            | Keyword::Red
                            | Keyword::Green
                            | Keyword::Blue
                            | Keyword::Rgb
                            | Keyword::Rgbf
                            | Keyword::Rgbt
                            | Keyword::Rgbft
                    )
                    | TokenKind::TypedIdentifier(ValueTag::Color, _)
            );
            self.unget(token);
            if !starts_color {
                break;
            }
            colors.push(self.parse_color_value()?);
            if i + 1 < slots {
                self.parse_comma()?;
            }
        }
        if !colors.is_empty() {
            let map = BlendMap::from_list(colors);
            self.set_pigment_blend(pigment, PigmentBlend::Colors(map))?;
        }
        Ok(())
    }

    // --- normals ---

    pub(crate) fn parse_normal(&mut self) -> ParseResult<Normal> {
        self.parse_begin()?;
        let mut normal = Normal::default();
        if let Some(token) = self.next_token()? {
            match &token.kind {
                TokenKind::TypedIdentifier(ValueTag::Normal, name) => {
                    let name = name.clone();
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    if let Value::Normal(n) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                        normal = *n;
                    }
                }
                _ => self.unget(token),
            }
        }
        self.parse_normal_items(&mut normal)?;
        self.parse_end()?;
        Ok(normal)
    }

    pub(crate) fn parse_normal_items(&mut self, normal: &mut Normal) -> ParseResult<()> {
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in normal"));
            };
            let Some(keyword) = token.keyword() else {
                self.unget(token);
                return Ok(());
            };
            match keyword {
                Keyword::NormalMap => {
                    let map = self.parse_blend_map("normal_map", |parser| {
                        let mut entry = Normal::default();
                        parser.parse_normal_items(&mut entry)?;
                        Ok(entry)
                    })?;
                    normal.blend = Some(NormalBlend::Normals(map));
                }
                Keyword::SlopeMap => {
                    let map = self.parse_blend_map("slope_map", Self::parse_slope_entry)?;
                    normal.blend = Some(NormalBlend::Slope(map));
                }
                other => {
                    if let Some(pattern) = self.parse_pattern_keyword(other)? {
                        normal.pattern = Some(pattern);
                        if self.peek_starts_float()? {
                            normal.amount = self.parse_float()?;
                        }
                        continue;
                    }
                    if self.parse_pattern_modifier(other, &mut normal.modifiers)? {
                        continue;
                    }
                    if self.apply_transform_keyword(other, &mut normal.transform)? {
                        continue;
                    }
                    self.unget(token);
                    return Ok(());
                }
            }
        }
    }

    /// True when the next token can start a float expression; used for
    /// optional trailing amounts like `bumps 0.7`.
    pub(crate) fn peek_starts_float(&mut self) -> ParseResult<bool> {
        let Some(token) = self.next_token()? else {
            return Ok(false);
        };
        let starts = matches!(
            &token.kind,
            TokenKind::Float(_)
                | TokenKind::Minus
                | TokenKind::LeftParen
                | TokenKind::TypedIdentifier(ValueTag::Scalar, _)
        );
        self.unget(token);
        Ok(starts)
    }

    // --- finishes ---

    pub(crate) fn parse_finish(&mut self) -> ParseResult<Finish> {
        self.parse_begin()?;
        let mut finish = self.scene.defaults.finish.clone().unwrap_or_default();
        if let Some(token) = self.next_token()? {
            match &token.kind {
                TokenKind::TypedIdentifier(ValueTag::Finish, name) => {
                    let name = name.clone();
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    if let Value::Finish(f) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                        finish = *f;
                    }
                }
                _ => self.unget(token),
            }
        }
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in finish"));
            };
            let Some(keyword) = token.keyword() else {
                self.unget(token);
                break;
            };
            match keyword {
                Keyword::Ambient => finish.ambient = self.parse_color_value()?,
                Keyword::Diffuse => finish.diffuse = self.parse_float()?,
                Keyword::Brilliance => finish.brilliance = self.parse_float()?,
                Keyword::Phong => finish.phong = self.parse_float()?,
                Keyword::PhongSize => finish.phong_size = self.parse_float()?,
                Keyword::Specular => finish.specular = self.parse_float()?,
                Keyword::Roughness => {
                    let roughness = self.parse_float()?;
                    if roughness <= 0.0 {
                        return Err(self.error_here(ErrorKind::Domain, "roughness must be positive"));
                    }
                    finish.roughness = roughness;
                }
                Keyword::Metallic => {
                    finish.metallic = if self.peek_starts_float()? { self.parse_float()? } else { 1.0 };
                }
                Keyword::Crand => finish.crand = self.parse_float()?,
                Keyword::ConserveEnergy => finish.conserve_energy = true,
                Keyword::Reflection => finish.reflection = Some(self.parse_reflection()?),
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }
        self.parse_end()?;
        Ok(finish)
    }

    /// `reflection COLOR` or `reflection { [min,] max [falloff F] [metallic F] }`.
    fn parse_reflection(&mut self) -> ParseResult<Reflection> {
        if !self.allow(&TokenKind::LeftBrace)? {
            let max = self.parse_color_value()?;
            return Ok(Reflection {
                min: max,
                max,
                falloff: 1.0,
                metallic: 0.0,
            });
        }
        self.brace_stack.push((TokenKind::LeftBrace, self.lexer.position()));
        let first = self.parse_color_value()?;
        let max = if self.allow(&TokenKind::Comma)? {
            self.parse_color_value()?
        } else {
            first
        };
        let mut reflection = Reflection {
            min: first,
            max,
            falloff: 1.0,
            metallic: 0.0,
        };
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in reflection"));
            };
            match token.keyword() {
                Some(Keyword::Falloff) => reflection.falloff = self.parse_float()?,
                Some(Keyword::Metallic) => {
                    reflection.metallic = if self.peek_starts_float()? { self.parse_float()? } else { 1.0 };
                }
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }
        self.parse_end()?;
        Ok(reflection)
    }

    // --- textures ---

    /// `texture { … }` with the keyword already consumed.
    pub(crate) fn parse_texture(&mut self) -> ParseResult<Texture> {
        self.parse_begin()?;
        let mut texture = self
            .scene
            .defaults
            .texture
            .clone()
            .unwrap_or_else(Texture::plain_default);
        let mut modified = false;

        if let Some(token) = self.next_token()? {
            match &token.kind {
                TokenKind::TypedIdentifier(ValueTag::Texture, name) => {
                    let name = name.clone();
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    if let Value::Texture(t) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                        texture = *t;
                    }
                    modified = true;
                }
                _ => self.unget(token),
            }
        }

        // plain textures allow their parts to be overridden in place
        if matches!(texture.kind, TextureKind::Plain { .. }) {
            loop {
                let Some(token) = self.next_token()? else {
                    return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in texture"));
                };
                let Some(keyword) = token.keyword() else {
                    self.unget(token);
                    break;
                };
                match keyword {
                    Keyword::Pigment => {
                        let parsed = self.parse_pigment()?;
                        if let TextureKind::Plain { pigment, .. } = &mut texture.kind {
                            *pigment = parsed;
                        }
                        modified = true;
                    }
                    Keyword::Normal => {
                        let parsed = self.parse_normal()?;
                        if let TextureKind::Plain { normal, .. } = &mut texture.kind {
                            *normal = Some(parsed);
                        }
                        modified = true;
                    }
                    Keyword::Finish => {
                        let parsed = self.parse_finish()?;
                        if let TextureKind::Plain { finish, .. } = &mut texture.kind {
                            *finish = Some(parsed);
                        }
                        modified = true;
                    }
                    other => {
                        if self.apply_transform_keyword(other, &mut texture.transform)? {
                            modified = true;
                            continue;
                        }
                        self.unget(token);
                        break;
                    }
                }
            }
        }

        if !modified {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in texture"));
            };
            match token.keyword() {
                Some(Keyword::Tiles) => texture = self.parse_tiles()?,
                Some(Keyword::MaterialMap) => texture = self.parse_material_map()?,
                Some(kw) => {
                    if let Some(pattern) = self.parse_pattern_keyword(kw)? {
                        let mut blend = BlendMap::new();
                        let mut modifiers = PatternModifiers::default();
                        let mut transform = Transform::IDENTITY;
                        loop {
                            let Some(inner) = self.next_token()? else {
                                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in texture"));
                            };
                            match inner.keyword() {
                                Some(Keyword::TextureMap) => {
                                    blend = self.parse_blend_map("texture_map", |parser| parser.parse_texture_map_entry())?;
                                }
                                Some(other) => {
                                    if self.parse_pattern_modifier(other, &mut modifiers)? {
                                        continue;
                                    }
                                    if self.apply_transform_keyword(other, &mut transform)? {
                                        continue;
                                    }
                                    self.unget(inner);
                                    break;
                                }
                                None => {
                                    self.unget(inner);
                                    break;
                                }
                            }
                        }
                        texture = Texture {
                            kind: TextureKind::Patterned { pattern, blend },
                            modifiers,
                            transform,
                        };
                    } else {
                        self.unget(token);
                    }
                }
                None => self.unget(token),
            }
        }

        // trailing transforms apply to any texture class
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in texture"));
            };
            match token.keyword() {
                Some(kw) if self.apply_transform_keyword(kw, &mut texture.transform)? => {}
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }

        self.parse_end()?;
        Ok(texture)
    }

    /// A `texture_map` entry: texture identifier or a full nested texture.
    fn parse_texture_map_entry(&mut self) -> ParseResult<Texture> {
        let token = self.expect_token()?;
        match &token.kind {
            TokenKind::TypedIdentifier(ValueTag::Texture, name) => {
                let name = name.clone();
                let found = self.symbols.find(&name).expect("typed identifier resolves");
                match self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                    Value::Texture(t) => Ok(*t),
                    _ => unreachable!("tag promised a texture"),
                }
            }
            TokenKind::Keyword(Keyword::Texture) => self.parse_texture(),
            _ => {
                // inline texture body: pigment/normal/finish items
                self.unget(token);
                let mut texture = Texture::plain_default();
                loop {
                    let Some(inner) = self.next_token()? else {
                        return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in texture_map"));
                    };
                    match inner.keyword() {
                        Some(Keyword::Pigment) => {
                            let parsed = self.parse_pigment()?;
                            if let TextureKind::Plain { pigment, .. } = &mut texture.kind {
                                *pigment = parsed;
                            }
                        }
                        Some(Keyword::Normal) => {
                            let parsed = self.parse_normal()?;
                            if let TextureKind::Plain { normal, .. } = &mut texture.kind {
                                *normal = Some(parsed);
                            }
                        }
                        Some(Keyword::Finish) => {
                            let parsed = self.parse_finish()?;
                            if let TextureKind::Plain { finish, .. } = &mut texture.kind {
                                *finish = Some(parsed);
                            }
                        }
                        _ => {
                            self.unget(inner);
                            break;
                        }
                    }
                }
                Ok(texture)
            }
        }
    }

    /// `tiles { texture { … } tile2 texture { … } }`.
    fn parse_tiles(&mut self) -> ParseResult<Texture> {
        self.parse_begin()?;
        self.expect_keyword(Keyword::Texture, "'texture'")?;
        let even = self.parse_texture()?;
        self.expect_keyword(Keyword::Tile2, "'tile2'")?;
        self.expect_keyword(Keyword::Texture, "'texture'")?;
        let odd = self.parse_texture()?;
        self.parse_end()?;
        Ok(Texture {
            kind: TextureKind::Tiles {
                even: Box::new(even),
                odd: Box::new(odd),
            },
            modifiers: PatternModifiers::default(),
            transform: Transform::IDENTITY,
        })
    }

    /// `material_map { "image" texture { … } texture { … } … }`.
    ///
    /// The image itself is out of scope (the renderer loads it); the source
    /// name and the indexed texture list are recorded.
    fn parse_material_map(&mut self) -> ParseResult<Texture> {
        self.parse_begin()?;
        let source = self.parse_string_value()?;
        let mut textures = Vec::new();
        while self.allow_keyword(Keyword::Texture)? {
            textures.push(self.parse_texture()?);
        }
        if textures.is_empty() {
            return Err(self.error_here(ErrorKind::Parse, "material_map needs at least one texture"));
        }
        self.parse_end()?;
        Ok(Texture {
            kind: TextureKind::MaterialMap { source, textures },
            modifiers: PatternModifiers::default(),
            transform: Transform::IDENTITY,
        })
    }

    // --- interior and material ---

    pub(crate) fn parse_interior(&mut self) -> ParseResult<Interior> {
        self.parse_begin()?;
        let mut interior = Interior::default();
        if let Some(token) = self.next_token()? {
            match &token.kind {
                TokenKind::TypedIdentifier(ValueTag::Interior, name) => {
                    let name = name.clone();
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    if let Value::Interior(i) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                        interior = *i;
                    }
                }
                _ => self.unget(token),
            }
        }
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in interior"));
            };
            match token.keyword() {
                Some(Keyword::Ior) => interior.ior = self.parse_float()?,
                Some(Keyword::Caustics) => interior.caustics = self.parse_float()?,
                Some(Keyword::Dispersion) => interior.dispersion = self.parse_float()?,
                Some(Keyword::FadeDistance) => interior.fade_distance = self.parse_float()?,
                Some(Keyword::FadePower) => interior.fade_power = self.parse_float()?,
                Some(Keyword::FadeColor) => interior.fade_color = self.parse_color_value()?,
                Some(Keyword::Media) => interior.media.push(self.parse_media()?),
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }
        self.parse_end()?;
        Ok(interior)
    }

    pub(crate) fn parse_material(&mut self) -> ParseResult<Material> {
        self.parse_begin()?;
        let mut material = Material::default();
        if let Some(token) = self.next_token()? {
            match &token.kind {
                TokenKind::TypedIdentifier(ValueTag::Material, name) => {
                    let name = name.clone();
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    if let Value::Material(m) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                        material = *m;
                    }
                }
                _ => self.unget(token),
            }
        }
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in material"));
            };
            match token.keyword() {
                Some(Keyword::Texture) => material.texture = Some(self.parse_texture()?),
                Some(Keyword::Interior) => material.interior = Some(self.parse_interior()?),
                Some(kw) => {
                    if self.apply_transform_keyword(kw, &mut material.transform)? {
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
        Ok(material)
    }

    // --- densities (media) ---

    pub(crate) fn parse_density(&mut self) -> ParseResult<Density> {
        self.parse_begin()?;
        let mut density = Density::default();
        if let Some(token) = self.next_token()? {
            match &token.kind {
                TokenKind::TypedIdentifier(ValueTag::Density, name) => {
                    let name = name.clone();
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    if let Value::Density(d) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                        density = *d;
                    }
                }
                _ => self.unget(token),
            }
        }
        self.parse_density_items(&mut density)?;
        self.parse_end()?;
        Ok(density)
    }

    fn parse_density_items(&mut self, density: &mut Density) -> ParseResult<()> {
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in density"));
            };
            match token.keyword() {
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
                    density.kind = DensityKind::Color(self.parse_color_value()?);
                }
                Some(Keyword::ColorMap | Keyword::ColourMap) => {
                    let map = self.parse_color_map()?;
                    if let DensityKind::Pattern { blend, .. } = &mut density.kind {
                        *blend = DensityBlend::Colors(map);
                    } else {
                        return Err(self.error_here(
                            ErrorKind::Parse,
                            "a color map requires a pattern keyword before it",
                        ));
                    }
                }
                Some(Keyword::DensityMap) => {
                    let map = self.parse_blend_map("density_map", |parser| {
                        let mut entry = Density::default();
                        parser.parse_density_items(&mut entry)?;
                        Ok(entry)
                    })?;
                    if let DensityKind::Pattern { blend, .. } = &mut density.kind {
                        *blend = DensityBlend::Densities(map);
                    } else {
                        return Err(self.error_here(
                            ErrorKind::Parse,
                            "a density map requires a pattern keyword before it",
                        ));
                    }
                }
                Some(kw) => {
                    if let Some(pattern) = self.parse_pattern_keyword(kw)? {
                        density.kind = DensityKind::Pattern {
                            pattern,
                            blend: DensityBlend::Colors(BlendMap::new()),
                        };
                        continue;
                    }
                    if self.parse_pattern_modifier(kw, &mut density.modifiers)? {
                        continue;
                    }
                    if self.apply_transform_keyword(kw, &mut density.transform)? {
                        continue;
                    }
                    self.unget(token);
                    return Ok(());
                }
                None => {
                    self.unget(token);
                    return Ok(());
                }
            }
        }
    }

    // --- #default ---

    /// `#default { texture { … } | pigment { … } | finish { … } }`.
    pub(crate) fn parse_default_block(&mut self) -> ParseResult<()> {
        self.parse_begin()?;
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in #default"));
            };
            match token.keyword() {
                Some(Keyword::Texture) => {
                    let texture = self.parse_texture()?;
                    if !texture.is_layerable() {
                        return Err(self.error_here(ErrorKind::Parse, "the default texture must be a plain texture"));
                    }
                    self.scene.defaults.texture = Some(texture);
                }
                Some(Keyword::Pigment) => {
                    let pigment = self.parse_pigment()?;
                    // keep the default texture's pigment in sync
                    if let Some(texture) = &mut self.scene.defaults.texture {
                        if let TextureKind::Plain { pigment: slot, .. } = &mut texture.kind {
                            *slot = pigment.clone();
                        }
                    }
                    self.scene.defaults.pigment = Some(pigment);
                }
                Some(Keyword::Finish) => {
                    let finish = self.parse_finish()?;
                    if let Some(texture) = &mut self.scene.defaults.texture {
                        if let TextureKind::Plain { finish: slot, .. } = &mut texture.kind {
                            *slot = Some(finish.clone());
                        }
                    }
                    self.scene.defaults.finish = Some(finish);
                }
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }
        self.parse_end()?;
        Ok(())
    }
}
