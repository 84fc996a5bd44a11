//! The expression evaluator: parse and evaluate arithmetic over the full
//! tagged-value lattice.
//!
//! Precedence, lowest binding first: `|`, `&`, equality, ordering,
//! additive, multiplicative, `^`, unary, primary. `&` and `|` short-circuit
//! here (unlike inside compiled function bodies). A float broadcasts over a
//! vector or color; element-wise `*` and `/` apply; `vdot` is the explicit
//! dot product.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use smallvec::SmallVec;

use crate::{
    diag::{ErrorKind, ParseResult},
    function::VmContext,
    math::{self, Color, Vec3},
    token::{Keyword, Token, TokenKind},
    value::{ArrayValue, Value, ValueTag},
};

use super::Parser;

/// Binary operator over promoted numeric tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// What followed the `.` of a member access: a component keyword, or a
/// free-form name (a dictionary key).
#[derive(Debug, Clone)]
enum MemberName {
    Keyword(Keyword),
    Name(String),
}

impl Parser<'_> {
    /// Entry point: a full expression, producing a tagged value.
    pub(crate) fn parse_expression(&mut self) -> ParseResult<Value> {
        self.parse_logical_or()
    }

    fn parse_logical_or(&mut self) -> ParseResult<Value> {
        let mut left = self.parse_logical_and()?;
        while self.allow(&TokenKind::Pipe)? {
            let truth = self.truthiness(&left)?;
            if truth {
                // short-circuit: the right side is still parsed (it may
                // contain macro invocations) but its value is discarded
                self.parse_logical_and()?;
                left = Value::Scalar(1.0);
            } else {
                let right = self.parse_logical_and()?;
                left = Value::Scalar(f64::from(self.truthiness(&right)?));
            }
        }
        Ok(left)
    }

    fn parse_logical_and(&mut self) -> ParseResult<Value> {
        let mut left = self.parse_relation()?;
        while self.allow(&TokenKind::Amp)? {
            let truth = self.truthiness(&left)?;
            if truth {
                let right = self.parse_relation()?;
                left = Value::Scalar(f64::from(self.truthiness(&right)?));
            } else {
                self.parse_relation()?;
                left = Value::Scalar(0.0);
            }
        }
        Ok(left)
    }

    fn parse_relation(&mut self) -> ParseResult<Value> {
        let left = self.parse_additive()?;
        let Some(token) = self.next_token()? else {
            return Ok(left);
        };
        let result = match token.kind {
            TokenKind::Equals => {
                let right = self.parse_additive()?;
                Value::Scalar(f64::from(self.values_equal(&left, &right)?))
            }
            TokenKind::NotEquals => {
                let right = self.parse_additive()?;
                Value::Scalar(f64::from(!self.values_equal(&left, &right)?))
            }
            TokenKind::LeftAngle => self.compare_scalars(&left, false, false)?,
            // inside a vector literal, `>` closes the vector
            TokenKind::RightAngle | TokenKind::GreaterEq if self.vector_depth > 0 => {
                self.unget(token);
                return Ok(left);
            }
            TokenKind::RightAngle => self.compare_scalars(&left, true, false)?,
            TokenKind::LessEq => self.compare_scalars(&left, false, true)?,
            TokenKind::GreaterEq => self.compare_scalars(&left, true, true)?,
            _ => {
                self.unget(token);
                return Ok(left);
            }
        };
        Ok(result)
    }

    fn compare_scalars(&mut self, left: &Value, greater: bool, or_equal: bool) -> ParseResult<Value> {
        let right = self.parse_additive()?;
        let a = self.want_scalar(left, "ordering comparison")?;
        let b = self.want_scalar(&right, "ordering comparison")?;
        let result = match (greater, or_equal) {
            (false, false) => a < b,
            (false, true) => a <= b,
            (true, false) => a > b,
            (true, true) => a >= b,
        };
        Ok(Value::Scalar(f64::from(result)))
    }

    fn parse_additive(&mut self) -> ParseResult<Value> {
        let mut left = self.parse_term()?;
        loop {
            if self.allow(&TokenKind::Plus)? {
                let right = self.parse_term()?;
                left = self.numeric_binary(NumOp::Add, &left, &right)?;
            } else if self.allow(&TokenKind::Minus)? {
                let right = self.parse_term()?;
                left = self.numeric_binary(NumOp::Sub, &left, &right)?;
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_term(&mut self) -> ParseResult<Value> {
        let mut left = self.parse_power()?;
        loop {
            if self.allow(&TokenKind::Star)? {
                let right = self.parse_power()?;
                left = self.numeric_binary(NumOp::Mul, &left, &right)?;
            } else if self.allow(&TokenKind::Slash)? {
                let right = self.parse_power()?;
                left = self.numeric_binary(NumOp::Div, &left, &right)?;
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_power(&mut self) -> ParseResult<Value> {
        let left = self.parse_unary()?;
        if self.allow(&TokenKind::Caret)? {
            // right-associative
            let right = self.parse_power()?;
            return self.numeric_binary(NumOp::Pow, &left, &right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult<Value> {
        let token = self.expect_token()?;
        match token.kind {
            TokenKind::Plus => self.parse_unary(),
            TokenKind::Minus => {
                let inner = self.parse_unary()?;
                self.map_components(&inner, |v| -v)
            }
            TokenKind::Bang => {
                let inner = self.parse_unary()?;
                Ok(Value::Scalar(f64::from(!self.truthiness(&inner)?)))
            }
            _ => {
                self.unget(token);
                self.parse_primary()
            }
        }
    }

    fn parse_primary(&mut self) -> ParseResult<Value> {
        let token = self.expect_token()?;
        let value = match token.kind {
            TokenKind::Float(v) => Value::Scalar(v),
            TokenKind::StringLit(s) => Value::String(s),
            TokenKind::LeftParen => {
                let inner = self.parse_expression()?;
                self.expect_kind(&TokenKind::RightParen, "')'")?;
                inner
            }
            TokenKind::LeftAngle => self.parse_vector_literal()?,
            TokenKind::Keyword(keyword) => self.parse_keyword_primary(keyword, &token)?,
            TokenKind::TypedIdentifier(tag, ref name) => {
                let name = name.clone();
                self.parse_identifier_primary(tag, &name)?
            }
            TokenKind::Identifier(ref name) => {
                return Err(self.error_at(
                    ErrorKind::Symbol,
                    token.position,
                    format!("undefined identifier '{name}'"),
                ));
            }
            other => {
                return Err(self.error_at(
                    ErrorKind::Parse,
                    token.position,
                    format!("expected an expression, found {}", other.describe()),
                ));
            }
        };
        self.parse_postfix(value)
    }

    /// Member access and array indexing after a primary.
    fn parse_postfix(&mut self, mut value: Value) -> ParseResult<Value> {
        loop {
            if self.allow(&TokenKind::Period)? {
                value = self.parse_member_access(&value)?;
            } else if matches!(value, Value::Array(_)) {
                if self.allow(&TokenKind::LeftBracket)? {
                    value = self.index_array_value(value)?;
                } else {
                    return Ok(value);
                }
            } else {
                return Ok(value);
            }
        }
    }

    fn index_array_value(&mut self, value: Value) -> ParseResult<Value> {
        let Value::Array(array) = value else { unreachable!() };
        let mut indices = Vec::with_capacity(array.dims.len());
        indices.push(self.parse_array_index(&array, 0)?);
        self.expect_kind(&TokenKind::RightBracket, "']'")?;
        while indices.len() < array.dims.len() {
            self.expect_kind(&TokenKind::LeftBracket, "'['")?;
            indices.push(self.parse_array_index(&array, indices.len())?);
            self.expect_kind(&TokenKind::RightBracket, "']'")?;
        }
        let flat = array
            .flat_index(&indices)
            .ok_or_else(|| self.error_here(ErrorKind::Domain, "array index out of range"))?;
        match &array.elements[flat] {
            Some(element) => Ok(element.copy()),
            None => Err(self.error_here(ErrorKind::Symbol, "array element used before it was assigned")),
        }
    }

    pub(crate) fn parse_array_index(&mut self, array: &ArrayValue, dim: usize) -> ParseResult<usize> {
        let raw = self.parse_float()?;
        let index = raw as i64;
        if index < 0 {
            return Err(self.error_here(ErrorKind::Domain, format!("negative array index {index}")));
        }
        let index = index as usize;
        if dim < array.dims.len() && index >= array.dims[dim] {
            return Err(self.error_here(
                ErrorKind::Domain,
                format!("array index {index} exceeds dimension size {}", array.dims[dim]),
            ));
        }
        Ok(index)
    }

    fn parse_member_access(&mut self, value: &Value) -> ParseResult<Value> {
        let token = self.expect_token()?;
        let member = match &token.kind {
            TokenKind::Keyword(kw) => MemberName::Keyword(*kw),
            TokenKind::Identifier(name) | TokenKind::TypedIdentifier(_, name) => MemberName::Name(name.clone()),
            other => {
                return Err(self.error_at(
                    ErrorKind::Parse,
                    token.position,
                    format!("expected a member name after '.', found {}", other.describe()),
                ));
            }
        };

        if let Value::Dictionary(dict) = value {
            let key = match &member {
                MemberName::Keyword(kw) => {
                    let name: &'static str = (*kw).into();
                    name.to_owned()
                }
                MemberName::Name(name) => name.clone(),
            };
            return match dict.get(&key) {
                Some(entry) => Ok(entry.copy()),
                None => Err(self.error_at(
                    ErrorKind::Symbol,
                    token.position,
                    format!("dictionary has no entry '{key}'"),
                )),
            };
        }

        let MemberName::Keyword(kw) = member else {
            return Err(self.error_at(
                ErrorKind::Type,
                token.position,
                format!("{} has no named members", value.tag()),
            ));
        };
        let scalar = match (value, kw) {
            (Value::Vector2(v), Keyword::X | Keyword::U) => v[0],
            (Value::Vector2(v), Keyword::Y | Keyword::V) => v[1],
            (Value::Vector3(v), Keyword::X | Keyword::U) => v[0],
            (Value::Vector3(v), Keyword::Y | Keyword::V) => v[1],
            (Value::Vector3(v), Keyword::Z) => v[2],
            (Value::Vector4(v), Keyword::X | Keyword::U) => v[0],
            (Value::Vector4(v), Keyword::Y | Keyword::V) => v[1],
            (Value::Vector4(v), Keyword::Z) => v[2],
            (Value::Vector4(v), Keyword::T) => v[3],
            (Value::Color(c), Keyword::Red) => c.red,
            (Value::Color(c), Keyword::Green) => c.green,
            (Value::Color(c), Keyword::Blue) => c.blue,
            (Value::Color(c), Keyword::Filter) => c.filter,
            (Value::Color(c), Keyword::Transmit) => c.transmit,
            (Value::Color(c), Keyword::Gray) => c.gray(),
            _ => {
                let name: &'static str = kw.into();
                return Err(self.error_at(
                    ErrorKind::Type,
                    token.position,
                    format!("{} has no member '.{name}'", value.tag()),
                ));
            }
        };
        Ok(Value::Scalar(scalar))
    }

    /// `<a, b [, c [, d [, e]]]>`: two to five scalar components.
    fn parse_vector_literal(&mut self) -> ParseResult<Value> {
        let components: SmallVec<[f64; 5]> = self.in_vector(|parser| {
            let mut components: SmallVec<[f64; 5]> = SmallVec::new();
            loop {
                components.push(parser.parse_float()?);
                if components.len() > 5 {
                    return Err(parser.error_here(ErrorKind::Parse, "vector literals have at most five components"));
                }
                let token = parser.expect_token()?;
                match token.kind {
                    TokenKind::Comma => {}
                    TokenKind::RightAngle => break,
                    other => {
                        return Err(parser.error_at(
                            ErrorKind::Parse,
                            token.position,
                            format!("expected ',' or '>' in vector, found {}", other.describe()),
                        ));
                    }
                }
            }
            Ok(components)
        })?;
        Ok(match components.len() {
            2 => Value::Vector2([components[0], components[1]]),
            3 => Value::Vector3([components[0], components[1], components[2]]),
            4 => Value::Vector4([components[0], components[1], components[2], components[3]]),
            5 => Value::Color(Color::from_array([
                components[0],
                components[1],
                components[2],
                components[3],
                components[4],
            ])),
            _ => return Err(self.error_here(ErrorKind::Parse, "vector literals need at least two components")),
        })
    }

    fn parse_keyword_primary(&mut self, keyword: Keyword, token: &Token) -> ParseResult<Value> {
        let value = match keyword {
            Keyword::Pi => Value::Scalar(std::f64::consts::PI),
            Keyword::Tau => Value::Scalar(std::f64::consts::TAU),
            Keyword::True | Keyword::Yes | Keyword::On => Value::Scalar(1.0),
            Keyword::False | Keyword::No | Keyword::Off => Value::Scalar(0.0),
            Keyword::Clock => Value::Scalar(self.options.clock),
            Keyword::ClockDelta => Value::Scalar(self.options.clock_delta),
            Keyword::Version => Value::Scalar(f64::from(self.scene.language_version) / 100.0),
            Keyword::X => Value::Vector3([1.0, 0.0, 0.0]),
            Keyword::Y => Value::Vector3([0.0, 1.0, 0.0]),
            Keyword::Z => Value::Vector3([0.0, 0.0, 1.0]),
            Keyword::U => Value::Vector2([1.0, 0.0]),
            Keyword::V => Value::Vector2([0.0, 1.0]),
            Keyword::T => Value::Vector4([0.0, 0.0, 0.0, 1.0]),
            Keyword::Rgb => self.parse_color_after_prefix(3, false, false)?,
            Keyword::Rgbf => self.parse_color_after_prefix(4, true, false)?,
            Keyword::Rgbt => self.parse_color_after_prefix(4, false, true)?,
            Keyword::Rgbft => self.parse_color_after_prefix(5, false, false)?,
            Keyword::Color => Value::Color(self.parse_color_body()?),
            Keyword::Function => {
                // an anonymous inline function in an expression context is
                // compiled and immediately becomes a Function value
                return Ok(Value::Function(self.parse_function_block(None)?));
            }
            Keyword::Sum | Keyword::Prod => {
                return Err(self.error_at(
                    ErrorKind::Parse,
                    token.position,
                    "'sum' and 'prod' are only valid inside function bodies",
                ));
            }
            other if intrinsic_arity(other).is_some() => self.call_intrinsic(other)?,
            other => {
                let name: &'static str = other.into();
                return Err(self.error_at(
                    ErrorKind::Parse,
                    token.position,
                    format!("keyword '{name}' cannot start an expression"),
                ));
            }
        };
        Ok(value)
    }

    /// `rgb`-family: the payload is a following factor promoted to the
    /// channel count, so `rgb <1,0,0> + rgb <0,1,0>` adds as colors.
    fn parse_color_after_prefix(&mut self, components: usize, filter: bool, transmit: bool) -> ParseResult<Value> {
        let raw = self.parse_unary()?;
        let color = match (components, &raw) {
            (3, _) => {
                let v = raw
                    .as_vec3()
                    .ok_or_else(|| self.error_here(ErrorKind::Type, "rgb expects a scalar or three-component vector"))?;
                Color::rgb(v[0], v[1], v[2])
            }
            (4, Value::Vector4(v)) => Color {
                red: v[0],
                green: v[1],
                blue: v[2],
                filter: if filter { v[3] } else { 0.0 },
                transmit: if transmit { v[3] } else { 0.0 },
            },
            (4, Value::Scalar(s)) => Color {
                red: *s,
                green: *s,
                blue: *s,
                filter: if filter { *s } else { 0.0 },
                transmit: if transmit { *s } else { 0.0 },
            },
            (5, Value::Color(c)) => *c,
            (5, Value::Scalar(s)) => Color::splat(*s),
            _ => {
                return Err(self.error_here(
                    ErrorKind::Type,
                    format!("color prefix expects a {components}-component vector"),
                ));
            }
        };
        Ok(Value::Color(color))
    }

    /// The body of `color …`: keyword items, a color identifier, a vector,
    /// or any expression evaluating to a color.
    pub(crate) fn parse_color_body(&mut self) -> ParseResult<Color> {
        let mut color = Color::default();
        let mut seen_item = false;
        loop {
            let Some(token) = self.next_token()? else {
                break;
            };
            match token.kind {
                TokenKind::Keyword(Keyword::Color) => {}
                TokenKind::Keyword(Keyword::Red) => {
                    color.red = self.parse_float()?;
                    seen_item = true;
                }
                TokenKind::Keyword(Keyword::Green) => {
                    color.green = self.parse_float()?;
                    seen_item = true;
                }
                TokenKind::Keyword(Keyword::Blue) => {
                    color.blue = self.parse_float()?;
                    seen_item = true;
                }
                TokenKind::Keyword(Keyword::Filter) => {
                    color.filter = self.parse_float()?;
                    seen_item = true;
                }
                TokenKind::Keyword(Keyword::Transmit) => {
                    color.transmit = self.parse_float()?;
                    seen_item = true;
                }
                TokenKind::Keyword(Keyword::Rgb | Keyword::Rgbf | Keyword::Rgbt | Keyword::Rgbft)
                | TokenKind::LeftAngle
                    if !seen_item =>
                {
                    self.unget(token);
                    let value = self.parse_expression()?;
                    return value
                        .as_color()
                        .ok_or_else(|| self.error_here(ErrorKind::Type, "expected a color"));
                }
                TokenKind::TypedIdentifier(ValueTag::Color, _) if !seen_item => {
                    self.unget(token);
                    let value = self.parse_expression()?;
                    return value
                        .as_color()
                        .ok_or_else(|| self.error_here(ErrorKind::Type, "expected a color"));
                }
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }
        Ok(color)
    }

    /// A color in a builder context: keyword form, `rgb` form, identifier,
    /// or expression.
    pub(crate) fn parse_color_value(&mut self) -> ParseResult<Color> {
        let token = self.expect_token()?;
        match &token.kind {
            TokenKind::Keyword(
                Keyword::Color | Keyword::Red | Keyword::Green | Keyword::Blue | Keyword::Filter | Keyword::Transmit,
            ) => {
                self.unget(token);
                self.parse_color_body()
            }
            _ => {
                self.unget(token);
                let value = self.parse_expression()?;
                value
                    .as_color()
                    .ok_or_else(|| self.error_here(ErrorKind::Type, format!("expected a color, found {}", value.tag())))
            }
        }
    }

    fn parse_identifier_primary(&mut self, tag: ValueTag, name: &str) -> ParseResult<Value> {
        match tag {
            ValueTag::Macro => {
                self.invoke_macro(name)?;
                // the macro body is now the token stream; its expansion
                // continues this expression
                self.parse_primary()
            }
            ValueTag::Function => {
                let found = self.symbols.find(name).expect("typed identifier resolves");
                let Value::Function(function) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))?
                else {
                    unreachable!("tag promised a function")
                };
                if self.allow(&TokenKind::LeftParen)? {
                    self.evaluate_function_call(function, name)
                } else {
                    Ok(Value::Function(function))
                }
            }
            ValueTag::Spline => {
                let found = self.symbols.find(name).expect("typed identifier resolves");
                let Value::Spline(spline) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? else {
                    unreachable!("tag promised a spline")
                };
                if self.allow(&TokenKind::LeftParen)? {
                    let t = self.parse_float()?;
                    self.expect_kind(&TokenKind::RightParen, "')'")?;
                    let out = spline.evaluate(t);
                    Ok(components_to_value(&out))
                } else {
                    Ok(Value::Spline(spline))
                }
            }
            ValueTag::RandomStream => {
                let found = self.symbols.find(name).expect("typed identifier resolves");
                self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))
            }
            _ => {
                let found = self.symbols.find(name).expect("typed identifier resolves");
                self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))
            }
        }
    }

    /// Evaluates a compiled user function at parse time.
    pub(crate) fn evaluate_function_call(&mut self, function: crate::function::FunctionId, name: &str) -> ParseResult<Value> {
        let expected = self.scene.functions.get(function).parameters.len();
        let mut args: SmallVec<[f64; 4]> = SmallVec::new();
        if !self.allow(&TokenKind::RightParen)? {
            loop {
                args.push(self.parse_float()?);
                if !self.allow(&TokenKind::Comma)? {
                    break;
                }
            }
            self.expect_kind(&TokenKind::RightParen, "')'")?;
        }
        if args.len() != expected {
            return Err(self.error_here(
                ErrorKind::Parse,
                format!(
                    "invalid number of parameters for '{name}': {} supplied, {expected} required",
                    args.len()
                ),
            ));
        }
        let mut context = VmContext::new();
        let registry = &self.scene.functions;
        if registry.get(function).return_size == 0 {
            let out = context
                .run_scalar(registry, function, &args)
                .map_err(|e| self.error_here(ErrorKind::Runtime, e.to_string()))?;
            Ok(Value::Scalar(out))
        } else {
            let out = context
                .run_vector(registry, function, &args)
                .map_err(|e| self.error_here(ErrorKind::Runtime, e.to_string()))?;
            Ok(components_to_value(&out))
        }
    }

    // --- intrinsic evaluation ---

    fn call_intrinsic(&mut self, keyword: Keyword) -> ParseResult<Value> {
        let name: &'static str = keyword.into();
        self.expect_kind(&TokenKind::LeftParen, &format!("'(' after '{name}'"))?;

        // special forms first: they take identifiers, not values
        match keyword {
            Keyword::Defined => {
                let result = self.parse_defined()?;
                self.expect_kind(&TokenKind::RightParen, "')'")?;
                return Ok(Value::Scalar(f64::from(result)));
            }
            Keyword::Dimensions => {
                let array = self.parse_array_argument()?;
                self.expect_kind(&TokenKind::RightParen, "')'")?;
                return Ok(Value::Scalar(array.dims.len() as f64));
            }
            Keyword::DimensionSize => {
                let array = self.parse_array_argument()?;
                self.parse_comma()?;
                let dim = self.parse_float()? as usize;
                self.expect_kind(&TokenKind::RightParen, "')'")?;
                let size = if dim >= 1 && dim <= array.dims.len() {
                    array.dims[dim - 1] as f64
                } else {
                    0.0
                };
                return Ok(Value::Scalar(size));
            }
            _ => {}
        }

        let mut args: SmallVec<[Value; 4]> = SmallVec::new();
        if !self.allow(&TokenKind::RightParen)? {
            loop {
                args.push(self.parse_expression()?);
                if !self.allow(&TokenKind::Comma)? {
                    break;
                }
            }
            self.expect_kind(&TokenKind::RightParen, "')'")?;
        }
        let (min, max) = intrinsic_arity(keyword).expect("caller checked this is an intrinsic");
        if args.len() < min || args.len() > max {
            return Err(self.error_here(
                ErrorKind::Parse,
                format!("invalid number of parameters for '{name}'"),
            ));
        }
        self.apply_intrinsic(keyword, name, &args)
    }

    fn apply_intrinsic(&mut self, keyword: Keyword, name: &str, args: &[Value]) -> ParseResult<Value> {
        let scalar = |parser: &Self, i: usize| parser.want_scalar(&args[i], name);
        let vector = |parser: &Self, i: usize| -> ParseResult<Vec3> {
            args[i]
                .as_vec3()
                .ok_or_else(|| parser.error_here(ErrorKind::Type, format!("'{name}' expects a vector argument")))
        };
        let string = |parser: &Self, i: usize| -> ParseResult<&str> {
            match &args[i] {
                Value::String(s) => Ok(s.as_str()),
                other => Err(parser.error_here(
                    ErrorKind::Type,
                    format!("'{name}' expects a string argument, found {}", other.tag()),
                )),
            }
        };

        let value = match keyword {
            Keyword::Sin => Value::Scalar(scalar(self, 0)?.sin()),
            Keyword::Cos => Value::Scalar(scalar(self, 0)?.cos()),
            Keyword::Tan => Value::Scalar(scalar(self, 0)?.tan()),
            Keyword::Asin => Value::Scalar(scalar(self, 0)?.asin()),
            Keyword::Acos => Value::Scalar(scalar(self, 0)?.acos()),
            Keyword::Atan => Value::Scalar(scalar(self, 0)?.atan()),
            Keyword::Atan2 => Value::Scalar(scalar(self, 0)?.atan2(scalar(self, 1)?)),
            Keyword::Sinh => Value::Scalar(scalar(self, 0)?.sinh()),
            Keyword::Cosh => Value::Scalar(scalar(self, 0)?.cosh()),
            Keyword::Tanh => Value::Scalar(scalar(self, 0)?.tanh()),
            Keyword::Asinh => Value::Scalar(scalar(self, 0)?.asinh()),
            Keyword::Acosh => Value::Scalar(scalar(self, 0)?.acosh()),
            Keyword::Atanh => Value::Scalar(scalar(self, 0)?.atanh()),
            Keyword::Pow => {
                let base = scalar(self, 0)?;
                let exponent = scalar(self, 1)?;
                if base == 0.0 && exponent == 0.0 {
                    return Err(self.error_here(ErrorKind::Domain, "0 raised to the power 0"));
                }
                Value::Scalar(base.powf(exponent))
            }
            Keyword::Log => {
                let v = scalar(self, 0)?;
                if v <= 0.0 {
                    return Err(self.error_here(ErrorKind::Domain, "logarithm of non-positive value"));
                }
                Value::Scalar(v.log10())
            }
            Keyword::Ln => {
                let v = scalar(self, 0)?;
                if v <= 0.0 {
                    return Err(self.error_here(ErrorKind::Domain, "logarithm of non-positive value"));
                }
                Value::Scalar(v.ln())
            }
            Keyword::Exp => Value::Scalar(scalar(self, 0)?.exp()),
            Keyword::Sqrt => Value::Scalar(scalar(self, 0)?.sqrt()),
            Keyword::Sqr => {
                let v = scalar(self, 0)?;
                Value::Scalar(v * v)
            }
            Keyword::Abs => self.map_components(&args[0], f64::abs)?,
            Keyword::Floor => Value::Scalar(scalar(self, 0)?.floor()),
            Keyword::Ceil => Value::Scalar(scalar(self, 0)?.ceil()),
            Keyword::Int => Value::Scalar(scalar(self, 0)?.trunc()),
            Keyword::Mod => {
                let b = scalar(self, 1)?;
                if b == 0.0 {
                    return Err(self.error_here(ErrorKind::Domain, "modulo by zero"));
                }
                Value::Scalar(scalar(self, 0)? % b)
            }
            Keyword::Div => {
                let b = scalar(self, 1)?;
                if b == 0.0 {
                    return Err(self.error_here(ErrorKind::Domain, "division by zero"));
                }
                Value::Scalar((scalar(self, 0)? / b).trunc())
            }
            Keyword::Select => {
                let c = scalar(self, 0)?;
                let picked = if c < 0.0 {
                    &args[1]
                } else if c == 0.0 || args.len() == 3 {
                    &args[2]
                } else {
                    &args[3]
                };
                picked.copy()
            }
            Keyword::Min => {
                let mut best = scalar(self, 0)?;
                for i in 1..args.len() {
                    best = best.min(scalar(self, i)?);
                }
                Value::Scalar(best)
            }
            Keyword::Max => {
                let mut best = scalar(self, 0)?;
                for i in 1..args.len() {
                    best = best.max(scalar(self, i)?);
                }
                Value::Scalar(best)
            }
            Keyword::Radians => Value::Scalar(scalar(self, 0)?.to_radians()),
            Keyword::Degrees => Value::Scalar(scalar(self, 0)?.to_degrees()),
            Keyword::Vlength => Value::Scalar(math::vlength(vector(self, 0)?)),
            Keyword::Vnormalize => {
                let v = vector(self, 0)?;
                let n = math::vnormalize(v)
                    .ok_or_else(|| self.error_here(ErrorKind::Domain, "cannot normalize a zero-length vector"))?;
                Value::Vector3(n)
            }
            Keyword::Vdot => Value::Scalar(math::vdot(vector(self, 0)?, vector(self, 1)?)),
            Keyword::Vcross => Value::Vector3(math::vcross(vector(self, 0)?, vector(self, 1)?)),
            Keyword::Vrotate => Value::Vector3(math::vrotate(vector(self, 0)?, vector(self, 1)?)),
            Keyword::VaxisRotate => {
                let axis = vector(self, 1)?;
                if math::vlength(axis) == 0.0 {
                    return Err(self.error_here(ErrorKind::Domain, "vaxis_rotate requires a non-zero axis"));
                }
                Value::Vector3(math::vaxis_rotate(vector(self, 0)?, axis, scalar(self, 2)?))
            }
            Keyword::Vturbulence => Value::Vector3(math::vturbulence(
                scalar(self, 0)?,
                scalar(self, 1)?,
                scalar(self, 2)?,
                vector(self, 3)?,
            )),
            Keyword::Str => {
                let value = scalar(self, 0)?;
                let width = scalar(self, 1)? as i64;
                let precision = scalar(self, 2)? as i64;
                Value::String(format_float(value, width, precision))
            }
            Keyword::Concat => {
                let mut out = String::new();
                for i in 0..args.len() {
                    out.push_str(string(self, i)?);
                }
                Value::String(out)
            }
            Keyword::Strlen => Value::Scalar(string(self, 0)?.chars().count() as f64),
            Keyword::Substr => {
                let s = string(self, 0)?;
                let start = scalar(self, 1)? as usize;
                let length = scalar(self, 2)? as usize;
                if start < 1 || start + length > s.chars().count() + 1 {
                    return Err(self.error_here(ErrorKind::Domain, "substr range exceeds string length"));
                }
                Value::String(s.chars().skip(start - 1).take(length).collect())
            }
            Keyword::Strupr => Value::String(string(self, 0)?.to_uppercase()),
            Keyword::Strlwr => Value::String(string(self, 0)?.to_lowercase()),
            Keyword::Chr => {
                let code = scalar(self, 0)? as u32;
                let c = char::from_u32(code)
                    .ok_or_else(|| self.error_here(ErrorKind::Domain, format!("chr({code}) is not a valid character")))?;
                Value::String(c.to_string())
            }
            Keyword::Asc => {
                let s = string(self, 0)?;
                let c = s
                    .chars()
                    .next()
                    .ok_or_else(|| self.error_here(ErrorKind::Domain, "asc of an empty string"))?;
                Value::Scalar(f64::from(c as u32))
            }
            Keyword::Val => {
                let s = string(self, 0)?;
                let v = s
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| self.error_here(ErrorKind::Type, format!("val cannot parse '{s}' as a number")))?;
                Value::Scalar(v)
            }
            Keyword::Datetime => {
                let days = scalar(self, 0)?;
                let format = if args.len() > 1 {
                    string(self, 1)?.to_owned()
                } else {
                    "%Y-%m-%d %H:%M:%SZ".to_owned()
                };
                Value::String(format_datetime(days, &format).map_err(|m| self.error_here(ErrorKind::Domain, m))?)
            }
            Keyword::Seed => {
                let seed = scalar(self, 0)?;
                let stream = ChaCha8Rng::seed_from_u64(seed as u64);
                let index = u32::try_from(self.random_streams.len())
                    .map_err(|_| self.error_here(ErrorKind::Resource, "too many random streams"))?;
                self.random_streams.push(stream);
                Value::RandomStream(index)
            }
            Keyword::Rand => match &args[0] {
                Value::RandomStream(index) => {
                    let stream = self
                        .random_streams
                        .get_mut(*index as usize)
                        .expect("random stream indices are never dropped");
                    Value::Scalar(stream.r#gen::<f64>())
                }
                other => {
                    return Err(self.error_here(
                        ErrorKind::Type,
                        format!("'rand' expects a random stream from seed(), found {}", other.tag()),
                    ));
                }
            },
            _ => unreachable!("intrinsic_arity admitted a non-intrinsic"),
        };
        Ok(value)
    }

    /// `defined(name)`, including `dict.key` and `arr[i]` forms.
    pub(crate) fn parse_defined(&mut self) -> ParseResult<bool> {
        let token = self.expect_token()?;
        let defined = match &token.kind {
            TokenKind::Identifier(_) => false,
            TokenKind::TypedIdentifier(tag, name) => {
                let name = name.clone();
                let tag = *tag;
                if self.allow(&TokenKind::Period)? {
                    // descend into a dictionary entry
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    let value = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))?;
                    match self.parse_member_access(&value) {
                        Ok(v) => v.is_defined(),
                        Err(_) => false,
                    }
                } else if self.allow(&TokenKind::LeftBracket)? {
                    let found = self.symbols.find(&name).expect("typed identifier resolves");
                    let value = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))?;
                    match value {
                        Value::Array(array) => {
                            let mut indices = Vec::new();
                            indices.push(self.parse_array_index(&array, 0)?);
                            self.expect_kind(&TokenKind::RightBracket, "']'")?;
                            while indices.len() < array.dims.len() && self.allow(&TokenKind::LeftBracket)? {
                                indices.push(self.parse_array_index(&array, indices.len())?);
                                self.expect_kind(&TokenKind::RightBracket, "']'")?;
                            }
                            array
                                .flat_index(&indices)
                                .is_some_and(|flat| array.elements[flat].is_some())
                        }
                        _ => false,
                    }
                } else {
                    tag != ValueTag::Undefined
                }
            }
            // reserved words count as "defined" (they name something)
            TokenKind::Keyword(_) => true,
            other => {
                return Err(self.error_at(
                    ErrorKind::Parse,
                    token.position,
                    format!("expected an identifier in defined(), found {}", other.describe()),
                ));
            }
        };
        Ok(defined)
    }

    fn parse_array_argument(&mut self) -> ParseResult<Box<ArrayValue>> {
        let token = self.expect_token()?;
        match &token.kind {
            TokenKind::TypedIdentifier(ValueTag::Array, name) => {
                let name = name.clone();
                let found = self.symbols.find(&name).expect("typed identifier resolves");
                match self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                    Value::Array(array) => Ok(array),
                    _ => unreachable!("tag promised an array"),
                }
            }
            other => Err(self.error_at(
                ErrorKind::Type,
                token.position,
                format!("expected an array identifier, found {}", other.describe()),
            )),
        }
    }

    // --- numeric machinery ---

    pub(crate) fn want_scalar(&self, value: &Value, what: &str) -> ParseResult<f64> {
        value
            .as_scalar()
            .ok_or_else(|| self.error_here(ErrorKind::Type, format!("{what} expects a scalar, found {}", value.tag())))
    }

    pub(crate) fn truthiness(&self, value: &Value) -> ParseResult<bool> {
        Ok(self.want_scalar(value, "logical operator")? != 0.0)
    }

    fn values_equal(&self, left: &Value, right: &Value) -> ParseResult<bool> {
        match (left, right) {
            (Value::String(a), Value::String(b)) => Ok(a == b),
            _ => {
                let (a, b, _) = self.promote_pair(left, right)?;
                Ok(a == b)
            }
        }
    }

    fn map_components(&self, value: &Value, op: impl Fn(f64) -> f64) -> ParseResult<Value> {
        Ok(match value {
            Value::Scalar(v) => Value::Scalar(op(*v)),
            Value::Vector2(v) => Value::Vector2([op(v[0]), op(v[1])]),
            Value::Vector3(v) => Value::Vector3([op(v[0]), op(v[1]), op(v[2])]),
            Value::Vector4(v) => Value::Vector4([op(v[0]), op(v[1]), op(v[2]), op(v[3])]),
            Value::Color(c) => Value::Color(c.zip(Color::default(), |a, _| op(a))),
            other => {
                return Err(self.error_here(
                    ErrorKind::Type,
                    format!("numeric operation applied to {}", other.tag()),
                ));
            }
        })
    }

    /// Promotes both operands to a common component count. Scalars
    /// broadcast; shorter vectors zero-extend; anything meeting a color
    /// becomes a color.
    fn promote_pair(&self, left: &Value, right: &Value) -> ParseResult<(SmallVec<[f64; 5]>, SmallVec<[f64; 5]>, usize)> {
        let comps = |v: &Value| -> Option<(SmallVec<[f64; 5]>, usize, bool)> {
            Some(match v {
                Value::Scalar(s) => (SmallVec::from_slice(&[*s]), 1, false),
                Value::Vector2(v) => (SmallVec::from_slice(v), 2, false),
                Value::Vector3(v) => (SmallVec::from_slice(v), 3, false),
                Value::Vector4(v) => (SmallVec::from_slice(v), 4, false),
                Value::Color(c) => (SmallVec::from_slice(&c.to_array()), 5, true),
                _ => return None,
            })
        };
        let (a, a_len, a_color) = comps(left).ok_or_else(|| {
            self.error_here(
                ErrorKind::Type,
                format!("arithmetic operand must be numeric, found {}", left.tag()),
            )
        })?;
        let (b, b_len, b_color) = comps(right).ok_or_else(|| {
            self.error_here(
                ErrorKind::Type,
                format!("arithmetic operand must be numeric, found {}", right.tag()),
            )
        })?;
        let is_color = a_color || b_color;
        let len = if is_color { 5 } else { a_len.max(b_len) };
        let extend = |src: SmallVec<[f64; 5]>, src_len: usize| -> SmallVec<[f64; 5]> {
            let mut out: SmallVec<[f64; 5]> = SmallVec::with_capacity(len);
            for i in 0..len {
                out.push(if src_len == 1 {
                    src[0]
                } else {
                    src.get(i).copied().unwrap_or(0.0)
                });
            }
            out
        };
        Ok((extend(a, a_len), extend(b, b_len), len))
    }

    fn numeric_binary(&self, op: NumOp, left: &Value, right: &Value) -> ParseResult<Value> {
        let is_color = matches!(left, Value::Color(_)) || matches!(right, Value::Color(_));
        let (a, b, len) = self.promote_pair(left, right)?;
        let mut out: SmallVec<[f64; 5]> = SmallVec::with_capacity(len);
        for i in 0..len {
            let value = match op {
                NumOp::Add => a[i] + b[i],
                NumOp::Sub => a[i] - b[i],
                NumOp::Mul => a[i] * b[i],
                NumOp::Div => {
                    if b[i] == 0.0 {
                        return Err(self.error_here(ErrorKind::Domain, "division by zero"));
                    }
                    a[i] / b[i]
                }
                NumOp::Pow => {
                    if a[i] == 0.0 && b[i] == 0.0 {
                        return Err(self.error_here(ErrorKind::Domain, "0 raised to the power 0"));
                    }
                    a[i].powf(b[i])
                }
            };
            out.push(value);
        }
        Ok(if is_color {
            Value::Color(Color::from_array([out[0], out[1], out[2], out[3], out[4]]))
        } else {
            components_to_value(&out)
        })
    }

    // --- typed parse helpers used throughout the builders ---

    pub(crate) fn parse_float(&mut self) -> ParseResult<f64> {
        let value = self.parse_expression()?;
        self.want_scalar(&value, "this context")
    }

    pub(crate) fn parse_u32(&mut self, what: &str) -> ParseResult<u32> {
        let raw = self.parse_float()?;
        if raw < 0.0 {
            return Err(self.error_here(ErrorKind::Domain, format!("{what} cannot be negative")));
        }
        Ok(raw as u32)
    }

    pub(crate) fn parse_vector(&mut self) -> ParseResult<Vec3> {
        let value = self.parse_expression()?;
        value
            .as_vec3()
            .ok_or_else(|| self.error_here(ErrorKind::Type, format!("expected a vector, found {}", value.tag())))
    }

    pub(crate) fn parse_vector2(&mut self) -> ParseResult<[f64; 2]> {
        let value = self.parse_expression()?;
        match value {
            Value::Scalar(s) => Ok([s, s]),
            Value::Vector2(v) => Ok(v),
            other => Err(self.error_here(ErrorKind::Type, format!("expected a 2d vector, found {}", other.tag()))),
        }
    }

    pub(crate) fn parse_vector4(&mut self) -> ParseResult<[f64; 4]> {
        let value = self.parse_expression()?;
        match value {
            Value::Scalar(s) => Ok([s; 4]),
            Value::Vector4(v) => Ok(v),
            other => Err(self.error_here(ErrorKind::Type, format!("expected a 4d vector, found {}", other.tag()))),
        }
    }

    /// A scale vector: zero components are forced to 1 with a warning.
    pub(crate) fn parse_scale_vector(&mut self) -> ParseResult<Vec3> {
        let mut v = self.parse_vector()?;
        for component in &mut v {
            if *component == 0.0 {
                *component = 1.0;
                self.warn("zero scale component changed to 1.0");
            }
        }
        Ok(v)
    }

    pub(crate) fn parse_string_value(&mut self) -> ParseResult<String> {
        let value = self.parse_expression()?;
        match value {
            Value::String(s) => Ok(s),
            other => Err(self.error_here(ErrorKind::Type, format!("expected a string, found {}", other.tag()))),
        }
    }
}

/// Packs promoted components back into the narrowest matching value.
pub(crate) fn components_to_value(components: &[f64]) -> Value {
    match components.len() {
        1 => Value::Scalar(components[0]),
        2 => Value::Vector2([components[0], components[1]]),
        3 => Value::Vector3([components[0], components[1], components[2]]),
        4 => Value::Vector4([components[0], components[1], components[2], components[3]]),
        _ => Value::Color(Color::from_array([
            components[0],
            components[1],
            components[2],
            components[3],
            components[4],
        ])),
    }
}

/// `str(value, width, precision)` formatting: positive width pads with
/// spaces, negative width pads with zeros, negative precision means
/// shortest round-trip form.
fn format_float(value: f64, width: i64, precision: i64) -> String {
    let body = if precision >= 0 {
        format!("{value:.prec$}", prec = precision as usize)
    } else {
        let mut buffer = ryu::Buffer::new();
        let printed = buffer.format(value);
        // ryu prints integral values as "1.0"; keep that, it round-trips
        printed.to_owned()
    };
    if width > 0 {
        format!("{body:>width$}", width = width as usize)
    } else if width < 0 {
        let want = (-width) as usize;
        if body.len() >= want {
            body
        } else {
            let negative = body.starts_with('-');
            let digits = if negative { &body[1..] } else { &body[..] };
            let zeros = "0".repeat(want - body.len());
            if negative {
                format!("-{zeros}{digits}")
            } else {
                format!("{zeros}{digits}")
            }
        }
    } else {
        body
    }
}

/// `datetime(days[, format])`: days are relative to 2000-01-01 00:00 UTC.
fn format_datetime(days: f64, format: &str) -> Result<String, String> {
    use chrono::TimeZone;
    let seconds = days * 86_400.0;
    if !seconds.is_finite() || seconds.abs() > 1e15 {
        return Err("datetime value out of range".to_owned());
    }
    let epoch = chrono::Utc
        .with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .expect("epoch is valid");
    let when = epoch + chrono::Duration::milliseconds((seconds * 1000.0) as i64);
    Ok(when.format(format).to_string())
}

/// Arity table for the intrinsic functions: `(min, max)` argument counts.
fn intrinsic_arity(keyword: Keyword) -> Option<(usize, usize)> {
    Some(match keyword {
        Keyword::Sin
        | Keyword::Cos
        | Keyword::Tan
        | Keyword::Asin
        | Keyword::Acos
        | Keyword::Atan
        | Keyword::Sinh
        | Keyword::Cosh
        | Keyword::Tanh
        | Keyword::Asinh
        | Keyword::Acosh
        | Keyword::Atanh
        | Keyword::Log
        | Keyword::Ln
        | Keyword::Exp
        | Keyword::Sqrt
        | Keyword::Sqr
        | Keyword::Abs
        | Keyword::Floor
        | Keyword::Ceil
        | Keyword::Int
        | Keyword::Radians
        | Keyword::Degrees
        | Keyword::Vlength
        | Keyword::Vnormalize
        | Keyword::Strlen
        | Keyword::Strupr
        | Keyword::Strlwr
        | Keyword::Chr
        | Keyword::Asc
        | Keyword::Val
        | Keyword::Seed
        | Keyword::Rand
        | Keyword::Defined
        | Keyword::Dimensions => (1, 1),
        Keyword::Atan2 | Keyword::Pow | Keyword::Mod | Keyword::Div | Keyword::Vdot | Keyword::Vcross
        | Keyword::Vrotate | Keyword::DimensionSize => (2, 2),
        Keyword::VaxisRotate | Keyword::Str | Keyword::Substr => (3, 3),
        Keyword::Select => (3, 4),
        Keyword::Min | Keyword::Max => (2, usize::MAX),
        Keyword::Concat => (2, usize::MAX),
        Keyword::Vturbulence => (4, 4),
        Keyword::Datetime => (1, 2),
        _ => return None,
    })
}
