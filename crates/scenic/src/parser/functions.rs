//! Parsing of `function { … }` blocks and user-function declarations.
//!
//! The body is parsed into an [`FnExpr`] tree with identifiers resolved on
//! the spot: parameters and `sum`/`prod` loop variables stay symbolic,
//! declared floats fold to constants, declared functions become calls, and
//! macros expand inline. The finished tree goes through
//! [`FnCompiler`](crate::function::compiler::FnCompiler) and the byte-code
//! is installed in the scene's function registry.

use smallvec::SmallVec;

use crate::{
    diag::{ErrorKind, ParseResult},
    function::{
        FunctionCode, FunctionId,
        compiler::FnCompiler,
        expr::{FnBinOp, FnExpr, FnMember},
        op,
    },
    token::{Keyword, Token, TokenKind},
    value::{Value, ValueTag},
};

use super::Parser;

/// Name-resolution context while a function body is being parsed.
struct FnScope {
    /// Declared parameter names.
    parameters: SmallVec<[String; 4]>,
    /// Active `sum`/`prod` loop variables, innermost last.
    locals: Vec<String>,
    /// The function's own name and placeholder id, for recursion.
    own: Option<(String, FunctionId)>,
}

impl FnScope {
    fn resolves(&self, name: &str) -> bool {
        self.locals.iter().any(|l| l == name)
            || self.parameters.iter().any(|p| p == name)
            || matches!(name, "x" | "y" | "z" | "u" | "v")
    }
}

impl Parser<'_> {
    /// Parses a function after its `function` keyword: optional parameter
    /// list, then `{ body }`. Returns the installed function id.
    ///
    /// `name` is the declared name (`#declare f = function …`), or `None`
    /// for anonymous functions in expression or object contexts.
    pub(crate) fn parse_function_block(&mut self, name: Option<&str>) -> ParseResult<FunctionId> {
        let position = self.lexer.position();
        let source_file = self.lexer.file_name(position.stream).to_owned();
        let display_name = name.unwrap_or("").to_owned();

        let mut parameters: SmallVec<[String; 4]> = SmallVec::new();
        if self.allow(&TokenKind::LeftParen)? {
            loop {
                let token = self.expect_token()?;
                let Some(param) = parameter_name(&token) else {
                    return Err(self.error_at(
                        ErrorKind::Parse,
                        token.position,
                        format!("expected a parameter identifier, found {}", token.kind.describe()),
                    ));
                };
                parameters.push(param);
                if !self.allow(&TokenKind::Comma)? {
                    break;
                }
            }
            self.expect_kind(&TokenKind::RightParen, "')'")?;
            if parameters.is_empty() {
                return Err(self.error_here(ErrorKind::Parse, "at least one function parameter is required"));
            }
        }

        // pre-install a placeholder so the body can name itself
        let placeholder = FunctionCode {
            name: display_name.clone(),
            source_file: source_file.clone(),
            position,
            parameters: if parameters.is_empty() {
                SmallVec::from_vec(vec!["x".to_owned(), "y".to_owned(), "z".to_owned()])
            } else {
                parameters.clone()
            },
            return_size: 0,
            program: Vec::new(),
        };
        let id = self.scene.functions.install(placeholder);

        let mut scope = FnScope {
            parameters: if parameters.is_empty() {
                SmallVec::from_vec(vec!["x".to_owned(), "y".to_owned(), "z".to_owned()])
            } else {
                parameters.clone()
            },
            locals: Vec::new(),
            own: name.map(|n| (n.to_owned(), id)),
        };

        self.parse_begin()?;
        let body = self.parse_fn_body(&mut scope)?;
        self.parse_end()?;

        let compiler = FnCompiler::new(&mut self.scene.functions, display_name, source_file, position, parameters);
        let (code, warnings) = compiler.compile(&body)?;
        for warning in warnings {
            self.warn(warning);
        }
        self.scene.functions.update(id, code);
        Ok(id)
    }

    /// The whole body: either a vector literal (vector-valued function) or
    /// a scalar expression.
    fn parse_fn_body(&mut self, scope: &mut FnScope) -> ParseResult<FnExpr> {
        if self.allow(&TokenKind::LeftAngle)? {
            let parts = self.in_vector(|parser| {
                let mut parts = Vec::with_capacity(3);
                loop {
                    parts.push(parser.parse_fn_expr(scope)?);
                    let token = parser.expect_token()?;
                    match token.kind {
                        TokenKind::Comma => {}
                        TokenKind::RightAngle => break,
                        other => {
                            return Err(parser.error_at(
                                ErrorKind::Parse,
                                token.position,
                                format!("expected ',' or '>' in vector function body, found {}", other.describe()),
                            ));
                        }
                    }
                }
                Ok(parts)
            })?;
            return Ok(FnExpr::Vector(parts));
        }
        self.parse_fn_expr(scope)
    }

    fn parse_fn_expr(&mut self, scope: &mut FnScope) -> ParseResult<FnExpr> {
        self.parse_fn_or(scope)
    }

    fn parse_fn_or(&mut self, scope: &mut FnScope) -> ParseResult<FnExpr> {
        let mut left = self.parse_fn_and(scope)?;
        while self.allow(&TokenKind::Pipe)? {
            let right = self.parse_fn_and(scope)?;
            left = FnExpr::Binary {
                op: FnBinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_fn_and(&mut self, scope: &mut FnScope) -> ParseResult<FnExpr> {
        let mut left = self.parse_fn_relation(scope)?;
        while self.allow(&TokenKind::Amp)? {
            let right = self.parse_fn_relation(scope)?;
            left = FnExpr::Binary {
                op: FnBinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_fn_relation(&mut self, scope: &mut FnScope) -> ParseResult<FnExpr> {
        let left = self.parse_fn_additive(scope)?;
        let Some(token) = self.next_token()? else {
            return Ok(left);
        };
        let op = match token.kind {
            TokenKind::Equals => FnBinOp::Eq,
            TokenKind::NotEquals => FnBinOp::Ne,
            TokenKind::LeftAngle => FnBinOp::Lt,
            TokenKind::LessEq => FnBinOp::Le,
            // inside a vector-valued body, `>` closes the vector
            TokenKind::RightAngle | TokenKind::GreaterEq if self.vector_depth > 0 => {
                self.unget(token);
                return Ok(left);
            }
            TokenKind::RightAngle => FnBinOp::Gt,
            TokenKind::GreaterEq => FnBinOp::Ge,
            _ => {
                self.unget(token);
                return Ok(left);
            }
        };
        let right = self.parse_fn_additive(scope)?;
        Ok(FnExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_fn_additive(&mut self, scope: &mut FnScope) -> ParseResult<FnExpr> {
        let mut left = self.parse_fn_term(scope)?;
        loop {
            let op = if self.allow(&TokenKind::Plus)? {
                FnBinOp::Add
            } else if self.allow(&TokenKind::Minus)? {
                FnBinOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.parse_fn_term(scope)?;
            left = FnExpr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_fn_term(&mut self, scope: &mut FnScope) -> ParseResult<FnExpr> {
        let mut left = self.parse_fn_power(scope)?;
        loop {
            let op = if self.allow(&TokenKind::Star)? {
                FnBinOp::Mul
            } else if self.allow(&TokenKind::Slash)? {
                FnBinOp::Div
            } else {
                return Ok(left);
            };
            let right = self.parse_fn_power(scope)?;
            left = FnExpr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_fn_power(&mut self, scope: &mut FnScope) -> ParseResult<FnExpr> {
        let left = self.parse_fn_unary(scope)?;
        if self.allow(&TokenKind::Caret)? {
            let right = self.parse_fn_power(scope)?;
            return Ok(FnExpr::Binary {
                op: FnBinOp::Pow,
                left: Box::new(left),
                right: Box::new(right),
            });
        }
        Ok(left)
    }

    fn parse_fn_unary(&mut self, scope: &mut FnScope) -> ParseResult<FnExpr> {
        let token = self.expect_token()?;
        match token.kind {
            TokenKind::Plus => self.parse_fn_unary(scope),
            TokenKind::Minus => {
                let inner = self.parse_fn_unary(scope)?;
                // fold a negated literal so the peephole sees the constant
                Ok(match inner {
                    FnExpr::Constant(v) => FnExpr::Constant(-v),
                    other => FnExpr::Neg(Box::new(other)),
                })
            }
            TokenKind::Bang => {
                let inner = self.parse_fn_unary(scope)?;
                Ok(FnExpr::Not(Box::new(inner)))
            }
            _ => {
                self.unget(token);
                self.parse_fn_primary(scope)
            }
        }
    }

    fn parse_fn_primary(&mut self, scope: &mut FnScope) -> ParseResult<FnExpr> {
        let token = self.expect_token()?;
        let expr = match &token.kind {
            TokenKind::Float(v) => FnExpr::Constant(*v),
            TokenKind::LeftParen => {
                let inner = self.parse_fn_expr(scope)?;
                self.expect_kind(&TokenKind::RightParen, "')'")?;
                inner
            }
            TokenKind::Keyword(keyword) => {
                let keyword = *keyword;
                self.parse_fn_keyword(scope, keyword, &token)?
            }
            TokenKind::Identifier(name) | TokenKind::TypedIdentifier(_, name) => {
                let name = name.clone();
                self.parse_fn_identifier(scope, &name, &token)?
            }
            other => {
                return Err(self.error_at(
                    ErrorKind::Parse,
                    token.position,
                    format!("expected a function expression, found {}", other.describe()),
                ));
            }
        };
        self.parse_fn_postfix(expr)
    }

    /// `.member` after a call of a vector-returning function.
    fn parse_fn_postfix(&mut self, expr: FnExpr) -> ParseResult<FnExpr> {
        if !self.allow(&TokenKind::Period)? {
            return Ok(expr);
        }
        let token = self.expect_token()?;
        let member = match token.keyword() {
            Some(Keyword::X | Keyword::U) => FnMember::X,
            Some(Keyword::Y | Keyword::V) => FnMember::Y,
            Some(Keyword::Z) => FnMember::Z,
            Some(Keyword::T) => FnMember::T,
            Some(Keyword::Red) => FnMember::Red,
            Some(Keyword::Green) => FnMember::Green,
            Some(Keyword::Blue) => FnMember::Blue,
            Some(Keyword::Filter) => FnMember::Filter,
            Some(Keyword::Transmit) => FnMember::Transmit,
            Some(Keyword::Gray) => FnMember::Gray,
            _ => {
                return Err(self.error_at(
                    ErrorKind::Parse,
                    token.position,
                    "valid member names are x, y, z, t, u, v, red, green, blue, gray, filter and transmit",
                ));
            }
        };
        Ok(FnExpr::Member {
            call: Box::new(expr),
            member,
        })
    }

    fn parse_fn_keyword(&mut self, scope: &mut FnScope, keyword: Keyword, token: &Token) -> ParseResult<FnExpr> {
        let expr = match keyword {
            Keyword::X | Keyword::Y | Keyword::Z | Keyword::U | Keyword::V => {
                let name: &'static str = keyword.into();
                FnExpr::Variable(name.to_owned())
            }
            Keyword::Pi => FnExpr::Constant(std::f64::consts::PI),
            Keyword::Tau => FnExpr::Constant(std::f64::consts::TAU),
            Keyword::True | Keyword::Yes | Keyword::On => FnExpr::Constant(1.0),
            Keyword::False | Keyword::No | Keyword::Off => FnExpr::Constant(0.0),
            Keyword::Clock => FnExpr::Constant(self.options.clock),
            Keyword::ClockDelta => FnExpr::Constant(self.options.clock_delta),

            // one-argument intrinsics dispatched through SYS1
            Keyword::Sin => self.fn_intrinsic1(scope, op::SYS1_SIN, false)?,
            Keyword::Cos => self.fn_intrinsic1(scope, op::SYS1_COS, false)?,
            Keyword::Tan => self.fn_intrinsic1(scope, op::SYS1_TAN, false)?,
            Keyword::Asin => self.fn_intrinsic1(scope, op::SYS1_ASIN, false)?,
            Keyword::Acos => self.fn_intrinsic1(scope, op::SYS1_ACOS, false)?,
            Keyword::Atan => self.fn_intrinsic1(scope, op::SYS1_ATAN, false)?,
            Keyword::Sinh => self.fn_intrinsic1(scope, op::SYS1_SINH, false)?,
            Keyword::Cosh => self.fn_intrinsic1(scope, op::SYS1_COSH, false)?,
            Keyword::Tanh => self.fn_intrinsic1(scope, op::SYS1_TANH, false)?,
            Keyword::Asinh => self.fn_intrinsic1(scope, op::SYS1_ASINH, false)?,
            Keyword::Acosh => self.fn_intrinsic1(scope, op::SYS1_ACOSH, false)?,
            Keyword::Atanh => self.fn_intrinsic1(scope, op::SYS1_ATANH, false)?,
            Keyword::Int => self.fn_intrinsic1(scope, op::SYS1_INT, false)?,
            Keyword::Floor => self.fn_intrinsic1(scope, op::SYS1_FLOOR, false)?,
            Keyword::Ceil => self.fn_intrinsic1(scope, op::SYS1_CEIL, false)?,
            Keyword::Sqrt => self.fn_intrinsic1(scope, op::SYS1_SQRT, false)?,
            Keyword::Exp => self.fn_intrinsic1(scope, op::SYS1_EXP, false)?,
            Keyword::Ln => self.fn_intrinsic1(scope, op::SYS1_LN, true)?,
            Keyword::Log => self.fn_intrinsic1(scope, op::SYS1_LOG, true)?,

            // two-argument intrinsics through SYS2
            Keyword::Pow => self.fn_intrinsic2(scope, op::SYS2_POW, false, true)?,
            Keyword::Atan2 => self.fn_intrinsic2(scope, op::SYS2_ATAN2, false, false)?,
            Keyword::Mod => self.fn_intrinsic2(scope, op::SYS2_MOD, true, false)?,
            Keyword::Div => self.fn_intrinsic2(scope, op::SYS2_DIV, true, false)?,

            // special-cased forms
            Keyword::Abs => FnExpr::Abs(Box::new(self.fn_one_argument(scope)?)),
            Keyword::Sqr => FnExpr::Sqr(Box::new(self.fn_one_argument(scope)?)),
            Keyword::Radians => FnExpr::Radians(Box::new(self.fn_one_argument(scope)?)),
            Keyword::Degrees => FnExpr::Degrees(Box::new(self.fn_one_argument(scope)?)),
            Keyword::Min => FnExpr::MinMax {
                is_max: false,
                args: self.fn_arguments(scope)?,
            },
            Keyword::Max => FnExpr::MinMax {
                is_max: true,
                args: self.fn_arguments(scope)?,
            },
            Keyword::Select => FnExpr::Select(self.fn_arguments(scope)?),
            Keyword::Sum => self.fn_reduction(scope, false)?,
            Keyword::Prod => self.fn_reduction(scope, true)?,

            other => {
                let name: &'static str = other.into();
                return Err(self.error_at(
                    ErrorKind::Parse,
                    token.position,
                    format!("keyword '{name}' is not valid inside a function body"),
                ));
            }
        };
        Ok(expr)
    }

    fn fn_one_argument(&mut self, scope: &mut FnScope) -> ParseResult<FnExpr> {
        self.expect_kind(&TokenKind::LeftParen, "'('")?;
        let arg = self.parse_fn_expr(scope)?;
        self.expect_kind(&TokenKind::RightParen, "')'")?;
        Ok(arg)
    }

    fn fn_arguments(&mut self, scope: &mut FnScope) -> ParseResult<Vec<FnExpr>> {
        self.expect_kind(&TokenKind::LeftParen, "'('")?;
        let mut args = Vec::new();
        loop {
            args.push(self.parse_fn_expr(scope)?);
            if !self.allow(&TokenKind::Comma)? {
                break;
            }
        }
        self.expect_kind(&TokenKind::RightParen, "')'")?;
        Ok(args)
    }

    fn fn_intrinsic1(&mut self, scope: &mut FnScope, sys: u16, guard_positive: bool) -> ParseResult<FnExpr> {
        let arg = self.fn_one_argument(scope)?;
        Ok(FnExpr::Intrinsic1 {
            sys,
            guard_positive,
            arg: Box::new(arg),
        })
    }

    fn fn_intrinsic2(
        &mut self,
        scope: &mut FnScope,
        sys: u16,
        guard_second_nonzero: bool,
        guard_pow: bool,
    ) -> ParseResult<FnExpr> {
        self.expect_kind(&TokenKind::LeftParen, "'('")?;
        let first = self.parse_fn_expr(scope)?;
        self.parse_comma()?;
        let second = self.parse_fn_expr(scope)?;
        self.expect_kind(&TokenKind::RightParen, "')'")?;
        Ok(FnExpr::Intrinsic2 {
            sys,
            guard_second_nonzero,
            guard_pow,
            first: Box::new(first),
            second: Box::new(second),
        })
    }

    /// `sum(i, from, to, body)` / `prod(i, from, to, body)`.
    fn fn_reduction(&mut self, scope: &mut FnScope, is_prod: bool) -> ParseResult<FnExpr> {
        self.expect_kind(&TokenKind::LeftParen, "'('")?;
        let token = self.expect_token()?;
        let Some(variable) = parameter_name(&token) else {
            return Err(self.error_at(
                ErrorKind::Parse,
                token.position,
                "expected a loop variable name as the first argument",
            ));
        };
        self.parse_comma()?;
        let from = self.parse_fn_expr(scope)?;
        self.parse_comma()?;
        let to = self.parse_fn_expr(scope)?;
        self.parse_comma()?;
        scope.locals.push(variable.clone());
        let body = self.parse_fn_expr(scope);
        scope.locals.pop();
        let body = body?;
        self.expect_kind(&TokenKind::RightParen, "')'")?;
        Ok(FnExpr::Reduce {
            is_prod,
            variable,
            from: Box::new(from),
            to: Box::new(to),
            body: Box::new(body),
        })
    }

    fn parse_fn_identifier(&mut self, scope: &mut FnScope, name: &str, token: &Token) -> ParseResult<FnExpr> {
        if scope.resolves(name) {
            return Ok(FnExpr::Variable(name.to_owned()));
        }

        // the function's own name: recursion is a possible-error
        if let Some((own_name, own_id)) = &scope.own {
            if own_name == name {
                let own_id = *own_id;
                self.possible_error("recursive function calls are not allowed")?;
                let args = self.fn_arguments(scope)?;
                return Ok(FnExpr::Call {
                    function: own_id,
                    name: name.to_owned(),
                    args,
                });
            }
        }

        let Some(found) = self.symbols.find(name) else {
            return Err(self.error_at(
                ErrorKind::Symbol,
                token.position,
                format!("expected parameter identifier or declared constant, found unknown '{name}'"),
            ));
        };
        let value = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))?;
        match value {
            Value::Scalar(v) => Ok(FnExpr::Constant(v)),
            Value::Macro(_) => {
                self.invoke_macro(name)?;
                self.parse_fn_primary(scope)
            }
            Value::Function(function) => {
                let args = self.fn_arguments(scope)?;
                Ok(FnExpr::Call {
                    function,
                    name: name.to_owned(),
                    args,
                })
            }
            // declared vectors and colors fold to a scalar via member access
            other @ (Value::Vector2(_) | Value::Vector3(_) | Value::Vector4(_) | Value::Color(_)) => {
                if self.allow(&TokenKind::Period)? {
                    let folded = self.fold_member_to_constant(&other)?;
                    Ok(FnExpr::Constant(folded))
                } else {
                    Err(self.error_at(
                        ErrorKind::Type,
                        token.position,
                        format!("'{name}' is a vector; select a component with .x/.y/… to use it in a function"),
                    ))
                }
            }
            other => Err(self.error_at(
                ErrorKind::Type,
                token.position,
                format!("'{name}' is {} and cannot appear in a function body", other.tag()),
            )),
        }
    }

    /// Resolves `Declared_Vector.y` to its scalar at definition time.
    fn fold_member_to_constant(&mut self, value: &Value) -> ParseResult<f64> {
        let token = self.expect_token()?;
        let component = match (value, token.keyword()) {
            (Value::Vector2(v), Some(Keyword::X | Keyword::U)) => v[0],
            (Value::Vector2(v), Some(Keyword::Y | Keyword::V)) => v[1],
            (Value::Vector3(v), Some(Keyword::X)) => v[0],
            (Value::Vector3(v), Some(Keyword::Y)) => v[1],
            (Value::Vector3(v), Some(Keyword::Z)) => v[2],
            (Value::Vector4(v), Some(Keyword::X)) => v[0],
            (Value::Vector4(v), Some(Keyword::Y)) => v[1],
            (Value::Vector4(v), Some(Keyword::Z)) => v[2],
            (Value::Vector4(v), Some(Keyword::T)) => v[3],
            (Value::Color(c), Some(Keyword::Red)) => c.red,
            (Value::Color(c), Some(Keyword::Green)) => c.green,
            (Value::Color(c), Some(Keyword::Blue)) => c.blue,
            (Value::Color(c), Some(Keyword::Filter)) => c.filter,
            (Value::Color(c), Some(Keyword::Transmit)) => c.transmit,
            (Value::Color(c), Some(Keyword::Gray)) => c.gray(),
            _ => {
                return Err(self.error_at(
                    ErrorKind::Type,
                    token.position,
                    "invalid member access on a declared constant",
                ));
            }
        };
        Ok(component)
    }
}

/// Accepts identifiers and the x/y/z/u/v keywords as parameter names.
fn parameter_name(token: &Token) -> Option<String> {
    match &token.kind {
        TokenKind::Identifier(name) | TokenKind::TypedIdentifier(_, name) => Some(name.clone()),
        TokenKind::Keyword(kw @ (Keyword::X | Keyword::Y | Keyword::Z | Keyword::U | Keyword::V | Keyword::T)) => {
            let name: &'static str = (*kw).into();
            Some(name.to_owned())
        }
        _ => None,
    }
}
