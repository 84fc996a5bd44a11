//! The directive processor: everything that starts with `#`.
//!
//! Directives are handled inside the cooked-token layer, so grammar code
//! never sees them. Conditional and loop directives work by driving the
//! lexer: a false branch is skipped with a raw depth-counting scan, a loop
//! seeks the lexer back to its recorded start, and a macro invocation
//! enters the defining stream at the recorded body offset.

use smallvec::{SmallVec, smallvec};

use crate::{
    diag::{ErrorKind, ParseResult, Severity},
    io::FilePurpose,
    nodes::SplineKind,
    source::{Cursor, SourcePosition},
    token::{Keyword, TokenKind},
    value::{FileId, MacroDef, MacroParam, Value, ValueTag},
};

use super::{CondState, DataFile, Parser, body_checksum};

/// What a raw skip scan may stop at (always at nesting depth zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipStop {
    End,
    Else,
    CaseOrRange,
}

impl Parser<'_> {
    /// Entry from the cooked-token layer: `#` was just read.
    pub(crate) fn parse_directive(&mut self) -> ParseResult<()> {
        let token = self
            .lexer
            .next()?
            .ok_or_else(|| self.error_here(ErrorKind::Parse, "'#' at end of file"))?;
        let Some(keyword) = token.keyword() else {
            return Err(self.error_at(
                ErrorKind::Parse,
                token.position,
                format!("expected a directive after '#', found {}", token.kind.describe()),
            ));
        };
        match keyword {
            Keyword::Declare => self.parse_declare(false),
            Keyword::Local => self.parse_declare(true),
            Keyword::Undef => self.parse_undef(),
            Keyword::Include => self.parse_include(),
            Keyword::Version => self.parse_version(),
            Keyword::If => self.parse_if(),
            Keyword::Ifdef => self.parse_ifdef(false),
            Keyword::Ifndef => self.parse_ifdef(true),
            Keyword::Else => self.parse_else(),
            Keyword::End => self.parse_end_directive(),
            Keyword::While => self.parse_while(),
            Keyword::For => self.parse_for(),
            Keyword::Break => self.parse_break(),
            Keyword::Switch => self.parse_switch(),
            Keyword::Case | Keyword::Range => self.parse_live_case(keyword),
            Keyword::Default => self.parse_default_block(),
            Keyword::Macro => self.parse_macro_definition(),
            Keyword::Fopen => self.parse_fopen(),
            Keyword::Fclose => self.parse_fclose(),
            Keyword::Read => self.parse_read(),
            Keyword::Write => self.parse_write(),
            Keyword::Debug => {
                let message = self.parse_string_value()?;
                self.messages.debug(&message);
                Ok(())
            }
            Keyword::Warning => {
                let message = self.parse_string_value()?;
                self.warn(message);
                Ok(())
            }
            Keyword::Error => {
                let message = self.parse_string_value()?;
                Err(self.error_at(ErrorKind::Parse, token.position, format!("user error: {message}")))
            }
            other => {
                let name: &'static str = other.into();
                Err(self.error_at(
                    ErrorKind::Parse,
                    token.position,
                    format!("'{name}' is not valid after '#'"),
                ))
            }
        }
    }

    // --- raw skipping ---

    /// Scans raw tokens until one of `stops` appears at nesting depth zero.
    /// Returns the stop kind and the position of its `#`.
    fn skip_tokens(&mut self, stops: &[SkipStop]) -> ParseResult<(SkipStop, SourcePosition)> {
        let mut depth = 0u32;
        loop {
            let Some(token) = self.lexer.next()? else {
                return Err(self.error_here(ErrorKind::Parse, "missing #end"));
            };
            if token.kind != TokenKind::Hash {
                continue;
            }
            let hash_position = token.position;
            let Some(directive) = self.lexer.next()? else {
                return Err(self.error_here(ErrorKind::Parse, "'#' at end of file"));
            };
            let Some(keyword) = directive.keyword() else {
                continue;
            };
            match keyword {
                Keyword::If | Keyword::Ifdef | Keyword::Ifndef | Keyword::While | Keyword::For | Keyword::Switch
                | Keyword::Macro => depth += 1,
                Keyword::End => {
                    if depth == 0 {
                        if stops.contains(&SkipStop::End) {
                            return Ok((SkipStop::End, hash_position));
                        }
                        return Err(self.error_at(ErrorKind::Parse, hash_position, "unexpected #end"));
                    }
                    depth -= 1;
                }
                Keyword::Else if depth == 0 && stops.contains(&SkipStop::Else) => {
                    return Ok((SkipStop::Else, hash_position));
                }
                Keyword::Case | Keyword::Range if depth == 0 && stops.contains(&SkipStop::CaseOrRange) => {
                    return Ok((SkipStop::CaseOrRange, hash_position));
                }
                _ => {}
            }
        }
    }

    fn skip_to_end(&mut self) -> ParseResult<SourcePosition> {
        let (_, position) = self.skip_tokens(&[SkipStop::End])?;
        Ok(position)
    }

    // --- conditionals ---

    fn parse_condition(&mut self) -> ParseResult<bool> {
        self.expect_kind(&TokenKind::LeftParen, "'('")?;
        let value = self.parse_expression()?;
        let truth = self.truthiness(&value)?;
        self.expect_kind(&TokenKind::RightParen, "')'")?;
        Ok(truth)
    }

    fn parse_if(&mut self) -> ParseResult<()> {
        if self.parse_condition()? {
            self.cond_stack.push(CondState::IfTrue);
            return Ok(());
        }
        match self.skip_tokens(&[SkipStop::End, SkipStop::Else])? {
            (SkipStop::Else, _) => {
                self.cond_stack.push(CondState::Else);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn parse_ifdef(&mut self, negate: bool) -> ParseResult<()> {
        self.expect_kind(&TokenKind::LeftParen, "'('")?;
        let mut defined = self.parse_defined()?;
        self.expect_kind(&TokenKind::RightParen, "')'")?;
        if negate {
            defined = !defined;
        }
        if defined {
            self.cond_stack.push(CondState::IfTrue);
            return Ok(());
        }
        match self.skip_tokens(&[SkipStop::End, SkipStop::Else])? {
            (SkipStop::Else, _) => {
                self.cond_stack.push(CondState::Else);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn parse_else(&mut self) -> ParseResult<()> {
        match self.cond_stack.last() {
            Some(CondState::IfTrue | CondState::CaseTrue) => {
                // live branch ran to its #else: the rest is dead
                self.cond_stack.pop();
                self.skip_to_end()?;
                // the skip consumed the matching #end; nothing left open
                Ok(())
            }
            _ => Err(self.error_here(ErrorKind::Parse, "#else without matching #if or #switch")),
        }
    }

    fn parse_break(&mut self) -> ParseResult<()> {
        match self.cond_stack.last() {
            Some(CondState::CaseTrue) => {
                self.cond_stack.pop();
                self.skip_to_end()?;
                Ok(())
            }
            _ => Err(self.error_here(ErrorKind::Parse, "#break outside a #switch case")),
        }
    }

    // --- loops ---

    fn parse_while(&mut self) -> ParseResult<()> {
        let start = self.lexer.position();
        if self.parse_condition()? {
            self.cond_stack.push(CondState::WhileCond { start });
            Ok(())
        } else {
            self.skip_to_end()?;
            Ok(())
        }
    }

    fn parse_for(&mut self) -> ParseResult<()> {
        self.expect_kind(&TokenKind::LeftParen, "'('")?;
        let name = self.expect_identifier_name("loop variable")?;
        self.parse_comma()?;
        let from = self.parse_float()?;
        self.parse_comma()?;
        let until = self.parse_float()?;
        let step = if self.allow(&TokenKind::Comma)? {
            let step = self.parse_float()?;
            if step == 0.0 {
                return Err(self.error_here(ErrorKind::Domain, "#for step cannot be zero"));
            }
            step
        } else {
            1.0
        };
        self.expect_kind(&TokenKind::RightParen, "')'")?;

        self.symbols.add_local(&name, Value::Scalar(from));
        if for_continues(from, until, step) {
            let start = self.lexer.position();
            self.cond_stack.push(CondState::ForCond {
                variable: name,
                end: until,
                step,
                start,
            });
            Ok(())
        } else {
            self.skip_to_end()?;
            Ok(())
        }
    }

    // --- switch ---

    fn parse_switch(&mut self) -> ParseResult<()> {
        self.expect_kind(&TokenKind::LeftParen, "'('")?;
        let value = self.parse_float()?;
        self.expect_kind(&TokenKind::RightParen, "')'")?;
        self.cond_stack.push(CondState::Switch { value });
        self.advance_to_matching_case(value)
    }

    /// Skips case bodies until a matching `#case`/`#range`, an `#else`
    /// acting as the default branch, or the closing `#end`.
    fn advance_to_matching_case(&mut self, value: f64) -> ParseResult<()> {
        loop {
            // tokens between #switch and the first case, or inside a
            // non-matching case body, are skipped
            match self.skip_tokens(&[SkipStop::End, SkipStop::CaseOrRange, SkipStop::Else])? {
                (SkipStop::End, _) => {
                    self.cond_stack.pop();
                    return Ok(());
                }
                (SkipStop::Else, _) => {
                    self.cond_stack.pop();
                    self.cond_stack.push(CondState::CaseTrue);
                    return Ok(());
                }
                (SkipStop::CaseOrRange, _) => {
                    // the keyword was consumed by the scan; its arguments
                    // have not been
                    if self.parse_case_condition()?.matches(value) {
                        self.cond_stack.pop();
                        self.cond_stack.push(CondState::CaseTrue);
                        return Ok(());
                    }
                    self.cond_stack.pop();
                    self.cond_stack.push(CondState::CaseFalse { value });
                }
            }
        }
    }

    /// A live `#case`/`#range` reached while a case body is running:
    /// fallthrough, just consume the arguments.
    fn parse_live_case(&mut self, keyword: Keyword) -> ParseResult<()> {
        match self.cond_stack.last().cloned() {
            Some(CondState::CaseTrue) => {
                let _ = self.parse_case_arguments(keyword)?;
                Ok(())
            }
            _ => {
                let name: &'static str = keyword.into();
                Err(self.error_here(ErrorKind::Parse, format!("#{name} outside a #switch")))
            }
        }
    }

    /// Parses the argument list of the `#case`/`#range` whose keyword was
    /// already consumed by a skip scan.
    fn parse_case_condition(&mut self) -> ParseResult<CaseMatch> {
        // the scan stopped right after the keyword; figure out which one it
        // was by argument shape: #case takes one value, #range takes two
        self.expect_kind(&TokenKind::LeftParen, "'('")?;
        let first = self.parse_float()?;
        if self.allow(&TokenKind::Comma)? {
            let second = self.parse_float()?;
            self.expect_kind(&TokenKind::RightParen, "')'")?;
            Ok(CaseMatch::Range(first, second))
        } else {
            self.expect_kind(&TokenKind::RightParen, "')'")?;
            Ok(CaseMatch::Single(first))
        }
    }

    fn parse_case_arguments(&mut self, keyword: Keyword) -> ParseResult<CaseMatch> {
        match keyword {
            Keyword::Case => {
                self.expect_kind(&TokenKind::LeftParen, "'('")?;
                let v = self.parse_float()?;
                self.expect_kind(&TokenKind::RightParen, "')'")?;
                Ok(CaseMatch::Single(v))
            }
            _ => {
                self.expect_kind(&TokenKind::LeftParen, "'('")?;
                let lo = self.parse_float()?;
                self.parse_comma()?;
                let hi = self.parse_float()?;
                self.expect_kind(&TokenKind::RightParen, "')'")?;
                Ok(CaseMatch::Range(lo, hi))
            }
        }
    }

    // --- #end dispatch ---

    fn parse_end_directive(&mut self) -> ParseResult<()> {
        let state = self
            .cond_stack
            .last()
            .cloned()
            .expect("condition stack always holds the root");
        match state {
            CondState::WhileCond { start } => {
                if self.lexer.position().stream != start.stream {
                    return Err(self.error_here(
                        ErrorKind::Parse,
                        "#while and its #end must be in the same file",
                    ));
                }
                self.lexer.seek(start);
                if self.parse_condition()? {
                    Ok(())
                } else {
                    self.cond_stack.pop();
                    self.skip_to_end()?;
                    Ok(())
                }
            }
            CondState::ForCond {
                variable,
                end,
                step,
                start,
            } => {
                let found = self
                    .symbols
                    .find(&variable)
                    .ok_or_else(|| self.error_here(ErrorKind::Symbol, format!("loop variable '{variable}' was undefined")))?;
                let current = self
                    .symbols
                    .get(found.handle)
                    .map_err(|e| self.locate(e))?
                    .as_scalar()
                    .ok_or_else(|| {
                        self.error_here(ErrorKind::Type, format!("loop variable '{variable}' is no longer a float"))
                    })?;
                let next = current + step;
                *self.symbol_mut(found.handle)? = Value::Scalar(next);
                if for_continues(next, end, step) {
                    if self.lexer.position().stream != start.stream {
                        return Err(self.error_here(
                            ErrorKind::Parse,
                            "#for and its #end must be in the same file",
                        ));
                    }
                    self.lexer.seek(start);
                } else {
                    self.cond_stack.pop();
                }
                Ok(())
            }
            CondState::IfTrue | CondState::IfFalse | CondState::Else | CondState::CaseTrue | CondState::SkipToEnd => {
                self.cond_stack.pop();
                Ok(())
            }
            CondState::Switch { .. } | CondState::CaseFalse { .. } => {
                self.cond_stack.pop();
                Ok(())
            }
            CondState::InvokingMacro { closes_frame } => {
                self.lexer.leave();
                if closes_frame {
                    self.symbols.pop_frame();
                }
                self.cond_stack.pop();
                Ok(())
            }
            CondState::DeclaringMacro => Err(self.error_here(
                ErrorKind::Parse,
                "internal: macro declaration state reached the live #end handler",
            )),
            CondState::Root => Err(self.error_here(ErrorKind::Parse, "#end without matching directive")),
        }
    }

    // --- macros ---

    fn parse_macro_definition(&mut self) -> ParseResult<()> {
        let name = self.expect_identifier_name("macro name")?;
        self.expect_kind(&TokenKind::LeftParen, "'('")?;
        let mut parameters = Vec::new();
        if !self.allow(&TokenKind::RightParen)? {
            loop {
                let optional = self.allow_keyword(Keyword::Optional)?;
                let param = self.expect_identifier_name("macro parameter")?;
                parameters.push(MacroParam { name: param, optional });
                if !self.allow(&TokenKind::Comma)? {
                    break;
                }
            }
            self.expect_kind(&TokenKind::RightParen, "')'")?;
        }

        let body_start = self.lexer.position();
        self.cond_stack.push(CondState::DeclaringMacro);
        let body_end = self.skip_to_end()?;
        self.cond_stack.pop();

        let checksum = body_checksum(self.lexer.text_between(body_start, body_end));
        if self.symbols.existing_tag(&name) == Some(ValueTag::Macro) {
            self.warn(format!("macro '{name}' redefined"));
        }
        self.symbols.add_global(
            &name.clone(),
            Value::Macro(Box::new(MacroDef {
                name,
                parameters,
                body_start,
                body_end,
                checksum,
            })),
        );
        Ok(())
    }

    /// Invokes a macro: evaluates arguments in the caller's scope, pushes
    /// the callee frame, and seeks the lexer to the body.
    pub(crate) fn invoke_macro(&mut self, name: &str) -> ParseResult<()> {
        let found = self
            .symbols
            .find(name)
            .ok_or_else(|| self.error_here(ErrorKind::Symbol, format!("undefined macro '{name}'")))?;
        let Value::Macro(def) = self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? else {
            return Err(self.error_here(ErrorKind::Type, format!("'{name}' is not a macro")));
        };

        self.expect_kind(&TokenKind::LeftParen, &format!("'(' after macro '{name}'"))?;
        let mut arguments: Vec<(String, Value)> = Vec::with_capacity(def.parameters.len());
        let mut closed = false;
        for (index, parameter) in def.parameters.iter().enumerate() {
            if closed {
                if parameter.optional {
                    arguments.push((parameter.name.clone(), Value::Undefined));
                    continue;
                }
                return Err(self.error_here(
                    ErrorKind::Parse,
                    format!("too few parameters for macro '{name}': missing '{}'", parameter.name),
                ));
            }
            // an empty slot (",," or ",)") binds undefined for optionals
            let token = self.expect_token()?;
            match token.kind {
                TokenKind::Comma => {
                    if !parameter.optional {
                        return Err(self.error_here(
                            ErrorKind::Parse,
                            format!("macro parameter '{}' is not optional", parameter.name),
                        ));
                    }
                    arguments.push((parameter.name.clone(), Value::Undefined));
                    continue;
                }
                TokenKind::RightParen => {
                    if !parameter.optional {
                        return Err(self.error_here(
                            ErrorKind::Parse,
                            format!("too few parameters for macro '{name}': missing '{}'", parameter.name),
                        ));
                    }
                    arguments.push((parameter.name.clone(), Value::Undefined));
                    closed = true;
                    continue;
                }
                _ => self.unget(token),
            }
            let value = self.parse_macro_argument(parameter.optional)?;
            arguments.push((parameter.name.clone(), value));
            if index + 1 < def.parameters.len() {
                if !self.allow(&TokenKind::Comma)? {
                    let token = self.expect_token()?;
                    if token.kind == TokenKind::RightParen {
                        closed = true;
                    } else {
                        return Err(self.error_at(
                            ErrorKind::Parse,
                            token.position,
                            format!("expected ',' or ')' in macro call, found {}", token.kind.describe()),
                        ));
                    }
                }
            }
        }
        if !closed {
            // trailing comma before ')' is tolerated
            self.parse_comma()?;
            let token = self.expect_token()?;
            if token.kind != TokenKind::RightParen {
                return Err(self.error_at(
                    ErrorKind::Parse,
                    token.position,
                    format!("too many parameters for macro '{name}'"),
                ));
            }
        }

        // verify the body still reads back exactly as it did at definition
        let body = self.lexer.text_between(def.body_start, def.body_end);
        if body_checksum(body) != def.checksum {
            return Err(self.error_here(
                ErrorKind::Parse,
                format!("macro '{name}' body changed since its definition"),
            ));
        }

        self.symbols.push_frame();
        for (param_name, value) in arguments {
            self.symbols.add_local(param_name, value);
        }
        self.lexer.enter_at(def.body_start)?;
        self.cond_stack.push(CondState::InvokingMacro { closes_frame: true });
        Ok(())
    }

    /// One macro argument. A bare identifier is passed by reference; any
    /// other expression is evaluated and copied.
    fn parse_macro_argument(&mut self, optional: bool) -> ParseResult<Value> {
        let token = self.expect_token()?;
        let name = match &token.kind {
            TokenKind::Identifier(name) | TokenKind::TypedIdentifier(_, name) => name.clone(),
            _ => {
                self.unget(token);
                return self.parse_expression();
            }
        };
        // bare only if the very next token closes the slot
        let next = self.expect_token()?;
        let bare = matches!(next.kind, TokenKind::Comma | TokenKind::RightParen);
        self.unget(next);
        if !bare {
            self.unget(token);
            return self.parse_expression();
        }
        match self.symbols.find(&name) {
            Some(found) => {
                let resolved = self.symbols.resolve(found.handle).map_err(|e| self.locate(e))?;
                Ok(Value::ParamRef(resolved))
            }
            None if optional => Ok(Value::Undefined),
            None => Err(self.error_at(
                ErrorKind::Symbol,
                token.position,
                format!("undefined identifier '{name}'"),
            )),
        }
    }

    // --- declarations ---

    fn parse_declare(&mut self, is_local: bool) -> ParseResult<()> {
        let token = self.expect_token()?;
        let name = match &token.kind {
            TokenKind::Identifier(name) | TokenKind::TypedIdentifier(_, name) => name.clone(),
            other => {
                return Err(self.error_at(
                    ErrorKind::Parse,
                    token.position,
                    format!("expected an identifier after #declare, found {}", other.describe()),
                ));
            }
        };

        // compound lvalues: array element or dictionary entry
        let peek = self.expect_token()?;
        match peek.kind {
            TokenKind::LeftBracket => return self.parse_element_assignment(&name),
            TokenKind::Period => return self.parse_dictionary_assignment(&name),
            _ => self.unget(peek),
        }

        self.expect_kind(&TokenKind::Equals, "'='")?;
        let value = self.parse_rvalue(Some(&name), is_local)?;

        // assignment to a by-reference macro parameter writes through to
        // the caller's storage instead of rebinding the local name
        let via_reference = match self.symbols.find(&name) {
            Some(found) => matches!(self.symbols.get(found.handle), Ok(Value::ParamRef(_))),
            None => false,
        };

        if self.options.strict_redefine && !via_reference {
            if let Some(existing) = self.symbols.existing_tag(&name) {
                let new_tag = value.tag();
                if existing != new_tag && existing != ValueTag::Undefined {
                    self.warn(format!(
                        "'{name}' redefined from {existing} to {new_tag}"
                    ));
                }
            }
        }

        let needs_semicolon = matches!(
            value.tag(),
            ValueTag::Scalar
                | ValueTag::Vector2
                | ValueTag::Vector3
                | ValueTag::Vector4
                | ValueTag::Color
                | ValueTag::String
        );
        if via_reference {
            let found = self.symbols.find(&name).expect("checked above");
            let target = self.symbols.resolve(found.handle).map_err(|e| self.locate(e))?;
            *self.symbol_mut(target)? = value;
        } else if is_local {
            self.symbols.add_local(&name, value);
        } else {
            self.symbols.add_global(&name, value);
        }
        self.parse_semicolon(needs_semicolon)?;
        Ok(())
    }

    /// `#declare arr[i][j] = value`, materializing the element.
    fn parse_element_assignment(&mut self, name: &str) -> ParseResult<()> {
        let found = self
            .symbols
            .find(name)
            .ok_or_else(|| self.error_here(ErrorKind::Symbol, format!("undefined identifier '{name}'")))?;
        let handle = self.symbols.resolve(found.handle).map_err(|e| self.locate(e))?;

        // read the dimensions up front so index expressions (which may use
        // the symbol table) can be evaluated before we take the array out
        let (dims_len, first_dim): (usize, usize) = match self.symbols.get(handle).map_err(|e| self.locate(e))? {
            Value::Array(array) => (array.dims.len(), array.dims.first().copied().unwrap_or(0)),
            other => {
                return Err(self.error_here(ErrorKind::Type, format!("'{name}' is {} and cannot be indexed", other.tag())));
            }
        };

        let mut indices = Vec::with_capacity(dims_len);
        // dimension 0 may grow, so it is not range-checked here
        let first = self.parse_float()? as i64;
        if first < 0 {
            return Err(self.error_here(ErrorKind::Domain, format!("negative array index {first}")));
        }
        indices.push(first as usize);
        self.expect_kind(&TokenKind::RightBracket, "']'")?;
        for _ in 1..dims_len {
            self.expect_kind(&TokenKind::LeftBracket, "'['")?;
            let index = self.parse_float()? as i64;
            if index < 0 {
                return Err(self.error_here(ErrorKind::Domain, format!("negative array index {index}")));
            }
            indices.push(index as usize);
            self.expect_kind(&TokenKind::RightBracket, "']'")?;
        }

        self.expect_kind(&TokenKind::Equals, "'='")?;
        let value = self.parse_rvalue(None, false)?;
        let needs_semicolon = matches!(
            value.tag(),
            ValueTag::Scalar
                | ValueTag::Vector2
                | ValueTag::Vector3
                | ValueTag::Vector4
                | ValueTag::Color
                | ValueTag::String
        );

        let value_tag = value.tag();
        if self.symbols.get(handle).map_err(|e| self.locate(e))?.tag() != ValueTag::Array {
            return Err(self.error_here(ErrorKind::Type, format!("'{name}' is no longer an array")));
        }
        let Value::Array(array) = self.symbol_mut(handle)? else {
            unreachable!("tag checked above")
        };
        if indices[0] >= first_dim {
            array.grow_first_dim(indices[0] + 1);
        }
        if !array.mixed {
            if let Some(tag) = array.element_tag() {
                if tag != value_tag {
                    return Err(self.error_here(
                        ErrorKind::Type,
                        format!("array of {tag} cannot hold {value_tag}; declare it 'array mixed' instead"),
                    ));
                }
            }
        }
        let Some(flat) = array.flat_index(&indices) else {
            return Err(self.error_here(ErrorKind::Domain, "array index out of range"));
        };
        let Value::Array(array) = self.symbol_mut(handle)? else {
            unreachable!("tag checked above")
        };
        array.elements[flat] = Some(value);
        self.parse_semicolon(needs_semicolon)?;
        Ok(())
    }

    /// `#declare dict.key = value` (creating the entry if needed).
    fn parse_dictionary_assignment(&mut self, name: &str) -> ParseResult<()> {
        let key = self.expect_identifier_name("dictionary key")?;
        self.expect_kind(&TokenKind::Equals, "'='")?;
        let value = self.parse_rvalue(None, false)?;
        let needs_semicolon = matches!(
            value.tag(),
            ValueTag::Scalar
                | ValueTag::Vector2
                | ValueTag::Vector3
                | ValueTag::Vector4
                | ValueTag::Color
                | ValueTag::String
        );

        let found = self
            .symbols
            .find(name)
            .ok_or_else(|| self.error_here(ErrorKind::Symbol, format!("undefined identifier '{name}'")))?;
        let handle = self.symbols.resolve(found.handle).map_err(|e| self.locate(e))?;
        let tag = self.symbols.get(handle).map_err(|e| self.locate(e))?.tag();
        if tag != ValueTag::Dictionary {
            return Err(self.error_here(
                ErrorKind::Type,
                format!("'{name}' is {tag} and has no entries to assign"),
            ));
        }
        let Value::Dictionary(dict) = self.symbol_mut(handle)? else {
            unreachable!("tag checked above")
        };
        dict.insert(key, value);
        self.parse_semicolon(needs_semicolon)?;
        Ok(())
    }

    fn parse_undef(&mut self) -> ParseResult<()> {
        let token = self.expect_token()?;
        match &token.kind {
            TokenKind::TypedIdentifier(_, name) => {
                self.symbols.remove(name);
                Ok(())
            }
            TokenKind::Identifier(name) => {
                self.warn(format!("#undef of undeclared identifier '{name}'"));
                Ok(())
            }
            other => Err(self.error_at(
                ErrorKind::Parse,
                token.position,
                format!("expected an identifier after #undef, found {}", other.describe()),
            )),
        }
    }

    // --- includes and versions ---

    fn parse_include(&mut self) -> ParseResult<()> {
        let path = self.parse_string_value()?;
        let resolved = self
            .env
            .resolve(&path, FilePurpose::Include)
            .ok_or_else(|| self.error_here(ErrorKind::Io, format!("cannot find include file '{path}'")))?;
        let text = self
            .env
            .read(&resolved)
            .map_err(|e| self.error_here(ErrorKind::Io, format!("cannot open include file '{path}': {e}")))?;
        self.lexer.push_include(path, text)?;
        Ok(())
    }

    fn parse_version(&mut self) -> ParseResult<()> {
        let requested = self.parse_float()?;
        self.parse_semicolon(false)?;
        let version = (requested * 100.0).round() as u32;
        if version > 380 {
            self.warn(format!("#version {requested} is newer than this parser supports"));
        }
        if version < 350 {
            self.warn(format!(
                "#version {requested}: legacy scenes parse with canonical 3.7 defaults; only nested block comments are honored"
            ));
        }
        self.scene.language_version = version;
        self.lexer.nested_comments = version < 350;
        Ok(())
    }

    // --- file I/O directives ---

    fn parse_fopen(&mut self) -> ParseResult<()> {
        let name = self.expect_identifier_name("file handle identifier")?;
        let path = self.parse_string_value()?;
        let token = self.expect_token()?;
        let file = match token.keyword() {
            Some(Keyword::Read) => {
                let resolved = self
                    .env
                    .resolve(&path, FilePurpose::Data)
                    .ok_or_else(|| self.error_here(ErrorKind::Io, format!("cannot find data file '{path}'")))?;
                let text = self
                    .env
                    .read(&resolved)
                    .map_err(|e| self.error_here(ErrorKind::Io, format!("cannot open data file '{path}': {e}")))?;
                let stream = self.lexer.register_stream(path, text);
                DataFile::Read {
                    cursor: Cursor::new(stream),
                    exhausted: false,
                }
            }
            Some(Keyword::Write) => DataFile::Write {
                path: path.into(),
                buffer: String::new(),
                append: false,
            },
            Some(Keyword::Append) => DataFile::Write {
                path: path.into(),
                buffer: String::new(),
                append: true,
            },
            _ => {
                return Err(self.error_at(
                    ErrorKind::Parse,
                    token.position,
                    "expected 'read', 'write', or 'append' after #fopen",
                ));
            }
        };
        let id = FileId(u32::try_from(self.files.len()).expect("file table exceeds u32"));
        self.files.push(file);
        self.symbols.add_global(name, Value::FileHandle(id));
        Ok(())
    }

    fn file_handle(&mut self, what: &str) -> ParseResult<FileId> {
        let token = self.expect_token()?;
        match &token.kind {
            TokenKind::TypedIdentifier(ValueTag::FileHandle, name) => {
                let name = name.clone();
                let found = self.symbols.find(&name).expect("typed identifier resolves");
                match self.symbols.copy_value(found.handle).map_err(|e| self.locate(e))? {
                    Value::FileHandle(id) => Ok(id),
                    _ => unreachable!("tag promised a file handle"),
                }
            }
            other => Err(self.error_at(
                ErrorKind::Type,
                token.position,
                format!("expected a file handle in {what}, found {}", other.describe()),
            )),
        }
    }

    fn parse_fclose(&mut self) -> ParseResult<()> {
        let id = self.file_handle("#fclose")?;
        self.flush_file(id.0 as usize)?;
        self.files[id.0 as usize] = DataFile::Closed;
        Ok(())
    }

    fn parse_read(&mut self) -> ParseResult<()> {
        self.expect_kind(&TokenKind::LeftParen, "'('")?;
        let id = self.file_handle("#read")?;
        while self.allow(&TokenKind::Comma)? {
            let name = self.expect_identifier_name("#read target")?;
            let value = self.read_data_value(id)?;
            self.symbols.add_global(name, value);
        }
        self.expect_kind(&TokenKind::RightParen, "')'")?;
        Ok(())
    }

    /// Reads one value from an open data stream: a signed number, a string
    /// literal, or a vector literal. End of file binds Undefined, testable
    /// with `defined()`.
    fn read_data_value(&mut self, id: FileId) -> ParseResult<Value> {
        let index = id.0 as usize;
        let cursor = match &self.files[index] {
            DataFile::Read { cursor, exhausted } => {
                if *exhausted {
                    return Ok(Value::Undefined);
                }
                *cursor
            }
            DataFile::Write { .. } => {
                return Err(self.error_here(ErrorKind::Io, "#read from a file opened for writing"));
            }
            DataFile::Closed => return Err(self.error_here(ErrorKind::Io, "#read from a closed file")),
        };

        self.lexer.enter_at(cursor.position())?;
        let result = self.read_data_value_inner();
        let reached = self.lexer.position();
        self.lexer.leave();

        match result {
            Ok(Some(value)) => {
                if let DataFile::Read { cursor, .. } = &mut self.files[index] {
                    cursor.seek(reached);
                }
                Ok(value)
            }
            Ok(None) => {
                if let DataFile::Read { exhausted, .. } = &mut self.files[index] {
                    *exhausted = true;
                }
                Ok(Value::Undefined)
            }
            Err(error) => Err(error),
        }
    }

    fn read_data_value_inner(&mut self) -> ParseResult<Option<Value>> {
        let Some(token) = self.lexer.next()? else {
            return Ok(None);
        };
        let value = match token.kind {
            TokenKind::Float(v) => Value::Scalar(v),
            TokenKind::Minus => {
                let next = self
                    .lexer
                    .next()?
                    .ok_or_else(|| self.error_here(ErrorKind::Parse, "dangling '-' in data file"))?;
                match next.kind {
                    TokenKind::Float(v) => Value::Scalar(-v),
                    other => {
                        return Err(self.error_at(
                            ErrorKind::Parse,
                            next.position,
                            format!("expected a number after '-' in data file, found {}", other.describe()),
                        ));
                    }
                }
            }
            TokenKind::StringLit(s) => Value::String(s),
            TokenKind::LeftAngle => {
                let mut components: SmallVec<[f64; 5]> = SmallVec::new();
                loop {
                    let item = self
                        .lexer
                        .next()?
                        .ok_or_else(|| self.error_here(ErrorKind::Parse, "unterminated vector in data file"))?;
                    let component = match item.kind {
                        TokenKind::Float(v) => v,
                        TokenKind::Minus => match self.lexer.next()?.map(|t| t.kind) {
                            Some(TokenKind::Float(v)) => -v,
                            _ => {
                                return Err(self.error_here(ErrorKind::Parse, "expected a number in data vector"));
                            }
                        },
                        other => {
                            return Err(self.error_at(
                                ErrorKind::Parse,
                                item.position,
                                format!("expected a number in data vector, found {}", other.describe()),
                            ));
                        }
                    };
                    components.push(component);
                    let sep = self
                        .lexer
                        .next()?
                        .ok_or_else(|| self.error_here(ErrorKind::Parse, "unterminated vector in data file"))?;
                    match sep.kind {
                        TokenKind::Comma => {}
                        TokenKind::RightAngle => break,
                        other => {
                            return Err(self.error_at(
                                ErrorKind::Parse,
                                sep.position,
                                format!("expected ',' or '>' in data vector, found {}", other.describe()),
                            ));
                        }
                    }
                }
                if !(2..=5).contains(&components.len()) {
                    return Err(self.error_here(ErrorKind::Parse, "data vectors have two to five components"));
                }
                super::expressions::components_to_value(&components)
            }
            other => {
                return Err(self.error_at(
                    ErrorKind::Parse,
                    token.position,
                    format!("unexpected {} in data file", other.describe()),
                ));
            }
        };
        // values in data files are comma-separated
        if let Some(sep) = self.lexer.next()? {
            if sep.kind != TokenKind::Comma {
                self.lexer.unget(sep);
            }
        }
        Ok(Some(value))
    }

    fn parse_write(&mut self) -> ParseResult<()> {
        self.expect_kind(&TokenKind::LeftParen, "'('")?;
        let id = self.file_handle("#write")?;
        let mut serialized = String::new();
        while self.allow(&TokenKind::Comma)? {
            let value = self.parse_expression()?;
            serialize_value(&mut serialized, &value)
                .map_err(|message| self.error_here(ErrorKind::Type, message))?;
        }
        self.expect_kind(&TokenKind::RightParen, "')'")?;
        match &mut self.files[id.0 as usize] {
            DataFile::Write { buffer, .. } => {
                buffer.push_str(&serialized);
                Ok(())
            }
            DataFile::Read { .. } => Err(self.error_here(ErrorKind::Io, "#write to a file opened for reading")),
            DataFile::Closed => Err(self.error_here(ErrorKind::Io, "#write to a closed file")),
        }
    }

    // --- small shared helpers ---

    pub(crate) fn expect_identifier_name(&mut self, what: &str) -> ParseResult<String> {
        let token = self.expect_token()?;
        match &token.kind {
            TokenKind::Identifier(name) | TokenKind::TypedIdentifier(_, name) => Ok(name.clone()),
            other => Err(self.error_at(
                ErrorKind::Parse,
                token.position,
                format!("expected {what}, found {}", other.describe()),
            )),
        }
    }

    /// Emits the deprecation-style warning for directives kept only for
    /// compatibility (`charset`).
    pub(crate) fn warn_deprecated(&mut self, what: &str, instead: &str) {
        let position = self.lexer.position();
        let file = self.lexer.file_name(position.stream).to_owned();
        self.diagnostics.count_warning();
        self.messages.diagnostic(
            Severity::Warning,
            &file,
            Some(position),
            &format!("{what} is deprecated; {instead}"),
        );
    }
}

/// `#for` continuation test: the loop ends when the variable passes `end`
/// in the direction of `step`.
fn for_continues(value: f64, end: f64, step: f64) -> bool {
    if step > 0.0 { value <= end } else { value >= end }
}

/// `#write` serialization: floats in shortest round-trip form, vectors in
/// angle brackets, strings verbatim.
fn serialize_value(out: &mut String, value: &Value) -> Result<(), String> {
    let mut buffer = ryu::Buffer::new();
    match value {
        Value::Scalar(v) => out.push_str(buffer.format(*v)),
        Value::String(s) => out.push_str(s),
        Value::Vector2(v) => push_vector(out, v),
        Value::Vector3(v) => push_vector(out, v),
        Value::Vector4(v) => push_vector(out, v),
        Value::Color(c) => push_vector(out, &c.to_array()),
        other => return Err(format!("cannot #write a {} value", other.tag())),
    }
    Ok(())
}

fn push_vector(out: &mut String, components: &[f64]) {
    let mut buffer = ryu::Buffer::new();
    out.push('<');
    for (i, component) in components.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(buffer.format(*component));
    }
    out.push('>');
}

/// Matching test for `#case`/`#range`.
#[derive(Debug, Clone, Copy)]
enum CaseMatch {
    Single(f64),
    Range(f64, f64),
}

impl CaseMatch {
    fn matches(self, value: f64) -> bool {
        const EPSILON: f64 = 1e-10;
        match self {
            Self::Single(v) => (v - value).abs() < EPSILON,
            Self::Range(lo, hi) => value >= lo && value <= hi,
        }
    }
}

impl Parser<'_> {
    /// Parses an array-declaration shape: `array[5]` or `array mixed [2][3]`,
    /// with an optional initializer `{ v, v, … }`.
    pub(crate) fn parse_array_declaration(&mut self) -> ParseResult<Value> {
        let mixed = {
            let token = self.expect_token()?;
            match &token.kind {
                TokenKind::Identifier(name) if name == "mixed" => true,
                _ => {
                    self.unget(token);
                    false
                }
            }
        };
        let mut dims = smallvec![];
        while self.allow(&TokenKind::LeftBracket)? {
            let size = self.parse_u32("array dimension size")? as usize;
            if size == 0 {
                return Err(self.error_here(ErrorKind::Domain, "array dimensions must be at least 1"));
            }
            dims.push(size);
            self.expect_kind(&TokenKind::RightBracket, "']'")?;
            if dims.len() > 5 {
                return Err(self.error_here(ErrorKind::Resource, "arrays have at most five dimensions"));
            }
        }
        if dims.is_empty() {
            return Err(self.error_here(ErrorKind::Parse, "expected '[' after 'array'"));
        }
        let mut array = crate::value::ArrayValue::new(dims, mixed);

        // optional initializer: a brace-wrapped value list filling dimension 0
        if self.allow(&TokenKind::LeftBrace)? {
            self.brace_stack.push((TokenKind::LeftBrace, self.lexer.position()));
            let mut index = 0usize;
            loop {
                if self.allow(&TokenKind::RightBrace)? {
                    self.brace_stack.pop();
                    break;
                }
                if index >= array.elements.len() {
                    return Err(self.error_here(ErrorKind::Domain, "too many array initializer values"));
                }
                let value = self.parse_rvalue(None, false)?;
                if !array.mixed {
                    if let Some(tag) = array.element_tag() {
                        if tag != value.tag() {
                            return Err(self.error_here(
                                ErrorKind::Type,
                                format!("array of {tag} cannot hold {}; declare it 'array mixed'", value.tag()),
                            ));
                        }
                    }
                }
                array.elements[index] = Some(value);
                index += 1;
                self.parse_comma()?;
            }
        }
        Ok(Value::Array(Box::new(array)))
    }

    /// Parses a dictionary declaration: `dictionary { ["key"] value, … }`
    /// or the empty `dictionary`.
    pub(crate) fn parse_dictionary_declaration(&mut self) -> ParseResult<Value> {
        let mut dict = crate::value::Dictionary::new();
        if self.allow(&TokenKind::LeftBrace)? {
            self.brace_stack.push((TokenKind::LeftBrace, self.lexer.position()));
            loop {
                if self.allow(&TokenKind::RightBrace)? {
                    self.brace_stack.pop();
                    break;
                }
                self.expect_kind(&TokenKind::LeftBracket, "'['")?;
                let key = self.parse_string_value()?;
                self.expect_kind(&TokenKind::RightBracket, "']'")?;
                let value = self.parse_rvalue(None, false)?;
                dict.insert(key, value);
                self.parse_comma()?;
            }
        }
        Ok(Value::Dictionary(Box::new(dict)))
    }

    /// `spline { [kind] time, <point>, … }`.
    pub(crate) fn parse_spline_declaration(&mut self) -> ParseResult<Value> {
        self.parse_begin()?;
        let kind = self.parse_spline_kind()?.unwrap_or(SplineKind::Linear);
        let mut entries: Vec<(f64, smallvec::SmallVec<[f64; 5]>)> = Vec::new();
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error_here(ErrorKind::Parse, "unexpected end of file in spline"));
            };
            if token.kind == TokenKind::RightBrace {
                self.unget(token);
                break;
            }
            self.unget(token);
            let time = self.parse_float()?;
            self.parse_comma()?;
            let value = self.parse_expression()?;
            let components: smallvec::SmallVec<[f64; 5]> = match value {
                Value::Scalar(s) => smallvec![s],
                Value::Vector2(v) => smallvec::SmallVec::from_slice(&v),
                Value::Vector3(v) => smallvec::SmallVec::from_slice(&v),
                Value::Vector4(v) => smallvec::SmallVec::from_slice(&v),
                Value::Color(c) => smallvec::SmallVec::from_slice(&c.to_array()),
                other => {
                    return Err(self.error_here(
                        ErrorKind::Type,
                        format!("spline control points must be numeric, found {}", other.tag()),
                    ));
                }
            };
            let at = entries.partition_point(|(k, _)| *k <= time);
            entries.insert(at, (time, components));
            self.parse_comma()?;
        }
        self.parse_end()?;
        if entries.len() < 2 {
            return Err(self.error_here(ErrorKind::Parse, "spline needs at least two control points"));
        }
        self.diagnostics.record_flag(crate::diag::FeatureFlag::ExperimentalSpline);
        Ok(Value::Spline(Box::new(crate::value::Spline { kind, entries })))
    }
}
