//! The parse session and driver loop.
//!
//! `Parser` owns every piece of session state: the lexer and its stream
//! stack, the symbol table, the condition stack of the directive processor,
//! the brace stack, open data files, random streams, and the `SceneData`
//! under construction. The grammar procedures live in the sibling modules
//! as `impl Parser` blocks:
//!
//! - `directives` — `#`-directive processing and macros
//! - `expressions` — the tagged-value expression evaluator
//! - `functions` — `function { … }` parsing and compilation
//! - `objects` — geometric primitives and CSG
//! - `materials` — textures, pigments, normals, finishes, blend maps
//! - `atmosphere` — fog, rainbow, sky_sphere, media
//! - `scene` — camera, lights, global settings, and the top-level loop
//!
//! The cooked-token layer here is what makes lexing context-sensitive:
//! identifiers are promoted to typed identifiers against the symbol table,
//! and `#` tokens are routed to the directive processor transparently, so
//! grammar code never sees a directive.

mod atmosphere;
mod directives;
mod expressions;
mod functions;
mod materials;
mod objects;
mod scene;

use std::sync::{Arc, atomic::AtomicBool, atomic::Ordering as AtomicOrdering};

use rand_chacha::ChaCha8Rng;

use crate::{
    diag::{Diagnostics, ErrorKind, MessageWriter, ParseError, ParseResult, Severity},
    io::SceneEnv,
    lex::Lexer,
    scenedata::SceneData,
    source::{Cursor, SourcePosition},
    symbol::SymbolTable,
    token::{Keyword, Token, TokenKind},
    value::Value,
};

/// Session options; the equivalent of the command-line state the original
/// threads through its scene data.
#[derive(Debug, Clone)]
pub struct ParserOptions {
    /// Language version times 100 (370 = 3.7). `#version` overrides it.
    pub language_version: u32,
    /// Value of the `clock` keyword.
    pub clock: f64,
    /// Value of the `clock_delta` keyword.
    pub clock_delta: f64,
    /// Warn when `#declare` changes the type of an existing name.
    pub strict_redefine: bool,
    /// Demote possible-errors (e.g. recursive function calls) to warnings.
    pub demote_possible_errors: bool,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            language_version: 370,
            clock: 0.0,
            clock_delta: 0.0,
            strict_redefine: true,
            demote_possible_errors: false,
        }
    }
}

/// One entry of the directive processor's condition stack.
///
/// The stack records, for each open `#if`/`#while`/`#for`/`#switch`/macro,
/// what the matching `#else`/`#case`/`#end` should do.
#[derive(Debug, Clone)]
pub(crate) enum CondState {
    /// Sentinel below everything else.
    Root,
    /// Live `#while` body; `start` points before the condition.
    WhileCond { start: SourcePosition },
    /// Live `#for` body.
    ForCond {
        variable: String,
        end: f64,
        step: f64,
        start: SourcePosition,
    },
    /// Live branch of an `#if` whose condition was true.
    IfTrue,
    /// Recorded when a false `#if` found its `#else`: the else branch runs.
    IfFalse,
    /// Live `#else` branch.
    Else,
    /// `#switch` seen, no matching case yet.
    Switch { value: f64 },
    /// Live `#case`/`#range` branch (falls through until `#break`).
    CaseTrue,
    /// A non-matching case being skipped.
    CaseFalse { value: f64 },
    /// Skipping to the matching `#end` (after `#break`).
    SkipToEnd,
    /// A macro body is being replayed; `#end` returns to the caller.
    InvokingMacro { closes_frame: bool },
    /// A macro body is being scanned at declaration time.
    DeclaringMacro,
}

/// An open `#fopen` stream.
#[derive(Debug)]
pub(crate) enum DataFile {
    /// Readable: a cursor over a registered stream.
    Read { cursor: Cursor, exhausted: bool },
    /// Writable: serialized text accumulates and flushes on close.
    Write {
        path: std::path::PathBuf,
        buffer: String,
        append: bool,
    },
    /// `#fclose`d; further use is an error.
    Closed,
}

/// The parse session.
pub struct Parser<'a> {
    pub(crate) lexer: Lexer,
    pub(crate) symbols: SymbolTable,
    pub(crate) scene: SceneData,
    pub(crate) options: ParserOptions,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) messages: &'a mut dyn MessageWriter,
    pub(crate) env: &'a mut dyn SceneEnv,
    pub(crate) cond_stack: Vec<CondState>,
    pub(crate) brace_stack: Vec<(TokenKind, SourcePosition)>,
    pub(crate) files: Vec<DataFile>,
    pub(crate) random_streams: Vec<ChaCha8Rng>,
    /// Angle-bracket nesting: while positive, `>` closes a vector instead
    /// of comparing.
    pub(crate) vector_depth: u32,
    /// Set by another thread to abort at the next token boundary.
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> Parser<'a> {
    pub fn new(
        file_name: impl Into<String>,
        text: impl Into<String>,
        env: &'a mut dyn SceneEnv,
        messages: &'a mut dyn MessageWriter,
        options: ParserOptions,
    ) -> Self {
        let mut scene = SceneData::new();
        scene.language_version = options.language_version;
        Self {
            lexer: Lexer::new(file_name, text),
            symbols: SymbolTable::new(),
            scene,
            options,
            diagnostics: Diagnostics::new(),
            messages,
            env,
            cond_stack: vec![CondState::Root],
            brace_stack: Vec::new(),
            files: Vec::new(),
            random_streams: Vec::new(),
            vector_depth: 0,
            cancel: None,
        }
    }

    /// Runs `body` with `>` treated as a vector terminator rather than a
    /// comparison operator. Every `<…>` group parser goes through here.
    pub(crate) fn in_vector<T>(&mut self, body: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        self.vector_depth += 1;
        let result = body(self);
        self.vector_depth -= 1;
        result
    }

    /// Installs a cancellation flag polled at token boundaries.
    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = Some(flag);
    }

    /// Runs the whole parse and returns the finished scene.
    pub fn parse(mut self) -> Result<SceneData, ParseError> {
        self.parse_frame()?;
        if self.cond_stack.len() > 1 {
            return Err(self.error_here(ErrorKind::Parse, "end of file reached with an open conditional or loop"));
        }
        if let Some((_, position)) = self.brace_stack.last() {
            let file = self.lexer.file_name(position.stream).to_owned();
            return Err(ParseError::new(ErrorKind::Parse, "missing '}' for this block").at(&file, *position));
        }
        self.flush_files()?;
        if self.scene.global_settings().assumed_gamma.is_none() {
            self.warn("scene did not declare assumed_gamma in global_settings");
        }
        self.diagnostics.emit_summary(self.messages);
        Ok(self.scene)
    }

    // --- diagnostics helpers ---

    pub(crate) fn error_here(&self, kind: ErrorKind, message: impl Into<String>) -> ParseError {
        let position = self.lexer.position();
        ParseError::new(kind, message).at(self.lexer.file_name(position.stream), position)
    }

    pub(crate) fn error_at(&self, kind: ErrorKind, position: SourcePosition, message: impl Into<String>) -> ParseError {
        ParseError::new(kind, message).at(self.lexer.file_name(position.stream), position)
    }

    /// Attaches the current position to an error raised by a helper that
    /// did not know it.
    pub(crate) fn locate(&self, mut error: ParseError) -> ParseError {
        if !error.is_located() {
            let position = self.lexer.position();
            error = error.at(self.lexer.file_name(position.stream), position);
        }
        error
    }

    /// Mutable access to a symbol slot with the current position attached
    /// to any dangling-reference error. The position is resolved before the
    /// mutable borrow starts.
    pub(crate) fn symbol_mut(&mut self, handle: crate::symbol::SymbolHandle) -> ParseResult<&mut Value> {
        let position = self.lexer.position();
        let file = self.lexer.file_name(position.stream).to_owned();
        match self.symbols.get_mut(handle) {
            Ok(value) => Ok(value),
            Err(error) => Err(error.at(&file, position)),
        }
    }

    pub(crate) fn warn(&mut self, message: impl Into<String>) {
        let position = self.lexer.position();
        let file = self.lexer.file_name(position.stream).to_owned();
        self.diagnostics.count_warning();
        self.messages
            .diagnostic(Severity::Warning, &file, Some(position), &message.into());
    }

    /// Reports a possible-error: an error unless the session demotes it.
    pub(crate) fn possible_error(&mut self, message: impl Into<String>) -> ParseResult<()> {
        let message = message.into();
        if self.options.demote_possible_errors {
            let position = self.lexer.position();
            let file = self.lexer.file_name(position.stream).to_owned();
            self.messages
                .diagnostic(Severity::PossibleError, &file, Some(position), &message);
            Ok(())
        } else {
            Err(self.error_here(ErrorKind::Parse, message))
        }
    }

    // --- the cooked token layer ---

    /// Produces the next grammar-visible token.
    ///
    /// Directives are processed transparently: a `#` token routes to the
    /// directive processor, which may rewrite session state, switch
    /// streams, or loop, and the scan continues with whatever token follows.
    /// Identifiers that resolve in the symbol table come back promoted to
    /// [`TokenKind::TypedIdentifier`].
    pub(crate) fn next_token(&mut self) -> ParseResult<Option<Token>> {
        loop {
            if let Some(flag) = &self.cancel {
                if flag.load(AtomicOrdering::Relaxed) {
                    return Err(self.error_here(ErrorKind::Parse, "parsing cancelled"));
                }
            }
            let Some(token) = self.lexer.next()? else {
                // end of a macro body without #end is a hard error; end of
                // the main stream is the normal end of input
                if matches!(self.cond_stack.last(), Some(CondState::InvokingMacro { .. })) {
                    return Err(self.error_here(ErrorKind::Parse, "macro body ended without #end"));
                }
                return Ok(None);
            };
            match token.kind {
                TokenKind::Hash => {
                    self.parse_directive()?;
                }
                TokenKind::Identifier(name) => {
                    let kind = match self.symbols.find(&name) {
                        Some(found) => {
                            if let Some(message) = self.symbols.take_deprecation(found.handle) {
                                self.warn(format!("identifier '{name}' is deprecated: {message}"));
                            }
                            // promote through parameter references, so a
                            // by-reference macro argument reads as its
                            // target's type
                            let tag = self
                                .symbols
                                .resolve(found.handle)
                                .and_then(|resolved| self.symbols.get(resolved))
                                .map_or(crate::value::ValueTag::Undefined, Value::tag);
                            TokenKind::TypedIdentifier(tag, name)
                        }
                        None => TokenKind::Identifier(name),
                    };
                    return Ok(Some(Token::new(kind, token.position)));
                }
                _ => return Ok(Some(token)),
            }
        }
    }

    /// Like [`Self::next_token`] but end of input is an error.
    pub(crate) fn expect_token(&mut self) -> ParseResult<Token> {
        self.next_token()?
            .ok_or_else(|| self.error_here(ErrorKind::Parse, "unexpected end of file"))
    }

    pub(crate) fn unget(&mut self, token: Token) {
        self.lexer.unget(token);
    }

    /// Consumes the next token when `want` matches it.
    pub(crate) fn allow(&mut self, want: &TokenKind) -> ParseResult<bool> {
        match self.next_token()? {
            Some(token) if token.kind == *want => Ok(true),
            Some(token) => {
                self.unget(token);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Consumes the next token when it is the given keyword.
    pub(crate) fn allow_keyword(&mut self, keyword: Keyword) -> ParseResult<bool> {
        self.allow(&TokenKind::Keyword(keyword))
    }

    /// Requires the given token kind.
    pub(crate) fn expect_kind(&mut self, want: &TokenKind, what: &str) -> ParseResult<Token> {
        let token = self.expect_token()?;
        if token.kind == *want {
            Ok(token)
        } else {
            Err(self.error_at(
                ErrorKind::Parse,
                token.position,
                format!("expected {what}, found {}", token.kind.describe()),
            ))
        }
    }

    /// Requires the given keyword.
    pub(crate) fn expect_keyword(&mut self, keyword: Keyword, what: &str) -> ParseResult<Token> {
        self.expect_kind(&TokenKind::Keyword(keyword), what)
    }

    /// Consumes `{`, recording it on the brace stack for diagnostics.
    pub(crate) fn parse_begin(&mut self) -> ParseResult<()> {
        let token = self.expect_kind(&TokenKind::LeftBrace, "'{'")?;
        self.brace_stack.push((TokenKind::LeftBrace, token.position));
        Ok(())
    }

    /// Consumes `}`, popping the brace stack. A mismatch points back at the
    /// recorded opener.
    pub(crate) fn parse_end(&mut self) -> ParseResult<()> {
        let token = self.expect_token()?;
        if token.kind == TokenKind::RightBrace {
            self.brace_stack.pop();
            return Ok(());
        }
        let message = match self.brace_stack.last() {
            Some((_, open)) => format!(
                "expected '}}' to close the block opened at {open}, found {}",
                token.kind.describe()
            ),
            None => format!("expected '}}', found {}", token.kind.describe()),
        };
        Err(self.error_at(ErrorKind::Parse, token.position, message))
    }

    /// Consumes an optional comma separator.
    pub(crate) fn parse_comma(&mut self) -> ParseResult<()> {
        self.allow(&TokenKind::Comma)?;
        Ok(())
    }

    /// Consumes a semicolon; required after scalar `#declare` under the
    /// canonical language version, tolerated elsewhere.
    pub(crate) fn parse_semicolon(&mut self, required: bool) -> ParseResult<()> {
        if !self.allow(&TokenKind::Semicolon)? && required {
            return Err(self.error_here(ErrorKind::Parse, "expected ';' after this declaration"));
        }
        Ok(())
    }

    // --- file handle bookkeeping ---

    /// Flushes unwritten `#fopen write` buffers at end of parse.
    pub(crate) fn flush_files(&mut self) -> ParseResult<()> {
        for index in 0..self.files.len() {
            self.flush_file(index)?;
        }
        Ok(())
    }

    pub(crate) fn flush_file(&mut self, index: usize) -> ParseResult<()> {
        if let DataFile::Write { path, buffer, append } = &mut self.files[index] {
            if !buffer.is_empty() {
                let contents = std::mem::take(buffer);
                let append = *append;
                let path = path.clone();
                self.env
                    .write(&path, &contents, append)
                    .map_err(|e| ParseError::new(ErrorKind::Io, format!("cannot write '{}': {e}", path.display())))?;
                // subsequent flushes of the same handle append
                if let DataFile::Write { append, .. } = &mut self.files[index] {
                    *append = true;
                }
            }
        }
        Ok(())
    }
}

/// Convenience entry point: parse a scene from text with injected
/// environment and options.
pub fn parse_scene(
    file_name: &str,
    text: &str,
    env: &mut dyn SceneEnv,
    messages: &mut dyn MessageWriter,
    options: ParserOptions,
) -> Result<SceneData, ParseError> {
    Parser::new(file_name, text, env, messages, options).parse()
}

/// Expands a `MacroDef` checksum over body text: FNV-1a, the same function
/// used at declaration and at invocation.
pub(crate) fn body_checksum(text: &str) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in text.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
