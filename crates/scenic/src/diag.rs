//! Diagnostics: error types, severities, and the message sink.
//!
//! Every parse-time failure is a [`ParseError`] carrying a kind, a message,
//! and the source position where it was detected. Errors unwind the
//! recursive-descent stack via `Result`; warnings never unwind, they go
//! straight to the session's [`MessageWriter`].

use std::fmt;

use strum::{Display, IntoStaticStr};

use crate::source::SourcePosition;

/// Result type alias for all parse-time operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Classification of a parse-time failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ErrorKind {
    /// Unterminated comment/string, illegal character, invalid escape.
    Lex,
    /// Unexpected token, unbalanced braces, missing required keyword.
    Parse,
    /// Wrong value kind for context (e.g. color where scalar expected).
    Type,
    /// Numeric out-of-range at parse time (e.g. negative radius).
    Domain,
    /// Redefinition conflict, undefined or dangling reference.
    Symbol,
    /// Failure to open an include or data file.
    Io,
    /// Include-depth overflow, function program too large.
    Resource,
    /// Raised by the function VM during evaluation.
    Runtime,
}

/// Severity attached to emitted diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum Severity {
    /// Aborts the parse immediately.
    Fatal,
    /// Recorded; the parser may resynchronize and continue.
    Error,
    /// Never unwinds.
    Warning,
    /// An error the session options may demote to a warning.
    PossibleError,
}

/// A parse-time error with position information.
///
/// The file name is resolved at construction time (the lexer and parser both
/// hold the stream table), so the error is self-contained once built.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub kind: ErrorKind,
    pub message: String,
    pub file: String,
    pub position: Option<SourcePosition>,
}

impl ParseError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            file: String::new(),
            position: None,
        }
    }

    #[must_use]
    pub fn at(mut self, file: &str, position: SourcePosition) -> Self {
        self.file = file.to_owned();
        self.position = Some(position);
        self
    }

    /// True when this error already carries a position.
    ///
    /// The parser driver attaches the current token position to errors
    /// raised from deep helpers that do not know it.
    pub fn is_located(&self) -> bool {
        self.position.is_some()
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(pos) if !self.file.is_empty() => {
                write!(f, "{} error in {} at {}: {}", self.kind, self.file, pos, self.message)
            }
            Some(pos) => write!(f, "{} error at {}: {}", self.kind, pos, self.message),
            None => write!(f, "{} error: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ParseError {}

/// Sink for the language's text channels and for diagnostics.
///
/// `#debug`, `#warning`, and emitted warnings/possible-errors all land here.
/// Hosts inject an implementation; nothing in the crate writes to stdout or
/// stderr on its own.
pub trait MessageWriter {
    /// Output of the `#debug` directive.
    fn debug(&mut self, message: &str);

    /// A diagnostic that does not abort the parse.
    fn diagnostic(&mut self, severity: Severity, file: &str, position: Option<SourcePosition>, message: &str);
}

/// Default writer: `#debug` to stdout, diagnostics to stderr.
#[derive(Debug, Default)]
pub struct StdMessages;

impl MessageWriter for StdMessages {
    fn debug(&mut self, message: &str) {
        println!("{message}");
    }

    fn diagnostic(&mut self, severity: Severity, file: &str, position: Option<SourcePosition>, message: &str) {
        match position {
            Some(pos) if !file.is_empty() => eprintln!("{severity}: {file} {pos}: {message}"),
            _ => eprintln!("{severity}: {message}"),
        }
    }
}

/// Writer that collects everything into strings, for tests.
#[derive(Debug, Default)]
pub struct CollectMessages {
    debug: String,
    diagnostics: Vec<(Severity, String)>,
}

impl CollectMessages {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn debug_output(&self) -> &str {
        &self.debug
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[(Severity, String)] {
        &self.diagnostics
    }

    /// True when any collected diagnostic message contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.diagnostics.iter().any(|(_, m)| m.contains(needle))
    }
}

impl MessageWriter for CollectMessages {
    fn debug(&mut self, message: &str) {
        self.debug.push_str(message);
        self.debug.push('\n');
    }

    fn diagnostic(&mut self, severity: Severity, _file: &str, _position: Option<SourcePosition>, message: &str) {
        self.diagnostics.push((severity, message.to_owned()));
    }
}

/// Writer that ignores all output, for benchmarks.
#[derive(Debug, Default)]
pub struct NoMessages;

impl MessageWriter for NoMessages {
    fn debug(&mut self, _message: &str) {}

    fn diagnostic(&mut self, _severity: Severity, _file: &str, _position: Option<SourcePosition>, _message: &str) {}
}

/// Language extensions that trigger the end-of-parse summary warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum FeatureFlag {
    /// `spline { … }` with the freeform interpolation kinds.
    ExperimentalSpline,
    /// Functions returning colors from pattern contexts.
    ExperimentalFunctionPattern,
    /// `#read`/`#write` of compound values.
    BetaFileValues,
}

/// Per-session record of feature usage and warning counts.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warning_count: u32,
    error_count: u32,
    flags: ahash::AHashSet<FeatureFlag>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_warning(&mut self) {
        self.warning_count += 1;
    }

    pub fn count_error(&mut self) {
        self.error_count += 1;
    }

    #[must_use]
    pub fn warning_count(&self) -> u32 {
        self.warning_count
    }

    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn record_flag(&mut self, flag: FeatureFlag) {
        self.flags.insert(flag);
    }

    /// Emits the summary warning naming every experimental or beta feature
    /// the scene used. Called once when the parse finishes.
    pub fn emit_summary(&mut self, writer: &mut dyn MessageWriter) {
        if self.flags.is_empty() {
            return;
        }
        let mut names: Vec<&str> = self.flags.iter().map(|f| f.into()).collect();
        names.sort_unstable();
        let message = format!(
            "this scene used the following experimental or beta features: {}; \
             their syntax and behavior may change in future versions",
            names.join(", ")
        );
        self.count_warning();
        writer.diagnostic(Severity::Warning, "", None, &message);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_error_display() {
        let err = ParseError::new(ErrorKind::Parse, "unexpected token");
        assert_eq!(err.to_string(), "Parse error: unexpected token");
    }

    #[test]
    fn test_feature_summary_emitted_once() {
        let mut diags = Diagnostics::new();
        diags.record_flag(FeatureFlag::ExperimentalSpline);
        diags.record_flag(FeatureFlag::ExperimentalSpline);
        let mut out = CollectMessages::new();
        diags.emit_summary(&mut out);
        assert_eq!(out.diagnostics().len(), 1);
        assert!(out.contains("ExperimentalSpline"));
    }

    #[test]
    fn test_no_summary_without_flags() {
        let mut diags = Diagnostics::new();
        let mut out = CollectMessages::new();
        diags.emit_summary(&mut out);
        assert!(out.diagnostics().is_empty());
    }
}
