//! The character-level scanner.
//!
//! The lexer owns the source table and the include stack, and produces raw
//! tokens: reserved words, identifiers, literals, and punctuation. It is
//! deliberately context-free — identifier promotion and skip-state handling
//! live in the parser's cooked-token layer, which injects the symbol table
//! and the directive processor's condition stack.

use crate::{
    diag::{ErrorKind, ParseError, ParseResult},
    source::{Cursor, SourceMap, SourcePosition, StreamId},
    token::{Keyword, Token, TokenKind},
};

/// Bound on nested `#include` (and macro re-entry) depth.
pub const MAX_INCLUDE_DEPTH: usize = 32;

/// Why a stream frame is on the stack; only includes pop automatically at
/// end of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Main,
    Include,
    /// Macro bodies and `#read` data files end by explicit pop, never by
    /// running off the end of the stream.
    Seeked,
}

#[derive(Debug)]
struct StreamFrame {
    cursor: Cursor,
    kind: FrameKind,
}

#[derive(Debug)]
pub(crate) struct Lexer {
    sources: SourceMap,
    stack: Vec<StreamFrame>,
    /// Pushed-back tokens, innermost last. Grammar code ungets one token;
    /// the macro-argument parser needs a second slot to back out of its
    /// identifier-then-separator lookahead.
    ungot: Vec<Token>,
    /// Block comments nest in legacy mode (language version < 3.5).
    pub nested_comments: bool,
}

impl Lexer {
    /// Creates a lexer over the main scene text.
    pub fn new(file_name: impl Into<String>, text: impl Into<String>) -> Self {
        let mut sources = SourceMap::new();
        let stream = sources.register(file_name, text);
        Self {
            sources,
            stack: vec![StreamFrame {
                cursor: Cursor::new(stream),
                kind: FrameKind::Main,
            }],
            ungot: Vec::new(),
            nested_comments: false,
        }
    }

    #[inline]
    pub fn sources(&self) -> &SourceMap {
        &self.sources
    }

    /// Registers an additional stream without entering it (used for
    /// `#fopen` data files, which are read through [`Self::enter_at`]).
    pub fn register_stream(&mut self, name: impl Into<String>, text: impl Into<String>) -> StreamId {
        self.sources.register(name, text)
    }

    /// Current position: the position of the next token to be produced.
    pub fn position(&self) -> SourcePosition {
        match self.ungot.last() {
            Some(token) => token.position,
            None => self.current().position(),
        }
    }

    /// Name of the stream the lexer is currently reading.
    pub fn current_file(&self) -> &str {
        self.sources.name(self.current().stream)
    }

    /// Display name for any stream.
    pub fn file_name(&self, stream: StreamId) -> &str {
        self.sources.name(stream)
    }

    /// Raw text between two positions in one stream, for macro checksums.
    pub fn text_between(&self, start: SourcePosition, end: SourcePosition) -> &str {
        debug_assert_eq!(start.stream, end.stream);
        let text = self.sources.get(start.stream).text();
        &text[start.offset as usize..end.offset as usize]
    }

    fn current(&self) -> &Cursor {
        &self.stack.last().expect("stream stack is never empty").cursor
    }

    fn current_mut(&mut self) -> &mut Cursor {
        &mut self.stack.last_mut().expect("stream stack is never empty").cursor
    }

    fn peek_char(&self) -> Option<char> {
        self.current().peek(&self.sources)
    }

    fn peek2_char(&self) -> Option<char> {
        self.current().peek2(&self.sources)
    }

    fn advance_char(&mut self) -> Option<char> {
        let frame = self.stack.last_mut().expect("stream stack is never empty");
        frame.cursor.advance(&self.sources)
    }

    fn at_end_current(&self) -> bool {
        self.current().at_end(&self.sources)
    }

    fn error(&self, kind: ErrorKind, position: SourcePosition, message: impl Into<String>) -> ParseError {
        ParseError::new(kind, message).at(self.sources.name(position.stream), position)
    }

    /// Pushes an include file. The token stream continues in the include
    /// and falls back to the current stream at its end.
    pub fn push_include(&mut self, name: impl Into<String>, text: impl Into<String>) -> ParseResult<()> {
        if self.stack.len() >= MAX_INCLUDE_DEPTH {
            return Err(self.error(
                ErrorKind::Resource,
                self.position(),
                format!("include files nested more than {MAX_INCLUDE_DEPTH} levels deep"),
            ));
        }
        debug_assert!(self.ungot.is_empty(), "include pushed with a token pending");
        let stream = self.sources.register(name, text);
        self.stack.push(StreamFrame {
            cursor: Cursor::new(stream),
            kind: FrameKind::Include,
        });
        Ok(())
    }

    /// Enters an already-registered stream at a saved position (macro
    /// invocation, `#read`). Must be paired with [`Self::leave`].
    pub fn enter_at(&mut self, position: SourcePosition) -> ParseResult<()> {
        if self.stack.len() >= MAX_INCLUDE_DEPTH {
            return Err(self.error(
                ErrorKind::Resource,
                self.position(),
                format!("macro invocations nested more than {MAX_INCLUDE_DEPTH} levels deep"),
            ));
        }
        self.ungot.clear();
        let mut cursor = Cursor::new(position.stream);
        cursor.seek(position);
        self.stack.push(StreamFrame {
            cursor,
            kind: FrameKind::Seeked,
        });
        Ok(())
    }

    /// Leaves a stream entered with [`Self::enter_at`], returning the
    /// position reached, and resumes the previous stream.
    pub fn leave(&mut self) -> SourcePosition {
        debug_assert!(matches!(
            self.stack.last().map(|f| f.kind),
            Some(FrameKind::Seeked)
        ));
        self.ungot.clear();
        let frame = self.stack.pop().expect("leave() without matching enter_at()");
        frame.cursor.position()
    }

    /// Seeks within the current stream (the `#while`/`#for` loop jump).
    pub fn seek(&mut self, position: SourcePosition) {
        self.ungot.clear();
        let cursor = self.current_mut();
        debug_assert_eq!(cursor.stream, position.stream, "loop seek across streams");
        cursor.seek(position);
    }

    /// Pushes back a token; the next `next()` returns it. Depth two is
    /// the most any caller needs (macro-argument lookahead); more is a
    /// parser bug.
    pub fn unget(&mut self, token: Token) {
        debug_assert!(self.ungot.len() < 2, "unget depth exceeded");
        self.ungot.push(token);
    }

    /// Produces the next token, or `None` at the end of the main stream.
    ///
    /// Ends of include streams are popped transparently; the end of a
    /// seeked stream (macro body) also yields `None`, and the caller decides
    /// whether that is a missing `#end`.
    pub fn next(&mut self) -> ParseResult<Option<Token>> {
        if let Some(token) = self.ungot.pop() {
            return Ok(Some(token));
        }
        loop {
            self.skip_blank()?;
            if self.at_end_current() {
                match self.stack.last().map(|f| f.kind) {
                    Some(FrameKind::Include) => {
                        self.stack.pop();
                        continue;
                    }
                    _ => return Ok(None),
                }
            }
            return self.scan_token().map(Some);
        }
    }

    /// Skips whitespace and comments.
    fn skip_blank(&mut self) -> ParseResult<()> {
        loop {
            let Some(c) = self.peek_char() else {
                return Ok(());
            };
            if c.is_whitespace() {
                self.advance_char();
                continue;
            }
            if c == '/' {
                match self.peek2_char() {
                    Some('/') => {
                        while let Some(c) = self.advance_char() {
                            if c == '\n' {
                                break;
                            }
                        }
                        continue;
                    }
                    Some('*') => {
                        self.skip_block_comment()?;
                        continue;
                    }
                    _ => return Ok(()),
                }
            }
            return Ok(());
        }
    }

    fn skip_block_comment(&mut self) -> ParseResult<()> {
        let open = self.current().position();
        self.advance_char(); // '/'
        self.advance_char(); // '*'
        let mut depth = 1u32;
        loop {
            let Some(c) = self.advance_char() else {
                return Err(self.error(ErrorKind::Lex, open, "unterminated block comment"));
            };
            match c {
                '*' if self.peek_char() == Some('/') => {
                    self.advance_char();
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                '/' if self.nested_comments && self.peek_char() == Some('*') => {
                    self.advance_char();
                    depth += 1;
                }
                _ => {}
            }
        }
    }

    fn scan_token(&mut self) -> ParseResult<Token> {
        let position = self.current().position();
        let c = self.peek_char().expect("scan_token at end of stream");

        if c.is_ascii_digit() || (c == '.' && self.peek2_char().is_some_and(|d| d.is_ascii_digit()))
        {
            return Ok(Token::new(self.scan_number(), position));
        }
        if c == '_' || c.is_ascii_alphabetic() {
            return Ok(Token::new(self.scan_identifier(), position));
        }
        if c == '"' {
            let kind = self.scan_string(position)?;
            return Ok(Token::new(kind, position));
        }

        self.advance_char();
        let two = |lexer: &mut Self, kind| {
            lexer.advance_char();
            kind
        };
        let kind = match c {
            '#' => TokenKind::Hash,
            '{' => TokenKind::LeftBrace,
            '}' => TokenKind::RightBrace,
            '(' => TokenKind::LeftParen,
            ')' => TokenKind::RightParen,
            '[' => TokenKind::LeftBracket,
            ']' => TokenKind::RightBracket,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '^' => TokenKind::Caret,
            '=' => TokenKind::Equals,
            '&' => TokenKind::Amp,
            '|' => TokenKind::Pipe,
            ',' => TokenKind::Comma,
            '.' => TokenKind::Period,
            ';' => TokenKind::Semicolon,
            '<' if self.peek_char() == Some('=') => two(self, TokenKind::LessEq),
            '<' => TokenKind::LeftAngle,
            '>' if self.peek_char() == Some('=') => two(self, TokenKind::GreaterEq),
            '>' => TokenKind::RightAngle,
            '!' if self.peek_char() == Some('=') => two(self, TokenKind::NotEquals),
            '!' => TokenKind::Bang,
            other => {
                return Err(self.error(
                    ErrorKind::Lex,
                    position,
                    format!("illegal character '{other}' (U+{:04X})", other as u32),
                ));
            }
        };
        Ok(Token::new(kind, position))
    }

    /// Greedy numeric scan. A trailing `.` with no digit after it is left
    /// for the next token, as is an `e` that does not start an exponent.
    fn scan_number(&mut self) -> TokenKind {
        let mut text = String::new();
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance_char();
            } else {
                break;
            }
        }
        if self.peek_char() == Some('.')
            && self.peek2_char().is_some_and(|c| c.is_ascii_digit())
        {
            text.push('.');
            self.advance_char();
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance_char();
                } else {
                    break;
                }
            }
        }
        if matches!(self.peek_char(), Some('e' | 'E')) {
            let after = self.peek2_char();
            let digits_follow = match after {
                Some(d) if d.is_ascii_digit() => true,
                Some('+' | '-') => {
                    // need a digit after the sign; peek three deep by probing
                    // a cloned cursor
                    let mut probe = *self.current();
                    probe.advance(&self.sources);
                    probe.advance(&self.sources);
                    probe.peek(&self.sources).is_some_and(|d| d.is_ascii_digit())
                }
                _ => false,
            };
            if digits_follow {
                text.push('e');
                self.advance_char();
                if let Some(sign @ ('+' | '-')) = self.peek_char() {
                    text.push(sign);
                    self.advance_char();
                }
                while let Some(c) = self.peek_char() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        self.advance_char();
                    } else {
                        break;
                    }
                }
            }
        }
        let value = text.parse::<f64>().expect("scanned digits always parse");
        TokenKind::Float(value)
    }

    fn scan_identifier(&mut self) -> TokenKind {
        let mut text = String::new();
        while let Some(c) = self.peek_char() {
            if c == '_' || c.is_ascii_alphanumeric() {
                text.push(c);
                self.advance_char();
            } else {
                break;
            }
        }
        match Keyword::lookup(&text) {
            Some(keyword) => TokenKind::Keyword(keyword),
            None => TokenKind::Identifier(text),
        }
    }

    fn scan_string(&mut self, open: SourcePosition) -> ParseResult<TokenKind> {
        self.advance_char(); // opening quote
        let mut out = String::new();
        loop {
            let Some(c) = self.advance_char() else {
                return Err(self.error(ErrorKind::Lex, open, "unterminated string literal"));
            };
            match c {
                '"' => return Ok(TokenKind::StringLit(out)),
                '\\' => out.push(self.scan_escape(open)?),
                '\n' => {
                    return Err(self.error(ErrorKind::Lex, open, "unterminated string literal"));
                }
                other => out.push(other),
            }
        }
    }

    fn scan_escape(&mut self, open: SourcePosition) -> ParseResult<char> {
        let position = self.current().position();
        let Some(c) = self.advance_char() else {
            return Err(self.error(ErrorKind::Lex, open, "unterminated string literal"));
        };
        Ok(match c {
            'a' => '\u{7}',
            'b' => '\u{8}',
            'f' => '\u{c}',
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            'v' => '\u{b}',
            '0' => '\0',
            '\\' => '\\',
            '\'' => '\'',
            '"' => '"',
            'u' => self.scan_unicode_escape(position)?,
            other => {
                return Err(self.error(
                    ErrorKind::Lex,
                    position,
                    format!("invalid escape sequence '\\{other}'"),
                ));
            }
        })
    }

    fn scan_unicode_escape(&mut self, position: SourcePosition) -> ParseResult<char> {
        let high = self.scan_hex4(position)?;
        // combine surrogate pairs written as two \u escapes
        if (0xD800..0xDC00).contains(&high) {
            let mut probe = *self.current();
            if probe.advance(&self.sources) == Some('\\') && probe.advance(&self.sources) == Some('u') {
                self.advance_char();
                self.advance_char();
                let low = self.scan_hex4(position)?;
                if (0xDC00..0xE000).contains(&low) {
                    let combined = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                    return char::from_u32(combined)
                        .ok_or_else(|| self.error(ErrorKind::Lex, position, "invalid unicode escape"));
                }
                return Err(self.error(ErrorKind::Lex, position, "unpaired surrogate in unicode escape"));
            }
            return Err(self.error(ErrorKind::Lex, position, "unpaired surrogate in unicode escape"));
        }
        char::from_u32(high).ok_or_else(|| self.error(ErrorKind::Lex, position, "invalid unicode escape"))
    }

    fn scan_hex4(&mut self, position: SourcePosition) -> ParseResult<u32> {
        let mut value = 0u32;
        for _ in 0..4 {
            let Some(c) = self.advance_char() else {
                return Err(self.error(ErrorKind::Lex, position, "truncated \\u escape"));
            };
            let digit = c
                .to_digit(16)
                .ok_or_else(|| self.error(ErrorKind::Lex, position, format!("invalid hex digit '{c}' in \\u escape")))?;
            value = value * 16 + digit;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new("test.pov", input);
        let mut out = Vec::new();
        while let Some(token) = lexer.next().unwrap() {
            out.push(token.kind);
        }
        out
    }

    #[test]
    fn test_basic_tokens() {
        assert_eq!(
            kinds("sphere { <0, 1.5, 2e3> , .5 }"),
            vec![
                TokenKind::Keyword(Keyword::Sphere),
                TokenKind::LeftBrace,
                TokenKind::LeftAngle,
                TokenKind::Float(0.0),
                TokenKind::Comma,
                TokenKind::Float(1.5),
                TokenKind::Comma,
                TokenKind::Float(2000.0),
                TokenKind::RightAngle,
                TokenKind::Comma,
                TokenKind::Float(0.5),
                TokenKind::RightBrace,
            ]
        );
    }

    #[test]
    fn test_trailing_dot_reverts() {
        assert_eq!(
            kinds("3.x"),
            vec![
                TokenKind::Float(3.0),
                TokenKind::Period,
                TokenKind::Keyword(Keyword::X),
            ]
        );
    }

    #[test]
    fn test_exponent_without_digits_reverts() {
        assert_eq!(
            kinds("2e"),
            vec![TokenKind::Float(2.0), TokenKind::Identifier("e".to_owned())]
        );
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            kinds("1 // line\n /* block\n over lines */ 2"),
            vec![TokenKind::Float(1.0), TokenKind::Float(2.0)]
        );
    }

    #[test]
    fn test_nested_comments_only_in_legacy_mode() {
        let mut lexer = Lexer::new("test.pov", "/* outer /* inner */ still */ 1");
        lexer.nested_comments = true;
        assert_eq!(lexer.next().unwrap().unwrap().kind, TokenKind::Float(1.0));

        // without legacy mode, the comment ends at the first */
        assert_eq!(
            kinds("/* outer /* inner */ tail */ 1"),
            vec![
                TokenKind::Identifier("tail".to_owned()),
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Float(1.0),
            ]
        );
    }

    #[test]
    fn test_unterminated_comment_points_at_opening() {
        let mut lexer = Lexer::new("test.pov", "1 /* never closed");
        lexer.next().unwrap();
        let err = lexer.next().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Lex);
        assert_eq!(err.position.unwrap().column, 3);
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\tb\n\"q\" é""#),
            vec![TokenKind::StringLit("a\tb\n\"q\" é".to_owned())]
        );
    }

    #[test]
    fn test_surrogate_pair_combines() {
        assert_eq!(
            kinds(r#""\uD83D\uDE00""#),
            vec![TokenKind::StringLit("😀".to_owned())]
        );
    }

    #[test]
    fn test_unterminated_string_is_fatal() {
        let mut lexer = Lexer::new("test.pov", "\"open");
        assert_eq!(lexer.next().unwrap_err().kind, ErrorKind::Lex);
    }

    #[test]
    fn test_relational_operators() {
        assert_eq!(
            kinds("a <= b >= c != d < e > f"),
            vec![
                TokenKind::Identifier("a".to_owned()),
                TokenKind::LessEq,
                TokenKind::Identifier("b".to_owned()),
                TokenKind::GreaterEq,
                TokenKind::Identifier("c".to_owned()),
                TokenKind::NotEquals,
                TokenKind::Identifier("d".to_owned()),
                TokenKind::LeftAngle,
                TokenKind::Identifier("e".to_owned()),
                TokenKind::RightAngle,
                TokenKind::Identifier("f".to_owned()),
            ]
        );
    }

    #[test]
    fn test_unget_depth_one() {
        let mut lexer = Lexer::new("test.pov", "1 2");
        let first = lexer.next().unwrap().unwrap();
        lexer.unget(first.clone());
        assert_eq!(lexer.next().unwrap().unwrap(), first);
        assert_eq!(lexer.next().unwrap().unwrap().kind, TokenKind::Float(2.0));
    }

    #[test]
    fn test_include_stack_pops_transparently() {
        let mut lexer = Lexer::new("main.pov", "1 9");
        assert_eq!(lexer.next().unwrap().unwrap().kind, TokenKind::Float(1.0));
        lexer.push_include("inc.inc", "7 8").unwrap();
        assert_eq!(lexer.next().unwrap().unwrap().kind, TokenKind::Float(7.0));
        assert_eq!(lexer.next().unwrap().unwrap().kind, TokenKind::Float(8.0));
        // include exhausted: falls back to main
        assert_eq!(lexer.next().unwrap().unwrap().kind, TokenKind::Float(9.0));
        assert!(lexer.next().unwrap().is_none());
    }

    #[test]
    fn test_include_depth_bound() {
        let mut lexer = Lexer::new("main.pov", "");
        for i in 0..MAX_INCLUDE_DEPTH - 1 {
            lexer.push_include(format!("f{i}.inc"), "").unwrap();
        }
        let err = lexer.push_include("deep.inc", "").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Resource);
    }

    #[test]
    fn test_enter_at_and_leave() {
        let mut lexer = Lexer::new("main.pov", "alpha beta gamma");
        let _alpha = lexer.next().unwrap().unwrap();
        let beta_pos = lexer.position();
        let _beta = lexer.next().unwrap().unwrap();
        let _gamma = lexer.next().unwrap().unwrap();
        // jump back to beta the way a macro invocation would
        lexer.enter_at(beta_pos).unwrap();
        let again = lexer.next().unwrap().unwrap();
        assert_eq!(again.kind, TokenKind::Identifier("beta".to_owned()));
        lexer.leave();
        assert!(lexer.next().unwrap().is_none());
    }

    #[test]
    fn test_hash_token() {
        assert_eq!(
            kinds("#declare"),
            vec![TokenKind::Hash, TokenKind::Keyword(Keyword::Declare)]
        );
    }

    #[test]
    fn test_position_partition_of_nonblank_input() {
        // lexer round-trip property: token positions are strictly
        // increasing and each token starts where the previous gap ended
        let input = "sphere{<1,2,3>,4} // tail";
        let mut lexer = Lexer::new("t.pov", input);
        let mut last_offset = 0u32;
        while let Some(token) = lexer.next().unwrap() {
            assert!(token.position.offset >= last_offset);
            last_offset = token.position.offset + 1;
        }
    }
}
