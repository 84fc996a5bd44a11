//! Source text storage and positions.
//!
//! Every input stream (the main scene file, every `#include` target, and
//! every `#fopen` data file read back as tokens) is registered here once and
//! addressed by a [`StreamId`]. Macros record `(StreamId, byte offset)`
//! pairs, so streams must stay alive for the whole parse session even after
//! their include frame is popped.

use std::fmt;

/// Unique identifier for a registered source stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct StreamId(u32);

impl StreamId {
    pub(crate) fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("stream table exceeds u32"))
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A position inside a registered source stream.
///
/// `line` and `column` are 1-based; `offset` is the byte offset into the
/// stream text. The byte offset is authoritative (macro invocation seeks by
/// it); line and column exist for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SourcePosition {
    pub stream: StreamId,
    pub line: u32,
    pub column: u32,
    pub offset: u32,
}

impl SourcePosition {
    pub(crate) fn start_of(stream: StreamId) -> Self {
        Self {
            stream,
            line: 1,
            column: 1,
            offset: 0,
        }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {} column {}", self.line, self.column)
    }
}

/// One registered input text with its display name.
#[derive(Debug)]
pub(crate) struct SourceText {
    name: String,
    text: String,
}

impl SourceText {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Table of all source streams opened during a parse session.
///
/// Streams are append-only; ids remain valid until the session is dropped.
#[derive(Debug, Default)]
pub(crate) struct SourceMap {
    streams: Vec<SourceText>,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stream, stripping a UTF-8 BOM if present.
    pub fn register(&mut self, name: impl Into<String>, text: impl Into<String>) -> StreamId {
        let mut text = text.into();
        if text.starts_with('\u{feff}') {
            text.drain(..'\u{feff}'.len_utf8());
        }
        let id = StreamId::new(self.streams.len());
        self.streams.push(SourceText {
            name: name.into(),
            text,
        });
        id
    }

    pub fn get(&self, id: StreamId) -> &SourceText {
        &self.streams[id.index()]
    }

    /// Display name of a stream, for diagnostics.
    pub fn name(&self, id: StreamId) -> &str {
        self.streams[id.index()].name()
    }
}

/// A read cursor over one registered stream.
///
/// The cursor tracks line and column while scanning; `\r\n` counts as a
/// single line break, as do lone `\r` and `\n`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cursor {
    pub stream: StreamId,
    offset: usize,
    line: u32,
    column: u32,
}

impl Cursor {
    pub fn new(stream: StreamId) -> Self {
        Self {
            stream,
            offset: 0,
            line: 1,
            column: 1,
        }
    }

    pub fn position(&self) -> SourcePosition {
        SourcePosition {
            stream: self.stream,
            line: self.line,
            column: self.column,
            offset: u32::try_from(self.offset).expect("stream longer than u32"),
        }
    }

    /// Moves the cursor to a previously captured position in the same stream.
    ///
    /// # Panics
    /// Panics if the position belongs to a different stream; callers switch
    /// streams before seeking.
    pub fn seek(&mut self, position: SourcePosition) {
        assert_eq!(position.stream, self.stream, "seek across streams");
        self.offset = position.offset as usize;
        self.line = position.line;
        self.column = position.column;
    }

    /// Returns the next character without consuming it.
    pub fn peek(&self, map: &SourceMap) -> Option<char> {
        map.get(self.stream).text()[self.offset..].chars().next()
    }

    /// Returns the character after the next one without consuming anything.
    pub fn peek2(&self, map: &SourceMap) -> Option<char> {
        let mut chars = map.get(self.stream).text()[self.offset..].chars();
        chars.next();
        chars.next()
    }

    /// Consumes and returns the next character, updating line/column.
    pub fn advance(&mut self, map: &SourceMap) -> Option<char> {
        let text = map.get(self.stream).text();
        let c = text[self.offset..].chars().next()?;
        self.offset += c.len_utf8();
        match c {
            '\n' => {
                self.line += 1;
                self.column = 1;
            }
            '\r' => {
                // CRLF counts as one break; the LF is swallowed here.
                if text[self.offset..].starts_with('\n') {
                    self.offset += 1;
                }
                self.line += 1;
                self.column = 1;
                return Some('\n');
            }
            _ => self.column += 1,
        }
        Some(c)
    }

    /// True when the cursor has consumed the whole stream.
    pub fn at_end(&self, map: &SourceMap) -> bool {
        self.offset >= map.get(self.stream).text().len()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_bom_stripped() {
        let mut map = SourceMap::new();
        let id = map.register("a.pov", "\u{feff}sphere");
        assert_eq!(map.get(id).text(), "sphere");
    }

    #[test]
    fn test_line_endings_normalize() {
        let mut map = SourceMap::new();
        let id = map.register("a.pov", "a\r\nb\rc\nd");
        let mut cur = Cursor::new(id);
        let mut out = String::new();
        while let Some(c) = cur.advance(&map) {
            out.push(c);
        }
        assert_eq!(out, "a\nb\nc\nd");
        assert_eq!(cur.position().line, 4);
    }

    #[test]
    fn test_seek_round_trip() {
        let mut map = SourceMap::new();
        let id = map.register("a.pov", "one two three");
        let mut cur = Cursor::new(id);
        for _ in 0..4 {
            cur.advance(&map);
        }
        let saved = cur.position();
        while cur.advance(&map).is_some() {}
        cur.seek(saved);
        assert_eq!(cur.peek(&map), Some('t'));
        assert_eq!(cur.position().column, 5);
    }
}
