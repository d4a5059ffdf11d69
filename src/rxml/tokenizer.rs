//! Character-position tokenizer for HTML/XML-ish markup emitted by
//! language models.
//!
//! Real model output routinely violates strict XML: unquoted attribute
//! values, unterminated quotes, close tags with stray whitespace, mixed
//! content. This tokenizer recognises the well-formed shapes listed in
//! the component design and recovers from the common malformations at
//! the token level rather than failing outright; structural recovery
//! (mismatched tag names, unbalanced nesting) is the [`super::repair`]
//! module's job, one layer up.

use std::fmt;

/// One lexical token plus its start position in the source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: Position,
    /// Byte offset one past the end of this token's raw source text.
    /// Lets callers recover the exact span between a start tag and its
    /// matching end tag without re-serializing anything.
    pub end_byte_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    pub byte_offset: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    StartTag {
        name: String,
        attributes: Vec<(String, Option<String>)>,
        self_closing: bool,
    },
    EndTag {
        name: String,
    },
    Text(String),
    Comment(String),
    CData(String),
    ProcessingInstruction(String),
    Doctype(String),
}

/// Tag names whose content is void even without a self-closing slash, per
/// the HTML void-element list. Configurable per call so callers can add
/// domain-specific raw-content tags (e.g. `<think>` variants some models
/// use, which are *not* void but whose content is never itself a tool
/// call and so gets the same "don't look for markup inside" treatment
/// via [`TokenizerOptions::raw_text_tags`] instead).
pub fn default_void_tags() -> &'static [&'static str] {
    &[
        "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
        "source", "track", "wbr",
    ]
}

#[derive(Debug, Clone)]
pub struct TokenizerOptions {
    pub keep_comments: bool,
    pub keep_whitespace_only_text: bool,
    pub void_tags: Vec<String>,
    /// Tags whose inner text is captured verbatim (no nested tag
    /// recognition) until the matching close tag, mirroring how
    /// `<script>`/`<style>` behave in HTML.
    pub raw_text_tags: Vec<String>,
}

impl Default for TokenizerOptions {
    fn default() -> Self {
        Self {
            keep_comments: false,
            keep_whitespace_only_text: true,
            void_tags: default_void_tags().iter().map(|s| s.to_string()).collect(),
            raw_text_tags: Vec::new(),
        }
    }
}

pub struct Tokenizer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: usize,
    column: usize,
    options: TokenizerOptions,
}

impl<'a> Tokenizer<'a> {
    pub fn new(src: &'a str, options: TokenizerOptions) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
            options,
        }
    }

    fn position(&self) -> Position {
        Position {
            line: self.line,
            column: self.column,
            byte_offset: self.pos,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(b)
    }

    fn starts_with(&self, needle: &str) -> bool {
        self.src[self.pos..].starts_with(needle)
    }

    fn advance_by(&mut self, n: usize) {
        for _ in 0..n {
            self.advance();
        }
    }

    /// Returns the next token, or `None` at end of input.
    pub fn next_token(&mut self) -> Option<Token> {
        if self.pos >= self.bytes.len() {
            return None;
        }

        let start = self.position();

        let mut token = if self.peek() == Some(b'<') {
            if self.starts_with("<!--") {
                self.read_comment(start)
            } else if self.starts_with("<![CDATA[") {
                self.read_cdata(start)
            } else if self.starts_with("<?") {
                self.read_processing_instruction(start)
            } else if self.starts_with("<!") {
                self.read_doctype(start)
            } else if self.peek_at(1) == Some(b'/') {
                self.read_end_tag(start)
            } else if is_name_start(self.peek_at(1)) {
                self.read_start_tag(start)
            } else {
                // A lone '<' not followed by a recognised construct:
                // treat as literal text rather than failing the parse.
                self.read_text(start)
            }
        } else {
            self.read_text(start)
        };

        token.end_byte_offset = self.pos;
        Some(token)
    }

    fn read_text(&mut self, start: Position) -> Token {
        while let Some(b) = self.peek() {
            if b == b'<' {
                // Only stop at '<' if it looks like it begins a real
                // construct; otherwise consume it as literal text so a
                // stray '<' in prose doesn't fragment text nodes.
                if self.starts_with("<!--")
                    || self.starts_with("<![CDATA[")
                    || self.starts_with("<?")
                    || self.starts_with("<!")
                    || self.peek_at(1) == Some(b'/')
                    || is_name_start(self.peek_at(1))
                {
                    break;
                }
            }
            self.advance();
        }
        // Slice from the original str (not byte-pushed) to stay correct
        // across multi-byte UTF-8 sequences; `advance` tracks byte/line/
        // column position but never decodes individual characters.
        let text = self.src[start.byte_offset..self.pos].to_string();
        Token {
            kind: TokenKind::Text(text),
            pos: start,
            end_byte_offset: 0,
        }
    }

    fn read_comment(&mut self, start: Position) -> Token {
        self.advance_by(4); // "<!--"
        let content_start = self.pos;
        while self.pos < self.bytes.len() && !self.starts_with("-->") {
            self.advance();
        }
        let content = self.src[content_start..self.pos].to_string();
        if self.starts_with("-->") {
            self.advance_by(3);
        }
        Token {
            kind: TokenKind::Comment(content),
            pos: start,
            end_byte_offset: 0,
        }
    }

    fn read_cdata(&mut self, start: Position) -> Token {
        self.advance_by(9); // "<![CDATA["
        let content_start = self.pos;
        while self.pos < self.bytes.len() && !self.starts_with("]]>") {
            self.advance();
        }
        let content = self.src[content_start..self.pos].to_string();
        if self.starts_with("]]>") {
            self.advance_by(3);
        }
        Token {
            kind: TokenKind::CData(content),
            pos: start,
            end_byte_offset: 0,
        }
    }

    fn read_processing_instruction(&mut self, start: Position) -> Token {
        self.advance_by(2); // "<?"
        let content_start = self.pos;
        while self.pos < self.bytes.len() && !self.starts_with("?>") {
            self.advance();
        }
        let content = self.src[content_start..self.pos].to_string();
        if self.starts_with("?>") {
            self.advance_by(2);
        }
        Token {
            kind: TokenKind::ProcessingInstruction(content),
            pos: start,
            end_byte_offset: 0,
        }
    }

    fn read_doctype(&mut self, start: Position) -> Token {
        self.advance_by(2); // "<!"
        let content_start = self.pos;
        while let Some(b) = self.peek() {
            if b == b'>' {
                break;
            }
            self.advance();
        }
        let content = self.src[content_start..self.pos].to_string();
        if self.peek() == Some(b'>') {
            self.advance();
        }
        Token {
            kind: TokenKind::Doctype(content),
            pos: start,
            end_byte_offset: 0,
        }
    }

    fn read_name(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if is_name_char(Some(b)) {
                self.advance();
            } else {
                break;
            }
        }
        self.src[start..self.pos].to_string()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r')) {
            self.advance();
        }
    }

    fn read_start_tag(&mut self, start: Position) -> Token {
        self.advance(); // '<'
        let name = self.read_name();
        let mut attributes = Vec::new();
        let mut self_closing = false;

        loop {
            self.skip_whitespace();
            match self.peek() {
                None => break,
                Some(b'>') => {
                    self.advance();
                    break;
                }
                Some(b'/') => {
                    self.advance();
                    self.skip_whitespace();
                    if self.peek() == Some(b'>') {
                        self.advance();
                    }
                    self_closing = true;
                    break;
                }
                Some(b) if is_name_start(Some(b)) => {
                    let attr_name = self.read_name();
                    self.skip_whitespace();
                    if self.peek() == Some(b'=') {
                        self.advance();
                        self.skip_whitespace();
                        let value = self.read_attr_value();
                        attributes.push((attr_name, Some(value)));
                    } else {
                        attributes.push((attr_name, None));
                    }
                }
                Some(_) => {
                    // Unexpected character inside a tag; skip it so a
                    // single stray byte doesn't stall the tokenizer.
                    self.advance();
                }
            }
        }

        let is_void = self
            .options
            .void_tags
            .iter()
            .any(|v| v.eq_ignore_ascii_case(&name));

        Token {
            kind: TokenKind::StartTag {
                name,
                attributes,
                self_closing: self_closing || is_void,
            },
            pos: start,
            end_byte_offset: 0,
        }
    }

    fn read_attr_value(&mut self) -> String {
        match self.peek() {
            Some(q @ b'"') | Some(q @ b'\'') => {
                self.advance();
                let start = self.pos;
                // An unterminated quote (no matching `q` before the tag
                // closes) recovers by stopping at the next '>' rather than
                // consuming the rest of the document looking for a quote
                // that never comes.
                while let Some(b) = self.peek() {
                    if b == q || b == b'>' {
                        break;
                    }
                    self.advance();
                }
                let value = self.src[start..self.pos].to_string();
                if self.peek() == Some(q) {
                    self.advance();
                }
                value
            }
            _ => {
                // Unquoted value: read until whitespace or '>' (tolerant
                // of models that forget quotes entirely).
                let start = self.pos;
                while let Some(b) = self.peek() {
                    if b == b'>' || b == b' ' || b == b'\t' || b == b'\n' || b == b'\r' {
                        break;
                    }
                    self.advance();
                }
                self.src[start..self.pos].to_string()
            }
        }
    }

    fn read_end_tag(&mut self, start: Position) -> Token {
        self.advance_by(2); // "</"
        self.skip_whitespace();
        let name = self.read_name();
        self.skip_whitespace();
        while let Some(b) = self.peek() {
            if b == b'>' {
                self.advance();
                break;
            }
            self.advance();
        }
        Token {
            kind: TokenKind::EndTag { name },
            pos: start,
            end_byte_offset: 0,
        }
    }
}

fn is_name_start(b: Option<u8>) -> bool {
    matches!(b, Some(b) if b.is_ascii_alphabetic() || b == b'_' || b == b':')
}

fn is_name_char(b: Option<u8>) -> bool {
    matches!(b, Some(b) if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b':' || b == b'.')
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        self.next_token()
    }
}

/// Tokenizes an entire string into a flat token list, for callers that
/// don't need incremental/streaming behaviour.
pub fn tokenize(src: &str, options: TokenizerOptions) -> Vec<Token> {
    Tokenizer::new(src, options).collect()
}
