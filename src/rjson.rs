//! A lenient JSON parser for the real-world sloppiness of model output:
//! unquoted object keys, single-quoted strings, trailing commas, and
//! line/block comments. None of these are legal JSON, but they are all
//! things a model asked to emit `{"name": "...", "arguments": {...}}`
//! will do anyway.
//!
//! [`parse`] returns a `serde_json::Value` directly so callers can feed
//! the result straight into [`crate::coercion::coerce_json_value`].
//! [`transform`] is the textual equivalent for callers (e.g. a protocol's
//! `extract_tool_call_segments`) that want a strict JSON string rather
//! than a parsed value.

use std::fmt;

use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};

/// How repeated object keys are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateKeyPolicy {
    /// Last write wins, matching `serde_json`'s own map semantics.
    #[default]
    KeepLast,
    /// A repeated key is a parse error.
    Reject,
}

#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub duplicate_key_policy: DuplicateKeyPolicy,
    /// Collect warnings (duplicate keys under `KeepLast`, recovered
    /// syntax quirks) instead of stopping at the first one. Still
    /// returns `Err` at the end if any warning was fatal under the
    /// active policy; otherwise surfaces warnings via the returned
    /// [`Parsed`] wrapper rather than failing.
    pub tolerant: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            duplicate_key_policy: DuplicateKeyPolicy::default(),
            tolerant: false,
        }
    }
}

/// The result of a [`parse_tolerant`] call: the best-effort value plus
/// every non-fatal warning collected along the way.
#[derive(Debug, Clone)]
pub struct Parsed {
    pub value: Value,
    pub warnings: Vec<String>,
}

/// Parses `src` as relaxed JSON, returning the first error encountered
/// (not tolerant).
pub fn parse(src: &str) -> Result<Value> {
    let opts = ParseOptions::default();
    let mut parser = Parser::new(src, &opts);
    let value = parser.parse_value()?;
    parser.skip_trivia();
    if !parser.at_end() {
        return Err(parser.error("trailing content after JSON value"));
    }
    Ok(value)
}

/// Parses `src` collecting every warning instead of failing fast.
/// Duplicate keys are always resolved with [`DuplicateKeyPolicy::KeepLast`]
/// semantics here — a caller that wants `Reject` should use [`parse`].
/// Returns `Err` only for input that is too structurally broken to
/// recover any value from (e.g. an empty string, unmatched brackets with
/// no fallback).
pub fn parse_tolerant(src: &str) -> Result<Parsed> {
    let opts = ParseOptions {
        duplicate_key_policy: DuplicateKeyPolicy::KeepLast,
        tolerant: true,
    };
    let mut parser = Parser::new(src, &opts);
    let value = parser.parse_value()?;
    parser.skip_trivia();
    Ok(Parsed {
        value,
        warnings: parser.warnings,
    })
}

/// Parses `src` as relaxed JSON and re-serializes it as strict,
/// minified JSON text. Used by protocols that need to hand a downstream
/// consumer a guaranteed-strict JSON string (e.g. `ToolCall::input`).
pub fn transform(src: &str) -> Result<String> {
    let value = parse(src)?;
    serde_json::to_string(&value).map_err(Error::from)
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    opts: &'a ParseOptions,
    warnings: Vec<String>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str, opts: &'a ParseOptions) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            opts,
            warnings: Vec::new(),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn error(&self, msg: impl fmt::Display) -> Error {
        Error::json_relaxed(format!("{msg} at byte {}", self.pos))
    }

    /// Skips whitespace, line comments (`//...`), and block comments
    /// (`/* ... */`).
    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r') => {
                    self.pos += 1;
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    self.pos += 2;
                    while !matches!(self.peek(), None | Some(b'\n')) {
                        self.pos += 1;
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    self.pos += 2;
                    while !self.at_end() && !(self.peek() == Some(b'*') && self.peek_at(1) == Some(b'/')) {
                        self.pos += 1;
                    }
                    self.pos = (self.pos + 2).min(self.bytes.len());
                }
                _ => break,
            }
        }
    }

    fn parse_value(&mut self) -> Result<Value> {
        self.skip_trivia();
        match self.peek() {
            Some(b'{') => self.parse_object(),
            Some(b'[') => self.parse_array(),
            Some(b'"') | Some(b'\'') => Ok(Value::String(self.parse_quoted_string()?)),
            Some(b't') | Some(b'f') => self.parse_bool(),
            Some(b'n') => self.parse_null(),
            Some(b) if b == b'-' || b.is_ascii_digit() => self.parse_number(),
            Some(other) => Err(self.error(format!("unexpected character `{}`", other as char))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn parse_object(&mut self) -> Result<Value> {
        self.bump(); // '{'
        let mut map = Map::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                Some(b'}') => {
                    self.bump();
                    break;
                }
                None => return Err(self.error("unterminated object")),
                _ => {}
            }

            let key = self.parse_key()?;
            self.skip_trivia();
            if self.peek() != Some(b':') {
                return Err(self.error("expected `:` after object key"));
            }
            self.bump();
            let value = self.parse_value()?;

            if map.contains_key(&key) {
                let msg = format!("duplicate key `{key}`");
                if self.opts.duplicate_key_policy == DuplicateKeyPolicy::Reject && !self.opts.tolerant {
                    return Err(self.error(msg));
                }
                self.warnings.push(msg);
            }
            map.insert(key, value);

            self.skip_trivia();
            match self.peek() {
                Some(b',') => {
                    self.bump();
                    self.skip_trivia();
                    if self.peek() == Some(b'}') {
                        // trailing comma
                        self.bump();
                        break;
                    }
                }
                Some(b'}') => {
                    self.bump();
                    break;
                }
                _ => return Err(self.error("expected `,` or `}` in object")),
            }
        }
        Ok(Value::Object(map))
    }

    fn parse_array(&mut self) -> Result<Value> {
        self.bump(); // '['
        let mut elems = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                Some(b']') => {
                    self.bump();
                    break;
                }
                None => return Err(self.error("unterminated array")),
                _ => {}
            }

            elems.push(self.parse_value()?);

            self.skip_trivia();
            match self.peek() {
                Some(b',') => {
                    self.bump();
                    self.skip_trivia();
                    if self.peek() == Some(b']') {
                        // trailing comma
                        self.bump();
                        break;
                    }
                }
                Some(b']') => {
                    self.bump();
                    break;
                }
                _ => return Err(self.error("expected `,` or `]` in array")),
            }
        }
        Ok(Value::Array(elems))
    }

    /// An object key: a quoted string, or a bare identifier made of
    /// alphanumerics, `-`, `.`, `_`.
    fn parse_key(&mut self) -> Result<String> {
        match self.peek() {
            Some(b'"') | Some(b'\'') => self.parse_quoted_string(),
            Some(b) if is_bare_key_start(b) => Ok(self.read_bare_identifier()),
            _ => Err(self.error("expected object key")),
        }
    }

    fn read_bare_identifier(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if is_bare_key_char(b)) {
            self.pos += 1;
        }
        self.src[start..self.pos].to_string()
    }

    fn parse_quoted_string(&mut self) -> Result<String> {
        let quote = self.bump().expect("caller checked quote");
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(b) if b == quote => break,
                Some(b'\\') => match self.bump() {
                    Some(b'"') => out.push('"'),
                    Some(b'\'') => out.push('\''),
                    Some(b'\\') => out.push('\\'),
                    Some(b'/') => out.push('/'),
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(b'r') => out.push('\r'),
                    Some(b'b') => out.push('\u{8}'),
                    Some(b'f') => out.push('\u{c}'),
                    Some(b'u') => {
                        let cp = self.read_hex4()?;
                        out.push(char::from_u32(cp as u32).unwrap_or('\u{fffd}'));
                    }
                    Some(other) => out.push(other as char),
                    None => return Err(self.error("unterminated escape sequence")),
                },
                Some(b) => {
                    // Re-decode as UTF-8 from the byte position: step back
                    // one byte and read a full char so multi-byte
                    // sequences aren't truncated.
                    self.pos -= 1;
                    let ch = self.src[self.pos..].chars().next().unwrap();
                    self.pos += ch.len_utf8();
                    let _ = b;
                    out.push(ch);
                }
            }
        }
        Ok(out)
    }

    fn read_hex4(&mut self) -> Result<u16> {
        if self.pos + 4 > self.bytes.len() {
            return Err(self.error("truncated unicode escape"));
        }
        let hex = &self.src[self.pos..self.pos + 4];
        let cp = u16::from_str_radix(hex, 16).map_err(|_| self.error("invalid unicode escape"))?;
        self.pos += 4;
        Ok(cp)
    }

    fn parse_bool(&mut self) -> Result<Value> {
        if self.src[self.pos..].starts_with("true") {
            self.pos += 4;
            Ok(Value::Bool(true))
        } else if self.src[self.pos..].starts_with("false") {
            self.pos += 5;
            Ok(Value::Bool(false))
        } else {
            Err(self.error("expected `true` or `false`"))
        }
    }

    fn parse_null(&mut self) -> Result<Value> {
        if self.src[self.pos..].starts_with("null") {
            self.pos += 4;
            Ok(Value::Null)
        } else {
            Err(self.error("expected `null`"))
        }
    }

    fn parse_number(&mut self) -> Result<Value> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') {
            self.pos += 1;
            while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            self.pos += 1;
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.pos += 1;
            }
            while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text = &self.src[start..self.pos];
        let n: f64 = text.parse().map_err(|_| self.error("invalid number literal"))?;
        Number::from_f64(n)
            .map(Value::Number)
            .ok_or_else(|| self.error("non-finite number literal"))
    }
}

fn is_bare_key_start(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.' || b == b'$'
}

fn is_bare_key_char(b: u8) -> bool {
    is_bare_key_start(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_strict_json_still_works() {
        let value = parse(r#"{"name":"get_weather","arguments":{"city":"Seoul"}}"#).unwrap();
        assert_eq!(value, json!({"name": "get_weather", "arguments": {"city": "Seoul"}}));
    }

    #[test]
    fn test_parse_unquoted_keys() {
        let value = parse(r#"{name: "get_weather", arguments: {city: "Seoul"}}"#).unwrap();
        assert_eq!(value, json!({"name": "get_weather", "arguments": {"city": "Seoul"}}));
    }

    #[test]
    fn test_parse_single_quoted_strings() {
        let value = parse(r#"{'name': 'get_weather'}"#).unwrap();
        assert_eq!(value, json!({"name": "get_weather"}));
    }

    #[test]
    fn test_parse_mixed_quote_styles() {
        let value = parse(r#"{'name': "get_weather", "city": 'Seoul'}"#).unwrap();
        assert_eq!(value, json!({"name": "get_weather", "city": "Seoul"}));
    }

    #[test]
    fn test_parse_trailing_comma_object_and_array() {
        let value = parse(r#"{"a": [1, 2, 3,], "b": 4,}"#).unwrap();
        assert_eq!(value, json!({"a": [1, 2, 3], "b": 4}));
    }

    #[test]
    fn test_parse_line_comment() {
        let value = parse("{ // a comment\n \"a\": 1 }").unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn test_parse_block_comment() {
        let value = parse("{ /* block \n comment */ \"a\": 1 }").unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn test_parse_duplicate_key_keeps_last_by_default() {
        let value = parse(r#"{"a": 1, "a": 2}"#).unwrap();
        assert_eq!(value, json!({"a": 2}));
    }

    #[test]
    fn test_parse_duplicate_key_reject_policy() {
        let opts = ParseOptions {
            duplicate_key_policy: DuplicateKeyPolicy::Reject,
            tolerant: false,
        };
        let mut parser = Parser::new(r#"{"a": 1, "a": 2}"#, &opts);
        let result = parser.parse_value();
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_tolerant_collects_warnings() {
        let parsed = parse_tolerant(r#"{"a": 1, "a": 2}"#).unwrap();
        assert_eq!(parsed.value, json!({"a": 2}));
        assert_eq!(parsed.warnings.len(), 1);
    }

    #[test]
    fn test_transform_to_strict_json_string() {
        let strict = transform(r#"{name: 'get_weather', city: 'Seoul',}"#).unwrap();
        let reparsed: Value = serde_json::from_str(&strict).unwrap();
        assert_eq!(reparsed, json!({"name": "get_weather", "city": "Seoul"}));
    }

    #[test]
    fn test_parse_nested_arrays_and_objects() {
        let value = parse(r#"{"items": [{"x": 1}, {"x": 2}]}"#).unwrap();
        assert_eq!(value, json!({"items": [{"x": 1}, {"x": 2}]}));
    }

    #[test]
    fn test_parse_escaped_string_content() {
        let value = parse(r#"{"a": "line1\nline2\ttab"}"#).unwrap();
        assert_eq!(value["a"], json!("line1\nline2\ttab"));
    }

    #[test]
    fn test_parse_rejects_trailing_garbage() {
        assert!(parse(r#"{"a": 1} garbage"#).is_err());
    }

    #[test]
    fn test_parse_number_forms() {
        let value = parse(r#"{"a": -1.5e3, "b": 0, "c": 42}"#).unwrap();
        assert_eq!(value, json!({"a": -1500.0, "b": 0, "c": 42}));
    }
}
