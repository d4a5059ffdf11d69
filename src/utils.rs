//! Shared parsing utilities: the partial-tag boundary helper every
//! streaming protocol parser relies on, and an injectable id generator so
//! tool-call ids are deterministic in tests.
//!
//! The SSE line-framing and chunk-aggregation machinery that used to live
//! here has moved to [`crate::transport`], which is the one module that
//! actually talks to an HTTP endpoint; this module stays pure text
//! manipulation, matching what §6 calls out as a requirement of the core.

use std::sync::Arc;

use uuid::Uuid;

/// Result of scanning a buffer's tail for a (possibly partial) occurrence
/// of `needle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMatch {
    /// No occurrence, complete or partial, exists in `buf`.
    None,
    /// `buf[index..]` is a non-empty strict prefix of `needle` — the
    /// delimiter may be completing in a future chunk. Callers must not
    /// emit `buf[index..]` as text yet.
    Partial(usize),
    /// `buf[index..index + needle.len()]` equals `needle` exactly.
    Complete(usize),
}

/// Scans `buf` for the earliest position at which `needle` starts,
/// complete or partial, scanning from the back forward so a true partial
/// suffix is detected even when `needle` occurs nowhere else in `buf`.
///
/// This is the single piece of logic every streaming tool-call parser
/// depends on to satisfy invariant (4) in the data model: no `text-delta`
/// may carry a prefix of a protocol's opening delimiter at its tail,
/// because the very next chunk might complete it into a real tag.
///
/// Returns [`StartMatch::None`] if `needle` is empty (callers should treat
/// an empty delimiter as already satisfied and never call this).
pub fn find_potential_start(buf: &str, needle: &str) -> StartMatch {
    if needle.is_empty() {
        return StartMatch::None;
    }

    if let Some(index) = buf.find(needle) {
        return StartMatch::Complete(index);
    }

    // No complete match. Check every suffix of `buf`, from longest to
    // shortest, against every prefix of `needle` of the same length.
    let buf_bytes = buf.as_bytes();
    let needle_bytes = needle.as_bytes();
    let max_check = buf_bytes.len().min(needle_bytes.len() - 1);

    for suffix_len in (1..=max_check).rev() {
        let start = buf_bytes.len() - suffix_len;
        // Only consider char-boundary-safe starts; buf is valid UTF-8 and
        // we only slice at byte-for-byte matches against needle's ASCII
        // delimiter bytes, so any mismatch due to a non-boundary split is
        // simply rejected by the slice-equality check below once we
        // verify the boundary.
        if !buf.is_char_boundary(start) {
            continue;
        }
        if &buf_bytes[start..] == &needle_bytes[..suffix_len] {
            return StartMatch::Partial(start);
        }
    }

    StartMatch::None
}

/// Generates opaque, unique tool-call ids.
///
/// Injectable per §9's "no hidden globals" note: production code uses
/// [`UuidIdGenerator`]; tests can supply a sequential generator for
/// deterministic assertions.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Default generator, backed by random UUIDv4s.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// A generator that produces `{prefix}-0`, `{prefix}-1`, … in order.
/// Useful in tests that need to assert on an exact tool-call id.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    counter: std::sync::atomic::AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}

pub fn default_id_generator() -> Arc<dyn IdGenerator> {
    Arc::new(UuidIdGenerator)
}

/// Escapes a literal string for use inside a `regex` pattern. Used when a
/// protocol's tag delimiters are caller-configurable rather than fixed.
pub fn escape_regex(literal: &str) -> String {
    regex::escape(literal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_potential_start_complete_match() {
        let m = find_potential_start("hello <tool_call>", "<tool_call>");
        assert_eq!(m, StartMatch::Complete(6));
    }

    #[test]
    fn test_find_potential_start_no_match() {
        let m = find_potential_start("just plain text", "<tool_call>");
        assert_eq!(m, StartMatch::None);
    }

    #[test]
    fn test_find_potential_start_partial_suffix() {
        let m = find_potential_start("some text <tool_c", "<tool_call>");
        assert_eq!(m, StartMatch::Partial(10));
    }

    #[test]
    fn test_find_potential_start_single_char_partial() {
        let m = find_potential_start("text<", "<tool_call>");
        assert_eq!(m, StartMatch::Partial(4));
    }

    #[test]
    fn test_find_potential_start_prefers_complete_over_partial() {
        // "<tool_call>" appears complete even though the trailing "<" could
        // also look like the start of another occurrence.
        let m = find_potential_start("<tool_call>trailing <", "<tool_call>");
        assert_eq!(m, StartMatch::Complete(0));
    }

    #[test]
    fn test_find_potential_start_no_false_positive_on_unrelated_bracket() {
        let m = find_potential_start("a < b", "<tool_call>");
        // "<" alone is a valid 1-byte prefix of the needle.
        assert_eq!(m, StartMatch::Partial(2));
    }

    #[test]
    fn test_find_potential_start_empty_needle() {
        assert_eq!(find_potential_start("anything", ""), StartMatch::None);
    }

    #[test]
    fn test_uuid_id_generator_produces_unique_ids() {
        let gen = UuidIdGenerator;
        let a = gen.next_id();
        let b = gen.next_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_sequential_id_generator() {
        let gen = SequentialIdGenerator::new("call");
        assert_eq!(gen.next_id(), "call-0");
        assert_eq!(gen.next_id(), "call-1");
    }

    #[test]
    fn test_escape_regex() {
        let escaped = escape_regex("<tool_call>");
        assert!(regex::Regex::new(&escaped).is_ok());
        assert!(regex::Regex::new(&escaped).unwrap().is_match("<tool_call>"));
    }
}
