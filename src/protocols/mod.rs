//! Pluggable text ↔ tool-call codecs.
//!
//! Every protocol in this module implements [`ToolCallProtocol`]: a
//! one-shot parser, an incremental [`StreamParser`], a formatter back to
//! protocol text, and a tool-catalog formatter for the system prompt.
//! They share nothing at the trait level beyond that contract — the
//! JSON-flavored protocols additionally share the state-machine shape in
//! [`json_tag`], which [`mixed_json`] and [`variants`] reuse directly.

pub mod json_tag;
pub mod mixed_json;
mod tagscan;
pub mod variants;
pub mod xml_tool;
pub mod yaml_xml;

pub use json_tag::{JsonTagConfig, JsonTagProtocol};
pub use mixed_json::MixedJsonProtocol;
pub use xml_tool::XmlToolProtocol;
pub use yaml_xml::YamlXmlProtocol;

use crate::types::{ContentPart, ParseOptions, StreamPart, ToolCall, ToolDefinition, ToolResult};

/// A function that renders a tool catalog into system-prompt text. Kept
/// as a plain `Arc<dyn Fn>` rather than a trait so each protocol
/// "variant" (Hermes, Gemma, Qwen, Guided — see [`variants`]) can be
/// expressed as a template swap without a new type per variant.
pub type ToolCatalogTemplate =
    std::sync::Arc<dyn Fn(&[ToolDefinition]) -> String + Send + Sync>;

/// Uniform contract every tool-call protocol satisfies (§4.4).
///
/// Implementations are constructed once and shared read-only across
/// requests (§3 Ownership); none of the methods here take `&mut self`.
pub trait ToolCallProtocol: Send + Sync {
    /// Short, stable identifier used in diagnostics and by the
    /// middleware to name the active protocol (not shown to the model).
    fn name(&self) -> &'static str;

    /// Renders the tool catalog for the system prompt.
    fn format_tools(&self, tools: &[ToolDefinition]) -> String;

    /// Renders one tool call back into protocol text, for rewriting
    /// assistant history on the next turn.
    fn format_tool_call(&self, call: &ToolCall) -> String;

    /// Renders a tool's result back into protocol text, for rewriting
    /// tool-role history into user-visible text.
    fn format_tool_response(&self, result: &ToolResult) -> String;

    /// One-shot parse of a complete model response.
    fn parse_generated_text(
        &self,
        text: &str,
        tools: &[ToolDefinition],
        options: &ParseOptions,
        on_error: &mut dyn FnMut(&str),
    ) -> Vec<ContentPart>;

    /// Builds a fresh incremental parser for one stream. Every stream
    /// gets its own parser (§3 Ownership: "exclusive" `StreamParserState`).
    fn create_stream_parser(
        &self,
        tools: Vec<ToolDefinition>,
        options: ParseOptions,
    ) -> Box<dyn StreamParser>;

    /// Optional textual extraction of tool-call regions, for analysis
    /// tooling that wants the raw protocol text without full parsing.
    /// Protocols with no natural notion of this (none, currently) may
    /// leave the default empty-vec implementation.
    fn extract_tool_call_segments(&self, text: &str, tools: &[ToolDefinition]) -> Vec<String> {
        let _ = (text, tools);
        Vec::new()
    }
}

/// Incremental half of a protocol: consumes text deltas from the
/// upstream model's stream and emits the corresponding [`StreamPart`]s.
///
/// Only fed *text* content — the middleware pipeline (§4.5) forwards
/// every other upstream event (reasoning, usage, `finish-step`,
/// `finish`, `error`) untouched, calling [`StreamParser::finish`] first
/// so any buffered partial tool-call region is flushed as text before
/// the terminal event passes through.
pub trait StreamParser: Send {
    /// Feeds one chunk of upstream text content. May be called with
    /// chunks as small as one character; callers must not assume
    /// chunk boundaries align with tags (§5, §8).
    fn feed_text(&mut self, delta: &str, on_error: &mut dyn FnMut(&str)) -> Vec<StreamPart>;

    /// Signals that the upstream step/stream has ended. Flushes any
    /// buffered partial region as text (never synthesizes a tool call
    /// from an incomplete payload — §5 Cancellation, §7). Idempotent:
    /// a second call returns an empty vec.
    fn finish(&mut self, on_error: &mut dyn FnMut(&str)) -> Vec<StreamPart>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use crate::utils::IdGenerator;

    /// Deterministic id generator for protocol tests: `call-0`, `call-1`, …
    #[derive(Debug, Default)]
    pub struct TestIdGen(AtomicU64);

    impl IdGenerator for TestIdGen {
        fn next_id(&self) -> String {
            format!("call-{}", self.0.fetch_add(1, Ordering::Relaxed))
        }
    }

    pub fn test_id_gen() -> Arc<dyn IdGenerator> {
        Arc::new(TestIdGen::default())
    }

    /// Feeds `text` into `parser` one character at a time and returns
    /// every emitted `StreamPart` in order, finishing the stream at the
    /// end. Used to assert the single-character-chunk boundary
    /// behaviors required by §8.
    pub fn feed_char_by_char(
        parser: &mut dyn super::StreamParser,
        text: &str,
    ) -> Vec<crate::types::StreamPart> {
        let mut out = Vec::new();
        let mut errs = |_msg: &str| {};
        for ch in text.chars() {
            out.extend(parser.feed_text(&ch.to_string(), &mut errs));
        }
        out.extend(parser.finish(&mut errs));
        out
    }
}
