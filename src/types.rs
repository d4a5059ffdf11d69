//! Core data model: tool definitions, tool calls/results, content and
//! stream parts, and the per-request configuration types that protocols
//! and the middleware pipeline share.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool exposed to the model for a single request.
///
/// `input_schema` is a JSON-Schema fragment (an `object` schema with a
/// `properties` map) used both to render the tool catalog into the system
/// prompt and to drive schema-directed coercion (see [`crate::coercion`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
    /// Tools the provider implements natively (e.g. a hosted retrieval
    /// tool) are rejected by `toolChoice` validation rather than routed
    /// through a text protocol; see [`crate::error::Error::ToolChoice`].
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub provider_defined: bool,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema,
            provider_defined: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn provider_defined(mut self, yes: bool) -> Self {
        self.provider_defined = yes;
        self
    }
}

/// A concrete invocation emitted by the model, already schema-coerced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    /// JSON-encoded arguments object (string, not `Value`, to match the
    /// wire representation the host's content-part union expects).
    pub input: String,
}

impl ToolCall {
    pub fn new(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            input: input.into(),
        }
    }

    /// Parses `input` as JSON. Returns `Err` only if the stored string is
    /// not valid JSON, which should not happen for calls produced by this
    /// crate's own parsers.
    pub fn input_value(&self) -> crate::Result<Value> {
        Ok(serde_json::from_str(&self.input)?)
    }
}

/// The outcome of executing a [`ToolCall`], supplied by the caller when
/// rendering history back into model-visible text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub output: Value,
}

impl ToolResult {
    pub fn new(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: Value,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            output,
        }
    }
}

/// One element of a message (final, non-streamed) content list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentPart {
    Text { text: String },
    Reasoning { text: String },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        ContentPart::Reasoning { text: text.into() }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, ContentPart::Text { .. })
    }

    /// Returns the text of a `Text` part, if this is one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// One event on the model→caller stream.
///
/// Mirrors the final content-part union but split into the granular
/// start/delta/end events a streaming parser must emit to satisfy the
/// ordering invariants in the data model (every `TextStart` is paired
/// with exactly one `TextEnd`, etc).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamPart {
    Start,
    TextStart { id: String },
    TextDelta { id: String, delta: String },
    TextEnd { id: String },
    ReasoningStart { id: String },
    ReasoningDelta { id: String, delta: String },
    ReasoningEnd { id: String },
    ToolInputStart { id: String, tool_name: String },
    ToolInputDelta { id: String, delta: String },
    ToolInputEnd { id: String },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    FinishStep { finish_reason: FinishReason },
    Finish { finish_reason: FinishReason, usage: Option<Usage> },
    Error { message: String },
}

/// Reason a step or stream terminated. `ToolCalls` is force-substituted by
/// the middleware (§4.5) whenever at least one tool call crossed during
/// the step, regardless of what the upstream endpoint itself reported.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Caller directive on whether the model may or must call a tool.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Tool(String),
}

impl fmt::Display for ToolChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolChoice::Auto => write!(f, "auto"),
            ToolChoice::None => write!(f, "none"),
            ToolChoice::Required => write!(f, "required"),
            ToolChoice::Tool(name) => write!(f, "tool({name})"),
        }
    }
}

/// Policy for a duplicate top-level string-typed XML tag (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateTagPolicy {
    /// Always raise [`crate::error::Error::DuplicateStringTag`], even when
    /// `repair` would otherwise have resolved it. For a caller that wants
    /// no silent recovery from ambiguous duplicate input.
    Fatal,
    /// The permissive default: with `repair` enabled, the duplicate
    /// siblings collapse to the last occurrence per repair rule 3 (§4.1)
    /// and the call succeeds with a warning; with `repair` disabled there
    /// is no safe way to resolve the ambiguity, so the call fails and the
    /// protocol layer falls back to emitting the original text.
    #[default]
    KeepFirst,
}

/// Whether a malformed tool-call region is forwarded as text when it
/// fails to parse, or dropped entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorTextPolicy {
    #[default]
    EmitRawText,
    Suppress,
}

/// Options shared by every protocol's one-shot and streaming parse.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub repair: bool,
    pub max_reparses: u32,
    pub duplicate_tag_policy: DuplicateTagPolicy,
    pub error_text_policy: ErrorTextPolicy,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            repair: true,
            max_reparses: 4,
            duplicate_tag_policy: DuplicateTagPolicy::default(),
            error_text_policy: ErrorTextPolicy::default(),
        }
    }
}

impl ParseOptions {
    pub fn builder() -> ParseOptionsBuilder {
        ParseOptionsBuilder::default()
    }
}

/// Builder for [`ParseOptions`], in the style of this crate's other
/// option builders.
#[derive(Debug, Clone, Default)]
pub struct ParseOptionsBuilder {
    inner: ParseOptionsBuilderInner,
}

#[derive(Debug, Clone)]
struct ParseOptionsBuilderInner {
    repair: Option<bool>,
    max_reparses: Option<u32>,
    duplicate_tag_policy: Option<DuplicateTagPolicy>,
    error_text_policy: Option<ErrorTextPolicy>,
}

impl Default for ParseOptionsBuilderInner {
    fn default() -> Self {
        Self {
            repair: None,
            max_reparses: None,
            duplicate_tag_policy: None,
            error_text_policy: None,
        }
    }
}

impl ParseOptionsBuilder {
    pub fn repair(mut self, repair: bool) -> Self {
        self.inner.repair = Some(repair);
        self
    }

    pub fn max_reparses(mut self, max: u32) -> Self {
        self.inner.max_reparses = Some(max);
        self
    }

    pub fn duplicate_tag_policy(mut self, policy: DuplicateTagPolicy) -> Self {
        self.inner.duplicate_tag_policy = Some(policy);
        self
    }

    pub fn error_text_policy(mut self, policy: ErrorTextPolicy) -> Self {
        self.inner.error_text_policy = Some(policy);
        self
    }

    pub fn build(self) -> ParseOptions {
        let default = ParseOptions::default();
        ParseOptions {
            repair: self.inner.repair.unwrap_or(default.repair),
            max_reparses: self.inner.max_reparses.unwrap_or(default.max_reparses),
            duplicate_tag_policy: self
                .inner
                .duplicate_tag_policy
                .unwrap_or(default.duplicate_tag_policy),
            error_text_policy: self
                .inner
                .error_text_policy
                .unwrap_or(default.error_text_policy),
        }
    }
}

/// Running state of one in-progress stream parse.
///
/// Held by the caller across calls to a protocol's stream transform; not
/// `Clone` because a stream owns exactly one of these for its lifetime.
#[derive(Debug)]
pub struct StreamParserState {
    pub mode: StreamMode,
    /// Text seen since the last confirmed-safe emission point; may hold a
    /// partial tag-start suffix that must not be forwarded yet.
    pub buffer: String,
    pub current_tool_call_id: Option<String>,
    pub current_tool_name: Option<String>,
    pub current_text_block_id: Option<String>,
    pub has_emitted_start: bool,
    pub finish_sent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Outside,
    InsideTool,
}

impl Default for StreamParserState {
    fn default() -> Self {
        Self {
            mode: StreamMode::Outside,
            buffer: String::new(),
            current_tool_call_id: None,
            current_tool_name: None,
            current_text_block_id: None,
            has_emitted_start: false,
            finish_sent: false,
        }
    }
}

impl StreamParserState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A chat message as the middleware pipeline (§4.5) sees it: a role plus
/// an ordered content list. The pipeline rewrites `tool-call` and
/// `tool-result` parts into plain text for the upstream endpoint and
/// reassembles them from parsed text on the way back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentPart>) -> Self {
        Self { role, content }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    pub fn assistant(content: Vec<ContentPart>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: Vec<ContentPart>) -> Self {
        Self::new(Role::Tool, content)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_definition_builder() {
        let def = ToolDefinition::new("get_weather", json!({"type": "object"}))
            .with_description("fetches weather");
        assert_eq!(def.name, "get_weather");
        assert_eq!(def.description.as_deref(), Some("fetches weather"));
        assert!(!def.provider_defined);
    }

    #[test]
    fn test_tool_call_input_value() {
        let call = ToolCall::new("call_1", "get_weather", r#"{"city":"Seoul"}"#);
        let value = call.input_value().unwrap();
        assert_eq!(value["city"], "Seoul");
    }

    #[test]
    fn test_content_part_text_roundtrip() {
        let part = ContentPart::text("hello");
        assert!(part.is_text());
        assert_eq!(part.as_text(), Some("hello"));

        let tool_call_part = ContentPart::ToolCall(ToolCall::new("id", "name", "{}"));
        assert!(!tool_call_part.is_text());
        assert_eq!(tool_call_part.as_text(), None);
    }

    #[test]
    fn test_tool_choice_display() {
        assert_eq!(ToolChoice::Auto.to_string(), "auto");
        assert_eq!(ToolChoice::None.to_string(), "none");
        assert_eq!(ToolChoice::Required.to_string(), "required");
        assert_eq!(
            ToolChoice::Tool("get_weather".into()).to_string(),
            "tool(get_weather)"
        );
    }

    #[test]
    fn test_parse_options_default() {
        let opts = ParseOptions::default();
        assert!(opts.repair);
        assert_eq!(opts.max_reparses, 4);
        assert_eq!(opts.duplicate_tag_policy, DuplicateTagPolicy::KeepFirst);
        assert_eq!(opts.error_text_policy, ErrorTextPolicy::EmitRawText);
    }

    #[test]
    fn test_parse_options_builder_overrides() {
        let opts = ParseOptions::builder()
            .repair(false)
            .max_reparses(0)
            .duplicate_tag_policy(DuplicateTagPolicy::Fatal)
            .error_text_policy(ErrorTextPolicy::Suppress)
            .build();
        assert!(!opts.repair);
        assert_eq!(opts.max_reparses, 0);
        assert_eq!(opts.duplicate_tag_policy, DuplicateTagPolicy::Fatal);
        assert_eq!(opts.error_text_policy, ErrorTextPolicy::Suppress);
    }

    #[test]
    fn test_parse_options_builder_partial_override_keeps_defaults() {
        let opts = ParseOptions::builder().repair(false).build();
        assert!(!opts.repair);
        assert_eq!(opts.max_reparses, 4);
    }

    #[test]
    fn test_stream_parser_state_default() {
        let state = StreamParserState::new();
        assert_eq!(state.mode, StreamMode::Outside);
        assert!(state.buffer.is_empty());
        assert!(state.current_tool_call_id.is_none());
        assert!(!state.finish_sent);
    }

    #[test]
    fn test_finish_reason_default_is_stop() {
        assert_eq!(FinishReason::default(), FinishReason::Stop);
    }

    #[test]
    fn test_message_constructors_set_expected_role() {
        assert_eq!(Message::system("sys").role, Role::System);
        assert_eq!(Message::user("hi").role, Role::User);
        assert_eq!(
            Message::assistant(vec![ContentPart::text("hi")]).role,
            Role::Assistant
        );
        assert_eq!(Message::tool(vec![ContentPart::text("ok")]).role, Role::Tool);
    }
}
