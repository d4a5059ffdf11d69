//! Adapts a generic chat endpoint to behave as if it natively supported
//! tool calls, by wrapping it with a [`ToolCallProtocol`] (§4.5).
//!
//! Three moves, matching the data flow in `SPEC_FULL.md` §2:
//!
//! 1. [`ToolCallMiddleware::transform_params`] — pre-call rewrite. Injects
//!    a tool-describing system message, rewrites prior assistant/tool
//!    turns into protocol text, and (for a forced `toolChoice`) attaches a
//!    response-format JSON schema.
//! 2. [`ToolCallMiddleware::wrap_generate`] — post-call, non-streaming:
//!    parses the raw model text back into [`ContentPart`]s.
//! 3. [`ToolCallMiddleware::wrap_stream`] — post-call, streaming: pipes
//!    raw text deltas through the protocol's incremental parser while
//!    passing every other upstream event through untouched, mirroring the
//!    `.scan().flat_map()` shape the point-of-departure SDK's `client.rs`
//!    used for its own SSE-to-content-block aggregation.

use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::coercion::coerce_json_value;
use crate::error::{Error, Result};
use crate::protocols::{StreamParser, ToolCallProtocol};
use crate::types::{
    ContentPart, FinishReason, Message, ParseOptions, Role, ToolCall, ToolChoice, ToolDefinition,
    Usage,
};
use crate::utils::{default_id_generator, IdGenerator};
use tracing::warn;

/// One event on the *upstream* (pre-protocol) side of the stream: the
/// transport's own notion of a delta, before any tool-call text has been
/// recognized. Everything but [`RawStreamEvent::TextDelta`] passes
/// through [`ToolCallMiddleware::wrap_stream`] unchanged.
#[derive(Debug, Clone)]
pub enum RawStreamEvent {
    Start,
    TextDelta(String),
    ReasoningStart { id: String },
    ReasoningDelta { id: String, delta: String },
    ReasoningEnd { id: String },
    FinishStep { finish_reason: FinishReason },
    Finish { finish_reason: FinishReason, usage: Option<Usage> },
    Error { message: String },
}

pub type RawEventStream = Pin<Box<dyn Stream<Item = RawStreamEvent> + Send>>;
pub type StreamPartStream = Pin<Box<dyn Stream<Item = crate::types::StreamPart> + Send>>;

/// A complete, non-streamed model response, before protocol parsing.
#[derive(Debug, Clone)]
pub struct GenerateResult {
    pub content: String,
    pub reasoning: Option<String>,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
}

/// What [`ToolCallMiddleware::transform_params`] hands back to the
/// caller: the rewritten message list to send upstream, an optional
/// structured-output schema for a forced `toolChoice`, and a sidecar the
/// caller must thread through to [`ToolCallMiddleware::wrap_generate`] /
/// [`ToolCallMiddleware::wrap_stream`] on the way back.
#[derive(Debug, Clone)]
pub struct TransformedRequest {
    pub messages: Vec<Message>,
    pub response_format: Option<Value>,
    pub sidecar: ToolCallSidecar,
}

/// Carries the tool names, original schemas, and resolved `toolChoice`
/// across the transport boundary (§4.5 step 4), since the outgoing
/// request itself no longer carries a `tools` field.
#[derive(Debug, Clone)]
pub struct ToolCallSidecar {
    pub tool_names: Vec<String>,
    pub tool_schemas_json: String,
    pub tool_choice: ToolChoice,
}

fn validate_tool_choice(choice: &ToolChoice, tools: &[ToolDefinition]) -> Result<()> {
    let result = match choice {
        ToolChoice::None => Err(Error::tool_choice(
            "toolChoice `none` is not a request this middleware can make of a \
             text-protocol model: there is no wire-level way to suppress tool \
             calls short of not describing any tools at all",
        )),
        ToolChoice::Tool(name) => {
            let tool = tools
                .iter()
                .find(|t| &t.name == name)
                .ok_or_else(|| Error::tool_choice(format!("unknown tool `{name}`")))?;
            if tool.provider_defined {
                Err(Error::tool_choice(format!(
                    "tool `{name}` is provider-defined and cannot be routed through a text protocol"
                )))
            } else {
                Ok(())
            }
        }
        ToolChoice::Required => {
            if tools.is_empty() {
                Err(Error::tool_choice(
                    "toolChoice `required` was requested with no tools to choose from",
                ))
            } else {
                Ok(())
            }
        }
        ToolChoice::Auto => Ok(()),
    };
    if let Err(err) = &result {
        warn!(%err, "pre-call tool_choice validation failed");
    }
    result
}

/// `{"type":"object","properties":{"name":{"const":...},"arguments":<tool schema>}}`
/// — the direct-named-tool half of §4.5 point 5.
/// An `if/then/else`-style union over every tool's schema, gated on the
/// `name` field, for `toolChoice: required` (§4.5 point 5). Built as a
/// right fold of `allOf` branches rather than a single chained
/// `if/then/else`, which says the same thing without needing a decided
/// branch order.
fn forced_schema_any_tool(tools: &[ToolDefinition]) -> Value {
    let names: Vec<Value> = tools.iter().map(|t| Value::String(t.name.clone())).collect();
    let branches: Vec<Value> = tools
        .iter()
        .map(|tool| {
            json!({
                "if": { "properties": { "name": { "const": tool.name } } },
                "then": { "properties": { "arguments": tool.input_schema } },
            })
        })
        .collect();
    json!({
        "type": "object",
        "properties": {
            "name": { "enum": names },
            "arguments": {},
        },
        "required": ["name", "arguments"],
        "allOf": branches,
    })
}

fn rewrite_message(msg: &Message, protocol: &dyn ToolCallProtocol) -> Message {
    let role = if msg.role == Role::Tool { Role::User } else { msg.role };
    let content = msg
        .content
        .iter()
        .map(|part| match part {
            ContentPart::ToolCall(call) => ContentPart::text(protocol.format_tool_call(call)),
            ContentPart::ToolResult(result) => {
                ContentPart::text(protocol.format_tool_response(result))
            }
            other => other.clone(),
        })
        .collect();
    Message::new(role, content)
}

/// Collapses adjacent `Text` parts within each message's content list
/// into one (§4.5 step 3).
fn merge_adjacent_text_parts(messages: &mut [Message]) {
    for msg in messages.iter_mut() {
        let mut merged: Vec<ContentPart> = Vec::with_capacity(msg.content.len());
        for part in msg.content.drain(..) {
            match (merged.last_mut(), &part) {
                (Some(ContentPart::Text { text: prev }), ContentPart::Text { text: next }) => {
                    prev.push_str(next);
                }
                _ => merged.push(part),
            }
        }
        msg.content = merged;
    }
}

/// Collapses adjacent `user`-role messages into one, joining their text
/// content with `\n` (§4.5 step 3). Runs after tool-role rewriting, since
/// that step is what can produce the adjacency in the first place.
fn merge_adjacent_user_messages(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for msg in messages {
        if msg.role == Role::User {
            if let Some(prev) = out.last_mut() {
                if prev.role == Role::User {
                    if let (Some(prev_text), Some(next_text)) =
                        (prev.content.last_mut(), msg.content.first())
                    {
                        if let (ContentPart::Text { text: prev_text }, ContentPart::Text { text: next_text }) =
                            (prev_text, next_text)
                        {
                            prev_text.push('\n');
                            prev_text.push_str(next_text);
                            prev.content.extend(msg.content.into_iter().skip(1));
                            continue;
                        }
                    }
                    prev.content.extend(msg.content);
                    continue;
                }
            }
        }
        out.push(msg);
    }
    out
}

/// Parses the upstream response to a forced `toolChoice`. A named-tool
/// choice (`ToolChoice::Tool`) attaches the tool's own arguments schema
/// directly (§4.5 point 5), so the whole response *is* the arguments —
/// there is no `name`/`arguments` envelope to unwrap. `ToolChoice::Required`
/// attaches the multi-tool union schema, which does carry that envelope
/// so the model can say which tool it picked.
fn parse_forced_call(
    text: &str,
    choice: &ToolChoice,
    tools: &[ToolDefinition],
    id_gen: &dyn IdGenerator,
) -> Result<ToolCall> {
    let value: Value = serde_json::from_str(text.trim())?;

    let (name, arguments) = match choice {
        ToolChoice::Tool(name) => (name.clone(), value),
        _ => {
            let obj = value.as_object().ok_or_else(|| {
                Error::schema_coercion("forced tool-call response was not a JSON object")
            })?;
            let name = obj
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::schema_coercion("forced tool-call response missing `name`"))?;
            let arguments = obj.get("arguments").cloned().unwrap_or_else(|| json!({}));
            (name, arguments)
        }
    };

    let tool = tools
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| Error::schema_coercion(format!("forced tool-call named unknown tool `{name}`")))?;

    let coerced = coerce_json_value(&arguments, &tool.input_schema);
    Ok(ToolCall::new(
        id_gen.next_id(),
        name,
        serde_json::to_string(&coerced)?,
    ))
}

/// The middleware instance: a protocol plus the options every call into
/// it shares. Constructed once per host configuration and shared
/// read-only across requests (§3 Ownership), same as a `ProtocolConfig`.
pub struct ToolCallMiddleware {
    protocol: Arc<dyn ToolCallProtocol>,
    parse_options: ParseOptions,
    id_gen: Arc<dyn IdGenerator>,
}

impl ToolCallMiddleware {
    pub fn new(protocol: Arc<dyn ToolCallProtocol>) -> Self {
        Self {
            protocol,
            parse_options: ParseOptions::default(),
            id_gen: default_id_generator(),
        }
    }

    pub fn with_parse_options(mut self, options: ParseOptions) -> Self {
        self.parse_options = options;
        self
    }

    pub fn with_id_generator(mut self, id_gen: Arc<dyn IdGenerator>) -> Self {
        self.id_gen = id_gen;
        self
    }

    pub fn protocol(&self) -> &dyn ToolCallProtocol {
        self.protocol.as_ref()
    }

    /// Pre-call rewrite (§4.5 "Pre-call rewrite").
    pub fn transform_params(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        tool_choice: ToolChoice,
    ) -> Result<TransformedRequest> {
        validate_tool_choice(&tool_choice, tools)?;

        let mut out = Vec::with_capacity(messages.len() + 1);
        if !tools.is_empty() {
            out.push(Message::system(self.protocol.format_tools(tools)));
        }
        out.extend(messages.iter().map(|m| rewrite_message(m, self.protocol.as_ref())));

        merge_adjacent_text_parts(&mut out);
        let out = merge_adjacent_user_messages(out);

        let response_format = match &tool_choice {
            ToolChoice::Required => Some(forced_schema_any_tool(tools)),
            ToolChoice::Tool(name) => tools
                .iter()
                .find(|t| &t.name == name)
                .map(|t| t.input_schema.clone()),
            ToolChoice::Auto | ToolChoice::None => None,
        };

        let sidecar = ToolCallSidecar {
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
            tool_schemas_json: serde_json::to_string(tools)?,
            tool_choice,
        };

        Ok(TransformedRequest {
            messages: out,
            response_format,
            sidecar,
        })
    }

    /// Post-call wrap, non-streaming (§4.5 "Post-call wrap").
    pub fn wrap_generate(
        &self,
        raw: &GenerateResult,
        sidecar: &ToolCallSidecar,
        tools: &[ToolDefinition],
        on_error: &mut dyn FnMut(&str),
    ) -> (Vec<ContentPart>, FinishReason) {
        let mut logged = |msg: &str| {
            warn!(%msg, "onError callback invoked");
            on_error(msg);
        };
        let on_error: &mut dyn FnMut(&str) = &mut logged;

        let mut parts = Vec::new();
        if let Some(reasoning) = &raw.reasoning {
            if !reasoning.is_empty() {
                parts.push(ContentPart::reasoning(reasoning.clone()));
            }
        }

        let forced = matches!(sidecar.tool_choice, ToolChoice::Required | ToolChoice::Tool(_));
        if forced {
            match parse_forced_call(&raw.content, &sidecar.tool_choice, tools, self.id_gen.as_ref()) {
                Ok(call) => parts.push(ContentPart::ToolCall(call)),
                Err(err) => {
                    on_error(&err.to_string());
                    if !raw.content.is_empty() {
                        parts.push(ContentPart::text(raw.content.clone()));
                    }
                }
            }
        } else {
            parts.extend(self.protocol.parse_generated_text(
                &raw.content,
                tools,
                &self.parse_options,
                on_error,
            ));
        }

        let saw_tool_call = parts.iter().any(|p| matches!(p, ContentPart::ToolCall(_)));
        let finish_reason = if saw_tool_call {
            FinishReason::ToolCalls
        } else {
            raw.finish_reason
        };
        (parts, finish_reason)
    }

    /// Post-call wrap, streaming (§4.5 "Post-call wrap", §4.5 "Finish-reason
    /// mapping"). Every [`RawStreamEvent::TextDelta`] is routed through the
    /// protocol's [`StreamParser`]; every other event passes through with
    /// at most its `finish_reason` rewritten to `ToolCalls`. Exactly one
    /// terminal event (`FinishStep` or `Finish`) is ever emitted, matching
    /// the "second terminal event is suppressed" rule.
    pub fn wrap_stream(
        &self,
        upstream: RawEventStream,
        tools: Vec<ToolDefinition>,
        mut on_error: impl FnMut(&str) + Send + 'static,
    ) -> StreamPartStream {
        let mut on_error = move |msg: &str| {
            warn!(%msg, "onError callback invoked");
            on_error(msg);
        };
        let parser = self.protocol.create_stream_parser(tools, self.parse_options.clone());
        let state = WrapStreamState {
            parser,
            saw_tool_call: false,
            terminal_emitted: false,
        };

        let mapped = upstream.scan(state, move |state, event| {
            let out = state.handle(event, &mut on_error);
            futures::future::ready(Some(out))
        });

        Box::pin(mapped.flat_map(futures::stream::iter))
    }
}

struct WrapStreamState {
    parser: Box<dyn StreamParser>,
    saw_tool_call: bool,
    terminal_emitted: bool,
}

impl WrapStreamState {
    fn handle(
        &mut self,
        event: RawStreamEvent,
        on_error: &mut dyn FnMut(&str),
    ) -> Vec<crate::types::StreamPart> {
        use crate::types::StreamPart;

        if self.terminal_emitted {
            return Vec::new();
        }

        match event {
            RawStreamEvent::Start => vec![StreamPart::Start],
            RawStreamEvent::TextDelta(delta) => {
                let parts = self.parser.feed_text(&delta, on_error);
                if parts.iter().any(|p| matches!(p, StreamPart::ToolCall(_))) {
                    self.saw_tool_call = true;
                }
                parts
            }
            RawStreamEvent::ReasoningStart { id } => vec![StreamPart::ReasoningStart { id }],
            RawStreamEvent::ReasoningDelta { id, delta } => {
                vec![StreamPart::ReasoningDelta { id, delta }]
            }
            RawStreamEvent::ReasoningEnd { id } => vec![StreamPart::ReasoningEnd { id }],
            RawStreamEvent::FinishStep { finish_reason } => {
                let mut out = self.parser.finish(on_error);
                let finish_reason = if self.saw_tool_call {
                    FinishReason::ToolCalls
                } else {
                    finish_reason
                };
                out.push(StreamPart::FinishStep { finish_reason });
                self.terminal_emitted = true;
                out
            }
            RawStreamEvent::Finish { finish_reason, usage } => {
                let mut out = self.parser.finish(on_error);
                let finish_reason = if self.saw_tool_call {
                    FinishReason::ToolCalls
                } else {
                    finish_reason
                };
                out.push(StreamPart::Finish { finish_reason, usage });
                self.terminal_emitted = true;
                out
            }
            RawStreamEvent::Error { message } => {
                let mut out = self.parser.finish(on_error);
                out.push(StreamPart::Error { message });
                self.terminal_emitted = true;
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::json_tag::{JsonTagConfig, JsonTagProtocol};
    use serde_json::json;

    fn weather_tool() -> ToolDefinition {
        ToolDefinition::new(
            "get_weather",
            json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        )
    }

    fn middleware() -> ToolCallMiddleware {
        ToolCallMiddleware::new(Arc::new(JsonTagProtocol::with_config(
            JsonTagConfig::new().with_id_generator(crate::protocols::test_support::test_id_gen()),
        )))
    }

    #[test]
    fn test_transform_params_rejects_none_choice() {
        let mw = middleware();
        let err = mw
            .transform_params(&[], &[weather_tool()], ToolChoice::None)
            .unwrap_err();
        assert!(matches!(err, Error::ToolChoice(_)));
    }

    #[test]
    fn test_transform_params_rejects_required_with_no_tools() {
        let mw = middleware();
        let err = mw
            .transform_params(&[], &[], ToolChoice::Required)
            .unwrap_err();
        assert!(matches!(err, Error::ToolChoice(_)));
    }

    #[test]
    fn test_transform_params_rejects_unknown_named_tool() {
        let mw = middleware();
        let err = mw
            .transform_params(&[], &[weather_tool()], ToolChoice::Tool("nope".into()))
            .unwrap_err();
        assert!(matches!(err, Error::ToolChoice(_)));
    }

    #[test]
    fn test_transform_params_injects_system_prompt() {
        let mw = middleware();
        let result = mw
            .transform_params(&[Message::user("hi")], &[weather_tool()], ToolChoice::Auto)
            .unwrap();
        assert_eq!(result.messages[0].role, Role::System);
        assert!(result.messages[0].content[0]
            .as_text()
            .unwrap()
            .contains("get_weather"));
        assert!(result.response_format.is_none());
    }

    #[test]
    fn test_transform_params_required_attaches_schema() {
        let mw = middleware();
        let result = mw
            .transform_params(&[Message::user("hi")], &[weather_tool()], ToolChoice::Required)
            .unwrap();
        assert!(result.response_format.is_some());
    }

    /// `toolChoice: tool(name)` attaches the tool's own arguments schema
    /// directly, not a `{name, arguments}` envelope — the upstream model
    /// sees exactly the shape it would need to fill in `arguments` alone.
    #[test]
    fn test_transform_params_tool_choice_attaches_bare_arguments_schema() {
        let mw = middleware();
        let result = mw
            .transform_params(
                &[Message::user("hi")],
                &[weather_tool()],
                ToolChoice::Tool("get_weather".into()),
            )
            .unwrap();
        assert_eq!(result.response_format.unwrap(), weather_tool().input_schema);
    }

    #[test]
    fn test_transform_params_rewrites_tool_call_history() {
        let mw = middleware();
        let call = ToolCall::new("call-0", "get_weather", r#"{"city":"Seoul"}"#);
        let history = vec![Message::assistant(vec![ContentPart::ToolCall(call)])];
        let result = mw
            .transform_params(&history, &[weather_tool()], ToolChoice::Auto)
            .unwrap();
        let assistant_msg = &result.messages[1];
        assert_eq!(assistant_msg.role, Role::Assistant);
        assert!(assistant_msg.content[0]
            .as_text()
            .unwrap()
            .contains("<tool_call>"));
    }

    #[test]
    fn test_transform_params_rewrites_tool_result_as_user_text() {
        let mw = middleware();
        let result_part = crate::types::ToolResult::new("call-0", "get_weather", json!({"temp": 20}));
        let history = vec![Message::tool(vec![ContentPart::ToolResult(result_part)])];
        let result = mw
            .transform_params(&history, &[weather_tool()], ToolChoice::Auto)
            .unwrap();
        let rewritten = &result.messages[1];
        assert_eq!(rewritten.role, Role::User);
        assert!(rewritten.content[0].as_text().unwrap().contains("temp"));
    }

    #[test]
    fn test_transform_params_merges_adjacent_user_messages() {
        let mw = middleware();
        let history = vec![Message::user("first"), Message::user("second")];
        let result = mw.transform_params(&history, &[], ToolChoice::Auto).unwrap();
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].content[0].as_text(), Some("first\nsecond"));
    }

    #[test]
    fn test_wrap_generate_parses_tool_call() {
        let mw = middleware();
        let raw = GenerateResult {
            content: r#"<tool_call>{"name": "get_weather", "arguments": {"city": "Seoul"}}</tool_call>"#
                .to_string(),
            reasoning: None,
            finish_reason: FinishReason::Stop,
            usage: None,
        };
        let sidecar = ToolCallSidecar {
            tool_names: vec!["get_weather".into()],
            tool_schemas_json: "[]".into(),
            tool_choice: ToolChoice::Auto,
        };
        let mut errors = Vec::new();
        let (parts, reason) = mw.wrap_generate(&raw, &sidecar, &[weather_tool()], &mut |e| {
            errors.push(e.to_string())
        });
        assert!(errors.is_empty());
        assert_eq!(reason, FinishReason::ToolCalls);
        assert!(parts
            .iter()
            .any(|p| matches!(p, ContentPart::ToolCall(call) if call.tool_name == "get_weather")));
    }

    #[test]
    fn test_wrap_generate_forced_tool_choice() {
        let mw = middleware();
        let raw = GenerateResult {
            content: r#"{"city": "Seoul"}"#.to_string(),
            reasoning: None,
            finish_reason: FinishReason::Stop,
            usage: None,
        };
        let sidecar = ToolCallSidecar {
            tool_names: vec!["get_weather".into()],
            tool_schemas_json: "[]".into(),
            tool_choice: ToolChoice::Tool("get_weather".into()),
        };
        let (parts, reason) = mw.wrap_generate(&raw, &sidecar, &[weather_tool()], &mut |_| {});
        assert_eq!(reason, FinishReason::ToolCalls);
        match &parts[0] {
            ContentPart::ToolCall(call) => {
                assert_eq!(call.tool_name, "get_weather");
                assert_eq!(call.input_value().unwrap()["city"], "Seoul");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrap_stream_splices_tool_call_and_maps_finish_reason() {
        let mw = middleware();
        let events = vec![
            RawStreamEvent::Start,
            RawStreamEvent::TextDelta("Hi ".to_string()),
            RawStreamEvent::TextDelta(
                r#"<tool_call>{"name": "get_weather", "arguments": {"city": "Seoul"}}</tool_call>"#
                    .to_string(),
            ),
            RawStreamEvent::Finish {
                finish_reason: FinishReason::Stop,
                usage: None,
            },
        ];
        let upstream: RawEventStream = Box::pin(futures::stream::iter(events));
        let mut stream = mw.wrap_stream(upstream, vec![weather_tool()], |_| {});

        let mut saw_tool_call = false;
        let mut finish_reason = None;
        while let Some(part) = stream.next().await {
            match part {
                crate::types::StreamPart::ToolCall(call) => {
                    assert_eq!(call.tool_name, "get_weather");
                    saw_tool_call = true;
                }
                crate::types::StreamPart::Finish { finish_reason: reason, .. } => {
                    finish_reason = Some(reason);
                }
                _ => {}
            }
        }
        assert!(saw_tool_call);
        assert_eq!(finish_reason, Some(FinishReason::ToolCalls));
    }

    #[tokio::test]
    async fn test_wrap_stream_suppresses_second_terminal_event() {
        let mw = middleware();
        let events = vec![
            RawStreamEvent::TextDelta("hi".to_string()),
            RawStreamEvent::FinishStep { finish_reason: FinishReason::Stop },
            RawStreamEvent::Finish { finish_reason: FinishReason::Stop, usage: None },
        ];
        let upstream: RawEventStream = Box::pin(futures::stream::iter(events));
        let mut stream = mw.wrap_stream(upstream, vec![weather_tool()], |_| {});

        let mut terminal_count = 0;
        while let Some(part) = stream.next().await {
            if matches!(
                part,
                crate::types::StreamPart::FinishStep { .. } | crate::types::StreamPart::Finish { .. }
            ) {
                terminal_count += 1;
            }
        }
        assert_eq!(terminal_count, 1);
    }
}
