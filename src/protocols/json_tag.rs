//! JSON-in-tag: `<tool_call>{"name": "...", "arguments": {...}}</tool_call>`.
//!
//! The reference protocol every other JSON-flavored codec in this module
//! builds on: [`mixed_json`] relaxes the opener, and [`variants`] swaps
//! the delimiters and system-prompt template to match a specific model
//! family's training format, grounded in the per-provider prompt
//! construction in `wesamahakem-goose`'s `providers::formats` modules.
//!
//! The tool name is only known once the payload between the tags has
//! been fully parsed, so the streaming half of this protocol defers
//! every `tool-input-*` event until the close tag completes — it never
//! emits a partial JSON payload as a delta. See the module-level
//! streaming design note in `SPEC_FULL.md` §4.5/§7.

use std::sync::Arc;

use serde_json::Value;

use crate::types::{
    ContentPart, ErrorTextPolicy, ParseOptions, StreamMode, StreamParserState, StreamPart,
    ToolCall, ToolDefinition, ToolResult,
};
use crate::utils::{default_id_generator, find_potential_start, IdGenerator, StartMatch};
use tracing::debug;

use super::{StreamParser, ToolCallProtocol, ToolCatalogTemplate};

/// Delimiters, system-prompt template, and id generator for one JSON-tag
/// flavored protocol. [`variants`] constructs several of these with the
/// same parsing machinery and different `open_tag`/`close_tag`/`template`.
#[derive(Clone)]
pub struct JsonTagConfig {
    pub open_tag: String,
    pub close_tag: String,
    pub template: ToolCatalogTemplate,
    pub id_gen: Arc<dyn IdGenerator>,
}

impl JsonTagConfig {
    pub fn new() -> Self {
        Self {
            open_tag: "<tool_call>".to_string(),
            close_tag: "</tool_call>".to_string(),
            template: Arc::new(default_json_tag_template),
            id_gen: default_id_generator(),
        }
    }

    pub fn with_tags(mut self, open_tag: impl Into<String>, close_tag: impl Into<String>) -> Self {
        self.open_tag = open_tag.into();
        self.close_tag = close_tag.into();
        self
    }

    pub fn with_template(mut self, template: ToolCatalogTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn with_id_generator(mut self, id_gen: Arc<dyn IdGenerator>) -> Self {
        self.id_gen = id_gen;
        self
    }
}

impl Default for JsonTagConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_json_tag_template(tools: &[ToolDefinition]) -> String {
    let mut out = String::from(
        "You have access to the following tools. To call one, respond with \
         exactly one tag of this form and nothing else:\n\n\
         <tool_call>{\"name\": \"<tool name>\", \"arguments\": <arguments object>}</tool_call>\n\n\
         Available tools:\n",
    );
    for tool in tools {
        out.push_str(&format!("\n- `{}`", tool.name));
        if let Some(description) = &tool.description {
            out.push_str(&format!(": {description}"));
        }
        out.push_str(&format!(
            "\n  parameters: {}\n",
            serde_json::to_string(&tool.input_schema).unwrap_or_default()
        ));
    }
    out
}

/// The JSON-in-tag protocol.
pub struct JsonTagProtocol {
    config: JsonTagConfig,
}

impl JsonTagProtocol {
    pub fn new() -> Self {
        Self::with_config(JsonTagConfig::new())
    }

    pub fn with_config(config: JsonTagConfig) -> Self {
        debug!(
            open_tag = %config.open_tag,
            close_tag = %config.close_tag,
            "constructing JSON-tag protocol"
        );
        Self { config }
    }
}

impl Default for JsonTagProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallProtocol for JsonTagProtocol {
    fn name(&self) -> &'static str {
        "json-tag"
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> String {
        (self.config.template)(tools)
    }

    fn format_tool_call(&self, call: &ToolCall) -> String {
        let arguments: Value = serde_json::from_str(&call.input).unwrap_or(Value::Null);
        let payload = serde_json::json!({ "name": call.tool_name, "arguments": arguments });
        format!(
            "{}{}{}",
            self.config.open_tag,
            payload,
            self.config.close_tag
        )
    }

    fn format_tool_response(&self, result: &ToolResult) -> String {
        format!(
            "Result of `{}`:\n{}",
            result.tool_name,
            serde_json::to_string(&result.output).unwrap_or_default()
        )
    }

    fn parse_generated_text(
        &self,
        text: &str,
        tools: &[ToolDefinition],
        options: &ParseOptions,
        on_error: &mut dyn FnMut(&str),
    ) -> Vec<ContentPart> {
        let mut parts = Vec::new();
        let mut text_buf = String::new();
        let mut rest = text;

        loop {
            let Some(open_idx) = rest.find(&self.config.open_tag) else {
                text_buf.push_str(rest);
                break;
            };
            text_buf.push_str(&rest[..open_idx]);
            let after_open = &rest[open_idx + self.config.open_tag.len()..];

            let Some(close_idx) = after_open.find(&self.config.close_tag) else {
                on_error("unterminated tool-call tag at end of text");
                text_buf.push_str(&rest[open_idx..]);
                break;
            };
            let payload = &after_open[..close_idx];

            match build_tool_call(payload, tools, self.config.id_gen.as_ref(), on_error) {
                Some(call) => {
                    if !text_buf.is_empty() {
                        parts.push(ContentPart::text(std::mem::take(&mut text_buf)));
                    }
                    parts.push(ContentPart::ToolCall(call));
                }
                None => {
                    if options.error_text_policy == ErrorTextPolicy::EmitRawText {
                        let raw_end = open_idx
                            + self.config.open_tag.len()
                            + close_idx
                            + self.config.close_tag.len();
                        text_buf.push_str(&rest[open_idx..raw_end]);
                    }
                }
            }

            rest = &after_open[close_idx + self.config.close_tag.len()..];
        }

        if !text_buf.is_empty() {
            parts.push(ContentPart::text(text_buf));
        }
        parts
    }

    fn create_stream_parser(
        &self,
        tools: Vec<ToolDefinition>,
        options: ParseOptions,
    ) -> Box<dyn StreamParser> {
        Box::new(JsonTagStreamParser {
            config: self.config.clone(),
            tools,
            options,
            state: StreamParserState::new(),
            payload_buf: String::new(),
        })
    }
}

/// Parses the payload between an open and close tag into a [`ToolCall`],
/// coercing `arguments` against the matching tool's schema. Returns
/// `None` (after calling `on_error`) for a payload that doesn't parse,
/// has no `name`, or names a tool not in `tools`.
fn build_tool_call(
    payload: &str,
    tools: &[ToolDefinition],
    id_gen: &dyn IdGenerator,
    on_error: &mut dyn FnMut(&str),
) -> Option<ToolCall> {
    let value: Value = match crate::rjson::parse(payload) {
        Ok(v) => v,
        Err(err) => {
            on_error(&format!("failed to parse tool-call payload: {err}"));
            return None;
        }
    };

    let Some(name) = value.get("name").and_then(Value::as_str) else {
        on_error("tool-call payload missing `name` field");
        return None;
    };

    let Some(tool_def) = tools.iter().find(|t| t.name == name) else {
        on_error(&format!("unknown tool `{name}`"));
        return None;
    };

    let arguments = value.get("arguments").cloned().unwrap_or_default();
    let coerced = crate::coercion::coerce_json_value(&arguments, &tool_def.input_schema);
    let input = serde_json::to_string(&coerced).unwrap_or_else(|_| "{}".to_string());
    Some(ToolCall::new(id_gen.next_id(), name.to_string(), input))
}

/// Reconstructs the literal `<open>payload</close>` text for fallback
/// emission when a payload fails to parse or names an unknown tool.
fn reconstruct_raw(config: &JsonTagConfig, payload: &str) -> String {
    format!("{}{}{}", config.open_tag, payload, config.close_tag)
}

struct JsonTagStreamParser {
    config: JsonTagConfig,
    tools: Vec<ToolDefinition>,
    options: ParseOptions,
    state: StreamParserState,
    /// Raw text seen since entering `InsideTool` mode, not yet matched
    /// against the close tag.
    payload_buf: String,
}

impl JsonTagStreamParser {
    fn emit_text_delta(&mut self, text: &str, out: &mut Vec<StreamPart>) {
        if text.is_empty() {
            return;
        }
        if self.state.current_text_block_id.is_none() {
            let id = self.config.id_gen.next_id();
            out.push(StreamPart::TextStart { id: id.clone() });
            self.state.current_text_block_id = Some(id);
        }
        let id = self.state.current_text_block_id.clone().expect("just set");
        out.push(StreamPart::TextDelta {
            id,
            delta: text.to_string(),
        });
    }

    fn close_text_block(&mut self, out: &mut Vec<StreamPart>) {
        if let Some(id) = self.state.current_text_block_id.take() {
            out.push(StreamPart::TextEnd { id });
        }
    }

    fn emit_tool_call(
        &mut self,
        payload: &str,
        on_error: &mut dyn FnMut(&str),
        out: &mut Vec<StreamPart>,
    ) {
        match build_tool_call(payload, &self.tools, self.config.id_gen.as_ref(), on_error) {
            Some(call) => {
                out.push(StreamPart::ToolInputStart {
                    id: call.tool_call_id.clone(),
                    tool_name: call.tool_name.clone(),
                });
                out.push(StreamPart::ToolInputDelta {
                    id: call.tool_call_id.clone(),
                    delta: call.input.clone(),
                });
                out.push(StreamPart::ToolInputEnd {
                    id: call.tool_call_id.clone(),
                });
                out.push(StreamPart::ToolCall(call));
            }
            None => {
                if self.options.error_text_policy == ErrorTextPolicy::EmitRawText {
                    let raw = reconstruct_raw(&self.config, payload);
                    self.emit_text_delta(&raw, out);
                }
            }
        }
    }
}

impl StreamParser for JsonTagStreamParser {
    fn feed_text(&mut self, delta: &str, on_error: &mut dyn FnMut(&str)) -> Vec<StreamPart> {
        if self.state.finish_sent {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.state.buffer.push_str(delta);

        loop {
            match self.state.mode {
                StreamMode::Outside => {
                    match find_potential_start(&self.state.buffer, &self.config.open_tag) {
                        StartMatch::Complete(idx) => {
                            let before = self.state.buffer[..idx].to_string();
                            self.emit_text_delta(&before, &mut out);
                            self.close_text_block(&mut out);
                            let rest =
                                self.state.buffer[idx + self.config.open_tag.len()..].to_string();
                            self.state.buffer.clear();
                            self.state.mode = StreamMode::InsideTool;
                            self.payload_buf = rest;
                        }
                        StartMatch::Partial(idx) => {
                            let safe = self.state.buffer[..idx].to_string();
                            self.emit_text_delta(&safe, &mut out);
                            self.state.buffer.drain(..idx);
                            break;
                        }
                        StartMatch::None => {
                            let text = std::mem::take(&mut self.state.buffer);
                            self.emit_text_delta(&text, &mut out);
                            break;
                        }
                    }
                }
                StreamMode::InsideTool => {
                    match find_potential_start(&self.payload_buf, &self.config.close_tag) {
                        StartMatch::Complete(idx) => {
                            let payload = self.payload_buf[..idx].to_string();
                            let after =
                                self.payload_buf[idx + self.config.close_tag.len()..].to_string();
                            self.payload_buf.clear();
                            self.state.mode = StreamMode::Outside;
                            self.emit_tool_call(&payload, on_error, &mut out);
                            self.state.buffer = after;
                        }
                        StartMatch::Partial(_) | StartMatch::None => break,
                    }
                }
            }
        }

        out
    }

    fn finish(&mut self, on_error: &mut dyn FnMut(&str)) -> Vec<StreamPart> {
        if self.state.finish_sent {
            return Vec::new();
        }
        self.state.finish_sent = true;
        let mut out = Vec::new();

        match self.state.mode {
            StreamMode::InsideTool => {
                on_error("stream ended inside an unterminated tool-call tag");
                if self.options.error_text_policy == ErrorTextPolicy::EmitRawText {
                    let raw = format!("{}{}", self.config.open_tag, self.payload_buf);
                    self.emit_text_delta(&raw, &mut out);
                }
                self.payload_buf.clear();
            }
            StreamMode::Outside => {
                let text = std::mem::take(&mut self.state.buffer);
                self.emit_text_delta(&text, &mut out);
            }
        }

        self.close_text_block(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::test_support::{feed_char_by_char, test_id_gen};
    use serde_json::json;

    fn weather_tool() -> ToolDefinition {
        ToolDefinition::new(
            "get_weather",
            json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        )
    }

    fn protocol_with_test_ids() -> JsonTagProtocol {
        JsonTagProtocol::with_config(JsonTagConfig::new().with_id_generator(test_id_gen()))
    }

    #[test]
    fn test_parse_generated_text_simple_call() {
        let protocol = protocol_with_test_ids();
        let tools = vec![weather_tool()];
        let mut errors = Vec::new();
        let parts = protocol.parse_generated_text(
            r#"Sure, let me check.<tool_call>{"name": "get_weather", "arguments": {"city": "Seoul"}}</tool_call>"#,
            &tools,
            &ParseOptions::default(),
            &mut |e| errors.push(e.to_string()),
        );
        assert!(errors.is_empty());
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].as_text(), Some("Sure, let me check."));
        match &parts[1] {
            ContentPart::ToolCall(call) => {
                assert_eq!(call.tool_name, "get_weather");
                assert_eq!(call.input_value().unwrap()["city"], "Seoul");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_generated_text_no_tool_call_is_plain_text() {
        let protocol = protocol_with_test_ids();
        let parts = protocol.parse_generated_text(
            "just a plain answer",
            &[],
            &ParseOptions::default(),
            &mut |_| {},
        );
        assert_eq!(parts, vec![ContentPart::text("just a plain answer")]);
    }

    #[test]
    fn test_parse_generated_text_unknown_tool_falls_back_to_text() {
        let protocol = protocol_with_test_ids();
        let mut errors = Vec::new();
        let parts = protocol.parse_generated_text(
            r#"<tool_call>{"name": "nope", "arguments": {}}</tool_call>"#,
            &[],
            &ParseOptions::default(),
            &mut |e| errors.push(e.to_string()),
        );
        assert!(!errors.is_empty());
        assert_eq!(parts.len(), 1);
        assert!(parts[0].as_text().unwrap().contains("nope"));
    }

    #[test]
    fn test_format_tool_call_roundtrips_through_parse() {
        let protocol = protocol_with_test_ids();
        let tools = vec![weather_tool()];
        let call = ToolCall::new("call-0", "get_weather", r#"{"city":"Seoul"}"#);
        let rendered = protocol.format_tool_call(&call);
        let parts = protocol.parse_generated_text(
            &rendered,
            &tools,
            &ParseOptions::default(),
            &mut |_| {},
        );
        assert_eq!(parts.len(), 1);
        match &parts[0] {
            ContentPart::ToolCall(parsed) => assert_eq!(parsed.tool_name, "get_weather"),
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn test_stream_single_char_chunks_simple_call() {
        let protocol = protocol_with_test_ids();
        let tools = vec![weather_tool()];
        let mut parser = protocol.create_stream_parser(tools, ParseOptions::default());
        let parts = feed_char_by_char(
            parser.as_mut(),
            r#"ok <tool_call>{"name": "get_weather", "arguments": {"city": "Seoul"}}</tool_call> done"#,
        );

        let has_tool_call = parts
            .iter()
            .any(|p| matches!(p, StreamPart::ToolCall(call) if call.tool_name == "get_weather"));
        assert!(has_tool_call, "expected a ToolCall part in {parts:?}");

        // No TextDelta may ever carry a prefix of the open tag.
        for part in &parts {
            if let StreamPart::TextDelta { delta, .. } = part {
                assert!(!delta.ends_with('<'));
            }
        }
    }

    #[test]
    fn test_stream_unterminated_tag_flushed_as_text_on_finish() {
        let protocol = protocol_with_test_ids();
        let mut parser = protocol.create_stream_parser(vec![weather_tool()], ParseOptions::default());
        let mut errors = Vec::new();
        let mut on_error = |e: &str| errors.push(e.to_string());

        let mut parts = parser.feed_text(r#"<tool_call>{"name": "get_weather""#, &mut on_error);
        parts.extend(parser.finish(&mut on_error));

        assert!(!errors.is_empty());
        let text: String = parts
            .iter()
            .filter_map(|p| match p {
                StreamPart::TextDelta { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert!(text.contains("<tool_call>"));
        assert!(!parts
            .iter()
            .any(|p| matches!(p, StreamPart::ToolCall(_))));
    }

    #[test]
    fn test_finish_is_idempotent() {
        let protocol = protocol_with_test_ids();
        let mut parser = protocol.create_stream_parser(vec![], ParseOptions::default());
        let mut on_error = |_: &str| {};
        let _ = parser.feed_text("hello", &mut on_error);
        let first = parser.finish(&mut on_error);
        assert!(!first.is_empty());
        let second = parser.finish(&mut on_error);
        assert!(second.is_empty());
    }

    #[test]
    fn test_format_tools_lists_tool_name() {
        let protocol = JsonTagProtocol::new();
        let rendered = protocol.format_tools(&[weather_tool()]);
        assert!(rendered.contains("get_weather"));
        assert!(rendered.contains("<tool_call>"));
    }
}
