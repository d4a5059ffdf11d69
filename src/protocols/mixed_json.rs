//! Mixed JSON: no wrapping delimiter at all — a tool call is just a bare
//! `{"name": "...", "arguments": {...}}` object embedded anywhere in the
//! model's prose, detected by brace-balance rather than by a fixed open/
//! close tag pair.
//!
//! Braces are self-delimiting, so unlike [`super::json_tag`] there is no
//! multi-character delimiter that can appear partially at a chunk
//! boundary — a `{` is always a complete, unambiguous signal to start
//! watching. What *is* ambiguous is whether a given `{...}` span is a
//! tool call at all: ordinary prose can contain braces too (code
//! samples, set notation). The parser commits to treating a balanced
//! span as a tool call only once it has parsed clean *and* named a known
//! tool; otherwise the whole span is flushed back out as literal text.

use std::sync::Arc;

use serde_json::Value;

use crate::types::{
    ContentPart, ErrorTextPolicy, ParseOptions, StreamMode, StreamParserState, StreamPart,
    ToolCall, ToolDefinition, ToolResult,
};
use crate::utils::{default_id_generator, IdGenerator};
use tracing::debug;

use super::{StreamParser, ToolCallProtocol, ToolCatalogTemplate};

#[derive(Clone)]
pub struct MixedJsonConfig {
    pub template: ToolCatalogTemplate,
    pub id_gen: Arc<dyn IdGenerator>,
}

impl MixedJsonConfig {
    pub fn new() -> Self {
        Self {
            template: Arc::new(default_mixed_json_template),
            id_gen: default_id_generator(),
        }
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

impl Default for MixedJsonConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_mixed_json_template(tools: &[ToolDefinition]) -> String {
    let mut out = String::from(
        "You have access to the following tools. To call one, include a \
         single JSON object of this form anywhere in your reply:\n\n\
         {\"name\": \"<tool name>\", \"arguments\": <arguments object>}\n\n\
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

/// Tracks brace depth across a balanced-object scan, string-aware so
/// braces inside JSON string literals (or single-quoted relaxed-JSON
/// strings) are never mistaken for structural ones.
#[derive(Debug, Default, Clone, Copy)]
struct BraceScanState {
    depth: i32,
    in_string: Option<char>,
    escape: bool,
}

impl BraceScanState {
    /// Continues scanning `buf` from `start_offset` onward. Returns the
    /// byte offset of the first position after the `}` that brought
    /// `depth` back to zero, if reached within this call.
    fn scan(&mut self, buf: &str, start_offset: usize) -> Option<usize> {
        for (i, ch) in buf[start_offset..].char_indices() {
            let abs = start_offset + i;
            if let Some(quote) = self.in_string {
                if self.escape {
                    self.escape = false;
                } else if ch == '\\' {
                    self.escape = true;
                } else if ch == quote {
                    self.in_string = None;
                }
                continue;
            }
            match ch {
                '"' | '\'' => self.in_string = Some(ch),
                '{' => self.depth += 1,
                '}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return Some(abs + ch.len_utf8());
                    }
                }
                _ => {}
            }
        }
        None
    }
}

fn try_build_tool_call(
    payload: &str,
    tools: &[ToolDefinition],
    id_gen: &dyn IdGenerator,
) -> Option<ToolCall> {
    let value: Value = crate::rjson::parse(payload).ok()?;
    let name = value.get("name").and_then(Value::as_str)?;
    let tool_def = tools.iter().find(|t| t.name == name)?;
    let arguments = value.get("arguments").cloned().unwrap_or_default();
    let coerced = crate::coercion::coerce_json_value(&arguments, &tool_def.input_schema);
    let input = serde_json::to_string(&coerced).unwrap_or_else(|_| "{}".to_string());
    Some(ToolCall::new(id_gen.next_id(), name.to_string(), input))
}

pub struct MixedJsonProtocol {
    config: MixedJsonConfig,
}

impl MixedJsonProtocol {
    pub fn new() -> Self {
        Self::with_config(MixedJsonConfig::new())
    }

    pub fn with_config(config: MixedJsonConfig) -> Self {
        debug!("constructing mixed-JSON protocol");
        Self { config }
    }
}

impl Default for MixedJsonProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallProtocol for MixedJsonProtocol {
    fn name(&self) -> &'static str {
        "mixed-json"
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> String {
        (self.config.template)(tools)
    }

    fn format_tool_call(&self, call: &ToolCall) -> String {
        let arguments: Value = serde_json::from_str(&call.input).unwrap_or(Value::Null);
        serde_json::json!({ "name": call.tool_name, "arguments": arguments }).to_string()
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
            let Some(brace_idx) = rest.find('{') else {
                text_buf.push_str(rest);
                break;
            };

            let mut scanner = BraceScanState::default();
            match scanner.scan(rest, brace_idx) {
                Some(end) => {
                    let payload = &rest[brace_idx..end];
                    match try_build_tool_call(payload, tools, self.config.id_gen.as_ref()) {
                        Some(call) => {
                            text_buf.push_str(&rest[..brace_idx]);
                            if !text_buf.is_empty() {
                                parts.push(ContentPart::text(std::mem::take(&mut text_buf)));
                            }
                            parts.push(ContentPart::ToolCall(call));
                            rest = &rest[end..];
                        }
                        None => {
                            on_error("brace-balanced span was not a recognized tool call");
                            if options.error_text_policy == ErrorTextPolicy::EmitRawText {
                                text_buf.push_str(&rest[..brace_idx + 1]);
                            } else {
                                text_buf.push_str(&rest[..brace_idx]);
                            }
                            rest = &rest[brace_idx + 1..];
                        }
                    }
                }
                None => {
                    on_error("unterminated JSON object at end of text");
                    text_buf.push_str(rest);
                    break;
                }
            }
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
        Box::new(MixedJsonStreamParser {
            config: self.config.clone(),
            tools,
            options,
            state: StreamParserState::new(),
            payload_buf: String::new(),
            scanner: BraceScanState::default(),
            scanned_len: 0,
        })
    }
}

struct MixedJsonStreamParser {
    config: MixedJsonConfig,
    tools: Vec<ToolDefinition>,
    options: ParseOptions,
    state: StreamParserState,
    payload_buf: String,
    scanner: BraceScanState,
    /// Byte length of `payload_buf` already passed through `scanner`;
    /// re-scanning only `payload_buf[scanned_len..]` on each call keeps
    /// this linear in total input rather than quadratic.
    scanned_len: usize,
}

impl MixedJsonStreamParser {
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
}

impl StreamParser for MixedJsonStreamParser {
    fn feed_text(&mut self, delta: &str, on_error: &mut dyn FnMut(&str)) -> Vec<StreamPart> {
        if self.state.finish_sent {
            return Vec::new();
        }
        let mut out = Vec::new();

        match self.state.mode {
            StreamMode::Outside => self.state.buffer.push_str(delta),
            StreamMode::InsideTool => self.payload_buf.push_str(delta),
        }

        loop {
            match self.state.mode {
                StreamMode::Outside => {
                    let Some(brace_idx) = self.state.buffer.find('{') else {
                        let text = std::mem::take(&mut self.state.buffer);
                        self.emit_text_delta(&text, &mut out);
                        break;
                    };
                    let before = self.state.buffer[..brace_idx].to_string();
                    self.emit_text_delta(&before, &mut out);
                    self.close_text_block(&mut out);
                    let rest = self.state.buffer[brace_idx..].to_string();
                    self.state.buffer.clear();
                    self.state.mode = StreamMode::InsideTool;
                    self.payload_buf = rest;
                    self.scanner = BraceScanState::default();
                    self.scanned_len = 0;
                }
                StreamMode::InsideTool => {
                    let from = self.scanned_len;
                    match self.scanner.scan(&self.payload_buf, from) {
                        Some(end) => {
                            let payload = self.payload_buf[..end].to_string();
                            let after = self.payload_buf[end..].to_string();
                            self.payload_buf.clear();
                            self.scanned_len = 0;
                            self.state.mode = StreamMode::Outside;

                            match try_build_tool_call(&payload, &self.tools, self.config.id_gen.as_ref())
                            {
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
                                    on_error("brace-balanced span was not a recognized tool call");
                                    if self.options.error_text_policy == ErrorTextPolicy::EmitRawText
                                    {
                                        self.emit_text_delta(&payload, &mut out);
                                    }
                                }
                            }
                            self.state.buffer = after;
                        }
                        None => {
                            self.scanned_len = self.payload_buf.len();
                            break;
                        }
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
                on_error("stream ended inside an unbalanced JSON object");
                if self.options.error_text_policy == ErrorTextPolicy::EmitRawText {
                    let raw = std::mem::take(&mut self.payload_buf);
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

    fn protocol_with_test_ids() -> MixedJsonProtocol {
        MixedJsonProtocol::with_config(MixedJsonConfig::new().with_id_generator(test_id_gen()))
    }

    #[test]
    fn test_parse_generated_text_simple_call() {
        let protocol = protocol_with_test_ids();
        let tools = vec![weather_tool()];
        let parts = protocol.parse_generated_text(
            r#"Sure: {"name": "get_weather", "arguments": {"city": "Seoul"}} there you go"#,
            &tools,
            &ParseOptions::default(),
            &mut |_| {},
        );
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].as_text(), Some("Sure: "));
        match &parts[1] {
            ContentPart::ToolCall(call) => assert_eq!(call.tool_name, "get_weather"),
            other => panic!("expected tool call, got {other:?}"),
        }
        assert_eq!(parts[2].as_text(), Some(" there you go"));
    }

    #[test]
    fn test_parse_generated_text_non_tool_braces_pass_through() {
        let protocol = protocol_with_test_ids();
        let parts = protocol.parse_generated_text(
            "here is a set {1, 2, 3} of numbers",
            &[],
            &ParseOptions::default(),
            &mut |_| {},
        );
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].as_text(), Some("here is a set {1, 2, 3} of numbers"));
    }

    #[test]
    fn test_parse_generated_text_nested_braces_in_arguments() {
        let tool = ToolDefinition::new(
            "search",
            json!({"type": "object", "properties": {"filter": {"type": "object"}}}),
        );
        let protocol = protocol_with_test_ids();
        let parts = protocol.parse_generated_text(
            r#"{"name": "search", "arguments": {"filter": {"nested": true}}}"#,
            &[tool],
            &ParseOptions::default(),
            &mut |_| {},
        );
        assert_eq!(parts.len(), 1);
        match &parts[0] {
            ContentPart::ToolCall(call) => {
                assert_eq!(call.input_value().unwrap()["filter"]["nested"], true);
            }
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
            r#"ok {"name": "get_weather", "arguments": {"city": "Seoul"}} done"#,
        );
        assert!(parts
            .iter()
            .any(|p| matches!(p, StreamPart::ToolCall(call) if call.tool_name == "get_weather")));
    }

    #[test]
    fn test_stream_unbalanced_object_flushed_on_finish() {
        let protocol = protocol_with_test_ids();
        let mut parser = protocol.create_stream_parser(vec![weather_tool()], ParseOptions::default());
        let mut errors = Vec::new();
        let mut on_error = |e: &str| errors.push(e.to_string());

        let mut parts = parser.feed_text(r#"{"name": "get_weather""#, &mut on_error);
        parts.extend(parser.finish(&mut on_error));

        assert!(!errors.is_empty());
        assert!(!parts.iter().any(|p| matches!(p, StreamPart::ToolCall(_))));
    }
}
