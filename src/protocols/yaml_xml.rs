//! YAML-in-XML: the tool name is the wrapping tag, same as
//! [`super::xml_tool`], but the body is one YAML document instead of a
//! tag per field — `<get_weather>\ncity: Seoul\n</get_weather>`. Useful
//! for schemas with deep nesting or multiline string fields, where
//! YAML's block scalars (`|`, `>`) read far more naturally for a model
//! to produce than escaped XML or JSON string content.
//!
//! Shares the opening-tag scan with `xml_tool` via [`super::tagscan`],
//! but not its nested-close-tag search: a YAML body has no nesting of
//! its own, and a `</tool_name>`-lookalike can legitimately appear
//! indented inside a block-scalar string value, so the close tag here
//! must additionally be anchored at column 0 (see [`find_yaml_close`]).
//! What happens to the captured inner fragment also differs:
//! `serde_yaml::from_str` instead of `coerce_xml_fields`, then the
//! ordinary [`crate::coercion::coerce_json_value`] pass shared with the
//! JSON-flavored protocols.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{
    ContentPart, ErrorTextPolicy, ParseOptions, StreamMode, StreamParserState, StreamPart,
    ToolCall, ToolDefinition, ToolResult,
};
use crate::utils::{default_id_generator, IdGenerator};
use tracing::debug;

use super::tagscan::{find_earliest_tool_tag, scan_buffer, BufferScan};
use super::{StreamParser, ToolCallProtocol, ToolCatalogTemplate};

/// Finds `</tag>` anchored at the start of a line (column 0). YAML body
/// content is always indented relative to its enclosing mapping key, so
/// a `</tool_name>`-lookalike embedded in a block-scalar string value
/// never starts a line on its own — only the real close tag does. This
/// is what keeps such lookalikes from being mistaken for the close tag.
fn find_yaml_close(buf: &str, tag: &str) -> Option<(usize, usize)> {
    let close = format!("</{tag}>");
    let mut from = 0;
    while let Some(rel) = buf[from..].find(&close) {
        let idx = from + rel;
        if idx == 0 || buf.as_bytes()[idx - 1] == b'\n' {
            return Some((idx, idx + close.len()));
        }
        from = idx + close.len();
    }
    None
}

#[derive(Clone)]
pub struct YamlXmlConfig {
    pub template: ToolCatalogTemplate,
    pub id_gen: Arc<dyn IdGenerator>,
}

impl YamlXmlConfig {
    pub fn new() -> Self {
        Self {
            template: Arc::new(default_yaml_xml_template),
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

impl Default for YamlXmlConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_yaml_xml_template(tools: &[ToolDefinition]) -> String {
    let mut out = String::from(
        "You have access to the following tools. To call one, respond with a \
         single top-level tag named for the tool, containing its arguments \
         as a YAML mapping, and nothing else:\n",
    );
    for tool in tools {
        out.push_str(&format!("\n<{}>\n", tool.name));
        if let Some(properties) = tool
            .input_schema
            .get("properties")
            .and_then(Value::as_object)
        {
            for (field, field_schema) in properties {
                let ty = field_schema
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("string");
                out.push_str(&format!("{field}: <{ty}>\n"));
            }
        }
        out.push_str(&format!("</{}>", tool.name));
        if let Some(description) = &tool.description {
            out.push_str(&format!("  -- {description}"));
        }
        out.push('\n');
    }
    out
}

fn parse_yaml_payload(inner: &str) -> Result<Value> {
    let trimmed = inner.trim();
    if trimmed.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_yaml::from_str(trimmed).map_err(Error::from)
}

pub struct YamlXmlProtocol {
    config: YamlXmlConfig,
}

impl YamlXmlProtocol {
    pub fn new() -> Self {
        Self::with_config(YamlXmlConfig::new())
    }

    pub fn with_config(config: YamlXmlConfig) -> Self {
        debug!("constructing YAML-in-XML protocol");
        Self { config }
    }
}

impl Default for YamlXmlProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallProtocol for YamlXmlProtocol {
    fn name(&self) -> &'static str {
        "yaml-xml"
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> String {
        (self.config.template)(tools)
    }

    fn format_tool_call(&self, call: &ToolCall) -> String {
        let arguments: Value = serde_json::from_str(&call.input).unwrap_or_default();
        let yaml = serde_yaml::to_string(&arguments).unwrap_or_default();
        format!("<{}>\n{}</{}>", call.tool_name, yaml, call.tool_name)
    }

    fn format_tool_response(&self, result: &ToolResult) -> String {
        let yaml = serde_yaml::to_string(&result.output).unwrap_or_default();
        format!("<tool_response name=\"{}\">\n{}</tool_response>", result.tool_name, yaml)
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
            let Some((idx, tool, self_closing)) = find_earliest_tool_tag(rest, tools) else {
                text_buf.push_str(rest);
                break;
            };
            text_buf.push_str(&rest[..idx]);

            let inner_and_consumed = if self_closing {
                let tag_len = format!("<{}/>", tool.name).len();
                Some((String::new(), idx + tag_len))
            } else {
                let open_tag = format!("<{}>", tool.name);
                let inner_start = idx + open_tag.len();
                find_yaml_close(&rest[inner_start..], &tool.name).map(|(rel_end, rel_after)| {
                    let inner_end = inner_start + rel_end;
                    let consumed = inner_start + rel_after;
                    (rest[inner_start..inner_end].to_string(), consumed)
                })
            };

            match inner_and_consumed {
                Some((inner, consumed)) => {
                    match parse_yaml_payload(&inner) {
                        Ok(value) => {
                            let coerced = crate::coercion::coerce_json_value(&value, &tool.input_schema);
                            if !text_buf.is_empty() {
                                parts.push(ContentPart::text(std::mem::take(&mut text_buf)));
                            }
                            let input = serde_json::to_string(&coerced).unwrap_or_default();
                            parts.push(ContentPart::ToolCall(ToolCall::new(
                                self.config.id_gen.next_id(),
                                tool.name.clone(),
                                input,
                            )));
                        }
                        Err(err) => {
                            on_error(&format!("failed to parse YAML tool-call body: {err}"));
                            if options.error_text_policy == ErrorTextPolicy::EmitRawText {
                                text_buf.push_str(&rest[idx..consumed]);
                            }
                        }
                    }
                    rest = &rest[consumed..];
                }
                None => {
                    on_error("unterminated tool tag at end of text");
                    text_buf.push_str(&rest[idx..]);
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
        Box::new(YamlXmlStreamParser {
            config: self.config.clone(),
            tools,
            options,
            state: StreamParserState::new(),
            payload_buf: String::new(),
            current_tool_index: None,
        })
    }
}

struct YamlXmlStreamParser {
    config: YamlXmlConfig,
    tools: Vec<ToolDefinition>,
    options: ParseOptions,
    state: StreamParserState,
    payload_buf: String,
    current_tool_index: Option<usize>,
}

impl YamlXmlStreamParser {
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

    fn emit_complete_tool_call(
        &mut self,
        tool_i: usize,
        inner: &str,
        id: String,
        start_already_emitted: bool,
        on_error: &mut dyn FnMut(&str),
        out: &mut Vec<StreamPart>,
    ) {
        let tool_name = self.tools[tool_i].name.clone();
        let schema = self.tools[tool_i].input_schema.clone();

        if !start_already_emitted {
            out.push(StreamPart::ToolInputStart {
                id: id.clone(),
                tool_name: tool_name.clone(),
            });
        }

        match parse_yaml_payload(inner) {
            Ok(value) => {
                let coerced = crate::coercion::coerce_json_value(&value, &schema);
                let input = serde_json::to_string(&coerced).unwrap_or_else(|_| "{}".to_string());
                out.push(StreamPart::ToolInputDelta {
                    id: id.clone(),
                    delta: input.clone(),
                });
                out.push(StreamPart::ToolInputEnd { id: id.clone() });
                out.push(StreamPart::ToolCall(ToolCall::new(id, tool_name, input)));
            }
            Err(err) => {
                on_error(&format!("failed to parse YAML tool-call body: {err}"));
                out.push(StreamPart::ToolInputEnd { id });
                if self.options.error_text_policy == ErrorTextPolicy::EmitRawText {
                    let raw = format!("<{tool_name}>{inner}</{tool_name}>");
                    self.emit_text_delta(&raw, out);
                }
            }
        }
    }
}

impl StreamParser for YamlXmlStreamParser {
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
                StreamMode::Outside => match scan_buffer(&self.state.buffer, &self.tools) {
                    BufferScan::Complete(idx, tool_i, self_closing) => {
                        let before = self.state.buffer[..idx].to_string();
                        self.emit_text_delta(&before, &mut out);
                        self.close_text_block(&mut out);

                        let tool_name = self.tools[tool_i].name.clone();
                        if self_closing {
                            let tag_len = format!("<{tool_name}/>").len();
                            let rest = self.state.buffer[idx + tag_len..].to_string();
                            self.state.buffer.clear();
                            let id = self.config.id_gen.next_id();
                            self.emit_complete_tool_call(
                                tool_i, "", id, false, on_error, &mut out,
                            );
                            self.state.buffer = rest;
                        } else {
                            let tag_len = format!("<{tool_name}>").len();
                            let rest = self.state.buffer[idx + tag_len..].to_string();
                            self.state.buffer.clear();
                            self.state.mode = StreamMode::InsideTool;
                            self.current_tool_index = Some(tool_i);
                            let id = self.config.id_gen.next_id();
                            self.state.current_tool_call_id = Some(id.clone());
                            out.push(StreamPart::ToolInputStart { id, tool_name });
                            self.payload_buf = rest;
                        }
                    }
                    BufferScan::Partial(idx) => {
                        let safe = self.state.buffer[..idx].to_string();
                        self.emit_text_delta(&safe, &mut out);
                        self.state.buffer.drain(..idx);
                        break;
                    }
                    BufferScan::None => {
                        let text = std::mem::take(&mut self.state.buffer);
                        self.emit_text_delta(&text, &mut out);
                        break;
                    }
                },
                StreamMode::InsideTool => {
                    let tool_i = self.current_tool_index.expect("set entering InsideTool");
                    let tool_name = self.tools[tool_i].name.clone();
                    match find_yaml_close(&self.payload_buf, &tool_name) {
                        Some((inner_end, after_start)) => {
                            let inner = self.payload_buf[..inner_end].to_string();
                            let after = self.payload_buf[after_start..].to_string();
                            self.payload_buf.clear();
                            self.state.mode = StreamMode::Outside;
                            let id = self
                                .state
                                .current_tool_call_id
                                .take()
                                .expect("set entering InsideTool");
                            self.current_tool_index = None;
                            self.emit_complete_tool_call(
                                tool_i, &inner, id, true, on_error, &mut out,
                            );
                            self.state.buffer = after;
                        }
                        None => break,
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
                on_error("stream ended inside an unterminated tool tag");
                let tool_i = self.current_tool_index.take().expect("set entering InsideTool");
                let tool_name = self.tools[tool_i].name.clone();
                if let Some(id) = self.state.current_tool_call_id.take() {
                    out.push(StreamPart::ToolInputEnd { id });
                }
                if self.options.error_text_policy == ErrorTextPolicy::EmitRawText {
                    let raw = format!("<{tool_name}>{}", self.payload_buf);
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

    fn protocol_with_test_ids() -> YamlXmlProtocol {
        YamlXmlProtocol::with_config(YamlXmlConfig::new().with_id_generator(test_id_gen()))
    }

    #[test]
    fn test_parse_generated_text_simple_call() {
        let protocol = protocol_with_test_ids();
        let tools = vec![weather_tool()];
        let mut errors = Vec::new();
        let parts = protocol.parse_generated_text(
            "Checking.<get_weather>\ncity: Seoul\n</get_weather>",
            &tools,
            &ParseOptions::default(),
            &mut |e| errors.push(e.to_string()),
        );
        assert!(errors.is_empty());
        assert_eq!(parts.len(), 2);
        match &parts[1] {
            ContentPart::ToolCall(call) => {
                assert_eq!(call.tool_name, "get_weather");
                assert_eq!(call.input_value().unwrap()["city"], "Seoul");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_generated_text_multiline_block_scalar() {
        let tool = ToolDefinition::new(
            "write_note",
            json!({"type": "object", "properties": {"body": {"type": "string"}}}),
        );
        let protocol = protocol_with_test_ids();
        let parts = protocol.parse_generated_text(
            "<write_note>\nbody: |\n  line one\n  line two\n</write_note>",
            &[tool],
            &ParseOptions::default(),
            &mut |_| {},
        );
        assert_eq!(parts.len(), 1);
        match &parts[0] {
            ContentPart::ToolCall(call) => {
                assert_eq!(call.input_value().unwrap()["body"], "line one\nline two\n");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_generated_text_ignores_close_tag_lookalike_in_block_scalar() {
        let tool = ToolDefinition::new(
            "write_note",
            json!({"type": "object", "properties": {"body": {"type": "string"}}}),
        );
        let protocol = protocol_with_test_ids();
        let parts = protocol.parse_generated_text(
            "<write_note>\nbody: |\n  see </write_note> in the docs\n</write_note>",
            &[tool],
            &ParseOptions::default(),
            &mut |_| {},
        );
        assert_eq!(parts.len(), 1);
        match &parts[0] {
            ContentPart::ToolCall(call) => {
                assert_eq!(
                    call.input_value().unwrap()["body"],
                    "see </write_note> in the docs\n"
                );
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn test_stream_ignores_close_tag_lookalike_in_block_scalar() {
        let tool = ToolDefinition::new(
            "write_note",
            json!({"type": "object", "properties": {"body": {"type": "string"}}}),
        );
        let protocol = protocol_with_test_ids();
        let mut parser = protocol.create_stream_parser(vec![tool], ParseOptions::default());
        let parts = feed_char_by_char(
            parser.as_mut(),
            "<write_note>\nbody: |\n  see </write_note> in the docs\n</write_note>",
        );
        let call = parts
            .iter()
            .find_map(|p| match p {
                StreamPart::ToolCall(call) => Some(call),
                _ => None,
            })
            .expect("expected a tool call");
        assert_eq!(
            call.input_value().unwrap()["body"],
            "see </write_note> in the docs\n"
        );
    }

    #[test]
    fn test_format_tool_call_roundtrips() {
        let protocol = protocol_with_test_ids();
        let tools = vec![weather_tool()];
        let call = ToolCall::new("call-0", "get_weather", r#"{"city":"Seoul"}"#);
        let rendered = protocol.format_tool_call(&call);
        let parts =
            protocol.parse_generated_text(&rendered, &tools, &ParseOptions::default(), &mut |_| {});
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn test_stream_single_char_chunks_simple_call() {
        let protocol = protocol_with_test_ids();
        let tools = vec![weather_tool()];
        let mut parser = protocol.create_stream_parser(tools, ParseOptions::default());
        let parts = feed_char_by_char(
            parser.as_mut(),
            "ok <get_weather>\ncity: Seoul\n</get_weather> done",
        );
        assert!(parts
            .iter()
            .any(|p| matches!(p, StreamPart::ToolCall(call) if call.tool_name == "get_weather")));
    }
}
