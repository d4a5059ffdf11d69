//! XML-as-tool (a.k.a. "morph-XML"): the tool name *is* the tag, and its
//! arguments are one child tag per schema field —
//! `<get_weather><city>Seoul</city></get_weather>`.
//!
//! Unlike [`super::json_tag`], the tool name is known the instant the
//! opening tag completes, so the streaming parser here emits
//! `tool-input-start` right away instead of deferring it to the close
//! tag. The payload itself is still buffered until the matching close
//! tag arrives, because schema-directed coercion (duplicate-tag
//! detection, raw-inner string preservation) needs the whole fragment.

use std::sync::Arc;

use serde_json::Value;

use crate::coercion::coerce_xml_fields;
use crate::types::{
    ContentPart, ErrorTextPolicy, ParseOptions, StreamMode, StreamParserState, StreamPart,
    ToolCall, ToolDefinition, ToolResult,
};
use crate::utils::{default_id_generator, IdGenerator};
use tracing::debug;

use super::tagscan::{find_earliest_tool_tag, find_matching_close, scan_buffer, BufferScan};
use super::{StreamParser, ToolCallProtocol, ToolCatalogTemplate};

#[derive(Clone)]
pub struct XmlToolConfig {
    pub template: ToolCatalogTemplate,
    pub id_gen: Arc<dyn IdGenerator>,
}

impl XmlToolConfig {
    pub fn new() -> Self {
        Self {
            template: Arc::new(default_xml_tool_template),
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

impl Default for XmlToolConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_xml_tool_template(tools: &[ToolDefinition]) -> String {
    let mut out = String::from(
        "You have access to the following tools. To call one, respond with a \
         single top-level tag named for the tool, one child tag per \
         argument, and nothing else:\n",
    );
    for tool in tools {
        out.push_str(&format!("\n<{}>", tool.name));
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
                out.push_str(&format!("\n  <{field}>{{{ty}}}</{field}>"));
            }
        }
        out.push_str(&format!("\n</{}>", tool.name));
        if let Some(description) = &tool.description {
            out.push_str(&format!("  -- {description}"));
        }
        out.push('\n');
    }
    out
}

fn escape_xml_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Renders one JSON value back into `<name>...</name>` form. Arrays
/// render as repeated sibling tags (matching the occurrences-based
/// array coercion in [`coerce_xml_fields`]); objects recurse.
fn render_field(name: &str, value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            for item in items {
                render_field(name, item, out);
            }
        }
        Value::Object(map) => {
            out.push_str(&format!("<{name}>"));
            for (k, v) in map {
                render_field(k, v, out);
            }
            out.push_str(&format!("</{name}>"));
        }
        Value::Null => out.push_str(&format!("<{name}/>")),
        Value::String(s) => out.push_str(&format!("<{name}>{}</{name}>", escape_xml_text(s))),
        other => out.push_str(&format!("<{name}>{other}</{name}>")),
    }
}

pub struct XmlToolProtocol {
    config: XmlToolConfig,
}

impl XmlToolProtocol {
    pub fn new() -> Self {
        Self::with_config(XmlToolConfig::new())
    }

    pub fn with_config(config: XmlToolConfig) -> Self {
        debug!("constructing XML-as-tool protocol");
        Self { config }
    }
}

impl Default for XmlToolProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallProtocol for XmlToolProtocol {
    fn name(&self) -> &'static str {
        "xml-tool"
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> String {
        (self.config.template)(tools)
    }

    fn format_tool_call(&self, call: &ToolCall) -> String {
        let arguments: Value = serde_json::from_str(&call.input).unwrap_or_default();
        let mut inner = String::new();
        if let Value::Object(map) = &arguments {
            for (k, v) in map {
                render_field(k, v, &mut inner);
            }
        }
        format!("<{}>{}</{}>", call.tool_name, inner, call.tool_name)
    }

    fn format_tool_response(&self, result: &ToolResult) -> String {
        format!(
            "<tool_response name=\"{}\">{}</tool_response>",
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
            let Some((idx, tool, self_closing)) = find_earliest_tool_tag(rest, tools) else {
                text_buf.push_str(rest);
                break;
            };
            text_buf.push_str(&rest[..idx]);

            let inner_and_consumed = if self_closing {
                let tag_len = format!("<{}/>", tool.name).len();
                Some((String::new(), idx + tag_len))
            } else {
                crate::coercion::extract_raw_inner(&rest[idx..], &tool.name).map(|inner| {
                    let consumed = format!("<{}>", tool.name).len()
                        + inner.len()
                        + format!("</{}>", tool.name).len();
                    (inner, idx + consumed)
                })
            };

            match inner_and_consumed {
                Some((inner, consumed)) => {
                    match coerce_xml_fields(&inner, &tool.input_schema, options) {
                        Ok((value, warnings)) => {
                            for w in &warnings {
                                on_error(w);
                            }
                            if !text_buf.is_empty() {
                                parts.push(ContentPart::text(std::mem::take(&mut text_buf)));
                            }
                            let input = serde_json::to_string(&value).unwrap_or_default();
                            parts.push(ContentPart::ToolCall(ToolCall::new(
                                self.config.id_gen.next_id(),
                                tool.name.clone(),
                                input,
                            )));
                        }
                        Err(err) => {
                            on_error(&err.to_string());
                            if options.error_text_policy == ErrorTextPolicy::EmitRawText {
                                text_buf.push_str(&rest[idx..consumed]);
                            }
                        }
                    }
                    rest = &rest[consumed..];
                }
                None => {
                    // Looked like an opening tag but never closed; not
                    // reachable in practice since `find_earliest_tool_tag`
                    // only matches literal `<name>`/`<name/>`, but guard
                    // against infinite loops regardless.
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
        Box::new(XmlToolStreamParser {
            config: self.config.clone(),
            tools,
            options,
            state: StreamParserState::new(),
            payload_buf: String::new(),
            current_tool_index: None,
        })
    }
}

struct XmlToolStreamParser {
    config: XmlToolConfig,
    tools: Vec<ToolDefinition>,
    options: ParseOptions,
    state: StreamParserState,
    payload_buf: String,
    current_tool_index: Option<usize>,
}

impl XmlToolStreamParser {
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

        match coerce_xml_fields(inner, &schema, &self.options) {
            Ok((value, warnings)) => {
                for w in &warnings {
                    on_error(w);
                }
                let input = serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string());
                out.push(StreamPart::ToolInputDelta {
                    id: id.clone(),
                    delta: input.clone(),
                });
                out.push(StreamPart::ToolInputEnd { id: id.clone() });
                out.push(StreamPart::ToolCall(ToolCall::new(id, tool_name, input)));
            }
            Err(err) => {
                on_error(&err.to_string());
                out.push(StreamPart::ToolInputEnd { id });
                if self.options.error_text_policy == ErrorTextPolicy::EmitRawText {
                    let raw = format!("<{tool_name}>{inner}</{tool_name}>");
                    self.emit_text_delta(&raw, out);
                }
            }
        }
    }
}

impl StreamParser for XmlToolStreamParser {
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
                    match find_matching_close(&self.payload_buf, &tool_name) {
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
