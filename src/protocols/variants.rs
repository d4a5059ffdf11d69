//! Prompt-template variants: Hermes, Gemma, Qwen, and a grammar-"guided"
//! flavor. Each differs from plain [`super::json_tag`] only in the
//! system-prompt wording and (for Gemma) the wrapping delimiter — none
//! of them need their own stream parser. Grounded in `wesamahakem-goose`'s
//! `providers::formats` modules, which give each provider its own
//! `format_tools`/`format_messages` pair over one shared request/response
//! shape (`ollama.rs`'s Qwen3-coder XML fallback, `google.rs`'s Gemini
//! formatting) rather than a parallel parser per model family.

use std::sync::Arc;

use crate::types::{ContentPart, ParseOptions, ToolCall, ToolDefinition, ToolResult};

use super::json_tag::{JsonTagConfig, JsonTagProtocol};
use super::{StreamParser, ToolCallProtocol};

fn tool_list_lines(tools: &[ToolDefinition]) -> String {
    let mut out = String::new();
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

/// A thin named wrapper around [`JsonTagProtocol`]: every method but
/// [`ToolCallProtocol::name`] delegates straight through, so the
/// middleware sees a distinct protocol identity without a second parser
/// implementation to keep in sync.
macro_rules! json_tag_variant {
    ($proto:ident, $name:literal) => {
        pub struct $proto(JsonTagProtocol);

        impl $proto {
            pub fn new() -> Self {
                Self(JsonTagProtocol::with_config(Self::config()))
            }

            pub fn with_config(config: JsonTagConfig) -> Self {
                Self(JsonTagProtocol::with_config(config))
            }
        }

        impl Default for $proto {
            fn default() -> Self {
                Self::new()
            }
        }

        impl ToolCallProtocol for $proto {
            fn name(&self) -> &'static str {
                $name
            }

            fn format_tools(&self, tools: &[ToolDefinition]) -> String {
                self.0.format_tools(tools)
            }

            fn format_tool_call(&self, call: &ToolCall) -> String {
                self.0.format_tool_call(call)
            }

            fn format_tool_response(&self, result: &ToolResult) -> String {
                self.0.format_tool_response(result)
            }

            fn parse_generated_text(
                &self,
                text: &str,
                tools: &[ToolDefinition],
                options: &ParseOptions,
                on_error: &mut dyn FnMut(&str),
            ) -> Vec<ContentPart> {
                self.0.parse_generated_text(text, tools, options, on_error)
            }

            fn create_stream_parser(
                &self,
                tools: Vec<ToolDefinition>,
                options: ParseOptions,
            ) -> Box<dyn StreamParser> {
                self.0.create_stream_parser(tools, options)
            }
        }
    };
}

json_tag_variant!(HermesProtocol, "hermes");
json_tag_variant!(GemmaProtocol, "gemma");
json_tag_variant!(QwenProtocol, "qwen");
json_tag_variant!(GuidedProtocol, "guided");

impl HermesProtocol {
    /// The Nous/Hermes function-calling convention: a single `<tool_call>`
    /// tag per call, one JSON object inside.
    pub fn config() -> JsonTagConfig {
        JsonTagConfig::new().with_template(Arc::new(|tools: &[ToolDefinition]| {
            format!(
                "You are a function-calling AI model. For each function call, \
                 return a json object with function name and arguments within \
                 <tool_call></tool_call> XML tags as follows:\n\
                 <tool_call>\n\
                 {{\"name\": <function-name>, \"arguments\": <args-dict>}}\n\
                 </tool_call>\n\n\
                 Here are the available tools:\n{}",
                tool_list_lines(tools)
            )
        }))
    }
}

impl GemmaProtocol {
    /// Gemma's convention wraps the call in a fenced code block rather
    /// than a bare XML tag; `open_tag`/`close_tag` are still plain
    /// literal strings, so the fence markers plug straight into the
    /// same delimiter-scanning machinery as `<tool_call>`.
    pub fn config() -> JsonTagConfig {
        JsonTagConfig::new()
            .with_tags("```tool_call\n", "\n```")
            .with_template(Arc::new(|tools: &[ToolDefinition]| {
                format!(
                    "You can call the following tools. To do so, write a single \
                     fenced block of this exact form:\n\n\
                     ```tool_call\n\
                     {{\"name\": \"<tool name>\", \"arguments\": <arguments object>}}\n\
                     ```\n\n\
                     Tools:\n{}",
                    tool_list_lines(tools)
                )
            }))
    }
}

impl QwenProtocol {
    /// Qwen models sometimes fall back to a `<function=...>` XML form
    /// under Ollama (see the teacher's `providers::formats::ollama`
    /// fallback), but when driven through this crate's JSON-in-tag
    /// contract they follow the same `<tool_call>` convention as Hermes,
    /// with wording tuned to Qwen's single-call-per-turn training.
    pub fn config() -> JsonTagConfig {
        JsonTagConfig::new().with_template(Arc::new(|tools: &[ToolDefinition]| {
            format!(
                "# Tools\n\nYou may call one tool per turn. When you do, output \
                 only:\n\n<tool_call>\n{{\"name\": \"<tool name>\", \"arguments\": \
                 <arguments object>}}\n</tool_call>\n\n## Available tools:\n{}",
                tool_list_lines(tools)
            )
        }))
    }
}

impl GuidedProtocol {
    /// The "guided" variant assumes an upstream grammar constraint (a
    /// structured-output / JSON-schema response format, attached by the
    /// middleware per SPEC_FULL.md §4.5 point 5) already forces the
    /// model's raw output into the JSON-in-tag shape before this parser
    /// ever sees it. Parsing is therefore identical to plain
    /// [`JsonTagProtocol`]; only the prompt text changes, to tell the
    /// model it does not need to worry about formatting by hand.
    pub fn config() -> JsonTagConfig {
        JsonTagConfig::new().with_template(Arc::new(|tools: &[ToolDefinition]| {
            format!(
                "Your output is constrained to match a fixed schema when you \
                 call a tool, so you do not need to format the call yourself \
                 beyond choosing the tool name and arguments.\n\nAvailable \
                 tools:\n{}",
                tool_list_lines(tools)
            )
        }))
    }
}
