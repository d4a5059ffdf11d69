//! # toolcall-middleware
//!
//! Lets models that were never trained to emit a native function-calling
//! wire format participate in tool-use dialogues, by agreeing on a
//! textual convention instead — `<tool_call>{...}</tool_call>`, or
//! `<tool_name>...YAML body...</tool_name>` — and converting between
//! that text and structured tool-call events.
//!
//! ## The three subsystems
//!
//! - [`protocols`] — pluggable text ↔ tool-call codecs: JSON-in-tag
//!   (and its Hermes/Gemma/Qwen/Guided prompt-template variants),
//!   XML-as-tool, YAML-in-XML, and mixed JSON. Each provides a one-shot
//!   parser, an incremental stream transformer, and formatters that
//!   render a tool call or tool result back to protocol text.
//! - [`middleware`] — wraps a lower-level model endpoint: injects a
//!   tool-describing system prompt, rewrites prior assistant/tool turns
//!   into protocol text, strips the `tools` field before the model sees
//!   it, and on the way back intercepts text/stream and substitutes
//!   tool-call events.
//! - [`rxml`] and [`coercion`] — a tolerant XML tokenizer/DOM with a
//!   repair pass, and a schema-directed value coercer that turns loosely
//!   structured trees into strictly-typed tool arguments matching a
//!   JSON-Schema fragment. [`rjson`] is the JSON-flavored protocols'
//!   equivalent lenient parser (unquoted keys, trailing commas, single
//!   quotes, comments).
//!
//! None of the above talks to a network. [`transport`] is the external
//! collaborator: a [`transport::ModelEndpoint`] trait plus one
//! `reqwest`-backed implementation, kept out of the core's module path
//! so it stays clear this crate's data-transform layer does not impose
//! a transport.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use toolcall_middleware::{JsonTagProtocol, Message, ToolCallMiddleware, ToolChoice, ToolDefinition};
//!
//! let protocol = Arc::new(JsonTagProtocol::new());
//! let middleware = ToolCallMiddleware::new(protocol);
//!
//! let weather = ToolDefinition::new(
//!     "get_weather",
//!     json!({"type": "object", "properties": {"city": {"type": "string"}}}),
//! );
//!
//! let request = middleware
//!     .transform_params(&[Message::user("What's the weather in Seoul?")], &[weather], ToolChoice::Auto)
//!     .unwrap();
//!
//! assert!(request.messages[0].content[0]
//!     .as_text()
//!     .unwrap()
//!     .contains("get_weather"));
//! ```

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Schema-directed coercion: turns a loosely-typed DOM or JSON value into
/// a value matching a tool's input schema.
pub mod coercion;

/// Connection settings for the reference transport adapter: well-known
/// local-server base URLs and environment-variable overrides.
mod config;

/// Crate-wide error type and `Result` alias.
pub mod error;

/// Adapts a generic chat endpoint to behave as if it natively supported
/// tool calls.
pub mod middleware;

/// Pluggable text ↔ tool-call codecs: JSON-in-tag, XML-as-tool,
/// YAML-in-XML, mixed JSON, and prompt-template variants.
pub mod protocols;

/// Lenient JSON parser for JSON-flavored protocols: unquoted keys,
/// trailing commas, single quotes, comments.
pub mod rjson;

/// Tolerant XML tokenizer, DOM, and repair pass.
pub mod rxml;

/// Core data model: tool definitions/calls/results, content and stream
/// parts, and per-request options.
pub mod types;

/// Reference transport adapter: a `ModelEndpoint` trait plus one
/// `reqwest`-backed implementation. External collaborator, not part of
/// the data-transform core.
pub mod transport;

/// Shared parsing utilities: the partial-tag boundary helper and an
/// injectable id generator.
pub mod utils;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

pub use config::{get_base_url, get_model, Provider};
pub use error::{Error, Result};

pub use types::{
    ContentPart, DuplicateTagPolicy, ErrorTextPolicy, FinishReason, Message, ParseOptions,
    ParseOptionsBuilder, Role, StreamMode, StreamParserState, StreamPart, ToolCall, ToolChoice,
    ToolDefinition, ToolResult, Usage,
};

pub use protocols::{
    JsonTagConfig, JsonTagProtocol, MixedJsonProtocol, StreamParser, ToolCallProtocol,
    XmlToolProtocol, YamlXmlProtocol,
};

pub use middleware::{
    GenerateResult, RawEventStream, RawStreamEvent, StreamPartStream, ToolCallMiddleware,
    ToolCallSidecar, TransformedRequest,
};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// Convenience module bundling the most commonly used types and traits.
/// Import with `use toolcall_middleware::prelude::*;`.
pub mod prelude {
    pub use crate::{
        ContentPart, Error, FinishReason, GenerateResult, JsonTagProtocol, Message, ParseOptions,
        RawStreamEvent, Result, Role, StreamPart, ToolCall, ToolCallMiddleware, ToolCallProtocol,
        ToolChoice, ToolDefinition, ToolResult,
    };
}
