//! Reference transport adapter — the external collaborator §6 calls the
//! "upstream model": a [`ModelEndpoint`] trait plus one concrete
//! `reqwest`-backed implementation, [`OpenAiCompatibleEndpoint`], good
//! enough to drive this crate's own doctests and integration tests
//! end-to-end without a second crate.
//!
//! This module sits outside [`crate::middleware`]'s data-transform core
//! on purpose: the core depends only on [`ModelEndpoint`] and the
//! [`crate::middleware::RawStreamEvent`]/[`crate::middleware::GenerateResult`]
//! shapes it produces, never on `reqwest` directly. Grounded in the
//! point-of-departure SDK's `client.rs` (request building, SSE streaming)
//! and `config.rs` (provider base-URL resolution), adapted from a
//! stateful multi-turn `Client` to a single-shot request/response
//! boundary, since conversation state is explicitly the middleware's
//! caller's job, not this crate's (§1 Non-goals).

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Provider;
use crate::error::{Error, Result};
use crate::middleware::{GenerateResult, RawEventStream, RawStreamEvent};
use crate::types::{FinishReason, Message, Role, Usage};

/// A fully rewritten, tool-stripped request: exactly what §6 says the
/// core hands the transport ({messages, system, response-format hint, no
/// `tools` field}). `system` is carried separately because
/// [`ToolCallMiddleware::transform_params`](crate::middleware::ToolCallMiddleware::transform_params)
/// already folded the tool catalog into a system [`Message`]; adapters
/// that want a dedicated `system` field (as the OpenAI-compatible wire
/// format does) can lift it back out, which is what
/// [`ModelRequest::from_messages`] does.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub response_format: Option<Value>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ModelRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            system: None,
            messages,
            response_format: None,
            max_tokens: None,
            temperature: None,
        }
    }

    /// Splits a leading system message off `messages` (the shape
    /// [`crate::middleware::ToolCallMiddleware::transform_params`]
    /// produces) into the dedicated `system` field most chat-completion
    /// wire formats expect.
    pub fn from_messages(model: impl Into<String>, mut messages: Vec<Message>) -> Self {
        let system = if matches!(messages.first(), Some(m) if m.role == Role::System) {
            messages.remove(0).content.first().and_then(|p| p.as_text()).map(str::to_string)
        } else {
            None
        };
        Self {
            system,
            ..Self::new(model, messages)
        }
    }

    pub fn with_response_format(mut self, schema: Value) -> Self {
        self.response_format = Some(schema);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// The boundary §6 calls "upstream model (core → transport)". The
/// middleware depends only on this trait; implementations may talk to
/// any provider over any wire format.
#[async_trait]
pub trait ModelEndpoint: Send + Sync {
    async fn generate(&self, request: ModelRequest) -> Result<GenerateResult>;
    async fn stream(&self, request: ModelRequest) -> Result<RawEventStream>;
}

// ---------------------------------------------------------------------
// OpenAI-compatible wire format (LM Studio / Ollama / llama.cpp / vLLM)
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        // Tool-role messages never reach the wire: `transform_params`
        // already rewrote them to `user`-role text before this adapter
        // sees them. Kept exhaustive so a future `Role` variant fails to
        // compile here instead of silently mis-rendering.
        Role::Tool => "user",
    }
}

fn wire_messages(system: &Option<String>, messages: &[Message]) -> Vec<WireMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = system {
        out.push(WireMessage {
            role: "system",
            content: system.clone(),
        });
    }
    for msg in messages {
        let content = msg
            .content
            .iter()
            .filter_map(|part| part.as_text())
            .collect::<Vec<_>>()
            .join("\n");
        out.push(WireMessage {
            role: role_str(msg.role),
            content,
        });
    }
    out
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChunkChoice {
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }
    }
}

/// Maps one decoded `WireChunk` to the `RawStreamEvent`s it carries.
///
/// A server may put `finish_reason` and the trailing `usage` in the same
/// chunk, or (as OpenAI's `stream_options.include_usage` does) split
/// usage into its own final chunk with an empty `choices`. Either way
/// this is a single-shot request with exactly one terminal event, so the
/// two are folded into one [`RawStreamEvent::Finish`] rather than a
/// `FinishStep` plus a separately timed `Finish` that could race it and
/// get the wrong finish reason through first.
fn chunk_events(chunk: WireChunk) -> Vec<RawStreamEvent> {
    let mut parts = Vec::new();
    let finish_reason = chunk.choices.iter().find_map(|c| c.finish_reason.as_deref());

    for choice in &chunk.choices {
        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                parts.push(RawStreamEvent::TextDelta(content.clone()));
            }
        }
        if let Some(reasoning) = &choice.delta.reasoning_content {
            if !reasoning.is_empty() {
                parts.push(RawStreamEvent::ReasoningDelta {
                    id: "reasoning-0".to_string(),
                    delta: reasoning.clone(),
                });
            }
        }
    }

    match (finish_reason, chunk.usage) {
        (None, None) => {}
        (reason, usage) => parts.push(RawStreamEvent::Finish {
            finish_reason: map_finish_reason(reason),
            usage: usage.map(Usage::from),
        }),
    }
    parts
}

fn map_finish_reason(raw: Option<&str>) -> FinishReason {
    match raw {
        Some("stop") | None => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some("tool_calls") => FinishReason::ToolCalls,
        Some(_) => FinishReason::Other,
    }
}

/// Connection settings for [`OpenAiCompatibleEndpoint`]: base URL, model,
/// API key, and HTTP timeout, resolved the way [`crate::config`] resolves
/// them for the point-of-departure SDK's `Client`.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl EndpointConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: String::new(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn for_provider(provider: Provider, model: impl Into<String>) -> Self {
        Self::new(provider.default_url(), model)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A [`ModelEndpoint`] backed by any server implementing the OpenAI
/// chat-completions wire format (LM Studio, Ollama, llama.cpp, vLLM, and
/// the real OpenAI API itself).
pub struct OpenAiCompatibleEndpoint {
    config: EndpointConfig,
    http: reqwest::Client,
}

impl OpenAiCompatibleEndpoint {
    pub fn new(config: EndpointConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(Self { config, http })
    }

    fn build_request(&self, request: &ModelRequest, stream: bool) -> WireRequest {
        WireRequest {
            model: request.model.clone(),
            messages: wire_messages(&request.system, &request.messages),
            stream,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: request.response_format.clone(),
        }
    }

    fn endpoint_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url)
    }
}

#[async_trait]
impl ModelEndpoint for OpenAiCompatibleEndpoint {
    async fn generate(&self, request: ModelRequest) -> Result<GenerateResult> {
        let wire = self.build_request(&request, false);
        let response = self
            .http
            .post(self.endpoint_url())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&wire)
            .send()
            .await
            .map_err(Error::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::upstream(format!("HTTP {status}: {body}")));
        }

        let parsed: WireResponse = response.json().await.map_err(Error::Http)?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::upstream("response had no choices"))?;

        Ok(GenerateResult {
            content: choice.message.content.unwrap_or_default(),
            reasoning: choice.message.reasoning_content,
            finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
            usage: parsed.usage.map(Usage::from),
        })
    }

    async fn stream(&self, request: ModelRequest) -> Result<RawEventStream> {
        let wire = self.build_request(&request, true);
        let response = self
            .http
            .post(self.endpoint_url())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&wire)
            .send()
            .await
            .map_err(Error::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::upstream(format!("HTTP {status}: {body}")));
        }

        let event_stream = response.bytes_stream().eventsource();
        let raw = event_stream.scan(false, |started, event_result| {
            let out: Vec<RawStreamEvent> = match event_result {
                Ok(event) if event.data == "[DONE]" => Vec::new(),
                Ok(event) => {
                    let mut parts = Vec::new();
                    if !*started {
                        parts.push(RawStreamEvent::Start);
                        *started = true;
                    }
                    match serde_json::from_str::<WireChunk>(&event.data) {
                        Ok(chunk) => {
                            parts.extend(chunk_events(chunk));
                            parts
                        }
                        Err(err) => vec![RawStreamEvent::Error {
                            message: format!("malformed stream chunk: {err}"),
                        }],
                    }
                }
                Err(err) => vec![RawStreamEvent::Error {
                    message: format!("upstream stream error: {err}"),
                }],
            };
            futures::future::ready(Some(out))
        });

        let flattened: Pin<Box<dyn Stream<Item = RawStreamEvent> + Send>> =
            Box::pin(raw.flat_map(futures::stream::iter));
        Ok(flattened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentPart;

    #[test]
    fn test_model_request_from_messages_splits_system() {
        let messages = vec![
            Message::system("you are a tool-using assistant"),
            Message::user("hi"),
        ];
        let request = ModelRequest::from_messages("test-model", messages);
        assert_eq!(request.system.as_deref(), Some("you are a tool-using assistant"));
        assert_eq!(request.messages.len(), 1);
    }

    #[test]
    fn test_model_request_from_messages_no_leading_system() {
        let messages = vec![Message::user("hi")];
        let request = ModelRequest::from_messages("test-model", messages);
        assert!(request.system.is_none());
        assert_eq!(request.messages.len(), 1);
    }

    #[test]
    fn test_wire_messages_joins_multi_part_content_with_newline() {
        let messages = vec![Message::new(
            Role::Assistant,
            vec![ContentPart::text("line one"), ContentPart::text("line two")],
        )];
        let wire = wire_messages(&None, &messages);
        assert_eq!(wire[0].content, "line one\nline two");
    }

    #[test]
    fn test_map_finish_reason() {
        assert_eq!(map_finish_reason(Some("stop")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("tool_calls")), FinishReason::ToolCalls);
        assert_eq!(map_finish_reason(Some("length")), FinishReason::Length);
        assert_eq!(map_finish_reason(None), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("weird")), FinishReason::Other);
    }

    #[test]
    fn test_endpoint_config_for_provider() {
        let config = EndpointConfig::for_provider(Provider::Ollama, "llama3:8b");
        assert_eq!(config.base_url, "http://localhost:11434/v1");
        assert_eq!(config.model, "llama3:8b");
    }

    fn chunk(json: &str) -> WireChunk {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_chunk_events_content_delta_only() {
        let events = chunk_events(chunk(r#"{"choices":[{"delta":{"content":"hi"}}]}"#));
        assert!(matches!(&events[..], [RawStreamEvent::TextDelta(d)] if d == "hi"));
    }

    #[test]
    fn test_chunk_events_finish_reason_and_usage_same_chunk_use_real_reason() {
        let events = chunk_events(chunk(
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}],
               "usage":{"prompt_tokens":10,"completion_tokens":5}}"#,
        ));
        assert_eq!(events.len(), 1);
        match &events[0] {
            RawStreamEvent::Finish { finish_reason, usage } => {
                assert_eq!(*finish_reason, FinishReason::ToolCalls);
                assert!(usage.is_some());
            }
            other => panic!("expected Finish, got {other:?}"),
        }
    }

    #[test]
    fn test_chunk_events_finish_reason_only_chunk() {
        let events = chunk_events(chunk(
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        ));
        assert_eq!(events.len(), 1);
        match &events[0] {
            RawStreamEvent::Finish { finish_reason, usage } => {
                assert_eq!(*finish_reason, FinishReason::Stop);
                assert!(usage.is_none());
            }
            other => panic!("expected Finish, got {other:?}"),
        }
    }

    #[test]
    fn test_chunk_events_usage_only_trailing_chunk_defaults_to_stop() {
        let events = chunk_events(chunk(
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5}}"#,
        ));
        assert_eq!(events.len(), 1);
        match &events[0] {
            RawStreamEvent::Finish { finish_reason, usage } => {
                assert_eq!(*finish_reason, FinishReason::Stop);
                assert!(usage.is_some());
            }
            other => panic!("expected Finish, got {other:?}"),
        }
    }

    #[test]
    fn test_chunk_events_empty_chunk_produces_nothing() {
        let events = chunk_events(chunk(r#"{"choices":[]}"#));
        assert!(events.is_empty());
    }
}
