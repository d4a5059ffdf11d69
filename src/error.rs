//! Error types for tool-call protocol parsing, schema coercion, and middleware.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
///
/// Most malformed-input conditions described by the individual protocols
/// (an unparsable JSON payload, an unknown tool name, a duplicate XML tag)
/// are *not* represented here: the parser degrades to plain text and
/// reports the condition through the caller-supplied error callback
/// instead of returning `Err`. This enum is reserved for conditions that
/// abort a request outright: a fatal `toolChoice` validation failure, a
/// transport failure, or a bug in the crate's own invariants.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error (reference transport adapter only).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Strict JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error (YAML-in-XML protocol).
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Relaxed JSON parser rejected the input even in tolerant mode.
    #[error("relaxed JSON error: {0}")]
    JsonRelaxed(String),

    /// Tolerant XML tokenizer hit a structural error it could not recover
    /// from (unbalanced root, unterminated tag) even after repair.
    #[error("XML parse error at line {line}, column {column}: {message}")]
    XmlParse {
        message: String,
        line: usize,
        column: usize,
    },

    /// Schema-directed coercion could not reconcile a value with its
    /// declared type in a way that is safe to silently pass through.
    #[error("schema coercion error: {0}")]
    SchemaCoercion(String),

    /// A string-typed schema field appeared more than once at the top
    /// level of a tool-call body, and the active duplicate policy is
    /// `fatal` rather than `keep-first`.
    #[error("duplicate string-typed tag `{0}`")]
    DuplicateStringTag(String),

    /// `toolChoice` failed pre-call validation (§4.5): `none` was
    /// requested, an unknown or provider-defined tool was named, or
    /// `required` was requested with an empty tool set.
    #[error("invalid tool choice: {0}")]
    ToolChoice(String),

    /// A named protocol was requested that the middleware does not know.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// Upstream model endpoint reported an error.
    #[error("upstream model error: {0}")]
    Upstream(String),

    /// Streaming error unrelated to parsing (e.g. a closed channel).
    #[error("stream error: {0}")]
    Stream(String),

    /// Invalid configuration supplied by the caller.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Catch-all for conditions that don't fit another variant.
    #[error("error: {0}")]
    Other(String),
}

impl Error {
    pub fn json_relaxed(msg: impl Into<String>) -> Self {
        Error::JsonRelaxed(msg.into())
    }

    pub fn xml_parse(msg: impl Into<String>, line: usize, column: usize) -> Self {
        Error::XmlParse {
            message: msg.into(),
            line,
            column,
        }
    }

    pub fn schema_coercion(msg: impl Into<String>) -> Self {
        Error::SchemaCoercion(msg.into())
    }

    pub fn duplicate_string_tag(tag: impl Into<String>) -> Self {
        Error::DuplicateStringTag(tag.into())
    }

    pub fn tool_choice(msg: impl Into<String>) -> Self {
        Error::ToolChoice(msg.into())
    }

    pub fn unknown_protocol(name: impl Into<String>) -> Self {
        Error::UnknownProtocol(name.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::Upstream(msg.into())
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_json_relaxed() {
        let err = Error::json_relaxed("unexpected token at byte 4");
        assert!(matches!(err, Error::JsonRelaxed(_)));
        assert_eq!(
            err.to_string(),
            "relaxed JSON error: unexpected token at byte 4"
        );
    }

    #[test]
    fn test_error_xml_parse() {
        let err = Error::xml_parse("unclosed tag", 3, 12);
        assert_eq!(
            err.to_string(),
            "XML parse error at line 3, column 12: unclosed tag"
        );
    }

    #[test]
    fn test_error_schema_coercion() {
        let err = Error::schema_coercion("expected array, got object");
        assert!(matches!(err, Error::SchemaCoercion(_)));
    }

    #[test]
    fn test_error_duplicate_string_tag() {
        let err = Error::duplicate_string_tag("description");
        assert_eq!(err.to_string(), "duplicate string-typed tag `description`");
    }

    #[test]
    fn test_error_tool_choice() {
        let err = Error::tool_choice("toolChoice `none` is not a valid request to the model");
        assert!(matches!(err, Error::ToolChoice(_)));
    }

    #[test]
    fn test_error_unknown_protocol() {
        let err = Error::unknown_protocol("hermes-v4");
        assert_eq!(err.to_string(), "unknown protocol: hermes-v4");
    }

    #[test]
    fn test_error_upstream_and_stream() {
        assert!(matches!(Error::upstream("503"), Error::Upstream(_)));
        assert!(matches!(Error::stream("channel closed"), Error::Stream(_)));
    }

    #[test]
    fn test_error_config_and_other() {
        assert!(matches!(Error::config("bad repair budget"), Error::Config(_)));
        assert!(matches!(Error::other("unexpected"), Error::Other(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_error_from_serde_yaml() {
        let yaml_err = serde_yaml::from_str::<serde_yaml::Value>("a: [b").unwrap_err();
        let err: Error = yaml_err.into();
        assert!(matches!(err, Error::Yaml(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn _returns_result() -> Result<i32> {
            Ok(42)
        }

        fn _returns_error() -> Result<i32> {
            Err(Error::other("x"))
        }
    }
}
