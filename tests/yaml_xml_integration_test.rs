//! End-to-end exercise of the YAML-in-XML protocol: a multiline literal
//! block scalar in a tool argument, the case this protocol exists for
//! (a tag body that itself contains raw text with its own line breaks,
//! something JSON-in-tag can't carry without escaping).

use serde_json::json;
use toolcall_middleware::{ContentPart, ParseOptions, ToolCallProtocol, ToolDefinition, YamlXmlProtocol};

fn write_file_tool() -> ToolDefinition {
    ToolDefinition::new(
        "write_file",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "body": {"type": "string"},
            },
            "required": ["path", "body"],
        }),
    )
}

#[test]
fn multiline_block_scalar_preserves_embedded_newlines() {
    let protocol = YamlXmlProtocol::new();
    let tools = vec![write_file_tool()];

    let text = "Writing the file now.\n<write_file>\npath: notes.txt\nbody: |\n  line one\n  line two\n</write_file>\n";

    let mut errors = Vec::new();
    let parts = protocol.parse_generated_text(text, &tools, &ParseOptions::default(), &mut |e| {
        errors.push(e.to_string())
    });
    assert!(errors.is_empty());

    let call = parts
        .iter()
        .find_map(|p| match p {
            ContentPart::ToolCall(c) => Some(c),
            _ => None,
        })
        .expect("expected a tool call");
    let args = call.input_value().unwrap();
    assert_eq!(args["path"], "notes.txt");
    assert_eq!(args["body"], "line one\nline two\n");
}

#[test]
fn streams_the_multiline_call_one_character_at_a_time() {
    use toolcall_middleware::StreamPart;

    let protocol = YamlXmlProtocol::new();
    let tools = vec![write_file_tool()];
    let mut parser = protocol.create_stream_parser(tools, ParseOptions::default());

    let text = "<write_file>\npath: notes.txt\nbody: |\n  line one\n  line two\n</write_file>";
    let mut parts = Vec::new();
    let mut errs = |_msg: &str| {};
    for ch in text.chars() {
        parts.extend(parser.feed_text(&ch.to_string(), &mut errs));
    }
    parts.extend(parser.finish(&mut errs));

    let call = parts
        .iter()
        .find_map(|p| match p {
            StreamPart::ToolCall(c) => Some(c),
            _ => None,
        })
        .expect("expected a streamed tool call");
    assert_eq!(call.input_value().unwrap()["body"], "line one\nline two\n");
}
