use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use toolcall_middleware::protocols::json_tag::JsonTagProtocol;
use toolcall_middleware::protocols::xml_tool::XmlToolProtocol;
use toolcall_middleware::{ParseOptions, StreamParser, ToolCallProtocol, ToolDefinition};

fn weather_tool() -> ToolDefinition {
    ToolDefinition::new(
        "get_weather",
        json!({"type": "object", "properties": {"city": {"type": "string"}, "units": {"type": "string"}}}),
    )
}

fn json_tag_call_text(repeat: usize) -> String {
    let mut text = String::new();
    for _ in 0..repeat {
        text.push_str("I'll check that for you.\n");
        text.push_str(
            r#"<tool_call>{"name": "get_weather", "arguments": {"city": "Seoul", "units": "metric"}}</tool_call>"#,
        );
        text.push('\n');
    }
    text
}

fn xml_tool_call_text(repeat: usize) -> String {
    let mut text = String::new();
    for _ in 0..repeat {
        text.push_str("I'll check that for you.\n");
        text.push_str("<get_weather><city>Seoul</city><units>metric</units></get_weather>\n");
    }
    text
}

/// Feeds `text` through `parser` in fixed-size chunks rather than one
/// character at a time, to measure realistic upstream delivery sizes
/// (a real SSE stream rarely delivers single-byte chunks).
fn feed_in_chunks(parser: &mut dyn StreamParser, text: &str, chunk_size: usize) {
    let bytes = text.as_bytes();
    let mut errs = |_msg: &str| {};
    for chunk in bytes.chunks(chunk_size) {
        let s = std::str::from_utf8(chunk).unwrap_or("");
        parser.feed_text(s, &mut errs);
    }
    parser.finish(&mut errs);
}

// Benchmark: JSON-in-tag streaming parser throughput by chunk size
fn bench_json_tag_stream_by_chunk_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("json_tag_stream_by_chunk_size");
    let text = json_tag_call_text(5);
    let protocol = JsonTagProtocol::new();

    for chunk_size in [1, 4, 16, 64, 256].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_size),
            chunk_size,
            |b, &size| {
                b.iter(|| {
                    let mut parser =
                        protocol.create_stream_parser(vec![weather_tool()], ParseOptions::default());
                    feed_in_chunks(parser.as_mut(), black_box(&text), size);
                });
            },
        );
    }

    group.finish();
}

// Benchmark: JSON-in-tag streaming parser throughput by call count
fn bench_json_tag_stream_by_call_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("json_tag_stream_by_call_count");
    let protocol = JsonTagProtocol::new();

    for count in [1, 5, 20, 50].iter() {
        let text = json_tag_call_text(*count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &text, |b, text| {
            b.iter(|| {
                let mut parser =
                    protocol.create_stream_parser(vec![weather_tool()], ParseOptions::default());
                feed_in_chunks(parser.as_mut(), black_box(text), 32);
            });
        });
    }

    group.finish();
}

// Benchmark: XML-as-tool streaming parser throughput by chunk size
fn bench_xml_tool_stream_by_chunk_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("xml_tool_stream_by_chunk_size");
    let text = xml_tool_call_text(5);
    let protocol = XmlToolProtocol::new();

    for chunk_size in [1, 4, 16, 64, 256].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_size),
            chunk_size,
            |b, &size| {
                b.iter(|| {
                    let mut parser =
                        protocol.create_stream_parser(vec![weather_tool()], ParseOptions::default());
                    feed_in_chunks(parser.as_mut(), black_box(&text), size);
                });
            },
        );
    }

    group.finish();
}

// Benchmark: one-shot parse_generated_text vs. incremental streaming
// over the same text, to quantify the streaming state machine's overhead.
fn bench_one_shot_vs_streaming(c: &mut Criterion) {
    let mut group = c.benchmark_group("one_shot_vs_streaming");
    let text = json_tag_call_text(10);
    let protocol = JsonTagProtocol::new();

    group.bench_function("one_shot", |b| {
        b.iter(|| {
            protocol.parse_generated_text(
                black_box(&text),
                &[weather_tool()],
                &ParseOptions::default(),
                &mut |_| {},
            )
        });
    });

    group.bench_function("streaming_chunk_32", |b| {
        b.iter(|| {
            let mut parser =
                protocol.create_stream_parser(vec![weather_tool()], ParseOptions::default());
            feed_in_chunks(parser.as_mut(), black_box(&text), 32);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_json_tag_stream_by_chunk_size,
    bench_json_tag_stream_by_call_count,
    bench_xml_tool_stream_by_chunk_size,
    bench_one_shot_vs_streaming,
);
criterion_main!(benches);
