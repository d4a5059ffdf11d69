//! Shared "the tool name is the tag" boundary-scanning logic used by
//! both [`super::xml_tool`] and [`super::yaml_xml`] — they differ only
//! in how the captured inner fragment gets coerced (XML child tags vs.
//! a YAML document), not in how the wrapping tag is found.

use crate::types::ToolDefinition;
use crate::utils::{find_potential_start, StartMatch};

/// A one-shot (non-streaming) scan result: byte index of the match, the
/// matched tool, and whether it was the self-closing form.
pub(crate) fn find_earliest_tool_tag<'a>(
    text: &str,
    tools: &'a [ToolDefinition],
) -> Option<(usize, &'a ToolDefinition, bool)> {
    let mut best: Option<(usize, &ToolDefinition, bool)> = None;
    for tool in tools {
        let open = format!("<{}>", tool.name);
        if let Some(idx) = text.find(&open) {
            if best.is_none_or(|(b, ..)| idx < b) {
                best = Some((idx, tool, false));
            }
        }
        let self_close = format!("<{}/>", tool.name);
        if let Some(idx) = text.find(&self_close) {
            if best.is_none_or(|(b, ..)| idx < b) {
                best = Some((idx, tool, true));
            }
        }
    }
    best
}

pub(crate) enum BufferScan {
    Complete(usize, usize, bool),
    Partial(usize),
    None,
}

/// Streaming-safe scan of `buf`'s tail for the earliest complete or
/// potentially-partial occurrence of any tool's opening/self-closing
/// tag. A partial match strictly before any complete match wins, since
/// it marks the leftmost point text cannot yet be safely emitted past.
pub(crate) fn scan_buffer(buf: &str, tools: &[ToolDefinition]) -> BufferScan {
    let mut earliest_complete: Option<(usize, usize, bool)> = None;
    let mut earliest_partial: Option<usize> = None;

    for (i, tool) in tools.iter().enumerate() {
        let open = format!("<{}>", tool.name);
        match find_potential_start(buf, &open) {
            StartMatch::Complete(idx) => {
                if earliest_complete.is_none_or(|(b, ..)| idx < b) {
                    earliest_complete = Some((idx, i, false));
                }
            }
            StartMatch::Partial(idx) => {
                earliest_partial = Some(earliest_partial.map_or(idx, |e| e.min(idx)));
            }
            StartMatch::None => {}
        }

        let self_close = format!("<{}/>", tool.name);
        match find_potential_start(buf, &self_close) {
            StartMatch::Complete(idx) => {
                if earliest_complete.is_none_or(|(b, ..)| idx < b) {
                    earliest_complete = Some((idx, i, true));
                }
            }
            StartMatch::Partial(idx) => {
                earliest_partial = Some(earliest_partial.map_or(idx, |e| e.min(idx)));
            }
            StartMatch::None => {}
        }
    }

    match (earliest_complete, earliest_partial) {
        (Some((c, ..)), Some(p)) if p < c => BufferScan::Partial(p),
        (Some((c, i, sc)), _) => BufferScan::Complete(c, i, sc),
        (None, Some(p)) => BufferScan::Partial(p),
        (None, None) => BufferScan::None,
    }
}

/// Depth-aware search for `tag`'s matching close tag within `buf`,
/// where `buf` begins right after `tag`'s own opening tag (so depth
/// starts at 1). Returns `(inner_end, after_start)` byte offsets.
pub(crate) fn find_matching_close(buf: &str, tag: &str) -> Option<(usize, usize)> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut depth = 1;
    let mut from = 0;
    loop {
        let next_open = buf[from..].find(&open).map(|i| i + from);
        let next_close = buf[from..].find(&close).map(|i| i + from);
        match (next_open, next_close) {
            (Some(o), Some(c)) if o < c => {
                depth += 1;
                from = o + open.len();
            }
            (_, Some(c)) => {
                depth -= 1;
                if depth == 0 {
                    return Some((c, c + close.len()));
                }
                from = c + close.len();
            }
            _ => return None,
        }
    }
}
