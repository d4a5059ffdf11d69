//! Schema-directed coercion: turns a loosely-typed value (a JSON value
//! from a JSON/YAML-flavored protocol, or an XML fragment from the
//! XML-as-tool protocol) into the shape a tool's input schema declares.
//!
//! Two entry points, because XML and "already-a-`Value`" inputs need
//! genuinely different treatment:
//!
//! - [`coerce_json_value`] walks a `serde_json::Value` (already produced
//!   by [`crate::rjson`] or `serde_yaml`) against a JSON-Schema fragment.
//!   This is the full rule set from the component design: object/array/
//!   string/number/boolean, plus the array-shape heuristics for
//!   "the model wrapped a single value" and "the model gave a
//!   single-key object where an array was expected".
//! - [`coerce_xml_fields`] is specific to the XML-as-tool protocol's
//!   one-tag-per-field convention, where string-typed fields must
//!   preserve their raw inner markup byte-exact rather than going
//!   through [`crate::rxml::RxmlNode::text_content`] (which would
//!   silently drop any nested tags).

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::rxml::{self, RxmlNode, TokenKind, Tokenizer, TokenizerOptions};
use crate::types::{DuplicateTagPolicy, ParseOptions};
use tracing::{debug, warn};

/// Schema-directed coercion over a `Value` already produced by a JSON or
/// YAML parser. Never fails: values that don't fit the declared type are
/// returned unchanged, per §4.2's "best effort" invariant.
pub fn coerce_json_value(value: &Value, schema: &Value) -> Value {
    let schema = unwrap_schema(schema);
    match schema_type(schema) {
        Some("object") => coerce_object(value, schema),
        Some("array") => coerce_array(value, schema),
        Some("string") => coerce_string(value),
        Some("number") | Some("integer") => coerce_number(value),
        Some("boolean") => coerce_boolean(value),
        _ => coerce_without_hint(value),
    }
}

fn unwrap_schema(schema: &Value) -> &Value {
    schema.get("jsonSchema").unwrap_or(schema)
}

fn schema_type(schema: &Value) -> Option<&str> {
    schema.get("type").and_then(Value::as_str)
}

fn coerce_object(value: &Value, schema: &Value) -> Value {
    let Some(obj) = value.as_object() else {
        return value.clone();
    };
    let properties = schema.get("properties").and_then(Value::as_object);
    let mut out = Map::new();
    for (k, v) in obj {
        let coerced = match properties.and_then(|p| p.get(k)) {
            Some(field_schema) => coerce_json_value(v, field_schema),
            None => v.clone(),
        };
        out.insert(k.clone(), coerced);
    }
    Value::Object(out)
}

fn coerce_array(value: &Value, schema: &Value) -> Value {
    let items_schema = schema.get("items");
    let prefix_items = schema.get("prefixItems").and_then(Value::as_array);

    let coerce_positional = |elems: &[Value]| -> Value {
        let coerced: Vec<Value> = elems
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let item_schema = prefix_items
                    .and_then(|p| p.get(i))
                    .or(items_schema)
                    .cloned()
                    .unwrap_or(Value::Null);
                coerce_json_value(v, &item_schema)
            })
            .collect();
        Value::Array(coerced)
    };

    match value {
        Value::Array(elems) => coerce_positional(elems),
        Value::Object(obj) => {
            if let Some(Value::Array(elems)) = obj.get("item") {
                return coerce_positional(elems);
            }
            if let Some(tuple) = as_contiguous_tuple(obj) {
                return coerce_positional(&tuple);
            }
            if obj.len() == 1 {
                let (key, inner) = obj.iter().next().unwrap();
                let declared = items_schema
                    .and_then(|s| s.get("properties"))
                    .and_then(|p| p.get(key))
                    .is_some();
                if !declared {
                    return match inner {
                        Value::Array(elems) => coerce_positional(elems),
                        other => coerce_positional(std::slice::from_ref(other)),
                    };
                }
            }
            coerce_positional(std::slice::from_ref(value))
        }
        other => coerce_positional(std::slice::from_ref(other)),
    }
}

/// If `obj`'s keys are exactly the decimal integers `0..n`, returns the
/// values ordered by key.
fn as_contiguous_tuple(obj: &Map<String, Value>) -> Option<Vec<Value>> {
    if obj.is_empty() {
        return None;
    }
    let mut indexed: Vec<(usize, &Value)> = Vec::with_capacity(obj.len());
    for (k, v) in obj {
        let idx: usize = k.parse().ok()?;
        indexed.push((idx, v));
    }
    indexed.sort_by_key(|(i, _)| *i);
    for (expected, (actual, _)) in indexed.iter().enumerate() {
        if expected != *actual {
            return None;
        }
    }
    Some(indexed.into_iter().map(|(_, v)| v.clone()).collect())
}

fn coerce_string(value: &Value) -> Value {
    match value {
        Value::String(_) => value.clone(),
        Value::Number(n) => Value::String(n.to_string()),
        Value::Bool(b) => Value::String(b.to_string()),
        other => other.clone(),
    }
}

fn coerce_number(value: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::String(s) => parse_number(s).unwrap_or_else(|| value.clone()),
        other => other.clone(),
    }
}

fn parse_number(s: &str) -> Option<Value> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    if !NUMERIC_RE.is_match(trimmed) {
        return None;
    }
    let n: f64 = trimmed.parse().ok()?;
    if !n.is_finite() {
        return None;
    }
    serde_json::Number::from_f64(n).map(Value::Number)
}

static NUMERIC_RE_SRC: &str = r"^-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?$";

use once_cell::sync::Lazy;
static NUMERIC_RE: Lazy<regex::Regex> = Lazy::new(|| regex::Regex::new(NUMERIC_RE_SRC).unwrap());

fn coerce_boolean(value: &Value) -> Value {
    match value {
        Value::Bool(_) => value.clone(),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => value.clone(),
        },
        other => other.clone(),
    }
}

/// No schema hint available for this value at all: try boolean, then
/// numeric, then a nested JSON parse if it looks like one, else keep the
/// original string.
fn coerce_without_hint(value: &Value) -> Value {
    let Value::String(s) = value else {
        return value.clone();
    };
    let trimmed = s.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Some(n) = parse_number(trimmed) {
        return n;
    }
    if (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
    {
        if let Ok(parsed) = serde_json::from_str(trimmed) {
            return parsed;
        }
    }
    value.clone()
}

/// Coerces the direct child elements of an XML tool-call fragment
/// (everything between `<tool_name>` and `</tool_name>`, already
/// extracted by the protocol layer) into an object matching `schema`.
///
/// A schema-declared string field with more than one top-level occurrence
/// is repair rule 3 (§4.1): under `options.repair`, the duplicate siblings
/// collapse to the last occurrence and the call succeeds with a warning;
/// with repair disabled there is no safe way to pick a winner, so the
/// whole call fails with `Err` and the protocol layer falls back to
/// emitting the original text. `DuplicateTagPolicy::Fatal` always raises
/// `Err` regardless of `options.repair`, for a caller that wants no
/// silent recovery at all.
///
/// Returns the coerced object plus any non-fatal warnings generated
/// along the way.
pub fn coerce_xml_fields(
    fragment_text: &str,
    schema: &Value,
    options: &ParseOptions,
) -> Result<(Value, Vec<String>)> {
    let schema = unwrap_schema(schema);
    let top_level = rxml::parse(fragment_text, options)?;
    let properties = schema.get("properties").and_then(Value::as_object);

    let mut warnings = Vec::new();
    let mut out = Map::new();
    let mut seen = std::collections::HashSet::new();

    for node in &top_level {
        if !seen.insert(node.tag_name.clone()) {
            continue; // handled on first sighting below
        }

        let occurrences: Vec<&RxmlNode> = top_level
            .iter()
            .filter(|n| n.tag_name == node.tag_name)
            .collect();

        let field_schema = properties.and_then(|p| p.get(&node.tag_name));
        let is_string_field = field_schema
            .map(|s| schema_type(unwrap_schema(s)) == Some("string"))
            .unwrap_or(false);

        if is_string_field && occurrences.len() > 1 {
            if options.duplicate_tag_policy == DuplicateTagPolicy::Fatal {
                warn!(tag = %node.tag_name, count = occurrences.len(), "duplicate string tag rejected");
                return Err(Error::duplicate_string_tag(node.tag_name.clone()));
            }
            if !options.repair {
                debug!(tag = %node.tag_name, count = occurrences.len(), "duplicate string tag with repair disabled: falling back to text");
                return Err(Error::duplicate_string_tag(node.tag_name.clone()));
            }
            debug!(tag = %node.tag_name, count = occurrences.len(), "duplicate string tag repaired: keeping last occurrence");
            warnings.push(format!(
                "duplicate `<{}>`: keeping last occurrence",
                node.tag_name
            ));
        }

        let value = if is_string_field {
            let raw = if occurrences.len() > 1 {
                extract_raw_inner_last(fragment_text, &node.tag_name)
            } else {
                extract_raw_inner(fragment_text, &node.tag_name)
            };
            Value::String(raw.unwrap_or_default())
        } else if occurrences.len() > 1
            && field_schema
                .map(|s| schema_type(unwrap_schema(s)) == Some("array"))
                .unwrap_or(false)
        {
            let items_schema = field_schema.and_then(|s| unwrap_schema(s).get("items"));
            Value::Array(
                occurrences
                    .iter()
                    .map(|n| coerce_xml_node(n, items_schema, fragment_text))
                    .collect(),
            )
        } else {
            match field_schema {
                Some(fs) => coerce_xml_node(node, Some(fs), fragment_text),
                None => xml_node_to_json(node),
            }
        };

        out.insert(node.tag_name.clone(), value);
    }

    Ok((Value::Object(out), warnings))
}

fn coerce_xml_node(node: &RxmlNode, schema: Option<&Value>, fragment_text: &str) -> Value {
    let Some(schema) = schema else {
        return xml_node_to_json(node);
    };
    let schema = unwrap_schema(schema);
    match schema_type(schema) {
        Some("string") => Value::String(
            extract_raw_inner(fragment_text, &node.tag_name).unwrap_or_else(|| node.text_content()),
        ),
        Some("array") => coerce_xml_array(node, schema),
        Some("object") => coerce_xml_object(node, schema),
        Some("number") | Some("integer") => coerce_number(&Value::String(node.text_content())),
        Some("boolean") => coerce_boolean(&Value::String(node.text_content())),
        _ => xml_node_to_json(node),
    }
}

fn coerce_xml_object(node: &RxmlNode, schema: &Value) -> Value {
    let properties = schema.get("properties").and_then(Value::as_object);
    let mut out = Map::new();
    let mut seen = std::collections::HashSet::new();
    for child in node.child_elements() {
        if !seen.insert(child.tag_name.clone()) {
            continue;
        }
        let field_schema = properties.and_then(|p| p.get(&child.tag_name));
        let value = match field_schema {
            Some(fs) if schema_type(unwrap_schema(fs)) == Some("string") => {
                Value::String(child.text_content())
            }
            Some(fs) => coerce_xml_node(child, Some(fs), ""),
            None => xml_node_to_json(child),
        };
        out.insert(child.tag_name.clone(), value);
    }
    Value::Object(out)
}

fn coerce_xml_array(node: &RxmlNode, schema: &Value) -> Value {
    let items_schema = schema.get("items");
    let prefix_items = schema.get("prefixItems").and_then(Value::as_array);
    let children: Vec<&RxmlNode> = node.child_elements().collect();

    if children.is_empty() {
        let text = node.text_content();
        if text.trim().is_empty() {
            return Value::Array(vec![]);
        }
        let scalar = coerce_without_hint(&Value::String(text));
        let coerced = items_schema
            .map(|s| coerce_json_value(&scalar, s))
            .unwrap_or(scalar);
        return Value::Array(vec![coerced]);
    }

    if let Some(tuple) = tuple_by_numeric_tag_name(&children) {
        let coerced: Vec<Value> = tuple
            .into_iter()
            .enumerate()
            .map(|(i, n)| {
                let item_schema = prefix_items.and_then(|p| p.get(i)).or(items_schema);
                coerce_xml_node(n, item_schema, "")
            })
            .collect();
        return Value::Array(coerced);
    }

    Value::Array(
        children
            .iter()
            .map(|c| coerce_xml_node(c, items_schema, ""))
            .collect(),
    )
}

/// Supports the `<coordinates><0>10.5</0><1>20.3</1></coordinates>`
/// tuple-style array convention: children whose tag names are the
/// contiguous decimal integers `0..n`.
fn tuple_by_numeric_tag_name<'a>(children: &[&'a RxmlNode]) -> Option<Vec<&'a RxmlNode>> {
    if children.is_empty() {
        return None;
    }
    let mut indexed: Vec<(usize, &RxmlNode)> = Vec::with_capacity(children.len());
    for c in children {
        let idx: usize = c.tag_name.parse().ok()?;
        indexed.push((idx, c));
    }
    indexed.sort_by_key(|(i, _)| *i);
    for (expected, (actual, _)) in indexed.iter().enumerate() {
        if expected != *actual {
            return None;
        }
    }
    Some(indexed.into_iter().map(|(_, n)| n).collect())
}

/// Best-effort conversion of an XML node with no schema guidance: object
/// if it has named child elements, array if every child shares one tag
/// name (or is literally `<item>`), else a scalar via
/// [`coerce_without_hint`].
fn xml_node_to_json(node: &RxmlNode) -> Value {
    let children: Vec<&RxmlNode> = node.child_elements().collect();
    if children.is_empty() {
        return coerce_without_hint(&Value::String(node.text_content()));
    }

    let all_same_name = children.iter().all(|c| c.tag_name == children[0].tag_name);
    if all_same_name && (children[0].tag_name == "item" || children.len() > 1) {
        return Value::Array(children.iter().map(|c| xml_node_to_json(c)).collect());
    }

    let mut out = Map::new();
    let mut seen = std::collections::HashSet::new();
    for child in &children {
        if !seen.insert(child.tag_name.clone()) {
            continue;
        }
        out.insert(child.tag_name.clone(), xml_node_to_json(child));
    }
    Value::Object(out)
}

/// Returns the exact substring between the first top-level occurrence of
/// `<tag_name>` and its matching close tag, honoring nesting depth for
/// same-named elements and never mistaking markup inside CDATA, comments,
/// processing instructions, or attribute values for a real tag boundary
/// (by construction, since it walks the same tokenizer every other
/// entry point uses rather than scanning raw text itself).
///
/// Returns `Some(String::new())` for a self-closing `<tag_name/>`, and
/// `None` if `tag_name` never opens in `text`.
pub fn extract_raw_inner(text: &str, tag_name: &str) -> Option<String> {
    let tokens: Vec<_> = Tokenizer::new(text, TokenizerOptions::default()).collect();
    let mut depth: i32 = 0;
    let mut start_byte: Option<usize> = None;

    for token in &tokens {
        match &token.kind {
            TokenKind::StartTag {
                name,
                self_closing,
                ..
            } if name == tag_name => {
                if *self_closing {
                    if start_byte.is_none() {
                        return Some(String::new());
                    }
                    continue;
                }
                if start_byte.is_none() {
                    start_byte = Some(token.end_byte_offset);
                    depth = 1;
                } else {
                    depth += 1;
                }
            }
            TokenKind::EndTag { name } if name == tag_name => {
                if let Some(s) = start_byte {
                    depth -= 1;
                    if depth == 0 {
                        return Some(text[s..token.pos.byte_offset].to_string());
                    }
                }
            }
            _ => {}
        }
    }

    None
}

/// Like [`extract_raw_inner`] but returns the LAST top-level occurrence
/// rather than the first. Repair rule 3 (§4.1) resolves duplicate
/// single-value string siblings by keeping the one the model wrote last.
fn extract_raw_inner_last(text: &str, tag_name: &str) -> Option<String> {
    let tokens: Vec<_> = Tokenizer::new(text, TokenizerOptions::default()).collect();
    let mut depth: i32 = 0;
    let mut start_byte: Option<usize> = None;
    let mut last: Option<String> = None;

    for token in &tokens {
        match &token.kind {
            TokenKind::StartTag {
                name,
                self_closing,
                ..
            } if name == tag_name => {
                if *self_closing {
                    if start_byte.is_none() {
                        last = Some(String::new());
                    }
                    continue;
                }
                if start_byte.is_none() {
                    start_byte = Some(token.end_byte_offset);
                    depth = 1;
                } else {
                    depth += 1;
                }
            }
            TokenKind::EndTag { name } if name == tag_name => {
                if let Some(s) = start_byte {
                    depth -= 1;
                    if depth == 0 {
                        last = Some(text[s..token.pos.byte_offset].to_string());
                        start_byte = None;
                    }
                }
            }
            _ => {}
        }
    }

    last
}

/// Detects string-typed schema properties that appear more than once at
/// the top level of an XML fragment, independent of coercion itself.
/// Exposed for callers (e.g. the streaming parser) that want to warn
/// eagerly rather than waiting for a full coerce pass.
pub fn duplicate_string_tags(fragment_text: &str, schema: &Value) -> Vec<String> {
    let schema = unwrap_schema(schema);
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };
    let Ok(top_level) = rxml::parse_once(fragment_text) else {
        return Vec::new();
    };
    properties
        .iter()
        .filter(|(_, s)| schema_type(unwrap_schema(s)) == Some("string"))
        .filter(|(name, _)| {
            top_level.iter().filter(|n| &&n.tag_name == name).count() > 1
        })
        .map(|(name, _)| name.clone())
        .collect()
}
