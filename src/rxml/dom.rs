//! Tree construction on top of the token stream, plus the tolerant
//! reparse loop for structurally broken input.

use super::tokenizer::{Token, TokenKind, Tokenizer, TokenizerOptions};
use crate::error::{Error, Result};
use crate::types::ParseOptions;
use tracing::debug;

/// One node of the parsed tree. An element's `children` interleaves text
/// and nested elements in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct RxmlNode {
    pub tag_name: String,
    pub attributes: Vec<(String, Option<String>)>,
    pub children: Vec<RxmlChild>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RxmlChild {
    Element(RxmlNode),
    Text(String),
}

impl RxmlNode {
    /// The concatenation of this element's direct text children, in
    /// order. Does not recurse into nested elements; callers that want
    /// the byte-exact inner text of a string-typed field should prefer
    /// [`crate::coercion::extract_raw_inner`] over this, since that
    /// function preserves nested markup verbatim rather than discarding
    /// it.
    pub fn text_content(&self) -> String {
        self.children
            .iter()
            .filter_map(|c| match c {
                RxmlChild::Text(t) => Some(t.as_str()),
                RxmlChild::Element(_) => None,
            })
            .collect()
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &RxmlNode> {
        self.children.iter().filter_map(|c| match c {
            RxmlChild::Element(e) => Some(e),
            RxmlChild::Text(_) => None,
        })
    }

    pub fn find_child(&self, tag_name: &str) -> Option<&RxmlNode> {
        self.child_elements().find(|e| e.tag_name == tag_name)
    }
}

/// Parses `src` into a list of top-level nodes (siblings at the root;
/// XML fragments emitted by a model are rarely single-rooted).
///
/// Applies the tolerant repair loop described in the component design
/// when `options.repair` is set: each pass rewrites the raw source text
/// and reparses, stopping once the tree stabilizes or `max_reparses` is
/// exhausted.
pub fn parse(src: &str, options: &ParseOptions) -> Result<Vec<RxmlNode>> {
    if !options.repair || options.max_reparses == 0 {
        return parse_once(src);
    }

    let mut text = src.to_string();
    let mut last_result = parse_once(&text);

    let mut passes = 0;
    for _ in 0..options.max_reparses {
        if last_result.is_ok() {
            break;
        }
        let repaired = super::repair::repair_pass(&text);
        if repaired == text {
            break;
        }
        text = repaired;
        last_result = parse_once(&text);
        passes += 1;
    }
    if passes > 0 {
        debug!(passes, max_reparses = options.max_reparses, "XML repair pass rewrote source");
    }

    // Textual normalization alone cannot fix a tag-name mismatch or
    // unbalanced nesting; fall back to the tolerant structural build,
    // which never fails except on pathologically unparseable token
    // streams (there are none, by construction of the tokenizer).
    if last_result.is_err() {
        debug!("falling back to tolerant structural build after repair pass exhausted");
        let tokens = Tokenizer::new(&text, TokenizerOptions::default()).collect::<Vec<_>>();
        last_result = Ok(build_tree_tolerant(&tokens));
    }

    last_result
}

/// Parses without any repair attempt; a structurally broken document
/// (unbalanced tags, tags closed out of order) is reported as an error
/// rather than guessed at.
pub fn parse_once(src: &str) -> Result<Vec<RxmlNode>> {
    let tokens = Tokenizer::new(src, TokenizerOptions::default()).collect::<Vec<_>>();
    build_tree(&tokens)
}

struct OpenElement {
    tag_name: String,
    attributes: Vec<(String, Option<String>)>,
    children: Vec<RxmlChild>,
}

fn build_tree(tokens: &[Token]) -> Result<Vec<RxmlNode>> {
    let mut roots: Vec<RxmlNode> = Vec::new();
    let mut stack: Vec<OpenElement> = Vec::new();

    let push_child = |stack: &mut Vec<OpenElement>, roots: &mut Vec<RxmlNode>, child: RxmlChild| {
        if let Some(top) = stack.last_mut() {
            top.children.push(child);
        } else if let RxmlChild::Element(e) = child {
            roots.push(e);
        }
        // A stray top-level text node (whitespace between root siblings)
        // is simply dropped; only elements are meaningful at the root.
    };

    for token in tokens {
        match &token.kind {
            TokenKind::StartTag {
                name,
                attributes,
                self_closing,
            } => {
                if *self_closing {
                    let node = RxmlNode {
                        tag_name: name.clone(),
                        attributes: attributes.clone(),
                        children: Vec::new(),
                    };
                    push_child(&mut stack, &mut roots, RxmlChild::Element(node));
                } else {
                    stack.push(OpenElement {
                        tag_name: name.clone(),
                        attributes: attributes.clone(),
                        children: Vec::new(),
                    });
                }
            }
            TokenKind::EndTag { name } => {
                match stack.iter().rposition(|e| &e.tag_name == name) {
                    Some(idx) if idx == stack.len() - 1 => {
                        let open = stack.pop().unwrap();
                        let node = RxmlNode {
                            tag_name: open.tag_name,
                            attributes: open.attributes,
                            children: open.children,
                        };
                        push_child(&mut stack, &mut roots, RxmlChild::Element(node));
                    }
                    Some(_) => {
                        // A close tag that matches an ancestor further up
                        // the stack than the innermost open element: the
                        // document is structurally broken (unbalanced
                        // nesting). Without repair this is fatal.
                        return Err(Error::xml_parse(
                            format!(
                                "end tag `</{name}>` does not match innermost open element `<{}>`",
                                stack.last().map(|e| e.tag_name.as_str()).unwrap_or("")
                            ),
                            token.pos.line,
                            token.pos.column,
                        ));
                    }
                    None => {
                        return Err(Error::xml_parse(
                            format!("end tag `</{name}>` has no matching open element"),
                            token.pos.line,
                            token.pos.column,
                        ));
                    }
                }
            }
            TokenKind::Text(text) => {
                push_child(&mut stack, &mut roots, RxmlChild::Text(text.clone()));
            }
            TokenKind::CData(text) => {
                push_child(&mut stack, &mut roots, RxmlChild::Text(text.clone()));
            }
            TokenKind::Comment(_)
            | TokenKind::ProcessingInstruction(_)
            | TokenKind::Doctype(_) => {
                // Dropped from the tree; never meaningful to tool-call
                // coercion.
            }
        }
    }

    if let Some(unclosed) = stack.pop() {
        return Err(Error::xml_parse(
            format!("unclosed element `<{}>`", unclosed.tag_name),
            1,
            1,
        ));
    }

    Ok(roots)
}

/// Structural counterpart to [`build_tree`] that never fails: a close
/// tag naming an ancestor balances by closing every intervening open
/// element (repair rule 2); a close tag matching nothing open is treated
/// as a malformed reference to the innermost open element and closes it
/// regardless of name (repair rule 1); any elements still open at end of
/// input are auto-closed in LIFO order.
fn build_tree_tolerant(tokens: &[Token]) -> Vec<RxmlNode> {
    let mut roots: Vec<RxmlNode> = Vec::new();
    let mut stack: Vec<OpenElement> = Vec::new();

    let push_child = |stack: &mut Vec<OpenElement>, roots: &mut Vec<RxmlNode>, child: RxmlChild| {
        if let Some(top) = stack.last_mut() {
            top.children.push(child);
        } else if let RxmlChild::Element(e) = child {
            roots.push(e);
        }
    };

    let close_top = |stack: &mut Vec<OpenElement>| -> Option<RxmlNode> {
        let open = stack.pop()?;
        Some(RxmlNode {
            tag_name: open.tag_name,
            attributes: open.attributes,
            children: open.children,
        })
    };

    for token in tokens {
        match &token.kind {
            TokenKind::StartTag {
                name,
                attributes,
                self_closing,
            } => {
                if *self_closing {
                    let node = RxmlNode {
                        tag_name: name.clone(),
                        attributes: attributes.clone(),
                        children: Vec::new(),
                    };
                    push_child(&mut stack, &mut roots, RxmlChild::Element(node));
                } else {
                    stack.push(OpenElement {
                        tag_name: name.clone(),
                        attributes: attributes.clone(),
                        children: Vec::new(),
                    });
                }
            }
            TokenKind::EndTag { name } => {
                match stack.iter().rposition(|e| &e.tag_name == name) {
                    Some(idx) => {
                        // Close every element from the top down to and
                        // including `idx` (a no-op range when idx is
                        // already the innermost element).
                        while stack.len() > idx {
                            if let Some(node) = close_top(&mut stack) {
                                push_child(&mut stack, &mut roots, RxmlChild::Element(node));
                            }
                        }
                    }
                    None => {
                        if let Some(node) = close_top(&mut stack) {
                            push_child(&mut stack, &mut roots, RxmlChild::Element(node));
                        }
                        // An empty stack means this close tag is pure
                        // noise (no open element to attribute it to);
                        // dropping it is the only sound option.
                    }
                }
            }
            TokenKind::Text(text) | TokenKind::CData(text) => {
                push_child(&mut stack, &mut roots, RxmlChild::Text(text.clone()));
            }
            TokenKind::Comment(_)
            | TokenKind::ProcessingInstruction(_)
            | TokenKind::Doctype(_) => {}
        }
    }

    while let Some(node) = close_top(&mut stack) {
        push_child(&mut stack, &mut roots, RxmlChild::Element(node));
    }

    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_once_simple_tree() {
        let roots = parse_once("<a><b>1</b><c>2</c></a>").unwrap();
        assert_eq!(roots.len(), 1);
        let a = &roots[0];
        assert_eq!(a.tag_name, "a");
        assert_eq!(a.child_elements().count(), 2);
        assert_eq!(a.find_child("b").unwrap().text_content(), "1");
    }

    #[test]
    fn test_parse_once_unclosed_is_error() {
        let result = parse_once("<a><b>1</b>");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_once_mismatched_close_is_error() {
        let result = parse_once("<a><b>1</a></b>");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_with_repair_recovers_malformed_close() {
        let opts = ParseOptions::builder().repair(true).max_reparses(4).build();
        let roots = parse("<a>x</ a>", &opts).unwrap();
        assert_eq!(roots[0].tag_name, "a");
        assert_eq!(roots[0].text_content(), "x");
    }

    #[test]
    fn test_parse_without_repair_propagates_error() {
        let opts = ParseOptions::builder().repair(false).build();
        let result = parse("<a><b>1</b>", &opts);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_with_repair_balances_ancestor_close() {
        let opts = ParseOptions::builder().repair(true).build();
        // </a> closes both <b> and <a>, skipping the missing </b>.
        let roots = parse("<a><b>1</a>", &opts).unwrap();
        assert_eq!(roots[0].tag_name, "a");
        assert_eq!(roots[0].find_child("b").unwrap().text_content(), "1");
    }

    #[test]
    fn test_parse_with_repair_drops_stray_close_tag() {
        let opts = ParseOptions::builder().repair(true).build();
        let roots = parse("<a>text</stray></a>", &opts).unwrap();
        assert_eq!(roots[0].tag_name, "a");
        assert_eq!(roots[0].text_content(), "text");
    }

    #[test]
    fn test_self_closing_tags_have_no_children() {
        let roots = parse_once("<root><leaf/></root>").unwrap();
        let leaf = roots[0].find_child("leaf").unwrap();
        assert!(leaf.children.is_empty());
    }

    #[test]
    fn test_comments_and_pis_are_dropped_from_tree() {
        let roots = parse_once("<a><!-- c --><?pi?>text</a>").unwrap();
        assert_eq!(roots[0].text_content(), "text");
    }
}
