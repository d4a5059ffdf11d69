//! Text-level normalization rules applied before a reparse attempt.
//!
//! These are the first of the two repair mechanisms described in the
//! component design: cheap textual rewrites that fix the most common
//! malformations without needing to understand tree structure at all.
//! Structural recovery (tag-name mismatches, unbalanced nesting) happens
//! one level up, in [`super::dom::parse`]'s tolerant fallback build.

use once_cell::sync::Lazy;
use regex::Regex;

static CLOSE_TAG_LEADING_SPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</\s+([A-Za-z_:][A-Za-z0-9_:.\-]*)\s*>").unwrap());

static CLOSE_TAG_TRAILING_SPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</([A-Za-z_:][A-Za-z0-9_:.\-]*)\s+>").unwrap());

/// Applies one pass of textual normalization, returning the rewritten
/// text. Idempotent: a second call on the output is a no-op, which is
/// what lets [`super::dom::parse`]'s loop detect a fixed point.
pub fn repair_pass(text: &str) -> String {
    let text = CLOSE_TAG_LEADING_SPACE.replace_all(text, "</$1>");
    let text = CLOSE_TAG_TRAILING_SPACE.replace_all(&text, "</$1>");
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repair_pass_strips_leading_space_in_close_tag() {
        assert_eq!(repair_pass("<a>x</ a>"), "<a>x</a>");
    }

    #[test]
    fn test_repair_pass_strips_trailing_space_in_close_tag() {
        assert_eq!(repair_pass("<a>x</a  >"), "<a>x</a>");
    }

    #[test]
    fn test_repair_pass_is_idempotent() {
        let once = repair_pass("<a>x</ a >");
        let twice = repair_pass(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_repair_pass_leaves_well_formed_input_untouched() {
        let input = "<a><b>1</b></a>";
        assert_eq!(repair_pass(input), input);
    }
}
