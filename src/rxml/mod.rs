//! A tolerant XML tokenizer and DOM, built for the markup language models
//! actually produce rather than the markup an XML validator would
//! accept: unquoted attributes, close tags with stray whitespace,
//! mismatched or missing closing tags.
//!
//! [`parse`] is the main entry point. It always returns a tree when
//! `ParseOptions::repair` is set (the default); with repair disabled it
//! reports the first structural error it hits.

mod dom;
mod repair;
mod tokenizer;

pub use dom::{parse, parse_once, RxmlChild, RxmlNode};
pub use tokenizer::{
    default_void_tags, tokenize, Position, Token, TokenKind, Tokenizer, TokenizerOptions,
};
