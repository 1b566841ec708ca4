//! Decoding of the loosely structured JSON text providers send back.
//!
//! Accepted shapes are a bare array, or an object carrying the array under
//! `mcqs`, `questions`, `items` or `list`. Array entries may be objects or bare
//! strings; a string `s` becomes `{"name": s}`. Anything else decodes to an
//! error, never a guess.

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed json: {0}")]
    Malformed(String),
    #[error("unsupported payload shape")]
    UnsupportedShape,
    #[error("payload contained no usable items")]
    Empty,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope {
    List(Vec<Value>),
    Wrapped(Wrapped),
}

#[derive(Deserialize)]
struct Wrapped {
    #[serde(default)]
    mcqs: Option<Vec<Value>>,
    #[serde(default)]
    questions: Option<Vec<Value>>,
    #[serde(default)]
    items: Option<Vec<Value>>,
    #[serde(default)]
    list: Option<Vec<Value>>,
}

impl Wrapped {
    fn into_items(self) -> Option<Vec<Value>> {
        self.mcqs.or(self.questions).or(self.items).or(self.list)
    }
}

/// Removes a leading ```` ``` ```` / ```` ```json ```` line and a trailing fence.
pub fn strip_markdown_fence(input: &str) -> &str {
    let mut body = input.trim();
    if let Some(rest) = body.strip_prefix("```") {
        body = match rest.split_once('\n') {
            Some((_, tail)) => tail,
            None => rest.trim_start_matches(|ch: char| ch.is_ascii_alphanumeric()),
        };
    }
    if let Some(rest) = body.trim_end().strip_suffix("```") {
        body = rest;
    }
    body.trim()
}

pub fn decode_items(text: &str) -> Result<Vec<Value>, DecodeError> {
    let cleaned = strip_markdown_fence(text);
    let envelope: Envelope = serde_json::from_str(cleaned).map_err(|err| {
        if serde_json::from_str::<Value>(cleaned).is_ok() {
            DecodeError::UnsupportedShape
        } else {
            DecodeError::Malformed(err.to_string())
        }
    })?;

    let raw = match envelope {
        Envelope::List(items) => items,
        Envelope::Wrapped(wrapped) => wrapped.into_items().ok_or(DecodeError::UnsupportedShape)?,
    };

    let items: Vec<Value> = raw
        .into_iter()
        .filter_map(|item| match item {
            Value::String(name) => Some(json!({ "name": name })),
            Value::Object(_) => Some(item),
            _ => None,
        })
        .collect();

    if items.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(items)
}
