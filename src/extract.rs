//! Pulling a JSON object out of a model reply.
//!
//! Models are asked for pure JSON, but they often wrap it in prose or Markdown
//! code fences anyway. Parsing the reply directly is the normal path; the
//! heuristics here are a best-effort fallback.

use std::sync::LazyLock;

use regex::Regex;

use crate::prelude::*;

/// Keys that a complete result object should have.
const EXPECTED_KEYS: &[&str] = &["description", "text", "menuItems", "tables", "analysis"];

/// Markdown code fence markers, with any whitespace inside the fence.
static CODE_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```(?:json|JSON)?\s*|\s*```").expect("failed to compile regex")
});

/// We could not find any JSON in a reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("no JSON object found in response")]
    NoJsonFound,
}

/// Parse `reply` as JSON, falling back to searching it for an embedded object.
pub fn extract_json(reply: &str) -> Result<Value, ExtractError> {
    if let Ok(value) = serde_json::from_str::<Value>(reply) {
        return Ok(value);
    }

    info!("Direct JSON parsing failed, extracting JSON from response text");
    let stripped = CODE_FENCE_RE.replace_all(reply, "");
    let stripped = stripped.trim();

    let objects = embedded_objects(stripped);

    if let Some(complete) = objects.iter().find(|obj| has_expected_keys(obj)) {
        debug!("Found JSON object with all expected fields");
        return Ok(complete.clone());
    }
    objects.into_iter().next().ok_or_else(|| {
        debug!(reply = %stripped, "No JSON object in response");
        ExtractError::NoJsonFound
    })
}

fn has_expected_keys(value: &Value) -> bool {
    EXPECTED_KEYS.iter().all(|key| value.get(key).is_some())
}

/// Find the JSON objects embedded in `text`, left to right.
///
/// We try to parse an object at each `{`. On success we skip past it, so
/// nested objects are not reported separately. On failure we move on to the
/// next `{`, so a stray brace in the prose can't hide a later object.
fn embedded_objects(text: &str) -> Vec<Value> {
    let mut objects = vec![];
    let mut pos = 0;
    while let Some(offset) = text[pos..].find('{') {
        let start = pos + offset;
        let mut stream =
            serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value @ Value::Object(_))) => {
                objects.push(value);
                pos = start + stream.byte_offset();
            }
            _ => pos = start + 1,
        }
    }
    objects
}
