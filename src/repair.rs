//! Recovery of a JSON object from chatty model output.

use serde_json::{Value, json};
use tracing::warn;

/// Locate the outermost `{ ... }` span and parse it.
///
/// Returns `None` when there is no span or it is not valid JSON.
fn try_extract_json(raw_text: &str) -> Option<Value> {
    let span = object_span(raw_text)?;
    serde_json::from_str::<Value>(span)
        .ok()
        .filter(Value::is_object)
}

/// Parse the object embedded in `raw_text`. Never fails: unusable text
/// becomes an empty outfit list.
pub fn extract_json(raw_text: &str) -> Value {
    try_extract_json(raw_text).unwrap_or_else(|| {
        warn!(
            target = "stylist.repair",
            text_len = raw_text.len(),
            "model_json_unrecoverable"
        );
        empty_outfits()
    })
}

fn empty_outfits() -> Value {
    json!({ "outfits": [] })
}

fn object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
