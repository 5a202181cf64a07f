//! Bounding tool output before it is fed back to the model.
//!
//! Lengths are measured in characters, not bytes, so multi-byte text is never
//! split inside a code point.

use serde_json::{Map, Value};

/// Maximum characters of tool output forwarded to the model.
pub const MAX_TOOL_OUTPUT_CHARS: usize = 6_000;

/// Characters that always survive truncation, however small the cap.
pub const MIN_TOOL_OUTPUT_CHARS: usize = 1_000;

/// Appended to every truncated output.
pub const TRUNCATION_MARKER: &str = "\n\n[... output truncated ...]";

/// Truncate `output` to [`MAX_TOOL_OUTPUT_CHARS`].
pub fn truncate_tool_output(output: &str) -> String {
    truncate_to(output, MAX_TOOL_OUTPUT_CHARS)
}

/// Truncate `output` to `cap` characters including the marker.
///
/// The cut lands on the last newline before `cap - marker` when that newline
/// sits at or beyond 80% of `cap`; otherwise it lands exactly at
/// `cap - marker`.  At least [`MIN_TOOL_OUTPUT_CHARS`] characters are kept.
pub fn truncate_to(output: &str, cap: usize) -> String {
    if output.chars().count() <= cap {
        return output.to_owned();
    }

    let marker_len = TRUNCATION_MARKER.chars().count();
    let budget = cap.saturating_sub(marker_len).max(MIN_TOOL_OUTPUT_CHARS);
    let head = prefix_chars(output, budget);

    let min_newline_cut = cap * 4 / 5;
    let cut = match head.rfind('\n') {
        Some(pos) if head[..pos].chars().count() >= min_newline_cut => &head[..pos],
        _ => head,
    };

    let mut truncated = String::with_capacity(cut.len() + TRUNCATION_MARKER.len());
    truncated.push_str(cut);
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

/// The first `n` characters of `s`.
fn prefix_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// A short single-line preview for logs.
pub fn preview(s: &str, max_chars: usize) -> String {
    let head = prefix_chars(s, max_chars);
    let mut out = head.replace('\n', " ");
    if head.len() < s.len() {
        out.push('…');
    }
    out
}

/// The textual form of a tool result as the model should see it.
///
/// Results exposing a `message` field are reduced to `{message, sent}` so
/// bulky structured payloads (attachment metadata in particular) never reach
/// the model.  Strings are forwarded verbatim; everything else is serialized
/// as compact JSON.
pub fn model_view(result: &Value) -> String {
    match result {
        Value::String(s) => s.clone(),
        Value::Object(obj) if obj.contains_key("message") => {
            let mut reduced = Map::new();
            if let Some(message) = obj.get("message") {
                reduced.insert("message".into(), message.clone());
            }
            if let Some(sent) = obj.get("sent") {
                reduced.insert("sent".into(), sent.clone());
            }
            Value::Object(reduced).to_string()
        }
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
