//! Lenient JSON extraction from oracle replies.
//!
//! Oracles are asked for strict JSON but routinely wrap it in prose or
//! markdown fences. The pipeline: direct parse, then fence stripping, then
//! balanced-brace extraction by depth counting. The planner additionally
//! accepts a bare array of step descriptions.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Parse a reply into `T`, tolerating surrounding prose and code fences.
pub fn lenient_from_str<T: DeserializeOwned>(reply: &str) -> Option<T> {
    extract_json(reply).and_then(|value| serde_json::from_value(value).ok())
}

/// Extract the first JSON object from a reply, or `None`.
pub fn extract_json(reply: &str) -> Option<Value> {
    let trimmed = reply.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    let stripped = strip_fences(trimmed);
    if let Ok(value) = serde_json::from_str::<Value>(stripped.trim()) {
        if value.is_object() {
            return Some(value);
        }
    }

    balanced_slice(&stripped, '{', '}')
        .and_then(|slice| serde_json::from_str::<Value>(slice).ok())
        .filter(Value::is_object)
        .or_else(|| {
            balanced_slice(trimmed, '{', '}')
                .and_then(|slice| serde_json::from_str::<Value>(slice).ok())
                .filter(Value::is_object)
        })
}

/// Extract the first JSON array from a reply, or `None`.
pub fn extract_array(reply: &str) -> Option<Value> {
    let trimmed = reply.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_array() {
            return Some(value);
        }
    }

    let stripped = strip_fences(trimmed);
    balanced_slice(&stripped, '[', ']')
        .and_then(|slice| serde_json::from_str::<Value>(slice).ok())
        .filter(Value::is_array)
}

/// Remove markdown code fences, keeping their contents. Handles a fence
/// language tag on the opening line (```json).
fn strip_fences(text: &str) -> String {
    if !text.contains("```") {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut in_fence = false;
    for line in text.lines() {
        let stripped = line.trim_start();
        if stripped.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Slice out the first balanced `open..close` region, tracking string
/// literals and escapes so braces inside strings do not confuse the depth
/// counter.
fn balanced_slice(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
