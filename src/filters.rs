//! Server-side request filters: restricted-tool removal and system-prompt
//! clause scrubbing. Both are pure transforms over the raw request value so
//! the passthrough path can re-encode the result without loss.

use crate::config::{SystemClauseFilter, ToolPolicyConfig};
use serde_json::Value;
use tracing::{debug, warn};

/// Remove restricted tools from the request's `tools` array. Names compare
/// under case folding. An emptied list removes the `tools` key entirely.
/// The caller's value is never mutated.
pub fn filter_tools(body: &Value, policy: &ToolPolicyConfig) -> Value {
    let mut filtered = body.clone();

    let Some(tools) = filtered.get("tools").and_then(Value::as_array) else {
        return filtered;
    };

    let mut blocked: Vec<String> = Vec::new();
    let allowed: Vec<Value> = tools
        .iter()
        .filter(|tool| {
            let name = tool.get("name").and_then(Value::as_str).unwrap_or("");
            if policy.is_restricted(name) {
                blocked.push(name.to_string());
                false
            } else {
                true
            }
        })
        .cloned()
        .collect();

    if blocked.is_empty() {
        return filtered;
    }

    debug!(blocked = ?blocked, "removed restricted tools from request");

    let obj = filtered.as_object_mut().expect("tools key implies object");
    if allowed.is_empty() {
        obj.remove("tools");
    } else {
        obj.insert("tools".to_string(), Value::Array(allowed));
    }
    filtered
}

/// Apply the ordered clause filters to the top-level `system` field.
///
/// String form: filters apply to the whole string. List form: filters apply
/// to the `text` of each `{type: "text"}` block; other block types pass
/// through untouched. Matched spans are removed verbatim, surrounding
/// whitespace is preserved. When everything textual ends up blank the
/// `system` field is removed. Applying the same filter list twice is a
/// no-op on already-filtered input.
pub fn filter_system_prompt(body: &Value, filters: &[SystemClauseFilter]) -> Value {
    let mut filtered = body.clone();

    if filters.is_empty() {
        return filtered;
    }
    let Some(system) = filtered.get("system") else {
        return filtered;
    };

    let replacement = match system {
        Value::String(text) => {
            let scrubbed = apply_clause_filters(text, filters);
            if scrubbed.trim().is_empty() {
                None
            } else {
                Some(Value::String(scrubbed))
            }
        }
        Value::Array(blocks) => {
            let mut kept: Vec<Value> = Vec::with_capacity(blocks.len());
            for block in blocks {
                let is_text_block = block.get("type").and_then(Value::as_str) == Some("text");
                if !is_text_block {
                    kept.push(block.clone());
                    continue;
                }
                let text = block.get("text").and_then(Value::as_str).unwrap_or("");
                let scrubbed = apply_clause_filters(text, filters);
                if scrubbed.trim().is_empty() {
                    continue;
                }
                let mut copy = block.clone();
                copy.as_object_mut()
                    .expect("text block is an object")
                    .insert("text".to_string(), Value::String(scrubbed));
                kept.push(copy);
            }
            if kept.is_empty() {
                None
            } else {
                Some(Value::Array(kept))
            }
        }
        _ => return filtered,
    };

    let obj = filtered.as_object_mut().expect("system key implies object");
    match replacement {
        Some(value) => {
            obj.insert("system".to_string(), value);
        }
        None => {
            obj.remove("system");
        }
    }
    filtered
}

fn apply_clause_filters(text: &str, filters: &[SystemClauseFilter]) -> String {
    let mut result = text.to_string();
    for filter in filters {
        match filter.compile() {
            Some(Ok(regex)) => {
                result = regex.replace_all(&result, "").into_owned();
            }
            Some(Err(e)) => {
                // Rejected at config load; only reachable if a raw filter is
                // constructed by hand.
                warn!(pattern = %filter.pattern, error = %e, "skipping unparseable clause filter");
            }
            None => {
                result = remove_literal(&result, &filter.pattern, filter.case_sensitive);
            }
        }
    }
    result
}

/// Remove every occurrence of `pattern` from `text`, ASCII-case-insensitively
/// unless `case_sensitive`.
fn remove_literal(text: &str, pattern: &str, case_sensitive: bool) -> String {
    if pattern.is_empty() {
        return text.to_string();
    }
    if case_sensitive {
        return text.replace(pattern, "");
    }

    let bytes = text.as_bytes();
    let pat = pattern.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if i + pat.len() <= bytes.len() && bytes[i..i + pat.len()].eq_ignore_ascii_case(pat) {
            i += pat.len();
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).unwrap_or_else(|_| text.to_string())
}
