//! Context substitution for input mappings.
//!
//! Workflow steps describe their agent input as a JSON tree whose string
//! leaves may contain `${path}` references into the live execution
//! context (`${trigger.product_code}`, `${step1.text}`). Substitution is
//! textual with one exception: a string that is exactly one `${...}`
//! token is replaced by the referenced value itself, preserving its JSON
//! type.
//!
//! ```
//! use flowllm::template::substitute;
//! use serde_json::json;
//!
//! let ctx = json!({"trigger": {"n": 42, "name": "ada"}});
//! let mapping = json!({"x": "${trigger.n}", "label": "v=${trigger.n}"});
//! let out = substitute(&mapping, &ctx);
//! assert_eq!(out, json!({"x": 42, "label": "v=42"}));
//! ```
//!
//! Missing paths resolve to `null` in raw mode and to the empty string
//! when spliced into surrounding text.

use serde_json::Value as JsonValue;

/// Expand every `${path}` reference in `mapping` against `context`,
/// recursing into nested arrays and objects.
pub fn substitute(mapping: &JsonValue, context: &JsonValue) -> JsonValue {
    match mapping {
        JsonValue::String(s) => expand_string(s, context),
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|v| substitute(v, context)).collect())
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve a dotted path (`a.b.0.c`) against a context tree. Numeric
/// segments index into arrays.
pub fn resolve_path<'a>(context: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = context;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        current = match current {
            JsonValue::Object(map) => map.get(segment)?,
            JsonValue::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Expand a single string leaf.
///
/// A leaf that is exactly `${path}` keeps the referenced value's type;
/// anything else splices string renderings into the surrounding text.
fn expand_string(s: &str, context: &JsonValue) -> JsonValue {
    if let Some(path) = whole_token(s) {
        return match resolve_path(context, path) {
            Some(v) => v.clone(),
            None => JsonValue::Null,
        };
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let path = &after[..end];
                if let Some(v) = resolve_path(context, path) {
                    out.push_str(&render(v));
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated token: keep the text as-is.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    JsonValue::String(out)
}

/// If `s` is exactly one `${...}` token, return the inner path.
fn whole_token(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains("${") || inner.contains('}') {
        return None;
    }
    Some(inner)
}

/// String rendering used in splice mode: strings unquoted, null empty,
/// everything else compact JSON.
fn render(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}
