//! Step gating expressions.
//!
//! A step may carry a small boolean expression that decides whether it
//! runs: comparisons (`==`, `!=`, `<`, `<=`, `>`, `>=`) over numbers,
//! strings, and booleans, combined with `&&`, `||`, and parentheses.
//! `${path}` references are rendered into the expression from the live
//! context before evaluation.
//!
//! ```
//! use flowllm::condition::evaluate;
//! use serde_json::json;
//!
//! let ctx = json!({"s1": {"ok": true, "count": 3}});
//! assert!(evaluate("${s1.ok} == true", &ctx).unwrap());
//! assert!(!evaluate("${s1.count} > 5", &ctx).unwrap());
//! assert!(evaluate("${s1.count} > 1 && ${s1.ok} == true", &ctx).unwrap());
//! ```
//!
//! Evaluation is deterministic and side-effect-free; an expression that
//! fails to parse, or does not produce a boolean, is an
//! [`EngineError::InvalidCondition`].

use crate::flowllm::error::EngineError;
use crate::flowllm::template::resolve_path;
use serde_json::Value as JsonValue;

/// Evaluate a gating expression against the execution context.
///
/// An absent or blank expression gates nothing and evaluates to `true`.
pub fn evaluate(expression: &str, context: &JsonValue) -> Result<bool, EngineError> {
    if expression.trim().is_empty() {
        return Ok(true);
    }

    let rendered = render_references(expression, context);
    match evalexpr::eval(&rendered) {
        Ok(evalexpr::Value::Boolean(b)) => Ok(b),
        Ok(other) => Err(EngineError::InvalidCondition(format!(
            "expression '{}' evaluated to non-boolean {:?}",
            expression, other
        ))),
        Err(e) => Err(EngineError::InvalidCondition(format!(
            "expression '{}': {}",
            expression, e
        ))),
    }
}

/// Replace every `${path}` token with an evalexpr literal: strings are
/// quoted and escaped, numbers and booleans rendered bare, missing paths
/// and nulls become the empty string literal.
fn render_references(expression: &str, context: &JsonValue) -> String {
    let mut out = String::with_capacity(expression.len());
    let mut rest = expression;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let path = &after[..end];
                out.push_str(&literal(resolve_path(context, path)));
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn literal(value: Option<&JsonValue>) -> String {
    match value {
        Some(JsonValue::String(s)) => quote(s),
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(JsonValue::Bool(b)) => b.to_string(),
        Some(JsonValue::Null) | None => quote(""),
        // Composite values only ever make sense in equality checks
        // against their rendered form.
        Some(other) => quote(&other.to_string()),
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_expression_is_true() {
        assert!(evaluate("", &json!({})).unwrap());
        assert!(evaluate("   ", &json!({})).unwrap());
    }

    #[test]
    fn boolean_comparison() {
        let ctx = json!({"s1": {"ok": true}});
        assert!(!evaluate("${s1.ok} == false", &ctx).unwrap());
        assert!(evaluate("${s1.ok} != false", &ctx).unwrap());
    }

    #[test]
    fn numeric_ordering() {
        let ctx = json!({"trigger": {"qty": 7}});
        assert!(evaluate("${trigger.qty} >= 7", &ctx).unwrap());
        assert!(!evaluate("${trigger.qty} < 7", &ctx).unwrap());
    }

    #[test]
    fn string_equality_and_grouping() {
        let ctx = json!({"trigger": {"env": "prod", "qty": 2}});
        assert!(evaluate("${trigger.env} == \"prod\"", &ctx).unwrap());
        assert!(
            evaluate("(${trigger.env} == \"dev\") || (${trigger.qty} <= 2)", &ctx).unwrap()
        );
    }

    #[test]
    fn missing_path_compares_as_empty_string() {
        let ctx = json!({});
        assert!(evaluate("${nope.x} == \"\"", &ctx).unwrap());
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        let ctx = json!({"a": 1});
        assert!(matches!(
            evaluate("${a} ==", &ctx),
            Err(EngineError::InvalidCondition(_))
        ));
        assert!(matches!(
            evaluate("1 + 1", &ctx),
            Err(EngineError::InvalidCondition(_))
        ));
    }

    #[test]
    fn strings_with_quotes_are_escaped() {
        let ctx = json!({"t": {"v": "say \"hi\""}});
        assert!(evaluate("${t.v} == \"say \\\"hi\\\"\"", &ctx).unwrap());
    }
}
