//! Canonical JSON utilities.
//!
//! Structural (order-independent) equality and JSONPath node extraction over
//! arbitrary JSON documents.

use jsonpath_rust::JsonPath;
use serde_json::{Number, Value};

/// Structural equality between two documents: key order and formatting are
/// irrelevant, and numbers compare without an integer/float distinction.
pub fn structural_eq(a: &Value, b: &Value) -> bool {
    canonicalize(a) == canonicalize(b)
}

/// Structural equality where the right operand is unparsed JSON text.
/// A parse failure is an evaluation error, not a non-match.
pub fn structural_eq_str(a: &Value, b: &str) -> anyhow::Result<bool> {
    let parsed: Value = serde_json::from_str(b)
        .map_err(|e| anyhow::anyhow!("invalid json document '{}': {}", b, e))?;
    Ok(structural_eq(a, &parsed))
}

/// Normalize a document for comparison: all numbers become f64 so that
/// `1` and `1.0` are the same value.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Number(n) => n
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect(),
        ),
        _ => value.clone(),
    }
}

/// Extract the nodes selected by a JSONPath expression. An invalid expression
/// is an evaluation error; a valid expression selecting nothing returns an
/// empty list.
pub fn select_nodes(doc: &Value, expression: &str) -> anyhow::Result<Vec<Value>> {
    let path = JsonPath::try_from(expression)
        .map_err(|e| anyhow::anyhow!("jsonpath expression '{}': {}", expression, e))?;

    let found = path.find(doc);
    let nodes = match found {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    };
    Ok(nodes)
}

/// Render a node the way it compares in string contexts: strings unquoted,
/// everything else in its serialized JSON form.
pub fn node_string_form(node: &Value) -> String {
    match node {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
