//! Loose value semantics shared by the evaluator and the step handlers

use serde_json::{Number, Value as JsonValue};

/// 2^53; integral floats at or beyond this lose precision as integers
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Convert an f64 into a JSON number, keeping integral values as integers
pub fn number_value(n: f64) -> JsonValue {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        JsonValue::from(n as i64)
    } else {
        Number::from_f64(n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

/// Truthiness: null, false, 0, NaN and "" are falsy; everything else is truthy
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    }
}

/// Numeric view of a value, if it has one
pub fn to_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        JsonValue::String(s) => parse_decimal(s.trim()),
        _ => None,
    }
}

/// Finite decimal text only; `inf`, `infinity` and `nan` are not numbers here
fn parse_decimal(text: &str) -> Option<f64> {
    let decimal = text
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '+' | '-' | 'e' | 'E'));
    if text.is_empty() || !decimal || !text.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    text.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// `===`: same type and same value; numbers compare numerically
pub fn strict_eq(left: &JsonValue, right: &JsonValue) -> bool {
    match (left, right) {
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

/// `==`: strict equality, then numeric coercion, then string comparison
pub fn loose_eq(left: &JsonValue, right: &JsonValue) -> bool {
    if strict_eq(left, right) {
        return true;
    }
    match (left, right) {
        (JsonValue::Null, _) | (_, JsonValue::Null) => false,
        _ => match (to_number(left), to_number(right)) {
            (Some(a), Some(b)) => a == b,
            _ => render_value(left) == render_value(right),
        },
    }
}

/// Render a value for inclusion in a message
pub fn render_value(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < MAX_SAFE_INTEGER => {
                format!("{}", f as i64)
            }
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}
