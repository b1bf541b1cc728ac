//! `{{expr}}` template rendering
//!
//! Placeholders are resolved innermost-first, so `{{ {{field}} }}` first
//! renders `field` and then evaluates the result. Substituted values are
//! never rescanned for placeholders.

use serde_json::Value as JsonValue;

use super::value::render_value;
use super::{EvalScope, Evaluation, Evaluator};

pub(crate) const TOO_DEEP: &str = "[blocked: template nesting too deep]";

/// Output of rendering a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rendered {
    pub text: String,
    /// At least one placeholder was refused
    pub blocked: bool,
}

/// Byte offset of the `}}` closing the `{{` at `open`, honouring nesting
pub(crate) fn find_closing(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = open;
    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'}' && bytes[i + 1] == b'}' {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    None
}

/// If the whole (trimmed) text is one placeholder, return its inner source
pub(crate) fn single_placeholder(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if !trimmed.starts_with("{{") {
        return None;
    }
    let close = find_closing(trimmed, 0)?;
    if close + 2 == trimmed.len() {
        Some(&trimmed[2..close])
    } else {
        None
    }
}

/// Render `text`; `depth` is the nesting level, starting at 1
pub(crate) fn render(
    evaluator: &Evaluator,
    text: &str,
    scope: &EvalScope<'_>,
    depth: usize,
) -> Rendered {
    if depth > evaluator.max_template_depth {
        return Rendered {
            text: TOO_DEEP.to_string(),
            blocked: true,
        };
    }

    let mut out = String::with_capacity(text.len());
    let mut blocked = false;
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        let Some(close) = find_closing(rest, open) else {
            break;
        };
        out.push_str(&rest[..open]);
        let (value, was_blocked) =
            evaluate_placeholder(evaluator, &rest[open + 2..close], scope, depth);
        out.push_str(&value);
        blocked |= was_blocked;
        rest = &rest[close + 2..];
    }
    out.push_str(rest);

    Rendered { text: out, blocked }
}

/// Replace each placeholder in `text` with a generated name (`$0`, `$1`, ...)
/// bound to its value, so values are operands and never reparsed as source.
/// `None` when any placeholder is refused.
pub(crate) fn bind_placeholders(
    evaluator: &Evaluator,
    text: &str,
    scope: &EvalScope<'_>,
    depth: usize,
) -> Option<(String, Vec<(String, JsonValue)>)> {
    let mut out = String::with_capacity(text.len());
    let mut bindings = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        let Some(close) = find_closing(rest, open) else {
            break;
        };
        out.push_str(&rest[..open]);
        let Evaluation::Value(value) =
            expand_inner(evaluator, &rest[open + 2..close], scope, depth)
        else {
            return None;
        };
        let name = format!("${}", bindings.len());
        out.push(' ');
        out.push_str(&name);
        out.push(' ');
        bindings.push((name, value));
        rest = &rest[close + 2..];
    }
    out.push_str(rest);
    Some((out, bindings))
}

/// Evaluate the source between one pair of braces, rendering nested placeholders first
pub(crate) fn expand_inner(
    evaluator: &Evaluator,
    inner: &str,
    scope: &EvalScope<'_>,
    depth: usize,
) -> Evaluation {
    let source = if inner.contains("{{") {
        let nested = render(evaluator, inner, scope, depth + 1);
        if nested.blocked {
            if nested.text.contains(TOO_DEEP) {
                return Evaluation::Blocked(TOO_DEEP.to_string());
            }
            return Evaluation::Blocked(nested.text);
        }
        nested.text
    } else {
        inner.to_string()
    };
    evaluator.evaluate(&source, scope)
}

fn evaluate_placeholder(
    evaluator: &Evaluator,
    inner: &str,
    scope: &EvalScope<'_>,
    depth: usize,
) -> (String, bool) {
    match expand_inner(evaluator, inner, scope, depth) {
        Evaluation::Value(value) => (render_value(&value), false),
        Evaluation::Blocked(reason) if reason == TOO_DEEP => (reason, true),
        Evaluation::Blocked(_) => (format!("[blocked: {}]", inner.trim()), true),
    }
}
