//! Tree-walking evaluator over the expression AST

use serde_json::Value as JsonValue;
use std::cmp::Ordering;

use super::ast::{BinaryOp, Expr, LogicalOp, PathSegment, UnaryOp};
use super::functions;
use super::security::{is_denied_property, is_denied_root};
use super::value::{is_truthy, loose_eq, number_value, render_value, strict_eq, to_number};
use super::EvalScope;

/// Evaluation was refused; carries the reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocked(pub String);

pub type EvalResult = Result<JsonValue, Blocked>;

pub fn eval(expr: &Expr, scope: &EvalScope<'_>) -> EvalResult {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path { root, segments } => eval_path(root, segments, scope),
        Expr::Call { name, args } => eval_call(name, args, scope),
        Expr::Unary { op, operand } => {
            let value = eval(operand, scope)?;
            Ok(match op {
                UnaryOp::Not => JsonValue::Bool(!is_truthy(&value)),
                UnaryOp::Neg => to_number(&value)
                    .map(|n| number_value(-n))
                    .unwrap_or(JsonValue::Null),
            })
        }
        Expr::Logical { op, left, right } => {
            let left = is_truthy(&eval(left, scope)?);
            let result = match op {
                LogicalOp::And => left && is_truthy(&eval(right, scope)?),
                LogicalOp::Or => left || is_truthy(&eval(right, scope)?),
            };
            Ok(JsonValue::Bool(result))
        }
        Expr::Binary { op, left, right } => {
            let left = eval(left, scope)?;
            let right = eval(right, scope)?;
            Ok(eval_binary(*op, &left, &right))
        }
        Expr::Ternary {
            test,
            then_e,
            else_e,
        } => {
            if is_truthy(&eval(test, scope)?) {
                eval(then_e, scope)
            } else {
                eval(else_e, scope)
            }
        }
    }
}

/// First deny-listed call or path anywhere in the tree, including branches
/// that short-circuiting would skip
pub(crate) fn find_denied(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Literal(_) => None,
        Expr::Path { root, segments } => path_denied(root, segments),
        Expr::Call { name, args } => {
            if !functions::is_allowed(name) {
                return Some(format!("call to '{}' is not allowed", name));
            }
            args.iter().find_map(find_denied)
        }
        Expr::Unary { operand, .. } => find_denied(operand),
        Expr::Logical { left, right, .. } | Expr::Binary { left, right, .. } => {
            find_denied(left).or_else(|| find_denied(right))
        }
        Expr::Ternary {
            test,
            then_e,
            else_e,
        } => find_denied(test)
            .or_else(|| find_denied(then_e))
            .or_else(|| find_denied(else_e)),
    }
}

fn path_denied(root: &str, segments: &[PathSegment]) -> Option<String> {
    if is_denied_root(root) {
        return Some(format!("access to '{}' is not allowed", root));
    }
    segments.iter().find_map(|segment| match segment {
        PathSegment::Key(key) if is_denied_property(key) => {
            Some(format!("access to '{}' is not allowed", key))
        }
        _ => None,
    })
}

fn eval_path(root: &str, segments: &[PathSegment], scope: &EvalScope<'_>) -> EvalResult {
    if let Some(reason) = path_denied(root, segments) {
        return Err(Blocked(reason));
    }

    let mut current = match scope.lookup(root) {
        Some(value) => value,
        None => return Ok(JsonValue::Null),
    };
    for segment in segments {
        current = match (segment, &current) {
            (PathSegment::Key(key), JsonValue::Object(map)) => {
                map.get(key).cloned().unwrap_or(JsonValue::Null)
            }
            (PathSegment::Key(key), JsonValue::Array(items)) if key == "length" => {
                JsonValue::from(items.len())
            }
            (PathSegment::Key(key), JsonValue::String(s)) if key == "length" => {
                JsonValue::from(s.chars().count())
            }
            (PathSegment::Index(idx), JsonValue::Array(items)) => {
                items.get(*idx).cloned().unwrap_or(JsonValue::Null)
            }
            (PathSegment::Index(idx), JsonValue::Object(map)) => {
                map.get(&idx.to_string()).cloned().unwrap_or(JsonValue::Null)
            }
            _ => return Ok(JsonValue::Null),
        };
    }
    Ok(current)
}

fn eval_call(name: &str, args: &[Expr], scope: &EvalScope<'_>) -> EvalResult {
    if !functions::is_allowed(name) {
        return Err(Blocked(format!("call to '{}' is not allowed", name)));
    }
    let values = args
        .iter()
        .map(|arg| eval(arg, scope))
        .collect::<Result<Vec<_>, _>>()?;
    functions::call(name, &values).ok_or_else(|| Blocked(format!("unknown function '{}'", name)))
}

fn eval_binary(op: BinaryOp, left: &JsonValue, right: &JsonValue) -> JsonValue {
    match op {
        BinaryOp::Add => match (to_number(left), to_number(right)) {
            (Some(a), Some(b)) if !left.is_null() && !right.is_null() => number_value(a + b),
            _ => JsonValue::String(format!("{}{}", render_value(left), render_value(right))),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (Some(a), Some(b)) = (to_number(left), to_number(right)) else {
                return JsonValue::Null;
            };
            match op {
                BinaryOp::Sub => number_value(a - b),
                BinaryOp::Mul => number_value(a * b),
                BinaryOp::Div if b == 0.0 => JsonValue::Null,
                BinaryOp::Div => number_value(a / b),
                BinaryOp::Rem if b == 0.0 => JsonValue::Null,
                _ => number_value(a % b),
            }
        }
        BinaryOp::Eq => JsonValue::Bool(loose_eq(left, right)),
        BinaryOp::Ne => JsonValue::Bool(!loose_eq(left, right)),
        BinaryOp::StrictEq => JsonValue::Bool(strict_eq(left, right)),
        BinaryOp::StrictNe => JsonValue::Bool(!strict_eq(left, right)),
        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
            let Some(ordering) = compare(left, right) else {
                return JsonValue::Bool(false);
            };
            JsonValue::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Gt => ordering == Ordering::Greater,
                BinaryOp::Le => ordering != Ordering::Greater,
                _ => ordering != Ordering::Less,
            })
        }
    }
}

/// Numeric ordering when both sides are numeric, string ordering when both
/// are strings, otherwise unordered
fn compare(left: &JsonValue, right: &JsonValue) -> Option<Ordering> {
    if left.is_null() || right.is_null() {
        return None;
    }
    match (to_number(left), to_number(right)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (left, right) {
            (JsonValue::String(a), JsonValue::String(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}
