//! Sandboxed expression and template evaluation
//!
//! Expressions are parsed with a restricted pest grammar into an AST and
//! evaluated against a variable scope. Nothing here can mutate state, loop,
//! or call outside a fixed function allow-list; refused expressions come
//! back as [`Evaluation::Blocked`] and never as an error.

pub mod ast;
pub mod eval;
pub mod functions;
pub mod parser;
pub mod security;
pub mod template;
pub mod value;


use serde_json::{Map, Value as JsonValue};
use tracing::warn;

pub use parser::{parse_expression, ParseError};
pub use value::{is_truthy, render_value};

/* ===================== Scope ===================== */

/// Engine-derived names visible to expressions after the frame's variables
#[derive(Debug, Clone, Default)]
pub struct PseudoVariables {
    pub user_id: String,
    pub session_id: String,
    pub flow_name: String,
    pub language: String,
}

/// Everything an expression can read
#[derive(Debug, Clone)]
pub struct EvalScope<'a> {
    pub variables: &'a Map<String, JsonValue>,
    pub pseudo: PseudoVariables,
}

impl<'a> EvalScope<'a> {
    pub fn new(variables: &'a Map<String, JsonValue>) -> Self {
        Self {
            variables,
            pseudo: PseudoVariables::default(),
        }
    }

    pub fn with_pseudo(mut self, pseudo: PseudoVariables) -> Self {
        self.pseudo = pseudo;
        self
    }

    /// Frame variables first, then pseudo-variables
    pub fn lookup(&self, name: &str) -> Option<JsonValue> {
        if let Some(value) = self.variables.get(name) {
            return Some(value.clone());
        }
        let pseudo = match name {
            "userId" => self.pseudo.user_id.clone(),
            "sessionId" => self.pseudo.session_id.clone(),
            "flowName" => self.pseudo.flow_name.clone(),
            "language" => self.pseudo.language.clone(),
            "currentTime" => functions::current_time(),
            _ => return None,
        };
        Some(JsonValue::String(pseudo))
    }
}

/* ===================== Evaluator ===================== */

/// Outcome of evaluating one expression
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Value(JsonValue),
    Blocked(String),
}

#[derive(Debug, Clone)]
pub struct Evaluator {
    pub(crate) max_template_depth: usize,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(10)
    }
}

impl Evaluator {
    pub fn new(max_template_depth: usize) -> Self {
        Self {
            max_template_depth: max_template_depth.max(1),
        }
    }

    /// Evaluate a bare expression, keeping its native type.
    ///
    /// Text that does not parse is returned as a literal string unless it
    /// looks hostile, in which case it is blocked.
    pub fn evaluate(&self, source: &str, scope: &EvalScope<'_>) -> Evaluation {
        let source = source.trim();
        if source.is_empty() {
            return Evaluation::Value(JsonValue::Null);
        }
        match parse_expression(source) {
            Ok(expr) => {
                // Checked up front so short-circuited branches are covered too
                let result = match eval::find_denied(&expr) {
                    Some(reason) => Err(eval::Blocked(reason)),
                    None => eval::eval(&expr, scope),
                };
                match result {
                    Ok(value) => Evaluation::Value(value),
                    Err(eval::Blocked(reason)) => {
                        warn!(expression = %source, %reason, "Blocked expression");
                        Evaluation::Blocked(reason)
                    }
                }
            }
            Err(_) => match security::screen(source) {
                Some(reason) => {
                    warn!(expression = %source, %reason, "Blocked expression");
                    Evaluation::Blocked(reason)
                }
                None => Evaluation::Value(JsonValue::String(source.to_string())),
            },
        }
    }

    /// Evaluate a condition. Blocked conditions are false.
    pub fn evaluate_condition(&self, condition: &str, scope: &EvalScope<'_>) -> bool {
        let evaluation = if let Some(inner) = template::single_placeholder(condition) {
            template::expand_inner(self, inner, scope, 1)
        } else if condition.contains("{{") {
            let Some((source, bindings)) = template::bind_placeholders(self, condition, scope, 1)
            else {
                return false;
            };
            let mut variables = scope.variables.clone();
            variables.extend(bindings);
            let bound = EvalScope::new(&variables).with_pseudo(scope.pseudo.clone());
            self.evaluate(&source, &bound)
        } else {
            self.evaluate(condition, scope)
        };
        match evaluation {
            Evaluation::Value(value) => is_truthy(&value),
            Evaluation::Blocked(_) => false,
        }
    }

    /// Render every `{{expr}}` placeholder in `template` into a string
    pub fn interpolate(&self, template: &str, scope: &EvalScope<'_>) -> String {
        if !template.contains("{{") {
            return template.to_string();
        }
        template::render(self, template, scope, 1).text
    }

    /// Resolve a step value. A string that is exactly one placeholder keeps
    /// the native type of its result; arrays and objects resolve element-wise.
    pub fn resolve_value(&self, value: &JsonValue, scope: &EvalScope<'_>) -> JsonValue {
        match value {
            JsonValue::String(s) => {
                if let Some(inner) = template::single_placeholder(s) {
                    match template::expand_inner(self, inner, scope, 1) {
                        Evaluation::Value(value) => value,
                        Evaluation::Blocked(reason) if reason == template::TOO_DEEP => {
                            JsonValue::String(reason)
                        }
                        Evaluation::Blocked(_) => {
                            JsonValue::String(format!("[blocked: {}]", inner.trim()))
                        }
                    }
                } else if s.contains("{{") {
                    JsonValue::String(self.interpolate(s, scope))
                } else {
                    value.clone()
                }
            }
            JsonValue::Array(items) => JsonValue::Array(
                items
                    .iter()
                    .map(|item| self.resolve_value(item, scope))
                    .collect(),
            ),
            JsonValue::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v, scope)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}
