//! PEST-based parser for template expressions
//!
//! Produces the `Expr` AST consumed by `eval`. Anything the grammar does not
//! accept is rejected here, which is what keeps evaluation safe: there is no
//! syntax for assignment, loops, object construction or statements.

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use serde_json::Value as JsonValue;
use thiserror::Error;

use super::ast::{BinaryOp, Expr, LogicalOp, PathSegment, UnaryOp};
use super::value::number_value;

/* ===================== PEST Parser ===================== */

#[derive(Parser)]
#[grammar = "expression/expression.pest"]
struct ExpressionParser;

/* ===================== Error Types ===================== */

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{0}")]
    Pest(String),
    #[error("{0}")]
    Build(String),
}

impl From<pest::error::Error<Rule>> for ParseError {
    fn from(err: pest::error::Error<Rule>) -> Self {
        ParseError::Pest(err.to_string())
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/* ===================== Public API ===================== */

/// Parse a single expression (the text between `{{` and `}}`, or a CASE condition)
pub fn parse_expression(source: &str) -> ParseResult<Expr> {
    let mut pairs = ExpressionParser::parse(Rule::expression, source)?;
    let expression = next_pair(&mut pairs, "expression")?;
    let mut inner = expression.into_inner();
    build_expression(next_pair(&mut inner, "expression body")?)
}

/* ===================== AST Builder ===================== */

fn next_pair<'i>(
    pairs: &mut impl Iterator<Item = Pair<'i, Rule>>,
    what: &str,
) -> ParseResult<Pair<'i, Rule>> {
    pairs
        .next()
        .ok_or_else(|| ParseError::Build(format!("Missing {}", what)))
}

fn build_expression(pair: Pair<Rule>) -> ParseResult<Expr> {
    match pair.as_rule() {
        Rule::ternary => {
            // ternary = { logical_or ~ ("?" ~ ternary ~ ":" ~ ternary)? }
            let mut inner = pair.into_inner();
            let test = build_expression(next_pair(&mut inner, "condition")?)?;
            match (inner.next(), inner.next()) {
                (Some(then_pair), Some(else_pair)) => Ok(Expr::Ternary {
                    test: Box::new(test),
                    then_e: Box::new(build_expression(then_pair)?),
                    else_e: Box::new(build_expression(else_pair)?),
                }),
                _ => Ok(test),
            }
        }
        Rule::logical_or | Rule::logical_and => {
            let op = if pair.as_rule() == Rule::logical_or {
                LogicalOp::Or
            } else {
                LogicalOp::And
            };
            let mut inner = pair.into_inner();
            let mut expr = build_expression(next_pair(&mut inner, "operand")?)?;
            // Operators and operands alternate; fold left-to-right
            while inner.next().is_some() {
                let right = build_expression(next_pair(&mut inner, "right operand")?)?;
                expr = Expr::Logical {
                    op,
                    left: Box::new(expr),
                    right: Box::new(right),
                };
            }
            Ok(expr)
        }
        Rule::comparison | Rule::additive | Rule::multiplicative => {
            let mut inner = pair.into_inner();
            let mut expr = build_expression(next_pair(&mut inner, "operand")?)?;
            while let Some(op_pair) = inner.next() {
                let op = BinaryOp::from_symbol(op_pair.as_str()).ok_or_else(|| {
                    ParseError::Build(format!("Unknown operator '{}'", op_pair.as_str()))
                })?;
                let right = build_expression(next_pair(&mut inner, "right operand")?)?;
                expr = Expr::Binary {
                    op,
                    left: Box::new(expr),
                    right: Box::new(right),
                };
            }
            Ok(expr)
        }
        Rule::unary => {
            // unary = { prefix_op* ~ primary }
            let mut ops = Vec::new();
            let mut operand = None;
            for child in pair.into_inner() {
                if child.as_rule() == Rule::prefix_op {
                    ops.push(if child.as_str() == "!" {
                        UnaryOp::Not
                    } else {
                        UnaryOp::Neg
                    });
                } else {
                    operand = Some(build_expression(child)?);
                }
            }
            let mut expr =
                operand.ok_or_else(|| ParseError::Build("Missing operand".to_string()))?;
            for op in ops.into_iter().rev() {
                expr = Expr::Unary {
                    op,
                    operand: Box::new(expr),
                };
            }
            Ok(expr)
        }
        Rule::call => {
            // call = { path ~ "(" ~ arguments? ~ ")" }
            let mut inner = pair.into_inner();
            let name = next_pair(&mut inner, "callee")?.as_str().to_string();
            let args = match inner.next() {
                Some(arguments) => arguments
                    .into_inner()
                    .map(build_expression)
                    .collect::<ParseResult<Vec<_>>>()?,
                None => Vec::new(),
            };
            Ok(Expr::Call { name, args })
        }
        Rule::path => build_path(pair),
        Rule::number => {
            let text = pair.as_str();
            let value: f64 = text.parse().map_err(|e| {
                ParseError::Build(format!("Failed to parse number '{}': {}", text, e))
            })?;
            Ok(Expr::Literal(number_value(value)))
        }
        Rule::string => Ok(Expr::Literal(JsonValue::String(build_string(pair)?))),
        Rule::boolean => Ok(Expr::Literal(JsonValue::Bool(pair.as_str() == "true"))),
        Rule::null_lit | Rule::undefined_lit => Ok(Expr::Literal(JsonValue::Null)),
        _ => Err(ParseError::Build(format!(
            "Unexpected expression rule: {:?}",
            pair.as_rule()
        ))),
    }
}

fn build_path(pair: Pair<Rule>) -> ParseResult<Expr> {
    // path = ${ identifier ~ accessor* }
    let mut inner = pair.into_inner();
    let root = next_pair(&mut inner, "path root")?.as_str().to_string();
    let mut segments = Vec::new();
    for segment in inner {
        match segment.as_rule() {
            Rule::identifier => segments.push(PathSegment::Key(segment.as_str().to_string())),
            Rule::index => {
                let idx = segment.as_str().parse::<usize>().map_err(|e| {
                    ParseError::Build(format!("Invalid index '{}': {}", segment.as_str(), e))
                })?;
                segments.push(PathSegment::Index(idx));
            }
            Rule::string => segments.push(PathSegment::Key(build_string(segment)?)),
            other => {
                return Err(ParseError::Build(format!(
                    "Unexpected path segment: {:?}",
                    other
                )))
            }
        }
    }
    Ok(Expr::Path { root, segments })
}

fn build_string(pair: Pair<Rule>) -> ParseResult<String> {
    // string = ${ "\"" ~ dq_inner ~ "\"" | "'" ~ sq_inner ~ "'" }
    let content = pair
        .into_inner()
        .next()
        .map(|p| p.as_str())
        .unwrap_or_default();
    Ok(unescape(content))
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
