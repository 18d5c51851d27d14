//! Relay filters: predicates over a signal payload that decide the boolean
//! value a door input contributes to its formula.
//!
//! Conditions are a small comparison language over the payload's JSON value:
//! - Field access: dot notation (`order.total`, `status`); `$` is the whole value
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - Logical: `&&`, `||`, `!`, parentheses
//! - Literals: string (single or double quoted), number, bool, null
//!
//! Conditions compile once at door registration. Evaluation never fails:
//! missing fields, type mismatches and absent payloads all read as `false`.

use serde_json::Value;

use crate::errors::ExpressionError;
use crate::types::{Payload, RelayFilterDefinition};

/// Maximum parenthesis / negation depth of a relay condition.
pub const MAX_CONDITION_DEPTH: usize = 64;

/// A compiled relay filter: optional payload type guard plus optional condition.
#[derive(Debug, Clone)]
pub struct RelayFilter {
    payload_type: Option<String>,
    condition: Option<RelayCondition>,
}

impl RelayFilter {
    /// Compile a filter definition.
    pub fn compile(definition: &RelayFilterDefinition) -> Result<Self, ExpressionError> {
        let condition = match definition.condition.as_deref() {
            Some(text) if !text.trim().is_empty() => Some(RelayCondition::compile(text)?),
            _ => None,
        };
        Ok(Self {
            payload_type: definition.payload_type.clone(),
            condition,
        })
    }

    /// Apply the filter to a message payload.
    ///
    /// A missing payload, a payload of a different type tag, or a condition
    /// that does not hold all yield `false`.
    pub fn evaluate(&self, payload: Option<&Payload>) -> bool {
        let Some(payload) = payload else {
            return false;
        };
        if let Some(expected) = &self.payload_type {
            if payload.type_tag() != expected {
                return false;
            }
        }
        match &self.condition {
            Some(condition) => condition.matches(payload.value()),
            None => true,
        }
    }
}

/// A compiled relay condition.
#[derive(Debug, Clone)]
pub struct RelayCondition {
    root: Expr,
}

impl RelayCondition {
    /// Parse `text` into an evaluable condition.
    pub fn compile(text: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Parse {
                message: "empty expression".into(),
            });
        }
        let (root, rest) = parse_or(&tokens, 0)?;
        if let Some(tok) = rest.first() {
            return Err(ExpressionError::Parse {
                message: format!("unexpected token: {tok:?}"),
            });
        }
        Ok(Self { root })
    }

    /// Evaluate against a JSON value.
    pub fn matches(&self, data: &Value) -> bool {
        self.root.eval(data)
    }
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(Vec<String>),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Cmp(CompOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    let two = |i: usize, c: char| chars.get(i + 1).copied() == Some(c);

    while i < chars.len() {
        let (token, width) = match chars[i] {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            '=' if two(i, '=') => (Token::Cmp(CompOp::Eq), 2),
            '!' if two(i, '=') => (Token::Cmp(CompOp::Ne), 2),
            '!' => (Token::Not, 1),
            '>' if two(i, '=') => (Token::Cmp(CompOp::Ge), 2),
            '>' => (Token::Cmp(CompOp::Gt), 1),
            '<' if two(i, '=') => (Token::Cmp(CompOp::Le), 2),
            '<' => (Token::Cmp(CompOp::Lt), 1),
            '&' if two(i, '&') => (Token::And, 2),
            '|' if two(i, '|') => (Token::Or, 2),
            quote @ ('"' | '\'') => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|c| *c == quote)
                    .map(|off| start + off)
                    .ok_or_else(|| ExpressionError::Parse {
                        message: "unterminated string literal".into(),
                    })?;
                let literal: String = chars[start..end].iter().collect();
                (Token::Str(literal), end + 1 - i)
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                let mut end = i + 1;
                while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == '.') {
                    end += 1;
                }
                let text: String = chars[start..end].iter().collect();
                let num = text.parse().map_err(|_| ExpressionError::Parse {
                    message: format!("invalid number: {text}"),
                })?;
                (Token::Num(num), end - start)
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                let mut end = i + 1;
                while end < chars.len()
                    && (chars[end].is_ascii_alphanumeric() || chars[end] == '_' || chars[end] == '.')
                {
                    end += 1;
                }
                let ident: String = chars[start..end].iter().collect();
                let token = match ident.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    _ => Token::Path(split_path(&ident)?),
                };
                (token, end - start)
            }
            other => {
                return Err(ExpressionError::Parse {
                    message: format!("unexpected character: {other}"),
                });
            }
        };
        tokens.push(token);
        i += width;
    }
    Ok(tokens)
}

fn split_path(ident: &str) -> Result<Vec<String>, ExpressionError> {
    let trimmed = match ident.strip_prefix('$') {
        Some("") => return Ok(Vec::new()),
        Some(rest) => rest.strip_prefix('.').unwrap_or(rest),
        None => ident,
    };
    let segments: Vec<String> = trimmed.split('.').map(str::to_string).collect();
    if segments.iter().any(|s| s.is_empty() || s.contains('$')) {
        return Err(ExpressionError::Parse {
            message: format!("invalid field path: {ident}"),
        });
    }
    Ok(segments)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expr {
    Any(Vec<Expr>),
    All(Vec<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CompOp, Operand),
    Truthy(Operand),
}

#[derive(Debug, Clone)]
enum Operand {
    Path(Vec<String>),
    Literal(Value),
}

impl Expr {
    fn eval(&self, data: &Value) -> bool {
        match self {
            Expr::Any(items) => items.iter().any(|e| e.eval(data)),
            Expr::All(items) => items.iter().all(|e| e.eval(data)),
            Expr::Not(inner) => !inner.eval(data),
            Expr::Compare(l, op, r) => compare(&l.resolve(data), &r.resolve(data), *op),
            Expr::Truthy(operand) => truthy(&operand.resolve(data)),
        }
    }
}

impl Operand {
    fn resolve(&self, data: &Value) -> Value {
        match self {
            Operand::Literal(v) => v.clone(),
            Operand::Path(segments) => {
                let mut current = data;
                for segment in segments {
                    match current.get(segment.as_str()) {
                        Some(v) => current = v,
                        None => return Value::Null,
                    }
                }
                current.clone()
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn compare(left: &Value, right: &Value, op: CompOp) -> bool {
    if left.is_null() || right.is_null() {
        let both_null = left.is_null() && right.is_null();
        return match op {
            CompOp::Eq => both_null,
            CompOp::Ne => !both_null,
            _ => false,
        };
    }

    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        let equal = (l - r).abs() < f64::EPSILON;
        return match op {
            CompOp::Eq => equal,
            CompOp::Ne => !equal,
            CompOp::Gt => l > r,
            CompOp::Lt => l < r,
            CompOp::Ge => l > r || equal,
            CompOp::Le => l < r || equal,
        };
    }

    if let (Some(l), Some(r)) = (left.as_str(), right.as_str()) {
        return match op {
            CompOp::Eq => l == r,
            CompOp::Ne => l != r,
            CompOp::Gt => l > r,
            CompOp::Lt => l < r,
            CompOp::Ge => l >= r,
            CompOp::Le => l <= r,
        };
    }

    match op {
        CompOp::Eq => left == right,
        CompOp::Ne => left != right,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Recursive descent parser: ! > comparison > && > ||
//
// `depth` counts open parentheses and negations; `&&` / `||` runs are
// collected flat.
// ---------------------------------------------------------------------------

type ParseResult<'a> = Result<(Expr, &'a [Token]), ExpressionError>;

fn parse_or(tokens: &[Token], depth: usize) -> ParseResult<'_> {
    let (first, mut rest) = parse_and(tokens, depth)?;
    let mut items = vec![first];
    while rest.first() == Some(&Token::Or) {
        let (next, r) = parse_and(&rest[1..], depth)?;
        items.push(next);
        rest = r;
    }
    Ok((flatten(items, Expr::Any), rest))
}

fn parse_and(tokens: &[Token], depth: usize) -> ParseResult<'_> {
    let (first, mut rest) = parse_not(tokens, depth)?;
    let mut items = vec![first];
    while rest.first() == Some(&Token::And) {
        let (next, r) = parse_not(&rest[1..], depth)?;
        items.push(next);
        rest = r;
    }
    Ok((flatten(items, Expr::All), rest))
}

fn flatten(mut items: Vec<Expr>, group: fn(Vec<Expr>) -> Expr) -> Expr {
    if items.len() == 1 {
        items.remove(0)
    } else {
        group(items)
    }
}

fn enter(depth: usize) -> Result<usize, ExpressionError> {
    if depth >= MAX_CONDITION_DEPTH {
        return Err(ExpressionError::Parse {
            message: format!("condition nesting exceeds {MAX_CONDITION_DEPTH} levels"),
        });
    }
    Ok(depth + 1)
}

fn parse_not(tokens: &[Token], depth: usize) -> ParseResult<'_> {
    match tokens.first() {
        Some(Token::Not) => {
            let (inner, rest) = parse_not(&tokens[1..], enter(depth)?)?;
            Ok((Expr::Not(Box::new(inner)), rest))
        }
        Some(Token::LParen) => {
            let (inner, rest) = parse_or(&tokens[1..], enter(depth)?)?;
            match rest.first() {
                Some(Token::RParen) => Ok((inner, &rest[1..])),
                _ => Err(ExpressionError::Parse {
                    message: "missing closing parenthesis".into(),
                }),
            }
        }
        _ => parse_comparison(tokens),
    }
}

fn parse_comparison(tokens: &[Token]) -> ParseResult<'_> {
    let (left, rest) = parse_operand(tokens)?;
    match rest.first() {
        Some(Token::Cmp(op)) => {
            let (right, rest) = parse_operand(&rest[1..])?;
            Ok((Expr::Compare(left, *op, right), rest))
        }
        _ => Ok((Expr::Truthy(left), rest)),
    }
}

fn parse_operand(tokens: &[Token]) -> Result<(Operand, &[Token]), ExpressionError> {
    let Some(first) = tokens.first() else {
        return Err(ExpressionError::Parse {
            message: "unexpected end of expression".into(),
        });
    };
    let operand = match first {
        Token::Path(segments) => Operand::Path(segments.clone()),
        Token::Str(s) => Operand::Literal(Value::String(s.clone())),
        Token::Num(n) => Operand::Literal(
            serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number),
        ),
        Token::Bool(b) => Operand::Literal(Value::Bool(*b)),
        Token::Null => Operand::Literal(Value::Null),
        other => {
            return Err(ExpressionError::Parse {
                message: format!("expected value, got {other:?}"),
            })
        }
    };
    Ok((operand, &tokens[1..]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
