//! Boolean formula compiler and evaluator for door logic.
//!
//! Grammar (whitespace-insensitive):
//!
//! ```text
//! expr    = and ( ("|" | "^") and )*
//! and     = unary ( "&" unary )*
//! unary   = "!" unary | primary
//! primary = IDENT | "(" expr ")"
//! ```
//!
//! `|` and `^` share one precedence level and fold left to right in the
//! order they appear, so `A | B ^ C` is `(A | B) ^ C` and `A ^ B | C` is
//! `(A ^ B) | C`. `&` binds tighter than both, `!` tighter still.
//!
//! Variable names are matched case-insensitively against the declared list.
//! Compilation resolves every name to its position in that list, so
//! evaluation is a pure walk over a positional `&[bool]`.

use std::fmt;

use crate::errors::FormulaError;

/// Maximum parenthesis / negation depth accepted by the compiler.
///
/// Runs of `&`, `|` and `^` do not add depth, so this also bounds the
/// recursion of evaluation.
pub const MAX_NESTING: usize = 128;

/// An immutable, compiled boolean formula.
///
/// Cheap to clone and safe to evaluate from any number of threads at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFormula {
    text: String,
    variables: Vec<String>,
    root: Node,
}

// Operator runs are kept flat so the tree only gets deeper through
// parentheses and `!`, both bounded by `MAX_NESTING`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Var(usize),
    Not(Box<Node>),
    All(Vec<Node>),
    /// Left fold of `|` / `^` over the first operand.
    Chain(Box<Node>, Vec<(ChainOp, Node)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainOp {
    Or,
    Xor,
}

impl CompiledFormula {
    /// Compile `text` over the ordered list of declared variable names.
    ///
    /// Fails if the text is empty or malformed, if it references a name not
    /// in `variables`, or if `variables` itself contains invalid or
    /// duplicate names.
    pub fn compile<S: AsRef<str>>(text: &str, variables: &[S]) -> Result<Self, FormulaError> {
        let declared = declare(variables)?;
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(FormulaError::Empty);
        }

        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            depth: 0,
            declared: &declared,
        };
        let root = parser.expr()?;
        if let Some(tok) = parser.peek() {
            return Err(match tok.kind {
                TokenKind::RParen => FormulaError::UnbalancedParentheses {
                    position: tok.position,
                },
                _ => FormulaError::UnexpectedToken {
                    position: tok.position,
                    found: tok.kind.to_string(),
                },
            });
        }

        Ok(Self {
            text: text.to_string(),
            variables: declared,
            root,
        })
    }

    /// Evaluate against values aligned positionally with [`variables()`](Self::variables).
    pub fn evaluate(&self, values: &[bool]) -> Result<bool, FormulaError> {
        if values.len() != self.variables.len() {
            return Err(FormulaError::ArityMismatch {
                expected: self.variables.len(),
                actual: values.len(),
            });
        }
        Ok(self.root.eval(values))
    }

    /// The declared variable names, in compile order.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Position of a declared variable, case-insensitively.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.variables
            .iter()
            .position(|v| v.eq_ignore_ascii_case(name))
    }

    /// The source text this formula was compiled from.
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for CompiledFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl Node {
    fn eval(&self, values: &[bool]) -> bool {
        match self {
            Node::Var(i) => values[*i],
            Node::Not(inner) => !inner.eval(values),
            Node::All(items) => items.iter().all(|n| n.eval(values)),
            Node::Chain(first, rest) => {
                rest.iter()
                    .fold(first.eval(values), |acc, (op, node)| match op {
                        ChainOp::Or => acc || node.eval(values),
                        ChainOp::Xor => acc ^ node.eval(values),
                    })
            }
        }
    }
}

/// Check that `name` is a legal identifier: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn declare<S: AsRef<str>>(variables: &[S]) -> Result<Vec<String>, FormulaError> {
    let mut declared: Vec<String> = Vec::with_capacity(variables.len());
    for name in variables {
        let name = name.as_ref();
        if !is_valid_variable_name(name) {
            return Err(FormulaError::InvalidVariableName {
                name: name.to_string(),
            });
        }
        if declared.iter().any(|d| d.eq_ignore_ascii_case(name)) {
            return Err(FormulaError::DuplicateVariable {
                name: name.to_string(),
            });
        }
        declared.push(name.to_string());
    }
    Ok(declared)
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Ident(String),
    Not,
    And,
    Or,
    Xor,
    LParen,
    RParen,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(name) => f.write_str(name),
            TokenKind::Not => f.write_str("!"),
            TokenKind::And => f.write_str("&"),
            TokenKind::Or => f.write_str("|"),
            TokenKind::Xor => f.write_str("^"),
            TokenKind::LParen => f.write_str("("),
            TokenKind::RParen => f.write_str(")"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, FormulaError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let kind = match chars[i] {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '!' => TokenKind::Not,
            '&' => TokenKind::And,
            '|' => TokenKind::Or,
            '^' => TokenKind::Xor,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(chars[start..i].iter().collect()),
                    position: start,
                });
                continue;
            }
            other => {
                return Err(FormulaError::InvalidCharacter {
                    position: i,
                    found: other,
                })
            }
        };
        tokens.push(Token { kind, position: i });
        i += 1;
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
    declared: &'a [String],
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn enter(&mut self) -> Result<(), FormulaError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(FormulaError::NestingTooDeep { limit: MAX_NESTING });
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Node, FormulaError> {
        let first = self.and()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Or) => ChainOp::Or,
                Some(TokenKind::Xor) => ChainOp::Xor,
                _ => break,
            };
            self.pos += 1;
            rest.push((op, self.and()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Node::Chain(Box::new(first), rest))
        }
    }

    fn and(&mut self) -> Result<Node, FormulaError> {
        let mut items = vec![self.unary()?];
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::And)) {
            self.pos += 1;
            items.push(self.unary()?);
        }
        if items.len() == 1 {
            Ok(items.remove(0))
        } else {
            Ok(Node::All(items))
        }
    }

    fn unary(&mut self) -> Result<Node, FormulaError> {
        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Not)) {
            self.pos += 1;
            self.enter()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Node, FormulaError> {
        let declared = self.declared;
        let tok = self.next().cloned().ok_or(FormulaError::UnexpectedEnd)?;
        match tok.kind {
            TokenKind::Ident(name) => declared
                .iter()
                .position(|d| d.eq_ignore_ascii_case(&name))
                .map(Node::Var)
                .ok_or(FormulaError::UnknownVariable { name }),
            TokenKind::LParen => {
                self.enter()?;
                let inner = self.expr()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => Ok(inner),
                    Some(other) => Err(FormulaError::UnexpectedToken {
                        position: other.position,
                        found: other.kind.to_string(),
                    }),
                    None => Err(FormulaError::UnbalancedParentheses {
                        position: tok.position,
                    }),
                }
            }
            TokenKind::RParen => Err(FormulaError::UnbalancedParentheses {
                position: tok.position,
            }),
            other => Err(FormulaError::UnexpectedToken {
                position: tok.position,
                found: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
