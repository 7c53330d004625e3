//! Sequence-flow conditions.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! or      := and ("||" and)*
//! and     := unary ("&&" unary)*
//! unary   := "!" unary | primary
//! primary := "(" or ")" | operand (cmp operand)?
//! cmp     := "==" | "!=" | ">=" | "<=" | ">" | "<"
//! operand := identifier | number | 'string' | "string" | true | false | null
//! ```
//!
//! Identifiers may be dotted (`order.total`) to reach into nested objects.

use crate::types::Variables;
use serde_json::Value;
use std::cmp::Ordering;

/// Deepest `!`/`(` nesting a condition may use
const MAX_NESTING: usize = 64;
/// Longest condition, in tokens; bounds `&&`/`||` chains
const MAX_TOKENS: usize = 1024;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

/// Side of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Var(String),
    Literal(Value),
}

/// Parsed condition expression
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Or(Box<Condition>, Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    Compare {
        left: Operand,
        op: CmpOp,
        right: Operand,
    },
    Truthy(Operand),
}

impl Condition {
    /// Parse an expression; errors describe the offending input
    pub fn parse(expr: &str) -> Result<Self, String> {
        let tokens = tokenize(expr)?;
        if tokens.is_empty() {
            return Err("empty condition".to_string());
        }
        if tokens.len() > MAX_TOKENS {
            return Err(format!("condition has more than {MAX_TOKENS} tokens"));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let condition = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(format!("unexpected token {tok:?} in condition '{expr}'"));
        }
        Ok(condition)
    }

    pub fn evaluate(&self, variables: &Variables) -> bool {
        match self {
            Condition::Or(a, b) => a.evaluate(variables) || b.evaluate(variables),
            Condition::And(a, b) => a.evaluate(variables) && b.evaluate(variables),
            Condition::Not(inner) => !inner.evaluate(variables),
            Condition::Truthy(operand) => is_truthy(&operand.resolve(variables)),
            Condition::Compare { left, op, right } => {
                compare(&left.resolve(variables), *op, &right.resolve(variables))
            }
        }
    }
}

impl Operand {
    fn resolve(&self, variables: &Variables) -> Value {
        match self {
            Operand::Literal(value) => value.clone(),
            Operand::Var(name) => lookup(variables, name).unwrap_or(Value::Null),
        }
    }
}

fn lookup(variables: &Variables, name: &str) -> Option<Value> {
    if let Some(value) = variables.get(name) {
        return Some(value.clone());
    }

    let mut parts = name.split('.');
    let mut current = variables.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current.clone())
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_f64(), r.as_f64()) {
            (Some(l), Some(r)) => l.partial_cmp(&r),
            _ => None,
        },
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    };

    match op {
        CmpOp::Eq => ordering == Some(Ordering::Equal) || (ordering.is_none() && left == right),
        CmpOp::Ne => !(ordering == Some(Ordering::Equal) || (ordering.is_none() && left == right)),
        CmpOp::Gt => ordering == Some(Ordering::Greater),
        CmpOp::Lt => ordering == Some(Ordering::Less),
        CmpOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Lit(Value),
    Cmp(CmpOp),
    Not,
    And,
    Or,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Tok>, String> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Tok::RParen);
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(format!("expected '{c}{c}' at position {i}"));
                }
                tokens.push(if c == '&' { Tok::And } else { Tok::Or });
                i += 2;
            }
            '=' | '!' | '>' | '<' => {
                let eq_follows = chars.get(i + 1) == Some(&'=');
                let tok = match (c, eq_follows) {
                    ('=', true) => Tok::Cmp(CmpOp::Eq),
                    ('!', true) => Tok::Cmp(CmpOp::Ne),
                    ('>', true) => Tok::Cmp(CmpOp::Ge),
                    ('<', true) => Tok::Cmp(CmpOp::Le),
                    ('>', false) => Tok::Cmp(CmpOp::Gt),
                    ('<', false) => Tok::Cmp(CmpOp::Lt),
                    ('!', false) => Tok::Not,
                    _ => return Err(format!("single '=' at position {i}, use '=='")),
                };
                tokens.push(tok);
                i += if eq_follows { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(format!("unterminated string starting at position {i}"));
                }
                let text: String = chars[start..end].iter().collect();
                tokens.push(Tok::Lit(Value::String(text)));
                i = end + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number: Value = serde_json::from_str(&text)
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Tok::Lit(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Tok::Lit(Value::Bool(true)),
                    "false" => Tok::Lit(Value::Bool(false)),
                    "null" => Tok::Lit(Value::Null),
                    _ => Tok::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{other}' at position {i}")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T, String>) -> Result<T, String> {
        if self.depth >= MAX_NESTING {
            return Err(format!("condition nested deeper than {MAX_NESTING} levels"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn parse_or(&mut self) -> Result<Condition, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Tok::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Condition, String> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Tok::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Condition, String> {
        if self.peek() == Some(&Tok::Not) {
            self.pos += 1;
            let inner = self.nested(Self::parse_unary)?;
            return Ok(Condition::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Condition, String> {
        if self.peek() == Some(&Tok::LParen) {
            self.pos += 1;
            let inner = self.nested(Self::parse_or)?;
            return match self.next() {
                Some(Tok::RParen) => Ok(inner),
                other => Err(format!("expected ')', found {other:?}")),
            };
        }

        let left = self.parse_operand()?;
        if let Some(Tok::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Condition::Compare { left, op, right });
        }
        Ok(Condition::Truthy(left))
    }

    fn parse_operand(&mut self) -> Result<Operand, String> {
        match self.next() {
            Some(Tok::Ident(name)) => Ok(Operand::Var(name)),
            Some(Tok::Lit(value)) => Ok(Operand::Literal(value)),
            other => Err(format!("expected operand, found {other:?}")),
        }
    }
}
