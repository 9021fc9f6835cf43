// SPDX-License-Identifier: MIT

//! Task guard expressions
//!
//! A guard decides at run time whether a task executes. Grammar:
//!
//! ```text
//! expr    := and ("or" and)*
//! and     := unary ("and" unary)*
//! unary   := "not" unary | primary
//! primary := "(" expr ")" | "true" | "false" | path [op literal]
//! op      := == | != | > | >= | < | <= | contains
//! ```
//!
//! A bare path is true when the value exists and is not empty, zero, false
//! or null.

use super::state::RunState;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Compare {
        path: String,
        op: CompareOp,
        value: Literal,
    },
    Truthy(String),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    Constant(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::NotEq => "!=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Contains => "contains",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Str(String),
    Num(f64),
    Op(CompareOp),
    And,
    Or,
    Not,
    True,
    False,
    Null,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == c)
                    .ok_or_else(|| format!("unterminated string at {}", i))?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('=', Some('=')) => (CompareOp::Eq, 2),
                    ('!', Some('=')) => (CompareOp::NotEq, 2),
                    ('>', Some('=')) => (CompareOp::Gte, 2),
                    ('<', Some('=')) => (CompareOp::Lte, 2),
                    ('>', _) => (CompareOp::Gt, 1),
                    ('<', _) => (CompareOp::Lt, 1),
                    _ => return Err(format!("unexpected '{}' at {}", c, i)),
                };
                tokens.push(Token::Op(op));
                i += width;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", text))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '-'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "contains" => Token::Op(CompareOp::Contains),
                    _ => Token::Path(word),
                });
            }
            other => return Err(format!("unexpected '{}' at {}", other, i)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn or_expr(&mut self) -> Result<Expression, String> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expression::Or(Box::new(left), Box::new(self.and_expr()?));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expression, String> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expression::And(Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expression, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expression::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expression, String> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(Token::True) => Ok(Expression::Constant(true)),
            Some(Token::False) => Ok(Expression::Constant(false)),
            Some(Token::Path(path)) => {
                let Some(Token::Op(op)) = self.peek().cloned() else {
                    return Ok(Expression::Truthy(path));
                };
                self.pos += 1;
                let value = match self.next() {
                    Some(Token::Str(s)) => Literal::String(s),
                    Some(Token::Num(n)) => Literal::Number(n),
                    Some(Token::True) => Literal::Boolean(true),
                    Some(Token::False) => Literal::Boolean(false),
                    Some(Token::Null) => Literal::Null,
                    other => return Err(format!("expected a literal after '{}', found {:?}", op, other)),
                };
                Ok(Expression::Compare { path, op, value })
            }
            other => Err(format!("unexpected token {:?}", other)),
        }
    }
}

/// Parse a guard expression
pub fn parse(input: &str) -> Result<Expression, String> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err("empty condition".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or_expr()?;
    if let Some(extra) = parser.peek() {
        return Err(format!("unexpected trailing token {:?}", extra));
    }
    Ok(expr)
}

/// Evaluate a guard against the current run state
pub fn evaluate(expr: &Expression, state: &RunState) -> bool {
    match expr {
        Expression::Constant(b) => *b,
        Expression::Truthy(path) => is_truthy(state.get_path(path)),
        Expression::Compare { path, op, value } => compare(state.get_path(path), *op, value),
        Expression::And(l, r) => evaluate(l, state) && evaluate(r, state),
        Expression::Or(l, r) => evaluate(l, state) || evaluate(r, state),
        Expression::Not(inner) => !evaluate(inner, state),
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

/// Numbers written by models often arrive as text.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn equals(left: Option<&Value>, right: &Literal) -> bool {
    match (left, right) {
        (None | Some(Value::Null), Literal::Null) => true,
        (None, _) => false,
        (Some(Value::String(s)), Literal::String(r)) => s.trim() == r,
        (Some(v), Literal::Number(r)) => as_number(v).is_some_and(|f| (f - r).abs() < f64::EPSILON),
        (Some(Value::Bool(b)), Literal::Boolean(r)) => b == r,
        _ => false,
    }
}

fn compare(left: Option<&Value>, op: CompareOp, right: &Literal) -> bool {
    let ordered = |cmp: fn(f64, f64) -> bool| match (left.and_then(as_number), right) {
        (Some(l), Literal::Number(r)) => cmp(l, *r),
        _ => false,
    };
    match op {
        CompareOp::Eq => equals(left, right),
        CompareOp::NotEq => !equals(left, right),
        CompareOp::Gt => ordered(|a, b| a > b),
        CompareOp::Gte => ordered(|a, b| a >= b),
        CompareOp::Lt => ordered(|a, b| a < b),
        CompareOp::Lte => ordered(|a, b| a <= b),
        CompareOp::Contains => match (left, right) {
            (Some(Value::String(s)), Literal::String(sub)) => s.contains(sub.as_str()),
            (Some(Value::Array(items)), lit) => items.iter().any(|v| equals(Some(v), lit)),
            _ => false,
        },
    }
}
