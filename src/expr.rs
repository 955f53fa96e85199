//! Closed expression language for declarative policies and triggers.
//!
//! Cost-control policies, degradation-ladder triggers, redirection rules, and
//! alert thresholds are all expressed as small boolean expressions over a
//! fixed vocabulary of metric names, rather than as ad-hoc string `eval`.
//! Grammar:
//!
//! ```text
//! expr       := or_expr
//! or_expr    := and_expr ("OR" and_expr)*
//! and_expr   := comparison ("AND" comparison)*
//! comparison := IDENT OP NUMBER
//! OP         := ">" | "<" | ">=" | "<=" | "==" | "!="
//! IDENT      := one of the fixed vocabulary below
//! ```

use hashbrown::HashMap;
use std::fmt;

use crate::error::{GovernorError, Result};

/// The closed set of metric names the expression language may reference.
pub const VOCABULARY: &[&str] = &[
    "latency_p99",
    "error_rate",
    "cpu_utilization",
    "memory_utilization",
    "throughput",
    "burn_rate",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl Op {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Op::Gt => lhs > rhs,
            Op::Lt => lhs < rhs,
            Op::Ge => lhs >= rhs,
            Op::Le => lhs <= rhs,
            Op::Eq => (lhs - rhs).abs() < f64::EPSILON,
            Op::Ne => (lhs - rhs).abs() >= f64::EPSILON,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Gt => ">",
            Op::Lt => "<",
            Op::Ge => ">=",
            Op::Le => "<=",
            Op::Eq => "==",
            Op::Ne => "!=",
        };
        write!(f, "{s}")
    }
}

/// A parsed boolean expression over the fixed metric vocabulary.
#[derive(Debug, Clone)]
pub enum Expr {
    /// `metric OP value`
    Comparison { metric: String, op: String, value: f64 },
    /// `lhs AND rhs`
    And(Box<Expr>, Box<Expr>),
    /// `lhs OR rhs`
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Evaluate this expression against a context of metric values.
    ///
    /// A metric absent from `context` evaluates its comparison to `false`
    /// rather than erroring, so partial contexts degrade gracefully.
    pub fn eval(&self, context: &HashMap<String, f64>) -> bool {
        match self {
            Expr::Comparison { metric, op, value } => {
                let Some(&lhs) = context.get(metric) else {
                    return false;
                };
                let op = parse_op(op).expect("parsed expressions carry only valid operators");
                op.apply(lhs, *value)
            }
            Expr::And(lhs, rhs) => lhs.eval(context) && rhs.eval(context),
            Expr::Or(lhs, rhs) => lhs.eval(context) || rhs.eval(context),
        }
    }
}

fn parse_op(s: &str) -> Option<Op> {
    match s {
        ">" => Some(Op::Gt),
        "<" => Some(Op::Lt),
        ">=" => Some(Op::Ge),
        "<=" => Some(Op::Le),
        "==" => Some(Op::Eq),
        "!=" => Some(Op::Ne),
        _ => None,
    }
}

struct Tokenizer<'a> {
    rest: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Op(String),
    Number(f64),
    And,
    Or,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self { rest: input }
    }

    fn tokens(mut self) -> Result<Vec<Token>> {
        let mut out = Vec::new();
        loop {
            self.rest = self.rest.trim_start();
            if self.rest.is_empty() {
                break;
            }
            if let Some(tail) = self.rest.strip_prefix(">=") {
                out.push(Token::Op(">=".to_string()));
                self.rest = tail;
            } else if let Some(tail) = self.rest.strip_prefix("<=") {
                out.push(Token::Op("<=".to_string()));
                self.rest = tail;
            } else if let Some(tail) = self.rest.strip_prefix("==") {
                out.push(Token::Op("==".to_string()));
                self.rest = tail;
            } else if let Some(tail) = self.rest.strip_prefix("!=") {
                out.push(Token::Op("!=".to_string()));
                self.rest = tail;
            } else if let Some(tail) = self.rest.strip_prefix('>') {
                out.push(Token::Op(">".to_string()));
                self.rest = tail;
            } else if let Some(tail) = self.rest.strip_prefix('<') {
                out.push(Token::Op("<".to_string()));
                self.rest = tail;
            } else if self.rest.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
                let end = self
                    .rest
                    .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
                    .unwrap_or(self.rest.len());
                let (num_str, tail) = self.rest.split_at(end);
                let value: f64 = num_str
                    .parse()
                    .map_err(|_| GovernorError::Expression(format!("invalid number: {num_str}")))?;
                out.push(Token::Number(value));
                self.rest = tail;
            } else if self.rest.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
                let end = self
                    .rest
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(self.rest.len());
                let (word, tail) = self.rest.split_at(end);
                self.rest = tail;
                match word {
                    "AND" => out.push(Token::And),
                    "OR" => out.push(Token::Or),
                    other => out.push(Token::Ident(other.to_string())),
                }
            } else {
                return Err(GovernorError::Expression(format!(
                    "unexpected character in expression: {:?}",
                    self.rest.chars().next()
                )));
            }
        }
        Ok(out)
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_comparison()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            let rhs = self.parse_comparison()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let metric = match self.next() {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(GovernorError::Expression(format!(
                    "expected metric identifier, got {other:?}"
                )))
            }
        };
        if !VOCABULARY.contains(&metric.as_str()) {
            return Err(GovernorError::Expression(format!("unknown metric: {metric}")));
        }

        let op = match self.next() {
            Some(Token::Op(op)) => op,
            other => return Err(GovernorError::Expression(format!("expected comparison operator, got {other:?}"))),
        };

        let value = match self.next() {
            Some(Token::Number(v)) => v,
            other => return Err(GovernorError::Expression(format!("expected numeric literal, got {other:?}"))),
        };

        Ok(Expr::Comparison { metric, op, value })
    }
}

/// Parse a closed-vocabulary boolean expression, e.g.
/// `"latency_p99 > 2000 AND error_rate > 0.05"`.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = Tokenizer::new(input).tokens()?;
    if tokens.is_empty() {
        return Err(GovernorError::Expression("empty expression".to_string()));
    }
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(GovernorError::Expression("trailing tokens after expression".to_string()));
    }
    Ok(expr)
}
