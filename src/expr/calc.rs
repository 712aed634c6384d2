//! Infix arithmetic parser
//!
//! Parses expressions like `"ii / i"` or `"(a + b) * 0.5"` into a tree of
//! binary arithmetic over field references and constants. Identifiers may
//! be bare (`latency_ms`) or quoted (`"a"`, `'a'`). The result still needs
//! to be wrapped in an aggregator to pass validation.

use super::{binary, constant, field, BinaryOp, Expr};
use crate::error::{CadenceError, Result};

/// Parse an infix arithmetic expression into an expression tree
pub fn calc(input: &str) -> Result<Expr> {
    let mut parser = Parser {
        input: input.as_bytes(),
        pos: 0,
    };
    let expr = parser.parse_expr()?;
    parser.skip_whitespace();
    if parser.pos != parser.input.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    // expr := term (('+' | '-') term)*
    fn parse_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_term()?;
        loop {
            self.skip_whitespace();
            let op = match self.peek() {
                Some(b'+') => BinaryOp::Add,
                Some(b'-') => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_term()?;
            left = binary(op, left, right);
        }
    }

    // term := factor (('*' | '/') factor)*
    fn parse_term(&mut self) -> Result<Expr> {
        let mut left = self.parse_factor()?;
        loop {
            self.skip_whitespace();
            let op = match self.peek() {
                Some(b'*') => BinaryOp::Mult,
                Some(b'/') => BinaryOp::Div,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_factor()?;
            left = binary(op, left, right);
        }
    }

    // factor := number | ident | quoted ident | '(' expr ')'
    fn parse_factor(&mut self) -> Result<Expr> {
        self.skip_whitespace();
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let inner = self.parse_expr()?;
                self.skip_whitespace();
                if self.peek() != Some(b')') {
                    return Err(self.error("expected closing parenthesis"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(quote @ (b'"' | b'\'')) => {
                self.pos += 1;
                let start = self.pos;
                while self.peek().is_some() && self.peek() != Some(quote) {
                    self.pos += 1;
                }
                if self.peek() != Some(quote) {
                    return Err(self.error("unterminated quoted identifier"));
                }
                let name = self.slice(start, self.pos)?;
                self.pos += 1;
                Ok(field(name))
            }
            Some(c) if c.is_ascii_digit() || c == b'.' || c == b'-' => self.parse_number(),
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
                    self.pos += 1;
                }
                Ok(field(self.slice(start, self.pos)?))
            }
            _ => Err(self.error("expected number, identifier or parenthesis")),
        }
    }

    fn parse_number(&mut self) -> Result<Expr> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == b'.') {
            self.pos += 1;
        }
        let text = self.slice(start, self.pos)?;
        let v: f64 = text
            .parse()
            .map_err(|_| self.error("invalid numeric literal"))?;
        Ok(constant(v))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn slice(&self, start: usize, end: usize) -> Result<&'a str> {
        std::str::from_utf8(&self.input[start..end])
            .map_err(|_| CadenceError::Expr("expression must be valid UTF-8".to_string()))
    }

    fn error(&self, message: &str) -> CadenceError {
        CadenceError::Expr(format!("{} at offset {}", message, self.pos))
    }
}
