//! Arithmetic evaluator for `math.calculate`.
//!
//! Input is whitelisted to digits, `+ - * / ( )`, `.` and whitespace;
//! anything else is rejected before parsing. Recursive descent over
//! the usual precedence (factor > term > expression).

use pa_domain::{Error, Result};

pub fn evaluate(expression: &str) -> Result<f64> {
    if expression.trim().is_empty() {
        return Err(reject("empty expression"));
    }
    if let Some(bad) = expression
        .chars()
        .find(|c| !c.is_ascii_digit() && !"+-*/(). \t".contains(*c))
    {
        return Err(reject(&format!("character {bad:?} is not allowed")));
    }

    let tokens: Vec<char> = expression.chars().filter(|c| !c.is_whitespace()).collect();
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expression()?;
    if parser.pos != parser.tokens.len() {
        return Err(reject("trailing input"));
    }
    if !value.is_finite() {
        return Err(reject("result is not finite"));
    }
    Ok(value)
}

fn reject(message: &str) -> Error {
    Error::InternalServerError {
        message: format!("math.calculate: {message}"),
    }
}

struct Parser {
    tokens: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.tokens.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn expression(&mut self) -> Result<f64> {
        let mut value = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                '+' => {
                    self.bump();
                    value += self.term()?;
                }
                '-' => {
                    self.bump();
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek() {
            match op {
                '*' => {
                    self.bump();
                    value *= self.factor()?;
                }
                '/' => {
                    self.bump();
                    let divisor = self.factor()?;
                    if divisor == 0.0 {
                        return Err(reject("division by zero"));
                    }
                    value /= divisor;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<f64> {
        match self.peek() {
            Some('(') => {
                self.bump();
                let value = self.expression()?;
                if self.bump() != Some(')') {
                    return Err(reject("unbalanced parentheses"));
                }
                Ok(value)
            }
            Some('-') => {
                self.bump();
                Ok(-self.factor()?)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.number(),
            _ => Err(reject("expected a number")),
        }
    }

    fn number(&mut self) -> Result<f64> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
            self.bump();
        }
        let text: String = self.tokens[start..self.pos].iter().collect();
        text.parse::<f64>().map_err(|_| reject("bad number"))
    }
}
