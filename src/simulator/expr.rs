//! Arithmetic over deferred attribute expressions
//!
//! Supports numbers, global variable names, `+ - * /` and parentheses,
//! which covers the expressions produced when varying an attribute
//! definition, e.g. `(kq1) + (0.0001)` or `(k0 * 2) * (1 + (-0.01))`.

use std::{iter::Peekable, str::Chars};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    Open,
    Close,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, String> {
    let mut tokens = vec![];
    let mut chars = expr.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' | '.' => tokens.push(Token::Number(number(&mut chars)?)),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        ident.push(c.to_ascii_lowercase());
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(c));
                chars.next();
            }
            '(' => {
                tokens.push(Token::Open);
                chars.next();
            }
            ')' => {
                tokens.push(Token::Close);
                chars.next();
            }
            _ => return Err(format!("unexpected character `{}`", c)),
        }
    }
    Ok(tokens)
}

fn number(chars: &mut Peekable<Chars<'_>>) -> Result<f64, String> {
    let mut s = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() || c == '.' {
            s.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if let Some(&e) = chars.peek() {
        if e == 'e' || e == 'E' {
            s.push(e);
            chars.next();
            if let Some(&sign) = chars.peek() {
                if sign == '+' || sign == '-' {
                    s.push(sign);
                    chars.next();
                }
            }
            while let Some(&c) = chars.peek() {
                if c.is_ascii_digit() {
                    s.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
        }
    }
    s.parse().map_err(|_| format!("invalid number `{}`", s))
}

struct Parser<'a, F> {
    tokens: &'a [Token],
    pos: usize,
    lookup: &'a F,
}

impl<'a, F: Fn(&str) -> f64> Parser<'a, F> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }
    fn next(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }
    fn expr(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            if op == '+' {
                value += rhs
            } else {
                value -= rhs
            }
        }
        Ok(value)
    }
    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.factor()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.factor()?;
            if op == '*' {
                value *= rhs
            } else {
                value /= rhs
            }
        }
        Ok(value)
    }
    fn factor(&mut self) -> Result<f64, String> {
        match self.next().cloned() {
            Some(Token::Op('-')) => Ok(-self.factor()?),
            Some(Token::Op('+')) => self.factor(),
            Some(Token::Number(value)) => Ok(value),
            Some(Token::Ident(name)) => Ok((self.lookup)(&name)),
            Some(Token::Open) => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(value),
                    _ => Err("missing `)`".into()),
                }
            }
            Some(t) => Err(format!("unexpected token {:?}", t)),
            None => Err("unexpected end of expression".into()),
        }
    }
}

/// Evaluates `expr`, resolving variable names with `lookup`
pub fn evaluate<F: Fn(&str) -> f64>(expr: &str, lookup: &F) -> Result<f64, String> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        lookup,
    };
    let value = parser.expr()?;
    if parser.pos != tokens.len() {
        return Err(format!("trailing input after token #{}", parser.pos));
    }
    Ok(value)
}

/// Lower-cased variable names referenced by `expr`, in order of appearance
pub fn identifiers(expr: &str) -> Vec<String> {
    let mut names: Vec<String> = vec![];
    for token in tokenize(expr).unwrap_or_default() {
        if let Token::Ident(name) = token {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}
