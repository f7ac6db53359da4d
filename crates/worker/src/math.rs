//! Constrained arithmetic evaluator.
//!
//! Accepts numeric literals, `+ - * / ^` and parentheses. Anything else is
//! rejected while tokenizing, so evaluation can never reach beyond arithmetic.
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := ('+' | '-') unary | power
//! power   := primary ('^' unary)?
//! primary := NUMBER | '(' expr ')'
//! ```

use thiserror::Error;

/// Nesting limit for parentheses, unary signs and exponent chains.
const MAX_DEPTH: usize = 64;

/// Evaluation failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    /// Nothing to evaluate.
    #[error("empty expression")]
    Empty,

    /// Character outside the arithmetic alphabet.
    #[error("unexpected character '{ch}' at position {position}")]
    UnexpectedChar { ch: char, position: usize },

    /// Token in a place the grammar does not allow.
    #[error("unexpected token '{found}' at position {position}")]
    UnexpectedToken { found: String, position: usize },

    /// Input ended in the middle of an expression.
    #[error("unexpected end of expression")]
    UnexpectedEnd,

    /// Numeric literal could not be parsed.
    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    /// Division by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// Overflow or NaN.
    #[error("result is not a finite number")]
    NonFinite,

    /// Nesting exceeded the evaluator limit.
    #[error("expression nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
}

/// Evaluates `expression` followed by `operands`, joined with spaces.
pub fn evaluate_with(expression: &str, operands: &[String]) -> Result<f64, EvalError> {
    let joined = std::iter::once(expression)
        .chain(operands.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ");
    evaluate(&joined)
}

/// Evaluates a complete arithmetic expression.
pub fn evaluate(input: &str) -> Result<f64, EvalError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(EvalError::Empty);
    }

    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    if let Some(extra) = parser.peek() {
        return Err(extra.unexpected());
    }
    finite(value)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: Kind,
    position: usize,
}

impl Token {
    fn unexpected(&self) -> EvalError {
        let found = match self.kind {
            Kind::Number(n) => n.to_string(),
            Kind::Plus => "+".to_string(),
            Kind::Minus => "-".to_string(),
            Kind::Star => "*".to_string(),
            Kind::Slash => "/".to_string(),
            Kind::Caret => "^".to_string(),
            Kind::LParen => "(".to_string(),
            Kind::RParen => ")".to_string(),
        };
        EvalError::UnexpectedToken {
            found,
            position: self.position,
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, EvalError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (position, ch) = chars[i];
        let kind = match ch {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '0'..='9' | '.' => {
                let (literal, next) = scan_number(&chars, i);
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| EvalError::InvalidNumber(literal.clone()))?;
                tokens.push(Token {
                    kind: Kind::Number(value),
                    position,
                });
                i = next;
                continue;
            }
            '+' => Kind::Plus,
            '-' => Kind::Minus,
            '*' => Kind::Star,
            '/' => Kind::Slash,
            '^' => Kind::Caret,
            '(' => Kind::LParen,
            ')' => Kind::RParen,
            other => return Err(EvalError::UnexpectedChar { ch: other, position }),
        };
        tokens.push(Token { kind, position });
        i += 1;
    }

    Ok(tokens)
}

/// Scans `digits ['.' digits] [eE [+-] digits]` starting at `start`.
fn scan_number(chars: &[(usize, char)], start: usize) -> (String, usize) {
    let mut literal = String::new();
    let mut i = start;

    while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
        literal.push(chars[i].1);
        i += 1;
    }

    if i < chars.len() && matches!(chars[i].1, 'e' | 'E') {
        let mut j = i + 1;
        if j < chars.len() && matches!(chars[j].1, '+' | '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].1.is_ascii_digit() {
            while i < j {
                literal.push(chars[i].1);
                i += 1;
            }
            while i < chars.len() && chars[i].1.is_ascii_digit() {
                literal.push(chars[i].1);
                i += 1;
            }
        }
    }

    (literal, i)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.peek()?;
        self.pos += 1;
        Some(token)
    }

    fn descend(&mut self) -> Result<(), EvalError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(EvalError::TooDeep);
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<f64, EvalError> {
        let mut value = self.term()?;
        while let Some(token) = self.peek() {
            match token.kind {
                Kind::Plus => {
                    self.pos += 1;
                    value = finite(value + self.term()?)?;
                }
                Kind::Minus => {
                    self.pos += 1;
                    value = finite(value - self.term()?)?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, EvalError> {
        let mut value = self.unary()?;
        while let Some(token) = self.peek() {
            match token.kind {
                Kind::Star => {
                    self.pos += 1;
                    value = finite(value * self.unary()?)?;
                }
                Kind::Slash => {
                    self.pos += 1;
                    let divisor = self.unary()?;
                    if divisor == 0.0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    value = finite(value / divisor)?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<f64, EvalError> {
        match self.peek().map(|t| t.kind) {
            Some(Kind::Plus) | Some(Kind::Minus) => {
                let negate = matches!(self.next().map(|t| t.kind), Some(Kind::Minus));
                self.descend()?;
                let value = self.unary()?;
                self.depth -= 1;
                Ok(if negate { -value } else { value })
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<f64, EvalError> {
        let base = self.primary()?;
        if matches!(self.peek().map(|t| t.kind), Some(Kind::Caret)) {
            self.pos += 1;
            self.descend()?;
            let exponent = self.unary()?;
            self.depth -= 1;
            if base == 0.0 && exponent < 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            return finite(base.powf(exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64, EvalError> {
        let token = self.next().ok_or(EvalError::UnexpectedEnd)?;
        match token.kind {
            Kind::Number(value) => Ok(value),
            Kind::LParen => {
                self.descend()?;
                let value = self.expr()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token {
                        kind: Kind::RParen, ..
                    }) => Ok(value),
                    Some(other) => Err(other.unexpected()),
                    None => Err(EvalError::UnexpectedEnd),
                }
            }
            _ => Err(token.unexpected()),
        }
    }
}

fn finite(value: f64) -> Result<f64, EvalError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(EvalError::NonFinite)
    }
}
