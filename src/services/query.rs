//! Boolean admission query over advertisement fields
//!
//! Grammar:
//! ```text
//! expr    := and ( ("||" | "or") and )*
//! and     := unary ( ("&&" | "and") unary )*
//! unary   := ("!" | "not") unary | "(" expr ")" | compare
//! compare := field [ op value ]
//! field   := name | id | mac | service | mfg | rssi | tx_power
//! op      := == | != | ^= | *= | < | <= | > | >=
//! value   := "quoted" | bare-word | number
//! ```
//! A bare field tests presence. String comparisons ignore case; `service`
//! matches when any advertised service UUID does. `^=` is prefix, `*=` is
//! substring. Queries are compiled once and evaluated per sighting.

use crate::domain::types::Advertisement;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("unexpected end of query")]
    UnexpectedEnd,
    #[error("unexpected token {0:?}")]
    UnexpectedToken(String),
    #[error("unknown field {0:?}")]
    UnknownField(String),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("operator {op} needs a numeric value for {field}")]
    NotNumeric { field: &'static str, op: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Name,
    Id,
    Mac,
    Service,
    Mfg,
    Rssi,
    TxPower,
}

impl Field {
    fn parse(word: &str) -> Option<Self> {
        Some(match word.to_ascii_lowercase().as_str() {
            "name" => Field::Name,
            "id" => Field::Id,
            "mac" => Field::Mac,
            "service" | "services" => Field::Service,
            "mfg" | "manufacturer" => Field::Mfg,
            "rssi" => Field::Rssi,
            "tx_power" | "tx" => Field::TxPower,
            _ => return None,
        })
    }

    fn as_str(self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Id => "id",
            Field::Mac => "mac",
            Field::Service => "service",
            Field::Mfg => "mfg",
            Field::Rssi => "rssi",
            Field::TxPower => "tx_power",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Prefix,
    Contains,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "==",
            Op::Ne => "!=",
            Op::Prefix => "^=",
            Op::Contains => "*=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
        }
    }

    fn is_ordering(self) -> bool {
        matches!(self, Op::Lt | Op::Le | Op::Gt | Op::Ge)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Present(Field),
    Compare { field: Field, op: Op, text: String, number: Option<f64> },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Op(Op),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, QueryError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
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
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(Op::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(Op::Ne));
                i += 2;
            }
            '^' if next == Some('=') => {
                tokens.push(Token::Op(Op::Prefix));
                i += 2;
            }
            '*' if next == Some('=') => {
                tokens.push(Token::Op(Op::Contains));
                i += 2;
            }
            '<' | '>' => {
                let op = match (c, next == Some('=')) {
                    ('<', true) => Op::Le,
                    ('<', false) => Op::Lt,
                    (_, true) => Op::Ge,
                    (_, false) => Op::Gt,
                };
                tokens.push(Token::Op(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == quote)
                    .ok_or(QueryError::UnterminatedString)?;
                tokens.push(Token::Str(chars[start..start + end].iter().collect()));
                i = start + end + 1;
            }
            _ => {
                let start = i;
                while i < chars.len() && !chars[i].is_whitespace() && !"()!=<>&|^*\"'".contains(chars[i])
                {
                    i += 1;
                }
                if i == start {
                    return Err(QueryError::UnexpectedToken(c.to_string()));
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Word(word),
                });
            }
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
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, QueryError> {
        match self.next() {
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.unary()?))),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(QueryError::UnexpectedToken(format!("{other:?}"))),
                    None => Err(QueryError::UnexpectedEnd),
                }
            }
            Some(Token::Word(word)) => {
                let field = Field::parse(&word).ok_or(QueryError::UnknownField(word))?;
                self.compare(field)
            }
            Some(other) => Err(QueryError::UnexpectedToken(format!("{other:?}"))),
            None => Err(QueryError::UnexpectedEnd),
        }
    }

    fn compare(&mut self, field: Field) -> Result<Expr, QueryError> {
        let Some(Token::Op(op)) = self.peek().cloned() else {
            return Ok(Expr::Present(field));
        };
        self.pos += 1;

        let text = match self.next() {
            Some(Token::Word(w)) | Some(Token::Str(w)) => w,
            Some(other) => return Err(QueryError::UnexpectedToken(format!("{other:?}"))),
            None => return Err(QueryError::UnexpectedEnd),
        };
        let number = text.parse::<f64>().ok();
        if op.is_ordering() && number.is_none() {
            return Err(QueryError::NotNumeric { field: field.as_str(), op: op.as_str() });
        }

        Ok(Expr::Compare { field, op, text: text.to_lowercase(), number })
    }
}

/// Field values of one sighting, as seen by a query
#[derive(Debug, Clone, Copy)]
pub struct QueryContext<'a> {
    pub id: &'a str,
    pub advertisement: &'a Advertisement,
}

fn compare_text(value: &str, op: Op, text: &str) -> bool {
    let value = value.to_lowercase();
    match op {
        Op::Eq => value == text,
        Op::Ne => value != text,
        Op::Prefix => value.starts_with(text),
        Op::Contains => value.contains(text),
        _ => false,
    }
}

fn compare_number(value: f64, op: Op, number: f64) -> bool {
    match op {
        Op::Eq => value == number,
        Op::Ne => value != number,
        Op::Lt => value < number,
        Op::Le => value <= number,
        Op::Gt => value > number,
        Op::Ge => value >= number,
        Op::Prefix | Op::Contains => false,
    }
}

impl Expr {
    fn eval(&self, ctx: &QueryContext<'_>) -> bool {
        let adv = ctx.advertisement;
        match self {
            Expr::Or(a, b) => a.eval(ctx) || b.eval(ctx),
            Expr::And(a, b) => a.eval(ctx) && b.eval(ctx),
            Expr::Not(e) => !e.eval(ctx),
            Expr::Present(field) => match field {
                Field::Name => adv.name.as_deref().is_some_and(|n| !n.is_empty()),
                Field::Id | Field::Mac | Field::Rssi => true,
                Field::Service => !adv.service_uuids.is_empty(),
                Field::Mfg => adv.manufacturer_data.is_some(),
                Field::TxPower => adv.tx_power.is_some(),
            },
            Expr::Compare { field, op, text, number } => match field {
                Field::Name => adv.name.as_deref().is_some_and(|n| compare_text(n, *op, text)),
                Field::Id => compare_text(ctx.id, *op, text),
                Field::Mac => {
                    compare_text(&adv.mac.to_string(), *op, text)
                        || compare_text(&adv.mac.to_id(), *op, text)
                }
                // "service != x" holds when no advertised service equals x
                Field::Service if *op == Op::Ne => {
                    adv.service_uuids.iter().all(|s| compare_text(s, Op::Ne, text))
                }
                Field::Service => adv.service_uuids.iter().any(|s| compare_text(s, *op, text)),
                Field::Mfg => adv.manufacturer_data.as_deref().is_some_and(|m| compare_text(m, *op, text)),
                Field::Rssi => number.is_some_and(|n| compare_number(adv.rssi as f64, *op, n)),
                Field::TxPower => match (adv.tx_power, *number) {
                    (Some(tx), Some(n)) => compare_number(tx as f64, *op, n),
                    _ => false,
                },
            },
        }
    }
}

/// A compiled admission query
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    source: String,
    root: Expr,
}

impl Query {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, ctx: &QueryContext<'_>) -> bool {
        self.root.eval(ctx)
    }
}

impl std::str::FromStr for Query {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(s)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr()?;
        if let Some(extra) = parser.peek() {
            return Err(QueryError::UnexpectedToken(format!("{extra:?}")));
        }
        Ok(Self { source: s.trim().to_string(), root })
    }
}
