//! Restricted predicate language for conditional slot requirements.
//!
//! Predicates arrive from policy files either as a structured table
//! (`{ op = "compare", slot = "fever_measured", cmp = "eq", value = true }`) or
//! as a small boolean expression (`fever_measured == true and not rash`). Both
//! forms produce the same tree; there is no general evaluation surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::slots::value::{SlotMap, SlotValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Literal {
    fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(flag) => *flag,
            Self::Number(number) => *number != 0.0,
            Self::Text(text) => !text.is_empty(),
        }
    }

    fn matches(&self, value: &SlotValue) -> bool {
        match (self, value) {
            (Self::Null, SlotValue::Null) | (Self::Null, SlotValue::Other(Value::Null)) => true,
            (Self::Bool(expected), SlotValue::Bool(actual)) => expected == actual,
            (Self::Number(expected), SlotValue::Number(actual)) => {
                actual.as_f64().is_some_and(|actual| actual == *expected)
            }
            (Self::Text(expected), SlotValue::Text(actual)) => expected == actual,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Truthy {
        slot: String,
    },
    Compare {
        slot: String,
        cmp: CompareOp,
        value: Literal,
    },
    Not {
        of: Box<Predicate>,
    },
    All {
        of: Vec<Predicate>,
    },
    Any {
        of: Vec<Predicate>,
    },
    Always {
        value: bool,
    },
    /// Expression text that failed to parse. Never holds.
    #[serde(skip)]
    Unparseable {
        expression: String,
        reason: String,
    },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message} at offset {offset}")]
pub struct PredicateParseError {
    pub message: String,
    pub offset: usize,
}

impl Predicate {
    pub fn truthy(slot: impl Into<String>) -> Self {
        Self::Truthy { slot: slot.into() }
    }

    pub fn equals(slot: impl Into<String>, value: Literal) -> Self {
        Self::Compare { slot: slot.into(), cmp: CompareOp::Eq, value }
    }

    pub fn parse(expression: &str) -> Result<Self, PredicateParseError> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser { tokens, position: 0, end: expression.len() };
        let predicate = parser.parse_or()?;
        if let Some((_, offset)) = parser.peek() {
            return Err(PredicateParseError {
                message: "unexpected trailing input".to_string(),
                offset: *offset,
            });
        }
        Ok(predicate)
    }

    /// Parses an expression, keeping failures as a predicate that never holds.
    pub fn from_expression(expression: &str) -> Self {
        Self::parse(expression).unwrap_or_else(|error| Self::Unparseable {
            expression: expression.to_string(),
            reason: error.to_string(),
        })
    }

    pub fn is_unparseable(&self) -> bool {
        matches!(self, Self::Unparseable { .. })
    }

    /// Three-valued evaluation. `None` means the predicate referenced a slot
    /// that is not present at all and could not be decided.
    pub fn evaluate(&self, slots: &SlotMap) -> Option<bool> {
        match self {
            Self::Truthy { slot } => slots.get(slot).map(is_truthy),
            Self::Compare { slot, cmp, value } => {
                let current = slots.get(slot)?;
                let equal = value.matches(current);
                Some(match cmp {
                    CompareOp::Eq => equal,
                    CompareOp::Ne => !equal,
                })
            }
            Self::Not { of } => of.evaluate(slots).map(|inner| !inner),
            Self::All { of } => {
                for predicate in of {
                    if !predicate.evaluate(slots)? {
                        return Some(false);
                    }
                }
                Some(true)
            }
            Self::Any { of } => {
                for predicate in of {
                    if predicate.evaluate(slots)? {
                        return Some(true);
                    }
                }
                Some(false)
            }
            Self::Always { value } => Some(*value),
            Self::Unparseable { .. } => Some(false),
        }
    }

    /// Fail-closed view: undecidable predicates do not hold.
    pub fn holds(&self, slots: &SlotMap) -> bool {
        self.evaluate(slots).unwrap_or(false)
    }
}

fn is_truthy(value: &SlotValue) -> bool {
    match value {
        SlotValue::Null => false,
        SlotValue::Bool(flag) => *flag,
        SlotValue::Number(number) => number.as_f64().is_some_and(|number| number != 0.0),
        SlotValue::Text(text) => !text.is_empty(),
        SlotValue::List(items) => !items.is_empty(),
        SlotValue::Other(Value::Null) => false,
        SlotValue::Other(Value::Array(items)) => !items.is_empty(),
        SlotValue::Other(Value::Object(map)) => !map.is_empty(),
        SlotValue::Other(_) => true,
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Literal(Literal),
    And,
    Or,
    Not,
    Eq,
    Ne,
    Open,
    Close,
}

fn tokenize(expression: &str) -> Result<Vec<(Token, usize)>, PredicateParseError> {
    let mut tokens = Vec::new();
    let mut chars = expression.char_indices().peekable();

    while let Some(&(offset, ch)) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }

        match ch {
            '(' => {
                chars.next();
                tokens.push((Token::Open, offset));
            }
            ')' => {
                chars.next();
                tokens.push((Token::Close, offset));
            }
            '=' | '!' => {
                chars.next();
                match chars.next() {
                    Some((_, '=')) => {
                        tokens.push((if ch == '=' { Token::Eq } else { Token::Ne }, offset))
                    }
                    _ => {
                        return Err(PredicateParseError {
                            message: format!("expected `{ch}=`"),
                            offset,
                        })
                    }
                }
            }
            '"' | '\'' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                for (_, next) in chars.by_ref() {
                    if next == ch {
                        closed = true;
                        break;
                    }
                    text.push(next);
                }
                if !closed {
                    return Err(PredicateParseError {
                        message: "unterminated string literal".to_string(),
                        offset,
                    });
                }
                tokens.push((Token::Literal(Literal::Text(text)), offset));
            }
            _ if ch.is_ascii_digit() || ch == '-' => {
                let mut raw = String::new();
                while let Some(&(_, next)) = chars.peek() {
                    if next.is_ascii_digit() || next == '.' || (raw.is_empty() && next == '-') {
                        raw.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = raw.parse::<f64>().map_err(|_| PredicateParseError {
                    message: format!("invalid number `{raw}`"),
                    offset,
                })?;
                tokens.push((Token::Literal(Literal::Number(number)), offset));
            }
            _ if ch.is_alphabetic() || ch == '_' => {
                let mut word = String::new();
                while let Some(&(_, next)) = chars.peek() {
                    if next.is_alphanumeric() || next == '_' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" | "True" => Token::Literal(Literal::Bool(true)),
                    "false" | "False" => Token::Literal(Literal::Bool(false)),
                    "null" | "None" => Token::Literal(Literal::Null),
                    _ => Token::Ident(word),
                };
                tokens.push((token, offset));
            }
            other => {
                return Err(PredicateParseError {
                    message: format!("unexpected character `{other}`"),
                    offset,
                })
            }
        }
    }

    Ok(tokens)
}

enum Operand {
    Slot(String),
    Literal(Literal),
    Group(Predicate),
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    position: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&(Token, usize)> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek().is_some_and(|(token, _)| token == expected) {
            self.position += 1;
            return true;
        }
        false
    }

    fn error(&self, message: &str) -> PredicateParseError {
        let offset = self.peek().map(|(_, offset)| *offset).unwrap_or(self.end);
        PredicateParseError { message: message.to_string(), offset }
    }

    fn parse_or(&mut self) -> Result<Predicate, PredicateParseError> {
        let mut terms = vec![self.parse_and()?];
        while self.eat(&Token::Or) {
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Predicate::Any { of: terms } })
    }

    fn parse_and(&mut self) -> Result<Predicate, PredicateParseError> {
        let mut terms = vec![self.parse_not()?];
        while self.eat(&Token::And) {
            terms.push(self.parse_not()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Predicate::All { of: terms } })
    }

    fn parse_not(&mut self) -> Result<Predicate, PredicateParseError> {
        if self.eat(&Token::Not) {
            return Ok(Predicate::Not { of: Box::new(self.parse_not()?) });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Predicate, PredicateParseError> {
        let left = self.parse_operand()?;
        let cmp = if self.eat(&Token::Eq) {
            CompareOp::Eq
        } else if self.eat(&Token::Ne) {
            CompareOp::Ne
        } else {
            return Ok(match left {
                Operand::Slot(slot) => Predicate::Truthy { slot },
                Operand::Literal(literal) => Predicate::Always { value: literal.is_truthy() },
                Operand::Group(predicate) => predicate,
            });
        };

        let right = self.parse_operand()?;
        match (left, right) {
            (Operand::Slot(slot), Operand::Literal(value))
            | (Operand::Literal(value), Operand::Slot(slot)) => {
                Ok(Predicate::Compare { slot, cmp, value })
            }
            (Operand::Literal(left), Operand::Literal(right)) => {
                let equal = left == right;
                Ok(Predicate::Always { value: if cmp == CompareOp::Eq { equal } else { !equal } })
            }
            _ => Err(self.error("comparisons need one slot and one literal")),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, PredicateParseError> {
        match self.advance() {
            Some((Token::Ident(name), _)) => Ok(Operand::Slot(name)),
            Some((Token::Literal(literal), _)) => Ok(Operand::Literal(literal)),
            Some((Token::Open, _)) => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::Close) {
                    return Err(self.error("expected `)`"));
                }
                Ok(Operand::Group(inner))
            }
            Some((_, offset)) => Err(PredicateParseError {
                message: "expected a slot name, literal or `(`".to_string(),
                offset,
            }),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}
