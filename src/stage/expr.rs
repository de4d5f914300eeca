//! Boolean filter expressions.
//!
//! Grammar:
//! ```text
//! expr       := and_expr ( ("or" | "||") and_expr )*
//! and_expr   := unary ( ("and" | "&&") unary )*
//! unary      := ("not" | "!") unary | "(" expr ")" | comparison
//! comparison := field op literal
//! op         := = | == | != | <> | < | <= | > | >= | contains | starts | ends
//! field      := word | "[" any text "]"
//! literal    := 'quoted' | "quoted" | word
//! ```
//!
//! Keywords are case-insensitive. An expression is parsed once, then bound
//! to field ordinals of a concrete schema before it is evaluated.

use std::cmp::Ordering;
use std::fmt;

use crate::record::{FieldType, Record};

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    Starts,
    Ends,
}

impl CompareOp {
    fn from_word(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "contains" => Some(CompareOp::Contains),
            "starts" => Some(CompareOp::Starts),
            "ends" => Some(CompareOp::Ends),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Contains => "contains",
            CompareOp::Starts => "starts",
            CompareOp::Ends => "ends",
        }
    }

    fn test(&self, kind: FieldType, value: &str, literal: &str, ignore_case: bool) -> bool {
        match self {
            CompareOp::Contains | CompareOp::Starts | CompareOp::Ends => {
                let (value, literal) = if ignore_case {
                    (value.to_lowercase(), literal.to_lowercase())
                } else {
                    (value.to_string(), literal.to_string())
                };
                match self {
                    CompareOp::Contains => value.contains(&literal),
                    CompareOp::Starts => value.starts_with(&literal),
                    _ => value.ends_with(&literal),
                }
            }
            _ => {
                let ordering = kind.compare(value, literal, ignore_case);
                match self {
                    CompareOp::Eq => ordering == Ordering::Equal,
                    CompareOp::Ne => ordering != Ordering::Equal,
                    CompareOp::Lt => ordering == Ordering::Less,
                    CompareOp::Le => ordering != Ordering::Greater,
                    CompareOp::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                }
            }
        }
    }
}

/// Parsed expression, still referring to fields by name.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Compare {
        field: String,
        op: CompareOp,
        value: String,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Resolve field names to ordinals with `resolve`. Fails with the first
    /// unknown field name.
    pub fn bind<F>(&self, resolve: &mut F) -> Result<BoundExpr, String>
    where
        F: FnMut(&str) -> Option<(usize, FieldType)>,
    {
        Ok(match self {
            Expr::Compare { field, op, value } => {
                let (ordinal, kind) =
                    resolve(field).ok_or_else(|| format!("unknown field '{field}'"))?;
                BoundExpr::Compare {
                    ordinal,
                    kind,
                    op: *op,
                    value: value.clone(),
                }
            }
            Expr::Not(inner) => BoundExpr::Not(Box::new(inner.bind(resolve)?)),
            Expr::And(a, b) => {
                BoundExpr::And(Box::new(a.bind(resolve)?), Box::new(b.bind(resolve)?))
            }
            Expr::Or(a, b) => BoundExpr::Or(Box::new(a.bind(resolve)?), Box::new(b.bind(resolve)?)),
        })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Compare { field, op, value } => {
                write!(f, "[{field}] {} '{}'", op.as_str(), value.replace('\'', "\\'"))
            }
            Expr::Not(inner) => write!(f, "not ({inner})"),
            Expr::And(a, b) => write!(f, "({a}) and ({b})"),
            Expr::Or(a, b) => write!(f, "({a}) or ({b})"),
        }
    }
}

/// Expression bound to one schema's ordinals.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundExpr {
    Compare {
        ordinal: usize,
        kind: FieldType,
        op: CompareOp,
        value: String,
    },
    Not(Box<BoundExpr>),
    And(Box<BoundExpr>, Box<BoundExpr>),
    Or(Box<BoundExpr>, Box<BoundExpr>),
}

impl BoundExpr {
    pub fn matches(&self, record: &Record, ignore_case: bool) -> bool {
        match self {
            BoundExpr::Compare {
                ordinal,
                kind,
                op,
                value,
            } => {
                let actual = record.value(*ordinal).unwrap_or("");
                op.test(*kind, actual, value, ignore_case)
            }
            BoundExpr::Not(inner) => !inner.matches(record, ignore_case),
            BoundExpr::And(a, b) => a.matches(record, ignore_case) && b.matches(record, ignore_case),
            BoundExpr::Or(a, b) => a.matches(record, ignore_case) || b.matches(record, ignore_case),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Bracketed(String),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '\'' | '"' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    if ch == '\\' {
                        if let Some((_, escaped)) = chars.next() {
                            value.push(escaped);
                        }
                    } else if ch == c {
                        closed = true;
                        break;
                    } else {
                        value.push(ch);
                    }
                }
                if !closed {
                    return Err(format!("unclosed quote starting at column {}", pos + 1));
                }
                tokens.push(Token::Quoted(value));
            }
            '[' => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, ch) in chars.by_ref() {
                    if ch == ']' {
                        closed = true;
                        break;
                    }
                    name.push(ch);
                }
                if !closed {
                    return Err(format!("unclosed '[' at column {}", pos + 1));
                }
                tokens.push(Token::Bracketed(name.trim().to_string()));
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                chars.next();
                let next = chars.peek().map(|&(_, n)| n);
                let (token, two) = match (c, next) {
                    ('=', Some('=')) => (Token::Op(CompareOp::Eq), true),
                    ('=', _) => (Token::Op(CompareOp::Eq), false),
                    ('!', Some('=')) => (Token::Op(CompareOp::Ne), true),
                    ('!', _) => (Token::Not, false),
                    ('<', Some('=')) => (Token::Op(CompareOp::Le), true),
                    ('<', Some('>')) => (Token::Op(CompareOp::Ne), true),
                    ('<', _) => (Token::Op(CompareOp::Lt), false),
                    ('>', Some('=')) => (Token::Op(CompareOp::Ge), true),
                    ('>', _) => (Token::Op(CompareOp::Gt), false),
                    ('&', Some('&')) => (Token::And, true),
                    ('|', Some('|')) => (Token::Or, true),
                    _ => return Err(format!("unexpected '{c}' at column {}", pos + 1)),
                };
                if two {
                    chars.next();
                }
                tokens.push(token);
            }
            _ => {
                let mut word = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_whitespace() || "()[]'\"=!<>&|".contains(ch) {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                let token = match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => match CompareOp::from_word(&word) {
                        Some(op) => Token::Op(op),
                        None => Token::Word(word),
                    },
                };
                tokens.push(token);
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

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            _ => self.parse_comparison(),
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let field = match self.next() {
            Some(Token::Word(w)) | Some(Token::Bracketed(w)) => w,
            Some(other) => return Err(format!("expected a field name, found {other:?}")),
            None => return Err("expected a field name".to_string()),
        };
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            _ => return Err(format!("expected an operator after '{field}'")),
        };
        let value = match self.next() {
            Some(Token::Word(w)) | Some(Token::Quoted(w)) => w,
            _ => return Err(format!("expected a value after '{field} {}'", op.as_str())),
        };
        Ok(Expr::Compare { field, op, value })
    }
}

/// Parse a filter expression.
pub fn parse_expr(text: &str) -> Result<Expr, String> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err("expression is empty".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if let Some(extra) = parser.peek() {
        return Err(format!("unexpected {extra:?} after expression"));
    }
    Ok(expr)
}
