//! Recursive-descent parser producing the LogchefQL expression tree.
//! Adjacent terms AND together; `and` binds tighter than `or`.

use super::lexer::{lex, Spanned, Token};
use super::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Neq,
    Regex,
    NotRegex,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Exists,
    NotExists,
}

impl CompareOp {
    fn from_symbol(sym: &str) -> Option<Self> {
        Some(match sym {
            "=" => CompareOp::Eq,
            "!=" => CompareOp::Neq,
            "~" => CompareOp::Regex,
            "!~" => CompareOp::NotRegex,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Gte,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Lte,
            _ => return None,
        })
    }
}

/// Right-hand side literal
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Quoted string
    Str(String),
    /// Bare identifier treated as a string literal
    Bare(String),
    /// Numeric literal kept verbatim
    Number(String),
    List(Vec<Value>),
}

impl Value {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Number(_))
    }
}

/// A field reference, possibly dotted for Map/JSON access
#[derive(Debug, Clone, PartialEq)]
pub struct FieldPath {
    /// The field exactly as written
    pub raw: String,
    /// Leading segment: the column name
    pub base: String,
    /// Remaining dotted segments
    pub path: Vec<String>,
}

impl FieldPath {
    fn new(raw: String) -> Self {
        let mut segments = raw.split('.');
        let base = segments.next().unwrap_or_default().to_string();
        let path = segments.map(|s| s.to_string()).collect();
        FieldPath { raw, base, path }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub field: FieldPath,
    pub op: CompareOp,
    /// None for exists / not exists
    pub value: Option<Value>,
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Clause(Clause),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Group(Box<Expr>),
}

pub(crate) fn parse(input: &str) -> Result<Option<Expr>, ParseError> {
    let tokens = lex(input)?;
    if tokens.is_empty() {
        return Ok(None);
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if let Some(extra) = parser.peek() {
        return Err(ParseError::syntax(
            extra.line,
            extra.col,
            "unexpected trailing input",
        ));
    }
    Ok(Some(expr))
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Spanned> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek().map(|s| &s.tok) == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn end_position(&self) -> (usize, usize) {
        self.tokens
            .last()
            .map(|s| (s.line, s.col))
            .unwrap_or((1, 1))
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_term()?;
        loop {
            if self.eat(&Token::And) {
                let right = self.parse_term()?;
                left = Expr::And(Box::new(left), Box::new(right));
            } else if self.starts_term() {
                // bare adjacency is an implicit AND
                let right = self.parse_term()?;
                left = Expr::And(Box::new(left), Box::new(right));
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn starts_term(&self) -> bool {
        matches!(
            self.peek().map(|s| &s.tok),
            Some(Token::Ident(_)) | Some(Token::LParen)
        )
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::LParen) {
            let inner = self.parse_or()?;
            let (line, col) = self.end_position();
            if !self.eat(&Token::RParen) {
                return Err(ParseError::syntax(line, col, "expected ')'"));
            }
            return Ok(Expr::Group(Box::new(inner)));
        }
        self.parse_clause()
    }

    fn parse_clause(&mut self) -> Result<Expr, ParseError> {
        let Some(head) = self.bump() else {
            let (line, col) = self.end_position();
            return Err(ParseError::syntax(line, col, "expected a field name"));
        };
        let (field, line, col) = match head.tok {
            Token::Ident(name) => (FieldPath::new(name), head.line, head.col),
            other => {
                return Err(ParseError::syntax(
                    head.line,
                    head.col,
                    format!("expected a field name, found {other:?}"),
                ))
            }
        };

        let Some(next) = self.bump() else {
            return Err(ParseError::syntax(
                line,
                col,
                format!("field '{}' is missing an operator", field.raw),
            ));
        };

        let clause = match next.tok {
            Token::Op(sym) => {
                let op = CompareOp::from_symbol(sym).ok_or_else(|| {
                    ParseError::syntax(next.line, next.col, format!("unknown operator {sym}"))
                })?;
                let value = self.parse_scalar()?;
                if matches!(op, CompareOp::Regex | CompareOp::NotRegex)
                    && value.is_numeric()
                {
                    return Err(ParseError::syntax(
                        next.line,
                        next.col,
                        "regex operator needs a string pattern",
                    ));
                }
                Clause {
                    field,
                    op,
                    value: Some(value),
                    line,
                    col,
                }
            }
            Token::In => Clause {
                field,
                op: CompareOp::In,
                value: Some(self.parse_list()?),
                line,
                col,
            },
            Token::Exists => Clause {
                field,
                op: CompareOp::Exists,
                value: None,
                line,
                col,
            },
            Token::Not => {
                let Some(after) = self.bump() else {
                    return Err(ParseError::syntax(
                        next.line,
                        next.col,
                        "expected 'in' or 'exists' after 'not'",
                    ));
                };
                match after.tok {
                    Token::In => Clause {
                        field,
                        op: CompareOp::NotIn,
                        value: Some(self.parse_list()?),
                        line,
                        col,
                    },
                    Token::Exists => Clause {
                        field,
                        op: CompareOp::NotExists,
                        value: None,
                        line,
                        col,
                    },
                    _ => {
                        return Err(ParseError::syntax(
                            after.line,
                            after.col,
                            "expected 'in' or 'exists' after 'not'",
                        ))
                    }
                }
            }
            other => {
                return Err(ParseError::syntax(
                    next.line,
                    next.col,
                    format!("expected an operator after '{}', found {other:?}", field.raw),
                ))
            }
        };
        Ok(Expr::Clause(clause))
    }

    fn parse_scalar(&mut self) -> Result<Value, ParseError> {
        let Some(tok) = self.bump() else {
            let (line, col) = self.end_position();
            return Err(ParseError::syntax(line, col, "expected a value"));
        };
        match tok.tok {
            Token::Str(s) => Ok(Value::Str(s)),
            Token::Number(n) => Ok(Value::Number(n)),
            Token::Ident(w) => Ok(Value::Bare(w)),
            other => Err(ParseError::syntax(
                tok.line,
                tok.col,
                format!("expected a value, found {other:?}"),
            )),
        }
    }

    fn parse_list(&mut self) -> Result<Value, ParseError> {
        let (line, col) = self
            .peek()
            .map(|s| (s.line, s.col))
            .unwrap_or_else(|| self.end_position());
        if !self.eat(&Token::LParen) {
            return Err(ParseError::syntax(line, col, "expected '(' to open a list"));
        }
        let mut items = Vec::new();
        loop {
            items.push(self.parse_scalar()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            let (line, col) = self.end_position();
            if !self.eat(&Token::RParen) {
                return Err(ParseError::syntax(line, col, "expected ')' to close a list"));
            }
            break;
        }
        Ok(Value::List(items))
    }
}
