//! Hand-rolled lexer for LogchefQL with line/column tracking.

use super::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Number(String),
    Str(String),
    /// One of `=`, `!=`, `~`, `!~`, `>`, `>=`, `<`, `<=`
    Op(&'static str),
    LParen,
    RParen,
    Comma,
    And,
    Or,
    In,
    Not,
    Exists,
}

#[derive(Debug, Clone)]
pub(crate) struct Spanned {
    pub tok: Token,
    pub line: usize,
    pub col: usize,
}

struct Cursor<'a> {
    rest: std::str::Chars<'a>,
    peeked: Option<char>,
    line: usize,
    col: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Cursor {
            rest: input.chars(),
            peeked: None,
            line: 1,
            col: 1,
        }
    }

    fn peek(&mut self) -> Option<char> {
        if self.peeked.is_none() {
            self.peeked = self.rest.next();
        }
        self.peeked
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.peeked = None;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | '@')
}

pub(crate) fn lex(input: &str) -> Result<Vec<Spanned>, ParseError> {
    let mut cur = Cursor::new(input);
    let mut out = Vec::new();

    while let Some(c) = cur.peek() {
        let (line, col) = (cur.line, cur.col);
        match c {
            ch if ch.is_whitespace() => {
                cur.bump();
            }
            '(' => {
                cur.bump();
                out.push(Spanned { tok: Token::LParen, line, col });
            }
            ')' => {
                cur.bump();
                out.push(Spanned { tok: Token::RParen, line, col });
            }
            ',' => {
                cur.bump();
                out.push(Spanned { tok: Token::Comma, line, col });
            }
            '=' => {
                cur.bump();
                out.push(Spanned { tok: Token::Op("="), line, col });
            }
            '~' => {
                cur.bump();
                out.push(Spanned { tok: Token::Op("~"), line, col });
            }
            '!' => {
                cur.bump();
                match cur.peek() {
                    Some('=') => {
                        cur.bump();
                        out.push(Spanned { tok: Token::Op("!="), line, col });
                    }
                    Some('~') => {
                        cur.bump();
                        out.push(Spanned { tok: Token::Op("!~"), line, col });
                    }
                    _ => {
                        return Err(ParseError::syntax(
                            line,
                            col,
                            "expected '=' or '~' after '!'",
                        ))
                    }
                }
            }
            '>' => {
                cur.bump();
                if cur.peek() == Some('=') {
                    cur.bump();
                    out.push(Spanned { tok: Token::Op(">="), line, col });
                } else {
                    out.push(Spanned { tok: Token::Op(">"), line, col });
                }
            }
            '<' => {
                cur.bump();
                if cur.peek() == Some('=') {
                    cur.bump();
                    out.push(Spanned { tok: Token::Op("<="), line, col });
                } else {
                    out.push(Spanned { tok: Token::Op("<"), line, col });
                }
            }
            '"' | '\'' => {
                let quote = c;
                cur.bump();
                let mut value = String::new();
                loop {
                    match cur.bump() {
                        None => {
                            return Err(ParseError::syntax(line, col, "unterminated string"))
                        }
                        Some('\\') => match cur.bump() {
                            None => {
                                return Err(ParseError::syntax(
                                    line,
                                    col,
                                    "unterminated string",
                                ))
                            }
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some(other) => value.push(other),
                        },
                        Some(ch) if ch == quote => break,
                        Some(ch) => value.push(ch),
                    }
                }
                out.push(Spanned { tok: Token::Str(value), line, col });
            }
            ch if is_ident_char(ch) => {
                let mut word = String::new();
                while let Some(ch) = cur.peek() {
                    if is_ident_char(ch) {
                        word.push(ch);
                        cur.bump();
                    } else {
                        break;
                    }
                }
                let tok = match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "in" => Token::In,
                    "not" => Token::Not,
                    "exists" => Token::Exists,
                    _ if word.parse::<f64>().is_ok() => Token::Number(word),
                    _ => Token::Ident(word),
                };
                out.push(Spanned { tok, line, col });
            }
            other => {
                return Err(ParseError::syntax(
                    line,
                    col,
                    format!("unexpected character '{other}'"),
                ))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_clauses_and_keywords() {
        let toks = lex(r#"level="error" and latency>=1.5 or host in (a, b)"#).unwrap();
        let kinds: Vec<&Token> = toks.iter().map(|s| &s.tok).collect();
        assert!(matches!(kinds[0], Token::Ident(s) if s == "level"));
        assert!(matches!(kinds[1], Token::Op("=")));
        assert!(matches!(kinds[2], Token::Str(s) if s == "error"));
        assert!(matches!(kinds[3], Token::And));
        assert!(matches!(kinds[5], Token::Op(">=")));
        assert!(matches!(kinds[6], Token::Number(n) if n == "1.5"));
        assert!(matches!(kinds[7], Token::Or));
        assert!(matches!(kinds[9], Token::In));
    }

    #[test]
    fn tracks_positions() {
        let toks = lex("a=1\nb=2").unwrap();
        assert_eq!((toks[0].line, toks[0].col), (1, 1));
        assert_eq!((toks[3].line, toks[3].col), (2, 1));
    }

    #[test]
    fn string_escapes() {
        let toks = lex(r#"msg="it\'s \"here\"\\n""#);
        let toks = toks.unwrap();
        match &toks[2].tok {
            Token::Str(s) => assert_eq!(s, "it's \"here\"\\n"),
            other => panic!("unexpected token {other:?}"),
        }
    }

    #[test]
    fn rejects_unterminated_string() {
        let err = lex(r#"msg="oops"#).unwrap_err();
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn rejects_bare_bang() {
        assert!(lex("a ! b").is_err());
    }
}
