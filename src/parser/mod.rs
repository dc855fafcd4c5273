//! # Expression Parser
//!
//! Lexes and parses the condition/template sub-language into [`Expr`] trees.
//! Two surface forms resolve to the same AST:
//!
//! - Flat expression strings with conventional precedence
//!   (`or` < `and` < comparison/`in` < additive < multiplicative < unary;
//!   a C-style ternary binds loosest; parentheses override).
//! - Nested structured forms: a JSON map with a single `all`/`any`/`not`
//!   key whose leaves are flat expression strings.
//!
//! Action templates are ordinary expressions: a string action value wrapped
//! in `{{ ... }}` is parsed, any other string is a literal, and non-string
//! values are literals of their inferred type.
//!
//! The parser never evaluates anything and is total on well-formed input.

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::value::Value;
use thiserror::Error;

/// Parse failure with the byte offset it occurred at.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("parse error at {position}: expected {expected}, found {found}")]
    Unexpected {
        position: usize,
        expected: String,
        found: String,
    },

    #[error("unterminated string literal starting at {position}")]
    UnterminatedString { position: usize },

    #[error("invalid number at {position}: {text}")]
    InvalidNumber { position: usize, text: String },

    #[error("unexpected character '{ch}' at {position}")]
    UnexpectedChar { position: usize, ch: char },

    #[error("structured condition must be a map with a single 'all', 'any' or 'not' key, got: {found}")]
    InvalidStructure { found: String },
}

pub type ParseResult<T> = Result<T, ParseError>;

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Question,
    Colon,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Int(i) => i.to_string(),
            TokenKind::Float(f) => f.to_string(),
            TokenKind::Str(s) => format!("'{}'", s),
            TokenKind::Ident(name) => name.clone(),
            TokenKind::True => "true".to_string(),
            TokenKind::False => "false".to_string(),
            TokenKind::Null => "null".to_string(),
            TokenKind::And => "and".to_string(),
            TokenKind::Or => "or".to_string(),
            TokenKind::Not => "not".to_string(),
            TokenKind::In => "in".to_string(),
            TokenKind::Plus => "+".to_string(),
            TokenKind::Minus => "-".to_string(),
            TokenKind::Star => "*".to_string(),
            TokenKind::Slash => "/".to_string(),
            TokenKind::Percent => "%".to_string(),
            TokenKind::EqEq => "==".to_string(),
            TokenKind::NotEq => "!=".to_string(),
            TokenKind::Lt => "<".to_string(),
            TokenKind::Le => "<=".to_string(),
            TokenKind::Gt => ">".to_string(),
            TokenKind::Ge => ">=".to_string(),
            TokenKind::LParen => "(".to_string(),
            TokenKind::RParen => ")".to_string(),
            TokenKind::LBracket => "[".to_string(),
            TokenKind::RBracket => "]".to_string(),
            TokenKind::Comma => ",".to_string(),
            TokenKind::Dot => ".".to_string(),
            TokenKind::Question => "?".to_string(),
            TokenKind::Colon => ":".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn tokenize(source: &str) -> ParseResult<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let position = i;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // Identifiers and word operators
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let kind = match word.as_str() {
                "true" => TokenKind::True,
                "false" => TokenKind::False,
                "null" => TokenKind::Null,
                "and" => TokenKind::And,
                "or" => TokenKind::Or,
                "not" => TokenKind::Not,
                "in" => TokenKind::In,
                _ => TokenKind::Ident(word),
            };
            tokens.push(Token { kind, position });
            continue;
        }

        // Numbers: decimal integers and floats
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let mut is_float = false;
            if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                is_float = true;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let kind = if is_float {
                TokenKind::Float(text.parse().map_err(|_| ParseError::InvalidNumber {
                    position,
                    text: text.clone(),
                })?)
            } else {
                TokenKind::Int(text.parse().map_err(|_| ParseError::InvalidNumber {
                    position,
                    text: text.clone(),
                })?)
            };
            tokens.push(Token { kind, position });
            continue;
        }

        // String literals: single or double quoted, backslash escapes the
        // delimiter and itself only
        if c == '\'' || c == '"' {
            let delim = c;
            i += 1;
            let mut text = String::new();
            let mut closed = false;
            while i < chars.len() {
                let ch = chars[i];
                if ch == '\\' && i + 1 < chars.len() {
                    let next = chars[i + 1];
                    if next == delim || next == '\\' {
                        text.push(next);
                        i += 2;
                        continue;
                    }
                }
                if ch == delim {
                    closed = true;
                    i += 1;
                    break;
                }
                text.push(ch);
                i += 1;
            }
            if !closed {
                return Err(ParseError::UnterminatedString { position });
            }
            tokens.push(Token {
                kind: TokenKind::Str(text),
                position,
            });
            continue;
        }

        // Operators and punctuation
        let two = if i + 1 < chars.len() {
            Some((chars[i], chars[i + 1]))
        } else {
            None
        };
        let (kind, width) = match (c, two) {
            ('=', Some(('=', '='))) => (TokenKind::EqEq, 2),
            ('!', Some(('!', '='))) => (TokenKind::NotEq, 2),
            ('<', Some(('<', '='))) => (TokenKind::Le, 2),
            ('>', Some(('>', '='))) => (TokenKind::Ge, 2),
            ('<', _) => (TokenKind::Lt, 1),
            ('>', _) => (TokenKind::Gt, 1),
            ('+', _) => (TokenKind::Plus, 1),
            ('-', _) => (TokenKind::Minus, 1),
            ('*', _) => (TokenKind::Star, 1),
            ('/', _) => (TokenKind::Slash, 1),
            ('%', _) => (TokenKind::Percent, 1),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            ('[', _) => (TokenKind::LBracket, 1),
            (']', _) => (TokenKind::RBracket, 1),
            (',', _) => (TokenKind::Comma, 1),
            ('.', _) => (TokenKind::Dot, 1),
            ('?', _) => (TokenKind::Question, 1),
            (':', _) => (TokenKind::Colon, 1),
            _ => return Err(ParseError::UnexpectedChar { position, ch: c }),
        };
        tokens.push(Token { kind, position });
        i += width;
    }

    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    cursor: usize,
    source_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.cursor).map(|t| &t.kind)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.cursor)
            .map_or(self.source_len, |t| t.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.cursor).cloned();
        if token.is_some() {
            self.cursor += 1;
        }
        token
    }

    fn found(&self) -> String {
        self.tokens
            .get(self.cursor)
            .map_or_else(|| "end of input".to_string(), |t| t.kind.describe())
    }

    fn expect(&mut self, kind: &TokenKind, expected: &str) -> ParseResult<()> {
        if self.peek() == Some(kind) {
            self.cursor += 1;
            Ok(())
        } else {
            Err(ParseError::Unexpected {
                position: self.position(),
                expected: expected.to_string(),
                found: self.found(),
            })
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == Some(kind) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    /// expression := or_expr ('?' expression ':' expression)?
    fn expression(&mut self) -> ParseResult<Expr> {
        let cond = self.or_expr()?;
        if self.eat(&TokenKind::Question) {
            let then = self.expression()?;
            self.expect(&TokenKind::Colon, "':'")?;
            let otherwise = self.expression()?;
            return Ok(Expr::Conditional {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(cond)
    }

    fn or_expr(&mut self) -> ParseResult<Expr> {
        let mut left = self.and_expr()?;
        while self.eat(&TokenKind::Or) {
            let right = self.and_expr()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> ParseResult<Expr> {
        let mut left = self.comparison()?;
        while self.eat(&TokenKind::And) {
            let right = self.comparison()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::EqEq) => Some(BinaryOp::Eq),
                Some(TokenKind::NotEq) => Some(BinaryOp::Ne),
                Some(TokenKind::Lt) => Some(BinaryOp::Lt),
                Some(TokenKind::Le) => Some(BinaryOp::Le),
                Some(TokenKind::Gt) => Some(BinaryOp::Gt),
                Some(TokenKind::Ge) => Some(BinaryOp::Ge),
                Some(TokenKind::In) => None,
                _ => break,
            };
            if let Some(op) = op {
                self.cursor += 1;
                let right = self.additive()?;
                left = Expr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                };
            } else {
                self.cursor += 1; // 'in'
                let list = self.additive()?;
                left = Expr::MemberOf {
                    value: Box::new(left),
                    list: Box::new(list),
                };
            }
        }
        Ok(left)
    }

    fn additive(&mut self) -> ParseResult<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.cursor += 1;
            let right = self.multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> ParseResult<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Star) => BinaryOp::Mul,
                Some(TokenKind::Slash) => BinaryOp::Div,
                Some(TokenKind::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.cursor += 1;
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        if self.eat(&TokenKind::Not) {
            let inner = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                inner: Box::new(inner),
            });
        }
        if self.eat(&TokenKind::Minus) {
            // Fold negation into numeric literals so `-5` is a literal
            let inner = self.unary()?;
            return Ok(match inner {
                Expr::Literal(Value::Int(i)) => Expr::Literal(Value::Int(-i)),
                Expr::Literal(Value::Float(f)) => Expr::Literal(Value::Float(-f)),
                other => Expr::Unary {
                    op: UnaryOp::Neg,
                    inner: Box::new(other),
                },
            });
        }
        self.postfix()
    }

    /// postfix := atom ('[' expression ']' | '.' ident | '(' args ')')*
    ///
    /// A call is only valid directly on a bare identifier.
    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.eat(&TokenKind::LBracket) {
                let key = self.expression()?;
                self.expect(&TokenKind::RBracket, "']'")?;
                expr = Expr::Index {
                    container: Box::new(expr),
                    key: Box::new(key),
                };
            } else if self.peek() == Some(&TokenKind::Dot) {
                self.cursor += 1;
                match self.advance() {
                    Some(Token {
                        kind: TokenKind::Ident(name),
                        ..
                    }) => {
                        expr = Expr::Index {
                            container: Box::new(expr),
                            key: Box::new(Expr::Literal(Value::String(name))),
                        };
                    }
                    _ => {
                        return Err(ParseError::Unexpected {
                            position: self.position(),
                            expected: "member name".to_string(),
                            found: self.found(),
                        })
                    }
                }
            } else if self.peek() == Some(&TokenKind::LParen) {
                let name = match expr {
                    Expr::Ref(name) => name,
                    other => {
                        return Err(ParseError::Unexpected {
                            position: self.position(),
                            expected: "function name before '('".to_string(),
                            found: other.to_string(),
                        })
                    }
                };
                self.cursor += 1;
                let mut args = Vec::new();
                if self.peek() != Some(&TokenKind::RParen) {
                    loop {
                        args.push(self.expression()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RParen, "')'")?;
                expr = Expr::Call { name, args };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn atom(&mut self) -> ParseResult<Expr> {
        let position = self.position();
        match self.advance() {
            Some(Token {
                kind: TokenKind::Int(i),
                ..
            }) => Ok(Expr::Literal(Value::Int(i))),
            Some(Token {
                kind: TokenKind::Float(f),
                ..
            }) => Ok(Expr::Literal(Value::Float(f))),
            Some(Token {
                kind: TokenKind::Str(s),
                ..
            }) => Ok(Expr::Literal(Value::String(s))),
            Some(Token {
                kind: TokenKind::True,
                ..
            }) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token {
                kind: TokenKind::False,
                ..
            }) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token {
                kind: TokenKind::Null,
                ..
            }) => Ok(Expr::Literal(Value::Null)),
            Some(Token {
                kind: TokenKind::Ident(name),
                ..
            }) => Ok(Expr::Ref(name)),
            Some(Token {
                kind: TokenKind::LParen,
                ..
            }) => {
                let inner = self.expression()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            other => Err(ParseError::Unexpected {
                position,
                expected: "literal, identifier or '('".to_string(),
                found: other.map_or_else(|| "end of input".to_string(), |t| t.kind.describe()),
            }),
        }
    }
}

/// Parse a flat expression string into an AST.
pub fn parse_expression(source: &str) -> ParseResult<Expr> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        cursor: 0,
        source_len: source.len(),
    };
    let expr = parser.expression()?;
    if parser.cursor < parser.tokens.len() {
        return Err(ParseError::Unexpected {
            position: parser.position(),
            expected: "end of input".to_string(),
            found: parser.found(),
        });
    }
    Ok(expr)
}

/// Parse a structured condition form: a JSON map with a single `all`, `any`
/// or `not` key, or a flat expression string at the leaves.
pub fn parse_structured(condition: &serde_json::Value) -> ParseResult<Expr> {
    match condition {
        serde_json::Value::String(text) => parse_expression(text),
        serde_json::Value::Object(entries) if entries.len() == 1 => {
            let (key, inner) = entries
                .iter()
                .next()
                .ok_or_else(|| ParseError::InvalidStructure {
                    found: condition.to_string(),
                })?;
            match (key.as_str(), inner) {
                ("all", serde_json::Value::Array(items)) => Ok(Expr::All(
                    items.iter().map(parse_structured).collect::<ParseResult<_>>()?,
                )),
                ("any", serde_json::Value::Array(items)) => Ok(Expr::Any(
                    items.iter().map(parse_structured).collect::<ParseResult<_>>()?,
                )),
                ("not", sub) => Ok(Expr::Not(Box::new(parse_structured(sub)?))),
                _ => Err(ParseError::InvalidStructure {
                    found: condition.to_string(),
                }),
            }
        }
        other => Err(ParseError::InvalidStructure {
            found: other.to_string(),
        }),
    }
}

/// Parse an action value into a template expression.
///
/// A string wrapped in `{{ ... }}` is parsed as an expression; any other
/// string is a literal string; non-string values are literals of their
/// inferred type.
pub fn parse_template(action: &serde_json::Value) -> ParseResult<Expr> {
    if let serde_json::Value::String(text) = action {
        let trimmed = text.trim();
        if let Some(inner) = trimmed
            .strip_prefix("{{")
            .and_then(|rest| rest.strip_suffix("}}"))
        {
            return parse_expression(inner);
        }
        return Ok(Expr::Literal(Value::String(text.clone())));
    }
    Ok(Expr::Literal(Value::from_json(action)))
}
