// Rule lexer
//
// Converts rule/filter text into a flat token stream. Byte offsets are kept
// on every token for error messages.

use crate::error::{Result, RuleDbError};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Str(String),
    Num(f64),
    Ident(String),
    /// `@` followed by an identifier, e.g. `@request`.
    Macro(String),
    Dot,
    LParen,
    RParen,
    And,
    Or,
    Not,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    NotLike,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the first character.
    pub pos: usize,
}

pub struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    /// Tokenize the whole input. The last token is always `Eof`.
    pub fn tokenize(src: &str) -> Result<Vec<Token>> {
        let mut lexer = Lexer::new(src);
        let mut tokens = Vec::new();
        loop {
            let tok = lexer.next_token()?;
            let done = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if done {
                return Ok(tokens);
            }
        }
    }

    pub fn next_token(&mut self) -> Result<Token> {
        self.skip_whitespace();
        let start = self.pos;
        let Some(&ch) = self.bytes.get(self.pos) else {
            return Ok(Token {
                kind: TokenKind::Eof,
                pos: start,
            });
        };

        let kind = match ch {
            b'\'' | b'"' => self.lex_string(ch)?,
            b'0'..=b'9' => self.lex_number()?,
            b'-' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => self.lex_number()?,
            b'@' => {
                self.pos += 1;
                let name = self.lex_ident_text();
                if name.is_empty() {
                    return Err(self.error("expected macro name after '@'", start));
                }
                TokenKind::Macro(name)
            }
            c if c.is_ascii_alphabetic() || c == b'_' => TokenKind::Ident(self.lex_ident_text()),
            b'.' => self.single(TokenKind::Dot),
            b'(' => self.single(TokenKind::LParen),
            b')' => self.single(TokenKind::RParen),
            b'&' if self.peek_at(1) == Some(b'&') => self.double(TokenKind::And),
            b'|' if self.peek_at(1) == Some(b'|') => self.double(TokenKind::Or),
            b'!' => match self.peek_at(1) {
                Some(b'=') => self.double(TokenKind::Neq),
                Some(b'~') => self.double(TokenKind::NotLike),
                _ => self.single(TokenKind::Not),
            },
            b'=' => self.single(TokenKind::Eq),
            b'~' => self.single(TokenKind::Like),
            b'>' if self.peek_at(1) == Some(b'=') => self.double(TokenKind::Gte),
            b'>' => self.single(TokenKind::Gt),
            b'<' if self.peek_at(1) == Some(b'=') => self.double(TokenKind::Lte),
            b'<' => self.single(TokenKind::Lt),
            _ => {
                let c = self.src[start..].chars().next().unwrap_or('?');
                return Err(self.error(&format!("unexpected character '{c}'"), start));
            }
        };

        Ok(Token { kind, pos: start })
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.pos += 1;
        kind
    }

    fn double(&mut self, kind: TokenKind) -> TokenKind {
        self.pos += 2;
        kind
    }

    fn skip_whitespace(&mut self) {
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }

    fn lex_ident_text(&mut self) -> String {
        let start = self.pos;
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_alphanumeric() || *c == b'_')
        {
            self.pos += 1;
        }
        self.src[start..self.pos].to_string()
    }

    fn lex_number(&mut self) -> Result<TokenKind> {
        let start = self.pos;
        if self.bytes[self.pos] == b'-' {
            self.pos += 1;
        }
        while self.peek_at(0).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek_at(0) == Some(b'.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
            while self.peek_at(0).is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text = &self.src[start..self.pos];
        text.parse::<f64>()
            .map(TokenKind::Num)
            .map_err(|_| self.error(&format!("invalid number '{text}'"), start))
    }

    /// Quote and backslash are ASCII, so scanning bytes never splits a
    /// multi-byte character.
    fn lex_string(&mut self, quote: u8) -> Result<TokenKind> {
        let start = self.pos;
        self.pos += 1;
        let body_start = self.pos;
        loop {
            match self.bytes.get(self.pos) {
                None => return Err(self.error("unterminated string", start)),
                Some(b'\\') => self.pos += 2,
                Some(&c) if c == quote => break,
                Some(_) => self.pos += 1,
            }
        }
        let body = &self.src[body_start..self.pos.min(self.src.len())];
        self.pos += 1;

        let mut out = String::with_capacity(body.len());
        let mut chars = body.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => {}
            }
        }
        Ok(TokenKind::Str(out))
    }

    fn error(&self, message: &str, pos: usize) -> RuleDbError {
        RuleDbError::Rule(format!("{message} at position {pos}"))
    }
}
