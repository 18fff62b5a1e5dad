//! Lexer for method source.
//!
//! | Syntax        | Token                                   |
//! |---------------|-----------------------------------------|
//! | `"…"`         | comment, skipped                        |
//! | `'it''s'`     | string, `''` is an embedded quote       |
//! | `$a`          | character                               |
//! | `#foo #at:put: #+ #'x y'` | symbol                      |
//! | `#(`          | start of a literal array                |
//! | `16r1F 3.25`  | radix integer, float                    |
//! | `at:`         | keyword                                 |

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Keyword(String),
    Binary(String),
    Integer(i64),
    Float(f64),
    Character(u8),
    String(String),
    Symbol(String),
    ArrayStart,
    Assign,
    Caret,
    Colon,
    Period,
    Semicolon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Eof,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

fn is_binary_char(c: u8) -> bool {
    matches!(
        c,
        b'+' | b'-' | b'*' | b'/' | b'\\' | b'<' | b'>' | b'=' | b'~' | b'@' | b'%' | b'&' | b'?' | b','
    )
}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            src: source.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_ahead(&self, n: usize) -> Option<u8> {
        self.src.get(self.pos + n).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
        }
        Some(c)
    }

    /// Skips whitespace and comments; reports an unterminated comment.
    fn skip_trivia(&mut self) -> Result<(), String> {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.advance();
                }
                Some(b'"') => {
                    self.advance();
                    loop {
                        match self.advance() {
                            Some(b'"') => break,
                            Some(_) => {}
                            None => return Err("unterminated comment".into()),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn lex_word(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.advance();
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }

    fn lex_identifier_or_keyword(&mut self) -> TokenKind {
        let word = self.lex_word();
        if self.peek() == Some(b':') && self.peek_ahead(1) != Some(b'=') {
            self.advance();
            TokenKind::Keyword(word + ":")
        } else {
            TokenKind::Identifier(word)
        }
    }

    fn lex_string_body(&mut self) -> Result<String, String> {
        let mut bytes = Vec::new();
        loop {
            match self.advance() {
                Some(b'\'') if self.peek() == Some(b'\'') => {
                    self.advance();
                    bytes.push(b'\'');
                }
                Some(b'\'') => break,
                Some(c) => bytes.push(c),
                None => return Err("unterminated string".into()),
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn lex_digits(&mut self, radix: u32) -> Option<i64> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if (c as char).is_digit(radix)) {
            self.advance();
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).ok()?;
        i64::from_str_radix(text, radix).ok()
    }

    fn lex_number(&mut self) -> TokenKind {
        let start = self.pos;
        let Some(value) = self.lex_digits(10) else {
            return TokenKind::Error("integer literal too large".into());
        };
        if self.peek() == Some(b'r') && matches!(self.peek_ahead(1), Some(c) if c.is_ascii_alphanumeric()) {
            let radix = value;
            if !(2..=36).contains(&radix) {
                return TokenKind::Error(format!("bad radix {radix}"));
            }
            self.advance();
            let digits_start = self.pos;
            while matches!(self.peek(), Some(c) if (c as char).is_digit(radix as u32)) {
                self.advance();
            }
            let text = String::from_utf8_lossy(&self.src[digits_start..self.pos]).to_ascii_lowercase();
            return match i64::from_str_radix(&text, radix as u32) {
                Ok(v) => TokenKind::Integer(v),
                Err(_) => TokenKind::Error(format!("bad radix {radix} literal")),
            };
        }
        if self.peek() == Some(b'.') && matches!(self.peek_ahead(1), Some(c) if c.is_ascii_digit()) {
            self.advance();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
            let text = String::from_utf8_lossy(&self.src[start..self.pos]);
            return match text.parse::<f64>() {
                Ok(f) => TokenKind::Float(f),
                Err(_) => TokenKind::Error(format!("bad float {text}")),
            };
        }
        TokenKind::Integer(value)
    }

    fn lex_symbol(&mut self) -> TokenKind {
        match self.peek() {
            Some(b'(') => {
                self.advance();
                TokenKind::ArrayStart
            }
            Some(b'\'') => {
                self.advance();
                match self.lex_string_body() {
                    Ok(s) => TokenKind::Symbol(s),
                    Err(e) => TokenKind::Error(e),
                }
            }
            Some(c) if c.is_ascii_alphabetic() => {
                let mut name = self.lex_word();
                // keyword selectors: #at:put:
                while self.peek() == Some(b':') {
                    self.advance();
                    name.push(':');
                    if matches!(self.peek(), Some(c) if c.is_ascii_alphabetic()) {
                        name.push_str(&self.lex_word());
                    }
                }
                TokenKind::Symbol(name)
            }
            Some(c) if is_binary_char(c) || c == b'|' => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if is_binary_char(c) || c == b'|') {
                    self.advance();
                }
                TokenKind::Symbol(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
            }
            _ => TokenKind::Error("bad symbol literal".into()),
        }
    }

    fn lex_binary(&mut self) -> TokenKind {
        let start = self.pos;
        self.advance();
        // `-` never continues an operator, so `x--1` is `x - -1`
        while matches!(self.peek(), Some(c) if is_binary_char(c) && c != b'-') {
            self.advance();
        }
        TokenKind::Binary(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }

    pub fn next_token(&mut self) -> Token {
        if let Err(message) = self.skip_trivia() {
            return Token {
                kind: TokenKind::Error(message),
                line: self.line,
            };
        }
        let line = self.line;
        let Some(c) = self.peek() else {
            return Token {
                kind: TokenKind::Eof,
                line,
            };
        };
        let kind = match c {
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.lex_identifier_or_keyword(),
            b'0'..=b'9' => self.lex_number(),
            b'\'' => {
                self.advance();
                match self.lex_string_body() {
                    Ok(s) => TokenKind::String(s),
                    Err(e) => TokenKind::Error(e),
                }
            }
            b'$' => {
                self.advance();
                match self.advance() {
                    Some(ch) => TokenKind::Character(ch),
                    None => TokenKind::Error("character literal at end of input".into()),
                }
            }
            b'#' => {
                self.advance();
                self.lex_symbol()
            }
            b':' => {
                self.advance();
                if self.peek() == Some(b'=') {
                    self.advance();
                    TokenKind::Assign
                } else {
                    TokenKind::Colon
                }
            }
            b'|' => {
                self.advance();
                TokenKind::Binary("|".into())
            }
            b'^' => {
                self.advance();
                TokenKind::Caret
            }
            b'.' => {
                self.advance();
                TokenKind::Period
            }
            b';' => {
                self.advance();
                TokenKind::Semicolon
            }
            b'(' => {
                self.advance();
                TokenKind::LParen
            }
            b')' => {
                self.advance();
                TokenKind::RParen
            }
            b'[' => {
                self.advance();
                TokenKind::LBracket
            }
            b']' => {
                self.advance();
                TokenKind::RBracket
            }
            c if is_binary_char(c) => self.lex_binary(),
            other => {
                self.advance();
                TokenKind::Error(format!("unexpected character {:?}", other as char))
            }
        };
        Token { kind, line }
    }

    /// All tokens up to and including `Eof`.
    pub fn tokenize(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return tokens;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src).tokenize().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lex_keyword_message() {
        assert_eq!(
            kinds("a at: 1 put: $x"),
            vec![
                TokenKind::Identifier("a".into()),
                TokenKind::Keyword("at:".into()),
                TokenKind::Integer(1),
                TokenKind::Keyword("put:".into()),
                TokenKind::Character(b'x'),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lex_assignment_is_not_keyword() {
        assert_eq!(
            kinds("x := 3"),
            vec![
                TokenKind::Identifier("x".into()),
                TokenKind::Assign,
                TokenKind::Integer(3),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lex_literals() {
        assert_eq!(
            kinds("'it''s' #foo:bar: #+ 16rFF 2.5 #("),
            vec![
                TokenKind::String("it's".into()),
                TokenKind::Symbol("foo:bar:".into()),
                TokenKind::Symbol("+".into()),
                TokenKind::Integer(255),
                TokenKind::Float(2.5),
                TokenKind::ArrayStart,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lex_binary_operators() {
        assert_eq!(
            kinds("a <= b \\\\ c--1"),
            vec![
                TokenKind::Identifier("a".into()),
                TokenKind::Binary("<=".into()),
                TokenKind::Identifier("b".into()),
                TokenKind::Binary("\\\\".into()),
                TokenKind::Identifier("c".into()),
                TokenKind::Binary("-".into()),
                TokenKind::Binary("-".into()),
                TokenKind::Integer(1),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lex_comments_and_lines() {
        let tokens = Lexer::new("\"a comment\nspanning\" x\n  y").tokenize();
        assert_eq!(tokens[0].kind, TokenKind::Identifier("x".into()));
        assert_eq!(tokens[0].line, 2);
        assert_eq!(tokens[1].line, 3);
    }

    #[test]
    fn lex_unterminated_string() {
        assert!(matches!(kinds("'abc")[0], TokenKind::Error(_)));
    }
}
