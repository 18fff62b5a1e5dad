//! Recursive descent parser for method source.
//!
//! ```text
//! method     := pattern temps? statements
//! pattern    := ident | binop ident | (keyword ident)+
//! temps      := '|' ident* '|'
//! statements := (statement '.')* statement? ; a return must be last
//! statement  := '^' expr | expr
//! expr       := ident ':=' expr | cascade
//! cascade    := keyword (';' message)*
//! keyword    := binary (keyword binary)*
//! binary     := unary (binop unary)*
//! unary      := primary ident*
//! primary    := ident | literal | '(' expr ')' | block | '<' int primary* '>'
//! ```

use crate::compiler::ast::{Block, Expr, Literal, Message, MethodNode, Statement};
use crate::compiler::lexer::{Lexer, Token, TokenKind};
use crate::error::CompileError;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type ParseResult<T> = Result<T, CompileError>;

impl Parser {
    pub fn new(source: &str) -> Self {
        Self {
            tokens: Lexer::new(source).tokenize(),
            pos: 0,
        }
    }

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].kind
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    fn error<T>(&self, message: impl Into<String>) -> ParseResult<T> {
        Err(CompileError::syntax(self.line(), message))
    }

    fn unexpected<T>(&self, wanted: &str) -> ParseResult<T> {
        match self.peek() {
            TokenKind::Error(message) => self.error(message.clone()),
            other => self.error(format!("expected {wanted}, found {other:?}")),
        }
    }

    fn is_binary(&self, op: &str) -> bool {
        matches!(self.peek(), TokenKind::Binary(b) if b == op)
    }

    fn expect_identifier(&mut self) -> ParseResult<String> {
        if let TokenKind::Identifier(name) = self.peek().clone() {
            self.advance();
            return Ok(name);
        }
        self.unexpected("identifier")
    }

    pub fn parse_method(mut self) -> ParseResult<MethodNode> {
        let (selector, args) = self.parse_pattern()?;
        let temps = self.parse_temporaries()?;
        let body = self.parse_statements()?;
        if *self.peek() != TokenKind::Eof {
            return self.unexpected("end of method");
        }
        Ok(MethodNode {
            selector,
            args,
            temps,
            body,
        })
    }

    fn parse_pattern(&mut self) -> ParseResult<(String, Vec<String>)> {
        match self.peek().clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok((name, Vec::new()))
            }
            TokenKind::Binary(op) => {
                self.advance();
                let arg = self.expect_identifier()?;
                Ok((op, vec![arg]))
            }
            TokenKind::Keyword(_) => {
                let mut selector = String::new();
                let mut args = Vec::new();
                while let TokenKind::Keyword(part) = self.peek().clone() {
                    self.advance();
                    selector.push_str(&part);
                    args.push(self.expect_identifier()?);
                }
                Ok((selector, args))
            }
            _ => self.unexpected("message pattern"),
        }
    }

    fn parse_temporaries(&mut self) -> ParseResult<Vec<String>> {
        let mut temps = Vec::new();
        if !self.is_binary("|") {
            return Ok(temps);
        }
        self.advance();
        while let TokenKind::Identifier(name) = self.peek().clone() {
            self.advance();
            temps.push(name);
        }
        if !self.is_binary("|") {
            return self.unexpected("'|' closing temporaries");
        }
        self.advance();
        Ok(temps)
    }

    /// Statements up to `]` or the end of input, which is not consumed.
    fn parse_statements(&mut self) -> ParseResult<Vec<Statement>> {
        let mut body = Vec::new();
        loop {
            while *self.peek() == TokenKind::Period {
                self.advance();
            }
            if matches!(self.peek(), TokenKind::Eof | TokenKind::RBracket) {
                return Ok(body);
            }
            if *self.peek() == TokenKind::Caret {
                self.advance();
                body.push(Statement::Return(self.parse_expression()?));
                while *self.peek() == TokenKind::Period {
                    self.advance();
                }
                if !matches!(self.peek(), TokenKind::Eof | TokenKind::RBracket) {
                    return self.error("statements after a return");
                }
                return Ok(body);
            }
            body.push(Statement::Expr(self.parse_expression()?));
            match self.peek() {
                TokenKind::Period | TokenKind::Eof | TokenKind::RBracket => {}
                _ => return self.unexpected("'.'"),
            }
        }
    }

    fn parse_expression(&mut self) -> ParseResult<Expr> {
        if *self.peek_at(1) == TokenKind::Assign {
            if let TokenKind::Identifier(name) = self.peek().clone() {
                let line = self.line();
                self.advance();
                self.advance();
                let value = self.parse_expression()?;
                return Ok(Expr::Assign {
                    name,
                    value: Box::new(value),
                    line,
                });
            }
        }
        self.parse_cascade()
    }

    fn parse_cascade(&mut self) -> ParseResult<Expr> {
        let first = self.parse_keyword_expression()?;
        if *self.peek() != TokenKind::Semicolon {
            return Ok(first);
        }
        let Expr::Send { receiver, message } = first else {
            return self.error("cascade without a message");
        };
        let mut messages = vec![message];
        while *self.peek() == TokenKind::Semicolon {
            self.advance();
            messages.push(self.parse_cascade_message()?);
        }
        Ok(Expr::Cascade { receiver, messages })
    }

    fn parse_cascade_message(&mut self) -> ParseResult<Message> {
        let line = self.line();
        match self.peek().clone() {
            TokenKind::Identifier(selector) => {
                self.advance();
                Ok(Message {
                    selector,
                    args: Vec::new(),
                    line,
                })
            }
            TokenKind::Binary(selector) => {
                self.advance();
                let arg = self.parse_unary_expression()?;
                Ok(Message {
                    selector,
                    args: vec![arg],
                    line,
                })
            }
            TokenKind::Keyword(_) => self.parse_keyword_message(line),
            _ => self.unexpected("cascaded message"),
        }
    }

    fn parse_keyword_message(&mut self, line: usize) -> ParseResult<Message> {
        let mut selector = String::new();
        let mut args = Vec::new();
        while let TokenKind::Keyword(part) = self.peek().clone() {
            self.advance();
            selector.push_str(&part);
            args.push(self.parse_binary_expression()?);
        }
        Ok(Message { selector, args, line })
    }

    fn parse_keyword_expression(&mut self) -> ParseResult<Expr> {
        let receiver = self.parse_binary_expression()?;
        if !matches!(self.peek(), TokenKind::Keyword(_)) {
            return Ok(receiver);
        }
        let line = self.line();
        let message = self.parse_keyword_message(line)?;
        Ok(Expr::Send {
            receiver: Box::new(receiver),
            message,
        })
    }

    fn parse_binary_expression(&mut self) -> ParseResult<Expr> {
        let mut receiver = self.parse_unary_expression()?;
        while let TokenKind::Binary(selector) = self.peek().clone() {
            let line = self.line();
            self.advance();
            let arg = self.parse_unary_expression()?;
            receiver = Expr::Send {
                receiver: Box::new(receiver),
                message: Message {
                    selector,
                    args: vec![arg],
                    line,
                },
            };
        }
        Ok(receiver)
    }

    fn parse_unary_expression(&mut self) -> ParseResult<Expr> {
        let mut receiver = self.parse_primary()?;
        while let TokenKind::Identifier(selector) = self.peek().clone() {
            if *self.peek_at(1) == TokenKind::Assign {
                break;
            }
            let line = self.line();
            self.advance();
            receiver = Expr::Send {
                receiver: Box::new(receiver),
                message: Message {
                    selector,
                    args: Vec::new(),
                    line,
                },
            };
        }
        Ok(receiver)
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        match self.peek().clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(Expr::Variable { name, line })
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expression()?;
                if *self.peek() != TokenKind::RParen {
                    return self.unexpected("')'");
                }
                self.advance();
                Ok(inner)
            }
            TokenKind::LBracket => self.parse_block(),
            TokenKind::Binary(op) if op == "<" => self.parse_primitive(),
            TokenKind::Binary(op) if op == "-" => {
                self.advance();
                match self.advance() {
                    TokenKind::Integer(n) => Ok(Expr::Literal {
                        value: Literal::Integer(-n),
                        line,
                    }),
                    TokenKind::Float(f) => Ok(Expr::Literal {
                        value: Literal::Float(-f),
                        line,
                    }),
                    _ => self.error("'-' must be followed by a number here"),
                }
            }
            TokenKind::ArrayStart => {
                self.advance();
                Ok(Expr::Literal {
                    value: self.parse_array_literal()?,
                    line,
                })
            }
            _ => match self.parse_literal()? {
                Some(value) => Ok(Expr::Literal { value, line }),
                None => self.unexpected("expression"),
            },
        }
    }

    /// Scalar literals; `None` if the next token is not one.
    fn parse_literal(&mut self) -> ParseResult<Option<Literal>> {
        let literal = match self.peek().clone() {
            TokenKind::Integer(n) => Literal::Integer(n),
            TokenKind::Float(f) => Literal::Float(f),
            TokenKind::Character(c) => Literal::Character(c),
            TokenKind::String(s) => Literal::String(s),
            TokenKind::Symbol(s) => Literal::Symbol(s),
            _ => return Ok(None),
        };
        self.advance();
        Ok(Some(literal))
    }

    /// Elements after `#(` or a nested `(`, through the closing `)`.
    fn parse_array_literal(&mut self) -> ParseResult<Literal> {
        let mut items = Vec::new();
        loop {
            if let Some(literal) = self.parse_literal()? {
                items.push(literal);
                continue;
            }
            match self.advance() {
                TokenKind::RParen => return Ok(Literal::Array(items)),
                TokenKind::LParen | TokenKind::ArrayStart => items.push(self.parse_array_literal()?),
                TokenKind::Identifier(name) => items.push(match name.as_str() {
                    "nil" => Literal::Nil,
                    "true" => Literal::True,
                    "false" => Literal::False,
                    _ => Literal::Symbol(name),
                }),
                TokenKind::Keyword(mut selector) => {
                    while let TokenKind::Keyword(part) = self.peek().clone() {
                        self.advance();
                        selector.push_str(&part);
                    }
                    items.push(Literal::Symbol(selector));
                }
                TokenKind::Binary(op) => {
                    let negated = match (op.as_str(), self.peek()) {
                        ("-", TokenKind::Integer(n)) => Some(Literal::Integer(-n)),
                        ("-", TokenKind::Float(f)) => Some(Literal::Float(-f)),
                        _ => None,
                    };
                    match negated {
                        Some(literal) => {
                            self.advance();
                            items.push(literal);
                        }
                        None => items.push(Literal::Symbol(op)),
                    }
                }
                TokenKind::Eof => return self.error("unterminated literal array"),
                TokenKind::Error(message) => return self.error(message),
                other => return self.error(format!("unexpected {other:?} in literal array")),
            }
        }
    }

    fn parse_block(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        self.advance();
        let mut params = Vec::new();
        while *self.peek() == TokenKind::Colon {
            self.advance();
            params.push(self.expect_identifier()?);
        }
        if !params.is_empty() {
            if self.is_binary("|") {
                self.advance();
            } else if *self.peek() != TokenKind::RBracket {
                return self.unexpected("'|' after block parameters");
            }
        }
        let temps = self.parse_temporaries()?;
        let body = self.parse_statements()?;
        if *self.peek() != TokenKind::RBracket {
            return self.unexpected("']'");
        }
        self.advance();
        Ok(Expr::Block(Block {
            params,
            temps,
            body,
            line,
        }))
    }

    fn parse_primitive(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        self.advance();
        let number = match self.advance() {
            TokenKind::Integer(n) => u16::try_from(n).or_else(|_| self.error("primitive number out of range"))?,
            _ => return self.error("primitive number expected after '<'"),
        };
        let mut args = Vec::new();
        while !self.is_binary(">") {
            if *self.peek() == TokenKind::Eof {
                return self.unexpected("'>'");
            }
            args.push(self.parse_primary()?);
        }
        self.advance();
        Ok(Expr::Primitive { number, args, line })
    }
}
