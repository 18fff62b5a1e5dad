//! Syntax tree produced by the parser and consumed by code generation.

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    Character(u8),
    String(String),
    Symbol(String),
    /// Only inside literal arrays.
    Nil,
    True,
    False,
    Array(Vec<Literal>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub selector: String,
    pub args: Vec<Expr>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Variable {
        name: String,
        line: usize,
    },
    Literal {
        value: Literal,
        line: usize,
    },
    Assign {
        name: String,
        value: Box<Expr>,
        line: usize,
    },
    Send {
        receiver: Box<Expr>,
        message: Message,
    },
    /// `receiver m1; m2; m3`: every message goes to the same receiver.
    Cascade {
        receiver: Box<Expr>,
        messages: Vec<Message>,
    },
    Block(Block),
    /// `<number arg...>`
    Primitive {
        number: u16,
        args: Vec<Expr>,
        line: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Expr(Expr),
    Return(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub params: Vec<String>,
    pub temps: Vec<String>,
    pub body: Vec<Statement>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodNode {
    pub selector: String,
    pub args: Vec<String>,
    pub temps: Vec<String>,
    pub body: Vec<Statement>,
}

impl Expr {
    /// True for `super`, whose sends start lookup above the method's class.
    pub fn is_super(&self) -> bool {
        matches!(self, Expr::Variable { name, .. } if name == "super")
    }

    /// Source line the expression starts on.
    pub fn line(&self) -> usize {
        match self {
            Expr::Variable { line, .. }
            | Expr::Literal { line, .. }
            | Expr::Assign { line, .. }
            | Expr::Primitive { line, .. } => *line,
            Expr::Send { receiver, .. } | Expr::Cascade { receiver, .. } => receiver.line(),
            Expr::Block(block) => block.line,
        }
    }
}
