use std::io;

use thiserror::Error;

use crate::memory::ObjectKind;
use crate::value::Value;

/// Fatal runtime errors. Any of these means an invariant of the machine or
/// of the code it runs is broken; callers report and stop.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("{operation}: {value:?} is a small integer, not an object")]
    NotAnObject { operation: &'static str, value: Value },

    #[error("{operation}: expected a {expected:?} object")]
    WrongKind {
        operation: &'static str,
        expected: ObjectKind,
    },

    #[error("{operation}: index {index} out of range for size {size}")]
    IndexOutOfRange {
        operation: &'static str,
        index: i64,
        size: usize,
    },

    #[error("{operation}: reference {value:?} points outside the object arena")]
    DanglingReference { operation: &'static str, value: Value },

    #[error("object memory exhausted allocating {requested} bytes")]
    MemoryExhausted { requested: usize },

    #[error("collector overflow: to-space cannot hold live objects")]
    CollectorOverflow,

    #[error("message not understood: {class} >> #{selector}")]
    MessageNotUnderstood { class: String, selector: String },

    #[error("argument count mismatch: #{selector} expects {expected}, sent with {got}")]
    ArgumentCountMismatch {
        selector: String,
        expected: usize,
        got: usize,
    },

    #[error("primitive {primitive} expects {expected} arguments, got {got}")]
    PrimitiveArity {
        primitive: u16,
        expected: usize,
        got: usize,
    },

    #[error("block expects {expected} arguments, got {got}")]
    BlockArity { expected: usize, got: usize },

    #[error("illegal opcode {0:#04x}")]
    IllegalOpcode(u8),

    #[error("illegal primitive {0}")]
    IllegalPrimitive(u16),

    #[error("cannot return: method context already returned")]
    DoubleReturn,

    #[error("cannot return: block context has no caller")]
    OrphanBlockReturn,

    #[error("corrupt context: {0}")]
    CorruptContext(&'static str),

    #[error("{operation}: expected a small integer, got {value:?}")]
    ExpectedSmallInt { operation: &'static str, value: Value },

    #[error("{operation}: expected a character")]
    ExpectedCharacter { operation: &'static str },

    #[error("{operation}: value {value} out of range")]
    ValueOutOfRange { operation: &'static str, value: i64 },

    #[error("small integer overflow in {operation}")]
    IntegerOverflow { operation: &'static str },

    #[error("division by zero in {operation}")]
    DivisionByZero { operation: &'static str },

    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("compile flag must be true or false")]
    IllegalCompileFlag,

    #[error("no compiler installed")]
    NoCompiler,

    #[error("end of input")]
    EndOfInput,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Recoverable failures while compiling one unit of source.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("line {line}: syntax error: {message}")]
    Syntax { line: usize, message: String },

    #[error("line {line}: {message}")]
    Semantic { line: usize, message: String },

    /// Raised while materializing the method; not recoverable.
    #[error(transparent)]
    Machine(#[from] VmError),
}

impl CompileError {
    pub fn syntax(line: usize, message: impl Into<String>) -> Self {
        CompileError::Syntax {
            line,
            message: message.into(),
        }
    }

    pub fn semantic(line: usize, message: impl Into<String>) -> Self {
        CompileError::Semantic {
            line,
            message: message.into(),
        }
    }
}

/// Failure of a host evaluation: the source did not compile, or running
/// it hit a fatal error.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error(transparent)]
    Compile(CompileError),

    #[error(transparent)]
    Fatal(#[from] VmError),
}

impl From<CompileError> for EvalError {
    fn from(error: CompileError) -> Self {
        match error {
            CompileError::Machine(e) => EvalError::Fatal(e),
            other => EvalError::Compile(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("not an image file (bad magic)")]
    BadMagic,

    #[error("image major version {found} does not match {expected}")]
    WrongVersion { found: u32, expected: u32 },

    #[error("image holds {size} bytes, semispace holds {capacity}")]
    TooLarge { size: usize, capacity: usize },

    #[error("corrupt image: {0}")]
    Corrupt(&'static str),

    #[error("cannot save image: {0}")]
    Busy(&'static str),

    #[error("invalid memory settings: {0}")]
    Settings(&'static str),

    #[error(transparent)]
    Machine(#[from] VmError),
}

/// A class file that cannot be read as a whole. Failures of single
/// methods are not errors at this level.
#[derive(Debug, Error)]
pub enum FileInError {
    #[error("class file line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("class file line {line}: unknown class {name}")]
    UnknownClass { line: usize, name: String },

    #[error("class file i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Machine(#[from] VmError),
}

impl FileInError {
    pub fn syntax(line: usize, message: impl Into<String>) -> Self {
        FileInError::Syntax {
            line,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    ClassFile(#[from] FileInError),

    #[error("class {0} is required but was not defined")]
    MissingClass(&'static str),

    #[error("compiling {class}: {error}")]
    Compile { class: String, error: CompileError },

    #[error("invalid memory settings: {0}")]
    Settings(&'static str),

    #[error(transparent)]
    Machine(#[from] VmError),
}
