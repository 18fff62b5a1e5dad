//! Name resolution and bytecode generation.
//!
//! Resolution order for a name: pseudo variables, then block scopes from
//! the innermost outwards, method temporaries, arguments, instance
//! variables, and finally globals (capitalized names that already exist
//! in `Smalltalk`). Block parameters and temporaries live in fresh
//! method temporary slots so a block reads and writes them through its
//! home context.

use crate::bytecode::Instruction;
use crate::compiler::ast::{Block, Expr, Literal, Message, MethodNode, Statement};
use crate::error::CompileError;
use crate::interpreter::Machine;
use crate::primitives::Primitive;
use crate::value::Value;

/// A literal frame entry, materialized into an object at install time.
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralEntry {
    Constant(Literal),
    /// Message selector.
    Symbol(String),
    /// The `Smalltalk` association named here.
    Global(String),
}

/// Everything needed to build a Method object.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledMethod {
    pub selector: String,
    pub code: Vec<Instruction>,
    pub literals: Vec<LiteralEntry>,
    pub arg_size: usize,
    pub temp_size: usize,
    pub stack_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Variable {
    SelfRef,
    Nil,
    True,
    False,
    Temp(u16),
    Arg(u16),
    Instance(u16),
    Global(String),
}

const PSEUDO_VARIABLES: [&str; 5] = ["self", "super", "nil", "true", "false"];

pub struct CodeGenerator<'m> {
    machine: &'m Machine,
    instance_variables: Vec<String>,
    args: Vec<String>,
    /// Method temporaries first, then one scope per enclosing block.
    scopes: Vec<Vec<(String, u16)>>,
    temp_count: usize,
    code: Vec<Instruction>,
    literals: Vec<LiteralEntry>,
    depth: isize,
    max_depth: isize,
    /// Line of the expression being generated, for errors raised by `emit`.
    line: usize,
}

impl<'m> CodeGenerator<'m> {
    pub fn new(machine: &'m Machine, instance_variables: Vec<String>) -> Self {
        Self {
            machine,
            instance_variables,
            args: Vec::new(),
            scopes: Vec::new(),
            temp_count: 0,
            code: Vec::new(),
            literals: Vec::new(),
            depth: 0,
            max_depth: 0,
            line: 1,
        }
    }

    pub fn generate(mut self, method: &MethodNode, value_needed: bool) -> Result<CompiledMethod, CompileError> {
        for (i, name) in method.args.iter().enumerate() {
            self.check_declaration(name, 1)?;
            if method.args[..i].contains(name) {
                return Err(CompileError::semantic(1, format!("duplicate argument {name}")));
            }
        }
        self.args = method.args.clone();
        let mut temps = Vec::new();
        for name in &method.temps {
            self.check_declaration(name, 1)?;
            if temps.iter().any(|(t, _)| t == name) {
                return Err(CompileError::semantic(1, format!("duplicate temporary {name}")));
            }
            temps.push((name.clone(), self.new_temp(1)?));
        }
        self.scopes.push(temps);

        self.generate_method_body(&method.body, value_needed)?;

        Ok(CompiledMethod {
            selector: method.selector.clone(),
            code: self.code,
            literals: self.literals,
            arg_size: method.args.len(),
            temp_size: self.temp_count,
            stack_size: self.max_depth.max(0) as usize,
        })
    }

    fn generate_method_body(&mut self, body: &[Statement], value_needed: bool) -> Result<(), CompileError> {
        let Some((last, rest)) = body.split_last() else {
            self.emit(Instruction::PushSelf)?;
            self.emit(Instruction::ReturnMethod)?;
            return Ok(());
        };
        for statement in rest {
            self.generate_statement(statement)?;
        }
        match last {
            Statement::Return(expr) => {
                self.generate_expr(expr, true)?;
                self.emit(Instruction::ReturnMethod)?;
            }
            Statement::Expr(expr) if value_needed => {
                self.generate_expr(expr, true)?;
                self.emit(Instruction::ReturnMethod)?;
            }
            Statement::Expr(expr) => {
                self.generate_expr(expr, false)?;
                self.emit(Instruction::PushSelf)?;
                self.emit(Instruction::ReturnMethod)?;
            }
        }
        Ok(())
    }

    /// A statement whose value is discarded.
    fn generate_statement(&mut self, statement: &Statement) -> Result<(), CompileError> {
        match statement {
            Statement::Expr(expr) => self.generate_expr(expr, false),
            Statement::Return(expr) => {
                self.generate_expr(expr, true)?;
                self.emit(Instruction::ReturnMethod)?;
                Ok(())
            }
        }
    }

    fn generate_expr(&mut self, expr: &Expr, needed: bool) -> Result<(), CompileError> {
        self.line = expr.line();
        match expr {
            Expr::Variable { name, line } => {
                let variable = self.resolve(name, *line)?;
                if needed {
                    self.push_variable(variable, *line)?;
                }
            }
            Expr::Literal { value, line } => {
                if needed {
                    self.push_literal(value.clone(), *line)?;
                }
            }
            Expr::Assign { name, value, line } => {
                let store = match self.resolve(name, *line)? {
                    Variable::Temp(index) => Instruction::StoreTemp { index },
                    Variable::Instance(index) => Instruction::StoreInstance { index },
                    Variable::Global(name) => Instruction::StoreGlobal {
                        literal: self.add_literal(LiteralEntry::Global(name), *line)?,
                    },
                    _ => return Err(CompileError::semantic(*line, format!("cannot assign to {name}"))),
                };
                self.generate_expr(value, true)?;
                if needed {
                    self.emit(Instruction::Dup)?;
                }
                self.emit(store)?;
            }
            Expr::Send { receiver, message } => {
                self.generate_expr(receiver, true)?;
                self.generate_message(message, receiver.is_super())?;
                if !needed {
                    self.emit(Instruction::Drop)?;
                }
            }
            Expr::Cascade { receiver, messages } => {
                self.generate_expr(receiver, true)?;
                let to_super = receiver.is_super();
                let last = messages.len() - 1;
                for (i, message) in messages.iter().enumerate() {
                    if i < last {
                        self.emit(Instruction::Dup)?;
                    }
                    self.generate_message(message, to_super)?;
                    if i < last || !needed {
                        self.emit(Instruction::Drop)?;
                    }
                }
            }
            Expr::Block(block) => {
                self.generate_block(block)?;
                if !needed {
                    self.emit(Instruction::Drop)?;
                }
            }
            Expr::Primitive { number, args, line } => {
                if Primitive::try_from(*number).is_err() {
                    return Err(CompileError::semantic(*line, format!("unknown primitive {number}")));
                }
                for arg in args {
                    self.generate_expr(arg, true)?;
                }
                let argc = u8::try_from(args.len())
                    .map_err(|_| CompileError::semantic(*line, "too many primitive arguments"))?;
                self.emit(Instruction::Primitive { argc, number: *number })?;
                if !needed {
                    self.emit(Instruction::Drop)?;
                }
            }
        }
        Ok(())
    }

    /// Arguments, then the send. The receiver is already on the stack.
    fn generate_message(&mut self, message: &Message, to_super: bool) -> Result<(), CompileError> {
        for arg in &message.args {
            self.generate_expr(arg, true)?;
        }
        let argc = u8::try_from(message.args.len())
            .map_err(|_| CompileError::semantic(message.line, "too many message arguments"))?;
        let selector = self.add_literal(LiteralEntry::Symbol(message.selector.clone()), message.line)?;
        if to_super {
            self.emit(Instruction::SendSuper { argc, selector })?;
        } else {
            self.emit(Instruction::Send { argc, selector })?;
        }
        Ok(())
    }

    /// `PUSHBLK argc,stack; JUMP end; <body>` with both operands patched
    /// once the body is known.
    fn generate_block(&mut self, block: &Block) -> Result<(), CompileError> {
        let argc = u8::try_from(block.params.len())
            .map_err(|_| CompileError::semantic(block.line, "too many block parameters"))?;
        let push_at = self.emit(Instruction::PushBlock { argc, stack_size: 0 })?;
        let jump_at = self.emit(Instruction::Jump { target: 0 })?;

        let outer = (self.depth, self.max_depth);
        self.depth = argc as isize;
        self.max_depth = argc as isize;

        let mut scope: Vec<(String, u16)> = Vec::new();
        for name in block.params.iter().chain(&block.temps) {
            self.check_declaration(name, block.line)?;
            if scope.iter().any(|(s, _)| s == name) {
                return Err(CompileError::semantic(block.line, format!("duplicate block variable {name}")));
            }
            scope.push((name.clone(), self.new_temp(block.line)?));
        }
        let params: Vec<u16> = scope[..block.params.len()].iter().map(|(_, i)| *i).collect();
        self.scopes.push(scope);

        // the first argument is on top of the block's stack
        for index in params {
            self.emit(Instruction::StoreTemp { index })?;
        }
        match block.body.split_last() {
            None => {
                self.emit(Instruction::PushNil)?;
                self.emit(Instruction::ReturnBlock)?;
            }
            Some((last, rest)) => {
                for statement in rest {
                    self.generate_statement(statement)?;
                }
                match last {
                    Statement::Return(expr) => {
                        self.generate_expr(expr, true)?;
                        self.emit(Instruction::ReturnMethod)?;
                    }
                    Statement::Expr(expr) => {
                        self.generate_expr(expr, true)?;
                        self.emit(Instruction::ReturnBlock)?;
                    }
                }
            }
        }
        self.scopes.pop();

        let stack_size = u16::try_from(self.max_depth.max(0))
            .map_err(|_| CompileError::semantic(block.line, "block stack too deep"))?;
        (self.depth, self.max_depth) = outer;

        let end = u16::try_from(self.code.len()).map_err(|_| CompileError::semantic(block.line, "method too large"))?;
        self.code[push_at] = Instruction::PushBlock { argc, stack_size };
        self.code[jump_at] = Instruction::Jump { target: end };
        Ok(())
    }

    fn push_variable(&mut self, variable: Variable, line: usize) -> Result<(), CompileError> {
        let instruction = match variable {
            Variable::SelfRef => Instruction::PushSelf,
            Variable::Nil => Instruction::PushNil,
            Variable::True => Instruction::PushTrue,
            Variable::False => Instruction::PushFalse,
            Variable::Temp(index) => Instruction::PushTemp { index },
            Variable::Arg(index) => Instruction::PushArg { index },
            Variable::Instance(index) => Instruction::PushInstance { index },
            Variable::Global(name) => Instruction::PushGlobal {
                literal: self.add_literal(LiteralEntry::Global(name), line)?,
            },
        };
        self.emit(instruction)?;
        Ok(())
    }

    fn push_literal(&mut self, literal: Literal, line: usize) -> Result<(), CompileError> {
        check_literal(&literal, line)?;
        let literal = self.add_literal(LiteralEntry::Constant(literal), line)?;
        self.emit(Instruction::PushConst { literal })?;
        Ok(())
    }

    fn resolve(&self, name: &str, line: usize) -> Result<Variable, CompileError> {
        match name {
            "self" | "super" => return Ok(Variable::SelfRef),
            "nil" => return Ok(Variable::Nil),
            "true" => return Ok(Variable::True),
            "false" => return Ok(Variable::False),
            _ => {}
        }
        for scope in self.scopes.iter().rev() {
            if let Some((_, index)) = scope.iter().find(|(n, _)| n == name) {
                return Ok(Variable::Temp(*index));
            }
        }
        if let Some(i) = self.args.iter().position(|a| a == name) {
            return Ok(Variable::Arg(i as u16));
        }
        if let Some(i) = self.instance_variables.iter().rposition(|v| v == name) {
            let index = u16::try_from(i).map_err(|_| CompileError::semantic(line, "too many instance variables"))?;
            return Ok(Variable::Instance(index));
        }
        if name.starts_with(|c: char| c.is_ascii_uppercase()) {
            if self.machine.lookup_global(name)?.is_some() {
                return Ok(Variable::Global(name.to_string()));
            }
            return Err(CompileError::semantic(line, format!("undefined global {name}")));
        }
        Err(CompileError::semantic(line, format!("undefined variable {name}")))
    }

    /// A new name may not hide a pseudo variable or a name already in an
    /// enclosing scope.
    fn check_declaration(&self, name: &str, line: usize) -> Result<(), CompileError> {
        if PSEUDO_VARIABLES.contains(&name) {
            return Err(CompileError::semantic(line, format!("cannot redefine {name}")));
        }
        let visible = self.args.iter().any(|a| a == name)
            || self.scopes.iter().flatten().any(|(n, _)| n == name);
        if visible {
            return Err(CompileError::semantic(line, format!("{name} is already defined")));
        }
        Ok(())
    }

    fn new_temp(&mut self, line: usize) -> Result<u16, CompileError> {
        let index = u16::try_from(self.temp_count).map_err(|_| CompileError::semantic(line, "too many temporaries"))?;
        self.temp_count += 1;
        Ok(index)
    }

    /// Selectors and globals are shared; other constants get their own slot.
    fn add_literal(&mut self, entry: LiteralEntry, line: usize) -> Result<u16, CompileError> {
        if !matches!(entry, LiteralEntry::Constant(_)) {
            if let Some(i) = self.literals.iter().position(|l| *l == entry) {
                return Ok(i as u16);
            }
        }
        let index = u16::try_from(self.literals.len()).map_err(|_| CompileError::semantic(line, "too many literals"))?;
        self.literals.push(entry);
        Ok(index)
    }

    fn emit(&mut self, instruction: Instruction) -> Result<usize, CompileError> {
        if self.code.len() >= u16::MAX as usize {
            return Err(CompileError::semantic(self.line, "method too large"));
        }
        self.depth += instruction.stack_effect();
        self.max_depth = self.max_depth.max(self.depth);
        self.code.push(instruction);
        Ok(self.code.len() - 1)
    }
}

fn check_literal(literal: &Literal, line: usize) -> Result<(), CompileError> {
    match literal {
        Literal::Integer(n) if Value::small(*n).is_none() => Err(CompileError::semantic(
            line,
            format!("integer literal {n} out of range"),
        )),
        Literal::Array(items) => items.iter().try_for_each(|item| check_literal(item, line)),
        _ => Ok(()),
    }
}
