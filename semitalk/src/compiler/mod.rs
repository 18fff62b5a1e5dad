//! Source to Method compiler.
//!
//! The machine only sees the [`Compiler`] trait; [`SourceCompiler`] is the
//! one it installs by default. Compilation is split in three passes:
//! [`parser`] builds the tree, [`codegen`] resolves names and emits
//! instructions into host vectors, and [`SourceCompiler`] materializes the
//! result as heap objects. Only the last pass allocates.

pub mod ast;
pub mod codegen;
pub mod lexer;
pub mod parser;

use crate::compiler::ast::Literal;
use crate::compiler::codegen::{CodeGenerator, CompiledMethod, LiteralEntry};
use crate::compiler::parser::Parser;
use crate::error::{CompileError, VmError};
use crate::interpreter::Machine;
use crate::layout::{behavior, method};
use crate::memory::ObjectKind;
use crate::value::Value;

pub trait Compiler {
    /// Compiles the method text `source` for `class` and answers a new,
    /// uninstalled Method. With `value_needed` a method whose last
    /// statement is not a return answers that statement's value.
    fn compile(
        &mut self,
        machine: &mut Machine,
        source: &str,
        class: Value,
        value_needed: bool,
    ) -> Result<Value, CompileError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SourceCompiler;

impl Compiler for SourceCompiler {
    fn compile(
        &mut self,
        machine: &mut Machine,
        source: &str,
        class: Value,
        value_needed: bool,
    ) -> Result<Value, CompileError> {
        let ast = Parser::new(source).parse_method()?;
        let instance_variables = instance_variables(machine, class)?;
        let compiled = CodeGenerator::new(machine, instance_variables).generate(&ast, value_needed)?;
        log::trace!(
            "compiled {}>>{} ({} instructions, {} literals)",
            machine.class_name(class),
            compiled.selector,
            compiled.code.len(),
            compiled.literals.len()
        );
        Ok(install(machine, source, class, &compiled)?)
    }
}

/// Instance variable names of `class`, those of the root class first.
pub fn instance_variables(machine: &Machine, class: Value) -> Result<Vec<String>, VmError> {
    let nil = machine.nil();
    let mut chain = Vec::new();
    let mut current = class;
    while current != nil {
        chain.push(current);
        current = machine.memory.get_ptr(current, behavior::SUPERCLASS)?;
    }
    let mut names = Vec::new();
    for &class in chain.iter().rev() {
        let variables = machine.memory.get_ptr(class, behavior::VARIABLES)?;
        if variables == nil {
            continue;
        }
        for i in 0..machine.memory.size(variables)? {
            let name = machine.memory.get_ptr(variables, i)?;
            names.push(machine.string_value(name)?);
        }
    }
    Ok(names)
}

/// Builds the Method object. The half-built method lives in the
/// `compiler_method` register so every allocation below may collect.
fn install(machine: &mut Machine, source: &str, class: Value, compiled: &CompiledMethod) -> Result<Value, VmError> {
    let base = machine.hold(&[class]);
    let method_class = machine.registers.known.method;
    let object = machine.create_object(method_class, method::SIZE, ObjectKind::Pointers)?;
    machine.registers.compiler_method = object;

    let text = machine.new_string(source)?;
    set_field(machine, method::TEXT, text)?;
    let selector = machine.new_symbol(&compiled.selector)?;
    set_field(machine, method::SELECTOR, selector)?;

    let word_array = machine.registers.known.word_array;
    let code = machine.create_object(word_array, compiled.code.len(), ObjectKind::Words)?;
    for (i, instruction) in compiled.code.iter().enumerate() {
        machine.memory.set_word(code, i, instruction.encode())?;
    }
    set_field(machine, method::CODE, code)?;

    if !compiled.literals.is_empty() {
        let array = machine.registers.known.array;
        let literals = machine.create_object(array, compiled.literals.len(), ObjectKind::Pointers)?;
        set_field(machine, method::LITERALS, literals)?;
        for (i, entry) in compiled.literals.iter().enumerate() {
            let value = materialize_entry(machine, entry)?;
            let literals = machine.memory.get_ptr(machine.registers.compiler_method, method::LITERALS)?;
            machine.memory.set_ptr(literals, i, value)?;
        }
    }

    let counts = [
        (method::ARG_SIZE, compiled.arg_size),
        (method::TEMP_SIZE, compiled.temp_size),
        (method::STACK_SIZE, compiled.stack_size),
    ];
    for (field, count) in counts {
        let count = machine.small_value("compile", count)?;
        set_field(machine, field, count)?;
    }
    let [class] = machine.release(base);
    set_field(machine, method::CLASS, class)?;

    let object = machine.registers.compiler_method;
    machine.registers.compiler_method = machine.nil();
    Ok(object)
}

fn set_field(machine: &mut Machine, field: usize, value: Value) -> Result<(), VmError> {
    machine
        .memory
        .set_ptr(machine.registers.compiler_method, field, value)
}

fn materialize_entry(machine: &mut Machine, entry: &LiteralEntry) -> Result<Value, VmError> {
    match entry {
        LiteralEntry::Constant(literal) => materialize(machine, literal),
        LiteralEntry::Symbol(name) => machine.new_symbol(name),
        LiteralEntry::Global(name) => machine.global_link(name),
    }
}

fn materialize(machine: &mut Machine, literal: &Literal) -> Result<Value, VmError> {
    match literal {
        Literal::Integer(n) => Value::small(*n).ok_or(VmError::ValueOutOfRange {
            operation: "literal",
            value: *n,
        }),
        Literal::Float(f) => machine.new_float(*f),
        Literal::Character(c) => Ok(machine.character(*c)),
        Literal::String(s) => machine.new_string(s),
        Literal::Symbol(s) => machine.new_symbol(s),
        Literal::Nil => Ok(machine.nil()),
        Literal::True => Ok(machine.boolean(true)),
        Literal::False => Ok(machine.boolean(false)),
        Literal::Array(items) => {
            let class = machine.registers.known.array;
            let array = machine.create_object(class, items.len(), ObjectKind::Pointers)?;
            let base = machine.hold(&[array]);
            for (i, item) in items.iter().enumerate() {
                let value = materialize(machine, item)?;
                let array = machine.registers.scratch[base];
                machine.memory.set_ptr(array, i, value)?;
            }
            let [array] = machine.release(base);
            Ok(array)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::bootstrap;
    use crate::interpreter::Completion;
    use crate::memory::MemorySettings;

    fn machine() -> Machine {
        bootstrap(MemorySettings::default()).unwrap()
    }

    fn eval(m: &mut Machine, source: &str) -> Value {
        match m.evaluate(source).unwrap() {
            Completion::Returned(v) => v,
            Completion::ShutDown => panic!("shutdown"),
        }
    }

    #[test]
    fn test_method_object_fields() {
        let mut m = machine();
        let class = m.registers.known.short_integer;
        let method = m.compile("double ^self * 2", class, false).unwrap();
        let selector = m.memory.get_ptr(method, method::SELECTOR).unwrap();
        assert_eq!(m.string_value(selector).unwrap(), "double");
        let text = m.memory.get_ptr(method, method::TEXT).unwrap();
        assert_eq!(m.string_value(text).unwrap(), "double ^self * 2");
        assert_eq!(m.memory.get_ptr(method, method::CLASS).unwrap(), class);
        assert_eq!(m.memory.get_ptr(method, method::ARG_SIZE).unwrap(), Value::SmallInt(0));
        assert_eq!(m.memory.get_ptr(method, method::STACK_SIZE).unwrap(), Value::SmallInt(2));
    }

    #[test]
    fn test_literal_kinds() {
        let mut m = machine();
        let v = eval(&mut m, "#(1 $a 'two' #three (4 5) nil) size");
        assert_eq!(v, Value::SmallInt(6));
        let v = eval(&mut m, "(#(1 (4 5)) at: 2) at: 2");
        assert_eq!(v, Value::SmallInt(5));
        let f = eval(&mut m, "2.5");
        assert_eq!(m.float_value(f).unwrap(), 2.5);
        assert_eq!(eval(&mut m, "#foo:bar: == #foo:bar:"), m.boolean(true));
    }

    #[test]
    fn test_instance_variables_come_from_the_whole_chain() {
        let m = machine();
        let metaclass_of_object = m.class_of(m.global_value("Object").unwrap().unwrap()).unwrap();
        let names = instance_variables(&m, metaclass_of_object).unwrap();
        assert_eq!(names, vec!["name", "instType", "instSize", "methods", "superclass", "variables"]);
    }

    #[test]
    fn test_compile_error_leaves_machine_usable() {
        let mut m = machine();
        let nil = m.nil();
        let class = m.class_of(nil).unwrap();
        assert!(matches!(m.compile("oops ^(1", class, false), Err(CompileError::Syntax { .. })));
        assert_eq!(eval(&mut m, "1 + 1"), Value::SmallInt(2));
    }

    #[test]
    fn test_compiling_under_collection_pressure() {
        let settings = MemorySettings {
            semispace_size: 256 * 1024,
            ..MemorySettings::default()
        };
        let mut m = bootstrap(settings).unwrap();
        for _ in 0..1000 {
            assert_eq!(eval(&mut m, "#(1 'a' #(2 'b')) size + 'padding' size"), Value::SmallInt(10));
        }
        assert!(m.memory.stats().collections > 0);
    }
}
