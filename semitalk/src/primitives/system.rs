use std::io::{BufRead, Write};

use crate::error::{CompileError, VmError};
use crate::interpreter::Machine;

pub fn shut_down(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    machine.pop()?;
    machine.stop();
    let result = machine.boolean(true);
    machine.push(result)
}

/// `Compiler compile: source in: aClass lastValueNeeded: aBoolean`.
/// Answers the new method, or nil when the source does not compile.
pub fn compile(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let flag = machine.pop()?;
    let class = machine.pop()?;
    let source = machine.pop()?;
    let value_needed = if flag == machine.registers.known.true_object {
        true
    } else if flag == machine.registers.known.false_object {
        false
    } else {
        return Err(VmError::IllegalCompileFlag);
    };
    let text = machine.string_value(source)?;

    match machine.compile(&text, class, value_needed) {
        Ok(method) => machine.push(method),
        Err(CompileError::Machine(e)) => Err(e),
        Err(e) => {
            log::warn!("compilation failed: {e}");
            let nil = machine.nil();
            machine.push(nil)
        }
    }
}

/// Reads one line (with its newline) from the machine's input.
pub fn input(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    machine.pop()?;
    let mut line = String::new();
    if machine.input.read_line(&mut line)? == 0 {
        return Err(VmError::EndOfInput);
    }
    let string = machine.new_string(&line)?;
    machine.push(string)
}

/// Prints the message and turns on instruction tracing.
pub fn halt(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let message = machine.pop()?;
    let text = machine.string_value(message)?;
    writeln!(machine.output, "\n{text}")?;
    machine.output.flush()?;
    log::info!("halt: {text}; tracing enabled");
    machine.tracing = true;
    let nil = machine.nil();
    machine.push(nil)
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor};

    use crate::bootstrap::bootstrap;
    use crate::error::{EvalError, VmError};
    use crate::interpreter::{Completion, Machine};
    use crate::memory::MemorySettings;
    use crate::value::Value;

    fn eval(m: &mut Machine, source: &str) -> Result<Value, EvalError> {
        match m.evaluate(source)? {
            Completion::Returned(v) => Ok(v),
            Completion::ShutDown => panic!("shutdown"),
        }
    }

    #[test]
    fn test_compile_primitive_installs_working_method() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let v = eval(
            &mut m,
            "| method |
             method := Compiler compile: 'double ^self * 2' in: ShortInteger lastValueNeeded: false.
             ShortInteger methods at: #double put: method.
             21 double",
        )
        .unwrap();
        assert_eq!(v, Value::SmallInt(42));
    }

    #[test]
    fn test_compile_failure_answers_nil() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let v = eval(
            &mut m,
            "Compiler compile: 'broken ^^' in: Object lastValueNeeded: false",
        )
        .unwrap();
        assert_eq!(v, m.nil());
    }

    #[test]
    fn test_compile_flag_must_be_boolean() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let err = eval(&mut m, "Compiler compile: 'x ^1' in: Object lastValueNeeded: 3").unwrap_err();
        assert!(matches!(err, EvalError::Fatal(VmError::IllegalCompileFlag)), "{err}");
    }

    #[test]
    fn test_input_reads_lines_until_eof() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        m.set_io(Box::new(Cursor::new(b"first\n".to_vec())), Box::new(io::sink()));
        let line = eval(&mut m, "String input").unwrap();
        assert_eq!(m.string_value(line).unwrap(), "first\n");
        let err = eval(&mut m, "String input").unwrap_err();
        assert!(matches!(err, EvalError::Fatal(VmError::EndOfInput)), "{err}");
    }

    #[test]
    fn test_halt_enables_tracing() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        m.set_io(Box::new(Cursor::new(Vec::new())), Box::new(io::sink()));
        assert!(!m.tracing);
        eval(&mut m, "nil halt: 'stop here'. 1").unwrap();
        assert!(m.tracing);
    }
}
