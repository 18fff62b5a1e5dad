use crate::error::VmError;
use crate::interpreter::Machine;
use crate::layout::{block_context, context};
use crate::value::Value;

/// `aBlock value: ...`. Moves the arguments from the caller's stack into
/// the block's own stack, rewinds the block to its first instruction and
/// activates it. The block's result is pushed when it returns.
pub fn value(machine: &mut Machine, argc: usize) -> Result<(), VmError> {
    let block = machine.peek(argc - 1)?;
    if machine.class_of(block)? != machine.registers.known.block_context {
        return Err(VmError::CorruptContext("value sent to a non-block"));
    }
    let expected = machine.index_field(block, block_context::ARG_COUNT)?;
    if expected != argc - 1 {
        return Err(VmError::BlockArity {
            expected,
            got: argc - 1,
        });
    }

    let caller = machine.registers.active_context;
    let start = machine.memory.get_ptr(block, block_context::IP_START)?;
    machine.memory.set_ptr(block, context::CALLER, caller)?;
    machine.memory.set_ptr(block, context::IP, start)?;

    let stack = machine.memory.get_ptr(block, context::STACK)?;
    for i in 0..expected {
        let arg = machine.pop()?;
        machine.memory.set_ptr(stack, i, arg)?;
    }
    machine
        .memory
        .set_ptr(block, context::SP, Value::SmallInt(expected as i32))?;

    let block = machine.pop()?;
    machine.activate_context(block)
}

#[cfg(test)]
mod tests {
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
    fn test_block_arguments_arrive_in_order() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let v = eval(&mut m, "[:a :b :c | (a * 100) + (b * 10) + c] value: 1 value: 2 value: 3").unwrap();
        assert_eq!(v, Value::SmallInt(123));
    }

    #[test]
    fn test_block_sees_home_temporaries() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let v = eval(&mut m, "| n inc | n := 1. inc := [n := n + 1]. inc value. inc value. n").unwrap();
        assert_eq!(v, Value::SmallInt(3));
    }

    #[test]
    fn test_empty_block_answers_nil() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let v = eval(&mut m, "[] value").unwrap();
        assert_eq!(v, m.nil());
    }

    #[test]
    fn test_block_arity_mismatch_is_fatal() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let err = eval(&mut m, "[:x | x] value").unwrap_err();
        assert!(
            matches!(err, EvalError::Fatal(VmError::BlockArity { expected: 1, got: 0 })),
            "{err}"
        );
    }
}
