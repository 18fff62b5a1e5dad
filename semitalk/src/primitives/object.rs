use crate::error::VmError;
use crate::interpreter::Machine;
use crate::memory::ObjectKind;
use crate::primitives::one_based;
use crate::value::Value;

pub fn class(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let receiver = machine.pop()?;
    let class = machine.class_of(receiver)?;
    machine.push(class)
}

pub fn size(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let receiver = machine.pop()?;
    let size = machine.memory.size(receiver)?;
    let size = machine.small_value("size", size)?;
    machine.push(size)
}

pub fn hash(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let receiver = machine.pop()?;
    let hash = machine.memory.hash(receiver)?;
    machine.push(Value::SmallInt(hash as i32))
}

pub fn identical(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let other = machine.pop()?;
    let receiver = machine.pop()?;
    let result = machine.boolean(receiver == other);
    machine.push(result)
}

fn new_object(machine: &mut Machine, kind: ObjectKind) -> Result<(), VmError> {
    let size = machine.pop()?;
    let size = machine.expect_index("new:", size)?;
    let class = machine.pop()?;
    let object = machine.create_object(class, size, kind)?;
    machine.push(object)
}

pub fn new_words(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    new_object(machine, ObjectKind::Words)
}

pub fn new_bytes(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    new_object(machine, ObjectKind::Bytes)
}

pub fn new_pointers(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    new_object(machine, ObjectKind::Pointers)
}

/// Pops `index` then the receiver.
fn indexed(machine: &mut Machine, operation: &'static str) -> Result<(Value, usize), VmError> {
    let index = machine.pop()?;
    let receiver = machine.pop()?;
    Ok((receiver, one_based(machine, operation, index)?))
}

pub fn word_at(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let (receiver, i) = indexed(machine, "wordAt:")?;
    let word = machine.memory.get_word(receiver, i)?;
    let value = Value::small(word as i64).ok_or(VmError::IntegerOverflow { operation: "wordAt:" })?;
    machine.push(value)
}

pub fn byte_at(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let (receiver, i) = indexed(machine, "byteAt:")?;
    let byte = machine.memory.get_byte(receiver, i)?;
    machine.push(Value::SmallInt(byte as i32))
}

pub fn pointer_at(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let (receiver, i) = indexed(machine, "at:")?;
    let value = machine.memory.get_ptr(receiver, i)?;
    machine.push(value)
}

pub fn word_at_put(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let value = machine.pop()?;
    let (receiver, i) = indexed(machine, "wordAt:put:")?;
    let n = machine.expect_small("wordAt:put:", value)?;
    let word = u32::try_from(n).map_err(|_| VmError::ValueOutOfRange {
        operation: "wordAt:put:",
        value: n as i64,
    })?;
    machine.memory.set_word(receiver, i, word)?;
    machine.push(value)
}

pub fn byte_at_put(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let value = machine.pop()?;
    let (receiver, i) = indexed(machine, "byteAt:put:")?;
    let n = machine.expect_small("byteAt:put:", value)?;
    let byte = u8::try_from(n).map_err(|_| VmError::ValueOutOfRange {
        operation: "byteAt:put:",
        value: n as i64,
    })?;
    machine.memory.set_byte(receiver, i, byte)?;
    machine.push(value)
}

pub fn pointer_at_put(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let value = machine.pop()?;
    let (receiver, i) = indexed(machine, "at:put:")?;
    machine.memory.set_ptr(receiver, i, value)?;
    machine.push(value)
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
    fn test_new_array_is_nil_filled() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let a = eval(&mut m, "Array new: 4").unwrap();
        assert_eq!(m.memory.size(a).unwrap(), 4);
        for i in 0..4 {
            assert_eq!(m.memory.get_ptr(a, i).unwrap(), m.nil());
        }
    }

    #[test]
    fn test_indexing_is_one_based() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let v = eval(&mut m, "| a | a := Array new: 3. a at: 1 put: 10. a at: 3 put: 30. (a at: 1) + (a at: 3)").unwrap();
        assert_eq!(v, Value::SmallInt(40));
        let err = eval(&mut m, "(Array new: 3) at: 0").unwrap_err();
        assert!(matches!(err, EvalError::Fatal(VmError::IndexOutOfRange { .. })), "{err}");
        let err = eval(&mut m, "(Array new: 3) at: 4").unwrap_err();
        assert!(matches!(err, EvalError::Fatal(VmError::IndexOutOfRange { .. })), "{err}");
    }

    #[test]
    fn test_word_arrays() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let v = eval(&mut m, "| w | w := WordArray new: 2. w at: 2 put: 123456. (w at: 1) + (w at: 2)").unwrap();
        assert_eq!(v, Value::SmallInt(123456));
    }

    #[test]
    fn test_identity_and_reflection() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        assert_eq!(eval(&mut m, "3 == 3").unwrap(), m.registers.known.true_object);
        assert_eq!(eval(&mut m, "#foo == #foo").unwrap(), m.registers.known.true_object);
        assert_eq!(eval(&mut m, "'a' == 'a'").unwrap(), m.registers.known.false_object);
        assert_eq!(eval(&mut m, "3 class").unwrap(), m.registers.known.short_integer);
        assert_eq!(eval(&mut m, "42 hash").unwrap(), Value::SmallInt(0));
        assert_eq!(eval(&mut m, "'hello' size").unwrap(), Value::SmallInt(5));
    }

    #[test]
    fn test_wrong_arity_is_fatal() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let err = eval(&mut m, "<60 1>").unwrap_err();
        assert!(
            matches!(err, EvalError::Fatal(VmError::PrimitiveArity { primitive: 60, expected: 2, got: 1 })),
            "{err}"
        );
    }
}
