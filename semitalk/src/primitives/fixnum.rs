use crate::error::VmError;
use crate::interpreter::Machine;
use crate::value::Value;

fn operands(machine: &mut Machine, operation: &'static str) -> Result<(i32, i32), VmError> {
    let rhs = machine.pop()?;
    let lhs = machine.pop()?;
    Ok((machine.expect_small(operation, lhs)?, machine.expect_small(operation, rhs)?))
}

fn push_integer(machine: &mut Machine, operation: &'static str, result: i64) -> Result<(), VmError> {
    let value = Value::small(result).ok_or(VmError::IntegerOverflow { operation })?;
    machine.push(value)
}

pub fn add(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let (a, b) = operands(machine, "+")?;
    push_integer(machine, "+", a as i64 + b as i64)
}

pub fn subtract(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let (a, b) = operands(machine, "-")?;
    push_integer(machine, "-", a as i64 - b as i64)
}

pub fn multiply(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let (a, b) = operands(machine, "*")?;
    push_integer(machine, "*", a as i64 * b as i64)
}

/// Truncating division.
pub fn quotient(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let (a, b) = operands(machine, "//")?;
    if b == 0 {
        return Err(VmError::DivisionByZero { operation: "//" });
    }
    push_integer(machine, "//", a as i64 / b as i64)
}

/// Remainder of truncating division; takes the sign of the dividend.
pub fn remainder(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let (a, b) = operands(machine, "\\\\")?;
    if b == 0 {
        return Err(VmError::DivisionByZero { operation: "\\\\" });
    }
    push_integer(machine, "\\\\", a as i64 % b as i64)
}

pub fn less(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let (a, b) = operands(machine, "<")?;
    let result = machine.boolean(a < b);
    machine.push(result)
}

pub fn less_equal(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let (a, b) = operands(machine, "<=")?;
    let result = machine.boolean(a <= b);
    machine.push(result)
}

// bitwise results of two in-range operands stay in range

pub fn bit_and(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let (a, b) = operands(machine, "bitAnd:")?;
    push_integer(machine, "bitAnd:", (a & b) as i64)
}

pub fn bit_or(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let (a, b) = operands(machine, "bitOr:")?;
    push_integer(machine, "bitOr:", (a | b) as i64)
}

pub fn bit_xor(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let (a, b) = operands(machine, "bitXor:")?;
    push_integer(machine, "bitXor:", (a ^ b) as i64)
}

#[cfg(test)]
mod tests {
    use crate::bootstrap::bootstrap;
    use crate::error::{EvalError, VmError};
    use crate::interpreter::{Completion, Machine};
    use crate::memory::MemorySettings;
    use crate::value::{SMALL_INT_MAX, SMALL_INT_MIN, Value};

    fn eval(m: &mut Machine, source: &str) -> Result<Value, EvalError> {
        match m.evaluate(source)? {
            Completion::Returned(v) => Ok(v),
            Completion::ShutDown => panic!("shutdown"),
        }
    }

    #[test]
    fn test_arithmetic() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        assert_eq!(eval(&mut m, "7 - 10").unwrap(), Value::SmallInt(-3));
        assert_eq!(eval(&mut m, "6 * 7").unwrap(), Value::SmallInt(42));
        assert_eq!(eval(&mut m, "-7 // 2").unwrap(), Value::SmallInt(-3));
        assert_eq!(eval(&mut m, "-7 \\\\ 2").unwrap(), Value::SmallInt(-1));
        assert_eq!(eval(&mut m, "12 bitAnd: 10").unwrap(), Value::SmallInt(8));
        assert_eq!(eval(&mut m, "12 bitOr: 3").unwrap(), Value::SmallInt(15));
        assert_eq!(eval(&mut m, "5 bitXor: 1").unwrap(), Value::SmallInt(4));
        assert_eq!(eval(&mut m, "3 < 4").unwrap(), m.registers.known.true_object);
        assert_eq!(eval(&mut m, "4 <= 3").unwrap(), m.registers.known.false_object);
    }

    #[test]
    fn test_range_edges() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let max = eval(&mut m, &format!("{} - 1 + 1", SMALL_INT_MAX)).unwrap();
        assert_eq!(max, Value::SmallInt(SMALL_INT_MAX));
        let min = eval(&mut m, &format!("{} + 1 - 1", SMALL_INT_MIN)).unwrap();
        assert_eq!(min, Value::SmallInt(SMALL_INT_MIN));
    }

    #[test]
    fn test_overflow_is_fatal() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let err = eval(&mut m, &format!("{} + 1", SMALL_INT_MAX)).unwrap_err();
        assert!(matches!(err, EvalError::Fatal(VmError::IntegerOverflow { .. })), "{err}");
    }

    #[test]
    fn test_division_by_zero_is_fatal() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let err = eval(&mut m, "1 // 0").unwrap_err();
        assert!(matches!(err, EvalError::Fatal(VmError::DivisionByZero { .. })), "{err}");
    }

    #[test]
    fn test_non_integer_operand_is_fatal() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let err = eval(&mut m, "1 + nil").unwrap_err();
        assert!(matches!(err, EvalError::Fatal(VmError::ExpectedSmallInt { .. })), "{err}");
    }
}
