use std::io::Write;

use crate::error::VmError;
use crate::interpreter::Machine;
use crate::memory::ObjectKind;
use crate::primitives::one_based;
use crate::value::Value;

/// `a , b`: a new String holding the bytes of both (strings or symbols).
pub fn concatenate(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let rhs = machine.pop()?;
    let lhs = machine.pop()?;
    let (lhs_len, rhs_len) = (machine.memory.size(lhs)?, machine.memory.size(rhs)?);
    // both operands must be byte objects before anything is allocated
    machine.memory.bytes(lhs)?;
    machine.memory.bytes(rhs)?;

    let base = machine.hold(&[lhs, rhs]);
    let class = machine.registers.known.string;
    let result = machine.create_object(class, lhs_len + rhs_len, ObjectKind::Bytes)?;
    let [lhs, rhs] = machine.release(base);

    let mut joined = Vec::with_capacity(lhs_len + rhs_len);
    joined.extend_from_slice(machine.memory.bytes(lhs)?);
    joined.extend_from_slice(machine.memory.bytes(rhs)?);
    machine.memory.bytes_mut(result)?.copy_from_slice(&joined);
    machine.push(result)
}

pub fn string_at(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let index = machine.pop()?;
    let receiver = machine.pop()?;
    let i = one_based(machine, "at:", index)?;
    let byte = machine.memory.get_byte(receiver, i)?;
    let character = machine.character(byte);
    machine.push(character)
}

pub fn string_at_put(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let value = machine.pop()?;
    let index = machine.pop()?;
    let receiver = machine.pop()?;
    let i = one_based(machine, "at:put:", index)?;
    let byte = machine.character_value(value)?;
    machine.memory.set_byte(receiver, i, byte)?;
    machine.push(value)
}

pub fn character_value(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let receiver = machine.pop()?;
    let byte = machine.character_value(receiver)?;
    machine.push(Value::SmallInt(byte as i32))
}

pub fn character_from_value(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let value = machine.pop()?;
    let n = machine.expect_small("Character value:", value)?;
    let byte = u8::try_from(n).map_err(|_| VmError::ValueOutOfRange {
        operation: "Character value:",
        value: n as i64,
    })?;
    let character = machine.character(byte);
    machine.push(character)
}

pub fn output_string(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let receiver = machine.pop()?;
    let bytes = machine.memory.bytes(receiver)?;
    machine.output.write_all(bytes)?;
    machine.output.flush()?;
    machine.push(receiver)
}

pub fn output_character(machine: &mut Machine, _argc: usize) -> Result<(), VmError> {
    let receiver = machine.pop()?;
    let byte = machine.character_value(receiver)?;
    machine.output.write_all(&[byte])?;
    machine.output.flush()?;
    machine.push(receiver)
}
