//! Instruction words.
//!
//! Every instruction is one 32-bit word: `op:u8 | small:u8 | large:u16`,
//! most significant byte first. `small` carries counts, `large` carries
//! literal, variable and jump indices.

use std::fmt;

use crate::error::VmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Nop = 0x00,
    PushSelf = 0x01,
    PushNil = 0x02,
    PushFalse = 0x03,
    PushTrue = 0x04,
    Dup = 0x05,
    Drop = 0x06,
    /// Return top of stack from the home method context.
    ReturnMethod = 0x07,
    /// Return top of stack from the active block context to its caller.
    ReturnBlock = 0x08,
    /// Operands: `large` = literal index
    PushConst = 0x09,
    /// Push the value of the global association at literal `large`.
    PushGlobal = 0x0A,
    StoreGlobal = 0x0B,
    /// Operands: `large` = instance variable index
    PushInstance = 0x0C,
    StoreInstance = 0x0D,
    PushArg = 0x0E,
    PushTemp = 0x0F,
    StoreTemp = 0x10,
    /// Create a block context whose body starts after the following jump.
    /// Operands: `small` = argument count, `large` = stack size
    PushBlock = 0x11,
    /// Operands: `small` = argument count, `large` = selector literal
    Send = 0x12,
    SendSuper = 0x13,
    /// Operands: `small` = argument count including receiver,
    /// `large` = primitive number
    Primitive = 0x14,
    /// Operands: `large` = absolute target
    Jump = 0x15,
}

impl TryFrom<u8> for Op {
    type Error = VmError;

    fn try_from(byte: u8) -> Result<Self, VmError> {
        let op = match byte {
            0x00 => Op::Nop,
            0x01 => Op::PushSelf,
            0x02 => Op::PushNil,
            0x03 => Op::PushFalse,
            0x04 => Op::PushTrue,
            0x05 => Op::Dup,
            0x06 => Op::Drop,
            0x07 => Op::ReturnMethod,
            0x08 => Op::ReturnBlock,
            0x09 => Op::PushConst,
            0x0A => Op::PushGlobal,
            0x0B => Op::StoreGlobal,
            0x0C => Op::PushInstance,
            0x0D => Op::StoreInstance,
            0x0E => Op::PushArg,
            0x0F => Op::PushTemp,
            0x10 => Op::StoreTemp,
            0x11 => Op::PushBlock,
            0x12 => Op::Send,
            0x13 => Op::SendSuper,
            0x14 => Op::Primitive,
            0x15 => Op::Jump,
            other => return Err(VmError::IllegalOpcode(other)),
        };
        Ok(op)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    PushSelf,
    PushNil,
    PushFalse,
    PushTrue,
    Dup,
    Drop,
    ReturnMethod,
    ReturnBlock,
    PushConst { literal: u16 },
    PushGlobal { literal: u16 },
    StoreGlobal { literal: u16 },
    PushInstance { index: u16 },
    StoreInstance { index: u16 },
    PushArg { index: u16 },
    PushTemp { index: u16 },
    StoreTemp { index: u16 },
    PushBlock { argc: u8, stack_size: u16 },
    Send { argc: u8, selector: u16 },
    SendSuper { argc: u8, selector: u16 },
    Primitive { argc: u8, number: u16 },
    Jump { target: u16 },
}

#[inline]
fn pack(op: Op, small: u8, large: u16) -> u32 {
    (op as u32) << 24 | (small as u32) << 16 | large as u32
}

impl Instruction {
    pub fn op(&self) -> Op {
        match self {
            Self::Nop => Op::Nop,
            Self::PushSelf => Op::PushSelf,
            Self::PushNil => Op::PushNil,
            Self::PushFalse => Op::PushFalse,
            Self::PushTrue => Op::PushTrue,
            Self::Dup => Op::Dup,
            Self::Drop => Op::Drop,
            Self::ReturnMethod => Op::ReturnMethod,
            Self::ReturnBlock => Op::ReturnBlock,
            Self::PushConst { .. } => Op::PushConst,
            Self::PushGlobal { .. } => Op::PushGlobal,
            Self::StoreGlobal { .. } => Op::StoreGlobal,
            Self::PushInstance { .. } => Op::PushInstance,
            Self::StoreInstance { .. } => Op::StoreInstance,
            Self::PushArg { .. } => Op::PushArg,
            Self::PushTemp { .. } => Op::PushTemp,
            Self::StoreTemp { .. } => Op::StoreTemp,
            Self::PushBlock { .. } => Op::PushBlock,
            Self::Send { .. } => Op::Send,
            Self::SendSuper { .. } => Op::SendSuper,
            Self::Primitive { .. } => Op::Primitive,
            Self::Jump { .. } => Op::Jump,
        }
    }

    pub fn encode(&self) -> u32 {
        let (small, large) = match *self {
            Self::PushConst { literal }
            | Self::PushGlobal { literal }
            | Self::StoreGlobal { literal } => (0, literal),
            Self::PushInstance { index }
            | Self::StoreInstance { index }
            | Self::PushArg { index }
            | Self::PushTemp { index }
            | Self::StoreTemp { index } => (0, index),
            Self::PushBlock { argc, stack_size } => (argc, stack_size),
            Self::Send { argc, selector } | Self::SendSuper { argc, selector } => (argc, selector),
            Self::Primitive { argc, number } => (argc, number),
            Self::Jump { target } => (0, target),
            _ => (0, 0),
        };
        pack(self.op(), small, large)
    }

    pub fn decode(word: u32) -> Result<Self, VmError> {
        let op = Op::try_from((word >> 24) as u8)?;
        let small = (word >> 16) as u8;
        let large = word as u16;
        let instruction = match op {
            Op::Nop => Self::Nop,
            Op::PushSelf => Self::PushSelf,
            Op::PushNil => Self::PushNil,
            Op::PushFalse => Self::PushFalse,
            Op::PushTrue => Self::PushTrue,
            Op::Dup => Self::Dup,
            Op::Drop => Self::Drop,
            Op::ReturnMethod => Self::ReturnMethod,
            Op::ReturnBlock => Self::ReturnBlock,
            Op::PushConst => Self::PushConst { literal: large },
            Op::PushGlobal => Self::PushGlobal { literal: large },
            Op::StoreGlobal => Self::StoreGlobal { literal: large },
            Op::PushInstance => Self::PushInstance { index: large },
            Op::StoreInstance => Self::StoreInstance { index: large },
            Op::PushArg => Self::PushArg { index: large },
            Op::PushTemp => Self::PushTemp { index: large },
            Op::StoreTemp => Self::StoreTemp { index: large },
            Op::PushBlock => Self::PushBlock {
                argc: small,
                stack_size: large,
            },
            Op::Send => Self::Send {
                argc: small,
                selector: large,
            },
            Op::SendSuper => Self::SendSuper {
                argc: small,
                selector: large,
            },
            Op::Primitive => Self::Primitive {
                argc: small,
                number: large,
            },
            Op::Jump => Self::Jump { target: large },
        };
        Ok(instruction)
    }

    /// Net operand stack effect, used to size method and block stacks.
    /// Block creation and jumps are accounted for by the code generator.
    pub fn stack_effect(&self) -> isize {
        match *self {
            Self::Nop | Self::Jump { .. } => 0,
            Self::PushSelf
            | Self::PushNil
            | Self::PushFalse
            | Self::PushTrue
            | Self::Dup
            | Self::PushConst { .. }
            | Self::PushGlobal { .. }
            | Self::PushInstance { .. }
            | Self::PushArg { .. }
            | Self::PushTemp { .. }
            | Self::PushBlock { .. } => 1,
            Self::Drop
            | Self::ReturnMethod
            | Self::ReturnBlock
            | Self::StoreGlobal { .. }
            | Self::StoreInstance { .. }
            | Self::StoreTemp { .. } => -1,
            Self::Send { argc, .. } | Self::SendSuper { argc, .. } => -(argc as isize),
            Self::Primitive { argc, .. } => 1 - argc as isize,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nop => write!(f, "Nop"),
            Self::PushSelf => write!(f, "PushSelf"),
            Self::PushNil => write!(f, "PushNil"),
            Self::PushFalse => write!(f, "PushFalse"),
            Self::PushTrue => write!(f, "PushTrue"),
            Self::Dup => write!(f, "Dup"),
            Self::Drop => write!(f, "Drop"),
            Self::ReturnMethod => write!(f, "ReturnMethod"),
            Self::ReturnBlock => write!(f, "ReturnBlock"),
            Self::PushConst { literal } => write!(f, "PushConst #{literal}"),
            Self::PushGlobal { literal } => write!(f, "PushGlobal #{literal}"),
            Self::StoreGlobal { literal } => write!(f, "StoreGlobal #{literal}"),
            Self::PushInstance { index } => write!(f, "PushInstance {index}"),
            Self::StoreInstance { index } => write!(f, "StoreInstance {index}"),
            Self::PushArg { index } => write!(f, "PushArg {index}"),
            Self::PushTemp { index } => write!(f, "PushTemp {index}"),
            Self::StoreTemp { index } => write!(f, "StoreTemp {index}"),
            Self::PushBlock { argc, stack_size } => {
                write!(f, "PushBlock {argc} [{stack_size}]")
            }
            Self::Send { argc, selector } => write!(f, "Send {argc} #{selector}"),
            Self::SendSuper { argc, selector } => {
                write!(f, "SendSuper {argc} #{selector}")
            }
            Self::Primitive { argc, number } => write!(f, "Primitive {number} ({argc})"),
            Self::Jump { target } => write!(f, "Jump @{target}"),
        }
    }
}
