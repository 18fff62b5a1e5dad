//! Native operations reached through the `Primitive` instruction.
//!
//! The instruction carries a primitive number; it is mapped onto
//! [`Primitive`] here and nowhere else. Every primitive pops its
//! arguments (receiver included) and pushes exactly one result, except
//! block activation, whose result arrives when the block returns.

use crate::error::VmError;
use crate::interpreter::Machine;
use crate::value::Value;

pub mod block;
pub mod fixnum;
pub mod object;
pub mod string;
pub mod system;

pub type PrimitiveFn = fn(&mut Machine, usize) -> Result<(), VmError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    /// Receiver plus zero to three block arguments.
    Block,
}

#[derive(Clone, Copy)]
pub struct PrimitiveDesc {
    pub name: &'static str,
    pub arity: Arity,
    pub func: PrimitiveFn,
}

impl PrimitiveDesc {
    pub const fn new(name: &'static str, arity: usize, func: PrimitiveFn) -> Self {
        Self {
            name,
            arity: Arity::Exact(arity),
            func,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Primitive {
    ShutDown = 7,
    Class = 11,
    Size = 12,
    Hash = 13,
    Identical = 20,
    NewWords = 21,
    NewBytes = 22,
    NewPointers = 23,
    Concatenate = 24,
    WordAt = 25,
    ByteAt = 26,
    PointerAt = 27,
    StringAt = 29,
    Compile = 30,
    WordAtPut = 35,
    ByteAtPut = 36,
    PointerAtPut = 37,
    StringAtPut = 39,
    CharacterValue = 56,
    CharacterFromValue = 57,
    Add = 60,
    Subtract = 61,
    Remainder = 67,
    Multiply = 68,
    Quotient = 69,
    BlockValue = 90,
    Input = 130,
    Halt = 132,
    OutputString = 133,
    OutputCharacter = 134,
    Less = 251,
    LessEqual = 252,
    BitAnd = 253,
    BitOr = 254,
    BitXor = 255,
}

impl TryFrom<u16> for Primitive {
    type Error = VmError;

    fn try_from(number: u16) -> Result<Self, VmError> {
        use Primitive::*;
        let primitive = match number {
            7 => ShutDown,
            11 => Class,
            12 => Size,
            13 => Hash,
            20 => Identical,
            21 => NewWords,
            22 => NewBytes,
            23 => NewPointers,
            24 => Concatenate,
            25 => WordAt,
            26 => ByteAt,
            27 => PointerAt,
            29 => StringAt,
            30 => Compile,
            35 => WordAtPut,
            36 => ByteAtPut,
            37 => PointerAtPut,
            39 => StringAtPut,
            56 => CharacterValue,
            57 => CharacterFromValue,
            60 => Add,
            61 => Subtract,
            67 => Remainder,
            68 => Multiply,
            69 => Quotient,
            90 => BlockValue,
            130 => Input,
            132 => Halt,
            133 => OutputString,
            134 => OutputCharacter,
            251 => Less,
            252 => LessEqual,
            253 => BitAnd,
            254 => BitOr,
            255 => BitXor,
            other => return Err(VmError::IllegalPrimitive(other)),
        };
        Ok(primitive)
    }
}

impl Primitive {
    pub fn desc(self) -> PrimitiveDesc {
        use Primitive::*;
        match self {
            ShutDown => PrimitiveDesc::new("shutDown", 1, system::shut_down),
            Class => PrimitiveDesc::new("class", 1, object::class),
            Size => PrimitiveDesc::new("size", 1, object::size),
            Hash => PrimitiveDesc::new("hash", 1, object::hash),
            Identical => PrimitiveDesc::new("==", 2, object::identical),
            NewWords => PrimitiveDesc::new("newWords", 2, object::new_words),
            NewBytes => PrimitiveDesc::new("newBytes", 2, object::new_bytes),
            NewPointers => PrimitiveDesc::new("newPointers", 2, object::new_pointers),
            Concatenate => PrimitiveDesc::new(",", 2, string::concatenate),
            WordAt => PrimitiveDesc::new("wordAt:", 2, object::word_at),
            ByteAt => PrimitiveDesc::new("byteAt:", 2, object::byte_at),
            PointerAt => PrimitiveDesc::new("at:", 2, object::pointer_at),
            StringAt => PrimitiveDesc::new("stringAt:", 2, string::string_at),
            Compile => PrimitiveDesc::new("compile:in:lastValueNeeded:", 3, system::compile),
            WordAtPut => PrimitiveDesc::new("wordAt:put:", 3, object::word_at_put),
            ByteAtPut => PrimitiveDesc::new("byteAt:put:", 3, object::byte_at_put),
            PointerAtPut => PrimitiveDesc::new("at:put:", 3, object::pointer_at_put),
            StringAtPut => PrimitiveDesc::new("stringAt:put:", 3, string::string_at_put),
            CharacterValue => PrimitiveDesc::new("asciiValue", 1, string::character_value),
            CharacterFromValue => PrimitiveDesc::new("value:", 1, string::character_from_value),
            Add => PrimitiveDesc::new("+", 2, fixnum::add),
            Subtract => PrimitiveDesc::new("-", 2, fixnum::subtract),
            Remainder => PrimitiveDesc::new("\\\\", 2, fixnum::remainder),
            Multiply => PrimitiveDesc::new("*", 2, fixnum::multiply),
            Quotient => PrimitiveDesc::new("//", 2, fixnum::quotient),
            BlockValue => PrimitiveDesc {
                name: "value",
                arity: Arity::Block,
                func: block::value,
            },
            Input => PrimitiveDesc::new("input", 1, system::input),
            Halt => PrimitiveDesc::new("halt:", 1, system::halt),
            OutputString => PrimitiveDesc::new("output", 1, string::output_string),
            OutputCharacter => PrimitiveDesc::new("outputCharacter", 1, string::output_character),
            Less => PrimitiveDesc::new("<", 2, fixnum::less),
            LessEqual => PrimitiveDesc::new("<=", 2, fixnum::less_equal),
            BitAnd => PrimitiveDesc::new("bitAnd:", 2, fixnum::bit_and),
            BitOr => PrimitiveDesc::new("bitOr:", 2, fixnum::bit_or),
            BitXor => PrimitiveDesc::new("bitXor:", 2, fixnum::bit_xor),
        }
    }
}

/// Runs primitive `number` with `argc` stack arguments (receiver included).
pub fn invoke(machine: &mut Machine, number: u16, argc: usize) -> Result<(), VmError> {
    let primitive = Primitive::try_from(number)?;
    let desc = primitive.desc();
    let accepted = match desc.arity {
        Arity::Exact(n) => n == argc,
        Arity::Block => (1..=4).contains(&argc),
    };
    if !accepted {
        let expected = match desc.arity {
            Arity::Exact(n) => n,
            Arity::Block => 1,
        };
        return Err(VmError::PrimitiveArity {
            primitive: number,
            expected,
            got: argc,
        });
    }
    log::trace!("primitive {number} {}", desc.name);
    (desc.func)(machine, argc)
}

/// Converts a 1-based index operand to a 0-based body index.
pub(crate) fn one_based(machine: &Machine, operation: &'static str, index: Value) -> Result<usize, VmError> {
    let i = machine.expect_small(operation, index)?;
    if i < 1 {
        return Err(VmError::IndexOutOfRange {
            operation,
            index: i as i64,
            size: 0,
        });
    }
    Ok(i as usize - 1)
}
