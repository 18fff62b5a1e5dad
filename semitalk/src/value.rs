use std::fmt;

/// Bit 31 of a word: the word is a small integer, not an address.
const SMALL_INT_TAG: u32 = 1 << 31;
/// Bit 30 of a word: the small integer is negative.
const NEGATIVE_TAG: u32 = 1 << 30;

pub const SMALL_INT_MIN: i32 = -(1 << 30);
pub const SMALL_INT_MAX: i32 = (1 << 30) - 1;

/// Byte offset of an object header inside the object arena.
///
/// Addresses always have the small integer tag clear, so an encoded
/// address can never be mistaken for an integer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u32);

impl Address {
    pub const fn new(offset: u32) -> Option<Self> {
        if offset & SMALL_INT_TAG != 0 {
            None
        } else {
            Some(Self(offset))
        }
    }

    pub fn from_offset(offset: usize) -> Option<Self> {
        u32::try_from(offset).ok().and_then(Self::new)
    }

    #[inline]
    pub const fn offset(self) -> usize {
        self.0 as usize
    }
}

/// An object reference: either an immediate small integer or a heap
/// address. All tag arithmetic lives in [`Value::encode`] and
/// [`Value::decode`].
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    SmallInt(i32),
    Ref(Address),
}

impl Value {
    /// The object at address 0. During bootstrap this is where nil is
    /// allocated, so it doubles as the placeholder before nil exists.
    pub const ZERO_REF: Value = Value::Ref(Address(0));

    /// Builds a small integer, or `None` when `value` is outside
    /// `SMALL_INT_MIN..=SMALL_INT_MAX`.
    pub fn small(value: i64) -> Option<Value> {
        if (SMALL_INT_MIN as i64..=SMALL_INT_MAX as i64).contains(&value) {
            Some(Value::SmallInt(value as i32))
        } else {
            None
        }
    }

    pub fn from_usize(value: usize) -> Option<Value> {
        i64::try_from(value).ok().and_then(Value::small)
    }

    #[inline]
    pub fn is_small_int(self) -> bool {
        matches!(self, Value::SmallInt(_))
    }

    #[inline]
    pub fn as_small_int(self) -> Option<i32> {
        match self {
            Value::SmallInt(v) => Some(v),
            Value::Ref(_) => None,
        }
    }

    #[inline]
    pub fn as_address(self) -> Option<Address> {
        match self {
            Value::Ref(a) => Some(a),
            Value::SmallInt(_) => None,
        }
    }

    /// Packs the value into a 32-bit memory word.
    pub fn encode(self) -> u32 {
        match self {
            Value::Ref(address) => address.0,
            Value::SmallInt(v) if v < 0 => {
                debug_assert!(v >= SMALL_INT_MIN);
                // two's complement of [-2^30, -1] already has bits 31 and 30 set
                v as u32
            }
            Value::SmallInt(v) => {
                debug_assert!(v <= SMALL_INT_MAX);
                v as u32 | SMALL_INT_TAG
            }
        }
    }

    pub fn decode(word: u32) -> Value {
        if word & SMALL_INT_TAG == 0 {
            Value::Ref(Address(word))
        } else if word & NEGATIVE_TAG != 0 {
            Value::SmallInt(word as i32)
        } else {
            Value::SmallInt((word & !SMALL_INT_TAG) as i32)
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::SmallInt(v) => write!(f, "{v}"),
            Value::Ref(a) => write!(f, "@{:#x}", a.0),
        }
    }
}
