use std::fmt;

use crate::runtime::{SymbolId, Value};

const FIXNUM_TAG: u64 = 0b1;
const SYMBOL_TAG: u64 = 0b10;
const SYMBOL_MASK: u64 = 0b11;
const REFERENCE_TAG: u64 = 0b100;
const REFERENCE_MASK: u64 = 0b111;

const INDEX_SHIFT: u32 = 3;
const INDEX_BITS: u32 = 32;
const GENERATION_SHIFT: u32 = INDEX_SHIFT + INDEX_BITS;

/// Generations wrap within the bits left above the slot index.
pub const GENERATION_MASK: u32 = (1 << (64 - GENERATION_SHIFT)) - 1;

/// The 64-bit opaque word native code holds in place of a managed value.
///
/// Small integers, symbols and the special constants are encoded in the bits
/// themselves; anything else names a slot in the bridge's handle table.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Handle(u64);

/// Decoded shape of a handle word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Fixnum(i64),
    Symbol(SymbolId),
    Reference { index: u32, generation: u32 },
    Special(Value),
    Invalid,
}

impl Handle {
    pub const FALSE: Self = Self(0x00);
    pub const NIL: Self = Self(0x08);
    pub const TRUE: Self = Self(0x10);
    pub const UNDEF: Self = Self(0x18);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Encodes a small integer. The caller guarantees `n` fits in 63 bits.
    pub(crate) const fn fixnum(n: i64) -> Self {
        Self(((n as u64) << 1) | FIXNUM_TAG)
    }

    pub(crate) const fn symbol(id: SymbolId) -> Self {
        Self(((id.0 as u64) << 2) | SYMBOL_TAG)
    }

    pub(crate) const fn reference(index: u32, generation: u32) -> Self {
        let generation = (generation & GENERATION_MASK) as u64;
        Self((generation << GENERATION_SHIFT) | ((index as u64) << INDEX_SHIFT) | REFERENCE_TAG)
    }

    /// Pure bit encoding for values that need no table entry.
    pub(crate) fn immediate(value: Value) -> Option<Self> {
        match value {
            Value::False => Some(Self::FALSE),
            Value::Nil => Some(Self::NIL),
            Value::True => Some(Self::TRUE),
            Value::Undef => Some(Self::UNDEF),
            Value::Fixnum(n) => Value::fixnum(n).map(|_| Self::fixnum(n)),
            Value::Symbol(id) => Some(Self::symbol(id)),
            Value::Object(_) => None,
        }
    }

    pub fn kind(self) -> HandleKind {
        let bits = self.0;
        if bits & FIXNUM_TAG != 0 {
            return HandleKind::Fixnum((bits as i64) >> 1);
        }
        if bits & SYMBOL_MASK == SYMBOL_TAG {
            return match u32::try_from(bits >> 2) {
                Ok(id) => HandleKind::Symbol(SymbolId(id)),
                Err(_) => HandleKind::Invalid,
            };
        }
        if bits & REFERENCE_MASK == REFERENCE_TAG {
            return HandleKind::Reference {
                index: (bits >> INDEX_SHIFT) as u32,
                generation: (bits >> GENERATION_SHIFT) as u32,
            };
        }
        match self {
            Self::FALSE => HandleKind::Special(Value::False),
            Self::NIL => HandleKind::Special(Value::Nil),
            Self::TRUE => HandleKind::Special(Value::True),
            Self::UNDEF => HandleKind::Special(Value::Undef),
            _ => HandleKind::Invalid,
        }
    }

    pub fn is_immediate(self) -> bool {
        !matches!(self.kind(), HandleKind::Reference { .. } | HandleKind::Invalid)
    }

    /// Truthiness: only `false` and `nil` are falsy.
    pub const fn test(self) -> bool {
        self.0 & !Self::NIL.0 != 0
    }

    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }

    pub fn is_undef(self) -> bool {
        self == Self::UNDEF
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            HandleKind::Fixnum(n) => write!(f, "Handle(fixnum {n})"),
            HandleKind::Symbol(id) => write!(f, "Handle(symbol #{})", id.0),
            HandleKind::Reference { index, generation } => {
                write!(f, "Handle(slot {index} gen {generation})")
            }
            HandleKind::Special(value) => write!(f, "Handle({value})"),
            HandleKind::Invalid => write!(f, "Handle(invalid {:#x})", self.0),
        }
    }
}

impl fmt::LowerHex for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixnums_round_trip_through_bits() {
        for n in [0, 1, -1, 42, -42, crate::runtime::FIXNUM_MAX, crate::runtime::FIXNUM_MIN] {
            assert_eq!(Handle::fixnum(n).kind(), HandleKind::Fixnum(n));
        }
    }

    #[test]
    fn specials_have_fixed_encodings() {
        assert_eq!(Handle::immediate(Value::False), Some(Handle::from_bits(0x00)));
        assert_eq!(Handle::immediate(Value::Nil), Some(Handle::from_bits(0x08)));
        assert_eq!(Handle::immediate(Value::True), Some(Handle::from_bits(0x10)));
        assert_eq!(Handle::immediate(Value::Undef), Some(Handle::from_bits(0x18)));
        assert_eq!(Handle::from_bits(0x20).kind(), HandleKind::Invalid);
    }

    #[test]
    fn truthiness() {
        assert!(!Handle::FALSE.test());
        assert!(!Handle::NIL.test());
        assert!(Handle::TRUE.test());
        assert!(Handle::fixnum(0).test());
        assert!(Handle::UNDEF.test());
    }

    #[test]
    fn references_carry_index_and_generation() {
        let handle = Handle::reference(12, 7);
        assert_eq!(
            handle.kind(),
            HandleKind::Reference {
                index: 12,
                generation: 7
            }
        );
        assert!(!handle.is_immediate());
        let wrapped = Handle::reference(u32::MAX, GENERATION_MASK + 3);
        assert_eq!(
            wrapped.kind(),
            HandleKind::Reference {
                index: u32::MAX,
                generation: 2
            }
        );
    }

    #[test]
    fn symbols_decode() {
        let handle = Handle::symbol(SymbolId(9));
        assert_eq!(handle.kind(), HandleKind::Symbol(SymbolId(9)));
        assert_eq!(handle.to_bits() & 0b11, 0b10);
    }
}
