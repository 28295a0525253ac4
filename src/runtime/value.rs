use std::fmt;

/// Smallest integer representable without a heap allocation.
pub const FIXNUM_MIN: i64 = -(1 << 62);
/// Largest integer representable without a heap allocation.
pub const FIXNUM_MAX: i64 = (1 << 62) - 1;

/// Index into the runtime's interned symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

/// Identity of a heap object. Never reused within one runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

/// A managed value as the runtime sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Nil,
    True,
    False,
    /// "No value" sentinel; never visible to managed code.
    Undef,
    Fixnum(i64),
    Symbol(SymbolId),
    Object(ObjectId),
}

impl Value {
    /// A small integer, or `None` when `n` needs a heap integer.
    pub fn fixnum(n: i64) -> Option<Self> {
        (FIXNUM_MIN..=FIXNUM_MAX).contains(&n).then_some(Self::Fixnum(n))
    }

    pub fn bool(b: bool) -> Self {
        if b { Self::True } else { Self::False }
    }

    pub fn is_truthy(self) -> bool {
        !matches!(self, Self::Nil | Self::False)
    }

    pub fn is_nil(self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn object_id(self) -> Option<ObjectId> {
        match self {
            Self::Object(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("nil"),
            Self::True => f.write_str("true"),
            Self::False => f.write_str("false"),
            Self::Undef => f.write_str("undef"),
            Self::Fixnum(n) => write!(f, "{n}"),
            Self::Symbol(id) => write!(f, "sym#{}", id.0),
            Self::Object(id) => write!(f, "obj#{}", id.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixnum_range_is_63_bits() {
        assert_eq!(Value::fixnum(0), Some(Value::Fixnum(0)));
        assert_eq!(Value::fixnum(FIXNUM_MAX), Some(Value::Fixnum(FIXNUM_MAX)));
        assert_eq!(Value::fixnum(FIXNUM_MIN), Some(Value::Fixnum(FIXNUM_MIN)));
        assert_eq!(Value::fixnum(FIXNUM_MAX + 1), None);
        assert_eq!(Value::fixnum(i64::MIN), None);
    }

    #[test]
    fn only_nil_and_false_are_falsy() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::False.is_truthy());
        assert!(Value::Fixnum(0).is_truthy());
        assert!(Value::Undef.is_truthy());
    }
}
