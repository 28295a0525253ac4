//! Packing arbitrary-precision integers into native word buffers.

use std::fmt;
use std::ops::BitOr;

use num_bigint::{BigInt, BigUint, Sign};

use super::{BridgeError, Context, Flow, Handle};

/// Layout flags for [`pack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PackFlags(pub u32);

impl PackFlags {
    pub const MSWORD_FIRST: Self = Self(0x01);
    pub const LSWORD_FIRST: Self = Self(0x02);
    pub const MSBYTE_FIRST: Self = Self(0x10);
    pub const LSBYTE_FIRST: Self = Self(0x20);
    pub const NATIVE_BYTE_ORDER: Self = Self(0x40);
    pub const TWOS_COMPLEMENT: Self = Self(0x80);
    pub const FORCE_GENERIC_IMPLEMENTATION: Self = Self(0x400);

    const WORD_ORDER_MASK: u32 = 0x03;
    const BYTE_ORDER_MASK: u32 = 0x70;
    const SUPPORTED: u32 = 0x01 | 0x02 | 0x10 | 0x20 | 0x40 | 0x80 | 0x400;

    const NAMES: [(&'static str, Self); 7] = [
        ("msword", Self::MSWORD_FIRST),
        ("lsword", Self::LSWORD_FIRST),
        ("msbyte", Self::MSBYTE_FIRST),
        ("lsbyte", Self::LSBYTE_FIRST),
        ("native", Self::NATIVE_BYTE_ORDER),
        ("2comp", Self::TWOS_COMPLEMENT),
        ("generic", Self::FORCE_GENERIC_IMPLEMENTATION),
    ];

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Parses a comma-separated list such as `lsword,lsbyte,2comp`.
    pub fn parse_names(list: &str) -> Result<Self, BridgeError> {
        let mut flags = Self::default();
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let (_, flag) = Self::NAMES
                .iter()
                .find(|(known, _)| known.eq_ignore_ascii_case(name))
                .ok_or_else(|| BridgeError::Argument(format!("unknown pack flag `{name}`")))?;
            flags = flags | *flag;
        }
        Ok(flags)
    }

    fn msword_first(self) -> bool {
        self.contains(Self::MSWORD_FIRST)
    }

    fn msbyte_first(self) -> bool {
        self.contains(Self::MSBYTE_FIRST)
            || (self.contains(Self::NATIVE_BYTE_ORDER) && cfg!(target_endian = "big"))
    }
}

impl BitOr for PackFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for PackFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = Self::NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect();
        write!(f, "{}", names.join(","))
    }
}

/// Checks a pack layout before anything is written.
pub fn validate_pack_format(
    numwords: usize,
    wordsize: usize,
    nails: usize,
    flags: PackFlags,
) -> Result<(), BridgeError> {
    let word_order = flags.0 & PackFlags::WORD_ORDER_MASK;
    let byte_order = flags.0 & PackFlags::BYTE_ORDER_MASK;
    let fail = |message: String| Err(BridgeError::Argument(message));

    if flags.0 & !PackFlags::SUPPORTED != 0 {
        return fail("unsupported flags specified".into());
    }
    if word_order == 0 {
        if numwords > 1 {
            return fail("word order not specified".into());
        }
    } else if word_order != PackFlags::MSWORD_FIRST.0 && word_order != PackFlags::LSWORD_FIRST.0 {
        return fail("unexpected word order".into());
    }
    if byte_order == 0 {
        return fail("byte order not specified".into());
    }
    if ![
        PackFlags::MSBYTE_FIRST.0,
        PackFlags::LSBYTE_FIRST.0,
        PackFlags::NATIVE_BYTE_ORDER.0,
    ]
    .contains(&byte_order)
    {
        return fail("unexpected byte order".into());
    }
    if wordsize == 0 {
        return fail(format!("invalid wordsize: {wordsize}"));
    }
    if wordsize > 8 {
        return fail(format!("too big wordsize: {wordsize}"));
    }
    if wordsize <= nails / 8 {
        return fail(format!("too big nails: {nails}"));
    }
    if i32::MAX as usize / wordsize < numwords {
        return fail(format!(
            "too big numwords * wordsize: {numwords} * {wordsize}"
        ));
    }
    Ok(())
}

/// Serialises `value` into `buffer` as `numwords` words of `wordsize` bytes,
/// each with `nails` zeroed high bits.
///
/// Returns the sign of `value` (`-1`, `0`, `1`), doubled when the value did
/// not fit and the buffer holds only its low-order bits.
pub fn pack(
    value: &BigInt,
    buffer: &mut [u8],
    numwords: usize,
    wordsize: usize,
    nails: usize,
    flags: PackFlags,
) -> Result<i32, BridgeError> {
    validate_pack_format(numwords, wordsize, nails, flags)?;
    if buffer.len() != numwords * wordsize {
        return Err(BridgeError::Argument(format!(
            "buffer holds {} bytes, {numwords} * {wordsize} expected",
            buffer.len()
        )));
    }

    let word_bits = wordsize * 8 - nails;
    let capacity = numwords * word_bits;
    let twos_complement = flags.contains(PackFlags::TWOS_COMPLEMENT);
    let negative = value.sign() == Sign::Minus;

    // A negative value's two's-complement bit length is that of `|value| - 1`,
    // so only values below `-2^capacity` are truncated.
    let overflow = if negative && twos_complement {
        (value.magnitude() - BigUint::from(1u8)).bits() > capacity as u64
    } else {
        value.magnitude().bits() > capacity as u64
    };

    let encoded: BigUint = if negative && twos_complement {
        let modulus = BigInt::from(1u8) << capacity;
        let wrapped = ((value % &modulus) + &modulus) % &modulus;
        wrapped.magnitude().clone()
    } else {
        value.magnitude().clone()
    };
    let digits = encoded.to_u64_digits();

    for index in 0..numwords {
        let word = extract_bits(&digits, index * word_bits, word_bits);
        let position = if flags.msword_first() {
            numwords - 1 - index
        } else {
            index
        };
        let target = &mut buffer[position * wordsize..(position + 1) * wordsize];
        target.copy_from_slice(&word.to_le_bytes()[..wordsize]);
        if flags.msbyte_first() {
            target.reverse();
        }
    }

    let sign = match value.sign() {
        Sign::Minus => -1,
        Sign::NoSign => 0,
        Sign::Plus => 1,
    };
    Ok(if overflow { sign * 2 } else { sign })
}

/// `len` bits (at most 64) of the little-endian digit string starting at bit
/// `offset`.
fn extract_bits(digits: &[u64], offset: usize, len: usize) -> u64 {
    let digit = offset / 64;
    let shift = offset % 64;
    let low = digits.get(digit).copied().unwrap_or(0) >> shift;
    let high = if shift == 0 {
        0
    } else {
        digits.get(digit + 1).copied().unwrap_or(0) << (64 - shift)
    };
    let bits = low | high;
    if len >= 64 { bits } else { bits & ((1u64 << len) - 1) }
}

/// Bytes needed for the magnitude of `value`, and the number of unused high
/// bits in the most significant of them.
pub fn absint_size(value: &BigInt) -> (usize, u32) {
    let bits = value.magnitude().bits();
    let bytes = bits.div_ceil(8) as usize;
    let nlz = match bits % 8 {
        0 => 0,
        used => (8 - used) as u32,
    };
    (bytes, nlz)
}

/// Packs `value` into 64-bit two's-complement words, least significant word
/// first, native byte order.
pub fn big_pack(value: &BigInt, words: &mut [u64]) -> Result<i32, BridgeError> {
    let mut bytes = vec![0u8; words.len() * 8];
    let sign = pack(
        value,
        &mut bytes,
        words.len(),
        8,
        0,
        PackFlags::TWOS_COMPLEMENT | PackFlags::NATIVE_BYTE_ORDER | PackFlags::LSWORD_FIRST,
    )?;
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        *word = u64::from_ne_bytes(raw);
    }
    Ok(sign)
}

/// Reading integers back from word buffers is not supported.
pub fn unpack(
    _buffer: &[u8],
    _numwords: usize,
    _wordsize: usize,
    _nails: usize,
    _flags: PackFlags,
) -> Result<BigInt, BridgeError> {
    Err(BridgeError::NotImplemented(
        "integer unpack is not supported".into(),
    ))
}

impl Context<'_> {
    fn integer_of(&self, handle: Handle) -> Flow<BigInt> {
        let value = self.value(handle)?;
        match self.runtime().to_integer(value) {
            Some(integer) => Ok(integer),
            None => Err(self.fail(BridgeError::Type(format!(
                "no implicit conversion of {} into Integer",
                self.runtime().describe(value)
            )))),
        }
    }

    pub fn integer(&self, value: &BigInt) -> Handle {
        self.wrap(self.runtime().new_integer(value))
    }

    pub fn integer_pack(
        &self,
        value: Handle,
        buffer: &mut [u8],
        numwords: usize,
        wordsize: usize,
        nails: usize,
        flags: PackFlags,
    ) -> Flow<i32> {
        let integer = self.integer_of(value)?;
        self.check(pack(&integer, buffer, numwords, wordsize, nails, flags))
    }

    pub fn integer_unpack(
        &self,
        buffer: &[u8],
        numwords: usize,
        wordsize: usize,
        nails: usize,
        flags: PackFlags,
    ) -> Flow<Handle> {
        let integer = self.check(unpack(buffer, numwords, wordsize, nails, flags))?;
        Ok(self.integer(&integer))
    }

    pub fn absint_size(&self, value: Handle) -> Flow<(usize, u32)> {
        Ok(absint_size(&self.integer_of(value)?))
    }

    pub fn big_pack(&self, value: Handle, words: &mut [u64]) -> Flow<i32> {
        let integer = self.integer_of(value)?;
        self.check(big_pack(&integer, words))
    }
}
