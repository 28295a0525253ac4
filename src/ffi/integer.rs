use std::ffi::c_void;

use cext_symbols::{FfiFunction, FfiSignature, FfiType, SymbolRegistry};

use super::{deliver, raise_error, with_context};
use crate::bridge::integer::{PackFlags, validate_pack_format};
use crate::bridge::{BridgeError, Handle};

/// Packs `value` into `numwords` words of `wordsize` bytes at `words`.
///
/// # Safety
///
/// `words` must point to `numwords * wordsize` writable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn cext_integer_pack(
    value: u64,
    words: *mut c_void,
    numwords: usize,
    wordsize: usize,
    nails: usize,
    flags: i32,
) -> i32 {
    with_context("rb_integer_pack", |cx| {
        let flags = PackFlags(flags as u32);
        if let Err(err) = validate_pack_format(numwords, wordsize, nails, flags) {
            raise_error(cx, err);
            return 0;
        }
        let len = numwords * wordsize;
        if len > 0 && words.is_null() {
            raise_error(cx, BridgeError::Argument("null word buffer".into()));
            return 0;
        }
        let buffer: &mut [u8] = if len == 0 {
            &mut []
        } else {
            // SAFETY: upheld by the caller; `len` was bounds-checked above.
            unsafe { std::slice::from_raw_parts_mut(words.cast::<u8>(), len) }
        };
        let flow = cx.integer_pack(Handle::from_bits(value), buffer, numwords, wordsize, nails, flags);
        deliver(cx, flow, 0)
    })
}

/// Always raises `NotImplementedError`.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_integer_unpack(
    _words: *const c_void,
    numwords: usize,
    wordsize: usize,
    nails: usize,
    flags: i32,
) -> u64 {
    with_context("rb_integer_unpack", |cx| {
        let flow = cx.integer_unpack(&[], numwords, wordsize, nails, PackFlags(flags as u32));
        deliver(cx, flow, Handle::NIL).to_bits()
    })
}

/// Bytes needed for `|value|`; the unused high bits of the top byte go to
/// `nlz_bits` when it is not null.
///
/// # Safety
///
/// `nlz_bits` must be null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn cext_absint_size(value: u64, nlz_bits: *mut i32) -> usize {
    with_context("rb_absint_size", |cx| {
        let flow = cx.absint_size(Handle::from_bits(value));
        let (bytes, nlz) = deliver(cx, flow, (0, 0));
        if !nlz_bits.is_null() {
            // SAFETY: upheld by the caller.
            unsafe { nlz_bits.write(nlz as i32) };
        }
        bytes
    })
}

/// # Safety
///
/// `buffer` must point to `num_longs` writable words.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn cext_big_pack(value: u64, buffer: *mut u64, num_longs: isize) {
    with_context("rb_big_pack", |cx| {
        let Ok(len) = usize::try_from(num_longs) else {
            raise_error(cx, BridgeError::Argument(format!("negative word count: {num_longs}")));
            return;
        };
        if len > 0 && buffer.is_null() {
            raise_error(cx, BridgeError::Argument("null word buffer".into()));
            return;
        }
        let words: &mut [u64] = if len == 0 {
            &mut []
        } else {
            // SAFETY: upheld by the caller.
            unsafe { std::slice::from_raw_parts_mut(buffer, len) }
        };
        let flow = cx.big_pack(Handle::from_bits(value), words);
        deliver(cx, flow, 0);
    });
}

fn register_integer_symbols(registry: &SymbolRegistry) {
    registry.register(FfiFunction {
        name: "rb_integer_pack".into(),
        symbol: "cext_integer_pack".into(),
        signature: FfiSignature::new(
            vec![
                FfiType::Handle,
                FfiType::Ptr,
                FfiType::Usize,
                FfiType::Usize,
                FfiType::Usize,
                FfiType::I32,
            ],
            FfiType::I32,
        ),
    });

    registry.register(FfiFunction {
        name: "rb_integer_unpack".into(),
        symbol: "cext_integer_unpack".into(),
        signature: FfiSignature::new(
            vec![
                FfiType::Ptr,
                FfiType::Usize,
                FfiType::Usize,
                FfiType::Usize,
                FfiType::I32,
            ],
            FfiType::Handle,
        ),
    });

    registry.register(FfiFunction {
        name: "rb_absint_size".into(),
        symbol: "cext_absint_size".into(),
        signature: FfiSignature::new(vec![FfiType::Handle, FfiType::Ptr], FfiType::Usize),
    });

    registry.register(FfiFunction {
        name: "rb_big_pack".into(),
        symbol: "cext_big_pack".into(),
        signature: FfiSignature::new(
            vec![FfiType::Handle, FfiType::Ptr, FfiType::I64],
            FfiType::Unit,
        ),
    });
}

inventory::submit! {
    crate::ffi::SymbolProvider {
        register: register_integer_symbols,
    }
}
