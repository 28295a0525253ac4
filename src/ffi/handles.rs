use std::ffi::c_char;

use cext_symbols::{FfiFunction, FfiSignature, FfiType, SymbolRegistry};
use num_bigint::BigInt;

use super::{c_str, deliver, with_context};
use crate::bridge::Handle;

#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_test(handle: u64) -> bool {
    Handle::from_bits(handle).test()
}

/// Interns `name`, returning its symbol handle.
///
/// # Safety
///
/// `name` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn cext_intern(name: *const c_char) -> u64 {
    with_context("rb_intern", |cx| {
        // SAFETY: forwarded from the caller.
        match unsafe { c_str(cx, name) } {
            Some(name) => cx.intern(name).to_bits(),
            None => Handle::NIL.to_bits(),
        }
    })
}

/// Whether `handle` currently denotes a live value.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_handle_valid(handle: u64) -> bool {
    with_context("rb_tr_valid_handle", |cx| {
        cx.unwrap(Handle::from_bits(handle)).is_ok()
    })
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_int2inum(value: i64) -> u64 {
    with_context("rb_int2inum", |cx| cx.integer(&BigInt::from(value)).to_bits())
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_gc() {
    with_context("rb_gc", |cx| {
        cx.gc();
    });
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_gc_mark(handle: u64) {
    with_context("rb_gc_mark", |cx| {
        let flow = cx.gc_mark(Handle::from_bits(handle));
        deliver(cx, flow, ());
    });
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_gc_register_mark_object(handle: u64) {
    with_context("rb_gc_register_mark_object", |cx| {
        let flow = cx.register_mark_object(Handle::from_bits(handle));
        deliver(cx, flow, ());
    });
}

/// Roots the handle stored at `address` until it is unregistered.
///
/// # Safety
///
/// `address` must stay valid for reads until passed to
/// `cext_gc_unregister_address`.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn cext_gc_register_address(address: *const u64) {
    with_context("rb_gc_register_address", |cx| {
        // SAFETY: forwarded from the caller.
        unsafe { cx.register_address(address) };
    });
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_gc_unregister_address(address: *const u64) {
    with_context("rb_gc_unregister_address", |cx| {
        cx.unregister_address(address);
    });
}

fn register_handle_symbols(registry: &SymbolRegistry) {
    registry.register(FfiFunction {
        name: "RTEST".into(),
        symbol: "cext_test".into(),
        signature: FfiSignature::new(vec![FfiType::Handle], FfiType::Bool),
    });

    registry.register(FfiFunction {
        name: "rb_intern".into(),
        symbol: "cext_intern".into(),
        signature: FfiSignature::new(vec![FfiType::Str], FfiType::Handle),
    });

    registry.register(FfiFunction {
        name: "rb_tr_valid_handle".into(),
        symbol: "cext_handle_valid".into(),
        signature: FfiSignature::new(vec![FfiType::Handle], FfiType::Bool),
    });

    registry.register(FfiFunction {
        name: "rb_int2inum".into(),
        symbol: "cext_int2inum".into(),
        signature: FfiSignature::new(vec![FfiType::I64], FfiType::Handle),
    });

    registry.register(FfiFunction {
        name: "rb_gc".into(),
        symbol: "cext_gc".into(),
        signature: FfiSignature::new(vec![], FfiType::Unit),
    });

    registry.register(FfiFunction {
        name: "rb_gc_mark".into(),
        symbol: "cext_gc_mark".into(),
        signature: FfiSignature::new(vec![FfiType::Handle], FfiType::Unit),
    });

    registry.register(FfiFunction {
        name: "rb_gc_register_mark_object".into(),
        symbol: "cext_gc_register_mark_object".into(),
        signature: FfiSignature::new(vec![FfiType::Handle], FfiType::Unit),
    });

    registry.register(FfiFunction {
        name: "rb_gc_register_address".into(),
        symbol: "cext_gc_register_address".into(),
        signature: FfiSignature::new(vec![FfiType::Ptr], FfiType::Unit),
    });

    registry.register(FfiFunction {
        name: "rb_gc_unregister_address".into(),
        symbol: "cext_gc_unregister_address".into(),
        signature: FfiSignature::new(vec![FfiType::Ptr], FfiType::Unit),
    });
}

inventory::submit! {
    crate::ffi::SymbolProvider {
        register: register_handle_symbols,
    }
}
