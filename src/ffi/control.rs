use std::ffi::c_char;

use cext_symbols::{FfiFunction, FfiSignature, FfiType, SymbolRegistry};

use super::{
    BodyFn, RescueFn, c_str, call_body, call_handler, deliver, park, pending_status, with_context,
};
use crate::bridge::{Handle, Status};
use crate::runtime::StandardClass;

/// Starts propagating `exception`. The caller must return to the bridge
/// without touching further managed state.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_exc_raise(exception: u64) {
    with_context("rb_exc_raise", |cx| {
        if let Err(unwind) = cx.raise::<()>(Handle::from_bits(exception)) {
            park(cx, unwind);
        }
    });
}

/// Raises a new `class` exception with `message`.
///
/// # Safety
///
/// `message` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn cext_raise_new(class: u64, message: *const c_char) {
    with_context("rb_raise", |cx| {
        // SAFETY: forwarded from the caller.
        let Some(message) = (unsafe { c_str(cx, message) }) else {
            return;
        };
        if let Err(unwind) = cx.raise_new::<()>(Handle::from_bits(class), message) {
            park(cx, unwind);
        }
    });
}

/// The handle of a standard class by its code, or nil for unknown codes.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_standard_class(code: u32) -> u64 {
    with_context("rb_tr_standard_class", |cx| {
        StandardClass::from_code(code)
            .map_or(Handle::NIL, |class| cx.standard_class(class))
            .to_bits()
    })
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_errinfo() -> u64 {
    with_context("rb_errinfo", |cx| cx.errinfo().to_bits())
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_set_errinfo(exception: u64) {
    with_context("rb_set_errinfo", |cx| {
        let flow = cx.set_errinfo(Handle::from_bits(exception));
        deliver(cx, flow, ());
    });
}

/// Status of the exit parked on this thread, zero when none.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_pending() -> i32 {
    pending_status()
}

/// Runs `func(arg)` and captures any exit, writing its status to `state`.
///
/// # Safety
///
/// `state` must be null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn cext_protect(func: BodyFn, arg: u64, state: *mut i32) -> u64 {
    with_context("rb_protect", |cx| {
        let (result, status) = cx.protect(|cx, arg| call_body(cx, func, arg), Handle::from_bits(arg));
        if !state.is_null() {
            // SAFETY: upheld by the caller.
            unsafe { state.write(status.0) };
        }
        result.to_bits()
    })
}

/// Resumes the exit captured by `cext_protect` with `status`.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_jump_tag(status: i32) {
    with_context("rb_jump_tag", |cx| {
        let flow = cx.jump_tag::<()>(Status(status));
        deliver(cx, flow, ());
    });
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_ensure(body: BodyFn, body_arg: u64, cleanup: BodyFn, cleanup_arg: u64) -> u64 {
    with_context("rb_ensure", |cx| {
        let flow = cx.ensure(
            |cx, arg| call_body(cx, body, arg),
            Handle::from_bits(body_arg),
            |cx, arg| call_body(cx, cleanup, arg),
            Handle::from_bits(cleanup_arg),
        );
        deliver(cx, flow, Handle::NIL).to_bits()
    })
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_rescue(body: BodyFn, body_arg: u64, handler: RescueFn, handler_arg: u64) -> u64 {
    with_context("rb_rescue", |cx| {
        let flow = cx.rescue(
            |cx, arg| call_body(cx, body, arg),
            Handle::from_bits(body_arg),
            |cx, arg, exception| call_handler(cx, handler, arg, exception),
            Handle::from_bits(handler_arg),
        );
        deliver(cx, flow, Handle::NIL).to_bits()
    })
}

/// `cext_rescue` restricted to `count` classes read from `classes`.
///
/// # Safety
///
/// `classes` must point to `count` readable handles, or `count` must be zero.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn cext_rescue2(
    body: BodyFn,
    body_arg: u64,
    handler: RescueFn,
    handler_arg: u64,
    classes: *const u64,
    count: usize,
) -> u64 {
    with_context("rb_rescue2", |cx| {
        let classes: Vec<Handle> = if count == 0 || classes.is_null() {
            Vec::new()
        } else {
            // SAFETY: upheld by the caller.
            unsafe { std::slice::from_raw_parts(classes, count) }
                .iter()
                .map(|bits| Handle::from_bits(*bits))
                .collect()
        };
        let flow = cx.rescue2(
            |cx, arg| call_body(cx, body, arg),
            Handle::from_bits(body_arg),
            |cx, arg, exception| call_handler(cx, handler, arg, exception),
            Handle::from_bits(handler_arg),
            &classes,
        );
        deliver(cx, flow, Handle::NIL).to_bits()
    })
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_catch_obj(tag: u64, body: BodyFn, data: u64) -> u64 {
    with_context("rb_catch_obj", |cx| {
        let flow = cx.catch(
            Handle::from_bits(tag),
            |cx, arg| call_body(cx, body, arg),
            Handle::from_bits(data),
        );
        deliver(cx, flow, Handle::NIL).to_bits()
    })
}

/// `cext_catch_obj` with the tag interned from `tag`.
///
/// # Safety
///
/// `tag` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn cext_catch(tag: *const c_char, body: BodyFn, data: u64) -> u64 {
    with_context("rb_catch", |cx| {
        // SAFETY: forwarded from the caller.
        let Some(tag) = (unsafe { c_str(cx, tag) }) else {
            return Handle::NIL.to_bits();
        };
        let flow = cx.catch_str(tag, |cx, arg| call_body(cx, body, arg), Handle::from_bits(data));
        deliver(cx, flow, Handle::NIL).to_bits()
    })
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_throw_obj(tag: u64, value: u64) {
    with_context("rb_throw_obj", |cx| {
        if let Err(unwind) = cx.throw::<()>(Handle::from_bits(tag), Handle::from_bits(value)) {
            park(cx, unwind);
        }
    });
}

/// `cext_throw_obj` with the tag interned from `tag`.
///
/// # Safety
///
/// `tag` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn cext_throw(tag: *const c_char, value: u64) {
    with_context("rb_throw", |cx| {
        // SAFETY: forwarded from the caller.
        let Some(tag) = (unsafe { c_str(cx, tag) }) else {
            return;
        };
        if let Err(unwind) = cx.throw_str::<()>(tag, Handle::from_bits(value)) {
            park(cx, unwind);
        }
    });
}

fn register_control_symbols(registry: &SymbolRegistry) {
    let entries = [
        ("rb_exc_raise", "cext_exc_raise", vec![FfiType::Handle], FfiType::Unit),
        ("rb_raise", "cext_raise_new", vec![FfiType::Handle, FfiType::Str], FfiType::Unit),
        ("rb_tr_standard_class", "cext_standard_class", vec![FfiType::I32], FfiType::Handle),
        ("rb_errinfo", "cext_errinfo", vec![], FfiType::Handle),
        ("rb_set_errinfo", "cext_set_errinfo", vec![FfiType::Handle], FfiType::Unit),
        ("rb_tr_pending", "cext_pending", vec![], FfiType::I32),
        (
            "rb_protect",
            "cext_protect",
            vec![FfiType::Callback, FfiType::Handle, FfiType::Ptr],
            FfiType::Handle,
        ),
        ("rb_jump_tag", "cext_jump_tag", vec![FfiType::I32], FfiType::Unit),
        (
            "rb_ensure",
            "cext_ensure",
            vec![FfiType::Callback, FfiType::Handle, FfiType::Callback, FfiType::Handle],
            FfiType::Handle,
        ),
        (
            "rb_rescue",
            "cext_rescue",
            vec![FfiType::Callback, FfiType::Handle, FfiType::Callback, FfiType::Handle],
            FfiType::Handle,
        ),
        (
            "rb_rescue2",
            "cext_rescue2",
            vec![
                FfiType::Callback,
                FfiType::Handle,
                FfiType::Callback,
                FfiType::Handle,
                FfiType::Ptr,
                FfiType::Usize,
            ],
            FfiType::Handle,
        ),
        (
            "rb_catch_obj",
            "cext_catch_obj",
            vec![FfiType::Handle, FfiType::Callback, FfiType::Handle],
            FfiType::Handle,
        ),
        (
            "rb_catch",
            "cext_catch",
            vec![FfiType::Str, FfiType::Callback, FfiType::Handle],
            FfiType::Handle,
        ),
        ("rb_throw_obj", "cext_throw_obj", vec![FfiType::Handle, FfiType::Handle], FfiType::Unit),
        ("rb_throw", "cext_throw", vec![FfiType::Str, FfiType::Handle], FfiType::Unit),
    ];

    for (name, symbol, params, result) in entries {
        registry.register(FfiFunction {
            name: name.into(),
            symbol: symbol.into(),
            signature: FfiSignature::new(params, result),
        });
    }
}

inventory::submit! {
    crate::ffi::SymbolProvider {
        register: register_control_symbols,
    }
}
