use std::ffi::c_void;
use std::sync::Arc;

use cext_symbols::{FfiFunction, FfiSignature, FfiType, SymbolRegistry};

use super::{CallbackScope, boundary, fatal_uninstalled, with_context};
use crate::bridge::{Bridge, FatalError, Unwind, UnblockFn};

/// Callbacks run with or without the execution lock.
pub type LockedFn = extern "C-unwind" fn(*mut c_void) -> *mut c_void;
/// Interrupts a blocking region.
pub type UnblockCallback = extern "C-unwind" fn(*mut c_void);

/// Raw native data carried across the lock release.
#[derive(Clone, Copy)]
struct NativeData(*mut c_void);

// The bridge never dereferences the pointer; native code owns its thread
// safety, as with the blocking call itself.
unsafe impl Send for NativeData {}
unsafe impl Sync for NativeData {}

impl NativeData {
    fn get(self) -> *mut c_void {
        self.0
    }
}

/// Runs `func(data)` holding the execution lock, taking it if this thread
/// does not already hold it. An exit `func` leaves parked propagates to the
/// caller's callback boundary.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_thread_call_with_gvl(func: LockedFn, data: *mut c_void) -> *mut c_void {
    boundary("rb_thread_call_with_gvl", || {
        let Some(bridge) = Bridge::global() else {
            fatal_uninstalled(FatalError::NotInstalled("rb_thread_call_with_gvl"));
        };
        let flow = bridge.with_lock(|_| {
            let _scope = CallbackScope::enter(bridge);
            Ok(func(data))
        });
        match flow {
            Ok(result) => result,
            Err(Unwind::Fatal(err)) => bridge.fatal(err),
            Err(unwind) => {
                bridge.park(unwind);
                std::ptr::null_mut()
            }
        }
    })
}

/// Runs `func(data)` with the execution lock released. `ubf(ubf_data)`, when
/// given, is what an interrupt of this thread calls.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn cext_thread_call_without_gvl(
    func: LockedFn,
    data: *mut c_void,
    ubf: Option<UnblockCallback>,
    ubf_data: *mut c_void,
) -> *mut c_void {
    with_context("rb_thread_call_without_gvl", |cx| {
        let data = NativeData(data);
        let ubf_data = NativeData(ubf_data);
        let unblock = ubf.map(|ubf| -> UnblockFn { Arc::new(move || ubf(ubf_data.get())) });
        let result = cx.without_lock(move || NativeData(func(data.get())), unblock);
        result.get()
    })
}

fn register_lock_symbols(registry: &SymbolRegistry) {
    registry.register(FfiFunction {
        name: "rb_thread_call_with_gvl".into(),
        symbol: "cext_thread_call_with_gvl".into(),
        signature: FfiSignature::new(vec![FfiType::Callback, FfiType::Ptr], FfiType::Ptr),
    });

    registry.register(FfiFunction {
        name: "rb_thread_call_without_gvl".into(),
        symbol: "cext_thread_call_without_gvl".into(),
        signature: FfiSignature::new(
            vec![FfiType::Callback, FfiType::Ptr, FfiType::Callback, FfiType::Ptr],
            FfiType::Ptr,
        ),
    });
}

inventory::submit! {
    crate::ffi::SymbolProvider {
        register: register_lock_symbols,
    }
}
