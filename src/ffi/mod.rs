//! The `extern "C"` surface native extensions link against.
//!
//! Every entry point runs against the installed global bridge and requires
//! the calling thread to hold its execution lock. Native callbacks report a
//! raise by calling `cext_exc_raise` (or a sibling) and returning; the exit is
//! parked with the bridge and picked up when the callback returns, or when
//! the enclosing native frame closes.
//!
//! Entry points and callbacks use the `C-unwind` ABI so that a fatal
//! condition configured to panic can unwind through native frames.

pub mod control;
pub mod handles;
pub mod integer;
pub mod kwargs;
pub mod lock;

use std::any::Any;
use std::cell::Cell;
use std::ffi::{CStr, c_char};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Once;

use cext_symbols::SymbolRegistry;
use tracing::{error, warn};

use crate::bridge::{Bridge, BridgeError, Context, FatalError, Flow, Handle, Unwind};

/// Body, cleanup and catch callbacks.
pub type BodyFn = extern "C-unwind" fn(u64) -> u64;
/// Rescue handlers: `(handler_arg, exception)`.
pub type RescueFn = extern "C-unwind" fn(u64, u64) -> u64;

pub struct SymbolProvider {
    pub register: fn(&SymbolRegistry),
}

inventory::collect!(SymbolProvider);

/// Registers every native entry point in the global symbol registry.
pub fn bootstrap_symbols() -> &'static SymbolRegistry {
    static INIT: Once = Once::new();
    let registry = SymbolRegistry::global();
    INIT.call_once(|| {
        for provider in inventory::iter::<SymbolProvider> {
            (provider.register)(registry);
        }
    });
    registry
}

thread_local! {
    /// Native callbacks currently running on this thread.
    static CALLBACKS: Cell<usize> = const { Cell::new(0) };
    /// Entry points currently running on this thread.
    static BOUNDARIES: Cell<usize> = const { Cell::new(0) };
}

/// Marks a native callback as running. Entering drops any exit parked
/// before the callback, which belongs to no callback.
struct CallbackScope;

impl CallbackScope {
    fn enter(bridge: &Bridge) -> Self {
        if let Some(stale) = bridge.take_parked() {
            warn!(status = stale.status().0, "discarding exit raised outside any callback");
        }
        CALLBACKS.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        CALLBACKS.with(|depth| depth.set(depth.get() - 1));
    }
}

fn in_callback() -> bool {
    CALLBACKS.with(Cell::get) > 0
}

/// Hands an exit raised by an entry point back to native code.
///
/// Fatal exits with no callback to return through end the process at once;
/// everything else is parked for the enclosing callback or frame.
fn park(cx: &Context<'_>, unwind: Unwind) {
    match unwind {
        Unwind::Fatal(err) if !in_callback() => cx.bridge().fatal(err),
        unwind => cx.bridge().park(unwind),
    }
}

fn pending_status() -> i32 {
    Bridge::global().map_or(0, |bridge| bridge.parked_status().0)
}

fn fatal_uninstalled(err: FatalError) -> ! {
    error!(error = %err, "fatal bridge error");
    std::process::abort();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs an entry point body, turning an escaping panic into a fatal error.
/// A panic raised by [`Bridge::fatal`] itself keeps unwinding unchanged.
fn boundary<R>(name: &'static str, f: impl FnOnce() -> R) -> R {
    let depth = BOUNDARIES.with(|depth| depth.replace(depth.get() + 1));
    if depth == 0 {
        Bridge::clear_fatal_unwinding();
    }
    let outcome = catch_unwind(AssertUnwindSafe(f));
    BOUNDARIES.with(|boundaries| boundaries.set(depth));

    match outcome {
        Ok(result) => result,
        Err(payload) if Bridge::fatal_unwinding() => {
            if depth == 0 {
                Bridge::clear_fatal_unwinding();
            }
            resume_unwind(payload)
        }
        Err(payload) => {
            let err = FatalError::NativePanic {
                name,
                message: panic_message(payload.as_ref()),
            };
            match Bridge::global() {
                Some(bridge) => bridge.fatal(err),
                None => fatal_uninstalled(err),
            }
        }
    }
}

/// Runs `f` with the context of the calling thread's innermost frame.
fn with_context<R>(name: &'static str, f: impl FnOnce(&Context<'_>) -> R) -> R {
    boundary(name, || {
        let Some(bridge) = Bridge::global() else {
            fatal_uninstalled(FatalError::NotInstalled(name));
        };
        let Some(cx) = Context::current(bridge) else {
            bridge.fatal(FatalError::LockNotHeld(name));
        };
        f(&cx)
    })
}

/// Calls a native body callback and collects the exit it left parked.
fn call_body(cx: &Context<'_>, func: BodyFn, arg: Handle) -> Flow<Handle> {
    let bits = {
        let _scope = CallbackScope::enter(cx.bridge());
        func(arg.to_bits())
    };
    match cx.bridge().take_parked() {
        Some(unwind) => Err(unwind),
        None => Ok(Handle::from_bits(bits)),
    }
}

fn call_handler(cx: &Context<'_>, func: RescueFn, arg: Handle, exception: Handle) -> Flow<Handle> {
    let bits = {
        let _scope = CallbackScope::enter(cx.bridge());
        func(arg.to_bits(), exception.to_bits())
    };
    match cx.bridge().take_parked() {
        Some(unwind) => Err(unwind),
        None => Ok(Handle::from_bits(bits)),
    }
}

/// Hands a result back to native code: exits are parked for the enclosing
/// callback boundary, fatal ones end the process here.
fn deliver<T>(cx: &Context<'_>, flow: Flow<T>, on_exit: T) -> T {
    match flow {
        Ok(value) => value,
        Err(Unwind::Fatal(err)) => cx.bridge().fatal(err),
        Err(unwind) => {
            cx.bridge().park(unwind);
            on_exit
        }
    }
}

/// Parks `err` as a raised exception.
fn raise_error(cx: &Context<'_>, err: BridgeError) {
    cx.bridge().park(cx.fail(err));
}

/// Borrows a C string argument, raising `ArgumentError` for null or non-UTF-8.
///
/// # Safety
///
/// A non-null `ptr` must point to a NUL-terminated string that outlives the call.
unsafe fn c_str<'a>(cx: &Context<'_>, ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        raise_error(cx, BridgeError::Argument("null string".into()));
        return None;
    }
    // SAFETY: upheld by the caller.
    match unsafe { CStr::from_ptr(ptr) }.to_str() {
        Ok(text) => Some(text),
        Err(_) => {
            raise_error(cx, BridgeError::Argument("string is not valid UTF-8".into()));
            None
        }
    }
}
