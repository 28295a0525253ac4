use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use cextbridge::bridge::integer::PackFlags;
use cextbridge::ffi::control::{
    cext_catch, cext_ensure, cext_errinfo, cext_pending, cext_protect, cext_raise_new,
    cext_rescue2, cext_standard_class, cext_throw,
};
use cextbridge::ffi::handles::{
    cext_gc, cext_gc_register_address, cext_gc_unregister_address, cext_handle_valid,
    cext_int2inum, cext_intern, cext_test,
};
use cextbridge::ffi::integer::{cext_absint_size, cext_big_pack, cext_integer_pack};
use cextbridge::ffi::kwargs::cext_get_kwargs;
use cextbridge::ffi::lock::{cext_thread_call_with_gvl, cext_thread_call_without_gvl};
use cextbridge::{
    Bridge, BridgeConfig, BridgeError, Handle, ManagedHeap, ManagedRuntime, StandardClass, Status,
    Unwind, Value,
};
use once_cell::sync::Lazy;

static HEAP: Lazy<Arc<ManagedHeap>> = Lazy::new(|| Arc::new(ManagedHeap::new()));

static BRIDGE: Lazy<&'static Bridge> = Lazy::new(|| {
    let config = BridgeConfig {
        abort_on_fatal: false,
        ..BridgeConfig::default()
    };
    Bridge::install(HEAP.clone(), config).expect("first install")
});

fn bridge() -> &'static Bridge {
    *BRIDGE
}

fn fixnum(n: i64) -> u64 {
    ((n as u64) << 1) | 1
}

extern "C-unwind" fn raise_runtime_error(_: u64) -> u64 {
    let class = cext_standard_class(StandardClass::RuntimeError.code());
    unsafe { cext_raise_new(class, c"boom".as_ptr()) };
    Handle::NIL.to_bits()
}

extern "C-unwind" fn identity(arg: u64) -> u64 {
    arg
}

extern "C-unwind" fn return_handler_arg(arg: u64, _exception: u64) -> u64 {
    arg
}

#[test]
fn second_install_is_rejected() {
    let installed = bridge();
    let again = Bridge::install(HEAP.clone(), BridgeConfig::default());
    assert!(matches!(again, Err(BridgeError::AlreadyInstalled)));
    assert!(std::ptr::eq(Bridge::global().unwrap(), installed));
}

#[test]
fn truthiness_needs_no_lock() {
    assert!(!cext_test(Handle::NIL.to_bits()));
    assert!(!cext_test(Handle::FALSE.to_bits()));
    assert!(cext_test(Handle::TRUE.to_bits()));
    assert!(cext_test(fixnum(0)));
}

#[test]
fn protect_reports_status_and_errinfo() {
    bridge()
        .with_lock(|cx| {
            let mut state = -1;
            let result = unsafe { cext_protect(identity, fixnum(3), &mut state) };
            assert_eq!((result, state), (fixnum(3), Status::NONE.0));

            let result = unsafe { cext_protect(raise_runtime_error, 0, &mut state) };
            assert_eq!(result, Handle::NIL.to_bits());
            assert_eq!(state, Status::RAISE.0);
            assert_eq!(cext_pending(), 0);

            let errinfo = Handle::from_bits(cext_errinfo());
            assert_eq!(cx.exception_message(errinfo).as_deref(), Some("boom"));
            Ok(())
        })
        .unwrap();
}

static CLEANUPS: AtomicUsize = AtomicUsize::new(0);

extern "C-unwind" fn count_cleanup(_: u64) -> u64 {
    CLEANUPS.fetch_add(1, Ordering::SeqCst);
    Handle::NIL.to_bits()
}

extern "C-unwind" fn ensure_around_raise(_: u64) -> u64 {
    cext_ensure(raise_runtime_error, 0, count_cleanup, 0)
}

#[test]
fn ensure_cleans_up_before_the_raise_leaves() {
    bridge()
        .with_lock(|_| {
            let before = CLEANUPS.load(Ordering::SeqCst);
            let mut state = 0;
            unsafe { cext_protect(ensure_around_raise, 0, &mut state) };
            assert_eq!(state, Status::RAISE.0);
            assert_eq!(CLEANUPS.load(Ordering::SeqCst), before + 1);

            assert_eq!(cext_ensure(identity, fixnum(8), count_cleanup, 0), fixnum(8));
            assert_eq!(CLEANUPS.load(Ordering::SeqCst), before + 2);
            Ok(())
        })
        .unwrap();
}

#[test]
fn rescue2_hands_matching_exceptions_to_the_handler() {
    bridge()
        .with_lock(|_| {
            let classes = [cext_standard_class(StandardClass::StandardError.code())];
            let result = unsafe {
                cext_rescue2(
                    raise_runtime_error,
                    0,
                    return_handler_arg,
                    fixnum(7),
                    classes.as_ptr(),
                    classes.len(),
                )
            };
            assert_eq!(result, fixnum(7));
            assert_eq!(cext_pending(), 0);
            Ok(())
        })
        .unwrap();
}

extern "C-unwind" fn throw_done(value: u64) -> u64 {
    unsafe { cext_throw(c"done".as_ptr(), value) };
    Handle::NIL.to_bits()
}

#[test]
fn catch_receives_the_thrown_value() {
    bridge()
        .with_lock(|_| {
            let result = unsafe { cext_catch(c"done".as_ptr(), throw_done, fixnum(15)) };
            assert_eq!(result, fixnum(15));
            assert_eq!(cext_pending(), 0);
            Ok(())
        })
        .unwrap();
}

extern "C-unwind" fn throw_nowhere(value: u64) -> u64 {
    unsafe { cext_throw(c"nowhere".as_ptr(), value) };
    Handle::NIL.to_bits()
}

#[test]
#[should_panic(expected = "uncaught throw")]
fn unmatched_throw_outside_callbacks_is_fatal() {
    let _ = bridge().with_lock(|_| {
        unsafe { cext_throw(c"nobody".as_ptr(), Handle::NIL.to_bits()) };
        Ok(())
    });
}

#[test]
#[should_panic(expected = "uncaught throw")]
fn fatal_exits_unwind_through_entry_points() {
    let _ = bridge().with_lock(|_| {
        let mut state = 0;
        unsafe { cext_protect(throw_nowhere, Handle::NIL.to_bits(), &mut state) };
        Ok(())
    });
}

fn raise_stray() {
    let class = cext_standard_class(StandardClass::RuntimeError.code());
    unsafe { cext_raise_new(class, c"stray".as_ptr()) };
}

#[test]
fn uncollected_raise_becomes_the_frame_result() {
    let bridge = bridge();
    bridge
        .with_lock(|cx| {
            let result = bridge.with_lock(|_| {
                raise_stray();
                Ok(())
            });
            match result {
                Err(Unwind::Raise(exception)) => {
                    let exception = cx.wrap(exception);
                    assert_eq!(cx.exception_message(exception).as_deref(), Some("stray"));
                }
                other => panic!("expected the stray raise, got {other:?}"),
            }
            assert_eq!(cext_pending(), 0);
            Ok(())
        })
        .unwrap();
}

#[test]
fn stale_raise_does_not_leak_into_the_next_callback() {
    bridge()
        .with_lock(|_| {
            raise_stray();
            let mut state = -1;
            let result = unsafe { cext_protect(identity, fixnum(7), &mut state) };
            assert_eq!((result, state), (fixnum(7), Status::NONE.0));
            assert_eq!(cext_pending(), 0);
            Ok(())
        })
        .unwrap();
}

extern "C-unwind" fn require_missing_keyword(_: u64) -> u64 {
    let key = unsafe { cext_intern(c"needed".as_ptr()) };
    unsafe { cext_get_kwargs(Handle::NIL.to_bits(), &key, 1, 0, ptr::null_mut()) };
    Handle::NIL.to_bits()
}

#[test]
fn get_kwargs_fills_native_slots() {
    bridge()
        .with_lock(|cx| {
            let a = HEAP.intern("a");
            let hash = HEAP.new_hash([(Value::Symbol(a), Value::Fixnum(1))]);
            let hash = cx.wrap(hash).to_bits();
            let table = unsafe { [cext_intern(c"a".as_ptr()), cext_intern(c"b".as_ptr())] };
            let mut values = [0u64; 2];
            let count = unsafe { cext_get_kwargs(hash, table.as_ptr(), 1, 1, values.as_mut_ptr()) };
            assert_eq!(count, 1);
            assert_eq!(values, [fixnum(1), Handle::UNDEF.to_bits()]);

            let mut state = 0;
            unsafe { cext_protect(require_missing_keyword, 0, &mut state) };
            assert_eq!(state, Status::RAISE.0);
            let errinfo = Handle::from_bits(cext_errinfo());
            assert_eq!(
                cx.exception_message(errinfo).as_deref(),
                Some("missing keyword: needed")
            );
            Ok(())
        })
        .unwrap();
}

#[test]
fn integers_pack_into_native_buffers() {
    bridge()
        .with_lock(|_| {
            let flags = (PackFlags::LSWORD_FIRST | PackFlags::LSBYTE_FIRST).0 as i32;
            let mut buffer = [0u8; 2];
            let value = cext_int2inum(0x0102);
            let sign = unsafe {
                cext_integer_pack(value, buffer.as_mut_ptr().cast::<c_void>(), 1, 2, 0, flags)
            };
            assert_eq!(sign, 1);
            assert_eq!(buffer, [0x02, 0x01]);

            let mut nlz = -1;
            assert_eq!(unsafe { cext_absint_size(cext_int2inum(256), &mut nlz) }, 2);
            assert_eq!(nlz, 7);

            let mut words = [0u64; 1];
            unsafe { cext_big_pack(cext_int2inum(-1), words.as_mut_ptr(), 1) };
            assert_eq!(words, [u64::MAX]);
            Ok(())
        })
        .unwrap();
}

extern "C-unwind" fn record_unlocked(data: *mut c_void) -> *mut c_void {
    let unlocked = unsafe { &*data.cast::<AtomicBool>() };
    unlocked.store(!bridge().lock_held(), Ordering::SeqCst);
    data
}

extern "C-unwind" fn record_locked(data: *mut c_void) -> *mut c_void {
    let flags = unsafe { &*data.cast::<[AtomicBool; 2]>() };
    flags[0].store(bridge().lock_held(), Ordering::SeqCst);
    let unlocked = ptr::from_ref(&flags[1]).cast_mut().cast::<c_void>();
    cext_thread_call_without_gvl(record_unlocked, unlocked, None, ptr::null_mut());
    data
}

#[test]
fn lock_can_be_taken_and_released_from_native_code() {
    let bridge = bridge();
    assert!(!bridge.lock_held());
    let flags = [AtomicBool::new(false), AtomicBool::new(false)];
    let data = ptr::from_ref(&flags).cast_mut().cast::<c_void>();
    let returned = cext_thread_call_with_gvl(record_locked, data);
    assert_eq!(returned, data);
    assert!(flags[0].load(Ordering::SeqCst));
    assert!(flags[1].load(Ordering::SeqCst));
    assert!(!bridge.lock_held());
}

#[test]
fn registered_addresses_keep_objects_alive() {
    let bridge = bridge();
    let mut cell = Box::new(0u64);
    let address = ptr::from_ref(&*cell);
    bridge
        .with_lock(|cx| {
            *cell = cx.new_string("kept").to_bits();
            unsafe { cext_gc_register_address(address) };
            Ok(())
        })
        .unwrap();

    bridge
        .with_lock(|_| {
            cext_gc();
            assert!(cext_handle_valid(*cell));
            cext_gc_unregister_address(address);
            cext_gc();
            assert!(!cext_handle_valid(*cell));
            Ok(())
        })
        .unwrap();
}
