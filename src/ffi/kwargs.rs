use cext_symbols::{FfiFunction, FfiSignature, FfiType, SymbolRegistry};

use super::{deliver, raise_error, with_context};
use crate::bridge::{BridgeError, Handle};

/// Extracts keyword arguments from `hash` into `values`.
///
/// Returns the number of keys extracted, or `-1` with an exception pending.
///
/// # Safety
///
/// `table` must point to `required + optional` symbol handles (with
/// `-1 - optional` in place of `optional` when it is negative). `values` must
/// be null or point to as many writable handles.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn cext_get_kwargs(
    hash: u64,
    table: *const u64,
    required: i32,
    optional: i32,
    values: *mut u64,
) -> i32 {
    with_context("rb_get_kwargs", |cx| {
        let Ok(required_count) = usize::try_from(required) else {
            raise_error(cx, BridgeError::Argument(format!("negative required count: {required}")));
            return -1;
        };
        let optional_count = (if optional < 0 { -1 - optional } else { optional }) as usize;
        let expected = required_count + optional_count;
        if expected > 0 && table.is_null() {
            raise_error(cx, BridgeError::Argument("null keyword table".into()));
            return -1;
        }

        let keys: Vec<Handle> = if expected == 0 {
            Vec::new()
        } else {
            // SAFETY: upheld by the caller.
            unsafe { std::slice::from_raw_parts(table, expected) }
                .iter()
                .map(|bits| Handle::from_bits(*bits))
                .collect()
        };

        let mut slots = vec![Handle::UNDEF; expected];
        let target = (!values.is_null()).then_some(slots.as_mut_slice());
        let flow = cx.get_kwargs(Handle::from_bits(hash), &keys, required_count, optional, target);

        if !values.is_null() {
            for (index, slot) in slots.iter().enumerate() {
                // SAFETY: upheld by the caller.
                unsafe { values.add(index).write(slot.to_bits()) };
            }
        }
        deliver(cx, flow.map(|count| count as i32), -1)
    })
}

fn register_kwargs_symbols(registry: &SymbolRegistry) {
    registry.register(FfiFunction {
        name: "rb_get_kwargs".into(),
        symbol: "cext_get_kwargs".into(),
        signature: FfiSignature::new(
            vec![FfiType::Handle, FfiType::Ptr, FfiType::I32, FfiType::I32, FfiType::Ptr],
            FfiType::I32,
        ),
    });
}

inventory::submit! {
    crate::ffi::SymbolProvider {
        register: register_kwargs_symbols,
    }
}
