use std::sync::Arc;

use cextbridge::{
    Bridge, BridgeConfig, Context, Flow, Handle, ManagedHeap, ManagedRuntime, StandardClass,
    Unwind, Value,
};

fn setup() -> (Arc<ManagedHeap>, Bridge) {
    let heap = Arc::new(ManagedHeap::new());
    let bridge = Bridge::new(heap.clone(), BridgeConfig::default());
    (heap, bridge)
}

fn run<T>(bridge: &Bridge, f: impl FnOnce(&Context<'_>) -> Flow<T>) -> T {
    bridge.with_lock(f).expect("no non-local exit")
}

fn fixnum(n: i64) -> Value {
    Value::Fixnum(n)
}

/// `{a: 1, b: 2, ...extra}` built from symbol names.
fn keyword_hash(heap: &ManagedHeap, pairs: &[(&str, i64)]) -> Value {
    heap.new_hash(
        pairs
            .iter()
            .map(|(name, n)| (Value::Symbol(heap.intern(name)), fixnum(*n))),
    )
}

fn expect_argument_error(heap: &ManagedHeap, outcome: Flow<usize>, message: &str) {
    let Err(Unwind::Raise(exception)) = outcome else {
        panic!("expected an ArgumentError");
    };
    let argument_error = heap.standard_class(StandardClass::ArgumentError);
    assert!(heap.kind_of(exception, argument_error));
    assert_eq!(heap.exception_message(exception).as_deref(), Some(message));
}

#[test]
fn extracts_required_and_optional_keys() {
    let (heap, bridge) = setup();
    let hash = keyword_hash(&heap, &[("a", 1), ("b", 2)]);
    run(&bridge, |cx| {
        let table = [cx.intern("a"), cx.intern("b"), cx.intern("c")];
        let hash = cx.wrap(hash);
        let mut slots = [Handle::NIL; 3];
        let count = cx.get_kwargs(hash, &table, 2, 1, Some(&mut slots))?;

        assert_eq!(count, 2);
        assert_eq!(cx.unwrap(slots[0]).unwrap(), fixnum(1));
        assert_eq!(cx.unwrap(slots[1]).unwrap(), fixnum(2));
        assert_eq!(slots[2], Handle::UNDEF);
        Ok(())
    });
    assert_eq!(heap.hash_len(hash), 0);
}

#[test]
fn missing_required_key_is_named() {
    let (heap, bridge) = setup();
    let hash = keyword_hash(&heap, &[("a", 1), ("c", 3)]);
    run(&bridge, |cx| {
        let table = [cx.intern("a"), cx.intern("b"), cx.intern("c")];
        let hash = cx.wrap(hash);
        let mut slots = [Handle::NIL; 3];
        let outcome = cx.get_kwargs(hash, &table, 2, 1, Some(&mut slots));
        expect_argument_error(&heap, outcome, "missing keyword: b");
        Ok(())
    });
}

#[test]
fn unknown_keys_are_rejected_without_rest() {
    let (heap, bridge) = setup();
    let hash = keyword_hash(&heap, &[("a", 1), ("b", 2), ("c", 3), ("d", 4)]);
    run(&bridge, |cx| {
        let table = [cx.intern("a"), cx.intern("b"), cx.intern("c")];
        let hash = cx.wrap(hash);
        let mut slots = [Handle::NIL; 3];
        let outcome = cx.get_kwargs(hash, &table, 2, 1, Some(&mut slots));
        expect_argument_error(&heap, outcome, "unknown keyword: d");
        Ok(())
    });
}

#[test]
fn several_unknown_keys_are_listed_together() {
    let (heap, bridge) = setup();
    let hash = keyword_hash(&heap, &[("a", 1), ("d", 4), ("e", 5)]);
    run(&bridge, |cx| {
        let table = [cx.intern("a")];
        let hash = cx.wrap(hash);
        let outcome = cx.get_kwargs(hash, &table, 1, 0, None);
        expect_argument_error(&heap, outcome, "unknown keywords: d, e");
        Ok(())
    });
}

#[test]
fn rest_accepts_extra_keys() {
    let (heap, bridge) = setup();
    let hash = keyword_hash(&heap, &[("a", 1), ("d", 4)]);
    run(&bridge, |cx| {
        let table = [cx.intern("a"), cx.intern("b")];
        let hash = cx.wrap(hash);
        let mut slots = [Handle::NIL; 2];
        // -2 means one optional key plus rest.
        let count = cx.get_kwargs(hash, &table, 1, -2, Some(&mut slots))?;
        assert_eq!(count, 1);
        assert_eq!(slots[1], Handle::UNDEF);
        Ok(())
    });
    assert_eq!(heap.hash_len(hash), 1);
}

#[test]
fn inspection_leaves_the_hash_untouched() {
    let (heap, bridge) = setup();
    let hash = keyword_hash(&heap, &[("a", 1), ("b", 2)]);
    run(&bridge, |cx| {
        let table = [cx.intern("a"), cx.intern("b")];
        let hash = cx.wrap(hash);
        assert_eq!(cx.get_kwargs(hash, &table, 1, 1, None)?, 2);
        Ok(())
    });
    assert_eq!(heap.hash_len(hash), 2);
}

#[test]
fn nil_hash_means_no_keywords() {
    let (_heap, bridge) = setup();
    run(&bridge, |cx| {
        let table = [cx.intern("a")];
        let mut slots = [Handle::NIL; 1];
        assert_eq!(cx.get_kwargs(Handle::NIL, &table, 0, 1, Some(&mut slots))?, 0);
        assert_eq!(slots[0], Handle::UNDEF);
        Ok(())
    });
}

#[test]
fn non_hash_argument_is_a_type_error() {
    let (heap, bridge) = setup();
    run(&bridge, |cx| {
        let table = [cx.intern("a")];
        let text = cx.new_string("nope");
        let Err(Unwind::Raise(exception)) = cx.get_kwargs(text, &table, 0, 1, None) else {
            panic!("expected a TypeError");
        };
        assert!(heap.kind_of(exception, heap.standard_class(StandardClass::TypeError)));
        Ok(())
    });
}
