//! The managed side of the bridge.
//!
//! [`ManagedRuntime`] is the capability the bridge consumes: symbol
//! interning, exception construction, integer conversion, hash access and
//! root-driven collection. [`ManagedHeap`] is the in-process implementation
//! used by the binary and the tests.

pub mod heap;
pub mod value;

use num_bigint::BigInt;

pub use heap::{HeapObject, ManagedHeap};
pub use value::{FIXNUM_MAX, FIXNUM_MIN, ObjectId, SymbolId, Value};

/// Exception classes every runtime must provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardClass {
    Exception,
    ScriptError,
    StandardError,
    RuntimeError,
    ArgumentError,
    TypeError,
    NotImplementedError,
    NoMemoryError,
    UncaughtThrowError,
}

impl StandardClass {
    pub const ALL: [Self; 9] = [
        Self::Exception,
        Self::ScriptError,
        Self::StandardError,
        Self::RuntimeError,
        Self::ArgumentError,
        Self::TypeError,
        Self::NotImplementedError,
        Self::NoMemoryError,
        Self::UncaughtThrowError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Exception => "Exception",
            Self::ScriptError => "ScriptError",
            Self::StandardError => "StandardError",
            Self::RuntimeError => "RuntimeError",
            Self::ArgumentError => "ArgumentError",
            Self::TypeError => "TypeError",
            Self::NotImplementedError => "NotImplementedError",
            Self::NoMemoryError => "NoMemoryError",
            Self::UncaughtThrowError => "UncaughtThrowError",
        }
    }

    pub fn superclass(self) -> Option<Self> {
        match self {
            Self::Exception => None,
            Self::ScriptError | Self::StandardError | Self::NoMemoryError => Some(Self::Exception),
            Self::RuntimeError | Self::ArgumentError | Self::TypeError => {
                Some(Self::StandardError)
            }
            Self::NotImplementedError => Some(Self::ScriptError),
            Self::UncaughtThrowError => Some(Self::ArgumentError),
        }
    }

    /// Position in [`Self::ALL`], also the native-surface class code.
    pub fn code(self) -> u32 {
        Self::ALL.iter().position(|class| *class == self).unwrap_or(0) as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }
}

/// Outcome of one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectStats {
    pub roots: usize,
    pub survivors: usize,
    pub freed: usize,
}

/// Operations the bridge invokes on the managed runtime.
///
/// Implementations synchronise internally; the bridge only calls them while
/// holding its execution lock, but never holds a runtime borrow across calls.
pub trait ManagedRuntime: Send + Sync {
    fn intern(&self, name: &str) -> SymbolId;

    fn symbol_name(&self, id: SymbolId) -> Option<String>;

    /// Whether `object` is still allocated.
    fn is_live(&self, object: ObjectId) -> bool;

    /// Short human-readable rendering, used in diagnostics.
    fn describe(&self, value: Value) -> String;

    fn standard_class(&self, class: StandardClass) -> Value;

    fn is_class(&self, value: Value) -> bool;

    fn class_name(&self, class: Value) -> Option<String>;

    /// `value.kind_of?(class)`. `class` must be a class.
    fn kind_of(&self, value: Value, class: Value) -> bool;

    fn new_exception(&self, class: Value, message: &str) -> Value;

    fn exception_message(&self, exception: Value) -> Option<String>;

    fn new_string(&self, text: &str) -> Value;

    /// The integer denoted by `value`, or `None` for non-integers.
    fn to_integer(&self, value: Value) -> Option<BigInt>;

    /// A small integer when it fits, a heap integer otherwise.
    fn new_integer(&self, value: &BigInt) -> Value;

    fn is_hash(&self, value: Value) -> bool;

    fn hash_lookup(&self, hash: Value, key: Value) -> Option<Value>;

    fn hash_delete(&self, hash: Value, key: Value) -> Option<Value>;

    /// Keys in insertion order.
    fn hash_keys(&self, hash: Value) -> Vec<Value>;

    fn hash_len(&self, hash: Value) -> usize;

    /// Collects everything unreachable from `roots` and the runtime's own roots.
    fn collect(&self, roots: &[ObjectId]) -> CollectStats;
}
