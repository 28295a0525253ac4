//! Registry of the native entry points exported by the bridge.
//!
//! Every `extern "C"` function of the native surface is recorded here with
//! its signature, so tooling can enumerate what an extension may link
//! against without parsing headers.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Serialize;

/// Native-level parameter and return types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FfiType {
    Unit,
    Bool,
    I32,
    I64,
    Usize,
    /// An opaque 64-bit object handle.
    Handle,
    /// Raw pointer to native-owned memory.
    Ptr,
    /// NUL-terminated C string.
    Str,
    /// Native callback function pointer.
    Callback,
}

impl fmt::Display for FfiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unit => "void",
            Self::Bool => "bool",
            Self::I32 => "int",
            Self::I64 => "long",
            Self::Usize => "size_t",
            Self::Handle => "VALUE",
            Self::Ptr => "void*",
            Self::Str => "const char*",
            Self::Callback => "fn*",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FfiSignature {
    pub params: Vec<FfiType>,
    pub result: FfiType,
}

impl FfiSignature {
    pub fn new(params: Vec<FfiType>, result: FfiType) -> Self {
        Self { params, result }
    }
}

impl fmt::Display for FfiSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (index, param) in self.params.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ") -> {}", self.result)
    }
}

/// One exported native function: the API name native code knows it by and
/// the linker symbol that implements it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FfiFunction {
    pub name: String,
    pub symbol: String,
    pub signature: FfiSignature,
}

#[derive(Clone, Default)]
pub struct SymbolRegistry {
    inner: Arc<RwLock<AHashMap<String, FfiFunction>>>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static Self {
        &GLOBAL_SYMBOL_REGISTRY
    }

    /// Records `function`, replacing any earlier entry with the same name.
    pub fn register(&self, function: FfiFunction) {
        self.inner.write().insert(function.name.clone(), function);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    pub fn resolve(&self, name: &str) -> Option<FfiFunction> {
        self.inner.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// All registered functions, sorted by name.
    pub fn all(&self) -> Vec<FfiFunction> {
        let mut functions: Vec<_> = self.inner.read().values().cloned().collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        functions
    }
}

pub static GLOBAL_SYMBOL_REGISTRY: Lazy<SymbolRegistry> = Lazy::new(SymbolRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_resolve() {
        let registry = SymbolRegistry::new();
        registry.register(FfiFunction {
            name: "rb_protect".into(),
            symbol: "cext_protect".into(),
            signature: FfiSignature::new(
                vec![FfiType::Callback, FfiType::Handle, FfiType::Ptr],
                FfiType::Handle,
            ),
        });

        assert!(registry.contains("rb_protect"));
        assert_eq!(registry.len(), 1);
        let resolved = registry.resolve("rb_protect").expect("registered");
        assert_eq!(resolved.symbol, "cext_protect");
        assert_eq!(
            resolved.signature.to_string(),
            "(fn*, VALUE, void*) -> VALUE"
        );
    }

    #[test]
    fn listing_is_sorted() {
        let registry = SymbolRegistry::new();
        for name in ["rb_throw", "rb_catch", "rb_ensure"] {
            registry.register(FfiFunction {
                name: name.into(),
                symbol: name.replace("rb_", "cext_"),
                signature: FfiSignature::new(vec![], FfiType::Unit),
            });
        }
        let names: Vec<_> = registry.all().into_iter().map(|f| f.name).collect();
        assert_eq!(names, ["rb_catch", "rb_ensure", "rb_throw"]);
    }
}
