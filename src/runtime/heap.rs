use ahash::{AHashMap, AHashSet};
use num_bigint::BigInt;
use parking_lot::Mutex;
use tracing::debug;

use super::{CollectStats, ManagedRuntime, ObjectId, StandardClass, SymbolId, Value};

/// Payload of one heap allocation.
#[derive(Debug, Clone, PartialEq)]
pub enum HeapObject {
    String(String),
    Array(Vec<Value>),
    /// Insertion-ordered pairs; string keys compare by content.
    Hash(Vec<(Value, Value)>),
    Bignum(BigInt),
    Class {
        name: String,
        superclass: Option<ObjectId>,
    },
    Exception {
        class: ObjectId,
        message: String,
    },
}

impl HeapObject {
    fn children(&self) -> Vec<ObjectId> {
        match self {
            Self::String(_) | Self::Bignum(_) => Vec::new(),
            Self::Array(items) => items.iter().filter_map(|v| v.object_id()).collect(),
            Self::Hash(pairs) => pairs
                .iter()
                .flat_map(|(k, v)| [k.object_id(), v.object_id()])
                .flatten()
                .collect(),
            Self::Class { superclass, .. } => superclass.iter().copied().collect(),
            Self::Exception { class, .. } => vec![*class],
        }
    }
}

struct HeapInner {
    objects: AHashMap<ObjectId, HeapObject>,
    next_id: u64,
    symbols: Vec<String>,
    symbol_index: AHashMap<String, SymbolId>,
    classes: AHashMap<StandardClass, ObjectId>,
    /// Objects that survive every collection (classes, explicit roots).
    permanent: AHashSet<ObjectId>,
}

impl HeapInner {
    fn alloc(&mut self, object: HeapObject) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        self.objects.insert(id, object);
        id
    }

    fn get(&self, value: Value) -> Option<&HeapObject> {
        value.object_id().and_then(|id| self.objects.get(&id))
    }

    fn keys_equal(&self, a: Value, b: Value) -> bool {
        if a == b {
            return true;
        }
        match (self.get(a), self.get(b)) {
            (Some(HeapObject::String(x)), Some(HeapObject::String(y))) => x == y,
            (Some(HeapObject::Bignum(x)), Some(HeapObject::Bignum(y))) => x == y,
            _ => false,
        }
    }

    fn hash_position(&self, hash: Value, key: Value) -> Option<usize> {
        match self.get(hash)? {
            HeapObject::Hash(pairs) => pairs.iter().position(|(k, _)| self.keys_equal(*k, key)),
            _ => None,
        }
    }

    fn hash_pairs_mut(&mut self, hash: Value) -> Option<&mut Vec<(Value, Value)>> {
        match hash.object_id().and_then(|id| self.objects.get_mut(&id))? {
            HeapObject::Hash(pairs) => Some(pairs),
            _ => None,
        }
    }

    fn symbol(&self, id: SymbolId) -> Option<&str> {
        self.symbols.get(id.0 as usize).map(String::as_str)
    }

    fn describe(&self, value: Value) -> String {
        match value {
            Value::Symbol(id) => format!(":{}", self.symbol(id).unwrap_or("?")),
            Value::Object(id) => match self.objects.get(&id) {
                Some(HeapObject::String(s)) => format!("{s:?}"),
                Some(HeapObject::Array(items)) => {
                    let parts: Vec<_> = items.iter().map(|v| self.describe(*v)).collect();
                    format!("[{}]", parts.join(", "))
                }
                Some(HeapObject::Hash(pairs)) => {
                    let parts: Vec<_> = pairs
                        .iter()
                        .map(|(k, v)| format!("{} => {}", self.describe(*k), self.describe(*v)))
                        .collect();
                    format!("{{{}}}", parts.join(", "))
                }
                Some(HeapObject::Bignum(n)) => n.to_string(),
                Some(HeapObject::Class { name, .. }) => name.clone(),
                Some(HeapObject::Exception { class, message }) => {
                    let class_name = match self.objects.get(class) {
                        Some(HeapObject::Class { name, .. }) => name.as_str(),
                        _ => "?",
                    };
                    format!("#<{class_name}: {message}>")
                }
                None => format!("#<collected obj#{}>", id.0),
            },
            other => other.to_string(),
        }
    }
}

/// A small garbage-collected object heap.
///
/// Symbols are never collected. Standard exception classes are created up
/// front and stay rooted for the heap's lifetime.
pub struct ManagedHeap {
    inner: Mutex<HeapInner>,
}

impl Default for ManagedHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedHeap {
    pub fn new() -> Self {
        let mut inner = HeapInner {
            objects: AHashMap::new(),
            next_id: 1,
            symbols: Vec::new(),
            symbol_index: AHashMap::new(),
            classes: AHashMap::new(),
            permanent: AHashSet::new(),
        };
        for class in StandardClass::ALL {
            let superclass = class
                .superclass()
                .and_then(|parent| inner.classes.get(&parent).copied());
            let id = inner.alloc(HeapObject::Class {
                name: class.name().to_string(),
                superclass,
            });
            inner.classes.insert(class, id);
            inner.permanent.insert(id);
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn new_array(&self, items: Vec<Value>) -> Value {
        Value::Object(self.inner.lock().alloc(HeapObject::Array(items)))
    }

    /// Builds a hash; later duplicates of a key overwrite earlier ones.
    pub fn new_hash(&self, pairs: impl IntoIterator<Item = (Value, Value)>) -> Value {
        let hash = Value::Object(self.inner.lock().alloc(HeapObject::Hash(Vec::new())));
        for (key, value) in pairs {
            self.hash_set(hash, key, value);
        }
        hash
    }

    pub fn hash_set(&self, hash: Value, key: Value, value: Value) {
        let mut inner = self.inner.lock();
        let position = inner.hash_position(hash, key);
        if let Some(pairs) = inner.hash_pairs_mut(hash) {
            match position {
                Some(index) => pairs[index].1 = value,
                None => pairs.push((key, value)),
            }
        }
    }

    /// Defines a class whose instances can be raised when `superclass`
    /// descends from `Exception`.
    pub fn define_class(&self, name: &str, superclass: Value) -> Value {
        let mut inner = self.inner.lock();
        let id = inner.alloc(HeapObject::Class {
            name: name.to_string(),
            superclass: superclass.object_id(),
        });
        inner.permanent.insert(id);
        Value::Object(id)
    }

    pub fn string_value(&self, value: Value) -> Option<String> {
        match self.inner.lock().get(value)? {
            HeapObject::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn object(&self, value: Value) -> Option<HeapObject> {
        self.inner.lock().get(value).cloned()
    }

    pub fn add_root(&self, object: ObjectId) {
        self.inner.lock().permanent.insert(object);
    }

    pub fn remove_root(&self, object: ObjectId) {
        self.inner.lock().permanent.remove(&object);
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().objects.len()
    }
}

impl ManagedRuntime for ManagedHeap {
    fn intern(&self, name: &str) -> SymbolId {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.symbol_index.get(name) {
            return *id;
        }
        let id = SymbolId(inner.symbols.len() as u32);
        inner.symbols.push(name.to_string());
        inner.symbol_index.insert(name.to_string(), id);
        id
    }

    fn symbol_name(&self, id: SymbolId) -> Option<String> {
        self.inner.lock().symbol(id).map(str::to_string)
    }

    fn is_live(&self, object: ObjectId) -> bool {
        self.inner.lock().objects.contains_key(&object)
    }

    fn describe(&self, value: Value) -> String {
        self.inner.lock().describe(value)
    }

    fn standard_class(&self, class: StandardClass) -> Value {
        self.inner
            .lock()
            .classes
            .get(&class)
            .map_or(Value::Nil, |id| Value::Object(*id))
    }

    fn is_class(&self, value: Value) -> bool {
        matches!(self.inner.lock().get(value), Some(HeapObject::Class { .. }))
    }

    fn class_name(&self, class: Value) -> Option<String> {
        match self.inner.lock().get(class)? {
            HeapObject::Class { name, .. } => Some(name.clone()),
            _ => None,
        }
    }

    fn kind_of(&self, value: Value, class: Value) -> bool {
        let inner = self.inner.lock();
        let Some(target) = class.object_id() else {
            return false;
        };
        let mut current = match inner.get(value) {
            Some(HeapObject::Exception { class, .. }) => Some(*class),
            _ => None,
        };
        while let Some(id) = current {
            if id == target {
                return true;
            }
            current = match inner.objects.get(&id) {
                Some(HeapObject::Class { superclass, .. }) => *superclass,
                _ => None,
            };
        }
        false
    }

    fn new_exception(&self, class: Value, message: &str) -> Value {
        let mut inner = self.inner.lock();
        let class = match class.object_id() {
            Some(id) if matches!(inner.objects.get(&id), Some(HeapObject::Class { .. })) => id,
            _ => inner.classes[&StandardClass::RuntimeError],
        };
        Value::Object(inner.alloc(HeapObject::Exception {
            class,
            message: message.to_string(),
        }))
    }

    fn exception_message(&self, exception: Value) -> Option<String> {
        match self.inner.lock().get(exception)? {
            HeapObject::Exception { message, .. } => Some(message.clone()),
            _ => None,
        }
    }

    fn new_string(&self, text: &str) -> Value {
        Value::Object(self.inner.lock().alloc(HeapObject::String(text.to_string())))
    }

    fn to_integer(&self, value: Value) -> Option<BigInt> {
        match value {
            Value::Fixnum(n) => Some(BigInt::from(n)),
            Value::Object(_) => match self.inner.lock().get(value)? {
                HeapObject::Bignum(n) => Some(n.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    fn new_integer(&self, value: &BigInt) -> Value {
        if let Some(fixnum) = i64::try_from(value).ok().and_then(Value::fixnum) {
            return fixnum;
        }
        Value::Object(self.inner.lock().alloc(HeapObject::Bignum(value.clone())))
    }

    fn is_hash(&self, value: Value) -> bool {
        matches!(self.inner.lock().get(value), Some(HeapObject::Hash(_)))
    }

    fn hash_lookup(&self, hash: Value, key: Value) -> Option<Value> {
        let inner = self.inner.lock();
        let index = inner.hash_position(hash, key)?;
        match inner.get(hash)? {
            HeapObject::Hash(pairs) => Some(pairs[index].1),
            _ => None,
        }
    }

    fn hash_delete(&self, hash: Value, key: Value) -> Option<Value> {
        let mut inner = self.inner.lock();
        let index = inner.hash_position(hash, key)?;
        inner
            .hash_pairs_mut(hash)
            .map(|pairs| pairs.remove(index).1)
    }

    fn hash_keys(&self, hash: Value) -> Vec<Value> {
        match self.inner.lock().get(hash) {
            Some(HeapObject::Hash(pairs)) => pairs.iter().map(|(k, _)| *k).collect(),
            _ => Vec::new(),
        }
    }

    fn hash_len(&self, hash: Value) -> usize {
        match self.inner.lock().get(hash) {
            Some(HeapObject::Hash(pairs)) => pairs.len(),
            _ => 0,
        }
    }

    fn collect(&self, roots: &[ObjectId]) -> CollectStats {
        let mut inner = self.inner.lock();
        let mut marked = AHashSet::with_capacity(inner.objects.len());
        let mut worklist: Vec<ObjectId> = roots
            .iter()
            .chain(inner.permanent.iter())
            .copied()
            .collect();
        let root_count = worklist.len();

        while let Some(id) = worklist.pop() {
            if !marked.insert(id) {
                continue;
            }
            if let Some(object) = inner.objects.get(&id) {
                worklist.extend(object.children());
            }
        }

        let before = inner.objects.len();
        inner.objects.retain(|id, _| marked.contains(id));
        let stats = CollectStats {
            roots: root_count,
            survivors: inner.objects.len(),
            freed: before - inner.objects.len(),
        };
        debug!(
            roots = stats.roots,
            survivors = stats.survivors,
            freed = stats.freed,
            "heap collected"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let heap = ManagedHeap::new();
        let a = heap.intern("alpha");
        let b = heap.intern("beta");
        assert_ne!(a, b);
        assert_eq!(heap.intern("alpha"), a);
        assert_eq!(heap.symbol_name(b).as_deref(), Some("beta"));
    }

    #[test]
    fn class_hierarchy_drives_kind_of() {
        let heap = ManagedHeap::new();
        let standard = heap.standard_class(StandardClass::StandardError);
        let argument = heap.standard_class(StandardClass::ArgumentError);
        let no_memory = heap.standard_class(StandardClass::NoMemoryError);

        let exc = heap.new_exception(argument, "bad");
        assert!(heap.kind_of(exc, argument));
        assert!(heap.kind_of(exc, standard));
        assert!(!heap.kind_of(exc, no_memory));
        assert_eq!(heap.describe(exc), "#<ArgumentError: bad>");
    }

    #[test]
    fn string_keys_compare_by_content() {
        let heap = ManagedHeap::new();
        let first = heap.new_string("k");
        let second = heap.new_string("k");
        let hash = heap.new_hash([(first, Value::Fixnum(1))]);
        assert_eq!(heap.hash_lookup(hash, second), Some(Value::Fixnum(1)));
        assert_eq!(heap.hash_delete(hash, second), Some(Value::Fixnum(1)));
        assert_eq!(heap.hash_len(hash), 0);
    }

    #[test]
    fn collection_keeps_reachable_objects() {
        let heap = ManagedHeap::new();
        let kept = heap.new_string("kept");
        let inner = heap.new_string("inner");
        let array = heap.new_array(vec![inner]);
        let garbage = heap.new_string("garbage");

        let stats = heap.collect(&[kept.object_id().unwrap(), array.object_id().unwrap()]);
        assert_eq!(stats.freed, 1);
        assert!(heap.is_live(inner.object_id().unwrap()));
        assert!(!heap.is_live(garbage.object_id().unwrap()));
    }

    #[test]
    fn big_values_allocate() {
        let heap = ManagedHeap::new();
        assert_eq!(heap.new_integer(&BigInt::from(7)), Value::Fixnum(7));
        let big = BigInt::from(1u8) << 80;
        let value = heap.new_integer(&big);
        assert!(matches!(value, Value::Object(_)));
        assert_eq!(heap.to_integer(value), Some(big));
    }
}
