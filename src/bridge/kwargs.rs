use cext_utils::suggest::find_best_match;
use tracing::debug;

use super::{BridgeError, Context, Flow, Handle};
use crate::runtime::{ManagedRuntime, SymbolId, Value};

/// Pulls keyword arguments out of `hash` by the ordered key `table`.
///
/// The first `required` keys must be present; the next `optional` keys may
/// be. A negative `optional` accepts and ignores extra keys, with
/// `-1 - optional` optional keys. With `values`, matched keys are deleted
/// from the hash and their values written to the slot at the key's table
/// position, absent optional keys reading as `Undef`. Without `values` the
/// hash is only inspected.
///
/// Returns the number of keys extracted.
pub fn extract_keywords(
    runtime: &dyn ManagedRuntime,
    hash: Value,
    table: &[SymbolId],
    required: usize,
    optional: i32,
    mut values: Option<&mut [Value]>,
) -> Result<usize, BridgeError> {
    let rest = optional < 0;
    let optional = (if rest { -1 - optional } else { optional }) as usize;
    let expected = required + optional;

    if table.len() < expected {
        return Err(BridgeError::Argument(format!(
            "keyword table has {} entries, {expected} required",
            table.len()
        )));
    }
    if let Some(slots) = values.as_deref() {
        if slots.len() != expected {
            return Err(BridgeError::Argument(format!(
                "{} keyword slots given, {expected} expected",
                slots.len()
            )));
        }
    }
    let has_hash = !hash.is_nil();
    if has_hash && !runtime.is_hash(hash) {
        return Err(BridgeError::Type(format!(
            "no implicit conversion of {} into Hash",
            runtime.describe(hash)
        )));
    }

    let mut take = |position: usize| -> Option<Value> {
        let key = Value::Symbol(table[position]);
        let found = if has_hash {
            runtime.hash_lookup(hash, key)
        } else {
            None
        };
        if let Some(slots) = values.as_deref_mut() {
            if found.is_some() {
                runtime.hash_delete(hash, key);
            }
            slots[position] = found.unwrap_or(Value::Undef);
        }
        found
    };

    let mut extracted = 0;
    for position in 0..required {
        if take(position).is_none() {
            let name = key_name(runtime, Value::Symbol(table[position]));
            return Err(BridgeError::MissingKeyword(vec![name]));
        }
        extracted += 1;
    }
    for position in required..expected {
        if take(position).is_some() {
            extracted += 1;
        }
    }

    if !rest && has_hash {
        let deleting = values.is_some();
        let remaining = runtime.hash_len(hash);
        let excess = if deleting { remaining > 0 } else { remaining > extracted };
        if excess {
            let known = &table[..expected];
            let unknown: Vec<String> = runtime
                .hash_keys(hash)
                .into_iter()
                .filter(|key| !matches!(key, Value::Symbol(id) if known.contains(id)))
                .map(|key| key_name(runtime, key))
                .collect();
            suggest_keywords(runtime, &unknown, known);
            return Err(BridgeError::UnknownKeyword(unknown));
        }
    }

    Ok(extracted)
}

fn key_name(runtime: &dyn ManagedRuntime, key: Value) -> String {
    match key {
        Value::Symbol(id) => runtime
            .symbol_name(id)
            .unwrap_or_else(|| runtime.describe(key)),
        other => runtime.describe(other),
    }
}

fn suggest_keywords(runtime: &dyn ManagedRuntime, unknown: &[String], known: &[SymbolId]) {
    let candidates: Vec<String> = known
        .iter()
        .filter_map(|id| runtime.symbol_name(*id))
        .collect();
    for name in unknown {
        if let Some(suggestion) = find_best_match(name, candidates.iter().cloned()) {
            debug!(keyword = %name, suggestion = %suggestion, "unknown keyword, did you mean");
        }
    }
}

impl Context<'_> {
    /// Keyword extraction over handles. Extracted values are wrapped into
    /// `values`; errors are raised as `ArgumentError` or `TypeError`.
    pub fn get_kwargs(
        &self,
        hash: Handle,
        table: &[Handle],
        required: usize,
        optional: i32,
        values: Option<&mut [Handle]>,
    ) -> Flow<usize> {
        let hash = self.value(hash)?;
        let mut ids = Vec::with_capacity(table.len());
        for key in table {
            match self.value(*key)? {
                Value::Symbol(id) => ids.push(id),
                other => {
                    return Err(self.fail(BridgeError::Type(format!(
                        "{} is not a symbol",
                        self.runtime().describe(other)
                    ))));
                }
            }
        }

        match values {
            Some(slots) => {
                let mut extracted_values = vec![Value::Undef; slots.len()];
                let result = extract_keywords(
                    self.runtime(),
                    hash,
                    &ids,
                    required,
                    optional,
                    Some(&mut extracted_values),
                );
                for (slot, value) in slots.iter_mut().zip(&extracted_values) {
                    *slot = self.wrap(*value);
                }
                self.check(result)
            }
            None => self.check(extract_keywords(
                self.runtime(),
                hash,
                &ids,
                required,
                optional,
                None,
            )),
        }
    }
}
