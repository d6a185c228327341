use std::hash::{Hash, Hasher};

use opentelemetry::{Array, Key, KeyValue, Value};
use rustc_hash::FxHasher;

/// A unique set of attributes that can be used as an aggregation key.
///
/// Keys are sorted and de-duplicated (the last value given for a key wins), and
/// the hash is computed once on construction so map lookups on the measurement
/// path do not re-hash every attribute.
#[derive(Clone, Debug)]
pub struct AttributeSet(Vec<KeyValue>, u64);

impl From<&[KeyValue]> for AttributeSet {
    fn from(values: &[KeyValue]) -> Self {
        let mut vec: Vec<KeyValue> = Vec::with_capacity(values.len());
        for kv in values.iter().rev() {
            if !vec.iter().any(|seen| seen.key == kv.key) {
                vec.push(kv.clone());
            }
        }
        AttributeSet::new(vec)
    }
}

fn calculate_hash(values: &[KeyValue]) -> u64 {
    let mut hasher = FxHasher::default();
    for kv in values {
        kv.key.hash(&mut hasher);
        hash_value(&kv.value, &mut hasher);
    }
    hasher.finish()
}

#[allow(unreachable_patterns)]
fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Bool(b) => {
            state.write_u8(0);
            b.hash(state);
        }
        Value::I64(i) => {
            state.write_u8(1);
            i.hash(state);
        }
        Value::F64(f) => {
            state.write_u8(2);
            f.to_bits().hash(state);
        }
        Value::String(s) => {
            state.write_u8(3);
            s.as_str().hash(state);
        }
        Value::Array(array) => {
            state.write_u8(4);
            match array {
                Array::Bool(v) => v.hash(state),
                Array::I64(v) => v.hash(state),
                Array::F64(v) => v.iter().for_each(|f| f.to_bits().hash(state)),
                Array::String(v) => v.iter().for_each(|s| s.as_str().hash(state)),
                other => other.to_string().hash(state),
            }
        }
        other => other.to_string().hash(state),
    }
}

/// Compares values so that `F64` equality, scalar or in arrays, follows the
/// same bit pattern used for hashing.
fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::F64(x), Value::F64(y)) => x.to_bits() == y.to_bits(),
        (Value::Array(Array::F64(x)), Value::Array(Array::F64(y))) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| x.to_bits() == y.to_bits())
        }
        _ => a == b,
    }
}

impl Default for AttributeSet {
    fn default() -> Self {
        AttributeSet::new(Vec::new())
    }
}

impl AttributeSet {
    fn new(mut values: Vec<KeyValue>) -> Self {
        values.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        let hash = calculate_hash(&values);
        AttributeSet(values, hash)
    }

    /// Returns the number of elements in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the set contains no elements.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Retains only the attributes specified by the predicate.
    pub fn retain<F>(&mut self, f: F)
    where
        F: Fn(&KeyValue) -> bool,
    {
        self.0.retain(|kv| f(kv));

        // Recalculate the hash as elements are changed.
        self.1 = calculate_hash(&self.0);
    }

    /// Iterate over key value pairs in the set
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.0.iter().map(|kv| (&kv.key, &kv.value))
    }

    /// Returns an owned copy of the attributes, in key order.
    pub fn to_vec(&self) -> Vec<KeyValue> {
        self.0.clone()
    }

    pub(crate) fn into_vec(self) -> Vec<KeyValue> {
        self.0
    }
}

impl PartialEq for AttributeSet {
    fn eq(&self, other: &Self) -> bool {
        self.1 == other.1
            && self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.key == b.key && value_eq(&a.value, &b.value))
    }
}

impl Eq for AttributeSet {}

impl Hash for AttributeSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.1)
    }
}
