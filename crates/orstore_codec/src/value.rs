//! Dynamic value type stored in variables and collections.

use std::cmp::Ordering;

/// Name of the field that identifies a value inside a collection.
pub const ID_FIELD: &str = "id";

/// A dynamic value.
///
/// Values are opaque to the synchronization engine except for their `id`
/// field. Equality is structural: maps are kept sorted by key, so two maps
/// holding the same entries compare equal no matter how they were built.
/// Floats are intentionally not supported.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (full i64 range).
    Integer(i64),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Text string (UTF-8).
    Text(String),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// Record of key-value pairs, sorted by key with no duplicate keys.
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Create a map value with sorted, de-duplicated keys.
    ///
    /// When a key appears more than once the last pair wins.
    pub fn map(pairs: Vec<(Value, Value)>) -> Self {
        let mut sorted: Vec<(Value, Value)> = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            match sorted.binary_search_by(|(k, _)| k.cmp(&key)) {
                Ok(pos) => sorted[pos].1 = value,
                Err(pos) => sorted.insert(pos, (key, value)),
            }
        }
        Value::Map(sorted)
    }

    /// Create a record (a map with text keys).
    pub fn record<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::map(
            fields
                .into_iter()
                .map(|(k, v)| (Value::Text(k.into()), v))
                .collect(),
        )
    }

    /// Rank of the variant, used to order values of different kinds.
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Integer(_) => 2,
            Value::Bytes(_) => 3,
            Value::Text(_) => 4,
            Value::Array(_) => 5,
            Value::Map(_) => 6,
        }
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as a string, if it is a text string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Get this value as a map, if it is one.
    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a text key in this map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs
                .binary_search_by(|(k, _)| match k {
                    Value::Text(t) => t.as_str().cmp(key),
                    other => other.rank().cmp(&4),
                })
                .ok()
                .map(|pos| &pairs[pos].1),
            _ => None,
        }
    }

    /// Returns the `id` field of a record value.
    pub fn id(&self) -> Option<&str> {
        self.get(ID_FIELD).and_then(Value::as_text)
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => a.cmp(b),
            (Value::Map(a), Value::Map(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Value::Null
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_keys_are_sorted() {
        let map = Value::record([
            ("z", Value::Integer(1)),
            ("a", Value::Integer(2)),
            ("m", Value::Integer(3)),
        ]);

        let pairs = map.as_map().unwrap();
        assert_eq!(pairs[0].0, Value::from("a"));
        assert_eq!(pairs[1].0, Value::from("m"));
        assert_eq!(pairs[2].0, Value::from("z"));
    }

    #[test]
    fn equality_ignores_construction_order() {
        let a = Value::record([("id", Value::from("x")), ("val", Value::Integer(1))]);
        let b = Value::record([("val", Value::Integer(1)), ("id", Value::from("x"))]);
        assert_eq!(a, b);
    }

    #[test]
    fn list_order_is_significant() {
        let a = Value::Array(vec![Value::Integer(1), Value::Integer(2)]);
        let b = Value::Array(vec![Value::Integer(2), Value::Integer(1)]);
        assert_ne!(a, b);
    }

    #[test]
    fn duplicate_keys_keep_last() {
        let map = Value::record([("k", Value::Integer(1)), ("k", Value::Integer(2))]);
        assert_eq!(map.as_map().unwrap().len(), 1);
        assert_eq!(map.get("k"), Some(&Value::Integer(2)));
    }

    #[test]
    fn nested_records_compare_structurally() {
        let inner_a = Value::record([("b", Value::Bool(true)), ("a", Value::Null)]);
        let inner_b = Value::record([("a", Value::Null), ("b", Value::Bool(true))]);
        let a = Value::record([("inner", inner_a), ("id", Value::from("n"))]);
        let b = Value::record([("id", Value::from("n")), ("inner", inner_b)]);
        assert_eq!(a, b);
    }

    #[test]
    fn id_accessor() {
        let v = Value::record([("id", Value::from("abc")), ("n", Value::Integer(3))]);
        assert_eq!(v.id(), Some("abc"));
        assert_eq!(Value::Integer(3).id(), None);
        assert_eq!(Value::record([("id", Value::Integer(1))]).id(), None);
    }

    #[test]
    fn get_on_mixed_keys() {
        let map = Value::map(vec![
            (Value::Integer(7), Value::from("seven")),
            (Value::from("name"), Value::from("Alice")),
        ]);
        assert_eq!(map.get("name"), Some(&Value::from("Alice")));
        assert_eq!(map.get("missing"), None);
    }

    #[test]
    fn ordering_by_kind_then_content() {
        let mut values = vec![
            Value::from("b"),
            Value::Integer(2),
            Value::Null,
            Value::from("a"),
            Value::Integer(-1),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Integer(-1),
                Value::Integer(2),
                Value::from("a"),
                Value::from("b"),
            ]
        );
    }

    #[test]
    fn from_impls() {
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(42i64), Value::Integer(42));
        assert_eq!(Value::from(42u32), Value::Integer(42));
        assert_eq!(Value::from("hello"), Value::Text("hello".to_string()));
        assert_eq!(Value::from(vec![1u8, 2, 3]), Value::Bytes(vec![1, 2, 3]));
        assert_eq!(Value::from(()), Value::Null);
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }
}
