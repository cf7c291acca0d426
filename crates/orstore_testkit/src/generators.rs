//! Property-based test generators using proptest.
//!
//! Ids and keys are drawn from small alphabets so generated sequences
//! revisit the same members often.

use orstore_codec::Value;
use proptest::prelude::*;

/// One operation against a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionOp {
    /// Add a member under `keys`.
    Add {
        /// Member id.
        id: String,
        /// Value stored with the member.
        value: Value,
        /// Membership keys (never empty).
        keys: Vec<String>,
    },
    /// Remove `keys` from a member. Empty means every key.
    Remove {
        /// Member id.
        id: String,
        /// Keys to remove.
        keys: Vec<String>,
    },
}

impl CollectionOp {
    /// The member this operation touches.
    pub fn id(&self) -> &str {
        match self {
            CollectionOp::Add { id, .. } | CollectionOp::Remove { id, .. } => id,
        }
    }
}

/// Strategy for member ids.
pub fn id_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(String::from)
}

/// Strategy for membership keys.
pub fn key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("k[0-7]").expect("Invalid regex")
}

/// Strategy for arbitrary non-float values, nested up to three levels.
pub fn payload_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        prop::collection::vec(any::<u8>(), 0..8).prop_map(Value::Bytes),
        "[a-z]{0,8}".prop_map(Value::Text),
    ];
    leaf.prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::vec(("[a-z]{1,4}", inner), 0..4).prop_map(|fields| Value::record(fields)),
        ]
    })
}

/// Strategy for a collection member value with the given id.
pub fn value_with_id(id: String) -> impl Strategy<Value = Value> {
    payload_strategy().prop_map(move |payload| {
        Value::record([("id", Value::from(id.clone())), ("data", payload)])
    })
}

/// Strategy for collection member values.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    id_strategy().prop_flat_map(value_with_id)
}

/// Strategy for a single operation.
pub fn op_strategy() -> impl Strategy<Value = CollectionOp> {
    let add = id_strategy().prop_flat_map(|id| {
        (
            value_with_id(id.clone()),
            prop::collection::vec(key_strategy(), 1..3),
        )
            .prop_map(move |(value, keys)| CollectionOp::Add {
                id: id.clone(),
                value,
                keys,
            })
    });
    let remove = (id_strategy(), prop::collection::vec(key_strategy(), 0..3))
        .prop_map(|(id, keys)| CollectionOp::Remove { id, keys });
    prop_oneof![3 => add, 1 => remove]
}

/// Strategy for operation sequences of up to `max_len` steps.
pub fn op_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<CollectionOp>> {
    prop::collection::vec(op_strategy(), 0..max_len.max(1))
}
