//! The observed-remove set backing every collection.

use crate::error::{CrdtError, CrdtResult};
use crate::literal::SerializedEntry;
use orstore_codec::Value;
use std::collections::{BTreeMap, BTreeSet};

/// A stored value together with the membership keys that keep it alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Stored value.
    pub value: Value,
    /// Membership keys. Never empty while the entry is in a model.
    pub keys: BTreeSet<String>,
}

/// An OR-Set of values identified by id.
///
/// Membership of an id is the set of keys that have been added for it and
/// not yet removed. The id is present in the model iff that set is
/// non-empty. Removing a key only affects that key, so an add and a remove
/// issued concurrently by different replicas converge without coordination.
///
/// The model does no I/O and knows nothing about versions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionModel {
    items: BTreeMap<String, Entry>,
}

impl CollectionModel {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds membership `keys` for `value` under `id`.
    ///
    /// Returns whether the add is effective: the id was new, or the value
    /// differs from the stored one. Adding only keys to an unchanged value is
    /// not effective.
    ///
    /// # Errors
    ///
    /// - [`CrdtError::EmptyKeys`] if `keys` is empty.
    /// - [`CrdtError::ValueChangeWithoutNewKeys`] if the value differs but
    ///   every key is already known. The model is left untouched.
    pub fn add<K>(&mut self, id: &str, value: Value, keys: K) -> CrdtResult<bool>
    where
        K: IntoIterator,
        K::Item: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return Err(CrdtError::EmptyKeys { id: id.to_string() });
        }

        let Some(entry) = self.items.get_mut(id) else {
            self.items.insert(
                id.to_string(),
                Entry {
                    value,
                    keys: keys.into_iter().collect(),
                },
            );
            return Ok(true);
        };

        let has_new_key = keys.iter().any(|k| !entry.keys.contains(k));
        let value_changed = entry.value != value;
        if value_changed && !has_new_key {
            return Err(CrdtError::ValueChangeWithoutNewKeys { id: id.to_string() });
        }

        entry.keys.extend(keys);
        if value_changed {
            entry.value = value;
        }
        Ok(value_changed)
    }

    /// Removes membership `keys` from `id`.
    ///
    /// Returns true if the entry lost its last key and was deleted. Unknown
    /// ids and keys are ignored.
    pub fn remove<K>(&mut self, id: &str, keys: K) -> bool
    where
        K: IntoIterator,
        K::Item: AsRef<str>,
    {
        let Some(entry) = self.items.get_mut(id) else {
            return false;
        };
        for key in keys {
            entry.keys.remove(key.as_ref());
        }
        if entry.keys.is_empty() {
            self.items.remove(id);
            true
        } else {
            false
        }
    }

    /// Returns true if `id` is a member.
    pub fn has(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    /// Returns the value stored under `id`.
    pub fn value(&self, id: &str) -> Option<&Value> {
        self.items.get(id).map(|e| &e.value)
    }

    /// Returns the membership keys of `id` (empty if absent).
    pub fn keys(&self, id: &str) -> Vec<String> {
        self.items
            .get(id)
            .map(|e| e.keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the entry stored under `id`.
    pub fn entry(&self, id: &str) -> Option<&Entry> {
        self.items.get(id)
    }

    /// Iterates over member ids.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    /// Returns every member value.
    pub fn to_list(&self) -> Vec<Value> {
        self.items.values().map(|e| e.value.clone()).collect()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the model has no members.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drops every member.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Serializes the model as a list of `{id, value, keys}` entries.
    pub fn to_literal(&self) -> Vec<SerializedEntry> {
        self.items
            .iter()
            .map(|(id, e)| SerializedEntry {
                id: id.clone(),
                value: e.value.clone(),
                keys: e.keys.iter().cloned().collect(),
            })
            .collect()
    }

    /// Restores a model from its literal. Entry order is irrelevant.
    ///
    /// # Errors
    ///
    /// Returns [`CrdtError::InvalidLiteral`] for entries without keys or
    /// duplicated ids.
    pub fn from_literal(literal: Vec<SerializedEntry>) -> CrdtResult<Self> {
        let mut items = BTreeMap::new();
        for SerializedEntry { id, value, keys } in literal {
            if keys.is_empty() {
                return Err(CrdtError::invalid_literal(format!("entry {id} has no keys")));
            }
            let entry = Entry {
                value,
                keys: keys.into_iter().collect(),
            };
            if items.insert(id.clone(), entry).is_some() {
                return Err(CrdtError::invalid_literal(format!("duplicate id {id}")));
            }
        }
        Ok(Self { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn item(id: &str, val: i64) -> Value {
        Value::record([("id", Value::from(id)), ("val", Value::Integer(val))])
    }

    #[test]
    fn add_new_id_is_effective() {
        let mut model = CollectionModel::new();
        assert!(model.add("x", item("x", 1), ["k1"]).unwrap());
        assert_eq!(model.to_list(), vec![item("x", 1)]);
        assert_eq!(model.len(), 1);
    }

    #[test]
    fn add_same_value_new_key_is_not_effective() {
        let mut model = CollectionModel::new();
        model.add("x", item("x", 1), ["k1"]).unwrap();
        assert!(!model.add("x", item("x", 1), ["k2"]).unwrap());
        assert_eq!(model.keys("x"), vec!["k1".to_string(), "k2".to_string()]);
    }

    #[test]
    fn add_changed_value_with_new_key() {
        let mut model = CollectionModel::new();
        model.add("x", item("x", 1), ["k1"]).unwrap();
        assert!(model.add("x", item("x", 2), ["k2"]).unwrap());
        assert_eq!(model.value("x"), Some(&item("x", 2)));
    }

    #[test]
    fn add_changed_value_without_new_key_fails() {
        let mut model = CollectionModel::new();
        model.add("x", item("x", 1), ["k1"]).unwrap();
        let err = model.add("x", item("x", 2), ["k1"]).unwrap_err();
        assert_eq!(err, CrdtError::ValueChangeWithoutNewKeys { id: "x".into() });
        assert_eq!(model.value("x"), Some(&item("x", 1)));
    }

    #[test]
    fn add_without_keys_fails() {
        let mut model = CollectionModel::new();
        let err = model.add("x", item("x", 1), Vec::<String>::new()).unwrap_err();
        assert_eq!(err, CrdtError::EmptyKeys { id: "x".into() });
        assert!(model.is_empty());
    }

    #[test]
    fn remove_last_key_deletes_entry() {
        let mut model = CollectionModel::new();
        model.add("x", item("x", 1), ["k1", "k2"]).unwrap();
        assert!(!model.remove("x", ["k1"]));
        assert!(model.has("x"));
        assert!(model.remove("x", ["k2"]));
        assert!(!model.has("x"));
        assert_eq!(model.value("x"), None);
    }

    #[test]
    fn remove_unknown_id_is_noop() {
        let mut model = CollectionModel::new();
        assert!(!model.remove("nope", ["k"]));
    }

    #[test]
    fn readd_after_full_removal_has_only_new_keys() {
        let mut model = CollectionModel::new();
        model.add("x", item("x", 1), ["k1", "k2"]).unwrap();
        let keys = model.keys("x");
        assert!(model.remove("x", &keys));
        assert!(model.add("x", item("x", 2), ["k3"]).unwrap());
        assert_eq!(model.keys("x"), vec!["k3".to_string()]);
    }

    #[test]
    fn literal_rejects_keyless_entries() {
        let literal = vec![SerializedEntry::new("x", item("x", 1), Vec::<String>::new())];
        assert!(matches!(
            CollectionModel::from_literal(literal),
            Err(CrdtError::InvalidLiteral { .. })
        ));
    }

    #[test]
    fn literal_rejects_duplicate_ids() {
        let literal = vec![
            SerializedEntry::new("x", item("x", 1), ["a"]),
            SerializedEntry::new("x", item("x", 1), ["b"]),
        ];
        assert!(CollectionModel::from_literal(literal).is_err());
    }

    #[test]
    fn literal_json_is_order_independent() {
        let a = r#"[{"id":"x","value":{"id":"x"},"keys":["k1","k2"]},{"id":"y","value":{"id":"y"},"keys":["k3"]}]"#;
        let b = r#"[{"id":"y","value":{"id":"y"},"keys":["k3"]},{"id":"x","value":{"id":"x"},"keys":["k2","k1"]}]"#;
        let ma = CollectionModel::from_literal(serde_json::from_str(a).unwrap()).unwrap();
        let mb = CollectionModel::from_literal(serde_json::from_str(b).unwrap()).unwrap();
        assert_eq!(ma, mb);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add { id: u8, val: i64, key: u8 },
        Remove { id: u8, keys: Vec<u8> },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, 0i64..3, 0u8..16).prop_map(|(id, val, key)| Op::Add { id, val, key }),
            (0u8..4, prop::collection::vec(0u8..16, 0..4))
                .prop_map(|(id, keys)| Op::Remove { id, keys }),
        ]
    }

    proptest! {
        #[test]
        fn membership_matches_key_algebra(ops in prop::collection::vec(op_strategy(), 0..64)) {
            let mut model = CollectionModel::new();
            let mut live: HashMap<String, BTreeSet<String>> = HashMap::new();
            for op in ops {
                match op {
                    Op::Add { id, val, key } => {
                        let id = format!("id{id}");
                        let key = format!("k{key}");
                        // A rejected add leaves both sides unchanged.
                        if model.add(&id, item(&id, val), [key.clone()]).is_ok() {
                            live.entry(id).or_default().insert(key);
                        }
                    }
                    Op::Remove { id, keys } => {
                        let id = format!("id{id}");
                        let keys: Vec<String> = keys.iter().map(|k| format!("k{k}")).collect();
                        model.remove(&id, &keys);
                        if let Some(set) = live.get_mut(&id) {
                            for k in &keys {
                                set.remove(k);
                            }
                            if set.is_empty() {
                                live.remove(&id);
                            }
                        }
                    }
                }
            }
            for n in 0u8..4 {
                let id = format!("id{n}");
                let expected = live.get(&id).map(|s| !s.is_empty()).unwrap_or(false);
                prop_assert_eq!(model.value(&id).is_some(), expected);
            }
        }

        #[test]
        fn literal_roundtrip(ops in prop::collection::vec(op_strategy(), 0..32)) {
            let mut model = CollectionModel::new();
            for op in ops {
                match op {
                    Op::Add { id, val, key } => {
                        let id = format!("id{id}");
                        let _ = model.add(&id, item(&id, val), [format!("k{key}")]);
                    }
                    Op::Remove { id, keys } => {
                        let keys: Vec<String> = keys.iter().map(|k| format!("k{k}")).collect();
                        model.remove(&format!("id{id}"), &keys);
                    }
                }
            }
            let mut literal = model.to_literal();
            literal.reverse();
            let restored = CollectionModel::from_literal(literal).unwrap();
            prop_assert_eq!(restored, model);
        }

        #[test]
        fn split_adds_equal_joint_add(k1 in "[a-z]{1,4}", k2 in "[a-z]{1,4}") {
            let mut split = CollectionModel::new();
            split.add("x", item("x", 1), [k1.clone()]).unwrap();
            split.add("x", item("x", 1), [k2.clone()]).unwrap();
            let mut joint = CollectionModel::new();
            joint.add("x", item("x", 1), [k1, k2]).unwrap();
            prop_assert_eq!(split, joint);
        }
    }
}
