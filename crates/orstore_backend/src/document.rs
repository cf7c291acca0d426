//! The keyed document every provider synchronizes through.

use orstore_codec::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One collection member as stored remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentItem {
    /// Stored value (a pointer in reference mode).
    pub value: Value,
    /// Membership keys.
    #[serde(default)]
    pub keys: BTreeSet<String>,
    /// Insertion index, stamped by big collections for ordered streaming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
}

impl DocumentItem {
    /// Creates an item with the given membership keys.
    pub fn new<K: Into<String>>(value: Value, keys: impl IntoIterator<Item = K>) -> Self {
        Self {
            value,
            keys: keys.into_iter().map(Into::into).collect(),
            index: None,
        }
    }
}

/// Remote state of one provider.
///
/// Variables use `value`; collections, backing stores and big collections use
/// `items`. A document that does not exist yet reads as
/// `Document::default()` (version 0, no content).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Document {
    /// Monotonic document version.
    pub version: u64,
    /// Whether values are stored as pointers into a backing store.
    #[serde(default)]
    pub reference_mode: bool,
    /// Variable payload. Engines never store `Some(Value::Null)`: a null
    /// encodes like an absent value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Collection members by id.
    #[serde(default)]
    pub items: BTreeMap<String, DocumentItem>,
}

impl Document {
    /// Creates an empty document at version 0.
    pub fn new(reference_mode: bool) -> Self {
        Self {
            reference_mode,
            ..Self::default()
        }
    }

    /// Returns the member stored under `id`.
    pub fn item(&self, id: &str) -> Option<&DocumentItem> {
        self.items.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbor_roundtrip() {
        let mut doc = Document::new(true);
        doc.version = 7;
        doc.items.insert(
            "x".into(),
            DocumentItem::new(Value::record([("id", Value::from("x"))]), ["k1", "k2"]),
        );
        let bytes = orstore_codec::to_cbor(&doc).unwrap();
        let back: Document = orstore_codec::from_cbor(&bytes).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn missing_fields_default() {
        let doc: Document = serde_json::from_str(r#"{"version":3}"#).unwrap();
        assert_eq!(doc.version, 3);
        assert!(!doc.reference_mode);
        assert!(doc.value.is_none());
        assert!(doc.items.is_empty());
    }
}
