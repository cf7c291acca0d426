//! Serialized forms of models and providers.

use orstore_codec::Value;
use serde::{Deserialize, Serialize};

/// One entry of a serialized model: `{id, value, keys}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedEntry {
    /// Entry id.
    pub id: String,
    /// Stored value.
    pub value: Value,
    /// Membership keys, in no particular order.
    pub keys: Vec<String>,
}

impl SerializedEntry {
    /// Creates a serialized entry.
    pub fn new<K: Into<String>>(
        id: impl Into<String>,
        value: Value,
        keys: impl IntoIterator<Item = K>,
    ) -> Self {
        Self {
            id: id.into(),
            value,
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

/// Serialized contents of a provider: its version plus model entries.
///
/// Variables serialize to zero or one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderLiteral {
    /// Provider version at serialization time.
    pub version: u64,
    /// Model entries.
    pub model: Vec<SerializedEntry>,
}

impl ProviderLiteral {
    /// Creates a provider literal.
    pub fn new(version: u64, model: Vec<SerializedEntry>) -> Self {
        Self { version, model }
    }
}
