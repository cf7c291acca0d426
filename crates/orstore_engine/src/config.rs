//! Configuration for providers and the storage registry.

use std::time::Duration;

/// Limits for a provider's persistence loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistConfig {
    /// Maximum transactions one drain may issue before giving up.
    pub max_rounds: u32,
    /// Pause between consecutive rounds of the same drain.
    pub round_backoff: Option<Duration>,
}

impl PersistConfig {
    /// Creates a config with the given round ceiling and no backoff.
    pub fn new(max_rounds: u32) -> Self {
        Self {
            max_rounds,
            round_backoff: None,
        }
    }

    /// Sets the pause between rounds.
    pub fn with_round_backoff(mut self, backoff: Duration) -> Self {
        self.round_backoff = Some(backoff);
        self
    }

    /// Effective round ceiling (at least one).
    pub fn rounds(&self) -> u32 {
        self.max_rounds.max(1)
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Configuration for a [`Storage`](crate::Storage) registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Key prefix of this storage (the backend root).
    pub root: String,
    /// Persistence limits applied to every provider.
    pub persist: PersistConfig,
    /// Path segment under `root` that holds backing stores.
    pub backing_segment: String,
}

impl StorageConfig {
    /// Creates a config rooted at `root`.
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            persist: PersistConfig::default(),
            backing_segment: "backingStores".to_string(),
        }
    }

    /// Sets the root prefix.
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    /// Sets persistence limits.
    pub fn with_persist(mut self, persist: PersistConfig) -> Self {
        self.persist = persist;
        self
    }

    /// Sets the backing store segment.
    pub fn with_backing_segment(mut self, segment: impl Into<String>) -> Self {
        self.backing_segment = segment.into();
        self
    }

    /// Storage key of a provider named `name` under this root.
    pub fn key_for(&self, name: &str) -> String {
        format!("{}/{}", self.root.trim_end_matches('/'), name)
    }

    /// Storage key of the backing store for `value_type`.
    pub fn backing_key(&self, value_type: &str) -> String {
        self.key_for(&format!("{}/{}", self.backing_segment, value_type))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::new("orstore")
    }
}
