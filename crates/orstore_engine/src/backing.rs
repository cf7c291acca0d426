//! Reference-mode indirection.
//!
//! A provider in reference mode keeps only pointers `{id, backingKey}` in
//! its own document. Payloads live in a backing collection shared by every
//! provider of the same value type under one root, stored at
//! `<root>/backingStores/<value_type>`.

use crate::collection::CollectionEngine;
use crate::config::StorageConfig;
use crate::error::{EngineError, EngineResult};
use orstore_backend::Backend;
use orstore_codec::{Value, ID_FIELD};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Field of a pointer value naming the backing store.
pub const BACKING_KEY_FIELD: &str = "backingKey";

/// Builds a pointer to `id` in the backing store at `backing_key`.
pub fn pointer(id: &str, backing_key: &str) -> Value {
    Value::record([
        (ID_FIELD, Value::from(id)),
        (BACKING_KEY_FIELD, Value::from(backing_key)),
    ])
}

/// Splits a pointer into `(id, backing_key)`. Returns `None` for any other
/// value.
pub fn parse_pointer(value: &Value) -> Option<(&str, &str)> {
    let pairs = value.as_map()?;
    if pairs.len() != 2 {
        return None;
    }
    let id = value.id()?;
    let backing_key = value.get(BACKING_KEY_FIELD)?.as_text()?;
    Some((id, backing_key))
}

/// A membership key unique to one backing write by `storage_key`.
pub fn membership_key(storage_key: &str) -> String {
    format!("{storage_key}#{}", Uuid::new_v4())
}

/// A payload staged for the backing store, not yet written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingWrite {
    /// The payload.
    pub value: Value,
    /// Membership key the payload is stored under.
    pub membership: String,
}

/// Lazily created backing stores of one storage root.
///
/// Each backing store is resolved at most once; concurrent callers for the
/// same value type wait on the same resolution.
pub struct BackingStores {
    backend: Arc<dyn Backend>,
    config: StorageConfig,
    cells: Mutex<HashMap<String, Arc<OnceCell<Arc<CollectionEngine>>>>>,
}

impl BackingStores {
    /// Creates an empty cache.
    pub fn new(backend: Arc<dyn Backend>, config: StorageConfig) -> Self {
        Self {
            backend,
            config,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Storage key of the backing store for `value_type`.
    pub fn key_for(&self, value_type: &str) -> String {
        self.config.backing_key(value_type)
    }

    /// Returns the shared backing store for `value_type`, creating it on
    /// first use.
    pub async fn resolve(&self, value_type: &str) -> EngineResult<Arc<CollectionEngine>> {
        let key = self.key_for(value_type);
        let cell = Arc::clone(self.cells.lock().entry(key.clone()).or_default());
        let engine = cell
            .get_or_try_init(|| async {
                tracing::debug!(storage_key = %key, value_type, "creating backing store");
                CollectionEngine::attach(
                    key.clone(),
                    Arc::clone(&self.backend),
                    self.config.persist.clone(),
                    false,
                    None,
                )
            })
            .await?;
        Ok(Arc::clone(engine))
    }

    /// Backing stores resolved so far.
    pub fn resolved(&self) -> Vec<Arc<CollectionEngine>> {
        self.cells
            .lock()
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect()
    }

    /// Disposes and forgets every backing store.
    pub fn shutdown(&self) {
        let cells: Vec<_> = self.cells.lock().drain().collect();
        for (_, cell) in cells {
            if let Some(engine) = cell.get() {
                engine.dispose();
            }
        }
    }

    fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

/// A provider's handle on its backing store.
#[derive(Clone)]
pub struct BackingLink {
    stores: Arc<BackingStores>,
    value_type: String,
}

impl BackingLink {
    /// Links to the backing store for `value_type`.
    pub fn new(stores: Arc<BackingStores>, value_type: impl Into<String>) -> Self {
        Self {
            stores,
            value_type: value_type.into(),
        }
    }

    /// Value type served by this link.
    pub fn value_type(&self) -> &str {
        &self.value_type
    }

    /// Builds the pointer for `value` without touching the backing store.
    ///
    /// The returned [`BackingWrite`] must be flushed before a document
    /// holding the pointer is committed.
    pub fn stage(&self, storage_key: &str, value: Value) -> EngineResult<(Value, BackingWrite)> {
        let id = value.id().ok_or(EngineError::MissingId)?.to_string();
        let backing_key = self.stores.key_for(&self.value_type);
        let write = BackingWrite {
            value,
            membership: membership_key(storage_key),
        };
        Ok((pointer(&id, &backing_key), write))
    }

    /// Stores a staged payload in the backing store.
    pub async fn flush(&self, write: &BackingWrite) -> EngineResult<()> {
        let store = self.stores.resolve(&self.value_type).await?;
        store
            .store_boxed(write.value.clone(), vec![write.membership.clone()])
            .await
    }

    /// Flushes `writes` in order. On failure the unwritten tail, starting
    /// with the failed write, is handed back.
    pub async fn flush_all(
        &self,
        writes: Vec<BackingWrite>,
    ) -> Result<(), (EngineError, Vec<BackingWrite>)> {
        let mut pending = writes.into_iter();
        while let Some(write) = pending.next() {
            if let Err(e) = self.flush(&write).await {
                let mut rest = vec![write];
                rest.extend(pending);
                return Err((e, rest));
            }
        }
        Ok(())
    }

    /// Follows `stored` if it is a pointer, returning the payload.
    ///
    /// The backing store answers first. If it has not observed the value
    /// yet, the backing document is read directly.
    pub async fn dereference(&self, stored: &Value) -> EngineResult<Value> {
        let Some((id, backing_key)) = parse_pointer(stored) else {
            return Ok(stored.clone());
        };
        let store = self.stores.resolve(&self.value_type).await?;
        if store.storage_key() == backing_key {
            if let Some(value) = store.get_boxed(id.to_string()).await? {
                return Ok(value);
            }
        }

        let document = self.stores.backend().read(backing_key).await?;
        document
            .and_then(|doc| doc.item(id).map(|item| item.value.clone()))
            .ok_or_else(|| EngineError::DanglingReference {
                id: id.to_string(),
                backing_key: backing_key.to_string(),
            })
    }
}
