//! Collections too large to mirror locally.
//!
//! A big collection keeps no model. Every write is one backend transaction
//! and every read goes to the backend. Items are stamped with the document
//! version that stored them, which gives streams a stable order.

use crate::error::{EngineError, EngineResult};
use orstore_backend::{Backend, Document, DocumentItem};
use orstore_codec::Value;
use orstore_crdt::CrdtError;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Identifies an open stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CursorId(pub u64);

/// Result of [`BigCollection::cursor_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorPage {
    /// The next page of values.
    Page(Vec<Value>),
    /// The stream is exhausted or was closed.
    Done,
}

struct Cursor {
    version: u64,
    page_size: usize,
    remaining: VecDeque<Value>,
}

#[derive(Default)]
struct Cursors {
    next: u64,
    open: HashMap<CursorId, Cursor>,
}

/// A pass-through collection with paged streaming.
pub struct BigCollection {
    storage_key: String,
    backend: Arc<dyn Backend>,
    cursors: Mutex<Cursors>,
}

impl BigCollection {
    /// Creates a big collection over the document at `storage_key`.
    pub fn new(storage_key: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            storage_key: storage_key.into(),
            backend,
            cursors: Mutex::new(Cursors::default()),
        }
    }

    /// Storage key of the document.
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Current document version (0 if it does not exist).
    pub async fn version(&self) -> EngineResult<u64> {
        let doc = self.backend.read(&self.storage_key).await?;
        Ok(doc.map_or(0, |d| d.version))
    }

    /// Stores `value` with membership `keys`, stamping it with the new
    /// document version.
    pub async fn store<K>(&self, value: Value, keys: K) -> EngineResult<()>
    where
        K: IntoIterator,
        K::Item: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        let id = value.id().ok_or(EngineError::MissingId)?.to_string();
        if keys.is_empty() {
            return Err(CrdtError::EmptyKeys { id }.into());
        }

        let mut mutate = |current: Option<&Document>| {
            let mut next = current.cloned().unwrap_or_default();
            next.version += 1;
            let version = next.version;
            let item = next
                .items
                .entry(id.clone())
                .or_insert_with(|| DocumentItem::new(value.clone(), Vec::<String>::new()));
            item.value = value.clone();
            item.keys.extend(keys.iter().cloned());
            item.index = Some(version);
            Some(next)
        };
        self.commit(&mut mutate).await
    }

    /// Deletes `id`. The version advances even if the id was absent.
    pub async fn remove(&self, id: &str) -> EngineResult<()> {
        let mut mutate = |current: Option<&Document>| {
            let mut next = current.cloned().unwrap_or_default();
            next.version += 1;
            next.items.remove(id);
            Some(next)
        };
        self.commit(&mut mutate).await
    }

    /// Reads the value stored under `id`.
    pub async fn get(&self, id: &str) -> EngineResult<Option<Value>> {
        let doc = self.backend.read(&self.storage_key).await?;
        Ok(doc.and_then(|d| d.items.get(id).map(|item| item.value.clone())))
    }

    /// Opens a stream over the items present now, in insertion order
    /// (reversed unless `forward`).
    pub async fn stream(&self, page_size: usize, forward: bool) -> EngineResult<CursorId> {
        if page_size == 0 {
            return Err(EngineError::invalid_operation("page size must be positive"));
        }
        let doc = self
            .backend
            .read(&self.storage_key)
            .await?
            .unwrap_or_default();

        let mut items: Vec<(u64, Value)> = doc
            .items
            .into_values()
            .map(|item| (item.index.unwrap_or(0), item.value))
            .collect();
        items.sort_by_key(|(index, _)| *index);
        if !forward {
            items.reverse();
        }

        let mut cursors = self.cursors.lock();
        cursors.next += 1;
        let id = CursorId(cursors.next);
        cursors.open.insert(
            id,
            Cursor {
                version: doc.version,
                page_size,
                remaining: items.into_iter().map(|(_, value)| value).collect(),
            },
        );
        tracing::debug!(storage_key = %self.storage_key, cursor = id.0, version = doc.version, "stream opened");
        Ok(id)
    }

    /// Returns the next page. Exhausted and unknown cursors report
    /// [`CursorPage::Done`]; an exhausted cursor is closed.
    pub fn cursor_next(&self, id: CursorId) -> CursorPage {
        let mut cursors = self.cursors.lock();
        let Some(cursor) = cursors.open.get_mut(&id) else {
            return CursorPage::Done;
        };
        if cursor.remaining.is_empty() {
            cursors.open.remove(&id);
            return CursorPage::Done;
        }
        let take = cursor.page_size.min(cursor.remaining.len());
        CursorPage::Page(cursor.remaining.drain(..take).collect())
    }

    /// Closes a stream.
    pub fn cursor_close(&self, id: CursorId) {
        self.cursors.lock().open.remove(&id);
    }

    /// Document version the stream was opened at.
    pub fn cursor_version(&self, id: CursorId) -> Option<u64> {
        self.cursors.lock().open.get(&id).map(|c| c.version)
    }

    /// Drops every open stream.
    pub fn dispose(&self) {
        self.cursors.lock().open.clear();
    }

    async fn commit(&self, mutate: orstore_backend::Mutator<'_>) -> EngineResult<()> {
        let tx = self.backend.transaction(&self.storage_key, mutate).await?;
        if !tx.committed {
            return Err(EngineError::Uncommitted {
                storage_key: self.storage_key.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orstore_backend::MemoryBackend;

    fn item(id: &str) -> Value {
        Value::record([("id", Value::from(id))])
    }

    fn collection() -> BigCollection {
        BigCollection::new("root/big", Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn store_get_remove() {
        let big = collection();
        big.store(item("a"), ["k1"]).await.unwrap();
        assert_eq!(big.get("a").await.unwrap(), Some(item("a")));
        assert_eq!(big.version().await.unwrap(), 1);

        big.remove("a").await.unwrap();
        assert_eq!(big.get("a").await.unwrap(), None);
        assert_eq!(big.version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn stream_pages_in_insertion_order() {
        let big = collection();
        for id in ["c", "a", "b"] {
            big.store(item(id), ["k"]).await.unwrap();
        }

        let cursor = big.stream(2, true).await.unwrap();
        assert_eq!(big.cursor_version(cursor), Some(3));
        assert_eq!(big.cursor_next(cursor), CursorPage::Page(vec![item("c"), item("a")]));
        assert_eq!(big.cursor_next(cursor), CursorPage::Page(vec![item("b")]));
        assert_eq!(big.cursor_next(cursor), CursorPage::Done);
        assert_eq!(big.cursor_version(cursor), None);
    }

    #[tokio::test]
    async fn backward_stream_and_restamp() {
        let big = collection();
        big.store(item("a"), ["k1"]).await.unwrap();
        big.store(item("b"), ["k2"]).await.unwrap();
        big.store(item("a"), ["k3"]).await.unwrap();

        let cursor = big.stream(10, false).await.unwrap();
        assert_eq!(big.cursor_next(cursor), CursorPage::Page(vec![item("a"), item("b")]));
    }

    #[tokio::test]
    async fn closed_cursor_is_done() {
        let big = collection();
        big.store(item("a"), ["k1"]).await.unwrap();
        let cursor = big.stream(1, true).await.unwrap();
        big.cursor_close(cursor);
        assert_eq!(big.cursor_next(cursor), CursorPage::Done);
    }

    #[tokio::test]
    async fn zero_page_size_is_rejected() {
        let big = collection();
        assert!(matches!(
            big.stream(0, true).await,
            Err(EngineError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn unindexed_items_stream_first() {
        let backend = Arc::new(MemoryBackend::new());
        let mut doc = Document::default();
        doc.version = 7;
        doc.items
            .insert("old".into(), DocumentItem::new(item("old"), ["k"]));
        backend.write("root/big", doc);

        let big = BigCollection::new("root/big", backend.clone());
        big.store(item("new"), ["k"]).await.unwrap();

        let cursor = big.stream(10, true).await.unwrap();
        assert_eq!(big.cursor_version(cursor), Some(8));
        assert_eq!(
            big.cursor_next(cursor),
            CursorPage::Page(vec![item("old"), item("new")])
        );
    }
}
