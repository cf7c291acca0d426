//! In-memory backend.

use crate::adapter::{Backend, Listener, Mutator, SubscriptionId, Transaction};
use crate::document::Document;
use crate::error::{BackendError, BackendResult};
use crate::subscription::SubscriberSet;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// A backend that keeps every document in process memory.
///
/// Transactions are atomic per key. Push notifications for a key are
/// delivered in commit order. Listeners run synchronously on the committing
/// task and must not call back into the backend.
///
/// Every transaction yields to the runtime before touching state (or sleeps
/// for the configured latency), so concurrent callers interleave the way they
/// would against a remote store.
pub struct MemoryBackend {
    name: String,
    documents: Mutex<HashMap<String, Document>>,
    subscribers: SubscriberSet,
    /// Serializes notification delivery across keys so no listener sees
    /// commits out of order.
    delivery: Mutex<()>,
    latency: Mutex<Option<Duration>>,
    commits: AtomicU64,
    closed: AtomicBool,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// Creates an empty backend with a custom log name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: Mutex::new(HashMap::new()),
            subscribers: SubscriberSet::new(),
            delivery: Mutex::new(()),
            latency: Mutex::new(None),
            commits: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Sets an artificial delay applied before every transaction.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Returns the stored document at `key`.
    pub fn document(&self, key: &str) -> Option<Document> {
        self.documents.lock().get(key).cloned()
    }

    /// Returns every stored key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.documents.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Overwrites `key` as a foreign writer would and notifies subscribers.
    pub fn write(&self, key: &str, document: Document) {
        let mut documents = self.documents.lock();
        documents.insert(key.to_string(), document.clone());
        self.commits.fetch_add(1, Ordering::SeqCst);
        let delivery = self.delivery.lock();
        drop(documents);
        self.subscribers.notify(key, &document);
        drop(delivery);
    }

    /// Number of transactions that wrote a document.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of listeners subscribed to `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.subscribers.count(key)
    }

    /// Rejects every later call with [`BackendError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check_open(&self) -> BackendResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transaction(&self, key: &str, mutate: Mutator<'_>) -> BackendResult<Transaction> {
        self.check_open()?;
        let latency = *self.latency.lock();
        match latency {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        self.check_open()?;

        let mut documents = self.documents.lock();
        let current = documents.get(key).cloned();
        let Some(next) = mutate(current.as_ref()) else {
            return Ok(Transaction::aborted(current));
        };
        if current.as_ref() == Some(&next) {
            return Ok(Transaction::committed(next));
        }

        documents.insert(key.to_string(), next.clone());
        self.commits.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(backend = %self.name, key, version = next.version, "committed document");
        let delivery = self.delivery.lock();
        drop(documents);
        self.subscribers.notify(key, &next);
        drop(delivery);

        Ok(Transaction::committed(next))
    }

    fn subscribe(&self, key: &str, listener: Listener) -> BackendResult<SubscriptionId> {
        self.check_open()?;
        let documents = self.documents.lock();
        let current = documents.get(key).cloned().unwrap_or_default();
        let id = self.subscribers.insert(key, listener.clone());
        let delivery = self.delivery.lock();
        drop(documents);
        listener(current);
        drop(delivery);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(id)
    }
}
