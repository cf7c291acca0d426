//! A revisioned document store with optimistic concurrency.
//!
//! Documents are held as CBOR bytes tagged with a revision number, the way a
//! remote document database exposes them. A transaction reads a snapshot,
//! runs the mutator outside any lock and commits only if the revision is
//! still the one it read. A lost race is retried under [`RetryConfig`].

use crate::adapter::{Backend, Listener, Mutator, SubscriptionId, Transaction};
use crate::config::RetryConfig;
use crate::document::Document;
use crate::error::{BackendError, BackendResult};
use crate::subscription::SubscriberSet;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Clone)]
struct Stored {
    revision: u64,
    bytes: Vec<u8>,
}

/// Compare-and-swap backend over encoded documents.
pub struct RevisionBackend {
    retry: RetryConfig,
    records: Mutex<HashMap<String, Stored>>,
    subscribers: SubscriberSet,
    delivery: Mutex<()>,
    pending_conflicts: AtomicU32,
    lost_races: AtomicU64,
}

impl RevisionBackend {
    /// Creates an empty store with the default retry policy.
    pub fn new() -> Self {
        Self::with_retry(RetryConfig::default())
    }

    /// Creates an empty store with a custom retry policy.
    pub fn with_retry(retry: RetryConfig) -> Self {
        Self {
            retry,
            records: Mutex::new(HashMap::new()),
            subscribers: SubscriberSet::new(),
            delivery: Mutex::new(()),
            pending_conflicts: AtomicU32::new(0),
            lost_races: AtomicU64::new(0),
        }
    }

    /// Makes the next `count` commit attempts lose to a foreign writer.
    ///
    /// The foreign writer bumps the revision without changing content.
    pub fn inject_conflicts(&self, count: u32) {
        self.pending_conflicts.fetch_add(count, Ordering::SeqCst);
    }

    /// Current revision of `key`, if stored.
    pub fn revision(&self, key: &str) -> Option<u64> {
        self.records.lock().get(key).map(|s| s.revision)
    }

    /// Total commit attempts that lost a race.
    pub fn lost_races(&self) -> u64 {
        self.lost_races.load(Ordering::SeqCst)
    }

    fn snapshot(&self, key: &str) -> BackendResult<(u64, Option<Document>)> {
        let stored = self.records.lock().get(key).cloned();
        match stored {
            Some(stored) => {
                let doc = orstore_codec::from_cbor(&stored.bytes)?;
                Ok((stored.revision, Some(doc)))
            }
            None => Ok((0, None)),
        }
    }

    /// Takes one pending injected conflict, if any.
    fn take_injected_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for RevisionBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for RevisionBackend {
    fn name(&self) -> &str {
        "revision"
    }

    async fn transaction(&self, key: &str, mutate: Mutator<'_>) -> BackendResult<Transaction> {
        let attempts = self.retry.attempts();
        for attempt in 0..attempts {
            let pause = self.retry.delay_for_attempt(attempt);
            if pause.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(pause).await;
            }

            let (revision, current) = self.snapshot(key)?;
            let Some(next) = mutate(current.as_ref()) else {
                return Ok(Transaction::aborted(current));
            };
            let bytes = orstore_codec::to_cbor(&next)?;

            let mut records = self.records.lock();
            let injected = self.take_injected_conflict();
            if injected {
                if let Some(stored) = records.get_mut(key) {
                    stored.revision += 1;
                }
            }
            let live = records.get(key).map_or(0, |s| s.revision);
            if injected || live != revision {
                drop(records);
                self.lost_races.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(key, attempt, "lost compare-and-swap, retrying");
                continue;
            }

            records.insert(
                key.to_string(),
                Stored {
                    revision: revision + 1,
                    bytes,
                },
            );
            let delivery = self.delivery.lock();
            drop(records);
            self.subscribers.notify(key, &next);
            drop(delivery);
            return Ok(Transaction::committed(next));
        }

        tracing::warn!(key, attempts, "transaction gave up after repeated conflicts");
        Err(BackendError::Conflict {
            key: key.to_string(),
            attempts,
        })
    }

    fn subscribe(&self, key: &str, listener: Listener) -> BackendResult<SubscriptionId> {
        let records = self.records.lock();
        let current = match records.get(key) {
            Some(stored) => orstore_codec::from_cbor(&stored.bytes)?,
            None => Document::default(),
        };
        let id = self.subscribers.insert(key, listener.clone());
        let delivery = self.delivery.lock();
        drop(records);
        listener(current);
        drop(delivery);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orstore_codec::Value;
    use std::sync::Arc;

    fn bump(current: Option<&Document>) -> Option<Document> {
        let mut next = current.cloned().unwrap_or_default();
        next.version += 1;
        Some(next)
    }

    #[tokio::test]
    async fn commits_advance_revision() {
        let backend = RevisionBackend::new();
        let mut mutate = bump;
        backend.transaction("k", &mut mutate).await.unwrap();
        backend.transaction("k", &mut mutate).await.unwrap();
        assert_eq!(backend.revision("k"), Some(2));
        assert_eq!(backend.read("k").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn injected_conflicts_are_retried() {
        let backend = RevisionBackend::with_retry(RetryConfig::new(4));
        let mut mutate = bump;
        backend.transaction("k", &mut mutate).await.unwrap();

        backend.inject_conflicts(2);
        let mut calls = 0;
        let mut counted = |current: Option<&Document>| {
            calls += 1;
            bump(current)
        };
        let tx = backend.transaction("k", &mut counted).await.unwrap();
        assert!(tx.committed);
        assert_eq!(calls, 3);
        assert_eq!(backend.lost_races(), 2);
        assert_eq!(tx.document.unwrap().version, 2);
    }

    #[tokio::test]
    async fn exhausted_budget_reports_conflict() {
        let backend = RevisionBackend::with_retry(RetryConfig::new(2));
        let mut mutate = bump;
        backend.transaction("k", &mut mutate).await.unwrap();
        backend.inject_conflicts(5);

        let err = backend.transaction("k", &mut mutate).await.unwrap_err();
        assert_eq!(
            err,
            BackendError::Conflict {
                key: "k".into(),
                attempts: 2
            }
        );
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn subscribers_see_decoded_documents() {
        let backend = RevisionBackend::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        backend
            .subscribe("k", Arc::new(move |doc: Document| sink.lock().push(doc.value)))
            .unwrap();

        let mut set = |_: Option<&Document>| {
            Some(Document {
                version: 1,
                value: Some(Value::from("hello")),
                ..Document::default()
            })
        };
        backend.transaction("k", &mut set).await.unwrap();
        assert_eq!(*seen.lock(), vec![None, Some(Value::from("hello"))]);
    }
}
