//! A backend wrapper that fails on request.

use async_trait::async_trait;
use orstore_backend::{
    Backend, BackendError, BackendResult, Document, Listener, Mutator, SubscriptionId,
    Transaction,
};
use orstore_codec::Value;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Pause after an interleaved foreign write, so listener tasks observe it
/// before the transaction result is returned.
const INTERLEAVE_PAUSE: Duration = Duration::from_millis(20);

/// Wraps a backend and injects failures into its transactions.
///
/// Subscriptions pass straight through, so a denied provider still sees
/// remote changes.
pub struct FaultyBackend {
    inner: Arc<dyn Backend>,
    denied: Mutex<HashSet<String>>,
    deny_all: AtomicBool,
    scripted: Mutex<VecDeque<BackendError>>,
    held: watch::Sender<bool>,
    interleaved: Mutex<Option<Value>>,
    transactions: AtomicU64,
}

impl FaultyBackend {
    /// Wraps `inner` without any failures armed.
    pub fn new(inner: Arc<dyn Backend>) -> Arc<Self> {
        let (held, _) = watch::channel(false);
        Arc::new(Self {
            inner,
            denied: Mutex::new(HashSet::new()),
            deny_all: AtomicBool::new(false),
            scripted: Mutex::new(VecDeque::new()),
            held,
            interleaved: Mutex::new(None),
            transactions: AtomicU64::new(0),
        })
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &Arc<dyn Backend> {
        &self.inner
    }

    /// Rejects transactions on `key` with a permission error.
    pub fn deny(&self, key: impl Into<String>) {
        self.denied.lock().insert(key.into());
    }

    /// Rejects every transaction with a permission error.
    pub fn deny_all(&self) {
        self.deny_all.store(true, Ordering::SeqCst);
    }

    /// Lifts every denial.
    pub fn allow_all(&self) {
        self.denied.lock().clear();
        self.deny_all.store(false, Ordering::SeqCst);
    }

    /// Fails the next `count` transactions with `error`.
    pub fn fail_next(&self, count: usize, error: BackendError) {
        let mut scripted = self.scripted.lock();
        scripted.extend(std::iter::repeat(error).take(count));
    }

    /// Parks new transactions until [`release`](Self::release).
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    /// Lets parked transactions continue.
    pub fn release(&self) {
        self.held.send_replace(false);
    }

    /// After the next committed transaction, commits a foreign document
    /// holding `value` at the following version before the result is
    /// returned.
    pub fn interleave(&self, value: Value) {
        *self.interleaved.lock() = Some(value);
    }

    /// Transactions attempted so far, including failed ones.
    pub fn transaction_count(&self) -> u64 {
        self.transactions.load(Ordering::SeqCst)
    }

    fn injected(&self, key: &str) -> Option<BackendError> {
        if let Some(error) = self.scripted.lock().pop_front() {
            return Some(error);
        }
        if self.deny_all.load(Ordering::SeqCst) || self.denied.lock().contains(key) {
            return Some(BackendError::PermissionDenied {
                key: key.to_string(),
            });
        }
        None
    }
}

#[async_trait]
impl Backend for FaultyBackend {
    fn name(&self) -> &str {
        "faulty"
    }

    async fn transaction(&self, key: &str, mutate: Mutator<'_>) -> BackendResult<Transaction> {
        self.transactions.fetch_add(1, Ordering::SeqCst);
        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        if let Some(error) = self.injected(key) {
            tracing::debug!(key, %error, "injecting backend failure");
            return Err(error);
        }
        let tx = self.inner.transaction(key, mutate).await?;
        let foreign = if tx.committed {
            self.interleaved.lock().take()
        } else {
            None
        };
        if let Some(value) = foreign {
            let mut overwrite = |current: Option<&Document>| {
                let mut next = current.cloned().unwrap_or_default();
                next.version += 1;
                next.value = Some(value.clone());
                Some(next)
            };
            self.inner.transaction(key, &mut overwrite).await?;
            tracing::debug!(key, "interleaved foreign write");
            tokio::time::sleep(INTERLEAVE_PAUSE).await;
        }
        Ok(tx)
    }

    fn subscribe(&self, key: &str, listener: Listener) -> BackendResult<SubscriptionId> {
        self.inner.subscribe(key, listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.unsubscribe(id)
    }
}
