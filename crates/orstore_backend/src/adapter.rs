//! The backend adapter interface.

use crate::document::Document;
use crate::error::BackendResult;
use async_trait::async_trait;
use std::sync::Arc;

/// Read-modify-write function passed to [`Backend::transaction`].
///
/// Receives the current document (`None` if it does not exist) and returns
/// the next one, or `None` to abort without writing. Adapters may call it
/// more than once when they lose a race with another writer, so it must not
/// have side effects beyond its captured state.
pub type Mutator<'a> = &'a mut (dyn FnMut(Option<&Document>) -> Option<Document> + Send);

/// Push-notification callback. Invoked with the full document.
pub type Listener = Arc<dyn Fn(Document) + Send + Sync>;

/// Identifies a push subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Outcome of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Whether a new document was written. False when the mutator aborted.
    pub committed: bool,
    /// Document state after the transaction (`None` if it still does not exist).
    pub document: Option<Document>,
}

impl Transaction {
    /// A transaction that wrote `document`.
    pub fn committed(document: Document) -> Self {
        Self {
            committed: true,
            document: Some(document),
        }
    }

    /// A transaction whose mutator aborted, leaving `document` in place.
    pub fn aborted(document: Option<Document>) -> Self {
        Self {
            committed: false,
            document,
        }
    }
}

/// A persistence backend holding keyed documents.
///
/// This trait abstracts the remote store, allowing different implementations
/// (in-memory, revisioned document stores, test doubles) behind one engine.
///
/// # Contract
///
/// - `transaction` is atomic per key and retries internally when another
///   writer interferes. It returns an error only for genuine failures.
/// - `subscribe` delivers the current document immediately (the default
///   document if none exists) and then every committed state, in commit
///   order.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Atomically applies `mutate` to the document at `key`.
    async fn transaction(&self, key: &str, mutate: Mutator<'_>) -> BackendResult<Transaction>;

    /// Registers `listener` for every committed state of `key`.
    fn subscribe(&self, key: &str, listener: Listener) -> BackendResult<SubscriptionId>;

    /// Removes a subscription. Returns false if it was unknown.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Reads the document at `key` without writing.
    async fn read(&self, key: &str) -> BackendResult<Option<Document>> {
        let mut abort = |_: Option<&Document>| -> Option<Document> { None };
        Ok(self.transaction(key, &mut abort).await?.document)
    }
}
