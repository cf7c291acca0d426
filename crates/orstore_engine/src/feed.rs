//! Push-notification plumbing between a backend subscription and the
//! provider that consumes it.

use crate::error::EngineResult;
use orstore_backend::{Backend, Document, SubscriptionId};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A boxed, sendable future.
pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A live backend subscription feeding a per-provider listener task.
///
/// Backend callbacks only enqueue documents; the task applies them one at a
/// time in the order the backend committed them. Dropping the feed
/// unsubscribes and stops the task.
pub(crate) struct RemoteFeed {
    backend: Arc<dyn Backend>,
    subscription: SubscriptionId,
    task: JoinHandle<()>,
}

impl RemoteFeed {
    /// Subscribes to `key` and spawns the listener task.
    ///
    /// The task holds only a weak reference to the provider and exits once
    /// the provider is gone.
    pub(crate) fn attach<P, F>(
        backend: &Arc<dyn Backend>,
        key: &str,
        provider: Weak<P>,
        apply: F,
    ) -> EngineResult<Self>
    where
        P: Send + Sync + 'static,
        F: Fn(Arc<P>, Document) -> BoxFuture<'static, ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Document>();
        let subscription = backend.subscribe(
            key,
            Arc::new(move |doc: Document| {
                let _ = tx.send(doc);
            }),
        )?;

        let storage_key = key.to_string();
        let task = tokio::spawn(async move {
            while let Some(doc) = rx.recv().await {
                let Some(provider) = provider.upgrade() else {
                    break;
                };
                apply(provider, doc).await;
            }
            tracing::trace!(storage_key = %storage_key, "listener task finished");
        });

        Ok(Self {
            backend: Arc::clone(backend),
            subscription,
            task,
        })
    }
}

impl Drop for RemoteFeed {
    fn drop(&mut self) {
        self.backend.unsubscribe(self.subscription);
        self.task.abort();
    }
}
