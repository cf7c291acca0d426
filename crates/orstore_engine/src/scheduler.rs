//! Event delivery executors.
//!
//! [`ProviderCore::fire`](crate::ProviderCore::fire) never runs callbacks
//! itself. It hands one [`EventBatch`] per scheduler to that scheduler, which
//! decides when and where the callbacks run.

use crate::provider::{Callback, ChangeEvent, ListenerId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// One event together with the listeners that should receive it.
pub struct EventBatch {
    /// The event.
    pub event: ChangeEvent,
    deliveries: Vec<(ListenerId, Callback)>,
}

impl EventBatch {
    pub(crate) fn new(event: ChangeEvent, deliveries: Vec<(ListenerId, Callback)>) -> Self {
        Self { event, deliveries }
    }

    /// Listeners in this batch, in registration order.
    pub fn listeners(&self) -> Vec<ListenerId> {
        self.deliveries.iter().map(|(id, _)| *id).collect()
    }

    /// Invokes every callback with the event.
    pub fn deliver(self) {
        for (listener, callback) in &self.deliveries {
            tracing::trace!(
                storage_key = %self.event.storage_key,
                version = self.event.version,
                listener = listener.0,
                "delivering event"
            );
            callback(&self.event);
        }
    }
}

impl std::fmt::Debug for EventBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBatch")
            .field("event", &self.event)
            .field("listeners", &self.listeners())
            .finish()
    }
}

/// Executes event batches on behalf of listeners.
///
/// `schedule` is called while the provider's state is locked, so it must
/// only enqueue.
pub trait Scheduler: Send + Sync {
    /// Accepts a batch for later delivery.
    fn schedule(&self, batch: EventBatch);
}

enum Job {
    Deliver(EventBatch),
    Flush(oneshot::Sender<()>),
}

/// Delivers batches in order on a dedicated tokio task.
pub struct TaskScheduler {
    jobs: mpsc::UnboundedSender<Job>,
}

impl TaskScheduler {
    /// Spawns the delivery task. Must be called inside a tokio runtime.
    pub fn spawn() -> Arc<Self> {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Deliver(batch) => batch.deliver(),
                    Job::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Arc::new(Self { jobs })
    }

    /// Waits until every batch scheduled so far has been delivered.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.jobs.send(Job::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

impl Scheduler for TaskScheduler {
    fn schedule(&self, batch: EventBatch) {
        if self.jobs.send(Job::Deliver(batch)).is_err() {
            tracing::warn!("event delivery task has stopped; dropping batch");
        }
    }
}

/// Buffers batches until [`drain`](QueueScheduler::drain) is called.
#[derive(Default)]
pub struct QueueScheduler {
    queue: Mutex<VecDeque<EventBatch>>,
}

impl QueueScheduler {
    /// Creates an empty queue.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of batches waiting.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Delivers every waiting batch, including batches scheduled by the
    /// callbacks themselves. Returns how many were delivered.
    pub fn drain(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.queue.lock().pop_front();
            let Some(batch) = next else {
                return delivered;
            };
            batch.deliver();
            delivered += 1;
        }
    }
}

impl Scheduler for QueueScheduler {
    fn schedule(&self, batch: EventBatch) {
        self.queue.lock().push_back(batch);
    }
}
