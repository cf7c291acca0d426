//! Listener that records delivered events.

use orstore_engine::{Callback, ChangeDetails, ChangeEvent, EventKind};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Collects every event it is handed.
///
/// Clones share the same log.
#[derive(Clone, Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<ChangeEvent>>>,
    arrived: Arc<Notify>,
}

impl RecordingListener {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// A callback that appends to this recorder.
    pub fn callback(&self) -> Callback {
        let events = Arc::clone(&self.events);
        let arrived = Arc::clone(&self.arrived);
        Arc::new(move |event: &ChangeEvent| {
            events.lock().push(event.clone());
            arrived.notify_waiters();
        })
    }

    /// Snapshot of the recorded events.
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().clone()
    }

    /// Recorded events of `kind`.
    pub fn events_of(&self, kind: EventKind) -> Vec<ChangeEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind == kind)
            .cloned()
            .collect()
    }

    /// Versions of the recorded events, in delivery order.
    pub fn versions(&self) -> Vec<u64> {
        self.events.lock().iter().map(|event| event.version).collect()
    }

    /// Ids added by recorded collection events, in delivery order.
    pub fn added_ids(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match &event.details {
                ChangeDetails::Collection { add, .. } => Some(add),
                _ => None,
            })
            .flatten()
            .map(|change| change.id.clone())
            .collect()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every recorded event.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Waits until at least `count` events were recorded. Returns false on
    /// timeout.
    pub async fn wait_for_len(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let arrived = self.arrived.notified();
                tokio::pin!(arrived);
                arrived.as_mut().enable();
                if self.len() >= count {
                    return;
                }
                arrived.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orstore_codec::Value;
    use orstore_engine::Origin;

    fn event(version: u64) -> ChangeEvent {
        ChangeEvent {
            kind: EventKind::Change,
            version,
            storage_key: "root/v".into(),
            origin: Origin::Local,
            barrier: None,
            details: ChangeDetails::Variable {
                data: Value::from(version as i64),
            },
        }
    }

    #[tokio::test]
    async fn records_and_waits() {
        let recorder = RecordingListener::new();
        let callback = recorder.callback();

        let waiter = {
            let recorder = recorder.clone();
            tokio::spawn(async move { recorder.wait_for_len(2, Duration::from_secs(1)).await })
        };
        callback(&event(0));
        callback(&event(1));

        assert!(waiter.await.unwrap());
        assert_eq!(recorder.versions(), vec![0, 1]);
        assert_eq!(recorder.events_of(EventKind::Synced).len(), 0);

        recorder.clear();
        assert!(recorder.is_empty());
        assert!(!recorder.wait_for_len(1, Duration::from_millis(10)).await);
    }
}
