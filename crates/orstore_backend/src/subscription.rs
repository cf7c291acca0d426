//! Subscriber bookkeeping shared by the bundled backends.

use crate::adapter::{Listener, SubscriptionId};
use crate::document::Document;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Listeners grouped by document key.
#[derive(Default)]
pub struct SubscriberSet {
    next_id: AtomicU64,
    by_key: RwLock<HashMap<String, Vec<(SubscriptionId, Listener)>>>,
}

impl SubscriberSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for `key` and returns its id.
    pub fn insert(&self, key: &str, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.by_key
            .write()
            .entry(key.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut by_key = self.by_key.write();
        let mut found = false;
        by_key.retain(|_, listeners| {
            let before = listeners.len();
            listeners.retain(|(lid, _)| *lid != id);
            found |= listeners.len() != before;
            !listeners.is_empty()
        });
        found
    }

    /// Delivers `document` to every listener of `key`.
    ///
    /// Listeners run outside the registry lock so they may subscribe or
    /// unsubscribe.
    pub fn notify(&self, key: &str, document: &Document) {
        let listeners: Vec<Listener> = self
            .by_key
            .read()
            .get(key)
            .map(|ls| ls.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(document.clone());
        }
    }

    /// Number of listeners registered for `key`.
    pub fn count(&self, key: &str) -> usize {
        self.by_key.read().get(key).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn notify_reaches_only_matching_key() {
        let set = SubscriberSet::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        set.insert("a", Arc::new(move |doc: Document| sink.lock().push(doc.version)));

        let mut doc = Document::default();
        doc.version = 4;
        set.notify("a", &doc);
        set.notify("b", &doc);
        assert_eq!(*seen.lock(), vec![4]);
    }

    #[test]
    fn remove_subscription() {
        let set = SubscriberSet::new();
        let id = set.insert("a", Arc::new(|_| {}));
        assert_eq!(set.count("a"), 1);
        assert!(set.remove(id));
        assert!(!set.remove(id));
        assert_eq!(set.count("a"), 0);
    }
}
