//! Bookkeeping shared by every provider: the version counter and the
//! listener registry.

use crate::scheduler::{EventBatch, Scheduler};
use orstore_codec::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Kind of event a listener can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// Data changed, locally or remotely.
    Change,
    /// A persistence drain left no local changes behind.
    Synced,
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A call on this replica.
    Local,
    /// A backend notification.
    Remote,
}

/// One collection member affected by a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemChange {
    /// Member id.
    pub id: String,
    /// Value (the payload, also in reference mode).
    pub value: Value,
    /// Keys added or removed.
    pub keys: Vec<String>,
    /// Whether the change altered visible state.
    pub effective: bool,
}

/// Payload of a [`ChangeEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeDetails {
    /// New value of a variable.
    Variable {
        /// The value.
        data: Value,
    },
    /// Members added to and removed from a collection.
    Collection {
        /// Added members.
        add: Vec<ItemChange>,
        /// Removed members.
        remove: Vec<ItemChange>,
    },
    /// Nothing left to persist.
    Synced,
}

/// An event delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Event kind.
    pub kind: EventKind,
    /// Provider version after the change.
    pub version: u64,
    /// Storage key of the provider.
    pub storage_key: String,
    /// Where the change came from.
    pub origin: Origin,
    /// Barrier token passed to `set`, if any.
    pub barrier: Option<String>,
    /// What changed.
    pub details: ChangeDetails,
}

/// Listener callback.
pub type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

struct Registration {
    callback: Callback,
    scheduler: Arc<dyn Scheduler>,
    last_delivered: Option<u64>,
}

/// Version counter and listener registry of one provider.
///
/// The core is not synchronized itself; every engine keeps it inside the
/// same lock as its model so versions and events stay in step.
pub struct ProviderCore {
    storage_key: String,
    version: Option<u64>,
    listeners: HashMap<EventKind, BTreeMap<ListenerId, Registration>>,
    next_listener: u64,
}

impl ProviderCore {
    /// Creates a core with no version yet.
    pub fn new(storage_key: impl Into<String>) -> Self {
        Self {
            storage_key: storage_key.into(),
            version: None,
            listeners: HashMap::new(),
            next_listener: 0,
        }
    }

    /// Storage key of the provider.
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Current version, `None` before the first change.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Overwrites the version.
    pub fn set_version(&mut self, version: u64) {
        self.version = Some(version);
    }

    /// Advances the version by one (to 0 on the first change).
    pub fn bump(&mut self) -> u64 {
        let next = self.version.map_or(0, |v| v + 1);
        self.version = Some(next);
        next
    }

    /// Advances the version past a remote one: `max(version + 1, remote)`.
    pub fn merge(&mut self, remote: u64) -> u64 {
        let next = self.version.map_or(remote, |v| (v + 1).max(remote));
        self.version = Some(next);
        next
    }

    /// Registers `callback` for `kind`, delivered through `scheduler`.
    pub fn on(
        &mut self,
        kind: EventKind,
        callback: Callback,
        scheduler: Arc<dyn Scheduler>,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.entry(kind).or_default().insert(
            id,
            Registration {
                callback,
                scheduler,
                last_delivered: None,
            },
        );
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn off(&mut self, id: ListenerId) -> bool {
        self.listeners
            .values_mut()
            .any(|registrations| registrations.remove(&id).is_some())
    }

    /// Number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map_or(0, BTreeMap::len)
    }

    /// Hands `event` to the schedulers of its listeners, one batch per
    /// scheduler. Listeners that already saw this version are skipped.
    ///
    /// Returns the number of listeners the event was scheduled for.
    pub fn fire(&mut self, event: ChangeEvent) -> usize {
        let Some(registrations) = self.listeners.get_mut(&event.kind) else {
            return 0;
        };

        let mut groups: Vec<(Arc<dyn Scheduler>, Vec<(ListenerId, Callback)>)> = Vec::new();
        for (id, registration) in registrations.iter_mut() {
            if registration
                .last_delivered
                .is_some_and(|seen| event.version <= seen)
            {
                continue;
            }
            registration.last_delivered = Some(event.version);
            let delivery = (*id, Arc::clone(&registration.callback));
            match groups
                .iter_mut()
                .find(|(s, _)| same_scheduler(s, &registration.scheduler))
            {
                Some((_, deliveries)) => deliveries.push(delivery),
                None => groups.push((Arc::clone(&registration.scheduler), vec![delivery])),
            }
        }

        let mut scheduled = 0;
        for (scheduler, deliveries) in groups {
            scheduled += deliveries.len();
            scheduler.schedule(EventBatch::new(event.clone(), deliveries));
        }
        scheduled
    }
}

fn same_scheduler(a: &Arc<dyn Scheduler>, b: &Arc<dyn Scheduler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::QueueScheduler;
    use parking_lot::Mutex;

    fn change(version: u64) -> ChangeEvent {
        ChangeEvent {
            kind: EventKind::Change,
            version,
            storage_key: "k".into(),
            origin: Origin::Local,
            barrier: None,
            details: ChangeDetails::Variable { data: Value::Null },
        }
    }

    fn recorder() -> (Callback, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (Arc::new(move |e: &ChangeEvent| sink.lock().push(e.version)), seen)
    }

    #[test]
    fn version_rules() {
        let mut core = ProviderCore::new("k");
        assert_eq!(core.version(), None);
        assert_eq!(core.bump(), 0);
        assert_eq!(core.bump(), 1);
        assert_eq!(core.merge(7), 7);
        assert_eq!(core.merge(3), 8);
    }

    #[test]
    fn merge_without_version_adopts_remote() {
        let mut core = ProviderCore::new("k");
        assert_eq!(core.merge(4), 4);
    }

    #[test]
    fn fire_batches_per_scheduler() {
        let mut core = ProviderCore::new("k");
        let first = QueueScheduler::new();
        let second = QueueScheduler::new();
        let (a, _) = recorder();
        let (b, _) = recorder();
        let (c, _) = recorder();
        core.on(EventKind::Change, a, first.clone());
        core.on(EventKind::Change, b, first.clone());
        core.on(EventKind::Change, c, second.clone());

        assert_eq!(core.fire(change(1)), 3);
        assert_eq!(first.pending(), 1);
        assert_eq!(second.pending(), 1);
    }

    #[test]
    fn fire_is_not_synchronous() {
        let mut core = ProviderCore::new("k");
        let queue = QueueScheduler::new();
        let (callback, seen) = recorder();
        core.on(EventKind::Change, callback, queue.clone());

        core.fire(change(1));
        assert!(seen.lock().is_empty());
        queue.drain();
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn stale_versions_are_skipped() {
        let mut core = ProviderCore::new("k");
        let queue = QueueScheduler::new();
        let (callback, seen) = recorder();
        core.on(EventKind::Change, callback, queue.clone());

        core.fire(change(2));
        assert_eq!(core.fire(change(2)), 0);
        assert_eq!(core.fire(change(1)), 0);
        core.fire(change(3));
        queue.drain();
        assert_eq!(*seen.lock(), vec![2, 3]);
    }

    #[test]
    fn kinds_are_independent() {
        let mut core = ProviderCore::new("k");
        let queue = QueueScheduler::new();
        let (callback, seen) = recorder();
        core.on(EventKind::Synced, callback, queue.clone());

        core.fire(change(1));
        queue.drain();
        assert!(seen.lock().is_empty());
        assert_eq!(core.listener_count(EventKind::Synced), 1);
        assert_eq!(core.listener_count(EventKind::Change), 0);
    }

    #[test]
    fn off_removes_listener() {
        let mut core = ProviderCore::new("k");
        let queue = QueueScheduler::new();
        let (callback, seen) = recorder();
        let id = core.on(EventKind::Change, callback, queue.clone());

        assert!(core.off(id));
        assert!(!core.off(id));
        core.fire(change(1));
        queue.drain();
        assert!(seen.lock().is_empty());
    }
}
