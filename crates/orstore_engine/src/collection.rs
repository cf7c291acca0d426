//! OR-Set collection synchronization.
//!
//! Local writes apply to the model and fire events immediately, then queue
//! their key deltas in a pending-changes map. A single persistence drain per
//! engine moves those deltas into the backend document, one transaction per
//! round. Remote documents arrive on the listener task, are diffed against
//! the previous document and folded into the model, with this replica's own
//! committed keys filtered out until the backend version passes their
//! barrier.

use crate::backing::{BackingLink, BackingWrite};
use crate::config::PersistConfig;
use crate::error::{EngineError, EngineResult};
use crate::feed::{BoxFuture, RemoteFeed};
use crate::gate::PersistGate;
use crate::provider::{
    Callback, ChangeDetails, ChangeEvent, EventKind, ItemChange, ListenerId, Origin, ProviderCore,
};
use crate::scheduler::Scheduler;
use orstore_backend::{Backend, Document, DocumentItem};
use orstore_codec::Value;
use orstore_crdt::{diff_keys, CollectionModel, CrdtError, KeyDiff, ProviderLiteral};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::watch;

/// Suppression barrier while the transaction that writes the keys is in
/// flight.
const OPEN_BARRIER: u64 = u64::MAX;

/// Keys of one id not yet committed to the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingDelta {
    /// Keys added locally.
    pub add: BTreeSet<String>,
    /// Keys removed locally. Disjoint from `add`: the later call wins.
    pub remove: BTreeSet<String>,
}

impl PendingDelta {
    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    fn effective_adds(&self) -> BTreeSet<String> {
        self.add.difference(&self.remove).cloned().collect()
    }

    fn record_add(&mut self, keys: &[String]) {
        for key in keys {
            self.remove.remove(key);
            self.add.insert(key.clone());
        }
    }

    fn record_remove(&mut self, keys: &[String]) {
        for key in keys {
            self.add.remove(key);
            self.remove.insert(key.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Suppression {
    keys: BTreeSet<String>,
    barrier: u64,
}

struct CollectionState {
    core: ProviderCore,
    model: CollectionModel,
    /// Payloads of pointer entries, by id. Only used in reference mode.
    payloads: HashMap<String, Value>,
    local_changes: BTreeMap<String, PendingDelta>,
    /// Payloads staged for the backing store, flushed before the next
    /// commit.
    backing_writes: Vec<BackingWrite>,
    suppressions: BTreeMap<String, Suppression>,
    baseline: Document,
    reference_mode: bool,
    initialized: bool,
    fault: Option<EngineError>,
    disposed: bool,
}

impl CollectionState {
    fn check(&self) -> EngineResult<()> {
        if self.disposed {
            return Err(EngineError::Disposed {
                storage_key: self.core.storage_key().to_string(),
            });
        }
        match &self.fault {
            Some(fault) => Err(EngineError::Faulted {
                storage_key: self.core.storage_key().to_string(),
                reason: fault.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Value visible to callers: the cached payload in reference mode,
    /// otherwise the stored value.
    fn visible(&self, id: &str) -> Option<Value> {
        if self.reference_mode {
            if let Some(payload) = self.payloads.get(id) {
                return Some(payload.clone());
            }
        }
        self.model.value(id).cloned()
    }

    /// Rejects an add that would change a stored value without a new key.
    fn check_add(&self, id: &str, value: &Value, keys: &[String]) -> EngineResult<()> {
        let Some(entry) = self.model.entry(id) else {
            return Ok(());
        };
        let current = if self.reference_mode {
            self.payloads.get(id)
        } else {
            Some(&entry.value)
        };
        let changed = current.is_some_and(|c| c != value);
        if changed && keys.iter().all(|k| entry.keys.contains(k)) {
            return Err(CrdtError::ValueChangeWithoutNewKeys { id: id.to_string() }.into());
        }
        Ok(())
    }

    /// Applies a validated local add. `stored` is what goes into the model
    /// (a pointer in reference mode), `value` is the payload.
    fn apply_add(
        &mut self,
        id: &str,
        stored: Value,
        value: &Value,
        keys: &[String],
    ) -> EngineResult<ItemChange> {
        let mut effective = self.model.add(id, stored, keys.iter().cloned())?;
        if self.reference_mode {
            let previous = self.payloads.insert(id.to_string(), value.clone());
            effective |= previous.as_ref() != Some(value);
        }
        self.local_changes
            .entry(id.to_string())
            .or_default()
            .record_add(keys);
        Ok(ItemChange {
            id: id.to_string(),
            value: value.clone(),
            keys: keys.to_vec(),
            effective,
        })
    }

    /// Applies a local remove. An empty `keys` removes every current key.
    fn apply_remove(&mut self, id: &str, keys: Vec<String>) -> Option<ItemChange> {
        if !self.model.has(id) {
            return None;
        }
        let keys = if keys.is_empty() {
            self.model.keys(id)
        } else {
            keys
        };
        let value = self.visible(id).unwrap_or(Value::Null);
        let effective = self.model.remove(id, keys.iter());
        if effective {
            self.payloads.remove(id);
        }
        self.local_changes
            .entry(id.to_string())
            .or_default()
            .record_remove(&keys);
        Some(ItemChange {
            id: id.to_string(),
            value,
            keys,
            effective,
        })
    }

    /// Whether this replica added `key` to `id` after the remote document
    /// at `version` was written.
    fn holds_newer_add(&self, id: &str, key: &str, version: u64) -> bool {
        self.local_changes
            .get(id)
            .is_some_and(|delta| delta.add.contains(key))
            || self
                .suppressions
                .get(id)
                .is_some_and(|s| s.barrier > version && s.keys.contains(key))
    }

    fn announce(
        &mut self,
        version: u64,
        origin: Origin,
        add: Vec<ItemChange>,
        remove: Vec<ItemChange>,
    ) {
        let event = ChangeEvent {
            kind: EventKind::Change,
            version,
            storage_key: self.core.storage_key().to_string(),
            origin,
            barrier: None,
            details: ChangeDetails::Collection { add, remove },
        };
        self.core.fire(event);
    }
}

/// One persistence round: the deltas being committed and what is needed to
/// write them.
struct Round {
    version: u64,
    reference_mode: bool,
    committing: BTreeMap<String, PendingDelta>,
    values: HashMap<String, Value>,
    /// Backing payloads the committed pointers refer to.
    writes: Vec<BackingWrite>,
    /// Suppression entries as they were before this round registered its
    /// keys, for rollback.
    previous: HashMap<String, Option<Suppression>>,
}

impl Round {
    fn apply_to(&self, current: Option<&Document>) -> Document {
        let mut doc = current
            .cloned()
            .unwrap_or_else(|| Document::new(self.reference_mode));
        doc.version = current.map_or(self.version, |c| (c.version + 1).max(self.version));
        doc.reference_mode = self.reference_mode;

        for (id, delta) in &self.committing {
            let adds = delta.effective_adds();
            if !adds.is_empty() {
                if let Some(value) = self.values.get(id) {
                    let item = doc
                        .items
                        .entry(id.clone())
                        .or_insert_with(|| DocumentItem::new(value.clone(), Vec::<String>::new()));
                    item.value = value.clone();
                    item.keys.extend(adds);
                }
            }
            let emptied = match doc.items.get_mut(id) {
                Some(item) => {
                    for key in &delta.remove {
                        item.keys.remove(key);
                    }
                    item.keys.is_empty()
                }
                None => false,
            };
            if emptied {
                doc.items.remove(id);
            }
        }
        doc
    }
}

/// A synchronized OR-Set collection.
pub struct CollectionEngine {
    storage_key: String,
    backend: Arc<dyn Backend>,
    persist: PersistConfig,
    link: Option<BackingLink>,
    state: Mutex<CollectionState>,
    ready: watch::Sender<bool>,
    gate: PersistGate,
    feed: Mutex<Option<RemoteFeed>>,
}

impl CollectionEngine {
    /// Creates an engine for `storage_key` and subscribes it to the
    /// backend.
    ///
    /// `reference_mode` applies to a document that does not exist yet; an
    /// existing document keeps the mode it records. `link` is required to
    /// store or read values in reference mode.
    pub fn attach(
        storage_key: impl Into<String>,
        backend: Arc<dyn Backend>,
        persist: PersistConfig,
        reference_mode: bool,
        link: Option<BackingLink>,
    ) -> EngineResult<Arc<Self>> {
        let storage_key = storage_key.into();
        let (ready, _) = watch::channel(false);
        let engine = Arc::new(Self {
            storage_key: storage_key.clone(),
            backend,
            persist,
            link,
            state: Mutex::new(CollectionState {
                core: ProviderCore::new(storage_key.clone()),
                model: CollectionModel::new(),
                payloads: HashMap::new(),
                local_changes: BTreeMap::new(),
                backing_writes: Vec::new(),
                suppressions: BTreeMap::new(),
                baseline: Document::default(),
                reference_mode,
                initialized: false,
                fault: None,
                disposed: false,
            }),
            ready,
            gate: PersistGate::new(),
            feed: Mutex::new(None),
        });

        let feed = RemoteFeed::attach(
            &engine.backend,
            &storage_key,
            Arc::downgrade(&engine),
            |engine: Arc<Self>, doc: Document| -> BoxFuture<'static, ()> {
                Box::pin(async move { engine.on_remote_state_changed(doc).await })
            },
        )?;
        *engine.feed.lock() = Some(feed);
        tracing::debug!(storage_key = %storage_key, reference_mode, "collection attached");
        Ok(engine)
    }

    /// Storage key of the collection document.
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Current version, `None` before initialization.
    pub fn version(&self) -> Option<u64> {
        self.state.lock().core.version()
    }

    /// Whether values are stored as pointers.
    pub fn reference_mode(&self) -> bool {
        self.state.lock().reference_mode
    }

    /// Whether local changes are waiting to be committed.
    pub fn has_local_changes(&self) -> bool {
        !self.state.lock().local_changes.is_empty()
    }

    /// Snapshot of the uncommitted deltas.
    pub fn local_changes(&self) -> BTreeMap<String, PendingDelta> {
        self.state.lock().local_changes.clone()
    }

    /// The failure that faulted this engine, if any.
    pub fn fault(&self) -> Option<EngineError> {
        self.state.lock().fault.clone()
    }

    /// Registers a listener.
    pub fn on(
        &self,
        kind: EventKind,
        callback: Callback,
        scheduler: Arc<dyn Scheduler>,
    ) -> ListenerId {
        self.state.lock().core.on(kind, callback, scheduler)
    }

    /// Removes a listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.state.lock().core.off(id)
    }

    /// Waits until the first backend document has been applied.
    pub async fn wait_ready(&self) -> EngineResult<()> {
        self.state.lock().check()?;
        let mut ready = self.ready.subscribe();
        if ready.wait_for(|ready| *ready).await.is_err() {
            return Err(self.disposed());
        }
        self.state.lock().check()
    }

    /// Adds `value` with membership `keys`.
    ///
    /// The change is visible and announced before it is persisted; the
    /// returned future resolves once the persistence drain finishes. On
    /// failure the delta stays queued for a later call.
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
        self.wait_ready().await?;

        {
            let mut state = self.state.lock();
            state.check()?;
            state.check_add(&id, &value, &keys)?;
            let (stored, write) = self.stage(&state, &value)?;
            let change = state.apply_add(&id, stored, &value, &keys)?;
            state.backing_writes.extend(write);
            let version = state.core.bump();
            state.announce(version, Origin::Local, vec![change], Vec::new());
        }
        self.persist().await
    }

    /// Adds every value in `values` with the same membership `keys`.
    pub async fn store_multiple<K>(&self, values: Vec<Value>, keys: K) -> EngineResult<()>
    where
        K: IntoIterator,
        K::Item: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        let mut ids = BTreeSet::new();
        for value in &values {
            let id = value.id().ok_or(EngineError::MissingId)?;
            if keys.is_empty() {
                return Err(CrdtError::EmptyKeys { id: id.to_string() }.into());
            }
            if !ids.insert(id.to_string()) {
                return Err(EngineError::invalid_operation(format!(
                    "duplicate id {id} in one batch"
                )));
            }
        }
        if values.is_empty() {
            return Ok(());
        }
        self.wait_ready().await?;

        {
            let mut state = self.state.lock();
            state.check()?;
            let mut prepared = Vec::with_capacity(values.len());
            for value in values {
                let id = value.id().ok_or(EngineError::MissingId)?.to_string();
                state.check_add(&id, &value, &keys)?;
                let (stored, write) = self.stage(&state, &value)?;
                prepared.push((id, stored, value, write));
            }
            let mut changes = Vec::with_capacity(prepared.len());
            for (id, stored, value, write) in prepared {
                changes.push(state.apply_add(&id, stored, &value, &keys)?);
                state.backing_writes.extend(write);
            }
            let version = state.core.bump();
            state.announce(version, Origin::Local, changes, Vec::new());
        }
        self.persist().await
    }

    /// Removes membership `keys` from `id`; empty `keys` removes the entry.
    /// Unknown ids are ignored.
    pub async fn remove<K>(&self, id: &str, keys: K) -> EngineResult<()>
    where
        K: IntoIterator,
        K::Item: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        self.wait_ready().await?;
        {
            let mut state = self.state.lock();
            state.check()?;
            let Some(change) = state.apply_remove(id, keys) else {
                return Ok(());
            };
            let version = state.core.bump();
            state.announce(version, Origin::Local, Vec::new(), vec![change]);
        }
        self.persist().await
    }

    /// Removes several entries at once. An empty list removes everything.
    pub async fn remove_multiple(&self, items: Vec<(String, Vec<String>)>) -> EngineResult<()> {
        self.wait_ready().await?;
        {
            let mut state = self.state.lock();
            state.check()?;
            let items = if items.is_empty() {
                state
                    .model
                    .ids()
                    .map(|id| (id.to_string(), Vec::new()))
                    .collect()
            } else {
                items
            };
            let changes: Vec<ItemChange> = items
                .into_iter()
                .filter_map(|(id, keys)| state.apply_remove(&id, keys))
                .collect();
            if changes.is_empty() {
                return Ok(());
            }
            let version = state.core.bump();
            state.announce(version, Origin::Local, Vec::new(), changes);
        }
        self.persist().await
    }

    /// Removes every entry.
    pub async fn clear(&self) -> EngineResult<()> {
        self.remove_multiple(Vec::new()).await
    }

    /// Returns the value stored under `id`.
    pub async fn get(&self, id: &str) -> EngineResult<Option<Value>> {
        self.wait_ready().await?;
        let (stored, cached) = {
            let state = self.state.lock();
            let stored = state.model.value(id).cloned();
            let cached = state
                .reference_mode
                .then(|| state.payloads.get(id).cloned())
                .flatten();
            (stored, cached)
        };
        match (stored, cached) {
            (None, _) => Ok(None),
            (Some(_), Some(payload)) => Ok(Some(payload)),
            (Some(stored), None) => self.dereference(&stored).await.map(Some),
        }
    }

    /// Returns the values of `ids`, `None` where absent.
    pub async fn get_multiple<I>(&self, ids: I) -> EngineResult<Vec<Option<Value>>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut values = Vec::new();
        for id in ids {
            values.push(self.get(id.as_ref()).await?);
        }
        Ok(values)
    }

    /// Returns every value, ordered by id.
    pub async fn to_list(&self) -> EngineResult<Vec<Value>> {
        self.wait_ready().await?;
        let entries: Vec<(Value, Option<Value>)> = {
            let state = self.state.lock();
            state
                .model
                .ids()
                .filter_map(|id| {
                    let stored = state.model.value(id)?.clone();
                    let cached = state
                        .reference_mode
                        .then(|| state.payloads.get(id).cloned())
                        .flatten();
                    Some((stored, cached))
                })
                .collect()
        };
        let mut values = Vec::with_capacity(entries.len());
        for (stored, cached) in entries {
            match cached {
                Some(payload) => values.push(payload),
                None => values.push(self.dereference(&stored).await?),
            }
        }
        Ok(values)
    }

    /// Serializes the model as stored (pointers in reference mode).
    pub fn to_literal(&self) -> ProviderLiteral {
        let state = self.state.lock();
        ProviderLiteral::new(state.core.version().unwrap_or(0), state.model.to_literal())
    }

    /// Replaces the model with `literal` and persists every entry as a
    /// local add. No events are fired.
    pub async fn from_literal(&self, literal: ProviderLiteral) -> EngineResult<()> {
        let model = CollectionModel::from_literal(literal.model)?;
        self.wait_ready().await?;
        {
            let mut state = self.state.lock();
            state.check()?;
            for id in model.ids() {
                state
                    .local_changes
                    .entry(id.to_string())
                    .or_default()
                    .add
                    .extend(model.keys(id));
            }
            state.model = model;
            state.payloads.clear();
            let version = state
                .core
                .version()
                .map_or(literal.version, |v| v.max(literal.version));
            state.core.set_version(version);
        }
        self.persist().await
    }

    /// Detaches from the backend. Later calls fail with
    /// [`EngineError::Disposed`].
    pub fn dispose(&self) {
        self.state.lock().disposed = true;
        drop(self.feed.lock().take());
        self.gate.wake();
        self.ready.send_replace(true);
        tracing::debug!(storage_key = %self.storage_key, "collection disposed");
    }

    pub(crate) fn store_boxed(
        &self,
        value: Value,
        keys: Vec<String>,
    ) -> BoxFuture<'_, EngineResult<()>> {
        Box::pin(self.store(value, keys))
    }

    pub(crate) fn get_boxed(&self, id: String) -> BoxFuture<'_, EngineResult<Option<Value>>> {
        Box::pin(async move { self.get(&id).await })
    }

    fn disposed(&self) -> EngineError {
        EngineError::Disposed {
            storage_key: self.storage_key.clone(),
        }
    }

    fn require_link(&self) -> EngineResult<&BackingLink> {
        self.link.as_ref().ok_or_else(|| {
            EngineError::invalid_operation(format!(
                "{} is in reference mode but has no backing store",
                self.storage_key
            ))
        })
    }

    /// Returns the value to keep in the model and, in reference mode, the
    /// payload to stage for the backing store.
    fn stage(
        &self,
        state: &CollectionState,
        value: &Value,
    ) -> EngineResult<(Value, Option<BackingWrite>)> {
        if !state.reference_mode {
            return Ok((value.clone(), None));
        }
        let (pointer, write) = self.require_link()?.stage(&self.storage_key, value.clone())?;
        Ok((pointer, Some(write)))
    }

    /// Writes the backing payloads of `round`. Unwritten payloads go back
    /// to the front of the queue on failure.
    async fn flush_backing(&self, round: &mut Round) -> EngineResult<()> {
        if round.writes.is_empty() {
            return Ok(());
        }
        let writes = std::mem::take(&mut round.writes);
        let link = match self.require_link() {
            Ok(link) => link,
            Err(e) => {
                self.requeue(writes);
                return Err(e);
            }
        };
        match link.flush_all(writes).await {
            Ok(()) => Ok(()),
            Err((e, rest)) => {
                self.requeue(rest);
                Err(e)
            }
        }
    }

    fn requeue(&self, mut writes: Vec<BackingWrite>) {
        let mut state = self.state.lock();
        writes.append(&mut state.backing_writes);
        state.backing_writes = writes;
    }

    async fn dereference(&self, stored: &Value) -> EngineResult<Value> {
        if !self.state.lock().reference_mode {
            return Ok(stored.clone());
        }
        self.require_link()?.dereference(stored).await
    }

    /// Drives the persistence drain until no local changes remain.
    async fn persist(&self) -> EngineResult<()> {
        let pass = self
            .gate
            .enter(|| {
                let state = self.state.lock();
                state.check()?;
                Ok::<_, EngineError>(!state.local_changes.is_empty())
            })
            .await?;
        let Some(_pass) = pass else {
            return Ok(());
        };

        let rounds = self.persist.rounds();
        for round in 0..rounds {
            if round > 0 {
                if let Some(backoff) = self.persist.round_backoff {
                    tokio::time::sleep(backoff).await;
                }
            }
            let Some(mut batch) = self.begin_round()? else {
                return Ok(());
            };
            tracing::debug!(
                storage_key = %self.storage_key,
                round,
                version = batch.version,
                ids = batch.committing.len(),
                "persisting local changes"
            );

            if let Err(e) = self.flush_backing(&mut batch).await {
                tracing::warn!(storage_key = %self.storage_key, round, error = %e, "backing store write failed");
                self.abort_round(batch);
                return Err(e);
            }

            let mut mutate = |current: Option<&Document>| Some(batch.apply_to(current));
            let committed = match self.backend.transaction(&self.storage_key, &mut mutate).await {
                Ok(tx) if tx.committed => tx.document.ok_or_else(|| self.uncommitted()),
                Ok(_) => Err(self.uncommitted()),
                Err(e) => Err(e.into()),
            };
            match committed {
                Ok(doc) => self.finish_round(&batch, &doc)?,
                Err(e) => {
                    tracing::warn!(storage_key = %self.storage_key, round, error = %e, "persistence failed");
                    self.abort_round(batch);
                    return Err(e);
                }
            }
        }

        if self.state.lock().local_changes.is_empty() {
            Ok(())
        } else {
            tracing::warn!(storage_key = %self.storage_key, rounds, "persistence did not settle");
            Err(EngineError::PersistenceStalled {
                storage_key: self.storage_key.clone(),
                rounds,
            })
        }
    }

    fn uncommitted(&self) -> EngineError {
        EngineError::Uncommitted {
            storage_key: self.storage_key.clone(),
        }
    }

    /// Snapshots the pending deltas and registers their keys for echo
    /// suppression before the transaction is issued.
    fn begin_round(&self) -> EngineResult<Option<Round>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check()?;
        if state.local_changes.is_empty() {
            return Ok(None);
        }

        let committing = state.local_changes.clone();
        let mut values = HashMap::new();
        let mut previous = HashMap::new();
        for (id, delta) in &committing {
            let adds = delta.effective_adds();
            if adds.is_empty() {
                continue;
            }
            if let Some(value) = state.model.value(id) {
                values.insert(id.clone(), value.clone());
            }
            previous.insert(id.clone(), state.suppressions.get(id).cloned());
            let entry = state
                .suppressions
                .entry(id.clone())
                .or_insert_with(|| Suppression {
                    keys: BTreeSet::new(),
                    barrier: OPEN_BARRIER,
                });
            entry.keys.extend(adds);
            entry.barrier = OPEN_BARRIER;
        }

        Ok(Some(Round {
            version: state.core.version().unwrap_or(0),
            reference_mode: state.reference_mode,
            committing,
            values,
            writes: std::mem::take(&mut state.backing_writes),
            previous,
        }))
    }

    /// Drops the committed sub-deltas and closes the suppression barriers
    /// at the committed version.
    ///
    /// A committed id missing from the pending changes faults the engine.
    fn finish_round(&self, round: &Round, doc: &Document) -> EngineResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for (id, delta) in &round.committing {
            let drained = match state.local_changes.get_mut(id) {
                Some(pending) => {
                    pending.add.retain(|k| !delta.add.contains(k));
                    pending.remove.retain(|k| !delta.remove.contains(k));
                    pending.is_empty()
                }
                None => {
                    let e = self.violation(format!(
                        "committed id {id} is missing from local changes"
                    ));
                    tracing::error!(storage_key = %self.storage_key, error = %e, "collection faulted");
                    state.fault = Some(e.clone());
                    return Err(e);
                }
            };
            if drained {
                state.local_changes.remove(id);
            }
        }

        let seen = state.baseline.version;
        for id in round.previous.keys() {
            let expired = match state.suppressions.get_mut(id) {
                Some(suppression) => {
                    suppression.barrier = doc.version;
                    doc.version <= seen
                }
                None => false,
            };
            if expired {
                state.suppressions.remove(id);
            }
        }
        tracing::debug!(
            storage_key = %self.storage_key,
            version = doc.version,
            remaining = state.local_changes.len(),
            "committed local changes"
        );

        if state.local_changes.is_empty() {
            let event = ChangeEvent {
                kind: EventKind::Synced,
                version: state.core.version().unwrap_or(0),
                storage_key: self.storage_key.clone(),
                origin: Origin::Local,
                barrier: None,
                details: ChangeDetails::Synced,
            };
            state.core.fire(event);
        }
        Ok(())
    }

    /// Restores the suppression entries a failed round registered.
    fn abort_round(&self, round: Round) {
        let mut state = self.state.lock();
        for (id, previous) in round.previous {
            match previous {
                Some(suppression) => {
                    state.suppressions.insert(id, suppression);
                }
                None => {
                    state.suppressions.remove(&id);
                }
            }
        }
    }

    /// Applies a backend document delivered by the subscription.
    pub(crate) async fn on_remote_state_changed(&self, doc: Document) {
        let resolved = if doc.reference_mode {
            self.resolve_payloads(&doc).await
        } else {
            HashMap::new()
        };

        let first = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.disposed || state.fault.is_some() {
                return;
            }
            if let Err(e) = self.apply_remote(state, doc, resolved) {
                tracing::error!(storage_key = %self.storage_key, error = %e, "collection faulted");
                state.fault = Some(e);
            }
            let first = !state.initialized;
            state.initialized = true;
            first
        };
        if first {
            self.ready.send_replace(true);
        }
    }

    /// Fetches payloads for pointer items that are new in `doc`.
    async fn resolve_payloads(&self, doc: &Document) -> HashMap<String, Value> {
        let wanted: Vec<(String, Value)> = {
            let state = self.state.lock();
            doc.items
                .iter()
                .filter(|(id, item)| {
                    let grew = state
                        .baseline
                        .item(id)
                        .map_or(true, |old| !item.keys.is_subset(&old.keys));
                    grew && !state.local_changes.contains_key(id.as_str())
                })
                .map(|(id, item)| (id.clone(), item.value.clone()))
                .collect()
        };
        if wanted.is_empty() {
            return HashMap::new();
        }
        let Some(link) = self.link.as_ref() else {
            tracing::warn!(storage_key = %self.storage_key, "pointer document without a backing store");
            return HashMap::new();
        };

        let mut resolved = HashMap::new();
        for (id, pointer) in wanted {
            match link.dereference(&pointer).await {
                Ok(value) => {
                    resolved.insert(id, value);
                }
                Err(e) => {
                    tracing::warn!(storage_key = %self.storage_key, id = %id, error = %e, "could not resolve pointer");
                }
            }
        }
        resolved
    }

    fn apply_remote(
        &self,
        state: &mut CollectionState,
        doc: Document,
        resolved: HashMap<String, Value>,
    ) -> EngineResult<()> {
        if !state.initialized && (doc.reference_mode || doc.version > 0 || !doc.items.is_empty()) {
            state.reference_mode = doc.reference_mode;
        }

        let previous = std::mem::take(&mut state.baseline);
        let empty = BTreeSet::new();
        let ids: BTreeSet<&String> = previous.items.keys().chain(doc.items.keys()).collect();
        let mut adds = Vec::new();
        let mut removes = Vec::new();

        for id in ids {
            let old = previous.item(id).map_or(&empty, |item| &item.keys);
            let item = doc.item(id);
            let new = item.map_or(&empty, |item| &item.keys);
            let KeyDiff { added, removed } = diff_keys(old, new);
            let added: Vec<String> = match state.suppressions.get(id.as_str()) {
                Some(suppression) => added
                    .into_iter()
                    .filter(|k| !suppression.keys.contains(k))
                    .collect(),
                None => added,
            };

            if let (Some(item), false) = (item, added.is_empty()) {
                let local_pending = state.model.has(id)
                    && state
                        .local_changes
                        .get(id.as_str())
                        .is_some_and(|delta| !delta.add.is_empty());
                let stored = match state.model.value(id) {
                    Some(value) if local_pending => value.clone(),
                    _ => item.value.clone(),
                };
                let mut effective = state
                    .model
                    .add(id, stored.clone(), added.iter().cloned())
                    .map_err(|e| self.violation(format!("remote add rejected: {e}")))?;
                if !local_pending {
                    if let Some(payload) = resolved.get(id.as_str()) {
                        let previous = state.payloads.insert(id.clone(), payload.clone());
                        effective |= previous.as_ref() != Some(payload);
                    }
                }
                if effective {
                    adds.push(ItemChange {
                        id: id.clone(),
                        value: state.visible(id).unwrap_or(stored),
                        keys: added,
                        effective,
                    });
                }
            }

            let removed: Vec<String> = removed
                .into_iter()
                .filter(|k| !state.holds_newer_add(id, k, doc.version))
                .collect();
            if !removed.is_empty() {
                let value = state.visible(id).unwrap_or(Value::Null);
                if state.model.remove(id, removed.iter()) {
                    state.payloads.remove(id.as_str());
                    removes.push(ItemChange {
                        id: id.clone(),
                        value,
                        keys: removed.into_iter().collect(),
                        effective: true,
                    });
                }
            }
        }

        let storage_key = &self.storage_key;
        state.suppressions.retain(|id, suppression| {
            let keep = suppression.barrier > doc.version;
            if !keep {
                tracing::debug!(storage_key = %storage_key, id = %id, barrier = suppression.barrier, "suppression expired");
            }
            keep
        });

        let changed = !(adds.is_empty() && removes.is_empty());
        tracing::debug!(
            storage_key = %self.storage_key,
            remote_version = doc.version,
            added = adds.len(),
            removed = removes.len(),
            "applied remote document"
        );
        let version = state.core.merge(doc.version);
        if changed {
            state.announce(version, Origin::Remote, adds, removes);
        }
        state.baseline = doc;
        Ok(())
    }

    fn violation(&self, message: String) -> EngineError {
        EngineError::ProtocolViolation {
            storage_key: self.storage_key.clone(),
            message,
        }
    }
}
