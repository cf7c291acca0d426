//! Last-writer-wins variables.

use crate::backing::{parse_pointer, BackingLink, BackingWrite};
use crate::config::PersistConfig;
use crate::error::{EngineError, EngineResult};
use crate::feed::{BoxFuture, RemoteFeed};
use crate::gate::PersistGate;
use crate::provider::{
    Callback, ChangeDetails, ChangeEvent, EventKind, ListenerId, Origin, ProviderCore,
};
use crate::scheduler::Scheduler;
use orstore_backend::{Backend, Document};
use orstore_codec::Value;
use orstore_crdt::{ProviderLiteral, SerializedEntry};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

struct VariableState {
    core: ProviderCore,
    /// Value as it appears in the document (a pointer in reference mode).
    stored: Option<Value>,
    /// Payload behind `stored` when it is a pointer, once known.
    payload: Option<Value>,
    reference_mode: bool,
    live: bool,
    local_modified: bool,
    /// Payload staged for the backing store, flushed before the next commit.
    backing_write: Option<BackingWrite>,
    /// Newest remote document that arrived while a local write was pending.
    deferred: Option<Document>,
    /// Version of the last document this replica committed.
    last_commit: Option<u64>,
    fault: Option<EngineError>,
    disposed: bool,
}

impl VariableState {
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

    fn current(&self) -> Option<&Value> {
        match self.stored.as_ref() {
            Some(stored) if parse_pointer(stored).is_some() => self.payload.as_ref(),
            other => other,
        }
    }

    fn announce(&mut self, version: u64, origin: Origin, barrier: Option<String>, data: Value) {
        let event = ChangeEvent {
            kind: EventKind::Change,
            version,
            storage_key: self.core.storage_key().to_string(),
            origin,
            barrier,
            details: ChangeDetails::Variable { data },
        };
        self.core.fire(event);
    }

    /// Returns true if a remote document would be adopted.
    fn accepts(&self, doc: &Document) -> bool {
        !self.live || !self.last_commit.is_some_and(|c| doc.version <= c)
    }

    /// Keeps `doc` for replay once the pending write lands.
    fn defer(&mut self, doc: Document) {
        if self.deferred.as_ref().map_or(true, |d| doc.version > d.version) {
            self.deferred = Some(doc);
        }
    }
}

/// A synchronized single value.
///
/// Writes are visible locally at once and committed in the background of
/// the calling future. While a local write is uncommitted, remote documents
/// are held back; once it lands, the committed document is adopted, its
/// echo is recognized by version, and a newer held-back document is
/// applied. `Value::Null` is stored as no value.
pub struct VariableEngine {
    storage_key: String,
    backend: Arc<dyn Backend>,
    persist: PersistConfig,
    link: Option<BackingLink>,
    state: Mutex<VariableState>,
    live: watch::Sender<bool>,
    gate: PersistGate,
    feed: Mutex<Option<RemoteFeed>>,
}

impl VariableEngine {
    /// Creates a variable for `storage_key` and subscribes it to the
    /// backend.
    pub fn attach(
        storage_key: impl Into<String>,
        backend: Arc<dyn Backend>,
        persist: PersistConfig,
        reference_mode: bool,
        link: Option<BackingLink>,
    ) -> EngineResult<Arc<Self>> {
        let storage_key = storage_key.into();
        let (live, _) = watch::channel(false);
        let engine = Arc::new(Self {
            storage_key: storage_key.clone(),
            backend,
            persist,
            link,
            state: Mutex::new(VariableState {
                core: ProviderCore::new(storage_key.clone()),
                stored: None,
                payload: None,
                reference_mode,
                live: false,
                local_modified: false,
                backing_write: None,
                deferred: None,
                last_commit: None,
                fault: None,
                disposed: false,
            }),
            live,
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
        Ok(engine)
    }

    /// Storage key of the variable document.
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Current version, `None` until the first value.
    pub fn version(&self) -> Option<u64> {
        self.state.lock().core.version()
    }

    /// Whether the value is stored as a pointer.
    pub fn reference_mode(&self) -> bool {
        self.state.lock().reference_mode
    }

    /// Whether the variable has been initialized.
    pub fn is_live(&self) -> bool {
        self.state.lock().live
    }

    /// Whether a local write is waiting to be committed.
    pub fn has_local_changes(&self) -> bool {
        self.state.lock().local_modified
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

    /// Writes `value`.
    pub async fn set(&self, value: Value) -> EngineResult<()> {
        self.set_with_barrier(value, None).await
    }

    /// Writes `value`, tagging the change event with `barrier`.
    ///
    /// Writing the current value again is a no-op unless a barrier is
    /// given. The returned future resolves once the value is committed.
    pub async fn set_with_barrier(&self, value: Value, barrier: Option<String>) -> EngineResult<()> {
        let became_live = {
            let mut state = self.state.lock();
            state.check()?;
            let next = (!value.is_null()).then(|| value.clone());
            if state.core.version().is_some()
                && barrier.is_none()
                && state.current() == next.as_ref()
            {
                return Ok(());
            }
            let (stored, write) = match next {
                Some(next) if state.reference_mode => {
                    let (pointer, write) = self.require_link()?.stage(&self.storage_key, next)?;
                    (Some(pointer), Some(write))
                }
                other => (other, None),
            };

            let version = state.core.bump();
            state.payload = write.as_ref().map(|w| w.value.clone());
            state.stored = stored;
            state.backing_write = write;
            state.local_modified = true;
            let became_live = !state.live;
            state.live = true;
            state.announce(version, Origin::Local, barrier, value);
            became_live
        };
        if became_live {
            self.live.send_replace(true);
        }
        self.persist().await
    }

    /// Writes `Value::Null`, leaving the variable without a value.
    pub async fn clear(&self) -> EngineResult<()> {
        self.set(Value::Null).await
    }

    /// Waits for initialization and returns the current value.
    pub async fn fetch(&self) -> EngineResult<Option<Value>> {
        self.wait_live().await?;
        let (stored, payload) = {
            let state = self.state.lock();
            state.check()?;
            (state.stored.clone(), state.payload.clone())
        };
        match (stored, payload) {
            (None, _) => Ok(None),
            (Some(_), Some(payload)) => Ok(Some(payload)),
            (Some(stored), None) => match (&self.link, parse_pointer(&stored)) {
                (Some(link), Some(_)) => link.dereference(&stored).await.map(Some),
                _ => Ok(Some(stored)),
            },
        }
    }

    /// Same as [`fetch`](Self::fetch).
    pub async fn get(&self) -> EngineResult<Option<Value>> {
        self.fetch().await
    }

    /// Serializes the variable as zero or one entry.
    pub fn to_literal(&self) -> ProviderLiteral {
        let state = self.state.lock();
        let model = state
            .stored
            .as_ref()
            .map(|value| {
                let id = value.id().unwrap_or(&self.storage_key).to_string();
                vec![SerializedEntry::new(id, value.clone(), Vec::<String>::new())]
            })
            .unwrap_or_default();
        ProviderLiteral::new(state.core.version().unwrap_or(0), model)
    }

    /// Replaces the value with the single entry of `literal`, or with no
    /// value if it is empty, and persists it. No events are fired.
    ///
    /// The version becomes the larger of the current and the literal
    /// version.
    pub async fn from_literal(&self, literal: ProviderLiteral) -> EngineResult<()> {
        let ProviderLiteral { version, model } = literal;
        if model.len() > 1 {
            return Err(EngineError::invalid_operation(format!(
                "a variable literal holds at most one entry, got {}",
                model.len()
            )));
        }
        let value = model
            .into_iter()
            .next()
            .map(|entry| entry.value)
            .filter(|value| !value.is_null());

        let became_live = {
            let mut state = self.state.lock();
            state.check()?;
            let (stored, write) = match value {
                Some(value) if state.reference_mode && parse_pointer(&value).is_none() => {
                    let (pointer, write) = self.require_link()?.stage(&self.storage_key, value)?;
                    (Some(pointer), Some(write))
                }
                other => (other, None),
            };
            state.payload = write.as_ref().map(|w| w.value.clone());
            state.stored = stored;
            state.backing_write = write;
            let version = state.core.version().map_or(version, |v| v.max(version));
            state.core.set_version(version);
            state.local_modified = true;
            let became_live = !state.live;
            state.live = true;
            became_live
        };
        if became_live {
            self.live.send_replace(true);
        }
        self.persist().await
    }

    /// Detaches from the backend.
    pub fn dispose(&self) {
        self.state.lock().disposed = true;
        drop(self.feed.lock().take());
        self.gate.wake();
        self.live.send_replace(true);
        tracing::debug!(storage_key = %self.storage_key, "variable disposed");
    }

    fn require_link(&self) -> EngineResult<&BackingLink> {
        self.link.as_ref().ok_or_else(|| {
            EngineError::invalid_operation(format!(
                "{} is in reference mode but has no backing store",
                self.storage_key
            ))
        })
    }

    /// Writes a staged payload. On failure it is put back unless a newer
    /// write has replaced it.
    async fn flush_backing(&self, write: BackingWrite, version: u64) -> EngineResult<()> {
        let flushed = match self.require_link() {
            Ok(link) => link.flush(&write).await,
            Err(e) => Err(e),
        };
        if flushed.is_err() {
            let mut state = self.state.lock();
            if state.backing_write.is_none() && state.core.version() == Some(version) {
                state.backing_write = Some(write);
            }
        }
        flushed
    }

    async fn wait_live(&self) -> EngineResult<()> {
        self.state.lock().check()?;
        let mut live = self.live.subscribe();
        if live.wait_for(|live| *live).await.is_err() {
            return Err(EngineError::Disposed {
                storage_key: self.storage_key.clone(),
            });
        }
        self.state.lock().check()
    }

    async fn persist(&self) -> EngineResult<()> {
        let pass = self
            .gate
            .enter(|| {
                let state = self.state.lock();
                state.check()?;
                Ok::<_, EngineError>(state.local_modified)
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
            let (version, value, reference_mode, write) = {
                let mut state = self.state.lock();
                state.check()?;
                if !state.local_modified {
                    return Ok(());
                }
                (
                    state.core.version().unwrap_or(0),
                    state.stored.clone(),
                    state.reference_mode,
                    state.backing_write.take(),
                )
            };
            tracing::debug!(storage_key = %self.storage_key, round, version, "persisting variable");
            if let Some(write) = write {
                self.flush_backing(write, version).await?;
            }

            let mut mutate = |current: Option<&Document>| {
                let mut next = current
                    .cloned()
                    .unwrap_or_else(|| Document::new(reference_mode));
                next.version = current.map_or(version, |c| (c.version + 1).max(version));
                next.reference_mode = reference_mode;
                next.value = value.clone();
                Some(next)
            };
            let tx = self
                .backend
                .transaction(&self.storage_key, &mut mutate)
                .await?;
            let doc = match tx.document {
                Some(doc) if tx.committed => doc,
                _ => {
                    return Err(EngineError::Uncommitted {
                        storage_key: self.storage_key.clone(),
                    })
                }
            };

            let replay = {
                let mut state = self.state.lock();
                let last_commit = state.last_commit.map_or(doc.version, |c| c.max(doc.version));
                state.last_commit = Some(last_commit);
                if state.core.version() == Some(version) {
                    state.local_modified = false;
                    state.core.set_version(doc.version);
                    state.stored = doc.value.filter(|value| !value.is_null());
                    let event = ChangeEvent {
                        kind: EventKind::Synced,
                        version: doc.version,
                        storage_key: self.storage_key.clone(),
                        origin: Origin::Local,
                        barrier: None,
                        details: ChangeDetails::Synced,
                    };
                    state.core.fire(event);
                    tracing::debug!(storage_key = %self.storage_key, version = doc.version, "variable committed");
                    Some(state.deferred.take().filter(|d| d.version > last_commit))
                } else {
                    None
                }
            };
            if let Some(deferred) = replay {
                if let Some(deferred) = deferred {
                    tracing::debug!(storage_key = %self.storage_key, version = deferred.version, "applying held-back remote document");
                    self.on_remote_state_changed(deferred).await;
                }
                return Ok(());
            }
            tracing::debug!(
                storage_key = %self.storage_key,
                committed = doc.version,
                "newer local write during commit, repeating"
            );
        }

        tracing::warn!(storage_key = %self.storage_key, rounds, "variable persistence did not settle");
        Err(EngineError::PersistenceStalled {
            storage_key: self.storage_key.clone(),
            rounds,
        })
    }

    pub(crate) async fn on_remote_state_changed(&self, doc: Document) {
        let wanted = {
            let mut state = self.state.lock();
            if state.disposed || state.fault.is_some() {
                return;
            }
            if state.live && state.local_modified {
                tracing::trace!(storage_key = %self.storage_key, version = doc.version, "local write pending, holding back remote document");
                state.defer(doc);
                return;
            }
            state.accepts(&doc)
        };
        if !wanted {
            tracing::trace!(storage_key = %self.storage_key, version = doc.version, "ignoring remote document");
            return;
        }

        let payload = match (&self.link, doc.value.as_ref()) {
            (Some(link), Some(value)) if parse_pointer(value).is_some() => {
                match link.dereference(value).await {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!(storage_key = %self.storage_key, error = %e, "could not resolve pointer");
                        None
                    }
                }
            }
            _ => None,
        };

        let became_live = {
            let mut state = self.state.lock();
            if state.disposed || state.fault.is_some() {
                return;
            }
            let became_live = !state.live;
            if let Err(e) = self.apply_remote(&mut state, doc, payload) {
                tracing::error!(storage_key = %self.storage_key, error = %e, "variable faulted");
                state.fault = Some(e);
            }
            became_live
        };
        if became_live {
            self.live.send_replace(true);
        }
    }

    fn apply_remote(
        &self,
        state: &mut VariableState,
        doc: Document,
        payload: Option<Value>,
    ) -> EngineResult<()> {
        if !state.live {
            state.live = true;
            let exists = doc.version > 0 || doc.value.as_ref().is_some_and(|v| !v.is_null());
            if exists || doc.reference_mode {
                state.reference_mode = doc.reference_mode;
            }
            if !exists {
                return Ok(());
            }
        } else {
            if state.local_modified {
                tracing::trace!(storage_key = %self.storage_key, "local write pending, holding back remote document");
                state.defer(doc);
                return Ok(());
            }
            if state.last_commit.is_some_and(|c| doc.version <= c) {
                tracing::trace!(storage_key = %self.storage_key, version = doc.version, "echo of own commit");
                return Ok(());
            }
            if let Some(current) = state.core.version() {
                if doc.version <= current {
                    return Err(EngineError::ProtocolViolation {
                        storage_key: self.storage_key.clone(),
                        message: format!(
                            "remote version {} does not exceed local version {current}",
                            doc.version
                        ),
                    });
                }
            }
        }

        state.core.set_version(doc.version);
        state.stored = doc.value.filter(|value| !value.is_null());
        state.payload = payload;
        let data = state.current().cloned().unwrap_or(Value::Null);
        state.announce(doc.version, Origin::Remote, None, data);
        Ok(())
    }
}
