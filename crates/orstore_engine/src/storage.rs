//! The storage registry.
//!
//! A [`Storage`] owns one backend, the providers attached through it and
//! the backing stores they share. Providers are created once per storage
//! key and handed out as cheap [`Provider`] clones.

use crate::backing::{BackingLink, BackingStores};
use crate::big_collection::BigCollection;
use crate::collection::CollectionEngine;
use crate::config::StorageConfig;
use crate::error::{EngineError, EngineResult};
use crate::variable::VariableEngine;
use orstore_backend::{Backend, Document};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Value type used when a spec names none.
pub const DEFAULT_VALUE_TYPE: &str = "Value";

/// The kind of engine behind a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// A last-writer-wins variable.
    Singleton,
    /// An OR-Set collection.
    Collection,
    /// A pass-through collection with paged streaming.
    BigCollection,
    /// The shared backing collection of a value type.
    BackingStore,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderKind::Singleton => "singleton",
            ProviderKind::Collection => "collection",
            ProviderKind::BigCollection => "big collection",
            ProviderKind::BackingStore => "backing store",
        };
        f.write_str(name)
    }
}

/// Describes a provider to construct or connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    /// Name under the storage root. Ignored for backing stores, which are
    /// keyed by value type.
    pub name: String,
    /// Engine kind.
    pub kind: ProviderKind,
    /// Type of the stored values; selects the backing store.
    pub value_type: String,
    /// Store pointers instead of values. Applies only to new documents.
    pub reference_mode: bool,
}

impl ProviderSpec {
    /// Creates a spec with the default value type and no reference mode.
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            value_type: DEFAULT_VALUE_TYPE.to_string(),
            reference_mode: false,
        }
    }

    /// Spec for a variable.
    pub fn singleton(name: impl Into<String>) -> Self {
        Self::new(name, ProviderKind::Singleton)
    }

    /// Spec for an OR-Set collection.
    pub fn collection(name: impl Into<String>) -> Self {
        Self::new(name, ProviderKind::Collection)
    }

    /// Spec for a big collection.
    pub fn big_collection(name: impl Into<String>) -> Self {
        Self::new(name, ProviderKind::BigCollection)
    }

    /// Spec for the backing store of `value_type`.
    pub fn backing_store(value_type: impl Into<String>) -> Self {
        let value_type = value_type.into();
        Self {
            name: value_type.clone(),
            kind: ProviderKind::BackingStore,
            value_type,
            reference_mode: false,
        }
    }

    /// Sets the value type.
    pub fn with_value_type(mut self, value_type: impl Into<String>) -> Self {
        self.value_type = value_type.into();
        self
    }

    /// Enables or disables reference mode.
    pub fn with_reference_mode(mut self, enabled: bool) -> Self {
        self.reference_mode = enabled;
        self
    }

    fn validate(&self, reference_mode: bool) -> EngineResult<()> {
        match self.kind {
            ProviderKind::BigCollection | ProviderKind::BackingStore if reference_mode => {
                Err(EngineError::invalid_operation(format!(
                    "{} providers do not support reference mode",
                    self.kind
                )))
            }
            _ => Ok(()),
        }
    }
}

/// A provider held by a [`Storage`].
#[derive(Clone)]
pub enum Provider {
    /// A variable.
    Singleton(Arc<VariableEngine>),
    /// An OR-Set collection.
    Collection(Arc<CollectionEngine>),
    /// A big collection.
    BigCollection(Arc<BigCollection>),
    /// A shared backing collection.
    BackingStore(Arc<CollectionEngine>),
}

impl Provider {
    /// Engine kind.
    pub fn kind(&self) -> ProviderKind {
        match self {
            Provider::Singleton(_) => ProviderKind::Singleton,
            Provider::Collection(_) => ProviderKind::Collection,
            Provider::BigCollection(_) => ProviderKind::BigCollection,
            Provider::BackingStore(_) => ProviderKind::BackingStore,
        }
    }

    /// Storage key of the provider's document.
    pub fn storage_key(&self) -> &str {
        match self {
            Provider::Singleton(engine) => engine.storage_key(),
            Provider::Collection(engine) | Provider::BackingStore(engine) => engine.storage_key(),
            Provider::BigCollection(big) => big.storage_key(),
        }
    }

    /// The variable, if this is one.
    pub fn as_singleton(&self) -> Option<&Arc<VariableEngine>> {
        match self {
            Provider::Singleton(engine) => Some(engine),
            _ => None,
        }
    }

    /// The collection engine of a collection or backing store.
    pub fn as_collection(&self) -> Option<&Arc<CollectionEngine>> {
        match self {
            Provider::Collection(engine) | Provider::BackingStore(engine) => Some(engine),
            _ => None,
        }
    }

    /// The big collection, if this is one.
    pub fn as_big_collection(&self) -> Option<&Arc<BigCollection>> {
        match self {
            Provider::BigCollection(big) => Some(big),
            _ => None,
        }
    }

    /// Detaches the provider from the backend.
    pub fn dispose(&self) {
        match self {
            Provider::Singleton(engine) => engine.dispose(),
            Provider::Collection(engine) | Provider::BackingStore(engine) => engine.dispose(),
            Provider::BigCollection(big) => big.dispose(),
        }
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("kind", &self.kind())
            .field("storage_key", &self.storage_key())
            .finish()
    }
}

/// Registry of the providers attached to one backend root.
pub struct Storage {
    config: StorageConfig,
    backend: Arc<dyn Backend>,
    providers: Mutex<HashMap<String, Provider>>,
    backing: Arc<BackingStores>,
}

impl Storage {
    /// Creates an empty registry over `backend`.
    pub fn new(backend: Arc<dyn Backend>, config: StorageConfig) -> Self {
        let backing = Arc::new(BackingStores::new(Arc::clone(&backend), config.clone()));
        Self {
            config,
            backend,
            providers: Mutex::new(HashMap::new()),
            backing,
        }
    }

    /// The registry configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// The backend every provider writes to.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Storage key `spec` resolves to.
    pub fn key_for(&self, spec: &ProviderSpec) -> String {
        match spec.kind {
            ProviderKind::BackingStore => self.config.backing_key(&spec.value_type),
            _ => self.config.key_for(&spec.name),
        }
    }

    /// Creates the document for `spec` and attaches a provider to it.
    ///
    /// Fails with [`EngineError::AlreadyExists`] if the document exists.
    pub async fn construct(&self, spec: &ProviderSpec) -> EngineResult<Provider> {
        spec.validate(spec.reference_mode)?;
        let storage_key = self.key_for(spec);
        if self.providers.lock().contains_key(&storage_key) {
            return Err(EngineError::AlreadyExists { storage_key });
        }

        let reference_mode = spec.reference_mode;
        let mut create = |current: Option<&Document>| match current {
            Some(_) => None,
            None => Some(Document::new(reference_mode)),
        };
        let tx = self.backend.transaction(&storage_key, &mut create).await?;
        if !tx.committed {
            return Err(EngineError::AlreadyExists { storage_key });
        }
        tracing::debug!(storage_key = %storage_key, kind = %spec.kind, reference_mode, "constructed provider document");

        let provider = self.instantiate(spec, &storage_key, reference_mode).await?;
        Ok(self.register(storage_key, provider))
    }

    /// Attaches a provider to the existing document for `spec`.
    ///
    /// The provider adopts the reference mode recorded in the document.
    /// Fails with [`EngineError::NotFound`] if there is no document.
    pub async fn connect(&self, spec: &ProviderSpec) -> EngineResult<Provider> {
        let storage_key = self.key_for(spec);
        if let Some(provider) = self.lookup(spec, &storage_key)? {
            return Ok(provider);
        }

        let doc = self
            .backend
            .read(&storage_key)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                storage_key: storage_key.clone(),
            })?;
        spec.validate(doc.reference_mode)?;

        let provider = self.instantiate(spec, &storage_key, doc.reference_mode).await?;
        Ok(self.register(storage_key, provider))
    }

    /// Connects to the document for `spec`, constructing it if missing.
    pub async fn open(&self, spec: &ProviderSpec) -> EngineResult<Provider> {
        let storage_key = self.key_for(spec);
        if let Some(provider) = self.lookup(spec, &storage_key)? {
            return Ok(provider);
        }
        if self.backend.read(&storage_key).await?.is_some() {
            return self.connect(spec).await;
        }
        match self.construct(spec).await {
            Err(EngineError::AlreadyExists { .. }) => self.connect(spec).await,
            result => result,
        }
    }

    /// The registered provider at `storage_key`.
    pub fn provider(&self, storage_key: &str) -> Option<Provider> {
        self.providers.lock().get(storage_key).cloned()
    }

    /// Storage keys of every registered provider.
    pub fn storage_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.providers.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// The shared backing store for `value_type`.
    pub async fn backing_store_for(&self, value_type: &str) -> EngineResult<Arc<CollectionEngine>> {
        self.backing.resolve(value_type).await
    }

    /// Disposes and forgets the provider at `storage_key`.
    pub fn close(&self, storage_key: &str) -> bool {
        let removed = self.providers.lock().remove(storage_key);
        match removed {
            Some(provider) => {
                provider.dispose();
                true
            }
            None => false,
        }
    }

    /// Disposes every provider and backing store.
    pub fn shutdown(&self) {
        let providers: Vec<Provider> = self.providers.lock().drain().map(|(_, p)| p).collect();
        for provider in &providers {
            provider.dispose();
        }
        self.backing.shutdown();
        tracing::debug!(root = %self.config.root, providers = providers.len(), "storage shut down");
    }

    fn lookup(&self, spec: &ProviderSpec, storage_key: &str) -> EngineResult<Option<Provider>> {
        let Some(provider) = self.providers.lock().get(storage_key).cloned() else {
            return Ok(None);
        };
        if provider.kind() != spec.kind {
            return Err(EngineError::invalid_operation(format!(
                "{storage_key} is a {}, not a {}",
                provider.kind(),
                spec.kind
            )));
        }
        Ok(Some(provider))
    }

    async fn instantiate(
        &self,
        spec: &ProviderSpec,
        storage_key: &str,
        reference_mode: bool,
    ) -> EngineResult<Provider> {
        let persist = self.config.persist.clone();
        let link = || Some(BackingLink::new(Arc::clone(&self.backing), spec.value_type.clone()));
        let provider = match spec.kind {
            ProviderKind::Singleton => Provider::Singleton(VariableEngine::attach(
                storage_key,
                Arc::clone(&self.backend),
                persist,
                reference_mode,
                link(),
            )?),
            ProviderKind::Collection => Provider::Collection(CollectionEngine::attach(
                storage_key,
                Arc::clone(&self.backend),
                persist,
                reference_mode,
                link(),
            )?),
            ProviderKind::BigCollection => Provider::BigCollection(Arc::new(BigCollection::new(
                storage_key,
                Arc::clone(&self.backend),
            ))),
            ProviderKind::BackingStore => {
                Provider::BackingStore(self.backing.resolve(&spec.value_type).await?)
            }
        };
        Ok(provider)
    }

    fn register(&self, storage_key: String, provider: Provider) -> Provider {
        match self.providers.lock().entry(storage_key) {
            Entry::Occupied(existing) => {
                if !matches!(provider, Provider::BackingStore(_)) {
                    provider.dispose();
                }
                existing.get().clone()
            }
            Entry::Vacant(slot) => slot.insert(provider).clone(),
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orstore_backend::MemoryBackend;
    use orstore_codec::Value;

    fn storage(backend: &Arc<MemoryBackend>) -> Storage {
        let backend: Arc<dyn Backend> = Arc::clone(backend) as Arc<dyn Backend>;
        Storage::new(backend, StorageConfig::new("app"))
    }

    #[tokio::test]
    async fn construct_rejects_existing_document() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = storage(&backend);
        let spec = ProviderSpec::collection("todos");

        let provider = storage.construct(&spec).await.unwrap();
        assert_eq!(provider.kind(), ProviderKind::Collection);
        assert_eq!(provider.storage_key(), "app/todos");
        assert!(backend.document("app/todos").is_some());

        let again = storage.construct(&spec).await;
        assert!(matches!(again, Err(EngineError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn connect_requires_document() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = storage(&backend);
        let result = storage.connect(&ProviderSpec::singleton("missing")).await;
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn open_returns_registered_provider() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = storage(&backend);
        let spec = ProviderSpec::singleton("profile");

        let first = storage.open(&spec).await.unwrap();
        let second = storage.open(&spec).await.unwrap();
        let (Some(a), Some(b)) = (first.as_singleton(), second.as_singleton()) else {
            panic!("expected singletons");
        };
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(storage.storage_keys(), vec!["app/profile".to_string()]);
    }

    #[tokio::test]
    async fn kind_mismatch_is_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = storage(&backend);
        storage.open(&ProviderSpec::singleton("thing")).await.unwrap();
        let result = storage.open(&ProviderSpec::collection("thing")).await;
        assert!(matches!(result, Err(EngineError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn big_collection_rejects_reference_mode() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = storage(&backend);
        let spec = ProviderSpec::big_collection("log").with_reference_mode(true);
        assert!(matches!(
            storage.construct(&spec).await,
            Err(EngineError::InvalidOperation(_))
        ));
        assert!(backend.document("app/log").is_none());
    }

    #[tokio::test]
    async fn connect_adopts_recorded_reference_mode() {
        let backend = Arc::new(MemoryBackend::new());
        let writer = storage(&backend);
        writer
            .construct(&ProviderSpec::collection("docs").with_reference_mode(true))
            .await
            .unwrap();

        let reader = storage(&backend);
        let provider = reader.connect(&ProviderSpec::collection("docs")).await.unwrap();
        let engine = provider.as_collection().unwrap();
        engine.wait_ready().await.unwrap();
        assert!(engine.reference_mode());
    }

    #[tokio::test]
    async fn backing_stores_are_shared_per_value_type() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = storage(&backend);
        let a = storage.backing_store_for("Note").await.unwrap();
        let b = storage.backing_store_for("Note").await.unwrap();
        let c = storage.backing_store_for("Task").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.storage_key(), "app/backingStores/Note");

        let provider = storage.open(&ProviderSpec::backing_store("Note")).await.unwrap();
        assert!(Arc::ptr_eq(provider.as_collection().unwrap(), &a));
    }

    #[tokio::test]
    async fn shutdown_disposes_providers() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = storage(&backend);
        let provider = storage.open(&ProviderSpec::collection("items")).await.unwrap();
        let engine = Arc::clone(provider.as_collection().unwrap());
        engine.wait_ready().await.unwrap();

        storage.shutdown();
        assert!(storage.provider("app/items").is_none());
        let item = Value::record([("id", Value::from("x"))]);
        assert!(matches!(
            engine.store(item, ["k"]).await,
            Err(EngineError::Disposed { .. })
        ));
    }
}
