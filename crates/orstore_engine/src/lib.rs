//! # orstore engine
//!
//! Replicated providers over a [`Backend`](orstore_backend::Backend).
//!
//! This crate provides:
//! - [`VariableEngine`]: a last-writer-wins variable
//! - [`CollectionEngine`]: an OR-Set collection synchronized key by key
//! - [`BigCollection`]: a pass-through collection with paged streaming
//! - [`Storage`]: the registry that constructs, connects and shares providers
//!
//! Local writes are visible and announced immediately. Each provider then
//! drains its pending changes into backend transactions, at most one at a
//! time, while push notifications from the backend are diffed against the
//! last seen document and merged in.
//!
//! ## Reference mode
//!
//! A provider in reference mode stores `{id, backingKey}` pointers in its
//! document and keeps payloads in a backing collection shared by every
//! provider of the same value type.
//!
//! ```rust,ignore
//! use orstore_engine::{ProviderSpec, Storage, StorageConfig};
//!
//! let storage = Storage::new(backend, StorageConfig::new("app"));
//! let todos = storage.open(&ProviderSpec::collection("todos")).await?;
//! let todos = todos.as_collection().unwrap();
//! todos.store(todo, ["device-a"]).await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backing;
mod big_collection;
mod collection;
mod config;
mod error;
mod feed;
mod gate;
mod provider;
mod scheduler;
mod storage;
mod variable;

pub use backing::{
    membership_key, parse_pointer, pointer, BackingLink, BackingStores, BackingWrite,
    BACKING_KEY_FIELD,
};
pub use big_collection::{BigCollection, CursorId, CursorPage};
pub use collection::{CollectionEngine, PendingDelta};
pub use config::{PersistConfig, StorageConfig};
pub use error::{EngineError, EngineResult};
pub use provider::{
    Callback, ChangeDetails, ChangeEvent, EventKind, ItemChange, ListenerId, Origin, ProviderCore,
};
pub use scheduler::{EventBatch, QueueScheduler, Scheduler, TaskScheduler};
pub use storage::{Provider, ProviderKind, ProviderSpec, Storage, DEFAULT_VALUE_TYPE};
pub use variable::VariableEngine;
