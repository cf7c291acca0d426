//! # orstore_backend
//!
//! The persistence boundary of orstore.
//!
//! Every provider stores one [`Document`] under a storage key. A [`Backend`]
//! offers two primitives over those documents:
//!
//! - an atomic read-modify-write [`Backend::transaction`]
//! - push notifications via [`Backend::subscribe`]
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryBackend`]: process-local, used by tests and single-process setups
//! - [`RevisionBackend`]: revisioned CBOR documents with compare-and-swap
//!   commits and bounded retry, mirroring a remote document database
//!
//! ```rust,ignore
//! use orstore_backend::{Backend, Document, MemoryBackend};
//!
//! let backend = MemoryBackend::new();
//! let mut create = |_: Option<&Document>| Some(Document::new(false));
//! backend.transaction("root/settings", &mut create).await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod config;
mod document;
mod error;
mod memory;
mod revision;
mod subscription;

pub use adapter::{Backend, Listener, Mutator, SubscriptionId, Transaction};
pub use config::RetryConfig;
pub use document::{Document, DocumentItem};
pub use error::{BackendError, BackendResult};
pub use memory::MemoryBackend;
pub use revision::RevisionBackend;
pub use subscription::SubscriberSet;
