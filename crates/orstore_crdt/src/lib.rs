//! # orstore CRDT
//!
//! The observed-remove set (OR-Set) that backs orstore collections.
//!
//! Each entry is an id, a value and a set of membership keys. An id stays in
//! the collection for as long as at least one of its keys survives. Adding
//! and removing are expressed in terms of keys, which is what lets two
//! replicas apply each other's adds and removes in any order and still agree.
//!
//! ## Key Invariants
//!
//! - An id is present iff its key set is non-empty
//! - `add` never changes a stored value without contributing a new key
//! - `from_literal(to_literal(m)) == m`, independent of entry order

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod diff;
mod error;
mod literal;
mod model;

pub use diff::{diff_keys, KeyDiff};
pub use error::{CrdtError, CrdtResult};
pub use literal::{ProviderLiteral, SerializedEntry};
pub use model::{CollectionModel, Entry};
