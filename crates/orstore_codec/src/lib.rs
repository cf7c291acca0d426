//! # orstore Codec
//!
//! The value model shared by every orstore crate, plus encodings.
//!
//! Values stored in variables and collections are opaque to the sync engine
//! apart from their `id` field. What the engine does need is a reliable
//! notion of equality: a write that carries a value identical to the one
//! already stored is not a change. [`Value`] keeps maps sorted by key so that
//! equality is structural rather than dependent on how a record was built or
//! serialized.
//!
//! ## Encodings
//!
//! - CBOR via `ciborium` (exact round-trip, used for stored documents)
//! - JSON via `serde_json` (literal export; bytes degrade to integer lists)
//!
//! ```
//! use orstore_codec::{from_cbor, to_cbor, Value};
//!
//! let value = Value::record([("id", Value::from("x")), ("n", Value::Integer(1))]);
//! let bytes = to_cbor(&value).unwrap();
//! let decoded: Value = from_cbor(&bytes).unwrap();
//! assert_eq!(value, decoded);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod encoding;
mod error;
mod serde_impl;
mod value;

pub use encoding::{from_cbor, from_json, to_cbor, to_json};
pub use error::{CodecError, CodecResult};
pub use value::{Value, ID_FIELD};
