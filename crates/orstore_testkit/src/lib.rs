//! # orstore testkit
//!
//! Test utilities for orstore.
//!
//! This crate provides:
//! - [`FaultyBackend`], a backend wrapper that denies, fails or parks
//!   transactions on request
//! - [`RecordingListener`] for asserting on delivered events
//! - proptest strategies for values and collection operation sequences
//! - engine fixtures and [`init_tracing`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use orstore_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn stores_locally() {
//!     let fixture = collection_fixture().await;
//!     fixture.engine.store(item("x"), ["k1"]).await.unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faulty;
pub mod fixtures;
pub mod generators;
pub mod recording;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faulty::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::recording::*;
}

pub use faulty::FaultyBackend;
pub use fixtures::{
    collection_fixture, eventually, init_tracing, item, item_with, variable_on, CollectionFixture, FIXTURE_KEY,
};
pub use generators::{op_sequence_strategy, value_strategy, CollectionOp};
pub use recording::RecordingListener;
