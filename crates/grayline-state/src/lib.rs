//! grayline-state — embedded state store for Grayline.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for deployments, application records, and diagnostic reports.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Deployments are keyed by their id, applications by name, and reports by
//! the deployment id they describe.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
