//! slotway-state: embedded state store for slotway.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for the slot registry (deployments and their slots) and the
//! metrics store (immutable rollups keyed by deployment and window).
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{deployment_id}:{slot}`, `{deployment_id}:{window_end}:…`)
//! enable prefix and range scans for related records.
//!
//! Multi-slot updates (weight shifts, rollbacks) commit in a single write
//! transaction. redb readers see the last committed snapshot, so a reader
//! never observes a half-applied weight set and never waits on a writer.
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
