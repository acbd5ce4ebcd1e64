//! fleetgrid-state — embedded state store for FleetGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for rollouts, rollout groups and their target membership, actions
//! and the append-only action status history.
//!
//! # Architecture
//!
//! All domain records are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{tenant}/{rollout}/{group}`) use zero-padded numeric ids
//! so that prefix scans return children in id order.
//!
//! A secondary status index (`{tenant}/{rollout}/{group}/{action}` → status
//! tag) answers per-scope `(status, count)` queries without decoding actions.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use fleet_core::count::*;
pub use fleet_core::types::*;
pub use store::{CountScope, StateStore};
