//! fleet-core — shared vocabulary for FleetGrid crates.
//!
//! Holds the status enumerations for actions, rollouts and rollout groups,
//! the persisted domain records, the `TotalTargetCountStatus` aggregator and
//! the `fleet.toml` configuration.

pub mod config;
pub mod count;
pub mod error;
pub mod types;

pub use config::FleetConfig;
pub use count::{ActionStatusCount, TargetCountBucket, TotalTargetCountStatus};
pub use error::{CoreError, CoreResult};
pub use types::*;
