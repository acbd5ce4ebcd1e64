//! FleetGrid rollout engine — group conditions, state machine, executor.
//!
//! A rollout distributes one distribution set to an ordered list of target
//! groups. Each running group is gated by a success and an optional error
//! threshold evaluated against its live `TotalTargetCountStatus`.
//!
//! # Components
//!
//! - **`condition`** — Threshold expressions (`">= 75%"`) and their evaluation
//! - **`machine`** — Pure rollout/group transitions and group verdicts
//! - **`executor`** — Store-backed lifecycle operations and periodic checks

pub mod condition;
pub mod error;
pub mod executor;
pub mod machine;

pub use condition::{Comparison, Threshold};
pub use error::{RolloutError, RolloutResult};
pub use executor::{ConditionSpec, CreateRollout, GroupDefinition, RolloutExecutor};
pub use machine::{GroupVerdict, RolloutCommand, evaluate_group, split_targets};
