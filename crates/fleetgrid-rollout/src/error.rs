//! Error types for the rollout engine.

use fleet_core::error::CoreError;
use fleet_core::types::RolloutStatus;
use fleetgrid_state::StateError;
use thiserror::Error;

pub type RolloutResult<T> = Result<T, RolloutError>;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("rollout is {actual}, expected {expected}")]
    IllegalState {
        expected: &'static str,
        actual: RolloutStatus,
    },

    #[error("invalid condition expression {expression:?}: {reason}")]
    InvalidCondition { expression: String, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid rollout groups: {0}")]
    InvalidGroups(String),

    #[error("rollout {0} has no scheduled group left")]
    NoScheduledGroup(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Core(#[from] CoreError),
}
