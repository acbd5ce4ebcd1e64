//! Rollout state machine.
//!
//! Pure decisions only: which operator command is legal from which rollout
//! status, and what a running group's counts mean for its progression. The
//! executor applies the decisions with guarded store transitions so that
//! each one takes effect at most once.

use fleet_core::count::{ActionStatusCount, TargetCountBucket, TotalTargetCountStatus};
use fleet_core::types::{
    ActionStatus, ErrorAction, GroupConditions, RolloutGroup, RolloutGroupStatus, RolloutStatus,
    TargetId,
};

use crate::condition::Threshold;
use crate::error::{RolloutError, RolloutResult};

/// Operator commands on a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutCommand {
    Start,
    Pause,
    Resume,
    Stop,
}

impl RolloutCommand {
    /// Statuses the command may be issued from.
    pub fn allowed_from(self) -> &'static [RolloutStatus] {
        match self {
            RolloutCommand::Start => &[RolloutStatus::Ready],
            RolloutCommand::Pause => &[RolloutStatus::Running],
            RolloutCommand::Resume => &[RolloutStatus::Paused],
            RolloutCommand::Stop => &[RolloutStatus::Running, RolloutStatus::Paused],
        }
    }

    pub fn target(self) -> RolloutStatus {
        match self {
            RolloutCommand::Start => RolloutStatus::Starting,
            RolloutCommand::Pause => RolloutStatus::Paused,
            RolloutCommand::Resume => RolloutStatus::Running,
            RolloutCommand::Stop => RolloutStatus::Stopped,
        }
    }

    fn expected(self) -> &'static str {
        match self {
            RolloutCommand::Start => "ready",
            RolloutCommand::Pause => "running",
            RolloutCommand::Resume => "paused",
            RolloutCommand::Stop => "running or paused",
        }
    }

    /// Check the command against the current status.
    pub fn check(self, current: RolloutStatus) -> RolloutResult<RolloutStatus> {
        if self.allowed_from().contains(&current) {
            Ok(self.target())
        } else {
            Err(self.illegal(current))
        }
    }

    pub fn illegal(self, actual: RolloutStatus) -> RolloutError {
        RolloutError::IllegalState {
            expected: self.expected(),
            actual,
        }
    }
}

/// What a running group's counts mean for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupVerdict {
    /// Neither threshold reached yet.
    Pending,
    /// Success threshold reached; the next group may start.
    Succeeded,
    /// Error threshold reached; apply the configured action.
    Failed(ErrorAction),
}

/// Check that every expression of a group's conditions parses.
pub fn validate_conditions(conditions: &GroupConditions) -> RolloutResult<()> {
    Threshold::parse(&conditions.success_condition_exp)?;
    if conditions.error_condition.is_some() {
        let exp = conditions.error_condition_exp.as_deref().ok_or_else(|| {
            RolloutError::InvalidCondition {
                expression: String::new(),
                reason: "error condition without expression".to_string(),
            }
        })?;
        Threshold::parse(exp)?;
    }
    Ok(())
}

/// Evaluate a running group. The error condition is checked first.
///
/// Cancelled targets count toward neither threshold. An empty group has
/// nothing left to wait for: it succeeds and never fails.
pub fn evaluate_group(
    conditions: &GroupConditions,
    counts: &TotalTargetCountStatus,
) -> RolloutResult<GroupVerdict> {
    let total = counts.total_targets();

    if conditions.error_condition.is_some() {
        if let Some(exp) = conditions.error_condition_exp.as_deref() {
            let threshold = Threshold::parse(exp)?;
            if threshold.is_met(counts.count(TargetCountBucket::Error), total) == Some(true) {
                return Ok(GroupVerdict::Failed(
                    conditions.error_action.unwrap_or_default(),
                ));
            }
        }
    }

    let success = Threshold::parse(&conditions.success_condition_exp)?;
    let met = success
        .is_met(counts.count(TargetCountBucket::Finished), total)
        .unwrap_or(true);
    Ok(if met {
        GroupVerdict::Succeeded
    } else {
        GroupVerdict::Pending
    })
}

/// Whether a group with actions has none left that can still change.
///
/// Such a group is over even when neither threshold was reached, e.g. when a
/// newer rollout cancelled every action it had scheduled.
pub fn all_actions_ended(rows: &[ActionStatusCount]) -> RolloutResult<bool> {
    let mut any = false;
    for row in rows.iter().filter(|r| r.count > 0) {
        if !ActionStatus::from_tag(row.status_tag)?.is_terminal() {
            return Ok(false);
        }
        any = true;
    }
    Ok(any)
}

/// First scheduled group in activation order.
pub fn next_scheduled(groups: &[RolloutGroup]) -> Option<&RolloutGroup> {
    groups
        .iter()
        .filter(|g| g.status == RolloutGroupStatus::Scheduled)
        .min_by_key(|g| g.position)
}

/// A running rollout is done once no group is running or waiting.
pub fn is_complete(groups: &[RolloutGroup]) -> bool {
    !groups.iter().any(|g| {
        matches!(
            g.status,
            RolloutGroupStatus::Running | RolloutGroupStatus::Scheduled
        )
    })
}

/// Split targets into `amount` consecutive groups whose sizes differ by at
/// most one; earlier groups take the remainder.
pub fn split_targets(targets: &[TargetId], amount: u32) -> Vec<Vec<TargetId>> {
    if amount == 0 {
        return Vec::new();
    }
    let amount = amount as usize;
    let base = targets.len() / amount;
    let remainder = targets.len() % amount;

    let mut groups = Vec::with_capacity(amount);
    let mut start = 0;
    for i in 0..amount {
        let size = base + usize::from(i < remainder);
        groups.push(targets[start..start + size].to_vec());
        start += size;
    }
    groups
}
