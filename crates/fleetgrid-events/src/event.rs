//! Raw entity events and coarse change notifications.

use std::fmt;

use serde::{Deserialize, Serialize};

use fleet_core::types::{
    ActionId, ActionStatus, RolloutGroupId, RolloutGroupStatus, RolloutId, RolloutRef,
    RolloutStatus, TargetId, TenantId,
};

/// Fine-grained event fired for every persisted change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityEvent {
    ActionCreated {
        tenant: TenantId,
        action_id: ActionId,
        target_id: TargetId,
        rollout: Option<RolloutRef>,
    },
    ActionUpdated {
        tenant: TenantId,
        action_id: ActionId,
        status: ActionStatus,
        rollout: Option<RolloutRef>,
    },
    /// A status report was appended to an action's history.
    ActionStatusAppended {
        tenant: TenantId,
        action_id: ActionId,
        status: ActionStatus,
        rollout: Option<RolloutRef>,
    },
    RolloutUpdated {
        tenant: TenantId,
        rollout_id: RolloutId,
        status: RolloutStatus,
    },
    RolloutGroupUpdated {
        tenant: TenantId,
        rollout_id: RolloutId,
        group_id: RolloutGroupId,
        status: RolloutGroupStatus,
    },
    /// The rollout and everything it created were removed.
    RolloutDeleted { tenant: TenantId, rollout_id: RolloutId },
    /// Target metadata changed; never affects rollout progress.
    TargetUpdated { tenant: TenantId, target_id: TargetId },
}

impl EntityEvent {
    pub fn tenant(&self) -> &str {
        match self {
            EntityEvent::ActionCreated { tenant, .. }
            | EntityEvent::ActionUpdated { tenant, .. }
            | EntityEvent::ActionStatusAppended { tenant, .. }
            | EntityEvent::RolloutUpdated { tenant, .. }
            | EntityEvent::RolloutGroupUpdated { tenant, .. }
            | EntityEvent::RolloutDeleted { tenant, .. }
            | EntityEvent::TargetUpdated { tenant, .. } => tenant,
        }
    }

    /// The rollout and (optionally) group whose progress this event may
    /// have changed. `None` for events unrelated to any rollout.
    pub fn touched(&self) -> Option<(RolloutId, Option<RolloutGroupId>)> {
        match self {
            EntityEvent::ActionCreated { rollout, .. }
            | EntityEvent::ActionUpdated { rollout, .. }
            | EntityEvent::ActionStatusAppended { rollout, .. } => {
                rollout.map(|r| (r.rollout_id, Some(r.group_id)))
            }
            EntityEvent::RolloutUpdated { rollout_id, .. }
            | EntityEvent::RolloutDeleted { rollout_id, .. } => Some((*rollout_id, None)),
            EntityEvent::RolloutGroupUpdated {
                rollout_id,
                group_id,
                ..
            } => Some((*rollout_id, Some(*group_id))),
            EntityEvent::TargetUpdated { .. } => None,
        }
    }
}

/// Summarized "something changed here, re-query" notification.
///
/// Carries only the identity of the changed entity, never a diff.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeNotification {
    RolloutChanged {
        tenant: TenantId,
        rollout_id: RolloutId,
    },
    RolloutGroupChanged {
        tenant: TenantId,
        rollout_id: RolloutId,
        group_id: RolloutGroupId,
    },
    /// Entity events were dropped before they could be coalesced, so the
    /// changed keys are unknown. Consumers re-query everything they show.
    ResyncRequired { missed: u64 },
}

impl ChangeNotification {
    /// `None` for notifications that concern every tenant.
    pub fn tenant(&self) -> Option<&str> {
        match self {
            ChangeNotification::RolloutChanged { tenant, .. }
            | ChangeNotification::RolloutGroupChanged { tenant, .. } => Some(tenant),
            ChangeNotification::ResyncRequired { .. } => None,
        }
    }
}

impl fmt::Display for ChangeNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeNotification::RolloutChanged { tenant, rollout_id } => {
                write!(f, "rollout {tenant}/{rollout_id}")
            }
            ChangeNotification::RolloutGroupChanged {
                tenant,
                rollout_id,
                group_id,
            } => write!(f, "rollout group {tenant}/{rollout_id}/{group_id}"),
            ChangeNotification::ResyncRequired { missed } => {
                write!(f, "resync after {missed} missed events")
            }
        }
    }
}
