//! Rollout executor — applies the state machine to stored rollouts.
//!
//! Operator commands (`start`, `pause`, `resume`, `stop`,
//! `trigger_next_group`, `delete_rollout`) are applied immediately. Everything else happens in periodic checks: CREATING
//! rollouts get their groups materialized, STARTING rollouts get their
//! actions created and the first group activated, RUNNING rollouts get
//! their running groups evaluated.
//!
//! Every state change is a guarded store transition, so a decision taken by
//! several overlapping checks is applied once. Every write fires the
//! matching entity event on the bus.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fleet_core::count::TotalTargetCountStatus;
use fleet_core::types::*;
use fleetgrid_events::{EntityEvent, EventBus};
use fleetgrid_state::{CountScope, StateStore};

use crate::error::{RolloutError, RolloutResult};
use crate::machine::{self, GroupVerdict, RolloutCommand};

/// Upper bound on groups per rollout.
pub const MAX_GROUPS: usize = 500;

/// Condition overrides as supplied by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionSpec {
    pub success_threshold: Option<String>,
    pub error_threshold: Option<String>,
    pub error_action: Option<ErrorAction>,
}

impl ConditionSpec {
    /// Overlay onto `base`; fields set here win.
    fn apply(&self, base: &GroupConditions) -> GroupConditions {
        let mut conditions = base.clone();
        if let Some(exp) = &self.success_threshold {
            conditions = conditions.success_threshold(exp);
        }
        if let Some(exp) = &self.error_threshold {
            let action = self.error_action.or(base.error_action).unwrap_or_default();
            conditions = conditions.error_threshold(exp, action);
        } else if let Some(action) = self.error_action {
            if conditions.error_condition.is_some() {
                conditions.error_action = Some(action);
            }
        }
        conditions
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub targets: Vec<TargetId>,
    #[serde(default)]
    pub conditions: ConditionSpec,
}

/// Rollout creation request.
///
/// Groups are given either explicitly (`groups`) or as a number of groups
/// (`amount_groups`) that `targets` is split into evenly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRollout {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub distribution_set: String,
    #[serde(default)]
    pub target_filter: String,
    #[serde(default)]
    pub action_type: ActionType,
    #[serde(default)]
    pub forced_time: u64,
    /// Conditions for every group unless the group overrides them.
    #[serde(default)]
    pub conditions: ConditionSpec,
    #[serde(default)]
    pub groups: Vec<GroupDefinition>,
    #[serde(default)]
    pub amount_groups: Option<u32>,
    #[serde(default)]
    pub targets: Vec<TargetId>,
}

impl CreateRollout {
    fn plan(&self) -> RolloutResult<Vec<GroupPlan>> {
        if self.name.trim().is_empty() {
            return Err(RolloutError::InvalidRequest("rollout name is empty".into()));
        }
        if self.distribution_set.trim().is_empty() {
            return Err(RolloutError::InvalidRequest("distribution set is empty".into()));
        }

        let defaults = self.conditions.apply(&GroupConditions::default());
        let plan: Vec<GroupPlan> = match (self.groups.is_empty(), self.amount_groups) {
            (false, None) => self
                .groups
                .iter()
                .enumerate()
                .map(|(i, g)| GroupPlan {
                    name: g.name.clone().unwrap_or_else(|| default_group_name(i)),
                    targets: g.targets.clone(),
                    conditions: g.conditions.apply(&defaults),
                })
                .collect(),
            (true, Some(amount)) => {
                if amount == 0 || amount as usize > MAX_GROUPS {
                    return Err(RolloutError::InvalidGroups(format!(
                        "amount of groups must be between 1 and {MAX_GROUPS}, got {amount}"
                    )));
                }
                machine::split_targets(&self.targets, amount)
                    .into_iter()
                    .enumerate()
                    .map(|(i, targets)| GroupPlan {
                        name: default_group_name(i),
                        targets,
                        conditions: defaults.clone(),
                    })
                    .collect()
            }
            (false, Some(_)) => {
                return Err(RolloutError::InvalidGroups(
                    "give either explicit groups or an amount of groups, not both".into(),
                ));
            }
            (true, None) => {
                return Err(RolloutError::InvalidGroups("no groups defined".into()));
            }
        };

        if plan.len() > MAX_GROUPS {
            return Err(RolloutError::InvalidGroups(format!(
                "at most {MAX_GROUPS} groups allowed, got {}",
                plan.len()
            )));
        }
        let mut seen = HashSet::new();
        for group in &plan {
            if group.targets.is_empty() {
                return Err(RolloutError::InvalidGroups(format!(
                    "group {} has no targets",
                    group.name
                )));
            }
            for target in &group.targets {
                if !seen.insert(target.as_str()) {
                    return Err(RolloutError::InvalidGroups(format!(
                        "target {target} is in more than one group"
                    )));
                }
            }
            machine::validate_conditions(&group.conditions)?;
        }
        Ok(plan)
    }
}

fn default_group_name(index: usize) -> String {
    format!("group-{}", index + 1)
}

#[derive(Clone)]
pub struct RolloutExecutor {
    store: StateStore,
    bus: EventBus,
    batch: usize,
}

impl RolloutExecutor {
    /// `batch` bounds the targets or actions written per store transaction.
    pub fn new(store: StateStore, bus: EventBus, batch: usize) -> Self {
        Self {
            store,
            bus,
            batch: batch.max(1),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get_rollout(&self, tenant: &str, rollout_id: RolloutId) -> RolloutResult<Rollout> {
        self.store
            .get_rollout(tenant, rollout_id)?
            .ok_or_else(|| RolloutError::NotFound(format!("rollout {tenant}/{rollout_id}")))
    }

    pub fn list_rollouts(&self, tenant: &str) -> RolloutResult<Vec<Rollout>> {
        Ok(self.store.list_rollouts(tenant)?)
    }

    pub fn get_group(
        &self,
        tenant: &str,
        rollout_id: RolloutId,
        group_id: RolloutGroupId,
    ) -> RolloutResult<RolloutGroup> {
        self.store
            .get_group(tenant, rollout_id, group_id)?
            .ok_or_else(|| {
                RolloutError::NotFound(format!("rollout group {tenant}/{rollout_id}/{group_id}"))
            })
    }

    /// Groups of an existing rollout in activation order.
    pub fn list_groups(&self, tenant: &str, rollout_id: RolloutId) -> RolloutResult<Vec<RolloutGroup>> {
        self.get_rollout(tenant, rollout_id)?;
        Ok(self.store.list_groups(tenant, rollout_id)?)
    }

    /// Member targets of a group.
    pub fn list_group_targets(
        &self,
        tenant: &str,
        rollout_id: RolloutId,
        group_id: RolloutGroupId,
    ) -> RolloutResult<Vec<TargetId>> {
        self.get_group(tenant, rollout_id, group_id)?;
        Ok(self.store.list_group_targets(tenant, rollout_id, group_id)?)
    }

    /// Live bucket counts for a rollout or one of its groups.
    pub fn total_target_count_status(
        &self,
        tenant: &str,
        scope: CountScope,
    ) -> RolloutResult<TotalTargetCountStatus> {
        let total = match scope {
            CountScope::Rollout { rollout_id } => self.get_rollout(tenant, rollout_id)?.total_targets,
            CountScope::Group {
                rollout_id,
                group_id,
            } => self.get_group(tenant, rollout_id, group_id)?.total_targets,
        };
        let rows = self.store.status_counts(tenant, scope)?;
        Ok(TotalTargetCountStatus::from_rows(&rows, total)?)
    }

    /// Finished percentage of a group; an empty group counts as done.
    pub fn finished_percent(
        &self,
        tenant: &str,
        rollout_id: RolloutId,
        group_id: RolloutGroupId,
    ) -> RolloutResult<f64> {
        let counts = self.total_target_count_status(
            tenant,
            CountScope::Group {
                rollout_id,
                group_id,
            },
        )?;
        Ok(counts.finished_percent())
    }

    // ── Creation ───────────────────────────────────────────────────

    /// Validate and persist a rollout in CREATING. Groups are materialized
    /// by the next check.
    pub fn create_rollout(&self, tenant: &str, request: &CreateRollout) -> RolloutResult<Rollout> {
        let plan = request.plan()?;
        let now = epoch_secs();
        let mut rollout = Rollout {
            id: 0,
            tenant: tenant.to_string(),
            name: request.name.clone(),
            description: request.description.clone(),
            distribution_set: request.distribution_set.clone(),
            target_filter: request.target_filter.clone(),
            action_type: request.action_type,
            forced_time: request.forced_time,
            status: RolloutStatus::Creating,
            total_targets: plan.iter().map(|g| g.targets.len() as u64).sum(),
            rollout_groups_total: plan.len() as u32,
            rollout_groups_created: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_rollout(&mut rollout, &plan)?;
        info!(
            %tenant,
            rollout_id = rollout.id,
            groups = rollout.rollout_groups_total,
            targets = rollout.total_targets,
            "rollout created"
        );
        self.fire_rollout(&rollout);
        Ok(rollout)
    }

    /// Materialize the groups of a CREATING rollout and move it to READY.
    /// Any failure leaves it in ERROR_CREATING.
    pub fn handle_creating(&self, rollout: &Rollout) -> RolloutResult<()> {
        if let Err(e) = self.materialize_groups(rollout) {
            error!(
                tenant = %rollout.tenant,
                rollout_id = rollout.id,
                error = %e,
                "rollout group creation failed"
            );
            self.transition_rollout(rollout, &[RolloutStatus::Creating], RolloutStatus::ErrorCreating)?;
            return Err(e);
        }
        Ok(())
    }

    fn materialize_groups(&self, rollout: &Rollout) -> RolloutResult<()> {
        let tenant = rollout.tenant.as_str();
        let plan = self.store.get_rollout_plan(tenant, rollout.id)?;
        if plan.len() != rollout.rollout_groups_total as usize {
            return Err(RolloutError::InvalidGroups(format!(
                "stored plan has {} groups, rollout expects {}",
                plan.len(),
                rollout.rollout_groups_total
            )));
        }

        let existing = self.store.list_groups(tenant, rollout.id)?;
        let start = rollout.rollout_groups_created;
        let mut parent_id = existing
            .iter()
            .find(|g| g.position + 1 == start)
            .map(|g| g.id);

        for position in start..rollout.rollout_groups_total {
            let group_plan = &plan[position as usize];
            // A group may exist already when an earlier pass was interrupted.
            let group = match existing.iter().find(|g| g.position == position) {
                Some(group) => group.clone(),
                None => {
                    let now = epoch_secs();
                    let mut group = RolloutGroup {
                        id: 0,
                        rollout_id: rollout.id,
                        tenant: tenant.to_string(),
                        name: group_plan.name.clone(),
                        position,
                        parent_id,
                        status: RolloutGroupStatus::Ready,
                        total_targets: 0,
                        conditions: group_plan.conditions.clone(),
                        created_at: now,
                        updated_at: now,
                    };
                    self.store.insert_group(&mut group)?;
                    group
                }
            };

            for chunk in group_plan.targets.chunks(self.batch) {
                self.store
                    .add_group_targets(tenant, rollout.id, group.id, chunk)?;
            }
            let total = group_plan.targets.len() as u64;
            let group = self
                .store
                .update_group(tenant, rollout.id, group.id, |g| g.total_targets = total)?
                .ok_or_else(|| {
                    RolloutError::NotFound(format!("rollout group {tenant}/{}/{}", rollout.id, group.id))
                })?;
            self.fire_group(&group);
            parent_id = Some(group.id);

            let created = position + 1;
            self.store
                .update_rollout(tenant, rollout.id, |r| r.rollout_groups_created = created)?
                .ok_or_else(|| RolloutError::NotFound(format!("rollout {tenant}/{}", rollout.id)))?;
            debug!(
                %tenant,
                rollout_id = rollout.id,
                group_id = group.id,
                targets = group.total_targets,
                "rollout group materialized"
            );
        }

        self.store.delete_rollout_plan(tenant, rollout.id)?;
        if let Some(ready) =
            self.transition_rollout(rollout, &[RolloutStatus::Creating], RolloutStatus::Ready)?
        {
            info!(%tenant, rollout_id = ready.id, groups = ready.rollout_groups_created, "rollout ready");
        }
        Ok(())
    }

    // ── Operator commands ──────────────────────────────────────────

    /// READY → STARTING. Actions are created by the next check.
    pub fn start(&self, tenant: &str, rollout_id: RolloutId) -> RolloutResult<Rollout> {
        self.command(tenant, rollout_id, RolloutCommand::Start)
    }

    pub fn pause(&self, tenant: &str, rollout_id: RolloutId) -> RolloutResult<Rollout> {
        self.command(tenant, rollout_id, RolloutCommand::Pause)
    }

    pub fn resume(&self, tenant: &str, rollout_id: RolloutId) -> RolloutResult<Rollout> {
        self.command(tenant, rollout_id, RolloutCommand::Resume)
    }

    /// Stop the rollout and cancel every action that has not ended yet.
    pub fn stop(&self, tenant: &str, rollout_id: RolloutId) -> RolloutResult<Rollout> {
        let stopped = self.command(tenant, rollout_id, RolloutCommand::Stop)?;
        self.cancel_open_actions(tenant, rollout_id, "rollout stopped")?;
        Ok(stopped)
    }

    /// Start the next scheduled group of a RUNNING rollout right away.
    /// Groups already running keep running.
    pub fn trigger_next_group(&self, tenant: &str, rollout_id: RolloutId) -> RolloutResult<RolloutGroup> {
        let rollout = self.get_rollout(tenant, rollout_id)?;
        if rollout.status != RolloutStatus::Running {
            return Err(RolloutError::IllegalState {
                expected: "running",
                actual: rollout.status,
            });
        }
        let groups = self.store.list_groups(tenant, rollout_id)?;
        let next = machine::next_scheduled(&groups)
            .ok_or_else(|| RolloutError::NoScheduledGroup(format!("{tenant}/{rollout_id}")))?;
        // Lost a race with the periodic check starting the same group.
        if !self.start_group(next)? {
            return Err(RolloutError::NoScheduledGroup(format!("{tenant}/{rollout_id}")));
        }
        info!(%tenant, rollout_id, group_id = next.id, "next rollout group triggered");
        self.get_group(tenant, rollout_id, next.id)
    }

    /// Cancel the open actions of a rollout and remove it with everything it
    /// created. Rollouts still being created or started cannot be deleted.
    pub fn delete_rollout(&self, tenant: &str, rollout_id: RolloutId) -> RolloutResult<()> {
        let rollout = self.get_rollout(tenant, rollout_id)?;
        if matches!(
            rollout.status,
            RolloutStatus::Creating | RolloutStatus::Starting
        ) {
            return Err(RolloutError::IllegalState {
                expected: "not creating or starting",
                actual: rollout.status,
            });
        }
        self.cancel_open_actions(tenant, rollout_id, "rollout deleted")?;
        if !self.store.delete_rollout(tenant, rollout_id)? {
            return Err(RolloutError::NotFound(format!("rollout {tenant}/{rollout_id}")));
        }
        self.bus.fire(EntityEvent::RolloutDeleted {
            tenant: tenant.to_string(),
            rollout_id,
        });
        info!(%tenant, rollout_id, "rollout deleted");
        Ok(())
    }

    fn cancel_open_actions(
        &self,
        tenant: &str,
        rollout_id: RolloutId,
        reason: &str,
    ) -> RolloutResult<usize> {
        let open: Vec<ActionStatus> = ActionStatus::ALL
            .into_iter()
            .filter(|s| !s.is_terminal())
            .collect();
        let cancelled = self.store.switch_action_status(
            tenant,
            CountScope::Rollout { rollout_id },
            &open,
            ActionStatus::Canceled,
            false,
            reason,
        )?;
        for action in &cancelled {
            self.fire_action(action);
        }
        info!(%tenant, rollout_id, cancelled = cancelled.len(), "rollout actions cancelled");
        Ok(cancelled.len())
    }

    fn command(
        &self,
        tenant: &str,
        rollout_id: RolloutId,
        command: RolloutCommand,
    ) -> RolloutResult<Rollout> {
        let rollout = self.get_rollout(tenant, rollout_id)?;
        command.check(rollout.status)?;
        match self.transition_rollout(&rollout, command.allowed_from(), command.target())? {
            Some(updated) => {
                info!(%tenant, rollout_id, status = %updated.status, "rollout {:?}", command);
                Ok(updated)
            }
            // Lost a race with a concurrent transition.
            None => Err(command.illegal(self.get_rollout(tenant, rollout_id)?.status)),
        }
    }

    // ── Starting ───────────────────────────────────────────────────

    /// Create the actions of a STARTING rollout, activate its first group
    /// and move it to RUNNING. Any failure leaves it in ERROR_STARTING.
    pub fn handle_starting(&self, rollout: &Rollout) -> RolloutResult<()> {
        if let Err(e) = self.activate(rollout) {
            error!(
                tenant = %rollout.tenant,
                rollout_id = rollout.id,
                error = %e,
                "rollout start failed"
            );
            self.transition_rollout(rollout, &[RolloutStatus::Starting], RolloutStatus::ErrorStarting)?;
            return Err(e);
        }
        Ok(())
    }

    fn activate(&self, rollout: &Rollout) -> RolloutResult<()> {
        let tenant = rollout.tenant.as_str();
        let groups = self.store.list_groups(tenant, rollout.id)?;
        for group in groups
            .iter()
            .filter(|g| g.status == RolloutGroupStatus::Ready)
        {
            self.create_group_actions(rollout, group)?;
            if let Some(scheduled) = self.store.transition_group(
                tenant,
                rollout.id,
                group.id,
                RolloutGroupStatus::Ready,
                RolloutGroupStatus::Scheduled,
            )? {
                self.fire_group(&scheduled);
            }
        }

        let groups = self.store.list_groups(tenant, rollout.id)?;
        if !groups.iter().any(|g| g.status == RolloutGroupStatus::Running) {
            if let Some(first) = machine::next_scheduled(&groups) {
                self.start_group(first)?;
            }
        }

        if let Some(running) =
            self.transition_rollout(rollout, &[RolloutStatus::Starting], RolloutStatus::Running)?
        {
            info!(%tenant, rollout_id = running.id, "rollout running");
        }
        Ok(())
    }

    /// Create scheduled, inactive actions for the group's targets that have
    /// none yet. Older scheduled actions of the same targets are cancelled.
    fn create_group_actions(&self, rollout: &Rollout, group: &RolloutGroup) -> RolloutResult<usize> {
        let tenant = rollout.tenant.as_str();
        let link = RolloutRef {
            rollout_id: rollout.id,
            group_id: group.id,
        };
        let scope = CountScope::Group {
            rollout_id: rollout.id,
            group_id: group.id,
        };
        let existing: HashSet<TargetId> = self
            .store
            .list_actions(tenant, scope)?
            .into_iter()
            .map(|a| a.target_id)
            .collect();
        let targets: Vec<TargetId> = self
            .store
            .list_group_targets(tenant, rollout.id, group.id)?
            .into_iter()
            .filter(|t| !existing.contains(t))
            .collect();

        let mut created = 0;
        for chunk in targets.chunks(self.batch) {
            for cancelled in self.store.cancel_scheduled_actions_for_targets(tenant, chunk)? {
                self.fire_action(&cancelled);
            }

            let now = epoch_secs();
            let mut actions: Vec<Action> = chunk
                .iter()
                .map(|target_id| Action {
                    id: 0,
                    tenant: tenant.to_string(),
                    target_id: target_id.clone(),
                    distribution_set: rollout.distribution_set.clone(),
                    status: ActionStatus::Scheduled,
                    action_type: rollout.action_type,
                    forced_time: rollout.forced_time,
                    active: false,
                    download_progress_percent: 0,
                    rollout: Some(link),
                    created_at: now,
                    updated_at: now,
                })
                .collect();
            self.store.insert_actions(&mut actions)?;
            for action in &actions {
                self.bus.fire(EntityEvent::ActionCreated {
                    tenant: action.tenant.clone(),
                    action_id: action.id,
                    target_id: action.target_id.clone(),
                    rollout: action.rollout,
                });
            }
            created += actions.len();
        }
        debug!(%tenant, rollout_id = rollout.id, group_id = group.id, created, "group actions created");
        Ok(created)
    }

    /// SCHEDULED → RUNNING and activate the group's actions. Returns `false`
    /// when the group was not scheduled anymore.
    fn start_group(&self, group: &RolloutGroup) -> RolloutResult<bool> {
        let tenant = group.tenant.as_str();
        let Some(running) = self.store.transition_group(
            tenant,
            group.rollout_id,
            group.id,
            RolloutGroupStatus::Scheduled,
            RolloutGroupStatus::Running,
        )?
        else {
            return Ok(false);
        };
        self.fire_group(&running);

        let activated = self.store.switch_action_status(
            tenant,
            CountScope::Group {
                rollout_id: group.rollout_id,
                group_id: group.id,
            },
            &[ActionStatus::Scheduled],
            ActionStatus::Running,
            true,
            "rollout group started",
        )?;
        for action in &activated {
            self.fire_action(action);
        }
        info!(
            %tenant,
            rollout_id = group.rollout_id,
            group_id = group.id,
            actions = activated.len(),
            "rollout group started"
        );
        Ok(true)
    }

    /// Start the next scheduled group if the rollout is still running.
    fn start_next_group(&self, rollout: &Rollout) -> RolloutResult<()> {
        let current = self.get_rollout(&rollout.tenant, rollout.id)?;
        if current.status != RolloutStatus::Running {
            return Ok(());
        }
        let groups = self.store.list_groups(&rollout.tenant, rollout.id)?;
        if let Some(next) = machine::next_scheduled(&groups) {
            self.start_group(next)?;
        }
        Ok(())
    }

    // ── Running ────────────────────────────────────────────────────

    /// Evaluate every running group of a RUNNING rollout and apply the
    /// verdicts. Finishes the rollout once no group is left.
    pub fn check_running(&self, rollout: &Rollout) -> RolloutResult<()> {
        let tenant = rollout.tenant.as_str();
        let groups = self.sync_totals(rollout)?;

        for group in groups
            .iter()
            .filter(|g| g.status == RolloutGroupStatus::Running)
        {
            let scope = CountScope::Group {
                rollout_id: rollout.id,
                group_id: group.id,
            };
            let counts = self.total_target_count_status(tenant, scope)?;
            match machine::evaluate_group(&group.conditions, &counts)? {
                GroupVerdict::Pending => {
                    let rows = self.store.status_counts(tenant, scope)?;
                    if machine::all_actions_ended(&rows)? {
                        debug!(
                            %tenant,
                            rollout_id = rollout.id,
                            group_id = group.id,
                            "rollout group has no open actions left"
                        );
                        self.finish_group(rollout, group)?;
                    }
                }
                GroupVerdict::Succeeded => self.finish_group(rollout, group)?,
                GroupVerdict::Failed(action) => {
                    if let Some(failed) = self.store.transition_group(
                        tenant,
                        rollout.id,
                        group.id,
                        RolloutGroupStatus::Running,
                        RolloutGroupStatus::Error,
                    )? {
                        warn!(
                            %tenant,
                            rollout_id = rollout.id,
                            group_id = group.id,
                            ?action,
                            "rollout group error threshold reached"
                        );
                        self.fire_group(&failed);
                        match action {
                            ErrorAction::Pause => {
                                if self
                                    .transition_rollout(
                                        rollout,
                                        &[RolloutStatus::Running],
                                        RolloutStatus::Paused,
                                    )?
                                    .is_some()
                                {
                                    warn!(%tenant, rollout_id = rollout.id, "rollout paused on group error");
                                }
                            }
                            ErrorAction::Continue => self.start_next_group(rollout)?,
                        }
                    }
                }
            }
        }

        let current = self.get_rollout(tenant, rollout.id)?;
        if current.status != RolloutStatus::Running {
            return Ok(());
        }
        let groups = self.store.list_groups(tenant, rollout.id)?;
        if groups
            .iter()
            .any(|g| g.status == RolloutGroupStatus::Running)
        {
            return Ok(());
        }
        // Nothing running (e.g. after a resume): pick up the next group.
        if let Some(next) = machine::next_scheduled(&groups) {
            self.start_group(next)?;
            return Ok(());
        }
        if machine::is_complete(&groups) {
            if let Some(finished) =
                self.transition_rollout(&current, &[RolloutStatus::Running], RolloutStatus::Finished)?
            {
                info!(%tenant, rollout_id = finished.id, "rollout finished");
            }
        }
        Ok(())
    }

    /// RUNNING → FINISHED for a group, then move on to the next one.
    fn finish_group(&self, rollout: &Rollout, group: &RolloutGroup) -> RolloutResult<()> {
        if let Some(finished) = self.store.transition_group(
            &rollout.tenant,
            rollout.id,
            group.id,
            RolloutGroupStatus::Running,
            RolloutGroupStatus::Finished,
        )? {
            info!(tenant = %rollout.tenant, rollout_id = rollout.id, group_id = group.id, "rollout group finished");
            self.fire_group(&finished);
            self.start_next_group(rollout)?;
        }
        Ok(())
    }

    /// Correct group and rollout totals that drifted from the number of
    /// actions actually created. Returns the current groups.
    fn sync_totals(&self, rollout: &Rollout) -> RolloutResult<Vec<RolloutGroup>> {
        let tenant = rollout.tenant.as_str();
        let mut groups = self.store.list_groups(tenant, rollout.id)?;
        let mut drifted = false;
        for group in groups
            .iter_mut()
            .filter(|g| g.status != RolloutGroupStatus::Ready)
        {
            let actual = self.store.count_actions(
                tenant,
                CountScope::Group {
                    rollout_id: rollout.id,
                    group_id: group.id,
                },
            )?;
            if actual != group.total_targets {
                warn!(
                    %tenant,
                    rollout_id = rollout.id,
                    group_id = group.id,
                    stored = group.total_targets,
                    actual,
                    "rollout group total out of sync"
                );
                if let Some(updated) =
                    self.store
                        .update_group(tenant, rollout.id, group.id, |g| g.total_targets = actual)?
                {
                    *group = updated;
                    drifted = true;
                }
            }
        }

        if drifted {
            let total: u64 = groups.iter().map(|g| g.total_targets).sum();
            if let Some(updated) =
                self.store
                    .update_rollout(tenant, rollout.id, |r| r.total_targets = total)?
            {
                self.fire_rollout(&updated);
            }
        }
        Ok(groups)
    }

    // ── Device reports ─────────────────────────────────────────────

    /// Record a status report from a device. `download_progress_percent` is
    /// only kept for DOWNLOAD reports.
    pub fn report_action_status(
        &self,
        tenant: &str,
        action_id: ActionId,
        status: ActionStatus,
        messages: &[String],
        download_progress_percent: Option<u8>,
    ) -> RolloutResult<Action> {
        let entry = ActionStatusEntry::new(action_id, status, epoch_millis(), messages);
        let progress = download_progress_percent.filter(|_| status == ActionStatus::Download);
        let action = self.store.append_action_status(tenant, &entry, progress)?;

        self.bus.fire(EntityEvent::ActionStatusAppended {
            tenant: tenant.to_string(),
            action_id,
            status,
            rollout: action.rollout,
        });
        self.fire_action(&action);
        debug!(%tenant, action_id, %status, "action status reported");
        Ok(action)
    }

    // ── Periodic checks ────────────────────────────────────────────

    /// One pass over every rollout of every tenant that needs attention.
    /// Failures are logged per rollout. Returns how many were visited.
    pub fn check_all(&self) -> usize {
        let mut visited = 0;
        for status in [
            RolloutStatus::Creating,
            RolloutStatus::Starting,
            RolloutStatus::Running,
        ] {
            let rollouts = match self.store.list_rollouts_in_status(status) {
                Ok(rollouts) => rollouts,
                Err(e) => {
                    error!(%status, error = %e, "failed to list rollouts");
                    continue;
                }
            };
            for rollout in rollouts {
                let result = match status {
                    RolloutStatus::Creating => self.handle_creating(&rollout),
                    RolloutStatus::Starting => self.handle_starting(&rollout),
                    _ => self.check_running(&rollout),
                };
                if let Err(e) = result {
                    error!(
                        tenant = %rollout.tenant,
                        rollout_id = rollout.id,
                        %status,
                        error = %e,
                        "rollout check failed"
                    );
                }
                visited += 1;
            }
        }
        visited
    }

    /// Run `check_all` every `interval` until `shutdown` fires.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "rollout executor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let visited = self.check_all();
                    if visited > 0 {
                        debug!(visited, "rollout check pass completed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("rollout executor shutting down");
                    break;
                }
            }
        }
    }

    // ── Events ─────────────────────────────────────────────────────

    fn transition_rollout(
        &self,
        rollout: &Rollout,
        from: &[RolloutStatus],
        to: RolloutStatus,
    ) -> RolloutResult<Option<Rollout>> {
        let updated = self
            .store
            .transition_rollout(&rollout.tenant, rollout.id, from, to)?;
        if let Some(updated) = &updated {
            self.fire_rollout(updated);
        }
        Ok(updated)
    }

    fn fire_rollout(&self, rollout: &Rollout) {
        self.bus.fire(EntityEvent::RolloutUpdated {
            tenant: rollout.tenant.clone(),
            rollout_id: rollout.id,
            status: rollout.status,
        });
    }

    fn fire_group(&self, group: &RolloutGroup) {
        self.bus.fire(EntityEvent::RolloutGroupUpdated {
            tenant: group.tenant.clone(),
            rollout_id: group.rollout_id,
            group_id: group.id,
            status: group.status,
        });
    }

    fn fire_action(&self, action: &Action) {
        self.bus.fire(EntityEvent::ActionUpdated {
            tenant: action.tenant.clone(),
            action_id: action.id,
            status: action.status,
            rollout: action.rollout,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::count::TargetCountBucket;
    use fleetgrid_state::StateError;
    use tokio::sync::broadcast;

    const TENANT: &str = "acme";

    fn executor() -> RolloutExecutor {
        let store = StateStore::open_in_memory().unwrap();
        RolloutExecutor::new(store, EventBus::new(65_536), 7)
    }

    fn targets(prefix: &str, n: usize) -> Vec<TargetId> {
        (0..n).map(|i| format!("{prefix}-{i:03}")).collect()
    }

    fn request(groups: Vec<GroupDefinition>) -> CreateRollout {
        CreateRollout {
            name: "firmware 2.0".into(),
            description: None,
            distribution_set: "fw:2.0".into(),
            target_filter: "type==sensor".into(),
            action_type: ActionType::Forced,
            forced_time: NO_FORCE_TIME,
            conditions: ConditionSpec::default(),
            groups,
            amount_groups: None,
            targets: Vec::new(),
        }
    }

    fn group_def(targets: Vec<TargetId>, conditions: ConditionSpec) -> GroupDefinition {
        GroupDefinition {
            name: None,
            targets,
            conditions,
        }
    }

    fn success(exp: &str) -> ConditionSpec {
        ConditionSpec {
            success_threshold: Some(exp.into()),
            ..Default::default()
        }
    }

    fn with_error(exp: &str, action: ErrorAction) -> ConditionSpec {
        ConditionSpec {
            success_threshold: Some("100".into()),
            error_threshold: Some(exp.into()),
            error_action: Some(action),
        }
    }

    /// Create, materialize, start and activate a rollout.
    fn running_rollout(exec: &RolloutExecutor, groups: Vec<GroupDefinition>) -> Rollout {
        let rollout = exec.create_rollout(TENANT, &request(groups)).unwrap();
        exec.handle_creating(&rollout).unwrap();
        let starting = exec.start(TENANT, rollout.id).unwrap();
        exec.handle_starting(&starting).unwrap();
        exec.get_rollout(TENANT, rollout.id).unwrap()
    }

    fn group_actions(exec: &RolloutExecutor, group: &RolloutGroup) -> Vec<Action> {
        exec.store()
            .list_actions(
                TENANT,
                CountScope::Group {
                    rollout_id: group.rollout_id,
                    group_id: group.id,
                },
            )
            .unwrap()
    }

    fn report_all(exec: &RolloutExecutor, actions: &[Action], status: ActionStatus) {
        for action in actions {
            exec.report_action_status(TENANT, action.id, status, &[], None)
                .unwrap();
        }
    }

    fn drain(rx: &mut broadcast::Receiver<EntityEvent>) -> Vec<EntityEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // ── Creation ───────────────────────────────────────────────────

    #[test]
    fn create_rejects_bad_requests() {
        let exec = executor();

        let none = request(Vec::new());
        assert!(matches!(
            exec.create_rollout(TENANT, &none),
            Err(RolloutError::InvalidGroups(_))
        ));

        let mut both = request(vec![group_def(targets("a", 2), ConditionSpec::default())]);
        both.amount_groups = Some(2);
        assert!(matches!(
            exec.create_rollout(TENANT, &both),
            Err(RolloutError::InvalidGroups(_))
        ));

        let overlapping = request(vec![
            group_def(targets("a", 2), ConditionSpec::default()),
            group_def(targets("a", 1), ConditionSpec::default()),
        ]);
        assert!(matches!(
            exec.create_rollout(TENANT, &overlapping),
            Err(RolloutError::InvalidGroups(_))
        ));

        let empty_group = request(vec![group_def(Vec::new(), ConditionSpec::default())]);
        assert!(exec.create_rollout(TENANT, &empty_group).is_err());

        let mut too_many = request(Vec::new());
        too_many.amount_groups = Some(501);
        too_many.targets = targets("t", 600);
        assert!(matches!(
            exec.create_rollout(TENANT, &too_many),
            Err(RolloutError::InvalidGroups(_))
        ));

        let bad_condition = request(vec![group_def(targets("a", 1), success("most"))]);
        assert!(matches!(
            exec.create_rollout(TENANT, &bad_condition),
            Err(RolloutError::InvalidCondition { .. })
        ));

        let mut unnamed = request(vec![group_def(targets("a", 1), ConditionSpec::default())]);
        unnamed.name = "  ".into();
        assert!(matches!(
            exec.create_rollout(TENANT, &unnamed),
            Err(RolloutError::InvalidRequest(_))
        ));

        assert!(exec.list_rollouts(TENANT).unwrap().is_empty());
    }

    #[test]
    fn creating_materializes_groups() {
        let exec = executor();
        let mut req = request(Vec::new());
        req.amount_groups = Some(3);
        req.targets = targets("dev", 20);
        req.conditions = with_error("10", ErrorAction::Continue);

        let rollout = exec.create_rollout(TENANT, &req).unwrap();
        assert_eq!(rollout.status, RolloutStatus::Creating);
        assert_eq!(rollout.total_targets, 20);
        assert_eq!(rollout.rollout_groups_total, 3);

        exec.handle_creating(&rollout).unwrap();
        let ready = exec.get_rollout(TENANT, rollout.id).unwrap();
        assert_eq!(ready.status, RolloutStatus::Ready);
        assert_eq!(ready.rollout_groups_created, 3);

        let groups = exec.list_groups(TENANT, rollout.id).unwrap();
        let totals: Vec<u64> = groups.iter().map(|g| g.total_targets).collect();
        assert_eq!(totals, vec![7, 7, 6]);
        assert!(groups.iter().all(|g| g.status == RolloutGroupStatus::Ready));
        assert_eq!(groups[0].parent_id, None);
        assert_eq!(groups[1].parent_id, Some(groups[0].id));
        assert_eq!(groups[2].conditions.error_action, Some(ErrorAction::Continue));
        assert_eq!(
            exec.store()
                .list_group_targets(TENANT, rollout.id, groups[2].id)
                .unwrap()
                .len(),
            6
        );
        assert!(exec.store().get_rollout_plan(TENANT, rollout.id).unwrap().is_empty());

        // Nothing assigned yet: the whole rollout is not started.
        let counts = exec
            .total_target_count_status(TENANT, CountScope::Rollout { rollout_id: rollout.id })
            .unwrap();
        assert_eq!(counts, TotalTargetCountStatus::not_started(20));
    }

    #[test]
    fn lost_plan_fails_creation() {
        let exec = executor();
        let rollout = exec
            .create_rollout(
                TENANT,
                &request(vec![group_def(targets("a", 3), ConditionSpec::default())]),
            )
            .unwrap();
        exec.store().delete_rollout_plan(TENANT, rollout.id).unwrap();

        assert!(exec.handle_creating(&rollout).is_err());
        assert_eq!(
            exec.get_rollout(TENANT, rollout.id).unwrap().status,
            RolloutStatus::ErrorCreating
        );
    }

    // ── Commands ───────────────────────────────────────────────────

    #[test]
    fn commands_require_matching_status() {
        let exec = executor();
        let rollout = exec
            .create_rollout(
                TENANT,
                &request(vec![group_def(targets("a", 3), ConditionSpec::default())]),
            )
            .unwrap();

        assert!(matches!(
            exec.start(TENANT, rollout.id),
            Err(RolloutError::IllegalState {
                actual: RolloutStatus::Creating,
                ..
            })
        ));
        assert!(matches!(
            exec.pause(TENANT, 999),
            Err(RolloutError::NotFound(_))
        ));

        exec.handle_creating(&rollout).unwrap();
        assert!(exec.resume(TENANT, rollout.id).is_err());
        assert_eq!(
            exec.start(TENANT, rollout.id).unwrap().status,
            RolloutStatus::Starting
        );
        assert!(exec.start(TENANT, rollout.id).is_err());
    }

    #[test]
    fn pause_and_resume() {
        let exec = executor();
        let rollout = running_rollout(
            &exec,
            vec![group_def(targets("a", 2), ConditionSpec::default())],
        );

        assert_eq!(exec.pause(TENANT, rollout.id).unwrap().status, RolloutStatus::Paused);
        assert!(exec.pause(TENANT, rollout.id).is_err());
        assert_eq!(exec.resume(TENANT, rollout.id).unwrap().status, RolloutStatus::Running);
    }

    // ── Starting ───────────────────────────────────────────────────

    #[test]
    fn starting_schedules_actions_and_runs_first_group() {
        let exec = executor();
        let rollout = running_rollout(
            &exec,
            vec![
                group_def(targets("a", 10), ConditionSpec::default()),
                group_def(targets("b", 5), ConditionSpec::default()),
            ],
        );
        assert_eq!(rollout.status, RolloutStatus::Running);

        let groups = exec.list_groups(TENANT, rollout.id).unwrap();
        assert_eq!(groups[0].status, RolloutGroupStatus::Running);
        assert_eq!(groups[1].status, RolloutGroupStatus::Scheduled);

        let first = group_actions(&exec, &groups[0]);
        assert_eq!(first.len(), 10);
        assert!(first.iter().all(|a| a.active && a.status == ActionStatus::Running));
        let second = group_actions(&exec, &groups[1]);
        assert_eq!(second.len(), 5);
        assert!(second.iter().all(|a| !a.active && a.status == ActionStatus::Scheduled));
        assert!(second.iter().all(|a| a.action_type == ActionType::Forced));

        let counts = exec
            .total_target_count_status(TENANT, CountScope::Rollout { rollout_id: rollout.id })
            .unwrap();
        assert_eq!(counts.count(TargetCountBucket::Running), 10);
        assert_eq!(counts.count(TargetCountBucket::Ready), 5);
        assert_eq!(counts.sum(), counts.total_targets());
    }

    #[test]
    fn newer_rollout_cancels_scheduled_actions() {
        let exec = executor();
        let older = running_rollout(
            &exec,
            vec![
                group_def(targets("a", 2), ConditionSpec::default()),
                group_def(targets("b", 2), ConditionSpec::default()),
            ],
        );
        // Targets b-* are still scheduled in the older rollout.
        let newer = running_rollout(
            &exec,
            vec![group_def(targets("b", 2), ConditionSpec::default())],
        );
        assert_eq!(newer.status, RolloutStatus::Running);

        let older_groups = exec.list_groups(TENANT, older.id).unwrap();
        let replaced = group_actions(&exec, &older_groups[1]);
        assert!(replaced.iter().all(|a| a.status == ActionStatus::Canceled && !a.active));

        let counts = exec
            .total_target_count_status(
                TENANT,
                CountScope::Group {
                    rollout_id: older.id,
                    group_id: older_groups[1].id,
                },
            )
            .unwrap();
        assert_eq!(counts.count(TargetCountBucket::Cancelled), 2);
    }

    #[test]
    fn group_with_only_cancelled_actions_does_not_stall() {
        let exec = executor();
        let older = running_rollout(
            &exec,
            vec![
                group_def(targets("a", 2), ConditionSpec::default()),
                group_def(targets("b", 2), ConditionSpec::default()),
            ],
        );
        running_rollout(
            &exec,
            vec![group_def(targets("b", 2), ConditionSpec::default())],
        );
        let groups = exec.list_groups(TENANT, older.id).unwrap();
        report_all(&exec, &group_actions(&exec, &groups[0]), ActionStatus::Finished);

        // First pass finishes group 1 and starts group 2, whose actions were
        // all replaced by the newer rollout.
        exec.check_running(&older).unwrap();
        assert_eq!(
            exec.get_group(TENANT, older.id, groups[1].id).unwrap().status,
            RolloutGroupStatus::Running
        );

        exec.check_running(&older).unwrap();
        assert_eq!(
            exec.get_group(TENANT, older.id, groups[1].id).unwrap().status,
            RolloutGroupStatus::Finished
        );
        assert_eq!(
            exec.get_rollout(TENANT, older.id).unwrap().status,
            RolloutStatus::Finished
        );
    }

    #[test]
    fn group_with_open_cancellation_keeps_running() {
        let exec = executor();
        let rollout = running_rollout(&exec, vec![group_def(targets("a", 2), success("100"))]);
        let group = exec.list_groups(TENANT, rollout.id).unwrap().remove(0);
        let actions = group_actions(&exec, &group);
        exec.report_action_status(TENANT, actions[0].id, ActionStatus::Canceled, &[], None)
            .unwrap();
        exec.report_action_status(TENANT, actions[1].id, ActionStatus::Canceling, &[], None)
            .unwrap();

        exec.check_running(&rollout).unwrap();
        assert_eq!(
            exec.get_group(TENANT, rollout.id, group.id).unwrap().status,
            RolloutGroupStatus::Running
        );

        exec.report_action_status(TENANT, actions[1].id, ActionStatus::Canceled, &[], None)
            .unwrap();
        exec.check_running(&rollout).unwrap();
        assert_eq!(
            exec.get_rollout(TENANT, rollout.id).unwrap().status,
            RolloutStatus::Finished
        );
    }

    // ── Running ────────────────────────────────────────────────────

    #[test]
    fn group_finishes_at_success_threshold() {
        let exec = executor();
        let rollout = running_rollout(&exec, vec![group_def(targets("d", 100), success(">=75%"))]);
        let group = exec.list_groups(TENANT, rollout.id).unwrap().remove(0);
        let actions = group_actions(&exec, &group);

        report_all(&exec, &actions[..80], ActionStatus::Finished);
        report_all(&exec, &actions[95..], ActionStatus::Error);

        let counts = exec
            .total_target_count_status(
                TENANT,
                CountScope::Group {
                    rollout_id: rollout.id,
                    group_id: group.id,
                },
            )
            .unwrap();
        assert_eq!(counts.count(TargetCountBucket::Finished), 80);
        assert_eq!(counts.count(TargetCountBucket::Running), 15);
        assert_eq!(counts.count(TargetCountBucket::Error), 5);

        exec.check_running(&rollout).unwrap();
        assert_eq!(
            exec.get_group(TENANT, rollout.id, group.id).unwrap().status,
            RolloutGroupStatus::Finished
        );
        assert_eq!(
            exec.get_rollout(TENANT, rollout.id).unwrap().status,
            RolloutStatus::Finished
        );
    }

    #[test]
    fn below_threshold_keeps_running() {
        let exec = executor();
        let rollout = running_rollout(&exec, vec![group_def(targets("d", 4), success("75"))]);
        let group = exec.list_groups(TENANT, rollout.id).unwrap().remove(0);
        report_all(&exec, &group_actions(&exec, &group)[..2], ActionStatus::Finished);

        exec.check_running(&rollout).unwrap();
        assert_eq!(
            exec.get_group(TENANT, rollout.id, group.id).unwrap().status,
            RolloutGroupStatus::Running
        );
        assert_eq!(exec.finished_percent(TENANT, rollout.id, group.id).unwrap(), 50.0);
    }

    #[test]
    fn success_advances_exactly_once() {
        let exec = executor();
        let rollout = running_rollout(
            &exec,
            vec![
                group_def(targets("a", 4), success("50")),
                group_def(targets("b", 4), success("100")),
            ],
        );
        let groups = exec.list_groups(TENANT, rollout.id).unwrap();
        report_all(&exec, &group_actions(&exec, &groups[0])[..2], ActionStatus::Finished);

        let mut events = exec.bus.subscribe_entities();
        for _ in 0..100 {
            exec.check_running(&rollout).unwrap();
        }

        let transitions: Vec<EntityEvent> = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, EntityEvent::RolloutGroupUpdated { .. }))
            .collect();
        assert_eq!(
            transitions,
            vec![
                EntityEvent::RolloutGroupUpdated {
                    tenant: TENANT.into(),
                    rollout_id: rollout.id,
                    group_id: groups[0].id,
                    status: RolloutGroupStatus::Finished,
                },
                EntityEvent::RolloutGroupUpdated {
                    tenant: TENANT.into(),
                    rollout_id: rollout.id,
                    group_id: groups[1].id,
                    status: RolloutGroupStatus::Running,
                },
            ]
        );
        let second = group_actions(&exec, &groups[1]);
        assert!(second.iter().all(|a| a.active && a.status == ActionStatus::Running));
    }

    #[test]
    fn error_action_fires_once() {
        let exec = executor();
        let rollout = running_rollout(
            &exec,
            vec![
                group_def(targets("a", 100), with_error(">=5%", ErrorAction::Pause)),
                group_def(targets("b", 10), ConditionSpec::default()),
            ],
        );
        let groups = exec.list_groups(TENANT, rollout.id).unwrap();
        report_all(&exec, &group_actions(&exec, &groups[0])[..10], ActionStatus::Error);

        let mut events = exec.bus.subscribe_entities();
        for _ in 0..1000 {
            exec.check_running(&rollout).unwrap();
        }

        let pauses = drain(&mut events)
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    EntityEvent::RolloutUpdated {
                        status: RolloutStatus::Paused,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(pauses, 1);
        assert_eq!(
            exec.get_group(TENANT, rollout.id, groups[0].id).unwrap().status,
            RolloutGroupStatus::Error
        );
        assert_eq!(
            exec.get_group(TENANT, rollout.id, groups[1].id).unwrap().status,
            RolloutGroupStatus::Scheduled
        );

        // After the operator resumes, the next group picks up.
        let resumed = exec.resume(TENANT, rollout.id).unwrap();
        exec.check_running(&resumed).unwrap();
        assert_eq!(
            exec.get_group(TENANT, rollout.id, groups[1].id).unwrap().status,
            RolloutGroupStatus::Running
        );
    }

    #[test]
    fn error_with_continue_starts_next_group() {
        let exec = executor();
        let rollout = running_rollout(
            &exec,
            vec![
                group_def(targets("a", 10), with_error("20", ErrorAction::Continue)),
                group_def(targets("b", 10), ConditionSpec::default()),
            ],
        );
        let groups = exec.list_groups(TENANT, rollout.id).unwrap();
        report_all(&exec, &group_actions(&exec, &groups[0])[..3], ActionStatus::Error);

        exec.check_running(&rollout).unwrap();
        let after = exec.list_groups(TENANT, rollout.id).unwrap();
        assert_eq!(after[0].status, RolloutGroupStatus::Error);
        assert_eq!(after[1].status, RolloutGroupStatus::Running);
        assert_eq!(
            exec.get_rollout(TENANT, rollout.id).unwrap().status,
            RolloutStatus::Running
        );

        report_all(&exec, &group_actions(&exec, &after[1]), ActionStatus::Finished);
        exec.check_running(&rollout).unwrap();
        assert_eq!(
            exec.get_rollout(TENANT, rollout.id).unwrap().status,
            RolloutStatus::Finished
        );
    }

    #[test]
    fn totals_resync_with_actions() {
        let exec = executor();
        let rollout = running_rollout(&exec, vec![group_def(targets("a", 4), success("100"))]);
        let group = exec.list_groups(TENANT, rollout.id).unwrap().remove(0);
        exec.store()
            .update_group(TENANT, rollout.id, group.id, |g| g.total_targets = 9)
            .unwrap();

        exec.check_running(&rollout).unwrap();
        assert_eq!(exec.get_group(TENANT, rollout.id, group.id).unwrap().total_targets, 4);
        assert_eq!(exec.get_rollout(TENANT, rollout.id).unwrap().total_targets, 4);
    }

    #[test]
    fn total_resync_keeps_concurrent_pause() {
        let exec = executor();
        let rollout = running_rollout(&exec, vec![group_def(targets("a", 4), success("100"))]);
        let group = exec.list_groups(TENANT, rollout.id).unwrap().remove(0);
        exec.store()
            .update_group(TENANT, rollout.id, group.id, |g| g.total_targets = 9)
            .unwrap();

        // The check works from a snapshot taken before the operator paused.
        exec.pause(TENANT, rollout.id).unwrap();
        exec.check_running(&rollout).unwrap();

        let current = exec.get_rollout(TENANT, rollout.id).unwrap();
        assert_eq!(current.status, RolloutStatus::Paused);
        assert_eq!(current.total_targets, 4);
        assert_eq!(exec.get_group(TENANT, rollout.id, group.id).unwrap().total_targets, 4);
    }

    #[test]
    fn stop_cancels_open_actions() {
        let exec = executor();
        let rollout = running_rollout(
            &exec,
            vec![
                group_def(targets("a", 4), ConditionSpec::default()),
                group_def(targets("b", 4), ConditionSpec::default()),
            ],
        );
        let groups = exec.list_groups(TENANT, rollout.id).unwrap();
        report_all(&exec, &group_actions(&exec, &groups[0])[..1], ActionStatus::Finished);

        let stopped = exec.stop(TENANT, rollout.id).unwrap();
        assert_eq!(stopped.status, RolloutStatus::Stopped);

        let counts = exec
            .total_target_count_status(TENANT, CountScope::Rollout { rollout_id: rollout.id })
            .unwrap();
        assert_eq!(counts.count(TargetCountBucket::Finished), 1);
        assert_eq!(counts.count(TargetCountBucket::Cancelled), 7);
        assert_eq!(counts.count(TargetCountBucket::Error), 0);

        assert!(matches!(
            exec.stop(TENANT, rollout.id),
            Err(RolloutError::IllegalState { .. })
        ));
    }

    #[test]
    fn trigger_next_group_starts_scheduled_groups_early() {
        let exec = executor();
        let rollout = running_rollout(
            &exec,
            vec![
                group_def(targets("a", 2), success("100")),
                group_def(targets("b", 2), success("100")),
                group_def(targets("c", 2), success("100")),
            ],
        );
        let groups = exec.list_groups(TENANT, rollout.id).unwrap();

        let second = exec.trigger_next_group(TENANT, rollout.id).unwrap();
        assert_eq!(second.id, groups[1].id);
        assert_eq!(second.status, RolloutGroupStatus::Running);
        assert!(group_actions(&exec, &second)
            .iter()
            .all(|a| a.active && a.status == ActionStatus::Running));
        assert_eq!(
            exec.get_group(TENANT, rollout.id, groups[0].id).unwrap().status,
            RolloutGroupStatus::Running
        );

        exec.pause(TENANT, rollout.id).unwrap();
        assert!(matches!(
            exec.trigger_next_group(TENANT, rollout.id),
            Err(RolloutError::IllegalState {
                actual: RolloutStatus::Paused,
                ..
            })
        ));
        exec.resume(TENANT, rollout.id).unwrap();

        let third = exec.trigger_next_group(TENANT, rollout.id).unwrap();
        assert_eq!(third.id, groups[2].id);
        assert!(matches!(
            exec.trigger_next_group(TENANT, rollout.id),
            Err(RolloutError::NoScheduledGroup(_))
        ));
        assert!(matches!(
            exec.trigger_next_group(TENANT, 4242),
            Err(RolloutError::NotFound(_))
        ));
    }

    #[test]
    fn trigger_next_group_requires_running_rollout() {
        let exec = executor();
        let rollout = exec
            .create_rollout(
                TENANT,
                &request(vec![
                    group_def(targets("a", 1), ConditionSpec::default()),
                    group_def(targets("b", 1), ConditionSpec::default()),
                ]),
            )
            .unwrap();
        exec.handle_creating(&rollout).unwrap();
        assert!(matches!(
            exec.trigger_next_group(TENANT, rollout.id),
            Err(RolloutError::IllegalState {
                actual: RolloutStatus::Ready,
                ..
            })
        ));
    }

    #[test]
    fn delete_cancels_and_removes_rollout() {
        let exec = executor();
        let rollout = running_rollout(
            &exec,
            vec![
                group_def(targets("a", 2), ConditionSpec::default()),
                group_def(targets("b", 2), ConditionSpec::default()),
            ],
        );
        let groups = exec.list_groups(TENANT, rollout.id).unwrap();
        let first = group_actions(&exec, &groups[0]);
        report_all(&exec, &first[..1], ActionStatus::Finished);
        let mut events = exec.bus.subscribe_entities();

        exec.delete_rollout(TENANT, rollout.id).unwrap();

        let fired = drain(&mut events);
        let cancelled = fired
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    EntityEvent::ActionUpdated {
                        status: ActionStatus::Canceled,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(cancelled, 3);
        assert_eq!(
            fired.last(),
            Some(&EntityEvent::RolloutDeleted {
                tenant: TENANT.into(),
                rollout_id: rollout.id,
            })
        );

        assert!(matches!(
            exec.get_rollout(TENANT, rollout.id),
            Err(RolloutError::NotFound(_))
        ));
        assert!(exec.store().get_action(TENANT, first[0].id).unwrap().is_none());
        assert!(exec.store().list_actions_for_target(TENANT, "b-000").unwrap().is_empty());
        assert!(matches!(
            exec.delete_rollout(TENANT, rollout.id),
            Err(RolloutError::NotFound(_))
        ));
        // Nothing left for the periodic check to visit.
        assert_eq!(exec.check_all(), 0);
    }

    #[test]
    fn delete_waits_for_creation() {
        let exec = executor();
        let rollout = exec
            .create_rollout(
                TENANT,
                &request(vec![group_def(targets("a", 2), ConditionSpec::default())]),
            )
            .unwrap();
        assert!(matches!(
            exec.delete_rollout(TENANT, rollout.id),
            Err(RolloutError::IllegalState {
                actual: RolloutStatus::Creating,
                ..
            })
        ));

        exec.handle_creating(&rollout).unwrap();
        let group = exec.list_groups(TENANT, rollout.id).unwrap().remove(0);
        assert_eq!(
            exec.list_group_targets(TENANT, rollout.id, group.id).unwrap(),
            targets("a", 2)
        );
        exec.delete_rollout(TENANT, rollout.id).unwrap();
        assert!(exec.list_rollouts(TENANT).unwrap().is_empty());
        assert!(matches!(
            exec.list_group_targets(TENANT, rollout.id, group.id),
            Err(RolloutError::NotFound(_))
        ));
    }

    // ── Device reports ─────────────────────────────────────────────

    #[test]
    fn unstarted_group_refuses_device_reports() {
        let exec = executor();
        let rollout = running_rollout(
            &exec,
            vec![
                group_def(targets("a", 2), success("100")),
                group_def(targets("b", 2), success("100")),
            ],
        );
        let groups = exec.list_groups(TENANT, rollout.id).unwrap();
        let waiting = group_actions(&exec, &groups[1]);

        let err = exec
            .report_action_status(TENANT, waiting[0].id, ActionStatus::Finished, &[], None)
            .unwrap_err();
        assert!(matches!(
            err,
            RolloutError::State(StateError::IllegalTransition(_))
        ));
        let counts = exec
            .total_target_count_status(
                TENANT,
                CountScope::Group {
                    rollout_id: rollout.id,
                    group_id: groups[1].id,
                },
            )
            .unwrap();
        assert_eq!(counts.count(TargetCountBucket::Ready), 2);
        assert_eq!(counts.count(TargetCountBucket::Finished), 0);

        let running = group_actions(&exec, &groups[0]);
        assert!(matches!(
            exec.report_action_status(TENANT, running[0].id, ActionStatus::Scheduled, &[], None),
            Err(RolloutError::State(StateError::IllegalTransition(_)))
        ));

        // The second group still starts and takes reports once it runs.
        report_all(&exec, &running, ActionStatus::Finished);
        exec.check_running(&rollout).unwrap();
        let started = group_actions(&exec, &groups[1]);
        assert!(started.iter().all(|a| a.active && a.status == ActionStatus::Running));
        report_all(&exec, &started, ActionStatus::Finished);
    }

    #[test]
    fn status_reports_are_monotonic() {
        let exec = executor();
        let rollout = running_rollout(&exec, vec![group_def(targets("a", 1), success("100"))]);
        let group = exec.list_groups(TENANT, rollout.id).unwrap().remove(0);
        let action = group_actions(&exec, &group).remove(0);

        let downloading = exec
            .report_action_status(
                TENANT,
                action.id,
                ActionStatus::Download,
                &["fetching".into()],
                Some(40),
            )
            .unwrap();
        assert_eq!(downloading.download_progress_percent, 40);

        let retrieved = exec
            .report_action_status(TENANT, action.id, ActionStatus::Retrieved, &[], Some(90))
            .unwrap();
        assert_eq!(retrieved.download_progress_percent, 40);

        let done = exec
            .report_action_status(TENANT, action.id, ActionStatus::Finished, &["x".repeat(600)], None)
            .unwrap();
        assert!(!done.active);

        let err = exec
            .report_action_status(TENANT, action.id, ActionStatus::Running, &[], None)
            .unwrap_err();
        assert!(matches!(
            err,
            RolloutError::State(StateError::IllegalTransition(_))
        ));

        let history = exec.store().list_action_history(TENANT, action.id).unwrap();
        assert_eq!(history.last().unwrap().messages.len(), 2);

        assert!(matches!(
            exec.report_action_status(TENANT, 4242, ActionStatus::Running, &[], None),
            Err(RolloutError::State(StateError::NotFound(_)))
        ));
    }

    // ── Periodic checks ────────────────────────────────────────────

    #[test]
    fn check_all_drives_lifecycle() {
        let exec = executor();
        let rollout = exec
            .create_rollout(
                TENANT,
                &request(vec![group_def(targets("a", 3), success("100"))]),
            )
            .unwrap();

        assert_eq!(exec.check_all(), 1);
        assert_eq!(
            exec.get_rollout(TENANT, rollout.id).unwrap().status,
            RolloutStatus::Ready
        );

        exec.start(TENANT, rollout.id).unwrap();
        exec.check_all();
        let running = exec.get_rollout(TENANT, rollout.id).unwrap();
        assert_eq!(running.status, RolloutStatus::Running);

        let group = exec.list_groups(TENANT, rollout.id).unwrap().remove(0);
        report_all(&exec, &group_actions(&exec, &group), ActionStatus::Finished);
        exec.check_all();
        assert_eq!(
            exec.get_rollout(TENANT, rollout.id).unwrap().status,
            RolloutStatus::Finished
        );
        assert_eq!(exec.check_all(), 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let exec = executor();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let exec = exec.clone();
            tokio::spawn(async move { exec.run(Duration::from_millis(10), shutdown_rx).await })
        };
        let rollout = exec
            .create_rollout(
                TENANT,
                &request(vec![group_def(targets("a", 2), ConditionSpec::default())]),
            )
            .unwrap();

        for _ in 0..200 {
            if exec.get_rollout(TENANT, rollout.id).unwrap().status == RolloutStatus::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            exec.get_rollout(TENANT, rollout.id).unwrap().status,
            RolloutStatus::Ready
        );

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
