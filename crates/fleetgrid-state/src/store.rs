//! StateStore — redb-backed persistence for FleetGrid.
//!
//! Provides typed operations over rollouts, rollout groups, group target
//! membership, actions and action status history. All records are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! Every multi-record change (action status update + history append + status
//! index, guarded status transitions) runs inside a single write transaction;
//! redb serializes writers, so the `transition_*` methods behave as
//! compare-and-set.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use fleet_core::count::ActionStatusCount;
use fleet_core::types::*;

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Scope of a target count query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CountScope {
    Rollout {
        rollout_id: RolloutId,
    },
    Group {
        rollout_id: RolloutId,
        group_id: RolloutGroupId,
    },
}

impl CountScope {
    fn index_prefix(&self, tenant: &str) -> String {
        match *self {
            CountScope::Rollout { rollout_id } => format!("{}/", rollout_key(tenant, rollout_id)),
            CountScope::Group {
                rollout_id,
                group_id,
            } => format!("{}/", group_key(tenant, rollout_id, group_id)),
        }
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUT_PLANS).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
        txn.open_table(GROUP_TARGETS).map_err(map_err!(Table))?;
        txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        txn.open_table(ACTION_STATUS).map_err(map_err!(Table))?;
        txn.open_table(ACTION_STATUS_INDEX).map_err(map_err!(Table))?;
        txn.open_table(TARGET_ACTIONS).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Persist a new rollout together with its group plan, assigning its id.
    pub fn insert_rollout(&self, rollout: &mut Rollout, plan: &[GroupPlan]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        rollout.id = next_id(&txn, "rollout")?;
        let key = rollout.table_key();
        put_record(&txn, ROLLOUTS, &key, rollout)?;
        if !plan.is_empty() {
            put_record(&txn, ROLLOUT_PLANS, &key, &plan)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            tenant = %rollout.tenant,
            rollout_id = rollout.id,
            groups = plan.len(),
            "rollout stored"
        );
        Ok(())
    }

    /// Group plan of a rollout still being created; empty once materialized.
    pub fn get_rollout_plan(&self, tenant: &str, rollout_id: RolloutId) -> StateResult<Vec<GroupPlan>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUT_PLANS).map_err(map_err!(Table))?;
        Ok(read_json(&table, &rollout_key(tenant, rollout_id))?.unwrap_or_default())
    }

    pub fn delete_rollout_plan(&self, tenant: &str, rollout_id: RolloutId) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed = {
            let mut table = txn.open_table(ROLLOUT_PLANS).map_err(map_err!(Table))?;
            table
                .remove(rollout_key(tenant, rollout_id).as_str())
                .map_err(map_err!(Write))?
                .is_some()
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    pub fn get_rollout(&self, tenant: &str, rollout_id: RolloutId) -> StateResult<Option<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        read_json(&table, &rollout_key(tenant, rollout_id))
    }

    /// List all rollouts of a tenant in id order.
    pub fn list_rollouts(&self, tenant: &str) -> StateResult<Vec<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        scan_json(&table, &format!("{tenant}/"))
    }

    /// List rollouts of every tenant currently in `status`.
    pub fn list_rollouts_in_status(&self, status: RolloutStatus) -> StateResult<Vec<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let rollout: Rollout =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if rollout.status == status {
                results.push(rollout);
            }
        }
        Ok(results)
    }

    /// Read-modify-write a rollout inside one transaction, so fields the
    /// closure leaves alone keep whatever a concurrent writer stored.
    ///
    /// Returns the updated rollout, or `None` when it does not exist.
    pub fn update_rollout<F>(
        &self,
        tenant: &str,
        rollout_id: RolloutId,
        update: F,
    ) -> StateResult<Option<Rollout>>
    where
        F: FnOnce(&mut Rollout),
    {
        let key = rollout_key(tenant, rollout_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let current: Option<Rollout> = {
            let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            read_json(&table, &key)?
        };
        let Some(mut rollout) = current else {
            return Ok(None);
        };
        update(&mut rollout);
        rollout.updated_at = epoch_secs();
        put_record(&txn, ROLLOUTS, &key, &rollout)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(Some(rollout))
    }

    /// Remove a rollout with its plan, groups, group membership, actions and
    /// their history. Returns `false` when the rollout did not exist.
    pub fn delete_rollout(&self, tenant: &str, rollout_id: RolloutId) -> StateResult<bool> {
        let key = rollout_key(tenant, rollout_id);
        let prefix = format!("{key}/");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed = {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            table.remove(key.as_str()).map_err(map_err!(Write))?.is_some()
        };
        if !existed {
            return Ok(false);
        }

        let action_ids = {
            let index = txn.open_table(ACTION_STATUS_INDEX).map_err(map_err!(Table))?;
            indexed_action_ids(&index, &prefix, &[])?
        };
        {
            let mut actions = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
            let mut by_target = txn.open_table(TARGET_ACTIONS).map_err(map_err!(Table))?;
            for action_id in &action_ids {
                let record_key = action_key(tenant, *action_id);
                let removed: Option<Action> = match actions
                    .remove(record_key.as_str())
                    .map_err(map_err!(Write))?
                {
                    Some(guard) => {
                        Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                    }
                    None => None,
                };
                if let Some(action) = removed {
                    by_target
                        .remove(target_key(tenant, &action.target_id, action.id).as_str())
                        .map_err(map_err!(Write))?;
                }
            }
        }
        for action_id in &action_ids {
            remove_prefix(&txn, ACTION_STATUS, &format!("{}/", action_key(tenant, *action_id)))?;
        }
        remove_prefix(&txn, ACTION_STATUS_INDEX, &prefix)?;
        remove_prefix(&txn, GROUP_TARGETS, &prefix)?;
        remove_prefix(&txn, ROLLOUT_GROUPS, &prefix)?;
        {
            let mut plans = txn.open_table(ROLLOUT_PLANS).map_err(map_err!(Table))?;
            plans.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, actions = action_ids.len(), "rollout deleted");
        Ok(true)
    }

    /// Move a rollout to `to` if its current status is one of `from`.
    ///
    /// Returns the updated rollout, or `None` when the guard did not hold.
    pub fn transition_rollout(
        &self,
        tenant: &str,
        rollout_id: RolloutId,
        from: &[RolloutStatus],
        to: RolloutStatus,
    ) -> StateResult<Option<Rollout>> {
        let key = rollout_key(tenant, rollout_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let current: Rollout = {
            let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            read_json(&table, &key)?
        }
        .ok_or_else(|| StateError::NotFound(key.clone()))?;

        if !from.contains(&current.status) {
            return Ok(None);
        }
        let mut updated = current;
        updated.status = to;
        updated.updated_at = epoch_secs();
        put_record(&txn, ROLLOUTS, &key, &updated)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, status = %to, "rollout transitioned");
        Ok(Some(updated))
    }

    // ── Rollout groups ─────────────────────────────────────────────

    /// Persist a new group, assigning its id.
    pub fn insert_group(&self, group: &mut RolloutGroup) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        group.id = next_id(&txn, "rollout_group")?;
        put_record(&txn, ROLLOUT_GROUPS, &group.table_key(), group)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn get_group(
        &self,
        tenant: &str,
        rollout_id: RolloutId,
        group_id: RolloutGroupId,
    ) -> StateResult<Option<RolloutGroup>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
        read_json(&table, &group_key(tenant, rollout_id, group_id))
    }

    /// List the groups of a rollout ordered by position.
    pub fn list_groups(&self, tenant: &str, rollout_id: RolloutId) -> StateResult<Vec<RolloutGroup>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
        let mut groups: Vec<RolloutGroup> =
            scan_json(&table, &format!("{}/", rollout_key(tenant, rollout_id)))?;
        groups.sort_by_key(|g| g.position);
        Ok(groups)
    }

    /// Read-modify-write a group inside one transaction. `None` when the
    /// group does not exist.
    pub fn update_group<F>(
        &self,
        tenant: &str,
        rollout_id: RolloutId,
        group_id: RolloutGroupId,
        update: F,
    ) -> StateResult<Option<RolloutGroup>>
    where
        F: FnOnce(&mut RolloutGroup),
    {
        let key = group_key(tenant, rollout_id, group_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let current: Option<RolloutGroup> = {
            let table = txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
            read_json(&table, &key)?
        };
        let Some(mut group) = current else {
            return Ok(None);
        };
        update(&mut group);
        group.updated_at = epoch_secs();
        put_record(&txn, ROLLOUT_GROUPS, &key, &group)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(Some(group))
    }

    /// Move a group from `from` to `to`. `None` when the guard did not hold.
    pub fn transition_group(
        &self,
        tenant: &str,
        rollout_id: RolloutId,
        group_id: RolloutGroupId,
        from: RolloutGroupStatus,
        to: RolloutGroupStatus,
    ) -> StateResult<Option<RolloutGroup>> {
        let key = group_key(tenant, rollout_id, group_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let current: RolloutGroup = {
            let table = txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
            read_json(&table, &key)?
        }
        .ok_or_else(|| StateError::NotFound(key.clone()))?;

        if current.status != from {
            return Ok(None);
        }
        let mut updated = current;
        updated.status = to;
        updated.updated_at = epoch_secs();
        put_record(&txn, ROLLOUT_GROUPS, &key, &updated)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, %from, %to, "rollout group transitioned");
        Ok(Some(updated))
    }

    /// Add targets to a group. Returns how many were not members before.
    pub fn add_group_targets(
        &self,
        tenant: &str,
        rollout_id: RolloutId,
        group_id: RolloutGroupId,
        targets: &[TargetId],
    ) -> StateResult<usize> {
        let prefix = group_key(tenant, rollout_id, group_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut added = 0;
        {
            let mut table = txn.open_table(GROUP_TARGETS).map_err(map_err!(Table))?;
            for target in targets {
                let key = format!("{prefix}/{target}");
                if table.insert(key.as_str(), ()).map_err(map_err!(Write))?.is_none() {
                    added += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(added)
    }

    pub fn list_group_targets(
        &self,
        tenant: &str,
        rollout_id: RolloutId,
        group_id: RolloutGroupId,
    ) -> StateResult<Vec<TargetId>> {
        let prefix = format!("{}/", group_key(tenant, rollout_id, group_id));
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUP_TARGETS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            match key.value().strip_prefix(prefix.as_str()) {
                Some(target) => results.push(target.to_string()),
                None => break,
            }
        }
        Ok(results)
    }

    // ── Actions ────────────────────────────────────────────────────

    /// Persist new actions in one transaction, assigning ids and recording
    /// the initial status in each action's history.
    pub fn insert_actions(&self, actions: &mut [Action]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for action in actions.iter_mut() {
            action.id = next_id(&txn, "action")?;
            let entry = ActionStatusEntry::new(action.id, action.status, epoch_millis(), &[]);
            write_action(&txn, action, Some(&entry))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = actions.len(), "actions stored");
        Ok(())
    }

    pub fn get_action(&self, tenant: &str, action_id: ActionId) -> StateResult<Option<Action>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        read_json(&table, &action_key(tenant, action_id))
    }

    /// List the actions created for a rollout or one of its groups.
    pub fn list_actions(&self, tenant: &str, scope: CountScope) -> StateResult<Vec<Action>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn.open_table(ACTION_STATUS_INDEX).map_err(map_err!(Table))?;
        let actions = txn.open_table(ACTIONS).map_err(map_err!(Table))?;

        let mut results = Vec::new();
        for action_id in indexed_action_ids(&index, &scope.index_prefix(tenant), &[])? {
            let key = action_key(tenant, action_id);
            let action: Action =
                read_json(&actions, &key)?.ok_or_else(|| StateError::NotFound(key.clone()))?;
            results.push(action);
        }
        Ok(results)
    }

    /// List every action of a target, oldest first.
    pub fn list_actions_for_target(&self, tenant: &str, target_id: &str) -> StateResult<Vec<Action>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn.open_table(TARGET_ACTIONS).map_err(map_err!(Table))?;
        let actions = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        let ids = indexed_action_ids(&index, &format!("{tenant}/{target_id}/"), &[])?;
        target_actions(&actions, tenant, target_id, &ids)
    }

    /// Append a status report to an action and move the action to that status.
    ///
    /// Only active actions take reports, never back to an earlier stage or
    /// to `Scheduled`. Terminal actions reject further reports. Reaching a
    /// terminal status deactivates the action.
    pub fn append_action_status(
        &self,
        tenant: &str,
        entry: &ActionStatusEntry,
        download_progress_percent: Option<u8>,
    ) -> StateResult<Action> {
        let key = action_key(tenant, entry.action_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut action: Action = {
            let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
            read_json(&table, &key)?
        }
        .ok_or_else(|| StateError::NotFound(key.clone()))?;

        if !action.status.accepts_report(entry.status) {
            return Err(StateError::IllegalTransition(format!(
                "action {key} is {} and cannot move to {}",
                action.status, entry.status
            )));
        }
        // Actions of a group that has not started yet are not handed out.
        if !action.active {
            return Err(StateError::IllegalTransition(format!(
                "action {key} is not active"
            )));
        }

        action.status = entry.status;
        action.updated_at = epoch_secs();
        if entry.status.is_terminal() {
            action.active = false;
        }
        if let Some(percent) = download_progress_percent {
            action.download_progress_percent = percent.min(100);
        }
        write_action(&txn, &action, Some(entry))?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, status = %action.status, "action status appended");
        Ok(action)
    }

    /// Move every action in `scope` whose status is in `from` to `to`.
    ///
    /// Used for group activation (`Scheduled` → `Running`) and rollout stop
    /// (non-terminal → `Canceled`). Returns the changed actions.
    pub fn switch_action_status(
        &self,
        tenant: &str,
        scope: CountScope,
        from: &[ActionStatus],
        to: ActionStatus,
        active: bool,
        reason: &str,
    ) -> StateResult<Vec<Action>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let ids = {
            let index = txn.open_table(ACTION_STATUS_INDEX).map_err(map_err!(Table))?;
            indexed_action_ids(&index, &scope.index_prefix(tenant), from)?
        };

        let mut changed = Vec::with_capacity(ids.len());
        let now_ms = epoch_millis();
        for action_id in ids {
            let key = action_key(tenant, action_id);
            let mut action: Action = {
                let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
                read_json(&table, &key)?
            }
            .ok_or_else(|| StateError::NotFound(key.clone()))?;

            action.status = to;
            action.active = active;
            action.updated_at = now_ms / 1000;
            let entry = ActionStatusEntry::new(action_id, to, now_ms, &[reason.to_string()]);
            write_action(&txn, &action, Some(&entry))?;
            changed.push(action);
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%tenant, ?scope, %to, count = changed.len(), "action statuses switched");
        Ok(changed)
    }

    /// Cancel the not-yet-started actions of the given targets, so a newer
    /// assignment replaces them. Returns the cancelled actions.
    pub fn cancel_scheduled_actions_for_targets(
        &self,
        tenant: &str,
        targets: &[TargetId],
    ) -> StateResult<Vec<Action>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let scheduled: Vec<Action> = {
            let index = txn.open_table(TARGET_ACTIONS).map_err(map_err!(Table))?;
            let actions = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
            let mut seen = HashSet::new();
            let mut scheduled = Vec::new();
            for target_id in targets.iter().map(String::as_str) {
                if !seen.insert(target_id) {
                    continue;
                }
                let ids = indexed_action_ids(
                    &index,
                    &format!("{tenant}/{target_id}/"),
                    &[ActionStatus::Scheduled],
                )?;
                scheduled.extend(target_actions(&actions, tenant, target_id, &ids)?);
            }
            scheduled
        };

        let now_ms = epoch_millis();
        let mut cancelled = Vec::with_capacity(scheduled.len());
        for mut action in scheduled {
            action.status = ActionStatus::Canceled;
            action.active = false;
            action.updated_at = now_ms / 1000;
            let entry = ActionStatusEntry::new(
                action.id,
                ActionStatus::Canceled,
                now_ms,
                &["replaced by a newer assignment".to_string()],
            );
            write_action(&txn, &action, Some(&entry))?;
            cancelled.push(action);
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(cancelled)
    }

    /// Full status history of an action, oldest first.
    pub fn list_action_history(
        &self,
        tenant: &str,
        action_id: ActionId,
    ) -> StateResult<Vec<ActionStatusEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTION_STATUS).map_err(map_err!(Table))?;
        scan_json(&table, &format!("{}/", action_key(tenant, action_id)))
    }

    // ── Counts ─────────────────────────────────────────────────────

    /// One `(status tag, count)` row per distinct status in scope.
    pub fn status_counts(&self, tenant: &str, scope: CountScope) -> StateResult<Vec<ActionStatusCount>> {
        let prefix = scope.index_prefix(tenant);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTION_STATUS_INDEX).map_err(map_err!(Table))?;

        let mut counts: BTreeMap<u8, u64> = BTreeMap::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix.as_str()) {
                break;
            }
            *counts.entry(value.value()).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(status_tag, count)| ActionStatusCount { status_tag, count })
            .collect())
    }

    /// Number of actions in scope.
    pub fn count_actions(&self, tenant: &str, scope: CountScope) -> StateResult<u64> {
        Ok(self
            .status_counts(tenant, scope)?
            .iter()
            .map(|c| c.count)
            .sum())
    }
}

// ── Transaction helpers ────────────────────────────────────────────

fn action_key(tenant: &str, action_id: ActionId) -> String {
    format!("{tenant}/{action_id:020}")
}

fn index_key(tenant: &str, rollout: &RolloutRef, action_id: ActionId) -> String {
    format!(
        "{}/{action_id:020}",
        group_key(tenant, rollout.rollout_id, rollout.group_id)
    )
}

fn target_key(tenant: &str, target_id: &str, action_id: ActionId) -> String {
    format!("{tenant}/{target_id}/{action_id:020}")
}

/// Load indexed actions of one target. Target ids may contain `/`, so index
/// hits of a longer target sharing the prefix are dropped here.
fn target_actions<R>(
    actions: &R,
    tenant: &str,
    target_id: &str,
    ids: &[ActionId],
) -> StateResult<Vec<Action>>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::with_capacity(ids.len());
    for action_id in ids {
        let key = action_key(tenant, *action_id);
        let action: Action =
            read_json(actions, &key)?.ok_or_else(|| StateError::NotFound(key.clone()))?;
        if action.target_id == target_id {
            results.push(action);
        }
    }
    Ok(results)
}

fn next_id(txn: &WriteTransaction, sequence: &str) -> StateResult<u64> {
    let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let next = table
        .get(sequence)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0)
        + 1;
    table.insert(sequence, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn put_record<T: Serialize>(
    txn: &WriteTransaction,
    definition: redb::TableDefinition<'static, &'static str, &'static [u8]>,
    key: &str,
    record: &T,
) -> StateResult<()> {
    let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
    let mut table = txn.open_table(definition).map_err(map_err!(Table))?;
    table
        .insert(key, value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Write an action, keep its status index in sync and optionally append a
/// history entry.
fn write_action(
    txn: &WriteTransaction,
    action: &Action,
    entry: Option<&ActionStatusEntry>,
) -> StateResult<()> {
    let key = action_key(&action.tenant, action.id);
    put_record(txn, ACTIONS, &key, action)?;

    if let Some(rollout) = &action.rollout {
        let mut index = txn.open_table(ACTION_STATUS_INDEX).map_err(map_err!(Table))?;
        index
            .insert(
                index_key(&action.tenant, rollout, action.id).as_str(),
                action.status.tag(),
            )
            .map_err(map_err!(Write))?;
    }

    {
        let mut by_target = txn.open_table(TARGET_ACTIONS).map_err(map_err!(Table))?;
        by_target
            .insert(
                target_key(&action.tenant, &action.target_id, action.id).as_str(),
                action.status.tag(),
            )
            .map_err(map_err!(Write))?;
    }

    if let Some(entry) = entry {
        let prefix = format!("{key}/");
        let mut history = txn.open_table(ACTION_STATUS).map_err(map_err!(Table))?;
        let mut seq = 0u64;
        for item in history.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (k, _) = item.map_err(map_err!(Read))?;
            if !k.value().starts_with(prefix.as_str()) {
                break;
            }
            seq += 1;
        }
        let value = serde_json::to_vec(entry).map_err(map_err!(Serialize))?;
        history
            .insert(format!("{prefix}{:020}", seq + 1).as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
    }
    Ok(())
}

/// Remove every key of `definition` starting with `prefix`.
fn remove_prefix<V>(
    txn: &WriteTransaction,
    definition: redb::TableDefinition<'static, &'static str, V>,
    prefix: &str,
) -> StateResult<usize>
where
    V: redb::Value + 'static,
{
    let mut table = txn.open_table(definition).map_err(map_err!(Table))?;
    let mut keys = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        keys.push(key.value().to_string());
    }
    for key in &keys {
        table.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(keys.len())
}

fn read_json<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let record = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

fn scan_json<T, R>(table: &R, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
    }
    Ok(results)
}

/// Action ids under an index prefix, optionally restricted to status tags of
/// `statuses` (empty = all).
fn indexed_action_ids<R>(index: &R, prefix: &str, statuses: &[ActionStatus]) -> StateResult<Vec<ActionId>>
where
    R: ReadableTable<&'static str, u8>,
{
    let tags: Vec<u8> = statuses.iter().map(|s| s.tag()).collect();
    let mut ids = Vec::new();
    for entry in index.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        if !tags.is_empty() && !tags.contains(&value.value()) {
            continue;
        }
        let id = key
            .rsplit('/')
            .next()
            .and_then(|s| s.parse::<ActionId>().ok())
            .ok_or_else(|| StateError::Deserialize(format!("malformed index key: {key}")))?;
        ids.push(id);
    }
    Ok(ids)
}
