//! redb table definitions for the FleetGrid state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Numeric ids inside keys are zero-padded to 20 digits.

use redb::TableDefinition;

/// Rollouts keyed by `{tenant}/{rollout}`.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Pending group plans of rollouts still being created, keyed by `{tenant}/{rollout}`.
pub const ROLLOUT_PLANS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollout_plans");

/// Rollout groups keyed by `{tenant}/{rollout}/{group}`.
pub const ROLLOUT_GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollout_groups");

/// Group membership keyed by `{tenant}/{rollout}/{group}/{target}`.
pub const GROUP_TARGETS: TableDefinition<&str, ()> = TableDefinition::new("group_targets");

/// Actions keyed by `{tenant}/{action}`.
pub const ACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("actions");

/// Status history keyed by `{tenant}/{action}/{seq}`.
pub const ACTION_STATUS: TableDefinition<&str, &[u8]> = TableDefinition::new("action_status");

/// Status tag of every rollout action keyed by `{tenant}/{rollout}/{group}/{action}`.
pub const ACTION_STATUS_INDEX: TableDefinition<&str, u8> =
    TableDefinition::new("action_status_index");

/// Status tag of every action keyed by `{tenant}/{target}/{action}`.
pub const TARGET_ACTIONS: TableDefinition<&str, u8> = TableDefinition::new("target_actions");

/// Id sequences keyed by entity kind.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
