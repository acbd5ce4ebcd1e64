//! Domain types shared across FleetGrid crates.
//!
//! Status enumerations serialize by name (`snake_case`), never by position.
//! `ActionStatus` additionally carries an explicit stable integer tag used by
//! the store's status index; tags are part of the on-disk format and must not
//! be renumbered.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Tenant identifier. Every entity is scoped to exactly one tenant.
pub type TenantId = String;

/// Unique identifier for a rollout (tenant-scoped).
pub type RolloutId = u64;

/// Unique identifier for a rollout group within a rollout.
pub type RolloutGroupId = u64;

/// Unique identifier for an action (tenant-scoped).
pub type ActionId = u64;

/// Controller identifier of a target device.
pub type TargetId = String;

/// `forced_time` value meaning "never forced by time".
pub const NO_FORCE_TIME: u64 = 0;

/// Maximum length of one status message chunk, in characters.
pub const MESSAGE_CHUNK_LEN: usize = 512;

// ── Action ────────────────────────────────────────────────────────

/// Lifecycle status of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Finished,
    Error,
    Warning,
    Running,
    Canceled,
    Canceling,
    Retrieved,
    Download,
    Scheduled,
}

impl ActionStatus {
    pub const ALL: [ActionStatus; 9] = [
        ActionStatus::Finished,
        ActionStatus::Error,
        ActionStatus::Warning,
        ActionStatus::Running,
        ActionStatus::Canceled,
        ActionStatus::Canceling,
        ActionStatus::Retrieved,
        ActionStatus::Download,
        ActionStatus::Scheduled,
    ];

    /// Stable storage tag.
    pub fn tag(self) -> u8 {
        match self {
            ActionStatus::Finished => 0,
            ActionStatus::Error => 1,
            ActionStatus::Warning => 2,
            ActionStatus::Running => 3,
            ActionStatus::Canceled => 4,
            ActionStatus::Canceling => 5,
            ActionStatus::Retrieved => 6,
            ActionStatus::Download => 7,
            ActionStatus::Scheduled => 8,
        }
    }

    /// Decode a storage tag. Unknown tags are a fatal classification error.
    pub fn from_tag(tag: u8) -> CoreResult<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.tag() == tag)
            .ok_or(CoreError::UnrecognizedStatus(tag))
    }

    /// FINISHED, ERROR and CANCELED end an action for good.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionStatus::Finished | ActionStatus::Error | ActionStatus::Canceled
        )
    }

    /// Lifecycle stage used to order device reports. An action never moves
    /// to a lower stage; statuses within one stage may follow each other.
    pub fn stage(self) -> u8 {
        match self {
            ActionStatus::Scheduled => 0,
            ActionStatus::Retrieved
            | ActionStatus::Download
            | ActionStatus::Running
            | ActionStatus::Warning => 1,
            ActionStatus::Canceling => 2,
            ActionStatus::Finished | ActionStatus::Error | ActionStatus::Canceled => 3,
        }
    }

    /// Whether a device report of `next` may follow `self`.
    pub fn accepts_report(self, next: ActionStatus) -> bool {
        !self.is_terminal() && next != ActionStatus::Scheduled && next.stage() >= self.stage()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Finished => "finished",
            ActionStatus::Error => "error",
            ActionStatus::Warning => "warning",
            ActionStatus::Running => "running",
            ActionStatus::Canceled => "canceled",
            ActionStatus::Canceling => "canceling",
            ActionStatus::Retrieved => "retrieved",
            ActionStatus::Download => "download",
            ActionStatus::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == lower)
            .ok_or_else(|| CoreError::UnknownStatusName(s.to_string()))
    }
}

/// How an action is pushed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Forced,
    #[default]
    Soft,
    /// Soft until `forced_time`, forced afterwards.
    TimeForced,
}

/// Link from an action to the rollout group that created it.
///
/// Rollout and group are always set together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RolloutRef {
    pub rollout_id: RolloutId,
    pub group_id: RolloutGroupId,
}

/// Assignment of one distribution set to one target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub id: ActionId,
    pub tenant: TenantId,
    pub target_id: TargetId,
    pub distribution_set: String,
    pub status: ActionStatus,
    pub action_type: ActionType,
    /// Epoch milliseconds; `NO_FORCE_TIME` when unset.
    pub forced_time: u64,
    pub active: bool,
    pub download_progress_percent: u8,
    pub rollout: Option<RolloutRef>,
    /// Unix timestamp (seconds) when this action was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of last status change.
    pub updated_at: u64,
}

impl Action {
    /// Whether the action is forced at `now_ms` (epoch milliseconds).
    pub fn is_force_at(&self, now_ms: u64) -> bool {
        match self.action_type {
            ActionType::Forced => true,
            ActionType::TimeForced => now_ms >= self.forced_time,
            ActionType::Soft => false,
        }
    }

    pub fn is_force(&self) -> bool {
        self.is_force_at(epoch_millis())
    }

    pub fn is_cancelling_or_canceled(&self) -> bool {
        matches!(self.status, ActionStatus::Canceling | ActionStatus::Canceled)
    }
}

/// One immutable status report in an action's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionStatusEntry {
    pub action_id: ActionId,
    pub status: ActionStatus,
    /// Epoch milliseconds.
    pub occurred_at: u64,
    pub messages: Vec<String>,
}

impl ActionStatusEntry {
    /// Build an entry, splitting every message into chunks of at most
    /// `MESSAGE_CHUNK_LEN` characters.
    pub fn new(
        action_id: ActionId,
        status: ActionStatus,
        occurred_at: u64,
        messages: &[String],
    ) -> Self {
        Self {
            action_id,
            status,
            occurred_at,
            messages: messages
                .iter()
                .flat_map(|m| chunk_message(m, MESSAGE_CHUNK_LEN))
                .collect(),
        }
    }
}

fn chunk_message(message: &str, len: usize) -> Vec<String> {
    if message.is_empty() {
        return vec![String::new()];
    }
    let chars: Vec<char> = message.chars().collect();
    chars.chunks(len).map(|c| c.iter().collect()).collect()
}

// ── Rollout ───────────────────────────────────────────────────────

/// Lifecycle status of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Creating,
    Ready,
    Paused,
    Starting,
    Stopped,
    Running,
    Finished,
    ErrorCreating,
    ErrorStarting,
}

impl RolloutStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RolloutStatus::Creating => "creating",
            RolloutStatus::Ready => "ready",
            RolloutStatus::Paused => "paused",
            RolloutStatus::Starting => "starting",
            RolloutStatus::Stopped => "stopped",
            RolloutStatus::Running => "running",
            RolloutStatus::Finished => "finished",
            RolloutStatus::ErrorCreating => "error_creating",
            RolloutStatus::ErrorStarting => "error_starting",
        }
    }
}

impl fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tenant-scoped update campaign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    pub tenant: TenantId,
    pub name: String,
    pub description: Option<String>,
    pub distribution_set: String,
    /// Target selection query the groups were built from.
    pub target_filter: String,
    pub action_type: ActionType,
    pub forced_time: u64,
    pub status: RolloutStatus,
    pub total_targets: u64,
    pub rollout_groups_total: u32,
    pub rollout_groups_created: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Rollout {
    /// Composite store key `{tenant}/{id}`.
    pub fn table_key(&self) -> String {
        rollout_key(&self.tenant, self.id)
    }
}

pub fn rollout_key(tenant: &str, rollout_id: RolloutId) -> String {
    format!("{tenant}/{rollout_id:020}")
}

// ── Rollout group ─────────────────────────────────────────────────

/// Lifecycle status of a rollout group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutGroupStatus {
    /// Materialized; its actions do not exist yet.
    Ready,
    Scheduled,
    Running,
    Finished,
    Error,
}

impl RolloutGroupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RolloutGroupStatus::Ready => "ready",
            RolloutGroupStatus::Scheduled => "scheduled",
            RolloutGroupStatus::Running => "running",
            RolloutGroupStatus::Finished => "finished",
            RolloutGroupStatus::Error => "error",
        }
    }
}

impl fmt::Display for RolloutGroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SuccessCondition {
    #[default]
    Threshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SuccessAction {
    #[default]
    NextGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCondition {
    #[default]
    Threshold,
}

/// What happens when a group's error condition is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Pause the whole rollout until an operator resumes it.
    #[default]
    Pause,
    /// Mark the group failed and carry on with the next group.
    Continue,
}

/// Success/error gating configuration of a rollout group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupConditions {
    pub success_condition: SuccessCondition,
    pub success_condition_exp: String,
    pub success_action: SuccessAction,
    #[serde(default)]
    pub success_action_exp: Option<String>,
    #[serde(default)]
    pub error_condition: Option<ErrorCondition>,
    #[serde(default)]
    pub error_condition_exp: Option<String>,
    #[serde(default)]
    pub error_action: Option<ErrorAction>,
    #[serde(default)]
    pub error_action_exp: Option<String>,
}

impl Default for GroupConditions {
    fn default() -> Self {
        Self {
            success_condition: SuccessCondition::Threshold,
            success_condition_exp: "100".to_string(),
            success_action: SuccessAction::NextGroup,
            success_action_exp: None,
            error_condition: None,
            error_condition_exp: None,
            error_action: None,
            error_action_exp: None,
        }
    }
}

impl GroupConditions {
    pub fn success_threshold(mut self, exp: &str) -> Self {
        self.success_condition = SuccessCondition::Threshold;
        self.success_condition_exp = exp.to_string();
        self
    }

    pub fn error_threshold(mut self, exp: &str, action: ErrorAction) -> Self {
        self.error_condition = Some(ErrorCondition::Threshold);
        self.error_condition_exp = Some(exp.to_string());
        self.error_action = Some(action);
        self
    }
}

/// One ordered slice of a rollout's targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutGroup {
    pub id: RolloutGroupId,
    pub rollout_id: RolloutId,
    pub tenant: TenantId,
    pub name: String,
    /// Zero-based position; groups activate in this order.
    pub position: u32,
    pub parent_id: Option<RolloutGroupId>,
    pub status: RolloutGroupStatus,
    pub total_targets: u64,
    pub conditions: GroupConditions,
    pub created_at: u64,
    pub updated_at: u64,
}

impl RolloutGroup {
    /// Composite store key `{tenant}/{rollout}/{id}`.
    pub fn table_key(&self) -> String {
        group_key(&self.tenant, self.rollout_id, self.id)
    }
}

pub fn group_key(tenant: &str, rollout_id: RolloutId, group_id: RolloutGroupId) -> String {
    format!("{tenant}/{rollout_id:020}/{group_id:020}")
}

/// A group as requested at rollout creation, kept until the group and its
/// target membership have been written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupPlan {
    pub name: String,
    pub targets: Vec<TargetId>,
    pub conditions: GroupConditions,
}

// ── Time ──────────────────────────────────────────────────────────

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(action_type: ActionType, forced_time: u64) -> Action {
        Action {
            id: 1,
            tenant: "default".to_string(),
            target_id: "dev-1".to_string(),
            distribution_set: "os:1.0".to_string(),
            status: ActionStatus::Running,
            action_type,
            forced_time,
            active: true,
            download_progress_percent: 0,
            rollout: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn status_tags_are_stable() {
        let tags: Vec<u8> = ActionStatus::ALL.iter().map(|s| s.tag()).collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 4, 5, 6, 7, 8]);
        for s in ActionStatus::ALL {
            assert_eq!(ActionStatus::from_tag(s.tag()).unwrap(), s);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(
            ActionStatus::from_tag(42),
            Err(CoreError::UnrecognizedStatus(42))
        ));
    }

    #[test]
    fn status_parses_by_name() {
        assert_eq!("DOWNLOAD".parse::<ActionStatus>().unwrap(), ActionStatus::Download);
        assert_eq!("canceling".parse::<ActionStatus>().unwrap(), ActionStatus::Canceling);
        assert!("installed".parse::<ActionStatus>().is_err());
    }

    #[test]
    fn status_serializes_by_name() {
        let json = serde_json::to_string(&ActionStatus::Retrieved).unwrap();
        assert_eq!(json, "\"retrieved\"");
        let json = serde_json::to_string(&RolloutStatus::ErrorStarting).unwrap();
        assert_eq!(json, "\"error_starting\"");
    }

    #[test]
    fn force_semantics() {
        assert!(action(ActionType::Forced, NO_FORCE_TIME).is_force_at(0));
        assert!(!action(ActionType::Soft, NO_FORCE_TIME).is_force_at(u64::MAX));

        let timed = action(ActionType::TimeForced, 5_000);
        assert!(!timed.is_force_at(4_999));
        assert!(timed.is_force_at(5_000));
        assert!(timed.is_force_at(6_000));
    }

    #[test]
    fn terminal_statuses() {
        let terminal: Vec<ActionStatus> = ActionStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![ActionStatus::Finished, ActionStatus::Error, ActionStatus::Canceled]
        );
    }

    #[test]
    fn reports_never_move_backwards() {
        use ActionStatus::*;
        assert!(Scheduled.accepts_report(Running));
        assert!(Download.accepts_report(Retrieved));
        assert!(Running.accepts_report(Canceled));
        assert!(Canceling.accepts_report(Canceled));
        assert!(!Running.accepts_report(Scheduled));
        assert!(!Scheduled.accepts_report(Scheduled));
        assert!(!Canceling.accepts_report(Running));
        assert!(!Finished.accepts_report(Running));
        for s in ActionStatus::ALL {
            assert_eq!(s.stage() == 3, s.is_terminal());
        }
    }

    #[test]
    fn messages_are_chunked() {
        let long = "x".repeat(1100);
        let entry = ActionStatusEntry::new(
            1,
            ActionStatus::Running,
            0,
            &[long, "short".to_string()],
        );
        let lens: Vec<usize> = entry.messages.iter().map(|m| m.len()).collect();
        assert_eq!(lens, vec![512, 512, 76, 5]);
    }

    #[test]
    fn multibyte_messages_split_on_char_boundaries() {
        let msg = "é".repeat(600);
        let entry = ActionStatusEntry::new(1, ActionStatus::Warning, 0, &[msg]);
        assert_eq!(entry.messages.len(), 2);
        assert_eq!(entry.messages[0].chars().count(), 512);
        assert_eq!(entry.messages[1].chars().count(), 88);
    }

    #[test]
    fn default_conditions() {
        let c = GroupConditions::default();
        assert_eq!(c.success_condition_exp, "100");
        assert_eq!(c.success_action, SuccessAction::NextGroup);
        assert!(c.error_condition.is_none());

        let c = c.success_threshold("75").error_threshold("5", ErrorAction::Pause);
        assert_eq!(c.success_condition_exp, "75");
        assert_eq!(c.error_condition_exp.as_deref(), Some("5"));
        assert_eq!(c.error_action, Some(ErrorAction::Pause));
    }

    #[test]
    fn keys_sort_numerically() {
        assert!(rollout_key("t", 9) < rollout_key("t", 10));
        assert!(group_key("t", 1, 2) < group_key("t", 1, 11));
    }
}
