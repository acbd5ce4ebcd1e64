//! Target count aggregation.
//!
//! Rolls per-target action status counts up into the coarse progress buckets
//! shown for a rollout or a single rollout group. The computation is pure:
//! callers fetch `(status, count)` rows from the store and hand them in.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::types::ActionStatus;

/// Coarse progress bucket of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetCountBucket {
    Ready,
    Running,
    Error,
    Finished,
    Cancelled,
    NotStarted,
}

impl fmt::Display for TargetCountBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetCountBucket::Ready => "ready",
            TargetCountBucket::Running => "running",
            TargetCountBucket::Error => "error",
            TargetCountBucket::Finished => "finished",
            TargetCountBucket::Cancelled => "cancelled",
            TargetCountBucket::NotStarted => "not_started",
        };
        f.write_str(s)
    }
}

impl ActionStatus {
    /// The bucket a target with this action status is counted in.
    pub fn bucket(self) -> TargetCountBucket {
        match self {
            ActionStatus::Scheduled => TargetCountBucket::Ready,
            ActionStatus::Error => TargetCountBucket::Error,
            ActionStatus::Finished => TargetCountBucket::Finished,
            ActionStatus::Retrieved
            | ActionStatus::Running
            | ActionStatus::Warning
            | ActionStatus::Download => TargetCountBucket::Running,
            ActionStatus::Canceled | ActionStatus::Canceling => TargetCountBucket::Cancelled,
        }
    }
}

/// One aggregate row as produced by the store's status index: the raw status
/// tag and how many targets in scope currently have it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStatusCount {
    pub status_tag: u8,
    pub count: u64,
}

impl ActionStatusCount {
    pub fn new(status: ActionStatus, count: u64) -> Self {
        Self {
            status_tag: status.tag(),
            count,
        }
    }
}

/// Snapshot of target counts per bucket for a rollout or rollout group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalTargetCountStatus {
    total_targets: u64,
    buckets: BTreeMap<TargetCountBucket, u64>,
}

impl TotalTargetCountStatus {
    /// Snapshot for a scope without any actions yet.
    pub fn not_started(total_targets: u64) -> Self {
        let mut buckets = BTreeMap::new();
        buckets.insert(TargetCountBucket::NotStarted, total_targets);
        Self {
            total_targets,
            buckets,
        }
    }

    /// Aggregate typed status counts.
    ///
    /// An empty input attributes all targets to `NotStarted`.
    pub fn from_counts<I>(counts: I, total_targets: u64) -> Self
    where
        I: IntoIterator<Item = (ActionStatus, u64)>,
    {
        let mut buckets: BTreeMap<TargetCountBucket, u64> = BTreeMap::new();
        let mut seen = false;
        for (status, count) in counts {
            seen = true;
            *buckets.entry(status.bucket()).or_default() += count;
        }
        if !seen {
            return Self::not_started(total_targets);
        }
        Self {
            total_targets,
            buckets,
        }
    }

    /// Aggregate raw store rows. Fails on the first unknown status tag
    /// rather than misclassifying it.
    pub fn from_rows(rows: &[ActionStatusCount], total_targets: u64) -> CoreResult<Self> {
        let typed = rows
            .iter()
            .map(|r| ActionStatus::from_tag(r.status_tag).map(|s| (s, r.count)))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Self::from_counts(typed, total_targets))
    }

    pub fn total_targets(&self) -> u64 {
        self.total_targets
    }

    /// Count in a bucket; absent buckets count as zero.
    pub fn count(&self, bucket: TargetCountBucket) -> u64 {
        self.buckets.get(&bucket).copied().unwrap_or(0)
    }

    /// Sum over all buckets.
    pub fn sum(&self) -> u64 {
        self.buckets.values().sum()
    }

    /// Populated buckets in declaration order.
    pub fn buckets(&self) -> impl Iterator<Item = (TargetCountBucket, u64)> + '_ {
        self.buckets.iter().map(|(b, c)| (*b, *c))
    }

    /// Percentage of targets in `bucket`. An empty scope yields `None`.
    pub fn percent(&self, bucket: TargetCountBucket) -> Option<f64> {
        if self.total_targets == 0 {
            return None;
        }
        Some(self.count(bucket) as f64 * 100.0 / self.total_targets as f64)
    }

    /// Finished percentage; an empty scope counts as fully finished.
    pub fn finished_percent(&self) -> f64 {
        self.percent(TargetCountBucket::Finished).unwrap_or(100.0)
    }
}
