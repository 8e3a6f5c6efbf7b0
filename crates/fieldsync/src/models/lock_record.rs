//! Process lock record written to the lock file

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::sync_state::STUCK_THRESHOLD_SECS;

/// Contents of the lock file owned by a running service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// Identity of the owning instance (pid plus acquisition time)
    pub owner_id: String,
    /// OS process id of the owner, for operators
    pub pid: u32,
    /// When the lock was taken
    pub acquired_at: DateTime<Utc>,
    /// Last time the owner confirmed it is alive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl LockRecord {
    pub fn new(owner_id: impl Into<String>, pid: u32, acquired_at: DateTime<Utc>) -> Self {
        Self {
            owner_id: owner_id.into(),
            pid,
            acquired_at,
            refreshed_at: None,
        }
    }

    /// Last sign of life from the owner
    pub fn last_active_at(&self) -> DateTime<Utc> {
        self.refreshed_at.unwrap_or(self.acquired_at)
    }

    /// Time since the owner was last active, relative to `now`
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_active_at()
    }

    /// A stale lock is reclaimable by any new instance
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        self.age_at(now) >= Duration::seconds(STUCK_THRESHOLD_SECS)
    }
}
