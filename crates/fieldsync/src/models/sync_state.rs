//! Persisted sync state for the scheduler

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How long a running sync may go without a heartbeat before it is
/// considered abandoned (2 hours).
pub const STUCK_THRESHOLD_SECS: i64 = 2 * 60 * 60;

/// Which kind of sync currently holds the state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPhase {
    #[default]
    None,
    Quick,
    Full,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::None => "none",
            SyncPhase::Quick => "quick",
            SyncPhase::Full => "full",
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks whether a sync is running and the outcome counters of past runs
///
/// Serialized as camelCase JSON so the state file stays readable (and
/// hand-editable) by operators. Any field missing from an older file falls
/// back to its default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncState {
    /// Whether a sync currently holds the state
    pub running: bool,
    /// Phase of the running sync (NONE when idle)
    pub current_phase: SyncPhase,
    /// When the current (or most recent) run started
    pub started_at: Option<DateTime<Utc>>,
    /// Heartbeat of the current run; staleness keys on this
    pub last_activity_at: Option<DateTime<Utc>>,
    /// When a run last finished successfully
    pub last_success_at: Option<DateTime<Utc>>,
    /// When a run last finished with a failure
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Phase of the most recently finished run
    pub last_run_phase: SyncPhase,
    pub total_runs: u64,
    pub success_count: u64,
    pub failure_count: u64,
}

impl SyncState {
    /// Mark a run as started
    pub fn begin(&mut self, phase: SyncPhase, now: DateTime<Utc>) {
        self.running = true;
        self.current_phase = phase;
        self.started_at = Some(now);
        self.last_activity_at = Some(now);
    }

    /// Record a heartbeat for the running sync
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if self.running {
            self.last_activity_at = Some(now);
        }
    }

    /// Mark the running sync as finished and update counters
    pub fn finish(&mut self, success: bool, now: DateTime<Utc>) {
        self.last_run_phase = self.current_phase;
        self.running = false;
        self.current_phase = SyncPhase::None;
        self.last_activity_at = Some(now);
        self.total_runs += 1;
        if success {
            self.success_count += 1;
            self.last_success_at = Some(now);
        } else {
            self.failure_count += 1;
            self.last_failure_at = Some(now);
        }
    }

    /// Clear an abandoned run without counting it as finished
    pub fn clear_running(&mut self) {
        self.running = false;
        self.current_phase = SyncPhase::None;
    }

    /// Whether `running` is set but the record cannot describe a live run.
    ///
    /// A running record needs a phase and a start time.
    pub fn is_inconsistent(&self) -> bool {
        self.running && (self.current_phase == SyncPhase::None || self.started_at.is_none())
    }

    /// Whether the state claims a running sync that has stopped heartbeating
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        if !self.running {
            return false;
        }
        if self.is_inconsistent() {
            return true;
        }
        match self.last_activity_at.or(self.started_at) {
            Some(last) => now - last > Duration::seconds(STUCK_THRESHOLD_SECS),
            None => true,
        }
    }

    /// Elapsed time of the running sync, if any
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.running {
            return None;
        }
        self.started_at.map(|started| now - started)
    }
}
