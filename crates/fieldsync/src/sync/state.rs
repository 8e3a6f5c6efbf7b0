//! Crash-recoverable sync state machine
//!
//! `IDLE -> acquire(phase) -> RUNNING -> release(success) -> IDLE`, persisted
//! to a JSON file after every transition. A run that stops heartbeating for
//! longer than the stuck threshold is treated as abandoned and cleared.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::models::{SyncPhase, SyncState};

/// File name of the persisted state inside the data directory
pub const STATE_FILE: &str = "sync-state.json";

/// Read-only view of the state for probes and the `status` command
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    #[serde(flatten)]
    pub state: SyncState,
    /// Seconds since the running sync started
    pub elapsed_secs: Option<i64>,
    /// Running, but past the stuck threshold
    pub stale: bool,
}

impl SyncStatus {
    fn of(state: SyncState, now: DateTime<Utc>) -> Self {
        Self {
            elapsed_secs: state.elapsed_at(now).map(|d| d.num_seconds()),
            stale: state.is_stale_at(now),
            state,
        }
    }
}

/// Owns the persisted [`SyncState`] and serializes every transition
pub struct SyncStateMachine {
    path: PathBuf,
    state: Mutex<SyncState>,
}

impl SyncStateMachine {
    /// Load the state file at `path`, starting fresh if it is missing or
    /// unreadable. A stale running state is repaired immediately.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = load_state(&path);
        let machine = Self {
            path,
            state: Mutex::new(state),
        };
        machine.repair_stale()?;
        Ok(machine)
    }

    /// Path of the backing state file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to start a run of `phase`.
    ///
    /// Returns `false` (and changes nothing) if a live run already holds the
    /// state. A stale run is cleared first and does not count as a run.
    pub fn acquire(&self, phase: SyncPhase) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.lock_state();

        if state.running {
            if !state.is_stale_at(now) {
                debug!(
                    "Cannot start {} sync: {} sync running since {:?}",
                    phase, state.current_phase, state.started_at
                );
                return Ok(false);
            }
            warn_stale(&state, now);
        }

        let mut next = state.clone();
        if next.running {
            next.clear_running();
        }
        next.begin(phase, now);
        self.commit(&mut state, next)?;
        info!("Started {} sync", phase);
        Ok(true)
    }

    /// Record progress for the running sync
    pub fn heartbeat(&self) -> Result<()> {
        let mut state = self.lock_state();
        if !state.running {
            return Ok(());
        }
        let mut next = state.clone();
        next.touch(Utc::now());
        self.commit(&mut state, next)
    }

    /// Finish the running sync and bump the outcome counters.
    ///
    /// A release with nothing running is a no-op.
    pub fn release(&self, success: bool) -> Result<()> {
        let mut state = self.lock_state();
        if !state.running {
            debug!("Release requested with no sync running");
            return Ok(());
        }

        let phase = state.current_phase;
        let mut next = state.clone();
        next.finish(success, Utc::now());
        // Go idle in memory even if the file cannot be written, so later
        // runs in this process are not refused until the state goes stale
        let saved = config::save_json_atomic(&self.path, &next);
        *state = next;
        saved?;

        if success {
            info!("Finished {} sync", phase);
        } else {
            warn!("{} sync finished with failures", phase);
        }
        Ok(())
    }

    /// Clear a stale running state. Returns whether anything was cleared.
    pub fn repair_stale(&self) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.lock_state();
        if !state.is_stale_at(now) {
            return Ok(false);
        }

        warn_stale(&state, now);
        let mut next = state.clone();
        next.clear_running();
        self.commit(&mut state, next)?;
        Ok(true)
    }

    /// Start a scoped run; `None` if another run holds the state
    pub fn begin(&self, phase: SyncPhase) -> Result<Option<ActiveRun<'_>>> {
        if self.acquire(phase)? {
            Ok(Some(ActiveRun {
                machine: self,
                phase,
                finished: false,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus::of(self.snapshot(), Utc::now())
    }

    /// Status of the state file at `path` without owning or repairing it.
    ///
    /// A missing or corrupt file reads as the default idle state, the same
    /// way [`SyncStateMachine::open`] treats it.
    pub fn read_status(path: &Path) -> SyncStatus {
        SyncStatus::of(load_state(path), Utc::now())
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> SyncState {
        self.lock_state().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist `next`, then make it the in-memory state
    fn commit(&self, current: &mut SyncState, next: SyncState) -> Result<()> {
        config::save_json_atomic(&self.path, &next)?;
        *current = next;
        Ok(())
    }
}

fn load_state(path: &Path) -> SyncState {
    if !path.exists() {
        return SyncState::default();
    }
    match config::load_json_file::<SyncState>(path) {
        Ok(state) => state,
        Err(e) => {
            warn!("Sync state file is corrupt, starting fresh: {:#}", e);
            SyncState::default()
        }
    }
}

fn warn_stale(state: &SyncState, now: DateTime<Utc>) {
    let idle_secs = state
        .last_activity_at
        .or(state.started_at)
        .map(|last| (now - last).num_seconds());
    warn!(
        "Clearing stuck {} sync (started {:?}, idle {:?}s)",
        state.current_phase, state.started_at, idle_secs
    );
}

/// A run that holds the sync state until it is finished or dropped
///
/// Dropping without [`ActiveRun::finish`] (early return, `?`, panic)
/// releases the state as a failure.
pub struct ActiveRun<'a> {
    machine: &'a SyncStateMachine,
    phase: SyncPhase,
    finished: bool,
}

impl ActiveRun<'_> {
    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn heartbeat(&self) -> Result<()> {
        self.machine.heartbeat()
    }

    pub fn finish(mut self, success: bool) -> Result<()> {
        self.finished = true;
        self.machine.release(success)
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        if !self.finished
            && let Err(e) = self.machine.release(false)
        {
            error!("Failed to release abandoned {} sync: {:#}", self.phase, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;
    use std::thread;

    fn machine(dir: &tempfile::TempDir) -> SyncStateMachine {
        SyncStateMachine::open(dir.path().join(STATE_FILE)).unwrap()
    }

    fn write_state(dir: &tempfile::TempDir, state: &SyncState) {
        config::save_json_atomic(&dir.path().join(STATE_FILE), state).unwrap();
    }

    #[test]
    fn test_missing_file_starts_idle() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(&dir);
        assert_eq!(machine.snapshot(), SyncState::default());
    }

    #[test]
    fn test_acquire_release_cycle_persists() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(&dir);

        assert!(machine.acquire(SyncPhase::Quick).unwrap());
        let on_disk: SyncState = config::load_json_file(machine.path()).unwrap();
        assert!(on_disk.running);
        assert_eq!(on_disk.current_phase, SyncPhase::Quick);

        machine.release(true).unwrap();
        let on_disk: SyncState = config::load_json_file(machine.path()).unwrap();
        assert!(!on_disk.running);
        assert_eq!(on_disk.total_runs, 1);
        assert_eq!(on_disk.success_count, 1);
        assert!(on_disk.last_success_at.is_some());
        assert_eq!(on_disk.last_run_phase, SyncPhase::Quick);
    }

    #[test]
    fn test_second_acquire_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(&dir);

        assert!(machine.acquire(SyncPhase::Full).unwrap());
        assert!(!machine.acquire(SyncPhase::Quick).unwrap());
        assert_eq!(machine.snapshot().current_phase, SyncPhase::Full);
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let machine = Arc::new(machine(&dir));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let machine = machine.clone();
                thread::spawn(move || machine.acquire(SyncPhase::Quick).unwrap())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_release_without_acquire_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(&dir);

        machine.release(false).unwrap();
        let state = machine.snapshot();
        assert_eq!(state.total_runs, 0);
        assert_eq!(state.failure_count, 0);
        assert!(!machine.path().exists());
    }

    #[test]
    fn test_stale_state_repaired_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut stuck = SyncState::default();
        stuck.begin(SyncPhase::Full, Utc::now() - Duration::hours(3));
        stuck.total_runs = 4;
        write_state(&dir, &stuck);

        let machine = machine(&dir);
        let state = machine.snapshot();
        assert!(!state.running);
        assert_eq!(state.current_phase, SyncPhase::None);
        // Clearing an abandoned run is not a finished run
        assert_eq!(state.total_runs, 4);

        let on_disk: SyncState = config::load_json_file(machine.path()).unwrap();
        assert!(!on_disk.running);
    }

    #[test]
    fn test_fresh_running_state_survives_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut running = SyncState::default();
        running.begin(SyncPhase::Quick, Utc::now() - Duration::minutes(10));
        write_state(&dir, &running);

        let machine = machine(&dir);
        assert!(machine.is_running());
        assert!(!machine.acquire(SyncPhase::Full).unwrap());
        assert!(!machine.repair_stale().unwrap());
    }

    #[test]
    fn test_inconsistent_running_state_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let broken = SyncState {
            running: true,
            ..SyncState::default()
        };
        write_state(&dir, &broken);

        let machine = machine(&dir);
        assert!(!machine.is_running());
        assert!(machine.acquire(SyncPhase::Quick).unwrap());
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), "{not json").unwrap();

        let machine = machine(&dir);
        assert_eq!(machine.snapshot(), SyncState::default());
        assert!(machine.acquire(SyncPhase::Quick).unwrap());
    }

    #[test]
    fn test_heartbeat_moves_last_activity() {
        let dir = tempfile::tempdir().unwrap();
        let mut running = SyncState::default();
        let started = Utc::now() - Duration::minutes(30);
        running.begin(SyncPhase::Full, started);
        write_state(&dir, &running);

        let machine = machine(&dir);
        machine.heartbeat().unwrap();
        let state = machine.snapshot();
        assert!(state.last_activity_at.unwrap() > started);
        assert_eq!(state.started_at, Some(started));
    }

    #[test]
    fn test_dropped_run_releases_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(&dir);

        {
            let run = machine.begin(SyncPhase::Quick).unwrap().unwrap();
            run.heartbeat().unwrap();
            assert!(machine.begin(SyncPhase::Full).unwrap().is_none());
        }

        let state = machine.snapshot();
        assert!(!state.running);
        assert_eq!(state.failure_count, 1);
        assert!(state.last_failure_at.is_some());
    }

    #[test]
    fn test_finished_run_is_not_released_twice() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(&dir);

        let run = machine.begin(SyncPhase::Full).unwrap().unwrap();
        run.finish(true).unwrap();

        let state = machine.snapshot();
        assert_eq!(state.total_runs, 1);
        assert_eq!(state.success_count, 1);
        assert_eq!(state.failure_count, 0);
    }

    #[test]
    fn test_failed_release_write_still_goes_idle() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(&dir);
        let run = machine.begin(SyncPhase::Quick).unwrap().unwrap();

        // Replace the state file with a directory so the rename fails
        std::fs::remove_file(machine.path()).unwrap();
        std::fs::create_dir(machine.path()).unwrap();
        std::fs::write(machine.path().join("occupied"), "x").unwrap();

        assert!(run.finish(true).is_err());
        let state = machine.snapshot();
        assert!(!state.running);
        assert_eq!(state.total_runs, 1);
        assert_eq!(state.success_count, 1);
        assert_eq!(state.failure_count, 0);
    }

    #[test]
    fn test_read_status_tolerates_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE);

        let status = SyncStateMachine::read_status(&path);
        assert_eq!(status.state, SyncState::default());

        std::fs::write(&path, "{truncated").unwrap();
        let status = SyncStateMachine::read_status(&path);
        assert_eq!(status.state, SyncState::default());
        assert!(!status.stale);

        let mut running = SyncState::default();
        running.begin(SyncPhase::Full, Utc::now() - Duration::hours(3));
        write_state(&dir, &running);
        let status = SyncStateMachine::read_status(&path);
        assert!(status.stale);
        // Reading never repairs
        let on_disk: SyncState = config::load_json_file(&path).unwrap();
        assert!(on_disk.running);
    }

    #[test]
    fn test_status_reports_elapsed() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(&dir);
        assert_eq!(machine.status().elapsed_secs, None);

        machine.acquire(SyncPhase::Quick).unwrap();
        let status = machine.status();
        assert!(status.state.running);
        assert!(status.elapsed_secs.is_some());
        assert!(!status.stale);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["currentPhase"], "QUICK");
        assert_eq!(json["running"], true);
    }
}
