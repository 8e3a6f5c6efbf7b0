//! Periodic sync scheduling
//!
//! Three independent triggers: quick sync, full sync, and a status probe.
//! Syncs run on the blocking pool; a trigger that fires while a sync is
//! still running is skipped, never queued. The probe also keeps the process
//! lock fresh.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};

use super::engine::{SyncEngine, SyncReport};
use super::plan::SyncKind;
use super::state::SyncStatus;
use crate::lock::ProcessLock;

/// Trigger intervals for the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub quick_interval: Duration,
    pub full_interval: Duration,
    pub probe_interval: Duration,
    /// Delay before the first quick sync after startup
    pub startup_delay: Duration,
    /// How long shutdown waits for an in-flight sync
    pub shutdown_grace: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            quick_interval: Duration::from_secs(30 * 60),
            full_interval: Duration::from_secs(3 * 60 * 60),
            probe_interval: Duration::from_secs(15 * 60),
            startup_delay: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// What the scheduler drives
pub trait SyncRunner: Send + Sync {
    /// Clear a stuck sync left behind by a previous process
    fn repair(&self) -> Result<bool>;

    /// Run one sync; `None` when another sync holds the state
    fn run_sync(&self, kind: SyncKind) -> Result<Option<SyncReport>>;

    /// Current state, for the status probe
    fn probe(&self) -> SyncStatus;

    /// Called on every probe tick. Returning `false` stops the scheduler.
    fn keep_alive(&self) -> Result<bool> {
        Ok(true)
    }
}

impl SyncRunner for SyncEngine {
    fn repair(&self) -> Result<bool> {
        self.state().repair_stale()
    }

    fn run_sync(&self, kind: SyncKind) -> Result<Option<SyncReport>> {
        self.run(kind)
    }

    fn probe(&self) -> SyncStatus {
        self.state().status()
    }
}

/// Runs `runner` under a process lock, refreshing it on every probe
pub struct LockedRunner<R> {
    runner: R,
    lock: ProcessLock,
}

impl<R: SyncRunner> LockedRunner<R> {
    pub fn new(runner: R, lock: ProcessLock) -> Self {
        Self { runner, lock }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }
}

impl<R: SyncRunner> SyncRunner for LockedRunner<R> {
    fn repair(&self) -> Result<bool> {
        self.runner.repair()
    }

    fn run_sync(&self, kind: SyncKind) -> Result<Option<SyncReport>> {
        self.runner.run_sync(kind)
    }

    fn probe(&self) -> SyncStatus {
        self.runner.probe()
    }

    fn keep_alive(&self) -> Result<bool> {
        if !self.lock.refresh()? {
            return Ok(false);
        }
        self.runner.keep_alive()
    }
}

struct InFlight {
    kind: SyncKind,
    handle: JoinHandle<()>,
}

impl InFlight {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Run the schedule until `shutdown` resolves.
///
/// Repairs stale state once, runs a quick sync after the startup delay,
/// then keeps all three triggers going.
pub async fn run_scheduler<R, F>(runner: Arc<R>, config: ScheduleConfig, shutdown: F)
where
    R: SyncRunner + 'static,
    F: Future<Output = ()>,
{
    info!(
        "Scheduler started (quick every {}s, full every {}s, probe every {}s)",
        config.quick_interval.as_secs(),
        config.full_interval.as_secs(),
        config.probe_interval.as_secs()
    );

    match runner.repair() {
        Ok(true) => warn!("Recovered stuck sync state at startup"),
        Ok(false) => {}
        Err(e) => error!("Failed to repair sync state: {:#}", e),
    }

    let start = Instant::now();
    let mut quick = interval_at(start + config.startup_delay, config.quick_interval);
    let mut full = interval_at(start + config.full_interval, config.full_interval);
    let mut probe = interval_at(start + config.probe_interval, config.probe_interval);
    for timer in [&mut quick, &mut full, &mut probe] {
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    }

    tokio::pin!(shutdown);
    let mut in_flight: Option<InFlight> = None;

    loop {
        let kind = tokio::select! {
            _ = &mut shutdown => break,
            _ = quick.tick() => SyncKind::Quick,
            _ = full.tick() => SyncKind::Full,
            _ = probe.tick() => {
                log_probe(&runner.probe());
                match runner.keep_alive() {
                    Ok(true) => continue,
                    Ok(false) => {
                        error!("Lost exclusive ownership, stopping scheduler");
                        break;
                    }
                    Err(e) => {
                        warn!("Keep-alive failed: {:#}", e);
                        continue;
                    }
                }
            }
        };

        if let Some(running) = &in_flight
            && running.is_running()
        {
            info!(
                "Skipping {} sync trigger: {} sync still running",
                kind, running.kind
            );
            continue;
        }
        in_flight = Some(dispatch(runner.clone(), kind));
    }

    info!("Scheduler shutting down");
    if let Some(running) = in_flight
        && running.is_running()
    {
        info!("Waiting for {} sync to finish", running.kind);
        if timeout(config.shutdown_grace, running.handle).await.is_err() {
            warn!(
                "{} sync still running after {}s, leaving it",
                running.kind,
                config.shutdown_grace.as_secs()
            );
        }
    }
}

/// Run the scheduler on its own multi-thread runtime until `shutdown`.
///
/// A sync still running once the shutdown grace has passed is abandoned:
/// the runtime is shut down without waiting for blocking tasks, so the
/// caller can release its lock and exit.
pub fn serve<R, F>(runner: Arc<R>, config: ScheduleConfig, shutdown: F) -> Result<()>
where
    R: SyncRunner + 'static,
    F: Future<Output = ()>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(run_scheduler(runner, config, shutdown));
    runtime.shutdown_background();
    Ok(())
}

fn dispatch<R: SyncRunner + 'static>(runner: Arc<R>, kind: SyncKind) -> InFlight {
    let handle = tokio::task::spawn_blocking(move || match runner.run_sync(kind) {
        Ok(Some(report)) => debug!(
            "{} sync report: success={}, tasks={}",
            kind,
            report.success,
            report.tasks.len()
        ),
        Ok(None) => info!("{} sync skipped: another sync holds the state", kind),
        Err(e) => error!("{} sync failed: {:#}", kind, e),
    });
    InFlight { kind, handle }
}

fn log_probe(status: &SyncStatus) {
    let state = &status.state;
    if !state.running {
        info!(
            "Sync idle (last success {:?}, {} runs, {} failures)",
            state.last_success_at, state.total_runs, state.failure_count
        );
        return;
    }

    let elapsed = status.elapsed_secs.unwrap_or_default();
    if status.stale {
        warn!(
            "{} sync looks stuck: running for {}m without progress",
            state.current_phase,
            elapsed / 60
        );
    } else {
        info!("{} sync running for {}m", state.current_phase, elapsed / 60);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LockRecord, SyncState};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Mutex, mpsc};
    use tokio::sync::Notify;

    fn idle_status() -> SyncStatus {
        SyncStatus {
            state: SyncState::default(),
            elapsed_secs: None,
            stale: false,
        }
    }

    struct CountingRunner {
        repairs: AtomicUsize,
        probes: AtomicUsize,
        keep_alives: AtomicUsize,
        alive: AtomicBool,
        runs: Mutex<Vec<SyncKind>>,
    }

    impl Default for CountingRunner {
        fn default() -> Self {
            Self {
                repairs: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
                keep_alives: AtomicUsize::new(0),
                alive: AtomicBool::new(true),
                runs: Mutex::new(Vec::new()),
            }
        }
    }

    impl CountingRunner {
        fn runs_of(&self, kind: SyncKind) -> usize {
            self.runs.lock().unwrap().iter().filter(|k| **k == kind).count()
        }
    }

    impl SyncRunner for CountingRunner {
        fn repair(&self) -> Result<bool> {
            self.repairs.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }

        fn run_sync(&self, kind: SyncKind) -> Result<Option<SyncReport>> {
            self.runs.lock().unwrap().push(kind);
            Ok(None)
        }

        fn probe(&self) -> SyncStatus {
            self.probes.fetch_add(1, Ordering::SeqCst);
            idle_status()
        }

        fn keep_alive(&self) -> Result<bool> {
            self.keep_alives.fetch_add(1, Ordering::SeqCst);
            Ok(self.alive.load(Ordering::SeqCst))
        }
    }

    /// Blocks inside `run_sync` until the test releases it
    struct BlockingRunner {
        started: Notify,
        finished: Notify,
        release: Mutex<mpsc::Receiver<()>>,
        runs: Mutex<Vec<SyncKind>>,
    }

    impl BlockingRunner {
        fn new(release: mpsc::Receiver<()>) -> Self {
            Self {
                started: Notify::new(),
                finished: Notify::new(),
                release: Mutex::new(release),
                runs: Mutex::new(Vec::new()),
            }
        }

        fn runs(&self) -> Vec<SyncKind> {
            self.runs.lock().unwrap().clone()
        }
    }

    impl SyncRunner for BlockingRunner {
        fn repair(&self) -> Result<bool> {
            Ok(false)
        }

        fn run_sync(&self, kind: SyncKind) -> Result<Option<SyncReport>> {
            self.runs.lock().unwrap().push(kind);
            self.started.notify_one();
            let _ = self.release.lock().unwrap().recv();
            self.finished.notify_one();
            Ok(None)
        }

        fn probe(&self) -> SyncStatus {
            idle_status()
        }
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_schedule_first_hour() {
        let runner = Arc::new(CountingRunner::default());
        let shutdown = tokio::time::sleep(Duration::from_secs(65 * 60));

        run_scheduler(runner.clone(), ScheduleConfig::default(), shutdown).await;

        assert_eq!(runner.repairs.load(Ordering::SeqCst), 1);
        // At 10s, 30m10s and 60m10s
        assert_eq!(runner.runs_of(SyncKind::Quick), 3);
        assert_eq!(runner.runs_of(SyncKind::Full), 0);
        // At 15, 30, 45 and 60 minutes
        assert_eq!(runner.probes.load(Ordering::SeqCst), 4);
        assert_eq!(runner.keep_alives.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_trigger_fires_on_its_own_interval() {
        let runner = Arc::new(CountingRunner::default());
        let config = ScheduleConfig {
            quick_interval: Duration::from_secs(100),
            full_interval: Duration::from_secs(250),
            probe_interval: Duration::from_secs(1000),
            startup_delay: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(1),
        };
        let shutdown = tokio::time::sleep(Duration::from_secs(300));

        run_scheduler(runner.clone(), config, shutdown).await;

        assert_eq!(runner.runs_of(SyncKind::Quick), 3);
        assert_eq!(runner.runs_of(SyncKind::Full), 1);
        assert_eq!(runner.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_first_sync() {
        let runner = Arc::new(CountingRunner::default());
        let shutdown = tokio::time::sleep(Duration::from_secs(5));

        run_scheduler(runner.clone(), ScheduleConfig::default(), shutdown).await;

        assert_eq!(runner.repairs.load(Ordering::SeqCst), 1);
        assert!(runner.runs.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_are_skipped_while_a_sync_runs() {
        let (release, release_rx) = mpsc::channel();
        let runner = Arc::new(BlockingRunner::new(release_rx));
        let (stop, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let config = ScheduleConfig {
            quick_interval: Duration::from_secs(100),
            full_interval: Duration::from_secs(250),
            probe_interval: Duration::from_secs(1000),
            startup_delay: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        };
        let scheduler = tokio::spawn(run_scheduler(runner.clone(), config, async move {
            let _ = stop_rx.await;
        }));

        // The startup quick sync begins and blocks
        runner.started.notified().await;

        // Quick ticks at 110s and 210s and the full tick at 250s all fire
        // while it is still running. The clock only moves when told to.
        for step in [100, 100, 50] {
            tokio::time::advance(Duration::from_secs(step)).await;
            settle().await;
        }
        assert_eq!(runner.runs(), vec![SyncKind::Quick]);

        release.send(()).unwrap();
        runner.finished.notified().await;
        settle().await;

        // Nothing was queued behind the running sync
        let _ = stop.send(());
        scheduler.await.unwrap();
        assert_eq!(runner.runs(), vec![SyncKind::Quick]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_ownership_stops_scheduler() {
        let runner = Arc::new(CountingRunner::default());
        runner.alive.store(false, Ordering::SeqCst);

        run_scheduler(
            runner.clone(),
            ScheduleConfig::default(),
            std::future::pending::<()>(),
        )
        .await;

        // Stopped at the first probe (15m), after only the startup sync
        assert_eq!(runner.keep_alives.load(Ordering::SeqCst), 1);
        assert_eq!(runner.runs_of(SyncKind::Quick), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_runner_refreshes_lock_on_status_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(crate::lock::LOCK_FILE);
        let lock = ProcessLock::new(&path);
        assert!(lock.acquire().unwrap());

        // As if the service had been up for three hours
        let aged = LockRecord::new(
            lock.owner_id(),
            std::process::id(),
            chrono::Utc::now() - chrono::Duration::hours(3),
        );
        std::fs::write(&path, serde_json::to_string(&aged).unwrap()).unwrap();
        assert!(!ProcessLock::is_held(&path));

        let runner = Arc::new(LockedRunner::new(CountingRunner::default(), lock.clone()));
        let shutdown = tokio::time::sleep(Duration::from_secs(16 * 60));
        run_scheduler(runner.clone(), ScheduleConfig::default(), shutdown).await;

        assert_eq!(runner.runner().keep_alives.load(Ordering::SeqCst), 1);
        assert!(ProcessLock::is_held(&path));
        assert!(!ProcessLock::new(&path).acquire().unwrap());
        assert!(lock.is_acquired());
    }

    #[test]
    fn test_serve_does_not_wait_past_grace_for_running_sync() {
        let (release, release_rx) = mpsc::channel();
        let runner = Arc::new(BlockingRunner::new(release_rx));
        let config = ScheduleConfig {
            startup_delay: Duration::ZERO,
            shutdown_grace: Duration::from_millis(200),
            ..ScheduleConfig::default()
        };

        let start = std::time::Instant::now();
        serve(runner.clone(), config, async {
            tokio::time::sleep(Duration::from_millis(300)).await;
        })
        .unwrap();
        let elapsed = start.elapsed();

        // The sync is still blocked; serve returned anyway
        assert_eq!(runner.runs(), vec![SyncKind::Quick]);
        assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);
        release.send(()).unwrap();
    }
}
