//! Sync driver
//!
//! Runs a [`SyncPlan`] task by task under the sync state machine. Each task
//! commits independently; how a failure affects the run depends on whether
//! the task is required.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use log::{error, info, warn};

use super::fetcher::{FetchOutcome, FetchPolicy, FetchStatus, PageSource, fetch_entity};
use super::plan::{SyncKind, SyncPlan, SyncTask};
use super::state::SyncStateMachine;
use crate::error::AuthError;
use crate::storage::RowSink;

/// Result of one task in a run
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub group: &'static str,
    pub entity: &'static str,
    pub required: bool,
    /// `Err` when no credential could be obtained for the task
    pub result: Result<FetchOutcome, AuthError>,
}

impl TaskReport {
    fn new(task: &SyncTask, result: Result<FetchOutcome, AuthError>) -> Self {
        Self {
            group: task.group,
            entity: task.entity.name,
            required: task.required,
            result,
        }
    }

    /// Whether the task fetched everything it asked for
    pub fn is_complete(&self) -> bool {
        matches!(&self.result, Ok(outcome) if outcome.status.is_complete())
    }

    pub fn pulled(&self) -> usize {
        self.result.as_ref().map_or(0, |outcome| outcome.pulled)
    }
}

/// Statistics from one sync run
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub kind: SyncKind,
    /// Every required task completed
    pub success: bool,
    /// A credential failure on a required task stopped the run early
    pub aborted: bool,
    pub tasks: Vec<TaskReport>,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn total_pulled(&self) -> usize {
        self.tasks.iter().map(TaskReport::pulled).sum()
    }

    pub fn task(&self, entity: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.entity == entity)
    }
}

/// Drives sync plans against a page source and a row sink
pub struct SyncEngine {
    source: Arc<dyn PageSource>,
    sink: Arc<dyn RowSink>,
    state: Arc<SyncStateMachine>,
    policy: FetchPolicy,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn PageSource>,
        sink: Arc<dyn RowSink>,
        state: Arc<SyncStateMachine>,
        policy: FetchPolicy,
    ) -> Self {
        Self {
            source,
            sink,
            state,
            policy,
        }
    }

    pub fn state(&self) -> &SyncStateMachine {
        &self.state
    }

    /// Run the standard plan for `kind`
    ///
    /// Returns `None` without doing anything if another sync holds the
    /// state.
    pub fn run(&self, kind: SyncKind) -> Result<Option<SyncReport>> {
        self.run_plan(&SyncPlan::for_kind(kind))
    }

    pub fn run_plan(&self, plan: &SyncPlan) -> Result<Option<SyncReport>> {
        let Some(run) = self.state.begin(plan.kind.into())? else {
            info!("Skipping {} sync: another sync is running", plan.kind);
            return Ok(None);
        };

        let start = Instant::now();
        let mut report = SyncReport {
            kind: plan.kind,
            success: true,
            aborted: false,
            tasks: Vec::with_capacity(plan.tasks.len()),
            duration_ms: 0,
        };

        for task in &plan.tasks {
            info!("Syncing {} ({})", task.entity.name, task.group);
            let result = fetch_entity(
                self.source.as_ref(),
                self.sink.as_ref(),
                task.entity,
                &self.policy,
            );

            match &result {
                Ok(outcome) => match &outcome.status {
                    FetchStatus::Complete => {}
                    status if task.required => {
                        warn!("Required task {} did not complete: {:?}", task.entity.name, status);
                        report.success = false;
                    }
                    status => {
                        info!("Optional task {} skipped: {:?}", task.entity.name, status);
                    }
                },
                Err(e) if task.required => {
                    error!(
                        "Aborting {} sync: credential failure on {}: {}",
                        plan.kind, task.entity.name, e
                    );
                    report.success = false;
                    report.aborted = true;
                }
                Err(e) => {
                    warn!("Optional task {} failed: {}", task.entity.name, e);
                }
            }

            report.tasks.push(TaskReport::new(task, result));
            if report.aborted {
                break;
            }
            if let Err(e) = run.heartbeat() {
                warn!("Failed to record sync heartbeat: {:#}", e);
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        run.finish(report.success)?;

        info!(
            "{} sync {}: {} records across {} tasks in {}ms",
            plan.kind,
            if report.success { "succeeded" } else { "failed" },
            report.total_pulled(),
            report.tasks.len(),
            report.duration_ms
        );
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntitySpec;
    use crate::error::FetchError;
    use crate::models::SyncPhase;
    use crate::storage::InMemoryStore;
    use crate::sync::fetcher::{Page, PageRequest};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Serves one page of two records per relation, with per-relation
    /// failure overrides
    #[derive(Default)]
    struct FakeSource {
        failures: HashMap<&'static str, FetchError>,
    }

    impl FakeSource {
        fn failing(mut self, relation: &'static str, error: FetchError) -> Self {
            self.failures.insert(relation, error);
            self
        }
    }

    impl PageSource for FakeSource {
        fn fetch_page(&self, entity: &EntitySpec, _: &PageRequest) -> Result<Page, FetchError> {
            if let Some(error) = self.failures.get(entity.relation) {
                return Err(error.clone());
            }
            Ok(Page {
                records: vec![json!({"id": 1, "name": "a"}), json!({"id": 2, "name": "b"})],
                has_more: Some(false),
            })
        }

        fn fetch_children(&self, entity: &EntitySpec, _: &str) -> Result<Page, FetchError> {
            self.fetch_page(entity, &PageRequest::first(entity.page_size))
        }
    }

    fn engine(source: FakeSource) -> (SyncEngine, Arc<InMemoryStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(SyncStateMachine::open(dir.path().join("sync-state.json")).unwrap());
        let sink = Arc::new(InMemoryStore::new());
        let policy = FetchPolicy {
            retry_delay: Duration::ZERO,
            pacing_override: Some(Duration::ZERO),
            ..FetchPolicy::default()
        };
        let engine = SyncEngine::new(Arc::new(source), sink.clone(), state, policy);
        (engine, sink, dir)
    }

    #[test]
    fn test_quick_sync_runs_core_entities() {
        let (engine, sink, _dir) = engine(FakeSource::default());

        let report = engine.run(SyncKind::Quick).unwrap().unwrap();

        assert!(report.success);
        assert_eq!(report.tasks.len(), 3);
        assert_eq!(report.total_pulled(), 6);
        assert_eq!(sink.count("appointments").unwrap(), 2);
        assert_eq!(sink.count("customers").unwrap(), 0);

        let state = engine.state().snapshot();
        assert!(!state.running);
        assert_eq!(state.success_count, 1);
        assert_eq!(state.last_run_phase, SyncPhase::Quick);
    }

    #[test]
    fn test_optional_failure_keeps_run_successful() {
        let source = FakeSource::default()
            .failing("job_types", FetchError::Unavailable { status: 404 })
            .failing("business_units", FetchError::Transient("HTTP 500".into()))
            .failing("technician_categories", FetchError::Auth(AuthError::Timeout));
        let (engine, sink, _dir) = engine(source);

        let report = engine.run(SyncKind::Full).unwrap().unwrap();

        assert!(report.success);
        assert!(!report.aborted);
        assert_eq!(report.tasks.len(), 11);
        assert!(!report.task("job types").unwrap().is_complete());
        assert_eq!(sink.count("estimates").unwrap(), 2);
        assert_eq!(engine.state().snapshot().success_count, 1);
    }

    #[test]
    fn test_required_partial_fails_run_but_continues() {
        let source =
            FakeSource::default().failing("jobs", FetchError::Transient("HTTP 503".into()));
        let (engine, sink, _dir) = engine(source);

        let report = engine.run(SyncKind::Full).unwrap().unwrap();

        assert!(!report.success);
        assert!(!report.aborted);
        assert_eq!(report.tasks.len(), 11);
        assert_eq!(sink.count("appointments").unwrap(), 2);
        assert_eq!(sink.count("technicians").unwrap(), 2);

        let state = engine.state().snapshot();
        assert_eq!(state.failure_count, 1);
        assert_eq!(state.success_count, 0);
    }

    #[test]
    fn test_required_auth_failure_aborts_run() {
        let source =
            FakeSource::default().failing("jobs", FetchError::Auth(AuthError::Timeout));
        let (engine, sink, _dir) = engine(source);

        let report = engine.run(SyncKind::Quick).unwrap().unwrap();

        assert!(!report.success);
        assert!(report.aborted);
        assert_eq!(report.tasks.len(), 2);
        assert_eq!(sink.count("invoices").unwrap(), 2);
        assert_eq!(sink.count("appointments").unwrap(), 0);
        assert!(!engine.state().is_running());
    }

    #[test]
    fn test_overlapping_run_is_noop() {
        let (engine, _sink, _dir) = engine(FakeSource::default());
        assert!(engine.state().acquire(SyncPhase::Full).unwrap());

        assert!(engine.run(SyncKind::Quick).unwrap().is_none());
        assert_eq!(engine.state().snapshot().current_phase, SyncPhase::Full);
    }
}
