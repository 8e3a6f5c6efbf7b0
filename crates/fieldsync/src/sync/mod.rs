//! Sync engine for replicating remote entities
//!
//! Provides idempotent, resumable sync operations coordinated by a
//! persisted state machine and driven by a scheduler.

mod engine;
mod fetcher;
mod plan;
mod scheduler;
mod state;

pub use engine::{SyncEngine, SyncReport, TaskReport};
pub use fetcher::{
    FetchOutcome, FetchPolicy, FetchStatus, Page, PageRequest, PageSource, fetch_entity,
    run_child_fetch, run_fetch,
};
pub use plan::{SyncKind, SyncPlan, SyncTask};
pub use scheduler::{LockedRunner, ScheduleConfig, SyncRunner, run_scheduler, serve};
pub use state::{ActiveRun, STATE_FILE, SyncStateMachine, SyncStatus};
