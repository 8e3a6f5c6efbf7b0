//! Fieldsync crate - Business logic for field-service data replication
//!
//! This crate provides the sync orchestration engine:
//! - Credential cache with single-flight token refresh
//! - Authenticated, paginated API client
//! - Entity catalog and declarative record mapping
//! - Storage trait abstractions (SQLite, in-memory)
//! - Crash-recoverable sync state machine and scheduler
//! - Single-host process lock
//!
//! The engine is synchronous; only the scheduler needs an async runtime.

pub mod api;
pub mod config;
pub mod entities;
pub mod error;
pub mod lock;
pub mod models;
pub mod storage;
pub mod sync;

pub use api::{ApiClient, ClientCredentialsExchange, Credential, CredentialCache, UreqTransport};
pub use config::ServiceSettings;
pub use entities::{EntityId, EntitySpec, ParentScope, catalog, map_child_record, map_record};
pub use error::{AuthError, FetchError, RecordError, RequestError, TransportError};
pub use lock::{LOCK_FILE, ProcessLock, ProcessLockGuard};
pub use models::{LockRecord, Row, SyncPhase, SyncState};
pub use storage::{InMemoryStore, RowSink, SqliteStore};
pub use sync::{
    // Sync execution
    FetchOutcome, FetchPolicy, FetchStatus, SyncEngine, SyncKind, SyncPlan, SyncReport,
    TaskReport, fetch_entity, run_child_fetch, run_fetch,
    // State and scheduling
    LockedRunner, ScheduleConfig, SyncRunner, SyncStateMachine, SyncStatus, run_scheduler, serve,
};
