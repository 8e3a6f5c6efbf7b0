//! Paginated fetch with retry
//!
//! Walks one entity's endpoint page by page, upserting every record into the
//! sink. Page failures are retried in place up to a consecutive-error
//! ceiling; record failures are counted and skipped. Only a credential
//! failure escapes as an error.
//!
//! Per-parent entities (notes and history under recent jobs) are fetched
//! with one request per stored parent key instead of a page walk.

use std::time::{Duration, Instant};

use chrono::{DateTime, Days, Utc};
use log::{debug, error, info, warn};
use serde_json::Value;

use crate::entities::{EntitySpec, ParentScope, Termination, map_child_record, map_record};
use crate::error::{AuthError, FetchError, RecordError};
use crate::models::Row;
use crate::storage::RowSink;

/// One page to request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number
    pub page: u32,
    pub page_size: u32,
    /// Lower time bound for entities that accept one
    pub watermark: Option<DateTime<Utc>>,
}

impl PageRequest {
    pub fn first(page_size: u32) -> Self {
        Self {
            page: 1,
            page_size,
            watermark: None,
        }
    }

    pub fn since(mut self, watermark: Option<DateTime<Utc>>) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn next(self) -> Self {
        Self {
            page: self.page + 1,
            ..self
        }
    }
}

/// A decoded page of remote records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<Value>,
    /// The response's `hasMore` flag, when it carried one
    pub has_more: Option<bool>,
}

impl Page {
    /// Whether another page should be requested after this one
    pub fn has_next(&self, termination: Termination, page_size: u32) -> bool {
        if self.records.is_empty() {
            return false;
        }
        match termination {
            Termination::HasMoreFlag => self.has_more.unwrap_or(false),
            Termination::ShortPage => self.records.len() >= page_size as usize,
            Termination::SinglePage => false,
        }
    }
}

/// Something that can serve pages of an entity
pub trait PageSource: Send + Sync {
    fn fetch_page(&self, entity: &EntitySpec, request: &PageRequest) -> Result<Page, FetchError>;

    /// Fetch everything a per-parent entity holds under one parent key
    fn fetch_children(&self, entity: &EntitySpec, parent: &str) -> Result<Page, FetchError>;
}

/// Retry and pacing knobs for one fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPolicy {
    /// Page failures in a row before giving up on the entity
    pub max_consecutive_errors: u32,
    /// Wait before retrying the same page
    pub retry_delay: Duration,
    /// Replaces every entity's own pacing delay when set
    pub pacing_override: Option<Duration>,
    /// Lower time bound passed to entities with a watermark parameter
    pub watermark: Option<DateTime<Utc>>,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 3,
            retry_delay: Duration::from_secs(2),
            pacing_override: None,
            watermark: None,
        }
    }
}

impl FetchPolicy {
    fn pacing_for(&self, entity: &EntitySpec) -> Duration {
        self.pacing_override.unwrap_or(entity.pacing)
    }
}

/// How a fetch ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    /// Reached the end of the data
    Complete,
    /// Gave up after the consecutive-error ceiling; earlier pages are kept
    Partial { error: String },
    /// Every candidate endpoint answered 403/404
    Unavailable { status: u16 },
}

impl FetchStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, FetchStatus::Complete)
    }
}

/// Statistics from one entity fetch
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub entity: &'static str,
    /// Records upserted
    pub pulled: usize,
    /// Records skipped because they could not be mapped or stored
    pub record_failures: usize,
    /// Pages fetched successfully (one per parent for per-parent entities)
    pub pages: u32,
    /// Page requests that failed and were retried
    pub retries: u32,
    pub status: FetchStatus,
    pub duration_ms: u64,
}

impl FetchOutcome {
    fn new(entity: &'static str) -> Self {
        Self {
            entity,
            pulled: 0,
            record_failures: 0,
            pages: 0,
            retries: 0,
            status: FetchStatus::Complete,
            duration_ms: 0,
        }
    }
}

/// Fetch `entity` the way its descriptor asks for
pub fn fetch_entity(
    source: &dyn PageSource,
    sink: &dyn RowSink,
    entity: &EntitySpec,
    policy: &FetchPolicy,
) -> Result<FetchOutcome, AuthError> {
    match &entity.parent {
        Some(scope) => run_child_fetch(source, sink, entity, scope, policy),
        None => run_fetch(source, sink, entity, policy),
    }
}

/// Fetch every page of `entity` from `source` into `sink`
///
/// Re-running is safe: rows are upserted by natural key, so a repeated
/// fetch of the same data leaves the store unchanged.
pub fn run_fetch(
    source: &dyn PageSource,
    sink: &dyn RowSink,
    entity: &EntitySpec,
    policy: &FetchPolicy,
) -> Result<FetchOutcome, AuthError> {
    let start = Instant::now();
    let mut outcome = FetchOutcome::new(entity.name);
    let watermark = entity.watermark_param.and(policy.watermark);
    let mut request = PageRequest::first(entity.page_size).since(watermark);
    let mut consecutive_errors = 0;

    loop {
        let page = match source.fetch_page(entity, &request) {
            Ok(page) => page,
            Err(FetchError::Auth(e)) => {
                error!("Credential failure while fetching {}: {}", entity.name, e);
                return Err(e);
            }
            Err(FetchError::Unavailable { status }) => {
                warn!("{} unavailable (HTTP {}), skipping", entity.name, status);
                outcome.status = FetchStatus::Unavailable { status };
                break;
            }
            Err(FetchError::Transient(message)) => {
                consecutive_errors += 1;
                if consecutive_errors >= policy.max_consecutive_errors {
                    error!(
                        "Giving up on {} at page {} after {} consecutive errors: {}",
                        entity.name, request.page, consecutive_errors, message
                    );
                    outcome.status = FetchStatus::Partial { error: message };
                    break;
                }
                warn!(
                    "Page {} of {} failed ({}/{}): {}; retrying",
                    request.page,
                    entity.name,
                    consecutive_errors,
                    policy.max_consecutive_errors,
                    message
                );
                outcome.retries += 1;
                std::thread::sleep(policy.retry_delay);
                continue;
            }
        };

        consecutive_errors = 0;
        outcome.pages += 1;

        for record in &page.records {
            match store_record(sink, entity, record) {
                Ok(()) => outcome.pulled += 1,
                Err(e) => {
                    warn!("Skipping {} record: {}", entity.name, e);
                    outcome.record_failures += 1;
                }
            }
        }

        debug!(
            "{} page {}: {} records",
            entity.name,
            request.page,
            page.records.len()
        );

        if !page.has_next(entity.termination, request.page_size) {
            break;
        }

        std::thread::sleep(policy.pacing_for(entity));
        request = request.next();
    }

    outcome.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "Fetched {}: {} records over {} pages ({} skipped) in {}ms",
        entity.name, outcome.pulled, outcome.pages, outcome.record_failures, outcome.duration_ms
    );
    Ok(outcome)
}

/// Fetch `entity` once for each recent parent key found in `sink`
///
/// Parents answering 403/404 are skipped silently. Other failures are
/// logged and the next parent is tried; the ceiling applies to failures in
/// a row, so a downed API stops the walk early.
pub fn run_child_fetch(
    source: &dyn PageSource,
    sink: &dyn RowSink,
    entity: &EntitySpec,
    scope: &ParentScope,
    policy: &FetchPolicy,
) -> Result<FetchOutcome, AuthError> {
    let start = Instant::now();
    let mut outcome = FetchOutcome::new(entity.name);

    let today = Utc::now().date_naive();
    let since = today
        .checked_sub_days(Days::new(u64::from(scope.window_days)))
        .unwrap_or(today);
    let parents = match sink.recent_keys(scope, since) {
        Ok(parents) => parents,
        Err(e) => {
            error!("Failed to read {} keys for {}: {:#}", scope.relation, entity.name, e);
            outcome.status = FetchStatus::Partial {
                error: format!("{:#}", e),
            };
            return Ok(outcome);
        }
    };
    info!(
        "Fetching {} for {} {} since {}",
        entity.name,
        parents.len(),
        scope.relation,
        since
    );

    let mut consecutive_errors = 0;
    let mut failed_parents = 0;
    let mut last_error = None;

    for (index, parent) in parents.iter().enumerate() {
        if index > 0 {
            std::thread::sleep(policy.pacing_for(entity));
        }
        if (index + 1) % 50 == 0 {
            debug!("{}: parent {}/{}", entity.name, index + 1, parents.len());
        }

        let page = match source.fetch_children(entity, parent) {
            Ok(page) => page,
            Err(FetchError::Auth(e)) => {
                error!("Credential failure while fetching {}: {}", entity.name, e);
                return Err(e);
            }
            Err(FetchError::Unavailable { status }) => {
                debug!("No {} for {} {} (HTTP {})", entity.name, scope.relation, parent, status);
                continue;
            }
            Err(FetchError::Transient(message)) => {
                warn!("Failed to fetch {} for {} {}: {}", entity.name, scope.relation, parent, message);
                failed_parents += 1;
                consecutive_errors += 1;
                last_error = Some(message);
                if consecutive_errors >= policy.max_consecutive_errors {
                    error!(
                        "Giving up on {} after {} consecutive errors",
                        entity.name, consecutive_errors
                    );
                    break;
                }
                continue;
            }
        };

        consecutive_errors = 0;
        outcome.pages += 1;
        let parent_key = Value::String(parent.clone());
        for record in &page.records {
            let stored = map_child_record(entity, record, &parent_key)
                .and_then(|row| upsert_row(sink, &row));
            match stored {
                Ok(()) => outcome.pulled += 1,
                Err(e) => {
                    warn!("Skipping {} record for {} {}: {}", entity.name, scope.relation, parent, e);
                    outcome.record_failures += 1;
                }
            }
        }
    }

    if let Some(error) = last_error {
        outcome.status = FetchStatus::Partial {
            error: format!("{} of {} parents failed, last: {}", failed_parents, parents.len(), error),
        };
    }
    outcome.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "Fetched {}: {} records from {} of {} {} ({} skipped) in {}ms",
        entity.name,
        outcome.pulled,
        outcome.pages,
        parents.len(),
        scope.relation,
        outcome.record_failures,
        outcome.duration_ms
    );
    Ok(outcome)
}

fn store_record(sink: &dyn RowSink, entity: &EntitySpec, record: &Value) -> Result<(), RecordError> {
    let row = map_record(entity, record)?;
    upsert_row(sink, &row)
}

fn upsert_row(sink: &dyn RowSink, row: &Row) -> Result<(), RecordError> {
    sink.upsert(row).map_err(|e| RecordError::Storage {
        key: row.key_text(),
        message: format!("{:#}", e),
    })
}
