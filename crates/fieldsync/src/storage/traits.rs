//! Storage trait definitions

use crate::entities::ParentScope;
use crate::models::Row;
use anyhow::Result;
use chrono::NaiveDate;

/// Trait for the relational sink every entity sync writes into
///
/// Implementations must make `upsert` idempotent: inserting a row whose
/// natural key already exists updates every column in place.
pub trait RowSink: Send + Sync {
    /// Insert or update a row by its natural key
    fn upsert(&self, row: &Row) -> Result<()>;

    /// Count rows in a relation
    fn count(&self, relation: &str) -> Result<usize>;

    /// Keys of the parent rows dated on or after `since`, newest first,
    /// capped at the scope's limit. Rows without a date are never selected.
    fn recent_keys(&self, scope: &ParentScope, since: NaiveDate) -> Result<Vec<String>>;
}
