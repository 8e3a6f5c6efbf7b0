//! In-memory row storage for testing

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use chrono::NaiveDate;

use super::traits::RowSink;
use crate::entities::ParentScope;
use crate::models::{Row, value_text};

/// In-memory sink keyed by relation and key text
///
/// Keys are compared by their text form so that `5` and `"5"` collide the
/// way they do in the SQLite store.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    relations: HashMap<String, BTreeMap<String, Row>>,
    failing_keys: HashSet<String>,
    writes: usize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every upsert of this key fail
    pub fn fail_on_key(&self, key: impl Into<String>) {
        self.inner().failing_keys.insert(key.into());
    }

    /// Stored row for a key, if any
    pub fn get(&self, relation: &str, key: &str) -> Option<Row> {
        self.inner()
            .relations
            .get(relation)
            .and_then(|rows| rows.get(key))
            .cloned()
    }

    /// Keys stored for a relation, sorted
    pub fn keys(&self, relation: &str) -> Vec<String> {
        self.inner()
            .relations
            .get(relation)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of successful upserts, including updates in place
    pub fn write_count(&self) -> usize {
        self.inner().writes
    }
}

impl RowSink for InMemoryStore {
    fn upsert(&self, row: &Row) -> Result<()> {
        let key = row.key_text();
        let mut inner = self.inner();
        if inner.failing_keys.contains(&key) {
            bail!("Injected failure for {} {}", row.relation, key);
        }

        inner
            .relations
            .entry(row.relation.to_string())
            .or_default()
            .insert(key, row.clone());
        inner.writes += 1;
        Ok(())
    }

    fn count(&self, relation: &str) -> Result<usize> {
        Ok(self
            .inner()
            .relations
            .get(relation)
            .map_or(0, BTreeMap::len))
    }

    fn recent_keys(&self, scope: &ParentScope, since: NaiveDate) -> Result<Vec<String>> {
        let since = since.to_string();
        let inner = self.inner();
        let Some(rows) = inner.relations.get(scope.relation) else {
            return Ok(Vec::new());
        };

        let mut dated: Vec<(String, String)> = rows
            .iter()
            .filter_map(|(key, row)| {
                let date = row.get(scope.date_column).filter(|v| !v.is_null())?;
                Some((value_text(date), key.clone()))
            })
            .filter(|(date, _)| *date >= since)
            .collect();
        dated.sort_by(|a, b| b.cmp(a));
        Ok(dated
            .into_iter()
            .take(scope.limit)
            .map(|(_, key)| key)
            .collect())
    }
}
