//! SQLite-backed row storage for replicated entities

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use rusqlite::types::Value as SqlValue;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use rusqlite_migration::{M, Migrations};
use serde_json::Value;

use super::traits::RowSink;
use crate::entities::ParentScope;
use crate::models::Row;

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Core operational entities
        M::up(
            r#"
            CREATE TABLE invoices (
                invoice_id TEXT PRIMARY KEY,
                customer_name TEXT,
                total REAL,
                balance REAL,
                status TEXT,
                created_at TEXT,
                updated_at TEXT,
                synced_at TEXT NOT NULL
            );

            CREATE INDEX idx_invoices_created_at ON invoices(created_at DESC);

            CREATE TABLE jobs (
                job_id TEXT PRIMARY KEY,
                job_number TEXT,
                customer_id TEXT,
                job_type TEXT,
                technician TEXT,
                location TEXT,
                status TEXT,
                scheduled_date TEXT,
                modified_on TEXT,
                synced_at TEXT NOT NULL
            );

            CREATE INDEX idx_jobs_scheduled_date ON jobs(scheduled_date DESC);

            CREATE TABLE appointments (
                appointment_id TEXT PRIMARY KEY,
                job_id TEXT,
                appointment_number TEXT,
                technician_id TEXT,
                technician_name TEXT,
                scheduled_start TEXT,
                scheduled_end TEXT,
                arrival_window_start TEXT,
                arrival_window_end TEXT,
                status TEXT,
                special_instructions TEXT,
                created_on TEXT,
                modified_on TEXT,
                customer_id TEXT,
                unused INTEGER,
                created_by_id TEXT,
                is_confirmed INTEGER,
                synced_at TEXT NOT NULL
            );

            CREATE INDEX idx_appointments_job_id ON appointments(job_id);
            CREATE INDEX idx_appointments_start ON appointments(scheduled_start DESC);
            "#,
        ),
        // Migration 2: CRM, staff and sales
        M::up(
            r#"
            CREATE TABLE customers (
                customer_id TEXT PRIMARY KEY,
                name TEXT,
                first_name TEXT,
                last_name TEXT,
                company_name TEXT,
                email TEXT,
                phone_number TEXT,
                mobile_number TEXT,
                address_street TEXT,
                address_city TEXT,
                address_state TEXT,
                address_zip TEXT,
                created_on TEXT,
                modified_on TEXT,
                active INTEGER,
                synced_at TEXT NOT NULL
            );

            CREATE TABLE technicians (
                technician_id TEXT PRIMARY KEY,
                name TEXT,
                first_name TEXT,
                last_name TEXT,
                email TEXT,
                phone_number TEXT,
                employee_id TEXT,
                active INTEGER,
                created_on TEXT,
                synced_at TEXT NOT NULL
            );

            CREATE TABLE estimates (
                estimate_id TEXT PRIMARY KEY,
                job_id TEXT,
                customer_id TEXT,
                total REAL,
                status TEXT,
                sold_by TEXT,
                created_on TEXT,
                sold_on TEXT,
                items_count INTEGER NOT NULL DEFAULT 0,
                synced_at TEXT NOT NULL
            );

            CREATE INDEX idx_estimates_job_id ON estimates(job_id);
            "#,
        ),
        // Migration 3: Lookup tables
        M::up(
            r#"
            CREATE TABLE job_types (
                job_type_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                synced_at TEXT NOT NULL
            );

            CREATE TABLE business_units (
                unit_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                synced_at TEXT NOT NULL
            );

            CREATE TABLE technician_categories (
                category_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                synced_at TEXT NOT NULL
            );
            "#,
        ),
        // Migration 4: Per-job notes and history
        M::up(
            r#"
            CREATE TABLE job_notes (
                note_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                note_text TEXT,
                author TEXT,
                author_id TEXT,
                created_on TEXT,
                is_internal INTEGER,
                synced_at TEXT NOT NULL
            );

            CREATE INDEX idx_job_notes_job_id ON job_notes(job_id);
            CREATE INDEX idx_job_notes_created ON job_notes(created_on);

            CREATE TABLE job_history (
                history_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                event_type TEXT,
                description TEXT,
                changed_by TEXT,
                changed_by_id TEXT,
                occurred_at TEXT,
                old_value TEXT,
                new_value TEXT,
                synced_at TEXT NOT NULL
            );

            CREATE INDEX idx_job_history_job_id ON job_history(job_id);
            CREATE INDEX idx_job_history_event ON job_history(event_type);
            CREATE INDEX idx_job_history_occurred ON job_history(occurred_at);
            "#,
        ),
    ])
}

/// SQLite storage for replicated rows
///
/// A single connection behind a mutex; entity tasks run sequentially so
/// there is no write contention to speak of.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL keeps readers (reporting tools) unblocked while a sync writes;
        // NORMAL synchronous is safe with WAL.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        Self::migrate(conn)
    }

    /// In-memory database, mainly for tests
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::migrate(conn)
    }

    fn migrate(mut conn: Connection) -> Result<Self> {
        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read one column of a row as text, `None` when the row is absent
    pub fn column_text(
        &self,
        relation: &str,
        key_column: &str,
        key: &str,
        column: &str,
    ) -> Result<Option<String>> {
        for ident in [relation, key_column, column] {
            ensure_identifier(ident)?;
        }

        let sql = format!(
            "SELECT CAST({} AS TEXT) FROM {} WHERE {} = ?1",
            column, relation, key_column
        );
        let conn = self.conn();
        let value: Option<Option<String>> = conn
            .query_row(&sql, [key], |row| row.get(0))
            .optional()
            .with_context(|| format!("Failed to read {}.{}", relation, column))?;
        Ok(value.flatten())
    }

    /// Column names of a relation, in schema order
    pub fn table_columns(&self, relation: &str) -> Result<Vec<String>> {
        ensure_identifier(relation)?;
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", relation))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }
}

impl RowSink for SqliteStore {
    fn upsert(&self, row: &Row) -> Result<()> {
        let sql = upsert_sql(row)?;
        let values: Vec<SqlValue> = row.columns.iter().map(|(_, v)| to_sql_value(v)).collect();

        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&sql)?;
        stmt.execute(params_from_iter(values.iter()))
            .with_context(|| format!("Failed to upsert {} {}", row.relation, row.key_text()))?;
        Ok(())
    }

    fn count(&self, relation: &str) -> Result<usize> {
        ensure_identifier(relation)?;
        let conn = self.conn();
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", relation), [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }

    fn recent_keys(&self, scope: &ParentScope, since: NaiveDate) -> Result<Vec<String>> {
        for ident in [scope.relation, scope.key_column, scope.date_column] {
            ensure_identifier(ident)?;
        }

        let sql = format!(
            "SELECT CAST({key} AS TEXT) FROM {relation} \
             WHERE {date} >= ?1 ORDER BY {date} DESC LIMIT ?2",
            key = scope.key_column,
            relation = scope.relation,
            date = scope.date_column,
        );
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&sql)?;
        let keys = stmt
            .query_map(params![since.to_string(), scope.limit as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("Failed to read recent {} keys", scope.relation))?;
        Ok(keys)
    }
}

/// Build `INSERT ... ON CONFLICT(key) DO UPDATE SET` for a row's columns
fn upsert_sql(row: &Row) -> Result<String> {
    ensure_identifier(row.relation)?;
    for (name, _) in &row.columns {
        ensure_identifier(name)?;
    }

    let names: Vec<&str> = row.columns.iter().map(|(name, _)| *name).collect();
    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
    let updates: Vec<String> = names
        .iter()
        .filter(|name| **name != row.key_column)
        .map(|name| format!("{name} = excluded.{name}"))
        .chain(std::iter::once("synced_at = excluded.synced_at".to_string()))
        .collect();

    Ok(format!(
        "INSERT INTO {relation} ({columns}, synced_at) VALUES ({values}, datetime('now')) \
         ON CONFLICT({key}) DO UPDATE SET {updates}",
        relation = row.relation,
        columns = names.join(", "),
        values = placeholders.join(", "),
        key = row.key_column,
        updates = updates.join(", "),
    ))
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        // Nested structures are kept as JSON text
        other => SqlValue::Text(other.to_string()),
    }
}

/// Relation and column names are interpolated into SQL; only allow
/// plain snake_case identifiers.
fn ensure_identifier(ident: &str) -> Result<()> {
    let valid = !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !ident.starts_with(|c: char| c.is_ascii_digit());
    if !valid {
        bail!("Invalid SQL identifier: {:?}", ident);
    }
    Ok(())
}
