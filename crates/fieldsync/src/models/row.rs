//! Storage row produced by entity mapping

use serde_json::Value;

/// One row bound for a relation, keyed by the entity's natural identifier
///
/// The key column is always the first entry in `columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub relation: &'static str,
    pub key_column: &'static str,
    pub columns: Vec<(&'static str, Value)>,
}

impl Row {
    /// Start a row with its natural key
    pub fn new(relation: &'static str, key_column: &'static str, key: Value) -> Self {
        Self {
            relation,
            key_column,
            columns: vec![(key_column, key)],
        }
    }

    /// Append a non-key column
    pub fn push(&mut self, column: &'static str, value: Value) {
        self.columns.push((column, value));
    }

    /// The natural key value
    pub fn key(&self) -> &Value {
        &self.columns[0].1
    }

    /// Natural key rendered as text (numbers and strings unquoted)
    pub fn key_text(&self) -> String {
        value_text(self.key())
    }

    /// Look up a column value by name
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, value)| value)
    }
}

/// Render a JSON scalar the way it is stored as a natural key
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
