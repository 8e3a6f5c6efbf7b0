//! Remote record -> storage row mapping

use serde_json::Value;

use super::catalog::{Column, EntitySpec, Source};
use crate::error::RecordError;
use crate::models::Row;

/// Map one remote record onto the entity's row shape
pub fn map_record(spec: &EntitySpec, record: &Value) -> Result<Row, RecordError> {
    map_with_parent(spec, record, &Value::Null)
}

/// Map a record fetched under `parent` (the parent row's key)
pub fn map_child_record(
    spec: &EntitySpec,
    record: &Value,
    parent: &Value,
) -> Result<Row, RecordError> {
    map_with_parent(spec, record, parent)
}

fn map_with_parent(spec: &EntitySpec, record: &Value, parent: &Value) -> Result<Row, RecordError> {
    let key = resolve(&spec.key, record, parent);
    if key.is_null() {
        return Err(RecordError::MissingField {
            field: spec.key.name,
        });
    }

    let mut row = Row::new(spec.relation, spec.key.name, key);
    for column in spec.columns {
        let value = resolve(column, record, parent);
        if column.required && value.is_null() {
            return Err(RecordError::MissingField { field: column.name });
        }
        row.push(column.name, value);
    }
    Ok(row)
}

fn resolve(column: &Column, record: &Value, parent: &Value) -> Value {
    match column.source {
        Source::Parent => parent.clone(),
        Source::Field(pointer) => record.pointer(pointer).cloned().unwrap_or(Value::Null),
        Source::Count(pointer) => {
            let len = record
                .pointer(pointer)
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            Value::from(len as u64)
        }
        Source::FlagOr(pointer, default) => Value::Bool(
            record
                .pointer(pointer)
                .and_then(Value::as_bool)
                .unwrap_or(default),
        ),
    }
}
