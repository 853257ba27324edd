use chrono::{DateTime, Utc};
use fieldsync_common::{KeyValue, Position};
use serde_json::{Map, Value};

use crate::descriptor::SourceDescriptor;
use crate::error::{MoverError, Result};

/// One source row: its position in the source's total order plus the full
/// record as read from the table.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub time: DateTime<Utc>,
    pub keys: Vec<KeyValue>,
    pub record: Map<String, Value>,
}

impl SourceRow {
    /// Decode a JSON record. A missing or mistyped key column is a
    /// [`MoverError::MalformedRow`].
    pub fn from_record(source: &SourceDescriptor, record: Map<String, Value>) -> Result<Self> {
        let time = match record.get(&source.time_column) {
            Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    MoverError::malformed(
                        &source.name,
                        format!("{} {raw:?} is not a timestamp: {e}", source.time_column),
                    )
                })?,
            other => {
                return Err(MoverError::malformed(
                    &source.name,
                    format!("{} is {}", source.time_column, describe(other)),
                ))
            }
        };

        let mut keys = Vec::with_capacity(source.key_columns.len());
        for column in &source.key_columns {
            let raw = record.get(&column.name);
            let key = raw
                .and_then(|v| KeyValue::from_json(column.kind, v))
                .ok_or_else(|| {
                    MoverError::malformed(
                        &source.name,
                        format!("key column {} is {}", column.name, describe(raw)),
                    )
                })?;
            keys.push(key);
        }

        Ok(Self { time, keys, record })
    }

    pub fn position(&self) -> Position {
        Position::new(self.time, self.keys.clone())
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.record.get(column)
    }

    /// The column as a string, or empty when absent or not textual.
    pub fn text(&self, column: &str) -> String {
        match self.record.get(column) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    }

    /// The column's value, or JSON null.
    pub fn value_or_null(&self, column: &str) -> Value {
        self.record.get(column).cloned().unwrap_or(Value::Null)
    }

    /// The column's value, or an empty object when absent or null.
    pub fn object_or_empty(&self, column: &str) -> Value {
        match self.record.get(column) {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(v) => v.clone(),
        }
    }
}

fn describe(value: Option<&Value>) -> &'static str {
    match value {
        None => "missing",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "a boolean",
        Some(Value::Number(_)) => "a number",
        Some(Value::String(_)) => "a string of the wrong kind",
        Some(Value::Array(_)) => "an array",
        Some(Value::Object(_)) => "an object",
    }
}
