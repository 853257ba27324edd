use chrono::{DateTime, Utc};
use fieldsync_common::{KeyKind, KeyValue, Position};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The persisted progress marker of one mover.
///
/// `last_key` holds the non-timestamp key columns of the last delivered row,
/// keyed by column name. A brand-new cursor sits at the Unix epoch with an
/// empty map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub name: String,
    pub last_timestamp: DateTime<Utc>,
    pub last_key: Map<String, Value>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Cursor {
    pub fn at_epoch(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_timestamp: DateTime::<Utc>::UNIX_EPOCH,
            last_key: Map::new(),
            updated_at: None,
        }
    }

    /// Interpret the cursor as a position in a source's key order.
    ///
    /// Columns missing from `last_key`, or stored with a value that does not
    /// decode as the column's kind, fall back to the domain minimum.
    pub fn position<'a, I>(&self, columns: I) -> Position
    where
        I: IntoIterator<Item = (&'a str, KeyKind)>,
    {
        let keys = columns
            .into_iter()
            .map(|(column, kind)| {
                self.last_key
                    .get(column)
                    .and_then(|v| KeyValue::from_json(kind, v))
                    .unwrap_or_else(|| kind.domain_min())
            })
            .collect();
        Position::new(self.last_timestamp, keys)
    }

    /// Whether any column of the layout could not be read from `last_key`.
    pub fn has_unreadable_key<'a, I>(&self, columns: I) -> bool
    where
        I: IntoIterator<Item = (&'a str, KeyKind)>,
    {
        columns.into_iter().any(|(column, kind)| match self.last_key.get(column) {
            None => false,
            Some(v) => KeyValue::from_json(kind, v).is_none(),
        })
    }
}

/// Build the `last_key` map for a position under a column layout.
pub fn key_map<'a, I>(columns: I, position: &Position) -> Map<String, Value>
where
    I: IntoIterator<Item = &'a str>,
{
    columns
        .into_iter()
        .zip(position.keys.iter())
        .map(|(column, key)| (column.to_string(), key.to_json()))
        .collect()
}
