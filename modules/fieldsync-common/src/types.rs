//! Value types shared by the cursor store, the movers and the associator.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Domain of a non-timestamp key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    Text,
    BigInt,
}

impl KeyKind {
    /// The smallest value of the column's domain. Used when a cursor has not
    /// yet recorded a value for the column (first run).
    pub fn domain_min(self) -> KeyValue {
        match self {
            KeyKind::Text => KeyValue::Text(String::new()),
            KeyKind::BigInt => KeyValue::BigInt(0),
        }
    }
}

/// One non-timestamp component of a composite natural key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Text(String),
    BigInt(i64),
}

impl KeyValue {
    /// Decode a JSON value as a key of the given kind.
    ///
    /// BIGINT keys are accepted both as JSON numbers and as decimal strings,
    /// since older cursor rows stored them as strings.
    pub fn from_json(kind: KeyKind, value: &Value) -> Option<Self> {
        match (kind, value) {
            (KeyKind::Text, Value::String(s)) => Some(KeyValue::Text(s.clone())),
            (KeyKind::BigInt, Value::Number(n)) => n.as_i64().map(KeyValue::BigInt),
            (KeyKind::BigInt, Value::String(s)) => s.trim().parse().ok().map(KeyValue::BigInt),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            KeyValue::Text(s) => Value::String(s.clone()),
            KeyValue::BigInt(n) => Value::from(*n),
        }
    }

    pub fn kind(&self) -> KeyKind {
        match self {
            KeyValue::Text(_) => KeyKind::Text,
            KeyValue::BigInt(_) => KeyKind::BigInt,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Text(s) => write!(f, "{s}"),
            KeyValue::BigInt(n) => write!(f, "{n}"),
        }
    }
}

/// A point in a source's total order: `(time, key_2, …, key_n)`.
///
/// The derived ordering compares `time` first and then the keys element by
/// element, which is exactly the lexicographic tuple order the sources are
/// read in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub time: DateTime<Utc>,
    pub keys: Vec<KeyValue>,
}

impl Position {
    pub fn new(time: DateTime<Utc>, keys: Vec<KeyValue>) -> Self {
        Self { time, keys }
    }

    /// The minimum position for a key layout: Unix epoch and every key at its
    /// domain minimum.
    pub fn epoch(kinds: &[KeyKind]) -> Self {
        Self {
            time: DateTime::<Utc>::UNIX_EPOCH,
            keys: kinds.iter().map(|k| k.domain_min()).collect(),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", self.time.to_rfc3339())?;
        for key in &self.keys {
            write!(f, ", {key}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn equal_time_orders_by_keys() {
        let a = Position::new(at(100), vec![KeyValue::Text("A".into())]);
        let b = Position::new(at(100), vec![KeyValue::Text("B".into())]);
        assert!(a < b);
    }

    #[test]
    fn time_dominates_keys() {
        let late_small = Position::new(at(101), vec![KeyValue::Text("A".into())]);
        let early_big = Position::new(at(100), vec![KeyValue::Text("Z".into())]);
        assert!(early_big < late_small);
    }

    #[test]
    fn epoch_is_below_any_real_position() {
        let epoch = Position::epoch(&[KeyKind::Text, KeyKind::BigInt]);
        let first = Position::new(
            at(0),
            vec![KeyValue::Text("a".into()), KeyValue::BigInt(1)],
        );
        assert!(epoch < first);
        assert_eq!(epoch.keys, vec![KeyValue::Text(String::new()), KeyValue::BigInt(0)]);
    }

    #[test]
    fn bigint_accepts_string_and_number() {
        assert_eq!(
            KeyValue::from_json(KeyKind::BigInt, &json!("42")),
            Some(KeyValue::BigInt(42))
        );
        assert_eq!(
            KeyValue::from_json(KeyKind::BigInt, &json!(42)),
            Some(KeyValue::BigInt(42))
        );
        assert_eq!(KeyValue::from_json(KeyKind::BigInt, &json!("x")), None);
        assert_eq!(KeyValue::from_json(KeyKind::Text, &json!(7)), None);
    }
}
