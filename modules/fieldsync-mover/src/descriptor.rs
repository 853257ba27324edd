//! Static description of one movable data source.

use std::sync::LazyLock;
use std::time::Duration;

use fieldsync_common::KeyKind;
use regex::Regex;
use serde_json::{Map, Value};
use typed_builder::TypedBuilder;

use crate::error::{MoverError, Result};
use crate::row::SourceRow;

static COLUMN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("valid regex"));
static TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z_][a-z0-9_]*(\.[a-z_][a-z0-9_]*)?$").expect("valid regex")
});

pub type PartitionKeyFn = fn(&SourceRow) -> String;
pub type EnvelopeFn = fn(&SourceRow) -> Map<String, Value>;

/// A non-timestamp component of a source's natural key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumn {
    pub name: String,
    pub kind: KeyKind,
}

impl KeyColumn {
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: KeyKind::Text,
        }
    }

    pub fn bigint(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: KeyKind::BigInt,
        }
    }
}

/// Where a source's rows go.
#[derive(Debug, Clone)]
pub enum Destination {
    /// Insert into a table of the same shape, ignoring rows whose natural key
    /// is already present.
    Replicate { table: String, columns: Vec<String> },
    /// Publish one message per row on a bus topic.
    Publish {
        topic: String,
        schema: String,
        partition_key: PartitionKeyFn,
        envelope: EnvelopeFn,
    },
}

/// Everything the mover needs to know about a source.
///
/// The total read order is `(time_column, key_columns...)`, which must also be
/// the table's natural key.
#[derive(Debug, Clone, TypedBuilder)]
pub struct SourceDescriptor {
    #[builder(setter(into))]
    pub name: String,
    /// Cursor row name. Defaults to `name`.
    #[builder(default, setter(strip_option, into))]
    pub cursor_name: Option<String>,
    #[builder(setter(into))]
    pub table: String,
    #[builder(default = "time".to_string(), setter(into))]
    pub time_column: String,
    pub key_columns: Vec<KeyColumn>,
    #[builder(default, setter(strip_option, into))]
    pub tenant_column: Option<String>,
    #[builder(default)]
    pub tenant_allow_list: Vec<String>,
    #[builder(default = 5000)]
    pub batch_size: usize,
    #[builder(default = Duration::from_secs(60))]
    pub lag_horizon: Duration,
    pub destination: Destination,
}

impl SourceDescriptor {
    pub fn cursor_name(&self) -> &str {
        self.cursor_name.as_deref().unwrap_or(&self.name)
    }

    /// `(column, kind)` pairs of the non-timestamp key columns, in order.
    pub fn key_layout(&self) -> impl Iterator<Item = (&str, KeyKind)> + '_ {
        self.key_columns.iter().map(|c| (c.name.as_str(), c.kind))
    }

    pub fn key_kinds(&self) -> Vec<KeyKind> {
        self.key_columns.iter().map(|c| c.kind).collect()
    }

    /// Names of every column in the total order, timestamp first.
    pub fn order_columns(&self) -> Vec<&str> {
        std::iter::once(self.time_column.as_str())
            .chain(self.key_columns.iter().map(|c| c.name.as_str()))
            .collect()
    }

    /// Only tenants in the allow-list are read, when the list is non-empty.
    pub fn tenant_filter(&self) -> Option<(&str, &[String])> {
        match (&self.tenant_column, self.tenant_allow_list.is_empty()) {
            (Some(column), false) => Some((column.as_str(), self.tenant_allow_list.as_slice())),
            _ => None,
        }
    }

    /// Reject identifiers that cannot be safely interpolated into SQL and
    /// settings that would make the mover spin or stall.
    pub fn validate(&self) -> Result<()> {
        let name = self.name.as_str();
        if name.is_empty() {
            return Err(MoverError::invalid(name, "name is empty"));
        }
        check_table(name, &self.table)?;
        check_column(name, &self.time_column)?;
        for column in &self.key_columns {
            check_column(name, &column.name)?;
            if column.name == self.time_column {
                return Err(MoverError::invalid(
                    name,
                    format!("{} appears twice in the key", column.name),
                ));
            }
        }
        if let Some(column) = &self.tenant_column {
            check_column(name, column)?;
        }
        if self.tenant_column.is_none() && !self.tenant_allow_list.is_empty() {
            return Err(MoverError::invalid(
                name,
                "tenant allow-list given without a tenant column",
            ));
        }
        if self.batch_size == 0 {
            return Err(MoverError::invalid(name, "batch size must be positive"));
        }
        if let Destination::Replicate { table, columns } = &self.destination {
            check_table(name, table)?;
            if columns.is_empty() {
                return Err(MoverError::invalid(name, "no columns to replicate"));
            }
            for column in columns {
                check_column(name, column)?;
            }
            for key in self.order_columns() {
                if !columns.iter().any(|c| c == key) {
                    return Err(MoverError::invalid(
                        name,
                        format!("replicated columns must include key column {key}"),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn check_table(source: &str, table: &str) -> Result<()> {
    if TABLE_RE.is_match(table) {
        Ok(())
    } else {
        Err(MoverError::invalid(source, format!("invalid table name {table:?}")))
    }
}

fn check_column(source: &str, column: &str) -> Result<()> {
    if COLUMN_RE.is_match(column) {
        Ok(())
    } else {
        Err(MoverError::invalid(source, format!("invalid column name {column:?}")))
    }
}
