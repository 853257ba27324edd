//! Batch Reader: the next ordered slice of a source strictly after a cursor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldsync_common::{KeyKind, KeyValue, Position};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::sync::Arc;

use crate::descriptor::SourceDescriptor;
use crate::error::{MoverError, Result};
use crate::row::SourceRow;

#[async_trait]
pub trait BatchReader: Send + Sync {
    /// Up to `source.batch_size` rows ordered ascending by the source's key
    /// tuple, every one strictly after `after` and no newer than
    /// `now - source.lag_horizon`. An empty result means the source is
    /// drained for now.
    async fn next_batch(
        &self,
        source: &SourceDescriptor,
        after: &Position,
        now: DateTime<Utc>,
    ) -> Result<Vec<SourceRow>>;
}

/// Newest timestamp a read at `now` may return.
pub fn cutoff(source: &SourceDescriptor, now: DateTime<Utc>) -> DateTime<Utc> {
    match chrono::Duration::from_std(source.lag_horizon) {
        Ok(horizon) => now - horizon,
        Err(_) => DateTime::<Utc>::MIN_UTC,
    }
}

// ---------------------------------------------------------------------------
// PgBatchReader (production, postgres)
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgBatchReader {
    pool: PgPool,
}

impl PgBatchReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Text keys are compared byte-wise (`COLLATE "C"`) so the database order
/// agrees with [`Position`] ordering whatever the column collation is.
fn order_expr(column: &str, kind: KeyKind) -> String {
    match kind {
        KeyKind::Text => format!("t.{column} COLLATE \"C\""),
        KeyKind::BigInt => format!("t.{column}"),
    }
}

/// Build the batch query. Identifiers come from a validated descriptor; every
/// value is a bind parameter.
pub(crate) fn batch_query<'a>(
    source: &'a SourceDescriptor,
    after: &'a Position,
    cutoff: DateTime<Utc>,
) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new("SELECT to_jsonb(t) AS record FROM ");
    qb.push(&source.table);
    qb.push(" t WHERE t.");
    qb.push(&source.time_column);
    qb.push(" <= ");
    qb.push_bind(cutoff);

    if let Some((column, tenants)) = source.tenant_filter() {
        qb.push(" AND t.");
        qb.push(column);
        qb.push(" = ANY(");
        qb.push_bind(tenants.to_vec());
        qb.push(")");
    }

    let exprs: Vec<String> = std::iter::once(format!("t.{}", source.time_column))
        .chain(source.key_layout().map(|(c, k)| order_expr(c, k)))
        .collect();

    qb.push(" AND (");
    qb.push(exprs.join(", "));
    qb.push(") > (");
    {
        let mut values = qb.separated(", ");
        values.push_bind(after.time);
        for key in &after.keys {
            match key {
                KeyValue::Text(s) => values.push_bind(s.clone()),
                KeyValue::BigInt(n) => values.push_bind(*n),
            };
        }
    }
    qb.push(") ORDER BY ");
    qb.push(
        exprs
            .iter()
            .map(|e| format!("{e} ASC"))
            .collect::<Vec<_>>()
            .join(", "),
    );
    qb.push(" LIMIT ");
    qb.push_bind(source.batch_size as i64);
    qb
}

#[async_trait]
impl BatchReader for PgBatchReader {
    async fn next_batch(
        &self,
        source: &SourceDescriptor,
        after: &Position,
        now: DateTime<Utc>,
    ) -> Result<Vec<SourceRow>> {
        if after.keys.len() != source.key_columns.len() {
            return Err(MoverError::invalid(
                &source.name,
                "cursor position does not match the key layout",
            ));
        }

        let mut qb = batch_query(source, after, cutoff(source, now));
        let rows = qb.build().fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| match row.try_get::<Value, _>("record")? {
                Value::Object(record) => SourceRow::from_record(source, record),
                _ => Err(MoverError::malformed(&source.name, "row is not an object")),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Arc<R> blanket
// ---------------------------------------------------------------------------

#[async_trait]
impl<R: BatchReader + ?Sized> BatchReader for Arc<R> {
    async fn next_batch(
        &self,
        source: &SourceDescriptor,
        after: &Position,
        now: DateTime<Utc>,
    ) -> Result<Vec<SourceRow>> {
        (**self).next_batch(source, after, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Destination, KeyColumn};
    use chrono::TimeZone;
    use std::time::Duration;

    fn sweep(tenants: Vec<String>) -> SourceDescriptor {
        SourceDescriptor::builder()
            .name("sweep_readings")
            .table("sensors.sweep_readings")
            .key_columns(vec![
                KeyColumn::text("tenant_id"),
                KeyColumn::text("robot_id"),
                KeyColumn::bigint("run_id"),
            ])
            .tenant_column("tenant_id")
            .tenant_allow_list(tenants)
            .batch_size(100)
            .lag_horizon(Duration::from_secs(30))
            .destination(Destination::Replicate {
                table: "sensors.sweep_readings".into(),
                columns: vec!["time".into(), "tenant_id".into(), "robot_id".into(), "run_id".into()],
            })
            .build()
    }

    #[test]
    fn query_uses_tuple_comparison_and_matching_order() {
        let source = sweep(vec![]);
        let after = Position::epoch(&source.key_kinds());
        let qb = batch_query(&source, &after, Utc::now());
        assert_eq!(
            qb.sql(),
            "SELECT to_jsonb(t) AS record FROM sensors.sweep_readings t \
             WHERE t.time <= $1 \
             AND (t.time, t.tenant_id COLLATE \"C\", t.robot_id COLLATE \"C\", t.run_id) > ($2, $3, $4, $5) \
             ORDER BY t.time ASC, t.tenant_id COLLATE \"C\" ASC, t.robot_id COLLATE \"C\" ASC, t.run_id ASC \
             LIMIT $6"
        );
    }

    #[test]
    fn tenant_allow_list_adds_any_predicate() {
        let source = sweep(vec!["t1".into()]);
        let after = Position::epoch(&source.key_kinds());
        let qb = batch_query(&source, &after, Utc::now());
        assert!(qb.sql().contains("AND t.tenant_id = ANY($2) AND (t.time"));
        assert!(qb.sql().ends_with("LIMIT $7"));
    }

    #[test]
    fn cutoff_subtracts_lag_horizon() {
        let source = sweep(vec![]);
        let now = Utc.timestamp_opt(1_000, 0).unwrap();
        assert_eq!(cutoff(&source, now), Utc.timestamp_opt(970, 0).unwrap());
    }
}
