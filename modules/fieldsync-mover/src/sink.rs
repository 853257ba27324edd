//! Sink Writers: idempotent delivery of a batch to a table or a bus topic.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::debug;

use crate::descriptor::{Destination, SourceDescriptor};
use crate::error::{MoverError, Result};
use crate::row::SourceRow;

/// Delivers a batch to its destination. Redelivering the same rows must not
/// create duplicates.
#[async_trait]
pub trait SinkWriter: Send + Sync {
    /// All-or-nothing: `Ok` means every row is durably delivered.
    async fn deliver(&self, source: &SourceDescriptor, rows: &[SourceRow]) -> Result<()>;
}

#[async_trait]
impl<S: SinkWriter + ?Sized> SinkWriter for Arc<S> {
    async fn deliver(&self, source: &SourceDescriptor, rows: &[SourceRow]) -> Result<()> {
        (**self).deliver(source, rows).await
    }
}

// ---------------------------------------------------------------------------
// PgReplicaSink: store to store
// ---------------------------------------------------------------------------

const DEFAULT_CHUNK: usize = 500;

/// Inserts rows into a replica database, skipping natural keys already
/// present. Chunks share one transaction.
#[derive(Clone)]
pub struct PgReplicaSink {
    pool: PgPool,
    chunk_size: usize,
}

impl PgReplicaSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            chunk_size: DEFAULT_CHUNK,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

/// `INSERT … SELECT … FROM jsonb_populate_recordset(NULL::dest, $1) ON
/// CONFLICT (key) DO NOTHING` for a validated descriptor.
pub(crate) fn replica_insert_sql(
    source: &SourceDescriptor,
    table: &str,
    columns: &[String],
) -> String {
    let cols = columns.join(", ");
    format!(
        "INSERT INTO {table} ({cols}) SELECT {cols} FROM jsonb_populate_recordset(NULL::{table}, $1) \
         ON CONFLICT ({keys}) DO NOTHING",
        keys = source.order_columns().join(", ")
    )
}

/// Keep only the replicated columns of a record.
pub(crate) fn project(row: &SourceRow, columns: &[String]) -> Map<String, Value> {
    columns
        .iter()
        .filter_map(|c| row.record.get(c).map(|v| (c.clone(), v.clone())))
        .collect()
}

#[async_trait]
impl SinkWriter for PgReplicaSink {
    async fn deliver(&self, source: &SourceDescriptor, rows: &[SourceRow]) -> Result<()> {
        let Destination::Replicate { table, columns } = &source.destination else {
            return Err(MoverError::DestinationMismatch {
                name: source.name.clone(),
                sink: "replica",
            });
        };
        if rows.is_empty() {
            return Ok(());
        }

        let sql = replica_insert_sql(source, table, columns);
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in rows.chunks(self.chunk_size) {
            let payload = Value::Array(
                chunk
                    .iter()
                    .map(|r| Value::Object(project(r, columns)))
                    .collect(),
            );
            let result = sqlx::query(&sql).bind(payload).execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;

        debug!(
            source = %source.name,
            rows = rows.len(),
            inserted,
            "Replicated batch"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BusSink: store to bus
// ---------------------------------------------------------------------------

/// One message for the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub key: String,
    pub value: String,
    pub headers: Vec<(String, String)>,
}

impl BusMessage {
    pub fn json(key: impl Into<String>, value: &Value) -> Result<Self> {
        let value = serde_json::to_string(value).map_err(anyhow::Error::from)?;
        Ok(Self {
            key: key.into(),
            value,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
        })
    }
}

/// Publishes an ordered batch to a topic.
///
/// Implemented by [`KafkaPublisher`](crate::KafkaPublisher) and
/// [`MemoryPublisher`](crate::MemoryPublisher).
#[async_trait]
pub trait Publisher: Send + Sync {
    /// All-or-nothing: `Ok` once every message is acknowledged, in order.
    async fn publish(&self, topic: &str, messages: Vec<BusMessage>) -> Result<()>;
}

#[async_trait]
impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    async fn publish(&self, topic: &str, messages: Vec<BusMessage>) -> Result<()> {
        (**self).publish(topic, messages).await
    }
}

/// Turns rows into envelopes and hands the whole batch to a [`Publisher`].
pub struct BusSink<P> {
    publisher: P,
}

impl<P: Publisher> BusSink<P> {
    pub fn new(publisher: P) -> Self {
        Self { publisher }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }
}

/// Build the message for one row of a publishing source.
pub fn envelope_message(source: &SourceDescriptor, row: &SourceRow) -> Result<BusMessage> {
    let Destination::Publish {
        schema,
        partition_key,
        envelope,
        ..
    } = &source.destination
    else {
        return Err(MoverError::DestinationMismatch {
            name: source.name.clone(),
            sink: "bus",
        });
    };

    let mut body = Map::new();
    body.insert("schema".into(), Value::String(schema.clone()));
    body.insert(
        "ts".into(),
        Value::String(
            row.time
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        ),
    );
    for (k, v) in envelope(row) {
        body.entry(k).or_insert(v);
    }
    BusMessage::json(partition_key(row), &Value::Object(body))
}

#[async_trait]
impl<P: Publisher> SinkWriter for BusSink<P> {
    async fn deliver(&self, source: &SourceDescriptor, rows: &[SourceRow]) -> Result<()> {
        let Destination::Publish { topic, .. } = &source.destination else {
            return Err(MoverError::DestinationMismatch {
                name: source.name.clone(),
                sink: "bus",
            });
        };
        if rows.is_empty() {
            return Ok(());
        }

        let messages = rows
            .iter()
            .map(|row| envelope_message(source, row))
            .collect::<Result<Vec<_>>>()?;
        self.publisher.publish(topic, messages).await
    }
}
