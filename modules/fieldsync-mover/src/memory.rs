//! In-memory reader and sinks for tests. No database or broker required.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldsync_common::Position;
use serde_json::{Map, Value};

use crate::descriptor::{Destination, SourceDescriptor};
use crate::error::{MoverError, Result};
use crate::reader::{cutoff, BatchReader};
use crate::row::SourceRow;
use crate::sink::{project, BusMessage, Publisher, SinkWriter};

// ---------------------------------------------------------------------------
// MemoryBatchReader
// ---------------------------------------------------------------------------

/// Rows held per table name, read with the same ordering, horizon and tenant
/// rules as the Postgres reader.
#[derive(Default)]
pub struct MemoryBatchReader {
    tables: Mutex<HashMap<String, Vec<Map<String, Value>>>>,
    fail: AtomicBool,
    reads: AtomicUsize,
}

impl MemoryBatchReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Panics if `record` is not a JSON object.
    pub fn insert(&self, table: &str, record: Value) {
        let Value::Object(map) = record else {
            panic!("records must be JSON objects");
        };
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(map);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of `next_batch` calls so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchReader for MemoryBatchReader {
    async fn next_batch(
        &self,
        source: &SourceDescriptor,
        after: &Position,
        now: DateTime<Utc>,
    ) -> Result<Vec<SourceRow>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(MoverError::SourceUnavailable(format!(
                "{} refused the read",
                source.table
            )));
        }

        let records = self
            .tables
            .lock()
            .unwrap()
            .get(&source.table)
            .cloned()
            .unwrap_or_default();

        let cutoff = cutoff(source, now);
        let tenants = source.tenant_filter();
        let mut rows = Vec::new();
        for record in records {
            if let Some((column, allowed)) = tenants {
                let tenant = record.get(column).and_then(Value::as_str);
                if !tenant.is_some_and(|t| allowed.iter().any(|a| a == t)) {
                    continue;
                }
            }
            let row = SourceRow::from_record(source, record)?;
            if row.time <= cutoff && row.position() > *after {
                rows.push(row);
            }
        }

        rows.sort_by_key(|r| r.position());
        rows.truncate(source.batch_size);
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// MemoryTableSink
// ---------------------------------------------------------------------------

/// Replica tables keyed by natural key; a key already present is ignored,
/// like `ON CONFLICT DO NOTHING`.
#[derive(Default)]
pub struct MemoryTableSink {
    tables: Mutex<HashMap<String, BTreeMap<Position, Map<String, Value>>>>,
    fail: AtomicBool,
    deliveries: AtomicUsize,
}

impl MemoryTableSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_deliveries(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Successful `deliver` calls so far.
    pub fn deliveries(&self) -> usize {
        self.deliveries.load(Ordering::SeqCst)
    }

    /// Rows of a destination table in key order.
    pub fn rows(&self, table: &str) -> Vec<Map<String, Value>> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SinkWriter for MemoryTableSink {
    async fn deliver(&self, source: &SourceDescriptor, rows: &[SourceRow]) -> Result<()> {
        let Destination::Replicate { table, columns } = &source.destination else {
            return Err(MoverError::DestinationMismatch {
                name: source.name.clone(),
                sink: "replica",
            });
        };
        if self.fail.load(Ordering::SeqCst) {
            return Err(MoverError::SinkUnavailable(format!("{table} refused the batch")));
        }

        let mut tables = self.tables.lock().unwrap();
        let dest = tables.entry(table.clone()).or_default();
        for row in rows {
            dest.entry(row.position())
                .or_insert_with(|| project(row, columns));
        }
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryPublisher
// ---------------------------------------------------------------------------

/// Records published messages per topic in publish order.
#[derive(Default)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<(String, BusMessage)>>,
    fail: AtomicBool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Every message published so far, with its topic.
    pub fn messages(&self) -> Vec<(String, BusMessage)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn on_topic(&self, topic: &str) -> Vec<BusMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, messages: Vec<BusMessage>) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MoverError::Publish {
                topic: topic.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }
        let mut all = self.messages.lock().unwrap();
        all.extend(messages.into_iter().map(|m| (topic.to_string(), m)));
        Ok(())
    }
}
