//! The platform's movable sources: device readings, device health, lab
//! readings and robot sweep readings.

use fieldsync_common::{MoverConfig, Topics};
use serde_json::{json, Map, Value};

use crate::descriptor::{Destination, EnvelopeFn, KeyColumn, PartitionKeyFn, SourceDescriptor};
use crate::error::Result;
use crate::row::SourceRow;

struct Entry {
    name: &'static str,
    table: &'static str,
    keys: fn() -> Vec<KeyColumn>,
    columns: &'static [&'static str],
    schema: &'static str,
    topic: fn(&Topics) -> &str,
    partition_key: PartitionKeyFn,
    envelope: EnvelopeFn,
}

const ENTRIES: [Entry; 4] = [
    Entry {
        name: "device_readings",
        table: "sensors.device_readings",
        keys: || {
            vec![
                KeyColumn::text("tenant_id"),
                KeyColumn::text("device_id"),
                KeyColumn::text("metric"),
            ]
        },
        columns: &[
            "time", "tenant_id", "device_id", "metric", "sensor_id", "value", "quality", "payload",
        ],
        schema: "sensor.device.v1",
        topic: |t| t.device_readings.as_str(),
        partition_key: |r| format!("{}:{}", r.text("tenant_id"), r.text("device_id")),
        envelope: device_reading_envelope,
    },
    Entry {
        name: "device_health",
        table: "sensors.device_health",
        keys: || vec![KeyColumn::text("tenant_id"), KeyColumn::text("device_id")],
        columns: &[
            "time", "tenant_id", "device_id", "online", "rssi", "uptime_s", "source", "meta",
        ],
        schema: "sensor.health.v1",
        topic: |t| t.device_health.as_str(),
        partition_key: |r| format!("{}:{}", r.text("tenant_id"), r.text("device_id")),
        envelope: device_health_envelope,
    },
    Entry {
        name: "lab_readings",
        table: "sensors.lab_readings",
        keys: || {
            vec![
                KeyColumn::text("tenant_id"),
                KeyColumn::text("station_id"),
                KeyColumn::text("sensor_id"),
                KeyColumn::text("metric"),
            ]
        },
        columns: &[
            "time", "tenant_id", "station_id", "sensor_id", "metric", "value", "quality", "payload",
        ],
        schema: "sensor.lab.v1",
        topic: |t| t.lab_readings.as_str(),
        partition_key: |r| format!("{}:{}", r.text("tenant_id"), r.text("station_id")),
        envelope: lab_reading_envelope,
    },
    Entry {
        name: "sweep_readings",
        table: "sensors.sweep_readings",
        keys: || {
            vec![
                KeyColumn::text("tenant_id"),
                KeyColumn::text("robot_id"),
                KeyColumn::bigint("run_id"),
                KeyColumn::text("sensor_id"),
                KeyColumn::text("metric"),
            ]
        },
        columns: &[
            "time", "tenant_id", "robot_id", "run_id", "sensor_id", "metric", "zone_id", "x", "y",
            "value", "quality", "payload",
        ],
        schema: "sensor.sweep.v1",
        topic: |t| t.sweep_readings.as_str(),
        partition_key: |r| {
            format!(
                "{}:{}:{}",
                r.text("tenant_id"),
                r.text("robot_id"),
                r.text("run_id")
            )
        },
        envelope: sweep_reading_envelope,
    },
];

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn device_reading_envelope(r: &SourceRow) -> Map<String, Value> {
    object(json!({
        "tenant_id": r.value_or_null("tenant_id"),
        "device_id": r.value_or_null("device_id"),
        "metric": r.value_or_null("metric"),
        "value": r.value_or_null("value"),
        "quality": r.value_or_null("quality"),
        "sensor_id": r.value_or_null("sensor_id"),
        "payload": r.object_or_empty("payload"),
    }))
}

fn device_health_envelope(r: &SourceRow) -> Map<String, Value> {
    object(json!({
        "tenant_id": r.value_or_null("tenant_id"),
        "device_id": r.value_or_null("device_id"),
        "online": r.value_or_null("online"),
        "rssi": r.value_or_null("rssi"),
        "uptime_s": r.value_or_null("uptime_s"),
        "source": r.value_or_null("source"),
        "meta": r.object_or_empty("meta"),
    }))
}

fn lab_reading_envelope(r: &SourceRow) -> Map<String, Value> {
    object(json!({
        "tenant_id": r.value_or_null("tenant_id"),
        "station_id": r.value_or_null("station_id"),
        "sensor_id": r.value_or_null("sensor_id"),
        "metric": r.value_or_null("metric"),
        "value": r.value_or_null("value"),
        "quality": r.value_or_null("quality"),
        "payload": r.object_or_empty("payload"),
    }))
}

fn sweep_reading_envelope(r: &SourceRow) -> Map<String, Value> {
    object(json!({
        "tenant_id": r.value_or_null("tenant_id"),
        "robot_id": r.value_or_null("robot_id"),
        "run_id": r.value_or_null("run_id"),
        "sensor_id": r.value_or_null("sensor_id"),
        "metric": r.value_or_null("metric"),
        "zone_id": r.value_or_null("zone_id"),
        "x": r.value_or_null("x"),
        "y": r.value_or_null("y"),
        "value": r.value_or_null("value"),
        "quality": r.value_or_null("quality"),
        "payload": r.object_or_empty("payload"),
    }))
}

fn descriptor(
    entry: &Entry,
    cursor_prefix: &str,
    mover: &MoverConfig,
    destination: Destination,
) -> Result<SourceDescriptor> {
    let source = SourceDescriptor::builder()
        .name(entry.name)
        .cursor_name(format!("{cursor_prefix}.{}", entry.name))
        .table(entry.table)
        .key_columns((entry.keys)())
        .tenant_column("tenant_id")
        .tenant_allow_list(mover.tenant_filter.clone())
        .batch_size(mover.batch_size_for(entry.name))
        .lag_horizon(mover.max_lag)
        .destination(destination)
        .build();
    source.validate()?;
    Ok(source)
}

/// Sources copied row-for-row into the same tables of a replica database.
pub fn replication_sources(mover: &MoverConfig) -> Result<Vec<SourceDescriptor>> {
    ENTRIES
        .iter()
        .map(|entry| {
            let destination = Destination::Replicate {
                table: entry.table.to_string(),
                columns: entry.columns.iter().map(|c| c.to_string()).collect(),
            };
            descriptor(entry, "replicate", mover, destination)
        })
        .collect()
}

/// Sources published as JSON envelopes onto their bus topics.
pub fn streaming_sources(mover: &MoverConfig, topics: &Topics) -> Result<Vec<SourceDescriptor>> {
    ENTRIES
        .iter()
        .map(|entry| {
            let destination = Destination::Publish {
                topic: (entry.topic)(topics).to_string(),
                schema: entry.schema.to_string(),
                partition_key: entry.partition_key,
                envelope: entry.envelope,
            };
            descriptor(entry, "stream", mover, destination)
        })
        .collect()
}
