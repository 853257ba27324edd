//! Storage seams of the associator and their Postgres implementation.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;

use crate::error::{AssociatorError, Result};
use crate::types::{Association, Candidate, CandidateQuery, NewAssociation, Probe, ProbeRef, Recorded};

pub const MAX_RECENT: i64 = 200;

/// Clamp a listing limit to `1..=200`.
pub fn clamp_limit(limit: i64) -> i64 {
    limit.clamp(1, MAX_RECENT)
}

#[async_trait]
pub trait ProbeStore: Send + Sync {
    /// Fails with [`AssociatorError::ProbeNotFound`] when nothing matches.
    async fn resolve(&self, probe: &ProbeRef) -> Result<Probe>;
}

#[async_trait]
pub trait CandidateStore: Send + Sync {
    async fn candidates_in_window(&self, query: &CandidateQuery) -> Result<Vec<Candidate>>;

    async fn get(&self, id: i64) -> Result<Option<Candidate>>;
}

#[async_trait]
pub trait AssociationStore: Send + Sync {
    /// Insert unless the probe already has an association; either way return
    /// the one on record.
    async fn insert_if_absent(&self, new: NewAssociation) -> Result<Recorded>;

    async fn get_by_probe(&self, probe_id: i64) -> Result<Option<Association>>;

    /// Newest first; `limit` is clamped to `1..=200`.
    async fn list_recent(&self, limit: i64) -> Result<Vec<Association>>;
}

// ---------------------------------------------------------------------------
// PgSensorStore (production, postgres)
// ---------------------------------------------------------------------------

/// Reads `sensors.media_objects` and `sensors.readings`, writes
/// `sensors.reading_media_map`.
#[derive(Clone)]
pub struct PgSensorStore {
    pool: PgPool,
}

impl PgSensorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const ASSOCIATION_COLUMNS: &str =
    "id, media_id, reading_id, delta_ms, method, confidence, created_at";

fn association_from_row(row: &PgRow) -> Result<Association> {
    let method: String = row.try_get("method")?;
    Ok(Association {
        id: row.try_get("id")?,
        probe_id: row.try_get("media_id")?,
        matched_id: row.try_get("reading_id")?,
        delta_ms: row.try_get("delta_ms")?,
        method: method.parse()?,
        confidence: row.try_get("confidence")?,
        created_at: row.try_get("created_at")?,
    })
}

fn candidate_from_row(row: &PgRow) -> Result<Candidate> {
    Ok(Candidate {
        id: row.try_get("id")?,
        time: row.try_get("time")?,
        tenant_id: row.try_get("tenant_id")?,
        sensor_id: row.try_get("sensor_id")?,
        metric: row.try_get("metric")?,
        value_num: row.try_get("value_num")?,
    })
}

fn probe_from_row(row: &PgRow) -> Result<Probe> {
    Ok(Probe {
        probe_id: row.try_get("media_id")?,
        time: row.try_get("time")?,
        tenant_id: row.try_get("tenant_id")?,
        sensor_id: row.try_get("sensor_id")?,
        station_id: row.try_get("station_id")?,
    })
}

#[async_trait]
impl ProbeStore for PgSensorStore {
    async fn resolve(&self, probe: &ProbeRef) -> Result<Probe> {
        let row = match probe {
            ProbeRef::MediaId(id) => {
                sqlx::query(
                    "SELECT media_id, time, tenant_id, sensor_id, station_id \
                     FROM sensors.media_objects WHERE media_id = $1",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
            ProbeRef::Object { bucket, object_key } => {
                sqlx::query(
                    "SELECT media_id, time, tenant_id, sensor_id, station_id \
                     FROM sensors.media_objects WHERE bucket = $1 AND object_key = $2 \
                     ORDER BY media_id LIMIT 1",
                )
                .bind(bucket)
                .bind(object_key)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        match row {
            Some(row) => probe_from_row(&row),
            None => Err(AssociatorError::ProbeNotFound(probe.to_string())),
        }
    }
}

#[async_trait]
impl CandidateStore for PgSensorStore {
    async fn candidates_in_window(&self, query: &CandidateQuery) -> Result<Vec<Candidate>> {
        let rows = sqlx::query(
            r#"
            SELECT id, time, tenant_id, sensor_id, metric, value_num
            FROM sensors.readings
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR sensor_id = $2)
              AND metric = ANY($3)
              AND time BETWEEN $4 AND $5
            ORDER BY time, id
            "#,
        )
        .bind(&query.tenant_id)
        .bind(&query.sensor_id)
        .bind(&query.metrics)
        .bind(query.start)
        .bind(query.end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(candidate_from_row).collect()
    }

    async fn get(&self, id: i64) -> Result<Option<Candidate>> {
        let row = sqlx::query(
            "SELECT id, time, tenant_id, sensor_id, metric, value_num FROM sensors.readings WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(candidate_from_row).transpose()
    }
}

#[async_trait]
impl AssociationStore for PgSensorStore {
    async fn insert_if_absent(&self, new: NewAssociation) -> Result<Recorded> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO sensors.reading_media_map (media_id, reading_id, delta_ms, method, confidence) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (media_id) DO NOTHING \
             RETURNING {ASSOCIATION_COLUMNS}"
        ))
        .bind(new.probe_id)
        .bind(new.matched_id)
        .bind(new.delta_ms)
        .bind(new.method.as_str())
        .bind(new.confidence)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(Recorded {
                association: association_from_row(&row)?,
                created: true,
            });
        }

        match self.get_by_probe(new.probe_id).await? {
            Some(association) => Ok(Recorded {
                association,
                created: false,
            }),
            None => Err(AssociatorError::Other(anyhow::anyhow!(
                "association for probe {} vanished after conflict",
                new.probe_id
            ))),
        }
    }

    async fn get_by_probe(&self, probe_id: i64) -> Result<Option<Association>> {
        let row = sqlx::query(&format!(
            "SELECT {ASSOCIATION_COLUMNS} FROM sensors.reading_media_map WHERE media_id = $1"
        ))
        .bind(probe_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(association_from_row).transpose()
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Association>> {
        let rows = sqlx::query(&format!(
            "SELECT {ASSOCIATION_COLUMNS} FROM sensors.reading_media_map \
             ORDER BY created_at DESC, id DESC LIMIT $1"
        ))
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(association_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Arc<S> blankets
// ---------------------------------------------------------------------------

#[async_trait]
impl<S: ProbeStore + ?Sized> ProbeStore for Arc<S> {
    async fn resolve(&self, probe: &ProbeRef) -> Result<Probe> {
        (**self).resolve(probe).await
    }
}

#[async_trait]
impl<S: CandidateStore + ?Sized> CandidateStore for Arc<S> {
    async fn candidates_in_window(&self, query: &CandidateQuery) -> Result<Vec<Candidate>> {
        (**self).candidates_in_window(query).await
    }

    async fn get(&self, id: i64) -> Result<Option<Candidate>> {
        (**self).get(id).await
    }
}

#[async_trait]
impl<S: AssociationStore + ?Sized> AssociationStore for Arc<S> {
    async fn insert_if_absent(&self, new: NewAssociation) -> Result<Recorded> {
        (**self).insert_if_absent(new).await
    }

    async fn get_by_probe(&self, probe_id: i64) -> Result<Option<Association>> {
        (**self).get_by_probe(probe_id).await
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Association>> {
        (**self).list_recent(limit).await
    }
}
