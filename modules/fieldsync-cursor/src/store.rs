//! CursorStore: durable per-mover progress markers in Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::types::Cursor;

/// Durable store of one cursor per mover name.
///
/// Implemented by [`PgCursorStore`] (postgres) and
/// [`MemoryCursorStore`](crate::MemoryCursorStore) (tests). Also implemented
/// for `Arc<S>` so a store can be shared for assertions.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Return the cursor for `name`, creating it at the epoch if absent.
    async fn get(&self, name: &str) -> Result<Cursor>;

    /// Overwrite the cursor for `name`. Durable once this returns `Ok`.
    async fn set(&self, name: &str, timestamp: DateTime<Utc>, last_key: Map<String, Value>)
        -> Result<()>;

    /// Every stored cursor, ordered by name.
    async fn list(&self) -> Result<Vec<Cursor>>;
}

// ---------------------------------------------------------------------------
// PgCursorStore (production, postgres)
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgCursorStore {
    pool: PgPool,
}

impl PgCursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn cursor_from_row(row: &PgRow) -> Result<Cursor> {
    let last_key = match row.try_get::<Option<Value>, _>("last_key")? {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    Ok(Cursor {
        name: row.try_get("name")?,
        last_timestamp: row.try_get("last_time")?,
        last_key,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl CursorStore for PgCursorStore {
    async fn get(&self, name: &str) -> Result<Cursor> {
        // Two statements: the SELECT must see a row a concurrent caller
        // committed while our INSERT waited on the conflict.
        let created = sqlx::query(
            r#"
            INSERT INTO sensors.stream_state (name, last_time, last_key)
            VALUES ($1, 'epoch'::timestamptz, '{}'::jsonb)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(name)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if created > 0 {
            debug!(cursor = name, "Created cursor at epoch");
        }

        let row = sqlx::query(
            r#"
            SELECT name,
                   COALESCE(last_time, 'epoch'::timestamptz) AS last_time,
                   last_key,
                   updated_at
            FROM sensors.stream_state
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        cursor_from_row(&row)
    }

    async fn set(
        &self,
        name: &str,
        timestamp: DateTime<Utc>,
        last_key: Map<String, Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensors.stream_state (name, last_time, last_key, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (name) DO UPDATE
            SET last_time = EXCLUDED.last_time,
                last_key = EXCLUDED.last_key,
                updated_at = now()
            "#,
        )
        .bind(name)
        .bind(timestamp)
        .bind(Value::Object(last_key))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Cursor>> {
        let rows = sqlx::query(
            r#"
            SELECT name,
                   COALESCE(last_time, 'epoch'::timestamptz) AS last_time,
                   last_key,
                   updated_at
            FROM sensors.stream_state
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(cursor_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Arc<S> blanket
// ---------------------------------------------------------------------------

#[async_trait]
impl<S: CursorStore + ?Sized> CursorStore for Arc<S> {
    async fn get(&self, name: &str) -> Result<Cursor> {
        (**self).get(name).await
    }

    async fn set(
        &self,
        name: &str,
        timestamp: DateTime<Utc>,
        last_key: Map<String, Value>,
    ) -> Result<()> {
        (**self).set(name, timestamp, last_key).await
    }

    async fn list(&self) -> Result<Vec<Cursor>> {
        (**self).list().await
    }
}
