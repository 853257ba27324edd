//! Embedded SQL migrations for the `sensors` schema.

use sqlx::migrate::Migrator;
use sqlx::PgPool;

use crate::error::Result;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Apply every pending migration to the given database.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}
