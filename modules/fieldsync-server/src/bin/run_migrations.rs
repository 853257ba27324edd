//! Applies pending SQLx migrations.
//!
//! Migrations are embedded at compile time, so this runs as a deploy step
//! before any of the services start.

use anyhow::Result;
use tracing::info;

use fieldsync_common::Config;
use fieldsync_server::{database, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();

    let config = Config::from_env()?;
    let pool = database::connect(&config.store.database_url, 2).await?;

    info!("Running database migrations");
    fieldsync_cursor::schema::migrate(&pool).await?;
    info!("Migrations complete");

    pool.close().await;
    Ok(())
}
