//! Replicates the edge sensor tables into the cloud store.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use fieldsync_common::Config;
use fieldsync_cursor::PgCursorStore;
use fieldsync_mover::{catalog::replication_sources, PgBatchReader, PgReplicaSink};
use fieldsync_server::{build_scheduler, database, serve, shutdown, telemetry, MoverArgs};

const LOCK_SCOPE: &str = "fieldsync.sync-service";

#[derive(Parser)]
#[command(name = "sync-service", about = "Edge to cloud sensor table replication")]
struct Cli {
    #[command(flatten)]
    mover: MoverArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    info!("Starting sync-service");

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let replica_url = config
        .store
        .replica_database_url
        .as_deref()
        .context("REPLICA_DATABASE_URL (or CLOUD_DB_HOST and friends) must be set")?;

    let edge_pool = database::connect(&config.store.database_url, config.store.max_connections).await?;
    let replica_pool = database::connect(replica_url, config.store.max_connections).await?;
    info!("Connected to edge and replica stores");

    let scheduler = build_scheduler(
        replication_sources(&config.mover)?,
        Arc::new(PgBatchReader::new(edge_pool.clone())),
        Arc::new(PgReplicaSink::new(replica_pool.clone())),
        Arc::new(PgCursorStore::new(edge_pool.clone())),
        &config.mover,
    )?;

    let token = CancellationToken::new();
    shutdown::cancel_on_signal(token.clone());

    let result = serve(&scheduler, &edge_pool, LOCK_SCOPE, &cli.mover, token).await;

    edge_pool.close().await;
    replica_pool.close().await;
    info!("sync-service stopped");
    result
}
