//! Streams the sensor tables onto Kafka topics.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fieldsync_common::Config;
use fieldsync_cursor::PgCursorStore;
use fieldsync_mover::{catalog::streaming_sources, BusSink, KafkaPublisher, PgBatchReader};
use fieldsync_server::{build_scheduler, database, serve, shutdown, telemetry, MoverArgs};

const LOCK_SCOPE: &str = "fieldsync.sensor-streamer";
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "sensor-streamer", about = "Ordered sensor table streaming to Kafka")]
struct Cli {
    #[command(flatten)]
    mover: MoverArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    info!("Starting sensor-streamer");

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = database::connect(&config.store.database_url, config.store.max_connections).await?;
    let publisher = Arc::new(KafkaPublisher::from_config(&config.bus)?);
    info!(brokers = ?config.bus.brokers, "Kafka producer created");

    let scheduler = build_scheduler(
        streaming_sources(&config.mover, &config.bus.topics)?,
        Arc::new(PgBatchReader::new(pool.clone())),
        Arc::new(BusSink::new(publisher.clone())),
        Arc::new(PgCursorStore::new(pool.clone())),
        &config.mover,
    )?;

    let token = CancellationToken::new();
    shutdown::cancel_on_signal(token.clone());

    let result = serve(&scheduler, &pool, LOCK_SCOPE, &cli.mover, token).await;

    if let Err(e) = publisher.flush(FLUSH_TIMEOUT) {
        warn!(error = %e, "Producer flush incomplete");
    }
    pool.close().await;
    info!("sensor-streamer stopped");
    result
}
