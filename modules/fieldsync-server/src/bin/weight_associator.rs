//! Pairs every `image.created` event with the nearest weight reading.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fieldsync_associator::{
    AssociationStore, Associator, BusNotifier, Outcome, PgSensorStore, ProbeRef,
};
use fieldsync_common::Config;
use fieldsync_mover::kafka::consumer_config;
use fieldsync_mover::KafkaPublisher;
use fieldsync_server::image_events::handle_with_deferral;
use fieldsync_server::{database, shutdown, telemetry};

const ATTEMPTS: u32 = 3;
const BACKOFF: Duration = Duration::from_millis(500);
const SETTLE: Duration = Duration::from_secs(2);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "weight-associator", about = "Pairs images with the nearest weight reading")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Consume image.created events (the default).
    Consume,
    /// Associate one stored image now, e.g. to backfill a missed event.
    Associate {
        #[arg(long)]
        media_id: Option<i64>,
        #[arg(long)]
        bucket: Option<String>,
        #[arg(long)]
        object_key: Option<String>,
        /// Search window either side of the image, 100..=60000 ms.
        #[arg(long)]
        window_ms: Option<i64>,
    },
    /// Print the most recent associations.
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let pool = database::connect(&config.store.database_url, config.store.max_connections).await?;

    let store = Arc::new(PgSensorStore::new(pool.clone()));
    let associator = Associator::new(
        store.clone(),
        store.clone(),
        store.clone(),
        config.associator.metrics.clone(),
        config.associator.window_ms,
    );

    let result = match cli.command.unwrap_or(Command::Consume) {
        Command::Consume => consume(&config, &associator).await,
        Command::Associate {
            media_id,
            bucket,
            object_key,
            window_ms,
        } => {
            let probe = ProbeRef::from_parts(media_id, bucket, object_key)?;
            match associator.associate_ref(&probe, window_ms).await? {
                Outcome::Matched { recorded, reading } => info!(
                    media_id = recorded.association.probe_id,
                    reading_id = recorded.association.matched_id,
                    delta_ms = recorded.association.delta_ms,
                    weight = ?reading.and_then(|r| r.value_num),
                    created = recorded.created,
                    "Associated"
                ),
                Outcome::Unmatched => warn!(%probe, "No weight reading in window"),
            }
            Ok(())
        }
        Command::Recent { limit } => {
            for a in store.list_recent(limit).await? {
                info!(
                    media_id = a.probe_id,
                    reading_id = a.matched_id,
                    delta_ms = a.delta_ms,
                    method = a.method.as_str(),
                    created_at = %a.created_at,
                    "Association"
                );
            }
            Ok(())
        }
    };

    pool.close().await;
    result
}

async fn consume(config: &Config, associator: &Associator) -> Result<()> {
    info!("Starting weight-associator consumer");
    let publisher = KafkaPublisher::from_config(&config.bus)?;
    let notifier = BusNotifier::new(publisher.clone(), config.bus.topics.weight_associated.clone());

    let consumer: StreamConsumer = consumer_config(&config.bus)?.create()?;
    consumer.subscribe(&[config.bus.topics.image_created.as_str()])?;
    info!(
        topic = %config.bus.topics.image_created,
        group = %config.bus.group_id,
        concurrency = config.associator.concurrency,
        "Subscribed"
    );

    let token = CancellationToken::new();
    shutdown::cancel_on_signal(token.clone());

    // Each chunk is handled concurrently and its offsets are stored only once
    // the whole chunk is done, so a crash replays at most one chunk.
    let mut chunks = pin!(consumer
        .stream()
        .take_until(token.cancelled())
        .ready_chunks(config.associator.concurrency.max(1)));

    let notifier = &notifier;
    while let Some(chunk) = chunks.next().await {
        let handled = chunk.iter().filter_map(|item| match item {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, "Kafka receive error");
                None
            }
        });
        join_all(handled.map(|message| async move {
            let Some(payload) = message.payload() else {
                warn!(offset = message.offset(), "Empty image.created message, skipping");
                return;
            };
            let handled =
                handle_with_deferral(associator, notifier, payload, ATTEMPTS, BACKOFF, SETTLE).await;
            match handled {
                Ok(Outcome::Matched { recorded, .. }) => debug!(
                    media_id = recorded.association.probe_id,
                    created = recorded.created,
                    "Image associated"
                ),
                Ok(Outcome::Unmatched) => debug!(offset = message.offset(), "No reading in window"),
                Err(e) => error!(
                    partition = message.partition(),
                    offset = message.offset(),
                    error = %e,
                    "Failed to associate image"
                ),
            }
        }))
        .await;

        for message in chunk.iter().flatten() {
            if let Err(e) = consumer.store_offset_from_message(message) {
                warn!(offset = message.offset(), error = %e, "Failed to store offset");
            }
        }
        if let Err(e) = consumer.commit_consumer_state(CommitMode::Async) {
            debug!(error = %e, "Offset commit skipped");
        }
    }

    if let Err(e) = consumer.commit_consumer_state(CommitMode::Sync) {
        warn!(error = %e, "Final offset commit failed");
    }
    consumer.unsubscribe();
    if let Err(e) = publisher.flush(FLUSH_TIMEOUT) {
        warn!(error = %e, "Producer flush incomplete");
    }
    info!("weight-associator consumer stopped");
    Ok(())
}
