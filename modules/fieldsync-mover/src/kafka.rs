//! Kafka plumbing: client settings from [`BusConfig`] and the batch publisher.

use std::time::Duration;

use async_trait::async_trait;
use fieldsync_common::BusConfig;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tracing::debug;

use crate::error::{MoverError, Result};
use crate::sink::{BusMessage, Publisher};

/// Connection and security settings shared by producers and consumers.
pub fn client_config(bus: &BusConfig) -> Result<ClientConfig> {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", bus.bootstrap_servers()?)
        .set("client.id", &bus.client_id);

    let protocol = match (bus.ssl, bus.sasl.is_some()) {
        (true, true) => "SASL_SSL",
        (false, true) => "SASL_PLAINTEXT",
        (true, false) => "SSL",
        (false, false) => "PLAINTEXT",
    };
    config.set("security.protocol", protocol);

    if let Some(sasl) = &bus.sasl {
        config
            .set("sasl.mechanism", sasl.mechanism.as_kafka_str())
            .set("sasl.username", &sasl.username)
            .set("sasl.password", &sasl.password);
    }
    Ok(config)
}

/// Idempotent, gzip-compressed producer acknowledged by all in-sync replicas.
pub fn producer_config(bus: &BusConfig) -> Result<ClientConfig> {
    let mut config = client_config(bus)?;
    config
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("compression.type", "gzip")
        .set("message.timeout.ms", "30000");
    Ok(config)
}

/// Consumer-group settings with manual offset storage: offsets are stored
/// only after a message has been handled, then committed.
pub fn consumer_config(bus: &BusConfig) -> Result<ClientConfig> {
    let mut config = client_config(bus)?;
    config
        .set("group.id", &bus.group_id)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "earliest");
    Ok(config)
}

/// [`Publisher`] over an rdkafka [`FutureProducer`].
///
/// Every record is enqueued in order before any delivery report is awaited;
/// with idempotence on, the broker keeps per-partition order. The batch only
/// succeeds once every report is positive.
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer) -> Self {
        Self { producer }
    }

    pub fn from_config(bus: &BusConfig) -> Result<Self> {
        let producer: FutureProducer = producer_config(bus)?.create()?;
        Ok(Self { producer })
    }

    /// Wait for outstanding messages before shutdown.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer.flush(timeout)?;
        Ok(())
    }
}

fn headers(message: &BusMessage) -> OwnedHeaders {
    message
        .headers
        .iter()
        .fold(OwnedHeaders::new(), |headers, (key, value)| {
            headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            })
        })
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, topic: &str, messages: Vec<BusMessage>) -> Result<()> {
        let count = messages.len();
        let mut pending = Vec::with_capacity(count);

        for message in &messages {
            let record = FutureRecord::to(topic)
                .key(message.key.as_str())
                .payload(message.value.as_str())
                .headers(headers(message));
            let delivery = self
                .producer
                .send_result(record)
                .map_err(|(e, _)| MoverError::Publish {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })?;
            pending.push(delivery);
        }

        for delivery in pending {
            match delivery.await {
                Ok(Ok(_)) => {}
                Ok(Err((e, _))) => {
                    return Err(MoverError::Publish {
                        topic: topic.to_string(),
                        reason: e.to_string(),
                    })
                }
                Err(_) => {
                    return Err(MoverError::Publish {
                        topic: topic.to_string(),
                        reason: "delivery report dropped".to_string(),
                    })
                }
            }
        }

        debug!(topic, count, "Published batch");
        Ok(())
    }
}
