//! Pairing notifications and the `image.created` handler.

use async_trait::async_trait;
use chrono::Utc;
use fieldsync_mover::{BusMessage, Publisher};
use tracing::{debug, warn};

use crate::associator::Associator;
use crate::error::{AssociatorError, Result};
use crate::events::{ImageCreated, WeightAssociated, WEIGHT_ASSOCIATED};
use crate::types::{Outcome, Probe, ProbeRef};

/// Announces a recorded pairing to downstream consumers.
#[async_trait]
pub trait PairingNotifier: Send + Sync {
    async fn notify(&self, tenant_id: &str, event: &WeightAssociated) -> Result<()>;
}

/// Publishes `weight.associated` keyed by tenant.
pub struct BusNotifier<P> {
    publisher: P,
    topic: String,
}

impl<P: Publisher> BusNotifier<P> {
    pub fn new(publisher: P, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl<P: Publisher> PairingNotifier for BusNotifier<P> {
    async fn notify(&self, tenant_id: &str, event: &WeightAssociated) -> Result<()> {
        let value = serde_json::to_value(event).map_err(anyhow::Error::from)?;
        let message = BusMessage::json(tenant_id, &value)?;
        self.publisher.publish(&self.topic, vec![message]).await?;
        Ok(())
    }
}

/// Handle one `image.created` payload: parse, resolve the stored media
/// (falling back to the event's own fields when it is not stored yet),
/// associate with the default window, then notify.
///
/// A failed notification is logged and does not undo the association; every
/// redelivery of the event notifies again.
pub async fn handle_image_created<N>(
    associator: &Associator,
    notifier: &N,
    payload: &[u8],
) -> Result<Outcome>
where
    N: PairingNotifier + ?Sized,
{
    let event = ImageCreated::parse(payload)?;
    let probe = resolve_probe(associator, &event).await?;
    let outcome = associator.associate(&probe, associator.window()).await?;

    if let Outcome::Matched { recorded, reading } = &outcome {
        let association = &recorded.association;
        let notice = WeightAssociated {
            event: WEIGHT_ASSOCIATED.to_string(),
            media_id: association.probe_id,
            reading_id: association.matched_id,
            delta_ms: association.delta_ms,
            weight: reading.as_ref().and_then(|r| r.value_num),
            time: Utc::now(),
        };
        if let Err(e) = notifier.notify(&probe.tenant_id, &notice).await {
            warn!(
                media_id = association.probe_id,
                error = %e,
                "Failed to publish weight.associated"
            );
        }
    }
    Ok(outcome)
}

async fn resolve_probe(associator: &Associator, event: &ImageCreated) -> Result<Probe> {
    match associator
        .probes()
        .resolve(&ProbeRef::MediaId(event.media_id))
        .await
    {
        Ok(probe) => Ok(probe),
        Err(AssociatorError::ProbeNotFound(_)) => {
            debug!(media_id = event.media_id, "Media not stored yet, using event fields");
            Ok(event.probe())
        }
        Err(e) => Err(e),
    }
}
