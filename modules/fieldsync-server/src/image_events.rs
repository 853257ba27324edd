//! `image.created` handling with retries for transient store failures.

use std::time::Duration;

use chrono::Utc;
use fieldsync_associator::{
    handle_image_created, Associator, AssociatorError, ImageCreated, Outcome, PairingNotifier,
};
use tracing::{debug, warn};

/// Handle one payload, retrying up to `attempts` times when the store is
/// unreachable. Malformed events fail immediately.
pub async fn handle_with_retry<N>(
    associator: &Associator,
    notifier: &N,
    payload: &[u8],
    attempts: u32,
    backoff: Duration,
) -> Result<Outcome, AssociatorError>
where
    N: PairingNotifier + ?Sized,
{
    let mut attempt = 1;
    loop {
        match handle_image_created(associator, notifier, payload).await {
            Err(e) if is_transient(&e) && attempt < attempts => {
                warn!(attempt, error = %e, "Association failed, retrying");
                tokio::time::sleep(backoff * attempt).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Like [`handle_with_retry`], but an image with no reading yet gets one more
/// try once its forward window has closed.
///
/// Readings for `(t, t + window]` are often still in flight when the image
/// event arrives. The wait is `settle` past the end of the window and never
/// longer than `window + settle`; an event whose window closed long ago is
/// not deferred.
pub async fn handle_with_deferral<N>(
    associator: &Associator,
    notifier: &N,
    payload: &[u8],
    attempts: u32,
    backoff: Duration,
    settle: Duration,
) -> Result<Outcome, AssociatorError>
where
    N: PairingNotifier + ?Sized,
{
    let outcome = handle_with_retry(associator, notifier, payload, attempts, backoff).await?;
    if outcome != Outcome::Unmatched {
        return Ok(outcome);
    }
    let Some(wait) = deferral(associator, payload, settle)? else {
        return Ok(outcome);
    };

    debug!(wait_ms = wait.as_millis() as u64, "No reading yet, waiting for the window to close");
    tokio::time::sleep(wait).await;
    handle_with_retry(associator, notifier, payload, attempts, backoff).await
}

fn deferral(
    associator: &Associator,
    payload: &[u8],
    settle: Duration,
) -> Result<Option<Duration>, AssociatorError> {
    let event = ImageCreated::parse(payload)?;
    let window = associator.window();
    let settle = chrono::Duration::from_std(settle)
        .map_err(|e| AssociatorError::Other(anyhow::anyhow!("settle delay out of range: {e}")))?;
    let Some(closes) = event
        .time
        .checked_add_signed(window)
        .and_then(|end| end.checked_add_signed(settle))
    else {
        return Ok(None);
    };

    let remaining = (closes - Utc::now()).min(window + settle);
    Ok(remaining.to_std().ok().filter(|wait| !wait.is_zero()))
}

fn is_transient(error: &AssociatorError) -> bool {
    matches!(error, AssociatorError::Database(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fieldsync_associator::{
        Candidate, MemoryAssociationStore, MemoryCandidateStore, MemoryProbeStore,
        WeightAssociated,
    };

    struct CountingNotifier(std::sync::atomic::AtomicUsize);

    #[async_trait::async_trait]
    impl PairingNotifier for CountingNotifier {
        async fn notify(
            &self,
            _tenant_id: &str,
            _event: &WeightAssociated,
        ) -> fieldsync_associator::Result<()> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    fn associator() -> Associator {
        Associator::new(
            Arc::new(MemoryProbeStore::new()),
            Arc::new(MemoryCandidateStore::new()),
            Arc::new(MemoryAssociationStore::new()),
            vec!["weight".into()],
            5_000,
        )
    }

    #[tokio::test]
    async fn malformed_event_is_not_retried() {
        let notifier = CountingNotifier(Default::default());
        let started = std::time::Instant::now();
        let err = handle_with_retry(&associator(), &notifier, b"{}", 5, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AssociatorError::InvalidEvent(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    fn image_created(time: chrono::DateTime<Utc>) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "media_id": 10,
            "time": time.to_rfc3339(),
            "tenant_id": "farm-a",
            "bucket": "images",
            "object_key": "farm-a/10.jpg"
        }))
        .unwrap()
    }

    fn weight(id: i64, time: chrono::DateTime<Utc>) -> Candidate {
        Candidate {
            id,
            time,
            tenant_id: "farm-a".into(),
            sensor_id: Some("scale-1".into()),
            metric: "weight".into(),
            value_num: Some(2.5),
        }
    }

    #[tokio::test]
    async fn late_reading_inside_forward_window_is_picked_up() {
        let readings = Arc::new(MemoryCandidateStore::new());
        let associator = Associator::new(
            Arc::new(MemoryProbeStore::new()),
            readings.clone(),
            Arc::new(MemoryAssociationStore::new()),
            vec!["weight".into()],
            300,
        );
        let notifier = CountingNotifier(Default::default());
        let captured = Utc::now();
        let payload = image_created(captured);

        let (outcome, _) = tokio::join!(
            handle_with_deferral(
                &associator,
                &notifier,
                &payload,
                1,
                Duration::from_millis(10),
                Duration::from_millis(50),
            ),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                readings.insert(weight(1, captured + chrono::Duration::milliseconds(200)));
            },
        );

        let association = outcome.unwrap().association().unwrap().clone();
        assert_eq!(association.matched_id, 1);
        assert_eq!(association.delta_ms, 200);
        assert_eq!(notifier.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_window_is_not_deferred() {
        let notifier = CountingNotifier(Default::default());
        let payload = image_created(Utc::now() - chrono::Duration::hours(1));
        let started = std::time::Instant::now();

        let outcome = handle_with_deferral(
            &associator(),
            &notifier,
            &payload,
            1,
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(outcome, Outcome::Unmatched);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn only_store_failures_are_transient() {
        assert!(is_transient(&AssociatorError::Database(sqlx::Error::PoolTimedOut)));
        assert!(!is_transient(&AssociatorError::InvalidEvent("x".into())));
        assert!(!is_transient(&AssociatorError::ProbeNotFound("x".into())));
    }
}
