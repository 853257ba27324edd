//! Temporal Associator: pair each probe with the nearest candidate in a
//! bounded window, recording the pairing exactly once.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info};

use crate::error::{AssociatorError, Result};
use crate::nearest::nearest;
use crate::store::{AssociationStore, CandidateStore, ProbeStore};
use crate::types::{CandidateQuery, MatchMethod, NewAssociation, Outcome, Probe, ProbeRef, Recorded};

pub const MIN_WINDOW_MS: i64 = 100;
pub const MAX_WINDOW_MS: i64 = 60_000;

pub struct Associator {
    probes: Arc<dyn ProbeStore>,
    candidates: Arc<dyn CandidateStore>,
    associations: Arc<dyn AssociationStore>,
    metrics: Vec<String>,
    window: Duration,
}

impl Associator {
    pub fn new(
        probes: Arc<dyn ProbeStore>,
        candidates: Arc<dyn CandidateStore>,
        associations: Arc<dyn AssociationStore>,
        metrics: Vec<String>,
        window_ms: i64,
    ) -> Self {
        Self {
            probes,
            candidates,
            associations,
            metrics,
            window: Duration::milliseconds(window_ms),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn associations(&self) -> &Arc<dyn AssociationStore> {
        &self.associations
    }

    pub fn probes(&self) -> &Arc<dyn ProbeStore> {
        &self.probes
    }

    /// Pair `probe` with its nearest candidate within `window` either side.
    ///
    /// A probe that already has an association gets that association back
    /// untouched, so replaying a probe can never change its match.
    pub async fn associate(&self, probe: &Probe, window: Duration) -> Result<Outcome> {
        if let Some(existing) = self.associations.get_by_probe(probe.probe_id).await? {
            debug!(probe_id = probe.probe_id, "Probe already associated");
            let reading = self.candidates.get(existing.matched_id).await?;
            return Ok(Outcome::Matched {
                recorded: Recorded {
                    association: existing,
                    created: false,
                },
                reading,
            });
        }

        let (Some(start), Some(end)) = (
            probe.time.checked_sub_signed(window),
            probe.time.checked_add_signed(window),
        ) else {
            return Err(AssociatorError::InvalidEvent(format!(
                "probe time {} is too close to the representable range for a {} ms window",
                probe.time,
                window.num_milliseconds()
            )));
        };
        let query = CandidateQuery {
            tenant_id: probe.tenant_id.clone(),
            sensor_id: probe.sensor_id.clone(),
            metrics: self.metrics.clone(),
            start,
            end,
        };
        let candidates = self.candidates.candidates_in_window(&query).await?;
        let Some((best, delta_ms)) = nearest(probe.time, &candidates) else {
            debug!(
                probe_id = probe.probe_id,
                tenant_id = %probe.tenant_id,
                window_ms = window.num_milliseconds(),
                "No candidate in window"
            );
            return Ok(Outcome::Unmatched);
        };

        let delta_ms = i32::try_from(delta_ms)
            .map_err(|_| anyhow::anyhow!("delta of {delta_ms} ms does not fit the association"))?;
        let recorded = self
            .associations
            .insert_if_absent(NewAssociation {
                probe_id: probe.probe_id,
                matched_id: best.id,
                delta_ms,
                method: MatchMethod::Nearest,
                confidence: None,
            })
            .await?;

        let reading = if recorded.association.matched_id == best.id {
            Some(best.clone())
        } else {
            // Lost a race to a concurrent resolution; report what is on record.
            self.candidates.get(recorded.association.matched_id).await?
        };

        if recorded.created {
            info!(
                probe_id = probe.probe_id,
                reading_id = recorded.association.matched_id,
                delta_ms = recorded.association.delta_ms,
                "Recorded association"
            );
        }
        Ok(Outcome::Matched { recorded, reading })
    }

    /// Resolve a stored probe and associate it, optionally with a caller
    /// chosen window of 100..=60000 ms.
    pub async fn associate_ref(&self, probe: &ProbeRef, window_ms: Option<i64>) -> Result<Outcome> {
        let window = match window_ms {
            None => self.window,
            Some(ms) if (MIN_WINDOW_MS..=MAX_WINDOW_MS).contains(&ms) => Duration::milliseconds(ms),
            Some(ms) => return Err(AssociatorError::InvalidWindow(ms)),
        };
        let probe = self.probes.resolve(probe).await?;
        self.associate(&probe, window).await
    }
}
