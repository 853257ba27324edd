//! In-memory stores for tests. No database required.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{AssociatorError, Result};
use crate::store::{clamp_limit, AssociationStore, CandidateStore, ProbeStore};
use crate::types::{Association, Candidate, CandidateQuery, NewAssociation, Probe, ProbeRef, Recorded};

#[derive(Default)]
pub struct MemoryProbeStore {
    probes: Mutex<Vec<(Probe, Option<(String, String)>)>>,
}

impl MemoryProbeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, probe: Probe) {
        self.probes.lock().unwrap().push((probe, None));
    }

    pub fn insert_object(&self, probe: Probe, bucket: &str, object_key: &str) {
        self.probes
            .lock()
            .unwrap()
            .push((probe, Some((bucket.to_string(), object_key.to_string()))));
    }
}

#[async_trait]
impl ProbeStore for MemoryProbeStore {
    async fn resolve(&self, probe: &ProbeRef) -> Result<Probe> {
        let probes = self.probes.lock().unwrap();
        let found = probes.iter().find(|(p, object)| match probe {
            ProbeRef::MediaId(id) => p.probe_id == *id,
            ProbeRef::Object { bucket, object_key } => object
                .as_ref()
                .is_some_and(|(b, k)| b == bucket && k == object_key),
        });
        found
            .map(|(p, _)| p.clone())
            .ok_or_else(|| AssociatorError::ProbeNotFound(probe.to_string()))
    }
}

#[derive(Default)]
pub struct MemoryCandidateStore {
    readings: Mutex<Vec<Candidate>>,
}

impl MemoryCandidateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, candidate: Candidate) {
        self.readings.lock().unwrap().push(candidate);
    }
}

#[async_trait]
impl CandidateStore for MemoryCandidateStore {
    async fn candidates_in_window(&self, query: &CandidateQuery) -> Result<Vec<Candidate>> {
        let mut found: Vec<Candidate> = self
            .readings
            .lock()
            .unwrap()
            .iter()
            .filter(|c| query.matches(c))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.time.cmp(&b.time).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn get(&self, id: i64) -> Result<Option<Candidate>> {
        Ok(self
            .readings
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }
}

/// Associations unique per probe, like the `media_id` unique constraint.
pub struct MemoryAssociationStore {
    rows: Mutex<Vec<Association>>,
    next_id: AtomicI64,
}

impl Default for MemoryAssociationStore {
    fn default() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl MemoryAssociationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Association> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl AssociationStore for MemoryAssociationStore {
    async fn insert_if_absent(&self, new: NewAssociation) -> Result<Recorded> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(existing) = rows.iter().find(|a| a.probe_id == new.probe_id) {
            return Ok(Recorded {
                association: existing.clone(),
                created: false,
            });
        }
        let association = Association {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            probe_id: new.probe_id,
            matched_id: new.matched_id,
            delta_ms: new.delta_ms,
            method: new.method,
            confidence: new.confidence,
            created_at: Utc::now(),
        };
        rows.push(association.clone());
        Ok(Recorded {
            association,
            created: true,
        })
    }

    async fn get_by_probe(&self, probe_id: i64) -> Result<Option<Association>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.probe_id == probe_id)
            .cloned())
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Association>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .rev()
            .take(clamp_limit(limit) as usize)
            .cloned()
            .collect())
    }
}
