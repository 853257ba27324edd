use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AssociatorError;

/// An event that wants a partner from the candidate stream, e.g. an image
/// capture looking for the weight reading taken at the same moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub probe_id: i64,
    pub time: DateTime<Utc>,
    pub tenant_id: String,
    pub sensor_id: Option<String>,
    pub station_id: Option<String>,
}

/// How a caller points at a stored probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeRef {
    MediaId(i64),
    Object { bucket: String, object_key: String },
}

impl ProbeRef {
    /// Prefer the id; fall back to the object key when both parts are given.
    pub fn from_parts(
        media_id: Option<i64>,
        bucket: Option<String>,
        object_key: Option<String>,
    ) -> Result<Self, AssociatorError> {
        match (media_id, bucket, object_key) {
            (Some(id), _, _) => Ok(ProbeRef::MediaId(id)),
            (None, Some(bucket), Some(object_key)) if !bucket.is_empty() && !object_key.is_empty() => {
                Ok(ProbeRef::Object { bucket, object_key })
            }
            _ => Err(AssociatorError::EmptyProbeRef),
        }
    }
}

impl fmt::Display for ProbeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeRef::MediaId(id) => write!(f, "media_id={id}"),
            ProbeRef::Object { bucket, object_key } => write!(f, "{bucket}/{object_key}"),
        }
    }
}

/// A reading that may be paired with a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: i64,
    pub time: DateTime<Utc>,
    pub tenant_id: String,
    pub sensor_id: Option<String>,
    pub metric: String,
    pub value_num: Option<f64>,
}

/// Candidates of `metrics` for one tenant (and sensor, when given) with
/// `start <= time <= end`.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub tenant_id: String,
    pub sensor_id: Option<String>,
    pub metrics: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CandidateQuery {
    pub fn matches(&self, c: &Candidate) -> bool {
        c.tenant_id == self.tenant_id
            && self
                .sensor_id
                .as_ref()
                .map_or(true, |s| c.sensor_id.as_ref() == Some(s))
            && self.metrics.iter().any(|m| *m == c.metric)
            && c.time >= self.start
            && c.time <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Nearest,
    Window,
    Exact,
}

impl MatchMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchMethod::Nearest => "nearest",
            MatchMethod::Window => "window",
            MatchMethod::Exact => "exact",
        }
    }
}

impl FromStr for MatchMethod {
    type Err = AssociatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nearest" => Ok(MatchMethod::Nearest),
            "window" => Ok(MatchMethod::Window),
            "exact" => Ok(MatchMethod::Exact),
            other => Err(AssociatorError::UnknownMethod(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAssociation {
    pub probe_id: i64,
    pub matched_id: i64,
    pub delta_ms: i32,
    pub method: MatchMethod,
    pub confidence: Option<f64>,
}

/// A stored pairing. At most one exists per probe and it never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Association {
    pub id: i64,
    pub probe_id: i64,
    pub matched_id: i64,
    pub delta_ms: i32,
    pub method: MatchMethod,
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Result of an idempotent insert: the association now on record, and
/// whether this call created it.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub association: Association,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Matched {
        recorded: Recorded,
        /// The paired reading, when it is still present.
        reading: Option<Candidate>,
    },
    /// Nothing inside the window. Not an error; the caller may retry later.
    Unmatched,
}

impl Outcome {
    pub fn association(&self) -> Option<&Association> {
        match self {
            Outcome::Matched { recorded, .. } => Some(&recorded.association),
            Outcome::Unmatched => None,
        }
    }
}
