//! Bus payloads consumed and produced by the associator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AssociatorError, Result};
use crate::types::Probe;

pub const IMAGE_CREATED: &str = "image.created";
pub const WEIGHT_ASSOCIATED: &str = "weight.associated";

fn image_created() -> String {
    IMAGE_CREATED.to_string()
}

/// Emitted by image ingestion once an object is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageCreated {
    #[serde(default = "image_created")]
    pub event: String,
    pub media_id: i64,
    pub time: DateTime<Utc>,
    pub tenant_id: String,
    pub bucket: String,
    pub object_key: String,
    #[serde(default)]
    pub station_id: Option<String>,
    #[serde(default)]
    pub sensor_id: Option<String>,
    #[serde(default)]
    pub meta: Option<Value>,
}

impl ImageCreated {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let event: ImageCreated = serde_json::from_slice(payload)
            .map_err(|e| AssociatorError::InvalidEvent(e.to_string()))?;
        if event.event != IMAGE_CREATED {
            return Err(AssociatorError::InvalidEvent(format!(
                "expected {IMAGE_CREATED}, got {}",
                event.event
            )));
        }
        Ok(event)
    }

    /// The probe as described by the event itself.
    pub fn probe(&self) -> Probe {
        Probe {
            probe_id: self.media_id,
            time: self.time,
            tenant_id: self.tenant_id.clone(),
            sensor_id: self.sensor_id.clone(),
            station_id: self.station_id.clone(),
        }
    }
}

/// Announces a pairing between an image and a weight reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightAssociated {
    pub event: String,
    pub media_id: i64,
    pub reading_id: i64,
    pub delta_ms: i32,
    pub weight: Option<f64>,
    pub time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_name_defaults_and_optionals_may_be_absent() {
        let raw = br#"{
            "media_id": 12,
            "time": "2024-06-01T08:00:00.000Z",
            "tenant_id": "farm-a",
            "bucket": "images",
            "object_key": "farm-a/cam1/0001.jpg"
        }"#;
        let event = ImageCreated::parse(raw).unwrap();
        assert_eq!(event.event, "image.created");
        assert_eq!(event.sensor_id, None);
        assert_eq!(event.probe().probe_id, 12);
    }

    #[test]
    fn other_event_names_are_rejected() {
        let raw = br#"{"event": "image.deleted", "media_id": 1, "time": "2024-06-01T08:00:00Z",
                       "tenant_id": "t", "bucket": "b", "object_key": "k"}"#;
        assert!(matches!(
            ImageCreated::parse(raw),
            Err(AssociatorError::InvalidEvent(_))
        ));
    }

    #[test]
    fn non_integer_media_id_is_rejected() {
        let raw = br#"{"media_id": "abc", "time": "2024-06-01T08:00:00Z",
                       "tenant_id": "t", "bucket": "b", "object_key": "k"}"#;
        assert!(ImageCreated::parse(raw).is_err());
    }
}
