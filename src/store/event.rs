use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Event type written when a burst of another type is suppressed.
pub const RATE_LIMIT_EVENT_TYPE: &str = "rateLimit";

/// Event type for bulk recording offload notifications.
pub const OFFLOADED_RECORDING_EVENT_TYPE: &str = "offloadedRecording";

/// Event type queued at startup when the device was powered off.
pub const POWERED_OFF_EVENT_TYPE: &str = "rpiPoweredOff";

/// Something a producer wants reported, stamped with when it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "Description")]
    pub description: EventDescription,
}

/// The `(type, details)` pair. Two events with equal descriptions are
/// interchangeable for batching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDescription {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, deserialize_with = "details_or_empty")]
    pub details: Map<String, Value>,
}

fn details_or_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        details: Map<String, Value>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            description: EventDescription {
                event_type: event_type.into(),
                details,
            },
        }
    }

    pub fn event_type(&self) -> &str {
        &self.description.event_type
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[derive(Serialize)]
struct DescriptionEnvelope<'a> {
    description: &'a EventDescription,
}

impl EventDescription {
    /// Canonical serialized form, `{"description":{"type":..,"details":..}}`.
    ///
    /// `details` is a sorted map, so equal descriptions always serialize to
    /// the same string. This is also the key format of the legacy region.
    pub fn canonical(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&DescriptionEnvelope { description: self })
    }
}

/// Parses the details string producers pass to `Add`. Empty input and
/// `null` both read as an empty object.
pub fn parse_details(details: &str) -> Result<Map<String, Value>, serde_json::Error> {
    if details.trim().is_empty() {
        return Ok(Map::new());
    }
    Ok(serde_json::from_str::<Option<Map<String, Value>>>(details)?.unwrap_or_default())
}
