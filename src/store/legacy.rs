//! Legacy region encoding.
//!
//! Records written by the old `Queue` call are keyed by the serialized
//! description (`{"description":{"type":..,"details":..}}`) and hold a version
//! byte followed by packed little-endian nanosecond timestamps.

use super::event::{Event, EventDescription};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

pub const LEGACY_FORMAT_VERSION: u8 = 0;

const TIMESTAMP_WIDTH: usize = 8;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unsupported legacy record version {0}")]
    UnsupportedVersion(u8),

    #[error("legacy record has invalid length {0} (expected 1 + 8n bytes)")]
    InvalidLength(usize),

    #[error("invalid legacy description: {0}")]
    Description(String),

    #[error("timestamp {0} is outside the representable range")]
    TimestampOutOfRange(i64),
}

/// One decoded legacy record.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyRecord {
    pub description: EventDescription,
    pub timestamps: Vec<DateTime<Utc>>,
}

impl LegacyRecord {
    /// Expands the record into one event per packed timestamp.
    pub fn into_events(self) -> Vec<Event> {
        let description = self.description;
        self.timestamps
            .into_iter()
            .map(|timestamp| Event {
                timestamp,
                description: description.clone(),
            })
            .collect()
    }
}

#[derive(Deserialize)]
struct DescriptionEnvelope {
    description: EventDescription,
}

/// Decodes a legacy key/value pair. Nothing is written until every record
/// decoded, so a corrupt record fails before any migration write happens.
pub fn decode_record(key: &[u8], value: &[u8]) -> Result<LegacyRecord, FormatError> {
    let description = decode_description(key)?;
    let timestamps = decode_timestamps(value)?
        .into_iter()
        .map(DateTime::from_timestamp_nanos)
        .collect();

    Ok(LegacyRecord {
        description,
        timestamps,
    })
}

pub fn decode_description(key: &[u8]) -> Result<EventDescription, FormatError> {
    let envelope: DescriptionEnvelope =
        serde_json::from_slice(key).map_err(|e| FormatError::Description(e.to_string()))?;
    Ok(envelope.description)
}

pub fn decode_timestamps(value: &[u8]) -> Result<Vec<i64>, FormatError> {
    let Some((&version, packed)) = value.split_first() else {
        return Err(FormatError::InvalidLength(0));
    };
    if version != LEGACY_FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    if packed.len() % TIMESTAMP_WIDTH != 0 {
        return Err(FormatError::InvalidLength(value.len()));
    }

    Ok(packed
        .chunks_exact(TIMESTAMP_WIDTH)
        .map(|chunk| {
            let mut buf = [0u8; TIMESTAMP_WIDTH];
            buf.copy_from_slice(chunk);
            i64::from_le_bytes(buf)
        })
        .collect())
}

/// Appends one timestamp to an existing packed value, or starts a new one.
pub fn append_timestamp(existing: Option<&[u8]>, nanos: i64) -> Vec<u8> {
    let mut value = match existing {
        Some(bytes) if !bytes.is_empty() => bytes.to_vec(),
        _ => vec![LEGACY_FORMAT_VERSION],
    };
    value.extend_from_slice(&nanos.to_le_bytes());
    value
}

pub fn encode_timestamps(nanos: &[i64]) -> Vec<u8> {
    let mut value = Vec::with_capacity(1 + nanos.len() * TIMESTAMP_WIDTH);
    value.push(LEGACY_FORMAT_VERSION);
    for n in nanos {
        value.extend_from_slice(&n.to_le_bytes());
    }
    value
}

pub fn datetime_to_nanos(timestamp: &DateTime<Utc>) -> Result<i64, FormatError> {
    timestamp
        .timestamp_nanos_opt()
        .ok_or(FormatError::TimestampOutOfRange(timestamp.timestamp()))
}
