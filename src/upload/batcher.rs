use crate::store::{Event, EventStore, StoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::warn;

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Same-description events delivered in one upload call.
#[derive(Debug, Clone, PartialEq)]
pub struct EventGroup {
    /// Canonical `{"description":{..}}` JSON shared by every event in the group.
    pub description: String,
    pub times: Vec<DateTime<Utc>>,
    pub keys: Vec<u64>,
}

impl EventGroup {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Groups queued events by description and splits each group into chunks
/// of at most `batch_size`. Within a description, events keep the order of
/// `records`; the order of the returned groups is unspecified.
pub fn build_batches(
    records: &[(u64, Event)],
    batch_size: usize,
) -> Result<Vec<EventGroup>, serde_json::Error> {
    let batch_size = batch_size.max(1);

    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, (Vec<DateTime<Utc>>, Vec<u64>)> = HashMap::new();

    for (key, event) in records {
        let description = event.description.canonical()?;
        let entry = grouped.entry(description).or_insert_with_key(|d| {
            order.push(d.clone());
            (Vec::new(), Vec::new())
        });
        entry.0.push(event.timestamp);
        entry.1.push(*key);
    }

    let mut groups = Vec::new();
    for description in order {
        let Some((times, keys)) = grouped.remove(&description) else {
            continue;
        };
        for (times, keys) in times.chunks(batch_size).zip(keys.chunks(batch_size)) {
            groups.push(EventGroup {
                description: description.clone(),
                times: times.to_vec(),
                keys: keys.to_vec(),
            });
        }
    }

    Ok(groups)
}

/// Loads the events for `keys`. Records that disappeared or no longer
/// decode are skipped; they stay queued.
pub async fn snapshot(
    store: &EventStore,
    keys: &[u64],
) -> Result<Vec<(u64, Event)>, StoreError> {
    let mut records = Vec::with_capacity(keys.len());
    for &key in keys {
        match store.get_event(key).await {
            Ok(event) => records.push((key, event)),
            Err(StoreError::NotFound(_)) => {}
            Err(StoreError::Serialization(e)) => {
                warn!(key = key, error = %e, "Skipping undecodable event");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(records)
}
