use super::duckdb::DuckDbBackend;
use super::event::Event;
use super::legacy::{self, LegacyRecord};
use super::rate_limit::{RateLimiter, Verdict};
use super::traits::{KvBackend, KvTxn, Region, StoreError};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of [`EventStore::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Stored(u64),
    /// Dropped by the rate limiter. Not an error.
    Suppressed,
}

/// What the open-time migration moved out of the legacy region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub records: usize,
    pub events: usize,
}

pub fn sequence_key(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

pub fn decode_sequence_key(key: &[u8]) -> Result<u64, StoreError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| StoreError::Storage(format!("invalid event key length {}", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Writes one event under a fresh sequence number, bypassing the rate limiter.
fn insert_event(txn: &mut dyn KvTxn, data: &[u8]) -> Result<u64, StoreError> {
    let seq = txn.next_sequence(Region::Events)?;
    txn.put(Region::Events, &sequence_key(seq), data)?;
    Ok(seq)
}

/// Durable event queue.
///
/// Cloning is cheap; clones share the backend and the rate limiter.
#[derive(Clone)]
pub struct EventStore {
    backend: Arc<dyn KvBackend>,
    limiter: Arc<RateLimiter>,
    migration: MigrationReport,
}

impl EventStore {
    /// Opens (or creates) the store file and migrates any legacy records.
    pub async fn open(path: impl AsRef<Path>, limiter: RateLimiter) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let backend = tokio::task::spawn_blocking(move || DuckDbBackend::open(path)).await??;
        Self::with_backend(Arc::new(backend), limiter).await
    }

    pub async fn in_memory(limiter: RateLimiter) -> Result<Self, StoreError> {
        let backend = DuckDbBackend::in_memory()?;
        Self::with_backend(Arc::new(backend), limiter).await
    }

    pub async fn with_backend(
        backend: Arc<dyn KvBackend>,
        limiter: RateLimiter,
    ) -> Result<Self, StoreError> {
        let migration = {
            let backend = Arc::clone(&backend);
            tokio::task::spawn_blocking(move || {
                backend.create_regions()?;
                migrate(backend.as_ref())
            })
            .await??
        };

        Ok(Self {
            backend,
            limiter: Arc::new(limiter),
            migration,
        })
    }

    pub fn migration_report(&self) -> MigrationReport {
        self.migration
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn KvBackend) -> Result<T, StoreError> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || f(backend.as_ref())).await?
    }

    /// Queues an event. The rate limiter runs first; when a burst reaches
    /// its threshold the alert event is written in place of this one.
    pub async fn add(&self, event: Event) -> Result<AddOutcome, StoreError> {
        match self.limiter.check(&event) {
            Verdict::Allow => {
                let key = self.insert(&event).await?;
                debug!(key = key, event_type = %event.event_type(), "Stored event");
                Ok(AddOutcome::Stored(key))
            }
            Verdict::SuppressAndAlert => {
                let alert = self.limiter.alert_for(&event);
                let key = self.insert(&alert).await?;
                info!(
                    key = key,
                    event_type = %event.event_type(),
                    "Rate limit reached, stored alert event"
                );
                Ok(AddOutcome::Suppressed)
            }
            Verdict::Suppress => Ok(AddOutcome::Suppressed),
        }
    }

    async fn insert(&self, event: &Event) -> Result<u64, StoreError> {
        let data = event.to_json()?.into_bytes();
        self.blocking(move |backend| {
            let mut key = 0;
            backend.update(&mut |txn| {
                key = insert_event(txn, &data)?;
                Ok(())
            })?;
            Ok(key)
        })
        .await
    }

    /// Serialized event stored under `key`.
    pub async fn get(&self, key: u64) -> Result<String, StoreError> {
        let data = self.get_raw(key).await?;
        String::from_utf8(data)
            .map_err(|e| StoreError::Storage(format!("event {} is not valid UTF-8: {}", key, e)))
    }

    pub async fn get_event(&self, key: u64) -> Result<Event, StoreError> {
        let data = self.get_raw(key).await?;
        Ok(Event::from_json(&data)?)
    }

    async fn get_raw(&self, key: u64) -> Result<Vec<u8>, StoreError> {
        self.blocking(move |backend| {
            let mut value = None;
            backend.view(&mut |txn| {
                value = txn.get(Region::Events, &sequence_key(key))?;
                Ok(())
            })?;
            value.ok_or(StoreError::NotFound(key))
        })
        .await
    }

    /// All queued keys, ascending.
    pub async fn get_keys(&self) -> Result<Vec<u64>, StoreError> {
        self.blocking(|backend| {
            let mut raw = Vec::new();
            backend.view(&mut |txn| {
                raw = txn.keys(Region::Events)?;
                Ok(())
            })?;
            raw.iter().map(|k| decode_sequence_key(k)).collect()
        })
        .await
    }

    /// Removes one record; absent keys are a no-op.
    pub async fn delete(&self, key: u64) -> Result<(), StoreError> {
        self.blocking(move |backend| {
            backend.update(&mut |txn| txn.delete(Region::Events, &sequence_key(key)))
        })
        .await
    }

    /// Removes records one transaction at a time. Stops at the first failure;
    /// keys already removed stay removed.
    pub async fn delete_keys(&self, keys: &[u64]) -> Result<(), StoreError> {
        let keys = keys.to_vec();
        self.blocking(move |backend| {
            for key in &keys {
                backend.update(&mut |txn| txn.delete(Region::Events, &sequence_key(*key)))?;
            }
            Ok(())
        })
        .await
    }

    /// Legacy `Queue` path: appends the timestamp to the packed record keyed
    /// by `description`. Migrated into the events region on the next open.
    pub async fn queue_legacy(
        &self,
        description: Vec<u8>,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        legacy::decode_description(&description)?;
        let nanos = legacy::datetime_to_nanos(&timestamp)?;

        self.blocking(move |backend| {
            backend.update(&mut |txn| {
                let existing = txn.get(Region::Legacy, &description)?;
                let value = legacy::append_timestamp(existing.as_deref(), nanos);
                txn.put(Region::Legacy, &description, &value)
            })
        })
        .await
    }

    pub async fn legacy_records(&self) -> Result<Vec<LegacyRecord>, StoreError> {
        self.blocking(|backend| {
            let mut entries = Vec::new();
            backend.view(&mut |txn| {
                entries = txn.scan(Region::Legacy)?;
                Ok(())
            })?;
            entries
                .iter()
                .map(|(k, v)| legacy::decode_record(k, v).map_err(StoreError::from))
                .collect()
        })
        .await
    }

    /// Waits for in-flight transactions and releases the storage handle.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.blocking(|backend| backend.close()).await?;
        info!("Event store closed");
        Ok(())
    }
}

/// Moves every legacy record into the events region.
///
/// All records are decoded before anything is written, so a corrupt record
/// leaves the file untouched. Each record's events and the removal of the
/// record itself commit in one transaction.
fn migrate(backend: &dyn KvBackend) -> Result<MigrationReport, StoreError> {
    let mut entries = Vec::new();
    backend.view(&mut |txn| {
        entries = txn.scan(Region::Legacy)?;
        Ok(())
    })?;

    if entries.is_empty() {
        return Ok(MigrationReport::default());
    }

    info!(records = entries.len(), "Migrating legacy event records");

    let mut decoded = Vec::with_capacity(entries.len());
    for (key, value) in &entries {
        let record = legacy::decode_record(key, value)?;
        let mut payloads = Vec::with_capacity(record.timestamps.len());
        for event in record.into_events() {
            payloads.push(event.to_json()?.into_bytes());
        }
        decoded.push((key, payloads));
    }

    let mut report = MigrationReport::default();
    for (key, payloads) in decoded {
        backend.update(&mut |txn| {
            for data in &payloads {
                insert_event(txn, data)?;
            }
            txn.delete(Region::Legacy, key)
        })?;
        report.records += 1;
        report.events += payloads.len();
    }

    if report.events == 0 {
        warn!(records = report.records, "Legacy records held no timestamps");
    }
    info!(
        records = report.records,
        events = report.events,
        "Legacy migration complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::event::RATE_LIMIT_EVENT_TYPE;
    use chrono::TimeZone;
    use serde_json::{json, Map, Value};

    fn details(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn event_at(event_type: &str, secs: i64) -> Event {
        Event::new(
            event_type,
            details(json!({"source": "test"})),
            Utc.timestamp_opt(secs, 0).unwrap(),
        )
    }

    async fn setup_store() -> EventStore {
        EventStore::in_memory(RateLimiter::default()).await.unwrap()
    }

    async fn stored_events(store: &EventStore) -> Vec<Event> {
        let mut events = Vec::new();
        for key in store.get_keys().await.unwrap() {
            events.push(store.get_event(key).await.unwrap());
        }
        events
    }

    #[test]
    fn test_sequence_key_orders_numerically() {
        assert!(sequence_key(255) < sequence_key(256));
        assert_eq!(decode_sequence_key(&sequence_key(12345)).unwrap(), 12345);
        assert!(decode_sequence_key(&[1, 2, 3]).is_err());
    }

    #[tokio::test]
    async fn test_add_then_get_round_trips() {
        let store = setup_store().await;
        let event = Event::new(
            "systemError",
            details(json!({"unit": "audiobait", "nested": {"a": [1, 2, 3]}})),
            Utc.timestamp_nanos(1_650_000_000_987_654_321),
        );

        let AddOutcome::Stored(key) = store.add(event.clone()).await.unwrap() else {
            panic!("event should be stored");
        };

        let raw = store.get(key).await.unwrap();
        assert_eq!(Event::from_json(raw.as_bytes()).unwrap(), event);
        assert_eq!(store.get_event(key).await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_get_keys_counts_adds() {
        let store = setup_store().await;
        for i in 0..10 {
            store.add(event_at(&format!("type{}", i), i)).await.unwrap();
        }

        let keys = store.get_keys().await.unwrap();
        assert_eq!(keys.len(), 10);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_get_missing_key_is_not_found() {
        let store = setup_store().await;
        assert!(matches!(
            store.get(99).await,
            Err(StoreError::NotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = setup_store().await;
        let AddOutcome::Stored(key) = store.add(event_at("a", 0)).await.unwrap() else {
            panic!("event should be stored");
        };

        store.delete(key).await.unwrap();
        store.delete(key).await.unwrap();
        store.delete(12345).await.unwrap();
        store.delete_keys(&[key, 777]).await.unwrap();

        assert!(store.get_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keys_are_never_reused() {
        let store = setup_store().await;
        let first = store.add(event_at("a", 0)).await.unwrap();
        let AddOutcome::Stored(first) = first else {
            panic!("event should be stored");
        };
        store.delete(first).await.unwrap();

        let AddOutcome::Stored(second) = store.add(event_at("b", 0)).await.unwrap() else {
            panic!("event should be stored");
        };
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_burst_stores_five_plus_alert() {
        let store = setup_store().await;
        let mut outcomes = Vec::new();
        for i in 0..7 {
            outcomes.push(store.add(event_at("systemError", i)).await.unwrap());
        }

        let suppressed = outcomes
            .iter()
            .filter(|o| **o == AddOutcome::Suppressed)
            .count();
        assert_eq!(suppressed, 2);

        let events = stored_events(&store).await;
        assert_eq!(events.len(), 6);
        let alerts: Vec<_> = events
            .iter()
            .filter(|e| e.event_type() == RATE_LIMIT_EVENT_TYPE)
            .collect();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].description.details["type"], "systemError");
    }

    #[tokio::test]
    async fn test_hourly_events_are_not_limited() {
        let store = setup_store().await;
        for i in 0..7 {
            let outcome = store.add(event_at("systemError", i * 3600)).await.unwrap();
            assert!(matches!(outcome, AddOutcome::Stored(_)));
        }

        let events = stored_events(&store).await;
        assert_eq!(events.len(), 7);
        assert!(events.iter().all(|e| e.event_type() == "systemError"));
    }

    #[tokio::test]
    async fn test_burst_recovers_after_gap() {
        let store = setup_store().await;

        // Ten events a minute apart, a gap longer than the window, then five more.
        let mut times: Vec<i64> = (0..10).map(|i| i * 60).collect();
        let resume = times[9] + 10 * 60;
        times.extend((0..5).map(|i| resume + i * 60));

        for t in &times {
            store.add(event_at("systemError", *t)).await.unwrap();
        }

        let events = stored_events(&store).await;
        let originals = events
            .iter()
            .filter(|e| e.event_type() == "systemError")
            .count();
        let alerts = events
            .iter()
            .filter(|e| e.event_type() == RATE_LIMIT_EVENT_TYPE)
            .count();
        assert_eq!(originals, 10);
        assert_eq!(alerts, 1);
    }

    #[tokio::test]
    async fn test_long_burst_then_gap_stores_nine() {
        let store = setup_store().await;

        // Eleven events a minute apart, a gap longer than the window, then four more.
        let mut times: Vec<i64> = (0..11).map(|i| i * 60).collect();
        let resume = times[10] + 10 * 60;
        times.extend((0..4).map(|i| resume + i * 60));

        for t in &times {
            store.add(event_at("systemError", *t)).await.unwrap();
        }

        let events = stored_events(&store).await;
        let originals = events
            .iter()
            .filter(|e| e.event_type() == "systemError")
            .count();
        let alerts = events
            .iter()
            .filter(|e| e.event_type() == RATE_LIMIT_EVENT_TYPE)
            .count();
        assert_eq!(originals, 9);
        assert_eq!(alerts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_burst_stores_five_plus_alert() {
        let store = setup_store().await;

        let mut tasks = Vec::new();
        for _ in 0..40 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.add(event_at("motion", 1_000)).await
            }));
        }

        let mut suppressed = 0;
        for task in tasks {
            if let AddOutcome::Suppressed = task.await.unwrap().unwrap() {
                suppressed += 1;
            }
        }
        assert_eq!(suppressed, 35);

        let events = stored_events(&store).await;
        assert_eq!(events.len(), 6);
        let alerts = events
            .iter()
            .filter(|e| e.event_type() == RATE_LIMIT_EVENT_TYPE)
            .count();
        assert_eq!(alerts, 1);
    }

    #[tokio::test]
    async fn test_queue_legacy_records_are_readable() {
        let store = setup_store().await;
        let description =
            br#"{"description":{"type":"audioBait","details":{"file":"a.wav"}}}"#.to_vec();

        store
            .queue_legacy(description.clone(), Utc.timestamp_opt(10, 0).unwrap())
            .await
            .unwrap();
        store
            .queue_legacy(description, Utc.timestamp_opt(20, 0).unwrap())
            .await
            .unwrap();

        let records = store.legacy_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].description.event_type, "audioBait");
        assert_eq!(records[0].timestamps.len(), 2);
        assert!(store.get_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_legacy_rejects_bad_description() {
        let store = setup_store().await;
        let result = store
            .queue_legacy(b"{not json".to_vec(), Utc.timestamp_opt(10, 0).unwrap())
            .await;
        assert!(matches!(result, Err(StoreError::Format(_))));
    }

    #[tokio::test]
    async fn test_migration_on_shared_backend() {
        let backend: Arc<dyn KvBackend> = Arc::new(DuckDbBackend::in_memory().unwrap());
        backend.create_regions().unwrap();

        let key_a = br#"{"description":{"type":"a","details":{"x":1}}}"#;
        let key_b = br#"{"description":{"type":"b","details":null}}"#;
        backend
            .update(&mut |txn| {
                txn.put(Region::Legacy, key_a, &legacy::encode_timestamps(&[1, 2, 3]))?;
                txn.put(Region::Legacy, key_b, &legacy::encode_timestamps(&[4]))
            })
            .unwrap();

        let store = EventStore::with_backend(Arc::clone(&backend), RateLimiter::default())
            .await
            .unwrap();
        assert_eq!(
            store.migration_report(),
            MigrationReport {
                records: 2,
                events: 4
            }
        );
        assert!(store.legacy_records().await.unwrap().is_empty());

        let events = stored_events(&store).await;
        assert_eq!(events.len(), 4);
        assert_eq!(events.iter().filter(|e| e.event_type() == "a").count(), 3);
        let b = events.iter().find(|e| e.event_type() == "b").unwrap();
        assert!(b.description.details.is_empty());
        assert_eq!(b.timestamp.timestamp_nanos_opt(), Some(4));

        let reopened = EventStore::with_backend(backend, RateLimiter::default())
            .await
            .unwrap();
        assert_eq!(reopened.migration_report(), MigrationReport::default());
        assert_eq!(reopened.get_keys().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_corrupt_legacy_record_aborts_open() {
        let backend: Arc<dyn KvBackend> = Arc::new(DuckDbBackend::in_memory().unwrap());
        backend.create_regions().unwrap();

        let good = br#"{"description":{"type":"a","details":{}}}"#;
        let bad = br#"{"description":{"type":"b","details":{}}}"#;
        let mut corrupt = legacy::encode_timestamps(&[1]);
        corrupt[0] = 3;
        backend
            .update(&mut |txn| {
                txn.put(Region::Legacy, good, &legacy::encode_timestamps(&[1]))?;
                txn.put(Region::Legacy, bad, &corrupt)
            })
            .unwrap();

        let result = EventStore::with_backend(Arc::clone(&backend), RateLimiter::default()).await;
        assert!(matches!(
            result,
            Err(StoreError::Format(legacy::FormatError::UnsupportedVersion(3)))
        ));

        let mut events = Vec::new();
        backend
            .view(&mut |txn| {
                events = txn.keys(Region::Events)?;
                Ok(())
            })
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let store = setup_store().await;
        store.close().await.unwrap();
        assert!(matches!(store.get_keys().await, Err(StoreError::Closed)));
    }
}
