use crate::store::legacy::FormatError;
use thiserror::Error;

/// Logical regions of the key-value file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    /// Description-keyed packed timestamps written by the old `Queue` call.
    Legacy,
    /// Sequence-keyed JSON events.
    Events,
}

impl Region {
    pub const ALL: [Region; 2] = [Region::Legacy, Region::Events];

    pub fn name(self) -> &'static str {
        match self {
            Region::Legacy => "legacy_events",
            Region::Events => "events",
        }
    }
}

/// Operations available inside a single transaction.
pub trait KvTxn {
    fn get(&self, region: Region, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&mut self, region: Region, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&mut self, region: Region, key: &[u8]) -> Result<(), StoreError>;
    fn scan(&self, region: Region) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
    fn keys(&self, region: Region) -> Result<Vec<Vec<u8>>, StoreError>;
    /// Returns the next value of the region's persisted counter. Values are
    /// never handed out twice, even if the record using them is deleted.
    fn next_sequence(&mut self, region: Region) -> Result<u64, StoreError>;
}

/// Minimal transactional key-value engine the event store runs on.
///
/// `view` and `update` run the closure inside one transaction; `update`
/// commits only if the closure returns `Ok`.
pub trait KvBackend: Send + Sync + 'static {
    fn create_regions(&self) -> Result<(), StoreError>;

    fn view(
        &self,
        f: &mut dyn FnMut(&dyn KvTxn) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;

    fn update(
        &self,
        f: &mut dyn FnMut(&mut dyn KvTxn) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;

    /// Releases the underlying handle once in-flight transactions finish.
    fn close(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("no event found for key {0}")]
    NotFound(u64),

    #[error("legacy record format error: {0}")]
    Format(#[from] FormatError),

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("event store is closed")]
    Closed,
}

impl From<duckdb::Error> for StoreError {
    fn from(e: duckdb::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Storage(format!("task join error: {}", e))
    }
}
