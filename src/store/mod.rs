pub mod duckdb;
pub mod event;
pub mod legacy;
pub mod queue;
pub mod rate_limit;
pub mod traits;

pub use self::duckdb::DuckDbBackend;
pub use event::{Event, EventDescription};
pub use legacy::{FormatError, LegacyRecord};
pub use queue::{AddOutcome, EventStore, MigrationReport};
pub use rate_limit::{EnvironmentSource, FileEnvironment, RateLimiter, StaticEnvironment, Verdict};
pub use traits::{KvBackend, KvTxn, Region, StoreError};
