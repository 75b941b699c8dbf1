//! TSKV Core - Partitioned Key/Value Telemetry Storage Engine
//!
//! Stores timestamped samples of named keys for many entities and answers
//! range, aggregate and latest-value queries over them.
//!
//! # Architecture
//!
//! - **Key dictionary**: key names are stored as compact integer ids
//! - **Partition catalog**: rows land in time buckets created on demand
//! - **Row store**: upserts keyed by `(entity_id, key_id, ts)`
//! - **Latest-value table**: the current sample per entity and key
//! - **WAL**: every mutation is logged before it becomes visible
//! - **Worker pool**: storage calls run off the caller's task with a deadline

pub mod dictionary;
pub mod partition;
pub mod pool;
pub mod query;
pub mod storage;
pub mod wal;

mod error;
mod types;

pub use error::{Result, TsError};
pub use types::*;

pub use dictionary::KeyDictionary;
pub use partition::{PartitionBounds, PartitionCatalog, PartitionGranularity};
pub use query::{Aggregation, DeleteTsKvQuery, OrderBy, ReadTsKvQuery};
pub use storage::{StorageConfig, TimeseriesEngine};

/// TSKV version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// WAL segment size (16MB)
    pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

    /// Concurrent storage operations
    pub const DEFAULT_WORKER_THREADS: usize = 16;

    /// Deadline for one storage operation
    pub const OPERATION_TIMEOUT_MS: u64 = 10_000;

    /// Longest key name in bytes
    pub const MAX_KEY_LENGTH: usize = 255;

    /// Dictionary inserts tried before giving up on a key
    pub const MAX_KEY_INSERT_ATTEMPTS: usize = 16;
}
