//! Storage - backend contract, embedded store and the timeseries engine

mod backend;
mod embedded;
mod engine;
mod tables;

pub use backend::{
    KeyInsertOutcome, LatestRow, PartitionOutcome, RowVisitor, StorageBackend, StoreStats,
    StoredRow,
};
pub use embedded::EmbeddedStore;
pub use engine::{CleanupStats, EngineStats, LatestRemoval, TimeseriesEngine};

use crate::partition::PartitionGranularity;
use crate::wal::WalConfig;
use crate::{Result, TsError};
use std::path::PathBuf;
use std::time::Duration;

/// Storage engine configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Data directory; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    /// WAL configuration, its `dir` is derived from `data_dir`
    pub wal: WalConfig,
    /// Width of the time buckets
    pub partitioning: PartitionGranularity,
    /// Maximum concurrent storage operations
    pub worker_threads: usize,
    /// Deadline for a single storage operation
    pub operation_timeout: Duration,
    /// Longest accepted key name in bytes
    pub max_key_length: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            wal: WalConfig::default(),
            partitioning: PartitionGranularity::default(),
            worker_threads: crate::config::DEFAULT_WORKER_THREADS,
            operation_timeout: Duration::from_millis(crate::config::OPERATION_TIMEOUT_MS),
            max_key_length: crate::config::MAX_KEY_LENGTH,
        }
    }
}

impl StorageConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Durable configuration rooted at `dir`
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let mut config = Self::default();
        config.wal.dir = dir.join("wal");
        config.data_dir = Some(dir);
        config
    }

    pub fn with_partitioning(mut self, partitioning: PartitionGranularity) -> Self {
        self.partitioning = partitioning;
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(TsError::Config("worker_threads must be positive".into()));
        }
        if self.operation_timeout.is_zero() {
            return Err(TsError::Config("operation_timeout must be positive".into()));
        }
        if self.max_key_length == 0 {
            return Err(TsError::Config("max_key_length must be positive".into()));
        }
        if self.wal.segment_size == 0 {
            return Err(TsError::Config("WAL segment_size must be positive".into()));
        }
        Ok(())
    }
}
