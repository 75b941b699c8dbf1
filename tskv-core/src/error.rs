//! Error types for TSKV

use thiserror::Error;

/// Result type alias for TSKV operations
pub type Result<T> = std::result::Result<T, TsError>;

/// TSKV error types
#[derive(Error, Debug)]
pub enum TsError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Request rejected before touching storage
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage layer failure (constraint violation other than the expected races, lost state)
    #[error("Storage error: {0}")]
    Storage(String),

    /// A row was written into a bucket that was never created
    #[error("Partition missing for bucket starting at {0}")]
    PartitionMissing(i64),

    /// Operation did not complete within the configured timeout
    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    /// The historical row was written but the latest-value update failed
    #[error("Latest value update failed after historical write: {0}")]
    LatestValue(Box<TsError>),

    /// Worker task panicked or was cancelled
    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TsError {
    /// Check if error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(self, TsError::Io(_) | TsError::Timeout(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TsError::Corruption(_) | TsError::ChecksumMismatch { .. }
        )
    }

    /// Check if the request itself was rejected
    pub fn is_validation(&self) -> bool {
        matches!(self, TsError::Validation(_))
    }

    /// Build a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        TsError::Validation(message.into())
    }
}

impl From<bincode::Error> for TsError {
    fn from(e: bincode::Error) -> Self {
        TsError::InvalidFormat(e.to_string())
    }
}
