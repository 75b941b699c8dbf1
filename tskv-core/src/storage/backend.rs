//! Storage backend contract
//!
//! The engine reaches persisted state only through [`StorageBackend`]. All
//! methods are blocking and are called from the worker pool.

use crate::partition::PartitionBounds;
use crate::query::OrderBy;
use crate::{EntityId, KeyId, Result, Timestamp, TimeRange, TsError, TsValue};
use serde::{Deserialize, Serialize};

/// Result of inserting a dictionary row
#[derive(Debug)]
pub enum KeyInsertOutcome {
    Inserted,
    /// The name or the id is already taken
    Conflict,
    Failed(TsError),
}

/// Result of creating a partition bucket
#[derive(Debug)]
pub enum PartitionOutcome {
    Created,
    AlreadyExists,
    Failed(TsError),
}

/// A historical row, identified by `(entity_id, key_id, ts)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub entity_id: EntityId,
    pub key_id: KeyId,
    pub ts: Timestamp,
    pub value: TsValue,
    /// Wall clock millis after which the row is invisible
    pub expires_at: Option<Timestamp>,
}

impl StoredRow {
    pub fn is_live(&self, now: Timestamp) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// The current value of one `(entity_id, key_id)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestRow {
    pub entity_id: EntityId,
    pub key_id: KeyId,
    pub ts: Timestamp,
    pub value: TsValue,
}

/// Row visitor; return `false` to stop the scan
pub type RowVisitor<'a> = dyn FnMut(Timestamp, &TsValue) -> bool + 'a;

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub keys: usize,
    pub partitions: usize,
    pub rows: usize,
    pub latest: usize,
}

pub trait StorageBackend: Send + Sync + 'static {
    // Dictionary table

    fn find_key_id(&self, key: &str) -> Result<Option<KeyId>>;

    fn find_key_name(&self, key_id: KeyId) -> Result<Option<String>>;

    fn max_key_id(&self) -> Result<Option<KeyId>>;

    /// Insert `(key, key_id)`; both columns are unique
    fn insert_key(&self, key: &str, key_id: KeyId) -> KeyInsertOutcome;

    // Partition catalog

    fn create_partition(&self, bounds: PartitionBounds) -> PartitionOutcome;

    /// All partitions, ordered by start
    fn list_partitions(&self) -> Result<Vec<PartitionBounds>>;

    /// Partitions overlapping `range`, ordered by start
    fn partitions_overlapping(&self, range: TimeRange) -> Result<Vec<PartitionBounds>> {
        Ok(self
            .list_partitions()?
            .into_iter()
            .filter(|p| p.range().overlaps(&range))
            .collect())
    }

    /// Remove a bucket and every row in it
    fn drop_partition(&self, partition: Timestamp) -> Result<bool>;

    // Row tables

    /// Insert or replace the row at its identity. Fails with
    /// [`TsError::PartitionMissing`] when the bucket was never created.
    fn upsert_row(&self, partition: Timestamp, row: StoredRow) -> Result<()>;

    /// Visit live rows of one key inside one partition in `order`
    fn scan(
        &self,
        partition: Timestamp,
        entity_id: EntityId,
        key_id: KeyId,
        range: TimeRange,
        order: OrderBy,
        now: Timestamp,
        visit: &mut RowVisitor<'_>,
    ) -> Result<()>;

    /// Delete rows of one key in `range` across all partitions
    fn delete_rows(&self, entity_id: EntityId, key_id: KeyId, range: TimeRange) -> Result<usize>;

    /// Delete every row whose TTL ran out at `now`
    fn delete_expired(&self, now: Timestamp) -> Result<usize>;

    // Latest-value table

    fn find_latest(&self, entity_id: EntityId, key_id: KeyId) -> Result<Option<LatestRow>>;

    fn find_all_latest(&self, entity_id: EntityId) -> Result<Vec<LatestRow>>;

    /// Store `row` unless a newer latest value exists. Equal timestamps
    /// replace. Returns whether the row was stored.
    fn upsert_latest(&self, row: LatestRow) -> Result<bool>;

    /// Remove the latest value only while its timestamp lies in `range`.
    /// The check and the removal are atomic. Returns the removed row.
    fn delete_latest_in(
        &self,
        entity_id: EntityId,
        key_id: KeyId,
        range: TimeRange,
    ) -> Result<Option<LatestRow>>;

    // Maintenance

    /// Compact persisted state; a no-op for volatile stores
    fn checkpoint(&self) -> Result<()>;

    fn stats(&self) -> StoreStats;
}
