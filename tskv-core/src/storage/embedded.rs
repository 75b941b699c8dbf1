//! Embedded store - in-memory tables made durable by the WAL

use super::tables::{DictionaryTable, LatestTable, Partition};
use super::{
    KeyInsertOutcome, LatestRow, PartitionOutcome, RowVisitor, StorageBackend, StoreStats,
    StoredRow,
};
use crate::partition::PartitionBounds;
use crate::query::OrderBy;
use crate::wal::{WalConfig, WalEntry, WalReader, WalRecord, WalWriter};
use crate::{EntityId, KeyId, Result, Timestamp, TimeRange, TsError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Storage backend keeping every table in memory.
///
/// With a WAL attached, each mutation is logged before it is applied and
/// the log is replayed on open. Lock order is dictionary, partitions,
/// latest, then the WAL writer.
pub struct EmbeddedStore {
    wal: Option<WalWriter>,
    dictionary: RwLock<DictionaryTable>,
    partitions: RwLock<BTreeMap<Timestamp, Arc<Partition>>>,
    latest: RwLock<LatestTable>,
}

impl EmbeddedStore {
    /// Volatile store without a WAL
    pub fn in_memory() -> Self {
        Self {
            wal: None,
            dictionary: RwLock::new(DictionaryTable::default()),
            partitions: RwLock::new(BTreeMap::new()),
            latest: RwLock::new(LatestTable::default()),
        }
    }

    /// Open a durable store, replaying the WAL found in `wal_config.dir`
    pub fn open(wal_config: WalConfig) -> Result<Self> {
        let mut store = Self::in_memory();

        let entries = WalReader::new(wal_config.clone()).recover()?;
        let replayed = entries.len();
        for entry in entries {
            store.replay(entry.record()?)?;
        }
        if replayed > 0 {
            info!("Replayed {} WAL entries from {:?}", replayed, wal_config.dir);
        }

        store.wal = Some(WalWriter::new(wal_config)?);
        Ok(store)
    }

    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }

    /// Log `record` (when durable) and run `apply` in log order
    fn commit<T>(&self, record: WalRecord, apply: impl FnOnce() -> T) -> Result<T> {
        match &self.wal {
            Some(wal) => wal.append_with(&WalEntry::from_record(&record)?, apply),
            None => Ok(apply()),
        }
    }

    fn partition(&self, partition: Timestamp) -> Option<Arc<Partition>> {
        self.partitions.read().get(&partition).cloned()
    }

    fn replay(&mut self, record: WalRecord) -> Result<()> {
        match record {
            WalRecord::KeyInserted { key, key_id } => {
                self.dictionary.get_mut().insert(key, key_id);
            }
            WalRecord::PartitionCreated { start, end } => {
                self.partitions
                    .get_mut()
                    .entry(start)
                    .or_insert_with(|| Arc::new(Partition::new(PartitionBounds::new(start, end))));
            }
            WalRecord::PartitionDropped { start } => {
                self.partitions.get_mut().remove(&start);
            }
            WalRecord::RowUpserted { partition, row } => {
                let target = self.partitions.get_mut().get(&partition).cloned();
                match target {
                    Some(target) => target.upsert(row),
                    None => {
                        return Err(TsError::Corruption(format!(
                            "WAL row for missing partition {}",
                            partition
                        )))
                    }
                }
            }
            WalRecord::RowsDeleted {
                entity_id,
                key_id,
                start,
                end,
            } => {
                let range = TimeRange::new(start, end);
                for partition in self.partitions.get_mut().values() {
                    partition.delete_range(entity_id, key_id, range);
                }
            }
            WalRecord::ExpiredPurged { now } => {
                for partition in self.partitions.get_mut().values() {
                    partition.purge_expired(now);
                }
            }
            WalRecord::LatestUpserted { row } => {
                self.latest.get_mut().put(row);
            }
            WalRecord::LatestDeleted { entity_id, key_id } => {
                self.latest.get_mut().remove(entity_id, key_id);
            }
        }
        Ok(())
    }
}

impl StorageBackend for EmbeddedStore {
    fn find_key_id(&self, key: &str) -> Result<Option<KeyId>> {
        Ok(self.dictionary.read().id(key))
    }

    fn find_key_name(&self, key_id: KeyId) -> Result<Option<String>> {
        Ok(self.dictionary.read().name(key_id).map(str::to_string))
    }

    fn max_key_id(&self) -> Result<Option<KeyId>> {
        Ok(self.dictionary.read().max_id())
    }

    fn insert_key(&self, key: &str, key_id: KeyId) -> KeyInsertOutcome {
        let mut dictionary = self.dictionary.write();
        if dictionary.conflicts(key, key_id) {
            return KeyInsertOutcome::Conflict;
        }
        let record = WalRecord::KeyInserted {
            key: key.to_string(),
            key_id,
        };
        match self.commit(record, || dictionary.insert(key.to_string(), key_id)) {
            Ok(()) => KeyInsertOutcome::Inserted,
            Err(e) => KeyInsertOutcome::Failed(e),
        }
    }

    fn create_partition(&self, bounds: PartitionBounds) -> PartitionOutcome {
        let mut partitions = self.partitions.write();
        if partitions.contains_key(&bounds.start) {
            return PartitionOutcome::AlreadyExists;
        }
        let record = WalRecord::PartitionCreated {
            start: bounds.start,
            end: bounds.end,
        };
        let created = self.commit(record, || {
            partitions.insert(bounds.start, Arc::new(Partition::new(bounds)));
        });
        match created {
            Ok(()) => PartitionOutcome::Created,
            Err(e) => PartitionOutcome::Failed(e),
        }
    }

    fn list_partitions(&self) -> Result<Vec<PartitionBounds>> {
        Ok(self.partitions.read().values().map(|p| p.bounds()).collect())
    }

    fn partitions_overlapping(&self, range: TimeRange) -> Result<Vec<PartitionBounds>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        // Buckets are disjoint, so only starts before `range.end` can overlap
        Ok(self
            .partitions
            .read()
            .range(..range.end)
            .map(|(_, p)| p.bounds())
            .filter(|b| b.range().overlaps(&range))
            .collect())
    }

    fn drop_partition(&self, partition: Timestamp) -> Result<bool> {
        let mut partitions = self.partitions.write();
        if !partitions.contains_key(&partition) {
            return Ok(false);
        }
        self.commit(WalRecord::PartitionDropped { start: partition }, || {
            partitions.remove(&partition);
        })?;
        Ok(true)
    }

    fn upsert_row(&self, partition: Timestamp, row: StoredRow) -> Result<()> {
        let partitions = self.partitions.read();
        let target = partitions
            .get(&partition)
            .ok_or(TsError::PartitionMissing(partition))?;
        if !target.bounds().contains(row.ts) {
            return Err(TsError::Internal(format!(
                "ts {} does not belong to partition {}",
                row.ts,
                target.bounds()
            )));
        }
        let record = WalRecord::RowUpserted {
            partition,
            row: row.clone(),
        };
        self.commit(record, || target.upsert(row))
    }

    fn scan(
        &self,
        partition: Timestamp,
        entity_id: EntityId,
        key_id: KeyId,
        range: TimeRange,
        order: OrderBy,
        now: Timestamp,
        visit: &mut RowVisitor<'_>,
    ) -> Result<()> {
        // A bucket dropped by cleanup mid-query simply has no rows left
        if let Some(target) = self.partition(partition) {
            target.scan(entity_id, key_id, range, order, now, visit);
        }
        Ok(())
    }

    fn delete_rows(&self, entity_id: EntityId, key_id: KeyId, range: TimeRange) -> Result<usize> {
        let partitions = self.partitions.read();
        let record = WalRecord::RowsDeleted {
            entity_id,
            key_id,
            start: range.start,
            end: range.end,
        };
        self.commit(record, || {
            partitions
                .values()
                .filter(|p| p.bounds().range().overlaps(&range))
                .map(|p| p.delete_range(entity_id, key_id, range))
                .sum::<usize>()
        })
    }

    fn delete_expired(&self, now: Timestamp) -> Result<usize> {
        let partitions = self.partitions.read();
        self.commit(WalRecord::ExpiredPurged { now }, || {
            partitions.values().map(|p| p.purge_expired(now)).sum::<usize>()
        })
    }

    fn find_latest(&self, entity_id: EntityId, key_id: KeyId) -> Result<Option<LatestRow>> {
        Ok(self.latest.read().get(entity_id, key_id).cloned())
    }

    fn find_all_latest(&self, entity_id: EntityId) -> Result<Vec<LatestRow>> {
        Ok(self.latest.read().for_entity(entity_id).cloned().collect())
    }

    fn upsert_latest(&self, row: LatestRow) -> Result<bool> {
        let mut latest = self.latest.write();
        if !latest.accepts(&row) {
            return Ok(false);
        }
        let record = WalRecord::LatestUpserted { row: row.clone() };
        self.commit(record, || latest.put(row))?;
        Ok(true)
    }

    fn delete_latest_in(
        &self,
        entity_id: EntityId,
        key_id: KeyId,
        range: TimeRange,
    ) -> Result<Option<LatestRow>> {
        let mut latest = self.latest.write();
        let current = match latest.get(entity_id, key_id) {
            Some(row) if range.contains(row.ts) => row.clone(),
            _ => return Ok(None),
        };
        self.commit(WalRecord::LatestDeleted { entity_id, key_id }, || {
            latest.remove(entity_id, key_id);
            Some(current)
        })
    }

    fn checkpoint(&self) -> Result<()> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };

        // Write locks keep every mutator out while the snapshot is taken
        let dictionary = self.dictionary.write();
        let partitions = self.partitions.write();
        let latest = self.latest.write();

        let mut records = Vec::new();
        for (key, key_id) in dictionary.iter() {
            records.push(WalRecord::KeyInserted {
                key: key.to_string(),
                key_id,
            });
        }
        for partition in partitions.values() {
            let bounds = partition.bounds();
            records.push(WalRecord::PartitionCreated {
                start: bounds.start,
                end: bounds.end,
            });
            for row in partition.rows() {
                records.push(WalRecord::RowUpserted {
                    partition: bounds.start,
                    row,
                });
            }
        }
        for row in latest.iter() {
            records.push(WalRecord::LatestUpserted { row: row.clone() });
        }

        let entries = records
            .iter()
            .map(WalEntry::from_record)
            .collect::<Result<Vec<_>>>()?;
        let removed = wal.rewrite(&entries)?;
        info!(
            "Checkpointed {} records, removed {} WAL segments",
            entries.len(),
            removed
        );
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        let partitions = self.partitions.read();
        StoreStats {
            keys: self.dictionary.read().len(),
            partitions: partitions.len(),
            rows: partitions.values().map(|p| p.len()).sum(),
            latest: self.latest.read().len(),
        }
    }
}
