//! In-memory tables of the embedded store

use super::{LatestRow, RowVisitor, StoredRow};
use crate::partition::PartitionBounds;
use crate::query::OrderBy;
use crate::{EntityId, KeyId, Timestamp, TimeRange, TsValue};
use crossbeam_skiplist::SkipMap;
use std::collections::{BTreeMap, HashMap};

/// Dictionary table with unique name and unique id
#[derive(Debug, Default)]
pub(crate) struct DictionaryTable {
    by_name: HashMap<String, KeyId>,
    by_id: HashMap<KeyId, String>,
}

impl DictionaryTable {
    pub fn id(&self, key: &str) -> Option<KeyId> {
        self.by_name.get(key).copied()
    }

    pub fn name(&self, key_id: KeyId) -> Option<&str> {
        self.by_id.get(&key_id).map(String::as_str)
    }

    pub fn max_id(&self) -> Option<KeyId> {
        self.by_id.keys().max().copied()
    }

    /// Would inserting `(key, key_id)` violate either unique column
    pub fn conflicts(&self, key: &str, key_id: KeyId) -> bool {
        self.by_name.contains_key(key) || self.by_id.contains_key(&key_id)
    }

    pub fn insert(&mut self, key: String, key_id: KeyId) {
        self.by_id.insert(key_id, key.clone());
        self.by_name.insert(key, key_id);
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, KeyId)> {
        self.by_name.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

type RowKey = (EntityId, KeyId, Timestamp);

#[derive(Debug, Clone)]
struct RowValue {
    value: TsValue,
    expires_at: Option<Timestamp>,
}

impl RowValue {
    fn is_live(&self, now: Timestamp) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// One time bucket of historical rows, ordered by identity
pub(crate) struct Partition {
    bounds: PartitionBounds,
    rows: SkipMap<RowKey, RowValue>,
}

impl Partition {
    pub fn new(bounds: PartitionBounds) -> Self {
        Self {
            bounds,
            rows: SkipMap::new(),
        }
    }

    pub fn bounds(&self) -> PartitionBounds {
        self.bounds
    }

    pub fn upsert(&self, row: StoredRow) {
        self.rows.insert(
            (row.entity_id, row.key_id, row.ts),
            RowValue {
                value: row.value,
                expires_at: row.expires_at,
            },
        );
    }

    pub fn scan(
        &self,
        entity_id: EntityId,
        key_id: KeyId,
        range: TimeRange,
        order: OrderBy,
        now: Timestamp,
        visit: &mut RowVisitor<'_>,
    ) {
        if range.is_empty() {
            return;
        }
        let rows = self
            .rows
            .range((entity_id, key_id, range.start)..(entity_id, key_id, range.end));
        let mut emit = |entry: crossbeam_skiplist::map::Entry<'_, RowKey, RowValue>| {
            let value = entry.value();
            if value.is_live(now) {
                visit(entry.key().2, &value.value)
            } else {
                true
            }
        };
        match order {
            OrderBy::Asc => {
                for entry in rows {
                    if !emit(entry) {
                        break;
                    }
                }
            }
            OrderBy::Desc => {
                for entry in rows.rev() {
                    if !emit(entry) {
                        break;
                    }
                }
            }
        }
    }

    pub fn delete_range(&self, entity_id: EntityId, key_id: KeyId, range: TimeRange) -> usize {
        if range.is_empty() {
            return 0;
        }
        let keys: Vec<RowKey> = self
            .rows
            .range((entity_id, key_id, range.start)..(entity_id, key_id, range.end))
            .map(|entry| *entry.key())
            .collect();
        keys.iter().filter(|key| self.rows.remove(key).is_some()).count()
    }

    pub fn purge_expired(&self, now: Timestamp) -> usize {
        let expired: Vec<RowKey> = self
            .rows
            .iter()
            .filter(|entry| !entry.value().is_live(now))
            .map(|entry| *entry.key())
            .collect();
        expired.iter().filter(|key| self.rows.remove(key).is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Copy of every row, used for checkpoints
    pub fn rows(&self) -> Vec<StoredRow> {
        self.rows
            .iter()
            .map(|entry| {
                let (entity_id, key_id, ts) = *entry.key();
                StoredRow {
                    entity_id,
                    key_id,
                    ts,
                    value: entry.value().value.clone(),
                    expires_at: entry.value().expires_at,
                }
            })
            .collect()
    }
}

/// Latest-value table, one row per `(entity_id, key_id)`
#[derive(Debug, Default)]
pub(crate) struct LatestTable {
    rows: BTreeMap<(EntityId, KeyId), LatestRow>,
}

impl LatestTable {
    pub fn get(&self, entity_id: EntityId, key_id: KeyId) -> Option<&LatestRow> {
        self.rows.get(&(entity_id, key_id))
    }

    pub fn for_entity(&self, entity_id: EntityId) -> impl Iterator<Item = &LatestRow> {
        self.rows
            .range((entity_id, KeyId::MIN)..=(entity_id, KeyId::MAX))
            .map(|(_, row)| row)
    }

    /// Newer or equal timestamps replace the current row
    pub fn accepts(&self, row: &LatestRow) -> bool {
        self.get(row.entity_id, row.key_id)
            .map_or(true, |current| row.ts >= current.ts)
    }

    pub fn put(&mut self, row: LatestRow) {
        self.rows.insert((row.entity_id, row.key_id), row);
    }

    pub fn remove(&mut self, entity_id: EntityId, key_id: KeyId) -> bool {
        self.rows.remove(&(entity_id, key_id)).is_some()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LatestRow> {
        self.rows.values()
    }
}
