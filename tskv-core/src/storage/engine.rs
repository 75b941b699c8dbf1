//! Timeseries engine - the write, read, aggregate and delete paths
//!
//! The engine owns the key dictionary, the partition catalog and the
//! worker pool, and reaches the store only through [`StorageBackend`].
//! Every public operation is async and runs its storage calls on the
//! pool, so callers never block on I/O.

use super::{LatestRow, StorageBackend, StorageConfig, StoreStats, StoredRow};
use super::EmbeddedStore;
use crate::dictionary::KeyDictionary;
use crate::partition::{PartitionBounds, PartitionCatalog};
use crate::pool::WorkerPool;
use crate::query::aggregates::merge_domain_results;
use crate::query::{
    Accumulator, Aggregation, DeleteTsKvQuery, NumericAccumulator, OrderBy, ReadTsKvQuery,
    SlicePlan, StringAccumulator, ValueDomain,
};
use crate::wal::WalConfig;
use crate::{
    now_millis, EntityId, KeyId, Result, TenantId, Timestamp, TimeRange, TsError, TsKvEntry,
    TsValue,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

/// Engine statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub store: StoreStats,
    pub cached_keys: usize,
    pub known_partitions: usize,
    pub workers: usize,
}

/// What a cleanup pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub expired_rows: usize,
    pub dropped_partitions: usize,
}

/// Outcome of a latest-value removal
#[derive(Debug, Clone, PartialEq)]
pub struct LatestRemoval {
    pub key: String,
    /// The latest entry was inside the range and got removed
    pub removed: bool,
    /// Newest remaining sample stored as the new latest value
    pub replacement: Option<TsKvEntry>,
}

struct EngineInner {
    config: StorageConfig,
    backend: Arc<dyn StorageBackend>,
    dictionary: KeyDictionary,
    partitions: PartitionCatalog,
    pool: WorkerPool,
}

/// Key/value timeseries engine. Cheap to clone.
#[derive(Clone)]
pub struct TimeseriesEngine {
    inner: Arc<EngineInner>,
}

impl TimeseriesEngine {
    /// Open an engine over the embedded store described by `config`
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;

        let backend: Arc<dyn StorageBackend> = match &config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let wal_config = WalConfig {
                    dir: dir.join("wal"),
                    ..config.wal.clone()
                };
                Arc::new(EmbeddedStore::open(wal_config)?)
            }
            None => Arc::new(EmbeddedStore::in_memory()),
        };

        Self::with_backend(config, backend)
    }

    /// Open an engine over any backend
    pub fn with_backend(config: StorageConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        config.validate()?;

        let dictionary = KeyDictionary::open(backend.clone(), config.max_key_length)?;
        let partitions = PartitionCatalog::new(config.partitioning, backend.clone());
        let known = partitions.warm()?;
        let pool = WorkerPool::new(config.worker_threads, config.operation_timeout)?;

        info!(
            "Opened timeseries engine: {} partitions, {:?} partitioning, {} workers",
            known, config.partitioning, config.worker_threads
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                backend,
                dictionary,
                partitions,
                pool,
            }),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    /// Run `job` against the engine state on the worker pool
    async fn run<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&EngineInner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        self.inner.pool.run(move || job(&inner)).await
    }

    // ---- dictionary and catalog ----

    /// Id of `key`, created on first use
    pub async fn resolve_or_create(&self, key: &str) -> Result<KeyId> {
        let key = key.to_string();
        self.run(move |inner| inner.dictionary.resolve_or_create(&key))
            .await
    }

    /// Id of `key` if it was ever written
    async fn resolve(&self, key: &str) -> Result<Option<KeyId>> {
        let key = key.to_string();
        self.run(move |inner| inner.dictionary.resolve(&key)).await
    }

    /// Make sure the partition holding `ts` exists
    pub async fn ensure_partition(&self, ts: Timestamp) -> Result<PartitionBounds> {
        self.run(move |inner| inner.partitions.ensure_partition(ts))
            .await
    }

    // ---- write path ----

    /// Store one sample without expiry
    pub async fn write(
        &self,
        entity_id: EntityId,
        key: &str,
        ts: Timestamp,
        value: TsValue,
    ) -> Result<()> {
        self.write_entry(entity_id, TsKvEntry::new(key, ts, value), 0)
            .await
    }

    /// Store one sample for a tenant. `ttl_secs > 0` makes the row expire.
    pub async fn save(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        entry: TsKvEntry,
        ttl_secs: i64,
    ) -> Result<()> {
        debug!("Saving {} for {} (tenant {})", entry, entity_id, tenant_id);
        self.write_entry(entity_id, entry, ttl_secs).await
    }

    async fn write_entry(&self, entity_id: EntityId, entry: TsKvEntry, ttl_secs: i64) -> Result<()> {
        let expires_at = (ttl_secs > 0)
            .then(|| now_millis().saturating_add(ttl_secs.saturating_mul(1000)));
        let TsKvEntry { key, ts, value } = entry;
        // Reject timestamps no partition can hold before touching storage
        self.inner.partitions.granularity().bounds_for(ts)?;

        // History first; the latest value only follows a stored row
        let latest_value = value.clone();
        let key_id = self
            .run(move |inner| {
                let key_id = inner.dictionary.resolve_or_create(&key)?;
                let bounds = inner.partitions.ensure_partition(ts)?;
                let row = StoredRow {
                    entity_id,
                    key_id,
                    ts,
                    value,
                    expires_at,
                };
                match inner.backend.upsert_row(bounds.key(), row) {
                    Ok(()) => Ok(key_id),
                    Err(TsError::PartitionMissing(partition)) => {
                        // The bucket vanished under a cached entry; the next write re-creates it
                        inner.partitions.forget(partition);
                        Err(TsError::PartitionMissing(partition))
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;

        let latest = LatestRow {
            entity_id,
            key_id,
            ts,
            value: latest_value,
        };
        self.run(move |inner| inner.backend.upsert_latest(latest))
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!(
                    "Latest value update failed for {} key {}: {}",
                    entity_id, key_id, e
                );
                TsError::LatestValue(Box::new(e))
            })
    }

    /// Update only the latest value, unless a newer one is stored
    pub async fn save_latest(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        entry: TsKvEntry,
    ) -> Result<()> {
        debug!("Saving latest {} for {} (tenant {})", entry, entity_id, tenant_id);
        self.run(move |inner| {
            let key_id = inner.dictionary.resolve_or_create(&entry.key)?;
            let stored = inner.backend.upsert_latest(LatestRow {
                entity_id,
                key_id,
                ts: entry.ts,
                value: entry.value,
            })?;
            if !stored {
                debug!("Kept newer latest value for {} key {}", entity_id, entry.key);
            }
            Ok(())
        })
        .await
    }

    // ---- read path ----

    /// Run several range reads; results come back in query order
    pub async fn find_all(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        queries: Vec<ReadTsKvQuery>,
    ) -> Result<Vec<TsKvEntry>> {
        for query in &queries {
            query.validate()?;
            self.inner.dictionary.validate_key(&query.key)?;
        }
        debug!(
            "Running {} queries for {} (tenant {})",
            queries.len(),
            entity_id,
            tenant_id
        );

        let mut tasks = JoinSet::new();
        for (index, query) in queries.into_iter().enumerate() {
            let engine = self.clone();
            tasks.spawn(async move {
                engine
                    .read_query(entity_id, query)
                    .await
                    .map(|rows| (index, rows))
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.map_err(join_error)??);
        }
        results.sort_by_key(|(index, _)| *index);
        Ok(results.into_iter().flat_map(|(_, rows)| rows).collect())
    }

    async fn read_query(&self, entity_id: EntityId, query: ReadTsKvQuery) -> Result<Vec<TsKvEntry>> {
        if query.aggregation == Aggregation::None {
            return self
                .find_all_with_limit(entity_id, &query.key, query.range(), query.limit, query.order)
                .await;
        }

        let Some(key_id) = self.resolve(&query.key).await? else {
            return Ok(Vec::new());
        };

        let slices = self
            .aggregate_slices(entity_id, key_id, query.slices(), query.aggregation)
            .await?;
        Ok(slices
            .into_iter()
            .map(|(slice, value)| TsKvEntry::new(query.key.clone(), slice.midpoint(), value))
            .collect())
    }

    /// Up to `limit` raw samples in `range`, ordered by timestamp
    pub async fn find_all_with_limit(
        &self,
        entity_id: EntityId,
        key: &str,
        range: TimeRange,
        limit: usize,
        order: OrderBy,
    ) -> Result<Vec<TsKvEntry>> {
        if limit == 0 || range.is_empty() {
            return Ok(Vec::new());
        }
        let Some(key_id) = self.resolve(key).await? else {
            return Ok(Vec::new());
        };

        let samples = self
            .run(move |inner| {
                let now = now_millis();
                let mut partitions = inner.backend.partitions_overlapping(range)?;
                if order == OrderBy::Desc {
                    partitions.reverse();
                }

                let mut samples = Vec::new();
                for bounds in partitions {
                    if samples.len() >= limit {
                        break;
                    }
                    inner
                        .backend
                        .scan(bounds.key(), entity_id, key_id, range, order, now, &mut |ts, value| {
                            samples.push((ts, value.clone()));
                            samples.len() < limit
                        })?;
                }
                Ok(samples)
            })
            .await?;

        Ok(samples
            .into_iter()
            .map(|(ts, value)| TsKvEntry::new(key, ts, value))
            .collect())
    }

    // ---- aggregation ----

    /// Aggregate `[start_ts, end_ts)` of one key into a single entry
    /// stamped with the window midpoint. `None` when no row matched.
    pub async fn aggregate(
        &self,
        entity_id: EntityId,
        key: &str,
        start_ts: Timestamp,
        end_ts: Timestamp,
        aggregation: Aggregation,
    ) -> Result<Option<TsKvEntry>> {
        if aggregation == Aggregation::None {
            return Err(TsError::validation("aggregate needs an aggregation function"));
        }
        let window = TimeRange::new(start_ts, end_ts);
        if window.is_empty() {
            return Err(TsError::validation(format!(
                "empty range [{}, {})",
                start_ts, end_ts
            )));
        }
        let Some(key_id) = self.resolve(key).await? else {
            return Ok(None);
        };

        let slices = self
            .aggregate_slices(entity_id, key_id, SlicePlan::whole(window), aggregation)
            .await?;
        Ok(slices
            .into_iter()
            .next()
            .map(|(_, value)| TsKvEntry::new(key, window.midpoint(), value)))
    }

    /// Aggregated value of every non-empty slice of `plan`, in slice order
    async fn aggregate_slices(
        &self,
        entity_id: EntityId,
        key_id: KeyId,
        plan: SlicePlan,
        aggregation: Aggregation,
    ) -> Result<Vec<(TimeRange, TsValue)>> {
        let window = plan.window();
        let partitions = self
            .run(move |inner| inner.backend.partitions_overlapping(window))
            .await?;
        if partitions.is_empty() {
            return Ok(Vec::new());
        }
        let now = now_millis();

        let mut values = BTreeMap::new();
        if aggregation.domains().contains(&ValueDomain::String) {
            let (mut strings, numbers) = tokio::try_join!(
                self.fan_out::<StringAccumulator>(entity_id, key_id, plan, &partitions, now),
                self.fan_out::<NumericAccumulator>(entity_id, key_id, plan, &partitions, now),
            )?;
            for (index, numeric) in numbers {
                let string = strings.remove(&index).and_then(|s| s.finish(aggregation));
                if let Some(value) = merge_domain_results(string, numeric.finish(aggregation)) {
                    values.insert(index, value);
                }
            }
            for (index, string) in strings {
                if let Some(value) = string.finish(aggregation) {
                    values.insert(index, value);
                }
            }
        } else {
            let numbers = self
                .fan_out::<NumericAccumulator>(entity_id, key_id, plan, &partitions, now)
                .await?;
            for (index, numeric) in numbers {
                if let Some(value) = numeric.finish(aggregation) {
                    values.insert(index, value);
                }
            }
        }

        Ok(values
            .into_iter()
            .map(|(index, value)| (plan.slice(index), value))
            .collect())
    }

    /// Scan each partition once into per-slice partials, then merge them.
    /// Only slices that received a row get an accumulator.
    async fn fan_out<A: Accumulator>(
        &self,
        entity_id: EntityId,
        key_id: KeyId,
        plan: SlicePlan,
        partitions: &[PartitionBounds],
        now: Timestamp,
    ) -> Result<BTreeMap<u64, A>> {
        let mut tasks = JoinSet::new();
        for bounds in partitions.iter().copied() {
            let engine = self.clone();
            tasks.spawn(async move {
                engine
                    .run(move |inner| {
                        let mut partials: BTreeMap<u64, A> = BTreeMap::new();
                        inner.backend.scan(
                            bounds.key(),
                            entity_id,
                            key_id,
                            plan.window(),
                            OrderBy::Asc,
                            now,
                            &mut |ts, value| {
                                if let Some(index) = plan.slice_of(ts) {
                                    partials.entry(index).or_default().add(value);
                                }
                                true
                            },
                        )?;
                        Ok(partials)
                    })
                    .await
            });
        }

        let mut total: BTreeMap<u64, A> = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            for (index, partial) in joined.map_err(join_error)?? {
                total.entry(index).or_default().merge(partial);
            }
        }
        Ok(total)
    }

    // ---- latest-value path ----

    pub async fn find_latest(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        key: &str,
    ) -> Result<Option<TsKvEntry>> {
        debug!("Finding latest {} for {} (tenant {})", key, entity_id, tenant_id);
        let Some(key_id) = self.resolve(key).await? else {
            return Ok(None);
        };
        let row = self
            .run(move |inner| inner.backend.find_latest(entity_id, key_id))
            .await?;
        Ok(row.map(|row| TsKvEntry::new(key, row.ts, row.value)))
    }

    /// Latest value of every key the entity has
    pub async fn find_all_latest(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<Vec<TsKvEntry>> {
        debug!("Finding all latest for {} (tenant {})", entity_id, tenant_id);
        self.run(move |inner| {
            let mut entries = Vec::new();
            for row in inner.backend.find_all_latest(entity_id)? {
                match inner.dictionary.key_name(row.key_id)? {
                    Some(key) => entries.push(TsKvEntry::new(key, row.ts, row.value)),
                    None => warn!("Skipping latest value with unknown key id {}", row.key_id),
                }
            }
            Ok(entries)
        })
        .await
    }

    // ---- delete path ----

    /// Delete history in the query range, then the latest value if asked
    pub async fn remove(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        query: DeleteTsKvQuery,
    ) -> Result<()> {
        query.validate()?;
        let Some(key_id) = self.resolve(&query.key).await? else {
            return Ok(());
        };

        let range = query.range();
        let deleted = self
            .run(move |inner| inner.backend.delete_rows(entity_id, key_id, range))
            .await?;
        debug!(
            "Removed {} rows of {} in {:?} for {} (tenant {})",
            deleted, query.key, range, entity_id, tenant_id
        );

        if query.delete_latest {
            self.remove_latest(tenant_id, entity_id, query).await?;
        }
        Ok(())
    }

    /// Remove the latest value when it falls in the query range, and
    /// optionally replace it with the newest remaining sample
    pub async fn remove_latest(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        query: DeleteTsKvQuery,
    ) -> Result<LatestRemoval> {
        query.validate()?;
        let mut removal = LatestRemoval {
            key: query.key.clone(),
            removed: false,
            replacement: None,
        };
        let Some(key_id) = self.resolve(&query.key).await? else {
            return Ok(removal);
        };

        let range = query.range();
        let rewrite = query.rewrite_latest_if_deleted;
        let outcome = self
            .run(move |inner| {
                if inner.backend.delete_latest_in(entity_id, key_id, range)?.is_none() {
                    return Ok((false, None));
                }
                if !rewrite {
                    return Ok((true, None));
                }

                let now = now_millis();
                let after = TimeRange::new(range.end, Timestamp::MAX);
                let before = TimeRange::new(Timestamp::MIN, range.start);
                let newest = match newest_sample(inner, entity_id, key_id, after, now)? {
                    Some(sample) => Some(sample),
                    None => newest_sample(inner, entity_id, key_id, before, now)?,
                };
                let Some((ts, value)) = newest else {
                    return Ok((true, None));
                };
                // A concurrent write may have stored a newer value meanwhile
                let stored = inner.backend.upsert_latest(LatestRow {
                    entity_id,
                    key_id,
                    ts,
                    value: value.clone(),
                })?;
                Ok((true, stored.then_some((ts, value))))
            })
            .await?;

        removal.removed = outcome.0;
        removal.replacement = outcome
            .1
            .map(|(ts, value)| TsKvEntry::new(query.key.clone(), ts, value));
        if removal.removed {
            debug!(
                "Removed latest {} for {} (tenant {}), replacement: {:?}",
                query.key, entity_id, tenant_id, removal.replacement
            );
        }
        Ok(removal)
    }

    // ---- maintenance ----

    /// Purge expired rows and, when `system_ttl_secs > 0`, drop partitions
    /// that ended before `now - system_ttl_secs`
    pub async fn cleanup(&self, system_ttl_secs: i64) -> Result<CleanupStats> {
        let stats = self
            .run(move |inner| {
                let now = now_millis();
                let mut stats = CleanupStats {
                    expired_rows: inner.backend.delete_expired(now)?,
                    dropped_partitions: 0,
                };
                if system_ttl_secs > 0 {
                    let cutoff = now.saturating_sub(system_ttl_secs.saturating_mul(1000));
                    for bounds in inner.backend.list_partitions()? {
                        if bounds.end > cutoff {
                            break;
                        }
                        if inner.backend.drop_partition(bounds.key())? {
                            inner.partitions.forget(bounds.key());
                            stats.dropped_partitions += 1;
                        }
                    }
                }
                Ok(stats)
            })
            .await?;

        info!(
            "Cleanup removed {} expired rows and {} partitions",
            stats.expired_rows, stats.dropped_partitions
        );
        Ok(stats)
    }

    /// Compact the write-ahead log into a snapshot
    pub async fn checkpoint(&self) -> Result<()> {
        self.run(|inner| inner.backend.checkpoint()).await
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            store: self.inner.backend.stats(),
            cached_keys: self.inner.dictionary.cached(),
            known_partitions: self.inner.partitions.known_count(),
            workers: self.inner.pool.size(),
        }
    }
}

/// Newest live sample of one key inside `range`
fn newest_sample(
    inner: &EngineInner,
    entity_id: EntityId,
    key_id: KeyId,
    range: TimeRange,
    now: Timestamp,
) -> Result<Option<(Timestamp, TsValue)>> {
    if range.is_empty() {
        return Ok(None);
    }
    let mut partitions = inner.backend.partitions_overlapping(range)?;
    partitions.reverse();

    let mut newest = None;
    for bounds in partitions {
        inner
            .backend
            .scan(bounds.key(), entity_id, key_id, range, OrderBy::Desc, now, &mut |ts, value| {
                newest = Some((ts, value.clone()));
                false
            })?;
        if newest.is_some() {
            break;
        }
    }
    Ok(newest)
}

fn join_error(e: JoinError) -> TsError {
    TsError::WorkerPool(format!("query task failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionGranularity;
    use crate::storage::{KeyInsertOutcome, PartitionOutcome, RowVisitor};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    const HOUR: i64 = 3_600_000;

    fn engine() -> TimeseriesEngine {
        TimeseriesEngine::open(
            StorageConfig::in_memory().with_partitioning(PartitionGranularity::Hours),
        )
        .unwrap()
    }

    fn tenant() -> TenantId {
        TenantId::sys()
    }

    async fn save(engine: &TimeseriesEngine, entity: EntityId, key: &str, ts: Timestamp, value: impl Into<TsValue>) {
        engine
            .save(tenant(), entity, TsKvEntry::new(key, ts, value), 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_temperature_scenario() {
        let engine = engine();
        let entity = Uuid::new_v4();
        save(&engine, entity, "temperature", 1000, 10.0).await;
        save(&engine, entity, "temperature", 2000, 20.0).await;
        save(&engine, entity, "temperature", 3000, 30.0).await;

        let avg = engine
            .aggregate(entity, "temperature", 0, 4000, Aggregation::Avg)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(avg.value, TsValue::Double(20.0));
        assert_eq!(avg.ts, 2000);

        let count = engine
            .aggregate(entity, "temperature", 0, 4000, Aggregation::Count)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count.value, TsValue::Long(3));

        let max = engine
            .aggregate(entity, "temperature", 0, 1500, Aggregation::Max)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(max.value, TsValue::Double(10.0));
    }

    #[tokio::test]
    async fn test_aggregation_across_partitions() {
        let engine = engine();
        let entity = Uuid::new_v4();
        for hour in 0..5 {
            save(&engine, entity, "load", hour * HOUR + 1, hour).await;
        }
        assert_eq!(engine.stats().store.partitions, 5);

        let sum = engine
            .aggregate(entity, "load", 0, 5 * HOUR, Aggregation::Sum)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sum.value, TsValue::Long(10));

        let min = engine
            .aggregate(entity, "load", HOUR, 5 * HOUR, Aggregation::Min)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(min.value, TsValue::Long(1));
    }

    #[tokio::test]
    async fn test_string_and_numeric_min_max() {
        let engine = engine();
        let entity = Uuid::new_v4();
        save(&engine, entity, "status", 1, "ok").await;
        save(&engine, entity, "status", 2, "alarm").await;
        save(&engine, entity, "status", 3, 42i64).await;
        save(&engine, entity, "status", 4, true).await;

        let max = engine
            .aggregate(entity, "status", 0, 10, Aggregation::Max)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(max.value, TsValue::String("ok".into()));

        let min = engine
            .aggregate(entity, "status", 0, 10, Aggregation::Min)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(min.value, TsValue::String("alarm".into()));

        // Strings and booleans are not counted
        let count = engine
            .aggregate(entity, "status", 0, 10, Aggregation::Count)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count.value, TsValue::Long(1));
    }

    #[tokio::test]
    async fn test_empty_window_and_unknown_key() {
        let engine = engine();
        let entity = Uuid::new_v4();
        save(&engine, entity, "temperature", 1000, 10.0).await;

        let empty = engine
            .aggregate(entity, "temperature", 5000, 6000, Aggregation::Count)
            .await
            .unwrap();
        assert!(empty.is_none());

        let unknown = engine
            .aggregate(entity, "never-written", 0, 6000, Aggregation::Avg)
            .await
            .unwrap();
        assert!(unknown.is_none());
        assert_eq!(engine.stats().store.keys, 1);

        let err = engine
            .aggregate(entity, "temperature", 0, 6000, Aggregation::None)
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_round_trip_and_upsert_law() {
        let engine = engine();
        let entity = Uuid::new_v4();
        save(&engine, entity, "mode", 100, "auto").await;
        save(&engine, entity, "mode", 100, "manual").await;

        let rows = engine
            .find_all(
                tenant(),
                entity,
                vec![ReadTsKvQuery::raw("mode", 0, 1000, 10, OrderBy::Asc)],
            )
            .await
            .unwrap();
        assert_eq!(rows, vec![TsKvEntry::new("mode", 100, "manual")]);
    }

    #[tokio::test]
    async fn test_find_all_limit_and_order() {
        let engine = engine();
        let entity = Uuid::new_v4();
        for hour in 0..4 {
            save(&engine, entity, "t", hour * HOUR, hour).await;
            save(&engine, entity, "t", hour * HOUR + 10, hour * 10).await;
        }

        let desc = engine
            .find_all_with_limit(entity, "t", TimeRange::new(0, 4 * HOUR), 3, OrderBy::Desc)
            .await
            .unwrap();
        let ts: Vec<_> = desc.iter().map(|e| e.ts).collect();
        assert_eq!(ts, vec![3 * HOUR + 10, 3 * HOUR, 2 * HOUR + 10]);

        let asc = engine
            .find_all_with_limit(entity, "t", TimeRange::new(0, 4 * HOUR), 3, OrderBy::Asc)
            .await
            .unwrap();
        let ts: Vec<_> = asc.iter().map(|e| e.ts).collect();
        assert_eq!(ts, vec![0, 10, HOUR]);
    }

    #[tokio::test]
    async fn test_find_all_mixed_queries_keep_order() {
        let engine = engine();
        let entity = Uuid::new_v4();
        for i in 0..6 {
            save(&engine, entity, "a", i * 100, i as f64).await;
        }
        save(&engine, entity, "b", 50, 7i64).await;

        let rows = engine
            .find_all(
                tenant(),
                entity,
                vec![
                    ReadTsKvQuery::aggregated("a", 0, 600, 200, Aggregation::Avg),
                    ReadTsKvQuery::raw("b", 0, 600, 5, OrderBy::Desc),
                    ReadTsKvQuery::aggregated("missing", 0, 600, 200, Aggregation::Sum),
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![
                TsKvEntry::new("a", 100, 0.5),
                TsKvEntry::new("a", 300, 2.5),
                TsKvEntry::new("a", 500, 4.5),
                TsKvEntry::new("b", 50, 7i64),
            ]
        );
    }

    #[tokio::test]
    async fn test_find_all_rejects_bad_query() {
        let engine = engine();
        let err = engine
            .find_all(
                tenant(),
                Uuid::new_v4(),
                vec![ReadTsKvQuery::raw("a", 10, 10, 5, OrderBy::Asc)],
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_latest_monotonicity() {
        let engine = engine();
        let entity = Uuid::new_v4();
        save(&engine, entity, "temperature", 100, 1.0).await;
        save(&engine, entity, "temperature", 50, 2.0).await;

        let latest = engine
            .find_latest(tenant(), entity, "temperature")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest, TsKvEntry::new("temperature", 100, 1.0));

        // Equal timestamps: last writer wins
        save(&engine, entity, "temperature", 100, 3.0).await;
        let latest = engine
            .find_latest(tenant(), entity, "temperature")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.value, TsValue::Double(3.0));
    }

    #[tokio::test]
    async fn test_save_latest_and_find_all_latest() {
        let engine = engine();
        let entity = Uuid::new_v4();
        engine
            .save_latest(tenant(), entity, TsKvEntry::new("a", 10, 1i64))
            .await
            .unwrap();
        engine
            .save_latest(tenant(), entity, TsKvEntry::new("a", 5, 2i64))
            .await
            .unwrap();
        engine
            .save_latest(tenant(), entity, TsKvEntry::new("b", 7, true))
            .await
            .unwrap();

        let mut all = engine.find_all_latest(tenant(), entity).await.unwrap();
        all.sort_by(|x, y| x.key.cmp(&y.key));
        assert_eq!(
            all,
            vec![TsKvEntry::new("a", 10, 1i64), TsKvEntry::new("b", 7, true)]
        );
        // Latest-only writes leave no history
        assert_eq!(engine.stats().store.rows, 0);
        assert!(engine
            .find_latest(tenant(), Uuid::new_v4(), "a")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_remove_recomputes_latest() {
        let engine = engine();
        let entity = Uuid::new_v4();
        save(&engine, entity, "t", 1000, 1i64).await;
        save(&engine, entity, "t", 2000, 2i64).await;
        save(&engine, entity, "t", 3000, 3i64).await;

        engine
            .remove(tenant(), entity, DeleteTsKvQuery::new("t", 2500, 4000))
            .await
            .unwrap();

        let latest = engine.find_latest(tenant(), entity, "t").await.unwrap();
        assert_eq!(latest, Some(TsKvEntry::new("t", 2000, 2i64)));
        let count = engine
            .aggregate(entity, "t", 0, 5000, Aggregation::Count)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count.value, TsValue::Long(2));
    }

    #[tokio::test]
    async fn test_remove_latest_outside_range_and_without_rewrite() {
        let engine = engine();
        let entity = Uuid::new_v4();
        save(&engine, entity, "t", 1000, 1i64).await;
        save(&engine, entity, "t", 2000, 2i64).await;

        let untouched = engine
            .remove_latest(tenant(), entity, DeleteTsKvQuery::new("t", 0, 1500))
            .await
            .unwrap();
        assert!(!untouched.removed);

        let cleared = engine
            .remove_latest(
                tenant(),
                entity,
                DeleteTsKvQuery::new("t", 1500, 2500).with_rewrite_latest(false),
            )
            .await
            .unwrap();
        assert!(cleared.removed);
        assert!(cleared.replacement.is_none());
        assert!(engine.find_latest(tenant(), entity, "t").await.unwrap().is_none());

        // Samples inside the range never become the replacement
        save(&engine, entity, "t", 2000, 2i64).await;
        let rewritten = engine
            .remove_latest(tenant(), entity, DeleteTsKvQuery::new("t", 1500, 2500))
            .await
            .unwrap();
        assert_eq!(rewritten.replacement, Some(TsKvEntry::new("t", 1000, 1i64)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_remove_latest_keeps_newer_concurrent_write() {
        let engine = engine();
        for _ in 0..32 {
            let entity = Uuid::new_v4();
            save(&engine, entity, "t", 100, 1i64).await;

            let remover = engine.clone();
            let removal = tokio::spawn(async move {
                let query = DeleteTsKvQuery::new("t", 0, 200).with_rewrite_latest(false);
                remover.remove_latest(tenant(), entity, query).await
            });
            save(&engine, entity, "t", 500, 5i64).await;
            removal.await.unwrap().unwrap();

            let latest = engine.find_latest(tenant(), entity, "t").await.unwrap();
            assert_eq!(latest, Some(TsKvEntry::new("t", 500, 5i64)));
        }
    }

    #[tokio::test]
    async fn test_sparse_fine_grained_slices() {
        let engine = TimeseriesEngine::open(
            StorageConfig::in_memory()
                .with_partitioning(PartitionGranularity::Hours)
                .with_operation_timeout(Duration::from_secs(2)),
        )
        .unwrap();
        let entity = Uuid::new_v4();
        save(&engine, entity, "k", 5, 3i64).await;
        save(&engine, entity, "k", 7, 4i64).await;

        let rows = engine
            .find_all(
                tenant(),
                entity,
                vec![ReadTsKvQuery::aggregated("k", 0, 300_000, 1, Aggregation::Sum)],
            )
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![TsKvEntry::new("k", 5, 3i64), TsKvEntry::new("k", 7, 4i64)]
        );

        // One slice per millisecond of the whole timeline
        let rows = engine
            .find_all(
                tenant(),
                entity,
                vec![ReadTsKvQuery::aggregated(
                    "k",
                    Timestamp::MIN,
                    Timestamp::MAX,
                    1,
                    Aggregation::Count,
                )],
            )
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![TsKvEntry::new("k", 5, 1i64), TsKvEntry::new("k", 7, 1i64)]
        );
    }

    #[tokio::test]
    async fn test_timeline_edges_are_rejected() {
        for partitioning in [PartitionGranularity::Minutes, PartitionGranularity::Indefinite] {
            let engine = TimeseriesEngine::open(
                StorageConfig::in_memory().with_partitioning(partitioning),
            )
            .unwrap();
            let entity = Uuid::new_v4();

            let err = engine
                .write(entity, "k", Timestamp::MAX, TsValue::Long(1))
                .await
                .unwrap_err();
            assert!(err.is_validation());
            assert_eq!(engine.stats().store.keys, 0);
        }

        let engine = TimeseriesEngine::open(
            StorageConfig::in_memory().with_partitioning(PartitionGranularity::Minutes),
        )
        .unwrap();
        let err = engine
            .write(Uuid::new_v4(), "k", Timestamp::MIN, TsValue::Long(1))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_remove_unknown_key_is_noop() {
        let engine = engine();
        engine
            .remove(tenant(), Uuid::new_v4(), DeleteTsKvQuery::new("ghost", 0, 10))
            .await
            .unwrap();
        assert_eq!(engine.stats().store.keys, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_writers_converge() {
        let engine = engine();
        let mut tasks = JoinSet::new();
        for _ in 0..16 {
            let engine = engine.clone();
            tasks.spawn(async move { engine.resolve_or_create("pressure").await });
        }
        let mut ids = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            ids.insert(joined.unwrap().unwrap());
        }
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_share_partition() {
        let engine = engine();
        let entity = Uuid::new_v4();
        let mut tasks = JoinSet::new();
        for i in 0..32i64 {
            let engine = engine.clone();
            tasks.spawn(async move {
                engine
                    .save(tenant(), entity, TsKvEntry::new("pressure", i, i), 0)
                    .await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        let stats = engine.stats();
        assert_eq!(stats.store.partitions, 1);
        assert_eq!(stats.store.rows, 32);
        let latest = engine.find_latest(tenant(), entity, "pressure").await.unwrap();
        assert_eq!(latest.map(|e| e.ts), Some(31));
    }

    #[tokio::test]
    async fn test_ttl_hides_rows_and_cleanup_purges() {
        let engine = engine();
        let entity = Uuid::new_v4();
        engine
            .save(tenant(), entity, TsKvEntry::new("t", 10, 1i64), 1)
            .await
            .unwrap();
        save(&engine, entity, "t", 20, 2i64).await;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let rows = engine
            .find_all_with_limit(entity, "t", TimeRange::new(0, 100), 10, OrderBy::Asc)
            .await
            .unwrap();
        assert_eq!(rows, vec![TsKvEntry::new("t", 20, 2i64)]);

        let stats = engine.cleanup(0).await.unwrap();
        assert_eq!(stats.expired_rows, 1);
        assert_eq!(stats.dropped_partitions, 0);
    }

    #[tokio::test]
    async fn test_cleanup_drops_old_partitions() {
        let engine = engine();
        let entity = Uuid::new_v4();
        save(&engine, entity, "t", 0, 1i64).await;
        save(&engine, entity, "t", now_millis(), 2i64).await;

        let stats = engine.cleanup(24 * 3600).await.unwrap();
        assert_eq!(stats.dropped_partitions, 1);
        assert_eq!(engine.stats().known_partitions, 1);

        // Writing into the dropped bucket re-creates it
        save(&engine, entity, "t", 5, 3i64).await;
        assert_eq!(engine.stats().store.partitions, 2);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let entity = Uuid::new_v4();
        let config = StorageConfig::persistent(dir.path())
            .with_partitioning(PartitionGranularity::Days);
        {
            let engine = TimeseriesEngine::open(config.clone()).unwrap();
            save(&engine, entity, "temperature", 1000, 10.0).await;
            save(&engine, entity, "humidity", 2000, 55i64).await;
            engine.checkpoint().await.unwrap();
            save(&engine, entity, "temperature", 3000, 30.0).await;
        }

        let engine = TimeseriesEngine::open(config).unwrap();
        assert_eq!(engine.stats().known_partitions, 1);
        let avg = engine
            .aggregate(entity, "temperature", 0, 4000, Aggregation::Avg)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(avg.value, TsValue::Double(20.0));

        // New keys continue after the persisted ids
        let next = engine.resolve_or_create("pressure").await.unwrap();
        assert_eq!(next, 2);

        let mut latest = engine.find_all_latest(tenant(), entity).await.unwrap();
        latest.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(
            latest,
            vec![
                TsKvEntry::new("humidity", 2000, 55i64),
                TsKvEntry::new("temperature", 3000, 30.0),
            ]
        );
    }

    /// Embedded store whose row and latest writes can be made to fail or stall
    struct FaultyStore {
        store: EmbeddedStore,
        fail_rows: AtomicBool,
        stall_rows: AtomicBool,
        fail_latest: AtomicBool,
    }

    impl FaultyStore {
        fn new() -> Self {
            Self {
                store: EmbeddedStore::in_memory(),
                fail_rows: AtomicBool::new(false),
                stall_rows: AtomicBool::new(false),
                fail_latest: AtomicBool::new(false),
            }
        }
    }

    impl StorageBackend for FaultyStore {
        fn find_key_id(&self, key: &str) -> Result<Option<KeyId>> {
            self.store.find_key_id(key)
        }

        fn find_key_name(&self, key_id: KeyId) -> Result<Option<String>> {
            self.store.find_key_name(key_id)
        }

        fn max_key_id(&self) -> Result<Option<KeyId>> {
            self.store.max_key_id()
        }

        fn insert_key(&self, key: &str, key_id: KeyId) -> KeyInsertOutcome {
            self.store.insert_key(key, key_id)
        }

        fn create_partition(&self, bounds: PartitionBounds) -> PartitionOutcome {
            self.store.create_partition(bounds)
        }

        fn list_partitions(&self) -> Result<Vec<PartitionBounds>> {
            self.store.list_partitions()
        }

        fn drop_partition(&self, partition: Timestamp) -> Result<bool> {
            self.store.drop_partition(partition)
        }

        fn upsert_row(&self, partition: Timestamp, row: StoredRow) -> Result<()> {
            if self.stall_rows.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(300));
            }
            if self.fail_rows.load(Ordering::SeqCst) {
                return Err(TsError::Storage("connection lost".into()));
            }
            self.store.upsert_row(partition, row)
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
            self.store
                .scan(partition, entity_id, key_id, range, order, now, visit)
        }

        fn delete_rows(&self, entity_id: EntityId, key_id: KeyId, range: TimeRange) -> Result<usize> {
            self.store.delete_rows(entity_id, key_id, range)
        }

        fn delete_expired(&self, now: Timestamp) -> Result<usize> {
            self.store.delete_expired(now)
        }

        fn find_latest(&self, entity_id: EntityId, key_id: KeyId) -> Result<Option<LatestRow>> {
            self.store.find_latest(entity_id, key_id)
        }

        fn find_all_latest(&self, entity_id: EntityId) -> Result<Vec<LatestRow>> {
            self.store.find_all_latest(entity_id)
        }

        fn upsert_latest(&self, row: LatestRow) -> Result<bool> {
            if self.fail_latest.load(Ordering::SeqCst) {
                return Err(TsError::Storage("latest table unavailable".into()));
            }
            self.store.upsert_latest(row)
        }

        fn delete_latest_in(
            &self,
            entity_id: EntityId,
            key_id: KeyId,
            range: TimeRange,
        ) -> Result<Option<LatestRow>> {
            self.store.delete_latest_in(entity_id, key_id, range)
        }

        fn checkpoint(&self) -> Result<()> {
            self.store.checkpoint()
        }

        fn stats(&self) -> StoreStats {
            self.store.stats()
        }
    }

    fn faulty_engine(timeout: Duration) -> (TimeseriesEngine, Arc<FaultyStore>) {
        let store = Arc::new(FaultyStore::new());
        let config = StorageConfig::in_memory()
            .with_partitioning(PartitionGranularity::Hours)
            .with_operation_timeout(timeout);
        let engine = TimeseriesEngine::with_backend(config, store.clone()).unwrap();
        (engine, store)
    }

    #[tokio::test]
    async fn test_failed_history_write_skips_latest() {
        let (engine, store) = faulty_engine(Duration::from_secs(5));
        let entity = Uuid::new_v4();
        store.fail_rows.store(true, Ordering::SeqCst);

        let err = engine
            .save(tenant(), entity, TsKvEntry::new("t", 100, 1i64), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, TsError::Storage(_)));
        assert!(engine.find_latest(tenant(), entity, "t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_failure_keeps_history() {
        let (engine, store) = faulty_engine(Duration::from_secs(5));
        let entity = Uuid::new_v4();
        store.fail_latest.store(true, Ordering::SeqCst);

        let err = engine
            .save(tenant(), entity, TsKvEntry::new("t", 100, 1i64), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, TsError::LatestValue(_)));

        let rows = engine
            .find_all_with_limit(entity, "t", TimeRange::new(0, 1000), 10, OrderBy::Asc)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_write_is_reported() {
        let (engine, store) = faulty_engine(Duration::from_millis(50));
        let entity = Uuid::new_v4();
        // Warm the dictionary and partition so only the row write stalls
        save(&engine, entity, "t", 1, 1i64).await;
        store.stall_rows.store(true, Ordering::SeqCst);

        let err = engine
            .save(tenant(), entity, TsKvEntry::new("t", 100, 2i64), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, TsError::Timeout(50)));

        let latest = engine.find_latest(tenant(), entity, "t").await.unwrap();
        assert_eq!(latest.map(|e| e.ts), Some(1));
    }
}
