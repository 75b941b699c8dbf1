//! Partition catalog
//!
//! A timestamp maps to exactly one time bucket through a pure function of
//! the timestamp and the configured [`PartitionGranularity`]. The catalog
//! keeps a best-effort set of buckets known to exist and creates missing
//! ones on first use. An "already exists" answer from the store counts as
//! success, so concurrent creators of the same bucket all proceed.

use crate::storage::{PartitionOutcome, StorageBackend};
use crate::{Result, Timestamp, TimeRange, TsError};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Width of a partition bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PartitionGranularity {
    Minutes,
    Hours,
    Days,
    #[default]
    Months,
    Years,
    /// One bucket for the whole timeline
    Indefinite,
}

impl PartitionGranularity {
    /// Bucket containing `ts`. Timestamps no bucket can hold are rejected.
    pub fn bounds_for(&self, ts: Timestamp) -> Result<PartitionBounds> {
        let bounds = match self {
            PartitionGranularity::Minutes => fixed_width(ts, MINUTE_MS)?,
            PartitionGranularity::Hours => fixed_width(ts, HOUR_MS)?,
            PartitionGranularity::Days => fixed_width(ts, DAY_MS)?,
            PartitionGranularity::Months => {
                let dt = to_datetime(ts)?;
                let start = month_start(dt.year(), dt.month())?;
                let end = if dt.month() == 12 {
                    month_start(dt.year() + 1, 1)?
                } else {
                    month_start(dt.year(), dt.month() + 1)?
                };
                PartitionBounds::new(start, end)
            }
            PartitionGranularity::Years => {
                let dt = to_datetime(ts)?;
                PartitionBounds::new(month_start(dt.year(), 1)?, month_start(dt.year() + 1, 1)?)
            }
            PartitionGranularity::Indefinite => PartitionBounds::new(Timestamp::MIN, Timestamp::MAX),
        };
        // Half-open buckets can never hold Timestamp::MAX
        if !bounds.contains(ts) {
            return Err(out_of_range(ts));
        }
        Ok(bounds)
    }
}

impl FromStr for PartitionGranularity {
    type Err = TsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "MINUTES" => Ok(PartitionGranularity::Minutes),
            "HOURS" => Ok(PartitionGranularity::Hours),
            "DAYS" => Ok(PartitionGranularity::Days),
            "MONTHS" => Ok(PartitionGranularity::Months),
            "YEARS" => Ok(PartitionGranularity::Years),
            "INDEFINITE" => Ok(PartitionGranularity::Indefinite),
            other => Err(TsError::Config(format!(
                "unknown partitioning '{}'",
                other
            ))),
        }
    }
}

fn fixed_width(ts: Timestamp, width: i64) -> Result<PartitionBounds> {
    let start = ts
        .div_euclid(width)
        .checked_mul(width)
        .ok_or_else(|| out_of_range(ts))?;
    let end = start.checked_add(width).ok_or_else(|| out_of_range(ts))?;
    Ok(PartitionBounds::new(start, end))
}

fn out_of_range(ts: Timestamp) -> TsError {
    TsError::validation(format!("timestamp {} out of range", ts))
}

fn to_datetime(ts: Timestamp) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ts).ok_or_else(|| out_of_range(ts))
}

fn month_start(year: i32, month: u32) -> Result<Timestamp> {
    let naive = NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| TsError::validation(format!("no bucket for {}-{:02}", year, month)))?;
    Ok(Utc.from_utc_datetime(&naive).timestamp_millis())
}

/// Half-open `[start, end)` extent of one bucket. `start` is the
/// partition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionBounds {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl PartitionBounds {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn key(&self) -> Timestamp {
        self.start
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end)
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.range().contains(ts)
    }
}

impl fmt::Display for PartitionBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Lazily creates partitions and remembers which ones exist
pub struct PartitionCatalog {
    granularity: PartitionGranularity,
    backend: Arc<dyn StorageBackend>,
    /// Partition keys known to exist. Entries are only added after the
    /// store confirmed the bucket.
    known: DashSet<Timestamp>,
}

impl PartitionCatalog {
    pub fn new(granularity: PartitionGranularity, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            granularity,
            backend,
            known: DashSet::new(),
        }
    }

    /// Seed the known-set from the store
    pub fn warm(&self) -> Result<usize> {
        let partitions = self.backend.list_partitions()?;
        for bounds in &partitions {
            self.known.insert(bounds.start);
        }
        Ok(partitions.len())
    }

    pub fn granularity(&self) -> PartitionGranularity {
        self.granularity
    }

    /// Make sure the bucket holding `ts` exists in the store
    pub fn ensure_partition(&self, ts: Timestamp) -> Result<PartitionBounds> {
        let bounds = self.granularity.bounds_for(ts)?;
        if self.known.contains(&bounds.start) {
            return Ok(bounds);
        }

        match self.backend.create_partition(bounds) {
            PartitionOutcome::Created => {
                info!("Created partition {}", bounds);
            }
            PartitionOutcome::AlreadyExists => {
                debug!("Partition {} already exists", bounds);
            }
            PartitionOutcome::Failed(e) => return Err(e),
        }
        self.known.insert(bounds.start);
        Ok(bounds)
    }

    /// Drop a bucket from the known-set so the next write re-checks the store
    pub fn forget(&self, partition: Timestamp) -> bool {
        self.known.remove(&partition).is_some()
    }

    pub fn is_known(&self, partition: Timestamp) -> bool {
        self.known.contains(&partition)
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EmbeddedStore;

    #[test]
    fn test_fixed_width_buckets() {
        let g = PartitionGranularity::Hours;
        let b = g.bounds_for(HOUR_MS + 5).unwrap();
        assert_eq!(b, PartitionBounds::new(HOUR_MS, 2 * HOUR_MS));
        assert_eq!(g.bounds_for(2 * HOUR_MS - 1).unwrap(), b);

        // Negative timestamps round down, not toward zero
        let neg = PartitionGranularity::Days.bounds_for(-1).unwrap();
        assert_eq!(neg, PartitionBounds::new(-DAY_MS, 0));
    }

    #[test]
    fn test_calendar_buckets() {
        // 2024-02-15T12:00:00Z
        let ts = 1_707_998_400_000;
        let month = PartitionGranularity::Months.bounds_for(ts).unwrap();
        assert_eq!(month.start, 1_706_745_600_000); // 2024-02-01
        assert_eq!(month.end, 1_709_251_200_000); // 2024-03-01
        assert!(month.contains(ts));

        // December rolls into the next year
        let dec = PartitionGranularity::Months
            .bounds_for(1_703_980_800_000) // 2023-12-31
            .unwrap();
        assert_eq!(dec.end, 1_704_067_200_000); // 2024-01-01

        let year = PartitionGranularity::Years.bounds_for(ts).unwrap();
        assert_eq!(year.start, 1_704_067_200_000);
        assert_eq!(year.end, 1_735_689_600_000); // 2025-01-01

        let all = PartitionGranularity::Indefinite.bounds_for(ts).unwrap();
        assert!(all.contains(0) && all.contains(ts));
    }

    #[test]
    fn test_out_of_range_timestamp() {
        let err = PartitionGranularity::Months.bounds_for(i64::MAX).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_timeline_edges() {
        for granularity in [
            PartitionGranularity::Minutes,
            PartitionGranularity::Hours,
            PartitionGranularity::Days,
            PartitionGranularity::Months,
            PartitionGranularity::Years,
            PartitionGranularity::Indefinite,
        ] {
            let err = granularity.bounds_for(i64::MAX).unwrap_err();
            assert!(err.is_validation(), "{:?}", granularity);
        }
        assert!(PartitionGranularity::Minutes
            .bounds_for(i64::MIN)
            .unwrap_err()
            .is_validation());
        assert!(PartitionGranularity::Hours
            .bounds_for(i64::MIN + 1)
            .unwrap_err()
            .is_validation());

        // The first whole bucket on each side still works
        let last = PartitionGranularity::Minutes
            .bounds_for(i64::MAX - MINUTE_MS)
            .unwrap();
        assert!(last.contains(i64::MAX - MINUTE_MS));
        let all = PartitionGranularity::Indefinite.bounds_for(i64::MIN).unwrap();
        assert_eq!(all.start, i64::MIN);
    }

    #[test]
    fn test_ensure_partition_is_idempotent() {
        let store: Arc<dyn StorageBackend> = Arc::new(EmbeddedStore::in_memory());
        let catalog = PartitionCatalog::new(PartitionGranularity::Minutes, store.clone());

        let a = catalog.ensure_partition(1_000).unwrap();
        let b = catalog.ensure_partition(59_999).unwrap();
        assert_eq!(a, b);
        assert!(catalog.is_known(0));
        assert_eq!(store.list_partitions().unwrap().len(), 1);

        // A second catalog over the same store sees AlreadyExists
        let other = PartitionCatalog::new(PartitionGranularity::Minutes, store.clone());
        assert_eq!(other.ensure_partition(30_000).unwrap(), a);
        assert_eq!(store.list_partitions().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_creators_share_one_partition() {
        let store: Arc<dyn StorageBackend> = Arc::new(EmbeddedStore::in_memory());
        let catalogs: Vec<_> = (0..8)
            .map(|_| Arc::new(PartitionCatalog::new(PartitionGranularity::Days, store.clone())))
            .collect();

        let handles: Vec<_> = catalogs
            .iter()
            .enumerate()
            .map(|(i, catalog)| {
                let catalog = catalog.clone();
                std::thread::spawn(move || catalog.ensure_partition(i as i64 * 1000).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), PartitionBounds::new(0, DAY_MS));
        }
        assert_eq!(store.list_partitions().unwrap().len(), 1);
    }

    #[test]
    fn test_warm_and_forget() {
        let store: Arc<dyn StorageBackend> = Arc::new(EmbeddedStore::in_memory());
        PartitionCatalog::new(PartitionGranularity::Hours, store.clone())
            .ensure_partition(0)
            .unwrap();

        let catalog = PartitionCatalog::new(PartitionGranularity::Hours, store);
        assert_eq!(catalog.warm().unwrap(), 1);
        assert!(catalog.is_known(0));
        assert!(catalog.forget(0));
        assert_eq!(catalog.known_count(), 0);
    }
}
