//! Read and delete queries
//!
//! A [`ReadTsKvQuery`] either asks for raw samples (aggregation `None`,
//! bounded by `limit` and ordered by `order`) or for one aggregated value
//! per `interval`-sized slice of the window. A [`DeleteTsKvQuery`] removes
//! history and optionally repairs the latest value.

pub mod aggregates;

use crate::{Result, Timestamp, TimeRange, TsError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use aggregates::{Accumulator, NumericAccumulator, StringAccumulator, ValueDomain};

/// Aggregation functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Aggregation {
    /// Raw samples, no aggregation
    None,
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl Aggregation {
    /// MIN/MAX fan out to both value domains, the rest are numeric only
    pub fn domains(&self) -> &'static [ValueDomain] {
        match self {
            Aggregation::Min | Aggregation::Max => &[ValueDomain::String, ValueDomain::Numeric],
            Aggregation::Count | Aggregation::Sum | Aggregation::Avg => &[ValueDomain::Numeric],
            Aggregation::None => &[],
        }
    }
}

impl FromStr for Aggregation {
    type Err = TsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Aggregation::None),
            "count" => Ok(Aggregation::Count),
            "sum" => Ok(Aggregation::Sum),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            "avg" | "mean" | "average" => Ok(Aggregation::Avg),
            other => Err(TsError::validation(format!("unknown aggregation '{}'", other))),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Aggregation::None => "NONE",
            Aggregation::Count => "COUNT",
            Aggregation::Sum => "SUM",
            Aggregation::Min => "MIN",
            Aggregation::Max => "MAX",
            Aggregation::Avg => "AVG",
        };
        f.write_str(name)
    }
}

/// Ordering of raw samples by timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrderBy {
    Asc,
    #[default]
    Desc,
}

impl FromStr for OrderBy {
    type Err = TsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "asc" => Ok(OrderBy::Asc),
            "desc" => Ok(OrderBy::Desc),
            other => Err(TsError::validation(format!("unknown order '{}'", other))),
        }
    }
}

/// A range read for one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadTsKvQuery {
    pub key: String,
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
    /// Width of each aggregation slice in millis; ignored for raw reads
    pub interval: i64,
    /// Maximum number of raw samples; ignored for aggregated reads
    pub limit: usize,
    pub aggregation: Aggregation,
    pub order: OrderBy,
}

impl ReadTsKvQuery {
    /// Raw samples in `[start_ts, end_ts)`
    pub fn raw(
        key: impl Into<String>,
        start_ts: Timestamp,
        end_ts: Timestamp,
        limit: usize,
        order: OrderBy,
    ) -> Self {
        Self {
            key: key.into(),
            start_ts,
            end_ts,
            interval: end_ts.saturating_sub(start_ts),
            limit,
            aggregation: Aggregation::None,
            order,
        }
    }

    /// One aggregated value per `interval` slice of `[start_ts, end_ts)`
    pub fn aggregated(
        key: impl Into<String>,
        start_ts: Timestamp,
        end_ts: Timestamp,
        interval: i64,
        aggregation: Aggregation,
    ) -> Self {
        Self {
            key: key.into(),
            start_ts,
            end_ts,
            interval,
            limit: 0,
            aggregation,
            order: OrderBy::Asc,
        }
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start_ts, self.end_ts)
    }

    /// Check the query shape; the key itself is checked by the dictionary
    pub fn validate(&self) -> Result<()> {
        if self.start_ts >= self.end_ts {
            return Err(TsError::validation(format!(
                "empty range [{}, {}) for key '{}'",
                self.start_ts, self.end_ts, self.key
            )));
        }
        match self.aggregation {
            Aggregation::None if self.limit == 0 => Err(TsError::validation(format!(
                "limit must be positive for key '{}'",
                self.key
            ))),
            Aggregation::None => Ok(()),
            _ if self.interval <= 0 => Err(TsError::validation(format!(
                "interval must be positive for key '{}'",
                self.key
            ))),
            _ => Ok(()),
        }
    }

    /// Fixed-width slices of the window, one aggregated value each
    pub fn slices(&self) -> SlicePlan {
        SlicePlan::new(self.range(), self.interval)
    }
}

/// Consecutive `interval`-wide slices covering a window, the last one
/// clipped to the window end. Slices are addressed by index and never
/// materialized, so only slices holding rows cost anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlicePlan {
    window: TimeRange,
    interval: i128,
}

impl SlicePlan {
    pub fn new(window: TimeRange, interval: i64) -> Self {
        Self {
            window,
            interval: i128::from(interval.max(1)),
        }
    }

    /// A single slice spanning the whole window
    pub fn whole(window: TimeRange) -> Self {
        let width = i128::from(window.end) - i128::from(window.start);
        Self {
            window,
            interval: width.max(1),
        }
    }

    pub fn window(&self) -> TimeRange {
        self.window
    }

    /// Index of the slice holding `ts`, `None` outside the window
    pub fn slice_of(&self, ts: Timestamp) -> Option<u64> {
        if !self.window.contains(ts) {
            return None;
        }
        let offset = i128::from(ts) - i128::from(self.window.start);
        Some((offset / self.interval) as u64)
    }

    /// Extent of slice `index`
    pub fn slice(&self, index: u64) -> TimeRange {
        let start = i128::from(self.window.start) + i128::from(index) * self.interval;
        let end = (start + self.interval).min(i128::from(self.window.end));
        TimeRange::new(start as Timestamp, end as Timestamp)
    }
}

/// A range delete for one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteTsKvQuery {
    pub key: String,
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
    /// Also run the latest-value removal for this range
    pub delete_latest: bool,
    /// Replace a removed latest value with the newest remaining sample
    pub rewrite_latest_if_deleted: bool,
}

impl DeleteTsKvQuery {
    pub fn new(key: impl Into<String>, start_ts: Timestamp, end_ts: Timestamp) -> Self {
        Self {
            key: key.into(),
            start_ts,
            end_ts,
            delete_latest: true,
            rewrite_latest_if_deleted: true,
        }
    }

    pub fn with_delete_latest(mut self, delete_latest: bool) -> Self {
        self.delete_latest = delete_latest;
        self
    }

    pub fn with_rewrite_latest(mut self, rewrite: bool) -> Self {
        self.rewrite_latest_if_deleted = rewrite;
        self
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start_ts, self.end_ts)
    }

    pub fn validate(&self) -> Result<()> {
        if self.start_ts >= self.end_ts {
            return Err(TsError::validation(format!(
                "empty delete range [{}, {}) for key '{}'",
                self.start_ts, self.end_ts, self.key
            )));
        }
        Ok(())
    }
}
