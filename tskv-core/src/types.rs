//! Core types for TSKV

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Compact integer id assigned to a key name by the dictionary
pub type KeyId = i32;

/// Identity of the entity (device, asset, ...) that owns a series
pub type EntityId = Uuid;

/// Tenant that issued a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// The system tenant (nil uuid)
    pub fn sys() -> Self {
        Self(Uuid::nil())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Runtime type of a stored value.
///
/// Declaration order is the dispatch priority used when two value
/// domains compete for one result: string, then integer, then double,
/// then boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataType {
    String,
    Long,
    Double,
    Boolean,
}

/// A typed telemetry value. Exactly one slot is ever populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TsValue {
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
}

impl TsValue {
    pub fn data_type(&self) -> DataType {
        match self {
            TsValue::String(_) => DataType::String,
            TsValue::Long(_) => DataType::Long,
            TsValue::Double(_) => DataType::Double,
            TsValue::Boolean(_) => DataType::Boolean,
        }
    }

    /// Integer and floating values take part in numeric aggregation
    pub fn is_numeric(&self) -> bool {
        matches!(self, TsValue::Long(_) | TsValue::Double(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TsValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TsValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as f64 if numeric
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TsValue::Double(v) => Some(*v),
            TsValue::Long(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TsValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Approximate size in bytes
    pub fn size(&self) -> usize {
        match self {
            TsValue::String(s) => s.len(),
            TsValue::Long(_) | TsValue::Double(_) => 8,
            TsValue::Boolean(_) => 1,
        }
    }
}

impl fmt::Display for TsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TsValue::String(v) => write!(f, "{}", v),
            TsValue::Long(v) => write!(f, "{}", v),
            TsValue::Double(v) => write!(f, "{}", v),
            TsValue::Boolean(v) => write!(f, "{}", v),
        }
    }
}

impl From<f64> for TsValue {
    fn from(v: f64) -> Self {
        TsValue::Double(v)
    }
}

impl From<i64> for TsValue {
    fn from(v: i64) -> Self {
        TsValue::Long(v)
    }
}

impl From<bool> for TsValue {
    fn from(v: bool) -> Self {
        TsValue::Boolean(v)
    }
}

impl From<String> for TsValue {
    fn from(v: String) -> Self {
        TsValue::String(v)
    }
}

impl From<&str> for TsValue {
    fn from(v: &str) -> Self {
        TsValue::String(v.to_string())
    }
}

/// A timestamped key/value sample as seen by callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TsKvEntry {
    pub key: String,
    pub ts: Timestamp,
    pub value: TsValue,
}

impl TsKvEntry {
    pub fn new(key: impl Into<String>, ts: Timestamp, value: impl Into<TsValue>) -> Self {
        Self {
            key: key.into(),
            ts,
            value: value.into(),
        }
    }

    pub fn data_type(&self) -> DataType {
        self.value.data_type()
    }
}

impl fmt::Display for TsKvEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}={}", self.key, self.ts, self.value)
    }
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (exclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// The whole timeline
    pub fn all() -> Self {
        Self::new(Timestamp::MIN, Timestamp::MAX)
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Duration in milliseconds
    pub fn duration(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    /// Representative instant used to stamp aggregated results
    pub fn midpoint(&self) -> Timestamp {
        self.start + self.duration() / 2
    }
}

/// Current wall clock time in epoch millis
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}
