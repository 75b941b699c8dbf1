//! Aggregate function implementations
//!
//! Each partition produces a partial accumulator for its slice of the
//! window; partials are merged and finished into a single typed value.

use super::Aggregation;
use crate::TsValue;

/// Value domain scanned by one aggregation sub-query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueDomain {
    /// String rows, compared lexicographically
    String,
    /// Integer and floating rows
    Numeric,
}

/// Accumulator for computing aggregates incrementally
pub trait Accumulator: Default + Send + 'static {
    /// Add a value; values outside the accumulator's domain are skipped
    fn add(&mut self, value: &TsValue);

    /// Merge a partial from another partition into this one
    fn merge(&mut self, other: Self);

    /// True when no value of the domain was seen
    fn is_empty(&self) -> bool;

    /// Produce the final value, `None` when empty or not applicable
    fn finish(&self, aggregation: Aggregation) -> Option<TsValue>;
}

/// Numeric accumulator keeping integers and doubles apart so the result
/// type can follow the inputs
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NumericAccumulator {
    long_count: u64,
    long_sum: i128,
    long_min: Option<i64>,
    long_max: Option<i64>,
    double_count: u64,
    double_sum: f64,
    double_min: Option<f64>,
    double_max: Option<f64>,
}

impl NumericAccumulator {
    pub fn count(&self) -> u64 {
        self.long_count + self.double_count
    }

    fn total(&self) -> f64 {
        self.double_sum + self.long_sum as f64
    }

    fn min_f64(&self) -> Option<f64> {
        let long = self.long_min.map(|v| v as f64);
        match (self.double_min, long) {
            (Some(d), Some(l)) => Some(d.min(l)),
            (d, l) => d.or(l),
        }
    }

    fn max_f64(&self) -> Option<f64> {
        let long = self.long_max.map(|v| v as f64);
        match (self.double_max, long) {
            (Some(d), Some(l)) => Some(d.max(l)),
            (d, l) => d.or(l),
        }
    }
}

impl Accumulator for NumericAccumulator {
    fn add(&mut self, value: &TsValue) {
        match value {
            TsValue::Long(v) => {
                self.long_count += 1;
                self.long_sum += *v as i128;
                self.long_min = Some(self.long_min.map_or(*v, |m| m.min(*v)));
                self.long_max = Some(self.long_max.map_or(*v, |m| m.max(*v)));
            }
            TsValue::Double(v) => {
                self.double_count += 1;
                self.double_sum += v;
                self.double_min = Some(self.double_min.map_or(*v, |m| m.min(*v)));
                self.double_max = Some(self.double_max.map_or(*v, |m| m.max(*v)));
            }
            TsValue::String(_) | TsValue::Boolean(_) => {}
        }
    }

    fn merge(&mut self, other: Self) {
        self.long_count += other.long_count;
        self.long_sum += other.long_sum;
        self.long_min = min_opt(self.long_min, other.long_min);
        self.long_max = max_opt(self.long_max, other.long_max);
        self.double_count += other.double_count;
        self.double_sum += other.double_sum;
        self.double_min = match (self.double_min, other.double_min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.double_max = match (self.double_max, other.double_max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    fn is_empty(&self) -> bool {
        self.count() == 0
    }

    fn finish(&self, aggregation: Aggregation) -> Option<TsValue> {
        if self.is_empty() {
            return None;
        }
        let has_doubles = self.double_count > 0;
        match aggregation {
            Aggregation::None => None,
            Aggregation::Count => Some(TsValue::Long(self.count() as i64)),
            Aggregation::Avg => Some(TsValue::Double(self.total() / self.count() as f64)),
            Aggregation::Sum if has_doubles => Some(TsValue::Double(self.total())),
            Aggregation::Sum => Some(match i64::try_from(self.long_sum) {
                Ok(sum) => TsValue::Long(sum),
                Err(_) => TsValue::Double(self.long_sum as f64),
            }),
            Aggregation::Min if has_doubles => self.min_f64().map(TsValue::Double),
            Aggregation::Min => self.long_min.map(TsValue::Long),
            Aggregation::Max if has_doubles => self.max_f64().map(TsValue::Double),
            Aggregation::Max => self.long_max.map(TsValue::Long),
        }
    }
}

/// Lexicographic min/max over string rows
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StringAccumulator {
    count: u64,
    min: Option<String>,
    max: Option<String>,
}

impl Accumulator for StringAccumulator {
    fn add(&mut self, value: &TsValue) {
        let TsValue::String(v) = value else {
            return;
        };
        self.count += 1;
        if self.min.as_deref().map_or(true, |m| v.as_str() < m) {
            self.min = Some(v.clone());
        }
        if self.max.as_deref().map_or(true, |m| v.as_str() > m) {
            self.max = Some(v.clone());
        }
    }

    fn merge(&mut self, other: Self) {
        self.count += other.count;
        self.min = min_opt(self.min.take(), other.min);
        self.max = max_opt(self.max.take(), other.max);
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn finish(&self, aggregation: Aggregation) -> Option<TsValue> {
        match aggregation {
            Aggregation::Min => self.min.clone().map(TsValue::String),
            Aggregation::Max => self.max.clone().map(TsValue::String),
            _ => None,
        }
    }
}

/// Combine the sub-query results of one window.
///
/// The string result wins when both domains produced a value.
pub fn merge_domain_results(
    string: Option<TsValue>,
    numeric: Option<TsValue>,
) -> Option<TsValue> {
    string.or(numeric)
}

fn min_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
