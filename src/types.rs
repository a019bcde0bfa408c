//! Core data types used throughout the query core
//!
//! This module defines the fundamental data structures shared across the
//! system:
//!
//! # Key Types
//!
//! - **`SensorId` / `AssetId`**: opaque identifiers for sensors and the assets
//!   that group them
//! - **`TimeRange`**: half-open query window `[start, end)` in UTC nanoseconds
//! - **`Tier`**: physical pre-aggregation level of stored data
//! - **`Aggregation`**: the fixed set of supported aggregation functions
//! - **`Value` / `Row` / `DataSet`**: dynamic row model for columnar results
//!
//! # Example
//!
//! ```rust
//! use sensorquery::types::{TimeRange, Tier, NANOS_PER_SEC};
//!
//! let range = TimeRange::new(0, 3_600 * NANOS_PER_SEC).unwrap();
//! assert!(range.contains(0));
//! assert!(!range.contains(3_600 * NANOS_PER_SEC));
//! assert_eq!(Tier::Minute.grain_ns(), 60 * NANOS_PER_SEC);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Nanoseconds in one second
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Nanoseconds in one minute
pub const NANOS_PER_MIN: i64 = 60 * NANOS_PER_SEC;

/// Nanoseconds in one hour
pub const NANOS_PER_HOUR: i64 = 3_600 * NANOS_PER_SEC;

/// Opaque sensor name, unique within the system (e.g. `quad_ch1`).
///
/// Case-sensitive. Sensor names appear as file stems in partition paths, so
/// they must never contain path separators; `crate::query::Query` validation
/// enforces this before a name reaches storage.
pub type SensorId = String;

/// Opaque identifier grouping sensors (the first path segment of every
/// partition).
pub type AssetId = String;

/// Half-open time interval `[start, end)` in nanoseconds since the Unix
/// epoch, UTC.
///
/// # Example
///
/// ```rust
/// use sensorquery::types::TimeRange;
///
/// let range = TimeRange::new(1_000, 2_000).unwrap();
/// assert!(range.contains(1_000));   // start is inclusive
/// assert!(range.contains(1_999));
/// assert!(!range.contains(2_000));  // end is exclusive
/// assert_eq!(range.duration_ns(), 1_000);
///
/// // start must precede end
/// assert!(TimeRange::new(2_000, 1_000).is_err());
/// assert!(TimeRange::new(1_000, 1_000).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp in nanoseconds (inclusive)
    pub start: i64,

    /// End timestamp in nanoseconds (exclusive)
    pub end: i64,
}

impl TimeRange {
    /// Create a new time range, validating `start < end`.
    pub fn new(start: i64, end: i64) -> crate::error::Result<Self> {
        if start >= end {
            return Err(crate::error::Error::InvalidTimeRange {
                message: format!("start {} must be before end {}", start, end),
            });
        }
        Ok(Self { start, end })
    }

    /// Create a range without validation.
    ///
    /// Only use this when the bounds are already known to satisfy
    /// `start < end`, e.g. when shrinking a validated range.
    pub fn new_unchecked(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Check whether a timestamp falls within `[start, end)`.
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Duration of the range in nanoseconds.
    pub fn duration_ns(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }
}

/// Physical pre-aggregation level of the stored data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Raw samples, 1-second grain, one partition per (asset, sensor, hour)
    Raw,
    /// Per-minute pre-aggregates, one partition per (asset, sensor, day)
    Minute,
    /// Per-hour pre-aggregates, one partition per (asset, sensor, month)
    Hour,
}

impl Tier {
    /// The finest bucket width this tier can serve, in nanoseconds.
    pub fn grain_ns(&self) -> i64 {
        match self {
            Tier::Raw => NANOS_PER_SEC,
            Tier::Minute => NANOS_PER_MIN,
            Tier::Hour => NANOS_PER_HOUR,
        }
    }

    /// Stable lowercase name, used in metrics labels and metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Raw => "raw",
            Tier::Minute => "minute",
            Tier::Hour => "hour",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Aggregation functions supported by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Arithmetic mean of non-null values per bucket
    Mean,
    /// Element-wise minimum per bucket
    Min,
    /// Element-wise maximum per bucket
    Max,
    /// Value with the greatest timestamp per bucket
    Last,
    /// Passthrough, no bucketing
    Raw,
}

impl Aggregation {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Mean => "mean",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::Last => "last",
            Aggregation::Raw => "raw",
        }
    }

    /// Parse an aggregation name. Unknown names are an error, not a default.
    pub fn parse(s: &str) -> crate::error::Result<Self> {
        match s {
            "mean" => Ok(Aggregation::Mean),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            "last" => Ok(Aggregation::Last),
            "raw" => Ok(Aggregation::Raw),
            other => Err(crate::error::Error::InvalidParameter {
                parameter: "aggregation".to_string(),
                message: format!("unknown aggregation '{}'", other),
            }),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single measurement value.
///
/// Integer and floating columns are kept distinct so that `min`/`max`/`last`
/// preserve the stored type while `mean` promotes to floating point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// 64-bit signed integer measurement
    Int(i64),
    /// IEEE 754 double measurement
    Float(f64),
}

impl Value {
    /// Numeric view for comparisons and sums.
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Int(v) => *v as f64,
            Value::Float(v) => *v,
        }
    }

    /// True for floating NaN inputs, which aggregation drops.
    pub fn is_nan(&self) -> bool {
        matches!(self, Value::Float(v) if v.is_nan())
    }
}

/// One output row: a timestamp plus the measurement columns of a
/// `(sensor, asset)` pair.
///
/// `sensor` is injected from the partition path by the reader; it is not
/// necessarily a column in storage. Measurement columns are dynamic: a
/// missing optional column reports `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Timestamp in nanoseconds since epoch, UTC
    pub timestamp: i64,
    /// Sensor this row belongs to
    pub sensor: SensorId,
    /// Asset this row belongs to
    pub asset: AssetId,
    /// Measurement columns by name; `None` is null
    pub values: BTreeMap<String, Option<Value>>,
}

/// Ordered sequence of rows produced by a read or an aggregation.
///
/// Rows are grouped by `(sensor, asset)` in lexicographic order and sorted by
/// timestamp ascending within each group. A `DataSet` may be empty. Once a
/// `DataSet` is published to the cache it is shared immutably behind an `Arc`
/// and never mutated again.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSet {
    /// The result rows
    pub rows: Vec<Row>,
    /// Non-fatal read warnings (e.g. a partition timed out and was skipped)
    pub warnings: Vec<String>,
}

impl DataSet {
    /// An empty data set with no warnings.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the set holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Per-query result metadata, always populated (also on cache hits).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetadata {
    /// Whether the result was served from cache
    pub cache_hit: bool,
    /// Tier the result was (originally) read from
    pub tier_used: Tier,
    /// Bucket width the result was aggregated at, nanoseconds
    pub bucket_width_ns: i64,
    /// Wall-clock execution time of this call in milliseconds
    pub execution_time_ms: f64,
    /// Whether the point budget shortened the result
    pub truncated: bool,
    /// End of the interval actually covered; equals the requested end unless
    /// truncated
    pub actual_end: i64,
    /// Whether the tier selector had to coarsen the requested resolution
    pub resolution_promoted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_half_open() {
        let range = TimeRange::new(100, 200).unwrap();
        assert!(range.contains(100));
        assert!(range.contains(199));
        assert!(!range.contains(200));
        assert!(!range.contains(50));
        assert_eq!(range.duration_ns(), 100);
    }

    #[test]
    fn test_time_range_rejects_empty_and_inverted() {
        assert!(TimeRange::new(200, 100).is_err());
        assert!(TimeRange::new(100, 100).is_err());
    }

    #[test]
    fn test_tier_grains() {
        assert_eq!(Tier::Raw.grain_ns(), NANOS_PER_SEC);
        assert_eq!(Tier::Minute.grain_ns(), NANOS_PER_MIN);
        assert_eq!(Tier::Hour.grain_ns(), NANOS_PER_HOUR);
    }

    #[test]
    fn test_aggregation_parse() {
        assert_eq!(Aggregation::parse("mean").unwrap(), Aggregation::Mean);
        assert_eq!(Aggregation::parse("raw").unwrap(), Aggregation::Raw);
        assert!(Aggregation::parse("median").is_err());
        assert!(Aggregation::parse("MEAN").is_err());
    }

    #[test]
    fn test_value_nan_detection() {
        assert!(Value::Float(f64::NAN).is_nan());
        assert!(!Value::Float(1.0).is_nan());
        assert!(!Value::Int(0).is_nan());
    }
}
