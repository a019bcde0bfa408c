//! In-memory bucketing aggregator
//!
//! Folds rows sorted by `(sensor, asset, timestamp)` into one output row per
//! `(sensor, asset, bucket)`, where `bucket = floor((ts - start) / width)`.
//! The fold is explicit and column-wise; no dataframe machinery.
//!
//! # Numeric semantics
//!
//! - `mean` sums in double precision and always emits floats
//! - `min` / `max` / `last` preserve the stored value type
//! - `NaN` inputs are dropped before aggregation
//! - a bucket with no rows produces no output row (sparse output)
//! - a column that is null across a whole bucket reports null
//! - `last` takes the greatest timestamp; on equal timestamps the row later
//!   in input order wins
//!
//! Output timestamps are the bucket's left edge: `start + index * width`.

use crate::types::{Aggregation, Row, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Per-column accumulator state for one bucket
enum ColumnAcc {
    Mean { sum: f64, count: u64 },
    Extremum { best: Option<Value>, want_min: bool },
    Last { best: Option<(i64, Value)> },
}

impl ColumnAcc {
    fn new(agg: Aggregation) -> Self {
        match agg {
            Aggregation::Mean => ColumnAcc::Mean { sum: 0.0, count: 0 },
            Aggregation::Min => ColumnAcc::Extremum {
                best: None,
                want_min: true,
            },
            Aggregation::Max => ColumnAcc::Extremum {
                best: None,
                want_min: false,
            },
            Aggregation::Last => ColumnAcc::Last { best: None },
            // Raw never reaches the fold; the engine passes it through.
            Aggregation::Raw => ColumnAcc::Last { best: None },
        }
    }

    fn push(&mut self, timestamp: i64, value: Value) {
        if value.is_nan() {
            return;
        }
        match self {
            ColumnAcc::Mean { sum, count } => {
                *sum += value.as_f64();
                *count += 1;
            }
            ColumnAcc::Extremum { best, want_min } => {
                let replace = match best {
                    None => true,
                    Some(current) => {
                        if *want_min {
                            value.as_f64() < current.as_f64()
                        } else {
                            value.as_f64() > current.as_f64()
                        }
                    }
                };
                if replace {
                    *best = Some(value);
                }
            }
            ColumnAcc::Last { best } => {
                // >= so that input order breaks timestamp ties
                let replace = match best {
                    None => true,
                    Some((best_ts, _)) => timestamp >= *best_ts,
                };
                if replace {
                    *best = Some((timestamp, value));
                }
            }
        }
    }

    fn finish(self) -> Option<Value> {
        match self {
            ColumnAcc::Mean { count: 0, .. } => None,
            ColumnAcc::Mean { sum, count } => Some(Value::Float(sum / count as f64)),
            ColumnAcc::Extremum { best, .. } => best,
            ColumnAcc::Last { best } => best.map(|(_, v)| v),
        }
    }
}

/// One open bucket during the fold
struct BucketAcc {
    index: i64,
    columns: BTreeMap<String, ColumnAcc>,
}

impl BucketAcc {
    fn new(index: i64) -> Self {
        Self {
            index,
            columns: BTreeMap::new(),
        }
    }

    fn push(&mut self, row: &Row, agg: Aggregation) {
        for (name, value) in &row.values {
            let acc = self
                .columns
                .entry(name.clone())
                .or_insert_with(|| ColumnAcc::new(agg));
            if let Some(value) = value {
                acc.push(row.timestamp, *value);
            }
        }
    }

    fn finish(self, sensor: &str, asset: &str, start: i64, width: i64) -> Row {
        let values = self
            .columns
            .into_iter()
            .map(|(name, acc)| (name, acc.finish()))
            .collect();
        Row {
            timestamp: start + self.index * width,
            sensor: sensor.to_string(),
            asset: asset.to_string(),
            values,
        }
    }
}

/// Aggregate sorted rows into fixed-width buckets.
///
/// `rows` must be sorted by `(sensor, asset, timestamp)` with every timestamp
/// at or after `start`; the reader guarantees both. `Aggregation::Raw` is the
/// identity.
pub fn aggregate(rows: Vec<Row>, start: i64, bucket_width: i64, agg: Aggregation) -> Vec<Row> {
    if agg == Aggregation::Raw || rows.is_empty() {
        return rows;
    }
    debug_assert!(bucket_width > 0);

    let input_len = rows.len();
    let mut out = Vec::new();
    let mut current_group: Option<(String, String)> = None;
    let mut current_bucket: Option<BucketAcc> = None;

    for row in &rows {
        let bucket_index = (row.timestamp - start) / bucket_width;
        let group_changed = match &current_group {
            Some((sensor, asset)) => sensor != &row.sensor || asset != &row.asset,
            None => true,
        };

        let bucket_changed = matches!(&current_bucket, Some(b) if b.index != bucket_index);
        if group_changed || bucket_changed {
            if let (Some(bucket), Some((sensor, asset))) =
                (current_bucket.take(), current_group.as_ref())
            {
                out.push(bucket.finish(sensor, asset, start, bucket_width));
            }
            if group_changed {
                current_group = Some((row.sensor.clone(), row.asset.clone()));
            }
            current_bucket = Some(BucketAcc::new(bucket_index));
        }

        if let Some(bucket) = &mut current_bucket {
            bucket.push(row, agg);
        }
    }

    if let (Some(bucket), Some((sensor, asset))) = (current_bucket, current_group.as_ref()) {
        out.push(bucket.finish(sensor, asset, start, bucket_width));
    }

    debug!(
        input_rows = input_len,
        output_rows = out.len(),
        aggregation = %agg,
        "aggregated rows into buckets"
    );
    out
}
