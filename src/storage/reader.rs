//! Columnar partition reader
//!
//! Loads a set of Parquet partitions in parallel through the backend
//! registry, applies column projection and the `[start, end)` row filter,
//! and concatenates results in stable `(sensor, asset, timestamp)` order.
//!
//! # Contract
//!
//! - timestamps are integer nanoseconds since epoch, interpreted as UTC;
//!   nanosecond precision is preserved end to end
//! - extra columns in a partition are ignored; missing optional columns
//!   report null
//! - a partition slower than the per-partition deadline is cancelled and
//!   treated as empty, with a warning recorded in the result
//! - a permanent decode error (schema mismatch, corrupt file) cancels the
//!   sibling reads and fails the whole read
//!
//! `sensor_id` is not a storage column; the reader injects it from the
//! partition path. `asset_id` is read from the column when present and falls
//! back to the path segment otherwise.

use crate::error::{Error, Result, StorageError};
use crate::storage::locator::PartitionRef;
use crate::types::{DataSet, Row, TimeRange, Value};
use arrow::array::{Array, Float64Array, Int64Array, StringArray, TimestampNanosecondArray};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ProjectionMask;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::backend::BackendRegistry;

/// Name of the mandatory time column
const TIMESTAMP_COLUMN: &str = "timestamp";

/// Name of the per-row asset column
const ASSET_COLUMN: &str = "asset_id";

/// Tuning for one read fan-out
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Upper bound on concurrently fetched partitions; the effective pool is
    /// `min(parallelism, |paths|)`
    pub parallelism: usize,
    /// Deadline for a single partition fetch
    pub per_partition_deadline: Duration,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            parallelism: 8,
            per_partition_deadline: Duration::from_secs(15),
        }
    }
}

/// What one partition contributed to the read
enum PartitionOutcome {
    Rows(Vec<Row>),
    Empty,
    TimedOut,
}

/// Parallel Parquet reader over the backend registry
pub struct PartitionReader {
    registry: Arc<BackendRegistry>,
    options: ReadOptions,
}

impl PartitionReader {
    /// Create a reader with the given fan-out options
    pub fn new(registry: Arc<BackendRegistry>, options: ReadOptions) -> Self {
        Self { registry, options }
    }

    /// Read all partitions, filter rows to `range`, and concatenate.
    ///
    /// The output is sorted by `(sensor, asset, timestamp)`; rows with equal
    /// timestamps keep partition path order, which makes `last` aggregation
    /// deterministic.
    pub async fn read(&self, partitions: Vec<PartitionRef>, range: TimeRange) -> Result<DataSet> {
        if partitions.is_empty() {
            return Ok(DataSet::empty());
        }

        let permits = self.options.parallelism.min(partitions.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let deadline = self.options.per_partition_deadline;

        let mut tasks: JoinSet<Result<(usize, PartitionOutcome)>> = JoinSet::new();
        let total = partitions.len();
        for (index, part) in partitions.into_iter().enumerate() {
            let registry = Arc::clone(&self.registry);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                // Semaphore closed only when the set is aborted; treat as cancelled.
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::from_shared(
                        crate::error::ErrorKind::ReadFailed,
                        "partition read cancelled",
                    ))?;
                let outcome = read_partition(&registry, &part, range, deadline).await?;
                Ok((index, outcome))
            });
        }

        let mut slots: Vec<Option<PartitionOutcome>> = Vec::new();
        slots.resize_with(total, || None);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((index, outcome))) => slots[index] = Some(outcome),
                Ok(Err(e)) => {
                    // Permanent failure: cancel the siblings and fail the read.
                    tasks.abort_all();
                    crate::metrics::record_partition_read("error");
                    return Err(e);
                }
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    tasks.abort_all();
                    return Err(Error::from_shared(
                        crate::error::ErrorKind::ReadFailed,
                        format!("partition read task failed: {}", join_err),
                    ));
                }
            }
        }

        let mut rows = Vec::new();
        let mut warnings = Vec::new();
        for (index, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(PartitionOutcome::Rows(mut r)) => {
                    crate::metrics::record_partition_read("ok");
                    rows.append(&mut r);
                }
                Some(PartitionOutcome::Empty) => {
                    crate::metrics::record_partition_read("empty");
                }
                Some(PartitionOutcome::TimedOut) => {
                    crate::metrics::record_partition_read("timeout");
                    warnings.push(format!(
                        "partition {} exceeded the per-partition deadline and was skipped",
                        index
                    ));
                }
                None => {}
            }
        }

        // Partition order is already deterministic; a stable sort on
        // (sensor, asset, timestamp) preserves it for equal keys.
        rows.sort_by(|a, b| {
            (&a.sensor, &a.asset, a.timestamp).cmp(&(&b.sensor, &b.asset, b.timestamp))
        });

        debug!(rows = rows.len(), warnings = warnings.len(), "read complete");
        Ok(DataSet { rows, warnings })
    }
}

/// Fetch and decode one partition.
async fn read_partition(
    registry: &BackendRegistry,
    part: &PartitionRef,
    range: TimeRange,
    deadline: Duration,
) -> Result<PartitionOutcome> {
    let fetched = match tokio::time::timeout(deadline, registry.open(&part.path)).await {
        Ok(result) => result?,
        Err(_) => {
            warn!(path = %part.path, "partition fetch timed out");
            return Ok(PartitionOutcome::TimedOut);
        }
    };

    let bytes = match fetched {
        Some(bytes) => bytes,
        None => return Ok(PartitionOutcome::Empty),
    };

    let rows = decode_partition(bytes, part, range).map_err(Error::ReadFailed)?;
    if rows.is_empty() {
        Ok(PartitionOutcome::Empty)
    } else {
        Ok(PartitionOutcome::Rows(rows))
    }
}

/// Decode a Parquet blob into filtered rows.
///
/// Projection keeps the timestamp column, the asset column, and every
/// numeric measurement column; everything else never leaves the decoder.
fn decode_partition(
    bytes: Bytes,
    part: &PartitionRef,
    range: TimeRange,
) -> std::result::Result<Vec<Row>, StorageError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes).map_err(|e| {
        StorageError::Parquet {
            path: part.path.clone(),
            source: Box::new(e),
        }
    })?;

    let schema = builder.schema().clone();
    let mut projected_indices = Vec::new();
    let mut has_timestamp = false;
    for (i, field) in schema.fields().iter().enumerate() {
        let keep = match field.name().as_str() {
            TIMESTAMP_COLUMN => {
                has_timestamp = true;
                true
            }
            ASSET_COLUMN => true,
            _ => matches!(
                field.data_type(),
                DataType::Int64 | DataType::Float64
            ),
        };
        if keep {
            projected_indices.push(i);
        }
    }
    if !has_timestamp {
        return Err(StorageError::SchemaMismatch {
            path: part.path.clone(),
            message: format!("required column '{}' is missing", TIMESTAMP_COLUMN),
        });
    }

    let mask = ProjectionMask::roots(builder.parquet_schema(), projected_indices);
    let reader = builder
        .with_projection(mask)
        .build()
        .map_err(|e| StorageError::Parquet {
            path: part.path.clone(),
            source: Box::new(e),
        })?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| StorageError::Arrow {
            path: part.path.clone(),
            source: Box::new(e),
        })?;
        decode_batch(&batch, part, range, &mut rows)?;
    }
    Ok(rows)
}

fn decode_batch(
    batch: &RecordBatch,
    part: &PartitionRef,
    range: TimeRange,
    rows: &mut Vec<Row>,
) -> std::result::Result<(), StorageError> {
    let schema = batch.schema();
    let ts_index = schema.index_of(TIMESTAMP_COLUMN).map_err(|_| {
        StorageError::SchemaMismatch {
            path: part.path.clone(),
            message: format!("required column '{}' is missing", TIMESTAMP_COLUMN),
        }
    })?;

    let ts_column = batch.column(ts_index);
    let timestamps: Vec<Option<i64>> =
        if let Some(a) = ts_column.as_any().downcast_ref::<Int64Array>() {
            (0..a.len())
                .map(|i| if a.is_null(i) { None } else { Some(a.value(i)) })
                .collect()
        } else if let Some(a) = ts_column.as_any().downcast_ref::<TimestampNanosecondArray>() {
            (0..a.len())
                .map(|i| if a.is_null(i) { None } else { Some(a.value(i)) })
                .collect()
        } else {
            return Err(StorageError::SchemaMismatch {
                path: part.path.clone(),
                message: format!(
                    "column '{}' must be int64 nanoseconds, found {}",
                    TIMESTAMP_COLUMN,
                    ts_column.data_type()
                ),
            });
        };

    let assets = schema
        .index_of(ASSET_COLUMN)
        .ok()
        .and_then(|i| batch.column(i).as_any().downcast_ref::<StringArray>().cloned());

    // (name, array) pairs for the measurement columns of this batch
    let mut measurements: Vec<(&str, &dyn Array)> = Vec::new();
    for (i, field) in schema.fields().iter().enumerate() {
        let name = field.name().as_str();
        if name == TIMESTAMP_COLUMN || name == ASSET_COLUMN {
            continue;
        }
        measurements.push((name, batch.column(i).as_ref()));
    }

    for row_idx in 0..batch.num_rows() {
        let ts = match timestamps[row_idx] {
            Some(ts) => ts,
            None => continue,
        };
        if !range.contains(ts) {
            continue;
        }

        let asset = assets
            .as_ref()
            .filter(|a| !a.is_null(row_idx))
            .map(|a| a.value(row_idx).to_string())
            .unwrap_or_else(|| part.asset.clone());

        let mut values = BTreeMap::new();
        for (name, column) in &measurements {
            let value = if column.is_null(row_idx) {
                None
            } else if let Some(a) = column.as_any().downcast_ref::<Int64Array>() {
                Some(Value::Int(a.value(row_idx)))
            } else if let Some(a) = column.as_any().downcast_ref::<Float64Array>() {
                Some(Value::Float(a.value(row_idx)))
            } else {
                None
            };
            values.insert((*name).to_string(), value);
        }

        rows.push(Row {
            timestamp: ts,
            sensor: part.sensor.clone(),
            asset,
            values,
        });
    }
    Ok(())
}
