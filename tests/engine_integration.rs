//! End-to-end tests for the query engine
//!
//! These tests drive the full pipeline against Parquet fixtures in an
//! in-memory object store: tier selection, parallel partition reads,
//! aggregation, point-budget truncation, caching, and backend failover.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arrow::array::{Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use sensorquery::error::StorageError;
use sensorquery::storage::backend::BackendHealth;
use sensorquery::types::{NANOS_PER_HOUR, NANOS_PER_MIN, NANOS_PER_SEC};
use sensorquery::{
    Aggregation, Backend, Config, ErrorKind, Query, QueryEngine, QueryEngineBuilder, StorageMode,
    TimeRange,
};

// ============================================================================
// Fixtures
// ============================================================================

fn ts(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> i64 {
    Utc.with_ymd_and_hms(y, m, d, h, min, s)
        .unwrap()
        .timestamp_nanos_opt()
        .unwrap()
}

/// Build a partition batch with `timestamp`, `asset_id`, and one
/// `temperature` column.
fn partition_batch(asset: &str, timestamps: &[i64], temperatures: &[f64]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("timestamp", DataType::Int64, false),
        Field::new("asset_id", DataType::Utf8, false),
        Field::new("temperature", DataType::Float64, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(timestamps.to_vec())),
            Arc::new(StringArray::from(vec![asset; timestamps.len()])),
            Arc::new(Float64Array::from(temperatures.to_vec())),
        ],
    )
    .unwrap()
}

fn to_parquet(batch: &RecordBatch) -> Bytes {
    let mut buffer = Vec::new();
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props)).unwrap();
    writer.write(batch).unwrap();
    writer.close().unwrap();
    Bytes::from(buffer)
}

async fn put_partition(store: &Arc<InMemory>, path: &str, batch: &RecordBatch) {
    store
        .put(&Path::from(path), to_parquet(batch).to_vec().into())
        .await
        .unwrap();
}

/// One raw-tier hour of 1 Hz samples at `path`, starting at `hour_start`.
async fn seed_raw_hour(store: &Arc<InMemory>, asset: &str, path: &str, hour_start: i64) {
    let timestamps: Vec<i64> = (0..3_600).map(|i| hour_start + i * NANOS_PER_SEC).collect();
    let temps: Vec<f64> = (0..3_600).map(|i| 20.0 + (i % 60) as f64 * 0.1).collect();
    put_partition(store, path, &partition_batch(asset, &timestamps, &temps)).await;
}

fn engine_over(store: Arc<InMemory>) -> QueryEngine {
    let mut config = Config::default();
    config.storage.storage_mode = StorageMode::PrimaryOnly;
    QueryEngineBuilder::new(config)
        .with_primary(Arc::new(sensorquery::ObjectStoreBackend::new(
            "primary", store,
        )))
        .build()
        .unwrap()
}

/// Backend that fails every `open` transiently `failures` times before
/// delegating, simulating an object store returning 503s.
struct FailingBackend {
    inner: sensorquery::ObjectStoreBackend,
    failures: AtomicU32,
}

#[async_trait]
impl Backend for FailingBackend {
    fn backend_id(&self) -> &str {
        "failing-primary"
    }

    async fn open(&self, path: &str) -> Result<Bytes, StorageError> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(StorageError::ObjectStore(Box::new(
                object_store::Error::Generic {
                    store: "failing",
                    source: "503 service unavailable".into(),
                },
            )));
        }
        self.inner.open(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        self.inner.exists(path).await
    }

    async fn health(&self) -> BackendHealth {
        self.inner.health().await
    }
}

// ============================================================================
// Raw tier and point budget
// ============================================================================

#[tokio::test]
async fn raw_hour_within_budget_is_complete_and_untruncated() {
    let store = Arc::new(InMemory::new());
    let h0 = ts(2024, 1, 1, 0, 0, 0);
    seed_raw_hour(&store, "asset1", "asset1/2024/01/01/00/s1.parquet", h0).await;
    let engine = engine_over(store);

    let query = Query::builder(TimeRange::new_unchecked(h0, h0 + NANOS_PER_HOUR))
        .sensor("s1")
        .max_points(3_600)
        .raw()
        .build();
    let result = engine.execute(query).await.unwrap();

    assert_eq!(result.data.len(), 3_600);
    assert!(!result.metadata.truncated);
    assert!(!result.metadata.cache_hit);
    assert_eq!(result.metadata.tier_used, sensorquery::Tier::Raw);
    assert_eq!(result.metadata.bucket_width_ns, NANOS_PER_SEC);

    // Invariant: every timestamp lies in [start, actual_end)
    assert!(result
        .data
        .rows
        .iter()
        .all(|r| r.timestamp >= h0 && r.timestamp < result.metadata.actual_end));
}

#[tokio::test]
async fn raw_hour_over_budget_returns_prefix_and_truncates() {
    let store = Arc::new(InMemory::new());
    let h0 = ts(2024, 1, 1, 0, 0, 0);
    seed_raw_hour(&store, "asset1", "asset1/2024/01/01/00/s1.parquet", h0).await;
    let engine = engine_over(store);

    let query = Query::builder(TimeRange::new_unchecked(h0, h0 + NANOS_PER_HOUR))
        .sensor("s1")
        .max_points(100)
        .raw()
        .build();
    let result = engine.execute(query).await.unwrap();

    assert_eq!(result.data.len(), 100);
    assert!(result.metadata.truncated);
    // actual_end = start + floor(100 / 1) seconds = 00:01:40
    assert_eq!(result.metadata.actual_end, ts(2024, 1, 1, 0, 1, 40));
    assert!(result
        .data
        .rows
        .iter()
        .all(|r| r.timestamp < result.metadata.actual_end));
}

#[tokio::test]
async fn missing_partitions_yield_empty_result_not_error() {
    let store = Arc::new(InMemory::new());
    let h0 = ts(2024, 1, 1, 0, 0, 0);
    // Sensor exists, but only for a different hour than we query.
    seed_raw_hour(&store, "asset1", "asset1/2024/01/01/00/s1.parquet", h0).await;
    let engine = engine_over(store);

    let query = Query::builder(TimeRange::new_unchecked(
        h0 + 5 * NANOS_PER_HOUR,
        h0 + 6 * NANOS_PER_HOUR,
    ))
    .sensor("s1")
    .raw()
    .build();
    let result = engine.execute(query).await.unwrap();
    assert!(result.data.is_empty());
    assert!(!result.metadata.truncated);
}

// ============================================================================
// Aggregated tiers
// ============================================================================

#[tokio::test]
async fn two_sensor_day_at_288_points_aggregates_to_10m_buckets() {
    let store = Arc::new(InMemory::new());
    let day = ts(2024, 1, 1, 0, 0, 0);

    // Minute-tier partitions: one file per (asset, sensor, day), 1440 samples.
    let timestamps: Vec<i64> = (0..1_440).map(|i| day + i * NANOS_PER_MIN).collect();
    for sensor in ["s1", "s2"] {
        let temps: Vec<f64> = (0..1_440).map(|i| (i % 10) as f64).collect();
        put_partition(
            &store,
            &format!("asset1/2024/01/01/{}.parquet", sensor),
            &partition_batch("asset1", &timestamps, &temps),
        )
        .await;
    }
    let engine = engine_over(store);

    let range = TimeRange::new_unchecked(day, day + 24 * NANOS_PER_HOUR);
    let query = Query::builder(range)
        .sensors(["s1", "s2"])
        .max_points(288)
        .aggregation(Aggregation::Mean)
        .build();
    let result = engine.execute(query).await.unwrap();

    assert_eq!(result.metadata.bucket_width_ns, 10 * NANOS_PER_MIN);
    assert_eq!(result.metadata.tier_used, sensorquery::Tier::Minute);
    assert_eq!(result.data.len(), 288);
    assert!(!result.metadata.truncated);

    // 144 buckets per sensor, bucket timestamps on the 10-minute grid
    let s1_rows: Vec<_> = result
        .data
        .rows
        .iter()
        .filter(|r| r.sensor == "s1")
        .collect();
    assert_eq!(s1_rows.len(), 144);
    assert!(s1_rows
        .iter()
        .all(|r| (r.timestamp - day) % (10 * NANOS_PER_MIN) == 0));

    // Strictly ascending within the group
    assert!(s1_rows.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    // mean of 0..=9 repeating is 4.5
    let value = s1_rows[0].values["temperature"].unwrap().as_f64();
    assert!((value - 4.5).abs() < 1e-9);
}

#[tokio::test]
async fn two_week_query_uses_hour_tier() {
    let store = Arc::new(InMemory::new());
    let start = ts(2024, 1, 1, 0, 0, 0);

    // Hour-tier partition: one file per (asset, sensor, month), hourly rows.
    let timestamps: Vec<i64> = (0..14 * 24).map(|i| start + i * NANOS_PER_HOUR).collect();
    let temps: Vec<f64> = (0..14 * 24).map(|i| i as f64).collect();
    put_partition(
        &store,
        "asset1/2024/01/s1.parquet",
        &partition_batch("asset1", &timestamps, &temps),
    )
    .await;
    let engine = engine_over(store);

    let range = TimeRange::new_unchecked(start, start + 14 * 24 * NANOS_PER_HOUR);
    let query = Query::builder(range)
        .sensor("s1")
        .max_points(10_000)
        .aggregation(Aggregation::Mean)
        .build();
    let result = engine.execute(query).await.unwrap();

    assert_eq!(result.metadata.tier_used, sensorquery::Tier::Hour);
    assert!(result.data.len() <= 336);
    assert!(result.metadata.bucket_width_ns >= NANOS_PER_HOUR);
}

#[tokio::test]
async fn asset_filter_restricts_results() {
    let store = Arc::new(InMemory::new());
    let h0 = ts(2024, 1, 1, 0, 0, 0);
    seed_raw_hour(&store, "asset1", "asset1/2024/01/01/00/s1.parquet", h0).await;
    seed_raw_hour(&store, "asset2", "asset2/2024/01/01/00/s1.parquet", h0).await;
    let engine = engine_over(store);

    let range = TimeRange::new_unchecked(h0, h0 + NANOS_PER_HOUR);
    let all = engine
        .execute(
            Query::builder(range)
                .sensor("s1")
                .max_points(100_000)
                .raw()
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(all.data.len(), 7_200); // both assets

    let scoped = engine
        .execute(
            Query::builder(range)
                .sensor("s1")
                .asset("asset2")
                .max_points(100_000)
                .raw()
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(scoped.data.len(), 3_600);
    assert!(scoped.data.rows.iter().all(|r| r.asset == "asset2"));
}

// ============================================================================
// Caching
// ============================================================================

#[tokio::test]
async fn repeated_query_hits_cache_with_identical_payload() {
    let store = Arc::new(InMemory::new());
    let h0 = ts(2024, 1, 1, 0, 0, 0);
    seed_raw_hour(&store, "asset1", "asset1/2024/01/01/00/s1.parquet", h0).await;
    let engine = engine_over(store);

    let build = || {
        Query::builder(TimeRange::new_unchecked(h0, h0 + NANOS_PER_HOUR))
            .sensor("s1")
            .max_points(500)
            .aggregation(Aggregation::Max)
            .build()
    };

    let first = engine.execute(build()).await.unwrap();
    assert!(!first.metadata.cache_hit);

    let second = engine.execute(build()).await.unwrap();
    assert!(second.metadata.cache_hit);
    assert_eq!(first.data.rows, second.data.rows);
    assert_eq!(first.metadata.tier_used, second.metadata.tier_used);
    assert_eq!(
        first.metadata.bucket_width_ns,
        second.metadata.bucket_width_ns
    );

    let stats = engine.stats();
    assert_eq!(stats.query_count, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
    assert!(stats.hit_rate > 0.4 && stats.hit_rate < 0.6);
}

#[tokio::test]
async fn clear_cache_forces_recomputation() {
    let store = Arc::new(InMemory::new());
    let h0 = ts(2024, 1, 1, 0, 0, 0);
    seed_raw_hour(&store, "asset1", "asset1/2024/01/01/00/s1.parquet", h0).await;
    let engine = engine_over(store);

    let build = || {
        Query::builder(TimeRange::new_unchecked(h0, h0 + NANOS_PER_HOUR))
            .sensor("s1")
            .max_points(500)
            .build()
    };

    let _ = engine.execute(build()).await.unwrap();
    engine.clear_cache();
    let after = engine.execute(build()).await.unwrap();
    assert!(!after.metadata.cache_hit);
}

#[tokio::test]
async fn disabled_cache_never_reports_hits() {
    let store = Arc::new(InMemory::new());
    let h0 = ts(2024, 1, 1, 0, 0, 0);
    seed_raw_hour(&store, "asset1", "asset1/2024/01/01/00/s1.parquet", h0).await;

    let mut config = Config::default();
    config.storage.storage_mode = StorageMode::PrimaryOnly;
    config.cache.cache_enabled = false;
    let engine = QueryEngineBuilder::new(config)
        .with_primary(Arc::new(sensorquery::ObjectStoreBackend::new(
            "primary", store,
        )))
        .build()
        .unwrap();

    let build = || {
        Query::builder(TimeRange::new_unchecked(h0, h0 + NANOS_PER_HOUR))
            .sensor("s1")
            .max_points(500)
            .build()
    };
    let _ = engine.execute(build()).await.unwrap();
    let second = engine.execute(build()).await.unwrap();
    assert!(!second.metadata.cache_hit);
}

// ============================================================================
// Failover
// ============================================================================

#[tokio::test]
async fn failing_primary_falls_back_to_secondary_transparently() {
    let h0 = ts(2024, 1, 1, 0, 0, 0);

    // Secondary holds the data; primary 503s a few times per partition open.
    let secondary_store = Arc::new(InMemory::new());
    seed_raw_hour(
        &secondary_store,
        "asset1",
        "asset1/2024/01/01/00/s1.parquet",
        h0,
    )
    .await;

    let secondary_only = engine_over(Arc::clone(&secondary_store));
    let build = || {
        Query::builder(TimeRange::new_unchecked(h0, h0 + NANOS_PER_HOUR))
            .sensor("s1")
            .max_points(200)
            .aggregation(Aggregation::Mean)
            .build()
    };
    let expected = secondary_only.execute(build()).await.unwrap();

    let mut config = Config::default();
    config.storage.storage_mode = StorageMode::Failover;
    let failing = FailingBackend {
        inner: sensorquery::ObjectStoreBackend::new("inner", Arc::new(InMemory::new())),
        failures: AtomicU32::new(3),
    };
    let engine = QueryEngineBuilder::new(config)
        .with_primary(Arc::new(failing))
        .with_secondary(Arc::new(sensorquery::ObjectStoreBackend::new(
            "secondary",
            secondary_store,
        )))
        .build()
        .unwrap();

    let result = engine.execute(build()).await.unwrap();
    assert!(!result.metadata.cache_hit);
    assert_eq!(result.data.rows, expected.data.rows);
}

// ============================================================================
// Validation and discovery
// ============================================================================

#[tokio::test]
async fn degenerate_range_is_invalid_time_range() {
    let store = Arc::new(InMemory::new());
    let h0 = ts(2024, 1, 1, 0, 0, 0);
    seed_raw_hour(&store, "asset1", "asset1/2024/01/01/00/s1.parquet", h0).await;
    let engine = engine_over(store);

    let query = Query {
        sensors: vec!["s1".to_string()],
        assets: None,
        range: TimeRange::new_unchecked(h0, h0),
        interval: None,
        max_points: None,
        aggregation: Aggregation::Mean,
    };
    let err = engine.execute(query).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTimeRange);
    assert_eq!(err.kind().as_str(), "INVALID_TIME_RANGE");
}

#[tokio::test]
async fn unknown_sensor_is_invalid_parameter() {
    let store = Arc::new(InMemory::new());
    let h0 = ts(2024, 1, 1, 0, 0, 0);
    seed_raw_hour(&store, "asset1", "asset1/2024/01/01/00/s1.parquet", h0).await;
    let engine = engine_over(store);

    let query = Query::builder(TimeRange::new_unchecked(h0, h0 + NANOS_PER_HOUR))
        .sensor("does_not_exist")
        .build();
    let err = engine.execute(query).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    assert_eq!(err.parameter(), Some("sensors"));
}

#[tokio::test]
async fn discovery_lists_sensors_assets_and_coverage() {
    let store = Arc::new(InMemory::new());
    let h0 = ts(2024, 1, 1, 0, 0, 0);
    seed_raw_hour(&store, "asset1", "asset1/2024/01/01/00/s1.parquet", h0).await;
    seed_raw_hour(
        &store,
        "asset2",
        "asset2/2024/01/01/03/s2.parquet",
        h0 + 3 * NANOS_PER_HOUR,
    )
    .await;
    let engine = engine_over(store);

    assert_eq!(
        engine.available_assets().await.unwrap(),
        vec!["asset1".to_string(), "asset2".to_string()]
    );
    assert_eq!(
        engine.available_sensors(None).await.unwrap(),
        vec!["s1".to_string(), "s2".to_string()]
    );
    assert_eq!(
        engine
            .available_sensors(Some(&"asset2".to_string()))
            .await
            .unwrap(),
        vec!["s2".to_string()]
    );

    let coverage = engine
        .time_range_of(&["s1".to_string(), "s2".to_string()], None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(coverage.start, h0);
    assert_eq!(coverage.end, h0 + 4 * NANOS_PER_HOUR);
}

#[tokio::test]
async fn determinism_over_immutable_partitions() {
    let store = Arc::new(InMemory::new());
    let h0 = ts(2024, 1, 1, 0, 0, 0);
    seed_raw_hour(&store, "asset1", "asset1/2024/01/01/00/s1.parquet", h0).await;
    let engine = engine_over(store);

    let build = || {
        Query::builder(TimeRange::new_unchecked(h0, h0 + NANOS_PER_HOUR))
            .sensor("s1")
            .max_points(120)
            .aggregation(Aggregation::Last)
            .build()
    };

    let first = engine.execute(build()).await.unwrap();
    engine.clear_cache();
    let second = engine.execute(build()).await.unwrap();
    assert!(!second.metadata.cache_hit);
    assert_eq!(first.data.rows, second.data.rows);
}
