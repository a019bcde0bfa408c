//! Query engine
//!
//! Orchestrates the full query path: validate -> plan -> cache -> read ->
//! aggregate -> truncate -> answer. The engine is an injected value owning
//! its cache, backend registry, locator, and reader; construction is
//! explicit and there is no process-wide mutable state behind it.
//!
//! # Concurrency
//!
//! Each query runs on its own task. Admission is bounded by a semaphore
//! (`max_concurrent_queries`); waits at the semaphore count against the
//! query deadline and surface as `CAPACITY_EXCEEDED` when they exhaust it.
//! Partition reads fan out inside the reader. Concurrent identical misses
//! coalesce through the cache's single-flight table.

use crate::aggregate::aggregate;
use crate::cache::{CacheConfig, CachedResult, Flight, FlightResult, QueryCache};
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::query::planner::{plan, Fingerprint, Plan};
use crate::query::request::Query;
use crate::storage::backend::{Backend, BackendHealth, BackendRegistry};
use crate::storage::locator::PartitionLocator;
use crate::storage::reader::{PartitionReader, ReadOptions};
use crate::types::{AssetId, DataSet, QueryMetadata, SensorId, Tier, TimeRange};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

/// A query answer: shared immutable rows plus always-populated metadata
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Result rows, shared with the cache
    pub data: Arc<DataSet>,
    /// Execution metadata
    pub metadata: QueryMetadata,
}

/// Builder wiring backends and configuration into a [`QueryEngine`]
#[must_use = "builders do nothing until .build() is called"]
pub struct QueryEngineBuilder {
    config: Config,
    primary: Option<Arc<dyn Backend>>,
    secondary: Option<Arc<dyn Backend>>,
}

impl QueryEngineBuilder {
    /// Start a builder with the given configuration
    pub fn new(config: Config) -> Self {
        Self {
            config,
            primary: None,
            secondary: None,
        }
    }

    /// Set the primary backend
    pub fn with_primary(mut self, backend: Arc<dyn Backend>) -> Self {
        self.primary = Some(backend);
        self
    }

    /// Set the secondary backend
    pub fn with_secondary(mut self, backend: Arc<dyn Backend>) -> Self {
        self.secondary = Some(backend);
        self
    }

    /// Validate the configuration and assemble the engine
    pub fn build(self) -> Result<QueryEngine> {
        self.config.validate()?;

        let registry = Arc::new(BackendRegistry::from_mode(
            self.config.storage.storage_mode,
            self.primary,
            self.secondary,
        )?);

        let locator = Arc::new(PartitionLocator::new(Arc::clone(&registry)));

        let reader = PartitionReader::new(
            Arc::clone(&registry),
            ReadOptions {
                parallelism: self.config.query.partition_read_parallelism,
                per_partition_deadline: Duration::from_secs(
                    self.config.query.per_partition_deadline_secs,
                ),
            },
        );

        let cache_config = CacheConfig::default()
            .with_max_size(self.config.cache.cache_size_bytes)
            .with_ttl(Duration::from_secs(self.config.cache.cache_ttl_seconds));
        let cache_config = if self.config.cache.cache_enabled {
            cache_config
        } else {
            cache_config.disabled()
        };

        let admission = Arc::new(Semaphore::new(self.config.query.max_concurrent_queries));

        info!(
            storage_mode = ?self.config.storage.storage_mode,
            backends = ?registry.backend_ids(),
            cache_enabled = self.config.cache.cache_enabled,
            "query engine initialized"
        );

        Ok(QueryEngine {
            cache: QueryCache::new(cache_config),
            config: self.config,
            registry,
            locator,
            reader,
            admission,
            counters: EngineCounters::default(),
            started_at: Instant::now(),
        })
    }
}

#[derive(Default)]
struct EngineCounters {
    query_count: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    raw_queries: AtomicU64,
    minute_queries: AtomicU64,
    hour_queries: AtomicU64,
    total_execution_micros: AtomicU64,
}

/// Aggregate engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Queries accepted since start
    pub query_count: u64,
    /// Queries answered from cache
    pub cache_hits: u64,
    /// Queries that had to read storage
    pub cache_misses: u64,
    /// Hit fraction, 0.0 when no queries ran
    pub hit_rate: f64,
    /// Mean execution time
    pub avg_execution_ms: f64,
    /// Queries served per tier
    pub tier_counts: TierCounts,
    /// Approximate cache footprint
    pub cache_size_bytes: u64,
    /// Cached entry count
    pub cache_entries: usize,
    /// Seconds since engine construction
    pub uptime_seconds: u64,
}

/// Per-tier query counts
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierCounts {
    /// Raw-tier queries
    pub raw: u64,
    /// Minute-tier queries
    pub minute: u64,
    /// Hour-tier queries
    pub hour: u64,
}

/// Engine health report
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    /// True when every backend probe passed and the cache is within bounds
    pub ok: bool,
    /// Per-backend probe results
    pub backend_statuses: Vec<BackendHealth>,
    /// Whether the cache footprint is within its budget envelope
    pub cache_ok: bool,
}

/// The smart query core
pub struct QueryEngine {
    config: Config,
    registry: Arc<BackendRegistry>,
    locator: Arc<PartitionLocator>,
    reader: PartitionReader,
    cache: QueryCache,
    admission: Arc<Semaphore>,
    counters: EngineCounters,
    started_at: Instant,
}

impl QueryEngine {
    /// Execute a query with the configured default deadline
    pub async fn execute(&self, query: Query) -> Result<QueryResult> {
        let deadline = Duration::from_secs(self.config.query.query_deadline_secs);
        self.execute_with_deadline(query, deadline).await
    }

    /// Execute a query with an explicit deadline
    pub async fn execute_with_deadline(
        &self,
        query: Query,
        deadline: Duration,
    ) -> Result<QueryResult> {
        let started = Instant::now();
        let result = self.execute_inner(query, deadline, started).await;

        let elapsed = started.elapsed();
        self.counters.query_count.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_execution_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        match &result {
            Ok(answer) => {
                self.count_tier(answer.metadata.tier_used);
                crate::metrics::record_query(
                    answer.metadata.tier_used.as_str(),
                    true,
                    elapsed.as_secs_f64(),
                );
            }
            Err(e) => {
                warn!(error = %e, code = e.kind().as_str(), "query failed");
                crate::metrics::record_query("none", false, elapsed.as_secs_f64());
            }
        }
        result
    }

    async fn execute_inner(
        &self,
        query: Query,
        deadline: Duration,
        started: Instant,
    ) -> Result<QueryResult> {
        // 1. Validate and canonicalize (pure, no admission needed).
        let canonical = query.canonicalize(&self.config)?;

        // Admission: waits count against the deadline.
        let _permit = match tokio::time::timeout(deadline, self.admission.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(Error::Configuration(
                    "admission semaphore closed".to_string(),
                ))
            }
            Err(_) => {
                return Err(Error::CapacityExceeded {
                    waiting: self.config.query.max_concurrent_queries,
                })
            }
        };

        // Sensors must be known to storage; skip the check when discovery
        // itself is unavailable so a listing hiccup cannot fail every query.
        if let Some(known) = self.locator.known_sensors().await {
            for sensor in &canonical.sensors {
                if !known.contains(sensor) {
                    return Err(Error::InvalidParameter {
                        parameter: "sensors".to_string(),
                        message: format!("unknown sensor '{}'", sensor),
                    });
                }
            }
        }

        // 2-3. Plan and fingerprint.
        let plan = plan(&canonical, &self.config.tiers);
        let fingerprint = Fingerprint::from_plan(&plan);

        // 4. Cache lookup.
        if let Some(hit) = self.cache.get(fingerprint) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = %fingerprint, "cache hit");
            return Ok(self.answer(hit, true, started));
        }
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);

        // 5. Single-flight registration.
        let remaining = deadline.saturating_sub(started.elapsed());
        match self.cache.begin_flight(fingerprint) {
            Flight::Waiter(rx) => {
                debug!(fingerprint = %fingerprint, "waiting on in-flight query");
                let shared = wait_for_flight(rx, remaining, deadline).await?;
                Ok(self.answer(shared, true, started))
            }
            Flight::Leader(guard) => {
                match tokio::time::timeout(remaining, self.run_plan(&plan)).await {
                    Ok(Ok(computed)) => {
                        // 10. Publish, complete the flight, answer.
                        self.cache.insert(fingerprint, computed.clone());
                        guard.complete(Ok(computed.clone()));
                        Ok(self.answer(computed, false, started))
                    }
                    Ok(Err(e)) => {
                        guard.complete(Err((e.kind(), e.to_string())));
                        Err(e)
                    }
                    Err(_) => {
                        let e = Error::DeadlineExceeded {
                            deadline_ms: deadline.as_millis() as u64,
                        };
                        guard.complete(Err((e.kind(), e.to_string())));
                        Err(e)
                    }
                }
            }
        }
    }

    /// Steps 6-9: read the plan's partitions, aggregate, and cap the output.
    async fn run_plan(&self, plan: &Plan) -> Result<CachedResult> {
        // 7. Enumerate and read partitions, scoped to the effective range.
        let partitions = self
            .locator
            .locate(
                &plan.sensors,
                plan.assets.as_deref(),
                plan.effective_range,
                plan.tier,
            )
            .await?;
        let read = self.reader.read(partitions, plan.effective_range).await?;
        let DataSet { rows, warnings } = read;

        // 8. Aggregate unless raw.
        let mut rows = aggregate(
            rows,
            plan.effective_range.start,
            plan.bucket_width_ns,
            plan.aggregation,
        );

        // 6/9. Budget: the raw prefix shrink already happened in the plan;
        // anything still over budget loses rows from the tail.
        let mut truncated = plan.truncated;
        let mut actual_end = plan.effective_range.end;
        if rows.len() > plan.max_points {
            rows.truncate(plan.max_points);
            truncated = true;
            let max_kept = rows.iter().map(|r| r.timestamp).max();
            if let Some(ts) = max_kept {
                actual_end = actual_end.min(ts + plan.bucket_width_ns);
            }
        }

        Ok(CachedResult {
            data: Arc::new(DataSet { rows, warnings }),
            tier: plan.tier,
            bucket_width_ns: plan.bucket_width_ns,
            truncated,
            actual_end,
            resolution_promoted: plan.resolution_promoted,
        })
    }

    fn answer(&self, cached: CachedResult, cache_hit: bool, started: Instant) -> QueryResult {
        QueryResult {
            metadata: QueryMetadata {
                cache_hit,
                tier_used: cached.tier,
                bucket_width_ns: cached.bucket_width_ns,
                execution_time_ms: started.elapsed().as_secs_f64() * 1_000.0,
                truncated: cached.truncated,
                actual_end: cached.actual_end,
                resolution_promoted: cached.resolution_promoted,
            },
            data: cached.data,
        }
    }

    fn count_tier(&self, tier: Tier) {
        let counter = match tier {
            Tier::Raw => &self.counters.raw_queries,
            Tier::Minute => &self.counters.minute_queries,
            Tier::Hour => &self.counters.hour_queries,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    // =========================================================================
    // Management operations
    // =========================================================================

    /// Drop all cached results and the asset-discovery cache.
    pub fn clear_cache(&self) {
        self.cache.clear();
        self.locator.invalidate_asset_cache();
        info!("cleared result cache and discovery cache");
    }

    /// Aggregate engine statistics.
    pub fn stats(&self) -> EngineStats {
        let query_count = self.counters.query_count.load(Ordering::Relaxed);
        let cache_hits = self.counters.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.counters.cache_misses.load(Ordering::Relaxed);
        let total_micros = self.counters.total_execution_micros.load(Ordering::Relaxed);
        let cache_stats = self.cache.stats();

        let lookups = cache_hits + cache_misses;
        EngineStats {
            query_count,
            cache_hits,
            cache_misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                cache_hits as f64 / lookups as f64
            },
            avg_execution_ms: if query_count == 0 {
                0.0
            } else {
                total_micros as f64 / query_count as f64 / 1_000.0
            },
            tier_counts: TierCounts {
                raw: self.counters.raw_queries.load(Ordering::Relaxed),
                minute: self.counters.minute_queries.load(Ordering::Relaxed),
                hour: self.counters.hour_queries.load(Ordering::Relaxed),
            },
            cache_size_bytes: cache_stats.size_bytes,
            cache_entries: cache_stats.entries,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Probe the backends and report overall health.
    pub async fn health(&self) -> EngineHealth {
        let backend_statuses = self.registry.health().await;
        let cache_stats = self.cache.stats();
        let cache_ok = cache_stats.size_bytes
            <= (self.config.cache.cache_size_bytes as f64 * 1.25) as u64;
        let ok = backend_statuses.iter().all(|s| s.ok) && cache_ok;
        EngineHealth {
            ok,
            backend_statuses,
            cache_ok,
        }
    }

    /// Sensors currently present in storage.
    pub async fn available_sensors(&self, asset: Option<&AssetId>) -> Result<Vec<SensorId>> {
        self.locator.available_sensors(asset).await
    }

    /// Assets currently present in storage.
    pub async fn available_assets(&self) -> Result<Vec<AssetId>> {
        self.locator.available_assets().await
    }

    /// Conservative time coverage of the given sensors, from partition paths.
    pub async fn time_range_of(
        &self,
        sensors: &[SensorId],
        assets: Option<&[AssetId]>,
    ) -> Result<Option<TimeRange>> {
        self.locator.time_range_of(sensors, assets).await
    }
}

/// Wait on another caller's in-flight computation with our own deadline.
async fn wait_for_flight(
    mut rx: watch::Receiver<Option<FlightResult>>,
    remaining: Duration,
    deadline: Duration,
) -> Result<CachedResult> {
    let wait = async {
        loop {
            let settled = rx.borrow().clone();
            if let Some(result) = settled {
                return match result {
                    Ok(cached) => Ok(cached),
                    Err((kind, message)) => Err(Error::from_shared(kind, message)),
                };
            }
            if rx.changed().await.is_err() {
                return Err(Error::from_shared(
                    ErrorKind::ReadFailed,
                    "shared query computation was cancelled",
                ));
            }
        }
    };
    match tokio::time::timeout(remaining, wait).await {
        Ok(result) => result,
        Err(_) => Err(Error::DeadlineExceeded {
            deadline_ms: deadline.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::ObjectStoreBackend;
    use crate::types::{Aggregation, NANOS_PER_SEC};

    fn engine_with_memory_backend() -> QueryEngine {
        let mut config = Config::default();
        config.storage.storage_mode = crate::config::StorageMode::PrimaryOnly;
        QueryEngineBuilder::new(config)
            .with_primary(Arc::new(ObjectStoreBackend::in_memory("primary")))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_backend_for_mode() {
        let mut config = Config::default();
        config.storage.storage_mode = crate::config::StorageMode::PrimaryOnly;
        assert!(QueryEngineBuilder::new(config).build().is_err());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = Config::default();
        config.query.max_concurrent_queries = 0;
        let result = QueryEngineBuilder::new(config)
            .with_primary(Arc::new(ObjectStoreBackend::in_memory("primary")))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invalid_queries_are_rejected_before_any_io() {
        let engine = engine_with_memory_backend();

        // start == end
        let query = Query {
            sensors: vec!["s1".to_string()],
            assets: None,
            range: TimeRange::new_unchecked(100, 100),
            interval: None,
            max_points: None,
            aggregation: Aggregation::Mean,
        };
        let err = engine.execute(query).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTimeRange);

        // empty sensors
        let query = Query::builder(TimeRange::new_unchecked(0, NANOS_PER_SEC)).build();
        let err = engine.execute(query).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[tokio::test]
    async fn test_stats_track_queries_and_uptime() {
        let engine = engine_with_memory_backend();
        let query = Query::builder(TimeRange::new_unchecked(0, NANOS_PER_SEC)).build();
        let _ = engine.execute(query).await;

        let stats = engine.stats();
        assert_eq!(stats.query_count, 1);
        assert_eq!(stats.cache_entries, 0);
    }

    #[tokio::test]
    async fn test_health_reports_backends() {
        let engine = engine_with_memory_backend();
        let health = engine.health().await;
        assert!(health.ok);
        assert!(health.cache_ok);
        assert_eq!(health.backend_statuses.len(), 1);
    }
}
