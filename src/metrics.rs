//! Prometheus metrics for the query core
//!
//! Counters, histograms, and gauges for query execution, cache behavior,
//! and partition reads. Exposition is left to the embedding service;
//! `gather_metrics` renders the registry in text format.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};

lazy_static! {
    /// Queries executed, by tier and outcome
    pub static ref QUERIES_TOTAL: CounterVec = register_counter_vec!(
        "sensorquery_queries_total",
        "Total queries executed",
        &["tier", "status"]
    ).unwrap();

    /// Query latency by tier
    pub static ref QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "sensorquery_query_duration_seconds",
        "Query execution latency in seconds",
        &["tier"],
        vec![0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0]
    ).unwrap();

    /// Cache hits
    pub static ref CACHE_HITS: Counter = register_counter!(
        "sensorquery_cache_hits_total",
        "Total result cache hits"
    ).unwrap();

    /// Cache misses
    pub static ref CACHE_MISSES: Counter = register_counter!(
        "sensorquery_cache_misses_total",
        "Total result cache misses"
    ).unwrap();

    /// Cache evictions
    pub static ref CACHE_EVICTIONS: Counter = register_counter!(
        "sensorquery_cache_evictions_total",
        "Total result cache evictions"
    ).unwrap();

    /// Current cache size
    pub static ref CACHE_SIZE_BYTES: Gauge = register_gauge!(
        "sensorquery_cache_size_bytes",
        "Approximate bytes held by the result cache"
    ).unwrap();

    /// Partition reads by outcome
    pub static ref PARTITION_READS: CounterVec = register_counter_vec!(
        "sensorquery_partition_reads_total",
        "Partition read attempts by outcome",
        &["status"]
    ).unwrap();

    /// Backend retry attempts
    pub static ref BACKEND_RETRIES: Counter = register_counter!(
        "sensorquery_backend_retries_total",
        "Retries issued against transiently failing backends"
    ).unwrap();
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("metrics contain invalid UTF-8: {}", e))
}

/// Record a completed query
#[inline]
pub fn record_query(tier: &str, success: bool, duration_secs: f64) {
    let status = if success { "success" } else { "error" };
    QUERIES_TOTAL.with_label_values(&[tier, status]).inc();
    QUERY_DURATION
        .with_label_values(&[tier])
        .observe(duration_secs);
}

/// Record a cache lookup outcome
#[inline]
pub fn record_cache_lookup(hit: bool) {
    if hit {
        CACHE_HITS.inc();
    } else {
        CACHE_MISSES.inc();
    }
}

/// Record a partition read outcome: "ok", "empty", "timeout", or "error"
#[inline]
pub fn record_partition_read(status: &str) {
    PARTITION_READS.with_label_values(&[status]).inc();
}

/// Update the cache size gauge
#[inline]
pub fn update_cache_size(bytes: u64) {
    CACHE_SIZE_BYTES.set(bytes as f64);
}
