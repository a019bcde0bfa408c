//! SensorQuery - smart query core for tiered time-series sensor data
//!
//! This library answers interactive charting queries over columnar sensor
//! data with predictable sub-second latency:
//! - a tier-selection planner picks the cheapest storage tier (raw,
//!   per-minute, per-hour) that can serve the requested resolution
//! - a pluggable backend registry reads Parquet partitions with retry and
//!   cross-backend fallback
//! - an in-memory aggregator downsamples into fixed-width buckets under a
//!   hard point budget
//! - a bounded LRU+TTL cache with single-flight coalescing serves repeated
//!   queries
//!
//! The core is read-only over immutable partitions produced upstream; HTTP
//! surfaces, configuration loading, and process lifecycle live in the
//! embedding service.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod query;
pub mod storage;
pub mod types;

// Re-export main types
pub use config::{Config, StorageMode};
pub use error::{Error, ErrorKind, Result};
pub use query::{Query, QueryBuilder, QueryEngine, QueryEngineBuilder, QueryResult};
pub use storage::{Backend, BackendRegistry, ObjectStoreBackend};
pub use types::{Aggregation, AssetId, DataSet, QueryMetadata, Row, SensorId, Tier, TimeRange};
