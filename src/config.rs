//! Configuration management for the query core
//!
//! Provides TOML configuration file support with environment variable
//! overrides and sensible defaults. The engine is constructed from a
//! validated `Config`; there is no process-wide configuration state.

use serde::{Deserialize, Serialize};

/// Storage registry composition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Only the primary backend is consulted
    PrimaryOnly,
    /// Only the secondary backend is consulted
    SecondaryOnly,
    /// Primary first, secondary on not-found
    Failover,
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Storage registry composition
    #[serde(default)]
    pub storage: StorageSettings,

    /// Query limits and deadlines
    #[serde(default)]
    pub query: QuerySettings,

    /// Result cache sizing
    #[serde(default)]
    pub cache: CacheSettings,

    /// Tier selection thresholds
    #[serde(default)]
    pub tiers: TierSettings,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageSettings {
    /// Which backends the registry consults, and in what order
    #[serde(default = "default_storage_mode")]
    pub storage_mode: StorageMode,
}

/// Query engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuerySettings {
    /// Upper bound on `range.duration`, in hours
    #[serde(default = "default_max_query_duration_hours")]
    pub max_query_duration_hours: i64,

    /// Point budget used when a query omits `max_points`
    #[serde(default = "default_max_points")]
    pub default_max_points: usize,

    /// Hard ceiling on `max_points`; larger requests are clamped down
    #[serde(default = "default_absolute_max_points")]
    pub absolute_max_points: usize,

    /// Partition reads fanned out concurrently per query
    #[serde(default = "default_read_parallelism")]
    pub partition_read_parallelism: usize,

    /// Deadline for one partition read, in seconds
    #[serde(default = "default_per_partition_deadline_secs")]
    pub per_partition_deadline_secs: u64,

    /// Overall query deadline, in seconds
    #[serde(default = "default_query_deadline_secs")]
    pub query_deadline_secs: u64,

    /// Admission cap on concurrently executing queries
    #[serde(default = "default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,
}

/// Cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSettings {
    /// If false, the cache is a no-op
    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// Byte budget for cached payloads
    #[serde(default = "default_cache_size_bytes")]
    pub cache_size_bytes: usize,

    /// Entry TTL in seconds
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
}

/// Tier selector thresholds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierSettings {
    /// Queries up to this many hours may be served from the raw tier
    #[serde(default = "default_raw_tier_max_hours")]
    pub raw_tier_max_hours: i64,

    /// Queries up to this many hours may be served from the minute tier
    #[serde(default = "default_minute_tier_max_hours")]
    pub minute_tier_max_hours: i64,
}

// Default value functions
fn default_storage_mode() -> StorageMode {
    StorageMode::Failover
}
fn default_max_query_duration_hours() -> i64 {
    720
}
fn default_max_points() -> usize {
    10_000
}
fn default_absolute_max_points() -> usize {
    100_000
}
fn default_read_parallelism() -> usize {
    8
}
fn default_per_partition_deadline_secs() -> u64 {
    15
}
fn default_query_deadline_secs() -> u64 {
    30
}
fn default_max_concurrent_queries() -> usize {
    64
}
fn default_cache_size_bytes() -> usize {
    512 * 1024 * 1024
}
fn default_cache_ttl_seconds() -> u64 {
    3_600
}
fn default_raw_tier_max_hours() -> i64 {
    24
}
fn default_minute_tier_max_hours() -> i64 {
    168
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageSettings::default(),
            query: QuerySettings::default(),
            cache: CacheSettings::default(),
            tiers: TierSettings::default(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            storage_mode: default_storage_mode(),
        }
    }
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            max_query_duration_hours: default_max_query_duration_hours(),
            default_max_points: default_max_points(),
            absolute_max_points: default_absolute_max_points(),
            partition_read_parallelism: default_read_parallelism(),
            per_partition_deadline_secs: default_per_partition_deadline_secs(),
            query_deadline_secs: default_query_deadline_secs(),
            max_concurrent_queries: default_max_concurrent_queries(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_size_bytes: default_cache_size_bytes(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
        }
    }
}

impl Default for TierSettings {
    fn default() -> Self {
        Self {
            raw_tier_max_hours: default_raw_tier_max_hours(),
            minute_tier_max_hours: default_minute_tier_max_hours(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            crate::error::Error::Configuration(format!("failed to read {}: {}", path, e))
        })?;

        toml::from_str(&contents).map_err(|e| {
            crate::error::Error::Configuration(format!("failed to parse {}: {}", path, e))
        })
    }

    /// Load configuration from a TOML file with environment overrides applied
    pub fn from_file_with_env(path: &str) -> crate::error::Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("SENSORQUERY_STORAGE_MODE") {
            match mode.as_str() {
                "primary_only" => self.storage.storage_mode = StorageMode::PrimaryOnly,
                "secondary_only" => self.storage.storage_mode = StorageMode::SecondaryOnly,
                "failover" => self.storage.storage_mode = StorageMode::Failover,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("SENSORQUERY_MAX_QUERY_DURATION_HOURS") {
            if let Ok(h) = v.parse() {
                self.query.max_query_duration_hours = h;
            }
        }
        if let Ok(v) = std::env::var("SENSORQUERY_DEFAULT_MAX_POINTS") {
            if let Ok(p) = v.parse() {
                self.query.default_max_points = p;
            }
        }
        if let Ok(v) = std::env::var("SENSORQUERY_ABSOLUTE_MAX_POINTS") {
            if let Ok(p) = v.parse() {
                self.query.absolute_max_points = p;
            }
        }
        if let Ok(v) = std::env::var("SENSORQUERY_CACHE_ENABLED") {
            self.cache.cache_enabled = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Ok(v) = std::env::var("SENSORQUERY_CACHE_SIZE_BYTES") {
            if let Ok(b) = v.parse() {
                self.cache.cache_size_bytes = b;
            }
        }
        if let Ok(v) = std::env::var("SENSORQUERY_CACHE_TTL_SECONDS") {
            if let Ok(s) = v.parse() {
                self.cache.cache_ttl_seconds = s;
            }
        }
        if let Ok(v) = std::env::var("SENSORQUERY_MAX_CONCURRENT_QUERIES") {
            if let Ok(n) = v.parse() {
                self.query.max_concurrent_queries = n;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.query.max_query_duration_hours <= 0 {
            return Err(crate::error::Error::Configuration(
                "max_query_duration_hours must be positive".to_string(),
            ));
        }
        if self.query.default_max_points == 0 {
            return Err(crate::error::Error::Configuration(
                "default_max_points must be positive".to_string(),
            ));
        }
        if self.query.absolute_max_points < self.query.default_max_points {
            return Err(crate::error::Error::Configuration(
                "absolute_max_points must be >= default_max_points".to_string(),
            ));
        }
        if self.query.partition_read_parallelism == 0 {
            return Err(crate::error::Error::Configuration(
                "partition_read_parallelism must be positive".to_string(),
            ));
        }
        if self.query.max_concurrent_queries == 0 {
            return Err(crate::error::Error::Configuration(
                "max_concurrent_queries must be positive".to_string(),
            ));
        }
        if self.tiers.raw_tier_max_hours >= self.tiers.minute_tier_max_hours {
            return Err(crate::error::Error::Configuration(
                "raw_tier_max_hours must be < minute_tier_max_hours".to_string(),
            ));
        }
        Ok(())
    }

    /// Maximum query duration in nanoseconds
    pub fn max_query_duration_ns(&self) -> i64 {
        self.query.max_query_duration_hours * crate::types::NANOS_PER_HOUR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.storage_mode, StorageMode::Failover);
        assert_eq!(config.query.default_max_points, 10_000);
        assert_eq!(config.cache.cache_size_bytes, 512 * 1024 * 1024);
        assert_eq!(config.tiers.raw_tier_max_hours, 24);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_tier_thresholds() {
        let mut config = Config::default();
        config.tiers.raw_tier_max_hours = 200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_absolute_below_default_rejected() {
        let mut config = Config::default();
        config.query.absolute_max_points = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [storage]
            storage_mode = "primary_only"

            [query]
            max_query_duration_hours = 48
            default_max_points = 500

            [cache]
            cache_enabled = false
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.storage.storage_mode, StorageMode::PrimaryOnly);
        assert_eq!(config.query.max_query_duration_hours, 48);
        assert_eq!(config.query.default_max_points, 500);
        assert!(!config.cache.cache_enabled);
        // Unspecified sections fall back to defaults
        assert_eq!(config.tiers.minute_tier_max_hours, 168);
    }
}
