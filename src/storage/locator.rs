//! Partition locator
//!
//! Maps `(sensors, assets, range, tier)` to the minimal set of partition
//! paths that could contain rows in the range. The locator only does path
//! arithmetic; it never checks existence. Missing partitions are absorbed
//! later by the registry's not-found handling, so absent directories simply
//! contribute no rows.
//!
//! # Path grammar
//!
//! ```text
//! raw:    <asset>/<YYYY>/<MM>/<DD>/<HH>/<sensor>.parquet   (one file per hour)
//! minute: <asset>/<YYYY>/<MM>/<DD>/<sensor>.parquet        (one file per day)
//! hour:   <asset>/<YYYY>/<MM>/<sensor>.parquet             (one file per month)
//! ```
//!
//! When a query names no assets, the locator discovers them by listing the
//! root prefix once and caching the result for 60 seconds. The same listing
//! feeds sensor discovery and coverage queries.

use crate::error::Result;
use crate::storage::backend::BackendRegistry;
use crate::types::{AssetId, SensorId, Tier, TimeRange, NANOS_PER_HOUR};
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const NANOS_PER_DAY: i64 = 24 * NANOS_PER_HOUR;

/// File extension of all partitions
pub const PARTITION_EXT: &str = "parquet";

/// One partition candidate: a backend path plus the identity the reader
/// injects into its rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRef {
    /// POSIX-style path relative to the backend root
    pub path: String,
    /// Sensor the partition belongs to (from the file stem)
    pub sensor: SensorId,
    /// Asset the partition belongs to (from the first path segment)
    pub asset: AssetId,
}

/// A partition path parsed back into its identity and time coverage.
#[derive(Debug, Clone)]
struct ParsedPartition {
    asset: AssetId,
    sensor: SensorId,
    start_ns: i64,
    end_ns: i64,
}

/// Locates partition files for queries and answers discovery requests.
pub struct PartitionLocator {
    registry: Arc<BackendRegistry>,
    discovery_ttl: Duration,
    discovery_cache: RwLock<Option<DiscoverySnapshot>>,
}

#[derive(Clone)]
struct DiscoverySnapshot {
    taken_at: Instant,
    assets: Vec<AssetId>,
    sensors: Vec<SensorId>,
}

impl PartitionLocator {
    /// Create a locator over the given registry with the default 60 s
    /// discovery TTL.
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self::with_discovery_ttl(registry, Duration::from_secs(60))
    }

    /// Create a locator with a custom discovery-cache TTL (used in tests).
    pub fn with_discovery_ttl(registry: Arc<BackendRegistry>, ttl: Duration) -> Self {
        Self {
            registry,
            discovery_ttl: ttl,
            discovery_cache: RwLock::new(None),
        }
    }

    /// Enumerate the partition paths that could contain rows for the query.
    ///
    /// `sensors` and `assets` are expected pre-sorted by the planner; the
    /// output is ordered (sensor, asset, time) so downstream concatenation is
    /// deterministic.
    pub async fn locate(
        &self,
        sensors: &[SensorId],
        assets: Option<&[AssetId]>,
        range: TimeRange,
        tier: Tier,
    ) -> Result<Vec<PartitionRef>> {
        let owned_assets;
        let assets: &[AssetId] = match assets {
            Some(list) => list,
            None => {
                owned_assets = self.available_assets().await?;
                &owned_assets
            }
        };

        let buckets = enumerate_buckets(range, tier);
        let mut refs =
            Vec::with_capacity(sensors.len() * assets.len() * buckets.len());
        for sensor in sensors {
            for asset in assets {
                for bucket in &buckets {
                    refs.push(PartitionRef {
                        path: bucket.path_for(asset, sensor),
                        sensor: sensor.clone(),
                        asset: asset.clone(),
                    });
                }
            }
        }

        debug!(
            sensors = sensors.len(),
            assets = assets.len(),
            tier = %tier,
            partitions = refs.len(),
            "located partition candidates"
        );
        Ok(refs)
    }

    /// Assets currently present in storage, from the cached root listing.
    pub async fn available_assets(&self) -> Result<Vec<AssetId>> {
        Ok(self.discovery().await?.assets)
    }

    /// Sensors currently present in storage, optionally restricted to one
    /// asset.
    pub async fn available_sensors(&self, asset: Option<&AssetId>) -> Result<Vec<SensorId>> {
        match asset {
            None => Ok(self.discovery().await?.sensors),
            Some(asset) => {
                let paths = self.registry.list(asset).await?;
                let mut sensors: Vec<SensorId> = paths
                    .iter()
                    .filter_map(|p| parse_partition_path(p))
                    .map(|parsed| parsed.sensor)
                    .collect();
                sensors.sort();
                sensors.dedup();
                Ok(sensors)
            }
        }
    }

    /// The sensor names known to storage, served from the discovery cache.
    ///
    /// Returns `None` when discovery itself fails, so callers can skip
    /// catalog-based validation instead of failing the query on a listing
    /// hiccup.
    pub async fn known_sensors(&self) -> Option<Vec<SensorId>> {
        self.discovery().await.ok().map(|snap| snap.sensors)
    }

    /// Conservative time coverage of the given sensors, derived from
    /// partition paths alone (grain-aligned, no file reads).
    pub async fn time_range_of(
        &self,
        sensors: &[SensorId],
        assets: Option<&[AssetId]>,
    ) -> Result<Option<TimeRange>> {
        let paths = self.registry.list("").await?;
        let mut min_start: Option<i64> = None;
        let mut max_end: Option<i64> = None;

        for parsed in paths.iter().filter_map(|p| parse_partition_path(p)) {
            if !sensors.contains(&parsed.sensor) {
                continue;
            }
            if let Some(assets) = assets {
                if !assets.contains(&parsed.asset) {
                    continue;
                }
            }
            min_start = Some(min_start.map_or(parsed.start_ns, |v| v.min(parsed.start_ns)));
            max_end = Some(max_end.map_or(parsed.end_ns, |v| v.max(parsed.end_ns)));
        }

        match (min_start, max_end) {
            (Some(start), Some(end)) if start < end => {
                Ok(Some(TimeRange::new_unchecked(start, end)))
            }
            _ => Ok(None),
        }
    }

    /// Drop the discovery cache; the next lookup re-lists the root.
    pub fn invalidate_asset_cache(&self) {
        *self.discovery_cache.write() = None;
    }

    async fn discovery(&self) -> Result<DiscoverySnapshot> {
        {
            let cache = self.discovery_cache.read();
            if let Some(snapshot) = cache.as_ref() {
                if snapshot.taken_at.elapsed() < self.discovery_ttl {
                    return Ok(snapshot.clone());
                }
            }
        }

        let paths = self.registry.list("").await?;
        let mut assets = Vec::new();
        let mut sensors = Vec::new();
        for parsed in paths.iter().filter_map(|p| parse_partition_path(p)) {
            assets.push(parsed.asset);
            sensors.push(parsed.sensor);
        }
        assets.sort();
        assets.dedup();
        sensors.sort();
        sensors.dedup();

        let snapshot = DiscoverySnapshot {
            taken_at: Instant::now(),
            assets,
            sensors,
        };
        *self.discovery_cache.write() = Some(snapshot.clone());
        debug!(
            assets = snapshot.assets.len(),
            sensors = snapshot.sensors.len(),
            "refreshed discovery cache"
        );
        Ok(snapshot)
    }
}

/// One time bucket of a tier, carrying the calendar parts used in paths.
#[derive(Debug, Clone, Copy)]
struct TimeBucket {
    tier: Tier,
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
}

impl TimeBucket {
    fn path_for(&self, asset: &str, sensor: &str) -> String {
        match self.tier {
            Tier::Raw => format!(
                "{}/{:04}/{:02}/{:02}/{:02}/{}.{}",
                asset, self.year, self.month, self.day, self.hour, sensor, PARTITION_EXT
            ),
            Tier::Minute => format!(
                "{}/{:04}/{:02}/{:02}/{}.{}",
                asset, self.year, self.month, self.day, sensor, PARTITION_EXT
            ),
            Tier::Hour => format!(
                "{}/{:04}/{:02}/{}.{}",
                asset, self.year, self.month, sensor, PARTITION_EXT
            ),
        }
    }
}

/// Enumerate the tier buckets overlapping a half-open range.
fn enumerate_buckets(range: TimeRange, tier: Tier) -> Vec<TimeBucket> {
    let mut buckets = Vec::new();
    let last = range.end - 1;
    match tier {
        Tier::Raw => {
            let mut ns = range.start - range.start.rem_euclid(NANOS_PER_HOUR);
            while ns <= last {
                let dt = DateTime::from_timestamp_nanos(ns);
                buckets.push(TimeBucket {
                    tier,
                    year: dt.year(),
                    month: dt.month(),
                    day: dt.day(),
                    hour: dt.hour(),
                });
                ns += NANOS_PER_HOUR;
            }
        }
        Tier::Minute => {
            let mut ns = range.start - range.start.rem_euclid(NANOS_PER_DAY);
            while ns <= last {
                let dt = DateTime::from_timestamp_nanos(ns);
                buckets.push(TimeBucket {
                    tier,
                    year: dt.year(),
                    month: dt.month(),
                    day: dt.day(),
                    hour: 0,
                });
                ns += NANOS_PER_DAY;
            }
        }
        Tier::Hour => {
            let start = DateTime::from_timestamp_nanos(range.start);
            let end = DateTime::from_timestamp_nanos(last);
            let (mut year, mut month) = (start.year(), start.month());
            loop {
                buckets.push(TimeBucket {
                    tier,
                    year,
                    month,
                    day: 1,
                    hour: 0,
                });
                if (year, month) >= (end.year(), end.month()) {
                    break;
                }
                month += 1;
                if month > 12 {
                    month = 1;
                    year += 1;
                }
            }
        }
    }
    buckets
}

/// Parse a partition path back into identity and grain-aligned coverage.
///
/// Returns `None` for paths that do not match any tier's grammar; foreign
/// objects in the store are simply ignored.
fn parse_partition_path(path: &str) -> Option<ParsedPartition> {
    let parts: Vec<&str> = path.split('/').collect();
    let file = parts.last()?;
    let sensor = file.strip_suffix(&format!(".{}", PARTITION_EXT))?;
    if sensor.is_empty() {
        return None;
    }

    let asset = (*parts.first()?).to_string();
    if asset.is_empty() {
        return None;
    }

    let start = match parts.len() {
        // asset/YYYY/MM/DD/HH/sensor.parquet
        6 => {
            let (y, m, d, h) = (
                parts[1].parse().ok()?,
                parts[2].parse().ok()?,
                parts[3].parse().ok()?,
                parts[4].parse().ok()?,
            );
            Utc.with_ymd_and_hms(y, m, d, h, 0, 0).single()?
        }
        // asset/YYYY/MM/DD/sensor.parquet
        5 => {
            let (y, m, d) = (
                parts[1].parse().ok()?,
                parts[2].parse().ok()?,
                parts[3].parse().ok()?,
            );
            Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).single()?
        }
        // asset/YYYY/MM/sensor.parquet
        4 => {
            let (y, m) = (parts[1].parse().ok()?, parts[2].parse().ok()?);
            Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).single()?
        }
        _ => return None,
    };

    let start_ns = start.timestamp_nanos_opt()?;
    let end_ns = match parts.len() {
        6 => start_ns + NANOS_PER_HOUR,
        5 => start_ns + NANOS_PER_DAY,
        _ => {
            let (mut y, mut m) = (start.year(), start.month() + 1);
            if m > 12 {
                m = 1;
                y += 1;
            }
            Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0)
                .single()?
                .timestamp_nanos_opt()?
        }
    };

    Some(ParsedPartition {
        asset,
        sensor: sensor.to_string(),
        start_ns,
        end_ns,
    })
}
