//! Interval planner and tier selector
//!
//! Turns a canonical query into an executable [`Plan`]: a bucket width
//! snapped to the standard grid, a storage tier that can serve that width,
//! an effective range pre-shrunk to the raw-tier point budget, and the
//! fingerprint that keys the result cache.
//!
//! # Bucket sizing
//!
//! When the caller did not fix an interval, the minimum width that keeps
//! `duration x sensors / width` within the point budget is computed and
//! snapped *upward* to the standard grid. A caller-fixed interval is snapped
//! upward too; the served resolution is never finer than requested, because
//! finer output could blow the budget.
//!
//! # Tier rules (first match wins)
//!
//! 1. raw aggregation -> RAW
//! 2. bucket < 1 minute and duration <= raw_tier_max -> RAW
//! 3. bucket < 1 hour and duration <= minute_tier_max -> MINUTE
//! 4. otherwise -> HOUR
//!
//! When the matched tier cannot serve the requested bucket (its grain is
//! coarser), the bucket is rounded up to the grain and the plan records the
//! promotion.

use crate::config::TierSettings;
use crate::query::request::CanonicalQuery;
use crate::types::{
    Aggregation, AssetId, SensorId, Tier, TimeRange, NANOS_PER_HOUR, NANOS_PER_MIN, NANOS_PER_SEC,
};
use std::fmt;
use std::hash::{Hash, Hasher};
use tracing::debug;

/// The standard bucket-width grid, in seconds.
pub const STANDARD_GRID_SECS: [i64; 14] = [
    1, 5, 10, 30, 60, 300, 600, 1_800, 3_600, 7_200, 14_400, 21_600, 43_200, 86_400,
];

/// An executable query plan
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// Tier the read will target
    pub tier: Tier,
    /// Bucket width on the standard grid (or the tier grain after promotion)
    pub bucket_width_ns: i64,
    /// Range the read will cover; a strict prefix of the request when the
    /// raw-tier budget would otherwise be exceeded
    pub effective_range: TimeRange,
    /// Sorted sensors
    pub sensors: Vec<SensorId>,
    /// Sorted assets, if restricted
    pub assets: Option<Vec<AssetId>>,
    /// Aggregation function
    pub aggregation: Aggregation,
    /// Point budget
    pub max_points: usize,
    /// Rows this plan is expected to produce
    pub expected_points: u64,
    /// Whether the effective range is a strict prefix of the request
    pub truncated: bool,
    /// Whether the tier selector coarsened the requested resolution
    pub resolution_promoted: bool,
}

/// Build a plan from a canonical query and the tier thresholds.
pub fn plan(query: &CanonicalQuery, tiers: &TierSettings) -> Plan {
    let duration = query.range.duration_ns();
    let sensor_count = query.sensors.len() as i64;

    if query.aggregation == Aggregation::Raw {
        return plan_raw(query, duration, sensor_count);
    }

    let requested_width = match query.interval_ns {
        Some(interval) => snap_to_grid(interval),
        None => {
            let budget = query.max_points as i64;
            let min_width = div_ceil(duration.saturating_mul(sensor_count), budget);
            snap_to_grid(min_width)
        }
    };

    let raw_max = tiers.raw_tier_max_hours * NANOS_PER_HOUR;
    let minute_max = tiers.minute_tier_max_hours * NANOS_PER_HOUR;

    let (tier, bucket_width_ns, resolution_promoted) =
        if requested_width < NANOS_PER_MIN && duration <= raw_max {
            (Tier::Raw, requested_width, false)
        } else if requested_width < NANOS_PER_MIN && duration <= minute_max {
            // The minute tier cannot serve sub-minute buckets; promote.
            (Tier::Minute, NANOS_PER_MIN, true)
        } else if requested_width < NANOS_PER_HOUR && duration <= minute_max {
            (Tier::Minute, requested_width, false)
        } else if requested_width < NANOS_PER_HOUR {
            // The hour tier cannot serve sub-hour buckets; promote.
            (Tier::Hour, NANOS_PER_HOUR, true)
        } else {
            (Tier::Hour, requested_width, false)
        };

    let expected_points = (div_ceil(duration, bucket_width_ns) * sensor_count).max(0) as u64;

    let plan = Plan {
        tier,
        bucket_width_ns,
        effective_range: query.range,
        sensors: query.sensors.clone(),
        assets: query.assets.clone(),
        aggregation: query.aggregation,
        max_points: query.max_points,
        expected_points,
        truncated: false,
        resolution_promoted,
    };
    debug!(
        tier = %plan.tier,
        bucket_width_s = plan.bucket_width_ns / NANOS_PER_SEC,
        expected_points = plan.expected_points,
        promoted = plan.resolution_promoted,
        "planned aggregated query"
    );
    plan
}

/// Raw passthrough plans: 1-second grain, budget enforced by shrinking the
/// effective range to a prefix.
fn plan_raw(query: &CanonicalQuery, duration: i64, sensor_count: i64) -> Plan {
    let expected = div_ceil(duration, NANOS_PER_SEC).saturating_mul(sensor_count);
    let budget = query.max_points as i64;

    let (effective_range, truncated) = if expected > budget {
        let seconds_per_sensor = budget / sensor_count;
        let end = query.range.start + seconds_per_sensor * NANOS_PER_SEC;
        (
            TimeRange::new_unchecked(query.range.start, end.max(query.range.start + 1)),
            true,
        )
    } else {
        (query.range, false)
    };

    let expected_points =
        (div_ceil(effective_range.duration_ns(), NANOS_PER_SEC) * sensor_count).max(0) as u64;

    let plan = Plan {
        tier: Tier::Raw,
        bucket_width_ns: NANOS_PER_SEC,
        effective_range,
        sensors: query.sensors.clone(),
        assets: query.assets.clone(),
        aggregation: Aggregation::Raw,
        max_points: query.max_points,
        expected_points,
        truncated,
        resolution_promoted: false,
    };
    debug!(
        expected_points = plan.expected_points,
        truncated = plan.truncated,
        "planned raw query"
    );
    plan
}

/// Snap a width upward to the standard grid; widths beyond the grid use the
/// coarsest step and leave overflow to downstream truncation.
pub fn snap_to_grid(width_ns: i64) -> i64 {
    for secs in STANDARD_GRID_SECS {
        let grid_ns = secs * NANOS_PER_SEC;
        if width_ns <= grid_ns {
            return grid_ns;
        }
    }
    STANDARD_GRID_SECS[STANDARD_GRID_SECS.len() - 1] * NANOS_PER_SEC
}

fn div_ceil(a: i64, b: i64) -> i64 {
    if b <= 0 {
        return 0;
    }
    (a + b - 1) / b
}

/// Deterministic digest over the canonicalized plan fields.
///
/// Two queries with identical fingerprints return identical payloads: the
/// hash covers the sorted identifier sets, the effective range truncated to
/// the bucket grain, the bucket width, aggregation, tier, and the point
/// budget (which bounds the tail cap).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Digest a plan.
    pub fn from_plan(plan: &Plan) -> Self {
        use std::collections::hash_map::DefaultHasher;

        let mut hasher = DefaultHasher::new();
        for sensor in &plan.sensors {
            sensor.hash(&mut hasher);
        }
        0xfeu8.hash(&mut hasher);
        match &plan.assets {
            Some(assets) => {
                for asset in assets {
                    asset.hash(&mut hasher);
                }
            }
            None => {
                0xffu8.hash(&mut hasher);
            }
        }
        (plan.effective_range.start / plan.bucket_width_ns).hash(&mut hasher);
        (plan.effective_range.end / plan.bucket_width_ns).hash(&mut hasher);
        plan.bucket_width_ns.hash(&mut hasher);
        plan.aggregation.as_str().hash(&mut hasher);
        plan.tier.as_str().hash(&mut hasher);
        plan.max_points.hash(&mut hasher);
        Fingerprint(hasher.finish())
    }

    /// Wrap a precomputed digest (tests and tooling).
    pub fn from_raw(digest: u64) -> Self {
        Fingerprint(digest)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NANOS_PER_HOUR;

    fn canonical(
        sensors: usize,
        duration_ns: i64,
        max_points: usize,
        aggregation: Aggregation,
    ) -> CanonicalQuery {
        CanonicalQuery {
            sensors: (0..sensors).map(|i| format!("s{}", i)).collect(),
            assets: None,
            range: TimeRange::new_unchecked(0, duration_ns),
            interval_ns: None,
            max_points,
            aggregation,
        }
    }

    fn tiers() -> TierSettings {
        TierSettings::default()
    }

    #[test]
    fn test_snap_to_grid_rounds_upward() {
        assert_eq!(snap_to_grid(1), NANOS_PER_SEC);
        assert_eq!(snap_to_grid(NANOS_PER_SEC), NANOS_PER_SEC);
        assert_eq!(snap_to_grid(NANOS_PER_SEC + 1), 5 * NANOS_PER_SEC);
        assert_eq!(snap_to_grid(7 * NANOS_PER_MIN), 10 * NANOS_PER_MIN);
        assert_eq!(snap_to_grid(30 * NANOS_PER_HOUR), 24 * NANOS_PER_HOUR);
    }

    #[test]
    fn test_24h_mean_288_points_gets_10m_buckets() {
        // Boundary scenario: 2 sensors over 24h with a 288-point budget
        // needs ceil(24h*2/288) = 10 minutes.
        let query = canonical(2, 24 * NANOS_PER_HOUR, 288, Aggregation::Mean);
        let plan = plan(&query, &tiers());
        assert_eq!(plan.bucket_width_ns, 10 * NANOS_PER_MIN);
        assert_eq!(plan.tier, Tier::Minute);
        assert_eq!(plan.expected_points, 288);
        assert!(!plan.resolution_promoted);
    }

    #[test]
    fn test_14d_mean_selects_hour_tier() {
        // Boundary scenario: 14 days, 10k budget -> HOUR tier at its grain.
        let query = canonical(1, 14 * 24 * NANOS_PER_HOUR, 10_000, Aggregation::Mean);
        let plan = plan(&query, &tiers());
        assert_eq!(plan.tier, Tier::Hour);
        assert!(plan.bucket_width_ns >= NANOS_PER_HOUR);
        assert!(plan.expected_points <= 336);
    }

    #[test]
    fn test_sub_minute_buckets_stay_raw() {
        let query = canonical(1, NANOS_PER_HOUR, 3_600, Aggregation::Mean);
        let plan = plan(&query, &tiers());
        assert_eq!(plan.tier, Tier::Raw);
        assert_eq!(plan.bucket_width_ns, NANOS_PER_SEC);
    }

    #[test]
    fn test_sub_minute_buckets_beyond_raw_window_promote_to_minute() {
        // 48h at a huge budget wants sub-minute buckets, but the raw tier
        // only covers 24h; MINUTE serves it at its grain.
        let query = canonical(1, 48 * NANOS_PER_HOUR, 100_000, Aggregation::Mean);
        let plan = plan(&query, &tiers());
        assert_eq!(plan.tier, Tier::Minute);
        assert_eq!(plan.bucket_width_ns, NANOS_PER_MIN);
        assert!(plan.resolution_promoted);
    }

    #[test]
    fn test_long_duration_promotes_to_hour_grain() {
        // 10 days with a generous budget wants 10m buckets, but the minute
        // tier only covers 7 days; HOUR serves it at its grain.
        let mut settings = tiers();
        settings.minute_tier_max_hours = 168;
        let query = canonical(1, 240 * NANOS_PER_HOUR, 2_000, Aggregation::Mean);
        let plan = plan(&query, &settings);
        assert_eq!(plan.tier, Tier::Hour);
        assert_eq!(plan.bucket_width_ns, NANOS_PER_HOUR);
        assert!(plan.resolution_promoted);
    }

    #[test]
    fn test_fixed_interval_is_never_refined() {
        let mut query = canonical(1, NANOS_PER_HOUR, 10_000, Aggregation::Mean);
        query.interval_ns = Some(7 * NANOS_PER_SEC);
        let plan = plan(&query, &tiers());
        assert_eq!(plan.bucket_width_ns, 10 * NANOS_PER_SEC);
    }

    #[test]
    fn test_raw_within_budget_is_untruncated() {
        // Boundary scenario 1: 1h raw at 3600 budget fits exactly.
        let query = canonical(1, NANOS_PER_HOUR, 3_600, Aggregation::Raw);
        let plan = plan(&query, &tiers());
        assert_eq!(plan.tier, Tier::Raw);
        assert_eq!(plan.bucket_width_ns, NANOS_PER_SEC);
        assert!(!plan.truncated);
        assert_eq!(plan.effective_range, query.range);
    }

    #[test]
    fn test_raw_over_budget_shrinks_to_prefix() {
        // Boundary scenario 2: 1h raw at 100 budget covers 100 seconds.
        let query = canonical(1, NANOS_PER_HOUR, 100, Aggregation::Raw);
        let plan = plan(&query, &tiers());
        assert!(plan.truncated);
        assert_eq!(plan.effective_range.start, 0);
        assert_eq!(plan.effective_range.end, 100 * NANOS_PER_SEC);
        assert_eq!(plan.expected_points, 100);
    }

    #[test]
    fn test_raw_budget_splits_across_sensors() {
        let query = canonical(2, NANOS_PER_HOUR, 100, Aggregation::Raw);
        let plan = plan(&query, &tiers());
        assert!(plan.truncated);
        // floor(100 / 2) seconds per sensor
        assert_eq!(plan.effective_range.end, 50 * NANOS_PER_SEC);
    }

    #[test]
    fn test_fingerprint_deterministic_and_sensitive() {
        let query = canonical(2, 24 * NANOS_PER_HOUR, 288, Aggregation::Mean);
        let p1 = plan(&query, &tiers());
        let p2 = plan(&query, &tiers());
        assert_eq!(Fingerprint::from_plan(&p1), Fingerprint::from_plan(&p2));

        let other = canonical(2, 24 * NANOS_PER_HOUR, 288, Aggregation::Max);
        let p3 = plan(&other, &tiers());
        assert_ne!(Fingerprint::from_plan(&p1), Fingerprint::from_plan(&p3));

        let fewer = canonical(1, 24 * NANOS_PER_HOUR, 288, Aggregation::Mean);
        let p4 = plan(&fewer, &tiers());
        assert_ne!(Fingerprint::from_plan(&p1), Fingerprint::from_plan(&p4));
    }

    #[test]
    fn test_fingerprint_distinguishes_budgets_at_fixed_interval() {
        let mut a = canonical(1, 24 * NANOS_PER_HOUR, 100, Aggregation::Mean);
        a.interval_ns = Some(NANOS_PER_MIN);
        let mut b = a.clone();
        b.max_points = 10_000;
        let pa = plan(&a, &tiers());
        let pb = plan(&b, &tiers());
        assert_eq!(pa.bucket_width_ns, pb.bucket_width_ns);
        assert_ne!(Fingerprint::from_plan(&pa), Fingerprint::from_plan(&pb));
    }
}
