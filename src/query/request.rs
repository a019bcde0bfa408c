//! Query request type, builder, and validation
//!
//! A `Query` arrives from the embedding service already parsed; the core
//! validates it against configuration limits and canonicalizes it (sorted,
//! deduplicated identifier sets, resolved defaults) before planning.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{Aggregation, AssetId, SensorId, TimeRange, NANOS_PER_SEC};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A sensor-data query as submitted by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Sensors to read; must be non-empty
    pub sensors: Vec<SensorId>,
    /// Assets to restrict to; `None` means all assets
    pub assets: Option<Vec<AssetId>>,
    /// Half-open time window
    pub range: TimeRange,
    /// Fixed bucket width; `None` lets the planner size it
    pub interval: Option<Duration>,
    /// Point budget; `None` uses the configured default
    pub max_points: Option<usize>,
    /// Aggregation function
    pub aggregation: Aggregation,
}

impl Query {
    /// Start building a query over the given range
    pub fn builder(range: TimeRange) -> QueryBuilder {
        QueryBuilder::new(range)
    }

    /// Validate against configuration limits and produce the canonical form.
    pub fn canonicalize(&self, config: &Config) -> Result<CanonicalQuery> {
        if self.sensors.is_empty() {
            return Err(Error::InvalidParameter {
                parameter: "sensors".to_string(),
                message: "at least one sensor must be specified".to_string(),
            });
        }
        for sensor in &self.sensors {
            validate_identifier("sensors", sensor)?;
        }
        if let Some(assets) = &self.assets {
            for asset in assets {
                validate_identifier("assets", asset)?;
            }
        }

        if self.range.start >= self.range.end {
            return Err(Error::InvalidTimeRange {
                message: format!(
                    "start {} must be before end {}",
                    self.range.start, self.range.end
                ),
            });
        }
        let max_duration = config.max_query_duration_ns();
        if self.range.duration_ns() > max_duration {
            return Err(Error::InvalidTimeRange {
                message: format!(
                    "duration exceeds the maximum of {} hours",
                    config.query.max_query_duration_hours
                ),
            });
        }

        let max_points = match self.max_points {
            Some(0) => {
                return Err(Error::InvalidParameter {
                    parameter: "max_points".to_string(),
                    message: "must be positive".to_string(),
                })
            }
            Some(n) => n.min(config.query.absolute_max_points),
            None => config.query.default_max_points,
        };

        let interval_ns = match self.interval {
            Some(interval) => {
                let ns = interval.as_nanos();
                if ns < NANOS_PER_SEC as u128 {
                    return Err(Error::InvalidParameter {
                        parameter: "interval".to_string(),
                        message: "must be at least one second".to_string(),
                    });
                }
                Some(ns.min(i64::MAX as u128) as i64)
            }
            None => None,
        };

        let mut sensors = self.sensors.clone();
        sensors.sort();
        sensors.dedup();

        let assets = self.assets.as_ref().map(|assets| {
            let mut assets = assets.clone();
            assets.sort();
            assets.dedup();
            assets
        });

        Ok(CanonicalQuery {
            sensors,
            assets,
            range: self.range,
            interval_ns,
            max_points,
            aggregation: self.aggregation,
        })
    }
}

/// Identifiers become path segments; reject anything that could escape the
/// storage root.
fn validate_identifier(parameter: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidParameter {
            parameter: parameter.to_string(),
            message: "names must not be empty".to_string(),
        });
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") || name.contains('\0') {
        return Err(Error::InvalidParameter {
            parameter: parameter.to_string(),
            message: format!("'{}' contains path separators", name),
        });
    }
    Ok(())
}

/// A validated query with defaults resolved and identifier sets sorted and
/// deduplicated.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalQuery {
    /// Sorted, deduplicated sensors
    pub sensors: Vec<SensorId>,
    /// Sorted, deduplicated assets, if restricted
    pub assets: Option<Vec<AssetId>>,
    /// Requested time window
    pub range: TimeRange,
    /// Caller-fixed bucket width, nanoseconds
    pub interval_ns: Option<i64>,
    /// Resolved point budget (default applied, ceiling clamped)
    pub max_points: usize,
    /// Aggregation function
    pub aggregation: Aggregation,
}

/// Fluent builder for [`Query`]
#[must_use = "builders do nothing until .build() is called"]
pub struct QueryBuilder {
    sensors: Vec<SensorId>,
    assets: Option<Vec<AssetId>>,
    range: TimeRange,
    interval: Option<Duration>,
    max_points: Option<usize>,
    aggregation: Aggregation,
}

impl QueryBuilder {
    /// Start a builder over the given range; aggregation defaults to `mean`.
    pub fn new(range: TimeRange) -> Self {
        Self {
            sensors: Vec::new(),
            assets: None,
            range,
            interval: None,
            max_points: None,
            aggregation: Aggregation::Mean,
        }
    }

    /// Add one sensor
    pub fn sensor(mut self, sensor: impl Into<SensorId>) -> Self {
        self.sensors.push(sensor.into());
        self
    }

    /// Add several sensors
    pub fn sensors<I, S>(mut self, sensors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SensorId>,
    {
        self.sensors.extend(sensors.into_iter().map(Into::into));
        self
    }

    /// Restrict to one asset
    pub fn asset(mut self, asset: impl Into<AssetId>) -> Self {
        self.assets.get_or_insert_with(Vec::new).push(asset.into());
        self
    }

    /// Fix the bucket width
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Set the point budget
    pub fn max_points(mut self, max_points: usize) -> Self {
        self.max_points = Some(max_points);
        self
    }

    /// Set the aggregation function
    pub fn aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Request raw passthrough samples
    pub fn raw(mut self) -> Self {
        self.aggregation = Aggregation::Raw;
        self
    }

    /// Finish building
    pub fn build(self) -> Query {
        Query {
            sensors: self.sensors,
            assets: self.assets,
            range: self.range,
            interval: self.interval,
            max_points: self.max_points,
            aggregation: self.aggregation,
        }
    }
}
