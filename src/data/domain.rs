//! Observation and feature-row definitions plus the store/source contracts.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::error::{FetchError, PipelineResult};

/// Bumped whenever [`Features`] changes shape or meaning. Rows written under an
/// older version must be reprocessed before they can be trained on.
pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Opaque identifier for a monitored location.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(String);

impl LocationId {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A location plus the coordinates the upstream client needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub latitude: f64,
    pub longitude: f64,
}

/// Raw weather readings for one hour.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherFields {
    /// Degrees Celsius at 2 m.
    pub temperature: Option<f64>,
    /// Relative humidity, percent.
    pub relative_humidity: Option<f64>,
    /// km/h at 10 m.
    pub wind_speed: Option<f64>,
    /// Degrees from north.
    pub wind_direction: Option<f64>,
    /// Surface pressure, hPa.
    pub pressure: Option<f64>,
}

/// Raw pollutant concentrations for one hour, µg/m³.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PollutantFields {
    pub pm2_5: Option<f64>,
    pub pm10: Option<f64>,
    pub o3: Option<f64>,
    pub no2: Option<f64>,
}

/// One hour of upstream data. Immutable once fetched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub location: LocationId,
    #[serde(default)]
    pub weather: WeatherFields,
    #[serde(default)]
    pub pollutants: PollutantFields,
}

/// Unique key of a stored feature row.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct FeatureKey {
    pub location: LocationId,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.location, self.timestamp.to_rfc3339())
    }
}

/// Derived model inputs for one hour.
///
/// Weather terms describe hour T itself; pollutant terms only ever look at
/// hours strictly before T. `None` marks a lag that fell into a gap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub temperature: f64,
    pub relative_humidity: f64,
    pub wind_speed: f64,
    pub hour_sin: f64,
    pub hour_cos: f64,
    pub dow_sin: f64,
    pub dow_cos: f64,
    pub pm2_5_lag1: Option<f64>,
    pub pm2_5_lag2: Option<f64>,
    pub pm2_5_lag3: Option<f64>,
    pub pm2_5_lag24: Option<f64>,
    pub pm2_5_mean_24h: Option<f64>,
    pub pm10_lag1: Option<f64>,
    pub no2_lag1: Option<f64>,
    pub wind_x_pm2_5_lag1: Option<f64>,
}

/// Column order of [`Features::vector`].
pub const FEATURE_NAMES: [&str; 15] = [
    "temperature",
    "relative_humidity",
    "wind_speed",
    "hour_sin",
    "hour_cos",
    "dow_sin",
    "dow_cos",
    "pm2_5_lag1",
    "pm2_5_lag2",
    "pm2_5_lag3",
    "pm2_5_lag24",
    "pm2_5_mean_24h",
    "pm10_lag1",
    "no2_lag1",
    "wind_x_pm2_5_lag1",
];

impl Features {
    fn columns(&self) -> [Option<f64>; 15] {
        [
            Some(self.temperature),
            Some(self.relative_humidity),
            Some(self.wind_speed),
            Some(self.hour_sin),
            Some(self.hour_cos),
            Some(self.dow_sin),
            Some(self.dow_cos),
            self.pm2_5_lag1,
            self.pm2_5_lag2,
            self.pm2_5_lag3,
            self.pm2_5_lag24,
            self.pm2_5_mean_24h,
            self.pm10_lag1,
            self.no2_lag1,
            self.wind_x_pm2_5_lag1,
        ]
    }

    /// Dense input vector in [`FEATURE_NAMES`] order, or `None` if any lag is missing.
    pub fn vector(&self) -> Option<Vec<f64>> {
        self.columns().into_iter().collect()
    }

    /// Names of the columns that are absent.
    pub fn missing(&self) -> Vec<&'static str> {
        self.columns()
            .iter()
            .zip(FEATURE_NAMES)
            .filter_map(|(value, name)| value.is_none().then_some(name))
            .collect()
    }

    /// Whether every present column is a finite number.
    pub fn is_finite(&self) -> bool {
        self.columns().iter().flatten().all(|v| v.is_finite())
    }
}

/// A stored, time-indexed training example.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub timestamp: DateTime<Utc>,
    pub location: LocationId,
    pub schema_version: u32,
    pub features: Features,
    /// PM2.5 at `timestamp`, when known.
    pub target: Option<f64>,
}

impl FeatureRow {
    pub fn key(&self) -> FeatureKey {
        FeatureKey {
            location: self.location.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Input vector and label, if the row is complete enough to learn from.
    pub fn example(&self) -> Option<(Vec<f64>, f64)> {
        let target = self.target.filter(|t| t.is_finite())?;
        Some((self.features.vector()?, target))
    }
}

/// Result of a batch upsert. Rows are written independently; a failure on one
/// key does not roll back the others.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpsertReport {
    pub written: usize,
    pub failed: Vec<(FeatureKey, String)>,
}

impl UpsertReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Keys the caller should retry.
    pub fn failed_keys(&self) -> Vec<FeatureKey> {
        self.failed.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn merge(&mut self, other: UpsertReport) {
        self.written += other.written;
        self.failed.extend(other.failed);
    }
}

/// An hour that could not be turned into a feature row.
#[derive(Clone, Debug, PartialEq)]
pub struct Gap {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Durable, keyed store of feature rows and the raw observations behind them.
pub trait FeatureStore: Send + Sync {
    /// Overwrite-by-key upsert, atomic per row.
    fn upsert(&self, rows: &[FeatureRow]) -> PipelineResult<UpsertReport>;

    /// Rows with `start <= timestamp < end`, ascending. Missing hours are simply absent.
    fn read_range(
        &self,
        location: &LocationId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> PipelineResult<Vec<FeatureRow>>;

    /// Keep the raw observations so rows can be recomputed after a schema change.
    fn archive_observations(&self, observations: &[Observation]) -> PipelineResult<UpsertReport>;

    /// Archived observations with `start <= timestamp < end`, ascending.
    fn read_observations(
        &self,
        location: &LocationId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> PipelineResult<Vec<Observation>>;

    /// Keys of rows written under a schema other than `schema_version`.
    fn stale_keys(&self, location: &LocationId, schema_version: u32) -> PipelineResult<Vec<FeatureKey>>;
}

/// Upstream weather/pollutant API client.
pub trait ObservationSource: Send + Sync {
    /// Observations with `start <= timestamp < end`. May include future hours
    /// carrying weather only (forecast outlook).
    fn fetch_observations(
        &self,
        location: &Location,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>, FetchError>;
}
