//! Deterministic feature engineering.
//!
//! Features for hour T are computed from an [`ObservationIndex`] using only
//! entries at or before T, so appending later hours never changes a row.

use std::collections::BTreeMap;
use std::f64::consts::TAU;

use chrono::{DateTime, Datelike, TimeDelta, Timelike, Utc};

use crate::common::error::{PipelineError, PipelineResult};

use super::domain::{FeatureRow, Features, LocationId, Observation, FEATURE_SCHEMA_VERSION};

/// Hours of history a row can depend on.
pub const LOOKBACK_HOURS: i64 = 24;

/// Fewer present hours than this leaves the trailing mean undefined.
const MIN_MEAN_COVERAGE: usize = 18;

/// Observations of one location keyed by hour.
#[derive(Clone, Debug, Default)]
pub struct ObservationIndex {
    by_hour: BTreeMap<DateTime<Utc>, Observation>,
}

impl ObservationIndex {
    /// Index `observations` for `location`; other locations are ignored.
    /// A later duplicate for the same hour replaces the earlier one.
    pub fn new(location: &LocationId, observations: impl IntoIterator<Item = Observation>) -> Self {
        let by_hour = observations
            .into_iter()
            .filter(|o| &o.location == location)
            .map(|o| (o.timestamp, o))
            .collect();
        Self { by_hour }
    }

    pub fn get(&self, hour: DateTime<Utc>) -> Option<&Observation> {
        self.by_hour.get(&hour)
    }

    pub fn insert(&mut self, observation: Observation) {
        self.by_hour.insert(observation.timestamp, observation);
    }

    pub fn len(&self) -> usize {
        self.by_hour.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hour.is_empty()
    }

    /// Latest indexed hour at or before `hour`.
    pub fn latest_at_or_before(&self, hour: DateTime<Utc>) -> Option<&Observation> {
        self.by_hour.range(..=hour).next_back().map(|(_, o)| o)
    }

    fn pm2_5_at(&self, hour: DateTime<Utc>) -> Option<f64> {
        self.get(hour).and_then(|o| o.pollutants.pm2_5)
    }
}

/// Weather fields a row at hour T cannot be built without.
fn missing_weather(obs: &Observation) -> Vec<&'static str> {
    let w = &obs.weather;
    [
        ("temperature", w.temperature),
        ("relative_humidity", w.relative_humidity),
        ("wind_speed", w.wind_speed),
    ]
    .into_iter()
    .filter_map(|(name, v)| (!v.is_some_and(f64::is_finite)).then_some(name))
    .collect()
}

/// Features for `hour`, reading only index entries at or before `hour`.
///
/// The pollutant readings of `hour` itself are never used.
pub fn derive_features(hour: DateTime<Utc>, index: &ObservationIndex) -> PipelineResult<Features> {
    let Some(current) = index.get(hour) else {
        return Err(PipelineError::IncompleteData {
            timestamp: hour,
            missing: vec!["observation"],
        });
    };
    let missing = missing_weather(current);
    if !missing.is_empty() {
        return Err(PipelineError::IncompleteData {
            timestamp: hour,
            missing,
        });
    }
    let w = &current.weather;
    let temperature = w.temperature.unwrap_or_default();
    let relative_humidity = w.relative_humidity.unwrap_or_default();
    let wind_speed = w.wind_speed.unwrap_or_default();

    let lag = |h: i64| hour - TimeDelta::hours(h);
    let pm2_5_lag1 = index.pm2_5_at(lag(1));
    let prev = index.get(lag(1));

    let trailing: Vec<f64> = (1..=LOOKBACK_HOURS)
        .filter_map(|h| index.pm2_5_at(lag(h)))
        .collect();
    let pm2_5_mean_24h = (trailing.len() >= MIN_MEAN_COVERAGE)
        .then(|| trailing.iter().sum::<f64>() / trailing.len() as f64);

    let hour_frac = hour.hour() as f64 / 24.0;
    let dow_frac = hour.weekday().num_days_from_monday() as f64 / 7.0;

    Ok(Features {
        temperature,
        relative_humidity,
        wind_speed,
        hour_sin: (TAU * hour_frac).sin(),
        hour_cos: (TAU * hour_frac).cos(),
        dow_sin: (TAU * dow_frac).sin(),
        dow_cos: (TAU * dow_frac).cos(),
        pm2_5_lag1,
        pm2_5_lag2: index.pm2_5_at(lag(2)),
        pm2_5_lag3: index.pm2_5_at(lag(3)),
        pm2_5_lag24: index.pm2_5_at(lag(24)),
        pm2_5_mean_24h,
        pm10_lag1: prev.and_then(|o| o.pollutants.pm10),
        no2_lag1: prev.and_then(|o| o.pollutants.no2),
        wind_x_pm2_5_lag1: pm2_5_lag1.map(|p| p * wind_speed),
    })
}

/// Full training row for `hour`: features plus the PM2.5 label.
pub fn derive_row(
    hour: DateTime<Utc>,
    location: &LocationId,
    index: &ObservationIndex,
) -> PipelineResult<FeatureRow> {
    let features = derive_features(hour, index)?;
    let target = index.pm2_5_at(hour).filter(|v| v.is_finite());
    if target.is_none() {
        return Err(PipelineError::IncompleteData {
            timestamp: hour,
            missing: vec!["pm2_5"],
        });
    }
    Ok(FeatureRow {
        timestamp: hour,
        location: location.clone(),
        schema_version: FEATURE_SCHEMA_VERSION,
        features,
        target,
    })
}
