#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use aqi_forecast::data::domain::{LocationId, Observation, PollutantFields, WeatherFields};
use aqi_forecast::data::features::{derive_row, ObservationIndex};
use aqi_forecast::data::{FeatureStore, SqliteFeatureStore};
use chrono::{DateTime, TimeDelta, TimeZone, Timelike, Utc};

pub const LOCATION: &str = "karachi";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

pub fn at(hour: i64) -> DateTime<Utc> {
    t0() + TimeDelta::hours(hour)
}

pub fn location() -> LocationId {
    LocationId::new(LOCATION)
}

/// Daily cycle plus a slow drift, so lags carry real signal.
pub fn pm25(hour: i64) -> f64 {
    let h = hour as f64;
    35.0 + 15.0 * (std::f64::consts::TAU * (hour % 24) as f64 / 24.0).sin() + 5.0 * (h / 37.0).sin()
}

pub fn weather(ts: DateTime<Utc>) -> WeatherFields {
    WeatherFields {
        temperature: Some(24.0 + 6.0 * (ts.hour() as f64 / 24.0 * std::f64::consts::TAU).cos()),
        relative_humidity: Some(60.0),
        wind_speed: Some(8.0 + (ts.hour() % 5) as f64),
        wind_direction: Some(200.0),
        pressure: Some(1010.0),
    }
}

pub fn observation(hour: i64) -> Observation {
    let ts = at(hour);
    let pm = pm25(hour);
    Observation {
        timestamp: ts,
        location: location(),
        weather: weather(ts),
        pollutants: PollutantFields {
            pm2_5: Some(pm),
            pm10: Some(pm * 1.8),
            o3: Some(25.0),
            no2: Some(12.0 + pm / 10.0),
        },
    }
}

/// Weather-only row, as the upstream client exports for future hours.
pub fn outlook(hour: i64) -> Observation {
    let ts = at(hour);
    Observation {
        timestamp: ts,
        location: location(),
        weather: weather(ts),
        pollutants: PollutantFields::default(),
    }
}

pub fn series(hours: i64) -> Vec<Observation> {
    (0..hours).map(observation).collect()
}

/// Store with derived rows for hours `[24, hours)` of the synthetic series.
pub fn seeded_store(path: &Path, hours: i64) -> SqliteFeatureStore {
    let store = SqliteFeatureStore::open(path, Duration::from_secs(5)).unwrap();
    let index = ObservationIndex::new(&location(), series(hours));
    let rows: Vec<_> = (24..hours)
        .map(|h| derive_row(at(h), &location(), &index).unwrap())
        .collect();
    let report = store.upsert(&rows).unwrap();
    assert!(report.is_complete());
    store
}
