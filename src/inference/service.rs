//! Recursive multi-hour forecasting from the champion artifact.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};

use crate::common::error::{PipelineError, PipelineResult};
use crate::data::domain::{LocationId, Observation, PollutantFields, WeatherFields, FEATURE_SCHEMA_VERSION};
use crate::data::features::{derive_features, ObservationIndex};
use crate::registry::domain::{ChampionRecord, RegistryRead};
use crate::training::domain::{ArtifactRepo, FittedModel, StoredModel};

use super::domain::{Forecast, ForecastPoint};

/// Current champion and its verified artifact.
pub fn load_champion(
    registry: &dyn RegistryRead,
    artifacts: &dyn ArtifactRepo,
) -> PipelineResult<(ChampionRecord, StoredModel)> {
    let record = registry
        .current_champion()?
        .ok_or_else(|| PipelineError::invalid("no champion has been promoted yet"))?;
    let stored = artifacts.get_artifact(&record.artifact)?;
    if stored.schema_version != FEATURE_SCHEMA_VERSION {
        return Err(PipelineError::artifact(format!(
            "{} was trained on feature schema {}, current schema is {}",
            record.artifact.id, stored.schema_version, FEATURE_SCHEMA_VERSION
        )));
    }
    Ok((record, stored))
}

fn merge_weather(outlook: Option<&WeatherFields>, carried: &WeatherFields) -> WeatherFields {
    let Some(o) = outlook else {
        return carried.clone();
    };
    WeatherFields {
        temperature: o.temperature.or(carried.temperature),
        relative_humidity: o.relative_humidity.or(carried.relative_humidity),
        wind_speed: o.wind_speed.or(carried.wind_speed),
        wind_direction: o.wind_direction.or(carried.wind_direction),
        pressure: o.pressure.or(carried.pressure),
    }
}

/// Forecast `horizon` hours starting at `from_hour`.
///
/// Each predicted PM2.5 is fed back as the lag for the following hours.
/// Weather comes from `outlook` where it has a value, otherwise the last
/// known reading is carried forward; PM10 and NO2 are carried forward.
pub fn forecast(
    model: &FittedModel,
    champion: &ChampionRecord,
    location: &LocationId,
    history: &[Observation],
    outlook: &[Observation],
    from_hour: DateTime<Utc>,
    horizon: u32,
) -> PipelineResult<Forecast> {
    let mut index = ObservationIndex::new(
        location,
        history.iter().filter(|o| o.timestamp < from_hour).cloned(),
    );
    let last = index
        .latest_at_or_before(from_hour - TimeDelta::hours(1))
        .cloned()
        .ok_or(PipelineError::InsufficientData {
            required: 1,
            actual: 0,
        })?;
    let outlook: BTreeMap<_, _> = outlook
        .iter()
        .filter(|o| &o.location == location)
        .map(|o| (o.timestamp, &o.weather))
        .collect();

    let mut weather = last.weather.clone();
    let carried = PollutantFields {
        pm2_5: None,
        pm10: last.pollutants.pm10,
        o3: None,
        no2: last.pollutants.no2,
    };
    let mut points = Vec::with_capacity(horizon as usize);
    for step in 0..i64::from(horizon) {
        let hour = from_hour + TimeDelta::hours(step);
        weather = merge_weather(outlook.get(&hour).copied(), &weather);
        index.insert(Observation {
            timestamp: hour,
            location: location.clone(),
            weather: weather.clone(),
            pollutants: carried.clone(),
        });

        let features = derive_features(hour, &index)?;
        let x = features.vector().ok_or_else(|| PipelineError::IncompleteData {
            timestamp: hour,
            missing: features.missing(),
        })?;
        let predicted = model.predict(&x);
        if !predicted.is_finite() {
            return Err(PipelineError::invalid(format!("non-finite prediction for {hour}")));
        }
        let pm2_5 = predicted.max(0.0);
        index.insert(Observation {
            timestamp: hour,
            location: location.clone(),
            weather: weather.clone(),
            pollutants: PollutantFields {
                pm2_5: Some(pm2_5),
                ..carried.clone()
            },
        });
        points.push(ForecastPoint::new(hour, pm2_5));
    }

    Ok(Forecast {
        location: location.clone(),
        champion: champion.version,
        issued_for: from_hour,
        points,
    })
}
