//! Forecast types and the PM2.5 to AQI conversion.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::domain::LocationId;
use crate::registry::domain::VersionId;

/// US EPA PM2.5 breakpoints (2024 revision): `(c_lo, c_hi, i_lo, i_hi)`.
const PM25_BREAKPOINTS: [(f64, f64, f64, f64); 6] = [
    (0.0, 9.0, 0.0, 50.0),
    (9.1, 35.4, 51.0, 100.0),
    (35.5, 55.4, 101.0, 150.0),
    (55.5, 125.4, 151.0, 200.0),
    (125.5, 225.4, 201.0, 300.0),
    (225.5, 325.4, 301.0, 500.0),
];

const AQI_MAX: u32 = 500;

/// AQI for a 1-hour PM2.5 concentration in µg/m³.
///
/// The concentration is truncated to one decimal first; anything above the
/// top breakpoint reports the scale maximum.
pub fn aqi_from_pm25(pm2_5: f64) -> u32 {
    if !pm2_5.is_finite() || pm2_5 <= 0.0 {
        return 0;
    }
    let c = (pm2_5 * 10.0).floor() / 10.0;
    PM25_BREAKPOINTS
        .iter()
        .find(|(_, c_hi, _, _)| c <= *c_hi)
        .map_or(AQI_MAX, |&(c_lo, c_hi, i_lo, i_hi)| {
            ((i_hi - i_lo) / (c_hi - c_lo) * (c - c_lo) + i_lo).round() as u32
        })
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AqiCategory {
    Good,
    Moderate,
    UnhealthyForSensitiveGroups,
    Unhealthy,
    VeryUnhealthy,
    Hazardous,
}

impl AqiCategory {
    pub fn from_aqi(aqi: u32) -> Self {
        match aqi {
            0..=50 => AqiCategory::Good,
            51..=100 => AqiCategory::Moderate,
            101..=150 => AqiCategory::UnhealthyForSensitiveGroups,
            151..=200 => AqiCategory::Unhealthy,
            201..=300 => AqiCategory::VeryUnhealthy,
            _ => AqiCategory::Hazardous,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AqiCategory::Good => "Good",
            AqiCategory::Moderate => "Moderate",
            AqiCategory::UnhealthyForSensitiveGroups => "Unhealthy for Sensitive Groups",
            AqiCategory::Unhealthy => "Unhealthy",
            AqiCategory::VeryUnhealthy => "Very Unhealthy",
            AqiCategory::Hazardous => "Hazardous",
        }
    }
}

impl fmt::Display for AqiCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub pm2_5: f64,
    pub aqi: u32,
    pub category: AqiCategory,
}

impl ForecastPoint {
    pub fn new(timestamp: DateTime<Utc>, pm2_5: f64) -> Self {
        let aqi = aqi_from_pm25(pm2_5);
        Self {
            timestamp,
            pm2_5,
            aqi,
            category: AqiCategory::from_aqi(aqi),
        }
    }
}

/// Hourly outlook produced by one champion version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub location: LocationId,
    pub champion: VersionId,
    /// First forecast hour.
    pub issued_for: DateTime<Utc>,
    pub points: Vec<ForecastPoint>,
}

impl Forecast {
    /// Worst hour of the outlook.
    pub fn peak(&self) -> Option<&ForecastPoint> {
        self.points.iter().max_by_key(|p| p.aqi)
    }
}
