//! Inference: champion forecasts and the dashboard read path.

pub mod dashboard;
pub mod domain;
pub mod service;

pub use dashboard::{ChampionView, DashboardReader};
pub use domain::{aqi_from_pm25, AqiCategory, Forecast, ForecastPoint};
