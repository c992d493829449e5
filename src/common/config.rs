//! Runtime configuration loaded from the environment (and an optional `.env`).

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::error::{PipelineError, PipelineResult};

/// Output format for the tracing subscriber.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(PipelineError::Config(format!("unknown log format {other:?}"))),
        }
    }
}

/// Snapshot of configuration values consumed by the pipeline.
#[derive(Clone, Debug)]
pub struct AppCfg {
    pub data_root: PathBuf,
    pub location: String,
    pub latitude: f64,
    pub longitude: f64,
    pub training_window_hours: u32,
    pub min_training_rows: usize,
    pub holdout_fraction: f64,
    pub fetch_timeout: Duration,
    pub store_busy_timeout: Duration,
    pub backfill_batch_hours: u32,
    pub forecast_horizon_hours: u32,
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl Default for AppCfg {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            location: "karachi".to_string(),
            latitude: 24.8607,
            longitude: 67.0011,
            training_window_hours: 720,
            min_training_rows: 168,
            holdout_fraction: 0.2,
            fetch_timeout: Duration::from_secs(30),
            store_busy_timeout: Duration::from_millis(5_000),
            backfill_batch_hours: 168,
            forecast_horizon_hours: 72,
            log_filter: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl AppCfg {
    /// Create a configuration snapshot from the process environment.
    ///
    /// A `.env` file in the working directory is honoured if present.
    pub fn load() -> PipelineResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> PipelineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let cfg = Self {
            data_root: lookup("AQI_DATA_ROOT").map(PathBuf::from).unwrap_or(d.data_root),
            location: lookup("AQI_LOCATION").unwrap_or(d.location),
            latitude: parse_or(&lookup, "AQI_LATITUDE", d.latitude)?,
            longitude: parse_or(&lookup, "AQI_LONGITUDE", d.longitude)?,
            training_window_hours: parse_or(
                &lookup,
                "AQI_TRAINING_WINDOW_HOURS",
                d.training_window_hours,
            )?,
            min_training_rows: parse_or(&lookup, "AQI_MIN_TRAINING_ROWS", d.min_training_rows)?,
            holdout_fraction: parse_or(&lookup, "AQI_HOLDOUT_FRACTION", d.holdout_fraction)?,
            fetch_timeout: Duration::from_secs(parse_or(
                &lookup,
                "AQI_FETCH_TIMEOUT_SECS",
                d.fetch_timeout.as_secs(),
            )?),
            store_busy_timeout: Duration::from_millis(parse_or(
                &lookup,
                "AQI_STORE_BUSY_TIMEOUT_MS",
                d.store_busy_timeout.as_millis() as u64,
            )?),
            backfill_batch_hours: parse_or(
                &lookup,
                "AQI_BACKFILL_BATCH_HOURS",
                d.backfill_batch_hours,
            )?,
            forecast_horizon_hours: parse_or(
                &lookup,
                "AQI_FORECAST_HORIZON_HOURS",
                d.forecast_horizon_hours,
            )?,
            log_filter: lookup("AQI_LOG").unwrap_or(d.log_filter),
            log_format: match lookup("AQI_LOG_FORMAT") {
                Some(raw) => raw.parse()?,
                None => d.log_format,
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> PipelineResult<()> {
        if !(self.holdout_fraction > 0.0 && self.holdout_fraction < 1.0) {
            return Err(PipelineError::Config(format!(
                "AQI_HOLDOUT_FRACTION must be in (0, 1), got {}",
                self.holdout_fraction
            )));
        }
        if self.min_training_rows == 0 {
            return Err(PipelineError::Config(
                "AQI_MIN_TRAINING_ROWS must be positive".into(),
            ));
        }
        if (self.training_window_hours as usize) < self.min_training_rows {
            return Err(PipelineError::Config(format!(
                "training window of {}h can never hold {} rows",
                self.training_window_hours, self.min_training_rows
            )));
        }
        if self.backfill_batch_hours == 0 || self.fetch_timeout.is_zero() {
            return Err(PipelineError::Config(
                "batch size and fetch timeout must be positive".into(),
            ));
        }
        Ok(())
    }

    /// SQLite database holding the feature store and the model registry.
    pub fn database_path(&self) -> PathBuf {
        self.data_root.join("pipeline.sqlite3")
    }

    /// Root directory for model artifacts.
    pub fn models_root(&self) -> PathBuf {
        self.data_root.join("models")
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> PipelineResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| PipelineError::Config(format!("{key}={raw:?}: {e}"))),
    }
}
