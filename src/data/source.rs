//! Observation sources that read what the upstream API client exported.
//!
//! The HTTP client itself lives outside this crate; it drops one JSON
//! [`Observation`] per line into a file that the scheduled binary reads.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::common::error::FetchError;

use super::domain::{Location, Observation, ObservationSource};

/// Reads observations from a JSON-lines export.
pub struct JsonlObservationSource {
    path: PathBuf,
}

impl JsonlObservationSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ObservationSource for JsonlObservationSource {
    fn fetch_observations(
        &self,
        location: &Location,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>, FetchError> {
        let file = File::open(&self.path).map_err(|e| {
            FetchError::UpstreamUnavailable(format!("{}: {e}", self.path.display()))
        })?;
        let mut out = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| FetchError::UpstreamUnavailable(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let obs: Observation = serde_json::from_str(&line).map_err(|e| {
                FetchError::UpstreamUnavailable(format!(
                    "{}:{}: {e}",
                    self.path.display(),
                    lineno + 1
                ))
            })?;
            if obs.location == location.id && obs.timestamp >= start && obs.timestamp < end {
                out.push(obs);
            }
        }
        out.sort_by_key(|o| o.timestamp);
        Ok(out)
    }
}
