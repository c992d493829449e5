//! Error handling primitives shared across the pipeline.
//!
//! Every failure carries a stable [`ErrorCode`] so the scheduler-facing binary
//! can turn it into a process exit status and alerting can key on it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Stable error codes surfaced as process exit codes.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    /// Success code used as a sentinel.
    Ok = 0,
    /// Upstream API client failed or throttled us.
    Fetch = 1,
    /// Required raw fields were missing for an hour.
    IncompleteData = 2,
    /// Training window below the minimum row threshold.
    InsufficientData = 3,
    /// A single candidate failed to fit.
    ModelFit = 4,
    /// Every candidate failed; champion left unchanged.
    NoCandidates = 5,
    /// Lost a champion pointer race.
    RegistryConflict = 6,
    /// Feature store or registry I/O failed.
    Store = 7,
    /// An external call exceeded its bound.
    Timeout = 8,
    /// Stored rows were written under a different feature schema.
    SchemaMismatch = 9,
    /// Champion was scored under a different evaluation protocol.
    ProtocolMismatch = 10,
    /// Model artifact missing or corrupt.
    Artifact = 11,
    /// Configuration could not be parsed.
    Config = 12,
    /// Input failed validation.
    Invalid = 13,
}

/// Failures reported by the upstream observation client.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("rate limited by upstream (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },
}

/// Canonical error type for the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("incomplete observation for {timestamp}: missing {missing:?}")]
    IncompleteData {
        timestamp: DateTime<Utc>,
        missing: Vec<&'static str>,
    },
    #[error("training window has {actual} usable rows, need at least {required}")]
    InsufficientData { required: usize, actual: usize },
    #[error("{algorithm} failed to fit: {reason}")]
    ModelFit { algorithm: String, reason: String },
    #[error("no candidate fitted successfully; champion retained")]
    NoCandidates,
    #[error("champion pointer moved to version {current:?}; expected {expected:?}")]
    RegistryConflict {
        expected: Option<u64>,
        current: Option<u64>,
    },
    #[error("store: {0}")]
    Store(String),
    #[error("{operation} timed out (bound {after:?})")]
    Timeout {
        operation: &'static str,
        after: Option<Duration>,
    },
    #[error("{stale} stored rows use feature schema {found}, expected {expected}")]
    SchemaMismatch {
        found: u32,
        expected: u32,
        stale: usize,
    },
    #[error("champion scored under protocol {champion}, candidates under {candidates}")]
    ProtocolMismatch { champion: String, candidates: String },
    #[error("artifact: {0}")]
    Artifact(String),
    #[error("config: {0}")]
    Config(String),
    #[error("invalid input: {0}")]
    Invalid(String),
}

/// Result alias used throughout the crate.
pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Machine parsable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Fetch(_) => ErrorCode::Fetch,
            Self::IncompleteData { .. } => ErrorCode::IncompleteData,
            Self::InsufficientData { .. } => ErrorCode::InsufficientData,
            Self::ModelFit { .. } => ErrorCode::ModelFit,
            Self::NoCandidates => ErrorCode::NoCandidates,
            Self::RegistryConflict { .. } => ErrorCode::RegistryConflict,
            Self::Store(_) => ErrorCode::Store,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::SchemaMismatch { .. } => ErrorCode::SchemaMismatch,
            Self::ProtocolMismatch { .. } => ErrorCode::ProtocolMismatch,
            Self::Artifact(_) => ErrorCode::Artifact,
            Self::Config(_) => ErrorCode::Config,
            Self::Invalid(_) => ErrorCode::Invalid,
        }
    }

    /// Validation helper.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Artifact helper.
    pub fn artifact(msg: impl Into<String>) -> Self {
        Self::Artifact(msg.into())
    }

    /// Whether the failure should page someone rather than just be logged.
    pub fn is_alert_worthy(&self) -> bool {
        matches!(
            self,
            Self::NoCandidates
                | Self::Store(_)
                | Self::SchemaMismatch { .. }
                | Self::ProtocolMismatch { .. }
                | Self::Artifact(_)
        )
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref e, _)
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Self::Timeout {
                    operation: "store lock",
                    after: None,
                }
            }
            other => Self::Store(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(format!("serialization: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorCode::Ok as u32, 0);
        assert_eq!(ErrorCode::Fetch as u32, 1);
        assert_eq!(ErrorCode::IncompleteData as u32, 2);
        assert_eq!(ErrorCode::InsufficientData as u32, 3);
        assert_eq!(ErrorCode::ModelFit as u32, 4);
        assert_eq!(ErrorCode::NoCandidates as u32, 5);
        assert_eq!(ErrorCode::RegistryConflict as u32, 6);
        assert_eq!(ErrorCode::Store as u32, 7);
        assert_eq!(ErrorCode::Timeout as u32, 8);
        assert_eq!(ErrorCode::SchemaMismatch as u32, 9);
        assert_eq!(ErrorCode::ProtocolMismatch as u32, 10);
        assert_eq!(ErrorCode::Artifact as u32, 11);
        assert_eq!(ErrorCode::Config as u32, 12);
        assert_eq!(ErrorCode::Invalid as u32, 13);
    }

    #[test]
    fn fetch_errors_map_to_fetch_code() {
        let err: PipelineError = FetchError::RateLimited {
            retry_after_secs: Some(60),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::Fetch);
        assert!(!err.is_alert_worthy());
    }

    #[test]
    fn no_candidates_is_distinct_and_alert_worthy() {
        let err = PipelineError::NoCandidates;
        assert_eq!(err.code(), ErrorCode::NoCandidates);
        assert!(err.is_alert_worthy());
    }
}
