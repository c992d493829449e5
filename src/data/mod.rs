//! Data domain: observations, feature engineering and the feature store.

pub mod domain;
pub mod features;
pub mod repo_sqlite;
pub mod service;
pub mod source;

pub use domain::{
    FeatureKey, FeatureRow, FeatureStore, Features, Location, LocationId, Observation,
    ObservationSource, FEATURE_NAMES, FEATURE_SCHEMA_VERSION,
};
pub use repo_sqlite::SqliteFeatureStore;
pub use source::JsonlObservationSource;
