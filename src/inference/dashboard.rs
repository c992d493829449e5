//! Read-only access for the dashboard.
//!
//! The last champion read that succeeded is cached. When the registry cannot
//! be read, the cached record is served and flagged stale.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::common::error::PipelineResult;
use crate::data::domain::{FeatureRow, FeatureStore, LocationId};
use crate::registry::domain::{ChampionRecord, RegistryRead};

#[derive(Clone, Debug, PartialEq)]
pub struct ChampionView {
    pub record: Option<ChampionRecord>,
    /// Served from cache because the registry read failed.
    pub stale: bool,
}

pub struct DashboardReader {
    registry: Arc<dyn RegistryRead>,
    store: Arc<dyn FeatureStore>,
    cache: RwLock<Option<ChampionRecord>>,
}

impl DashboardReader {
    pub fn new(registry: Arc<dyn RegistryRead>, store: Arc<dyn FeatureStore>) -> Self {
        Self {
            registry,
            store,
            cache: RwLock::new(None),
        }
    }

    pub fn current_champion(&self) -> PipelineResult<ChampionView> {
        match self.registry.current_champion() {
            Ok(record) => {
                *self.cache.write() = record.clone();
                Ok(ChampionView { record, stale: false })
            }
            Err(err) => {
                let cached = self.cache.read().clone();
                match cached {
                    Some(record) => {
                        tracing::warn!(error = %err, version = %record.version, "registry read failed; serving cached champion");
                        Ok(ChampionView {
                            record: Some(record),
                            stale: true,
                        })
                    }
                    None => Err(err),
                }
            }
        }
    }

    pub fn read_range(
        &self,
        location: &LocationId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> PipelineResult<Vec<FeatureRow>> {
        self.store.read_range(location, start, end)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;
    use crate::common::error::PipelineError;
    use crate::data::repo_sqlite::SqliteFeatureStore;
    use crate::evaluation::domain::Metrics;
    use crate::registry::domain::VersionId;
    use crate::training::domain::{AlgorithmId, ArtifactRef, TrainingWindow};

    struct Flaky {
        down: AtomicBool,
        record: ChampionRecord,
    }

    impl RegistryRead for Flaky {
        fn current_champion(&self) -> PipelineResult<Option<ChampionRecord>> {
            if self.down.load(Ordering::SeqCst) {
                return Err(PipelineError::Timeout {
                    operation: "store lock",
                    after: None,
                });
            }
            Ok(Some(self.record.clone()))
        }

        fn history(&self) -> PipelineResult<Vec<ChampionRecord>> {
            Ok(vec![self.record.clone()])
        }

        fn champion(&self, _: VersionId) -> PipelineResult<Option<ChampionRecord>> {
            Ok(None)
        }
    }

    fn record() -> ChampionRecord {
        let t = Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap();
        ChampionRecord {
            version: VersionId(2),
            algorithm: AlgorithmId::GradientBoosting,
            artifact: ArtifactRef {
                id: "gb".into(),
                sha256: "00".into(),
            },
            metrics: Metrics {
                rmse: 4.2,
                mae: 3.1,
                r2: 0.7,
            },
            protocol: "chrono-holdout-v1@0.2".into(),
            window: TrainingWindow {
                location: LocationId::new("karachi"),
                start: t,
                end: t,
                row_count: 720,
                schema_version: 1,
                digest: "d".into(),
            },
            promoted_at: t,
            leaderboard: Vec::new(),
            note: None,
        }
    }

    fn reader(dir: &TempDir, registry: Arc<Flaky>) -> DashboardReader {
        let store = SqliteFeatureStore::open(&dir.path().join("fs.sqlite3"), Duration::from_secs(1)).unwrap();
        DashboardReader::new(registry, Arc::new(store))
    }

    #[test]
    fn serves_cached_champion_when_registry_is_down() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(Flaky {
            down: AtomicBool::new(false),
            record: record(),
        });
        let dash = reader(&dir, Arc::clone(&registry));

        let fresh = dash.current_champion().unwrap();
        assert!(!fresh.stale);

        registry.down.store(true, Ordering::SeqCst);
        let cached = dash.current_champion().unwrap();
        assert!(cached.stale);
        assert_eq!(cached.record, fresh.record);
    }

    #[test]
    fn cold_cache_surfaces_the_error() {
        let dir = TempDir::new().unwrap();
        let dash = reader(
            &dir,
            Arc::new(Flaky {
                down: AtomicBool::new(true),
                record: record(),
            }),
        );
        assert!(dash.current_champion().is_err());
    }
}
