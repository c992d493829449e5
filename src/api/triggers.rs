//! Scheduler-facing entry points.
//!
//! Every trigger takes the time it runs for explicitly and is safe to repeat:
//! ingestion upserts by key and a daily run over an already audited window is
//! a no-op.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use crate::common::config::AppCfg;
use crate::common::error::{PipelineError, PipelineResult};
use crate::common::log::StageTimer;
use crate::common::time::{hour_floor, HOUR};
use crate::data::domain::{FeatureRow, FeatureStore, Location, LocationId, Observation, ObservationSource};
use crate::data::features::LOOKBACK_HOURS;
use crate::data::repo_sqlite::SqliteFeatureStore;
use crate::data::service::{self as ingestion, BackfillReport, IngestDeps, RangeReport};
use crate::evaluation::domain::{AccuracyReport, LeaderboardEntry};
use crate::evaluation::service::{check_accuracy, holdout_split};
use crate::inference::dashboard::DashboardReader;
use crate::inference::domain::Forecast;
use crate::inference::service::{forecast, load_champion};
use crate::registry::domain::{ChampionRecord, ModelRegistry, RegistryRead, RunAudit, RunOutcome, VersionId};
use crate::registry::repo_sqlite::SqliteRegistry;
use crate::registry::service::{promote, rebaseline, rollback, PromotionOutcome};
use crate::training::domain::{leaderboard, TrainConfig, TrainingSnapshot};
use crate::training::ensemble::default_algorithms;
use crate::training::repo_fs::FsArtifactRepo;
use crate::training::service::{rolling_window, snapshot, train, usable_examples};

/// Hours the live accuracy check looks back over.
pub const ACCURACY_HOURS: usize = 24;

/// What a daily tick did.
#[derive(Clone, Debug, PartialEq)]
pub enum DailyOutcome {
    Ran(RunAudit),
    /// The window was already audited by an earlier tick.
    AlreadyProcessed(RunAudit),
}

impl DailyOutcome {
    pub fn audit(&self) -> &RunAudit {
        match self {
            DailyOutcome::Ran(audit) | DailyOutcome::AlreadyProcessed(audit) => audit,
        }
    }
}

/// The wired pipeline: one feature store, one registry, one artifact root.
pub struct Pipeline {
    cfg: AppCfg,
    ingest: IngestDeps,
    store: Arc<SqliteFeatureStore>,
    registry: Arc<SqliteRegistry>,
    artifacts: FsArtifactRepo,
    train_cfg: TrainConfig,
}

impl Pipeline {
    pub fn open(cfg: AppCfg, source: Arc<dyn ObservationSource>) -> PipelineResult<Self> {
        let db = cfg.database_path();
        let store = Arc::new(SqliteFeatureStore::open(&db, cfg.store_busy_timeout)?);
        let registry = Arc::new(SqliteRegistry::open(&db, cfg.store_busy_timeout)?);
        let ingest = IngestDeps {
            source,
            store: Arc::clone(&store) as Arc<dyn FeatureStore>,
            location: Location {
                id: LocationId::new(cfg.location.clone()),
                latitude: cfg.latitude,
                longitude: cfg.longitude,
            },
            fetch_timeout: cfg.fetch_timeout,
        };
        Ok(Self {
            artifacts: FsArtifactRepo::new(&cfg),
            train_cfg: TrainConfig::from_app(&cfg),
            cfg,
            ingest,
            store,
            registry,
        })
    }

    pub fn location(&self) -> &LocationId {
        &self.ingest.location.id
    }

    /// Ingest the hour containing `now`.
    pub fn on_hourly_tick(&self, now: DateTime<Utc>) -> PipelineResult<FeatureRow> {
        ingestion::ingest_hour(&self.ingest, now)
    }

    pub fn on_backfill_request(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> PipelineResult<BackfillReport> {
        if start >= end {
            return Err(PipelineError::invalid(format!("empty backfill range {start}..{end}")));
        }
        ingestion::backfill(&self.ingest, start, end, self.cfg.backfill_batch_hours)
    }

    /// Recompute `[start, end)` from the observation archive.
    pub fn reprocess(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> PipelineResult<RangeReport> {
        ingestion::reprocess(self.store.as_ref(), self.location(), start, end)
    }

    /// Train on the window ending at `now` and promote if a candidate wins.
    ///
    /// Every run that gets as far as a snapshot leaves an audit row. Runs that
    /// end in [`PipelineError::InsufficientData`] or
    /// [`PipelineError::NoCandidates`] are audited and then reported as errors,
    /// and repeating the tick reports the same error. Losing the pointer race
    /// to another run is not an error: the winner is accepted and the run is
    /// audited as superseded. When two ticks audit the same window, the one
    /// whose audit landed second returns the stored audit as already processed.
    pub fn on_daily_tick(&self, now: DateTime<Utc>) -> PipelineResult<DailyOutcome> {
        let timer = StageTimer::start("trigger");
        let result = self.daily(now);
        match &result {
            Ok(DailyOutcome::Ran(audit)) => {
                tracing::info!(run_id = %audit.run_id, outcome = audit.outcome.as_str(), champion = ?audit.champion_version.map(|v| v.0), "daily run finished");
                timer.ok("trigger.daily");
            }
            Ok(DailyOutcome::AlreadyProcessed(audit)) => {
                tracing::info!(run_id = %audit.run_id, outcome = audit.outcome.as_str(), "window already processed");
                timer.ok("trigger.daily.skip");
            }
            Err(err) => timer.fail("trigger.daily", err),
        }
        result
    }

    fn daily(&self, now: DateTime<Utc>) -> PipelineResult<DailyOutcome> {
        let (start, end) = rolling_window(now, self.cfg.training_window_hours);
        let snapshot = snapshot(self.store.as_ref(), self.location(), start, end)?;
        let run_id = snapshot.run_id(&self.train_cfg);
        if let Some(audit) = self.registry.find_run(&run_id)? {
            return self.replay(&snapshot, audit);
        }

        let current = self.registry.current_champion()?;
        let current_version = current.as_ref().map(|c| c.version);
        let algorithms = default_algorithms(&self.train_cfg.algorithms, self.train_cfg.seed);
        let candidates = match train(&snapshot, &self.train_cfg, &algorithms) {
            Ok(candidates) => candidates,
            Err(err @ PipelineError::InsufficientData { .. }) => {
                self.audit(&run_id, &snapshot, Vec::new(), RunOutcome::InsufficientData, current_version, now)?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        let board = leaderboard(&candidates);

        let (outcome, champion) =
            match promote(self.registry.as_ref(), &self.artifacts, &candidates, current.as_ref(), now) {
                Ok(PromotionOutcome::Promoted(record)) => (RunOutcome::Promoted, Some(record.version)),
                Ok(PromotionOutcome::Retained { champion, .. }) => (RunOutcome::Retained, Some(champion.version)),
                Err(PipelineError::NoCandidates) => {
                    self.audit(&run_id, &snapshot, board, RunOutcome::NoCandidates, current_version, now)?;
                    return Err(PipelineError::NoCandidates);
                }
                Err(PipelineError::RegistryConflict { .. }) => {
                    let winner = self.registry.current_champion()?.map(|c| c.version);
                    tracing::warn!(run_id = %run_id, winner = ?winner.map(|v| v.0), "superseded by a concurrent promotion");
                    (RunOutcome::Superseded, winner)
                }
                Err(err) => return Err(err),
            };
        match self.audit(&run_id, &snapshot, board, outcome, champion, now)? {
            DailyOutcome::AlreadyProcessed(stored) => self.replay(&snapshot, stored),
            ran => Ok(ran),
        }
    }

    /// Report an audited run the way the run itself was reported.
    fn replay(&self, snapshot: &TrainingSnapshot, audit: RunAudit) -> PipelineResult<DailyOutcome> {
        match audit.outcome {
            RunOutcome::InsufficientData => {
                let examples = usable_examples(snapshot, &self.train_cfg)?;
                holdout_split(&examples, &self.train_cfg.protocol)?;
                Err(PipelineError::InsufficientData {
                    required: self.train_cfg.min_rows,
                    actual: examples.len(),
                })
            }
            RunOutcome::NoCandidates => Err(PipelineError::NoCandidates),
            _ => Ok(DailyOutcome::AlreadyProcessed(audit)),
        }
    }

    fn audit(
        &self,
        run_id: &str,
        snapshot: &TrainingSnapshot,
        leaderboard: Vec<LeaderboardEntry>,
        outcome: RunOutcome,
        champion_version: Option<VersionId>,
        recorded_at: DateTime<Utc>,
    ) -> PipelineResult<DailyOutcome> {
        let audit = RunAudit {
            run_id: run_id.to_string(),
            window: snapshot.window.clone(),
            protocol: self.train_cfg.protocol.id.clone(),
            leaderboard,
            outcome,
            champion_version,
            recorded_at,
        };
        if self.registry.record_run(&audit)? {
            return Ok(DailyOutcome::Ran(audit));
        }
        let stored = self
            .registry
            .find_run(run_id)?
            .ok_or_else(|| PipelineError::Store(format!("run {run_id} reported as audited but not found")))?;
        tracing::info!(run_id, outcome = stored.outcome.as_str(), "run audited concurrently");
        Ok(DailyOutcome::AlreadyProcessed(stored))
    }

    /// Forecast weather for the hours a forecast at `now` covers.
    pub fn outlook(&self, now: DateTime<Utc>) -> PipelineResult<Vec<Observation>> {
        let from_hour = hour_floor(now) + HOUR;
        let until = from_hour + TimeDelta::hours(i64::from(self.cfg.forecast_horizon_hours));
        ingestion::fetch(&self.ingest, from_hour, until)
    }

    /// Forecast the hours after the one containing `now` with the current champion.
    ///
    /// `outlook` supplies forecast weather for those hours where available.
    pub fn forecast(&self, now: DateTime<Utc>, outlook: &[Observation]) -> PipelineResult<Forecast> {
        let (record, stored) = load_champion(self.registry.as_ref(), &self.artifacts)?;
        let from_hour = hour_floor(now) + HOUR;
        let history = self.store.read_observations(
            self.location(),
            from_hour - TimeDelta::hours(2 * LOOKBACK_HOURS),
            from_hour,
        )?;
        forecast(
            &stored.model,
            &record,
            self.location(),
            &history,
            outlook,
            from_hour,
            self.cfg.forecast_horizon_hours,
        )
    }

    /// Score the champion on the latest real hours up to and including `now`'s hour.
    pub fn check_accuracy(&self, now: DateTime<Utc>) -> PipelineResult<AccuracyReport> {
        let (_, stored) = load_champion(self.registry.as_ref(), &self.artifacts)?;
        let end = hour_floor(now) + HOUR;
        let rows = self
            .store
            .read_range(self.location(), end - TimeDelta::hours(ACCURACY_HOURS as i64), end)?;
        let report = check_accuracy(&stored.model, &rows, ACCURACY_HOURS)?;
        tracing::info!(evaluated = report.evaluated, rmse = report.rmse, mae = report.mae, "live accuracy checked");
        Ok(report)
    }

    pub fn rollback(&self, version: VersionId, now: DateTime<Utc>) -> PipelineResult<ChampionRecord> {
        rollback(self.registry.as_ref(), &self.artifacts, version, now)
    }

    /// Re-score the champion under the configured protocol on the window
    /// ending at `now`, so daily runs can compare against it again.
    pub fn rebaseline(&self, now: DateTime<Utc>) -> PipelineResult<ChampionRecord> {
        let (start, end) = rolling_window(now, self.cfg.training_window_hours);
        let snapshot = snapshot(self.store.as_ref(), self.location(), start, end)?;
        rebaseline(self.registry.as_ref(), &self.artifacts, &snapshot, &self.train_cfg, now)
    }

    pub fn history(&self) -> PipelineResult<Vec<ChampionRecord>> {
        self.registry.history()
    }

    /// Read path with cached fallback, sharing this pipeline's handles.
    pub fn dashboard(&self) -> DashboardReader {
        DashboardReader::new(
            Arc::clone(&self.registry) as Arc<dyn RegistryRead>,
            Arc::clone(&self.store) as Arc<dyn FeatureStore>,
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;
    use crate::common::error::FetchError;
    use crate::data::features::tests::obs;

    struct Fixed(Vec<Observation>);

    impl ObservationSource for Fixed {
        fn fetch_observations(
            &self,
            location: &Location,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<Observation>, FetchError> {
            Ok(self
                .0
                .iter()
                .filter(|o| o.location == location.id && o.timestamp >= start && o.timestamp < end)
                .cloned()
                .collect())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn pipeline(dir: &TempDir, hours: i64) -> Pipeline {
        let cfg = AppCfg {
            data_root: dir.path().to_path_buf(),
            training_window_hours: 240,
            min_training_rows: 168,
            ..AppCfg::default()
        };
        let series = (0..hours).map(|h| obs(t0() + TimeDelta::hours(h), 20.0 + (h % 24) as f64)).collect();
        Pipeline::open(cfg, Arc::new(Fixed(series))).unwrap()
    }

    #[test]
    fn short_history_is_audited_as_insufficient() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir, 72);
        let end = t0() + TimeDelta::hours(72);
        p.on_backfill_request(t0(), end).unwrap();

        let err = p.on_daily_tick(end).unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientData { .. }));
        assert!(p.dashboard().current_champion().unwrap().record.is_none());

        let again = p.on_daily_tick(end).unwrap_err();
        assert_eq!(again.code(), err.code());
        assert_eq!(again.to_string(), err.to_string());

        let (start, end) = rolling_window(end, 240);
        let snap = snapshot(p.store.as_ref(), p.location(), start, end).unwrap();
        let audit = p.registry.find_run(&snap.run_id(&p.train_cfg)).unwrap().unwrap();
        assert_eq!(audit.outcome, RunOutcome::InsufficientData);
        assert!(audit.leaderboard.is_empty());
    }

    #[test]
    fn forecast_without_champion_is_invalid() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir, 48);
        let err = p.forecast(t0() + TimeDelta::hours(47), &[]).unwrap_err();
        assert!(matches!(err, PipelineError::Invalid(_)));
    }

    #[test]
    fn empty_backfill_range_is_rejected() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir, 24);
        assert!(p.on_backfill_request(t0(), t0()).is_err());
    }
}
