//! SQLite-backed feature store.
//!
//! Each row is written by its own `INSERT … ON CONFLICT DO UPDATE` statement,
//! so a row is either fully replaced or untouched, and writers to the same
//! key are serialized by SQLite's write lock.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::common::db::{self, Access};
use crate::common::error::{PipelineError, PipelineResult};
use crate::common::time::is_hour_aligned;

use super::domain::{FeatureKey, FeatureRow, FeatureStore, Features, LocationId, Observation, UpsertReport};

const COMPONENT: &str = "feature_store";
const STORE_VERSION: i64 = 1;

/// Feature store persisted in a single SQLite file.
pub struct SqliteFeatureStore {
    conn: Mutex<Connection>,
}

impl SqliteFeatureStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: &Path, busy_timeout: Duration) -> PipelineResult<Self> {
        let mut conn = db::open_connection(path, Access::ReadWrite, busy_timeout)?;
        db::ensure_component_version(&mut conn, COMPONENT, STORE_VERSION)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS feature_rows (
                location TEXT NOT NULL,
                ts INTEGER NOT NULL,
                schema_version INTEGER NOT NULL,
                target REAL,
                features_json TEXT NOT NULL,
                PRIMARY KEY (location, ts)
            );
            CREATE TABLE IF NOT EXISTS observations (
                location TEXT NOT NULL,
                ts INTEGER NOT NULL,
                observation_json TEXT NOT NULL,
                PRIMARY KEY (location, ts)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Read-only handle for dashboard readers.
    pub fn open_read_only(path: &Path, busy_timeout: Duration) -> PipelineResult<Self> {
        let conn = db::open_connection(path, Access::ReadOnly, busy_timeout)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn check_row(row: &FeatureRow) -> Result<(), String> {
    if !is_hour_aligned(row.timestamp) {
        return Err("timestamp is not hour-aligned".into());
    }
    if !row.features.is_finite() || row.target.is_some_and(|t| !t.is_finite()) {
        return Err("non-finite feature or target value".into());
    }
    Ok(())
}

fn write_row(conn: &Connection, row: &FeatureRow) -> Result<(), String> {
    check_row(row)?;
    let features_json = serde_json::to_string(&row.features).map_err(|e| e.to_string())?;
    conn.prepare_cached(
        "INSERT INTO feature_rows (location, ts, schema_version, target, features_json)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(location, ts) DO UPDATE SET
            schema_version = excluded.schema_version,
            target = excluded.target,
            features_json = excluded.features_json",
    )
    .and_then(|mut stmt| {
        stmt.execute(params![
            row.location.as_str(),
            row.timestamp.timestamp(),
            row.schema_version,
            row.target,
            features_json
        ])
    })
    .map(|_| ())
    .map_err(|e| e.to_string())
}

fn write_observation(conn: &Connection, obs: &Observation) -> Result<(), String> {
    if !is_hour_aligned(obs.timestamp) {
        return Err("timestamp is not hour-aligned".into());
    }
    let json = serde_json::to_string(obs).map_err(|e| e.to_string())?;
    conn.prepare_cached(
        "INSERT INTO observations (location, ts, observation_json) VALUES (?1, ?2, ?3)
         ON CONFLICT(location, ts) DO UPDATE SET observation_json = excluded.observation_json",
    )
    .and_then(|mut stmt| stmt.execute(params![obs.location.as_str(), obs.timestamp.timestamp(), json]))
    .map(|_| ())
    .map_err(|e| e.to_string())
}

fn from_unix(ts: i64) -> PipelineResult<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| PipelineError::Store(format!("corrupt timestamp {ts}")))
}

impl FeatureStore for SqliteFeatureStore {
    fn upsert(&self, rows: &[FeatureRow]) -> PipelineResult<UpsertReport> {
        let conn = self.conn.lock();
        let mut report = UpsertReport::default();
        for row in rows {
            match write_row(&conn, row) {
                Ok(()) => report.written += 1,
                Err(reason) => {
                    tracing::warn!(key = %row.key(), %reason, "feature row upsert failed");
                    report.failed.push((row.key(), reason));
                }
            }
        }
        Ok(report)
    }

    fn read_range(
        &self,
        location: &LocationId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> PipelineResult<Vec<FeatureRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ts, schema_version, target, features_json FROM feature_rows
             WHERE location = ?1 AND ts >= ?2 AND ts < ?3
             ORDER BY ts ASC",
        )?;
        let raw = stmt
            .query_map(
                params![location.as_str(), start.timestamp(), end.timestamp()],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, u32>(1)?,
                        r.get::<_, Option<f64>>(2)?,
                        r.get::<_, String>(3)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(ts, schema_version, target, json)| -> PipelineResult<FeatureRow> {
                let features: Features = serde_json::from_str(&json)?;
                Ok(FeatureRow {
                    timestamp: from_unix(ts)?,
                    location: location.clone(),
                    schema_version,
                    features,
                    target,
                })
            })
            .collect()
    }

    fn archive_observations(&self, observations: &[Observation]) -> PipelineResult<UpsertReport> {
        let conn = self.conn.lock();
        let mut report = UpsertReport::default();
        for obs in observations {
            match write_observation(&conn, obs) {
                Ok(()) => report.written += 1,
                Err(reason) => report.failed.push((
                    FeatureKey {
                        location: obs.location.clone(),
                        timestamp: obs.timestamp,
                    },
                    reason,
                )),
            }
        }
        Ok(report)
    }

    fn read_observations(
        &self,
        location: &LocationId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> PipelineResult<Vec<Observation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT observation_json FROM observations
             WHERE location = ?1 AND ts >= ?2 AND ts < ?3
             ORDER BY ts ASC",
        )?;
        let raw = stmt
            .query_map(
                params![location.as_str(), start.timestamp(), end.timestamp()],
                |r| r.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        raw.iter()
            .map(|json| -> PipelineResult<Observation> { Ok(serde_json::from_str(json)?) })
            .collect()
    }

    fn stale_keys(&self, location: &LocationId, schema_version: u32) -> PipelineResult<Vec<FeatureKey>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ts FROM feature_rows WHERE location = ?1 AND schema_version <> ?2 ORDER BY ts ASC",
        )?;
        let raw = stmt
            .query_map(params![location.as_str(), schema_version], |r| r.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|ts| -> PipelineResult<FeatureKey> {
                Ok(FeatureKey {
                    location: location.clone(),
                    timestamp: from_unix(ts)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use tempfile::TempDir;

    use super::*;
    use crate::data::domain::FEATURE_SCHEMA_VERSION;
    use crate::data::features::{derive_row, tests::obs, ObservationIndex};

    fn store(dir: &TempDir) -> SqliteFeatureStore {
        SqliteFeatureStore::open(&dir.path().join("fs.sqlite3"), Duration::from_secs(2)).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn row(h: i64, pm: f64) -> FeatureRow {
        let loc = LocationId::new("karachi");
        let hour = t0() + TimeDelta::hours(h);
        let index = ObservationIndex::new(&loc, [obs(hour - TimeDelta::hours(1), 10.0), obs(hour, pm)]);
        derive_row(hour, &loc, &index).unwrap()
    }

    #[test]
    fn upsert_overwrites_by_key() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let loc = LocationId::new("karachi");

        assert_eq!(s.upsert(&[row(1, 20.0), row(2, 21.0)]).unwrap().written, 2);
        assert_eq!(s.upsert(&[row(1, 99.0)]).unwrap().written, 1);

        let rows = s.read_range(&loc, t0(), t0() + TimeDelta::hours(24)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].target, Some(99.0));
        assert!(rows[0].timestamp < rows[1].timestamp);
    }

    #[test]
    fn read_range_is_half_open_and_leaves_gaps() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let loc = LocationId::new("karachi");
        s.upsert(&[row(5, 1.0), row(1, 1.0), row(3, 1.0)]).unwrap();

        let rows = s
            .read_range(&loc, t0() + TimeDelta::hours(1), t0() + TimeDelta::hours(5))
            .unwrap();
        let hours: Vec<_> = rows.iter().map(|r| (r.timestamp - t0()).num_hours()).collect();
        assert_eq!(hours, vec![1, 3]);
    }

    #[test]
    fn bad_rows_fail_individually() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let mut bad = row(2, 10.0);
        bad.timestamp += TimeDelta::minutes(30);
        let mut nan = row(3, 10.0);
        nan.target = Some(f64::NAN);

        let report = s.upsert(&[row(1, 10.0), bad.clone(), nan.clone()]).unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.failed_keys(), vec![bad.key(), nan.key()]);
    }

    #[test]
    fn stale_schema_rows_are_listed() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let loc = LocationId::new("karachi");
        let mut old = row(4, 10.0);
        old.schema_version = FEATURE_SCHEMA_VERSION - 1;
        s.upsert(&[row(1, 10.0), old.clone()]).unwrap();
        assert_eq!(s.stale_keys(&loc, FEATURE_SCHEMA_VERSION).unwrap(), vec![old.key()]);
    }

    #[test]
    fn observations_round_trip_through_archive() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let loc = LocationId::new("karachi");
        let o = obs(t0(), 12.5);
        s.archive_observations(&[o.clone()]).unwrap();
        let back = s.read_observations(&loc, t0(), t0() + TimeDelta::hours(1)).unwrap();
        assert_eq!(back, vec![o]);
    }
}
