//! SQLite model registry: append-only history plus a single pointer row.
//!
//! Every mutation runs in an IMMEDIATE transaction, so pointer swaps from
//! separate processes are serialized by the database write lock.

use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::common::db::{self, Access};
use crate::common::error::{PipelineError, PipelineResult};

use super::domain::{ChampionDraft, ChampionRecord, ModelRegistry, Precondition, RegistryRead, RunAudit, VersionId};

const COMPONENT: &str = "model_registry";
const REGISTRY_VERSION: i64 = 1;

pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    pub fn open(path: &Path, busy_timeout: Duration) -> PipelineResult<Self> {
        let mut conn = db::open_connection(path, Access::ReadWrite, busy_timeout)?;
        db::ensure_component_version(&mut conn, COMPONENT, REGISTRY_VERSION)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS champion_history (
                version INTEGER PRIMARY KEY,
                algorithm TEXT NOT NULL,
                rmse REAL NOT NULL,
                promoted_at INTEGER NOT NULL,
                record_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS champion_pointer (
                slot INTEGER PRIMARY KEY CHECK (slot = 1),
                version INTEGER NOT NULL REFERENCES champion_history(version)
            );
            CREATE TABLE IF NOT EXISTS training_runs (
                run_id TEXT PRIMARY KEY,
                recorded_at INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                audit_json TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Handle for readers without write access.
    pub fn open_read_only(path: &Path, busy_timeout: Duration) -> PipelineResult<Self> {
        let conn = db::open_connection(path, Access::ReadOnly, busy_timeout)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn to_version(raw: i64) -> PipelineResult<VersionId> {
    u64::try_from(raw)
        .map(VersionId)
        .map_err(|_| PipelineError::Store(format!("corrupt champion version {raw}")))
}

fn decode(json: &str) -> PipelineResult<ChampionRecord> {
    Ok(serde_json::from_str(json)?)
}

impl RegistryRead for SqliteRegistry {
    fn current_champion(&self) -> PipelineResult<Option<ChampionRecord>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT h.record_json FROM champion_pointer p
                 JOIN champion_history h ON h.version = p.version
                 WHERE p.slot = 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        json.as_deref().map(decode).transpose()
    }

    fn history(&self) -> PipelineResult<Vec<ChampionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT record_json FROM champion_history ORDER BY version ASC")?;
        let raw = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        raw.iter().map(|json| decode(json)).collect()
    }

    fn champion(&self, version: VersionId) -> PipelineResult<Option<ChampionRecord>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM champion_history WHERE version = ?1",
                params![version.0 as i64],
                |r| r.get(0),
            )
            .optional()?;
        json.as_deref().map(decode).transpose()
    }
}

impl ModelRegistry for SqliteRegistry {
    fn record_new_champion(&self, draft: ChampionDraft, precondition: Precondition) -> PipelineResult<VersionId> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = tx
            .query_row("SELECT version FROM champion_pointer WHERE slot = 1", [], |r| r.get::<_, i64>(0))
            .optional()?
            .map(to_version)
            .transpose()?;
        if let Precondition::Current(expected) = precondition {
            if expected != current {
                return Err(PipelineError::RegistryConflict {
                    expected: expected.map(|v| v.0),
                    current: current.map(|v| v.0),
                });
            }
        }

        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM champion_history",
            [],
            |r| r.get(0),
        )?;
        let version = to_version(next)?;
        let record = draft.into_record(version);
        tx.execute(
            "INSERT INTO champion_history (version, algorithm, rmse, promoted_at, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                next,
                record.algorithm.as_str(),
                record.metrics.rmse,
                record.promoted_at.timestamp(),
                serde_json::to_string(&record)?
            ],
        )?;
        tx.execute(
            "INSERT INTO champion_pointer (slot, version) VALUES (1, ?1)
             ON CONFLICT(slot) DO UPDATE SET version = excluded.version",
            params![next],
        )?;
        tx.commit()?;
        tracing::info!(
            version = %version,
            previous = ?current.map(|v| v.0),
            algorithm = %record.algorithm,
            rmse = record.metrics.rmse,
            "champion pointer swapped"
        );
        Ok(version)
    }

    fn record_run(&self, audit: &RunAudit) -> PipelineResult<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO training_runs (run_id, recorded_at, outcome, audit_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(run_id) DO NOTHING",
            params![
                audit.run_id,
                audit.recorded_at.timestamp(),
                audit.outcome.as_str(),
                serde_json::to_string(audit)?
            ],
        )?;
        Ok(inserted == 1)
    }

    fn find_run(&self, run_id: &str) -> PipelineResult<Option<RunAudit>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT audit_json FROM training_runs WHERE run_id = ?1",
                params![run_id],
                |r| r.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}
