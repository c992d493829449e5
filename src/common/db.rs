//! SQLite connection setup shared by the feature store and the registry.

use std::fs;
use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use super::error::{PipelineError, PipelineResult};

/// Open mode for a store handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    ReadWrite,
    /// Used by dashboard readers; never creates or migrates.
    ReadOnly,
}

/// Opens a connection with WAL journaling and a bounded busy timeout.
pub fn open_connection(path: &Path, access: Access, busy_timeout: Duration) -> PipelineResult<Connection> {
    let flags = match access {
        Access::ReadWrite => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| PipelineError::Store(format!("create {}: {e}", parent.display())))?;
            }
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX
        }
        Access::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
    };
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(busy_timeout)?;
    if access == Access::ReadWrite {
        // journal_mode returns the resulting mode as a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
    }
    Ok(conn)
}

/// Records `version` for `component` on first open, or checks it matches.
pub fn ensure_component_version(conn: &mut Connection, component: &str, version: i64) -> PipelineResult<()> {
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS store_meta (
            component TEXT PRIMARY KEY,
            version INTEGER NOT NULL
        );",
    )?;
    let existing: Option<i64> = tx
        .query_row(
            "SELECT version FROM store_meta WHERE component = ?1",
            params![component],
            |row| row.get(0),
        )
        .optional()?;
    match existing {
        None => {
            tx.execute(
                "INSERT INTO store_meta (component, version) VALUES (?1, ?2)",
                params![component, version],
            )?;
        }
        Some(found) if found == version => {}
        Some(found) => {
            return Err(PipelineError::Store(format!(
                "{component} schema version {found} is not supported (expected {version})"
            )));
        }
    }
    tx.commit()?;
    Ok(())
}
