//! SQLite-backed engine storage.
//!
//! Provides persistent storage for:
//! - The recovery snapshot of the in-flight session (kv row)
//! - The outcome ledger (one row per finished session)
//! - Outcome statistics (daily and all-time)

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{data_dir, migrations};
use crate::error::{DatabaseError, PersistenceError};
use crate::outcome::{EndReason, OutcomeLedger, OutcomeStatus, SessionOutcome};
use crate::recovery::{supersedes, RecoverySnapshot, RecoveryStore};
use crate::timer::SessionType;

const SNAPSHOT_KEY: &str = "recovery_snapshot";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub total_sessions: u64,
    pub completed: u64,
    pub interrupted: u64,
    pub skipped: u64,
    pub perfect: u64,
    pub total_focus_min: u64,
    pub total_break_min: u64,
    pub today_sessions: u64,
    pub today_focus_min: u64,
}

/// SQLite database for engine state.
///
/// Every write commits before returning, so a stored snapshot survives an
/// immediate process kill.
pub struct Database {
    conn: Mutex<Connection>,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Database {
    /// Open the database at `path`, creating file and schema as needed.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::init(conn)
    }

    /// Open the database at `<data_dir>/focus-engine.db`.
    pub fn open_default() -> Result<Self, DatabaseError> {
        let dir = data_dir().map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;
        Self::open(&dir.join("focus-engine.db"))
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, DatabaseError> {
        conn.execute_batch("PRAGMA synchronous = FULL;")?;
        migrations::migrate(&conn).map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::Locked)
    }

    /// Get a value from the kv store.
    pub fn kv_get(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.lock()?;
        Ok(kv_get_on(&conn, key)?)
    }

    /// Set a value in the kv store.
    pub fn kv_set(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let conn = self.lock()?;
        kv_set_on(&conn, key, value)?;
        Ok(())
    }

    pub fn kv_delete(&self, key: &str) -> Result<(), DatabaseError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Most recent outcomes, newest first.
    pub fn recent_outcomes(&self, limit: usize) -> Result<Vec<SessionOutcome>, DatabaseError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT payload FROM outcomes ORDER BY end_time DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;

        let mut outcomes = Vec::new();
        for row in rows {
            let payload = row?;
            let outcome = serde_json::from_str(&payload)
                .map_err(|e| DatabaseError::QueryFailed(format!("corrupt outcome row: {e}")))?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// All-time statistics, with today's figures relative to `now`.
    pub fn stats_all(&self, now: DateTime<Utc>) -> Result<Stats, DatabaseError> {
        let conn = self.lock()?;
        let mut stats = aggregate(&conn, None)?;
        let today = aggregate(&conn, Some(start_of_day(now)))?;
        stats.today_sessions = today.total_sessions;
        stats.today_focus_min = today.total_focus_min;
        Ok(stats)
    }

    /// Statistics for the UTC day containing `now`.
    pub fn stats_today(&self, now: DateTime<Utc>) -> Result<Stats, DatabaseError> {
        let conn = self.lock()?;
        let mut stats = aggregate(&conn, Some(start_of_day(now)))?;
        stats.today_sessions = stats.total_sessions;
        stats.today_focus_min = stats.total_focus_min;
        Ok(stats)
    }
}

fn start_of_day(now: DateTime<Utc>) -> String {
    format!("{}T00:00:00.000Z", now.format("%Y-%m-%d"))
}

fn aggregate(conn: &Connection, since: Option<String>) -> Result<Stats, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT session_type, status, end_reason, perfect, actual_minutes
         FROM outcomes
         WHERE ?1 IS NULL OR end_time >= ?1",
    )?;
    let rows = stmt.query_map(params![since], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, bool>(3)?,
            row.get::<_, u64>(4)?,
        ))
    })?;

    let mut stats = Stats::default();
    for row in rows {
        let (session_type, status, end_reason, perfect, minutes) = row?;
        stats.total_sessions += 1;
        match status.as_str() {
            "completed" => stats.completed += 1,
            _ if end_reason == EndReason::Skipped.as_str() => stats.skipped += 1,
            _ => stats.interrupted += 1,
        }
        if perfect {
            stats.perfect += 1;
        }
        let is_break = session_type
            .parse::<SessionType>()
            .is_ok_and(|t| t.is_break());
        if is_break {
            stats.total_break_min += minutes;
        } else {
            stats.total_focus_min += minutes;
        }
    }
    Ok(stats)
}

fn kv_get_on(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
        row.get::<_, String>(0)
    })
    .optional()
}

fn kv_set_on(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn read_failed(err: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::ReadFailed(err.to_string())
}

fn write_failed(err: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::WriteFailed(err.to_string())
}

impl RecoveryStore for Database {
    fn save(&self, snapshot: &RecoverySnapshot) -> Result<(), PersistenceError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(write_failed)?;

        let stored = kv_get_on(&tx, SNAPSHOT_KEY)
            .map_err(write_failed)?
            .and_then(|raw| RecoverySnapshot::from_json(&raw).ok());
        if !supersedes(snapshot, stored.as_ref()) {
            debug!(session_id = %snapshot.session_id, "Ignoring snapshot older than stored one");
            return Ok(());
        }

        kv_set_on(&tx, SNAPSHOT_KEY, &snapshot.to_json()?).map_err(write_failed)?;
        tx.commit().map_err(write_failed)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<RecoverySnapshot>, PersistenceError> {
        let conn = self.lock().map_err(read_failed)?;
        match kv_get_on(&conn, SNAPSHOT_KEY).map_err(read_failed)? {
            Some(raw) => RecoverySnapshot::from_json(&raw).map(Some),
            None => Ok(None),
        }
    }

    fn clear(&self, session_id: &str) -> Result<(), PersistenceError> {
        let conn = self.lock()?;
        let stored = kv_get_on(&conn, SNAPSHOT_KEY).map_err(write_failed)?;
        let matches = stored
            .and_then(|raw| RecoverySnapshot::from_json(&raw).ok())
            .is_some_and(|snapshot| snapshot.session_id == session_id);
        if matches {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![SNAPSHOT_KEY])
                .map_err(write_failed)?;
        }
        Ok(())
    }

    fn purge(&self) -> Result<(), PersistenceError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![SNAPSHOT_KEY])
            .map_err(write_failed)?;
        Ok(())
    }
}

impl OutcomeLedger for Database {
    fn lookup(&self, session_id: &str) -> Result<Option<SessionOutcome>, PersistenceError> {
        let conn = self.lock().map_err(read_failed)?;
        let payload = conn
            .query_row(
                "SELECT payload FROM outcomes WHERE session_id = ?1",
                params![session_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(read_failed)?;
        payload
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| PersistenceError::Corrupt(e.to_string()))
            })
            .transpose()
    }

    fn record(&self, outcome: &SessionOutcome) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(outcome).map_err(write_failed)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO outcomes
                (session_id, session_type, status, end_reason, perfect, actual_minutes,
                 start_time, end_time, payload, task_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                outcome.session_id,
                outcome.session_type.as_str(),
                outcome.status.as_str(),
                outcome.end_reason.as_str(),
                outcome.perfect,
                outcome.actual_minutes,
                timestamp(outcome.start_time),
                timestamp(outcome.end_time),
                payload,
                outcome.task_id,
            ],
        )
        .map_err(write_failed)?;
        if outcome.status == OutcomeStatus::Completed {
            debug!(session_id = %outcome.session_id, "Completed outcome recorded");
        }
        Ok(())
    }
}
