//! `SQLite`-backed study store for multi-process optimization.

use core::time::Duration;
use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use super::{StudyStore, check_transition, check_value};
use crate::error::{Error, Result};
use crate::trial::{FrozenTrial, TrialAttrs, TrialState};

/// How long a writer waits for another process's write transaction.
const BUSY_TIMEOUT: Duration = Duration::from_secs(60);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS studies (
    study_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    study_name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS trials (
    trial_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    study_id     INTEGER NOT NULL REFERENCES studies(study_id),
    number       INTEGER NOT NULL,
    state        TEXT NOT NULL,
    value        REAL,
    params       TEXT NOT NULL DEFAULT '{}',
    attrs        TEXT NOT NULL DEFAULT '{}',
    started_at   TEXT,
    completed_at TEXT,
    UNIQUE (study_id, number)
);
";

/// A study store persisted in a `SQLite` database.
///
/// WAL mode lets readers proceed while one writer holds the lock. Every
/// mutation runs in an `IMMEDIATE` transaction, which takes the database
/// write lock up front: trial numbers are read and issued under that lock, so
/// they cannot race between threads or processes. Within a process the
/// single connection is additionally guarded by a mutex.
///
/// # Examples
///
/// ```no_run
/// use ffm_tune::storage::{SqliteStore, StudyStore};
///
/// let store = SqliteStore::open("db.sqlite3").unwrap();
/// store.create_study("ffm-gp").unwrap();
/// ```
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the database cannot be opened or its
    /// schema created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL mode: concurrent readers, single writer.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside an `IMMEDIATE` transaction, committing on success.
    fn write<T>(&self, f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

fn study_id(conn: &Connection, name: &str) -> Result<i64> {
    conn.query_row(
        "SELECT study_id FROM studies WHERE study_name = ?1",
        [name],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(name.to_string()))
}

fn to_sql_number(number: u64) -> Result<i64> {
    i64::try_from(number).map_err(|_| Error::Storage(format!("trial number {number} too large")))
}

fn current_state(conn: &Connection, study: &str, id: i64, number: u64) -> Result<TrialState> {
    let state: Option<String> = conn
        .query_row(
            "SELECT state FROM trials WHERE study_id = ?1 AND number = ?2",
            params![id, to_sql_number(number)?],
            |row| row.get(0),
        )
        .optional()?;
    let state = state.ok_or_else(|| Error::UnknownTrial {
        study: study.to_string(),
        number,
    })?;
    parse_state(&state)
}

fn parse_state(s: &str) -> Result<TrialState> {
    TrialState::parse(s).ok_or_else(|| Error::Storage(format!("unknown trial state '{s}'")))
}

fn parse_time(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::Storage(format!("bad timestamp '{s}': {e}")))
    })
    .transpose()
}

/// Raw column values of one `trials` row.
struct TrialRow {
    number: i64,
    state: String,
    value: Option<f64>,
    params: String,
    attrs: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TrialRow {
    fn into_trial(self) -> Result<FrozenTrial> {
        Ok(FrozenTrial {
            number: u64::try_from(self.number)
                .map_err(|_| Error::Storage(format!("negative trial number {}", self.number)))?,
            state: parse_state(&self.state)?,
            value: self.value,
            params: serde_json::from_str(&self.params)?,
            attrs: serde_json::from_str(&self.attrs)?,
            started_at: parse_time(self.started_at)?,
            completed_at: parse_time(self.completed_at)?,
        })
    }
}

impl StudyStore for SqliteStore {
    fn create_study(&self, name: &str) -> Result<()> {
        self.write(|tx| {
            let exists = tx
                .query_row(
                    "SELECT 1 FROM studies WHERE study_name = ?1",
                    [name],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                return Err(Error::AlreadyExists(name.to_string()));
            }
            tx.execute(
                "INSERT INTO studies (study_name, created_at) VALUES (?1, ?2)",
                params![name, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn load_study(&self, name: &str) -> Result<()> {
        study_id(&self.conn.lock(), name).map(|_| ())
    }

    fn study_names(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT study_name FROM studies ORDER BY study_name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    fn allocate_trial(&self, study: &str) -> Result<u64> {
        self.write(|tx| {
            let id = study_id(tx, study)?;
            let next: i64 = tx.query_row(
                "SELECT COALESCE(MAX(number) + 1, 0) FROM trials WHERE study_id = ?1",
                [id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO trials (study_id, number, state) VALUES (?1, ?2, ?3)",
                params![id, next, TrialState::Created.as_str()],
            )?;
            u64::try_from(next).map_err(|_| Error::Storage(format!("negative trial number {next}")))
        })
    }

    fn start_trial(&self, study: &str, number: u64, params: &BTreeMap<String, f64>) -> Result<()> {
        let params_json = serde_json::to_string(params)?;
        self.write(|tx| {
            let id = study_id(tx, study)?;
            let from = current_state(tx, study, id, number)?;
            check_transition(number, from, TrialState::Running)?;
            tx.execute(
                "UPDATE trials SET state = ?1, params = ?2, started_at = ?3
                 WHERE study_id = ?4 AND number = ?5",
                params![
                    TrialState::Running.as_str(),
                    params_json,
                    Utc::now().to_rfc3339(),
                    id,
                    to_sql_number(number)?
                ],
            )?;
            Ok(())
        })
    }

    fn record(
        &self,
        study: &str,
        number: u64,
        state: TrialState,
        value: Option<f64>,
        attrs: &TrialAttrs,
    ) -> Result<()> {
        let attrs_json = serde_json::to_string(attrs)?;
        self.write(|tx| {
            let id = study_id(tx, study)?;
            let from = current_state(tx, study, id, number)?;
            check_transition(number, from, state)?;
            check_value(number, state, value)?;
            tx.execute(
                "UPDATE trials SET state = ?1, value = ?2, attrs = ?3, completed_at = ?4
                 WHERE study_id = ?5 AND number = ?6",
                params![
                    state.as_str(),
                    value,
                    attrs_json,
                    Utc::now().to_rfc3339(),
                    id,
                    to_sql_number(number)?
                ],
            )?;
            Ok(())
        })
    }

    fn trials(&self, study: &str) -> Result<Vec<FrozenTrial>> {
        let rows = {
            let conn = self.conn.lock();
            let id = study_id(&conn, study)?;
            let mut stmt = conn.prepare(
                "SELECT number, state, value, params, attrs, started_at, completed_at
                 FROM trials WHERE study_id = ?1 ORDER BY number",
            )?;
            stmt.query_map([id], |row| {
                Ok(TrialRow {
                    number: row.get(0)?,
                    state: row.get(1)?,
                    value: row.get(2)?,
                    params: row.get(3)?,
                    attrs: row.get(4)?,
                    started_at: row.get(5)?,
                    completed_at: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };
        rows.into_iter().map(TrialRow::into_trial).collect()
    }
}
