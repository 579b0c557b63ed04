//! Persistent state of the triage agent, held in a single SQLite database.
//!
//! Modules expose plain functions over a `&rusqlite::Connection`, and each
//! write is a single conditional insert or update so that several agent
//! processes on one host may safely share a database file.

pub mod alert_events;
pub mod locks;
pub mod runs;
pub mod scheduler_state;

pub use runs::RunStatus;

use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex, MutexGuard};

const SCHEMA: &str = r#"
create table if not exists scheduler_locks (
    name              text primary key,
    owner_id          text not null,
    lease_expires_at  integer not null,
    heartbeat_at      integer not null,
    acquired_at       integer not null
);

create table if not exists scheduler_state (
    name             text primary key,
    last_run_at      integer,
    last_success_at  integer,
    last_error       text,
    last_error_at    integer
);

create table if not exists alert_events (
    id                      integer primary key autoincrement,
    monitor_id              integer not null,
    overall_state_modified  text not null,
    monitor_name            text not null,
    state                   text not null,
    priority                integer,
    alert_json              text not null,
    repo_path               text,
    repo_url                text,
    created_at              integer not null,
    unique (monitor_id, overall_state_modified)
);

create table if not exists triage_runs (
    id                      integer primary key autoincrement,
    alert_event_id          integer not null references alert_events (id),
    parent_run_id           integer references triage_runs (id),
    provider                text not null,
    status                  text not null,
    error                   text,
    report                  text,
    session_id              text,
    session_url             text,
    evidence_json           text,
    fix_suggestions_json    text,
    similar_incidents_json  text,
    created_at              integer not null,
    updated_at              integer not null,
    finished_at             integer
);

create index if not exists triage_runs_by_status on triage_runs (status, created_at);
create index if not exists triage_runs_by_alert on triage_runs (alert_event_id);
"#;

/// Store is a shared handle to the agent database.
/// Its connection is serialized by a mutex which must not be held across an await.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> rusqlite::Result<Self> {
        Self::init(rusqlite::Connection::open(path)?, true)
    }

    /// Open a private, in-memory database.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory()?, false)
    }

    fn init(conn: rusqlite::Connection, wal: bool) -> rusqlite::Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        if wal {
            // Returns the resulting journal mode as a row.
            let _mode: String =
                conn.query_row("pragma journal_mode = wal", [], |row| row.get(0))?;
        }
        conn.execute_batch("pragma foreign_keys = on;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock and return the connection.
    pub fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        // A panic while the lock was held cannot leave a statement
        // half-applied, so a poisoned lock is still usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Encode a timestamp as Unix milliseconds.
pub fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Decode Unix milliseconds into a timestamp.
pub fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn duration_ms(d: std::time::Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
pub(crate) fn ts(ms: i64) -> DateTime<Utc> {
    from_ms(ms)
}
