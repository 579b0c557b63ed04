use super::{from_ms, to_ms};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

/// State is the last-known outcome of a named scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub name: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

pub fn fetch(conn: &rusqlite::Connection, name: &str) -> rusqlite::Result<Option<State>> {
    conn.query_row(
        r#"select name, last_run_at, last_success_at, last_error, last_error_at
        from scheduler_state where name = ?1
        "#,
        params![name],
        |row| {
            Ok(State {
                name: row.get(0)?,
                last_run_at: row.get::<_, Option<i64>>(1)?.map(from_ms),
                last_success_at: row.get::<_, Option<i64>>(2)?.map(from_ms),
                last_error: row.get(3)?,
                last_error_at: row.get::<_, Option<i64>>(4)?.map(from_ms),
            })
        },
    )
    .optional()
}

pub fn record_run_started(
    conn: &rusqlite::Connection,
    name: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        r#"insert into scheduler_state (name, last_run_at) values (?1, ?2)
        on conflict (name) do update set last_run_at = excluded.last_run_at
        "#,
        params![name, to_ms(now)],
    )?;
    Ok(())
}

/// Record a successful run, which also clears a previously-recorded error.
pub fn record_success(
    conn: &rusqlite::Connection,
    name: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        r#"insert into scheduler_state (name, last_success_at) values (?1, ?2)
        on conflict (name) do update set
            last_success_at = excluded.last_success_at,
            last_error = null,
            last_error_at = null
        "#,
        params![name, to_ms(now)],
    )?;
    Ok(())
}

pub fn record_error(
    conn: &rusqlite::Connection,
    name: &str,
    error: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        r#"insert into scheduler_state (name, last_error, last_error_at) values (?1, ?2, ?3)
        on conflict (name) do update set
            last_error = excluded.last_error,
            last_error_at = excluded.last_error_at
        "#,
        params![name, error, to_ms(now)],
    )?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ts, Store};

    #[test]
    fn test_state_transitions() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        assert!(fetch(&conn, "triage").unwrap().is_none());

        record_run_started(&conn, "triage", ts(1_000)).unwrap();
        record_error(&conn, "triage", "cycle timed out", ts(2_000)).unwrap();
        record_run_started(&conn, "triage", ts(3_000)).unwrap();

        assert_eq!(
            fetch(&conn, "triage").unwrap().unwrap(),
            State {
                name: "triage".to_string(),
                last_run_at: Some(ts(3_000)),
                last_success_at: None,
                last_error: Some("cycle timed out".to_string()),
                last_error_at: Some(ts(2_000)),
            }
        );

        record_success(&conn, "triage", ts(4_000)).unwrap();

        assert_eq!(
            fetch(&conn, "triage").unwrap().unwrap(),
            State {
                name: "triage".to_string(),
                last_run_at: Some(ts(3_000)),
                last_success_at: Some(ts(4_000)),
                last_error: None,
                last_error_at: None,
            }
        );
    }
}
