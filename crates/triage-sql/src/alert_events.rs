use super::{from_ms, to_ms};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

/// AlertEvent is a claimed occurrence of an alert, identified by its
/// monitor and the monitor's overall-state modification time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub id: i64,
    pub monitor_id: i64,
    pub overall_state_modified: String,
    pub monitor_name: String,
    pub state: String,
    pub priority: Option<i64>,
    pub alert_json: String,
    pub repo_path: Option<String>,
    pub repo_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct NewAlertEvent<'a> {
    pub monitor_id: i64,
    pub overall_state_modified: &'a str,
    pub monitor_name: &'a str,
    pub state: &'a str,
    pub priority: Option<i64>,
    pub alert_json: &'a str,
    pub repo_path: Option<&'a str>,
    pub repo_url: Option<&'a str>,
}

/// Claim is the outcome of inserting an AlertEvent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The event is new, and was inserted with this id.
    Inserted(i64),
    /// The event was already recorded under this id.
    Existing(i64),
}

/// Insert the event unless its identity is already recorded.
#[tracing::instrument(level = "debug", skip(conn, event), fields(monitor_id = event.monitor_id))]
pub fn insert_if_new(
    conn: &rusqlite::Connection,
    event: &NewAlertEvent<'_>,
    now: DateTime<Utc>,
) -> rusqlite::Result<Claim> {
    let inserted = conn.execute(
        r#"insert into alert_events (
            monitor_id,
            overall_state_modified,
            monitor_name,
            state,
            priority,
            alert_json,
            repo_path,
            repo_url,
            created_at
        ) values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        on conflict (monitor_id, overall_state_modified) do nothing
        "#,
        params![
            event.monitor_id,
            event.overall_state_modified,
            event.monitor_name,
            event.state,
            event.priority,
            event.alert_json,
            event.repo_path,
            event.repo_url,
            to_ms(now),
        ],
    )?;

    if inserted != 0 {
        return Ok(Claim::Inserted(conn.last_insert_rowid()));
    }

    conn.query_row(
        "select id from alert_events where monitor_id = ?1 and overall_state_modified = ?2",
        params![event.monitor_id, event.overall_state_modified],
        |row| row.get(0),
    )
    .map(Claim::Existing)
}

/// Returns true if an event with this identity has been recorded.
pub fn exists(
    conn: &rusqlite::Connection,
    monitor_id: i64,
    overall_state_modified: &str,
) -> rusqlite::Result<bool> {
    conn.query_row(
        "select 1 from alert_events where monitor_id = ?1 and overall_state_modified = ?2",
        params![monitor_id, overall_state_modified],
        |_row| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

pub fn fetch(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<AlertEvent>> {
    conn.query_row(
        r#"select
            id,
            monitor_id,
            overall_state_modified,
            monitor_name,
            state,
            priority,
            alert_json,
            repo_path,
            repo_url,
            created_at
        from alert_events where id = ?1
        "#,
        params![id],
        |row| {
            Ok(AlertEvent {
                id: row.get(0)?,
                monitor_id: row.get(1)?,
                overall_state_modified: row.get(2)?,
                monitor_name: row.get(3)?,
                state: row.get(4)?,
                priority: row.get(5)?,
                alert_json: row.get(6)?,
                repo_path: row.get(7)?,
                repo_url: row.get(8)?,
                created_at: from_ms(row.get(9)?),
            })
        },
    )
    .optional()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ts, Store};

    fn event<'a>(monitor_id: i64, modified: &'a str) -> NewAlertEvent<'a> {
        NewAlertEvent {
            monitor_id,
            overall_state_modified: modified,
            monitor_name: "[checkout] High error rate",
            state: "Alert",
            priority: Some(2),
            alert_json: "{}",
            repo_path: None,
            repo_url: None,
        }
    }

    #[test]
    fn test_insert_is_idempotent_by_identity() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        let first = insert_if_new(&conn, &event(42, "2024-05-01T10:00:00Z"), ts(1_000)).unwrap();
        let Claim::Inserted(id) = first else {
            panic!("expected an insertion, got {first:?}");
        };

        assert_eq!(
            insert_if_new(&conn, &event(42, "2024-05-01T10:00:00Z"), ts(2_000)).unwrap(),
            Claim::Existing(id)
        );
        assert!(exists(&conn, 42, "2024-05-01T10:00:00Z").unwrap());

        // A later state change of the same monitor is a distinct event.
        assert!(matches!(
            insert_if_new(&conn, &event(42, "2024-05-01T11:30:00Z"), ts(3_000)).unwrap(),
            Claim::Inserted(other) if other != id
        ));
        assert!(!exists(&conn, 7, "2024-05-01T10:00:00Z").unwrap());

        let count: i64 = conn
            .query_row("select count(*) from alert_events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);

        let row = fetch(&conn, id).unwrap().unwrap();
        assert_eq!(row.monitor_name, "[checkout] High error rate");
        assert_eq!(row.priority, Some(2));
        assert_eq!(row.created_at, ts(1_000));
        assert!(fetch(&conn, id + 2).unwrap().is_none());
    }
}
