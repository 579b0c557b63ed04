use super::{from_ms, to_ms};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Complete,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Complete => "complete",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "complete" => Ok(RunStatus::Complete),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("invalid run status {other:?}")),
        }
    }
}

impl ToSql for RunStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RunStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|err: String| FromSqlError::Other(err.into()))
    }
}

/// Run is a single attempt at triaging an AlertEvent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: i64,
    pub alert_event_id: i64,
    pub parent_run_id: Option<i64>,
    pub provider: String,
    pub status: RunStatus,
    pub error: Option<String>,
    pub report: Option<String>,
    pub session_id: Option<String>,
    pub session_url: Option<String>,
    pub evidence_json: Option<String>,
    pub fix_suggestions_json: Option<String>,
    pub similar_incidents_json: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

const SELECT_RUN: &str = r#"select
    id,
    alert_event_id,
    parent_run_id,
    provider,
    status,
    error,
    report,
    session_id,
    session_url,
    evidence_json,
    fix_suggestions_json,
    similar_incidents_json,
    created_at,
    updated_at,
    finished_at
from triage_runs"#;

fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        alert_event_id: row.get(1)?,
        parent_run_id: row.get(2)?,
        provider: row.get(3)?,
        status: row.get(4)?,
        error: row.get(5)?,
        report: row.get(6)?,
        session_id: row.get(7)?,
        session_url: row.get(8)?,
        evidence_json: row.get(9)?,
        fix_suggestions_json: row.get(10)?,
        similar_incidents_json: row.get(11)?,
        created_at: from_ms(row.get(12)?),
        updated_at: from_ms(row.get(13)?),
        finished_at: row.get::<_, Option<i64>>(14)?.map(from_ms),
    })
}

/// Insert a new run in the `running` status, returning its id.
#[tracing::instrument(level = "debug", skip(conn))]
pub fn insert_running(
    conn: &rusqlite::Connection,
    alert_event_id: i64,
    parent_run_id: Option<i64>,
    provider: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<i64> {
    conn.execute(
        r#"insert into triage_runs (
            alert_event_id, parent_run_id, provider, status, created_at, updated_at
        ) values (?1, ?2, ?3, ?4, ?5, ?5)
        "#,
        params![
            alert_event_id,
            parent_run_id,
            provider,
            RunStatus::Running,
            to_ms(now)
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn fetch(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<Run>> {
    conn.query_row(&format!("{SELECT_RUN} where id = ?1"), params![id], map_run)
        .optional()
}

/// Record the evidence of a still-running run.
/// Returns false if the run is no longer running.
pub fn set_evidence(
    conn: &rusqlite::Connection,
    id: i64,
    evidence_json: &str,
    fix_suggestions_json: &str,
    similar_incidents_json: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        r#"update triage_runs set
            evidence_json = ?2,
            fix_suggestions_json = ?3,
            similar_incidents_json = ?4,
            updated_at = ?5
        where id = ?1 and status = 'running'
        "#,
        params![
            id,
            evidence_json,
            fix_suggestions_json,
            similar_incidents_json,
            to_ms(now)
        ],
    )?;
    Ok(updated != 0)
}

/// Transition a running run to `complete`.
/// Returns false if the run had already reached a terminal status.
#[tracing::instrument(level = "debug", skip(conn, report))]
pub fn complete(
    conn: &rusqlite::Connection,
    id: i64,
    report: &str,
    session_id: Option<&str>,
    session_url: Option<&str>,
    now: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        r#"update triage_runs set
            status = 'complete',
            report = ?2,
            session_id = ?3,
            session_url = ?4,
            updated_at = ?5,
            finished_at = ?5
        where id = ?1 and status = 'running'
        "#,
        params![id, report, session_id, session_url, to_ms(now)],
    )?;
    Ok(updated != 0)
}

/// Transition a running run to `failed`.
/// Returns false if the run had already reached a terminal status.
#[tracing::instrument(level = "debug", skip(conn))]
pub fn fail(
    conn: &rusqlite::Connection,
    id: i64,
    error: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        r#"update triage_runs set
            status = 'failed',
            error = ?2,
            updated_at = ?3,
            finished_at = ?3
        where id = ?1 and status = 'running'
        "#,
        params![id, error, to_ms(now)],
    )?;
    Ok(updated != 0)
}

/// Fail every running run created before `created_before`,
/// returning the number of runs which were failed.
#[tracing::instrument(level = "debug", skip(conn))]
pub fn fail_stale(
    conn: &rusqlite::Connection,
    created_before: DateTime<Utc>,
    error: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    conn.execute(
        r#"update triage_runs set
            status = 'failed',
            error = ?2,
            updated_at = ?3,
            finished_at = ?3
        where status = 'running' and created_at < ?1
        "#,
        params![to_ms(created_before), error, to_ms(now)],
    )
}

/// Fail every running run regardless of age.
#[tracing::instrument(level = "debug", skip(conn))]
pub fn fail_all_running(
    conn: &rusqlite::Connection,
    error: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    conn.execute(
        r#"update triage_runs set
            status = 'failed',
            error = ?1,
            updated_at = ?2,
            finished_at = ?2
        where status = 'running'
        "#,
        params![error, to_ms(now)],
    )
}

/// Fetch the most recently failed run, if any.
pub fn latest_failed(conn: &rusqlite::Connection) -> rusqlite::Result<Option<Run>> {
    conn.query_row(
        &format!("{SELECT_RUN} where status = 'failed' order by finished_at desc, id desc limit 1"),
        [],
        map_run,
    )
    .optional()
}

/// List the runs of an AlertEvent, oldest first.
pub fn list_for_alert(
    conn: &rusqlite::Connection,
    alert_event_id: i64,
) -> rusqlite::Result<Vec<Run>> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT_RUN} where alert_event_id = ?1 order by id asc"
    ))?;
    let rows = stmt.query_map(params![alert_event_id], map_run)?;
    rows.collect()
}

pub fn count_running(conn: &rusqlite::Connection) -> rusqlite::Result<i64> {
    conn.query_row(
        "select count(*) from triage_runs where status = 'running'",
        [],
        |row| row.get(0),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alert_events::{insert_if_new, Claim, NewAlertEvent};
    use crate::{ts, Store};

    fn alert(conn: &rusqlite::Connection, monitor_id: i64) -> i64 {
        let claim = insert_if_new(
            conn,
            &NewAlertEvent {
                monitor_id,
                overall_state_modified: "2024-05-01T10:00:00Z",
                monitor_name: "High latency",
                state: "Alert",
                priority: None,
                alert_json: "{}",
                repo_path: None,
                repo_url: None,
            },
            ts(0),
        )
        .unwrap();

        match claim {
            Claim::Inserted(id) => id,
            Claim::Existing(_) => panic!("alert already exists"),
        }
    }

    #[test]
    fn test_terminal_transition_happens_once() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let alert_id = alert(&conn, 1);

        let run = insert_running(&conn, alert_id, None, "mock", ts(1_000)).unwrap();
        assert!(set_evidence(&conn, run, r#"{"steps":[]}"#, "[]", "[]", ts(1_500)).unwrap());
        assert!(complete(&conn, run, "# Report", Some("abc"), None, ts(2_000)).unwrap());

        // Neither a second completion nor a failure applies.
        assert!(!complete(&conn, run, "# Other", None, None, ts(3_000)).unwrap());
        assert!(!fail(&conn, run, "late failure", ts(3_000)).unwrap());
        assert!(!set_evidence(&conn, run, "{}", "[]", "[]", ts(3_000)).unwrap());

        let row = fetch(&conn, run).unwrap().unwrap();
        assert_eq!(row.status, RunStatus::Complete);
        assert_eq!(row.report.as_deref(), Some("# Report"));
        assert_eq!(row.session_id.as_deref(), Some("abc"));
        assert_eq!(row.evidence_json.as_deref(), Some(r#"{"steps":[]}"#));
        assert_eq!(row.error, None);
        assert_eq!(row.finished_at, Some(ts(2_000)));
        assert_eq!(row.updated_at, ts(2_000));
    }

    #[test]
    fn test_stale_sweep_only_fails_old_running_runs() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let alert_id = alert(&conn, 1);

        let old = insert_running(&conn, alert_id, None, "mock", ts(1_000)).unwrap();
        let old_done = insert_running(&conn, alert_id, None, "mock", ts(1_000)).unwrap();
        let fresh = insert_running(&conn, alert_id, None, "mock", ts(50_000)).unwrap();
        assert!(complete(&conn, old_done, "done", None, None, ts(2_000)).unwrap());

        let failed = fail_stale(&conn, ts(10_000), "presumed abandoned", ts(60_000)).unwrap();
        assert_eq!(failed, 1);

        let statuses: Vec<_> = list_for_alert(&conn, alert_id)
            .unwrap()
            .into_iter()
            .map(|run| (run.id, run.status, run.error))
            .collect();

        assert_eq!(
            statuses,
            vec![
                (
                    old,
                    RunStatus::Failed,
                    Some("presumed abandoned".to_string())
                ),
                (old_done, RunStatus::Complete, None),
                (fresh, RunStatus::Running, None),
            ]
        );
        assert_eq!(count_running(&conn).unwrap(), 1);

        assert_eq!(fail_all_running(&conn, "cleared", ts(70_000)).unwrap(), 1);
        assert_eq!(count_running(&conn).unwrap(), 0);
    }

    #[test]
    fn test_latest_failed_and_parentage() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let alert_id = alert(&conn, 1);

        assert!(latest_failed(&conn).unwrap().is_none());

        let first = insert_running(&conn, alert_id, None, "codex", ts(1_000)).unwrap();
        let second = insert_running(&conn, alert_id, Some(first), "codex", ts(2_000)).unwrap();
        assert!(fail(&conn, second, "exit status 2", ts(4_000)).unwrap());
        assert!(fail(&conn, first, "exit status 1", ts(3_000)).unwrap());

        let latest = latest_failed(&conn).unwrap().unwrap();
        assert_eq!(latest.id, second);
        assert_eq!(latest.parent_run_id, Some(first));
        assert_eq!(latest.provider, "codex");
    }

    #[test]
    fn test_status_serialization() {
        insta::assert_json_snapshot!(
            [RunStatus::Running, RunStatus::Complete, RunStatus::Failed],
            @r###"
        [
          "running",
          "complete",
          "failed"
        ]
        "###
        );
        assert!("stuck".parse::<RunStatus>().is_err());
    }
}
