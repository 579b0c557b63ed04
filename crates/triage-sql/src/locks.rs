use super::{duration_ms, from_ms, is_constraint_violation, to_ms};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::time::Duration;

/// Lock is a named, time-leased scheduler lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub name: String,
    pub owner_id: String,
    pub lease_expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub acquired_at: DateTime<Utc>,
}

impl Lock {
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at >= now
    }
}

/// Attempt to acquire the lease `name` for `owner` until `now + lease`.
/// Returns true if `owner` now holds the lease: either the lock had expired,
/// or `owner` already held it (re-entrant acquisition extends the lease).
/// Returns false if another owner holds an unexpired lease, or if another
/// owner won a race to create the lock.
#[tracing::instrument(level = "debug", skip(conn))]
pub fn try_acquire(
    conn: &rusqlite::Connection,
    name: &str,
    owner: &str,
    now: DateTime<Utc>,
    lease: Duration,
) -> rusqlite::Result<bool> {
    let now_ms = to_ms(now);
    let expires_ms = now_ms.saturating_add(duration_ms(lease));

    let updated = conn.execute(
        r#"update scheduler_locks set
            owner_id = ?2,
            lease_expires_at = ?3,
            heartbeat_at = ?4,
            acquired_at = case when owner_id = ?2 then acquired_at else ?4 end
        where name = ?1 and (lease_expires_at < ?4 or owner_id = ?2)
        "#,
        params![name, owner, expires_ms, now_ms],
    )?;

    if updated != 0 {
        return Ok(true);
    }

    match conn.execute(
        r#"insert into scheduler_locks (
            name, owner_id, lease_expires_at, heartbeat_at, acquired_at
        ) values (?1, ?2, ?3, ?4, ?4)
        "#,
        params![name, owner, expires_ms, now_ms],
    ) {
        Ok(_) => Ok(true),
        Err(err) if is_constraint_violation(&err) => {
            tracing::debug!(name, owner, "lock is held by another owner");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Extend the lease of `owner` to `now + lease`.
/// Returns false if `owner` no longer holds the lock.
#[tracing::instrument(level = "debug", skip(conn))]
pub fn renew(
    conn: &rusqlite::Connection,
    name: &str,
    owner: &str,
    now: DateTime<Utc>,
    lease: Duration,
) -> rusqlite::Result<bool> {
    let now_ms = to_ms(now);

    let updated = conn.execute(
        r#"update scheduler_locks set
            lease_expires_at = ?3,
            heartbeat_at = ?4
        where name = ?1 and owner_id = ?2
        "#,
        params![name, owner, now_ms.saturating_add(duration_ms(lease)), now_ms],
    )?;

    Ok(updated != 0)
}

/// Release the lease of `owner` by expiring it at the epoch.
/// Returns false if `owner` didn't hold the lock.
#[tracing::instrument(level = "debug", skip(conn))]
pub fn release(conn: &rusqlite::Connection, name: &str, owner: &str) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "update scheduler_locks set lease_expires_at = 0 where name = ?1 and owner_id = ?2",
        params![name, owner],
    )?;

    Ok(updated != 0)
}

pub fn fetch(conn: &rusqlite::Connection, name: &str) -> rusqlite::Result<Option<Lock>> {
    conn.query_row(
        r#"select name, owner_id, lease_expires_at, heartbeat_at, acquired_at
        from scheduler_locks where name = ?1
        "#,
        params![name],
        |row| {
            Ok(Lock {
                name: row.get(0)?,
                owner_id: row.get(1)?,
                lease_expires_at: from_ms(row.get(2)?),
                heartbeat_at: from_ms(row.get(3)?),
                acquired_at: from_ms(row.get(4)?),
            })
        },
    )
    .optional()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ts, Store};

    const LEASE: Duration = Duration::from_secs(60);

    #[test]
    fn test_acquire_is_reentrant_and_exclusive() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        assert!(try_acquire(&conn, "triage", "alpha", ts(1_000), LEASE).unwrap());
        // Re-entrant: the lease is extended but ownership doesn't change hands.
        assert!(try_acquire(&conn, "triage", "alpha", ts(2_000), LEASE).unwrap());
        // Excluded while unexpired.
        assert!(!try_acquire(&conn, "triage", "beta", ts(3_000), LEASE).unwrap());

        let lock = fetch(&conn, "triage").unwrap().unwrap();
        assert_eq!(
            lock,
            Lock {
                name: "triage".to_string(),
                owner_id: "alpha".to_string(),
                lease_expires_at: ts(62_000),
                heartbeat_at: ts(2_000),
                acquired_at: ts(1_000),
            }
        );
        assert!(lock.is_held(ts(62_000)));
        assert!(!lock.is_held(ts(62_001)));
    }

    #[test]
    fn test_expired_lease_may_be_taken_over() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        assert!(try_acquire(&conn, "triage", "alpha", ts(0), LEASE).unwrap());
        // Exactly at expiry the lease is still held.
        assert!(!try_acquire(&conn, "triage", "beta", ts(60_000), LEASE).unwrap());
        assert!(try_acquire(&conn, "triage", "beta", ts(60_001), LEASE).unwrap());

        let lock = fetch(&conn, "triage").unwrap().unwrap();
        assert_eq!(lock.owner_id, "beta");
        assert_eq!(lock.acquired_at, ts(60_001));

        // The previous owner's renewal reports the lost lease.
        assert!(!renew(&conn, "triage", "alpha", ts(61_000), LEASE).unwrap());
        assert!(renew(&conn, "triage", "beta", ts(61_000), LEASE).unwrap());
        assert_eq!(
            fetch(&conn, "triage").unwrap().unwrap().lease_expires_at,
            ts(121_000)
        );
    }

    #[test]
    fn test_release_allows_immediate_acquisition() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        assert!(try_acquire(&conn, "triage", "alpha", ts(1_000), LEASE).unwrap());
        assert!(!release(&conn, "triage", "beta").unwrap());
        assert!(release(&conn, "triage", "alpha").unwrap());

        assert_eq!(
            fetch(&conn, "triage").unwrap().unwrap().lease_expires_at,
            ts(0)
        );
        assert!(try_acquire(&conn, "triage", "beta", ts(2_000), LEASE).unwrap());
    }

    #[test]
    fn test_locks_are_independent_by_name() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        assert!(try_acquire(&conn, "one", "alpha", ts(1_000), LEASE).unwrap());
        assert!(try_acquire(&conn, "two", "beta", ts(1_000), LEASE).unwrap());
        assert!(fetch(&conn, "three").unwrap().is_none());
    }

    #[test]
    fn test_concurrent_acquisition_has_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.db");
        Store::open(&path).unwrap();

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let (path, barrier) = (path.clone(), barrier.clone());
                std::thread::spawn(move || {
                    // Each thread stands in for a separate process.
                    let store = Store::open(&path).unwrap();
                    barrier.wait();
                    let won = try_acquire(
                        &store.conn(),
                        "triage",
                        &format!("owner-{i}"),
                        ts(5_000),
                        LEASE,
                    )
                    .unwrap();
                    won
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
    }
}
