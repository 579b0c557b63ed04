//! The lease-coordinated polling scheduler.
//!
//! Each tick sweeps stale runs, then acquires the named scheduler lease and
//! runs one or more discovery cycles while a background task renews it.
//! Processes sharing a database thereby never triage concurrently, and a
//! process which dies mid-tick loses its lease once it expires.

use crate::alerts;
use crate::config::{AlertConfig, SchedulerConfig};
use crate::monitor::MonitorSource;
use crate::repo::RepoResolver;
use crate::runs::Runner;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use triage_sql::{locks, runs, scheduler_state, Store};

/// Why a tick didn't run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A tick of this scheduler is already underway.
    AlreadyRunning,
    /// Another process holds the scheduler lease.
    LeaseNotAcquired,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    /// Number of alerts which were claimed and triaged.
    pub processed: usize,
    /// Number of cycles which were attempted.
    pub cycles: u32,
    /// Number of abandoned runs which were failed.
    pub stale_failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub healthy: bool,
    pub name: String,
    pub owner_id: String,
    /// Is a tick of this process underway?
    pub running: bool,
    pub state: Option<scheduler_state::State>,
    pub lock: Option<locks::Lock>,
    /// Is the lock currently leased, by any owner?
    pub lock_held: bool,
    pub running_runs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Number of cycles to run for a tick at `now`, given the start of the prior tick.
/// A tick which follows a gap of more than one `interval` catches up with one
/// cycle per elapsed interval, to at most `max_cycles`. Intervals beyond the
/// cap are dropped.
pub fn backlog_cycles(
    last_run_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    interval: Duration,
    max_cycles: u32,
) -> u32 {
    let Some(last_run_at) = last_run_at else {
        return 1;
    };
    let gap = now.signed_duration_since(last_run_at).num_milliseconds();
    let interval = (interval.as_millis() as i64).max(1);

    if gap <= interval {
        return 1;
    }
    let cycles = (gap + interval - 1) / interval;
    cycles.clamp(1, max_cycles.max(1) as i64) as u32
}

/// Generate an owner id which is unique to this process and scheduler.
pub fn owner_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());

    format!("{host}-{}-{}", std::process::id(), uuid::Uuid::new_v4())
}

/// LeaseGuard holds a scheduler lease, which is renewed in the background
/// until the guard is dropped and the lease released.
pub struct LeaseGuard {
    store: Store,
    name: String,
    owner: String,
    heartbeat: tokio::task::JoinHandle<()>,
}

impl LeaseGuard {
    /// Acquire the lease `name` for `owner`, or return None if it's held elsewhere.
    pub fn acquire(
        store: &Store,
        name: &str,
        owner: &str,
        lease: Duration,
    ) -> anyhow::Result<Option<Self>> {
        if !locks::try_acquire(&store.conn(), name, owner, Utc::now(), lease)? {
            return Ok(None);
        }
        let heartbeat = tokio::spawn(renew_lease(
            store.clone(),
            name.to_string(),
            owner.to_string(),
            lease,
        ));

        Ok(Some(Self {
            store: store.clone(),
            name: name.to_string(),
            owner: owner.to_string(),
            heartbeat,
        }))
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.heartbeat.abort();

        match locks::release(&self.store.conn(), &self.name, &self.owner) {
            Ok(true) => tracing::debug!(name = %self.name, "released scheduler lease"),
            Ok(false) => tracing::warn!(name = %self.name, "scheduler lease was lost before release"),
            Err(error) => tracing::error!(name = %self.name, ?error, "failed to release scheduler lease"),
        }
    }
}

async fn renew_lease(store: Store, name: String, owner: String, lease: Duration) {
    let period = (lease / 2).max(Duration::from_millis(10));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        match locks::renew(&store.conn(), &name, &owner, Utc::now(), lease) {
            Ok(true) => tracing::trace!(%name, "renewed scheduler lease"),
            Ok(false) => {
                tracing::warn!(%name, %owner, "scheduler lease was taken by another owner");
                return;
            }
            Err(error) => tracing::warn!(%name, ?error, "failed to renew scheduler lease"),
        }
    }
}

/// Clears the running flag of a Scheduler when dropped.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    owner_id: String,
    running: AtomicBool,
    config: SchedulerConfig,
    alerts: AlertConfig,
    store: Store,
    monitors: Arc<dyn MonitorSource>,
    resolver: RepoResolver,
    runner: Arc<Runner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        alerts: AlertConfig,
        store: Store,
        monitors: Arc<dyn MonitorSource>,
        resolver: RepoResolver,
        runner: Arc<Runner>,
    ) -> Self {
        Self {
            owner_id: owner_id(),
            running: AtomicBool::new(false),
            config,
            alerts,
            store,
            monitors,
            resolver,
            runner,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run a single tick of the scheduler. Failures are reported, not returned.
    #[tracing::instrument(skip(self), fields(scheduler = %self.config.name))]
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let Some(_running) = RunningGuard::enter(&self.running) else {
            tracing::debug!("tick is already running");
            report.skipped = Some(SkipReason::AlreadyRunning);
            return report;
        };

        if let Err(err) = self.try_tick(&mut report).await {
            let message = format!("{err:#}");
            tracing::error!(error = %message, "scheduler tick failed");

            if let Err(error) = scheduler_state::record_error(
                &self.store.conn(),
                &self.config.name,
                &message,
                Utc::now(),
            ) {
                tracing::error!(?error, "failed to record scheduler error");
            }
            report.error = Some(message);
        }
        tracing::info!(?report, "tick finished");

        report
    }

    async fn try_tick(&self, report: &mut TickReport) -> anyhow::Result<()> {
        let now = Utc::now();
        let name = self.config.name.as_str();

        report.stale_failed = self.fail_stale_runs(now)?;

        let Some(lease) =
            LeaseGuard::acquire(&self.store, name, &self.owner_id, self.config.lease_duration)
                .context("acquiring scheduler lease")?
        else {
            tracing::debug!("scheduler lease is held by another owner");
            report.skipped = Some(SkipReason::LeaseNotAcquired);
            return Ok(());
        };

        let state = scheduler_state::fetch(&self.store.conn(), name)?;
        let backlog = backlog_cycles(
            state.and_then(|s| s.last_run_at),
            now,
            self.config.poll_interval,
            self.config.max_catchup_cycles,
        );
        scheduler_state::record_run_started(&self.store.conn(), name, now)?;

        if backlog > 1 {
            tracing::info!(backlog, "catching up on missed cycles");
        }

        let mut failure = None;
        for cycle in 0..backlog {
            report.cycles += 1;

            match tokio::time::timeout(self.config.cycle_timeout, self.cycle()).await {
                Ok(Ok(processed)) => report.processed += processed,
                Ok(Err(err)) => {
                    failure = Some(err.context(format!("cycle {} of {backlog}", cycle + 1)));
                    break;
                }
                Err(_elapsed) => {
                    failure = Some(anyhow::anyhow!(
                        "cycle {} of {backlog} timed out after {}",
                        cycle + 1,
                        humantime::format_duration(self.config.cycle_timeout)
                    ));
                    break;
                }
            }
        }

        std::mem::drop(lease);

        match failure {
            Some(err) => Err(err),
            None => {
                scheduler_state::record_success(&self.store.conn(), name, Utc::now())?;
                Ok(())
            }
        }
    }

    /// Fail running runs which are older than the stale-run timeout.
    fn fail_stale_runs(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let timeout = self.config.stale_run_timeout;
        let cutoff = now - chrono::Duration::from_std(timeout)?;
        let error = format!(
            "run exceeded stale timeout of {}; presumed abandoned",
            humantime::format_duration(timeout)
        );

        let failed = runs::fail_stale(&self.store.conn(), cutoff, &error, now)
            .context("failing stale runs")?;
        if failed != 0 {
            tracing::warn!(failed, "failed stale runs");
        }
        Ok(failed)
    }

    /// Discover and triage alerts, returning the number which were processed.
    async fn cycle(&self) -> anyhow::Result<usize> {
        let candidates = alerts::discover(
            self.monitors.as_ref(),
            &self.store,
            &self.alerts,
            &self.resolver,
            Utc::now(),
        )
        .await?;

        let mut processed = 0;
        for alert in candidates {
            let prepared = match self.runner.claim(&alert) {
                Ok(Some(prepared)) => prepared,
                Ok(None) => continue,
                Err(error) => {
                    tracing::error!(monitor_id = alert.monitor_id, ?error, "failed to claim alert");
                    continue;
                }
            };
            let run_id = prepared.run_id;

            // A claimed run executes on its own task. If this cycle times out
            // the run carries on under its provider timeout, and no further
            // alerts are started.
            let runner = self.runner.clone();
            let execution = tokio::spawn(async move { runner.execute(prepared).await });

            match execution.await {
                Ok(Ok(_status)) => processed += 1,
                Ok(Err(error)) => tracing::error!(run_id, ?error, "failed to triage alert"),
                Err(error) => tracing::error!(run_id, ?error, "triage run panicked"),
            }
        }
        Ok(processed)
    }

    /// Run ticks every poll interval until `shutdown` resolves.
    pub async fn serve<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(
            scheduler = %self.config.name,
            owner_id = %self.owner_id,
            poll_interval = ?self.config.poll_interval,
            "serving"
        );

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("caught signal; exiting...");
                    return Ok(());
                }
                _ = interval.tick() => (),
            }
            let _report = self.tick().await;
        }
    }

    /// Report on the health of the scheduler. It's healthy if a tick
    /// succeeded within the last three poll intervals.
    pub fn health(&self) -> anyhow::Result<Health> {
        let now = Utc::now();
        let conn = self.store.conn();

        let state = scheduler_state::fetch(&conn, &self.config.name)?;
        let lock = locks::fetch(&conn, &self.config.name)?;
        let running_runs = runs::count_running(&conn)?;

        let window = chrono::Duration::from_std(self.config.poll_interval * 3)?;
        let healthy = state
            .as_ref()
            .and_then(|s| s.last_success_at)
            .is_some_and(|at| now.signed_duration_since(at) <= window);

        Ok(Health {
            healthy,
            name: self.config.name.clone(),
            owner_id: self.owner_id.clone(),
            running: self.is_running(),
            lock_held: lock.as_ref().is_some_and(|l| l.is_held(now)),
            state,
            lock,
            running_runs,
            error: None,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_backlog_cycles() {
        let minute = Duration::from_secs(60);
        let now = at(1_000_000);

        assert_eq!(backlog_cycles(None, now, minute, 5), 1);
        // Within one interval.
        assert_eq!(backlog_cycles(Some(at(1_000_000 - 60_000)), now, minute, 5), 1);
        assert_eq!(backlog_cycles(Some(at(1_000_000 - 30_000)), now, minute, 5), 1);
        // Just over one interval rounds up.
        assert_eq!(backlog_cycles(Some(at(1_000_000 - 60_001)), now, minute, 5), 2);
        assert_eq!(backlog_cycles(Some(at(1_000_000 - 180_000)), now, minute, 5), 3);
        // Capped, with the excess dropped.
        assert_eq!(backlog_cycles(Some(at(1_000_000 - 650_000)), now, minute, 5), 5);
        assert_eq!(backlog_cycles(Some(at(1_000_000 - 650_000)), now, minute, 0), 1);
        // Clock skew.
        assert_eq!(backlog_cycles(Some(at(2_000_000)), now, minute, 5), 1);
    }

    #[test]
    fn test_owner_ids_are_unique() {
        let (a, b) = (owner_id(), owner_id());
        assert_ne!(a, b);
        assert!(a.contains(&format!("-{}-", std::process::id())));
    }

    #[tokio::test]
    async fn test_lease_guard() {
        let store = Store::open_in_memory().unwrap();
        let lease = Duration::from_millis(200);

        let guard = LeaseGuard::acquire(&store, "triage", "alpha", lease)
            .unwrap()
            .unwrap();
        assert!(LeaseGuard::acquire(&store, "triage", "beta", lease)
            .unwrap()
            .is_none());

        // The heartbeat keeps the lease alive well beyond its duration.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let lock = locks::fetch(&store.conn(), "triage").unwrap().unwrap();
        assert_eq!(lock.owner_id, "alpha");
        assert!(lock.is_held(Utc::now()));

        std::mem::drop(guard);
        let lock = locks::fetch(&store.conn(), "triage").unwrap().unwrap();
        assert!(!lock.is_held(Utc::now()));

        let guard = LeaseGuard::acquire(&store, "triage", "beta", lease)
            .unwrap()
            .unwrap();
        assert_eq!(guard.owner, "beta");
    }

    #[test]
    fn test_running_guard() {
        let flag = AtomicBool::new(false);
        let guard = RunningGuard::enter(&flag).unwrap();
        assert!(RunningGuard::enter(&flag).is_none());
        std::mem::drop(guard);
        assert!(RunningGuard::enter(&flag).is_some());
        assert!(!flag.load(Ordering::Acquire));
    }
}
