//! Operator controls over a running agent.
//!
//! Controls never fail: each returns a [`ControlResult`] describing what
//! happened. Runs started by a control execute in the background, and
//! [`Control::wait_idle`] awaits them.

use crate::runs::{FollowUp, Runner};
use crate::scheduler::{Health, Scheduler, TickReport};
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use triage_sql::{runs, Store};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResult {
    /// Work was started in the background.
    Queued {
        #[serde(rename = "runId", skip_serializing_if = "Option::is_none")]
        run_id: Option<i64>,
    },
    Skipped {
        reason: String,
    },
    Error {
        error: String,
    },
    Cleared {
        count: usize,
    },
    Tick {
        report: TickReport,
    },
}

impl ControlResult {
    fn error(err: anyhow::Error) -> Self {
        let error = format!("{err:#}");
        tracing::warn!(%error, "control failed");
        ControlResult::Error { error }
    }
}

pub struct Control {
    scheduler: Arc<Scheduler>,
    runner: Arc<Runner>,
    store: Store,
    tasks: Mutex<JoinSet<()>>,
}

impl Control {
    pub fn new(scheduler: Arc<Scheduler>, runner: Arc<Runner>, store: Store) -> Self {
        Self {
            scheduler,
            runner,
            store,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .spawn(fut);
    }

    /// Start a scheduler tick in the background.
    pub fn trigger_run(&self) -> ControlResult {
        if self.scheduler.is_running() {
            return ControlResult::Skipped {
                reason: "already_running".to_string(),
            };
        }
        let scheduler = self.scheduler.clone();
        self.spawn(async move {
            scheduler.tick().await;
        });
        ControlResult::Queued { run_id: None }
    }

    /// Continue run `run_id`, resuming its provider session.
    pub fn continue_run(&self, run_id: i64) -> ControlResult {
        self.follow_up(run_id, FollowUp::Continue)
    }

    /// Re-run the alert of run `run_id` with fresh evidence.
    pub fn rerun_run(&self, run_id: i64) -> ControlResult {
        self.follow_up(run_id, FollowUp::Rerun)
    }

    fn follow_up(&self, parent_id: i64, kind: FollowUp) -> ControlResult {
        let prepared = match self.runner.prepare_followup(parent_id, kind) {
            Ok(prepared) => prepared,
            Err(err) => return ControlResult::error(err),
        };
        let run_id = prepared.run_id;
        let runner = self.runner.clone();

        self.spawn(async move {
            if let Err(error) = runner.execute(prepared).await {
                tracing::error!(run_id, ?error, "follow-up run failed");
            }
        });
        ControlResult::Queued {
            run_id: Some(run_id),
        }
    }

    /// Re-run the most recently failed run.
    pub fn reprocess_last_error(&self) -> ControlResult {
        let latest = runs::latest_failed(&self.store.conn());
        match latest {
            Ok(Some(run)) => self.rerun_run(run.id),
            Ok(None) => ControlResult::Skipped {
                reason: "no failed runs".to_string(),
            },
            Err(err) => ControlResult::error(err.into()),
        }
    }

    /// Fail every running run.
    pub fn force_clear_running(&self) -> ControlResult {
        let cleared =
            runs::fail_all_running(&self.store.conn(), "force cleared by operator", Utc::now());
        match cleared {
            Ok(count) => {
                tracing::warn!(count, "force cleared running runs");
                ControlResult::Cleared { count }
            }
            Err(err) => ControlResult::error(err.into()),
        }
    }

    /// Run a scheduler tick to completion.
    pub async fn run_scheduler_tick(&self) -> ControlResult {
        ControlResult::Tick {
            report: self.scheduler.tick().await,
        }
    }

    pub fn health(&self) -> Health {
        self.scheduler.health().unwrap_or_else(|err| Health {
            healthy: false,
            name: self.scheduler.name().to_string(),
            owner_id: self.scheduler.owner_id().to_string(),
            running: self.scheduler.is_running(),
            error: Some(format!("{err:#}")),
            ..Default::default()
        })
    }

    /// Wait for all background work to complete.
    pub async fn wait_idle(&self) {
        loop {
            let mut tasks = std::mem::take(
                &mut *self
                    .tasks
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            );
            if tasks.is_empty() {
                return;
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(error) = result {
                    tracing::error!(?error, "background task failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scheduler::SkipReason;

    #[test]
    fn test_result_serialization() {
        let results = vec![
            ControlResult::Queued { run_id: Some(3) },
            ControlResult::Queued { run_id: None },
            ControlResult::Skipped {
                reason: "no failed runs".to_string(),
            },
            ControlResult::Error {
                error: "run 9 does not exist".to_string(),
            },
            ControlResult::Cleared { count: 2 },
            ControlResult::Tick {
                report: TickReport {
                    skipped: Some(SkipReason::LeaseNotAcquired),
                    ..Default::default()
                },
            },
        ];

        insta::assert_json_snapshot!(results, @r###"
        [
          {
            "status": "queued",
            "runId": 3
          },
          {
            "status": "queued"
          },
          {
            "status": "skipped",
            "reason": "no failed runs"
          },
          {
            "status": "error",
            "error": "run 9 does not exist"
          },
          {
            "status": "cleared",
            "count": 2
          },
          {
            "status": "tick",
            "report": {
              "processed": 0,
              "cycles": 0,
              "staleFailed": 0,
              "skipped": "lease_not_acquired"
            }
          }
        ]
        "###);
    }
}
