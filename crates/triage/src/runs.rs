//! Triage runs: claiming an alert, gathering its evidence, invoking the
//! provider, and recording the outcome.

use crate::alerts::AlertContext;
use crate::evidence::{EvidenceBundle, Orchestrator};
use crate::prompt;
use crate::providers::{Provider, ProviderRequest};
use anyhow::Context;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use triage_sql::alert_events::{self, Claim, NewAlertEvent};
use triage_sql::runs::{self, RunStatus};
use triage_sql::Store;

/// FollowUp is a new run derived from a prior one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// Resume the prior run's provider session, re-using its evidence.
    Continue,
    /// Gather fresh evidence and start a new session.
    Rerun,
}

/// Evidence of a run about to execute.
#[derive(Debug)]
enum Plan {
    Collect,
    Reuse {
        bundle: EvidenceBundle,
        session_id: Option<String>,
    },
}

/// Prepared is a run which has been inserted but not yet executed.
#[derive(Debug)]
pub struct Prepared {
    pub run_id: i64,
    pub alert: AlertContext,
    plan: Plan,
}

pub struct Runner {
    store: Store,
    provider: Arc<dyn Provider>,
    orchestrator: Arc<Orchestrator>,
    runs_dir: PathBuf,
    model: Option<String>,
}

impl Runner {
    pub fn new(
        store: Store,
        provider: Arc<dyn Provider>,
        orchestrator: Arc<Orchestrator>,
        runs_dir: PathBuf,
        model: Option<String>,
    ) -> Self {
        Self {
            store,
            provider,
            orchestrator,
            runs_dir,
            model,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Claim `alert` and triage it.
    /// Returns None if the alert was already claimed, perhaps by another process.
    pub async fn triage_alert(&self, alert: &AlertContext) -> anyhow::Result<Option<i64>> {
        let Some(prepared) = self.claim(alert)? else {
            return Ok(None);
        };
        let run_id = prepared.run_id;
        self.execute(prepared).await?;

        Ok(Some(run_id))
    }

    /// Claim `alert` by recording its AlertEvent, and insert a running run for it.
    /// Returns None if the alert was already claimed, perhaps by another process.
    #[tracing::instrument(skip_all, fields(monitor_id = alert.monitor_id))]
    pub fn claim(&self, alert: &AlertContext) -> anyhow::Result<Option<Prepared>> {
        let alert_json = serde_json::to_string(alert)?;
        let repo_path = alert.repo_path().map(|p| p.display().to_string());
        let now = Utc::now();

        let claim = alert_events::insert_if_new(
            &self.store.conn(),
            &NewAlertEvent {
                monitor_id: alert.monitor_id,
                overall_state_modified: &alert.overall_state_modified,
                monitor_name: &alert.name,
                state: &alert.state,
                priority: alert.priority,
                alert_json: &alert_json,
                repo_path: repo_path.as_deref(),
                repo_url: alert.repo_url(),
            },
            now,
        )
        .context("claiming alert")?;

        let alert_event_id = match claim {
            Claim::Inserted(id) => id,
            Claim::Existing(id) => {
                tracing::debug!(alert_event_id = id, "alert was already claimed");
                return Ok(None);
            }
        };

        let run_id = runs::insert_running(
            &self.store.conn(),
            alert_event_id,
            None,
            self.provider.name(),
            now,
        )
        .context("inserting run")?;
        tracing::info!(run_id, alert_event_id, name = %alert.name, "triaging alert");

        Ok(Some(Prepared {
            run_id,
            alert: alert.clone(),
            plan: Plan::Collect,
        }))
    }

    /// Insert a new run which follows up on run `parent_id`.
    pub fn prepare_followup(&self, parent_id: i64, kind: FollowUp) -> anyhow::Result<Prepared> {
        let parent = runs::fetch(&self.store.conn(), parent_id)?
            .with_context(|| format!("run {parent_id} does not exist"))?;
        let event = alert_events::fetch(&self.store.conn(), parent.alert_event_id)?
            .with_context(|| format!("alert event {} does not exist", parent.alert_event_id))?;
        let alert: AlertContext = serde_json::from_str(&event.alert_json)
            .with_context(|| format!("decoding alert of run {parent_id}"))?;

        let plan = match kind {
            FollowUp::Rerun => Plan::Collect,
            FollowUp::Continue => {
                let Some(evidence) = &parent.evidence_json else {
                    anyhow::bail!("run {parent_id} has no evidence to continue from");
                };
                Plan::Reuse {
                    bundle: serde_json::from_str(evidence)
                        .with_context(|| format!("decoding evidence of run {parent_id}"))?,
                    session_id: parent.session_id.clone(),
                }
            }
        };

        let run_id = runs::insert_running(
            &self.store.conn(),
            event.id,
            Some(parent_id),
            self.provider.name(),
            Utc::now(),
        )?;
        tracing::info!(run_id, parent_id, ?kind, "prepared follow-up run");

        Ok(Prepared { run_id, alert, plan })
    }

    /// Execute a prepared run through to a terminal status.
    /// A provider failure fails the run and isn't an error of this function.
    /// Other errors also fail the run, and are then returned.
    #[tracing::instrument(skip_all, fields(run_id = prepared.run_id))]
    pub async fn execute(&self, prepared: Prepared) -> anyhow::Result<RunStatus> {
        let run_id = prepared.run_id;

        match self.try_execute(prepared).await {
            Ok(status) => Ok(status),
            Err(err) => {
                let message = format!("{err:#}");
                tracing::error!(run_id, error = %message, "triage run failed");
                runs::fail(&self.store.conn(), run_id, &message, Utc::now())?;
                Err(err)
            }
        }
    }

    async fn try_execute(&self, prepared: Prepared) -> anyhow::Result<RunStatus> {
        let Prepared {
            run_id,
            alert,
            plan,
        } = prepared;

        let dir = self.runs_dir.join(run_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating run directory {}", dir.display()))?;

        let continuation = matches!(plan, Plan::Reuse { .. });
        let (bundle, resume_session) = match plan {
            Plan::Collect => (self.orchestrator.collect(&alert).await, None),
            Plan::Reuse { bundle, session_id } => (bundle, session_id),
        };

        let alert_path = write(&dir, "alert.json", serde_json::to_string_pretty(&alert)?).await?;
        let evidence_path =
            write(&dir, "evidence.json", serde_json::to_string_pretty(&bundle)?).await?;

        runs::set_evidence(
            &self.store.conn(),
            run_id,
            &serde_json::to_string(&bundle)?,
            &serde_json::to_string(&bundle.fix_suggestions)?,
            &serde_json::to_string(&bundle.similar_incidents)?,
            Utc::now(),
        )
        .context("recording evidence")?;

        let attachments = vec![alert_path, evidence_path];
        let prompt = prompt::render(
            &alert,
            &bundle,
            self.orchestrator.config().top_findings,
            &attachments,
            continuation,
        );
        write(&dir, "prompt.md", prompt.clone()).await?;

        let working_dir = match alert.repo_path() {
            Some(repo) if repo.is_dir() => repo.to_path_buf(),
            _ => dir.clone(),
        };
        let request = ProviderRequest {
            run_id,
            prompt,
            alert,
            attachments,
            working_dir,
            model: self.model.clone(),
            resume_session,
        };

        let report = match self.provider.run(&request).await {
            Ok(report) => report,
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(run_id, provider = self.provider.name(), error = %message, "provider failed");
                runs::fail(&self.store.conn(), run_id, &message, Utc::now())?;
                return Ok(RunStatus::Failed);
            }
        };

        write(&dir, "report.md", report.report_markdown.clone()).await?;

        let completed = runs::complete(
            &self.store.conn(),
            run_id,
            &report.report_markdown,
            report.session_id.as_deref(),
            report.session_url.as_deref(),
            Utc::now(),
        )?;

        if !completed {
            // The run was failed out from under us, as by a force-clear.
            tracing::warn!(run_id, "run was no longer running when its report completed");
            return Ok(RunStatus::Failed);
        }
        tracing::info!(run_id, session_id = ?report.session_id, "triage run complete");
        Ok(RunStatus::Complete)
    }
}

async fn write(dir: &Path, name: &str, content: String) -> anyhow::Result<PathBuf> {
    let path = dir.join(name);
    tokio::fs::write(&path, content)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
