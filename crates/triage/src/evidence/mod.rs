//! Evidence gathering for an alert.
//!
//! An [`Orchestrator`] runs a fixed, ordered list of [`Step`]s against an
//! alert. Steps are isolated from one another: each runs under its own
//! timeout, and its failure (including a panic) is recorded in its
//! [`EvidenceStep`] rather than propagated. The collected [`EvidenceBundle`]
//! always has exactly one entry per step.

pub mod heuristics;
pub mod steps;
pub mod tools;

use crate::alerts::AlertContext;
use crate::config::{Credentials, EvidenceConfig};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Skipped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceStep {
    pub id: String,
    pub title: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: String,
    pub artifacts: Vec<String>,
}

/// RepoFileHit is a matched line of a repository file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoFileHit {
    pub path: String,
    /// 1-based line number.
    pub line: usize,
    pub preview: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixSuggestion {
    pub rule_id: String,
    pub title: String,
    pub summary: String,
    pub confidence: f64,
    pub locations: Vec<RepoFileHit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentSource {
    Jira,
    Confluence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarIncident {
    pub source: IncidentSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceBundle {
    pub steps: Vec<EvidenceStep>,
    pub artifacts: BTreeMap<String, String>,
    pub repo_files: Vec<RepoFileHit>,
    pub fix_suggestions: Vec<FixSuggestion>,
    pub similar_incidents: Vec<SimilarIncident>,
}

impl EvidenceBundle {
    pub fn step(&self, id: &str) -> Option<&EvidenceStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// StepOutcome is the result of a Step which didn't fail.
#[derive(Debug)]
pub enum StepOutcome {
    /// The step's prerequisites weren't met.
    Skipped(String),
    Ok(StepOutput),
}

#[derive(Debug, Default)]
pub struct StepOutput {
    pub summary: String,
    /// Textual output, stored as the step's artifact.
    pub output: Option<String>,
    pub repo_files: Vec<RepoFileHit>,
    pub similar_incidents: Vec<SimilarIncident>,
}

impl StepOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped(reason.into())
    }
}

/// StepContext is everything a Step may consult.
pub struct StepContext<'a> {
    pub alert: &'a AlertContext,
    pub config: &'a EvidenceConfig,
    pub credentials: &'a Credentials,
    pub http: &'a reqwest::Client,
    /// Artifacts of previously-run steps.
    pub artifacts: &'a BTreeMap<String, String>,
}

/// Step is a single, independent source of evidence.
#[async_trait::async_trait]
pub trait Step: Send + Sync {
    fn id(&self) -> &'static str;
    fn title(&self) -> &'static str;

    fn artifact_key(&self) -> &'static str {
        self.id()
    }

    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome>;
}

/// Truncate `s` to at most `limit` characters, appending a marker which
/// records the number of characters removed.
pub fn truncate(s: String, limit: usize) -> String {
    let count = s.chars().count();
    if count <= limit {
        return s;
    }
    let cut = s
        .char_indices()
        .nth(limit)
        .map(|(offset, _)| offset)
        .unwrap_or(s.len());

    format!("{}\n…[truncated {} chars]", &s[..cut], count - limit)
}

/// Run `step` and record its outcome into `bundle`.
#[tracing::instrument(level = "debug", skip_all, fields(step = step.id()))]
pub async fn run_step(
    step: &dyn Step,
    alert: &AlertContext,
    config: &EvidenceConfig,
    credentials: &Credentials,
    http: &reqwest::Client,
    bundle: &mut EvidenceBundle,
) {
    let mut record = EvidenceStep {
        id: step.id().to_string(),
        title: step.title().to_string(),
        status: StepStatus::Skipped,
        started_at: Utc::now(),
        finished_at: None,
        summary: String::new(),
        artifacts: Vec::new(),
    };

    let result = {
        let ctx = StepContext {
            alert,
            config,
            credentials,
            http,
            artifacts: &bundle.artifacts,
        };
        let guarded = std::panic::AssertUnwindSafe(step.run(&ctx)).catch_unwind();
        tokio::time::timeout(config.step_timeout, guarded).await
    };

    match result {
        Err(_elapsed) => {
            record.status = StepStatus::Error;
            record.summary = format!(
                "step timed out after {}",
                humantime::format_duration(config.step_timeout)
            );
        }
        Ok(Err(panic)) => {
            record.status = StepStatus::Error;
            record.summary = format!("step panicked: {}", panic_message(&*panic));
        }
        Ok(Ok(Err(err))) => {
            record.status = StepStatus::Error;
            record.summary = format!("{err:#}");
        }
        Ok(Ok(Ok(StepOutcome::Skipped(reason)))) => {
            record.summary = reason;
        }
        Ok(Ok(Ok(StepOutcome::Ok(output)))) => {
            let StepOutput {
                summary,
                output,
                repo_files,
                similar_incidents,
            } = output;

            record.status = StepStatus::Ok;
            record.summary = summary;

            if let Some(output) = output {
                let key = step.artifact_key().to_string();
                bundle
                    .artifacts
                    .insert(key.clone(), truncate(output, config.truncate_chars));
                record.artifacts.push(key);
            }
            bundle.repo_files.extend(repo_files);
            bundle.similar_incidents.extend(similar_incidents);
        }
    }
    record.finished_at = Some(Utc::now());

    match record.status {
        StepStatus::Error => {
            tracing::warn!(step = %record.id, summary = %record.summary, "evidence step failed")
        }
        status => tracing::debug!(step = %record.id, ?status, summary = %record.summary, "evidence step finished"),
    }
    bundle.steps.push(record);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Orchestrator gathers an EvidenceBundle for an alert.
pub struct Orchestrator {
    steps: Vec<Box<dyn Step>>,
    config: EvidenceConfig,
    credentials: Credentials,
    http: reqwest::Client,
}

impl Orchestrator {
    pub fn new(config: EvidenceConfig, credentials: Credentials, http: reqwest::Client) -> Self {
        Self::with_steps(steps::all(), config, credentials, http)
    }

    pub fn with_steps(
        steps: Vec<Box<dyn Step>>,
        config: EvidenceConfig,
        credentials: Credentials,
        http: reqwest::Client,
    ) -> Self {
        Self {
            steps,
            config,
            credentials,
            http,
        }
    }

    pub fn config(&self) -> &EvidenceConfig {
        &self.config
    }

    #[tracing::instrument(skip_all, fields(monitor_id = alert.monitor_id))]
    pub async fn collect(&self, alert: &AlertContext) -> EvidenceBundle {
        let mut bundle = EvidenceBundle::default();

        for step in &self.steps {
            run_step(
                step.as_ref(),
                alert,
                &self.config,
                &self.credentials,
                &self.http,
                &mut bundle,
            )
            .await;
        }

        match self.suggest_fixes(alert).await {
            Ok(suggestions) => bundle.fix_suggestions = suggestions,
            Err(error) => tracing::warn!(?error, "failed to evaluate fix heuristics"),
        }

        let (ok, errors) = bundle.steps.iter().fold((0, 0), |(ok, errors), s| match s.status {
            StepStatus::Ok => (ok + 1, errors),
            StepStatus::Error => (ok, errors + 1),
            StepStatus::Skipped => (ok, errors),
        });
        tracing::info!(
            ok,
            errors,
            skipped = bundle.steps.len() - ok - errors,
            repo_files = bundle.repo_files.len(),
            fix_suggestions = bundle.fix_suggestions.len(),
            similar_incidents = bundle.similar_incidents.len(),
            "collected evidence"
        );
        bundle
    }

    async fn suggest_fixes(&self, alert: &AlertContext) -> anyhow::Result<Vec<FixSuggestion>> {
        let Some(repo) = alert.repo_path().map(std::path::Path::to_path_buf) else {
            return Ok(Vec::new());
        };
        // Rules are re-read for every alert, so edits apply without a restart.
        let rules = heuristics::load(self.config.heuristics.as_deref())?;
        let alert = alert.clone();

        tokio::task::spawn_blocking(move || heuristics::evaluate(&rules, &alert, &repo)).await?
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alerts::fixture;

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate("short".to_string(), 10), "short");
        assert_eq!(truncate("exact".to_string(), 5), "exact");
        assert_eq!(
            truncate("0123456789".to_string(), 4),
            "0123\n…[truncated 6 chars]"
        );
        // Multi-byte characters count once.
        assert_eq!(
            truncate("ééééé".to_string(), 2),
            "éé\n…[truncated 3 chars]"
        );
        assert_eq!(truncate("abc".to_string(), 0), "\n…[truncated 3 chars]");
    }

    struct Fixed(&'static str, fn() -> anyhow::Result<StepOutcome>);

    #[async_trait::async_trait]
    impl Step for Fixed {
        fn id(&self) -> &'static str {
            self.0
        }
        fn title(&self) -> &'static str {
            "Fixed"
        }
        async fn run(&self, _ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
            (self.1)()
        }
    }

    struct Slow;

    #[async_trait::async_trait]
    impl Step for Slow {
        fn id(&self) -> &'static str {
            "slow"
        }
        fn title(&self) -> &'static str {
            "Slow"
        }
        async fn run(&self, _ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(StepOutcome::skipped("unreachable"))
        }
    }

    /// Reads the artifact of the "first" step.
    struct Reader;

    #[async_trait::async_trait]
    impl Step for Reader {
        fn id(&self) -> &'static str {
            "reader"
        }
        fn title(&self) -> &'static str {
            "Reader"
        }
        async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
            let prior = ctx.artifacts.get("first").cloned().unwrap_or_default();
            Ok(StepOutcome::Ok(StepOutput {
                summary: format!("saw {prior:?}"),
                ..Default::default()
            }))
        }
    }

    #[tokio::test]
    async fn test_steps_are_isolated() {
        let steps: Vec<Box<dyn Step>> = vec![
            Box::new(Fixed("first", || {
                Ok(StepOutcome::Ok(StepOutput {
                    summary: "found things".to_string(),
                    output: Some("0123456789".to_string()),
                    repo_files: vec![RepoFileHit {
                        path: "src/main.rs".to_string(),
                        line: 3,
                        preview: "fn main() {".to_string(),
                        source: "first".to_string(),
                    }],
                    similar_incidents: Vec::new(),
                }))
            })),
            Box::new(Fixed("broken", || {
                Err(anyhow::anyhow!("connection refused").context("querying the thing"))
            })),
            Box::new(Fixed("panics", || panic!("index out of bounds"))),
            Box::new(Slow),
            Box::new(Fixed("skips", || Ok(StepOutcome::skipped("tool not available")))),
            Box::new(Reader),
        ];
        let config = EvidenceConfig {
            truncate_chars: 4,
            step_timeout: std::time::Duration::from_millis(100),
            ..Default::default()
        };
        let orchestrator =
            Orchestrator::with_steps(steps, config, Credentials::default(), reqwest::Client::new());

        let alert = AlertContext::from_raw(fixture(1, "Errors", "2024-05-01T10:00:00Z"), None);
        let bundle = orchestrator.collect(&alert).await;

        let summary: Vec<_> = bundle
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.status, s.summary.as_str()))
            .collect();

        assert_eq!(
            summary,
            vec![
                ("first", StepStatus::Ok, "found things"),
                (
                    "broken",
                    StepStatus::Error,
                    "querying the thing: connection refused"
                ),
                ("panics", StepStatus::Error, "step panicked: index out of bounds"),
                ("slow", StepStatus::Error, "step timed out after 100ms"),
                ("skips", StepStatus::Skipped, "tool not available"),
                ("reader", StepStatus::Ok, r#"saw "0123\n…[truncated 6 chars]""#),
            ]
        );
        assert!(bundle.steps.iter().all(|s| s.finished_at.is_some()));
        assert_eq!(bundle.steps[0].artifacts, vec!["first"]);
        assert_eq!(bundle.repo_files.len(), 1);
        assert!(bundle.fix_suggestions.is_empty());
    }
}
