use crate::alerts::AlertContext;
use crate::evidence::{EvidenceBundle, StepStatus};
use std::fmt::Write;
use std::path::PathBuf;

/// Maximum characters of a step summary within the prompt.
const SUMMARY_CHARS: usize = 200;

/// Render the Markdown prompt given to a provider for `alert`.
/// Only the first `top_findings` repository hits are listed; the complete
/// bundle is attached as a file.
pub fn render(
    alert: &AlertContext,
    bundle: &EvidenceBundle,
    top_findings: usize,
    attachments: &[PathBuf],
    continuation: bool,
) -> String {
    let mut w = String::new();
    // Writes to a String are infallible.
    let _ = write_prompt(&mut w, alert, bundle, top_findings, attachments, continuation);
    w
}

fn write_prompt(
    w: &mut String,
    alert: &AlertContext,
    bundle: &EvidenceBundle,
    top_findings: usize,
    attachments: &[PathBuf],
    continuation: bool,
) -> std::fmt::Result {
    writeln!(w, "# Triage: {}", alert.name)?;
    writeln!(w)?;
    if continuation {
        writeln!(
            w,
            "This continues your earlier investigation of this alert. \
             Build on your previous findings and refine the report."
        )?;
    } else {
        writeln!(
            w,
            "You are the on-call engineer's assistant. Investigate this alert \
             using the evidence below and the repository in your working directory."
        )?;
    }
    writeln!(w)?;

    writeln!(w, "## Alert")?;
    writeln!(w)?;
    writeln!(w, "- Monitor: {} ({})", alert.monitor_id, alert.state)?;
    if let Some(url) = &alert.monitor_url {
        writeln!(w, "- Link: {url}")?;
    }
    if let Some(priority) = alert.priority {
        writeln!(w, "- Priority: P{priority}")?;
    }
    for (label, value) in [
        ("Service", &alert.service),
        ("Team", &alert.team),
        ("Namespace", &alert.namespace),
    ] {
        if let Some(value) = value {
            writeln!(w, "- {label}: {value}")?;
        }
    }
    if let Some(repo) = &alert.repo {
        let location = repo
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .or_else(|| repo.url.clone())
            .unwrap_or_default();
        writeln!(w, "- Repository: {} {location}", repo.name)?;
    }
    if !alert.overall_state_modified.is_empty() {
        writeln!(w, "- Since: {}", alert.overall_state_modified)?;
    }
    if !alert.query.is_empty() {
        writeln!(w, "- Query: `{}`", alert.query)?;
    }
    if !alert.message.trim().is_empty() {
        writeln!(w)?;
        for line in alert.message.trim().lines() {
            writeln!(w, "> {line}")?;
        }
    }
    writeln!(w)?;

    writeln!(w, "## Evidence")?;
    writeln!(w)?;
    writeln!(w, "| Step | Status | Summary |")?;
    writeln!(w, "|---|---|---|")?;
    for step in &bundle.steps {
        let status = match step.status {
            StepStatus::Ok => "ok",
            StepStatus::Skipped => "skipped",
            StepStatus::Error => "error",
        };
        writeln!(
            w,
            "| {} | {status} | {} |",
            step.id,
            table_cell(&step.summary)
        )?;
    }
    writeln!(w)?;

    if !bundle.repo_files.is_empty() {
        writeln!(w, "## Top findings")?;
        writeln!(w)?;
        for hit in bundle.repo_files.iter().take(top_findings) {
            writeln!(
                w,
                "- `{}:{}` ({}): `{}`",
                hit.path,
                hit.line,
                hit.source,
                hit.preview.trim()
            )?;
        }
        let remaining = bundle.repo_files.len().saturating_sub(top_findings);
        if remaining != 0 {
            writeln!(w, "- …and {remaining} more in the evidence attachment")?;
        }
        writeln!(w)?;
    }

    if !bundle.fix_suggestions.is_empty() {
        writeln!(w, "## Candidate fixes")?;
        writeln!(w)?;
        for fix in &bundle.fix_suggestions {
            writeln!(
                w,
                "### {} (confidence {:.0}%)",
                fix.title,
                fix.confidence * 100.0
            )?;
            writeln!(w)?;
            writeln!(w, "{}", fix.summary)?;
            writeln!(w)?;
            for location in &fix.locations {
                writeln!(w, "- `{}:{}`", location.path, location.line)?;
            }
            if let Some(diff) = &fix.diff {
                writeln!(w)?;
                writeln!(w, "```diff")?;
                write!(w, "{diff}")?;
                writeln!(w, "```")?;
            }
            writeln!(w)?;
        }
    }

    if !bundle.similar_incidents.is_empty() {
        writeln!(w, "## Similar incidents")?;
        writeln!(w)?;
        for incident in &bundle.similar_incidents {
            write!(w, "- ")?;
            if let Some(key) = &incident.key {
                write!(w, "{key}: ")?;
            }
            write!(w, "{}", incident.title)?;
            if let Some(url) = &incident.url {
                write!(w, " <{url}>")?;
            }
            writeln!(w)?;
        }
        writeln!(w)?;
    }

    if !attachments.is_empty() {
        writeln!(w, "## Attachments")?;
        writeln!(w)?;
        for path in attachments {
            writeln!(w, "- {}", path.display())?;
        }
        writeln!(w)?;
    }

    writeln!(w, "## Report")?;
    writeln!(w)?;
    writeln!(
        w,
        "Respond in Markdown with: a one-paragraph summary, the most likely \
         root cause and the evidence for it, immediate mitigations, and \
         follow-up fixes. Say so when the evidence is inconclusive."
    )?;
    Ok(())
}

fn table_cell(s: &str) -> String {
    let s = s.replace('|', "\\|").replace('\n', " ");
    match s.char_indices().nth(SUMMARY_CHARS) {
        Some((offset, _)) => format!("{}…", &s[..offset]),
        None => s,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alerts::fixture;
    use crate::evidence::{
        EvidenceStep, FixSuggestion, IncidentSource, RepoFileHit, SimilarIncident,
    };
    use crate::repo::{RepoSource, ResolvedRepo};
    use chrono::{TimeZone, Utc};

    fn step(id: &str, status: StepStatus, summary: &str) -> EvidenceStep {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        EvidenceStep {
            id: id.to_string(),
            title: id.to_string(),
            status,
            started_at: at,
            finished_at: Some(at),
            summary: summary.to_string(),
            artifacts: Vec::new(),
        }
    }

    fn hit(path: &str, line: usize) -> RepoFileHit {
        RepoFileHit {
            path: path.to_string(),
            line,
            preview: "  pool_size: 10".to_string(),
            source: "config_files".to_string(),
        }
    }

    #[test]
    fn test_render() {
        let mut alert = AlertContext::from_raw(
            fixture(42, "[checkout] Connection pool saturated", "2024-05-01T10:00:00Z"),
            Some("https://app.datadoghq.com/monitors/42".to_string()),
        );
        alert.repo = Some(ResolvedRepo {
            name: "checkout".to_string(),
            path: Some(PathBuf::from("/srv/repos/checkout")),
            url: Some("https://github.com/acme/checkout".to_string()),
            source: RepoSource::Filesystem,
        });

        let bundle = EvidenceBundle {
            steps: vec![
                step("alert", StepStatus::Ok, "monitor 42 is Alert"),
                step("code_search", StepStatus::Skipped, "rg not available"),
                step("logs", StepStatus::Error, "searching Datadog logs: a|b\nc"),
            ],
            repo_files: vec![
                hit("config/app.yaml", 3),
                hit("config/worker.yaml", 9),
                hit("config/batch.yaml", 1),
            ],
            fix_suggestions: vec![FixSuggestion {
                rule_id: "connection-pool".to_string(),
                title: "Connection pool may be exhausted".to_string(),
                summary: "Pool bounds.".to_string(),
                confidence: 0.4,
                locations: vec![hit("config/app.yaml", 3)],
                diff: None,
            }],
            similar_incidents: vec![SimilarIncident {
                source: IncidentSource::Jira,
                key: Some("OPS-42".to_string()),
                title: "Checkout pool exhaustion".to_string(),
                url: Some("https://acme.atlassian.net/browse/OPS-42".to_string()),
                snippet: None,
            }],
            ..Default::default()
        };

        let prompt = render(
            &alert,
            &bundle,
            2,
            &[PathBuf::from("runs/1/evidence.json")],
            false,
        );

        insta::assert_snapshot!(prompt.trim_end(), @r###"
        # Triage: [checkout] Connection pool saturated

        You are the on-call engineer's assistant. Investigate this alert using the evidence below and the repository in your working directory.

        ## Alert

        - Monitor: 42 (Alert)
        - Link: https://app.datadoghq.com/monitors/42
        - Priority: P2
        - Service: checkout
        - Team: payments
        - Namespace: shop
        - Repository: checkout /srv/repos/checkout
        - Since: 2024-05-01T10:00:00Z
        - Query: `sum(last_5m):sum:trace.http.request.errors{service:checkout} > 5`

        > Error rate is above 5%. See https://wiki.example.com/runbooks/checkout

        ## Evidence

        | Step | Status | Summary |
        |---|---|---|
        | alert | ok | monitor 42 is Alert |
        | code_search | skipped | rg not available |
        | logs | error | searching Datadog logs: a\|b c |

        ## Top findings

        - `config/app.yaml:3` (config_files): `pool_size: 10`
        - `config/worker.yaml:9` (config_files): `pool_size: 10`
        - …and 1 more in the evidence attachment

        ## Candidate fixes

        ### Connection pool may be exhausted (confidence 40%)

        Pool bounds.

        - `config/app.yaml:3`

        ## Similar incidents

        - OPS-42: Checkout pool exhaustion <https://acme.atlassian.net/browse/OPS-42>

        ## Attachments

        - runs/1/evidence.json

        ## Report

        Respond in Markdown with: a one-paragraph summary, the most likely root cause and the evidence for it, immediate mitigations, and follow-up fixes. Say so when the evidence is inconclusive.
        "###);
    }

    #[test]
    fn test_continuation_preamble() {
        let alert = AlertContext::from_raw(fixture(1, "Errors", "2024-05-01T10:00:00Z"), None);
        let prompt = render(&alert, &EvidenceBundle::default(), 10, &[], true);

        assert!(prompt.starts_with(
            "# Triage: Errors\n\nThis continues your earlier investigation of this alert."
        ));
        assert!(!prompt.contains("## Top findings"));
    }
}
