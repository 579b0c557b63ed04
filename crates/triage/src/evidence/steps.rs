use super::tools::{self, run_tool};
use super::{IncidentSource, SimilarIncident, Step, StepContext, StepOutcome, StepOutput};
use crate::repo::github_slug;
use anyhow::Context;
use serde_json::Value;
use std::path::Path;

/// All evidence steps, in the order they're run.
pub fn all() -> Vec<Box<dyn Step>> {
    vec![
        Box::new(Alert),
        Box::new(GitStatus),
        Box::new(GitLog),
        Box::new(GitDiff),
        Box::new(CodeSearch),
        Box::new(ConfigFiles),
        Box::new(Kubernetes),
        Box::new(GitHub),
        Box::new(Logs),
        Box::new(Wiki),
        Box::new(Tickets),
        Box::new(Runbook),
    ]
}

fn ok(summary: impl Into<String>, output: String) -> StepOutcome {
    StepOutcome::Ok(StepOutput {
        summary: summary.into(),
        output: Some(output),
        ..Default::default()
    })
}

/// Returns the repository checkout of the alert, or the reason there isn't one.
fn repo_path<'a>(ctx: &'a StepContext<'_>) -> Result<&'a Path, StepOutcome> {
    match ctx.alert.repo_path() {
        Some(path) if path.is_dir() => Ok(path),
        Some(path) => Err(StepOutcome::skipped(format!(
            "repository path {} does not exist",
            path.display()
        ))),
        None => Err(StepOutcome::skipped("no repository path resolved")),
    }
}

fn require_tool(program: &str, name: &str) -> Result<(), StepOutcome> {
    if async_process::is_available(program) {
        Ok(())
    } else {
        Err(StepOutcome::skipped(format!("{name} not available")))
    }
}

/// Unwraps a prerequisite, or returns its skip outcome from the enclosing step.
macro_rules! require {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(skipped) => return Ok(skipped),
        }
    };
}

pub struct Alert;

#[async_trait::async_trait]
impl Step for Alert {
    fn id(&self) -> &'static str {
        "alert"
    }
    fn title(&self) -> &'static str {
        "Alert context"
    }
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let output = serde_json::to_string_pretty(ctx.alert)?;
        Ok(ok(
            format!("monitor {} is {}", ctx.alert.monitor_id, ctx.alert.state),
            output,
        ))
    }
}

pub struct GitStatus;

#[async_trait::async_trait]
impl Step for GitStatus {
    fn id(&self) -> &'static str {
        "git_status"
    }
    fn title(&self) -> &'static str {
        "Repository status"
    }
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let repo = require!(repo_path(ctx));
        require!(require_tool(&ctx.config.git_bin, "git"));

        let out = run_tool(
            &ctx.config.git_bin,
            &["status", "--short", "--branch"],
            Some(repo),
            &[],
        )
        .await?;

        let branch = out
            .lines()
            .next()
            .and_then(|l| l.strip_prefix("## "))
            .unwrap_or("unknown branch")
            .to_string();
        let changed = out.lines().skip(1).count();

        Ok(ok(format!("{branch}; {changed} changed files"), out))
    }
}

pub struct GitLog;

#[async_trait::async_trait]
impl Step for GitLog {
    fn id(&self) -> &'static str {
        "git_log"
    }
    fn title(&self) -> &'static str {
        "Recent commits"
    }
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let repo = require!(repo_path(ctx));
        require!(require_tool(&ctx.config.git_bin, "git"));

        let depth = ctx.config.commit_depth.max(1).to_string();
        let out = run_tool(
            &ctx.config.git_bin,
            &[
                "log",
                "-n",
                &depth,
                "--date=iso-strict",
                "--pretty=format:%h %ad %an %s",
            ],
            Some(repo),
            &[],
        )
        .await?;

        let commits = out.lines().count();
        Ok(ok(format!("{commits} recent commits"), out))
    }
}

pub struct GitDiff;

#[async_trait::async_trait]
impl Step for GitDiff {
    fn id(&self) -> &'static str {
        "git_diff"
    }
    fn title(&self) -> &'static str {
        "Recent changes"
    }
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let repo = require!(repo_path(ctx));
        require!(require_tool(&ctx.config.git_bin, "git"));

        let count = run_tool(
            &ctx.config.git_bin,
            &["rev-list", "--count", "HEAD"],
            Some(repo),
            &[],
        )
        .await?;
        let count: usize = count
            .trim()
            .parse()
            .context("parsing repository commit count")?;

        // Diff against the oldest commit within the examined depth.
        let back = ctx.config.commit_depth.min(count.saturating_sub(1));
        if back == 0 {
            return Ok(StepOutcome::skipped("repository has no prior commits"));
        }
        let base = format!("HEAD~{back}");

        let out = run_tool(
            &ctx.config.git_bin,
            &["diff", "--stat", &base],
            Some(repo),
            &[],
        )
        .await?;

        let summary = out
            .lines()
            .last()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or("no changes")
            .to_string();

        Ok(ok(format!("{summary} since {base}"), out))
    }
}

pub struct CodeSearch;

#[async_trait::async_trait]
impl Step for CodeSearch {
    fn id(&self) -> &'static str {
        "code_search"
    }
    fn title(&self) -> &'static str {
        "Code search"
    }
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let repo = require!(repo_path(ctx));
        require!(require_tool(&ctx.config.rg_bin, "rg"));

        let terms = tools::search_terms(ctx.alert);
        if terms.is_empty() {
            return Ok(StepOutcome::skipped("no search terms derived from the alert"));
        }

        let mut hits = Vec::new();
        let mut output = String::new();

        for term in &terms {
            let remaining = ctx.config.max_file_hits.saturating_sub(hits.len());
            if remaining == 0 {
                break;
            }
            // rg exits with code 1 if there are no matches.
            let out = run_tool(
                &ctx.config.rg_bin,
                &[
                    "--line-number",
                    "--with-filename",
                    "--no-heading",
                    "--fixed-strings",
                    "--ignore-case",
                    "--max-count",
                    "5",
                    "--",
                    term,
                    ".",
                ],
                Some(repo),
                &[1],
            )
            .await?;

            let found = tools::parse_rg(&out, "code_search", remaining);
            output.push_str(&format!("# {term}: {} matches\n", found.len()));
            output.push_str(&tools::render_hits(&found));
            hits.extend(found);
        }

        Ok(StepOutcome::Ok(StepOutput {
            summary: format!("{} matches for {}", hits.len(), terms.join(", ")),
            output: Some(output),
            repo_files: hits,
            similar_incidents: Vec::new(),
        }))
    }
}

pub struct ConfigFiles;

const CONFIG_EXTENSIONS: &[&str] = &["yaml", "yml", "json", "toml", "env", "properties"];

#[async_trait::async_trait]
impl Step for ConfigFiles {
    fn id(&self) -> &'static str {
        "config_files"
    }
    fn title(&self) -> &'static str {
        "Configuration files"
    }
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let repo = require!(repo_path(ctx)).to_path_buf();

        let mut terms: Vec<String> = ctx
            .alert
            .service
            .iter()
            .chain(ctx.alert.namespace.iter())
            .map(|t| regex::escape(t))
            .collect();
        // Namespace declarations inform the kubernetes step.
        terms.push(r"\bnamespace\s*:".to_string());

        let pattern = regex::RegexBuilder::new(&terms.join("|"))
            .case_insensitive(true)
            .build()?;
        let extensions: Vec<String> = CONFIG_EXTENSIONS.iter().map(|e| e.to_string()).collect();
        let max_hits = ctx.config.max_file_hits;

        let hits = tokio::task::spawn_blocking(move || {
            tools::scan_files(&repo, &extensions, &pattern, max_hits, "config_files")
        })
        .await?
        .context("scanning configuration files")?;

        Ok(StepOutcome::Ok(StepOutput {
            summary: format!("{} matching configuration lines", hits.len()),
            output: Some(tools::render_hits(&hits)),
            repo_files: hits,
            similar_incidents: Vec::new(),
        }))
    }
}

lazy_static::lazy_static! {
    static ref NAMESPACE_RE: regex::Regex =
        regex::Regex::new(r#"\bnamespace\s*:\s*["']?([a-z0-9]([-a-z0-9]*[a-z0-9])?)"#)
            .expect("Is a valid regex");
}

/// Namespace of the alert's tags, or else the first namespace declared
/// within collected configuration files.
pub fn namespace(ctx: &StepContext<'_>) -> Option<String> {
    if let Some(ns) = &ctx.alert.namespace {
        return Some(ns.clone());
    }
    let config = ctx.artifacts.get("config_files")?;
    NAMESPACE_RE
        .captures(config)
        .map(|c| c[1].to_string())
}

pub struct Kubernetes;

#[async_trait::async_trait]
impl Step for Kubernetes {
    fn id(&self) -> &'static str {
        "kubernetes"
    }
    fn title(&self) -> &'static str {
        "Kubernetes workloads"
    }
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        require!(require_tool(&ctx.config.kubectl_bin, "kubectl"));
        let Some(ns) = namespace(ctx) else {
            return Ok(StepOutcome::skipped("no Kubernetes namespace known"));
        };
        let kubectl = &ctx.config.kubectl_bin;

        let pods = run_tool(kubectl, &["get", "pods", "-n", &ns, "-o", "wide"], None, &[])
            .await
            .context("listing pods")?;
        let events = run_tool(
            kubectl,
            &["get", "events", "-n", &ns, "--sort-by=.lastTimestamp"],
            None,
            &[],
        )
        .await
        .context("listing events")?;

        let restarting = pods
            .lines()
            .skip(1)
            .filter(|l| !l.contains(" Running ") || l.contains("CrashLoopBackOff"))
            .count();

        Ok(ok(
            format!(
                "{} pods in namespace {ns}, {restarting} not running",
                pods.lines().skip(1).count()
            ),
            format!("## pods\n{pods}\n## events\n{events}"),
        ))
    }
}

pub struct GitHub;

#[async_trait::async_trait]
impl Step for GitHub {
    fn id(&self) -> &'static str {
        "github"
    }
    fn title(&self) -> &'static str {
        "GitHub activity"
    }
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        require!(require_tool(&ctx.config.gh_bin, "gh"));
        let Some(slug) = ctx.alert.repo_url().and_then(github_slug) else {
            return Ok(StepOutcome::skipped("no GitHub repository resolved"));
        };
        let gh = &ctx.config.gh_bin;

        let prs = run_tool(
            gh,
            &["pr", "list", "--repo", &slug, "--state", "merged", "--limit", "10"],
            None,
            &[],
        )
        .await
        .context("listing pull requests")?;
        let issues = run_tool(
            gh,
            &["issue", "list", "--repo", &slug, "--state", "open", "--limit", "10"],
            None,
            &[],
        )
        .await
        .context("listing issues")?;

        Ok(ok(
            format!(
                "{} recently merged pull requests and {} open issues in {slug}",
                prs.lines().count(),
                issues.lines().count()
            ),
            format!("## merged pull requests\n{prs}\n## open issues\n{issues}"),
        ))
    }
}

pub struct Logs;

#[async_trait::async_trait]
impl Step for Logs {
    fn id(&self) -> &'static str {
        "logs"
    }
    fn title(&self) -> &'static str {
        "Error logs"
    }
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let Some((api_key, app_key)) = ctx.credentials.datadog_keys() else {
            return Ok(StepOutcome::skipped("Datadog credentials not configured"));
        };
        let Some(service) = &ctx.alert.service else {
            return Ok(StepOutcome::skipped("no service to search logs of"));
        };

        let url = ctx
            .credentials
            .datadog_site
            .join("/api/v2/logs/events/search")?;
        let query = format!("service:{service} status:error");

        let response: Value = ctx
            .http
            .post(url)
            .header("DD-API-KEY", api_key)
            .header("DD-APPLICATION-KEY", app_key)
            .json(&serde_json::json!({
                "filter": {"query": query, "from": "now-1h", "to": "now"},
                "sort": "-timestamp",
                "page": {"limit": 50},
            }))
            .send()
            .await
            .context("searching Datadog logs")?
            .error_for_status()?
            .json()
            .await
            .context("decoding Datadog logs")?;

        let lines: Vec<String> = response["data"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|event| {
                let attrs = &event["attributes"];
                format!(
                    "{} {} {}",
                    attrs["timestamp"].as_str().unwrap_or("-"),
                    attrs["host"].as_str().unwrap_or("-"),
                    attrs["message"].as_str().unwrap_or("").replace('\n', " "),
                )
            })
            .collect();

        Ok(ok(
            format!("{} error logs in the last hour for `{query}`", lines.len()),
            lines.join("\n"),
        ))
    }
}

/// Text searched for within wiki pages and tickets.
fn incident_query(ctx: &StepContext<'_>) -> String {
    ctx.alert
        .service
        .clone()
        .unwrap_or_else(|| ctx.alert.name.clone())
        .replace('"', " ")
}

fn authorize(
    request: reqwest::RequestBuilder,
    user: &Option<String>,
    token: &str,
) -> reqwest::RequestBuilder {
    match user {
        Some(user) => request.basic_auth(user, Some(token)),
        None => request.bearer_auth(token),
    }
}

fn render_incidents(incidents: &[SimilarIncident]) -> String {
    incidents
        .iter()
        .map(|i| {
            format!(
                "- {}{} {}\n",
                i.key.as_deref().map(|k| format!("{k}: ")).unwrap_or_default(),
                i.title,
                i.url.as_deref().unwrap_or(""),
            )
        })
        .collect()
}

pub struct Wiki;

#[async_trait::async_trait]
impl Step for Wiki {
    fn id(&self) -> &'static str {
        "wiki"
    }
    fn title(&self) -> &'static str {
        "Wiki pages"
    }
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let creds = ctx.credentials;
        let (Some(base), Some(token)) = (&creds.confluence_url, &creds.confluence_token) else {
            return Ok(StepOutcome::skipped("Confluence not configured"));
        };

        let cql = format!(
            r#"type = page AND text ~ "{}" ORDER BY lastmodified DESC"#,
            incident_query(ctx)
        );
        let mut url = join_path(base, "rest/api/content/search")?;
        url.query_pairs_mut()
            .append_pair("cql", &cql)
            .append_pair("limit", "5");

        let response: Value = authorize(ctx.http.get(url), &creds.confluence_user, token)
            .send()
            .await
            .context("searching Confluence")?
            .error_for_status()?
            .json()
            .await
            .context("decoding Confluence results")?;

        let incidents = parse_confluence(&response, base);

        Ok(StepOutcome::Ok(StepOutput {
            summary: format!("{} related wiki pages", incidents.len()),
            output: Some(render_incidents(&incidents)),
            repo_files: Vec::new(),
            similar_incidents: incidents,
        }))
    }
}

pub fn parse_confluence(response: &Value, base: &url::Url) -> Vec<SimilarIncident> {
    response["results"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|page| {
            let title = page["title"].as_str()?.to_string();
            let url = page["_links"]["webui"]
                .as_str()
                .and_then(|webui| join_path(base, webui.trim_start_matches('/')).ok())
                .map(|u| u.to_string());

            Some(SimilarIncident {
                source: IncidentSource::Confluence,
                key: page["id"].as_str().map(str::to_string),
                title,
                url,
                snippet: page["excerpt"].as_str().map(str::to_string),
            })
        })
        .collect()
}

pub struct Tickets;

#[async_trait::async_trait]
impl Step for Tickets {
    fn id(&self) -> &'static str {
        "tickets"
    }
    fn title(&self) -> &'static str {
        "Related tickets"
    }
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let creds = ctx.credentials;
        let (Some(base), Some(token)) = (&creds.jira_url, &creds.jira_token) else {
            return Ok(StepOutcome::skipped("Jira not configured"));
        };

        let jql = format!(
            r#"text ~ "{}" ORDER BY updated DESC"#,
            incident_query(ctx)
        );
        let mut url = join_path(base, "rest/api/2/search")?;
        url.query_pairs_mut()
            .append_pair("jql", &jql)
            .append_pair("maxResults", "5")
            .append_pair("fields", "summary,status");

        let response: Value = authorize(ctx.http.get(url), &creds.jira_user, token)
            .send()
            .await
            .context("searching Jira")?
            .error_for_status()?
            .json()
            .await
            .context("decoding Jira results")?;

        let incidents = parse_jira(&response, base);

        Ok(StepOutcome::Ok(StepOutput {
            summary: format!("{} related tickets", incidents.len()),
            output: Some(render_incidents(&incidents)),
            repo_files: Vec::new(),
            similar_incidents: incidents,
        }))
    }
}

pub fn parse_jira(response: &Value, base: &url::Url) -> Vec<SimilarIncident> {
    response["issues"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|issue| {
            let key = issue["key"].as_str()?;
            let fields = &issue["fields"];

            Some(SimilarIncident {
                source: IncidentSource::Jira,
                key: Some(key.to_string()),
                title: fields["summary"].as_str().unwrap_or(key).to_string(),
                url: join_path(base, &format!("browse/{key}"))
                    .ok()
                    .map(|u| u.to_string()),
                snippet: fields["status"]["name"].as_str().map(str::to_string),
            })
        })
        .collect()
}

/// Join a relative path onto `base`, preserving any path prefix of `base`.
fn join_path(base: &url::Url, path: &str) -> Result<url::Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        base.set_path(&format!("{}/", base.path()));
    }
    base.join(path)
}

lazy_static::lazy_static! {
    static ref LINK_RE: regex::Regex =
        regex::Regex::new(r#"https?://[^\s)\]>"'|]+"#).expect("Is a valid regex");
}

/// First link within the alert message.
pub fn first_link(message: &str) -> Option<&str> {
    LINK_RE
        .find(message)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';']))
}

pub struct Runbook;

#[async_trait::async_trait]
impl Step for Runbook {
    fn id(&self) -> &'static str {
        "runbook"
    }
    fn title(&self) -> &'static str {
        "Runbook"
    }
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let Some(link) = first_link(&ctx.alert.message) else {
            return Ok(StepOutcome::skipped("no link in the alert message"));
        };

        let body = ctx
            .http
            .get(link)
            .send()
            .await
            .with_context(|| format!("fetching runbook {link}"))?
            .error_for_status()?
            .text()
            .await?;

        Ok(ok(format!("fetched runbook {link}"), body))
    }
}
