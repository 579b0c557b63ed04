use std::path::PathBuf;
use std::time::Duration;

/// Config is the complete configuration of a triage agent.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct Config {
    #[clap(flatten)]
    pub scheduler: SchedulerConfig,
    #[clap(flatten)]
    pub alerts: AlertConfig,
    #[clap(flatten)]
    pub evidence: EvidenceConfig,
    #[clap(flatten)]
    pub provider: ProviderConfig,
    #[clap(flatten)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, clap::Args)]
pub struct SchedulerConfig {
    /// Name of the scheduler, which keys its lock and recorded state.
    #[clap(long = "scheduler-name", env = "TRIAGE_SCHEDULER_NAME", default_value = "triage")]
    pub name: String,
    /// Path of the SQLite database.
    #[clap(long = "database", env = "TRIAGE_DATABASE", default_value = "triage.db")]
    pub database: PathBuf,
    /// Directory under which the inputs and outputs of each run are written.
    #[clap(long = "runs-dir", env = "TRIAGE_RUNS_DIR", default_value = "runs")]
    pub runs_dir: PathBuf,
    /// Interval between scheduler ticks.
    #[clap(long = "poll-interval", env = "TRIAGE_POLL_INTERVAL", default_value = "60s", value_parser = humantime::parse_duration)]
    pub poll_interval: Duration,
    /// Duration of the scheduler lease. It's renewed at half this interval while held.
    #[clap(long = "lease-duration", env = "TRIAGE_LEASE_DURATION", default_value = "2m", value_parser = humantime::parse_duration)]
    pub lease_duration: Duration,
    /// Maximum number of cycles run by a tick which is catching up on missed intervals.
    #[clap(long = "max-catchup-cycles", env = "TRIAGE_MAX_CATCHUP_CYCLES", default_value = "5")]
    pub max_catchup_cycles: u32,
    /// Maximum duration of a single discovery and triage cycle.
    #[clap(long = "cycle-timeout", env = "TRIAGE_CYCLE_TIMEOUT", default_value = "45m", value_parser = humantime::parse_duration)]
    pub cycle_timeout: Duration,
    /// Running runs older than this are presumed abandoned and failed.
    #[clap(long = "stale-run-timeout", env = "TRIAGE_STALE_RUN_TIMEOUT", default_value = "2h", value_parser = humantime::parse_duration)]
    pub stale_run_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "triage".to_string(),
            database: PathBuf::from("triage.db"),
            runs_dir: PathBuf::from("runs"),
            poll_interval: Duration::from_secs(60),
            lease_duration: Duration::from_secs(120),
            max_catchup_cycles: 5,
            cycle_timeout: Duration::from_secs(45 * 60),
            stale_run_timeout: Duration::from_secs(2 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct AlertConfig {
    /// Monitor states which are eligible for triage.
    #[clap(long = "alert-states", env = "TRIAGE_ALERT_STATES", value_delimiter = ',', default_value = "Alert,Warn")]
    pub states: Vec<String>,
    /// Case-insensitive text which must appear in the monitor name, message, or query.
    #[clap(long = "alert-query", env = "TRIAGE_ALERT_QUERY")]
    pub query: Option<String>,
    /// Only triage monitors tagged with this team.
    #[clap(long = "alert-team", env = "TRIAGE_ALERT_TEAM")]
    pub team: Option<String>,
    /// Only triage monitors tagged with this Kubernetes namespace.
    #[clap(long = "alert-namespace", env = "TRIAGE_ALERT_NAMESPACE")]
    pub namespace: Option<String>,
    /// Monitors whose state changed longer ago than this are ignored.
    #[clap(long = "max-alert-age", env = "TRIAGE_MAX_ALERT_AGE", default_value = "24h", value_parser = humantime::parse_duration)]
    pub max_age: Duration,
    /// Directory holding checkouts of service repositories, by name.
    #[clap(long = "repo-root", env = "TRIAGE_REPO_ROOT")]
    pub repo_root: Option<PathBuf>,
    /// YAML file mapping service names to repository paths and URLs.
    #[clap(long = "repo-map", env = "TRIAGE_REPO_MAP")]
    pub repo_map: Option<PathBuf>,
    /// GitHub organization of service repositories.
    #[clap(long = "github-org", env = "TRIAGE_GITHUB_ORG")]
    pub github_org: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            states: vec!["Alert".to_string(), "Warn".to_string()],
            query: None,
            team: None,
            namespace: None,
            max_age: Duration::from_secs(24 * 60 * 60),
            repo_root: None,
            repo_map: None,
            github_org: None,
        }
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct EvidenceConfig {
    /// Maximum number of characters of each evidence artifact.
    #[clap(long = "evidence-truncate-chars", env = "TRIAGE_EVIDENCE_TRUNCATE_CHARS", default_value = "20000")]
    pub truncate_chars: usize,
    /// Maximum duration of each evidence step.
    #[clap(long = "evidence-step-timeout", env = "TRIAGE_EVIDENCE_STEP_TIMEOUT", default_value = "60s", value_parser = humantime::parse_duration)]
    pub step_timeout: Duration,
    /// Number of recent commits examined in the service repository.
    #[clap(long = "commit-depth", env = "TRIAGE_COMMIT_DEPTH", default_value = "20")]
    pub commit_depth: usize,
    /// Maximum number of repository file hits collected by a search.
    #[clap(long = "max-file-hits", env = "TRIAGE_MAX_FILE_HITS", default_value = "50")]
    pub max_file_hits: usize,
    /// Number of repository findings included in the prompt.
    #[clap(long = "top-findings", env = "TRIAGE_TOP_FINDINGS", default_value = "10")]
    pub top_findings: usize,
    /// YAML file of fix heuristics, re-read for every run.
    #[clap(long = "heuristics", env = "TRIAGE_HEURISTICS")]
    pub heuristics: Option<PathBuf>,
    #[clap(long = "git-bin", env = "TRIAGE_GIT_BIN", default_value = "git")]
    pub git_bin: String,
    #[clap(long = "rg-bin", env = "TRIAGE_RG_BIN", default_value = "rg")]
    pub rg_bin: String,
    #[clap(long = "kubectl-bin", env = "TRIAGE_KUBECTL_BIN", default_value = "kubectl")]
    pub kubectl_bin: String,
    #[clap(long = "gh-bin", env = "TRIAGE_GH_BIN", default_value = "gh")]
    pub gh_bin: String,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            truncate_chars: 20_000,
            step_timeout: Duration::from_secs(60),
            commit_depth: 20,
            max_file_hits: 50,
            top_findings: 10,
            heuristics: None,
            git_bin: "git".to_string(),
            rg_bin: "rg".to_string(),
            kubectl_bin: "kubectl".to_string(),
            gh_bin: "gh".to_string(),
        }
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct ProviderConfig {
    /// Triage provider which diagnoses alerts: one of opencode, codex, or mock.
    #[clap(long = "provider", env = "TRIAGE_PROVIDER", default_value = "opencode")]
    pub provider: String,
    /// Path of the provider binary, if it's not the provider's name on $PATH.
    #[clap(long = "provider-bin", env = "TRIAGE_PROVIDER_BIN")]
    pub binary: Option<String>,
    /// Model requested of the provider. A failed attempt is retried once without it.
    #[clap(long = "provider-model", env = "TRIAGE_PROVIDER_MODEL")]
    pub model: Option<String>,
    /// Maximum duration of a provider invocation.
    #[clap(long = "provider-timeout", env = "TRIAGE_PROVIDER_TIMEOUT", default_value = "30m", value_parser = humantime::parse_duration)]
    pub timeout: Duration,
    /// Delay between SIGTERM and SIGKILL of a timed-out provider.
    #[clap(long = "provider-kill-grace", env = "TRIAGE_PROVIDER_KILL_GRACE", default_value = "10s", value_parser = humantime::parse_duration)]
    pub kill_grace: Duration,
    /// Interval at which the progress of a running provider is logged.
    #[clap(long = "provider-heartbeat", env = "TRIAGE_PROVIDER_HEARTBEAT", default_value = "30s", value_parser = humantime::parse_duration)]
    pub heartbeat: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: "opencode".to_string(),
            binary: None,
            model: None,
            timeout: Duration::from_secs(30 * 60),
            kill_grace: Duration::from_secs(10),
            heartbeat: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, clap::Args)]
pub struct Credentials {
    /// Base URL of the Datadog API.
    #[clap(long = "datadog-site", env = "DD_SITE_URL", default_value = "https://api.datadoghq.com")]
    pub datadog_site: url::Url,
    #[clap(long = "datadog-api-key", env = "DD_API_KEY", hide_env_values = true)]
    pub datadog_api_key: Option<String>,
    #[clap(long = "datadog-app-key", env = "DD_APP_KEY", hide_env_values = true)]
    pub datadog_app_key: Option<String>,
    /// Base URL of Confluence, such as https://acme.atlassian.net/wiki.
    #[clap(long = "confluence-url", env = "CONFLUENCE_URL")]
    pub confluence_url: Option<url::Url>,
    #[clap(long = "confluence-user", env = "CONFLUENCE_USER")]
    pub confluence_user: Option<String>,
    #[clap(long = "confluence-token", env = "CONFLUENCE_TOKEN", hide_env_values = true)]
    pub confluence_token: Option<String>,
    /// Base URL of Jira, such as https://acme.atlassian.net.
    #[clap(long = "jira-url", env = "JIRA_URL")]
    pub jira_url: Option<url::Url>,
    #[clap(long = "jira-user", env = "JIRA_USER")]
    pub jira_user: Option<String>,
    #[clap(long = "jira-token", env = "JIRA_TOKEN", hide_env_values = true)]
    pub jira_token: Option<String>,
}

impl Credentials {
    pub fn datadog_keys(&self) -> Option<(&str, &str)> {
        match (&self.datadog_api_key, &self.datadog_app_key) {
            (Some(api), Some(app)) => Some((api, app)),
            _ => None,
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            datadog_site: url::Url::parse("https://api.datadoghq.com")
                .expect("default Datadog site is a valid URL"),
            datadog_api_key: None,
            datadog_app_key: None,
            confluence_url: None,
            confluence_user: None,
            confluence_token: None,
            jira_url: None,
            jira_user: None,
            jira_token: None,
        }
    }
}

// Secrets are never logged.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn redact(secret: &Option<String>) -> &'static str {
            if secret.is_some() {
                "<redacted>"
            } else {
                "<unset>"
            }
        }
        f.debug_struct("Credentials")
            .field("datadog_site", &self.datadog_site.as_str())
            .field("datadog_api_key", &redact(&self.datadog_api_key))
            .field("datadog_app_key", &redact(&self.datadog_app_key))
            .field("confluence_url", &self.confluence_url.as_ref().map(url::Url::as_str))
            .field("confluence_user", &self.confluence_user)
            .field("confluence_token", &redact(&self.confluence_token))
            .field("jira_url", &self.jira_url.as_ref().map(url::Url::as_str))
            .field("jira_user", &self.jira_user)
            .field("jira_token", &redact(&self.jira_token))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct Args {
        #[clap(flatten)]
        config: Config,
    }

    #[test]
    fn test_cli_defaults_match_default_impls() {
        let Args { config } = Args::try_parse_from(["triage-agent"]).unwrap();
        let defaults = Config::default();

        assert_eq!(format!("{config:?}"), format!("{defaults:?}"));
    }

    #[test]
    fn test_parse_durations_and_lists() {
        let Args { config } = Args::try_parse_from([
            "triage-agent",
            "--poll-interval",
            "5m",
            "--alert-states",
            "Alert,No Data",
            "--provider",
            "codex",
            "--provider-model",
            "o4-mini",
            "--datadog-api-key",
            "secret-api-key",
        ])
        .unwrap();

        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(300));
        assert_eq!(config.alerts.states, vec!["Alert", "No Data"]);
        assert_eq!(config.provider.provider, "codex");
        assert_eq!(config.provider.model.as_deref(), Some("o4-mini"));
        assert!(config.credentials.datadog_keys().is_none());
        assert!(!format!("{:?}", config.credentials).contains("secret-api-key"));
    }
}
