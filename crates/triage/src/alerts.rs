use crate::config::AlertConfig;
use crate::monitor::MonitorSource;
use crate::repo::{RepoResolver, ResolvedRepo};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// RawAlert is a monitor as returned by the monitoring source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawAlert {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub overall_state: String,
    #[serde(default)]
    pub overall_state_modified: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// AlertContext is an alert being triaged, with fields derived from its
/// monitor and, once resolved, the repository of its service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertContext {
    pub monitor_id: i64,
    pub name: String,
    pub state: String,
    pub priority: Option<i64>,
    pub message: String,
    pub query: String,
    pub tags: Vec<String>,
    /// Raw modification time of the monitor's overall state, which together
    /// with `monitor_id` identifies an occurrence of the alert.
    pub overall_state_modified: String,
    pub modified_at: Option<DateTime<Utc>>,
    pub service: Option<String>,
    pub team: Option<String>,
    pub namespace: Option<String>,
    pub repo: Option<ResolvedRepo>,
    pub monitor_url: Option<String>,
}

impl AlertContext {
    pub fn from_raw(raw: RawAlert, monitor_url: Option<String>) -> Self {
        let modified_at = raw
            .overall_state_modified
            .as_deref()
            .and_then(|m| DateTime::parse_from_rfc3339(m).ok())
            .map(|m| m.with_timezone(&Utc));

        let service = tag_value(&raw.tags, "service")
            .map(str::to_string)
            .or_else(|| title_prefix(&raw.name).map(str::to_string));
        let team = tag_value(&raw.tags, "team").map(str::to_string);
        let namespace = tag_value(&raw.tags, "kube_namespace")
            .or_else(|| tag_value(&raw.tags, "namespace"))
            .map(str::to_string);

        Self {
            monitor_id: raw.id,
            name: raw.name,
            state: raw.overall_state,
            priority: raw.priority,
            message: raw.message,
            query: raw.query,
            tags: raw.tags,
            overall_state_modified: raw.overall_state_modified.unwrap_or_default(),
            modified_at,
            service,
            team,
            namespace,
            repo: None,
            monitor_url,
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        tag_value(&self.tags, key)
    }

    pub fn repo_path(&self) -> Option<&std::path::Path> {
        self.repo.as_ref().and_then(|r| r.path.as_deref())
    }

    pub fn repo_url(&self) -> Option<&str> {
        self.repo.as_ref().and_then(|r| r.url.as_deref())
    }
}

/// Returns the value of the first `key:value` tag.
pub fn tag_value<'t>(tags: &'t [String], key: &str) -> Option<&'t str> {
    tags.iter().find_map(|tag| {
        let (k, v) = tag.split_once(':')?;
        (k == key && !v.is_empty()).then_some(v)
    })
}

/// Returns `name` of a title like "[name] Something is wrong".
pub fn title_prefix(title: &str) -> Option<&str> {
    let rest = title.trim_start().strip_prefix('[')?;
    let (name, _) = rest.split_once(']')?;
    let name = name.trim();
    (!name.is_empty()).then_some(name)
}

/// Select the alerts eligible for triage, most recently modified first.
pub fn select(
    alerts: Vec<AlertContext>,
    config: &AlertConfig,
    now: DateTime<Utc>,
) -> Vec<AlertContext> {
    let query = config.query.as_ref().map(|q| q.to_lowercase());
    let max_age = chrono::Duration::from_std(config.max_age)
        .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));

    let mut alerts: Vec<_> = alerts
        .into_iter()
        .filter(|alert| {
            config
                .states
                .iter()
                .any(|state| state.eq_ignore_ascii_case(&alert.state))
        })
        .filter(|alert| {
            // Without a state modification time, the alert has no identity
            // which distinguishes one transition from the next.
            if alert.overall_state_modified.is_empty() {
                tracing::warn!(
                    monitor_id = alert.monitor_id,
                    "skipping alert without a state modification time"
                );
                return false;
            }
            true
        })
        .filter(|alert| match &query {
            None => true,
            Some(query) => [&alert.name, &alert.message, &alert.query]
                .iter()
                .any(|text| text.to_lowercase().contains(query)),
        })
        .filter(|alert| match &config.team {
            None => true,
            Some(team) => alert.team.as_deref() == Some(team.as_str()),
        })
        .filter(|alert| match &config.namespace {
            None => true,
            Some(ns) => alert.namespace.as_deref() == Some(ns.as_str()),
        })
        .filter(|alert| match alert.modified_at {
            // Alerts of unknown age are kept.
            None => true,
            Some(modified_at) => now.signed_duration_since(modified_at) <= max_age,
        })
        .collect();

    // Newest first, and alerts of unknown age last.
    alerts.sort_by(|l, r| r.modified_at.cmp(&l.modified_at));
    alerts
}

/// Discover alerts which are eligible and not yet triaged, enriched with
/// their resolved repositories.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn discover(
    monitors: &dyn MonitorSource,
    store: &triage_sql::Store,
    config: &AlertConfig,
    resolver: &RepoResolver,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<AlertContext>> {
    let raw = monitors
        .fetch_active_alerts()
        .await
        .context("fetching active alerts")?;
    let fetched = raw.len();

    let alerts = raw
        .into_iter()
        .map(|raw| {
            let url = monitors.monitor_url(raw.id);
            AlertContext::from_raw(raw, url)
        })
        .collect();
    let alerts = select(alerts, config, now);
    let eligible = alerts.len();

    let mut fresh = Vec::with_capacity(alerts.len());
    for mut alert in alerts {
        let seen = triage_sql::alert_events::exists(
            &store.conn(),
            alert.monitor_id,
            &alert.overall_state_modified,
        )
        .context("checking for a previously-triaged alert")?;

        if seen {
            continue;
        }
        alert.repo = resolver.resolve(&alert);
        fresh.push(alert);
    }

    tracing::debug!(fetched, eligible, fresh = fresh.len(), "discovered alerts");
    Ok(fresh)
}

#[cfg(test)]
pub(crate) fn fixture(id: i64, name: &str, modified: &str) -> RawAlert {
    RawAlert {
        id,
        name: name.to_string(),
        overall_state: "Alert".to_string(),
        overall_state_modified: Some(modified.to_string()),
        priority: Some(2),
        message: "Error rate is above 5%. See https://wiki.example.com/runbooks/checkout".to_string(),
        query: "sum(last_5m):sum:trace.http.request.errors{service:checkout} > 5".to_string(),
        tags: vec![
            "service:checkout".to_string(),
            "team:payments".to_string(),
            "kube_namespace:shop".to_string(),
        ],
    }
}
