use crate::alerts::RawAlert;
use crate::config::Credentials;
use anyhow::Context;

/// MonitorSource is a source of currently-active alerts.
#[async_trait::async_trait]
pub trait MonitorSource: Send + Sync {
    async fn fetch_active_alerts(&self) -> anyhow::Result<Vec<RawAlert>>;

    /// Web URL at which a monitor may be viewed.
    fn monitor_url(&self, _monitor_id: i64) -> Option<String> {
        None
    }
}

/// DatadogMonitors fetches alerting monitors from the Datadog API.
pub struct DatadogMonitors {
    client: reqwest::Client,
    site: url::Url,
    keys: Option<(String, String)>,
}

impl DatadogMonitors {
    pub fn new(client: reqwest::Client, credentials: &Credentials) -> Self {
        Self {
            client,
            site: credentials.datadog_site.clone(),
            keys: credentials
                .datadog_keys()
                .map(|(api, app)| (api.to_string(), app.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl MonitorSource for DatadogMonitors {
    #[tracing::instrument(level = "debug", skip(self), fields(site = %self.site))]
    async fn fetch_active_alerts(&self) -> anyhow::Result<Vec<RawAlert>> {
        let Some((api_key, app_key)) = &self.keys else {
            anyhow::bail!("Datadog API and application keys are not configured");
        };

        let mut url = self.site.join("/api/v1/monitor")?;
        url.query_pairs_mut()
            .append_pair("group_states", "alert,warn,no data")
            .append_pair("with_downtimes", "false");

        let monitors: Vec<RawAlert> = self
            .client
            .get(url)
            .header("DD-API-KEY", api_key)
            .header("DD-APPLICATION-KEY", app_key)
            .send()
            .await
            .context("requesting Datadog monitors")?
            .error_for_status()?
            .json()
            .await
            .context("decoding Datadog monitors")?;

        Ok(monitors)
    }

    fn monitor_url(&self, monitor_id: i64) -> Option<String> {
        let host = self.site.host_str()?;
        let app = match host.strip_prefix("api.") {
            Some(rest) => format!("app.{rest}"),
            None => host.to_string(),
        };
        Some(format!("https://{app}/monitors/{monitor_id}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_monitor_urls() {
        let monitors = DatadogMonitors::new(reqwest::Client::new(), &Credentials::default());
        assert_eq!(
            monitors.monitor_url(42).as_deref(),
            Some("https://app.datadoghq.com/monitors/42")
        );
    }

    #[tokio::test]
    async fn test_missing_keys_is_an_error() {
        let monitors = DatadogMonitors::new(reqwest::Client::new(), &Credentials::default());
        let err = monitors.fetch_active_alerts().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Datadog API and application keys are not configured"
        );
    }

    #[test]
    fn test_decode_monitor() {
        let raw: RawAlert = serde_json::from_str(
            r#"{
                "id": 1234,
                "name": "[checkout] Error rate",
                "overall_state": "Alert",
                "overall_state_modified": "2024-05-01T10:00:00+00:00",
                "priority": null,
                "message": "@oncall-payments",
                "query": "avg(last_5m):avg:errors{*} > 1",
                "tags": ["service:checkout"],
                "options": {"notify_no_data": false},
                "type": "metric alert"
            }"#,
        )
        .unwrap();

        assert_eq!(raw.id, 1234);
        assert_eq!(raw.overall_state, "Alert");
        assert_eq!(raw.priority, None);
        assert_eq!(raw.tags, vec!["service:checkout"]);
    }
}
