use super::{Provider, ProviderReport, ProviderRequest};

/// MockProvider returns a canned report without running anything.
#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    /// Report to return. By default, a summary of the request.
    pub report: Option<String>,
    /// Session to return. By default, `mock-<run_id>`.
    pub session_id: Option<String>,
    /// If set, every run fails with this error.
    pub error: Option<String>,
}

#[async_trait::async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run(&self, request: &ProviderRequest) -> anyhow::Result<ProviderReport> {
        if let Some(error) = &self.error {
            anyhow::bail!("{error}");
        }
        let report = self.report.clone().unwrap_or_else(|| {
            format!(
                "# Triage of {}\n\nMock report for run {} with {} attachments.\n",
                request.alert.name,
                request.run_id,
                request.attachments.len()
            )
        });

        Ok(ProviderReport {
            report_markdown: report,
            session_id: Some(
                self.session_id
                    .clone()
                    .unwrap_or_else(|| format!("mock-{}", request.run_id)),
            ),
            session_url: None,
            raw_output: None,
        })
    }
}
