use super::{parse::parse_report, Provider, ProviderReport, ProviderRequest};
use crate::config::ProviderConfig;
use anyhow::Context;
use async_process::{supervise, SuperviseOptions};

/// Flavor is the command-line convention of an agent CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    OpenCode,
    Codex,
}

impl Flavor {
    pub fn name(&self) -> &'static str {
        match self {
            Flavor::OpenCode => "opencode",
            Flavor::Codex => "codex",
        }
    }

    /// Arguments which run `request`, reading the prompt from stdin.
    pub fn args(&self, request: &ProviderRequest, model: Option<&str>) -> Vec<String> {
        let mut args = Vec::new();

        match self {
            Flavor::OpenCode => {
                args.extend(["run", "--format", "json"].map(String::from));
                if let Some(model) = model {
                    args.extend(["--model".to_string(), model.to_string()]);
                }
                if let Some(session) = &request.resume_session {
                    args.extend(["--session".to_string(), session.clone()]);
                }
                for file in &request.attachments {
                    args.extend(["-f".to_string(), file.display().to_string()]);
                }
            }
            Flavor::Codex => {
                args.extend(["exec", "--json", "--skip-git-repo-check", "-C"].map(String::from));
                args.push(request.working_dir.display().to_string());
                if let Some(model) = model {
                    args.extend(["--model".to_string(), model.to_string()]);
                }
                if let Some(session) = &request.resume_session {
                    args.extend(["resume".to_string(), session.clone()]);
                }
                args.push("-".to_string());
            }
        }
        args
    }
}

/// CliProvider runs an agent CLI as a supervised subprocess.
pub struct CliProvider {
    flavor: Flavor,
    program: String,
    options: SuperviseOptions,
}

impl CliProvider {
    pub fn new(flavor: Flavor, config: &ProviderConfig) -> Self {
        Self {
            flavor,
            program: config
                .binary
                .clone()
                .unwrap_or_else(|| flavor.name().to_string()),
            options: SuperviseOptions {
                timeout: config.timeout,
                grace: config.kill_grace,
                heartbeat: Some(config.heartbeat),
            },
        }
    }

    #[tracing::instrument(skip_all, fields(run_id = request.run_id, provider = self.flavor.name(), model = ?model))]
    async fn attempt(
        &self,
        request: &ProviderRequest,
        model: Option<&str>,
    ) -> anyhow::Result<ProviderReport> {
        let mut cmd = async_process::Command::new(&self.program);
        cmd.args(self.flavor.args(request, model))
            .current_dir(&request.working_dir);

        let run_id = request.run_id;
        let output = supervise(
            &mut cmd,
            Some(request.prompt.as_bytes()),
            &self.options,
            |progress| {
                tracing::info!(
                    run_id,
                    pid = progress.pid,
                    elapsed = ?progress.elapsed,
                    stdout_bytes = progress.stdout_bytes,
                    stderr_bytes = progress.stderr_bytes,
                    "provider still running"
                )
            },
        )
        .await
        .with_context(|| format!("running {}", self.program))?;

        if !output.status.success() {
            anyhow::bail!(
                "{} exited with code {}: {}",
                self.program,
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| output.status.to_string()),
                async_process::supervise::tail_chars(output.stderr.trim_end(), 2000),
            );
        }
        tracing::debug!(elapsed = ?output.elapsed, stdout_bytes = output.stdout.len(), "provider finished");

        Ok(parse_report(&output.stdout))
    }
}

#[async_trait::async_trait]
impl Provider for CliProvider {
    fn name(&self) -> &str {
        self.flavor.name()
    }

    async fn run(&self, request: &ProviderRequest) -> anyhow::Result<ProviderReport> {
        let Some(model) = request.model.as_deref() else {
            return self.attempt(request, None).await;
        };

        match self.attempt(request, Some(model)).await {
            Ok(report) => Ok(report),
            Err(error) => {
                tracing::warn!(
                    run_id = request.run_id,
                    model,
                    error = %format!("{error:#}"),
                    "provider failed with model override; retrying with its default model"
                );
                self.attempt(request, None).await
            }
        }
    }
}
