//! Triage providers turn a prompt and its evidence into a report.

mod cli;
mod mock;
pub mod parse;

pub use cli::{CliProvider, Flavor};
pub use mock::MockProvider;

use crate::alerts::AlertContext;
use crate::config::ProviderConfig;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// ProviderRequest is a single invocation of a Provider.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub run_id: i64,
    pub prompt: String,
    pub alert: AlertContext,
    /// Files which accompany the prompt.
    pub attachments: Vec<PathBuf>,
    pub working_dir: PathBuf,
    pub model: Option<String>,
    /// Session of a prior run to resume.
    pub resume_session: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderReport {
    pub report_markdown: String,
    pub session_id: Option<String>,
    pub session_url: Option<String>,
    pub raw_output: Option<String>,
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, request: &ProviderRequest) -> anyhow::Result<ProviderReport>;
}

pub type Constructor = fn(&ProviderConfig) -> anyhow::Result<Arc<dyn Provider>>;

/// Registry maps provider names to their constructors.
#[derive(Clone)]
pub struct Registry {
    constructors: BTreeMap<String, Constructor>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry of all built-in providers.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("opencode", |config| {
            Ok(Arc::new(CliProvider::new(Flavor::OpenCode, config)))
        });
        registry.register("codex", |config| {
            Ok(Arc::new(CliProvider::new(Flavor::Codex, config)))
        });
        registry.register("mock", |_config| Ok(Arc::new(MockProvider::default())));
        registry
    }

    pub fn register(&mut self, name: &str, constructor: Constructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Build the provider named by `config`.
    pub fn build(&self, config: &ProviderConfig) -> anyhow::Result<Arc<dyn Provider>> {
        let Some(constructor) = self.constructors.get(&config.provider) else {
            anyhow::bail!(
                "unknown provider {:?} (expected one of: {})",
                config.provider,
                self.names().collect::<Vec<_>>().join(", ")
            );
        };
        constructor(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_registry() {
        let registry = Registry::builtin();
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec!["codex", "mock", "opencode"]
        );

        let build = |name: &str| {
            registry.build(&ProviderConfig {
                provider: name.to_string(),
                ..Default::default()
            })
        };
        assert_eq!(build("opencode").unwrap().name(), "opencode");
        assert_eq!(build("codex").unwrap().name(), "codex");
        assert_eq!(build("mock").unwrap().name(), "mock");

        let err = build("claude").err().unwrap();
        assert_eq!(
            err.to_string(),
            r#"unknown provider "claude" (expected one of: codex, mock, opencode)"#
        );
    }
}
