use crate::alerts::{title_prefix, AlertContext};
use crate::config::AlertConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// How a repository was resolved for an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoSource {
    Mapping,
    Filesystem,
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRepo {
    pub name: String,
    pub path: Option<PathBuf>,
    pub url: Option<String>,
    pub source: RepoSource,
}

/// MapEntry is an explicit repository of a service within the repository map file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MapEntry {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
}

/// RepoResolver maps alerts to the repositories of their services.
#[derive(Debug, Clone, Default)]
pub struct RepoResolver {
    map: BTreeMap<String, MapEntry>,
    root: Option<PathBuf>,
    github_org: Option<String>,
}

impl RepoResolver {
    pub fn new(
        map: BTreeMap<String, MapEntry>,
        root: Option<PathBuf>,
        github_org: Option<String>,
    ) -> Self {
        Self {
            map,
            root,
            github_org,
        }
    }

    /// Build a resolver from configuration, reading its repository map file.
    pub fn load(config: &AlertConfig) -> anyhow::Result<Self> {
        let map = match &config.repo_map {
            None => BTreeMap::new(),
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("reading repository map {}", path.display()))?;
                serde_yaml::from_str(&content)
                    .with_context(|| format!("parsing repository map {}", path.display()))?
            }
        };
        Ok(Self::new(
            map,
            config.repo_root.clone(),
            config.github_org.clone(),
        ))
    }

    /// Candidate repository names of an alert, in order of preference.
    pub fn candidates(alert: &AlertContext) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();

        let tagged = ["service", "repo", "app", "kube_deployment"]
            .iter()
            .filter_map(|key| alert.tag(key));

        for name in alert
            .service
            .as_deref()
            .into_iter()
            .chain(tagged)
            .chain(title_prefix(&alert.name))
        {
            let name = name.trim();
            if !name.is_empty() && !out.iter().any(|o| o == name) {
                out.push(name.to_string());
            }
        }
        out
    }

    pub fn resolve(&self, alert: &AlertContext) -> Option<ResolvedRepo> {
        let candidates = Self::candidates(alert);

        // Explicit mappings take precedence.
        for name in &candidates {
            let Some(entry) = self.map.get(name) else {
                continue;
            };
            let path = entry.path.as_ref().map(|path| match &self.root {
                Some(root) if path.is_relative() => root.join(path),
                _ => path.clone(),
            });
            let url = entry.url.clone().or_else(|| self.github_url(name));

            return Some(ResolvedRepo {
                name: name.clone(),
                path,
                url,
                source: RepoSource::Mapping,
            });
        }

        // Then checkouts beneath the repository root.
        if let Some(root) = &self.root {
            for name in &candidates {
                let path = root.join(name);
                if is_checkout(&path) {
                    return Some(ResolvedRepo {
                        name: name.clone(),
                        url: self.github_url(name),
                        path: Some(path),
                        source: RepoSource::Filesystem,
                    });
                }
            }
        }

        // Finally, assume the service lives in a repository of the same name.
        let name = candidates.into_iter().next()?;
        let url = self.github_url(&name)?;

        Some(ResolvedRepo {
            name,
            path: None,
            url: Some(url),
            source: RepoSource::Heuristic,
        })
    }

    fn github_url(&self, name: &str) -> Option<String> {
        self.github_org
            .as_ref()
            .map(|org| format!("https://github.com/{org}/{name}"))
    }
}

fn is_checkout(path: &Path) -> bool {
    // Reject names which would escape the repository root.
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return false;
    }
    path.is_dir()
}

/// Parse `owner/name` from a GitHub repository URL.
pub fn github_slug(url: &str) -> Option<String> {
    let url = url::Url::parse(url).ok()?;
    if url.host_str() != Some("github.com") {
        return None;
    }
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    let owner = segments.next()?;
    let name = segments.next()?.trim_end_matches(".git");
    Some(format!("{owner}/{name}"))
}
