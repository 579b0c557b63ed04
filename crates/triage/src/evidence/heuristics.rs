//! Declarative fix heuristics.
//!
//! Rules are read from a YAML document of the form:
//!
//! ```yaml
//! global:
//!   - id: memory-limit
//!     title: Memory limit may be too low
//!     summary: The container memory limit is close to its observed usage.
//!     confidence: 0.6
//!     trigger:
//!       monitor_name_contains: [oom, memory]
//!     search:
//!       pattern: 'memory:\s*"?\d+(Mi|Gi)'
//!       extensions: [yaml, yml]
//!       max_hits: 5
//! services:
//!   checkout:
//!     - id: ...
//! ```
//!
//! and merged with built-in global rules. A file rule having the id of a
//! built-in rule replaces it.

use super::{tools, FixSuggestion, RepoFileHit};
use crate::alerts::AlertContext;
use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Rule {
    pub id: String,
    pub title: String,
    pub summary: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub trigger: Trigger,
    pub search: Search,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Trigger {
    /// Case-insensitive substrings of the monitor name, any of which
    /// trigger the rule. An empty list always triggers.
    #[serde(default)]
    pub monitor_name_contains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Search {
    /// Regular expression matched against each line of candidate files.
    pub pattern: String,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default = "default_max_hits")]
    pub max_hits: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub global: Vec<Rule>,
    #[serde(default)]
    pub services: BTreeMap<String, Vec<Rule>>,
}

fn default_confidence() -> f64 {
    0.5
}

fn default_max_hits() -> usize {
    5
}

const BUILTIN_RULES: &str = r#"
- id: memory-limit
  title: Container memory limit may be too low
  summary: >-
    The alert suggests memory pressure. These manifests set memory limits
    which may be below the service's working set.
  confidence: 0.6
  trigger:
    monitor_name_contains: [oom, memory, killed]
  search:
    pattern: 'memory:\s*["'']?\d+(Mi|Gi)'
    extensions: [yaml, yml]
    max_hits: 5
- id: timeout
  title: Timeout may be too aggressive
  summary: >-
    The alert suggests requests are timing out. These settings configure
    timeouts which may be shorter than current latencies.
  confidence: 0.5
  trigger:
    monitor_name_contains: [timeout, latency, slow, deadline]
  search:
    pattern: '(?i)timeout\w*["'']?\s*[:=]\s*["'']?\d+'
    extensions: [yaml, yml, json, toml, env, properties]
    max_hits: 5
- id: connection-pool
  title: Connection pool may be exhausted
  summary: >-
    The alert suggests connection saturation. These settings bound the
    size of a connection pool.
  confidence: 0.4
  trigger:
    monitor_name_contains: [connection, pool, saturat]
  search:
    pattern: '(?i)(max_?connections|pool_?size|max_?pool)\w*["'']?\s*[:=]\s*\d+'
    extensions: [yaml, yml, json, toml, env, properties]
    max_hits: 5
"#;

/// Built-in global rules.
pub fn builtin() -> Vec<Rule> {
    serde_yaml::from_str(BUILTIN_RULES).expect("built-in rules are valid")
}

/// Load the RuleSet at `path` (if any) merged with built-in rules.
pub fn load(path: Option<&Path>) -> anyhow::Result<RuleSet> {
    let mut rules = match path {
        None => RuleSet::default(),
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading heuristics {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("parsing heuristics {}", path.display()))?
        }
    };

    for rule in builtin() {
        if !rules.global.iter().any(|r| r.id == rule.id) {
            rules.global.push(rule);
        }
    }
    Ok(rules)
}

/// Rules which apply to `alert`: global rules and those of its service,
/// having a trigger which matches the monitor name.
pub fn applicable<'r>(rules: &'r RuleSet, alert: &AlertContext) -> Vec<&'r Rule> {
    let name = alert.name.to_lowercase();

    let service = alert.service.as_deref().and_then(|service| {
        rules
            .services
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(service))
            .map(|(_, rules)| rules.as_slice())
    });

    rules
        .global
        .iter()
        .chain(service.unwrap_or_default())
        .filter(|rule| {
            let contains = &rule.trigger.monitor_name_contains;
            contains.is_empty() || contains.iter().any(|c| name.contains(&c.to_lowercase()))
        })
        .collect()
}

/// Evaluate `rules` against the repository at `repo`.
pub fn evaluate(
    rules: &RuleSet,
    alert: &AlertContext,
    repo: &Path,
) -> anyhow::Result<Vec<FixSuggestion>> {
    let mut out = Vec::new();

    for rule in applicable(rules, alert) {
        let pattern = match regex::Regex::new(&rule.search.pattern) {
            Ok(pattern) => pattern,
            Err(error) => {
                tracing::warn!(rule = %rule.id, %error, "skipping heuristic with invalid pattern");
                continue;
            }
        };
        let hits = tools::scan_files(
            repo,
            &rule.search.extensions,
            &pattern,
            rule.search.max_hits,
            &format!("heuristic:{}", rule.id),
        )
        .with_context(|| format!("scanning {} for heuristic {}", repo.display(), rule.id))?;

        if hits.is_empty() {
            continue;
        }
        // Previews may be trimmed or truncated, so diffs use the file's own line.
        let diff = hits.iter().find_map(|hit| {
            let text = read_line(&repo.join(&hit.path), hit.line)?;
            suggest_diff(hit, &text)
        });

        out.push(FixSuggestion {
            rule_id: rule.id.clone(),
            title: rule.title.clone(),
            summary: rule.summary.clone(),
            confidence: rule.confidence.clamp(0.0, 1.0),
            locations: hits,
            diff,
        });
    }
    Ok(out)
}

lazy_static::lazy_static! {
    static ref MEMORY_RE: regex::Regex =
        regex::Regex::new(r"(\d+)(Mi|Gi)\b").expect("Is a valid regex");
    static ref TIMEOUT_RE: regex::Regex =
        regex::Regex::new(r#"(?i)(timeout\w*["']?\s*[:=]\s*["']?)(\d+)"#).expect("Is a valid regex");
}

/// Returns the 1-based `line` of the file at `path`.
fn read_line(path: &Path, line: usize) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    content
        .lines()
        .nth(line.checked_sub(1)?)
        .map(str::to_string)
}

/// Produce a unified diff for `old`, the full text of the line at `hit`,
/// if it's recognized: memory limits and numeric timeouts are doubled.
pub fn suggest_diff(hit: &RepoFileHit, old: &str) -> Option<String> {

    let new = if let Some(c) = MEMORY_RE.captures(old) {
        let value: u64 = c[1].parse().ok()?;
        MEMORY_RE
            .replace(old, format!("{}{}", value.checked_mul(2)?, &c[2]))
            .into_owned()
    } else if let Some(c) = TIMEOUT_RE.captures(old) {
        let value: u64 = c[2].parse().ok()?;
        TIMEOUT_RE
            .replace(old, format!("${{1}}{}", value.checked_mul(2)?))
            .into_owned()
    } else {
        return None;
    };

    Some(format!(
        "--- a/{path}\n+++ b/{path}\n@@ -{line},1 +{line},1 @@\n-{old}\n+{new}\n",
        path = hit.path,
        line = hit.line,
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alerts::fixture;

    fn alert(name: &str) -> AlertContext {
        AlertContext::from_raw(fixture(9, name, "2024-05-01T10:00:00Z"), None)
    }

    fn hit(preview: &str) -> RepoFileHit {
        RepoFileHit {
            path: "deploy/values.yaml".to_string(),
            line: 7,
            preview: preview.to_string(),
            source: "heuristic:test".to_string(),
        }
    }

    #[test]
    fn test_builtins_parse() {
        let ids: Vec<_> = builtin().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["memory-limit", "timeout", "connection-pool"]);
    }

    fn diff(line: &str) -> Option<String> {
        suggest_diff(&hit(line), line)
    }

    #[test]
    fn test_diffs() {
        insta::assert_snapshot!(diff("    memory: 512Mi").unwrap().trim_end(), @r###"
        --- a/deploy/values.yaml
        +++ b/deploy/values.yaml
        @@ -7,1 +7,1 @@
        -    memory: 512Mi
        +    memory: 1024Mi
        "###);

        assert_eq!(
            diff(r#"  "readTimeoutMs": 1500,"#).unwrap(),
            "--- a/deploy/values.yaml\n+++ b/deploy/values.yaml\n@@ -7,1 +7,1 @@\n-  \"readTimeoutMs\": 1500,\n+  \"readTimeoutMs\": 3000,\n"
        );
        assert!(diff("REQUEST_TIMEOUT=30")
            .unwrap()
            .ends_with("+REQUEST_TIMEOUT=60\n"));
        assert_eq!(diff("replicas: 3"), None);
    }

    #[test]
    fn test_applicable_rules() {
        let rules: RuleSet = serde_yaml::from_str(
            r#"
global:
  - id: timeout
    title: Overridden timeout rule
    summary: Custom.
    trigger:
      monitor_name_contains: [LATENCY]
    search:
      pattern: 'timeout'
services:
  Checkout:
    - id: checkout-always
      title: Checkout rule
      summary: Applies to every checkout alert.
      search:
        pattern: 'retries'
  ledger:
    - id: ledger-only
      title: Ledger rule
      summary: Never applies to checkout.
      search:
        pattern: 'x'
"#,
        )
        .unwrap();

        let mut merged = rules.clone();
        for rule in builtin() {
            if !merged.global.iter().any(|r| r.id == rule.id) {
                merged.global.push(rule);
            }
        }

        let ids = |name: &str| -> Vec<String> {
            applicable(&merged, &alert(name))
                .into_iter()
                .map(|r| format!("{}:{}", r.id, r.title))
                .collect()
        };

        assert_eq!(
            ids("High latency on checkout"),
            vec![
                "timeout:Overridden timeout rule",
                "checkout-always:Checkout rule"
            ]
        );
        assert_eq!(
            ids("Pods OOM killed"),
            vec![
                "memory-limit:Container memory limit may be too low",
                "checkout-always:Checkout rule"
            ]
        );
    }

    #[test]
    fn test_load_and_evaluate() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(repo.join("deploy")).unwrap();
        std::fs::write(
            repo.join("deploy/values.yaml"),
            "resources:\n  limits:\n    memory: 256Mi\n",
        )
        .unwrap();

        let rules_path = dir.path().join("heuristics.yaml");
        std::fs::write(
            &rules_path,
            r#"
services:
  checkout:
    - id: bad-pattern
      title: Broken
      summary: Has an invalid pattern.
      search:
        pattern: '(unclosed'
"#,
        )
        .unwrap();

        let rules = load(Some(&rules_path)).unwrap();
        let suggestions = evaluate(&rules, &alert("Checkout OOM"), &repo).unwrap();

        insta::assert_json_snapshot!(suggestions, @r###"
        [
          {
            "ruleId": "memory-limit",
            "title": "Container memory limit may be too low",
            "summary": "The alert suggests memory pressure. These manifests set memory limits which may be below the service's working set.",
            "confidence": 0.6,
            "locations": [
              {
                "path": "deploy/values.yaml",
                "line": 3,
                "preview": "    memory: 256Mi",
                "source": "heuristic:memory-limit"
              }
            ],
            "diff": "--- a/deploy/values.yaml\n+++ b/deploy/values.yaml\n@@ -3,1 +3,1 @@\n-    memory: 256Mi\n+    memory: 512Mi\n"
          }
        ]
        "###);

        assert!(load(Some(&dir.path().join("missing.yaml"))).is_err());
    }

    #[test]
    fn test_diff_of_long_line_matches_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("deploy")).unwrap();
        let line = format!("    memory: 256Mi  # {}  ", "x".repeat(300));
        std::fs::write(
            dir.path().join("deploy/values.yaml"),
            format!("limits:\n{line}\n"),
        )
        .unwrap();

        let rules = load(None).unwrap();
        let suggestions = evaluate(&rules, &alert("Checkout OOM"), dir.path()).unwrap();
        let suggestion = &suggestions[0];

        // The preview is truncated, but the diff removes the exact line.
        assert!(suggestion.locations[0].preview.ends_with('…'));
        assert_eq!(
            suggestion.diff.as_deref().unwrap(),
            format!(
                "--- a/deploy/values.yaml\n+++ b/deploy/values.yaml\n@@ -2,1 +2,1 @@\n-{line}\n+{}\n",
                line.replace("256Mi", "512Mi")
            )
        );
    }
}
