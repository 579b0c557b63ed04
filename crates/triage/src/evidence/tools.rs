use super::RepoFileHit;
use crate::alerts::AlertContext;
use anyhow::Context;
use std::path::Path;

/// Maximum characters of a file hit preview.
const PREVIEW_CHARS: usize = 240;
/// Files larger than this are not scanned.
const MAX_SCAN_BYTES: u64 = 1 << 20;
/// Directories which are never scanned.
const SKIP_DIRS: &[&str] = &["node_modules", "target", "vendor", "dist", "build"];

lazy_static::lazy_static! {
    static ref IDENTIFIER_RE: regex::Regex =
        regex::Regex::new(r"\b[A-Za-z_][A-Za-z0-9_.]*(?:Exception|Error|Timeout)\b")
            .expect("Is a valid regex");
    static ref BACKTICK_RE: regex::Regex =
        regex::Regex::new(r"`([^`\n]{3,80})`").expect("Is a valid regex");
}

/// Run `program` with `args` and return its stdout.
/// Exit codes other than zero and those of `ok_codes` are errors.
#[tracing::instrument(level = "debug", skip(args))]
pub async fn run_tool(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    ok_codes: &[i32],
) -> anyhow::Result<String> {
    let mut cmd = async_process::Command::new(program);
    cmd.args(args);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    let output = async_process::output(&mut cmd)
        .await
        .with_context(|| format!("failed to run {program}"))?;

    let code = output.status.code();
    if !output.status.success() && !code.is_some_and(|c| ok_codes.contains(&c)) {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "{program} {} failed with {}: {}",
            args.first().unwrap_or(&""),
            output.status,
            async_process::supervise::tail_chars(stderr.trim(), 500),
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Search terms of an alert, in order of preference.
pub fn search_terms(alert: &AlertContext) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    let mut push = |term: &str| {
        let term = term.trim();
        if term.len() >= 3 && !terms.iter().any(|t| t == term) {
            terms.push(term.to_string());
        }
    };

    if let Some(service) = &alert.service {
        push(service.as_str());
    }
    for text in [&alert.name, &alert.message] {
        for m in BACKTICK_RE.captures_iter(text) {
            push(&m[1]);
        }
        for m in IDENTIFIER_RE.find_iter(text) {
            push(m.as_str());
        }
    }

    terms.truncate(5);
    terms
}

/// Parse `path:line:text` lines, as produced by `rg --line-number --with-filename --no-heading`.
pub fn parse_rg(output: &str, source: &str, max_hits: usize) -> Vec<RepoFileHit> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ':');
            let path = parts.next()?;
            let line = parts.next()?.parse().ok()?;
            let text = parts.next()?;

            Some(RepoFileHit {
                path: path.trim_start_matches("./").to_string(),
                line,
                preview: preview(text),
                source: source.to_string(),
            })
        })
        .take(max_hits)
        .collect()
}

/// Scan files beneath `root` for lines matching `pattern`.
/// If `extensions` is non-empty, only files having one of them are scanned.
/// Hidden and dependency directories are skipped, and paths are visited in
/// sorted order so that results are stable.
pub fn scan_files(
    root: &Path,
    extensions: &[String],
    pattern: &regex::Regex,
    max_hits: usize,
    source: &str,
) -> std::io::Result<Vec<RepoFileHit>> {
    let mut hits = Vec::new();
    scan_dir(root, root, extensions, pattern, max_hits, source, &mut hits)?;
    Ok(hits)
}

fn scan_dir(
    root: &Path,
    dir: &Path,
    extensions: &[String],
    pattern: &regex::Regex,
    max_hits: usize,
    source: &str,
    hits: &mut Vec<RepoFileHit>,
) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                tracing::debug!(dir = %dir.display(), ?error, "skipping unreadable entry");
                None
            }
        })
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if hits.len() >= max_hits {
            break;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') && name != ".env" {
            continue;
        }

        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(error) => {
                tracing::debug!(path = %path.display(), ?error, "skipping unreadable entry");
                continue;
            }
        };

        if file_type.is_dir() {
            if SKIP_DIRS.contains(&name.as_ref()) {
                continue;
            }
            // An unreadable directory doesn't spoil the rest of the scan.
            if let Err(error) = scan_dir(root, &path, extensions, pattern, max_hits, source, hits) {
                tracing::debug!(path = %path.display(), ?error, "skipping unreadable directory");
            }
            continue;
        } else if !file_type.is_file() || !has_extension(&path, extensions) {
            continue;
        } else if entry.metadata().map_or(true, |m| m.len() > MAX_SCAN_BYTES) {
            continue;
        }

        // Binary or non-UTF8 files are skipped.
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let relative = path.strip_prefix(root).unwrap_or(&path).to_string_lossy();

        for (index, line) in content.lines().enumerate() {
            if hits.len() >= max_hits {
                break;
            }
            if pattern.is_match(line) {
                hits.push(RepoFileHit {
                    path: relative.to_string(),
                    line: index + 1,
                    preview: preview(line),
                    source: source.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy())
        .unwrap_or_default();

    extensions.iter().any(|want| {
        let want = want.trim_start_matches('.');
        // Dot-files like `.env` have no extension, only a name.
        want.eq_ignore_ascii_case(&ext) || name.trim_start_matches('.').eq_ignore_ascii_case(want)
    })
}

fn preview(line: &str) -> String {
    let line = line.trim_end();
    match line.char_indices().nth(PREVIEW_CHARS) {
        Some((offset, _)) => format!("{}…", &line[..offset]),
        None => line.to_string(),
    }
}

/// Render file hits as `path:line: preview` lines.
pub fn render_hits(hits: &[RepoFileHit]) -> String {
    hits.iter()
        .map(|h| format!("{}:{}: {}\n", h.path, h.line, h.preview.trim()))
        .collect()
}
