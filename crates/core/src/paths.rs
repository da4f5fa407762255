//! Repo-root sandboxed path resolution.
//!
//! Every user- or LLM-supplied path passes through here before touching the
//! filesystem. Resolution is purely lexical (no symlink chasing) so the same
//! answers come back for paths that do not exist yet.

use std::path::{Path, PathBuf};

/// Resolves relative paths against a single repository root and rejects
/// escapes. One instance per repository.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
    /// Final segment of the root directory, used to collapse the common
    /// LLM mistake of prefixing paths with the repo directory name.
    root_name: String,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root_name = root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        PathResolver { root, root_name }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lexically normalize a relative path: forward slashes, no `.` or
    /// empty segments, `..` collapsed. Returns `None` when the path would
    /// climb above its starting point or is absolute.
    pub fn normalize(path: &str) -> Option<String> {
        let cleaned = path.replace('\\', "/");
        if cleaned.starts_with('/') {
            return None;
        }
        let mut segments: Vec<&str> = Vec::new();
        for seg in cleaned.split('/') {
            match seg {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return None;
                    }
                }
                other => segments.push(other),
            }
        }
        Some(segments.join("/"))
    }

    /// True when the path stays inside the repo root after normalization.
    pub fn is_safe(&self, path: &str) -> bool {
        Self::normalize(path).is_some()
    }

    /// Resolve to an absolute path inside the root, or `None` when the path
    /// is unsafe or does not exist. When the root's own directory name also
    /// prefixes `path`, one duplicated level is stripped.
    pub fn resolve(&self, path: &str) -> Option<PathBuf> {
        let rel = Self::normalize(path)?;
        if rel.is_empty() || rel == "." {
            return Some(self.root.clone());
        }

        let direct = self.root.join(&rel);
        if direct.exists() {
            return Some(direct);
        }

        // "myrepo/src/x.py" against a root ending in ".../myrepo"
        if !self.root_name.is_empty() {
            if let Some(stripped) = strip_leading_segment(&rel, &self.root_name) {
                let dedup = self.root.join(stripped);
                if dedup.exists() {
                    return Some(dedup);
                }
            }
        }

        None
    }

    /// Path of `abs` relative to the root, forward-slashed.
    pub fn relative_to_root(&self, abs: &Path) -> Option<String> {
        abs.strip_prefix(&self.root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }
}

// ---------------------------------------------------------------------------
// Repo-aware normalization (free functions: these do not need a root)
// ---------------------------------------------------------------------------

/// Strip `segment/` from the front of `path` when present (case-insensitive).
fn strip_leading_segment<'a>(path: &'a str, segment: &str) -> Option<&'a str> {
    let (first, rest) = match path.split_once('/') {
        Some((f, r)) => (f, r),
        None => (path, ""),
    };
    if first.eq_ignore_ascii_case(segment) {
        Some(rest)
    } else {
        None
    }
}

/// Return the known repo whose name equals the first path segment
/// (case-insensitive), as registered.
pub fn detect_repo_from_path(path: &str, known_repos: &[String]) -> Option<String> {
    let normalized = PathResolver::normalize(path)?;
    let first = normalized.split('/').next()?;
    known_repos
        .iter()
        .find(|r| r.eq_ignore_ascii_case(first))
        .cloned()
}

/// Canonical repo-relative form: forward slashes, a leading `repo_name/`
/// segment stripped when present.
pub fn normalize_with_repo(path: &str, repo_name: &str) -> String {
    let normalized = match PathResolver::normalize(path) {
        Some(n) => n,
        None => return path.replace('\\', "/"),
    };
    match strip_leading_segment(&normalized, repo_name) {
        Some(rest) => rest.to_string(),
        None => normalized,
    }
}

/// Join a repo name and a sub path, collapsing one duplicated repo segment:
/// `("repoA", "repoA/src")` and `("repoA", "src")` both become `repoA/src`.
pub fn resolve_repo_target(repo: &str, sub: &str) -> String {
    let sub = normalize_with_repo(sub, repo);
    if sub.is_empty() || sub == "." {
        repo.to_string()
    } else {
        format!("{repo}/{sub}")
    }
}

/// Normalize a glob pattern against a repo. Returns whether the pattern
/// addressed the repo by name and the pattern re-rooted at the repo root.
pub fn validate_and_normalize_glob(pattern: &str, repo: &str) -> (bool, String) {
    let cleaned = pattern.replace('\\', "/");
    let trimmed = cleaned.trim_start_matches("./");
    match strip_leading_segment(trimmed, repo) {
        Some(rest) if !rest.is_empty() => (true, rest.to_string()),
        Some(_) => (true, "*".to_string()),
        None => (false, trimmed.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
