//! Agent tools — read-only repository introspection.
//!
//! Every tool resolves its path through the sandbox resolver, never executes
//! anything, and reports failure structurally (`success: false` + `error`)
//! instead of returning `Err`: a broken tool call costs the agent one empty
//! candidate set, not the round.

use crate::paths::PathResolver;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Maximum bytes read from any single file.
const MAX_FILE_READ: usize = 512 * 1024;
/// Content matches returned per file.
const MAX_MATCHES_PER_FILE: usize = 20;
/// Preview length for matched lines.
const LINE_PREVIEW_CHARS: usize = 200;
/// Directory names the search walk never descends into.
const SEARCH_DENYLIST: &[&str] = &["__pycache__", "node_modules", ".git", "dist", "build", "venv"];

pub const DEFAULT_SEARCH_MAX_RESULTS: usize = 30;
pub const DEFAULT_STRUCTURE_MAX_LINES: usize = 100;
pub const DEFAULT_READ_MAX_CHARS: usize = 50_000;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListDirectoryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub path: String,
    pub contents: Vec<DirEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub line_number: usize,
    pub line_content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSearchHit {
    pub file: String,
    pub match_count: usize,
    pub matches: Vec<SearchMatch>,
    /// "content", "filename", or "both".
    pub match_type: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub search_term: String,
    pub file_pattern: String,
    pub files_searched: usize,
    pub matches_found: usize,
    pub results: Vec<FileSearchHit>,
}

impl SearchResult {
    fn failure(search_term: &str, file_pattern: &str, error: String) -> SearchResult {
        SearchResult {
            success: false,
            error: Some(error),
            search_term: search_term.to_string(),
            file_pattern: file_pattern.to_string(),
            files_searched: 0,
            matches_found: 0,
            results: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StructureSummary {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub path: String,
    pub classes: Vec<String>,
    pub functions: Vec<String>,
    pub imports: Vec<String>,
    pub lines_scanned: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileContentResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub path: String,
    pub content: String,
    pub truncated: bool,
    pub total_chars: usize,
}

/// Search options beyond the required term.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub file_pattern: String,
    pub root_path: String,
    pub max_results: usize,
    pub case_sensitive: bool,
    pub use_regex: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            file_pattern: "*".into(),
            root_path: ".".into(),
            max_results: DEFAULT_SEARCH_MAX_RESULTS,
            case_sensitive: false,
            use_regex: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Regex auto-detection and glob compilation
// ---------------------------------------------------------------------------

/// Heuristic the agent applies before dispatch: a term carrying regex
/// metacharacters is treated as a pattern unless the caller said otherwise.
pub fn looks_like_regex(term: &str) -> bool {
    term.chars()
        .any(|c| matches!(c, '.' | '*' | '+' | '?' | '[' | ']' | '^' | '$' | '|' | '(' | ')' | '{' | '}'))
}

/// Compile a `**`-aware glob into an anchored regex over forward-slashed
/// relative paths. `*` and `?` never cross a `/`; `**` matches anything.
pub fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let normalized = pattern.trim_start_matches("./").replace('\\', "/");
    let mut regex = String::from("^");
    let parts: Vec<&str> = normalized.split("**").collect();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            regex.push_str(".*");
        }
        for c in part.chars() {
            match c {
                '*' => regex.push_str("[^/]*"),
                '?' => regex.push_str("[^/]"),
                c if "\\.[]{}()+-^$|".contains(c) => {
                    regex.push('\\');
                    regex.push(c);
                }
                c => regex.push(c),
            }
        }
    }
    regex.push('$');
    Regex::new(&regex).ok()
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

pub struct AgentTools {
    resolver: PathResolver,
}

impl AgentTools {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        AgentTools { resolver: PathResolver::new(repo_root) }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    // -----------------------------------------------------------------------
    // list_directory
    // -----------------------------------------------------------------------

    pub fn list_directory(&self, path: &str, include_hidden: bool) -> ListDirectoryResult {
        let failure = |error: String| ListDirectoryResult {
            success: false,
            error: Some(error),
            path: path.to_string(),
            contents: Vec::new(),
        };

        if !self.resolver.is_safe(path) {
            return failure("Access denied: path outside repository root".into());
        }
        let Some(full) = self.resolver.resolve(path) else {
            return failure(format!("Path does not exist: {path}"));
        };
        if !full.is_dir() {
            return failure(format!("Path is not a directory: {path}"));
        }

        let mut names: Vec<(String, PathBuf)> = match std::fs::read_dir(&full) {
            Ok(entries) => entries
                .flatten()
                .map(|e| (e.file_name().to_string_lossy().to_string(), e.path()))
                .collect(),
            Err(e) => return failure(format!("Cannot read directory: {e}")),
        };
        names.sort_by(|a, b| a.0.cmp(&b.0));

        let mut contents = Vec::new();
        for (name, entry_path) in names {
            if !include_hidden && name.starts_with('.') {
                continue;
            }
            let is_dir = entry_path.is_dir();
            let rel = self
                .resolver
                .relative_to_root(&entry_path)
                .unwrap_or_else(|| name.clone());
            contents.push(DirEntry {
                name,
                path: rel,
                entry_type: if is_dir { "directory" } else { "file" },
                size: if is_dir {
                    None
                } else {
                    entry_path.metadata().map(|m| m.len()).ok()
                },
            });
        }

        ListDirectoryResult { success: true, error: None, path: path.to_string(), contents }
    }

    // -----------------------------------------------------------------------
    // search_codebase
    // -----------------------------------------------------------------------

    pub fn search_codebase(&self, search_term: &str, options: &SearchOptions) -> SearchResult {
        if search_term.is_empty() {
            return SearchResult::failure(search_term, &options.file_pattern, "Empty search term".into());
        }
        if !self.resolver.is_safe(&options.root_path) {
            return SearchResult::failure(
                search_term,
                &options.file_pattern,
                "Access denied: path outside repository root".into(),
            );
        }
        let Some(search_root) = self.resolver.resolve(&options.root_path) else {
            return SearchResult::failure(
                search_term,
                &options.file_pattern,
                format!("Path does not exist: {}", options.root_path),
            );
        };

        let pattern_str = if options.use_regex {
            search_term.to_string()
        } else if search_term.contains('|') {
            // Pipe in literal mode means OR over escaped alternatives
            search_term
                .split('|')
                .map(|t| regex::escape(t.trim()))
                .collect::<Vec<_>>()
                .join("|")
        } else {
            regex::escape(search_term)
        };
        let content_pattern = match RegexBuilder::new(&pattern_str)
            .case_insensitive(!options.case_sensitive)
            .build()
        {
            Ok(re) => re,
            Err(e) => {
                return SearchResult::failure(
                    search_term,
                    &options.file_pattern,
                    format!("Invalid regex: {e}"),
                )
            }
        };

        let file_matcher = if options.file_pattern != "*" {
            glob_to_regex(&options.file_pattern)
        } else {
            None
        };

        let mut hits: Vec<FileSearchHit> = Vec::new();
        let mut files_searched = 0usize;
        self.walk_search(
            &search_root,
            &search_root,
            &content_pattern,
            search_term,
            &options.file_pattern,
            file_matcher.as_ref(),
            options,
            &mut files_searched,
            &mut hits,
        );

        // Auto-retry once: "dir/*.py" that matched nothing becomes
        // "dir/**/*.py" so a one-level-deep guess still lands.
        if hits.is_empty()
            && options.file_pattern != "*"
            && !options.file_pattern.contains("**")
            && options.file_pattern.contains('/')
            && options.file_pattern.contains('*')
        {
            if let Some((dir_part, file_part)) = options.file_pattern.rsplit_once('/') {
                let recursive = format!("{dir_part}/**/{file_part}");
                tracing::debug!(
                    "no results for pattern '{}', retrying as '{recursive}'",
                    options.file_pattern
                );
                let retry_options = SearchOptions { file_pattern: recursive, ..options.clone() };
                return self.search_codebase(search_term, &retry_options);
            }
        }

        SearchResult {
            success: true,
            error: None,
            search_term: search_term.to_string(),
            file_pattern: options.file_pattern.clone(),
            files_searched,
            matches_found: hits.len(),
            results: hits,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_search(
        &self,
        search_root: &Path,
        dir: &Path,
        content_pattern: &Regex,
        search_term: &str,
        file_pattern: &str,
        file_matcher: Option<&Regex>,
        options: &SearchOptions,
        files_searched: &mut usize,
        hits: &mut Vec<FileSearchHit>,
    ) {
        if hits.len() >= options.max_results {
            return;
        }
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        let mut sorted: Vec<(String, PathBuf)> = entries
            .flatten()
            .map(|e| (e.file_name().to_string_lossy().to_string(), e.path()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        // Files first so a directory's own matches precede its children's
        for (name, path) in &sorted {
            if hits.len() >= options.max_results {
                return;
            }
            if name.starts_with('.') || !path.is_file() {
                continue;
            }
            let rel_to_search = path
                .strip_prefix(search_root)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_else(|_| name.clone());

            // Path matching happens relative to root_path; display paths are
            // relative to the repo root.
            let matched = if file_pattern == "*" {
                true
            } else if let Some(matcher) = file_matcher {
                matcher.is_match(&rel_to_search) || matcher.is_match(name)
            } else {
                // Glob failed to compile: plain filename comparison
                name == file_pattern
            };
            if !matched {
                continue;
            }
            *files_searched += 1;

            let filename_match = if options.use_regex {
                content_pattern.is_match(name) || content_pattern.is_match(&rel_to_search)
            } else if options.case_sensitive {
                name.contains(search_term) || rel_to_search.contains(search_term)
            } else {
                let lower = search_term.to_lowercase();
                name.to_lowercase().contains(&lower)
                    || rel_to_search.to_lowercase().contains(&lower)
            };

            let display = self
                .resolver
                .relative_to_root(path)
                .unwrap_or_else(|| rel_to_search.clone());

            let mut matches = Vec::new();
            if let Some(content) = read_capped(path) {
                for (i, line) in content.lines().enumerate() {
                    if content_pattern.is_match(line) {
                        matches.push(SearchMatch {
                            line_number: i + 1,
                            line_content: preview(line),
                        });
                        if matches.len() >= MAX_MATCHES_PER_FILE {
                            break;
                        }
                    }
                }
            }

            if !matches.is_empty() || filename_match {
                let match_type = match (!matches.is_empty(), filename_match) {
                    (true, true) => "both",
                    (true, false) => "content",
                    _ => "filename",
                };
                hits.push(FileSearchHit {
                    file: display,
                    match_count: matches.len(),
                    matches,
                    match_type,
                });
            }
        }

        for (name, path) in &sorted {
            if hits.len() >= options.max_results {
                return;
            }
            if name.starts_with('.') || !path.is_dir() {
                continue;
            }
            if SEARCH_DENYLIST.contains(&name.as_str()) {
                continue;
            }
            self.walk_search(
                search_root,
                path,
                content_pattern,
                search_term,
                file_pattern,
                file_matcher,
                options,
                files_searched,
                hits,
            );
        }
    }

    // -----------------------------------------------------------------------
    // get_file_structure_summary
    // -----------------------------------------------------------------------

    pub fn get_file_structure_summary(&self, path: &str, max_lines: usize) -> StructureSummary {
        let failure = |error: String| StructureSummary {
            success: false,
            error: Some(error),
            path: path.to_string(),
            classes: Vec::new(),
            functions: Vec::new(),
            imports: Vec::new(),
            lines_scanned: 0,
        };

        if !self.resolver.is_safe(path) {
            return failure("Access denied: path outside repository root".into());
        }
        let Some(full) = self.resolver.resolve(path) else {
            return failure(format!("File does not exist: {path}"));
        };
        let Some(content) = read_capped(&full) else {
            return failure(format!("Cannot read file: {path}"));
        };

        let mut classes = Vec::new();
        let mut functions = Vec::new();
        let mut imports = Vec::new();
        let mut scanned = 0usize;

        for line in content.lines().take(max_lines) {
            scanned += 1;
            let t = line.trim_start();

            if let Some(rest) = t.strip_prefix("class ") {
                push_ident(&mut classes, rest);
            } else if let Some(rest) = t
                .strip_prefix("def ")
                .or_else(|| t.strip_prefix("async def "))
                .or_else(|| t.strip_prefix("function "))
                .or_else(|| t.strip_prefix("async function "))
                .or_else(|| t.strip_prefix("fn "))
                .or_else(|| t.strip_prefix("pub fn "))
                .or_else(|| t.strip_prefix("func "))
            {
                push_ident(&mut functions, rest);
            } else if t.starts_with("import ")
                || t.starts_with("from ")
                || t.starts_with("use ")
                || t.starts_with("#include")
            {
                imports.push(t.chars().take(120).collect());
            }
        }

        StructureSummary {
            success: true,
            error: None,
            path: path.to_string(),
            classes,
            functions,
            imports,
            lines_scanned: scanned,
        }
    }

    // -----------------------------------------------------------------------
    // read_file_content
    // -----------------------------------------------------------------------

    pub fn read_file_content(&self, path: &str, max_chars: usize) -> FileContentResult {
        let failure = |error: String| FileContentResult {
            success: false,
            error: Some(error),
            path: path.to_string(),
            content: String::new(),
            truncated: false,
            total_chars: 0,
        };

        if !self.resolver.is_safe(path) {
            return failure("Access denied: path outside repository root".into());
        }
        let Some(full) = self.resolver.resolve(path) else {
            return failure(format!("File does not exist: {path}"));
        };
        let Some(content) = read_capped(&full) else {
            return failure(format!("Cannot read file: {path}"));
        };

        let total_chars = content.chars().count();
        let truncated = total_chars > max_chars;
        let content = if truncated {
            content.chars().take(max_chars).collect()
        } else {
            content
        };

        FileContentResult {
            success: true,
            error: None,
            path: path.to_string(),
            content,
            truncated,
            total_chars,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_capped(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let slice = if bytes.len() > MAX_FILE_READ { &bytes[..MAX_FILE_READ] } else { &bytes[..] };
    Some(String::from_utf8_lossy(slice).into_owned())
}

fn preview(line: &str) -> String {
    line.trim().chars().take(LINE_PREVIEW_CHARS).collect()
}

fn push_ident(out: &mut Vec<String>, rest: &str) {
    let name: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if !name.is_empty() && !out.contains(&name) {
        out.push(name);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, AgentTools) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/sub")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::write(
            root.join("src/parser.py"),
            "import os\n\nclass HeaderParser:\n    def decode_header(self, data):\n        return data\n",
        )
        .unwrap();
        std::fs::write(root.join("src/sub/util.py"), "def decode_header(x):\n    return x\n")
            .unwrap();
        std::fs::write(root.join("node_modules/pkg/x.py"), "def decode_header(x):\n    pass\n")
            .unwrap();
        std::fs::write(root.join(".hidden.py"), "def decode_header(x):\n    pass\n").unwrap();
        let tools = AgentTools::new(root);
        (dir, tools)
    }

    #[test]
    fn test_list_directory_ordered_and_sandboxed() {
        let (_dir, tools) = fixture();
        let result = tools.list_directory("src", false);
        assert!(result.success);
        let names: Vec<&str> = result.contents.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["parser.py", "sub"]);
        assert_eq!(result.contents[0].entry_type, "file");
        assert!(result.contents[0].size.unwrap() > 0);

        let denied = tools.list_directory("../..", false);
        assert!(!denied.success);
        assert!(denied.error.unwrap().contains("Access denied"));
    }

    #[test]
    fn test_search_literal_and_denylist() {
        let (_dir, tools) = fixture();
        let result = tools.search_codebase("decode_header", &SearchOptions::default());
        assert!(result.success);
        let files: Vec<&str> = result.results.iter().map(|r| r.file.as_str()).collect();
        assert!(files.contains(&"src/parser.py"));
        assert!(files.contains(&"src/sub/util.py"));
        // Hidden files and denylisted dirs are invisible
        assert!(!files.iter().any(|f| f.contains("node_modules")));
        assert!(!files.iter().any(|f| f.contains(".hidden")));
        assert!(result.results[0].matches[0].line_number >= 1);
    }

    #[test]
    fn test_pipe_means_or_in_literal_mode() {
        let (_dir, tools) = fixture();
        let result = tools.search_codebase("HeaderParser|util", &SearchOptions::default());
        assert!(result.success);
        assert!(result.results.len() >= 2);
    }

    #[test]
    fn test_glob_patterns() {
        let (_dir, tools) = fixture();
        let opts = SearchOptions { file_pattern: "**/*.py".into(), ..Default::default() };
        let result = tools.search_codebase("decode_header", &opts);
        assert!(result.matches_found >= 2);

        // `*` must not cross slashes
        let re = glob_to_regex("src/*.py").unwrap();
        assert!(re.is_match("src/parser.py"));
        assert!(!re.is_match("src/sub/util.py"));
    }

    #[test]
    fn test_auto_retry_recursive_pattern() {
        let (_dir, tools) = fixture();
        // "src/*.py" misses src/sub/util.py; the auto-retry upgrades the
        // pattern to "src/**/*.py" and finds it.
        let opts = SearchOptions { file_pattern: "src/*.py".into(), ..Default::default() };
        let result = tools.search_codebase("return x", &opts);
        assert!(result.success);
        assert_eq!(result.file_pattern, "src/**/*.py");
        assert!(result.results.iter().any(|r| r.file == "src/sub/util.py"));
    }

    #[test]
    fn test_regex_mode_and_detection() {
        let (_dir, tools) = fixture();
        assert!(looks_like_regex(r"def \w+_header"));
        assert!(!looks_like_regex("decode_header"));

        let opts = SearchOptions { use_regex: true, ..Default::default() };
        let result = tools.search_codebase(r"def\s+decode_\w+", &opts);
        assert!(result.success);
        assert!(result.matches_found >= 2);

        let bad = tools.search_codebase(r"def (unclosed", &opts);
        assert!(!bad.success);
        assert!(bad.error.unwrap().contains("Invalid regex"));
    }

    #[test]
    fn test_structure_summary() {
        let (_dir, tools) = fixture();
        let summary = tools.get_file_structure_summary("src/parser.py", 100);
        assert!(summary.success);
        assert_eq!(summary.classes, vec!["HeaderParser"]);
        assert_eq!(summary.functions, vec!["decode_header"]);
        assert_eq!(summary.imports.len(), 1);
    }

    #[test]
    fn test_read_file_content_truncation() {
        let (_dir, tools) = fixture();
        let full = tools.read_file_content("src/parser.py", 50_000);
        assert!(full.success);
        assert!(!full.truncated);

        let cut = tools.read_file_content("src/parser.py", 10);
        assert!(cut.truncated);
        assert_eq!(cut.content.chars().count(), 10);
        assert!(cut.total_chars > 10);

        let missing = tools.read_file_content("src/nope.py", 100);
        assert!(!missing.success);
    }
}
