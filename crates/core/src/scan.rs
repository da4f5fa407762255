//! Repository scanning — discover indexable source files and repo shape.

use crate::extract::language_for_extension;
use ignore::WalkBuilder;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Directory names never descended into, on top of .gitignore handling.
pub const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    "target",
    "dist",
    "build",
    "venv",
    ".venv",
    "vendor",
    ".next",
];

// ---------------------------------------------------------------------------
// Scanned files
// ---------------------------------------------------------------------------

/// A source file discovered during the walk.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub ext: String,
    pub language: String,
}

/// Shape statistics feeding the agent's repo-complexity factor.
#[derive(Debug, Clone, Default)]
pub struct RepoStats {
    pub total_files: usize,
    pub total_classes: usize,
    pub total_functions: usize,
    pub avg_file_lines: f64,
    pub max_depth: usize,
}

/// Check if a file appears to be text by reading the first 8KB and looking
/// for null bytes.
fn is_text_file(path: &Path) -> bool {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let mut buf = [0u8; 8192];
    let n = match file.read(&mut buf) {
        Ok(n) => n,
        Err(_) => return false,
    };
    !buf[..n].contains(&0)
}

fn should_skip_dir(name: &str) -> bool {
    SKIP_DIRS.contains(&name)
}

/// Walk a repository root and return its indexable source files, ordered by
/// relative path so downstream ids come out deterministic.
pub fn scan_repository(root: &Path) -> Vec<ScannedFile> {
    let mut files = Vec::new();

    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
                && should_skip_dir(name.as_ref()))
        })
        .build();

    for entry in walker.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let Some(language) = language_for_extension(&ext) else {
            continue;
        };
        if !is_text_file(path) {
            continue;
        }
        let rel_path = match path.strip_prefix(root) {
            Ok(p) => p.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        files.push(ScannedFile {
            rel_path,
            abs_path: path.to_path_buf(),
            ext,
            language: language.to_string(),
        });
    }

    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    files
}

/// Aggregate shape statistics from scanned files and their line counts.
pub fn compute_repo_stats(
    files: &[ScannedFile],
    total_classes: usize,
    total_functions: usize,
) -> RepoStats {
    let mut total_lines = 0usize;
    let mut max_depth = 0usize;
    for f in files {
        if let Ok(content) = std::fs::read_to_string(&f.abs_path) {
            total_lines += content.lines().count();
        }
        max_depth = max_depth.max(f.rel_path.matches('/').count() + 1);
    }
    let avg_file_lines = if files.is_empty() {
        0.0
    } else {
        total_lines as f64 / files.len() as f64
    };
    RepoStats {
        total_files: files.len(),
        total_classes,
        total_functions,
        avg_file_lines,
        max_depth,
    }
}

// ---------------------------------------------------------------------------
// Directory tree (agent prompt context)
// ---------------------------------------------------------------------------

/// Render a compact directory tree, depth-limited and noise-filtered, for
/// the agent's Round-1 prompt.
pub fn directory_tree(root: &Path, max_depth: usize) -> String {
    let mut out = String::new();
    let label = root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(".");
    out.push_str(label);
    out.push('\n');
    render_dir(root, "", 1, max_depth, &mut out);
    out
}

fn render_dir(dir: &Path, prefix: &str, depth: usize, max_depth: usize, out: &mut String) {
    if depth > max_depth {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    let mut dirs: Vec<String> = Vec::new();
    let mut file_count = 0usize;
    let mut sample_files: Vec<String> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || should_skip_dir(&name) {
            continue;
        }
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(name);
        } else {
            file_count += 1;
            if sample_files.len() < 8 {
                sample_files.push(name);
            }
        }
    }
    dirs.sort();
    sample_files.sort();

    for name in &sample_files {
        out.push_str(&format!("{prefix}  {name}\n"));
    }
    if file_count > sample_files.len() {
        out.push_str(&format!(
            "{prefix}  ... ({} more files)\n",
            file_count - sample_files.len()
        ));
    }
    for name in dirs {
        out.push_str(&format!("{prefix}  {name}/\n"));
        render_dir(&dir.join(&name), &format!("{prefix}  "), depth + 1, max_depth, out);
    }
}

/// Per-directory file counts (used by the overview structure text).
pub fn directory_file_counts(files: &[ScannedFile]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for f in files {
        let dir = match f.rel_path.rsplit_once('/') {
            Some((d, _)) => d.to_string(),
            None => ".".to_string(),
        };
        *counts.entry(dir).or_insert(0usize) += 1;
    }
    counts
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/utils")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/junk")).unwrap();
        std::fs::write(root.join("src/main.py"), "def main():\n    pass\n").unwrap();
        std::fs::write(root.join("src/utils/helpers.py"), "def help_me():\n    pass\n").unwrap();
        std::fs::write(root.join("node_modules/junk/x.js"), "var x = 1;\n").unwrap();
        std::fs::write(root.join("data.bin"), [0u8, 159, 146, 150]).unwrap();
        dir
    }

    #[test]
    fn test_scan_skips_denylist_and_binary() {
        let dir = fixture();
        let files = scan_repository(dir.path());
        let paths: Vec<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["src/main.py", "src/utils/helpers.py"]);
        assert_eq!(files[0].language, "python");
    }

    #[test]
    fn test_repo_stats() {
        let dir = fixture();
        let files = scan_repository(dir.path());
        let stats = compute_repo_stats(&files, 1, 4);
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.max_depth, 3);
        assert!(stats.avg_file_lines > 0.0);
    }

    #[test]
    fn test_directory_tree_depth_limit() {
        let dir = fixture();
        let tree = directory_tree(dir.path(), 5);
        assert!(tree.contains("src/"));
        assert!(tree.contains("main.py"));
        assert!(!tree.contains("node_modules"));

        let shallow = directory_tree(dir.path(), 1);
        assert!(shallow.contains("src/"));
        assert!(!shallow.contains("main.py"));
    }
}
