//! Repository overviews — first-stage repo selection index.
//!
//! One overview per repository: a short summary, a structure tree, an
//! optional README excerpt, and a single embedding over their concatenation.
//! Overviews are stored in their own file and their own BM25 corpus; they
//! never co-mingle with code elements.

use crate::embed::Embedder;
use crate::error::Result;
use crate::lexical::Bm25Index;
use crate::scan::{directory_file_counts, directory_tree, ScannedFile};
use crate::types::{CodeElement, ElementType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const SUMMARY_MAX_CHARS: usize = 1024;
const README_MAX_CHARS: usize = 2048;
const OVERVIEWS_FILE: &str = "overviews.json";

// ---------------------------------------------------------------------------
// Overview record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoOverview {
    pub repo_name: String,
    pub summary: String,
    pub structure_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,
    pub file_count: usize,
}

impl RepoOverview {
    /// The text the single overview embedding is computed over.
    pub fn embedding_text(&self) -> String {
        let mut text = format!("{}\n{}\n{}", self.repo_name, self.summary, self.structure_text);
        if let Some(readme) = &self.readme {
            text.push('\n');
            text.push_str(readme);
        }
        text
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Build the overview for a scanned repository.
pub fn build_overview(repo_name: &str, root: &Path, files: &[ScannedFile]) -> RepoOverview {
    // Language distribution for the summary line
    let mut lang_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for f in files {
        *lang_counts.entry(f.language.as_str()).or_insert(0) += 1;
    }
    let mut langs: Vec<(&str, usize)> = lang_counts.into_iter().collect();
    langs.sort_by(|a, b| b.1.cmp(&a.1));
    let lang_list: Vec<String> =
        langs.iter().take(4).map(|(l, c)| format!("{l} ({c})")).collect();

    let dir_counts = directory_file_counts(files);
    let top_dirs: Vec<String> = dir_counts
        .iter()
        .filter(|(d, _)| !d.contains('/'))
        .map(|(d, c)| format!("{d} ({c} files)"))
        .take(6)
        .collect();

    let summary = truncate(
        &format!(
            "Repository '{repo_name}' with {} source files. Languages: {}. Top-level areas: {}.",
            files.len(),
            lang_list.join(", "),
            top_dirs.join(", "),
        ),
        SUMMARY_MAX_CHARS,
    );

    let structure_text = format!(
        "{}\n({} files total)",
        directory_tree(root, 3).trim_end(),
        files.len()
    );

    let readme = ["README.md", "README.rst", "README.txt", "README"]
        .iter()
        .find_map(|name| std::fs::read_to_string(root.join(name)).ok())
        .map(|content| truncate(&content, README_MAX_CHARS));

    RepoOverview {
        repo_name: repo_name.to_string(),
        summary,
        structure_text,
        readme,
        file_count: files.len(),
    }
}

// ---------------------------------------------------------------------------
// Overview index
// ---------------------------------------------------------------------------

/// A repo-selection hit with its score breakdown; the retriever applies the
/// keep thresholds on the individual components.
#[derive(Debug, Clone)]
pub struct OverviewHit {
    pub repo_name: String,
    pub summary: String,
    pub blended: f64,
    pub semantic: f64,
    /// BM25 normalized by the round's max score, in [0, 1].
    pub lexical_norm: f64,
}

#[derive(Serialize, Deserialize, Clone)]
struct StoredOverview {
    overview: RepoOverview,
    embedding: Vec<f32>,
}

/// Dense + lexical index over repository overviews.
#[derive(Default)]
pub struct OverviewIndex {
    entries: Vec<StoredOverview>,
    bm25: Bm25Index,
}

const SEMANTIC_BLEND: f64 = 0.7;
const LEXICAL_BLEND: f64 = 0.3;

impl OverviewIndex {
    pub fn new() -> Self {
        OverviewIndex::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn repo_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.overview.repo_name.clone()).collect()
    }

    pub fn get(&self, repo_name: &str) -> Option<&RepoOverview> {
        self.entries
            .iter()
            .find(|e| e.overview.repo_name == repo_name)
            .map(|e| &e.overview)
    }

    fn rebuild_bm25(&mut self) {
        self.bm25.clear();
        // The BM25 corpus rows are synthetic overview elements; they stay in
        // this index and are never visible to code retrieval.
        let rows: Vec<CodeElement> = self
            .entries
            .iter()
            .map(|e| CodeElement {
                id: CodeElement::make_id(
                    &e.overview.repo_name,
                    "",
                    ElementType::RepositoryOverview,
                    &e.overview.repo_name,
                    1,
                ),
                element_type: ElementType::RepositoryOverview,
                repo_name: e.overview.repo_name.clone(),
                relative_path: String::new(),
                language: String::new(),
                name: e.overview.repo_name.clone(),
                signature: None,
                docstring: None,
                summary: Some(e.overview.summary.clone()),
                start_line: 1,
                end_line: 1,
                code: e.overview.embedding_text(),
                metadata: serde_json::Map::new(),
                embedding: None,
            })
            .collect();
        self.bm25.add_elements(&rows);
    }

    /// Insert or replace one repo's overview.
    pub fn upsert(&mut self, overview: RepoOverview, embedding: Vec<f32>) {
        self.entries.retain(|e| e.overview.repo_name != overview.repo_name);
        self.entries.push(StoredOverview { overview, embedding });
        self.entries.sort_by(|a, b| a.overview.repo_name.cmp(&b.overview.repo_name));
        self.rebuild_bm25();
    }

    pub fn delete(&mut self, repo_name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.overview.repo_name != repo_name);
        let removed = self.entries.len() != before;
        if removed {
            self.rebuild_bm25();
        }
        removed
    }

    /// Blended overview search: semantic 0.7 + normalized BM25 0.3, sorted
    /// by blended score descending.
    pub fn search_overviews(
        &self,
        embedder: &dyn Embedder,
        query: &str,
        k: usize,
        min_score: f64,
    ) -> Result<Vec<OverviewHit>> {
        if self.entries.is_empty() {
            return Ok(Vec::new());
        }

        let query_emb = embedder.embed_one(query)?;
        let mut semantic: BTreeMap<String, f64> = BTreeMap::new();
        for e in &self.entries {
            let dot: f32 = query_emb
                .iter()
                .zip(e.embedding.iter())
                .map(|(a, b)| a * b)
                .sum();
            semantic.insert(e.overview.repo_name.clone(), dot as f64);
        }

        let lexical_hits = self.bm25.search(query, self.entries.len(), None, None);
        let max_bm25 = lexical_hits.iter().map(|(_, s)| *s).fold(0.0f64, f64::max);
        let mut lexical: BTreeMap<String, f64> = BTreeMap::new();
        for (row, score) in &lexical_hits {
            let norm = if max_bm25 > 0.0 { score / max_bm25 } else { 0.0 };
            lexical.insert(row.repo_name.clone(), norm);
        }

        let mut hits: Vec<OverviewHit> = self
            .entries
            .iter()
            .map(|e| {
                let name = &e.overview.repo_name;
                let sem = semantic.get(name).copied().unwrap_or(0.0);
                let lex = lexical.get(name).copied().unwrap_or(0.0);
                OverviewHit {
                    repo_name: name.clone(),
                    summary: e.overview.summary.clone(),
                    blended: SEMANTIC_BLEND * sem + LEXICAL_BLEND * lex,
                    semantic: sem,
                    lexical_norm: lex,
                }
            })
            .filter(|h| h.blended >= min_score)
            .collect();

        hits.sort_by(|a, b| {
            b.blended
                .partial_cmp(&a.blended)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.repo_name.cmp(&b.repo_name))
        });
        hits.truncate(k);
        Ok(hits)
    }

    // -----------------------------------------------------------------------
    // Persistence (single shared file keyed by repo name)
    // -----------------------------------------------------------------------

    fn overviews_path(dir: &Path) -> PathBuf {
        dir.join(OVERVIEWS_FILE)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let map: BTreeMap<&str, &StoredOverview> = self
            .entries
            .iter()
            .map(|e| (e.overview.repo_name.as_str(), e))
            .collect();
        let path = Self::overviews_path(dir);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&map)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load every stored overview; a missing file is an empty index.
    pub fn load_all(dir: &Path) -> Result<OverviewIndex> {
        let path = Self::overviews_path(dir);
        if !path.exists() {
            return Ok(OverviewIndex::new());
        }
        let bytes = std::fs::read(&path)?;
        let map: BTreeMap<String, StoredOverview> = serde_json::from_slice(&bytes)?;
        let mut index = OverviewIndex::new();
        index.entries = map.into_values().collect();
        index.entries.sort_by(|a, b| a.overview.repo_name.cmp(&b.overview.repo_name));
        index.rebuild_bm25();
        Ok(index)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashingEmbedder;

    fn overview(name: &str, summary: &str) -> RepoOverview {
        RepoOverview {
            repo_name: name.into(),
            summary: summary.into(),
            structure_text: format!("{name}\n  src/\n(3 files total)"),
            readme: None,
            file_count: 3,
        }
    }

    fn index_with(embedder: &HashingEmbedder, entries: &[(&str, &str)]) -> OverviewIndex {
        let mut idx = OverviewIndex::new();
        for (name, summary) in entries {
            let ov = overview(name, summary);
            let emb = embedder.embed_one(&ov.embedding_text()).unwrap();
            idx.upsert(ov, emb);
        }
        idx
    }

    #[test]
    fn test_search_prefers_matching_repo() {
        let embedder = HashingEmbedder::new(256);
        let idx = index_with(
            &embedder,
            &[
                ("httplib", "http client with retry and backoff handling"),
                ("mathlib", "linear algebra routines and matrix kernels"),
            ],
        );
        let hits = idx.search_overviews(&embedder, "how does the http client retry", 2, 0.0).unwrap();
        assert_eq!(hits[0].repo_name, "httplib");
        assert!(hits[0].blended > hits[1].blended);
    }

    #[test]
    fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = HashingEmbedder::new(64);
        let idx = index_with(&embedder, &[("a", "alpha repo"), ("b", "beta repo")]);
        idx.save(dir.path()).unwrap();

        let mut loaded = OverviewIndex::load_all(dir.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.get("a").is_some());

        assert!(loaded.delete("a"));
        assert!(!loaded.delete("a"));
        loaded.save(dir.path()).unwrap();

        let reloaded = OverviewIndex::load_all(dir.path()).unwrap();
        assert_eq!(reloaded.repo_names(), vec!["b".to_string()]);
    }

    #[test]
    fn test_build_overview_shape() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/m.py"), "x = 1\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "# My repo\nDoes things.\n").unwrap();

        let files = crate::scan::scan_repository(dir.path());
        let ov = build_overview("myrepo", dir.path(), &files);
        assert_eq!(ov.repo_name, "myrepo");
        assert!(ov.summary.len() <= 1024);
        assert!(ov.summary.contains("python"));
        assert!(ov.structure_text.contains("src/"));
        assert!(ov.readme.as_deref().unwrap_or("").contains("My repo"));
    }
}
