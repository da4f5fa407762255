//! Lexical index — BM25 over element text, doubling as the element store.
//!
//! Two instances coexist at query time: the full corpus (all loaded repos,
//! used only for repository selection and admin lookups) and the filtered
//! corpus (the active repo subset, used for retrieval). Corpus ordering is
//! stable across save/load so ranking ties resolve identically.

use crate::error::{CoreError, Result};
use crate::types::{CodeElement, ElementType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const BM25_K1: f64 = 1.5;
const BM25_B: f64 = 0.75;

/// Lowercased whitespace tokenization with punctuation trimmed from token
/// edges; interior symbols (`_`, `.`) survive so code identifiers stay whole.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|t| {
            t.trim_matches(|c: char| !c.is_alphanumeric() && c != '_')
                .to_lowercase()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

/// The text surface BM25 indexes for one element.
fn element_text(e: &CodeElement) -> String {
    let code_head: String = e.code.chars().take(1024).collect();
    let mut parts: Vec<&str> = vec![
        &e.name,
        e.element_type.as_str(),
        &e.language,
        &e.relative_path,
    ];
    if let Some(d) = &e.docstring {
        parts.push(d);
    }
    if let Some(s) = &e.signature {
        parts.push(s);
    }
    if let Some(s) = &e.summary {
        parts.push(s);
    }
    let mut text = parts.join(" ");
    text.push(' ');
    text.push_str(&code_head);
    text
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone)]
struct Doc {
    tokens: Vec<String>,
    element: CodeElement,
}

#[derive(Default)]
pub struct Bm25Index {
    docs: Vec<Doc>,
    doc_freq: HashMap<String, usize>,
    total_tokens: usize,
}

#[derive(Serialize, Deserialize)]
struct PersistedCorpus {
    docs: Vec<Doc>,
}

impl Bm25Index {
    pub fn new() -> Self {
        Bm25Index::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn clear(&mut self) {
        self.docs.clear();
        self.doc_freq.clear();
        self.total_tokens = 0;
    }

    /// Append elements in the order given; ordering is part of the corpus
    /// identity and survives persistence.
    pub fn add_elements(&mut self, elements: &[CodeElement]) {
        for e in elements {
            let tokens = tokenize(&element_text(e));
            self.index_doc(Doc { tokens, element: e.clone() });
        }
    }

    fn index_doc(&mut self, doc: Doc) {
        let mut seen: Vec<&str> = Vec::new();
        for t in &doc.tokens {
            if !seen.contains(&t.as_str()) {
                seen.push(t);
                *self.doc_freq.entry(t.clone()).or_insert(0) += 1;
            }
        }
        self.total_tokens += doc.tokens.len();
        self.docs.push(doc);
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.docs.len() as f64;
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f64;
        (((n - df + 0.5) / (df + 0.5)) + 1.0).ln()
    }

    /// BM25 search. `repo_filter` is enforced here even on the filtered
    /// corpus as the safety net the retrieval contract requires.
    pub fn search(
        &self,
        query: &str,
        top_k: usize,
        repo_filter: Option<&[String]>,
        type_filter: Option<ElementType>,
    ) -> Vec<(CodeElement, f64)> {
        if self.docs.is_empty() || top_k == 0 {
            return Vec::new();
        }
        let terms = tokenize(query);
        if terms.is_empty() {
            return Vec::new();
        }
        let avg_len = self.total_tokens as f64 / self.docs.len() as f64;

        let mut scored: Vec<(usize, f64)> = Vec::new();
        for (i, doc) in self.docs.iter().enumerate() {
            if let Some(repos) = repo_filter {
                if !repos.iter().any(|r| *r == doc.element.repo_name) {
                    continue;
                }
            }
            if let Some(t) = type_filter {
                if doc.element.element_type != t {
                    continue;
                }
            }
            let mut score = 0.0f64;
            let doc_len = doc.tokens.len() as f64;
            for term in &terms {
                let tf = doc.tokens.iter().filter(|t| *t == term).count() as f64;
                if tf == 0.0 {
                    continue;
                }
                let idf = self.idf(term);
                let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * doc_len / avg_len.max(1.0));
                score += idf * tf * (BM25_K1 + 1.0) / denom;
            }
            if score > 0.0 {
                scored.push((i, score));
            }
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(top_k);
        scored
            .into_iter()
            .map(|(i, s)| (self.docs[i].element.clone(), s))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Element lookups (the agent resolves selections through these)
    // -----------------------------------------------------------------------

    pub fn get_by_id(&self, id: &str) -> Option<&CodeElement> {
        self.docs.iter().map(|d| &d.element).find(|e| e.id == id)
    }

    /// All elements of one file, file element first then by start line.
    pub fn elements_for_file(&self, repo_name: &str, relative_path: &str) -> Vec<&CodeElement> {
        let mut out: Vec<&CodeElement> = self
            .docs
            .iter()
            .map(|d| &d.element)
            .filter(|e| e.repo_name == repo_name && e.relative_path == relative_path)
            .collect();
        out.sort_by_key(|e| (std::cmp::Reverse(e.element_type.cover_priority()), e.start_line));
        out
    }

    /// Find a named class/function within a file (exact, then
    /// case-insensitive).
    pub fn find_named(
        &self,
        repo_name: &str,
        relative_path: &str,
        name: &str,
    ) -> Option<&CodeElement> {
        let in_file = self.elements_for_file(repo_name, relative_path);
        in_file
            .iter()
            .find(|e| e.element_type != ElementType::File && e.name == name)
            .or_else(|| {
                in_file
                    .iter()
                    .find(|e| e.element_type != ElementType::File && e.name.eq_ignore_ascii_case(name))
            })
            .copied()
    }

    pub fn iter_elements(&self) -> impl Iterator<Item = &CodeElement> {
        self.docs.iter().map(|d| &d.element)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn corpus_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.lexical.json"))
    }

    pub fn save(&self, dir: &Path, name: &str) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let payload = PersistedCorpus { docs: self.docs.clone() };
        let path = Self::corpus_path(dir, name);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&payload)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load(dir: &Path, name: &str) -> Result<Bm25Index> {
        let path = Self::corpus_path(dir, name);
        if !path.exists() {
            return Err(CoreError::IndexMissing(name.to_string()));
        }
        let bytes = std::fs::read(&path)?;
        let payload: PersistedCorpus = serde_json::from_slice(&bytes)?;
        let mut index = Bm25Index::new();
        for doc in payload.docs {
            index.index_doc(doc);
        }
        Ok(index)
    }

    /// Append a persisted per-repo corpus. Missing files merge nothing.
    pub fn merge_from(&mut self, dir: &Path, name: &str) -> Result<usize> {
        match Self::load(dir, name) {
            Ok(other) => {
                let added = other.docs.len();
                for doc in other.docs {
                    self.index_doc(doc);
                }
                Ok(added)
            }
            Err(CoreError::IndexMissing(_)) => {
                tracing::warn!("lexical corpus '{name}' not found in {}", dir.display());
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn element(repo: &str, path: &str, t: ElementType, name: &str, code: &str) -> CodeElement {
        CodeElement {
            id: CodeElement::make_id(repo, path, t, name, 1),
            element_type: t,
            repo_name: repo.into(),
            relative_path: path.into(),
            language: "python".into(),
            name: name.into(),
            signature: None,
            docstring: None,
            summary: None,
            start_line: 1,
            end_line: 10,
            code: code.into(),
            metadata: serde_json::Map::new(),
            embedding: None,
        }
    }

    #[test]
    fn test_tokenize_keeps_identifiers() {
        assert_eq!(tokenize("def decode_header(data):"), vec!["decode_header", "data"]);
        assert_eq!(tokenize("HTTP  Client!"), vec!["http", "client"]);
    }

    #[test]
    fn test_bm25_ranks_matching_doc_first() {
        let mut idx = Bm25Index::new();
        idx.add_elements(&[
            element("r", "src/http.py", ElementType::Function, "retry_request", "def retry_request(): backoff retry"),
            element("r", "src/math.py", ElementType::Function, "multiply", "def multiply(a, b): return a * b"),
        ]);
        let hits = idx.search("retry backoff", 5, None, None);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].0.name, "retry_request");
    }

    #[test]
    fn test_repo_filter_safety_net() {
        let mut idx = Bm25Index::new();
        idx.add_elements(&[
            element("a", "x.py", ElementType::Function, "f", "retry"),
            element("b", "y.py", ElementType::Function, "g", "retry"),
        ]);
        let repos = vec!["b".to_string()];
        let hits = idx.search("retry", 5, Some(&repos), None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.repo_name, "b");
    }

    #[test]
    fn test_save_load_keeps_order_and_scores() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = Bm25Index::new();
        idx.add_elements(&[
            element("r", "a.py", ElementType::File, "", "alpha beta"),
            element("r", "b.py", ElementType::File, "", "alpha gamma"),
            element("r", "c.py", ElementType::File, "", "delta"),
        ]);
        idx.save(dir.path(), "r").unwrap();

        let loaded = Bm25Index::load(dir.path(), "r").unwrap();
        assert_eq!(loaded.len(), 3);

        let before: Vec<String> =
            idx.search("alpha", 5, None, None).into_iter().map(|(e, _)| e.id).collect();
        let after: Vec<String> =
            loaded.search("alpha", 5, None, None).into_iter().map(|(e, _)| e.id).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_find_named_falls_back_case_insensitive() {
        let mut idx = Bm25Index::new();
        idx.add_elements(&[
            element("r", "src/cache.py", ElementType::File, "", "cache module"),
            element("r", "src/cache.py", ElementType::Class, "Cache", "class Cache"),
        ]);
        assert!(idx.find_named("r", "src/cache.py", "Cache").is_some());
        assert!(idx.find_named("r", "src/cache.py", "cache").is_some());
        assert!(idx.find_named("r", "src/cache.py", "Missing").is_none());
    }
}
