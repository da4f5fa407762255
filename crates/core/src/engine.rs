//! Orchestration — repository registry, indexing pipeline, public entry.
//!
//! The engine owns the stores and the retriever, resolves query scope, and
//! keeps the public `retrieve` surface non-throwing: failures degrade to
//! empty results with a diagnostic instead of errors.

use crate::agent::{AgentOutcome, CancelToken, IterationMetadata, IterativeAgent, RepoShape};
use crate::cache::QueryCache;
use crate::config::Config;
use crate::embed::{Embedder, HashingEmbedder};
use crate::error::{CoreError, Result};
use crate::extract::extract_elements;
use crate::graph::{CodeGraph, RelationKind};
use crate::lexical::Bm25Index;
use crate::llm::ChatModel;
use crate::overview::{build_overview, OverviewIndex};
use crate::query::{QueryFilters, QueryProcessor};
use crate::retriever::HybridRetriever;
use crate::scan::{compute_repo_stats, scan_repository};
use crate::types::{CodeElement, ElementType, ScoredElement, StoppingReason};
use crate::vector::VectorIndex;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RepoEntry {
    root: PathBuf,
    total_files: usize,
    avg_file_lines: f64,
    max_depth: usize,
}

const REGISTRY_FILE: &str = "repos.json";

fn load_registry(dir: &Path) -> BTreeMap<String, RepoEntry> {
    let path = dir.join(REGISTRY_FILE);
    std::fs::read(&path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

fn save_registry(dir: &Path, registry: &BTreeMap<String, RepoEntry>) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(REGISTRY_FILE);
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec(registry)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Public query surface
// ---------------------------------------------------------------------------

#[derive(Default, Clone)]
pub struct RetrieveOptions {
    pub filters: QueryFilters,
    pub repo_filter: Option<Vec<String>>,
    /// Overrides `retrieval.enable_agency_mode` for this query.
    pub use_agency: Option<bool>,
    pub dialogue_history: Vec<String>,
    pub cancel: Option<CancelToken>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalMetadata {
    pub query_id: String,
    pub mode: &'static str,
    pub repo_scope: Vec<String>,
    pub element_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopping_reason: Option<StoppingReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<IterationMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl RetrievalMetadata {
    fn diagnostic_only(mode: &'static str, diagnostic: String) -> RetrievalMetadata {
        RetrievalMetadata {
            query_id: uuid::Uuid::new_v4().to_string(),
            mode,
            repo_scope: Vec::new(),
            element_count: 0,
            stopping_reason: None,
            iteration: None,
            diagnostic: Some(diagnostic),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    config: Config,
    index_dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    chat: Option<Arc<dyn ChatModel>>,
    retriever: HybridRetriever,
    cache: QueryCache,
    repos: BTreeMap<String, RepoEntry>,
}

impl Engine {
    /// Open an engine over the configured persist directory, loading any
    /// previously indexed repositories.
    pub fn new(config: Config) -> Result<Engine> {
        let embedder: Arc<dyn Embedder> =
            Arc::new(HashingEmbedder::new(config.indexing.embedding_dim));
        Engine::with_embedder(config, embedder)
    }

    pub fn with_embedder(config: Config, embedder: Arc<dyn Embedder>) -> Result<Engine> {
        let index_dir = config.vector_store.persist_directory.clone();
        let repos = load_registry(&index_dir);
        let cache = QueryCache::new(&config.cache, &index_dir);

        let embedder: Arc<dyn Embedder> = if config.cache.enabled && config.cache.cache_embeddings
        {
            let embedding_cache = QueryCache::new(&config.cache, &index_dir);
            if embedding_cache.is_enabled() {
                Arc::new(crate::cache::CachedEmbedder::new(embedder, embedding_cache))
            } else {
                embedder
            }
        } else {
            embedder
        };

        let mut retriever =
            HybridRetriever::new(config.clone(), embedder.clone(), index_dir.clone());
        retriever.set_overviews(OverviewIndex::load_all(&index_dir)?);
        let names: Vec<String> = repos.keys().cloned().collect();
        retriever.load_full_tier(&names);

        Ok(Engine { config, index_dir, embedder, chat: None, retriever, cache, repos })
    }

    pub fn with_chat_model(mut self, chat: Arc<dyn ChatModel>) -> Engine {
        self.chat = Some(chat);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repositories(&self) -> Vec<String> {
        self.repos.keys().cloned().collect()
    }

    pub fn repo_root(&self, name: &str) -> Option<&Path> {
        self.repos.get(name).map(|e| e.root.as_path())
    }

    /// Total indexed elements across all repositories (full-tier scan).
    pub fn indexed_element_count(&self) -> usize {
        self.retriever.full_element_count()
    }

    // -----------------------------------------------------------------------
    // Indexing
    // -----------------------------------------------------------------------

    /// Index (or re-index) one repository: scan, extract, embed, persist the
    /// per-repo artifacts, and register its overview.
    pub fn index_repository(&mut self, name: &str, root: &Path) -> Result<usize> {
        let root = root
            .canonicalize()
            .map_err(|_| CoreError::NotFound(format!("repository root {}", root.display())))?;
        tracing::info!("indexing '{name}' at {}", root.display());

        let files = scan_repository(&root);
        let elements: Vec<CodeElement> = files
            .par_iter()
            .flat_map(|file| {
                let Ok(content) = std::fs::read_to_string(&file.abs_path) else {
                    return Vec::new();
                };
                extract_elements(file, &content, name, &self.config.indexing)
            })
            .collect();
        let mut elements = elements;
        elements.sort_by(|a, b| a.id.cmp(&b.id));

        let class_count =
            elements.iter().filter(|e| e.element_type == ElementType::Class).count();
        let fn_count =
            elements.iter().filter(|e| e.element_type == ElementType::Function).count();
        let stats = compute_repo_stats(&files, class_count, fn_count);
        tracing::info!(
            "'{name}': {} files, {} elements ({class_count} classes, {fn_count} functions)",
            files.len(),
            elements.len()
        );

        // Embed in batches; vectors attach to elements only for the write.
        let texts: Vec<String> = elements.iter().map(embedding_text).collect();
        let vectors = self.embedder.embed(&texts)?;

        let mut vector = VectorIndex::new(self.embedder.dim(), self.config.vector_store.in_memory);
        vector.add(vectors, elements.iter().map(|e| e.index_metadata()).collect())?;
        // In-memory mode makes this a no-op; retrieval then degrades to the
        // lexical signal for this repo.
        vector.save(&self.index_dir, name)?;

        let mut lexical = Bm25Index::new();
        lexical.add_elements(&elements);
        lexical.save(&self.index_dir, name)?;

        let graph = build_repo_graph(&elements);
        graph.save(&self.index_dir, name)?;

        let overview = build_overview(name, &root, &files);
        let overview_embedding = self.embedder.embed_one(&overview.embedding_text())?;
        self.retriever.overviews_mut().upsert(overview, overview_embedding);
        self.retriever.overviews().save(&self.index_dir)?;

        self.repos.insert(
            name.to_string(),
            RepoEntry {
                root,
                total_files: stats.total_files,
                avg_file_lines: stats.avg_file_lines,
                max_depth: stats.max_depth,
            },
        );
        save_registry(&self.index_dir, &self.repos)?;

        let names: Vec<String> = self.repos.keys().cloned().collect();
        self.retriever.load_full_tier(&names);
        self.retriever.invalidate_filtered();
        Ok(elements.len())
    }

    /// Remove a repository: its index files, its overview entry, and its
    /// registry row.
    pub fn remove_repository(&mut self, name: &str) -> Result<bool> {
        let existed = self.repos.remove(name).is_some();
        for suffix in ["vector", "lexical", "graph"] {
            let path = self.index_dir.join(format!("{name}.{suffix}.json"));
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        if self.retriever.overviews_mut().delete(name) {
            self.retriever.overviews().save(&self.index_dir)?;
        }
        save_registry(&self.index_dir, &self.repos)?;

        let names: Vec<String> = self.repos.keys().cloned().collect();
        self.retriever.load_full_tier(&names);
        self.retriever.invalidate_filtered();
        Ok(existed)
    }

    // -----------------------------------------------------------------------
    // Retrieval entry point
    // -----------------------------------------------------------------------

    /// The library entry: never panics, never errors outward. Critical
    /// failures come back as empty results plus a diagnostic.
    pub fn retrieve(
        &mut self,
        question: &str,
        options: &RetrieveOptions,
    ) -> (Vec<ScoredElement>, RetrievalMetadata) {
        if self.repos.is_empty() {
            return (
                Vec::new(),
                RetrievalMetadata::diagnostic_only("standard", "no repositories indexed".into()),
            );
        }

        // Resolve the caller's scope against known repos.
        let known: Vec<String> = self.repos.keys().cloned().collect();
        let scope: Vec<String> = match &options.repo_filter {
            Some(filter) => filter
                .iter()
                .filter_map(|name| crate::retriever::match_repo_name(name, &known))
                .collect(),
            None => known.clone(),
        };
        if scope.is_empty() {
            return (
                Vec::new(),
                RetrievalMetadata::diagnostic_only(
                    "standard",
                    format!("repo_filter {:?} matched no known repository", options.repo_filter),
                ),
            );
        }

        let agency = options
            .use_agency
            .unwrap_or(self.config.retrieval.enable_agency_mode)
            && self.chat.is_some();

        if agency {
            self.retrieve_agency(question, options, scope)
        } else {
            self.retrieve_standard(question, options, scope)
        }
    }

    fn retrieve_standard(
        &mut self,
        question: &str,
        options: &RetrieveOptions,
        scope: Vec<String>,
    ) -> (Vec<ScoredElement>, RetrievalMetadata) {
        let cache_key = format!("{question}|{scope:?}|standard");
        if self.cache.is_enabled() && self.config.cache.cache_queries {
            if let Some(hit) = self.cache.get("query", &cache_key) {
                if let Ok(elements) = serde_json::from_value::<Vec<ScoredElement>>(hit) {
                    tracing::debug!("query cache hit");
                    let metadata = RetrievalMetadata {
                        query_id: uuid::Uuid::new_v4().to_string(),
                        mode: "standard",
                        repo_scope: scope,
                        element_count: elements.len(),
                        stopping_reason: None,
                        iteration: None,
                        diagnostic: None,
                    };
                    return (elements, metadata);
                }
            }
        }

        let chat = self.chat.clone();
        let chat_ref: Option<&dyn ChatModel> = chat.as_deref();
        let processor = QueryProcessor::new(self.config.llm.clone());
        let processed = processor.process(question, chat_ref);

        let result =
            self.retriever.retrieve(&processed, &options.filters, &scope, chat_ref);
        match result {
            Ok(elements) => {
                if self.cache.is_enabled() && self.config.cache.cache_queries {
                    if let Ok(value) = serde_json::to_value(&elements) {
                        self.cache.put("query", &cache_key, value);
                    }
                }
                let metadata = RetrievalMetadata {
                    query_id: uuid::Uuid::new_v4().to_string(),
                    mode: "standard",
                    repo_scope: self.retriever.active_repos().to_vec(),
                    element_count: elements.len(),
                    stopping_reason: None,
                    iteration: None,
                    diagnostic: None,
                };
                (elements, metadata)
            }
            Err(e) => {
                tracing::error!("standard retrieval failed: {e}");
                (
                    Vec::new(),
                    RetrievalMetadata::diagnostic_only("standard", format!("retrieval failed: {e}")),
                )
            }
        }
    }

    fn retrieve_agency(
        &mut self,
        question: &str,
        options: &RetrieveOptions,
        scope: Vec<String>,
    ) -> (Vec<ScoredElement>, RetrievalMetadata) {
        let chat = self.chat.clone().expect("agency mode requires a chat model");
        let roots: BTreeMap<String, PathBuf> = scope
            .iter()
            .filter_map(|name| self.repos.get(name).map(|e| (name.clone(), e.root.clone())))
            .collect();
        let shape = self.aggregate_shape(&scope);
        let cancel = options.cancel.clone().unwrap_or_default();

        let mut agent = IterativeAgent::new(
            &self.config,
            &mut self.retriever,
            chat.as_ref(),
            roots,
            shape,
            cancel,
        );
        match agent.run(question, &options.dialogue_history, &scope) {
            Ok(AgentOutcome { elements, metadata }) => {
                let meta = RetrievalMetadata {
                    query_id: metadata.query_id.clone(),
                    mode: "agency",
                    repo_scope: scope,
                    element_count: elements.len(),
                    stopping_reason: Some(metadata.stopping_reason),
                    iteration: Some(metadata),
                    diagnostic: None,
                };
                (elements, meta)
            }
            Err(e) => {
                tracing::error!("iterative agent failed: {e}");
                // Best effort: fall back to standard retrieval.
                let (elements, mut meta) = self.retrieve_standard(question, options, scope);
                meta.diagnostic = Some(format!("agent failed, standard fallback used: {e}"));
                (elements, meta)
            }
        }
    }

    fn aggregate_shape(&self, scope: &[String]) -> RepoShape {
        let entries: Vec<&RepoEntry> =
            scope.iter().filter_map(|name| self.repos.get(name)).collect();
        if entries.is_empty() {
            return RepoShape::default();
        }
        let total_files: usize = entries.iter().map(|e| e.total_files).sum();
        let avg_file_lines =
            entries.iter().map(|e| e.avg_file_lines).sum::<f64>() / entries.len() as f64;
        let max_depth = entries.iter().map(|e| e.max_depth).max().unwrap_or(0);
        RepoShape { total_files, avg_file_lines, max_depth }
    }
}

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// The text an element's embedding is computed over.
fn embedding_text(e: &CodeElement) -> String {
    let code_head: String = e.code.chars().take(800).collect();
    format!(
        "{} {} {} {} {}",
        e.name,
        e.signature.as_deref().unwrap_or(""),
        e.docstring.as_deref().unwrap_or(""),
        e.relative_path,
        code_head
    )
}

/// Build the per-repo relation graph from indexed elements. Edges only join
/// known element ids: when symbol resolution fails, the edge is dropped and
/// the graph stays sparse.
pub fn build_repo_graph(elements: &[CodeElement]) -> CodeGraph {
    let mut graph = CodeGraph::new();

    // Lookup tables: file path -> file element, name -> defining elements.
    let mut file_ids: BTreeMap<&str, &str> = BTreeMap::new();
    let mut by_name: BTreeMap<&str, Vec<&CodeElement>> = BTreeMap::new();
    for e in elements {
        match e.element_type {
            ElementType::File => {
                file_ids.insert(e.relative_path.as_str(), e.id.as_str());
            }
            _ => by_name.entry(e.name.as_str()).or_default().push(e),
        }
    }

    let call_re = Regex::new(r"([A-Za-z_][A-Za-z0-9_]*)\s*\(").unwrap();

    for e in elements {
        match e.element_type {
            ElementType::Class | ElementType::Function => {
                // contains: owning file -> element, class -> method
                if let Some(file_id) = file_ids.get(e.relative_path.as_str()) {
                    let is_method = e
                        .metadata
                        .get("is_method")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    if is_method {
                        let class_name = e
                            .metadata
                            .get("class_name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        if let Some(class_elem) = by_name.get(class_name).and_then(|candidates| {
                            candidates.iter().find(|c| {
                                c.element_type == ElementType::Class
                                    && c.relative_path == e.relative_path
                            })
                        }) {
                            graph.add_edge(
                                class_elem.id.clone(),
                                e.id.clone(),
                                RelationKind::Contains,
                            );
                        }
                    } else {
                        graph.add_edge(
                            file_id.to_string(),
                            e.id.clone(),
                            RelationKind::Contains,
                        );
                    }
                }

                // inherits: class -> resolved base classes
                if e.element_type == ElementType::Class {
                    if let Some(bases) = e.metadata.get("bases").and_then(|v| v.as_array()) {
                        for base in bases.iter().filter_map(|b| b.as_str()) {
                            if let Some(base_elem) = by_name.get(base).and_then(|candidates| {
                                candidates.iter().find(|c| c.element_type == ElementType::Class)
                            }) {
                                graph.add_edge(
                                    e.id.clone(),
                                    base_elem.id.clone(),
                                    RelationKind::Inherits,
                                );
                            }
                        }
                    }
                }

                // calls: identifiers followed by '(' resolved to functions
                if e.element_type == ElementType::Function {
                    let mut seen: Vec<&str> = Vec::new();
                    for cap in call_re.captures_iter(&e.code) {
                        let callee = cap.get(1).map(|m| m.as_str()).unwrap_or("");
                        if callee == e.name || seen.contains(&callee) {
                            continue;
                        }
                        seen.push(callee);
                        if let Some(target) = by_name.get(callee).and_then(|candidates| {
                            candidates
                                .iter()
                                .find(|c| c.element_type == ElementType::Function && c.id != e.id)
                        }) {
                            graph.add_edge(e.id.clone(), target.id.clone(), RelationKind::Calls);
                        }
                    }
                }
            }
            ElementType::File => {
                // imports: file -> file whose stem appears in an import line
                for line in e.code.lines().take(100) {
                    let t = line.trim();
                    if !(t.starts_with("import ")
                        || t.starts_with("from ")
                        || t.starts_with("use ")
                        || t.starts_with("#include"))
                    {
                        continue;
                    }
                    for (path, file_id) in &file_ids {
                        if *path == e.relative_path {
                            continue;
                        }
                        let stem = path
                            .rsplit('/')
                            .next()
                            .and_then(|f| f.rsplit_once('.'))
                            .map(|(s, _)| s)
                            .unwrap_or("");
                        if stem.len() > 2 && t.contains(stem) {
                            graph.add_edge(
                                e.id.clone(),
                                file_id.to_string(),
                                RelationKind::Imports,
                            );
                        }
                    }
                }
            }
            ElementType::RepositoryOverview => {}
        }
    }

    graph
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn write_fixture(root: &Path) {
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(
            root.join("src/cache.py"),
            "class Cache(Base):\n    def get(self, key):\n        return decode_header(key)\n",
        )
        .unwrap();
        std::fs::write(
            root.join("src/codec.py"),
            "def decode_header(data):\n    return data\n",
        )
        .unwrap();
    }

    fn engine_with(dir: &Path) -> Engine {
        let mut config = Config::default();
        config.vector_store.persist_directory = dir.join("index");
        config.retrieval.enable_agency_mode = false;
        Engine::new(config).unwrap()
    }

    #[test]
    fn test_index_retrieve_remove_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("myrepo");
        write_fixture(&repo);

        let mut engine = engine_with(tmp.path());
        let count = engine.index_repository("myrepo", &repo).unwrap();
        assert!(count >= 4, "file + class + functions, got {count}");
        assert_eq!(engine.repositories(), vec!["myrepo".to_string()]);

        let (elements, metadata) =
            engine.retrieve("where is decode_header defined", &RetrieveOptions::default());
        assert!(!elements.is_empty());
        assert_eq!(metadata.mode, "standard");
        assert!(metadata.diagnostic.is_none());
        for e in &elements {
            assert_eq!(e.element.repo_name, "myrepo");
            assert!(e.element.start_line <= e.element.end_line);
            let total = e.total_score();
            let sum = e.scores.semantic + e.scores.pseudocode + e.scores.keyword + e.scores.graph;
            assert!((total - sum).abs() < 1e-9);
        }

        assert!(engine.remove_repository("myrepo").unwrap());
        let (elements, metadata) = engine.retrieve("anything", &RetrieveOptions::default());
        assert!(elements.is_empty());
        assert!(metadata.diagnostic.unwrap().contains("no repositories"));
    }

    #[test]
    fn test_unknown_repo_filter_diagnostic() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("myrepo");
        write_fixture(&repo);
        let mut engine = engine_with(tmp.path());
        engine.index_repository("myrepo", &repo).unwrap();

        let options = RetrieveOptions {
            repo_filter: Some(vec!["completely-unrelated-zzz".into()]),
            ..Default::default()
        };
        let (elements, metadata) = engine.retrieve("decode_header", &options);
        assert!(elements.is_empty());
        assert!(metadata.diagnostic.unwrap().contains("matched no known repository"));
    }

    #[test]
    fn test_reindex_reproduces_ids_and_graph() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("myrepo");
        write_fixture(&repo);

        let mut engine = engine_with(tmp.path());
        engine.index_repository("myrepo", &repo).unwrap();
        let (first, _) =
            engine.retrieve("where is decode_header defined", &RetrieveOptions::default());
        let first_ids: Vec<String> = first.iter().map(|e| e.element.id.clone()).collect();

        engine.remove_repository("myrepo").unwrap();
        engine.index_repository("myrepo", &repo).unwrap();
        let (second, _) =
            engine.retrieve("where is decode_header defined", &RetrieveOptions::default());
        let second_ids: Vec<String> = second.iter().map(|e| e.element.id.clone()).collect();

        assert_eq!(first_ids, second_ids);
    }

    #[test]
    fn test_build_repo_graph_relations() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("myrepo");
        write_fixture(&repo);
        let files = scan_repository(&repo);
        let cfg = crate::config::IndexingConfig::default();
        let mut elements = Vec::new();
        for f in &files {
            let content = std::fs::read_to_string(&f.abs_path).unwrap();
            elements.extend(extract_elements(f, &content, "myrepo", &cfg));
        }

        let graph = build_repo_graph(&elements);
        assert!(graph.edge_count() > 0);

        // Cache.get calls decode_header across files
        let get_id = elements.iter().find(|e| e.name == "get").unwrap().id.clone();
        let decode_id =
            elements.iter().find(|e| e.name == "decode_header").unwrap().id.clone();
        let neighbors = graph.neighbors(&get_id, 1);
        assert!(neighbors.contains(&decode_id));
    }
}
