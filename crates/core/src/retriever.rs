//! Hybrid retrieval — semantic + lexical + pseudocode + graph, composed.
//!
//! Two index tiers live here. The full tier (every loaded repo) only backs
//! repository selection and admin lookups; the filtered tier (the active
//! subset, reloaded from per-repo files whenever scope changes) is the only
//! tier retrieval reads. Mixing them is the classic bug, so every path ends
//! with a final repo-scope safety filter regardless of tier.

use crate::config::{Config, RepoSelectionMethod};
use crate::embed::Embedder;
use crate::error::Result;
use crate::graph::CodeGraph;
use crate::jsonfix::robust_parse;
use crate::lexical::Bm25Index;
use crate::llm::{ChatModel, ChatRequest};
use crate::overview::OverviewIndex;
use crate::paths::normalize_with_repo;
use crate::query::{ProcessedQuery, QueryFilters};
use crate::types::{
    containment_cover, CodeElement, ElementSource, ElementType, ScoreComponents, ScoredElement,
};
use crate::vector::VectorIndex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

const SEMANTIC_TOP_K: usize = 20;
const PSEUDOCODE_TOP_K: usize = 10;
const KEYWORD_TOP_K: usize = 10;
const GRAPH_EXPAND_TOP: usize = 10;
const GRAPH_MAX_HOPS: usize = 2;
const LLM_SELECTED_BOOST: f64 = 1.3;

/// Tie-break priority when totals are equal.
fn rank_priority(t: ElementType) -> u8 {
    match t {
        ElementType::Function => 3,
        ElementType::Class => 2,
        ElementType::File => 1,
        ElementType::RepositoryOverview => 0,
    }
}

/// Deterministic ordering: total descending, then type priority, then id.
pub fn sort_ranked(results: &mut [ScoredElement]) {
    results.sort_by(|a, b| {
        b.total_score()
            .partial_cmp(&a.total_score())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| rank_priority(b.element.element_type).cmp(&rank_priority(a.element.element_type)))
            .then_with(|| a.element.id.cmp(&b.element.id))
    });
}

// ---------------------------------------------------------------------------
// Retriever
// ---------------------------------------------------------------------------

pub struct HybridRetriever {
    config: Config,
    embedder: Arc<dyn Embedder>,
    index_dir: PathBuf,

    // Full tier: repository selection and admin scans only.
    full_lexical: Bm25Index,

    // Filtered tier: the only tier retrieval reads.
    vector: VectorIndex,
    lexical: Bm25Index,
    graph: CodeGraph,
    active_repos: Vec<String>,

    overviews: OverviewIndex,
}

impl HybridRetriever {
    pub fn new(config: Config, embedder: Arc<dyn Embedder>, index_dir: PathBuf) -> Self {
        let dim = embedder.dim();
        HybridRetriever {
            config,
            embedder,
            index_dir,
            full_lexical: Bm25Index::new(),
            vector: VectorIndex::new(dim, true),
            lexical: Bm25Index::new(),
            graph: CodeGraph::new(),
            active_repos: Vec::new(),
            overviews: OverviewIndex::new(),
        }
    }

    pub fn set_overviews(&mut self, overviews: OverviewIndex) {
        self.overviews = overviews;
    }

    pub fn overviews(&self) -> &OverviewIndex {
        &self.overviews
    }

    pub fn overviews_mut(&mut self) -> &mut OverviewIndex {
        &mut self.overviews
    }

    pub fn active_repos(&self) -> &[String] {
        &self.active_repos
    }

    /// Filtered-tier element store (the agent resolves selections here).
    pub fn lexical(&self) -> &Bm25Index {
        &self.lexical
    }

    pub fn graph(&self) -> &CodeGraph {
        &self.graph
    }

    /// Merge every known repo into the full tier. Called at load time.
    pub fn load_full_tier(&mut self, repo_names: &[String]) {
        let mut lexical = Bm25Index::new();
        for repo in repo_names {
            if let Err(e) = lexical.merge_from(&self.index_dir, repo) {
                tracing::warn!("skipping '{repo}' in full tier: {e}");
            }
        }
        self.full_lexical = lexical;
    }

    pub fn full_element_count(&self) -> usize {
        self.full_lexical.len()
    }

    /// Drop the filtered tier so the next query reloads it from disk. Called
    /// after (re)indexing or removal, which would otherwise leave a stale
    /// tier whose repo set still matches the requested scope.
    pub fn invalidate_filtered(&mut self) {
        self.vector.clear();
        self.lexical.clear();
        self.graph.clear();
        self.active_repos.clear();
    }

    /// Reload the filtered tier when the active repo set changes. The swap
    /// is atomic at tier level: new indexes are built completely before any
    /// field is replaced, so a query never observes a half-loaded tier.
    pub fn ensure_filtered(&mut self, repos: &[String]) -> Result<()> {
        let mut wanted: Vec<String> = repos.to_vec();
        wanted.sort();
        wanted.dedup();
        let mut current = self.active_repos.clone();
        current.sort();
        if wanted == current {
            return Ok(());
        }

        tracing::info!("reloading filtered indexes for repos: {wanted:?}");
        let mut vector = VectorIndex::new(self.embedder.dim(), true);
        let mut lexical = Bm25Index::new();
        let mut graph = CodeGraph::new();
        let mut loaded: Vec<String> = Vec::new();

        for repo in &wanted {
            let v = vector.merge_from(&self.index_dir, repo)?;
            let l = lexical.merge_from(&self.index_dir, repo)?;
            let _ = graph.merge_from(&self.index_dir, repo)?;
            if v == 0 && l == 0 {
                tracing::warn!("no index files for '{repo}', omitting from filtered tier");
                continue;
            }
            loaded.push(repo.clone());
        }

        self.vector = vector;
        self.lexical = lexical;
        self.graph = graph;
        self.active_repos = loaded;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Public retrieval (non-agency path)
    // -----------------------------------------------------------------------

    /// Standard hybrid retrieval over the given scope. `scope` must be the
    /// caller-resolved repository list; overview selection may narrow it.
    pub fn retrieve(
        &mut self,
        processed: &ProcessedQuery,
        filters: &QueryFilters,
        scope: &[String],
        chat: Option<&dyn ChatModel>,
    ) -> Result<Vec<ScoredElement>> {
        let mut repo_filter: Vec<String> = scope.to_vec();

        // 1. Repository selection narrows multi-repo scopes.
        if repo_filter.len() > 1
            && self.config.retrieval.select_repos_by_overview
            && self.config.retrieval.enable_two_stage_retrieval
        {
            let narrowed = self.select_repositories(processed.semantic_text(), &repo_filter, chat)?;
            if !narrowed.is_empty() {
                repo_filter = narrowed;
            }
        }

        // 2. Filtered tier must reflect the scope before any search runs.
        self.ensure_filtered(&repo_filter)?;

        let candidates = self.first_stage(processed, &repo_filter)?;

        // 7-8. Type-bias re-rank, then user filters.
        let mut results = rerank_by_type(candidates);
        results = apply_filters(results, filters);

        // 9. Per-file diversity penalty with re-sort.
        results = self.diversify(results);

        // 10. Optional LLM file-selection boost.
        if let Some(model) = chat {
            if self.config.retrieval.enable_two_stage_retrieval {
                results = self.boost_llm_selected_files(
                    &processed.original,
                    results,
                    &repo_filter,
                    model,
                );
            }
        }

        // 11. Final repo-scope safety pass, then cut to size.
        results = final_repo_filter(results, &repo_filter);
        sort_ranked(&mut results);
        results.truncate(self.config.retrieval.max_results);
        Ok(results)
    }

    /// Steps 3-6 plus graph expansion and containment dedup: everything
    /// that produces a scored candidate set. The agent reuses this for its
    /// Round-1 retrieval with its own enhancement applied.
    pub fn first_stage(
        &self,
        processed: &ProcessedQuery,
        repo_filter: &[String],
    ) -> Result<Vec<ScoredElement>> {
        let semantic = self.semantic_search(processed.semantic_text(), SEMANTIC_TOP_K, repo_filter)?;
        let pseudo = match &processed.pseudocode {
            Some(hint) if !hint.is_empty() => {
                self.semantic_search(hint, PSEUDOCODE_TOP_K, repo_filter)?
            }
            _ => Vec::new(),
        };
        let keyword =
            self.lexical
                .search(&processed.keyword_text(), KEYWORD_TOP_K, Some(repo_filter), None);

        let combined = self.combine(semantic, pseudo, keyword);
        let expanded = self.expand_with_graph(combined);
        Ok(containment_cover(expanded))
    }

    /// Semantic search over the filtered tier, resolved to full elements.
    pub fn semantic_search(
        &self,
        text: &str,
        top_k: usize,
        repo_filter: &[String],
    ) -> Result<Vec<(CodeElement, f64)>> {
        if text.trim().is_empty() || self.vector.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.embedder.embed_one(text)?;
        let hits = self.vector.search(
            &query,
            top_k,
            self.config.retrieval.min_similarity as f32,
            Some(repo_filter),
            None,
        );
        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(id) = hit.metadata.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            if let Some(element) = self.lexical.get_by_id(id) {
                out.push((element.clone(), hit.score as f64));
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Score combination
    // -----------------------------------------------------------------------

    fn combine(
        &self,
        semantic: Vec<(CodeElement, f64)>,
        pseudo: Vec<(CodeElement, f64)>,
        keyword: Vec<(CodeElement, f64)>,
    ) -> Vec<ScoredElement> {
        let weights = &self.config.retrieval;
        let mut combined: HashMap<String, ScoredElement> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for (element, score) in semantic {
            let id = element.id.clone();
            let entry = combined.entry(id.clone()).or_insert_with(|| {
                order.push(id);
                ScoredElement::new(element, ScoreComponents::default(), ElementSource::Semantic)
            });
            entry.scores.semantic = score * weights.semantic_weight;
        }

        for (element, score) in pseudo {
            let id = element.id.clone();
            let entry = combined.entry(id.clone()).or_insert_with(|| {
                order.push(id);
                ScoredElement::new(element, ScoreComponents::default(), ElementSource::Semantic)
            });
            entry.scores.pseudocode = score * weights.pseudocode_weight;
        }

        let max_bm25 = keyword.iter().map(|(_, s)| *s).fold(0.0f64, f64::max);
        if max_bm25 > 0.0 {
            for (element, score) in keyword {
                let id = element.id.clone();
                let entry = combined.entry(id.clone()).or_insert_with(|| {
                    order.push(id);
                    ScoredElement::new(element, ScoreComponents::default(), ElementSource::Keyword)
                });
                entry.scores.keyword = (score / max_bm25) * weights.keyword_weight;
            }
        }

        let mut results: Vec<ScoredElement> = order
            .into_iter()
            .filter_map(|id| combined.remove(&id))
            .collect();
        sort_ranked(&mut results);
        results
    }

    /// Graph expansion: neighbors of the top 10 join with
    /// `parent_total * 0.5 * graph_weight`. Originals always survive.
    pub fn expand_with_graph(&self, results: Vec<ScoredElement>) -> Vec<ScoredElement> {
        if results.is_empty() || self.graph.is_empty() {
            return results;
        }
        let mut seen: HashMap<String, usize> = results
            .iter()
            .enumerate()
            .map(|(i, r)| (r.element.id.clone(), i))
            .collect();
        let mut expanded = results.clone();

        for parent in results.iter().take(GRAPH_EXPAND_TOP) {
            let neighbors = self.graph.neighbors(&parent.element.id, GRAPH_MAX_HOPS);
            for neighbor_id in neighbors {
                if seen.contains_key(&neighbor_id) {
                    continue;
                }
                let Some(element) = self.lexical.get_by_id(&neighbor_id) else {
                    continue;
                };
                let graph_score =
                    parent.total_score() * 0.5 * self.config.retrieval.graph_weight;
                let scored = ScoredElement::new(
                    element.clone(),
                    ScoreComponents { graph: graph_score, ..Default::default() },
                    ElementSource::Graph,
                );
                seen.insert(neighbor_id, expanded.len());
                expanded.push(scored);
            }
        }

        sort_ranked(&mut expanded);
        expanded
    }

    fn diversify(&self, mut results: Vec<ScoredElement>) -> Vec<ScoredElement> {
        let penalty = self.config.retrieval.diversity_penalty;
        if results.is_empty() || penalty <= 0.0 {
            return results;
        }
        let mut seen_files: Vec<(String, String)> = Vec::new();
        for r in results.iter_mut() {
            let key = (r.element.repo_name.clone(), r.element.relative_path.clone());
            if seen_files.contains(&key) {
                r.scores.scale(1.0 - penalty);
            } else {
                seen_files.push(key);
            }
        }
        sort_ranked(&mut results);
        results
    }

    // -----------------------------------------------------------------------
    // LLM file selection (retrieval-stage sibling of the agent's selection)
    // -----------------------------------------------------------------------

    fn boost_llm_selected_files(
        &self,
        query: &str,
        results: Vec<ScoredElement>,
        repo_filter: &[String],
        model: &dyn ChatModel,
    ) -> Vec<ScoredElement> {
        let overview_text: Vec<String> = repo_filter
            .iter()
            .filter_map(|name| self.overviews.get(name))
            .map(|ov| format!("## {}\n{}\n{}", ov.repo_name, ov.summary, ov.structure_text))
            .collect();
        if overview_text.is_empty() {
            return results;
        }

        let prompt = format!(
            "Select up to {max} files most likely to answer the question.\n\
             Question: {query}\n\n{overviews}\n\n\
             Respond with strict JSON only:\n\
             {{\"selected_files\": [{{\"repo_name\": \"...\", \"file_path\": \"...\"}}]}}",
            max = self.config.retrieval.max_files_to_search,
            overviews = overview_text.join("\n\n"),
        );
        let response = match model.complete(&ChatRequest::new(prompt).with_max_tokens(2000)) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("file selection call failed: {e}");
                return results;
            }
        };
        let Ok(value) = robust_parse(&response) else {
            return results;
        };

        let mut boosted: Vec<ScoredElement> = Vec::new();
        let mut seen: Vec<String> = Vec::new();
        if let Some(files) = value.get("selected_files").and_then(|v| v.as_array()) {
            for entry in files.iter().take(self.config.retrieval.max_files_to_search) {
                let repo = entry.get("repo_name").and_then(|v| v.as_str()).unwrap_or("");
                let path = entry.get("file_path").and_then(|v| v.as_str()).unwrap_or("");
                if repo.is_empty() || path.is_empty() {
                    continue;
                }
                // The model may hallucinate repo prefixes; resolve before use
                if !repo_filter.iter().any(|r| r == repo) {
                    continue;
                }
                let normalized = normalize_with_repo(path, repo);
                let Some(file_elem) = self
                    .lexical
                    .elements_for_file(repo, &normalized)
                    .into_iter()
                    .find(|e| e.element_type == ElementType::File)
                else {
                    continue;
                };

                if let Some(existing) = results.iter().find(|r| r.element.id == file_elem.id) {
                    let mut clone = existing.clone();
                    clone.scores.scale(LLM_SELECTED_BOOST);
                    clone.source = ElementSource::LlmSelected;
                    seen.push(clone.element.id.clone());
                    boosted.push(clone);
                } else {
                    let mut scored = ScoredElement::new(
                        file_elem.clone(),
                        ScoreComponents { semantic: 0.1, ..Default::default() },
                        ElementSource::LlmSelected,
                    );
                    scored.scores.scale(LLM_SELECTED_BOOST);
                    seen.push(scored.element.id.clone());
                    boosted.push(scored);
                }
            }
        }
        if boosted.is_empty() {
            return results;
        }

        for r in results {
            if !seen.contains(&r.element.id) {
                boosted.push(r);
            }
        }
        sort_ranked(&mut boosted);
        boosted
    }

    // -----------------------------------------------------------------------
    // Repository selection
    // -----------------------------------------------------------------------

    /// Narrow a multi-repo scope to the repos most likely to hold the
    /// answer. Returns an empty vec when selection cannot decide (the
    /// caller keeps its scope).
    pub fn select_repositories(
        &self,
        query: &str,
        scope: &[String],
        chat: Option<&dyn ChatModel>,
    ) -> Result<Vec<String>> {
        if self.overviews.is_empty() {
            return Ok(Vec::new());
        }

        if self.config.retrieval.repo_selection_method == RepoSelectionMethod::Llm {
            if let Some(model) = chat {
                match self.select_repositories_llm(query, scope, model) {
                    Ok(selected) if !selected.is_empty() => return Ok(selected),
                    Ok(_) => tracing::info!("llm repo selection empty, falling back to embedding"),
                    Err(e) => {
                        tracing::warn!("llm repo selection failed ({e}), falling back to embedding")
                    }
                }
            }
        }

        self.select_repositories_embedding(query, scope)
    }

    fn select_repositories_embedding(&self, query: &str, scope: &[String]) -> Result<Vec<String>> {
        let hits = self.overviews.search_overviews(
            self.embedder.as_ref(),
            query,
            self.overviews.len(),
            0.0,
        )?;
        let min_total = self.config.retrieval.min_repo_similarity;

        let selected: Vec<String> = hits
            .into_iter()
            .filter(|h| scope.iter().any(|r| r == &h.repo_name))
            .filter(|h| h.blended >= min_total || h.semantic >= 0.4 || h.lexical_norm >= 0.95)
            .take(self.config.retrieval.top_repos_to_search)
            .map(|h| h.repo_name)
            .collect();
        Ok(selected)
    }

    fn select_repositories_llm(
        &self,
        query: &str,
        scope: &[String],
        model: &dyn ChatModel,
    ) -> Result<Vec<String>> {
        let overview_text: Vec<String> = scope
            .iter()
            .filter_map(|name| self.overviews.get(name))
            .map(|ov| format!("- {}: {}", ov.repo_name, ov.summary))
            .collect();

        let prompt = format!(
            "Question: {query}\n\nRepositories:\n{}\n\n\
             Which repositories must be searched to answer the question?\n\
             Respond with strict JSON only: {{\"selected_repos\": [\"name\", ...]}}",
            overview_text.join("\n"),
        );
        let response = model.complete(&ChatRequest::new(prompt).with_max_tokens(1000))?;
        let value = robust_parse(&response)?;

        let mut selected = Vec::new();
        if let Some(names) = value.get("selected_repos").and_then(|v| v.as_array()) {
            for name in names.iter().filter_map(|v| v.as_str()) {
                if let Some(resolved) = match_repo_name(name, scope) {
                    if !selected.contains(&resolved) {
                        selected.push(resolved);
                    }
                }
            }
        }
        selected.truncate(self.config.retrieval.top_repos_to_search);
        Ok(selected)
    }
}

// ---------------------------------------------------------------------------
// Free helpers (shared with the agent)
// ---------------------------------------------------------------------------

/// Uniform type-bias re-rank: every component is scaled so the sum invariant
/// holds and partial scores stay comparable.
pub fn rerank_by_type(mut results: Vec<ScoredElement>) -> Vec<ScoredElement> {
    for r in results.iter_mut() {
        r.scores.scale(r.element.element_type.rank_bias());
    }
    sort_ranked(&mut results);
    results
}

pub fn apply_filters(results: Vec<ScoredElement>, filters: &QueryFilters) -> Vec<ScoredElement> {
    if filters.is_empty() {
        return results;
    }
    results
        .into_iter()
        .filter(|r| {
            let e = &r.element;
            if let Some(lang) = &filters.language {
                if &e.language != lang {
                    return false;
                }
            }
            if let Some(t) = &filters.element_type {
                if e.element_type.as_str() != t {
                    return false;
                }
            }
            if let Some(ext) = &filters.extension {
                if !e.relative_path.ends_with(ext.as_str()) {
                    return false;
                }
            }
            if let Some(frag) = &filters.path_contains {
                if !e.relative_path.contains(frag.as_str()) {
                    return false;
                }
            }
            true
        })
        .collect()
}

/// The final safety pass: anything outside the allowed repos is dropped and
/// logged, whatever tier produced it.
pub fn final_repo_filter(results: Vec<ScoredElement>, repo_filter: &[String]) -> Vec<ScoredElement> {
    if repo_filter.is_empty() {
        return results;
    }
    let (kept, dropped): (Vec<_>, Vec<_>) = results
        .into_iter()
        .partition(|r| repo_filter.iter().any(|repo| repo == &r.element.repo_name));
    for r in &dropped {
        tracing::warn!(
            "filtered element from unexpected repo '{}' (allowed: {repo_filter:?})",
            r.element.repo_name
        );
    }
    kept
}

/// Resolve a (possibly hallucinated) repo name against known repos:
/// exact match, then substring, then Jaccard over alphanumeric tokens.
pub fn match_repo_name(candidate: &str, known: &[String]) -> Option<String> {
    let cand = candidate.trim();
    if cand.is_empty() {
        return None;
    }
    if let Some(exact) = known.iter().find(|r| r.eq_ignore_ascii_case(cand)) {
        return Some(exact.clone());
    }
    let cand_lower = cand.to_lowercase();
    if let Some(sub) = known.iter().find(|r| {
        let r_lower = r.to_lowercase();
        r_lower.contains(&cand_lower) || cand_lower.contains(&r_lower)
    }) {
        return Some(sub.clone());
    }

    fn tokens(s: &str) -> Vec<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
    }
    let cand_tokens = tokens(cand);
    if cand_tokens.is_empty() {
        return None;
    }
    let mut best: Option<(f64, &String)> = None;
    for repo in known {
        let repo_tokens = tokens(repo);
        if repo_tokens.is_empty() {
            continue;
        }
        let inter = cand_tokens.iter().filter(|t| repo_tokens.contains(t)).count();
        let union = {
            let mut all = repo_tokens.clone();
            for t in &cand_tokens {
                if !all.contains(t) {
                    all.push(t.clone());
                }
            }
            all.len()
        };
        let jaccard = inter as f64 / union as f64;
        if jaccard >= 0.5 && best.map(|(s, _)| jaccard > s).unwrap_or(true) {
            best = Some((jaccard, repo));
        }
    }
    best.map(|(_, r)| r.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn element(repo: &str, path: &str, t: ElementType, name: &str) -> CodeElement {
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
            end_line: 20,
            code: String::new(),
            metadata: serde_json::Map::new(),
            embedding: None,
        }
    }

    fn scored(repo: &str, path: &str, t: ElementType, name: &str, semantic: f64) -> ScoredElement {
        ScoredElement::new(
            element(repo, path, t, name),
            ScoreComponents { semantic, ..Default::default() },
            ElementSource::Semantic,
        )
    }

    #[test]
    fn test_rerank_scales_components_uniformly() {
        let results = vec![
            scored("r", "a.py", ElementType::File, "", 1.0),
            scored("r", "b.py", ElementType::Function, "f", 1.0),
        ];
        let ranked = rerank_by_type(results);
        // Function bias (1.2) beats file bias (0.9) on equal raw scores
        assert_eq!(ranked[0].element.element_type, ElementType::Function);
        assert!((ranked[0].total_score() - 1.2).abs() < 1e-9);
        assert!((ranked[0].scores.semantic - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_sort_tiebreaks_deterministic() {
        let mut results = vec![
            scored("r", "z.py", ElementType::File, "", 0.5),
            scored("r", "a.py", ElementType::Function, "f", 0.5),
            scored("r", "b.py", ElementType::Function, "a_first", 0.5),
        ];
        sort_ranked(&mut results);
        assert_eq!(results[0].element.relative_path, "a.py");
        assert_eq!(results[1].element.relative_path, "b.py");
        assert_eq!(results[2].element.relative_path, "z.py");
    }

    #[test]
    fn test_apply_filters() {
        let mut rust_elem = scored("r", "src/x.rs", ElementType::Function, "f", 1.0);
        rust_elem.element.language = "rust".into();
        let results = vec![rust_elem, scored("r", "src/y.py", ElementType::Function, "g", 1.0)];

        let f = QueryFilters { language: Some("python".into()), ..Default::default() };
        let filtered = apply_filters(results.clone(), &f);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].element.relative_path, "src/y.py");

        let f = QueryFilters { extension: Some(".rs".into()), ..Default::default() };
        let filtered = apply_filters(results, &f);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].element.relative_path, "src/x.rs");
    }

    #[test]
    fn test_final_repo_filter_drops_strays() {
        let results = vec![
            scored("allowed", "a.py", ElementType::File, "", 1.0),
            scored("stray", "b.py", ElementType::File, "", 2.0),
        ];
        let kept = final_repo_filter(results, &["allowed".to_string()]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].element.repo_name, "allowed");
    }

    #[test]
    fn test_match_repo_name_strategies() {
        let known = vec!["http-client".to_string(), "DataPipeline".to_string()];
        // Exact (case-insensitive)
        assert_eq!(match_repo_name("datapipeline", &known).as_deref(), Some("DataPipeline"));
        // Substring
        assert_eq!(match_repo_name("client", &known).as_deref(), Some("http-client"));
        // Jaccard on tokens: {"ftp","cli"} vs {"http","client"} = 0 -> None
        assert_eq!(match_repo_name("ftp cli", &known), None);
        // Jaccard: {"the","http","client"} vs {"http","client"} = 2/3 >= 0.5
        assert_eq!(match_repo_name("the http client", &known).as_deref(), Some("http-client"));
        assert_eq!(match_repo_name("", &known), None);
    }

    #[test]
    fn test_diversity_penalty_behavior() {
        let config = Config::default();
        let embedder: Arc<dyn Embedder> = Arc::new(crate::embed::HashingEmbedder::new(64));
        let retriever = HybridRetriever::new(config, embedder, PathBuf::from("/nonexistent"));

        let results = vec![
            scored("r", "same.py", ElementType::Function, "a", 1.0),
            scored("r", "same.py", ElementType::Function, "b", 0.9),
            scored("r", "other.py", ElementType::Function, "c", 0.85),
        ];
        let diversified = retriever.diversify(results);
        // Second hit from same.py was penalized by 10%: 0.9 -> 0.81 < 0.85
        let paths: Vec<&str> =
            diversified.iter().map(|r| r.element.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["same.py", "other.py", "same.py"]);
    }
}
