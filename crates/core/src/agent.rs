//! Iterative agent — rounds of assessment and retrieval under a confidence
//! target, a line budget, and a hard iteration cap.
//!
//! Round 1 sees only the question and the repository tree, proposes a query
//! enhancement plus tool calls, and selects elements at file/class/function
//! granularity. Rounds 2..N keep or drop elements, optionally explore with
//! more tool calls, and stop on any of the ordered stopping rules. The model
//! is untrusted: all of its output passes the tolerant JSON parser, and all
//! of its paths and names resolve against known entities before use.

use crate::config::Config;
use crate::jsonfix::robust_parse;
use crate::llm::{ChatModel, ChatRequest};
use crate::paths::{detect_repo_from_path, normalize_with_repo, resolve_repo_target, validate_and_normalize_glob};
use crate::query::{Intent, ProcessedQuery};
use crate::retriever::{final_repo_filter, rerank_by_type, sort_ranked, HybridRetriever};
use crate::scan::directory_tree;
use crate::tools::{looks_like_regex, AgentTools, SearchOptions};
use crate::types::{
    containment_cover, CodeElement, ElementSource, ElementType, Granularity, ScoreComponents,
    ScoredElement, StoppingReason,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const MAX_TOOL_CALLS_PER_ROUND: usize = 10;
const PRUNE_MIN_ELEMENTS: usize = 5;
const TREE_DEPTH: usize = 5;
/// Flat relevance carried by tool-discovered candidates, recorded in the
/// keyword slot so the component-sum invariant holds.
const TOOL_MATCH_RELEVANCE: f64 = 0.5;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation: checked before every LLM call and every round.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct AdaptiveParams {
    pub max_iterations: u32,
    pub confidence_threshold: i32,
    pub line_budget: usize,
    pub query_complexity: i32,
    pub repo_factor: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundMetrics {
    pub round: u32,
    pub confidence: i32,
    pub confidence_gain: f64,
    pub lines_added: i64,
    pub total_lines: usize,
    pub roi: f64,
    pub budget_usage_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationMetadata {
    pub query_id: String,
    pub rounds: u32,
    pub initial_confidence: i32,
    pub final_confidence: i32,
    pub history: Vec<RoundMetrics>,
    /// Canonical form of every executed tool call, in execution order.
    pub tool_calls: Vec<String>,
    pub adaptive: AdaptiveParams,
    pub stopping_reason: StoppingReason,
    pub efficiency: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

pub struct AgentOutcome {
    pub elements: Vec<ScoredElement>,
    pub metadata: IterationMetadata,
}

// ---------------------------------------------------------------------------
// Repo shape statistics (drive the repo-complexity factor)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RepoShape {
    pub total_files: usize,
    pub avg_file_lines: f64,
    pub max_depth: usize,
}

impl RepoShape {
    /// Repository complexity factor in [0.5, 2.0]: log-scaled file count,
    /// average file length against a 200-line baseline, directory depth
    /// against a depth-5 baseline, averaged.
    pub fn complexity_factor(&self) -> f64 {
        if self.total_files == 0 {
            return 1.0;
        }
        let file_factor = ((self.total_files as f64 + 1.0).log10() / 1000f64.log10())
            .clamp(0.3, 1.5);
        let size_factor = (self.avg_file_lines / 200.0).clamp(0.5, 2.0);
        let depth_factor = (self.max_depth as f64 / 5.0).clamp(0.7, 1.3);
        ((file_factor + size_factor + depth_factor) / 3.0).clamp(0.5, 2.0)
    }
}

// ---------------------------------------------------------------------------
// Parsed LLM round structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool: String,
    pub parameters: Value,
}

struct RoundOne {
    confidence: i32,
    query_complexity: i32,
    rewritten_query: Option<String>,
    keywords: Vec<String>,
    pseudocode: Option<String>,
    intent: Option<Intent>,
    tool_calls: Vec<ToolCall>,
}

struct RoundN {
    confidence: i32,
    keep_files: Vec<String>,
    tool_calls: Vec<ToolCall>,
}

fn parse_tool_calls(value: &Value) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    if let Some(list) = value.get("tool_calls").and_then(|v| v.as_array()) {
        for entry in list.iter().take(MAX_TOOL_CALLS_PER_ROUND) {
            let Some(tool) = entry.get("tool").and_then(|v| v.as_str()) else {
                continue;
            };
            let parameters = entry.get("parameters").cloned().unwrap_or(Value::Null);
            calls.push(ToolCall { tool: tool.to_string(), parameters });
        }
    }
    calls
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// The agent
// ---------------------------------------------------------------------------

pub struct IterativeAgent<'a> {
    config: &'a Config,
    retriever: &'a mut HybridRetriever,
    chat: &'a dyn ChatModel,
    tools: BTreeMap<String, AgentTools>,
    shape: RepoShape,
    cancel: CancelToken,

    // Adaptive parameters, set after Round 1.
    max_iterations: u32,
    confidence_threshold: i32,
    line_budget: usize,
    adaptive_query_complexity: i32,

    history: Vec<RoundMetrics>,
    /// Canonical forms of every executed tool call, across all rounds.
    executed_calls: Vec<String>,
}

impl<'a> IterativeAgent<'a> {
    pub fn new(
        config: &'a Config,
        retriever: &'a mut HybridRetriever,
        chat: &'a dyn ChatModel,
        repo_roots: BTreeMap<String, PathBuf>,
        shape: RepoShape,
        cancel: CancelToken,
    ) -> Self {
        let iterative = &config.agent.iterative;
        let tools = repo_roots
            .into_iter()
            .map(|(name, root)| (name, AgentTools::new(root)))
            .collect();
        IterativeAgent {
            max_iterations: iterative.max_iterations.clamp(2, 6),
            confidence_threshold: iterative.confidence_threshold,
            line_budget: iterative.max_total_lines,
            adaptive_query_complexity: 50,
            config,
            retriever,
            chat,
            tools,
            shape,
            cancel,
            history: Vec::new(),
            executed_calls: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Entry point
    // -----------------------------------------------------------------------

    pub fn run(
        &mut self,
        question: &str,
        dialogue_history: &[String],
        scope: &[String],
    ) -> crate::error::Result<AgentOutcome> {
        let query_id = uuid::Uuid::new_v4().to_string();
        self.retriever.ensure_filtered(scope)?;
        let scope: Vec<String> = self.retriever.active_repos().to_vec();

        if self.cancel.is_cancelled() {
            return Ok(self.finish(query_id, Vec::new(), 0, 0, StoppingReason::Cancelled, None));
        }

        // ---- Round 1 --------------------------------------------------------
        let round_one = self.round_one(question, dialogue_history, &scope);
        let initial_confidence = round_one.confidence;
        self.initialize_adaptive(round_one.query_complexity);

        let processed = self.build_processed_query(question, &round_one);
        let mut elements = self.round_one_retrieval(question, &round_one, &processed, &scope);
        self.record_round(1, initial_confidence, total_lines(&elements));

        if self.config.agent.iterative.allow_direct_answer && initial_confidence >= 95 {
            tracing::info!("round 1 confident ({initial_confidence}), answering directly");
            return Ok(self.finish(
                query_id,
                elements,
                initial_confidence,
                initial_confidence,
                StoppingReason::ConfidenceThresholdReached,
                None,
            ));
        }

        // ---- Rounds 2..N ----------------------------------------------------
        let mut confidence = initial_confidence;
        let mut round = 1u32;
        let reason;

        loop {
            if self.cancel.is_cancelled() {
                reason = StoppingReason::Cancelled;
                break;
            }
            round += 1;
            if round > self.max_iterations {
                reason = StoppingReason::MaxIterationsReached;
                break;
            }

            let parsed = self.round_n(question, round, &elements, &scope);
            confidence = parsed.confidence;

            // Keep/drop against the model's decisions, with the empty-set
            // fallback and budget pruning.
            elements = self.filter_by_keep_files(elements, &parsed.keep_files);
            self.record_round(round, confidence, total_lines(&elements));

            if let Some(stop) = self.check_stopping(round, confidence, &elements) {
                reason = stop;
                break;
            }

            // Execute this round's tool calls and merge the new candidates.
            if !parsed.tool_calls.is_empty() {
                let new_candidates =
                    self.execute_tool_calls(&parsed.tool_calls, &scope, &elements);
                if !new_candidates.is_empty() {
                    elements = self.merge_candidates(elements, new_candidates, &scope);
                }
            }
        }

        if total_lines(&elements) > self.line_budget {
            elements = self.smart_prune(elements);
        }

        Ok(self.finish(query_id, elements, initial_confidence, confidence, reason, None))
    }

    // -----------------------------------------------------------------------
    // Adaptive parameters
    // -----------------------------------------------------------------------

    fn initialize_adaptive(&mut self, query_complexity: i32) {
        self.adaptive_query_complexity = query_complexity;
        let iterative = &self.config.agent.iterative;
        let repo_factor = self.shape.complexity_factor();
        let complexity_score = (query_complexity as f64 / 100.0 + repo_factor) / 2.0;

        let scaled =
            (iterative.max_iterations as f64 * (0.7 + complexity_score * 0.6)) as i64;
        self.max_iterations = scaled.clamp(2, 6) as u32;

        self.confidence_threshold = if query_complexity >= 80 {
            iterative.confidence_threshold.saturating_sub(5).max(90)
        } else if query_complexity >= 60 {
            iterative.confidence_threshold.saturating_sub(3).max(92)
        } else {
            iterative.confidence_threshold
        };

        self.line_budget = if query_complexity <= 30 {
            (iterative.max_total_lines as f64 * 0.6) as usize
        } else if query_complexity <= 60 {
            (iterative.max_total_lines as f64 * 0.8) as usize
        } else {
            (iterative.max_total_lines as f64 * repo_factor) as usize
        };

        tracing::info!(
            "adaptive parameters: max_iterations={}, confidence_threshold={}, line_budget={}, \
             query_complexity={query_complexity}, repo_factor={repo_factor:.2}",
            self.max_iterations,
            self.confidence_threshold,
            self.line_budget,
        );
    }

    // -----------------------------------------------------------------------
    // Round 1
    // -----------------------------------------------------------------------

    fn round_one(&mut self, question: &str, dialogue_history: &[String], scope: &[String]) -> RoundOne {
        let prompt = self.build_round_one_prompt(question, dialogue_history, scope);
        let response = self.call_llm(&prompt);

        let fallback = RoundOne {
            confidence: 95,
            query_complexity: 50,
            rewritten_query: None,
            keywords: Vec::new(),
            pseudocode: None,
            intent: None,
            tool_calls: Vec::new(),
        };
        let Some(response) = response else {
            return fallback;
        };
        let Ok(value) = robust_parse(&response) else {
            tracing::warn!("round 1 response unparseable, using conservative default");
            return fallback;
        };

        let enhancement = value.get("query_enhancement").cloned().unwrap_or(Value::Null);
        RoundOne {
            confidence: value.get("confidence").and_then(|v| v.as_i64()).unwrap_or(50) as i32,
            query_complexity: value
                .get("query_complexity")
                .and_then(|v| v.as_i64())
                .unwrap_or(50)
                .clamp(0, 100) as i32,
            rewritten_query: enhancement
                .get("rewritten_query")
                .and_then(|v| v.as_str())
                .map(String::from)
                .filter(|s| !s.is_empty()),
            keywords: string_list(enhancement.get("selected_keywords")),
            pseudocode: enhancement
                .get("pseudocode_hints")
                .and_then(|v| v.as_str())
                .map(String::from)
                .filter(|s| !s.is_empty() && s != "null"),
            intent: enhancement
                .get("refined_intent")
                .and_then(|v| v.as_str())
                .and_then(Intent::parse),
            tool_calls: parse_tool_calls(&value),
        }
    }

    fn build_round_one_prompt(
        &self,
        question: &str,
        dialogue_history: &[String],
        scope: &[String],
    ) -> String {
        let mut trees = String::new();
        for repo in scope {
            if let Some(tools) = self.tools.get(repo) {
                trees.push_str(&format!(
                    "### {repo}\n{}\n",
                    directory_tree(tools.resolver().root(), TREE_DEPTH)
                ));
            }
        }

        let history_block = if dialogue_history.is_empty() {
            String::new()
        } else {
            format!("\nPrevious conversation summaries:\n{}\n", dialogue_history.join("\n"))
        };

        format!(
            "You are assessing a code question before reading any file.\n\
             Question: {question}\n{history_block}\n\
             Repository structure (depth-limited):\n{trees}\n\
             Estimate how well you could answer right now and plan exploration.\n\
             Respond with strict JSON only:\n\
             {{\n  \"confidence\": 0-100,\n  \"query_complexity\": 0-100,\n  \
             \"query_enhancement\": {{\n    \"refined_intent\": \"how|what|where|debug|explain|find|implement|general\",\n    \
             \"rewritten_query\": \"one-line English\",\n    \"selected_keywords\": [\"...\"],\n    \
             \"pseudocode_hints\": \"3-7 lines or null\"\n  }},\n  \
             \"tool_calls\": [\n    {{\"tool\": \"search_codebase\", \"parameters\": {{\"search_term\": \"...\", \"file_pattern\": \"**/*.py\"}}}},\n    \
             {{\"tool\": \"list_directory\", \"parameters\": {{\"path\": \"src\"}}}}\n  ]\n}}\n\
             At most {MAX_TOOL_CALLS_PER_ROUND} tool calls. reasoning may be included as a string field."
        )
    }

    fn build_processed_query(&self, question: &str, round: &RoundOne) -> ProcessedQuery {
        let mut processed = ProcessedQuery::passthrough(question);
        processed.rewritten_query = round.rewritten_query.clone();
        processed.keywords = round.keywords.clone();
        processed.pseudocode = round.pseudocode.clone();
        if let Some(intent) = round.intent {
            processed.intent = intent;
        }
        processed.enhanced = round.rewritten_query.is_some() || !round.keywords.is_empty();
        processed
    }

    /// Round-1 retrieval: standard hybrid retrieval plus the requested tool
    /// calls, merged, deduplicated, then element-granularity selection.
    fn round_one_retrieval(
        &mut self,
        question: &str,
        round: &RoundOne,
        processed: &ProcessedQuery,
        scope: &[String],
    ) -> Vec<ScoredElement> {
        let mut candidates = match self.retriever.first_stage(processed, scope) {
            Ok(c) => rerank_by_type(c),
            Err(e) => {
                tracing::warn!("round 1 standard retrieval failed: {e}");
                Vec::new()
            }
        };

        let tool_candidates = self.execute_tool_calls(&round.tool_calls, scope, &[]);
        for candidate in tool_candidates {
            if !candidates.iter().any(|c| c.element.id == candidate.element.id) {
                candidates.push(candidate);
            }
        }

        let mut merged = containment_cover(candidates);
        sort_ranked(&mut merged);
        merged.truncate(self.config.agent.iterative.max_candidates_display);

        let selected = self.select_elements(question, &merged, scope);
        let mut result = final_repo_filter(selected, scope);
        sort_ranked(&mut result);
        result.truncate(self.config.agent.iterative.max_elements);
        result
    }

    // -----------------------------------------------------------------------
    // Element-granularity selection
    // -----------------------------------------------------------------------

    /// Ask the model to pick specific files/classes/functions from the
    /// candidates. Selections resolve through the path resolver and the
    /// lexical corpus; anything unresolvable falls back to the file element.
    fn select_elements(
        &mut self,
        question: &str,
        candidates: &[ScoredElement],
        scope: &[String],
    ) -> Vec<ScoredElement> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let listing = self.format_candidates(candidates);
        let prompt = format!(
            "Question: {question}\n\nCandidate code elements:\n{listing}\n\
             Select the entries needed to answer the question. Prefer a specific\n\
             function when the question targets one behavior, a class when it\n\
             targets that class, a file only when broad context is required.\n\
             Respond with strict JSON only:\n\
             {{\"selections\": [{{\"file\": \"repo/path\", \"class\": \"NameOrNull\", \"function\": \"nameOrNull\"}}]}}"
        );

        let Some(response) = self.call_llm(&prompt) else {
            return candidates.to_vec();
        };
        let Ok(value) = robust_parse(&response) else {
            tracing::warn!("element selection unparseable, keeping merged candidates");
            return candidates.to_vec();
        };
        let Some(selections) = value.get("selections").and_then(|v| v.as_array()) else {
            return candidates.to_vec();
        };

        let mut selected: Vec<ScoredElement> = Vec::new();
        for sel in selections {
            let Some(file) = sel.get("file").and_then(|v| v.as_str()) else {
                continue;
            };
            let class = sel.get("class").and_then(|v| v.as_str()).filter(|s| !s.is_empty());
            let function = sel.get("function").and_then(|v| v.as_str()).filter(|s| !s.is_empty());
            let name = function.or(class);

            let Some((repo, rel_path)) = self.resolve_selection_path(file, scope) else {
                tracing::debug!("selection '{file}' does not resolve to a known repo, skipped");
                continue;
            };

            let base = candidates
                .iter()
                .find(|c| c.element.repo_name == repo && c.element.relative_path == rel_path);
            let scores = base.map(|b| b.scores).unwrap_or(ScoreComponents {
                keyword: TOOL_MATCH_RELEVANCE,
                ..Default::default()
            });

            let element = match name {
                Some(n) => self
                    .retriever
                    .lexical()
                    .find_named(&repo, &rel_path, n)
                    .cloned()
                    .or_else(|| self.file_element(&repo, &rel_path)),
                None => self.file_element(&repo, &rel_path),
            };
            let Some(element) = element else {
                continue;
            };
            if selected.iter().any(|s| s.element.id == element.id) {
                continue;
            }
            let mut scored = ScoredElement::new(element, scores, ElementSource::LlmSelected);
            scored.granularity = match (function, class) {
                (Some(_), _) => Granularity::Function,
                (None, Some(_)) => Granularity::Class,
                _ => Granularity::File,
            };
            selected.push(scored);
        }

        if selected.is_empty() {
            candidates.to_vec()
        } else {
            containment_cover(selected)
        }
    }

    fn resolve_selection_path(&self, path: &str, scope: &[String]) -> Option<(String, String)> {
        let repo = detect_repo_from_path(path, scope).or_else(|| {
            if scope.len() == 1 {
                Some(scope[0].clone())
            } else {
                None
            }
        })?;
        let rel = normalize_with_repo(path, &repo);
        Some((repo, rel))
    }

    /// File-level element from the corpus, or synthesized from disk when the
    /// file was never indexed (tool hits can surface such files).
    fn file_element(&self, repo: &str, rel_path: &str) -> Option<CodeElement> {
        if let Some(e) = self
            .retriever
            .lexical()
            .elements_for_file(repo, rel_path)
            .into_iter()
            .find(|e| e.element_type == ElementType::File)
        {
            return Some(e.clone());
        }

        let tools = self.tools.get(repo)?;
        let read = tools.read_file_content(rel_path, self.config.indexing.max_code_chars);
        if !read.success {
            return None;
        }
        let line_count = read.content.lines().count().max(1);
        Some(CodeElement {
            id: CodeElement::make_id(repo, rel_path, ElementType::File, "", 1),
            element_type: ElementType::File,
            repo_name: repo.to_string(),
            relative_path: rel_path.to_string(),
            language: rel_path
                .rsplit('.')
                .next()
                .and_then(crate::extract::language_for_extension)
                .unwrap_or("")
                .to_string(),
            name: String::new(),
            signature: None,
            docstring: None,
            summary: None,
            start_line: 1,
            end_line: line_count,
            code: read.content,
            metadata: serde_json::Map::new(),
            embedding: None,
        })
    }

    fn format_candidates(&self, candidates: &[ScoredElement]) -> String {
        let mut out = String::new();
        for (i, c) in candidates
            .iter()
            .take(self.config.agent.iterative.max_candidates_display)
            .enumerate()
        {
            let e = &c.element;
            out.push_str(&format!(
                "{}. {}/{} [{}] lines {}-{} score {:.3}\n",
                i + 1,
                e.repo_name,
                e.relative_path,
                e.element_type.as_str(),
                e.start_line,
                e.end_line,
                c.total_score(),
            ));
            for child in self
                .retriever
                .lexical()
                .elements_for_file(&e.repo_name, &e.relative_path)
            {
                match child.element_type {
                    ElementType::Class => {
                        out.push_str(&format!("     - class {}\n", child.name));
                    }
                    ElementType::Function => {
                        let sig = child.signature.as_deref().unwrap_or(&child.name);
                        out.push_str(&format!("     - {sig}\n"));
                    }
                    _ => {}
                }
            }
        }
        out
    }

    // -----------------------------------------------------------------------
    // Round N
    // -----------------------------------------------------------------------

    fn round_n(
        &mut self,
        question: &str,
        round: u32,
        elements: &[ScoredElement],
        scope: &[String],
    ) -> RoundN {
        let prompt = self.build_round_n_prompt(question, round, elements, scope);
        let response = self.call_llm(&prompt);

        // A dead or unparseable model stops iteration conservatively: high
        // confidence, keep everything, no more tool calls.
        let fallback = RoundN {
            confidence: self.confidence_threshold,
            keep_files: Vec::new(),
            tool_calls: Vec::new(),
        };
        let Some(response) = response else {
            return fallback;
        };
        let Ok(value) = robust_parse(&response) else {
            tracing::warn!("round {round} response unparseable, using conservative default");
            return fallback;
        };

        RoundN {
            confidence: value
                .get("confidence")
                .and_then(|v| v.as_i64())
                .unwrap_or(self.confidence_threshold as i64) as i32,
            keep_files: string_list(value.get("keep_files")),
            tool_calls: parse_tool_calls(&value),
        }
    }

    fn build_round_n_prompt(
        &self,
        question: &str,
        round: u32,
        elements: &[ScoredElement],
        scope: &[String],
    ) -> String {
        let mut listing = String::new();
        for e in elements.iter().take(self.config.agent.iterative.max_candidates_display) {
            let elem = &e.element;
            listing.push_str(&format!(
                "- {}/{}{} [{}] lines {}-{} ({} lines)\n",
                elem.repo_name,
                elem.relative_path,
                if elem.name.is_empty() { String::new() } else { format!(":{}", elem.name) },
                elem.element_type.as_str(),
                elem.start_line,
                elem.end_line,
                elem.line_count(),
            ));
        }

        let lines = total_lines(elements);
        let calls = self.format_tool_call_history();
        format!(
            "Round {round}. Question: {question}\n\n\
             Current evidence ({count} elements, {lines}/{budget} lines):\n{listing}\n\
             Prior tool calls (do not repeat):\n{calls}\n\
             Repositories in scope: {scope:?}\n\n\
             Decide what to keep and whether more exploration pays off.\n\
             Respond with strict JSON only:\n\
             {{\n  \"keep_files\": [\"path\", \"path:ClassName\", \"path:function_name\"],\n  \
             \"confidence\": 0-100,\n  \"reasoning\": \"...\",\n  \
             \"tool_calls\": []\n}}",
            count = elements.len(),
            budget = self.line_budget,
        )
    }

    fn format_tool_call_history(&self) -> String {
        if self.executed_calls.is_empty() {
            return "(none)\n".to_string();
        }
        let mut out = String::new();
        for call in &self.executed_calls {
            out.push_str(&format!("- {call}\n"));
        }
        out
    }

    /// Keep/drop filtering. A `keep` entry matches on `repo/path` substring;
    /// `path:Name` additionally requires the element name. An empty result
    /// against a non-empty input falls back to the pre-filter set (pruned to
    /// budget), so one malformed response cannot wipe the evidence.
    fn filter_by_keep_files(
        &self,
        elements: Vec<ScoredElement>,
        keep_files: &[String],
    ) -> Vec<ScoredElement> {
        if keep_files.is_empty() {
            if total_lines(&elements) > self.line_budget {
                return self.smart_prune(elements);
            }
            return elements;
        }

        let kept: Vec<ScoredElement> = elements
            .iter()
            .filter(|e| {
                let full_path = format!("{}/{}", e.element.repo_name, e.element.relative_path);
                keep_files.iter().any(|keep| match keep.split_once(':') {
                    Some((path, name)) => {
                        full_path.contains(path.trim()) && e.element.name == name.trim()
                    }
                    None => full_path.contains(keep.trim()),
                })
            })
            .cloned()
            .collect();

        let mut result = if kept.is_empty() && !elements.is_empty() {
            tracing::warn!(
                "keep_files matched nothing ({} entries), falling back to prior set",
                keep_files.len()
            );
            elements
        } else {
            kept
        };

        if total_lines(&result) > self.line_budget {
            result = self.smart_prune(result);
        }
        result
    }

    // -----------------------------------------------------------------------
    // Stopping rules (checked in order)
    // -----------------------------------------------------------------------

    fn check_stopping(
        &self,
        round: u32,
        confidence: i32,
        elements: &[ScoredElement],
    ) -> Option<StoppingReason> {
        if confidence >= self.confidence_threshold {
            tracing::info!("stopping: confidence {confidence} >= {}", self.confidence_threshold);
            return Some(StoppingReason::ConfidenceThresholdReached);
        }
        if round >= self.max_iterations {
            tracing::info!("stopping: reached max iterations {}", self.max_iterations);
            return Some(StoppingReason::MaxIterationsReached);
        }
        let lines = total_lines(elements);
        if lines >= self.line_budget {
            tracing::info!("stopping: line budget exceeded ({lines} >= {})", self.line_budget);
            return Some(StoppingReason::LineBudgetExceeded);
        }

        // Two consecutive low-performance rounds.
        if self.history.len() >= 3 {
            let current = &self.history[self.history.len() - 1];
            let previous = &self.history[self.history.len() - 2];
            if self.is_low_performance(current) && self.is_low_performance(previous) {
                tracing::info!(
                    "stopping: consecutive low-performance rounds (gains {:.1}, {:.1})",
                    previous.confidence_gain,
                    current.confidence_gain
                );
                return Some(StoppingReason::DiminishingReturns);
            }
        }

        // Confidence flatline across the last three rounds.
        if self.history.len() >= 3 {
            let last3 = &self.history[self.history.len() - 3..];
            let max = last3.iter().map(|h| h.confidence).max().unwrap_or(0);
            let min = last3.iter().map(|h| h.confidence).min().unwrap_or(0);
            if max - min < 2 {
                tracing::info!("stopping: confidence stagnation ({min}..{max})");
                return Some(StoppingReason::DiminishingReturns);
            }
        }

        // Cost-benefit: estimated lines to close the gap vs remaining budget.
        let gap = (self.confidence_threshold - confidence).max(0) as usize;
        let remaining = self.line_budget.saturating_sub(lines);
        let estimated_needed = gap * 100;
        if estimated_needed as f64 > remaining as f64 * 1.5 {
            let exploring = self
                .history
                .last()
                .map(|h| h.confidence_gain < 0.0)
                .unwrap_or(false);
            if exploring {
                tracing::info!("budget check relaxed after a confidence drop (exploration)");
            } else {
                tracing::info!(
                    "stopping: unlikely to close gap (need ~{estimated_needed} lines, have {remaining})"
                );
                return Some(StoppingReason::Other);
            }
        }

        None
    }

    fn is_low_performance(&self, metrics: &RoundMetrics) -> bool {
        if metrics.confidence_gain < -1.0 {
            return true;
        }
        let min_gain = self.config.agent.iterative.min_confidence_gain;
        metrics.confidence_gain < min_gain && metrics.roi < self.min_roi_threshold(metrics.confidence)
    }

    fn min_roi_threshold(&self, current_confidence: i32) -> f64 {
        let complexity_factor = if self.adaptive_query_complexity >= 80 {
            0.5
        } else if self.adaptive_query_complexity >= 60 {
            0.7
        } else {
            1.0
        };
        let confidence_factor = if current_confidence >= 85 {
            1.5
        } else if current_confidence >= 70 {
            1.0
        } else {
            0.8
        };
        2.0 * complexity_factor * confidence_factor
    }

    // -----------------------------------------------------------------------
    // Tool-call execution with canonical dedup
    // -----------------------------------------------------------------------

    /// Resolve each call to its canonical executed form and drop anything the
    /// history (or this batch) has already run, then execute the survivors.
    fn execute_tool_calls(
        &mut self,
        calls: &[ToolCall],
        scope: &[String],
        existing: &[ScoredElement],
    ) -> Vec<ScoredElement> {
        let mut candidates: Vec<ScoredElement> = Vec::new();

        for call in calls {
            let Some(resolved) = self.canonicalize_call(call, scope) else {
                tracing::debug!("tool call '{}' did not resolve, skipped", call.tool);
                continue;
            };
            let key = resolved.key().to_string();
            if self.executed_calls.contains(&key) {
                tracing::debug!("skipping duplicate tool call: {key}");
                continue;
            }
            self.executed_calls.push(key);

            let found = self.run_resolved_call(&resolved);
            for candidate in found {
                let duplicate = existing
                    .iter()
                    .chain(candidates.iter())
                    .any(|e| e.element.id == candidate.element.id);
                if !duplicate {
                    candidates.push(candidate);
                }
            }
        }
        candidates
    }

    fn canonicalize_call(&self, call: &ToolCall, scope: &[String]) -> Option<ResolvedCall> {
        match call.tool.as_str() {
            "search_codebase" => {
                let params = &call.parameters;
                let term = params.get("search_term").and_then(|v| v.as_str())?.to_string();
                if term.is_empty() {
                    return None;
                }
                let file_pattern = params
                    .get("file_pattern")
                    .and_then(|v| v.as_str())
                    .unwrap_or("*")
                    .to_string();
                let root_path = params
                    .get("root_path")
                    .and_then(|v| v.as_str())
                    .unwrap_or(".")
                    .to_string();
                let case_sensitive =
                    params.get("case_sensitive").and_then(|v| v.as_bool()).unwrap_or(false);
                let mut use_regex =
                    params.get("use_regex").and_then(|v| v.as_bool()).unwrap_or(false);
                if !use_regex && looks_like_regex(&term) {
                    tracing::debug!("auto-detected regex metacharacters in '{term}'");
                    use_regex = true;
                }

                // Target repos: an explicit repo prefix in root_path or the
                // file pattern wins; a single-repo scope always forces it.
                let mut targets: Vec<String> = Vec::new();
                let mut pattern = file_pattern.clone();
                let mut root = root_path.clone();
                if root != "." {
                    if let Some(repo) = detect_repo_from_path(&root, scope) {
                        root = normalize_with_repo(&root, &repo);
                        targets = vec![repo];
                    }
                }
                if targets.is_empty() && pattern != "*" {
                    for repo in scope {
                        let (targets_repo, normalized) =
                            validate_and_normalize_glob(&pattern, repo);
                        if targets_repo {
                            pattern = normalized;
                            targets = vec![repo.clone()];
                            break;
                        }
                    }
                }
                if targets.is_empty() {
                    targets = scope.to_vec();
                }

                let canonical_root = if targets.len() == 1 {
                    resolve_repo_target(&targets[0], &root)
                } else {
                    root.clone()
                };
                let key = format!(
                    "search_codebase|{}|{canonical_root}|{pattern}|{term}|{case_sensitive}|{use_regex}",
                    targets.join(",")
                );
                Some(ResolvedCall::Search {
                    key,
                    targets,
                    term,
                    pattern,
                    root,
                    case_sensitive,
                    use_regex,
                })
            }
            "list_directory" => {
                let path = call
                    .parameters
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or(".")
                    .to_string();
                let include_hidden = call
                    .parameters
                    .get("include_hidden")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);

                let (repo, rel) = match detect_repo_from_path(&path, scope) {
                    Some(repo) => {
                        let rel = normalize_with_repo(&path, &repo);
                        (repo, rel)
                    }
                    None if scope.len() == 1 => (scope[0].clone(), normalize_with_repo(&path, &scope[0])),
                    None => return None,
                };
                let key = format!(
                    "list_directory|{}|{include_hidden}",
                    resolve_repo_target(&repo, &rel)
                );
                Some(ResolvedCall::ListDir { key, repo, path: rel, include_hidden })
            }
            other => {
                tracing::debug!("unknown tool '{other}' requested by the model");
                None
            }
        }
    }

    fn run_resolved_call(&self, call: &ResolvedCall) -> Vec<ScoredElement> {
        match call {
            ResolvedCall::Search { targets, term, pattern, root, case_sensitive, use_regex, .. } => {
                let mut out = Vec::new();
                for repo in targets {
                    let Some(tools) = self.tools.get(repo) else {
                        continue;
                    };
                    let options = SearchOptions {
                        file_pattern: pattern.clone(),
                        root_path: root.clone(),
                        case_sensitive: *case_sensitive,
                        use_regex: *use_regex,
                        ..Default::default()
                    };
                    let result = tools.search_codebase(term, &options);
                    if !result.success {
                        tracing::debug!(
                            "search_codebase failed in '{repo}': {}",
                            result.error.as_deref().unwrap_or("unknown")
                        );
                        continue;
                    }
                    for hit in &result.results {
                        if let Some(candidate) = self.tool_candidate(repo, &hit.file) {
                            out.push(candidate);
                        }
                    }
                }
                out
            }
            ResolvedCall::ListDir { repo, path, include_hidden, .. } => {
                let Some(tools) = self.tools.get(repo) else {
                    return Vec::new();
                };
                let result = tools.list_directory(path, *include_hidden);
                if !result.success {
                    return Vec::new();
                }
                result
                    .contents
                    .iter()
                    .filter(|entry| entry.entry_type == "file")
                    .filter_map(|entry| self.tool_candidate(repo, &entry.path))
                    .collect()
            }
        }
    }

    fn tool_candidate(&self, repo: &str, rel_path: &str) -> Option<ScoredElement> {
        let normalized = normalize_with_repo(rel_path, repo);
        let element = self.file_element(repo, &normalized)?;
        Some(ScoredElement::new(
            element,
            ScoreComponents { keyword: TOOL_MATCH_RELEVANCE, ..Default::default() },
            ElementSource::Tool,
        ))
    }

    // -----------------------------------------------------------------------
    // Candidate merging (round N)
    // -----------------------------------------------------------------------

    /// Graph expansion runs once per new candidate set, always followed by
    /// containment dedup and the element-count cap.
    fn merge_candidates(
        &self,
        current: Vec<ScoredElement>,
        new_candidates: Vec<ScoredElement>,
        scope: &[String],
    ) -> Vec<ScoredElement> {
        let mut merged = current;
        for candidate in new_candidates {
            if !merged.iter().any(|e| e.element.id == candidate.element.id) {
                merged.push(candidate);
            }
        }
        let expanded = self.retriever.expand_with_graph(merged);
        let mut covered = containment_cover(expanded);
        covered = final_repo_filter(covered, scope);
        sort_ranked(&mut covered);
        covered.truncate(self.config.agent.iterative.max_elements);
        covered
    }

    // -----------------------------------------------------------------------
    // Smart pruning
    // -----------------------------------------------------------------------

    /// Budget-driven pruning by priority score; greedy accept under budget,
    /// always keeping the top element and at least five in total.
    fn smart_prune(&self, elements: Vec<ScoredElement>) -> Vec<ScoredElement> {
        if elements.is_empty() {
            return elements;
        }
        let max_total = elements
            .iter()
            .map(|e| e.total_score())
            .fold(0.0f64, f64::max)
            .max(1e-9);

        let mut scored: Vec<(f64, ScoredElement)> = elements
            .into_iter()
            .map(|e| (self.priority_score(&e, max_total), e))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.element.id.cmp(&b.1.element.id))
        });

        let mut selected: Vec<ScoredElement> = Vec::new();
        let mut lines = 0usize;
        for (_, element) in scored {
            let elem_lines = element.element.line_count();
            // Top element always survives; below the minimum count the
            // budget does not veto.
            if selected.len() < PRUNE_MIN_ELEMENTS || lines + elem_lines <= self.line_budget {
                lines += elem_lines;
                selected.push(element);
            } else {
                break;
            }
        }
        tracing::info!("smart pruning kept {} elements, {lines} lines", selected.len());
        selected
    }

    fn priority_score(&self, e: &ScoredElement, max_total: f64) -> f64 {
        let relevance = e.total_score() / max_total;

        let source_bonus = match e.source {
            ElementSource::Tool => 0.3,
            ElementSource::LlmSelected => 0.2,
            _ if e.scores.semantic >= 0.7 => 0.15,
            _ => 0.0,
        };
        let type_bonus = match e.element.element_type {
            ElementType::Function => 0.2,
            ElementType::Class => 0.15,
            _ => 0.0,
        };
        let lines = e.element.line_count();
        let size_score = if lines < 50 {
            0.8
        } else if lines <= 200 {
            1.0
        } else if lines <= 500 {
            0.7
        } else {
            0.5
        };
        let granularity_bonus = match e.granularity {
            Granularity::Class | Granularity::Function => 0.15,
            Granularity::File => 0.0,
        };

        relevance * 0.4 + source_bonus + type_bonus + size_score * 0.2 + granularity_bonus
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    fn call_llm(&self, prompt: &str) -> Option<String> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let iterative = &self.config.agent.iterative;
        let request = ChatRequest::new(prompt)
            .with_temperature(iterative.temperature_agent)
            .with_max_tokens(iterative.max_tokens_agent);
        match self.chat.complete(&request) {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::warn!("llm call failed: {e}");
                None
            }
        }
    }

    fn record_round(&mut self, round: u32, confidence: i32, lines: usize) {
        let (gain, lines_added) = match self.history.last() {
            Some(prev) => (
                confidence as f64 - prev.confidence as f64,
                lines as i64 - prev.total_lines as i64,
            ),
            None => (0.0, lines as i64),
        };
        let roi = if lines_added > 0 {
            gain / lines_added as f64 * 1000.0
        } else {
            0.0
        };
        let budget_usage_pct = if self.line_budget > 0 {
            lines as f64 / self.line_budget as f64 * 100.0
        } else {
            100.0
        };
        self.history.push(RoundMetrics {
            round,
            confidence,
            confidence_gain: gain,
            lines_added,
            total_lines: lines,
            roi,
            budget_usage_pct,
        });
    }

    fn finish(
        &mut self,
        query_id: String,
        mut elements: Vec<ScoredElement>,
        initial_confidence: i32,
        final_confidence: i32,
        stopping_reason: StoppingReason,
        diagnostic: Option<String>,
    ) -> AgentOutcome {
        sort_ranked(&mut elements);

        let lines = total_lines(&elements);
        let overall_gain = (final_confidence - initial_confidence) as f64;
        let overall_roi = if lines > 0 { overall_gain / lines as f64 * 1000.0 } else { 0.0 };
        let budget_used_pct = if self.line_budget > 0 {
            lines as f64 / self.line_budget as f64 * 100.0
        } else {
            0.0
        };
        let efficiency = rate_efficiency(overall_roi, budget_used_pct);

        let metadata = IterationMetadata {
            query_id,
            rounds: self.history.last().map(|h| h.round).unwrap_or(0),
            initial_confidence,
            final_confidence,
            history: self.history.clone(),
            tool_calls: self.executed_calls.clone(),
            adaptive: AdaptiveParams {
                max_iterations: self.max_iterations,
                confidence_threshold: self.confidence_threshold,
                line_budget: self.line_budget,
                query_complexity: self.adaptive_query_complexity,
                repo_factor: self.shape.complexity_factor(),
            },
            stopping_reason,
            efficiency,
            diagnostic,
        };
        AgentOutcome { elements, metadata }
    }
}

enum ResolvedCall {
    Search {
        key: String,
        targets: Vec<String>,
        term: String,
        pattern: String,
        root: String,
        case_sensitive: bool,
        use_regex: bool,
    },
    ListDir {
        key: String,
        repo: String,
        path: String,
        include_hidden: bool,
    },
}

impl ResolvedCall {
    fn key(&self) -> &str {
        match self {
            ResolvedCall::Search { key, .. } => key,
            ResolvedCall::ListDir { key, .. } => key,
        }
    }
}

pub fn total_lines(elements: &[ScoredElement]) -> usize {
    elements.iter().map(|e| e.element.line_count()).sum()
}

fn rate_efficiency(overall_roi: f64, budget_used_pct: f64) -> &'static str {
    if overall_roi >= 5.0 && budget_used_pct < 70.0 {
        "excellent"
    } else if overall_roi >= 3.0 && budget_used_pct < 85.0 {
        "good"
    } else if overall_roi >= 1.5 || budget_used_pct < 90.0 {
        "acceptable"
    } else {
        "inefficient"
    }
}
