//! Core data model: code elements, score components, ranked results.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Element types
// ---------------------------------------------------------------------------

/// Kind of indexed element. Repository overviews live in their own store and
/// are never returned as code results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    File,
    Class,
    Function,
    RepositoryOverview,
}

impl ElementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::File => "file",
            ElementType::Class => "class",
            ElementType::Function => "function",
            ElementType::RepositoryOverview => "repository_overview",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(ElementType::File),
            "class" => Some(ElementType::Class),
            "function" => Some(ElementType::Function),
            "repository_overview" => Some(ElementType::RepositoryOverview),
            _ => None,
        }
    }

    /// Containment priority: a file covers its classes, a class its methods.
    pub fn cover_priority(&self) -> u8 {
        match self {
            ElementType::File => 3,
            ElementType::Class => 2,
            ElementType::Function => 1,
            ElementType::RepositoryOverview => 0,
        }
    }

    /// Uniform re-rank multiplier applied to every score component so the
    /// partial scores stay comparable after biasing.
    pub fn rank_bias(&self) -> f64 {
        match self {
            ElementType::Function => 1.2,
            ElementType::Class => 1.1,
            ElementType::File => 0.9,
            ElementType::RepositoryOverview => 0.8,
        }
    }
}

/// Which granularity a returned element represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    File,
    Class,
    Function,
}

impl From<ElementType> for Granularity {
    fn from(t: ElementType) -> Self {
        match t {
            ElementType::Class => Granularity::Class,
            ElementType::Function => Granularity::Function,
            _ => Granularity::File,
        }
    }
}

// ---------------------------------------------------------------------------
// Code element
// ---------------------------------------------------------------------------

/// The atomic retrieval unit: one file, class or function plus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeElement {
    pub id: String,
    #[serde(rename = "type")]
    pub element_type: ElementType,
    pub repo_name: String,
    /// Slash-separated, relative to the repo root.
    pub relative_path: String,
    pub language: String,
    /// Empty for file-level elements.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    /// Raw source text, possibly truncated at `max_code_chars`.
    pub code: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Retained in memory during indexing only.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl CodeElement {
    /// Deterministic element id. File-level ids omit the name segment.
    pub fn make_id(
        repo_name: &str,
        relative_path: &str,
        element_type: ElementType,
        name: &str,
        start_line: usize,
    ) -> String {
        match element_type {
            ElementType::File => {
                format!("{repo_name}::{relative_path}::{}::{start_line}", element_type.as_str())
            }
            _ => format!(
                "{repo_name}::{relative_path}::{}::{name}::{start_line}",
                element_type.as_str()
            ),
        }
    }

    pub fn line_count(&self) -> usize {
        self.end_line.saturating_sub(self.start_line) + 1
    }

    /// Identity tuple used when an id is absent on the other side.
    pub fn identity(&self) -> (String, String, ElementType, String, usize, usize) {
        (
            self.repo_name.clone(),
            self.relative_path.clone(),
            self.element_type,
            self.name.clone(),
            self.start_line,
            self.end_line,
        )
    }

    /// `self` strictly contains `other`: same file, strictly wider range.
    pub fn contains(&self, other: &CodeElement) -> bool {
        self.repo_name == other.repo_name
            && self.relative_path == other.relative_path
            && self.start_line <= other.start_line
            && self.end_line >= other.end_line
            && (self.end_line - self.start_line) > (other.end_line - other.start_line)
    }

    /// Lightweight metadata map for index payloads (no code body).
    pub fn index_metadata(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut m = serde_json::Map::new();
        m.insert("id".into(), self.id.clone().into());
        m.insert("type".into(), self.element_type.as_str().into());
        m.insert("repo_name".into(), self.repo_name.clone().into());
        m.insert("relative_path".into(), self.relative_path.clone().into());
        m.insert("language".into(), self.language.clone().into());
        m.insert("name".into(), self.name.clone().into());
        m.insert("start_line".into(), (self.start_line as u64).into());
        m.insert("end_line".into(), (self.end_line as u64).into());
        if let Some(sig) = &self.signature {
            m.insert("signature".into(), sig.clone().into());
        }
        m
    }
}

// ---------------------------------------------------------------------------
// Scores
// ---------------------------------------------------------------------------

/// Individual score contributions, preserved for auditability.
/// `total()` is always the sum, so rescaling must touch every component.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub semantic: f64,
    pub pseudocode: f64,
    pub keyword: f64,
    pub graph: f64,
}

impl ScoreComponents {
    pub fn total(&self) -> f64 {
        self.semantic + self.pseudocode + self.keyword + self.graph
    }

    /// Multiply every component by the same factor (type bias, diversity
    /// penalty) so the sum invariant survives.
    pub fn scale(&mut self, factor: f64) {
        self.semantic *= factor;
        self.pseudocode *= factor;
        self.keyword *= factor;
        self.graph *= factor;
    }
}

/// Where a candidate entered the result set. Feeds the pruning source bonus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementSource {
    Semantic,
    Keyword,
    Graph,
    Tool,
    LlmSelected,
}

/// A ranked element with its score breakdown and provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredElement {
    #[serde(flatten)]
    pub element: CodeElement,
    pub scores: ScoreComponents,
    pub granularity: Granularity,
    pub source: ElementSource,
}

impl ScoredElement {
    pub fn new(element: CodeElement, scores: ScoreComponents, source: ElementSource) -> Self {
        let granularity = Granularity::from(element.element_type);
        ScoredElement { element, scores, granularity, source }
    }

    pub fn total_score(&self) -> f64 {
        self.scores.total()
    }
}

// ---------------------------------------------------------------------------
// Stopping reasons
// ---------------------------------------------------------------------------

/// Why the iterative agent stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppingReason {
    ConfidenceThresholdReached,
    MaxIterationsReached,
    LineBudgetExceeded,
    DiminishingReturns,
    Cancelled,
    Other,
}

impl StoppingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoppingReason::ConfidenceThresholdReached => "confidence_threshold_reached",
            StoppingReason::MaxIterationsReached => "max_iterations_reached",
            StoppingReason::LineBudgetExceeded => "line_budget_exceeded",
            StoppingReason::DiminishingReturns => "diminishing_returns",
            StoppingReason::Cancelled => "cancelled",
            StoppingReason::Other => "other",
        }
    }
}

// ---------------------------------------------------------------------------
// Containment-aware dedup
// ---------------------------------------------------------------------------

/// Reduce a candidate list to a containment cover: within each
/// `(repo, path)` group keep the element of higher cover priority and wider
/// range, dropping strictly contained children. Relative order of survivors
/// is preserved.
pub fn containment_cover(results: Vec<ScoredElement>) -> Vec<ScoredElement> {
    let mut kept: Vec<ScoredElement> = Vec::with_capacity(results.len());

    'outer: for candidate in results {
        let mut to_remove: Vec<usize> = Vec::new();
        for (i, existing) in kept.iter().enumerate() {
            if existing.element.id == candidate.element.id
                || existing.element.identity() == candidate.element.identity()
            {
                continue 'outer;
            }
            if existing.element.contains(&candidate.element) {
                continue 'outer;
            }
            if candidate.element.contains(&existing.element) {
                to_remove.push(i);
            }
        }
        for i in to_remove.into_iter().rev() {
            kept.remove(i);
        }
        kept.push(candidate);
    }

    kept
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn element(t: ElementType, name: &str, start: usize, end: usize) -> CodeElement {
        CodeElement {
            id: CodeElement::make_id("r", "src/cache.py", t, name, start),
            element_type: t,
            repo_name: "r".into(),
            relative_path: "src/cache.py".into(),
            language: "python".into(),
            name: name.into(),
            signature: None,
            docstring: None,
            summary: None,
            start_line: start,
            end_line: end,
            code: String::new(),
            metadata: serde_json::Map::new(),
            embedding: None,
        }
    }

    #[test]
    fn test_id_determinism() {
        let a = CodeElement::make_id("repo", "src/x.py", ElementType::Function, "f", 10);
        let b = CodeElement::make_id("repo", "src/x.py", ElementType::Function, "f", 10);
        assert_eq!(a, b);
        assert_eq!(a, "repo::src/x.py::function::f::10");

        let file_id = CodeElement::make_id("repo", "src/x.py", ElementType::File, "", 1);
        assert_eq!(file_id, "repo::src/x.py::file::1");
    }

    #[test]
    fn test_strict_containment() {
        let class = element(ElementType::Class, "Cache", 10, 200);
        let method = element(ElementType::Function, "evict", 40, 55);
        assert!(class.contains(&method));
        assert!(!method.contains(&class));
        // Equal ranges are not strict containment
        let twin = element(ElementType::Function, "evict2", 40, 55);
        assert!(!method.contains(&twin));
    }

    #[test]
    fn test_containment_cover_prefers_parent() {
        let class = ScoredElement::new(
            element(ElementType::Class, "Cache", 10, 200),
            ScoreComponents { semantic: 0.5, ..Default::default() },
            ElementSource::Semantic,
        );
        let method = ScoredElement::new(
            element(ElementType::Function, "evict", 40, 55),
            ScoreComponents { semantic: 0.9, ..Default::default() },
            ElementSource::Semantic,
        );
        let cover = containment_cover(vec![method, class]);
        assert_eq!(cover.len(), 1);
        assert_eq!(cover[0].element.name, "Cache");
    }

    #[test]
    fn test_scale_preserves_sum_invariant() {
        let mut s = ScoreComponents { semantic: 0.6, pseudocode: 0.2, keyword: 0.1, graph: 0.05 };
        let before = s.total();
        s.scale(1.2);
        assert!((s.total() - before * 1.2).abs() < 1e-9);
    }
}
