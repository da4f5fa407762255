//! Runtime configuration. Loaded from `codequery.toml` or defaults.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub retrieval: RetrievalConfig,
    pub agent: AgentConfig,
    pub vector_store: VectorStoreConfig,
    pub cache: CacheConfig,
    pub llm: LlmConfig,
    pub indexing: IndexingConfig,
}

impl Config {
    /// Parse a TOML config file.
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CoreError::Parse(format!("{}: {e}", path.display())))
    }

    /// Load `codequery.toml` from `dir` if present, otherwise defaults.
    pub fn load_or_default(dir: &Path) -> Config {
        let path = dir.join("codequery.toml");
        if path.exists() {
            match Config::load(&path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    tracing::warn!("ignoring invalid {}: {e}", path.display());
                }
            }
        }
        Config::default()
    }
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoSelectionMethod {
    Llm,
    Embedding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub semantic_weight: f64,
    pub keyword_weight: f64,
    pub graph_weight: f64,
    pub pseudocode_weight: f64,
    pub max_results: usize,
    /// Minimum cosine similarity for element-level semantic hits.
    pub min_similarity: f64,
    /// Per-duplicate-file multiplicative penalty, in [0, 1).
    pub diversity_penalty: f64,
    pub enable_two_stage_retrieval: bool,
    pub select_repos_by_overview: bool,
    pub repo_selection_method: RepoSelectionMethod,
    pub top_repos_to_search: usize,
    pub min_repo_similarity: f64,
    pub max_files_to_search: usize,
    /// Master switch for the iterative agent.
    pub enable_agency_mode: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        RetrievalConfig {
            semantic_weight: 0.6,
            keyword_weight: 0.3,
            graph_weight: 0.1,
            pseudocode_weight: 0.4,
            max_results: 10,
            min_similarity: 0.0,
            diversity_penalty: 0.1,
            enable_two_stage_retrieval: true,
            select_repos_by_overview: true,
            repo_selection_method: RepoSelectionMethod::Embedding,
            top_repos_to_search: 3,
            min_repo_similarity: 0.15,
            max_files_to_search: 10,
            enable_agency_mode: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Iterative agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub iterative: IterativeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IterativeConfig {
    /// Base iteration cap before adaptive scaling clamps into [2, 6].
    pub max_iterations: u32,
    pub confidence_threshold: i32,
    pub min_confidence_gain: f64,
    /// Base line budget; adaptive scaling takes 60/80/100% of it.
    pub max_total_lines: usize,
    pub max_elements: usize,
    pub max_candidates_display: usize,
    pub temperature_agent: f32,
    pub max_tokens_agent: usize,
    /// When true, a Round-1 confidence >= 95 returns the Round-1 retrieval
    /// immediately instead of iterating.
    pub allow_direct_answer: bool,
}

impl Default for IterativeConfig {
    fn default() -> Self {
        IterativeConfig {
            max_iterations: 4,
            confidence_threshold: 95,
            min_confidence_gain: 5.0,
            max_total_lines: 12_000,
            max_elements: 100,
            max_candidates_display: 100,
            temperature_agent: 0.2,
            max_tokens_agent: 6000,
            allow_direct_answer: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Vector store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub distance_metric: String,
    pub index_type: String,
    /// HNSW-style tuning hints; the exact scan accepts and records them.
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub in_memory: bool,
    pub persist_directory: PathBuf,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        VectorStoreConfig {
            distance_metric: "cosine".into(),
            index_type: "flat".into(),
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            in_memory: false,
            persist_directory: PathBuf::from(".codequery/index"),
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Disk,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub backend: CacheBackend,
    /// Seconds.
    pub ttl: u64,
    pub max_size_mb: u64,
    pub cache_embeddings: bool,
    pub cache_queries: bool,
    pub dialogue_ttl: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: false,
            backend: CacheBackend::Disk,
            ttl: 3600,
            max_size_mb: 500,
            cache_embeddings: true,
            cache_queries: true,
            dialogue_ttl: 86_400,
        }
    }
}

// ---------------------------------------------------------------------------
// LLM client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_base: String,
    /// Name of the environment variable holding the API key. The key itself
    /// never lives in config files.
    pub api_key_env: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<usize>,
    pub timeout_secs: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            api_base: "https://api.openai.com/v1".into(),
            api_key_env: "CODEQUERY_API_KEY".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.2,
            max_tokens: None,
            timeout_secs: 120,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Indexing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Functions longer than this are silently omitted from the element set.
    pub max_function_lines: usize,
    /// Element code bodies are truncated at this many characters.
    pub max_code_chars: usize,
    /// Embedding dimensionality for the built-in hashing embedder.
    pub embedding_dim: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        IndexingConfig { max_function_lines: 500, max_code_chars: 8000, embedding_dim: 256 }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert!((cfg.retrieval.semantic_weight - 0.6).abs() < 1e-9);
        assert!((cfg.retrieval.keyword_weight - 0.3).abs() < 1e-9);
        assert!((cfg.retrieval.graph_weight - 0.1).abs() < 1e-9);
        assert_eq!(cfg.agent.iterative.confidence_threshold, 95);
        assert_eq!(cfg.agent.iterative.max_total_lines, 12_000);
        assert_eq!(cfg.vector_store.distance_metric, "cosine");
        assert!(!cfg.agent.iterative.allow_direct_answer);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_src = r#"
[retrieval]
max_results = 25
repo_selection_method = "llm"

[agent.iterative]
max_iterations = 6
max_total_lines = 500

[cache]
enabled = true
backend = "redis"
"#;
        let cfg: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.retrieval.max_results, 25);
        assert_eq!(cfg.retrieval.repo_selection_method, RepoSelectionMethod::Llm);
        assert_eq!(cfg.agent.iterative.max_iterations, 6);
        assert_eq!(cfg.agent.iterative.max_total_lines, 500);
        assert_eq!(cfg.cache.backend, CacheBackend::Redis);
        // Untouched sections keep defaults
        assert!((cfg.retrieval.diversity_penalty - 0.1).abs() < 1e-9);
    }
}
