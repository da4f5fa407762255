//! Query processing — normalize a question before standard retrieval.
//!
//! Produces the rewritten semantic query, BM25 keywords, an optional
//! pseudocode hint, an intent from a closed set, and inferred filters. The
//! whole processor is bypassed when the iterative agent drives the query:
//! the agent's Round-1 enhancement supersedes every field here.

use crate::config::LlmConfig;
use crate::jsonfix::robust_parse;
use crate::llm::{ChatModel, ChatRequest};
use regex::Regex;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Intents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    How,
    What,
    Where,
    Debug,
    Explain,
    Find,
    Implement,
    General,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::How => "how",
            Intent::What => "what",
            Intent::Where => "where",
            Intent::Debug => "debug",
            Intent::Explain => "explain",
            Intent::Find => "find",
            Intent::Implement => "implement",
            Intent::General => "general",
        }
    }

    pub fn parse(s: &str) -> Option<Intent> {
        match s {
            "how" => Some(Intent::How),
            "what" => Some(Intent::What),
            "where" => Some(Intent::Where),
            "debug" => Some(Intent::Debug),
            "explain" => Some(Intent::Explain),
            "find" => Some(Intent::Find),
            "implement" => Some(Intent::Implement),
            "general" => Some(Intent::General),
            _ => None,
        }
    }
}

const INTENT_PATTERNS: &[(Intent, &[&str])] = &[
    (Intent::How, &["how", "implement", "create", "build", "make"]),
    (Intent::What, &["what", "is", "are", "does", "define", "purpose"]),
    (Intent::Where, &["where", "locate", "find", "which file"]),
    (Intent::Debug, &["error", "bug", "issue", "problem", "fix", "why not", "doesn't work"]),
    (Intent::Explain, &["explain", "describe", "tell me about", "understand"]),
    (Intent::Find, &["find", "search", "locate", "show me", "list"]),
    (Intent::Implement, &["implement", "write", "code", "develop", "algorithm"]),
];

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "be", "been", "being", "have", "has", "had", "do",
    "does", "did", "will", "would", "could", "should", "may", "might", "can", "this", "that",
    "these", "those", "i", "you", "he", "she", "it", "we", "they",
];

const CODE_VOCAB: &[&str] = &[
    "function", "method", "class", "module", "variable", "parameter", "return", "import",
    "export", "api", "endpoint", "route", "database", "query", "model", "schema", "table",
    "authentication", "auth", "login", "user", "session", "test", "unittest", "spec", "testing",
];

// ---------------------------------------------------------------------------
// Processed query
// ---------------------------------------------------------------------------

/// Language/extension/path constraints inferred from the question text.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_contains: Option<String>,
}

impl QueryFilters {
    pub fn is_empty(&self) -> bool {
        self.language.is_none()
            && self.extension.is_none()
            && self.element_type.is_none()
            && self.path_contains.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedQuery {
    pub original: String,
    pub intent: Intent,
    pub keywords: Vec<String>,
    pub filters: QueryFilters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewritten_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pseudocode: Option<String>,
    pub enhanced: bool,
}

impl ProcessedQuery {
    /// The text fed to semantic search.
    pub fn semantic_text(&self) -> &str {
        self.rewritten_query.as_deref().unwrap_or(&self.original)
    }

    /// The text fed to BM25.
    pub fn keyword_text(&self) -> String {
        if self.keywords.is_empty() {
            self.original.clone()
        } else {
            self.keywords.join(" ")
        }
    }

    /// Bare processing for a raw question, no heuristics applied (agency
    /// mode constructs these directly from the agent's enhancement).
    pub fn passthrough(question: &str) -> ProcessedQuery {
        ProcessedQuery {
            original: question.to_string(),
            intent: Intent::General,
            keywords: Vec::new(),
            filters: QueryFilters::default(),
            rewritten_query: None,
            pseudocode: None,
            enhanced: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

pub struct QueryProcessor {
    llm: LlmConfig,
}

impl QueryProcessor {
    pub fn new(llm: LlmConfig) -> Self {
        QueryProcessor { llm }
    }

    /// Heuristic processing; pass a chat model to additionally run the LLM
    /// enhancement (rewritten query + pseudocode + refined intent).
    pub fn process(&self, question: &str, chat: Option<&dyn ChatModel>) -> ProcessedQuery {
        let intent = detect_intent(question);
        let keywords = extract_keywords(question);
        let filters = extract_filters(question);

        let mut processed = ProcessedQuery {
            original: question.to_string(),
            intent,
            keywords,
            filters,
            rewritten_query: None,
            pseudocode: None,
            enhanced: false,
        };

        if let Some(model) = chat {
            match self.enhance(question, intent, model) {
                Ok(enhancement) => enhancement.apply(&mut processed),
                Err(e) => tracing::warn!("query enhancement failed, using heuristics only: {e}"),
            }
        }

        processed
    }

    fn enhance(
        &self,
        question: &str,
        intent: Intent,
        model: &dyn ChatModel,
    ) -> crate::error::Result<Enhancement> {
        let prompt = format!(
            "You rewrite code-search questions for retrieval.\n\
             Question: {question}\n\
             Detected intent: {intent}\n\n\
             Respond with strict JSON only:\n\
             {{\n  \"rewritten_query\": \"one-line English restatement\",\n  \
             \"pseudocode\": \"3-7 short lines, or null if not useful\",\n  \
             \"intent\": \"one of how|what|where|debug|explain|find|implement|general\"\n}}",
            intent = intent.as_str()
        );
        let response = model.complete(
            &ChatRequest::new(prompt)
                .with_temperature(self.llm.temperature)
                .with_max_tokens(2000),
        )?;
        let value = robust_parse(&response)?;

        Ok(Enhancement {
            rewritten_query: value
                .get("rewritten_query")
                .and_then(|v| v.as_str())
                .map(|s| s.lines().next().unwrap_or(s).trim().to_string())
                .filter(|s| !s.is_empty()),
            pseudocode: value
                .get("pseudocode")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty() && *s != "null")
                .map(normalize_pseudocode),
            intent: value
                .get("intent")
                .and_then(|v| v.as_str())
                .and_then(Intent::parse),
        })
    }
}

struct Enhancement {
    rewritten_query: Option<String>,
    pseudocode: Option<String>,
    intent: Option<Intent>,
}

impl Enhancement {
    fn apply(self, processed: &mut ProcessedQuery) {
        if self.rewritten_query.is_some() || self.pseudocode.is_some() {
            processed.enhanced = true;
        }
        if let Some(q) = self.rewritten_query {
            processed.rewritten_query = Some(q);
        }
        processed.pseudocode = self.pseudocode;
        if let Some(i) = self.intent {
            processed.intent = i;
        }
    }
}

/// Clamp a pseudocode hint to 3-7 lines; fewer than 3 meaningful lines means
/// the hint is dropped by the caller via empty string.
fn normalize_pseudocode(hint: &str) -> String {
    let lines: Vec<&str> = hint.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() < 3 {
        return String::new();
    }
    lines[..lines.len().min(7)].join("\n")
}

// ---------------------------------------------------------------------------
// Heuristics
// ---------------------------------------------------------------------------

pub fn detect_intent(question: &str) -> Intent {
    let lower = question.to_lowercase();
    let mut best = Intent::General;
    let mut best_score = 0usize;
    for (intent, patterns) in INTENT_PATTERNS {
        let score = patterns.iter().filter(|p| lower.contains(**p)).count();
        if score > best_score {
            best_score = score;
            best = *intent;
        }
    }
    best
}

/// Stopword-filtered keywords, code vocabulary first.
pub fn extract_keywords(question: &str) -> Vec<String> {
    let words: Vec<String> = question
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(w))
        .map(String::from)
        .collect();

    let mut prioritized: Vec<String> = Vec::new();
    let mut other: Vec<String> = Vec::new();
    for w in words {
        if prioritized.contains(&w) || other.contains(&w) {
            continue;
        }
        if CODE_VOCAB.contains(&w.as_str()) {
            prioritized.push(w);
        } else {
            other.push(w);
        }
    }
    prioritized.extend(other);
    prioritized
}

/// Language and extension filters from contextual phrases only — a bare
/// "python" token (which may be a repo name) never triggers a filter.
pub fn extract_filters(question: &str) -> QueryFilters {
    let lower = question.to_lowercase();
    let mut filters = QueryFilters::default();

    let ext_re = Regex::new(r"\*?\.(py|js|ts|java|go|cpp|c|rs|rb|php|cs)\b").unwrap();
    if let Some(cap) = ext_re.captures(&lower) {
        filters.extension = Some(format!(".{}", &cap[1]));
    }

    let language_contexts: &[(&str, &[&str])] = &[
        ("python", &[r"\bin\s+python\b", r"\bpython\s+(code|implementation|script|function|class|module)\b", r"\busing\s+python\b", r"\bwritten\s+in\s+python\b"]),
        ("javascript", &[r"\bin\s+javascript\b", r"\bjavascript\s+(code|implementation|function|class|module)\b", r"\busing\s+javascript\b", r"\bin\s+js\b"]),
        ("typescript", &[r"\bin\s+typescript\b", r"\btypescript\s+(code|implementation|function|class|module)\b", r"\busing\s+typescript\b"]),
        ("java", &[r"\bin\s+java\b", r"\bjava\s+(code|implementation|class|method)\b", r"\busing\s+java\b"]),
        ("go", &[r"\bin\s+go\b", r"\bgo\s+(code|implementation|function|package)\b", r"\busing\s+go\b", r"\bin\s+golang\b"]),
        ("cpp", &[r"\bin\s+c\+\+", r"\bc\+\+\s+(code|implementation|class|function)\b", r"\busing\s+c\+\+"]),
        ("rust", &[r"\bin\s+rust\b", r"\brust\s+(code|implementation|function|module)\b", r"\busing\s+rust\b"]),
    ];
    for (lang, patterns) in language_contexts {
        let hit = patterns.iter().any(|p| {
            Regex::new(p).map(|re| re.is_match(&lower)).unwrap_or(false)
        });
        if hit {
            filters.language = Some(lang.to_string());
            break;
        }
    }

    // Quoted strings that look like paths
    let path_re = Regex::new(r#"["']([A-Za-z0-9_/.\-]+/[A-Za-z0-9_.\-]+)["']"#).unwrap();
    if let Some(cap) = path_re.captures(question) {
        filters.path_contains = Some(cap[1].to_string());
    }

    filters
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedChat;

    #[test]
    fn test_intent_detection() {
        assert_eq!(detect_intent("How do I implement caching here?"), Intent::How);
        assert_eq!(detect_intent("Where can I locate the parser?"), Intent::Where);
        // "is" + "defined" pull the query toward the definition intent
        assert_eq!(detect_intent("Where is decode_header defined?"), Intent::What);
        assert_eq!(detect_intent("Why doesn't work the login, there is a bug"), Intent::Debug);
        assert_eq!(detect_intent("zzz qqq"), Intent::General);
    }

    #[test]
    fn test_keywords_prioritize_code_vocab() {
        let kw = extract_keywords("Where is the function that handles user session tokens?");
        // Code vocabulary floats to the front
        assert_eq!(kw[0], "function");
        assert!(kw.contains(&"session".to_string()));
        assert!(!kw.contains(&"the".to_string()));
    }

    #[test]
    fn test_filters_need_context() {
        let f = extract_filters("How is auth handled in Python code?");
        assert_eq!(f.language.as_deref(), Some("python"));

        // Bare token must NOT trigger: could be a repo called "python"
        let f = extract_filters("What does the python repo export?");
        assert_eq!(f.language, None);

        let f = extract_filters("search *.py for the parser");
        assert_eq!(f.extension.as_deref(), Some(".py"));
    }

    #[test]
    fn test_llm_enhancement_applied() {
        let chat = ScriptedChat::new(vec![
            r#"{"rewritten_query": "locate http retry logic", "pseudocode": "for attempt in retries:\n  send request\n  if 5xx: backoff\n  else: return", "intent": "where"}"#,
        ]);
        let p = QueryProcessor::new(LlmConfig::default());
        let q = p.process("how does the client retry?", Some(&chat));
        assert!(q.enhanced);
        assert_eq!(q.semantic_text(), "locate http retry logic");
        assert_eq!(q.intent, Intent::Where);
        assert!(q.pseudocode.as_deref().unwrap().lines().count() >= 3);
    }

    #[test]
    fn test_enhancement_failure_degrades() {
        let chat = ScriptedChat::new(vec!["utter nonsense"]);
        let p = QueryProcessor::new(LlmConfig::default());
        let q = p.process("where is decode_header", Some(&chat));
        assert!(!q.enhanced);
        assert_eq!(q.semantic_text(), "where is decode_header");
    }
}
