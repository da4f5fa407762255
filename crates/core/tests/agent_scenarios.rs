//! End-to-end iterative-agent scenarios with a scripted chat model.
//!
//! Each test freezes the LLM rounds, so assertions cover the real pipeline:
//! indexing, tool execution, selection, keep/drop filtering, budgets, and
//! stopping rules.

mod helpers;

use codequery_core::agent::CancelToken;
use codequery_core::engine::RetrieveOptions;
use codequery_core::types::{ElementType, StoppingReason};
use helpers::{agency_options, long_python_file, repo_a, TestWorkspace};

// ---------------------------------------------------------------------------
// Scenario: single-repo simple lookup
// ---------------------------------------------------------------------------

#[test]
fn test_simple_lookup_two_rounds() {
    let mut ws = TestWorkspace::new(
        &[("repoA", repo_a())],
        vec![
            r#"{"confidence": 60, "query_complexity": 20,
                "query_enhancement": {"refined_intent": "where",
                                      "rewritten_query": "locate the decode_header function definition",
                                      "selected_keywords": ["decode_header"],
                                      "pseudocode_hints": null},
                "tool_calls": [{"tool": "search_codebase",
                                "parameters": {"search_term": "def decode_header", "file_pattern": "**/*.py"}}]}"#,
            r#"{"selections": [{"file": "repoA/src/header.py", "class": null, "function": "decode_header"}]}"#,
            r#"{"keep_files": ["src/header.py:decode_header"], "confidence": 96, "reasoning": "definition located"}"#,
        ],
        |_| {},
    );

    let (elements, metadata) = ws.engine.retrieve("Where is function decode_header defined?", &agency_options());

    assert_eq!(elements.len(), 1, "expected exactly the selected function");
    let elem = &elements[0].element;
    assert_eq!(elem.element_type, ElementType::Function);
    assert_eq!(elem.name, "decode_header");
    assert_eq!(elem.relative_path, "src/header.py");
    assert!(elements[0].total_score() > 0.0);

    let iteration = metadata.iteration.expect("agency metadata");
    assert_eq!(iteration.rounds, 2);
    assert_eq!(iteration.stopping_reason, StoppingReason::ConfidenceThresholdReached);
    assert_eq!(ws.chat.remaining(), 0, "all scripted responses consumed");
}

// ---------------------------------------------------------------------------
// Scenario: containment dedup keeps the class, drops the method
// ---------------------------------------------------------------------------

#[test]
fn test_containment_dedup_prefers_class() {
    let mut ws = TestWorkspace::new(
        &[("repoA", repo_a())],
        vec![
            r#"{"confidence": 55, "query_complexity": 30,
                "query_enhancement": {"rewritten_query": "find the Cache class and its eviction"},
                "tool_calls": [{"tool": "search_codebase",
                                "parameters": {"search_term": "class Cache", "file_pattern": "**/*.py"}}]}"#,
            r#"{"selections": [{"file": "repoA/src/cache.py", "class": "Cache"},
                               {"file": "repoA/src/cache.py", "function": "evict"}]}"#,
            r#"{"keep_files": ["src/cache.py"], "confidence": 97}"#,
        ],
        |_| {},
    );

    let (elements, _) = ws.engine.retrieve("How does the cache evict entries?", &agency_options());

    let cache_elements: Vec<_> = elements
        .iter()
        .filter(|e| e.element.relative_path == "src/cache.py")
        .collect();
    assert_eq!(cache_elements.len(), 1, "contained method must be covered by its class");
    assert_eq!(cache_elements[0].element.element_type, ElementType::Class);
    assert_eq!(cache_elements[0].element.name, "Cache");

    // No pair may be in strict containment.
    for a in &elements {
        for b in &elements {
            if a.element.id != b.element.id {
                assert!(!a.element.contains(&b.element));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scenario: line-budget stop at round 2
// ---------------------------------------------------------------------------

#[test]
fn test_line_budget_stop() {
    let files: Vec<(String, String)> = (0..6)
        .map(|i| (format!("f{i}.py"), long_python_file(&format!("chunk {i}"), 150)))
        .collect();
    let file_refs: Vec<(&str, &str)> =
        files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();

    let selections = (0..6)
        .map(|i| format!(r#"{{"file": "repoBig/f{i}.py"}}"#))
        .collect::<Vec<_>>()
        .join(", ");

    let round1 = r#"{"confidence": 70, "query_complexity": 20,
        "tool_calls": [{"tool": "search_codebase", "parameters": {"search_term": "value_0"}}]}"#;
    let selection = format!(r#"{{"selections": [{selections}]}}"#);
    let round2 = r#"{"keep_files": [], "confidence": 72}"#;

    let mut ws = TestWorkspace::new(
        &[("repoBig", &file_refs)],
        vec![round1, selection.as_str(), round2],
        |config| {
            // query_complexity 20 takes 60% of this: a 500-line budget
            config.agent.iterative.max_total_lines = 834;
        },
    );

    let (elements, metadata) = ws.engine.retrieve("Explain the data layout", &agency_options());

    let iteration = metadata.iteration.expect("agency metadata");
    assert_eq!(iteration.adaptive.line_budget, 500);
    assert_eq!(iteration.stopping_reason, StoppingReason::LineBudgetExceeded);
    assert_eq!(iteration.rounds, 2);
    // Pruning keeps the minimum element count even against the budget.
    assert_eq!(elements.len(), 5);
}

// ---------------------------------------------------------------------------
// Scenario: diminishing returns — two low-ROI rounds, no round 4
// ---------------------------------------------------------------------------

#[test]
fn test_low_roi_stops_before_round_four() {
    let files: Vec<(String, String)> = vec![
        ("a0.py".into(), long_python_file("BATCH_A zero", 750)),
        ("a1.py".into(), long_python_file("BATCH_A one", 750)),
        ("b0.py".into(), long_python_file("BATCH_B zero", 750)),
        ("b1.py".into(), long_python_file("BATCH_B one", 750)),
    ];
    let file_refs: Vec<(&str, &str)> =
        files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();

    let mut ws = TestWorkspace::new(
        &[("repoRoi", &file_refs)],
        vec![
            r#"{"confidence": 70, "query_complexity": 20,
                "tool_calls": [{"tool": "search_codebase", "parameters": {"search_term": "BATCH_A"}}]}"#,
            r#"{"selections": [{"file": "repoRoi/a0.py"}, {"file": "repoRoi/a1.py"}]}"#,
            r#"{"keep_files": [], "confidence": 72,
                "tool_calls": [{"tool": "search_codebase", "parameters": {"search_term": "BATCH_B"}}]}"#,
            r#"{"keep_files": [], "confidence": 74}"#,
        ],
        |config| {
            config.agent.iterative.max_iterations = 6;
            config.agent.iterative.max_total_lines = 20_000;
        },
    );

    let (_, metadata) = ws.engine.retrieve("Describe every data batch in detail", &agency_options());

    let iteration = metadata.iteration.expect("agency metadata");
    assert_eq!(iteration.stopping_reason, StoppingReason::DiminishingReturns);
    assert_eq!(iteration.rounds, 3, "no round 4 despite max_iterations 6");
    assert_eq!(ws.chat.remaining(), 0);
    // The two iterative rounds each gained only +2 confidence.
    assert!(iteration.history.iter().skip(1).all(|h| h.confidence_gain <= 2.0));
}

// ---------------------------------------------------------------------------
// Scenario: tool-call dedup across rounds
// ---------------------------------------------------------------------------

#[test]
fn test_tool_call_dedup_across_rounds() {
    let mut ws = TestWorkspace::new(
        &[("repoA", repo_a())],
        vec![
            r#"{"confidence": 60, "query_complexity": 20,
                "tool_calls": [{"tool": "list_directory", "parameters": {"path": "repoA/src"}}]}"#,
            r#"{"selections": [{"file": "repoA/src/header.py"}]}"#,
            r#"{"keep_files": [], "confidence": 75,
                "tool_calls": [{"tool": "list_directory", "parameters": {"path": "src"}}]}"#,
            r#"{"keep_files": [], "confidence": 96}"#,
        ],
        |_| {},
    );

    let (_, metadata) = ws.engine.retrieve("What lives under src?", &agency_options());

    let iteration = metadata.iteration.expect("agency metadata");
    // "repoA/src" and "src" canonicalize to the same call; only one executed.
    assert_eq!(iteration.tool_calls, vec!["list_directory|repoA/src|false".to_string()]);
    let mut deduped = iteration.tool_calls.clone();
    deduped.dedup();
    assert_eq!(deduped.len(), iteration.tool_calls.len());
    assert_eq!(iteration.stopping_reason, StoppingReason::ConfidenceThresholdReached);
}

// ---------------------------------------------------------------------------
// Boundary: zero line budget
// ---------------------------------------------------------------------------

#[test]
fn test_zero_budget_returns_round_one_pruned() {
    let mut ws = TestWorkspace::new(
        &[("repoA", repo_a())],
        vec![
            r#"{"confidence": 50, "query_complexity": 20,
                "tool_calls": [{"tool": "search_codebase", "parameters": {"search_term": "def"}}]}"#,
            r#"{"selections": [{"file": "repoA/src/header.py"},
                               {"file": "repoA/src/cache.py"},
                               {"file": "repoA/src/client.py"}]}"#,
            r#"{"keep_files": [], "confidence": 55}"#,
        ],
        |config| {
            config.agent.iterative.max_total_lines = 0;
        },
    );

    let (elements, metadata) = ws.engine.retrieve("Tour the codebase", &agency_options());

    let iteration = metadata.iteration.expect("agency metadata");
    assert_eq!(iteration.stopping_reason, StoppingReason::LineBudgetExceeded);
    assert_eq!(iteration.rounds, 2);
    assert!(!elements.is_empty());
    assert!(elements.len() <= 5);
}

// ---------------------------------------------------------------------------
// Boundary: dialogue history reaches the Round-1 prompt
// ---------------------------------------------------------------------------

#[test]
fn test_dialogue_history_in_round_one_prompt() {
    let mut ws = TestWorkspace::new(
        &[("repoA", repo_a())],
        vec![
            r#"{"confidence": 60, "query_complexity": 20,
                "tool_calls": [{"tool": "search_codebase", "parameters": {"search_term": "decode_header"}}]}"#,
            r#"{"selections": [{"file": "repoA/src/header.py", "function": "decode_header"}]}"#,
            r#"{"keep_files": [], "confidence": 96}"#,
        ],
        |_| {},
    );

    let options = RetrieveOptions {
        use_agency: Some(true),
        dialogue_history: vec!["Earlier we discussed the decode_header function in repoA".into()],
        ..Default::default()
    };
    let (_, _) = ws.engine.retrieve("What does that function return?", &options);

    let prompts = ws.chat.prompts();
    assert!(!prompts.is_empty());
    assert!(
        prompts[0].contains("Earlier we discussed the decode_header function"),
        "round 1 prompt must carry the dialogue history"
    );
}

// ---------------------------------------------------------------------------
// Cancellation before the first LLM call
// ---------------------------------------------------------------------------

#[test]
fn test_cancellation_before_first_round() {
    let mut ws = TestWorkspace::new(&[("repoA", repo_a())], vec![], |_| {});

    let cancel = CancelToken::new();
    cancel.cancel();
    let options = RetrieveOptions {
        use_agency: Some(true),
        cancel: Some(cancel),
        ..Default::default()
    };
    let (elements, metadata) = ws.engine.retrieve("anything", &options);

    assert!(elements.is_empty());
    assert_eq!(metadata.stopping_reason, Some(StoppingReason::Cancelled));
    assert!(ws.chat.prompts().is_empty(), "no LLM call after cancellation");
}

// ---------------------------------------------------------------------------
// Determinism: identical inputs and frozen responses, identical output
// ---------------------------------------------------------------------------

#[test]
fn test_identical_runs_are_identical() {
    let script = [
        r#"{"confidence": 60, "query_complexity": 20,
            "query_enhancement": {"rewritten_query": "locate decode_header"},
            "tool_calls": [{"tool": "search_codebase", "parameters": {"search_term": "def decode_header"}}]}"#,
        r#"{"selections": [{"file": "repoA/src/header.py", "function": "decode_header"}]}"#,
        r#"{"keep_files": ["src/header.py"], "confidence": 96}"#,
    ];
    let mut responses = Vec::new();
    responses.extend_from_slice(&script);
    responses.extend_from_slice(&script);

    let mut ws = TestWorkspace::new(&[("repoA", repo_a())], responses, |_| {});

    let (first, _) = ws.engine.retrieve("Where is decode_header defined?", &agency_options());
    let (second, _) = ws.engine.retrieve("Where is decode_header defined?", &agency_options());

    let first_ids: Vec<&str> = first.iter().map(|e| e.element.id.as_str()).collect();
    let second_ids: Vec<&str> = second.iter().map(|e| e.element.id.as_str()).collect();
    assert_eq!(first_ids, second_ids);
}
