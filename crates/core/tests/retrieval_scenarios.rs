//! End-to-end standard-retrieval scenarios: repository selection, scope
//! safety, boundary behaviors, and cross-process index persistence.

mod helpers;

use codequery_core::config::Config;
use codequery_core::engine::{Engine, RetrieveOptions};
use helpers::{standard_options, write_files, TestWorkspace};

fn httplib() -> &'static [(&'static str, &'static str)] {
    &[
        (
            "README.md",
            "# httplib\nHTTP client with retry on 5xx responses using exponential backoff.\n",
        ),
        (
            "src/client.py",
            "def send_with_retry(request, retries=3):\n    \"\"\"Retry the HTTP request on 5xx server errors with backoff.\"\"\"\n    for attempt in range(retries):\n        response = send(request)\n        if response.status < 500:\n            return response\n        backoff(attempt)\n    return response\n\n\ndef backoff(attempt):\n    sleep(2 ** attempt)\n",
        ),
    ]
}

fn mathlib() -> &'static [(&'static str, &'static str)] {
    &[(
        "src/matrix.py",
        "def multiply(a, b):\n    \"\"\"Dense matrix multiplication.\"\"\"\n    return [[sum(x * y for x, y in zip(row, col)) for col in zip(*b)] for row in a]\n",
    )]
}

fn textlib() -> &'static [(&'static str, &'static str)] {
    &[(
        "src/tokenizer.py",
        "def split_words(text):\n    \"\"\"Whitespace word splitter.\"\"\"\n    return text.split()\n",
    )]
}

// ---------------------------------------------------------------------------
// Scenario: multi-repo overview selection narrows to one repo
// ---------------------------------------------------------------------------

#[test]
fn test_overview_selection_narrows_scope() {
    let mut ws = TestWorkspace::new(
        &[("httplib", httplib()), ("mathlib", mathlib()), ("textlib", textlib())],
        vec![],
        |config| {
            config.retrieval.top_repos_to_search = 1;
            config.retrieval.min_repo_similarity = 0.02;
        },
    );

    let (elements, metadata) =
        ws.engine.retrieve("How does the HTTP client retry on 5xx?", &standard_options());

    assert!(!elements.is_empty(), "expected results from the narrowed repo");
    for e in &elements {
        assert_eq!(e.element.repo_name, "httplib", "scope must narrow to httplib");
    }
    assert_eq!(metadata.repo_scope, vec!["httplib".to_string()]);
}

// ---------------------------------------------------------------------------
// Scenario: explicit repo_filter is always enforced
// ---------------------------------------------------------------------------

#[test]
fn test_repo_filter_enforced_end_to_end() {
    let mut ws = TestWorkspace::new(
        &[("httplib", httplib()), ("mathlib", mathlib())],
        vec![],
        |_| {},
    );

    let options = RetrieveOptions {
        use_agency: Some(false),
        repo_filter: Some(vec!["mathlib".into()]),
        ..Default::default()
    };
    let (elements, _) = ws.engine.retrieve("multiply matrices", &options);

    assert!(!elements.is_empty());
    for e in &elements {
        assert_eq!(e.element.repo_name, "mathlib");
    }
}

// ---------------------------------------------------------------------------
// Boundary: empty repository
// ---------------------------------------------------------------------------

#[test]
fn test_empty_repository_non_error() {
    let empty: &[(&str, &str)] = &[];
    let mut ws = TestWorkspace::new(&[("emptyrepo", empty)], vec![], |_| {});

    let (elements, metadata) = ws.engine.retrieve("anything at all", &standard_options());
    assert!(elements.is_empty());
    assert!(metadata.diagnostic.is_none(), "empty repo is not an error");
}

// ---------------------------------------------------------------------------
// Invariants on returned elements
// ---------------------------------------------------------------------------

#[test]
fn test_result_invariants_hold() {
    let mut ws = TestWorkspace::new(&[("httplib", httplib())], vec![], |_| {});

    let (elements, _) = ws.engine.retrieve("retry with backoff", &standard_options());
    assert!(!elements.is_empty());

    for e in &elements {
        // Line sanity
        assert!(e.element.start_line >= 1);
        assert!(e.element.start_line <= e.element.end_line);
        // Component-sum invariant
        let sum = e.scores.semantic + e.scores.pseudocode + e.scores.keyword + e.scores.graph;
        assert!((e.total_score() - sum).abs() < 1e-9);
    }
    // No strict containment pair
    for a in &elements {
        for b in &elements {
            if a.element.id != b.element.id {
                assert!(!a.element.contains(&b.element));
            }
        }
    }
    // Total order: descending by score
    for pair in elements.windows(2) {
        assert!(pair[0].total_score() >= pair[1].total_score() - 1e-9);
    }
}

// ---------------------------------------------------------------------------
// Persistence: a fresh engine over the same index dir reproduces results
// ---------------------------------------------------------------------------

#[test]
fn test_fresh_engine_reproduces_results() {
    let tmp = tempfile::tempdir().unwrap();
    let repo_root = tmp.path().join("httplib");
    write_files(&repo_root, httplib());

    let mut config = Config::default();
    config.vector_store.persist_directory = tmp.path().join("index");
    config.retrieval.enable_agency_mode = false;

    let first_ids: Vec<String> = {
        let mut engine = Engine::new(config.clone()).unwrap();
        engine.index_repository("httplib", &repo_root).unwrap();
        let (elements, _) = engine.retrieve("retry on server errors", &RetrieveOptions::default());
        elements.iter().map(|e| e.element.id.clone()).collect()
    };
    assert!(!first_ids.is_empty());

    // New process, same disk state: no re-indexing.
    let mut engine = Engine::new(config).unwrap();
    let (elements, _) = engine.retrieve("retry on server errors", &RetrieveOptions::default());
    let second_ids: Vec<String> = elements.iter().map(|e| e.element.id.clone()).collect();

    assert_eq!(first_ids, second_ids);
}

// ---------------------------------------------------------------------------
// Query cache round trip
// ---------------------------------------------------------------------------

#[test]
fn test_query_cache_serves_identical_results() {
    let mut ws = TestWorkspace::new(&[("httplib", httplib())], vec![], |config| {
        config.cache.enabled = true;
    });

    let (first, _) = ws.engine.retrieve("retry with backoff", &standard_options());
    let (second, _) = ws.engine.retrieve("retry with backoff", &standard_options());

    let first_ids: Vec<&str> = first.iter().map(|e| e.element.id.as_str()).collect();
    let second_ids: Vec<&str> = second.iter().map(|e| e.element.id.as_str()).collect();
    assert_eq!(first_ids, second_ids);
}
