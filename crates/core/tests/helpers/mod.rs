//! Test harness for end-to-end retrieval scenarios.
//!
//! Builds an `Engine` over fixture repositories written into a TempDir and
//! drives it with a scripted chat model, so every LLM round is frozen and
//! runs are fully deterministic.

// Each test binary compiles this module separately and uses a subset of it.
#![allow(dead_code)]

use codequery_core::config::Config;
use codequery_core::engine::{Engine, RetrieveOptions};
use codequery_core::llm::ScriptedChat;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestWorkspace {
    pub engine: Engine,
    pub chat: Arc<ScriptedChat>,
    _temp_dir: TempDir,
}

impl TestWorkspace {
    /// Build a workspace from `(repo_name, [(path, content)])` fixtures,
    /// index every repo, and wire a scripted chat model.
    pub fn new(
        repos: &[(&str, &[(&str, &str)])],
        responses: Vec<&str>,
        tune: impl FnOnce(&mut Config),
    ) -> TestWorkspace {
        let temp_dir = TempDir::new().expect("temp dir");
        let mut config = Config::default();
        config.vector_store.persist_directory = temp_dir.path().join("index");
        config.retrieval.min_repo_similarity = 0.05;
        tune(&mut config);

        let chat = Arc::new(ScriptedChat::new(responses));
        let engine = Engine::new(config).expect("engine");
        let mut engine = engine.with_chat_model(chat.clone());

        for (name, files) in repos {
            let root = temp_dir.path().join(name);
            std::fs::create_dir_all(&root).expect("repo root");
            write_files(&root, files);
            engine.index_repository(name, &root).expect("index repo");
        }

        TestWorkspace { engine, chat, _temp_dir: temp_dir }
    }

    pub fn repo_root(&self, name: &str) -> PathBuf {
        self.engine.repo_root(name).expect("known repo").to_path_buf()
    }
}

pub fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(&path, content).expect("write fixture");
    }
}

/// A python file of `n` body lines, so fixtures can hit line budgets.
pub fn long_python_file(marker: &str, n: usize) -> String {
    let mut out = format!("# {marker}\n");
    for i in 0..n.saturating_sub(1) {
        out.push_str(&format!("value_{i} = {i}\n"));
    }
    out
}

pub fn agency_options() -> RetrieveOptions {
    RetrieveOptions { use_agency: Some(true), ..Default::default() }
}

pub fn standard_options() -> RetrieveOptions {
    RetrieveOptions { use_agency: Some(false), ..Default::default() }
}

/// The single-repo fixture used by most agent scenarios.
pub fn repo_a() -> &'static [(&'static str, &'static str)] {
    &[
        (
            "src/header.py",
            "def decode_header(data):\n    \"\"\"Decode a wire header.\"\"\"\n    return data[4:]\n\n\ndef encode_header(data):\n    return b\"\\x00\" * 4 + data\n",
        ),
        (
            "src/cache.py",
            "class Cache:\n    \"\"\"In-memory cache.\"\"\"\n\n    def __init__(self):\n        self.data = {}\n\n    def get(self, key):\n        return self.data.get(key)\n\n    def evict(self, key):\n        self.data.pop(key, None)\n",
        ),
        (
            "src/client.py",
            "import header\n\n\ndef send_request(payload):\n    return encode_payload(payload)\n\n\ndef encode_payload(payload):\n    return payload\n",
        ),
    ]
}
